use anyhow::{anyhow, Context};
use bt_host_driver::domain::models::{GapNotification, LifecycleState};
use bt_host_driver::domain::settings::{DriverSettings, SettingsService};
use bt_host_driver::infrastructure::logging::init_logger;
use bt_host_driver::{BluetoothContext, Driver};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const BRING_UP_TIMEOUT: Duration = Duration::from_secs(5);

/// Peer behaviour to play once the scan is running
type PeerScript = Box<dyn FnOnce()>;

/// Host build: the simulated controller answers the inquiry with a couple of
/// scripted peers.
#[cfg(not(feature = "platform-target"))]
fn build_context(settings: &DriverSettings) -> anyhow::Result<(BluetoothContext, PeerScript)> {
    use bt_host_driver::domain::models::{BdAddr, DiscoveredDevice};
    use bt_host_driver::infrastructure::bluetooth::hci::status;

    let (context, controller) = BluetoothContext::simulated(settings);
    let script = move || {
        let peers = [
            (0x0017E9_1A2B3C, 0x240404, -48, "Living Room Speaker"),
            (0x5C5A4B_00F1D2, 0x5A020C, -71, "Pixel 7"),
        ];
        for (address, class_of_device, rssi, name) in peers {
            controller.inject_inquiry_result(&DiscoveredDevice {
                address: BdAddr::from_u64(address),
                class_of_device,
                rssi: Some(rssi),
                name: Some(name.to_string()),
            });
        }
        controller.inject_inquiry_complete(status::SUCCESS);
    };
    Ok((context, Box::new(script)))
}

#[cfg(feature = "platform-target")]
fn build_context(settings: &DriverSettings) -> anyhow::Result<(BluetoothContext, PeerScript)> {
    let context = BluetoothContext::uart(settings)
        .with_context(|| format!("Opening {}", settings.transport.device_name))?;
    Ok((context, Box::new(|| {})))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new()?;
    let settings = settings_service.get().clone();
    let _log_guard = init_logger(&settings.log_settings)?;
    info!("Starting Bluetooth host driver");

    let (context, peer_script) = build_context(&settings)?;
    let (tx, mut notifications) = mpsc::unbounded_channel();
    let driver = Arc::new(Driver::new(context, &settings.gap, tx));
    driver.register_error_callback(|code| error!("Bluetooth error: {}", code));

    driver.init().context("Driver init failed")?;
    let worker = {
        let driver = driver.clone();
        thread::spawn(move || driver.run())
    };

    // Bring-up is done once the controller has reported its version
    let bring_up = tokio::time::timeout(BRING_UP_TIMEOUT, async {
        while driver.controller_info().is_none() && !worker.is_finished() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    if worker.is_finished() {
        let result = worker
            .join()
            .map_err(|_| anyhow!("Driver thread panicked"))?;
        result.context("Driver failed to start")?;
        return Err(anyhow!("Driver exited before bring-up"));
    }
    let Some(info) = driver.controller_info().filter(|_| bring_up.is_ok()) else {
        if driver.state() == LifecycleState::Running {
            driver.stop()?;
        }
        let _ = worker.join();
        return Err(anyhow!("Controller did not finish bring-up"));
    };
    info!("Controller: {}", info.manufacturer_name());

    driver.set_visibility(true)?;
    driver.scan()?;
    peer_script();

    let window = Duration::from_millis(settings.gap.inquiry_length as u64 * 1280 + 1000);
    let deadline = tokio::time::Instant::now() + window;
    let mut found = 0;
    loop {
        match tokio::time::timeout_at(deadline, notifications.recv()).await {
            Ok(Some(GapNotification::DeviceFound(device))) => {
                found += 1;
                println!(
                    "{}  class {:06X}  rssi {:>4}  {}",
                    device.address,
                    device.class_of_device,
                    device.rssi.map_or("-".to_string(), |r| r.to_string()),
                    device.name.as_deref().unwrap_or("<unnamed>")
                );
            }
            Ok(Some(GapNotification::ScanFinished)) => break,
            Ok(Some(other)) => info!("{:?}", other),
            Ok(None) => break,
            Err(_) => {
                warn!("Scan window elapsed");
                break;
            }
        }
    }
    info!("Scan done, {} device(s) found", found);

    driver.stop_scan()?;
    driver.stop()?;
    worker
        .join()
        .map_err(|_| anyhow!("Driver thread panicked"))??;

    settings_service.save()?;
    Ok(())
}
