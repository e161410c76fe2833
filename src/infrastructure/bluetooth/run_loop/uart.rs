//! UART run loop (H4)
//!
//! Drives a controller attached over a serial line. Outbound command frames
//! are queued through an [`OutboundQueue`] and written from the loop
//! thread; inbound bytes are read with the transport's timeout, decoded
//! into packets and delivered to the stack.

use super::RunLoop;
use crate::domain::settings::TransportConfig;
use crate::error::{DriverResult, ErrorCode};
use crate::infrastructure::bluetooth::hci::H4Decoder;
use crate::infrastructure::bluetooth::stack::{CommandSink, ProtocolStack};
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace};

enum UartMessage {
    Outbound(Vec<u8>),
    /// Stop request tagged with the generation it was made in
    Stop(u64),
}

/// Command sink that hands frames to a [`UartRunLoop`]
#[derive(Clone)]
pub struct OutboundQueue {
    tx: mpsc::UnboundedSender<UartMessage>,
}

impl CommandSink for OutboundQueue {
    fn open(&self, config: &TransportConfig) -> DriverResult<()> {
        validate_config(config)
    }

    fn submit(&self, frame: Vec<u8>) -> DriverResult<()> {
        self.tx
            .send(UartMessage::Outbound(frame))
            .map_err(|_| ErrorCode::StackRejected)
    }
}

pub struct UartRunLoop<T> {
    transport: Mutex<T>,
    tx: mpsc::UnboundedSender<UartMessage>,
    rx: Mutex<mpsc::UnboundedReceiver<UartMessage>>,
    generation: AtomicU64,
}

impl<T: Read + Write + Send> UartRunLoop<T> {
    /// `transport` must have a read timeout configured, otherwise stop
    /// requests are only seen when bytes arrive.
    pub fn new(transport: T) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            transport: Mutex::new(transport),
            tx,
            rx: Mutex::new(rx),
            generation: AtomicU64::new(0),
        }
    }

    pub fn outbound(&self) -> OutboundQueue {
        OutboundQueue {
            tx: self.tx.clone(),
        }
    }

    /// Write all queued frames; returns true when a current stop was
    /// requested. Frames queued ahead of the stop are written first.
    fn drain_outbound(
        &self,
        rx: &mut mpsc::UnboundedReceiver<UartMessage>,
        transport: &mut T,
    ) -> DriverResult<bool> {
        while let Ok(message) = rx.try_recv() {
            match message {
                UartMessage::Outbound(frame) => {
                    trace!("UART tx: {:02X?}", &frame);
                    transport.write_all(&frame).map_err(|e| {
                        error!("UART write failed: {}", e);
                        ErrorCode::Unknown
                    })?;
                    transport.flush().map_err(|e| {
                        error!("UART flush failed: {}", e);
                        ErrorCode::Unknown
                    })?;
                }
                UartMessage::Stop(generation)
                    if generation == self.generation.load(Ordering::SeqCst) =>
                {
                    return Ok(true)
                }
                UartMessage::Stop(_) => debug!("Ignoring stale stop request"),
            }
        }
        Ok(false)
    }
}

impl<T: Read + Write + Send> RunLoop for UartRunLoop<T> {
    fn run(&self, stack: &dyn ProtocolStack) -> DriverResult<()> {
        let mut rx = self.rx.lock().map_err(|_| ErrorCode::Unknown)?;
        let mut transport = self.transport.lock().map_err(|_| ErrorCode::Unknown)?;
        let mut decoder = H4Decoder::new();
        let mut buffer = [0u8; 512];

        info!("UART run loop started");
        loop {
            if self.drain_outbound(&mut rx, &mut transport)? {
                debug!("Stop request received");
                break;
            }

            match transport.read(&mut buffer) {
                Ok(0) => {
                    error!("UART closed by peer");
                    return Err(ErrorCode::Unknown);
                }
                Ok(n) => {
                    for packet in decoder.push(&buffer[..n]) {
                        stack.process_inbound(&packet);
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) => {}
                Err(e) => {
                    error!("UART read failed: {}", e);
                    return Err(ErrorCode::Unknown);
                }
            }
        }

        info!("UART run loop stopped");
        Ok(())
    }

    fn request_stop(&self) {
        let generation = self.generation.load(Ordering::SeqCst);
        let _ = self.tx.send(UartMessage::Stop(generation));
    }

    fn discard_stop_requests(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

/// Open the configured serial device for H4
#[cfg(feature = "platform-target")]
pub fn open_serial_port(config: &TransportConfig) -> anyhow::Result<serial::SystemPort> {
    use serial::{SerialPort, SerialPortSettings};
    use std::time::Duration;

    let mut port = serial::open(&config.device_name)?;
    let baud_rate = config.baud_rate_main.unwrap_or(config.baud_rate_init);
    let flow_control = if config.flow_control {
        serial::FlowHardware
    } else {
        serial::FlowNone
    };

    port.reconfigure(&|s| {
        s.set_baud_rate(serial::BaudRate::from_speed(baud_rate as usize))?;
        s.set_char_size(serial::Bits8);
        s.set_parity(serial::ParityNone);
        s.set_stop_bits(serial::Stop1);
        s.set_flow_control(flow_control);
        Ok(())
    })?;
    port.set_timeout(Duration::from_millis(config.read_timeout_ms))?;

    info!("Opened {} at {} baud", config.device_name, baud_rate);
    Ok(port)
}

/// Sanity checks before a UART is opened
pub fn validate_config(config: &TransportConfig) -> DriverResult<()> {
    if config.device_name.is_empty() || config.baud_rate_init == 0 {
        return Err(ErrorCode::TransportInit);
    }
    if config.baud_rate_main == Some(0) {
        return Err(ErrorCode::TransportInit);
    }
    Ok(())
}
