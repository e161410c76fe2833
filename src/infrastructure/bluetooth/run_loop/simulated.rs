//! Host-simulated run loop
//!
//! Inbound packets, stop requests and flush markers share one queue, so
//! they are honoured strictly in the order they were posted.

use super::RunLoop;
use crate::error::{DriverResult, ErrorCode};
use crate::infrastructure::bluetooth::hci::HciPacket;
use crate::infrastructure::bluetooth::stack::ProtocolStack;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

enum LoopMessage {
    Inbound(HciPacket),
    Flush(oneshot::Sender<()>),
    /// Stop request tagged with the generation it was made in
    Stop(u64),
}

/// Handle for posting packets into a [`SimulatedRunLoop`]
#[derive(Clone)]
pub struct PacketInjector {
    tx: mpsc::UnboundedSender<LoopMessage>,
}

impl PacketInjector {
    /// Queue a packet for dispatch. Returns false once the loop is gone.
    pub fn inject(&self, packet: HciPacket) -> bool {
        self.tx.send(LoopMessage::Inbound(packet)).is_ok()
    }

    /// Block until everything queued before this call was dispatched.
    ///
    /// A marker posted while the loop is not running is answered by the
    /// next `run`. Returns false once the loop is gone.
    pub fn flush(&self) -> bool {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(LoopMessage::Flush(done_tx)).is_err() {
            return false;
        }
        done_rx.blocking_recv().is_ok()
    }
}

pub struct SimulatedRunLoop {
    tx: mpsc::UnboundedSender<LoopMessage>,
    rx: Mutex<mpsc::UnboundedReceiver<LoopMessage>>,
    generation: AtomicU64,
}

impl SimulatedRunLoop {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            generation: AtomicU64::new(0),
        }
    }

    pub fn injector(&self) -> PacketInjector {
        PacketInjector {
            tx: self.tx.clone(),
        }
    }
}

impl Default for SimulatedRunLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl RunLoop for SimulatedRunLoop {
    fn run(&self, stack: &dyn ProtocolStack) -> DriverResult<()> {
        let mut rx = self.rx.lock().map_err(|_| {
            error!("Simulated run loop receiver poisoned");
            ErrorCode::Unknown
        })?;

        info!("Simulated run loop started");
        while let Some(message) = rx.blocking_recv() {
            match message {
                LoopMessage::Inbound(packet) => stack.process_inbound(&packet),
                LoopMessage::Flush(done) => {
                    let _ = done.send(());
                }
                LoopMessage::Stop(generation)
                    if generation == self.generation.load(Ordering::SeqCst) =>
                {
                    debug!("Stop request received");
                    break;
                }
                LoopMessage::Stop(_) => debug!("Ignoring stale stop request"),
            }
        }

        info!("Simulated run loop stopped");
        Ok(())
    }

    fn request_stop(&self) {
        let generation = self.generation.load(Ordering::SeqCst);
        let _ = self.tx.send(LoopMessage::Stop(generation));
    }

    fn discard_stop_requests(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{BdAddr, ProtectionLevel};
    use crate::domain::settings::TransportConfig;
    use crate::infrastructure::bluetooth::hci::events;
    use crate::infrastructure::bluetooth::stack::{InquiryParams, PacketHandler};
    use std::sync::Arc;
    use std::thread;

    #[derive(Default)]
    struct CountingStack {
        received: Mutex<Vec<u8>>,
    }

    impl ProtocolStack for CountingStack {
        fn open(&self, _config: &TransportConfig) -> DriverResult<()> {
            Ok(())
        }
        fn register_packet_handler(&self, _handler: PacketHandler) {}
        fn power_on(&self) -> DriverResult<()> {
            Ok(())
        }
        fn power_off(&self) {}
        fn start_inquiry(&self, _params: &InquiryParams) -> DriverResult<()> {
            Ok(())
        }
        fn stop_inquiry(&self) -> DriverResult<()> {
            Ok(())
        }
        fn set_discoverable(&self, _enabled: bool) -> DriverResult<()> {
            Ok(())
        }
        fn request_pairing(&self, _address: BdAddr, _level: ProtectionLevel) -> DriverResult<()> {
            Ok(())
        }
        fn process_inbound(&self, packet: &HciPacket) {
            self.received.lock().unwrap().push(packet.payload[0]);
        }
    }

    #[test]
    fn test_packets_dispatched_in_order_until_stop() {
        let run_loop = Arc::new(SimulatedRunLoop::new());
        let stack = Arc::new(CountingStack::default());
        let injector = run_loop.injector();

        let worker = {
            let run_loop = run_loop.clone();
            let stack = stack.clone();
            thread::spawn(move || run_loop.run(stack.as_ref()))
        };

        injector.inject(HciPacket::event(events::INQUIRY_COMPLETE, &[0]));
        injector.inject(HciPacket::event(events::HARDWARE_ERROR, &[0]));
        assert!(injector.flush());
        assert_eq!(
            *stack.received.lock().unwrap(),
            vec![events::INQUIRY_COMPLETE, events::HARDWARE_ERROR]
        );

        run_loop.request_stop();
        assert_eq!(worker.join().unwrap(), Ok(()));
    }

    #[test]
    fn test_stale_stop_request_is_ignored() {
        let run_loop = Arc::new(SimulatedRunLoop::new());
        let stack = Arc::new(CountingStack::default());
        let injector = run_loop.injector();

        // Left over from a run that already ended
        run_loop.request_stop();
        run_loop.discard_stop_requests();

        let worker = {
            let run_loop = run_loop.clone();
            let stack = stack.clone();
            thread::spawn(move || run_loop.run(stack.as_ref()))
        };

        injector.inject(HciPacket::event(events::INQUIRY_COMPLETE, &[0]));
        assert!(injector.flush());
        assert!(!worker.is_finished());
        assert_eq!(*stack.received.lock().unwrap(), vec![events::INQUIRY_COMPLETE]);

        run_loop.request_stop();
        assert_eq!(worker.join().unwrap(), Ok(()));
    }
}
