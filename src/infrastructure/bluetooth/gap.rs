//! GAP Module
//!
//! Discovery-class state machine on top of the protocol stack:
//!
//! ```text
//!            scan                          pair
//!   Idle ───────────► Scanning     Idle ───────────► Pairing(addr)
//!    ▲                   │           ▲                    │
//!    └───────────────────┘           └────────────────────┘
//!  stop_scan / inquiry complete      completion or failure event
//! ```
//!
//! Visibility is orthogonal to the state above. Requests return as soon as
//! the command was queued; outcomes arrive later through
//! [`Gap::handle_event`], which the driver calls from the run loop.

use crate::domain::models::{
    BdAddr, DiscoveredDevice, GapNotification, GapState, ProtectionLevel,
};
use crate::error::{DriverResult, ErrorCode};
use crate::infrastructure::bluetooth::hci::status;
use crate::infrastructure::bluetooth::stack::{InquiryParams, ProtocolStack};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Controller events relevant to GAP
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GapEvent {
    PeersDiscovered(Vec<DiscoveredDevice>),
    InquiryComplete { status: u8 },
    /// The controller refused to start the inquiry
    InquiryRejected { status: u8 },
    /// Write Scan Enable finished
    VisibilityResult { status: u8 },
    /// Pairing ended. `address` is `None` when the event only carries a
    /// connection handle or opcode.
    PairingComplete { address: Option<BdAddr>, status: u8 },
}

#[derive(Debug)]
struct GapInner {
    state: GapState,
    visible: bool,
    confirmed_visible: bool,
    /// Requested values of in-flight scan enable writes, oldest first
    pending_visibility: VecDeque<bool>,
}

impl Default for GapInner {
    fn default() -> Self {
        Self {
            state: GapState::Idle,
            visible: false,
            confirmed_visible: false,
            pending_visibility: VecDeque::new(),
        }
    }
}

pub struct Gap {
    stack: Arc<dyn ProtocolStack>,
    inquiry: InquiryParams,
    notifications: mpsc::UnboundedSender<GapNotification>,
    inner: Mutex<GapInner>,
}

impl Gap {
    pub fn new(
        stack: Arc<dyn ProtocolStack>,
        inquiry: InquiryParams,
        notifications: mpsc::UnboundedSender<GapNotification>,
    ) -> Self {
        Self {
            stack,
            inquiry,
            notifications,
            inner: Mutex::new(GapInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GapInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> GapState {
        self.lock().state
    }

    pub fn is_visible(&self) -> bool {
        self.lock().visible
    }

    /// Back to Idle and hidden, dropping in-flight bookkeeping
    pub fn reset(&self) {
        *self.lock() = GapInner::default();
    }

    pub fn scan(&self) -> DriverResult<()> {
        {
            let mut inner = self.lock();
            match inner.state {
                GapState::Idle => inner.state = GapState::Scanning,
                GapState::Scanning => {
                    debug!("Scan already running");
                    return Ok(());
                }
                GapState::Pairing(_) => return Err(ErrorCode::Busy),
            }
        }

        info!(
            "Starting inquiry ({} x 1.28 s, max {} responses)",
            self.inquiry.length, self.inquiry.max_responses
        );
        if let Err(e) = self.stack.start_inquiry(&self.inquiry) {
            warn!("Inquiry could not be issued: {}", e);
            let mut inner = self.lock();
            if inner.state == GapState::Scanning {
                inner.state = GapState::Idle;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Leave Scanning. No discovery result is published once this returns.
    pub fn stop_scan(&self) -> DriverResult<()> {
        {
            let mut inner = self.lock();
            match inner.state {
                GapState::Idle => return Ok(()),
                GapState::Pairing(_) => return Err(ErrorCode::InvalidState),
                GapState::Scanning => inner.state = GapState::Idle,
            }
        }

        info!("Cancelling inquiry");
        self.stack.stop_inquiry()
    }

    pub fn set_visibility(&self, visible: bool) -> DriverResult<()> {
        {
            let mut inner = self.lock();
            inner.visible = visible;
            inner.pending_visibility.push_back(visible);
        }

        if let Err(e) = self.stack.set_discoverable(visible) {
            let mut inner = self.lock();
            inner.pending_visibility.pop_back();
            inner.visible = inner
                .pending_visibility
                .back()
                .copied()
                .unwrap_or(inner.confirmed_visible);
            return Err(e);
        }
        Ok(())
    }

    pub fn pair(&self, address: BdAddr, level: ProtectionLevel) -> DriverResult<()> {
        {
            let mut inner = self.lock();
            if inner.state != GapState::Idle {
                return Err(ErrorCode::Busy);
            }
            inner.state = GapState::Pairing(address);
        }

        info!("Pairing with {} (protection level {})", address, level.value());
        if let Err(e) = self.stack.request_pairing(address, level) {
            warn!("Pairing with {} could not be issued: {}", address, e);
            let mut inner = self.lock();
            if inner.state == GapState::Pairing(address) {
                inner.state = GapState::Idle;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Apply a controller event. Returns the error to report, if any.
    pub fn handle_event(&self, event: GapEvent) -> Option<ErrorCode> {
        let mut inner = self.lock();

        match event {
            GapEvent::PeersDiscovered(devices) => {
                if inner.state != GapState::Scanning {
                    trace!("Dropping {} inquiry result(s) outside a scan", devices.len());
                    return None;
                }
                for device in devices {
                    debug!("Found {} ({:?})", device.address, device.name);
                    self.publish(GapNotification::DeviceFound(device));
                }
                None
            }
            GapEvent::InquiryComplete { status } => {
                if inner.state != GapState::Scanning {
                    return None;
                }
                inner.state = GapState::Idle;
                info!("Inquiry finished");
                self.publish(GapNotification::ScanFinished);
                ErrorCode::from_hci_status(status)
            }
            GapEvent::InquiryRejected { status } => {
                if inner.state != GapState::Scanning {
                    return None;
                }
                inner.state = GapState::Idle;
                warn!("Inquiry rejected by controller (status {:#04X})", status);
                Some(ErrorCode::StackRejected)
            }
            GapEvent::VisibilityResult { status } => {
                let requested = inner.pending_visibility.pop_front();
                if status == status::SUCCESS {
                    if let Some(requested) = requested {
                        inner.confirmed_visible = requested;
                    }
                    return None;
                }

                warn!("Scan enable write failed (status {:#04X})", status);
                if inner.pending_visibility.is_empty() {
                    inner.visible = inner.confirmed_visible;
                }
                Some(ErrorCode::StackRejected)
            }
            GapEvent::PairingComplete { address, status } => {
                let GapState::Pairing(peer) = inner.state else {
                    return None;
                };
                if address.is_some_and(|a| a != peer) {
                    return None;
                }

                inner.state = GapState::Idle;
                match ErrorCode::from_hci_status(status) {
                    None => {
                        info!("Paired with {}", peer);
                        self.publish(GapNotification::Paired(peer));
                        None
                    }
                    Some(code) => {
                        warn!("Pairing with {} failed (status {:#04X})", peer, status);
                        Some(code)
                    }
                }
            }
        }
    }

    /// Called with the state lock held so results cannot race `stop_scan`
    fn publish(&self, notification: GapNotification) {
        if self.notifications.send(notification).is_err() {
            trace!("No GAP listener, notification dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::settings::TransportConfig;
    use crate::infrastructure::bluetooth::hci::{HciPacket, LAP_GIAC};
    use crate::infrastructure::bluetooth::stack::PacketHandler;

    #[derive(Default)]
    struct FakeStack {
        calls: Mutex<Vec<&'static str>>,
        fail_inquiry: bool,
    }

    impl FakeStack {
        fn record(&self, call: &'static str) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ProtocolStack for FakeStack {
        fn open(&self, _config: &TransportConfig) -> DriverResult<()> {
            Ok(())
        }
        fn register_packet_handler(&self, _handler: PacketHandler) {}
        fn power_on(&self) -> DriverResult<()> {
            Ok(())
        }
        fn power_off(&self) {}
        fn start_inquiry(&self, _params: &InquiryParams) -> DriverResult<()> {
            self.record("inquiry");
            if self.fail_inquiry {
                Err(ErrorCode::StackRejected)
            } else {
                Ok(())
            }
        }
        fn stop_inquiry(&self) -> DriverResult<()> {
            self.record("inquiry_cancel");
            Ok(())
        }
        fn set_discoverable(&self, _enabled: bool) -> DriverResult<()> {
            self.record("scan_enable");
            Ok(())
        }
        fn request_pairing(&self, _address: BdAddr, _level: ProtectionLevel) -> DriverResult<()> {
            self.record("create_connection");
            Ok(())
        }
        fn process_inbound(&self, _packet: &HciPacket) {}
    }

    fn gap_with(
        stack: FakeStack,
    ) -> (
        Arc<FakeStack>,
        Gap,
        mpsc::UnboundedReceiver<GapNotification>,
    ) {
        let stack = Arc::new(stack);
        let (tx, rx) = mpsc::unbounded_channel();
        let params = InquiryParams {
            lap: LAP_GIAC,
            length: 5,
            max_responses: 0,
        };
        (stack.clone(), Gap::new(stack, params, tx), rx)
    }

    fn device(value: u64) -> DiscoveredDevice {
        DiscoveredDevice {
            address: BdAddr::from_u64(value),
            class_of_device: 0x5A020C,
            rssi: None,
            name: None,
        }
    }

    #[test]
    fn test_scan_is_idempotent() {
        let (stack, gap, _rx) = gap_with(FakeStack::default());
        assert_eq!(gap.scan(), Ok(()));
        assert_eq!(gap.scan(), Ok(()));
        assert_eq!(gap.state(), GapState::Scanning);
        assert_eq!(stack.calls(), vec!["inquiry"]);
    }

    #[test]
    fn test_scan_issue_failure_restores_idle() {
        let (_, gap, _rx) = gap_with(FakeStack {
            fail_inquiry: true,
            ..Default::default()
        });
        assert_eq!(gap.scan(), Err(ErrorCode::StackRejected));
        assert_eq!(gap.state(), GapState::Idle);
    }

    #[test]
    fn test_results_only_while_scanning() {
        let (_, gap, mut rx) = gap_with(FakeStack::default());
        gap.handle_event(GapEvent::PeersDiscovered(vec![device(1)]));
        assert!(rx.try_recv().is_err());

        gap.scan().unwrap();
        gap.handle_event(GapEvent::PeersDiscovered(vec![device(2), device(3)]));
        gap.stop_scan().unwrap();
        gap.handle_event(GapEvent::PeersDiscovered(vec![device(4)]));

        assert_eq!(rx.try_recv().unwrap(), GapNotification::DeviceFound(device(2)));
        assert_eq!(rx.try_recv().unwrap(), GapNotification::DeviceFound(device(3)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_stop_scan_transitions() {
        let (stack, gap, _rx) = gap_with(FakeStack::default());
        // No-op from Idle
        assert_eq!(gap.stop_scan(), Ok(()));
        assert!(stack.calls().is_empty());

        gap.pair(BdAddr::from_u64(1), ProtectionLevel::LEVEL_0).unwrap();
        assert_eq!(gap.stop_scan(), Err(ErrorCode::InvalidState));
        assert_eq!(gap.state(), GapState::Pairing(BdAddr::from_u64(1)));
    }

    #[test]
    fn test_inquiry_complete_finishes_scan() {
        let (_, gap, mut rx) = gap_with(FakeStack::default());
        gap.scan().unwrap();
        assert_eq!(
            gap.handle_event(GapEvent::InquiryComplete {
                status: status::SUCCESS
            }),
            None
        );
        assert_eq!(gap.state(), GapState::Idle);
        assert_eq!(rx.try_recv().unwrap(), GapNotification::ScanFinished);
    }

    #[test]
    fn test_inquiry_rejected() {
        let (_, gap, _rx) = gap_with(FakeStack::default());
        gap.scan().unwrap();
        assert_eq!(
            gap.handle_event(GapEvent::InquiryRejected {
                status: status::COMMAND_DISALLOWED
            }),
            Some(ErrorCode::StackRejected)
        );
        assert_eq!(gap.state(), GapState::Idle);
    }

    #[test]
    fn test_pair_busy_while_scanning_or_pairing() {
        let (stack, gap, _rx) = gap_with(FakeStack::default());
        let peer = BdAddr::from_u64(0xAABBCCDDEEFF);

        gap.scan().unwrap();
        assert_eq!(gap.pair(peer, ProtectionLevel::LEVEL_0), Err(ErrorCode::Busy));
        gap.stop_scan().unwrap();

        gap.pair(peer, ProtectionLevel::LEVEL_0).unwrap();
        assert_eq!(gap.pair(peer, ProtectionLevel::LEVEL_0), Err(ErrorCode::Busy));
        assert_eq!(gap.scan(), Err(ErrorCode::Busy));
        assert_eq!(
            stack.calls(),
            vec!["inquiry", "inquiry_cancel", "create_connection"]
        );
    }

    #[test]
    fn test_pairing_outcomes() {
        let (_, gap, mut rx) = gap_with(FakeStack::default());
        let peer = BdAddr::from_u64(0xAABBCCDDEEFF);

        gap.pair(peer, ProtectionLevel::LEVEL_0).unwrap();
        // Another peer's completion is not ours
        assert_eq!(
            gap.handle_event(GapEvent::PairingComplete {
                address: Some(BdAddr::from_u64(7)),
                status: status::SUCCESS,
            }),
            None
        );
        assert_eq!(gap.state(), GapState::Pairing(peer));

        assert_eq!(
            gap.handle_event(GapEvent::PairingComplete {
                address: Some(peer),
                status: status::SUCCESS,
            }),
            None
        );
        assert_eq!(gap.state(), GapState::Idle);
        assert_eq!(rx.try_recv().unwrap(), GapNotification::Paired(peer));

        gap.pair(peer, ProtectionLevel::LEVEL_2).unwrap();
        assert_eq!(
            gap.handle_event(GapEvent::PairingComplete {
                address: None,
                status: status::PAIRING_NOT_ALLOWED,
            }),
            Some(ErrorCode::PeerRejected)
        );
        // A trailing failure for the same attempt is not reported again
        assert_eq!(
            gap.handle_event(GapEvent::PairingComplete {
                address: Some(peer),
                status: status::AUTHENTICATION_FAILURE,
            }),
            None
        );
        assert_eq!(gap.state(), GapState::Idle);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_visibility_reverts_on_failure() {
        let (stack, gap, _rx) = gap_with(FakeStack::default());

        gap.set_visibility(true).unwrap();
        assert!(gap.is_visible());
        gap.handle_event(GapEvent::VisibilityResult {
            status: status::SUCCESS,
        });

        gap.set_visibility(false).unwrap();
        assert!(!gap.is_visible());
        assert_eq!(
            gap.handle_event(GapEvent::VisibilityResult {
                status: status::COMMAND_DISALLOWED,
            }),
            Some(ErrorCode::StackRejected)
        );
        assert!(gap.is_visible());
        assert_eq!(stack.calls(), vec!["scan_enable", "scan_enable"]);
    }

    #[test]
    fn test_reset() {
        let (_, gap, _rx) = gap_with(FakeStack::default());
        gap.scan().unwrap();
        gap.set_visibility(true).unwrap();
        gap.reset();
        assert_eq!(gap.state(), GapState::Idle);
        assert!(!gap.is_visible());
    }
}
