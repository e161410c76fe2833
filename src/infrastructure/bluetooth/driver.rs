//! Bluetooth Driver
//!
//! Public entry point. Owns the [`BluetoothContext`], the GAP state machine
//! and the error callback slot, and walks the lifecycle:
//!
//! ```text
//! Uninitialized ──init──► Initialized ──run──► Running ──stop──► Stopped
//!                              ▲                                    │
//!                              └───────────────init─────────────────┘
//! ```
//!
//! `run` blocks the calling thread in the run loop; everything else may be
//! called from any thread.

use crate::domain::models::{
    BdAddr, ControllerInfo, GapNotification, GapState, LifecycleState, ProtectionLevel,
};
use crate::domain::settings::GapSettings;
use crate::error::{DriverResult, ErrorCode, ErrorReporter};
use crate::infrastructure::bluetooth::context::BluetoothContext;
use crate::infrastructure::bluetooth::dispatcher::{self, Phase, Route};
use crate::infrastructure::bluetooth::gap::Gap;
use crate::infrastructure::bluetooth::stack::InquiryParams;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
struct DriverStatus {
    lifecycle: LifecycleState,
    controller_info: Option<ControllerInfo>,
}

struct DriverInner {
    context: BluetoothContext,
    gap: Gap,
    errors: ErrorReporter,
    status: Mutex<DriverStatus>,
    /// Serialises init, run start/finish and stop. Never taken from the
    /// packet handler.
    transition: Mutex<()>,
}

impl DriverInner {
    fn status(&self) -> MutexGuard<'_, DriverStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self) -> MutexGuard<'_, ()> {
        self.transition.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lifecycle(&self) -> LifecycleState {
        self.status().lifecycle
    }

    fn set_lifecycle(&self, lifecycle: LifecycleState) {
        let mut status = self.status();
        debug!("Lifecycle {:?} -> {:?}", status.lifecycle, lifecycle);
        status.lifecycle = lifecycle;
    }

    fn ensure_running(&self) -> DriverResult<()> {
        match self.lifecycle() {
            LifecycleState::Running => Ok(()),
            other => {
                debug!("Driver is {:?}, request refused", other);
                Err(ErrorCode::InvalidState)
            }
        }
    }

    fn phase(&self) -> Phase {
        let status = self.status();
        match (status.lifecycle, status.controller_info) {
            (LifecycleState::Running, Some(_)) => Phase::Operational,
            (LifecycleState::Running, None) => Phase::BringUp,
            _ => Phase::Inactive,
        }
    }

    /// Registered with the stack; runs on the run-loop thread
    fn hci_packet_handler(&self, packet_type: u8, channel: u16, packet: &[u8]) {
        match dispatcher::route(self.phase(), packet_type, channel, packet) {
            Route::BringUp(status, info) => self.local_version_information_handler(status, info),
            Route::Gap(event) => {
                if let Some(code) = self.gap.handle_event(event) {
                    self.errors.report(code);
                }
            }
            Route::Fault(code) => self.errors.report(code),
            Route::Drop => {}
        }
    }

    /// Completes bring-up. Until this succeeds GAP events are not delivered.
    fn local_version_information_handler(&self, status: u8, info: ControllerInfo) {
        if let Some(code) = ErrorCode::from_hci_status(status) {
            error!("Reading local version information failed (status {:#04X})", status);
            self.errors.report(code);
            return;
        }

        info!(
            "Controller up: {} (manufacturer {:#06X}), HCI {} rev {:#06X}, LMP {} sub {:#06X}",
            info.manufacturer_name(),
            info.manufacturer,
            info.hci_version,
            info.hci_revision,
            info.lmp_version,
            info.lmp_subversion
        );
        self.status().controller_info = Some(info);
    }
}

/// Bluetooth host driver
pub struct Driver {
    inner: Arc<DriverInner>,
}

impl Driver {
    /// Discovery results and pairing successes are sent to `notifications`
    pub fn new(
        context: BluetoothContext,
        gap_settings: &GapSettings,
        notifications: mpsc::UnboundedSender<GapNotification>,
    ) -> Self {
        let gap = Gap::new(
            context.stack().clone(),
            InquiryParams::from(gap_settings),
            notifications,
        );

        Self {
            inner: Arc::new(DriverInner {
                context,
                gap,
                errors: ErrorReporter::new(),
                status: Mutex::new(DriverStatus {
                    lifecycle: LifecycleState::Uninitialized,
                    controller_info: None,
                }),
                transition: Mutex::new(()),
            }),
        }
    }

    /// Open the transport and hook the driver into the stack
    pub fn init(&self) -> DriverResult<()> {
        let inner = &self.inner;
        let _transition = inner.transition();

        match inner.lifecycle() {
            LifecycleState::Uninitialized | LifecycleState::Stopped => {}
            other => {
                warn!("init() called while {:?}", other);
                return Err(ErrorCode::InvalidState);
            }
        }

        inner.context.open().map_err(|e| {
            error!("Transport initialization failed: {}", e);
            e
        })?;

        let weak = Arc::downgrade(inner);
        let handler = move |packet_type: u8, channel: u16, packet: &[u8]| {
            if let Some(inner) = weak.upgrade() {
                inner.hci_packet_handler(packet_type, channel, packet);
            }
        };
        inner.context.stack().register_packet_handler(Arc::new(handler));

        inner.set_lifecycle(LifecycleState::Initialized);
        info!("Driver initialized");
        Ok(())
    }

    /// Power the controller on and run the event loop until stopped.
    ///
    /// Blocks the calling thread.
    pub fn run(&self) -> DriverResult<()> {
        let inner = &self.inner;
        let stack = inner.context.stack();

        {
            let _transition = inner.transition();
            match inner.lifecycle() {
                LifecycleState::Initialized => {}
                other => {
                    warn!("run() called while {:?}", other);
                    return Err(ErrorCode::InvalidState);
                }
            }

            inner.status().controller_info = None;
            inner.context.run_loop().discard_stop_requests();
            stack.power_on().map_err(|e| {
                error!("Power on failed: {}", e);
                e
            })?;
            inner.set_lifecycle(LifecycleState::Running);
        }

        info!("Driver running");
        let result = inner.context.run_loop().run(stack.as_ref());

        // Nothing pumps the transport any more, so no commands from here
        {
            let _transition = inner.transition();
            if inner.lifecycle() == LifecycleState::Running {
                inner.set_lifecycle(LifecycleState::Stopped);
            }
            inner.gap.reset();
        }

        match &result {
            Ok(()) => info!("Driver stopped"),
            Err(e) => error!("Run loop failed: {}", e),
        }
        result
    }

    /// Power the controller off and request run-loop teardown. The power-off
    /// commands are queued ahead of the stop request, so the loop still
    /// delivers them. `run` returns some time after this.
    pub fn stop(&self) -> DriverResult<()> {
        let inner = &self.inner;
        let _transition = inner.transition();

        if inner.lifecycle() != LifecycleState::Running {
            warn!("stop() called while {:?}", inner.lifecycle());
            return Err(ErrorCode::InvalidState);
        }

        inner.set_lifecycle(LifecycleState::Stopped);
        inner.gap.reset();
        inner.context.stack().power_off();
        inner.context.run_loop().request_stop();
        info!("Driver stop requested");
        Ok(())
    }

    /// Replace the error callback
    pub fn register_error_callback<F>(&self, callback: F)
    where
        F: Fn(ErrorCode) + Send + Sync + 'static,
    {
        self.inner.errors.register(Arc::new(callback));
    }

    pub fn scan(&self) -> DriverResult<()> {
        self.inner.ensure_running()?;
        self.inner.gap.scan()
    }

    pub fn stop_scan(&self) -> DriverResult<()> {
        self.inner.ensure_running()?;
        self.inner.gap.stop_scan()
    }

    pub fn set_visibility(&self, visible: bool) -> DriverResult<()> {
        self.inner.ensure_running()?;
        self.inner.gap.set_visibility(visible)
    }

    /// Returns whether the pairing request was accepted
    pub fn pair(&self, address: BdAddr, level: ProtectionLevel) -> bool {
        let result = self
            .inner
            .ensure_running()
            .and_then(|_| self.inner.gap.pair(address, level));

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("Pairing request for {} refused: {}", address, e);
                false
            }
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lifecycle()
    }

    pub fn gap_state(&self) -> GapState {
        self.inner.gap.state()
    }

    pub fn is_visible(&self) -> bool {
        self.inner.gap.is_visible()
    }

    /// Version information of the attached controller, once it is up
    pub fn controller_info(&self) -> Option<ControllerInfo> {
        self.inner.status().controller_info
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        if self.inner.lifecycle() == LifecycleState::Running {
            self.inner.context.stack().power_off();
            self.inner.context.close();
        }
    }
}
