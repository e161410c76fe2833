//! Bluetooth Context
//!
//! Everything a [`Driver`](super::driver::Driver) needs from the platform:
//! the protocol stack, the run loop that feeds it and the transport
//! configuration. Built once per process and handed to the driver, which
//! owns it from then on.

use crate::domain::settings::{DriverSettings, TransportConfig};
use crate::error::{DriverResult, ErrorCode};
use crate::infrastructure::bluetooth::run_loop::{RunLoop, SimulatedRunLoop};
use crate::infrastructure::bluetooth::simulator::SimulatedController;
use crate::infrastructure::bluetooth::stack::{HciStack, ProtocolStack};
use std::sync::Arc;
use tracing::{debug, info};

pub struct BluetoothContext {
    stack: Arc<dyn ProtocolStack>,
    run_loop: Arc<dyn RunLoop>,
    transport: TransportConfig,
}

impl BluetoothContext {
    pub fn new(
        stack: Arc<dyn ProtocolStack>,
        run_loop: Arc<dyn RunLoop>,
        transport: TransportConfig,
    ) -> Self {
        Self {
            stack,
            run_loop,
            transport,
        }
    }

    /// Host build: an [`HciStack`] talking to an in-process controller
    pub fn simulated(settings: &DriverSettings) -> (Self, Arc<SimulatedController>) {
        let run_loop = Arc::new(SimulatedRunLoop::new());
        let controller = Arc::new(SimulatedController::new(run_loop.injector()));
        let stack = Arc::new(HciStack::new(controller.clone(), settings.gap.clone()));

        let context = Self::new(stack, run_loop, settings.transport.clone());
        (context, controller)
    }

    /// Target build: an [`HciStack`] driving the configured serial port
    #[cfg(feature = "platform-target")]
    pub fn uart(settings: &DriverSettings) -> anyhow::Result<Self> {
        use crate::infrastructure::bluetooth::run_loop::uart::open_serial_port;
        use crate::infrastructure::bluetooth::run_loop::UartRunLoop;

        let port = open_serial_port(&settings.transport)?;
        let run_loop = Arc::new(UartRunLoop::new(port));
        let stack = Arc::new(HciStack::new(run_loop.outbound(), settings.gap.clone()));
        Ok(Self::new(stack, run_loop, settings.transport.clone()))
    }

    pub fn stack(&self) -> &Arc<dyn ProtocolStack> {
        &self.stack
    }

    pub fn run_loop(&self) -> &Arc<dyn RunLoop> {
        &self.run_loop
    }

    pub fn transport(&self) -> &TransportConfig {
        &self.transport
    }

    /// Configure the transport through the stack
    pub fn open(&self) -> DriverResult<()> {
        debug!("Opening Bluetooth context on {}", self.transport.device_name);
        self.stack.open(&self.transport).map_err(|_| ErrorCode::TransportInit)
    }

    /// Release the transport: ask a running loop to exit
    pub fn close(&self) {
        info!("Closing Bluetooth context");
        self.run_loop.request_stop();
    }
}
