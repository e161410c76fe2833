//! Run Loop Module
//!
//! The single-threaded event pump that moves bytes between the transport
//! and the stack. Two backends implement the same [`RunLoop`] capability:
//!
//! - [`uart::UartRunLoop`] - H4 over a serial byte stream (target hardware)
//! - [`simulated::SimulatedRunLoop`] - in-process queue (host simulation)
//!
//! Which one a build uses is decided when the [`BluetoothContext`] is
//! assembled (see the `platform-host` / `platform-target` features); the
//! driver only sees the trait.
//!
//! [`BluetoothContext`]: crate::infrastructure::bluetooth::context::BluetoothContext

pub mod simulated;
pub mod uart;

pub use simulated::{PacketInjector, SimulatedRunLoop};
pub use uart::{OutboundQueue, UartRunLoop};

use crate::error::DriverResult;
use crate::infrastructure::bluetooth::stack::ProtocolStack;

/// Pump transport I/O until asked to stop
pub trait RunLoop: Send + Sync {
    /// Deliver inbound packets to `stack` until a stop request is honoured.
    ///
    /// Blocks the calling thread. Returns `Ok` when the loop was torn down
    /// on request, `Err` when the transport failed.
    fn run(&self, stack: &dyn ProtocolStack) -> DriverResult<()>;

    /// Ask the loop to exit. Safe from any thread; the loop exits after it
    /// has finished the packet it is currently dispatching.
    fn request_stop(&self);

    /// Forget stop requests made before this call.
    ///
    /// A request that arrives after the loop already exited on its own is
    /// otherwise left queued and ends the next `run` immediately.
    fn discard_stop_requests(&self);
}
