//! Bluetooth Module
//!
//! HCI host driver and GAP layer for a controller attached over H4.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                        Driver                            │
//! │  (lifecycle, error callback - public API)                │
//! └──────────┬───────────────────────────────┬──────────────┘
//!            │ requests                      │ packets
//!            ▼                               │
//!     ┌────────────┐                 ┌──────────────┐
//!     │    Gap     │◄──── GapEvent ──│  Dispatcher  │
//!     │ - scan     │                 │ - phase gate │
//!     │ - pair     │                 │ - routing    │
//!     │ - visible  │                 └──────▲───────┘
//!     └─────┬──────┘                        │
//!           ▼                               │
//! ┌─────────────────────┐   frames   ┌──────┴───────┐
//! │  ProtocolStack      │──────────► │   RunLoop    │
//! │  (HciStack + codec) │◄────────── │ UART / sim   │
//! └─────────────────────┘  packets   └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`hci`] - H4 framing, command encoding, event parsing
//! - [`stack`] - Protocol stack capability and the HCI command layer
//! - [`run_loop`] - Event pump backends (UART, simulated)
//! - [`simulator`] - In-process controller for host builds and tests
//! - [`dispatcher`] - Inbound packet routing
//! - [`gap`] - Scan / pair / visibility state machine
//! - [`context`] - Stack, run loop and transport bundled for the driver
//! - [`driver`] - Public entry point

pub mod context;
pub mod dispatcher;
pub mod driver;
pub mod gap;
pub mod hci;
pub mod run_loop;
pub mod simulator;
pub mod stack;

pub use context::BluetoothContext;
pub use driver::Driver;
