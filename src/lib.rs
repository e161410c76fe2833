//! Bluetooth classic host driver
//!
//! Brings up an HCI controller, runs its event loop and exposes GAP
//! discovery, visibility and pairing. See [`infrastructure::bluetooth`] for
//! the layering.

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use domain::models::{
    BdAddr, ControllerInfo, DiscoveredDevice, GapNotification, GapState, LifecycleState,
    ProtectionLevel,
};
pub use error::{DriverResult, ErrorCode};
pub use infrastructure::bluetooth::{BluetoothContext, Driver};
