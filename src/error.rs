//! Error Model
//!
//! Error codes returned by the driver entry points and the single-slot
//! error callback used to report failures that happen after a request
//! was accepted.

use crate::infrastructure::bluetooth::hci::status;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::debug;

/// Failure reasons reported by the driver
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Transport or stack setup failed
    #[error("Transport initialization failed")]
    TransportInit,
    /// Another operation of the same class is in progress
    #[error("Stack busy")]
    Busy,
    /// Operation not valid in the current lifecycle or GAP state
    #[error("Invalid state")]
    InvalidState,
    /// The stack or controller refused the command
    #[error("Command rejected by stack")]
    StackRejected,
    /// Pairing refused by the remote device
    #[error("Rejected by peer")]
    PeerRejected,
    /// The controller reported a timeout
    #[error("Operation timed out")]
    Timeout,
    /// Anything else
    #[error("Unknown error")]
    Unknown,
}

impl ErrorCode {
    /// Map an HCI status byte onto the error taxonomy.
    ///
    /// Returns `None` for `SUCCESS`.
    pub fn from_hci_status(code: u8) -> Option<Self> {
        let error = match code {
            status::SUCCESS => return None,
            status::AUTHENTICATION_FAILURE
            | status::PIN_OR_KEY_MISSING
            | status::CONNECTION_REJECTED_LIMITED_RESOURCES
            | status::CONNECTION_REJECTED_SECURITY_REASONS
            | status::CONNECTION_REJECTED_UNACCEPTABLE_BD_ADDR
            | status::REMOTE_USER_TERMINATED_CONNECTION
            | status::REPEATED_ATTEMPTS
            | status::PAIRING_NOT_ALLOWED
            | status::PAIRING_WITH_UNIT_KEY_NOT_SUPPORTED
            | status::SIMPLE_PAIRING_NOT_SUPPORTED_BY_HOST => ErrorCode::PeerRejected,
            status::PAGE_TIMEOUT
            | status::CONNECTION_TIMEOUT
            | status::CONNECTION_ACCEPT_TIMEOUT_EXCEEDED
            | status::LMP_OR_LL_RESPONSE_TIMEOUT => ErrorCode::Timeout,
            status::UNKNOWN_HCI_COMMAND
            | status::MEMORY_CAPACITY_EXCEEDED
            | status::CONNECTION_LIMIT_EXCEEDED
            | status::CONNECTION_ALREADY_EXISTS
            | status::COMMAND_DISALLOWED
            | status::UNSUPPORTED_FEATURE_OR_PARAMETER
            | status::INVALID_HCI_COMMAND_PARAMETERS => ErrorCode::StackRejected,
            status::CONTROLLER_BUSY => ErrorCode::Busy,
            _ => ErrorCode::Unknown,
        };
        Some(error)
    }
}

/// Result type for driver operations
pub type DriverResult<T> = Result<T, ErrorCode>;

/// Callback invoked for asynchronous failures
pub type ErrorCallback = Arc<dyn Fn(ErrorCode) + Send + Sync>;

/// Holds at most one error callback.
///
/// Registration overwrites. `report` clones the callback out of the slot
/// and invokes it with the lock released, so a callback may re-register.
#[derive(Default)]
pub struct ErrorReporter {
    callback: Mutex<Option<ErrorCallback>>,
}

impl ErrorReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored callback
    pub fn register(&self, callback: ErrorCallback) {
        *self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    /// Invoke the stored callback, if any
    pub fn report(&self, code: ErrorCode) {
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match callback {
            Some(cb) => cb(code),
            None => debug!("No error callback registered, dropping {:?}", code),
        }
    }
}
