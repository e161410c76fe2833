//! Packet Dispatcher
//!
//! Decides where an inbound packet goes. Stateless: the driver passes in
//! its current [`Phase`] and acts on the returned [`Route`].

use crate::domain::models::ControllerInfo;
use crate::error::ErrorCode;
use crate::infrastructure::bluetooth::gap::GapEvent;
use crate::infrastructure::bluetooth::hci::{
    opcodes, packet_types, parse_local_version, status, HciEvent,
};
use tracing::{debug, trace, warn};

/// Driver progress as far as packet delivery is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Not running: everything is dropped
    Inactive,
    /// Running, local version information not seen yet
    BringUp,
    Operational,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Local version information: status and contents
    BringUp(u8, ControllerInfo),
    Gap(GapEvent),
    Fault(ErrorCode),
    Drop,
}

/// Power-on commands whose failure is reported as a fault
const BRING_UP_COMMANDS: [u16; 4] = [
    opcodes::RESET,
    opcodes::WRITE_SIMPLE_PAIRING_MODE,
    opcodes::WRITE_LOCAL_NAME,
    opcodes::WRITE_CLASS_OF_DEVICE,
];

pub fn route(phase: Phase, packet_type: u8, channel: u16, packet: &[u8]) -> Route {
    if phase == Phase::Inactive {
        trace!("Driver not running, dropping packet type {:#04X}", packet_type);
        return Route::Drop;
    }

    if packet_type != packet_types::EVENT {
        trace!(
            "Ignoring packet type {:#04X} on channel {:#06X} ({} bytes)",
            packet_type,
            channel,
            packet.len()
        );
        return Route::Drop;
    }

    let event = match HciEvent::parse(packet) {
        Ok(event) => event,
        Err(e) => {
            warn!("Dropping malformed event: {}", e);
            return Route::Drop;
        }
    };

    let route = classify(event);
    if phase == Phase::BringUp {
        if let Route::Gap(event) = &route {
            debug!("Controller not up yet, dropping {:?}", event);
            return Route::Drop;
        }
    }
    route
}

fn classify(event: HciEvent) -> Route {
    match event {
        HciEvent::InquiryResult(devices) => Route::Gap(GapEvent::PeersDiscovered(devices)),
        HciEvent::InquiryComplete { status } => Route::Gap(GapEvent::InquiryComplete { status }),
        HciEvent::CommandStatus { status, opcode } if status != status::SUCCESS => match opcode {
            opcodes::INQUIRY => Route::Gap(GapEvent::InquiryRejected { status }),
            opcodes::CREATE_CONNECTION | opcodes::AUTHENTICATION_REQUESTED => {
                Route::Gap(GapEvent::PairingComplete {
                    address: None,
                    status,
                })
            }
            _ => Route::Drop,
        },
        HciEvent::CommandComplete {
            opcode,
            return_parameters,
        } => classify_command_complete(opcode, &return_parameters),
        HciEvent::ConnectionComplete {
            status, address, ..
        } if status != status::SUCCESS => Route::Gap(GapEvent::PairingComplete {
            address: Some(address),
            status,
        }),
        HciEvent::AuthenticationComplete { status, .. } if status != status::SUCCESS => {
            Route::Gap(GapEvent::PairingComplete {
                address: None,
                status,
            })
        }
        HciEvent::SimplePairingComplete { status, address } => {
            Route::Gap(GapEvent::PairingComplete {
                address: Some(address),
                status,
            })
        }
        HciEvent::HardwareError { code } => {
            warn!("Controller hardware error {:#04X}", code);
            Route::Fault(ErrorCode::Unknown)
        }
        other => {
            trace!("Unhandled event {:?}", other);
            Route::Drop
        }
    }
}

fn classify_command_complete(opcode: u16, return_parameters: &[u8]) -> Route {
    let status = return_parameters.first().copied().unwrap_or(status::SUCCESS);

    match opcode {
        opcodes::READ_LOCAL_VERSION_INFORMATION => match parse_local_version(return_parameters) {
            Ok((status, info)) => Route::BringUp(status, info),
            Err(e) => {
                warn!("Malformed local version information: {}", e);
                Route::Drop
            }
        },
        opcodes::WRITE_SCAN_ENABLE => Route::Gap(GapEvent::VisibilityResult { status }),
        opcode if BRING_UP_COMMANDS.contains(&opcode) && status != status::SUCCESS => {
            warn!("Bring-up command {:#06X} failed (status {:#04X})", opcode, status);
            Route::Fault(ErrorCode::from_hci_status(status).unwrap_or(ErrorCode::Unknown))
        }
        _ => Route::Drop,
    }
}
