//! Simulated Controller
//!
//! An in-process stand-in for a Bluetooth controller. It accepts the
//! command frames [`HciStack`](super::stack::HciStack) submits, records
//! their opcodes and answers each one through a [`PacketInjector`], the
//! same way a real controller answers over the UART.
//!
//! Peer behaviour (inquiry responses, pairing outcomes, hardware faults)
//! is scripted by the caller with the `inject_*` helpers.

use crate::domain::models::{BdAddr, DiscoveredDevice};
use crate::domain::settings::TransportConfig;
use crate::error::{DriverResult, ErrorCode};
use crate::infrastructure::bluetooth::hci::{
    events, opcodes, parse_command_frame, status, HciPacket,
};
use crate::infrastructure::bluetooth::run_loop::PacketInjector;
use crate::infrastructure::bluetooth::stack::CommandSink;
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Texas Instruments, the vendor of the CC256x parts this driver targets
const SIMULATED_MANUFACTURER: u16 = 0x000D;
const SIMULATED_HCI_VERSION: u8 = 0x06;
const SIMULATED_HCI_REVISION: u16 = 0x0001;
const SIMULATED_LMP_SUBVERSION: u16 = 0x1B12;

/// Connection handle handed out for simulated links
const SIMULATED_HANDLE: u16 = 0x000B;

/// Extended inquiry response data block length
const EIR_DATA_LEN: usize = 240;

/// Commands answered with Command Status instead of Command Complete
fn answered_with_status(opcode: u16) -> bool {
    matches!(
        opcode,
        opcodes::INQUIRY | opcodes::CREATE_CONNECTION | opcodes::AUTHENTICATION_REQUESTED
    )
}

#[derive(Default)]
struct ControllerState {
    commands: Vec<u16>,
    fail_open: bool,
    /// Accepted by the sink, failed by the controller
    rejected: HashSet<u16>,
    /// Refused at submission
    refused: HashSet<u16>,
    /// Peer and status of the pairing exchange awaiting the host's confirmation
    pairing: Option<(BdAddr, u8)>,
}

pub struct SimulatedController {
    injector: PacketInjector,
    state: Mutex<ControllerState>,
}

impl SimulatedController {
    pub fn new(injector: PacketInjector) -> Self {
        Self {
            injector,
            state: Mutex::new(ControllerState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail `open` while set
    pub fn set_fail_open(&self, fail: bool) {
        self.state().fail_open = fail;
    }

    /// Answer `opcode` with `COMMAND_DISALLOWED`
    pub fn reject(&self, opcode: u16) {
        self.state().rejected.insert(opcode);
    }

    /// Refuse to queue `opcode` at all
    pub fn refuse(&self, opcode: u16) {
        self.state().refused.insert(opcode);
    }

    /// Opcodes received so far, in order
    pub fn commands(&self) -> Vec<u16> {
        self.state().commands.clone()
    }

    pub fn count_of(&self, opcode: u16) -> usize {
        self.state().commands.iter().filter(|&&o| o == opcode).count()
    }

    /// Block until every injected packet has been dispatched
    pub fn flush(&self) -> bool {
        self.injector.flush()
    }

    fn inject(&self, code: u8, params: &[u8]) {
        if !self.injector.inject(HciPacket::event(code, params)) {
            warn!("Simulated run loop is gone, dropping event {:#04X}", code);
        }
    }

    fn answer(&self, opcode: u16, status: u8) {
        let [lo, hi] = opcode.to_le_bytes();

        if answered_with_status(opcode) {
            // Status, Num_HCI_Command_Packets, Opcode
            self.inject(events::COMMAND_STATUS, &[status, 1, lo, hi]);
            return;
        }

        let mut params = vec![1, lo, hi, status];
        if opcode == opcodes::READ_LOCAL_VERSION_INFORMATION {
            params.push(SIMULATED_HCI_VERSION);
            params.extend_from_slice(&SIMULATED_HCI_REVISION.to_le_bytes());
            params.push(SIMULATED_HCI_VERSION);
            params.extend_from_slice(&SIMULATED_MANUFACTURER.to_le_bytes());
            params.extend_from_slice(&SIMULATED_LMP_SUBVERSION.to_le_bytes());
        }
        self.inject(events::COMMAND_COMPLETE, &params);
    }

    /// A peer answering the inquiry, sent as an Extended Inquiry Result
    pub fn inject_inquiry_result(&self, device: &DiscoveredDevice) {
        let mut params = Vec::with_capacity(15 + EIR_DATA_LEN);
        params.push(1);
        params.extend_from_slice(&device.address.to_le_bytes());
        // Page scan repetition mode R1, reserved
        params.extend_from_slice(&[0x01, 0x00]);
        params.extend_from_slice(&device.class_of_device.to_le_bytes()[..3]);
        // Clock offset
        params.extend_from_slice(&[0x00, 0x00]);
        params.push(device.rssi.unwrap_or(0) as u8);

        let mut eir = Vec::with_capacity(EIR_DATA_LEN);
        if let Some(name) = &device.name {
            let name = &name.as_bytes()[..name.len().min(EIR_DATA_LEN - 2)];
            eir.push(name.len() as u8 + 1);
            eir.push(0x09);
            eir.extend_from_slice(name);
        }
        eir.resize(EIR_DATA_LEN, 0);
        params.extend_from_slice(&eir);

        self.inject(events::EXTENDED_INQUIRY_RESULT, &params);
    }

    pub fn inject_inquiry_complete(&self, status: u8) {
        self.inject(events::INQUIRY_COMPLETE, &[status]);
    }

    /// Play a Secure Simple Pairing exchange with `address`.
    ///
    /// The exchange runs up to the user confirmation request. Once the host
    /// answers it, the pairing completes with `status`, or with
    /// `AUTHENTICATION_FAILURE` if the host refused.
    pub fn inject_pairing_complete(&self, address: BdAddr, status: u8) {
        let addr = address.to_le_bytes();
        let handle = SIMULATED_HANDLE.to_le_bytes();
        self.state().pairing = Some((address, status));

        let mut connection = vec![status::SUCCESS, handle[0], handle[1]];
        connection.extend_from_slice(&addr);
        // ACL link, encryption off
        connection.extend_from_slice(&[0x01, 0x00]);
        self.inject(events::CONNECTION_COMPLETE, &connection);

        self.inject(events::LINK_KEY_REQUEST, &addr);
        self.inject(events::IO_CAPABILITY_REQUEST, &addr);

        let mut confirmation = addr.to_vec();
        confirmation.extend_from_slice(&123_456u32.to_le_bytes());
        self.inject(events::USER_CONFIRMATION_REQUEST, &confirmation);
    }

    fn finish_pairing(&self, address: BdAddr, status: u8) {
        let handle = SIMULATED_HANDLE.to_le_bytes();

        let mut complete = vec![status];
        complete.extend_from_slice(&address.to_le_bytes());
        self.inject(events::SIMPLE_PAIRING_COMPLETE, &complete);

        self.inject(
            events::AUTHENTICATION_COMPLETE,
            &[status, handle[0], handle[1]],
        );
    }

    /// The page to `address` fails before a link exists
    pub fn inject_connection_failed(&self, address: BdAddr, status: u8) {
        let handle = SIMULATED_HANDLE.to_le_bytes();
        let mut params = vec![status, handle[0], handle[1]];
        params.extend_from_slice(&address.to_le_bytes());
        params.extend_from_slice(&[0x01, 0x00]);
        self.inject(events::CONNECTION_COMPLETE, &params);
    }

    pub fn inject_hardware_error(&self, code: u8) {
        self.inject(events::HARDWARE_ERROR, &[code]);
    }
}

impl CommandSink for SimulatedController {
    fn open(&self, config: &TransportConfig) -> DriverResult<()> {
        if self.state().fail_open {
            warn!("Simulated open of {} failed", config.device_name);
            return Err(ErrorCode::TransportInit);
        }
        info!("Simulated controller attached as {}", config.device_name);
        Ok(())
    }

    fn submit(&self, frame: Vec<u8>) -> DriverResult<()> {
        let (opcode, params) = parse_command_frame(&frame).map_err(|e| {
            warn!("Malformed command frame: {}", e);
            ErrorCode::StackRejected
        })?;

        let status = {
            let mut state = self.state();
            if state.refused.contains(&opcode) {
                debug!("Refusing command {:#06X}", opcode);
                return Err(ErrorCode::StackRejected);
            }
            state.commands.push(opcode);
            if state.rejected.contains(&opcode) {
                status::COMMAND_DISALLOWED
            } else {
                status::SUCCESS
            }
        };

        self.answer(opcode, status);

        let confirmed = match opcode {
            opcodes::USER_CONFIRMATION_REQUEST_REPLY => true,
            opcodes::USER_CONFIRMATION_REQUEST_NEGATIVE_REPLY => false,
            _ => return Ok(()),
        };
        let pairing = {
            let mut state = self.state();
            match state.pairing {
                Some((peer, _)) if BdAddr::from_le_slice(params) == Some(peer) => {
                    state.pairing.take()
                }
                _ => None,
            }
        };
        if let Some((peer, outcome)) = pairing {
            let outcome = if confirmed {
                outcome
            } else {
                status::AUTHENTICATION_FAILURE
            };
            self.finish_pairing(peer, outcome);
        }
        Ok(())
    }
}
