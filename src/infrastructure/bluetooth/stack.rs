//! Protocol Stack Module
//!
//! The capability the driver consumes from the Bluetooth stack, and a
//! minimal GAP-level implementation that encodes HCI commands and hands
//! them to a [`CommandSink`].

use crate::domain::models::{BdAddr, ProtectionLevel};
use crate::domain::settings::{GapSettings, TransportConfig};
use crate::error::{DriverResult, ErrorCode};
use crate::infrastructure::bluetooth::hci::{
    opcodes, packet_types, scan_enable, status, HciCommand, HciEvent, HciPacket, LAP_GIAC,
};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, trace, warn};

/// Packet callback registered with the stack: `(packet_type, channel, packet)`
pub type PacketHandler = Arc<dyn Fn(u8, u16, &[u8]) + Send + Sync>;

/// Inquiry parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InquiryParams {
    pub lap: u32,
    /// Units of 1.28 s
    pub length: u8,
    /// 0 = unlimited
    pub max_responses: u8,
}

impl From<&GapSettings> for InquiryParams {
    fn from(settings: &GapSettings) -> Self {
        Self {
            lap: LAP_GIAC,
            length: settings.inquiry_length,
            max_responses: settings.inquiry_max_responses,
        }
    }
}

/// Bluetooth protocol stack as seen by the driver.
///
/// Every issuance function is non-blocking: the command is queued for the
/// run loop and its outcome arrives later as an event. Registered handlers
/// are only ever invoked from [`ProtocolStack::process_inbound`], which the
/// run loop calls.
pub trait ProtocolStack: Send + Sync {
    /// Configure the transport
    fn open(&self, config: &TransportConfig) -> DriverResult<()>;

    /// Replace the packet handler
    fn register_packet_handler(&self, handler: PacketHandler);

    /// Start controller bring-up
    fn power_on(&self) -> DriverResult<()>;

    fn power_off(&self);

    fn start_inquiry(&self, params: &InquiryParams) -> DriverResult<()>;

    fn stop_inquiry(&self) -> DriverResult<()>;

    fn set_discoverable(&self, enabled: bool) -> DriverResult<()>;

    fn request_pairing(&self, address: BdAddr, level: ProtectionLevel) -> DriverResult<()>;

    /// Deliver an inbound packet (run-loop context only)
    fn process_inbound(&self, packet: &HciPacket);
}

/// Destination for encoded command frames
pub trait CommandSink: Send + Sync {
    /// Prepare the transport
    fn open(&self, _config: &TransportConfig) -> DriverResult<()> {
        Ok(())
    }

    /// Queue one H4 command frame
    fn submit(&self, frame: Vec<u8>) -> DriverResult<()>;
}

impl<S: CommandSink + ?Sized> CommandSink for Arc<S> {
    fn open(&self, config: &TransportConfig) -> DriverResult<()> {
        (**self).open(config)
    }

    fn submit(&self, frame: Vec<u8>) -> DriverResult<()> {
        (**self).submit(frame)
    }
}

/// IO capability: NoInputNoOutput
const IO_CAPABILITY_NO_INPUT_NO_OUTPUT: u8 = 0x03;
/// Authentication requirements: dedicated bonding, with and without MITM
const AUTH_DEDICATED_BONDING: u8 = 0x02;
const AUTH_DEDICATED_BONDING_MITM: u8 = 0x03;

#[derive(Debug, Clone, Copy)]
struct PendingPairing {
    address: BdAddr,
    level: ProtectionLevel,
    handle: Option<u16>,
}

/// GAP-level HCI command layer
pub struct HciStack<S: CommandSink> {
    sink: S,
    gap: GapSettings,
    handler: Mutex<Option<PacketHandler>>,
    pairing: Mutex<Option<PendingPairing>>,
}

impl<S: CommandSink> HciStack<S> {
    pub fn new(sink: S, gap: GapSettings) -> Self {
        Self {
            sink,
            gap,
            handler: Mutex::new(None),
            pairing: Mutex::new(None),
        }
    }

    fn send(&self, command: HciCommand) -> DriverResult<()> {
        debug!("HCI command {:#06X}: {:?}", command.opcode(), command);
        self.sink.submit(command.encode())
    }

    /// Pairing steps the stack answers on its own
    fn advance_pairing(&self, event: &HciEvent) {
        let pending = *self
            .pairing
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(pending) = pending else {
            return;
        };

        let reply = match event {
            HciEvent::ConnectionComplete {
                status: status::SUCCESS,
                handle,
                address,
            } if *address == pending.address => {
                info!("Connected to {} (handle {:#06X}), authenticating", address, handle);
                if let Some(p) = self
                    .pairing
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .as_mut()
                {
                    p.handle = Some(*handle);
                }
                Some(HciCommand::AuthenticationRequested(*handle))
            }
            // No keys are stored, so every link key request is answered
            // negatively and Secure Simple Pairing runs from scratch
            HciEvent::LinkKeyRequest { address } if *address == pending.address => {
                Some(HciCommand::LinkKeyRequestNegativeReply(*address))
            }
            HciEvent::IoCapabilityRequest { address } if *address == pending.address => {
                let authentication_requirements = if pending.level.requires_authentication() {
                    AUTH_DEDICATED_BONDING_MITM
                } else {
                    AUTH_DEDICATED_BONDING
                };
                Some(HciCommand::IoCapabilityRequestReply {
                    address: *address,
                    io_capability: IO_CAPABILITY_NO_INPUT_NO_OUTPUT,
                    oob_data_present: false,
                    authentication_requirements,
                })
            }
            HciEvent::UserConfirmationRequest {
                address,
                numeric_value,
            } if *address == pending.address => {
                // With NoInputNoOutput the exchange is Just Works, which
                // cannot provide MITM protection
                if pending.level.requires_authentication() {
                    warn!(
                        "Refusing unauthenticated pairing with {} (level {} requested)",
                        address,
                        pending.level.value()
                    );
                    Some(HciCommand::UserConfirmationRequestNegativeReply(*address))
                } else {
                    debug!("Confirming pairing with {} ({:06})", address, numeric_value);
                    Some(HciCommand::UserConfirmationRequestReply(*address))
                }
            }
            HciEvent::ConnectionComplete { address, .. }
            | HciEvent::SimplePairingComplete { address, .. }
                if *address == pending.address =>
            {
                self.clear_pairing();
                None
            }
            HciEvent::AuthenticationComplete { handle, .. } if pending.handle == Some(*handle) => {
                self.clear_pairing();
                None
            }
            HciEvent::CommandStatus { status: code, opcode }
                if *code != status::SUCCESS
                    && (*opcode == opcodes::CREATE_CONNECTION
                        || *opcode == opcodes::AUTHENTICATION_REQUESTED) =>
            {
                self.clear_pairing();
                None
            }
            _ => None,
        };

        if let Some(command) = reply {
            if let Err(e) = self.send(command) {
                warn!("Failed to answer pairing step: {}", e);
            }
        }
    }

    fn clear_pairing(&self) {
        *self
            .pairing
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl<S: CommandSink> ProtocolStack for HciStack<S> {
    fn open(&self, config: &TransportConfig) -> DriverResult<()> {
        info!(
            "Opening HCI transport {} at {} baud (flow control: {})",
            config.device_name, config.baud_rate_init, config.flow_control
        );
        self.sink.open(config).map_err(|e| {
            warn!("Transport open failed: {}", e);
            ErrorCode::TransportInit
        })
    }

    fn register_packet_handler(&self, handler: PacketHandler) {
        *self
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    fn power_on(&self) -> DriverResult<()> {
        info!("Powering on controller");
        self.clear_pairing();
        self.send(HciCommand::Reset)?;
        self.send(HciCommand::WriteSimplePairingMode(true))?;
        self.send(HciCommand::WriteLocalName(self.gap.local_name.clone()))?;
        self.send(HciCommand::WriteClassOfDevice(self.gap.class_of_device))?;
        self.send(HciCommand::ReadLocalVersionInformation)
    }

    fn power_off(&self) {
        info!("Powering off controller");
        self.clear_pairing();
        if let Err(e) = self.send(HciCommand::WriteScanEnable(scan_enable::NONE)) {
            debug!("Scan disable on power off failed: {}", e);
        }
    }

    fn start_inquiry(&self, params: &InquiryParams) -> DriverResult<()> {
        self.send(HciCommand::Inquiry {
            lap: params.lap,
            length: params.length,
            num_responses: params.max_responses,
        })
    }

    fn stop_inquiry(&self) -> DriverResult<()> {
        self.send(HciCommand::InquiryCancel)
    }

    fn set_discoverable(&self, enabled: bool) -> DriverResult<()> {
        let mode = if enabled {
            scan_enable::INQUIRY_AND_PAGE
        } else {
            scan_enable::PAGE_ONLY
        };
        self.send(HciCommand::WriteScanEnable(mode))
    }

    fn request_pairing(&self, address: BdAddr, level: ProtectionLevel) -> DriverResult<()> {
        *self
            .pairing
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(PendingPairing {
            address,
            level,
            handle: None,
        });

        let result = self.send(HciCommand::CreateConnection(address));
        if result.is_err() {
            self.clear_pairing();
        }
        result
    }

    fn process_inbound(&self, packet: &HciPacket) {
        if packet.packet_type == packet_types::EVENT {
            match HciEvent::parse(&packet.payload) {
                Ok(event) => self.advance_pairing(&event),
                Err(e) => trace!("Stack could not parse event: {}", e),
            }
        }

        let handler = self
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match handler {
            Some(handler) => handler(packet.packet_type, packet.channel, &packet.payload),
            None => trace!("No packet handler registered, dropping packet"),
        }
    }
}
