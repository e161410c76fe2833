//! HCI Codec
//!
//! Packet framing (H4), command encoding and event parsing for the subset
//! of the Host Controller Interface the driver uses.
//!
//! # H4 framing
//!
//! ```text
//! [0]     : Packet indicator (0x01 command, 0x02 ACL, 0x03 SCO, 0x04 event, 0x05 ISO)
//! [1..]   : Packet header, then payload
//!
//! Command : opcode (u16 LE), parameter length (u8)
//! ACL     : handle + flags (u16 LE), data length (u16 LE)
//! SCO     : handle + flags (u16 LE), data length (u8)
//! Event   : event code (u8), parameter length (u8)
//! ISO     : handle + flags (u16 LE), data length (u16 LE, 14 bits)
//! ```

use crate::domain::models::{BdAddr, ControllerInfo, DiscoveredDevice};
use thiserror::Error;
use tracing::{trace, warn};

/// HCI packet types (H4 indicators)
pub mod packet_types {
    pub const COMMAND: u8 = 0x01;
    pub const ACL_DATA: u8 = 0x02;
    pub const SCO_DATA: u8 = 0x03;
    pub const EVENT: u8 = 0x04;
    pub const ISO_DATA: u8 = 0x05;
}

/// HCI event codes
pub mod events {
    pub const INQUIRY_COMPLETE: u8 = 0x01;
    pub const INQUIRY_RESULT: u8 = 0x02;
    pub const CONNECTION_COMPLETE: u8 = 0x03;
    pub const DISCONNECTION_COMPLETE: u8 = 0x05;
    pub const AUTHENTICATION_COMPLETE: u8 = 0x06;
    pub const COMMAND_COMPLETE: u8 = 0x0E;
    pub const COMMAND_STATUS: u8 = 0x0F;
    pub const HARDWARE_ERROR: u8 = 0x10;
    pub const LINK_KEY_REQUEST: u8 = 0x17;
    pub const INQUIRY_RESULT_WITH_RSSI: u8 = 0x22;
    pub const EXTENDED_INQUIRY_RESULT: u8 = 0x2F;
    pub const IO_CAPABILITY_REQUEST: u8 = 0x31;
    pub const USER_CONFIRMATION_REQUEST: u8 = 0x33;
    pub const SIMPLE_PAIRING_COMPLETE: u8 = 0x36;
    pub const LE_META_EVENT: u8 = 0x3E;
}

/// HCI status codes
pub mod status {
    pub const SUCCESS: u8 = 0x00;
    pub const UNKNOWN_HCI_COMMAND: u8 = 0x01;
    pub const PAGE_TIMEOUT: u8 = 0x04;
    pub const AUTHENTICATION_FAILURE: u8 = 0x05;
    pub const PIN_OR_KEY_MISSING: u8 = 0x06;
    pub const MEMORY_CAPACITY_EXCEEDED: u8 = 0x07;
    pub const CONNECTION_TIMEOUT: u8 = 0x08;
    pub const CONNECTION_LIMIT_EXCEEDED: u8 = 0x09;
    pub const CONNECTION_ALREADY_EXISTS: u8 = 0x0B;
    pub const COMMAND_DISALLOWED: u8 = 0x0C;
    pub const CONNECTION_REJECTED_LIMITED_RESOURCES: u8 = 0x0D;
    pub const CONNECTION_REJECTED_SECURITY_REASONS: u8 = 0x0E;
    pub const CONNECTION_REJECTED_UNACCEPTABLE_BD_ADDR: u8 = 0x0F;
    pub const CONNECTION_ACCEPT_TIMEOUT_EXCEEDED: u8 = 0x10;
    pub const UNSUPPORTED_FEATURE_OR_PARAMETER: u8 = 0x11;
    pub const INVALID_HCI_COMMAND_PARAMETERS: u8 = 0x12;
    pub const REMOTE_USER_TERMINATED_CONNECTION: u8 = 0x13;
    pub const REPEATED_ATTEMPTS: u8 = 0x17;
    pub const PAIRING_NOT_ALLOWED: u8 = 0x18;
    pub const LMP_OR_LL_RESPONSE_TIMEOUT: u8 = 0x22;
    pub const PAIRING_WITH_UNIT_KEY_NOT_SUPPORTED: u8 = 0x29;
    pub const SIMPLE_PAIRING_NOT_SUPPORTED_BY_HOST: u8 = 0x37;
    pub const CONTROLLER_BUSY: u8 = 0x3A;
}

/// HCI command opcodes (OGF << 10 | OCF)
pub mod opcodes {
    // Link Control (OGF 0x01)
    pub const INQUIRY: u16 = 0x0401;
    pub const INQUIRY_CANCEL: u16 = 0x0402;
    pub const CREATE_CONNECTION: u16 = 0x0405;
    pub const LINK_KEY_REQUEST_NEGATIVE_REPLY: u16 = 0x040C;
    pub const AUTHENTICATION_REQUESTED: u16 = 0x0411;
    pub const IO_CAPABILITY_REQUEST_REPLY: u16 = 0x042B;
    pub const USER_CONFIRMATION_REQUEST_REPLY: u16 = 0x042C;
    pub const USER_CONFIRMATION_REQUEST_NEGATIVE_REPLY: u16 = 0x042D;

    // Controller & Baseband (OGF 0x03)
    pub const RESET: u16 = 0x0C03;
    pub const WRITE_LOCAL_NAME: u16 = 0x0C13;
    pub const WRITE_SCAN_ENABLE: u16 = 0x0C1A;
    pub const WRITE_CLASS_OF_DEVICE: u16 = 0x0C24;
    pub const WRITE_SIMPLE_PAIRING_MODE: u16 = 0x0C56;

    // Informational (OGF 0x04)
    pub const READ_LOCAL_VERSION_INFORMATION: u16 = 0x1001;
}

/// Write Scan Enable values
pub mod scan_enable {
    pub const NONE: u8 = 0x00;
    pub const PAGE_ONLY: u8 = 0x02;
    pub const INQUIRY_AND_PAGE: u8 = 0x03;
}

/// General Inquiry Access Code
pub const LAP_GIAC: u32 = 0x9E8B33;

/// Local name field length in Write Local Name
const LOCAL_NAME_LEN: usize = 248;

/// EIR data types carrying the device name
const EIR_SHORTENED_LOCAL_NAME: u8 = 0x08;
const EIR_COMPLETE_LOCAL_NAME: u8 = 0x09;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HciError {
    #[error("Packet truncated ({actual} < {expected})")]
    Truncated { expected: usize, actual: usize },

    #[error("Unknown packet type {0:#04X}")]
    UnknownPacketType(u8),

    #[error("Not a {0} packet")]
    WrongPacketType(&'static str),
}

/// One inbound or outbound HCI packet without the H4 indicator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HciPacket {
    pub packet_type: u8,
    /// Connection handle for data packets, 0 for events
    pub channel: u16,
    /// Header and payload
    pub payload: Vec<u8>,
}

impl HciPacket {
    /// Build an event packet from its code and parameters
    pub fn event(code: u8, params: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(params.len() + 2);
        payload.push(code);
        payload.push(params.len() as u8);
        payload.extend_from_slice(params);
        Self {
            packet_type: packet_types::EVENT,
            channel: 0,
            payload,
        }
    }

    /// H4 frame for this packet
    pub fn to_h4(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(self.payload.len() + 1);
        frame.push(self.packet_type);
        frame.extend_from_slice(&self.payload);
        frame
    }
}

/// Header length following the H4 indicator, by packet type
fn header_len(packet_type: u8) -> Option<usize> {
    match packet_type {
        packet_types::COMMAND => Some(3),
        packet_types::ACL_DATA => Some(4),
        packet_types::SCO_DATA => Some(3),
        packet_types::EVENT => Some(2),
        packet_types::ISO_DATA => Some(4),
        _ => None,
    }
}

/// Payload length announced by a complete header
fn payload_len(packet_type: u8, header: &[u8]) -> usize {
    match packet_type {
        packet_types::COMMAND => header[2] as usize,
        packet_types::ACL_DATA => u16::from_le_bytes([header[2], header[3]]) as usize,
        packet_types::SCO_DATA => header[2] as usize,
        packet_types::EVENT => header[1] as usize,
        packet_types::ISO_DATA => (u16::from_le_bytes([header[2], header[3]]) & 0x3FFF) as usize,
        _ => 0,
    }
}

/// Incremental H4 stream decoder
///
/// Bytes can arrive in arbitrary chunks; complete packets are returned as
/// soon as they are buffered. Bytes that cannot start a packet are skipped.
#[derive(Debug, Default)]
pub struct H4Decoder {
    buffer: Vec<u8>,
}

impl H4Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes waiting for the rest of their packet
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<HciPacket> {
        self.buffer.extend_from_slice(bytes);
        let mut packets = Vec::new();

        loop {
            let Some(&packet_type) = self.buffer.first() else {
                break;
            };

            let Some(hdr) = header_len(packet_type) else {
                warn!("Dropping byte with unknown H4 indicator {:#04X}", packet_type);
                self.buffer.remove(0);
                continue;
            };

            if self.buffer.len() < 1 + hdr {
                break;
            }

            let header = &self.buffer[1..1 + hdr];
            let total = 1 + hdr + payload_len(packet_type, header);
            if self.buffer.len() < total {
                break;
            }

            let channel = match packet_type {
                packet_types::ACL_DATA | packet_types::SCO_DATA | packet_types::ISO_DATA => {
                    u16::from_le_bytes([header[0], header[1]]) & 0x0FFF
                }
                _ => 0,
            };

            let frame: Vec<u8> = self.buffer.drain(..total).collect();
            trace!("H4 packet: {:02X?}", &frame);
            packets.push(HciPacket {
                packet_type,
                channel,
                payload: frame[1..].to_vec(),
            });
        }

        packets
    }
}

/// Commands issued by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HciCommand {
    Reset,
    ReadLocalVersionInformation,
    WriteLocalName(String),
    WriteClassOfDevice(u32),
    WriteSimplePairingMode(bool),
    WriteScanEnable(u8),
    Inquiry {
        lap: u32,
        length: u8,
        num_responses: u8,
    },
    InquiryCancel,
    CreateConnection(BdAddr),
    AuthenticationRequested(u16),
    LinkKeyRequestNegativeReply(BdAddr),
    IoCapabilityRequestReply {
        address: BdAddr,
        io_capability: u8,
        oob_data_present: bool,
        authentication_requirements: u8,
    },
    UserConfirmationRequestReply(BdAddr),
    UserConfirmationRequestNegativeReply(BdAddr),
}

impl HciCommand {
    pub fn opcode(&self) -> u16 {
        match self {
            Self::Reset => opcodes::RESET,
            Self::ReadLocalVersionInformation => opcodes::READ_LOCAL_VERSION_INFORMATION,
            Self::WriteLocalName(_) => opcodes::WRITE_LOCAL_NAME,
            Self::WriteClassOfDevice(_) => opcodes::WRITE_CLASS_OF_DEVICE,
            Self::WriteSimplePairingMode(_) => opcodes::WRITE_SIMPLE_PAIRING_MODE,
            Self::WriteScanEnable(_) => opcodes::WRITE_SCAN_ENABLE,
            Self::Inquiry { .. } => opcodes::INQUIRY,
            Self::InquiryCancel => opcodes::INQUIRY_CANCEL,
            Self::CreateConnection(_) => opcodes::CREATE_CONNECTION,
            Self::AuthenticationRequested(_) => opcodes::AUTHENTICATION_REQUESTED,
            Self::LinkKeyRequestNegativeReply(_) => opcodes::LINK_KEY_REQUEST_NEGATIVE_REPLY,
            Self::IoCapabilityRequestReply { .. } => opcodes::IO_CAPABILITY_REQUEST_REPLY,
            Self::UserConfirmationRequestReply(_) => opcodes::USER_CONFIRMATION_REQUEST_REPLY,
            Self::UserConfirmationRequestNegativeReply(_) => {
                opcodes::USER_CONFIRMATION_REQUEST_NEGATIVE_REPLY
            }
        }
    }

    fn parameters(&self) -> Vec<u8> {
        match self {
            Self::Reset | Self::ReadLocalVersionInformation | Self::InquiryCancel => Vec::new(),
            Self::WriteLocalName(name) => {
                let mut params = vec![0u8; LOCAL_NAME_LEN];
                let bytes = name.as_bytes();
                // Always keep a terminating NUL
                let len = bytes.len().min(LOCAL_NAME_LEN - 1);
                params[..len].copy_from_slice(&bytes[..len]);
                params
            }
            Self::WriteClassOfDevice(class) => class.to_le_bytes()[..3].to_vec(),
            Self::WriteSimplePairingMode(enabled) => vec![*enabled as u8],
            Self::WriteScanEnable(mode) => vec![*mode],
            Self::Inquiry {
                lap,
                length,
                num_responses,
            } => {
                let mut params = lap.to_le_bytes()[..3].to_vec();
                params.push(*length);
                params.push(*num_responses);
                params
            }
            Self::CreateConnection(address) => {
                let mut params = address.to_le_bytes().to_vec();
                // DM1/DH1/DM3/DH3/DM5/DH5 packet types
                params.extend_from_slice(&0xCC18u16.to_le_bytes());
                // Page scan repetition mode R1, reserved
                params.extend_from_slice(&[0x01, 0x00]);
                // Clock offset unknown
                params.extend_from_slice(&[0x00, 0x00]);
                // Allow role switch
                params.push(0x01);
                params
            }
            Self::AuthenticationRequested(handle) => handle.to_le_bytes().to_vec(),
            Self::IoCapabilityRequestReply {
                address,
                io_capability,
                oob_data_present,
                authentication_requirements,
            } => {
                let mut params = address.to_le_bytes().to_vec();
                params.push(*io_capability);
                params.push(*oob_data_present as u8);
                params.push(*authentication_requirements);
                params
            }
            Self::LinkKeyRequestNegativeReply(address)
            | Self::UserConfirmationRequestReply(address)
            | Self::UserConfirmationRequestNegativeReply(address) => address.to_le_bytes().to_vec(),
        }
    }

    /// H4 command frame
    pub fn encode(&self) -> Vec<u8> {
        let params = self.parameters();
        let mut frame = Vec::with_capacity(params.len() + 4);
        frame.push(packet_types::COMMAND);
        frame.extend_from_slice(&self.opcode().to_le_bytes());
        frame.push(params.len() as u8);
        frame.extend_from_slice(&params);
        frame
    }
}

/// Split an H4 command frame into opcode and parameters
pub fn parse_command_frame(frame: &[u8]) -> Result<(u16, &[u8]), HciError> {
    if frame.len() < 4 {
        return Err(HciError::Truncated {
            expected: 4,
            actual: frame.len(),
        });
    }
    if frame[0] != packet_types::COMMAND {
        return Err(HciError::WrongPacketType("command"));
    }

    let opcode = u16::from_le_bytes([frame[1], frame[2]]);
    let len = frame[3] as usize;
    if frame.len() < 4 + len {
        return Err(HciError::Truncated {
            expected: 4 + len,
            actual: frame.len(),
        });
    }
    Ok((opcode, &frame[4..4 + len]))
}

/// Events the driver understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HciEvent {
    InquiryComplete {
        status: u8,
    },
    InquiryResult(Vec<DiscoveredDevice>),
    ConnectionComplete {
        status: u8,
        handle: u16,
        address: BdAddr,
    },
    AuthenticationComplete {
        status: u8,
        handle: u16,
    },
    CommandComplete {
        opcode: u16,
        return_parameters: Vec<u8>,
    },
    CommandStatus {
        status: u8,
        opcode: u16,
    },
    HardwareError {
        code: u8,
    },
    LinkKeyRequest {
        address: BdAddr,
    },
    IoCapabilityRequest {
        address: BdAddr,
    },
    UserConfirmationRequest {
        address: BdAddr,
        numeric_value: u32,
    },
    SimplePairingComplete {
        status: u8,
        address: BdAddr,
    },
    Other {
        code: u8,
    },
}

fn require(params: &[u8], expected: usize) -> Result<(), HciError> {
    if params.len() < expected {
        Err(HciError::Truncated {
            expected,
            actual: params.len(),
        })
    } else {
        Ok(())
    }
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u24(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], 0])
}

fn address_at(bytes: &[u8], at: usize) -> BdAddr {
    BdAddr::from_le_slice(&bytes[at..at + 6]).unwrap_or_default()
}

impl HciEvent {
    /// Parse an event packet (`[code, length, parameters...]`)
    pub fn parse(packet: &[u8]) -> Result<Self, HciError> {
        require(packet, 2)?;
        let code = packet[0];
        let len = packet[1] as usize;
        require(packet, 2 + len)?;
        let p = &packet[2..2 + len];

        let event = match code {
            events::INQUIRY_COMPLETE => {
                require(p, 1)?;
                Self::InquiryComplete { status: p[0] }
            }
            events::INQUIRY_RESULT => Self::InquiryResult(parse_inquiry_results(p, false)?),
            events::INQUIRY_RESULT_WITH_RSSI => {
                Self::InquiryResult(parse_inquiry_results(p, true)?)
            }
            events::EXTENDED_INQUIRY_RESULT => {
                // Num_Responses (always 1), BD_ADDR, Page_Scan_Repetition_Mode,
                // Reserved, Class_Of_Device, Clock_Offset, RSSI, EIR data
                require(p, 15)?;
                let device = DiscoveredDevice {
                    address: address_at(p, 1),
                    class_of_device: read_u24(p, 9),
                    rssi: Some(p[14] as i8),
                    name: parse_eir_name(&p[15..]),
                };
                Self::InquiryResult(vec![device])
            }
            events::CONNECTION_COMPLETE => {
                require(p, 9)?;
                Self::ConnectionComplete {
                    status: p[0],
                    handle: read_u16(p, 1) & 0x0FFF,
                    address: address_at(p, 3),
                }
            }
            events::AUTHENTICATION_COMPLETE => {
                require(p, 3)?;
                Self::AuthenticationComplete {
                    status: p[0],
                    handle: read_u16(p, 1) & 0x0FFF,
                }
            }
            events::COMMAND_COMPLETE => {
                require(p, 3)?;
                Self::CommandComplete {
                    opcode: read_u16(p, 1),
                    return_parameters: p[3..].to_vec(),
                }
            }
            events::COMMAND_STATUS => {
                require(p, 4)?;
                Self::CommandStatus {
                    status: p[0],
                    opcode: read_u16(p, 2),
                }
            }
            events::HARDWARE_ERROR => {
                require(p, 1)?;
                Self::HardwareError { code: p[0] }
            }
            events::LINK_KEY_REQUEST => {
                require(p, 6)?;
                Self::LinkKeyRequest {
                    address: address_at(p, 0),
                }
            }
            events::IO_CAPABILITY_REQUEST => {
                require(p, 6)?;
                Self::IoCapabilityRequest {
                    address: address_at(p, 0),
                }
            }
            events::USER_CONFIRMATION_REQUEST => {
                require(p, 10)?;
                Self::UserConfirmationRequest {
                    address: address_at(p, 0),
                    numeric_value: u32::from_le_bytes([p[6], p[7], p[8], p[9]]),
                }
            }
            events::SIMPLE_PAIRING_COMPLETE => {
                require(p, 7)?;
                Self::SimplePairingComplete {
                    status: p[0],
                    address: address_at(p, 1),
                }
            }
            code => Self::Other { code },
        };

        Ok(event)
    }
}

/// Inquiry Result / Inquiry Result with RSSI: 14 bytes per response
fn parse_inquiry_results(p: &[u8], with_rssi: bool) -> Result<Vec<DiscoveredDevice>, HciError> {
    const ENTRY_LEN: usize = 14;

    require(p, 1)?;
    let count = p[0] as usize;
    require(p, 1 + count * ENTRY_LEN)?;

    let devices = p[1..1 + count * ENTRY_LEN]
        .chunks_exact(ENTRY_LEN)
        .map(|entry| {
            // With RSSI: addr(6) pscan_rep(1) reserved(1) class(3) clock(2) rssi(1)
            // Plain:     addr(6) pscan_rep(1) reserved(2) class(3) clock(2)
            let (class_at, rssi) = if with_rssi {
                (8, Some(entry[13] as i8))
            } else {
                (9, None)
            };
            DiscoveredDevice {
                address: address_at(entry, 0),
                class_of_device: read_u24(entry, class_at),
                rssi,
                name: None,
            }
        })
        .collect();

    Ok(devices)
}

/// Extract the (complete, else shortened) local name from EIR data
pub fn parse_eir_name(eir: &[u8]) -> Option<String> {
    let mut shortened = None;
    let mut offset = 0;

    while offset < eir.len() {
        let len = eir[offset] as usize;
        if len == 0 || offset + 1 + len > eir.len() {
            break;
        }
        let data_type = eir[offset + 1];
        let data = &eir[offset + 2..offset + 1 + len];

        match data_type {
            EIR_COMPLETE_LOCAL_NAME => return Some(String::from_utf8_lossy(data).into_owned()),
            EIR_SHORTENED_LOCAL_NAME => {
                shortened = Some(String::from_utf8_lossy(data).into_owned())
            }
            _ => {}
        }
        offset += 1 + len;
    }

    shortened
}

/// Parse Read Local Version Information return parameters
pub fn parse_local_version(return_parameters: &[u8]) -> Result<(u8, ControllerInfo), HciError> {
    require(return_parameters, 9)?;
    let r = return_parameters;
    Ok((
        r[0],
        ControllerInfo {
            hci_version: r[1],
            hci_revision: read_u16(r, 2),
            lmp_version: r[4],
            manufacturer: read_u16(r, 5),
            lmp_subversion: read_u16(r, 7),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eir_name(name: &str) -> Vec<u8> {
        let mut eir = vec![name.len() as u8 + 1, EIR_COMPLETE_LOCAL_NAME];
        eir.extend_from_slice(name.as_bytes());
        eir
    }

    #[test]
    fn test_h4_decoder_handles_split_reads() {
        let frame = HciPacket::event(events::INQUIRY_COMPLETE, &[0x00]).to_h4();
        let mut decoder = H4Decoder::new();

        assert!(decoder.push(&frame[..2]).is_empty());
        assert_eq!(decoder.pending(), 2);

        let packets = decoder.push(&frame[2..]);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].packet_type, packet_types::EVENT);
        assert_eq!(packets[0].payload, vec![events::INQUIRY_COMPLETE, 1, 0]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_h4_decoder_multiple_packets_and_garbage() {
        let mut stream = vec![0xFF];
        stream.extend(HciPacket::event(events::HARDWARE_ERROR, &[0x01]).to_h4());
        // ACL on handle 0x0042 with 2 bytes of data
        stream.extend_from_slice(&[0x02, 0x42, 0x20, 0x02, 0x00, 0xAA, 0xBB]);

        let packets = H4Decoder::new().push(&stream);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].packet_type, packet_types::EVENT);
        assert_eq!(packets[1].packet_type, packet_types::ACL_DATA);
        assert_eq!(packets[1].channel, 0x0042);
    }

    #[test]
    fn test_command_encoding() {
        let frame = HciCommand::Inquiry {
            lap: LAP_GIAC,
            length: 5,
            num_responses: 0,
        }
        .encode();
        assert_eq!(frame, vec![0x01, 0x01, 0x04, 0x05, 0x33, 0x8B, 0x9E, 0x05, 0x00]);

        let (opcode, params) = parse_command_frame(&frame).unwrap();
        assert_eq!(opcode, opcodes::INQUIRY);
        assert_eq!(params.len(), 5);

        let frame = HciCommand::WriteLocalName("Phone".to_string()).encode();
        assert_eq!(frame.len(), 4 + 248);
        assert_eq!(&frame[4..9], b"Phone");
        assert_eq!(frame[9], 0);
    }

    #[test]
    fn test_create_connection_uses_wire_order() {
        let addr = BdAddr::from_u64(0xAABBCCDDEEFF);
        let frame = HciCommand::CreateConnection(addr).encode();
        let (opcode, params) = parse_command_frame(&frame).unwrap();
        assert_eq!(opcode, opcodes::CREATE_CONNECTION);
        assert_eq!(params.len(), 13);
        assert_eq!(BdAddr::from_le_slice(params), Some(addr));
    }

    #[test]
    fn test_link_key_request_and_negative_replies() {
        let addr = BdAddr::from_u64(0x001122334455);
        let packet = HciPacket::event(events::LINK_KEY_REQUEST, &addr.to_le_bytes());
        assert_eq!(
            HciEvent::parse(&packet.payload),
            Ok(HciEvent::LinkKeyRequest { address: addr })
        );

        let frame = HciCommand::LinkKeyRequestNegativeReply(addr).encode();
        let (opcode, params) = parse_command_frame(&frame).unwrap();
        assert_eq!(opcode, opcodes::LINK_KEY_REQUEST_NEGATIVE_REPLY);
        assert_eq!(BdAddr::from_le_slice(params), Some(addr));

        let frame = HciCommand::UserConfirmationRequestNegativeReply(addr).encode();
        assert_eq!(
            parse_command_frame(&frame).unwrap().0,
            opcodes::USER_CONFIRMATION_REQUEST_NEGATIVE_REPLY
        );
    }

    #[test]
    fn test_parse_command_frame_errors() {
        assert!(matches!(
            parse_command_frame(&[0x01, 0x03]),
            Err(HciError::Truncated { .. })
        ));
        assert_eq!(
            parse_command_frame(&[0x04, 0x0E, 0x00, 0x00]),
            Err(HciError::WrongPacketType("command"))
        );
    }

    #[test]
    fn test_parse_extended_inquiry_result() {
        let addr = BdAddr::from_u64(0x112233445566);
        let mut params = vec![0x01];
        params.extend_from_slice(&addr.to_le_bytes());
        params.extend_from_slice(&[0x01, 0x00]);
        params.extend_from_slice(&[0x0C, 0x02, 0x5A]);
        params.extend_from_slice(&[0x00, 0x00]);
        params.push((-60i8) as u8);
        params.extend(eir_name("Headset"));

        let packet = HciPacket::event(events::EXTENDED_INQUIRY_RESULT, &params);
        match HciEvent::parse(&packet.payload).unwrap() {
            HciEvent::InquiryResult(devices) => {
                assert_eq!(devices.len(), 1);
                assert_eq!(devices[0].address, addr);
                assert_eq!(devices[0].class_of_device, 0x5A020C);
                assert_eq!(devices[0].rssi, Some(-60));
                assert_eq!(devices[0].name.as_deref(), Some("Headset"));
            }
            other => panic!("Unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_parse_inquiry_result_with_rssi() {
        let addr = BdAddr::from_u64(0x0A0B0C0D0E0F);
        let mut params = vec![0x01];
        params.extend_from_slice(&addr.to_le_bytes());
        params.extend_from_slice(&[0x01, 0x00, 0x04, 0x04, 0x24, 0x00, 0x00]);
        params.push((-72i8) as u8);

        let packet = HciPacket::event(events::INQUIRY_RESULT_WITH_RSSI, &params);
        let HciEvent::InquiryResult(devices) = HciEvent::parse(&packet.payload).unwrap() else {
            panic!("Expected inquiry result");
        };
        assert_eq!(devices[0].address, addr);
        assert_eq!(devices[0].class_of_device, 0x240404);
        assert_eq!(devices[0].rssi, Some(-72));
    }

    #[test]
    fn test_parse_truncated_event() {
        let packet = HciPacket::event(events::CONNECTION_COMPLETE, &[0x00, 0x01]);
        assert!(matches!(
            HciEvent::parse(&packet.payload),
            Err(HciError::Truncated { .. })
        ));
        assert!(HciEvent::parse(&[events::COMMAND_STATUS, 4, 0]).is_err());
    }

    #[test]
    fn test_eir_prefers_complete_name() {
        let mut eir = vec![0x04, EIR_SHORTENED_LOCAL_NAME, b'S', b'p', b'k'];
        eir.extend(eir_name("Speaker"));
        assert_eq!(parse_eir_name(&eir).as_deref(), Some("Speaker"));

        let eir = vec![0x04, EIR_SHORTENED_LOCAL_NAME, b'S', b'p', b'k', 0x00];
        assert_eq!(parse_eir_name(&eir).as_deref(), Some("Spk"));
        assert_eq!(parse_eir_name(&[0x09, 0x09, b'x']), None);
    }

    #[test]
    fn test_parse_local_version() {
        let params = [0x00, 0x06, 0x34, 0x12, 0x06, 0x0D, 0x00, 0x78, 0x56];
        let (status, info) = parse_local_version(&params).unwrap();
        assert_eq!(status, 0);
        assert_eq!(info.hci_version, 6);
        assert_eq!(info.hci_revision, 0x1234);
        assert_eq!(info.manufacturer, 0x000D);
        assert_eq!(info.manufacturer_name(), "Texas Instruments");
        assert_eq!(info.lmp_subversion, 0x5678);
    }
}
