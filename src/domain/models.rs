use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Bluetooth device address (6 bytes, most significant first)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BdAddr(pub [u8; 6]);

impl BdAddr {
    pub fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Build an address from the low 48 bits of an integer
    pub fn from_u64(value: u64) -> Self {
        let be = value.to_be_bytes();
        let mut bytes = [0u8; 6];
        bytes.copy_from_slice(&be[2..8]);
        Self(bytes)
    }

    pub fn to_u64(&self) -> u64 {
        self.0.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64)
    }

    /// Read an address in HCI wire order (little-endian)
    pub fn from_le_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 6 {
            return None;
        }
        let mut out = [0u8; 6];
        for (i, b) in bytes[..6].iter().rev().enumerate() {
            out[i] = *b;
        }
        Some(Self(out))
    }

    /// Address in HCI wire order (little-endian)
    pub fn to_le_bytes(&self) -> [u8; 6] {
        let mut out = self.0;
        out.reverse();
        out
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid Bluetooth address: {0}")]
pub struct ParseAddrError(pub String);

impl FromStr for BdAddr {
    type Err = ParseAddrError;

    /// Parse "AA:BB:CC:DD:EE:FF"
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(ParseAddrError(s.to_string()));
        }

        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 {
                return Err(ParseAddrError(s.to_string()));
            }
            bytes[i] = u8::from_str_radix(part, 16).map_err(|_| ParseAddrError(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

/// Required pairing security strength, 0 (weakest) to 4
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct ProtectionLevel(u8);

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Protection level {0} out of range (0..={max})", max = ProtectionLevel::MAX.0)]
pub struct InvalidProtectionLevel(pub u8);

impl ProtectionLevel {
    /// No security
    pub const LEVEL_0: Self = Self(0);
    /// No authentication, no encryption
    pub const LEVEL_1: Self = Self(1);
    /// Unauthenticated pairing with encryption
    pub const LEVEL_2: Self = Self(2);
    /// Authenticated (MITM protected) pairing
    pub const LEVEL_3: Self = Self(3);
    /// Authenticated pairing with secure connections
    pub const LEVEL_4: Self = Self(4);

    pub const MAX: Self = Self::LEVEL_4;

    pub fn value(&self) -> u8 {
        self.0
    }

    /// Levels 3 and above require man-in-the-middle protection
    pub fn requires_authentication(&self) -> bool {
        *self >= Self::LEVEL_3
    }
}

impl TryFrom<u8> for ProtectionLevel {
    type Error = InvalidProtectionLevel;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        if level <= Self::MAX.0 {
            Ok(Self(level))
        } else {
            Err(InvalidProtectionLevel(level))
        }
    }
}

impl From<ProtectionLevel> for u8 {
    fn from(level: ProtectionLevel) -> Self {
        level.0
    }
}

/// A peer found during inquiry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub address: BdAddr,
    /// 24-bit class of device
    pub class_of_device: u32,
    /// Signal strength in dBm (not reported by plain inquiry results)
    pub rssi: Option<i8>,
    /// Name from extended inquiry response data
    pub name: Option<String>,
}

/// Local controller version information, captured during bring-up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerInfo {
    pub hci_version: u8,
    pub hci_revision: u16,
    pub lmp_version: u8,
    pub manufacturer: u16,
    pub lmp_subversion: u16,
}

impl ControllerInfo {
    /// Company name for a few common controller vendors
    pub fn manufacturer_name(&self) -> &'static str {
        match self.manufacturer {
            0x0002 => "Intel",
            0x000A => "Qualcomm Technologies International",
            0x000D => "Texas Instruments",
            0x000F => "Broadcom",
            0x001D => "Qualcomm",
            0x0046 => "MediaTek",
            0x0059 => "Nordic Semiconductor",
            0x005D => "Realtek",
            0x0131 => "Cypress Semiconductor",
            _ => "Unknown",
        }
    }
}

/// Driver lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Initialized,
    Running,
    Stopped,
}

/// GAP discovery-class state. Visibility is tracked separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapState {
    Idle,
    Scanning,
    Pairing(BdAddr),
}

/// Items published on the GAP result channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GapNotification {
    DeviceFound(DiscoveredDevice),
    /// Inquiry ended on its own
    ScanFinished,
    /// Pairing with this peer succeeded
    Paired(BdAddr),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_formats() {
        let addr = BdAddr::from_u64(0xAABBCCDDEEFF);
        assert_eq!(addr.to_string(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(addr.to_u64(), 0xAABBCCDDEEFF);
        assert_eq!("AA:BB:CC:DD:EE:FF".parse::<BdAddr>().unwrap(), addr);
        assert_eq!(addr.to_le_bytes(), [0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(BdAddr::from_le_slice(&addr.to_le_bytes()), Some(addr));
    }

    #[test]
    fn test_address_parse_errors() {
        assert!("AA:BB:CC".parse::<BdAddr>().is_err());
        assert!("AA:BB:CC:DD:EE:GG".parse::<BdAddr>().is_err());
        assert!("AAA:BB:CC:DD:EE:F".parse::<BdAddr>().is_err());
        assert_eq!(BdAddr::from_le_slice(&[1, 2, 3]), None);
    }

    #[test]
    fn test_protection_level_default_is_weakest() {
        assert_eq!(ProtectionLevel::default(), ProtectionLevel::LEVEL_0);
        assert!(!ProtectionLevel::LEVEL_2.requires_authentication());
        assert!(ProtectionLevel::LEVEL_3.requires_authentication());
    }

    #[test]
    fn test_protection_level_range() {
        assert_eq!(ProtectionLevel::try_from(4), Ok(ProtectionLevel::LEVEL_4));
        assert_eq!(ProtectionLevel::try_from(5), Err(InvalidProtectionLevel(5)));
        assert_eq!(u8::from(ProtectionLevel::LEVEL_2), 2);

        assert_eq!(
            serde_json::from_str::<ProtectionLevel>("3").unwrap(),
            ProtectionLevel::LEVEL_3
        );
        assert!(serde_json::from_str::<ProtectionLevel>("9").is_err());
    }
}
