//! Analysis preferences. Every field has a default, so a partial JSON document (or none at
//! all) yields a usable configuration.
use crate::errors::Error;
use packed_struct::derive::PrimitiveEnum_u8;
use serde::{Deserialize, Serialize};

pub const DEFAULT_SOCKS_TCP_PORT: u16 = 1080;
pub const DEFAULT_XCP_PORT: u16 = 5555;
pub const DEFAULT_MSPROXY_UDP_PORT: u16 = 1745;
pub const DEFAULT_Z21_UDP_PORTS: [u16; 2] = [21105, 21106];
pub const DEFAULT_DCC_UDP_PORT: u16 = 6277;
pub const DEFAULT_SHICP_UDP_PORT: u16 = 3250;
pub const DEFAULT_MAX_DISPATCH_DEPTH: usize = 8;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct AnalysisConfig {
    pub socks: SocksPreferences,
    pub xcp: XcpPreferences,
    pub msproxy: MsProxyPreferences,
    pub z21: Z21Preferences,
    pub dcc: DccPreferences,
    pub shicp: ShicpPreferences,
    /// Upper bound on nested generic port dispatch for tunnelled payloads
    pub max_dispatch_depth: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            socks: SocksPreferences::default(),
            xcp: XcpPreferences::default(),
            msproxy: MsProxyPreferences::default(),
            z21: Z21Preferences::default(),
            dcc: DccPreferences::default(),
            shicp: ShicpPreferences::default(),
            max_dispatch_depth: DEFAULT_MAX_DISPATCH_DEPTH,
        }
    }
}

impl AnalysisConfig {
    pub fn from_json_str(input: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(input)?)
    }

    pub fn to_json_string(&self) -> Result<String, Error> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct SocksPreferences {
    pub tcp_ports: Vec<u16>,
}

impl Default for SocksPreferences {
    fn default() -> Self {
        Self {
            tcp_ports: vec![DEFAULT_SOCKS_TCP_PORT],
        }
    }
}

/// The byte order a slave announces in its CONNECT response (COMM_MODE_BASIC bit 0)
#[derive(
    Debug,
    Serialize,
    Deserialize,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Hash,
    Default,
    PrimitiveEnum_u8,
    strum::Display,
)]
pub enum XcpByteOrder {
    #[default]
    Intel = 0,
    Motorola = 1,
}

/// The size of one addressable element (COMM_MODE_BASIC bits 1..2)
#[derive(
    Debug,
    Serialize,
    Deserialize,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Hash,
    Default,
    PrimitiveEnum_u8,
    strum::Display,
)]
pub enum AddressGranularity {
    #[default]
    Byte = 0,
    Word = 1,
    DWord = 2,
}

impl AddressGranularity {
    /// Decodes the two-bit wire field. The fourth encoding is reserved
    pub fn from_wire_bits(bits: u8) -> Option<Self> {
        match bits & 0x03 {
            0 => Some(Self::Byte),
            1 => Some(Self::Word),
            2 => Some(Self::DWord),
            _ => None,
        }
    }

    /// Bytes per element
    pub fn bytes(&self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Word => 2,
            Self::DWord => 4,
        }
    }
}

/// A user-supplied label for an ECU address, attached to any ODT entry pointing at it
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AddressName {
    pub address_extension: u8,
    pub address: u32,
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct XcpPreferences {
    pub udp_ports: Vec<u16>,
    pub tcp_ports: Vec<u16>,
    /// Assumed until a CONNECT response is seen
    pub default_byte_order: XcpByteOrder,
    /// Assumed until a CONNECT response is seen
    pub default_address_granularity: AddressGranularity,
    /// Largest XCP packet accepted by the framer, excluding the 4-byte Ethernet header
    pub max_packet_len: usize,
    pub address_names: Vec<AddressName>,
}

impl Default for XcpPreferences {
    fn default() -> Self {
        Self {
            udp_ports: vec![DEFAULT_XCP_PORT],
            tcp_ports: vec![DEFAULT_XCP_PORT],
            default_byte_order: XcpByteOrder::Intel,
            default_address_granularity: AddressGranularity::Byte,
            max_packet_len: u16::MAX as usize,
            address_names: Vec::new(),
        }
    }
}

impl XcpPreferences {
    pub fn name_for(&self, address_extension: u8, address: u32) -> Option<&str> {
        self.address_names
            .iter()
            .find(|entry| entry.address_extension == address_extension && entry.address == address)
            .map(|entry| entry.name.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct MsProxyPreferences {
    pub udp_ports: Vec<u16>,
}

impl Default for MsProxyPreferences {
    fn default() -> Self {
        Self {
            udp_ports: vec![DEFAULT_MSPROXY_UDP_PORT],
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Z21Preferences {
    pub udp_ports: Vec<u16>,
}

impl Default for Z21Preferences {
    fn default() -> Self {
        Self {
            udp_ports: DEFAULT_Z21_UDP_PORTS.to_vec(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct DccPreferences {
    pub udp_ports: Vec<u16>,
}

impl Default for DccPreferences {
    fn default() -> Self {
        Self {
            udp_ports: vec![DEFAULT_DCC_UDP_PORT],
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ShicpPreferences {
    pub udp_ports: Vec<u16>,
    /// Also offer SHICP as a heuristic candidate for UDP traffic on any port
    pub heuristic: bool,
}

impl Default for ShicpPreferences {
    fn default() -> Self {
        Self {
            udp_ports: vec![DEFAULT_SHICP_UDP_PORT],
            heuristic: true,
        }
    }
}
