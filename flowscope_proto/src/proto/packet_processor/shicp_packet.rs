//! Secure Host IP Configuration Protocol: discovery and addressing of embedded modules by MAC.
//! Stateless. The header check is strict enough to serve as the heuristic on unclaimed UDP ports.

use super::includes::*;
use crate::constants::{SHICP_HEADER_LEN, SHICP_MAGIC, SHICP_VERSION};
use packed_struct::derive::PrimitiveEnum_u8;
use packed_struct::PrimitiveEnum;
use zerocopy::byteorder::big_endian;
use zerocopy::{FromBytes, FromZeroes, Ref, Unaligned};

#[derive(Debug, FromZeroes, FromBytes, Unaligned)]
#[repr(C)]
pub struct ShicpHeader {
    pub magic: big_endian::U16,
    pub version: u8,
    pub dst: [u8; 6],
    pub src: [u8; 6],
    pub flags: u8,
    pub msg_type: u8,
}

pub const FLAG_ERROR: u8 = 0x80;
pub const FLAG_FRAGMENT: u8 = 0x40;
pub const FLAG_RESPONSE: u8 = 0x01;

#[derive(Debug, Copy, Clone, Eq, PartialEq, PrimitiveEnum_u8, strum::Display)]
pub enum ShicpMessage {
    Discover = 0,
    Configure = 1,
    Wink = 2,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, PrimitiveEnum_u8, strum::Display)]
#[strum(serialize_all = "title_case")]
pub enum ShicpTag {
    ModuleId = 0x01,
    ModuleVersion = 0x02,
    ModuleDescription = 0x03,
    SupportedMessages = 0x04,
    IpAddress = 0x05,
    SubnetMask = 0x06,
    Gateway = 0x07,
    DnsServer = 0x08,
    Dhcp = 0x09,
    Hostname = 0x0A,
    RestartRequired = 0x0B,
}

/// Whether `bytes` carry a SHICP header. A source MAC with the group bit set never belongs to a
/// module, which weeds out datagrams that only share the magic
pub fn looks_like_shicp(bytes: &[u8]) -> bool {
    let Some((header, _)) = Ref::<_, ShicpHeader>::new_from_prefix(bytes) else {
        return false;
    };

    header.magic.get() == SHICP_MAGIC
        && header.version == SHICP_VERSION
        && header.src[0] & 0x01 == 0
        && ShicpMessage::from_primitive(header.msg_type).is_some()
}

fn mac_string(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

pub struct ShicpDissector;

impl Dissector for ShicpDissector {
    fn protocol(&self) -> ProtocolId {
        ProtocolId::Shicp
    }

    fn heuristic(&self, _session: &AnalysisSession, _ctx: &PacketContext, data: &[u8]) -> bool {
        looks_like_shicp(data)
    }

    fn dissect(
        &self,
        _session: &mut AnalysisSession,
        _ctx: &PacketContext,
        data: &[u8],
        tree: &mut ProtoTree,
    ) -> Result<usize, DissectError> {
        let (header, _) = Ref::<_, ShicpHeader>::new_from_prefix(data).ok_or(
            DissectError::Truncated {
                offset: 0,
                needed: SHICP_HEADER_LEN,
                available: data.len(),
            },
        )?;

        tree.field("shicp.magic", 0..2, header.magic.get())
            .field("shicp.version", 2..3, header.version)
            .field("shicp.dst", 3..9, header.dst)
            .field("shicp.src", 9..15, header.src)
            .field("shicp.flags", 15..16, header.flags)
            .field("shicp.msgtype", 16..17, header.msg_type);

        if header.magic.get() != SHICP_MAGIC {
            return Err(DissectError::InvalidPacket("Bad SHICP magic"));
        }

        if header.version != SHICP_VERSION {
            tree.expert(
                Severity::Warn,
                ExpertGroup::Protocol,
                2..3,
                format!("Unsupported SHICP version {}", header.version),
            );
        }

        let response = header.flags & FLAG_RESPONSE != 0;
        if header.flags & FLAG_ERROR != 0 {
            tree.expert(Severity::Warn, ExpertGroup::Protocol, 15..16, "Module reported an error");
        }
        if header.flags & FLAG_FRAGMENT != 0 {
            tree.text(15..16, "Fragmented");
        }

        let Some(message) = ShicpMessage::from_primitive(header.msg_type) else {
            tree.info(format!("Unknown message type {}", header.msg_type))
                .expert(
                    Severity::Note,
                    ExpertGroup::Undecoded,
                    16..17,
                    format!("SHICP message type {} is not implemented", header.msg_type),
                )
                .undecoded(data, SHICP_HEADER_LEN, "shicp.data");
            return Ok(data.len());
        };

        let kind = if response { "response" } else { "request" };
        tree.text(16..17, message.to_string()).info(format!(
            "{message} {kind} {} -> {}",
            mac_string(&header.src),
            mac_string(&header.dst)
        ));

        match (message, response) {
            (ShicpMessage::Wink, _) | (ShicpMessage::Discover, false) => {
                if data.len() > SHICP_HEADER_LEN {
                    tree.undecoded(data, SHICP_HEADER_LEN, "shicp.data");
                }
            }
            _ => render_tlvs(data, SHICP_HEADER_LEN, tree),
        }

        Ok(data.len())
    }
}

/// `[tag:1][len:1][value:len]` until the end of the datagram
fn render_tlvs(data: &[u8], mut offset: usize, tree: &mut ProtoTree) {
    let view = ByteView::new(data);
    while offset < data.len() {
        let (Ok(tag), Ok(len)) = (view.u8(offset), view.u8(offset + 1)) else {
            tree.expert(
                Severity::Warn,
                ExpertGroup::Malformed,
                offset..data.len(),
                "Truncated SHICP option header",
            );
            return;
        };

        let start = offset + 2;
        let len = len as usize;
        let Ok(value) = view.slice(start, len) else {
            tree.expert(
                Severity::Warn,
                ExpertGroup::Malformed,
                offset..data.len(),
                format!("SHICP option {tag} overruns the datagram"),
            );
            return;
        };

        let range = start..start + len;
        let value_view = ByteView::new(value);
        match ShicpTag::from_primitive(tag) {
            Some(ShicpTag::ModuleId) if len == 2 => {
                tree.field("shicp.module_id", range, u16::from_be_bytes([value[0], value[1]]));
            }
            Some(ShicpTag::ModuleVersion) => {
                tree.field("shicp.module_version", range, String::from_utf8_lossy(value).to_string());
            }
            Some(ShicpTag::ModuleDescription) => {
                tree.field("shicp.module_desc", range, String::from_utf8_lossy(value).to_string());
            }
            Some(ShicpTag::Hostname) => {
                tree.field("shicp.hostname", range, String::from_utf8_lossy(value).to_string());
            }
            Some(ShicpTag::SupportedMessages) if len == 1 => {
                tree.field("shicp.supported_msgs", range, value[0]);
            }
            Some(ShicpTag::Dhcp) if len == 1 => {
                tree.field("shicp.dhcp", range, value[0] != 0);
            }
            Some(ShicpTag::RestartRequired) if len == 1 => {
                tree.field("shicp.restart", range, value[0] != 0);
            }
            Some(
                tag @ (ShicpTag::IpAddress
                | ShicpTag::SubnetMask
                | ShicpTag::Gateway
                | ShicpTag::DnsServer),
            ) if len == 4 => {
                let field = match tag {
                    ShicpTag::IpAddress => "shicp.ip",
                    ShicpTag::SubnetMask => "shicp.subnet",
                    ShicpTag::Gateway => "shicp.gateway",
                    _ => "shicp.dns",
                };
                if let Ok(addr) = value_view.ipv4(0) {
                    tree.field(field, range, addr);
                }
            }
            Some(tag) => {
                tree.expert(
                    Severity::Warn,
                    ExpertGroup::Malformed,
                    offset..start + len,
                    format!("{tag} option has unexpected length {len}"),
                );
            }
            None => {
                tree.field("shicp.option", range.clone(), value).expert(
                    Severity::Note,
                    ExpertGroup::Undecoded,
                    range,
                    format!("Unknown SHICP option {tag}"),
                );
            }
        }

        offset = start + len;
    }
}
