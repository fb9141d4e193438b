//! The UDP relay leg of a SOCKSv5 UDP ASSOCIATE. Every datagram carries a small header naming
//! the remote endpoint, followed by the payload, which is dispatched by the remote port.

use super::includes::*;
use super::socks_packet::{ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};

pub struct SocksUdpDissector;

impl Dissector for SocksUdpDissector {
    fn protocol(&self) -> ProtocolId {
        ProtocolId::SocksUdp
    }

    fn dissect(
        &self,
        session: &mut AnalysisSession,
        ctx: &PacketContext,
        data: &[u8],
        tree: &mut ProtoTree,
    ) -> Result<usize, DissectError> {
        let view = ByteView::new(data);
        let reserved = view.u16_be(0)?;
        let fragment = view.u8(2)?;
        let address_type = view.u8(3)?;

        tree.field("socks.udp.reserved", 0..2, reserved)
            .field("socks.udp.fragment", 2..3, fragment)
            .field("socks.address_type", 3..4, address_type);

        let port_at = match address_type {
            ATYP_IPV4 => {
                tree.field("socks.udp.dst_ip", 4..8, view.ipv4(4)?);
                8
            }
            ATYP_DOMAIN => {
                let len = view.u8(4)? as usize;
                tree.field("socks.udp.dst_name", 5..5 + len, view.text(5, len)?);
                5 + len
            }
            ATYP_IPV6 => {
                tree.field("socks.udp.dst_ip", 4..20, view.ipv6(4)?);
                20
            }
            _ => return Err(DissectError::InvalidPacket("Unknown SOCKS address type")),
        };

        let port = view.u16_be(port_at)?;
        let header_len = port_at + 2;
        tree.field("socks.udp.dst_port", port_at..header_len, port)
            .info(format!("UDP relay to port {port}"));

        if fragment != 0 {
            tree.expert(
                Severity::Note,
                ExpertGroup::Undecoded,
                2..3,
                format!("Fragment {fragment} of a reassembly sequence is not reassembled"),
            );
            tree.undecoded(data, header_len, "socks.udp.payload");
            return Ok(data.len());
        }

        let payload = view.rest(header_len);
        let child = session.dispatch_payload(ctx, TransportKind::Udp, port, payload);
        tree.child(child);
        Ok(data.len())
    }
}

#[cfg(test)]
mod tests {
    use crate::proto::conversation::ConversationKey;
    use crate::proto::packet::{PacketContext, Pass};
    use crate::proto::session::AnalysisSession;
    use flowscope_types::prelude::*;

    fn relay(payload: &[u8], port: u16, fragment: u8) -> (AnalysisSession, PacketContext, Vec<u8>) {
        let mut bytes = vec![0, 0, fragment, 1, 192, 0, 2, 10];
        bytes.extend_from_slice(&port.to_be_bytes());
        bytes.extend_from_slice(payload);
        let info = PacketInfo::new(
            1,
            TransportKind::Udp,
            "10.0.0.1:5000".parse().unwrap(),
            "10.0.0.2:40000".parse().unwrap(),
        );

        let mut session = AnalysisSession::new(AnalysisConfig::default());
        let conversation = session
            .conversations_mut()
            .find_or_create(ConversationKey::from_packet(&info), info.frame);
        (session, PacketContext::new(info, Pass::First, conversation), bytes)
    }

    #[test]
    fn payload_is_dispatched_by_remote_port() {
        // LAN_GET_SERIAL_NUMBER
        let (mut session, ctx, bytes) = relay(&[4, 0, 0x10, 0], 21105, 0);
        let dissection = session.call_dissector(ProtocolId::SocksUdp, &ctx, &bytes);

        assert!(dissection
            .protocol_stack()
            .starts_with(&[ProtocolId::SocksUdp, ProtocolId::Z21]));
        assert_eq!(dissection.field("socks.udp.dst_port"), Some(&FieldValue::U16(21105)));
    }

    #[test]
    fn fragments_are_not_dispatched() {
        let (mut session, ctx, bytes) = relay(&[1, 2, 3], 21105, 2);
        let dissection = session.call_dissector(ProtocolId::SocksUdp, &ctx, &bytes);

        assert!(dissection.children.is_empty());
        assert!(dissection.has_expert(ExpertGroup::Undecoded));
        assert_eq!(
            dissection.field("socks.udp.payload"),
            Some(&FieldValue::Bytes(vec![1, 2, 3]))
        );
    }

    #[test]
    fn unknown_address_type_is_malformed() {
        let (mut session, ctx, mut bytes) = relay(&[], 80, 0);
        bytes[3] = 9;
        let dissection = session.call_dissector(ProtocolId::SocksUdp, &ctx, &bytes);
        assert!(dissection.has_expert(ExpertGroup::Malformed));
    }
}
