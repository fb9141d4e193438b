//! Microsoft Proxy (WinSock Proxy) control channel over UDP, plus the data channels its grants
//! redirect. A CONNECT or UDPASSOCIATE names the remote endpoint; the matching acknowledgement
//! names the proxy endpoint the client will use instead, and that endpoint becomes a new
//! conversation whose payload is dispatched by the remembered remote port.

use super::includes::*;
use crate::constants::{MSPROXY_HEADER_LEN, MSPROXY_MAGIC};
use crate::proto::rewiring::spawn_data_conversation;
use crate::proto::state_subcontainers::msproxy_state_container::{
    MsProxyFlow, MsProxySnapshot, PendingRedirect, RedirectTarget,
};
use crate::proto::state_subcontainers::FlowState;
use std::net::IpAddr;
use zerocopy::byteorder::{big_endian, little_endian};
use zerocopy::{FromBytes, FromZeroes, Ref, Unaligned};

#[derive(Debug, FromZeroes, FromBytes, Unaligned)]
#[repr(C)]
pub struct MsProxyHeader {
    pub client_id: little_endian::U32,
    pub version: little_endian::U32,
    pub server_id: little_endian::U32,
    pub server_ack: u8,
    _pad0: [u8; 3],
    pub sequence: u8,
    _pad1: [u8; 7],
    pub magic: [u8; 4],
    _pad2: [u8; 8],
    pub command: big_endian::U16,
}

pub mod command {
    pub const HELLO: u16 = 0x0500;
    /// USERINFO toward the proxy, HELLO_ACK from it
    pub const USERINFO_OR_HELLO_ACK: u16 = 0x1000;
    pub const USERINFO_ACK: u16 = 0x0400;
    pub const AUTH: u16 = 0x4700;
    pub const AUTH_1_ACK: u16 = 0x4714;
    pub const AUTH_2: u16 = 0x4701;
    pub const AUTH_2_ACK: u16 = 0x4715;
    pub const RESOLVE: u16 = 0x070D;
    pub const RESOLVE_ACK: u16 = 0x070F;
    pub const BIND: u16 = 0x0704;
    pub const TCP_BIND: u16 = 0x0707;
    pub const BINDINFO: u16 = 0x0709;
    pub const BINDINFO_ACK: u16 = 0x070A;
    pub const LISTEN: u16 = 0x0406;
    pub const CONNECT: u16 = 0x071E;
    pub const CONNECT_ACK: u16 = 0x0703;
    pub const UDPASSOCIATE: u16 = 0x0705;
    pub const UDPASSOCIATE_ACK: u16 = 0x0706;
    pub const CONNECTED: u16 = 0x042C;
    pub const SESSIONEND: u16 = 0x251E;
}

fn command_name(code: u16, direction: Direction) -> Option<&'static str> {
    use command::*;
    let name = match code {
        HELLO => "HELLO",
        USERINFO_OR_HELLO_ACK => match direction {
            Direction::ToServer => "USERINFO",
            Direction::ToClient => "HELLO_ACK",
        },
        USERINFO_ACK => "USERINFO_ACK",
        AUTH => "AUTH",
        AUTH_1_ACK => "AUTH_1_ACK",
        AUTH_2 => "AUTH_2",
        AUTH_2_ACK => "AUTH_2_ACK",
        RESOLVE => "RESOLVE",
        RESOLVE_ACK => "RESOLVE_ACK",
        BIND => "BIND",
        TCP_BIND => "TCP_BIND",
        BINDINFO => "BINDINFO",
        BINDINFO_ACK => "BINDINFO_ACK",
        LISTEN => "LISTEN",
        CONNECT => "CONNECT",
        CONNECT_ACK => "CONNECT_ACK",
        UDPASSOCIATE => "UDPASSOCIATE",
        UDPASSOCIATE_ACK => "UDPASSOCIATE_ACK",
        CONNECTED => "CONNECTED",
        SESSIONEND => "SESSIONEND",
        _ => return None,
    };
    Some(name)
}

/// The transport a request asks for, or a grant answers
fn redirect_transport(code: u16) -> Option<TransportKind> {
    match code {
        command::CONNECT | command::CONNECT_ACK => Some(TransportKind::Tcp),
        command::UDPASSOCIATE | command::UDPASSOCIATE_ACK => Some(TransportKind::Udp),
        _ => None,
    }
}

/// `[pad:20][port:2 BE][addr:4]` at the start of a CONNECT/UDPASSOCIATE payload and of their
/// acknowledgements
fn redirect_endpoint(payload: &ByteView<'_>) -> Result<(u16, std::net::Ipv4Addr), DissectError> {
    Ok((payload.u16_be(20)?, payload.ipv4(22)?))
}

pub struct MsProxyDissector;

impl Dissector for MsProxyDissector {
    fn protocol(&self) -> ProtocolId {
        ProtocolId::MsProxy
    }

    fn dissect(
        &self,
        session: &mut AnalysisSession,
        ctx: &PacketContext,
        data: &[u8],
        tree: &mut ProtoTree,
    ) -> Result<usize, DissectError> {
        let (header, _) = Ref::<_, MsProxyHeader>::new_from_prefix(data).ok_or(
            DissectError::Truncated {
                offset: 0,
                needed: MSPROXY_HEADER_LEN,
                available: data.len(),
            },
        )?;

        let key = SnapshotKey::new(ctx, ProtocolId::MsProxy, 0);
        let snapshot = match ctx.pass {
            Pass::First => {
                let snapshot = advance(session, ctx, header.command.get(), data)?;
                session.snapshots_mut().record(key, snapshot.clone())?;
                snapshot
            }
            Pass::Replay => session.snapshots().replayed::<MsProxySnapshot>(&key)?,
        };

        render(&header, &snapshot, data, tree)
    }
}

fn advance(
    session: &mut AnalysisSession,
    ctx: &PacketContext,
    code: u16,
    data: &[u8],
) -> Result<MsProxySnapshot, DissectError> {
    let server_port = ctx.server_port_guess();
    let flow = session
        .conversations_mut()
        .state_or_insert_with(ctx.conversation, || MsProxyFlow::new(server_port))?;
    let direction = ctx.direction(flow.server_port);
    let payload = ByteView::new(&data[MSPROXY_HEADER_LEN..]);

    let mut snapshot = MsProxySnapshot {
        direction,
        matched: None,
    };

    let Some(transport) = redirect_transport(code) else {
        return Ok(snapshot);
    };

    match (direction, code) {
        (Direction::ToServer, command::CONNECT | command::UDPASSOCIATE) => {
            // an unreadable request leaves nothing to match later
            flow.pending = redirect_endpoint(&payload)
                .ok()
                .map(|(remote_port, remote_addr)| PendingRedirect {
                    frame: ctx.frame(),
                    transport,
                    remote_addr,
                    remote_port,
                });
        }

        (Direction::ToClient, command::CONNECT_ACK | command::UDPASSOCIATE_ACK) => {
            let matched = flow
                .pending
                .take_if(|pending| pending.transport == transport);
            if let (Some(pending), Ok((port, addr))) = (&matched, redirect_endpoint(&payload)) {
                let target = RedirectTarget {
                    transport,
                    remote_addr: pending.remote_addr,
                    remote_port: pending.remote_port,
                    requested_in: pending.frame,
                    granted_in: ctx.frame(),
                };
                let key = ConversationKey::new(
                    transport,
                    EndpointKey {
                        ip: IpAddr::V4(addr),
                        port: Some(port),
                    },
                    EndpointKey::any_port(ctx.info.dst.ip()),
                );
                let _ = spawn_data_conversation(
                    session.conversations_mut(),
                    ctx.conversation,
                    key,
                    ProtocolId::MsProxyData,
                    ctx.frame(),
                    Some(FlowState::MsProxyData(target)),
                )?;
            }
            snapshot.matched = matched;
        }

        _ => {}
    }

    Ok(snapshot)
}

fn render(
    header: &MsProxyHeader,
    snapshot: &MsProxySnapshot,
    data: &[u8],
    tree: &mut ProtoTree,
) -> Result<usize, DissectError> {
    let code = header.command.get();
    tree.field("msproxy.client_id", 0..4, header.client_id.get())
        .field("msproxy.version", 4..8, header.version.get())
        .field("msproxy.server_id", 8..12, header.server_id.get())
        .field("msproxy.server_ack", 12..13, header.server_ack)
        .field("msproxy.sequence", 16..17, header.sequence)
        .field("msproxy.rwsp", 24..28, &header.magic[..])
        .field("msproxy.command", 36..38, code);

    if &header.magic != MSPROXY_MAGIC {
        tree.expert(
            Severity::Warn,
            ExpertGroup::Malformed,
            24..28,
            "Missing RWSP signature",
        );
    }

    let Some(name) = command_name(code, snapshot.direction) else {
        tree.info(format!("Unknown command 0x{code:04X}"))
            .expert(
                Severity::Note,
                ExpertGroup::Undecoded,
                36..38,
                format!("Unknown MS Proxy command 0x{code:04X}"),
            )
            .undecoded(data, MSPROXY_HEADER_LEN, "msproxy.data");
        return Ok(data.len());
    };

    tree.text(36..38, name).info(name);

    let base = MSPROXY_HEADER_LEN;
    let payload = ByteView::new(&data[base..]);
    let at = |start: usize, len: usize| base + start..base + start + len;

    match code {
        command::CONNECT | command::UDPASSOCIATE if snapshot.direction == Direction::ToServer => {
            let (port, addr) = redirect_endpoint(&payload)?;
            tree.field("msproxy.dst_port", at(20, 2), port)
                .field("msproxy.dst_addr", at(22, 4), addr)
                .info(format!("{addr}:{port}"));
            if let Ok((app, len)) = payload.cstring(38) {
                tree.field("msproxy.application", at(38, len), app);
            }
        }

        command::CONNECT_ACK | command::UDPASSOCIATE_ACK => {
            let (port, addr) = redirect_endpoint(&payload)?;
            tree.field("msproxy.server_int_port", at(20, 2), port)
                .field("msproxy.server_int_addr", at(22, 4), addr);
            if let (Ok(ext_port), Ok(ext_addr)) = (payload.u16_be(26), payload.ipv4(28)) {
                tree.field("msproxy.server_ext_port", at(26, 2), ext_port)
                    .field("msproxy.server_ext_addr", at(28, 4), ext_addr);
            }

            match &snapshot.matched {
                Some(pending) => {
                    tree.field("msproxy.request_frame", at(20, 6), pending.frame)
                        .text(
                            at(20, 6),
                            format!(
                                "Redirects {} {}:{} through {addr}:{port}",
                                pending.transport, pending.remote_addr, pending.remote_port
                            ),
                        );
                }
                None => {
                    tree.expert(
                        Severity::Warn,
                        ExpertGroup::Sequence,
                        at(20, 6),
                        "Grant without a matching request",
                    );
                }
            }
        }

        command::RESOLVE => {
            let len = payload.u8(0)? as usize;
            let host = payload.text(18, len)?;
            tree.field("msproxy.host_len", at(0, 1), len as u8)
                .field("msproxy.host", at(18, len), host.clone())
                .info(host);
        }

        command::RESOLVE_ACK => {
            let addr = payload.ipv4(13)?;
            tree.field("msproxy.resolved_addr", at(13, 4), addr)
                .info(addr.to_string());
        }

        command::SESSIONEND => {}

        _ => {
            tree.undecoded(data, base, "msproxy.data");
        }
    }

    Ok(data.len())
}

/// Payload of a conversation spawned by a CONNECT_ACK or UDPASSOCIATE_ACK
pub struct MsProxyDataDissector;

impl Dissector for MsProxyDataDissector {
    fn protocol(&self) -> ProtocolId {
        ProtocolId::MsProxyData
    }

    fn dissect(
        &self,
        session: &mut AnalysisSession,
        ctx: &PacketContext,
        data: &[u8],
        tree: &mut ProtoTree,
    ) -> Result<usize, DissectError> {
        let key = SnapshotKey::new(ctx, ProtocolId::MsProxyData, 0);
        let target = match ctx.pass {
            Pass::First => {
                let target = session
                    .conversations()
                    .state::<RedirectTarget>(ctx.conversation)
                    .cloned()
                    .ok_or(DissectError::NotAllocated("MS Proxy redirect"))?;
                session.snapshots_mut().record(key, target.clone())?;
                target
            }
            Pass::Replay => session.snapshots().replayed::<RedirectTarget>(&key)?,
        };

        tree.field("msproxy.remote_addr", 0..0, target.remote_addr)
            .field("msproxy.remote_port", 0..0, target.remote_port)
            .field("msproxy.request_frame", 0..0, target.requested_in)
            .field("msproxy.grant_frame", 0..0, target.granted_in)
            .info(format!(
                "Redirected to {}:{}",
                target.remote_addr, target.remote_port
            ));

        let child = session.dispatch_payload(ctx, target.transport, target.remote_port, data);
        tree.child(child);
        Ok(data.len())
    }
}
