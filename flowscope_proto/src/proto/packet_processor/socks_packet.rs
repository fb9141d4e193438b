//! SOCKS v4/v4a/v5 over TCP. The forward pass classifies each packet against the flow's
//! handshake state, advances the state machine and records a [`SocksSnapshot`]; rendering always
//! works from that snapshot. Once a CONNECT or BIND has been granted every later packet is handed
//! to the dissector registered for the remote port. UDP ASSOCIATE and BIND grants register the
//! announced endpoints as new conversations.

use super::includes::*;
use crate::proto::rewiring::spawn_data_conversation;
use crate::proto::state_subcontainers::socks_state_container::{
    reply_codes, transition, AuthMethod, ClientState, ServerState, SocksAddress, SocksCommand,
    SocksEndpoint, SocksFlow, SocksInput, SocksSnapshot,
};
use crate::proto::state_subcontainers::FlowState;
use packed_struct::PrimitiveEnum;
use std::net::IpAddr;

pub const ATYP_IPV4: u8 = 1;
pub const ATYP_DOMAIN: u8 = 3;
pub const ATYP_IPV6: u8 = 4;

pub struct SocksDissector;

impl Dissector for SocksDissector {
    fn protocol(&self) -> ProtocolId {
        ProtocolId::Socks
    }

    #[cfg_attr(feature = "verbose-tracing", tracing::instrument(level = "trace", target = "flowscope", skip_all, fields(frame = %ctx.frame())))]
    fn dissect(
        &self,
        session: &mut AnalysisSession,
        ctx: &PacketContext,
        data: &[u8],
        tree: &mut ProtoTree,
    ) -> Result<usize, DissectError> {
        let key = SnapshotKey::new(ctx, ProtocolId::Socks, 0);
        let snapshot = match ctx.pass {
            Pass::First => {
                let (snapshot, grant) = advance(session, ctx, data)?;
                session.snapshots_mut().record(key, snapshot.clone())?;
                if let Some(grant) = grant {
                    if let Err(err) = rewire(session, ctx, grant, snapshot.remote.as_ref()) {
                        log::warn!(target: "flowscope", "Frame {}: could not register the granted SOCKS channel: {err}", ctx.frame());
                    }
                }
                snapshot
            }

            Pass::Replay => session.snapshots().replayed::<SocksSnapshot>(&key)?,
        };

        render(session, ctx, data, tree, &snapshot)
    }
}

/// A success reply that announces an endpoint for a new conversation
#[derive(Debug, Clone)]
enum Grant {
    UdpAssociate(SocksEndpoint),
    Bind(SocksEndpoint),
}

fn advance(
    session: &mut AnalysisSession,
    ctx: &PacketContext,
    data: &[u8],
) -> Result<(SocksSnapshot, Option<Grant>), DissectError> {
    let server_port = ctx.server_port_guess();
    let flow = session
        .conversations_mut()
        .state_or_insert_with(ctx.conversation, || SocksFlow::new(server_port))?;

    let direction = ctx.direction(flow.server_port);
    let client_before = flow.client;
    let server_before = flow.server;

    if flow.is_tunnelling() {
        return Ok((
            SocksSnapshot {
                direction,
                version: flow.version,
                client_before,
                server_before,
                client_after: client_before,
                server_after: server_before,
                auth_method: flow.auth_method,
                command: flow.command,
                payload_port: flow.remote_port(),
                remote: flow.remote.clone(),
            },
            None,
        ));
    }

    if flow.version.is_none() && direction == Direction::ToServer {
        if let Some(version @ (4 | 5)) = data.first().copied() {
            flow.version = Some(version);
        }
    }

    let input = classify(flow.version, direction, client_before, server_before, data);
    let (client, server) = transition(client_before, server_before, direction, input, flow.command);
    flow.client = client;
    flow.server = server;

    let mut grant = None;
    match input {
        SocksInput::MethodSelected { method } => flow.auth_method = Some(method),

        SocksInput::V4Request { command } | SocksInput::CommandRequest { command }
            if client == ClientState::Done =>
        {
            flow.command = Some(command);
            flow.remote = request_target(flow.version, data).ok();
        }

        SocksInput::V4Reply { code: status } | SocksInput::CommandReply { status }
            if reply_succeeded(flow.version, status) =>
        {
            let bound = bound_endpoint(flow.version, data).ok();
            let command = flow.command.and_then(SocksCommand::from_primitive);
            match (command, server) {
                (Some(SocksCommand::Connect), ServerState::Done) => {
                    flow.start_done_frame = Some(ctx.frame())
                }
                (Some(SocksCommand::Bind), ServerState::BindReply) => {
                    grant = bound.map(Grant::Bind)
                }
                (Some(SocksCommand::Bind), ServerState::Done) => {
                    flow.start_done_frame = Some(ctx.frame())
                }
                (Some(SocksCommand::UdpAssociate), ServerState::Done) => {
                    grant = bound.map(Grant::UdpAssociate)
                }
                _ => {}
            }
        }

        _ => {}
    }

    if (client == ClientState::Error && client_before != ClientState::Error)
        || (server == ServerState::Error && server_before != ServerState::Error)
    {
        log::warn!(target: "flowscope", "Frame {}: SOCKS handshake on {} left the expected sequence ({client}/{server})", ctx.frame(), ctx.conversation);
    }

    Ok((
        SocksSnapshot {
            direction,
            version: flow.version,
            client_before,
            server_before,
            client_after: client,
            server_after: server,
            auth_method: flow.auth_method,
            command: flow.command,
            payload_port: None,
            remote: flow.remote.clone(),
        },
        grant,
    ))
}

fn reply_succeeded(version: Option<u8>, status: u8) -> bool {
    match version {
        Some(4) => status == reply_codes::V4_GRANTED,
        _ => status == reply_codes::V5_SUCCEEDED,
    }
}

/// Reduces a packet to the input the state machine needs, based on what each side expects next
fn classify(
    version: Option<u8>,
    direction: Direction,
    client: ClientState,
    server: ServerState,
    data: &[u8],
) -> SocksInput {
    let view = ByteView::new(data);
    let first = view.u8(0).ok();
    let second = view.u8(1).ok();

    let input = match (version, direction) {
        (Some(4), Direction::ToServer) if client == ClientState::Start && first == Some(4) => {
            second.map(|command| SocksInput::V4Request { command })
        }

        (Some(4), Direction::ToClient)
            if matches!(server, ServerState::Start | ServerState::BindReply) =>
        {
            second.map(|code| SocksInput::V4Reply { code })
        }

        (Some(5), Direction::ToServer) => match client {
            ClientState::Start if first == Some(5) => second
                .filter(|methods| data.len() >= 2 + *methods as usize)
                .map(|_| SocksInput::Greeting),
            ClientState::UserNameRequest if first == Some(1) => Some(SocksInput::UserPassRequest),
            ClientState::GssApiAuthRequest if first == Some(1) => {
                second.map(|message_type| SocksInput::GssApi { message_type })
            }
            ClientState::V5Command if first == Some(5) => {
                second.map(|command| SocksInput::CommandRequest { command })
            }
            _ => None,
        },

        (Some(5), Direction::ToClient) => match server {
            ServerState::InitReply if first == Some(5) => {
                second.map(|method| SocksInput::MethodSelected { method })
            }
            ServerState::UserReply => second.map(|status| SocksInput::UserPassReply { status }),
            ServerState::GssApiReply if first == Some(1) => {
                second.map(|message_type| SocksInput::GssApi { message_type })
            }
            ServerState::CommandReply | ServerState::BindReply if first == Some(5) => {
                second.map(|status| SocksInput::CommandReply { status })
            }
            _ => None,
        },

        _ => None,
    };

    input.unwrap_or(SocksInput::Unrecognized)
}

/// Reads a v5 address (ATYP at `offset`) and the port after it. Returns the end offset
fn read_v5_endpoint(
    view: &ByteView<'_>,
    offset: usize,
) -> Result<(SocksEndpoint, usize), DissectError> {
    let (address, port_at) = match view.u8(offset)? {
        ATYP_IPV4 => (SocksAddress::V4(view.ipv4(offset + 1)?), offset + 5),
        ATYP_DOMAIN => {
            let len = view.u8(offset + 1)? as usize;
            (
                SocksAddress::Domain(view.text(offset + 2, len)?),
                offset + 2 + len,
            )
        }
        ATYP_IPV6 => (SocksAddress::V6(view.ipv6(offset + 1)?), offset + 17),
        _ => return Err(DissectError::InvalidPacket("Unknown SOCKS address type")),
    };

    let port = view.u16_be(port_at)?;
    Ok((SocksEndpoint { address, port }, port_at + 2))
}

/// A v4a request sets the address to 0.0.0.x with x non-zero and appends the host name
fn is_v4a(ip: std::net::Ipv4Addr) -> bool {
    let octets = ip.octets();
    octets[..3] == [0, 0, 0] && octets[3] != 0
}

fn request_target(version: Option<u8>, data: &[u8]) -> Result<SocksEndpoint, DissectError> {
    let view = ByteView::new(data);
    match version {
        Some(4) => {
            let port = view.u16_be(2)?;
            let ip = view.ipv4(4)?;
            let address = if is_v4a(ip) {
                let (_, user_len) = view.cstring(8)?;
                let (host, _) = view.cstring(8 + user_len)?;
                SocksAddress::Domain(host)
            } else {
                SocksAddress::V4(ip)
            };
            Ok(SocksEndpoint { address, port })
        }
        _ => read_v5_endpoint(&view, 3).map(|(endpoint, _)| endpoint),
    }
}

fn bound_endpoint(version: Option<u8>, data: &[u8]) -> Result<SocksEndpoint, DissectError> {
    let view = ByteView::new(data);
    match version {
        Some(4) => Ok(SocksEndpoint {
            address: SocksAddress::V4(view.ipv4(4)?),
            port: view.u16_be(2)?,
        }),
        _ => read_v5_endpoint(&view, 3).map(|(endpoint, _)| endpoint),
    }
}

/// The address to use for a granted channel: the announced one, or the proxy's own when the
/// reply left it unspecified
fn announced_or(address: &SocksAddress, fallback: IpAddr) -> IpAddr {
    address
        .ip()
        .filter(|ip| !ip.is_unspecified())
        .unwrap_or(fallback)
}

fn rewire(
    session: &mut AnalysisSession,
    ctx: &PacketContext,
    grant: Grant,
    remote: Option<&SocksEndpoint>,
) -> Result<(), DissectError> {
    // grants are server replies, so the source is the proxy
    let proxy_ip = ctx.info.src.ip();
    let client_ip = ctx.info.dst.ip();

    match grant {
        Grant::UdpAssociate(relay) => {
            let relay_ip = announced_or(&relay.address, proxy_ip);
            let key = ConversationKey::new(
                TransportKind::Udp,
                EndpointKey::any_port(client_ip),
                EndpointKey {
                    ip: relay_ip,
                    port: Some(relay.port),
                },
            );
            let _ = spawn_data_conversation(
                session.conversations_mut(),
                ctx.conversation,
                key,
                ProtocolId::SocksUdp,
                ctx.frame(),
                None,
            )?;
        }

        Grant::Bind(bound) => {
            let remote = remote.ok_or(DissectError::InvalidPacket(
                "BIND reply without a recorded remote endpoint",
            ))?;
            let remote_ip = remote.address.ip().ok_or(DissectError::InvalidPacket(
                "BIND to a host name cannot be matched to an address",
            ))?;

            let listen_ip = announced_or(&bound.address, proxy_ip);
            let key = ConversationKey::new(
                TransportKind::Tcp,
                EndpointKey {
                    ip: listen_ip,
                    port: Some(bound.port),
                },
                EndpointKey::any_port(remote_ip),
            );
            let state = SocksFlow::payload_only(bound.port, remote.clone(), ctx.frame());
            let _ = spawn_data_conversation(
                session.conversations_mut(),
                ctx.conversation,
                key,
                ProtocolId::Socks,
                ctx.frame(),
                Some(FlowState::Socks(state)),
            )?;
        }
    }

    Ok(())
}

fn render(
    session: &mut AnalysisSession,
    ctx: &PacketContext,
    data: &[u8],
    tree: &mut ProtoTree,
    snapshot: &SocksSnapshot,
) -> Result<usize, DissectError> {
    if let Some(port) = snapshot.payload_port {
        tree.text(0..data.len(), format!("Tunnelled payload ({})", snapshot.direction))
            .info(format!("Tunnelled to remote port {port}"));

        let mut nested = ctx.clone();
        nested.direction_hint = Some(snapshot.direction);
        let child = session.dispatch_payload(&nested, TransportKind::Tcp, port, data);
        tree.child(child);
        return Ok(data.len());
    }

    let view = ByteView::new(data);
    let consumed = match (snapshot.version, snapshot.direction) {
        (Some(4), Direction::ToServer) if snapshot.client_before == ClientState::Start => {
            render_v4_request(&view, tree)?
        }

        (Some(4), Direction::ToClient)
            if matches!(snapshot.server_before, ServerState::Start | ServerState::BindReply) =>
        {
            render_v4_reply(&view, tree)?
        }

        (Some(5), Direction::ToServer) => match snapshot.client_before {
            ClientState::Start => render_greeting(&view, tree)?,
            ClientState::UserNameRequest => render_userpass_request(&view, tree)?,
            ClientState::GssApiAuthRequest => render_gssapi(&view, tree)?,
            ClientState::V5Command => render_v5_request(&view, tree)?,
            _ => render_unexpected(data, tree, snapshot),
        },

        (Some(5), Direction::ToClient) => match snapshot.server_before {
            ServerState::InitReply => render_method_selection(&view, tree)?,
            ServerState::UserReply => render_userpass_reply(&view, tree)?,
            ServerState::GssApiReply => render_gssapi(&view, tree)?,
            ServerState::CommandReply | ServerState::BindReply => render_v5_reply(&view, tree)?,
            _ => render_unexpected(data, tree, snapshot),
        },

        (None, _) => {
            tree.expert(
                Severity::Error,
                ExpertGroup::Malformed,
                0..data.len(),
                "Unsupported SOCKS version",
            );
            tree.undecoded(data, 0, "socks.data");
            data.len()
        }

        _ => render_unexpected(data, tree, snapshot),
    };

    if snapshot.transitioned() {
        tree.field("socks.client_state", 0..0, snapshot.client_after.to_string())
            .field("socks.server_state", 0..0, snapshot.server_after.to_string());
    }

    if snapshot.client_after == ClientState::Error && snapshot.client_before != ClientState::Error
    {
        tree.expert(
            Severity::Warn,
            ExpertGroup::Sequence,
            0..data.len(),
            format!("Client sent an unexpected message in state {}", snapshot.client_before),
        );
    }

    if snapshot.server_after == ServerState::Error && snapshot.server_before != ServerState::Error
    {
        tree.expert(
            Severity::Warn,
            ExpertGroup::Sequence,
            0..data.len(),
            format!("Server sent an unexpected message in state {}", snapshot.server_before),
        );
    }

    Ok(consumed)
}

fn render_unexpected(data: &[u8], tree: &mut ProtoTree, snapshot: &SocksSnapshot) -> usize {
    tree.expert(
        Severity::Warn,
        ExpertGroup::Sequence,
        0..data.len(),
        format!(
            "Unexpected {} data in state {}/{}",
            snapshot.direction, snapshot.client_before, snapshot.server_before
        ),
    )
    .undecoded(data, 0, "socks.data");
    data.len()
}

fn command_name(command: u8) -> String {
    SocksCommand::from_primitive(command)
        .map(|command| command.to_string())
        .unwrap_or_else(|| format!("Unknown (0x{command:02x})"))
}

fn render_v4_request(view: &ByteView<'_>, tree: &mut ProtoTree) -> Result<usize, DissectError> {
    let command = view.u8(1)?;
    let port = view.u16_be(2)?;
    let ip = view.ipv4(4)?;
    let (user, user_len) = view.cstring(8)?;

    tree.field("socks.version", 0..1, 4u8)
        .field("socks.command", 1..2, command)
        .text(1..2, command_name(command))
        .field("socks.dst_port", 2..4, port)
        .field("socks.dst_ip", 4..8, ip)
        .field("socks.user", 8..8 + user_len, user);

    let mut end = 8 + user_len;
    let address = if is_v4a(ip) {
        let (host, host_len) = view.cstring(end)?;
        tree.field("socks.remote_name", end..end + host_len, host.as_str());
        end += host_len;
        SocksAddress::Domain(host)
    } else {
        SocksAddress::V4(ip)
    };

    let remote = SocksEndpoint { address, port };
    tree.field("socks.remote", 2..end, remote.to_string())
        .info(format!("Version: 4, {} to {remote}", command_name(command)));
    Ok(end)
}

fn render_v4_reply(view: &ByteView<'_>, tree: &mut ProtoTree) -> Result<usize, DissectError> {
    let code = view.u8(1)?;
    let port = view.u16_be(2)?;
    let ip = view.ipv4(4)?;

    tree.field("socks.version", 0..1, view.u8(0)?)
        .field("socks.reply", 1..2, code)
        .field("socks.result", 1..2, reply_codes::v4_name(code))
        .field("socks.bound_port", 2..4, port)
        .field("socks.bound_ip", 4..8, ip)
        .info(format!("Version: 4, Result: {}", reply_codes::v4_name(code)));
    Ok(8)
}

fn method_name(method: u8) -> String {
    AuthMethod::from_primitive(method)
        .map(|method| method.to_string())
        .unwrap_or_else(|| format!("Unknown (0x{method:02x})"))
}

fn render_greeting(view: &ByteView<'_>, tree: &mut ProtoTree) -> Result<usize, DissectError> {
    let count = view.u8(1)? as usize;
    let methods = view.slice(2, count)?;

    tree.field("socks.version", 0..1, 5u8)
        .field("socks.method_count", 1..2, count as u8);
    for (idx, method) in methods.iter().enumerate() {
        tree.field("socks.method", 2 + idx..3 + idx, *method)
            .text(2 + idx..3 + idx, method_name(*method));
    }

    tree.info("Version: 5, Client greeting");
    Ok(2 + count)
}

fn render_method_selection(
    view: &ByteView<'_>,
    tree: &mut ProtoTree,
) -> Result<usize, DissectError> {
    let method = view.u8(1)?;
    tree.field("socks.version", 0..1, 5u8)
        .field("socks.auth_method", 1..2, method)
        .text(1..2, method_name(method))
        .info(format!("Version: 5, Method selected: {}", method_name(method)));
    Ok(2)
}

fn render_userpass_request(
    view: &ByteView<'_>,
    tree: &mut ProtoTree,
) -> Result<usize, DissectError> {
    let user_len = view.u8(1)? as usize;
    let user = view.text(2, user_len)?;
    let pass_at = 2 + user_len;
    let pass_len = view.u8(pass_at)? as usize;
    let password = view.text(pass_at + 1, pass_len)?;

    tree.field("socks.auth_version", 0..1, view.u8(0)?)
        .field("socks.username", 2..pass_at, user.as_str())
        .field("socks.password", pass_at + 1..pass_at + 1 + pass_len, password)
        .info(format!("Username/password request for {user}"));
    Ok(pass_at + 1 + pass_len)
}

fn render_userpass_reply(
    view: &ByteView<'_>,
    tree: &mut ProtoTree,
) -> Result<usize, DissectError> {
    let status = view.u8(1)?;
    tree.field("socks.auth_version", 0..1, view.u8(0)?)
        .field("socks.auth_status", 1..2, status)
        .info(if status == 0 {
            "Authentication succeeded"
        } else {
            "Authentication failed"
        });
    Ok(2)
}

fn render_gssapi(view: &ByteView<'_>, tree: &mut ProtoTree) -> Result<usize, DissectError> {
    let message_type = view.u8(1)?;
    tree.field("socks.gssapi.version", 0..1, view.u8(0)?)
        .field("socks.gssapi.message_type", 1..2, message_type);

    if message_type == 0xFF {
        tree.info("GSS-API abort");
        return Ok(2);
    }

    let len = view.u16_be(2)? as usize;
    let token = view.slice(4, len)?;
    tree.field("socks.gssapi.length", 2..4, len as u16)
        .field("socks.gssapi.token", 4..4 + len, token)
        .info(format!("GSS-API message type {message_type}"));
    Ok(4 + len)
}

fn render_v5_endpoint(
    view: &ByteView<'_>,
    tree: &mut ProtoTree,
    ip_field: &'static str,
    name_field: &'static str,
    port_field: &'static str,
) -> Result<(SocksEndpoint, usize), DissectError> {
    let (endpoint, end) = read_v5_endpoint(view, 3)?;
    tree.field("socks.address_type", 3..4, view.u8(3)?);
    match &endpoint.address {
        SocksAddress::V4(ip) => {
            tree.field(ip_field, 4..8, *ip);
        }
        SocksAddress::V6(ip) => {
            tree.field(ip_field, 4..20, *ip);
        }
        SocksAddress::Domain(name) => {
            tree.field(name_field, 5..end - 2, name.as_str());
        }
    }
    tree.field(port_field, end - 2..end, endpoint.port);
    Ok((endpoint, end))
}

fn render_v5_request(view: &ByteView<'_>, tree: &mut ProtoTree) -> Result<usize, DissectError> {
    let command = view.u8(1)?;
    tree.field("socks.version", 0..1, 5u8)
        .field("socks.command", 1..2, command)
        .text(1..2, command_name(command))
        .field("socks.reserved", 2..3, view.u8(2)?);

    let (remote, end) = render_v5_endpoint(
        view,
        tree,
        "socks.dst_ip",
        "socks.remote_name",
        "socks.dst_port",
    )?;
    tree.field("socks.remote", 3..end, remote.to_string())
        .info(format!("Version: 5, {} to {remote}", command_name(command)));
    Ok(end)
}

fn render_v5_reply(view: &ByteView<'_>, tree: &mut ProtoTree) -> Result<usize, DissectError> {
    let status = view.u8(1)?;
    tree.field("socks.version", 0..1, 5u8)
        .field("socks.reply", 1..2, status)
        .field("socks.result", 1..2, reply_codes::v5_name(status))
        .field("socks.reserved", 2..3, view.u8(2)?);

    let (_, end) = render_v5_endpoint(
        view,
        tree,
        "socks.bound_ip",
        "socks.bound_name",
        "socks.bound_port",
    )?;
    tree.info(format!("Version: 5, Result: {}", reply_codes::v5_name(status)));
    Ok(end)
}
