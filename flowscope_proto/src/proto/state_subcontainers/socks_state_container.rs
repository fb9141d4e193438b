//! SOCKS per-flow state and the handshake state machine shared by v4 and v5.

use flowscope_types::prelude::{Direction, FrameId};
use packed_struct::derive::PrimitiveEnum_u8;
use serde::Serialize;
use std::fmt::{Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, strum::Display, strum::EnumIter,
)]
pub enum ClientState {
    Start,
    WaitForAuthReply,
    V5Command,
    UserNameRequest,
    GssApiAuthRequest,
    Done,
    Error,
}

#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, strum::Display, strum::EnumIter,
)]
pub enum ServerState {
    Start,
    InitReply,
    CommandReply,
    UserReply,
    GssApiReply,
    BindReply,
    Done,
    Error,
}

impl ClientState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ClientState::Done | ClientState::Error)
    }
}

impl ServerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServerState::Done | ServerState::Error)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, PrimitiveEnum_u8, strum::Display)]
pub enum AuthMethod {
    #[strum(serialize = "No authentication")]
    NoAuthentication = 0,
    #[strum(serialize = "GSS-API")]
    GssApi = 1,
    #[strum(serialize = "Username/Password")]
    UserName = 2,
    #[strum(serialize = "No acceptable method")]
    NoAcceptable = 0xFF,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, PrimitiveEnum_u8, strum::Display)]
pub enum SocksCommand {
    Connect = 1,
    Bind = 2,
    #[strum(serialize = "UdpAssociate")]
    UdpAssociate = 3,
    Ping = 0x80,
    Traceroute = 0x81,
}

pub mod reply_codes {
    pub const V4_GRANTED: u8 = 90;
    pub const V5_SUCCEEDED: u8 = 0;

    pub fn v4_name(code: u8) -> &'static str {
        match code {
            90 => "Granted",
            91 => "Rejected or failed",
            92 => "Rejected because SOCKS server cannot connect to identd on the client",
            93 => "Rejected because the client program and identd report different user-ids",
            _ => "Unknown",
        }
    }

    pub fn v5_name(code: u8) -> &'static str {
        match code {
            0 => "Succeeded",
            1 => "General SOCKS server failure",
            2 => "Connection not allowed by ruleset",
            3 => "Network unreachable",
            4 => "Host unreachable",
            5 => "Connection refused",
            6 => "TTL expired",
            7 => "Command not supported",
            8 => "Address type not supported",
            _ => "Unknown",
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum SocksAddress {
    V4(Ipv4Addr),
    Domain(String),
    V6(Ipv6Addr),
}

impl SocksAddress {
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            SocksAddress::V4(ip) => Some(IpAddr::V4(*ip)),
            SocksAddress::V6(ip) => Some(IpAddr::V6(*ip)),
            SocksAddress::Domain(_) => None,
        }
    }
}

impl Display for SocksAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SocksAddress::V4(ip) => write!(f, "{ip}"),
            SocksAddress::Domain(name) => write!(f, "{name}"),
            SocksAddress::V6(ip) => write!(f, "[{ip}]"),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct SocksEndpoint {
    pub address: SocksAddress,
    pub port: u16,
}

impl Display for SocksEndpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// What a packet told the state machine, reduced to the bytes a transition depends on
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SocksInput {
    V4Request { command: u8 },
    V4Reply { code: u8 },
    Greeting,
    MethodSelected { method: u8 },
    UserPassRequest,
    UserPassReply { status: u8 },
    GssApi { message_type: u8 },
    CommandRequest { command: u8 },
    CommandReply { status: u8 },
    Unrecognized,
}

pub mod gssapi_message {
    pub const AUTHENTICATION: u8 = 1;
    pub const PROTECTION: u8 = 2;
    pub const ABORT: u8 = 0xFF;
}

/// SOCKSv4 only defines CONNECT and BIND. UDP ASSOCIATE, PING and TRACEROUTE are v5 commands
fn is_known_command(version: u8, command: u8) -> bool {
    match <SocksCommand as packed_struct::PrimitiveEnum>::from_primitive(command) {
        Some(SocksCommand::Connect | SocksCommand::Bind) => true,
        Some(_) => version == 5,
        None => false,
    }
}

/// Advances the handshake by one packet. Terminal states absorb every input; anything a side
/// did not expect sends that side to `Error`. Server replies that pick the next client step
/// move both sides
pub fn transition(
    client: ClientState,
    server: ServerState,
    side: Direction,
    input: SocksInput,
    command: Option<u8>,
) -> (ClientState, ServerState) {
    use ClientState as C;
    use ServerState as S;
    use SocksInput as I;

    let is_bind = command == Some(SocksCommand::Bind as u8);

    match side {
        Direction::ToServer => {
            let next = match (client, input) {
                (C::Done | C::Error, _) => return (client, server),
                (C::Start, I::V4Request { command }) if is_known_command(4, command) => {
                    return (C::Done, server)
                }
                (C::Start, I::Greeting) => return (C::Start, S::InitReply),
                (C::UserNameRequest, I::UserPassRequest) => C::WaitForAuthReply,
                (C::GssApiAuthRequest, I::GssApi { message_type })
                    if message_type != gssapi_message::ABORT =>
                {
                    C::WaitForAuthReply
                }
                (C::V5Command, I::CommandRequest { command }) if is_known_command(5, command) => {
                    C::Done
                }
                _ => C::Error,
            };

            (next, server)
        }

        Direction::ToClient => match (server, input) {
            (S::Done | S::Error, _) => (client, server),
            (S::Start, I::V4Reply { code }) => {
                if is_bind && code == reply_codes::V4_GRANTED {
                    (client, S::BindReply)
                } else {
                    (client, S::Done)
                }
            }
            (S::InitReply, I::MethodSelected { method }) => {
                match <AuthMethod as packed_struct::PrimitiveEnum>::from_primitive(method) {
                    Some(AuthMethod::NoAuthentication) => (C::V5Command, S::CommandReply),
                    Some(AuthMethod::UserName) => (C::UserNameRequest, S::UserReply),
                    Some(AuthMethod::GssApi) => (C::GssApiAuthRequest, S::GssApiReply),
                    _ => (C::Error, S::Error),
                }
            }
            (S::UserReply, I::UserPassReply { status: 0 }) => (C::V5Command, S::CommandReply),
            (S::UserReply, I::UserPassReply { .. }) => (C::Error, S::Error),
            (
                S::GssApiReply,
                I::GssApi {
                    message_type: gssapi_message::AUTHENTICATION,
                },
            ) => (C::GssApiAuthRequest, S::GssApiReply),
            (
                S::GssApiReply,
                I::GssApi {
                    message_type: gssapi_message::PROTECTION,
                },
            ) => (C::V5Command, S::CommandReply),
            (S::GssApiReply, I::GssApi { .. }) => (C::Error, S::Error),
            (S::CommandReply, I::CommandReply { status }) => {
                if is_bind && status == reply_codes::V5_SUCCEEDED {
                    (client, S::BindReply)
                } else {
                    (client, S::Done)
                }
            }
            (S::BindReply, I::CommandReply { .. } | I::V4Reply { .. }) => (client, S::Done),
            _ => (client, S::Error),
        },
    }
}

/// Handshake state of one SOCKS control connection. Only the forward pass mutates it
#[derive(Debug, Clone)]
pub struct SocksFlow {
    /// The port the proxy listens on, fixed when the flow is first seen
    pub server_port: u16,
    pub version: Option<u8>,
    pub client: ClientState,
    pub server: ServerState,
    pub auth_method: Option<u8>,
    pub command: Option<u8>,
    pub remote: Option<SocksEndpoint>,
    /// The reply after which every packet is tunnelled payload
    pub start_done_frame: Option<FrameId>,
    /// Set on conversations spawned by BIND: there is no handshake, only payload
    pub payload_only: bool,
}

impl SocksFlow {
    pub fn new(server_port: u16) -> Self {
        Self {
            server_port,
            version: None,
            client: ClientState::Start,
            server: ServerState::Start,
            auth_method: None,
            command: None,
            remote: None,
            start_done_frame: None,
            payload_only: false,
        }
    }

    /// State for the incoming data connection granted by a BIND reply
    pub fn payload_only(server_port: u16, remote: SocksEndpoint, granted_in: FrameId) -> Self {
        Self {
            server_port,
            version: None,
            client: ClientState::Done,
            server: ServerState::Done,
            auth_method: None,
            command: Some(SocksCommand::Bind as u8),
            remote: Some(remote),
            start_done_frame: Some(granted_in),
            payload_only: true,
        }
    }

    /// Whether packets on this flow are now tunnelled payload rather than handshake
    pub fn is_tunnelling(&self) -> bool {
        self.start_done_frame.is_some()
    }

    pub fn remote_port(&self) -> Option<u16> {
        self.remote.as_ref().map(|remote| remote.port)
    }
}

/// How a packet was understood the first time it was seen
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SocksSnapshot {
    pub direction: Direction,
    pub version: Option<u8>,
    pub client_before: ClientState,
    pub server_before: ServerState,
    pub client_after: ClientState,
    pub server_after: ServerState,
    pub auth_method: Option<u8>,
    pub command: Option<u8>,
    /// Set when this packet is tunnelled payload; the port it is dispatched on
    pub payload_port: Option<u16>,
    pub remote: Option<SocksEndpoint>,
}

impl SocksSnapshot {
    pub fn transitioned(&self) -> bool {
        self.client_before != self.client_after || self.server_before != self.server_after
    }
}
