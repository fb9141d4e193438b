use flowscope_types::prelude::{Direction, FrameId, TransportKind};
use std::net::Ipv4Addr;

/// A CONNECT or UDPASSOCIATE request still waiting for its grant
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PendingRedirect {
    pub frame: FrameId,
    pub transport: TransportKind,
    pub remote_addr: Ipv4Addr,
    pub remote_port: u16,
}

/// Attached to a data conversation spawned by a grant. Immutable once spawned
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RedirectTarget {
    pub transport: TransportKind,
    pub remote_addr: Ipv4Addr,
    pub remote_port: u16,
    pub requested_in: FrameId,
    pub granted_in: FrameId,
}

pub struct MsProxyFlow {
    pub server_port: u16,
    pub pending: Option<PendingRedirect>,
}

impl MsProxyFlow {
    pub fn new(server_port: u16) -> Self {
        Self {
            server_port,
            pending: None,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MsProxySnapshot {
    pub direction: Direction,
    /// The request a grant answered
    pub matched: Option<PendingRedirect>,
}
