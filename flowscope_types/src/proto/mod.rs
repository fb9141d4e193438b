use packed_struct::derive::PrimitiveEnum_u8;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display, Formatter};
use std::net::SocketAddr;
use strum::VariantNames;

/// The transport a packet arrived on. The discriminants are the IP protocol numbers
#[derive(
    Debug,
    Serialize,
    Deserialize,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Hash,
    Ord,
    PartialOrd,
    PrimitiveEnum_u8,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::VariantNames,
)]
pub enum TransportKind {
    #[strum(serialize = "tcp")]
    Tcp = 6,
    #[strum(serialize = "udp")]
    Udp = 17,
}

impl TransportKind {
    pub fn variants() -> Vec<String> {
        Self::VARIANTS.iter().map(|s| s.to_string()).collect()
    }

    /// Stream transports deliver bytes that may straddle PDU boundaries
    pub fn is_stream(&self) -> bool {
        matches!(self, TransportKind::Tcp)
    }
}

/// The capture-order number of a packet. Frame numbers start at 1
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize, Default)]
#[repr(transparent)]
pub struct FrameId(pub u32);

impl Debug for FrameId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl Display for FrameId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for FrameId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Every protocol that may own per-flow state, a per-packet snapshot or a dispatch-table slot
#[derive(
    Debug,
    Serialize,
    Deserialize,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Hash,
    Ord,
    PartialOrd,
    strum::Display,
    strum::EnumIter,
    strum::IntoStaticStr,
)]
pub enum ProtocolId {
    #[strum(serialize = "SOCKS")]
    Socks,
    /// The UDP relay leg of a SOCKSv5 UDP ASSOCIATE
    #[strum(serialize = "SOCKS-UDP")]
    SocksUdp,
    #[strum(serialize = "XCP")]
    Xcp,
    #[strum(serialize = "MSPROXY")]
    MsProxy,
    /// A data channel redirected through an MS Proxy connect grant
    #[strum(serialize = "MSPROXY-DATA")]
    MsProxyData,
    #[strum(serialize = "Z21")]
    Z21,
    #[strum(serialize = "DCC")]
    Dcc,
    #[strum(serialize = "SHICP")]
    Shicp,
    /// Opaque bytes nobody claimed
    #[strum(serialize = "DATA")]
    Data,
}

/// Which way a packet travels relative to the flow's server endpoint
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize, strum::Display)]
pub enum Direction {
    #[strum(serialize = "client->server")]
    ToServer,
    #[strum(serialize = "server->client")]
    ToClient,
}

impl Direction {
    /// The direction is decided by comparing the destination port against the server port recorded for the flow
    pub fn from_ports(dst_port: u16, server_port: u16) -> Self {
        if dst_port == server_port {
            Direction::ToServer
        } else {
            Direction::ToClient
        }
    }

    pub fn flip(self) -> Self {
        match self {
            Direction::ToServer => Direction::ToClient,
            Direction::ToClient => Direction::ToServer,
        }
    }
}

/// What the capture/transport demux knows about a packet before any dissector looks at it
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct PacketInfo {
    pub frame: FrameId,
    pub transport: TransportKind,
    pub src: SocketAddr,
    pub dst: SocketAddr,
    /// Capture time in nanoseconds since the epoch
    pub timestamp_ns: i64,
}

impl PacketInfo {
    pub fn new<T: Into<FrameId>>(
        frame: T,
        transport: TransportKind,
        src: SocketAddr,
        dst: SocketAddr,
    ) -> Self {
        Self {
            frame: frame.into(),
            transport,
            src,
            dst,
            timestamp_ns: 0,
        }
    }

    pub fn with_timestamp_ns(mut self, timestamp_ns: i64) -> Self {
        self.timestamp_ns = timestamp_ns;
        self
    }

    pub fn src_port(&self) -> u16 {
        self.src.port()
    }

    pub fn dst_port(&self) -> u16 {
        self.dst.port()
    }

    /// The two ports ordered low first, which is the order the port table is consulted in
    pub fn ports_low_first(&self) -> (u16, u16) {
        let (src, dst) = (self.src_port(), self.dst_port());
        if src <= dst {
            (src, dst)
        } else {
            (dst, src)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packed_struct::PrimitiveEnum;

    #[test]
    fn transport_kind_primitive() {
        assert_eq!(TransportKind::from_primitive(6), Some(TransportKind::Tcp));
        assert_eq!(TransportKind::from_primitive(17), Some(TransportKind::Udp));
        assert_eq!(TransportKind::from_primitive(1), None);
        assert_eq!("udp".parse::<TransportKind>().unwrap(), TransportKind::Udp);
    }

    #[test]
    fn direction_from_ports() {
        assert_eq!(Direction::from_ports(1080, 1080), Direction::ToServer);
        assert_eq!(Direction::from_ports(40000, 1080), Direction::ToClient);
        assert_eq!(Direction::ToClient.flip(), Direction::ToServer);
    }

    #[test]
    fn ports_low_first() {
        let info = PacketInfo::new(
            1,
            TransportKind::Udp,
            "10.0.0.1:40000".parse().unwrap(),
            "10.0.0.2:5555".parse().unwrap(),
        );
        assert_eq!(info.ports_low_first(), (5555, 40000));
    }
}
