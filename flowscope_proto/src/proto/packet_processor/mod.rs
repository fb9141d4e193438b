//! One processor per protocol. Each exposes a unit [`Dissector`](crate::proto::dispatch::Dissector)
//! that the session registers in its dispatch table.
pub mod includes {
    pub use crate::error::DissectError;
    pub use crate::proto::conversation::{ConversationId, ConversationKey, EndpointKey};
    pub use crate::proto::dispatch::Dissector;
    pub use crate::proto::packet::{ByteView, PacketContext, Pass};
    pub use crate::proto::replay::SnapshotKey;
    pub use crate::proto::session::AnalysisSession;
    pub use crate::proto::tree::ProtoTree;
    pub use flowscope_types::prelude::{
        Direction, Dissection, ExpertGroup, FieldValue, FrameId, ProtocolId, Severity,
        TransportKind,
    };
}

pub mod data_packet;
pub mod dcc_packet;
pub mod msproxy_packet;
pub mod shicp_packet;
pub mod socks_packet;
pub mod socks_udp_packet;
pub mod xcp_packet;
pub mod z21_packet;
