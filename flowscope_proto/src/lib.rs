//! The stateful half of flowscope. An [`AnalysisSession`](crate::proto::session::AnalysisSession)
//! owns every conversation, every per-packet snapshot and the dispatch table; protocol processors
//! live under [`proto::packet_processor`] and keep their per-flow state in
//! [`proto::state_subcontainers`].
//!
//! Packets are analysed once, in capture order. Any later request for an already-analysed frame
//! is a replay: the processors skip their state machines and render from the snapshot written
//! the first time, so the output never drifts.
#![forbid(unsafe_code)]
#![deny(unused_extern_crates, unused_import_braces)]

#[macro_use]
pub mod macros {
    /// Wires a payload type into a tagged enum so the typed stores can hand it out by type
    macro_rules! impl_tagged_kind {
        ($trait_name:ident, $enum_name:ident, $ty:ty, $variant:ident, $protocol:expr) => {
            impl $trait_name for $ty {
                const PROTOCOL: flowscope_types::prelude::ProtocolId = $protocol;

                fn wrap(self) -> $enum_name {
                    $enum_name::$variant(self.into())
                }

                fn peek(state: &$enum_name) -> Option<&Self> {
                    match state {
                        $enum_name::$variant(inner) => {
                            Some(<_ as std::borrow::Borrow<Self>>::borrow(inner))
                        }
                        #[allow(unreachable_patterns)]
                        _ => None,
                    }
                }

                fn peek_mut(state: &mut $enum_name) -> Option<&mut Self> {
                    match state {
                        $enum_name::$variant(inner) => {
                            Some(<_ as std::borrow::BorrowMut<Self>>::borrow_mut(inner))
                        }
                        #[allow(unreachable_patterns)]
                        _ => None,
                    }
                }
            }
        };
    }
}

pub mod constants;
pub mod error;
pub mod proto;

pub mod prelude {
    pub use crate::error::DissectError;
    pub use crate::proto::conversation::{
        Conversation, ConversationId, ConversationKey, ConversationStore, EndpointKey,
    };
    pub use crate::proto::dispatch::{Dissector, RecursionGuard};
    pub use crate::proto::packet::{ByteView, PacketContext, Pass};
    pub use crate::proto::replay::{SnapshotKey, SnapshotStore};
    pub use crate::proto::session::AnalysisSession;
    pub use crate::proto::state_subcontainers::xcp_state_container::{
        DaqModel, OdtRef, PidMap, ResolvedOdt,
    };
    pub use crate::proto::tree::ProtoTree;
    pub use flowscope_types::prelude::*;
}
