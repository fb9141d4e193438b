//! Conversation rewiring. A control flow (a SOCKS UDP ASSOCIATE or BIND grant, an MS Proxy
//! connect acknowledgement) announces an endpoint on which a data flow will appear. That flow is
//! registered here, bound to a dissector ahead of the port table, and optionally seeded with
//! state the control flow already knows.
//!
//! Rewiring runs only during the forward pass and is idempotent: seeing the same grant twice
//! finds the existing conversation and leaves it alone.

use crate::error::DissectError;
use crate::proto::conversation::{ConversationId, ConversationKey, ConversationStore};
use crate::proto::state_subcontainers::FlowState;
use flowscope_types::prelude::{FrameId, ProtocolId};

pub fn spawn_data_conversation(
    store: &mut ConversationStore,
    parent: ConversationId,
    key: ConversationKey,
    dissector: ProtocolId,
    frame: FrameId,
    state: Option<FlowState>,
) -> Result<ConversationId, DissectError> {
    let (id, created) = store.find_or_create_inner(key, frame, Some(parent));

    let current = store
        .get(id)
        .ok_or(DissectError::NotAllocated("conversation"))?
        .dissector();

    match current {
        None => store.set_dissector(id, dissector)?,
        Some(existing) if existing != dissector => {
            log::warn!(target: "flowscope", "{id} is already bound to {existing}; not rebinding it to {dissector}");
        }
        Some(_) => {}
    }

    if let Some(state) = state {
        let _ = store.attach_state(id, state)?;
    }

    if created {
        log::trace!(target: "flowscope", "{parent} spawned {id} ({dissector}) in frame {frame}");
    }

    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::conversation::EndpointKey;
    use crate::proto::state_subcontainers::socks_state_container::SocksFlow;
    use flowscope_types::prelude::TransportKind;
    use std::net::SocketAddr;

    fn relay_key() -> ConversationKey {
        let relay: SocketAddr = "10.0.0.2:40000".parse().unwrap();
        ConversationKey::new(
            TransportKind::Udp,
            EndpointKey::any_port("10.0.0.1".parse().unwrap()),
            EndpointKey::exact(relay),
        )
    }

    #[test]
    fn spawning_twice_yields_one_conversation() {
        let mut store = ConversationStore::default();
        let parent = store.find_or_create(relay_key(), FrameId(1));
        let key = ConversationKey::new(
            TransportKind::Tcp,
            EndpointKey::exact("10.0.0.2:5000".parse().unwrap()),
            EndpointKey::any_port("192.0.2.7".parse().unwrap()),
        );

        let first = spawn_data_conversation(
            &mut store,
            parent,
            key,
            ProtocolId::Socks,
            FrameId(3),
            Some(FlowState::Socks(SocksFlow::new(5000))),
        )
        .unwrap();
        let second = spawn_data_conversation(
            &mut store,
            parent,
            key,
            ProtocolId::Socks,
            FrameId(3),
            Some(FlowState::Socks(SocksFlow::new(6000))),
        )
        .unwrap();

        assert_eq!(first, second);
        assert_eq!(store.len(), 2);
        let conversation = store.get(first).unwrap();
        assert_eq!(conversation.spawned_by(), Some(parent));
        assert_eq!(conversation.dissector(), Some(ProtocolId::Socks));
        assert_eq!(store.state::<SocksFlow>(first).unwrap().server_port, 5000);
    }

    #[test]
    fn existing_binding_is_kept() {
        let mut store = ConversationStore::default();
        let parent = store.find_or_create(relay_key(), FrameId(1));
        let key = ConversationKey::new(
            TransportKind::Udp,
            EndpointKey::exact("10.0.0.9:7000".parse().unwrap()),
            EndpointKey::any_port("10.0.0.1".parse().unwrap()),
        );

        let id = spawn_data_conversation(&mut store, parent, key, ProtocolId::SocksUdp, FrameId(2), None)
            .unwrap();
        let _ = spawn_data_conversation(&mut store, parent, key, ProtocolId::MsProxyData, FrameId(4), None)
            .unwrap();
        assert_eq!(store.get(id).unwrap().dissector(), Some(ProtocolId::SocksUdp));
    }
}
