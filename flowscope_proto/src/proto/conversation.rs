//! Session-scoped registry of flows. A conversation is created the first time a flow is seen,
//! found again by the same key in either direction, and lives until the session is dropped.
//! Conversations are kept in an arena and addressed by index; they are never freed one by one.

use crate::error::DissectError;
use crate::proto::state_subcontainers::{FlowState, FlowStateKind};
use flowscope_types::prelude::{FrameId, PacketInfo, ProtocolId, TransportKind};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::net::{IpAddr, SocketAddr};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
pub struct ConversationId(usize);

impl ConversationId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl Display for ConversationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "conv#{}", self.0)
    }
}

/// One side of a conversation. A missing port matches any port
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct EndpointKey {
    pub ip: IpAddr,
    pub port: Option<u16>,
}

impl EndpointKey {
    pub fn exact(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            port: Some(addr.port()),
        }
    }

    pub fn any_port(ip: IpAddr) -> Self {
        Self { ip, port: None }
    }

    pub fn is_wildcard(&self) -> bool {
        self.port.is_none()
    }
}

/// An unordered pair of endpoints plus the transport. Both orders of the same pair produce an
/// equal key
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ConversationKey {
    transport: TransportKind,
    endpoints: [EndpointKey; 2],
}

impl ConversationKey {
    pub fn new(transport: TransportKind, a: EndpointKey, b: EndpointKey) -> Self {
        let endpoints = if a <= b { [a, b] } else { [b, a] };
        Self {
            transport,
            endpoints,
        }
    }

    pub fn from_packet(info: &PacketInfo) -> Self {
        Self::new(
            info.transport,
            EndpointKey::exact(info.src),
            EndpointKey::exact(info.dst),
        )
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn endpoints(&self) -> &[EndpointKey; 2] {
        &self.endpoints
    }

    pub fn has_wildcard(&self) -> bool {
        self.endpoints.iter().any(EndpointKey::is_wildcard)
    }
}

pub struct Conversation {
    id: ConversationId,
    key: ConversationKey,
    created_in: FrameId,
    /// Routes every packet of this conversation to one dissector, ahead of the port table
    dissector: Option<ProtocolId>,
    spawned_by: Option<ConversationId>,
    states: HashMap<ProtocolId, FlowState>,
}

impl Conversation {
    pub fn id(&self) -> ConversationId {
        self.id
    }

    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    pub fn created_in(&self) -> FrameId {
        self.created_in
    }

    pub fn dissector(&self) -> Option<ProtocolId> {
        self.dissector
    }

    pub fn spawned_by(&self) -> Option<ConversationId> {
        self.spawned_by
    }

    pub fn has_state(&self, protocol: ProtocolId) -> bool {
        self.states.contains_key(&protocol)
    }
}

#[derive(Default)]
pub struct ConversationStore {
    conversations: Vec<Conversation>,
    index: HashMap<ConversationKey, ConversationId>,
}

impl ConversationStore {
    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    pub fn find(&self, key: &ConversationKey) -> Option<ConversationId> {
        self.index.get(key).copied()
    }

    /// Exact match first, then a conversation that left either port open
    pub fn find_for_packet(&self, info: &PacketInfo) -> Option<ConversationId> {
        let src = EndpointKey::exact(info.src);
        let dst = EndpointKey::exact(info.dst);

        [
            ConversationKey::new(info.transport, src, dst),
            ConversationKey::new(info.transport, EndpointKey::any_port(src.ip), dst),
            ConversationKey::new(info.transport, src, EndpointKey::any_port(dst.ip)),
        ]
        .iter()
        .find_map(|key| self.find(key))
    }

    pub fn find_or_create(&mut self, key: ConversationKey, frame: FrameId) -> ConversationId {
        self.find_or_create_inner(key, frame, None).0
    }

    /// Returns the id and whether the conversation was created by this call
    pub(crate) fn find_or_create_inner(
        &mut self,
        key: ConversationKey,
        frame: FrameId,
        spawned_by: Option<ConversationId>,
    ) -> (ConversationId, bool) {
        if let Some(id) = self.find(&key) {
            return (id, false);
        }

        let id = ConversationId(self.conversations.len());
        log::trace!(target: "flowscope", "Creating {id} for {key:?} in frame {frame}");
        self.conversations.push(Conversation {
            id,
            key,
            created_in: frame,
            dissector: None,
            spawned_by,
            states: HashMap::new(),
        });
        let _ = self.index.insert(key, id);
        (id, true)
    }

    pub fn get(&self, id: ConversationId) -> Option<&Conversation> {
        self.conversations.get(id.0)
    }

    fn get_mut(&mut self, id: ConversationId) -> Result<&mut Conversation, DissectError> {
        self.conversations
            .get_mut(id.0)
            .ok_or(DissectError::NotAllocated("conversation"))
    }

    pub fn state<T: FlowStateKind>(&self, id: ConversationId) -> Option<&T> {
        self.get(id)?.states.get(&T::PROTOCOL).and_then(T::peek)
    }

    pub fn state_mut<T: FlowStateKind>(&mut self, id: ConversationId) -> Option<&mut T> {
        self.conversations
            .get_mut(id.0)?
            .states
            .get_mut(&T::PROTOCOL)
            .and_then(T::peek_mut)
    }

    /// Attaches state for `T::PROTOCOL`. A conversation holds at most one state per protocol,
    /// so this fails if one is already present
    pub fn set_state<T: FlowStateKind>(
        &mut self,
        id: ConversationId,
        state: T,
    ) -> Result<(), DissectError> {
        let conversation = self.get_mut(id)?;
        if conversation.states.contains_key(&T::PROTOCOL) {
            return Err(DissectError::StateAlreadyExists(T::PROTOCOL));
        }

        let _ = conversation.states.insert(T::PROTOCOL, state.wrap());
        Ok(())
    }

    /// Attaches already-wrapped state unless the conversation holds state for that protocol.
    /// Returns whether the state was attached
    pub(crate) fn attach_state(
        &mut self,
        id: ConversationId,
        state: FlowState,
    ) -> Result<bool, DissectError> {
        let conversation = self.get_mut(id)?;
        let protocol = state.protocol();
        if conversation.states.contains_key(&protocol) {
            return Ok(false);
        }

        let _ = conversation.states.insert(protocol, state);
        Ok(true)
    }

    pub fn state_or_insert_with<T: FlowStateKind>(
        &mut self,
        id: ConversationId,
        init: impl FnOnce() -> T,
    ) -> Result<&mut T, DissectError> {
        let conversation = self.get_mut(id)?;
        let state = conversation
            .states
            .entry(T::PROTOCOL)
            .or_insert_with(|| init().wrap());
        T::peek_mut(state).ok_or(DissectError::InvalidPacket(
            "Conversation state is tagged with the wrong protocol",
        ))
    }

    pub fn set_dissector(
        &mut self,
        id: ConversationId,
        protocol: ProtocolId,
    ) -> Result<(), DissectError> {
        self.get_mut(id)?.dissector = Some(protocol);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Conversation> {
        self.conversations.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::state_subcontainers::socks_state_container::SocksFlow;

    fn info(src: &str, dst: &str) -> PacketInfo {
        PacketInfo::new(
            1,
            TransportKind::Tcp,
            src.parse().unwrap(),
            dst.parse().unwrap(),
        )
    }

    #[test]
    fn key_is_order_independent() {
        let forward = info("10.0.0.1:40000", "10.0.0.2:1080");
        let backward = info("10.0.0.2:1080", "10.0.0.1:40000");
        assert_eq!(
            ConversationKey::from_packet(&forward),
            ConversationKey::from_packet(&backward)
        );

        let mut store = ConversationStore::default();
        let a = store.find_or_create(ConversationKey::from_packet(&forward), FrameId(1));
        let b = store.find_or_create(ConversationKey::from_packet(&backward), FrameId(2));
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(a).unwrap().created_in(), FrameId(1));
    }

    #[test]
    fn transport_separates_conversations() {
        let tcp = info("10.0.0.1:40000", "10.0.0.2:1080");
        let mut udp = tcp;
        udp.transport = TransportKind::Udp;
        assert_ne!(
            ConversationKey::from_packet(&tcp),
            ConversationKey::from_packet(&udp)
        );
    }

    #[test]
    fn wildcard_port_matches_any_source_port() {
        let mut store = ConversationStore::default();
        let key = ConversationKey::new(
            TransportKind::Tcp,
            EndpointKey::any_port("10.0.0.1".parse().unwrap()),
            EndpointKey::exact("10.0.0.2:5000".parse().unwrap()),
        );
        let id = store.find_or_create(key, FrameId(3));
        assert!(key.has_wildcard());

        assert_eq!(
            store.find_for_packet(&info("10.0.0.1:41234", "10.0.0.2:5000")),
            Some(id)
        );
        assert_eq!(
            store.find_for_packet(&info("10.0.0.2:5000", "10.0.0.1:999")),
            Some(id)
        );
        assert_eq!(
            store.find_for_packet(&info("10.0.0.1:41234", "10.0.0.2:5001")),
            None
        );
    }

    #[test]
    fn one_state_per_protocol() {
        let mut store = ConversationStore::default();
        let id = store.find_or_create(
            ConversationKey::from_packet(&info("10.0.0.1:40000", "10.0.0.2:1080")),
            FrameId(1),
        );
        assert!(store.state::<SocksFlow>(id).is_none());
        store.set_state(id, SocksFlow::new(1080)).unwrap();
        assert!(matches!(
            store.set_state(id, SocksFlow::new(1080)),
            Err(DissectError::StateAlreadyExists(ProtocolId::Socks))
        ));
        assert_eq!(store.state::<SocksFlow>(id).unwrap().server_port, 1080);
    }
}
