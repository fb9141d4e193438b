//! Per-packet snapshots. The first time a frame is analysed every processor writes down what
//! the packet meant at that moment; any later look at the same frame renders from that record
//! and never touches flow state. Snapshots are write-once.

use crate::error::DissectError;
use crate::proto::conversation::ConversationId;
use crate::proto::packet::{PacketContext, Pass};
use crate::proto::packet_processor::xcp_packet::XcpSnapshot;
use crate::proto::state_subcontainers::dcc_state_container::DccSnapshot;
use crate::proto::state_subcontainers::msproxy_state_container::{
    MsProxySnapshot, RedirectTarget,
};
use crate::proto::state_subcontainers::socks_state_container::SocksSnapshot;
use crate::proto::state_subcontainers::z21_state_container::Z21Snapshot;
use bytes::Bytes;
use flowscope_types::prelude::{FrameId, ProtocolId};
use flowscope_wire::FramingError;
use std::collections::HashMap;

/// Identifies one PDU's snapshot: the frame, the protocol that wrote it, and the PDU's position
/// among those that protocol found in the frame
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct SnapshotKey {
    pub frame: FrameId,
    pub protocol: ProtocolId,
    pub index: u32,
}

impl SnapshotKey {
    pub fn new(ctx: &PacketContext, protocol: ProtocolId, index: usize) -> Self {
        Self {
            frame: ctx.frame(),
            protocol,
            index: index as u32,
        }
    }
}

/// What a stream framer produced from one frame's bytes
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StreamSegment {
    pub pdus: Vec<Bytes>,
    /// Bytes held back for a later frame
    pub buffered: usize,
    pub discarded: usize,
    pub error: Option<FramingError>,
}

/// How the outermost dissector for a frame was chosen
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Route {
    pub conversation: ConversationId,
    pub protocol: ProtocolId,
    pub matched_port: Option<u16>,
}

pub enum PacketSnapshot {
    Socks(SocksSnapshot),
    Xcp(XcpSnapshot),
    Stream(StreamSegment),
    MsProxy(MsProxySnapshot),
    MsProxyData(RedirectTarget),
    Z21(Z21Snapshot),
    Dcc(DccSnapshot),
}

pub trait SnapshotKind: Sized + Clone {
    const PROTOCOL: ProtocolId;

    fn wrap(self) -> PacketSnapshot;
    fn peek(snapshot: &PacketSnapshot) -> Option<&Self>;
    fn peek_mut(snapshot: &mut PacketSnapshot) -> Option<&mut Self>;
}

impl_tagged_kind!(SnapshotKind, PacketSnapshot, SocksSnapshot, Socks, ProtocolId::Socks);
impl_tagged_kind!(SnapshotKind, PacketSnapshot, XcpSnapshot, Xcp, ProtocolId::Xcp);
impl_tagged_kind!(SnapshotKind, PacketSnapshot, StreamSegment, Stream, ProtocolId::Xcp);
impl_tagged_kind!(SnapshotKind, PacketSnapshot, MsProxySnapshot, MsProxy, ProtocolId::MsProxy);
impl_tagged_kind!(
    SnapshotKind,
    PacketSnapshot,
    RedirectTarget,
    MsProxyData,
    ProtocolId::MsProxyData
);
impl_tagged_kind!(SnapshotKind, PacketSnapshot, Z21Snapshot, Z21, ProtocolId::Z21);
impl_tagged_kind!(SnapshotKind, PacketSnapshot, DccSnapshot, Dcc, ProtocolId::Dcc);

#[derive(Default)]
pub struct SnapshotStore {
    snapshots: HashMap<SnapshotKey, PacketSnapshot>,
    routes: HashMap<FrameId, Route>,
}

impl SnapshotStore {
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn contains(&self, key: &SnapshotKey) -> bool {
        self.snapshots.contains_key(key)
    }

    /// Writes a snapshot. An existing snapshot is never replaced
    pub fn record<T: SnapshotKind>(
        &mut self,
        key: SnapshotKey,
        snapshot: T,
    ) -> Result<(), DissectError> {
        if self.snapshots.contains_key(&key) {
            log::warn!(target: "flowscope", "Refusing to overwrite the snapshot for {key:?}");
            return Err(DissectError::StateAlreadyExists(key.protocol));
        }

        let _ = self.snapshots.insert(key, snapshot.wrap());
        Ok(())
    }

    pub fn get<T: SnapshotKind>(&self, key: &SnapshotKey) -> Option<&T> {
        self.snapshots.get(key).and_then(T::peek)
    }

    /// The snapshot written during the forward pass
    pub fn replayed<T: SnapshotKind>(&self, key: &SnapshotKey) -> Result<T, DissectError> {
        self.get::<T>(key)
            .cloned()
            .ok_or(DissectError::NotAllocated("Packet snapshot"))
    }

    /// On the first pass computes the decision and records it; on replay returns the recorded one
    pub fn decide<T: SnapshotKind>(
        &mut self,
        ctx: &PacketContext,
        key: SnapshotKey,
        compute: impl FnOnce() -> Result<T, DissectError>,
    ) -> Result<T, DissectError> {
        match ctx.pass {
            Pass::First => {
                let snapshot = compute()?;
                self.record(key, snapshot.clone())?;
                Ok(snapshot)
            }

            Pass::Replay => self.replayed(&key),
        }
    }

    pub(crate) fn record_route(&mut self, frame: FrameId, route: Route) {
        let _ = self.routes.entry(frame).or_insert(route);
    }

    pub(crate) fn route(&self, frame: FrameId) -> Option<Route> {
        self.routes.get(&frame).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::conversation::{ConversationKey, ConversationStore};
    use crate::proto::state_subcontainers::socks_state_container::{ClientState, ServerState};
    use flowscope_types::prelude::{Direction, PacketInfo, TransportKind};

    fn snapshot(client_after: ClientState) -> SocksSnapshot {
        SocksSnapshot {
            direction: Direction::ToServer,
            version: Some(5),
            client_before: ClientState::Start,
            server_before: ServerState::Start,
            client_after,
            server_after: ServerState::InitReply,
            auth_method: None,
            command: None,
            payload_port: None,
            remote: None,
        }
    }

    fn ctx(pass: Pass) -> PacketContext {
        let info = PacketInfo::new(
            7,
            TransportKind::Tcp,
            "10.0.0.1:40000".parse().unwrap(),
            "10.0.0.2:1080".parse().unwrap(),
        );
        let mut store = ConversationStore::default();
        let conversation = store.find_or_create(ConversationKey::from_packet(&info), info.frame);
        PacketContext::new(info, pass, conversation)
    }

    #[test]
    fn snapshots_are_write_once() {
        let mut store = SnapshotStore::default();
        let key = SnapshotKey::new(&ctx(Pass::First), ProtocolId::Socks, 0);
        store.record(key, snapshot(ClientState::Start)).unwrap();
        assert!(store.record(key, snapshot(ClientState::Error)).is_err());
        assert_eq!(
            store.get::<SocksSnapshot>(&key).unwrap().client_after,
            ClientState::Start
        );
        assert!(store.get::<Z21Snapshot>(&key).is_none());
    }

    #[test]
    fn replay_does_not_recompute() {
        let mut store = SnapshotStore::default();
        let first = ctx(Pass::First);
        let key = SnapshotKey::new(&first, ProtocolId::Socks, 0);
        let decided = store
            .decide(&first, key, || Ok(snapshot(ClientState::Start)))
            .unwrap();

        let replay = ctx(Pass::Replay);
        let replayed: SocksSnapshot = store
            .decide(&replay, key, || panic!("replay must not recompute"))
            .unwrap();
        assert_eq!(decided, replayed);
    }

    #[test]
    fn replay_without_snapshot_is_reported() {
        let mut store = SnapshotStore::default();
        let replay = ctx(Pass::Replay);
        let key = SnapshotKey::new(&replay, ProtocolId::Socks, 3);
        assert!(matches!(
            store.decide::<SocksSnapshot>(&replay, key, || unreachable!()),
            Err(DissectError::NotAllocated(_))
        ));
    }
}
