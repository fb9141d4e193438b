//! Port and heuristic dispatch, plus the guard that keeps a dissector from re-entering itself
//! on the same flow through a tunnelled payload.

use crate::error::DissectError;
use crate::proto::conversation::ConversationId;
use crate::proto::packet::PacketContext;
use crate::proto::session::AnalysisSession;
use crate::proto::tree::ProtoTree;
use flowscope_types::prelude::{ProtocolId, TransportKind};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

/// A protocol decoder. Implementations are stateless: per-flow state lives in the session's
/// conversation store and per-packet decisions in its snapshot store
pub trait Dissector {
    fn protocol(&self) -> ProtocolId;

    /// Decodes `data` into `tree` and returns how many bytes were accounted for
    fn dissect(
        &self,
        session: &mut AnalysisSession,
        ctx: &PacketContext,
        data: &[u8],
        tree: &mut ProtoTree,
    ) -> Result<usize, DissectError>;

    /// Whether `data` looks like this protocol when no port claimed it
    fn heuristic(&self, _session: &AnalysisSession, _ctx: &PacketContext, _data: &[u8]) -> bool {
        false
    }
}

#[derive(Default)]
pub struct DispatchTable {
    dissectors: HashMap<ProtocolId, Rc<dyn Dissector>>,
    ports: HashMap<(TransportKind, u16), ProtocolId>,
    heuristics: Vec<(TransportKind, ProtocolId)>,
}

impl DispatchTable {
    pub fn register(&mut self, dissector: Rc<dyn Dissector>) {
        let _ = self.dissectors.insert(dissector.protocol(), dissector);
    }

    pub fn register_port(&mut self, transport: TransportKind, port: u16, protocol: ProtocolId) {
        if let Some(previous) = self.ports.insert((transport, port), protocol) {
            if previous != protocol {
                log::warn!(target: "flowscope", "{transport}/{port} moved from {previous} to {protocol}");
            }
        }
    }

    /// Heuristics are tried in registration order
    pub fn register_heuristic(&mut self, transport: TransportKind, protocol: ProtocolId) {
        if !self.heuristics.contains(&(transport, protocol)) {
            self.heuristics.push((transport, protocol));
        }
    }

    pub fn dissector(&self, protocol: ProtocolId) -> Option<Rc<dyn Dissector>> {
        self.dissectors.get(&protocol).cloned()
    }

    pub fn by_port(&self, transport: TransportKind, port: u16) -> Option<ProtocolId> {
        self.ports.get(&(transport, port)).copied()
    }

    /// The lower port is consulted first, then the other
    pub fn by_ports(&self, transport: TransportKind, ports: (u16, u16)) -> Option<(ProtocolId, u16)> {
        let (low, high) = ports;
        self.by_port(transport, low)
            .map(|protocol| (protocol, low))
            .or_else(|| self.by_port(transport, high).map(|protocol| (protocol, high)))
    }

    pub fn heuristics(&self, transport: TransportKind) -> Vec<Rc<dyn Dissector>> {
        self.heuristics
            .iter()
            .filter(|(t, _)| *t == transport)
            .filter_map(|(_, protocol)| self.dissector(*protocol))
            .collect()
    }
}

/// Why a dissector was not allowed to run
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum GuardRefusal {
    /// The same dissector is already running on this flow further up the stack
    Reentrant,
    /// The configured nesting limit was reached
    TooDeep { limit: usize },
}

/// Dissectors currently on the stack, per flow, and the current nesting depth
#[derive(Default, Clone)]
pub struct GuardSet {
    active: Rc<RefCell<HashSet<(ConversationId, ProtocolId)>>>,
    depth: Rc<Cell<usize>>,
}

impl GuardSet {
    pub fn enter(
        &self,
        conversation: ConversationId,
        protocol: ProtocolId,
        max_depth: usize,
    ) -> Result<RecursionGuard, GuardRefusal> {
        if self.depth.get() >= max_depth {
            return Err(GuardRefusal::TooDeep { limit: max_depth });
        }

        if !self.active.borrow_mut().insert((conversation, protocol)) {
            return Err(GuardRefusal::Reentrant);
        }

        self.depth.set(self.depth.get() + 1);
        Ok(RecursionGuard {
            set: self.clone(),
            key: (conversation, protocol),
        })
    }

    pub fn is_active(&self, conversation: ConversationId, protocol: ProtocolId) -> bool {
        self.active.borrow().contains(&(conversation, protocol))
    }

    pub fn depth(&self) -> usize {
        self.depth.get()
    }
}

/// Marks a dissector as running on a flow. Dropping it, on any exit path, clears the mark
pub struct RecursionGuard {
    set: GuardSet,
    key: (ConversationId, ProtocolId),
}

impl Drop for RecursionGuard {
    fn drop(&mut self) {
        let _ = self.set.active.borrow_mut().remove(&self.key);
        self.set.depth.set(self.set.depth.get().saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::conversation::{ConversationKey, ConversationStore};
    use flowscope_types::prelude::{FrameId, PacketInfo};

    fn conversation() -> ConversationId {
        let info = PacketInfo::new(
            1,
            TransportKind::Tcp,
            "10.0.0.1:40000".parse().unwrap(),
            "10.0.0.2:1080".parse().unwrap(),
        );
        ConversationStore::default().find_or_create(ConversationKey::from_packet(&info), FrameId(1))
    }

    #[test]
    fn guard_refuses_reentry_and_releases_on_drop() {
        let guards = GuardSet::default();
        let conv = conversation();
        {
            let _outer = guards.enter(conv, ProtocolId::Socks, 8).unwrap();
            assert!(guards.is_active(conv, ProtocolId::Socks));
            assert_eq!(
                guards.enter(conv, ProtocolId::Socks, 8).err(),
                Some(GuardRefusal::Reentrant)
            );
            let _inner = guards.enter(conv, ProtocolId::Data, 8).unwrap();
            assert_eq!(guards.depth(), 2);
        }
        assert_eq!(guards.depth(), 0);
        assert!(!guards.is_active(conv, ProtocolId::Socks));
        assert!(guards.enter(conv, ProtocolId::Socks, 8).is_ok());
    }

    #[test]
    fn guard_released_when_unwinding() {
        let guards = GuardSet::default();
        let conv = conversation();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = guards.enter(conv, ProtocolId::Xcp, 8).unwrap();
            panic!("dissector blew up");
        }));
        assert!(result.is_err());
        assert!(!guards.is_active(conv, ProtocolId::Xcp));
        assert_eq!(guards.depth(), 0);
    }

    #[test]
    fn depth_limit() {
        let guards = GuardSet::default();
        let conv = conversation();
        let _a = guards.enter(conv, ProtocolId::Socks, 2).unwrap();
        let _b = guards.enter(conv, ProtocolId::SocksUdp, 2).unwrap();
        assert_eq!(
            guards.enter(conv, ProtocolId::Data, 2).err(),
            Some(GuardRefusal::TooDeep { limit: 2 })
        );
    }

    #[test]
    fn lower_port_wins() {
        let mut table = DispatchTable::default();
        table.register_port(TransportKind::Udp, 5555, ProtocolId::Xcp);
        table.register_port(TransportKind::Udp, 1745, ProtocolId::MsProxy);
        assert_eq!(
            table.by_ports(TransportKind::Udp, (1745, 5555)),
            Some((ProtocolId::MsProxy, 1745))
        );
        assert_eq!(
            table.by_ports(TransportKind::Udp, (1000, 5555)),
            Some((ProtocolId::Xcp, 5555))
        );
        assert_eq!(table.by_ports(TransportKind::Tcp, (1000, 5555)), None);
    }
}
