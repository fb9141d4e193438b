//! The analysis session. It replaces every piece of process-wide state a dissector might want:
//! conversations, snapshots, the dispatch table and the recursion guard all live here and die
//! with the session.

use crate::proto::conversation::{ConversationId, ConversationKey, ConversationStore};
use crate::proto::dispatch::{DispatchTable, Dissector, GuardRefusal, GuardSet};
use crate::proto::packet::{PacketContext, Pass};
use crate::proto::packet_processor::data_packet::{self, DataDissector};
use crate::proto::packet_processor::dcc_packet::DccDissector;
use crate::proto::packet_processor::msproxy_packet::{MsProxyDataDissector, MsProxyDissector};
use crate::proto::packet_processor::shicp_packet::ShicpDissector;
use crate::proto::packet_processor::socks_packet::SocksDissector;
use crate::proto::packet_processor::socks_udp_packet::SocksUdpDissector;
use crate::proto::packet_processor::xcp_packet::XcpDissector;
use crate::proto::packet_processor::z21_packet::Z21Dissector;
use crate::proto::replay::{Route, SnapshotStore};
use crate::proto::tree::ProtoTree;
use flowscope_types::prelude::{
    AnalysisConfig, Dissection, ExpertGroup, FrameId, PacketInfo, ProtocolId, Severity,
    TransportKind,
};
use std::collections::HashSet;
use std::rc::Rc;
use uuid::Uuid;

pub struct AnalysisSession {
    id: Uuid,
    config: AnalysisConfig,
    conversations: ConversationStore,
    snapshots: SnapshotStore,
    dispatch: DispatchTable,
    guards: GuardSet,
    visited: HashSet<FrameId>,
}

impl AnalysisSession {
    /// Creates a session with every built-in dissector registered on the configured ports
    pub fn new(config: AnalysisConfig) -> Self {
        let mut dispatch = DispatchTable::default();
        dispatch.register(Rc::new(DataDissector));
        dispatch.register(Rc::new(SocksDissector));
        dispatch.register(Rc::new(SocksUdpDissector));
        dispatch.register(Rc::new(XcpDissector));
        dispatch.register(Rc::new(MsProxyDissector));
        dispatch.register(Rc::new(MsProxyDataDissector));
        dispatch.register(Rc::new(Z21Dissector));
        dispatch.register(Rc::new(DccDissector));
        dispatch.register(Rc::new(ShicpDissector));

        let claims = [
            (TransportKind::Tcp, &config.socks.tcp_ports, ProtocolId::Socks),
            (TransportKind::Udp, &config.xcp.udp_ports, ProtocolId::Xcp),
            (TransportKind::Tcp, &config.xcp.tcp_ports, ProtocolId::Xcp),
            (TransportKind::Udp, &config.msproxy.udp_ports, ProtocolId::MsProxy),
            (TransportKind::Udp, &config.z21.udp_ports, ProtocolId::Z21),
            (TransportKind::Udp, &config.dcc.udp_ports, ProtocolId::Dcc),
            (TransportKind::Udp, &config.shicp.udp_ports, ProtocolId::Shicp),
        ];

        for (transport, ports, protocol) in claims {
            for port in ports {
                dispatch.register_port(transport, *port, protocol);
            }
        }

        if config.shicp.heuristic {
            dispatch.register_heuristic(TransportKind::Udp, ProtocolId::Shicp);
        }

        let id = Uuid::new_v4();
        log::trace!(target: "flowscope", "Analysis session {id} created");

        Self {
            id,
            config,
            conversations: ConversationStore::default(),
            snapshots: SnapshotStore::default(),
            dispatch,
            guards: GuardSet::default(),
            visited: HashSet::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    pub fn conversations_mut(&mut self) -> &mut ConversationStore {
        &mut self.conversations
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn snapshots_mut(&mut self) -> &mut SnapshotStore {
        &mut self.snapshots
    }

    pub fn guards(&self) -> &GuardSet {
        &self.guards
    }

    /// Registers an extra dissector on the given ports
    pub fn register_dissector(
        &mut self,
        dissector: Rc<dyn Dissector>,
        ports: &[(TransportKind, u16)],
    ) {
        let protocol = dissector.protocol();
        self.dispatch.register(dissector);
        for (transport, port) in ports {
            self.dispatch.register_port(*transport, *port, protocol);
        }
    }

    pub fn register_heuristic(&mut self, transport: TransportKind, protocol: ProtocolId) {
        self.dispatch.register_heuristic(transport, protocol);
    }

    pub fn is_visited(&self, frame: FrameId) -> bool {
        self.visited.contains(&frame)
    }

    /// The conversation the frame was routed through on its first pass
    pub fn conversation_of(&self, frame: FrameId) -> Option<ConversationId> {
        self.snapshots.route(frame).map(|route| route.conversation)
    }

    /// Analyses one packet. The first call for a frame is the forward pass; every later call
    /// for the same frame replays it and yields identical output. Never fails: problems become
    /// expert records on the returned dissection
    #[cfg_attr(feature = "verbose-tracing", tracing::instrument(
        level = "trace",
        target = "flowscope",
        skip_all,
        fields(frame = %info.frame, transport = %info.transport)
    ))]
    pub fn dissect_packet(&mut self, info: PacketInfo, bytes: &[u8]) -> Dissection {
        let pass = if self.visited.contains(&info.frame) {
            Pass::Replay
        } else {
            Pass::First
        };

        let route = match pass {
            Pass::First => {
                let route = self.route_first_pass(&info, bytes);
                self.snapshots.record_route(info.frame, route);
                route
            }

            Pass::Replay => match self.snapshots.route(info.frame) {
                Some(route) => route,
                None => return not_analysed(info.frame, bytes),
            },
        };

        let mut ctx = PacketContext::new(info, pass, route.conversation);
        ctx.matched_port = route.matched_port;

        let dissection = self.call_dissector(route.protocol, &ctx, bytes);
        let _ = self.visited.insert(info.frame);
        dissection
    }

    /// Re-renders a frame that was already analysed. Refuses, without touching any state,
    /// frames the session has not seen
    pub fn replay(&mut self, info: PacketInfo, bytes: &[u8]) -> Dissection {
        if !self.visited.contains(&info.frame) {
            log::warn!(target: "flowscope", "Replay requested for unseen frame {}", info.frame);
            return not_analysed(info.frame, bytes);
        }

        self.dissect_packet(info, bytes)
    }

    /// Hands a tunnelled payload to whichever dissector claims `port`, falling back to the
    /// heuristics and then to raw data
    pub fn dispatch_payload(
        &mut self,
        ctx: &PacketContext,
        transport: TransportKind,
        port: u16,
        data: &[u8],
    ) -> Dissection {
        let mut nested = ctx.clone();
        nested.info.transport = transport;
        nested.matched_port = Some(port);

        let protocol = match self.dispatch.by_port(transport, port) {
            Some(protocol) => protocol,
            None => self
                .dispatch
                .heuristics(transport)
                .into_iter()
                .find(|dissector| dissector.heuristic(self, &nested, data))
                .map(|dissector| dissector.protocol())
                .unwrap_or(ProtocolId::Data),
        };

        log::debug!(target: "flowscope", "Dispatching {} tunnelled bytes on {transport}/{port} to {protocol}", data.len());
        self.call_dissector(protocol, &nested, data)
    }

    fn route_first_pass(&mut self, info: &PacketInfo, bytes: &[u8]) -> Route {
        let conversation = match self.conversations.find_for_packet(info) {
            Some(id) => id,
            None => self
                .conversations
                .find_or_create(ConversationKey::from_packet(info), info.frame),
        };

        if let Some(protocol) = self
            .conversations
            .get(conversation)
            .and_then(|conversation| conversation.dissector())
        {
            return Route {
                conversation,
                protocol,
                matched_port: None,
            };
        }

        if let Some((protocol, port)) = self
            .dispatch
            .by_ports(info.transport, info.ports_low_first())
        {
            return Route {
                conversation,
                protocol,
                matched_port: Some(port),
            };
        }

        let ctx = PacketContext::new(*info, Pass::First, conversation);
        let protocol = self
            .dispatch
            .heuristics(info.transport)
            .into_iter()
            .find(|dissector| dissector.heuristic(self, &ctx, bytes))
            .map(|dissector| dissector.protocol())
            .unwrap_or(ProtocolId::Data);

        Route {
            conversation,
            protocol,
            matched_port: None,
        }
    }

    pub(crate) fn call_dissector(
        &mut self,
        protocol: ProtocolId,
        ctx: &PacketContext,
        data: &[u8],
    ) -> Dissection {
        let _guard =
            match self
                .guards
                .enter(ctx.conversation, protocol, self.config.max_dispatch_depth)
            {
                Ok(guard) => guard,
                Err(refusal) => return refused(protocol, refusal, data),
            };

        let dissector = self
            .dispatch
            .dissector(protocol)
            .unwrap_or_else(|| Rc::new(DataDissector));

        let mut ctx = ctx.clone();
        ctx.depth = self.guards.depth();

        let mut tree = ProtoTree::new(dissector.protocol());
        match dissector.dissect(self, &ctx, data, &mut tree) {
            Ok(consumed) => tree.set_consumed(consumed.min(data.len())),
            Err(err) => {
                log::warn!(target: "flowscope", "{protocol} failed on frame {}: {err}", ctx.frame());
                tree.expert(
                    Severity::Error,
                    err.expert_group(),
                    0..data.len(),
                    err.into_string(),
                );
                tree.set_consumed(data.len());
            }
        }

        tree.finish()
    }
}

fn refused(protocol: ProtocolId, refusal: GuardRefusal, data: &[u8]) -> Dissection {
    let message = match refusal {
        GuardRefusal::Reentrant => {
            format!("Recursive {protocol} dissection on the same flow suppressed")
        }
        GuardRefusal::TooDeep { limit } => {
            format!("Dispatch depth limit of {limit} reached before {protocol}")
        }
    };

    log::warn!(target: "flowscope", "{message}");
    let mut tree = ProtoTree::new(ProtocolId::Data);
    tree.expert(Severity::Warn, ExpertGroup::Protocol, 0..data.len(), message);
    data_packet::render(&mut tree, data);
    tree.set_consumed(data.len());
    tree.finish()
}

fn not_analysed(frame: FrameId, data: &[u8]) -> Dissection {
    let mut tree = ProtoTree::new(ProtocolId::Data);
    tree.expert(
        Severity::Error,
        ExpertGroup::Sequence,
        0..data.len(),
        format!("Frame {frame} has not been analysed yet"),
    );
    tree.finish()
}
