//! Typed per-flow state. Each protocol owns at most one entry per conversation, tagged by its
//! [`ProtocolId`], so no caller ever downcasts an opaque blob.

use crate::proto::state_subcontainers::dcc_state_container::DccFlow;
use crate::proto::state_subcontainers::msproxy_state_container::{MsProxyFlow, RedirectTarget};
use crate::proto::state_subcontainers::socks_state_container::SocksFlow;
use crate::proto::state_subcontainers::xcp_state_container::XcpFlow;
use crate::proto::state_subcontainers::z21_state_container::Z21Flow;
use flowscope_types::prelude::ProtocolId;

pub mod dcc_state_container;
pub mod msproxy_state_container;
pub mod socks_state_container;
pub mod xcp_state_container;
pub mod z21_state_container;

pub enum FlowState {
    Socks(SocksFlow),
    Xcp(Box<XcpFlow>),
    MsProxy(MsProxyFlow),
    MsProxyData(RedirectTarget),
    Z21(Z21Flow),
    Dcc(DccFlow),
}

impl FlowState {
    pub fn protocol(&self) -> ProtocolId {
        match self {
            FlowState::Socks(_) => ProtocolId::Socks,
            FlowState::Xcp(_) => ProtocolId::Xcp,
            FlowState::MsProxy(_) => ProtocolId::MsProxy,
            FlowState::MsProxyData(_) => ProtocolId::MsProxyData,
            FlowState::Z21(_) => ProtocolId::Z21,
            FlowState::Dcc(_) => ProtocolId::Dcc,
        }
    }
}

/// Implemented by every type that may be stored as [`FlowState`]
pub trait FlowStateKind: Sized {
    const PROTOCOL: ProtocolId;

    fn wrap(self) -> FlowState;
    fn peek(state: &FlowState) -> Option<&Self>;
    fn peek_mut(state: &mut FlowState) -> Option<&mut Self>;
}

impl_tagged_kind!(FlowStateKind, FlowState, SocksFlow, Socks, ProtocolId::Socks);
impl_tagged_kind!(FlowStateKind, FlowState, XcpFlow, Xcp, ProtocolId::Xcp);
impl_tagged_kind!(FlowStateKind, FlowState, MsProxyFlow, MsProxy, ProtocolId::MsProxy);
impl_tagged_kind!(
    FlowStateKind,
    FlowState,
    RedirectTarget,
    MsProxyData,
    ProtocolId::MsProxyData
);
impl_tagged_kind!(FlowStateKind, FlowState, Z21Flow, Z21, ProtocolId::Z21);
impl_tagged_kind!(FlowStateKind, FlowState, DccFlow, Dcc, ProtocolId::Dcc);
