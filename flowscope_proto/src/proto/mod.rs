pub mod conversation;
pub mod dispatch;
pub mod packet;
pub mod packet_processor;
pub mod replay;
pub mod rewiring;
pub mod session;
pub mod state_subcontainers;
pub mod tree;
