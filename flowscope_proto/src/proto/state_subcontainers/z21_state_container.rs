use flowscope_types::prelude::{Direction, FrameId};
use std::collections::HashMap;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BroadcastSubscription {
    pub flags: u32,
    pub set_in: FrameId,
}

pub struct Z21Flow {
    pub server_port: u16,
    /// Set by the client with LAN_SET_BROADCASTFLAGS or learned from a LAN_GET_BROADCASTFLAGS reply
    pub broadcast: Option<BroadcastSubscription>,
    /// Loco address → output format (0 = DCC, 1 = MM)
    pub loco_modes: HashMap<u16, u8>,
}

impl Z21Flow {
    pub fn new(server_port: u16) -> Self {
        Self {
            server_port,
            broadcast: None,
            loco_modes: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Z21Snapshot {
    pub direction: Direction,
    pub broadcast: Option<BroadcastSubscription>,
    /// Known output format of the loco this PDU addresses
    pub loco_mode: Option<u8>,
}
