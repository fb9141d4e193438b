use flowscope_types::prelude::{Direction, FrameId};
use std::collections::HashMap;

/// `op_nums` minus the retransmission counter: a retransmitted request keeps its identity
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct TransactionId {
    pub host: u32,
    pub pid: u32,
    pub report: u32,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DccTransaction {
    pub op: u8,
    pub request_frame: FrameId,
    pub request_time_ns: i64,
}

pub struct DccFlow {
    pub server_port: u16,
    transactions: HashMap<TransactionId, DccTransaction>,
}

impl DccFlow {
    pub fn new(server_port: u16) -> Self {
        Self {
            server_port,
            transactions: HashMap::new(),
        }
    }

    /// Records a request. Returns the original when this is a retransmission
    pub fn record_request(
        &mut self,
        id: TransactionId,
        transaction: DccTransaction,
    ) -> Option<DccTransaction> {
        match self.transactions.get(&id) {
            Some(original) => Some(*original),
            None => {
                let _ = self.transactions.insert(id, transaction);
                None
            }
        }
    }

    pub fn request_for(&self, id: &TransactionId) -> Option<DccTransaction> {
        self.transactions.get(id).copied()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DccSnapshot {
    pub direction: Direction,
    /// For answers: the request they match
    pub request: Option<DccTransaction>,
    /// For requests: the frame this one repeats
    pub retransmission_of: Option<FrameId>,
}
