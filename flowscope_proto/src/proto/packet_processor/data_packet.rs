use super::includes::*;

/// Catch-all for bytes no other dissector claimed
pub struct DataDissector;

impl Dissector for DataDissector {
    fn protocol(&self) -> ProtocolId {
        ProtocolId::Data
    }

    fn dissect(
        &self,
        _session: &mut AnalysisSession,
        _ctx: &PacketContext,
        data: &[u8],
        tree: &mut ProtoTree,
    ) -> Result<usize, DissectError> {
        render(tree, data);
        Ok(data.len())
    }
}

pub fn render(tree: &mut ProtoTree, data: &[u8]) {
    let len = data.len();
    tree.field("data.data", 0..len, data)
        .field("data.len", 0..len, len as u32)
        .info(format!("{len} bytes of data"));
}
