//! Distributed Checksum Clearinghouse. Every packet is `[header:24][body][signature:16]`; requests
//! and answers are paired through the host/pid/report numbers in the header, which a
//! retransmitted request repeats with a bumped retransmission counter.

use super::includes::*;
use crate::constants::{DCC_HEADER_LEN, DCC_MAX_PKT_LEN, DCC_SIGNATURE_LEN};
use crate::proto::state_subcontainers::dcc_state_container::{
    DccFlow, DccSnapshot, DccTransaction, TransactionId,
};
use packed_struct::derive::PrimitiveEnum_u8;
use packed_struct::PrimitiveEnum;
use zerocopy::byteorder::big_endian;
use zerocopy::{FromBytes, FromZeroes, Ref, Unaligned};

#[derive(Debug, FromZeroes, FromBytes, Unaligned)]
#[repr(C)]
pub struct DccHeader {
    pub len: big_endian::U16,
    pub version: u8,
    pub op: u8,
    pub sender: big_endian::U32,
    pub op_host: big_endian::U32,
    pub op_pid: big_endian::U32,
    pub op_report: big_endian::U32,
    pub op_retrans: big_endian::U32,
}

impl DccHeader {
    pub fn transaction(&self) -> TransactionId {
        TransactionId {
            host: self.op_host.get(),
            pid: self.op_pid.get(),
            report: self.op_report.get(),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, PrimitiveEnum_u8, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DccOp {
    Invalid = 0,
    Nop = 1,
    Report = 2,
    Query = 3,
    Answer = 4,
    Admn = 5,
    Ok = 6,
    Error = 7,
    Delete = 8,
    GreyReport = 9,
    GreyQuery = 10,
    GreySpam = 11,
    GreyWhite = 12,
}

impl DccOp {
    /// Sent by the server in reply to a request
    pub fn is_answer(&self) -> bool {
        matches!(self, DccOp::Answer | DccOp::Ok | DccOp::Error)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, PrimitiveEnum_u8, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DccChecksumType {
    Invalid = 0,
    Ip = 1,
    EnvFrom = 2,
    From = 3,
    Sub = 4,
    MessageId = 5,
    Received = 6,
    Body = 7,
    Fuz1 = 8,
    Fuz2 = 9,
    RepTotal = 10,
    RepBulk = 11,
    SrvrId = 12,
    EnvTo = 13,
}

/// `[type:1][len:1][sum:16]`
const DCC_CHECKSUM_LEN: usize = 18;
/// Target counts at or above this value mean "many"
const DCC_TGTS_TOO_MANY: u32 = 0x00FF_FFFF;

pub struct DccDissector;

impl Dissector for DccDissector {
    fn protocol(&self) -> ProtocolId {
        ProtocolId::Dcc
    }

    fn dissect(
        &self,
        session: &mut AnalysisSession,
        ctx: &PacketContext,
        data: &[u8],
        tree: &mut ProtoTree,
    ) -> Result<usize, DissectError> {
        let (header, _) = Ref::<_, DccHeader>::new_from_prefix(data).ok_or(
            DissectError::Truncated {
                offset: 0,
                needed: DCC_HEADER_LEN,
                available: data.len(),
            },
        )?;

        let key = SnapshotKey::new(ctx, ProtocolId::Dcc, 0);
        let snapshot = match ctx.pass {
            Pass::First => {
                let snapshot = advance(session, ctx, &header)?;
                session.snapshots_mut().record(key, snapshot.clone())?;
                snapshot
            }
            Pass::Replay => session.snapshots().replayed::<DccSnapshot>(&key)?,
        };

        render(ctx, &header, &snapshot, data, tree)
    }
}

fn advance(
    session: &mut AnalysisSession,
    ctx: &PacketContext,
    header: &DccHeader,
) -> Result<DccSnapshot, DissectError> {
    let server_port = ctx.server_port_guess();
    let flow = session
        .conversations_mut()
        .state_or_insert_with(ctx.conversation, || DccFlow::new(server_port))?;
    let direction = ctx.direction(flow.server_port);

    let mut snapshot = DccSnapshot {
        direction,
        request: None,
        retransmission_of: None,
    };

    let id = header.transaction();
    match (direction, DccOp::from_primitive(header.op)) {
        (Direction::ToServer, Some(op)) if !op.is_answer() => {
            let transaction = DccTransaction {
                op: header.op,
                request_frame: ctx.frame(),
                request_time_ns: ctx.info.timestamp_ns,
            };
            snapshot.retransmission_of = flow
                .record_request(id, transaction)
                .map(|original| original.request_frame)
                .filter(|frame| *frame != ctx.frame());
        }

        (Direction::ToClient, Some(op)) if op.is_answer() => {
            snapshot.request = flow.request_for(&id);
        }

        _ => {}
    }

    Ok(snapshot)
}

fn render(
    ctx: &PacketContext,
    header: &DccHeader,
    snapshot: &DccSnapshot,
    data: &[u8],
    tree: &mut ProtoTree,
) -> Result<usize, DissectError> {
    let declared = header.len.get() as usize;
    tree.field("dcc.len", 0..2, header.len.get())
        .field("dcc.version", 2..3, header.version)
        .field("dcc.op", 3..4, header.op)
        .field("dcc.client_id", 4..8, header.sender.get())
        .field("dcc.opnums.host", 8..12, header.op_host.get())
        .field("dcc.opnums.pid", 12..16, header.op_pid.get())
        .field("dcc.opnums.report", 16..20, header.op_report.get())
        .field("dcc.opnums.retrans", 20..24, header.op_retrans.get());

    if declared < DCC_HEADER_LEN + DCC_SIGNATURE_LEN || declared > DCC_MAX_PKT_LEN {
        return Err(DissectError::InvalidPacket(
            "DCC packet length is outside the protocol limits",
        ));
    }

    if declared != data.len() {
        tree.expert(
            Severity::Warn,
            ExpertGroup::Malformed,
            0..2,
            format!("Length field says {declared} bytes, {} were captured", data.len()),
        );
    }

    let end = declared.min(data.len());
    let signature_at = end.saturating_sub(DCC_SIGNATURE_LEN).max(DCC_HEADER_LEN);

    let Some(op) = DccOp::from_primitive(header.op) else {
        tree.info(format!("Unknown op {}", header.op))
            .expert(
                Severity::Note,
                ExpertGroup::Undecoded,
                3..4,
                format!("DCC op {} is not implemented", header.op),
            )
            .undecoded(data, DCC_HEADER_LEN, "dcc.data");
        return Ok(data.len());
    };

    tree.text(3..4, op.to_string()).info(op.to_string());

    let body = ByteView::new(&data[DCC_HEADER_LEN..signature_at]);
    match op {
        DccOp::Report | DccOp::Query | DccOp::GreyReport | DccOp::GreyQuery => {
            let targets = body.u32_be(0)?;
            tree.field("dcc.target", DCC_HEADER_LEN..DCC_HEADER_LEN + 4, targets);
            if targets >= DCC_TGTS_TOO_MANY {
                tree.text(DCC_HEADER_LEN..DCC_HEADER_LEN + 4, "Many targets");
            }
            render_checksums(&body, 4, tree)?;
        }

        DccOp::Delete => {
            tree.field("dcc.date", DCC_HEADER_LEN..DCC_HEADER_LEN + 4, body.u32_be(0)?);
            render_checksums(&body, 4, tree)?;
        }

        DccOp::Answer | DccOp::GreySpam | DccOp::GreyWhite => {
            for (index, chunk) in body.bytes().chunks_exact(4).enumerate() {
                let at = DCC_HEADER_LEN + index * 4;
                let count = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                tree.field("dcc.answer.target", at..at + 4, count);
            }
        }

        DccOp::Ok => {
            if let Ok(max_version) = body.u8(0) {
                tree.field("dcc.ok.max_version", DCC_HEADER_LEN..DCC_HEADER_LEN + 1, max_version);
            }
            if let Ok(delay) = body.u16_be(2) {
                tree.field("dcc.ok.qdelay_ms", DCC_HEADER_LEN + 2..DCC_HEADER_LEN + 4, delay);
            }
            if body.len() > 4 {
                let brand = String::from_utf8_lossy(body.rest(4))
                    .trim_end_matches('\0')
                    .to_string();
                tree.field("dcc.ok.brand", DCC_HEADER_LEN + 4..signature_at, brand);
            }
        }

        DccOp::Error => {
            let text = String::from_utf8_lossy(body.bytes())
                .trim_end_matches('\0')
                .to_string();
            tree.field("dcc.error", DCC_HEADER_LEN..signature_at, text.clone())
                .info(format!("ERROR: {text}"));
        }

        DccOp::Admn => {
            tree.field("dcc.date", DCC_HEADER_LEN..DCC_HEADER_LEN + 4, body.u32_be(0)?);
            if let Ok(aop) = body.u8(8) {
                tree.field("dcc.admn.op", DCC_HEADER_LEN + 8..DCC_HEADER_LEN + 9, aop);
            }
        }

        DccOp::Nop | DccOp::Invalid => {}
    }

    if let Some(request) = &snapshot.request {
        let delta_ns = ctx.info.timestamp_ns.saturating_sub(request.request_time_ns);
        tree.field("dcc.request_frame", 8..20, request.request_frame)
            .field("dcc.response_time_ns", 8..20, delta_ns)
            .text(
                8..20,
                format!(
                    "Answers the {} in frame {} after {:.3} ms",
                    DccOp::from_primitive(request.op)
                        .map(|op| op.to_string())
                        .unwrap_or_default(),
                    request.request_frame,
                    delta_ns as f64 / 1_000_000.0
                ),
            );
    } else if op.is_answer() && snapshot.direction == Direction::ToClient {
        tree.expert(
            Severity::Note,
            ExpertGroup::Sequence,
            8..20,
            "No request seen for this answer",
        );
    }

    if let Some(original) = snapshot.retransmission_of {
        tree.field("dcc.retransmission_of", 20..24, original).expert(
            Severity::Note,
            ExpertGroup::Sequence,
            20..24,
            format!("Retransmission of frame {original}"),
        );
    }

    if end >= DCC_HEADER_LEN + DCC_SIGNATURE_LEN {
        tree.field("dcc.signature", signature_at..end, &data[signature_at..end]);
    }

    Ok(data.len())
}

fn render_checksums(
    body: &ByteView<'_>,
    mut offset: usize,
    tree: &mut ProtoTree,
) -> Result<(), DissectError> {
    while offset + 2 <= body.len() {
        let kind = body.u8(offset)?;
        let len = body.u8(offset + 1)? as usize;
        let at = DCC_HEADER_LEN + offset;
        let name = DccChecksumType::from_primitive(kind)
            .map(|kind| kind.to_string())
            .unwrap_or_else(|| format!("Unknown ({kind})"));

        if len < 2 {
            return Err(DissectError::InvalidPacket("DCC checksum shorter than its header"));
        }

        let sum = body.slice(offset + 2, len.min(DCC_CHECKSUM_LEN) - 2)?;
        tree.field("dcc.checksum.type", at..at + 1, kind)
            .text(at..at + 1, name)
            .field("dcc.checksum.len", at + 1..at + 2, len as u8)
            .field("dcc.checksum.sum", at + 2..at + 2 + sum.len(), sum);
        offset += len;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn header_layout() {
        assert_eq!(std::mem::size_of::<DccHeader>(), DCC_HEADER_LEN);
    }

    #[rstest]
    #[case(DccOp::Answer, true)]
    #[case(DccOp::Ok, true)]
    #[case(DccOp::Error, true)]
    #[case(DccOp::Query, false)]
    #[case(DccOp::Report, false)]
    fn answers(#[case] op: DccOp, #[case] expected: bool) {
        assert_eq!(op.is_answer(), expected);
    }

    #[test]
    fn checksum_records() {
        let mut body = vec![0, 0, 0, 1];
        body.push(DccChecksumType::Body.to_primitive());
        body.push(DCC_CHECKSUM_LEN as u8);
        body.extend_from_slice(&[0xAB; 16]);
        let mut tree = ProtoTree::new(ProtocolId::Dcc);
        render_checksums(&ByteView::new(&body), 4, &mut tree).unwrap();
        let dissection = tree.finish();
        assert_eq!(dissection.field("dcc.checksum.type"), Some(&FieldValue::U8(7)));
        assert_eq!(
            dissection.field("dcc.checksum.sum"),
            Some(&FieldValue::Bytes(vec![0xAB; 16]))
        );
    }
}
