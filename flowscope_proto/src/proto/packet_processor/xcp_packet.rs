//! XCP on Ethernet. Every XCP packet is prefixed by `[len:2 LE][ctr:2 LE]`; UDP datagrams may
//! carry several of them and TCP carries them as a byte stream.
//!
//! Commands travel master → slave and are remembered on the flow. The next RES or ERR from the
//! slave answers that command; only a RES applies it to the flow's settings and DAQ model. DAQ
//! packets (slave → master) and STIM packets (master → slave) carry nothing but an ODT
//! identification and raw bytes, and are laid out from the model as it stood when they arrived.

use super::includes::*;
use crate::constants::XCP_ETH_HEADER_LEN;
use crate::proto::replay::StreamSegment;
use crate::proto::state_subcontainers::xcp_state_container::{
    DaqListMode, DaqPtr, DtoId, IdFieldType, OdtEntry, OdtRef, PendingCommand, ResolvedOdt,
    XcpFlow, XcpSettings, MAX_DAQ_PID,
};
use byteorder::{ByteOrder, LittleEndian};
use flowscope_types::prelude::{AddressGranularity, XcpByteOrder};
use flowscope_wire::{frame_datagram, PduFormat};
use packed_struct::derive::PrimitiveEnum_u8;
use packed_struct::PrimitiveEnum;
use std::ops::Range;

/// The snapshot slot holding what the stream framer produced for a frame
const STREAM_SEGMENT_INDEX: usize = u32::MAX as usize;

const PID_RES: u8 = 0xFF;
const PID_ERR: u8 = 0xFE;
const PID_EV: u8 = 0xFD;
const PID_SERV: u8 = 0xFC;
/// Master → slave packets at or above this PID are commands
const PID_CMD_MIN: u8 = 0xC0;

/// `[len:2 LE][ctr:2 LE]` where `len` counts the XCP packet only
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct XcpFraming {
    max_packet_len: usize,
}

impl XcpFraming {
    pub fn new(max_packet_len: usize) -> Self {
        Self { max_packet_len }
    }
}

impl PduFormat for XcpFraming {
    fn fixed_header_len(&self) -> usize {
        XCP_ETH_HEADER_LEN
    }

    fn pdu_len(&self, header: &[u8]) -> usize {
        LittleEndian::read_u16(header) as usize + XCP_ETH_HEADER_LEN
    }

    fn max_pdu_len(&self) -> usize {
        self.max_packet_len.saturating_add(XCP_ETH_HEADER_LEN)
    }

    fn multiple_per_datagram(&self) -> bool {
        true
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, PrimitiveEnum_u8, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum XcpCommandCode {
    Connect = 0xFF,
    Disconnect = 0xFE,
    GetStatus = 0xFD,
    Synch = 0xFC,
    GetCommModeInfo = 0xFB,
    GetId = 0xFA,
    SetRequest = 0xF9,
    GetSeed = 0xF8,
    Unlock = 0xF7,
    SetMta = 0xF6,
    Upload = 0xF5,
    ShortUpload = 0xF4,
    BuildChecksum = 0xF3,
    TransportLayerCmd = 0xF2,
    UserCmd = 0xF1,
    Download = 0xF0,
    DownloadNext = 0xEF,
    DownloadMax = 0xEE,
    ShortDownload = 0xED,
    ModifyBits = 0xEC,
    SetCalPage = 0xEB,
    GetCalPage = 0xEA,
    GetPagProcessorInfo = 0xE9,
    GetSegmentInfo = 0xE8,
    GetPageInfo = 0xE7,
    SetSegmentMode = 0xE6,
    GetSegmentMode = 0xE5,
    CopyCalPage = 0xE4,
    ClearDaqList = 0xE3,
    SetDaqPtr = 0xE2,
    WriteDaq = 0xE1,
    SetDaqListMode = 0xE0,
    GetDaqListMode = 0xDF,
    StartStopDaqList = 0xDE,
    StartStopSynch = 0xDD,
    GetDaqClock = 0xDC,
    ReadDaq = 0xDB,
    GetDaqProcessorInfo = 0xDA,
    GetDaqResolutionInfo = 0xD9,
    GetDaqListInfo = 0xD8,
    GetDaqEventInfo = 0xD7,
    FreeDaq = 0xD6,
    AllocDaq = 0xD5,
    AllocOdt = 0xD4,
    AllocOdtEntry = 0xD3,
    ProgramStart = 0xD2,
    ProgramClear = 0xD1,
    Program = 0xD0,
    ProgramReset = 0xCF,
    GetPgmProcessorInfo = 0xCE,
    GetSectorInfo = 0xCD,
    ProgramPrepare = 0xCC,
    ProgramFormat = 0xCB,
    ProgramNext = 0xCA,
    ProgramMax = 0xC9,
    ProgramVerify = 0xC8,
    WriteDaqMultiple = 0xC7,
    TimeCorrelationProperties = 0xC6,
    DtoCtrProperties = 0xC5,
    Level1 = 0xC0,
}

/// Second-level commands behind the `0xC0` prefix
#[derive(Debug, Copy, Clone, Eq, PartialEq, PrimitiveEnum_u8, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum XcpLevel1Code {
    GetVersion = 0x00,
    SetDaqPackedMode = 0x01,
    GetDaqPackedMode = 0x02,
    SwDbgOverXcp = 0xFC,
    PodCommands = 0xFD,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, PrimitiveEnum_u8, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum XcpErrorCode {
    ErrCmdSynch = 0x00,
    ErrCmdBusy = 0x10,
    ErrDaqActive = 0x11,
    ErrPgmActive = 0x12,
    ErrCmdUnknown = 0x20,
    ErrCmdSyntax = 0x21,
    ErrOutOfRange = 0x22,
    ErrWriteProtected = 0x23,
    ErrAccessDenied = 0x24,
    ErrAccessLocked = 0x25,
    ErrPageNotValid = 0x26,
    ErrModeNotValid = 0x27,
    ErrSegmentNotValid = 0x28,
    ErrSequence = 0x29,
    ErrDaqConfig = 0x2A,
    ErrMemoryOverflow = 0x30,
    ErrGeneric = 0x31,
    ErrVerify = 0x32,
    ErrResourceTemporaryNotAccessible = 0x33,
    ErrSubcmdUnknown = 0x34,
    ErrTimecorrStateChange = 0x35,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, PrimitiveEnum_u8, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum XcpEventCode {
    EvResumeMode = 0x00,
    EvClearDaq = 0x01,
    EvStoreDaq = 0x02,
    EvStoreCal = 0x03,
    EvCmdPending = 0x05,
    EvDaqOverload = 0x06,
    EvSessionTerminated = 0x07,
    EvTimeSync = 0x08,
    EvStimTimeout = 0x09,
    EvSleep = 0x0A,
    EvWakeUp = 0x0B,
    EvEcuStateChange = 0x0C,
    EvUser = 0xFE,
    EvTransport = 0xFF,
}

fn code_name<T: PrimitiveEnum<Primitive = u8> + std::fmt::Display>(code: u8) -> String {
    T::from_primitive(code)
        .map(|code| code.to_string())
        .unwrap_or_else(|| format!("Unknown (0x{code:02X})"))
}

/// One element of WRITE_DAQ_MULTIPLE
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DaqElement {
    pub bit_offset: u8,
    pub size: u8,
    pub address_extension: u8,
    pub address: u32,
}

/// A decoded master → slave command, keeping the parameters a reply may need
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum XcpCommand {
    Connect { mode: u8 },
    Disconnect,
    GetStatus,
    Synch,
    GetCommModeInfo,
    GetId { request_type: u8 },
    SetMta { address_extension: u8, address: u32 },
    Upload { count: u8 },
    ShortUpload { count: u8, address_extension: u8, address: u32 },
    Download { count: u8 },
    ClearDaqList { daq: u16 },
    SetDaqPtr { daq: u16, odt: u8, entry: u8 },
    WriteDaq(DaqElement),
    WriteDaqMultiple(Vec<DaqElement>),
    SetDaqListMode { daq: u16, mode: DaqListMode },
    StartStopDaqList { mode: u8, daq: u16 },
    StartStopSynch { mode: u8 },
    GetDaqProcessorInfo,
    GetDaqResolutionInfo,
    FreeDaq,
    AllocDaq { count: u16 },
    AllocOdt { daq: u16, count: u8 },
    AllocOdtEntry { daq: u16, odt: u8, count: u8 },
    Level1 { sub_command: u8 },
    /// A command whose parameters are not decoded
    Other { code: u8 },
}

impl XcpCommand {
    pub fn parse(bytes: &[u8], order: XcpByteOrder) -> Result<Self, DissectError> {
        let view = ByteView::new(bytes);
        let code = view.u8(0)?;
        let Some(known) = XcpCommandCode::from_primitive(code) else {
            return Ok(XcpCommand::Other { code });
        };

        let command = match known {
            XcpCommandCode::Connect => XcpCommand::Connect { mode: view.u8(1)? },
            XcpCommandCode::Disconnect => XcpCommand::Disconnect,
            XcpCommandCode::GetStatus => XcpCommand::GetStatus,
            XcpCommandCode::Synch => XcpCommand::Synch,
            XcpCommandCode::GetCommModeInfo => XcpCommand::GetCommModeInfo,
            XcpCommandCode::GetId => XcpCommand::GetId {
                request_type: view.u8(1)?,
            },
            XcpCommandCode::SetMta => XcpCommand::SetMta {
                address_extension: view.u8(3)?,
                address: view.u32_xcp(4, order)?,
            },
            XcpCommandCode::Upload => XcpCommand::Upload { count: view.u8(1)? },
            XcpCommandCode::ShortUpload => XcpCommand::ShortUpload {
                count: view.u8(1)?,
                address_extension: view.u8(3)?,
                address: view.u32_xcp(4, order)?,
            },
            XcpCommandCode::Download => XcpCommand::Download { count: view.u8(1)? },
            XcpCommandCode::ClearDaqList => XcpCommand::ClearDaqList {
                daq: view.u16_xcp(2, order)?,
            },
            XcpCommandCode::SetDaqPtr => XcpCommand::SetDaqPtr {
                daq: view.u16_xcp(2, order)?,
                odt: view.u8(4)?,
                entry: view.u8(5)?,
            },
            XcpCommandCode::WriteDaq => XcpCommand::WriteDaq(DaqElement {
                bit_offset: view.u8(1)?,
                size: view.u8(2)?,
                address_extension: view.u8(3)?,
                address: view.u32_xcp(4, order)?,
            }),
            XcpCommandCode::WriteDaqMultiple => {
                let count = view.u8(1)? as usize;
                let elements = (0..count)
                    .map(|idx| {
                        let at = 2 + idx * 8;
                        Ok(DaqElement {
                            bit_offset: view.u8(at)?,
                            size: view.u8(at + 1)?,
                            address: view.u32_xcp(at + 2, order)?,
                            address_extension: view.u8(at + 6)?,
                        })
                    })
                    .collect::<Result<Vec<_>, DissectError>>()?;
                XcpCommand::WriteDaqMultiple(elements)
            }
            XcpCommandCode::SetDaqListMode => XcpCommand::SetDaqListMode {
                daq: view.u16_xcp(2, order)?,
                mode: DaqListMode {
                    mode: view.u8(1)?,
                    event_channel: view.u16_xcp(4, order)?,
                    prescaler: view.u8(6)?,
                    priority: view.u8(7)?,
                },
            },
            XcpCommandCode::StartStopDaqList => XcpCommand::StartStopDaqList {
                mode: view.u8(1)?,
                daq: view.u16_xcp(2, order)?,
            },
            XcpCommandCode::StartStopSynch => XcpCommand::StartStopSynch { mode: view.u8(1)? },
            XcpCommandCode::GetDaqProcessorInfo => XcpCommand::GetDaqProcessorInfo,
            XcpCommandCode::GetDaqResolutionInfo => XcpCommand::GetDaqResolutionInfo,
            XcpCommandCode::FreeDaq => XcpCommand::FreeDaq,
            XcpCommandCode::AllocDaq => XcpCommand::AllocDaq {
                count: view.u16_xcp(2, order)?,
            },
            XcpCommandCode::AllocOdt => XcpCommand::AllocOdt {
                daq: view.u16_xcp(2, order)?,
                count: view.u8(4)?,
            },
            XcpCommandCode::AllocOdtEntry => XcpCommand::AllocOdtEntry {
                daq: view.u16_xcp(2, order)?,
                odt: view.u8(4)?,
                count: view.u8(5)?,
            },
            XcpCommandCode::Level1 => XcpCommand::Level1 {
                sub_command: view.u8(1)?,
            },
            _ => XcpCommand::Other { code },
        };

        Ok(command)
    }

    pub fn code(&self) -> u8 {
        let known = match self {
            XcpCommand::Connect { .. } => XcpCommandCode::Connect,
            XcpCommand::Disconnect => XcpCommandCode::Disconnect,
            XcpCommand::GetStatus => XcpCommandCode::GetStatus,
            XcpCommand::Synch => XcpCommandCode::Synch,
            XcpCommand::GetCommModeInfo => XcpCommandCode::GetCommModeInfo,
            XcpCommand::GetId { .. } => XcpCommandCode::GetId,
            XcpCommand::SetMta { .. } => XcpCommandCode::SetMta,
            XcpCommand::Upload { .. } => XcpCommandCode::Upload,
            XcpCommand::ShortUpload { .. } => XcpCommandCode::ShortUpload,
            XcpCommand::Download { .. } => XcpCommandCode::Download,
            XcpCommand::ClearDaqList { .. } => XcpCommandCode::ClearDaqList,
            XcpCommand::SetDaqPtr { .. } => XcpCommandCode::SetDaqPtr,
            XcpCommand::WriteDaq(_) => XcpCommandCode::WriteDaq,
            XcpCommand::WriteDaqMultiple(_) => XcpCommandCode::WriteDaqMultiple,
            XcpCommand::SetDaqListMode { .. } => XcpCommandCode::SetDaqListMode,
            XcpCommand::StartStopDaqList { .. } => XcpCommandCode::StartStopDaqList,
            XcpCommand::StartStopSynch { .. } => XcpCommandCode::StartStopSynch,
            XcpCommand::GetDaqProcessorInfo => XcpCommandCode::GetDaqProcessorInfo,
            XcpCommand::GetDaqResolutionInfo => XcpCommandCode::GetDaqResolutionInfo,
            XcpCommand::FreeDaq => XcpCommandCode::FreeDaq,
            XcpCommand::AllocDaq { .. } => XcpCommandCode::AllocDaq,
            XcpCommand::AllocOdt { .. } => XcpCommandCode::AllocOdt,
            XcpCommand::AllocOdtEntry { .. } => XcpCommandCode::AllocOdtEntry,
            XcpCommand::Level1 { .. } => XcpCommandCode::Level1,
            XcpCommand::Other { code } => return *code,
        };
        known.to_primitive()
    }

    pub fn name(&self) -> String {
        match self {
            XcpCommand::Level1 { sub_command } => {
                format!("LEVEL_1_COMMAND {}", code_name::<XcpLevel1Code>(*sub_command))
            }
            _ => code_name::<XcpCommandCode>(self.code()),
        }
    }
}

/// How one XCP packet was understood the first time it was seen
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct XcpSnapshot {
    pub direction: Direction,
    /// The flow settings in force when the packet arrived
    pub settings: XcpSettings,
    /// For RES and ERR: the command this reply answers
    pub answered: Option<PendingCommand>,
    /// For DAQ and STIM packets
    pub dto: Option<DtoId>,
    pub layout: Option<ResolvedOdt>,
    /// Set when a RES could not be applied to the DAQ model
    pub outcome: Option<String>,
}

pub struct XcpDissector;

impl Dissector for XcpDissector {
    fn protocol(&self) -> ProtocolId {
        ProtocolId::Xcp
    }

    #[cfg_attr(feature = "verbose-tracing", tracing::instrument(level = "trace", target = "flowscope", skip_all, fields(frame = %ctx.frame())))]
    fn dissect(
        &self,
        session: &mut AnalysisSession,
        ctx: &PacketContext,
        data: &[u8],
        tree: &mut ProtoTree,
    ) -> Result<usize, DissectError> {
        let server_port = ctx.server_port_guess();
        if session
            .conversations()
            .state::<XcpFlow>(ctx.conversation)
            .is_none()
        {
            let flow = XcpFlow::new(server_port, &session.config().xcp);
            session.conversations_mut().set_state(ctx.conversation, flow)?;
        }

        let direction = session
            .conversations()
            .state::<XcpFlow>(ctx.conversation)
            .map(|flow| ctx.direction(flow.server_port))
            .ok_or(DissectError::NotAllocated("XCP flow state"))?;

        tree.info(format!("XCP {direction}"));
        if ctx.info.transport.is_stream() {
            dissect_stream(session, ctx, direction, data, tree)?;
        } else {
            dissect_datagram(session, ctx, direction, data, tree);
        }

        Ok(data.len())
    }
}

fn dissect_datagram(
    session: &mut AnalysisSession,
    ctx: &PacketContext,
    direction: Direction,
    data: &[u8],
    tree: &mut ProtoTree,
) {
    let framing = XcpFraming::new(session.config().xcp.max_packet_len);
    let mut pdus: Vec<Range<usize>> = Vec::new();
    let report = frame_datagram(data, &framing, |pdu| {
        pdus.push(pdu.offset..pdu.offset + pdu.bytes.len())
    });

    for (index, range) in pdus.into_iter().enumerate() {
        let child = dissect_pdu(session, ctx, direction, index, &data[range]);
        tree.child(child);
    }

    if let Some(err) = report.error {
        tree.expert(
            Severity::Error,
            ExpertGroup::Malformed,
            report.consumed..data.len(),
            err.to_string(),
        );
        tree.undecoded(data, report.consumed, "xcp.malformed");
    } else if let Some(trailing) = report.trailing {
        tree.expert(
            Severity::Note,
            ExpertGroup::Malformed,
            trailing.clone(),
            format!("{} trailing bytes do not form an XCP packet", trailing.len()),
        );
        tree.undecoded(data, trailing.start, "xcp.trailing");
    }
}

fn dissect_stream(
    session: &mut AnalysisSession,
    ctx: &PacketContext,
    direction: Direction,
    data: &[u8],
    tree: &mut ProtoTree,
) -> Result<(), DissectError> {
    let key = SnapshotKey::new(ctx, ProtocolId::Xcp, STREAM_SEGMENT_INDEX);
    let segment = match ctx.pass {
        Pass::First => {
            let max_packet_len = session.config().xcp.max_packet_len;
            let flow = session
                .conversations_mut()
                .state_mut::<XcpFlow>(ctx.conversation)
                .ok_or(DissectError::NotAllocated("XCP flow state"))?;

            let mut pdus = Vec::new();
            let report = flow
                .stream(direction, max_packet_len)
                .push(data, |pdu| pdus.push(pdu));
            let segment = StreamSegment {
                pdus,
                buffered: report.buffered,
                discarded: report.discarded,
                error: report.error,
            };
            session.snapshots_mut().record(key, segment.clone())?;
            segment
        }

        Pass::Replay => session.snapshots().replayed::<StreamSegment>(&key)?,
    };

    for (index, pdu) in segment.pdus.iter().enumerate() {
        let child = dissect_pdu(session, ctx, direction, index, pdu);
        tree.child(child);
    }

    if let Some(err) = &segment.error {
        tree.expert(
            Severity::Error,
            ExpertGroup::Malformed,
            0..data.len(),
            format!("{err}; {} buffered bytes discarded", segment.discarded),
        );
    }

    if segment.buffered > 0 {
        tree.text(
            0..data.len(),
            format!("{} bytes held for the next segment", segment.buffered),
        );
    }

    Ok(())
}

/// One `[len][ctr][packet]` unit, rendered as its own dissection
fn dissect_pdu(
    session: &mut AnalysisSession,
    ctx: &PacketContext,
    direction: Direction,
    index: usize,
    pdu: &[u8],
) -> Dissection {
    let mut tree = ProtoTree::new(ProtocolId::Xcp);
    let view = ByteView::new(pdu);
    if let (Ok(len), Ok(ctr)) = (view.u16_le(0), view.u16_le(2)) {
        tree.field("xcp.len", 0..2, len).field("xcp.ctr", 2..4, ctr);
    }

    let packet = view.rest(XCP_ETH_HEADER_LEN);
    let key = SnapshotKey::new(ctx, ProtocolId::Xcp, index);
    let snapshot = match ctx.pass {
        Pass::First => {
            let snapshot = analyse(session, ctx, direction, packet);
            session
                .snapshots_mut()
                .record(key, snapshot.clone())
                .map(|_| snapshot)
        }
        Pass::Replay => session.snapshots().replayed::<XcpSnapshot>(&key),
    };

    let rendered = snapshot.and_then(|snapshot| {
        render_packet(&snapshot, packet, XCP_ETH_HEADER_LEN, &mut tree)
    });

    if let Err(err) = rendered {
        tree.expert(
            Severity::Error,
            err.expert_group(),
            XCP_ETH_HEADER_LEN..pdu.len(),
            err.into_string(),
        );
    }

    tree.set_consumed(pdu.len());
    tree.finish()
}

/// The forward pass over one XCP packet: remembers commands, applies positive responses and
/// freezes the layout of data packets
fn analyse(
    session: &mut AnalysisSession,
    ctx: &PacketContext,
    direction: Direction,
    packet: &[u8],
) -> XcpSnapshot {
    let Some(flow) = session
        .conversations_mut()
        .state_mut::<XcpFlow>(ctx.conversation)
    else {
        return XcpSnapshot {
            direction,
            settings: XcpSettings::from_preferences(&session.config().xcp),
            answered: None,
            dto: None,
            layout: None,
            outcome: Some("XCP flow state is missing".to_string()),
        };
    };

    let mut snapshot = XcpSnapshot {
        direction,
        settings: flow.settings,
        answered: None,
        dto: None,
        layout: None,
        outcome: None,
    };

    let Some(&pid) = packet.first() else {
        return snapshot;
    };

    let is_dto = match (direction, pid) {
        (Direction::ToServer, pid) if pid >= PID_CMD_MIN => {
            flow.pending = match XcpCommand::parse(packet, flow.settings.byte_order) {
                Ok(command) => {
                    log::trace!(target: "flowscope", "Frame {}: XCP command {}", ctx.frame(), command.name());
                    Some(PendingCommand {
                        frame: ctx.frame(),
                        command,
                    })
                }
                Err(err) => {
                    log::warn!(target: "flowscope", "Frame {}: unreadable XCP command: {err}", ctx.frame());
                    None
                }
            };
            false
        }

        (Direction::ToClient, PID_RES) => {
            snapshot.answered = flow.pending.take();
            if let Some(pending) = &snapshot.answered {
                if let Err(err) = apply_response(flow, &pending.command, packet) {
                    log::warn!(target: "flowscope", "Frame {}: {} response not applied: {err}", ctx.frame(), pending.command.name());
                    snapshot.outcome = Some(err.into_string());
                }
            }
            false
        }

        (Direction::ToClient, PID_ERR) => {
            snapshot.answered = flow.pending.take();
            false
        }

        (Direction::ToClient, PID_EV | PID_SERV) => false,

        _ => true,
    };

    if is_dto {
        match dto_id(&ByteView::new(packet), &flow.settings) {
            Ok(id) => {
                snapshot.dto = Some(id);
                snapshot.layout = flow.resolve_dto(id);
                if snapshot.layout.is_none() {
                    log::warn!(target: "flowscope", "Frame {}: {id:?} does not resolve to a configured ODT", ctx.frame());
                }
            }
            Err(err) => snapshot.outcome = Some(err.into_string()),
        }
    }

    if let Some(layout) = snapshot.layout.as_mut() {
        let names = &session.config().xcp;
        for entry in layout.entries.iter_mut().filter(|entry| entry.name.is_none()) {
            entry.name = names
                .name_for(entry.address_extension, entry.address)
                .map(str::to_string);
        }
    }

    snapshot
}

fn apply_response(
    flow: &mut XcpFlow,
    command: &XcpCommand,
    response: &[u8],
) -> Result<(), DissectError> {
    let view = ByteView::new(response);
    match command {
        XcpCommand::Connect { .. } => {
            let comm_mode = view.u8(2)?;
            let byte_order = connect_byte_order(comm_mode);
            let granularity = AddressGranularity::from_wire_bits(comm_mode >> 1)
                .ok_or(DissectError::InvalidPacket("Reserved address granularity"))?;
            flow.settings.byte_order = byte_order;
            flow.settings.granularity = granularity;
            flow.settings.max_cto = Some(view.u8(3)?);
            flow.settings.max_dto = Some(view.u16_xcp(4, byte_order)?);
            log::trace!(target: "flowscope", "XCP connected: {byte_order} byte order, {granularity} granularity");
        }

        XcpCommand::FreeDaq => {
            flow.model.free_daq();
            flow.daq_ptr = None;
        }

        XcpCommand::AllocDaq { count } => {
            flow.model.alloc_daq(*count);
            flow.daq_ptr = None;
        }

        XcpCommand::AllocOdt { daq, count } => flow.model.alloc_odt(*daq, *count)?,

        XcpCommand::AllocOdtEntry { daq, odt, count } => {
            flow.model.alloc_odt_entry(*daq, *odt, *count)?
        }

        XcpCommand::SetDaqPtr { daq, odt, entry } => {
            flow.daq_ptr = Some(DaqPtr {
                daq: *daq,
                odt: *odt,
                entry: *entry,
            })
        }

        XcpCommand::WriteDaq(element) => write_element(flow, element)?,

        XcpCommand::WriteDaqMultiple(elements) => {
            // all elements land or none do
            let (model, daq_ptr) = (flow.model.clone(), flow.daq_ptr);
            for element in elements {
                if let Err(err) = write_element(flow, element) {
                    flow.model = model;
                    flow.daq_ptr = daq_ptr;
                    return Err(err);
                }
            }
        }

        XcpCommand::SetDaqListMode { daq, mode } => flow.model.set_mode(*daq, *mode)?,

        XcpCommand::StartStopDaqList { mode, daq } if *mode == 1 || *mode == 2 => {
            let first_pid = view.u8(1)?;
            flow.pids.bind(&flow.model, *daq, first_pid)?;
        }

        XcpCommand::GetDaqProcessorInfo => {
            let key = view.u8(7)?;
            flow.settings.id_field = IdFieldType::from_primitive((key >> 6) & 0x03)
                .unwrap_or_default();
        }

        XcpCommand::GetDaqResolutionInfo => {
            flow.settings.timestamp_len = timestamp_size(view.u8(5)?);
        }

        XcpCommand::ClearDaqList { daq } => flow.model.clear_daq_list(*daq)?,

        _ => {}
    }

    Ok(())
}

fn write_element(flow: &mut XcpFlow, element: &DaqElement) -> Result<(), DissectError> {
    let at = flow
        .daq_ptr
        .ok_or(DissectError::NotAllocated("DAQ pointer"))?;
    flow.model.write_daq(
        at,
        OdtEntry {
            address_extension: element.address_extension,
            address: element.address,
            size: element.size,
            bit_offset: element.bit_offset,
            name: None,
        },
    )?;
    flow.daq_ptr = Some(DaqPtr {
        entry: at.entry.wrapping_add(1),
        ..at
    });
    Ok(())
}

fn connect_byte_order(comm_mode: u8) -> XcpByteOrder {
    if comm_mode & 0x01 == 0 {
        XcpByteOrder::Intel
    } else {
        XcpByteOrder::Motorola
    }
}

/// TIMESTAMP_MODE bits 0..2
fn timestamp_size(mode: u8) -> usize {
    match mode & 0x07 {
        1 => 1,
        2 => 2,
        4 => 4,
        _ => 0,
    }
}

fn dto_id(view: &ByteView<'_>, settings: &XcpSettings) -> Result<DtoId, DissectError> {
    let order = settings.byte_order;
    let id = match settings.id_field {
        IdFieldType::AbsoluteOdt => DtoId::Pid(view.u8(0)?),
        IdFieldType::RelativeOdtDaqByte => DtoId::Relative(OdtRef {
            odt: view.u8(0)?,
            daq: view.u8(1)? as u16,
        }),
        IdFieldType::RelativeOdtDaqWord => DtoId::Relative(OdtRef {
            odt: view.u8(0)?,
            daq: view.u16_xcp(1, order)?,
        }),
        IdFieldType::RelativeOdtDaqWordAligned => DtoId::Relative(OdtRef {
            odt: view.u8(0)?,
            daq: view.u16_xcp(settings.id_field.daq_offset().unwrap_or(2), order)?,
        }),
    };
    Ok(id)
}

fn render_packet(
    snapshot: &XcpSnapshot,
    packet: &[u8],
    base: usize,
    tree: &mut ProtoTree,
) -> Result<(), DissectError> {
    let view = ByteView::new(packet);
    let Ok(pid) = view.u8(0) else {
        tree.expert(
            Severity::Warn,
            ExpertGroup::Malformed,
            base..base,
            "Empty XCP packet",
        );
        return Ok(());
    };

    match (snapshot.direction, pid) {
        (Direction::ToServer, pid) if pid >= PID_CMD_MIN => {
            render_command(snapshot, &view, base, tree)?
        }
        (Direction::ToClient, PID_RES) => render_res(snapshot, &view, base, tree)?,
        (Direction::ToClient, PID_ERR) => {
            let code = view.u8(1)?;
            tree.field("xcp.pid", base..base + 1, pid)
                .field("xcp.error", base + 1..base + 2, code)
                .text(base + 1..base + 2, code_name::<XcpErrorCode>(code))
                .info(format!("ERR {}", code_name::<XcpErrorCode>(code)));
            render_answered(snapshot, base, tree);
            tree.expert(
                Severity::Note,
                ExpertGroup::Protocol,
                base..base + 2,
                format!("Slave refused the command: {}", code_name::<XcpErrorCode>(code)),
            );
            tree.undecoded(packet, 2, "xcp.parameters");
        }
        (Direction::ToClient, PID_EV) => {
            let code = view.u8(1)?;
            tree.field("xcp.pid", base..base + 1, pid)
                .field("xcp.event", base + 1..base + 2, code)
                .text(base + 1..base + 2, code_name::<XcpEventCode>(code))
                .info(format!("EV {}", code_name::<XcpEventCode>(code)));
            tree.undecoded(packet, 2, "xcp.parameters");
        }
        (Direction::ToClient, PID_SERV) => {
            let code = view.u8(1)?;
            tree.field("xcp.pid", base..base + 1, pid)
                .field("xcp.service", base + 1..base + 2, code);
            if code == 0x01 {
                let text = String::from_utf8_lossy(view.rest(2)).into_owned();
                tree.field("xcp.service_text", base + 2..base + packet.len(), text)
                    .info("SERV SERV_TEXT");
            } else {
                tree.info(if code == 0x00 {
                    "SERV SERV_RESET"
                } else {
                    "SERV"
                });
                tree.undecoded(packet, 2, "xcp.parameters");
            }
        }
        _ => render_dto(snapshot, &view, base, tree)?,
    }

    if let Some(outcome) = &snapshot.outcome {
        tree.expert(
            Severity::Warn,
            ExpertGroup::Protocol,
            base..base + packet.len(),
            outcome.as_str(),
        );
    }

    Ok(())
}

fn render_answered(snapshot: &XcpSnapshot, base: usize, tree: &mut ProtoTree) {
    match &snapshot.answered {
        Some(pending) => {
            tree.field("xcp.response_to", base..base + 1, pending.frame)
                .text(base..base + 1, format!("Response to {}", pending.command.name()));
        }
        None => {
            tree.expert(
                Severity::Note,
                ExpertGroup::Sequence,
                base..base + 1,
                "Reply without a preceding command",
            );
        }
    }
}

fn render_command(
    snapshot: &XcpSnapshot,
    view: &ByteView<'_>,
    base: usize,
    tree: &mut ProtoTree,
) -> Result<(), DissectError> {
    let at = |range: Range<usize>| base + range.start..base + range.end;
    let order = snapshot.settings.byte_order;
    let command = XcpCommand::parse(view.bytes(), order)?;

    tree.field("xcp.command", at(0..1), command.code())
        .text(at(0..1), command.name())
        .info(command.name());

    let decoded_to = match &command {
        XcpCommand::Connect { mode } => {
            tree.field("xcp.connect_mode", at(1..2), *mode);
            2
        }
        XcpCommand::GetId { request_type } => {
            tree.field("xcp.id_type", at(1..2), *request_type);
            2
        }
        XcpCommand::SetMta {
            address_extension,
            address,
        } => {
            tree.field("xcp.address_extension", at(3..4), *address_extension)
                .field("xcp.address", at(4..8), *address);
            8
        }
        XcpCommand::Upload { count } => {
            tree.field("xcp.count", at(1..2), *count);
            2
        }
        XcpCommand::ShortUpload {
            count,
            address_extension,
            address,
        } => {
            tree.field("xcp.count", at(1..2), *count)
                .field("xcp.address_extension", at(3..4), *address_extension)
                .field("xcp.address", at(4..8), *address);
            8
        }
        XcpCommand::Download { count } => {
            let data_at = snapshot.settings.granularity.bytes().max(2);
            let len = *count as usize * snapshot.settings.granularity.bytes();
            let data = view.slice(data_at, len)?;
            tree.field("xcp.count", at(1..2), *count)
                .field("xcp.data", at(data_at..data_at + len), data);
            data_at + len
        }
        XcpCommand::ClearDaqList { daq } => {
            tree.field("xcp.daq", at(2..4), *daq);
            4
        }
        XcpCommand::SetDaqPtr { daq, odt, entry } => {
            tree.field("xcp.daq", at(2..4), *daq)
                .field("xcp.odt", at(4..5), *odt)
                .field("xcp.odt_entry_index", at(5..6), *entry);
            6
        }
        XcpCommand::WriteDaq(element) => {
            render_element(tree, element, &at(1..8), order);
            8
        }
        XcpCommand::WriteDaqMultiple(elements) => {
            tree.field("xcp.element_count", at(1..2), elements.len() as u8);
            for (idx, element) in elements.iter().enumerate() {
                render_element(tree, element, &at(2 + idx * 8..10 + idx * 8), order);
            }
            2 + elements.len() * 8
        }
        XcpCommand::SetDaqListMode { daq, mode } => {
            tree.field("xcp.daq_mode", at(1..2), mode.mode)
                .field("xcp.daq", at(2..4), *daq)
                .field("xcp.event_channel", at(4..6), mode.event_channel)
                .field("xcp.prescaler", at(6..7), mode.prescaler)
                .field("xcp.priority", at(7..8), mode.priority);
            if mode.timestamp() {
                tree.text(at(1..2), "Timestamped");
            }
            if mode.stim() {
                tree.text(at(1..2), "Direction: STIM");
            }
            8
        }
        XcpCommand::StartStopDaqList { mode, daq } => {
            tree.field("xcp.start_stop_mode", at(1..2), *mode)
                .field("xcp.daq", at(2..4), *daq)
                .text(
                    at(1..2),
                    match mode {
                        0 => "Stop",
                        1 => "Start",
                        2 => "Select",
                        _ => "Unknown mode",
                    },
                );
            4
        }
        XcpCommand::StartStopSynch { mode } => {
            tree.field("xcp.start_stop_mode", at(1..2), *mode);
            2
        }
        XcpCommand::AllocDaq { count } => {
            tree.field("xcp.daq_count", at(2..4), *count);
            4
        }
        XcpCommand::AllocOdt { daq, count } => {
            tree.field("xcp.daq", at(2..4), *daq)
                .field("xcp.odt_count", at(4..5), *count);
            5
        }
        XcpCommand::AllocOdtEntry { daq, odt, count } => {
            tree.field("xcp.daq", at(2..4), *daq)
                .field("xcp.odt", at(4..5), *odt)
                .field("xcp.odt_entry_count", at(5..6), *count);
            6
        }
        XcpCommand::Level1 { sub_command } => {
            tree.field("xcp.level1_command", at(1..2), *sub_command);
            2
        }
        XcpCommand::Other { code } => {
            if XcpCommandCode::from_primitive(*code).is_none() {
                tree.expert(
                    Severity::Note,
                    ExpertGroup::Undecoded,
                    at(0..1),
                    format!("Unknown XCP command 0x{code:02X}"),
                );
            } else {
                tree.expert(
                    Severity::Note,
                    ExpertGroup::Undecoded,
                    at(0..1),
                    "Parameters of this command are not decoded",
                );
            }
            1
        }
        _ => 1,
    };

    if let Some(rest) = view.bytes().get(decoded_to..).filter(|rest| !rest.is_empty()) {
        tree.field("xcp.parameters", at(decoded_to..view.len()), rest);
    }

    Ok(())
}

fn render_element(
    tree: &mut ProtoTree,
    element: &DaqElement,
    range: &Range<usize>,
    order: XcpByteOrder,
) {
    tree.field("xcp.bit_offset", range.clone(), element.bit_offset)
        .field("xcp.size", range.clone(), element.size)
        .field("xcp.address_extension", range.clone(), element.address_extension)
        .field("xcp.address", range.clone(), element.address)
        .text(
            range.clone(),
            format!(
                "{} element(s) at 0x{:08X}/{} ({order})",
                element.size, element.address, element.address_extension
            ),
        );
}

fn render_res(
    snapshot: &XcpSnapshot,
    view: &ByteView<'_>,
    base: usize,
    tree: &mut ProtoTree,
) -> Result<(), DissectError> {
    let at = |range: Range<usize>| base + range.start..base + range.end;
    tree.field("xcp.pid", at(0..1), PID_RES).info("RES");
    render_answered(snapshot, base, tree);

    let order = snapshot.settings.byte_order;
    let decoded_to = match snapshot.answered.as_ref().map(|pending| &pending.command) {
        Some(XcpCommand::Connect { .. }) => {
            let comm_mode = view.u8(2)?;
            let negotiated = connect_byte_order(comm_mode);
            tree.field("xcp.resource", at(1..2), view.u8(1)?)
                .field("xcp.comm_mode_basic", at(2..3), comm_mode)
                .text(at(2..3), format!("Byte order: {negotiated}"))
                .text(
                    at(2..3),
                    match AddressGranularity::from_wire_bits(comm_mode >> 1) {
                        Some(granularity) => format!("Address granularity: {granularity}"),
                        None => "Address granularity: reserved".to_string(),
                    },
                )
                .field("xcp.max_cto", at(3..4), view.u8(3)?)
                .field("xcp.max_dto", at(4..6), view.u16_xcp(4, negotiated)?)
                .field("xcp.protocol_layer_version", at(6..7), view.u8(6)?)
                .field("xcp.transport_layer_version", at(7..8), view.u8(7)?);
            8
        }
        Some(XcpCommand::GetStatus) => {
            tree.field("xcp.session_status", at(1..2), view.u8(1)?)
                .field("xcp.protection_status", at(2..3), view.u8(2)?)
                .field("xcp.session_configuration_id", at(4..6), view.u16_xcp(4, order)?);
            6
        }
        Some(XcpCommand::GetCommModeInfo) => {
            tree.field("xcp.comm_mode_optional", at(2..3), view.u8(2)?)
                .field("xcp.max_bs", at(4..5), view.u8(4)?)
                .field("xcp.min_st", at(5..6), view.u8(5)?)
                .field("xcp.queue_size", at(6..7), view.u8(6)?)
                .field("xcp.driver_version", at(7..8), view.u8(7)?);
            8
        }
        Some(XcpCommand::GetId { .. }) => {
            let mode = view.u8(1)?;
            let len = view.u32_xcp(4, order)? as usize;
            tree.field("xcp.id_mode", at(1..2), mode)
                .field("xcp.id_length", at(4..8), len as u32);
            if mode & 0x01 != 0 {
                let id = view.text(8, len)?;
                tree.field("xcp.id", at(8..8 + len), id);
                8 + len
            } else {
                8
            }
        }
        Some(XcpCommand::Upload { .. } | XcpCommand::ShortUpload { .. }) => {
            let data_at = snapshot.settings.granularity.bytes();
            tree.field("xcp.data", at(data_at..view.len()), view.rest(data_at));
            view.len()
        }
        Some(XcpCommand::StartStopDaqList { .. }) => {
            tree.field("xcp.first_pid", at(1..2), view.u8(1)?);
            2
        }
        Some(XcpCommand::GetDaqProcessorInfo) => {
            let key = view.u8(7)?;
            let id_field = IdFieldType::from_primitive((key >> 6) & 0x03).unwrap_or_default();
            tree.field("xcp.daq_properties", at(1..2), view.u8(1)?)
                .field("xcp.max_daq", at(2..4), view.u16_xcp(2, order)?)
                .field("xcp.max_event_channel", at(4..6), view.u16_xcp(4, order)?)
                .field("xcp.min_daq", at(6..7), view.u8(6)?)
                .field("xcp.daq_key_byte", at(7..8), key)
                .text(at(7..8), format!("Identification field: {id_field}"));
            8
        }
        Some(XcpCommand::GetDaqResolutionInfo) => {
            let mode = view.u8(5)?;
            tree.field("xcp.granularity_odt_entry_size_daq", at(1..2), view.u8(1)?)
                .field("xcp.max_odt_entry_size_daq", at(2..3), view.u8(2)?)
                .field("xcp.granularity_odt_entry_size_stim", at(3..4), view.u8(3)?)
                .field("xcp.max_odt_entry_size_stim", at(4..5), view.u8(4)?)
                .field("xcp.timestamp_mode", at(5..6), mode)
                .text(at(5..6), format!("Timestamp size: {} bytes", timestamp_size(mode)))
                .field("xcp.timestamp_ticks", at(6..8), view.u16_xcp(6, order)?);
            8
        }
        _ => 1,
    };

    if let Some(rest) = view.bytes().get(decoded_to..).filter(|rest| !rest.is_empty()) {
        tree.field("xcp.parameters", at(decoded_to..view.len()), rest);
    }

    Ok(())
}

fn render_dto(
    snapshot: &XcpSnapshot,
    view: &ByteView<'_>,
    base: usize,
    tree: &mut ProtoTree,
) -> Result<(), DissectError> {
    let at = |range: Range<usize>| base + range.start..base + range.end;
    let settings = &snapshot.settings;
    let kind = match snapshot.direction {
        Direction::ToClient => "DAQ",
        Direction::ToServer => "STIM",
    };

    match snapshot.dto {
        Some(DtoId::Pid(pid)) => {
            tree.field("xcp.pid", at(0..1), pid)
                .info(format!("{kind} PID 0x{pid:02X}"));
            if pid > MAX_DAQ_PID {
                tree.expert(
                    Severity::Warn,
                    ExpertGroup::Protocol,
                    at(0..1),
                    "PID outside the DAQ range",
                );
            }
        }
        Some(DtoId::Relative(odt_ref)) => {
            let daq_at = settings.id_field.daq_offset().unwrap_or(1);
            tree.field("xcp.odt", at(0..1), odt_ref.odt);
            if daq_at > 1 {
                tree.text(at(1..daq_at), "Fill");
            }
            tree.field(
                "xcp.daq",
                at(daq_at..settings.id_field.byte_len()),
                odt_ref.daq,
            )
            .info(format!("{kind} DAQ {} ODT {}", odt_ref.daq, odt_ref.odt));
        }
        None => {
            tree.undecoded(view.bytes(), 0, "xcp.dto.data");
            return Ok(());
        }
    }

    // the identification field is padded out to the address granularity
    let granularity = settings.granularity.bytes();
    let id_len = settings.id_field.byte_len();
    let mut offset = id_len.div_ceil(granularity) * granularity;
    if offset > id_len && view.len() >= offset {
        tree.text(at(id_len..offset), "Fill");
    }

    let Some(layout) = &snapshot.layout else {
        tree.expert(
            Severity::Note,
            ExpertGroup::Undecoded,
            at(0..view.len()),
            "No ODT is configured for this identification; payload shown raw",
        );
        tree.undecoded(view.bytes(), id_len.min(view.len()), "xcp.dto.data");
        return Ok(());
    };

    if layout.timestamped && settings.timestamp_len > 0 {
        let len = settings.timestamp_len;
        let timestamp = match len {
            1 => view.u8(offset)? as u32,
            2 => view.u16_xcp(offset, settings.byte_order)? as u32,
            _ => view.u32_xcp(offset, settings.byte_order)?,
        };
        tree.field("xcp.timestamp", at(offset..offset + len), timestamp);
        offset += len;
    }

    for entry in &layout.entries {
        let Ok(bytes) = view.slice(offset, entry.len) else {
            tree.expert(
                Severity::Warn,
                ExpertGroup::Malformed,
                at(offset.min(view.len())..view.len()),
                format!("{kind} packet ends inside ODT entry {}", entry.index),
            );
            return Ok(());
        };

        let range = at(offset..offset + entry.len);
        let value: FieldValue = match entry.len {
            1 => bytes[0].into(),
            2 => view.u16_xcp(offset, settings.byte_order)?.into(),
            4 => view.u32_xcp(offset, settings.byte_order)?.into(),
            _ => bytes.into(),
        };
        let label = match &entry.name {
            Some(name) => name.clone(),
            None => format!("0x{:08X}/{}", entry.address, entry.address_extension),
        };
        tree.field("xcp.odt_entry", range.clone(), value)
            .text(range, format!("ODT entry {}: {label}", entry.index));
        offset += entry.len;
    }

    if offset < view.len() {
        tree.field("xcp.dto.trailing", at(offset..view.len()), view.rest(offset));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowscope_types::prelude::Record;
    use rstest::rstest;

    #[rstest]
    #[case(&[0xFF, 0x00], XcpCommand::Connect { mode: 0 })]
    #[case(&[0xD5, 0x00, 0x01, 0x00], XcpCommand::AllocDaq { count: 1 })]
    #[case(&[0xD4, 0x00, 0x00, 0x00, 0x02], XcpCommand::AllocOdt { daq: 0, count: 2 })]
    #[case(&[0xE2, 0x00, 0x01, 0x00, 0x02, 0x03], XcpCommand::SetDaqPtr { daq: 1, odt: 2, entry: 3 })]
    #[case(&[0xC0, 0x00], XcpCommand::Level1 { sub_command: 0 })]
    #[case(&[0xF8, 0x00, 0x00], XcpCommand::Other { code: 0xF8 })]
    #[case(&[0x42], XcpCommand::Other { code: 0x42 })]
    fn commands_parse(#[case] bytes: &[u8], #[case] expected: XcpCommand) {
        assert_eq!(XcpCommand::parse(bytes, XcpByteOrder::Intel).unwrap(), expected);
    }

    #[test]
    fn write_daq_reads_in_the_negotiated_order() {
        let bytes = [0xE1, 0xFF, 0x02, 0x00, 0x00, 0x00, 0x10, 0x00];
        let motorola = XcpCommand::parse(&bytes, XcpByteOrder::Motorola).unwrap();
        assert_eq!(
            motorola,
            XcpCommand::WriteDaq(DaqElement {
                bit_offset: 0xFF,
                size: 2,
                address_extension: 0,
                address: 0x1000,
            })
        );
        assert_eq!(motorola.name(), "WRITE_DAQ");
    }

    #[test]
    fn refused_write_daq_multiple_leaves_the_model_untouched() {
        let mut flow = XcpFlow::new(5555, &flowscope_types::prelude::XcpPreferences::default());
        flow.model.alloc_daq(1);
        flow.model.alloc_odt(0, 1).unwrap();
        flow.model.alloc_odt_entry(0, 0, 1).unwrap();
        let start = DaqPtr {
            daq: 0,
            odt: 0,
            entry: 0,
        };
        flow.daq_ptr = Some(start);

        let first = DaqElement {
            bit_offset: 0xFF,
            size: 2,
            address_extension: 0,
            address: 0x1000,
        };
        let second = DaqElement {
            address: 0x1002,
            ..first
        };
        let command = XcpCommand::WriteDaqMultiple(vec![first, second]);

        assert!(matches!(
            apply_response(&mut flow, &command, &[0xFF]),
            Err(DissectError::CapacityExceeded {
                what: "ODT entry",
                ..
            })
        ));
        assert_eq!(flow.daq_ptr, Some(start));
        assert!(flow.model.daq(0).unwrap().odt(0).unwrap().entry(0).is_none());
    }

    #[test]
    fn write_daq_multiple_elements() {
        let mut bytes = vec![0xC7, 2];
        bytes.extend_from_slice(&[0xFF, 1, 0x00, 0x20, 0, 0, 0, 0]);
        bytes.extend_from_slice(&[0xFF, 4, 0x04, 0x20, 0, 0, 1, 0]);
        match XcpCommand::parse(&bytes, XcpByteOrder::Intel).unwrap() {
            XcpCommand::WriteDaqMultiple(elements) => {
                assert_eq!(elements.len(), 2);
                assert_eq!(elements[1].address, 0x2004);
                assert_eq!(elements[1].address_extension, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn truncated_command_is_an_error() {
        assert!(matches!(
            XcpCommand::parse(&[0xD3, 0x00, 0x00], XcpByteOrder::Intel),
            Err(DissectError::Truncated { .. })
        ));
    }

    #[test]
    fn names_cover_levels_and_codes() {
        assert_eq!(
            XcpCommand::Level1 { sub_command: 0x01 }.name(),
            "LEVEL_1_COMMAND SET_DAQ_PACKED_MODE"
        );
        assert_eq!(code_name::<XcpErrorCode>(0x2A), "ERR_DAQ_CONFIG");
        assert_eq!(code_name::<XcpEventCode>(0x04), "Unknown (0x04)");
    }

    #[rstest]
    #[case(IdFieldType::AbsoluteOdt, &[0x10, 0xAA], DtoId::Pid(0x10))]
    #[case(IdFieldType::RelativeOdtDaqByte, &[0x01, 0x02, 0xAA], DtoId::Relative(OdtRef { daq: 2, odt: 1 }))]
    #[case(IdFieldType::RelativeOdtDaqWord, &[0x01, 0x02, 0x01], DtoId::Relative(OdtRef { daq: 0x0102, odt: 1 }))]
    #[case(IdFieldType::RelativeOdtDaqWordAligned, &[0x00, 0xEE, 0x03, 0x00], DtoId::Relative(OdtRef { daq: 3, odt: 0 }))]
    fn dto_identification(
        #[case] id_field: IdFieldType,
        #[case] bytes: &[u8],
        #[case] expected: DtoId,
    ) {
        let mut settings = XcpSettings::from_preferences(&Default::default());
        settings.id_field = id_field;
        if id_field == IdFieldType::RelativeOdtDaqWord {
            settings.byte_order = XcpByteOrder::Motorola;
        }
        assert_eq!(dto_id(&ByteView::new(bytes), &settings).unwrap(), expected);
    }

    #[rstest]
    #[case(IdFieldType::RelativeOdtDaqWord, &[0x00, 0x03, 0x00], 1..3, false)]
    #[case(IdFieldType::RelativeOdtDaqWordAligned, &[0x00, 0xEE, 0x03, 0x00], 2..4, true)]
    fn daq_number_skips_the_fill_byte(
        #[case] id_field: IdFieldType,
        #[case] bytes: &[u8],
        #[case] expected: Range<usize>,
        #[case] filled: bool,
    ) {
        let mut settings = XcpSettings::from_preferences(&Default::default());
        settings.id_field = id_field;
        let view = ByteView::new(bytes);
        let snapshot = XcpSnapshot {
            direction: Direction::ToClient,
            settings,
            answered: None,
            dto: Some(dto_id(&view, &settings).unwrap()),
            layout: None,
            outcome: None,
        };

        let mut tree = ProtoTree::new(ProtocolId::Xcp);
        render_dto(&snapshot, &view, 0, &mut tree).unwrap();
        let dissection = tree.finish();

        let daq_range = dissection.records.iter().find_map(|record| match record {
            Record::Field {
                field: "xcp.daq",
                range,
                ..
            } => Some(range.clone()),
            _ => None,
        });
        assert_eq!(daq_range, Some(expected));
        assert_eq!(dissection.field("xcp.daq"), Some(&FieldValue::U16(3)));
        assert_eq!(dissection.texts().contains(&"Fill"), filled);
    }

    #[test]
    fn framing_counts_the_header() {
        let framing = XcpFraming::new(16);
        assert_eq!(framing.pdu_len(&[2, 0, 0, 0]), 6);
        assert_eq!(framing.max_pdu_len(), 20);
    }

    #[rstest]
    #[case(0, 0)]
    #[case(1, 1)]
    #[case(2, 2)]
    #[case(0x0C, 4)]
    #[case(3, 0)]
    fn timestamp_sizes(#[case] mode: u8, #[case] expected: usize) {
        assert_eq!(timestamp_size(mode), expected);
    }
}
