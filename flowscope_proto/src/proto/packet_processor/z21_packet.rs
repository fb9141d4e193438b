//! Roco/Fleischmann Z21 LAN protocol. A datagram carries one or more `[datalen:2 LE][header:2 LE]`
//! PDUs; `datalen` counts the whole PDU. The X-Bus tunnel (`0x40`) carries its own XOR checksum.
//!
//! The flow remembers the broadcast subscription the client asked for and the output format of
//! every loco it has been told about, so later pushes from the command station can be annotated.

use super::includes::*;
use crate::constants::Z21_HEADER_LEN;
use crate::proto::state_subcontainers::z21_state_container::{
    BroadcastSubscription, Z21Flow, Z21Snapshot,
};
use byteorder::{ByteOrder, LittleEndian};
use flowscope_wire::checksum::{verify_xor8, ChecksumStatus};
use flowscope_wire::{frame_datagram, PduFormat};
use std::ops::Range;

pub mod header {
    pub const GET_SERIAL_NUMBER: u16 = 0x10;
    pub const GET_CODE: u16 = 0x18;
    pub const GET_HWINFO: u16 = 0x1A;
    pub const LOGOFF: u16 = 0x30;
    pub const X_BUS: u16 = 0x40;
    pub const SET_BROADCASTFLAGS: u16 = 0x50;
    pub const GET_BROADCASTFLAGS: u16 = 0x51;
    pub const GET_LOCOMODE: u16 = 0x60;
    pub const SET_LOCOMODE: u16 = 0x61;
    pub const GET_TURNOUTMODE: u16 = 0x70;
    pub const SET_TURNOUTMODE: u16 = 0x71;
    pub const RMBUS_DATACHANGED: u16 = 0x80;
    pub const RMBUS_GETDATA: u16 = 0x81;
    pub const RMBUS_PROGRAMMODULE: u16 = 0x82;
    pub const SYSTEMSTATE_DATACHANGED: u16 = 0x84;
    pub const SYSTEMSTATE_GETDATA: u16 = 0x85;
    pub const RAILCOM_DATACHANGED: u16 = 0x88;
    pub const RAILCOM_GETDATA: u16 = 0x89;
    pub const LOCONET_Z21_RX: u16 = 0xA0;
    pub const LOCONET_Z21_TX: u16 = 0xA1;
    pub const LOCONET_FROM_LAN: u16 = 0xA2;
    pub const LOCONET_DISPATCH_ADDR: u16 = 0xA3;
    pub const LOCONET_DETECTOR: u16 = 0xA4;
    pub const CAN_DETECTOR: u16 = 0xC4;
}

fn header_name(code: u16) -> Option<&'static str> {
    use header::*;
    let name = match code {
        GET_SERIAL_NUMBER => "LAN_GET_SERIAL_NUMBER",
        GET_CODE => "LAN_GET_CODE",
        GET_HWINFO => "LAN_GET_HWINFO",
        LOGOFF => "LAN_LOGOFF",
        X_BUS => "LAN_X",
        SET_BROADCASTFLAGS => "LAN_SET_BROADCASTFLAGS",
        GET_BROADCASTFLAGS => "LAN_GET_BROADCASTFLAGS",
        GET_LOCOMODE => "LAN_GET_LOCOMODE",
        SET_LOCOMODE => "LAN_SET_LOCOMODE",
        GET_TURNOUTMODE => "LAN_GET_TURNOUTMODE",
        SET_TURNOUTMODE => "LAN_SET_TURNOUTMODE",
        RMBUS_DATACHANGED => "LAN_RMBUS_DATACHANGED",
        RMBUS_GETDATA => "LAN_RMBUS_GETDATA",
        RMBUS_PROGRAMMODULE => "LAN_RMBUS_PROGRAMMODULE",
        SYSTEMSTATE_DATACHANGED => "LAN_SYSTEMSTATE_DATACHANGED",
        SYSTEMSTATE_GETDATA => "LAN_SYSTEMSTATE_GETDATA",
        RAILCOM_DATACHANGED => "LAN_RAILCOM_DATACHANGED",
        RAILCOM_GETDATA => "LAN_RAILCOM_GETDATA",
        LOCONET_Z21_RX => "LAN_LOCONET_Z21_RX",
        LOCONET_Z21_TX => "LAN_LOCONET_Z21_TX",
        LOCONET_FROM_LAN => "LAN_LOCONET_FROM_LAN",
        LOCONET_DISPATCH_ADDR => "LAN_LOCONET_DISPATCH_ADDR",
        LOCONET_DETECTOR => "LAN_LOCONET_DETECTOR",
        CAN_DETECTOR => "LAN_CAN_DETECTOR",
        _ => return None,
    };
    Some(name)
}

const BROADCAST_FLAGS: &[(u32, &str)] = &[
    (0x0000_0001, "driving and switching"),
    (0x0000_0002, "R-Bus feedback"),
    (0x0000_0004, "RailCom"),
    (0x0000_0100, "system state"),
    (0x0001_0000, "all locos"),
    (0x0004_0000, "RailCom for all locos"),
    (0x0008_0000, "CAN detector"),
    (0x0100_0000, "LocoNet"),
    (0x0200_0000, "LocoNet locos"),
    (0x0400_0000, "LocoNet switches"),
    (0x0800_0000, "LocoNet detector"),
];

/// The subscription flag a command station push is sent under
fn broadcast_flag_for(code: u16) -> Option<u32> {
    match code {
        header::X_BUS => Some(0x0000_0001),
        header::RMBUS_DATACHANGED => Some(0x0000_0002),
        header::RAILCOM_DATACHANGED => Some(0x0000_0004),
        header::SYSTEMSTATE_DATACHANGED => Some(0x0000_0100),
        header::CAN_DETECTOR => Some(0x0008_0000),
        header::LOCONET_Z21_RX | header::LOCONET_Z21_TX | header::LOCONET_FROM_LAN => {
            Some(0x0100_0000)
        }
        header::LOCONET_DETECTOR => Some(0x0800_0000),
        _ => None,
    }
}

fn describe_broadcast_flags(flags: u32) -> String {
    let names: Vec<&str> = BROADCAST_FLAGS
        .iter()
        .filter(|(bit, _)| flags & bit != 0)
        .map(|(_, name)| *name)
        .collect();
    if names.is_empty() {
        "none".to_string()
    } else {
        names.join(", ")
    }
}

fn loco_mode_name(mode: u8) -> &'static str {
    match mode {
        0 => "DCC",
        1 => "MM",
        _ => "unknown",
    }
}

/// Locomotive addresses travel big-endian with the two top bits reserved
fn loco_address(msb: u8, lsb: u8) -> u16 {
    (((msb & 0x3F) as u16) << 8) | lsb as u16
}

/// X-Bus command name from the X-header and, where it selects a sub-command, `DB0`
fn x_command_name(x_header: u8, db0: Option<u8>, direction: Direction) -> &'static str {
    match (x_header, db0, direction) {
        (0x21, Some(0x21), _) => "LAN_X_GET_VERSION",
        (0x21, Some(0x24), _) => "LAN_X_GET_STATUS",
        (0x21, Some(0x80), _) => "LAN_X_SET_TRACK_POWER_OFF",
        (0x21, Some(0x81), _) => "LAN_X_SET_TRACK_POWER_ON",
        (0x61, Some(0x00), _) => "LAN_X_BC_TRACK_POWER_OFF",
        (0x61, Some(0x01), _) => "LAN_X_BC_TRACK_POWER_ON",
        (0x61, Some(0x02), _) => "LAN_X_BC_PROGRAMMING_MODE",
        (0x61, Some(0x08), _) => "LAN_X_BC_TRACK_SHORT_CIRCUIT",
        (0x61, Some(0x82), _) => "LAN_X_UNKNOWN_COMMAND",
        (0x62, Some(0x22), _) => "LAN_X_STATUS_CHANGED",
        (0x63, Some(0x21), _) => "LAN_X_GET_VERSION_REPLY",
        (0x80, _, _) => "LAN_X_SET_STOP",
        (0x81, Some(0x00), _) => "LAN_X_BC_STOPPED",
        (0xE3, Some(0xF0), _) => "LAN_X_GET_LOCO_INFO",
        (0xE4, Some(0xF8), _) => "LAN_X_SET_LOCO_FUNCTION",
        (0xE4, Some(db0), _) if db0 & 0xF0 == 0x10 => "LAN_X_SET_LOCO_DRIVE",
        (0xEF, _, _) => "LAN_X_LOCO_INFO",
        (0x43, _, Direction::ToServer) => "LAN_X_GET_TURNOUT_INFO",
        (0x43, _, Direction::ToClient) => "LAN_X_TURNOUT_INFO",
        (0x53, _, _) => "LAN_X_SET_TURNOUT",
        (0xF1, Some(0x0A), _) => "LAN_X_GET_FIRMWARE_VERSION",
        (0xF3, Some(0x0A), _) => "LAN_X_GET_FIRMWARE_VERSION_REPLY",
        _ => "LAN_X_UNKNOWN",
    }
}

/// The loco an X-Bus message addresses, if any. `x` excludes the checksum byte
fn x_loco_address(x: &[u8]) -> Option<u16> {
    match x {
        [0xE3, 0xF0, msb, lsb, ..] => Some(loco_address(*msb, *lsb)),
        [0xE4, _, msb, lsb, ..] => Some(loco_address(*msb, *lsb)),
        [0xEF, msb, lsb, ..] => Some(loco_address(*msb, *lsb)),
        _ => None,
    }
}

/// Splits an X-Bus payload into the checksummed bytes and the trailing XOR byte
fn split_x_checksum(x: &[u8]) -> (&[u8], Option<u8>) {
    match x.split_last() {
        Some((xor, covered)) if !covered.is_empty() => (covered, Some(*xor)),
        _ => (x, None),
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct Z21Framing;

impl PduFormat for Z21Framing {
    fn fixed_header_len(&self) -> usize {
        Z21_HEADER_LEN
    }

    fn pdu_len(&self, header: &[u8]) -> usize {
        LittleEndian::read_u16(header) as usize
    }

    fn multiple_per_datagram(&self) -> bool {
        true
    }
}

pub struct Z21Dissector;

impl Dissector for Z21Dissector {
    fn protocol(&self) -> ProtocolId {
        ProtocolId::Z21
    }

    #[cfg_attr(
        feature = "verbose-tracing",
        tracing::instrument(level = "trace", target = "flowscope", skip_all, fields(frame = %ctx.frame()))
    )]
    fn dissect(
        &self,
        session: &mut AnalysisSession,
        ctx: &PacketContext,
        data: &[u8],
        tree: &mut ProtoTree,
    ) -> Result<usize, DissectError> {
        let mut pdus: Vec<Range<usize>> = Vec::new();
        let report = frame_datagram(data, &Z21Framing, |pdu| {
            pdus.push(pdu.offset..pdu.offset + pdu.bytes.len())
        });

        if let Some(err) = report.error {
            if pdus.is_empty() {
                return Err(err.into());
            }

            tree.expert(
                Severity::Error,
                ExpertGroup::Malformed,
                report.consumed..data.len(),
                err.to_string(),
            )
            .undecoded(data, report.consumed, "z21.malformed");
        }

        let count = pdus.len();
        for (index, range) in pdus.into_iter().enumerate() {
            let child = dissect_pdu(session, ctx, index, &data[range]);
            tree.child(child);
        }

        if count > 1 {
            tree.info(format!("{count} messages"));
        }

        Ok(data.len())
    }
}

fn dissect_pdu(
    session: &mut AnalysisSession,
    ctx: &PacketContext,
    index: usize,
    pdu: &[u8],
) -> Dissection {
    let mut tree = ProtoTree::new(ProtocolId::Z21);
    let key = SnapshotKey::new(ctx, ProtocolId::Z21, index);

    let rendered = match ctx.pass {
        Pass::First => analyse(session, ctx, pdu).and_then(|snapshot| {
            session.snapshots_mut().record(key, snapshot.clone())?;
            Ok(snapshot)
        }),
        Pass::Replay => session.snapshots().replayed::<Z21Snapshot>(&key),
    }
    .and_then(|snapshot| render_pdu(&snapshot, pdu, &mut tree));

    if let Err(err) = rendered {
        tree.expert(
            Severity::Error,
            err.expert_group(),
            0..pdu.len(),
            err.into_string(),
        );
    }

    tree.set_consumed(pdu.len());
    tree.finish()
}

/// Applies what this PDU tells us about the flow and freezes what rendering needs
fn analyse(
    session: &mut AnalysisSession,
    ctx: &PacketContext,
    pdu: &[u8],
) -> Result<Z21Snapshot, DissectError> {
    let server_port = ctx.server_port_guess();
    let flow = session
        .conversations_mut()
        .state_or_insert_with(ctx.conversation, || Z21Flow::new(server_port))?;
    let direction = ctx.direction(flow.server_port);

    let view = ByteView::new(pdu);
    let code = view.u16_le(2)?;
    let body = ByteView::new(view.rest(Z21_HEADER_LEN));

    let mut loco = None;
    match (code, direction) {
        (header::SET_BROADCASTFLAGS, Direction::ToServer)
        | (header::GET_BROADCASTFLAGS, Direction::ToClient) => {
            if let Ok(flags) = body.u32_le(0) {
                flow.broadcast = Some(BroadcastSubscription {
                    flags,
                    set_in: ctx.frame(),
                });
            }
        }

        (header::SET_LOCOMODE, Direction::ToServer)
        | (header::GET_LOCOMODE, Direction::ToClient) => {
            let address = loco_address(body.u8(0)?, body.u8(1)?);
            let _ = flow.loco_modes.insert(address, body.u8(2)?);
            loco = Some(address);
        }

        (header::GET_LOCOMODE, Direction::ToServer) => {
            loco = Some(loco_address(body.u8(0)?, body.u8(1)?));
        }

        (header::X_BUS, _) => {
            loco = x_loco_address(split_x_checksum(body.bytes()).0);
        }

        _ => {}
    }

    Ok(Z21Snapshot {
        direction,
        broadcast: flow.broadcast,
        loco_mode: loco.and_then(|address| flow.loco_modes.get(&address).copied()),
    })
}

fn render_pdu(
    snapshot: &Z21Snapshot,
    pdu: &[u8],
    tree: &mut ProtoTree,
) -> Result<(), DissectError> {
    let view = ByteView::new(pdu);
    let datalen = view.u16_le(0)?;
    let code = view.u16_le(2)?;
    tree.field("z21.datalen", 0..2, datalen)
        .field("z21.header", 2..4, code);

    let Some(name) = header_name(code) else {
        tree.info(format!("Unknown header 0x{code:04X}"))
            .expert(
                Severity::Note,
                ExpertGroup::Undecoded,
                2..4,
                format!("Z21 header 0x{code:04X} is not implemented"),
            )
            .undecoded(pdu, Z21_HEADER_LEN, "z21.data");
        return Ok(());
    };

    tree.text(2..4, name).info(name);

    if snapshot.direction == Direction::ToClient {
        if let (Some(flag), Some(subscription)) = (broadcast_flag_for(code), snapshot.broadcast) {
            if subscription.flags & flag == 0 {
                tree.expert(
                    Severity::Note,
                    ExpertGroup::Sequence,
                    2..4,
                    format!(
                        "Broadcast not covered by the flags set in frame {}",
                        subscription.set_in
                    ),
                );
            }
        }
    }

    let base = Z21_HEADER_LEN;
    let body = ByteView::new(view.rest(base));
    let at = |start: usize, len: usize| base + start..base + start + len;
    let reply = snapshot.direction == Direction::ToClient && !body.is_empty();

    match code {
        header::GET_SERIAL_NUMBER if reply => {
            tree.field("z21.serial", at(0, 4), body.u32_le(0)?);
        }

        header::GET_CODE if reply => {
            tree.field("z21.code", at(0, 1), body.u8(0)?);
        }

        header::GET_HWINFO if reply => {
            let firmware = body.u32_le(4)?;
            tree.field("z21.hw_type", at(0, 4), body.u32_le(0)?)
                .field("z21.fw_version", at(4, 4), firmware)
                .text(
                    at(4, 4),
                    format!("Firmware {:x}.{:02x}", (firmware >> 8) & 0xFF, firmware & 0xFF),
                );
        }

        header::SET_BROADCASTFLAGS | header::GET_BROADCASTFLAGS if !body.is_empty() => {
            let flags = body.u32_le(0)?;
            tree.field("z21.broadcast_flags", at(0, 4), flags)
                .text(at(0, 4), describe_broadcast_flags(flags));
        }

        header::GET_LOCOMODE | header::SET_LOCOMODE => {
            let address = loco_address(body.u8(0)?, body.u8(1)?);
            tree.field("z21.loco_address", at(0, 2), address);
            if let Ok(mode) = body.u8(2) {
                tree.field("z21.loco_mode", at(2, 1), mode)
                    .text(at(2, 1), loco_mode_name(mode));
            } else {
                render_known_loco_mode(snapshot, tree);
            }
            tree.info(format!("{name} loco {address}"));
        }

        header::GET_TURNOUTMODE | header::SET_TURNOUTMODE => {
            let address = body.u16_be(0)?;
            tree.field("z21.turnout_address", at(0, 2), address);
            if let Ok(mode) = body.u8(2) {
                tree.field("z21.turnout_mode", at(2, 1), mode)
                    .text(at(2, 1), loco_mode_name(mode));
            }
        }

        header::RMBUS_DATACHANGED => {
            tree.field("z21.rbus_group", at(0, 1), body.u8(0)?)
                .field("z21.rbus_feedback", at(1, 10), body.slice(1, 10)?);
        }

        header::RMBUS_GETDATA => {
            tree.field("z21.rbus_group", at(0, 1), body.u8(0)?);
        }

        header::RMBUS_PROGRAMMODULE => {
            tree.field("z21.rbus_module", at(0, 1), body.u8(0)?);
        }

        header::SYSTEMSTATE_DATACHANGED => render_system_state(&body, base, tree)?,

        header::RAILCOM_DATACHANGED => {
            tree.field("z21.railcom.loco_address", at(0, 2), body.u16_le(0)?)
                .field("z21.railcom.receive_counter", at(2, 4), body.u32_le(2)?)
                .field("z21.railcom.error_counter", at(6, 2), body.u16_le(6)?);
            if let (Ok(options), Ok(speed), Ok(qos)) = (body.u8(9), body.u8(10), body.u8(11)) {
                tree.field("z21.railcom.options", at(9, 1), options)
                    .field("z21.railcom.speed", at(10, 1), speed)
                    .field("z21.railcom.qos", at(11, 1), qos);
            }
        }

        header::RAILCOM_GETDATA => {
            tree.field("z21.railcom.type", at(0, 1), body.u8(0)?)
                .field("z21.railcom.loco_address", at(1, 2), body.u16_le(1)?);
        }

        header::LOCONET_Z21_RX | header::LOCONET_Z21_TX | header::LOCONET_FROM_LAN => {
            tree.field("z21.loconet.message", base..pdu.len(), body.bytes());
            if let Ok(opcode) = body.u8(0) {
                tree.field("z21.loconet.opcode", at(0, 1), opcode);
            }
        }

        header::LOCONET_DISPATCH_ADDR => {
            tree.field("z21.loconet.loco_address", at(0, 2), body.u16_le(0)?);
            if let Ok(slot) = body.u8(2) {
                tree.field("z21.loconet.slot", at(2, 1), slot);
            }
        }

        header::LOCONET_DETECTOR => {
            tree.field("z21.loconet.detector_type", at(0, 1), body.u8(0)?)
                .field("z21.loconet.report_address", at(1, 2), body.u16_le(1)?);
            if body.len() > 3 {
                tree.field("z21.loconet.info", at(3, body.len() - 3), body.rest(3));
            }
        }

        header::CAN_DETECTOR => {
            tree.field("z21.can.network_id", at(0, 2), body.u16_le(0)?)
                .field("z21.can.address", at(2, 2), body.u16_le(2)?)
                .field("z21.can.port", at(4, 1), body.u8(4)?)
                .field("z21.can.type", at(5, 1), body.u8(5)?);
            if let (Ok(value1), Ok(value2)) = (body.u16_le(6), body.u16_le(8)) {
                tree.field("z21.can.value1", at(6, 2), value1)
                    .field("z21.can.value2", at(8, 2), value2);
            }
        }

        header::X_BUS => render_x_bus(snapshot, &body, base, tree)?,

        _ => {
            if !body.is_empty() {
                tree.undecoded(pdu, base, "z21.data");
            }
        }
    }

    Ok(())
}

fn render_known_loco_mode(snapshot: &Z21Snapshot, tree: &mut ProtoTree) {
    if let Some(mode) = snapshot.loco_mode {
        tree.text(0..0, format!("Loco output format: {}", loco_mode_name(mode)));
    }
}

fn render_system_state(
    body: &ByteView<'_>,
    base: usize,
    tree: &mut ProtoTree,
) -> Result<(), DissectError> {
    let at = |start: usize, len: usize| base + start..base + start + len;
    let signed = |offset: usize| body.u16_le(offset).map(|v| v as i16 as i64);

    tree.field("z21.main_current", at(0, 2), signed(0)?)
        .field("z21.prog_current", at(2, 2), signed(2)?)
        .field("z21.filtered_main_current", at(4, 2), signed(4)?)
        .field("z21.temperature", at(6, 2), signed(6)?)
        .field("z21.supply_voltage", at(8, 2), body.u16_le(8)?)
        .field("z21.vcc_voltage", at(10, 2), body.u16_le(10)?)
        .field("z21.central_state", at(12, 1), body.u8(12)?)
        .field("z21.central_state_ex", at(13, 1), body.u8(13)?);
    if let Ok(capabilities) = body.u8(15) {
        tree.field("z21.capabilities", at(15, 1), capabilities);
    }
    Ok(())
}

fn render_x_bus(
    snapshot: &Z21Snapshot,
    body: &ByteView<'_>,
    base: usize,
    tree: &mut ProtoTree,
) -> Result<(), DissectError> {
    let x_header = body.u8(0)?;
    let (covered, xor) = split_x_checksum(body.bytes());
    let db0 = covered.get(1).copied();
    let name = x_command_name(x_header, db0, snapshot.direction);

    tree.field("z21.x.header", base..base + 1, x_header)
        .text(base..base + 1, name)
        .info(name);
    if covered.len() > 1 {
        tree.field("z21.x.db", base + 1..base + covered.len(), &covered[1..]);
    }

    if let Some(address) = x_loco_address(covered) {
        tree.field("z21.loco_address", base + 1..base + covered.len(), address);
        render_known_loco_mode(snapshot, tree);
    }

    let checksum_at = base + covered.len()..base + body.len();
    match verify_xor8(covered, xor) {
        ChecksumStatus::Good => {
            if let Some(xor) = xor {
                tree.field("z21.x.checksum", checksum_at, xor);
            }
        }
        ChecksumStatus::Bad { expected, computed } => {
            tree.field("z21.x.checksum", checksum_at.clone(), expected)
                .expert(
                    Severity::Warn,
                    ExpertGroup::Checksum,
                    checksum_at,
                    format!("Bad X-Bus checksum 0x{expected:02X}, should be 0x{computed:02X}"),
                );
        }
        ChecksumStatus::Unverified => {
            tree.expert(
                Severity::Note,
                ExpertGroup::Checksum,
                base..base + body.len(),
                "X-Bus message has no checksum byte",
            );
        }
    }

    Ok(())
}
