//! The XCP data-acquisition model. ALLOC_DAQ, ALLOC_ODT and ALLOC_ODT_ENTRY fix the shape of a
//! DAQ list → ODT → ODT entry hierarchy; WRITE_DAQ fills it in; START_STOP_DAQ_LIST binds
//! runtime PIDs to ODTs. Data packets later carry nothing but a PID and raw bytes, so their
//! layout can only be recovered from this model.
//!
//! Capacities are fixed by the allocating message. Nothing here grows on write: an index
//! outside the allocated range is refused.

use crate::error::DissectError;
use crate::proto::packet_processor::xcp_packet::{XcpCommand, XcpFraming};
use flowscope_types::prelude::{
    AddressGranularity, Direction, FrameId, XcpByteOrder, XcpPreferences,
};
use flowscope_wire::StreamReassembler;
use packed_struct::derive::PrimitiveEnum_u8;
use std::collections::HashMap;

/// Slave-to-master packets with a PID below this value are DAQ packets
pub const MAX_DAQ_PID: u8 = 0xFB;
const PID_SLOTS: usize = MAX_DAQ_PID as usize + 1;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OdtEntry {
    pub address_extension: u8,
    pub address: u32,
    /// Size in address-granularity elements
    pub size: u8,
    /// 0xFF unless the entry is a single bit
    pub bit_offset: u8,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Odt {
    entries: Option<Box<[Option<OdtEntry>]>>,
}

impl Odt {
    pub fn capacity(&self) -> usize {
        self.entries.as_ref().map(|e| e.len()).unwrap_or(0)
    }

    pub fn entry(&self, index: usize) -> Option<&OdtEntry> {
        self.entries.as_ref()?.get(index)?.as_ref()
    }
}

/// SET_DAQ_LIST_MODE parameters
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct DaqListMode {
    pub mode: u8,
    pub event_channel: u16,
    pub prescaler: u8,
    pub priority: u8,
}

impl DaqListMode {
    pub const ALTERNATING: u8 = 0x01;
    pub const DIRECTION_STIM: u8 = 0x02;
    pub const DTO_CTR: u8 = 0x08;
    pub const TIMESTAMP: u8 = 0x10;
    pub const PID_OFF: u8 = 0x20;

    pub fn timestamp(&self) -> bool {
        self.mode & Self::TIMESTAMP != 0
    }

    pub fn stim(&self) -> bool {
        self.mode & Self::DIRECTION_STIM != 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct DaqList {
    odts: Option<Box<[Odt]>>,
    pub mode: DaqListMode,
}

impl DaqList {
    pub fn odt_capacity(&self) -> usize {
        self.odts.as_ref().map(|o| o.len()).unwrap_or(0)
    }

    pub fn odt(&self, index: usize) -> Option<&Odt> {
        self.odts.as_ref()?.get(index)
    }
}

/// Where WRITE_DAQ writes next
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DaqPtr {
    pub daq: u16,
    pub odt: u8,
    pub entry: u8,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct OdtRef {
    pub daq: u16,
    pub odt: u8,
}

/// One ODT entry with its byte length worked out
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ResolvedEntry {
    pub index: u8,
    pub address_extension: u8,
    pub address: u32,
    pub len: usize,
    pub name: Option<String>,
}

/// The byte layout of one ODT, frozen at the moment a data packet referenced it
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ResolvedOdt {
    pub odt_ref: OdtRef,
    pub entries: Vec<ResolvedEntry>,
    /// The first ODT of a DAQ list carries the timestamp when the list asked for one
    pub timestamped: bool,
}

impl ResolvedOdt {
    pub fn payload_len(&self) -> usize {
        self.entries.iter().map(|entry| entry.len).sum()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DaqModel {
    daqs: Box<[DaqList]>,
    /// Bumped whenever the whole DAQ set is replaced or freed
    generation: u64,
}

impl DaqModel {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn daq_count(&self) -> usize {
        self.daqs.len()
    }

    pub fn daq(&self, daq: u16) -> Option<&DaqList> {
        self.daqs.get(daq as usize)
    }

    fn daq_mut(&mut self, daq: u16) -> Result<&mut DaqList, DissectError> {
        let capacity = self.daqs.len();
        self.daqs
            .get_mut(daq as usize)
            .ok_or(DissectError::CapacityExceeded {
                what: "DAQ list",
                index: daq as usize,
                capacity,
            })
    }

    fn odt_mut(&mut self, daq: u16, odt: u8) -> Result<&mut Odt, DissectError> {
        let list = self.daq_mut(daq)?;
        let odts = list
            .odts
            .as_mut()
            .ok_or(DissectError::NotAllocated("ODT list"))?;
        let capacity = odts.len();
        odts.get_mut(odt as usize)
            .ok_or(DissectError::CapacityExceeded {
                what: "ODT",
                index: odt as usize,
                capacity,
            })
    }

    /// FREE_DAQ
    pub fn free_daq(&mut self) {
        self.daqs = Box::default();
        self.generation += 1;
    }

    /// ALLOC_DAQ replaces the whole DAQ set. A count of zero is legal and leaves nothing allocated
    pub fn alloc_daq(&mut self, count: u16) {
        self.daqs = (0..count).map(|_| DaqList::default()).collect();
        self.generation += 1;
    }

    pub fn alloc_odt(&mut self, daq: u16, count: u8) -> Result<(), DissectError> {
        let list = self.daq_mut(daq)?;
        if list.odts.is_some() {
            return Err(DissectError::InvalidPacket(
                "ODTs were already allocated for this DAQ list",
            ));
        }

        list.odts = Some((0..count).map(|_| Odt::default()).collect());
        Ok(())
    }

    pub fn alloc_odt_entry(&mut self, daq: u16, odt: u8, count: u8) -> Result<(), DissectError> {
        let odt = self.odt_mut(daq, odt)?;
        if odt.entries.is_some() {
            return Err(DissectError::InvalidPacket(
                "ODT entries were already allocated for this ODT",
            ));
        }

        odt.entries = Some(vec![None; count as usize].into_boxed_slice());
        Ok(())
    }

    pub fn write_daq(&mut self, at: DaqPtr, entry: OdtEntry) -> Result<(), DissectError> {
        let odt = self.odt_mut(at.daq, at.odt)?;
        let entries = odt
            .entries
            .as_mut()
            .ok_or(DissectError::NotAllocated("ODT entry list"))?;
        let capacity = entries.len();
        let slot = entries
            .get_mut(at.entry as usize)
            .ok_or(DissectError::CapacityExceeded {
                what: "ODT entry",
                index: at.entry as usize,
                capacity,
            })?;
        *slot = Some(entry);
        Ok(())
    }

    pub fn set_mode(&mut self, daq: u16, mode: DaqListMode) -> Result<(), DissectError> {
        self.daq_mut(daq)?.mode = mode;
        Ok(())
    }

    /// CLEAR_DAQ_LIST keeps the allocated shape but forgets every entry
    pub fn clear_daq_list(&mut self, daq: u16) -> Result<(), DissectError> {
        if let Some(odts) = self.daq_mut(daq)?.odts.as_mut() {
            for odt in odts.iter_mut() {
                if let Some(entries) = odt.entries.as_mut() {
                    entries.iter_mut().for_each(|entry| *entry = None);
                }
            }
        }
        Ok(())
    }

    /// Populated entries of an ODT in index order, sized by `granularity`
    pub fn resolve(&self, odt_ref: OdtRef, granularity: AddressGranularity) -> Option<ResolvedOdt> {
        let list = self.daq(odt_ref.daq)?;
        let odt = list.odt(odt_ref.odt as usize)?;
        let entries = (0..odt.capacity())
            .filter_map(|index| {
                odt.entry(index).map(|entry| ResolvedEntry {
                    index: index as u8,
                    address_extension: entry.address_extension,
                    address: entry.address,
                    len: entry.size as usize * granularity.bytes(),
                    name: entry.name.clone(),
                })
            })
            .collect();

        Some(ResolvedOdt {
            odt_ref,
            entries,
            timestamped: odt_ref.odt == 0 && list.mode.timestamp(),
        })
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct PidBinding {
    odt_ref: OdtRef,
    generation: u64,
}

/// Runtime PID → ODT. Entries are never purged eagerly: a binding made before the DAQ set was
/// freed or reallocated simply stops resolving
#[derive(Debug, Clone)]
pub struct PidMap {
    slots: Box<[Option<PidBinding>]>,
}

impl Default for PidMap {
    fn default() -> Self {
        Self {
            slots: vec![None; PID_SLOTS].into_boxed_slice(),
        }
    }
}

impl PidMap {
    /// Assigns `first_pid + n` to ODT `n` of `daq`, in index order. Returns how many PIDs were bound
    pub fn bind(&mut self, model: &DaqModel, daq: u16, first_pid: u8) -> Result<usize, DissectError> {
        let list = model.daq(daq).ok_or(DissectError::CapacityExceeded {
            what: "DAQ list",
            index: daq as usize,
            capacity: model.daq_count(),
        })?;

        let count = list.odt_capacity();
        let first = first_pid as usize;
        if first + count > self.slots.len() {
            return Err(DissectError::CapacityExceeded {
                what: "PID",
                index: first + count - 1,
                capacity: PID_SLOTS,
            });
        }

        for (odt, slot) in self.slots[first..first + count].iter_mut().enumerate() {
            *slot = Some(PidBinding {
                odt_ref: OdtRef {
                    daq,
                    odt: odt as u8,
                },
                generation: model.generation(),
            });
        }

        log::trace!(target: "flowscope", "Bound PIDs {first_pid:#04x}..+{count} to DAQ list {daq}");
        Ok(count)
    }

    pub fn resolve(&self, model: &DaqModel, pid: u8) -> Option<OdtRef> {
        let binding = self.slots.get(pid as usize)?.as_ref()?;
        if binding.generation != model.generation() {
            log::warn!(target: "flowscope", "PID {pid:#04x} refers to a DAQ configuration that no longer exists");
            return None;
        }

        model
            .daq(binding.odt_ref.daq)?
            .odt(binding.odt_ref.odt as usize)
            .map(|_| binding.odt_ref)
    }
}

/// GET_DAQ_PROCESSOR_INFO's DAQ_KEY_BYTE bits 6..7: how a DTO names its ODT
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default, PrimitiveEnum_u8, strum::Display)]
pub enum IdFieldType {
    #[default]
    #[strum(serialize = "Absolute ODT number")]
    AbsoluteOdt = 0,
    #[strum(serialize = "Relative ODT number, absolute DAQ list number (byte)")]
    RelativeOdtDaqByte = 1,
    #[strum(serialize = "Relative ODT number, absolute DAQ list number (word)")]
    RelativeOdtDaqWord = 2,
    #[strum(serialize = "Relative ODT number, absolute DAQ list number (word, aligned)")]
    RelativeOdtDaqWordAligned = 3,
}

impl IdFieldType {
    /// Bytes the identification field occupies at the start of a DTO
    pub fn byte_len(&self) -> usize {
        match self {
            IdFieldType::AbsoluteOdt => 1,
            IdFieldType::RelativeOdtDaqByte => 2,
            IdFieldType::RelativeOdtDaqWord => 3,
            IdFieldType::RelativeOdtDaqWordAligned => 4,
        }
    }

    /// Where the DAQ list number starts. The aligned layout puts a fill byte after the ODT number
    pub fn daq_offset(&self) -> Option<usize> {
        match self {
            IdFieldType::AbsoluteOdt => None,
            IdFieldType::RelativeOdtDaqByte | IdFieldType::RelativeOdtDaqWord => Some(1),
            IdFieldType::RelativeOdtDaqWordAligned => Some(2),
        }
    }
}

/// Everything negotiated on a flow that changes how later bytes are read
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct XcpSettings {
    pub byte_order: XcpByteOrder,
    pub granularity: AddressGranularity,
    pub max_cto: Option<u8>,
    pub max_dto: Option<u16>,
    pub id_field: IdFieldType,
    /// Bytes of timestamp in front of a timestamped ODT. Zero when the slave has no clock
    pub timestamp_len: usize,
}

impl XcpSettings {
    pub fn from_preferences(preferences: &XcpPreferences) -> Self {
        Self {
            byte_order: preferences.default_byte_order,
            granularity: preferences.default_address_granularity,
            max_cto: None,
            max_dto: None,
            id_field: IdFieldType::default(),
            timestamp_len: 0,
        }
    }
}

/// A command still waiting for its reply
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PendingCommand {
    pub frame: FrameId,
    pub command: XcpCommand,
}

pub struct XcpFlow {
    pub server_port: u16,
    pub settings: XcpSettings,
    pub model: DaqModel,
    pub pids: PidMap,
    pub daq_ptr: Option<DaqPtr>,
    /// The wire has no request id: a reply answers whatever command came last
    pub pending: Option<PendingCommand>,
    streams: HashMap<Direction, StreamReassembler<XcpFraming>>,
}

impl XcpFlow {
    pub fn new(server_port: u16, preferences: &XcpPreferences) -> Self {
        Self {
            server_port,
            settings: XcpSettings::from_preferences(preferences),
            model: DaqModel::default(),
            pids: PidMap::default(),
            daq_ptr: None,
            pending: None,
            streams: HashMap::new(),
        }
    }

    pub fn stream(
        &mut self,
        direction: Direction,
        max_packet_len: usize,
    ) -> &mut StreamReassembler<XcpFraming> {
        self.streams
            .entry(direction)
            .or_insert_with(|| StreamReassembler::new(XcpFraming::new(max_packet_len)))
    }

    /// Finds the ODT a DTO refers to, by PID or by explicit DAQ/ODT numbers
    pub fn resolve_dto(&self, odt_ref: DtoId) -> Option<ResolvedOdt> {
        let odt_ref = match odt_ref {
            DtoId::Pid(pid) => self.pids.resolve(&self.model, pid)?,
            DtoId::Relative(odt_ref) => odt_ref,
        };
        self.model.resolve(odt_ref, self.settings.granularity)
    }
}

/// How a DTO identified its ODT
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DtoId {
    Pid(u8),
    Relative(OdtRef),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry(size: u8) -> OdtEntry {
        OdtEntry {
            address_extension: 0,
            address: 0x1000,
            size,
            bit_offset: 0xFF,
            name: None,
        }
    }

    #[test]
    fn allocation_then_resolution() {
        let mut model = DaqModel::default();
        model.alloc_daq(1);
        model.alloc_odt(0, 1).unwrap();
        model.alloc_odt_entry(0, 0, 1).unwrap();
        model
            .write_daq(
                DaqPtr {
                    daq: 0,
                    odt: 0,
                    entry: 0,
                },
                entry(2),
            )
            .unwrap();

        let mut pids = PidMap::default();
        assert_eq!(pids.bind(&model, 0, 0x10).unwrap(), 1);
        let odt_ref = pids.resolve(&model, 0x10).unwrap();
        assert_eq!(odt_ref, OdtRef { daq: 0, odt: 0 });
        assert_eq!(pids.resolve(&model, 0x11), None);

        let resolved = model.resolve(odt_ref, AddressGranularity::Word).unwrap();
        assert_eq!(resolved.payload_len(), 4);
        assert_eq!(resolved.entries[0].address, 0x1000);
    }

    #[test]
    fn writes_beyond_capacity_are_refused() {
        let mut model = DaqModel::default();
        model.alloc_daq(1);
        assert!(matches!(
            model.alloc_odt(1, 1),
            Err(DissectError::CapacityExceeded {
                what: "DAQ list",
                index: 1,
                capacity: 1
            })
        ));
        model.alloc_odt(0, 2).unwrap();
        assert!(matches!(
            model.write_daq(
                DaqPtr {
                    daq: 0,
                    odt: 1,
                    entry: 0
                },
                entry(1)
            ),
            Err(DissectError::NotAllocated(_))
        ));
        model.alloc_odt_entry(0, 1, 1).unwrap();
        assert!(matches!(
            model.write_daq(
                DaqPtr {
                    daq: 0,
                    odt: 1,
                    entry: 1
                },
                entry(1)
            ),
            Err(DissectError::CapacityExceeded {
                what: "ODT entry",
                ..
            })
        ));
        assert!(model.alloc_odt(0, 4).is_err());
        assert_eq!(model.daq(0).unwrap().odt_capacity(), 2);
    }

    #[test]
    fn freed_configuration_invalidates_pids_lazily() {
        let mut model = DaqModel::default();
        model.alloc_daq(1);
        model.alloc_odt(0, 2).unwrap();
        let mut pids = PidMap::default();
        pids.bind(&model, 0, 0x20).unwrap();
        assert!(pids.resolve(&model, 0x21).is_some());

        model.free_daq();
        assert_eq!(pids.resolve(&model, 0x21), None);

        // same shape again, but the old binding is from an older generation
        model.alloc_daq(1);
        model.alloc_odt(0, 2).unwrap();
        assert_eq!(pids.resolve(&model, 0x20), None);
    }

    #[test]
    fn zero_count_allocation_disables() {
        let mut model = DaqModel::default();
        model.alloc_daq(0);
        assert_eq!(model.daq_count(), 0);
        let mut pids = PidMap::default();
        assert!(pids.bind(&model, 0, 0).is_err());
    }

    #[test]
    fn pid_overflow_is_refused() {
        let mut model = DaqModel::default();
        model.alloc_daq(1);
        model.alloc_odt(0, 4).unwrap();
        let mut pids = PidMap::default();
        assert!(matches!(
            pids.bind(&model, 0, MAX_DAQ_PID - 1),
            Err(DissectError::CapacityExceeded { what: "PID", .. })
        ));
        // a refused start leaves no PID of the list bound
        assert_eq!(pids.resolve(&model, MAX_DAQ_PID - 1), None);
        assert_eq!(pids.resolve(&model, MAX_DAQ_PID), None);
    }

    #[derive(Debug, Clone)]
    enum Op {
        AllocDaq(u16),
        AllocOdt(u16, u8),
        AllocOdtEntry(u16, u8, u8),
        WriteDaq(u16, u8, u8, u8),
        FreeDaq,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u16..4).prop_map(Op::AllocDaq),
            (0u16..5, 0u8..5).prop_map(|(d, c)| Op::AllocOdt(d, c)),
            (0u16..5, 0u8..5, 0u8..5).prop_map(|(d, o, c)| Op::AllocOdtEntry(d, o, c)),
            (0u16..5, 0u8..5, 0u8..5, 0u8..8).prop_map(|(d, o, e, s)| Op::WriteDaq(d, o, e, s)),
            Just(Op::FreeDaq),
        ]
    }

    proptest! {
        #[test]
        fn resolved_length_matches_configured_entries(
            ops in prop::collection::vec(op(), 0..40),
            granularity in prop_oneof![
                Just(AddressGranularity::Byte),
                Just(AddressGranularity::Word),
                Just(AddressGranularity::DWord)
            ],
        ) {
            let mut model = DaqModel::default();
            // shadow bookkeeping: the size last written to every (daq, odt, entry)
            let mut written: HashMap<(u16, u8, u8), u8> = HashMap::new();

            for op in ops {
                match op {
                    Op::AllocDaq(count) => {
                        model.alloc_daq(count);
                        written.clear();
                    }
                    Op::FreeDaq => {
                        model.free_daq();
                        written.clear();
                    }
                    Op::AllocOdt(daq, count) => {
                        let _ = model.alloc_odt(daq, count);
                    }
                    Op::AllocOdtEntry(daq, odt, count) => {
                        let _ = model.alloc_odt_entry(daq, odt, count);
                    }
                    Op::WriteDaq(daq, odt, entry_idx, size) => {
                        let at = DaqPtr { daq, odt, entry: entry_idx };
                        if model.write_daq(at, entry(size)).is_ok() {
                            let _ = written.insert((daq, odt, entry_idx), size);
                        }
                    }
                }
            }

            for daq in 0..model.daq_count() as u16 {
                let list = model.daq(daq).unwrap();
                for odt in 0..list.odt_capacity() as u8 {
                    let odt_ref = OdtRef { daq, odt };
                    let resolved = model.resolve(odt_ref, granularity).unwrap();
                    let expected: usize = written
                        .iter()
                        .filter(|((d, o, _), _)| *d == daq && *o == odt)
                        .map(|(_, size)| *size as usize * granularity.bytes())
                        .sum();
                    prop_assert_eq!(resolved.payload_len(), expected);
                    prop_assert!(resolved.entries.len() <= list.odt(odt as usize).unwrap().capacity());
                }
            }
        }
    }
}
