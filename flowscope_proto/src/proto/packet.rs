//! Per-packet context handed to every dissector, and a bounds-checked reader over the bytes it
//! is asked to decode.

use crate::error::DissectError;
use crate::proto::conversation::ConversationId;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use flowscope_types::prelude::{Direction, FrameId, PacketInfo, XcpByteOrder};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Whether this is the first time the session sees a frame
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Pass {
    /// Forward, capture-order analysis. State machines run and snapshots are written
    First,
    /// Any later look at the same frame. Only snapshots are read
    Replay,
}

#[derive(Debug, Clone)]
pub struct PacketContext {
    pub info: PacketInfo,
    pub pass: Pass,
    /// The conversation the outermost packet resolved to
    pub conversation: ConversationId,
    /// The port through which the dispatch table selected the current dissector
    pub matched_port: Option<u16>,
    /// Set by tunnelling dissectors, which know the direction better than the outer ports do
    pub direction_hint: Option<Direction>,
    /// Nesting level of the current dissector. The outermost one runs at depth 1
    pub depth: usize,
}

impl PacketContext {
    pub fn new(info: PacketInfo, pass: Pass, conversation: ConversationId) -> Self {
        Self {
            info,
            pass,
            conversation,
            matched_port: None,
            direction_hint: None,
            depth: 0,
        }
    }

    pub fn frame(&self) -> FrameId {
        self.info.frame
    }

    pub fn is_first_pass(&self) -> bool {
        self.pass == Pass::First
    }

    /// The direction relative to a flow whose server listens on `server_port`
    pub fn direction(&self, server_port: u16) -> Direction {
        self.direction_hint
            .unwrap_or_else(|| Direction::from_ports(self.info.dst_port(), server_port))
    }

    /// The port the dispatcher matched, or else the destination port
    pub fn server_port_guess(&self) -> u16 {
        self.matched_port.unwrap_or_else(|| self.info.dst_port())
    }
}

/// Bounds-checked reads over a borrowed buffer. Every read names the offset it failed at
#[derive(Debug, Copy, Clone)]
pub struct ByteView<'a> {
    bytes: &'a [u8],
}

impl<'a> ByteView<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn ensure(&self, offset: usize, needed: usize) -> Result<(), DissectError> {
        match offset.checked_add(needed) {
            Some(end) if end <= self.bytes.len() => Ok(()),
            _ => Err(DissectError::Truncated {
                offset,
                needed,
                available: self.bytes.len().saturating_sub(offset),
            }),
        }
    }

    pub fn slice(&self, offset: usize, len: usize) -> Result<&'a [u8], DissectError> {
        self.ensure(offset, len)?;
        Ok(&self.bytes[offset..offset + len])
    }

    /// Everything from `offset` on. Empty when `offset` is past the end
    pub fn rest(&self, offset: usize) -> &'a [u8] {
        self.bytes.get(offset..).unwrap_or_default()
    }

    pub fn u8(&self, offset: usize) -> Result<u8, DissectError> {
        Ok(self.slice(offset, 1)?[0])
    }

    pub fn u16<B: ByteOrder>(&self, offset: usize) -> Result<u16, DissectError> {
        Ok(B::read_u16(self.slice(offset, 2)?))
    }

    pub fn u32<B: ByteOrder>(&self, offset: usize) -> Result<u32, DissectError> {
        Ok(B::read_u32(self.slice(offset, 4)?))
    }

    pub fn u16_be(&self, offset: usize) -> Result<u16, DissectError> {
        self.u16::<BigEndian>(offset)
    }

    pub fn u16_le(&self, offset: usize) -> Result<u16, DissectError> {
        self.u16::<LittleEndian>(offset)
    }

    pub fn u32_be(&self, offset: usize) -> Result<u32, DissectError> {
        self.u32::<BigEndian>(offset)
    }

    pub fn u32_le(&self, offset: usize) -> Result<u32, DissectError> {
        self.u32::<LittleEndian>(offset)
    }

    /// Reads using the byte order an XCP slave announced
    pub fn u16_xcp(&self, offset: usize, order: XcpByteOrder) -> Result<u16, DissectError> {
        match order {
            XcpByteOrder::Intel => self.u16_le(offset),
            XcpByteOrder::Motorola => self.u16_be(offset),
        }
    }

    pub fn u32_xcp(&self, offset: usize, order: XcpByteOrder) -> Result<u32, DissectError> {
        match order {
            XcpByteOrder::Intel => self.u32_le(offset),
            XcpByteOrder::Motorola => self.u32_be(offset),
        }
    }

    pub fn ipv4(&self, offset: usize) -> Result<Ipv4Addr, DissectError> {
        let raw: [u8; 4] = self
            .slice(offset, 4)?
            .try_into()
            .map_err(|_| DissectError::InvalidPacket("Bad IPv4 address"))?;
        Ok(Ipv4Addr::from(raw))
    }

    pub fn ipv6(&self, offset: usize) -> Result<Ipv6Addr, DissectError> {
        let raw: [u8; 16] = self
            .slice(offset, 16)?
            .try_into()
            .map_err(|_| DissectError::InvalidPacket("Bad IPv6 address"))?;
        Ok(Ipv6Addr::from(raw))
    }

    pub fn mac(&self, offset: usize) -> Result<[u8; 6], DissectError> {
        self.slice(offset, 6)?
            .try_into()
            .map_err(|_| DissectError::InvalidPacket("Bad MAC address"))
    }

    /// A NUL-terminated string starting at `offset`. Returns the text and the number of bytes
    /// it occupied including the terminator
    pub fn cstring(&self, offset: usize) -> Result<(String, usize), DissectError> {
        let tail = self.rest(offset);
        let end = tail
            .iter()
            .position(|b| *b == 0)
            .ok_or(DissectError::Truncated {
                offset,
                needed: tail.len() + 1,
                available: tail.len(),
            })?;
        Ok((String::from_utf8_lossy(&tail[..end]).into_owned(), end + 1))
    }

    /// `len` bytes of text, decoded lossily
    pub fn text(&self, offset: usize, len: usize) -> Result<String, DissectError> {
        Ok(String::from_utf8_lossy(self.slice(offset, len)?).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_are_bounds_checked() {
        let view = ByteView::new(&[0x12, 0x34, 0x56]);
        assert_eq!(view.u16_be(0).unwrap(), 0x1234);
        assert_eq!(view.u16_le(1).unwrap(), 0x5634);
        assert!(matches!(
            view.u32_be(1),
            Err(DissectError::Truncated {
                offset: 1,
                needed: 4,
                available: 2
            })
        ));
        assert!(view.rest(7).is_empty());
        assert!(view.ensure(usize::MAX, 2).is_err());
    }

    #[test]
    fn cstring_requires_terminator() {
        let view = ByteView::new(b"alice\0bob");
        assert_eq!(view.cstring(0).unwrap(), ("alice".to_string(), 6));
        assert!(view.cstring(6).is_err());
    }

    #[test]
    fn xcp_byte_order() {
        let view = ByteView::new(&[0x00, 0x10]);
        assert_eq!(view.u16_xcp(0, XcpByteOrder::Intel).unwrap(), 0x1000);
        assert_eq!(view.u16_xcp(0, XcpByteOrder::Motorola).unwrap(), 0x0010);
    }
}
