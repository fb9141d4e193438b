//! Tools for cutting transport payloads into protocol data units. Datagrams are framed in one
//! shot; byte streams are buffered until a whole PDU is available
#![forbid(unsafe_code)]

pub mod checksum;
pub mod datagram;
pub mod error;
pub mod pdu;
pub mod stream;

pub use datagram::{frame_datagram, DatagramReport};
pub use error::FramingError;
pub use pdu::{checked_pdu_len, DynPduFormat, Pdu, PduFormat};
pub use stream::{PduCodec, StreamReassembler, StreamReport};
