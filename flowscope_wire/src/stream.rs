//! Stream reassembly. A byte stream may split a PDU over several arrivals or pack several PDUs
//! into one; [`PduCodec`] cuts them back out using the same [`PduFormat`] the datagram path uses.

use crate::error::FramingError;
use crate::pdu::{checked_pdu_len, PduFormat};
use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;

/// A length-driven decoder over any [`PduFormat`]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct PduCodec<F> {
    format: F,
}

impl<F: PduFormat> PduCodec<F> {
    pub fn new(format: F) -> Self {
        Self { format }
    }

    pub fn format(&self) -> &F {
        &self.format
    }
}

impl<F: PduFormat> Decoder for PduCodec<F> {
    type Item = BytesMut;
    type Error = FramingError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<BytesMut>, FramingError> {
        if buf.len() < self.format.fixed_header_len() {
            return Ok(None);
        }

        let len = checked_pdu_len(&self.format, buf)?;
        if buf.len() < len {
            buf.reserve(len - buf.len());
            return Ok(None);
        }

        Ok(Some(buf.split_to(len)))
    }
}

/// What happened to one arrival pushed into a [`StreamReassembler`]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamReport {
    pub delivered: usize,
    /// Bytes held back for the next arrival
    pub buffered: usize,
    /// Bytes thrown away after a framing error
    pub discarded: usize,
    pub error: Option<FramingError>,
}

/// Buffers one direction of a byte stream and delivers complete PDUs as they become available
#[derive(Debug)]
pub struct StreamReassembler<F> {
    codec: PduCodec<F>,
    buffer: BytesMut,
}

impl<F: PduFormat> StreamReassembler<F> {
    pub fn new(format: F) -> Self {
        Self {
            codec: PduCodec::new(format),
            buffer: BytesMut::new(),
        }
    }

    /// Appends `chunk` and hands every PDU completed by it to `handler`.
    ///
    /// A byte stream cannot be resynchronised after a bad header, so on a framing error the
    /// buffered bytes are discarded and the error is reported. Later arrivals start afresh
    pub fn push<H: FnMut(Bytes)>(&mut self, chunk: &[u8], mut handler: H) -> StreamReport {
        let mut report = StreamReport::default();
        self.buffer.extend_from_slice(chunk);

        loop {
            match self.codec.decode(&mut self.buffer) {
                Ok(Some(pdu)) => {
                    log::debug!(target: "flowscope", "Reassembled PDU of {} bytes", pdu.len());
                    handler(pdu.freeze());
                    report.delivered += 1;
                }

                Ok(None) => break,

                Err(err) => {
                    log::warn!(target: "flowscope", "Discarding {} buffered stream bytes: {err}", self.buffer.len());
                    report.discarded = self.buffer.len();
                    self.buffer.clear();
                    report.error = Some(err);
                    break;
                }
            }
        }

        report.buffered = self.buffer.len();
        report
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
