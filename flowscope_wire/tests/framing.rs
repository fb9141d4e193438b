use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use flowscope_wire::{frame_datagram, DynPduFormat, FramingError, StreamReassembler};
use proptest::prelude::*;
use rstest::rstest;

/// `[len:2 LE][counter:2 LE][payload]` where `len` counts the payload only
fn xcp_like() -> DynPduFormat {
    DynPduFormat::new(4, |header| LittleEndian::read_u16(header) as usize + 4)
        .with_max_pdu_len(4 + 255)
        .with_multiple_per_datagram(true)
}

fn encode(payloads: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for (counter, payload) in payloads.iter().enumerate() {
        let mut header = [0u8; 4];
        LittleEndian::write_u16(&mut header[..2], payload.len() as u16);
        LittleEndian::write_u16(&mut header[2..], counter as u16);
        out.extend_from_slice(&header);
        out.extend_from_slice(payload);
    }
    out
}

fn reassemble(stream: &[u8], cuts: &[usize]) -> Vec<Bytes> {
    let mut reassembler = StreamReassembler::new(xcp_like());
    let mut pdus = Vec::new();
    let mut start = 0;
    for &cut in cuts.iter().chain(std::iter::once(&stream.len())) {
        let cut = cut.clamp(start, stream.len());
        let report = reassembler.push(&stream[start..cut], |pdu| pdus.push(pdu));
        assert!(report.error.is_none());
        start = cut;
    }
    assert_eq!(reassembler.buffered(), 0);
    pdus
}

proptest! {
    #[test]
    fn chunk_boundaries_do_not_change_delivered_pdus(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..40), 1..8),
        mut cuts in prop::collection::vec(0usize..400, 0..12),
    ) {
        let stream = encode(&payloads);
        cuts.sort_unstable();

        let whole = reassemble(&stream, &[]);
        let chunked = reassemble(&stream, &cuts);

        prop_assert_eq!(whole.len(), payloads.len());
        prop_assert_eq!(whole, chunked);
    }
}

#[rstest]
#[case(vec![2, 0, 0, 0, 0xAA, 0xBB], 1, None)]
#[case(vec![1, 0, 0, 0, 0xAA, 0, 0, 1, 0], 2, None)]
#[case(vec![1, 0, 0, 0, 0xAA, 0xEE, 0xEE], 1, Some(5..7))]
fn datagram_framing(
    #[case] datagram: Vec<u8>,
    #[case] expected_pdus: usize,
    #[case] trailing: Option<std::ops::Range<usize>>,
) {
    flowscope_logging::setup_log();
    let report = frame_datagram(&datagram, &xcp_like(), |_| {});
    assert_eq!(report.delivered, expected_pdus);
    assert_eq!(report.trailing, trailing);
    assert!(report.error.is_none());
}

#[rstest]
#[case(vec![0x10, 0, 0], FramingError::HeaderTooShort { needed: 4, available: 3 })]
#[case(vec![0x10, 0, 0, 0, 1, 2], FramingError::Truncated { declared: 20, available: 6 })]
fn malformed_datagrams_are_reported(#[case] datagram: Vec<u8>, #[case] expected: FramingError) {
    flowscope_logging::setup_log();
    let mut delivered = 0;
    let report = frame_datagram(&datagram, &xcp_like(), |_| delivered += 1);
    assert_eq!(delivered, 0);
    assert_eq!(report.error, Some(expected));
    assert_eq!(report.consumed, 0);
}

#[test]
fn declared_length_beyond_maximum_is_implausible() {
    flowscope_logging::setup_log();
    let format = DynPduFormat::new(2, |h| LittleEndian::read_u16(h) as usize).with_max_pdu_len(64);
    let report = frame_datagram(&[0xFF, 0x00, 0, 0], &format, |_| {});
    assert!(matches!(
        report.error,
        Some(FramingError::ImplausibleLength { declared: 255, .. })
    ));
}
