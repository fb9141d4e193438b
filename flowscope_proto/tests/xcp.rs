mod common;

use common::*;
use flowscope_proto::prelude::*;
use rstest::rstest;

fn master() -> String {
    endpoint(CLIENT, 50000)
}

fn slave() -> String {
    endpoint(SERVER, 5555)
}

/// Wraps XCP packets in the Ethernet `[len][ctr]` header, one after another
fn datagram(packets: &[&[u8]]) -> Vec<u8> {
    let mut ret = Vec::new();
    for (ctr, packet) in packets.iter().enumerate() {
        ret.extend_from_slice(&(packet.len() as u16).to_le_bytes());
        ret.extend_from_slice(&(ctr as u16).to_le_bytes());
        ret.extend_from_slice(packet);
    }
    ret
}

fn command(session: &mut AnalysisSession, capture: &mut Capture, packet: &[u8], response: &[u8]) -> Dissection {
    let _ = capture.udp(session, &master(), &slave(), &datagram(&[packet]));
    capture.udp(session, &slave(), &master(), &datagram(&[response]))
}

/// CONNECT and a single DAQ list with one ODT holding one two-byte entry at 0x1000
fn configure_one_entry(session: &mut AnalysisSession, capture: &mut Capture) {
    let connected = command(
        session,
        capture,
        &[0xFF, 0x00],
        &[0xFF, 0x00, 0x00, 0x08, 0x00, 0x01, 0x01, 0x01],
    );
    assert_eq!(connected.field("xcp.max_cto"), Some(&FieldValue::U8(8)));
    assert_eq!(connected.field("xcp.response_to"), Some(&FieldValue::Frame(FrameId(1))));

    let _ = command(session, capture, &[0xD5, 0x00, 0x01, 0x00], &[0xFF]);
    let _ = command(session, capture, &[0xD4, 0x00, 0x00, 0x00, 0x01], &[0xFF]);
    let _ = command(session, capture, &[0xD3, 0x00, 0x00, 0x00, 0x00, 0x01], &[0xFF]);
    let _ = command(session, capture, &[0xE2, 0x00, 0x00, 0x00, 0x00, 0x00], &[0xFF]);
    let written = command(
        session,
        capture,
        &[0xE1, 0xFF, 0x02, 0x00, 0x00, 0x10, 0x00, 0x00],
        &[0xFF],
    );
    assert!(written.experts().is_empty(), "{:?}", written.experts());
}

#[test]
fn daq_packet_is_laid_out_from_the_configured_odt() {
    let mut session = session();
    let mut capture = Capture::default();
    configure_one_entry(&mut session, &mut capture);

    let started = command(&mut session, &mut capture, &[0xDE, 0x01, 0x00, 0x00], &[0xFF, 0x10]);
    assert_eq!(started.field("xcp.first_pid"), Some(&FieldValue::U8(0x10)));

    let daq = capture.udp(&mut session, &slave(), &master(), &datagram(&[&[0x10, 0xAA, 0xBB]]));
    assert_eq!(daq.field("xcp.pid"), Some(&FieldValue::U8(0x10)));
    assert_eq!(daq.field("xcp.odt_entry"), Some(&FieldValue::U16(0xBBAA)));
    assert!(daq.texts().iter().any(|text| text.contains("0x00001000")));
    assert!(!daq.has_expert(ExpertGroup::Undecoded));

    capture.assert_reverse_replay_matches(&mut session);
}

#[rstest]
#[case::refused(&[0xFE, 0x22])]
#[case::unanswered_start(&[])]
fn daq_packet_without_a_started_list_stays_raw(#[case] response: &[u8]) {
    let mut session = session();
    let mut capture = Capture::default();
    configure_one_entry(&mut session, &mut capture);

    let _ = capture.udp(&mut session, &master(), &slave(), &datagram(&[&[0xDE, 0x01, 0x00, 0x00]]));
    if !response.is_empty() {
        let refusal = capture.udp(&mut session, &slave(), &master(), &datagram(&[response]));
        assert_eq!(refusal.field("xcp.error"), Some(&FieldValue::U8(0x22)));
    }

    let daq = capture.udp(&mut session, &slave(), &master(), &datagram(&[&[0x10, 0xAA, 0xBB]]));
    assert!(daq.has_expert(ExpertGroup::Undecoded));
    assert!(daq.field("xcp.odt_entry").is_none());
}

#[test]
fn configured_address_names_label_entries() {
    flowscope_logging::setup_log();
    let mut config = AnalysisConfig::default();
    config.xcp.address_names.push(AddressName {
        address_extension: 0,
        address: 0x1000,
        name: "engine_speed".to_string(),
    });
    let mut session = AnalysisSession::new(config);
    let mut capture = Capture::default();
    configure_one_entry(&mut session, &mut capture);
    let _ = command(&mut session, &mut capture, &[0xDE, 0x01, 0x00, 0x00], &[0xFF, 0x10]);

    let daq = capture.udp(&mut session, &slave(), &master(), &datagram(&[&[0x10, 0x01, 0x00]]));
    assert_eq!(daq.field("xcp.odt_entry"), Some(&FieldValue::U16(1)));
    assert!(daq.texts().iter().any(|text| text.contains("engine_speed")));
}

#[test]
fn several_packets_in_one_datagram() {
    let mut session = session();
    let mut capture = Capture::default();
    let dissection = capture.udp(
        &mut session,
        &master(),
        &slave(),
        &datagram(&[&[0xFF, 0x00], &[0xFD]]),
    );
    assert_eq!(dissection.children.len(), 2);
    assert_eq!(
        dissection.fields("xcp.command"),
        vec![&FieldValue::U8(0xFF), &FieldValue::U8(0xFD)]
    );
    assert_eq!(dissection.fields("xcp.ctr"), vec![&FieldValue::U16(0), &FieldValue::U16(1)]);
}

#[test]
fn length_beyond_the_datagram_is_malformed() {
    let mut session = session();
    let mut capture = Capture::default();
    let dissection = capture.udp(&mut session, &master(), &slave(), &[0xFF, 0xFF, 0x00, 0x00, 0xFF]);
    assert_eq!(dissection.protocol, ProtocolId::Xcp);
    assert!(dissection.has_expert(ExpertGroup::Malformed));
    assert!(dissection.children.is_empty());
}

#[test]
fn packets_split_across_tcp_segments_are_reassembled() {
    let mut session = session();
    let mut capture = Capture::default();
    let connect = datagram(&[&[0xFF, 0x00]]);
    let (head, tail) = connect.split_at(3);

    let first = capture.tcp(&mut session, &master(), &slave(), head);
    assert!(first.field("xcp.command").is_none());
    assert!(first.texts().iter().any(|text| text.contains("held for the next segment")));

    let second = capture.tcp(&mut session, &master(), &slave(), tail);
    assert_eq!(second.field("xcp.command"), Some(&FieldValue::U8(0xFF)));

    capture.assert_replay_matches(&mut session, &[1, 0]);
}
