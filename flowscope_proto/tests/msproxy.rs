mod common;

use common::*;
use flowscope_proto::prelude::*;

fn client() -> String {
    endpoint(CLIENT, 1029)
}

fn proxy() -> String {
    endpoint(SERVER, 1745)
}

fn message(command: u16, payload: &[u8]) -> Vec<u8> {
    let mut ret = vec![0u8; 38];
    ret[0..4].copy_from_slice(&0x0A0B0C0Du32.to_le_bytes());
    ret[24..28].copy_from_slice(b"RWSP");
    ret[36..38].copy_from_slice(&command.to_be_bytes());
    ret.extend_from_slice(payload);
    ret
}

/// `[pad:20][port:2 BE][addr:4]`
fn endpoint_payload(port: u16, addr: [u8; 4]) -> Vec<u8> {
    let mut ret = vec![0u8; 20];
    ret.extend_from_slice(&port.to_be_bytes());
    ret.extend_from_slice(&addr);
    ret
}

#[test]
fn connect_grant_redirects_the_data_connection() {
    let mut session = session();
    let mut capture = Capture::default();

    let request = capture.udp(
        &mut session,
        &client(),
        &proxy(),
        &message(0x071E, &endpoint_payload(80, [93, 184, 216, 34])),
    );
    assert_eq!(request.field("msproxy.dst_port"), Some(&FieldValue::U16(80)));
    assert_eq!(request.field("msproxy.client_id"), Some(&FieldValue::U32(0x0A0B0C0D)));

    let grant = capture.udp(
        &mut session,
        &proxy(),
        &client(),
        &message(0x0703, &endpoint_payload(4000, [10, 0, 0, 2])),
    );
    assert_eq!(grant.field("msproxy.request_frame"), Some(&FieldValue::Frame(FrameId(1))));
    assert!(grant.experts().is_empty());
    let after_grant = session.conversations().len();
    assert_eq!(after_grant, 2);

    let data = capture.tcp(
        &mut session,
        &endpoint(CLIENT, 3333),
        &endpoint(SERVER, 4000),
        b"GET / HTTP/1.0\r\n\r\n",
    );
    assert_eq!(data.protocol_stack(), vec![ProtocolId::MsProxyData, ProtocolId::Data]);
    assert_eq!(data.field("msproxy.remote_port"), Some(&FieldValue::U16(80)));
    assert_eq!(data.field("msproxy.grant_frame"), Some(&FieldValue::Frame(FrameId(2))));

    capture.assert_reverse_replay_matches(&mut session);
    assert_eq!(session.conversations().len(), after_grant);
}

#[test]
fn grant_without_a_request_does_not_rewire() {
    let mut session = session();
    let mut capture = Capture::default();

    let grant = capture.udp(
        &mut session,
        &proxy(),
        &client(),
        &message(0x0703, &endpoint_payload(4000, [10, 0, 0, 2])),
    );
    assert!(grant.has_expert(ExpertGroup::Sequence));
    assert_eq!(session.conversations().len(), 1);
}

#[test]
fn tcp_request_is_not_matched_by_a_udp_grant() {
    let mut session = session();
    let mut capture = Capture::default();

    let _ = capture.udp(
        &mut session,
        &client(),
        &proxy(),
        &message(0x071E, &endpoint_payload(80, [93, 184, 216, 34])),
    );
    let grant = capture.udp(
        &mut session,
        &proxy(),
        &client(),
        &message(0x0706, &endpoint_payload(4000, [10, 0, 0, 2])),
    );
    assert!(grant.has_expert(ExpertGroup::Sequence));
    assert_eq!(session.conversations().len(), 1);
}

#[test]
fn missing_magic_is_flagged() {
    let mut session = session();
    let mut capture = Capture::default();
    let mut bytes = message(0x0500, &[]);
    bytes[24..28].copy_from_slice(b"XXXX");

    let hello = capture.udp(&mut session, &client(), &proxy(), &bytes);
    assert!(hello.has_expert(ExpertGroup::Malformed));
    assert!(hello.info_line().contains("HELLO"));
}
