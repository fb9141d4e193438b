mod common;

use common::*;
use flowscope_proto::prelude::*;

fn client() -> String {
    endpoint(CLIENT, 40000)
}

fn proxy() -> String {
    endpoint(SERVER, 1080)
}

/// Greeting, method selection, request and reply of a v5 handshake without authentication
fn v5_handshake(
    session: &mut AnalysisSession,
    capture: &mut Capture,
    request: &[u8],
    reply: &[u8],
) -> (Dissection, Dissection) {
    let (c, p) = (client(), proxy());
    let greeting = capture.tcp(session, &c, &p, &[5, 1, 0]);
    assert_eq!(greeting.field("socks.method"), Some(&FieldValue::U8(0)));
    let selection = capture.tcp(session, &p, &c, &[5, 0]);
    assert_eq!(selection.field("socks.auth_method"), Some(&FieldValue::U8(0)));
    // no authentication goes straight to the command
    assert_eq!(
        selection.field("socks.client_state"),
        Some(&FieldValue::Str("V5Command".to_string()))
    );

    let request = capture.tcp(session, &c, &p, request);
    let reply = capture.tcp(session, &p, &c, reply);
    (request, reply)
}

#[test]
fn v5_connect_then_tunnelled_payload() {
    let mut session = session();
    let mut capture = Capture::default();
    let (request, reply) = v5_handshake(
        &mut session,
        &mut capture,
        &[5, 1, 0, 1, 93, 184, 216, 34, 0, 80],
        &[5, 0, 0, 1, 10, 0, 0, 2, 0x9C, 0x40],
    );

    assert_eq!(
        request.field("socks.remote"),
        Some(&FieldValue::Str("93.184.216.34:80".to_string()))
    );
    assert_eq!(
        request.field("socks.client_state"),
        Some(&FieldValue::Str("Done".to_string()))
    );
    assert_eq!(
        reply.field("socks.result"),
        Some(&FieldValue::Str("Succeeded".to_string()))
    );
    assert_eq!(
        reply.field("socks.server_state"),
        Some(&FieldValue::Str("Done".to_string()))
    );

    let payload = capture.tcp(&mut session, &client(), &proxy(), b"GET / HTTP/1.0\r\n\r\n");
    assert_eq!(payload.protocol_stack(), vec![ProtocolId::Socks, ProtocolId::Data]);
    assert!(payload.info_line().contains("Tunnelled to remote port 80"));
    assert_eq!(payload.field("data.len"), Some(&FieldValue::U32(18)));
}

#[test]
fn v4_request_and_grant() {
    let mut session = session();
    let mut capture = Capture::default();
    let (c, p) = (client(), proxy());

    let mut request = vec![4, 1, 0, 21, 10, 0, 0, 9];
    request.extend_from_slice(b"bob\0");
    let request = capture.tcp(&mut session, &c, &p, &request);
    assert_eq!(request.field("socks.user"), Some(&FieldValue::Str("bob".to_string())));
    assert_eq!(request.field("socks.dst_port"), Some(&FieldValue::U16(21)));

    let reply = capture.tcp(&mut session, &p, &c, &[0, 90, 0, 0, 0, 0, 0, 0]);
    assert_eq!(
        reply.field("socks.result"),
        Some(&FieldValue::Str("Granted".to_string()))
    );
    assert!(reply.experts().is_empty());
}

#[test]
fn v4_connect_to_loopback() {
    let mut session = session();
    let mut capture = Capture::default();
    let (c, p) = (client(), proxy());

    let request = capture.tcp(&mut session, &c, &p, &[0x04, 0x01, 0x00, 0x50, 0x7F, 0x00, 0x00, 0x01, 0x00]);
    assert_eq!(
        request.field("socks.remote"),
        Some(&FieldValue::Str("127.0.0.1:80".to_string()))
    );
    assert_eq!(
        request.field("socks.client_state"),
        Some(&FieldValue::Str("Done".to_string()))
    );

    let reply = capture.tcp(&mut session, &p, &c, &[0x00, 0x5A, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    assert_eq!(reply.field("socks.reply"), Some(&FieldValue::U8(90)));
    assert_eq!(
        reply.field("socks.result"),
        Some(&FieldValue::Str("Granted".to_string()))
    );
}

#[test]
fn rejected_method_freezes_the_handshake() {
    let mut session = session();
    let mut capture = Capture::default();
    let (c, p) = (client(), proxy());

    let _ = capture.tcp(&mut session, &c, &p, &[5, 1, 2]);
    let refusal = capture.tcp(&mut session, &p, &c, &[5, 0xFF]);
    assert_eq!(
        refusal.field("socks.server_state"),
        Some(&FieldValue::Str("Error".to_string()))
    );
    assert!(refusal.has_expert(ExpertGroup::Sequence));

    // nothing after the refusal is decoded as handshake
    let later = capture.tcp(&mut session, &c, &p, &[5, 1, 0, 1, 10, 0, 0, 9, 0, 80]);
    assert!(later.field("socks.command").is_none());
    assert!(later.field("socks.data").is_some());
}

#[test]
fn replay_renders_identically_in_any_order() {
    let mut session = session();
    let mut capture = Capture::default();
    let _ = v5_handshake(
        &mut session,
        &mut capture,
        &[5, 1, 0, 3, 11, b'e', b'x', b'a', b'm', b'p', b'l', b'e', b'.', b'o', b'r', b'g', 0, 80],
        &[5, 0, 0, 1, 10, 0, 0, 2, 0x9C, 0x40],
    );
    let _ = capture.tcp(&mut session, &client(), &proxy(), b"hello");
    let _ = capture.tcp(&mut session, &proxy(), &client(), b"world");

    let conversations = session.conversations().len();
    let snapshots = session.snapshots().len();
    capture.assert_reverse_replay_matches(&mut session);
    capture.assert_replay_matches(&mut session, &[2, 0, 5, 1, 4, 3]);
    assert_eq!(session.conversations().len(), conversations);
    assert_eq!(session.snapshots().len(), snapshots);
}

#[test]
fn replaying_an_unseen_frame_is_refused() {
    let mut session = session();
    let dissection = session.replay(tcp(7, &client(), &proxy()), &[5, 1, 0]);
    assert_eq!(dissection.max_severity(), Some(Severity::Error));
    assert!(dissection.has_expert(ExpertGroup::Sequence));
    assert!(!session.is_visited(FrameId(7)));
    assert!(session.conversations().is_empty());
}

#[test]
fn socks_inside_socks_on_the_same_flow_is_suppressed() {
    let mut session = session();
    let mut capture = Capture::default();
    // the remote port is itself a SOCKS port
    let _ = v5_handshake(
        &mut session,
        &mut capture,
        &[5, 1, 0, 1, 10, 0, 0, 9, 0x04, 0x38],
        &[5, 0, 0, 1, 10, 0, 0, 2, 0x9C, 0x40],
    );

    let nested = capture.tcp(&mut session, &client(), &proxy(), &[5, 1, 0]);
    assert_eq!(nested.protocol_stack(), vec![ProtocolId::Socks, ProtocolId::Data]);
    assert!(nested
        .experts()
        .iter()
        .any(|(severity, group, message)| *severity == Severity::Warn
            && *group == ExpertGroup::Protocol
            && message.contains("Recursive")));

    // the guard was released on the way out
    assert_eq!(session.guards().depth(), 0);
    let conversation = session
        .conversation_of(FrameId(capture.next_frame() - 1))
        .expect("frame was routed");
    assert!(!session.guards().is_active(conversation, ProtocolId::Socks));

    let ctx = PacketContext::new(
        tcp(capture.next_frame(), &client(), &proxy()),
        Pass::First,
        conversation,
    );
    let unrelated = session.dispatch_payload(&ctx, TransportKind::Udp, 21105, &[4, 0, 0x10, 0]);
    assert_eq!(unrelated.protocol_stack()[0], ProtocolId::Z21);
    assert!(unrelated.experts().is_empty());
}

#[test]
fn udp_associate_spawns_the_relay_conversation_once() {
    let mut session = session();
    let mut capture = Capture::default();
    let _ = v5_handshake(
        &mut session,
        &mut capture,
        &[5, 3, 0, 1, 0, 0, 0, 0, 0, 0],
        // relay at 10.0.0.2:40001
        &[5, 0, 0, 1, 10, 0, 0, 2, 0x9C, 0x41],
    );
    let after_grant = session.conversations().len();
    assert_eq!(after_grant, 2);

    capture.assert_reverse_replay_matches(&mut session);
    assert_eq!(session.conversations().len(), after_grant);

    // X-Bus GET_STATUS relayed to a Z21 command station
    let mut datagram = vec![0, 0, 0, 1, 192, 168, 0, 111, 0x52, 0x71];
    datagram.extend_from_slice(&[7, 0, 0x40, 0, 0x21, 0x24, 0x05]);
    let relayed = capture.udp(
        &mut session,
        &endpoint(CLIENT, 5000),
        &endpoint(SERVER, 40001),
        &datagram,
    );
    let stack = relayed.protocol_stack();
    assert_eq!(&stack[..2], &[ProtocolId::SocksUdp, ProtocolId::Z21]);
    assert_eq!(relayed.field("socks.udp.dst_port"), Some(&FieldValue::U16(21105)));
    assert_eq!(relayed.fields("z21.x.header"), vec![&FieldValue::U8(0x21)]);
}

#[test]
fn bind_routes_the_incoming_connection_as_payload() {
    let mut session = session();
    let mut capture = Capture::default();
    let (request, first_reply) = v5_handshake(
        &mut session,
        &mut capture,
        &[5, 2, 0, 1, 10, 0, 0, 9, 0, 21],
        // listening on 10.0.0.2:40002
        &[5, 0, 0, 1, 10, 0, 0, 2, 0x9C, 0x42],
    );
    assert_eq!(request.field("socks.command"), Some(&FieldValue::U8(2)));
    assert_eq!(
        first_reply.field("socks.server_state"),
        Some(&FieldValue::Str("BindReply".to_string()))
    );
    assert_eq!(session.conversations().len(), 2);

    let incoming = capture.tcp(&mut session, "10.0.0.9:3000", &endpoint(SERVER, 40002), b"220 ready\r\n");
    assert_eq!(incoming.protocol_stack(), vec![ProtocolId::Socks, ProtocolId::Data]);
    assert!(incoming.info_line().contains("Tunnelled to remote port 21"));

    // the second reply completes the control connection
    let second_reply = capture.tcp(&mut session, &proxy(), &client(), &[5, 0, 0, 1, 10, 0, 0, 9, 0x0B, 0xB8]);
    assert_eq!(
        second_reply.field("socks.server_state"),
        Some(&FieldValue::Str("Done".to_string()))
    );
    assert_eq!(session.conversations().len(), 2);
}
