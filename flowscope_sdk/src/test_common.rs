#![allow(missing_docs, dead_code)]
#![doc(hidden)]
use crate::prelude::*;
use std::net::SocketAddr;

/// Hands out packet metadata for one client/server pair with increasing frame numbers
pub struct FlowBuilder {
    transport: TransportKind,
    client: SocketAddr,
    server: SocketAddr,
    next_frame: u32,
    clock_ns: i64,
    step_ns: i64,
}

impl FlowBuilder {
    pub fn new(transport: TransportKind, client: &str, server: &str) -> Self {
        Self {
            transport,
            client: client.parse().expect("client address"),
            server: server.parse().expect("server address"),
            next_frame: 1,
            clock_ns: 0,
            step_ns: 1_000_000,
        }
    }

    pub fn tcp(client: &str, server: &str) -> Self {
        Self::new(TransportKind::Tcp, client, server)
    }

    pub fn udp(client: &str, server: &str) -> Self {
        Self::new(TransportKind::Udp, client, server)
    }

    /// Continues frame numbering from another flow, for captures that interleave flows
    pub fn starting_at(mut self, frame: u32) -> Self {
        self.next_frame = frame;
        self
    }

    pub fn to_server(&mut self) -> PacketInfo {
        let (src, dst) = (self.client, self.server);
        self.next(src, dst)
    }

    pub fn to_client(&mut self) -> PacketInfo {
        let (src, dst) = (self.server, self.client);
        self.next(src, dst)
    }

    pub fn next_frame(&self) -> u32 {
        self.next_frame
    }

    fn next(&mut self, src: SocketAddr, dst: SocketAddr) -> PacketInfo {
        let info = PacketInfo::new(self.next_frame, self.transport, src, dst)
            .with_timestamp_ns(self.clock_ns);
        self.next_frame += 1;
        self.clock_ns += self.step_ns;
        info
    }
}

/// Parses whitespace-separated hex, e.g. `"05 01 00"`
pub fn hex(input: &str) -> Vec<u8> {
    input
        .split_whitespace()
        .map(|byte| u8::from_str_radix(byte, 16).expect("hex byte"))
        .collect()
}

/// Feeds `packets` through `session` in order and returns every dissection
pub fn analyse(session: &mut AnalysisSession, packets: &[(PacketInfo, Vec<u8>)]) -> Vec<Dissection> {
    packets
        .iter()
        .map(|(info, bytes)| session.dissect_packet(*info, bytes))
        .collect()
}

/// Replays `packets` in reverse and asserts each rendering matches `first_pass`
pub fn assert_reverse_replay(
    session: &mut AnalysisSession,
    packets: &[(PacketInfo, Vec<u8>)],
    first_pass: &[Dissection],
) {
    for (index, (info, bytes)) in packets.iter().enumerate().rev() {
        assert_eq!(
            session.replay(*info, bytes),
            first_pass[index],
            "frame {} rendered differently on replay",
            info.frame
        );
    }
}
