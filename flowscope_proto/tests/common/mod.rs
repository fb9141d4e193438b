//! Shared helpers for the session-level tests: packet metadata builders and a capture that can
//! be analysed once and replayed.

#![allow(dead_code)]

use flowscope_proto::prelude::*;

pub const CLIENT: &str = "10.0.0.1";
pub const SERVER: &str = "10.0.0.2";

pub fn session() -> AnalysisSession {
    flowscope_logging::setup_log();
    AnalysisSession::new(AnalysisConfig::default())
}

pub fn packet(frame: u32, transport: TransportKind, src: &str, dst: &str) -> PacketInfo {
    PacketInfo::new(
        frame,
        transport,
        src.parse().expect("source address"),
        dst.parse().expect("destination address"),
    )
}

pub fn tcp(frame: u32, src: &str, dst: &str) -> PacketInfo {
    packet(frame, TransportKind::Tcp, src, dst)
}

pub fn udp(frame: u32, src: &str, dst: &str) -> PacketInfo {
    packet(frame, TransportKind::Udp, src, dst)
}

/// Frames fed through a session in capture order, kept so they can be replayed afterwards
#[derive(Default)]
pub struct Capture {
    packets: Vec<(PacketInfo, Vec<u8>)>,
    first_pass: Vec<Dissection>,
}

impl Capture {
    /// Analyses the next frame. Frame numbers are assigned in order starting at 1
    pub fn push(
        &mut self,
        session: &mut AnalysisSession,
        transport: TransportKind,
        src: &str,
        dst: &str,
        bytes: &[u8],
    ) -> Dissection {
        let frame = self.packets.len() as u32 + 1;
        let info = packet(frame, transport, src, dst);
        self.push_info(session, info, bytes)
    }

    pub fn push_info(
        &mut self,
        session: &mut AnalysisSession,
        info: PacketInfo,
        bytes: &[u8],
    ) -> Dissection {
        let dissection = session.dissect_packet(info, bytes);
        self.packets.push((info, bytes.to_vec()));
        self.first_pass.push(dissection.clone());
        dissection
    }

    pub fn tcp(&mut self, session: &mut AnalysisSession, src: &str, dst: &str, bytes: &[u8]) -> Dissection {
        self.push(session, TransportKind::Tcp, src, dst, bytes)
    }

    pub fn udp(&mut self, session: &mut AnalysisSession, src: &str, dst: &str, bytes: &[u8]) -> Dissection {
        self.push(session, TransportKind::Udp, src, dst, bytes)
    }

    pub fn next_frame(&self) -> u32 {
        self.packets.len() as u32 + 1
    }

    /// Replays every frame in the given order and checks the output against the first pass
    pub fn assert_replay_matches(&self, session: &mut AnalysisSession, order: &[usize]) {
        for &index in order {
            let (info, bytes) = &self.packets[index];
            let replayed = session.replay(*info, bytes);
            assert_eq!(
                replayed, self.first_pass[index],
                "frame {} rendered differently on replay",
                info.frame
            );
        }
    }

    /// Replays every frame in reverse capture order
    pub fn assert_reverse_replay_matches(&self, session: &mut AnalysisSession) {
        let order: Vec<usize> = (0..self.packets.len()).rev().collect();
        self.assert_replay_matches(session, &order);
    }
}

pub fn endpoint(ip: &str, port: u16) -> String {
    format!("{ip}:{port}")
}
