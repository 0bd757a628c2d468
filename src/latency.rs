use std::collections::VecDeque;

use crate::consts::LATENCY_WINDOW;
use crate::packet::Packet;
use crate::protocol::{ProtocolPacket, SendOption};
use crate::time::{self, Timestamp};

/// Round trip, one way latency and clock offset estimation from exchanged timestamps.
///
/// Every latency block carries the sender's own timestamp (stamped at send time), the
/// last timestamp it received from the peer, and how long it held that timestamp before
/// sending (the correction latency), so that processing delay is not counted as network
/// latency.
#[derive(Debug, Default, Clone)]
pub struct LatencyPlanner {
    peer_timestamp: Option<Timestamp>,
    peer_timestamp_received_at: Timestamp,
    samples: VecDeque<u16>,
    latency: Option<u16>,
    round_trip_time: Option<u16>,
    clock_offset: Option<i32>,
}

impl LatencyPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mean one way latency in milliseconds.
    pub fn latency(&self) -> Option<u16> {
        self.latency
    }
    /// Last measured round trip time in milliseconds.
    pub fn round_trip_time(&self) -> Option<u16> {
        self.round_trip_time
    }
    /// Milliseconds to add to local time to get the peer's time.
    pub fn clock_offset(&self) -> Option<i32> {
        self.clock_offset
    }
    /// How long the last peer timestamp has been held, as of `time`.
    pub fn correction_latency(&self, time: f64) -> Option<u16> {
        self.peer_timestamp?;
        Some(time::elapsed(
            time::timestamp(time),
            self.peer_timestamp_received_at,
        ))
    }

    /// Appends a latency block to `packet`. Own timestamp and correction are placeholders
    /// filled in by send options.
    pub fn pack(&self, packet: &mut ProtocolPacket) {
        let own_offset = packet.packet().len();
        packet
            .packet_mut()
            .write(&0u16)
            .write(&self.peer_timestamp.is_some())
            .write(&self.peer_timestamp.unwrap_or(0));
        let correction_offset = packet.packet().len();
        packet.packet_mut().write(&0u16);
        packet.add_option(SendOption::UpdateTimestamp { offset: own_offset });
        packet.add_option(SendOption::UpdateCorrectionLatency {
            offset: correction_offset,
        });
    }

    /// Reads a latency block received at `time`. Returns false on a malformed block.
    pub fn unpack(&mut self, packet: &mut Packet, time: f64) -> bool {
        let (Some(peer_timestamp), Some(has_echo), Some(echo), Some(correction)) = (
            packet.read::<u16>(),
            packet.read::<bool>(),
            packet.read::<u16>(),
            packet.read::<u16>(),
        ) else {
            return false;
        };
        let now = time::timestamp(time);
        self.peer_timestamp = Some(peer_timestamp);
        self.peer_timestamp_received_at = now;

        if has_echo {
            let rtt = time::elapsed(now, echo);
            if correction <= rtt {
                self.round_trip_time = Some(rtt);
                if self.samples.len() == LATENCY_WINDOW {
                    self.samples.pop_front();
                }
                self.samples.push_back((rtt - correction) / 2);
                let sum: u32 = self.samples.iter().map(|s| *s as u32).sum();
                let latency = (sum / self.samples.len() as u32) as u16;
                self.latency = Some(latency);
                self.clock_offset = Some(time::offset(peer_timestamp.wrapping_add(latency), now));
            } else {
                log::trace!("ignoring latency sample with correction {correction} > rtt {rtt}");
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::InternalId;

    /// Builds the block the peer would send back.
    fn block(peer_timestamp: u16, echo: Option<u16>, correction: u16) -> Packet {
        let mut packet = Packet::new();
        packet
            .write(&peer_timestamp)
            .write(&echo.is_some())
            .write(&echo.unwrap_or(0))
            .write(&correction);
        packet
    }

    #[test]
    fn nothing_known_before_samples() {
        let mut planner = LatencyPlanner::new();
        assert_eq!(planner.latency(), None);
        assert_eq!(planner.correction_latency(1.0), None);
        // a block without echo only teaches us the peer timestamp
        assert!(planner.unpack(&mut block(500, None, 0), 1.0));
        assert_eq!(planner.round_trip_time(), None);
        assert_eq!(planner.correction_latency(1.25), Some(250));
    }

    #[test]
    fn latency_and_offset() {
        let mut planner = LatencyPlanner::new();
        // sent at 100ms, peer held it 20ms, peer clock reads 5020, back at 150ms
        assert!(planner.unpack(&mut block(5020, Some(100), 20), 0.150));
        assert_eq!(planner.round_trip_time(), Some(50));
        assert_eq!(planner.latency(), Some(15));
        assert_eq!(planner.clock_offset(), Some(4885));
    }

    #[test]
    fn latency_is_a_rolling_mean() {
        let mut planner = LatencyPlanner::new();
        assert!(planner.unpack(&mut block(0, Some(0), 0), 0.020));
        assert!(planner.unpack(&mut block(0, Some(0), 0), 0.040));
        assert_eq!(planner.latency(), Some(15));
        for _ in 0..LATENCY_WINDOW {
            assert!(planner.unpack(&mut block(0, Some(0), 0), 0.100));
        }
        assert_eq!(planner.latency(), Some(50));
    }

    #[test]
    fn pack_registers_send_options() {
        let mut planner = LatencyPlanner::new();
        assert!(planner.unpack(&mut block(700, None, 0), 1.0));

        let mut packet = ProtocolPacket::internal(InternalId::Return, Packet::new());
        planner.pack(&mut packet);
        let stamped = packet.stamped_payload(1.030, planner.correction_latency(1.030));

        let mut read = Packet::from_bytes(stamped);
        assert_eq!(read.read::<u16>(), Some(1030));
        assert_eq!(read.read::<bool>(), Some(true));
        assert_eq!(read.read::<u16>(), Some(700));
        assert_eq!(read.read::<u16>(), Some(30));
    }

    #[test]
    fn malformed_block() {
        let mut planner = LatencyPlanner::new();
        assert!(!planner.unpack(&mut Packet::from_bytes(vec![0, 1, 1]), 0.0));
    }
}
