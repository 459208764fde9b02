// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Packet statistics: per-type counters and per-peer heartbeat timestamps.
//!
//! Records are created lazily on first observation and never destroyed;
//! [`PacketStatistics::clear_all`] zeroes the per-type counters in place
//! and leaves the per-peer heartbeat timestamps untouched. Every operation
//! is total over possibly-absent keys (absent means create).

use dashmap::DashMap;
use std::time::Instant;

use crate::wire::{MessageType, PacketHeader};

/// Counters for one wire message type.
#[derive(Debug, Clone, Copy, Default)]
pub struct TypeCounters {
    pub sent: u64,
    pub received: u64,
    pub dropped: u64,
    pub skipped: u64,
    pub largest_sent: usize,
    pub largest_received: usize,
}

/// Heartbeat timestamps for one remote peer.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatTimes {
    pub last_sent: Instant,
    pub last_received: Instant,
}

impl HeartbeatTimes {
    fn now() -> Self {
        let now = Instant::now();
        Self {
            last_sent: now,
            last_received: now,
        }
    }
}

/// Mutation-guarded packet telemetry, shared by transport and coordinator.
#[derive(Debug, Default)]
pub struct PacketStatistics {
    by_type: DashMap<u8, TypeCounters>,
    heartbeats: DashMap<u8, HeartbeatTimes>,
}

impl PacketStatistics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a packet observed on the wire in either direction.
    ///
    /// A received heartbeat also stamps the sender's "last heartbeat
    /// received" time, creating the per-peer record on first sight.
    pub fn record_packet(&self, header: &PacketHeader, sending: bool) {
        let size = header.message_size as usize;
        {
            let mut counters = self.by_type.entry(header.message_type).or_default();
            if sending {
                counters.sent += 1;
                counters.largest_sent = counters.largest_sent.max(size);
            } else {
                counters.received += 1;
                counters.largest_received = counters.largest_received.max(size);
            }
        }

        if !sending && header.message_type == MessageType::Heartbeat.to_wire() {
            let mut times = self
                .heartbeats
                .entry(header.console_id)
                .or_insert_with(HeartbeatTimes::now);
            times.last_received = Instant::now();
        }
    }

    /// Add to the dropped count for a message type.
    pub fn record_dropped(&self, message_type: u8, count: u64) {
        self.by_type.entry(message_type).or_default().dropped += count;
    }

    /// Add to the skipped count for a message type.
    pub fn record_skipped(&self, message_type: u8, count: u64) {
        self.by_type.entry(message_type).or_default().skipped += count;
    }

    /// Stamp the "last heartbeat sent" time for a peer.
    pub fn mark_heartbeat_sent(&self, console_id: u8) {
        let mut times = self
            .heartbeats
            .entry(console_id)
            .or_insert_with(HeartbeatTimes::now);
        times.last_sent = Instant::now();
    }

    /// Snapshot of the counters for a message type, if ever observed.
    #[must_use]
    pub fn counters(&self, message_type: u8) -> Option<TypeCounters> {
        self.by_type.get(&message_type).map(|c| *c)
    }

    /// Snapshot of a peer's heartbeat timestamps, if ever observed.
    #[must_use]
    pub fn heartbeat_times(&self, console_id: u8) -> Option<HeartbeatTimes> {
        self.heartbeats.get(&console_id).map(|t| *t)
    }

    /// Zero all per-type counters in place. Per-peer heartbeat timestamps
    /// are untouched.
    pub fn clear_all(&self) {
        for mut entry in self.by_type.iter_mut() {
            *entry.value_mut() = TypeCounters::default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HEADER_LEN;
    use crate::wire::frame;

    fn header(ty: MessageType, console_id: u8, payload_len: usize) -> PacketHeader {
        let bytes = frame(1, ty, console_id, false, &vec![0u8; payload_len]);
        PacketHeader::parse(&bytes).expect("test header should parse")
    }

    #[test]
    fn test_first_observation_creates_record() {
        let stats = PacketStatistics::new();
        assert!(stats.counters(MessageType::Chat.to_wire()).is_none());

        stats.record_packet(&header(MessageType::Chat, 1, 10), true);

        let counters = stats
            .counters(MessageType::Chat.to_wire())
            .expect("record created on first sight");
        assert_eq!(counters.sent, 1);
        assert_eq!(counters.received, 0);
        assert_eq!(counters.largest_sent, HEADER_LEN + 10);
    }

    #[test]
    fn test_largest_size_tracks_maximum_per_direction() {
        let stats = PacketStatistics::new();
        stats.record_packet(&header(MessageType::Chat, 1, 100), true);
        stats.record_packet(&header(MessageType::Chat, 1, 20), true);
        stats.record_packet(&header(MessageType::Chat, 1, 50), false);

        let counters = stats.counters(MessageType::Chat.to_wire()).expect("record");
        assert_eq!(counters.largest_sent, HEADER_LEN + 100);
        assert_eq!(counters.largest_received, HEADER_LEN + 50);
    }

    #[test]
    fn test_received_heartbeat_stamps_peer_time() {
        let stats = PacketStatistics::new();
        let before = Instant::now();

        stats.record_packet(&header(MessageType::Heartbeat, 3, 0), false);

        let times = stats.heartbeat_times(3).expect("peer record created");
        assert!(
            times.last_received >= before,
            "last received must be at or after the observation"
        );
    }

    #[test]
    fn test_sent_heartbeat_does_not_stamp_receive_time() {
        let stats = PacketStatistics::new();
        stats.record_packet(&header(MessageType::Heartbeat, 4, 0), true);
        assert!(
            stats.heartbeat_times(4).is_none(),
            "sending alone creates no per-peer record"
        );

        stats.mark_heartbeat_sent(4);
        assert!(stats.heartbeat_times(4).is_some());
    }

    #[test]
    fn test_dropped_and_skipped_are_additive() {
        let stats = PacketStatistics::new();
        let ty = MessageType::Custom(7).to_wire();
        stats.record_dropped(ty, 2);
        stats.record_dropped(ty, 3);
        stats.record_skipped(ty, 10);

        let counters = stats.counters(ty).expect("record");
        assert_eq!(counters.dropped, 5);
        assert_eq!(counters.skipped, 10);
    }

    #[test]
    fn test_clear_all_preserves_heartbeat_times() {
        let stats = PacketStatistics::new();
        stats.record_packet(&header(MessageType::Heartbeat, 3, 0), false);
        stats.record_packet(&header(MessageType::Chat, 3, 5), false);
        let times_before = stats.heartbeat_times(3).expect("peer record");

        stats.clear_all();

        let counters = stats.counters(MessageType::Chat.to_wire()).expect("record kept");
        assert_eq!(counters.received, 0, "counters zeroed in place");
        let times_after = stats.heartbeat_times(3).expect("peer record kept");
        assert_eq!(times_after.last_received, times_before.last_received);
    }
}
