// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! A fixed-size ring buffer of periodic engine snapshots, kept for crash
//! forensics.
//!
//! Exactly one task is expected to call [`FlightRecorder::record`] (the
//! memory-monitor tick); [`FlightRecorder::dump`] may be called concurrently
//! from anywhere (e.g. a panic hook) and only ever copies the buffer under the
//! lock before releasing it, so a dump never holds the writer up for long.

use std::collections::BTreeMap;
use std::io::{self, Write};

use chrono::{DateTime, Utc};
use loadshed_clock::MonoTime;
use loadshed_governor::GovernorState;
use parking_lot::Mutex;

/// Default ring-buffer size, matching `FLIGHT_RECORDER_SIZE`'s default.
pub const DEFAULT_RING_SIZE: usize = 100;

/// A single periodic snapshot of engine state.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// When this snapshot was captured.
    pub timestamp: MonoTime,
    /// Wall-clock time of capture, for human-readable dumps.
    pub wall_clock: DateTime<Utc>,
    /// Resident memory at capture time.
    pub heap_bytes: u64,
    /// The detected memory limit (`0` if none).
    pub mem_limit: u64,
    /// Count of concurrently-running background tasks at capture time
    /// (this crate's analogue of the original model's goroutine count).
    pub task_count: usize,
    /// Always `0`; kept for shape-compatibility with the original data model.
    pub gc_count: u64,
    /// Named queue depths, if the caller chose to inject them.
    pub queue_depths: BTreeMap<String, usize>,
    /// Named latency observations, if the caller chose to inject them.
    pub latencies: BTreeMap<String, f64>,
    /// The governor's scale at capture time.
    pub governor_scale: f64,
    /// The governor's state name at capture time.
    pub governor_state: GovernorState,
}

struct RingBuffer {
    slots: Vec<Option<Snapshot>>,
    write_index: usize,
}

/// A ring buffer of the last `N` [`Snapshot`]s.
pub struct FlightRecorder {
    capacity: usize,
    buffer: Mutex<RingBuffer>,
}

impl FlightRecorder {
    /// Creates a recorder with room for `capacity` snapshots. `capacity` is
    /// clamped to at least `1`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            buffer: Mutex::new(RingBuffer {
                slots: vec![None; capacity],
                write_index: 0,
            }),
        }
    }

    /// The configured ring-buffer size.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Writes a new snapshot into the next ring slot, overwriting the oldest
    /// entry once the buffer has wrapped.
    pub fn record(&self, snapshot: Snapshot) {
        let mut buffer = self.buffer.lock();
        let index = buffer.write_index % self.capacity;
        buffer.slots[index] = Some(snapshot);
        buffer.write_index = buffer.write_index.wrapping_add(1);
    }

    /// Returns a chronological (oldest-first) copy of every filled slot.
    #[must_use]
    pub fn snapshots(&self) -> Vec<Snapshot> {
        let buffer = self.buffer.lock();
        let total_written = buffer.write_index;
        let filled = total_written.min(self.capacity);
        let start = if total_written <= self.capacity {
            0
        } else {
            total_written % self.capacity
        };
        (0..filled)
            .filter_map(|offset| buffer.slots[(start + offset) % self.capacity].clone())
            .collect()
    }

    /// Writes a human-readable crash-log-style dump of every retained
    /// snapshot, oldest first. The exact textual layout is not a wire
    /// contract; it exists for human crash forensics, not machine parsing.
    pub fn dump(&self, writer: &mut dyn Write) -> io::Result<()> {
        let snapshots = self.snapshots();
        writeln!(writer, "=== flight recorder dump: {} snapshot(s) ===", snapshots.len())?;
        for snapshot in &snapshots {
            writeln!(
                writer,
                "[{}] heap={}B limit={}B tasks={} gc={} scale={:.3} state={}",
                snapshot.wall_clock.to_rfc3339(),
                snapshot.heap_bytes,
                snapshot.mem_limit,
                snapshot.task_count,
                snapshot.gc_count,
                snapshot.governor_scale,
                snapshot.governor_state,
            )?;
            for (name, depth) in &snapshot.queue_depths {
                writeln!(writer, "    queue[{name}] = {depth}")?;
            }
            for (name, latency) in &snapshot.latencies {
                writeln!(writer, "    latency[{name}] = {latency:.3}ms")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(i: u64) -> Snapshot {
        Snapshot {
            timestamp: MonoTime::default(),
            wall_clock: Utc::now(),
            heap_bytes: 1000 + i,
            mem_limit: 1_000_000,
            task_count: 4,
            gc_count: 0,
            queue_depths: BTreeMap::new(),
            latencies: BTreeMap::new(),
            governor_scale: 1.0,
            governor_state: GovernorState::Normal,
        }
    }

    #[test]
    fn holds_at_most_capacity_snapshots() {
        let recorder = FlightRecorder::new(3);
        for i in 0..5 {
            recorder.record(sample(i));
        }
        let snapshots = recorder.snapshots();
        assert_eq!(snapshots.len(), 3);
        assert_eq!(snapshots[0].heap_bytes, 1002);
        assert_eq!(snapshots[2].heap_bytes, 1004);
    }

    #[test]
    fn snapshots_preserve_chronological_order_before_wrap() {
        let recorder = FlightRecorder::new(10);
        for i in 0..4 {
            recorder.record(sample(i));
        }
        let snapshots = recorder.snapshots();
        assert_eq!(snapshots.len(), 4);
        for (idx, snapshot) in snapshots.iter().enumerate() {
            assert_eq!(snapshot.heap_bytes, 1000 + idx as u64);
        }
    }

    #[test]
    fn dump_renders_every_retained_snapshot() {
        let recorder = FlightRecorder::new(2);
        recorder.record(sample(0));
        recorder.record(sample(1));
        let mut out = Vec::new();
        recorder.dump(&mut out).expect("dump succeeds");
        let rendered = String::from_utf8(out).expect("utf8");
        assert!(rendered.contains("2 snapshot(s)"));
        assert!(rendered.contains("heap=1000B"));
        assert!(rendered.contains("heap=1001B"));
    }
}
