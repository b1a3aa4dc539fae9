//! Per-source packet buffer: an arena of raw TS packets with the
//! `idrIndex`/`consumeIndex`/`snapshotEnd` indices described by the
//! data model, bounded and trimmed from the front without ever
//! invalidating a view already handed to the splicer.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Duration;

use crate::ts::packet::TS_PACKET_SIZE;

/// One owned, raw 188-byte packet.
pub type RawPacket = [u8; TS_PACKET_SIZE];

struct Inner {
    packets: VecDeque<RawPacket>,
    idr_index: usize,
    consume_index: usize,
    snapshot_end: usize,
}

/// A bounded packet arena owned by one [`crate::source::fifo::FIFOInput`]
/// and read by the splicer. The splicer never holds a reference into
/// this buffer across a blocking call: [`SourceBuffer::snapshot`] and
/// [`SourceBuffer::drain_new`] copy packets out.
pub struct SourceBuffer {
    inner: Mutex<Inner>,
    cond: Condvar,
    max_packets: usize,
}

impl SourceBuffer {
    /// Creates an empty buffer bounded at `max_packets`.
    pub fn new(max_packets: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                packets: VecDeque::new(),
                idr_index: 0,
                consume_index: 0,
                snapshot_end: 0,
            }),
            cond: Condvar::new(),
            max_packets: max_packets.max(1),
        }
    }

    /// Appends one packet read from the source.
    ///
    /// If the buffer is at capacity, trims from the front — but never
    /// past `idr_index` (which always sits at or before `snapshot_end`,
    /// protecting both). If trimming would have to cross that floor,
    /// blocks in short waits until the splicer advances it by taking a
    /// snapshot, rather than invalidating the pending segment start.
    pub fn push(&self, packet: RawPacket) {
        let mut inner = self.inner.lock();
        loop {
            if inner.packets.len() < self.max_packets {
                break;
            }
            if inner.idr_index == 0 {
                let timed_out = self
                    .cond
                    .wait_for(&mut inner, Duration::from_millis(10))
                    .timed_out();
                let _ = timed_out;
                continue;
            }
            inner.packets.pop_front();
            inner.idr_index -= 1;
            inner.consume_index = inner.consume_index.saturating_sub(1);
            inner.snapshot_end = inner.snapshot_end.saturating_sub(1);
        }
        inner.packets.push_back(packet);
        self.cond.notify_all();
    }

    /// Marks the most recently pushed packet as the first IDR of a new
    /// segment. Called by `FIFOInput` on its `NO_IDR` → `NO_AUDIO_SYNC`
    /// (or `READY`) transition.
    pub fn mark_idr(&self) {
        let mut inner = self.inner.lock();
        inner.idr_index = inner.packets.len().saturating_sub(1);
    }

    /// Clears the buffer and all indices. Called before a fresh segment
    /// begins on this source (including fallback loop boundaries).
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.packets.clear();
        inner.idr_index = 0;
        inner.consume_index = 0;
        inner.snapshot_end = 0;
        self.cond.notify_all();
    }

    /// Copies out every packet from `idr_index` to the current write
    /// position, and records that position as `snapshot_end` /
    /// `consume_index` so the caller can continue with [`Self::drain_new`]
    /// once the snapshot is exhausted.
    pub fn snapshot(&self) -> Vec<RawPacket> {
        let mut inner = self.inner.lock();
        let out: Vec<RawPacket> = inner.packets.iter().skip(inner.idr_index).copied().collect();
        let end = inner.packets.len();
        inner.snapshot_end = end;
        inner.consume_index = end;
        out
    }

    /// Returns any packets pushed since the last call to
    /// [`Self::snapshot`] or [`Self::drain_new`], advancing
    /// `consume_index`. Used once the splicer has exhausted its
    /// snapshot and switches to live consumption.
    pub fn drain_new(&self) -> Vec<RawPacket> {
        let mut inner = self.inner.lock();
        let out: Vec<RawPacket> = inner
            .packets
            .iter()
            .skip(inner.consume_index)
            .copied()
            .collect();
        inner.consume_index = inner.packets.len();
        inner.snapshot_end = inner.consume_index;
        out
    }

    /// Blocks up to `timeout` for new packets to arrive, for the
    /// splicer's bounded-wait suspension point. Returns `true` if the
    /// buffer changed before the timeout elapsed.
    pub fn wait_for_new(&self, timeout: Duration) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.packets.len();
        if before != inner.consume_index {
            return true;
        }
        self.cond.wait_for(&mut inner, timeout);
        inner.packets.len() != before
    }

    /// Current packet count, for diagnostics.
    pub fn len(&self) -> usize {
        self.inner.lock().packets.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(fill: u8) -> RawPacket {
        let mut p = [0u8; TS_PACKET_SIZE];
        p[0] = 0x47;
        p[4] = fill;
        p
    }

    #[test]
    fn push_and_snapshot_from_idr() {
        let buf = SourceBuffer::new(10);
        buf.push(packet(1));
        buf.push(packet(2));
        buf.mark_idr();
        buf.push(packet(3));
        let snap = buf.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0][4], 2);
        assert_eq!(snap[1][4], 3);
    }

    #[test]
    fn drain_new_advances_past_snapshot() {
        let buf = SourceBuffer::new(10);
        buf.push(packet(1));
        buf.mark_idr();
        let _ = buf.snapshot();
        buf.push(packet(2));
        buf.push(packet(3));
        let live = buf.drain_new();
        assert_eq!(live.len(), 2);
        assert_eq!(buf.drain_new().len(), 0);
    }

    #[test]
    fn reset_clears_all_indices() {
        let buf = SourceBuffer::new(10);
        buf.push(packet(1));
        buf.mark_idr();
        let _ = buf.snapshot();
        buf.reset();
        assert_eq!(buf.len(), 0);
        buf.push(packet(9));
        buf.mark_idr();
        assert_eq!(buf.snapshot()[0][4], 9);
    }

    #[test]
    fn trimming_preserves_idr_relative_position() {
        let buf = SourceBuffer::new(4);
        buf.push(packet(1));
        buf.push(packet(2));
        buf.mark_idr(); // idr at index 1 (value 2)
        buf.push(packet(3));
        buf.push(packet(4));
        // buffer now at capacity (4); next push must trim from the
        // front, but only up to idr_index (1), never past it.
        buf.push(packet(5));
        let snap = buf.snapshot();
        assert_eq!(snap.iter().map(|p| p[4]).collect::<Vec<_>>(), vec![2, 3, 4, 5]);
    }
}
