//! Background reader/reassembler/state-machine for one input source.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::codec::h264;
use crate::metrics::RelayMetrics;
use crate::ts::packet::{TSPacketCodec, SYNC_BYTE, TS_PACKET_SIZE};
use crate::ts::pes::parse_pes_header;
use crate::ts::psi::{parse_pat_section, parse_pmt_section};

use super::buffer::{RawPacket, SourceBuffer};
use super::{ReadinessEvent, SourceKind, StreamInfo};

const RECONNECT_BACKOFF: Duration = Duration::from_millis(100);
const READ_CHUNK_PACKETS: usize = 16;

/// Internal reader state machine. Readiness as observed externally is
/// `state == Ready`, exposed separately as an atomic bool for lock-free
/// polling by the splicer and controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    NoPat,
    NoPmt,
    NoIdr,
    NoAudioSync,
    Ready,
}

struct Shared {
    ready: AtomicBool,
    info: Mutex<Option<StreamInfo>>,
    last_sps: Mutex<Option<Vec<u8>>>,
    last_pps: Mutex<Option<Vec<u8>>>,
    orphan_audio_packets: AtomicU64,
    reset_requested: AtomicBool,
    shutdown: AtomicBool,
    generation: AtomicU64,
}

/// Owns one named-pipe input source: its background reader thread and
/// the [`SourceBuffer`] that thread fills.
pub struct FIFOInput {
    kind: SourceKind,
    path: String,
    buffer: Arc<SourceBuffer>,
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl FIFOInput {
    /// Opens (lazily, from the background thread) the named pipe at
    /// `path` and begins reassembling and classifying its packet
    /// stream. Readiness transitions are sent on `readiness_tx`.
    pub fn spawn(
        kind: SourceKind,
        path: String,
        buffer_packets: usize,
        readiness_tx: Sender<ReadinessEvent>,
        metrics: Arc<RelayMetrics>,
    ) -> Arc<Self> {
        let buffer = Arc::new(SourceBuffer::new(buffer_packets));
        let shared = Arc::new(Shared {
            ready: AtomicBool::new(false),
            info: Mutex::new(None),
            last_sps: Mutex::new(None),
            last_pps: Mutex::new(None),
            orphan_audio_packets: AtomicU64::new(0),
            reset_requested: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        });

        let thread_buffer = Arc::clone(&buffer);
        let thread_shared = Arc::clone(&shared);
        let thread_path = path.clone();
        let handle = thread::spawn(move || {
            run_reader(
                kind,
                thread_path,
                thread_buffer,
                thread_shared,
                readiness_tx,
                metrics,
            );
        });

        Arc::new(Self {
            kind,
            path,
            buffer,
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// This source's kind.
    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    /// Configured pipe path, for logging.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The packet buffer this source fills.
    pub fn buffer(&self) -> &SourceBuffer {
        &self.buffer
    }

    /// Lock-free readiness check: `state == Ready`.
    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::Acquire)
    }

    /// Current stream metadata, if PAT+PMT have been observed.
    pub fn stream_info(&self) -> Option<StreamInfo> {
        self.shared.info.lock().clone()
    }

    /// Last-seen SPS payload bytes (Annex-B, start-code-exclusive), if any.
    pub fn last_sps(&self) -> Option<Vec<u8>> {
        self.shared.last_sps.lock().clone()
    }

    /// Last-seen PPS payload bytes, if any.
    pub fn last_pps(&self) -> Option<Vec<u8>> {
        self.shared.last_pps.lock().clone()
    }

    /// Diagnostic-only count of audio continuation packets observed
    /// between a segment's IDR and its first audio PUSI.
    pub fn orphan_audio_packets(&self) -> u64 {
        self.shared.orphan_audio_packets.load(Ordering::Relaxed)
    }

    /// Bumped every time the reader (re)opens its pipe — a fresh
    /// producer attaching, or (for the looping fallback asset) the
    /// producer wrapping back to the start of its file. The controller
    /// watches this on the fallback source to detect a loop boundary
    /// and re-splice at the new segment's IDR rather than blindly
    /// passing the seam through.
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }

    /// Requests that this source re-enter `NO_IDR` and clear its
    /// buffer, so the next splice starts at a fresh IDR. Called by the
    /// controller before every new segment, including fallback loop
    /// boundaries.
    pub fn reset(&self) {
        self.shared.reset_requested.store(true, Ordering::Release);
    }

    /// Signals the reader thread to stop and joins it.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

fn run_reader(
    kind: SourceKind,
    path: String,
    buffer: Arc<SourceBuffer>,
    shared: Arc<Shared>,
    readiness_tx: Sender<ReadinessEvent>,
    metrics: Arc<RelayMetrics>,
) {
    while !shared.shutdown.load(Ordering::Acquire) {
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) => {
                log::warn!("{kind}: failed to open {path}: {e}");
                thread::sleep(RECONNECT_BACKOFF);
                continue;
            }
        };

        shared.generation.fetch_add(1, Ordering::AcqRel);
        let mut state = ReaderState::NoPat;
        set_ready(&shared, &readiness_tx, kind, false);
        buffer.reset();
        *shared.info.lock() = None;

        let mut reassembler = PacketReassembler::new();
        let mut pes_buffers: HashMap<u16, Vec<u8>> = HashMap::new();
        let mut read_buf = vec![0u8; READ_CHUNK_PACKETS * TS_PACKET_SIZE];

        'stream: loop {
            if shared.shutdown.load(Ordering::Acquire) {
                return;
            }
            if shared.reset_requested.swap(false, Ordering::AcqRel) {
                // Only meaningful once PAT/PMT are known; a reset
                // requested before then (e.g. the controller's startup
                // splice racing the reader's first PAT) would otherwise
                // strand the state machine in NO_IDR with no StreamInfo
                // and no way back to NO_PAT/NO_PMT.
                if !matches!(state, ReaderState::NoPat | ReaderState::NoPmt) {
                    state = ReaderState::NoIdr;
                    pes_buffers.clear();
                    buffer.reset();
                    set_ready(&shared, &readiness_tx, kind, false);
                }
            }

            let n = match file.read(&mut read_buf) {
                Ok(0) => {
                    log::info!("{kind}: EOF on {path}, reconnecting");
                    break 'stream;
                }
                Ok(n) => n,
                Err(e) => {
                    log::warn!("{kind}: read error on {path}: {e}");
                    break 'stream;
                }
            };

            reassembler.feed(&read_buf[..n]);
            for raw in reassembler.drain_packets() {
                process_packet(
                    kind,
                    &raw,
                    &buffer,
                    &shared,
                    &readiness_tx,
                    &mut state,
                    &mut pes_buffers,
                    &metrics,
                );
            }
        }

        set_ready(&shared, &readiness_tx, kind, false);
        metrics.record_reconnect();
        thread::sleep(RECONNECT_BACKOFF);
    }
}

fn set_ready(shared: &Shared, tx: &Sender<ReadinessEvent>, kind: SourceKind, ready: bool) {
    let previous = shared.ready.swap(ready, Ordering::AcqRel);
    if previous != ready {
        let _ = tx.send(ReadinessEvent { source: kind, ready });
    }
}

#[allow(clippy::too_many_arguments)]
fn process_packet(
    kind: SourceKind,
    raw: &RawPacket,
    buffer: &SourceBuffer,
    shared: &Shared,
    readiness_tx: &Sender<ReadinessEvent>,
    state: &mut ReaderState,
    pes_buffers: &mut HashMap<u16, Vec<u8>>,
    metrics: &RelayMetrics,
) {
    let mut scratch = *raw;
    let codec = match TSPacketCodec::new(&mut scratch) {
        Ok(c) => c,
        Err(e) => {
            log::debug!("{kind}: {e}");
            metrics.record_malformed_packet();
            return;
        }
    };
    if codec.transport_error() {
        return;
    }
    let pid = codec.pid();
    let pusi = codec.pusi();
    let has_payload = codec.has_payload();
    let payload = codec.payload().to_vec();
    drop(codec);

    buffer.push(*raw);

    match *state {
        ReaderState::NoPat => {
            if pid == 0 && pusi && has_payload && !payload.is_empty() {
                let table_offset = 1 + payload[0] as usize;
                if table_offset < payload.len() {
                    match parse_pat_section(&payload[table_offset..]) {
                        Ok(pat) => {
                            let mut info = shared.info.lock();
                            *info = Some(StreamInfo {
                                program_number: 1,
                                pmt_pid: pat.pmt_pid,
                                pcr_pid: 0,
                                video_pid: 0,
                                video_stream_type: 0,
                                audio_pid: None,
                                audio_stream_type: None,
                            });
                            drop(info);
                            *state = ReaderState::NoPmt;
                        }
                        Err(e) => log::debug!("{kind}: {e}"),
                    }
                }
            }
        }
        ReaderState::NoPmt => {
            let pmt_pid = shared.info.lock().as_ref().map(|i| i.pmt_pid);
            if Some(pid) == pmt_pid && pusi && has_payload && !payload.is_empty() {
                let table_offset = 1 + payload[0] as usize;
                if table_offset < payload.len() {
                    match parse_pmt_section(&payload[table_offset..]) {
                        Ok(pmt) => {
                            if let (Some((video_pid, video_type)), audio) =
                                (pmt.video(), pmt.audio())
                            {
                                let mut info = shared.info.lock();
                                if let Some(i) = info.as_mut() {
                                    i.pcr_pid = pmt.pcr_pid;
                                    i.video_pid = video_pid;
                                    i.video_stream_type = video_type;
                                    i.audio_pid = audio.map(|(p, _)| p);
                                    i.audio_stream_type = audio.map(|(_, t)| t);
                                }
                                drop(info);
                                *state = ReaderState::NoIdr;
                            } else {
                                log::warn!("{kind}: PMT carries no H.264 video stream");
                            }
                        }
                        Err(e) => log::debug!("{kind}: {e}"),
                    }
                }
            }
        }
        ReaderState::NoIdr | ReaderState::Ready => {
            let info = shared.info.lock().clone();
            let Some(info) = info else { return };
            if pid == info.video_pid {
                scan_video_payload(
                    kind, pid, pusi, &payload, pes_buffers, shared,
                );
                if *state == ReaderState::NoIdr {
                    let buf = pes_buffers.get(&pid);
                    if let Some(data) = buf {
                        if contains_idr(data) {
                            buffer.mark_idr();
                            *state = if info.audio_pid.is_some() {
                                ReaderState::NoAudioSync
                            } else {
                                ReaderState::Ready
                            };
                            if *state == ReaderState::Ready {
                                set_ready(shared, readiness_tx, kind, true);
                            }
                        }
                    }
                }
            } else if Some(pid) == info.audio_pid && *state == ReaderState::Ready {
                // steady state; nothing to track once ready.
            }
        }
        ReaderState::NoAudioSync => {
            let info = shared.info.lock().clone();
            let Some(info) = info else { return };
            if pid == info.video_pid {
                scan_video_payload(kind, pid, pusi, &payload, pes_buffers, shared);
            } else if Some(pid) == info.audio_pid {
                if pusi {
                    *state = ReaderState::Ready;
                    set_ready(shared, readiness_tx, kind, true);
                } else if has_payload {
                    shared.orphan_audio_packets.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

/// Appends payload bytes to the PES reassembly buffer for `pid`,
/// starting a fresh buffer on PUSI, and records the most recent SPS/PPS
/// seen so the splicer has something to inject even if a segment
/// starts before fresh parameter sets have re-arrived.
fn scan_video_payload(
    kind: SourceKind,
    pid: u16,
    pusi: bool,
    payload: &[u8],
    pes_buffers: &mut HashMap<u16, Vec<u8>>,
    shared: &Shared,
) {
    let entry = pes_buffers.entry(pid).or_default();
    if pusi {
        entry.clear();
    }
    entry.extend_from_slice(payload);

    if let Ok(header) = parse_pes_header(entry) {
        let es = &entry[header.es_offset..];
        for unit in h264::scan_nal_units(es) {
            if unit.is_sps() {
                *shared.last_sps.lock() = Some(es[unit.range.clone()].to_vec());
            } else if unit.is_pps() {
                *shared.last_pps.lock() = Some(es[unit.range.clone()].to_vec());
            }
        }
    } else {
        log::trace!("{kind}: incomplete PES on pid {pid}, awaiting more payload");
    }
}

fn contains_idr(pes_buffer: &[u8]) -> bool {
    match parse_pes_header(pes_buffer) {
        Ok(header) => {
            let es = &pes_buffer[header.es_offset..];
            h264::find_idr(&h264::scan_nal_units(es)).is_some()
        }
        Err(_) => false,
    }
}

/// Reassembles a raw byte stream into sync-byte-aligned 188-byte
/// packets, resynchronizing on 0x47 when the stream is corrupt.
struct PacketReassembler {
    pending: Vec<u8>,
}

impl PacketReassembler {
    fn new() -> Self {
        Self {
            pending: Vec::with_capacity(READ_CHUNK_PACKETS * TS_PACKET_SIZE * 2),
        }
    }

    fn feed(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    fn drain_packets(&mut self) -> Vec<RawPacket> {
        let mut out = Vec::new();
        loop {
            if self.pending.len() < TS_PACKET_SIZE {
                break;
            }
            if self.pending[0] != SYNC_BYTE {
                match self.pending[1..].iter().position(|&b| b == SYNC_BYTE) {
                    Some(offset) => {
                        self.pending.drain(0..offset + 1);
                    }
                    None => self.pending.clear(),
                }
                continue;
            }
            let has_two_ahead = self.pending.len() >= TS_PACKET_SIZE * 3;
            if has_two_ahead
                && (self.pending[TS_PACKET_SIZE] != SYNC_BYTE
                    || self.pending[TS_PACKET_SIZE * 2] != SYNC_BYTE)
            {
                self.pending.remove(0);
                continue;
            }
            let mut packet = [0u8; TS_PACKET_SIZE];
            packet.copy_from_slice(&self.pending[..TS_PACKET_SIZE]);
            self.pending.drain(0..TS_PACKET_SIZE);
            out.push(packet);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_packet(pid: u16, pusi: bool) -> RawPacket {
        let mut p = [0xffu8; TS_PACKET_SIZE];
        crate::ts::packet::write_header(&mut p, pid, pusi, false, 0);
        p
    }

    #[test]
    fn reassembler_passes_through_aligned_stream() {
        let mut r = PacketReassembler::new();
        let a = blank_packet(0, false);
        let b = blank_packet(256, true);
        let mut stream = Vec::new();
        stream.extend_from_slice(&a);
        stream.extend_from_slice(&b);
        r.feed(&stream);
        let packets = r.drain_packets();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0], a);
        assert_eq!(packets[1], b);
    }

    #[test]
    fn reassembler_resyncs_after_garbage_prefix() {
        let mut r = PacketReassembler::new();
        let good = blank_packet(256, false);
        let mut stream = vec![0x00, 0x11, 0x22];
        stream.extend_from_slice(&good);
        stream.extend_from_slice(&good);
        stream.extend_from_slice(&good);
        r.feed(&stream);
        let packets = r.drain_packets();
        assert_eq!(packets.len(), 3);
        assert!(packets.iter().all(|p| *p == good));
    }

    #[test]
    fn reassembler_holds_partial_trailing_bytes() {
        let mut r = PacketReassembler::new();
        let good = blank_packet(256, false);
        r.feed(&good);
        r.feed(&good[..100]);
        let packets = r.drain_packets();
        assert_eq!(packets.len(), 1);
        assert_eq!(r.pending.len(), 100);
    }
}
