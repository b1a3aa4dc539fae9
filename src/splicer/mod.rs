//! Splices the currently active source's packets into one continuous,
//! timestamp-rebased output stream.
//!
//! Runs on the same thread as the output pipe write (the concurrency
//! model keeps consumption and writing on a single "splicer/writer"
//! thread so no lock is ever held across the output pipe's blocking
//! I/O). A [`StreamSplicer`] is handed [`SegmentCommand`]s by the
//! `SwitchController` over a channel and streams packets for the named
//! source until the next command arrives.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use crate::metrics::RelayMetrics;
use crate::output::OutputWriter;
use crate::source::{FIFOInput, RawPacket, SourceKind, StreamInfo};
use crate::ts::packet::{TSPacketCodec, OUT_PID_AUDIO, OUT_PID_PAT, OUT_PID_VIDEO};
use crate::ts::pes::{self, parse_pes_header, PES_START_CODE, PES_STREAM_ID_VIDEO};

const LIVE_WAIT: Duration = Duration::from_millis(10);

/// Default frame-duration estimate (90 kHz ticks) used to advance the
/// global timeline across a splice before any consecutive video PTS
/// pair has been observed — 30fps at 90 kHz, per spec.md's own
/// cold-start example.
const DEFAULT_FRAME_DURATION_PTS: u64 = 3_000;

/// Instruction from the controller: begin a new segment sourced from
/// `source`. The splicer does not itself decide when to switch; it only
/// executes the switch once told to.
#[derive(Debug, Clone, Copy)]
pub struct SegmentCommand {
    /// The source to begin the next segment from.
    pub source: SourceKind,
}

/// Per-output-PID continuity counters. PAT/PMT are owned by
/// [`OutputWriter`] and keep their own counters; this tracks only the
/// normalized video/audio PIDs the splicer rewrites onto.
#[derive(Debug, Default)]
struct ContinuityCounters(HashMap<u16, u8>);

impl ContinuityCounters {
    fn next(&mut self, pid: u16) -> u8 {
        let entry = self.0.entry(pid).or_insert(0);
        let cc = *entry;
        *entry = (*entry + 1) & 0x0f;
        cc
    }
}

/// Bases extracted from a segment's opening snapshot, against which
/// every packet in the segment is rebased.
#[derive(Debug, Clone, Copy, Default)]
struct SegmentBases {
    pts_base: u64,
    pcr_base: u64,
}

/// Consumes the active source, rewrites PIDs/timestamps/CC, and writes
/// the result to the output pipe.
pub struct StreamSplicer {
    sources: HashMap<SourceKind, Arc<FIFOInput>>,
    writer: OutputWriter,
    metrics: Arc<RelayMetrics>,
    cc: ContinuityCounters,
    global_pts_offset: u64,
    global_pcr_offset: u64,
    have_run_segment: bool,
    prev_sps: Option<Vec<u8>>,
    prev_pps: Option<Vec<u8>>,
    /// Running estimate of one video frame's duration in 90 kHz ticks,
    /// updated from consecutive video PTS values observed within a
    /// segment and carried forward to advance the global timeline by
    /// "one frame duration" at the next splice.
    frame_duration_pts: u64,
    /// Previous segment-local (pre-rebase) video PTS, used to derive
    /// `frame_duration_pts`. Reset at the start of every segment since
    /// a new source's clock is unrelated to the last one's.
    prev_video_pts: Option<u64>,
}

impl StreamSplicer {
    /// Builds a splicer over the given sources, writing through `writer`.
    pub fn new(
        sources: HashMap<SourceKind, Arc<FIFOInput>>,
        writer: OutputWriter,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            sources,
            writer,
            metrics,
            cc: ContinuityCounters::default(),
            global_pts_offset: 0,
            global_pcr_offset: 0,
            have_run_segment: false,
            prev_sps: None,
            prev_pps: None,
            frame_duration_pts: DEFAULT_FRAME_DURATION_PTS,
            prev_video_pts: None,
        }
    }

    /// Drives segments off `commands` until `shutdown` is observed.
    /// Blocks on the channel between segments (there is nothing to
    /// write while no segment is active).
    pub fn run(&mut self, commands: &Receiver<SegmentCommand>, shutdown: &AtomicBool) {
        let mut pending: Option<SegmentCommand> = None;
        loop {
            if shutdown.load(Ordering::Acquire) {
                return;
            }
            let cmd = match pending.take() {
                Some(c) => c,
                None => match commands.recv_timeout(Duration::from_millis(200)) {
                    Ok(c) => c,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return,
                },
            };
            pending = self.run_segment(cmd.source, commands, shutdown);
        }
    }

    /// Runs one segment sourced from `source` until a new
    /// [`SegmentCommand`] is pending or shutdown is requested, returning
    /// that next command (if any) so the caller can chain into it
    /// iteratively instead of recursing — segments can run for hours,
    /// and a splice-to-splice tail call must not grow the stack.
    fn run_segment(
        &mut self,
        source: SourceKind,
        commands: &Receiver<SegmentCommand>,
        shutdown: &AtomicBool,
    ) -> Option<SegmentCommand> {
        let Some(handle) = self.sources.get(&source).cloned() else {
            log::warn!("splicer: no FIFOInput registered for {source}");
            return None;
        };
        let Some(info) = handle.stream_info() else {
            log::warn!("splicer: {source} has no stream info, abandoning segment");
            return None;
        };

        self.prev_video_pts = None;

        let snapshot = handle.buffer().snapshot();
        let bases = extract_bases(&snapshot, &info);

        let alignment = (bases.pts_base as i128) * 300 - bases.pcr_base as i128;
        let alignment = if alignment < 0 {
            log::warn!("splicer: {source} PCR ahead of PTS base by {alignment}, clamping to 0");
            0
        } else {
            alignment as u64
        };

        if !self.have_run_segment {
            self.global_pts_offset = alignment / 300;
            self.global_pcr_offset = 0;
            self.have_run_segment = true;
        }

        log::info!(
            "splicer: beginning segment on {source} (ptsBase={}, pcrBase={}, globalPtsOffset={}, globalPcrOffset={})",
            bases.pts_base,
            bases.pcr_base,
            self.global_pts_offset,
            self.global_pcr_offset
        );
        self.metrics.record_splice();
        self.writer
            .set_stream_types(info.video_stream_type, info.audio_stream_type);
        self.writer.force_psi_reinject();

        self.emit_parameter_sets(&handle, &info);

        let mut max_pts = self.global_pts_offset;
        let mut max_pcr = self.global_pcr_offset;

        for raw in snapshot {
            if let Some(out) = self.rewrite_packet(&raw, &info, bases, &mut max_pts, &mut max_pcr) {
                self.write_out(out);
            }
        }

        loop {
            if shutdown.load(Ordering::Acquire) {
                break;
            }
            match commands.try_recv() {
                Ok(next) => {
                    self.global_pts_offset = max_pts + self.frame_duration_pts;
                    self.global_pcr_offset = max_pcr + self.frame_duration_pts * 300;
                    self.prev_sps = handle.last_sps().or(self.prev_sps.take());
                    self.prev_pps = handle.last_pps().or(self.prev_pps.take());
                    return Some(next);
                }
                Err(std::sync::mpsc::TryRecvError::Disconnected) => return None,
                Err(std::sync::mpsc::TryRecvError::Empty) => {}
            }

            if !handle.buffer().wait_for_new(LIVE_WAIT) {
                continue;
            }
            for raw in handle.buffer().drain_new() {
                if let Some(out) = self.rewrite_packet(&raw, &info, bases, &mut max_pts, &mut max_pcr) {
                    self.write_out(out);
                }
            }
        }

        self.global_pts_offset = max_pts + self.frame_duration_pts;
        self.global_pcr_offset = max_pcr + self.frame_duration_pts * 300;
        None
    }

    /// Builds and emits the synthesized SPS+PPS PES that opens every
    /// segment ahead of the snapshot's first IDR, so a decoder attaching
    /// mid-stream always has current parameter sets. Falls back to the
    /// previous segment's parameter sets if this source has not yet
    /// produced its own (e.g. a splice landing before the first PMT-era
    /// SPS/PPS pair has been re-observed on this source).
    fn emit_parameter_sets(&mut self, handle: &Arc<FIFOInput>, _info: &StreamInfo) {
        let sps = handle.last_sps().or_else(|| self.prev_sps.clone());
        let pps = handle.last_pps().or_else(|| self.prev_pps.clone());
        let (Some(sps), Some(pps)) = (sps, pps) else {
            log::warn!("splicer: no SPS/PPS available to inject for this segment");
            return;
        };

        let mut es = Vec::with_capacity(sps.len() + pps.len() + 8);
        es.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
        es.extend_from_slice(&sps);
        es.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
        es.extend_from_slice(&pps);

        let mut pes_packet = pes::build_pes_header(PES_STREAM_ID_VIDEO, self.global_pts_offset);
        pes_packet.extend_from_slice(&es);

        let cc = &mut self.cc;
        let packets = pes::pack_pes_into_ts(OUT_PID_VIDEO, &pes_packet, || cc.next(OUT_PID_VIDEO));
        for packet in packets {
            self.writer.write_packet(&packet);
        }
    }

    /// Updates `frame_duration_pts` from the delta between this
    /// segment-local (pre-rebase) video PTS and the last one observed,
    /// so the next splice's carried-forward offset advances by a
    /// realistic frame duration rather than a fixed guess.
    fn observe_video_pts(&mut self, pts: u64) {
        if let Some(prev) = self.prev_video_pts {
            let delta = pts.wrapping_sub(prev) & 0x1_ffff_ffff;
            if delta > 0 {
                self.frame_duration_pts = delta;
            }
        }
        self.prev_video_pts = Some(pts);
    }

    /// Applies the per-packet splice rules (drop/rewrite PID, rebase
    /// PCR/PTS/DTS, assign CC). Returns `None` for packets that must be
    /// dropped (PAT, the source's PMT, or any non-essential PID).
    fn rewrite_packet(
        &mut self,
        raw: &RawPacket,
        info: &StreamInfo,
        bases: SegmentBases,
        max_pts: &mut u64,
        max_pcr: &mut u64,
    ) -> Option<RawPacket> {
        let mut out = *raw;
        let orig_pid = {
            let codec = match TSPacketCodec::new(&mut out) {
                Ok(c) => c,
                Err(e) => {
                    log::debug!("splicer: {e}");
                    self.metrics.record_malformed_packet();
                    return None;
                }
            };
            codec.pid()
        };

        if orig_pid == OUT_PID_PAT || orig_pid == info.pmt_pid {
            return None;
        }
        let out_pid = if orig_pid == info.video_pid {
            OUT_PID_VIDEO
        } else if Some(orig_pid) == info.audio_pid {
            OUT_PID_AUDIO
        } else {
            return None;
        };

        let mut codec = TSPacketCodec::new(&mut out).ok()?;
        codec.set_pid(out_pid);

        if orig_pid == info.pcr_pid {
            if let Some(orig_pcr) = codec.get_pcr() {
                let rebased = rebase(orig_pcr, bases.pcr_base, self.global_pcr_offset, &self.metrics);
                if codec.set_pcr(rebased).is_ok() {
                    *max_pcr = (*max_pcr).max(rebased);
                }
            }
        }

        if codec.pusi() && codec.has_payload() {
            let starts_with_pes = {
                let payload = codec.payload();
                payload.len() >= 3 && payload[0..3] == PES_START_CODE
            };
            if starts_with_pes {
                let header = {
                    let payload = codec.payload();
                    parse_pes_header(payload).ok()
                };
                if let Some(header) = header {
                    if let Some(pts) = header.pts {
                        if out_pid == OUT_PID_VIDEO {
                            self.observe_video_pts(pts);
                        }
                        let rebased = rebase(pts, bases.pts_base, self.global_pts_offset, &self.metrics)
                            & 0x1_ffff_ffff;
                        let payload_mut = codec.payload_mut();
                        if header.set_pts(payload_mut, rebased).is_ok() {
                            *max_pts = (*max_pts).max(rebased);
                        }
                    }
                    if let Some(dts) = header.dts {
                        let rebased = rebase(dts, bases.pts_base, self.global_pts_offset, &self.metrics)
                            & 0x1_ffff_ffff;
                        let payload_mut = codec.payload_mut();
                        let _ = header.set_dts(payload_mut, rebased);
                    }
                }
            }
        }

        let cc = self.cc.next(out_pid);
        codec.set_cc(cc);
        drop(codec);
        Some(out)
    }

    fn write_out(&mut self, packet: RawPacket) {
        self.writer.write_packet(&packet);
    }
}

/// Rebases `orig` against `base` onto `offset`, clamping to `offset` and
/// recording a timestamp underflow if `orig` precedes `base` — the soft
/// warning path spec'd for PTS/DTS, applied uniformly to PCR rebasing
/// too since the same precedes-its-own-base condition can occur there.
fn rebase(orig: u64, base: u64, offset: u64, metrics: &RelayMetrics) -> u64 {
    if orig >= base {
        (orig - base) + offset
    } else {
        metrics.record_timestamp_underflow();
        offset
    }
}

/// Scans a segment-opening snapshot for the first video and (if
/// present) audio PTS, and the first PCR on the program's `pcrPid`.
/// Per spec, when video and audio PTS bases differ the minimum of the
/// two is used as `ptsBase`, to avoid underflow when rebasing whichever
/// stream started later.
fn extract_bases(snapshot: &[RawPacket], info: &StreamInfo) -> SegmentBases {
    let mut video_pts = None;
    let mut audio_pts = None;
    let mut pcr_base = None;

    for raw in snapshot {
        let mut scratch = *raw;
        let codec = match TSPacketCodec::new(&mut scratch) {
            Ok(c) => c,
            Err(_) => continue,
        };
        let pid = codec.pid();

        if pcr_base.is_none() && pid == info.pcr_pid {
            if let Some(pcr) = codec.get_pcr() {
                pcr_base = Some(pcr);
            }
        }

        if codec.pusi() && codec.has_payload() {
            let payload = codec.payload();
            if payload.len() >= 3 && payload[0..3] == PES_START_CODE {
                if let Ok(header) = parse_pes_header(payload) {
                    if pid == info.video_pid && video_pts.is_none() {
                        video_pts = header.pts;
                    } else if Some(pid) == info.audio_pid && audio_pts.is_none() {
                        audio_pts = header.pts;
                    }
                }
            }
        }

        if video_pts.is_some() && (info.audio_pid.is_none() || audio_pts.is_some()) && pcr_base.is_some() {
            break;
        }
    }

    let pts_base = match (video_pts, audio_pts) {
        (Some(v), Some(a)) => v.min(a),
        (Some(v), None) => v,
        (None, Some(a)) => a,
        (None, None) => 0,
    };

    SegmentBases {
        pts_base,
        pcr_base: pcr_base.unwrap_or(0),
    }
}
