//! Input source handling: a bounded per-source packet buffer and the
//! background-thread reader that fills it from a named pipe, tracking
//! PAT/PMT/IDR/audio-sync readiness.

pub mod buffer;
pub mod fifo;

pub use buffer::{RawPacket, SourceBuffer};
pub use fifo::FIFOInput;

use std::fmt;

/// Tags one of the three input sources. Reused as the controller's
/// `Mode`/`RequestedLiveSource` variant set rather than duplicating a
/// parallel enum — a tagged sum over source kinds in place of dynamic
/// dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// The looping offline fallback asset.
    Fallback,
    /// The primary live camera (SRT-origin).
    Camera,
    /// The secondary live feed (drone, RTMP-origin).
    Drone,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceKind::Fallback => "fallback",
            SourceKind::Camera => "camera",
            SourceKind::Drone => "drone",
        })
    }
}

/// Per-source stream metadata, known once PAT and PMT have both been
/// parsed. Mutated only on a PAT/PMT version bump (stream reset).
#[derive(Debug, Clone)]
pub struct StreamInfo {
    /// Program number named by the PAT.
    pub program_number: u16,
    /// PID carrying this source's PMT.
    pub pmt_pid: u16,
    /// PID nominated to carry PCR.
    pub pcr_pid: u16,
    /// Source's video elementary stream PID.
    pub video_pid: u16,
    /// Source's video stream_type (normally H.264, `0x1b`).
    pub video_stream_type: u8,
    /// Source's audio elementary stream PID, if the program carries one.
    pub audio_pid: Option<u16>,
    /// Source's audio stream_type, if present.
    pub audio_stream_type: Option<u8>,
}

/// A readiness transition published by a [`FIFOInput`] to the
/// `SwitchController`, replacing a cyclic FIFOInput↔controller
/// reference with message passing.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessEvent {
    /// Which source's readiness changed.
    pub source: SourceKind,
    /// The new readiness value.
    pub ready: bool,
}
