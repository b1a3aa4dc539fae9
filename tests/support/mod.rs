//! Fixture builders and named-pipe helpers shared by the integration
//! tests. Builds PAT/PMT/video/audio TS packets byte-by-byte in the
//! same style as the unit fixtures elsewhere in this crate, rather than
//! pulling in a third-party muxer.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use ts_relay::ts::packet::{write_header, write_pcr, TS_PACKET_SIZE};
use ts_relay::ts::pes::{build_pes_header, PES_STREAM_ID_VIDEO};
use ts_relay::ts::psi::STREAM_TYPE_H264;
use ts_relay::utils::Crc32Mpeg2;

/// Creates a fresh named pipe at `path`, failing the test on error.
pub fn make_fifo(path: &Path) {
    let c_path = std::ffi::CString::new(path.to_str().unwrap()).unwrap();
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    assert_eq!(rc, 0, "mkfifo {path:?} failed: {}", std::io::Error::last_os_error());
}

/// A scratch directory under the system temp dir, removed on drop.
pub struct ScratchDir(pub PathBuf);

impl ScratchDir {
    pub fn new(tag: &str) -> Self {
        let dir = std::env::temp_dir().join(format!("ts_relay_test_{tag}_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        Self(dir)
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.0.join(name)
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

/// Spawns a thread that opens `path` for reading (blocking until a
/// writer attaches) and accumulates every byte read into the returned
/// buffer, until it observes EOF.
pub fn spawn_output_reader(path: PathBuf) -> (JoinHandle<()>, Arc<Mutex<Vec<u8>>>) {
    let collected = Arc::new(Mutex::new(Vec::new()));
    let collected_thread = Arc::clone(&collected);
    let handle = thread::spawn(move || {
        let mut file = File::open(&path).expect("open output fifo for reading");
        let mut chunk = [0u8; 4096];
        loop {
            match file.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => collected_thread.lock().extend_from_slice(&chunk[..n]),
                Err(_) => break,
            }
        }
    });
    (handle, collected)
}

/// Opens `path` for writing, blocking until a reader attaches — the
/// same rendezvous `FIFOInput`'s blocking read-open performs on the
/// other end.
pub fn open_fifo_writer(path: &Path) -> File {
    OpenOptions::new().write(true).open(path).expect("open fifo for writing")
}

/// Polls `f` every 10ms until it returns `true` or `timeout` elapses,
/// panicking on timeout.
pub fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    loop {
        if f() {
            return;
        }
        assert!(Instant::now() < deadline, "condition not met within {timeout:?}");
        thread::sleep(Duration::from_millis(10));
    }
}

/// Builds one normalized PAT TS packet naming `pmt_pid`, in the same
/// byte-by-byte style used elsewhere in this crate to construct test
/// fixtures, independent of `PSIBuilder` (this is meant to look like an
/// arbitrary upstream encoder's PAT, not the splicer's own output).
pub fn build_pat_packet(pmt_pid: u16) -> [u8; TS_PACKET_SIZE] {
    let mut p = [0xffu8; TS_PACKET_SIZE];
    write_header(&mut p, 0, true, false, 0);
    p[4] = 0x00; // pointer field
    p[5] = 0x00; // table id (PAT)
    p[6] = 0xb0;
    p[7] = 13; // section length
    p[8] = 0x00;
    p[9] = 0x01; // transport stream id
    p[10] = 0xc1; // version 0, current/next 1
    p[11] = 0x00;
    p[12] = 0x00;
    p[13] = 0x00;
    p[14] = 0x01; // program number 1
    p[15] = 0xe0 | ((pmt_pid >> 8) as u8 & 0x1f);
    p[16] = pmt_pid as u8;

    let crc = Crc32Mpeg2::new().calculate(&p[5..17]);
    p[17] = (crc >> 24) as u8;
    p[18] = (crc >> 16) as u8;
    p[19] = (crc >> 8) as u8;
    p[20] = crc as u8;
    p
}

/// Builds one normalized PMT TS packet on `pmt_pid`, naming `video_pid`
/// as both PCR PID and sole H.264 elementary stream (no audio — the
/// integration tests exercise a video-only program to keep fixtures
/// small; audio handling is covered at the unit level in `source::fifo`
/// and `splicer`).
pub fn build_pmt_packet(pmt_pid: u16, video_pid: u16) -> [u8; TS_PACKET_SIZE] {
    let mut p = [0xffu8; TS_PACKET_SIZE];
    write_header(&mut p, pmt_pid, true, false, 0);
    p[4] = 0x00;
    p[5] = 0x02; // table id (PMT)
    p[6] = 0xb0;
    p[7] = 18; // section length
    p[8] = 0x00;
    p[9] = 0x01; // program number
    p[10] = 0xc1;
    p[11] = 0x00;
    p[12] = 0x00;
    p[13] = 0xe0 | ((video_pid >> 8) as u8 & 0x1f); // pcr pid
    p[14] = video_pid as u8;
    p[15] = 0xf0; // program info length = 0
    p[16] = 0x00;
    p[17] = STREAM_TYPE_H264;
    p[18] = 0xe0 | ((video_pid >> 8) as u8 & 0x1f);
    p[19] = video_pid as u8;
    p[20] = 0xf0; // es info length = 0
    p[21] = 0x00;

    let crc = Crc32Mpeg2::new().calculate(&p[5..22]);
    p[22] = (crc >> 24) as u8;
    p[23] = (crc >> 16) as u8;
    p[24] = (crc >> 8) as u8;
    p[25] = crc as u8;
    p
}

/// A minimal Annex-B SPS NAL unit (header byte only, followed by a
/// handful of placeholder payload bytes) — enough for `scan_nal_units`
/// to classify it, since the splicer never decodes SPS/PPS semantics.
fn sps_nal() -> Vec<u8> {
    vec![0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1e, 0xab, 0xcd]
}

fn pps_nal() -> Vec<u8> {
    vec![0x00, 0x00, 0x00, 0x01, 0x68, 0xce, 0x3c, 0x80]
}

fn idr_nal() -> Vec<u8> {
    vec![0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84, 0x00, 0x10]
}

/// Builds one TS packet on `pid` carrying a PCR-bearing adaptation
/// field and a single-packet PES (SPS+PPS+IDR Annex-B units), the
/// segment-opening keyframe every test fixture starts from.
pub fn build_video_idr_packet(pid: u16, pts: u64, pcr: u64, cc: u8) -> [u8; TS_PACKET_SIZE] {
    let mut es = Vec::new();
    es.extend_from_slice(&sps_nal());
    es.extend_from_slice(&pps_nal());
    es.extend_from_slice(&idr_nal());
    build_single_packet_video_frame(pid, pts, Some(pcr), &es, cc)
}

/// Builds one non-keyframe video TS packet (no PCR, no parameter sets),
/// for exercising steady-state live-segment streaming after the
/// opening keyframe.
pub fn build_video_frame_packet(pid: u16, pts: u64, cc: u8) -> [u8; TS_PACKET_SIZE] {
    let es = vec![0x00, 0x00, 0x00, 0x01, 0x41, 0x9a, 0x02, 0x10]; // non-IDR slice
    build_single_packet_video_frame(pid, pts, None, &es, cc)
}

fn build_single_packet_video_frame(
    pid: u16,
    pts: u64,
    pcr: Option<u64>,
    es: &[u8],
    cc: u8,
) -> [u8; TS_PACKET_SIZE] {
    let mut p = [0xffu8; TS_PACKET_SIZE];
    let header = build_pes_header(PES_STREAM_ID_VIDEO, pts);

    let payload_offset = if let Some(pcr) = pcr {
        write_header(&mut p, pid, true, true, cc);
        p[4] = 7; // adaptation field length (flags + 6-byte PCR)
        p[5] = 0x10; // PCR flag
        write_pcr(&mut p[6..12], pcr);
        12
    } else {
        write_header(&mut p, pid, true, false, cc);
        4
    };

    p[payload_offset..payload_offset + header.len()].copy_from_slice(&header);
    let es_start = payload_offset + header.len();
    p[es_start..es_start + es.len()].copy_from_slice(es);
    p
}

/// Splits accumulated output bytes into whole 188-byte TS packets,
/// dropping any trailing partial packet still in flight.
pub fn chunk_packets(buf: &[u8]) -> Vec<[u8; TS_PACKET_SIZE]> {
    buf.chunks_exact(TS_PACKET_SIZE)
        .map(|c| {
            let mut p = [0u8; TS_PACKET_SIZE];
            p.copy_from_slice(c);
            p
        })
        .collect()
}

/// Writes a complete fixture (PAT, PMT, one IDR keyframe) to an already
/// write-open named pipe file, for a single-segment video-only source.
pub fn write_cold_start_fixture(file: &mut File, pmt_pid: u16, video_pid: u16, pts: u64) {
    let pat = build_pat_packet(pmt_pid);
    let pmt = build_pmt_packet(pmt_pid, video_pid);
    let video = build_video_idr_packet(video_pid, pts, pts * 300, 0);
    file.write_all(&pat).unwrap();
    file.write_all(&pmt).unwrap();
    file.write_all(&video).unwrap();
    file.flush().unwrap();
}
