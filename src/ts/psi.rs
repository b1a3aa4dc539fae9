//! Program Specific Information: parsing PAT/PMT sections observed on
//! input sources, and building the normalized PAT/PMT TS packets
//! emitted on the spliced output.

use super::packet::{write_header, OUT_PID_AUDIO, OUT_PID_PMT, OUT_PID_VIDEO, TS_PACKET_SIZE};
use crate::error::{RelayError, Result};
use crate::utils::Crc32Mpeg2;
use bytes::{BufMut, BytesMut};

/// Table ID for the Program Association Table.
pub const TABLE_ID_PAT: u8 = 0x00;
/// Table ID for the Program Map Table.
pub const TABLE_ID_PMT: u8 = 0x02;

/// Elementary stream type for H.264 video.
pub const STREAM_TYPE_H264: u8 = 0x1b;
/// Elementary stream type for AAC audio.
pub const STREAM_TYPE_AAC: u8 = 0x0f;

/// Result of parsing an observed PAT section: only the PMT PID matters
/// to a single-program relay source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedPat {
    /// PID carrying this program's PMT.
    pub pmt_pid: u16,
}

/// Result of parsing an observed PMT section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPmt {
    /// PID nominated to carry PCR for the program.
    pub pcr_pid: u16,
    /// `(elementary_pid, stream_type)` for every ES in the program, in
    /// section order.
    pub streams: Vec<(u16, u8)>,
}

impl ParsedPmt {
    /// First elementary stream whose type matches H.264, if any.
    pub fn video(&self) -> Option<(u16, u8)> {
        self.streams
            .iter()
            .copied()
            .find(|&(_, st)| st == STREAM_TYPE_H264)
    }

    /// First elementary stream whose type matches AAC, if any.
    pub fn audio(&self) -> Option<(u16, u8)> {
        self.streams
            .iter()
            .copied()
            .find(|&(_, st)| st == STREAM_TYPE_AAC)
    }
}

/// Parses a PAT section (the bytes starting at `table_id`, i.e. after
/// the pointer field), returning the PMT PID of the first program
/// entry. Sources in this system carry a single program.
pub fn parse_pat_section(data: &[u8]) -> Result<ParsedPat> {
    if data.len() < 8 {
        return Err(RelayError::MalformedPacket("PAT section too short".into()));
    }
    if data[0] != TABLE_ID_PAT {
        return Err(RelayError::MalformedPacket(format!(
            "invalid PAT table id 0x{:02x}",
            data[0]
        )));
    }
    let section_length = ((data[1] as usize & 0x0f) << 8) | data[2] as usize;
    let total_length = 3 + section_length;
    if data.len() < total_length || total_length < 12 {
        return Err(RelayError::MalformedPacket(
            "PAT section shorter than declared length".into(),
        ));
    }

    let mut pos = 8;
    while pos + 4 <= total_length - 4 {
        let program_number = ((data[pos] as u16) << 8) | data[pos + 1] as u16;
        let pid = ((data[pos + 2] as u16 & 0x1f) << 8) | data[pos + 3] as u16;
        if program_number != 0 {
            return Ok(ParsedPat { pmt_pid: pid });
        }
        pos += 4;
    }
    Err(RelayError::MissingPSI(
        "PAT carries no program entries".into(),
    ))
}

/// Parses a PMT section (the bytes starting at `table_id`).
pub fn parse_pmt_section(data: &[u8]) -> Result<ParsedPmt> {
    if data.len() < 12 {
        return Err(RelayError::MalformedPacket("PMT section too short".into()));
    }
    if data[0] != TABLE_ID_PMT {
        return Err(RelayError::MalformedPacket(format!(
            "invalid PMT table id 0x{:02x}",
            data[0]
        )));
    }
    let section_length = ((data[1] as usize & 0x0f) << 8) | data[2] as usize;
    let total_length = 3 + section_length;
    if data.len() < total_length {
        return Err(RelayError::MalformedPacket(
            "PMT section shorter than declared length".into(),
        ));
    }

    let mut pos = 8;
    let pcr_pid = ((data[pos] as u16 & 0x1f) << 8) | data[pos + 1] as u16;
    pos += 2;

    let program_info_length = ((data[pos] as usize & 0x0f) << 8) | data[pos + 1] as usize;
    pos += 2 + program_info_length;
    if pos > total_length - 4 {
        return Err(RelayError::MalformedPacket(
            "PMT program info overruns section".into(),
        ));
    }

    let mut streams = Vec::new();
    while pos + 5 <= total_length - 4 {
        let stream_type = data[pos];
        let elementary_pid = ((data[pos + 1] as u16 & 0x1f) << 8) | data[pos + 2] as u16;
        let es_info_length = ((data[pos + 3] as usize & 0x0f) << 8) | data[pos + 4] as usize;
        pos += 5 + es_info_length;
        if pos > total_length - 4 {
            return Err(RelayError::MalformedPacket(
                "PMT ES info overruns section".into(),
            ));
        }
        streams.push((elementary_pid, stream_type));
    }

    Ok(ParsedPmt { pcr_pid, streams })
}

/// Builds the normalized PAT/PMT TS packets emitted on the spliced
/// output. Table version starts at 0 and is bumped only when the
/// active source's stream types change.
#[derive(Debug, Clone)]
pub struct PSIBuilder {
    crc: Crc32Mpeg2,
    program_number: u16,
    version: u8,
    video_stream_type: u8,
    audio_stream_type: Option<u8>,
    pat_cc: u8,
    pmt_cc: u8,
}

impl PSIBuilder {
    /// Creates a builder for the given program with its initial stream
    /// types. `audio_stream_type` is `None` if the program carries no
    /// audio elementary stream.
    pub fn new(program_number: u16, video_stream_type: u8, audio_stream_type: Option<u8>) -> Self {
        Self {
            crc: Crc32Mpeg2::new(),
            program_number,
            version: 0,
            video_stream_type,
            audio_stream_type,
            pat_cc: 0,
            pmt_cc: 0,
        }
    }

    /// Updates the declared stream types, bumping the table version
    /// (mod 32) only if they actually changed.
    pub fn set_stream_types(&mut self, video_stream_type: u8, audio_stream_type: Option<u8>) {
        if video_stream_type != self.video_stream_type || audio_stream_type != self.audio_stream_type
        {
            self.video_stream_type = video_stream_type;
            self.audio_stream_type = audio_stream_type;
            self.version = (self.version + 1) & 0x1f;
        }
    }

    /// Builds one PAT TS packet naming the normalized PMT PID. Each call
    /// advances PID 0's continuity counter, since every payload-bearing
    /// packet on a PID must do so, PSI reinjection included.
    pub fn build_pat(&mut self) -> [u8; TS_PACKET_SIZE] {
        let mut out = [0xffu8; TS_PACKET_SIZE];
        let cc = self.pat_cc;
        self.pat_cc = (self.pat_cc + 1) & 0x0f;
        write_header(&mut out, 0, true, false, cc);
        let mut buf = BytesMut::with_capacity(TS_PACKET_SIZE);
        buf.put_u8(0); // pointer field
        buf.put_u8(TABLE_ID_PAT);

        let mut section = BytesMut::new();
        section.put_u16(self.program_number);
        section.put_u16(OUT_PID_PMT & 0x1fff | 7 << 13);
        let section_length = section.len() + 5 + 4;

        buf.put_u16(0xb000 | (section_length as u16 & 0x0fff));
        buf.put_u16(1); // transport stream id
        buf.put_u8(0xc1 | ((self.version & 0x1f) << 1)); // version, current_next=1
        buf.put_u8(0); // section number
        buf.put_u8(0); // last section number
        buf.extend_from_slice(&section);

        let crc = self.crc.calculate(&buf[1..]);
        buf.put_u32(crc);

        write_section(&mut out, &buf);
        out
    }

    /// Builds one PMT TS packet declaring `pcr_pid` = normalized video
    /// PID, video on [`OUT_PID_VIDEO`], and audio on [`OUT_PID_AUDIO`]
    /// when this program carries audio. Each call advances PID 4096's
    /// continuity counter.
    pub fn build_pmt(&mut self) -> [u8; TS_PACKET_SIZE] {
        let mut out = [0xffu8; TS_PACKET_SIZE];
        let cc = self.pmt_cc;
        self.pmt_cc = (self.pmt_cc + 1) & 0x0f;
        write_header(&mut out, OUT_PID_PMT, true, false, cc);
        let mut buf = BytesMut::with_capacity(TS_PACKET_SIZE);
        buf.put_u8(0); // pointer field
        buf.put_u8(TABLE_ID_PMT);

        let mut section = BytesMut::new();
        section.put_u16(OUT_PID_VIDEO & 0x1fff | 7 << 13); // pcr_pid
        section.put_u16(0xf000); // program info length = 0
        section.put_u8(self.video_stream_type);
        section.put_u16(OUT_PID_VIDEO & 0x1fff | 7 << 13);
        section.put_u16(0xf000); // es info length = 0
        if let Some(audio_type) = self.audio_stream_type {
            section.put_u8(audio_type);
            section.put_u16(OUT_PID_AUDIO & 0x1fff | 7 << 13);
            section.put_u16(0xf000);
        }
        let section_length = section.len() + 5 + 4;

        buf.put_u16(0xb000 | (section_length as u16 & 0x0fff));
        buf.put_u16(self.program_number);
        buf.put_u8(0xc1 | ((self.version & 0x1f) << 1));
        buf.put_u8(0);
        buf.put_u8(0);
        buf.extend_from_slice(&section);

        let crc = self.crc.calculate(&buf[1..]);
        buf.put_u32(crc);

        write_section(&mut out, &buf);
        out
    }
}

/// Writes a PSI section (pointer field onward, CRC included) into a
/// freshly-headered TS packet, stuffing the remainder with `0xFF`.
fn write_section(out: &mut [u8; TS_PACKET_SIZE], section: &BytesMut) {
    let start = 4;
    out[start..start + section.len()].copy_from_slice(section);
    for b in out.iter_mut().skip(start + section.len()) {
        *b = 0xff;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pat_declares_normalized_pmt_pid() {
        let mut builder = PSIBuilder::new(1, STREAM_TYPE_H264, Some(STREAM_TYPE_AAC));
        let pat = builder.build_pat();
        assert_eq!(pat[0], 0x47);
        let parsed = parse_pat_section(&pat[5..]).unwrap();
        assert_eq!(parsed.pmt_pid, OUT_PID_PMT);
    }

    #[test]
    fn pmt_declares_normalized_pids() {
        let mut builder = PSIBuilder::new(1, STREAM_TYPE_H264, Some(STREAM_TYPE_AAC));
        let pmt = builder.build_pmt();
        let parsed = parse_pmt_section(&pmt[5..]).unwrap();
        assert_eq!(parsed.pcr_pid, OUT_PID_VIDEO);
        assert_eq!(parsed.video(), Some((OUT_PID_VIDEO, STREAM_TYPE_H264)));
        assert_eq!(parsed.audio(), Some((OUT_PID_AUDIO, STREAM_TYPE_AAC)));
    }

    #[test]
    fn pmt_without_audio_omits_audio_stream() {
        let mut builder = PSIBuilder::new(1, STREAM_TYPE_H264, None);
        let pmt = builder.build_pmt();
        let parsed = parse_pmt_section(&pmt[5..]).unwrap();
        assert_eq!(parsed.audio(), None);
        assert_eq!(parsed.streams.len(), 1);
    }

    #[test]
    fn version_bumps_only_on_change() {
        let mut builder = PSIBuilder::new(1, STREAM_TYPE_H264, Some(STREAM_TYPE_AAC));
        builder.set_stream_types(STREAM_TYPE_H264, Some(STREAM_TYPE_AAC));
        assert_eq!(builder.version, 0);
        builder.set_stream_types(STREAM_TYPE_H264, None);
        assert_eq!(builder.version, 1);
    }

    #[test]
    fn rejects_truncated_pat_section() {
        let data = [TABLE_ID_PAT, 0x00, 0x02];
        assert!(parse_pat_section(&data).is_err());
    }
}
