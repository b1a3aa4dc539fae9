//! PES (Packetized Elementary Stream) header inspection and in-place
//! PTS/DTS rewriting.
//!
//! The splicer never reallocates a PES header: it rewrites the 5-byte
//! PTS/DTS fields that are already present in the source packet,
//! preserving marker bits and header_data_length.

use crate::error::{RelayError, Result};
use crate::ts::packet::{write_header, TS_HEADER_SIZE, TS_PACKET_SIZE};

/// The 3-byte PES packet start code prefix.
pub const PES_START_CODE: [u8; 3] = [0x00, 0x00, 0x01];

/// Stream ID used for the synthesized, injected SPS/PPS PES packet —
/// the conventional first-video-stream ID.
pub const PES_STREAM_ID_VIDEO: u8 = 0xe0;

/// Parsed view of a PES header's fixed fields and the byte offsets (within
/// the same buffer `parse_pes_header` was given) of its optional PTS/DTS
/// fields and elementary stream payload.
#[derive(Debug, Clone, Copy)]
pub struct PesHeaderInfo {
    /// Stream ID byte (e.g. `0xE0` for the first video stream).
    pub stream_id: u8,
    /// Decoded 33-bit presentation timestamp, if present.
    pub pts: Option<u64>,
    /// Decoded 33-bit decode timestamp, if present.
    pub dts: Option<u64>,
    pts_offset: Option<usize>,
    dts_offset: Option<usize>,
    /// Offset at which elementary stream data begins, after the fixed
    /// header and any optional fields named by `header_data_length`.
    pub es_offset: usize,
}

/// Parses a PES header starting at `data[0]`. `data` should be the
/// payload of the TS packet that carries `PUSI` for this PES packet.
///
/// # Errors
///
/// Returns `MalformedPacket` if the start code is wrong or a declared
/// field would run past `data`'s end.
pub fn parse_pes_header(data: &[u8]) -> Result<PesHeaderInfo> {
    if data.len() < 9 {
        return Err(RelayError::MalformedPacket("PES header too short".into()));
    }
    if data[0..3] != PES_START_CODE {
        return Err(RelayError::MalformedPacket(format!(
            "bad PES start code {:02x?}",
            &data[0..3]
        )));
    }
    let stream_id = data[3];
    let pts_dts_flags = (data[7] & 0xc0) >> 6;
    let header_data_length = data[8] as usize;
    if data.len() < 9 + header_data_length {
        return Err(RelayError::MalformedPacket(
            "PES header_data_length overruns packet".into(),
        ));
    }

    let (pts, pts_offset) = if pts_dts_flags & 0x02 != 0 {
        if data.len() < 14 {
            return Err(RelayError::MalformedPacket(
                "PES PTS field truncated".into(),
            ));
        }
        (Some(read_timestamp(&data[9..14])), Some(9))
    } else {
        (None, None)
    };

    let (dts, dts_offset) = if pts_dts_flags == 0x03 {
        if data.len() < 19 {
            return Err(RelayError::MalformedPacket(
                "PES DTS field truncated".into(),
            ));
        }
        (Some(read_timestamp(&data[14..19])), Some(14))
    } else {
        (None, None)
    };

    Ok(PesHeaderInfo {
        stream_id,
        pts,
        dts,
        pts_offset,
        dts_offset,
        es_offset: 9 + header_data_length,
    })
}

impl PesHeaderInfo {
    /// Rewrites the PTS field in place, preserving marker bits.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPacket` if this header carries no PTS field.
    pub fn set_pts(&self, buf: &mut [u8], pts: u64) -> Result<()> {
        let off = self
            .pts_offset
            .ok_or_else(|| RelayError::MalformedPacket("PES header carries no PTS field".into()))?;
        let marker = if self.dts_offset.is_some() { 0x30 } else { 0x20 };
        write_timestamp(&mut buf[off..off + 5], marker, pts);
        Ok(())
    }

    /// Rewrites the DTS field in place, preserving marker bits.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPacket` if this header carries no DTS field.
    pub fn set_dts(&self, buf: &mut [u8], dts: u64) -> Result<()> {
        let off = self
            .dts_offset
            .ok_or_else(|| RelayError::MalformedPacket("PES header carries no DTS field".into()))?;
        write_timestamp(&mut buf[off..off + 5], 0x10, dts);
        Ok(())
    }
}

/// Builds a fresh PES header (no DTS) carrying `pts`, for the
/// synthesized SPS/PPS parameter-set PES packets injected ahead of a
/// segment's first IDR. Unlike [`PesHeaderInfo::set_pts`], this
/// fabricates a new header rather than rewriting one already present —
/// permitted here because injecting parameter sets is an explicit
/// splicing step, not a field rewrite on an existing source packet.
pub fn build_pes_header(stream_id: u8, pts: u64) -> Vec<u8> {
    let mut buf = vec![0x00, 0x00, 0x01, stream_id, 0x00, 0x00, 0x80, 0x80, 0x05];
    let mut ts = [0u8; 5];
    write_timestamp(&mut ts, 0x20, pts);
    buf.extend_from_slice(&ts);
    buf
}

/// Splits `pes_bytes` (a complete PES packet: header plus payload) across
/// one or more 188-byte TS packets on `pid`, setting PUSI on the first
/// packet and padding the final packet with a stuffing adaptation field
/// so every packet is exactly [`TS_PACKET_SIZE`] bytes — never a trailing
/// run of `0xFF` inside the PES header itself, since the split only pads
/// after all of `pes_bytes` has been placed. `next_cc` is called once per
/// packet to obtain its continuity counter.
pub fn pack_pes_into_ts(pid: u16, pes_bytes: &[u8], mut next_cc: impl FnMut() -> u8) -> Vec<[u8; TS_PACKET_SIZE]> {
    const MAX_PAYLOAD: usize = TS_PACKET_SIZE - TS_HEADER_SIZE;
    let mut out = Vec::new();
    let mut offset = 0;
    let mut first = true;
    while offset < pes_bytes.len() {
        let remaining = pes_bytes.len() - offset;
        let take = remaining.min(MAX_PAYLOAD);
        let is_last = offset + take == pes_bytes.len();
        let use_stuffing = is_last && take < MAX_PAYLOAD;
        let mut packet = [0xffu8; TS_PACKET_SIZE];

        if use_stuffing {
            let adaptation_length = MAX_PAYLOAD - 1 - take;
            write_header(&mut packet, pid, first, true, next_cc());
            packet[4] = adaptation_length as u8;
            let mut pos = 5;
            if adaptation_length > 0 {
                packet[5] = 0x00;
                pos = 6;
                for b in packet.iter_mut().skip(pos).take(adaptation_length - 1) {
                    *b = 0xff;
                }
                pos += adaptation_length - 1;
            }
            packet[pos..pos + take].copy_from_slice(&pes_bytes[offset..offset + take]);
        } else {
            write_header(&mut packet, pid, first, false, next_cc());
            packet[TS_HEADER_SIZE..TS_HEADER_SIZE + take]
                .copy_from_slice(&pes_bytes[offset..offset + take]);
        }

        out.push(packet);
        offset += take;
        first = false;
    }
    out
}

/// Decodes a 33-bit PTS/DTS value from its 5-byte marker-bit encoding.
fn read_timestamp(b: &[u8]) -> u64 {
    let high3 = ((b[0] >> 1) & 0x07) as u64;
    let mid15 = (((b[1] as u64) << 8 | b[2] as u64) >> 1) & 0x7fff;
    let low15 = (((b[3] as u64) << 8 | b[4] as u64) >> 1) & 0x7fff;
    (high3 << 30) | (mid15 << 15) | low15
}

/// Encodes a 33-bit PTS/DTS value into its 5-byte marker-bit encoding.
/// `marker` is the 4-bit field code (`0010`/`0011`/`0001`) shifted into
/// the top nibble of the first byte.
fn write_timestamp(buf: &mut [u8], marker: u8, ts: u64) {
    let pts = ts & 0x1_ffff_ffff;
    buf[0] = marker | (((pts >> 29) & 0x0e) as u8) | 0x01;
    let mid = (((pts >> 14) & 0xfffe) | 0x01) as u16;
    buf[1] = (mid >> 8) as u8;
    buf[2] = mid as u8;
    let low = (((pts << 1) & 0xfffe) | 0x01) as u16;
    buf[3] = (low >> 8) as u8;
    buf[4] = low as u8;
}
