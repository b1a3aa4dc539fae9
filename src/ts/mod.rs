//! MPEG Transport Stream packet, PSI, and PES handling.
//!
//! This module provides structural access only: parsing and in-place
//! rewriting of packet fields, PSI sections, and PES headers. It holds
//! no notion of sources, splicing, or scheduling — that lives in
//! [`crate::source`], [`crate::splicer`], and [`crate::output`].

pub mod packet;
pub mod pes;
pub mod psi;

pub use packet::{AdaptationField, TSPacketCodec, OUT_PID_AUDIO, OUT_PID_PAT, OUT_PID_PMT, OUT_PID_VIDEO, TS_PACKET_SIZE};
pub use pes::{parse_pes_header, PesHeaderInfo};
pub use psi::{parse_pat_section, parse_pmt_section, ParsedPat, ParsedPmt, PSIBuilder, STREAM_TYPE_AAC, STREAM_TYPE_H264};
