//! Codec-level bitstream helpers.
//!
//! Scoped to exactly what the splicer needs: finding NAL unit
//! boundaries and types in an H.264 Annex-B elementary stream. No
//! decoder, no SPS/PPS semantic parsing, no H.265/AAC support.

pub mod h264;
