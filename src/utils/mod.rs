//! # Utility Functions and Types
//!
//! Common utilities shared across the splicer's components.
//!
//! ## CRC Calculation
//!
//! The crc module provides MPEG-2 CRC32 calculation, used by the PSI
//! builder to checksum PAT/PMT sections:
//!
//! ```rust
//! use ts_relay::utils::Crc32Mpeg2;
//!
//! let crc = Crc32Mpeg2::new();
//! let data = b"Hello, world!";
//! let checksum = crc.calculate(data);
//! println!("CRC32: {:08x}", checksum);
//! ```

/// CRC calculation implementations
pub mod crc;

// Re-export commonly used types
pub use crc::Crc32Mpeg2;
