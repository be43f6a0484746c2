//! # mxfkit-mpeg2
//!
//! MPEG-2 video elementary stream header parsing.
//!
//! This crate understands just enough of an MPEG-2 (and MPEG-1) video
//! elementary stream to support essence identification and wrapping:
//! sequence headers, sequence extensions, GOP headers and picture headers.
//! It does not decode picture data.
//!
//! ## Example
//!
//! ```
//! use mxfkit_mpeg2::parse_sequence_header;
//!
//! // 720x576 @ 25fps sequence header
//! let data = [
//!     0x00, 0x00, 0x01, 0xB3,
//!     0x2D, 0x02, 0x40, 0x23,
//!     0xFF, 0xFF, 0xE0, 0x00,
//! ];
//! let seq = parse_sequence_header(&data).unwrap();
//! assert_eq!(seq.horizontal_size, 720);
//! assert_eq!(seq.vertical_size, 576);
//! ```

mod parser;
mod types;

pub use parser::{
    find_start_code, parse_gop_header, parse_picture_header, parse_sequence_extension,
    parse_sequence_header, BitReader,
};
pub use types::{
    AspectRatioCode, ChromaFormat, FrameRateCode, GopHeader, PictureCodingType, PictureHeader,
    SequenceExtension, SequenceHeader,
};

use thiserror::Error;

/// Sequence header start code suffix (`00 00 01 B3`)
pub const SEQUENCE_HEADER_CODE: u8 = 0xB3;
/// Extension start code suffix (`00 00 01 B5`)
pub const EXTENSION_START_CODE: u8 = 0xB5;
/// Group-of-pictures start code suffix (`00 00 01 B8`)
pub const GOP_START_CODE: u8 = 0xB8;
/// Picture start code suffix (`00 00 01 00`)
pub const PICTURE_START_CODE: u8 = 0x00;
/// Sequence end code suffix
pub const SEQUENCE_END_CODE: u8 = 0xB7;

/// Errors raised while parsing MPEG-2 stream headers
#[derive(Error, Debug)]
pub enum Mpeg2Error {
    /// Data does not begin with the expected start code
    #[error("expected start code 0x000001{expected:02X}, found {found:#010x}")]
    WrongStartCode {
        /// The start code suffix that was required
        expected: u8,
        /// The 32-bit window actually seen
        found: u32,
    },

    /// Not enough bytes to hold the structure
    #[error("insufficient data: need {needed} bytes, have {available}")]
    InsufficientData {
        /// Bytes needed
        needed: usize,
        /// Bytes available
        available: usize,
    },

    /// A reserved or forbidden field value was encountered
    #[error("invalid {field} value {value}")]
    InvalidField {
        /// Field name
        field: &'static str,
        /// Offending value
        value: u32,
    },
}

/// Result type for MPEG-2 parsing
pub type Result<T> = std::result::Result<T, Mpeg2Error>;
