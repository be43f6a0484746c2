//! Error types for MXF container operations

use mxfkit_core::KlvError;
use std::io;
use thiserror::Error;

/// Result type for MXF operations
pub type Result<T> = std::result::Result<T, MxfError>;

/// Errors that can occur while reading or writing MXF structures
#[derive(Error, Debug)]
pub enum MxfError {
    /// I/O error during read or write
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// KLV or BER level error
    #[error("KLV error: {0}")]
    Klv(#[from] KlvError),

    /// Entry or array arity does not match the table layout
    #[error("shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// The size or count the table requires
        expected: usize,
        /// The size or count that was supplied
        actual: usize,
    },

    /// Adding an entry would burst the 2-byte local set length limit
    #[error("index segment full: cannot hold another {entry_size}-byte entry")]
    IndexSegmentFull {
        /// Size of the entry that did not fit
        entry_size: usize,
    },

    /// An index entry already exists for this edit unit
    #[error("index entry for edit unit {edit_unit} already exists; replacement is not supported")]
    EntryReplaceUnsupported {
        /// The edit unit that was offered twice
        edit_unit: i64,
    },

    /// Required filler exceeds the largest representable fill KLV
    #[error("filler of {needed} bytes exceeds the maximum fill value length")]
    FillerTooLarge {
        /// Bytes that were required
        needed: u64,
    },

    /// The requested edit rate is not supported by this wrapping
    #[error("edit rate {num}/{den} is not supported by this essence")]
    EditRateUnsupported {
        /// Requested numerator
        num: i32,
        /// Requested denominator
        den: i32,
    },

    /// The stream could not be identified as a supported essence type
    #[error("essence stream not identified: {0}")]
    NotIdentified(&'static str),

    /// A BodySID was registered twice with the same writer
    #[error("BodySID {0} is already registered")]
    DuplicateBodySid(u32),

    /// The index manager layout is frozen
    #[error("index manager format is fixed; cannot add sub-streams")]
    FormatFixed,

    /// Structural problem in a parsed file
    #[error("invalid MXF structure: {0}")]
    InvalidStructure(String),

    /// Operation requires state the object is not in
    #[error("operation invalid in current state: {0}")]
    BadState(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = MxfError::ShapeMismatch {
            expected: 3,
            actual: 1,
        };
        assert!(err.to_string().contains('3'));

        let err = MxfError::EntryReplaceUnsupported { edit_unit: 42 };
        assert!(err.to_string().contains("42"));

        let err = MxfError::DuplicateBodySid(7);
        assert!(err.to_string().contains('7'));
    }
}
