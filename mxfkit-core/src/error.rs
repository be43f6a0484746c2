//! Error types for KLV-level operations

use std::io;
use thiserror::Error;

/// Result type for KLV operations
pub type Result<T> = std::result::Result<T, KlvError>;

/// Errors raised by the KLV, BER and local-set primitives
#[derive(Error, Debug)]
pub enum KlvError {
    /// I/O error while reading or writing
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Input ended inside a key, length or value
    #[error("truncated input: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required to complete the read
        needed: usize,
        /// Bytes actually available
        available: usize,
    },

    /// A long-form BER length claimed more than 8 payload bytes
    #[error("BER length with {0} payload bytes (maximum is 8)")]
    OversizeBer(usize),

    /// A fixed-size BER encoding cannot hold the requested value
    #[error("BER size of {size} bytes cannot encode value {value}")]
    BerTooShort {
        /// The value that was to be encoded
        value: u64,
        /// The requested total encoding size
        size: usize,
    },

    /// A local-set item claimed a length past the end of the set body
    #[error("local set item {tag:#06x} overruns the set body")]
    LocalSetOverrun {
        /// Tag of the offending item
        tag: u16,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = KlvError::Truncated {
            needed: 16,
            available: 3,
        };
        assert!(err.to_string().contains("16"));

        let err = KlvError::OversizeBer(9);
        assert!(err.to_string().contains('9'));

        let err = KlvError::BerTooShort { value: 300, size: 1 };
        assert!(err.to_string().contains("300"));
    }
}
