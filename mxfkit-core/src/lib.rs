//! Core KLV primitives for MXF (Material eXchange Format) files
//!
//! Everything inside an MXF file is a KLV triplet:
//! - Key: a 16-byte SMPTE Universal Label
//! - Length: a BER-encoded byte count
//! - Value: the payload
//!
//! This crate provides the building blocks shared by the rest of the
//! `mxfkit` workspace:
//!
//! - [`UniversalLabel`] with version-byte-insensitive comparison and the
//!   well-known SMPTE labels
//! - BER length encoding/decoding, including fixed-size forms used when a
//!   length must be patched after the value is written
//! - [`Klv`] and [`KlvReader`] for triplet I/O
//! - Local-set (2-byte tag / 2-byte length) helpers used by index table
//!   segments and other metadata sets
//! - [`Rational`] for edit rates and sample rates
//!
//! # Example
//!
//! ```
//! use mxfkit_core::{Klv, KlvReader, ul::labels};
//!
//! let klv = Klv::new(labels::KLV_FILL, vec![0u8; 8]);
//! let mut buffer = Vec::new();
//! klv.write(&mut buffer).unwrap();
//!
//! let mut reader = KlvReader::new(&buffer);
//! let parsed = reader.read_klv().unwrap().unwrap();
//! assert_eq!(parsed.value.len(), 8);
//! ```

mod error;
pub mod klv;
mod rational;
pub mod ul;

pub use error::{KlvError, Result};
pub use klv::{
    ber_length_size, read_ber, read_ber_slice, write_ber, Klv, KlvReader, FAST_CLIP_LENGTH,
};
pub use rational::Rational;
pub use ul::{GcElementKind, UniversalLabel, UL};
