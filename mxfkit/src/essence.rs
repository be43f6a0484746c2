//! Essence source and sub-parser abstractions
//!
//! An [`EssenceSource`] is a lazy byte source with per-edit-unit
//! semantics: it yields one wrapping unit at a time (a frame for frame
//! wrapping, the whole clip for clip wrapping) and reports positions in
//! edit units. An [`EssenceSubParser`] identifies a raw essence
//! bit-stream, derives a descriptor, enumerates the wrappings it can
//! produce and scans the stream one wrapping unit at a time.

use crate::index_manager::SharedIndexManager;
use mxfkit_core::{Rational, UniversalLabel, UL};
use std::collections::HashMap;
use std::io::{Read, Seek};
use std::sync::{Mutex, OnceLock};

/// Object-safe alias for seekable byte sources handed to sub-parsers
pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek + ?Sized> ReadSeek for T {}

/// How essence is divided into KLVs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapKind {
    /// One KLV per edit unit
    Frame,
    /// One KLV for the whole clip
    Clip,
    /// One KLV per line (uncommon)
    Line,
    /// Source-specific wrapping
    Other,
}

/// One wrapping an essence sub-parser can produce
#[derive(Debug, Clone)]
pub struct WrappingOption {
    /// Short name, unique within the sub-parser ("frame", "clip")
    pub name: &'static str,
    /// Human-readable description
    pub description: String,
    /// UL identifying this wrapping
    pub wrapping_ul: UniversalLabel,
    /// Generic Container essence type byte
    pub gc_essence_type: u8,
    /// Generic Container element type byte
    pub gc_element_type: u8,
    /// The kind of wrapping
    pub kind: WrapKind,
    /// True if this wrapping may run at a non-native edit rate
    pub can_slave: bool,
    /// True if the handler can produce VBR index data for this wrapping
    pub can_index: bool,
    /// True if this wrapping uses a CBR index table
    pub cbr_index: bool,
    /// Forced BER length size for essence KLVs, 0 for automatic
    pub ber_size: usize,
    /// Bytes per edit unit when constant, else 0
    pub bytes_per_edit_unit: u32,
}

/// Picture essence parameters extracted during identification
///
/// A structured subset of the MXF picture descriptor, sufficient for the
/// wrapping application to build file metadata from.
#[derive(Debug, Clone, Default)]
pub struct VideoDescriptor {
    /// Sample (edit) rate
    pub sample_rate: Rational,
    /// 0 = progressive (full frame), 1 = interlaced (separate fields)
    pub frame_layout: u8,
    /// Stored width in samples
    pub stored_width: u32,
    /// Stored height in lines (per field for interlaced)
    pub stored_height: u32,
    /// Display aspect ratio, if known
    pub aspect_ratio: Option<Rational>,
    /// First active line per field
    pub video_line_map: [i32; 2],
    /// Bits per component sample
    pub component_depth: u32,
    /// Horizontal chroma subsampling factor
    pub horizontal_subsampling: u32,
    /// Vertical chroma subsampling factor
    pub vertical_subsampling: u32,
    /// Colour siting code
    pub color_siting: u8,
    /// 1 = progressive frames, 2 = interlaced fields
    pub coded_content_type: u8,
    /// Low-delay coding in use
    pub low_delay: bool,
    /// Bit rate in bits per second, if signalled
    pub bit_rate: Option<u64>,
    /// MPEG profile-and-level byte (0 when unknown)
    pub profile_and_level: u8,
    /// Picture essence coding label, if one fits the profile
    pub picture_essence_coding: Option<UniversalLabel>,
}

/// Description of one essence stream found in a file
#[derive(Debug, Clone)]
pub struct EssenceStreamDescriptor {
    /// Stream ID within the file (0 for single-stream files)
    pub id: u32,
    /// Human-readable description
    pub description: String,
    /// UUID (or swapped UL) identifying the source format
    pub source_format: [u8; 16],
    /// Video parameters, for picture essence
    pub video: Option<VideoDescriptor>,
    /// Start timecode in edit units, when the essence carries one
    pub start_timecode: i64,
}

/// A lazy source of essence data with per-edit-unit semantics
pub trait EssenceSource {
    /// Size in bytes of the next installment of essence data
    ///
    /// Zero means no more data is available from this source.
    fn next_data_size(&mut self) -> usize;

    /// Get the next installment of essence data
    ///
    /// Returns at most one wrapping unit, further limited to `max_size`
    /// bytes when non-zero (a wrapping unit larger than the limit is
    /// returned across several calls). `None` means the source is
    /// exhausted; an empty chunk means more data is expected but not yet
    /// available, and the caller must yield without advancing.
    fn next_data(&mut self, size: usize, max_size: usize) -> Option<Vec<u8>>;

    /// Did the previous call to `next_data` finish a wrapping unit?
    fn end_of_item(&self) -> bool;

    /// Is the source exhausted?
    fn end_of_data(&self) -> bool;

    /// Generic Container essence type byte for this essence
    fn gc_essence_type(&self) -> u8;

    /// Generic Container element type byte for this essence
    fn gc_element_type(&self) -> u8;

    /// The edit rate of this wrapping of the essence
    fn edit_rate(&self) -> Rational;

    /// Current position in edit-rate units from the start of the stream
    fn current_position(&self) -> i64;

    /// Bytes per edit unit at the given KAG, or 0 when not constant
    fn bytes_per_edit_unit(&mut self, _kag_size: u32) -> u32 {
        0
    }

    /// Can this source feed an index manager?
    fn can_index(&self) -> bool {
        false
    }

    /// Attach the index manager this source should feed
    fn set_index_manager(&mut self, _manager: SharedIndexManager, _stream_id: usize) {}

    /// The index manager sub-stream ID previously attached
    fn index_stream_id(&self) -> usize {
        0
    }

    /// Preferred BER length size for essence KLVs, 0 for automatic
    fn ber_size(&self) -> usize {
        0
    }

    /// Was the most recent wrapping unit an edit point (safe to cut)?
    fn is_edit_point(&self) -> bool {
        true
    }

    /// Set a source-specific option; true if recognised
    fn set_option(&mut self, _name: &str, _value: i64) -> bool {
        false
    }

    /// Relative write order: 0 for the default interleave position,
    /// otherwise the position for a relative write-order request
    fn relative_write_order(&self) -> i32 {
        0
    }

    /// Essence type the relative write order is anchored to
    fn relative_write_order_type(&self) -> u8 {
        0
    }

    /// Edit units of pre-charge this source will emit before its first
    /// full-quality output unit
    fn precharge_size(&mut self) -> i64 {
        0
    }

    /// Override the essence element key for this source
    fn set_key(&mut self, _key: UniversalLabel, _non_gc: bool) {}

    /// The overridden key, if any
    fn key_override(&self) -> Option<(UniversalLabel, bool)> {
        None
    }

    /// Name for log messages
    fn name(&self) -> &str {
        "essence source"
    }
}

/// A parser able to identify and scan one family of raw essence streams
///
/// The parser holds scan state but not the file: the open file is passed
/// into each call, which lets one parser serve a sequence of files.
pub trait EssenceSubParser {
    /// Name of this parser for diagnostics
    fn name(&self) -> &'static str;

    /// File extensions this parser is likely to handle
    fn handled_extensions(&self) -> &'static [&'static str];

    /// Examine an open file and return descriptors for the essence
    /// streams found, or an empty list if the file is not recognised
    fn identify_essence(
        &mut self,
        file: &mut dyn ReadSeek,
    ) -> std::io::Result<Vec<EssenceStreamDescriptor>>;

    /// Wrapping options available for a stream identified by this parser,
    /// in preference order
    fn identify_wrapping_options(
        &mut self,
        file: &mut dyn ReadSeek,
        descriptor: &EssenceStreamDescriptor,
    ) -> Vec<WrappingOption>;

    /// Select a wrapping option for future reads
    fn use_wrapping(&mut self, stream: u32, wrapping: &WrappingOption);

    /// The native edit rate of the identified essence
    fn native_edit_rate(&self) -> Rational;

    /// Request a non-native edit rate; false if unsupported
    fn set_edit_rate(&mut self, rate: Rational) -> bool;

    /// The selected edit rate
    fn edit_rate(&self) -> Rational;

    /// Current position in selected-edit-rate units (0 if unknown)
    fn current_position(&self) -> i64;

    /// Scan the stream and return the byte size of the next `count`
    /// wrapping units, caching the result until it is consumed
    fn read_internal(
        &mut self,
        file: &mut dyn ReadSeek,
        stream: u32,
        count: u64,
    ) -> std::io::Result<usize>;

    /// Read the next `count` wrapping units
    fn read(
        &mut self,
        file: &mut dyn ReadSeek,
        stream: u32,
        count: u64,
    ) -> std::io::Result<Vec<u8>>;

    /// Attach an index manager to receive per-edit-unit facts
    fn set_index_manager(&mut self, manager: SharedIndexManager, stream_id: usize);

    /// Set a parser-specific option; true if recognised
    fn set_option(&mut self, _name: &str, _value: i64) -> bool {
        false
    }

    /// Reset scan state ready for a new file of the same format
    fn reset(&mut self);
}

/// Factory producing a boxed sub-parser
pub type ParserFactory = fn() -> Box<dyn EssenceSubParser>;

fn registry() -> &'static Mutex<HashMap<String, ParserFactory>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, ParserFactory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register a sub-parser factory for each extension it handles
///
/// Registration is process-wide and normally done once at start-up.
pub fn register_parser(factory: ParserFactory) {
    let parser = factory();
    let mut map = registry().lock().expect("parser registry poisoned");
    for extension in parser.handled_extensions() {
        map.insert(extension.to_ascii_uppercase(), factory);
    }
}

/// Find a parser factory for a file extension (case-insensitive)
pub fn parser_for_extension(extension: &str) -> Option<ParserFactory> {
    let map = registry().lock().expect("parser registry poisoned");
    map.get(&extension.to_ascii_uppercase()).copied()
}

/// Build the standard GC essence element key
pub fn essence_element_key(item: u8, count: u8, element_type: u8, number: u8) -> UL {
    let mut key = mxfkit_core::ul::labels::GC_ESSENCE_PREFIX;
    key[7] = 0x01;
    key[12] = item;
    key[13] = count;
    key[14] = element_type;
    key[15] = number;
    key
}
