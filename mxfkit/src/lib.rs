//! # mxfkit
//!
//! Reading and writing of MXF (Material eXchange Format) files, the
//! SMPTE 377M container used for professional audio/video exchange.
//!
//! The crate centres on three subsystems:
//!
//! - **Index tables** ([`IndexTable`], [`IndexManager`]): building,
//!   serialising and looking up random-access index tables for CBR and
//!   VBR essence, including temporal reordering and multi-slice
//!   layouts.
//! - **Essence parsing** ([`EssenceSubParser`], [`Mpeg2VesParser`]):
//!   identifying raw essence bit-streams, deriving descriptors,
//!   enumerating wrapping options and scanning streams one edit unit at
//!   a time while feeding the index engine.
//! - **Body multiplexing** ([`BodyWriter`], [`BodyReader`]):
//!   interleaving essence streams into Generic Container partitions
//!   with the requested index table placement, and demultiplexing KLVs
//!   back out to per-track handlers.
//!
//! # Example
//!
//! ```no_run
//! use mxfkit::{BodyStream, BodyWriter, Features, StreamIndexFlags, StreamWrap};
//! use mxfkit::{FileParser, Mpeg2VesParser, SequentialEssenceSource};
//! use std::cell::RefCell;
//! use std::fs::File;
//! use std::rc::Rc;
//!
//! let input = File::open("video.m2v").unwrap();
//! let mut parser = FileParser::new(Box::new(Mpeg2VesParser::new()), vec![input]);
//!
//! let descriptors = parser.identify().unwrap();
//! let wrappings = parser.wrapping_options(&descriptors[0]);
//! parser.select_wrapping(0, &wrappings[0]);
//!
//! let source = Rc::new(RefCell::new(SequentialEssenceSource::new(parser)));
//! let mut stream = BodyStream::new(1, source);
//! stream.set_index_sid(129);
//! stream.set_wrap(StreamWrap::Frame);
//! stream.set_index_flags(StreamIndexFlags::FULL_FOOTER);
//!
//! let output = File::create("video.mxf").unwrap();
//! let mut writer = BodyWriter::new(output, Features::default());
//! assert!(writer.add_stream(stream, 0));
//! writer.write_header(false, false).unwrap();
//! writer.write_body(0, 0).unwrap();
//! writer.write_footer(false, true).unwrap();
//! ```

mod body_reader;
mod body_writer;
mod config;
mod error;
mod essence;
mod gc_reader;
mod gc_writer;
mod index;
mod index_manager;
mod layout;
mod mpeg2_ves;
mod partition;
mod sources;

pub use body_reader::BodyReader;
pub use body_writer::{
    BodyStream, BodyWriter, PartitionHandler, StreamIndexFlags, StreamState, StreamWrap,
};
pub use config::Features;
pub use error::{MxfError, Result};
pub use essence::{
    essence_element_key, parser_for_extension, register_parser, EssenceSource,
    EssenceStreamDescriptor, EssenceSubParser, ParserFactory, ReadSeek, VideoDescriptor,
    WrapKind, WrappingOption,
};
pub use gc_reader::{
    GcReadHandler, GcReader, KlvInfo, ReaderContext, ReaderUnit, SharedReadHandler,
};
pub use gc_writer::{write_filler, GcStreamId, GcWriter, SharedEssenceSource};
pub use index::{
    DeltaEntry, EntryShape, IndexPos, IndexSegment, IndexTable, INDEX_LOWEST,
    KEY_LOCATION_UNKNOWN,
};
pub use index_manager::{IndexManager, SharedIndexManager};
pub use layout::{GcLayout, LayoutOffer, LayoutPlace};
pub use mpeg2_ves::{Mpeg2VesParser, Mpeg2VesSource, MPEG2_VES_FORMAT};
pub use partition::{
    locate_first_partition, PartitionCompleteness, PartitionKind, PartitionPack,
    PartitionStatus, RandomIndexPack, RipEntry, MAX_RUN_IN,
};
pub use sources::{FileParser, RangedEssenceSource, SequentialEssenceSource};

// The wire types these modules share
pub use mxfkit_core::{Rational, UniversalLabel, UL};
