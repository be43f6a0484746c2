//! Body multiplexing: partitions, index placement and essence interleave
//!
//! A [`BodyStream`] is the long-lived record of one essence container:
//! its master source, sub-streams, index placement flags and write
//! state. The [`BodyWriter`] drives one or more body streams through the
//! file, writing partition packs, header metadata, index table segments
//! and essence in the right order.

use crate::config::Features;
use crate::error::{MxfError, Result};
use crate::essence::WrapKind;
use crate::gc_writer::{write_filler, GcStreamId, GcWriter, SharedEssenceSource};
use crate::index::INDEX_LOWEST;
use crate::index_manager::{IndexManager, SharedIndexManager};
use crate::partition::{PartitionKind, PartitionPack, RandomIndexPack};
use std::io::{Seek, Write};
use std::ops::BitOr;
use tracing::debug;

/// Index table placement flags for one stream
///
/// A stream may combine several placements (for example sprinkled body
/// segments plus a full table in the footer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamIndexFlags(pub u32);

impl StreamIndexFlags {
    /// No index table
    pub const NONE: Self = Self(0);
    /// Full VBR table in (or just before) the footer
    pub const FULL_FOOTER: Self = Self(1);
    /// Sparse VBR table in the footer covering listed edit units
    pub const SPARSE_FOOTER: Self = Self(2);
    /// VBR table sprinkled one chunk per body partition
    pub const SPRINKLED: Self = Self(4);
    /// Sprinkled chunks in isolated partitions after each body partition
    pub const SPRINKLED_ISOLATED: Self = Self(8);
    /// CBR table in the header
    pub const CBR_HEADER: Self = Self(16);
    /// CBR table in an isolated partition following the header
    pub const CBR_HEADER_ISOLATED: Self = Self(32);
    /// CBR table in the footer
    pub const CBR_FOOTER: Self = Self(64);
    /// CBR table in each body partition
    pub const CBR_BODY: Self = Self(128);
    /// CBR table in an isolated partition after each body partition
    pub const CBR_ISOLATED: Self = Self(256);
    /// CBR table in an isolated partition before each body partition
    pub const CBR_PRE_ISOLATED: Self = Self(512);

    /// Does this set share any flag with `other`?
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Is the set empty?
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for StreamIndexFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// The next action required for a body stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Nothing done yet
    Start,
    /// Write a header index table
    HeadIndex,
    /// Write an isolated index partition before the next body partition
    PreBodyIndex,
    /// Write a body partition carrying an index table
    BodyWithIndex,
    /// Write a body partition without an index table
    BodyNoIndex,
    /// Write an isolated index partition after a body partition
    PostBodyIndex,
    /// Write a footer index table
    FootIndex,
    /// All done
    Done,
}

/// Wrapping style of a body stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamWrap {
    /// One content package per edit unit
    Frame,
    /// The whole essence in one KLV
    Clip,
    /// Source-defined wrapping
    Other,
}

impl From<WrapKind> for StreamWrap {
    fn from(kind: WrapKind) -> Self {
        match kind {
            WrapKind::Frame => StreamWrap::Frame,
            WrapKind::Clip => StreamWrap::Clip,
            _ => StreamWrap::Other,
        }
    }
}

/// Long-lived state for one essence container written by a [`BodyWriter`]
pub struct BodyStream {
    body_sid: u32,
    index_sid: u32,
    sources: Vec<SharedEssenceSource>,
    state: StreamState,
    index_flags: StreamIndexFlags,
    wrap: StreamWrap,
    index_manager: Option<SharedIndexManager>,

    next_sprinkled: i64,
    prev_sprinkle_size: usize,
    precharge_size: i64,
    overall_essence_size: u64,
    end_of_stream: bool,

    /// Edit units to cover in a sparse footer index
    pub sparse_list: Vec<i64>,

    writer: Option<GcWriter>,
    stream_ids: Vec<GcStreamId>,
}

impl BodyStream {
    /// Create a stream for a master essence source
    pub fn new(body_sid: u32, source: SharedEssenceSource) -> Self {
        BodyStream {
            body_sid,
            index_sid: 0,
            sources: vec![source],
            state: StreamState::Start,
            index_flags: StreamIndexFlags::NONE,
            wrap: StreamWrap::Other,
            index_manager: None,
            next_sprinkled: 0,
            prev_sprinkle_size: 0,
            precharge_size: 0,
            overall_essence_size: 0,
            end_of_stream: false,
            sparse_list: Vec::new(),
            writer: None,
            stream_ids: Vec::new(),
        }
    }

    /// Add a sub-stream source (written in the same container)
    pub fn add_sub_stream(&mut self, source: SharedEssenceSource) {
        self.sources.push(source);
    }

    /// The master source
    pub fn master(&self) -> &SharedEssenceSource {
        &self.sources[0]
    }

    /// Number of sources including the master
    pub fn sub_stream_count(&self) -> usize {
        self.sources.len()
    }

    /// This stream's BodySID
    pub fn body_sid(&self) -> u32 {
        self.body_sid
    }

    /// Set the IndexSID used to index this stream
    pub fn set_index_sid(&mut self, index_sid: u32) {
        self.index_sid = index_sid;
    }

    /// The IndexSID of this stream
    pub fn index_sid(&self) -> u32 {
        self.index_sid
    }

    /// Replace the index placement flags
    pub fn set_index_flags(&mut self, flags: StreamIndexFlags) {
        self.index_flags = flags;
    }

    /// Add to the index placement flags
    pub fn add_index_flags(&mut self, flags: StreamIndexFlags) {
        self.index_flags = self.index_flags | flags;
    }

    /// The index placement flags
    pub fn index_flags(&self) -> StreamIndexFlags {
        self.index_flags
    }

    /// Set the wrapping style
    pub fn set_wrap(&mut self, wrap: StreamWrap) {
        self.wrap = wrap;
    }

    /// The wrapping style
    pub fn wrap(&self) -> StreamWrap {
        self.wrap
    }

    /// The stream's current state
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Has all essence been written?
    pub fn end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    /// First edit unit of the next sprinkled index segment
    pub fn next_sprinkled(&self) -> i64 {
        self.next_sprinkled
    }

    /// Size in bytes of the most recent sprinkled index chunk
    pub fn prev_sprinkle_size(&self) -> usize {
        self.prev_sprinkle_size
    }

    /// Edit units of pre-charge latched when writing began
    pub fn precharge_size(&self) -> i64 {
        self.precharge_size
    }

    /// Raw essence bytes written so far (keys, lengths and filler
    /// excluded)
    pub fn overall_essence_size(&self) -> u64 {
        self.overall_essence_size
    }

    /// The index manager for this stream, creating it on first use
    pub fn index_manager(&mut self) -> SharedIndexManager {
        if self.index_manager.is_none() {
            self.init_index_manager();
        }
        self.index_manager.clone().expect("manager initialised")
    }

    /// Build the index manager from the source layout
    ///
    /// The master stream declares reordering when it is VBR and can
    /// index (temporal reordering facts then gate entry completion);
    /// sub-streams contribute their per-edit-unit element sizes.
    fn init_index_manager(&mut self) {
        let mut sources = self.sources.iter();
        let master = sources.next().expect("streams have a master source");

        let (master_size, can_index) = {
            let mut master = master.borrow_mut();
            (master.bytes_per_edit_unit(1), master.can_index())
        };
        let pos_table_index = if master_size == 0 && can_index { -1 } else { 0 };

        let mut manager = IndexManager::new(pos_table_index, master_size);
        manager.body_sid = self.body_sid;
        manager.index_sid = self.index_sid;
        manager.edit_rate = self.sources[0].borrow().edit_rate();

        for source in sources {
            let size = source.borrow_mut().bytes_per_edit_unit(1);
            // The layout is still open here, so this cannot fail
            let _ = manager.add_sub_stream(0, size);
        }

        self.index_manager = Some(manager.shared());
    }

    /// Advance the state machine one step, latching the pre-charge on
    /// the first transition out of `Start`
    pub fn next_state(&mut self) -> StreamState {
        use StreamIndexFlags as F;

        let flags = self.index_flags;
        let body = || {
            if flags.intersects(F::SPRINKLED | F::CBR_BODY) {
                StreamState::BodyWithIndex
            } else {
                StreamState::BodyNoIndex
            }
        };
        let footer_or_done = || {
            if flags.intersects(
                F::FULL_FOOTER | F::SPARSE_FOOTER | F::CBR_FOOTER | F::SPRINKLED,
            ) {
                StreamState::FootIndex
            } else {
                StreamState::Done
            }
        };

        self.state = match self.state {
            StreamState::Start => {
                // Latched here rather than at construction so that
                // sub-streams attached later count towards the value
                self.precharge_size = self.sources[0].borrow_mut().precharge_size();
                if let Some(manager) = &self.index_manager {
                    manager.borrow_mut().set_pre_charge(self.precharge_size);
                }

                if flags.intersects(F::CBR_HEADER | F::CBR_HEADER_ISOLATED) {
                    StreamState::HeadIndex
                } else if flags.intersects(F::CBR_PRE_ISOLATED) {
                    StreamState::PreBodyIndex
                } else {
                    body()
                }
            }
            StreamState::HeadIndex => {
                if flags.intersects(F::CBR_PRE_ISOLATED) {
                    StreamState::PreBodyIndex
                } else {
                    body()
                }
            }
            StreamState::PreBodyIndex => body(),
            StreamState::BodyWithIndex | StreamState::BodyNoIndex => {
                if self.end_of_stream {
                    footer_or_done()
                } else if flags.intersects(F::SPRINKLED_ISOLATED | F::CBR_ISOLATED) {
                    StreamState::PostBodyIndex
                } else if flags.intersects(F::CBR_PRE_ISOLATED) {
                    StreamState::PreBodyIndex
                } else {
                    body()
                }
            }
            StreamState::PostBodyIndex => {
                if self.end_of_stream {
                    footer_or_done()
                } else if flags.intersects(F::CBR_PRE_ISOLATED) {
                    StreamState::PreBodyIndex
                } else {
                    body()
                }
            }
            StreamState::FootIndex => StreamState::Done,
            StreamState::Done => StreamState::Done,
        };

        self.state
    }

    /// Build the index table chunk for the current placement
    ///
    /// `for_footer` selects the final chunk (everything not yet
    /// sprinkled, or the complete/sparse table).
    fn build_index_chunk(&mut self, features: &Features, for_footer: bool) -> Result<Vec<u8>> {
        use StreamIndexFlags as F;

        let Some(manager) = self.index_manager.clone() else {
            return Ok(Vec::new());
        };
        let mut manager = manager.borrow_mut();
        let mut buffer = Vec::new();

        if manager.is_cbr() {
            let table = manager.make_index();
            table.write_index(&mut buffer, features)?;
            return Ok(buffer);
        }

        let mut table = manager.make_index();

        if for_footer && self.index_flags.intersects(F::SPARSE_FOOTER) {
            for position in self.sparse_list.clone() {
                manager.add_entries_to_index(false, &mut table, position, position)?;
            }
        } else if for_footer && self.index_flags.intersects(F::FULL_FOOTER)
            && !self.index_flags.intersects(F::SPRINKLED)
        {
            manager.add_entries_to_index(false, &mut table, INDEX_LOWEST, i64::MAX)?;
        } else {
            // Sprinkled: everything complete since the last sprinkle
            let last = manager.last_new_edit_unit();
            let first = self.next_sprinkled;
            if last < first {
                return Ok(Vec::new());
            }
            let added = manager.add_entries_to_index(false, &mut table, first, last)?;
            if added == 0 {
                return Ok(Vec::new());
            }
            if !for_footer {
                self.next_sprinkled = first + added as i64;
            }
        }

        table.write_index(&mut buffer, features)?;
        if !for_footer {
            self.prev_sprinkle_size = buffer.len();
        }
        Ok(buffer)
    }
}

/// Decides whether header metadata accompanies a partition
pub trait PartitionHandler {
    /// Called before each body partition pack is written; returning true
    /// attaches the writer's metadata to the partition
    fn handle_partition(&mut self, body_sid: u32, index_sid: u32) -> bool;
}

/// Writer state across the whole file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Start,
    Body,
    Footer,
    Done,
}

struct StreamInfo {
    active: bool,
    stop_after: i64,
    stream: BodyStream,
}

/// Multiplexes body streams into partitions in one output file
pub struct BodyWriter<W: Write + Seek> {
    file: W,
    position: u64,
    previous_partition: u64,

    kag: u32,
    force_ber4: bool,
    features: Features,

    base_partition: PartitionPack,
    partition_handler: Option<Box<dyn PartitionHandler>>,
    metadata: Option<Vec<u8>>,
    min_partition_size: u32,
    min_partition_filler: u32,
    index_shares_with_metadata: bool,
    essence_shares_with_metadata: bool,

    state: WriterState,
    streams: Vec<StreamInfo>,
    current_stream: usize,
    rip: RandomIndexPack,
}

impl<W: Write + Seek> BodyWriter<W> {
    /// Create a writer over an output file
    pub fn new(file: W, features: Features) -> Self {
        BodyWriter {
            file,
            position: 0,
            previous_partition: 0,
            kag: 1,
            force_ber4: false,
            features,
            base_partition: PartitionPack::default(),
            partition_handler: None,
            metadata: None,
            min_partition_size: 0,
            min_partition_filler: 0,
            // Index tables may share a partition with metadata by
            // default, essence may not
            index_shares_with_metadata: true,
            essence_shares_with_metadata: false,
            state: WriterState::Start,
            streams: Vec::new(),
            current_stream: 0,
            rip: RandomIndexPack::new(),
        }
    }

    /// Set the KLV alignment grid for the file
    pub fn set_kag(&mut self, kag: u32, force_ber4: bool) {
        self.kag = kag.max(1);
        self.force_ber4 = force_ber4;
    }

    /// Set what may share a partition with header metadata
    pub fn set_metadata_sharing(&mut self, index_may_share: bool, essence_may_share: bool) {
        self.index_shares_with_metadata = index_may_share;
        self.essence_shares_with_metadata = essence_may_share;
    }

    /// Set the template partition pack
    pub fn set_partition(&mut self, partition: PartitionPack) {
        self.base_partition = partition;
    }

    /// Set the serialised header metadata to write where requested
    pub fn set_metadata(&mut self, metadata: Vec<u8>) {
        self.metadata = Some(metadata);
    }

    /// Set the handler consulted before body partition packs
    pub fn set_partition_handler(&mut self, handler: Box<dyn PartitionHandler>) {
        self.partition_handler = Some(handler);
    }

    /// Minimum size of the non-essence part of each partition
    pub fn set_partition_size(&mut self, size: u32) {
        self.min_partition_size = size;
    }

    /// Minimum filler between the non-essence part and the essence
    pub fn set_partition_filler(&mut self, filler: u32) {
        self.min_partition_filler = filler;
    }

    /// Add a stream; false if its BodySID is already registered
    ///
    /// `stop_after`, when positive, limits the edit units written from
    /// this stream.
    pub fn add_stream(&mut self, mut stream: BodyStream, stop_after: i64) -> bool {
        if self
            .streams
            .iter()
            .any(|info| info.stream.body_sid == stream.body_sid)
        {
            return false;
        }

        // Wire up the stream's container writer and index plumbing
        let mut writer = GcWriter::new(stream.body_sid, self.features);
        writer.set_kag(self.kag, self.force_ber4);

        let manager = if stream.index_sid != 0 {
            let manager = stream.index_manager();
            manager.borrow_mut().index_sid = stream.index_sid;
            manager.borrow_mut().body_sid = stream.body_sid;
            Some(manager)
        } else {
            None
        };

        let index_clip = stream.wrap == StreamWrap::Clip;
        for (sub, source) in stream.sources.iter().enumerate() {
            let (essence_type, element_type, ber_size, key_override, write_order) = {
                let source = source.borrow();
                (
                    source.gc_essence_type(),
                    source.gc_element_type(),
                    source.ber_size(),
                    source.key_override(),
                    (source.relative_write_order(), source.relative_write_order_type()),
                )
            };

            let id = match key_override {
                Some((key, non_gc)) => writer.add_essence_element_with_key(key, ber_size, non_gc),
                None => writer.add_essence_element(essence_type, element_type, ber_size),
            };
            if write_order.0 != 0 {
                writer.set_relative_write_order(id, write_order.1, write_order.0);
            }
            stream.stream_ids.push(id);

            if let Some(manager) = &manager {
                let can_index = source.borrow().can_index();
                if can_index {
                    writer.add_stream_index(id, manager.clone(), sub, false, index_clip);
                    source.borrow_mut().set_index_manager(manager.clone(), sub);
                }
            }
        }

        stream.writer = Some(writer);
        self.streams.push(StreamInfo {
            active: true,
            stop_after,
            stream,
        });
        true
    }

    /// The stream registered for a BodySID
    pub fn stream(&self, body_sid: u32) -> Option<&BodyStream> {
        self.streams
            .iter()
            .map(|info| &info.stream)
            .find(|s| s.body_sid == body_sid)
    }

    /// Have all streams finished?
    pub fn body_done(&self) -> bool {
        self.streams
            .iter()
            .all(|info| !info.active || info.stream.state == StreamState::Done)
    }

    /// Recover the output file
    pub fn into_inner(self) -> W {
        self.file
    }

    /// Write the header partition
    ///
    /// Metadata (if set) is written with the header. Streams wanting a
    /// CBR header index get it in the header partition when index tables
    /// may share with metadata, otherwise in an isolated partition
    /// following it.
    pub fn write_header(&mut self, closed: bool, complete: bool) -> Result<()> {
        if self.state != WriterState::Start {
            return Err(MxfError::BadState("header already written"));
        }

        // Gather CBR header index chunks first
        let mut header_chunk = Vec::new();
        let mut header_index_sid = 0;
        let mut isolated = Vec::new();

        for info in &mut self.streams {
            let stream = &mut info.stream;
            if stream.state != StreamState::Start {
                continue;
            }
            if stream.next_state() != StreamState::HeadIndex {
                continue;
            }

            let chunk = stream.build_index_chunk(&self.features, false)?;
            let wants_isolated = stream
                .index_flags
                .intersects(StreamIndexFlags::CBR_HEADER_ISOLATED)
                || !self.index_shares_with_metadata;

            if !wants_isolated && header_chunk.is_empty() {
                header_index_sid = stream.index_sid;
                header_chunk = chunk;
            } else {
                isolated.push((stream.body_sid, stream.index_sid, chunk));
            }
            stream.next_state();
        }

        use crate::partition::{PartitionCompleteness, PartitionStatus};
        let mut pack = self.base_partition.clone();
        pack.kind = PartitionKind::Header;
        pack.status = if closed {
            PartitionStatus::Closed
        } else {
            PartitionStatus::Open
        };
        pack.completeness = if complete {
            PartitionCompleteness::Complete
        } else {
            PartitionCompleteness::Incomplete
        };

        let metadata = self.metadata.clone();
        self.write_partition_with(
            pack,
            0,
            header_index_sid,
            metadata.as_deref(),
            if header_chunk.is_empty() {
                None
            } else {
                Some(&header_chunk)
            },
            0,
        )?;

        for (_, index_sid, chunk) in isolated {
            let mut pack = self.base_partition.clone();
            pack.kind = PartitionKind::Body;
            self.write_partition_with(pack, 0, index_sid, None, Some(&chunk), 0)?;
        }

        self.state = WriterState::Body;
        Ok(())
    }

    /// Write the next partition's worth of data for the next stream
    ///
    /// `duration` limits the edit units written in this partition (0 for
    /// no limit); `max_partition_size` similarly bounds the partition's
    /// byte size. Returns false once all streams are done.
    pub fn write_partition(&mut self, duration: i64, max_partition_size: u64) -> Result<bool> {
        if self.state == WriterState::Start {
            self.write_header(false, false)?;
        }
        if self.state != WriterState::Body {
            return Ok(false);
        }

        let Some(index) = self.next_active_stream() else {
            self.state = WriterState::Footer;
            return Ok(false);
        };
        self.current_stream = index;

        let state = {
            let info = &mut self.streams[index];
            if info.stream.state == StreamState::Start {
                info.stream.next_state()
            } else {
                info.stream.state
            }
        };

        match state {
            StreamState::HeadIndex
            | StreamState::PreBodyIndex
            | StreamState::PostBodyIndex => {
                // Isolated index partition, no essence
                let (pack_sid, chunk) = {
                    let info = &mut self.streams[index];
                    let chunk = info.stream.build_index_chunk(&self.features, false)?;
                    (info.stream.index_sid, chunk)
                };
                if !chunk.is_empty() {
                    let mut pack = self.base_partition.clone();
                    pack.kind = PartitionKind::Body;
                    self.write_partition_with(pack, 0, pack_sid, None, Some(&chunk), 0)?;
                }
                self.streams[index].stream.next_state();
                Ok(true)
            }
            StreamState::BodyWithIndex | StreamState::BodyNoIndex => {
                self.write_body_partition(index, state, duration, max_partition_size)?;
                Ok(true)
            }
            StreamState::FootIndex | StreamState::Done => {
                // Footer indexes are written by write_footer
                self.streams[index].active = false;
                Ok(self.next_active_stream().is_some())
            }
            StreamState::Start => Ok(true),
        }
    }

    /// Write body partitions until every stream has delivered at least
    /// `duration` edit units (0 = everything), then leave footer work
    /// pending
    pub fn write_body(&mut self, duration: i64, max_partition_size: u64) -> Result<()> {
        loop {
            if !self.write_partition(duration, max_partition_size)? {
                break;
            }

            if duration > 0 {
                let all_reached = self.streams.iter().all(|info| {
                    !info.active
                        || info.stream.end_of_stream
                        || info.stream.master().borrow().current_position() >= duration
                });
                if all_reached {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Flush pending work and forbid appending to the current partition
    pub fn end_partition(&mut self) -> Result<()> {
        // Partitions are written whole, so there is nothing buffered;
        // the next write simply starts a new partition
        Ok(())
    }

    /// Write the footer partition, trailing index tables and the RIP
    pub fn write_footer(&mut self, write_metadata: bool, complete: bool) -> Result<()> {
        if self.state == WriterState::Done {
            return Err(MxfError::BadState("footer already written"));
        }

        // Collect footer index chunks from every stream that wants one
        let mut footer_chunk: Vec<u8> = Vec::new();
        let mut footer_index_sid = 0;
        let mut isolated = Vec::new();

        for info in &mut self.streams {
            let stream = &mut info.stream;

            let wants_footer = stream.index_flags.intersects(
                StreamIndexFlags::FULL_FOOTER
                    | StreamIndexFlags::SPARSE_FOOTER
                    | StreamIndexFlags::CBR_FOOTER
                    | StreamIndexFlags::SPRINKLED,
            );
            if !wants_footer {
                continue;
            }

            let chunk = stream.build_index_chunk(&self.features, true)?;
            if chunk.is_empty() {
                continue;
            }
            if footer_chunk.is_empty() {
                footer_index_sid = stream.index_sid;
                footer_chunk = chunk;
            } else {
                // Only one index stream fits the footer itself; others
                // go in isolated partitions just before it
                isolated.push((stream.index_sid, chunk));
            }
            stream.state = StreamState::Done;
        }

        for (index_sid, chunk) in isolated {
            let mut pack = self.base_partition.clone();
            pack.kind = PartitionKind::Body;
            self.write_partition_with(pack, 0, index_sid, None, Some(&chunk), 0)?;
        }

        use crate::partition::{PartitionCompleteness, PartitionStatus};
        let mut pack = self.base_partition.clone();
        pack.kind = PartitionKind::Footer;
        pack.status = PartitionStatus::Closed;
        pack.completeness = if complete {
            PartitionCompleteness::Complete
        } else {
            PartitionCompleteness::Incomplete
        };
        pack.footer_partition = self.position;

        let metadata = if write_metadata {
            self.metadata.clone()
        } else {
            None
        };
        self.write_partition_with(
            pack,
            0,
            footer_index_sid,
            metadata.as_deref(),
            if footer_chunk.is_empty() {
                None
            } else {
                Some(&footer_chunk)
            },
            0,
        )?;

        self.rip.write(&mut self.file)?;

        self.state = WriterState::Done;
        Ok(())
    }

    /// Round-robin to the next stream still doing work
    fn next_active_stream(&self) -> Option<usize> {
        let count = self.streams.len();
        if count == 0 {
            return None;
        }
        (0..count)
            .map(|i| (self.current_stream + i) % count)
            .find(|&i| {
                let info = &self.streams[i];
                info.active && info.stream.state != StreamState::Done
            })
    }

    /// Write one body partition for a stream, with its sprinkled or CBR
    /// index chunk when the state asks for one
    fn write_body_partition(
        &mut self,
        index: usize,
        state: StreamState,
        duration: i64,
        max_partition_size: u64,
    ) -> Result<()> {
        let (body_sid, index_sid) = {
            let stream = &self.streams[index].stream;
            (stream.body_sid, stream.index_sid)
        };

        // The partition handler may attach metadata to this partition
        let attach_metadata = match &mut self.partition_handler {
            Some(handler) => handler.handle_partition(body_sid, index_sid),
            None => false,
        } && self.metadata.is_some();

        // Index chunk for body-with-index states
        let chunk = if state == StreamState::BodyWithIndex {
            self.streams[index]
                .stream
                .build_index_chunk(&self.features, false)?
        } else {
            Vec::new()
        };
        let index_sid = if chunk.is_empty() { 0 } else { index_sid };

        // Sharing rules may force the metadata into its own partition
        if attach_metadata && !self.essence_shares_with_metadata {
            let metadata = self.metadata.clone();
            let mut pack = self.base_partition.clone();
            pack.kind = PartitionKind::Body;

            if self.index_shares_with_metadata && !chunk.is_empty() {
                self.write_partition_with(
                    pack,
                    0,
                    index_sid,
                    metadata.as_deref(),
                    Some(&chunk),
                    0,
                )?;
                let body_offset = self.streams[index].stream.writer.as_ref().map(
                    GcWriter::stream_offset,
                ).unwrap_or(0);
                let mut essence_pack = self.base_partition.clone();
                essence_pack.kind = PartitionKind::Body;
                self.write_partition_with(essence_pack, body_sid, 0, None, None, body_offset)?;
            } else {
                self.write_partition_with(pack, 0, 0, metadata.as_deref(), None, 0)?;
                let body_offset = self.streams[index].stream.writer.as_ref().map(
                    GcWriter::stream_offset,
                ).unwrap_or(0);
                let mut essence_pack = self.base_partition.clone();
                essence_pack.kind = PartitionKind::Body;
                self.write_partition_with(
                    essence_pack,
                    body_sid,
                    index_sid,
                    None,
                    if chunk.is_empty() { None } else { Some(&chunk) },
                    body_offset,
                )?;
            }
        } else {
            let metadata = if attach_metadata {
                self.metadata.clone()
            } else {
                None
            };
            let body_offset = self.streams[index]
                .stream
                .writer
                .as_ref()
                .map(GcWriter::stream_offset)
                .unwrap_or(0);
            let mut pack = self.base_partition.clone();
            pack.kind = PartitionKind::Body;
            self.write_partition_with(
                pack,
                body_sid,
                index_sid,
                metadata.as_deref(),
                if chunk.is_empty() { None } else { Some(&chunk) },
                body_offset,
            )?;
        }

        self.write_essence(index, duration, max_partition_size)?;

        // Round-robin: the next partition goes to the next stream
        self.current_stream = (index + 1) % self.streams.len();
        Ok(())
    }

    /// Write essence content packages for one stream
    fn write_essence(
        &mut self,
        index: usize,
        duration: i64,
        max_partition_size: u64,
    ) -> Result<()> {
        let partition_start = self.position;
        let info = &mut self.streams[index];
        let stream = &mut info.stream;
        let writer = stream.writer.as_mut().expect("stream added to a writer");

        if stream.wrap == StreamWrap::Clip {
            // The whole clip is one KLV per source
            for (sub, source) in stream.sources.iter().enumerate() {
                writer.add_essence_source(
                    stream.stream_ids[sub],
                    source.clone(),
                    self.features.allow_fast_clip_wrap,
                );
            }
            let written = writer.flush(&mut self.file)?;
            self.position += written;
            stream.overall_essence_size += written;
            stream.end_of_stream = true;
            if info.stop_after > 0 {
                info.stop_after = 0;
            }
            stream.next_state();
            return Ok(());
        }

        // Frame (or other) wrapping: one content package per edit unit
        let mut units_written = 0i64;
        loop {
            if duration > 0 && units_written >= duration {
                break;
            }
            if info.stop_after > 0 && units_written >= info.stop_after {
                info.active = false;
                stream.end_of_stream = true;
                break;
            }
            if max_partition_size > 0 && self.position - partition_start >= max_partition_size {
                break;
            }

            if stream.sources[0].borrow_mut().next_data_size() == 0 {
                stream.end_of_stream = true;
                break;
            }

            // The container writer numbers content packages from zero,
            // which is exactly the edit unit each one lands at
            for (sub, source) in stream.sources.iter().enumerate() {
                if source.borrow().end_of_data() {
                    continue;
                }
                writer.add_essence_source(stream.stream_ids[sub], source.clone(), false);
            }

            let written = writer.start_new_cp(&mut self.file)?;
            self.position += written;
            stream.overall_essence_size += written;
            units_written += 1;
        }

        if info.stop_after > 0 {
            info.stop_after -= units_written.min(info.stop_after);
            if info.stop_after == 0 {
                stream.end_of_stream = true;
            }
        }

        debug!(
            body_sid = stream.body_sid,
            units = units_written,
            "body partition essence written"
        );

        stream.next_state();
        Ok(())
    }

    /// Write one partition pack plus optional metadata and index bytes
    fn write_partition_with(
        &mut self,
        mut pack: PartitionPack,
        body_sid: u32,
        index_sid: u32,
        metadata: Option<&[u8]>,
        index_data: Option<&[u8]>,
        body_offset: u64,
    ) -> Result<()> {
        let partition_start = self.position;

        pack.kag_size = self.kag;
        pack.this_partition = partition_start;
        pack.previous_partition = self.previous_partition;
        pack.body_sid = body_sid;
        pack.index_sid = index_sid;
        pack.body_offset = body_offset;

        // Byte counts cover the metadata and index areas including the
        // filler that pads them to the KAG
        let pack_size = pack.size() as u64;
        let mut offset = pack_size;
        let mut header_byte_count = 0u64;
        if let Some(metadata) = metadata {
            let fill = crate::gc_writer::filler_size(self.kag, offset + metadata.len() as u64, 0, self.force_ber4);
            header_byte_count = metadata.len() as u64 + fill;
            offset += header_byte_count;
        }
        let mut index_byte_count = 0u64;
        if let Some(index_data) = index_data {
            let fill = crate::gc_writer::filler_size(self.kag, offset + index_data.len() as u64, 0, self.force_ber4);
            index_byte_count = index_data.len() as u64 + fill;
            offset += index_byte_count;
        }

        // Honour the minimum non-essence partition size with extra fill
        let mut trailing_fill = 0u64;
        if self.min_partition_size > 0 && offset < u64::from(self.min_partition_size) {
            trailing_fill = crate::gc_writer::filler_size(
                self.kag,
                offset,
                (u64::from(self.min_partition_size) - offset) as u32,
                self.force_ber4,
            );
        } else if self.min_partition_filler > 0 {
            trailing_fill = crate::gc_writer::filler_size(
                self.kag,
                offset,
                self.min_partition_filler,
                self.force_ber4,
            );
        }

        pack.header_byte_count = header_byte_count;
        pack.index_byte_count = index_byte_count;

        pack.write(&mut self.file)?;
        self.position += pack_size;

        if let Some(metadata) = metadata {
            self.file.write_all(metadata)?;
            self.position += metadata.len() as u64;
            self.position += write_filler(
                &mut self.file,
                self.kag,
                self.position - partition_start,
                0,
                self.force_ber4,
            )?;
        }

        if let Some(index_data) = index_data {
            self.file.write_all(index_data)?;
            self.position += index_data.len() as u64;
            self.position += write_filler(
                &mut self.file,
                self.kag,
                self.position - partition_start,
                0,
                self.force_ber4,
            )?;
        }

        if trailing_fill > 0 {
            self.position += write_filler(
                &mut self.file,
                self.kag,
                self.position - partition_start,
                trailing_fill as u32,
                self.force_ber4,
            )?;
        }

        self.rip.add_entry(body_sid, partition_start);
        self.previous_partition = partition_start;
        Ok(())
    }
}
