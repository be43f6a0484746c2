//! Index tables for random access into essence containers
//!
//! An index table maps edit units to byte offsets within one essence
//! container. CBR essence is described by a single edit-unit byte count;
//! VBR essence carries one fixed-size entry per edit unit, held in one or
//! more index table segments. Entries also carry temporal reordering
//! information (temporal offset, key-frame offset) and per-slice offsets
//! for multi-element content packages.

use crate::config::Features;
use crate::error::{MxfError, Result};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use mxfkit_core::klv::{self, write_local_item};
use mxfkit_core::ul::labels;
use mxfkit_core::{Rational, UniversalLabel};
use std::collections::BTreeMap;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// The lowest valid index position, used to flag omitted range bounds
pub const INDEX_LOWEST: i64 = -0x7FFF_FFFF_FFFF_FFFF;

/// Sentinel returned when a key-frame location cannot be resolved
pub const KEY_LOCATION_UNKNOWN: u64 = u64::MAX;

/// Local set tags of an IndexTableSegment
mod tag {
    pub const INSTANCE_UID: u16 = 0x3C0A;
    pub const EDIT_UNIT_BYTE_COUNT: u16 = 0x3F05;
    pub const INDEX_SID: u16 = 0x3F06;
    pub const BODY_SID: u16 = 0x3F07;
    pub const SLICE_COUNT: u16 = 0x3F08;
    pub const DELTA_ENTRY_ARRAY: u16 = 0x3F09;
    pub const INDEX_ENTRY_ARRAY: u16 = 0x3F0A;
    pub const INDEX_EDIT_RATE: u16 = 0x3F0B;
    pub const INDEX_START_POSITION: u16 = 0x3F0C;
    pub const INDEX_DURATION: u16 = 0x3F0D;
    pub const POS_TABLE_COUNT: u16 = 0x3F0E;
}

/// One entry of a delta array: where a sub-stream's data sits within an
/// edit unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeltaEntry {
    /// Temporal reordering behaviour: negative = apply reordering,
    /// 0 = none, positive = 1-based PosTable index
    pub pos_table_index: i8,
    /// Slice this element sits in (0 = first)
    pub slice: u8,
    /// Byte offset from the start of the slice
    pub element_delta: u32,
}

/// Result of an index lookup
#[derive(Debug, Clone, Default)]
pub struct IndexPos {
    /// The edit unit this position actually describes
    pub this_pos: i64,
    /// Byte location of the edit unit (or sub-item) in the container
    pub location: u64,
    /// Byte location of the nearest key frame, or
    /// [`KEY_LOCATION_UNKNOWN`] if it lies outside the segment
    pub key_location: u64,
    /// Temporal offset applied (or that would apply) to this entry
    pub temporal_offset: i8,
    /// Offset to the previous key frame
    pub key_frame_offset: i8,
    /// Entry flags
    pub flags: u8,
    /// True when the location is exact for the requested sub-item
    pub exact: bool,
    /// True when the result describes a different (earlier) edit unit
    pub other_pos: bool,
    /// True when `pos_offset` carries a temporal fraction
    pub offset: bool,
    /// Fractional position offset from the PosTable
    pub pos_offset: Rational,
}

/// One index table segment: a run of contiguous fixed-size entries
#[derive(Debug, Clone)]
pub struct IndexSegment {
    /// First edit unit indexed by this segment (may be negative for
    /// pre-charge)
    pub start_position: i64,
    /// Number of entries
    pub entry_count: u32,
    /// Per-segment delta array (inherited from the table base when the
    /// segment is created)
    pub delta_array: Vec<DeltaEntry>,
    /// Raw entry bytes, `entry_count * entry_size` long
    entries: Vec<u8>,
}

impl IndexSegment {
    fn new(start_position: i64, delta_array: Vec<DeltaEntry>) -> Self {
        IndexSegment {
            start_position,
            entry_count: 0,
            delta_array,
            entries: Vec::new(),
        }
    }

    /// Raw entry bytes
    pub fn entry_bytes(&self) -> &[u8] {
        &self.entries
    }

    /// Append one entry built from its parts
    ///
    /// `shape` is the owning table's entry shape. Fails with
    /// [`MxfError::ShapeMismatch`] on arity mismatch and
    /// [`MxfError::IndexSegmentFull`] when another entry would burst the
    /// 2-byte local set length limit.
    pub fn add_index_entry(
        &mut self,
        shape: EntryShape,
        temporal_offset: i8,
        key_frame_offset: i8,
        flags: u8,
        stream_offset: u64,
        slice_offsets: &[u32],
        pos_table: &[Rational],
    ) -> Result<()> {
        if slice_offsets.len() != usize::from(shape.slice_count) {
            return Err(MxfError::ShapeMismatch {
                expected: usize::from(shape.slice_count),
                actual: slice_offsets.len(),
            });
        }
        if pos_table.len() != usize::from(shape.pos_table_count) {
            return Err(MxfError::ShapeMismatch {
                expected: usize::from(shape.pos_table_count),
                actual: pos_table.len(),
            });
        }

        let entry_size = shape.entry_size();
        let new_size = (self.entry_count as usize + 1) * entry_size + 8;
        if new_size > 0xFFFF {
            return Err(MxfError::IndexSegmentFull { entry_size });
        }

        self.entries.push(temporal_offset as u8);
        self.entries.push(key_frame_offset as u8);
        self.entries.push(flags);
        self.entries
            .write_u64::<BigEndian>(stream_offset)
            .expect("vec write");
        for offset in slice_offsets {
            self.entries.write_u32::<BigEndian>(*offset).expect("vec write");
        }
        for pos in pos_table {
            self.entries.write_i32::<BigEndian>(pos.num).expect("vec write");
            self.entries.write_i32::<BigEndian>(pos.den).expect("vec write");
        }

        self.entry_count += 1;
        Ok(())
    }

    /// Bulk-append pre-formed entries
    ///
    /// `size` must equal the table's entry size. The 2-byte length limit
    /// applies unless `allow_oversize` is set (some files burst it).
    pub fn add_index_entries(
        &mut self,
        shape: EntryShape,
        count: u32,
        size: usize,
        bytes: &[u8],
        allow_oversize: bool,
    ) -> Result<()> {
        let entry_size = shape.entry_size();
        if size != entry_size {
            return Err(MxfError::ShapeMismatch {
                expected: entry_size,
                actual: size,
            });
        }
        if bytes.len() < count as usize * size {
            return Err(MxfError::ShapeMismatch {
                expected: count as usize * size,
                actual: bytes.len(),
            });
        }

        if !allow_oversize {
            let new_size = (self.entry_count as usize + count as usize) * entry_size + 8;
            if new_size > 0xFFFF {
                return Err(MxfError::IndexSegmentFull { entry_size });
            }
        }

        self.entries.extend_from_slice(&bytes[..count as usize * size]);
        self.entry_count += count;
        Ok(())
    }

    /// Overwrite the stream offset of an existing entry; out-of-range
    /// positions are silently ignored
    pub fn update(&mut self, shape: EntryShape, edit_unit: i64, stream_offset: u64) {
        if edit_unit < self.start_position {
            return;
        }
        if edit_unit > self.start_position + i64::from(self.entry_count) - 1 {
            return;
        }

        let offset = (edit_unit - self.start_position) as usize * shape.entry_size() + 3;
        BigEndian::write_u64(&mut self.entries[offset..offset + 8], stream_offset);
    }

    /// The last edit unit indexed by this segment plus one
    pub fn end_position(&self) -> i64 {
        self.start_position + i64::from(self.entry_count)
    }
}

/// The fixed shape of index entries in a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryShape {
    /// NSL: number of slice offsets per entry
    pub slice_count: u8,
    /// NPE: number of PosTable entries per entry
    pub pos_table_count: u8,
}

impl EntryShape {
    /// Bytes per index entry: `11 + 4*NSL + 8*NPE`
    pub fn entry_size(&self) -> usize {
        11 + 4 * usize::from(self.slice_count) + 8 * usize::from(self.pos_table_count)
    }
}

/// An index table: CBR parameters or an ordered collection of VBR
/// segments covering one essence stream
#[derive(Debug, Clone, Default)]
pub struct IndexTable {
    /// Edit rate of the indexed essence
    pub edit_rate: Rational,
    /// IndexSID of this table
    pub index_sid: u32,
    /// BodySID of the indexed essence
    pub body_sid: u32,
    /// Bytes per edit unit; non-zero selects CBR indexing
    pub edit_unit_byte_count: u32,
    /// Duration in edit units (maintained for CBR, derived for VBR)
    pub index_duration: i64,
    /// Entry shape (NSL / NPE)
    pub shape: EntryShape,
    /// Base delta array inherited by new segments
    pub base_delta_array: Vec<DeltaEntry>,
    /// Edit units of pre-charge before the first output picture
    pub pre_charge: i64,
    segments: BTreeMap<i64, IndexSegment>,
}

impl IndexTable {
    /// Create an empty index table
    pub fn new() -> Self {
        IndexTable::default()
    }

    /// Bytes per index entry for the current shape
    pub fn entry_size(&self) -> usize {
        self.shape.entry_size()
    }

    /// Number of segments currently held
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Iterate the segments in start-position order
    pub fn segments(&self) -> impl Iterator<Item = &IndexSegment> {
        self.segments.values()
    }

    /// Build the base delta array from per-stream element sizes
    ///
    /// Elements with a zero size are VBR and terminate a slice; elements
    /// after them start the next slice at delta zero. The PosTable index
    /// of every entry is left at zero for the caller to fill in.
    pub fn define_delta_array(&mut self, element_sizes: &[u32]) {
        self.base_delta_array.clear();

        let mut slice: u8 = 0;
        let mut delta: u32 = 0;
        for (i, &size) in element_sizes.iter().enumerate() {
            self.base_delta_array.push(DeltaEntry {
                pos_table_index: 0,
                slice,
                element_delta: delta,
            });

            // A VBR element ends its slice unless it is the last element
            if size == 0 && i + 1 < element_sizes.len() {
                slice += 1;
                delta = 0;
            } else {
                delta += size;
            }
        }

        self.shape.slice_count = slice;
    }

    /// Return the segment starting at `start_position`, creating it if
    /// required (new segments inherit the base delta array)
    pub fn add_segment(&mut self, start_position: i64) -> &mut IndexSegment {
        self.segments
            .entry(start_position)
            .or_insert_with(|| IndexSegment::new(start_position, self.base_delta_array.clone()))
    }

    /// Find the start position of the segment holding `edit_unit`, or the
    /// segment it would extend (the edit unit one past the segment end)
    fn locate_segment(&self, edit_unit: i64) -> Option<i64> {
        let (start, segment) = self.segments.range(..=edit_unit).next_back()?;
        if edit_unit > segment.end_position() {
            return None;
        }
        Some(*start)
    }

    /// Find the start of the segment covering `edit_unit`, allowing a
    /// result whose range ends before the edit unit (for lookups)
    fn locate_segment_or_before(&self, edit_unit: i64) -> Option<i64> {
        self.segments
            .range(..=edit_unit)
            .next_back()
            .map(|(start, _)| *start)
    }

    /// Get the segment for an edit unit, creating one where no existing
    /// segment covers or ends at it
    pub fn get_segment(&mut self, edit_unit: i64) -> &mut IndexSegment {
        match self.locate_segment(edit_unit) {
            Some(start) => self.segments.get_mut(&start).expect("segment located"),
            None => self.add_segment(edit_unit),
        }
    }

    /// Add a single index entry, creating segments as required
    ///
    /// Offering an entry for an edit unit that is already indexed fails
    /// with [`MxfError::EntryReplaceUnsupported`].
    #[allow(clippy::too_many_arguments)]
    pub fn add_index_entry(
        &mut self,
        edit_unit: i64,
        temporal_offset: i8,
        key_frame_offset: i8,
        flags: u8,
        stream_offset: u64,
        slice_offsets: &[u32],
        pos_table: &[Rational],
    ) -> Result<()> {
        let shape = self.shape;

        let segment = self.get_segment(edit_unit);
        if edit_unit < segment.start_position + i64::from(segment.entry_count) {
            return Err(MxfError::EntryReplaceUnsupported { edit_unit });
        }

        match segment.add_index_entry(
            shape,
            temporal_offset,
            key_frame_offset,
            flags,
            stream_offset,
            slice_offsets,
            pos_table,
        ) {
            Ok(()) => Ok(()),
            Err(MxfError::IndexSegmentFull { .. }) => {
                // Segment is full; continue in a fresh one
                let segment = self.add_segment(edit_unit);
                segment.add_index_entry(
                    shape,
                    temporal_offset,
                    key_frame_offset,
                    flags,
                    stream_offset,
                    slice_offsets,
                    pos_table,
                )
            }
            Err(e) => Err(e),
        }
    }

    /// Perform an index lookup
    ///
    /// For CBR tables the location is computed from the edit-unit byte
    /// count and the delta array. For VBR tables the covering segment is
    /// searched; positions beyond the indexed range return the last known
    /// entry with `other_pos` set, and positions before the table return
    /// an all-zero result with `exact` false.
    ///
    /// With `reorder` set, entries with a temporal offset whose sub-item
    /// is marked for reordering resolve to the edit unit the offset points
    /// at, with the offset reported in the result.
    pub fn lookup(&self, edit_unit: i64, sub_item: usize, reorder: bool) -> IndexPos {
        if self.edit_unit_byte_count != 0 {
            return self.lookup_cbr(edit_unit, sub_item);
        }
        self.lookup_vbr(edit_unit, sub_item, reorder)
    }

    fn lookup_cbr(&self, edit_unit: i64, sub_item: usize) -> IndexPos {
        let mut location = edit_unit as u64 * u64::from(self.edit_unit_byte_count);
        let mut exact = true;

        if sub_item > 0 {
            if sub_item >= self.base_delta_array.len() {
                exact = false;
            } else {
                let delta = &self.base_delta_array[sub_item];
                if delta.slice != 0 {
                    error!(slice = delta.slice, "CBR index has a sliced delta array");
                    exact = false;
                } else {
                    location += u64::from(delta.element_delta);
                }
            }
        }

        IndexPos {
            this_pos: edit_unit,
            location,
            key_location: location,
            exact,
            ..Default::default()
        }
    }

    fn lookup_vbr(&self, edit_unit: i64, sub_item: usize, reorder: bool) -> IndexPos {
        let Some(start) = self.locate_segment_or_before(edit_unit) else {
            // Before the first indexed edit unit: report the stream start
            return IndexPos::default();
        };
        let segment = &self.segments[&start];

        if segment.entry_count == 0 {
            error!("index table segment contains no entries");
            return IndexPos::default();
        }

        let entry_size = self.entry_size();

        // Beyond the end of the covering segment: best effort result
        if segment.start_position + i64::from(segment.entry_count) - 1 < edit_unit {
            let last = (segment.entry_count - 1) as usize * entry_size;
            let location = BigEndian::read_u64(&segment.entries[last + 3..last + 11]);
            return IndexPos {
                this_pos: segment.start_position + i64::from(segment.entry_count) - 1,
                location,
                key_location: location,
                other_pos: true,
                ..Default::default()
            };
        }

        let entry_offset = (edit_unit - segment.start_position) as usize * entry_size;
        let entry = &segment.entries[entry_offset..entry_offset + entry_size];

        let temporal_offset = entry[0] as i8;

        // Does this sub-item take part in temporal reordering?
        let reorderable = segment.delta_array.is_empty()
            || (sub_item < segment.delta_array.len()
                && segment.delta_array[sub_item].pos_table_index < 0);

        if reorder && temporal_offset != 0 && reorderable {
            let mut pos = self.lookup_vbr(edit_unit + i64::from(temporal_offset), sub_item, false);
            pos.temporal_offset = temporal_offset;
            return pos;
        }

        let mut pos = IndexPos {
            this_pos: edit_unit,
            temporal_offset: if reorderable { temporal_offset } else { 0 },
            key_frame_offset: entry[1] as i8,
            flags: entry[2],
            location: BigEndian::read_u64(&entry[3..11]),
            ..Default::default()
        };

        // Flag bit 2 marks the key frame as out of range
        if (pos.flags & 0x04) != 0
            || i64::from(-pos.key_frame_offset) > (edit_unit - segment.start_position)
        {
            pos.key_location = KEY_LOCATION_UNKNOWN;
        } else {
            let key_entry = (edit_unit - segment.start_position
                + i64::from(pos.key_frame_offset)) as usize
                * entry_size;
            pos.key_location =
                BigEndian::read_u64(&segment.entries[key_entry + 3..key_entry + 11]);
        }

        // Without a delta for this sub-item the edit-unit start is all we
        // can report
        if sub_item >= segment.delta_array.len() {
            pos.exact = false;
            return pos;
        }

        pos.exact = true;

        if sub_item > 0 {
            let delta = &segment.delta_array[sub_item];
            if delta.slice != 0 {
                let slice_offset = 11 + (usize::from(delta.slice) - 1) * 4;
                pos.location +=
                    u64::from(BigEndian::read_u32(&entry[slice_offset..slice_offset + 4]));
            }
            pos.location += u64::from(delta.element_delta);
        }

        let pos_table_index = segment
            .delta_array
            .get(sub_item)
            .map(|d| d.pos_table_index)
            .unwrap_or(0);
        if pos_table_index > 0 {
            let slot = 11
                + 4 * usize::from(self.shape.slice_count)
                + (usize::from(pos_table_index as u8) - 1) * 8;
            pos.pos_offset = Rational::new(
                BigEndian::read_i32(&entry[slot..slot + 4]),
                BigEndian::read_i32(&entry[slot + 4..slot + 8]),
            );
            pos.offset = true;
        }

        pos
    }

    /// Patch the temporal offset, key-frame offset and flags of an
    /// existing entry; positions outside the table are ignored
    pub fn correct(
        &mut self,
        edit_unit: i64,
        temporal_offset: i8,
        key_frame_offset: i8,
        flags: u8,
    ) {
        let entry_size = self.entry_size();
        let Some(start) = self.locate_segment_or_before(edit_unit) else {
            return;
        };
        let segment = self.segments.get_mut(&start).expect("segment located");

        if segment.entry_count == 0 {
            return;
        }
        if segment.start_position + i64::from(segment.entry_count) - 1 < edit_unit {
            return;
        }

        let offset = (edit_unit - segment.start_position) as usize * entry_size;
        segment.entries[offset] = temporal_offset as u8;
        segment.entries[offset + 1] = key_frame_offset as u8;
        segment.entries[offset + 2] = flags;
    }

    /// Patch the stream offset of an existing entry
    pub fn update(&mut self, edit_unit: i64, stream_offset: u64) {
        let shape = self.shape;
        let Some(start) = self.locate_segment_or_before(edit_unit) else {
            return;
        };
        let segment = self.segments.get_mut(&start).expect("segment located");
        segment.update(shape, edit_unit, stream_offset);
    }

    /// Drop all segments wholly contained in the inclusive range
    pub fn purge(&mut self, first: i64, last: i64) {
        self.segments.retain(|start, segment| {
            *start < first || segment.end_position() - 1 > last
        });
    }

    /// The table's duration: the highest indexed position plus one
    ///
    /// For VBR tables this also refreshes the `index_duration` member.
    pub fn duration(&mut self) -> i64 {
        if self.edit_unit_byte_count == 0 {
            self.index_duration = self
                .segments
                .iter()
                .next_back()
                .map(|(start, segment)| *start + i64::from(segment.entry_count))
                .unwrap_or(0);
        }
        self.index_duration
    }

    /// Serialise the table as IndexTableSegment KLVs appended to `buffer`
    ///
    /// Returns the number of bytes appended. Unless
    /// `features.neg_precharge_index` is set, start positions are shifted
    /// by the pre-charge so the serialised values are never negative.
    pub fn write_index(&self, buffer: &mut Vec<u8>, features: &Features) -> Result<usize> {
        if self.shape.slice_count != 0 && self.base_delta_array.is_empty() {
            error!(
                slices = self.shape.slice_count,
                "index table has slices but no delta array; output will be invalid"
            );
        }

        let start_len = buffer.len();

        if self.edit_unit_byte_count != 0 {
            let start_position = if features.neg_precharge_index {
                -self.pre_charge
            } else {
                0
            };
            self.write_segment_klv(buffer, start_position, self.index_duration, None)?;
        } else {
            for segment in self.segments.values() {
                let start_position = if features.neg_precharge_index {
                    segment.start_position
                } else {
                    segment.start_position + self.pre_charge
                };
                self.write_segment_klv(
                    buffer,
                    start_position,
                    i64::from(segment.entry_count),
                    Some(segment),
                )?;
            }
        }

        Ok(buffer.len() - start_len)
    }

    /// Write one IndexTableSegment KLV
    fn write_segment_klv(
        &self,
        buffer: &mut Vec<u8>,
        start_position: i64,
        duration: i64,
        segment: Option<&IndexSegment>,
    ) -> Result<()> {
        let mut set = Vec::new();

        // Index table segments descend from InterchangeObject, so each
        // carries an InstanceUID even though nothing links to it
        write_local_item(&mut set, tag::INSTANCE_UID, Uuid::new_v4().as_bytes())?;

        let mut rate = [0u8; 8];
        BigEndian::write_i32(&mut rate[0..4], self.edit_rate.num);
        BigEndian::write_i32(&mut rate[4..8], self.edit_rate.den);
        write_local_item(&mut set, tag::INDEX_EDIT_RATE, &rate)?;

        write_local_item(
            &mut set,
            tag::INDEX_START_POSITION,
            &start_position.to_be_bytes(),
        )?;
        write_local_item(&mut set, tag::INDEX_DURATION, &duration.to_be_bytes())?;
        write_local_item(
            &mut set,
            tag::EDIT_UNIT_BYTE_COUNT,
            &self.edit_unit_byte_count.to_be_bytes(),
        )?;
        write_local_item(&mut set, tag::INDEX_SID, &self.index_sid.to_be_bytes())?;
        write_local_item(&mut set, tag::BODY_SID, &self.body_sid.to_be_bytes())?;

        match segment {
            None => {
                // CBR: delta array only, and only when it says something
                let deltas = if self.base_delta_array.len() > 1 {
                    encode_delta_array(&self.base_delta_array)
                } else {
                    encode_delta_array(&[])
                };
                write_local_item(&mut set, tag::DELTA_ENTRY_ARRAY, &deltas)?;
            }
            Some(segment) => {
                write_local_item(&mut set, tag::SLICE_COUNT, &[self.shape.slice_count])?;
                write_local_item(&mut set, tag::POS_TABLE_COUNT, &[self.shape.pos_table_count])?;

                if !segment.delta_array.is_empty() {
                    let deltas = encode_delta_array(&segment.delta_array);
                    write_local_item(&mut set, tag::DELTA_ENTRY_ARRAY, &deltas)?;
                }

                let mut entries =
                    Vec::with_capacity(8 + segment.entries.len());
                entries.write_u32::<BigEndian>(segment.entry_count)?;
                entries.write_u32::<BigEndian>(self.entry_size() as u32)?;
                entries.extend_from_slice(&segment.entries);
                write_local_item(&mut set, tag::INDEX_ENTRY_ARRAY, &entries)?;
            }
        }

        buffer.extend_from_slice(&labels::INDEX_TABLE_SEGMENT);
        klv::write_ber(buffer, set.len() as u64, 0)?;
        buffer.extend_from_slice(&set);
        Ok(())
    }

    /// Parse a concatenation of IndexTableSegment KLVs (as read from a
    /// partition's index byte area) into this table
    ///
    /// KLV fill items are skipped; any other key is reported and skipped.
    pub fn add_segments(&mut self, data: &[u8]) -> Result<()> {
        debug!(bytes = data.len(), "parsing index table data");

        let mut pos = 0;
        while data.len() - pos > 17 {
            let mut key = [0u8; 16];
            key.copy_from_slice(&data[pos..pos + 16]);
            let key = UniversalLabel(key);
            pos += 16;

            let (set_length, len_size) = klv::read_ber_slice(&data[pos..])?;
            pos += len_size;

            let mut set_length = set_length as usize;
            if set_length > data.len() - pos {
                error!(
                    key = %key,
                    claimed = set_length,
                    remaining = data.len() - pos,
                    "KLV claims more bytes than remain in index data"
                );
                set_length = data.len() - pos;
            }

            if key.is_index_segment() {
                self.add_segment_bytes(&data[pos..pos + set_length], 2)?;
            } else if !key.is_fill_item() {
                warn!(key = %key, "unexpected key inside index table data");
            }

            pos += set_length;
        }

        if pos != data.len() {
            warn!(extra = data.len() - pos, "trailing bytes after index table data");
        }
        Ok(())
    }

    /// Parse one IndexTableSegment local set body into this table
    ///
    /// `len_size` selects 2- or 4-byte local item lengths. CBR segments
    /// update the table parameters; VBR segments are added to the segment
    /// map. Returns the start position of an added VBR segment.
    pub fn add_segment_bytes(&mut self, data: &[u8], len_size: usize) -> Result<Option<i64>> {
        let mut edit_unit_byte_count: u32 = 0;
        let mut start_position: i64 = -1;
        let mut duration: i64 = -1;
        let mut slice_count: u8 = 0;
        let mut pos_table_count: u8 = 0;
        let mut delta_bytes: Option<Vec<u8>> = None;
        let mut entry_bytes: Option<Vec<u8>> = None;
        let mut edit_rate = self.edit_rate;
        let mut index_sid = self.index_sid;
        let mut body_sid = self.body_sid;

        klv::for_each_local_item(data, len_size, |item_tag, bytes| match item_tag {
            tag::INDEX_EDIT_RATE => {
                if bytes.len() >= 8 {
                    edit_rate = Rational::new(
                        BigEndian::read_i32(&bytes[0..4]),
                        BigEndian::read_i32(&bytes[4..8]),
                    );
                }
            }
            tag::INDEX_START_POSITION => {
                if bytes.len() >= 8 {
                    start_position = BigEndian::read_i64(bytes);
                }
            }
            tag::INDEX_DURATION => {
                if bytes.len() >= 8 {
                    duration = BigEndian::read_i64(bytes);
                }
            }
            tag::EDIT_UNIT_BYTE_COUNT => {
                if bytes.len() >= 4 {
                    edit_unit_byte_count = BigEndian::read_u32(bytes);
                }
            }
            tag::INDEX_SID => {
                if bytes.len() >= 4 && index_sid == 0 {
                    index_sid = BigEndian::read_u32(bytes);
                }
            }
            tag::BODY_SID => {
                if bytes.len() >= 4 && body_sid == 0 {
                    body_sid = BigEndian::read_u32(bytes);
                }
            }
            tag::SLICE_COUNT => {
                if !bytes.is_empty() {
                    slice_count = bytes[0];
                }
            }
            tag::POS_TABLE_COUNT => {
                if !bytes.is_empty() {
                    pos_table_count = bytes[0];
                }
            }
            tag::DELTA_ENTRY_ARRAY => delta_bytes = Some(bytes.to_vec()),
            tag::INDEX_ENTRY_ARRAY => entry_bytes = Some(bytes.to_vec()),
            _ => {}
        })?;

        self.edit_rate = edit_rate;
        self.index_sid = index_sid;
        self.body_sid = body_sid;

        if edit_unit_byte_count != 0 {
            // CBR parameters
            self.edit_unit_byte_count = edit_unit_byte_count;
            if duration > 0 {
                self.index_duration = duration;
            }
            if let Some(bytes) = delta_bytes {
                if let Some(deltas) = decode_delta_array(&bytes) {
                    if !deltas.is_empty() {
                        self.base_delta_array = deltas;
                    }
                }
            }
            return Ok(None);
        }

        // VBR segment
        if start_position == -1 {
            warn!("VBR index segment without a start position; assuming 0");
            start_position = 0;
        }

        self.shape = EntryShape {
            slice_count,
            pos_table_count,
        };
        let shape = self.shape;
        let entry_size = shape.entry_size();

        let delta_array = delta_bytes.and_then(|bytes| decode_delta_array(&bytes));

        // Adopt the first segment's delta array as the table base
        if self.base_delta_array.is_empty() {
            if let Some(deltas) = &delta_array {
                self.base_delta_array = deltas.clone();
            }
        }

        {
            let segment = self.add_segment(start_position);
            if let Some(deltas) = delta_array {
                segment.delta_array = deltas;
            }
        }

        match entry_bytes {
            None => {
                error!("no IndexEntryArray in a VBR index segment");
            }
            Some(bytes) if bytes.len() >= 8 => {
                let count = BigEndian::read_u32(&bytes[0..4]);
                let size = BigEndian::read_u32(&bytes[4..8]) as usize;

                if size != entry_size {
                    // Drop the offending segment entirely
                    self.segments.remove(&start_position);
                    return Err(MxfError::ShapeMismatch {
                        expected: entry_size,
                        actual: size,
                    });
                }

                let segment = self.add_segment(start_position);
                // Oversize segments appear in real files; accept them
                segment.add_index_entries(shape, count, entry_size, &bytes[8..], true)?;
            }
            Some(_) => {
                error!("IndexEntryArray too short to hold its header");
            }
        }

        Ok(Some(start_position))
    }
}

/// Encode a delta array as an MXF batch (count, entry size, entries)
fn encode_delta_array(deltas: &[DeltaEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + deltas.len() * 6);
    out.write_u32::<BigEndian>(deltas.len() as u32).expect("vec write");
    out.write_u32::<BigEndian>(6).expect("vec write");
    for delta in deltas {
        out.push(delta.pos_table_index as u8);
        out.push(delta.slice);
        out.write_u32::<BigEndian>(delta.element_delta).expect("vec write");
    }
    out
}

/// Decode a delta array batch, tolerating padded entry sizes
fn decode_delta_array(bytes: &[u8]) -> Option<Vec<DeltaEntry>> {
    if bytes.len() < 8 {
        return None;
    }

    let count = BigEndian::read_u32(&bytes[0..4]) as usize;
    let size = BigEndian::read_u32(&bytes[4..8]) as usize;

    if count == 0 {
        debug!("skipping empty delta entry array");
        return Some(Vec::new());
    }
    if size < 6 {
        error!(size, "delta entry array entries must be at least 6 bytes");
        return None;
    }
    if bytes.len() - 8 < count * size {
        error!(
            claimed = count * size,
            present = bytes.len() - 8,
            "malformed delta entry array"
        );
        return None;
    }

    let mut deltas = Vec::with_capacity(count);
    for i in 0..count {
        let entry = &bytes[8 + i * size..8 + i * size + 6];
        deltas.push(DeltaEntry {
            pos_table_index: entry[0] as i8,
            slice: entry[1],
            element_delta: BigEndian::read_u32(&entry[2..6]),
        });
    }
    Some(deltas)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vbr_table() -> IndexTable {
        let mut table = IndexTable::new();
        table.edit_rate = Rational::new(25, 1);
        table.index_sid = 129;
        table.body_sid = 1;
        table
    }

    #[test]
    fn entry_shape_sizes() {
        assert_eq!(EntryShape::default().entry_size(), 11);
        let shape = EntryShape {
            slice_count: 2,
            pos_table_count: 1,
        };
        assert_eq!(shape.entry_size(), 11 + 8 + 8);
    }

    #[test]
    fn cbr_lookup() {
        let mut table = IndexTable::new();
        table.edit_unit_byte_count = 1_048_576;
        table.edit_rate = Rational::new(25, 1);
        table.index_duration = 250;

        let pos = table.lookup(100, 0, true);
        assert_eq!(pos.location, 104_857_600);
        assert!(pos.exact);
        assert!(!pos.other_pos);
        assert_eq!(table.segment_count(), 0);
    }

    #[test]
    fn cbr_lookup_with_delta() {
        let mut table = IndexTable::new();
        table.edit_unit_byte_count = 1000;
        table.base_delta_array = vec![
            DeltaEntry::default(),
            DeltaEntry {
                pos_table_index: 0,
                slice: 0,
                element_delta: 600,
            },
        ];

        let pos = table.lookup(2, 1, false);
        assert_eq!(pos.location, 2600);
        assert!(pos.exact);

        // No delta for this sub-item
        let pos = table.lookup(2, 5, false);
        assert_eq!(pos.location, 2000);
        assert!(!pos.exact);
    }

    #[test]
    fn vbr_add_and_lookup() {
        let mut table = vbr_table();
        for i in 0..10i64 {
            table
                .add_index_entry(i, 0, 0, 0, (i as u64) * 100, &[], &[])
                .unwrap();
        }

        let pos = table.lookup(4, 0, true);
        assert_eq!(pos.location, 400);
        assert!(pos.exact);
        assert_eq!(pos.this_pos, 4);

        // Beyond the end: last entry, flagged other_pos
        let pos = table.lookup(50, 0, true);
        assert!(pos.other_pos);
        assert!(!pos.exact);
        assert_eq!(pos.this_pos, 9);
        assert_eq!(pos.location, 900);

        // Before the start: zeros
        let pos = table.lookup(-5, 0, true);
        assert!(!pos.exact);
        assert_eq!(pos.location, 0);

        assert_eq!(table.duration(), 10);
    }

    #[test]
    fn replacing_entry_is_rejected() {
        let mut table = vbr_table();
        table.add_index_entry(0, 0, 0, 0, 0, &[], &[]).unwrap();
        let err = table.add_index_entry(0, 0, 0, 0, 50, &[], &[]).unwrap_err();
        assert!(matches!(
            err,
            MxfError::EntryReplaceUnsupported { edit_unit: 0 }
        ));
    }

    #[test]
    fn shape_mismatch_rejected() {
        let mut table = vbr_table();
        let err = table
            .add_index_entry(0, 0, 0, 0, 0, &[1, 2], &[])
            .unwrap_err();
        assert!(matches!(err, MxfError::ShapeMismatch { expected: 0, actual: 2 }));
    }

    #[test]
    fn full_segment_spills_into_new_one() {
        let mut table = vbr_table();
        // 11-byte entries: (0xFFFF - 8) / 11 = 5956 entries per segment
        let per_segment = (0xFFFF - 8) / 11;
        for i in 0..(per_segment as i64 + 10) {
            table
                .add_index_entry(i, 0, 0, 0, i as u64, &[], &[])
                .unwrap();
        }

        assert_eq!(table.segment_count(), 2);
        let pos = table.lookup(per_segment as i64 + 5, 0, false);
        assert!(pos.exact);
        assert_eq!(pos.location, per_segment as u64 + 5);
    }

    #[test]
    fn temporal_reorder_lookup() {
        let mut table = vbr_table();
        // I B B P in decode order with temporal offsets mapping to
        // presentation order
        table.add_index_entry(0, 2, 0, 0x00, 0, &[], &[]).unwrap();
        table.add_index_entry(1, 1, -1, 0x33, 100, &[], &[]).unwrap();
        table.add_index_entry(2, -1, -2, 0x33, 200, &[], &[]).unwrap();
        table.add_index_entry(3, 0, 0, 0x22, 300, &[], &[]).unwrap();

        // Reordered lookup at 0 resolves through the +2 offset
        let pos = table.lookup(0, 0, true);
        assert_eq!(pos.this_pos, 2);
        assert_eq!(pos.location, 200);
        assert_eq!(pos.temporal_offset, 2);

        // Applying lookup twice yields the same location
        let again = table.lookup(0, 0, true);
        assert_eq!(again.location, pos.location);

        // Without reordering the entry is returned verbatim
        let raw = table.lookup(0, 0, false);
        assert_eq!(raw.this_pos, 0);
        assert_eq!(raw.location, 0);
        assert_eq!(raw.temporal_offset, 2);
    }

    #[test]
    fn key_frame_location() {
        let mut table = vbr_table();
        table.add_index_entry(0, 0, 0, 0, 0, &[], &[]).unwrap();
        table.add_index_entry(1, 0, -1, 0, 100, &[], &[]).unwrap();
        table.add_index_entry(2, 0, -2, 0, 200, &[], &[]).unwrap();

        let pos = table.lookup(2, 0, false);
        assert_eq!(pos.key_frame_offset, -2);
        assert_eq!(pos.key_location, 0);

        // A key frame before the segment start is unresolvable
        let mut table = vbr_table();
        table.add_index_entry(5, 0, -3, 0, 500, &[], &[]).unwrap();
        let pos = table.lookup(5, 0, false);
        assert_eq!(pos.key_location, KEY_LOCATION_UNKNOWN);
    }

    #[test]
    fn update_and_correct() {
        let mut table = vbr_table();
        table.add_index_entry(0, 0, 0, 0, 0, &[], &[]).unwrap();
        table.add_index_entry(1, 0, 0, 0, 0, &[], &[]).unwrap();

        table.update(1, 12345);
        table.correct(1, -2, -1, 0x80);

        let pos = table.lookup(1, 0, false);
        assert_eq!(pos.location, 12345);
        assert_eq!(pos.temporal_offset, -2);
        assert_eq!(pos.key_frame_offset, -1);
        assert_eq!(pos.flags, 0x80);

        // Out of range: silently ignored
        table.update(100, 1);
        table.correct(-10, 0, 0, 0);
    }

    #[test]
    fn purge_whole_segments() {
        let mut table = vbr_table();
        for i in 0..5i64 {
            table.add_index_entry(i, 0, 0, 0, i as u64, &[], &[]).unwrap();
        }
        table.add_segment(100);
        for i in 100..105i64 {
            table.add_index_entry(i, 0, 0, 0, i as u64, &[], &[]).unwrap();
        }
        assert_eq!(table.segment_count(), 2);

        // Range covers only the first segment
        table.purge(0, 50);
        assert_eq!(table.segment_count(), 1);
        assert!(table.lookup(102, 0, false).exact);
    }

    #[test]
    fn write_and_reload_vbr() {
        let mut table = vbr_table();
        for i in 0..20i64 {
            table
                .add_index_entry(i, 0, 0, 0, (i as u64) * 1000, &[], &[])
                .unwrap();
        }

        let mut buffer = Vec::new();
        table.write_index(&mut buffer, &Features::default()).unwrap();

        let mut reloaded = IndexTable::new();
        reloaded.add_segments(&buffer).unwrap();

        assert_eq!(reloaded.index_sid, 129);
        assert_eq!(reloaded.body_sid, 1);
        assert_eq!(reloaded.edit_unit_byte_count, 0);
        assert_eq!(reloaded.segment_count(), 1);

        let pos = reloaded.lookup(7, 0, false);
        assert_eq!(pos.location, 7000);
        assert!(pos.exact);
    }

    #[test]
    fn write_and_reload_cbr() {
        let mut table = IndexTable::new();
        table.edit_rate = Rational::new(25, 1);
        table.index_sid = 129;
        table.body_sid = 1;
        table.edit_unit_byte_count = 2048;
        table.index_duration = 250;

        let mut buffer = Vec::new();
        table.write_index(&mut buffer, &Features::default()).unwrap();

        let mut reloaded = IndexTable::new();
        reloaded.add_segments(&buffer).unwrap();
        assert_eq!(reloaded.edit_unit_byte_count, 2048);
        assert_eq!(reloaded.index_duration, 250);
        assert_eq!(reloaded.lookup(10, 0, false).location, 20480);
    }

    #[test]
    fn precharge_shifts_serialised_start() {
        let mut table = vbr_table();
        table.pre_charge = 2;
        for i in -2..8i64 {
            table
                .add_index_entry(i, 0, 0, 0, ((i + 2) as u64) * 10, &[], &[])
                .unwrap();
        }

        let mut buffer = Vec::new();
        table.write_index(&mut buffer, &Features::default()).unwrap();

        // With the feature off the serialised start position must be >= 0
        let mut reloaded = IndexTable::new();
        reloaded.add_segments(&buffer).unwrap();
        let segment = reloaded.segments().next().unwrap();
        assert_eq!(segment.start_position, 0);

        // With the feature on the raw start position is kept
        let features = Features {
            neg_precharge_index: true,
            ..Default::default()
        };
        let mut buffer = Vec::new();
        table.write_index(&mut buffer, &features).unwrap();
        let mut reloaded = IndexTable::new();
        reloaded.add_segments(&buffer).unwrap();
        let segment = reloaded.segments().next().unwrap();
        assert_eq!(segment.start_position, -2);
    }

    #[test]
    fn segment_layout_invariant() {
        let mut table = vbr_table();
        table.shape = EntryShape {
            slice_count: 1,
            pos_table_count: 0,
        };
        table.base_delta_array = vec![
            DeltaEntry::default(),
            DeltaEntry {
                pos_table_index: 0,
                slice: 1,
                element_delta: 0,
            },
        ];

        for i in 0..5i64 {
            table
                .add_index_entry(i, 0, 0, 0, i as u64 * 10, &[500], &[])
                .unwrap();
        }

        let segment = table.segments().next().unwrap();
        assert_eq!(
            segment.entry_bytes().len(),
            5 * table.entry_size()
        );
        assert_eq!(table.entry_size(), 15);

        // Slice offset resolves sub-item 1 into the second slice
        let pos = table.lookup(2, 1, false);
        assert_eq!(pos.location, 20 + 500);
    }

    #[test]
    fn mismatched_entry_size_drops_segment() {
        let mut table = vbr_table();

        // Build a segment claiming 15-byte entries against an 11-byte shape
        let mut set = Vec::new();
        write_local_item(&mut set, 0x3F0C, &0i64.to_be_bytes()).unwrap();
        write_local_item(&mut set, 0x3F0D, &1i64.to_be_bytes()).unwrap();
        write_local_item(&mut set, 0x3F05, &0u32.to_be_bytes()).unwrap();
        write_local_item(&mut set, 0x3F06, &129u32.to_be_bytes()).unwrap();
        write_local_item(&mut set, 0x3F07, &1u32.to_be_bytes()).unwrap();
        write_local_item(&mut set, 0x3F08, &[0]).unwrap();
        write_local_item(&mut set, 0x3F0E, &[0]).unwrap();
        let mut entries = vec![0u8; 8 + 15];
        BigEndian::write_u32(&mut entries[0..4], 1);
        BigEndian::write_u32(&mut entries[4..8], 15);
        write_local_item(&mut set, 0x3F0A, &entries).unwrap();

        let err = table.add_segment_bytes(&set, 2).unwrap_err();
        assert!(matches!(err, MxfError::ShapeMismatch { expected: 11, actual: 15 }));
        assert_eq!(table.segment_count(), 0);
    }

    #[test]
    fn define_delta_array_slices() {
        let mut table = IndexTable::new();
        // VBR picture, CBR sound (0x600), VBR data, CBR sound
        table.define_delta_array(&[0, 0x600, 0, 0x300]);

        assert_eq!(table.shape.slice_count, 2);
        let deltas = &table.base_delta_array;
        assert_eq!(deltas[0], DeltaEntry { pos_table_index: 0, slice: 0, element_delta: 0 });
        assert_eq!(deltas[1], DeltaEntry { pos_table_index: 0, slice: 1, element_delta: 0 });
        assert_eq!(deltas[2], DeltaEntry { pos_table_index: 0, slice: 1, element_delta: 0x600 });
        assert_eq!(deltas[3], DeltaEntry { pos_table_index: 0, slice: 2, element_delta: 0 });
    }

    #[test]
    fn monotonic_stream_offsets() {
        let mut table = vbr_table();
        let sizes = [100u64, 250, 80, 4000, 1];
        let mut offset = 0u64;
        for (i, size) in sizes.iter().enumerate() {
            table
                .add_index_entry(i as i64, 0, 0, 0, offset, &[], &[])
                .unwrap();
            offset += size;
        }

        let segment = table.segments().next().unwrap();
        let mut last = 0u64;
        for i in 0..segment.entry_count as usize {
            let entry = &segment.entry_bytes()[i * 11..(i + 1) * 11];
            let offset = BigEndian::read_u64(&entry[3..11]);
            assert!(offset >= last);
            last = offset;
        }
    }
}
