//! Collection and resolution of per-edit-unit index facts
//!
//! During wrapping, index information arrives from two directions: the
//! essence parser knows about picture types, key frames and temporal
//! reordering, while the container writer knows the byte offset each edit
//! unit lands at. The [`IndexManager`] merges both streams of facts and
//! materialises them into an [`IndexTable`] once entries are complete.

use crate::error::{MxfError, Result};
use crate::index::{IndexTable, INDEX_LOWEST};
use mxfkit_core::Rational;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use tracing::{error, warn};

/// An index manager shared between a parser and a container writer.
///
/// All sharing is within one thread; callers clone the handle and borrow
/// mutably for the duration of each call.
pub type SharedIndexManager = Rc<RefCell<IndexManager>>;

/// Status bit: the main stream offset has been set
const STATUS_OFFSET: u8 = 0x01;
/// Status bit: a temporal offset has been applied to this entry
const STATUS_TEMPORAL_OFFSET: u8 = 0x02;
/// Status bit: a temporal difference has been applied to this entry
const STATUS_TEMPORAL_DIFF: u8 = 0x04;

/// Working data for one edit unit
#[derive(Debug, Clone)]
struct IndexData {
    /// Byte offset of each sub-stream's element for this edit unit
    stream_offset: Vec<u64>,
    temporal_offset: i8,
    temporal_diff: i8,
    key_offset: i8,
    flags: u8,
    /// Status bits; once set a bit is never cleared
    status: u8,
}

impl IndexData {
    fn new(stream_count: usize) -> Self {
        IndexData {
            stream_offset: vec![0; stream_count],
            temporal_offset: 0,
            temporal_diff: 0,
            key_offset: 0,
            flags: 0,
            status: 0,
        }
    }
}

/// Merges per-edit-unit facts offered by parsers and writers and builds
/// index tables from them
#[derive(Debug)]
pub struct IndexManager {
    format_fixed: bool,
    uses_reordering: bool,
    data_is_cbr: bool,

    pos_table_list: Vec<i32>,
    element_sizes: Vec<u32>,
    master_stream: usize,

    /// BodySID for tables built from this manager
    pub body_sid: u32,
    /// IndexSID for tables built from this manager
    pub index_sid: u32,
    /// Edit rate for tables built from this manager
    pub edit_rate: Rational,
    /// Duration for CBR tables built from this manager
    pub index_duration: i64,

    pre_charge: i64,
    sub_range_offset: i64,

    managed: BTreeMap<i64, IndexData>,
    unsatisfied_temporal_offsets: BTreeMap<i64, i8>,
    unsatisfied_temporal_diffs: BTreeMap<i64, i8>,

    provisional: Option<(i64, IndexData)>,
    last_new_edit_unit: i64,

    next_log_id: i32,
    log_wrapped: bool,
    log_next_entry: i32,
    entry_log: HashMap<i32, i64>,
    accept_next_entry: bool,
}

impl IndexManager {
    /// Construct with the main stream's details
    ///
    /// A negative `pos_table_index` declares that the stream needs
    /// temporal reordering; a non-zero `element_size` declares CBR data.
    pub fn new(pos_table_index: i32, element_size: u32) -> Self {
        IndexManager {
            format_fixed: false,
            uses_reordering: pos_table_index < 0,
            data_is_cbr: element_size > 0,
            pos_table_list: vec![pos_table_index],
            element_sizes: vec![element_size],
            master_stream: 0,
            body_sid: 0,
            index_sid: 0,
            edit_rate: Rational::new(1, 1),
            index_duration: 0,
            pre_charge: 0,
            sub_range_offset: 0,
            managed: BTreeMap::new(),
            unsatisfied_temporal_offsets: BTreeMap::new(),
            unsatisfied_temporal_diffs: BTreeMap::new(),
            provisional: None,
            last_new_edit_unit: INDEX_LOWEST,
            next_log_id: 0,
            log_wrapped: false,
            log_next_entry: -1,
            entry_log: HashMap::new(),
            accept_next_entry: false,
        }
    }

    /// Wrap a manager for sharing between a parser and a writer
    pub fn shared(self) -> SharedIndexManager {
        Rc::new(RefCell::new(self))
    }

    /// Add a sub-stream, returning its stream number
    ///
    /// Fails once the layout has been frozen by the first committed entry
    /// or a call to [`IndexManager::make_index`].
    pub fn add_sub_stream(&mut self, pos_table_index: i32, element_size: u32) -> Result<usize> {
        if self.format_fixed {
            return Err(MxfError::FormatFixed);
        }

        if pos_table_index < 0 {
            self.uses_reordering = true;
        }
        if element_size == 0 {
            self.data_is_cbr = false;
        }

        self.pos_table_list.push(pos_table_index);
        self.element_sizes.push(element_size);
        Ok(self.pos_table_list.len() - 1)
    }

    /// Number of streams (main plus sub-streams)
    pub fn stream_count(&self) -> usize {
        self.pos_table_list.len()
    }

    /// Does any stream require temporal reordering?
    pub fn uses_reordering(&self) -> bool {
        self.uses_reordering
    }

    /// Is every stream constant-bit-rate?
    pub fn is_cbr(&self) -> bool {
        self.data_is_cbr
    }

    /// The edit unit most recently added to the committed map
    pub fn last_new_edit_unit(&self) -> i64 {
        self.last_new_edit_unit
    }

    /// Set the pre-charge carried into built index tables
    pub fn set_pre_charge(&mut self, pre_charge: i64) {
        self.pre_charge = pre_charge;
    }

    /// Offset subtracted from edit units when the essence is sub-ranged
    pub fn set_sub_range_offset(&mut self, offset: i64) {
        self.sub_range_offset = offset;
    }

    /// Find or create the committed entry for an edit unit, promoting or
    /// discarding any outstanding provisional entry
    fn entry_for(&mut self, edit_unit: i64) -> &mut IndexData {
        self.format_fixed = true;

        if let Some((provisional_unit, data)) = self.provisional.take() {
            if provisional_unit == edit_unit {
                // Same edit unit: keep the data already gathered
                self.managed.entry(edit_unit).or_insert(data);
                self.last_new_edit_unit = edit_unit;
            }
            // A provisional entry for any other edit unit is dropped
        }

        if !self.managed.contains_key(&edit_unit) {
            let mut data = IndexData::new(self.stream_count());

            // Apply any facts that arrived before the entry existed
            if let Some(offset) = self.unsatisfied_temporal_offsets.remove(&edit_unit) {
                data.temporal_offset = offset;
                data.status |= STATUS_TEMPORAL_OFFSET;
            }
            if let Some(diff) = self.unsatisfied_temporal_diffs.remove(&edit_unit) {
                data.temporal_diff = diff;
                data.status |= STATUS_TEMPORAL_DIFF;
            }

            self.managed.insert(edit_unit, data);
            self.last_new_edit_unit = edit_unit;
        }

        self.managed.get_mut(&edit_unit).expect("entry just ensured")
    }

    /// Add an edit unit without a known offset
    ///
    /// The edit unit is absolute from the stream start. Only the master
    /// stream may set the key offset and flags.
    pub fn add_edit_unit(
        &mut self,
        sub_stream: usize,
        edit_unit: i64,
        key_offset: i8,
        flags: Option<u8>,
    ) {
        if self.data_is_cbr {
            return;
        }
        let edit_unit = edit_unit - self.sub_range_offset;

        let master = sub_stream == self.master_stream;
        let entry = self.entry_for(edit_unit);
        if master {
            if key_offset != 0 {
                entry.key_offset = key_offset;
            }
            if let Some(flags) = flags {
                entry.flags = flags;
            }
        }

        self.log(edit_unit);
    }

    /// Offer an edit unit; always accepted
    pub fn offer_edit_unit(
        &mut self,
        sub_stream: usize,
        edit_unit: i64,
        key_offset: i8,
        flags: Option<u8>,
    ) -> bool {
        self.add_edit_unit(sub_stream, edit_unit, key_offset, flags);
        true
    }

    /// Set the stream offset of an edit unit for one sub-stream
    ///
    /// The edit unit here is relative to any sub-range, so it starts at 0
    /// (or is negative within pre-charge).
    pub fn set_offset(
        &mut self,
        sub_stream: usize,
        edit_unit: i64,
        offset: u64,
        key_offset: i8,
        flags: Option<u8>,
    ) {
        if self.data_is_cbr {
            return;
        }

        let master = sub_stream == self.master_stream;
        let entry = self.entry_for(edit_unit);
        entry.status |= STATUS_OFFSET;
        entry.stream_offset[sub_stream] = offset;
        if master {
            if key_offset != 0 {
                entry.key_offset = key_offset;
            }
            if let Some(flags) = flags {
                entry.flags = flags;
            }
        }

        self.log(edit_unit);
    }

    /// Offer a stream offset; always accepted
    pub fn offer_offset(
        &mut self,
        sub_stream: usize,
        edit_unit: i64,
        offset: u64,
        key_offset: i8,
        flags: Option<u8>,
    ) -> bool {
        self.set_offset(sub_stream, edit_unit, offset, key_offset, flags);
        true
    }

    /// Record a provisional entry: gathered like a committed one but held
    /// outside the map until the next committed fact either promotes it
    /// (same edit unit) or discards it
    pub fn set_provisional_offset(&mut self, sub_stream: usize, edit_unit: i64, offset: u64) {
        if self.data_is_cbr {
            return;
        }
        self.format_fixed = true;

        let mut data = match self.provisional.take() {
            Some((unit, data)) if unit == edit_unit => data,
            _ => {
                let mut data = IndexData::new(self.stream_count());
                if let Some(offset) = self.unsatisfied_temporal_offsets.remove(&edit_unit) {
                    data.temporal_offset = offset;
                    data.status |= STATUS_TEMPORAL_OFFSET;
                }
                if let Some(diff) = self.unsatisfied_temporal_diffs.remove(&edit_unit) {
                    data.temporal_diff = diff;
                    data.status |= STATUS_TEMPORAL_DIFF;
                }
                data
            }
        };

        data.status |= STATUS_OFFSET;
        data.stream_offset[sub_stream] = offset;
        self.provisional = Some((edit_unit, data));
    }

    /// Commit the outstanding provisional entry, returning its edit unit
    pub fn accept_provisional(&mut self) -> Option<i64> {
        let (edit_unit, data) = self.provisional.take()?;
        self.managed.entry(edit_unit).or_insert(data);
        self.last_new_edit_unit = edit_unit;
        Some(edit_unit)
    }

    /// Set the temporal offset for an edit unit, and the reverse
    /// difference on the entry the offset points at
    pub fn set_temporal_offset(&mut self, edit_unit: i64, offset: i8) {
        if self.data_is_cbr {
            return;
        }
        let edit_unit = edit_unit - self.sub_range_offset;

        // Forward offset on this entry
        match &mut self.provisional {
            Some((unit, data)) if *unit == edit_unit => {
                data.status |= STATUS_TEMPORAL_OFFSET;
                data.temporal_offset = offset;
            }
            _ => match self.managed.get_mut(&edit_unit) {
                Some(entry) => {
                    entry.status |= STATUS_TEMPORAL_OFFSET;
                    entry.temporal_offset = offset;
                }
                None => {
                    self.unsatisfied_temporal_offsets.insert(edit_unit, offset);
                }
            },
        }

        // Reverse difference on the target entry
        let target = edit_unit + i64::from(offset);
        match &mut self.provisional {
            Some((unit, data)) if *unit == target => {
                data.status |= STATUS_TEMPORAL_DIFF;
                data.temporal_diff = -offset;
            }
            _ => match self.managed.get_mut(&target) {
                Some(entry) => {
                    entry.status |= STATUS_TEMPORAL_DIFF;
                    entry.temporal_diff = -offset;
                }
                None => {
                    self.unsatisfied_temporal_diffs.insert(target, -offset);
                }
            },
        }
    }

    /// Offer a temporal offset; always accepted
    pub fn offer_temporal_offset(&mut self, edit_unit: i64, offset: i8) -> bool {
        self.set_temporal_offset(edit_unit, offset);
        true
    }

    /// Set the key-frame offset of an existing edit unit
    pub fn set_key_offset(&mut self, edit_unit: i64, offset: i8) {
        if self.data_is_cbr {
            return;
        }
        let edit_unit = edit_unit - self.sub_range_offset;

        match &mut self.provisional {
            Some((unit, data)) if *unit == edit_unit => data.key_offset = offset,
            _ => match self.managed.get_mut(&edit_unit) {
                Some(entry) => entry.key_offset = offset,
                None => error!(edit_unit, "key offset offered for an unknown edit unit"),
            },
        }
    }

    /// Set the flags of an existing edit unit
    pub fn set_flags(&mut self, edit_unit: i64, flags: u8) {
        if self.data_is_cbr {
            return;
        }
        let edit_unit = edit_unit - self.sub_range_offset;

        match &mut self.provisional {
            Some((unit, data)) if *unit == edit_unit => data.flags = flags,
            _ => match self.managed.get_mut(&edit_unit) {
                Some(entry) => entry.flags = flags,
                None => error!(edit_unit, "flags offered for an unknown edit unit"),
            },
        }
    }

    /// Record the edit unit of the next committed entry in the log
    fn log(&mut self, edit_unit: i64) {
        if self.log_next_entry >= 0 {
            self.entry_log.insert(self.log_next_entry, edit_unit);
            self.log_next_entry = -1;
            self.accept_next_entry = false;
        }
    }

    /// Arm logging of the next edit unit committed
    ///
    /// Returns an ID for [`IndexManager::check_log`], or -1 when the
    /// 31-bit ID pool is exhausted.
    pub fn log_next(&mut self) -> i32 {
        if self.log_next_entry >= 0 {
            return self.log_next_entry;
        }
        if self.next_log_id < 0 {
            return -1;
        }

        self.log_next_entry = self.next_log_id;

        if !self.log_wrapped {
            self.next_log_id += 1;
            if self.next_log_id > 0 {
                return self.log_next_entry;
            }
            // The pool wrapped; from now on search for free slots
            self.log_wrapped = true;
            self.next_log_id = -1;
        }

        // Search upwards from the next slot, then from the bottom
        let mut try_id = self.next_log_id.wrapping_add(1);
        while try_id >= 0 {
            if try_id != self.log_next_entry && !self.entry_log.contains_key(&try_id) {
                self.next_log_id = try_id;
                return self.log_next_entry;
            }
            match try_id.checked_add(1) {
                Some(next) => try_id = next,
                None => break,
            }
        }

        let mut try_id = 0;
        while try_id < self.log_next_entry {
            if !self.entry_log.contains_key(&try_id) {
                self.next_log_id = try_id;
                return self.log_next_entry;
            }
            try_id += 1;
        }

        -1
    }

    /// Arm logging and acceptance of the next edit unit offered
    pub fn accept_log_next(&mut self) -> i32 {
        self.accept_next_entry = true;
        self.log_next()
    }

    /// Is the next offered edit unit armed for forced acceptance?
    pub fn accepting_next(&self) -> bool {
        self.accept_next_entry
    }

    /// Read a logged edit unit
    pub fn check_log(&self, id: i32) -> Option<i64> {
        self.entry_log.get(&id).copied()
    }

    /// Release a log slot
    pub fn clear_log(&mut self, id: i32) {
        self.entry_log.remove(&id);
    }

    /// Free committed entries in an inclusive edit-unit range
    pub fn flush(&mut self, first: i64, last: i64) {
        if self.data_is_cbr {
            return;
        }
        self.managed.retain(|unit, _| *unit < first || *unit > last);
    }

    /// Build an index table matching this manager's layout
    ///
    /// CBR managers produce a table with `edit_unit_byte_count` equal to
    /// the sum of element sizes and no segments; VBR managers produce an
    /// empty table ready for [`IndexManager::add_entries_to_index`].
    pub fn make_index(&mut self) -> IndexTable {
        self.format_fixed = true;

        let mut table = IndexTable::new();
        table.index_sid = self.index_sid;
        table.body_sid = self.body_sid;
        table.edit_rate = self.edit_rate;
        table.pre_charge = self.pre_charge;

        table.define_delta_array(&self.element_sizes);
        for (delta, &pos_table_index) in table
            .base_delta_array
            .iter_mut()
            .zip(self.pos_table_list.iter())
        {
            delta.pos_table_index = pos_table_index as i8;
        }

        if self.data_is_cbr {
            table.edit_unit_byte_count = self.element_sizes.iter().sum();
            table.index_duration = self.index_duration;
        }

        table
    }

    /// Add all complete entries in a range to an index table
    ///
    /// Entries missing required status bits are skipped. When
    /// `undo_reorder` is set, entries are written at their presentation
    /// position (`edit_unit + temporal_diff`) and the reordering markers
    /// in the table's delta array are cleared.
    ///
    /// Returns the number of entries added.
    pub fn add_entries_to_index(
        &mut self,
        undo_reorder: bool,
        table: &mut IndexTable,
        first: i64,
        last: i64,
    ) -> Result<usize> {
        if self.data_is_cbr {
            return Ok(0);
        }

        let slice_count = usize::from(table.shape.slice_count);
        let mut slice_offsets = vec![0u32; slice_count];

        if table.shape.pos_table_count != 0 {
            error!("PosTable entries are not generated by the index manager");
            table.shape.pos_table_count = 0;
        }

        if self.uses_reordering && undo_reorder {
            for delta in table.base_delta_array.iter_mut() {
                if delta.pos_table_index < 0 {
                    delta.pos_table_index = 0;
                }
            }
        }

        let mut status_test = STATUS_OFFSET;
        if self.uses_reordering {
            status_test |= STATUS_TEMPORAL_OFFSET;
        }
        if undo_reorder {
            status_test |= STATUS_TEMPORAL_DIFF;
        }

        let mut added = 0;
        for (&edit_unit, entry) in self.managed.range(first..=last) {
            if entry.status & status_test != status_test {
                continue;
            }

            let stream_pos = entry.stream_offset[0];

            // Slice offsets come from the offsets of the VBR sub-streams
            let mut slice = 0;
            for i in 0..self.stream_count().saturating_sub(1) {
                if self.element_sizes[i] == 0 {
                    let next_pos = entry.stream_offset[i + 1];
                    slice_offsets[slice] = if next_pos >= stream_pos {
                        (next_pos - stream_pos) as u32
                    } else {
                        // Offset not recorded for this sub-stream; a zero
                        // slice offset is the least damaging value
                        warn!(edit_unit, sub_stream = i + 1, "missing slice offset");
                        0
                    };
                    slice += 1;
                }
            }

            let this_edit_unit = if undo_reorder {
                edit_unit + i64::from(entry.temporal_diff)
            } else {
                edit_unit
            };

            table.add_index_entry(
                this_edit_unit,
                entry.temporal_offset,
                entry.key_offset,
                entry.flags,
                stream_pos,
                &slice_offsets,
                &[],
            )?;
            added += 1;
        }

        Ok(added)
    }
}
