//! Generic Container writing: KLV wrapping, interleave and alignment
//!
//! A [`GcWriter`] serialises one content package at a time. Streams are
//! registered up front, data is queued per content package, and
//! [`GcWriter::start_new_cp`] drains the queue in canonical write order
//! (CP system, GC system, CP/GC picture, CP/GC sound, CP/GC data,
//! compound), KAG-aligning each KLV with filler as required.

use crate::config::Features;
use crate::error::{MxfError, Result};
use crate::essence::{essence_element_key, EssenceSource};
use crate::index_manager::SharedIndexManager;
use mxfkit_core::klv::{self, FAST_CLIP_LENGTH};
use mxfkit_core::ul::labels;
use mxfkit_core::{UniversalLabel, UL};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::io::{Seek, SeekFrom, Write};
use std::rc::Rc;
use tracing::{error, warn};

/// Identifier of one stream within a [`GcWriter`]
pub type GcStreamId = usize;

/// Essence source shared between its owning stream and the write queue
pub type SharedEssenceSource = Rc<RefCell<dyn EssenceSource>>;

/// Bytes streamed per write call when draining an essence source
const STREAM_CHUNK: usize = 32 * 1024;

/// Largest value length a filler KLV can carry
const MAX_FILLER_VALUE: u64 = 0xFF_FFFF;

/// Indexing hookup for one stream
#[derive(Clone)]
struct StreamIndexing {
    manager: SharedIndexManager,
    sub_stream: usize,
    /// Index the filler preceding this stream's KLV instead of the key
    index_filler: bool,
    /// Offer an offset per edit unit inside a clip-wrapped KLV
    index_clip: bool,
}

/// Data held per registered stream
struct GcStreamData {
    specified_key: Option<(UniversalLabel, bool)>,
    is_system: bool,
    reg_designator: u8,
    item_type: u8,
    scheme_or_count: u8,
    element: u8,
    sub_or_number: u8,
    len_size: usize,
    indexing: Option<StreamIndexing>,
    count_fixed: bool,
    write_order: u32,
}

/// Payload of one queued write
enum Payload {
    Buffer(Vec<u8>),
    Source {
        source: SharedEssenceSource,
        fast_clip: bool,
    },
}

/// One item queued for the current content package
struct WriteBlock {
    stream: GcStreamId,
    payload: Payload,
}

/// Writes the essence of one Generic Container
pub struct GcWriter {
    body_sid: u32,
    kag_size: u32,
    force_filler_ber4: bool,
    features: Features,

    streams: Vec<GcStreamData>,
    used_write_orders: HashMap<u32, GcStreamId>,

    /// Edit unit of the content package currently being gathered
    index_edit_unit: i64,
    pre_charge: i64,
    stream_offset: u64,

    write_queue: BTreeMap<u32, WriteBlock>,
}

impl GcWriter {
    /// Create a writer for one essence container
    pub fn new(body_sid: u32, features: Features) -> Self {
        GcWriter {
            body_sid,
            kag_size: 1,
            force_filler_ber4: false,
            features,
            streams: Vec::new(),
            used_write_orders: HashMap::new(),
            index_edit_unit: 0,
            pre_charge: 0,
            stream_offset: 0,
            write_queue: BTreeMap::new(),
        }
    }

    /// The BodySID of this container
    pub fn body_sid(&self) -> u32 {
        self.body_sid
    }

    /// Set the KLV alignment grid, optionally forcing 4-byte BER fillers
    pub fn set_kag(&mut self, kag_size: u32, force_ber4: bool) {
        self.kag_size = kag_size.max(1);
        self.force_filler_ber4 = force_ber4;
    }

    /// The current KAG size
    pub fn kag(&self) -> u32 {
        self.kag_size
    }

    /// Register an essence element stream
    ///
    /// `essence_type` is the GC item type byte (0x05/0x15 picture,
    /// 0x06/0x16 sound, 0x07/0x17 data, 0x18 compound).
    pub fn add_essence_element(
        &mut self,
        essence_type: u8,
        element_type: u8,
        len_size: usize,
    ) -> GcStreamId {
        let number = self
            .streams
            .iter()
            .filter(|s| !s.is_system && s.item_type == essence_type && s.element == element_type)
            .count() as u8;

        let write_order =
            self.claim_write_order(default_write_order(essence_type, element_type, number + 1));

        self.streams.push(GcStreamData {
            specified_key: None,
            is_system: false,
            reg_designator: 0,
            item_type: essence_type,
            scheme_or_count: 0,
            element: element_type,
            sub_or_number: number + 1,
            len_size,
            indexing: None,
            count_fixed: false,
            write_order,
        });
        let id = self.streams.len() - 1;
        self.used_write_orders.insert(write_order, id);
        id
    }

    /// Register a system item stream
    pub fn add_system_element(
        &mut self,
        cp_compatible: bool,
        registry_designator: u8,
        scheme_id: u8,
        element_id: u8,
        sub_id: u8,
    ) -> GcStreamId {
        let item_type = if cp_compatible { 0x04 } else { 0x14 };
        let write_order = self.claim_write_order(default_write_order(item_type, element_id, sub_id));

        self.streams.push(GcStreamData {
            specified_key: None,
            is_system: true,
            reg_designator: registry_designator,
            item_type,
            scheme_or_count: scheme_id,
            element: element_id,
            sub_or_number: sub_id,
            len_size: 0,
            indexing: None,
            count_fixed: true,
            write_order,
        });
        let id = self.streams.len() - 1;
        self.used_write_orders.insert(write_order, id);
        id
    }

    /// Register an essence element with an explicit key
    ///
    /// With `non_gc` set the key's track-number bytes are left untouched
    /// and the stream reports a zero track number.
    pub fn add_essence_element_with_key(
        &mut self,
        key: UniversalLabel,
        len_size: usize,
        non_gc: bool,
    ) -> GcStreamId {
        let kind = key.element_kind();
        let item_type = kind.map(|k| k.item).unwrap_or(0x15);
        let element = kind.map(|k| k.element_type).unwrap_or(0);
        let number = kind.map(|k| k.number).unwrap_or(0);

        let write_order = self.claim_write_order(default_write_order(item_type, element, number));

        self.streams.push(GcStreamData {
            specified_key: Some((key, non_gc)),
            is_system: false,
            reg_designator: 0,
            item_type,
            scheme_or_count: 0,
            element,
            sub_or_number: number,
            len_size,
            indexing: None,
            count_fixed: true,
            write_order,
        });
        let id = self.streams.len() - 1;
        self.used_write_orders.insert(write_order, id);
        id
    }

    /// Attach an index manager to a stream
    pub fn add_stream_index(
        &mut self,
        id: GcStreamId,
        manager: SharedIndexManager,
        sub_stream: usize,
        index_filler: bool,
        index_clip: bool,
    ) {
        self.streams[id].indexing = Some(StreamIndexing {
            manager,
            sub_stream,
            index_filler,
            index_clip,
        });
    }

    /// The GC track number of a stream
    ///
    /// Reporting a track number fixes the element count of the key.
    pub fn track_number(&mut self, id: GcStreamId) -> u32 {
        self.fix_count(id);
        let stream = &self.streams[id];
        if let Some((key, non_gc)) = &stream.specified_key {
            if *non_gc {
                return 0;
            }
            return key.track_number();
        }
        (u32::from(stream.item_type) << 24)
            | (u32::from(stream.scheme_or_count) << 16)
            | (u32::from(stream.element) << 8)
            | u32::from(stream.sub_or_number)
    }

    /// Set an explicit write order for a stream
    pub fn set_write_order(&mut self, id: GcStreamId, write_order: u32) {
        self.used_write_orders.remove(&self.streams[id].write_order);
        let claimed = self.claim_write_order(write_order);
        self.streams[id].write_order = claimed;
        self.used_write_orders.insert(claimed, id);
    }

    /// Place a stream immediately before (`position < 0`) or after
    /// (`position > 0`) all streams of the given essence type
    pub fn set_relative_write_order(&mut self, id: GcStreamId, item_type: u8, position: i32) {
        let band = if position < 0 { BAND_BEFORE } else { BAND_AFTER };
        let slot = (position.clamp(-128, 127) + 128) as u32;
        let order = (type_rank(item_type) << RANK_SHIFT) | (band << BAND_SHIFT) | (slot << 8);
        self.set_write_order(id, order);
    }

    /// The write order of a stream
    pub fn write_order(&self, id: GcStreamId) -> u32 {
        self.streams[id].write_order
    }

    /// Number of registered streams
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// The container stream offset that the next KLV will start at
    pub fn stream_offset(&self) -> u64 {
        self.stream_offset
    }

    /// Set the edit unit the current content package is indexed at
    pub fn set_index_edit_unit(&mut self, edit_unit: i64) {
        self.index_edit_unit = edit_unit;
    }

    /// The edit unit of the current content package
    pub fn index_edit_unit(&self) -> i64 {
        self.index_edit_unit
    }

    /// Record the pre-charge size and pass it to all index managers
    pub fn set_pre_charge(&mut self, pre_charge: i64) {
        self.pre_charge = pre_charge;
        for stream in &self.streams {
            if let Some(indexing) = &stream.indexing {
                indexing.manager.borrow_mut().set_pre_charge(pre_charge);
            }
        }
    }

    /// Queue fixed bytes for a stream in the current content package
    pub fn add_essence_data(&mut self, id: GcStreamId, data: Vec<u8>) {
        let order = self.streams[id].write_order;
        self.write_queue.insert(
            order,
            WriteBlock {
                stream: id,
                payload: Payload::Buffer(data),
            },
        );
    }

    /// Queue system item bytes for the current content package
    pub fn add_system_data(&mut self, id: GcStreamId, data: Vec<u8>) {
        self.add_essence_data(id, data);
    }

    /// Queue an essence source for the current content package
    ///
    /// With `fast_clip_wrap` the KLV length is written as a placeholder
    /// and patched after the value has been streamed; this requires the
    /// feature to be enabled in the writer's configuration.
    pub fn add_essence_source(
        &mut self,
        id: GcStreamId,
        source: SharedEssenceSource,
        fast_clip_wrap: bool,
    ) {
        let fast_clip = fast_clip_wrap && self.features.allow_fast_clip_wrap;
        if fast_clip_wrap && !self.features.allow_fast_clip_wrap {
            warn!("fast clip wrap requested but not enabled; writing with a scanned length");
        }

        let order = self.streams[id].write_order;
        self.write_queue.insert(
            order,
            WriteBlock {
                stream: id,
                payload: Payload::Source { source, fast_clip },
            },
        );
    }

    /// How many bytes a flush would write right now
    pub fn calc_write_size(&self) -> u64 {
        let mut offset = self.stream_offset;
        let mut total = 0u64;

        for block in self.write_queue.values() {
            let stream = &self.streams[block.stream];
            let size = match &block.payload {
                Payload::Buffer(data) => data.len() as u64,
                Payload::Source { source, .. } => source.borrow_mut().next_data_size() as u64,
            };
            let len_size = if matches!(
                &block.payload,
                Payload::Source { fast_clip: true, .. }
            ) {
                8
            } else {
                klv::ber_length_size(size, stream.len_size)
            };

            let klv_size = 16 + len_size as u64 + size;
            offset += klv_size;
            total += klv_size;

            let filler = filler_size(self.kag_size, offset, 0, self.force_filler_ber4);
            offset += filler;
            total += filler;
        }

        total
    }

    /// Write out the pending content package and start a new one
    pub fn start_new_cp<W: Write + Seek>(&mut self, file: &mut W) -> Result<u64> {
        self.flush(file)
    }

    /// Write all queued items in write order, returning bytes written
    pub fn flush<W: Write + Seek>(&mut self, file: &mut W) -> Result<u64> {
        if self.write_queue.is_empty() {
            return Ok(0);
        }

        // The element counts become observable on the first write
        for id in 0..self.streams.len() {
            self.fix_count(id);
        }

        let queue = std::mem::take(&mut self.write_queue);
        let start_offset = self.stream_offset;
        let mut prev_filler_start: Option<u64> = None;

        for (_, block) in queue {
            let stream = &self.streams[block.stream];
            let key = stream_key(stream);

            // Offer the stream offset of this KLV (or of the filler
            // preceding it) to the stream's index manager
            if let Some(indexing) = stream.indexing.clone() {
                if !indexing.index_clip {
                    let offered = match (indexing.index_filler, prev_filler_start) {
                        (true, Some(filler_start)) => filler_start,
                        _ => self.stream_offset,
                    };
                    indexing.manager.borrow_mut().set_offset(
                        indexing.sub_stream,
                        self.index_edit_unit,
                        offered,
                        0,
                        None,
                    );
                }
            }

            match block.payload {
                Payload::Buffer(data) => {
                    file.write_all(&key)?;
                    let len_size =
                        klv::write_ber(file, data.len() as u64, stream.len_size)?;
                    file.write_all(&data)?;
                    self.stream_offset += 16 + len_size as u64 + data.len() as u64;
                }
                Payload::Source { source, fast_clip } => {
                    let written = self.write_source_klv(file, &key, block.stream, source, fast_clip)?;
                    self.stream_offset += written;
                }
            }

            // KAG alignment for the next KLV
            let fill_start = self.stream_offset;
            let filler =
                write_filler(file, self.kag_size, self.stream_offset, 0, self.force_filler_ber4)?;
            if filler > 0 {
                prev_filler_start = Some(fill_start);
                self.stream_offset += filler;
            } else {
                prev_filler_start = None;
            }
        }

        self.index_edit_unit += 1;
        Ok(self.stream_offset - start_offset)
    }

    /// Write one KLV whose value is streamed from an essence source
    fn write_source_klv<W: Write + Seek>(
        &self,
        file: &mut W,
        key: &UL,
        stream_id: GcStreamId,
        source: SharedEssenceSource,
        fast_clip: bool,
    ) -> Result<u64> {
        let stream = &self.streams[stream_id];
        let indexing = stream.indexing.clone();

        file.write_all(key)?;

        if fast_clip {
            // Placeholder length, patched once the value size is known
            klv::write_ber(file, FAST_CLIP_LENGTH, 8)?;
            let value_file_pos = file.stream_position()?;

            let mut written = 0u64;
            let mut unit = self.index_edit_unit;
            let value_stream_offset = self.stream_offset + 16 + 8;
            let index_clip = indexing.as_ref().map(|i| i.index_clip).unwrap_or(false);
            let mut at_unit_start = index_clip;

            loop {
                if at_unit_start {
                    if let Some(indexing) = &indexing {
                        indexing.manager.borrow_mut().set_offset(
                            indexing.sub_stream,
                            unit,
                            value_stream_offset + written,
                            0,
                            None,
                        );
                    }
                    unit += 1;
                    at_unit_start = false;
                }

                let chunk = source.borrow_mut().next_data(0, STREAM_CHUNK);
                match chunk {
                    None => break,
                    Some(chunk) if chunk.is_empty() => continue,
                    Some(chunk) => {
                        file.write_all(&chunk)?;
                        written += chunk.len() as u64;
                        let source = source.borrow();
                        at_unit_start =
                            index_clip && source.end_of_item() && !source.end_of_data();
                    }
                }
            }

            // Seek back and write the real length over the placeholder
            let end_pos = file.stream_position()?;
            file.seek(SeekFrom::Start(value_file_pos - 8))?;
            klv::write_ber(file, written, 8)?;
            file.seek(SeekFrom::Start(end_pos))?;

            Ok(16 + 8 + written)
        } else {
            let size = source.borrow_mut().next_data_size() as u64;
            let len_size = klv::write_ber(file, size, stream.len_size)? as u64;

            let mut written = 0u64;
            while written < size {
                let remaining = (size - written) as usize;
                let chunk = source
                    .borrow_mut()
                    .next_data(remaining, STREAM_CHUNK.min(remaining));
                match chunk {
                    None => {
                        error!(
                            expected = size,
                            written, "essence source ended inside a wrapping unit"
                        );
                        return Err(MxfError::Klv(mxfkit_core::KlvError::Truncated {
                            needed: size as usize,
                            available: written as usize,
                        }));
                    }
                    Some(chunk) if chunk.is_empty() => continue,
                    Some(chunk) => {
                        file.write_all(&chunk)?;
                        written += chunk.len() as u64;
                    }
                }
            }

            Ok(16 + len_size + written)
        }
    }

    fn fix_count(&mut self, id: GcStreamId) {
        if self.streams[id].count_fixed {
            return;
        }
        let item_type = self.streams[id].item_type;
        let count = self
            .streams
            .iter()
            .filter(|s| !s.is_system && s.item_type == item_type)
            .count() as u8;
        let stream = &mut self.streams[id];
        stream.scheme_or_count = count;
        stream.count_fixed = true;
    }

    fn claim_write_order(&self, mut order: u32) -> u32 {
        while self.used_write_orders.contains_key(&order) {
            order += 1;
        }
        order
    }
}

const RANK_SHIFT: u32 = 26;
const BAND_SHIFT: u32 = 24;
const BAND_BEFORE: u32 = 0;
const BAND_NORMAL: u32 = 1;
const BAND_AFTER: u32 = 2;

/// Rank of an item type in the canonical content package order
fn type_rank(item_type: u8) -> u32 {
    match item_type {
        0x04 => 0, // CP system
        0x14 => 1, // GC system
        0x05 => 2, // CP picture
        0x15 => 3, // GC picture
        0x06 => 4, // CP sound
        0x16 => 5, // GC sound
        0x07 => 6, // CP data
        0x17 => 7, // GC data
        0x18 => 8, // GC compound
        _ => 9,
    }
}

/// Default write order for a stream, from its kind bytes
fn default_write_order(item_type: u8, element: u8, number: u8) -> u32 {
    (type_rank(item_type) << RANK_SHIFT)
        | (BAND_NORMAL << BAND_SHIFT)
        | (u32::from(element) << 16)
        | (u32::from(number) << 8)
}

/// Build the KLV key for a stream
fn stream_key(stream: &GcStreamData) -> UL {
    if let Some((key, _)) = &stream.specified_key {
        return key.0;
    }

    if stream.is_system {
        let mut key = labels::GC_SYSTEM_PREFIX;
        key[5] = stream.reg_designator;
        key[7] = 0x01;
        key[12] = stream.item_type;
        key[13] = stream.scheme_or_count;
        key[14] = stream.element;
        key[15] = stream.sub_or_number;
        key
    } else {
        essence_element_key(
            stream.item_type,
            stream.scheme_or_count,
            stream.element,
            stream.sub_or_number,
        )
    }
}

/// Size of the filler [`write_filler`] would emit
pub fn filler_size(kag_size: u32, position: u64, min_size: u32, force_ber4: bool) -> u64 {
    let kag = u64::from(kag_size.max(1));
    let min_overhead: u64 = if force_ber4 { 20 } else { 17 };

    let mut needed = (kag - (position % kag)) % kag;

    if min_size > 0 {
        while needed < u64::from(min_size) {
            needed += kag;
        }
    }

    if needed == 0 {
        return 0;
    }

    while needed < min_overhead {
        needed += kag;
    }

    needed.min(16 + 4 + MAX_FILLER_VALUE)
}

/// Write a filler KLV so the next KLV starts on a KAG boundary
///
/// A non-zero `min_size` forces at least that much filler even when the
/// position is already aligned. Fillers larger than the biggest
/// representable fill value are clamped with an error logged.
///
/// Returns the number of bytes written.
pub fn write_filler<W: Write + ?Sized>(
    file: &mut W,
    kag_size: u32,
    position: u64,
    min_size: u32,
    force_ber4: bool,
) -> Result<u64> {
    let needed = filler_size(kag_size, position, min_size, force_ber4);
    if needed == 0 {
        return Ok(0);
    }

    // Choose the BER form, then the value length to reach the target
    let mut len_size = if force_ber4 { 4 } else { 1 };
    if needed - 16 - len_size >= 0x80 && len_size == 1 {
        len_size = 4;
    }
    let mut value_len = needed - 16 - len_size;

    if value_len > MAX_FILLER_VALUE {
        error!(needed, "filler larger than a fill KLV can carry; clamping");
        value_len = MAX_FILLER_VALUE;
    }

    file.write_all(&labels::KLV_FILL)?;
    klv::write_ber(file, value_len, len_size as usize)?;

    let zeros = [0u8; 256];
    let mut remaining = value_len;
    while remaining > 0 {
        let chunk = remaining.min(zeros.len() as u64) as usize;
        file.write_all(&zeros[..chunk])?;
        remaining -= chunk as u64;
    }

    Ok(16 + len_size + value_len)
}
