//! Body demultiplexing: reading essence back out of partitions
//!
//! A [`BodyReader`] walks the partitions of a file, routing each
//! partition's KLVs to the [`GcReader`] registered for its BodySID. It
//! can recover from damaged body data by scanning forward to the next
//! partition pack.

use crate::error::Result;
use crate::gc_reader::{GcReader, ReaderUnit, SharedReadHandler};
use crate::partition::{PartitionPack, MAX_RUN_IN};
use mxfkit_core::UniversalLabel;
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use tracing::{debug, warn};

/// Span of one partition's essence, used for stream-offset seeks
#[derive(Debug, Clone, Copy)]
struct EssenceSpan {
    body_sid: u32,
    /// Container offset of the partition's first essence byte
    body_offset: u64,
    /// File offset of the partition's first essence byte
    file_offset: u64,
}

/// Reads essence from an MXF file partition by partition
pub struct BodyReader {
    current_pos: u64,
    at_eof: bool,
    current_body_sid: u32,

    default_handler: Option<SharedReadHandler>,
    filler_handler: Option<SharedReadHandler>,
    encryption_handler: Option<SharedReadHandler>,

    readers: HashMap<u32, GcReader>,
    spans: Vec<EssenceSpan>,
}

impl Default for BodyReader {
    fn default() -> Self {
        Self::new()
    }
}

impl BodyReader {
    /// Create a reader positioned at the start of the file
    pub fn new() -> Self {
        BodyReader {
            current_pos: 0,
            at_eof: false,
            current_body_sid: 0,
            default_handler: None,
            filler_handler: None,
            encryption_handler: None,
            readers: HashMap::new(),
            spans: Vec::new(),
        }
    }

    /// Set the default handler used when creating new GC readers
    pub fn set_default_handler(&mut self, handler: Option<SharedReadHandler>) {
        self.default_handler = handler;
    }

    /// Set the filler handler used when creating new GC readers
    pub fn set_filler_handler(&mut self, handler: Option<SharedReadHandler>) {
        self.filler_handler = handler;
    }

    /// Set the encryption handler used when creating new GC readers
    pub fn set_encryption_handler(&mut self, handler: Option<SharedReadHandler>) {
        self.encryption_handler = handler;
    }

    /// Seek to an absolute file position
    pub fn seek(&mut self, position: u64) -> u64 {
        self.current_pos = position;
        self.at_eof = false;
        self.current_body_sid = 0;
        position
    }

    /// The current file position
    pub fn tell(&self) -> u64 {
        self.current_pos
    }

    /// Seek to a byte offset within a given essence stream
    ///
    /// Uses the partition packs seen so far; returns the new file
    /// position, or `None` when the offset lies in an unseen partition.
    pub fn seek_stream(&mut self, body_sid: u32, position: u64) -> Option<u64> {
        let span = self
            .spans
            .iter()
            .filter(|span| span.body_sid == body_sid && span.body_offset <= position)
            .max_by_key(|span| span.body_offset)?;

        let file_pos = span.file_offset + (position - span.body_offset);
        self.current_pos = file_pos;
        self.current_body_sid = body_sid;
        if let Some(reader) = self.readers.get_mut(&body_sid) {
            reader.set_file_offset(file_pos);
            reader.set_stream_offset(position);
        }
        Some(file_pos)
    }

    /// The stream offset a given BodySID has reached
    pub fn tell_stream(&self, body_sid: u32) -> Option<u64> {
        self.readers.get(&body_sid).map(GcReader::stream_offset)
    }

    /// Register a GC reader for a BodySID
    ///
    /// Returns false when the BodySID already has a reader.
    pub fn make_gc_reader(
        &mut self,
        body_sid: u32,
        default_handler: Option<SharedReadHandler>,
        filler_handler: Option<SharedReadHandler>,
    ) -> bool {
        if self.readers.contains_key(&body_sid) {
            return false;
        }

        let mut reader = GcReader::new(
            default_handler.or_else(|| self.default_handler.clone()),
            filler_handler.or_else(|| self.filler_handler.clone()),
        );
        reader.set_encryption_handler(self.encryption_handler.clone());
        self.readers.insert(body_sid, reader);
        true
    }

    /// The GC reader for a BodySID
    pub fn gc_reader(&mut self, body_sid: u32) -> Option<&mut GcReader> {
        self.readers.get_mut(&body_sid)
    }

    /// The BodySID of the current location (0 if not known)
    pub fn body_sid(&self) -> u32 {
        self.current_body_sid
    }

    /// Read from the file, dispatching KLVs to handlers
    ///
    /// Stops when the `count` of `unit` is satisfied, at end of file, or
    /// when a handler stops the read. Returns true only when the count
    /// was satisfied.
    pub fn read_from_file<R: Read + Seek>(
        &mut self,
        file: &mut R,
        unit: ReaderUnit,
        count: u64,
    ) -> Result<bool> {
        let mut remaining_partitions = count;

        loop {
            // At a partition pack? Parse it and route to its reader
            if self.peek_partition(file)? {
                let pack = self.read_partition_pack(file)?;
                let after_pack = file.stream_position()?;

                if unit == ReaderUnit::Partition && count > 0 {
                    remaining_partitions = remaining_partitions.saturating_sub(1);
                    if remaining_partitions == 0 {
                        self.current_pos = after_pack;
                        return Ok(true);
                    }
                }

                self.current_body_sid = pack.body_sid;
                self.current_pos = after_pack;

                // Skip metadata and index areas to the essence
                let skip = pack.header_byte_count + pack.index_byte_count;
                self.current_pos += skip;

                if pack.body_sid != 0 {
                    self.spans.push(EssenceSpan {
                        body_sid: pack.body_sid,
                        body_offset: pack.body_offset,
                        file_offset: self.current_pos,
                    });
                }

                if pack.body_sid == 0 || !self.readers.contains_key(&pack.body_sid) {
                    if pack.body_sid != 0 {
                        debug!(body_sid = pack.body_sid, "no reader for BodySID; skipping");
                    }
                    // Move to the next partition pack
                    if !self.skip_to_next_partition(file)? {
                        self.at_eof = true;
                        return Ok(false);
                    }
                    continue;
                }

                let reader = self.readers.get_mut(&pack.body_sid).expect("just checked");
                reader.set_file_offset(self.current_pos);
                reader.set_stream_offset(pack.body_offset);
            }

            let Some(reader) = self.readers.get_mut(&self.current_body_sid) else {
                // Not at a partition and no reader: resynchronise
                if !self.skip_to_next_partition(file)? {
                    self.at_eof = true;
                    return Ok(false);
                }
                continue;
            };

            // Partition counting is handled here, not by the GC reader
            let inner_count = match unit {
                ReaderUnit::Klv | ReaderUnit::Gc => count,
                _ => 0,
            };
            let satisfied = reader.read_from_file(file, unit, inner_count)?;
            self.current_pos = reader.file_offset();

            if satisfied {
                return Ok(true);
            }
            if reader.was_stopped() {
                return Ok(false);
            }

            // The reader stopped at a partition boundary or end of file
            if !self.peek_partition(file)? {
                self.at_eof = true;
                return Ok(false);
            }
        }
    }

    /// Scan forward for the next partition pack after damaged data
    ///
    /// Leaves the reader positioned at the pack.
    pub fn re_sync<R: Read + Seek>(&mut self, file: &mut R) -> Result<bool> {
        warn!(position = self.current_pos, "resynchronising body data");

        // Step one byte in so a damaged pack at the current position is
        // not immediately re-found
        let mut position = self.current_pos + 1;

        let mut window = [0u8; 4096 + 16];
        loop {
            file.seek(SeekFrom::Start(position))?;
            let got = read_up_to(file, &mut window)?;
            if got < 16 {
                self.at_eof = true;
                return Ok(false);
            }

            for offset in 0..=(got - 16) {
                let mut key = [0u8; 16];
                key.copy_from_slice(&window[offset..offset + 16]);
                if UniversalLabel(key).is_partition_pack() {
                    self.current_pos = position + offset as u64;
                    self.current_body_sid = 0;
                    return Ok(true);
                }
            }

            // Overlap by 15 bytes so keys spanning the window edge are
            // still found
            position += (got - 15) as u64;
        }
    }

    /// Is the reader at a partition pack?
    pub fn is_at_partition<R: Read + Seek>(&mut self, file: &mut R) -> Result<bool> {
        self.peek_partition(file)
    }

    /// Has the end of the file been reached?
    pub fn eof<R: Read + Seek>(&mut self, file: &mut R) -> Result<bool> {
        if self.at_eof {
            return Ok(true);
        }
        file.seek(SeekFrom::Start(self.current_pos))?;
        let mut probe = [0u8; 1];
        Ok(file.read(&mut probe)? == 0)
    }

    /// Locate the first partition pack, skipping any run-in
    pub fn locate_start<R: Read + Seek>(&mut self, file: &mut R) -> Result<u64> {
        let offset = crate::partition::locate_first_partition(file)?;
        debug_assert!(offset <= MAX_RUN_IN);
        self.current_pos = offset;
        Ok(offset)
    }

    fn peek_partition<R: Read + Seek>(&mut self, file: &mut R) -> Result<bool> {
        file.seek(SeekFrom::Start(self.current_pos))?;
        let mut key = [0u8; 16];
        match file.read_exact(&mut key) {
            Ok(()) => {
                file.seek(SeekFrom::Start(self.current_pos))?;
                Ok(UniversalLabel(key).is_partition_pack())
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                self.at_eof = true;
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read and parse the partition pack at the current position
    fn read_partition_pack<R: Read + Seek>(&mut self, file: &mut R) -> Result<PartitionPack> {
        file.seek(SeekFrom::Start(self.current_pos))?;

        // Read key and length to size the whole pack
        let mut header = [0u8; 16];
        file.read_exact(&mut header)?;
        let length = mxfkit_core::klv::read_ber(file)?;
        let value_start = file.stream_position()?;

        let total = (value_start - self.current_pos) as usize + length as usize;
        let mut data = vec![0u8; total];
        file.seek(SeekFrom::Start(self.current_pos))?;
        file.read_exact(&mut data)?;

        PartitionPack::parse(&data)
    }

    /// Advance to the next partition pack without dispatching anything
    fn skip_to_next_partition<R: Read + Seek>(&mut self, file: &mut R) -> Result<bool> {
        loop {
            file.seek(SeekFrom::Start(self.current_pos))?;

            let mut key = [0u8; 16];
            match file.read_exact(&mut key) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(false),
                Err(e) => return Err(e.into()),
            }

            if UniversalLabel(key).is_partition_pack() {
                return Ok(true);
            }

            let length = match mxfkit_core::klv::read_ber(file) {
                Ok(length) => length,
                Err(_) => return Ok(false),
            };
            self.current_pos = file.stream_position()? + length;
        }
    }
}

fn read_up_to<R: Read>(file: &mut R, buffer: &mut [u8]) -> Result<usize> {
    let mut total = 0;
    while total < buffer.len() {
        let got = file.read(&mut buffer[total..])?;
        if got == 0 {
            break;
        }
        total += got;
    }
    Ok(total)
}
