//! Generic Container reading: KLV dispatch to per-track handlers
//!
//! A [`GcReader`] walks the KLVs of one essence container, tracking file
//! and stream offsets, and hands each KLV to the handler registered for
//! its track number (or the default handler). Encrypted KLVs go to the
//! encryption handler, which resubmits the plaintext for normal
//! dispatch.

use crate::error::Result;
use crate::essence::ReadSeek;
use crate::layout::{GcLayout, LayoutOffer};
use mxfkit_core::{klv, UniversalLabel};
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{ErrorKind, Read, SeekFrom};
use std::rc::Rc;
use tracing::debug;

/// Units counted by [`GcReader::read_from_file`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderUnit {
    /// Individual KLVs
    Klv,
    /// Content packages
    Gc,
    /// Partitions
    Partition,
    /// Essence containers
    Container,
}

/// One KLV as read from the file
#[derive(Debug, Clone)]
pub struct KlvInfo {
    /// The key
    pub key: UniversalLabel,
    /// File offset of the first byte of the key
    pub file_offset: u64,
    /// Stream offset of the first byte of the key within the container
    pub stream_offset: u64,
    /// The value bytes
    pub value: Vec<u8>,
}

/// Context handed to read handlers
///
/// Lets a handler stop the read loop (optionally pushing the current KLV
/// back for a later reader) or resubmit a decrypted KLV for dispatch.
#[derive(Debug, Default)]
pub struct ReaderContext {
    stop_now: bool,
    push_back: bool,
    resubmit: Option<KlvInfo>,
}

impl ReaderContext {
    /// Stop reading after the current KLV completes
    ///
    /// With `push_back` the file offset is rewound to the start of the
    /// current KLV so a subsequent reader can take it.
    pub fn stop_reading(&mut self, push_back: bool) {
        self.stop_now = true;
        self.push_back = push_back;
    }

    /// Resubmit a KLV (typically decrypted plaintext) for dispatch
    pub fn resubmit(&mut self, klv: KlvInfo) {
        self.resubmit = Some(klv);
    }
}

/// Receives KLVs from a [`GcReader`]
pub trait GcReadHandler {
    /// Handle one KLV; return false to report an error to the read loop
    fn handle_data(&mut self, ctx: &mut ReaderContext, klv: &KlvInfo) -> bool;
}

/// Shared handler handle
pub type SharedReadHandler = Rc<RefCell<dyn GcReadHandler>>;

/// Reads KLVs from one essence container and dispatches them
pub struct GcReader {
    file_offset: u64,
    stream_offset: u64,

    stop_now: bool,
    push_back_requested: bool,

    default_handler: Option<SharedReadHandler>,
    filler_handler: Option<SharedReadHandler>,
    encryption_handler: Option<SharedReadHandler>,
    handlers: HashMap<u32, SharedReadHandler>,

    layout: GcLayout,
}

impl GcReader {
    /// Create a reader, optionally with default and filler handlers
    pub fn new(
        default_handler: Option<SharedReadHandler>,
        filler_handler: Option<SharedReadHandler>,
    ) -> Self {
        GcReader {
            file_offset: 0,
            stream_offset: 0,
            stop_now: false,
            push_back_requested: false,
            default_handler,
            filler_handler,
            encryption_handler: None,
            handlers: HashMap::new(),
            layout: GcLayout::default(),
        }
    }

    /// The content package layout observed while reading
    pub fn layout(&self) -> &GcLayout {
        &self.layout
    }

    /// Did the last read stop because a handler asked it to?
    pub fn was_stopped(&self) -> bool {
        self.stop_now
    }

    /// Set the handler for KLVs with no specific track handler
    pub fn set_default_handler(&mut self, handler: Option<SharedReadHandler>) {
        self.default_handler = handler;
    }

    /// Set the handler for filler KLVs
    ///
    /// Fillers are never sent to the default handler.
    pub fn set_filler_handler(&mut self, handler: Option<SharedReadHandler>) {
        self.filler_handler = handler;
    }

    /// Set the handler for encrypted KLVs
    pub fn set_encryption_handler(&mut self, handler: Option<SharedReadHandler>) {
        self.encryption_handler = handler;
    }

    /// Set or clear the handler for a specific track number
    pub fn set_data_handler(&mut self, track_number: u32, handler: Option<SharedReadHandler>) {
        match handler {
            Some(handler) => {
                self.handlers.insert(track_number, handler);
            }
            None => {
                self.handlers.remove(&track_number);
            }
        }
    }

    /// The file offset of the next KLV to read
    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }

    /// Set the file offset of the next KLV (usually after a partition
    /// pack has been parsed)
    pub fn set_file_offset(&mut self, offset: u64) {
        self.file_offset = offset;
    }

    /// The stream offset of the next KLV within this container
    pub fn stream_offset(&self) -> u64 {
        self.stream_offset
    }

    /// Set the stream offset of the next KLV
    pub fn set_stream_offset(&mut self, offset: u64) {
        self.stream_offset = offset;
    }

    /// Read KLVs from `file`, dispatching each to its handler
    ///
    /// Stops at end of file, when a handler calls
    /// [`ReaderContext::stop_reading`], when a partition pack key is
    /// encountered (pushed back for the caller), or when `count` units of
    /// `unit` have been read (`count` 0 means no limit).
    ///
    /// Returns false when reading stopped for any reason other than
    /// satisfying the count.
    pub fn read_from_file<R: ReadSeek + ?Sized>(
        &mut self,
        file: &mut R,
        unit: ReaderUnit,
        count: u64,
    ) -> Result<bool> {
        self.stop_now = false;
        self.push_back_requested = false;
        let mut remaining = count;
        let mut dispatched_any = false;

        loop {
            let klv_start = self.file_offset;
            file.seek(SeekFrom::Start(klv_start))?;

            // Read the key, stopping cleanly at end of file
            let mut key = [0u8; 16];
            if !read_exact_or_eof(file, &mut key)? {
                return Ok(false);
            }
            let key = UniversalLabel(key);

            // A partition pack ends this container's data
            if key.is_partition_pack() {
                self.push_back_requested = true;
                if (unit == ReaderUnit::Partition || unit == ReaderUnit::Container)
                    && remaining > 0
                {
                    remaining -= 1;
                    if remaining == 0 {
                        return Ok(true);
                    }
                }
                return Ok(false);
            }

            let length = klv::read_ber(file)?;
            let header_size = file.stream_position()? - klv_start;

            let mut value = vec![0u8; length as usize];
            if !read_exact_or_eof(file, &mut value)? {
                return Ok(false);
            }

            let klv = KlvInfo {
                key,
                file_offset: klv_start,
                stream_offset: self.stream_offset,
                value,
            };

            self.file_offset = klv_start + header_size + length;
            self.stream_offset += header_size + length;

            // Track the content package interleave
            let offer = key.element_kind().map(|kind| self.layout.offer(kind));

            if !self.handle_data(&klv) {
                return Ok(false);
            }

            if self.stop_now {
                if self.push_back_requested {
                    self.file_offset = klv_start;
                    self.stream_offset = klv.stream_offset;
                }
                return Ok(false);
            }

            if unit == ReaderUnit::Klv && remaining > 0 {
                remaining -= 1;
                if remaining == 0 {
                    return Ok(true);
                }
            }

            // A new content package starting means the previous one has
            // been fully delivered
            if unit == ReaderUnit::Gc
                && remaining > 0
                && dispatched_any
                && offer == Some(LayoutOffer::StartsNew)
            {
                remaining -= 1;
                if remaining == 0 {
                    return Ok(true);
                }
            }

            dispatched_any = true;
        }
    }

    /// Dispatch one KLV to the appropriate handler
    ///
    /// Also used by the encryption handler to push decrypted data back
    /// through normal dispatch.
    pub fn handle_data(&mut self, klv: &KlvInfo) -> bool {
        let handler = if klv.key.is_fill_item() {
            self.filler_handler.clone()
        } else if is_encrypted_key(&klv.key) && self.encryption_handler.is_some() {
            self.encryption_handler.clone()
        } else {
            let track = klv.key.track_number();
            self.handlers
                .get(&track)
                .cloned()
                .or_else(|| self.default_handler.clone())
        };

        let Some(handler) = handler else {
            debug!(key = %klv.key, "no handler for KLV; discarded");
            return true;
        };

        let mut ctx = ReaderContext::default();
        let ok = handler.borrow_mut().handle_data(&mut ctx, klv);

        if ctx.stop_now {
            self.stop_now = true;
            self.push_back_requested = ctx.push_back;
        }

        // Decrypted data is dispatched as if read from the file
        if let Some(plaintext) = ctx.resubmit {
            return self.handle_data(&plaintext);
        }

        ok
    }
}

/// Key family of cryptographic framework triplets
fn is_encrypted_key(key: &UniversalLabel) -> bool {
    // SMPTE 429-6 encrypted triplet
    const ENCRYPTED_TRIPLET: [u8; 7] = [0x06, 0x0E, 0x2B, 0x34, 0x02, 0x04, 0x01];
    key.as_bytes()[0..7] == ENCRYPTED_TRIPLET
}

/// Read exactly, reporting a clean EOF at a KLV boundary as `false`
fn read_exact_or_eof<R: Read + ?Sized>(file: &mut R, buffer: &mut [u8]) -> Result<bool> {
    match file.read_exact(buffer) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::essence::essence_element_key;
    use mxfkit_core::ul::labels;
    use mxfkit_core::Klv;
    use std::io::Cursor;

    struct Collector {
        seen: Vec<(UniversalLabel, usize)>,
        stop_at: Option<usize>,
        push_back: bool,
    }

    impl Collector {
        fn shared(stop_at: Option<usize>, push_back: bool) -> Rc<RefCell<Collector>> {
            Rc::new(RefCell::new(Collector {
                seen: Vec::new(),
                stop_at,
                push_back,
            }))
        }
    }

    impl GcReadHandler for Collector {
        fn handle_data(&mut self, ctx: &mut ReaderContext, klv: &KlvInfo) -> bool {
            self.seen.push((klv.key, klv.value.len()));
            if self.stop_at == Some(self.seen.len()) {
                ctx.stop_reading(self.push_back);
            }
            true
        }
    }

    fn picture_key() -> [u8; 16] {
        essence_element_key(0x15, 0x01, 0x05, 0x01)
    }

    fn container_bytes() -> Vec<u8> {
        let mut data = Vec::new();
        Klv::new(picture_key(), vec![1; 100]).write(&mut data).unwrap();
        Klv::new(labels::KLV_FILL, vec![0; 10]).write(&mut data).unwrap();
        Klv::new(picture_key(), vec![2; 50]).write(&mut data).unwrap();
        data
    }

    #[test]
    fn dispatch_by_track_number() {
        let handler = Collector::shared(None, false);
        let filler = Collector::shared(None, false);

        let mut reader = GcReader::new(None, Some(filler.clone()));
        let track = UniversalLabel(picture_key()).track_number();
        reader.set_data_handler(track, Some(handler.clone()));

        let mut file = Cursor::new(container_bytes());
        reader.read_from_file(&mut file, ReaderUnit::Klv, 0).unwrap();

        assert_eq!(handler.borrow().seen.len(), 2);
        assert_eq!(filler.borrow().seen.len(), 1);
        assert_eq!(handler.borrow().seen[0].1, 100);
        assert_eq!(handler.borrow().seen[1].1, 50);
    }

    #[test]
    fn fillers_never_reach_default() {
        let default = Collector::shared(None, false);
        let mut reader = GcReader::new(Some(default.clone()), None);

        let mut file = Cursor::new(container_bytes());
        reader.read_from_file(&mut file, ReaderUnit::Klv, 0).unwrap();

        // Only the two essence KLVs arrive; the filler is discarded
        assert_eq!(default.borrow().seen.len(), 2);
    }

    #[test]
    fn klv_count_is_honoured() {
        let default = Collector::shared(None, false);
        let mut reader = GcReader::new(Some(default.clone()), None);

        let mut file = Cursor::new(container_bytes());
        let satisfied = reader
            .read_from_file(&mut file, ReaderUnit::Klv, 1)
            .unwrap();
        assert!(satisfied);
        assert_eq!(default.borrow().seen.len(), 1);
    }

    #[test]
    fn stop_with_pushback_rewinds() {
        let default = Collector::shared(Some(1), true);
        let mut reader = GcReader::new(Some(default.clone()), None);

        let mut file = Cursor::new(container_bytes());
        let satisfied = reader
            .read_from_file(&mut file, ReaderUnit::Klv, 0)
            .unwrap();
        assert!(!satisfied);

        // The file offset was rewound to the start of the handled KLV
        assert_eq!(reader.file_offset(), 0);
        assert_eq!(reader.stream_offset(), 0);
    }

    #[test]
    fn offsets_track_consumed_bytes() {
        let default = Collector::shared(None, false);
        let mut reader = GcReader::new(Some(default.clone()), None);
        reader.set_stream_offset(0);

        let mut file = Cursor::new(container_bytes());
        reader.read_from_file(&mut file, ReaderUnit::Klv, 0).unwrap();

        let expected = container_bytes().len() as u64;
        assert_eq!(reader.file_offset(), expected);
        assert_eq!(reader.stream_offset(), expected);
    }

    #[test]
    fn partition_pack_is_pushed_back() {
        let mut data = container_bytes();
        let pack = crate::partition::PartitionPack::body();
        let pack_offset = data.len() as u64;
        pack.write(&mut data).unwrap();

        let default = Collector::shared(None, false);
        let mut reader = GcReader::new(Some(default.clone()), None);

        let mut file = Cursor::new(data);
        let satisfied = reader
            .read_from_file(&mut file, ReaderUnit::Klv, 0)
            .unwrap();
        assert!(!satisfied);
        assert_eq!(default.borrow().seen.len(), 2);
        assert_eq!(reader.file_offset(), pack_offset);
    }

    struct Decryptor;

    impl GcReadHandler for Decryptor {
        fn handle_data(&mut self, ctx: &mut ReaderContext, klv: &KlvInfo) -> bool {
            // "Decrypt" by unwrapping into a plain picture KLV
            ctx.resubmit(KlvInfo {
                key: UniversalLabel(essence_element_key(0x15, 0x01, 0x05, 0x01)),
                file_offset: klv.file_offset,
                stream_offset: klv.stream_offset,
                value: klv.value.iter().map(|b| b ^ 0xFF).collect(),
            });
            true
        }
    }

    #[test]
    fn encrypted_klvs_are_resubmitted() {
        let mut encrypted_key = [0u8; 16];
        encrypted_key[0..7].copy_from_slice(&[0x06, 0x0E, 0x2B, 0x34, 0x02, 0x04, 0x01]);

        let mut data = Vec::new();
        Klv::new(encrypted_key, vec![0xFF ^ 7; 16]).write(&mut data).unwrap();

        let collector = Collector::shared(None, false);
        let mut reader = GcReader::new(Some(collector.clone()), None);
        reader.set_encryption_handler(Some(Rc::new(RefCell::new(Decryptor))));

        let mut file = Cursor::new(data);
        reader.read_from_file(&mut file, ReaderUnit::Klv, 0).unwrap();

        let seen = &collector.borrow().seen;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, 16);
    }
}
