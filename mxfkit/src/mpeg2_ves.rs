//! MPEG-2 video elementary stream sub-parser
//!
//! Identifies raw MPEG-2 (and MPEG-1) video elementary streams, builds a
//! picture descriptor from the sequence header, and scans the stream one
//! edit unit (coded picture) at a time, feeding picture types, anchor
//! offsets and temporal reordering facts to an index manager as it goes.

use crate::essence::{
    EssenceSource, EssenceStreamDescriptor, EssenceSubParser, ReadSeek, VideoDescriptor,
    WrapKind, WrappingOption,
};
use crate::index_manager::SharedIndexManager;
use mxfkit_core::ul::labels;
use mxfkit_core::{Rational, UniversalLabel};
use mxfkit_mpeg2 as mpeg2;
use std::io::{Read, Seek, SeekFrom};
use tracing::{debug, error, warn};

/// Byte-swapped UUID identifying the MPEG2-VES source format
pub const MPEG2_VES_FORMAT: [u8; 16] = [
    0x45, 0x54, 0x57, 0x62, 0xD6, 0xB4, 0x2E, 0x4E, 0xF3, 0xD2, b'M', b'P', b'E', b'G', b'2',
    b'V',
];

/// Identification reads this much of the head of the file
const IDENTIFY_BUFFER: usize = 8 * 1024;

/// The descriptor is built from this much data at the sequence header
const DESCRIPTOR_BUFFER: usize = 512;

/// A valid stream must reach a start code within this many leading zero
/// bytes; streams padded further than this are not identified
const MAX_LEADING_ZEROS: usize = 510;

/// Read buffer used by the edit-unit scanner
const SCAN_BUFFER: usize = 4096;

/// Where the scanner currently sits within a GOP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GopPlace {
    Unknown,
    Start,
    FirstI,
    SecondI,
    ConsecB,
    PostB,
}

/// Sub-parser for MPEG-2 video elementary streams
#[derive(Debug)]
pub struct Mpeg2VesParser {
    selected_wrapping: Option<WrappingOption>,
    native_edit_rate: Rational,
    selected_edit_rate: Rational,
    edit_ratio: u64,

    picture_number: i64,
    anchor_frame: i64,
    current_pos: u64,
    gop_offset: i64,
    closed_gop: bool,
    gop_place: GopPlace,
    end_of_stream: bool,
    edit_point: bool,

    cached_data_size: Option<usize>,
    cached_count: u64,

    manager: Option<(SharedIndexManager, usize)>,

    current_descriptor: Option<VideoDescriptor>,
    gop_start_timecode: i64,
}

impl Default for Mpeg2VesParser {
    fn default() -> Self {
        Self::new()
    }
}

impl Mpeg2VesParser {
    /// Create a parser with no stream identified yet
    pub fn new() -> Self {
        Mpeg2VesParser {
            selected_wrapping: None,
            native_edit_rate: Rational::zero(),
            selected_edit_rate: Rational::zero(),
            edit_ratio: 1,
            picture_number: 0,
            anchor_frame: 0,
            current_pos: 0,
            gop_offset: 0,
            closed_gop: false,
            gop_place: GopPlace::Unknown,
            end_of_stream: false,
            edit_point: false,
            cached_data_size: None,
            cached_count: 0,
            manager: None,
            current_descriptor: None,
            gop_start_timecode: 0,
        }
    }

    /// The wrapping selected by [`EssenceSubParser::use_wrapping`]
    pub fn selected_wrapping(&self) -> Option<&WrappingOption> {
        self.selected_wrapping.as_ref()
    }

    /// Did the most recently scanned edit unit begin at an edit point?
    pub fn at_edit_point(&self) -> bool {
        self.edit_point
    }

    /// Build the video descriptor from the sequence header at `start`
    fn build_descriptor(
        &mut self,
        file: &mut dyn ReadSeek,
        start: u64,
    ) -> std::io::Result<Option<VideoDescriptor>> {
        let mut buffer = [0u8; DESCRIPTOR_BUFFER];
        file.seek(SeekFrom::Start(start))?;
        let got = read_up_to(file, &mut buffer)?;
        if got < DESCRIPTOR_BUFFER {
            return Ok(None);
        }

        let Ok(seq) = mpeg2::parse_sequence_header(&buffer) else {
            return Ok(None);
        };

        let mut h_size = u32::from(seq.horizontal_size);
        let mut v_size = u32::from(seq.vertical_size);
        let mut bit_rate = seq.bit_rate;
        if bit_rate == 0x3FFFF {
            warn!("building MPEG-2 video descriptor with bit_rate = -1");
        }

        let (mut rate_num, mut rate_den) = match seq.frame_rate.as_rational() {
            Some(rate) => rate,
            None => {
                error!(code = seq.frame_rate.0, "unknown frame rate code");
                (0, 1)
            }
        };

        // Assume these when no sequence extension is found (MPEG-1)
        let mut profile_and_level = 0u8;
        let mut progressive = true;
        let mut subsampling = (2u32, 2u32);
        let mut low_delay = false;
        let mut mpeg1 = false;

        // The sequence extension should follow the header, possibly after
        // some zero padding
        let mut ext_pos = seq.byte_size();
        while ext_pos < DESCRIPTOR_BUFFER - 8 && buffer[ext_pos] == 0 {
            ext_pos += 1;
        }

        if buffer[ext_pos] == 0x01 && buffer[ext_pos + 1] == 0xB5 {
            let mut ext_bytes = [0u8; 10];
            ext_bytes[2] = 0x01;
            ext_bytes[3] = 0xB5;
            ext_bytes[4..10].copy_from_slice(&buffer[ext_pos + 2..ext_pos + 8]);

            if let Ok(ext) = mpeg2::parse_sequence_extension(&ext_bytes) {
                profile_and_level = ext.profile_and_level;
                progressive = ext.progressive;
                subsampling = ext.chroma_format.subsampling();
                low_delay = ext.low_delay;

                h_size |= u32::from(ext.horizontal_size_extension) << 12;
                v_size |= u32::from(ext.vertical_size_extension) << 12;
                bit_rate |= u32::from(ext.bit_rate_extension) << 18;

                rate_num *= i32::from(ext.frame_rate_extension_n) + 1;
                rate_den *= i32::from(ext.frame_rate_extension_d) + 1;
            }
        } else {
            warn!("no sequence extension after sequence header (possibly MPEG-1); assuming defaults");
            mpeg1 = true;
        }

        let sample_rate = Rational::new(rate_num, rate_den).reduce();
        self.native_edit_rate = sample_rate;

        let stored_height = if progressive { v_size } else { v_size / 2 };

        let color_siting = match subsampling {
            (2, 2) => {
                if mpeg1 {
                    3 // quincunx 4:2:0
                } else {
                    6 // vertical midpoint 4:2:0
                }
            }
            (2, 1) => 4, // Rec 601 style 4:2:2
            (1, 1) => 0, // 4:4:4
            _ => 0xFF,
        };

        let picture_essence_coding = match profile_and_level {
            0x48 => Some(UniversalLabel(labels::MPEG2_MP_ML_LONG_GOP)),
            0x44 => Some(UniversalLabel(labels::MPEG2_MP_HL_LONG_GOP)),
            0x85 => Some(UniversalLabel(labels::MPEG2_422P_ML_LONG_GOP)),
            0x82 => Some(UniversalLabel(labels::MPEG2_422P_HL_LONG_GOP)),
            _ => None,
        };

        // Pick out the starting timecode from a GOP header, if one is in
        // range of the buffer
        self.gop_start_timecode = 0;
        if let Some((offset, code)) = mpeg2::find_start_code(&buffer) {
            // Scan forward through start codes for the first GOP header
            let mut search = offset;
            let mut found = code == mpeg2::GOP_START_CODE;
            while !found {
                match mpeg2::find_start_code(&buffer[search + 4..]) {
                    Some((next, code)) => {
                        search += 4 + next;
                        found = code == mpeg2::GOP_START_CODE;
                    }
                    None => break,
                }
            }
            if found && search + 8 <= DESCRIPTOR_BUFFER {
                if let Ok(gop) = mpeg2::parse_gop_header(&buffer[search..search + 8]) {
                    let rate_int = ((f64::from(rate_num) / f64::from(rate_den)) + 0.5) as u32;
                    self.gop_start_timecode = gop.timecode_frames(rate_int);
                }
            }
        }

        Ok(Some(VideoDescriptor {
            sample_rate,
            frame_layout: if progressive { 0 } else { 1 },
            stored_width: h_size,
            stored_height,
            aspect_ratio: seq.aspect_ratio.as_ratio().map(Rational::from),
            video_line_map: video_line_map(progressive, v_size),
            component_depth: 8,
            horizontal_subsampling: subsampling.0,
            vertical_subsampling: subsampling.1,
            color_siting,
            coded_content_type: if progressive { 1 } else { 2 },
            low_delay,
            bit_rate: if bit_rate != 0x3FFFF {
                Some(u64::from(bit_rate) * 400)
            } else {
                None
            },
            profile_and_level,
            picture_essence_coding,
        }))
    }

    /// Offer the index facts for one picture to the index manager
    fn offer_picture(&mut self, picture_data: u16, seq_head: bool) {
        let temporal_reference = i64::from(picture_data >> 6);
        let picture_type = (picture_data >> 3) & 0x07;

        self.gop_place = match (self.gop_place, picture_type) {
            (GopPlace::Start, 1) => GopPlace::FirstI,
            (GopPlace::FirstI, 3) => GopPlace::ConsecB,
            (GopPlace::FirstI, 1) => GopPlace::SecondI,
            (GopPlace::ConsecB, t) if t != 3 => GopPlace::PostB,
            (place, _) => place,
        };

        let mut flags: u8 = match picture_type {
            2 => 0x22,
            3 => {
                if self.closed_gop && self.gop_place == GopPlace::ConsecB {
                    0x13
                } else {
                    0x33
                }
            }
            _ => {
                // I picture (and anything unrecognised is treated as one)
                self.anchor_frame = self.picture_number;
                0x00
            }
        };

        if seq_head {
            flags |= 0x40;
            if self.closed_gop {
                flags |= 0x80;
                self.edit_point = true;
            }
        }

        // Anchor offsets are never positive in MPEG; when the range of
        // the wire field is burst, 381M says to pin the maximum value and
        // set flag bit 3
        let mut anchor_offset = self.anchor_frame - self.picture_number;
        if anchor_offset < -128 {
            anchor_offset = 127;
            flags |= 0x04;
        }

        let temporal_offset = self.gop_offset - temporal_reference;

        if let Some((manager, stream_id)) = &self.manager {
            let mut manager = manager.borrow_mut();
            manager.offer_edit_unit(
                *stream_id,
                self.picture_number,
                anchor_offset as i8,
                Some(flags),
            );
            manager.offer_temporal_offset(
                self.picture_number - temporal_offset,
                temporal_offset as i8,
            );

            if self.picture_number < 150 {
                debug!(
                    picture = self.picture_number,
                    temporal_reference,
                    anchor_offset,
                    flags,
                    temporal_offset,
                    "offered edit unit"
                );
            }
        }
    }

    /// Scan one batch of edit units, updating the cache
    fn scan_internal(
        &mut self,
        file: &mut dyn ReadSeek,
        count: u64,
    ) -> std::io::Result<usize> {
        if self.end_of_stream {
            self.cached_data_size = Some(0);
            return Ok(0);
        }

        if let Some(size) = self.cached_data_size {
            if self.cached_count == count {
                return Ok(size);
            }
        }

        self.cached_count = count;
        self.cached_data_size = None;

        let current_start = self.current_pos;
        let mut remaining = count * self.edit_ratio;

        let has_manager = self.manager.is_some();

        while remaining > 0 {
            self.edit_point = false;

            let mut scan: u32 = 0xFFFF_FFFF;
            file.seek(SeekFrom::Start(self.current_pos))?;
            let mut feeder = Feeder::new(file);

            let mut found_start = false;
            let mut seq_head = false;

            loop {
                let Some(byte) = feeder.next_byte()? else {
                    // Force this to be the last item
                    remaining = 1;
                    self.end_of_stream = true;
                    break;
                };

                scan = (scan << 8) | u32::from(byte);
                self.current_pos += 1;

                if !found_start {
                    if scan == 0x0000_0100 {
                        // Picture start: the next two bytes carry the
                        // temporal reference and picture type
                        found_start = true;

                        let hi = feeder.next_byte()?.unwrap_or(0);
                        let lo = feeder.next_byte()?.unwrap_or(0);
                        self.current_pos += 2;
                        let picture_data = (u16::from(hi) << 8) | u16::from(lo);

                        if has_manager {
                            self.offer_picture(picture_data, seq_head);
                        } else if seq_head && self.closed_gop {
                            self.edit_point = true;
                        }

                        self.gop_offset += 1;
                    } else if scan == 0x0000_01B8 {
                        // GOP header: pick out the closed_gop flag
                        self.gop_offset = 0;
                        self.gop_place = GopPlace::Start;

                        feeder.next_byte()?;
                        feeder.next_byte()?;
                        feeder.next_byte()?;
                        let flags = feeder.next_byte()?.unwrap_or(0);
                        self.closed_gop = flags & 0x40 != 0;
                        self.current_pos += 4;
                    } else if scan == 0x0000_01B3 {
                        seq_head = true;
                    }
                } else if scan == 0x0000_01B3 || scan == 0x0000_01B8 || scan == 0x0000_0100 {
                    // The next edit unit starts at this start code
                    self.current_pos -= 4;
                    break;
                }
            }

            remaining -= 1;
            self.picture_number += 1;
        }

        // Leave the file at the start of the scanned data
        file.seek(SeekFrom::Start(current_start))?;

        let size = (self.current_pos - current_start) as usize;
        self.cached_data_size = Some(size);
        Ok(size)
    }
}

impl EssenceSubParser for Mpeg2VesParser {
    fn name(&self) -> &'static str {
        "MPEG2-VES"
    }

    fn handled_extensions(&self) -> &'static [&'static str] {
        &["M2V", "MPG", "MPEG"]
    }

    /// Examine the open file and return a descriptor list
    ///
    /// The file must start with two zero bytes and reach a sequence
    /// header start code within the identification buffer; valid streams
    /// padded with more than 510 leading zero bytes are not identified.
    fn identify_essence(
        &mut self,
        file: &mut dyn ReadSeek,
    ) -> std::io::Result<Vec<EssenceStreamDescriptor>> {
        let mut buffer = vec![0u8; IDENTIFY_BUFFER];
        file.seek(SeekFrom::Start(0))?;
        let got = read_up_to(file, &mut buffer)?;
        buffer.truncate(got);

        if buffer.len() < 16 {
            return Ok(Vec::new());
        }

        // Anything not starting with a start-code prefix cannot be a
        // valid elementary stream
        if buffer[0] != 0 || buffer[1] != 0 {
            return Ok(Vec::new());
        }

        // A pathological zero run means we would not find the start code
        // where we expect it
        let leading_zeros = buffer.iter().take_while(|&&b| b == 0).count();
        if leading_zeros > MAX_LEADING_ZEROS {
            return Ok(Vec::new());
        }

        // Find the sequence header
        let mut start_pos = None;
        let mut search = 0;
        while search + 4 <= buffer.len() {
            match mpeg2::find_start_code(&buffer[search..]) {
                Some((offset, code)) if code == mpeg2::SEQUENCE_HEADER_CODE => {
                    start_pos = Some(search + offset);
                    break;
                }
                Some((offset, _)) => search += offset + 4,
                None => break,
            }
        }
        let Some(start_pos) = start_pos else {
            return Ok(Vec::new());
        };

        let Some(video) = self.build_descriptor(file, start_pos as u64)? else {
            return Ok(Vec::new());
        };

        self.current_descriptor = Some(video.clone());

        Ok(vec![EssenceStreamDescriptor {
            id: 0,
            description: "MPEG2 video essence".to_string(),
            source_format: MPEG2_VES_FORMAT,
            video: Some(video),
            start_timecode: self.gop_start_timecode,
        }])
    }

    fn identify_wrapping_options(
        &mut self,
        _file: &mut dyn ReadSeek,
        descriptor: &EssenceStreamDescriptor,
    ) -> Vec<WrappingOption> {
        if descriptor.source_format != MPEG2_VES_FORMAT {
            return Vec::new();
        }
        // The identification step configures the parser, so wrapping can
        // only be offered for a stream this parser just identified
        if self.current_descriptor.is_none() {
            return Vec::new();
        }

        let mut frame_ul = labels::MPEG_ES_WRAPPING_BASE;
        frame_ul[14] = 0x60;
        frame_ul[15] = 0x01;

        let mut clip_ul = labels::MPEG_ES_WRAPPING_BASE;
        clip_ul[14] = 0x60;
        clip_ul[15] = 0x02;

        vec![
            WrappingOption {
                name: "frame",
                description: "SMPTE 381M frame wrapping of MPEG2 video elementary stream"
                    .to_string(),
                wrapping_ul: UniversalLabel(frame_ul),
                gc_essence_type: 0x15,
                gc_element_type: 0x05,
                kind: WrapKind::Frame,
                can_slave: false,
                can_index: true,
                cbr_index: false,
                ber_size: 0,
                bytes_per_edit_unit: 0,
            },
            WrappingOption {
                name: "clip",
                description: "SMPTE 381M clip wrapping of MPEG2 video elementary stream"
                    .to_string(),
                wrapping_ul: UniversalLabel(clip_ul),
                gc_essence_type: 0x15,
                gc_element_type: 0x06,
                kind: WrapKind::Clip,
                can_slave: true,
                can_index: true,
                cbr_index: false,
                ber_size: 0,
                bytes_per_edit_unit: 0,
            },
        ]
    }

    fn use_wrapping(&mut self, _stream: u32, wrapping: &WrappingOption) {
        self.selected_wrapping = Some(wrapping.clone());
        self.selected_edit_rate = self.native_edit_rate;
        self.edit_ratio = 1;
        self.picture_number = 0;
        self.anchor_frame = 0;
        self.current_pos = 0;
        self.gop_offset = 0;
        self.closed_gop = false;
        self.gop_place = GopPlace::Unknown;
        self.end_of_stream = false;
        self.cached_data_size = None;
    }

    fn native_edit_rate(&self) -> Rational {
        self.native_edit_rate
    }

    fn set_edit_rate(&mut self, rate: Rational) -> bool {
        if rate == self.native_edit_rate {
            self.selected_edit_rate = rate;
            return true;
        }

        // Clip wrapping can run at any rate
        if self
            .selected_wrapping
            .as_ref()
            .map(|w| w.kind == WrapKind::Clip)
            .unwrap_or(false)
        {
            self.selected_edit_rate = rate;
            return true;
        }

        if self.native_edit_rate.den == 0 || rate.den == 0 {
            return false;
        }

        let native = self.native_edit_rate.to_f64();
        let requested = rate.to_f64();

        // The same rate in a different representation (50/2 for 25/1)
        if native == requested {
            self.selected_edit_rate = rate;
            return true;
        }

        if requested == 0.0 {
            return false;
        }

        // Integer divisions of the native rate are produced by skipping
        let ratio = native / requested;
        if ratio == ratio.floor() && ratio > 0.0 {
            self.edit_ratio = ratio as u64;
            self.selected_edit_rate = rate;
            return true;
        }

        false
    }

    fn edit_rate(&self) -> Rational {
        self.selected_edit_rate
    }

    /// Current position in selected-edit-rate units
    ///
    /// Returns 0 when either edit rate has a zero denominator.
    fn current_position(&self) -> i64 {
        if self.selected_edit_rate == self.native_edit_rate {
            return self.picture_number;
        }

        if self.selected_edit_rate.den == 0 || self.native_edit_rate.den == 0 {
            return 0;
        }

        let pos = (self.picture_number as f64
            * f64::from(self.selected_edit_rate.num)
            * f64::from(self.native_edit_rate.den))
            / (f64::from(self.selected_edit_rate.den) * f64::from(self.native_edit_rate.num));
        (pos + 0.5).floor() as i64
    }

    fn read_internal(
        &mut self,
        file: &mut dyn ReadSeek,
        _stream: u32,
        count: u64,
    ) -> std::io::Result<usize> {
        self.scan_internal(file, count)
    }

    fn read(
        &mut self,
        file: &mut dyn ReadSeek,
        stream: u32,
        count: u64,
    ) -> std::io::Result<Vec<u8>> {
        let size = self.read_internal(file, stream, count)?;

        let mut data = vec![0u8; size];
        file.read_exact(&mut data)?;

        self.cached_data_size = None;
        Ok(data)
    }

    fn set_index_manager(&mut self, manager: SharedIndexManager, stream_id: usize) {
        self.manager = Some((manager, stream_id));
    }

    fn set_option(&mut self, name: &str, _value: i64) -> bool {
        if name == "EditPoint" {
            return self.edit_point;
        }
        debug!(option = name, "not a known MPEG2-VES option");
        false
    }

    fn reset(&mut self) {
        self.picture_number = 0;
        self.anchor_frame = 0;
        self.current_pos = 0;
        self.gop_offset = 0;
        self.closed_gop = false;
        self.gop_place = GopPlace::Unknown;
        self.end_of_stream = false;
        self.edit_point = false;
        self.cached_data_size = None;
    }
}

/// Buffered single-byte reader used by the scanner
struct Feeder<'a> {
    file: &'a mut dyn ReadSeek,
    buffer: [u8; SCAN_BUFFER],
    len: usize,
    pos: usize,
}

impl<'a> Feeder<'a> {
    fn new(file: &'a mut dyn ReadSeek) -> Self {
        Feeder {
            file,
            buffer: [0; SCAN_BUFFER],
            len: 0,
            pos: 0,
        }
    }

    fn next_byte(&mut self) -> std::io::Result<Option<u8>> {
        if self.pos == self.len {
            self.len = read_up_to(self.file, &mut self.buffer)?;
            self.pos = 0;
            if self.len == 0 {
                return Ok(None);
            }
        }
        let byte = self.buffer[self.pos];
        self.pos += 1;
        Ok(Some(byte))
    }
}

/// Read until the buffer is full or the source ends
fn read_up_to(file: &mut dyn ReadSeek, buffer: &mut [u8]) -> std::io::Result<usize> {
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

/// Default video line map for common rasters
fn video_line_map(progressive: bool, v_size: u32) -> [i32; 2] {
    if progressive {
        match v_size {
            480 => [45, 0],
            512 => [13, 0],
            720 => [26, 0],
            1080 => [42, 0],
            _ => [0, 0],
        }
    } else {
        match v_size {
            576 => [23, 336],
            480 => [23, 286],
            512 => [7, 270],
            608 => [7, 320],
            1080 => [21, 584],
            _ => [0, 0],
        }
    }
}

/// Essence source that owns an open MPEG-2 VES file and its parser
pub struct Mpeg2VesSource<R: Read + Seek> {
    parser: Mpeg2VesParser,
    file: R,
    stream: u32,
    bytes_remaining: usize,
    at_end_of_data: bool,
}

impl<R: Read + Seek> Mpeg2VesSource<R> {
    /// Wrap an identified file and its configured parser
    pub fn new(parser: Mpeg2VesParser, file: R, stream: u32) -> Self {
        Mpeg2VesSource {
            parser,
            file,
            stream,
            bytes_remaining: 0,
            at_end_of_data: false,
        }
    }

    /// Access the wrapped parser
    pub fn parser(&self) -> &Mpeg2VesParser {
        &self.parser
    }

    fn wrap_kind(&self) -> WrapKind {
        self.parser
            .selected_wrapping
            .as_ref()
            .map(|w| w.kind)
            .unwrap_or(WrapKind::Frame)
    }
}

impl<R: Read + Seek> EssenceSource for Mpeg2VesSource<R> {
    fn next_data_size(&mut self) -> usize {
        if self.bytes_remaining > 0 {
            return self.bytes_remaining;
        }
        if self.at_end_of_data {
            return 0;
        }
        self.parser
            .read_internal(&mut self.file, self.stream, 1)
            .unwrap_or(0)
    }

    fn next_data(&mut self, size: usize, max_size: usize) -> Option<Vec<u8>> {
        if self.bytes_remaining == 0 {
            let next = match self.parser.read_internal(&mut self.file, self.stream, 1) {
                Ok(size) => size,
                Err(e) => {
                    error!(error = %e, "MPEG2-VES read failed");
                    0
                }
            };
            self.parser.cached_data_size = None;

            if next == 0 {
                self.at_end_of_data = true;
                return None;
            }
            self.bytes_remaining = next;
        }

        let mut bytes = self.bytes_remaining;
        if max_size != 0 {
            bytes = bytes.min(max_size);
        }
        if size != 0 {
            bytes = bytes.min(size);
        }

        let mut chunk = vec![0u8; bytes];
        if let Err(e) = self.file.read_exact(&mut chunk) {
            error!(error = %e, "MPEG2-VES data read failed");
            return None;
        }
        self.bytes_remaining -= bytes;
        Some(chunk)
    }

    fn end_of_item(&self) -> bool {
        match self.wrap_kind() {
            WrapKind::Clip => self.bytes_remaining == 0 && self.at_end_of_data,
            _ => self.bytes_remaining == 0,
        }
    }

    fn end_of_data(&self) -> bool {
        self.at_end_of_data
    }

    fn gc_essence_type(&self) -> u8 {
        self.parser
            .selected_wrapping
            .as_ref()
            .map(|w| w.gc_essence_type)
            .unwrap_or(0x15)
    }

    fn gc_element_type(&self) -> u8 {
        self.parser
            .selected_wrapping
            .as_ref()
            .map(|w| w.gc_element_type)
            .unwrap_or(0x05)
    }

    fn edit_rate(&self) -> Rational {
        self.parser.edit_rate()
    }

    fn current_position(&self) -> i64 {
        self.parser.current_position()
    }

    fn can_index(&self) -> bool {
        true
    }

    fn set_index_manager(&mut self, manager: SharedIndexManager, stream_id: usize) {
        self.parser.set_index_manager(manager, stream_id);
    }

    fn is_edit_point(&self) -> bool {
        self.parser.at_edit_point()
    }

    fn set_option(&mut self, name: &str, value: i64) -> bool {
        self.parser.set_option(name, value)
    }

    fn ber_size(&self) -> usize {
        self.parser
            .selected_wrapping
            .as_ref()
            .map(|w| w.ber_size)
            .unwrap_or(0)
    }

    fn name(&self) -> &str {
        "MPEG2-VES essence source"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Sequence header for 640x480 progressive at 50fps, 4:3
    fn sequence_header() -> Vec<u8> {
        vec![
            0x00, 0x00, 0x01, 0xB3, // start code
            0x28, 0x01, 0xE0, // 640 x 480
            0x26, // aspect 4:3, frame rate code 6 (50)
            0xFF, 0xFF, 0xE0, // bit rate + marker
            0x00, // vbv, flags
        ]
    }

    fn gop_header(closed: bool) -> Vec<u8> {
        vec![
            0x00,
            0x00,
            0x01,
            0xB8,
            0x00,
            0x08,
            0x00,
            if closed { 0x40 } else { 0x00 },
        ]
    }

    fn picture(temporal_reference: u16, picture_type: u8, payload: usize) -> Vec<u8> {
        let mut data = vec![0x00, 0x00, 0x01, 0x00];
        let picture_data = (temporal_reference << 6) | (u16::from(picture_type) << 3);
        data.push((picture_data >> 8) as u8);
        data.push(picture_data as u8);
        data.extend(std::iter::repeat(0xA5).take(payload));
        data
    }

    /// A small closed-GOP stream: seq + gop + I B B P pictures
    fn test_stream() -> Vec<u8> {
        let mut stream = Vec::new();
        stream.extend(sequence_header());
        stream.extend(gop_header(true));
        stream.extend(picture(0, 1, 40)); // I  (display 0)
        stream.extend(picture(3, 2, 30)); // P  (display 3)
        stream.extend(picture(1, 3, 20)); // B  (display 1)
        stream.extend(picture(2, 3, 20)); // B  (display 2)
        // Pad so identification can read a full descriptor buffer
        stream.resize(1024, 0);
        stream
    }

    #[test]
    fn identify_builds_descriptor() {
        let mut parser = Mpeg2VesParser::new();
        let mut file = Cursor::new(test_stream());

        let descriptors = parser.identify_essence(&mut file).unwrap();
        assert_eq!(descriptors.len(), 1);

        let video = descriptors[0].video.as_ref().unwrap();
        assert_eq!(video.sample_rate, Rational::new(50, 1));
        assert_eq!(video.frame_layout, 0);
        assert_eq!(video.stored_width, 640);
        assert_eq!(video.stored_height, 480);
        assert_eq!(video.aspect_ratio, Some(Rational::new(4, 3)));
        assert_eq!(parser.native_edit_rate(), Rational::new(50, 1));
    }

    #[test]
    fn identify_rejects_non_ves() {
        let mut parser = Mpeg2VesParser::new();

        // Does not start with two zero bytes
        let mut file = Cursor::new(vec![0x47u8; 1024]);
        assert!(parser.identify_essence(&mut file).unwrap().is_empty());

        // No sequence header at all
        let mut file = Cursor::new(vec![0u8, 0, 1, 0xB8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert!(parser.identify_essence(&mut file).unwrap().is_empty());
    }

    #[test]
    fn identify_rejects_long_zero_runs() {
        let mut stream = vec![0u8; 600];
        stream.extend(sequence_header()[2..].iter());
        stream.resize(2048, 0);

        let mut parser = Mpeg2VesParser::new();
        let mut file = Cursor::new(stream);
        assert!(parser.identify_essence(&mut file).unwrap().is_empty());
    }

    #[test]
    fn wrapping_options_frame_and_clip() {
        let mut parser = Mpeg2VesParser::new();
        let mut file = Cursor::new(test_stream());
        let descriptors = parser.identify_essence(&mut file).unwrap();

        let options = parser.identify_wrapping_options(&mut file, &descriptors[0]);
        assert_eq!(options.len(), 2);

        let frame = &options[0];
        assert_eq!(frame.kind, WrapKind::Frame);
        assert_eq!(frame.gc_essence_type, 0x15);
        assert_eq!(frame.gc_element_type, 0x05);
        assert_eq!(frame.wrapping_ul.as_bytes()[15], 0x01);
        assert!(!frame.can_slave);

        let clip = &options[1];
        assert_eq!(clip.kind, WrapKind::Clip);
        assert_eq!(clip.gc_element_type, 0x06);
        assert_eq!(clip.wrapping_ul.as_bytes()[15], 0x02);
        assert!(clip.can_slave);
    }

    #[test]
    fn edit_rate_ladder() {
        let mut parser = Mpeg2VesParser::new();
        let mut file = Cursor::new(test_stream());
        let descriptors = parser.identify_essence(&mut file).unwrap();
        let options = parser.identify_wrapping_options(&mut file, &descriptors[0]);
        parser.use_wrapping(0, &options[0]);

        // Native rate and equivalent representations are accepted
        assert!(parser.set_edit_rate(Rational::new(50, 1)));
        assert!(parser.set_edit_rate(Rational::new(100, 2)));

        // Integer divisions of the native rate are accepted
        assert!(parser.set_edit_rate(Rational::new(25, 1)));

        // Anything else is rejected for frame wrapping
        assert!(!parser.set_edit_rate(Rational::new(30000, 1001)));
        assert!(!parser.set_edit_rate(Rational::new(25, 0)));

        // Clip wrapping accepts any rate
        parser.use_wrapping(0, &options[1]);
        assert!(parser.set_edit_rate(Rational::new(30000, 1001)));
    }

    #[test]
    fn zero_denominator_position_is_zero() {
        let mut parser = Mpeg2VesParser::new();
        parser.native_edit_rate = Rational::new(25, 1);
        parser.selected_edit_rate = Rational::new(50, 0);
        parser.picture_number = 10;
        assert_eq!(parser.current_position(), 0);
    }

    #[test]
    fn scan_finds_edit_unit_boundaries() {
        let mut parser = Mpeg2VesParser::new();
        let mut file = Cursor::new(test_stream());
        let descriptors = parser.identify_essence(&mut file).unwrap();
        let options = parser.identify_wrapping_options(&mut file, &descriptors[0]);
        parser.use_wrapping(0, &options[0]);

        // First edit unit runs from the sequence header to just before
        // the second picture start code
        let first = parser
            .read_internal(&mut file, 0, 1)
            .unwrap();
        assert_eq!(first, 12 + 8 + 4 + 2 + 40);

        // The cached size is returned without rescanning
        assert_eq!(parser.read_internal(&mut file, 0, 1).unwrap(), first);

        let data = parser.read(&mut file, 0, 1).unwrap();
        assert_eq!(data.len(), first);
        assert_eq!(&data[0..4], &[0x00, 0x00, 0x01, 0xB3]);

        // Second edit unit is the P picture
        let second = parser.read(&mut file, 0, 1).unwrap();
        assert_eq!(second.len(), 4 + 2 + 30);
        assert_eq!(&second[0..4], &[0x00, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn scan_offers_index_facts() {
        use crate::index_manager::IndexManager;
        use crate::index::INDEX_LOWEST;

        let mut parser = Mpeg2VesParser::new();
        let mut file = Cursor::new(test_stream());
        let descriptors = parser.identify_essence(&mut file).unwrap();
        let options = parser.identify_wrapping_options(&mut file, &descriptors[0]);
        parser.use_wrapping(0, &options[0]);

        let manager = IndexManager::new(-1, 0).shared();
        parser.set_index_manager(manager.clone(), 0);

        // Scan all four pictures, supplying offsets as a writer would
        let mut offset = 0u64;
        for unit in 0..4 {
            let size = parser.read_internal(&mut file, 0, 1).unwrap();
            parser.cached_data_size = None;
            manager.borrow_mut().set_offset(0, unit, offset, 0, None);
            offset += size as u64;
        }

        let mut mgr = manager.borrow_mut();
        let mut table = mgr.make_index();
        let added = mgr
            .add_entries_to_index(false, &mut table, INDEX_LOWEST, i64::MAX)
            .unwrap();
        assert_eq!(added, 4);

        // The I frame carries the sequence-header and closed-GOP flags
        let pos = table.lookup(0, 0, false);
        assert_eq!(pos.flags, 0xC0);
        assert_eq!(pos.key_frame_offset, 0);

        // The P frame anchors back to the I frame
        let pos = table.lookup(1, 0, false);
        assert_eq!(pos.flags, 0x22);
        assert_eq!(pos.key_frame_offset, -1);

        // The first B frame in a closed GOP is forward-only
        let pos = table.lookup(2, 0, false);
        assert_eq!(pos.flags, 0x13);
    }
}
