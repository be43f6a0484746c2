//! End-to-end write/read tests over whole files.

use mxfkit::{
    BodyReader, BodyStream, BodyWriter, EssenceSource, Features, FileParser, GcReadHandler,
    IndexTable, KlvInfo, Mpeg2VesParser, PartitionPack, Rational, ReaderContext, ReaderUnit,
    SequentialEssenceSource, StreamIndexFlags, StreamWrap,
};
use std::cell::RefCell;
use std::io::Cursor;
use std::rc::Rc;

/// Build an MPEG-2 VES test stream: sequence header, closed GOP, then
/// `pictures` I-frames with growing payloads.
fn ves_stream(pictures: usize) -> Vec<u8> {
    let mut stream = Vec::new();
    // 640x480 progressive, 25fps, 4:3
    stream.extend([
        0x00, 0x00, 0x01, 0xB3, 0x28, 0x01, 0xE0, 0x23, 0xFF, 0xFF, 0xE0, 0x00,
    ]);
    stream.extend([0x00, 0x00, 0x01, 0xB8, 0x00, 0x08, 0x00, 0x40]);
    for i in 0..pictures {
        stream.extend([0x00, 0x00, 0x01, 0x00]);
        let picture_data = ((i as u16) << 6) | (1 << 3);
        stream.push((picture_data >> 8) as u8);
        stream.push(picture_data as u8);
        stream.extend(std::iter::repeat(0x5A).take(20 + i));
    }
    let len = stream.len().max(600);
    stream.resize(len, 0);
    stream
}

/// Wrap a VES stream into a frame-wrapped body stream
fn frame_stream(data: Vec<u8>, body_sid: u32, index_sid: u32) -> BodyStream {
    let mut parser = FileParser::new(Box::new(Mpeg2VesParser::new()), vec![Cursor::new(data)]);
    let descriptors = parser.identify().unwrap();
    assert_eq!(descriptors.len(), 1);
    let wrappings = parser.wrapping_options(&descriptors[0]);
    parser.select_wrapping(0, &wrappings[0]);

    let source = Rc::new(RefCell::new(SequentialEssenceSource::new(parser)));
    let mut stream = BodyStream::new(body_sid, source);
    stream.set_index_sid(index_sid);
    stream.set_wrap(StreamWrap::Frame);
    stream
}

struct PictureCollector {
    klvs: Vec<KlvInfo>,
}

impl GcReadHandler for PictureCollector {
    fn handle_data(&mut self, _ctx: &mut ReaderContext, klv: &KlvInfo) -> bool {
        self.klvs.push(klv.clone());
        true
    }
}

/// Walk a finished file and return its partition packs with the raw
/// index bytes each one carries.
fn partitions_with_index(data: &[u8]) -> Vec<(PartitionPack, Vec<u8>)> {
    let mut result = Vec::new();
    let mut pos = 0usize;

    while pos + 16 <= data.len() {
        let key: [u8; 16] = data[pos..pos + 16].try_into().unwrap();
        if !mxfkit::UniversalLabel(key).is_partition_pack() {
            break;
        }

        let pack = PartitionPack::parse(&data[pos..]).unwrap();
        let pack_size = pack.size();
        let metadata = pack.header_byte_count as usize;
        let index_start = pos + pack_size + metadata;
        let index_bytes =
            data[index_start..index_start + pack.index_byte_count as usize].to_vec();

        result.push((pack.clone(), index_bytes));

        // Advance over the partition's non-essence areas, then skip KLVs
        // until the next partition pack
        pos = index_start + pack.index_byte_count as usize;
        while pos + 16 <= data.len() {
            let key: [u8; 16] = data[pos..pos + 16].try_into().unwrap();
            let key = mxfkit::UniversalLabel(key);
            if key.is_partition_pack() {
                break;
            }
            let (length, len_size) =
                mxfkit_core::read_ber_slice(&data[pos + 16..]).unwrap();
            pos += 16 + len_size + length as usize;
        }
    }

    result
}

#[test]
fn sprinkled_frame_wrap_round_trip() {
    let pictures = 12;
    let input = ves_stream(pictures);

    let mut stream = frame_stream(input.clone(), 1, 129);
    stream.set_index_flags(StreamIndexFlags::SPRINKLED | StreamIndexFlags::FULL_FOOTER);

    let mut writer = BodyWriter::new(Cursor::new(Vec::new()), Features::default());
    assert!(writer.add_stream(stream, 0));

    writer.write_header(false, false).unwrap();

    // Three body partitions of four edit units each; sprinkle chunks lag
    // the essence by one partition, so next_sprinkled steps up behind it
    let mut sprinkle_positions = Vec::new();
    for _ in 0..3 {
        writer.write_partition(4, 0).unwrap();
        sprinkle_positions.push(writer.stream(1).unwrap().next_sprinkled());
    }
    assert!(sprinkle_positions.windows(2).all(|w| w[0] <= w[1]));

    writer.write_footer(false, true).unwrap();
    let data = writer.into_inner().into_inner();

    // The header partition comes first, with no run-in
    assert_eq!(mxfkit::locate_first_partition(&mut Cursor::new(&data[..])).unwrap(), 0);

    // Header + 3 body + footer
    let partitions = partitions_with_index(&data);
    assert_eq!(partitions.len(), 5);
    assert_eq!(partitions[0].0.kind, mxfkit::PartitionKind::Header);
    assert_eq!(partitions[4].0.kind, mxfkit::PartitionKind::Footer);

    // Index chunks: two lagging body sprinkles plus the footer chunk
    let indexed: Vec<_> = partitions.iter().filter(|(_, i)| !i.is_empty()).collect();
    assert_eq!(indexed.len(), 3);

    // Reassemble the table from all the sprinkled chunks
    let mut table = IndexTable::new();
    for (_, index_bytes) in &partitions {
        if !index_bytes.is_empty() {
            table.add_segments(index_bytes).unwrap();
        }
    }
    assert_eq!(table.index_sid, 129);
    assert_eq!(table.body_sid, 1);
    assert_eq!(table.duration(), pictures as i64);

    // Read the essence back and check the index locations against the
    // stream offsets actually observed
    let collector = Rc::new(RefCell::new(PictureCollector { klvs: Vec::new() }));
    let mut reader = BodyReader::new();
    reader.make_gc_reader(1, Some(collector.clone()), None);

    let mut file = Cursor::new(&data[..]);
    reader.locate_start(&mut file).unwrap();
    reader.read_from_file(&mut file, ReaderUnit::Klv, 0).unwrap();

    let klvs = &collector.borrow().klvs;
    assert_eq!(klvs.len(), pictures);

    for (i, klv) in klvs.iter().enumerate() {
        let pos = table.lookup(i as i64, 0, false);
        assert!(pos.exact, "lookup {} must be exact", i);
        assert_eq!(pos.location, klv.stream_offset, "location of edit unit {}", i);
    }

    // Frame wrapping preserves every input byte in order
    let rebuilt: Vec<u8> = klvs.iter().flat_map(|k| k.value.clone()).collect();
    assert_eq!(rebuilt, input);
}

#[test]
fn gc_unit_counting_reads_one_package_at_a_time() {
    let input = ves_stream(6);
    let mut stream = frame_stream(input, 1, 0);
    stream.set_index_flags(StreamIndexFlags::NONE);

    let mut writer = BodyWriter::new(Cursor::new(Vec::new()), Features::default());
    assert!(writer.add_stream(stream, 0));
    writer.write_header(false, false).unwrap();
    writer.write_body(0, 0).unwrap();
    writer.write_footer(false, true).unwrap();
    let data = writer.into_inner().into_inner();

    let collector = Rc::new(RefCell::new(PictureCollector { klvs: Vec::new() }));
    let mut reader = BodyReader::new();
    reader.make_gc_reader(1, Some(collector.clone()), None);

    let mut file = Cursor::new(&data[..]);

    // Two content packages: the boundary KLV of the third is dispatched
    // when the count trips
    let satisfied = reader.read_from_file(&mut file, ReaderUnit::Gc, 2).unwrap();
    assert!(satisfied);
    assert_eq!(collector.borrow().klvs.len(), 3);
}

#[test]
fn resync_recovers_at_next_partition() {
    let input = ves_stream(8);
    let mut stream = frame_stream(input, 1, 129);
    stream.set_index_flags(StreamIndexFlags::FULL_FOOTER);

    let mut writer = BodyWriter::new(Cursor::new(Vec::new()), Features::default());
    assert!(writer.add_stream(stream, 0));
    writer.write_header(false, false).unwrap();
    writer.write_partition(4, 0).unwrap();
    writer.write_partition(4, 0).unwrap();
    writer.write_footer(false, true).unwrap();
    let mut data = writer.into_inner().into_inner();

    let partitions = partitions_with_index(&data);
    assert_eq!(partitions.len(), 4);
    let second_body_offset = partitions[2].0.this_partition;

    // Corrupt a KLV key inside the first body partition's essence
    let corrupt_at = partitions[1].0.this_partition as usize + partitions[1].0.size() + 2;
    for byte in &mut data[corrupt_at..corrupt_at + 8] {
        *byte = 0xDE;
    }

    let mut reader = BodyReader::new();
    let mut file = Cursor::new(&data[..]);

    reader.seek(corrupt_at as u64);
    assert!(reader.re_sync(&mut file).unwrap());
    assert_eq!(reader.tell(), second_body_offset);
    assert!(reader.is_at_partition(&mut file).unwrap());
}

/// Constant-rate source used for the CBR header index scenario
struct CbrSource {
    frame_size: u32,
    frames_left: u32,
}

impl EssenceSource for CbrSource {
    fn next_data_size(&mut self) -> usize {
        if self.frames_left == 0 {
            0
        } else {
            self.frame_size as usize
        }
    }

    fn next_data(&mut self, _size: usize, _max: usize) -> Option<Vec<u8>> {
        if self.frames_left == 0 {
            return None;
        }
        self.frames_left -= 1;
        Some(vec![0x42; self.frame_size as usize])
    }

    fn end_of_item(&self) -> bool {
        true
    }

    fn end_of_data(&self) -> bool {
        self.frames_left == 0
    }

    fn gc_essence_type(&self) -> u8 {
        0x15
    }

    fn gc_element_type(&self) -> u8 {
        0x05
    }

    fn edit_rate(&self) -> Rational {
        Rational::new(25, 1)
    }

    fn current_position(&self) -> i64 {
        0
    }

    fn bytes_per_edit_unit(&mut self, _kag: u32) -> u32 {
        self.frame_size
    }

    fn can_index(&self) -> bool {
        true
    }
}

#[test]
fn cbr_header_index_round_trip() {
    let source = Rc::new(RefCell::new(CbrSource {
        frame_size: 2048,
        frames_left: 10,
    }));

    let mut stream = BodyStream::new(1, source);
    stream.set_index_sid(129);
    stream.set_wrap(StreamWrap::Frame);
    stream.set_index_flags(StreamIndexFlags::CBR_HEADER);

    let mut writer = BodyWriter::new(Cursor::new(Vec::new()), Features::default());
    assert!(writer.add_stream(stream, 0));
    writer.write_header(true, true).unwrap();
    writer.write_body(0, 0).unwrap();
    writer.write_footer(false, true).unwrap();
    let data = writer.into_inner().into_inner();

    let partitions = partitions_with_index(&data);

    // The CBR table sits in the header partition
    let (header, header_index) = &partitions[0];
    assert_eq!(header.kind, mxfkit::PartitionKind::Header);
    assert_eq!(header.index_sid, 129);
    assert!(!header_index.is_empty());

    let mut table = IndexTable::new();
    table.add_segments(header_index).unwrap();
    assert_eq!(table.edit_unit_byte_count, 2048);
    assert_eq!(table.segment_count(), 0);

    let pos = table.lookup(7, 0, true);
    assert!(pos.exact);
    assert_eq!(pos.location, 7 * 2048);
}

#[test]
fn rip_lists_every_partition() {
    let input = ves_stream(4);
    let mut stream = frame_stream(input, 1, 0);
    stream.set_index_flags(StreamIndexFlags::NONE);

    let mut writer = BodyWriter::new(Cursor::new(Vec::new()), Features::default());
    assert!(writer.add_stream(stream, 0));
    writer.write_header(false, false).unwrap();
    writer.write_body(0, 0).unwrap();
    writer.write_footer(false, true).unwrap();
    let data = writer.into_inner().into_inner();

    // The RIP is the last KLV; its trailing four bytes give its size
    let overall =
        u32::from_be_bytes(data[data.len() - 4..].try_into().unwrap()) as usize;
    let rip_start = data.len() - overall;
    let (length, len_size) = mxfkit_core::read_ber_slice(&data[rip_start + 16..]).unwrap();
    let value = &data[rip_start + 16 + len_size..rip_start + 16 + len_size + length as usize];

    let rip = mxfkit::RandomIndexPack::parse(value).unwrap();
    let partitions = partitions_with_index(&data);
    assert_eq!(rip.entries.len(), partitions.len());

    for (entry, (pack, _)) in rip.entries.iter().zip(&partitions) {
        assert_eq!(entry.byte_offset, pack.this_partition);
        assert_eq!(entry.body_sid, pack.body_sid);
    }
}

#[test]
fn duplicate_body_sid_is_rejected() {
    let first = frame_stream(ves_stream(2), 7, 0);
    let second = frame_stream(ves_stream(2), 7, 0);

    let mut writer = BodyWriter::new(Cursor::new(Vec::new()), Features::default());
    assert!(writer.add_stream(first, 0));
    assert!(!writer.add_stream(second, 0));
}
