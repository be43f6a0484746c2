//! Header parsers for MPEG-2 video elementary streams.

use crate::types::*;
use crate::{
    Mpeg2Error, Result, EXTENSION_START_CODE, GOP_START_CODE, PICTURE_START_CODE,
    SEQUENCE_HEADER_CODE,
};

/// Big-endian bit reader over a byte slice.
#[derive(Debug)]
pub struct BitReader<'a> {
    data: &'a [u8],
    byte_pos: usize,
    bit_pos: u8,
}

impl<'a> BitReader<'a> {
    /// Create a reader over a slice.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            byte_pos: 0,
            bit_pos: 0,
        }
    }

    /// Read a single bit.
    pub fn bit(&mut self) -> Result<u8> {
        if self.byte_pos >= self.data.len() {
            return Err(Mpeg2Error::InsufficientData {
                needed: self.byte_pos + 1,
                available: self.data.len(),
            });
        }

        let bit = (self.data[self.byte_pos] >> (7 - self.bit_pos)) & 1;
        self.bit_pos += 1;
        if self.bit_pos == 8 {
            self.bit_pos = 0;
            self.byte_pos += 1;
        }
        Ok(bit)
    }

    /// Read `count` bits (up to 32) as an unsigned value.
    pub fn bits(&mut self, count: u8) -> Result<u32> {
        let mut value = 0u32;
        for _ in 0..count {
            value = (value << 1) | u32::from(self.bit()?);
        }
        Ok(value)
    }

    /// Read a flag bit.
    pub fn flag(&mut self) -> Result<bool> {
        Ok(self.bit()? == 1)
    }

    /// Bytes consumed so far, counting a partial byte as consumed.
    pub fn bytes_read(&self) -> usize {
        if self.bit_pos > 0 {
            self.byte_pos + 1
        } else {
            self.byte_pos
        }
    }
}

/// Find the next `00 00 01 xx` start code in `data`.
///
/// Returns the offset of the first zero byte and the code suffix.
pub fn find_start_code(data: &[u8]) -> Option<(usize, u8)> {
    if data.len() < 4 {
        return None;
    }
    (0..data.len() - 3)
        .find(|&i| data[i] == 0x00 && data[i + 1] == 0x00 && data[i + 2] == 0x01)
        .map(|i| (i, data[i + 3]))
}

fn check_start_code(data: &[u8], expected: u8, min_len: usize) -> Result<()> {
    if data.len() < min_len {
        return Err(Mpeg2Error::InsufficientData {
            needed: min_len,
            available: data.len(),
        });
    }
    if data[0] != 0x00 || data[1] != 0x00 || data[2] != 0x01 || data[3] != expected {
        let found = (u32::from(data[0]) << 24)
            | (u32::from(data[1]) << 16)
            | (u32::from(data[2]) << 8)
            | u32::from(data[3]);
        return Err(Mpeg2Error::WrongStartCode { expected, found });
    }
    Ok(())
}

/// Parse a sequence header starting at `00 00 01 B3`.
pub fn parse_sequence_header(data: &[u8]) -> Result<SequenceHeader> {
    check_start_code(data, SEQUENCE_HEADER_CODE, 12)?;

    let mut reader = BitReader::new(&data[4..]);

    let horizontal_size = reader.bits(12)? as u16;
    let vertical_size = reader.bits(12)? as u16;
    let aspect_ratio = AspectRatioCode::from_code(reader.bits(4)? as u8);
    let frame_rate = FrameRateCode(reader.bits(4)? as u8);
    let bit_rate = reader.bits(18)?;
    let _marker = reader.bit()?;
    let vbv_buffer_size = reader.bits(10)? as u16;
    let constrained = reader.flag()?;

    let intra_quantiser_matrix = if reader.flag()? {
        Some(read_matrix(&mut reader)?)
    } else {
        None
    };
    let non_intra_quantiser_matrix = if reader.flag()? {
        Some(read_matrix(&mut reader)?)
    } else {
        None
    };

    Ok(SequenceHeader {
        horizontal_size,
        vertical_size,
        aspect_ratio,
        frame_rate,
        bit_rate,
        vbv_buffer_size,
        constrained,
        intra_quantiser_matrix,
        non_intra_quantiser_matrix,
    })
}

fn read_matrix(reader: &mut BitReader) -> Result<[u8; 64]> {
    let mut matrix = [0u8; 64];
    for entry in &mut matrix {
        *entry = reader.bits(8)? as u8;
    }
    Ok(matrix)
}

/// Parse a sequence extension starting at `00 00 01 B5` with extension
/// identifier 1.
pub fn parse_sequence_extension(data: &[u8]) -> Result<SequenceExtension> {
    check_start_code(data, EXTENSION_START_CODE, 10)?;

    let mut reader = BitReader::new(&data[4..]);

    let ext_id = reader.bits(4)?;
    if ext_id != 1 {
        return Err(Mpeg2Error::InvalidField {
            field: "extension_start_code_identifier",
            value: ext_id,
        });
    }

    let profile_and_level = reader.bits(8)? as u8;
    let progressive = reader.flag()?;
    let chroma_code = reader.bits(2)? as u8;
    let chroma_format = ChromaFormat::from_code(chroma_code).ok_or(Mpeg2Error::InvalidField {
        field: "chroma_format",
        value: u32::from(chroma_code),
    })?;
    let horizontal_size_extension = reader.bits(2)? as u8;
    let vertical_size_extension = reader.bits(2)? as u8;
    let bit_rate_extension = reader.bits(12)? as u16;
    let _marker = reader.bit()?;
    let vbv_buffer_size_extension = reader.bits(8)? as u8;
    let low_delay = reader.flag()?;
    let frame_rate_extension_n = reader.bits(2)? as u8;
    let frame_rate_extension_d = reader.bits(5)? as u8;

    Ok(SequenceExtension {
        profile_and_level,
        progressive,
        chroma_format,
        horizontal_size_extension,
        vertical_size_extension,
        bit_rate_extension,
        vbv_buffer_size_extension,
        low_delay,
        frame_rate_extension_n,
        frame_rate_extension_d,
    })
}

/// Parse a GOP header starting at `00 00 01 B8`.
pub fn parse_gop_header(data: &[u8]) -> Result<GopHeader> {
    check_start_code(data, GOP_START_CODE, 8)?;

    let mut reader = BitReader::new(&data[4..]);

    let drop_frame = reader.flag()?;
    let hours = reader.bits(5)? as u8;
    let minutes = reader.bits(6)? as u8;
    let _marker = reader.bit()?;
    let seconds = reader.bits(6)? as u8;
    let pictures = reader.bits(6)? as u8;
    let closed_gop = reader.flag()?;
    let broken_link = reader.flag()?;

    Ok(GopHeader {
        drop_frame,
        hours,
        minutes,
        seconds,
        pictures,
        closed_gop,
        broken_link,
    })
}

/// Parse a picture header starting at `00 00 01 00`.
pub fn parse_picture_header(data: &[u8]) -> Result<PictureHeader> {
    check_start_code(data, PICTURE_START_CODE, 8)?;

    let mut reader = BitReader::new(&data[4..]);

    let temporal_reference = reader.bits(10)? as u16;
    let type_code = reader.bits(3)? as u8;
    let coding_type = PictureCodingType::from_code(type_code).ok_or(Mpeg2Error::InvalidField {
        field: "picture_coding_type",
        value: u32::from(type_code),
    })?;
    let vbv_delay = reader.bits(16)? as u16;

    Ok(PictureHeader {
        temporal_reference,
        coding_type,
        vbv_delay,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_reader_order() {
        let data = [0b1011_0100, 0b0101_0101];
        let mut reader = BitReader::new(&data);
        assert_eq!(reader.bit().unwrap(), 1);
        assert_eq!(reader.bits(4).unwrap(), 0b0110);
        assert_eq!(reader.bits(3).unwrap(), 0b100);
        assert_eq!(reader.bytes_read(), 1);
        assert_eq!(reader.bits(8).unwrap(), 0b0101_0101);
    }

    #[test]
    fn bit_reader_exhaustion() {
        let data = [0xFF];
        let mut reader = BitReader::new(&data);
        assert!(reader.bits(8).is_ok());
        assert!(reader.bit().is_err());
    }

    #[test]
    fn start_code_scan() {
        assert_eq!(
            find_start_code(&[0x00, 0x00, 0x01, 0xB3]),
            Some((0, 0xB3))
        );
        assert_eq!(
            find_start_code(&[0xFF, 0x00, 0x00, 0x01, 0x00]),
            Some((1, 0x00))
        );
        assert_eq!(find_start_code(&[0x00, 0x00, 0x02, 0xB3]), None);
    }

    #[test]
    fn sequence_header_720x576() {
        let data = [
            0x00, 0x00, 0x01, 0xB3, // start code
            0x2D, 0x02, 0x40, // 720 x 576
            0x23, // aspect 4:3, 25 fps
            0xFF, 0xFF, 0xE0, // bit rate + marker
            0x00, // vbv, flags
        ];
        let seq = parse_sequence_header(&data).unwrap();
        assert_eq!(seq.horizontal_size, 720);
        assert_eq!(seq.vertical_size, 576);
        assert_eq!(seq.aspect_ratio, AspectRatioCode::Display4x3);
        assert_eq!(seq.frame_rate.as_rational(), Some((25, 1)));
        assert!(seq.intra_quantiser_matrix.is_none());
        assert_eq!(seq.byte_size(), 12);
    }

    #[test]
    fn sequence_header_wrong_code() {
        let data = [0x00, 0x00, 0x01, 0xB8, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(
            parse_sequence_header(&data),
            Err(Mpeg2Error::WrongStartCode { expected: 0xB3, .. })
        ));
    }

    #[test]
    fn gop_header_closed() {
        // drop=0 h=1 m=2 marker s=3 pics=4 closed=1 broken=0
        // bits: 0 00001 000010 1 000011 000100 1 0 padding
        let mut bits: u32 = 0;
        bits = (bits << 1) | 0; // drop
        bits = (bits << 5) | 1; // hours
        bits = (bits << 6) | 2; // minutes
        bits = (bits << 1) | 1; // marker
        bits = (bits << 6) | 3; // seconds
        bits = (bits << 6) | 4; // pictures
        bits = (bits << 1) | 1; // closed
        bits = (bits << 1) | 0; // broken
        bits <<= 32 - 27;

        let data = [
            0x00,
            0x00,
            0x01,
            0xB8,
            (bits >> 24) as u8,
            (bits >> 16) as u8,
            (bits >> 8) as u8,
            bits as u8,
        ];
        let gop = parse_gop_header(&data).unwrap();
        assert_eq!(gop.hours, 1);
        assert_eq!(gop.minutes, 2);
        assert_eq!(gop.seconds, 3);
        assert_eq!(gop.pictures, 4);
        assert!(gop.closed_gop);
        assert!(!gop.broken_link);
    }

    #[test]
    fn picture_header_types() {
        // temporal_reference=5, coding type=B(3)
        // bits: 0000000101 011 ...
        let mut bits: u32 = 0;
        bits = (bits << 10) | 5;
        bits = (bits << 3) | 3;
        bits = (bits << 16) | 0xFFFF; // vbv_delay
        bits <<= 32 - 29;

        let data = [
            0x00,
            0x00,
            0x01,
            0x00,
            (bits >> 24) as u8,
            (bits >> 16) as u8,
            (bits >> 8) as u8,
            bits as u8,
        ];
        let pic = parse_picture_header(&data).unwrap();
        assert_eq!(pic.temporal_reference, 5);
        assert_eq!(pic.coding_type, PictureCodingType::B);
    }

    #[test]
    fn sequence_extension_fields() {
        // ext id=1, profile_and_level=0x48 (MP@ML), progressive=1,
        // chroma=01 (4:2:0), size extensions=0, bit rate ext=0, marker=1,
        // vbv ext=0, low_delay=0, frame rate ext n=0 d=0
        let mut bits: u64 = 0;
        bits = (bits << 4) | 1; // identifier
        bits = (bits << 8) | 0x48; // profile and level
        bits = (bits << 1) | 1; // progressive
        bits = (bits << 2) | 1; // chroma 4:2:0
        bits = (bits << 2) | 0; // h ext
        bits = (bits << 2) | 0; // v ext
        bits = (bits << 12) | 0; // bit rate ext
        bits = (bits << 1) | 1; // marker
        bits = (bits << 8) | 0; // vbv ext
        bits = (bits << 1) | 0; // low delay
        bits = (bits << 2) | 0; // fr ext n
        bits = (bits << 5) | 0; // fr ext d

        let data = [
            0x00,
            0x00,
            0x01,
            0xB5,
            (bits >> 40) as u8,
            (bits >> 32) as u8,
            (bits >> 24) as u8,
            (bits >> 16) as u8,
            (bits >> 8) as u8,
            bits as u8,
        ];
        let ext = parse_sequence_extension(&data).unwrap();
        assert_eq!(ext.profile_and_level, 0x48);
        assert!(ext.progressive);
        assert_eq!(ext.chroma_format, ChromaFormat::Yuv420);
        assert!(!ext.low_delay);
    }
}
