//! Structures parsed from MPEG-2 video elementary streams.

/// Picture coding type from a picture header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PictureCodingType {
    /// Intra-coded
    I,
    /// Forward predicted
    P,
    /// Bidirectionally predicted
    B,
    /// DC intra-coded (MPEG-1 only)
    D,
}

impl PictureCodingType {
    /// Map the 3-bit picture_coding_type field.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(PictureCodingType::I),
            2 => Some(PictureCodingType::P),
            3 => Some(PictureCodingType::B),
            4 => Some(PictureCodingType::D),
            _ => None,
        }
    }

    /// Is this an anchor (I or P) picture?
    pub fn is_anchor(&self) -> bool {
        matches!(self, PictureCodingType::I | PictureCodingType::P)
    }
}

/// Aspect ratio information code from a sequence header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AspectRatioCode {
    /// Square samples
    Square,
    /// 4:3 display
    Display4x3,
    /// 16:9 display
    Display16x9,
    /// 2.21:1 display
    Display221x100,
    /// Reserved or forbidden code
    Reserved(u8),
}

impl AspectRatioCode {
    /// Map the 4-bit aspect_ratio_information field.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => AspectRatioCode::Square,
            2 => AspectRatioCode::Display4x3,
            3 => AspectRatioCode::Display16x9,
            4 => AspectRatioCode::Display221x100,
            other => AspectRatioCode::Reserved(other),
        }
    }

    /// The display aspect ratio as a (numerator, denominator) pair, if the
    /// code names one.
    pub fn as_ratio(&self) -> Option<(i32, i32)> {
        match self {
            AspectRatioCode::Square => Some((1, 1)),
            AspectRatioCode::Display4x3 => Some((4, 3)),
            AspectRatioCode::Display16x9 => Some((16, 9)),
            AspectRatioCode::Display221x100 => Some((221, 100)),
            AspectRatioCode::Reserved(_) => None,
        }
    }
}

/// Frame rate code from a sequence header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRateCode(pub u8);

impl FrameRateCode {
    /// The frame rate as an exact rational (numerator, denominator), or
    /// `None` for reserved codes.
    ///
    /// Codes 1-8 map to 24000/1001, 24, 25, 30000/1001, 30, 50,
    /// 60000/1001 and 60.
    pub fn as_rational(&self) -> Option<(i32, i32)> {
        match self.0 {
            1 => Some((24000, 1001)),
            2 => Some((24, 1)),
            3 => Some((25, 1)),
            4 => Some((30000, 1001)),
            5 => Some((30, 1)),
            6 => Some((50, 1)),
            7 => Some((60000, 1001)),
            8 => Some((60, 1)),
            _ => None,
        }
    }

    /// Is this one of the NTSC-family rates (n*1000/1001)?
    pub fn is_drop_frame(&self) -> bool {
        matches!(self.0, 1 | 4 | 7)
    }
}

/// Chroma subsampling format from a sequence extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChromaFormat {
    /// 4:2:0
    Yuv420,
    /// 4:2:2
    Yuv422,
    /// 4:4:4
    Yuv444,
}

impl ChromaFormat {
    /// Map the 2-bit chroma_format field.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ChromaFormat::Yuv420),
            2 => Some(ChromaFormat::Yuv422),
            3 => Some(ChromaFormat::Yuv444),
            _ => None,
        }
    }

    /// Horizontal and vertical subsampling factors.
    pub fn subsampling(&self) -> (u32, u32) {
        match self {
            ChromaFormat::Yuv420 => (2, 2),
            ChromaFormat::Yuv422 => (2, 1),
            ChromaFormat::Yuv444 => (1, 1),
        }
    }
}

/// An MPEG-1/MPEG-2 sequence header.
#[derive(Debug, Clone)]
pub struct SequenceHeader {
    /// horizontal_size_value (low 12 bits of the width)
    pub horizontal_size: u16,
    /// vertical_size_value (low 12 bits of the height)
    pub vertical_size: u16,
    /// Aspect ratio information
    pub aspect_ratio: AspectRatioCode,
    /// Frame rate code
    pub frame_rate: FrameRateCode,
    /// bit_rate_value in 400 bit/s units (0x3FFFF means unknown)
    pub bit_rate: u32,
    /// vbv_buffer_size_value
    pub vbv_buffer_size: u16,
    /// constrained_parameters_flag
    pub constrained: bool,
    /// Intra quantiser matrix, when present
    pub intra_quantiser_matrix: Option<[u8; 64]>,
    /// Non-intra quantiser matrix, when present
    pub non_intra_quantiser_matrix: Option<[u8; 64]>,
}

impl SequenceHeader {
    /// Bytes this header occupies in the stream, including the start code.
    pub fn byte_size(&self) -> usize {
        let mut size = 12;
        if self.intra_quantiser_matrix.is_some() {
            size += 64;
        }
        if self.non_intra_quantiser_matrix.is_some() {
            size += 64;
        }
        size
    }
}

/// An MPEG-2 sequence extension.
#[derive(Debug, Clone)]
pub struct SequenceExtension {
    /// profile_and_level_indication
    pub profile_and_level: u8,
    /// progressive_sequence flag
    pub progressive: bool,
    /// Chroma format
    pub chroma_format: ChromaFormat,
    /// horizontal_size_extension (top 2 bits of the width)
    pub horizontal_size_extension: u8,
    /// vertical_size_extension (top 2 bits of the height)
    pub vertical_size_extension: u8,
    /// bit_rate_extension (top 12 bits of the bit rate)
    pub bit_rate_extension: u16,
    /// vbv_buffer_size_extension
    pub vbv_buffer_size_extension: u8,
    /// low_delay flag
    pub low_delay: bool,
    /// frame_rate_extension_n
    pub frame_rate_extension_n: u8,
    /// frame_rate_extension_d
    pub frame_rate_extension_d: u8,
}

/// A group-of-pictures header.
#[derive(Debug, Clone, Copy)]
pub struct GopHeader {
    /// Timecode drop-frame flag
    pub drop_frame: bool,
    /// Timecode hours
    pub hours: u8,
    /// Timecode minutes
    pub minutes: u8,
    /// Timecode seconds
    pub seconds: u8,
    /// Timecode pictures
    pub pictures: u8,
    /// closed_gop flag
    pub closed_gop: bool,
    /// broken_link flag
    pub broken_link: bool,
}

impl GopHeader {
    /// Convert the GOP timecode to a frame count at the given integer
    /// frame rate, applying NTSC drop-frame adjustment when flagged.
    pub fn timecode_frames(&self, frame_rate: u32) -> i64 {
        let h = i64::from(self.hours);
        let m = i64::from(self.minutes);
        let s = i64::from(self.seconds);
        let f = i64::from(self.pictures);
        let rate = i64::from(frame_rate);

        let total_minutes = h * 60 + m;
        let mut frames = (total_minutes * 60 + s) * rate + f;

        if self.drop_frame {
            // Two frames dropped per minute except every tenth minute
            frames -= 2 * (total_minutes - total_minutes / 10);
        }

        frames
    }
}

/// A picture header.
#[derive(Debug, Clone, Copy)]
pub struct PictureHeader {
    /// temporal_reference (display order within the GOP)
    pub temporal_reference: u16,
    /// Picture coding type
    pub coding_type: PictureCodingType,
    /// vbv_delay
    pub vbv_delay: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rate_codes() {
        assert_eq!(FrameRateCode(3).as_rational(), Some((25, 1)));
        assert_eq!(FrameRateCode(6).as_rational(), Some((50, 1)));
        assert_eq!(FrameRateCode(4).as_rational(), Some((30000, 1001)));
        assert_eq!(FrameRateCode(0).as_rational(), None);
        assert!(FrameRateCode(1).is_drop_frame());
        assert!(!FrameRateCode(3).is_drop_frame());
    }

    #[test]
    fn picture_coding_types() {
        assert_eq!(PictureCodingType::from_code(1), Some(PictureCodingType::I));
        assert_eq!(PictureCodingType::from_code(3), Some(PictureCodingType::B));
        assert_eq!(PictureCodingType::from_code(0), None);
        assert!(PictureCodingType::P.is_anchor());
        assert!(!PictureCodingType::B.is_anchor());
    }

    #[test]
    fn chroma_subsampling() {
        assert_eq!(ChromaFormat::Yuv420.subsampling(), (2, 2));
        assert_eq!(ChromaFormat::Yuv422.subsampling(), (2, 1));
        assert_eq!(ChromaFormat::from_code(0), None);
    }

    #[test]
    fn gop_timecode_drop_frame() {
        let gop = GopHeader {
            drop_frame: false,
            hours: 0,
            minutes: 1,
            seconds: 0,
            pictures: 0,
            closed_gop: true,
            broken_link: false,
        };
        assert_eq!(gop.timecode_frames(25), 1500);

        let gop = GopHeader { drop_frame: true, ..gop };
        // One minute at 30fps drop-frame: 1800 - 2
        assert_eq!(gop.timecode_frames(30), 1798);
    }

    #[test]
    fn aspect_ratios() {
        assert_eq!(AspectRatioCode::from_code(2).as_ratio(), Some((4, 3)));
        assert_eq!(AspectRatioCode::from_code(9).as_ratio(), None);
    }
}
