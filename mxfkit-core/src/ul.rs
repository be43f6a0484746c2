//! Universal Label (UL) types
//!
//! Universal Labels are the 16-byte SMPTE identifiers used as the key of
//! every KLV in an MXF file. Byte 8 of a UL carries the registry version
//! and is excluded from comparison.

use std::fmt;
use std::hash::{Hash, Hasher};

/// Raw 16-byte Universal Label
pub type UL = [u8; 16];

/// Universal Label wrapper
///
/// Equality and hashing ignore byte 8 (the version byte), as required for
/// matching keys written by different registry versions.
#[derive(Clone, Copy)]
pub struct UniversalLabel(pub UL);

impl UniversalLabel {
    /// Create from raw bytes
    pub const fn new(bytes: UL) -> Self {
        UniversalLabel(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &UL {
        &self.0
    }

    /// Check if this is a SMPTE-registered label (starts with 06 0E 2B 34)
    pub fn is_smpte(&self) -> bool {
        self.0[0..4] == labels::SMPTE_PREFIX
    }

    /// Compare against another label, ignoring the version byte
    pub fn matches(&self, other: &UL) -> bool {
        self.0[0..7] == other[0..7] && self.0[8..] == other[8..]
    }

    /// Compare the leading `len` bytes, still ignoring the version byte
    pub fn matches_prefix(&self, other: &UL, len: usize) -> bool {
        for i in 0..len {
            if i == 7 {
                continue;
            }
            if self.0[i] != other[i] {
                return false;
            }
        }
        true
    }

    /// Check if this is any partition pack key (header, body, footer or
    /// generic stream)
    pub fn is_partition_pack(&self) -> bool {
        self.matches_prefix(&labels::PARTITION_PACK_BASE, 13)
            && ((self.0[13] >= 0x02 && self.0[13] <= 0x04)
                || (self.0[13] == 0x03 && self.0[14] == 0x11))
    }

    /// Check if this is a KLV fill item
    pub fn is_fill_item(&self) -> bool {
        self.matches_prefix(&labels::KLV_FILL, 13)
    }

    /// Check if this is an index table segment key
    pub fn is_index_segment(&self) -> bool {
        self.matches(&labels::INDEX_TABLE_SEGMENT)
    }

    /// Check if this is the random index pack key
    pub fn is_random_index_pack(&self) -> bool {
        self.matches(&labels::RANDOM_INDEX_PACK)
    }

    /// Check if this is a Generic Container essence element key
    pub fn is_gc_essence(&self) -> bool {
        self.matches_prefix(&labels::GC_ESSENCE_PREFIX, 12)
    }

    /// Check if this is a Generic Container system item key
    pub fn is_gc_system(&self) -> bool {
        self.matches_prefix(&labels::GC_SYSTEM_PREFIX, 12)
            && (self.0[12] == 0x04 || self.0[12] == 0x14)
    }

    /// Extract the GC element kind from an essence element key
    pub fn element_kind(&self) -> Option<GcElementKind> {
        if !self.is_gc_essence() && !self.is_gc_system() {
            return None;
        }
        Some(GcElementKind {
            item: self.0[12],
            count: self.0[13],
            element_type: self.0[14],
            number: self.0[15],
        })
    }

    /// Get the GC track number of an essence element key (0 if not one)
    pub fn track_number(&self) -> u32 {
        match self.element_kind() {
            Some(kind) => kind.track_number(),
            None => 0,
        }
    }
}

impl PartialEq for UniversalLabel {
    fn eq(&self, other: &Self) -> bool {
        self.matches(&other.0)
    }
}

impl Eq for UniversalLabel {}

impl Hash for UniversalLabel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Byte 8 is excluded from equality, so it must not feed the hash
        self.0[0..7].hash(state);
        self.0[8..].hash(state);
    }
}

impl fmt::Debug for UniversalLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UL(")?;
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for UniversalLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", labels::lookup_name(self))
    }
}

impl From<UL> for UniversalLabel {
    fn from(bytes: UL) -> Self {
        UniversalLabel(bytes)
    }
}

impl From<&UL> for UniversalLabel {
    fn from(bytes: &UL) -> Self {
        UniversalLabel(*bytes)
    }
}

/// Decomposed bytes 13-16 of a Generic Container element key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcElementKind {
    /// Item type (byte 13): 0x05/0x15 picture, 0x06/0x16 sound,
    /// 0x07/0x17 data, 0x18 compound, 0x04/0x14 system
    pub item: u8,
    /// Element count (byte 14), or scheme ID for system items
    pub count: u8,
    /// Element type (byte 15)
    pub element_type: u8,
    /// Element number (byte 16), or sub ID for system items
    pub number: u8,
}

impl GcElementKind {
    /// Is this a picture element?
    pub fn is_picture(&self) -> bool {
        self.item == 0x05 || self.item == 0x15
    }

    /// Is this a sound element?
    pub fn is_sound(&self) -> bool {
        self.item == 0x06 || self.item == 0x16
    }

    /// Is this a data element?
    pub fn is_data(&self) -> bool {
        self.item == 0x07 || self.item == 0x17
    }

    /// Is this a compound element?
    pub fn is_compound(&self) -> bool {
        self.item == 0x18
    }

    /// Is this element content-package compatible (0x0X rather than 0x1X)?
    pub fn is_cp_compatible(&self) -> bool {
        self.item & 0x10 == 0
    }

    /// The GC track number formed from the four kind bytes
    pub fn track_number(&self) -> u32 {
        (u32::from(self.item) << 24)
            | (u32::from(self.count) << 16)
            | (u32::from(self.element_type) << 8)
            | u32::from(self.number)
    }
}

/// Well-known Universal Labels
pub mod labels {
    use super::{UniversalLabel, UL};

    /// SMPTE label prefix
    pub const SMPTE_PREFIX: [u8; 4] = [0x06, 0x0E, 0x2B, 0x34];

    /// Partition pack base key (bytes 14-16 vary by kind and status)
    pub const PARTITION_PACK_BASE: UL = [
        0x06, 0x0E, 0x2B, 0x34, 0x02, 0x05, 0x01, 0x01, 0x0D, 0x01, 0x02, 0x01, 0x01, 0x00, 0x00,
        0x00,
    ];

    /// KLV fill item
    pub const KLV_FILL: UL = [
        0x06, 0x0E, 0x2B, 0x34, 0x01, 0x01, 0x01, 0x02, 0x03, 0x01, 0x02, 0x10, 0x01, 0x00, 0x00,
        0x00,
    ];

    /// Index table segment (2-byte-length local set)
    pub const INDEX_TABLE_SEGMENT: UL = [
        0x06, 0x0E, 0x2B, 0x34, 0x02, 0x53, 0x01, 0x01, 0x0D, 0x01, 0x02, 0x01, 0x01, 0x10, 0x01,
        0x00,
    ];

    /// Random index pack
    pub const RANDOM_INDEX_PACK: UL = [
        0x06, 0x0E, 0x2B, 0x34, 0x02, 0x05, 0x01, 0x01, 0x0D, 0x01, 0x02, 0x01, 0x01, 0x11, 0x01,
        0x00,
    ];

    /// Primer pack
    pub const PRIMER_PACK: UL = [
        0x06, 0x0E, 0x2B, 0x34, 0x02, 0x05, 0x01, 0x01, 0x0D, 0x01, 0x02, 0x01, 0x01, 0x05, 0x01,
        0x00,
    ];

    /// Generic Container essence element key prefix (bytes 13-16 carry the
    /// item, count, type and number)
    pub const GC_ESSENCE_PREFIX: UL = [
        0x06, 0x0E, 0x2B, 0x34, 0x01, 0x02, 0x01, 0x01, 0x0D, 0x01, 0x03, 0x01, 0x00, 0x00, 0x00,
        0x00,
    ];

    /// Generic Container system item key prefix
    pub const GC_SYSTEM_PREFIX: UL = [
        0x06, 0x0E, 0x2B, 0x34, 0x02, 0x05, 0x01, 0x01, 0x0D, 0x01, 0x03, 0x01, 0x00, 0x00, 0x00,
        0x00,
    ];

    /// Op1a operational pattern
    pub const OP1A: UL = [
        0x06, 0x0E, 0x2B, 0x34, 0x04, 0x01, 0x01, 0x01, 0x0D, 0x01, 0x02, 0x01, 0x01, 0x01, 0x01,
        0x00,
    ];

    /// SMPTE 381M MPEG elementary stream mapping, byte 15 carries the
    /// wrapping kind (0x01 frame, 0x02 clip)
    pub const MPEG_ES_WRAPPING_BASE: UL = [
        0x06, 0x0E, 0x2B, 0x34, 0x04, 0x01, 0x01, 0x02, 0x0D, 0x01, 0x03, 0x01, 0x02, 0x04, 0x60,
        0x01,
    ];

    /// MPEG-2 MP@ML long-GOP picture essence coding
    pub const MPEG2_MP_ML_LONG_GOP: UL = [
        0x06, 0x0E, 0x2B, 0x34, 0x04, 0x01, 0x01, 0x03, 0x04, 0x01, 0x02, 0x02, 0x01, 0x01, 0x11,
        0x00,
    ];

    /// MPEG-2 MP@HL long-GOP picture essence coding
    pub const MPEG2_MP_HL_LONG_GOP: UL = [
        0x06, 0x0E, 0x2B, 0x34, 0x04, 0x01, 0x01, 0x03, 0x04, 0x01, 0x02, 0x02, 0x01, 0x03, 0x03,
        0x00,
    ];

    /// MPEG-2 422P@ML long-GOP picture essence coding
    pub const MPEG2_422P_ML_LONG_GOP: UL = [
        0x06, 0x0E, 0x2B, 0x34, 0x04, 0x01, 0x01, 0x03, 0x04, 0x01, 0x02, 0x02, 0x01, 0x02, 0x03,
        0x00,
    ];

    /// MPEG-2 422P@HL long-GOP picture essence coding
    pub const MPEG2_422P_HL_LONG_GOP: UL = [
        0x06, 0x0E, 0x2B, 0x34, 0x04, 0x01, 0x01, 0x03, 0x04, 0x01, 0x02, 0x02, 0x01, 0x04, 0x03,
        0x00,
    ];

    /// "Multiple essence types in the Generic Container" label
    pub const GC_MULTI: UL = [
        0x06, 0x0E, 0x2B, 0x34, 0x04, 0x01, 0x01, 0x03, 0x0D, 0x01, 0x03, 0x01, 0x02, 0x7F, 0x01,
        0x00,
    ];

    /// Look up a human-readable name for a UL
    pub fn lookup_name(ul: &UniversalLabel) -> &'static str {
        if ul.is_partition_pack() {
            return match (ul.0[13], ul.0[14]) {
                (0x02, 0x01) => "Header Partition (Open Incomplete)",
                (0x02, 0x02) => "Header Partition (Closed Incomplete)",
                (0x02, 0x03) => "Header Partition (Open Complete)",
                (0x02, 0x04) => "Header Partition (Closed Complete)",
                (0x03, 0x11) => "Generic Stream Partition",
                (0x03, _) => "Body Partition",
                (0x04, _) => "Footer Partition",
                _ => "Partition Pack",
            };
        }
        if ul.matches(&PRIMER_PACK) {
            return "Primer Pack";
        }
        if ul.is_fill_item() {
            return "KLV Fill";
        }
        if ul.is_index_segment() {
            return "Index Table Segment";
        }
        if ul.is_random_index_pack() {
            return "Random Index Pack";
        }
        if ul.is_gc_system() {
            return "System Item";
        }
        if ul.is_gc_essence() {
            return "Essence Element";
        }
        if ul.is_smpte() && ul.0[4] == 0x02 {
            return "Metadata Set";
        }
        "Unknown"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_byte_ignored() {
        let mut a = labels::KLV_FILL;
        let mut b = labels::KLV_FILL;
        a[7] = 0x01;
        b[7] = 0x02;
        assert_eq!(UniversalLabel(a), UniversalLabel(b));
    }

    #[test]
    fn partition_pack_detection() {
        let mut key = labels::PARTITION_PACK_BASE;
        key[13] = 0x02;
        key[14] = 0x04;
        assert!(UniversalLabel(key).is_partition_pack());

        key[13] = 0x05; // primer, not a partition
        assert!(!UniversalLabel(key).is_partition_pack());

        key[13] = 0x03;
        key[14] = 0x11; // generic stream partition
        assert!(UniversalLabel(key).is_partition_pack());
    }

    #[test]
    fn element_kind_from_key() {
        let mut key = labels::GC_ESSENCE_PREFIX;
        key[12] = 0x15;
        key[13] = 0x01;
        key[14] = 0x05;
        key[15] = 0x01;
        let kind = UniversalLabel(key).element_kind().unwrap();
        assert!(kind.is_picture());
        assert!(!kind.is_cp_compatible());
        assert_eq!(kind.track_number(), 0x1501_0501);
    }

    #[test]
    fn fill_is_not_essence() {
        let fill = UniversalLabel(labels::KLV_FILL);
        assert!(fill.is_fill_item());
        assert!(fill.element_kind().is_none());
        assert_eq!(fill.track_number(), 0);
    }

    #[test]
    fn name_lookup() {
        assert_eq!(
            labels::lookup_name(&UniversalLabel(labels::INDEX_TABLE_SEGMENT)),
            "Index Table Segment"
        );
        assert_eq!(
            labels::lookup_name(&UniversalLabel(labels::RANDOM_INDEX_PACK)),
            "Random Index Pack"
        );
    }
}
