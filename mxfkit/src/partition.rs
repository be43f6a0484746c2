//! MXF partition packs and the random index pack
//!
//! An MXF file is a sequence of partitions: a header partition, optional
//! body partitions and (usually) a footer partition, each introduced by a
//! partition pack KLV. A run-in of up to 64 KiB of arbitrary bytes may
//! precede the header partition.

use crate::error::{MxfError, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use mxfkit_core::{klv, ul::labels, UniversalLabel, UL};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};

/// Largest permitted run-in before the header partition pack
pub const MAX_RUN_IN: u64 = 64 * 1024;

/// Partition kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    /// Header partition (first in the file)
    Header,
    /// Body partition
    Body,
    /// Footer partition (last, no essence)
    Footer,
    /// Generic stream partition (SMPTE 410M)
    GenericStream,
}

/// Partition status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStatus {
    /// Metadata may still change
    Open,
    /// Metadata is final
    Closed,
}

/// Partition completeness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionCompleteness {
    /// Some metadata is missing or provisional
    Incomplete,
    /// All metadata present
    Complete,
}

/// An MXF partition pack
#[derive(Debug, Clone)]
pub struct PartitionPack {
    /// Partition kind
    pub kind: PartitionKind,
    /// Open or closed
    pub status: PartitionStatus,
    /// Complete or incomplete
    pub completeness: PartitionCompleteness,
    /// Major version (1)
    pub major_version: u16,
    /// Minor version (2 or 3)
    pub minor_version: u16,
    /// KLV alignment grid size
    pub kag_size: u32,
    /// Offset of this partition from the start of the file (after run-in)
    pub this_partition: u64,
    /// Offset of the previous partition
    pub previous_partition: u64,
    /// Offset of the footer partition (0 if not yet known)
    pub footer_partition: u64,
    /// Byte count of header metadata following the pack
    pub header_byte_count: u64,
    /// Byte count of index table segments in this partition
    pub index_byte_count: u64,
    /// IndexSID of index data in this partition (0 if none)
    pub index_sid: u32,
    /// Byte offset of the essence in this partition within its container
    pub body_offset: u64,
    /// BodySID of essence in this partition (0 if none)
    pub body_sid: u32,
    /// Operational pattern label
    pub operational_pattern: UL,
    /// Essence container labels used in the file
    pub essence_containers: Vec<UL>,
}

impl Default for PartitionPack {
    fn default() -> Self {
        PartitionPack {
            kind: PartitionKind::Header,
            status: PartitionStatus::Closed,
            completeness: PartitionCompleteness::Complete,
            major_version: 1,
            minor_version: 3,
            kag_size: 1,
            this_partition: 0,
            previous_partition: 0,
            footer_partition: 0,
            header_byte_count: 0,
            index_byte_count: 0,
            index_sid: 0,
            body_offset: 0,
            body_sid: 0,
            operational_pattern: labels::OP1A,
            essence_containers: Vec::new(),
        }
    }
}

impl PartitionPack {
    /// Create a header partition pack
    pub fn header() -> Self {
        PartitionPack::default()
    }

    /// Create a body partition pack
    pub fn body() -> Self {
        PartitionPack {
            kind: PartitionKind::Body,
            ..Default::default()
        }
    }

    /// Create a footer partition pack
    pub fn footer() -> Self {
        PartitionPack {
            kind: PartitionKind::Footer,
            ..Default::default()
        }
    }

    /// The pack key for this partition's kind and status
    pub fn pack_ul(&self) -> UL {
        let mut key = labels::PARTITION_PACK_BASE;
        key[7] = 0x01;

        let status_byte = match (self.status, self.completeness) {
            (PartitionStatus::Open, PartitionCompleteness::Incomplete) => 0x01,
            (PartitionStatus::Closed, PartitionCompleteness::Incomplete) => 0x02,
            (PartitionStatus::Open, PartitionCompleteness::Complete) => 0x03,
            (PartitionStatus::Closed, PartitionCompleteness::Complete) => 0x04,
        };

        match self.kind {
            PartitionKind::Header => {
                key[13] = 0x02;
                key[14] = status_byte;
            }
            PartitionKind::Body => {
                key[13] = 0x03;
                key[14] = status_byte;
            }
            PartitionKind::Footer => {
                key[13] = 0x04;
                // A footer is always closed
                key[14] = match self.completeness {
                    PartitionCompleteness::Incomplete => 0x02,
                    PartitionCompleteness::Complete => 0x04,
                };
            }
            PartitionKind::GenericStream => {
                key[13] = 0x03;
                key[14] = 0x11;
            }
        }
        key
    }

    /// Parse a partition pack from a complete KLV (key included)
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 88 {
            return Err(MxfError::InvalidStructure(format!(
                "partition pack of {} bytes is too short",
                data.len()
            )));
        }

        let mut key = [0u8; 16];
        key.copy_from_slice(&data[0..16]);
        let key = UniversalLabel(key);
        if !key.is_partition_pack() {
            return Err(MxfError::InvalidStructure(
                "not a partition pack key".into(),
            ));
        }

        let (kind, status, completeness) = decode_pack_kind(key.as_bytes())?;

        let (value_len, len_size) = klv::read_ber_slice(&data[16..])?;
        let value_start = 16 + len_size;
        if data.len() < value_start + value_len as usize {
            return Err(MxfError::Klv(mxfkit_core::KlvError::Truncated {
                needed: value_len as usize,
                available: data.len() - value_start,
            }));
        }

        let mut cursor = Cursor::new(&data[value_start..value_start + value_len as usize]);

        let major_version = cursor.read_u16::<BigEndian>()?;
        let minor_version = cursor.read_u16::<BigEndian>()?;
        let kag_size = cursor.read_u32::<BigEndian>()?;
        let this_partition = cursor.read_u64::<BigEndian>()?;
        let previous_partition = cursor.read_u64::<BigEndian>()?;
        let footer_partition = cursor.read_u64::<BigEndian>()?;
        let header_byte_count = cursor.read_u64::<BigEndian>()?;
        let index_byte_count = cursor.read_u64::<BigEndian>()?;
        let index_sid = cursor.read_u32::<BigEndian>()?;
        let body_offset = cursor.read_u64::<BigEndian>()?;
        let body_sid = cursor.read_u32::<BigEndian>()?;

        let mut operational_pattern = [0u8; 16];
        cursor.read_exact(&mut operational_pattern)?;

        let batch_count = cursor.read_u32::<BigEndian>()?;
        let batch_item_size = cursor.read_u32::<BigEndian>()?;

        let mut essence_containers = Vec::new();
        for _ in 0..batch_count {
            if batch_item_size == 16 {
                let mut label = [0u8; 16];
                cursor.read_exact(&mut label)?;
                essence_containers.push(label);
            } else {
                cursor.seek(SeekFrom::Current(i64::from(batch_item_size)))?;
            }
        }

        Ok(PartitionPack {
            kind,
            status,
            completeness,
            major_version,
            minor_version,
            kag_size,
            this_partition,
            previous_partition,
            footer_partition,
            header_byte_count,
            index_byte_count,
            index_sid,
            body_offset,
            body_sid,
            operational_pattern,
            essence_containers,
        })
    }

    /// Write the partition pack, returning the number of bytes written
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<usize> {
        writer.write_all(&self.pack_ul())?;

        let value_size = self.value_size();
        let len_size = klv::write_ber(writer, value_size as u64, 0)?;

        writer.write_u16::<BigEndian>(self.major_version)?;
        writer.write_u16::<BigEndian>(self.minor_version)?;
        writer.write_u32::<BigEndian>(self.kag_size)?;
        writer.write_u64::<BigEndian>(self.this_partition)?;
        writer.write_u64::<BigEndian>(self.previous_partition)?;
        writer.write_u64::<BigEndian>(self.footer_partition)?;
        writer.write_u64::<BigEndian>(self.header_byte_count)?;
        writer.write_u64::<BigEndian>(self.index_byte_count)?;
        writer.write_u32::<BigEndian>(self.index_sid)?;
        writer.write_u64::<BigEndian>(self.body_offset)?;
        writer.write_u32::<BigEndian>(self.body_sid)?;
        writer.write_all(&self.operational_pattern)?;

        writer.write_u32::<BigEndian>(self.essence_containers.len() as u32)?;
        writer.write_u32::<BigEndian>(16)?;
        for label in &self.essence_containers {
            writer.write_all(label)?;
        }

        Ok(16 + len_size + value_size)
    }

    /// Serialised size of the value portion
    fn value_size(&self) -> usize {
        88 + self.essence_containers.len() * 16
    }

    /// Total serialised size including key and length
    pub fn size(&self) -> usize {
        let value = self.value_size();
        16 + klv::ber_length_size(value as u64, 0) + value
    }

    /// Record an essence container label if not already present
    pub fn add_essence_container(&mut self, label: UL) {
        let label = UniversalLabel(label);
        if !self
            .essence_containers
            .iter()
            .any(|l| UniversalLabel(*l) == label)
        {
            self.essence_containers.push(label.0);
        }
    }
}

/// Decode kind/status/completeness from a partition pack key
fn decode_pack_kind(
    key: &UL,
) -> Result<(PartitionKind, PartitionStatus, PartitionCompleteness)> {
    if key[13] == 0x03 && key[14] == 0x11 {
        return Ok((
            PartitionKind::GenericStream,
            PartitionStatus::Closed,
            PartitionCompleteness::Complete,
        ));
    }

    let kind = match key[13] {
        0x02 => PartitionKind::Header,
        0x03 => PartitionKind::Body,
        0x04 => PartitionKind::Footer,
        other => {
            return Err(MxfError::InvalidStructure(format!(
                "unknown partition kind byte {:#04x}",
                other
            )))
        }
    };

    let status = match key[14] {
        0x01 | 0x03 => PartitionStatus::Open,
        _ => PartitionStatus::Closed,
    };
    let completeness = match key[14] {
        0x01 | 0x02 => PartitionCompleteness::Incomplete,
        _ => PartitionCompleteness::Complete,
    };

    Ok((kind, status, completeness))
}

/// Locate the first partition pack, skipping any run-in
///
/// Scans up to [`MAX_RUN_IN`] bytes for a partition pack key and leaves the
/// reader positioned at its first byte. Returns the key's offset.
pub fn locate_first_partition<R: Read + Seek>(reader: &mut R) -> Result<u64> {
    reader.seek(SeekFrom::Start(0))?;

    let mut buffer = Vec::with_capacity((MAX_RUN_IN + 16) as usize);
    reader
        .by_ref()
        .take(MAX_RUN_IN + 16)
        .read_to_end(&mut buffer)?;

    let limit = buffer.len().saturating_sub(16);
    for offset in 0..=limit {
        let mut key = [0u8; 16];
        if offset + 16 > buffer.len() {
            break;
        }
        key.copy_from_slice(&buffer[offset..offset + 16]);
        if UniversalLabel(key).is_partition_pack() {
            reader.seek(SeekFrom::Start(offset as u64))?;
            return Ok(offset as u64);
        }
    }

    Err(MxfError::InvalidStructure(
        "no partition pack found within the maximum run-in".into(),
    ))
}

/// One entry of a random index pack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RipEntry {
    /// BodySID of the partition (0 for header and footer)
    pub body_sid: u32,
    /// Byte offset of the partition pack
    pub byte_offset: u64,
}

/// The Random Index Pack: the last KLV in a file, listing every partition
#[derive(Debug, Clone, Default)]
pub struct RandomIndexPack {
    /// Partition entries in file order
    pub entries: Vec<RipEntry>,
}

impl RandomIndexPack {
    /// Create an empty RIP
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a partition entry
    pub fn add_entry(&mut self, body_sid: u32, byte_offset: u64) {
        self.entries.push(RipEntry {
            body_sid,
            byte_offset,
        });
    }

    /// Parse from the value bytes of a RIP KLV
    pub fn parse(value: &[u8]) -> Result<Self> {
        if value.len() < 4 || (value.len() - 4) % 12 != 0 {
            return Err(MxfError::InvalidStructure(format!(
                "random index pack value of {} bytes is malformed",
                value.len()
            )));
        }

        let mut entries = Vec::with_capacity((value.len() - 4) / 12);
        let mut cursor = Cursor::new(&value[..value.len() - 4]);
        while (cursor.position() as usize) < value.len() - 4 {
            let body_sid = cursor.read_u32::<BigEndian>()?;
            let byte_offset = cursor.read_u64::<BigEndian>()?;
            entries.push(RipEntry {
                body_sid,
                byte_offset,
            });
        }

        Ok(RandomIndexPack { entries })
    }

    /// Write the complete RIP KLV, returning the number of bytes written
    ///
    /// The final 4 bytes of the value carry the overall KLV length so a
    /// reader can find the pack from the end of the file.
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<usize> {
        let value_size = self.entries.len() * 12 + 4;
        let len_size = klv::ber_length_size(value_size as u64, 0);
        let overall = 16 + len_size + value_size;

        writer.write_all(&labels::RANDOM_INDEX_PACK)?;
        klv::write_ber(writer, value_size as u64, 0)?;
        for entry in &self.entries {
            writer.write_u32::<BigEndian>(entry.body_sid)?;
            writer.write_u64::<BigEndian>(entry.byte_offset)?;
        }
        writer.write_u32::<BigEndian>(overall as u32)?;

        Ok(overall)
    }
}
