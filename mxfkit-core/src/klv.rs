//! KLV triplet and BER length handling
//!
//! A KLV is a 16-byte Universal Label key, a BER-encoded length and a
//! value. BER lengths are one byte for values below 128, otherwise
//! `0x80 | n` followed by `n` big-endian payload bytes (`n` <= 8).

use crate::error::{KlvError, Result};
use crate::ul::UniversalLabel;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Length value written for a KLV that will be patched after its value is
/// streamed out ("fast clip wrap"): 2^56 - 1, the largest value an 8-byte
/// BER encoding can carry
pub const FAST_CLIP_LENGTH: u64 = (1 << 56) - 1;

/// Read a BER length from a byte stream
///
/// Fails with [`KlvError::Truncated`] at end of input and with
/// [`KlvError::OversizeBer`] when the long form claims more than 8 payload
/// bytes.
pub fn read_ber<R: Read + ?Sized>(reader: &mut R) -> Result<u64> {
    let first = read_u8(reader)?;

    if first < 0x80 {
        return Ok(u64::from(first));
    }

    let count = usize::from(first & 0x7F);
    if count > 8 {
        return Err(KlvError::OversizeBer(count));
    }

    let mut value = 0u64;
    for _ in 0..count {
        value = (value << 8) | u64::from(read_u8(reader)?);
    }
    Ok(value)
}

/// Read a BER length from a slice, returning the value and the number of
/// bytes consumed
pub fn read_ber_slice(data: &[u8]) -> Result<(u64, usize)> {
    if data.is_empty() {
        return Err(KlvError::Truncated {
            needed: 1,
            available: 0,
        });
    }

    let first = data[0];
    if first < 0x80 {
        return Ok((u64::from(first), 1));
    }

    let count = usize::from(first & 0x7F);
    if count > 8 {
        return Err(KlvError::OversizeBer(count));
    }
    if data.len() < 1 + count {
        return Err(KlvError::Truncated {
            needed: 1 + count,
            available: data.len(),
        });
    }

    let mut value = 0u64;
    for byte in &data[1..=count] {
        value = (value << 8) | u64::from(*byte);
    }
    Ok((value, 1 + count))
}

/// Write a BER length
///
/// With `size == 0` the shortest valid form is used: a single byte below
/// 128, otherwise the long form with at least three payload bytes
/// (`0x83 xx xx xx`), growing as the value requires. With `size > 0`
/// exactly that many bytes are emitted (1, or 2 to 9); the value must fit
/// or [`KlvError::BerTooShort`] is returned.
///
/// Returns the number of bytes written.
pub fn write_ber<W: Write + ?Sized>(writer: &mut W, value: u64, size: usize) -> Result<usize> {
    if size == 0 {
        if value < 0x80 {
            writer.write_u8(value as u8)?;
            return Ok(1);
        }

        // Shortest long form, but never fewer than three payload bytes
        let mut count = 3;
        while count < 8 && (value >> (count * 8)) != 0 {
            count += 1;
        }
        return write_ber(writer, value, count + 1);
    }

    if size == 1 {
        if value >= 0x80 {
            return Err(KlvError::BerTooShort { value, size });
        }
        writer.write_u8(value as u8)?;
        return Ok(1);
    }

    let count = size - 1;
    if count > 8 || (count < 8 && (value >> (count * 8)) != 0) {
        return Err(KlvError::BerTooShort { value, size });
    }

    writer.write_u8(0x80 | count as u8)?;
    for i in (0..count).rev() {
        writer.write_u8((value >> (i * 8)) as u8)?;
    }
    Ok(size)
}

/// The number of bytes [`write_ber`] will emit for a value and size hint
pub fn ber_length_size(value: u64, size: usize) -> usize {
    if size != 0 {
        return size;
    }
    if value < 0x80 {
        return 1;
    }
    let mut count = 3;
    while count < 8 && (value >> (count * 8)) != 0 {
        count += 1;
    }
    count + 1
}

fn read_u8<R: Read + ?Sized>(reader: &mut R) -> Result<u8> {
    let mut byte = [0u8; 1];
    match reader.read_exact(&mut byte) {
        Ok(()) => Ok(byte[0]),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(KlvError::Truncated {
            needed: 1,
            available: 0,
        }),
        Err(e) => Err(e.into()),
    }
}

/// A KLV triplet held in memory
#[derive(Debug, Clone)]
pub struct Klv {
    /// The key
    pub key: UniversalLabel,
    /// The value bytes
    pub value: Vec<u8>,
    /// Offset of the key within the source, when parsed from one
    pub offset: u64,
}

impl Klv {
    /// Create a new KLV
    pub fn new(key: impl Into<UniversalLabel>, value: Vec<u8>) -> Self {
        Klv {
            key: key.into(),
            value,
            offset: 0,
        }
    }

    /// Total serialised size including key and length encoding
    pub fn total_size(&self) -> usize {
        16 + ber_length_size(self.value.len() as u64, 0) + self.value.len()
    }

    /// Write the triplet, returning the number of bytes written
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<usize> {
        writer.write_all(self.key.as_bytes())?;
        let len_size = write_ber(writer, self.value.len() as u64, 0)?;
        writer.write_all(&self.value)?;
        Ok(16 + len_size + self.value.len())
    }
}

/// Reader that walks KLV triplets in a byte slice
pub struct KlvReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> KlvReader<'a> {
    /// Create a reader over a slice
    pub fn new(data: &'a [u8]) -> Self {
        KlvReader { data, position: 0 }
    }

    /// Current byte position
    pub fn position(&self) -> usize {
        self.position
    }

    /// Move to an absolute position
    pub fn seek(&mut self, position: usize) {
        self.position = position;
    }

    /// Is there room for at least a key?
    pub fn has_more(&self) -> bool {
        self.position + 16 <= self.data.len()
    }

    /// Peek at the next key without consuming anything
    pub fn peek_key(&self) -> Option<UniversalLabel> {
        if !self.has_more() {
            return None;
        }
        let mut key = [0u8; 16];
        key.copy_from_slice(&self.data[self.position..self.position + 16]);
        Some(UniversalLabel(key))
    }

    /// Read the next KLV, or `None` at the end of the data
    pub fn read_klv(&mut self) -> Result<Option<Klv>> {
        let Some(key) = self.peek_key() else {
            return Ok(None);
        };
        let start = self.position as u64;
        self.position += 16;

        let (length, len_size) = read_ber_slice(&self.data[self.position..])?;
        self.position += len_size;

        let length = length as usize;
        if self.position + length > self.data.len() {
            return Err(KlvError::Truncated {
                needed: length,
                available: self.data.len() - self.position,
            });
        }

        let value = self.data[self.position..self.position + length].to_vec();
        self.position += length;

        Ok(Some(Klv {
            key,
            value,
            offset: start,
        }))
    }

    /// Skip the next KLV, returning its key
    pub fn skip_klv(&mut self) -> Result<Option<UniversalLabel>> {
        let Some(key) = self.peek_key() else {
            return Ok(None);
        };
        self.position += 16;

        let (length, len_size) = read_ber_slice(&self.data[self.position..])?;
        self.position += len_size;

        let length = length as usize;
        if self.position + length > self.data.len() {
            return Err(KlvError::Truncated {
                needed: length,
                available: self.data.len() - self.position,
            });
        }
        self.position += length;

        Ok(Some(key))
    }
}

/// Write one local-set item with a 2-byte tag and 2-byte length
pub fn write_local_item<W: Write>(writer: &mut W, tag: u16, value: &[u8]) -> Result<usize> {
    debug_assert!(value.len() <= 0xFFFF);
    writer.write_u16::<BigEndian>(tag)?;
    writer.write_u16::<BigEndian>(value.len() as u16)?;
    writer.write_all(value)?;
    Ok(4 + value.len())
}

/// Iterate the items of a local set body, calling `f(tag, item_bytes)`
///
/// `len_size` selects 2-byte or 4-byte item lengths.
pub fn for_each_local_item<F>(data: &[u8], len_size: usize, mut f: F) -> Result<()>
where
    F: FnMut(u16, &[u8]),
{
    let head = 2 + len_size;
    let mut pos = 0;

    while data.len() - pos > head {
        let tag = (u16::from(data[pos]) << 8) | u16::from(data[pos + 1]);
        let item_len = match len_size {
            2 => usize::from(data[pos + 2]) << 8 | usize::from(data[pos + 3]),
            4 => {
                let mut cursor = &data[pos + 2..pos + 6];
                cursor.read_u32::<BigEndian>()? as usize
            }
            _ => {
                return Err(KlvError::BerTooShort {
                    value: len_size as u64,
                    size: len_size,
                })
            }
        };
        pos += head;

        if pos + item_len > data.len() {
            return Err(KlvError::LocalSetOverrun { tag });
        }

        f(tag, &data[pos..pos + item_len]);
        pos += item_len;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ul::labels;

    #[test]
    fn ber_short_form() {
        let mut buf = Vec::new();
        assert_eq!(write_ber(&mut buf, 100, 0).unwrap(), 1);
        assert_eq!(buf, vec![100]);
        assert_eq!(read_ber_slice(&buf).unwrap(), (100, 1));
    }

    #[test]
    fn ber_long_form_minimum_is_four_bytes() {
        let mut buf = Vec::new();
        assert_eq!(write_ber(&mut buf, 128, 0).unwrap(), 4);
        assert_eq!(buf, vec![0x83, 0x00, 0x00, 0x80]);
        assert_eq!(read_ber_slice(&buf).unwrap(), (128, 4));
    }

    #[test]
    fn ber_fixed_sizes() {
        let mut buf = Vec::new();
        assert_eq!(write_ber(&mut buf, 1000, 3).unwrap(), 3);
        assert_eq!(buf, vec![0x82, 0x03, 0xE8]);

        buf.clear();
        write_ber(&mut buf, FAST_CLIP_LENGTH, 8).unwrap();
        assert_eq!(buf[0], 0x87);
        assert!(buf[1..].iter().all(|&b| b == 0xFF));
        assert_eq!(read_ber_slice(&buf).unwrap().0, FAST_CLIP_LENGTH);
    }

    #[test]
    fn ber_too_short() {
        let mut buf = Vec::new();
        assert!(matches!(
            write_ber(&mut buf, 300, 1),
            Err(KlvError::BerTooShort { .. })
        ));
        assert!(matches!(
            write_ber(&mut buf, 0x1_0000, 3),
            Err(KlvError::BerTooShort { .. })
        ));
    }

    #[test]
    fn ber_oversize_rejected() {
        let data = [0x89, 0, 0, 0, 0, 0, 0, 0, 0, 1];
        assert!(matches!(
            read_ber_slice(&data),
            Err(KlvError::OversizeBer(9))
        ));
    }

    #[test]
    fn ber_truncated() {
        let data = [0x83, 0x00];
        assert!(matches!(
            read_ber_slice(&data),
            Err(KlvError::Truncated { .. })
        ));
    }

    #[test]
    fn klv_round_trip() {
        let klv = Klv::new(labels::KLV_FILL, vec![1, 2, 3, 4]);
        let mut buf = Vec::new();
        let written = klv.write(&mut buf).unwrap();
        assert_eq!(written, 16 + 1 + 4);

        let mut reader = KlvReader::new(&buf);
        let parsed = reader.read_klv().unwrap().unwrap();
        assert_eq!(parsed.key, klv.key);
        assert_eq!(parsed.value, klv.value);
        assert!(reader.read_klv().unwrap().is_none());
    }

    #[test]
    fn klv_skip() {
        let mut buf = Vec::new();
        Klv::new(labels::KLV_FILL, vec![0; 10]).write(&mut buf).unwrap();
        Klv::new(labels::RANDOM_INDEX_PACK, vec![7; 3])
            .write(&mut buf)
            .unwrap();

        let mut reader = KlvReader::new(&buf);
        let key = reader.skip_klv().unwrap().unwrap();
        assert!(key.is_fill_item());
        let next = reader.read_klv().unwrap().unwrap();
        assert_eq!(next.value, vec![7; 3]);
    }

    #[test]
    fn local_items() {
        let mut buf = Vec::new();
        write_local_item(&mut buf, 0x3F05, &[0, 0, 0, 1]).unwrap();
        write_local_item(&mut buf, 0x3F06, &[0, 0, 0, 2]).unwrap();

        let mut seen = Vec::new();
        for_each_local_item(&buf, 2, |tag, bytes| {
            seen.push((tag, bytes.to_vec()));
        })
        .unwrap();

        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, 0x3F05);
        assert_eq!(seen[1].1, vec![0, 0, 0, 2]);
    }

    #[test]
    fn local_item_overrun() {
        // Claims 10 bytes but only 2 follow
        let buf = [0x3F, 0x05, 0x00, 0x0A, 0x01, 0x02];
        assert!(matches!(
            for_each_local_item(&buf, 2, |_, _| {}),
            Err(KlvError::LocalSetOverrun { tag: 0x3F05 })
        ));
    }
}
