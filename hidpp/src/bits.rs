//! A dense, bit-addressable buffer.
//!
//! Bits are numbered from the most significant bit of the first byte, so
//! bit `0` is `0x80` of byte `0` and bit `8` is `0x80` of byte `1`. All integer
//! reads and writes are big-endian; little-endian fields are handled by the
//! codec reversing the byte window, never by a separate read primitive.

use std::fmt;

use thiserror::Error;

/// The widest integer [`BitBuffer::read`] and [`BitBuffer::write`] can handle.
pub const MAX_INT_BITS: usize = 64;

/// A growable sequence of bits backed by byte-aligned storage.
///
/// The trailing bits of the last storage byte beyond [`Self::len`] are always
/// kept at zero.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct BitBuffer {
    bytes: Vec<u8>,
    len: usize,
}

impl BitBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a buffer of `len` zero bits.
    pub fn zeroed(len: usize) -> Self {
        Self {
            bytes: vec![0; len.div_ceil(8)],
            len,
        }
    }

    /// Wraps whole bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
            len: bytes.len() * 8,
        }
    }

    /// Parses a hex string such as `"3DB8F396"`. Whitespace is ignored.
    pub fn from_hex(src: &str) -> Result<Self, BitsError> {
        let compact = src.split_whitespace().collect::<String>();
        Ok(Self::from_bytes(&hex::decode(compact)?))
    }

    /// Builds a buffer of `len` bits holding `value`, big-endian.
    pub fn from_uint(value: u64, len: usize) -> Result<Self, BitsError> {
        let mut buf = Self::zeroed(len);
        buf.write(0, len, value)?;
        Ok(buf)
    }

    /// The amount of bits in the buffer.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the length is a whole number of bytes.
    pub fn is_byte_aligned(&self) -> bool {
        self.len % 8 == 0
    }

    fn check_range(&self, offset: usize, length: usize) -> Result<(), BitsError> {
        if offset.checked_add(length).is_none_or(|end| end > self.len) {
            return Err(BitsError::OutOfRange {
                offset,
                length,
                available: self.len,
            });
        }
        Ok(())
    }

    /// Reads a single bit.
    pub fn bit(&self, index: usize) -> Result<bool, BitsError> {
        self.check_range(index, 1)?;
        Ok(self.bytes[index / 8] & (0x80 >> (index % 8)) != 0)
    }

    /// Sets or clears a single bit.
    pub fn set_bit(&mut self, index: usize, value: bool) -> Result<(), BitsError> {
        self.check_range(index, 1)?;
        let mask = 0x80 >> (index % 8);
        if value {
            self.bytes[index / 8] |= mask;
        } else {
            self.bytes[index / 8] &= !mask;
        }
        Ok(())
    }

    /// Reads `length` bits starting at `offset` as a big-endian integer.
    pub fn read(&self, offset: usize, length: usize) -> Result<u64, BitsError> {
        if length > MAX_INT_BITS {
            return Err(BitsError::TooWide(length));
        }
        self.check_range(offset, length)?;

        let mut value = 0u64;
        for i in offset..offset + length {
            value = (value << 1) | u64::from(self.bytes[i / 8] >> (7 - i % 8) & 1);
        }
        Ok(value)
    }

    /// Writes `value` into `length` bits starting at `offset`, big-endian.
    ///
    /// Fails with [`BitsError::ValueTooLarge`] if `value` needs more than
    /// `length` bits.
    pub fn write(&mut self, offset: usize, length: usize, value: u64) -> Result<(), BitsError> {
        if length > MAX_INT_BITS {
            return Err(BitsError::TooWide(length));
        }
        if length < MAX_INT_BITS && value >> length != 0 {
            return Err(BitsError::ValueTooLarge { value, length });
        }
        self.check_range(offset, length)?;

        for (n, i) in (offset..offset + length).enumerate() {
            let bit = value >> (length - 1 - n) & 1 == 1;
            let mask = 0x80 >> (i % 8);
            if bit {
                self.bytes[i / 8] |= mask;
            } else {
                self.bytes[i / 8] &= !mask;
            }
        }
        Ok(())
    }

    /// Copies `length` bits starting at `offset` into a new buffer.
    pub fn slice(&self, offset: usize, length: usize) -> Result<Self, BitsError> {
        self.check_range(offset, length)?;

        if offset % 8 == 0 {
            let mut out = Self::from_bytes(&self.bytes[offset / 8..(offset + length).div_ceil(8)]);
            out.truncate(length);
            return Ok(out);
        }

        let mut out = Self::zeroed(length);
        for n in 0..length {
            if self.bytes[(offset + n) / 8] & (0x80 >> ((offset + n) % 8)) != 0 {
                out.bytes[n / 8] |= 0x80 >> (n % 8);
            }
        }
        Ok(out)
    }

    /// Like [`Self::slice`], but clamps the window to the end of the buffer
    /// instead of failing.
    pub fn slice_lenient(&self, offset: usize, length: usize) -> Self {
        let available = self.len.saturating_sub(offset);
        self.slice(offset.min(self.len), length.min(available))
            .unwrap_or_default()
    }

    /// Shortens the buffer to `len` bits. Does nothing if it is already
    /// shorter.
    pub fn truncate(&mut self, len: usize) {
        if len >= self.len {
            return;
        }
        self.len = len;
        self.bytes.truncate(len.div_ceil(8));
        if len % 8 != 0 {
            if let Some(last) = self.bytes.last_mut() {
                *last &= 0xff << (8 - len % 8);
            }
        }
    }

    /// Appends the bits of `other`.
    pub fn append(&mut self, other: &BitBuffer) {
        if self.is_byte_aligned() {
            self.bytes.extend_from_slice(&other.bytes);
            self.len += other.len;
            return;
        }

        let start = self.len;
        self.len += other.len;
        self.bytes.resize(self.len.div_ceil(8), 0);
        for n in 0..other.len {
            if other.bytes[n / 8] & (0x80 >> (n % 8)) != 0 {
                let i = start + n;
                self.bytes[i / 8] |= 0x80 >> (i % 8);
            }
        }
    }

    /// Concatenates several buffers into one.
    pub fn concat<'a>(parts: impl IntoIterator<Item = &'a BitBuffer>) -> Self {
        let mut out = Self::new();
        for part in parts {
            out.append(part);
        }
        out
    }

    /// Returns a copy where the bit order inside every byte is mirrored, so
    /// `0x01` becomes `0x80`.
    ///
    /// Only defined for byte-aligned buffers, since mirroring a trailing
    /// partial byte would move its padding into the live bits.
    pub fn reverse_bits_per_byte(&self) -> Result<Self, BitsError> {
        if !self.is_byte_aligned() {
            return Err(BitsError::NotByteAligned(self.len));
        }
        Ok(Self {
            bytes: self.bytes.iter().map(|byte| byte.reverse_bits()).collect(),
            len: self.len,
        })
    }

    /// Returns a copy with the byte order reversed.
    ///
    /// Only defined for byte-aligned buffers.
    pub fn reverse_bytes(&self) -> Result<Self, BitsError> {
        if !self.is_byte_aligned() {
            return Err(BitsError::NotByteAligned(self.len));
        }
        let mut bytes = self.bytes.clone();
        bytes.reverse();
        Ok(Self {
            bytes,
            len: self.len,
        })
    }

    /// Left-pads with zero bits up to `target` bits.
    pub fn pad_left(&self, target: usize) -> Self {
        if target <= self.len {
            return self.clone();
        }
        let mut out = Self::zeroed(target - self.len);
        out.append(self);
        out
    }

    /// Right-pads with zero bits up to `target` bits.
    pub fn pad_right(&self, target: usize) -> Self {
        if target <= self.len {
            return self.clone();
        }
        let mut out = self.clone();
        out.append(&Self::zeroed(target - self.len));
        out
    }

    /// The storage bytes. A partial trailing byte is zero-padded.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Renders the buffer as upper-case hex.
    pub fn to_hex(&self) -> String {
        hex::encode_upper(&self.bytes)
    }

    /// Renders the buffer as ASCII, replacing non-printable bytes with `.`.
    pub fn to_ascii(&self) -> String {
        self.bytes
            .iter()
            .map(|&byte| {
                if byte.is_ascii_graphic() || byte == b' ' {
                    byte as char
                } else {
                    '.'
                }
            })
            .collect()
    }

    /// Iterates over the indices of all set bits.
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|&i| self.bytes[i / 8] & (0x80 >> (i % 8)) != 0)
    }
}

impl fmt::Debug for BitBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BitBuffer({} bits: {})", self.len, self.to_hex())
    }
}

impl fmt::Display for BitBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<&[u8]> for BitBuffer {
    fn from(bytes: &[u8]) -> Self {
        Self::from_bytes(bytes)
    }
}

impl From<Vec<u8>> for BitBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        let len = bytes.len() * 8;
        Self { bytes, len }
    }
}

/// Represents an error raised by a [`BitBuffer`] operation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BitsError {
    /// The requested window reaches past the end of the buffer.
    #[error("bits {offset}..{} are out of range for a buffer of {available} bits", offset + length)]
    OutOfRange {
        offset: usize,
        length: usize,
        available: usize,
    },

    /// An integer access wider than [`MAX_INT_BITS`] was requested.
    #[error("integer accesses are limited to 64 bits, got {0}")]
    TooWide(usize),

    /// The value does not fit into the requested width.
    #[error("value {value:#x} does not fit into {length} bits")]
    ValueTooLarge { value: u64, length: usize },

    /// The operation requires a whole number of bytes.
    #[error("buffer of {0} bits is not byte aligned")]
    NotByteAligned(usize),

    /// The hex input could not be decoded.
    #[error("invalid hex input")]
    InvalidHex(#[from] hex::FromHexError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_across_byte_boundaries() {
        let buf = BitBuffer::from_bytes(&[0b1010_1100, 0b0101_0000]);
        assert_eq!(buf.read(0, 4).unwrap(), 0b1010);
        assert_eq!(buf.read(4, 8).unwrap(), 0b1100_0101);
        assert_eq!(buf.read(12, 4).unwrap(), 0);
    }

    #[test]
    fn write_then_read_back() {
        let mut buf = BitBuffer::zeroed(24);
        buf.write(3, 13, 0x1abc).unwrap();
        assert_eq!(buf.read(3, 13).unwrap(), 0x1abc);
        assert_eq!(buf.read(0, 3).unwrap(), 0);
        assert_eq!(buf.read(16, 8).unwrap(), 0);
    }

    #[test]
    fn rejects_reads_past_the_end() {
        let buf = BitBuffer::from_bytes(&[0xff]);
        assert_eq!(
            buf.read(4, 8),
            Err(BitsError::OutOfRange {
                offset: 4,
                length: 8,
                available: 8
            })
        );
        assert_eq!(buf.slice_lenient(4, 8).len(), 4);
    }

    #[test]
    fn rejects_values_wider_than_the_window() {
        let mut buf = BitBuffer::zeroed(8);
        assert!(matches!(
            buf.write(0, 4, 0x10),
            Err(BitsError::ValueTooLarge { .. })
        ));
    }

    #[test]
    fn unaligned_append_and_slice() {
        let mut buf = BitBuffer::from_uint(0b101, 3).unwrap();
        buf.append(&BitBuffer::from_bytes(&[0xff]));
        assert_eq!(buf.len(), 11);
        assert_eq!(buf.read(0, 11).unwrap(), 0b101_1111_1111);
        assert_eq!(buf.slice(3, 8).unwrap().as_bytes(), &[0xff]);
    }

    #[test]
    fn per_byte_bit_reversal() {
        let buf = BitBuffer::from_bytes(&[0x01, 0x81, 0xf0]);
        assert_eq!(buf.reverse_bits_per_byte().unwrap().as_bytes(), &[0x80, 0x81, 0x0f]);
    }

    #[test]
    fn per_byte_bit_reversal_rejects_partial_bytes() {
        let mut buf = BitBuffer::from_bytes(&[0x01]);
        buf.append(&BitBuffer::from_uint(0b101, 3).unwrap());
        assert_eq!(buf.reverse_bits_per_byte(), Err(BitsError::NotByteAligned(11)));
    }

    #[test]
    fn hex_and_padding() {
        let buf = BitBuffer::from_hex("3D B8 f3 96").unwrap();
        assert_eq!(buf.to_hex(), "3DB8F396");
        assert_eq!(buf.reverse_bytes().unwrap().to_hex(), "96F3B83D");
        assert_eq!(buf.pad_left(40).to_hex(), "003DB8F396");
        assert_eq!(buf.pad_right(40).to_hex(), "3DB8F39600");
        assert!(BitBuffer::from_hex("zz").is_err());
    }

    #[test]
    fn invalid_hex_keeps_the_decoder_error() {
        assert_eq!(
            BitBuffer::from_hex("3d b"),
            Err(BitsError::InvalidHex(hex::FromHexError::OddLength))
        );
    }

    #[test]
    fn ascii_rendering() {
        assert_eq!(BitBuffer::from_bytes(b"ab\x00c").to_ascii(), "ab.c");
    }
}
