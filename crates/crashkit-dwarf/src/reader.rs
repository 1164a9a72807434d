//! Endian- and width-parametric decoding over a borrowed byte slice.
//!
//! Every read either consumes bytes and advances the cursor or reports
//! [`Truncated`]; nothing ever reads past the end of the slice.

use thiserror::Error;

/// The decoder ran off the end of its section.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("unexpected end of section data")]
pub struct Truncated;

pub type Result<T> = std::result::Result<T, Truncated>;

/// Byte order of the sections being decoded.
///
/// DWARF allows the endianness (and every size parameter) to differ from
/// one compilation unit to the next, so this is carried per reader rather
/// than chosen at compile time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// A cursor over a `.debug_*` section.
///
/// `address_size` and `offset_size` are configured independently of the
/// data: the compilation-unit header dictates both, and `read_address` /
/// `read_offset` honor them.
#[derive(Clone, Copy, Debug)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
    endian: Endian,
    address_size: u8,
    offset_size: u8,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8], endian: Endian) -> ByteReader<'a> {
        ByteReader {
            data,
            pos: 0,
            endian,
            address_size: 4,
            offset_size: 4,
        }
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn address_size(&self) -> u8 {
        self.address_size
    }

    pub fn offset_size(&self) -> u8 {
        self.offset_size
    }

    /// `size` must be 4 or 8.
    pub fn set_address_size(&mut self, size: u8) {
        debug_assert!(size == 4 || size == 8);
        self.address_size = size;
    }

    /// `size` must be 4 or 8.
    pub fn set_offset_size(&mut self, size: u8) {
        debug_assert!(size == 4 || size == 8);
        self.offset_size = size;
    }

    pub fn pos(&self) -> u64 {
        self.pos as u64
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn remaining(&self) -> u64 {
        (self.data.len() - self.pos) as u64
    }

    pub fn seek(&mut self, pos: u64) -> Result<()> {
        if pos > self.data.len() as u64 {
            return Err(Truncated);
        }
        self.pos = pos as usize;
        Ok(())
    }

    pub fn skip(&mut self, count: u64) -> Result<()> {
        let _ = self.read_bytes(count)?;
        Ok(())
    }

    pub fn read_bytes(&mut self, count: u64) -> Result<&'a [u8]> {
        let count = usize::try_from(count).map_err(|_| Truncated)?;
        let end = self.pos.checked_add(count).ok_or(Truncated)?;
        let bytes = self.data.get(self.pos..end).ok_or(Truncated)?;
        self.pos = end;
        Ok(bytes)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let b = *self.data.get(self.pos).ok_or(Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let bytes: [u8; 2] = self.read_bytes(2)?.try_into().unwrap();
        Ok(match self.endian {
            Endian::Little => u16::from_le_bytes(bytes),
            Endian::Big => u16::from_be_bytes(bytes),
        })
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes: [u8; 4] = self.read_bytes(4)?.try_into().unwrap();
        Ok(match self.endian {
            Endian::Little => u32::from_le_bytes(bytes),
            Endian::Big => u32::from_be_bytes(bytes),
        })
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let bytes: [u8; 8] = self.read_bytes(8)?.try_into().unwrap();
        Ok(match self.endian {
            Endian::Little => u64::from_le_bytes(bytes),
            Endian::Big => u64::from_be_bytes(bytes),
        })
    }

    /// Read a fixed-width unsigned integer of 1, 2, 4, or 8 bytes.
    pub fn read_unsigned(&mut self, width: u8) -> Result<u64> {
        match width {
            1 => Ok(self.read_u8()? as u64),
            2 => Ok(self.read_u16()? as u64),
            4 => Ok(self.read_u32()? as u64),
            8 => self.read_u64(),
            _ => Err(Truncated),
        }
    }

    /// Read an unsigned LEB128-encoded value.
    ///
    /// Encodings longer than 64 bits of payload are rejected as malformed
    /// rather than silently wrapped.
    pub fn read_uleb128(&mut self) -> Result<u64> {
        let mut result: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift == 63 && byte > 1 {
                return Err(Truncated);
            }
            result |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
            if shift >= 64 {
                return Err(Truncated);
            }
        }
    }

    /// Read a signed LEB128-encoded value.
    pub fn read_sleb128(&mut self) -> Result<i64> {
        let mut result: i64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift >= 64 {
                return Err(Truncated);
            }
            result |= i64::from(byte & 0x7f) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    result |= -1i64 << shift;
                }
                return Ok(result);
            }
        }
    }

    /// Read an `address_size`-wide word.
    pub fn read_address(&mut self) -> Result<u64> {
        self.read_unsigned(self.address_size)
    }

    /// Read an `offset_size`-wide section offset.
    pub fn read_offset(&mut self) -> Result<u64> {
        self.read_unsigned(self.offset_size)
    }

    /// Read a DWARF initial-length field.
    ///
    /// The first four bytes either hold the length (32-bit format) or the
    /// 0xffffffff escape announcing a 64-bit length. As a side effect the
    /// reader's `offset_size` is set to match the format, since every
    /// subsequent offset in the unit uses it.
    pub fn read_initial_length(&mut self) -> Result<u64> {
        let word = self.read_u32()?;
        if word == 0xffff_ffff {
            self.set_offset_size(8);
            self.read_u64()
        } else {
            self.set_offset_size(4);
            Ok(word as u64)
        }
    }

    /// Read a NUL-terminated string, consuming the terminator.
    pub fn read_cstr(&mut self) -> Result<&'a [u8]> {
        let rest = &self.data[self.pos..];
        let nul = rest.iter().position(|&b| b == 0).ok_or(Truncated)?;
        let bytes = &rest[..nul];
        self.pos += nul + 1;
        Ok(bytes)
    }
}
