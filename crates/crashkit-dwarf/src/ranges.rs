//! Address-range list resolution for `DW_AT_ranges`.
//!
//! DWARF 4 keeps range lists in `.debug_ranges` as address pairs; DWARF 5
//! moved to the `.debug_rnglists` opcode encoding, optionally indirected
//! through a per-unit offset-entry table (`DW_FORM_rnglistx`).

use crate::constants::*;
use crate::reader::{ByteReader, Endian, Result};

/// Receives the `[begin, end)` intervals of one range list, in section
/// order, followed by a single `finish`.
pub trait RangeListHandler {
    fn add_range(&mut self, begin: u64, end: u64);

    fn finish(&mut self) {}
}

/// Everything about the referencing compilation unit that range
/// resolution depends on.
///
/// `ranges_base` and `addr_base` are byte offsets of the respective entry
/// tables (that is, past the section headers), exactly as carried by
/// `DW_AT_rnglists_base` and `DW_AT_addr_base`.
#[derive(Clone, Copy, Debug, Default)]
pub struct CuRangesInfo<'a> {
    pub version: u16,
    pub base_address: u64,
    pub ranges_base: u64,
    pub addr_base: u64,
    /// `.debug_ranges` for version <= 4, `.debug_rnglists` for version 5.
    pub buffer: &'a [u8],
    pub addr_buffer: &'a [u8],
}

pub struct RangeListReader<'a, 'h> {
    endian: Endian,
    address_size: u8,
    offset_size: u8,
    info: CuRangesInfo<'a>,
    handler: &'h mut dyn RangeListHandler,
}

impl<'a, 'h> RangeListReader<'a, 'h> {
    pub fn new(
        endian: Endian,
        address_size: u8,
        offset_size: u8,
        info: CuRangesInfo<'a>,
        handler: &'h mut dyn RangeListHandler,
    ) -> RangeListReader<'a, 'h> {
        RangeListReader {
            endian,
            address_size,
            offset_size,
            info,
            handler,
        }
    }

    /// Resolve one `DW_AT_ranges` value.
    ///
    /// `form` is `DW_FORM_sec_offset` (value is a byte offset into the
    /// list section) or `DW_FORM_rnglistx` (value indexes the unit's
    /// offset-entry table at `ranges_base`). Returns `false` on bounds
    /// failures, before any callback where the failure is detectable up
    /// front.
    pub fn read_ranges(&mut self, form: DwForm, value: u64) -> bool {
        match form {
            DW_FORM_sec_offset => {
                if self.info.version <= 4 {
                    self.read_debug_ranges(value).is_ok()
                } else {
                    self.read_rnglist(value).is_ok()
                }
            }
            DW_FORM_rnglistx => {
                let offset_size = self.offset_size as u64;
                let entry = match self
                    .info
                    .ranges_base
                    .checked_add(value.wrapping_mul(offset_size))
                {
                    Some(entry) => entry,
                    None => return false,
                };
                let mut reader = self.list_reader();
                if reader.seek(entry).is_err() {
                    return false;
                }
                let list_offset = match reader.read_offset() {
                    Ok(offset) => offset,
                    Err(_) => return false,
                };
                match self.info.ranges_base.checked_add(list_offset) {
                    Some(offset) => self.read_rnglist(offset).is_ok(),
                    None => false,
                }
            }
            _ => false,
        }
    }

    fn list_reader(&self) -> ByteReader<'a> {
        let mut reader = ByteReader::new(self.info.buffer, self.endian);
        reader.set_address_size(self.address_size);
        reader.set_offset_size(self.offset_size);
        reader
    }

    /// DWARF 4 `.debug_ranges`: address pairs, `(0, 0)` terminated, with
    /// `(MAX, base)` escapes that swap the base address.
    fn read_debug_ranges(&mut self, offset: u64) -> Result<()> {
        let max_address = if self.address_size == 8 {
            u64::MAX
        } else {
            u32::MAX as u64
        };
        let mut reader = self.list_reader();
        reader.seek(offset)?;
        let mut base = self.info.base_address;
        loop {
            let begin = reader.read_address()?;
            let end = reader.read_address()?;
            if begin == 0 && end == 0 {
                self.handler.finish();
                return Ok(());
            }
            if begin == max_address {
                base = end;
                continue;
            }
            // Out-of-order entries are legal and forwarded as-is.
            self.handler
                .add_range(base.wrapping_add(begin), base.wrapping_add(end));
        }
    }

    /// DWARF 5 `.debug_rnglists` opcode stream starting at `offset`.
    fn read_rnglist(&mut self, offset: u64) -> Result<()> {
        let mut reader = self.list_reader();
        reader.seek(offset)?;
        let mut base = self.info.base_address;
        loop {
            match DwRle(reader.read_u8()?) {
                DW_RLE_end_of_list => {
                    self.handler.finish();
                    return Ok(());
                }
                DW_RLE_base_addressx => {
                    let index = reader.read_uleb128()?;
                    base = self.read_addr_entry(index)?;
                }
                DW_RLE_base_address => {
                    base = reader.read_address()?;
                }
                DW_RLE_startx_endx => {
                    let begin = self.read_addr_entry(reader.read_uleb128()?)?;
                    let end = self.read_addr_entry(reader.read_uleb128()?)?;
                    self.handler.add_range(begin, end);
                }
                DW_RLE_startx_length => {
                    let begin = self.read_addr_entry(reader.read_uleb128()?)?;
                    let length = reader.read_uleb128()?;
                    self.handler.add_range(begin, begin.wrapping_add(length));
                }
                DW_RLE_offset_pair => {
                    let begin = reader.read_uleb128()?;
                    let end = reader.read_uleb128()?;
                    self.handler
                        .add_range(base.wrapping_add(begin), base.wrapping_add(end));
                }
                DW_RLE_start_end => {
                    let begin = reader.read_address()?;
                    let end = reader.read_address()?;
                    self.handler.add_range(begin, end);
                }
                DW_RLE_start_length => {
                    let begin = reader.read_address()?;
                    let length = reader.read_uleb128()?;
                    self.handler.add_range(begin, begin.wrapping_add(length));
                }
                _ => return Err(crate::reader::Truncated),
            }
        }
    }

    /// Look up entry `index` of the `.debug_addr` table at `addr_base`.
    fn read_addr_entry(&self, index: u64) -> Result<u64> {
        let mut reader = ByteReader::new(self.info.addr_buffer, self.endian);
        reader.set_address_size(self.address_size);
        let entry = self
            .info
            .addr_base
            .checked_add(index.wrapping_mul(self.address_size as u64))
            .ok_or(crate::reader::Truncated)?;
        reader.seek(entry)?;
        reader.read_address()
    }
}
