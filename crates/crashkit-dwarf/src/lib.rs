//! A streaming reader for DWARF v2-v5 debugging information.
//!
//! This crate parses the `.debug_info` family of sections and delivers
//! Debugging Information Entries to a consumer through the push-style
//! [`DwarfHandler`] trait: one callback per DIE and per decoded attribute,
//! in strict preorder. It exists to feed symbol extraction, so it decodes
//! the control-flow-relevant subset of DWARF faithfully (every attribute
//! form, range lists, indexed strings and addresses) while leaving
//! interpretation entirely to the consumer.
//!
//! The reader never follows references and never allocates copies of
//! section data: string and buffer attributes borrow the input sections
//! for the duration of the callback.
//!
//! Endianness, DWARF version, 32/64-bit format, and address size may all
//! vary from one compilation unit to the next within a single section;
//! each [`CompilationUnit`] carries its own decoding context.

pub mod abbrev;
pub mod constants;
pub mod ranges;
pub mod reader;
pub mod unit;

pub use abbrev::{Abbrev, AbbrevAttr, AbbrevTable};
pub use ranges::{CuRangesInfo, RangeListHandler, RangeListReader};
pub use reader::{ByteReader, Endian, Truncated};
pub use unit::{CompilationUnit, DwarfHandler};

/// The `.debug_*` sections a reader may need, all borrowed.
///
/// Sections that are absent from the object file stay empty; decoding
/// only fails if something actually references them.
#[derive(Clone, Copy, Debug, Default)]
pub struct DwarfSections<'a> {
    pub debug_info: &'a [u8],
    pub debug_abbrev: &'a [u8],
    pub debug_str: &'a [u8],
    pub debug_line_str: &'a [u8],
    pub debug_str_offsets: &'a [u8],
    pub debug_addr: &'a [u8],
    pub debug_ranges: &'a [u8],
    pub debug_rnglists: &'a [u8],
}
