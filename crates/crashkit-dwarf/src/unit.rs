//! The compilation-unit driver: parses one CU out of `.debug_info` and
//! pushes typed callbacks at a [`DwarfHandler`].
//!
//! The driver owns all the encoding variance (endianness, 32/64-bit
//! format, address size, DWARF version 2 through 5) so consumers only see
//! decoded values. Attribute values fall into seven categories: unsigned,
//! signed, reference, string, buffer, signature, and skipped (consumed but
//! not delivered).

use std::borrow::Cow;

use tracing::warn;

use crate::abbrev::{Abbrev, AbbrevTable};
use crate::constants::*;
use crate::reader::{ByteReader, Endian, Truncated};
use crate::DwarfSections;

/// Push-style consumer of a compilation unit.
///
/// All offsets are absolute within `.debug_info`. String and buffer
/// payloads borrow the underlying section and must be copied if retained
/// past the callback.
pub trait DwarfHandler {
    /// Called once per unit. Returning `false` skips the unit's DIEs; the
    /// driver still consumes and reports the unit's full length.
    fn start_compilation_unit(
        &mut self,
        _offset: u64,
        _address_size: u8,
        _offset_size: u8,
        _cu_length: u64,
        _version: u16,
    ) -> bool {
        true
    }

    /// Called at each DIE. Returning `false` skips the DIE's attributes
    /// and its whole subtree; no `end_die` is delivered for it.
    fn start_die(&mut self, _offset: u64, _tag: DwTag) -> bool {
        true
    }

    fn end_die(&mut self, _offset: u64) {}

    fn attr_unsigned(&mut self, _offset: u64, _attr: DwAt, _form: DwForm, _value: u64) {}

    fn attr_signed(&mut self, _offset: u64, _attr: DwAt, _form: DwForm, _value: i64) {}

    fn attr_reference(&mut self, _offset: u64, _attr: DwAt, _form: DwForm, _value: u64) {}

    fn attr_string(&mut self, _offset: u64, _attr: DwAt, _form: DwForm, _value: &str) {}

    fn attr_buffer(&mut self, _offset: u64, _attr: DwAt, _form: DwForm, _value: &[u8]) {}

    fn attr_signature(&mut self, _offset: u64, _attr: DwAt, _form: DwForm, _signature: u64) {}
}

enum UnitError {
    Truncated,
    BadAbbrevCode(u64),
    UnknownForm(DwForm),
}

impl From<Truncated> for UnitError {
    fn from(_: Truncated) -> UnitError {
        UnitError::Truncated
    }
}

type UnitResult<T> = Result<T, UnitError>;

enum AttrValue<'a> {
    Unsigned(u64),
    Signed(i64),
    Reference(u64),
    Str(Cow<'a, str>),
    Buffer(&'a [u8]),
    Signature(u64),
    Skipped,
}

/// Reader for a single compilation unit at a fixed `.debug_info` offset.
pub struct CompilationUnit<'d, 'h, H: DwarfHandler> {
    sections: DwarfSections<'d>,
    endian: Endian,
    offset: u64,
    handler: &'h mut H,
    version: u16,
    address_size: u8,
    offset_size: u8,
    str_offsets_base: Option<u64>,
    addr_base: Option<u64>,
    root_offset: Option<u64>,
    base_attrs: Vec<(DwAt, DwForm, u64)>,
}

/// The unit-level base attributes the prescan collects: they anchor the
/// indexed and offset-encoded forms of every other attribute.
fn is_base_attribute(name: DwAt) -> bool {
    matches!(
        name,
        DW_AT_str_offsets_base | DW_AT_addr_base | DW_AT_rnglists_base | DW_AT_loclists_base
    )
}

impl<'d, 'h, H: DwarfHandler> CompilationUnit<'d, 'h, H> {
    pub fn new(
        sections: DwarfSections<'d>,
        endian: Endian,
        offset: u64,
        handler: &'h mut H,
    ) -> CompilationUnit<'d, 'h, H> {
        CompilationUnit {
            sections,
            endian,
            offset,
            handler,
            version: 0,
            address_size: 0,
            offset_size: 0,
            str_offsets_base: None,
            addr_base: None,
            root_offset: None,
            base_attrs: Vec::new(),
        }
    }

    /// Parse the unit and return the number of bytes consumed, including
    /// the initial-length field.
    ///
    /// A well-formed unit always consumes `unit_length` plus the length
    /// field's own size, so callers can advance to the next unit. On
    /// truncation or malformed content the count covers what was actually
    /// decoded, and no callback will have observed bytes past it.
    pub fn start(mut self) -> u64 {
        let mut reader = ByteReader::new(self.sections.debug_info, self.endian);
        if reader.seek(self.offset).is_err() {
            warn!(offset = self.offset, "compilation unit offset out of bounds");
            return 0;
        }

        let start_offset = self.offset;
        let consumed = move |reader: &ByteReader<'_>| reader.pos() - start_offset;

        let (unit_length, unit_type, abbrev_offset) = match self.read_header(&mut reader) {
            Ok(header) => header,
            Err(_) => {
                warn!(offset = self.offset, "truncated compilation unit header");
                return consumed(&reader);
            }
        };
        let initial_length_size = if reader.offset_size() == 8 { 12 } else { 4 };
        let full_length = initial_length_size + unit_length;
        let cu_end = self.offset + full_length;

        if !(2..=5).contains(&self.version) {
            warn!(
                offset = self.offset,
                version = self.version,
                "unsupported DWARF version"
            );
            return consumed(&reader);
        }
        if self.address_size != 4 && self.address_size != 8 {
            warn!(
                offset = self.offset,
                address_size = self.address_size,
                "unsupported address size"
            );
            return consumed(&reader);
        }

        if !self.handler.start_compilation_unit(
            self.offset,
            self.address_size,
            self.offset_size,
            unit_length,
            self.version,
        ) {
            return full_length;
        }

        // Type units participate in type deduplication but carry no
        // address-attributed code, so their DIEs are not delivered. The
        // full length is still reported so the caller can advance.
        if self.version == 5 && (unit_type == Some(DW_UT_type) || unit_type == Some(DW_UT_split_type))
        {
            return full_length;
        }

        let abbrevs =
            match AbbrevTable::parse(self.sections.debug_abbrev, abbrev_offset, self.endian) {
                Ok(table) => table,
                Err(_) => {
                    warn!(
                        offset = self.offset,
                        abbrev_offset, "truncated abbreviation table"
                    );
                    return consumed(&reader);
                }
            };

        self.prescan_base_attributes(reader, &abbrevs, cu_end);

        // Hand the bases to the handler ahead of the root DIE, so a
        // consumer that resolves ranges or locations as the attributes
        // arrive has them from the start, whatever the attribute order
        // in the DIE. Each is delivered exactly once; the in-place
        // occurrences are suppressed below.
        if let Some(root_offset) = self.root_offset {
            let base_attrs = std::mem::take(&mut self.base_attrs);
            for (name, form, value) in base_attrs {
                self.handler.attr_unsigned(root_offset, name, form, value);
            }
        }

        match self.process_dies(&mut reader, &abbrevs, cu_end) {
            Ok(()) => full_length,
            Err(UnitError::Truncated) => {
                warn!(offset = self.offset, "compilation unit truncated");
                consumed(&reader)
            }
            Err(UnitError::BadAbbrevCode(code)) => {
                warn!(offset = self.offset, code, "unknown abbreviation code");
                consumed(&reader)
            }
            Err(UnitError::UnknownForm(form)) => {
                warn!(offset = self.offset, form = ?form, "unknown attribute form");
                consumed(&reader)
            }
        }
    }

    /// Returns `(unit_length, unit_type, abbrev_offset)` and fills in the
    /// version and size fields.
    fn read_header(
        &mut self,
        reader: &mut ByteReader<'d>,
    ) -> UnitResult<(u64, Option<DwUt>, u64)> {
        let unit_length = reader.read_initial_length()?;
        self.offset_size = reader.offset_size();
        self.version = reader.read_u16()?;

        let (unit_type, abbrev_offset) = if self.version >= 5 {
            let unit_type = DwUt(reader.read_u8()?);
            self.address_size = reader.read_u8()?;
            let abbrev_offset = reader.read_offset()?;
            (Some(unit_type), abbrev_offset)
        } else {
            let abbrev_offset = reader.read_offset()?;
            self.address_size = reader.read_u8()?;
            (None, abbrev_offset)
        };
        reader.set_address_size(if self.address_size == 8 { 8 } else { 4 });
        Ok((unit_length, unit_type, abbrev_offset))
    }

    /// Peek at the root DIE and record `DW_AT_str_offsets_base`,
    /// `DW_AT_addr_base`, `DW_AT_rnglists_base` and `DW_AT_loclists_base`
    /// before any DIE is delivered.
    ///
    /// Producers may order these after attributes that depend on them
    /// (a `strx` name before the str-offsets base, say), so neither the
    /// driver's own indexed-form decoding nor its consumers can rely on
    /// stream order.
    fn prescan_base_attributes(
        &mut self,
        mut reader: ByteReader<'d>,
        abbrevs: &AbbrevTable,
        cu_end: u64,
    ) {
        let root_offset = reader.pos();
        let code = match reader.read_uleb128() {
            Ok(code) => code,
            Err(_) => return,
        };
        let abbrev = match abbrevs.get(code) {
            Some(abbrev) => abbrev,
            None => return,
        };
        if abbrev.tag != DW_TAG_compile_unit && abbrev.tag != DW_TAG_skeleton_unit {
            return;
        }
        self.root_offset = Some(root_offset);
        for attr in &abbrev.attrs {
            if reader.pos() > cu_end {
                return;
            }
            let value = match self.read_attribute(&mut reader, attr.form, attr.implicit_const) {
                Ok(value) => value,
                Err(_) => return,
            };
            if let AttrValue::Unsigned(value) = value {
                if is_base_attribute(attr.name) {
                    match attr.name {
                        DW_AT_str_offsets_base => self.str_offsets_base = Some(value),
                        DW_AT_addr_base => self.addr_base = Some(value),
                        _ => {}
                    }
                    self.base_attrs.push((attr.name, attr.form, value));
                }
            }
        }
    }

    fn process_dies(
        &mut self,
        reader: &mut ByteReader<'d>,
        abbrevs: &AbbrevTable,
        cu_end: u64,
    ) -> UnitResult<()> {
        let mut die_stack: Vec<u64> = Vec::new();

        while reader.pos() < cu_end {
            let die_offset = reader.pos();
            let code = reader.read_uleb128()?;

            if code == 0 {
                // Null entry: ends the children of the innermost open DIE.
                match die_stack.pop() {
                    Some(parent) => self.handler.end_die(parent),
                    None => return Ok(()),
                }
                continue;
            }

            let abbrev = abbrevs.get(code).ok_or(UnitError::BadAbbrevCode(code))?;

            if self.handler.start_die(die_offset, abbrev.tag) {
                self.process_attributes(reader, die_offset, abbrev, cu_end)?;
                if abbrev.has_children {
                    die_stack.push(die_offset);
                } else {
                    self.handler.end_die(die_offset);
                }
            } else {
                self.skip_die(reader, abbrev, abbrevs, cu_end)?;
            }
        }

        if !die_stack.is_empty() {
            return Err(UnitError::Truncated);
        }
        Ok(())
    }

    fn process_attributes(
        &mut self,
        reader: &mut ByteReader<'d>,
        die_offset: u64,
        abbrev: &Abbrev,
        cu_end: u64,
    ) -> UnitResult<()> {
        for attr in &abbrev.attrs {
            if reader.pos() > cu_end {
                return Err(UnitError::Truncated);
            }
            let value = self.read_attribute(reader, attr.form, attr.implicit_const)?;
            // The root DIE's base attributes were delivered ahead of the
            // DIE; only their bytes are consumed here.
            if Some(die_offset) == self.root_offset
                && is_base_attribute(attr.name)
                && matches!(&value, AttrValue::Unsigned(_))
            {
                continue;
            }
            match value {
                AttrValue::Unsigned(v) => {
                    self.handler.attr_unsigned(die_offset, attr.name, attr.form, v)
                }
                AttrValue::Signed(v) => {
                    self.handler.attr_signed(die_offset, attr.name, attr.form, v)
                }
                AttrValue::Reference(v) => {
                    self.handler
                        .attr_reference(die_offset, attr.name, attr.form, v)
                }
                AttrValue::Str(v) => self.handler.attr_string(die_offset, attr.name, attr.form, &v),
                AttrValue::Buffer(v) => {
                    self.handler.attr_buffer(die_offset, attr.name, attr.form, v)
                }
                AttrValue::Signature(v) => {
                    self.handler
                        .attr_signature(die_offset, attr.name, attr.form, v)
                }
                AttrValue::Skipped => {}
            }
        }
        Ok(())
    }

    /// Consume a refused DIE: its attributes and, recursively, its whole
    /// subtree, without delivering callbacks.
    fn skip_die(
        &mut self,
        reader: &mut ByteReader<'d>,
        abbrev: &Abbrev,
        abbrevs: &AbbrevTable,
        cu_end: u64,
    ) -> UnitResult<()> {
        for attr in &abbrev.attrs {
            if reader.pos() > cu_end {
                return Err(UnitError::Truncated);
            }
            let _ = self.read_attribute(reader, attr.form, attr.implicit_const)?;
        }
        if !abbrev.has_children {
            return Ok(());
        }
        loop {
            if reader.pos() >= cu_end {
                return Err(UnitError::Truncated);
            }
            let code = reader.read_uleb128()?;
            if code == 0 {
                return Ok(());
            }
            let child = abbrevs.get(code).ok_or(UnitError::BadAbbrevCode(code))?;
            self.skip_die(reader, child, abbrevs, cu_end)?;
        }
    }

    fn read_attribute(
        &self,
        reader: &mut ByteReader<'d>,
        form: DwForm,
        implicit_const: Option<i64>,
    ) -> UnitResult<AttrValue<'d>> {
        let value = match form {
            DW_FORM_addr => AttrValue::Unsigned(reader.read_address()?),
            DW_FORM_data1 => AttrValue::Unsigned(reader.read_u8()? as u64),
            DW_FORM_data2 => AttrValue::Unsigned(reader.read_u16()? as u64),
            DW_FORM_data4 => AttrValue::Unsigned(reader.read_u32()? as u64),
            DW_FORM_data8 => AttrValue::Unsigned(reader.read_u64()?),
            DW_FORM_udata => AttrValue::Unsigned(reader.read_uleb128()?),
            DW_FORM_sdata => AttrValue::Signed(reader.read_sleb128()?),
            DW_FORM_sec_offset => AttrValue::Unsigned(reader.read_offset()?),
            DW_FORM_flag => AttrValue::Unsigned(reader.read_u8()? as u64),
            // Present-by-existence: no bytes on the wire, value is 1.
            DW_FORM_flag_present => AttrValue::Unsigned(1),
            // The value was baked into the abbreviation; no DIE bytes.
            DW_FORM_implicit_const => {
                AttrValue::Unsigned(implicit_const.ok_or(UnitError::UnknownForm(form))? as u64)
            }
            DW_FORM_loclistx | DW_FORM_rnglistx => AttrValue::Unsigned(reader.read_uleb128()?),

            DW_FORM_string => {
                AttrValue::Str(String::from_utf8_lossy(reader.read_cstr()?))
            }
            DW_FORM_strp => {
                let offset = reader.read_offset()?;
                AttrValue::Str(self.read_str(self.sections.debug_str, offset)?)
            }
            DW_FORM_line_strp => {
                let offset = reader.read_offset()?;
                AttrValue::Str(self.read_str(self.sections.debug_line_str, offset)?)
            }
            DW_FORM_strx => {
                let index = reader.read_uleb128()?;
                AttrValue::Str(self.resolve_strx(index)?)
            }
            DW_FORM_strx1 | DW_FORM_strx2 | DW_FORM_strx3 | DW_FORM_strx4 => {
                let width = (form.0 - DW_FORM_strx1.0 + 1) as u8;
                let index = self.read_strx_index(reader, width)?;
                AttrValue::Str(self.resolve_strx(index)?)
            }
            DW_FORM_addrx => {
                let index = reader.read_uleb128()?;
                AttrValue::Unsigned(self.resolve_addrx(index)?)
            }
            DW_FORM_addrx1 | DW_FORM_addrx2 | DW_FORM_addrx3 | DW_FORM_addrx4 => {
                let width = (form.0 - DW_FORM_addrx1.0 + 1) as u8;
                let index = self.read_strx_index(reader, width)?;
                AttrValue::Unsigned(self.resolve_addrx(index)?)
            }

            // References encoded relative to the unit are rebased to
            // absolute .debug_info offsets before delivery.
            DW_FORM_ref1 => AttrValue::Reference(reader.read_u8()? as u64 + self.offset),
            DW_FORM_ref2 => AttrValue::Reference(reader.read_u16()? as u64 + self.offset),
            DW_FORM_ref4 => AttrValue::Reference(reader.read_u32()? as u64 + self.offset),
            DW_FORM_ref8 => AttrValue::Reference(reader.read_u64()? + self.offset),
            DW_FORM_ref_udata => AttrValue::Reference(reader.read_uleb128()? + self.offset),
            // Already absolute. DWARF 2 encoded this with the address
            // size; later versions use the offset size.
            DW_FORM_ref_addr => {
                let value = if self.version == 2 {
                    reader.read_address()?
                } else {
                    reader.read_offset()?
                };
                AttrValue::Reference(value)
            }
            // An absolute type-signature hash, never unit-relative.
            DW_FORM_ref_sig8 => AttrValue::Signature(reader.read_u64()?),

            DW_FORM_block1 => {
                let len = reader.read_u8()? as u64;
                AttrValue::Buffer(reader.read_bytes(len)?)
            }
            DW_FORM_block2 => {
                let len = reader.read_u16()? as u64;
                AttrValue::Buffer(reader.read_bytes(len)?)
            }
            DW_FORM_block4 => {
                let len = reader.read_u32()? as u64;
                AttrValue::Buffer(reader.read_bytes(len)?)
            }
            DW_FORM_block | DW_FORM_exprloc => {
                let len = reader.read_uleb128()?;
                AttrValue::Buffer(reader.read_bytes(len)?)
            }
            DW_FORM_data16 => AttrValue::Buffer(reader.read_bytes(16)?),

            // Supplementary-file forms: consumed for framing, but there is
            // no supplementary object to resolve them against.
            DW_FORM_ref_sup4 => {
                reader.skip(4)?;
                AttrValue::Skipped
            }
            DW_FORM_ref_sup8 => {
                reader.skip(8)?;
                AttrValue::Skipped
            }
            DW_FORM_strp_sup => {
                let _ = reader.read_offset()?;
                AttrValue::Skipped
            }

            DW_FORM_indirect => {
                let actual = DwForm(reader.read_uleb128()?);
                if actual == DW_FORM_indirect || actual == DW_FORM_implicit_const {
                    return Err(UnitError::UnknownForm(actual));
                }
                return self.read_attribute(reader, actual, None);
            }

            _ => return Err(UnitError::UnknownForm(form)),
        };
        Ok(value)
    }

    /// Fixed-width little/big-endian index payload of `strx1..4` and
    /// `addrx1..4` (three-byte reads included).
    fn read_strx_index(&self, reader: &mut ByteReader<'d>, width: u8) -> UnitResult<u64> {
        let bytes = reader.read_bytes(width as u64)?;
        let mut value: u64 = 0;
        match self.endian {
            Endian::Little => {
                for &b in bytes.iter().rev() {
                    value = (value << 8) | b as u64;
                }
            }
            Endian::Big => {
                for &b in bytes {
                    value = (value << 8) | b as u64;
                }
            }
        }
        Ok(value)
    }

    fn read_str(&self, section: &'d [u8], offset: u64) -> UnitResult<Cow<'d, str>> {
        let mut reader = ByteReader::new(section, self.endian);
        reader.seek(offset)?;
        Ok(String::from_utf8_lossy(reader.read_cstr()?))
    }

    /// Dereference a string index through the `.debug_str_offsets` entry
    /// table into `.debug_str`.
    ///
    /// The table origin defaults to the section header size for the
    /// unit's offset width when no `DW_AT_str_offsets_base` was seen, and
    /// indices address entries starting at one; index zero is malformed.
    fn resolve_strx(&self, index: u64) -> UnitResult<Cow<'d, str>> {
        let offset_size = self.offset_size as u64;
        let base = self
            .str_offsets_base
            .unwrap_or(if offset_size == 8 { 16 } else { 8 });
        let index = match index.checked_sub(1) {
            Some(index) => index,
            None => {
                warn!("string index zero in .debug_str_offsets lookup");
                return Err(UnitError::Truncated);
            }
        };
        let entry = base
            .checked_add(index.checked_mul(offset_size).ok_or(Truncated)?)
            .ok_or(Truncated)?;
        let mut offsets = ByteReader::new(self.sections.debug_str_offsets, self.endian);
        offsets.set_offset_size(self.offset_size);
        offsets.seek(entry)?;
        let str_offset = offsets.read_offset()?;
        self.read_str(self.sections.debug_str, str_offset)
    }

    /// Dereference an address index through `.debug_addr`.
    fn resolve_addrx(&self, index: u64) -> UnitResult<u64> {
        let base = self
            .addr_base
            .unwrap_or(if self.offset_size == 8 { 16 } else { 8 });
        let entry = base
            .checked_add(
                index
                    .checked_mul(self.address_size as u64)
                    .ok_or(Truncated)?,
            )
            .ok_or(Truncated)?;
        let mut addrs = ByteReader::new(self.sections.debug_addr, self.endian);
        addrs.set_address_size(self.address_size);
        addrs.seek(entry)?;
        Ok(addrs.read_address()?)
    }
}
