//! `.debug_abbrev` decoding.
//!
//! An abbreviation is a reusable template for a DIE's shape: its tag,
//! whether it has children, and the ordered list of attribute/form pairs
//! its body carries. DIEs reference abbreviations by a unit-local code.

use std::collections::HashMap;

use crate::constants::{DwAt, DwChildren, DwForm, DwTag, DW_FORM_implicit_const};
use crate::reader::{ByteReader, Endian, Result, Truncated};

/// One attribute slot of an abbreviation.
///
/// `implicit_const` is present exactly when `form` is
/// `DW_FORM_implicit_const`; the value lives here in the abbreviation and
/// the DIE body contributes no bytes for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AbbrevAttr {
    pub name: DwAt,
    pub form: DwForm,
    pub implicit_const: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct Abbrev {
    pub code: u64,
    pub tag: DwTag,
    pub has_children: bool,
    pub attrs: Vec<AbbrevAttr>,
}

/// The abbreviation table of a single compilation unit.
#[derive(Debug, Default)]
pub struct AbbrevTable {
    abbrevs: HashMap<u64, Abbrev>,
}

impl AbbrevTable {
    /// Parse the table starting at `offset` in `.debug_abbrev`, up to its
    /// terminating zero code.
    pub fn parse(debug_abbrev: &[u8], offset: u64, endian: Endian) -> Result<AbbrevTable> {
        let mut reader = ByteReader::new(debug_abbrev, endian);
        reader.seek(offset)?;

        let mut abbrevs = HashMap::new();
        loop {
            let code = reader.read_uleb128()?;
            if code == 0 {
                return Ok(AbbrevTable { abbrevs });
            }
            let tag = DwTag(reader.read_uleb128()?);
            let has_children = match DwChildren(reader.read_u8()?) {
                crate::constants::DW_children_no => false,
                crate::constants::DW_children_yes => true,
                _ => return Err(Truncated),
            };
            let mut attrs = Vec::new();
            loop {
                let name = reader.read_uleb128()?;
                let form = reader.read_uleb128()?;
                if name == 0 && form == 0 {
                    break;
                }
                let form = DwForm(form);
                let implicit_const = if form == DW_FORM_implicit_const {
                    Some(reader.read_sleb128()?)
                } else {
                    None
                };
                attrs.push(AbbrevAttr {
                    name: DwAt(name),
                    form,
                    implicit_const,
                });
            }
            abbrevs.insert(
                code,
                Abbrev {
                    code,
                    tag,
                    has_children,
                    attrs,
                },
            );
        }
    }

    pub fn get(&self, code: u64) -> Option<&Abbrev> {
        self.abbrevs.get(&code)
    }

    pub fn len(&self) -> usize {
        self.abbrevs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.abbrevs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::*;

    #[test]
    fn parse_simple_table() {
        // code 1: DW_TAG_compile_unit, children, [DW_AT_name: DW_FORM_string]
        let bytes = [
            0x01, 0x11, 0x01, 0x03, 0x08, 0x00, 0x00, // abbrev 1
            0x00, // end of table
        ];
        let table = AbbrevTable::parse(&bytes, 0, Endian::Little).unwrap();
        assert_eq!(table.len(), 1);
        let abbrev = table.get(1).unwrap();
        assert_eq!(abbrev.tag, DW_TAG_compile_unit);
        assert!(abbrev.has_children);
        assert_eq!(
            abbrev.attrs,
            vec![AbbrevAttr {
                name: DW_AT_name,
                form: DW_FORM_string,
                implicit_const: None,
            }]
        );
        assert!(table.get(2).is_none());
    }

    #[test]
    fn implicit_const_payload_lives_in_the_abbrev() {
        let bytes = [
            0x01, 0x2e, 0x00, // code 1, DW_TAG_subprogram, no children
            0x03, 0x21, 0x7f, // DW_AT_name, DW_FORM_implicit_const, -1
            0x00, 0x00, // end of attrs
            0x00, // end of table
        ];
        let table = AbbrevTable::parse(&bytes, 0, Endian::Little).unwrap();
        let abbrev = table.get(1).unwrap();
        assert_eq!(abbrev.attrs[0].implicit_const, Some(-1));
    }

    #[test]
    fn truncated_table() {
        let bytes = [0x01, 0x11, 0x01, 0x03];
        assert!(AbbrevTable::parse(&bytes, 0, Endian::Little).is_err());
    }

    #[test]
    fn parse_at_offset() {
        let bytes = [
            0xaa, 0xbb, // padding for another unit's table
            0x01, 0x3c, 0x00, 0x00, 0x00, // code 1, DW_TAG_partial_unit, no attrs
            0x00,
        ];
        let table = AbbrevTable::parse(&bytes, 2, Endian::Little).unwrap();
        assert_eq!(table.get(1).unwrap().tag, DW_TAG_partial_unit);
    }
}
