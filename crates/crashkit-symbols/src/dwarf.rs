//! Populating a [`Module`] from DWARF debugging information.
//!
//! [`ModuleCollector`] implements the reader's push interface and gathers
//! `DW_TAG_subprogram` DIEs: code ranges (from `DW_AT_low_pc`/`high_pc`
//! or `DW_AT_ranges`) and names, preferring the linkage name and chasing
//! same-unit `DW_AT_specification` / `DW_AT_abstract_origin` references.
//! Declarations carry no code and are dropped.

use std::collections::HashMap;

use tracing::debug;

use crashkit_dwarf::constants::*;
use crashkit_dwarf::{
    CuRangesInfo, DwarfHandler, DwarfSections, Endian, RangeListHandler, RangeListReader,
};

use crate::module::{Function, Module, Range};

fn is_address_form(form: DwForm) -> bool {
    matches!(
        form,
        DW_FORM_addr | DW_FORM_addrx | DW_FORM_addrx1 | DW_FORM_addrx2 | DW_FORM_addrx3
            | DW_FORM_addrx4
    )
}

#[derive(Default)]
struct NameRecord {
    name: Option<String>,
    linkage_name: Option<String>,
    specification: Option<u64>,
    abstract_origin: Option<u64>,
}

#[derive(Default)]
struct SubprogramRecord {
    low_pc: Option<u64>,
    high_pc: Option<(DwForm, u64)>,
    ranges: Option<(DwForm, u64)>,
    declaration: bool,
}

/// Builds module functions out of one or more compilation units.
///
/// Drive a `CompilationUnit` with this as the handler for every unit in
/// `.debug_info`, then call [`ModuleCollector::finish`].
pub struct ModuleCollector<'a, 'm> {
    sections: DwarfSections<'a>,
    endian: Endian,
    module: &'m mut Module,

    version: u16,
    address_size: u8,
    offset_size: u8,
    root_offset: Option<u64>,
    cu_base_address: u64,
    rnglists_base: Option<u64>,
    addr_base: Option<u64>,

    names: HashMap<u64, NameRecord>,
    subprograms: HashMap<u64, SubprogramRecord>,
    subprogram_order: Vec<u64>,
}

impl<'a, 'm> ModuleCollector<'a, 'm> {
    pub fn new(
        sections: DwarfSections<'a>,
        endian: Endian,
        module: &'m mut Module,
    ) -> ModuleCollector<'a, 'm> {
        ModuleCollector {
            sections,
            endian,
            module,
            version: 0,
            address_size: 0,
            offset_size: 0,
            root_offset: None,
            cu_base_address: 0,
            rnglists_base: None,
            addr_base: None,
            names: HashMap::new(),
            subprograms: HashMap::new(),
            subprogram_order: Vec::new(),
        }
    }

    /// Resolve collected subprograms into module functions.
    pub fn finish(mut self) {
        let order = std::mem::take(&mut self.subprogram_order);
        for offset in order {
            let record = &self.subprograms[&offset];
            if record.declaration {
                continue;
            }
            let Some(name) = self.resolve_name(offset) else {
                debug!(offset, "subprogram without a resolvable name");
                continue;
            };
            let ranges = self.resolve_ranges(&self.subprograms[&offset]);
            if ranges.is_empty() {
                continue;
            }
            let mut function = Function::new(name, ranges[0].address);
            function.ranges = ranges;
            if !self.module.add_function(function) {
                debug!(offset, "dropped function with duplicate ranges");
            }
        }
    }

    /// The subprogram's own linkage name or name, else the target's
    /// through specification/abstract-origin (two hops at most).
    fn resolve_name(&self, offset: u64) -> Option<String> {
        let mut offset = offset;
        for _ in 0..3 {
            let record = self.names.get(&offset)?;
            if let Some(name) = record.linkage_name.as_ref().or(record.name.as_ref()) {
                return Some(name.clone());
            }
            offset = record.specification.or(record.abstract_origin)?;
        }
        None
    }

    fn resolve_ranges(&self, record: &SubprogramRecord) -> Vec<Range> {
        if let Some((form, value)) = record.ranges {
            return self.read_range_list(form, value);
        }
        let low = match record.low_pc {
            Some(low) => low,
            None => return Vec::new(),
        };
        let size = match record.high_pc {
            // Address-class forms hold an absolute end address; constant
            // classes hold the size directly.
            Some((form, high)) if is_address_form(form) => high.saturating_sub(low),
            Some((_, size)) => size,
            None => return Vec::new(),
        };
        if size == 0 {
            return Vec::new();
        }
        vec![Range::new(low, size)]
    }

    fn read_range_list(&self, form: DwForm, value: u64) -> Vec<Range> {
        struct Collect(Vec<Range>);
        impl RangeListHandler for Collect {
            fn add_range(&mut self, begin: u64, end: u64) {
                if end > begin {
                    self.0.push(Range::new(begin, end - begin));
                }
            }
        }

        let info = CuRangesInfo {
            version: self.version,
            base_address: self.cu_base_address,
            ranges_base: self
                .rnglists_base
                .unwrap_or(if self.offset_size == 8 { 20 } else { 12 }),
            addr_base: self
                .addr_base
                .unwrap_or(if self.offset_size == 8 { 16 } else { 8 }),
            buffer: if self.version <= 4 {
                self.sections.debug_ranges
            } else {
                self.sections.debug_rnglists
            },
            addr_buffer: self.sections.debug_addr,
        };
        let mut collect = Collect(Vec::new());
        let mut reader = RangeListReader::new(
            self.endian,
            self.address_size,
            self.offset_size,
            info,
            &mut collect,
        );
        if !reader.read_ranges(form, value) {
            debug!(form = ?form, value, "unreadable range list");
            return Vec::new();
        }
        collect.0
    }
}

impl DwarfHandler for ModuleCollector<'_, '_> {
    fn start_compilation_unit(
        &mut self,
        _offset: u64,
        address_size: u8,
        offset_size: u8,
        _cu_length: u64,
        version: u16,
    ) -> bool {
        self.version = version;
        self.address_size = address_size;
        self.offset_size = offset_size;
        self.root_offset = None;
        self.cu_base_address = 0;
        self.rnglists_base = None;
        self.addr_base = None;
        true
    }

    fn start_die(&mut self, offset: u64, tag: DwTag) -> bool {
        if self.root_offset.is_none() {
            self.root_offset = Some(offset);
        }
        if tag == DW_TAG_subprogram {
            self.subprograms.insert(offset, SubprogramRecord::default());
            self.subprogram_order.push(offset);
        }
        true
    }

    fn attr_unsigned(&mut self, offset: u64, attr: DwAt, form: DwForm, value: u64) {
        match attr {
            // The reader hands the unit bases over ahead of the root DIE
            // (they only ever appear on unit DIEs, so no gate is needed).
            DW_AT_rnglists_base => self.rnglists_base = Some(value),
            DW_AT_addr_base => self.addr_base = Some(value),
            // The unit's base address; functions carry low_pc too, so
            // only the root's counts.
            DW_AT_low_pc if Some(offset) == self.root_offset => self.cu_base_address = value,
            _ => {}
        }
        if let Some(record) = self.subprograms.get_mut(&offset) {
            match attr {
                DW_AT_low_pc => record.low_pc = Some(value),
                DW_AT_high_pc => record.high_pc = Some((form, value)),
                DW_AT_ranges => record.ranges = Some((form, value)),
                DW_AT_declaration => record.declaration = value != 0,
                _ => {}
            }
        }
    }

    fn attr_string(&mut self, offset: u64, attr: DwAt, _form: DwForm, value: &str) {
        let record = self.names.entry(offset).or_default();
        match attr {
            DW_AT_name => record.name = Some(value.to_string()),
            DW_AT_linkage_name | DW_AT_MIPS_linkage_name => {
                record.linkage_name = Some(value.to_string())
            }
            _ => {}
        }
    }

    fn attr_reference(&mut self, offset: u64, attr: DwAt, _form: DwForm, value: u64) {
        let record = self.names.entry(offset).or_default();
        match attr {
            DW_AT_specification => record.specification = Some(value),
            DW_AT_abstract_origin => record.abstract_origin = Some(value),
            _ => {}
        }
    }
}
