//! The in-memory model of a module's symbolic contents.
//!
//! A [`Module`] accumulates functions, source lines, inline call trees,
//! public symbols, and call-frame-info entries, then serializes them
//! deterministically (see the writer). Uniqueness and ordering rules live
//! here; the writer only sorts and prints.

use std::collections::{BTreeMap, HashMap, HashSet};

/// A half-open address interval `[address, address + size)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Range {
    pub address: u64,
    pub size: u64,
}

impl Range {
    pub fn new(address: u64, size: u64) -> Range {
        Range { address, size }
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.address && address - self.address < self.size
    }
}

/// Interned handle to a source file within one module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FileId(pub(crate) usize);

/// Interned handle to an inline-origin name within one module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InlineOriginId(pub(crate) usize);

#[derive(Clone, Debug)]
pub struct File {
    pub name: String,
    /// Assigned by `assign_source_ids`; -1 until then, and stays -1 for
    /// files no emitted line refers to (such files are never written).
    pub source_id: i64,
}

#[derive(Clone, Debug)]
pub struct InlineOrigin {
    pub name: String,
    pub id: i64,
}

/// One machine-code-to-source mapping.
#[derive(Clone, Copy, Debug)]
pub struct Line {
    pub address: u64,
    pub size: u64,
    pub file: FileId,
    pub number: u32,
}

/// A node of a function's inlined-call forest.
#[derive(Clone, Debug)]
pub struct Inline {
    pub origin: InlineOriginId,
    pub call_file: FileId,
    pub call_line: u32,
    /// Nesting depth; direct inlinees of the function body are depth 0.
    pub depth: u32,
    pub ranges: Vec<Range>,
    pub children: Vec<Inline>,
}

#[derive(Clone, Debug)]
pub struct Function {
    pub name: String,
    /// Primary address; equals `ranges[0].address`.
    pub address: u64,
    pub ranges: Vec<Range>,
    pub parameter_size: u64,
    pub lines: Vec<Line>,
    pub inlines: Vec<Inline>,
}

impl Function {
    pub fn new(name: impl Into<String>, address: u64) -> Function {
        Function {
            name: name.into(),
            address,
            ranges: Vec::new(),
            parameter_size: 0,
            lines: Vec::new(),
            inlines: Vec::new(),
        }
    }
}

/// A public (linker-visible) symbol.
#[derive(Clone, Debug)]
pub struct Extern {
    pub address: u64,
    pub name: String,
    pub parameter_size: u64,
}

impl Extern {
    pub fn new(address: u64, name: impl Into<String>) -> Extern {
        Extern {
            address,
            name: name.into(),
            parameter_size: 0,
        }
    }
}

pub type RuleMap = BTreeMap<String, String>;

/// Call-frame-info for one address range: register-recovery rules at the
/// entry address plus per-address rule deltas within the range.
///
/// Both maps are ordered so serialization is deterministic: initial rules
/// lexicographically by register name, deltas by address.
#[derive(Clone, Debug, Default)]
pub struct StackFrameEntry {
    pub address: u64,
    pub size: u64,
    pub initial_rules: RuleMap,
    pub rule_changes: BTreeMap<u64, RuleMap>,
}

/// A module's symbolic contents.
pub struct Module {
    pub(crate) name: String,
    pub(crate) os: String,
    pub(crate) arch: String,
    pub(crate) id: String,
    pub(crate) code_id: Option<String>,
    pub(crate) load_address: u64,
    pub(crate) preserve_load_address: bool,
    pub(crate) enable_multiple: bool,
    pub(crate) prefer_extern_name: bool,
    pub(crate) address_ranges: Option<Vec<Range>>,

    pub(crate) files: Vec<File>,
    file_index: HashMap<String, usize>,
    pub(crate) inline_origins: Vec<InlineOrigin>,
    origin_index: HashMap<String, usize>,

    pub(crate) functions: Vec<Function>,
    function_range_sets: HashSet<Vec<Range>>,
    /// Addresses where more than one function (or a rejected duplicate)
    /// landed; drives the `m` marker.
    pub(crate) shared_function_addresses: HashSet<u64>,

    pub(crate) externs: BTreeMap<u64, Extern>,
    pub(crate) shared_extern_addresses: HashSet<u64>,

    pub(crate) stack_frame_entries: Vec<StackFrameEntry>,
}

impl Module {
    pub fn new(
        name: impl Into<String>,
        os: impl Into<String>,
        arch: impl Into<String>,
        id: impl Into<String>,
    ) -> Module {
        Module {
            name: name.into(),
            os: os.into(),
            arch: arch.into(),
            id: id.into(),
            code_id: None,
            load_address: 0,
            preserve_load_address: false,
            enable_multiple: false,
            prefer_extern_name: false,
            address_ranges: None,
            files: Vec::new(),
            file_index: HashMap::new(),
            inline_origins: Vec::new(),
            origin_index: HashMap::new(),
            functions: Vec::new(),
            function_range_sets: HashSet::new(),
            shared_function_addresses: HashSet::new(),
            externs: BTreeMap::new(),
            shared_extern_addresses: HashSet::new(),
            stack_frame_entries: Vec::new(),
        }
    }

    pub fn set_code_id(&mut self, code_id: impl Into<String>) {
        self.code_id = Some(code_id.into());
    }

    /// Mark addresses shared by several symbols with `m` in the output.
    pub fn set_enable_multiple(&mut self, enable: bool) {
        self.enable_multiple = enable;
    }

    /// When a function and an extern share an address, emit the function
    /// under the extern's name.
    pub fn set_prefer_extern_name(&mut self, prefer: bool) {
        self.prefer_extern_name = prefer;
    }

    /// The runtime base the module was linked or loaded at. Unless
    /// `preserve_load_address` is set, every written address is rebased
    /// by subtracting this.
    pub fn set_load_address(&mut self, address: u64) {
        self.load_address = address;
    }

    pub fn set_preserve_load_address(&mut self, preserve: bool) {
        self.preserve_load_address = preserve;
    }

    /// Restrict output to items whose primary address falls inside one of
    /// `ranges` (checked before any load-address rebasing).
    pub fn set_address_ranges(&mut self, ranges: Vec<Range>) {
        self.address_ranges = Some(ranges);
    }

    /// Intern `name`, creating the file record on first sight.
    pub fn find_file(&mut self, name: &str) -> FileId {
        if let Some(&index) = self.file_index.get(name) {
            return FileId(index);
        }
        let index = self.files.len();
        self.files.push(File {
            name: name.to_string(),
            source_id: -1,
        });
        self.file_index.insert(name.to_string(), index);
        FileId(index)
    }

    pub fn find_existing_file(&self, name: &str) -> Option<FileId> {
        self.file_index.get(name).map(|&index| FileId(index))
    }

    pub fn file_name(&self, id: FileId) -> &str {
        &self.files[id.0].name
    }

    pub fn files(&self) -> &[File] {
        &self.files
    }

    /// Intern an inline-origin (the inlined function's own name).
    pub fn find_inline_origin(&mut self, name: &str) -> InlineOriginId {
        if let Some(&index) = self.origin_index.get(name) {
            return InlineOriginId(index);
        }
        let index = self.inline_origins.len();
        self.inline_origins.push(InlineOrigin {
            name: name.to_string(),
            id: -1,
        });
        self.origin_index.insert(name.to_string(), index);
        InlineOriginId(index)
    }

    /// Add a function. Returns `false` (and keeps the module unchanged)
    /// if a function with a pairwise-identical range set already exists;
    /// the colliding address is remembered for the `m` marker. Functions
    /// that share a primary address but differ in ranges are all
    /// retained; the writer keeps one per address.
    pub fn add_function(&mut self, function: Function) -> bool {
        debug_assert!(!function.ranges.is_empty());
        if !self.function_range_sets.insert(function.ranges.clone()) {
            self.shared_function_addresses.insert(function.address);
            return false;
        }
        if self.functions.iter().any(|f| f.address == function.address) {
            self.shared_function_addresses.insert(function.address);
        }
        self.functions.push(function);
        true
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    /// Add a public symbol. The first extern at an address wins;
    /// duplicates are dropped and the address remembered for `m`.
    ///
    /// On ARM, Thumb externs carry the low bit of the address as a mode
    /// flag while the DWARF function lives at the even address. The two
    /// are distinct addresses on purpose and are never merged.
    pub fn add_extern(&mut self, ext: Extern) {
        use std::collections::btree_map::Entry;
        match self.externs.entry(ext.address) {
            Entry::Occupied(_) => {
                self.shared_extern_addresses.insert(ext.address);
            }
            Entry::Vacant(slot) => {
                slot.insert(ext);
            }
        }
    }

    pub fn externs(&self) -> impl Iterator<Item = &Extern> {
        self.externs.values()
    }

    pub fn add_stack_frame_entry(&mut self, entry: StackFrameEntry) {
        self.stack_frame_entries.push(entry);
    }

    pub fn stack_frame_entries(&self) -> &[StackFrameEntry] {
        &self.stack_frame_entries
    }

    pub(crate) fn address_is_in_ranges(&self, address: u64) -> bool {
        match &self.address_ranges {
            None => true,
            Some(ranges) => ranges.iter().any(|r| r.contains(address)),
        }
    }

    /// Indices of the functions the writer will emit: inside the address
    /// allow-list, one per primary address (first added wins), ordered by
    /// primary address.
    pub(crate) fn emitted_functions(&self) -> Vec<usize> {
        let mut seen = HashSet::new();
        let mut indices: Vec<usize> = Vec::new();
        for (index, function) in self.functions.iter().enumerate() {
            if !self.address_is_in_ranges(function.address) {
                continue;
            }
            if seen.insert(function.address) {
                indices.push(index);
            }
        }
        indices.sort_by_key(|&index| self.functions[index].address);
        indices
    }

    /// Assign `source_id`s to the files referenced by emitted lines:
    /// referenced files get 0, 1, 2, … in lexicographic filename order,
    /// everything else stays -1. Inline-origin ids are assigned the same
    /// way. Idempotent; the writer invokes it.
    pub fn assign_source_ids(&mut self) {
        for file in &mut self.files {
            file.source_id = -1;
        }
        for origin in &mut self.inline_origins {
            origin.id = -1;
        }

        let emitted = self.emitted_functions();

        let mut used_files = HashSet::new();
        let mut used_origins = HashSet::new();
        for &index in &emitted {
            let function = &self.functions[index];
            for line in &function.lines {
                used_files.insert(line.file.0);
            }
            fn visit(inlines: &[Inline], used_origins: &mut HashSet<usize>) {
                for inline in inlines {
                    used_origins.insert(inline.origin.0);
                    visit(&inline.children, used_origins);
                }
            }
            visit(&function.inlines, &mut used_origins);
        }

        let mut file_order: Vec<usize> = used_files.into_iter().collect();
        file_order.sort_by(|&a, &b| self.files[a].name.cmp(&self.files[b].name));
        for (id, index) in file_order.into_iter().enumerate() {
            self.files[index].source_id = id as i64;
        }

        let mut origin_order: Vec<usize> = used_origins.into_iter().collect();
        origin_order.sort_by(|&a, &b| self.inline_origins[a].name.cmp(&self.inline_origins[b].name));
        for (id, index) in origin_order.into_iter().enumerate() {
            self.inline_origins[index].id = id as i64;
        }
    }
}
