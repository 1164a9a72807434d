//! Parsing and querying of textual symbol files.
//!
//! The parser accepts the record types the processor consumes: `MODULE`,
//! `INFO`, `FILE`, `FUNC`, source-line, `PUBLIC`, and `STACK CFI`.
//! `INLINE`/`INLINE_ORIGIN` and `STACK WIN` records are recognized and
//! skipped. Anything else is a parse error, which the symbolizer records
//! as corrupt symbols for the module.

use std::collections::HashMap;

use minidump::Module;
use tracing::trace;

use crate::symbols::walker::walk_with_stack_cfi;
use crate::symbols::{FrameSymbolizer, FrameWalker, SymbolError};

/// One `STACK CFI` line: the rule string taking effect at `address`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CfiRules {
    pub address: u64,
    pub rules: String,
}

/// A `STACK CFI INIT` record with its delta records.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackInfoCfi {
    pub init: CfiRules,
    pub size: u64,
    /// Deltas in ascending address order.
    pub add_rules: Vec<CfiRules>,
}

impl StackInfoCfi {
    fn contains(&self, address: u64) -> bool {
        address >= self.init.address && address - self.init.address < self.size
    }
}

#[derive(Clone, Debug)]
pub struct SourceLine {
    pub address: u64,
    pub size: u64,
    pub file: u32,
    pub line: u32,
}

#[derive(Clone, Debug)]
pub struct SymFunction {
    pub address: u64,
    pub size: u64,
    pub parameter_size: u32,
    pub name: String,
    /// Ascending by address.
    pub lines: Vec<SourceLine>,
}

impl SymFunction {
    fn contains(&self, address: u64) -> bool {
        address >= self.address && address - self.address < self.size
    }
}

#[derive(Clone, Debug)]
pub struct PublicSymbol {
    pub address: u64,
    pub parameter_size: u32,
    pub name: String,
}

/// The parsed contents of one module's symbol file.
#[derive(Clone, Debug, Default)]
pub struct SymbolFile {
    pub files: HashMap<u32, String>,
    /// Ascending by address.
    pub functions: Vec<SymFunction>,
    /// Ascending by address.
    pub publics: Vec<PublicSymbol>,
    /// Ascending by entry address.
    pub cfi_stack_info: Vec<StackInfoCfi>,
}

impl SymbolFile {
    pub fn from_bytes(bytes: &[u8]) -> Result<SymbolFile, SymbolError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| SymbolError::ParseError("symbol file is not valid UTF-8", 0))?;
        Self::from_str(text)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(text: &str) -> Result<SymbolFile, SymbolError> {
        let mut file = SymbolFile::default();
        let mut parser = Parser::new(&mut file);
        for (index, line) in text.lines().enumerate() {
            parser
                .line(line)
                .ok_or(SymbolError::ParseError("malformed record", index as u64 + 1))?;
        }
        parser.finish();

        file.functions.sort_by_key(|f| f.address);
        for function in &mut file.functions {
            function.lines.sort_by_key(|l| l.address);
        }
        file.publics.sort_by_key(|p| p.address);
        file.cfi_stack_info.sort_by_key(|c| c.init.address);
        for cfi in &mut file.cfi_stack_info {
            cfi.add_rules.sort_by_key(|r| r.address);
        }
        Ok(file)
    }

    /// Fill `frame` with the function, and when known the file and line,
    /// covering its instruction. Looks at `FUNC` records first and falls
    /// back to the nearest preceding `PUBLIC`.
    pub fn fill_symbol(&self, module: &dyn Module, frame: &mut dyn FrameSymbolizer) {
        let relative = frame.get_instruction().wrapping_sub(module.base_address());

        let function = match self
            .functions
            .partition_point(|f| f.address <= relative)
            .checked_sub(1)
            .map(|i| &self.functions[i])
        {
            Some(function) if function.contains(relative) => Some(function),
            _ => None,
        };

        if let Some(function) = function {
            frame.set_function(
                &function.name,
                function.address + module.base_address(),
                function.parameter_size,
            );
            let line = function
                .lines
                .partition_point(|l| l.address <= relative)
                .checked_sub(1)
                .map(|i| &function.lines[i]);
            if let Some(line) = line {
                if relative - line.address < line.size {
                    let file = self.files.get(&line.file).map(String::as_str).unwrap_or("");
                    frame.set_source_file(file, line.line, line.address + module.base_address());
                }
            }
            return;
        }

        if let Some(public) = self
            .publics
            .partition_point(|p| p.address <= relative)
            .checked_sub(1)
            .map(|i| &self.publics[i])
        {
            frame.set_function(
                &public.name,
                public.address + module.base_address(),
                public.parameter_size,
            );
        }
    }

    /// Drive a CFI unwind of the walker's frame. `None` when no CFI
    /// covers the instruction or evaluation fails.
    pub fn walk_frame(&self, module: &dyn Module, walker: &mut dyn FrameWalker) -> Option<()> {
        let relative = walker.get_instruction().wrapping_sub(module.base_address());
        let cfi = self
            .cfi_stack_info
            .partition_point(|c| c.init.address <= relative)
            .checked_sub(1)
            .map(|i| &self.cfi_stack_info[i])?;
        if !cfi.contains(relative) {
            return None;
        }
        let end = cfi
            .add_rules
            .partition_point(|rules| rules.address <= relative);
        trace!(
            "unwinding with STACK CFI INIT {:x} ({} deltas apply)",
            cfi.init.address,
            end
        );
        walk_with_stack_cfi(&cfi.init, &cfi.add_rules[..end], walker)
    }
}

/// Line-oriented parser; `STACK CFI` deltas attach to the preceding
/// `STACK CFI INIT`, so one record of state is carried between lines.
struct Parser<'a> {
    file: &'a mut SymbolFile,
    current_function: Option<SymFunction>,
    current_cfi: Option<StackInfoCfi>,
}

impl<'a> Parser<'a> {
    fn new(file: &'a mut SymbolFile) -> Parser<'a> {
        Parser {
            file,
            current_function: None,
            current_cfi: None,
        }
    }

    fn line(&mut self, line: &str) -> Option<()> {
        let line = line.trim_end();
        if line.is_empty() {
            return Some(());
        }

        if let Some(rest) = line.strip_prefix("MODULE ") {
            // MODULE os cpu id name. Nothing to retain, but it must be shaped right.
            let mut it = rest.splitn(4, ' ');
            it.next()?;
            it.next()?;
            it.next()?;
            it.next()?;
            return Some(());
        }
        if line.strip_prefix("INFO ").is_some() {
            return Some(());
        }
        if let Some(rest) = line.strip_prefix("FILE ") {
            let (id, name) = rest.split_once(' ')?;
            let id: u32 = id.parse().ok()?;
            self.file.files.insert(id, name.to_string());
            return Some(());
        }
        if line.strip_prefix("INLINE_ORIGIN ").is_some()
            || line.strip_prefix("INLINE ").is_some()
        {
            return Some(());
        }
        if let Some(rest) = line.strip_prefix("FUNC ") {
            let rest = rest.strip_prefix("m ").unwrap_or(rest);
            let mut it = rest.splitn(4, ' ');
            let address = hex(it.next()?)?;
            let size = hex(it.next()?)?;
            let parameter_size = hex(it.next()?)? as u32;
            let name = it.next().unwrap_or("<name omitted>").to_string();
            self.flush_function();
            self.current_function = Some(SymFunction {
                address,
                size,
                parameter_size,
                name,
                lines: Vec::new(),
            });
            return Some(());
        }
        if let Some(rest) = line.strip_prefix("PUBLIC ") {
            let rest = rest.strip_prefix("m ").unwrap_or(rest);
            let mut it = rest.splitn(3, ' ');
            let address = hex(it.next()?)?;
            let parameter_size = hex(it.next()?)? as u32;
            let name = it.next().unwrap_or("<name omitted>").to_string();
            self.file.publics.push(PublicSymbol {
                address,
                parameter_size,
                name,
            });
            return Some(());
        }
        if let Some(rest) = line.strip_prefix("STACK CFI INIT ") {
            let mut it = rest.splitn(3, ' ');
            let address = hex(it.next()?)?;
            let size = hex(it.next()?)?;
            let rules = it.next().unwrap_or("").to_string();
            self.flush_cfi();
            self.current_cfi = Some(StackInfoCfi {
                init: CfiRules { address, rules },
                size,
                add_rules: Vec::new(),
            });
            return Some(());
        }
        if let Some(rest) = line.strip_prefix("STACK CFI ") {
            let (address, rules) = rest.split_once(' ')?;
            let address = hex(address)?;
            self.current_cfi.as_mut()?.add_rules.push(CfiRules {
                address,
                rules: rules.to_string(),
            });
            return Some(());
        }
        if line.strip_prefix("STACK WIN ").is_some() {
            // Windows FPO/framedata records are not used by this walker.
            return Some(());
        }

        // Source-line records have no keyword: "address size line file_id".
        if let Some(function) = self.current_function.as_mut() {
            let mut it = line.split_ascii_whitespace();
            let address = hex(it.next()?)?;
            let size = hex(it.next()?)?;
            let number: u32 = it.next()?.parse().ok()?;
            let file: u32 = it.next()?.parse().ok()?;
            function.lines.push(SourceLine {
                address,
                size,
                file,
                line: number,
            });
            return Some(());
        }

        None
    }

    fn flush_function(&mut self) {
        if let Some(function) = self.current_function.take() {
            self.file.functions.push(function);
        }
    }

    fn flush_cfi(&mut self) {
        if let Some(cfi) = self.current_cfi.take() {
            self.file.cfi_stack_info.push(cfi);
        }
    }

    fn finish(&mut self) {
        self.flush_function();
        self.flush_cfi();
    }
}

fn hex(s: &str) -> Option<u64> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16).ok()
}
