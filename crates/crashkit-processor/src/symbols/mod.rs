//! Symbol plumbing: the provider/supplier traits and a caching
//! symbolizer.
//!
//! The processor is generic over a [`SymbolProvider`], which answers two
//! questions per frame: "what source location is this instruction?"
//! (`fill_symbol`) and "how do I unwind out of this frame with CFI?"
//! (`walk_frame`). [`Symbolizer`] is the standard provider: it maps
//! modules to symbol files through a [`SymbolSupplier`] and caches the
//! result per module for the duration of one dump.

mod sym_file;
pub(crate) mod walker;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::PathBuf;

use minidump::Module;
use thiserror::Error;
use tracing::{debug, trace};

pub use sym_file::{CfiRules, PublicSymbol, SourceLine, StackInfoCfi, SymFunction, SymbolFile};

/// Receives the source location of one frame.
pub trait FrameSymbolizer {
    /// The instruction address to symbolize.
    fn get_instruction(&self) -> u64;
    fn set_function(&mut self, name: &str, base: u64, parameter_size: u32);
    fn set_source_file(&mut self, file: &str, line: u32, base: u64);
}

/// Callee state reads and caller state writes for one CFI unwind.
pub trait FrameWalker {
    /// The instruction address being unwound from.
    fn get_instruction(&self) -> u64;
    fn has_grand_callee(&self) -> bool;
    fn get_grand_callee_parameter_size(&self) -> u32;
    /// Read a pointer-sized value from stack memory.
    fn get_register_at_address(&self, address: u64) -> Option<u64>;
    fn get_callee_register(&self, name: &str) -> Option<u64>;
    fn set_caller_register(&mut self, name: &str, val: u64) -> Option<()>;
    fn clear_caller_register(&mut self, name: &str);
    /// Set the caller's canonical frame address (becomes its stack pointer).
    fn set_cfa(&mut self, val: u64) -> Option<()>;
    /// Set the caller's return address (becomes its instruction pointer).
    fn set_ra(&mut self, val: u64) -> Option<()>;
}

/// Why a module's symbols could not be used.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SymbolError {
    #[error("symbol file not found")]
    NotFound,
    #[error("parse error: {0} at line {1}")]
    ParseError(&'static str, u64),
    #[error("symbol loading was interrupted")]
    Interrupted,
}

/// `fill_symbol` failed: there are no symbols for the module at all.
#[derive(Clone, Copy, Debug, Default, Error)]
#[error("no symbols for module")]
pub struct FillSymbolError;

/// Per-module outcome counters, keyed by code-file leafname.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SymbolStats {
    /// A symbol file was found and parsed.
    pub loaded_symbols: bool,
    /// A symbol file was found but could not be parsed.
    pub corrupt_symbols: bool,
}

/// Source of per-frame symbolication during a walk.
pub trait SymbolProvider {
    fn fill_symbol(
        &self,
        module: &dyn Module,
        frame: &mut dyn FrameSymbolizer,
    ) -> Result<(), FillSymbolError>;

    fn walk_frame(&self, module: &dyn Module, walker: &mut dyn FrameWalker) -> Option<()>;

    fn stats(&self) -> HashMap<String, SymbolStats> {
        HashMap::new()
    }

    /// Whether any symbol fetch was interrupted; the processor reports
    /// this as `SymbolSupplierInterrupted` once all threads are walked.
    fn was_interrupted(&self) -> bool {
        false
    }
}

/// Maps a module to its symbol file. Implementations own the lookup
/// policy (disk layout, in-memory fixtures, remote stores); each call is
/// independent and returns owned data.
pub trait SymbolSupplier {
    fn locate_symbols(&self, module: &dyn Module) -> Result<SymbolFile, SymbolError>;
}

/// The standard [`SymbolProvider`]: one [`SymbolSupplier`] plus a
/// per-module cache of fetch outcomes.
///
/// Not `Sync`: a symbolizer serves a single `process` invocation (the
/// core is single-threaded per dump).
pub struct Symbolizer {
    supplier: Box<dyn SymbolSupplier>,
    cache: RefCell<HashMap<String, Result<SymbolFile, SymbolError>>>,
    interrupted: Cell<bool>,
}

impl Symbolizer {
    pub fn new<S: SymbolSupplier + 'static>(supplier: S) -> Symbolizer {
        Symbolizer {
            supplier: Box::new(supplier),
            cache: RefCell::new(HashMap::new()),
            interrupted: Cell::new(false),
        }
    }

    fn with_symbols<T>(
        &self,
        module: &dyn Module,
        operate: impl FnOnce(&SymbolFile) -> T,
    ) -> Option<T> {
        let key = module.code_file().into_owned();
        let mut cache = self.cache.borrow_mut();
        let entry = cache
            .entry(key)
            .or_insert_with(|| self.supplier.locate_symbols(module));
        match entry {
            Ok(file) => Some(operate(file)),
            Err(SymbolError::Interrupted) => {
                self.interrupted.set(true);
                None
            }
            Err(_) => None,
        }
    }
}

impl SymbolProvider for Symbolizer {
    fn fill_symbol(
        &self,
        module: &dyn Module,
        frame: &mut dyn FrameSymbolizer,
    ) -> Result<(), FillSymbolError> {
        self.with_symbols(module, |file| file.fill_symbol(module, frame))
            .ok_or(FillSymbolError)
    }

    fn walk_frame(&self, module: &dyn Module, walker: &mut dyn FrameWalker) -> Option<()> {
        self.with_symbols(module, |file| file.walk_frame(module, walker))
            .flatten()
    }

    fn stats(&self) -> HashMap<String, SymbolStats> {
        self.cache
            .borrow()
            .iter()
            .map(|(code_file, outcome)| {
                let stats = match outcome {
                    Ok(_) => SymbolStats {
                        loaded_symbols: true,
                        corrupt_symbols: false,
                    },
                    Err(SymbolError::ParseError(..)) => SymbolStats {
                        loaded_symbols: false,
                        corrupt_symbols: true,
                    },
                    Err(_) => SymbolStats::default(),
                };
                (leafname(code_file).to_string(), stats)
            })
            .collect()
    }

    fn was_interrupted(&self) -> bool {
        self.interrupted.get()
    }
}

/// The file name at the end of a path, whichever slash convention it uses.
fn leafname(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// `<debug-file>/<debug-id>/<debug-file-stem>.sym`, the layout used by
/// symbol stores.
fn relative_symbol_path(module: &dyn Module) -> Option<String> {
    let debug_file = module.debug_file()?;
    let debug_id = module.debug_identifier()?;
    let leaf = leafname(&debug_file);
    let stem = leaf.strip_suffix(".pdb").unwrap_or(leaf);
    Some(format!("{}/{}/{}.sym", leaf, debug_id.breakpad(), stem))
}

/// Looks for symbol files under a list of local directories.
pub struct SimpleSymbolSupplier {
    paths: Vec<PathBuf>,
}

impl SimpleSymbolSupplier {
    pub fn new(paths: Vec<PathBuf>) -> SimpleSymbolSupplier {
        SimpleSymbolSupplier { paths }
    }
}

impl SymbolSupplier for SimpleSymbolSupplier {
    fn locate_symbols(&self, module: &dyn Module) -> Result<SymbolFile, SymbolError> {
        let relative = relative_symbol_path(module).ok_or(SymbolError::NotFound)?;
        for path in &self.paths {
            let candidate = path.join(&relative);
            if candidate.is_file() {
                trace!("loading symbols from {}", candidate.display());
                let bytes = std::fs::read(&candidate).map_err(|_| SymbolError::NotFound)?;
                return SymbolFile::from_bytes(&bytes);
            }
        }
        debug!(module = %module.code_file(), "no symbol file found");
        Err(SymbolError::NotFound)
    }
}

/// A supplier over in-memory symbol text keyed by code file, for tests.
pub struct StringSymbolSupplier {
    modules: HashMap<String, String>,
}

impl SymbolSupplier for StringSymbolSupplier {
    fn locate_symbols(&self, module: &dyn Module) -> Result<SymbolFile, SymbolError> {
        match self.modules.get(module.code_file().as_ref()) {
            Some(text) => SymbolFile::from_str(text),
            None => Err(SymbolError::NotFound),
        }
    }
}

/// Convenience constructor for [`SimpleSymbolSupplier`].
pub fn simple_symbol_supplier(paths: Vec<PathBuf>) -> SimpleSymbolSupplier {
    SimpleSymbolSupplier::new(paths)
}

/// Convenience constructor for [`StringSymbolSupplier`].
pub fn string_symbol_supplier(modules: HashMap<String, String>) -> StringSymbolSupplier {
    StringSymbolSupplier { modules }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minidump::MinidumpModule;

    struct NoFrame;
    impl FrameSymbolizer for NoFrame {
        fn get_instruction(&self) -> u64 {
            0x40001000
        }
        fn set_function(&mut self, _: &str, _: u64, _: u32) {}
        fn set_source_file(&mut self, _: &str, _: u32, _: u64) {}
    }

    struct InterruptingSupplier;
    impl SymbolSupplier for InterruptingSupplier {
        fn locate_symbols(&self, _: &dyn Module) -> Result<SymbolFile, SymbolError> {
            Err(SymbolError::Interrupted)
        }
    }

    #[test]
    fn interrupt_is_remembered() {
        let symbolizer = Symbolizer::new(InterruptingSupplier);
        let module = MinidumpModule::new(0x40000000, 0x10000, "mod");
        assert!(!symbolizer.was_interrupted());
        assert!(symbolizer.fill_symbol(&module, &mut NoFrame).is_err());
        assert!(symbolizer.was_interrupted());
    }

    #[test]
    fn stats_reflect_outcomes() {
        let mut modules = HashMap::new();
        modules.insert("good".to_string(), "FUNC 1000 10 0 f\n".to_string());
        modules.insert("bad".to_string(), "certainly not symbols".to_string());
        let symbolizer = Symbolizer::new(string_symbol_supplier(modules));

        let good = MinidumpModule::new(0x40000000, 0x10000, "good");
        let bad = MinidumpModule::new(0x50000000, 0x10000, "bad");
        let missing = MinidumpModule::new(0x60000000, 0x10000, "missing");
        let _ = symbolizer.fill_symbol(&good, &mut NoFrame);
        let _ = symbolizer.fill_symbol(&bad, &mut NoFrame);
        let _ = symbolizer.fill_symbol(&missing, &mut NoFrame);

        let stats = symbolizer.stats();
        assert!(stats["good"].loaded_symbols);
        assert!(stats["bad"].corrupt_symbols);
        assert!(!stats["missing"].loaded_symbols);
        assert!(!stats["missing"].corrupt_symbols);
    }

    #[test]
    fn symbol_store_layout() {
        let module = MinidumpModule::new(0x1000, 0x1000, "test.dll");
        // No debug info on the module: no path to try.
        assert_eq!(relative_symbol_path(&module), None);
    }
}
