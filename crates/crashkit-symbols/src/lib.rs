//! In-memory symbol model and Breakpad symbol-file writer.
//!
//! A [`Module`] holds everything a symbol file can say about one binary:
//! functions with their source lines and inline call trees, public
//! symbols, and STACK CFI unwind entries. [`ModuleCollector`] fills a
//! module from DWARF via the `crashkit-dwarf` reader, and
//! [`Module::write`] serializes it deterministically.

mod dwarf;
mod module;
mod writer;

pub use dwarf::ModuleCollector;
pub use module::{
    Extern, File, FileId, Function, Inline, InlineOrigin, InlineOriginId, Line, Module, Range,
    RuleMap, StackFrameEntry,
};
