//! The result of processing one minidump.

use minidump::{MinidumpModuleList, MinidumpUnloadedModuleList};
use serde::Serialize;

use crate::hex;
use crate::system_info::SystemInfo;
use crate::CallStack;

/// Why a thread's stack could not be walked (or that it could).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallStackInfo {
    /// The walk proceeded normally.
    Ok,
    /// The thread had no usable CPU context.
    MissingContext,
    /// No stack memory; only the context frame exists.
    MissingMemory,
    /// No unwinder for this CPU.
    UnsupportedCpu,
    /// This thread wrote the dump and was skipped.
    DumpThreadSkipped,
}

/// The exception record carried in the dump, lightly decoded.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExceptionRecord {
    pub code: u32,
    pub flags: u32,
    #[serde(serialize_with = "hex::serialize_hex")]
    pub nested_exception_record_address: u64,
    #[serde(serialize_with = "hex::serialize_hex")]
    pub address: u64,
    pub parameters: Vec<u64>,
}

/// Exploitability of the crash, as judged by an (optional) external
/// rater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Exploitability {
    High,
    Medium,
    Low,
    Interesting,
    None,
    NotAnalyzed,
    ErrNoEngine,
    ErrProcessing,
}

/// The base address and size of one thread's stack memory region.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MemoryRegionRef {
    #[serde(serialize_with = "hex::serialize_hex")]
    pub base_address: u64,
    pub size: u64,
}

/// Everything recovered from one minidump: per-thread call stacks plus
/// process, crash, and module information.
///
/// A structural processing error leaves a partially populated state;
/// inspect it together with the accompanying
/// [`ProcessResult`](crate::ProcessResult).
#[derive(Debug, Serialize)]
pub struct ProcessState {
    /// The dump's creation time, seconds since the epoch.
    pub time_date_stamp: u32,
    /// When the crashed process started, if the dump recorded it.
    pub process_create_time: Option<u32>,

    /// Whether the dump records an exception (as opposed to a dump taken
    /// of a live process).
    pub crashed: bool,
    /// Normalized crash reason; empty when not crashed. See the
    /// crash-reason tables.
    pub crash_reason: String,
    #[serde(serialize_with = "hex::serialize_hex")]
    pub crash_address: u64,
    pub exception_record: Option<ExceptionRecord>,
    /// Human-readable assertion description, or empty.
    pub assertion: String,

    /// Index into `threads` of the thread that requested the dump, when
    /// known and present.
    pub requesting_thread: Option<usize>,
    /// Thread count before any were skipped.
    pub original_thread_count: usize,
    pub threads: Vec<CallStack>,
    /// Stack memory location per entry of `threads`.
    pub thread_memory_regions: Vec<Option<MemoryRegionRef>>,

    pub system_info: SystemInfo,

    #[serde(skip)]
    pub modules: MinidumpModuleList,
    #[serde(skip)]
    pub unloaded_modules: Option<MinidumpUnloadedModuleList>,
    /// Code files of modules for which no symbols could be found.
    pub modules_without_symbols: Vec<String>,
    /// Code files of modules whose symbols failed to parse.
    pub modules_with_corrupt_symbols: Vec<String>,

    pub exploitability: Exploitability,
}

impl Default for ProcessState {
    fn default() -> ProcessState {
        ProcessState {
            time_date_stamp: 0,
            process_create_time: None,
            crashed: false,
            crash_reason: String::new(),
            crash_address: 0,
            exception_record: None,
            assertion: String::new(),
            requesting_thread: None,
            original_thread_count: 0,
            threads: Vec::new(),
            thread_memory_regions: Vec::new(),
            system_info: SystemInfo::default(),
            modules: MinidumpModuleList::from_modules(Vec::new()),
            unloaded_modules: None,
            modules_without_symbols: Vec::new(),
            modules_with_corrupt_symbols: Vec::new(),
            exploitability: Exploitability::NotAnalyzed,
        }
    }
}
