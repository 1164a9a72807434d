//! The per-dump orchestrator.
//!
//! `process` pulls the typed streams out of a minidump, classifies the
//! crash, and produces one call stack per thread by driving the
//! CPU-appropriate unwinder. Structural problems (no thread list, a
//! duplicated requesting thread) end processing early with a specific
//! result code; per-thread problems (a missing context, unreadable stack
//! memory) only degrade that thread's stack.

use std::fmt;
use std::ops::Deref;

use minidump::system_info::Os;
use minidump::{
    Minidump, MinidumpAssertion, MinidumpBreakpadInfo, MinidumpException, MinidumpMiscInfo,
    MinidumpModuleList, MinidumpRawContext, MinidumpSystemInfo, MinidumpThreadList,
    MinidumpThreadNames, MinidumpUnloadedModuleList, Module, UnifiedMemory,
};
use tracing::{info, warn};

use crate::crash_reason::{self, RawExceptionInfo, SystemContext};
use crate::process_state::{
    CallStackInfo, ExceptionRecord, Exploitability, MemoryRegionRef, ProcessState,
};
use crate::symbols::SymbolProvider;
use crate::system_info::SystemInfo;
use crate::{disassembler, walk_stack, CallStack, WalkerOptions};

const CPU_ARCHITECTURE_AMD64: u16 = 9;

/// The outcome of [`MinidumpProcessor::process`].
///
/// The process state accompanies every result, partially populated on
/// the error codes, so callers can inspect whatever was recovered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessResult {
    /// The dump was processed.
    Ok,
    /// The data does not begin with a minidump header.
    NoMinidumpHeader,
    /// The dump carries no thread list.
    NoThreadList,
    /// The thread-name stream exists but could not be read.
    GettingThreadName,
    /// A thread record could not be read.
    GettingThread,
    /// A thread record carries no usable id.
    GettingThreadId,
    /// More than one thread claims to be the requesting thread.
    DuplicateRequestingThreads,
    /// The symbol supplier asked to interrupt processing.
    SymbolSupplierInterrupted,
}

impl ProcessResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, ProcessResult::Ok)
    }
}

impl fmt::Display for ProcessResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ProcessResult::Ok => "ok",
            ProcessResult::NoMinidumpHeader => "minidump has no header",
            ProcessResult::NoThreadList => "minidump has no thread list",
            ProcessResult::GettingThreadName => "could not read a thread name",
            ProcessResult::GettingThread => "could not read a thread",
            ProcessResult::GettingThreadId => "could not read a thread id",
            ProcessResult::DuplicateRequestingThreads => {
                "minidump has more than one requesting thread"
            }
            ProcessResult::SymbolSupplierInterrupted => "symbol supplier interrupted processing",
        };
        f.write_str(text)
    }
}

/// Hook for an external exploitability engine.
pub trait ExploitabilityRater {
    fn rate(&self, state: &ProcessState) -> Exploitability;
}

/// Processing policy.
pub struct ProcessorOptions {
    /// Walk at most this many threads once the requesting thread has
    /// been encountered.
    pub max_thread_count: Option<usize>,
    /// Permit the stack-scanning unwind fallback.
    pub stack_scan_allowed: bool,
    /// Frame limit per thread.
    pub max_frames: Option<u32>,
    /// Recover non-canonical amd64 fault addresses by disassembling the
    /// faulting instruction with objdump.
    pub enable_objdump: bool,
    /// External exploitability engine; absent leaves the rating
    /// `NotAnalyzed`.
    pub exploitability_rater: Option<Box<dyn ExploitabilityRater>>,
}

impl Default for ProcessorOptions {
    fn default() -> ProcessorOptions {
        ProcessorOptions {
            max_thread_count: None,
            stack_scan_allowed: true,
            max_frames: Some(1024),
            enable_objdump: false,
            exploitability_rater: None,
        }
    }
}

/// Turns minidumps plus a symbol provider into [`ProcessState`]s.
pub struct MinidumpProcessor<'p, P: SymbolProvider> {
    provider: &'p P,
    options: ProcessorOptions,
}

impl<'p, P: SymbolProvider> MinidumpProcessor<'p, P> {
    pub fn new(provider: &'p P) -> MinidumpProcessor<'p, P> {
        MinidumpProcessor {
            provider,
            options: ProcessorOptions::default(),
        }
    }

    pub fn with_options(provider: &'p P, options: ProcessorOptions) -> MinidumpProcessor<'p, P> {
        MinidumpProcessor { provider, options }
    }

    /// Read and process minidump bytes.
    pub fn process_data(&self, data: &[u8]) -> (ProcessState, ProcessResult) {
        match Minidump::read(data) {
            Ok(dump) => self.process(&dump),
            Err(error) => {
                warn!(%error, "unreadable minidump");
                (ProcessState::default(), ProcessResult::NoMinidumpHeader)
            }
        }
    }

    /// Process a parsed minidump.
    pub fn process<'a, T>(&self, dump: &'a Minidump<'a, T>) -> (ProcessState, ProcessResult)
    where
        T: Deref<Target = [u8]> + 'a,
    {
        let mut state = ProcessState::default();
        state.time_date_stamp = dump.header.time_date_stamp;

        let misc: Option<MinidumpMiscInfo> = dump.get_stream().ok();
        state.process_create_time = misc
            .as_ref()
            .and_then(|misc| misc.raw.process_create_time().copied());

        let system_info: Option<MinidumpSystemInfo> = dump.get_stream().ok();
        state.system_info = SystemInfo::from_minidump(system_info.as_ref());

        let breakpad_info: Option<MinidumpBreakpadInfo> = dump.get_stream().ok();
        let dump_thread_id = breakpad_info.as_ref().and_then(|info| info.dump_thread_id);
        let mut requesting_thread_id = breakpad_info
            .as_ref()
            .and_then(|info| info.requesting_thread_id);

        let exception: Option<MinidumpException<'_>> = dump.get_stream().ok();
        if let Some(exception) = &exception {
            state.crashed = true;
            requesting_thread_id = Some(exception.get_crashing_thread_id());

            let record = &exception.raw.exception_record;
            let parameter_count =
                (record.number_parameters as usize).min(record.exception_information.len());
            let parameters = &record.exception_information[..parameter_count];

            let system = system_info.as_ref().map(|info| SystemContext {
                platform_id: info.raw.platform_id,
                cpu_architecture: info.raw.processor_architecture,
            });
            let (reason, address) = crash_reason::crash_reason_and_address(
                system,
                &RawExceptionInfo {
                    code: record.exception_code,
                    flags: record.exception_flags,
                    address: record.exception_address,
                    parameters,
                },
            );
            state.crash_reason = reason;
            state.crash_address = address;

            // The Linux kernel reports non-canonical amd64 faults with
            // an all-ones address; the disassembly of the faulting
            // instruction can recover the real one. Other OSes use the
            // same value for unrelated conditions, so they are excluded.
            if self.options.enable_objdump
                && state.crash_address == u64::MAX
                && state.system_info.os_id == Os::Linux
                && system.map(|s| s.cpu_architecture) == Some(CPU_ARCHITECTURE_AMD64)
            {
                if let Some(address) = self.fault_address_from_instruction(
                    dump,
                    exception,
                    system_info.as_ref(),
                    misc.as_ref(),
                ) {
                    info!(address, "recovered non-canonical fault address");
                    state.crash_address = address;
                }
            }

            state.exception_record = Some(ExceptionRecord {
                code: record.exception_code,
                flags: record.exception_flags,
                nested_exception_record_address: record.exception_record,
                address: state.crash_address,
                parameters: parameters.to_vec(),
            });
        }

        state.assertion = get_assertion(dump);

        state.modules = dump
            .get_stream::<MinidumpModuleList>()
            .unwrap_or_else(|_| MinidumpModuleList::from_modules(Vec::new()));
        state.unloaded_modules = dump.get_stream::<MinidumpUnloadedModuleList>().ok();
        let memory_list = dump.get_memory().unwrap_or_default();

        let threads: MinidumpThreadList<'_> = match dump.get_stream() {
            Ok(threads) => threads,
            Err(error) => {
                warn!(%error, "minidump has no thread list");
                return (state, ProcessResult::NoThreadList);
            }
        };

        let thread_names = match dump.get_stream::<MinidumpThreadNames>() {
            Ok(names) => Some(names),
            Err(minidump::Error::StreamNotFound) => None,
            Err(error) => {
                warn!(%error, "unreadable thread-name stream");
                return (state, ProcessResult::GettingThreadName);
            }
        };

        state.original_thread_count = threads.threads.len();

        let walker_options = WalkerOptions {
            stack_scan_allowed: self.options.stack_scan_allowed,
            max_frames: self.options.max_frames,
        };

        let mut thread_count = threads.threads.len();
        let mut found_requesting_thread = false;
        let mut interrupted = false;

        for (thread_index, thread) in threads.threads.iter().enumerate() {
            if thread_index >= thread_count {
                break;
            }
            let thread_id = thread.raw.thread_id;
            let thread_name = thread_names
                .as_ref()
                .and_then(|names| names.get_name(thread_id))
                .map(|name| name.into_owned());

            // A thread dumping itself has its context and stack in flux;
            // its stack would only describe the dumper.
            if Some(thread_id) == dump_thread_id {
                state.original_thread_count -= 1;
                continue;
            }

            let mut context = system_info
                .as_ref()
                .and_then(|info| thread.context(info, misc.as_ref()));

            if Some(thread_id) == requesting_thread_id {
                if found_requesting_thread {
                    warn!(thread_id, "duplicate requesting thread");
                    return (state, ProcessResult::DuplicateRequestingThreads);
                }
                found_requesting_thread = true;
                state.requesting_thread = Some(state.threads.len());

                if let Some(max) = self.options.max_thread_count {
                    thread_count = thread_count.min(max.max(state.threads.len() + 1));
                }

                // The requesting thread's own context describes the
                // exception handler; the exception's context describes
                // the crash site.
                if state.crashed {
                    if let Some(exception_context) = exception.as_ref().zip(system_info.as_ref())
                        .and_then(|(exc, info)| exc.context(info, misc.as_ref()))
                    {
                        context = Some(exception_context);
                    }
                }
            }

            let stack_memory = thread.stack_memory(&memory_list);
            if stack_memory.is_none() {
                warn!(thread_id, "no stack memory for thread");
            }

            let mut stack = match context {
                Some(context) => {
                    let mut stack = CallStack::with_context(context.into_owned());
                    if unwinder_is_missing(&stack) {
                        stack.info = CallStackInfo::UnsupportedCpu;
                    } else if stack_memory.is_none() {
                        stack.info = CallStackInfo::MissingMemory;
                    }
                    stack
                }
                None => CallStack::with_info(thread_id, CallStackInfo::MissingContext),
            };
            stack.thread_id = thread_id;
            stack.thread_name = thread_name;

            if !stack.frames.is_empty() {
                walk_stack(
                    &mut stack,
                    stack_memory,
                    &state.modules,
                    state.unloaded_modules.as_ref(),
                    &state.system_info,
                    self.provider,
                    &walker_options,
                );
                if self.provider.was_interrupted() {
                    info!(thread_id, "symbol supplier interrupted the walk");
                    interrupted = true;
                }
            }

            state
                .thread_memory_regions
                .push(stack_memory.map(region_summary));
            state.threads.push(stack);
        }

        if interrupted {
            return (state, ProcessResult::SymbolSupplierInterrupted);
        }

        // A promised requesting thread that never showed up is suspicious
        // but not fatal; just withdraw the index.
        if requesting_thread_id.is_some() && !found_requesting_thread {
            warn!(
                ?requesting_thread_id,
                "requesting thread not present in the thread list"
            );
            state.requesting_thread = None;
        }

        self.record_symbol_stats(&mut state);

        if let Some(rater) = &self.options.exploitability_rater {
            state.exploitability = rater.rate(&state);
        }

        (state, ProcessResult::Ok)
    }

    fn fault_address_from_instruction<'a, T>(
        &self,
        dump: &'a Minidump<'a, T>,
        exception: &MinidumpException<'_>,
        system_info: Option<&MinidumpSystemInfo>,
        misc: Option<&MinidumpMiscInfo>,
    ) -> Option<u64>
    where
        T: Deref<Target = [u8]> + 'a,
    {
        let context = exception.context(system_info?, misc)?;
        let amd64_context = match &context.raw {
            MinidumpRawContext::Amd64(ctx) => ctx,
            _ => return None,
        };
        let instruction_pointer = context.get_instruction_pointer();
        let memory_list = dump.get_memory()?;
        let region = memory_list.memory_at_address(instruction_pointer)?;
        disassembler::recover_fault_address(region, instruction_pointer, amd64_context)
    }

    fn record_symbol_stats(&self, state: &mut ProcessState) {
        let stats = self.provider.stats();
        for module in state.modules.by_addr() {
            let code_file = module.code_file();
            let leaf = code_file.rsplit(['/', '\\']).next().unwrap_or(&code_file);
            let Some(stats) = stats.get(leaf) else {
                continue;
            };
            if stats.corrupt_symbols {
                state
                    .modules_with_corrupt_symbols
                    .push(code_file.into_owned());
            } else if !stats.loaded_symbols {
                state.modules_without_symbols.push(code_file.into_owned());
            }
        }
    }
}

fn unwinder_is_missing(stack: &CallStack) -> bool {
    matches!(
        stack.frames.first().map(|f| &f.context.raw),
        Some(MinidumpRawContext::Sparc(_))
    )
}

fn region_summary(memory: UnifiedMemory<'_, '_>) -> MemoryRegionRef {
    match memory {
        UnifiedMemory::Memory(m) => MemoryRegionRef {
            base_address: m.base_address,
            size: m.size,
        },
        UnifiedMemory::Memory64(m) => MemoryRegionRef {
            base_address: m.base_address,
            size: m.size,
        },
    }
}

fn get_assertion<'a, T>(dump: &'a Minidump<'a, T>) -> String
where
    T: Deref<Target = [u8]> + 'a,
{
    let Ok(assertion) = dump.get_stream::<MinidumpAssertion>() else {
        return String::new();
    };

    let mut text = match assertion.raw._type {
        1 => "Invalid parameter passed to library function".to_string(),
        2 => "Pure virtual function called".to_string(),
        other => format!("Unknown assertion type 0x{other:08x}"),
    };
    if let Some(expression) = assertion.expression().filter(|e| !e.is_empty()) {
        text.push(' ');
        text.push_str(&expression);
    }
    if let Some(function) = assertion.function().filter(|f| !f.is_empty()) {
        text.push_str(" in function ");
        text.push_str(&function);
    }
    if let Some(file) = assertion.file().filter(|f| !f.is_empty()) {
        text.push_str(", in file ");
        text.push_str(&file);
    }
    if assertion.raw.line != 0 {
        text.push_str(&format!(" at line {}", assertion.raw.line));
    }
    text
}
