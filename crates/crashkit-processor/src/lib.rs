//! Minidump processing: per-thread stack unwinding, symbolication
//! plumbing, and crash classification.
//!
//! The entry point is [`MinidumpProcessor::process`], which turns a
//! parsed minidump plus a [`SymbolProvider`] into a [`ProcessState`]:
//! one [`CallStack`] per thread, system information, and a normalized
//! crash reason.
//!
//! Unwinding itself lives in per-CPU modules sharing one shape: start
//! from the thread context, then repeatedly recover the caller by call
//! frame information, by the frame-pointer convention, or by scanning
//! the stack for plausible return addresses, in that order of trust.
//!
//! Everything here is synchronous and single-threaded per dump; the only
//! I/O happens inside the symbol supplier.

mod amd64;
mod arm;
mod arm64;
pub mod crash_reason;
mod disassembler;
pub mod hex;
mod mips;
mod ppc;
mod process_state;
mod processor;
pub mod symbols;
mod system_info;
mod x86;

#[cfg(test)]
mod amd64_unittest;
#[cfg(test)]
mod arm64_unittest;
#[cfg(test)]
mod arm_unittest;
#[cfg(test)]
mod x86_unittest;

use std::collections::{BTreeMap, BTreeSet, HashSet};

use minidump::{
    CpuContext, Endian, MinidumpContext, MinidumpContextValidity, MinidumpModule,
    MinidumpModuleList, MinidumpRawContext, MinidumpUnloadedModuleList, Module, UnifiedMemory,
};
use scroll::ctx::{SizeWith, TryFromCtx};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use tracing::trace;

pub use crate::process_state::{
    CallStackInfo, ExceptionRecord, Exploitability, MemoryRegionRef, ProcessState,
};
pub use crate::processor::{
    ExploitabilityRater, MinidumpProcessor, ProcessResult, ProcessorOptions,
};
pub use crate::symbols::{
    simple_symbol_supplier, string_symbol_supplier, FillSymbolError, FrameSymbolizer, FrameWalker,
    SymbolError, SymbolFile, SymbolProvider, SymbolStats, SymbolSupplier, Symbolizer,
};
pub use crate::system_info::SystemInfo;

mod impl_prelude {
    pub(crate) use super::{
        CfiStackWalker, FrameTrust, GetCallerFrameArgs, IntoRawContext, StackFrame,
    };
    pub(crate) use crate::symbols::SymbolProvider;
}

/// How much the stackwalker trusts the instruction pointer of a frame.
///
/// Scanning can invent frames out of leftover stack garbage, so consumers
/// weigh frames by how they were recovered.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FrameTrust {
    /// Unknown provenance.
    None,
    /// Found by scanning the stack.
    Scan,
    /// Derived from the previous frame's frame pointer.
    FramePointer,
    /// Derived from call frame information.
    CallFrameInfo,
    /// The thread context itself: the innermost frame.
    Context,
}

impl FrameTrust {
    /// Human-readable description, as used in stack listings.
    pub fn description(&self) -> &'static str {
        match *self {
            FrameTrust::Context => "given as instruction pointer in context",
            FrameTrust::CallFrameInfo => "call frame info",
            FrameTrust::FramePointer => "previous frame's frame pointer",
            FrameTrust::Scan => "stack scanning",
            FrameTrust::None => "unknown",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match *self {
            FrameTrust::Context => "context",
            FrameTrust::CallFrameInfo => "cfi",
            FrameTrust::FramePointer => "frame_pointer",
            FrameTrust::Scan => "scan",
            FrameTrust::None => "none",
        }
    }
}

impl Serialize for FrameTrust {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One frame of an unwound stack.
#[derive(Debug, Clone)]
pub struct StackFrame {
    /// The address of the instruction the frame was executing: the exact
    /// program counter for the innermost frame, and an address *within*
    /// the calling instruction for every caller frame. Symbol lookups use
    /// this so a call on the last line of a function does not resolve to
    /// whatever follows it.
    pub instruction: u64,

    /// The address execution resumes at if the callee returns; equal to
    /// `instruction` only for the innermost frame.
    pub resume_address: u64,

    /// The module containing `instruction`, when one is loaded there.
    pub module: Option<MinidumpModule>,

    /// Unloaded modules overlapping `instruction` (name to the offsets at
    /// which that module had been mapped), filled only when no loaded
    /// module matches.
    pub unloaded_modules: BTreeMap<String, BTreeSet<u64>>,

    pub function_name: Option<String>,
    pub function_base: Option<u64>,

    /// Bytes of arguments on the stack, from symbols; used during CFI
    /// evaluation on x86.
    pub parameter_size: Option<u32>,

    pub source_file_name: Option<String>,
    pub source_line: Option<u32>,
    pub source_line_base: Option<u64>,

    pub trust: FrameTrust,

    /// Register state recovered for this frame.
    pub context: MinidumpContext,
}

impl StackFrame {
    pub fn from_context(context: MinidumpContext, trust: FrameTrust) -> StackFrame {
        let instruction = context.get_instruction_pointer();
        StackFrame {
            instruction,
            resume_address: instruction,
            module: None,
            unloaded_modules: BTreeMap::new(),
            function_name: None,
            function_base: None,
            parameter_size: None,
            source_file_name: None,
            source_line: None,
            source_line_base: None,
            trust,
            context,
        }
    }
}

impl FrameSymbolizer for StackFrame {
    fn get_instruction(&self) -> u64 {
        self.instruction
    }
    fn set_function(&mut self, name: &str, base: u64, parameter_size: u32) {
        self.function_name = Some(name.to_string());
        self.function_base = Some(base);
        self.parameter_size = Some(parameter_size);
    }
    fn set_source_file(&mut self, file: &str, line: u32, base: u64) {
        self.source_file_name = Some(file.to_string());
        self.source_line = Some(line);
        self.source_line_base = Some(base);
    }
}

impl Serialize for StackFrame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("StackFrame", 8)?;
        s.serialize_field("instruction", &crate::hex::HexValue(self.instruction))?;
        s.serialize_field(
            "module",
            &self.module.as_ref().map(|m| m.code_file().into_owned()),
        )?;
        s.serialize_field("function_name", &self.function_name)?;
        s.serialize_field(
            "function_base",
            &self.function_base.map(crate::hex::HexValue),
        )?;
        s.serialize_field("source_file_name", &self.source_file_name)?;
        s.serialize_field("source_line", &self.source_line)?;
        s.serialize_field("parameter_size", &self.parameter_size)?;
        s.serialize_field("trust", &self.trust)?;
        s.end()
    }
}

/// The unwound stack of one thread, innermost frame first.
#[derive(Debug, Clone, Serialize)]
pub struct CallStack {
    pub frames: Vec<StackFrame>,
    pub info: CallStackInfo,
    pub thread_id: u32,
    pub thread_name: Option<String>,
}

impl CallStack {
    /// A stack holding just the (unsymbolicated) context frame; the
    /// required starting state for [`walk_stack`].
    pub fn with_context(context: MinidumpContext) -> CallStack {
        CallStack {
            frames: vec![StackFrame::from_context(context, FrameTrust::Context)],
            info: CallStackInfo::Ok,
            thread_id: 0,
            thread_name: None,
        }
    }

    /// An empty stack recording why it could not be walked.
    pub fn with_info(thread_id: u32, info: CallStackInfo) -> CallStack {
        CallStack {
            frames: Vec::new(),
            info,
            thread_id,
            thread_name: None,
        }
    }
}

/// Walk limits and policy knobs, shared by every CPU.
#[derive(Clone, Debug)]
pub struct WalkerOptions {
    /// Permit the stack-scanning fallback.
    pub stack_scan_allowed: bool,
    /// Hard bound on frames per thread.
    pub max_frames: Option<u32>,
}

impl Default for WalkerOptions {
    fn default() -> WalkerOptions {
        WalkerOptions {
            stack_scan_allowed: true,
            max_frames: Some(1024),
        }
    }
}

/// Everything a CPU-specific unwinder needs to produce the next frame.
#[derive(Clone, Copy)]
pub(crate) struct GetCallerFrameArgs<'a> {
    pub callee_frame: &'a StackFrame,
    pub grand_callee_frame: Option<&'a StackFrame>,
    pub stack_memory: UnifiedMemory<'a, 'a>,
    pub modules: &'a MinidumpModuleList,
    pub system_info: &'a SystemInfo,
    pub symbol_provider: &'a dyn SymbolProvider,
    pub stack_scan_allowed: bool,
}

impl GetCallerFrameArgs<'_> {
    fn valid(&self) -> &MinidumpContextValidity {
        &self.callee_frame.context.valid
    }
}

/// Wraps a raw CPU context back into [`MinidumpRawContext`]; lets one
/// generic unwinder serve context types that share a register model.
pub(crate) trait IntoRawContext {
    fn into_ctx(self) -> MinidumpRawContext;
}

/// The [`FrameWalker`] over which STACK CFI programs are evaluated.
///
/// Callee-saved registers are forwarded into the caller context up front;
/// the CFI rules then overwrite or clear them.
pub(crate) struct CfiStackWalker<'a, C: CpuContext> {
    pub instruction: u64,
    pub has_grand_callee: bool,
    pub grand_callee_parameter_size: u32,

    pub callee_ctx: &'a C,
    pub callee_validity: &'a MinidumpContextValidity,

    pub caller_ctx: C,
    pub caller_validity: HashSet<&'static str>,

    pub module: &'a MinidumpModule,
    pub stack_memory: UnifiedMemory<'a, 'a>,
}

impl<'a, C> CfiStackWalker<'a, C>
where
    C: CpuContext + Clone,
{
    pub fn from_ctx_and_args<R>(
        ctx: &'a C,
        args: &'a GetCallerFrameArgs<'a>,
        callee_forwarded_regs: R,
    ) -> Option<Self>
    where
        R: Fn(&MinidumpContextValidity) -> HashSet<&'static str>,
    {
        let module = args
            .modules
            .module_at_address(args.callee_frame.instruction)?;
        let grand_callee = args.grand_callee_frame;
        Some(Self {
            instruction: args.callee_frame.instruction,
            has_grand_callee: grand_callee.is_some(),
            grand_callee_parameter_size: grand_callee.and_then(|f| f.parameter_size).unwrap_or(0),

            callee_ctx: ctx,
            callee_validity: args.valid(),

            caller_ctx: ctx.clone(),
            caller_validity: callee_forwarded_regs(args.valid()),

            module,
            stack_memory: args.stack_memory,
        })
    }
}

impl<'a, C> FrameWalker for CfiStackWalker<'a, C>
where
    C: CpuContext,
    C::Register: TryFrom<u64>,
    u64: TryFrom<C::Register>,
    C::Register: TryFromCtx<'a, Endian, [u8], Error = scroll::Error> + SizeWith<Endian>,
{
    fn get_instruction(&self) -> u64 {
        self.instruction
    }
    fn has_grand_callee(&self) -> bool {
        self.has_grand_callee
    }
    fn get_grand_callee_parameter_size(&self) -> u32 {
        self.grand_callee_parameter_size
    }
    fn get_register_at_address(&self, address: u64) -> Option<u64> {
        let result: Option<C::Register> = self.stack_memory.get_memory_at_address(address);
        result.and_then(|val| u64::try_from(val).ok())
    }
    fn get_callee_register(&self, name: &str) -> Option<u64> {
        self.callee_ctx
            .get_register(name, self.callee_validity)
            .and_then(|val| u64::try_from(val).ok())
    }
    fn set_caller_register(&mut self, name: &str, val: u64) -> Option<()> {
        let memoized = self.caller_ctx.memoize_register(name)?;
        let val = C::Register::try_from(val).ok()?;
        self.caller_validity.insert(memoized);
        self.caller_ctx.set_register(name, val)
    }
    fn clear_caller_register(&mut self, name: &str) {
        self.caller_validity.remove(name);
    }
    fn set_cfa(&mut self, val: u64) -> Option<()> {
        // The canonical frame address becomes the caller's stack pointer.
        let stack_pointer_reg = self.caller_ctx.stack_pointer_register_name();
        let val = C::Register::try_from(val).ok()?;
        self.caller_validity.insert(stack_pointer_reg);
        self.caller_ctx.set_register(stack_pointer_reg, val)
    }
    fn set_ra(&mut self, val: u64) -> Option<()> {
        let instruction_pointer_reg = self.caller_ctx.instruction_pointer_register_name();
        let val = C::Register::try_from(val).ok()?;
        self.caller_validity.insert(instruction_pointer_reg);
        self.caller_ctx.set_register(instruction_pointer_reg, val)
    }
}

fn get_caller_frame(args: &GetCallerFrameArgs<'_>) -> Option<StackFrame> {
    match args.callee_frame.context.raw {
        MinidumpRawContext::X86(ref ctx) => x86::get_caller_frame(ctx, args),
        MinidumpRawContext::Amd64(ref ctx) => amd64::get_caller_frame(ctx, args),
        MinidumpRawContext::Arm(ref ctx) => arm::get_caller_frame(ctx, args),
        MinidumpRawContext::Arm64(ref ctx) => arm64::get_caller_frame(ctx, args),
        MinidumpRawContext::OldArm64(ref ctx) => arm64::get_caller_frame(ctx, args),
        MinidumpRawContext::Mips(ref ctx) => mips::get_caller_frame(ctx, args),
        MinidumpRawContext::Ppc(ref ctx) => ppc::get_caller_frame(ctx, args),
        MinidumpRawContext::Ppc64(ref ctx) => ppc::get_caller_frame(ctx, args),
        _ => None,
    }
}

fn fill_source_line_info(
    frame: &mut StackFrame,
    modules: &MinidumpModuleList,
    unloaded_modules: Option<&MinidumpUnloadedModuleList>,
    symbol_provider: &dyn SymbolProvider,
) {
    if let Some(module) = modules.module_at_address(frame.instruction) {
        frame.module = Some(module.clone());
        // Best effort; a missing symbol file is recorded in the provider's
        // stats, not here.
        let _ = symbol_provider.fill_symbol(module, frame);
    } else if let Some(unloaded) = unloaded_modules {
        for module in unloaded.modules_at_address(frame.instruction) {
            let offset = frame.instruction - module.raw.base_of_image;
            frame
                .unloaded_modules
                .entry(module.name.clone())
                .or_default()
                .insert(offset);
        }
    }
}

/// Unwind one thread.
///
/// `stack` must start as [`CallStack::with_context`]; frames are appended
/// until a termination condition is hit (no caller recoverable, stack
/// pointer not advancing, nullish instruction pointer, or the frame
/// limit). Each appended frame is symbolicated through `symbol_provider`.
pub fn walk_stack(
    stack: &mut CallStack,
    stack_memory: Option<UnifiedMemory<'_, '_>>,
    modules: &MinidumpModuleList,
    unloaded_modules: Option<&MinidumpUnloadedModuleList>,
    system_info: &SystemInfo,
    symbol_provider: &dyn SymbolProvider,
    options: &WalkerOptions,
) {
    trace!(
        "starting stack unwind of thread {} {}",
        stack.thread_id,
        stack.thread_name.as_deref().unwrap_or(""),
    );

    // Reject empty or overflowing stack memory up front so the unwinders
    // can assume reads are meaningful.
    let stack_memory =
        stack_memory.and_then(|memory| memory.memory_range().map(|_| memory));

    let mut has_new_frame = !stack.frames.is_empty();
    while has_new_frame {
        let frame = stack.frames.last_mut().unwrap();
        fill_source_line_info(frame, modules, unloaded_modules, symbol_provider);

        if let Some(max_frames) = options.max_frames {
            if stack.frames.len() as u32 >= max_frames {
                trace!("frame limit reached, stopping unwind");
                break;
            }
        }
        let Some(stack_memory) = stack_memory else {
            break;
        };

        let callee_frame = stack.frames.last().unwrap();
        let grand_callee_frame = stack
            .frames
            .len()
            .checked_sub(2)
            .and_then(|idx| stack.frames.get(idx));
        match callee_frame.function_name.as_ref() {
            Some(name) => trace!("unwinding {}", name),
            None => trace!("unwinding 0x{:016x}", callee_frame.instruction),
        }

        let new_frame = get_caller_frame(&GetCallerFrameArgs {
            callee_frame,
            grand_callee_frame,
            stack_memory,
            modules,
            system_info,
            symbol_provider,
            stack_scan_allowed: options.stack_scan_allowed,
        });

        match new_frame {
            // A caller outside every known module is only worth keeping
            // if scanning may later recover the walk from its frame.
            Some(new_frame)
                if !options.stack_scan_allowed
                    && modules.module_at_address(new_frame.instruction).is_none() =>
            {
                trace!("caller is outside all modules and scanning is off, stopping");
                has_new_frame = false;
            }
            Some(new_frame) => stack.frames.push(new_frame),
            None => has_new_frame = false,
        }
    }
    trace!(
        "finished stack unwind of thread {}: {} frames",
        stack.thread_id,
        stack.frames.len(),
    );
}

/// Use symbols to refine a scanned instruction-pointer candidate: if the
/// module has symbols but none cover the address, it is not code.
fn instruction_seems_valid_by_symbols(
    instruction: u64,
    modules: &MinidumpModuleList,
    symbol_provider: &dyn SymbolProvider,
) -> bool {
    // A return address is one past the call; looking up the byte before
    // it keeps a call at the very end of a noreturn function inside that
    // function's range.
    let instruction = instruction.saturating_sub(1);

    if instruction == 0 {
        return false;
    }

    let Some(module) = modules.module_at_address(instruction) else {
        // Not in any module: reject so that ordinary data pointers on the
        // stack are distinguishable from code addresses.
        return false;
    };

    struct DummyFrame {
        instruction: u64,
        has_name: bool,
    }
    impl FrameSymbolizer for DummyFrame {
        fn get_instruction(&self) -> u64 {
            self.instruction
        }
        fn set_function(&mut self, name: &str, _base: u64, _parameter_size: u32) {
            self.has_name = !name.is_empty();
        }
        fn set_source_file(&mut self, _file: &str, _line: u32, _base: u64) {}
    }

    let mut frame = DummyFrame {
        instruction,
        has_name: false,
    };

    if symbol_provider.fill_symbol(module, &mut frame).is_ok() {
        frame.has_name
    } else {
        // No symbols for the module at all: assume the address is fine so
        // scanning still works unsymbolicated.
        true
    }
}
