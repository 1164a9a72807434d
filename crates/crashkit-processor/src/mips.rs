//! MIPS unwinder: STACK CFI, then stack scanning.
//!
//! MIPS has no frame-pointer convention reliable enough to follow
//! blindly, so there is no middle step. The o32 and n64 ABIs differ in
//! pointer width and minimum frame size; the context flags say which one
//! produced the dump.

use std::collections::HashSet;

use minidump::format::ContextFlagsCpu;
use minidump::{
    CpuContext, Endian, MinidumpContext, MinidumpContextValidity, MinidumpModuleList,
    MinidumpRawContext,
};
use scroll::ctx::{SizeWith, TryFromCtx};
use tracing::trace;

use crate::impl_prelude::*;

type MipsContext = minidump::format::CONTEXT_MIPS;

const STACK_POINTER: &str = "sp";
const PROGRAM_COUNTER: &str = "pc";
const CALLEE_SAVED_REGS: &[&str] = &[
    "s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7", "gp", "sp", "fp",
];

fn callee_forwarded_regs(valid: &MinidumpContextValidity) -> HashSet<&'static str> {
    match valid {
        MinidumpContextValidity::All => CALLEE_SAVED_REGS.iter().copied().collect(),
        MinidumpContextValidity::Some(ref which) => CALLEE_SAVED_REGS
            .iter()
            .filter(|&reg| which.contains(reg))
            .copied()
            .collect(),
    }
}

fn get_caller_by_cfi<'a, C>(ctx: &'a C, args: &'a GetCallerFrameArgs<'a>) -> Option<StackFrame>
where
    C: CpuContext + IntoRawContext + Clone,
    C::Register: TryFrom<u64>,
    u64: TryFrom<C::Register>,
    C::Register: TryFromCtx<'a, Endian, [u8], Error = scroll::Error> + SizeWith<Endian>,
{
    trace!("trying cfi");
    let _last_sp = ctx.get_register(STACK_POINTER, args.valid())?;

    let mut stack_walker = CfiStackWalker::from_ctx_and_args(ctx, args, callee_forwarded_regs)?;
    args.symbol_provider
        .walk_frame(stack_walker.module, &mut stack_walker)?;

    let context = MinidumpContext {
        raw: stack_walker.caller_ctx.into_ctx(),
        valid: MinidumpContextValidity::Some(stack_walker.caller_validity),
    };
    Some(StackFrame::from_context(context, FrameTrust::CallFrameInfo))
}

fn get_caller_by_scan32(
    ctx: &Mips32Context,
    args: &GetCallerFrameArgs<'_>,
) -> Option<StackFrame> {
    if !args.stack_scan_allowed {
        return None;
    }
    trace!("trying scan");
    const MAX_STACK_SIZE: u32 = 1024;
    const MIN_ARGS: u32 = 4;
    const POINTER_WIDTH: u32 = 4;

    let mut last_sp = ctx.get_register(STACK_POINTER, args.valid())?;
    let mut count = MAX_STACK_SIZE / POINTER_WIDTH;

    // The o32 ABI reserves a four-word argument save area in every
    // non-leaf frame; skipping it avoids inventing frames out of the
    // callee's own slots. The context frame may be a leaf, so it is
    // exempt.
    if args.callee_frame.trust != FrameTrust::Context {
        last_sp = last_sp.checked_add(MIN_ARGS * POINTER_WIDTH)?;
        count -= MIN_ARGS;
    }

    for i in 0..count {
        let address_of_pc = last_sp.checked_add(i * POINTER_WIDTH)?;
        let caller_pc: u32 = args.stack_memory.get_memory_at_address(address_of_pc as u64)?;
        if instruction_seems_valid(caller_pc as u64, args.modules, args.symbol_provider) {
            // A `ra` slot saved by the prologue; the caller's frame ends
            // just above it.
            let caller_sp = address_of_pc.checked_add(POINTER_WIDTH)?;

            trace!("scan seems valid -- caller_pc: 0x{caller_pc:08x}, caller_sp: 0x{caller_sp:08x}");

            let mut caller_ctx = MipsContext::default();
            caller_ctx.set_register(PROGRAM_COUNTER, caller_pc as u64);
            caller_ctx.set_register(STACK_POINTER, caller_sp as u64);

            let mut valid = HashSet::new();
            valid.insert(PROGRAM_COUNTER);
            valid.insert(STACK_POINTER);
            let context = MinidumpContext {
                raw: MinidumpRawContext::Mips(caller_ctx),
                valid: MinidumpContextValidity::Some(valid),
            };
            return Some(StackFrame::from_context(context, FrameTrust::Scan));
        }
    }

    None
}

fn get_caller_by_scan64(ctx: &MipsContext, args: &GetCallerFrameArgs<'_>) -> Option<StackFrame> {
    if !args.stack_scan_allowed {
        return None;
    }
    trace!("trying scan");
    const MAX_STACK_SIZE: u64 = 1024;
    const POINTER_WIDTH: u64 = 8;

    let last_sp = ctx.get_register(STACK_POINTER, args.valid())?;

    for i in 0..(MAX_STACK_SIZE / POINTER_WIDTH) {
        let address_of_pc = last_sp.checked_add(i * POINTER_WIDTH)?;
        let caller_pc = args.stack_memory.get_memory_at_address(address_of_pc)?;
        if instruction_seems_valid(caller_pc, args.modules, args.symbol_provider) {
            let caller_sp = address_of_pc.checked_add(POINTER_WIDTH)?;

            trace!("scan seems valid -- caller_pc: 0x{caller_pc:016x}, caller_sp: 0x{caller_sp:016x}");

            let mut caller_ctx = MipsContext::default();
            caller_ctx.set_register(PROGRAM_COUNTER, caller_pc);
            caller_ctx.set_register(STACK_POINTER, caller_sp);

            let mut valid = HashSet::new();
            valid.insert(PROGRAM_COUNTER);
            valid.insert(STACK_POINTER);
            let context = MinidumpContext {
                raw: MinidumpRawContext::Mips(caller_ctx),
                valid: MinidumpContextValidity::Some(valid),
            };
            return Some(StackFrame::from_context(context, FrameTrust::Scan));
        }
    }

    None
}

fn instruction_seems_valid(
    instruction: u64,
    modules: &MinidumpModuleList,
    symbol_provider: &dyn SymbolProvider,
) -> bool {
    if instruction < 0x1000 {
        return false;
    }
    crate::instruction_seems_valid_by_symbols(instruction, modules, symbol_provider)
}

pub(crate) fn get_caller_frame(
    ctx: &MipsContext,
    args: &GetCallerFrameArgs<'_>,
) -> Option<StackFrame> {
    let ctx32 = Mips32Context::try_from(ctx.clone());

    let mut frame = match &ctx32 {
        Ok(mips32) => get_caller_by_cfi(mips32, args),
        Err(mips64) => get_caller_by_cfi(mips64, args),
    };
    if frame.is_none() {
        frame = match &ctx32 {
            Ok(mips32) => get_caller_by_scan32(mips32, args),
            Err(mips64) => get_caller_by_scan64(mips64, args),
        };
    }
    let mut frame = frame?;

    if frame.context.get_instruction_pointer() < 4096 {
        trace!("instruction pointer was nullish, assuming unwind complete");
        return None;
    }
    let sp = frame.context.get_stack_pointer();
    let last_sp = ctx.get_register_always(STACK_POINTER);
    if sp <= last_sp {
        // Leaf functions keep the return address in `ra` without
        // touching the stack; allow a static stack pointer once.
        let is_leaf = args.callee_frame.trust == FrameTrust::Context && sp == last_sp;
        if !is_leaf {
            trace!("stack pointer went backwards, assuming unwind complete");
            return None;
        }
    }

    // `jal` stores pc + 8 into `ra` (the slot after the delay slot).
    let pc = frame.context.get_instruction_pointer();
    frame.instruction = pc - 8;

    Some(frame)
}

/// A 32-bit view over the unified MIPS context, so CFI evaluation uses
/// 32-bit loads and arithmetic under the o32 ABI.
#[derive(Clone)]
struct Mips32Context(MipsContext);

impl CpuContext for Mips32Context {
    type Register = u32;

    const REGISTERS: &'static [&'static str] = <MipsContext as CpuContext>::REGISTERS;

    fn get_register_always(&self, reg: &str) -> Self::Register {
        self.0.get_register_always(reg) as u32
    }

    fn set_register(&mut self, reg: &str, val: Self::Register) -> Option<()> {
        self.0.set_register(reg, val.into())
    }

    fn stack_pointer_register_name(&self) -> &'static str {
        self.0.stack_pointer_register_name()
    }

    fn instruction_pointer_register_name(&self) -> &'static str {
        self.0.instruction_pointer_register_name()
    }
}

impl IntoRawContext for Mips32Context {
    fn into_ctx(self) -> MinidumpRawContext {
        MinidumpRawContext::Mips(self.0)
    }
}

impl IntoRawContext for MipsContext {
    fn into_ctx(self) -> MinidumpRawContext {
        MinidumpRawContext::Mips(self)
    }
}

impl TryFrom<MipsContext> for Mips32Context {
    type Error = MipsContext;

    fn try_from(ctx: MipsContext) -> Result<Self, Self::Error> {
        if ContextFlagsCpu::from_flags(ctx.context_flags).contains(ContextFlagsCpu::CONTEXT_MIPS64)
        {
            Err(ctx)
        } else {
            Ok(Self(ctx))
        }
    }
}
