//! PowerPC unwinder: STACK CFI, then the stack back-chain.
//!
//! The PowerPC ABIs keep a back chain at 0(r1) (each frame's first word
//! points at the caller's frame) and save the link register at 8 bytes
//! into the caller's linkage area, which makes frame walking simpler
//! than on the register-window or frame-pointer architectures. Serves
//! both the 32- and 64-bit contexts.

use std::collections::HashSet;

use minidump::{
    CpuContext, Endian, MinidumpContext, MinidumpContextValidity, MinidumpRawContext,
};
use scroll::ctx::{SizeWith, TryFromCtx};
use tracing::trace;

use crate::impl_prelude::*;

const STACK_POINTER: &str = "r1";
const PROGRAM_COUNTER: &str = "srr0";
const CALLEE_SAVED_REGS: &[&str] = &[
    "r1", "r13", "r14", "r15", "r16", "r17", "r18", "r19", "r20", "r21", "r22", "r23", "r24",
    "r25", "r26", "r27", "r28", "r29", "r30", "r31",
];

impl IntoRawContext for minidump::format::CONTEXT_PPC {
    fn into_ctx(self) -> MinidumpRawContext {
        MinidumpRawContext::Ppc(self)
    }
}

impl IntoRawContext for minidump::format::CONTEXT_PPC64 {
    fn into_ctx(self) -> MinidumpRawContext {
        MinidumpRawContext::Ppc64(self)
    }
}

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

fn get_caller_by_back_chain<'a, C>(
    ctx: &'a C,
    args: &'a GetCallerFrameArgs<'a>,
) -> Option<StackFrame>
where
    C: CpuContext + IntoRawContext + Clone,
    u64: TryFrom<C::Register>,
    C::Register: Copy
        + TryFrom<u64>
        + TryFromCtx<'a, Endian, [u8], Error = scroll::Error>
        + SizeWith<Endian>,
{
    trace!("trying stack back-chain");
    let last_sp = u64::try_from(ctx.get_register(STACK_POINTER, args.valid())?).ok()?;

    // caller_sp = *(sp); caller_pc = *(caller_sp + 8). The saved lr is
    // the instruction after the branch.
    let caller_sp: C::Register = args.stack_memory.get_memory_at_address(last_sp)?;
    let caller_sp_val = u64::try_from(caller_sp).ok()?;
    if caller_sp_val <= last_sp {
        trace!("back chain did not advance, assuming unwind complete");
        return None;
    }
    let caller_pc: C::Register = args
        .stack_memory
        .get_memory_at_address(caller_sp_val.checked_add(8)?)?;
    let caller_pc_val = u64::try_from(caller_pc).ok()?;
    if caller_pc_val <= 1 {
        return None;
    }

    trace!("back chain seems valid -- caller_pc: 0x{caller_pc_val:016x}, caller_sp: 0x{caller_sp_val:016x}");

    // SAFETY: all `CpuContext` raw context types are C-style structs of
    // integers/integer arrays (see minidump_common::format), for which the
    // all-zero bit pattern is valid and matches what `#[derive(Default)]`
    // would produce where it is available.
    let mut caller_ctx: C = unsafe { std::mem::zeroed() };
    caller_ctx.set_register(PROGRAM_COUNTER, caller_pc);
    caller_ctx.set_register(STACK_POINTER, caller_sp);

    let mut valid = HashSet::new();
    valid.insert(PROGRAM_COUNTER);
    valid.insert(STACK_POINTER);
    let context = MinidumpContext {
        raw: caller_ctx.into_ctx(),
        valid: MinidumpContextValidity::Some(valid),
    };
    Some(StackFrame::from_context(context, FrameTrust::FramePointer))
}

pub(crate) fn get_caller_frame<'a, C>(
    ctx: &'a C,
    args: &'a GetCallerFrameArgs<'a>,
) -> Option<StackFrame>
where
    C: CpuContext + IntoRawContext + Clone,
    C::Register: Copy + TryFrom<u64>,
    u64: TryFrom<C::Register>,
    C::Register: TryFromCtx<'a, Endian, [u8], Error = scroll::Error> + SizeWith<Endian>,
{
    let mut frame =
        get_caller_by_cfi(ctx, args).or_else(|| get_caller_by_back_chain(ctx, args))?;

    if frame.context.get_instruction_pointer() < 4096 {
        trace!("instruction pointer was nullish, assuming unwind complete");
        return None;
    }
    let sp = frame.context.get_stack_pointer();
    let last_sp = u64::try_from(ctx.get_register_always(STACK_POINTER)).ok()?;
    if sp <= last_sp {
        trace!("stack pointer went backwards, assuming unwind complete");
        return None;
    }

    // The saved lr points at the instruction after the branch-and-link;
    // step back inside it (4-byte instructions).
    let pc = frame.context.get_instruction_pointer();
    frame.instruction = pc - 4;

    Some(frame)
}
