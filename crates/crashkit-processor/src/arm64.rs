//! ARM64 unwinder: STACK CFI, the {fp, lr} frame-record chain, and stack
//! scanning.
//!
//! Two extra wrinkles relative to the other CPUs:
//!
//! * Return addresses may carry pointer-authentication bits in their
//!   upper bits. Every recovered instruction pointer is stripped with a
//!   mask derived from the loaded-module range (the smallest all-ones
//!   mask covering the highest module end address).
//! * After a frame-pointer unwind, the new frame's lr is re-derived by
//!   following the saved frame-pointer chain one record further, since
//!   the record next to the recovered fp holds the correct value.
//!
//! The legacy and current arm64 context encodings share this
//! implementation; they differ only in their raw layout.

use std::collections::HashSet;

use minidump::format::{CONTEXT_ARM64, CONTEXT_ARM64_OLD};
use minidump::{
    CpuContext, Endian, MinidumpContext, MinidumpContextValidity, MinidumpModuleList,
    MinidumpRawContext, Module,
};
use scroll::ctx::{SizeWith, TryFromCtx};
use tracing::trace;

use crate::impl_prelude::*;

type Pointer = u64;
const POINTER_WIDTH: Pointer = 8;
const FRAME_POINTER: &str = "fp";
const LINK_REGISTER: &str = "lr";
const STACK_POINTER: &str = "sp";
const PROGRAM_COUNTER: &str = "pc";
const CALLEE_SAVED_REGS: &[&str] = &[
    "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27", "x28", "fp",
];

impl IntoRawContext for CONTEXT_ARM64 {
    fn into_ctx(self) -> MinidumpRawContext {
        MinidumpRawContext::Arm64(self)
    }
}

impl IntoRawContext for CONTEXT_ARM64_OLD {
    fn into_ctx(self) -> MinidumpRawContext {
        MinidumpRawContext::OldArm64(self)
    }
}

/// The smallest all-ones mask that covers every loaded module address;
/// anything above it is pointer-authentication material.
fn address_range_mask(modules: &MinidumpModuleList) -> u64 {
    let highest = modules
        .by_addr()
        .last()
        .map(|module| module.base_address().wrapping_add(module.size()))
        .unwrap_or(0);
    if highest == 0 || highest.leading_zeros() == 0 {
        return !0;
    }
    (1u64 << (64 - highest.leading_zeros())) - 1
}

fn ptrauth_strip(mask: u64, ptr: Pointer) -> Pointer {
    ptr & mask
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
    C: CpuContext<Register = u64> + IntoRawContext + Clone,
    C::Register: TryFromCtx<'a, Endian, [u8], Error = scroll::Error> + SizeWith<Endian>,
{
    trace!("trying cfi");
    let _last_sp = ctx.get_register(STACK_POINTER, args.valid())?;

    let mut stack_walker = CfiStackWalker::from_ctx_and_args(ctx, args, callee_forwarded_regs)?;
    args.symbol_provider
        .walk_frame(stack_walker.module, &mut stack_walker)?;

    let mask = address_range_mask(args.modules);
    let caller_pc = ptrauth_strip(
        mask,
        stack_walker.caller_ctx.get_register_always(PROGRAM_COUNTER),
    );
    stack_walker
        .caller_ctx
        .set_register(PROGRAM_COUNTER, caller_pc)?;
    let caller_sp = stack_walker.caller_ctx.get_register_always(STACK_POINTER);
    trace!("cfi evaluation was successful -- caller_pc: 0x{caller_pc:016x}, caller_sp: 0x{caller_sp:016x}");

    let context = MinidumpContext {
        raw: stack_walker.caller_ctx.into_ctx(),
        valid: MinidumpContextValidity::Some(stack_walker.caller_validity),
    };
    Some(StackFrame::from_context(context, FrameTrust::CallFrameInfo))
}

fn get_caller_by_frame_pointer<C>(ctx: &C, args: &GetCallerFrameArgs<'_>) -> Option<StackFrame>
where
    C: CpuContext<Register = u64> + IntoRawContext + Clone + Default,
{
    trace!("trying frame pointer");
    let mask = address_range_mask(args.modules);

    // The prologue stores the frame record {previous fp, saved lr} and
    // points fp at it:
    //
    //   sp_new = fp + 16
    //   fp_new = *fp
    //   lr_new = *(fp + 8)
    //   pc_new = the callee's lr
    let last_fp = ctx.get_register(FRAME_POINTER, args.valid())?;
    let last_sp = ctx.get_register(STACK_POINTER, args.valid())?;
    let last_lr = match ctx.get_register(LINK_REGISTER, args.valid()) {
        Some(lr) => ptrauth_strip(mask, lr),
        None => {
            // The callee's lr was not recovered (a CFI unwind may only
            // restore pc/sp); the frame-record chain still provides it.
            trace!("no valid lr in the callee, reading it from the frame record");
            ptrauth_strip(
                mask,
                args.stack_memory
                    .get_memory_at_address(last_fp.checked_add(POINTER_WIDTH)?)?,
            )
        }
    };

    if last_fp >= u64::MAX - POINTER_WIDTH * 2 {
        return None;
    }
    let (caller_fp, mut caller_lr, caller_sp): (u64, u64, u64) = if last_fp == 0 {
        // End of the chain; failing the must-advance check below stops
        // the walk cleanly.
        (0, 0, last_sp)
    } else {
        (
            args.stack_memory.get_memory_at_address(last_fp)?,
            ptrauth_strip(
                mask,
                args.stack_memory
                    .get_memory_at_address(last_fp + POINTER_WIDTH)?,
            ),
            last_fp + POINTER_WIDTH * 2,
        )
    };
    let caller_pc = last_lr;

    // The caller's lr lives in the caller's own frame record, one step
    // further down the chain. Correct it when that record is readable.
    if caller_fp != 0 {
        if let Some(lr) = args
            .stack_memory
            .get_memory_at_address::<Pointer>(caller_fp.wrapping_add(POINTER_WIDTH))
        {
            caller_lr = ptrauth_strip(mask, lr);
        }
    }

    trace!("frame pointer seems valid -- caller_pc: 0x{caller_pc:016x}, caller_sp: 0x{caller_sp:016x}");

    let mut caller_ctx = C::default();
    caller_ctx.set_register(PROGRAM_COUNTER, caller_pc);
    caller_ctx.set_register(LINK_REGISTER, caller_lr);
    caller_ctx.set_register(FRAME_POINTER, caller_fp);
    caller_ctx.set_register(STACK_POINTER, caller_sp);

    let mut valid = HashSet::new();
    valid.insert(PROGRAM_COUNTER);
    valid.insert(LINK_REGISTER);
    valid.insert(FRAME_POINTER);
    valid.insert(STACK_POINTER);
    let context = MinidumpContext {
        raw: caller_ctx.into_ctx(),
        valid: MinidumpContextValidity::Some(valid),
    };
    Some(StackFrame::from_context(context, FrameTrust::FramePointer))
}

fn get_caller_by_scan<C>(ctx: &C, args: &GetCallerFrameArgs<'_>) -> Option<StackFrame>
where
    C: CpuContext<Register = u64> + IntoRawContext + Clone + Default,
{
    if !args.stack_scan_allowed {
        return None;
    }
    trace!("trying scan");

    let mask = address_range_mask(args.modules);
    let last_sp = ctx.get_register(STACK_POINTER, args.valid())?;

    let default_scan_range = 40;
    let extended_scan_range = default_scan_range * 4;
    let scan_range = if let FrameTrust::Context = args.callee_frame.trust {
        extended_scan_range
    } else {
        default_scan_range
    };

    for i in 0..scan_range {
        let address_of_pc = last_sp.checked_add(i * POINTER_WIDTH)?;
        let caller_pc = ptrauth_strip(
            mask,
            args.stack_memory.get_memory_at_address(address_of_pc)?,
        );
        if instruction_seems_valid(caller_pc, args.modules, args.symbol_provider) {
            let caller_sp = address_of_pc.checked_add(POINTER_WIDTH)?;

            trace!("scan seems valid -- caller_pc: 0x{caller_pc:016x}, caller_sp: 0x{caller_sp:016x}");

            let mut caller_ctx = C::default();
            caller_ctx.set_register(PROGRAM_COUNTER, caller_pc);
            caller_ctx.set_register(STACK_POINTER, caller_sp);

            let mut valid = HashSet::new();
            valid.insert(PROGRAM_COUNTER);
            valid.insert(STACK_POINTER);
            let context = MinidumpContext {
                raw: caller_ctx.into_ctx(),
                valid: MinidumpContextValidity::Some(valid),
            };
            return Some(StackFrame::from_context(context, FrameTrust::Scan));
        }
    }

    None
}

fn instruction_seems_valid(
    instruction: Pointer,
    modules: &MinidumpModuleList,
    symbol_provider: &dyn SymbolProvider,
) -> bool {
    crate::instruction_seems_valid_by_symbols(instruction, modules, symbol_provider)
}

pub(crate) fn get_caller_frame<'a, C>(
    ctx: &'a C,
    args: &'a GetCallerFrameArgs<'a>,
) -> Option<StackFrame>
where
    C: CpuContext<Register = u64> + IntoRawContext + Clone + Default,
    C::Register: TryFromCtx<'a, Endian, [u8], Error = scroll::Error> + SizeWith<Endian>,
{
    let mut frame = get_caller_by_cfi(ctx, args)
        .or_else(|| get_caller_by_frame_pointer(ctx, args))
        .or_else(|| get_caller_by_scan(ctx, args))?;

    if frame.context.get_instruction_pointer() < 4096 {
        trace!("instruction pointer was nullish, assuming unwind complete");
        return None;
    }
    let sp = frame.context.get_stack_pointer();
    let last_sp = ctx.get_register_always(STACK_POINTER);
    if sp <= last_sp {
        // Leaf functions can leave the stack pointer untouched (the
        // return address stays in lr); permit that for the first unwound
        // frame only.
        let is_leaf = args.callee_frame.trust == FrameTrust::Context && sp == last_sp;
        if !is_leaf {
            trace!("stack pointer went backwards, assuming unwind complete");
            return None;
        }
    }

    // Point back inside the calling instruction (all 4 bytes wide).
    let pc = frame.context.get_instruction_pointer();
    frame.instruction = pc - 4;

    Some(frame)
}
