//! 32-bit ARM unwinder: STACK CFI, an iOS-only frame-pointer convention,
//! and stack scanning.

use std::collections::HashSet;

use minidump::system_info::Os;
use minidump::{
    CpuContext, MinidumpContext, MinidumpContextValidity, MinidumpModuleList, MinidumpRawContext,
};
use tracing::trace;

use crate::impl_prelude::*;

type ArmContext = minidump::format::CONTEXT_ARM;
type Pointer = <ArmContext as CpuContext>::Register;

const POINTER_WIDTH: Pointer = 4;
const FRAME_POINTER: &str = "fp";
const STACK_POINTER: &str = "sp";
const PROGRAM_COUNTER: &str = "pc";
const CALLEE_SAVED_REGS: &[&str] = &["r4", "r5", "r6", "r7", "r8", "r9", "r10", "fp"];

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

fn get_caller_by_cfi(ctx: &ArmContext, args: &GetCallerFrameArgs<'_>) -> Option<StackFrame> {
    trace!("trying cfi");
    let _last_sp = ctx.get_register(STACK_POINTER, args.valid())?;

    let mut stack_walker = CfiStackWalker::from_ctx_and_args(ctx, args, callee_forwarded_regs)?;
    args.symbol_provider
        .walk_frame(stack_walker.module, &mut stack_walker)?;

    let caller_pc = stack_walker.caller_ctx.get_register_always(PROGRAM_COUNTER);
    let caller_sp = stack_walker.caller_ctx.get_register_always(STACK_POINTER);
    trace!("cfi evaluation was successful -- caller_pc: 0x{caller_pc:08x}, caller_sp: 0x{caller_sp:08x}");

    let context = MinidumpContext {
        raw: MinidumpRawContext::Arm(stack_walker.caller_ctx),
        valid: MinidumpContextValidity::Some(stack_walker.caller_validity),
    };
    Some(StackFrame::from_context(context, FrameTrust::CallFrameInfo))
}

fn get_caller_by_frame_pointer(
    ctx: &ArmContext,
    args: &GetCallerFrameArgs<'_>,
) -> Option<StackFrame> {
    // The ARM ABI permits using lr as a scratch register once the return
    // address is saved, so the frame-pointer convention is only reliable
    // where the platform mandates it (iOS does).
    if args.system_info.os_id != Os::Ios {
        return None;
    }

    trace!("trying frame pointer");
    // Calls leave the return address in lr instead of on the stack; the
    // prologue pushes {fp, lr} as a pair and points fp at the pair:
    //
    //   sp_new = fp + 8
    //   pc_new = *(fp + 4)
    //   fp_new = *fp
    let last_fp = ctx.get_register(FRAME_POINTER, args.valid())?;
    let last_sp = ctx.get_register(STACK_POINTER, args.valid())?;

    if last_fp >= Pointer::MAX - POINTER_WIDTH * 2 {
        return None;
    }
    let (caller_fp, caller_pc, caller_sp) = if last_fp == 0 {
        // End of the chain; synthesizing sp == last_sp makes the caller
        // fail the must-advance check and stops the walk.
        (0, 0, last_sp)
    } else {
        (
            args.stack_memory.get_memory_at_address(last_fp as u64)?,
            args.stack_memory
                .get_memory_at_address(last_fp as u64 + POINTER_WIDTH as u64)?,
            last_fp + POINTER_WIDTH * 2,
        )
    };

    trace!("frame pointer seems valid -- caller_pc: 0x{caller_pc:08x}, caller_sp: 0x{caller_sp:08x}");

    let mut caller_ctx = ArmContext::default();
    caller_ctx.set_register(PROGRAM_COUNTER, caller_pc);
    caller_ctx.set_register(FRAME_POINTER, caller_fp);
    caller_ctx.set_register(STACK_POINTER, caller_sp);

    let mut valid = HashSet::new();
    valid.insert(PROGRAM_COUNTER);
    valid.insert(FRAME_POINTER);
    valid.insert(STACK_POINTER);
    let context = MinidumpContext {
        raw: MinidumpRawContext::Arm(caller_ctx),
        valid: MinidumpContextValidity::Some(valid),
    };
    Some(StackFrame::from_context(context, FrameTrust::FramePointer))
}

fn get_caller_by_scan(ctx: &ArmContext, args: &GetCallerFrameArgs<'_>) -> Option<StackFrame> {
    if !args.stack_scan_allowed {
        return None;
    }
    trace!("trying scan");

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
        let caller_pc: Pointer = args.stack_memory.get_memory_at_address(address_of_pc as u64)?;
        if instruction_seems_valid(caller_pc, args.modules, args.symbol_provider) {
            // A saved return address; the caller's frame ends just above
            // it. No attempt is made to restore fp.
            let caller_sp = address_of_pc.checked_add(POINTER_WIDTH)?;

            trace!("scan seems valid -- caller_pc: 0x{caller_pc:08x}, caller_sp: 0x{caller_sp:08x}");

            let mut caller_ctx = ArmContext::default();
            caller_ctx.set_register(PROGRAM_COUNTER, caller_pc);
            caller_ctx.set_register(STACK_POINTER, caller_sp);

            let mut valid = HashSet::new();
            valid.insert(PROGRAM_COUNTER);
            valid.insert(STACK_POINTER);
            let context = MinidumpContext {
                raw: MinidumpRawContext::Arm(caller_ctx),
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
    crate::instruction_seems_valid_by_symbols(instruction as u64, modules, symbol_provider)
}

pub(crate) fn get_caller_frame(
    ctx: &ArmContext,
    args: &GetCallerFrameArgs<'_>,
) -> Option<StackFrame> {
    let mut frame = get_caller_by_cfi(ctx, args)
        .or_else(|| get_caller_by_frame_pointer(ctx, args))
        .or_else(|| get_caller_by_scan(ctx, args))?;

    if frame.context.get_instruction_pointer() < 4096 {
        trace!("instruction pointer was nullish, assuming unwind complete");
        return None;
    }
    let sp = frame.context.get_stack_pointer();
    let last_sp = ctx.get_register_always(STACK_POINTER) as u64;
    if sp <= last_sp {
        // Leaf functions may never touch the stack (the return address
        // lives in lr), so the first unwound frame may legitimately keep
        // the same stack pointer. After that, require progress.
        let is_leaf = args.callee_frame.trust == FrameTrust::Context && sp == last_sp;
        if !is_leaf {
            trace!("stack pointer went backwards, assuming unwind complete");
            return None;
        }
    }

    // Point back inside the calling instruction (2-byte Thumb units).
    let pc = frame.context.get_instruction_pointer();
    frame.instruction = pc - 2;

    Some(frame)
}
