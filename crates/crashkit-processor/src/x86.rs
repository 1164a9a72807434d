//! x86 unwinder: STACK CFI, then the traditional %ebp frame chain, then
//! stack scanning.

use std::collections::HashSet;

use minidump::format::CONTEXT_X86;
use minidump::{
    MinidumpContext, MinidumpContextValidity, MinidumpModuleList, MinidumpRawContext,
    UnifiedMemory,
};
use tracing::trace;

use crate::impl_prelude::*;

type Pointer = u32;
const POINTER_WIDTH: Pointer = 4;
const INSTRUCTION_REGISTER: &str = "eip";
const STACK_POINTER_REGISTER: &str = "esp";
const FRAME_POINTER_REGISTER: &str = "ebp";
const CALLEE_SAVED_REGS: &[&str] = &["ebp", "ebx", "edi", "esi"];

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

fn get_caller_by_cfi(ctx: &CONTEXT_X86, args: &GetCallerFrameArgs<'_>) -> Option<StackFrame> {
    trace!("trying cfi");

    if let MinidumpContextValidity::Some(ref which) = args.valid() {
        if !which.contains(STACK_POINTER_REGISTER) {
            return None;
        }
    }

    let mut stack_walker = CfiStackWalker::from_ctx_and_args(ctx, args, callee_forwarded_regs)?;
    args.symbol_provider
        .walk_frame(stack_walker.module, &mut stack_walker)?;

    let caller_ip = stack_walker.caller_ctx.eip;
    let caller_sp = stack_walker.caller_ctx.esp;
    trace!("cfi evaluation was successful -- caller_ip: 0x{caller_ip:08x}, caller_sp: 0x{caller_sp:08x}");

    // A successful CFI evaluation is trusted as-is; the CFA and RA were
    // required to resolve, which is all the validation this step does.
    let context = MinidumpContext {
        raw: MinidumpRawContext::X86(stack_walker.caller_ctx),
        valid: MinidumpContextValidity::Some(stack_walker.caller_validity),
    };
    Some(StackFrame::from_context(context, FrameTrust::CallFrameInfo))
}

fn get_caller_by_frame_pointer(
    ctx: &CONTEXT_X86,
    args: &GetCallerFrameArgs<'_>,
) -> Option<StackFrame> {
    trace!("trying frame pointer");
    if let MinidumpContextValidity::Some(ref which) = args.valid() {
        if !which.contains(FRAME_POINTER_REGISTER) || !which.contains(STACK_POINTER_REGISTER) {
            return None;
        }
    }

    let stack_memory = args.stack_memory;
    let last_bp = ctx.ebp;
    let last_sp = ctx.esp;

    // In the traditional prologue, CALL pushed the return address, then
    // the callee pushed the caller's %ebp and copied %esp into %ebp:
    //
    //   %ip_new = *(%bp_old + 4)
    //   %bp_new = *(%bp_old)
    //   %sp_new = %bp_old + 8

    if last_bp >= Pointer::MAX - POINTER_WIDTH * 2 {
        // Overflow guard so debug builds cannot panic on the math below.
        return None;
    }
    let caller_ip: Pointer = stack_memory.get_memory_at_address((last_bp + POINTER_WIDTH) as u64)?;
    let caller_bp: Pointer = stack_memory.get_memory_at_address(last_bp as u64)?;
    let caller_sp = last_bp + POINTER_WIDTH * 2;

    // The chain must be coherent: the frame pointer walks up the stack
    // and stays inside it.
    if caller_sp <= last_bp || caller_bp < caller_sp {
        trace!("rejecting frame pointer result for unreasonable frame pointer");
        return None;
    }
    let _: Pointer = stack_memory.get_memory_at_address(caller_bp as u64)?;
    if !stack_seems_valid(caller_sp, last_sp, stack_memory) {
        trace!("rejecting frame pointer result for unreasonable stack pointer");
        return None;
    }

    trace!("frame pointer seems valid -- caller_ip: 0x{caller_ip:08x}, caller_sp: 0x{caller_sp:08x}");

    let caller_ctx = CONTEXT_X86 {
        eip: caller_ip,
        esp: caller_sp,
        ebp: caller_bp,
        ..CONTEXT_X86::default()
    };
    let mut valid = HashSet::new();
    valid.insert(INSTRUCTION_REGISTER);
    valid.insert(STACK_POINTER_REGISTER);
    valid.insert(FRAME_POINTER_REGISTER);
    let context = MinidumpContext {
        raw: MinidumpRawContext::X86(caller_ctx),
        valid: MinidumpContextValidity::Some(valid),
    };
    Some(StackFrame::from_context(context, FrameTrust::FramePointer))
}

fn get_caller_by_scan(ctx: &CONTEXT_X86, args: &GetCallerFrameArgs<'_>) -> Option<StackFrame> {
    if !args.stack_scan_allowed {
        return None;
    }
    trace!("trying scan");

    // Walk up from the end of the callee's frame looking for a value that
    // points into some module's code; assume it is a return address the
    // CALL instruction pushed, so the caller's frame ends just above it.
    let stack_memory = args.stack_memory;
    let last_bp = match args.valid() {
        MinidumpContextValidity::All => Some(ctx.ebp),
        MinidumpContextValidity::Some(ref which) => {
            if !which.contains(STACK_POINTER_REGISTER) {
                trace!("cannot scan without stack pointer");
                return None;
            }
            which.contains(FRAME_POINTER_REGISTER).then_some(ctx.ebp)
        }
    };
    let last_sp = ctx.esp;

    // The first frame of an unwind can be wildly misaligned, so it gets a
    // deeper search.
    let default_scan_range = 40;
    let extended_scan_range = default_scan_range * 4;
    let scan_range = if let FrameTrust::Context = args.callee_frame.trust {
        extended_scan_range
    } else {
        default_scan_range
    };

    for i in 0..scan_range {
        let address_of_ip = last_sp.checked_add(i * POINTER_WIDTH)?;
        let caller_ip: Pointer = stack_memory.get_memory_at_address(address_of_ip as u64)?;
        if !instruction_seems_valid(caller_ip, args.modules, args.symbol_provider) {
            continue;
        }
        let caller_sp = address_of_ip.checked_add(POINTER_WIDTH)?;

        // Try to restore %ebp as well. Either this function's prologue
        // saved it right below the return address, or the function never
        // touched it and the callee's value is still the caller's.
        const MAX_REASONABLE_GAP_BETWEEN_FRAMES: Pointer = 128 * 1024;
        let mut caller_bp = None;
        if i > 0 {
            let address_of_bp = address_of_ip - POINTER_WIDTH;
            let bp: Pointer = stack_memory.get_memory_at_address(address_of_bp as u64)?;
            if bp > address_of_ip && bp - address_of_bp <= MAX_REASONABLE_GAP_BETWEEN_FRAMES {
                if stack_memory
                    .get_memory_at_address::<Pointer>(bp as u64)
                    .is_some()
                {
                    caller_bp = Some(bp);
                }
            } else if let Some(last_bp) = last_bp {
                if last_bp >= caller_sp {
                    caller_bp = Some(last_bp);
                }
            }
        }

        trace!("scan seems valid -- caller_ip: 0x{caller_ip:08x}, caller_sp: 0x{caller_sp:08x}");

        let caller_ctx = CONTEXT_X86 {
            eip: caller_ip,
            esp: caller_sp,
            ebp: caller_bp.unwrap_or(0),
            ..CONTEXT_X86::default()
        };
        let mut valid = HashSet::new();
        valid.insert(INSTRUCTION_REGISTER);
        valid.insert(STACK_POINTER_REGISTER);
        if caller_bp.is_some() {
            valid.insert(FRAME_POINTER_REGISTER);
        }
        let context = MinidumpContext {
            raw: MinidumpRawContext::X86(caller_ctx),
            valid: MinidumpContextValidity::Some(valid),
        };
        return Some(StackFrame::from_context(context, FrameTrust::Scan));
    }

    None
}

/// Strict validation, used only to tell scanned garbage from code
/// addresses. CFI and frame-pointer results intentionally skip this so
/// they can traverse modules we have no symbols for.
fn instruction_seems_valid(
    instruction: Pointer,
    modules: &MinidumpModuleList,
    symbol_provider: &dyn SymbolProvider,
) -> bool {
    if instruction < 0x1000 {
        return false;
    }
    crate::instruction_seems_valid_by_symbols(instruction as u64, modules, symbol_provider)
}

fn stack_seems_valid(
    caller_sp: Pointer,
    callee_sp: Pointer,
    stack_memory: UnifiedMemory<'_, '_>,
) -> bool {
    // The stack must not grow during an unwind.
    if caller_sp <= callee_sp {
        return false;
    }
    stack_memory
        .get_memory_at_address::<Pointer>(caller_sp as u64)
        .is_some()
}

pub(crate) fn get_caller_frame(
    ctx: &CONTEXT_X86,
    args: &GetCallerFrameArgs<'_>,
) -> Option<StackFrame> {
    let mut frame = get_caller_by_cfi(ctx, args)
        .or_else(|| get_caller_by_frame_pointer(ctx, args))
        .or_else(|| get_caller_by_scan(ctx, args))?;

    // Treat nonsense results as the end of the walk.
    if frame.context.get_instruction_pointer() < 4096 {
        trace!("instruction pointer was nullish, assuming unwind complete");
        return None;
    }
    if frame.context.get_stack_pointer() <= ctx.esp as u64 {
        trace!("stack pointer went backwards, assuming unwind complete");
        return None;
    }

    // The recovered address is the return address; step back inside the
    // CALL instruction so symbol and CFI lookups hit the call site.
    let ip = frame.context.get_instruction_pointer();
    frame.instruction = ip - 1;

    Some(frame)
}
