//! amd64 unwinder: STACK CFI, then the %rbp chain (except on Windows,
//! where frame-pointer unwinding needs `UNWIND_INFO` we do not have),
//! then stack scanning with canonical-address filtering.

use std::collections::HashSet;

use minidump::format::CONTEXT_AMD64;
use minidump::system_info::Os;
use minidump::{
    MinidumpContext, MinidumpContextValidity, MinidumpModuleList, MinidumpRawContext,
    UnifiedMemory,
};
use tracing::trace;

use crate::impl_prelude::*;

type Pointer = u64;
const POINTER_WIDTH: Pointer = 8;
const INSTRUCTION_REGISTER: &str = "rip";
const STACK_POINTER_REGISTER: &str = "rsp";
const FRAME_POINTER_REGISTER: &str = "rbp";
const CALLEE_SAVED_REGS: &[&str] = &["rbx", "rbp", "r12", "r13", "r14", "r15"];

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

fn get_caller_by_cfi(ctx: &CONTEXT_AMD64, args: &GetCallerFrameArgs<'_>) -> Option<StackFrame> {
    trace!("trying cfi");

    if let MinidumpContextValidity::Some(ref which) = args.valid() {
        if !which.contains(STACK_POINTER_REGISTER) {
            return None;
        }
    }

    let mut stack_walker = CfiStackWalker::from_ctx_and_args(ctx, args, callee_forwarded_regs)?;
    args.symbol_provider
        .walk_frame(stack_walker.module, &mut stack_walker)?;

    let caller_ip = stack_walker.caller_ctx.rip;
    let caller_sp = stack_walker.caller_ctx.rsp;
    trace!("cfi evaluation was successful -- caller_ip: 0x{caller_ip:016x}, caller_sp: 0x{caller_sp:016x}");

    let context = MinidumpContext {
        raw: MinidumpRawContext::Amd64(stack_walker.caller_ctx),
        valid: MinidumpContextValidity::Some(stack_walker.caller_validity),
    };
    Some(StackFrame::from_context(context, FrameTrust::CallFrameInfo))
}

fn get_caller_by_frame_pointer(
    ctx: &CONTEXT_AMD64,
    args: &GetCallerFrameArgs<'_>,
) -> Option<StackFrame> {
    // On Windows x64 the frame register may point into the middle of the
    // local allocation, so the on-stack data alone cannot be unwound.
    if args.system_info.os_id == Os::Windows {
        return None;
    }

    trace!("trying frame pointer");
    if let MinidumpContextValidity::Some(ref which) = args.valid() {
        if !which.contains(FRAME_POINTER_REGISTER) || !which.contains(STACK_POINTER_REGISTER) {
            return None;
        }
    }

    let stack_memory = args.stack_memory;
    let last_bp = ctx.rbp;
    let last_sp = ctx.rsp;

    // The standard %rbp convention:
    //
    //   %ip_new = *(%bp_old + 8)
    //   %bp_new = *(%bp_old)
    //   %sp_new = %bp_old + 16

    if last_bp >= u64::MAX - POINTER_WIDTH * 2 {
        // Overflow guard so debug builds cannot panic on the math below.
        return None;
    }
    let caller_ip: Pointer = stack_memory.get_memory_at_address(last_bp + POINTER_WIDTH)?;
    let caller_bp: Pointer = stack_memory.get_memory_at_address(last_bp)?;
    let caller_sp = last_bp + POINTER_WIDTH * 2;

    // Coherent frame pointers walk up the stack and stay inside it.
    if caller_sp <= last_bp || caller_bp < caller_sp {
        trace!("rejecting frame pointer result for unreasonable frame pointer");
        return None;
    }
    let _: Pointer = stack_memory.get_memory_at_address(caller_bp)?;
    if is_non_canonical(caller_ip) {
        trace!("rejecting frame pointer result for unreasonable instruction pointer");
        return None;
    }
    if !stack_seems_valid(caller_sp, last_sp, stack_memory) {
        trace!("rejecting frame pointer result for unreasonable stack pointer");
        return None;
    }

    trace!("frame pointer seems valid -- caller_ip: 0x{caller_ip:016x}, caller_sp: 0x{caller_sp:016x}");

    let caller_ctx = CONTEXT_AMD64 {
        rip: caller_ip,
        rsp: caller_sp,
        rbp: caller_bp,
        ..CONTEXT_AMD64::default()
    };
    let mut valid = HashSet::new();
    valid.insert(INSTRUCTION_REGISTER);
    valid.insert(STACK_POINTER_REGISTER);
    valid.insert(FRAME_POINTER_REGISTER);
    let context = MinidumpContext {
        raw: MinidumpRawContext::Amd64(caller_ctx),
        valid: MinidumpContextValidity::Some(valid),
    };
    Some(StackFrame::from_context(context, FrameTrust::FramePointer))
}

fn get_caller_by_scan(ctx: &CONTEXT_AMD64, args: &GetCallerFrameArgs<'_>) -> Option<StackFrame> {
    if !args.stack_scan_allowed {
        return None;
    }
    trace!("trying scan");

    let stack_memory = args.stack_memory;
    let last_bp = match args.valid() {
        MinidumpContextValidity::All => Some(ctx.rbp),
        MinidumpContextValidity::Some(ref which) => {
            if !which.contains(STACK_POINTER_REGISTER) {
                trace!("cannot scan without stack pointer");
                return None;
            }
            which.contains(FRAME_POINTER_REGISTER).then_some(ctx.rbp)
        }
    };
    let last_sp = ctx.rsp;

    let default_scan_range = 40;
    let extended_scan_range = default_scan_range * 4;
    let scan_range = if let FrameTrust::Context = args.callee_frame.trust {
        extended_scan_range
    } else {
        default_scan_range
    };

    for i in 0..scan_range {
        let address_of_ip = last_sp.checked_add(i * POINTER_WIDTH)?;
        let caller_ip: Pointer = stack_memory.get_memory_at_address(address_of_ip)?;
        if !instruction_seems_valid(caller_ip, args.modules, args.symbol_provider) {
            continue;
        }
        let caller_sp = address_of_ip.checked_add(POINTER_WIDTH)?;

        // %rbp recovery: accept the slot right below the return address
        // when it points further up the stack within a sane frame size,
        // or forward the callee's %rbp when it is still above the new
        // stack pointer. The slot-based variant additionally requires the
        // callee's %rbp to already point at that slot.
        const MAX_REASONABLE_GAP_BETWEEN_FRAMES: Pointer = 128 * 1024;
        let mut caller_bp = None;
        if let Some(last_bp) = last_bp {
            if i > 0 {
                let address_of_bp = address_of_ip - POINTER_WIDTH;
                let bp: Pointer = stack_memory.get_memory_at_address(address_of_bp)?;
                if last_bp == address_of_bp
                    && bp > address_of_ip
                    && bp - address_of_bp <= MAX_REASONABLE_GAP_BETWEEN_FRAMES
                {
                    if stack_memory.get_memory_at_address::<Pointer>(bp).is_some() {
                        caller_bp = Some(bp);
                    }
                } else if last_bp >= caller_sp {
                    caller_bp = Some(last_bp);
                }
            }
        }

        trace!("scan seems valid -- caller_ip: 0x{caller_ip:016x}, caller_sp: 0x{caller_sp:016x}");

        let caller_ctx = CONTEXT_AMD64 {
            rip: caller_ip,
            rsp: caller_sp,
            rbp: caller_bp.unwrap_or(0),
            ..CONTEXT_AMD64::default()
        };
        let mut valid = HashSet::new();
        valid.insert(INSTRUCTION_REGISTER);
        valid.insert(STACK_POINTER_REGISTER);
        if caller_bp.is_some() {
            valid.insert(FRAME_POINTER_REGISTER);
        }
        let context = MinidumpContext {
            raw: MinidumpRawContext::Amd64(caller_ctx),
            valid: MinidumpContextValidity::Some(valid),
        };
        return Some(StackFrame::from_context(context, FrameTrust::Scan));
    }

    None
}

fn instruction_seems_valid(
    instruction: Pointer,
    modules: &MinidumpModuleList,
    symbol_provider: &dyn SymbolProvider,
) -> bool {
    if instruction == 0 || is_non_canonical(instruction) {
        return false;
    }
    crate::instruction_seems_valid_by_symbols(instruction, modules, symbol_provider)
}

fn stack_seems_valid(
    caller_sp: Pointer,
    callee_sp: Pointer,
    stack_memory: UnifiedMemory<'_, '_>,
) -> bool {
    if caller_sp <= callee_sp {
        return false;
    }
    stack_memory
        .get_memory_at_address::<Pointer>(caller_sp)
        .is_some()
}

/// With 48 bits of virtual address space, bit 47 must be copied into all
/// higher bits; nothing valid lives in the gap between the halves.
fn is_non_canonical(ptr: Pointer) -> bool {
    ptr > 0x7FFF_FFFF_FFFF && ptr < 0xFFFF_8000_0000_0000
}

pub(crate) fn get_caller_frame(
    ctx: &CONTEXT_AMD64,
    args: &GetCallerFrameArgs<'_>,
) -> Option<StackFrame> {
    let mut frame = get_caller_by_cfi(ctx, args)
        .or_else(|| get_caller_by_frame_pointer(ctx, args))
        .or_else(|| get_caller_by_scan(ctx, args))?;

    if frame.context.get_instruction_pointer() < 4096 {
        trace!("instruction pointer was nullish, assuming unwind complete");
        return None;
    }
    if frame.context.get_stack_pointer() <= ctx.rsp {
        trace!("stack pointer went backwards, assuming unwind complete");
        return None;
    }

    // Step the return address back inside the CALL instruction for
    // symbol and CFI lookups.
    let ip = frame.context.get_instruction_pointer();
    frame.instruction = ip - 1;

    Some(frame)
}
