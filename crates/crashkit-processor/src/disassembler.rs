//! Fault-address recovery for amd64 non-canonical accesses.
//!
//! When an amd64 access faults on a non-canonical address the kernel
//! reports the fault address as all-ones. The real address is still
//! computable: disassemble the faulting instruction (objdump over the
//! raw memory bytes) and evaluate its memory operands against the
//! register context. Whichever operand address is non-canonical is the
//! one that trapped; if both are, the larger is assumed to be the
//! poison value.

use std::io::Write;
use std::process::Command;

use minidump::format::CONTEXT_AMD64;
use minidump::{CpuContext, UnifiedMemory};
use tracing::{debug, warn};

/// The faulting instruction as objdump printed it: AT&T syntax, source
/// operand first.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct DisassembledInstruction {
    pub mnemonic: String,
    pub operands: Vec<String>,
}

impl DisassembledInstruction {
    fn src(&self) -> Option<&str> {
        self.operands.first().map(String::as_str)
    }

    fn dest(&self) -> Option<&str> {
        self.operands.get(1).map(String::as_str)
    }
}

/// Bits 47..63 must all be equal for hardware to dereference the address.
pub(crate) fn is_canonical(address: u64) -> bool {
    let high = (address as i64) >> 47;
    high == 0 || high == -1
}

/// Try to recover the true fault address of the instruction at
/// `instruction_pointer` whose bytes live in `memory`.
pub(crate) fn recover_fault_address(
    memory: UnifiedMemory<'_, '_>,
    instruction_pointer: u64,
    context: &CONTEXT_AMD64,
) -> Option<u64> {
    let (base, bytes) = match memory {
        UnifiedMemory::Memory(m) => (m.base_address, m.bytes),
        UnifiedMemory::Memory64(m) => (m.base_address, m.bytes),
    };
    let offset = instruction_pointer.checked_sub(base)? as usize;
    // The longest x86 instruction is 15 bytes.
    let window = bytes.get(offset..)?;
    let window = &window[..window.len().min(15)];
    if window.is_empty() {
        return None;
    }

    let instruction = disassemble_bytes(window)?;
    debug!(?instruction, "disassembled faulting instruction");

    let src_address = instruction
        .src()
        .and_then(|operand| effective_address(operand, context))
        .filter(|&address| !is_canonical(address));
    let dest_address = instruction
        .dest()
        .and_then(|operand| effective_address(operand, context))
        .filter(|&address| !is_canonical(address));

    match (src_address, dest_address) {
        (Some(src), Some(dest)) => Some(src.max(dest)),
        (Some(src), None) => Some(src),
        (None, Some(dest)) => Some(dest),
        (None, None) => None,
    }
}

/// Run objdump over raw instruction bytes and parse the first
/// instruction of its listing.
fn disassemble_bytes(bytes: &[u8]) -> Option<DisassembledInstruction> {
    let mut file = tempfile::NamedTempFile::new().ok()?;
    file.write_all(bytes).ok()?;

    let output = Command::new("objdump")
        .args(["-D", "-b", "binary", "-m", "i386:x86-64"])
        .arg(file.path())
        .output()
        .map_err(|error| {
            warn!(%error, "failed to run objdump");
            error
        })
        .ok()?;
    if !output.status.success() {
        warn!("objdump exited with {}", output.status);
        return None;
    }
    parse_objdump_output(&String::from_utf8_lossy(&output.stdout))
}

/// Extract the instruction at offset zero from an objdump listing.
pub(crate) fn parse_objdump_output(output: &str) -> Option<DisassembledInstruction> {
    for line in output.lines() {
        // "   0:\t48 8b 18  \tmov    (%rax),%rbx"
        let Some((offset, rest)) = line.split_once(":\t") else {
            continue;
        };
        if offset.trim() != "0" {
            continue;
        }
        let text = match rest.split_once('\t') {
            Some((_bytes, text)) => text,
            // Long instructions leave the text on the same tab stop.
            None => rest,
        };
        let mut pieces = text.trim().splitn(2, char::is_whitespace);
        let mnemonic = pieces.next()?.to_string();
        let operands = match pieces.next() {
            Some(rest) => split_operands(rest.trim()),
            None => Vec::new(),
        };
        return Some(DisassembledInstruction { mnemonic, operands });
    }
    None
}

/// Split at commas that are not inside parentheses.
fn split_operands(text: &str) -> Vec<String> {
    let mut operands = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in text.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => {
                operands.push(current.trim().to_string());
                current = String::new();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        operands.push(current.trim().to_string());
    }
    operands
}

/// Evaluate an AT&T memory operand (`disp(%base,%index,scale)`) against
/// the register context. Returns `None` for non-memory operands,
/// segment-relative or rip-relative addressing.
pub(crate) fn effective_address(operand: &str, context: &CONTEXT_AMD64) -> Option<u64> {
    let operand = operand.trim();
    if operand.starts_with('$') || operand.starts_with('*') {
        return None;
    }
    if operand.contains(':') {
        // Segment-relative; the segment bases are not in the context.
        return None;
    }

    let (displacement, inner) = match operand.split_once('(') {
        Some((disp, rest)) => (disp.trim(), Some(rest.strip_suffix(')')?)),
        None => (operand, None),
    };

    let Some(inner) = inner else {
        // Bare register operands are not memory; a bare number is an
        // absolute address.
        if displacement.starts_with('%') {
            return None;
        }
        return parse_displacement(displacement).map(|d| d as u64);
    };

    let mut address = if displacement.is_empty() {
        0i64
    } else {
        parse_displacement(displacement)?
    };

    let mut parts = inner.split(',').map(str::trim);
    let base = parts.next().unwrap_or("");
    if !base.is_empty() {
        address = address.wrapping_add(register_value(base, context)? as i64);
    }
    if let Some(index) = parts.next() {
        let scale = match parts.next() {
            Some(scale) if !scale.is_empty() => scale.parse::<i64>().ok()?,
            _ => 1,
        };
        address =
            address.wrapping_add((register_value(index, context)? as i64).wrapping_mul(scale));
    }

    Some(address as u64)
}

fn parse_displacement(text: &str) -> Option<i64> {
    let (negative, text) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let value = match text.strip_prefix("0x") {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => text.parse::<i64>().ok()?,
    };
    Some(if negative { -value } else { value })
}

fn register_value(name: &str, context: &CONTEXT_AMD64) -> Option<u64> {
    let name = name.strip_prefix('%')?;
    if name == "rip" || name == "eip" {
        // rip-relative operands need the instruction length, which the
        // listing does not give us.
        return None;
    }
    // 32-bit addressing forms read the low half of the full register.
    if let Some(rest) = name.strip_prefix('e') {
        let full = format!("r{rest}");
        return register_value_by_name(&full, context).map(|v| v & 0xffff_ffff);
    }
    register_value_by_name(name, context)
}

fn register_value_by_name(name: &str, context: &CONTEXT_AMD64) -> Option<u64> {
    if !<CONTEXT_AMD64 as CpuContext>::REGISTERS.contains(&name) {
        return None;
    }
    Some(context.get_register_always(name))
}
