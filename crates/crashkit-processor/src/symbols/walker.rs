//! Evaluation of STACK CFI register-recovery rules.
//!
//! A rule set is a list of `REG: EXPR` pairs where `EXPR` is a postfix
//! expression over the callee's registers, integer constants, the
//! canonical frame address `.cfa`, and the operators `+ - * / % @ ^`
//! (`@` aligns down to a power of two, `^` dereferences stack memory).
//! `.cfa` and `.ra` must both resolve or the rule set is unusable: they
//! become the caller's stack pointer and instruction pointer.

use std::collections::HashMap;

use tracing::trace;

use crate::symbols::{CfiRules, FrameWalker};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CfiReg {
    Cfa,
    Ra,
    Other(String),
}

/// Apply `init`'s rules, patched by every delta in `deltas` in order, to
/// recover the caller's registers through `walker`.
pub fn walk_with_stack_cfi(
    init: &CfiRules,
    deltas: &[CfiRules],
    walker: &mut dyn FrameWalker,
) -> Option<()> {
    trace!("trying STACK CFI exprs");

    // Later rules override earlier ones per register; that is how the
    // delta records express incremental updates.
    let mut exprs = HashMap::new();
    parse_rules(&init.rules, &mut exprs)?;
    for delta in deltas {
        parse_rules(&delta.rules, &mut exprs)?;
    }

    let cfa_expr = exprs.remove(&CfiReg::Cfa)?;
    let ra_expr = exprs.remove(&CfiReg::Ra)?;

    // The CFA may not be defined in terms of itself.
    let cfa = eval_expr(&cfa_expr, walker, None)?;
    let ra = eval_expr(&ra_expr, walker, Some(cfa))?;
    walker.set_cfa(cfa)?;
    walker.set_ra(ra)?;

    for (reg, expr) in exprs {
        let CfiReg::Other(reg) = reg else {
            unreachable!()
        };
        match eval_expr(&expr, walker, Some(cfa)) {
            Some(value) => {
                walker.set_caller_register(&reg, value);
            }
            None => {
                // A register that fails to evaluate is unknown in the
                // caller, not forwarded from the callee.
                trace!("failed to evaluate {reg}, clearing it");
                walker.clear_caller_register(&reg);
            }
        }
    }

    Some(())
}

/// Split `REG: EXPR REG: EXPR …` into per-register expressions. Register
/// tokens end with `:`; `$` prefixes are optional on every platform.
fn parse_rules(input: &str, output: &mut HashMap<CfiReg, String>) -> Option<()> {
    let mut current: Option<(CfiReg, Vec<&str>)> = None;
    for token in input.split_ascii_whitespace() {
        if let Some(name) = token.strip_suffix(':') {
            if let Some((reg, expr)) = current.take() {
                if expr.is_empty() {
                    return None;
                }
                output.insert(reg, expr.join(" "));
            }
            let reg = match name {
                ".cfa" => CfiReg::Cfa,
                ".ra" => CfiReg::Ra,
                other => CfiReg::Other(other.trim_start_matches('$').to_string()),
            };
            current = Some((reg, Vec::new()));
        } else {
            // Expression tokens are only valid after a register.
            current.as_mut()?.1.push(token);
        }
    }
    let (reg, expr) = current?;
    if expr.is_empty() {
        return None;
    }
    output.insert(reg, expr.join(" "));
    Some(())
}

fn eval_expr(expr: &str, walker: &mut dyn FrameWalker, cfa: Option<u64>) -> Option<u64> {
    let mut stack: Vec<u64> = Vec::new();

    let binop = |stack: &mut Vec<u64>, op: fn(u64, u64) -> Option<u64>| -> Option<()> {
        let rhs = stack.pop()?;
        let lhs = stack.pop()?;
        stack.push(op(lhs, rhs)?);
        Some(())
    };

    for token in expr.split_ascii_whitespace() {
        match token {
            "+" => binop(&mut stack, |l, r| Some(l.wrapping_add(r)))?,
            "-" => binop(&mut stack, |l, r| Some(l.wrapping_sub(r)))?,
            "*" => binop(&mut stack, |l, r| Some(l.wrapping_mul(r)))?,
            "/" => binop(&mut stack, |l, r| l.checked_div(r))?,
            "%" => binop(&mut stack, |l, r| l.checked_rem(r))?,
            "@" => binop(&mut stack, |l, r| {
                // Align: truncate lhs to a multiple of the power of two rhs.
                if r == 0 || !r.is_power_of_two() {
                    return None;
                }
                Some(l & !(r - 1))
            })?,
            "^" => {
                let address = stack.pop()?;
                stack.push(walker.get_register_at_address(address)?);
            }
            ".cfa" => stack.push(cfa?),
            ".undef" => return None,
            _ => {
                if let Some(reg) = token.strip_prefix('$') {
                    stack.push(walker.get_callee_register(reg)?);
                } else if let Ok(value) = token.parse::<i64>() {
                    stack.push(value as u64);
                } else if let Some(value) = walker.get_callee_register(token) {
                    // ARM-style bare register names.
                    stack.push(value);
                } else {
                    trace!("STACK CFI eval hit an unknown token: {token}");
                    return None;
                }
            }
        }
    }

    if stack.len() == 1 {
        stack.pop()
    } else {
        None
    }
}
