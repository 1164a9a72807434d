//! Mapping of raw exception records to stable crash-reason strings.
//!
//! The mapping is a three-level dispatch: operating system, exception
//! code, exception flags (the sub-code). The mnemonics produced here are
//! consumed by downstream tooling and must not change. Unrecognized
//! combinations keep the numeric `"0x<code> / 0x<flags>"` fallback.
//!
//! This module also derives the fault address: Windows access violations
//! and in-page errors carry it in the exception parameters, and 32-bit
//! architectures need the address truncated.

/// The identity of the crashing system, from the system-info record.
#[derive(Clone, Copy, Debug)]
pub struct SystemContext {
    pub platform_id: u32,
    pub cpu_architecture: u16,
}

/// The OS-independent pieces of the exception record.
#[derive(Clone, Copy, Debug)]
pub struct RawExceptionInfo<'a> {
    pub code: u32,
    pub flags: u32,
    pub address: u64,
    pub parameters: &'a [u64],
}

// Platform ids.
const OS_WINDOWS: u32 = 1;
const OS_WINDOWS_NT: u32 = 2;
const OS_MAC_OS_X: u32 = 0x8101;
const OS_IOS: u32 = 0x8102;
const OS_LINUX: u32 = 0x8201;
const OS_SOLARIS: u32 = 0x8202;
const OS_ANDROID: u32 = 0x8203;
const OS_PS3: u32 = 0x8204;
const OS_FUCHSIA: u32 = 0x8206;

// CPU architecture ids.
const CPU_X86: u16 = 0;
const CPU_MIPS: u16 = 1;
const CPU_PPC: u16 = 3;
const CPU_SHX: u16 = 4;
const CPU_ARM: u16 = 5;
const CPU_AMD64: u16 = 9;
const CPU_X86_WIN64: u16 = 10;
const CPU_ARM64_OLD: u16 = 0x8003;

/// Compute the `(reason, fault_address)` pair for an exception.
pub fn crash_reason_and_address(
    system: Option<SystemContext>,
    exception: &RawExceptionInfo<'_>,
) -> (String, u64) {
    let flags_string = format!("0x{:08x}", exception.flags);
    let fallback = format!("0x{:08x} / {}", exception.code, flags_string);
    let mut address = exception.address;

    let Some(system) = system else {
        return (fallback, address);
    };

    let reason = match system.platform_id {
        OS_FUCHSIA => fuchsia_reason(exception, &flags_string),
        OS_MAC_OS_X | OS_IOS => mac_reason(system, exception, &flags_string),
        OS_WINDOWS | OS_WINDOWS_NT => windows_reason(exception, &mut address),
        OS_LINUX | OS_ANDROID => linux_reason(exception, &flags_string),
        OS_SOLARIS => solaris_reason(exception),
        OS_PS3 => ps3_reason(exception),
        _ => None,
    };
    let reason = reason.unwrap_or(fallback);

    (reason, address_for_architecture(system.cpu_architecture, address))
}

/// 32-bit architectures get the fault address truncated to 32 bits; the
/// rest keep it verbatim.
pub fn address_for_architecture(cpu_architecture: u16, address: u64) -> u64 {
    match cpu_architecture {
        CPU_X86 | CPU_MIPS | CPU_PPC | CPU_SHX | CPU_ARM | CPU_X86_WIN64 => address & 0xffff_ffff,
        _ => address,
    }
}

fn fuchsia_reason(exception: &RawExceptionInfo<'_>, flags_string: &str) -> Option<String> {
    let name = match exception.code {
        0x0008 => "GENERAL",
        0x0108 => "FATAL_PAGE_FAULT",
        0x0208 => "UNDEFINED_INSTRUCTION",
        0x0308 => "SW_BREAKPOINT",
        0x0408 => "HW_BREAKPOINT",
        0x0508 => "UNALIGNED_ACCESS",
        0x8008 => "THREAD_STARTING",
        0x8108 => "THREAD_EXITING",
        0x8208 => "POLICY_ERROR",
        0x8308 => "PROCESS_STARTING",
        _ => return None,
    };
    Some(format!("{name} / {flags_string}"))
}

fn mac_reason(
    system: SystemContext,
    exception: &RawExceptionInfo<'_>,
    flags_string: &str,
) -> Option<String> {
    let arch = system.cpu_architecture;
    let flags = exception.flags;
    let sub = |name: &str, sub: &str| Some(format!("{name} / {sub}"));
    let raw = |name: &str| Some(format!("{name} / {flags_string}"));

    match exception.code {
        // EXC_BAD_ACCESS
        1 => match flags {
            1 => sub("EXC_BAD_ACCESS", "KERN_INVALID_ADDRESS"),
            2 => sub("EXC_BAD_ACCESS", "KERN_PROTECTION_FAILURE"),
            8 => sub("EXC_BAD_ACCESS", "KERN_NO_ACCESS"),
            9 => sub("EXC_BAD_ACCESS", "KERN_MEMORY_FAILURE"),
            10 => sub("EXC_BAD_ACCESS", "KERN_MEMORY_ERROR"),
            0x32 => sub("EXC_BAD_ACCESS", "KERN_CODESIGN_ERROR"),
            // The remaining sub-codes overlap between architectures.
            _ => match arch {
                CPU_ARM | CPU_ARM64_OLD => match flags {
                    0x101 => sub("EXC_BAD_ACCESS", "EXC_ARM_DA_ALIGN"),
                    0x102 => sub("EXC_BAD_ACCESS", "EXC_ARM_DA_DEBUG"),
                    _ => raw("EXC_BAD_ACCESS"),
                },
                CPU_PPC => match flags {
                    0x101 => sub("EXC_BAD_ACCESS", "EXC_PPC_VM_PROT_READ"),
                    0x102 => sub("EXC_BAD_ACCESS", "EXC_PPC_BADSPACE"),
                    0x103 => sub("EXC_BAD_ACCESS", "EXC_PPC_UNALIGNED"),
                    _ => raw("EXC_BAD_ACCESS"),
                },
                CPU_X86 | CPU_AMD64 => match flags {
                    13 => sub("EXC_BAD_ACCESS", "EXC_I386_GPFLT"),
                    _ => raw("EXC_BAD_ACCESS"),
                },
                _ => raw("EXC_BAD_ACCESS"),
            },
        },
        // EXC_BAD_INSTRUCTION
        2 => match arch {
            CPU_ARM | CPU_ARM64_OLD => match flags {
                1 => sub("EXC_BAD_INSTRUCTION", "EXC_ARM_UNDEFINED"),
                _ => raw("EXC_BAD_INSTRUCTION"),
            },
            CPU_PPC => match flags {
                1 => sub("EXC_BAD_INSTRUCTION", "EXC_PPC_INVALID_SYSCALL"),
                2 => sub("EXC_BAD_INSTRUCTION", "EXC_PPC_UNIPL_INST"),
                3 => sub("EXC_BAD_INSTRUCTION", "EXC_PPC_PRIVINST"),
                4 => sub("EXC_BAD_INSTRUCTION", "EXC_PPC_PRIVREG"),
                5 => sub("EXC_BAD_INSTRUCTION", "EXC_PPC_TRACE"),
                6 => sub("EXC_BAD_INSTRUCTION", "EXC_PPC_PERFMON"),
                _ => raw("EXC_BAD_INSTRUCTION"),
            },
            CPU_X86 | CPU_AMD64 => match flags {
                1 => sub("EXC_BAD_INSTRUCTION", "EXC_I386_INVOP"),
                5 => sub("EXC_BAD_INSTRUCTION", "EXC_I386_INVTSSFLT"),
                6 => sub("EXC_BAD_INSTRUCTION", "EXC_I386_SEGNPFLT"),
                7 => sub("EXC_BAD_INSTRUCTION", "EXC_I386_STKFLT"),
                13 => sub("EXC_BAD_INSTRUCTION", "EXC_I386_GPFLT"),
                17 => sub("EXC_BAD_INSTRUCTION", "EXC_I386_ALIGNFLT"),
                _ => raw("EXC_BAD_INSTRUCTION"),
            },
            _ => raw("EXC_BAD_INSTRUCTION"),
        },
        // EXC_ARITHMETIC
        3 => match arch {
            CPU_PPC => match flags {
                1 => sub("EXC_ARITHMETIC", "EXC_PPC_OVERFLOW"),
                2 => sub("EXC_ARITHMETIC", "EXC_PPC_ZERO_DIVIDE"),
                3 => sub("EXC_ARITHMETIC", "EXC_FLT_INEXACT"),
                4 => sub("EXC_ARITHMETIC", "EXC_PPC_FLT_ZERO_DIVIDE"),
                5 => sub("EXC_ARITHMETIC", "EXC_PPC_FLT_UNDERFLOW"),
                6 => sub("EXC_ARITHMETIC", "EXC_PPC_FLT_OVERFLOW"),
                7 => sub("EXC_ARITHMETIC", "EXC_PPC_FLT_NOT_A_NUMBER"),
                8 => sub("EXC_ARITHMETIC", "EXC_PPC_NOEMULATION"),
                9 => sub("EXC_ARITHMETIC", "EXC_PPC_ALTIVECASSIST"),
                _ => raw("EXC_ARITHMETIC"),
            },
            CPU_X86 | CPU_AMD64 => match flags {
                1 => sub("EXC_ARITHMETIC", "EXC_I386_DIV"),
                2 => sub("EXC_ARITHMETIC", "EXC_I386_INTO"),
                3 => sub("EXC_ARITHMETIC", "EXC_I386_NOEXT"),
                4 => sub("EXC_ARITHMETIC", "EXC_I386_EXTOVR"),
                5 => sub("EXC_ARITHMETIC", "EXC_I386_EXTERR"),
                6 => sub("EXC_ARITHMETIC", "EXC_I386_EMERR"),
                7 => sub("EXC_ARITHMETIC", "EXC_I386_BOUND"),
                8 => sub("EXC_ARITHMETIC", "EXC_I386_SSEEXTERR"),
                _ => raw("EXC_ARITHMETIC"),
            },
            _ => raw("EXC_ARITHMETIC"),
        },
        4 => raw("EXC_EMULATION"),
        // EXC_SOFTWARE
        5 => match flags {
            0x10003 => sub("EXC_SOFTWARE", "SIGABRT"),
            0xDEADC0DE => sub("EXC_SOFTWARE", "UNCAUGHT_NS_EXCEPTION"),
            // ppc-only values, unused on x86.
            0x1 => sub("EXC_SOFTWARE", "EXC_PPC_TRAP"),
            0x10100 => sub("EXC_SOFTWARE", "EXC_PPC_MIGRATE"),
            _ => raw("EXC_SOFTWARE"),
        },
        // EXC_BREAKPOINT
        6 => match arch {
            CPU_ARM | CPU_ARM64_OLD => match flags {
                0x101 => sub("EXC_BREAKPOINT", "EXC_ARM_DA_ALIGN"),
                0x102 => sub("EXC_BREAKPOINT", "EXC_ARM_DA_DEBUG"),
                1 => sub("EXC_BREAKPOINT", "EXC_ARM_BREAKPOINT"),
                _ => raw("EXC_BREAKPOINT"),
            },
            CPU_PPC => match flags {
                1 => sub("EXC_BREAKPOINT", "EXC_PPC_BREAKPOINT"),
                _ => raw("EXC_BREAKPOINT"),
            },
            CPU_X86 | CPU_AMD64 => match flags {
                1 => sub("EXC_BREAKPOINT", "EXC_I386_SGL"),
                2 => sub("EXC_BREAKPOINT", "EXC_I386_BPT"),
                _ => raw("EXC_BREAKPOINT"),
            },
            _ => raw("EXC_BREAKPOINT"),
        },
        7 => raw("EXC_SYSCALL"),
        8 => raw("EXC_MACH_SYSCALL"),
        9 => raw("EXC_RPC_ALERT"),
        11 => raw("EXC_RESOURCE"),
        12 => raw("EXC_GUARD"),
        0x43507378 => Some("Simulated Exception".to_string()),
        0xDEADC0DE => Some("Uncaught NSException".to_string()),
        _ => None,
    }
}

fn windows_reason(exception: &RawExceptionInfo<'_>, address: &mut u64) -> Option<String> {
    let parameters = exception.parameters;
    match exception.code {
        0x40010005 => Some("DBG_CONTROL_C".to_string()),
        0x80000001 => Some("EXCEPTION_GUARD_PAGE".to_string()),
        0x80000002 => Some("EXCEPTION_DATATYPE_MISALIGNMENT".to_string()),
        0x80000003 => Some("EXCEPTION_BREAKPOINT".to_string()),
        0x80000004 => Some("EXCEPTION_SINGLE_STEP".to_string()),
        0xC0000005 | 0xC0000006 => {
            // Access violations and in-page errors put the access kind in
            // the first parameter and the faulting data address in the
            // second; the code address is in the crashing thread's
            // instruction pointer regardless.
            let base = if exception.code == 0xC0000005 {
                "EXCEPTION_ACCESS_VIOLATION"
            } else {
                "EXCEPTION_IN_PAGE_ERROR"
            };
            let reason = match parameters.first() {
                Some(0) => format!("{base}_READ"),
                Some(1) => format!("{base}_WRITE"),
                Some(8) => format!("{base}_EXEC"),
                _ => base.to_string(),
            };
            if let Some(&data_address) = parameters.get(1) {
                *address = data_address;
            }
            Some(reason)
        }
        0xC0000008 => Some("EXCEPTION_INVALID_HANDLE".to_string()),
        0xC000001D => Some("EXCEPTION_ILLEGAL_INSTRUCTION".to_string()),
        0xC0000025 => Some("EXCEPTION_NONCONTINUABLE_EXCEPTION".to_string()),
        0xC0000026 => Some("EXCEPTION_INVALID_DISPOSITION".to_string()),
        0xC000008C => Some("EXCEPTION_BOUNDS_EXCEEDED".to_string()),
        0xC000008D => Some("EXCEPTION_FLT_DENORMAL_OPERAND".to_string()),
        0xC000008E => Some("EXCEPTION_FLT_DIVIDE_BY_ZERO".to_string()),
        0xC000008F => Some("EXCEPTION_FLT_INEXACT_RESULT".to_string()),
        0xC0000090 => Some("EXCEPTION_FLT_INVALID_OPERATION".to_string()),
        0xC0000091 => Some("EXCEPTION_FLT_OVERFLOW".to_string()),
        0xC0000092 => Some("EXCEPTION_FLT_STACK_CHECK".to_string()),
        0xC0000093 => Some("EXCEPTION_FLT_UNDERFLOW".to_string()),
        0xC0000094 => Some("EXCEPTION_INT_DIVIDE_BY_ZERO".to_string()),
        0xC0000095 => Some("EXCEPTION_INT_OVERFLOW".to_string()),
        0xC0000096 => Some("EXCEPTION_PRIV_INSTRUCTION".to_string()),
        0xC00000FD => Some("EXCEPTION_STACK_OVERFLOW".to_string()),
        0xC00000FF => Some("EXCEPTION_BAD_FUNCTION_TABLE".to_string()),
        0xC0000194 => Some("EXCEPTION_POSSIBLE_DEADLOCK".to_string()),
        0xC0000374 => Some("EXCEPTION_HEAP_CORRUPTION".to_string()),
        0xC0000409 => Some(
            fast_fail_subcode(parameters.first().copied())
                .unwrap_or("EXCEPTION_STACK_BUFFER_OVERRUN")
                .to_string(),
        ),
        0xE0000008 => Some("Out of Memory".to_string()),
        0xE06D7363 => Some("Unhandled C++ Exception".to_string()),
        0x0517A7ED => Some("Simulated Exception".to_string()),
        _ => None,
    }
}

/// Windows FAST_FAIL sub-codes for `STACK_BUFFER_OVERRUN`. Sub-code 0 is
/// the legacy /GS cookie failure and keeps the generic name.
fn fast_fail_subcode(subcode: Option<u64>) -> Option<&'static str> {
    Some(match subcode? {
        1 => "FAST_FAIL_VTGUARD_CHECK_FAILURE",
        2 => "FAST_FAIL_STACK_COOKIE_CHECK_FAILURE",
        3 => "FAST_FAIL_CORRUPT_LIST_ENTRY",
        4 => "FAST_FAIL_INCORRECT_STACK",
        5 => "FAST_FAIL_INVALID_ARG",
        6 => "FAST_FAIL_GS_COOKIE_INIT",
        7 => "FAST_FAIL_FATAL_APP_EXIT",
        8 => "FAST_FAIL_RANGE_CHECK_FAILURE",
        9 => "FAST_FAIL_UNSAFE_REGISTRY_ACCESS",
        10 => "FAST_FAIL_GUARD_ICALL_CHECK_FAILURE",
        11 => "FAST_FAIL_GUARD_WRITE_CHECK_FAILURE",
        12 => "FAST_FAIL_INVALID_FIBER_SWITCH",
        13 => "FAST_FAIL_INVALID_SET_OF_CONTEXT",
        14 => "FAST_FAIL_INVALID_REFERENCE_COUNT",
        18 => "FAST_FAIL_INVALID_JUMP_BUFFER",
        19 => "FAST_FAIL_MRDATA_MODIFIED",
        20 => "FAST_FAIL_CERTIFICATION_FAILURE",
        21 => "FAST_FAIL_INVALID_EXCEPTION_CHAIN",
        22 => "FAST_FAIL_CRYPTO_LIBRARY",
        23 => "FAST_FAIL_INVALID_CALL_IN_DLL_CALLOUT",
        24 => "FAST_FAIL_INVALID_IMAGE_BASE",
        25 => "FAST_FAIL_DLOAD_PROTECTION_FAILURE",
        26 => "FAST_FAIL_UNSAFE_EXTENSION_CALL",
        27 => "FAST_FAIL_DEPRECATED_SERVICE_INVOKED",
        28 => "FAST_FAIL_INVALID_BUFFER_ACCESS",
        29 => "FAST_FAIL_INVALID_BALANCED_TREE",
        30 => "FAST_FAIL_INVALID_NEXT_THREAD",
        31 => "FAST_FAIL_GUARD_ICALL_CHECK_SUPPRESSED",
        32 => "FAST_FAIL_APCS_DISABLED",
        33 => "FAST_FAIL_INVALID_IDLE_STATE",
        34 => "FAST_FAIL_MRDATA_PROTECTION_FAILURE",
        35 => "FAST_FAIL_UNEXPECTED_HEAP_EXCEPTION",
        36 => "FAST_FAIL_INVALID_LOCK_STATE",
        37 => "FAST_FAIL_GUARD_JUMPTABLE",
        38 => "FAST_FAIL_INVALID_LONGJUMP_TARGET",
        39 => "FAST_FAIL_INVALID_DISPATCH_CONTEXT",
        40 => "FAST_FAIL_INVALID_THREAD",
        41 => "FAST_FAIL_INVALID_SYSCALL_NUMBER",
        42 => "FAST_FAIL_INVALID_FILE_OPERATION",
        43 => "FAST_FAIL_LPAC_ACCESS_DENIED",
        44 => "FAST_FAIL_GUARD_SS_FAILURE",
        45 => "FAST_FAIL_LOADER_CONTINUITY_FAILURE",
        46 => "FAST_FAIL_GUARD_EXPORT_SUPPRESSION_FAILURE",
        47 => "FAST_FAIL_INVALID_CONTROL_STACK",
        48 => "FAST_FAIL_SET_CONTEXT_DENIED",
        49 => "FAST_FAIL_INVALID_IAT",
        50 => "FAST_FAIL_HEAP_METADATA_CORRUPTION",
        51 => "FAST_FAIL_PAYLOAD_RESTRICTION_VIOLATION",
        52 => "FAST_FAIL_LOW_LABEL_ACCESS_DENIED",
        53 => "FAST_FAIL_ENCLAVE_CALL_FAILURE",
        54 => "FAST_FAIL_UNHANDLED_LSS_EXCEPTON",
        55 => "FAST_FAIL_ADMINLESS_ACCESS_DENIED",
        56 => "FAST_FAIL_UNEXPECTED_CALL",
        57 => "FAST_FAIL_CONTROL_INVALID_RETURN_ADDRESS",
        58 => "FAST_FAIL_UNEXPECTED_HOST_BEHAVIOR",
        59 => "FAST_FAIL_FLAGS_CORRUPTION",
        60 => "FAST_FAIL_VEH_CORRUPTION",
        61 => "FAST_FAIL_ETW_CORRUPTION",
        62 => "FAST_FAIL_RIO_ABORT",
        63 => "FAST_FAIL_INVALID_PFN",
        64 => "FAST_FAIL_GUARD_ICALL_CHECK_FAILURE_XFG",
        65 => "FAST_FAIL_CAST_GUARD",
        66 => "FAST_FAIL_HOST_VISIBILITY_CHANGE",
        67 => "FAST_FAIL_KERNEL_CET_SHADOW_STACK_ASSIST",
        68 => "FAST_FAIL_PATCH_CALLBACK_FAILED",
        69 => "FAST_FAIL_NTDLL_PATCH_FAILED",
        70 => "FAST_FAIL_INVALID_FLS_DATA",
        _ => return None,
    })
}

fn linux_reason(exception: &RawExceptionInfo<'_>, flags_string: &str) -> Option<String> {
    let flags = exception.flags;
    let with_si_code = |signal: &str, known: Option<&str>| match known {
        Some(si_code) => Some(format!("{signal}{si_code}")),
        None => Some(format!("{signal}{flags_string}")),
    };
    match exception.code {
        1 => Some("SIGHUP".to_string()),
        2 => Some("SIGINT".to_string()),
        3 => Some("SIGQUIT".to_string()),
        4 => with_si_code(
            "SIGILL / ",
            match flags {
                1 => Some("ILL_ILLOPC"),
                2 => Some("ILL_ILLOPN"),
                3 => Some("ILL_ILLADR"),
                4 => Some("ILL_ILLTRP"),
                5 => Some("ILL_PRVOPC"),
                6 => Some("ILL_PRVREG"),
                7 => Some("ILL_COPROC"),
                8 => Some("ILL_BADSTK"),
                _ => None,
            },
        ),
        5 => Some("SIGTRAP".to_string()),
        6 => Some("SIGABRT".to_string()),
        7 => with_si_code(
            "SIGBUS / ",
            match flags {
                1 => Some("BUS_ADRALN"),
                2 => Some("BUS_ADRERR"),
                3 => Some("BUS_OBJERR"),
                4 => Some("BUS_MCEERR_AR"),
                5 => Some("BUS_MCEERR_AO"),
                _ => None,
            },
        ),
        8 => with_si_code(
            "SIGFPE / ",
            match flags {
                1 => Some("FPE_INTDIV"),
                2 => Some("FPE_INTOVF"),
                3 => Some("FPE_FLTDIV"),
                4 => Some("FPE_FLTOVF"),
                5 => Some("FPE_FLTUND"),
                6 => Some("FPE_FLTRES"),
                7 => Some("FPE_FLTINV"),
                8 => Some("FPE_FLTSUB"),
                _ => None,
            },
        ),
        9 => Some("SIGKILL".to_string()),
        10 => Some("SIGUSR1".to_string()),
        // The historical spelling has no space after the slash.
        11 => with_si_code(
            "SIGSEGV /",
            match flags {
                1 => Some("SEGV_MAPERR"),
                2 => Some("SEGV_ACCERR"),
                3 => Some("SEGV_BNDERR"),
                4 => Some("SEGV_PKUERR"),
                5 => Some("SEGV_ACCADI"),
                6 => Some("SEGV_ADIDERR"),
                7 => Some("SEGV_ADIPERR"),
                8 => Some("SEGV_MTEAERR"),
                9 => Some("SEGV_MTESERR"),
                _ => None,
            },
        ),
        12 => Some("SIGUSR2".to_string()),
        13 => Some("SIGPIPE".to_string()),
        14 => Some("SIGALRM".to_string()),
        15 => Some("SIGTERM".to_string()),
        16 => Some("SIGSTKFLT".to_string()),
        17 => Some("SIGCHLD".to_string()),
        18 => Some("SIGCONT".to_string()),
        19 => Some("SIGSTOP".to_string()),
        20 => Some("SIGTSTP".to_string()),
        21 => Some("SIGTTIN".to_string()),
        22 => Some("SIGTTOU".to_string()),
        23 => Some("SIGURG".to_string()),
        24 => Some("SIGXCPU".to_string()),
        25 => Some("SIGXFSZ".to_string()),
        26 => Some("SIGVTALRM".to_string()),
        27 => Some("SIGPROF".to_string()),
        28 => Some("SIGWINCH".to_string()),
        29 => Some("SIGIO".to_string()),
        30 => Some("SIGPWR".to_string()),
        31 => Some("SIGSYS".to_string()),
        0xFFFFFFFF => Some("DUMP_REQUESTED".to_string()),
        _ => None,
    }
}

fn solaris_reason(exception: &RawExceptionInfo<'_>) -> Option<String> {
    let name = match exception.code {
        1 => "SIGHUP",
        2 => "SIGINT",
        3 => "SIGQUIT",
        4 => "SIGILL",
        5 => "SIGTRAP",
        6 => "SIGIOT | SIGABRT",
        7 => "SIGEMT",
        8 => "SIGFPE",
        9 => "SIGKILL",
        10 => "SIGBUS",
        11 => "SIGSEGV",
        12 => "SIGSYS",
        13 => "SIGPIPE",
        14 => "SIGALRM",
        15 => "SIGTERM",
        16 => "SIGUSR1",
        17 => "SIGUSR2",
        18 => "SIGCLD | SIGCHLD",
        19 => "SIGPWR",
        20 => "SIGWINCH",
        21 => "SIGURG",
        22 => "SIGPOLL | SIGIO",
        23 => "SIGSTOP",
        24 => "SIGTSTP",
        25 => "SIGCONT",
        26 => "SIGTTIN",
        27 => "SIGTTOU",
        28 => "SIGVTALRM",
        29 => "SIGPROF",
        30 => "SIGXCPU",
        31 => "SIGXFSZ",
        32 => "SIGWAITING",
        33 => "SIGLWP",
        34 => "SIGFREEZE",
        35 => "SIGTHAW",
        36 => "SIGCANCEL",
        37 => "SIGLOST",
        38 => "SIGXRES",
        39 => "SIGJVM1",
        40 => "SIGJVM2",
        _ => return None,
    };
    Some(name.to_string())
}

fn ps3_reason(exception: &RawExceptionInfo<'_>) -> Option<String> {
    let name = match exception.code {
        0 => "UNKNOWN",
        1 => "TRAP_EXCEP",
        2 => "PRIV_INSTR",
        3 => "ILLEGAL_INSTR",
        4 => "INSTR_STORAGE",
        5 => "INSTR_SEGMENT",
        6 => "DATA_STORAGE",
        7 => "DATA_SEGMENT",
        8 => "FLOAT_POINT",
        9 => "DABR_MATCH",
        10 => "ALIGN_EXCEP",
        11 => "MEMORY_ACCESS",
        12 => "COPRO_ALIGN",
        13 => "COPRO_INVALID_COM",
        14 => "COPRO_ERR",
        15 => "COPRO_FIR",
        16 => "COPRO_DATA_SEGMENT",
        17 => "COPRO_DATA_STORAGE",
        18 => "COPRO_STOP_INSTR",
        19 => "COPRO_HALT_INSTR",
        20 => "COPRO_HALTINSTR_UNKNOWN",
        21 => "COPRO_MEMORY_ACCESS",
        22 => "GRAPHIC",
        _ => return None,
    };
    Some(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason(platform_id: u32, arch: u16, code: u32, flags: u32, parameters: &[u64]) -> String {
        let (reason, _) = crash_reason_and_address(
            Some(SystemContext {
                platform_id,
                cpu_architecture: arch,
            }),
            &RawExceptionInfo {
                code,
                flags,
                address: 0xdeadbeef,
                parameters,
            },
        );
        reason
    }

    #[test]
    fn mac_subcodes() {
        assert_eq!(
            reason(OS_MAC_OS_X, CPU_AMD64, 1, 1, &[]),
            "EXC_BAD_ACCESS / KERN_INVALID_ADDRESS"
        );
        assert_eq!(
            reason(OS_MAC_OS_X, CPU_AMD64, 1, 13, &[]),
            "EXC_BAD_ACCESS / EXC_I386_GPFLT"
        );
        assert_eq!(
            reason(OS_IOS, CPU_ARM, 1, 0x101, &[]),
            "EXC_BAD_ACCESS / EXC_ARM_DA_ALIGN"
        );
        assert_eq!(
            reason(OS_MAC_OS_X, CPU_PPC, 3, 9, &[]),
            "EXC_ARITHMETIC / EXC_PPC_ALTIVECASSIST"
        );
        assert_eq!(
            reason(OS_MAC_OS_X, CPU_AMD64, 5, 0x10003, &[]),
            "EXC_SOFTWARE / SIGABRT"
        );
        assert_eq!(
            reason(OS_MAC_OS_X, CPU_AMD64, 6, 2, &[]),
            "EXC_BREAKPOINT / EXC_I386_BPT"
        );
        // Unknown sub-code keeps the numeric flags.
        assert_eq!(
            reason(OS_MAC_OS_X, CPU_AMD64, 2, 0x77, &[]),
            "EXC_BAD_INSTRUCTION / 0x00000077"
        );
    }

    #[test]
    fn windows_access_violation() {
        assert_eq!(
            reason(OS_WINDOWS_NT, CPU_X86, 0xC0000005, 0, &[]),
            "EXCEPTION_ACCESS_VIOLATION"
        );
        assert_eq!(
            reason(OS_WINDOWS_NT, CPU_AMD64, 0xC0000005, 0, &[0]),
            "EXCEPTION_ACCESS_VIOLATION_READ"
        );
        assert_eq!(
            reason(OS_WINDOWS_NT, CPU_AMD64, 0xC0000005, 0, &[1]),
            "EXCEPTION_ACCESS_VIOLATION_WRITE"
        );
        assert_eq!(
            reason(OS_WINDOWS_NT, CPU_AMD64, 0xC0000005, 0, &[8]),
            "EXCEPTION_ACCESS_VIOLATION_EXEC"
        );

        // The second parameter overrides the fault address.
        let (reason, address) = crash_reason_and_address(
            Some(SystemContext {
                platform_id: OS_WINDOWS_NT,
                cpu_architecture: CPU_AMD64,
            }),
            &RawExceptionInfo {
                code: 0xC0000005,
                flags: 0,
                address: 0x1000,
                parameters: &[1, 0x7fff12345678],
            },
        );
        assert_eq!(reason, "EXCEPTION_ACCESS_VIOLATION_WRITE");
        assert_eq!(address, 0x7fff12345678);
    }

    #[test]
    fn windows_fast_fail() {
        assert_eq!(
            reason(OS_WINDOWS_NT, CPU_AMD64, 0xC0000409, 0, &[2]),
            "FAST_FAIL_STACK_COOKIE_CHECK_FAILURE"
        );
        // Legacy /GS and unknown sub-codes keep the generic name.
        assert_eq!(
            reason(OS_WINDOWS_NT, CPU_AMD64, 0xC0000409, 0, &[0]),
            "EXCEPTION_STACK_BUFFER_OVERRUN"
        );
        assert_eq!(
            reason(OS_WINDOWS_NT, CPU_AMD64, 0xC0000409, 0, &[]),
            "EXCEPTION_STACK_BUFFER_OVERRUN"
        );
    }

    #[test]
    fn linux_signals() {
        assert_eq!(
            reason(OS_LINUX, CPU_AMD64, 11, 1, &[]),
            "SIGSEGV /SEGV_MAPERR"
        );
        assert_eq!(
            reason(OS_ANDROID, CPU_ARM, 4, 5, &[]),
            "SIGILL / ILL_PRVOPC"
        );
        assert_eq!(reason(OS_LINUX, CPU_AMD64, 6, 0, &[]), "SIGABRT");
        assert_eq!(
            reason(OS_LINUX, CPU_AMD64, 0xFFFFFFFF, 0, &[]),
            "DUMP_REQUESTED"
        );
        // Unknown si_code falls back to the numeric flags.
        assert_eq!(
            reason(OS_LINUX, CPU_AMD64, 8, 0x42, &[]),
            "SIGFPE / 0x00000042"
        );
    }

    #[test]
    fn fuchsia_and_ps3() {
        assert_eq!(
            reason(OS_FUCHSIA, CPU_AMD64, 0x108, 7, &[]),
            "FATAL_PAGE_FAULT / 0x00000007"
        );
        assert_eq!(reason(OS_PS3, CPU_PPC, 6, 0, &[]), "DATA_STORAGE");
    }

    #[test]
    fn unknown_combinations_fall_back_to_hex() {
        assert_eq!(
            reason(OS_LINUX, CPU_AMD64, 0x1234, 0x99, &[]),
            "0x00001234 / 0x00000099"
        );
        let (reason, _) = crash_reason_and_address(
            None,
            &RawExceptionInfo {
                code: 0xC0000005,
                flags: 0,
                address: 0,
                parameters: &[],
            },
        );
        assert_eq!(reason, "0xc0000005 / 0x00000000");
    }

    #[test]
    fn address_truncation() {
        // 32-bit architectures truncate; 64-bit keep the value.
        assert_eq!(
            address_for_architecture(CPU_X86, 0xffffffff12345678),
            0x12345678
        );
        assert_eq!(address_for_architecture(CPU_ARM, 0x1_0000_0000), 0);
        assert_eq!(
            address_for_architecture(CPU_AMD64, 0xffffffff12345678),
            0xffffffff12345678
        );
        let (_, address) = crash_reason_and_address(
            Some(SystemContext {
                platform_id: OS_LINUX,
                cpu_architecture: CPU_ARM,
            }),
            &RawExceptionInfo {
                code: 11,
                flags: 1,
                address: 0xffffffff80001000,
                parameters: &[],
            },
        );
        assert_eq!(address, 0x80001000);
    }
}
