use std::collections::HashMap;

use minidump::format::CONTEXT_AMD64;
use minidump::system_info::{Cpu, Os};
use minidump::*;
use test_assembler::*;

use crate::*;

struct TestFixture {
    pub raw: CONTEXT_AMD64,
    pub modules: MinidumpModuleList,
    pub symbols: HashMap<String, String>,
    pub os: Os,
    pub options: WalkerOptions,
}

impl TestFixture {
    pub fn new() -> TestFixture {
        TestFixture {
            raw: CONTEXT_AMD64::default(),
            modules: MinidumpModuleList::from_modules(vec![
                MinidumpModule::new(0x00007400c0000000, 0x10000, "module1"),
                MinidumpModule::new(0x00007500b0000000, 0x10000, "module2"),
            ]),
            symbols: HashMap::new(),
            os: Os::Linux,
            options: WalkerOptions::default(),
        }
    }

    pub fn walk_stack(&self, stack: Section) -> CallStack {
        let context = MinidumpContext {
            raw: MinidumpRawContext::Amd64(self.raw.clone()),
            valid: MinidumpContextValidity::All,
        };
        let base = stack.start().value().unwrap();
        let size = stack.size();
        let stack_bytes = stack.get_contents().unwrap();
        let stack_memory = MinidumpMemory {
            desc: Default::default(),
            base_address: base,
            size,
            bytes: &stack_bytes,
            endian: scroll::LE,
        };
        let system_info = SystemInfo {
            os_id: self.os,
            cpu_id: Cpu::X86_64,
            ..Default::default()
        };
        let symbolizer = Symbolizer::new(string_symbol_supplier(self.symbols.clone()));
        let mut stack = CallStack::with_context(context);

        walk_stack(
            &mut stack,
            Some(UnifiedMemory::Memory(&stack_memory)),
            &self.modules,
            None,
            &system_info,
            &symbolizer,
            &self.options,
        );
        stack
    }

    pub fn add_symbols(&mut self, name: String, symbols: String) {
        self.symbols.insert(name, symbols);
    }
}

#[test]
fn test_simple() {
    let mut f = TestFixture::new();
    let mut stack = Section::new();
    stack.start().set_const(0x80000000000);
    stack = stack.D64(0).D64(0);
    f.raw.rip = 0x00007400c0000200;
    f.raw.rbp = 0x80000000000;
    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 1);
    let m = s.frames[0].module.as_ref().unwrap();
    assert_eq!(m.code_file(), "module1");
}

#[test]
fn test_caller_pushed_rbp() {
    // Functions that save %rbp in their prologue and use it as the frame
    // pointer produce a walkable chain.
    let mut f = TestFixture::new();
    let frame0_rbp = Label::new();
    let frame1_rbp = Label::new();
    let mut stack = Section::new();
    stack.start().set_const(0x80000000000);
    let return_address: u64 = 0x00007500b0000110;
    stack = stack
        .append_repeated(0, 16) // frame 0: space
        .mark(&frame0_rbp) // frame 0 %rbp points here
        .D64(&frame1_rbp) // frame 0: saved %rbp
        .D64(return_address) // frame 0: return address
        .append_repeated(0, 16) // frame 1: space
        .mark(&frame1_rbp) // frame 1 %rbp points here
        .D64(0) // frame 1: saved %rbp (stack end)
        .D64(0); // frame 1: return address (stack end)
    f.raw.rip = 0x00007400c0000200;
    f.raw.rbp = frame0_rbp.value().unwrap();
    f.raw.rsp = stack.start().value().unwrap();

    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 2);

    {
        let f0 = &s.frames[0];
        assert_eq!(f0.trust, FrameTrust::Context);
        assert_eq!(f0.instruction, 0x00007400c0000200);
    }
    {
        let f1 = &s.frames[1];
        assert_eq!(f1.trust, FrameTrust::FramePointer);
        assert_eq!(f1.instruction + 1, return_address);
        if let MinidumpRawContext::Amd64(ctx) = &f1.context.raw {
            assert_eq!(ctx.rip, return_address);
            assert_eq!(ctx.rbp, frame1_rbp.value().unwrap());
        } else {
            unreachable!();
        }
    }
}

#[test]
fn test_scan_without_symbols() {
    let mut f = TestFixture::new();
    let frame1_sp = Label::new();
    let frame2_sp = Label::new();
    let mut stack = Section::new();
    stack.start().set_const(0x80000000000);

    let return_address1: u64 = 0x00007500b0000100;
    let return_address2: u64 = 0x00007500b0000900;
    stack = stack
        // frame 0
        .append_repeated(0, 16) // space
        .D64(0x00007400b0000000u64) // junk that's not
        .D64(0x00007600b0000000u64) // a return address
        .D64(return_address1) // actual return address
        // frame 1
        .mark(&frame1_sp)
        .append_repeated(0, 16) // space
        .D64(0x00007400b0000000u64) // more junk
        .D64(0x00007500d0000000u64)
        .D64(return_address2) // actual return address
        // frame 2
        .mark(&frame2_sp)
        .append_repeated(0, 32); // end of stack

    f.raw.rip = 0x00007400c0000200;
    f.raw.rsp = stack.start().value().unwrap();

    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 3);

    assert_eq!(s.frames[1].trust, FrameTrust::Scan);
    assert_eq!(s.frames[1].resume_address, return_address1);
    if let MinidumpRawContext::Amd64(ctx) = &s.frames[1].context.raw {
        assert_eq!(ctx.rsp, frame1_sp.value().unwrap());
    } else {
        unreachable!();
    }

    assert_eq!(s.frames[2].trust, FrameTrust::Scan);
    assert_eq!(s.frames[2].resume_address, return_address2);
}

#[test]
fn test_non_canonical_addresses_rejected_by_scan() {
    let mut f = TestFixture::new();
    let mut stack = Section::new();
    stack.start().set_const(0x80000000000);
    // A non-canonical "return address" must not be picked up even though
    // its low bits land inside module2.
    stack = stack
        .D64(0xdead7500b0000100u64)
        .append_repeated(0, 64);

    f.raw.rip = 0x00007400c0000200;
    f.raw.rsp = stack.start().value().unwrap();

    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 1);
}

#[test]
fn test_frame_pointer_disabled_on_windows() {
    let mut f = TestFixture::new();
    f.os = Os::Windows;
    let frame0_rbp = Label::new();
    let frame1_rbp = Label::new();
    let mut stack = Section::new();
    stack.start().set_const(0x80000000000);
    stack = stack
        .append_repeated(0, 16)
        .mark(&frame0_rbp)
        .D64(&frame1_rbp)
        .D64(0x00007500b0000110u64)
        .append_repeated(0, 16)
        .mark(&frame1_rbp)
        .D64(0)
        .D64(0);
    f.raw.rip = 0x00007400c0000200;
    f.raw.rbp = frame0_rbp.value().unwrap();
    f.raw.rsp = stack.start().value().unwrap();

    let s = f.walk_stack(stack);
    // The frame was still found, but by scanning rather than %rbp.
    assert_eq!(s.frames.len(), 2);
    assert_eq!(s.frames[1].trust, FrameTrust::Scan);
}

fn init_cfi_state() -> (TestFixture, Section, CONTEXT_AMD64, MinidumpContextValidity) {
    let mut f = TestFixture::new();
    let symbols = [
        "FUNC 900 200 10 enchiridion\n",
        "STACK CFI INIT 900 100 .cfa: $rsp 8 + .ra: .cfa 8 - ^\n",
        "STACK CFI 901 .cfa: $rsp 16 + $rbx: .cfa 16 - ^\n",
        "STACK CFI 903 .cfa: $rbp 16 + $rbp: .cfa 24 - ^\n",
        "FUNC 1000 1000 10 epictetus\n",
        "STACK CFI INIT 1000 1000 .cfa: $rsp .ra 0\n",
    ];
    f.add_symbols(String::from("module1"), symbols.concat());

    f.raw.rip = 0x00007400c0001000;
    f.raw.rsp = 0x80000000000;
    f.raw.rbp = 0x683db19defa871d6;
    f.raw.rbx = 0x2f32c50a3cf27e9a;

    let expected = f.raw.clone();
    let expected_regs: &[&str] = &["rip", "rsp", "rbp", "rbx", "r12", "r13", "r14", "r15"];
    let expected_valid = MinidumpContextValidity::Some(expected_regs.iter().copied().collect());

    let stack = Section::new();
    stack.start().set_const(f.raw.rsp);

    (f, stack, expected, expected_valid)
}

fn check_cfi(
    f: TestFixture,
    stack: Section,
    expected: CONTEXT_AMD64,
    expected_valid: MinidumpContextValidity,
) {
    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 2);

    let MinidumpContextValidity::Some(ref expected_regs) = expected_valid else {
        unreachable!();
    };
    let frame = &s.frames[1];
    assert_eq!(frame.trust, FrameTrust::CallFrameInfo);
    let MinidumpRawContext::Amd64(ctx) = &frame.context.raw else {
        unreachable!();
    };
    for reg in expected_regs {
        assert_eq!(
            ctx.get_register(reg, &frame.context.valid),
            expected.get_register(reg, &expected_valid),
            "{reg} registers didn't match!"
        );
    }
}

#[test]
fn test_cfi_at_900() {
    let (mut f, mut stack, mut expected, expected_valid) = init_cfi_state();

    let frame1_rsp = Label::new();
    stack = stack
        .D64(0x00007400c0001010u64) // return address into epictetus
        .mark(&frame1_rsp)
        .append_repeated(0, 1000);

    expected.rsp = frame1_rsp.value().unwrap();
    expected.rip = 0x00007400c0001010;
    f.raw.rip = 0x00007400c0000900;

    check_cfi(f, stack, expected, expected_valid);
}

#[test]
fn test_cfi_at_902() {
    let (mut f, mut stack, mut expected, expected_valid) = init_cfi_state();

    let frame1_rsp = Label::new();
    stack = stack
        .D64(0x2f32c50a3cf27e9au64) // saved %rbx
        .D64(0x00007400c0001010u64) // return address
        .mark(&frame1_rsp)
        .append_repeated(0, 1000);

    expected.rsp = frame1_rsp.value().unwrap();
    expected.rip = 0x00007400c0001010;
    f.raw.rip = 0x00007400c0000902;
    f.raw.rbx = 0xbad1bad1bad1bad1; // clobbered in the callee

    check_cfi(f, stack, expected, expected_valid);
}

#[test]
fn test_cfi_at_903() {
    let (mut f, mut stack, mut expected, expected_valid) = init_cfi_state();

    let frame0_rbp = Label::new();
    let frame1_rsp = Label::new();
    stack = stack
        .D64(0x683db19defa871d6u64) // saved %rbp
        .D64(0x2f32c50a3cf27e9au64) // saved %rbx
        .mark(&frame0_rbp) // seems wrong, but the rules say so
        .D64(0x00007400c0001010u64) // return address
        .mark(&frame1_rsp)
        .append_repeated(0, 1000);

    // .cfa: $rbp 16 + ; $rbp: .cfa 24 - ^ ; .ra: .cfa 8 - ^
    // With rbp pointing two slots below the return address the CFA is the
    // caller's rsp and both saved registers resolve.
    expected.rsp = frame1_rsp.value().unwrap();
    expected.rip = 0x00007400c0001010;
    f.raw.rip = 0x00007400c0000903;
    f.raw.rbp = frame0_rbp.value().unwrap() - 8;
    f.raw.rbx = 0xbad1bad1bad1bad1;
    expected.rbx = 0x2f32c50a3cf27e9a;

    check_cfi(f, stack, expected, expected_valid);
}
