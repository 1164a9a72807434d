use std::collections::HashMap;

use minidump::format::CONTEXT_ARM;
use minidump::system_info::{Cpu, Os};
use minidump::*;
use test_assembler::*;

use crate::*;

struct TestFixture {
    pub raw: CONTEXT_ARM,
    pub modules: MinidumpModuleList,
    pub symbols: HashMap<String, String>,
    pub os: Os,
    pub options: WalkerOptions,
}

impl TestFixture {
    pub fn new() -> TestFixture {
        TestFixture {
            raw: CONTEXT_ARM::default(),
            modules: MinidumpModuleList::from_modules(vec![
                MinidumpModule::new(0x40000000, 0x10000, "module1"),
                MinidumpModule::new(0x50000000, 0x10000, "module2"),
            ]),
            symbols: HashMap::new(),
            os: Os::Linux,
            options: WalkerOptions::default(),
        }
    }

    pub fn walk_stack(&self, stack: Section) -> CallStack {
        let context = MinidumpContext {
            raw: MinidumpRawContext::Arm(self.raw.clone()),
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
            cpu_id: Cpu::Arm,
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
    stack.start().set_const(0x80000000);
    stack = stack.D32(0).D32(0);
    f.raw.set_register("pc", 0x40000200);
    f.raw.set_register("fp", 0x80000000);
    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 1);
    let m = s.frames[0].module.as_ref().unwrap();
    assert_eq!(m.code_file(), "module1");
}

#[test]
fn test_scan_without_symbols() {
    let mut f = TestFixture::new();
    let frame1_sp = Label::new();
    let frame2_sp = Label::new();
    let mut stack = Section::new();
    stack.start().set_const(0x80000000);

    let return_address1: u32 = 0x50000100;
    let return_address2: u32 = 0x50000900;
    stack = stack
        // frame 0
        .append_repeated(0, 16)
        .D32(0x40090000u32) // junk that's not a return address
        .D32(0x60000000u32)
        .D32(return_address1)
        // frame 1
        .mark(&frame1_sp)
        .append_repeated(0, 16)
        .D32(0x40090000u32)
        .D32(0x60000000u32)
        .D32(return_address2)
        // frame 2
        .mark(&frame2_sp)
        .append_repeated(0, 32);

    f.raw.set_register("pc", 0x40000200);
    f.raw.set_register("sp", stack.start().value().unwrap() as u32);

    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 3);

    assert_eq!(s.frames[1].trust, FrameTrust::Scan);
    assert_eq!(s.frames[1].resume_address, return_address1 as u64);
    assert_eq!(s.frames[1].instruction + 2, return_address1 as u64);
    if let MinidumpRawContext::Arm(ctx) = &s.frames[1].context.raw {
        assert_eq!(ctx.get_register_always("sp"), frame1_sp.value().unwrap() as u32);
    } else {
        unreachable!();
    }

    assert_eq!(s.frames[2].trust, FrameTrust::Scan);
    assert_eq!(s.frames[2].resume_address, return_address2 as u64);
}

#[test]
fn test_frame_pointer_ios() {
    let mut f = TestFixture::new();
    f.os = Os::Ios;

    let frame1_fp = Label::new();
    let mut stack = Section::new();
    stack.start().set_const(0x80000000);

    let return_address1: u32 = 0x50000100;
    let return_address2: u32 = 0x50000900;
    stack = stack
        .append_repeated(0, 32) // frame 0: space
        .mark(&frame1_fp) // frame 1 {fp, lr} pair
        .D32(0) // saved fp (end of chain)
        .D32(return_address2) // saved lr
        .append_repeated(0, 32);

    f.raw.set_register("pc", 0x40000200);
    f.raw.set_register("lr", return_address1);
    f.raw.set_register("fp", frame1_fp.value().unwrap() as u32);
    f.raw.set_register("sp", stack.start().value().unwrap() as u32);

    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 2);

    let f1 = &s.frames[1];
    assert_eq!(f1.trust, FrameTrust::FramePointer);
    if let MinidumpRawContext::Arm(ctx) = &f1.context.raw {
        assert_eq!(ctx.get_register_always("pc"), return_address2);
        assert_eq!(ctx.get_register_always("fp"), 0);
        assert_eq!(
            ctx.get_register_always("sp"),
            frame1_fp.value().unwrap() as u32 + 8
        );
    } else {
        unreachable!();
    }
}

#[test]
fn test_cfi() {
    let mut f = TestFixture::new();
    let symbols = [
        "FUNC 4000 1000 0 devotchka\n",
        "STACK CFI INIT 4000 100 .cfa: sp 8 + .ra: .cfa 4 - ^ r4: .cfa 8 - ^\n",
        "FUNC 5000 1000 0 moloko\n",
    ];
    f.add_symbols(String::from("module1"), symbols.concat());

    let frame1_sp = Label::new();
    let mut stack = Section::new();
    stack.start().set_const(0x80000000);
    stack = stack
        .D32(0xcafebabeu32) // saved r4
        .D32(0x40005510u32) // return address (into moloko)
        .mark(&frame1_sp)
        .append_repeated(0, 64);

    f.raw.set_register("pc", 0x40004010);
    f.raw.set_register("sp", stack.start().value().unwrap() as u32);
    f.raw.set_register("r4", 0x11111111);

    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 2);

    let f1 = &s.frames[1];
    assert_eq!(f1.trust, FrameTrust::CallFrameInfo);
    if let MinidumpRawContext::Arm(ctx) = &f1.context.raw {
        assert_eq!(ctx.get_register_always("pc"), 0x40005510);
        assert_eq!(ctx.get_register_always("sp"), frame1_sp.value().unwrap() as u32);
        assert_eq!(ctx.get_register_always("r4"), 0xcafebabe);
    } else {
        unreachable!();
    }
    assert_eq!(f1.function_name.as_deref(), Some("moloko"));
}
