use std::collections::HashMap;

use minidump::format::CONTEXT_ARM64;
use minidump::system_info::{Cpu, Os};
use minidump::*;
use test_assembler::*;

use crate::*;

struct TestFixture {
    pub raw: CONTEXT_ARM64,
    pub modules: MinidumpModuleList,
    pub symbols: HashMap<String, String>,
    pub options: WalkerOptions,
}

impl TestFixture {
    pub fn new() -> TestFixture {
        TestFixture {
            raw: CONTEXT_ARM64::default(),
            modules: MinidumpModuleList::from_modules(vec![
                MinidumpModule::new(0x40000000, 0x10000, "module1"),
                MinidumpModule::new(0x50000000, 0x10000, "module2"),
            ]),
            symbols: HashMap::new(),
            options: WalkerOptions::default(),
        }
    }

    pub fn walk_stack(&self, stack: Section) -> CallStack {
        let context = MinidumpContext {
            raw: MinidumpRawContext::Arm64(self.raw.clone()),
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
            os_id: Os::Linux,
            cpu_id: Cpu::Arm64,
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
    stack = stack.D64(0).D64(0);
    f.raw.set_register("pc", 0x40000200);
    f.raw.set_register("fp", 0x80000000);
    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 1);
    let m = s.frames[0].module.as_ref().unwrap();
    assert_eq!(m.code_file(), "module1");
}

#[test]
fn test_frame_pointer_chain() {
    let mut f = TestFixture::new();
    let record0 = Label::new();
    let record1 = Label::new();
    let mut stack = Section::new();
    stack.start().set_const(0x80000000);

    let return_address1: u64 = 0x50000100;
    let return_address2: u64 = 0x50000900;
    stack = stack
        // The active function's frame record.
        .append_repeated(0, 32)
        .mark(&record0)
        .D64(&record1) // caller's frame record
        .D64(return_address1) // the active function's own return address
        .append_repeated(0, 32)
        // The caller's frame record.
        .mark(&record1)
        .D64(0) // end of the chain
        .D64(return_address2) // the caller's return address
        .append_repeated(0, 16);

    f.raw.set_register("pc", 0x40000200);
    f.raw.set_register("lr", return_address1);
    f.raw.set_register("fp", record0.value().unwrap());
    f.raw.set_register("sp", stack.start().value().unwrap());

    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 3);

    {
        // The callee's lr is the first caller's pc.
        let f1 = &s.frames[1];
        assert_eq!(f1.trust, FrameTrust::FramePointer);
        assert_eq!(f1.resume_address, return_address1);
        assert_eq!(f1.instruction + 4, return_address1);
        if let MinidumpRawContext::Arm64(ctx) = &f1.context.raw {
            assert_eq!(ctx.get_register_always("fp"), record1.value().unwrap());
            // The naive read of the callee's record would give the
            // callee's own return address; following the chain one
            // record further recovers the caller's.
            assert_eq!(ctx.get_register_always("lr"), return_address2);
            assert_eq!(
                ctx.get_register_always("sp"),
                record0.value().unwrap() + 16
            );
        } else {
            unreachable!();
        }
    }
    {
        let f2 = &s.frames[2];
        assert_eq!(f2.trust, FrameTrust::FramePointer);
        assert_eq!(f2.resume_address, return_address2);
        assert_eq!(f2.instruction + 4, return_address2);
    }
}

#[test]
fn test_ptrauth_strip() {
    let mut f = TestFixture::new();
    let frame1_record = Label::new();
    let mut stack = Section::new();
    stack.start().set_const(0x80000000);

    // The module addresses top out below 2**32, so the mask keeps the
    // low 32 bits and strips authentication bits above them.
    let return_address1: u64 = 0x50000100;
    let signed_return_address2: u64 = 0x0024_5678_5000_0900;
    let stripped_return_address2: u64 = 0x5000_0900;
    stack = stack
        .append_repeated(0, 32)
        .mark(&frame1_record)
        .D64(0) // previous fp: end of chain
        .D64(signed_return_address2) // saved lr, with PAC bits
        .append_repeated(0, 16);

    f.raw.set_register("pc", 0x40000200);
    f.raw.set_register("lr", return_address1);
    f.raw.set_register("fp", frame1_record.value().unwrap());
    f.raw.set_register("sp", stack.start().value().unwrap());

    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 2);

    let f1 = &s.frames[1];
    if let MinidumpRawContext::Arm64(ctx) = &f1.context.raw {
        assert_eq!(ctx.get_register_always("pc"), return_address1);
        assert_eq!(ctx.get_register_always("lr"), stripped_return_address2);
    } else {
        unreachable!();
    }
}

#[test]
fn test_scan() {
    let mut f = TestFixture::new();
    let frame1_sp = Label::new();
    let mut stack = Section::new();
    stack.start().set_const(0x80000000);

    let return_address: u64 = 0x50000100;
    stack = stack
        .append_repeated(0, 16)
        .D64(0x40090000u64) // junk, outside every module
        .D64(return_address)
        .mark(&frame1_sp)
        .append_repeated(0, 32);

    f.raw.set_register("pc", 0x40000200);
    f.raw.set_register("sp", stack.start().value().unwrap());

    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 2);
    let f1 = &s.frames[1];
    assert_eq!(f1.trust, FrameTrust::Scan);
    assert_eq!(f1.resume_address, return_address);
    assert_eq!(f1.instruction + 4, return_address);
}

#[test]
fn test_cfi() {
    let mut f = TestFixture::new();
    let symbols = [
        "FUNC 4000 1000 0 haroun\n",
        "STACK CFI INIT 4000 100 .cfa: sp 16 + .ra: .cfa 8 - ^ x19: .cfa 16 - ^\n",
        "FUNC 5000 1000 0 rashid\n",
    ];
    f.add_symbols(String::from("module1"), symbols.concat());

    let frame1_sp = Label::new();
    let mut stack = Section::new();
    stack.start().set_const(0x80000000);
    stack = stack
        .D64(0x1122334455667788u64) // saved x19
        .D64(0x40005510u64) // return address (into rashid)
        .mark(&frame1_sp)
        .append_repeated(0, 64);

    f.raw.set_register("pc", 0x40004010);
    f.raw.set_register("sp", stack.start().value().unwrap());
    f.raw.set_register("x19", 0x9999999999999999);

    let s = f.walk_stack(stack);
    assert_eq!(s.frames.len(), 2);

    let f1 = &s.frames[1];
    assert_eq!(f1.trust, FrameTrust::CallFrameInfo);
    if let MinidumpRawContext::Arm64(ctx) = &f1.context.raw {
        assert_eq!(ctx.get_register_always("pc"), 0x40005510);
        assert_eq!(ctx.get_register_always("sp"), frame1_sp.value().unwrap());
        assert_eq!(ctx.get_register_always("x19"), 0x1122334455667788);
    } else {
        unreachable!();
    }
    assert_eq!(f1.function_name.as_deref(), Some("rashid"));
}
