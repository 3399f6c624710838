//! Interpreter tests: the seed scenarios (trivial arithmetic, enum width
//! specialization, null-pointer faults) plus property access on live
//! objects and breakpoint hooks.

mod util;

use scriptvm::{
    error::RuntimeFault,
    frame::{call_function, ExecCtx},
    object::allocate_object,
    opcodes::{Immediate, Opcode},
    portable::PortableData,
    registry::FunctionBody,
    stub::StubFlags,
    CallParams, Environment, Name,
};
use util::{ModuleBuilder, RecordingHost};

/// `fn add(a: int32, b: int32): int32 { return a + b; }`
fn add_module() -> PortableData {
    let mut builder = ModuleBuilder::new("demo");
    let ret = builder.engine_decl(builder.module, "int32");
    let func = builder.function(None, "add", Some(ret), StubFlags::FUNCTION, 0x1122334455667788);
    let a_ty = builder.engine_decl(func, "int32");
    let b_ty = builder.engine_decl(func, "int32");
    builder.arg(func, "a", a_ty, StubFlags::empty());
    builder.arg(func, "b", b_ty, StubFlags::empty());

    builder.op0(func, Opcode::ReturnLoad4);
    builder.op0(func, Opcode::AddInt32);
    builder.op0(func, Opcode::LoadInt4);
    builder.op(func, Opcode::ParamVar, None, None, Immediate::Int(0));
    builder.op0(func, Opcode::LoadInt4);
    builder.op(func, Opcode::ParamVar, None, None, Immediate::Int(1));
    builder.build()
}

fn call_i32(env: &Environment, name: &str, args: &[i32]) -> i32 {
    let mut slots: Vec<i32> = args.to_vec();
    let mut result = 0i32;
    let mut params = CallParams::new(&mut result as *mut i32 as *mut u8);
    for (i, slot) in slots.iter_mut().enumerate() {
        params.args[i] = slot as *mut i32 as *mut u8;
    }
    assert!(
        env.call_global(Name::new(name), &params),
        "no function {}",
        name
    );
    result
}

#[test]
fn test_trivial_add() {
    let data = add_module();
    let mut env = Environment::new();
    env.load_modules(&[&data]).expect("link");

    assert_eq!(call_i32(&env, "demo.add", &[2, 3]), 5);
    assert_eq!(call_i32(&env, "demo.add", &[-10, 4]), -6);
    assert_eq!(call_i32(&env, "demo.add", &[i32::MAX, 1]), i32::MIN);
}

fn disassembly(env: &Environment, name: &str) -> String {
    let func = env
        .registry()
        .find_global_function(Name::new(name))
        .expect("function exists");
    match &env.registry().function(func).body {
        FunctionBody::Scripted(block) => block.disassemble(),
        other => panic!("unexpected body {:?}", other),
    }
}

#[test]
fn test_enum_specialization() {
    let mut builder = ModuleBuilder::new("colors");
    let enum_id = builder.enumeration(
        "E",
        StubFlags::empty(),
        "",
        &[("A", Some(1)), ("B", Some(2)), ("C", Some(200))],
    );

    // to_int(): int32 { return (int32)E.C; }
    let ret = builder.engine_decl(builder.module, "int32");
    let to_int = builder.function(None, "to_int", Some(ret), StubFlags::FUNCTION, 1);
    builder.op0(to_int, Opcode::ReturnLoad4);
    builder.op(to_int, Opcode::EnumToInt32, Some(enum_id), None, Immediate::None);
    builder.op(
        to_int,
        Opcode::EnumConst,
        Some(enum_id),
        None,
        Immediate::Name(Name::new("C")),
    );

    // to_enum(): E { return (E)3; }
    let enum_ref = builder.simple_decl(builder.module, enum_id);
    let to_enum = builder.function(None, "to_enum", Some(enum_ref), StubFlags::FUNCTION, 2);
    builder.op0(to_enum, Opcode::ReturnLoad1);
    builder.op(to_enum, Opcode::Int32ToEnum, Some(enum_id), None, Immediate::None);
    builder.op(to_enum, Opcode::IntConst4, None, None, Immediate::Int(3));

    let data = builder.build();
    let mut env = Environment::new();
    env.load_modules(&[&data]).expect("link");

    // The host enum reports the computed storage
    let host_enum = env.registry().find_enum(Name::new("colors.E")).unwrap();
    let def = env.registry().type_def(host_enum);
    let info = def.enum_info.as_ref().unwrap();
    assert_eq!((def.size, info.signed), (1, false));
    assert_eq!(info.find_value(Name::new("A")), Some(1));
    assert_eq!(info.find_value(Name::new("C")), Some(200));

    // Conversions were narrowed to width ops at build time
    assert!(disassembly(&env, "colors.to_int").contains("ExpandUnsigned8To32"));
    assert!(disassembly(&env, "colors.to_enum").contains("Contract32To8"));
    // The enum constant became a plain byte constant
    assert!(disassembly(&env, "colors.to_int").contains("UintConst1"));

    assert_eq!(call_i32(&env, "colors.to_int", &[]), 200);
}

/// Class with a scripted property and a method reading it through the
/// active context.
fn actor_module() -> PortableData {
    let mut builder = ModuleBuilder::new("world");
    let base = builder.class(
        "Obj",
        StubFlags::NATIVE | StubFlags::IMPORT | StubFlags::CLASS,
        "ScriptedObject",
    );
    let actor = builder.class("Actor", StubFlags::CLASS, "");
    builder.set_base(actor, base);

    let health_ty = builder.engine_decl(actor, "int32");
    let health = builder.property(actor, "health", health_ty, StubFlags::EDITABLE);

    let ret = builder.engine_decl(actor, "int32");
    let get = builder.function(Some(actor), "get_health", Some(ret), StubFlags::FUNCTION, 3);
    builder.op0(get, Opcode::ReturnLoad4);
    builder.op0(get, Opcode::LoadInt4);
    builder.op(get, Opcode::ContextVar, Some(health), None, Immediate::None);
    builder.build()
}

#[test]
fn test_context_property_access() {
    let data = actor_module();
    let mut env = Environment::new();
    env.load_modules(&[&data]).expect("link");

    let actor = env.registry().find_class(Name::new("world.Actor")).unwrap();
    let get = env
        .registry()
        .find_class_function(actor, Name::new("get_health"))
        .unwrap();

    let object = allocate_object(env.registry(), actor).expect("allocatable");
    let prop = env
        .registry()
        .find_property(actor, Name::new("health"))
        .unwrap();
    // Poke the property directly, as the engine's editor would
    // SAFETY: offset comes from the registry layout of this class
    unsafe {
        *(object.data_ptr().add(prop.offset as usize) as *mut i32) = 77;
    }

    let mut result = 0i32;
    let params = CallParams::new(&mut result as *mut i32 as *mut u8);
    let ctx = env.exec_ctx();
    let context = std::sync::Arc::as_ptr(&object) as *mut u8;
    call_function(&ctx, get, context, &params);
    assert_eq!(result, 77);
}

/// `fn f(): int32 { return null.health; }` in portable form: a context
/// shift through a null strong pointer.
fn null_fault_module() -> PortableData {
    let mut builder = ModuleBuilder::new("faulty");
    let base = builder.class(
        "Obj",
        StubFlags::NATIVE | StubFlags::IMPORT | StubFlags::CLASS,
        "ScriptedObject",
    );
    let actor = builder.class("Actor", StubFlags::CLASS, "");
    builder.set_base(actor, base);
    let health_ty = builder.engine_decl(actor, "int32");
    let health = builder.property(actor, "health", health_ty, StubFlags::empty());

    let ret = builder.engine_decl(builder.module, "int32");
    let func = builder.function(None, "f", Some(ret), StubFlags::FUNCTION, 4);
    builder.op0(func, Opcode::ReturnLoad4);
    builder.op0(func, Opcode::LoadInt4);
    let shift = builder.op(func, Opcode::ContextFromPtr, None, None, Immediate::None);
    builder.op0(func, Opcode::Null);
    builder.op(func, Opcode::ContextVar, Some(health), None, Immediate::None);
    let label = builder.op0(func, Opcode::Label);
    builder.slab.get_mut(shift).as_opcode_mut().unwrap().target = Some(label);
    builder.build()
}

#[test]
fn test_null_pointer_fault_with_exceptions() {
    let data = null_fault_module();
    let mut env = Environment::new();
    env.load_modules(&[&data]).expect("link");

    let host = RecordingHost::default();
    let ctx = ExecCtx {
        registry: env.registry(),
        host: &host,
        exceptions: true,
    };
    let func = env
        .registry()
        .find_global_function(Name::new("faulty.f"))
        .unwrap();

    let mut result = 123i32;
    let params = CallParams::new(&mut result as *mut i32 as *mut u8);
    call_function(&ctx, func, std::ptr::null_mut(), &params);

    assert_eq!(
        host.faults.lock().unwrap().as_slice(),
        &[RuntimeFault::NullPointer]
    );
    // The function returned without executing the load; the defined
    // result of the unwound frame is zero
    assert_eq!(result, 0);
}

#[test]
fn test_null_pointer_fallback_without_exceptions() {
    let data = null_fault_module();
    let mut env = Environment::new();
    env.load_modules(&[&data]).expect("link");

    let host = RecordingHost::default();
    let ctx = ExecCtx {
        registry: env.registry(),
        host: &host,
        exceptions: false,
    };
    let func = env
        .registry()
        .find_global_function(Name::new("faulty.f"))
        .unwrap();

    let mut result = 123i32;
    let params = CallParams::new(&mut result as *mut i32 as *mut u8);
    call_function(&ctx, func, std::ptr::null_mut(), &params);

    // No exception hook; execution took the compiler-provided fallback
    // label and finished the statement with a defined zero
    assert!(host.faults.lock().unwrap().is_empty());
    assert_eq!(result, 0);
}

#[test]
fn test_division_by_zero_faults() {
    let mut builder = ModuleBuilder::new("mathz");
    let ret = builder.engine_decl(builder.module, "int32");
    let func = builder.function(None, "div", Some(ret), StubFlags::FUNCTION, 5);
    let a_ty = builder.engine_decl(func, "int32");
    let b_ty = builder.engine_decl(func, "int32");
    builder.arg(func, "a", a_ty, StubFlags::empty());
    builder.arg(func, "b", b_ty, StubFlags::empty());
    builder.op0(func, Opcode::ReturnLoad4);
    builder.op0(func, Opcode::DivSigned32);
    builder.op0(func, Opcode::LoadInt4);
    builder.op(func, Opcode::ParamVar, None, None, Immediate::Int(0));
    builder.op0(func, Opcode::LoadInt4);
    builder.op(func, Opcode::ParamVar, None, None, Immediate::Int(1));
    let data = builder.build();

    let mut env = Environment::new();
    env.load_modules(&[&data]).expect("link");
    assert_eq!(call_i32(&env, "mathz.div", &[42, 6]), 7);

    let host = RecordingHost::default();
    let ctx = ExecCtx {
        registry: env.registry(),
        host: &host,
        exceptions: true,
    };
    let func = env
        .registry()
        .find_global_function(Name::new("mathz.div"))
        .unwrap();
    let mut a = 1i32;
    let mut b = 0i32;
    let mut result = 0i32;
    let mut params = CallParams::new(&mut result as *mut i32 as *mut u8);
    params.args[0] = &mut a as *mut i32 as *mut u8;
    params.args[1] = &mut b as *mut i32 as *mut u8;
    call_function(&ctx, func, std::ptr::null_mut(), &params);
    assert_eq!(
        host.faults.lock().unwrap().as_slice(),
        &[RuntimeFault::DivisionByZero]
    );
}

#[test]
fn test_breakpoint_hook() {
    let data = add_module();
    let mut builder = ModuleBuilder::new("bp");
    let ret = builder.engine_decl(builder.module, "int32");
    let func = builder.function(None, "stepped", Some(ret), StubFlags::FUNCTION, 6);
    builder.op0(func, Opcode::Breakpoint);
    builder.op0(func, Opcode::ReturnLoad4);
    builder.op(func, Opcode::IntConst4, None, None, Immediate::Int(9));
    let bp_data = builder.build();

    let mut env = Environment::new();
    env.load_modules(&[&data, &bp_data]).expect("link");

    let func = env
        .registry()
        .find_global_function(Name::new("bp.stepped"))
        .unwrap();
    let block = match &env.registry().function(func).body {
        FunctionBody::Scripted(block) => block.clone(),
        other => panic!("unexpected body {:?}", other),
    };

    // Disabled by default: transparent
    let host = RecordingHost::default();
    let ctx = ExecCtx {
        registry: env.registry(),
        host: &host,
        exceptions: true,
    };
    let mut result = 0i32;
    let params = CallParams::new(&mut result as *mut i32 as *mut u8);
    call_function(&ctx, func, std::ptr::null_mut(), &params);
    assert_eq!(result, 9);
    assert!(host.breakpoints.lock().unwrap().is_empty());

    // Toggle on by source line and run again
    let line = block.breakpoints()[0].source_line;
    assert!(block.toggle_breakpoint(line, true));
    assert_eq!(block.active_breakpoints(), vec![line]);
    call_function(&ctx, func, std::ptr::null_mut(), &params);
    assert_eq!(host.breakpoints.lock().unwrap().as_slice(), &[line]);

    block.disable_all_breakpoints();
    assert!(block.active_breakpoints().is_empty());
}

#[test]
fn test_local_variables_and_loops() {
    // sum(n) { local acc = 0; while (n > 0) { acc += n; n -= 1; } return acc; }
    let mut builder = ModuleBuilder::new("loops");
    let ret = builder.engine_decl(builder.module, "int32");
    let func = builder.function(None, "sum", Some(ret), StubFlags::FUNCTION, 7);
    let n_ty = builder.engine_decl(func, "int32");
    builder.arg(func, "n", n_ty, StubFlags::empty());

    let acc_ty = builder.engine_decl(func, "int32");
    let local = |b: &mut ModuleBuilder, op, f, ty| {
        b.op(
            f,
            op,
            Some(ty),
            None,
            Immediate::NamedSlot {
                name: Name::new("acc"),
                index: 0,
            },
        )
    };

    local(&mut builder, Opcode::LocalCtor, func, acc_ty);
    // loop head
    let head = builder.op0(func, Opcode::Label);
    let exit_jump = builder.op(func, Opcode::JumpIfFalse, None, None, Immediate::None);
    builder.op0(func, Opcode::TestSignedGreater4);
    builder.op0(func, Opcode::LoadInt4);
    builder.op(func, Opcode::ParamVar, None, None, Immediate::Int(0));
    builder.op0(func, Opcode::IntZero);
    // acc += n
    builder.op0(func, Opcode::AddAssignInt32);
    local(&mut builder, Opcode::LocalVar, func, acc_ty);
    builder.op0(func, Opcode::LoadInt4);
    builder.op(func, Opcode::ParamVar, None, None, Immediate::Int(0));
    // n -= 1
    builder.op0(func, Opcode::SubAssignInt32);
    builder.op(func, Opcode::ParamVar, None, None, Immediate::Int(0));
    builder.op0(func, Opcode::IntOne);
    // back to head
    let back = builder.op(func, Opcode::Jump, None, None, Immediate::None);
    let exit = builder.op0(func, Opcode::Label);
    builder.op0(func, Opcode::ReturnLoad4);
    builder.op0(func, Opcode::LoadInt4);
    local(&mut builder, Opcode::LocalVar, func, acc_ty);

    builder.slab.get_mut(back).as_opcode_mut().unwrap().target = Some(head);
    builder.slab.get_mut(exit_jump).as_opcode_mut().unwrap().target = Some(exit);
    let data = builder.build();

    let mut env = Environment::new();
    env.load_modules(&[&data]).expect("link");
    assert_eq!(call_i32(&env, "loops.sum", &[4]), 10);
    assert_eq!(call_i32(&env, "loops.sum", &[0]), 0);
    assert_eq!(call_i32(&env, "loops.sum", &[100]), 5050);
}
