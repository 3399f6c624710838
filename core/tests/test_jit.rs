//! AOT translator tests: the emitted C source carries both wrapper forms,
//! declares its imports and constants, and reports exports with the
//! original code hashes. Functions the translator cannot express fall
//! back to the interpreter and are reported as skipped.

mod util;

use scriptvm::{
    insight::RuntimeInsight,
    jit::{translate_module, TranslateSettings},
    opcodes::{Immediate, Opcode},
    stub::StubFlags,
    Environment, Name,
};
use util::ModuleBuilder;

fn add_module() -> scriptvm::PortableData {
    let mut builder = ModuleBuilder::new("demo");
    let ret = builder.engine_decl(builder.module, "int32");
    let func = builder.function(None, "add", Some(ret), StubFlags::FUNCTION, 0xfeed_beef_0042);
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

#[test]
fn test_emitted_source_shape() {
    let data = add_module();
    let mut env = Environment::new();
    env.load_modules(&[&data]).expect("link");

    let insight = RuntimeInsight::new(env.registry());
    let source = translate_module(&data, &insight, &TranslateSettings::default()).unwrap();
    let code = source.source();

    // Module init entry point with the export report
    assert!(code.contains("_bindModuleToEngine"), "{}", code);
    assert!(
        code.contains("_fnReportExportFunction(init->self, 0, \"demo.add\", 0xfeedbeef0042ULL"),
        "{}",
        code
    );

    // Simple scalar arguments: both the direct and the generic wrapper
    assert!(code.contains("__local_func_add_0(void* context, void* stackFrame, void* resultPtr, int32_t a, int32_t b)"), "{}", code);
    assert!(
        code.contains("__jit_func_add_0(void* context, void* stackFrame, struct FunctionCallingParams* params)"),
        "{}",
        code
    );
    // The generic wrapper forwards into the direct one
    assert!(
        code.contains("__local_func_add_0(context, stackFrame, params ? params->_returnPtr : 0"),
        "{}",
        code
    );
    // Direct parameter access, no calling-block indirection in the body
    assert!(code.contains("(a + b)"), "{}", code);

    assert!(source.skipped().is_empty());
    assert_eq!(source.exports().len(), 1);
    assert_eq!(source.exports()[0].code_hash, 0xfeed_beef_0042);
}

#[test]
fn test_out_params_travel_as_pointers() {
    let mut builder = ModuleBuilder::new("refs");
    let func = builder.function(None, "bump", None, StubFlags::FUNCTION, 9);
    let a_ty = builder.engine_decl(func, "int32");
    builder.arg(func, "a", a_ty, StubFlags::OUT);
    // *a = 5
    builder.op0(func, Opcode::AssignInt4);
    builder.op(func, Opcode::ParamVar, None, None, Immediate::Int(0));
    builder.op(func, Opcode::IntConst4, None, None, Immediate::Int(5));
    builder.op0(func, Opcode::Exit);
    let data = builder.build();

    let mut env = Environment::new();
    env.load_modules(&[&data]).expect("link");

    let insight = RuntimeInsight::new(env.registry());
    let source = translate_module(&data, &insight, &TranslateSettings::default()).unwrap();
    let code = source.source();

    // Out parameters still travel as pointers, so the direct wrapper
    // exists with a pointer parameter
    assert!(
        code.contains("__local_func_bump_0(void* context, void* stackFrame, void* resultPtr, int32_t* a)"),
        "{}",
        code
    );
    assert!(source.skipped().is_empty());
}

#[test]
fn test_string_constants_are_interned_globals() {
    let mut builder = ModuleBuilder::new("texts");
    let ret = builder.engine_decl(builder.module, "string");
    let func = builder.function(None, "greeting", Some(ret), StubFlags::FUNCTION, 10);
    builder.op(func, Opcode::ReturnAny, Some(ret), None, Immediate::None);
    builder.op(
        func,
        Opcode::StringConst,
        None,
        None,
        Immediate::Text("hello".into()),
    );
    let data = builder.build();

    let mut env = Environment::new();
    env.load_modules(&[&data]).expect("link");

    let insight = RuntimeInsight::new(env.registry());
    let source = translate_module(&data, &insight, &TranslateSettings::default()).unwrap();
    let code = source.source();

    assert!(code.contains("EngineString __str_0;"), "{}", code);
    assert!(
        code.contains("init->_fnInitStringConst(init->self, &__str_0, \"hello\");"),
        "{}",
        code
    );
}

#[test]
fn test_unsupported_opcode_falls_back_to_interpreter() {
    let mut builder = ModuleBuilder::new("mixed");

    let enum_id = builder.enumeration("E", StubFlags::empty(), "", &[("A", Some(1))]);

    // Translatable function
    let ret = builder.engine_decl(builder.module, "int32");
    let ok_func = builder.function(None, "fine", Some(ret), StubFlags::FUNCTION, 20);
    builder.op0(ok_func, Opcode::ReturnLoad4);
    builder.op(ok_func, Opcode::IntConst4, None, None, Immediate::Int(1));

    // Enum-to-string has no C translation; the function must be skipped
    let ret2 = builder.engine_decl(builder.module, "string");
    let bad_func = builder.function(None, "stringy", Some(ret2), StubFlags::FUNCTION, 21);
    builder.op(bad_func, Opcode::ReturnAny, Some(ret2), None, Immediate::None);
    builder.op(bad_func, Opcode::EnumToString, Some(enum_id), None, Immediate::None);
    builder.op(
        bad_func,
        Opcode::EnumConst,
        Some(enum_id),
        None,
        Immediate::Name(Name::new("A")),
    );
    let data = builder.build();

    let mut env = Environment::new();
    env.load_modules(&[&data]).expect("link");

    let insight = RuntimeInsight::new(env.registry());
    let source = translate_module(&data, &insight, &TranslateSettings::default()).unwrap();

    assert_eq!(source.exports().len(), 1);
    assert_eq!(source.exports()[0].name, "mixed.fine");
    assert_eq!(source.skipped().len(), 1);
    assert!(source.skipped()[0].0.contains("stringy"));

    // The skipped function still runs through the interpreter
    let func = env
        .registry()
        .find_global_function(Name::new("mixed.stringy"))
        .unwrap();
    assert!(matches!(
        env.registry().function(func).body,
        scriptvm::registry::FunctionBody::Scripted(_)
    ));
}

#[test]
fn test_exception_checks_are_optional() {
    let mut builder = ModuleBuilder::new("checked");
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
    let func = builder.function(None, "probe", Some(ret), StubFlags::FUNCTION, 30);
    builder.op0(func, Opcode::ReturnLoad4);
    builder.op0(func, Opcode::LoadInt4);
    let shift = builder.op(func, Opcode::ContextFromPtr, None, None, Immediate::None);
    builder.op0(func, Opcode::Null);
    builder.op(func, Opcode::ContextVar, Some(health), None, Immediate::None);
    let label = builder.op0(func, Opcode::Label);
    builder.slab.get_mut(shift).as_opcode_mut().unwrap().target = Some(label);
    let data = builder.build();

    let mut env = Environment::new();
    env.load_modules(&[&data]).expect("link");
    let insight = RuntimeInsight::new(env.registry());

    let without = translate_module(&data, &insight, &TranslateSettings::default()).unwrap();
    assert!(!without.source().contains("ERROR("));

    let with = translate_module(
        &data,
        &insight,
        &TranslateSettings {
            emit_exceptions: true,
            ..Default::default()
        },
    )
    .unwrap();
    assert!(with.source().contains("ERROR("), "{}", with.source());
    assert!(with.source().contains("Accessing NULL pointer"));
}
