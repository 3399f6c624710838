//! Linker tests: cross-module symbol resolution, structural mismatch
//! detection, unresolved imports and duplicate exports. All of these are
//! transactional: a failed load reports diagnostics and leaves the
//! registry untouched.

mod util;

use scriptvm::{
    opcodes::{Immediate, Opcode},
    portable::PortableData,
    stub::StubFlags,
    CallParams, Environment, Name,
};
use util::ModuleBuilder;

/// Module `A`: scripted class Foo on a native base, with a static method
/// `bar(): int32 { return 7; }`.
fn module_a() -> PortableData {
    let mut builder = ModuleBuilder::new("A");
    let base = builder.class(
        "Obj",
        StubFlags::NATIVE | StubFlags::IMPORT | StubFlags::CLASS,
        "ScriptedObject",
    );
    let foo = builder.class("Foo", StubFlags::CLASS, "");
    builder.set_base(foo, base);

    let ret = builder.engine_decl(foo, "int32");
    let bar = builder.function(
        Some(foo),
        "bar",
        Some(ret),
        StubFlags::FUNCTION | StubFlags::STATIC,
        77,
    );
    builder.op0(bar, Opcode::ReturnLoad4);
    builder.op(bar, Opcode::IntConst4, None, None, Immediate::Int(7));
    builder.build()
}

/// Module `B`: imports `A.Foo.bar` and calls it from a global function.
fn module_b() -> PortableData {
    let mut builder = ModuleBuilder::new("B");
    let a_file = builder.import_module("A");

    let obj = builder.imported_class(
        a_file,
        "Obj",
        StubFlags::NATIVE | StubFlags::CLASS,
        "ScriptedObject",
    );
    let foo = builder.imported_class(a_file, "Foo", StubFlags::CLASS, "");
    builder.set_base(foo, obj);

    let ret = builder.engine_decl(foo, "int32");
    let bar = builder.function(
        Some(foo),
        "bar",
        Some(ret),
        StubFlags::FUNCTION | StubFlags::STATIC | StubFlags::IMPORT,
        77,
    );

    let use_ret = builder.engine_decl(builder.module, "int32");
    let use_it = builder.function(None, "use_it", Some(use_ret), StubFlags::FUNCTION, 88);
    builder.op0(use_it, Opcode::ReturnLoad4);
    builder.op(use_it, Opcode::StaticFunc, Some(bar), None, Immediate::Uint(0));
    builder.build()
}

#[test]
fn test_cross_module_symbol() {
    let a = module_a();
    let b = module_b();

    let mut env = Environment::new();
    env.load_modules(&[&a, &b]).expect("link should succeed");

    // B's call site resolved onto the function object created for A's
    // export: calling through it yields A's body.
    let mut result = 0i32;
    let params = CallParams::new(&mut result as *mut i32 as *mut u8);
    assert!(env.call_global(Name::new("B.use_it"), &params));
    assert_eq!(result, 7);

    // Same host object for both sides
    let foo = env.registry().find_class(Name::new("A.Foo")).unwrap();
    assert!(env
        .registry()
        .find_class_function(foo, Name::new("bar"))
        .is_some());
}

#[test]
fn test_unresolved_import() {
    let b = module_b();
    let mut env = Environment::new();
    let diags = env
        .load_modules(&[&b])
        .expect_err("B without A must not link");
    let rendered = diags.to_string();
    assert!(
        rendered.contains("A.Foo.bar"),
        "missing function not named: {}",
        rendered
    );
    assert!(rendered.contains("unresolved import"), "{}", rendered);

    // Nothing was committed
    assert!(env.registry().find_class(Name::new("A.Foo")).is_none());
}

/// Module exporting `C.compute(int32): int32`; `by_ref` flips the
/// argument's passing mode so import and export disagree.
fn module_compute(module_name: &str, import: bool, by_ref: bool) -> PortableData {
    let mut builder = ModuleBuilder::new(module_name);
    let (owner, file) = if import {
        let c_file = builder.import_module("C");
        (builder.slab.get(c_file).owner.unwrap(), Some(c_file))
    } else {
        (builder.module, None)
    };

    let ret = builder.engine_decl(owner, "int32");
    let flags = if import {
        StubFlags::FUNCTION | StubFlags::IMPORT
    } else {
        StubFlags::FUNCTION
    };
    let func = {
        // Imported declarations hang off the imported module's file
        let id = builder.function(None, "compute", Some(ret), flags, 5);
        if let Some(file) = file {
            // Relocate from the main file into the import clone
            let main_file = builder.file;
            builder
                .slab
                .get_mut(main_file)
                .as_file_mut()
                .unwrap()
                .stubs
                .retain(|&s| s != id);
            builder.slab.get_mut(id).owner = Some(owner);
            builder.add_to_file(file, id);
        }
        id
    };
    let arg_ty = builder.engine_decl(func, "int32");
    let arg_flags = if by_ref {
        StubFlags::REF
    } else {
        StubFlags::empty()
    };
    builder.arg(func, "x", arg_ty, arg_flags);
    if !import {
        builder.op0(func, Opcode::ReturnLoad4);
        builder.op0(func, Opcode::LoadInt4);
        builder.op(func, Opcode::ParamVar, None, None, Immediate::Int(0));
    }
    builder.build()
}

#[test]
fn test_signature_mismatch_between_modules() {
    let export = module_compute("C", false, false);
    let import = module_compute("D", true, true);

    let mut env = Environment::new();
    let diags = env
        .load_modules(&[&export, &import])
        .expect_err("mismatched declarations must not link");
    let rendered = diags.to_string();
    assert!(
        rendered.contains("mismatched definition of 'C.compute'"),
        "{}",
        rendered
    );
    // Both source locations are part of the report
    assert!(rendered.contains("D/import.bsc") || rendered.contains("C/main.bsc"), "{}", rendered);
    assert!(env
        .registry()
        .find_global_function(Name::new("C.compute"))
        .is_none());
}

#[test]
fn test_matching_import_links() {
    let export = module_compute("C", false, false);
    let import = module_compute("D", true, false);

    let mut env = Environment::new();
    env.load_modules(&[&export, &import])
        .expect("identical declarations link");

    let mut arg = 42i32;
    let mut result = 0i32;
    let mut params = CallParams::new(&mut result as *mut i32 as *mut u8);
    params.args[0] = &mut arg as *mut i32 as *mut u8;
    assert!(env.call_global(Name::new("C.compute"), &params));
    assert_eq!(result, 42);
}

#[test]
fn test_duplicate_export() {
    let first = module_a();
    let second = module_a();

    let mut env = Environment::new();
    let diags = env
        .load_modules(&[&first, &second])
        .expect_err("double export must not link");
    let rendered = diags.to_string();
    assert!(rendered.contains("already exported"), "{}", rendered);
}

#[test]
fn test_enum_sizing() {
    let mut builder = ModuleBuilder::new("E");
    builder.enumeration(
        "Small",
        StubFlags::empty(),
        "",
        &[("A", Some(1)), ("B", Some(2)), ("C", Some(200))],
    );
    builder.enumeration(
        "Wide",
        StubFlags::empty(),
        "",
        &[("Low", Some(-40000)), ("High", Some(100))],
    );
    let data = builder.build();

    let mut env = Environment::new();
    env.load_modules(&[&data]).expect("enums link");

    let small = env.registry().find_enum(Name::new("E.Small")).unwrap();
    let small = env.registry().type_def(small);
    let info = small.enum_info.as_ref().unwrap();
    assert_eq!((info.size, info.signed), (1, false));
    assert_eq!(info.find_value(Name::new("C")), Some(200));

    let wide = env.registry().find_enum(Name::new("E.Wide")).unwrap();
    let wide = env.registry().type_def(wide);
    let info = wide.enum_info.as_ref().unwrap();
    assert_eq!((info.size, info.signed), (4, true));
}
