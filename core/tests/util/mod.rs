//! Shared helpers for the integration tests: a small builder that
//! assembles stub modules the way a compiler frontend would, plus a host
//! double that records callbacks.

use scriptvm::{
    error::RuntimeFault,
    object::{FrameView, Host},
    opcodes::{Immediate, Opcode},
    portable::PortableData,
    stub::{
        ClassStub, EnumOptionStub, EnumStub, FileStub, FunctionArgStub, FunctionStub, Location,
        ModuleImportStub, ModuleStub, OpcodeStub, PropertyStub, Stub, StubBody, StubFlags, StubId,
        StubSlab, TypeDeclKind, TypeDeclStub, TypeRefStub,
    },
    Name,
};
use std::sync::Mutex;

/// Builds one portable module, stub by stub.
pub struct ModuleBuilder {
    pub slab: StubSlab,
    pub module: StubId,
    pub file: StubId,
    line: u32,
}

#[allow(dead_code)]
impl ModuleBuilder {
    pub fn new(name: &str) -> ModuleBuilder {
        let mut slab = StubSlab::new();
        let module = slab.alloc(Stub::new(
            Name::new(name),
            None,
            StubBody::Module(ModuleStub::default()),
        ));
        let file = slab.alloc(Stub::new(
            Name::none(),
            Some(module),
            StubBody::File(FileStub {
                depot_path: format!("{}/main.bsc", name),
                absolute_path: format!("/depot/{}/main.bsc", name),
                ..Default::default()
            }),
        ));
        slab.get_mut(module).as_module_mut().unwrap().files.push(file);
        ModuleBuilder {
            slab,
            module,
            file,
            line: 1,
        }
    }

    fn alloc(&mut self, mut stub: Stub) -> StubId {
        stub.location = Location {
            file: Some(self.file),
            line: self.line,
        };
        self.line += 1;
        self.slab.alloc(stub)
    }

    fn add_top_level(&mut self, id: StubId) {
        self.slab
            .get_mut(self.file)
            .as_file_mut()
            .unwrap()
            .stubs
            .push(id);
    }

    /// A type declaration naming an engine type directly.
    pub fn engine_decl(&mut self, owner: StubId, name: &str) -> StubId {
        self.alloc(Stub::new(
            Name::new(name),
            Some(owner),
            StubBody::TypeDecl(TypeDeclStub {
                kind: TypeDeclKind::Engine,
                ..Default::default()
            }),
        ))
    }

    /// A resolved type reference plus a Simple declaration around it.
    pub fn simple_decl(&mut self, owner: StubId, target: StubId) -> StubId {
        let name = Name::new(&self.slab.full_name(target));
        let type_ref = self.alloc(Stub::new(
            name,
            Some(owner),
            StubBody::TypeRef(TypeRefStub {
                resolved: Some(target),
            }),
        ));
        self.alloc(Stub::new(
            Name::none(),
            Some(owner),
            StubBody::TypeDecl(TypeDeclStub {
                kind: TypeDeclKind::Simple,
                referenced: Some(type_ref),
                ..Default::default()
            }),
        ))
    }

    /// A strong-pointer declaration to a class.
    pub fn ptr_decl(&mut self, owner: StubId, class: StubId) -> StubId {
        let name = Name::new(&self.slab.full_name(class));
        let type_ref = self.alloc(Stub::new(
            name,
            Some(owner),
            StubBody::TypeRef(TypeRefStub {
                resolved: Some(class),
            }),
        ));
        self.alloc(Stub::new(
            Name::none(),
            Some(owner),
            StubBody::TypeDecl(TypeDeclStub {
                kind: TypeDeclKind::PtrType,
                referenced: Some(type_ref),
                ..Default::default()
            }),
        ))
    }

    /// A top-level class (or struct, via flags).
    pub fn class(&mut self, name: &str, flags: StubFlags, engine_import: &str) -> StubId {
        let id = self.alloc(Stub::new(
            Name::new(name),
            Some(self.module),
            StubBody::Class(ClassStub {
                engine_import_name: Name::new(engine_import),
                ..Default::default()
            }),
        ));
        self.slab.get_mut(id).flags = flags;
        self.add_top_level(id);
        id
    }

    /// Link a scripted class onto its base.
    pub fn set_base(&mut self, class: StubId, base: StubId) {
        let base_name = self.slab.get(base).name;
        let class_stub = self.slab.get_mut(class).as_class_mut().unwrap();
        class_stub.base_class = Some(base);
        class_stub.base_class_name = base_name;
    }

    /// A top-level enum with explicit or implicit option values.
    pub fn enumeration(
        &mut self,
        name: &str,
        flags: StubFlags,
        engine_import: &str,
        options: &[(&str, Option<i64>)],
    ) -> StubId {
        let id = self.alloc(Stub::new(
            Name::new(name),
            Some(self.module),
            StubBody::Enum(EnumStub {
                engine_import_name: Name::new(engine_import),
                ..Default::default()
            }),
        ));
        self.slab.get_mut(id).flags = flags;
        for &(option_name, value) in options {
            let option = self.alloc(Stub::new(
                Name::new(option_name),
                Some(id),
                StubBody::EnumOption(EnumOptionStub {
                    assigned_value: value.unwrap_or(0),
                    has_user_value: value.is_some(),
                }),
            ));
            self.slab.get_mut(option).flags = flags;
            self.slab
                .get_mut(id)
                .as_enum_mut()
                .unwrap()
                .options
                .push(option);
        }
        self.add_top_level(id);
        id
    }

    /// A property on a class.
    pub fn property(
        &mut self,
        class: StubId,
        name: &str,
        decl: StubId,
        flags: StubFlags,
    ) -> StubId {
        let id = self.alloc(Stub::new(
            Name::new(name),
            Some(class),
            StubBody::Property(PropertyStub {
                type_decl: Some(decl),
                ..Default::default()
            }),
        ));
        self.slab.get_mut(id).flags = flags;
        self.slab
            .get_mut(class)
            .as_class_mut()
            .unwrap()
            .stubs
            .push(id);
        id
    }

    /// A function, either global (owner `None`) or a class member.
    pub fn function(
        &mut self,
        owner: Option<StubId>,
        name: &str,
        ret: Option<StubId>,
        flags: StubFlags,
        code_hash: u64,
    ) -> StubId {
        let parent = owner.unwrap_or(self.module);
        let id = self.alloc(Stub::new(
            Name::new(name),
            Some(parent),
            StubBody::Function(FunctionStub {
                return_type: ret,
                code_hash,
                ..Default::default()
            }),
        ));
        self.slab.get_mut(id).flags = flags;
        match owner {
            Some(class) => self
                .slab
                .get_mut(class)
                .as_class_mut()
                .unwrap()
                .stubs
                .push(id),
            None => self.add_top_level(id),
        }
        id
    }

    /// Append an argument to a function.
    pub fn arg(&mut self, func: StubId, name: &str, decl: StubId, flags: StubFlags) -> StubId {
        let index = self.slab.get(func).as_function().unwrap().args.len() as i16;
        let id = self.alloc(Stub::new(
            Name::new(name),
            Some(func),
            StubBody::FunctionArg(FunctionArgStub {
                type_decl: Some(decl),
                index,
                ..Default::default()
            }),
        ));
        self.slab.get_mut(id).flags = flags;
        self.slab
            .get_mut(func)
            .as_function_mut()
            .unwrap()
            .args
            .push(id);
        id
    }

    /// Append one opcode to a function's stream.
    pub fn op(
        &mut self,
        func: StubId,
        op: Opcode,
        stub: Option<StubId>,
        target: Option<StubId>,
        value: Immediate,
    ) -> StubId {
        let id = self.alloc(Stub::new(
            Name::none(),
            Some(func),
            StubBody::Opcode(OpcodeStub {
                op,
                stub,
                target,
                value,
            }),
        ));
        self.slab
            .get_mut(func)
            .as_function_mut()
            .unwrap()
            .opcodes
            .push(id);
        id
    }

    /// Opcode with no operands.
    pub fn op0(&mut self, func: StubId, op: Opcode) -> StubId {
        self.op(func, op, None, None, Immediate::None)
    }

    /// Start an imported-module clone: the import marker plus the
    /// stripped module/file pair the clone's declarations hang off.
    pub fn import_module(&mut self, name: &str) -> StubId {
        let import_marker = self.alloc(Stub::new(
            Name::new(name),
            Some(self.module),
            StubBody::ModuleImport(ModuleImportStub::default()),
        ));
        let imported = self.alloc(Stub::new(
            Name::new(name),
            None,
            StubBody::Module(ModuleStub::default()),
        ));
        self.slab.get_mut(imported).flags = StubFlags::IMPORT;
        let imported_file = self.alloc(Stub::new(
            Name::none(),
            Some(imported),
            StubBody::File(FileStub {
                depot_path: format!("{}/import.bsc", name),
                absolute_path: format!("/depot/{}/import.bsc", name),
                ..Default::default()
            }),
        ));
        self.slab
            .get_mut(import_marker)
            .as_module_import_mut()
            .unwrap()
            .imported_module = Some(imported);
        self.slab
            .get_mut(imported)
            .as_module_mut()
            .unwrap()
            .files
            .push(imported_file);
        self.slab
            .get_mut(self.module)
            .as_module_mut()
            .unwrap()
            .imports
            .push(import_marker);
        imported_file
    }

    /// Add a top-level stub to an imported module's file instead of the
    /// main one.
    pub fn add_to_file(&mut self, file: StubId, id: StubId) {
        self.slab.get_mut(file).as_file_mut().unwrap().stubs.push(id);
    }

    /// A class inside an imported clone.
    pub fn imported_class(
        &mut self,
        file: StubId,
        name: &str,
        flags: StubFlags,
        engine_import: &str,
    ) -> StubId {
        let owner = self.slab.get(file).owner.unwrap();
        let id = self.alloc(Stub::new(
            Name::new(name),
            Some(owner),
            StubBody::Class(ClassStub {
                engine_import_name: Name::new(engine_import),
                ..Default::default()
            }),
        ));
        self.slab.get_mut(id).flags = flags | StubFlags::IMPORT;
        self.add_to_file(file, id);
        id
    }

    /// Pack everything reachable from the module root and reload it.
    pub fn build(mut self) -> PortableData {
        self.slab.post_load();
        PortableData::create(&self.slab, self.module).expect("packing test module")
    }
}

/// Host double that records exceptions and breakpoint hits.
#[derive(Default)]
pub struct RecordingHost {
    pub faults: Mutex<Vec<RuntimeFault>>,
    pub breakpoints: Mutex<Vec<u32>>,
}

impl Host for RecordingHost {
    fn exception(&self, _frame: &FrameView, fault: RuntimeFault) {
        self.faults.lock().unwrap().push(fault);
    }

    fn breakpoint(&self, _frame: &FrameView, line: u32) {
        self.breakpoints.lock().unwrap().push(line);
    }
}
