//! C-side mirror of the host type system for the translator. Every type
//! the emitted code touches becomes a [CType] with a C spelling, a layout
//! and (when the code needs lifecycle calls) a numeric import id; every
//! called function becomes a call forwarder with its own id. The library
//! also prints the struct prototypes, forwarder definitions and the import
//! report of the module-init function.

use crate::{
    insight::{TypeInfo, TypeInsight},
    name::Name,
    opcodes::Opcode,
    stub::{StubFlags, StubId, StubSlab, TypeDeclKind},
    types::{MetaKind, TypeTraits},
};
use std::collections::HashMap;
use std::fmt::Write;

/// Index into the type library.
pub type CTypeId = usize;

/// One C-visible member of a class or struct.
#[derive(Clone, Debug)]
pub struct CMember {
    pub name: Name,
    pub ty: CTypeId,
    pub offset: u32,
    pub external: bool,
}

/// A host type as the emitted C sees it.
#[derive(Clone, Debug)]
pub struct CType {
    /// Host-side name used for the import report
    pub name: Name,
    /// How the type is spelled in emitted code
    pub c_name: String,
    pub meta: MetaKind,
    pub size: u32,
    pub align: u32,
    pub traits: TypeTraits,
    pub is_struct: bool,
    pub scripted: bool,
    /// Numeric id for CTOR/DTOR/COPY/COMPARE and the import table; -1
    /// until something needs it
    pub assigned_id: i32,
    /// Emit a struct prototype for this type
    pub emit_prototype: bool,
    pub members: Vec<CMember>,
    pub options: HashMap<Name, i64>,
    pub enum_signed: bool,
}

/// One imported (callable) function with its forwarder.
#[derive(Clone, Debug)]
pub struct CFunc {
    pub assigned_id: i32,
    pub class_name: Option<Name>,
    pub name: Name,
    /// Name of the emitted call forwarder
    pub c_name: String,
    pub ret: Option<CTypeId>,
    pub args: Vec<CFuncArg>,
    /// The return value is simple enough to come back by value
    pub returns_directly: bool,
}

#[derive(Clone, Debug)]
pub struct CFuncArg {
    pub ty: CTypeId,
    pub by_pointer: bool,
}

/// Type and function library for one translation run.
pub struct JitTypeLib<'a> {
    insight: &'a dyn TypeInsight,
    types: Vec<CType>,
    by_name: HashMap<Name, CTypeId>,
    functions: Vec<CFunc>,
    func_by_stub: HashMap<StubId, usize>,
    next_import_id: i32,
    errors: Vec<String>,
}

/// Built-in spellings for the primitive value types.
fn primitive_c_name(name: &str) -> Option<&'static str> {
    Some(match name {
        "bool" | "uint8" => "uint8_t",
        "int8" => "int8_t",
        "int16" => "int16_t",
        "uint16" => "uint16_t",
        "int32" => "int32_t",
        "uint32" => "uint32_t",
        "int64" => "int64_t",
        "uint64" => "uint64_t",
        "float" => "float",
        "double" => "double",
        "name" => "StringID",
        _ => return None,
    })
}

impl<'a> JitTypeLib<'a> {
    pub fn new(insight: &'a dyn TypeInsight) -> JitTypeLib<'a> {
        JitTypeLib {
            insight,
            types: Vec::new(),
            by_name: HashMap::new(),
            functions: Vec::new(),
            func_by_stub: HashMap::new(),
            next_import_id: 0,
            errors: Vec::new(),
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    fn report_error(&mut self, text: String) {
        log::error!("JIT: {}", text);
        self.errors.push(text);
    }

    pub fn get(&self, id: CTypeId) -> &CType {
        &self.types[id]
    }

    /// Look a resolved type up by host name without creating it.
    pub fn lookup(&self, name: Name) -> Option<CTypeId> {
        self.by_name.get(&name).copied()
    }

    pub fn func(&self, index: usize) -> &CFunc {
        &self.functions[index]
    }

    /// Id used by the lifecycle macros; assigned (and therefore imported)
    /// on first request.
    pub fn assign_id(&mut self, id: CTypeId) -> i32 {
        if self.types[id].assigned_id < 0 {
            self.types[id].assigned_id = self.next_import_id;
            self.next_import_id += 1;
        }
        self.types[id].assigned_id
    }

    /// Resolve an engine type by name, creating its C mirror on demand.
    pub fn resolve_engine_type(&mut self, name: Name) -> Option<CTypeId> {
        if let Some(&id) = self.by_name.get(&name) {
            return Some(id);
        }
        let info = match self.insight.type_info(name) {
            Some(info) => info,
            None => {
                self.report_error(format!("engine type '{}' not found", name));
                return None;
            }
        };
        Some(self.insert_type(name, info))
    }

    fn insert_type(&mut self, name: Name, info: TypeInfo) -> CTypeId {
        let id = self.types.len();
        // Reserve the slot first so recursive member resolution can refer
        // back to it
        self.types.push(CType {
            name,
            c_name: String::new(),
            meta: info.meta,
            size: info.size,
            align: info.align,
            traits: info.traits,
            is_struct: info.is_struct,
            scripted: info.scripted,
            assigned_id: -1,
            emit_prototype: false,
            members: Vec::new(),
            options: info.options.iter().map(|o| (o.name, o.value)).collect(),
            enum_signed: info.options.iter().any(|o| o.value < 0),
        });
        self.by_name.insert(name, id);

        let (c_name, emit_prototype) = match info.meta {
            MetaKind::Simple => match primitive_c_name(name.as_str()) {
                Some(known) => (known.to_owned(), false),
                // Opaque engine value: a blob of the right size, 8-aligned
                None => (format!("struct __opaque_{}", id), true),
            },
            MetaKind::Enum => (
                match info.size {
                    1 => "uint8_t",
                    2 => "uint16_t",
                    4 => "uint32_t",
                    _ => "uint64_t",
                }
                .to_owned(),
                false,
            ),
            MetaKind::ClassRef => ("ClassRef".to_owned(), false),
            MetaKind::StrongHandle => ("StrongHandle".to_owned(), false),
            MetaKind::WeakHandle => ("WeakHandle".to_owned(), false),
            MetaKind::DynamicArray | MetaKind::StaticArray => {
                (format!("struct __opaque_{}", id), true)
            }
            MetaKind::Class => (format!("struct __class_{}", id), true),
            MetaKind::Void => ("void".to_owned(), false),
        };
        self.types[id].c_name = c_name;
        self.types[id].emit_prototype = emit_prototype;

        if info.meta == MetaKind::Class {
            let members: Vec<CMember> = info
                .members
                .iter()
                .filter_map(|member| {
                    let ty = self.resolve_engine_type(member.type_name)?;
                    Some(CMember {
                        name: member.name,
                        ty,
                        offset: member.offset,
                        external: member.external,
                    })
                })
                .collect();
            self.types[id].members = members;
        }
        id
    }

    /// Resolve the type behind a type declaration stub.
    pub fn resolve_decl(&mut self, slab: &StubSlab, decl: StubId) -> Option<CTypeId> {
        let name = Name::new(&slab.type_decl_name(decl));
        let stub = slab.get(decl);
        let decl_stub = stub.as_type_decl()?;
        match decl_stub.kind {
            TypeDeclKind::Engine => self.resolve_engine_type(stub.name),
            // Everything else answers to its canonical printable name in
            // the host registry
            _ => self.resolve_engine_type(name),
        }
    }

    /// Resolve a class or enum stub to its host type.
    pub fn resolve_named_stub(&mut self, slab: &StubSlab, stub: StubId) -> Option<CTypeId> {
        let stub_data = slab.get(stub);
        let import_name = stub_data
            .as_class()
            .map(|c| c.engine_import_name)
            .or_else(|| stub_data.as_enum().map(|e| e.engine_import_name))
            .unwrap_or_default();
        let name = if !import_name.is_empty() && stub_data.is_import() {
            import_name
        } else {
            Name::new(&slab.full_name(stub))
        };
        self.resolve_engine_type(name)
    }

    /// Map a function stub for calling, creating the forwarder entry once.
    pub fn resolve_function(&mut self, slab: &StubSlab, func: StubId) -> Option<usize> {
        if let Some(&index) = self.func_by_stub.get(&func) {
            return Some(index);
        }
        let stub = slab.get(func);
        let function = stub.as_function()?;

        let class_name = stub
            .owner
            .and_then(|owner| slab.get(owner).as_class().map(|_| Name::new(&slab.full_name(owner))));
        let ret = match function.return_type {
            Some(decl) => Some(self.resolve_decl(slab, decl)?),
            None => None,
        };
        let mut args = Vec::with_capacity(function.args.len());
        for &arg in &function.args {
            let arg_stub = slab.get(arg);
            let arg_data = arg_stub.as_function_arg()?;
            let ty = self.resolve_decl(slab, arg_data.type_decl?)?;
            args.push(CFuncArg {
                ty,
                by_pointer: arg_stub
                    .flags
                    .intersects(StubFlags::REF | StubFlags::OUT),
            });
        }
        let returns_directly = match ret {
            Some(ret) => {
                let def = &self.types[ret];
                def.traits.simple_copy && !def.traits.requires_ctor && !def.traits.requires_dtor
            }
            None => true,
        };

        let index = self.functions.len();
        let assigned_id = self.next_import_id;
        self.next_import_id += 1;
        self.functions.push(CFunc {
            assigned_id,
            class_name,
            name: stub.name,
            c_name: format!("__call_func_{}_{}", stub.name, index),
            ret,
            args,
            returns_directly,
        });
        self.func_by_stub.insert(func, index);
        Some(index)
    }

    /// Width-specialized opcode knowledge: the enum storage of a type.
    pub fn enum_storage(&self, id: CTypeId) -> (u8, bool) {
        let def = &self.types[id];
        (def.size.min(8) as u8, def.enum_signed)
    }

    pub fn opcode_supported(op: Opcode) -> bool {
        !matches!(
            op,
            Opcode::Switch
                | Opcode::SwitchLabel
                | Opcode::SwitchDefault
                | Opcode::Conditional
                | Opcode::CastToVariant
                | Opcode::CastFromVariant
                | Opcode::VariantIsValid
                | Opcode::VariantIsPointer
                | Opcode::VariantIsArray
                | Opcode::VariantGetType
                | Opcode::VariantToString
        )
    }

    //--- emission ----------------------------------------------------------

    /// Struct shapes for every type that needs one. Opaque engine values
    /// become 8-aligned blobs; classes and structs get their members at
    /// the insight-reported offsets with explicit padding.
    pub fn print_type_prototypes(&self, out: &mut String) {
        for (id, ty) in self.types.iter().enumerate() {
            if !ty.emit_prototype {
                continue;
            }
            match ty.meta {
                MetaKind::Class => {
                    // In-object members and the scripted buffer are
                    // addressed separately
                    let _ = writeln!(out, "/* {} */", ty.name);
                    self.print_member_struct(out, &format!("__class_{}", id), ty, false);
                    if ty.members.iter().any(|m| m.external) {
                        self.print_member_struct(out, &format!("__scripted_{}", id), ty, true);
                    }
                }
                _ => {
                    let _ = writeln!(
                        out,
                        "struct __opaque_{} {{ uint64_t _data[{}]; }}; /* {} */",
                        id,
                        (ty.size as usize + 7) / 8,
                        ty.name
                    );
                }
            }
        }
        out.push('\n');
    }

    fn print_member_struct(&self, out: &mut String, c_name: &str, ty: &CType, external: bool) {
        let _ = writeln!(out, "struct {} {{", c_name);
        let mut cursor = 0u32;
        let mut pad = 0;
        for member in ty.members.iter().filter(|m| m.external == external) {
            if member.offset > cursor {
                let _ = writeln!(out, "  char __pad{}[{}];", pad, member.offset - cursor);
                pad += 1;
            }
            let member_ty = &self.types[member.ty];
            let _ = writeln!(out, "  {} {};", member_ty.c_name, member.name);
            cursor = member.offset + member_ty.size;
        }
        if cursor == 0 {
            let _ = writeln!(out, "  char __empty;");
        }
        let _ = writeln!(out, "}};");
    }

    /// Scripted-part struct name of a class, used by the ExternalPtr
    /// access path.
    pub fn scripted_struct_name(&self, id: CTypeId) -> String {
        format!("struct __scripted_{}", id)
    }

    /// Forward declarations so emitted bodies can call forwarders defined
    /// after them in the file.
    pub fn print_call_forwarder_declarations(&self, out: &mut String) {
        for func in &self.functions {
            let _ = writeln!(out, "{};", self.forwarder_signature(func));
        }
        out.push('\n');
    }

    fn forwarder_signature(&self, func: &CFunc) -> String {
        let ret_c = match (func.returns_directly, func.ret) {
            (true, Some(ret)) => self.types[ret].c_name.clone(),
            _ => "void".to_owned(),
        };
        let mut out = format!(
            "static {} {}(void* context, int mode, void* stackFrame",
            ret_c, func.c_name
        );
        if !func.returns_directly {
            out.push_str(", void* resultPtr");
        }
        for (i, arg) in func.args.iter().enumerate() {
            let arg_ty = &self.types[arg.ty];
            if arg.by_pointer {
                let _ = write!(out, ", {}* a{}", arg_ty.c_name, i);
            } else {
                let _ = write!(out, ", {} a{}", arg_ty.c_name, i);
            }
        }
        out.push(')');
        out
    }

    /// Call forwarders: natural C call syntax on the caller side, engine
    /// calling-parameter blocks on the inside.
    pub fn print_call_forwarders(&self, out: &mut String) {
        for func in &self.functions {
            let _ = writeln!(out, "{} {{", self.forwarder_signature(func));
            let _ = writeln!(out, "  struct FunctionCallingParams p;");
            if func.returns_directly && func.ret.is_some() {
                let ret = func.ret.unwrap();
                let _ = writeln!(out, "  {} ret = 0;", self.types[ret].c_name);
                let _ = writeln!(out, "  p._returnPtr = &ret;");
            } else if !func.returns_directly {
                let _ = writeln!(out, "  p._returnPtr = resultPtr;");
            } else {
                let _ = writeln!(out, "  p._returnPtr = 0;");
            }
            for (i, arg) in func.args.iter().enumerate() {
                if arg.by_pointer {
                    let _ = writeln!(out, "  p._argPtr[{}] = a{};", i, i);
                } else {
                    let _ = writeln!(out, "  p._argPtr[{}] = &a{};", i, i);
                }
            }
            let _ = writeln!(
                out,
                "  EI->_fnCall(EI->self, context, {}, mode, stackFrame, &p);",
                func.assigned_id
            );
            if func.returns_directly && func.ret.is_some() {
                let _ = writeln!(out, "  return ret;");
            }
            let _ = writeln!(out, "}}\n");
        }
    }

    /// The import report inside the module-init function.
    pub fn print_imports(&self, out: &mut String) {
        let max_id = self.next_import_id.max(1);
        let _ = writeln!(
            out,
            "init->_fnReportImportCounts(init->self, {}, {});",
            max_id, max_id
        );
        for ty in &self.types {
            if ty.assigned_id >= 0 {
                let _ = writeln!(
                    out,
                    "init->_fnReportImportType(init->self, {}, \"{}\");",
                    ty.assigned_id, ty.name
                );
            }
        }
        for func in &self.functions {
            match func.class_name {
                Some(class) => {
                    let _ = writeln!(
                        out,
                        "init->_fnReportImportFunction(init->self, {}, \"{}\", \"{}\");",
                        func.assigned_id, class, func.name
                    );
                }
                None => {
                    let _ = writeln!(
                        out,
                        "init->_fnReportImportFunction(init->self, {}, 0, \"{}\");",
                        func.assigned_id, func.name
                    );
                }
            }
        }
    }
}
