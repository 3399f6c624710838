//! The host type registry: owner of every host-side type and function
//! object the scripting runtime knows about. Entities are created once and
//! never destroyed, because their dense ids (and addresses) are used as
//! keys elsewhere; a reload clears scripted *content* but keeps the
//! objects. The dense 16-bit ids double as the references embedded in
//! compiled byte streams and in emitted C code.

use crate::{
    codeblock::CodeBlock,
    frame::ExecCtx,
    name::Name,
    object::{self, RawArray},
    types::{
        ClassInfo, EnumInfo, MetaKind, ParamType, PropFlags, Property, SimpleOps, TypeDef, TypeId,
        TypeTraits, FuncId,
    },
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Most arguments a single call can carry; bounded by the 4-bit-per-arg
/// calling encoding word.
pub const MAX_CALL_ARGS: usize = 16;

/// The uniform calling structure: where the return value goes and where
/// each argument lives. Shared with AOT-compiled code, hence the C layout.
#[repr(C)]
pub struct CallParams {
    pub return_ptr: *mut u8,
    pub args: [*mut u8; MAX_CALL_ARGS],
}

impl CallParams {
    pub fn new(return_ptr: *mut u8) -> CallParams {
        CallParams {
            return_ptr,
            args: [std::ptr::null_mut(); MAX_CALL_ARGS],
        }
    }
}

/// Signature of a native function body.
pub type NativeFn = fn(&ExecCtx<'_>, *mut u8, &CallParams);

/// Signature of an AOT-compiled function loaded from a shared object.
pub type JittedFn =
    unsafe extern "C" fn(*mut std::ffi::c_void, *mut std::ffi::c_void, *mut CallParams);

/// What runs when a function is called.
#[derive(Clone)]
pub enum FunctionBody {
    /// Declared but not yet bound (or unbound by a reload)
    Empty,
    Native(NativeFn),
    Scripted(Arc<CodeBlock>),
    /// AOT-compiled replacement for a scripted body
    Jitted(JittedFn),
}

impl std::fmt::Debug for FunctionBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FunctionBody::Empty => f.write_str("Empty"),
            FunctionBody::Native(_) => f.write_str("Native"),
            FunctionBody::Scripted(_) => f.write_str("Scripted"),
            FunctionBody::Jitted(_) => f.write_str("Jitted"),
        }
    }
}

/// A host function object: global or class member, native or scripted.
#[derive(Clone, Debug)]
pub struct Function {
    pub name: Name,
    pub class: Option<TypeId>,
    pub ret: Option<ParamType>,
    pub params: Vec<ParamType>,
    pub is_static: bool,
    pub scripted: bool,
    pub body: FunctionBody,
    pub code_hash: u64,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash)]
enum UsedEntity {
    Type(TypeId),
    Func(FuncId),
}

/// Handy bundle of the built-in value types registered on construction.
#[derive(Copy, Clone, Debug)]
pub struct Primitives {
    pub bool_: TypeId,
    pub int8: TypeId,
    pub int16: TypeId,
    pub int32: TypeId,
    pub int64: TypeId,
    pub uint8: TypeId,
    pub uint16: TypeId,
    pub uint32: TypeId,
    pub uint64: TypeId,
    pub float: TypeId,
    pub double: TypeId,
    pub name: TypeId,
    pub string: TypeId,
}

/// Owner of host types and functions created for scripts.
pub struct TypeRegistry {
    types: Vec<TypeDef>,
    type_names: HashMap<Name, TypeId>,
    functions: Vec<Function>,
    function_ids: HashMap<String, FuncId>,
    used: HashSet<UsedEntity>,
    duplicates: Vec<(&'static str, Name)>,
    pub primitives: Primitives,
    scripted_root: TypeId,
}

// String value operations for the engine "string" type. The pointers
// address aligned storage of `String` size that construct/destruct keep
// paired.
unsafe fn string_ctor(p: *mut u8) {
    (p as *mut String).write(String::new());
}
unsafe fn string_dtor(p: *mut u8) {
    std::ptr::drop_in_place(p as *mut String);
}
unsafe fn string_copy(dst: *mut u8, src: *const u8) {
    (*(dst as *mut String)).clone_from(&*(src as *const String));
}
unsafe fn string_compare(a: *const u8, b: *const u8) -> bool {
    *(a as *const String) == *(b as *const String)
}

const STRING_OPS: SimpleOps = SimpleOps {
    ctor: string_ctor,
    dtor: string_dtor,
    copy: string_copy,
    compare: string_compare,
};

fn align_up(value: u32, align: u32) -> u32 {
    let align = align.max(1);
    (value + align - 1) & !(align - 1)
}

impl TypeRegistry {
    pub fn new() -> TypeRegistry {
        let mut registry = TypeRegistry {
            types: Vec::new(),
            type_names: HashMap::new(),
            functions: Vec::new(),
            function_ids: HashMap::new(),
            used: HashSet::new(),
            duplicates: Vec::new(),
            primitives: Primitives {
                bool_: TypeId(0),
                int8: TypeId(0),
                int16: TypeId(0),
                int32: TypeId(0),
                int64: TypeId(0),
                uint8: TypeId(0),
                uint16: TypeId(0),
                uint32: TypeId(0),
                uint64: TypeId(0),
                float: TypeId(0),
                double: TypeId(0),
                name: TypeId(0),
                string: TypeId(0),
            },
            scripted_root: TypeId(0),
        };

        let plain = |name: &str, size: u32, align: u32| TypeDef::plain(Name::new(name), size, align);
        registry.primitives.bool_ = registry.add_type(plain("bool", 1, 1));
        registry.primitives.int8 = registry.add_type(plain("int8", 1, 1));
        registry.primitives.int16 = registry.add_type(plain("int16", 2, 2));
        registry.primitives.int32 = registry.add_type(plain("int32", 4, 4));
        registry.primitives.int64 = registry.add_type(plain("int64", 8, 8));
        registry.primitives.uint8 = registry.add_type(plain("uint8", 1, 1));
        registry.primitives.uint16 = registry.add_type(plain("uint16", 2, 2));
        registry.primitives.uint32 = registry.add_type(plain("uint32", 4, 4));
        registry.primitives.uint64 = registry.add_type(plain("uint64", 8, 8));
        registry.primitives.float = registry.add_type(plain("float", 4, 4));
        registry.primitives.double = registry.add_type(plain("double", 8, 8));
        registry.primitives.name = registry.add_type(plain("name", 4, 4));

        let string_size = std::mem::size_of::<String>() as u32;
        let string_align = std::mem::align_of::<String>() as u32;
        registry.primitives.string = registry.add_type(TypeDef {
            name: Name::new("string"),
            kind: MetaKind::Simple,
            size: string_size,
            align: string_align,
            traits: TypeTraits {
                requires_ctor: true,
                requires_dtor: true,
                simple_copy: false,
                zero_init: false,
            },
            ops: Some(STRING_OPS),
            inner: None,
            array_len: 0,
            scripted: false,
            class: None,
            enum_info: None,
        });

        // The root every scripted class chain must reach, plus the handle
        // shells the runtime and the emitted code address objects through.
        registry.scripted_root =
            registry.register_native_class(Name::new("ScriptedObject"), None, false);
        let root = registry.scripted_root;
        registry.strong_handle_type(root);
        registry.weak_handle_type(root);
        registry
    }

    fn add_type(&mut self, def: TypeDef) -> TypeId {
        assert!(
            self.types.len() < u16::MAX as usize,
            "type id space exhausted (65536 entries)"
        );
        let id = TypeId(self.types.len() as u16);
        self.type_names.insert(def.name, id);
        self.types.push(def);
        id
    }

    fn add_function(&mut self, qualified: String, function: Function) -> FuncId {
        assert!(
            self.functions.len() < u16::MAX as usize,
            "function id space exhausted (65536 entries)"
        );
        let id = FuncId(self.functions.len() as u16);
        self.function_ids.insert(qualified, id);
        self.functions.push(function);
        id
    }

    fn qualified_function_id(&self, name: Name, class: Option<TypeId>) -> String {
        match class {
            Some(class) => format!("{}_{}", self.type_def(class).name, name),
            None => name.as_str().to_owned(),
        }
    }

    //--- lookups ---------------------------------------------------------

    pub fn type_def(&self, id: TypeId) -> &TypeDef {
        &self.types[id.0 as usize]
    }

    pub fn type_def_mut(&mut self, id: TypeId) -> &mut TypeDef {
        &mut self.types[id.0 as usize]
    }

    pub fn function(&self, id: FuncId) -> &Function {
        &self.functions[id.0 as usize]
    }

    pub fn function_mut(&mut self, id: FuncId) -> &mut Function {
        &mut self.functions[id.0 as usize]
    }

    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    pub fn find_type(&self, name: Name) -> Option<TypeId> {
        self.type_names.get(&name).copied()
    }

    pub fn find_class(&self, name: Name) -> Option<TypeId> {
        self.find_type(name)
            .filter(|&id| self.type_def(id).kind == MetaKind::Class)
    }

    pub fn find_enum(&self, name: Name) -> Option<TypeId> {
        self.find_type(name)
            .filter(|&id| self.type_def(id).kind == MetaKind::Enum)
    }

    pub fn find_global_function(&self, name: Name) -> Option<FuncId> {
        self.function_ids.get(name.as_str()).copied()
    }

    pub fn find_class_function(&self, class: TypeId, name: Name) -> Option<FuncId> {
        let mut cursor = Some(class);
        while let Some(current) = cursor {
            let info = self.type_def(current).class_info()?;
            if let Some(&func) = info.functions.get(&name) {
                return Some(func);
            }
            cursor = info.base;
        }
        None
    }

    /// Find a property by name, searching the base-class chain.
    pub fn find_property(&self, class: TypeId, name: Name) -> Option<&Property> {
        let mut cursor = Some(class);
        while let Some(current) = cursor {
            let info = self.type_def(current).class_info()?;
            if let Some(prop) = info.props.iter().find(|p| p.name == name) {
                return Some(prop);
            }
            cursor = info.base;
        }
        None
    }

    /// Is `class` the same as, or derived from, `base`?
    pub fn class_is_a(&self, class: TypeId, base: TypeId) -> bool {
        let mut cursor = Some(class);
        while let Some(current) = cursor {
            if current == base {
                return true;
            }
            cursor = self.type_def(current).class_info().and_then(|c| c.base);
        }
        false
    }

    /// The native class every scripted class must ultimately derive from.
    pub fn scripted_root(&self) -> TypeId {
        self.scripted_root
    }

    pub fn all_functions(&self) -> impl Iterator<Item = (FuncId, &Function)> {
        self.functions
            .iter()
            .enumerate()
            .map(|(i, f)| (FuncId(i as u16), f))
    }

    pub fn all_types(&self) -> impl Iterator<Item = (TypeId, &TypeDef)> {
        self.types
            .iter()
            .enumerate()
            .map(|(i, t)| (TypeId(i as u16), t))
    }

    //--- native registration ---------------------------------------------

    /// Register a class backed by engine code. Host setup only; scripted
    /// classes come through [TypeRegistry::create_class].
    pub fn register_native_class(
        &mut self,
        name: Name,
        base: Option<TypeId>,
        is_abstract: bool,
    ) -> TypeId {
        self.add_type(TypeDef {
            name,
            kind: MetaKind::Class,
            size: 0,
            align: 1,
            traits: TypeTraits {
                requires_ctor: true,
                requires_dtor: true,
                simple_copy: false,
                zero_init: false,
            },
            ops: None,
            inner: None,
            array_len: 0,
            scripted: false,
            class: Some(ClassInfo {
                is_struct: false,
                is_abstract,
                base,
                native: true,
                props: Vec::new(),
                functions: HashMap::new(),
                ctor: None,
                dtor: None,
                scripted_size: 0,
                scripted_align: 1,
            }),
            enum_info: None,
        })
    }

    /// Register an engine enum with fixed options.
    pub fn register_native_enum(
        &mut self,
        name: Name,
        size: u8,
        signed: bool,
        options: Vec<(Name, i64)>,
    ) -> TypeId {
        self.add_type(TypeDef {
            name,
            kind: MetaKind::Enum,
            size: size as u32,
            align: size as u32,
            traits: TypeTraits::plain(),
            ops: None,
            inner: None,
            array_len: 0,
            scripted: false,
            class: None,
            enum_info: Some(EnumInfo {
                size,
                signed,
                options,
            }),
        })
    }

    /// Register an engine property on a native class, with an explicit
    /// offset into the native object layout.
    pub fn register_native_property(
        &mut self,
        class: TypeId,
        name: Name,
        ty: TypeId,
        offset: u32,
    ) {
        let info = self
            .type_def_mut(class)
            .class
            .as_mut()
            .expect("property owner is not a class");
        info.props.push(Property {
            name,
            ty,
            offset,
            flags: PropFlags::empty(),
        });
    }

    /// Register a function implemented by the engine.
    pub fn register_native_function(
        &mut self,
        name: Name,
        class: Option<TypeId>,
        ret: Option<ParamType>,
        params: Vec<ParamType>,
        is_static: bool,
        body: NativeFn,
    ) -> FuncId {
        let qualified = self.qualified_function_id(name, class);
        let id = self.add_function(
            qualified,
            Function {
                name,
                class,
                ret,
                params,
                is_static,
                scripted: false,
                body: FunctionBody::Native(body),
                code_hash: 0,
            },
        );
        if let Some(class) = class {
            if let Some(info) = self.type_def_mut(class).class.as_mut() {
                info.functions.insert(name, id);
            }
        }
        id
    }

    //--- scripted creation (idempotent) ----------------------------------

    fn mark_used_type(&mut self, kind: &'static str, id: TypeId) {
        if !self.used.insert(UsedEntity::Type(id)) {
            let name = self.type_def(id).name;
            log::error!(
                "Scripted {} '{}' was already loaded from scripts, seems like we have a duplicate",
                kind,
                name
            );
            self.duplicates.push((kind, name));
        }
    }

    /// Create (or reuse) a scripted enum. Creating the same name twice in
    /// one load records a duplicate-export diagnostic.
    pub fn create_enum(&mut self, name: Name, size: u8, signed: bool) -> TypeId {
        let id = match self.find_type(name) {
            Some(id) => id,
            None => {
                log::info!("Created scripted enum {}", name);
                self.add_type(TypeDef {
                    name,
                    kind: MetaKind::Enum,
                    size: size as u32,
                    align: size as u32,
                    traits: TypeTraits::plain(),
                    ops: None,
                    inner: None,
                    array_len: 0,
                    scripted: true,
                    class: None,
                    enum_info: Some(EnumInfo {
                        size,
                        signed,
                        options: Vec::new(),
                    }),
                })
            }
        };
        // A reused enum may change width between reloads
        let def = self.type_def_mut(id);
        def.size = size as u32;
        def.align = size as u32;
        if let Some(info) = def.enum_info.as_mut() {
            info.size = size;
            info.signed = signed;
        }
        self.mark_used_type("enum", id);
        id
    }

    pub fn add_enum_option(&mut self, id: TypeId, name: Name, value: i64) {
        if let Some(info) = self.type_def_mut(id).enum_info.as_mut() {
            info.options.push((name, value));
        }
    }

    /// Create (or reuse) a scripted class on top of a native base.
    pub fn create_class(&mut self, name: Name, native_base: TypeId) -> TypeId {
        let id = match self.find_type(name) {
            Some(id) => id,
            None => {
                log::info!("Created scripted class {}", name);
                self.add_type(TypeDef {
                    name,
                    kind: MetaKind::Class,
                    size: 0,
                    align: 1,
                    traits: TypeTraits {
                        requires_ctor: true,
                        requires_dtor: true,
                        simple_copy: false,
                        zero_init: false,
                    },
                    ops: None,
                    inner: None,
                    array_len: 0,
                    scripted: true,
                    class: Some(ClassInfo {
                        is_struct: false,
                        is_abstract: false,
                        base: Some(native_base),
                        native: false,
                        props: Vec::new(),
                        functions: HashMap::new(),
                        ctor: None,
                        dtor: None,
                        scripted_size: 0,
                        scripted_align: 1,
                    }),
                    enum_info: None,
                })
            }
        };
        self.mark_used_type("class", id);
        id
    }

    /// Create (or reuse) a scripted struct: a value type with no base.
    pub fn create_struct(&mut self, name: Name) -> TypeId {
        let id = match self.find_type(name) {
            Some(id) => id,
            None => {
                log::info!("Created scripted struct {}", name);
                self.add_type(TypeDef {
                    name,
                    kind: MetaKind::Class,
                    size: 0,
                    align: 1,
                    traits: TypeTraits::default(),
                    ops: None,
                    inner: None,
                    array_len: 0,
                    scripted: true,
                    class: Some(ClassInfo {
                        is_struct: true,
                        is_abstract: false,
                        base: None,
                        native: false,
                        props: Vec::new(),
                        functions: HashMap::new(),
                        ctor: None,
                        dtor: None,
                        scripted_size: 0,
                        scripted_align: 1,
                    }),
                    enum_info: None,
                })
            }
        };
        self.mark_used_type("struct", id);
        id
    }

    /// Create (or reuse) a scripted function object.
    pub fn create_function(&mut self, name: Name, class: Option<TypeId>) -> FuncId {
        let qualified = self.qualified_function_id(name, class);
        let id = match self.function_ids.get(&qualified) {
            Some(&id) => id,
            None => self.add_function(
                qualified,
                Function {
                    name,
                    class,
                    ret: None,
                    params: Vec::new(),
                    is_static: false,
                    scripted: true,
                    body: FunctionBody::Empty,
                    code_hash: 0,
                },
            ),
        };
        if !self.used.insert(UsedEntity::Func(id)) {
            log::error!(
                "Scripted function '{}' was already loaded from scripts, seems like we have a duplicate",
                name
            );
            self.duplicates.push(("function", name));
        }
        if let Some(class) = class {
            if let Some(info) = self.type_def_mut(class).class.as_mut() {
                info.functions.insert(name, id);
            }
        }
        id
    }

    /// Bind signature and compiled body onto a scripted function.
    pub fn setup_scripted_function(
        &mut self,
        id: FuncId,
        ret: Option<ParamType>,
        params: Vec<ParamType>,
        code: Arc<CodeBlock>,
        is_static: bool,
    ) {
        let code_hash = code.code_hash();
        let function = self.function_mut(id);
        function.ret = ret;
        function.params = params;
        function.is_static = is_static;
        function.code_hash = code_hash;
        function.body = FunctionBody::Scripted(code);
    }

    /// Replace a scripted body with an AOT-compiled pointer. Only applied
    /// when the caller verified the code hash matches.
    pub fn bind_jitted_function(&mut self, id: FuncId, entry: JittedFn) {
        self.function_mut(id).body = FunctionBody::Jitted(entry);
    }

    /// Add a scripted property; its offset is assigned later by the layout
    /// fixed-point pass.
    pub fn add_scripted_property(
        &mut self,
        class: TypeId,
        name: Name,
        ty: TypeId,
        flags: PropFlags,
    ) {
        let info = self
            .type_def_mut(class)
            .class
            .as_mut()
            .expect("property owner is not a class");
        info.props.push(Property {
            name,
            ty,
            offset: 0,
            flags: flags | PropFlags::SCRIPTED,
        });
    }

    /// Link a scripted class to its (possibly scripted) base.
    pub fn set_class_base(&mut self, class: TypeId, base: TypeId) {
        if let Some(info) = self.type_def_mut(class).class.as_mut() {
            info.base = Some(base);
        }
    }

    pub fn set_class_abstract(&mut self, class: TypeId, is_abstract: bool) {
        if let Some(info) = self.type_def_mut(class).class.as_mut() {
            info.is_abstract = is_abstract;
        }
    }

    /// Record the scripted constructor/destructor of a class or struct.
    pub fn bind_class_special_functions(
        &mut self,
        class: TypeId,
        ctor: Option<FuncId>,
        dtor: Option<FuncId>,
    ) {
        if let Some(info) = self.type_def_mut(class).class.as_mut() {
            info.ctor = ctor;
            info.dtor = dtor;
        }
    }

    /// Duplicate-export diagnostics recorded since the last call.
    pub fn take_duplicates(&mut self) -> Vec<(&'static str, Name)> {
        std::mem::take(&mut self.duplicates)
    }

    /// Clear per-class function tables, enum options and scripted sizes
    /// before a reload, preserving type-object identity.
    pub fn prepare_for_reload(&mut self) {
        let mut cleared_classes = 0;
        let mut cleared_enums = 0;
        for def in &mut self.types {
            if !def.scripted {
                continue;
            }
            if let Some(info) = def.class.as_mut() {
                info.props.clear();
                info.functions.clear();
                info.ctor = None;
                info.dtor = None;
                info.scripted_size = 0;
                info.scripted_align = 1;
                if info.is_struct {
                    def.size = 0;
                    def.align = 1;
                }
                cleared_classes += 1;
            }
            if let Some(info) = def.enum_info.as_mut() {
                info.options.clear();
                cleared_enums += 1;
            }
        }
        let mut unbound = 0;
        for function in &mut self.functions {
            if function.scripted {
                function.body = FunctionBody::Empty;
                function.code_hash = 0;
                unbound += 1;
            }
        }
        log::info!(
            "Reload prepared: cleared {} classes/structs, {} enums, unbound {} functions",
            cleared_classes,
            cleared_enums,
            unbound
        );
        self.used.clear();
        self.duplicates.clear();
    }

    //--- derived types ---------------------------------------------------

    fn derived(&mut self, name: String, build: impl FnOnce(Name) -> TypeDef) -> TypeId {
        let name = Name::new(&name);
        match self.find_type(name) {
            Some(id) => id,
            None => self.add_type(build(name)),
        }
    }

    /// `ptr<Class>`, created on demand.
    pub fn strong_handle_type(&mut self, class: TypeId) -> TypeId {
        let inner = self.type_def(class).name;
        self.derived(format!("ptr<{}>", inner), |name| TypeDef {
            name,
            kind: MetaKind::StrongHandle,
            size: 8,
            align: 8,
            traits: TypeTraits {
                requires_ctor: false,
                requires_dtor: true,
                simple_copy: false,
                zero_init: true,
            },
            ops: None,
            inner: Some(class),
            array_len: 0,
            scripted: false,
            class: None,
            enum_info: None,
        })
    }

    /// `weak<Class>`, created on demand.
    pub fn weak_handle_type(&mut self, class: TypeId) -> TypeId {
        let inner = self.type_def(class).name;
        self.derived(format!("weak<{}>", inner), |name| TypeDef {
            name,
            kind: MetaKind::WeakHandle,
            size: 8,
            align: 8,
            traits: TypeTraits {
                requires_ctor: false,
                requires_dtor: true,
                simple_copy: false,
                zero_init: true,
            },
            ops: None,
            inner: Some(class),
            array_len: 0,
            scripted: false,
            class: None,
            enum_info: None,
        })
    }

    /// `class<Class>`, created on demand. The value is a type id.
    pub fn class_ref_type(&mut self, class: TypeId) -> TypeId {
        let inner = self.type_def(class).name;
        self.derived(format!("class<{}>", inner), |name| TypeDef {
            name,
            kind: MetaKind::ClassRef,
            size: 4,
            align: 4,
            traits: TypeTraits::plain(),
            ops: None,
            inner: Some(class),
            array_len: 0,
            scripted: false,
            class: None,
            enum_info: None,
        })
    }

    /// `array<T>`, created on demand.
    pub fn dynamic_array_type(&mut self, element: TypeId) -> TypeId {
        let inner = self.type_def(element).name;
        self.derived(format!("array<{}>", inner), |name| TypeDef {
            name,
            kind: MetaKind::DynamicArray,
            size: std::mem::size_of::<RawArray>() as u32,
            align: std::mem::align_of::<RawArray>() as u32,
            traits: TypeTraits {
                requires_ctor: false,
                requires_dtor: true,
                simple_copy: false,
                zero_init: true,
            },
            ops: None,
            inner: Some(element),
            array_len: 0,
            scripted: false,
            class: None,
            enum_info: None,
        })
    }

    /// `T[N]`, created on demand.
    pub fn static_array_type(&mut self, element: TypeId, len: u32) -> TypeId {
        let elem = self.type_def(element);
        let stride = align_up(elem.size, elem.align);
        let (size, align, traits) = (stride * len, elem.align, elem.traits);
        let inner = elem.name;
        self.derived(format!("{}[{}]", inner, len), |name| TypeDef {
            name,
            kind: MetaKind::StaticArray,
            size,
            align,
            traits,
            ops: None,
            inner: Some(element),
            array_len: len,
            scripted: false,
            class: None,
            enum_info: None,
        })
    }

    //--- layout ----------------------------------------------------------

    /// Recompute a struct's value layout from its properties. Returns true
    /// if the size changed, so callers can iterate to a fixed point
    /// (structs may contain structs declared later).
    pub fn recompute_struct_layout(&mut self, id: TypeId) -> bool {
        let info = match self.type_def(id).class_info() {
            Some(info) if info.is_struct => info,
            _ => return false,
        };
        let prop_types: Vec<(usize, TypeId)> = info
            .props
            .iter()
            .enumerate()
            .map(|(i, p)| (i, p.ty))
            .collect();

        let mut cursor = 0u32;
        let mut max_align = 1u32;
        let mut requires_ctor = false;
        let mut requires_dtor = false;
        let mut simple_copy = true;
        let mut zero_init = true;
        let mut offsets = Vec::with_capacity(prop_types.len());
        for (_, ty) in &prop_types {
            let def = self.type_def(*ty);
            let offset = align_up(cursor, def.align);
            offsets.push(offset);
            cursor = offset + def.size;
            max_align = max_align.max(def.align);
            requires_ctor |= def.traits.requires_ctor;
            requires_dtor |= def.traits.requires_dtor;
            simple_copy &= def.traits.simple_copy;
            zero_init &= def.traits.zero_init || !def.traits.requires_ctor;
        }
        let size = align_up(cursor, max_align);

        let def = self.type_def_mut(id);
        let changed = def.size != size || def.align != max_align;
        def.size = size;
        def.align = max_align;
        def.traits = TypeTraits {
            requires_ctor,
            requires_dtor,
            simple_copy,
            zero_init,
        };
        let info = def.class.as_mut().unwrap();
        info.scripted_size = size;
        info.scripted_align = max_align;
        for (slot, offset) in offsets.into_iter().enumerate() {
            info.props[slot].offset = offset;
        }
        changed
    }

    /// Recompute a class's scripted buffer layout, stacking on top of the
    /// base class's scripted data. Returns true if the size changed.
    pub fn recompute_class_layout(&mut self, id: TypeId) -> bool {
        let info = match self.type_def(id).class_info() {
            Some(info) if !info.is_struct => info,
            _ => return false,
        };
        let base_size = info
            .base
            .and_then(|base| self.type_def(base).class_info())
            .map(|base| base.scripted_size)
            .unwrap_or(0);
        let base_align = info
            .base
            .and_then(|base| self.type_def(base).class_info())
            .map(|base| base.scripted_align)
            .unwrap_or(1);
        let prop_types: Vec<TypeId> = info.props.iter().map(|p| p.ty).collect();

        let mut cursor = base_size;
        let mut max_align = base_align;
        let mut offsets = Vec::with_capacity(prop_types.len());
        for ty in &prop_types {
            let def = self.type_def(*ty);
            let offset = align_up(cursor, def.align);
            offsets.push(offset);
            cursor = offset + def.size;
            max_align = max_align.max(def.align);
        }
        let size = align_up(cursor, max_align);

        let info = self.type_def_mut(id).class.as_mut().unwrap();
        let changed = info.scripted_size != size || info.scripted_align != max_align;
        info.scripted_size = size;
        info.scripted_align = max_align;
        for (slot, offset) in offsets.into_iter().enumerate() {
            info.props[slot].offset = offset;
        }
        changed
    }

    //--- value operations ------------------------------------------------

    fn array_stride(&self, element: TypeId) -> usize {
        let def = self.type_def(element);
        align_up(def.size, def.align) as usize
    }

    /// Construct a value of `ty` in possibly zeroed storage.
    ///
    /// # Safety
    /// `ptr` must point at aligned storage of at least the type's size.
    pub unsafe fn construct(&self, ty: TypeId, ptr: *mut u8) {
        let def = self.type_def(ty);
        match def.kind {
            MetaKind::Simple => match def.ops {
                Some(ops) => (ops.ctor)(ptr),
                None => std::ptr::write_bytes(ptr, 0, def.size as usize),
            },
            MetaKind::Void | MetaKind::Enum | MetaKind::ClassRef => {
                std::ptr::write_bytes(ptr, 0, def.size as usize)
            }
            MetaKind::StrongHandle | MetaKind::WeakHandle | MetaKind::DynamicArray => {
                std::ptr::write_bytes(ptr, 0, def.size as usize)
            }
            MetaKind::StaticArray => {
                let element = def.inner.unwrap();
                let stride = self.array_stride(element);
                for i in 0..def.array_len as usize {
                    self.construct(element, ptr.add(i * stride));
                }
            }
            MetaKind::Class => {
                if def.is_struct() {
                    let props: Vec<(u32, TypeId)> = def
                        .class_info()
                        .unwrap()
                        .props
                        .iter()
                        .map(|p| (p.offset, p.ty))
                        .collect();
                    std::ptr::write_bytes(ptr, 0, def.size as usize);
                    for (offset, prop_ty) in props {
                        if self.type_def(prop_ty).traits.requires_ctor {
                            self.construct(prop_ty, ptr.add(offset as usize));
                        }
                    }
                }
            }
        }
    }

    /// Destruct a value of `ty`.
    ///
    /// # Safety
    /// `ptr` must point at a constructed value of the type.
    pub unsafe fn destruct(&self, ty: TypeId, ptr: *mut u8) {
        let def = self.type_def(ty);
        match def.kind {
            MetaKind::Simple => {
                if let Some(ops) = def.ops {
                    (ops.dtor)(ptr)
                }
            }
            MetaKind::StrongHandle => object::strong_release(self, ptr),
            MetaKind::WeakHandle => object::weak_release(ptr),
            MetaKind::DynamicArray => {
                let element = def.inner.unwrap();
                let array = &mut *(ptr as *mut RawArray);
                if !array.data.is_null() {
                    let stride = self.array_stride(element);
                    if self.type_def(element).traits.requires_dtor {
                        for i in 0..array.len {
                            self.destruct(element, array.data.add(i * stride));
                        }
                    }
                    let layout = std::alloc::Layout::from_size_align(
                        stride * array.cap,
                        self.type_def(element).align.max(1) as usize,
                    )
                    .unwrap();
                    std::alloc::dealloc(array.data, layout);
                    *array = RawArray::empty();
                }
            }
            MetaKind::StaticArray => {
                let element = def.inner.unwrap();
                if self.type_def(element).traits.requires_dtor {
                    let stride = self.array_stride(element);
                    for i in 0..def.array_len as usize {
                        self.destruct(element, ptr.add(i * stride));
                    }
                }
            }
            MetaKind::Class if def.is_struct() => {
                let props: Vec<(u32, TypeId)> = def
                    .class_info()
                    .unwrap()
                    .props
                    .iter()
                    .map(|p| (p.offset, p.ty))
                    .collect();
                for (offset, prop_ty) in props {
                    if self.type_def(prop_ty).traits.requires_dtor {
                        self.destruct(prop_ty, ptr.add(offset as usize));
                    }
                }
            }
            _ => {}
        }
    }

    /// Copy between two constructed values of `ty`.
    ///
    /// # Safety
    /// Both pointers must address constructed values of the type.
    pub unsafe fn copy_value(&self, ty: TypeId, dst: *mut u8, src: *const u8) {
        let def = self.type_def(ty);
        if def.traits.simple_copy {
            std::ptr::copy(src, dst, def.size as usize);
            return;
        }
        match def.kind {
            MetaKind::Simple => {
                if let Some(ops) = def.ops {
                    (ops.copy)(dst, src)
                }
            }
            MetaKind::StrongHandle => object::strong_copy(self, dst, src),
            MetaKind::WeakHandle => object::weak_copy(dst, src),
            MetaKind::DynamicArray => {
                let element = def.inner.unwrap();
                let stride = self.array_stride(element);
                let src_array = &*(src as *const RawArray);
                // Rebuild the destination from scratch
                self.destruct(ty, dst);
                if src_array.len > 0 {
                    let layout = std::alloc::Layout::from_size_align(
                        stride * src_array.len,
                        self.type_def(element).align.max(1) as usize,
                    )
                    .unwrap();
                    let data = std::alloc::alloc_zeroed(layout);
                    assert!(!data.is_null());
                    for i in 0..src_array.len {
                        let elem_dst = data.add(i * stride);
                        self.construct(element, elem_dst);
                        self.copy_value(element, elem_dst, src_array.data.add(i * stride));
                    }
                    *(dst as *mut RawArray) = RawArray {
                        data,
                        len: src_array.len,
                        cap: src_array.len,
                    };
                }
            }
            MetaKind::StaticArray => {
                let element = def.inner.unwrap();
                let stride = self.array_stride(element);
                for i in 0..def.array_len as usize {
                    self.copy_value(element, dst.add(i * stride), src.add(i * stride));
                }
            }
            MetaKind::Class if def.is_struct() => {
                let props: Vec<(u32, TypeId)> = def
                    .class_info()
                    .unwrap()
                    .props
                    .iter()
                    .map(|p| (p.offset, p.ty))
                    .collect();
                for (offset, prop_ty) in props {
                    self.copy_value(
                        prop_ty,
                        dst.add(offset as usize),
                        src.add(offset as usize),
                    );
                }
            }
            _ => {}
        }
    }

    /// Compare two constructed values of `ty` for equality.
    ///
    /// # Safety
    /// Both pointers must address constructed values of the type.
    pub unsafe fn compare_values(&self, ty: TypeId, a: *const u8, b: *const u8) -> bool {
        let def = self.type_def(ty);
        if def.traits.simple_copy {
            return std::slice::from_raw_parts(a, def.size as usize)
                == std::slice::from_raw_parts(b, def.size as usize);
        }
        match def.kind {
            MetaKind::Simple => match def.ops {
                Some(ops) => (ops.compare)(a, b),
                None => true,
            },
            MetaKind::StrongHandle | MetaKind::WeakHandle => {
                (a as *const usize).read() == (b as *const usize).read()
            }
            MetaKind::DynamicArray => {
                let element = def.inner.unwrap();
                let stride = self.array_stride(element);
                let array_a = &*(a as *const RawArray);
                let array_b = &*(b as *const RawArray);
                if array_a.len != array_b.len {
                    return false;
                }
                (0..array_a.len).all(|i| {
                    self.compare_values(
                        element,
                        array_a.data.add(i * stride),
                        array_b.data.add(i * stride),
                    )
                })
            }
            MetaKind::StaticArray => {
                let element = def.inner.unwrap();
                let stride = self.array_stride(element);
                (0..def.array_len as usize).all(|i| {
                    self.compare_values(element, a.add(i * stride), b.add(i * stride))
                })
            }
            MetaKind::Class if def.is_struct() => {
                let props: Vec<(u32, TypeId)> = def
                    .class_info()
                    .unwrap()
                    .props
                    .iter()
                    .map(|p| (p.offset, p.ty))
                    .collect();
                props.into_iter().all(|(offset, prop_ty)| {
                    self.compare_values(prop_ty, a.add(offset as usize), b.add(offset as usize))
                })
            }
            _ => true,
        }
    }

    /// Construct every scripted property of an object's external buffer,
    /// walking the base chain.
    ///
    /// # Safety
    /// `data` must be the object's zeroed scripted buffer.
    pub unsafe fn construct_object_data(&self, class: TypeId, data: *mut u8) {
        let mut cursor = Some(class);
        while let Some(current) = cursor {
            let info = match self.type_def(current).class_info() {
                Some(info) => info,
                None => break,
            };
            let props: Vec<(u32, TypeId)> = info
                .props
                .iter()
                .filter(|p| p.flags.contains(PropFlags::EXTERNAL_BUFFER))
                .map(|p| (p.offset, p.ty))
                .collect();
            for (offset, ty) in props {
                if self.type_def(ty).traits.requires_ctor {
                    self.construct(ty, data.add(offset as usize));
                }
            }
            cursor = info.base;
        }
    }

    /// Destruct every scripted property of an object's external buffer.
    ///
    /// # Safety
    /// `data` must be the object's constructed scripted buffer.
    pub unsafe fn destruct_object_data(&self, class: TypeId, data: *mut u8) {
        let mut cursor = Some(class);
        while let Some(current) = cursor {
            let info = match self.type_def(current).class_info() {
                Some(info) => info,
                None => break,
            };
            let props: Vec<(u32, TypeId)> = info
                .props
                .iter()
                .filter(|p| p.flags.contains(PropFlags::EXTERNAL_BUFFER))
                .map(|p| (p.offset, p.ty))
                .collect();
            for (offset, ty) in props {
                if self.type_def(ty).traits.requires_dtor {
                    self.destruct(ty, data.add(offset as usize));
                }
            }
            cursor = info.base;
        }
    }
}

impl Default for TypeRegistry {
    fn default() -> TypeRegistry {
        TypeRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotent_registration() {
        let mut registry = TypeRegistry::new();
        let first = registry.create_enum(Name::new("pkg.E"), 1, false);
        assert!(registry.take_duplicates().is_empty());
        let second = registry.create_enum(Name::new("pkg.E"), 1, false);
        assert_eq!(first, second);
        let dups = registry.take_duplicates();
        assert_eq!(dups.len(), 1);
        assert_eq!(dups[0].1.as_str(), "pkg.E");
    }

    #[test]
    fn test_struct_layout_alignment() {
        let mut registry = TypeRegistry::new();
        let s = registry.create_struct(Name::new("pkg.Vec"));
        let (u8_ty, f64_ty) = (registry.primitives.uint8, registry.primitives.double);
        registry.add_scripted_property(s, Name::new("a"), u8_ty, PropFlags::empty());
        registry.add_scripted_property(s, Name::new("b"), f64_ty, PropFlags::empty());
        registry.recompute_struct_layout(s);

        let def = registry.type_def(s);
        let info = def.class_info().unwrap();
        assert_eq!(info.props[0].offset, 0);
        assert_eq!(info.props[1].offset, 8);
        assert_eq!(def.size, 16);
        assert_eq!(def.align, 8);
    }

    #[test]
    fn test_reload_keeps_identity() {
        let mut registry = TypeRegistry::new();
        let e = registry.create_enum(Name::new("pkg.E"), 1, false);
        registry.add_enum_option(e, Name::new("A"), 1);
        registry.prepare_for_reload();
        assert!(registry
            .type_def(e)
            .enum_info
            .as_ref()
            .unwrap()
            .options
            .is_empty());
        // Re-creating after reload reuses the same id, no duplicate
        let again = registry.create_enum(Name::new("pkg.E"), 2, false);
        assert_eq!(e, again);
        assert!(registry.take_duplicates().is_empty());
    }

    #[test]
    fn test_derived_type_names() {
        let mut registry = TypeRegistry::new();
        let class = registry.register_native_class(Name::new("Actor"), None, false);
        let strong = registry.strong_handle_type(class);
        assert_eq!(registry.type_def(strong).name.as_str(), "ptr<Actor>");
        // Created once
        assert_eq!(registry.strong_handle_type(class), strong);
        let array = registry.dynamic_array_type(registry.primitives.int32);
        assert_eq!(registry.type_def(array).name.as_str(), "array<int32>");
    }

    #[test]
    fn test_string_value_ops() {
        let registry = TypeRegistry::new();
        let ty = registry.primitives.string;
        let size = registry.type_def(ty).size as usize;
        let align = registry.type_def(ty).align as usize;
        let a = crate::object::AlignedBuf::zeroed(size, align);
        let b = crate::object::AlignedBuf::zeroed(size, align);
        unsafe {
            registry.construct(ty, a.as_ptr());
            registry.construct(ty, b.as_ptr());
            *(a.as_ptr() as *mut String) = "hello".to_owned();
            assert!(!registry.compare_values(ty, a.as_ptr(), b.as_ptr()));
            registry.copy_value(ty, b.as_ptr(), a.as_ptr());
            assert!(registry.compare_values(ty, a.as_ptr(), b.as_ptr()));
            registry.destruct(ty, a.as_ptr());
            registry.destruct(ty, b.as_ptr());
        }
    }
}
