//! The stub model: the strongly-typed intermediate representation of a
//! compiled script module. Stubs live in a [StubSlab] and reference each
//! other through 32-bit [StubId] indices, so a loaded module graph is plain
//! relocatable data. This module only declares the shapes plus the small
//! graph operations defined on them (qualified names, structural matching,
//! pruning, post-load map rebuilds); packing and unpacking lives in
//! [`crate::codec`].

use crate::{
    error::SourceLoc,
    name::Name,
    opcodes::{Immediate, Opcode},
};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::collections::{HashMap, HashSet};
use std::num::NonZeroU32;

/// Discriminant of a stub, also the tag byte in the packed form.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum StubType {
    None = 0,
    Module,
    ModuleImport,
    File,
    TypeName,
    TypeDecl,
    TypeRef,
    Class,
    Constant,
    ConstantValue,
    Enum,
    EnumOption,
    Property,
    Function,
    FunctionArg,
    Opcode,
}

bitflags::bitflags! {
    /// Per-stub flag set, stored as a raw u32 on the wire.
    pub struct StubFlags: u32 {
        const NATIVE             = 1 << 0;
        const IMPORT             = 1 << 1;
        const STRUCT             = 1 << 2;
        const CLASS              = 1 << 3;
        const EXPLICIT           = 1 << 4;
        const UNSAFE             = 1 << 5;
        const ABSTRACT           = 1 << 6;
        const EDITABLE           = 1 << 7;
        const PROTECTED          = 1 << 8;
        const PRIVATE            = 1 << 9;
        const INLINED            = 1 << 10;
        const CONST              = 1 << 11;
        const FINAL              = 1 << 12;
        const STATIC             = 1 << 13;
        const OVERRIDE           = 1 << 14;
        const FUNCTION           = 1 << 15;
        const SIGNAL             = 1 << 16;
        const PROPERTY           = 1 << 17;
        const OPERATOR           = 1 << 18;
        const CAST               = 1 << 19;
        const OPCODE             = 1 << 20;
        const REF                = 1 << 21;
        const OUT                = 1 << 22;
        const CONSTRUCTOR        = 1 << 23;
        const DESTRUCTOR         = 1 << 24;
        const IMPORT_DEPENDENCY  = 1 << 25;
    }
}

impl Default for StubFlags {
    fn default() -> StubFlags {
        StubFlags::empty()
    }
}

/// Index of a stub inside its slab. Wire index 0 is the null sentinel, so
/// a nullable reference is simply `Option<StubId>`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StubId(NonZeroU32);

impl StubId {
    /// Build from a 1-based wire index; 0 maps to `None`.
    pub fn from_index(index: u32) -> Option<StubId> {
        NonZeroU32::new(index).map(StubId)
    }

    /// The 1-based wire index.
    pub fn index(self) -> u32 {
        self.0.get()
    }
}

/// Source position of a stub: the file stub it came from and a line.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Location {
    pub file: Option<StubId>,
    pub line: u32,
}

/// Meta-shape of a type declaration expression.
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum TypeDeclKind {
    /// Alias of a [TypeRefStub]
    Simple,
    /// Names an engine-native type directly
    Engine,
    /// `class<T>`
    ClassType,
    /// Strong pointer to T
    PtrType,
    /// Weak pointer to T
    WeakPtrType,
    /// Dynamically sized array of T
    DynamicArray,
    /// Fixed-size array of T
    StaticArray,
}

/// A declared constant value. Compound values reference their sub-values
/// by stub id.
#[derive(Clone, Debug, PartialEq)]
pub enum ConstValue {
    Integer(i64),
    Unsigned(u64),
    Float(f64),
    Bool(bool),
    String(String),
    Name(Name),
    Compound {
        type_decl: Option<StubId>,
        values: Vec<StubId>,
    },
}

impl Default for ConstValue {
    fn default() -> ConstValue {
        ConstValue::Integer(0)
    }
}

//---

/// Root of a compiled package.
#[derive(Clone, Debug, Default)]
pub struct ModuleStub {
    pub files: Vec<StubId>,
    /// Imported module clones, mostly stripped of stubs
    pub imports: Vec<StubId>,
    /// name -> top-level stub, rebuilt by [Stub::post_load]
    pub stub_map: HashMap<Name, StubId>,
}

/// Marker for a module this one depends on; carries the stripped clone of
/// the imported module's declarations.
#[derive(Clone, Debug, Default)]
pub struct ModuleImportStub {
    pub imported_module: Option<StubId>,
}

#[derive(Clone, Debug, Default)]
pub struct FileStub {
    pub depot_path: String,
    pub absolute_path: String,
    pub stubs: Vec<StubId>,
}

/// A named type alias.
#[derive(Clone, Debug, Default)]
pub struct TypeNameStub {
    pub linked_type: Option<StubId>,
}

/// A by-name link to a type stub, resolved during compilation. Never points
/// at another type-decl, type-ref or type-name, only at actual types.
#[derive(Clone, Debug, Default)]
pub struct TypeRefStub {
    pub resolved: Option<StubId>,
}

/// A type expression.
#[derive(Clone, Debug)]
pub struct TypeDeclStub {
    pub kind: TypeDeclKind,
    /// Inner element type, arrays only
    pub inner: Option<StubId>,
    /// Referenced type, simple/class/ptr/weak
    pub referenced: Option<StubId>,
    pub array_size: u32,
}

impl Default for TypeDeclStub {
    fn default() -> TypeDeclStub {
        TypeDeclStub {
            kind: TypeDeclKind::Simple,
            inner: None,
            referenced: None,
            array_size: 0,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ClassStub {
    pub base_class_name: Name,
    pub parent_class_name: Name,
    pub engine_import_name: Name,
    pub stubs: Vec<StubId>,
    /// name -> member, rebuilt by [Stub::post_load]
    pub stub_map: HashMap<Name, StubId>,
    pub base_class: Option<StubId>,
    pub derived_classes: Vec<StubId>,
    pub parent_class: Option<StubId>,
    pub child_classes: Vec<StubId>,
}

#[derive(Clone, Debug, Default)]
pub struct ConstantStub {
    pub type_decl: Option<StubId>,
    pub value: Option<StubId>,
}

#[derive(Clone, Debug, Default)]
pub struct ConstValueStub {
    pub value: ConstValue,
}

#[derive(Clone, Debug, Default)]
pub struct EnumStub {
    pub options: Vec<StubId>,
    /// name -> option, rebuilt by [Stub::post_load]
    pub options_map: HashMap<Name, StubId>,
    pub engine_import_name: Name,
}

#[derive(Clone, Debug, Default)]
pub struct EnumOptionStub {
    pub assigned_value: i64,
    pub has_user_value: bool,
}

#[derive(Clone, Debug, Default)]
pub struct PropertyStub {
    pub type_decl: Option<StubId>,
    pub default_value: Option<StubId>,
}

#[derive(Clone, Debug, Default)]
pub struct FunctionArgStub {
    pub type_decl: Option<StubId>,
    pub default_value: Option<StubId>,
    pub index: i16,
}

#[derive(Clone, Debug, Default)]
pub struct FunctionStub {
    pub operator_name: Name,
    pub opcode_name: Name,
    pub alias_name: Name,
    pub cast_cost: i8,
    pub return_type: Option<StubId>,
    pub args: Vec<StubId>,
    /// Matching function in the base class
    pub base_function: Option<StubId>,
    /// Matching function in the parent class
    pub parent_function: Option<StubId>,
    pub opcodes: Vec<StubId>,
    pub code_hash: u64,
}

/// One portable instruction in a function body.
#[derive(Clone, Debug, Default)]
pub struct OpcodeStub {
    pub op: Opcode,
    /// Referenced entity: variable, property, function, type, enum, class
    pub stub: Option<StubId>,
    /// Jump target, always a Label opcode stub
    pub target: Option<StubId>,
    pub value: Immediate,
}

//---

/// The per-kind payload of a stub.
#[derive(Clone, Debug)]
pub enum StubBody {
    Module(ModuleStub),
    ModuleImport(ModuleImportStub),
    File(FileStub),
    TypeName(TypeNameStub),
    TypeDecl(TypeDeclStub),
    TypeRef(TypeRefStub),
    Class(ClassStub),
    Constant(ConstantStub),
    ConstantValue(ConstValueStub),
    Enum(EnumStub),
    EnumOption(EnumOptionStub),
    Property(PropertyStub),
    Function(FunctionStub),
    FunctionArg(FunctionArgStub),
    Opcode(OpcodeStub),
}

/// A single stub: owner back-reference, source location, flags, simple name
/// and the kind-specific body.
#[derive(Clone, Debug)]
pub struct Stub {
    pub owner: Option<StubId>,
    pub location: Location,
    pub flags: StubFlags,
    pub name: Name,
    pub body: StubBody,
}

macro_rules! stub_accessors {
    ($as_fn:ident, $as_mut_fn:ident, $variant:ident, $ty:ty) => {
        pub fn $as_fn(&self) -> Option<&$ty> {
            match &self.body {
                StubBody::$variant(inner) => Some(inner),
                _ => None,
            }
        }

        pub fn $as_mut_fn(&mut self) -> Option<&mut $ty> {
            match &mut self.body {
                StubBody::$variant(inner) => Some(inner),
                _ => None,
            }
        }
    };
}

impl Stub {
    /// Allocate an empty shell of the given kind, as the unpacker does
    /// before filling fields in.
    pub fn shell(stub_type: StubType) -> Option<Stub> {
        let body = match stub_type {
            StubType::None => return None,
            StubType::Module => StubBody::Module(Default::default()),
            StubType::ModuleImport => StubBody::ModuleImport(Default::default()),
            StubType::File => StubBody::File(Default::default()),
            StubType::TypeName => StubBody::TypeName(Default::default()),
            StubType::TypeDecl => StubBody::TypeDecl(Default::default()),
            StubType::TypeRef => StubBody::TypeRef(Default::default()),
            StubType::Class => StubBody::Class(Default::default()),
            StubType::Constant => StubBody::Constant(Default::default()),
            StubType::ConstantValue => StubBody::ConstantValue(Default::default()),
            StubType::Enum => StubBody::Enum(Default::default()),
            StubType::EnumOption => StubBody::EnumOption(Default::default()),
            StubType::Property => StubBody::Property(Default::default()),
            StubType::Function => StubBody::Function(Default::default()),
            StubType::FunctionArg => StubBody::FunctionArg(Default::default()),
            StubType::Opcode => StubBody::Opcode(Default::default()),
        };
        Some(Stub {
            owner: None,
            location: Location::default(),
            flags: StubFlags::empty(),
            name: Name::none(),
            body,
        })
    }

    /// Build a fresh stub with the given shape.
    pub fn new(name: Name, owner: Option<StubId>, body: StubBody) -> Stub {
        Stub {
            owner,
            location: Location::default(),
            flags: StubFlags::empty(),
            name,
            body,
        }
    }

    pub fn stub_type(&self) -> StubType {
        match &self.body {
            StubBody::Module(_) => StubType::Module,
            StubBody::ModuleImport(_) => StubType::ModuleImport,
            StubBody::File(_) => StubType::File,
            StubBody::TypeName(_) => StubType::TypeName,
            StubBody::TypeDecl(_) => StubType::TypeDecl,
            StubBody::TypeRef(_) => StubType::TypeRef,
            StubBody::Class(_) => StubType::Class,
            StubBody::Constant(_) => StubType::Constant,
            StubBody::ConstantValue(_) => StubType::ConstantValue,
            StubBody::Enum(_) => StubType::Enum,
            StubBody::EnumOption(_) => StubType::EnumOption,
            StubBody::Property(_) => StubType::Property,
            StubBody::Function(_) => StubType::Function,
            StubBody::FunctionArg(_) => StubType::FunctionArg,
            StubBody::Opcode(_) => StubType::Opcode,
        }
    }

    /// Is this stub declared in another module (either imported directly or
    /// pulled in as a dependency of an import)?
    pub fn is_import(&self) -> bool {
        self.flags
            .intersects(StubFlags::IMPORT | StubFlags::IMPORT_DEPENDENCY)
    }

    stub_accessors!(as_module, as_module_mut, Module, ModuleStub);
    stub_accessors!(as_module_import, as_module_import_mut, ModuleImport, ModuleImportStub);
    stub_accessors!(as_file, as_file_mut, File, FileStub);
    stub_accessors!(as_type_name, as_type_name_mut, TypeName, TypeNameStub);
    stub_accessors!(as_type_decl, as_type_decl_mut, TypeDecl, TypeDeclStub);
    stub_accessors!(as_type_ref, as_type_ref_mut, TypeRef, TypeRefStub);
    stub_accessors!(as_class, as_class_mut, Class, ClassStub);
    stub_accessors!(as_constant, as_constant_mut, Constant, ConstantStub);
    stub_accessors!(as_const_value, as_const_value_mut, ConstantValue, ConstValueStub);
    stub_accessors!(as_enum, as_enum_mut, Enum, EnumStub);
    stub_accessors!(as_enum_option, as_enum_option_mut, EnumOption, EnumOptionStub);
    stub_accessors!(as_property, as_property_mut, Property, PropertyStub);
    stub_accessors!(as_function, as_function_mut, Function, FunctionStub);
    stub_accessors!(as_function_arg, as_function_arg_mut, FunctionArg, FunctionArgStub);
    stub_accessors!(as_opcode, as_opcode_mut, Opcode, OpcodeStub);
}

//---

/// Owning container of a loaded module's stubs. Index 0 of the wire format
/// is the null sentinel; slab ids are the 1-based wire indices.
#[derive(Clone, Debug, Default)]
pub struct StubSlab {
    stubs: Vec<Stub>,
}

impl StubSlab {
    pub fn new() -> StubSlab {
        StubSlab::default()
    }

    pub fn alloc(&mut self, stub: Stub) -> StubId {
        self.stubs.push(stub);
        StubId::from_index(self.stubs.len() as u32).unwrap()
    }

    pub fn len(&self) -> usize {
        self.stubs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stubs.is_empty()
    }

    pub fn get(&self, id: StubId) -> &Stub {
        &self.stubs[(id.index() - 1) as usize]
    }

    pub fn get_mut(&mut self, id: StubId) -> &mut Stub {
        &mut self.stubs[(id.index() - 1) as usize]
    }

    /// Checked lookup for indices decoded from untrusted data.
    pub fn try_get(&self, id: StubId) -> Option<&Stub> {
        self.stubs.get((id.index() - 1) as usize)
    }

    pub fn ids(&self) -> impl Iterator<Item = StubId> {
        (1..=self.stubs.len() as u32).map(|i| StubId::from_index(i).unwrap())
    }

    pub fn iter(&self) -> impl Iterator<Item = (StubId, &Stub)> {
        self.stubs
            .iter()
            .enumerate()
            .map(|(i, stub)| (StubId::from_index(i as u32 + 1).unwrap(), stub))
    }

    /// Borrow a stub as a graph handle.
    pub fn at(&self, id: StubId) -> StubRef<'_> {
        StubRef { slab: self, id }
    }

    /// Fully qualified name: the dotted concatenation of the owner chain's
    /// simple names.
    pub fn full_name(&self, id: StubId) -> String {
        let mut parts = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let stub = self.get(current);
            if !stub.name.is_empty() {
                parts.push(stub.name.as_str());
            }
            cursor = stub.owner;
        }
        parts.reverse();
        parts.join(".")
    }

    /// Canonical printable form of a type declaration, defined recursively.
    /// Two type-decls match iff these strings are equal.
    pub fn type_decl_name(&self, id: StubId) -> String {
        let stub = self.get(id);
        let decl = match stub.as_type_decl() {
            Some(decl) => decl,
            None => return self.full_name(id),
        };
        match decl.kind {
            TypeDeclKind::Simple => self.type_ref_name(decl.referenced),
            TypeDeclKind::Engine => stub.name.as_str().to_owned(),
            TypeDeclKind::ClassType => {
                format!("class<{}>", self.type_ref_name(decl.referenced))
            }
            TypeDeclKind::PtrType => {
                format!("ptr<{}>", self.type_ref_name(decl.referenced))
            }
            TypeDeclKind::WeakPtrType => {
                format!("weak<{}>", self.type_ref_name(decl.referenced))
            }
            TypeDeclKind::DynamicArray => match decl.inner {
                Some(inner) => format!("array<{}>", self.type_decl_name(inner)),
                None => "array<unknown>".to_owned(),
            },
            TypeDeclKind::StaticArray => match decl.inner {
                Some(inner) => {
                    format!("{}[{}]", self.type_decl_name(inner), decl.array_size)
                }
                None => format!("unknown[{}]", decl.array_size),
            },
        }
    }

    fn type_ref_name(&self, id: Option<StubId>) -> String {
        let id = match id {
            Some(id) => id,
            None => return "unknown".to_owned(),
        };
        let stub = self.get(id);
        match stub.as_type_ref().and_then(|r| r.resolved) {
            Some(resolved) => self.full_name(resolved),
            None => stub.name.as_str().to_owned(),
        }
    }

    /// Source location of a stub, with the file path resolved.
    pub fn source_loc(&self, id: StubId) -> SourceLoc {
        let stub = self.get(id);
        match stub.location.file.and_then(|f| self.try_get(f)) {
            Some(file) => match file.as_file() {
                Some(file_stub) => {
                    SourceLoc::new(file_stub.absolute_path.clone(), stub.location.line)
                }
                None => SourceLoc::unknown(),
            },
            None => SourceLoc::unknown(),
        }
    }

    /// Rebuild every derived name map after deserialization.
    pub fn post_load(&mut self) {
        for index in 0..self.stubs.len() {
            let id = StubId::from_index(index as u32 + 1).unwrap();
            match self.stubs[index].stub_type() {
                StubType::Module => {
                    let files = self.get(id).as_module().unwrap().files.clone();
                    let mut map = HashMap::new();
                    for file in files {
                        if let Some(file_stub) = self.get(file).as_file() {
                            for &member in &file_stub.stubs {
                                map.insert(self.get(member).name, member);
                            }
                        }
                    }
                    self.get_mut(id).as_module_mut().unwrap().stub_map = map;
                }
                StubType::Class => {
                    let members = self.get(id).as_class().unwrap().stubs.clone();
                    let map = members
                        .into_iter()
                        .map(|member| (self.get(member).name, member))
                        .collect();
                    self.get_mut(id).as_class_mut().unwrap().stub_map = map;
                }
                StubType::Enum => {
                    let options = self.get(id).as_enum().unwrap().options.clone();
                    let map = options
                        .into_iter()
                        .map(|option| (self.get(option).name, option))
                        .collect();
                    self.get_mut(id).as_enum_mut().unwrap().options_map = map;
                }
                _ => {}
            }
        }
    }
}

//---

/// Copyable handle pairing a slab with one of its stubs, so graph walks
/// read naturally.
#[derive(Copy, Clone)]
pub struct StubRef<'a> {
    pub slab: &'a StubSlab,
    pub id: StubId,
}

impl<'a> StubRef<'a> {
    pub fn stub(self) -> &'a Stub {
        self.slab.get(self.id)
    }

    pub fn name(self) -> Name {
        self.stub().name
    }

    pub fn flags(self) -> StubFlags {
        self.stub().flags
    }

    pub fn stub_type(self) -> StubType {
        self.stub().stub_type()
    }

    pub fn owner(self) -> Option<StubRef<'a>> {
        self.stub().owner.map(|id| self.slab.at(id))
    }

    /// Follow an intra-slab reference.
    pub fn at(self, id: StubId) -> StubRef<'a> {
        self.slab.at(id)
    }

    pub fn full_name(self) -> String {
        self.slab.full_name(self.id)
    }

    pub fn location(self) -> SourceLoc {
        self.slab.source_loc(self.id)
    }

    pub fn as_class(self) -> Option<&'a ClassStub> {
        self.stub().as_class()
    }

    pub fn as_enum(self) -> Option<&'a EnumStub> {
        self.stub().as_enum()
    }

    pub fn as_function(self) -> Option<&'a FunctionStub> {
        self.stub().as_function()
    }

    pub fn as_property(self) -> Option<&'a PropertyStub> {
        self.stub().as_property()
    }

    pub fn as_type_decl(self) -> Option<&'a TypeDeclStub> {
        self.stub().as_type_decl()
    }

    pub fn as_type_ref(self) -> Option<&'a TypeRefStub> {
        self.stub().as_type_ref()
    }

    pub fn as_opcode(self) -> Option<&'a OpcodeStub> {
        self.stub().as_opcode()
    }

    pub fn as_function_arg(self) -> Option<&'a FunctionArgStub> {
        self.stub().as_function_arg()
    }

    /// The class that owns this stub, if it is a class member.
    pub fn owning_class(self) -> Option<StubRef<'a>> {
        let owner = self.owner()?;
        owner.as_class().map(|_| owner)
    }
}

/// Effective `(name, value)` list of an enum, with implicit options taking
/// previous + 1 starting from zero.
pub fn enum_option_values(slab: &StubSlab, enum_stub: &EnumStub) -> Vec<(Name, i64)> {
    let mut values = Vec::with_capacity(enum_stub.options.len());
    let mut next = 0i64;
    for &option_id in &enum_stub.options {
        let option = slab.get(option_id);
        let body = option.as_enum_option().unwrap();
        let value = if body.has_user_value {
            body.assigned_value
        } else {
            next
        };
        values.push((option.name, value));
        next = value + 1;
    }
    values
}

/// Member lookup on a class, searching the base-class chain after the local
/// member map.
pub fn class_find_stub(slab: &StubSlab, class_id: StubId, name: Name) -> Option<StubId> {
    let mut cursor = Some(class_id);
    while let Some(current) = cursor {
        let class = slab.get(current).as_class()?;
        if let Some(&found) = class.stub_map.get(&name) {
            return Some(found);
        }
        cursor = class.base_class;
    }
    None
}

//--- structural matching -------------------------------------------------

/// Compare two stubs (possibly from different slabs) for structural
/// compatibility. This is the check that guarantees every import sees the
/// same declaration as its export.
pub fn match_stubs(a: StubRef<'_>, b: StubRef<'_>) -> bool {
    if a.stub_type() != b.stub_type() {
        return false;
    }
    match a.stub_type() {
        StubType::Function => match_function_decl(a, b),
        StubType::Class => match_class_decl(a, b),
        StubType::Enum => match_enum_decl(a, b),
        StubType::Property => match_property_decl(a, b),
        _ => true,
    }
}

pub fn match_type_ref(a: StubRef<'_>, b: StubRef<'_>) -> bool {
    let (ra, rb) = match (a.as_type_ref(), b.as_type_ref()) {
        (Some(ra), Some(rb)) => (ra, rb),
        _ => return false,
    };
    match (ra.resolved, rb.resolved) {
        (Some(resolved_a), Some(resolved_b)) => {
            let sa = a.at(resolved_a);
            let sb = b.at(resolved_b);
            sa.stub_type() == sb.stub_type() && sa.full_name() == sb.full_name()
        }
        // Unresolved refs compare by name alone
        _ => a.name() == b.name(),
    }
}

pub fn match_type_decl(a: Option<StubRef<'_>>, b: Option<StubRef<'_>>) -> bool {
    let (a, b) = match (a, b) {
        (Some(a), Some(b)) => (a, b),
        (None, None) => return true,
        _ => return false,
    };
    let (da, db) = match (a.as_type_decl(), b.as_type_decl()) {
        (Some(da), Some(db)) => (da, db),
        _ => return false,
    };
    if da.kind != db.kind {
        return false;
    }
    match da.kind {
        TypeDeclKind::Engine => a.name() == b.name(),
        TypeDeclKind::DynamicArray => match_type_decl(
            da.inner.map(|id| a.at(id)),
            db.inner.map(|id| b.at(id)),
        ),
        TypeDeclKind::StaticArray => {
            da.array_size == db.array_size
                && match_type_decl(
                    da.inner.map(|id| a.at(id)),
                    db.inner.map(|id| b.at(id)),
                )
        }
        _ => match (da.referenced, db.referenced) {
            (Some(ref_a), Some(ref_b)) => match_type_ref(a.at(ref_a), b.at(ref_b)),
            _ => false,
        },
    }
}

fn match_function_arg(a: StubRef<'_>, b: StubRef<'_>) -> bool {
    let (aa, ab) = match (a.as_function_arg(), b.as_function_arg()) {
        (Some(aa), Some(ab)) => (aa, ab),
        _ => return false,
    };
    for flag in [StubFlags::REF, StubFlags::OUT, StubFlags::EXPLICIT] {
        if a.flags().contains(flag) != b.flags().contains(flag) {
            return false;
        }
    }
    match_type_decl(
        aa.type_decl.map(|id| a.at(id)),
        ab.type_decl.map(|id| b.at(id)),
    )
}

pub fn match_function_decl(a: StubRef<'_>, b: StubRef<'_>) -> bool {
    let (fa, fb) = match (a.as_function(), b.as_function()) {
        (Some(fa), Some(fb)) => (fa, fb),
        _ => return false,
    };
    if !match_type_decl(
        fa.return_type.map(|id| a.at(id)),
        fb.return_type.map(|id| b.at(id)),
    ) {
        return false;
    }
    if fa.args.len() != fb.args.len() {
        return false;
    }
    for flag in [
        StubFlags::STATIC,
        StubFlags::OPERATOR,
        StubFlags::CAST,
        StubFlags::FINAL,
    ] {
        if a.flags().contains(flag) != b.flags().contains(flag) {
            return false;
        }
    }
    if fa.opcode_name != fb.opcode_name {
        return false;
    }
    fa.args
        .iter()
        .zip(&fb.args)
        .all(|(&arg_a, &arg_b)| match_function_arg(a.at(arg_a), b.at(arg_b)))
}

pub fn match_enum_decl(a: StubRef<'_>, b: StubRef<'_>) -> bool {
    let (ea, eb) = match (a.as_enum(), b.as_enum()) {
        (Some(ea), Some(eb)) => (ea, eb),
        _ => return false,
    };
    if ea.engine_import_name != eb.engine_import_name {
        return false;
    }
    enum_option_values(a.slab, ea) == enum_option_values(b.slab, eb)
}

pub fn match_property_decl(a: StubRef<'_>, b: StubRef<'_>) -> bool {
    let (pa, pb) = match (a.as_property(), b.as_property()) {
        (Some(pa), Some(pb)) => (pa, pb),
        _ => return false,
    };
    if !match_type_decl(
        pa.type_decl.map(|id| a.at(id)),
        pb.type_decl.map(|id| b.at(id)),
    ) {
        return false;
    }
    for flag in [StubFlags::IMPORT, StubFlags::CONST] {
        if a.flags().contains(flag) != b.flags().contains(flag) {
            return false;
        }
    }
    true
}

pub fn match_class_decl(a: StubRef<'_>, b: StubRef<'_>) -> bool {
    let (ca, cb) = match (a.as_class(), b.as_class()) {
        (Some(ca), Some(cb)) => (ca, cb),
        _ => return false,
    };
    if a.flags().contains(StubFlags::NATIVE) != b.flags().contains(StubFlags::NATIVE) {
        return false;
    }
    if ca.engine_import_name != cb.engine_import_name
        || ca.base_class_name != cb.base_class_name
        || ca.parent_class_name != cb.parent_class_name
    {
        return false;
    }
    // Locally declared members with the same name have to agree, in both
    // directions. Members missing on one side are fine (import clones are
    // often stripped).
    let member_match = |x: StubRef<'_>, y: StubRef<'_>, members: &[StubId]| {
        members.iter().all(|&member_id| {
            let member = x.at(member_id);
            match class_find_stub(y.slab, y.id, member.name()) {
                Some(other) => match_member_stub(member, y.at(other)),
                None => true,
            }
        })
    };
    member_match(a, b, &ca.stubs) && member_match(b, a, &cb.stubs)
}

fn match_member_stub(a: StubRef<'_>, b: StubRef<'_>) -> bool {
    if a.stub_type() != b.stub_type() {
        return false;
    }
    match a.stub_type() {
        StubType::Function => match_function_decl(a, b),
        StubType::Property => match_property_decl(a, b),
        _ => true,
    }
}

//--- pruning -------------------------------------------------------------

/// Drop a module's sub-objects that are not in `used`, counting removals.
/// This is the trimming pass used when publishing an import-only pack:
/// files lose unused top-level stubs, classes lose unused members and their
/// hierarchy links, enums lose their options and functions lose their code.
pub fn prune_module(
    slab: &mut StubSlab,
    module_id: StubId,
    used: &HashSet<StubId>,
    removed: &mut u32,
) {
    let module = match slab.get(module_id).as_module() {
        Some(module) => module.clone(),
        None => return,
    };

    let mut kept_files = Vec::new();
    for file_id in module.files {
        prune_file(slab, file_id, used, removed);
        if slab.get(file_id).as_file().unwrap().stubs.is_empty() {
            log::info!(
                "Pruned file '{}' because it's not used",
                slab.get(file_id).as_file().unwrap().depot_path
            );
            *removed += 1;
        } else {
            kept_files.push(file_id);
        }
    }

    let mut kept_imports = Vec::new();
    for import_id in module.imports {
        if let Some(inner) = slab.get(import_id).as_module_import().and_then(|i| i.imported_module)
        {
            prune_module(slab, inner, used, removed);
            if slab.get(inner).as_module().unwrap().files.is_empty() {
                slab.get_mut(import_id)
                    .as_module_import_mut()
                    .unwrap()
                    .imported_module = None;
                *removed += 1;
                continue;
            }
        }
        kept_imports.push(import_id);
    }

    let module = slab.get_mut(module_id).as_module_mut().unwrap();
    module.files = kept_files;
    module.imports = kept_imports;
    module.stub_map.clear();
}

fn prune_file(slab: &mut StubSlab, file_id: StubId, used: &HashSet<StubId>, removed: &mut u32) {
    let all = slab.get(file_id).as_file().unwrap().stubs.clone();
    let mut kept = Vec::new();
    for stub_id in all {
        if used.contains(&stub_id) {
            prune_stub(slab, stub_id, used, removed);
            kept.push(stub_id);
        } else {
            *removed += 1;
        }
    }
    slab.get_mut(file_id).as_file_mut().unwrap().stubs = kept;
}

fn prune_stub(slab: &mut StubSlab, stub_id: StubId, used: &HashSet<StubId>, removed: &mut u32) {
    match slab.get(stub_id).stub_type() {
        StubType::Class => {
            let members = slab.get(stub_id).as_class().unwrap().stubs.clone();
            let mut kept = Vec::new();
            for member in members {
                if used.contains(&member) {
                    prune_stub(slab, member, used, removed);
                    kept.push(member);
                } else {
                    *removed += 1;
                }
            }
            let class = slab.get_mut(stub_id).as_class_mut().unwrap();
            class.stubs = kept;
            class.stub_map.clear();
            // Hierarchy links are relinked on load, dropped stubs must not
            // leave dangling references behind.
            class.base_class = None;
            class.derived_classes.clear();
            class.parent_class = None;
            class.child_classes.clear();
        }
        StubType::Enum => {
            let options = slab.get(stub_id).as_enum().unwrap().options.clone();
            let kept: Vec<_> = options
                .into_iter()
                .filter(|option| used.contains(option))
                .collect();
            let enum_stub = slab.get_mut(stub_id).as_enum_mut().unwrap();
            *removed += (enum_stub.options.len() - kept.len()) as u32;
            enum_stub.options = kept;
            enum_stub.options_map.clear();
        }
        StubType::Function => {
            let function = slab.get_mut(stub_id).as_function_mut().unwrap();
            *removed += function.opcodes.len() as u32;
            function.opcodes.clear();
            function.base_function = None;
            function.parent_function = None;
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_module(slab: &mut StubSlab) -> StubId {
        let module = slab.alloc(Stub::new(
            Name::new("game"),
            None,
            StubBody::Module(Default::default()),
        ));
        let file = slab.alloc(Stub::new(
            Name::none(),
            Some(module),
            StubBody::File(FileStub {
                depot_path: "game/test.bsc".into(),
                absolute_path: "/depot/game/test.bsc".into(),
                ..Default::default()
            }),
        ));
        let class = slab.alloc(Stub::new(
            Name::new("Actor"),
            Some(module),
            StubBody::Class(Default::default()),
        ));
        slab.get_mut(file).as_file_mut().unwrap().stubs.push(class);
        slab.get_mut(module).as_module_mut().unwrap().files.push(file);
        module
    }

    #[test]
    fn test_full_name() {
        let mut slab = StubSlab::new();
        let module = tiny_module(&mut slab);
        let class = slab.get(module).as_module().unwrap().files[0];
        let class = slab.get(class).as_file().unwrap().stubs[0];
        assert_eq!(slab.full_name(class), "game.Actor");
        let func = slab.alloc(Stub::new(
            Name::new("tick"),
            Some(class),
            StubBody::Function(Default::default()),
        ));
        assert_eq!(slab.full_name(func), "game.Actor.tick");
    }

    #[test]
    fn test_type_decl_canonical_names() {
        let mut slab = StubSlab::new();
        let module = tiny_module(&mut slab);
        let class = slab.get(module).as_module().unwrap().files[0];
        let class = slab.get(class).as_file().unwrap().stubs[0];
        let type_ref = slab.alloc(Stub::new(
            Name::new("Actor"),
            Some(module),
            StubBody::TypeRef(TypeRefStub {
                resolved: Some(class),
            }),
        ));
        let ptr_decl = slab.alloc(Stub::new(
            Name::none(),
            Some(module),
            StubBody::TypeDecl(TypeDeclStub {
                kind: TypeDeclKind::PtrType,
                referenced: Some(type_ref),
                ..Default::default()
            }),
        ));
        assert_eq!(slab.type_decl_name(ptr_decl), "ptr<game.Actor>");

        let array_decl = slab.alloc(Stub::new(
            Name::none(),
            Some(module),
            StubBody::TypeDecl(TypeDeclStub {
                kind: TypeDeclKind::StaticArray,
                inner: Some(ptr_decl),
                array_size: 4,
                ..Default::default()
            }),
        ));
        assert_eq!(slab.type_decl_name(array_decl), "ptr<game.Actor>[4]");
    }

    #[test]
    fn test_enum_option_values() {
        let mut slab = StubSlab::new();
        let enum_id = slab.alloc(Stub::new(
            Name::new("E"),
            None,
            StubBody::Enum(Default::default()),
        ));
        let mut push_option = |slab: &mut StubSlab, name: &str, value: Option<i64>| {
            let option = slab.alloc(Stub::new(
                Name::new(name),
                Some(enum_id),
                StubBody::EnumOption(EnumOptionStub {
                    assigned_value: value.unwrap_or(0),
                    has_user_value: value.is_some(),
                }),
            ));
            slab.get_mut(enum_id).as_enum_mut().unwrap().options.push(option);
        };
        push_option(&mut slab, "A", None);
        push_option(&mut slab, "B", Some(10));
        push_option(&mut slab, "C", None);

        let enum_stub = slab.get(enum_id).as_enum().unwrap();
        let values = enum_option_values(&slab, enum_stub);
        assert_eq!(
            values,
            vec![
                (Name::new("A"), 0),
                (Name::new("B"), 10),
                (Name::new("C"), 11),
            ]
        );
    }
}
