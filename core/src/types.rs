//! Host-side type model. Every type the runtime can store a value of is a
//! [TypeDef] owned by the registry and addressed by a dense 16-bit
//! [TypeId]; functions likewise get a [FuncId]. Those ids are what the
//! compiled byte stream and the emitted C code embed, so both tables are
//! capped at 65536 entries.

use crate::name::Name;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Dense id of a host type. Index into the registry's type table.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TypeId(pub u16);

/// Dense id of a host function. Index into the registry's function table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FuncId(pub u16);

/// Shape category of a host type.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetaKind {
    Void,
    /// Plain value: numerics, bool, name, string and other opaque engine
    /// values
    Simple,
    Enum,
    /// Class or struct; [ClassInfo] tells which
    Class,
    /// `class<T>` reference to a class type object
    ClassRef,
    StrongHandle,
    WeakHandle,
    DynamicArray,
    StaticArray,
}

/// Construction and copying behavior of a type.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeTraits {
    pub requires_ctor: bool,
    pub requires_dtor: bool,
    /// Values can be moved and compared as raw bytes
    pub simple_copy: bool,
    /// All-zero memory is a validly constructed value
    pub zero_init: bool,
}

impl TypeTraits {
    /// Plain old data: no construction, byte copy, zero is valid.
    pub fn plain() -> TypeTraits {
        TypeTraits {
            requires_ctor: false,
            requires_dtor: false,
            simple_copy: true,
            zero_init: true,
        }
    }
}

/// Value operations for `Simple` types that are not plain bytes. The
/// pointers address properly aligned storage of the type's size.
#[derive(Copy, Clone)]
pub struct SimpleOps {
    pub ctor: unsafe fn(*mut u8),
    pub dtor: unsafe fn(*mut u8),
    pub copy: unsafe fn(*mut u8, *const u8),
    pub compare: unsafe fn(*const u8, *const u8) -> bool,
}

impl std::fmt::Debug for SimpleOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SimpleOps")
    }
}

bitflags::bitflags! {
    /// Flags on a class property, translated from stub flags when the
    /// linker creates exports.
    pub struct PropFlags: u8 {
        const SCRIPTED        = 1 << 0;
        const EDITABLE        = 1 << 1;
        const INLINED         = 1 << 2;
        const READ_ONLY       = 1 << 3;
        /// The property lives in the object's out-of-line scripted buffer
        const EXTERNAL_BUFFER = 1 << 4;
    }
}

impl Default for PropFlags {
    fn default() -> PropFlags {
        PropFlags::empty()
    }
}

/// A member variable of a class or struct.
#[derive(Clone, Debug)]
pub struct Property {
    pub name: Name,
    pub ty: TypeId,
    pub offset: u32,
    pub flags: PropFlags,
}

/// Class-specific data of a [TypeDef].
#[derive(Clone, Debug, Default)]
pub struct ClassInfo {
    /// Value type without an object header; otherwise a reference type
    pub is_struct: bool,
    pub is_abstract: bool,
    pub base: Option<TypeId>,
    /// True for types backed by engine code rather than scripts
    pub native: bool,
    /// Locally declared members; inherited ones live on the base
    pub props: Vec<Property>,
    /// Locally declared functions, including `__ctor`/`__dtor`
    pub functions: HashMap<Name, FuncId>,
    /// Scripted constructor/destructor bound by the linker for the
    /// runtime to invoke around object lifetime
    pub ctor: Option<FuncId>,
    pub dtor: Option<FuncId>,
    /// Size and alignment of the scripted data: the whole value for
    /// structs, the external property buffer for classes
    pub scripted_size: u32,
    pub scripted_align: u32,
}

/// Enum-specific data of a [TypeDef].
#[derive(Clone, Debug, Default)]
pub struct EnumInfo {
    /// Storage width in bytes: 1, 2, 4 or 8
    pub size: u8,
    pub signed: bool,
    pub options: Vec<(Name, i64)>,
}

impl EnumInfo {
    pub fn find_value(&self, name: Name) -> Option<i64> {
        self.options
            .iter()
            .find(|(option, _)| *option == name)
            .map(|&(_, value)| value)
    }

    pub fn find_name(&self, value: i64) -> Option<Name> {
        self.options
            .iter()
            .find(|&&(_, option)| option == value)
            .map(|&(name, _)| name)
    }

    pub fn min_value(&self) -> i64 {
        self.options.iter().map(|&(_, v)| v).min().unwrap_or(0)
    }
}

/// One host type. Owned by the registry for the whole process lifetime;
/// the address-stable id is what everything else refers to.
#[derive(Clone, Debug)]
pub struct TypeDef {
    pub name: Name,
    pub kind: MetaKind,
    pub size: u32,
    pub align: u32,
    pub traits: TypeTraits,
    pub ops: Option<SimpleOps>,
    /// Element type for arrays, pointed-to class for handles and class
    /// refs
    pub inner: Option<TypeId>,
    /// Element count for static arrays
    pub array_len: u32,
    /// Created from scripts (survives reloads with cleared content)
    pub scripted: bool,
    pub class: Option<ClassInfo>,
    pub enum_info: Option<EnumInfo>,
}

impl TypeDef {
    /// A plain-bytes value type of the given size.
    pub fn plain(name: Name, size: u32, align: u32) -> TypeDef {
        TypeDef {
            name,
            kind: MetaKind::Simple,
            size,
            align,
            traits: TypeTraits::plain(),
            ops: None,
            inner: None,
            array_len: 0,
            scripted: false,
            class: None,
            enum_info: None,
        }
    }

    pub fn class_info(&self) -> Option<&ClassInfo> {
        self.class.as_ref()
    }

    pub fn is_struct(&self) -> bool {
        self.class.as_ref().map(|c| c.is_struct).unwrap_or(false)
    }
}

bitflags::bitflags! {
    /// How a function parameter travels in a call.
    pub struct ParamFlags: u8 {
        /// Passed by reference
        const REF   = 1 << 0;
        /// Reference the callee must not write through
        const CONST = 1 << 1;
    }
}

impl Default for ParamFlags {
    fn default() -> ParamFlags {
        ParamFlags::empty()
    }
}

/// Declared type of one function parameter or return value.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ParamType {
    pub ty: TypeId,
    pub flags: ParamFlags,
}

impl ParamType {
    pub fn value(ty: TypeId) -> ParamType {
        ParamType {
            ty,
            flags: ParamFlags::empty(),
        }
    }

    pub fn reference(ty: TypeId) -> ParamType {
        ParamType {
            ty,
            flags: ParamFlags::REF,
        }
    }
}
