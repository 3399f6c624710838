//! The portable opcode set. One enumerator per operation the compiler can
//! emit; the byte-stream builder narrows some of these (enum conversions,
//! typed equality) to width-specialized forms, so not every enumerator can
//! appear in a finished code block.
//!
//! The list is declared once through [`opcodes!`] which also generates the
//! name table used by the disassembler and by name lookup.

use crate::name::Name;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;
use std::fmt::{self, Display, Formatter};

macro_rules! opcodes {
    ($($op:ident,)+) => {
        /// Portable opcode enumerator. The numeric value is the wire id in
        /// both the stub serialization and the compiled byte stream.
        #[derive(
            Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize,
            IntoPrimitive, TryFromPrimitive,
        )]
        #[repr(u16)]
        pub enum Opcode {
            $($op,)+
        }

        impl Opcode {
            /// Number of defined opcodes.
            pub const COUNT: usize = [$(Opcode::$op,)+].len();

            /// The enumerator's declared name.
            pub fn name(self) -> &'static str {
                match self {
                    $(Opcode::$op => stringify!($op),)+
                }
            }

            /// Find an opcode by its declared name. Used by tooling and by
            /// functions implemented directly as opcode aliases.
            pub fn from_name(name: &str) -> Option<Opcode> {
                match name {
                    $(stringify!($op) => Some(Opcode::$op),)+
                    _ => None,
                }
            }
        }
    };
}

opcodes! {
    // control
    Nop,
    Breakpoint,
    Label,
    Exit,
    Jump,
    JumpIfFalse,

    // constants
    Null,
    BoolTrue,
    BoolFalse,
    IntOne,
    IntZero,
    IntConst1,
    IntConst2,
    IntConst4,
    IntConst8,
    UintConst1,
    UintConst2,
    UintConst4,
    UintConst8,
    FloatConst,
    DoubleConst,
    NameConst,
    StringConst,
    EnumConst,
    ClassConst,

    // integer width conversions
    ExpandSigned8To16,
    ExpandSigned8To32,
    ExpandSigned8To64,
    ExpandSigned16To32,
    ExpandSigned16To64,
    ExpandSigned32To64,
    ExpandUnsigned8To16,
    ExpandUnsigned8To32,
    ExpandUnsigned8To64,
    ExpandUnsigned16To32,
    ExpandUnsigned16To64,
    ExpandUnsigned32To64,
    Contract64To32,
    Contract64To16,
    Contract64To8,
    Contract32To16,
    Contract32To8,
    Contract16To8,

    // float conversions
    FloatToInt8,
    FloatToInt16,
    FloatToInt32,
    FloatToInt64,
    FloatToUint8,
    FloatToUint16,
    FloatToUint32,
    FloatToUint64,
    FloatFromInt8,
    FloatFromInt16,
    FloatFromInt32,
    FloatFromInt64,
    FloatFromUint8,
    FloatFromUint16,
    FloatFromUint32,
    FloatFromUint64,
    FloatToDouble,
    FloatFromDouble,
    DoubleToInt8,
    DoubleToInt16,
    DoubleToInt32,
    DoubleToInt64,
    DoubleToUint8,
    DoubleToUint16,
    DoubleToUint32,
    DoubleToUint64,
    DoubleFromInt8,
    DoubleFromInt16,
    DoubleFromInt32,
    DoubleFromInt64,
    DoubleFromUint8,
    DoubleFromUint16,
    DoubleFromUint32,
    DoubleFromUint64,

    // conversions to bool and between reference kinds
    NumberToBool8,
    NumberToBool16,
    NumberToBool32,
    NumberToBool64,
    FloatToBool,
    DoubleToBool,
    NameToBool,
    ClassToBool,
    ClassToName,
    ClassToString,
    WeakToStrong,
    WeakToBool,
    StrongToWeak,
    StrongToBool,
    EnumToInt32,
    EnumToInt64,
    EnumToName,
    EnumToString,
    Int32ToEnum,
    Int64ToEnum,
    NameToEnum,
    Passthrough,

    // arithmetic
    AddInt8,
    AddInt16,
    AddInt32,
    AddInt64,
    SubInt8,
    SubInt16,
    SubInt32,
    SubInt64,
    MulSigned8,
    MulSigned16,
    MulSigned32,
    MulSigned64,
    MulUnsigned8,
    MulUnsigned16,
    MulUnsigned32,
    MulUnsigned64,
    DivSigned8,
    DivSigned16,
    DivSigned32,
    DivSigned64,
    DivUnsigned8,
    DivUnsigned16,
    DivUnsigned32,
    DivUnsigned64,
    ModSigned8,
    ModSigned16,
    ModSigned32,
    ModSigned64,
    ModUnsigned8,
    ModUnsigned16,
    ModUnsigned32,
    ModUnsigned64,
    NegSigned8,
    NegSigned16,
    NegSigned32,
    NegSigned64,
    NegFloat,
    NegDouble,
    AddFloat,
    SubFloat,
    MulFloat,
    DivFloat,
    ModFloat,
    AddDouble,
    SubDouble,
    MulDouble,
    DivDouble,
    ModDouble,

    // min/max/clamp/abs/sign
    MinSigned8,
    MinSigned16,
    MinSigned32,
    MinSigned64,
    MinUnsigned8,
    MinUnsigned16,
    MinUnsigned32,
    MinUnsigned64,
    MinFloat,
    MinDouble,
    MaxSigned8,
    MaxSigned16,
    MaxSigned32,
    MaxSigned64,
    MaxUnsigned8,
    MaxUnsigned16,
    MaxUnsigned32,
    MaxUnsigned64,
    MaxFloat,
    MaxDouble,
    ClampSigned8,
    ClampSigned16,
    ClampSigned32,
    ClampSigned64,
    ClampUnsigned8,
    ClampUnsigned16,
    ClampUnsigned32,
    ClampUnsigned64,
    ClampFloat,
    ClampDouble,
    Abs8,
    Abs16,
    Abs32,
    Abs64,
    AbsFloat,
    AbsDouble,
    Sign8,
    Sign16,
    Sign32,
    Sign64,
    SignFloat,
    SignDouble,

    // increments, on an address expression
    PreIncrement8,
    PreIncrement16,
    PreIncrement32,
    PreIncrement64,
    PreDecrement8,
    PreDecrement16,
    PreDecrement32,
    PreDecrement64,
    PostIncrement8,
    PostIncrement16,
    PostIncrement32,
    PostIncrement64,
    PostDecrement8,
    PostDecrement16,
    PostDecrement32,
    PostDecrement64,

    // bitwise
    BitAnd8,
    BitAnd16,
    BitAnd32,
    BitAnd64,
    BitOr8,
    BitOr16,
    BitOr32,
    BitOr64,
    BitXor8,
    BitXor16,
    BitXor32,
    BitXor64,
    BitNot8,
    BitNot16,
    BitNot32,
    BitNot64,
    BitShl8,
    BitShl16,
    BitShl32,
    BitShl64,
    BitShr8,
    BitShr16,
    BitShr32,
    BitShr64,
    BitSar8,
    BitSar16,
    BitSar32,
    BitSar64,

    // compound assignment
    AddAssignInt8,
    AddAssignInt16,
    AddAssignInt32,
    AddAssignInt64,
    SubAssignInt8,
    SubAssignInt16,
    SubAssignInt32,
    SubAssignInt64,
    MulAssignSignedInt8,
    MulAssignSignedInt16,
    MulAssignSignedInt32,
    MulAssignSignedInt64,
    DivAssignSignedInt8,
    DivAssignSignedInt16,
    DivAssignSignedInt32,
    DivAssignSignedInt64,
    MulAssignUnsignedInt8,
    MulAssignUnsignedInt16,
    MulAssignUnsignedInt32,
    MulAssignUnsignedInt64,
    DivAssignUnsignedInt8,
    DivAssignUnsignedInt16,
    DivAssignUnsignedInt32,
    DivAssignUnsignedInt64,
    AddAssignFloat,
    SubAssignFloat,
    MulAssignFloat,
    DivAssignFloat,
    AddAssignDouble,
    SubAssignDouble,
    MulAssignDouble,
    DivAssignDouble,
    BitAndAssign8,
    BitAndAssign16,
    BitAndAssign32,
    BitAndAssign64,
    BitOrAssign8,
    BitOrAssign16,
    BitOrAssign32,
    BitOrAssign64,
    BitXorAssign8,
    BitXorAssign16,
    BitXorAssign32,
    BitXorAssign64,
    BitShlAssign8,
    BitShlAssign16,
    BitShlAssign32,
    BitShlAssign64,
    BitShrAssign8,
    BitShrAssign16,
    BitShrAssign32,
    BitShrAssign64,
    BitSarAssign8,
    BitSarAssign16,
    BitSarAssign32,
    BitSarAssign64,

    // logical
    LogicNot,
    LogicXor,
    LogicAnd,
    LogicOr,

    // comparisons, suffixed by operand byte size
    TestEqual1,
    TestEqual2,
    TestEqual4,
    TestEqual8,
    TestNotEqual1,
    TestNotEqual2,
    TestNotEqual4,
    TestNotEqual8,
    TestSignedLess1,
    TestSignedLess2,
    TestSignedLess4,
    TestSignedLess8,
    TestSignedLessEqual1,
    TestSignedLessEqual2,
    TestSignedLessEqual4,
    TestSignedLessEqual8,
    TestSignedGreater1,
    TestSignedGreater2,
    TestSignedGreater4,
    TestSignedGreater8,
    TestSignedGreaterEqual1,
    TestSignedGreaterEqual2,
    TestSignedGreaterEqual4,
    TestSignedGreaterEqual8,
    TestUnsignedLess1,
    TestUnsignedLess2,
    TestUnsignedLess4,
    TestUnsignedLess8,
    TestUnsignedLessEqual1,
    TestUnsignedLessEqual2,
    TestUnsignedLessEqual4,
    TestUnsignedLessEqual8,
    TestUnsignedGreater1,
    TestUnsignedGreater2,
    TestUnsignedGreater4,
    TestUnsignedGreater8,
    TestUnsignedGreaterEqual1,
    TestUnsignedGreaterEqual2,
    TestUnsignedGreaterEqual4,
    TestUnsignedGreaterEqual8,
    TestFloatEqual4,
    TestFloatEqual8,
    TestFloatNotEqual4,
    TestFloatNotEqual8,
    TestFloatLess4,
    TestFloatLess8,
    TestFloatLessEqual4,
    TestFloatLessEqual8,
    TestFloatGreater4,
    TestFloatGreater8,
    TestFloatGreaterEqual4,
    TestFloatGreaterEqual8,
    TestEqual,
    TestNotEqual,

    // assignment
    AssignInt1,
    AssignInt2,
    AssignInt4,
    AssignInt8,
    AssignUint1,
    AssignUint2,
    AssignUint4,
    AssignUint8,
    AssignFloat,
    AssignDouble,
    AssignAny,

    // memory and variables
    LocalVar,
    LocalCtor,
    LocalDtor,
    ContextVar,
    ContextCtor,
    ContextDtor,
    ContextExternalVar,
    ContextExternalCtor,
    ContextExternalDtor,
    ParamVar,
    StructMember,
    StructMemberRef,
    ThisObject,
    ThisStruct,

    // loads, address expression to value
    LoadInt1,
    LoadInt2,
    LoadInt4,
    LoadInt8,
    LoadUint1,
    LoadUint2,
    LoadUint4,
    LoadUint8,
    LoadFloat,
    LoadDouble,
    LoadStrongPtr,
    LoadWeakPtr,
    LoadAny,

    // returns
    ReturnLoad1,
    ReturnLoad2,
    ReturnLoad4,
    ReturnLoad8,
    ReturnDirect,
    ReturnAny,

    // context shifting
    ContextFromValue,
    ContextFromRef,
    ContextFromPtr,
    ContextFromPtrRef,

    // object lifecycle
    New,
    Constructor,
    DynamicCast,
    DynamicWeakCast,
    MetaCast,

    // function calls
    StaticFunc,
    FinalFunc,
    VirtualFunc,
    InternalFunc,

    // reserved enumerators, no handlers are provided for these
    Switch,
    SwitchLabel,
    SwitchDefault,
    Conditional,
    CastToVariant,
    CastFromVariant,
    VariantIsValid,
    VariantIsPointer,
    VariantIsArray,
    VariantGetType,
    VariantToString,
}

impl Display for Opcode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Default for Opcode {
    fn default() -> Opcode {
        Opcode::Nop
    }
}

/// Immediate value attached to a portable opcode. Only the variants an
/// opcode actually serializes survive the round trip; everything else packs
/// as [Immediate::None].
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub enum Immediate {
    #[default]
    None,
    Int(i64),
    Uint(u64),
    Float(f32),
    Double(f64),
    Name(Name),
    Text(String),
    /// Local variable reference: declared name plus the compiler-assigned
    /// portable slot index
    NamedSlot { name: Name, index: u16 },
}

impl Immediate {
    pub fn as_int(&self) -> i64 {
        match *self {
            Immediate::Int(v) => v,
            Immediate::Uint(v) => v as i64,
            _ => 0,
        }
    }

    pub fn as_uint(&self) -> u64 {
        match *self {
            Immediate::Int(v) => v as u64,
            Immediate::Uint(v) => v,
            _ => 0,
        }
    }

    pub fn as_name(&self) -> Name {
        match *self {
            Immediate::Name(name) => name,
            Immediate::NamedSlot { name, .. } => name,
            _ => Name::none(),
        }
    }
}

impl Display for Immediate {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Immediate::None => Ok(()),
            Immediate::Int(v) => write!(f, "{}", v),
            Immediate::Uint(v) => write!(f, "{}", v),
            Immediate::Float(v) => write!(f, "{}", v),
            Immediate::Double(v) => write!(f, "{}", v),
            Immediate::Name(v) => write!(f, "'{}'", v),
            Immediate::Text(v) => write!(f, "{:?}", v),
            Immediate::NamedSlot { name, index } => write!(f, "'{}' #{}", name, index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryFrom;

    #[test]
    fn test_roundtrip_ids() {
        for id in 0..Opcode::COUNT as u16 {
            let op = Opcode::try_from(id).unwrap();
            assert_eq!(u16::from(op), id);
        }
        assert!(Opcode::try_from(Opcode::COUNT as u16).is_err());
    }

    #[test]
    fn test_name_lookup() {
        assert_eq!(Opcode::from_name("AddInt32"), Some(Opcode::AddInt32));
        assert_eq!(Opcode::from_name("TestEqual4"), Some(Opcode::TestEqual4));
        assert_eq!(Opcode::from_name("NotAnOpcode"), None);
        assert_eq!(Opcode::JumpIfFalse.name(), "JumpIfFalse");
    }
}
