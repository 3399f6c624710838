//! All error types of the runtime, one enum per failure domain, plus the
//! location-annotated wrappers the linker and loader report through.
//!
//! Format and link errors abort the whole load; translation errors abort a
//! single function (the interpreter stays available for it); runtime faults
//! are routed through the host's exception hook at execution time.

use crate::opcodes::Opcode;
use serde::Serialize;
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// Where in the scripted sources a diagnostic points. Stubs carry a file
/// path and line, not a text span, so this is what we can render.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SourceLoc {
    pub file: String,
    pub line: u32,
}

impl SourceLoc {
    pub fn new(file: impl Into<String>, line: u32) -> SourceLoc {
        SourceLoc {
            file: file.into(),
            line,
        }
    }

    pub fn unknown() -> SourceLoc {
        SourceLoc::default()
    }
}

impl Display for SourceLoc {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.file.is_empty() {
            f.write_str("unknown location")
        } else {
            write!(f, "{}({})", self.file, self.line)
        }
    }
}

/// An error paired with the source location it was reported against.
/// Renders as `path(line): error: message`, the shape host tooling expects.
#[derive(Clone, Debug, Error, Serialize)]
pub struct Located<E: Display + fmt::Debug + Serialize> {
    pub error: E,
    pub location: SourceLoc,
}

impl<E: Display + fmt::Debug + Serialize> Located<E> {
    pub fn new(error: E, location: SourceLoc) -> Located<E> {
        Located { error, location }
    }
}

impl<E: Display + fmt::Debug + Serialize> Display for Located<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}: error: {}", self.location, self.error)
    }
}

/// Corrupt packed module data. Any of these aborts the current load at the
/// offset it was detected.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize)]
pub enum FormatError {
    /// Read past the end of the packed buffer
    #[error("out of bound read at offset {offset}")]
    UnexpectedEnd { offset: usize },
    /// A stub tag byte that is not a known `StubType`
    #[error("unknown stub type tag {0}")]
    BadStubType(u8),
    /// A name/string/stub reference outside its table
    #[error("invalid {kind} index {index} (table holds {len})")]
    BadIndex {
        kind: &'static str,
        index: u32,
        len: u32,
    },
    /// References are 16-bit on the wire, so a module cannot carry more
    /// stubs than that
    #[error("module has {0} stubs, more than the packed format can reference")]
    TooManyStubs(usize),
    /// Interned text that is not valid UTF-8
    #[error("malformed string data at offset {offset}")]
    BadString { offset: usize },
    /// An opcode id that is not a known `Opcode`
    #[error("unknown opcode id {0}")]
    BadOpcode(u16),
}

/// Symbol resolution and verification failures. The linker collects all of
/// them before failing, so one bad module reports every problem at once.
#[derive(Clone, Debug, Error, Serialize)]
pub enum LinkError {
    #[error("symbol '{name}' was previously declared as a different kind at {previous}")]
    SymbolKindMismatch { name: String, previous: SourceLoc },
    #[error("symbol '{name}' already exported from {previous}")]
    DuplicateExport { name: String, previous: SourceLoc },
    #[error("mismatched definition of '{name}', see previous definition at {previous}")]
    MismatchedDeclaration { name: String, previous: SourceLoc },
    #[error("unable to find declaration of class '{class}' owning '{name}'")]
    MissingOwnerClass { class: String, name: String },
    #[error("'{name}' is already defined as a native {kind} and cannot be redeclared in scripts")]
    AliasesNativeSymbol { name: String, kind: &'static str },
    #[error("engine type '{0}' not found")]
    MissingEngineType(String),
    #[error("class '{name}' references missing engine class '{import}'")]
    MissingEngineClass { name: String, import: String },
    #[error("enum '{name}' references missing engine enum '{import}'")]
    MissingEngineEnum { name: String, import: String },
    #[error("imported class '{0}' has no engine import name")]
    NoEngineImportName(String),
    #[error("missing enum option '{option}' in engine enum '{import}'")]
    MissingEnumOption { option: String, import: String },
    #[error("property '{name}' is not defined in engine class '{class}'")]
    MissingEngineProperty { name: String, class: String },
    #[error("type of property '{name}' is not compatible with engine type '{engine}'")]
    PropertyTypeMismatch { name: String, engine: String },
    #[error("missing engine function '{0}'")]
    MissingEngineFunction(String),
    #[error("function '{name}' has a different engine signature: {detail}")]
    SignatureMismatch { name: String, detail: String },
    #[error("unresolved import '{0}'")]
    UnresolvedImport(String),
    #[error("class '{name}' has no non-abstract native base deriving from the scripted root")]
    NoNativeBase { name: String },
    #[error("type reference in '{0}' does not resolve to a linked symbol")]
    UnresolvedTypeRef(String),
    #[error("duplicate scripted {kind} '{name}'")]
    DuplicateScriptedEntity { kind: &'static str, name: String },
    #[error("failed to generate code for function '{name}': {inner}")]
    CodeGeneration { name: String, inner: TranslateError },
}

/// Errors lowering portable opcodes, either into the interpreter byte
/// stream or into C. Localized to the offending function.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize)]
pub enum TranslateError {
    #[error("unsupported opcode '{}'", .0.name())]
    UnsupportedOpcode(Opcode),
    #[error("jump distance {0} does not fit in 16 bits, function must be split")]
    JumpOutOfRange(i64),
    #[error("unresolved jump target")]
    UnresolvedJumpTarget,
    #[error("opcode references a stub that did not resolve to a host entity")]
    UnresolvedReference,
    #[error("call has {0} arguments, more than the calling encoding can carry")]
    TooManyCallArgs(usize),
    #[error("local variable storage exceeds the 16-bit offset range")]
    LocalStorageOverflow,
}

/// A fault raised while a frame is executing. These are reported through
/// the host exception hook; the interpreter itself never panics on them.
#[derive(Copy, Clone, Debug, Error, PartialEq, Eq, Serialize)]
pub enum RuntimeFault {
    #[error("accessing null pointer")]
    NullPointer,
    #[error("division by zero")]
    DivisionByZero,
    #[error("invalid dynamic cast")]
    BadCast,
    #[error("executed an opcode with no runtime semantics")]
    UnimplementedOpcode,
    #[error("no value for enum option name")]
    UnknownEnumOption,
}

/// AOT build problems outside the emitted code itself: staging files,
/// launching the compiler, loading the produced module. The interpreter
/// path remains available after any of these.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("failed to stage generated source: {0}")]
    Stage(#[from] std::io::Error),
    #[error("no usable C compiler found")]
    NoCompiler,
    #[error("compiler '{compiler}' exited with status {status}")]
    CompilerFailed { compiler: String, status: i32 },
    #[error("compiler produced no output module")]
    NoOutput,
    #[error("failed to load compiled module: {0}")]
    Load(String),
    #[error("module init symbol '{0}' missing")]
    MissingInit(String),
    #[error(transparent)]
    Translate(#[from] TranslateError),
}

/// Collected link diagnostics. A load either commits cleanly or hands back
/// one of these with everything that went wrong.
#[derive(Clone, Debug, Default, Error, Serialize)]
pub struct Diagnostics {
    pub errors: Vec<Located<LinkError>>,
    pub warnings: Vec<Located<LinkError>>,
}

impl Diagnostics {
    pub fn new() -> Diagnostics {
        Diagnostics::default()
    }

    pub fn error(&mut self, error: LinkError, location: SourceLoc) {
        self.errors.push(Located::new(error, location));
    }

    pub fn warn(&mut self, error: LinkError, location: SourceLoc) {
        self.warnings.push(Located::new(error, location));
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

impl Display for Diagnostics {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (i, error) in self.errors.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", error)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_located_rendering() {
        let err = Located::new(
            LinkError::UnresolvedImport("Foo.bar".into()),
            SourceLoc::new("game/foo.bsc", 12),
        );
        assert_eq!(
            err.to_string(),
            "game/foo.bsc(12): error: unresolved import 'Foo.bar'"
        );
    }

    #[test]
    fn test_unknown_location() {
        assert_eq!(SourceLoc::unknown().to_string(), "unknown location");
    }
}
