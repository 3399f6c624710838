//! Whole-module translation and the native compiler invocation. The
//! emitted file is self-contained C: an embedded prologue with the engine
//! interface and fixed-width types, struct shapes from type insight,
//! interned constants, call forwarders, one function body per scripted
//! function (a generic wrapper, plus a direct wrapper when every argument
//! travels as a pointer or simple scalar), and the module-init function
//! the loader calls after `dlopen`.

use super::{
    consts::JitConstCache,
    typelib::JitTypeLib,
    writer::FuncWriter,
};
use crate::{
    error::BuildError,
    insight::TypeInsight,
    portable::PortableData,
    stub::{StubFlags, StubId, StubSlab},
};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Embedded prologue of every emitted module. Matches the `#[repr(C)]`
/// vtables on the Rust side field for field; the module is built with
/// `-nostdlib`, so the few library routines the code uses are defined
/// here.
const PROLOG: &str = r#"/* generated by scriptvm, do not edit */
typedef signed char int8_t;
typedef unsigned char uint8_t;
typedef short int16_t;
typedef unsigned short uint16_t;
typedef int int32_t;
typedef unsigned int uint32_t;
typedef long long int64_t;
typedef unsigned long long uint64_t;

typedef uint32_t StringID;
typedef struct { void* dataPtr; } StrongHandle;
typedef struct { void* dataPtr; } WeakHandle;
typedef struct { uint32_t classId; } ClassRef;
typedef struct { uint64_t _data[3]; } EngineString;

struct FunctionCallingParams {
    void* _returnPtr;
    void* _argPtr[16];
};

typedef void (*TJitFunc)(void* context, void* stackFrame, struct FunctionCallingParams* params);

struct EngineToJIT {
    void* self;
    void (*_fnLog)(void* self, const char* txt);
    void (*_fnThrowException)(void* self, void* frame, const char* file, int line, const char* txt);
    void (*_fnTypeCtor)(void* self, int typeId, void* data);
    void (*_fnTypeDtor)(void* self, int typeId, void* data);
    void (*_fnTypeCopy)(void* self, int typeId, void* dest, void* src);
    int (*_fnTypeCompare)(void* self, int typeId, void* a, void* b);
    void (*_fnCall)(void* self, void* context, int funcId, int mode, void* parentFrame, struct FunctionCallingParams* params);
    void (*_fnNew)(void* self, void* parentFrame, int classId, void* strongPtr);
    int (*_fnWeakToBool)(void* self, void* weakPtr);
    void (*_fnWeakToStrong)(void* self, void* weakPtr, void* strongPtr);
    void (*_fnStrongToWeak)(void* self, void* strongPtr, void* weakPtr);
    void (*_fnStrongFromPtr)(void* self, void* ptr, void* strongPtr);
    StringID (*_fnEnumToName)(void* self, int typeId, int64_t enumValue);
    int64_t (*_fnNameToEnum)(void* self, void* parentFrame, int typeId, StringID enumName);
    void (*_fnDynamicStrongCast)(void* self, int classId, void* inStrongPtr, void* outStrongPtr);
    void (*_fnDynamicWeakCast)(void* self, int classId, void* inWeakPtr, void* outWeakPtr);
    uint32_t (*_fnMetaCast)(void* self, int classId, uint32_t inClass);
    StringID (*_fnClassToName)(void* self, uint32_t classId);
    void (*_fnClassToString)(void* self, uint32_t classId, void* outString);
};

struct JITInit {
    void* self;
    void (*_fnReportImportCounts)(void* self, int maxTypeId, int maxFuncId);
    void (*_fnReportImportType)(void* self, int typeId, const char* name);
    void (*_fnReportImportFunction)(void* self, int funcId, const char* className, const char* funcName);
    void (*_fnReportExportFunction)(void* self, const char* className, const char* funcName, uint64_t codeHash, TJitFunc funcPtr);
    void (*_fnInitStringConst)(void* self, void* str, const char* data);
    void (*_fnInitNameConst)(void* self, void* str, const char* data);
    void (*_fnInitTypeConst)(void* self, void* str, const char* data);
};

static struct EngineToJIT* EI;
static StrongHandle __strong_null;

#define CTOR(id, ptr) EI->_fnTypeCtor(EI->self, id, (void*)(ptr))
#define DTOR(id, ptr) EI->_fnTypeDtor(EI->self, id, (void*)(ptr))
#define COPY(id, dst, src) EI->_fnTypeCopy(EI->self, id, (void*)(dst), (void*)(src))
#define COMPARE(id, a, b) EI->_fnTypeCompare(EI->self, id, (void*)(a), (void*)(b))
#define ERROR(file, line, msg) EI->_fnThrowException(EI->self, 0, file, line, msg)
#define ExternalPtr(x) (*(void**)(x))
#define STRONG_NULL (__strong_null)

static void* memset(void* dst, int value, unsigned long count) {
    unsigned char* p = (unsigned char*)dst;
    while (count--) *p++ = (unsigned char)value;
    return dst;
}
static float fmodf(float a, float b) { return a - b * (float)(int64_t)(a / b); }
static double fmod(double a, double b) { return a - b * (double)(int64_t)(a / b); }

"#;

/// Knobs of one translation run, mirroring what the build pipeline can
/// toggle.
#[derive(Clone, Copy, Debug, Default)]
pub struct TranslateSettings {
    /// Emit debug symbols when compiling
    pub emit_symbols: bool,
    /// Emit null-pointer (and friends) checks that report through the
    /// exception callback
    pub emit_exceptions: bool,
}

/// One exported function of an emitted module.
#[derive(Clone, Debug)]
pub struct JitExport {
    pub class_name: Option<String>,
    pub name: String,
    pub code_hash: u64,
}

/// The result of translating a module: the C source plus what it exports
/// and which functions had to stay on the interpreter.
#[derive(Debug)]
pub struct JitSource {
    code: String,
    exports: Vec<JitExport>,
    skipped: Vec<(String, String)>,
}

impl JitSource {
    pub fn source(&self) -> &str {
        &self.code
    }

    pub fn exports(&self) -> &[JitExport] {
        &self.exports
    }

    /// Functions that failed translation, with the reason; the
    /// interpreter keeps serving them.
    pub fn skipped(&self) -> &[(String, String)] {
        &self.skipped
    }

    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        std::fs::write(path, &self.code)
    }
}

struct Candidate {
    stub: StubId,
    jit_name: String,
    local_name: Option<String>,
    class_name: Option<String>,
    name: String,
    code_hash: u64,
    code: String,
}

/// Translate every exported function of a module to C.
pub fn translate_module(
    data: &PortableData,
    insight: &dyn TypeInsight,
    settings: &TranslateSettings,
) -> Result<JitSource, BuildError> {
    let slab = data.slab();
    let mut types = JitTypeLib::new(insight);
    let mut consts = JitConstCache::new();
    let mut candidates = Vec::new();
    let mut skipped = Vec::new();

    for &stub_id in data.all_stubs() {
        let stub = slab.get(stub_id);
        let func = match stub.as_function() {
            Some(func) => func,
            None => continue,
        };
        // Imported functions run elsewhere; opcode aliases have no body
        if stub.is_import() || func.opcodes.is_empty() {
            continue;
        }

        let index = candidates.len();
        let full_name = slab.full_name(stub_id);
        let class_name = stub
            .owner
            .and_then(|owner| slab.get(owner).as_class().map(|_| slab.full_name(owner)));
        // Globals are registered under their fully qualified name; class
        // members under the simple one
        let export_name = if class_name.is_some() {
            stub.name.as_str().to_owned()
        } else {
            full_name.clone()
        };

        // All by-value arguments simple => the function gets a direct
        // wrapper with natural parameters
        let mut fast_call = true;
        for &arg in &func.args {
            let arg_stub = slab.get(arg);
            if arg_stub.flags.intersects(StubFlags::REF | StubFlags::OUT) {
                continue;
            }
            let arg_ty = arg_stub
                .as_function_arg()
                .and_then(|a| a.type_decl)
                .and_then(|decl| types.resolve_decl(slab, decl));
            let simple = arg_ty
                .map(|ty| {
                    let def = types.get(ty);
                    def.traits.simple_copy
                        && !def.traits.requires_ctor
                        && !def.traits.requires_dtor
                })
                .unwrap_or(false);
            if !simple {
                fast_call = false;
            }
        }

        let writer = FuncWriter::new(
            slab,
            &mut types,
            &mut consts,
            stub_id,
            fast_call,
            settings.emit_exceptions,
        );
        match writer.emit() {
            Ok(code) => candidates.push(Candidate {
                stub: stub_id,
                jit_name: format!("__jit_func_{}_{}", stub.name, index),
                local_name: fast_call.then(|| format!("__local_func_{}_{}", stub.name, index)),
                class_name,
                name: export_name,
                code_hash: func.code_hash,
                code,
            }),
            Err(error) => {
                log::error!("{}: failed to translate '{}'", error.location, full_name);
                skipped.push((full_name, error.error.to_string()));
            }
        }
    }

    if types.has_errors() {
        return Err(BuildError::Load(format!(
            "unresolved types during translation: {}",
            types.errors().join(", ")
        )));
    }

    let mut out = String::with_capacity(16 * 1024);
    out.push_str(PROLOG);
    types.print_type_prototypes(&mut out);
    consts.print_const_vars(&mut out);
    types.print_call_forwarder_declarations(&mut out);
    print_function_bodies(slab, &types, &candidates, &mut out);
    types.print_call_forwarders(&mut out);

    let _ = writeln!(
        out,
        "void _bindModuleToEngine(struct EngineToJIT* ei, struct JITInit* init) {{"
    );
    let _ = writeln!(out, "EI = ei;");
    types.print_imports(&mut out);
    consts.print_const_init(&mut out);
    let mut exports = Vec::with_capacity(candidates.len());
    for candidate in &candidates {
        match &candidate.class_name {
            Some(class) => {
                let _ = writeln!(
                    out,
                    "init->_fnReportExportFunction(init->self, \"{}\", \"{}\", 0x{:x}ULL, {});",
                    class, candidate.name, candidate.code_hash, candidate.jit_name
                );
            }
            None => {
                let _ = writeln!(
                    out,
                    "init->_fnReportExportFunction(init->self, 0, \"{}\", 0x{:x}ULL, {});",
                    candidate.name, candidate.code_hash, candidate.jit_name
                );
            }
        }
        exports.push(JitExport {
            class_name: candidate.class_name.clone(),
            name: candidate.name.clone(),
            code_hash: candidate.code_hash,
        });
    }
    let _ = writeln!(out, "}}");

    log::info!(
        "JIT: translated {} function(s), {} stay on the interpreter",
        candidates.len(),
        skipped.len()
    );
    Ok(JitSource {
        code: out,
        exports,
        skipped,
    })
}

fn print_function_bodies(
    slab: &StubSlab,
    types: &JitTypeLib<'_>,
    candidates: &[Candidate],
    out: &mut String,
) {
    for candidate in candidates {
        let func = slab.get(candidate.stub).as_function().unwrap();
        match &candidate.local_name {
            None => {
                let _ = writeln!(
                    out,
                    "void {}(void* context, void* stackFrame, struct FunctionCallingParams* params) {{",
                    candidate.jit_name
                );
                out.push_str(&candidate.code);
                out.push_str("}\n\n");
            }
            Some(local_name) => {
                // Direct wrapper carries real parameters
                let _ = write!(
                    out,
                    "void {}(void* context, void* stackFrame, void* resultPtr",
                    local_name
                );
                let mut arg_types = Vec::new();
                for &arg in &func.args {
                    let arg_stub = slab.get(arg);
                    let by_pointer = arg_stub.flags.intersects(StubFlags::REF | StubFlags::OUT);
                    let c_name = arg_stub
                        .as_function_arg()
                        .and_then(|a| a.type_decl)
                        .map(|decl| {
                            let decl_stub = slab.get(decl);
                            let canonical = match decl_stub.as_type_decl() {
                                Some(d) if d.kind == crate::stub::TypeDeclKind::Engine => {
                                    decl_stub.name.as_str().to_owned()
                                }
                                _ => slab.type_decl_name(decl),
                            };
                            types_c_name(types, &canonical)
                        })
                        .unwrap_or_else(|| "int32_t".to_owned());
                    arg_types.push((c_name.clone(), by_pointer, arg_stub.name));
                    if by_pointer {
                        let _ = write!(out, ", {}* {}", c_name, arg_stub.name);
                    } else {
                        let _ = write!(out, ", {} {}", c_name, arg_stub.name);
                    }
                }
                out.push_str(") {\n");
                out.push_str(&candidate.code);
                out.push_str("}\n\n");

                // Generic wrapper forwards out of the parameter block
                let _ = writeln!(
                    out,
                    "void {}(void* context, void* stackFrame, struct FunctionCallingParams* params) {{",
                    candidate.jit_name
                );
                let _ = write!(
                    out,
                    "  {}(context, stackFrame, params ? params->_returnPtr : 0",
                    local_name
                );
                for (i, (c_name, by_pointer, _)) in arg_types.iter().enumerate() {
                    if *by_pointer {
                        let _ = write!(out, ", (({}*)params->_argPtr[{}])", c_name, i);
                    } else {
                        let _ = write!(out, ", *(({}*)params->_argPtr[{}])", c_name, i);
                    }
                }
                out.push_str(");\n}\n\n");
            }
        }
    }
}

/// C spelling of a declared type, for wrapper signatures. The type library
/// already resolved every declaration the bodies use, so a plain name
/// lookup is enough here.
fn types_c_name(types: &JitTypeLib<'_>, canonical: &str) -> String {
    types
        .lookup(crate::name::Name::new(canonical))
        .map(|id| types.get(id).c_name.clone())
        .unwrap_or_else(|| "int32_t".to_owned())
}

//--- native compiler -------------------------------------------------------

/// Wrapper around the external C compiler: the small embedded-style tcc
/// first, the system compiler as fallback.
pub struct JitCompiler {
    compiler: PathBuf,
    is_tcc: bool,
}

impl JitCompiler {
    /// Find a usable compiler on this machine.
    pub fn detect() -> Result<JitCompiler, BuildError> {
        for (candidate, is_tcc) in [("tcc", true), ("cc", false), ("gcc", false)] {
            let found = Command::new(candidate)
                .arg("-v")
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false);
            if found {
                return Ok(JitCompiler {
                    compiler: PathBuf::from(candidate),
                    is_tcc,
                });
            }
        }
        Err(BuildError::NoCompiler)
    }

    pub fn name(&self) -> String {
        self.compiler.display().to_string()
    }

    /// Compile an emitted source file into a shared object.
    pub fn compile(
        &self,
        source: &Path,
        output: &Path,
        settings: &TranslateSettings,
    ) -> Result<(), BuildError> {
        if output.exists() {
            std::fs::remove_file(output)?;
        }

        let mut command = Command::new(&self.compiler);
        command.arg("-O2").arg("-nostdlib").arg("-shared");
        if settings.emit_symbols {
            command.arg("-g");
        }
        if self.is_tcc {
            command.arg("-nostdinc");
        } else {
            command.arg("-fPIC").arg("-fno-builtin");
        }
        command.arg("-o").arg(output).arg(source);

        let output_data = command.output().map_err(|_| BuildError::NoCompiler)?;
        for line in String::from_utf8_lossy(&output_data.stderr).lines() {
            log::info!("JIT: {}", line);
        }
        if !output_data.status.success() {
            return Err(BuildError::CompilerFailed {
                compiler: self.name(),
                status: output_data.status.code().unwrap_or(-1),
            });
        }
        if !output.exists() {
            return Err(BuildError::NoOutput);
        }
        log::info!("JIT: {} finished with no errors", self.name());
        Ok(())
    }

    /// Translate, stage to a temp dir, compile. Returns the shared-object
    /// path inside the kept temp directory.
    pub fn build(
        &self,
        data: &PortableData,
        insight: &dyn TypeInsight,
        settings: &TranslateSettings,
    ) -> Result<(tempfile::TempDir, PathBuf), BuildError> {
        let source = translate_module(data, insight, settings)?;
        let dir = tempfile::Builder::new().prefix("scriptvm-jit").tempdir()?;
        let src_path = dir.path().join("module.c");
        source.write(&src_path)?;
        let out_path = dir.path().join("module.so");
        self.compile(&src_path, &out_path, settings)?;
        Ok((dir, out_path))
    }
}
