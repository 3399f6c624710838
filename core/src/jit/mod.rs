//! Ahead-of-time translation of scripted functions to C. The translator
//! emits one C function per scripted function plus a module-init entry
//! point; a native compiler turns that into a shared object, and loading
//! it binds the exported function pointers over the interpreter bodies
//! (code hash checked) so those functions short-circuit the interpreter.
//!
//! The glue between engine and emitted code is a pair of C vtables: the
//! engine hands the module an [EngineToJit] with callbacks for everything
//! the code cannot do itself (type lifecycle by id, calls, object and
//! handle plumbing), and the module reports its imports, constants and
//! exports back through a [JitInit].

mod compile;
mod consts;
mod typelib;
mod writer;

pub use compile::{translate_module, JitCompiler, JitExport, JitSource, TranslateSettings};

use crate::{
    error::BuildError,
    frame::{call_function, ExecCtx},
    name::Name,
    object::{self, Host, RtObject},
    registry::{CallParams, JittedFn, TypeRegistry},
    types::{FuncId, TypeId},
};
use std::ffi::{c_void, CStr};
use std::os::raw::c_char;
use std::path::Path;

/// Engine services passed to the compiled module. C layout; every callback
/// takes the engine's `self` pointer first.
#[repr(C)]
pub struct EngineToJit {
    pub self_ptr: *mut c_void,

    pub log: unsafe extern "C" fn(*mut c_void, *const c_char),
    pub throw_exception:
        unsafe extern "C" fn(*mut c_void, *mut c_void, *const c_char, i32, *const c_char),

    pub type_ctor: unsafe extern "C" fn(*mut c_void, i32, *mut u8),
    pub type_dtor: unsafe extern "C" fn(*mut c_void, i32, *mut u8),
    pub type_copy: unsafe extern "C" fn(*mut c_void, i32, *mut u8, *mut u8),
    pub type_compare: unsafe extern "C" fn(*mut c_void, i32, *mut u8, *mut u8) -> i32,

    pub call: unsafe extern "C" fn(*mut c_void, *mut c_void, i32, i32, *mut c_void, *mut CallParams),

    pub object_new: unsafe extern "C" fn(*mut c_void, *mut c_void, i32, *mut u8),
    pub weak_to_bool: unsafe extern "C" fn(*mut c_void, *mut u8) -> i32,
    pub weak_to_strong: unsafe extern "C" fn(*mut c_void, *mut u8, *mut u8),
    pub strong_to_weak: unsafe extern "C" fn(*mut c_void, *mut u8, *mut u8),
    pub strong_from_ptr: unsafe extern "C" fn(*mut c_void, *mut c_void, *mut u8),
    pub enum_to_name: unsafe extern "C" fn(*mut c_void, i32, i64) -> u32,
    pub name_to_enum: unsafe extern "C" fn(*mut c_void, *mut c_void, i32, u32) -> i64,
    pub dynamic_cast: unsafe extern "C" fn(*mut c_void, i32, *mut u8, *mut u8),
    pub dynamic_weak_cast: unsafe extern "C" fn(*mut c_void, i32, *mut u8, *mut u8),
    pub meta_cast: unsafe extern "C" fn(*mut c_void, i32, u32) -> u32,
    pub class_to_name: unsafe extern "C" fn(*mut c_void, u32) -> u32,
    pub class_to_string: unsafe extern "C" fn(*mut c_void, u32, *mut u8),
}

/// Init-time reporting surface of the compiled module: the loader learns
/// what the module imports and exports.
#[repr(C)]
pub struct JitInit {
    pub self_ptr: *mut c_void,

    pub report_import_counts: unsafe extern "C" fn(*mut c_void, i32, i32),
    pub report_import_type: unsafe extern "C" fn(*mut c_void, i32, *const c_char),
    pub report_import_function:
        unsafe extern "C" fn(*mut c_void, i32, *const c_char, *const c_char),
    pub report_export_function: unsafe extern "C" fn(
        *mut c_void,
        *const c_char,
        *const c_char,
        u64,
        JittedFn,
    ),
    pub init_string_const: unsafe extern "C" fn(*mut c_void, *mut u8, *const c_char),
    pub init_name_const: unsafe extern "C" fn(*mut c_void, *mut u8, *const c_char),
    pub init_type_const: unsafe extern "C" fn(*mut c_void, *mut u8, *const c_char),
}

/// Name of the module-init symbol every emitted module exports.
pub const INIT_SYMBOL: &[u8] = b"_bindModuleToEngine";

type InitFn = unsafe extern "C" fn(*mut EngineToJit, *mut JitInit);

/// State shared with a bound module for its whole lifetime: the id tables
/// the module's numeric imports map through. The engine callbacks receive
/// this as their `self` pointer.
struct BindState {
    registry: *const TypeRegistry,
    host: *const DefaultHostHolder,
    type_map: Vec<TypeId>,
    func_map: Vec<FuncId>,
    exports: Vec<(String, u64, JittedFn)>,
    missing_imports: Vec<String>,
}

// The host trait object cannot travel through a thin C pointer; the bind
// state owns a boxed holder instead.
struct DefaultHostHolder {
    host: Box<dyn Host>,
}

impl BindState {
    fn registry(&self) -> &TypeRegistry {
        // SAFETY: the registry outlives every bound module; documented
        // contract of JitModule::bind
        unsafe { &*self.registry }
    }

    fn host(&self) -> &dyn Host {
        // SAFETY: as above
        unsafe { &*(*self.host).host }
    }

    fn type_id(&self, id: i32) -> Option<TypeId> {
        self.type_map.get(id as usize).copied()
    }
}

unsafe extern "C" fn cb_log(state: *mut c_void, text: *const c_char) {
    let state = &*(state as *const BindState);
    state.host().log(&CStr::from_ptr(text).to_string_lossy());
}

unsafe extern "C" fn cb_throw(
    state: *mut c_void,
    _frame: *mut c_void,
    file: *const c_char,
    line: i32,
    text: *const c_char,
) {
    let state = &*(state as *const BindState);
    log::error!(
        "{}({}): jit exception: {}",
        CStr::from_ptr(file).to_string_lossy(),
        line,
        CStr::from_ptr(text).to_string_lossy()
    );
    state.host().exception(
        &Default::default(),
        crate::error::RuntimeFault::NullPointer,
    );
}

unsafe extern "C" fn cb_type_ctor(state: *mut c_void, id: i32, data: *mut u8) {
    let state = &*(state as *const BindState);
    if let Some(ty) = state.type_id(id) {
        state.registry().construct(ty, data);
    }
}

unsafe extern "C" fn cb_type_dtor(state: *mut c_void, id: i32, data: *mut u8) {
    let state = &*(state as *const BindState);
    if let Some(ty) = state.type_id(id) {
        state.registry().destruct(ty, data);
    }
}

unsafe extern "C" fn cb_type_copy(state: *mut c_void, id: i32, dst: *mut u8, src: *mut u8) {
    let state = &*(state as *const BindState);
    if let Some(ty) = state.type_id(id) {
        state.registry().copy_value(ty, dst, src);
    }
}

unsafe extern "C" fn cb_type_compare(state: *mut c_void, id: i32, a: *mut u8, b: *mut u8) -> i32 {
    let state = &*(state as *const BindState);
    match state.type_id(id) {
        Some(ty) => state.registry().compare_values(ty, a, b) as i32,
        None => 0,
    }
}

unsafe extern "C" fn cb_call(
    state: *mut c_void,
    context: *mut c_void,
    func: i32,
    _mode: i32,
    _frame: *mut c_void,
    params: *mut CallParams,
) {
    let state = &*(state as *const BindState);
    if let Some(&func) = state.func_map.get(func as usize) {
        let ctx = ExecCtx::new(state.registry(), state.host());
        call_function(&ctx, func, context as *mut u8, &*params);
    }
}

unsafe extern "C" fn cb_object_new(state: *mut c_void, _frame: *mut c_void, id: i32, out: *mut u8) {
    let state = &*(state as *const BindState);
    let object = state
        .type_id(id)
        .and_then(|class| state.host().new_object(state.registry(), class));
    object::strong_store(state.registry(), out, object);
}

unsafe extern "C" fn cb_weak_to_bool(_state: *mut c_void, slot: *mut u8) -> i32 {
    object::weak_is_alive(slot) as i32
}

unsafe extern "C" fn cb_weak_to_strong(state: *mut c_void, weak: *mut u8, strong: *mut u8) {
    let state = &*(state as *const BindState);
    object::weak_to_strong(state.registry(), strong, weak);
}

unsafe extern "C" fn cb_strong_to_weak(_state: *mut c_void, strong: *mut u8, weak: *mut u8) {
    object::strong_to_weak(weak, strong);
}

unsafe extern "C" fn cb_strong_from_ptr(state: *mut c_void, raw: *mut c_void, out: *mut u8) {
    let state = &*(state as *const BindState);
    object::strong_from_object_ptr(state.registry(), out, raw as *const RtObject);
}

unsafe extern "C" fn cb_enum_to_name(state: *mut c_void, id: i32, value: i64) -> u32 {
    let state = &*(state as *const BindState);
    state
        .type_id(id)
        .and_then(|ty| state.registry().type_def(ty).enum_info.as_ref()?.find_name(value))
        .unwrap_or_default()
        .raw()
}

unsafe extern "C" fn cb_name_to_enum(
    state: *mut c_void,
    _frame: *mut c_void,
    id: i32,
    name: u32,
) -> i64 {
    let state = &*(state as *const BindState);
    state
        .type_id(id)
        .and_then(|ty| {
            state
                .registry()
                .type_def(ty)
                .enum_info
                .as_ref()?
                .find_value(Name::from_raw(name))
        })
        .unwrap_or(0)
}

unsafe extern "C" fn cb_dynamic_cast(state: *mut c_void, id: i32, src: *mut u8, dst: *mut u8) {
    let state = &*(state as *const BindState);
    let registry = state.registry();
    let keep = match (state.type_id(id), object::strong_get(src)) {
        (Some(target), Some(raw)) => registry.class_is_a((*raw).class(), target),
        _ => false,
    };
    if keep {
        object::strong_copy(registry, dst, src);
    } else {
        object::strong_store(registry, dst, None);
    }
}

unsafe extern "C" fn cb_dynamic_weak_cast(state: *mut c_void, id: i32, src: *mut u8, dst: *mut u8) {
    let state = &*(state as *const BindState);
    let registry = state.registry();
    let mut strong = [0u8; 8];
    object::weak_to_strong(registry, strong.as_mut_ptr(), src);
    let keep = match (state.type_id(id), object::strong_get(strong.as_ptr())) {
        (Some(target), Some(raw)) => registry.class_is_a((*raw).class(), target),
        _ => false,
    };
    if keep {
        object::weak_copy(dst, src);
    } else {
        object::weak_release(dst);
    }
    object::strong_release(registry, strong.as_mut_ptr());
}

unsafe extern "C" fn cb_meta_cast(state: *mut c_void, id: i32, class: u32) -> u32 {
    let state = &*(state as *const BindState);
    let keep = match state.type_id(id) {
        Some(target) => {
            class != 0 && state.registry().class_is_a(TypeId(class as u16), target)
        }
        None => false,
    };
    if keep {
        class
    } else {
        0
    }
}

unsafe extern "C" fn cb_class_to_name(state: *mut c_void, class: u32) -> u32 {
    let state = &*(state as *const BindState);
    state.registry().type_def(TypeId(class as u16)).name.raw()
}

unsafe extern "C" fn cb_class_to_string(state: *mut c_void, class: u32, out: *mut u8) {
    let state = &*(state as *const BindState);
    let name = state.registry().type_def(TypeId(class as u16)).name;
    (*(out as *mut String)).clone_from(&name.as_str().to_owned());
}

unsafe extern "C" fn cb_report_import_counts(state: *mut c_void, max_type: i32, max_func: i32) {
    let state = &mut *(state as *mut BindState);
    state.type_map = vec![TypeId(0); (max_type + 1).max(0) as usize];
    state.func_map = vec![FuncId(0); (max_func + 1).max(0) as usize];
}

unsafe extern "C" fn cb_report_import_type(state: *mut c_void, id: i32, name: *const c_char) {
    let state = &mut *(state as *mut BindState);
    let name = Name::new(&CStr::from_ptr(name).to_string_lossy());
    match state.registry().find_type(name) {
        Some(ty) => {
            if let Some(slot) = state.type_map.get_mut(id as usize) {
                *slot = ty;
            }
        }
        None => state.missing_imports.push(format!("type '{}'", name)),
    }
}

unsafe extern "C" fn cb_report_import_function(
    state: *mut c_void,
    id: i32,
    class_name: *const c_char,
    func_name: *const c_char,
) {
    let state = &mut *(state as *mut BindState);
    let func_name = Name::new(&CStr::from_ptr(func_name).to_string_lossy());
    let found = if class_name.is_null() {
        state.registry().find_global_function(func_name)
    } else {
        let class_name = Name::new(&CStr::from_ptr(class_name).to_string_lossy());
        state
            .registry()
            .find_class(class_name)
            .and_then(|class| state.registry().find_class_function(class, func_name))
    };
    match found {
        Some(func) => {
            if let Some(slot) = state.func_map.get_mut(id as usize) {
                *slot = func;
            }
        }
        None => state.missing_imports.push(format!("function '{}'", func_name)),
    }
}

unsafe extern "C" fn cb_report_export_function(
    state: *mut c_void,
    class_name: *const c_char,
    func_name: *const c_char,
    code_hash: u64,
    entry: JittedFn,
) {
    let state = &mut *(state as *mut BindState);
    let mut qualified = String::new();
    if !class_name.is_null() {
        qualified.push_str(&CStr::from_ptr(class_name).to_string_lossy());
        qualified.push('.');
    }
    qualified.push_str(&CStr::from_ptr(func_name).to_string_lossy());
    state.exports.push((qualified, code_hash, entry));
}

unsafe extern "C" fn cb_init_string_const(_state: *mut c_void, slot: *mut u8, text: *const c_char) {
    (slot as *mut String).write(CStr::from_ptr(text).to_string_lossy().into_owned());
}

unsafe extern "C" fn cb_init_name_const(_state: *mut c_void, slot: *mut u8, text: *const c_char) {
    let name = Name::new(&CStr::from_ptr(text).to_string_lossy());
    (slot as *mut u32).write(name.raw());
}

unsafe extern "C" fn cb_init_type_const(state: *mut c_void, slot: *mut u8, text: *const c_char) {
    let state = &*(state as *const BindState);
    let name = Name::new(&CStr::from_ptr(text).to_string_lossy());
    let id = state.registry().find_type(name).map(|ty| ty.0 as u32).unwrap_or(0);
    (slot as *mut u32).write(id);
}

/// A loaded AOT module: the shared object plus the bind state its
/// callbacks point into.
pub struct JitModule {
    _library: libloading::Library,
    state: Box<BindState>,
    _host: Box<DefaultHostHolder>,
    _engine_vtable: Box<EngineToJit>,
    bound: usize,
}

impl JitModule {
    /// Load a compiled module and run its init exchange against the
    /// registry. Function pointers are bound into existing host functions
    /// whose code hash matches; everything else is reported and skipped.
    ///
    /// The registry must outlive the returned module.
    pub fn load(
        path: &Path,
        registry: &mut TypeRegistry,
        host: Box<dyn Host>,
    ) -> Result<JitModule, BuildError> {
        // SAFETY: the module was produced by our translator; the init
        // symbol has the documented signature
        let library = unsafe { libloading::Library::new(path) }
            .map_err(|e| BuildError::Load(e.to_string()))?;

        let host_holder = Box::new(DefaultHostHolder { host });
        let mut state = Box::new(BindState {
            registry: registry as *const TypeRegistry,
            host: &*host_holder as *const DefaultHostHolder,
            type_map: Vec::new(),
            func_map: Vec::new(),
            exports: Vec::new(),
            missing_imports: Vec::new(),
        });

        let mut engine_vtable = Box::new(EngineToJit {
            self_ptr: &mut *state as *mut BindState as *mut c_void,
            log: cb_log,
            throw_exception: cb_throw,
            type_ctor: cb_type_ctor,
            type_dtor: cb_type_dtor,
            type_copy: cb_type_copy,
            type_compare: cb_type_compare,
            call: cb_call,
            object_new: cb_object_new,
            weak_to_bool: cb_weak_to_bool,
            weak_to_strong: cb_weak_to_strong,
            strong_to_weak: cb_strong_to_weak,
            strong_from_ptr: cb_strong_from_ptr,
            enum_to_name: cb_enum_to_name,
            name_to_enum: cb_name_to_enum,
            dynamic_cast: cb_dynamic_cast,
            dynamic_weak_cast: cb_dynamic_weak_cast,
            meta_cast: cb_meta_cast,
            class_to_name: cb_class_to_name,
            class_to_string: cb_class_to_string,
        });
        let mut init_vtable = JitInit {
            self_ptr: &mut *state as *mut BindState as *mut c_void,
            report_import_counts: cb_report_import_counts,
            report_import_type: cb_report_import_type,
            report_import_function: cb_report_import_function,
            report_export_function: cb_report_export_function,
            init_string_const: cb_init_string_const,
            init_name_const: cb_init_name_const,
            init_type_const: cb_init_type_const,
        };

        // SAFETY: symbol lookup + call into the module init with vtables
        // that stay alive for the module's lifetime
        unsafe {
            let init: libloading::Symbol<'_, InitFn> = library
                .get(INIT_SYMBOL)
                .map_err(|_| BuildError::MissingInit(String::from_utf8_lossy(INIT_SYMBOL).into()))?;
            init(&mut *engine_vtable, &mut init_vtable);
        }

        for missing in &state.missing_imports {
            log::error!("JIT: unresolved import {}", missing);
        }
        if !state.missing_imports.is_empty() {
            return Err(BuildError::Load(format!(
                "{} unresolved imports",
                state.missing_imports.len()
            )));
        }

        // Bind exports over interpreter bodies, hash-checked
        let mut bound = 0;
        let exports = state.exports.clone();
        for (qualified, code_hash, entry) in exports {
            let func = registry
                .all_functions()
                .find(|(_, f)| {
                    let name = match f.class {
                        Some(class) => format!(
                            "{}.{}",
                            registry.type_def(class).name,
                            f.name
                        ),
                        None => f.name.as_str().to_owned(),
                    };
                    name == qualified
                })
                .map(|(id, _)| id);
            match func {
                Some(func) if registry.function(func).code_hash == code_hash => {
                    registry.bind_jitted_function(func, entry);
                    bound += 1;
                }
                Some(_) => log::warn!(
                    "JIT: code hash of '{}' does not match, keeping interpreter",
                    qualified
                ),
                None => log::warn!("JIT: export '{}' has no host function", qualified),
            }
        }
        log::info!("JIT: bound {} compiled function(s)", bound);

        Ok(JitModule {
            _library: library,
            state,
            _host: host_holder,
            _engine_vtable: engine_vtable,
            bound,
        })
    }

    /// Number of functions this module replaced.
    pub fn bound_functions(&self) -> usize {
        self.bound
    }

    /// Names and code hashes the module exported.
    pub fn exports(&self) -> impl Iterator<Item = (&str, u64)> {
        self.state
            .exports
            .iter()
            .map(|(name, hash, _)| (name.as_str(), *hash))
    }
}
