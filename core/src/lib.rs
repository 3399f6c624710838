//! Portable scripted-language runtime. A compiled script package arrives
//! as a packed stub stream; this crate unpacks it ([PortableData]), links
//! it against the host type system with full import/export verification
//! ([Linker]), materializes host types and functions ([TypeRegistry]) with
//! compiled byte code per function ([codeblock::CodeBlock]), and executes
//! them on a per-call stack frame ([frame::StackFrame]). An optional
//! ahead-of-time translator ([jit]) emits equivalent C so a native
//! compiler can replace hot functions, hash-checked against the originals.
//!
//! ```
//! use scriptvm::{Name, PortableData, Stub, StubBody, StubSlab};
//!
//! // A compiler frontend hands over a stub graph; pack it and the result
//! // is the durable module format plus its freshly unpacked twin.
//! let mut slab = StubSlab::new();
//! let module = slab.alloc(Stub::new(
//!     Name::new("demo"),
//!     None,
//!     StubBody::Module(Default::default()),
//! ));
//! let data = PortableData::create(&slab, module).unwrap();
//! assert!(data.export_module().is_some());
//!
//! // The packed bytes round-trip losslessly.
//! let reloaded = PortableData::from_packed(data.packed().to_vec()).unwrap();
//! assert_eq!(reloaded.slab().len(), data.slab().len());
//! ```

#![deny(clippy::all)]

pub mod codeblock;
pub mod codec;
pub mod error;
pub mod frame;
pub mod insight;
pub mod jit;
pub mod linker;
pub mod name;
pub mod object;
pub mod opcodes;
pub mod portable;
pub mod registry;
pub mod stub;
pub mod types;

pub use error::{Diagnostics, FormatError, LinkError, RuntimeFault, SourceLoc, TranslateError};
pub use frame::{call_function, ExecCtx, StackFrame};
pub use linker::{LinkReport, Linker, ValidatedLink};
pub use name::Name;
pub use object::{DefaultHost, Host};
pub use opcodes::{Immediate, Opcode};
pub use portable::{CompiledModule, PortableData};
pub use registry::{CallParams, Function, FunctionBody, TypeRegistry, MAX_CALL_ARGS};
pub use stub::{Stub, StubBody, StubFlags, StubId, StubSlab, StubType};
pub use types::{FuncId, TypeId};

/// Process-wide script state: the host type registry plus the host
/// callbacks, with the load/reload lifecycle on top. Loading is
/// transactional: validation runs to completion before anything is
/// committed, and a failed validation leaves the previous state intact.
pub struct Environment {
    registry: TypeRegistry,
    host: Box<dyn Host>,
}

impl Environment {
    pub fn new() -> Environment {
        Environment::with_host(Box::new(DefaultHost))
    }

    pub fn with_host(host: Box<dyn Host>) -> Environment {
        Environment {
            registry: TypeRegistry::new(),
            host,
        }
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Host-side setup (native classes, functions) before the first load.
    pub fn registry_mut(&mut self) -> &mut TypeRegistry {
        &mut self.registry
    }

    /// Link and commit a set of modules. All modules of a load are merged
    /// into one symbol table, so cross-module imports resolve against the
    /// exports that arrive alongside them.
    pub fn load_modules(&mut self, modules: &[&PortableData]) -> Result<LinkReport, Diagnostics> {
        let mut linker = Linker::new();
        for module in modules {
            linker.add_module(module);
        }
        let validated = linker.validate(&self.registry)?;

        // Validation passed; clear scripted state (types keep their
        // identity) and apply the new data
        self.registry.prepare_for_reload();
        let report = validated.commit(&mut self.registry)?;
        log::info!(
            "Scripts loaded: {} classes, {} structs, {} enums, {} functions, {} properties",
            report.classes,
            report.structs,
            report.enums,
            report.functions,
            report.properties
        );
        Ok(report)
    }

    /// Execution context over this environment's registry and host.
    pub fn exec_ctx(&self) -> ExecCtx<'_> {
        ExecCtx::new(&self.registry, &*self.host)
    }

    /// Call a global function by qualified name. Returns false when no
    /// such function exists.
    pub fn call_global(&self, name: Name, params: &CallParams) -> bool {
        match self.registry.find_global_function(name) {
            Some(func) => {
                let ctx = self.exec_ctx();
                call_function(&ctx, func, std::ptr::null_mut(), params);
                true
            }
            None => false,
        }
    }
}

impl Default for Environment {
    fn default() -> Environment {
        Environment::new()
    }
}
