//! The verifying linker. Takes a set of portable modules, merges their
//! stubs into one symbol table, checks every import against its export and
//! against the host type system, and only then materializes host types,
//! properties and functions in the registry.
//!
//! The pipeline is expressed through types: a [Linker] collects modules,
//! [Linker::validate] consumes it and hands back a [ValidatedLink] only if
//! every check passed, and [ValidatedLink::commit] is the single place
//! where the registry is mutated. A failed validation returns the full
//! diagnostics batch and leaves the registry untouched.

use crate::{
    codeblock::{CodeBlock, ResolvedProp, StubResolver},
    error::{Diagnostics, LinkError, SourceLoc},
    name::Name,
    portable::PortableData,
    registry::TypeRegistry,
    stub::{
        self, StubFlags, StubId, StubRef, StubSlab, StubType, TypeDeclKind,
    },
    types::{FuncId, MetaKind, ParamFlags, ParamType, PropFlags, TypeId},
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A stub position across the loaded module set.
type StubKey = (usize, StubId);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Resolved {
    None,
    Type(TypeId),
    Func(FuncId),
    Prop { class: TypeId, name: Name },
}

/// One linked symbol: at most one defining site plus any number of
/// importing declarations of the same fully-qualified name.
struct Symbol {
    stub_type: StubType,
    full_name: Name,
    export: Option<StubKey>,
    imports: Vec<StubKey>,
    /// Owning class symbol, functions and properties only
    class_owner: Option<usize>,
    resolved: Resolved,
}

impl Symbol {
    fn any_stub(&self) -> StubKey {
        self.export.unwrap_or_else(|| self.imports[0])
    }
}

/// Counts of what a committed link created, for logging and tooling.
#[derive(Clone, Copy, Debug, Default)]
pub struct LinkReport {
    pub enums: usize,
    pub classes: usize,
    pub structs: usize,
    pub properties: usize,
    pub functions: usize,
}

/// Module collector and symbol table builder.
pub struct Linker<'a> {
    modules: Vec<&'a PortableData>,
    symbols: Vec<Symbol>,
    symbol_by_name: HashMap<Name, usize>,
    symbol_by_stub: HashMap<StubKey, usize>,
    type_decls: Vec<StubKey>,
    type_decl_index: HashMap<StubKey, usize>,
    class_symbols: Vec<usize>,
    enum_symbols: Vec<usize>,
    prop_symbols: Vec<usize>,
    func_symbols: Vec<usize>,
    diags: Diagnostics,
    num_imports: u32,
    num_exports: u32,
}

impl<'a> Linker<'a> {
    pub fn new() -> Linker<'a> {
        Linker {
            modules: Vec::new(),
            symbols: Vec::new(),
            symbol_by_name: HashMap::new(),
            symbol_by_stub: HashMap::new(),
            type_decls: Vec::new(),
            type_decl_index: HashMap::new(),
            class_symbols: Vec::new(),
            enum_symbols: Vec::new(),
            prop_symbols: Vec::new(),
            func_symbols: Vec::new(),
            diags: Diagnostics::new(),
            num_imports: 0,
            num_exports: 0,
        }
    }

    fn slab(&self, key: StubKey) -> &'a StubSlab {
        self.modules[key.0].slab()
    }

    fn stub_ref(&self, key: StubKey) -> StubRef<'a> {
        self.slab(key).at(key.1)
    }

    fn loc(&self, key: StubKey) -> SourceLoc {
        self.slab(key).source_loc(key.1)
    }

    /// Merge one module's stubs into the symbol table.
    pub fn add_module(&mut self, data: &'a PortableData) {
        let module = self.modules.len();
        self.modules.push(data);

        for &id in data.all_stubs() {
            let stub = data.slab().get(id);
            let import = stub.is_import();
            match stub.stub_type() {
                StubType::TypeDecl => {
                    let key = (module, id);
                    self.type_decl_index.insert(key, self.type_decls.len());
                    self.type_decls.push(key);
                }
                StubType::Class | StubType::Enum | StubType::Function | StubType::Property => {
                    self.create_symbol((module, id), import);
                }
                _ => {}
            }
        }
    }

    fn create_symbol(&mut self, key: StubKey, import: bool) {
        let stub_ref = self.stub_ref(key);
        let full_name = Name::new(&stub_ref.full_name());
        let stub_type = stub_ref.stub_type();

        let index = match self.symbol_by_name.get(&full_name) {
            Some(&index) => {
                // In very rare cases a symbol changes kind between
                // modules (a struct republished as an enum); that is
                // never linkable.
                if self.symbols[index].stub_type != stub_type {
                    let previous = self.symbols[index].any_stub();
                    let previous = self.loc(previous);
                    self.diags.error(
                        LinkError::SymbolKindMismatch {
                            name: full_name.as_str().to_owned(),
                            previous,
                        },
                        self.loc(key),
                    );
                    return;
                }
                index
            }
            None => {
                let index = self.symbols.len();
                self.symbols.push(Symbol {
                    stub_type,
                    full_name,
                    export: None,
                    imports: Vec::new(),
                    class_owner: None,
                    resolved: Resolved::None,
                });
                self.symbol_by_name.insert(full_name, index);
                match stub_type {
                    StubType::Class => self.class_symbols.push(index),
                    StubType::Enum => self.enum_symbols.push(index),
                    StubType::Function => self.func_symbols.push(index),
                    StubType::Property => self.prop_symbols.push(index),
                    _ => unreachable!("symbol of non-member stub"),
                }
                index
            }
        };

        let existing_export = self.symbols[index].export;
        if import {
            self.symbols[index].imports.push(key);
            self.num_imports += 1;
        } else if let Some(previous) = existing_export {
            let previous = self.loc(previous);
            self.diags.error(
                LinkError::DuplicateExport {
                    name: full_name.as_str().to_owned(),
                    previous,
                },
                self.loc(key),
            );
            self.symbols[index].imports.push(key);
            self.num_imports += 1;
        } else {
            log::debug!("{}: exported as '{}'", self.loc(key), full_name);
            self.symbols[index].export = Some(key);
            self.num_exports += 1;
        }
        self.symbol_by_stub.insert(key, index);
    }

    /// Run every verification phase. On success the returned value is the
    /// only way to mutate the registry with this batch.
    pub fn validate(mut self, registry: &TypeRegistry) -> Result<ValidatedLink<'a>, Diagnostics> {
        log::info!(
            "Script linker has {} symbols ({} exports, {} imports)",
            self.symbols.len(),
            self.num_exports,
            self.num_imports
        );
        log::info!("Found {} type declarations to resolve", self.type_decls.len());
        log::info!("Discovered {} class, {} enum, {} property, {} function symbols",
            self.class_symbols.len(),
            self.enum_symbols.len(),
            self.prop_symbols.len(),
            self.func_symbols.len(),
        );

        self.find_parent_symbols();
        self.match_import_exports();
        self.check_native_aliasing(registry);
        self.resolve_engine_imports(registry);
        self.verify_type_references(registry);
        self.verify_exported_classes(registry);

        if self.diags.is_ok() {
            Ok(ValidatedLink { linker: self })
        } else {
            Err(self.diags)
        }
    }

    /// Phase: attach every function/property symbol to its owning class
    /// symbol.
    fn find_parent_symbols(&mut self) {
        let members: Vec<usize> = self
            .func_symbols
            .iter()
            .chain(&self.prop_symbols)
            .copied()
            .collect();
        for index in members {
            let key = self.symbols[index].any_stub();
            let stub_ref = self.stub_ref(key);
            if let Some(owner) = stub_ref.owning_class() {
                let class_name = Name::new(&owner.full_name());
                match self.symbol_by_name.get(&class_name) {
                    Some(&owner_index) => self.symbols[index].class_owner = Some(owner_index),
                    None => {
                        let name = self.symbols[index].full_name.as_str().to_owned();
                        self.diags.error(
                            LinkError::MissingOwnerClass {
                                class: class_name.as_str().to_owned(),
                                name,
                            },
                            self.loc(key),
                        );
                    }
                }
            }
        }
    }

    /// Phase: every import must be structurally identical to the export
    /// (or to the first import, when nothing exports the name).
    fn match_import_exports(&mut self) {
        let mut errors = Vec::new();
        for symbol in &self.symbols {
            let reference = symbol.export.unwrap_or_else(|| symbol.imports[0]);
            for &other in &symbol.imports {
                if other == reference {
                    continue;
                }
                let a = self.stub_ref(reference);
                let b = self.stub_ref(other);
                if !stub::match_stubs(a, b) {
                    errors.push((
                        LinkError::MismatchedDeclaration {
                            name: symbol.full_name.as_str().to_owned(),
                            previous: self.loc(reference),
                        },
                        self.loc(other),
                    ));
                }
            }
        }
        for (error, loc) in errors {
            self.diags.error(error, loc);
        }
    }

    /// Phase: a scripted export must not collide with a native entity. A
    /// scripted function that the engine has since taken over natively is
    /// demoted to an import with a warning, so the native one wins.
    fn check_native_aliasing(&mut self, registry: &TypeRegistry) {
        for index in 0..self.symbols.len() {
            let export = match self.symbols[index].export {
                Some(export) => export,
                None => continue,
            };
            let full_name = self.symbols[index].full_name;
            match self.symbols[index].stub_type {
                StubType::Class => {
                    if let Some(class) = registry.find_class(full_name) {
                        if !registry.type_def(class).scripted {
                            self.diags.error(
                                LinkError::AliasesNativeSymbol {
                                    name: full_name.as_str().to_owned(),
                                    kind: "class",
                                },
                                self.loc(export),
                            );
                        }
                    }
                }
                StubType::Enum => {
                    if let Some(enum_ty) = registry.find_enum(full_name) {
                        if !registry.type_def(enum_ty).scripted {
                            self.diags.error(
                                LinkError::AliasesNativeSymbol {
                                    name: full_name.as_str().to_owned(),
                                    kind: "enum",
                                },
                                self.loc(export),
                            );
                        }
                    }
                }
                StubType::Function => {
                    let native = match self.symbols[index].class_owner {
                        Some(owner) => match self.symbols[owner].resolved {
                            Resolved::Type(class) => {
                                registry.find_class_function(class, self.stub_ref(export).name())
                            }
                            _ => {
                                let owner_name = self.symbols[owner].full_name;
                                registry
                                    .find_class(owner_name)
                                    .and_then(|class| {
                                        registry.find_class_function(
                                            class,
                                            self.stub_ref(export).name(),
                                        )
                                    })
                            }
                        },
                        None => registry.find_global_function(full_name),
                    };
                    let native = match native {
                        Some(func) if !registry.function(func).scripted => func,
                        _ => continue,
                    };
                    let detail =
                        match_function_signature(registry, self.stub_ref(export), native);
                    match detail {
                        Ok(()) => {
                            log::warn!(
                                "{}: function '{}' was moved from scripts to native code, ignoring script definition",
                                self.loc(export),
                                full_name
                            );
                            self.diags.warn(
                                LinkError::AliasesNativeSymbol {
                                    name: full_name.as_str().to_owned(),
                                    kind: "function",
                                },
                                self.loc(export),
                            );
                            let symbol = &mut self.symbols[index];
                            symbol.export = None;
                            symbol.imports.push(export);
                            symbol.resolved = Resolved::Func(native);
                        }
                        Err(detail) => {
                            self.diags.error(
                                LinkError::SignatureMismatch {
                                    name: full_name.as_str().to_owned(),
                                    detail,
                                },
                                self.loc(export),
                            );
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// Phase: every symbol with no defining site must exist on the host
    /// side with a matching shape.
    fn resolve_engine_imports(&mut self, registry: &TypeRegistry) {
        // Classes first: properties and functions hang off them
        for i in 0..self.class_symbols.len() {
            let index = self.class_symbols[i];
            if self.symbols[index].export.is_some() {
                continue;
            }
            let key = self.symbols[index].any_stub();
            let stub_ref = self.stub_ref(key);
            let class = stub_ref.as_class().unwrap();
            let full_name = self.symbols[index].full_name;

            if class.engine_import_name.is_empty() {
                let error = if stub_ref.flags().contains(StubFlags::NATIVE) {
                    LinkError::NoEngineImportName(full_name.as_str().to_owned())
                } else {
                    LinkError::UnresolvedImport(full_name.as_str().to_owned())
                };
                self.diags.error(error, self.loc(key));
                continue;
            }
            match registry.find_class(class.engine_import_name) {
                Some(engine) => self.symbols[index].resolved = Resolved::Type(engine),
                None => self.diags.error(
                    LinkError::MissingEngineClass {
                        name: full_name.as_str().to_owned(),
                        import: class.engine_import_name.as_str().to_owned(),
                    },
                    self.loc(key),
                ),
            }
        }

        for i in 0..self.enum_symbols.len() {
            let index = self.enum_symbols[i];
            if self.symbols[index].export.is_some() {
                continue;
            }
            let key = self.symbols[index].any_stub();
            let stub_ref = self.stub_ref(key);
            let enum_stub = stub_ref.as_enum().unwrap();
            let full_name = self.symbols[index].full_name;

            if enum_stub.engine_import_name.is_empty() {
                let error = if stub_ref.flags().contains(StubFlags::NATIVE) {
                    LinkError::NoEngineImportName(full_name.as_str().to_owned())
                } else {
                    LinkError::UnresolvedImport(full_name.as_str().to_owned())
                };
                self.diags.error(error, self.loc(key));
                continue;
            }
            let engine = match registry.find_enum(enum_stub.engine_import_name) {
                Some(engine) => engine,
                None => {
                    self.diags.error(
                        LinkError::MissingEngineEnum {
                            name: full_name.as_str().to_owned(),
                            import: enum_stub.engine_import_name.as_str().to_owned(),
                        },
                        self.loc(key),
                    );
                    continue;
                }
            };

            // Every declared option must exist; a differing pre-assigned
            // value is only worth a warning, the engine value wins.
            let info = registry.type_def(engine).enum_info.clone().unwrap_or_default();
            for (name, declared) in stub::enum_option_values(stub_ref.slab, enum_stub) {
                match info.find_value(name) {
                    None => self.diags.error(
                        LinkError::MissingEnumOption {
                            option: name.as_str().to_owned(),
                            import: enum_stub.engine_import_name.as_str().to_owned(),
                        },
                        self.loc(key),
                    ),
                    Some(engine_value) if engine_value != declared => {
                        log::warn!(
                            "{}: enum option '{}' of '{}' has engine value {} but scripts predefined {}",
                            self.loc(key),
                            name,
                            full_name,
                            engine_value,
                            declared
                        );
                    }
                    Some(_) => {}
                }
            }
            self.symbols[index].resolved = Resolved::Type(engine);
        }

        for i in 0..self.prop_symbols.len() {
            let index = self.prop_symbols[i];
            if self.symbols[index].export.is_some() {
                continue;
            }
            let key = self.symbols[index].any_stub();
            let full_name = self.symbols[index].full_name;
            let owner_class = match self.symbols[index].class_owner {
                Some(owner) => match self.symbols[owner].resolved {
                    Resolved::Type(class) => class,
                    // The class itself failed to resolve; its own error is
                    // already reported
                    _ => continue,
                },
                None => continue,
            };

            let name = self.stub_ref(key).name();
            let engine_prop = match registry.find_property(owner_class, name) {
                Some(prop) => prop,
                None => {
                    self.diags.error(
                        LinkError::MissingEngineProperty {
                            name: name.as_str().to_owned(),
                            class: registry.type_def(owner_class).name.as_str().to_owned(),
                        },
                        self.loc(key),
                    );
                    continue;
                }
            };

            let decl = self.stub_ref(key).as_property().unwrap().type_decl;
            let matches = decl
                .map(|decl| {
                    match_property_type(registry, engine_prop.ty, self.stub_ref((key.0, decl)))
                })
                .unwrap_or(false);
            if !matches {
                self.diags.error(
                    LinkError::PropertyTypeMismatch {
                        name: full_name.as_str().to_owned(),
                        engine: registry.type_def(engine_prop.ty).name.as_str().to_owned(),
                    },
                    self.loc(key),
                );
                continue;
            }
            self.symbols[index].resolved = Resolved::Prop {
                class: owner_class,
                name,
            };
        }

        for i in 0..self.func_symbols.len() {
            let index = self.func_symbols[i];
            if self.symbols[index].export.is_some() {
                continue;
            }
            if self.symbols[index].resolved != Resolved::None {
                // Already demoted onto a native function
                continue;
            }
            let key = self.symbols[index].any_stub();
            let stub_ref = self.stub_ref(key);
            let func = stub_ref.as_function().unwrap();
            let full_name = self.symbols[index].full_name;

            // Functions lowered directly to an opcode need no host object
            if !func.opcode_name.is_empty() {
                continue;
            }

            let engine = match self.symbols[index].class_owner {
                None => registry.find_global_function(full_name),
                Some(owner) => match self.symbols[owner].resolved {
                    Resolved::Type(class) => registry.find_class_function(class, stub_ref.name()),
                    _ => {
                        // Owner did not resolve; still name this import so
                        // a missing dependency reads well
                        self.diags.error(
                            LinkError::UnresolvedImport(full_name.as_str().to_owned()),
                            self.loc(key),
                        );
                        continue;
                    }
                },
            };
            let engine = match engine {
                Some(engine) => engine,
                None => {
                    self.diags.error(
                        LinkError::UnresolvedImport(full_name.as_str().to_owned()),
                        self.loc(key),
                    );
                    continue;
                }
            };
            match match_function_signature(registry, stub_ref, engine) {
                Ok(()) => self.symbols[index].resolved = Resolved::Func(engine),
                Err(detail) => self.diags.error(
                    LinkError::SignatureMismatch {
                        name: full_name.as_str().to_owned(),
                        detail,
                    },
                    self.loc(key),
                ),
            }
        }
    }

    /// Phase: every type declaration must lead to a real type.
    fn verify_type_references(&mut self, registry: &TypeRegistry) {
        let mut missing_engine_types = HashSet::new();
        for i in 0..self.type_decls.len() {
            let key = self.type_decls[i];
            let stub_ref = self.stub_ref(key);
            let decl = stub_ref.as_type_decl().unwrap();
            match decl.kind {
                TypeDeclKind::Engine => {
                    let name = stub_ref.name();
                    if registry.find_type(name).is_none() && missing_engine_types.insert(name) {
                        self.diags.error(
                            LinkError::MissingEngineType(name.as_str().to_owned()),
                            self.loc(key),
                        );
                    }
                }
                TypeDeclKind::Simple
                | TypeDeclKind::ClassType
                | TypeDeclKind::PtrType
                | TypeDeclKind::WeakPtrType => {
                    let resolved = decl
                        .referenced
                        .map(|r| stub_ref.at(r))
                        .and_then(|r| r.as_type_ref().and_then(|t| t.resolved))
                        .and_then(|target| self.symbol_by_stub.get(&(key.0, target)));
                    if resolved.is_none() {
                        self.diags.error(
                            LinkError::UnresolvedTypeRef(
                                stub_ref.slab.type_decl_name(key.1),
                            ),
                            self.loc(key),
                        );
                    }
                }
                TypeDeclKind::DynamicArray | TypeDeclKind::StaticArray => {
                    let mapped = decl
                        .inner
                        .and_then(|inner| self.type_decl_index.get(&(key.0, inner)));
                    if mapped.is_none() {
                        self.diags.error(
                            LinkError::UnresolvedTypeRef(
                                stub_ref.slab.type_decl_name(key.1),
                            ),
                            self.loc(key),
                        );
                    }
                }
            }
        }
    }

    /// Phase: every exported non-struct class must reach a non-abstract
    /// native base deriving from the scripted root.
    fn verify_exported_classes(&mut self, registry: &TypeRegistry) {
        for i in 0..self.class_symbols.len() {
            let index = self.class_symbols[i];
            let export = match self.symbols[index].export {
                Some(export) => export,
                None => continue,
            };
            let stub_ref = self.stub_ref(export);
            if stub_ref.flags().contains(StubFlags::STRUCT) {
                continue;
            }
            if self.find_native_class_base(registry, export).is_none() {
                self.diags.error(
                    LinkError::NoNativeBase {
                        name: self.symbols[index].full_name.as_str().to_owned(),
                    },
                    self.loc(export),
                );
            }
        }
    }

    /// Walk a scripted class's base chain until a class with an engine
    /// import name provides the native anchor.
    fn find_native_class_base(&self, registry: &TypeRegistry, key: StubKey) -> Option<TypeId> {
        let slab = self.slab(key);
        let mut cursor = Some(key.1);
        while let Some(current) = cursor {
            let class = slab.get(current).as_class()?;
            if !class.engine_import_name.is_empty() {
                let engine = registry.find_class(class.engine_import_name)?;
                let def = registry.type_def(engine);
                let info = def.class_info()?;
                if info.is_abstract || !registry.class_is_a(engine, registry.scripted_root()) {
                    return None;
                }
                return Some(engine);
            }
            cursor = class.base_class;
        }
        None
    }
}

impl<'a> Default for Linker<'a> {
    fn default() -> Linker<'a> {
        Linker::new()
    }
}

//--- commit ---------------------------------------------------------------

/// Proof that validation passed; the only gate to registry mutation.
pub struct ValidatedLink<'a> {
    linker: Linker<'a>,
}

impl<'a> ValidatedLink<'a> {
    /// Materialize every exported symbol: enums with their computed
    /// storage width, classes and structs with fixed-point layouts,
    /// properties, and functions with compiled code blocks.
    pub fn commit(self, registry: &mut TypeRegistry) -> Result<LinkReport, Diagnostics> {
        let mut linker = self.linker;
        let mut report = LinkReport::default();
        let mut decl_types: HashMap<StubKey, TypeId> = HashMap::new();

        // Enums: size follows the value range, signed if anything is
        // negative
        for i in 0..linker.enum_symbols.len() {
            let index = linker.enum_symbols[i];
            let export = match linker.symbols[index].export {
                Some(export) => export,
                None => continue,
            };
            let stub_ref = linker.stub_ref(export);
            let enum_stub = stub_ref.as_enum().unwrap();
            let values = stub::enum_option_values(stub_ref.slab, enum_stub);
            let (size, signed) = enum_storage(&values);
            let enum_ty = registry.create_enum(linker.symbols[index].full_name, size, signed);
            for (name, value) in values {
                registry.add_enum_option(enum_ty, name, value);
            }
            linker.symbols[index].resolved = Resolved::Type(enum_ty);
            report.enums += 1;
        }
        log::info!("Created {} enum(s)", report.enums);

        // Classes and structs
        let mut exported_structs = Vec::new();
        let mut exported_classes = Vec::new();
        for i in 0..linker.class_symbols.len() {
            let index = linker.class_symbols[i];
            let export = match linker.symbols[index].export {
                Some(export) => export,
                None => continue,
            };
            let stub_ref = linker.stub_ref(export);
            let full_name = linker.symbols[index].full_name;
            if stub_ref.flags().contains(StubFlags::STRUCT) {
                let ty = registry.create_struct(full_name);
                linker.symbols[index].resolved = Resolved::Type(ty);
                exported_structs.push((index, export, ty));
                report.structs += 1;
            } else {
                let native_base = linker
                    .find_native_class_base(registry, export)
                    .expect("validated class lost its native base");
                let ty = registry.create_class(full_name, native_base);
                if stub_ref.flags().contains(StubFlags::ABSTRACT) {
                    registry.set_class_abstract(ty, true);
                }
                linker.symbols[index].resolved = Resolved::Type(ty);
                exported_classes.push((index, export, ty));
                report.classes += 1;
            }
        }
        log::info!("Created {} class(es)", report.classes);
        log::info!("Created {} structure(s)", report.structs);

        // Base-class links between scripted classes
        for &(_, export, ty) in &exported_classes {
            let stub_ref = linker.stub_ref(export);
            let class = stub_ref.as_class().unwrap();
            if let Some(base) = class.base_class {
                if let Some(&base_symbol) = linker.symbol_by_stub.get(&(export.0, base)) {
                    if let Resolved::Type(base_ty) = linker.symbols[base_symbol].resolved {
                        registry.set_class_base(ty, base_ty);
                    }
                }
            }
        }

        // Resolve every type declaration into a host type handle
        for i in 0..linker.type_decls.len() {
            let key = linker.type_decls[i];
            linker.create_type(registry, key, &mut decl_types);
        }

        // Properties, with flags translated from stub flags
        for i in 0..linker.prop_symbols.len() {
            let index = linker.prop_symbols[i];
            let export = match linker.symbols[index].export {
                Some(export) => export,
                None => continue,
            };
            let stub_ref = linker.stub_ref(export);
            let prop = stub_ref.as_property().unwrap();
            let name = stub_ref.name();

            let owner_ty = match linker.symbols[index]
                .class_owner
                .map(|owner| linker.symbols[owner].resolved)
            {
                Some(Resolved::Type(ty)) => ty,
                _ => continue,
            };
            let prop_ty = match prop
                .type_decl
                .and_then(|decl| decl_types.get(&(export.0, decl)).copied())
            {
                Some(ty) => ty,
                None => continue,
            };

            let mut flags = PropFlags::SCRIPTED;
            if stub_ref.flags().contains(StubFlags::EDITABLE) {
                flags |= PropFlags::EDITABLE;
            }
            if stub_ref.flags().contains(StubFlags::INLINED) {
                flags |= PropFlags::INLINED;
            }
            if stub_ref.flags().contains(StubFlags::CONST) {
                flags |= PropFlags::READ_ONLY;
            }
            if !registry.type_def(owner_ty).is_struct() {
                flags |= PropFlags::EXTERNAL_BUFFER;
            }
            registry.add_scripted_property(owner_ty, name, prop_ty, flags);
            linker.symbols[index].resolved = Resolved::Prop {
                class: owner_ty,
                name,
            };
            report.properties += 1;
        }
        log::info!("Created {} properties", report.properties);

        // Struct and class layouts iterate to a fixed point: structs can
        // contain structs, class buffers depend on scripted member sizes
        loop {
            let mut changed = false;
            for &(_, _, ty) in &exported_structs {
                changed |= registry.recompute_struct_layout(ty);
            }
            if !changed {
                break;
            }
        }
        loop {
            let mut changed = false;
            for &(_, _, ty) in &exported_classes {
                changed |= registry.recompute_class_layout(ty);
            }
            if !changed {
                break;
            }
        }

        // Function objects
        for i in 0..linker.func_symbols.len() {
            let index = linker.func_symbols[i];
            let export = match linker.symbols[index].export {
                Some(export) => export,
                None => continue,
            };
            let class_ty = linker.symbols[index]
                .class_owner
                .and_then(|owner| match linker.symbols[owner].resolved {
                    Resolved::Type(ty) => Some(ty),
                    _ => None,
                });
            let name = if class_ty.is_some() {
                linker.stub_ref(export).name()
            } else {
                linker.symbols[index].full_name
            };
            let func = registry.create_function(name, class_ty);
            linker.symbols[index].resolved = Resolved::Func(func);
            report.functions += 1;
        }
        log::info!("Created {} functions", report.functions);

        // Compile bodies; a function that fails translation stays unbound
        // and is reported as a warning, the rest of the load proceeds
        let mut compiled: Vec<(FuncId, Arc<CodeBlock>, StubKey)> = Vec::new();
        for i in 0..linker.func_symbols.len() {
            let index = linker.func_symbols[i];
            let export = match linker.symbols[index].export {
                Some(export) => export,
                None => continue,
            };
            let func_id = match linker.symbols[index].resolved {
                Resolved::Func(func_id) => func_id,
                _ => continue,
            };
            let resolver = ModuleResolver {
                linker: &linker,
                registry: &*registry,
                decl_types: &decl_types,
                module: export.0,
            };
            match CodeBlock::build(linker.slab(export), export.1, &resolver) {
                Ok(block) => compiled.push((func_id, Arc::new(block), export)),
                Err(error) => {
                    let name = linker.symbols[index].full_name.as_str().to_owned();
                    log::error!("{}: failed to generate code for '{}'", error.location, name);
                    linker.diags.warn(
                        LinkError::CodeGeneration {
                            name,
                            inner: error.error,
                        },
                        error.location,
                    );
                }
            }
        }

        for (func_id, block, export) in compiled {
            let stub_ref = linker.stub_ref(export);
            let func = stub_ref.as_function().unwrap();
            let ret = func
                .return_type
                .and_then(|decl| decl_types.get(&(export.0, decl)).copied())
                .map(ParamType::value);
            let mut params = Vec::with_capacity(func.args.len());
            for &arg in &func.args {
                let arg_ref = stub_ref.at(arg);
                let arg_stub = arg_ref.as_function_arg().unwrap();
                let ty = arg_stub
                    .type_decl
                    .and_then(|decl| decl_types.get(&(export.0, decl)).copied())
                    .unwrap_or(registry.primitives.int32);
                let mut flags = ParamFlags::empty();
                if arg_ref.flags().contains(StubFlags::REF) {
                    flags = ParamFlags::REF | ParamFlags::CONST;
                } else if arg_ref.flags().contains(StubFlags::OUT) {
                    flags = ParamFlags::REF;
                }
                params.push(ParamType { ty, flags });
            }
            let is_static = stub_ref.owning_class().is_none()
                || stub_ref.flags().contains(StubFlags::STATIC);
            registry.setup_scripted_function(func_id, ret, params, block, is_static);
        }

        // Bind scripted constructors/destructors for later invocation
        for &(_, export, ty) in exported_classes.iter().chain(&exported_structs) {
            let stub_ref = linker.stub_ref(export);
            let class = stub_ref.as_class().unwrap();
            let mut ctor = None;
            let mut dtor = None;
            for &member in &class.stubs {
                let member_ref = stub_ref.at(member);
                if member_ref.stub_type() != StubType::Function {
                    continue;
                }
                let resolved = linker
                    .symbol_by_stub
                    .get(&(export.0, member))
                    .map(|&s| linker.symbols[s].resolved);
                if let Some(Resolved::Func(func)) = resolved {
                    if member_ref.flags().contains(StubFlags::CONSTRUCTOR) {
                        ctor = Some(func);
                    }
                    if member_ref.flags().contains(StubFlags::DESTRUCTOR) {
                        dtor = Some(func);
                    }
                }
            }
            registry.bind_class_special_functions(ty, ctor, dtor);
        }

        // Anything the registry flagged as a duplicate export becomes a
        // link diagnostic
        for (kind, name) in registry.take_duplicates() {
            linker.diags.error(
                LinkError::DuplicateScriptedEntity {
                    kind,
                    name: name.as_str().to_owned(),
                },
                SourceLoc::unknown(),
            );
        }

        if linker.diags.is_ok() {
            Ok(report)
        } else {
            Err(linker.diags)
        }
    }
}

impl<'a> Linker<'a> {
    /// Resolve one type declaration into a host type, memoized; array and
    /// pointer shells are created on demand.
    fn create_type(
        &self,
        registry: &mut TypeRegistry,
        key: StubKey,
        memo: &mut HashMap<StubKey, TypeId>,
    ) -> Option<TypeId> {
        if let Some(&ty) = memo.get(&key) {
            return Some(ty);
        }
        let stub_ref = self.stub_ref(key);
        let decl = stub_ref.as_type_decl()?;
        let ty = match decl.kind {
            TypeDeclKind::Engine => registry.find_type(stub_ref.name())?,
            TypeDeclKind::Simple => self.resolve_type_ref(key.0, decl.referenced?)?,
            TypeDeclKind::ClassType => {
                let inner = self.resolve_type_ref(key.0, decl.referenced?)?;
                registry.class_ref_type(inner)
            }
            TypeDeclKind::PtrType => {
                let inner = self.resolve_type_ref(key.0, decl.referenced?)?;
                registry.strong_handle_type(inner)
            }
            TypeDeclKind::WeakPtrType => {
                let inner = self.resolve_type_ref(key.0, decl.referenced?)?;
                registry.weak_handle_type(inner)
            }
            TypeDeclKind::DynamicArray => {
                let inner = self.create_type(registry, (key.0, decl.inner?), memo)?;
                registry.dynamic_array_type(inner)
            }
            TypeDeclKind::StaticArray => {
                let inner = self.create_type(registry, (key.0, decl.inner?), memo)?;
                registry.static_array_type(inner, decl.array_size)
            }
        };
        memo.insert(key, ty);
        Some(ty)
    }

    /// A type reference resolves through the symbol of its target stub.
    fn resolve_type_ref(&self, module: usize, type_ref: StubId) -> Option<TypeId> {
        let slab = self.modules[module].slab();
        let resolved = slab.get(type_ref).as_type_ref()?.resolved?;
        let symbol = self.symbol_by_stub.get(&(module, resolved))?;
        match self.symbols[*symbol].resolved {
            Resolved::Type(ty) => Some(ty),
            _ => None,
        }
    }
}

//--- stub resolver for the code-block builder ------------------------------

struct ModuleResolver<'x, 'a> {
    linker: &'x Linker<'a>,
    registry: &'x TypeRegistry,
    decl_types: &'x HashMap<StubKey, TypeId>,
    module: usize,
}

impl StubResolver for ModuleResolver<'_, '_> {
    fn registry(&self) -> &TypeRegistry {
        self.registry
    }

    fn resolve_type(&self, decl: StubId) -> Option<TypeId> {
        self.decl_types.get(&(self.module, decl)).copied()
    }

    fn resolve_class(&self, class: StubId) -> Option<TypeId> {
        // The builder hands either a class stub or a type-decl leading to
        // one
        let slab = self.linker.modules[self.module].slab();
        if slab.get(class).as_class().is_some() {
            let symbol = self.linker.symbol_by_stub.get(&(self.module, class))?;
            return match self.linker.symbols[*symbol].resolved {
                Resolved::Type(ty) => Some(ty),
                _ => None,
            };
        }
        let ty = self.resolve_type(class)?;
        match self.registry.type_def(ty).kind {
            MetaKind::Class => Some(ty),
            _ => None,
        }
    }

    fn resolve_enum(&self, enum_stub: StubId) -> Option<TypeId> {
        let symbol = self.linker.symbol_by_stub.get(&(self.module, enum_stub))?;
        match self.linker.symbols[*symbol].resolved {
            Resolved::Type(ty) => Some(ty),
            _ => None,
        }
    }

    fn resolve_property(&self, prop: StubId) -> Option<ResolvedProp> {
        let symbol = self.linker.symbol_by_stub.get(&(self.module, prop))?;
        let (class, name) = match self.linker.symbols[*symbol].resolved {
            Resolved::Prop { class, name } => (class, name),
            _ => return None,
        };
        let property = self.registry.find_property(class, name)?;
        Some(ResolvedProp {
            ty: property.ty,
            offset: property.offset,
            external: property.flags.contains(PropFlags::EXTERNAL_BUFFER),
        })
    }

    fn resolve_function(&self, func: StubId) -> Option<FuncId> {
        let symbol = self.linker.symbol_by_stub.get(&(self.module, func))?;
        match self.linker.symbols[*symbol].resolved {
            Resolved::Func(func_id) => Some(func_id),
            _ => None,
        }
    }
}

//--- shape checks against the host ----------------------------------------

/// Minimum storage for an enum's value range: 1/2/4/8 bytes, signed when
/// any value is negative.
fn enum_storage(values: &[(Name, i64)]) -> (u8, bool) {
    let min = values.iter().map(|&(_, v)| v).min().unwrap_or(0);
    let max = values.iter().map(|&(_, v)| v).max().unwrap_or(0);
    let signed = min < 0;
    let size = if signed {
        if min >= i8::MIN as i64 && max <= i8::MAX as i64 {
            1
        } else if min >= i16::MIN as i64 && max <= i16::MAX as i64 {
            2
        } else if min >= i32::MIN as i64 && max <= i32::MAX as i64 {
            4
        } else {
            8
        }
    } else if max <= u8::MAX as i64 {
        1
    } else if max <= u16::MAX as i64 {
        2
    } else if max <= u32::MAX as i64 {
        4
    } else {
        8
    };
    (size, signed)
}

/// Does a host type match a scripted type declaration? Used to verify
/// imported properties and function signatures.
fn match_property_type(registry: &TypeRegistry, ty: TypeId, decl: StubRef<'_>) -> bool {
    let decl_stub = match decl.as_type_decl() {
        Some(decl_stub) => decl_stub,
        None => return false,
    };
    let def = registry.type_def(ty);
    match decl_stub.kind {
        TypeDeclKind::Engine => def.name == decl.name(),
        TypeDeclKind::Simple => match decl_stub.referenced.map(|r| decl.at(r)) {
            Some(type_ref) => match_resolved_ref(registry, ty, type_ref),
            None => false,
        },
        TypeDeclKind::ClassType => {
            def.kind == MetaKind::ClassRef
                && match (def.inner, decl_stub.referenced) {
                    (Some(inner), Some(r)) => match_resolved_ref(registry, inner, decl.at(r)),
                    _ => false,
                }
        }
        TypeDeclKind::PtrType => {
            def.kind == MetaKind::StrongHandle
                && match (def.inner, decl_stub.referenced) {
                    (Some(inner), Some(r)) => match_resolved_ref(registry, inner, decl.at(r)),
                    _ => false,
                }
        }
        TypeDeclKind::WeakPtrType => {
            def.kind == MetaKind::WeakHandle
                && match (def.inner, decl_stub.referenced) {
                    (Some(inner), Some(r)) => match_resolved_ref(registry, inner, decl.at(r)),
                    _ => false,
                }
        }
        TypeDeclKind::DynamicArray => {
            def.kind == MetaKind::DynamicArray
                && match (def.inner, decl_stub.inner) {
                    (Some(inner), Some(d)) => match_property_type(registry, inner, decl.at(d)),
                    _ => false,
                }
        }
        TypeDeclKind::StaticArray => {
            def.kind == MetaKind::StaticArray
                && def.array_len == decl_stub.array_size
                && match (def.inner, decl_stub.inner) {
                    (Some(inner), Some(d)) => match_property_type(registry, inner, decl.at(d)),
                    _ => false,
                }
        }
    }
}

/// A type reference matches a host type when the host entity has the
/// declared shape and answers to the scripted or engine name.
fn match_resolved_ref(registry: &TypeRegistry, ty: TypeId, type_ref: StubRef<'_>) -> bool {
    let resolved = match type_ref.as_type_ref().and_then(|r| r.resolved) {
        Some(resolved) => type_ref.at(resolved),
        None => return false,
    };
    let def = registry.type_def(ty);
    if let Some(class) = resolved.as_class() {
        if def.kind != MetaKind::Class {
            return false;
        }
        def.name.as_str() == resolved.full_name() || def.name == class.engine_import_name
    } else if let Some(enum_stub) = resolved.as_enum() {
        if def.kind != MetaKind::Enum {
            return false;
        }
        def.name.as_str() == resolved.full_name() || def.name == enum_stub.engine_import_name
    } else {
        false
    }
}

/// Verify a scripted declaration against a host function: return type,
/// argument count, per-argument type and reference discipline, and
/// static-ness. A human-readable mismatch description comes back on error;
/// soft reference-mode mismatches are logged as warnings only.
fn match_function_signature(
    registry: &TypeRegistry,
    stub_func: StubRef<'_>,
    engine: FuncId,
) -> Result<(), String> {
    let func = stub_func.as_function().ok_or("not a function")?;
    let engine_func = registry.function(engine);

    match (func.return_type, engine_func.ret) {
        (None, Some(ret)) => {
            return Err(format!(
                "should return a value of type '{}'",
                registry.type_def(ret.ty).name
            ))
        }
        (Some(_), None) => return Err("should not return any value".to_owned()),
        (Some(decl), Some(ret)) => {
            if !match_property_type(registry, ret.ty, stub_func.at(decl)) {
                return Err(format!(
                    "returns '{}' but scripts declared '{}'",
                    registry.type_def(ret.ty).name,
                    stub_func.slab.type_decl_name(decl)
                ));
            }
        }
        (None, None) => {}
    }

    if func.args.len() != engine_func.params.len() {
        return Err(format!(
            "has {} arguments, scripts declared {}",
            engine_func.params.len(),
            func.args.len()
        ));
    }

    let engine_params = engine_func.params.clone();
    for (i, (&arg, engine_param)) in func.args.iter().zip(&engine_params).enumerate() {
        let arg_ref = stub_func.at(arg);
        let arg_stub = arg_ref.as_function_arg().unwrap();
        let decl = match arg_stub.type_decl {
            Some(decl) => decl,
            None => return Err(format!("argument {} has no type", i)),
        };
        if !match_property_type(registry, engine_param.ty, stub_func.at(decl)) {
            return Err(format!(
                "argument '{}' is '{}' in the engine but '{}' in scripts",
                arg_ref.name(),
                registry.type_def(engine_param.ty).name,
                stub_func.slab.type_decl_name(decl)
            ));
        }
        if arg_ref.flags().contains(StubFlags::OUT) {
            if !engine_param.flags.contains(ParamFlags::REF) {
                return Err(format!(
                    "output argument '{}' is not passed by reference in the engine",
                    arg_ref.name()
                ));
            }
            if engine_param.flags.contains(ParamFlags::CONST) {
                return Err(format!(
                    "output argument '{}' is declared constant in the engine",
                    arg_ref.name()
                ));
            }
        } else if arg_ref.flags().contains(StubFlags::REF) {
            if !engine_param.flags.contains(ParamFlags::REF) {
                log::warn!(
                    "argument '{}' of '{}' is not passed by reference in the engine and will be copied",
                    arg_ref.name(),
                    stub_func.name()
                );
            }
        } else if engine_param.flags.contains(ParamFlags::REF) {
            log::warn!(
                "argument '{}' of '{}' is passed by value in scripts but by reference in the engine",
                arg_ref.name(),
                stub_func.name()
            );
        }
    }

    let stub_static = stub_func.flags().contains(StubFlags::STATIC)
        || stub_func.owning_class().is_none();
    if stub_static != engine_func.is_static {
        return Err("static-ness differs between scripts and the engine".to_owned());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_storage_widths() {
        let n = |s: &str| Name::new(s);
        assert_eq!(enum_storage(&[(n("A"), 1), (n("B"), 200)]), (1, false));
        assert_eq!(enum_storage(&[(n("A"), 0), (n("B"), 300)]), (2, false));
        assert_eq!(enum_storage(&[(n("A"), -1), (n("B"), 100)]), (1, true));
        assert_eq!(enum_storage(&[(n("A"), -200), (n("B"), 100)]), (2, true));
        assert_eq!(enum_storage(&[(n("A"), 0), (n("B"), 1 << 40)]), (8, false));
        assert_eq!(enum_storage(&[]), (1, false));
    }
}
