//! The portable module container: a packed byte buffer paired with the
//! stub graph unpacked from it. The packed form is the durable one; the
//! slab is rebuilt from it on every load.

use crate::{
    codec,
    error::FormatError,
    stub::{self, StubFlags, StubId, StubSlab, StubType},
};
use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::Path;
use thiserror::Error;

/// A serialized compiled script module together with its unpacked form.
#[derive(Clone, Debug)]
pub struct PortableData {
    packed: Vec<u8>,
    slab: StubSlab,
    export_module: Option<StubId>,
    all_stubs: Vec<StubId>,
}

impl PortableData {
    /// Load from packed bytes. The buffer is kept; the slab is unpacked
    /// into fresh storage and its derived maps rebuilt.
    pub fn from_packed(packed: Vec<u8>) -> Result<PortableData, FormatError> {
        let slab = codec::unpack(&packed)?;
        Ok(PortableData::with_slab(packed, slab))
    }

    /// Pack everything reachable from `root` and immediately reload it, so
    /// the returned graph is exactly what a consumer of the packed bytes
    /// will see.
    pub fn create(slab: &StubSlab, root: StubId) -> Result<PortableData, FormatError> {
        let packed = codec::pack(slab, root)?;
        PortableData::from_packed(packed)
    }

    fn with_slab(packed: Vec<u8>, slab: StubSlab) -> PortableData {
        let export_module = slab
            .iter()
            .find(|(_, stub)| {
                stub.stub_type() == StubType::Module && !stub.flags.contains(StubFlags::IMPORT)
            })
            .map(|(id, _)| id);
        // Opcodes are only interesting to the code-block builder, which
        // walks them through their function; everyone else gets the flat
        // declaration list.
        let all_stubs = slab
            .iter()
            .filter(|(_, stub)| stub.stub_type() != StubType::Opcode)
            .map(|(id, _)| id)
            .collect();
        PortableData {
            packed,
            slab,
            export_module,
            all_stubs,
        }
    }

    pub fn packed(&self) -> &[u8] {
        &self.packed
    }

    pub fn slab(&self) -> &StubSlab {
        &self.slab
    }

    /// The module this package defines (as opposed to import clones).
    pub fn export_module(&self) -> Option<StubId> {
        self.export_module
    }

    /// Every stub except opcodes, in wire order.
    pub fn all_stubs(&self) -> &[StubId] {
        &self.all_stubs
    }

    /// Produce a stripped copy of this module fit for publishing as an
    /// import-only dependency: function bodies are dropped and every
    /// declaration is flagged as an import.
    pub fn create_import_pack(&self) -> Result<PortableData, FormatError> {
        let mut slab = self.slab.clone();
        let module = match self.export_module {
            Some(module) => module,
            None => return PortableData::create(&slab, self.all_stubs[0]),
        };

        let used: HashSet<StubId> = slab
            .iter()
            .filter(|(_, stub)| stub.stub_type() != StubType::Opcode)
            .map(|(id, _)| id)
            .collect();
        let mut removed = 0;
        stub::prune_module(&mut slab, module, &used, &mut removed);
        log::info!("Pruned {} stubs for import pack", removed);

        for id in slab.ids().collect::<Vec<_>>() {
            let stub = slab.get_mut(id);
            match stub.stub_type() {
                StubType::Class
                | StubType::Enum
                | StubType::Function
                | StubType::Property
                | StubType::Constant => stub.flags |= StubFlags::IMPORT,
                _ => {}
            }
        }

        slab.post_load();
        PortableData::create(&slab, module)
    }
}

//---

const MODULE_MAGIC: &[u8; 4] = b"SVMC";

/// Errors reading or writing a compiled module file.
#[derive(Debug, Error)]
pub enum ModuleFileError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error("not a compiled script module (bad magic)")]
    BadMagic,
}

/// A compiled module as stored on disk: package name plus the packed stub
/// stream. This is the unit the command-line tooling moves around.
#[derive(Clone, Debug)]
pub struct CompiledModule {
    pub name: String,
    pub data: PortableData,
}

impl CompiledModule {
    pub fn new(name: impl Into<String>, data: PortableData) -> CompiledModule {
        CompiledModule {
            name: name.into(),
            data,
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ModuleFileError> {
        let mut out = std::fs::File::create(path)?;
        out.write_all(MODULE_MAGIC)?;
        let name_bytes = self.name.as_bytes();
        out.write_all(&(name_bytes.len() as u16).to_le_bytes())?;
        out.write_all(name_bytes)?;
        out.write_all(self.data.packed())?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<CompiledModule, ModuleFileError> {
        let mut bytes = Vec::new();
        std::fs::File::open(path)?.read_to_end(&mut bytes)?;
        if bytes.len() < 6 || &bytes[0..4] != MODULE_MAGIC {
            return Err(ModuleFileError::BadMagic);
        }
        let name_len = u16::from_le_bytes([bytes[4], bytes[5]]) as usize;
        if bytes.len() < 6 + name_len {
            return Err(ModuleFileError::BadMagic);
        }
        let name = String::from_utf8(bytes[6..6 + name_len].to_vec())
            .map_err(|_| ModuleFileError::BadMagic)?;
        let data = PortableData::from_packed(bytes[6 + name_len..].to_vec())?;
        Ok(CompiledModule { name, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name::Name;
    use crate::stub::{FileStub, FunctionStub, ModuleStub, OpcodeStub, Stub, StubBody};

    fn module_with_function() -> (StubSlab, StubId) {
        let mut slab = StubSlab::new();
        let module = slab.alloc(Stub::new(
            Name::new("pkg"),
            None,
            StubBody::Module(ModuleStub::default()),
        ));
        let file = slab.alloc(Stub::new(
            Name::none(),
            Some(module),
            StubBody::File(FileStub {
                depot_path: "pkg/a.bsc".into(),
                absolute_path: "/depot/pkg/a.bsc".into(),
                ..Default::default()
            }),
        ));
        let func = slab.alloc(Stub::new(
            Name::new("tick"),
            Some(module),
            StubBody::Function(FunctionStub::default()),
        ));
        let op = slab.alloc(Stub::new(
            Name::none(),
            Some(func),
            StubBody::Opcode(OpcodeStub::default()),
        ));
        slab.get_mut(func).as_function_mut().unwrap().opcodes.push(op);
        slab.get_mut(file).as_file_mut().unwrap().stubs.push(func);
        slab.get_mut(module).as_module_mut().unwrap().files.push(file);
        slab.post_load();
        (slab, module)
    }

    #[test]
    fn test_export_module_found() {
        let (slab, module) = module_with_function();
        let data = PortableData::create(&slab, module).unwrap();
        assert!(data.export_module().is_some());
        // Opcode stubs are excluded from the flat list
        assert_eq!(data.all_stubs().len(), 3);
    }

    #[test]
    fn test_import_pack_drops_code() {
        let (slab, module) = module_with_function();
        let data = PortableData::create(&slab, module).unwrap();
        let pack = data.create_import_pack().unwrap();

        let (func_id, func) = pack
            .slab()
            .iter()
            .find(|(_, stub)| stub.stub_type() == StubType::Function)
            .unwrap();
        assert!(func.flags.contains(StubFlags::IMPORT));
        assert!(func.as_function().unwrap().opcodes.is_empty());
        assert_eq!(pack.slab().full_name(func_id), "pkg.tick");
    }
}
