//! Packing and unpacking of stub graphs.
//!
//! Packing runs in two passes. Pass one walks the graph breadth-first with
//! a [StubMapper]: every stub's fields are "written" against it, but the
//! mapper only records strings, names and references, assigning each unique
//! one a dense table index (0 stays the null/empty sentinel). Pass two
//! replays the same writes against a [StubEmitter] that produces bytes:
//! name table, string table, stub tags, then every stub body with
//! references encoded as their pass-one indices.
//!
//! Unpacking reverses this: rebuild the intern tables, allocate a shell
//! stub per tag, then fill each shell's fields; since references decode by
//! table index, forward and backward references resolve uniformly. Every
//! index read from the wire is bounds-checked.

use crate::{
    error::FormatError,
    name::Name,
    opcodes::{Immediate, Opcode},
    stub::{
        ConstValue, Location, Stub, StubBody, StubFlags, StubId, StubSlab, StubType, TypeDeclKind,
    },
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::convert::{TryFrom, TryInto};

/// Field consumer shared by the mapping and emitting passes. Numeric writes
/// are no-ops during mapping; strings, names and references are what the
/// mapper cares about.
pub trait StubSink {
    fn write_bool(&mut self, v: bool) {
        self.write_u8(v as u8)
    }
    fn write_i8(&mut self, v: i8);
    fn write_i16(&mut self, v: i16);
    fn write_i32(&mut self, v: i32);
    fn write_i64(&mut self, v: i64);
    fn write_u8(&mut self, v: u8);
    fn write_u16(&mut self, v: u16);
    fn write_u32(&mut self, v: u32);
    fn write_u64(&mut self, v: u64);
    fn write_f32(&mut self, v: f32);
    fn write_f64(&mut self, v: f64);
    fn write_str(&mut self, v: &str);
    fn write_name(&mut self, v: Name);
    fn write_ref(&mut self, v: Option<StubId>);

    fn write_ref_list(&mut self, refs: &[StubId]) {
        self.write_u32(refs.len() as u32);
        for &id in refs {
            self.write_ref(Some(id));
        }
    }
}

//--- pass 1: mapping -----------------------------------------------------

/// Breadth-first graph explorer that assigns dense indices to every
/// reachable stub and interns all strings and names.
#[derive(Default)]
pub struct StubMapper {
    /// Reachable stubs in discovery order; slot 0 is the null sentinel
    pub stubs: Vec<Option<StubId>>,
    pub strings: Vec<String>,
    pub names: Vec<Name>,
    stub_ids: HashMap<StubId, u16>,
    string_ids: HashMap<String, u16>,
    name_ids: HashMap<Name, u16>,
    queue: VecDeque<StubId>,
    seen: HashSet<StubId>,
}

impl StubMapper {
    pub fn new() -> StubMapper {
        StubMapper {
            stubs: vec![None],
            strings: vec![String::new()],
            names: vec![Name::none()],
            ..Default::default()
        }
    }

    /// Map everything reachable from `root`.
    pub fn map(slab: &StubSlab, root: StubId) -> Result<StubMapper, FormatError> {
        let mut mapper = StubMapper::new();
        mapper.write_ref(Some(root));
        while let Some(id) = mapper.queue.pop_front() {
            write_stub(slab.get(id), &mut mapper);
        }
        if mapper.stubs.len() > u16::MAX as usize + 1 {
            return Err(FormatError::TooManyStubs(mapper.stubs.len()));
        }
        Ok(mapper)
    }

    pub fn stub_id(&self, id: Option<StubId>) -> u16 {
        match id {
            Some(id) => *self
                .stub_ids
                .get(&id)
                .expect("reference to a stub the mapping pass never reached"),
            None => 0,
        }
    }

    fn string_id(&self, text: &str) -> u16 {
        if text.is_empty() {
            0
        } else {
            *self.string_ids.get(text).expect("unmapped string")
        }
    }

    fn name_id(&self, name: Name) -> u16 {
        if name.is_empty() {
            0
        } else {
            *self.name_ids.get(&name).expect("unmapped name")
        }
    }
}

impl StubSink for StubMapper {
    fn write_i8(&mut self, _: i8) {}
    fn write_i16(&mut self, _: i16) {}
    fn write_i32(&mut self, _: i32) {}
    fn write_i64(&mut self, _: i64) {}
    fn write_u8(&mut self, _: u8) {}
    fn write_u16(&mut self, _: u16) {}
    fn write_u32(&mut self, _: u32) {}
    fn write_u64(&mut self, _: u64) {}
    fn write_f32(&mut self, _: f32) {}
    fn write_f64(&mut self, _: f64) {}

    fn write_str(&mut self, v: &str) {
        if !v.is_empty() && !self.string_ids.contains_key(v) {
            let id = self.strings.len() as u16;
            self.strings.push(v.to_owned());
            self.string_ids.insert(v.to_owned(), id);
        }
    }

    fn write_name(&mut self, v: Name) {
        if !v.is_empty() && !self.name_ids.contains_key(&v) {
            let id = self.names.len() as u16;
            self.names.push(v);
            self.name_ids.insert(v, id);
        }
    }

    fn write_ref(&mut self, v: Option<StubId>) {
        if let Some(id) = v {
            if !self.stub_ids.contains_key(&id) {
                let wire = self.stubs.len() as u16;
                self.stubs.push(Some(id));
                self.stub_ids.insert(id, wire);
            }
            if self.seen.insert(id) {
                self.queue.push_back(id);
            }
        }
    }
}

//--- pass 2: emission ----------------------------------------------------

/// Byte producer for the second pass. All numerics are little-endian.
pub struct StubEmitter<'a> {
    mapper: &'a StubMapper,
    out: Vec<u8>,
}

impl<'a> StubEmitter<'a> {
    pub fn new(mapper: &'a StubMapper) -> StubEmitter<'a> {
        StubEmitter {
            mapper,
            out: Vec::with_capacity(4096),
        }
    }

    fn write_raw_str(&mut self, text: &str) {
        self.write_u16(text.len() as u16);
        self.out.extend_from_slice(text.as_bytes());
    }

    /// Emit the full container: intern tables, tags, then stub bodies.
    pub fn write_containers(mut self, slab: &StubSlab) -> Vec<u8> {
        self.write_u16(self.mapper.names.len() as u16);
        for i in 1..self.mapper.names.len() {
            let name = self.mapper.names[i];
            self.write_raw_str(name.as_str());
        }

        self.write_u16(self.mapper.strings.len() as u16);
        for i in 1..self.mapper.strings.len() {
            let text = self.mapper.strings[i].clone();
            self.write_raw_str(&text);
        }

        self.write_u32(self.mapper.stubs.len() as u32);
        for i in 1..self.mapper.stubs.len() {
            let id = self.mapper.stubs[i].unwrap();
            self.write_u8(slab.get(id).stub_type().into());
        }

        for i in 1..self.mapper.stubs.len() {
            let id = self.mapper.stubs[i].unwrap();
            write_stub(slab.get(id), &mut self);
        }

        self.out
    }
}

impl StubSink for StubEmitter<'_> {
    fn write_i8(&mut self, v: i8) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }
    fn write_i16(&mut self, v: i16) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }
    fn write_i32(&mut self, v: i32) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }
    fn write_i64(&mut self, v: i64) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }
    fn write_u8(&mut self, v: u8) {
        self.out.push(v);
    }
    fn write_u16(&mut self, v: u16) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }
    fn write_u32(&mut self, v: u32) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }
    fn write_u64(&mut self, v: u64) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }
    fn write_f32(&mut self, v: f32) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }
    fn write_f64(&mut self, v: f64) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }
    fn write_str(&mut self, v: &str) {
        let id = self.mapper.string_id(v);
        self.write_u16(id);
    }
    fn write_name(&mut self, v: Name) {
        let id = self.mapper.name_id(v);
        self.write_u16(id);
    }
    fn write_ref(&mut self, v: Option<StubId>) {
        let id = self.mapper.stub_id(v);
        self.write_u16(id);
    }
}

/// Pack everything reachable from `root` into a byte buffer.
pub fn pack(slab: &StubSlab, root: StubId) -> Result<Vec<u8>, FormatError> {
    let mapper = StubMapper::map(slab, root)?;
    log::debug!(
        "Mapped {} stubs, {} names, {} strings",
        mapper.stubs.len() - 1,
        mapper.names.len() - 1,
        mapper.strings.len() - 1,
    );
    let data = StubEmitter::new(&mapper).write_containers(slab);
    log::debug!("Packed script data size: {} bytes", data.len());
    log_stub_stats("Saved script stubs", slab, mapper.stubs.iter().flatten().copied());
    Ok(data)
}

//--- unpacking -----------------------------------------------------------

/// Bounds-checked little-endian reader over a packed buffer.
pub struct StubReader<'a> {
    data: &'a [u8],
    pos: usize,
    names: Vec<Name>,
    strings: Vec<String>,
    stub_count: u32,
}

macro_rules! read_le {
    ($fn:ident, $ty:ty) => {
        pub fn $fn(&mut self) -> Result<$ty, FormatError> {
            let bytes = self.take(std::mem::size_of::<$ty>())?;
            Ok(<$ty>::from_le_bytes(bytes.try_into().unwrap()))
        }
    };
}

impl<'a> StubReader<'a> {
    pub fn new(data: &'a [u8]) -> StubReader<'a> {
        StubReader {
            data,
            pos: 0,
            names: Vec::new(),
            strings: Vec::new(),
            stub_count: 0,
        }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], FormatError> {
        if self.pos + len > self.data.len() {
            return Err(FormatError::UnexpectedEnd { offset: self.pos });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    read_le!(read_i8, i8);
    read_le!(read_i16, i16);
    read_le!(read_i32, i32);
    read_le!(read_i64, i64);
    read_le!(read_u8, u8);
    read_le!(read_u16, u16);
    read_le!(read_u32, u32);
    read_le!(read_u64, u64);
    read_le!(read_f32, f32);
    read_le!(read_f64, f64);

    pub fn read_bool(&mut self) -> Result<bool, FormatError> {
        Ok(self.read_u8()? != 0)
    }

    fn read_raw_str(&mut self) -> Result<String, FormatError> {
        let offset = self.pos;
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| FormatError::BadString { offset })
    }

    pub fn read_name(&mut self) -> Result<Name, FormatError> {
        let id = self.read_u16()? as u32;
        if id == 0 {
            return Ok(Name::none());
        }
        if id as usize >= self.names.len() {
            return Err(FormatError::BadIndex {
                kind: "name",
                index: id,
                len: self.names.len() as u32,
            });
        }
        Ok(self.names[id as usize])
    }

    pub fn read_str(&mut self) -> Result<String, FormatError> {
        let id = self.read_u16()? as u32;
        if id == 0 {
            return Ok(String::new());
        }
        if id as usize >= self.strings.len() {
            return Err(FormatError::BadIndex {
                kind: "string",
                index: id,
                len: self.strings.len() as u32,
            });
        }
        Ok(self.strings[id as usize].clone())
    }

    pub fn read_ref(&mut self) -> Result<Option<StubId>, FormatError> {
        let id = self.read_u16()? as u32;
        if id >= self.stub_count && id != 0 {
            return Err(FormatError::BadIndex {
                kind: "stub",
                index: id,
                len: self.stub_count,
            });
        }
        Ok(StubId::from_index(id))
    }

    pub fn read_ref_list(&mut self) -> Result<Vec<StubId>, FormatError> {
        let count = self.read_u32()? as usize;
        let mut refs = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            match self.read_ref()? {
                Some(id) => refs.push(id),
                None => {
                    return Err(FormatError::BadIndex {
                        kind: "stub",
                        index: 0,
                        len: self.stub_count,
                    })
                }
            }
        }
        Ok(refs)
    }
}

/// Unpack a packed buffer into a fresh slab. Slab ids equal wire indices,
/// and derived name maps are rebuilt before returning.
pub fn unpack(data: &[u8]) -> Result<StubSlab, FormatError> {
    let mut reader = StubReader::new(data);

    let name_count = reader.read_u16()? as usize;
    reader.names = Vec::with_capacity(name_count);
    reader.names.push(Name::none());
    for _ in 1..name_count {
        let text = reader.read_raw_str()?;
        reader.names.push(Name::new(&text));
    }

    let string_count = reader.read_u16()? as usize;
    reader.strings = Vec::with_capacity(string_count);
    reader.strings.push(String::new());
    for _ in 1..string_count {
        let text = reader.read_raw_str()?;
        reader.strings.push(text);
    }

    reader.stub_count = reader.read_u32()?;
    if reader.stub_count as usize > u16::MAX as usize + 1 {
        return Err(FormatError::TooManyStubs(reader.stub_count as usize));
    }

    let mut slab = StubSlab::new();
    for _ in 1..reader.stub_count {
        let tag = reader.read_u8()?;
        let stub_type = StubType::try_from(tag).map_err(|_| FormatError::BadStubType(tag))?;
        let shell = Stub::shell(stub_type).ok_or(FormatError::BadStubType(tag))?;
        slab.alloc(shell);
    }

    for index in 1..reader.stub_count {
        let id = StubId::from_index(index).unwrap();
        let mut stub = slab.get(id).clone();
        read_stub(&mut stub, &mut reader)?;
        *slab.get_mut(id) = stub;
    }

    slab.post_load();
    log_stub_stats("Loaded script stubs", &slab, slab.ids());
    Ok(slab)
}

fn log_stub_stats(label: &str, slab: &StubSlab, ids: impl Iterator<Item = StubId>) {
    if !log::log_enabled!(log::Level::Debug) {
        return;
    }
    let mut counts: HashMap<StubType, usize> = HashMap::new();
    for id in ids {
        *counts.entry(slab.get(id).stub_type()).or_default() += 1;
    }
    log::debug!("{}:", label);
    let mut entries: Vec<_> = counts.into_iter().collect();
    entries.sort_by_key(|&(ty, _)| u8::from(ty));
    for (ty, count) in entries {
        log::debug!("  {:?}: {}", ty, count);
    }
}

//--- per-stub field layout -----------------------------------------------

fn write_common(stub: &Stub, sink: &mut dyn StubSink) {
    sink.write_ref(stub.owner);
    sink.write_ref(stub.location.file);
    sink.write_u32(stub.location.line);
    sink.write_u32(stub.flags.bits());
    sink.write_name(stub.name);
}

fn read_common(stub: &mut Stub, reader: &mut StubReader<'_>) -> Result<(), FormatError> {
    stub.owner = reader.read_ref()?;
    stub.location = Location {
        file: reader.read_ref()?,
        line: reader.read_u32()?,
    };
    stub.flags = StubFlags::from_bits_truncate(reader.read_u32()?);
    stub.name = reader.read_name()?;
    Ok(())
}

/// Serialize one stub's fields against a sink. Used both for mapping and
/// for emission, so the two passes cannot drift apart.
pub fn write_stub(stub: &Stub, sink: &mut dyn StubSink) {
    write_common(stub, sink);
    match &stub.body {
        StubBody::Module(module) => {
            sink.write_ref_list(&module.files);
            sink.write_ref_list(&module.imports);
        }
        StubBody::ModuleImport(import) => {
            sink.write_ref(import.imported_module);
        }
        StubBody::File(file) => {
            sink.write_ref_list(&file.stubs);
            sink.write_str(&file.depot_path);
            sink.write_str(&file.absolute_path);
        }
        StubBody::TypeName(alias) => {
            sink.write_ref(alias.linked_type);
        }
        StubBody::TypeDecl(decl) => {
            sink.write_u8(decl.kind.into());
            match decl.kind {
                TypeDeclKind::Simple
                | TypeDeclKind::ClassType
                | TypeDeclKind::PtrType
                | TypeDeclKind::WeakPtrType => sink.write_ref(decl.referenced),
                TypeDeclKind::Engine => {}
                TypeDeclKind::DynamicArray => sink.write_ref(decl.inner),
                TypeDeclKind::StaticArray => {
                    sink.write_ref(decl.inner);
                    sink.write_u32(decl.array_size);
                }
            }
        }
        StubBody::TypeRef(type_ref) => {
            sink.write_ref(type_ref.resolved);
        }
        StubBody::Class(class) => {
            sink.write_name(class.base_class_name);
            sink.write_name(class.parent_class_name);
            sink.write_name(class.engine_import_name);
            sink.write_ref(class.base_class);
            sink.write_ref_list(&class.derived_classes);
            sink.write_ref(class.parent_class);
            sink.write_ref_list(&class.child_classes);
            sink.write_ref_list(&class.stubs);
        }
        StubBody::Constant(constant) => {
            sink.write_ref(constant.type_decl);
            sink.write_ref(constant.value);
        }
        StubBody::ConstantValue(value) => write_const_value(&value.value, sink),
        StubBody::Enum(enum_stub) => {
            if stub.flags.contains(StubFlags::IMPORT) {
                sink.write_name(enum_stub.engine_import_name);
            }
            sink.write_ref_list(&enum_stub.options);
        }
        StubBody::EnumOption(option) => {
            sink.write_bool(option.has_user_value);
            if option.has_user_value {
                sink.write_i64(option.assigned_value);
            }
        }
        StubBody::Property(property) => {
            sink.write_ref(property.type_decl);
            sink.write_ref(property.default_value);
        }
        StubBody::Function(function) => {
            if stub.flags.contains(StubFlags::OPERATOR) {
                sink.write_name(function.operator_name);
            }
            if stub.flags.contains(StubFlags::CAST) {
                sink.write_i8(function.cast_cost);
            }
            if stub.flags.contains(StubFlags::OPCODE) {
                sink.write_name(function.opcode_name);
            }
            if stub.flags.contains(StubFlags::FUNCTION) {
                sink.write_name(function.alias_name);
            }
            sink.write_ref(function.return_type);
            sink.write_ref(function.base_function);
            sink.write_ref(function.parent_function);
            sink.write_u64(function.code_hash);
            sink.write_ref_list(&function.args);
            if !stub.flags.contains(StubFlags::OPCODE) {
                sink.write_ref_list(&function.opcodes);
            }
        }
        StubBody::FunctionArg(arg) => {
            sink.write_i16(arg.index);
            sink.write_ref(arg.type_decl);
            sink.write_ref(arg.default_value);
        }
        StubBody::Opcode(opcode) => write_opcode_stub(opcode, sink),
    }
}

fn read_stub(stub: &mut Stub, reader: &mut StubReader<'_>) -> Result<(), FormatError> {
    read_common(stub, reader)?;
    match &mut stub.body {
        StubBody::Module(module) => {
            module.files = reader.read_ref_list()?;
            module.imports = reader.read_ref_list()?;
        }
        StubBody::ModuleImport(import) => {
            import.imported_module = reader.read_ref()?;
        }
        StubBody::File(file) => {
            file.stubs = reader.read_ref_list()?;
            file.depot_path = reader.read_str()?;
            file.absolute_path = reader.read_str()?;
        }
        StubBody::TypeName(alias) => {
            alias.linked_type = reader.read_ref()?;
        }
        StubBody::TypeDecl(decl) => {
            let kind = reader.read_u8()?;
            decl.kind =
                TypeDeclKind::try_from(kind).map_err(|_| FormatError::BadStubType(kind))?;
            match decl.kind {
                TypeDeclKind::Simple
                | TypeDeclKind::ClassType
                | TypeDeclKind::PtrType
                | TypeDeclKind::WeakPtrType => decl.referenced = reader.read_ref()?,
                TypeDeclKind::Engine => {}
                TypeDeclKind::DynamicArray => decl.inner = reader.read_ref()?,
                TypeDeclKind::StaticArray => {
                    decl.inner = reader.read_ref()?;
                    decl.array_size = reader.read_u32()?;
                }
            }
        }
        StubBody::TypeRef(type_ref) => {
            type_ref.resolved = reader.read_ref()?;
        }
        StubBody::Class(class) => {
            class.base_class_name = reader.read_name()?;
            class.parent_class_name = reader.read_name()?;
            class.engine_import_name = reader.read_name()?;
            class.base_class = reader.read_ref()?;
            class.derived_classes = reader.read_ref_list()?;
            class.parent_class = reader.read_ref()?;
            class.child_classes = reader.read_ref_list()?;
            class.stubs = reader.read_ref_list()?;
        }
        StubBody::Constant(constant) => {
            constant.type_decl = reader.read_ref()?;
            constant.value = reader.read_ref()?;
        }
        StubBody::ConstantValue(value) => {
            value.value = read_const_value(reader)?;
        }
        StubBody::Enum(enum_stub) => {
            if stub.flags.contains(StubFlags::IMPORT) {
                enum_stub.engine_import_name = reader.read_name()?;
            }
            enum_stub.options = reader.read_ref_list()?;
        }
        StubBody::EnumOption(option) => {
            option.has_user_value = reader.read_bool()?;
            option.assigned_value = if option.has_user_value {
                reader.read_i64()?
            } else {
                0
            };
        }
        StubBody::Property(property) => {
            property.type_decl = reader.read_ref()?;
            property.default_value = reader.read_ref()?;
        }
        StubBody::Function(function) => {
            if stub.flags.contains(StubFlags::OPERATOR) {
                function.operator_name = reader.read_name()?;
            }
            if stub.flags.contains(StubFlags::CAST) {
                function.cast_cost = reader.read_i8()?;
            }
            if stub.flags.contains(StubFlags::OPCODE) {
                function.opcode_name = reader.read_name()?;
            }
            if stub.flags.contains(StubFlags::FUNCTION) {
                function.alias_name = reader.read_name()?;
            }
            function.return_type = reader.read_ref()?;
            function.base_function = reader.read_ref()?;
            function.parent_function = reader.read_ref()?;
            function.code_hash = reader.read_u64()?;
            function.args = reader.read_ref_list()?;
            if !stub.flags.contains(StubFlags::OPCODE) {
                function.opcodes = reader.read_ref_list()?;
            }
        }
        StubBody::FunctionArg(arg) => {
            arg.index = reader.read_i16()?;
            arg.type_decl = reader.read_ref()?;
            arg.default_value = reader.read_ref()?;
        }
        StubBody::Opcode(opcode) => read_opcode_stub(opcode, reader)?,
    }
    Ok(())
}

fn write_const_value(value: &ConstValue, sink: &mut dyn StubSink) {
    match value {
        ConstValue::Integer(v) => {
            sink.write_u8(0);
            sink.write_i64(*v);
        }
        ConstValue::Unsigned(v) => {
            sink.write_u8(1);
            sink.write_u64(*v);
        }
        ConstValue::Float(v) => {
            sink.write_u8(2);
            sink.write_f64(*v);
        }
        ConstValue::Bool(v) => {
            sink.write_u8(3);
            sink.write_bool(*v);
        }
        ConstValue::String(v) => {
            sink.write_u8(4);
            sink.write_str(v);
        }
        ConstValue::Name(v) => {
            sink.write_u8(5);
            sink.write_name(*v);
        }
        ConstValue::Compound { type_decl, values } => {
            sink.write_u8(6);
            sink.write_ref(*type_decl);
            sink.write_ref_list(values);
        }
    }
}

fn read_const_value(reader: &mut StubReader<'_>) -> Result<ConstValue, FormatError> {
    let tag = reader.read_u8()?;
    Ok(match tag {
        0 => ConstValue::Integer(reader.read_i64()?),
        1 => ConstValue::Unsigned(reader.read_u64()?),
        2 => ConstValue::Float(reader.read_f64()?),
        3 => ConstValue::Bool(reader.read_bool()?),
        4 => ConstValue::String(reader.read_str()?),
        5 => ConstValue::Name(reader.read_name()?),
        6 => ConstValue::Compound {
            type_decl: reader.read_ref()?,
            values: reader.read_ref_list()?,
        },
        other => return Err(FormatError::BadStubType(other)),
    })
}

fn write_opcode_stub(opcode: &crate::stub::OpcodeStub, sink: &mut dyn StubSink) {
    sink.write_u16(opcode.op.into());
    match opcode.op {
        Opcode::IntConst1 => sink.write_i8(opcode.value.as_int() as i8),
        Opcode::IntConst2 => sink.write_i16(opcode.value.as_int() as i16),
        Opcode::IntConst4 => sink.write_i32(opcode.value.as_int() as i32),
        Opcode::IntConst8 => sink.write_i64(opcode.value.as_int()),
        Opcode::UintConst1 => sink.write_u8(opcode.value.as_uint() as u8),
        Opcode::UintConst2 => sink.write_u16(opcode.value.as_uint() as u16),
        Opcode::UintConst4 => sink.write_u32(opcode.value.as_uint() as u32),
        Opcode::UintConst8 => sink.write_u64(opcode.value.as_uint()),
        Opcode::FloatConst => sink.write_f32(match opcode.value {
            Immediate::Float(v) => v,
            _ => 0.0,
        }),
        Opcode::DoubleConst => sink.write_f64(match opcode.value {
            Immediate::Double(v) => v,
            _ => 0.0,
        }),
        Opcode::StringConst => sink.write_str(match &opcode.value {
            Immediate::Text(text) => text,
            _ => "",
        }),
        Opcode::NameConst => sink.write_name(opcode.value.as_name()),

        Opcode::TestEqual
        | Opcode::TestNotEqual
        | Opcode::DynamicCast
        | Opcode::DynamicWeakCast
        | Opcode::MetaCast
        | Opcode::New
        | Opcode::AssignAny
        | Opcode::LoadAny
        | Opcode::ReturnAny
        | Opcode::ReturnDirect
        | Opcode::ReturnLoad1
        | Opcode::ReturnLoad2
        | Opcode::ReturnLoad4
        | Opcode::ReturnLoad8
        | Opcode::ContextCtor
        | Opcode::ContextDtor
        | Opcode::ContextFromValue
        | Opcode::StructMember
        | Opcode::StructMemberRef
        | Opcode::EnumToInt32
        | Opcode::EnumToInt64
        | Opcode::EnumToName
        | Opcode::EnumToString
        | Opcode::Int32ToEnum
        | Opcode::Int64ToEnum
        | Opcode::NameToEnum
        | Opcode::ClassConst => sink.write_ref(opcode.stub),

        Opcode::Jump | Opcode::JumpIfFalse | Opcode::LogicAnd | Opcode::LogicOr => {
            sink.write_ref(opcode.target)
        }

        Opcode::ContextFromRef | Opcode::ContextFromPtr | Opcode::ContextFromPtrRef => {
            sink.write_ref(opcode.stub);
            sink.write_ref(opcode.target);
        }

        Opcode::ParamVar => sink.write_i8(opcode.value.as_int() as i8),

        Opcode::LocalVar | Opcode::LocalCtor | Opcode::LocalDtor => {
            sink.write_ref(opcode.stub);
            match opcode.value {
                Immediate::NamedSlot { name, index } => {
                    sink.write_name(name);
                    sink.write_u16(index);
                }
                _ => {
                    sink.write_name(Name::none());
                    sink.write_u16(0);
                }
            }
        }

        Opcode::ContextVar => {
            sink.write_ref(opcode.stub);
            sink.write_name(opcode.value.as_name());
        }

        Opcode::StaticFunc | Opcode::FinalFunc | Opcode::VirtualFunc | Opcode::InternalFunc => {
            sink.write_ref(opcode.stub);
            sink.write_u64(opcode.value.as_uint());
        }

        Opcode::Constructor => {
            sink.write_ref(opcode.stub);
            sink.write_u8(opcode.value.as_uint() as u8);
        }

        Opcode::EnumConst => {
            sink.write_ref(opcode.stub);
            sink.write_name(opcode.value.as_name());
        }

        _ => {}
    }
}

fn read_opcode_stub(
    opcode: &mut crate::stub::OpcodeStub,
    reader: &mut StubReader<'_>,
) -> Result<(), FormatError> {
    let id = reader.read_u16()?;
    opcode.op = Opcode::try_from(id).map_err(|_| FormatError::BadOpcode(id))?;
    match opcode.op {
        Opcode::IntConst1 => opcode.value = Immediate::Int(reader.read_i8()? as i64),
        Opcode::IntConst2 => opcode.value = Immediate::Int(reader.read_i16()? as i64),
        Opcode::IntConst4 => opcode.value = Immediate::Int(reader.read_i32()? as i64),
        Opcode::IntConst8 => opcode.value = Immediate::Int(reader.read_i64()?),
        Opcode::UintConst1 => opcode.value = Immediate::Uint(reader.read_u8()? as u64),
        Opcode::UintConst2 => opcode.value = Immediate::Uint(reader.read_u16()? as u64),
        Opcode::UintConst4 => opcode.value = Immediate::Uint(reader.read_u32()? as u64),
        Opcode::UintConst8 => opcode.value = Immediate::Uint(reader.read_u64()?),
        Opcode::FloatConst => opcode.value = Immediate::Float(reader.read_f32()?),
        Opcode::DoubleConst => opcode.value = Immediate::Double(reader.read_f64()?),
        Opcode::StringConst => opcode.value = Immediate::Text(reader.read_str()?),
        Opcode::NameConst => opcode.value = Immediate::Name(reader.read_name()?),

        Opcode::TestEqual
        | Opcode::TestNotEqual
        | Opcode::DynamicCast
        | Opcode::DynamicWeakCast
        | Opcode::MetaCast
        | Opcode::New
        | Opcode::AssignAny
        | Opcode::LoadAny
        | Opcode::ReturnAny
        | Opcode::ReturnDirect
        | Opcode::ReturnLoad1
        | Opcode::ReturnLoad2
        | Opcode::ReturnLoad4
        | Opcode::ReturnLoad8
        | Opcode::ContextCtor
        | Opcode::ContextDtor
        | Opcode::ContextFromValue
        | Opcode::StructMember
        | Opcode::StructMemberRef
        | Opcode::EnumToInt32
        | Opcode::EnumToInt64
        | Opcode::EnumToName
        | Opcode::EnumToString
        | Opcode::Int32ToEnum
        | Opcode::Int64ToEnum
        | Opcode::NameToEnum
        | Opcode::ClassConst => opcode.stub = reader.read_ref()?,

        Opcode::Jump | Opcode::JumpIfFalse | Opcode::LogicAnd | Opcode::LogicOr => {
            opcode.target = reader.read_ref()?
        }

        Opcode::ContextFromRef | Opcode::ContextFromPtr | Opcode::ContextFromPtrRef => {
            opcode.stub = reader.read_ref()?;
            opcode.target = reader.read_ref()?;
        }

        Opcode::ParamVar => opcode.value = Immediate::Int(reader.read_i8()? as i64),

        Opcode::LocalVar | Opcode::LocalCtor | Opcode::LocalDtor => {
            opcode.stub = reader.read_ref()?;
            let name = reader.read_name()?;
            let index = reader.read_u16()?;
            opcode.value = Immediate::NamedSlot { name, index };
        }

        Opcode::ContextVar => {
            opcode.stub = reader.read_ref()?;
            opcode.value = Immediate::Name(reader.read_name()?);
        }

        Opcode::StaticFunc | Opcode::FinalFunc | Opcode::VirtualFunc | Opcode::InternalFunc => {
            opcode.stub = reader.read_ref()?;
            opcode.value = Immediate::Uint(reader.read_u64()?);
        }

        Opcode::Constructor => {
            opcode.stub = reader.read_ref()?;
            opcode.value = Immediate::Uint(reader.read_u8()? as u64);
        }

        Opcode::EnumConst => {
            opcode.stub = reader.read_ref()?;
            opcode.value = Immediate::Name(reader.read_name()?);
        }

        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::{FileStub, ModuleStub};

    fn module_with_file() -> (StubSlab, StubId) {
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
        slab.get_mut(module).as_module_mut().unwrap().files.push(file);
        (slab, module)
    }

    #[test]
    fn test_intern_tables_have_no_duplicates() {
        let (mut slab, module) = module_with_file();
        // Same path string referenced twice
        let file2 = slab.alloc(Stub::new(
            Name::none(),
            Some(module),
            StubBody::File(FileStub {
                depot_path: "pkg/a.bsc".into(),
                absolute_path: "/depot/pkg/a.bsc".into(),
                ..Default::default()
            }),
        ));
        slab.get_mut(module).as_module_mut().unwrap().files.push(file2);

        let mapper = StubMapper::map(&slab, module).unwrap();
        let mut seen = std::collections::HashSet::new();
        for text in &mapper.strings {
            assert!(seen.insert(text.clone()), "duplicate string {:?}", text);
        }
        assert_eq!(mapper.strings[0], "");
        assert!(mapper.names[0].is_empty());
    }

    #[test]
    fn test_pack_unpack_empty_module() {
        let (slab, module) = module_with_file();
        let packed = pack(&slab, module).unwrap();
        let loaded = unpack(&packed).unwrap();
        assert_eq!(loaded.len(), 2);
        let root = loaded.ids().next().unwrap();
        assert_eq!(loaded.get(root).name.as_str(), "pkg");
        let file = loaded.get(root).as_module().unwrap().files[0];
        assert_eq!(loaded.get(file).as_file().unwrap().depot_path, "pkg/a.bsc");
    }

    #[test]
    fn test_truncated_data_is_an_error() {
        let (slab, module) = module_with_file();
        let packed = pack(&slab, module).unwrap();
        for cut in 1..packed.len() {
            assert!(unpack(&packed[..cut]).is_err(), "cut at {}", cut);
        }
    }

    #[test]
    fn test_out_of_range_ref_is_an_error() {
        let (slab, module) = module_with_file();
        let mut packed = pack(&slab, module).unwrap();
        // The module body is last; corrupt its file-list entry to point
        // past the stub table.
        let len = packed.len();
        packed[len - 1] = 0xff;
        packed[len - 2] = 0xff;
        assert!(matches!(unpack(&packed), Err(FormatError::BadIndex { .. })));
    }
}
