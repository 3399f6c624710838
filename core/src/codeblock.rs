//! Lowering of portable opcodes into the compact byte stream the
//! interpreter executes. The builder walks a function stub's opcode list in
//! stream order, resolving every referenced stub to a host id through a
//! [StubResolver], laying out local variables, collecting breakpoints and
//! fixing up jumps after emission.
//!
//! A handful of portable opcodes never reach the stream: labels become
//! plain offsets, enum conversions are narrowed to width ops once the enum
//! size is known, typed equality on simple-compare types becomes the
//! width-specialized test, and constructor/destructor opcodes for types
//! that do not need them are dropped entirely.

use crate::{
    error::{Located, TranslateError},
    name::Name,
    opcodes::{Immediate, Opcode},
    registry::{TypeRegistry, MAX_CALL_ARGS},
    stub::{StubId, StubSlab},
    types::TypeId,
};
use std::collections::HashMap;
use std::convert::TryFrom;
use std::sync::atomic::{AtomicBool, Ordering};

/// Per-argument evaluation mode inside a packed calling-encoding word,
/// 4 bits per argument.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ParamMode {
    None = 0,
    /// Evaluate as reference, pass the pointer
    Ref = 1,
    /// Evaluate as a plain value of known width
    SimpleValue = 2,
    /// Evaluate into typed storage taken from the function signature
    TypedValue = 3,
}

/// The packed per-argument calling modes of one call site.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CallEncoding(pub u64);

impl CallEncoding {
    pub fn encode(modes: &[ParamMode]) -> Result<CallEncoding, TranslateError> {
        if modes.len() > MAX_CALL_ARGS {
            return Err(TranslateError::TooManyCallArgs(modes.len()));
        }
        let mut value = 0u64;
        for (i, &mode) in modes.iter().enumerate() {
            value |= (mode as u64) << (4 * i);
        }
        Ok(CallEncoding(value))
    }

    /// Mode of argument `i`.
    pub fn mode(self, i: usize) -> ParamMode {
        match (self.0 >> (4 * i)) & 0xF {
            1 => ParamMode::Ref,
            2 => ParamMode::SimpleValue,
            3 => ParamMode::TypedValue,
            _ => ParamMode::None,
        }
    }
}

/// A resolved class property as the builder needs it: value type, byte
/// offset and whether it lives in the out-of-object scripted buffer.
#[derive(Copy, Clone, Debug)]
pub struct ResolvedProp {
    pub ty: TypeId,
    pub offset: u32,
    pub external: bool,
}

/// Script-to-host mapping used while lowering one function, implemented by
/// the linker.
pub trait StubResolver {
    fn registry(&self) -> &TypeRegistry;
    fn resolve_type(&self, decl: StubId) -> Option<TypeId>;
    fn resolve_class(&self, class: StubId) -> Option<TypeId>;
    fn resolve_enum(&self, enum_stub: StubId) -> Option<TypeId>;
    fn resolve_property(&self, prop: StubId) -> Option<ResolvedProp>;
    fn resolve_function(&self, func: StubId) -> Option<crate::types::FuncId>;
}

/// One local variable slot in a frame's storage block.
#[derive(Clone, Debug)]
pub struct LocalVariable {
    pub name: Name,
    pub offset: u32,
    pub ty: TypeId,
}

/// Breakpoint site recorded by the builder.
#[derive(Clone, Debug)]
pub struct BreakpointPlacement {
    pub source_line: u32,
    pub code_offset: u32,
}

/// A compiled, ready-to-execute function body: byte stream, local layout,
/// interned immediates and the breakpoint table.
#[derive(Debug)]
pub struct CodeBlock {
    name: Name,
    class_name: Name,
    source_file: String,
    source_line: u32,
    code: Vec<u8>,
    code_hash: u64,
    local_storage_size: u32,
    local_storage_align: u32,
    locals: Vec<LocalVariable>,
    breakpoints: Vec<BreakpointPlacement>,
    breakpoint_flags: Vec<AtomicBool>,
    /// Interned immediates referenced by 16-bit stream ids
    names: Vec<Name>,
    strings: Vec<String>,
}

impl CodeBlock {
    pub fn name(&self) -> Name {
        self.name
    }

    pub fn class_name(&self) -> Name {
        self.class_name
    }

    pub fn source_file(&self) -> &str {
        &self.source_file
    }

    pub fn source_line(&self) -> u32 {
        self.source_line
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn code_hash(&self) -> u64 {
        self.code_hash
    }

    pub fn local_storage_size(&self) -> u32 {
        self.local_storage_size
    }

    pub fn local_storage_align(&self) -> u32 {
        self.local_storage_align
    }

    pub fn locals(&self) -> &[LocalVariable] {
        &self.locals
    }

    pub fn name_at(&self, id: u16) -> Name {
        self.names.get(id as usize).copied().unwrap_or_default()
    }

    pub fn string_at(&self, id: u16) -> &str {
        self.strings.get(id as usize).map(String::as_str).unwrap_or("")
    }

    //--- breakpoints -----------------------------------------------------

    pub fn breakpoints(&self) -> &[BreakpointPlacement] {
        &self.breakpoints
    }

    pub fn breakpoint_enabled(&self, index: u16) -> bool {
        self.breakpoint_flags
            .get(index as usize)
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Toggle the breakpoint on a source line; returns whether one exists
    /// there.
    pub fn toggle_breakpoint(&self, line: u32, enabled: bool) -> bool {
        let mut found = false;
        for (placement, flag) in self.breakpoints.iter().zip(&self.breakpoint_flags) {
            if placement.source_line == line {
                flag.store(enabled, Ordering::Relaxed);
                found = true;
            }
        }
        found
    }

    pub fn disable_all_breakpoints(&self) {
        for flag in &self.breakpoint_flags {
            flag.store(false, Ordering::Relaxed);
        }
    }

    /// Source lines with an enabled breakpoint.
    pub fn active_breakpoints(&self) -> Vec<u32> {
        self.breakpoints
            .iter()
            .zip(&self.breakpoint_flags)
            .filter(|(_, flag)| flag.load(Ordering::Relaxed))
            .map(|(placement, _)| placement.source_line)
            .collect()
    }

    /// Best-effort source line for a code offset, from the breakpoint
    /// table: the closest recorded site at or before the offset.
    pub fn source_line_for_offset(&self, code_offset: u32) -> Option<u32> {
        self.breakpoints
            .iter()
            .filter(|placement| placement.code_offset <= code_offset)
            .max_by_key(|placement| placement.code_offset)
            .map(|placement| placement.source_line)
    }

    /// Build a function's byte stream from its portable opcodes.
    pub fn build(
        slab: &StubSlab,
        func_id: StubId,
        resolver: &dyn StubResolver,
    ) -> Result<CodeBlock, Located<TranslateError>> {
        Builder::new(slab, func_id, resolver).run()
    }

    /// Human-readable dump of the byte stream, one decoded opcode per line.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let mut pos = 0usize;
        while pos < self.code.len() {
            let at = pos;
            let (op, next) = match decode_opcode(&self.code, pos) {
                Some(decoded) => decoded,
                None => {
                    out.push_str(&format!("{:06}: <truncated>\n", at));
                    break;
                }
            };
            pos = next;
            out.push_str(&format!("{:06}: {}", at, op.name()));
            pos = self.disassemble_operands(op, pos, &mut out);
            out.push('\n');
        }
        out
    }

    fn disassemble_operands(&self, op: Opcode, mut pos: usize, out: &mut String) -> usize {
        let mut read_u16 = |pos: &mut usize| -> u16 {
            let v = u16::from_le_bytes([self.code[*pos], self.code[*pos + 1]]);
            *pos += 2;
            v
        };
        match operand_layout(op) {
            OperandLayout::None => {}
            OperandLayout::Jump => {
                let delta = read_u16(&mut pos) as i16;
                out.push_str(&format!(" -> {:+}", delta));
            }
            OperandLayout::JumpAndType => {
                let delta = read_u16(&mut pos) as i16;
                let ty = read_u16(&mut pos);
                out.push_str(&format!(" -> {:+}, type #{}", delta, ty));
            }
            OperandLayout::Bytes(n) => {
                out.push(' ');
                for _ in 0..n / 2 {
                    out.push_str(&format!("{:04x} ", read_u16(&mut pos)));
                }
                if n % 2 == 1 {
                    out.push_str(&format!("{:02x}", self.code[pos]));
                    pos += 1;
                }
            }
            OperandLayout::NameId => {
                let id = read_u16(&mut pos);
                out.push_str(&format!(" '{}'", self.name_at(id)));
            }
            OperandLayout::StringId => {
                let id = read_u16(&mut pos);
                out.push_str(&format!(" {:?}", self.string_at(id)));
            }
            OperandLayout::Call => {
                let func = read_u16(&mut pos);
                out.push_str(&format!(" func #{}", func));
                pos += 8; // encoding word
            }
            OperandLayout::Constructor => {
                let ty = read_u16(&mut pos);
                let count = self.code[pos];
                pos += 1;
                out.push_str(&format!(" type #{}, {} member(s)", ty, count));
                pos += count as usize * 4;
            }
        }
        pos
    }
}

/// Decode a 1-2 byte opcode id at `pos`; high bit of the first byte marks
/// a continuation byte.
pub fn decode_opcode(code: &[u8], pos: usize) -> Option<(Opcode, usize)> {
    let first = *code.get(pos)?;
    let (id, next) = if first & 0x80 != 0 {
        let second = *code.get(pos + 1)?;
        ((first as u16 & 0x7F) | ((second as u16) << 7), pos + 2)
    } else {
        (first as u16, pos + 1)
    };
    Opcode::try_from(id).ok().map(|op| (op, next))
}

/// Coarse operand shapes, enough for the disassembler to keep in step with
/// the stream. The interpreter decodes operands itself.
enum OperandLayout {
    None,
    Jump,
    JumpAndType,
    Bytes(usize),
    NameId,
    StringId,
    Call,
    Constructor,
}

fn operand_layout(op: Opcode) -> OperandLayout {
    use Opcode::*;
    match op {
        Jump | JumpIfFalse | LogicAnd | LogicOr => OperandLayout::Jump,
        ContextFromPtr | ContextFromPtrRef | ContextFromRef => OperandLayout::JumpAndType,
        IntConst1 | UintConst1 | ParamVar => OperandLayout::Bytes(1),
        IntConst2 | UintConst2 | Breakpoint | LocalVar | ContextVar | ContextExternalVar
        | StructMemberRef | LoadAny | ReturnAny | TestEqual | TestNotEqual | New | MetaCast
        | DynamicCast | DynamicWeakCast | ClassConst | EnumToName | EnumToString | NameToEnum
        | ContextFromValue => OperandLayout::Bytes(2),
        IntConst4 | UintConst4 | FloatConst | LocalCtor | LocalDtor | ContextCtor | ContextDtor
        | ContextExternalCtor | ContextExternalDtor => OperandLayout::Bytes(4),
        IntConst8 | UintConst8 | DoubleConst => OperandLayout::Bytes(8),
        StructMember => OperandLayout::Bytes(6),
        NameConst => OperandLayout::NameId,
        StringConst => OperandLayout::StringId,
        StaticFunc | FinalFunc | VirtualFunc | InternalFunc => OperandLayout::Call,
        Constructor => OperandLayout::Constructor,
        _ => OperandLayout::None,
    }
}

//--- builder -------------------------------------------------------------

struct PendingJump {
    /// Offset of the 16-bit placeholder in the stream
    patch_offset: u32,
    target: StubId,
    source: StubId,
}

struct Builder<'a> {
    slab: &'a StubSlab,
    func_id: StubId,
    resolver: &'a dyn StubResolver,
    out: Vec<u8>,
    opcode_offsets: HashMap<StubId, u32>,
    jumps: Vec<PendingJump>,
    breakpoints: Vec<BreakpointPlacement>,
    locals: Vec<LocalVariable>,
    local_slots: HashMap<u16, usize>,
    local_size: u32,
    local_align: u32,
    names: Vec<Name>,
    name_ids: HashMap<Name, u16>,
    strings: Vec<String>,
    string_ids: HashMap<String, u16>,
}

impl<'a> Builder<'a> {
    fn new(slab: &'a StubSlab, func_id: StubId, resolver: &'a dyn StubResolver) -> Builder<'a> {
        Builder {
            slab,
            func_id,
            resolver,
            out: Vec::with_capacity(256),
            opcode_offsets: HashMap::new(),
            jumps: Vec::new(),
            breakpoints: Vec::new(),
            locals: Vec::new(),
            local_slots: HashMap::new(),
            local_size: 0,
            local_align: 1,
            names: Vec::new(),
            name_ids: HashMap::new(),
            strings: Vec::new(),
            string_ids: HashMap::new(),
        }
    }

    fn err(&self, opcode: StubId, error: TranslateError) -> Located<TranslateError> {
        Located::new(error, self.slab.source_loc(opcode))
    }

    fn run(mut self) -> Result<CodeBlock, Located<TranslateError>> {
        let func = self
            .slab
            .get(self.func_id)
            .as_function()
            .expect("code block source is not a function")
            .clone();

        for &opcode_id in &func.opcodes {
            self.emit(opcode_id)?;
        }
        self.finalize_jumps()?;

        let stub = self.slab.get(self.func_id);
        let class_name = stub
            .owner
            .and_then(|owner| self.slab.get(owner).as_class().map(|_| self.slab.get(owner).name))
            .unwrap_or_default();
        let location = self.slab.source_loc(self.func_id);

        let breakpoint_flags = self.breakpoints.iter().map(|_| AtomicBool::new(false)).collect();
        Ok(CodeBlock {
            name: stub.name,
            class_name,
            source_file: location.file,
            source_line: location.line,
            code: self.out,
            code_hash: func.code_hash,
            local_storage_size: self.local_size,
            local_storage_align: self.local_align,
            locals: self.locals,
            breakpoints: self.breakpoints,
            breakpoint_flags,
            names: self.names,
            strings: self.strings,
        })
    }

    //--- primitive emission ----------------------------------------------

    fn emit_op(&mut self, op: Opcode) {
        let id = u16::from(op);
        if id < 0x80 {
            self.out.push(id as u8);
        } else {
            self.out.push((id as u8 & 0x7F) | 0x80);
            self.out.push((id >> 7) as u8);
        }
    }

    fn emit_u8(&mut self, v: u8) {
        self.out.push(v);
    }

    fn emit_u16(&mut self, v: u16) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_bytes(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
    }

    fn emit_type_id(&mut self, ty: TypeId) {
        self.emit_u16(ty.0);
    }

    fn emit_jump(&mut self, source: StubId, target: Option<StubId>) -> Result<(), Located<TranslateError>> {
        let target = target.ok_or_else(|| self.err(source, TranslateError::UnresolvedJumpTarget))?;
        self.jumps.push(PendingJump {
            patch_offset: self.out.len() as u32,
            target,
            source,
        });
        self.emit_u16(0);
        Ok(())
    }

    fn intern_name(&mut self, name: Name) -> u16 {
        if let Some(&id) = self.name_ids.get(&name) {
            return id;
        }
        let id = self.names.len() as u16;
        self.names.push(name);
        self.name_ids.insert(name, id);
        id
    }

    fn intern_string(&mut self, text: &str) -> u16 {
        if let Some(&id) = self.string_ids.get(text) {
            return id;
        }
        let id = self.strings.len() as u16;
        self.strings.push(text.to_owned());
        self.string_ids.insert(text.to_owned(), id);
        id
    }

    //--- resolution helpers ----------------------------------------------

    fn resolve_type(&self, opcode: StubId, decl: Option<StubId>) -> Result<TypeId, Located<TranslateError>> {
        decl.and_then(|decl| self.resolver.resolve_type(decl))
            .ok_or_else(|| self.err(opcode, TranslateError::UnresolvedReference))
    }

    fn resolve_prop(&self, opcode: StubId, prop: Option<StubId>) -> Result<ResolvedProp, Located<TranslateError>> {
        prop.and_then(|prop| self.resolver.resolve_property(prop))
            .ok_or_else(|| self.err(opcode, TranslateError::UnresolvedReference))
    }

    fn resolve_enum(&self, opcode: StubId, stub: Option<StubId>) -> Result<TypeId, Located<TranslateError>> {
        stub.and_then(|stub| self.resolver.resolve_enum(stub))
            .ok_or_else(|| self.err(opcode, TranslateError::UnresolvedReference))
    }

    fn resolve_class(&self, opcode: StubId, stub: Option<StubId>) -> Result<TypeId, Located<TranslateError>> {
        stub.and_then(|stub| self.resolver.resolve_class(stub))
            .ok_or_else(|| self.err(opcode, TranslateError::UnresolvedReference))
    }

    /// Assign (or find) a local's offset in the frame storage block.
    fn map_local(&mut self, opcode: StubId) -> Result<usize, Located<TranslateError>> {
        let op = self.slab.get(opcode).as_opcode().unwrap();
        let (name, slot) = match op.value {
            Immediate::NamedSlot { name, index } => (name, index),
            _ => (Name::none(), 0),
        };
        if let Some(&known) = self.local_slots.get(&slot) {
            return Ok(known);
        }
        let ty = self.resolve_type(opcode, op.stub)?;
        let def = self.resolver.registry().type_def(ty);
        let align = def.align.max(1);
        let offset = (self.local_size + align - 1) & !(align - 1);
        let end = offset + def.size;
        if end > u16::MAX as u32 {
            return Err(self.err(opcode, TranslateError::LocalStorageOverflow));
        }
        self.local_align = self.local_align.max(align);
        self.local_size = end;
        let index = self.locals.len();
        log::debug!(
            "Local var '{}', type '{}' placed at offset {}",
            name,
            def.name,
            offset
        );
        self.locals.push(LocalVariable { name, offset, ty });
        self.local_slots.insert(slot, index);
        Ok(index)
    }

    //--- opcode filtering and specialization ------------------------------

    /// Constructor/destructor opcodes for types that do not need them are
    /// dropped before emission.
    fn filtered(&self, opcode_id: StubId) -> Result<bool, Located<TranslateError>> {
        let op = self.slab.get(opcode_id).as_opcode().unwrap();
        let registry = self.resolver.registry();
        Ok(match op.op {
            Opcode::ContextCtor => {
                let prop = self.resolve_prop(opcode_id, op.stub)?;
                let traits = registry.type_def(prop.ty).traits;
                !traits.requires_ctor || traits.zero_init
            }
            Opcode::ContextDtor => {
                let prop = self.resolve_prop(opcode_id, op.stub)?;
                !registry.type_def(prop.ty).traits.requires_dtor
            }
            Opcode::LocalCtor => {
                let ty = self.resolve_type(opcode_id, op.stub)?;
                !registry.type_def(ty).traits.requires_ctor
            }
            Opcode::LocalDtor => {
                let ty = self.resolve_type(opcode_id, op.stub)?;
                !registry.type_def(ty).traits.requires_dtor
            }
            _ => false,
        })
    }

    /// Width-specialized expansion or contraction between an enum and a
    /// 32/64-bit integer.
    fn emit_enum_conversion(&mut self, op: Opcode, size: u8, signed: bool) {
        let specialized = match (op, size) {
            (Opcode::EnumToInt32, 1) => {
                if signed {
                    Opcode::ExpandSigned8To32
                } else {
                    Opcode::ExpandUnsigned8To32
                }
            }
            (Opcode::EnumToInt32, 2) => {
                if signed {
                    Opcode::ExpandSigned16To32
                } else {
                    Opcode::ExpandUnsigned16To32
                }
            }
            (Opcode::EnumToInt32, 4) => Opcode::Passthrough,
            (Opcode::EnumToInt32, _) => Opcode::Contract64To32,
            (Opcode::EnumToInt64, 1) => {
                if signed {
                    Opcode::ExpandSigned8To64
                } else {
                    Opcode::ExpandUnsigned8To64
                }
            }
            (Opcode::EnumToInt64, 2) => {
                if signed {
                    Opcode::ExpandSigned16To64
                } else {
                    Opcode::ExpandUnsigned16To64
                }
            }
            (Opcode::EnumToInt64, 4) => {
                if signed {
                    Opcode::ExpandSigned32To64
                } else {
                    Opcode::ExpandUnsigned32To64
                }
            }
            (Opcode::EnumToInt64, _) => Opcode::Passthrough,
            (Opcode::Int32ToEnum, 1) => Opcode::Contract32To8,
            (Opcode::Int32ToEnum, 2) => Opcode::Contract32To16,
            (Opcode::Int32ToEnum, 4) => Opcode::Passthrough,
            (Opcode::Int32ToEnum, _) => {
                if signed {
                    Opcode::ExpandSigned32To64
                } else {
                    Opcode::ExpandUnsigned32To64
                }
            }
            (Opcode::Int64ToEnum, 1) => Opcode::Contract64To8,
            (Opcode::Int64ToEnum, 2) => Opcode::Contract64To16,
            (Opcode::Int64ToEnum, 4) => Opcode::Contract64To32,
            _ => Opcode::Passthrough,
        };
        self.emit_op(specialized);
    }

    //--- main emission ----------------------------------------------------

    fn emit(&mut self, opcode_id: StubId) -> Result<(), Located<TranslateError>> {
        if self.filtered(opcode_id)? {
            return Ok(());
        }

        let op = self.slab.get(opcode_id).as_opcode().unwrap().clone();
        self.opcode_offsets.insert(opcode_id, self.out.len() as u32);

        match op.op {
            // Labels are jump targets only, nothing is emitted
            Opcode::Label => return Ok(()),

            Opcode::Breakpoint => {
                let index = self.breakpoints.len() as u16;
                self.breakpoints.push(BreakpointPlacement {
                    source_line: self.slab.get(opcode_id).location.line,
                    code_offset: self.out.len() as u32,
                });
                self.emit_op(Opcode::Breakpoint);
                self.emit_u16(index);
            }

            Opcode::Jump | Opcode::JumpIfFalse | Opcode::LogicAnd | Opcode::LogicOr => {
                self.emit_op(op.op);
                self.emit_jump(opcode_id, op.target)?;
            }

            Opcode::IntConst1 => {
                self.emit_op(op.op);
                self.emit_bytes(&(op.value.as_int() as i8).to_le_bytes());
            }
            Opcode::IntConst2 => {
                self.emit_op(op.op);
                self.emit_bytes(&(op.value.as_int() as i16).to_le_bytes());
            }
            Opcode::IntConst4 => {
                self.emit_op(op.op);
                self.emit_bytes(&(op.value.as_int() as i32).to_le_bytes());
            }
            Opcode::IntConst8 => {
                self.emit_op(op.op);
                self.emit_bytes(&op.value.as_int().to_le_bytes());
            }
            Opcode::UintConst1 => {
                self.emit_op(op.op);
                self.emit_u8(op.value.as_uint() as u8);
            }
            Opcode::UintConst2 => {
                self.emit_op(op.op);
                self.emit_u16(op.value.as_uint() as u16);
            }
            Opcode::UintConst4 => {
                self.emit_op(op.op);
                self.emit_bytes(&(op.value.as_uint() as u32).to_le_bytes());
            }
            Opcode::UintConst8 => {
                self.emit_op(op.op);
                self.emit_bytes(&op.value.as_uint().to_le_bytes());
            }
            Opcode::FloatConst => {
                self.emit_op(op.op);
                let v = match op.value {
                    Immediate::Float(v) => v,
                    _ => 0.0,
                };
                self.emit_bytes(&v.to_le_bytes());
            }
            Opcode::DoubleConst => {
                self.emit_op(op.op);
                let v = match op.value {
                    Immediate::Double(v) => v,
                    _ => 0.0,
                };
                self.emit_bytes(&v.to_le_bytes());
            }
            Opcode::NameConst => {
                self.emit_op(op.op);
                let id = self.intern_name(op.value.as_name());
                self.emit_u16(id);
            }
            Opcode::StringConst => {
                self.emit_op(op.op);
                let id = match &op.value {
                    Immediate::Text(text) => self.intern_string(text),
                    _ => self.intern_string(""),
                };
                self.emit_u16(id);
            }

            // Enum constants are emitted at the enum's storage width
            Opcode::EnumConst => {
                let enum_ty = self.resolve_enum(opcode_id, op.stub)?;
                let def = self.resolver.registry().type_def(enum_ty);
                let info = def.enum_info.clone().unwrap_or_default();
                let value = info
                    .find_value(op.value.as_name())
                    .ok_or_else(|| self.err(opcode_id, TranslateError::UnresolvedReference))?;
                match (info.size, info.signed) {
                    (1, true) => {
                        self.emit_op(Opcode::IntConst1);
                        self.emit_bytes(&(value as i8).to_le_bytes());
                    }
                    (1, false) => {
                        self.emit_op(Opcode::UintConst1);
                        self.emit_u8(value as u8);
                    }
                    (2, true) => {
                        self.emit_op(Opcode::IntConst2);
                        self.emit_bytes(&(value as i16).to_le_bytes());
                    }
                    (2, false) => {
                        self.emit_op(Opcode::UintConst2);
                        self.emit_u16(value as u16);
                    }
                    (4, true) => {
                        self.emit_op(Opcode::IntConst4);
                        self.emit_bytes(&(value as i32).to_le_bytes());
                    }
                    (4, false) => {
                        self.emit_op(Opcode::UintConst4);
                        self.emit_bytes(&(value as u32).to_le_bytes());
                    }
                    (_, true) => {
                        self.emit_op(Opcode::IntConst8);
                        self.emit_bytes(&value.to_le_bytes());
                    }
                    (_, false) => {
                        self.emit_op(Opcode::UintConst8);
                        self.emit_bytes(&(value as u64).to_le_bytes());
                    }
                }
            }

            Opcode::EnumToInt32 | Opcode::EnumToInt64 | Opcode::Int32ToEnum | Opcode::Int64ToEnum => {
                let enum_ty = self.resolve_enum(opcode_id, op.stub)?;
                let def = self.resolver.registry().type_def(enum_ty);
                let (size, signed) = def
                    .enum_info
                    .as_ref()
                    .map(|info| (info.size, info.signed))
                    .unwrap_or((4, true));
                self.emit_enum_conversion(op.op, size, signed);
            }

            Opcode::EnumToName | Opcode::EnumToString | Opcode::NameToEnum => {
                let enum_ty = self.resolve_enum(opcode_id, op.stub)?;
                self.emit_op(op.op);
                self.emit_type_id(enum_ty);
            }

            // Typed equality narrows to a width test when possible
            Opcode::TestEqual | Opcode::TestNotEqual => {
                let equal = op.op == Opcode::TestEqual;
                let ty = self.resolve_type(opcode_id, op.stub)?;
                let def = self.resolver.registry().type_def(ty);
                if def.traits.simple_copy {
                    let specialized = match (def.size, equal) {
                        (1, true) => Some(Opcode::TestEqual1),
                        (2, true) => Some(Opcode::TestEqual2),
                        (4, true) => Some(Opcode::TestEqual4),
                        (8, true) => Some(Opcode::TestEqual8),
                        (1, false) => Some(Opcode::TestNotEqual1),
                        (2, false) => Some(Opcode::TestNotEqual2),
                        (4, false) => Some(Opcode::TestNotEqual4),
                        (8, false) => Some(Opcode::TestNotEqual8),
                        _ => None,
                    };
                    if let Some(specialized) = specialized {
                        self.emit_op(specialized);
                        return Ok(());
                    }
                }
                self.emit_op(op.op);
                self.emit_type_id(ty);
            }

            Opcode::StaticFunc | Opcode::FinalFunc | Opcode::VirtualFunc | Opcode::InternalFunc => {
                let func = op
                    .stub
                    .and_then(|stub| self.resolver.resolve_function(stub))
                    .ok_or_else(|| self.err(opcode_id, TranslateError::UnresolvedReference))?;
                self.emit_op(op.op);
                self.emit_u16(func.0);
                self.emit_bytes(&op.value.as_uint().to_le_bytes());
            }

            Opcode::LoadAny | Opcode::ReturnAny => {
                let ty = self.resolve_type(opcode_id, op.stub)?;
                self.emit_op(op.op);
                self.emit_type_id(ty);
            }

            Opcode::ParamVar => {
                self.emit_op(op.op);
                self.emit_u8(op.value.as_int() as u8);
            }

            Opcode::ContextVar => {
                let prop = self.resolve_prop(opcode_id, op.stub)?;
                self.emit_op(if prop.external {
                    Opcode::ContextExternalVar
                } else {
                    Opcode::ContextVar
                });
                self.emit_u16(prop.offset as u16);
            }

            Opcode::ContextCtor | Opcode::ContextDtor => {
                let prop = self.resolve_prop(opcode_id, op.stub)?;
                let ctor = op.op == Opcode::ContextCtor;
                self.emit_op(match (ctor, prop.external) {
                    (true, false) => Opcode::ContextCtor,
                    (true, true) => Opcode::ContextExternalCtor,
                    (false, false) => Opcode::ContextDtor,
                    (false, true) => Opcode::ContextExternalDtor,
                });
                self.emit_u16(prop.offset as u16);
                self.emit_type_id(prop.ty);
            }

            Opcode::LocalVar => {
                let index = self.map_local(opcode_id)?;
                let offset = self.locals[index].offset as u16;
                self.emit_op(Opcode::LocalVar);
                self.emit_u16(offset);
            }

            Opcode::LocalCtor | Opcode::LocalDtor => {
                let index = self.map_local(opcode_id)?;
                let (offset, ty) = (self.locals[index].offset as u16, self.locals[index].ty);
                self.emit_op(op.op);
                self.emit_u16(offset);
                self.emit_type_id(ty);
            }

            Opcode::StructMemberRef => {
                let prop = self.resolve_prop(opcode_id, op.stub)?;
                self.emit_op(op.op);
                self.emit_u16(prop.offset as u16);
            }

            Opcode::StructMember => {
                let prop = self.resolve_prop(opcode_id, op.stub)?;
                let owner = self
                    .slab
                    .get(op.stub.unwrap())
                    .owner
                    .ok_or_else(|| self.err(opcode_id, TranslateError::UnresolvedReference))?;
                let owner_ty = self.resolve_class(opcode_id, Some(owner))?;
                self.emit_op(op.op);
                self.emit_type_id(owner_ty);
                self.emit_u16(prop.offset as u16);
                self.emit_type_id(prop.ty);
            }

            Opcode::ContextFromPtr | Opcode::ContextFromRef | Opcode::ContextFromPtrRef => {
                self.emit_op(op.op);
                self.emit_jump(opcode_id, op.target)?;
                match op.stub {
                    Some(decl) => {
                        let ty = self.resolve_type(opcode_id, Some(decl))?;
                        self.emit_type_id(ty);
                    }
                    None => self.emit_u16(0),
                }
            }

            Opcode::ContextFromValue => {
                self.emit_op(op.op);
                match op.stub {
                    Some(decl) => {
                        let ty = self.resolve_type(opcode_id, Some(decl))?;
                        self.emit_type_id(ty);
                    }
                    None => self.emit_u16(0),
                }
            }

            Opcode::Constructor => {
                let ty = self.resolve_type(opcode_id, op.stub)?;
                let count = op.value.as_uint() as usize;
                let members: Vec<(u16, TypeId)> = {
                    let registry = self.resolver.registry();
                    let info = registry
                        .type_def(ty)
                        .class_info()
                        .ok_or_else(|| self.err(opcode_id, TranslateError::UnresolvedReference))?;
                    if count > info.props.len() {
                        return Err(self.err(opcode_id, TranslateError::UnresolvedReference));
                    }
                    info.props
                        .iter()
                        .take(count)
                        .map(|p| (p.offset as u16, p.ty))
                        .collect()
                };
                self.emit_op(op.op);
                self.emit_type_id(ty);
                self.emit_u8(count as u8);
                for (offset, member_ty) in members {
                    self.emit_u16(offset);
                    self.emit_type_id(member_ty);
                }
            }

            Opcode::New | Opcode::MetaCast | Opcode::DynamicCast | Opcode::DynamicWeakCast => {
                let class = self.resolve_class(opcode_id, op.stub)?;
                self.emit_op(op.op);
                self.emit_type_id(class);
            }

            Opcode::ClassConst => {
                let class = self.resolve_class(opcode_id, op.stub)?;
                self.emit_op(op.op);
                self.emit_type_id(class);
            }

            Opcode::Switch
            | Opcode::SwitchLabel
            | Opcode::SwitchDefault
            | Opcode::Conditional
            | Opcode::CastToVariant
            | Opcode::CastFromVariant
            | Opcode::VariantIsValid
            | Opcode::VariantIsPointer
            | Opcode::VariantIsArray
            | Opcode::VariantGetType
            | Opcode::VariantToString => {
                return Err(self.err(opcode_id, TranslateError::UnsupportedOpcode(op.op)));
            }

            // Everything else is the opcode alone
            _ => self.emit_op(op.op),
        }
        Ok(())
    }

    fn finalize_jumps(&mut self) -> Result<(), Located<TranslateError>> {
        for jump in &self.jumps {
            let target_offset = match self.opcode_offsets.get(&jump.target) {
                Some(&offset) => offset as i64,
                None => {
                    return Err(Located::new(
                        TranslateError::UnresolvedJumpTarget,
                        self.slab.source_loc(jump.source),
                    ))
                }
            };
            // Distance is measured from the instruction pointer right
            // after the 16-bit offset field
            let distance = target_offset - (jump.patch_offset as i64 + 2);
            if distance > i16::MAX as i64 || distance < i16::MIN as i64 {
                return Err(Located::new(
                    TranslateError::JumpOutOfRange(distance),
                    self.slab.source_loc(jump.source),
                ));
            }
            let bytes = (distance as i16).to_le_bytes();
            let at = jump.patch_offset as usize;
            self.out[at] = bytes[0];
            self.out[at + 1] = bytes[1];
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_id_encoding() {
        let mut code = Vec::new();
        for op in [Opcode::Nop, Opcode::Jump, Opcode::StaticFunc, Opcode::VariantToString] {
            code.clear();
            let id = u16::from(op);
            if id < 0x80 {
                code.push(id as u8);
            } else {
                code.push((id as u8 & 0x7F) | 0x80);
                code.push((id >> 7) as u8);
            }
            let (decoded, next) = decode_opcode(&code, 0).unwrap();
            assert_eq!(decoded, op);
            assert_eq!(next, code.len());
        }
    }

    #[test]
    fn test_call_encoding() {
        let encoding = CallEncoding::encode(&[
            ParamMode::Ref,
            ParamMode::SimpleValue,
            ParamMode::TypedValue,
        ])
        .unwrap();
        assert_eq!(encoding.mode(0), ParamMode::Ref);
        assert_eq!(encoding.mode(1), ParamMode::SimpleValue);
        assert_eq!(encoding.mode(2), ParamMode::TypedValue);
        assert_eq!(encoding.mode(3), ParamMode::None);

        assert!(CallEncoding::encode(&[ParamMode::Ref; 17]).is_err());
    }
}
