//! Per-function C emitter. Walks a function stub's portable opcodes in
//! stream order: statements are appended to the body buffer, expressions
//! come back as small `{type, pointer, text}` chunks substituted into
//! their parent's template. Labels become C labels, jumps become gotos,
//! temporaries are declared in the prologue and destroyed at statement
//! end when their type requires it.

use super::{
    consts::{escape_c, JitConstCache},
    typelib::{CTypeId, JitTypeLib},
};
use crate::{
    error::{Located, TranslateError},
    name::Name,
    opcodes::{Immediate, Opcode},
    stub::{StubFlags, StubId, StubSlab},
};
use std::collections::HashMap;
use std::fmt::Write;

/// A piece of emitted expression code.
#[derive(Clone, Debug, Default)]
pub struct Chunk {
    pub ty: Option<CTypeId>,
    pub pointer: bool,
    pub text: String,
}

impl Chunk {
    fn new(ty: Option<CTypeId>, text: impl Into<String>) -> Chunk {
        Chunk {
            ty,
            pointer: false,
            text: text.into(),
        }
    }
}

/// Pre-order stream over a function's portable opcodes.
struct OpStream<'a> {
    ops: &'a [StubId],
    pos: usize,
}

impl<'a> OpStream<'a> {
    fn read(&mut self) -> Option<StubId> {
        let op = self.ops.get(self.pos).copied();
        if op.is_some() {
            self.pos += 1;
        }
        op
    }
}

/// Emits the C body of one scripted function.
pub struct FuncWriter<'a, 'i> {
    slab: &'a StubSlab,
    types: &'a mut JitTypeLib<'i>,
    consts: &'a mut JitConstCache,
    func: StubId,
    /// Direct wrapper: arguments are named parameters instead of the
    /// calling-parameters block
    direct_params: bool,
    emit_exceptions: bool,
    prolog: String,
    code: String,
    labels: HashMap<StubId, String>,
    locals: HashMap<u16, Chunk>,
    temps: Vec<(String, CTypeId)>,
    temp_counter: usize,
    exit_label_counter: usize,
    exit_label_needed: bool,
}

type EmitResult<T> = Result<T, Located<TranslateError>>;

impl<'a, 'i> FuncWriter<'a, 'i> {
    pub fn new(
        slab: &'a StubSlab,
        types: &'a mut JitTypeLib<'i>,
        consts: &'a mut JitConstCache,
        func: StubId,
        direct_params: bool,
        emit_exceptions: bool,
    ) -> FuncWriter<'a, 'i> {
        FuncWriter {
            slab,
            types,
            consts,
            func,
            direct_params,
            emit_exceptions,
            prolog: String::new(),
            code: String::new(),
            labels: HashMap::new(),
            locals: HashMap::new(),
            temps: Vec::new(),
            temp_counter: 0,
            exit_label_counter: 0,
            exit_label_needed: false,
        }
    }

    /// Emit the whole function body: prologue declarations followed by the
    /// translated statements.
    pub fn emit(mut self) -> EmitResult<String> {
        let ops = self
            .slab
            .get(self.func)
            .as_function()
            .expect("jit source is not a function")
            .opcodes
            .clone();
        let mut stream = OpStream {
            ops: &ops,
            pos: 0,
        };
        while let Some(op) = stream.read() {
            self.statement("context", op, &mut stream)?;
        }
        let mut out = self.prolog;
        out.push_str(&self.code);
        out.push_str("(void)0;\n");
        Ok(out)
    }

    fn err(&self, op: StubId, error: TranslateError) -> Located<TranslateError> {
        Located::new(error, self.slab.source_loc(op))
    }

    fn read_expr(&mut self, context: &str, stream: &mut OpStream<'_>, at: StubId) -> EmitResult<Chunk> {
        let op = stream
            .read()
            .ok_or_else(|| self.err(at, TranslateError::UnresolvedJumpTarget))?;
        self.expression(context, op, stream)
    }

    fn label(&mut self, target: StubId) -> String {
        if let Some(label) = self.labels.get(&target) {
            return label.clone();
        }
        let label = format!("Label{}", self.labels.len());
        self.labels.insert(target, label.clone());
        label
    }

    fn statement_exit_label(&mut self) -> String {
        self.exit_label_needed = true;
        format!("ExitStatement{}", self.exit_label_counter)
    }

    fn c_type(&self, ty: CTypeId) -> String {
        self.types.get(ty).c_name.clone()
    }

    fn temp(&mut self, ty: CTypeId) -> Chunk {
        let name = format!("__temp{}", self.temp_counter);
        self.temp_counter += 1;
        let _ = writeln!(self.prolog, "{} {};", self.c_type(ty), name);
        let _ = writeln!(self.prolog, "memset(&{}, 0, sizeof({}));", name, name);
        let def = self.types.get(ty);
        if def.traits.requires_ctor && !def.traits.zero_init {
            let id = self.types.assign_id(ty);
            let _ = writeln!(self.code, "CTOR({}, &{});", id, name);
        }
        self.temps.push((name.clone(), ty));
        Chunk::new(Some(ty), name)
    }

    /// Address form of a chunk.
    fn pointer(&self, chunk: Chunk) -> Chunk {
        if chunk.pointer || chunk.text.is_empty() {
            return chunk;
        }
        Chunk {
            ty: chunk.ty,
            pointer: true,
            text: format!("(&({}))", chunk.text),
        }
    }

    /// Value form of a chunk.
    fn value(&self, chunk: Chunk) -> Chunk {
        if !chunk.pointer || chunk.text.is_empty() {
            return chunk;
        }
        Chunk {
            ty: chunk.ty,
            pointer: false,
            text: format!("(*({}))", chunk.text),
        }
    }

    /// Typed copy between two places, simple `=` when the type allows.
    fn copy(&mut self, ty: CTypeId, to: &str, to_pointer: bool, from: &str, from_pointer: bool) {
        let def = self.types.get(ty);
        if def.traits.simple_copy {
            let c_name = def.c_name.clone();
            let lhs = if to_pointer {
                format!("*(({}*)({}))", c_name, to)
            } else {
                to.to_owned()
            };
            let rhs = if from_pointer {
                format!("*(({}*)({}))", c_name, from)
            } else {
                from.to_owned()
            };
            let _ = writeln!(self.code, "{} = {};", lhs, rhs);
        } else {
            let id = self.types.assign_id(ty);
            let to_text = if to_pointer {
                to.to_owned()
            } else {
                format!("&({})", to)
            };
            let from_text = if from_pointer {
                from.to_owned()
            } else {
                format!("&({})", from)
            };
            let _ = writeln!(self.code, "COPY({}, {}, {});", id, to_text, from_text);
        }
    }

    fn destroy(&mut self, ty: CTypeId, place: &str, pointer: bool) {
        if !self.types.get(ty).traits.requires_dtor {
            return;
        }
        let id = self.types.assign_id(ty);
        if pointer {
            let _ = writeln!(self.code, "DTOR({}, {});", id, place);
        } else {
            let _ = writeln!(self.code, "DTOR({}, &({}));", id, place);
        }
    }

    /// Destroy statement-scoped temps and place the exit label.
    fn finish_statement(&mut self) {
        let temps = std::mem::take(&mut self.temps);
        for (name, ty) in temps {
            self.destroy(ty, &name, false);
        }
        if self.exit_label_needed {
            let _ = writeln!(self.code, "ExitStatement{}:;", self.exit_label_counter);
            self.exit_label_counter += 1;
            self.exit_label_needed = false;
        }
    }

    fn local_var(&mut self, op: StubId) -> EmitResult<Chunk> {
        let opcode = self.slab.get(op).as_opcode().unwrap();
        let (name, slot) = match opcode.value {
            Immediate::NamedSlot { name, index } => (name, index),
            _ => (Name::none(), 0),
        };
        if let Some(chunk) = self.locals.get(&slot) {
            return Ok(chunk.clone());
        }
        let ty = opcode
            .stub
            .and_then(|decl| self.types.resolve_decl(self.slab, decl))
            .ok_or_else(|| self.err(op, TranslateError::UnresolvedReference))?;
        let var = if name.is_empty() {
            format!("__local_{}", slot)
        } else {
            format!("__local_{}_{}", name, slot)
        };
        let _ = writeln!(self.prolog, "{} {};", self.c_type(ty), var);
        let _ = writeln!(self.prolog, "memset(&{}, 0, sizeof({}));", var, var);
        let chunk = Chunk::new(Some(ty), var);
        self.locals.insert(slot, chunk.clone());
        Ok(chunk)
    }

    /// Member access path of a property on a context expression.
    fn member_access(&mut self, op: StubId, prop: StubId, context: &str) -> EmitResult<Chunk> {
        let prop_stub = self.slab.get(prop);
        let name = prop_stub.name;
        let owner = prop_stub
            .owner
            .ok_or_else(|| self.err(op, TranslateError::UnresolvedReference))?;
        let owner_ty = self
            .types
            .resolve_named_stub(self.slab, owner)
            .ok_or_else(|| self.err(op, TranslateError::UnresolvedReference))?;

        let member = self
            .types
            .get(owner_ty)
            .members
            .iter()
            .find(|m| m.name == name)
            .cloned()
            .ok_or_else(|| self.err(op, TranslateError::UnresolvedReference))?;

        let text = if member.external {
            let scripted = self.types.scripted_struct_name(owner_ty);
            format!("((({}*)ExternalPtr({}))->{})", scripted, context, name)
        } else {
            let owner_c = self.c_type(owner_ty);
            format!("((({}*){})->{})", owner_c, context, name)
        };
        Ok(Chunk::new(Some(member.ty), text))
    }

    //--- statements ---------------------------------------------------------

    fn statement(&mut self, context: &str, op: StubId, stream: &mut OpStream<'_>) -> EmitResult<()> {
        let opcode = self.slab.get(op).as_opcode().unwrap().clone();
        match opcode.op {
            // A breakpoint wraps the statement that follows it
            Opcode::Breakpoint => {
                let next = stream
                    .read()
                    .ok_or_else(|| self.err(op, TranslateError::UnresolvedJumpTarget))?;
                self.statement(context, next, stream)?;
            }

            Opcode::Label => {
                let label = self.label(op);
                let _ = writeln!(self.code, "{}:;", label);
            }

            Opcode::Nop => {}

            Opcode::Exit => {
                self.finish_statement();
                let _ = writeln!(self.code, "return;");
            }

            Opcode::Jump => {
                let target = opcode
                    .target
                    .ok_or_else(|| self.err(op, TranslateError::UnresolvedJumpTarget))?;
                let label = self.label(target);
                self.finish_statement();
                let _ = writeln!(self.code, "goto {};", label);
            }

            Opcode::JumpIfFalse => {
                let target = opcode
                    .target
                    .ok_or_else(|| self.err(op, TranslateError::UnresolvedJumpTarget))?;
                let cond = self.read_expr(context, stream, op)?;
                let cond = self.value(cond);
                let label = self.label(target);
                // Temps that need destruction cannot be skipped over by
                // the branch; latch the condition first
                if self.temps.iter().any(|(_, ty)| self.types.get(*ty).traits.requires_dtor) {
                    let bool_ty = self
                        .types
                        .resolve_engine_type(Name::new("bool"))
                        .ok_or_else(|| self.err(op, TranslateError::UnresolvedReference))?;
                    let latch = self.temp(bool_ty);
                    let _ = writeln!(self.code, "{} = {};", latch.text, cond.text);
                    self.finish_statement();
                    let _ = writeln!(self.code, "if (!{}) goto {};", latch.text, label);
                } else {
                    self.finish_statement();
                    let _ = writeln!(self.code, "if (!{}) goto {};", cond.text, label);
                }
            }

            Opcode::AssignInt1
            | Opcode::AssignInt2
            | Opcode::AssignInt4
            | Opcode::AssignInt8
            | Opcode::AssignUint1
            | Opcode::AssignUint2
            | Opcode::AssignUint4
            | Opcode::AssignUint8
            | Opcode::AssignFloat
            | Opcode::AssignDouble => {
                let target = self.read_expr(context, stream, op)?;
                let value = self.read_expr(context, stream, op)?;
                let target = self.value(target);
                let value = self.value(value);
                let _ = writeln!(self.code, "{} = {};", target.text, value.text);
                self.finish_statement();
            }

            Opcode::AssignAny => {
                let target = self.read_expr(context, stream, op)?;
                let value = self.read_expr(context, stream, op)?;
                let ty = value
                    .ty
                    .or(target.ty)
                    .ok_or_else(|| self.err(op, TranslateError::UnresolvedReference))?;
                let (to, to_ptr) = (target.text.clone(), target.pointer);
                let (from, from_ptr) = (value.text.clone(), value.pointer);
                self.copy(ty, &to, to_ptr, &from, from_ptr);
                self.finish_statement();
            }

            Opcode::LocalCtor => {
                let var = self.local_var(op)?;
                let ty = var.ty.unwrap();
                let def = self.types.get(ty);
                if def.traits.requires_ctor && !def.traits.zero_init {
                    let id = self.types.assign_id(ty);
                    let _ = writeln!(self.code, "CTOR({}, &({}));", id, var.text);
                }
            }

            Opcode::LocalDtor => {
                let var = self.local_var(op)?;
                let ty = var.ty.unwrap();
                let text = var.text;
                self.destroy(ty, &text, false);
            }

            Opcode::ContextCtor | Opcode::ContextDtor => {
                let prop = opcode
                    .stub
                    .ok_or_else(|| self.err(op, TranslateError::UnresolvedReference))?;
                let place = self.member_access(op, prop, context)?;
                let ty = place.ty.unwrap();
                let def = self.types.get(ty);
                if opcode.op == Opcode::ContextCtor {
                    if def.traits.requires_ctor && !def.traits.zero_init {
                        let id = self.types.assign_id(ty);
                        let _ = writeln!(self.code, "CTOR({}, &({}));", id, place.text);
                    }
                } else {
                    let text = place.text;
                    self.destroy(ty, &text, false);
                }
                self.finish_statement();
            }

            Opcode::ReturnLoad1
            | Opcode::ReturnLoad2
            | Opcode::ReturnLoad4
            | Opcode::ReturnLoad8
            | Opcode::ReturnDirect
            | Opcode::ReturnAny => {
                let ret_ptr = if self.direct_params {
                    "resultPtr"
                } else {
                    "params->_returnPtr"
                };
                let value = self.read_expr(context, stream, op)?;
                let ty = opcode
                    .stub
                    .and_then(|decl| self.types.resolve_decl(self.slab, decl))
                    .or(value.ty)
                    .ok_or_else(|| self.err(op, TranslateError::UnresolvedReference))?;
                let (from, from_ptr) = (value.text.clone(), value.pointer);
                self.copy(ty, ret_ptr, true, &from, from_ptr);
                self.finish_statement();
                let _ = writeln!(self.code, "return;");
            }

            // Everything else is an expression evaluated for effect
            _ => {
                let chunk = self.expression(context, op, stream)?;
                if !chunk.text.is_empty() {
                    let _ = writeln!(self.code, "{};", chunk.text);
                }
                self.finish_statement();
            }
        }
        Ok(())
    }

    //--- expressions --------------------------------------------------------

    fn engine_chunk(&mut self, op: StubId, type_name: &str, text: String) -> EmitResult<Chunk> {
        let ty = self
            .types
            .resolve_engine_type(Name::new(type_name))
            .ok_or_else(|| self.err(op, TranslateError::UnresolvedReference))?;
        Ok(Chunk::new(Some(ty), text))
    }

    fn binary(
        &mut self,
        context: &str,
        op: StubId,
        stream: &mut OpStream<'_>,
        template: impl Fn(&str, &str) -> String,
    ) -> EmitResult<Chunk> {
        let a = self.read_expr(context, stream, op)?;
        let b = self.read_expr(context, stream, op)?;
        let a = self.value(a);
        let b = self.value(b);
        Ok(Chunk {
            ty: a.ty,
            pointer: false,
            text: template(&a.text, &b.text),
        })
    }

    fn binary_bool(
        &mut self,
        context: &str,
        op: StubId,
        stream: &mut OpStream<'_>,
        template: impl Fn(&str, &str) -> String,
    ) -> EmitResult<Chunk> {
        let chunk = self.binary(context, op, stream, template)?;
        let ty = self
            .types
            .resolve_engine_type(Name::new("bool"))
            .ok_or_else(|| self.err(op, TranslateError::UnresolvedReference))?;
        Ok(Chunk {
            ty: Some(ty),
            ..chunk
        })
    }

    fn unary(
        &mut self,
        context: &str,
        op: StubId,
        stream: &mut OpStream<'_>,
        template: impl Fn(&str) -> String,
    ) -> EmitResult<Chunk> {
        let a = self.read_expr(context, stream, op)?;
        let a = self.value(a);
        Ok(Chunk {
            ty: a.ty,
            pointer: false,
            text: template(&a.text),
        })
    }

    fn cast(
        &mut self,
        context: &str,
        op: StubId,
        stream: &mut OpStream<'_>,
        c_type: &str,
        result: &str,
    ) -> EmitResult<Chunk> {
        let a = self.read_expr(context, stream, op)?;
        let a = self.value(a);
        let text = format!("(({})({}))", c_type, a.text);
        self.engine_chunk(op, result, text)
    }

    fn expression(
        &mut self,
        context: &str,
        op: StubId,
        stream: &mut OpStream<'_>,
    ) -> EmitResult<Chunk> {
        use Opcode::*;
        let opcode = self.slab.get(op).as_opcode().unwrap().clone();

        if !JitTypeLib::opcode_supported(opcode.op) {
            return Err(self.err(op, TranslateError::UnsupportedOpcode(opcode.op)));
        }

        let chunk = match opcode.op {
            Passthrough => self.read_expr(context, stream, op)?,

            //--- constants ----------------------------------------------
            Null => self.engine_chunk(op, "ptr<ScriptedObject>", "STRONG_NULL".to_owned())?,
            BoolTrue => self.engine_chunk(op, "bool", "1".to_owned())?,
            BoolFalse => self.engine_chunk(op, "bool", "0".to_owned())?,
            IntOne => self.engine_chunk(op, "int32", "1".to_owned())?,
            IntZero => self.engine_chunk(op, "int32", "0".to_owned())?,
            IntConst1 => self.engine_chunk(op, "int8", format!("{}", opcode.value.as_int()))?,
            IntConst2 => self.engine_chunk(op, "int16", format!("{}", opcode.value.as_int()))?,
            IntConst4 => self.engine_chunk(op, "int32", format!("{}", opcode.value.as_int()))?,
            IntConst8 => {
                self.engine_chunk(op, "int64", format!("{}LL", opcode.value.as_int()))?
            }
            UintConst1 => self.engine_chunk(op, "uint8", format!("{}", opcode.value.as_uint()))?,
            UintConst2 => self.engine_chunk(op, "uint16", format!("{}", opcode.value.as_uint()))?,
            UintConst4 => {
                self.engine_chunk(op, "uint32", format!("{}U", opcode.value.as_uint()))?
            }
            UintConst8 => {
                self.engine_chunk(op, "uint64", format!("{}ULL", opcode.value.as_uint()))?
            }
            FloatConst => {
                let v = match opcode.value {
                    Immediate::Float(v) => v,
                    _ => 0.0,
                };
                self.engine_chunk(op, "float", format!("{:?}f", v))?
            }
            DoubleConst => {
                let v = match opcode.value {
                    Immediate::Double(v) => v,
                    _ => 0.0,
                };
                self.engine_chunk(op, "double", format!("{:?}", v))?
            }
            StringConst => {
                let text = match &opcode.value {
                    Immediate::Text(text) => text.clone(),
                    _ => String::new(),
                };
                let var = self.consts.map_string(&text);
                self.engine_chunk(op, "string", var)?
            }
            NameConst => {
                let var = self.consts.map_name(opcode.value.as_name().as_str());
                self.engine_chunk(op, "name", var)?
            }
            EnumConst => {
                let enum_ty = opcode
                    .stub
                    .and_then(|stub| self.types.resolve_named_stub(self.slab, stub))
                    .ok_or_else(|| self.err(op, TranslateError::UnresolvedReference))?;
                let value = self
                    .types
                    .get(enum_ty)
                    .options
                    .get(&opcode.value.as_name())
                    .copied()
                    .ok_or_else(|| self.err(op, TranslateError::UnresolvedReference))?;
                Chunk::new(Some(enum_ty), format!("{}", value))
            }
            ClassConst => {
                let class_ty = opcode
                    .stub
                    .and_then(|stub| self.types.resolve_named_stub(self.slab, stub))
                    .ok_or_else(|| self.err(op, TranslateError::UnresolvedReference))?;
                let type_name = self.types.get(class_ty).name;
                let var = self.consts.map_type(type_name.as_str());
                Chunk::new(Some(class_ty), var)
            }

            //--- variables ----------------------------------------------
            LocalVar => self.local_var(op)?,
            ParamVar => {
                let index = opcode.value.as_int() as usize;
                let func = self.slab.get(self.func).as_function().unwrap();
                let arg_id = *func
                    .args
                    .get(index)
                    .ok_or_else(|| self.err(op, TranslateError::UnresolvedReference))?;
                let arg = self.slab.get(arg_id);
                let by_pointer = arg
                    .flags
                    .intersects(StubFlags::REF | StubFlags::OUT);
                let ty = arg
                    .as_function_arg()
                    .and_then(|a| a.type_decl)
                    .and_then(|decl| self.types.resolve_decl(self.slab, decl))
                    .ok_or_else(|| self.err(op, TranslateError::UnresolvedReference))?;
                if self.direct_params {
                    Chunk {
                        ty: Some(ty),
                        pointer: by_pointer,
                        text: arg.name.as_str().to_owned(),
                    }
                } else {
                    Chunk {
                        ty: Some(ty),
                        pointer: true,
                        text: format!("(({}*)params->_argPtr[{}])", self.c_type(ty), index),
                    }
                }
            }
            ContextVar => {
                let prop = opcode
                    .stub
                    .ok_or_else(|| self.err(op, TranslateError::UnresolvedReference))?;
                self.member_access(op, prop, context)?
            }
            StructMember | StructMemberRef => {
                let prop = opcode
                    .stub
                    .ok_or_else(|| self.err(op, TranslateError::UnresolvedReference))?;
                let base = self.read_expr(context, stream, op)?;
                let prop_stub = self.slab.get(prop);
                let name = prop_stub.name;
                let owner = prop_stub
                    .owner
                    .ok_or_else(|| self.err(op, TranslateError::UnresolvedReference))?;
                let owner_ty = self
                    .types
                    .resolve_named_stub(self.slab, owner)
                    .ok_or_else(|| self.err(op, TranslateError::UnresolvedReference))?;
                let member = self
                    .types
                    .get(owner_ty)
                    .members
                    .iter()
                    .find(|m| m.name == name)
                    .cloned()
                    .ok_or_else(|| self.err(op, TranslateError::UnresolvedReference))?;
                if base.pointer {
                    Chunk {
                        ty: Some(member.ty),
                        pointer: true,
                        text: format!("(&(({})->{}))", base.text, name),
                    }
                } else {
                    Chunk {
                        ty: Some(member.ty),
                        pointer: false,
                        text: format!("(({}).{})", base.text, name),
                    }
                }
            }
            ThisStruct => {
                let owner = self.slab.get(self.func).owner;
                let ty = owner.and_then(|o| self.types.resolve_named_stub(self.slab, o));
                Chunk {
                    ty,
                    pointer: true,
                    text: "context".to_owned(),
                }
            }
            ThisObject => {
                let ty = self
                    .types
                    .resolve_engine_type(Name::new("ptr<ScriptedObject>"))
                    .ok_or_else(|| self.err(op, TranslateError::UnresolvedReference))?;
                let temp = self.temp(ty);
                let _ = writeln!(
                    self.code,
                    "EI->_fnStrongFromPtr(EI->self, {}, (void*)&{});",
                    context, temp.text
                );
                temp
            }

            //--- loads --------------------------------------------------
            LoadInt1 | LoadInt2 | LoadInt4 | LoadInt8 | LoadUint1 | LoadUint2 | LoadUint4
            | LoadUint8 | LoadFloat | LoadDouble | LoadStrongPtr | LoadWeakPtr | LoadAny => {
                let chunk = self.read_expr(context, stream, op)?;
                self.value(chunk)
            }

            //--- arithmetic ---------------------------------------------
            AddInt8 | AddInt16 | AddInt32 | AddInt64 | AddFloat | AddDouble => {
                self.binary(context, op, stream, |a, b| format!("({} + {})", a, b))?
            }
            SubInt8 | SubInt16 | SubInt32 | SubInt64 | SubFloat | SubDouble => {
                self.binary(context, op, stream, |a, b| format!("({} - {})", a, b))?
            }
            MulSigned8 | MulSigned16 | MulSigned32 | MulSigned64 | MulUnsigned8
            | MulUnsigned16 | MulUnsigned32 | MulUnsigned64 | MulFloat | MulDouble => {
                self.binary(context, op, stream, |a, b| format!("({} * {})", a, b))?
            }
            DivSigned8 | DivSigned16 | DivSigned32 | DivSigned64 | DivUnsigned8
            | DivUnsigned16 | DivUnsigned32 | DivUnsigned64 | DivFloat | DivDouble => {
                self.binary(context, op, stream, |a, b| format!("({} / {})", a, b))?
            }
            ModSigned8 | ModSigned16 | ModSigned32 | ModSigned64 | ModUnsigned8
            | ModUnsigned16 | ModUnsigned32 | ModUnsigned64 => {
                self.binary(context, op, stream, |a, b| format!("({} % {})", a, b))?
            }
            ModFloat => self.binary(context, op, stream, |a, b| format!("fmodf({}, {})", a, b))?,
            ModDouble => self.binary(context, op, stream, |a, b| format!("fmod({}, {})", a, b))?,
            NegSigned8 | NegSigned16 | NegSigned32 | NegSigned64 | NegFloat | NegDouble => {
                self.unary(context, op, stream, |a| format!("(-{})", a))?
            }

            MinSigned8 | MinSigned16 | MinSigned32 | MinSigned64 | MinUnsigned8
            | MinUnsigned16 | MinUnsigned32 | MinUnsigned64 | MinFloat | MinDouble => self
                .binary(context, op, stream, |a, b| {
                    format!("(({0}) < ({1}) ? ({0}) : ({1}))", a, b)
                })?,
            MaxSigned8 | MaxSigned16 | MaxSigned32 | MaxSigned64 | MaxUnsigned8
            | MaxUnsigned16 | MaxUnsigned32 | MaxUnsigned64 | MaxFloat | MaxDouble => self
                .binary(context, op, stream, |a, b| {
                    format!("(({0}) > ({1}) ? ({0}) : ({1}))", a, b)
                })?,
            ClampSigned8 | ClampSigned16 | ClampSigned32 | ClampSigned64 | ClampUnsigned8
            | ClampUnsigned16 | ClampUnsigned32 | ClampUnsigned64 | ClampFloat | ClampDouble => {
                let v = self.read_expr(context, stream, op)?;
                let lo = self.read_expr(context, stream, op)?;
                let hi = self.read_expr(context, stream, op)?;
                let (v, lo, hi) = (self.value(v), self.value(lo), self.value(hi));
                Chunk {
                    ty: v.ty,
                    pointer: false,
                    text: format!(
                        "(({0}) < ({1}) ? ({1}) : (({0}) > ({2}) ? ({2}) : ({0})))",
                        v.text, lo.text, hi.text
                    ),
                }
            }
            Abs8 | Abs16 | Abs32 | Abs64 | AbsFloat | AbsDouble => {
                self.unary(context, op, stream, |a| {
                    format!("(({0}) < 0 ? -({0}) : ({0}))", a)
                })?
            }
            Sign8 | Sign16 | Sign32 | Sign64 | SignFloat | SignDouble => {
                self.unary(context, op, stream, |a| {
                    format!("(({0}) > 0 ? 1 : (({0}) < 0 ? -1 : 0))", a)
                })?
            }

            PreIncrement8 | PreIncrement16 | PreIncrement32 | PreIncrement64 => {
                let a = self.read_expr(context, stream, op)?;
                let a = self.pointer(a);
                Chunk {
                    ty: a.ty,
                    pointer: false,
                    text: format!("(++(*({})))", a.text),
                }
            }
            PreDecrement8 | PreDecrement16 | PreDecrement32 | PreDecrement64 => {
                let a = self.read_expr(context, stream, op)?;
                let a = self.pointer(a);
                Chunk {
                    ty: a.ty,
                    pointer: false,
                    text: format!("(--(*({})))", a.text),
                }
            }
            PostIncrement8 | PostIncrement16 | PostIncrement32 | PostIncrement64 => {
                let a = self.read_expr(context, stream, op)?;
                let a = self.pointer(a);
                Chunk {
                    ty: a.ty,
                    pointer: false,
                    text: format!("((*({}))++)", a.text),
                }
            }
            PostDecrement8 | PostDecrement16 | PostDecrement32 | PostDecrement64 => {
                let a = self.read_expr(context, stream, op)?;
                let a = self.pointer(a);
                Chunk {
                    ty: a.ty,
                    pointer: false,
                    text: format!("((*({}))--)", a.text),
                }
            }

            //--- bitwise ------------------------------------------------
            BitAnd8 | BitAnd16 | BitAnd32 | BitAnd64 => {
                self.binary(context, op, stream, |a, b| format!("({} & {})", a, b))?
            }
            BitOr8 | BitOr16 | BitOr32 | BitOr64 => {
                self.binary(context, op, stream, |a, b| format!("({} | {})", a, b))?
            }
            BitXor8 | BitXor16 | BitXor32 | BitXor64 => {
                self.binary(context, op, stream, |a, b| format!("({} ^ {})", a, b))?
            }
            BitNot8 | BitNot16 | BitNot32 | BitNot64 => {
                self.unary(context, op, stream, |a| format!("(~{})", a))?
            }
            BitShl8 | BitShl16 | BitShl32 | BitShl64 => {
                self.binary(context, op, stream, |a, b| format!("({} << {})", a, b))?
            }
            BitShr8 | BitShr16 | BitShr32 | BitShr64 => {
                self.binary(context, op, stream, |a, b| format!("({} >> {})", a, b))?
            }
            BitSar8 => self.sar(context, op, stream, "int8_t")?,
            BitSar16 => self.sar(context, op, stream, "int16_t")?,
            BitSar32 => self.sar(context, op, stream, "int32_t")?,
            BitSar64 => self.sar(context, op, stream, "int64_t")?,

            //--- compound assignment ------------------------------------
            AddAssignInt8 | AddAssignInt16 | AddAssignInt32 | AddAssignInt64
            | AddAssignFloat | AddAssignDouble => self.compound(context, op, stream, "+=")?,
            SubAssignInt8 | SubAssignInt16 | SubAssignInt32 | SubAssignInt64
            | SubAssignFloat | SubAssignDouble => self.compound(context, op, stream, "-=")?,
            MulAssignSignedInt8 | MulAssignSignedInt16 | MulAssignSignedInt32
            | MulAssignSignedInt64 | MulAssignUnsignedInt8 | MulAssignUnsignedInt16
            | MulAssignUnsignedInt32 | MulAssignUnsignedInt64 | MulAssignFloat
            | MulAssignDouble => self.compound(context, op, stream, "*=")?,
            DivAssignSignedInt8 | DivAssignSignedInt16 | DivAssignSignedInt32
            | DivAssignSignedInt64 | DivAssignUnsignedInt8 | DivAssignUnsignedInt16
            | DivAssignUnsignedInt32 | DivAssignUnsignedInt64 | DivAssignFloat
            | DivAssignDouble => self.compound(context, op, stream, "/=")?,
            BitAndAssign8 | BitAndAssign16 | BitAndAssign32 | BitAndAssign64 => {
                self.compound(context, op, stream, "&=")?
            }
            BitOrAssign8 | BitOrAssign16 | BitOrAssign32 | BitOrAssign64 => {
                self.compound(context, op, stream, "|=")?
            }
            BitXorAssign8 | BitXorAssign16 | BitXorAssign32 | BitXorAssign64 => {
                self.compound(context, op, stream, "^=")?
            }
            BitShlAssign8 | BitShlAssign16 | BitShlAssign32 | BitShlAssign64 => {
                self.compound(context, op, stream, "<<=")?
            }
            BitShrAssign8 | BitShrAssign16 | BitShrAssign32 | BitShrAssign64 | BitSarAssign8
            | BitSarAssign16 | BitSarAssign32 | BitSarAssign64 => {
                self.compound(context, op, stream, ">>=")?
            }

            //--- conversions --------------------------------------------
            ExpandSigned8To16 => self.cast(context, op, stream, "int16_t", "int16")?,
            ExpandSigned8To32 => self.cast(context, op, stream, "int32_t", "int32")?,
            ExpandSigned8To64 => self.cast(context, op, stream, "int64_t", "int64")?,
            ExpandSigned16To32 => self.cast(context, op, stream, "int32_t", "int32")?,
            ExpandSigned16To64 => self.cast(context, op, stream, "int64_t", "int64")?,
            ExpandSigned32To64 => self.cast(context, op, stream, "int64_t", "int64")?,
            ExpandUnsigned8To16 => self.cast(context, op, stream, "uint16_t", "uint16")?,
            ExpandUnsigned8To32 => self.cast(context, op, stream, "uint32_t", "uint32")?,
            ExpandUnsigned8To64 => self.cast(context, op, stream, "uint64_t", "uint64")?,
            ExpandUnsigned16To32 => self.cast(context, op, stream, "uint32_t", "uint32")?,
            ExpandUnsigned16To64 => self.cast(context, op, stream, "uint64_t", "uint64")?,
            ExpandUnsigned32To64 => self.cast(context, op, stream, "uint64_t", "uint64")?,
            Contract64To32 => self.cast(context, op, stream, "uint32_t", "uint32")?,
            Contract64To16 => self.cast(context, op, stream, "uint16_t", "uint16")?,
            Contract64To8 => self.cast(context, op, stream, "uint8_t", "uint8")?,
            Contract32To16 => self.cast(context, op, stream, "uint16_t", "uint16")?,
            Contract32To8 => self.cast(context, op, stream, "uint8_t", "uint8")?,
            Contract16To8 => self.cast(context, op, stream, "uint8_t", "uint8")?,
            FloatToInt8 => self.cast(context, op, stream, "int8_t", "int8")?,
            FloatToInt16 => self.cast(context, op, stream, "int16_t", "int16")?,
            FloatToInt32 => self.cast(context, op, stream, "int32_t", "int32")?,
            FloatToInt64 => self.cast(context, op, stream, "int64_t", "int64")?,
            FloatToUint8 => self.cast(context, op, stream, "uint8_t", "uint8")?,
            FloatToUint16 => self.cast(context, op, stream, "uint16_t", "uint16")?,
            FloatToUint32 => self.cast(context, op, stream, "uint32_t", "uint32")?,
            FloatToUint64 => self.cast(context, op, stream, "uint64_t", "uint64")?,
            FloatFromInt8 | FloatFromInt16 | FloatFromInt32 | FloatFromInt64 | FloatFromUint8
            | FloatFromUint16 | FloatFromUint32 | FloatFromUint64 | FloatFromDouble => {
                self.cast(context, op, stream, "float", "float")?
            }
            FloatToDouble | DoubleFromInt8 | DoubleFromInt16 | DoubleFromInt32
            | DoubleFromInt64 | DoubleFromUint8 | DoubleFromUint16 | DoubleFromUint32
            | DoubleFromUint64 => self.cast(context, op, stream, "double", "double")?,
            DoubleToInt8 => self.cast(context, op, stream, "int8_t", "int8")?,
            DoubleToInt16 => self.cast(context, op, stream, "int16_t", "int16")?,
            DoubleToInt32 => self.cast(context, op, stream, "int32_t", "int32")?,
            DoubleToInt64 => self.cast(context, op, stream, "int64_t", "int64")?,
            DoubleToUint8 => self.cast(context, op, stream, "uint8_t", "uint8")?,
            DoubleToUint16 => self.cast(context, op, stream, "uint16_t", "uint16")?,
            DoubleToUint32 => self.cast(context, op, stream, "uint32_t", "uint32")?,
            DoubleToUint64 => self.cast(context, op, stream, "uint64_t", "uint64")?,

            NumberToBool8 | NumberToBool16 | NumberToBool32 | NumberToBool64 | FloatToBool
            | DoubleToBool => {
                let a = self.read_expr(context, stream, op)?;
                let a = self.value(a);
                self.engine_chunk(op, "bool", format!("(0 != ({}))", a.text))?
            }
            NameToBool => {
                let a = self.read_expr(context, stream, op)?;
                let a = self.value(a);
                self.engine_chunk(op, "bool", format!("(0 != ({}))", a.text))?
            }
            ClassToBool => {
                let a = self.read_expr(context, stream, op)?;
                let a = self.value(a);
                self.engine_chunk(op, "bool", format!("(0 != ({}).classId)", a.text))?
            }
            ClassToName => {
                let a = self.read_expr(context, stream, op)?;
                let a = self.value(a);
                self.engine_chunk(
                    op,
                    "name",
                    format!("EI->_fnClassToName(EI->self, ({}).classId)", a.text),
                )?
            }
            ClassToString => {
                let a = self.read_expr(context, stream, op)?;
                let a = self.value(a);
                let ty = self
                    .types
                    .resolve_engine_type(Name::new("string"))
                    .ok_or_else(|| self.err(op, TranslateError::UnresolvedReference))?;
                let temp = self.temp(ty);
                let _ = writeln!(
                    self.code,
                    "EI->_fnClassToString(EI->self, ({}).classId, (void*)&{});",
                    a.text, temp.text
                );
                temp
            }

            //--- handle conversions -------------------------------------
            WeakToStrong => {
                let a = self.read_expr(context, stream, op)?;
                let a = self.pointer(a);
                let ty = self
                    .types
                    .resolve_engine_type(Name::new("ptr<ScriptedObject>"))
                    .ok_or_else(|| self.err(op, TranslateError::UnresolvedReference))?;
                let temp = self.temp(ty);
                let _ = writeln!(
                    self.code,
                    "EI->_fnWeakToStrong(EI->self, (void*){}, (void*)&{});",
                    a.text, temp.text
                );
                temp
            }
            WeakToBool => {
                let a = self.read_expr(context, stream, op)?;
                let a = self.pointer(a);
                self.engine_chunk(
                    op,
                    "bool",
                    format!("EI->_fnWeakToBool(EI->self, (void*){})", a.text),
                )?
            }
            StrongToWeak => {
                let a = self.read_expr(context, stream, op)?;
                let a = self.pointer(a);
                let ty = self
                    .types
                    .resolve_engine_type(Name::new("weak<ScriptedObject>"))
                    .ok_or_else(|| self.err(op, TranslateError::UnresolvedReference))?;
                let temp = self.temp(ty);
                let _ = writeln!(
                    self.code,
                    "EI->_fnStrongToWeak(EI->self, (void*){}, (void*)&{});",
                    a.text, temp.text
                );
                temp
            }
            StrongToBool => {
                let a = self.read_expr(context, stream, op)?;
                if a.pointer {
                    self.engine_chunk(op, "bool", format!("(0 != ({})->dataPtr)", a.text))?
                } else {
                    self.engine_chunk(op, "bool", format!("(0 != ({}).dataPtr)", a.text))?
                }
            }

            //--- enum conversions ---------------------------------------
            EnumToInt32 | Int32ToEnum => {
                let a = self.read_expr(context, stream, op)?;
                let a = self.value(a);
                self.engine_chunk(op, "int32", format!("((int32_t)({}))", a.text))?
            }
            EnumToInt64 | Int64ToEnum => {
                let a = self.read_expr(context, stream, op)?;
                let a = self.value(a);
                self.engine_chunk(op, "int64", format!("((int64_t)({}))", a.text))?
            }
            EnumToName => {
                let enum_ty = opcode
                    .stub
                    .and_then(|stub| self.types.resolve_named_stub(self.slab, stub))
                    .ok_or_else(|| self.err(op, TranslateError::UnresolvedReference))?;
                let id = self.types.assign_id(enum_ty);
                let a = self.read_expr(context, stream, op)?;
                let a = self.value(a);
                self.engine_chunk(
                    op,
                    "name",
                    format!(
                        "EI->_fnEnumToName(EI->self, {}, (int64_t)({}))",
                        id, a.text
                    ),
                )?
            }
            NameToEnum => {
                let enum_ty = opcode
                    .stub
                    .and_then(|stub| self.types.resolve_named_stub(self.slab, stub))
                    .ok_or_else(|| self.err(op, TranslateError::UnresolvedReference))?;
                let id = self.types.assign_id(enum_ty);
                let (storage, _) = self.types.enum_storage(enum_ty);
                let c_type = match storage {
                    1 => "uint8_t",
                    2 => "uint16_t",
                    4 => "uint32_t",
                    _ => "uint64_t",
                };
                let a = self.read_expr(context, stream, op)?;
                let a = self.value(a);
                Chunk::new(
                    Some(enum_ty),
                    format!(
                        "(({})EI->_fnNameToEnum(EI->self, stackFrame, {}, {}))",
                        c_type, id, a.text
                    ),
                )
            }

            //--- logical ------------------------------------------------
            LogicNot => {
                let a = self.read_expr(context, stream, op)?;
                let a = self.value(a);
                self.engine_chunk(op, "bool", format!("(!{})", a.text))?
            }
            LogicXor => self.binary_bool(context, op, stream, |a, b| format!("(!!({}) ^ !!({}))", a, b))?,
            LogicAnd | LogicOr => {
                let bool_ty = self
                    .types
                    .resolve_engine_type(Name::new("bool"))
                    .ok_or_else(|| self.err(op, TranslateError::UnresolvedReference))?;
                let result = self.temp(bool_ty);
                let a = self.read_expr(context, stream, op)?;
                let a = self.value(a);
                let _ = writeln!(self.code, "{} = ({});", result.text, a.text);
                if opcode.op == LogicAnd {
                    let _ = writeln!(self.code, "if ({}) {{", result.text);
                } else {
                    let _ = writeln!(self.code, "if (!{}) {{", result.text);
                }
                let b = self.read_expr(context, stream, op)?;
                let b = self.value(b);
                let _ = writeln!(self.code, "{} = ({});", result.text, b.text);
                let _ = writeln!(self.code, "}}");
                // The portable stream carries the short-circuit label
                // after the right-hand side; structured C needs no jump
                if let Some(label) = stream.read() {
                    if self.slab.get(label).as_opcode().map(|o| o.op) != Some(Opcode::Label) {
                        return Err(self.err(op, TranslateError::UnresolvedJumpTarget));
                    }
                }
                result
            }

            //--- comparisons --------------------------------------------
            TestEqual1 | TestEqual2 | TestEqual4 | TestEqual8 => {
                self.binary_bool(context, op, stream, |a, b| format!("(({}) == ({}))", a, b))?
            }
            TestNotEqual1 | TestNotEqual2 | TestNotEqual4 | TestNotEqual8 => {
                self.binary_bool(context, op, stream, |a, b| format!("(({}) != ({}))", a, b))?
            }
            TestSignedLess1 | TestSignedLess2 | TestSignedLess4 | TestSignedLess8
            | TestUnsignedLess1 | TestUnsignedLess2 | TestUnsignedLess4 | TestUnsignedLess8
            | TestFloatLess4 | TestFloatLess8 => {
                self.binary_bool(context, op, stream, |a, b| format!("(({}) < ({}))", a, b))?
            }
            TestSignedLessEqual1 | TestSignedLessEqual2 | TestSignedLessEqual4
            | TestSignedLessEqual8 | TestUnsignedLessEqual1 | TestUnsignedLessEqual2
            | TestUnsignedLessEqual4 | TestUnsignedLessEqual8 | TestFloatLessEqual4
            | TestFloatLessEqual8 => {
                self.binary_bool(context, op, stream, |a, b| format!("(({}) <= ({}))", a, b))?
            }
            TestSignedGreater1 | TestSignedGreater2 | TestSignedGreater4 | TestSignedGreater8
            | TestUnsignedGreater1 | TestUnsignedGreater2 | TestUnsignedGreater4
            | TestUnsignedGreater8 | TestFloatGreater4 | TestFloatGreater8 => {
                self.binary_bool(context, op, stream, |a, b| format!("(({}) > ({}))", a, b))?
            }
            TestSignedGreaterEqual1 | TestSignedGreaterEqual2 | TestSignedGreaterEqual4
            | TestSignedGreaterEqual8 | TestUnsignedGreaterEqual1 | TestUnsignedGreaterEqual2
            | TestUnsignedGreaterEqual4 | TestUnsignedGreaterEqual8 | TestFloatGreaterEqual4
            | TestFloatGreaterEqual8 => {
                self.binary_bool(context, op, stream, |a, b| format!("(({}) >= ({}))", a, b))?
            }
            TestFloatEqual4 | TestFloatEqual8 => {
                self.binary_bool(context, op, stream, |a, b| format!("(({}) == ({}))", a, b))?
            }
            TestFloatNotEqual4 | TestFloatNotEqual8 => {
                self.binary_bool(context, op, stream, |a, b| format!("(({}) != ({}))", a, b))?
            }
            TestEqual | TestNotEqual => {
                let a = self.read_expr(context, stream, op)?;
                let b = self.read_expr(context, stream, op)?;
                let a = self.pointer(a);
                let b = self.pointer(b);
                let ty = a
                    .ty
                    .or(b.ty)
                    .ok_or_else(|| self.err(op, TranslateError::UnresolvedReference))?;
                let id = self.types.assign_id(ty);
                let text = if opcode.op == TestEqual {
                    format!("COMPARE({}, (void*){}, (void*){})", id, a.text, b.text)
                } else {
                    format!("(!COMPARE({}, (void*){}, (void*){}))", id, a.text, b.text)
                };
                self.engine_chunk(op, "bool", text)?
            }

            //--- context shifting ---------------------------------------
            ContextFromValue | ContextFromRef => {
                let target = self.read_expr(context, stream, op)?;
                let target = self.pointer(target);
                let inner_op = stream
                    .read()
                    .ok_or_else(|| self.err(op, TranslateError::UnresolvedJumpTarget))?;
                let inner_context = format!("((void*){})", target.text);
                let result = self.expression(&inner_context, inner_op, stream)?;
                if opcode.op == Opcode::ContextFromRef {
                    // Consume the fallback label that follows the inner
                    // expression in the portable stream
                    if let Some(label) = stream.read() {
                        if self.slab.get(label).as_opcode().map(|o| o.op) != Some(Opcode::Label) {
                            return Err(self.err(op, TranslateError::UnresolvedJumpTarget));
                        }
                    }
                }
                result
            }
            ContextFromPtr | ContextFromPtrRef => {
                let handle = self.read_expr(context, stream, op)?;
                let exit_label = self.statement_exit_label();
                let access = if handle.pointer {
                    format!("({})->dataPtr", handle.text)
                } else {
                    format!("({}).dataPtr", handle.text)
                };
                if self.emit_exceptions {
                    let loc = self.slab.source_loc(op);
                    let _ = writeln!(
                        self.code,
                        "if (0 == ({})) {{ ERROR(\"{}\", {}, \"Accessing NULL pointer\"); goto {}; }}",
                        access,
                        escape_c(&loc.file),
                        loc.line,
                        exit_label
                    );
                } else {
                    let _ = writeln!(self.code, "if (0 == ({})) goto {};", access, exit_label);
                }
                let inner_op = stream
                    .read()
                    .ok_or_else(|| self.err(op, TranslateError::UnresolvedJumpTarget))?;
                let inner_context = format!("({})", access);
                let result = self.expression(&inner_context, inner_op, stream)?;
                if let Some(label) = stream.read() {
                    if self.slab.get(label).as_opcode().map(|o| o.op) != Some(Opcode::Label) {
                        return Err(self.err(op, TranslateError::UnresolvedJumpTarget));
                    }
                }
                result
            }

            //--- object lifecycle ---------------------------------------
            New => {
                let class_ty = opcode
                    .stub
                    .and_then(|stub| self.types.resolve_named_stub(self.slab, stub))
                    .ok_or_else(|| self.err(op, TranslateError::UnresolvedReference))?;
                let id = self.types.assign_id(class_ty);
                let ty = self
                    .types
                    .resolve_engine_type(Name::new("ptr<ScriptedObject>"))
                    .ok_or_else(|| self.err(op, TranslateError::UnresolvedReference))?;
                let temp = self.temp(ty);
                let _ = writeln!(
                    self.code,
                    "EI->_fnNew(EI->self, stackFrame, {}, (void*)&{});",
                    id, temp.text
                );
                temp
            }
            Constructor => {
                let ty = opcode
                    .stub
                    .and_then(|decl| self.types.resolve_decl(self.slab, decl))
                    .ok_or_else(|| self.err(op, TranslateError::UnresolvedReference))?;
                let temp = self.temp(ty);
                let count = opcode.value.as_uint() as usize;
                let members: Vec<_> = self
                    .types
                    .get(ty)
                    .members
                    .iter()
                    .take(count)
                    .map(|m| m.name)
                    .collect();
                for member in members {
                    let value = self.read_expr(context, stream, op)?;
                    let value = self.value(value);
                    let _ = writeln!(self.code, "{}.{} = {};", temp.text, member, value.text);
                }
                temp
            }
            DynamicCast | DynamicWeakCast => {
                let class_ty = opcode
                    .stub
                    .and_then(|stub| self.types.resolve_named_stub(self.slab, stub))
                    .ok_or_else(|| self.err(op, TranslateError::UnresolvedReference))?;
                let id = self.types.assign_id(class_ty);
                let (result_name, callback) = if opcode.op == Opcode::DynamicCast {
                    ("ptr<ScriptedObject>", "_fnDynamicStrongCast")
                } else {
                    ("weak<ScriptedObject>", "_fnDynamicWeakCast")
                };
                let a = self.read_expr(context, stream, op)?;
                let a = self.pointer(a);
                let ty = self
                    .types
                    .resolve_engine_type(Name::new(result_name))
                    .ok_or_else(|| self.err(op, TranslateError::UnresolvedReference))?;
                let temp = self.temp(ty);
                let _ = writeln!(
                    self.code,
                    "EI->{}(EI->self, {}, (void*){}, (void*)&{});",
                    callback, id, a.text, temp.text
                );
                temp
            }
            MetaCast => {
                let class_ty = opcode
                    .stub
                    .and_then(|stub| self.types.resolve_named_stub(self.slab, stub))
                    .ok_or_else(|| self.err(op, TranslateError::UnresolvedReference))?;
                let id = self.types.assign_id(class_ty);
                let a = self.read_expr(context, stream, op)?;
                let a = self.value(a);
                Chunk::new(
                    a.ty,
                    format!(
                        "EI->_fnMetaCast(EI->self, {}, ({}).classId)",
                        id, a.text
                    ),
                )
            }

            //--- calls --------------------------------------------------
            StaticFunc | FinalFunc | VirtualFunc | InternalFunc => {
                let func_stub = opcode
                    .stub
                    .ok_or_else(|| self.err(op, TranslateError::UnresolvedReference))?;
                let func_index = self
                    .types
                    .resolve_function(self.slab, func_stub)
                    .ok_or_else(|| self.err(op, TranslateError::UnresolvedReference))?;
                let func = self.types.func(func_index).clone();

                let call_mode = match opcode.op {
                    VirtualFunc => 1,
                    InternalFunc => 2,
                    _ => 0,
                };

                let mut args_text = Vec::with_capacity(func.args.len());
                for arg in &func.args {
                    let value = self.read_expr(context, stream, op)?;
                    let value = if arg.by_pointer {
                        self.pointer(value)
                    } else {
                        self.value(value)
                    };
                    args_text.push(value.text);
                }

                if func.returns_directly {
                    let mut text = format!(
                        "{}({}, {}, stackFrame",
                        func.c_name, context, call_mode
                    );
                    for arg in &args_text {
                        text.push_str(", ");
                        text.push_str(arg);
                    }
                    text.push(')');
                    Chunk {
                        ty: func.ret,
                        pointer: false,
                        text,
                    }
                } else {
                    // Result must survive past the call statement
                    let ret = func.ret.unwrap();
                    let temp = self.temp(ret);
                    let mut text = format!(
                        "{}({}, {}, stackFrame, (void*)&{}",
                        func.c_name, context, call_mode, temp.text
                    );
                    for arg in &args_text {
                        text.push_str(", ");
                        text.push_str(arg);
                    }
                    text.push(')');
                    let _ = writeln!(self.code, "{};", text);
                    temp
                }
            }

            EnumToString => {
                return Err(self.err(op, TranslateError::UnsupportedOpcode(opcode.op)))
            }

            other => {
                return Err(self.err(op, TranslateError::UnsupportedOpcode(other)));
            }
        };
        Ok(chunk)
    }

    fn sar(
        &mut self,
        context: &str,
        op: StubId,
        stream: &mut OpStream<'_>,
        c_type: &str,
    ) -> EmitResult<Chunk> {
        let a = self.read_expr(context, stream, op)?;
        let b = self.read_expr(context, stream, op)?;
        let a = self.value(a);
        let b = self.value(b);
        Ok(Chunk {
            ty: a.ty,
            pointer: false,
            text: format!("((({})({})) >> ({}))", c_type, a.text, b.text),
        })
    }

    fn compound(
        &mut self,
        context: &str,
        op: StubId,
        stream: &mut OpStream<'_>,
        operator: &str,
    ) -> EmitResult<Chunk> {
        let target = self.read_expr(context, stream, op)?;
        let value = self.read_expr(context, stream, op)?;
        let target = self.pointer(target);
        let value = self.value(value);
        Ok(Chunk {
            ty: value.ty.or(target.ty),
            pointer: false,
            text: format!("((*({})) {} ({}))", target.text, operator, value.text),
        })
    }
}

