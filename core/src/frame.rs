//! The stack-frame interpreter. One [StackFrame] is the execution state of
//! a single call: code pointer, initial and active context objects, the
//! caller-provided parameter block and the zero-initialized local storage.
//!
//! Opcodes are either statements (no result) or expressions that write a
//! value of known width into a caller-supplied destination; sub-expressions
//! are evaluated recursively straight out of the byte stream. Dispatch is
//! a single match over the opcode enum.
//!
//! Raw-memory access is confined to the small read/write helpers here and
//! the handle helpers in [`crate::object`]; every handler states its width
//! through the types it reads and writes.

use crate::{
    codeblock::{decode_opcode, CodeBlock, ParamMode},
    error::RuntimeFault,
    name::Name,
    object::{self, AlignedBuf, FrameView, Host, RtObject},
    registry::{CallParams, FunctionBody, TypeRegistry, MAX_CALL_ARGS},
    types::{FuncId, MetaKind, TypeId},
};

/// Everything a running frame needs from its surroundings.
pub struct ExecCtx<'a> {
    pub registry: &'a TypeRegistry,
    pub host: &'a dyn Host,
    /// Report faults through the host hook and unwind; when false, faults
    /// silently take the compiler-provided fallback path instead
    pub exceptions: bool,
}

impl<'a> ExecCtx<'a> {
    pub fn new(registry: &'a TypeRegistry, host: &'a dyn Host) -> ExecCtx<'a> {
        ExecCtx {
            registry,
            host,
            exceptions: true,
        }
    }
}

/// Call a function by id on a context object. This is the host's entry
/// point into script execution; scripted callees create nested frames on
/// the native call stack.
pub fn call_function(ctx: &ExecCtx<'_>, func: FuncId, context: *mut u8, params: &CallParams) {
    let body = ctx.registry.function(func).body.clone();
    match body {
        FunctionBody::Scripted(block) => {
            let mut frame = StackFrame::new(ctx, std::ptr::null(), &block, context, params);
            frame.run();
        }
        FunctionBody::Native(native) => native(ctx, context, params),
        FunctionBody::Jitted(entry) => {
            // SAFETY: the AOT module was produced for this registry's
            // function table and verified by code hash at bind time
            unsafe {
                entry(
                    context as *mut std::ffi::c_void,
                    std::ptr::null_mut(),
                    params as *const CallParams as *mut CallParams,
                )
            }
        }
        FunctionBody::Empty => {}
    }
}

/// Write a value into an expression destination.
///
/// # Safety
/// `dest` must point at storage large enough for `T`.
unsafe fn write<T>(dest: *mut u8, value: T) {
    (dest as *mut T).write_unaligned(value)
}

/// Read a value of a given width from an address expression result.
///
/// # Safety
/// `src` must point at readable storage of at least `T`'s size.
unsafe fn read_at<T: Copy>(src: *const u8) -> T {
    (src as *const T).read_unaligned()
}

/// Scratch size for statement results; matches the largest value the
/// runtime moves by value.
const SCRATCH_SIZE: usize = 1024;

/// Per-call execution state of the interpreter.
pub struct StackFrame<'a> {
    ctx: &'a ExecCtx<'a>,
    parent: *const StackFrame<'a>,
    block: &'a CodeBlock,
    params: &'a CallParams,
    /// The `this` the frame was entered with; never changes
    context: *mut u8,
    /// Mutated by the context-shift opcodes
    active_context: *mut u8,
    ip: usize,
    locals: AlignedBuf,
    scratch: AlignedBuf,
    faulted: bool,
}

impl<'a> StackFrame<'a> {
    pub fn new(
        ctx: &'a ExecCtx<'a>,
        parent: *const StackFrame<'a>,
        block: &'a CodeBlock,
        context: *mut u8,
        params: &'a CallParams,
    ) -> StackFrame<'a> {
        let locals = AlignedBuf::zeroed(
            block.local_storage_size() as usize,
            block.local_storage_align() as usize,
        );
        StackFrame {
            ctx,
            parent,
            block,
            params,
            context,
            active_context: context,
            ip: 0,
            locals,
            scratch: AlignedBuf::zeroed(SCRATCH_SIZE, 16),
            faulted: false,
        }
    }

    pub fn function_name(&self) -> Name {
        self.block.name()
    }

    pub fn class_name(&self) -> Name {
        self.block.class_name()
    }

    pub fn view(&self) -> FrameView {
        FrameView {
            function: self.block.name(),
            class: self.block.class_name(),
            source_file: self.block.source_file().to_owned(),
            line: self
                .block
                .source_line_for_offset(self.ip as u32)
                .unwrap_or_else(|| self.block.source_line()),
        }
    }

    /// The call chain from this frame outwards.
    pub fn backtrace(&self) -> Vec<FrameView> {
        let mut views = vec![self.view()];
        let mut cursor = self.parent;
        while !cursor.is_null() {
            // SAFETY: parent frames live further down the native call
            // stack and outlive this frame
            let frame = unsafe { &*cursor };
            views.push(frame.view());
            cursor = frame.parent;
        }
        views
    }

    pub fn faulted(&self) -> bool {
        self.faulted
    }

    /// Execute until the code stream is exhausted or the function returns.
    pub fn run(&mut self) {
        let end = self.block.code().len();
        while self.ip < end {
            // Statement results land in the scratch pad; zeroing it keeps
            // discarded handle writes from seeing stale pointers
            // SAFETY: scratch is an owned SCRATCH_SIZE allocation
            unsafe { std::ptr::write_bytes(self.scratch.as_ptr(), 0, SCRATCH_SIZE) };
            let dest = self.scratch.as_ptr();
            self.step(dest);
        }
        self.release_locals();
    }

    /// Locals are destructed by LocalDtor opcodes on normal paths; after a
    /// fault unwound the function early, whatever non-trivial locals were
    /// constructed still hold live values. Handles and arrays can be
    /// reclaimed blindly because a zeroed slot is a valid null for them.
    fn release_locals(&mut self) {
        if !self.faulted {
            return;
        }
        let registry = self.ctx.registry;
        for local in self.block.locals() {
            let def = registry.type_def(local.ty);
            let reclaim = matches!(
                def.kind,
                MetaKind::StrongHandle | MetaKind::WeakHandle | MetaKind::DynamicArray
            );
            if reclaim {
                // SAFETY: offset is inside the locals block, slot is
                // either zeroed or a constructed value of this type
                unsafe { registry.destruct(local.ty, self.locals.as_ptr().add(local.offset as usize)) };
            }
        }
    }

    fn terminate(&mut self) {
        self.ip = self.block.code().len();
    }

    /// Report a fault and unwind the current function.
    fn fault(&mut self, fault: RuntimeFault) {
        self.ctx.host.exception(&self.view(), fault);
        self.faulted = true;
        self.terminate();
    }

    /// Fault with a compiler-provided fallback label: with exceptions
    /// enabled the host is told and the function unwinds; without, the
    /// fallback path is taken silently.
    fn fault_with_fallback(&mut self, fault: RuntimeFault, fallback_ip: usize) {
        if self.ctx.exceptions {
            self.fault(fault);
        } else {
            self.ip = fallback_ip;
        }
    }

    //--- stream reading --------------------------------------------------

    fn read_bytes<const N: usize>(&mut self) -> [u8; N] {
        let code = self.block.code();
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(&code[self.ip..self.ip + N]);
        self.ip += N;
        bytes
    }

    fn read_u8(&mut self) -> u8 {
        let b = self.block.code()[self.ip];
        self.ip += 1;
        b
    }

    fn read_u16(&mut self) -> u16 {
        u16::from_le_bytes(self.read_bytes())
    }

    fn read_i16(&mut self) -> i16 {
        i16::from_le_bytes(self.read_bytes())
    }

    fn read_u32(&mut self) -> u32 {
        u32::from_le_bytes(self.read_bytes())
    }

    fn read_u64(&mut self) -> u64 {
        u64::from_le_bytes(self.read_bytes())
    }

    fn read_type_id(&mut self) -> TypeId {
        TypeId(self.read_u16())
    }

    /// Apply a jump delta measured from the position right after the
    /// 16-bit offset field.
    fn jump(&mut self, base: usize, delta: i16) {
        self.ip = (base as i64 + delta as i64) as usize;
    }

    //--- expression evaluation -------------------------------------------

    fn eval<T: Copy + Default>(&mut self) -> T {
        let mut value = T::default();
        self.step(&mut value as *mut T as *mut u8);
        value
    }

    fn eval_bool(&mut self) -> bool {
        self.eval::<u8>() != 0
    }

    fn eval_ptr(&mut self) -> *mut u8 {
        let mut ptr: *mut u8 = std::ptr::null_mut();
        self.step(&mut ptr as *mut *mut u8 as *mut u8);
        ptr
    }

    /// Evaluate an enum-typed child at its storage width, widened to i64.
    fn eval_enum_value(&mut self, size: u8, signed: bool) -> i64 {
        match (size, signed) {
            (1, true) => self.eval::<i8>() as i64,
            (1, false) => self.eval::<u8>() as i64,
            (2, true) => self.eval::<i16>() as i64,
            (2, false) => self.eval::<u16>() as i64,
            (4, true) => self.eval::<i32>() as i64,
            (4, false) => self.eval::<u32>() as i64,
            _ => self.eval::<i64>(),
        }
    }

    //--- function calls --------------------------------------------------

    fn do_call(&mut self, dest: *mut u8, virtual_dispatch: bool, internal: bool) {
        let func_id = FuncId(self.read_u16());
        let encoding = crate::codeblock::CallEncoding(self.read_u64());
        let registry = self.ctx.registry;
        let function = registry.function(func_id);
        let param_types: Vec<_> = function.params.clone();
        let is_static = function.is_static;
        let name = function.name;
        let ret = function.ret;

        // A call in statement position lands its result in the scratch
        // pad, which is not constructed storage; results that need real
        // construction go through a typed temporary instead.
        let mut ret_temp: Option<(TypeId, AlignedBuf)> = None;
        let dest = if dest == self.scratch.as_ptr() {
            match ret {
                Some(param) if !registry.type_def(param.ty).traits.simple_copy => {
                    let def = registry.type_def(param.ty);
                    let temp = AlignedBuf::zeroed(def.size as usize, def.align.max(1) as usize);
                    // SAFETY: fresh zeroed storage of the return type
                    unsafe { registry.construct(param.ty, temp.as_ptr()) };
                    let ptr = temp.as_ptr();
                    ret_temp = Some((param.ty, temp));
                    ptr
                }
                _ => dest,
            }
        } else {
            dest
        };

        // Argument storage for by-value modes
        let arg_storage = AlignedBuf::zeroed(512, 16);
        let mut storage_used = 0usize;
        let mut typed_temps: Vec<(TypeId, *mut u8)> = Vec::new();

        let mut params = CallParams::new(dest);
        for i in 0..MAX_CALL_ARGS {
            match encoding.mode(i) {
                ParamMode::None => break,
                ParamMode::Ref => {
                    params.args[i] = self.eval_ptr();
                }
                ParamMode::SimpleValue | ParamMode::TypedValue => {
                    let ty = param_types
                        .get(i)
                        .map(|p| p.ty)
                        .unwrap_or(registry.primitives.int64);
                    let def = registry.type_def(ty);
                    let align = def.align.max(1) as usize;
                    let offset = (storage_used + align - 1) & !(align - 1);
                    storage_used = offset + def.size as usize;
                    assert!(storage_used <= arg_storage.len(), "argument storage overflow");
                    let slot =
                        // SAFETY: offset stays within the 512-byte block,
                        // checked above
                        unsafe { arg_storage.as_ptr().add(offset) };
                    if encoding.mode(i) == ParamMode::TypedValue {
                        // SAFETY: fresh zeroed, aligned storage of the
                        // type's size
                        unsafe { registry.construct(ty, slot) };
                        typed_temps.push((ty, slot));
                    }
                    self.step(slot);
                    params.args[i] = slot;
                }
            }
        }

        // Virtual calls re-dispatch on the receiver's class
        let mut target = func_id;
        if virtual_dispatch && !self.active_context.is_null() {
            // SAFETY: a non-null context of a class method is an RtObject
            let class = unsafe { (*(self.active_context as *const RtObject)).class() };
            if let Some(override_id) = registry.find_class_function(class, name) {
                target = override_id;
            }
        }

        let call_context = if is_static || internal {
            std::ptr::null_mut()
        } else {
            self.active_context
        };
        self.invoke(target, call_context, &params);

        for (ty, slot) in typed_temps {
            // SAFETY: constructed above and not moved out of
            unsafe { registry.destruct(ty, slot) };
        }
        if let Some((ty, temp)) = ret_temp {
            // SAFETY: constructed before the call
            unsafe { registry.destruct(ty, temp.as_ptr()) };
        }
    }

    fn invoke(&mut self, func: FuncId, context: *mut u8, params: &CallParams) {
        let body = self.ctx.registry.function(func).body.clone();
        match body {
            FunctionBody::Scripted(block) => {
                let parent = self as *const StackFrame<'a>;
                let mut child = StackFrame::new(self.ctx, parent, &block, context, params);
                child.run();
            }
            FunctionBody::Native(native) => native(self.ctx, context, params),
            FunctionBody::Jitted(entry) => {
                // SAFETY: bound only after a code-hash match against this
                // registry's function
                unsafe {
                    entry(
                        context as *mut std::ffi::c_void,
                        self as *mut StackFrame<'a> as *mut std::ffi::c_void,
                        params as *const CallParams as *mut CallParams,
                    )
                }
            }
            FunctionBody::Empty => {}
        }
    }

    //--- dispatch ---------------------------------------------------------

    /// Execute one opcode, writing its result (if it is an expression)
    /// into `dest`.
    fn step(&mut self, dest: *mut u8) {
        use crate::opcodes::Opcode::*;

        let (op, next) = match decode_opcode(self.block.code(), self.ip) {
            Some(decoded) => decoded,
            None => {
                self.fault(RuntimeFault::UnimplementedOpcode);
                return;
            }
        };
        self.ip = next;

        macro_rules! cvt {
            ($src:ty => $dst:ty) => {{
                let v = self.eval::<$src>();
                // SAFETY: dest holds at least the result width
                unsafe { write(dest, v as $dst) };
            }};
        }
        macro_rules! int_binop {
            ($ty:ty, $method:ident) => {{
                let a = self.eval::<$ty>();
                let b = self.eval::<$ty>();
                // SAFETY: dest holds at least the result width
                unsafe { write(dest, a.$method(b)) };
            }};
        }
        macro_rules! float_binop {
            ($ty:ty, $op:tt) => {{
                let a = self.eval::<$ty>();
                let b = self.eval::<$ty>();
                // SAFETY: dest holds at least the result width
                unsafe { write(dest, a $op b) };
            }};
        }
        macro_rules! int_div {
            ($ty:ty, $method:ident) => {{
                let a = self.eval::<$ty>();
                let b = self.eval::<$ty>();
                if b == 0 {
                    // SAFETY: dest holds at least the result width
                    unsafe { write(dest, 0 as $ty) };
                    self.fault(RuntimeFault::DivisionByZero);
                } else {
                    // SAFETY: as above
                    unsafe { write(dest, a.$method(b)) };
                }
            }};
        }
        macro_rules! cmp {
            ($ty:ty, $op:tt) => {{
                let a = self.eval::<$ty>();
                let b = self.eval::<$ty>();
                // SAFETY: dest holds at least one byte
                unsafe { write(dest, (a $op b) as u8) };
            }};
        }
        macro_rules! minmax {
            ($ty:ty, $method:ident) => {{
                let a = self.eval::<$ty>();
                let b = self.eval::<$ty>();
                // SAFETY: dest holds at least the result width
                unsafe { write(dest, a.$method(b)) };
            }};
        }
        macro_rules! clamp {
            ($ty:ty) => {{
                let v = self.eval::<$ty>();
                let lo = self.eval::<$ty>();
                let hi = self.eval::<$ty>();
                // min/max keeps inverted bounds from panicking
                // SAFETY: dest holds at least the result width
                unsafe { write(dest, v.max(lo).min(hi)) };
            }};
        }
        macro_rules! load {
            ($ty:ty) => {{
                let p = self.eval_ptr();
                if !p.is_null() {
                    // SAFETY: address expressions produce valid value slots
                    unsafe { write(dest, read_at::<$ty>(p)) };
                }
            }};
        }
        macro_rules! assign {
            ($ty:ty) => {{
                let p = self.eval_ptr();
                let v = self.eval::<$ty>();
                if !p.is_null() {
                    // SAFETY: the target expression produced a writable slot
                    unsafe { (p as *mut $ty).write_unaligned(v) };
                }
            }};
        }
        macro_rules! incdec {
            ($ty:ty, $method:ident, $pre:expr) => {{
                let p = self.eval_ptr();
                if !p.is_null() {
                    // SAFETY: the child is an address expression
                    unsafe {
                        let old = read_at::<$ty>(p);
                        let new = old.$method(1);
                        (p as *mut $ty).write_unaligned(new);
                        write(dest, if $pre { new } else { old });
                    }
                }
            }};
        }
        macro_rules! compound {
            ($ty:ty, $method:ident) => {{
                let p = self.eval_ptr();
                let v = self.eval::<$ty>();
                if !p.is_null() {
                    // SAFETY: the target expression produced a writable slot
                    unsafe {
                        let new = read_at::<$ty>(p).$method(v);
                        (p as *mut $ty).write_unaligned(new);
                        write(dest, new);
                    }
                }
            }};
        }
        macro_rules! compound_div {
            ($ty:ty, $method:ident) => {{
                let p = self.eval_ptr();
                let v = self.eval::<$ty>();
                if v == 0 {
                    self.fault(RuntimeFault::DivisionByZero);
                } else if !p.is_null() {
                    // SAFETY: the target expression produced a writable slot
                    unsafe {
                        let new = read_at::<$ty>(p).$method(v);
                        (p as *mut $ty).write_unaligned(new);
                        write(dest, new);
                    }
                }
            }};
        }
        macro_rules! compound_float {
            ($ty:ty, $op:tt) => {{
                let p = self.eval_ptr();
                let v = self.eval::<$ty>();
                if !p.is_null() {
                    // SAFETY: the target expression produced a writable slot
                    unsafe {
                        let new = read_at::<$ty>(p) $op v;
                        (p as *mut $ty).write_unaligned(new);
                        write(dest, new);
                    }
                }
            }};
        }
        macro_rules! shift {
            ($ty:ty, $method:ident) => {{
                let a = self.eval::<$ty>();
                let b = self.eval::<$ty>();
                // SAFETY: dest holds at least the result width
                unsafe { write(dest, a.$method(b as u32)) };
            }};
        }
        macro_rules! shift_assign {
            ($ty:ty, $method:ident) => {{
                let p = self.eval_ptr();
                let v = self.eval::<$ty>();
                if !p.is_null() {
                    // SAFETY: the target expression produced a writable slot
                    unsafe {
                        let new = read_at::<$ty>(p).$method(v as u32);
                        (p as *mut $ty).write_unaligned(new);
                        write(dest, new);
                    }
                }
            }};
        }
        macro_rules! unary {
            ($ty:ty, |$v:ident| $body:expr) => {{
                let $v = self.eval::<$ty>();
                // SAFETY: dest holds at least the result width
                unsafe { write(dest, $body) };
            }};
        }
        macro_rules! bit_binop {
            ($ty:ty, $op:tt) => {{
                let a = self.eval::<$ty>();
                let b = self.eval::<$ty>();
                // SAFETY: dest holds at least the result width
                unsafe { write(dest, a $op b) };
            }};
        }
        macro_rules! compound_bitop {
            ($ty:ty, $op:tt) => {{
                let p = self.eval_ptr();
                let v = self.eval::<$ty>();
                if !p.is_null() {
                    // SAFETY: the target expression produced a writable slot
                    unsafe {
                        let new = read_at::<$ty>(p) $op v;
                        (p as *mut $ty).write_unaligned(new);
                        write(dest, new);
                    }
                }
            }};
        }

        match op {
            //--- control --------------------------------------------------
            Nop | Label | Passthrough => {
                if op == Passthrough {
                    self.step(dest);
                }
            }
            Exit => self.terminate(),
            Breakpoint => {
                let index = self.read_u16();
                if self.block.breakpoint_enabled(index) {
                    let line = self
                        .block
                        .breakpoints()
                        .get(index as usize)
                        .map(|placement| placement.source_line)
                        .unwrap_or(0);
                    self.ctx.host.breakpoint(&self.view(), line);
                }
            }
            Jump => {
                let delta = self.read_i16();
                let base = self.ip;
                self.jump(base, delta);
            }
            JumpIfFalse => {
                let delta = self.read_i16();
                let base = self.ip;
                if !self.eval_bool() {
                    self.jump(base, delta);
                }
            }

            //--- constants ------------------------------------------------
            Null => {
                // SAFETY: dest is a zeroed or initialized strong slot
                unsafe { object::strong_store(self.ctx.registry, dest, None) };
            }
            BoolTrue => unsafe { write(dest, 1u8) },
            BoolFalse => unsafe { write(dest, 0u8) },
            IntOne => unsafe { write(dest, 1i32) },
            IntZero => unsafe { write(dest, 0i32) },
            IntConst1 => {
                let v = self.read_u8() as i8;
                unsafe { write(dest, v) };
            }
            IntConst2 => {
                let v = self.read_u16() as i16;
                unsafe { write(dest, v) };
            }
            IntConst4 => {
                let v = self.read_u32() as i32;
                unsafe { write(dest, v) };
            }
            IntConst8 => {
                let v = self.read_u64() as i64;
                unsafe { write(dest, v) };
            }
            UintConst1 => {
                let v = self.read_u8();
                unsafe { write(dest, v) };
            }
            UintConst2 => {
                let v = self.read_u16();
                unsafe { write(dest, v) };
            }
            UintConst4 => {
                let v = self.read_u32();
                unsafe { write(dest, v) };
            }
            UintConst8 => {
                let v = self.read_u64();
                unsafe { write(dest, v) };
            }
            FloatConst => {
                let v = f32::from_le_bytes(self.read_bytes());
                unsafe { write(dest, v) };
            }
            DoubleConst => {
                let v = f64::from_le_bytes(self.read_bytes());
                unsafe { write(dest, v) };
            }
            NameConst => {
                let id = self.read_u16();
                let name = self.block.name_at(id);
                unsafe { write(dest, name.raw()) };
            }
            StringConst => {
                let id = self.read_u16();
                let text = self.block.string_at(id).to_owned();
                // SAFETY: string destinations are constructed storage
                unsafe { (*(dest as *mut String)).clone_from(&text) };
            }
            EnumConst => {
                // Narrowed to IntConst/UintConst at build time
                self.fault(RuntimeFault::UnimplementedOpcode);
            }
            ClassConst => {
                let class = self.read_u16();
                unsafe { write(dest, class as u32) };
            }

            //--- integer width conversions --------------------------------
            ExpandSigned8To16 => cvt!(i8 => i16),
            ExpandSigned8To32 => cvt!(i8 => i32),
            ExpandSigned8To64 => cvt!(i8 => i64),
            ExpandSigned16To32 => cvt!(i16 => i32),
            ExpandSigned16To64 => cvt!(i16 => i64),
            ExpandSigned32To64 => cvt!(i32 => i64),
            ExpandUnsigned8To16 => cvt!(u8 => u16),
            ExpandUnsigned8To32 => cvt!(u8 => u32),
            ExpandUnsigned8To64 => cvt!(u8 => u64),
            ExpandUnsigned16To32 => cvt!(u16 => u32),
            ExpandUnsigned16To64 => cvt!(u16 => u64),
            ExpandUnsigned32To64 => cvt!(u32 => u64),
            Contract64To32 => cvt!(u64 => u32),
            Contract64To16 => cvt!(u64 => u16),
            Contract64To8 => cvt!(u64 => u8),
            Contract32To16 => cvt!(u32 => u16),
            Contract32To8 => cvt!(u32 => u8),
            Contract16To8 => cvt!(u16 => u8),

            //--- float conversions ----------------------------------------
            FloatToInt8 => cvt!(f32 => i8),
            FloatToInt16 => cvt!(f32 => i16),
            FloatToInt32 => cvt!(f32 => i32),
            FloatToInt64 => cvt!(f32 => i64),
            FloatToUint8 => cvt!(f32 => u8),
            FloatToUint16 => cvt!(f32 => u16),
            FloatToUint32 => cvt!(f32 => u32),
            FloatToUint64 => cvt!(f32 => u64),
            FloatFromInt8 => cvt!(i8 => f32),
            FloatFromInt16 => cvt!(i16 => f32),
            FloatFromInt32 => cvt!(i32 => f32),
            FloatFromInt64 => cvt!(i64 => f32),
            FloatFromUint8 => cvt!(u8 => f32),
            FloatFromUint16 => cvt!(u16 => f32),
            FloatFromUint32 => cvt!(u32 => f32),
            FloatFromUint64 => cvt!(u64 => f32),
            FloatToDouble => cvt!(f32 => f64),
            FloatFromDouble => cvt!(f64 => f32),
            DoubleToInt8 => cvt!(f64 => i8),
            DoubleToInt16 => cvt!(f64 => i16),
            DoubleToInt32 => cvt!(f64 => i32),
            DoubleToInt64 => cvt!(f64 => i64),
            DoubleToUint8 => cvt!(f64 => u8),
            DoubleToUint16 => cvt!(f64 => u16),
            DoubleToUint32 => cvt!(f64 => u32),
            DoubleToUint64 => cvt!(f64 => u64),
            DoubleFromInt8 => cvt!(i8 => f64),
            DoubleFromInt16 => cvt!(i16 => f64),
            DoubleFromInt32 => cvt!(i32 => f64),
            DoubleFromInt64 => cvt!(i64 => f64),
            DoubleFromUint8 => cvt!(u8 => f64),
            DoubleFromUint16 => cvt!(u16 => f64),
            DoubleFromUint32 => cvt!(u32 => f64),
            DoubleFromUint64 => cvt!(u64 => f64),

            //--- to bool and reference conversions ------------------------
            NumberToBool8 => unary!(u8, |v| (v != 0) as u8),
            NumberToBool16 => unary!(u16, |v| (v != 0) as u8),
            NumberToBool32 => unary!(u32, |v| (v != 0) as u8),
            NumberToBool64 => unary!(u64, |v| (v != 0) as u8),
            FloatToBool => unary!(f32, |v| (v != 0.0) as u8),
            DoubleToBool => unary!(f64, |v| (v != 0.0) as u8),
            NameToBool => unary!(u32, |v| (v != 0) as u8),
            ClassToBool => unary!(u32, |v| (v != 0) as u8),
            ClassToName => {
                let v = self.eval::<u32>();
                let name = self.ctx.registry.type_def(TypeId(v as u16)).name;
                unsafe { write(dest, name.raw()) };
            }
            ClassToString => {
                let v = self.eval::<u32>();
                let name = self.ctx.registry.type_def(TypeId(v as u16)).name;
                // SAFETY: string destinations are constructed storage
                unsafe { (*(dest as *mut String)).clone_from(&name.as_str().to_owned()) };
            }
            WeakToStrong => {
                let mut slot = [0u8; 8];
                self.step(slot.as_mut_ptr());
                // SAFETY: slot holds an owned weak handle written by the
                // child expression; dest is a valid strong slot
                unsafe {
                    object::weak_to_strong(self.ctx.registry, dest, slot.as_ptr());
                    object::weak_release(slot.as_mut_ptr());
                }
            }
            WeakToBool => {
                let mut slot = [0u8; 8];
                self.step(slot.as_mut_ptr());
                // SAFETY: as above
                unsafe {
                    let alive = object::weak_is_alive(slot.as_ptr());
                    object::weak_release(slot.as_mut_ptr());
                    write(dest, alive as u8);
                }
            }
            StrongToWeak => {
                let mut slot = [0u8; 8];
                self.step(slot.as_mut_ptr());
                // SAFETY: slot holds an owned strong handle
                unsafe {
                    object::strong_to_weak(dest, slot.as_ptr());
                    object::strong_release(self.ctx.registry, slot.as_mut_ptr());
                }
            }
            StrongToBool => {
                let mut slot = [0u8; 8];
                self.step(slot.as_mut_ptr());
                // SAFETY: as above
                unsafe {
                    let set = object::strong_get(slot.as_ptr()).is_some();
                    object::strong_release(self.ctx.registry, slot.as_mut_ptr());
                    write(dest, set as u8);
                }
            }
            EnumToInt32 | EnumToInt64 | Int32ToEnum | Int64ToEnum => {
                // Narrowed to width ops at build time
                self.fault(RuntimeFault::UnimplementedOpcode);
            }
            EnumToName => {
                let ty = self.read_type_id();
                let info = self.ctx.registry.type_def(ty).enum_info.clone().unwrap_or_default();
                let v = self.eval_enum_value(info.size, info.signed);
                let name = info.find_name(v).unwrap_or_default();
                unsafe { write(dest, name.raw()) };
            }
            EnumToString => {
                let ty = self.read_type_id();
                let info = self.ctx.registry.type_def(ty).enum_info.clone().unwrap_or_default();
                let v = self.eval_enum_value(info.size, info.signed);
                let text = info
                    .find_name(v)
                    .map(|name| name.as_str().to_owned())
                    .unwrap_or_else(|| v.to_string());
                // SAFETY: string destinations are constructed storage
                unsafe { (*(dest as *mut String)).clone_from(&text) };
            }
            NameToEnum => {
                let ty = self.read_type_id();
                let info = self.ctx.registry.type_def(ty).enum_info.clone().unwrap_or_default();
                let name = Name::from_raw(self.eval::<u32>());
                match info.find_value(name) {
                    Some(v) => {
                        // SAFETY: enum destinations hold `size` bytes
                        unsafe {
                            match info.size {
                                1 => write(dest, v as u8),
                                2 => write(dest, v as u16),
                                4 => write(dest, v as u32),
                                _ => write(dest, v as u64),
                            }
                        }
                    }
                    None => self.fault(RuntimeFault::UnknownEnumOption),
                }
            }

            //--- arithmetic -----------------------------------------------
            AddInt8 => int_binop!(u8, wrapping_add),
            AddInt16 => int_binop!(u16, wrapping_add),
            AddInt32 => int_binop!(u32, wrapping_add),
            AddInt64 => int_binop!(u64, wrapping_add),
            SubInt8 => int_binop!(u8, wrapping_sub),
            SubInt16 => int_binop!(u16, wrapping_sub),
            SubInt32 => int_binop!(u32, wrapping_sub),
            SubInt64 => int_binop!(u64, wrapping_sub),
            MulSigned8 => int_binop!(i8, wrapping_mul),
            MulSigned16 => int_binop!(i16, wrapping_mul),
            MulSigned32 => int_binop!(i32, wrapping_mul),
            MulSigned64 => int_binop!(i64, wrapping_mul),
            MulUnsigned8 => int_binop!(u8, wrapping_mul),
            MulUnsigned16 => int_binop!(u16, wrapping_mul),
            MulUnsigned32 => int_binop!(u32, wrapping_mul),
            MulUnsigned64 => int_binop!(u64, wrapping_mul),
            DivSigned8 => int_div!(i8, wrapping_div),
            DivSigned16 => int_div!(i16, wrapping_div),
            DivSigned32 => int_div!(i32, wrapping_div),
            DivSigned64 => int_div!(i64, wrapping_div),
            DivUnsigned8 => int_div!(u8, wrapping_div),
            DivUnsigned16 => int_div!(u16, wrapping_div),
            DivUnsigned32 => int_div!(u32, wrapping_div),
            DivUnsigned64 => int_div!(u64, wrapping_div),
            ModSigned8 => int_div!(i8, wrapping_rem),
            ModSigned16 => int_div!(i16, wrapping_rem),
            ModSigned32 => int_div!(i32, wrapping_rem),
            ModSigned64 => int_div!(i64, wrapping_rem),
            ModUnsigned8 => int_div!(u8, wrapping_rem),
            ModUnsigned16 => int_div!(u16, wrapping_rem),
            ModUnsigned32 => int_div!(u32, wrapping_rem),
            ModUnsigned64 => int_div!(u64, wrapping_rem),
            NegSigned8 => unary!(i8, |v| v.wrapping_neg()),
            NegSigned16 => unary!(i16, |v| v.wrapping_neg()),
            NegSigned32 => unary!(i32, |v| v.wrapping_neg()),
            NegSigned64 => unary!(i64, |v| v.wrapping_neg()),
            NegFloat => unary!(f32, |v| -v),
            NegDouble => unary!(f64, |v| -v),
            AddFloat => float_binop!(f32, +),
            SubFloat => float_binop!(f32, -),
            MulFloat => float_binop!(f32, *),
            DivFloat => float_binop!(f32, /),
            ModFloat => float_binop!(f32, %),
            AddDouble => float_binop!(f64, +),
            SubDouble => float_binop!(f64, -),
            MulDouble => float_binop!(f64, *),
            DivDouble => float_binop!(f64, /),
            ModDouble => float_binop!(f64, %),

            //--- min/max/clamp/abs/sign -----------------------------------
            MinSigned8 => minmax!(i8, min),
            MinSigned16 => minmax!(i16, min),
            MinSigned32 => minmax!(i32, min),
            MinSigned64 => minmax!(i64, min),
            MinUnsigned8 => minmax!(u8, min),
            MinUnsigned16 => minmax!(u16, min),
            MinUnsigned32 => minmax!(u32, min),
            MinUnsigned64 => minmax!(u64, min),
            MinFloat => minmax!(f32, min),
            MinDouble => minmax!(f64, min),
            MaxSigned8 => minmax!(i8, max),
            MaxSigned16 => minmax!(i16, max),
            MaxSigned32 => minmax!(i32, max),
            MaxSigned64 => minmax!(i64, max),
            MaxUnsigned8 => minmax!(u8, max),
            MaxUnsigned16 => minmax!(u16, max),
            MaxUnsigned32 => minmax!(u32, max),
            MaxUnsigned64 => minmax!(u64, max),
            MaxFloat => minmax!(f32, max),
            MaxDouble => minmax!(f64, max),
            ClampSigned8 => clamp!(i8),
            ClampSigned16 => clamp!(i16),
            ClampSigned32 => clamp!(i32),
            ClampSigned64 => clamp!(i64),
            ClampUnsigned8 => clamp!(u8),
            ClampUnsigned16 => clamp!(u16),
            ClampUnsigned32 => clamp!(u32),
            ClampUnsigned64 => clamp!(u64),
            ClampFloat => clamp!(f32),
            ClampDouble => clamp!(f64),
            Abs8 => unary!(i8, |v| v.wrapping_abs()),
            Abs16 => unary!(i16, |v| v.wrapping_abs()),
            Abs32 => unary!(i32, |v| v.wrapping_abs()),
            Abs64 => unary!(i64, |v| v.wrapping_abs()),
            AbsFloat => unary!(f32, |v| v.abs()),
            AbsDouble => unary!(f64, |v| v.abs()),
            Sign8 => unary!(i8, |v| v.signum()),
            Sign16 => unary!(i16, |v| v.signum()),
            Sign32 => unary!(i32, |v| v.signum()),
            Sign64 => unary!(i64, |v| v.signum()),
            SignFloat => unary!(f32, |v| if v > 0.0 {
                1.0f32
            } else if v < 0.0 {
                -1.0
            } else {
                0.0
            }),
            SignDouble => unary!(f64, |v| if v > 0.0 {
                1.0f64
            } else if v < 0.0 {
                -1.0
            } else {
                0.0
            }),

            //--- increments -----------------------------------------------
            PreIncrement8 => incdec!(u8, wrapping_add, true),
            PreIncrement16 => incdec!(u16, wrapping_add, true),
            PreIncrement32 => incdec!(u32, wrapping_add, true),
            PreIncrement64 => incdec!(u64, wrapping_add, true),
            PreDecrement8 => incdec!(u8, wrapping_sub, true),
            PreDecrement16 => incdec!(u16, wrapping_sub, true),
            PreDecrement32 => incdec!(u32, wrapping_sub, true),
            PreDecrement64 => incdec!(u64, wrapping_sub, true),
            PostIncrement8 => incdec!(u8, wrapping_add, false),
            PostIncrement16 => incdec!(u16, wrapping_add, false),
            PostIncrement32 => incdec!(u32, wrapping_add, false),
            PostIncrement64 => incdec!(u64, wrapping_add, false),
            PostDecrement8 => incdec!(u8, wrapping_sub, false),
            PostDecrement16 => incdec!(u16, wrapping_sub, false),
            PostDecrement32 => incdec!(u32, wrapping_sub, false),
            PostDecrement64 => incdec!(u64, wrapping_sub, false),

            //--- bitwise --------------------------------------------------
            BitAnd8 => bit_binop!(u8, &),
            BitAnd16 => bit_binop!(u16, &),
            BitAnd32 => bit_binop!(u32, &),
            BitAnd64 => bit_binop!(u64, &),
            BitOr8 => bit_binop!(u8, |),
            BitOr16 => bit_binop!(u16, |),
            BitOr32 => bit_binop!(u32, |),
            BitOr64 => bit_binop!(u64, |),
            BitXor8 => bit_binop!(u8, ^),
            BitXor16 => bit_binop!(u16, ^),
            BitXor32 => bit_binop!(u32, ^),
            BitXor64 => bit_binop!(u64, ^),
            BitNot8 => unary!(u8, |v| !v),
            BitNot16 => unary!(u16, |v| !v),
            BitNot32 => unary!(u32, |v| !v),
            BitNot64 => unary!(u64, |v| !v),
            BitShl8 => shift!(u8, wrapping_shl),
            BitShl16 => shift!(u16, wrapping_shl),
            BitShl32 => shift!(u32, wrapping_shl),
            BitShl64 => shift!(u64, wrapping_shl),
            BitShr8 => shift!(u8, wrapping_shr),
            BitShr16 => shift!(u16, wrapping_shr),
            BitShr32 => shift!(u32, wrapping_shr),
            BitShr64 => shift!(u64, wrapping_shr),
            BitSar8 => shift!(i8, wrapping_shr),
            BitSar16 => shift!(i16, wrapping_shr),
            BitSar32 => shift!(i32, wrapping_shr),
            BitSar64 => shift!(i64, wrapping_shr),

            //--- compound assignment --------------------------------------
            AddAssignInt8 => compound!(u8, wrapping_add),
            AddAssignInt16 => compound!(u16, wrapping_add),
            AddAssignInt32 => compound!(u32, wrapping_add),
            AddAssignInt64 => compound!(u64, wrapping_add),
            SubAssignInt8 => compound!(u8, wrapping_sub),
            SubAssignInt16 => compound!(u16, wrapping_sub),
            SubAssignInt32 => compound!(u32, wrapping_sub),
            SubAssignInt64 => compound!(u64, wrapping_sub),
            MulAssignSignedInt8 => compound!(i8, wrapping_mul),
            MulAssignSignedInt16 => compound!(i16, wrapping_mul),
            MulAssignSignedInt32 => compound!(i32, wrapping_mul),
            MulAssignSignedInt64 => compound!(i64, wrapping_mul),
            DivAssignSignedInt8 => compound_div!(i8, wrapping_div),
            DivAssignSignedInt16 => compound_div!(i16, wrapping_div),
            DivAssignSignedInt32 => compound_div!(i32, wrapping_div),
            DivAssignSignedInt64 => compound_div!(i64, wrapping_div),
            MulAssignUnsignedInt8 => compound!(u8, wrapping_mul),
            MulAssignUnsignedInt16 => compound!(u16, wrapping_mul),
            MulAssignUnsignedInt32 => compound!(u32, wrapping_mul),
            MulAssignUnsignedInt64 => compound!(u64, wrapping_mul),
            DivAssignUnsignedInt8 => compound_div!(u8, wrapping_div),
            DivAssignUnsignedInt16 => compound_div!(u16, wrapping_div),
            DivAssignUnsignedInt32 => compound_div!(u32, wrapping_div),
            DivAssignUnsignedInt64 => compound_div!(u64, wrapping_div),
            AddAssignFloat => compound_float!(f32, +),
            SubAssignFloat => compound_float!(f32, -),
            MulAssignFloat => compound_float!(f32, *),
            DivAssignFloat => compound_float!(f32, /),
            AddAssignDouble => compound_float!(f64, +),
            SubAssignDouble => compound_float!(f64, -),
            MulAssignDouble => compound_float!(f64, *),
            DivAssignDouble => compound_float!(f64, /),
            BitAndAssign8 => compound_bitop!(u8, &),
            BitAndAssign16 => compound_bitop!(u16, &),
            BitAndAssign32 => compound_bitop!(u32, &),
            BitAndAssign64 => compound_bitop!(u64, &),
            BitOrAssign8 => compound_bitop!(u8, |),
            BitOrAssign16 => compound_bitop!(u16, |),
            BitOrAssign32 => compound_bitop!(u32, |),
            BitOrAssign64 => compound_bitop!(u64, |),
            BitXorAssign8 => compound_bitop!(u8, ^),
            BitXorAssign16 => compound_bitop!(u16, ^),
            BitXorAssign32 => compound_bitop!(u32, ^),
            BitXorAssign64 => compound_bitop!(u64, ^),
            BitShlAssign8 => shift_assign!(u8, wrapping_shl),
            BitShlAssign16 => shift_assign!(u16, wrapping_shl),
            BitShlAssign32 => shift_assign!(u32, wrapping_shl),
            BitShlAssign64 => shift_assign!(u64, wrapping_shl),
            BitShrAssign8 => shift_assign!(u8, wrapping_shr),
            BitShrAssign16 => shift_assign!(u16, wrapping_shr),
            BitShrAssign32 => shift_assign!(u32, wrapping_shr),
            BitShrAssign64 => shift_assign!(u64, wrapping_shr),
            BitSarAssign8 => shift_assign!(i8, wrapping_shr),
            BitSarAssign16 => shift_assign!(i16, wrapping_shr),
            BitSarAssign32 => shift_assign!(i32, wrapping_shr),
            BitSarAssign64 => shift_assign!(i64, wrapping_shr),

            //--- logical --------------------------------------------------
            LogicNot => unary!(u8, |v| (v == 0) as u8),
            LogicXor => {
                let a = self.eval_bool();
                let b = self.eval_bool();
                unsafe { write(dest, (a ^ b) as u8) };
            }
            LogicAnd => {
                let delta = self.read_i16();
                let base = self.ip;
                let a = self.eval_bool();
                if !a {
                    unsafe { write(dest, 0u8) };
                    self.jump(base, delta);
                } else {
                    let b = self.eval_bool();
                    unsafe { write(dest, b as u8) };
                }
            }
            LogicOr => {
                let delta = self.read_i16();
                let base = self.ip;
                let a = self.eval_bool();
                if a {
                    unsafe { write(dest, 1u8) };
                    self.jump(base, delta);
                } else {
                    let b = self.eval_bool();
                    unsafe { write(dest, b as u8) };
                }
            }

            //--- comparisons ----------------------------------------------
            TestEqual1 => cmp!(u8, ==),
            TestEqual2 => cmp!(u16, ==),
            TestEqual4 => cmp!(u32, ==),
            TestEqual8 => cmp!(u64, ==),
            TestNotEqual1 => cmp!(u8, !=),
            TestNotEqual2 => cmp!(u16, !=),
            TestNotEqual4 => cmp!(u32, !=),
            TestNotEqual8 => cmp!(u64, !=),
            TestSignedLess1 => cmp!(i8, <),
            TestSignedLess2 => cmp!(i16, <),
            TestSignedLess4 => cmp!(i32, <),
            TestSignedLess8 => cmp!(i64, <),
            TestSignedLessEqual1 => cmp!(i8, <=),
            TestSignedLessEqual2 => cmp!(i16, <=),
            TestSignedLessEqual4 => cmp!(i32, <=),
            TestSignedLessEqual8 => cmp!(i64, <=),
            TestSignedGreater1 => cmp!(i8, >),
            TestSignedGreater2 => cmp!(i16, >),
            TestSignedGreater4 => cmp!(i32, >),
            TestSignedGreater8 => cmp!(i64, >),
            TestSignedGreaterEqual1 => cmp!(i8, >=),
            TestSignedGreaterEqual2 => cmp!(i16, >=),
            TestSignedGreaterEqual4 => cmp!(i32, >=),
            TestSignedGreaterEqual8 => cmp!(i64, >=),
            TestUnsignedLess1 => cmp!(u8, <),
            TestUnsignedLess2 => cmp!(u16, <),
            TestUnsignedLess4 => cmp!(u32, <),
            TestUnsignedLess8 => cmp!(u64, <),
            TestUnsignedLessEqual1 => cmp!(u8, <=),
            TestUnsignedLessEqual2 => cmp!(u16, <=),
            TestUnsignedLessEqual4 => cmp!(u32, <=),
            TestUnsignedLessEqual8 => cmp!(u64, <=),
            TestUnsignedGreater1 => cmp!(u8, >),
            TestUnsignedGreater2 => cmp!(u16, >),
            TestUnsignedGreater4 => cmp!(u32, >),
            TestUnsignedGreater8 => cmp!(u64, >),
            TestUnsignedGreaterEqual1 => cmp!(u8, >=),
            TestUnsignedGreaterEqual2 => cmp!(u16, >=),
            TestUnsignedGreaterEqual4 => cmp!(u32, >=),
            TestUnsignedGreaterEqual8 => cmp!(u64, >=),
            TestFloatEqual4 => cmp!(f32, ==),
            TestFloatEqual8 => cmp!(f64, ==),
            TestFloatNotEqual4 => cmp!(f32, !=),
            TestFloatNotEqual8 => cmp!(f64, !=),
            TestFloatLess4 => cmp!(f32, <),
            TestFloatLess8 => cmp!(f64, <),
            TestFloatLessEqual4 => cmp!(f32, <=),
            TestFloatLessEqual8 => cmp!(f64, <=),
            TestFloatGreater4 => cmp!(f32, >),
            TestFloatGreater8 => cmp!(f64, >),
            TestFloatGreaterEqual4 => cmp!(f32, >=),
            TestFloatGreaterEqual8 => cmp!(f64, >=),
            TestEqual | TestNotEqual => {
                let ty = self.read_type_id();
                let a = self.eval_ptr();
                let b = self.eval_ptr();
                let equal = if a.is_null() || b.is_null() {
                    a == b
                } else {
                    // SAFETY: generic equality children are address
                    // expressions over constructed values
                    unsafe { self.ctx.registry.compare_values(ty, a, b) }
                };
                let result = if op == TestEqual { equal } else { !equal };
                unsafe { write(dest, result as u8) };
            }

            //--- assignment -----------------------------------------------
            AssignInt1 | AssignUint1 => assign!(u8),
            AssignInt2 | AssignUint2 => assign!(u16),
            AssignInt4 | AssignUint4 => assign!(u32),
            AssignInt8 | AssignUint8 => assign!(u64),
            AssignFloat => assign!(f32),
            AssignDouble => assign!(f64),
            AssignAny => {
                let p = self.eval_ptr();
                if p.is_null() {
                    // Still consume the source expression to stay in sync
                    let scratch = self.scratch.as_ptr();
                    self.step(scratch);
                } else {
                    // The source expression writes straight into the target
                    self.step(p);
                }
            }

            //--- memory and variables -------------------------------------
            LocalVar => {
                let offset = self.read_u16() as usize;
                // SAFETY: offsets were laid out inside the locals block
                let p = unsafe { self.locals.as_ptr().add(offset) };
                unsafe { write(dest, p) };
            }
            LocalCtor => {
                let offset = self.read_u16() as usize;
                let ty = self.read_type_id();
                // SAFETY: as above; slot is zeroed at frame entry
                unsafe {
                    self.ctx.registry.construct(ty, self.locals.as_ptr().add(offset));
                }
            }
            LocalDtor => {
                let offset = self.read_u16() as usize;
                let ty = self.read_type_id();
                // SAFETY: paired with LocalCtor by the builder
                unsafe {
                    self.ctx.registry.destruct(ty, self.locals.as_ptr().add(offset));
                }
            }
            ContextVar => {
                let offset = self.read_u16() as usize;
                let p = if self.active_context.is_null() {
                    std::ptr::null_mut()
                } else {
                    // SAFETY: the builder only emits in-object offsets here
                    unsafe { self.active_context.add(offset) }
                };
                unsafe { write(dest, p) };
            }
            ContextExternalVar => {
                let offset = self.read_u16() as usize;
                let p = if self.active_context.is_null() {
                    std::ptr::null_mut()
                } else {
                    // SAFETY: the active context of a class method is an
                    // RtObject with a scripted buffer covering the offset
                    unsafe {
                        (*(self.active_context as *const RtObject))
                            .data_ptr()
                            .add(offset)
                    }
                };
                unsafe { write(dest, p) };
            }
            ContextCtor | ContextDtor => {
                let offset = self.read_u16() as usize;
                let ty = self.read_type_id();
                if !self.active_context.is_null() {
                    // SAFETY: as ContextVar
                    let p = unsafe { self.active_context.add(offset) };
                    unsafe {
                        if op == ContextCtor {
                            self.ctx.registry.construct(ty, p);
                        } else {
                            self.ctx.registry.destruct(ty, p);
                        }
                    }
                }
            }
            ContextExternalCtor | ContextExternalDtor => {
                let offset = self.read_u16() as usize;
                let ty = self.read_type_id();
                if !self.active_context.is_null() {
                    // SAFETY: as ContextExternalVar
                    let p = unsafe {
                        (*(self.active_context as *const RtObject))
                            .data_ptr()
                            .add(offset)
                    };
                    unsafe {
                        if op == ContextExternalCtor {
                            self.ctx.registry.construct(ty, p);
                        } else {
                            self.ctx.registry.destruct(ty, p);
                        }
                    }
                }
            }
            ParamVar => {
                let index = self.read_u8() as usize;
                let p = self.params.args.get(index).copied().unwrap_or(std::ptr::null_mut());
                unsafe { write(dest, p) };
            }
            StructMember => {
                let owner = self.read_type_id();
                let offset = self.read_u16() as usize;
                let member = self.read_type_id();
                let registry = self.ctx.registry;
                let def = registry.type_def(owner);
                let temp = AlignedBuf::zeroed(def.size as usize, def.align.max(1) as usize);
                // SAFETY: fresh zeroed storage of the struct's layout
                unsafe {
                    registry.construct(owner, temp.as_ptr());
                }
                self.step(temp.as_ptr());
                // SAFETY: member lies inside the struct temp; dest holds
                // the member's width
                unsafe {
                    registry.copy_value(member, dest, temp.as_ptr().add(offset));
                    registry.destruct(owner, temp.as_ptr());
                }
            }
            StructMemberRef => {
                let offset = self.read_u16() as usize;
                let p = self.eval_ptr();
                let p = if p.is_null() {
                    p
                } else {
                    // SAFETY: the child produced the struct's address
                    unsafe { p.add(offset) }
                };
                unsafe { write(dest, p) };
            }
            ThisObject => {
                // SAFETY: dest is a valid strong slot; the context object
                // outlives the frame
                unsafe {
                    object::strong_from_object_ptr(
                        self.ctx.registry,
                        dest,
                        self.context as *const RtObject,
                    )
                };
            }
            ThisStruct => unsafe { write(dest, self.context) },

            //--- loads ----------------------------------------------------
            LoadInt1 | LoadUint1 => load!(u8),
            LoadInt2 | LoadUint2 => load!(u16),
            LoadInt4 | LoadUint4 => load!(u32),
            LoadInt8 | LoadUint8 => load!(u64),
            LoadFloat => load!(f32),
            LoadDouble => load!(f64),
            LoadStrongPtr => {
                let p = self.eval_ptr();
                if !p.is_null() {
                    // SAFETY: p addresses a strong slot; dest is a valid
                    // strong slot
                    unsafe { object::strong_copy(self.ctx.registry, dest, p) };
                }
            }
            LoadWeakPtr => {
                let p = self.eval_ptr();
                if !p.is_null() {
                    // SAFETY: as above, for weak slots
                    unsafe { object::weak_copy(dest, p) };
                }
            }
            LoadAny => {
                let ty = self.read_type_id();
                let p = self.eval_ptr();
                if !p.is_null() {
                    // SAFETY: p addresses a constructed value; dest is
                    // constructed storage of the same type
                    unsafe { self.ctx.registry.copy_value(ty, dest, p) };
                }
            }

            //--- returns --------------------------------------------------
            ReturnLoad1 => self.return_load::<1>(),
            ReturnLoad2 => self.return_load::<2>(),
            ReturnLoad4 => self.return_load::<4>(),
            ReturnLoad8 => self.return_load::<8>(),
            ReturnDirect => {
                let target = if self.params.return_ptr.is_null() {
                    dest
                } else {
                    self.params.return_ptr
                };
                self.step(target);
                self.terminate();
            }
            ReturnAny => {
                let ty = self.read_type_id();
                let p = self.eval_ptr();
                if !self.params.return_ptr.is_null() && !p.is_null() {
                    // SAFETY: the caller provided constructed return
                    // storage of the function's return type
                    unsafe {
                        self.ctx.registry.copy_value(ty, self.params.return_ptr, p)
                    };
                }
                self.terminate();
            }

            //--- context shifting -----------------------------------------
            ContextFromValue => {
                let ty = self.read_u16();
                let registry = self.ctx.registry;
                let (size, align) = if ty != 0 {
                    let def = registry.type_def(TypeId(ty));
                    (def.size as usize, def.align.max(1) as usize)
                } else {
                    (16, 16)
                };
                let temp = AlignedBuf::zeroed(size, align);
                if ty != 0 {
                    // SAFETY: fresh zeroed storage of the type's layout
                    unsafe { registry.construct(TypeId(ty), temp.as_ptr()) };
                }
                self.step(temp.as_ptr());
                let saved = self.active_context;
                self.active_context = temp.as_ptr();
                self.step(dest);
                self.active_context = saved;
                if ty != 0 {
                    // SAFETY: constructed above
                    unsafe { registry.destruct(TypeId(ty), temp.as_ptr()) };
                }
            }
            ContextFromRef => {
                let delta = self.read_i16();
                let base = self.ip;
                let _ty = self.read_u16();
                let p = self.eval_ptr();
                if p.is_null() {
                    self.fault_with_fallback(RuntimeFault::NullPointer, (base as i64 + delta as i64) as usize);
                } else {
                    let saved = self.active_context;
                    self.active_context = p;
                    self.step(dest);
                    self.active_context = saved;
                }
            }
            ContextFromPtr => {
                let delta = self.read_i16();
                let base = self.ip;
                let _ty = self.read_u16();
                let mut slot = [0u8; 8];
                self.step(slot.as_mut_ptr());
                // SAFETY: slot holds an owned strong handle
                let object = unsafe { object::strong_get(slot.as_ptr()) };
                match object {
                    None => {
                        self.fault_with_fallback(
                            RuntimeFault::NullPointer,
                            (base as i64 + delta as i64) as usize,
                        );
                    }
                    Some(raw) => {
                        let saved = self.active_context;
                        self.active_context = raw as *mut u8;
                        self.step(dest);
                        self.active_context = saved;
                    }
                }
                // SAFETY: releasing the owned handle evaluated above
                unsafe { object::strong_release(self.ctx.registry, slot.as_mut_ptr()) };
            }
            ContextFromPtrRef => {
                let delta = self.read_i16();
                let base = self.ip;
                let _ty = self.read_u16();
                let slot = self.eval_ptr();
                // SAFETY: the child produced the address of a strong slot
                let object = if slot.is_null() {
                    None
                } else {
                    unsafe { object::strong_get(slot) }
                };
                match object {
                    None => {
                        self.fault_with_fallback(
                            RuntimeFault::NullPointer,
                            (base as i64 + delta as i64) as usize,
                        );
                    }
                    Some(raw) => {
                        let saved = self.active_context;
                        self.active_context = raw as *mut u8;
                        self.step(dest);
                        self.active_context = saved;
                    }
                }
            }

            //--- object lifecycle -----------------------------------------
            New => {
                let class = self.read_type_id();
                let object = self.ctx.host.new_object(self.ctx.registry, class);
                // SAFETY: dest is a valid strong slot
                unsafe { object::strong_store(self.ctx.registry, dest, object) };
            }
            Constructor => {
                let ty = self.read_type_id();
                let count = self.read_u8() as usize;
                // SAFETY: dest is storage for the struct value
                unsafe { self.ctx.registry.construct(ty, dest) };
                for _ in 0..count {
                    let offset = self.read_u16() as usize;
                    let _member = self.read_type_id();
                    // SAFETY: member offsets lie inside the struct
                    let slot = unsafe { dest.add(offset) };
                    self.step(slot);
                }
            }
            DynamicCast => {
                let target = self.read_type_id();
                let mut slot = [0u8; 8];
                self.step(slot.as_mut_ptr());
                // SAFETY: slot holds an owned strong handle
                let keep = unsafe { object::strong_get(slot.as_ptr()) }
                    .map(|raw| {
                        // SAFETY: live object behind an owned handle
                        let class = unsafe { (*raw).class() };
                        self.ctx.registry.class_is_a(class, target)
                    })
                    .unwrap_or(false);
                // SAFETY: dest is a valid strong slot
                unsafe {
                    if keep {
                        object::strong_copy(self.ctx.registry, dest, slot.as_ptr());
                    } else {
                        object::strong_store(self.ctx.registry, dest, None);
                    }
                    object::strong_release(self.ctx.registry, slot.as_mut_ptr());
                }
            }
            DynamicWeakCast => {
                let target = self.read_type_id();
                let mut slot = [0u8; 8];
                self.step(slot.as_mut_ptr());
                // SAFETY: slot holds an owned weak handle
                unsafe {
                    let mut strong = [0u8; 8];
                    object::weak_to_strong(self.ctx.registry, strong.as_mut_ptr(), slot.as_ptr());
                    let keep = object::strong_get(strong.as_ptr())
                        .map(|raw| self.ctx.registry.class_is_a((*raw).class(), target))
                        .unwrap_or(false);
                    if keep {
                        object::weak_copy(dest, slot.as_ptr());
                    } else {
                        object::weak_release(dest);
                    }
                    object::strong_release(self.ctx.registry, strong.as_mut_ptr());
                    object::weak_release(slot.as_mut_ptr());
                }
            }
            MetaCast => {
                let target = self.read_type_id();
                let v = self.eval::<u32>();
                let keep = v != 0 && self.ctx.registry.class_is_a(TypeId(v as u16), target);
                unsafe { write(dest, if keep { v } else { 0 }) };
            }

            //--- function calls -------------------------------------------
            StaticFunc | FinalFunc => self.do_call(dest, false, false),
            VirtualFunc => self.do_call(dest, true, false),
            InternalFunc => self.do_call(dest, false, true),

            //--- reserved -------------------------------------------------
            Switch
            | SwitchLabel
            | SwitchDefault
            | Conditional
            | CastToVariant
            | CastFromVariant
            | VariantIsValid
            | VariantIsPointer
            | VariantIsArray
            | VariantGetType
            | VariantToString => self.fault(RuntimeFault::UnimplementedOpcode),
        }
    }

    fn return_load<const N: usize>(&mut self) {
        let mut value = [0u8; N];
        self.step(value.as_mut_ptr());
        if !self.params.return_ptr.is_null() {
            // SAFETY: the caller provided return storage of the
            // function's declared width
            unsafe { std::ptr::copy_nonoverlapping(value.as_ptr(), self.params.return_ptr, N) };
        }
        self.terminate();
    }
}
