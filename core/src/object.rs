//! Runtime object model: reference-counted scripted objects, the raw
//! 8-byte strong/weak handle slots the interpreter and the emitted C code
//! manipulate, the dynamic-array value representation, and the host
//! callback surface.
//!
//! All unsafe raw-memory work of the handle kind is concentrated here. The
//! helpers take pointers into value storage (locals, properties, call
//! parameters) that the caller guarantees are valid, aligned slots of the
//! right width.

use crate::{
    error::RuntimeFault,
    name::Name,
    registry::TypeRegistry,
    types::TypeId,
};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::UnsafeCell;
use std::sync::{Arc, Weak};

//--- aligned storage -----------------------------------------------------

/// Heap allocation with explicit alignment, zero-initialized. Used for
/// frame locals and object property buffers; size is known from type
/// layout before allocation.
#[derive(Debug)]
pub struct AlignedBuf {
    ptr: *mut u8,
    layout: Option<Layout>,
}

impl AlignedBuf {
    pub fn zeroed(size: usize, align: usize) -> AlignedBuf {
        if size == 0 {
            return AlignedBuf {
                ptr: std::ptr::null_mut(),
                layout: None,
            };
        }
        let layout = Layout::from_size_align(size, align.max(1)).expect("bad storage layout");
        // SAFETY: layout has non-zero size, checked above
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "storage allocation failed");
        AlignedBuf {
            ptr,
            layout: Some(layout),
        }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.layout.map(|l| l.size()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        if let Some(layout) = self.layout {
            // SAFETY: allocated with this exact layout in `zeroed`
            unsafe { dealloc(self.ptr, layout) };
        }
    }
}

//--- scripted objects ----------------------------------------------------

/// A live scripted object: its class plus the out-of-line buffer holding
/// the scripted properties. Strong and weak handles hold `Arc`/`Weak`
/// references to this.
///
/// The layout is C-stable and the scripted-buffer pointer comes first, so
/// AOT-compiled code can reach the buffer with a single indirection (the
/// `ExternalPtr` macro in the emitted prologue).
#[repr(C)]
#[derive(Debug)]
pub struct RtObject {
    scripted: *mut u8,
    class_raw: u32,
    data: UnsafeCell<AlignedBuf>,
}

impl RtObject {
    pub fn class(&self) -> TypeId {
        TypeId(self.class_raw as u16)
    }

    /// Base pointer of the scripted property buffer.
    pub fn data_ptr(&self) -> *mut u8 {
        self.scripted
    }
}

/// Allocate an object of a scripted (or native) class: zeroed property
/// buffer plus explicit construction of every property that needs it.
/// Returns `None` for abstract classes.
pub fn allocate_object(registry: &TypeRegistry, class: TypeId) -> Option<Arc<RtObject>> {
    let def = registry.type_def(class);
    let info = def.class_info()?;
    if info.is_abstract || info.is_struct {
        return None;
    }
    let buf = AlignedBuf::zeroed(
        info.scripted_size as usize,
        info.scripted_align.max(1) as usize,
    );
    let scripted = buf.as_ptr();
    let object = Arc::new(RtObject {
        scripted,
        class_raw: class.0 as u32,
        data: UnsafeCell::new(buf),
    });
    // SAFETY: freshly allocated, properly sized zeroed buffer
    unsafe { registry.construct_object_data(class, object.data_ptr()) };
    Some(object)
}

//--- handle slots --------------------------------------------------------
//
// A strong handle slot is 8 bytes holding either null or a pointer
// produced by `Arc::into_raw`; a weak slot holds null or `Weak::into_raw`.
// Zeroed memory is therefore a valid null handle for both.

/// Read the object a strong slot points at without touching the count.
///
/// # Safety
/// `slot` must be a valid strong-handle slot.
pub unsafe fn strong_get(slot: *const u8) -> Option<*const RtObject> {
    let raw = (slot as *const *const RtObject).read();
    if raw.is_null() {
        None
    } else {
        Some(raw)
    }
}

/// Move an owned reference into a slot, releasing whatever was there.
///
/// # Safety
/// `slot` must be a valid, initialized strong-handle slot.
pub unsafe fn strong_store(registry: &TypeRegistry, slot: *mut u8, object: Option<Arc<RtObject>>) {
    strong_release(registry, slot);
    let raw = match object {
        Some(object) => Arc::into_raw(object),
        None => std::ptr::null(),
    };
    (slot as *mut *const RtObject).write(raw);
}

/// Copy a strong handle between slots, bumping the count.
///
/// # Safety
/// Both pointers must be valid, initialized strong-handle slots.
pub unsafe fn strong_copy(registry: &TypeRegistry, dst: *mut u8, src: *const u8) {
    let object = strong_get(src).map(|raw| {
        Arc::increment_strong_count(raw);
        Arc::from_raw(raw)
    });
    strong_store(registry, dst, object);
}

/// Drop the reference held by a slot and null it. If this was the last
/// strong reference, the object's property buffer is destructed first,
/// while the registry is still at hand.
///
/// # Safety
/// `slot` must be a valid, initialized strong-handle slot.
pub unsafe fn strong_release(registry: &TypeRegistry, slot: *mut u8) {
    if let Some(raw) = strong_get(slot) {
        let object = Arc::from_raw(raw);
        if Arc::strong_count(&object) == 1 {
            registry.destruct_object_data(object.class(), object.data_ptr());
        }
        drop(object);
        (slot as *mut *const RtObject).write(std::ptr::null());
    }
}

/// Borrow the Arc behind a slot for the duration of a closure.
///
/// # Safety
/// `slot` must be a valid strong-handle slot.
pub unsafe fn strong_borrow(slot: *const u8) -> Option<Arc<RtObject>> {
    strong_get(slot).map(|raw| {
        Arc::increment_strong_count(raw);
        Arc::from_raw(raw)
    })
}

/// Store a counted reference to a borrowed object pointer (the `this` of
/// an executing frame) into a strong slot.
///
/// # Safety
/// `dst` must be a valid, initialized strong slot; `object`, if non-null,
/// must point at a live `RtObject` kept alive by the caller.
pub unsafe fn strong_from_object_ptr(
    registry: &TypeRegistry,
    dst: *mut u8,
    object: *const RtObject,
) {
    let object = if object.is_null() {
        None
    } else {
        Arc::increment_strong_count(object);
        Some(Arc::from_raw(object))
    };
    strong_store(registry, dst, object);
}

/// Read a weak slot's pointer.
unsafe fn weak_get(slot: *const u8) -> Option<*const RtObject> {
    let raw = (slot as *const *const RtObject).read();
    if raw.is_null() {
        None
    } else {
        Some(raw)
    }
}

/// Release the weak reference held by a slot and null it.
///
/// # Safety
/// `slot` must be a valid, initialized weak-handle slot.
pub unsafe fn weak_release(slot: *mut u8) {
    if let Some(raw) = weak_get(slot) {
        drop(Weak::from_raw(raw));
        (slot as *mut *const RtObject).write(std::ptr::null());
    }
}

/// Copy a weak handle between slots.
///
/// # Safety
/// Both pointers must be valid, initialized weak-handle slots.
pub unsafe fn weak_copy(dst: *mut u8, src: *const u8) {
    weak_release(dst);
    let raw = match weak_get(src) {
        Some(raw) => {
            let weak = Weak::from_raw(raw);
            let copy = weak.clone();
            // The source slot keeps its reference
            let _ = Weak::into_raw(weak);
            Weak::into_raw(copy)
        }
        None => std::ptr::null(),
    };
    (dst as *mut *const RtObject).write(raw);
}

/// Demote a strong slot into a weak slot.
///
/// # Safety
/// `dst` must be a valid, initialized weak slot; `src` a valid strong slot.
pub unsafe fn strong_to_weak(dst: *mut u8, src: *const u8) {
    weak_release(dst);
    let raw = match strong_borrow(src) {
        Some(object) => Weak::into_raw(Arc::downgrade(&object)),
        None => std::ptr::null(),
    };
    (dst as *mut *const RtObject).write(raw);
}

/// Promote a weak slot into a strong slot; dead objects produce null.
///
/// # Safety
/// `dst` must be a valid, initialized strong slot; `src` a valid weak slot.
pub unsafe fn weak_to_strong(registry: &TypeRegistry, dst: *mut u8, src: *const u8) {
    let object = match weak_get(src) {
        Some(raw) => {
            let weak = Weak::from_raw(raw);
            let upgraded = weak.upgrade();
            let _ = Weak::into_raw(weak);
            upgraded
        }
        None => None,
    };
    strong_store(registry, dst, object);
}

/// Is the object behind a weak slot still alive?
///
/// # Safety
/// `slot` must be a valid weak-handle slot.
pub unsafe fn weak_is_alive(slot: *const u8) -> bool {
    match weak_get(slot) {
        Some(raw) => {
            let weak = Weak::from_raw(raw);
            let alive = weak.strong_count() > 0;
            let _ = Weak::into_raw(weak);
            alive
        }
        None => false,
    }
}

//--- dynamic arrays ------------------------------------------------------

/// In-memory shape of a dynamic array value. All-zero is a valid empty
/// array; element lifecycle is driven by the registry, which knows the
/// element type.
#[repr(C)]
#[derive(Debug)]
pub struct RawArray {
    pub data: *mut u8,
    pub len: usize,
    /// Allocation capacity in elements
    pub cap: usize,
}

impl RawArray {
    pub fn empty() -> RawArray {
        RawArray {
            data: std::ptr::null_mut(),
            len: 0,
            cap: 0,
        }
    }
}

//--- host callbacks ------------------------------------------------------

/// Snapshot of the executing frame handed to host callbacks.
#[derive(Clone, Debug, Default)]
pub struct FrameView {
    pub function: Name,
    pub class: Name,
    pub source_file: String,
    pub line: u32,
}

/// The services the runtime asks its embedder for. Every method has a
/// sensible default so tests and tools can run with [DefaultHost].
pub trait Host {
    /// Allocate a new object of the given class. `None` aborts the `New`
    /// opcode with a null result.
    fn new_object(&self, registry: &TypeRegistry, class: TypeId) -> Option<Arc<RtObject>> {
        allocate_object(registry, class)
    }

    /// A runtime fault occurred. When this returns, the interpreter
    /// branches to the fallback label the compiler provided, or returns
    /// from the function if there is none.
    fn exception(&self, frame: &FrameView, fault: RuntimeFault) {
        log::error!(
            "{}({}): script exception in {}: {}",
            frame.source_file,
            frame.line,
            frame.function,
            fault
        );
    }

    /// An enabled breakpoint was hit.
    fn breakpoint(&self, frame: &FrameView, line: u32) {
        log::info!(
            "{}({}): breakpoint in {}",
            frame.source_file,
            line,
            frame.function
        );
    }

    fn log(&self, message: &str) {
        log::info!("script: {}", message);
    }
}

/// Host implementation that only logs. Good enough for tests and for the
/// command-line tooling.
#[derive(Debug, Default)]
pub struct DefaultHost;

impl Host for DefaultHost {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_buf_is_zeroed() {
        let buf = AlignedBuf::zeroed(64, 16);
        assert_eq!(buf.as_ptr() as usize % 16, 0);
        for i in 0..64 {
            // SAFETY: in-bounds read of a fresh allocation
            assert_eq!(unsafe { *buf.as_ptr().add(i) }, 0);
        }
    }

    #[test]
    fn test_zero_sized_buf() {
        let buf = AlignedBuf::zeroed(0, 8);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_raw_array_zero_is_empty() {
        let array = RawArray::empty();
        assert!(array.data.is_null());
        assert_eq!(array.len, 0);
    }
}
