//! Function objects.
//!
//! A `Function` is an immutable header describing one callable entry point:
//! its kind tag, a pointer to its mutable data, the ID of the module
//! instance that owns it, and its encoded signature, together with the
//! executable code the JIT produced for it. Function objects are allocated
//! by the engine when a module's object code is loaded; the runtime itself
//! allocates only the handful of sentinel functions the table encoding
//! needs.

use crate::engine::LoadedModule;
use crate::runtime_data::ContextRuntimeData;
use crate::sig_registry::VMSharedSignatureIndex;
use crate::object::ObjectKind;
use crate::trap::{Trap, TrapCode};
use once_cell::sync::OnceCell;
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// The owning-module-instance ID of functions that belong to no particular
/// instance (sentinels and stubs); such functions are treated as being in
/// every compartment.
pub const UNOWNED_MODULE_INSTANCE_ID: usize = usize::MAX;

/// The machine calling convention of every wasm-callable entry point: the
/// callee receives its own function header and the calling context's
/// runtime data, reads its arguments from the context's scratch area, and
/// writes its results back to the same area.
pub type InvokeThunk =
    unsafe extern "C-unwind" fn(function: NonNull<Function>, context: *mut ContextRuntimeData);

/// The code-side state of a function, filled in by the engine when the
/// owning module's object code is loaded.
pub struct FunctionCodeInfo {
    /// The function object the engine allocated.
    pub function: FunctionRef,
    /// The JIT module the code belongs to.
    pub jit_module: Weak<dyn LoadedModule>,
    /// The length of the function's machine code in bytes.
    pub num_code_bytes: usize,
    /// Maps code-byte offsets back to operator indices, for backtrace
    /// descriptions.
    pub offset_to_op_index: BTreeMap<u32, u32>,
}

/// The mutable companion of a function header. Shared between the runtime
/// (which names and roots functions) and the engine (which owns the code).
pub struct FunctionMutableData {
    debug_name: String,
    num_root_references: AtomicUsize,
    code_info: OnceCell<FunctionCodeInfo>,
}

impl FunctionMutableData {
    /// Creates mutable data carrying only a debug name; the engine fills in
    /// the code info during load.
    pub fn new(debug_name: String) -> Arc<Self> {
        Arc::new(Self {
            debug_name,
            num_root_references: AtomicUsize::new(0),
            code_info: OnceCell::new(),
        })
    }

    /// The function's debug name.
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    /// Publishes the code info. May be called once, by the engine.
    pub fn initialize(&self, info: FunctionCodeInfo) {
        if self.code_info.set(info).is_err() {
            panic!("function code info initialized twice");
        }
    }

    /// The code info, if the owning module has been loaded.
    pub fn code_info(&self) -> Option<&FunctionCodeInfo> {
        self.code_info.get()
    }

    /// The function object, if the owning module has been loaded.
    pub fn function(&self) -> Option<FunctionRef> {
        self.code_info.get().map(|info| info.function)
    }

    /// Increments the root-reference count and returns the new value.
    pub fn add_root_reference(&self) -> usize {
        self.num_root_references.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements the root-reference count and returns the new value. The
    /// owning engine must keep the function's code loaded while the count
    /// is non-zero.
    pub fn remove_root_reference(&self) -> usize {
        let previous = self.num_root_references.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0);
        previous - 1
    }

    /// The current root-reference count.
    pub fn num_root_references(&self) -> usize {
        self.num_root_references.load(Ordering::Acquire)
    }
}

/// A function header. `#[repr(C)]` with the kind tag first: generated code
/// reads `encoded_type` and `code` straight out of the header during
/// indirect calls.
#[repr(C)]
pub struct Function {
    kind: ObjectKind,
    module_instance_id: usize,
    encoded_type: VMSharedSignatureIndex,
    code: *const u8,
    thunk: InvokeThunk,
    mutable_data: Arc<FunctionMutableData>,
}

// The header is immutable after construction; `code` points into executable
// memory owned by the loaded JIT module, which outlives every reference to
// the function.
unsafe impl Send for Function {}
unsafe impl Sync for Function {}

impl Function {
    /// Creates a function header. Boxed so its address is stable: table
    /// slots and generated code hold raw addresses of function headers.
    pub fn new(
        mutable_data: Arc<FunctionMutableData>,
        module_instance_id: usize,
        encoded_type: VMSharedSignatureIndex,
        code: *const u8,
        thunk: InvokeThunk,
    ) -> Box<Self> {
        Box::new(Self {
            kind: ObjectKind::Function,
            module_instance_id,
            encoded_type,
            code,
            thunk,
            mutable_data,
        })
    }

    /// The object kind tag (always `ObjectKind::Function`).
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// The ID of the owning module instance within its compartment, or
    /// [`UNOWNED_MODULE_INSTANCE_ID`].
    pub fn module_instance_id(&self) -> usize {
        self.module_instance_id
    }

    /// The interned signature index compared by indirect-call guards.
    pub fn encoded_type(&self) -> VMSharedSignatureIndex {
        self.encoded_type
    }

    /// The entry address of the function's code.
    pub fn code(&self) -> *const u8 {
        self.code
    }

    /// The callable entry point.
    pub fn thunk(&self) -> InvokeThunk {
        self.thunk
    }

    /// The function's mutable data.
    pub fn mutable_data(&self) -> &Arc<FunctionMutableData> {
        &self.mutable_data
    }

    /// The function's debug name.
    pub fn debug_name(&self) -> &str {
        self.mutable_data.debug_name()
    }
}

/// A raw, `Copy` reference to a function header. The referent is kept alive
/// by the loaded module that owns it (or, for sentinels, lives for the
/// whole process); holders that need a liveness guarantee keep the owning
/// module instance alive alongside.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct FunctionRef(NonNull<Function>);

unsafe impl Send for FunctionRef {}
unsafe impl Sync for FunctionRef {}

impl FunctionRef {
    /// Wraps a function pointer.
    pub fn new(function: NonNull<Function>) -> Self {
        Self(function)
    }

    /// The raw header pointer.
    pub fn as_ptr(self) -> *const Function {
        self.0.as_ptr()
    }

    /// The header address, as stored in table slots and untagged values.
    pub fn address(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Recovers a reference from a header address.
    pub fn from_address(address: usize) -> Option<Self> {
        NonNull::new(address as *mut Function).map(Self)
    }

    /// Borrows the header.
    ///
    /// # Safety
    /// The owning module (or sentinel) must still be loaded.
    pub unsafe fn as_ref<'a>(self) -> &'a Function {
        &*self.0.as_ptr()
    }
}

impl std::fmt::Debug for FunctionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "FunctionRef({:p})", self.0.as_ptr())
    }
}

unsafe extern "C-unwind" fn sentinel_thunk(
    function: NonNull<Function>,
    _context: *mut ContextRuntimeData,
) {
    let debug_name = (*function.as_ptr()).debug_name().to_string();
    Trap::raise(Trap::new(
        TrapCode::UnreachableCodeReached,
        format!("called sentinel function {:?}", debug_name),
    ));
}

/// A function header owned by the runtime rather than an engine: the table
/// sentinels and similar process-lifetime dummies.
pub struct SentinelFunction {
    function: Box<Function>,
}

impl SentinelFunction {
    /// Creates a dummy function with the default (never-matching) encoded
    /// type and no owning instance.
    pub fn new(debug_name: &str) -> Self {
        let mutable_data = FunctionMutableData::new(debug_name.to_string());
        let function = Function::new(
            mutable_data,
            UNOWNED_MODULE_INSTANCE_ID,
            VMSharedSignatureIndex::default(),
            sentinel_thunk as *const u8,
            sentinel_thunk,
        );
        Self { function }
    }

    /// A reference to the sentinel's header.
    pub fn as_function_ref(&self) -> FunctionRef {
        FunctionRef(NonNull::from(&*self.function))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_reference_counting() {
        let data = FunctionMutableData::new("test".to_string());
        assert_eq!(data.num_root_references(), 0);
        assert_eq!(data.add_root_reference(), 1);
        assert_eq!(data.add_root_reference(), 2);
        assert_eq!(data.remove_root_reference(), 1);
        assert_eq!(data.remove_root_reference(), 0);
    }

    #[test]
    fn sentinel_functions_match_no_signature() {
        let sentinel = SentinelFunction::new("out-of-bounds table element");
        let function = unsafe { sentinel.as_function_ref().as_ref() };
        assert_eq!(function.encoded_type(), VMSharedSignatureIndex::default());
        assert_eq!(function.module_instance_id(), UNOWNED_MODULE_INSTANCE_ID);
        assert_eq!(function.kind(), ObjectKind::Function);
    }
}
