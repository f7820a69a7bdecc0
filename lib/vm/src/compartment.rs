//! Compartments: the sandbox root every other runtime object is created
//! in.
//!
//! A compartment owns a 4 GiB, 4 GiB-aligned runtime-data reservation (see
//! [`crate::runtime_data`]), the sparse ID spaces for each object kind, and
//! the mutable-global slot allocator. All ID-space mutation is serialized
//! by the compartment mutex; one compartment's mutex is never held while
//! acquiring another's.

use crate::bitset::AllocationMask;
use crate::context::Context;
use crate::error::RuntimeError;
use crate::exception::ExceptionType;
use crate::function::{FunctionRef, UNOWNED_MODULE_INSTANCE_ID};
use crate::global::Global;
use crate::id_map::IdMap;
use crate::instance::ModuleInstance;
use crate::memory::Memory;
use crate::mmap::{round_up_to_page_size, Mmap};
use crate::object::ObjectKind;
use crate::runtime_data::{
    compartment_runtime_data, context_runtime_data_offset, CompartmentRuntimeData,
    ContextRuntimeData, COMPARTMENT_RESERVED_BYTES, COMPARTMENT_RUNTIME_DATA_ALIGNMENT_LOG2,
    CONTEXTS_OFFSET, MAX_CONTEXTS, MAX_MEMORIES, MAX_MUTABLE_GLOBALS, MAX_TABLES,
};
use crate::table::Table;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, Weak};
use tracing::trace;
use wavelet_types::UntaggedValue;

// The globals, exception-type and module-instance ID spaces have no
// layout-imposed bound; this just keeps a runaway allocator from looping
// forever.
const MAX_UNBOUNDED_IDS: usize = usize::MAX - 1;

pub(crate) struct CompartmentInner {
    pub tables: IdMap<Weak<Table>>,
    pub memories: IdMap<Weak<Memory>>,
    pub globals: IdMap<Weak<Global>>,
    pub exception_types: IdMap<Weak<ExceptionType>>,
    pub instances: IdMap<Weak<ModuleInstance>>,
    pub contexts: IdMap<Weak<Context>>,
    pub global_data_allocation_mask: AllocationMask,
    pub initial_context_mutable_globals: Box<[UntaggedValue]>,
}

/// A sandbox root: an identity space of runtime objects that may refer to
/// one another by ID.
pub struct Compartment {
    kind: ObjectKind,
    reservation: Mmap,
    aligned_offset: usize,
    pub(crate) inner: Mutex<CompartmentInner>,
}

unsafe impl Send for Compartment {}
unsafe impl Sync for Compartment {}

impl Compartment {
    /// Creates a compartment: reserves and aligns the runtime-data region
    /// and commits its header page.
    pub fn new() -> Result<Arc<Self>, RuntimeError> {
        let (reservation, aligned_offset) = Mmap::aligned_reserved(
            COMPARTMENT_RESERVED_BYTES,
            COMPARTMENT_RUNTIME_DATA_ALIGNMENT_LOG2,
        )
        .map_err(RuntimeError::OutOfMemory)?;

        let compartment = Arc::new(Self {
            kind: ObjectKind::Compartment,
            reservation,
            aligned_offset,
            inner: Mutex::new(CompartmentInner {
                tables: IdMap::new(MAX_TABLES),
                memories: IdMap::new(MAX_MEMORIES),
                globals: IdMap::new(MAX_UNBOUNDED_IDS),
                exception_types: IdMap::new(MAX_UNBOUNDED_IDS),
                instances: IdMap::new(MAX_UNBOUNDED_IDS),
                contexts: IdMap::new(MAX_CONTEXTS),
                global_data_allocation_mask: AllocationMask::new(),
                initial_context_mutable_globals: vec![
                    UntaggedValue::zero();
                    MAX_MUTABLE_GLOBALS
                ]
                .into_boxed_slice(),
            }),
        });

        compartment
            .commit_runtime_data(0, CONTEXTS_OFFSET)
            .map_err(RuntimeError::OutOfMemory)?;
        unsafe {
            (*compartment.runtime_data().as_ptr()).compartment =
                Arc::as_ptr(&compartment) as *mut Compartment;
        }

        trace!(
            runtime_data = ?compartment.runtime_data().as_ptr(),
            "created compartment"
        );
        Ok(compartment)
    }

    /// The object kind tag (always `ObjectKind::Compartment`).
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// The compartment's runtime-data header.
    pub(crate) fn runtime_data(&self) -> NonNull<CompartmentRuntimeData> {
        let base = self.reservation.as_ptr() as usize + self.aligned_offset;
        // The aligned base is non-null by construction.
        unsafe { NonNull::new_unchecked(base as *mut CompartmentRuntimeData) }
    }

    /// Commits `len` bytes at `offset` within the runtime-data region,
    /// widening to host page boundaries.
    pub(crate) fn commit_runtime_data(&self, offset: usize, len: usize) -> Result<(), String> {
        let page_size = region::page::size();
        let start = (self.aligned_offset + offset) & !(page_size - 1);
        let end = round_up_to_page_size(self.aligned_offset + offset + len, page_size);
        self.reservation.make_accessible(start, end - start)
    }

    /// The runtime-data block of context `id`.
    pub(crate) fn context_runtime_data_ptr(&self, context_id: usize) -> *mut ContextRuntimeData {
        let base = self.reservation.as_ptr() as usize + self.aligned_offset;
        (base + context_runtime_data_offset(context_id)) as *mut ContextRuntimeData
    }

    /// Whether `function` is in this compartment: its owning module
    /// instance ID must map to an instance whose JIT module contains the
    /// function. Functions with the sentinel owning ID are in every
    /// compartment.
    pub fn contains_function(&self, function: FunctionRef) -> bool {
        let header = unsafe { function.as_ref() };
        if header.module_instance_id() == UNOWNED_MODULE_INSTANCE_ID {
            return true;
        }
        let code_info = match header.mutable_data().code_info() {
            Some(info) => info,
            None => return false,
        };
        let inner = self.inner.lock().unwrap();
        match (
            inner
                .instances
                .get(header.module_instance_id())
                .and_then(Weak::upgrade),
            code_info.jit_module.upgrade(),
        ) {
            (Some(instance), Some(function_module)) => {
                // Trait-object identity: compare the data addresses only.
                let instance_module = Arc::as_ptr(instance.jit_module()) as *const u8;
                Arc::as_ptr(&function_module) as *const u8 == instance_module
            }
            _ => false,
        }
    }
}

impl Drop for Compartment {
    fn drop(&mut self) {
        // Every object holds a strong reference to its compartment and
        // removes its ID on drop, so the ID spaces must be empty by now.
        let inner = self.inner.get_mut().unwrap();
        debug_assert!(inner.tables.is_empty());
        debug_assert!(inner.memories.is_empty());
        debug_assert!(inner.globals.is_empty());
        debug_assert!(inner.exception_types.is_empty());
        debug_assert!(inner.instances.is_empty());
        debug_assert!(inner.contexts.is_empty());
    }
}

impl std::fmt::Debug for Compartment {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Compartment")
            .field("runtime_data", &self.runtime_data().as_ptr())
            .finish()
    }
}

/// Recovers a strong reference to the compartment from a context's
/// runtime-data pointer, the way generated code does: mask the low 32 bits
/// and follow the header's back-pointer.
///
/// # Safety
/// `context_runtime_data` must point into a live compartment's reservation.
pub unsafe fn compartment_from_context_runtime_data(
    context_runtime_data: *mut ContextRuntimeData,
) -> Arc<Compartment> {
    let header = compartment_runtime_data(context_runtime_data);
    let compartment = (*header).compartment as *const Compartment;
    Arc::increment_strong_count(compartment);
    Arc::from_raw(compartment)
}

/// Looks up a memory by ID from a context's runtime data.
///
/// # Safety
/// As [`compartment_from_context_runtime_data`].
pub unsafe fn memory_from_runtime_data(
    context_runtime_data: *mut ContextRuntimeData,
    memory_id: usize,
) -> Option<Arc<Memory>> {
    let compartment = compartment_from_context_runtime_data(context_runtime_data);
    let inner = compartment.inner.lock().unwrap();
    inner.memories.get(memory_id).and_then(Weak::upgrade)
}

/// Looks up a table by ID from a context's runtime data.
///
/// # Safety
/// As [`compartment_from_context_runtime_data`].
pub unsafe fn table_from_runtime_data(
    context_runtime_data: *mut ContextRuntimeData,
    table_id: usize,
) -> Option<Arc<Table>> {
    let compartment = compartment_from_context_runtime_data(context_runtime_data);
    let inner = compartment.inner.lock().unwrap();
    inner.tables.get(table_id).and_then(Weak::upgrade)
}

/// Looks up a module instance by ID from a context's runtime data.
///
/// # Safety
/// As [`compartment_from_context_runtime_data`].
pub unsafe fn module_instance_from_runtime_data(
    context_runtime_data: *mut ContextRuntimeData,
    module_instance_id: usize,
) -> Option<Arc<ModuleInstance>> {
    let compartment = compartment_from_context_runtime_data(context_runtime_data);
    let inner = compartment.inner.lock().unwrap();
    inner
        .instances
        .get(module_instance_id)
        .and_then(Weak::upgrade)
}

/// The result of cloning a compartment. The cloned objects are returned as
/// strong references because this struct holds the clone's only roots:
/// dropping it releases the whole clone. All IDs are preserved from the
/// source compartment.
pub struct ClonedCompartment {
    /// The cloned compartment.
    pub compartment: Arc<Compartment>,
    /// The cloned memories.
    pub memories: Vec<Arc<Memory>>,
    /// The cloned tables.
    pub tables: Vec<Arc<Table>>,
    /// The cloned globals.
    pub globals: Vec<Arc<Global>>,
    /// The cloned exception types.
    pub exception_types: Vec<Arc<ExceptionType>>,
    /// The cloned module instances.
    pub instances: Vec<Arc<ModuleInstance>>,
    /// The cloned contexts.
    pub contexts: Vec<Arc<Context>>,
}

/// Clones a compartment: every object is duplicated with its ID preserved,
/// and every cross-object reference is remapped through the clone's ID
/// tables (which is what lets reference cycles resolve). Objects contained
/// in no instance are not kept alive by the clone.
pub fn clone_compartment(source: &Arc<Compartment>) -> Result<ClonedCompartment, RuntimeError> {
    let clone = Compartment::new()?;

    // Snapshot the source's object lists. The source mutex is released
    // before any clone-side creation so the two compartment mutexes are
    // never held together.
    struct Snapshot {
        memories: Vec<(usize, Arc<Memory>)>,
        tables: Vec<(usize, Arc<Table>)>,
        globals: Vec<(usize, Arc<Global>)>,
        exception_types: Vec<(usize, Arc<ExceptionType>)>,
        instances: Vec<(usize, Arc<ModuleInstance>)>,
        contexts: Vec<(usize, Arc<Context>)>,
        mask: AllocationMask,
        initial_mutable_globals: Vec<UntaggedValue>,
    }
    fn collect<T>(map: &IdMap<Weak<T>>) -> Vec<(usize, Arc<T>)> {
        map.iter()
            .filter_map(|(id, weak)| weak.upgrade().map(|arc| (id, arc)))
            .collect()
    }
    let snapshot = {
        let inner = source.inner.lock().unwrap();
        Snapshot {
            memories: collect(&inner.memories),
            tables: collect(&inner.tables),
            globals: collect(&inner.globals),
            exception_types: collect(&inner.exception_types),
            instances: collect(&inner.instances),
            contexts: collect(&inner.contexts),
            mask: inner.global_data_allocation_mask.clone(),
            initial_mutable_globals: inner.initial_context_mutable_globals.to_vec(),
        }
    };

    {
        let mut inner = clone.inner.lock().unwrap();
        inner.global_data_allocation_mask = snapshot.mask;
        inner
            .initial_context_mutable_globals
            .copy_from_slice(&snapshot.initial_mutable_globals);
    }

    // Contained objects first, then the instances that reference them by
    // ID, then the contexts.
    let mut cloned_memories = Vec::with_capacity(snapshot.memories.len());
    for (id, memory) in &snapshot.memories {
        cloned_memories.push(Memory::clone_into(memory, &clone, *id)?);
    }
    let mut cloned_tables = Vec::with_capacity(snapshot.tables.len());
    for (id, table) in &snapshot.tables {
        cloned_tables.push(Table::clone_into(table, &clone, *id)?);
    }
    let mut cloned_globals = Vec::with_capacity(snapshot.globals.len());
    for (id, global) in &snapshot.globals {
        cloned_globals.push(Global::clone_into(global, &clone, *id)?);
    }
    let mut cloned_exception_types = Vec::with_capacity(snapshot.exception_types.len());
    for (id, exception_type) in &snapshot.exception_types {
        cloned_exception_types.push(ExceptionType::clone_into(exception_type, &clone, *id)?);
    }

    let mut instances = Vec::with_capacity(snapshot.instances.len());
    for (id, instance) in &snapshot.instances {
        instances.push(ModuleInstance::clone_into(instance, &clone, *id)?);
    }

    let mut contexts = Vec::with_capacity(snapshot.contexts.len());
    for (id, context) in &snapshot.contexts {
        contexts.push(Context::clone_into(context, &clone, *id)?);
    }

    trace!(
        num_instances = instances.len(),
        num_contexts = contexts.len(),
        "cloned compartment"
    );

    Ok(ClonedCompartment {
        compartment: clone,
        memories: cloned_memories,
        tables: cloned_tables,
        globals: cloned_globals,
        exception_types: cloned_exception_types,
        instances,
        contexts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::SentinelFunction;
    use crate::global::Global;
    use crate::memory::Memory;
    use crate::object::Extern;
    use wavelet_types::{GlobalType, MemoryType, Mutability, Type, Value};

    #[test]
    fn objects_belong_only_to_their_compartment() {
        let compartment_a = Compartment::new().unwrap();
        let compartment_b = Compartment::new().unwrap();
        let memory = Memory::new(
            &compartment_a,
            MemoryType::new(1u32, None, false),
            "m".to_string(),
        )
        .unwrap();

        let object = Extern::Memory(memory);
        assert!(object.is_in_compartment(&compartment_a));
        assert!(!object.is_in_compartment(&compartment_b));
    }

    #[test]
    fn sentinel_functions_are_in_every_compartment() {
        let compartment = Compartment::new().unwrap();
        let sentinel = SentinelFunction::new("stub");
        assert!(compartment.contains_function(sentinel.as_function_ref()));
    }

    #[test]
    fn runtime_data_is_aligned_and_self_describing() {
        let compartment = Compartment::new().unwrap();
        let base = compartment.runtime_data().as_ptr() as usize;
        assert_eq!(base & (COMPARTMENT_RESERVED_BYTES - 1), 0);
        let back_pointer = unsafe { (*compartment.runtime_data().as_ptr()).compartment };
        assert_eq!(back_pointer as *const Compartment, Arc::as_ptr(&compartment));
    }

    #[test]
    fn context_discovery_through_pointer_masking() {
        let compartment = Compartment::new().unwrap();
        let context = Context::new(&compartment).unwrap();
        let recovered = unsafe {
            compartment_from_context_runtime_data(context.runtime_data().as_ptr())
        };
        assert!(Arc::ptr_eq(&recovered, &compartment));
    }

    #[test]
    fn cloning_copies_memories_and_globals() {
        let source = Compartment::new().unwrap();
        let memory = Memory::new(&source, MemoryType::new(1u32, None, false), "m".to_string())
            .unwrap();
        unsafe { memory.base_address().write(0x5a) };
        let context = Context::new(&source).unwrap();
        let global = Global::new(
            &source,
            GlobalType::new(Type::I32, Mutability::Var),
            Value::I32(41),
        )
        .unwrap();
        global.set_value(&context, Value::I32(42)).unwrap();

        let cloned = clone_compartment(&source).unwrap();
        assert_eq!(cloned.contexts.len(), 1);

        // The cloned memory has the same ID and the same bytes, but its own
        // backing pages.
        let cloned_memory = {
            let inner = cloned.compartment.inner.lock().unwrap();
            inner
                .memories
                .get(memory.id())
                .and_then(Weak::upgrade)
                .unwrap()
        };
        assert_eq!(unsafe { cloned_memory.base_address().read() }, 0x5a);
        unsafe { cloned_memory.base_address().write(0x11) };
        assert_eq!(unsafe { memory.base_address().read() }, 0x5a);

        // The cloned context carries the mutated global value; the global's
        // slot index is preserved.
        let cloned_global = {
            let inner = cloned.compartment.inner.lock().unwrap();
            inner
                .globals
                .get(global.id())
                .and_then(Weak::upgrade)
                .unwrap()
        };
        assert_eq!(
            cloned_global.mutable_global_index(),
            global.mutable_global_index()
        );
        assert_eq!(
            cloned_global.get_value(Some(&cloned.contexts[0])),
            Value::I32(42)
        );
    }
}
