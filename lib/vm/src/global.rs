//! Globals.
//!
//! An immutable global's cell lives in the global object itself. A mutable
//! global's cell lives in *every* context's runtime-data block, at an index
//! allocated from the compartment's slot mask when the global is created:
//! generated code reaches its mutable globals through the context pointer
//! it already carries, without a lock. Creation seeds the compartment's
//! initial-value array and every live context, so all threads observe the
//! same initial state.

use crate::compartment::Compartment;
use crate::context::Context;
use crate::error::RuntimeError;
use crate::function::FunctionRef;
use crate::object::{untagged_to_value, value_to_untagged, ObjectKind};
use crate::runtime_data::MAX_MUTABLE_GLOBALS;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;
use wavelet_types::{GlobalType, UntaggedValue, Value};

const UNASSIGNED_ID: usize = usize::MAX;

/// The slot index of globals that have no slot (immutable globals).
pub const INVALID_MUTABLE_GLOBAL_INDEX: u32 = u32::MAX;

/// A typed, optionally mutable global cell.
pub struct Global {
    kind: ObjectKind,
    compartment: Arc<Compartment>,
    id: AtomicUsize,
    ty: GlobalType,
    initial_value: UntaggedValue,
    mutable_global_index: u32,
}

impl Global {
    /// Creates a global with the given initial value. Mutable globals
    /// allocate a slot in the per-context mutable-global array and write
    /// the initial value into every live context.
    pub fn new(
        compartment: &Arc<Compartment>,
        ty: GlobalType,
        initial_value: Value<FunctionRef>,
    ) -> Result<Arc<Self>, RuntimeError> {
        if initial_value.ty() != ty.ty {
            return Err(RuntimeError::IncorrectType {
                expected: ty.ty.to_string(),
                found: initial_value.ty().to_string(),
            });
        }
        if let Value::FuncRef(Some(function)) = &initial_value {
            if !compartment.contains_function(*function) {
                return Err(RuntimeError::InvalidCompartment);
            }
        }
        let raw = value_to_untagged(&initial_value);

        let mutable_global_index = if ty.mutability.is_mutable() {
            let mut inner = compartment.inner.lock().unwrap();
            let index = inner.global_data_allocation_mask.smallest_non_member();
            if index == MAX_MUTABLE_GLOBALS {
                return Err(RuntimeError::IdSpaceExhausted {
                    kind: "mutable global slot",
                });
            }
            inner.global_data_allocation_mask.add(index);

            // Initialize the value for each live context, and the data used
            // to initialize new contexts.
            inner.initial_context_mutable_globals[index] = raw;
            let contexts: Vec<Arc<Context>> = inner
                .contexts
                .iter()
                .filter_map(|(_, weak)| weak.upgrade())
                .collect();
            for context in contexts {
                unsafe {
                    (*context.runtime_data().as_ptr()).mutable_globals[index] = raw;
                }
            }
            index as u32
        } else {
            INVALID_MUTABLE_GLOBAL_INDEX
        };

        let global = Arc::new(Self {
            kind: ObjectKind::Global,
            compartment: compartment.clone(),
            id: AtomicUsize::new(UNASSIGNED_ID),
            ty,
            initial_value: raw,
            mutable_global_index,
        });
        Self::register_in_compartment(&global, None)?;
        Ok(global)
    }

    fn register_in_compartment(
        global: &Arc<Self>,
        fixed_id: Option<usize>,
    ) -> Result<(), RuntimeError> {
        let mut inner = global.compartment.inner.lock().unwrap();
        let id = match fixed_id {
            Some(id) => {
                inner.globals.insert_at(id, Arc::downgrade(global));
                id
            }
            None => match inner.globals.add(Arc::downgrade(global)) {
                Some(id) => id,
                // The global's Drop releases the allocated slot.
                None => return Err(RuntimeError::IdSpaceExhausted { kind: "global" }),
            },
        };
        global.id.store(id, Ordering::Release);
        trace!(id, ty = %global.ty, "created global");
        Ok(())
    }

    /// The object kind tag (always `ObjectKind::Global`).
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// The compartment this global was created in.
    pub fn compartment(&self) -> &Arc<Compartment> {
        &self.compartment
    }

    /// The global's ID within its compartment.
    pub fn id(&self) -> usize {
        self.id.load(Ordering::Acquire)
    }

    /// The global's type.
    pub fn ty(&self) -> GlobalType {
        self.ty
    }

    /// The slot this global's mutable cell occupies in every context, or
    /// [`INVALID_MUTABLE_GLOBAL_INDEX`] for immutable globals.
    pub fn mutable_global_index(&self) -> u32 {
        self.mutable_global_index
    }

    /// The value the global was created with.
    pub fn initial_value(&self) -> Value<FunctionRef> {
        unsafe { untagged_to_value(&self.initial_value, self.ty.ty) }
    }

    /// The initial value's raw bit pattern, as bound into generated code
    /// for immutable globals.
    pub(crate) fn initial_untagged(&self) -> UntaggedValue {
        self.initial_value
    }

    /// Reads the global's value: from the context's slot if mutable, from
    /// the global itself if immutable. A context is required only for
    /// mutable globals.
    pub fn get_value(&self, context: Option<&Context>) -> Value<FunctionRef> {
        if self.ty.mutability.is_mutable() {
            let context = context.expect("reading a mutable global requires a context");
            debug_assert!(Arc::ptr_eq(context.compartment(), &self.compartment));
            let raw = unsafe {
                (*context.runtime_data().as_ptr()).mutable_globals
                    [self.mutable_global_index as usize]
            };
            unsafe { untagged_to_value(&raw, self.ty.ty) }
        } else {
            self.initial_value()
        }
    }

    /// Writes the global's value in `context` and returns the previous
    /// value. Wasm code mutates its globals without synchronization;
    /// host-side writes follow the same model, so cross-thread visibility
    /// is the caller's concern.
    pub fn set_value(
        &self,
        context: &Context,
        new_value: Value<FunctionRef>,
    ) -> Result<Value<FunctionRef>, RuntimeError> {
        if !self.ty.mutability.is_mutable() {
            return Err(RuntimeError::ImmutableGlobalCannotBeSet);
        }
        if !Arc::ptr_eq(context.compartment(), &self.compartment) {
            return Err(RuntimeError::InvalidCompartment);
        }
        if new_value.ty() != self.ty.ty {
            return Err(RuntimeError::IncorrectType {
                expected: self.ty.ty.to_string(),
                found: new_value.ty().to_string(),
            });
        }
        if let Value::FuncRef(Some(function)) = &new_value {
            if !self.compartment.contains_function(*function) {
                return Err(RuntimeError::InvalidCompartment);
            }
        }

        let slot = unsafe {
            &mut (*context.runtime_data().as_ptr()).mutable_globals
                [self.mutable_global_index as usize]
        };
        let previous = unsafe { untagged_to_value(slot, self.ty.ty) };
        *slot = value_to_untagged(&new_value);
        Ok(previous)
    }

    /// Clones a global into a cloned compartment, preserving its ID and
    /// slot index. The clone's allocation mask and initial values were
    /// copied wholesale before object cloning starts.
    pub(crate) fn clone_into(
        source: &Arc<Self>,
        compartment: &Arc<Compartment>,
        id: usize,
    ) -> Result<Arc<Self>, RuntimeError> {
        let clone = Arc::new(Self {
            kind: ObjectKind::Global,
            compartment: compartment.clone(),
            id: AtomicUsize::new(UNASSIGNED_ID),
            ty: source.ty,
            initial_value: source.initial_value,
            mutable_global_index: source.mutable_global_index,
        });
        Self::register_in_compartment(&clone, Some(id))?;
        Ok(clone)
    }
}

impl Drop for Global {
    fn drop(&mut self) {
        let id = self.id.load(Ordering::Acquire);
        let mut inner = self.compartment.inner.lock().unwrap();
        if id != UNASSIGNED_ID {
            inner.globals.remove(id);
        }
        if self.ty.mutability.is_mutable() {
            debug_assert!(inner
                .global_data_allocation_mask
                .contains(self.mutable_global_index as usize));
            inner
                .global_data_allocation_mask
                .remove(self.mutable_global_index as usize);
        }
    }
}

impl std::fmt::Debug for Global {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Global").field("ty", &self.ty).finish()
    }
}
