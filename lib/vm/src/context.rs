//! Per-thread execution contexts.
//!
//! A context owns one 4 KiB block of its compartment's runtime-data region:
//! the call-marshalling scratch area and the mutable-global cells. A thread
//! executing generated code carries its context's runtime-data pointer in a
//! callee-saved register, so everything generated code touches per-thread
//! is reachable from this block without a lock. Contexts never migrate
//! between compartments.

use crate::compartment::Compartment;
use crate::error::RuntimeError;
use crate::object::ObjectKind;
use crate::runtime_data::{context_runtime_data_offset, ContextRuntimeData};
use std::ptr::NonNull;
use std::sync::{Arc, Weak};
use tracing::trace;

/// A per-thread execution handle within a compartment.
pub struct Context {
    kind: ObjectKind,
    compartment: Arc<Compartment>,
    id: usize,
    runtime_data: NonNull<ContextRuntimeData>,
}

unsafe impl Send for Context {}
unsafe impl Sync for Context {}

impl Context {
    /// Creates a context: allocates an ID, commits the context's
    /// runtime-data page, and seeds its mutable globals from the
    /// compartment's initial values. All under the compartment mutex so a
    /// concurrent `Global` creation can't miss the new context.
    pub fn new(compartment: &Arc<Compartment>) -> Result<Arc<Self>, RuntimeError> {
        let mut inner = compartment.inner.lock().unwrap();
        let id = inner
            .contexts
            .add(Weak::new())
            .ok_or(RuntimeError::IdSpaceExhausted { kind: "context" })?;

        if let Err(message) = compartment.commit_runtime_data(
            context_runtime_data_offset(id),
            std::mem::size_of::<ContextRuntimeData>(),
        ) {
            inner.contexts.remove(id);
            return Err(RuntimeError::OutOfMemory(message));
        }

        let runtime_data = compartment.context_runtime_data_ptr(id);
        unsafe {
            let initial = &inner.initial_context_mutable_globals;
            (*runtime_data)
                .mutable_globals
                .copy_from_slice(initial);
        }

        let context = Arc::new(Self {
            kind: ObjectKind::Context,
            compartment: compartment.clone(),
            id,
            runtime_data: unsafe { NonNull::new_unchecked(runtime_data) },
        });
        inner.contexts.set(id, Arc::downgrade(&context));
        trace!(id, "created context");
        Ok(context)
    }

    /// The object kind tag (always `ObjectKind::Context`).
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// The compartment this context executes in.
    pub fn compartment(&self) -> &Arc<Compartment> {
        &self.compartment
    }

    /// The context's ID within its compartment.
    pub fn id(&self) -> usize {
        self.id
    }

    /// The context's runtime-data block.
    pub fn runtime_data(&self) -> NonNull<ContextRuntimeData> {
        self.runtime_data
    }

    /// Clones a context into a cloned compartment, preserving its ID and
    /// copying its whole runtime-data block (scratch and mutable globals).
    pub(crate) fn clone_into(
        source: &Arc<Context>,
        compartment: &Arc<Compartment>,
        id: usize,
    ) -> Result<Arc<Self>, RuntimeError> {
        let mut inner = compartment.inner.lock().unwrap();
        inner.contexts.insert_at(id, Weak::new());

        if let Err(message) = compartment.commit_runtime_data(
            context_runtime_data_offset(id),
            std::mem::size_of::<ContextRuntimeData>(),
        ) {
            inner.contexts.remove(id);
            return Err(RuntimeError::OutOfMemory(message));
        }

        let runtime_data = compartment.context_runtime_data_ptr(id);
        unsafe {
            std::ptr::copy_nonoverlapping(
                source.runtime_data.as_ptr() as *const u8,
                runtime_data as *mut u8,
                std::mem::size_of::<ContextRuntimeData>(),
            );
        }

        let context = Arc::new(Self {
            kind: ObjectKind::Context,
            compartment: compartment.clone(),
            id,
            runtime_data: unsafe { NonNull::new_unchecked(runtime_data) },
        });
        inner.contexts.set(id, Arc::downgrade(&context));
        Ok(context)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let mut inner = self.compartment.inner.lock().unwrap();
        inner.contexts.remove(self.id);
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Context").field("id", &self.id).finish()
    }
}
