//! Exception types: the signature an exception carries when user code
//! raises it. Intrinsic trap identities are [`TrapCode`](crate::trap::TrapCode)s
//! rather than exception-type objects; exception types exist for the
//! exceptions modules declare, import and throw themselves.

use crate::compartment::Compartment;
use crate::error::RuntimeError;
use crate::object::ObjectKind;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;
use wavelet_types::ExceptionSig;

const UNASSIGNED_ID: usize = usize::MAX;

/// A user-raisable exception type: its payload signature and debug name.
pub struct ExceptionType {
    kind: ObjectKind,
    compartment: Option<Arc<Compartment>>,
    id: AtomicUsize,
    sig: ExceptionSig,
    debug_name: String,
}

impl ExceptionType {
    /// Creates an exception type in `compartment`.
    pub fn new(
        compartment: &Arc<Compartment>,
        sig: ExceptionSig,
        debug_name: String,
    ) -> Result<Arc<Self>, RuntimeError> {
        let exception_type = Arc::new(Self {
            kind: ObjectKind::ExceptionType,
            compartment: Some(compartment.clone()),
            id: AtomicUsize::new(UNASSIGNED_ID),
            sig,
            debug_name,
        });
        Self::register_in_compartment(&exception_type, None)?;
        Ok(exception_type)
    }

    /// Creates a process-lifetime exception type owned by no compartment.
    pub fn intrinsic(sig: ExceptionSig, debug_name: String) -> Arc<Self> {
        Arc::new(Self {
            kind: ObjectKind::ExceptionType,
            compartment: None,
            id: AtomicUsize::new(UNASSIGNED_ID),
            sig,
            debug_name,
        })
    }

    fn register_in_compartment(
        exception_type: &Arc<Self>,
        fixed_id: Option<usize>,
    ) -> Result<(), RuntimeError> {
        let compartment = exception_type
            .compartment
            .as_ref()
            .expect("intrinsic exception types are not registered");
        let mut inner = compartment.inner.lock().unwrap();
        let id = match fixed_id {
            Some(id) => {
                inner
                    .exception_types
                    .insert_at(id, Arc::downgrade(exception_type));
                id
            }
            None => inner
                .exception_types
                .add(Arc::downgrade(exception_type))
                .ok_or(RuntimeError::IdSpaceExhausted {
                    kind: "exception type",
                })?,
        };
        exception_type.id.store(id, Ordering::Release);
        trace!(id, debug_name = %exception_type.debug_name, "created exception type");
        Ok(())
    }

    /// The object kind tag (always `ObjectKind::ExceptionType`).
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// The owning compartment, or `None` for intrinsic types.
    pub fn compartment(&self) -> Option<&Arc<Compartment>> {
        self.compartment.as_ref()
    }

    /// The exception type's ID within its compartment.
    pub fn id(&self) -> usize {
        self.id.load(Ordering::Acquire)
    }

    /// The payload signature.
    pub fn sig(&self) -> &ExceptionSig {
        &self.sig
    }

    /// The exception type's debug name.
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    /// Clones an exception type into a cloned compartment, preserving its
    /// ID.
    pub(crate) fn clone_into(
        source: &Arc<Self>,
        compartment: &Arc<Compartment>,
        id: usize,
    ) -> Result<Arc<Self>, RuntimeError> {
        let clone = Arc::new(Self {
            kind: ObjectKind::ExceptionType,
            compartment: Some(compartment.clone()),
            id: AtomicUsize::new(UNASSIGNED_ID),
            sig: source.sig.clone(),
            debug_name: source.debug_name.clone(),
        });
        Self::register_in_compartment(&clone, Some(id))?;
        Ok(clone)
    }
}

impl Drop for ExceptionType {
    fn drop(&mut self) {
        if let Some(compartment) = &self.compartment {
            let id = self.id.load(Ordering::Acquire);
            if id != UNASSIGNED_ID {
                let mut inner = compartment.inner.lock().unwrap();
                inner.exception_types.remove(id);
            }
        }
    }
}

impl std::fmt::Debug for ExceptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ExceptionType")
            .field("debug_name", &self.debug_name)
            .field("sig", &self.sig)
            .finish()
    }
}
