//! The runtime object model: the closed set of object kinds, and the typed
//! handle an export or import binding travels as.
//!
//! Every heap object the runtime traffics in starts with its
//! [`ObjectKind`] tag so that generated code (and the occasional checked
//! downcast from a raw address) can identify an object without virtual
//! dispatch.

use crate::compartment::Compartment;
use crate::exception::ExceptionType;
use crate::function::FunctionRef;
use crate::global::Global;
use crate::memory::Memory;
use crate::sig_registry::SignatureRegistry;
use crate::table::Table;
use std::sync::Arc;
use wavelet_types::{ExternKind, ExternType};

/// The kind tag stored as the first field of every runtime object. The
/// extern kinds share the low tag values so import/export checks are a
/// straight comparison.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectKind {
    /// A function, owned by a loaded JIT module.
    Function = 0,
    /// A table.
    Table = 1,
    /// A memory.
    Memory = 2,
    /// A global.
    Global = 3,
    /// An exception type.
    ExceptionType = 4,
    /// A module instance.
    ModuleInstance = 5,
    /// A per-thread execution context.
    Context = 6,
    /// A compartment.
    Compartment = 7,
}

/// A typed reference to a linkable runtime object: the currency of imports,
/// exports and the resolver boundary.
#[derive(Clone)]
pub enum Extern {
    /// A function. The referent is kept alive by the module instance that
    /// owns its JIT module.
    Function(FunctionRef),
    /// A table.
    Table(Arc<Table>),
    /// A memory.
    Memory(Arc<Memory>),
    /// A global.
    Global(Arc<Global>),
    /// An exception type.
    ExceptionType(Arc<ExceptionType>),
}

impl Extern {
    /// The kind of the referenced object.
    pub fn kind(&self) -> ExternKind {
        match self {
            Self::Function(_) => ExternKind::Function,
            Self::Table(_) => ExternKind::Table,
            Self::Memory(_) => ExternKind::Memory,
            Self::Global(_) => ExternKind::Global,
            Self::ExceptionType(_) => ExternKind::Exception,
        }
    }

    /// The object's extern type.
    pub fn ty(&self) -> ExternType {
        match self {
            Self::Function(function) => {
                let encoded = unsafe { function.as_ref() }.encoded_type();
                let ty = SignatureRegistry::global()
                    .lookup(encoded)
                    .unwrap_or_default();
                ExternType::Function(ty)
            }
            Self::Table(table) => ExternType::Table(table.ty()),
            Self::Memory(memory) => ExternType::Memory(memory.ty()),
            Self::Global(global) => ExternType::Global(global.ty()),
            Self::ExceptionType(exception_type) => {
                ExternType::Exception(exception_type.sig().clone())
            }
        }
    }

    /// Tests whether the object satisfies `declared`: same kind, and the
    /// object's type is acceptable where `declared` is expected.
    pub fn is_a(&self, declared: &ExternType) -> bool {
        match (self, declared) {
            (Self::Function(function), ExternType::Function(ty)) => {
                let encoded = unsafe { function.as_ref() }.encoded_type();
                SignatureRegistry::global().register(ty) == encoded
            }
            (Self::Table(table), ExternType::Table(ty)) => ty.accepts(&table.ty()),
            (Self::Memory(memory), ExternType::Memory(ty)) => ty.accepts(&memory.ty()),
            (Self::Global(global), ExternType::Global(ty)) => *ty == global.ty(),
            (Self::ExceptionType(exception_type), ExternType::Exception(sig)) => {
                *sig == *exception_type.sig()
            }
            _ => false,
        }
    }

    /// Tests whether the object is in `compartment`.
    ///
    /// A function is in a compartment iff that compartment maps the
    /// function's owning module-instance ID to an instance holding the
    /// function's JIT module; functions with the sentinel owning ID are in
    /// every compartment.
    pub fn is_in_compartment(&self, compartment: &Arc<Compartment>) -> bool {
        match self {
            Self::Function(function) => compartment.contains_function(*function),
            Self::Table(table) => Arc::ptr_eq(table.compartment(), compartment),
            Self::Memory(memory) => Arc::ptr_eq(memory.compartment(), compartment),
            Self::Global(global) => Arc::ptr_eq(global.compartment(), compartment),
            Self::ExceptionType(exception_type) => match exception_type.compartment() {
                Some(owner) => Arc::ptr_eq(owner, compartment),
                // Intrinsic exception types belong to every compartment.
                None => true,
            },
        }
    }
}

impl std::fmt::Debug for Extern {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Extern::{:?}({})", self.kind(), self.ty())
    }
}

/// Marshals a typed value to the bit pattern stored in global cells and the
/// invocation scratch area. Function references are stored as the header
/// address, null as zero.
pub(crate) fn value_to_untagged(value: &wavelet_types::Value<FunctionRef>) -> wavelet_types::UntaggedValue {
    use wavelet_types::{UntaggedValue, Value};
    match value {
        Value::FuncRef(Some(function)) => UntaggedValue {
            func_ref: function.address(),
        },
        other => UntaggedValue::from(other),
    }
}

/// Recovers a typed value from a stored bit pattern.
///
/// # Safety
/// The bit pattern must have been written as a value of type `ty`; function
/// reference addresses must be live function headers or zero.
pub(crate) unsafe fn untagged_to_value(
    raw: &wavelet_types::UntaggedValue,
    ty: wavelet_types::Type,
) -> wavelet_types::Value<FunctionRef> {
    raw.to_value(ty, FunctionRef::from_address)
}
