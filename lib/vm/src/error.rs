use crate::engine::LoadError;
use crate::trap::Trap;
use thiserror::Error;
use wavelet_types::{MemoryError, TableError};

/// Errors surfaced by runtime object factories, instantiation, and
/// invocation. Traps that escape an invocation are wrapped here too.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// An object was used with a compartment it was not created in.
    #[error("object is not in the expected compartment")]
    InvalidCompartment,

    /// An immutable global was passed to a mutating operation.
    #[error("attempted to set an immutable global")]
    ImmutableGlobalCannotBeSet,

    /// A value's type did not match the declared type.
    #[error("type mismatch: expected {expected}, found {found}")]
    IncorrectType {
        /// The declared type.
        expected: String,
        /// The type actually supplied.
        found: String,
    },

    /// The compartment has no free IDs left for this object kind.
    #[error("the compartment's {kind} ID space is exhausted")]
    IdSpaceExhausted {
        /// Which ID space filled up.
        kind: &'static str,
    },

    /// Instantiation received a different number of import bindings than
    /// the module declares.
    #[error("import count mismatch: module declares {expected} {kind} import(s), {found} bound")]
    ImportCountMismatch {
        /// Which import kind mismatched.
        kind: &'static str,
        /// The declared count.
        expected: usize,
        /// The bound count.
        found: usize,
    },

    /// An import binding failed the declared-type or compartment check.
    #[error("incompatible import {module_name}.{export_name}: expected {expected}")]
    IncompatibleImport {
        /// The import's module name.
        module_name: String,
        /// The import's export name.
        export_name: String,
        /// The declared type the binding had to satisfy.
        expected: String,
    },

    /// An allocation failed.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// The engine rejected the module's object code.
    #[error(transparent)]
    Load(#[from] LoadError),

    /// A memory operation failed.
    #[error(transparent)]
    Memory(#[from] MemoryError),

    /// A table operation failed.
    #[error(transparent)]
    Table(#[from] TableError),

    /// A trap unwound out of instantiation or invocation.
    #[error(transparent)]
    Trap(#[from] Trap),
}
