use crate::units::Pages;
use thiserror::Error;

/// A byte length did not correspond to a whole number of 32-bit-addressable
/// WebAssembly pages.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[error("the size given is not a valid page count")]
pub struct PageCountOutOfRange;

/// Error type describing things that can go wrong when operating on Wasm
/// memories.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// The operation would cause the size of the memory to exceed the
    /// maximum or the implementation limit.
    #[error("memory of {} pages could not grow by {} pages", current.0, attempted_delta.0)]
    CouldNotGrow {
        /// The number of pages the memory currently holds.
        current: Pages,
        /// The attempted amount of pages to grow by.
        attempted_delta: Pages,
    },
    /// The minimum page count declared by the type exceeds what the host can
    /// reserve.
    #[error("the minimum of {} pages exceeds the allowed maximum of {} pages", min_requested.0, max_allowed.0)]
    MinimumMemoryTooLarge {
        /// The number of pages requested as the minimum.
        min_requested: Pages,
        /// The maximum number of pages the implementation supports.
        max_allowed: Pages,
    },
    /// The maximum page count declared by the type exceeds what the host can
    /// reserve.
    #[error("the maximum of {} pages exceeds the allowed maximum of {} pages", max_requested.0, max_allowed.0)]
    MaximumMemoryTooLarge {
        /// The number of pages requested as the maximum.
        max_requested: Pages,
        /// The maximum number of pages the implementation supports.
        max_allowed: Pages,
    },
    /// The memory type itself is inconsistent.
    #[error("invalid memory: {reason}")]
    InvalidMemory {
        /// Why the memory descriptor was rejected.
        reason: String,
    },
    /// A page-management syscall failed.
    #[error("error protecting or committing pages: {0}")]
    Region(String),
}

/// Error type describing things that can go wrong when operating on Wasm
/// tables. See [`MemoryError`] for the memory analogue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TableError {
    /// The operation would cause the size of the table to exceed the maximum
    /// or the implementation limit.
    #[error("table of {current} elements could not grow by {attempted_delta} elements")]
    CouldNotGrow {
        /// The number of elements the table currently holds.
        current: u32,
        /// The attempted amount of elements to grow by.
        attempted_delta: u32,
    },
    /// The table descriptor itself is inconsistent, or the compartment
    /// cannot hold another table.
    #[error("invalid table: {reason}")]
    InvalidTable {
        /// Why the table was rejected.
        reason: String,
    },
    /// A page-management syscall failed.
    #[error("error protecting or committing pages: {0}")]
    Region(String),
}
