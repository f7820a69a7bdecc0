//! The compartment runtime-data layout contract shared with generated code.
//!
//! A compartment reserves exactly 4 GiB of address space, aligned to 4 GiB.
//! The header page holds the compartment back-pointer and the memory/table
//! base arrays; the rest is a dense array of 4 KiB per-context blocks.
//! Generated code finds the compartment data from any context pointer by
//! masking off the low 32 bits, so the alignment is load-bearing.

use crate::compartment::Compartment;
use wavelet_types::UntaggedValue;

/// The size of a compartment's runtime-data reservation.
pub const COMPARTMENT_RESERVED_BYTES: usize = 4 * 1024 * 1024 * 1024;

/// The alignment of the reservation; masking a context-data address with
/// `!(COMPARTMENT_RESERVED_BYTES - 1)` yields the reservation base.
pub const COMPARTMENT_RUNTIME_DATA_ALIGNMENT_LOG2: u32 = 32;

/// Bytes of per-context scratch used to marshal call arguments and results.
pub const MAX_THUNK_ARG_AND_RETURN_BYTES: usize = 256;

const CONTEXT_RUNTIME_DATA_BYTES: usize = 4096;

/// The number of mutable-global slots in each context's block: whatever is
/// left of the 4 KiB block after the thunk scratch.
pub const MAX_MUTABLE_GLOBALS: usize = (CONTEXT_RUNTIME_DATA_BYTES
    - MAX_THUNK_ARG_AND_RETURN_BYTES)
    / std::mem::size_of::<UntaggedValue>();

/// The maximum number of memories per compartment.
pub const MAX_MEMORIES: usize = 255;

/// The maximum number of tables per compartment: the table-base array fills
/// whatever the header page has left after the compartment pointer and the
/// memory bases.
pub const MAX_TABLES: usize = (CONTEXT_RUNTIME_DATA_BYTES
    - MAX_MEMORIES * std::mem::size_of::<*mut u8>()
    - std::mem::size_of::<*mut u8>())
    / std::mem::size_of::<*mut u8>();

/// One thread's slab within the compartment reservation: scratch space for
/// call arguments and return values, then the mutable-global cells.
#[repr(C)]
pub struct ContextRuntimeData {
    /// Marshalling area for invocation arguments and results.
    pub thunk_arg_and_return_data: [u8; MAX_THUNK_ARG_AND_RETURN_BYTES],
    /// The mutable-global cells, indexed by each global's allocated slot.
    pub mutable_globals: [UntaggedValue; MAX_MUTABLE_GLOBALS],
}

/// The header page of a compartment's reservation.
#[repr(C)]
pub struct CompartmentRuntimeData {
    /// Back-pointer to the owning compartment.
    pub compartment: *mut Compartment,
    /// Base address of each memory, by memory ID.
    pub memory_bases: [*mut u8; MAX_MEMORIES],
    /// Base address of each table's element array, by table ID.
    pub table_bases: [*mut u8; MAX_TABLES],
}

/// Byte offset of the first context block within the reservation.
pub const CONTEXTS_OFFSET: usize = CONTEXT_RUNTIME_DATA_BYTES;

/// The maximum number of contexts per compartment: everything after the
/// header page.
pub const MAX_CONTEXTS: usize =
    (COMPARTMENT_RESERVED_BYTES - CONTEXTS_OFFSET) / CONTEXT_RUNTIME_DATA_BYTES;

// The layout below is an ABI with generated code; pin it.
const _: () = assert!(std::mem::size_of::<ContextRuntimeData>() == CONTEXT_RUNTIME_DATA_BYTES);
const _: () = assert!(std::mem::size_of::<CompartmentRuntimeData>() == CONTEXTS_OFFSET);
const _: () = assert!(MAX_MUTABLE_GLOBALS == 240);
const _: () = assert!(MAX_TABLES == 256);

/// Recovers the compartment runtime data from a context's runtime-data
/// pointer by masking off the low 32 address bits.
///
/// # Safety
/// `context_runtime_data` must point into a live compartment's reservation.
pub unsafe fn compartment_runtime_data(
    context_runtime_data: *mut ContextRuntimeData,
) -> *mut CompartmentRuntimeData {
    (context_runtime_data as usize & !(COMPARTMENT_RESERVED_BYTES - 1))
        as *mut CompartmentRuntimeData
}

/// Byte offset of context `id`'s block within the reservation.
pub fn context_runtime_data_offset(context_id: usize) -> usize {
    CONTEXTS_OFFSET + context_id * CONTEXT_RUNTIME_DATA_BYTES
}
