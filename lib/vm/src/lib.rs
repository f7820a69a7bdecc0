//! Runtime library support for Wavelet: the instantiation and execution
//! substrate.
//!
//! The crate owns the object/compartment model, the sandboxed linear
//! memory and table implementations, globals and exception types, module
//! instantiation and the linking protocol, checked invocation, and the
//! trap machinery. Machine code generation lives behind the [`Engine`]
//! trait; the text parser is a separate collaborator that produces the
//! [`wavelet_ir`] module this crate consumes.

#![deny(trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

// The runtime-data layout masks context pointers down to a 4 GiB-aligned
// compartment base, which only makes sense with 64-bit addresses.
#[cfg(not(target_pointer_width = "64"))]
compile_error!("wavelet-vm requires a 64-bit target");

mod bitset;
mod compartment;
mod context;
mod engine;
mod error;
mod exception;
mod function;
mod global;
mod id_map;
mod instance;
mod invoke;
mod linker;
mod memory;
mod mmap;
mod object;
mod runtime_data;
mod sig_registry;
mod table;
mod trap;

pub mod libcalls;

pub use crate::compartment::{
    clone_compartment, compartment_from_context_runtime_data, memory_from_runtime_data,
    module_instance_from_runtime_data, table_from_runtime_data, ClonedCompartment, Compartment,
};
pub use crate::context::Context;
pub use crate::engine::{
    compile_module, CallingConvention, CompileError, Engine, FunctionImportBinding, GlobalBinding,
    IntrinsicFunctionBinding, LoadError, LoadRequest, LoadedModule, Module,
};
pub use crate::error::RuntimeError;
pub use crate::exception::ExceptionType;
pub use crate::function::{
    Function, FunctionCodeInfo, FunctionMutableData, FunctionRef, InvokeThunk, SentinelFunction,
    UNOWNED_MODULE_INSTANCE_ID,
};
pub use crate::global::{Global, INVALID_MUTABLE_GLOBAL_INDEX};
pub use crate::instance::{instantiate_module, ImportBindings, ModuleInstance};
pub use crate::invoke::invoke_function_checked;
pub use crate::linker::{link_module, LinkResult, MissingImport, Resolver};
pub use crate::memory::{lookup_memory_by_address, Memory};
pub use crate::mmap::Mmap;
pub use crate::object::{Extern, ObjectKind};
pub use crate::runtime_data::{
    compartment_runtime_data, CompartmentRuntimeData, ContextRuntimeData,
    COMPARTMENT_RESERVED_BYTES, COMPARTMENT_RUNTIME_DATA_ALIGNMENT_LOG2, CONTEXTS_OFFSET,
    MAX_CONTEXTS, MAX_MEMORIES, MAX_MUTABLE_GLOBALS, MAX_TABLES, MAX_THUNK_ARG_AND_RETURN_BYTES,
};
pub use crate::sig_registry::{SignatureRegistry, VMSharedSignatureIndex};
pub use crate::table::{out_of_bounds_element, uninitialized_element, Table};
pub use crate::trap::{
    catch_traps, describe_instruction_pointer, fatal, Trap, TrapCode,
};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
