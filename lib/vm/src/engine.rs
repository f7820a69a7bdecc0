//! The seam between the runtime and the machine-code emitter.
//!
//! The runtime never inspects object code: it compiles a module to an
//! opaque byte blob through [`Engine::compile_module`], and later hands the
//! blob back with a [`LoadRequest`] describing everything the generated
//! code needs to bind against: intrinsic entry points, imported function
//! code, table/memory/global bindings, and the per-function mutable data
//! the engine must populate with the allocated
//! [`Function`](crate::function::Function) objects.

use crate::function::{FunctionMutableData, FunctionRef};
use crate::sig_registry::VMSharedSignatureIndex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use wavelet_ir as ir;
use wavelet_types::{FunctionType, GlobalType, UntaggedValue};

/// The machine calling convention of a bound native function.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CallingConvention {
    /// The wasm convention: arguments and results marshalled through the
    /// context scratch area.
    Wasm,
    /// A runtime intrinsic with an ad-hoc C signature.
    Intrinsic,
}

/// A native function the generated code may call by name.
#[derive(Copy, Clone, Debug)]
pub struct IntrinsicFunctionBinding {
    /// The intrinsic's calling convention.
    pub calling_convention: CallingConvention,
    /// The intrinsic's entry address.
    pub native_function: usize,
}

/// The binding of one imported function.
#[derive(Copy, Clone, Debug)]
pub struct FunctionImportBinding {
    /// The imported function's calling convention.
    pub calling_convention: CallingConvention,
    /// The imported function.
    pub function: FunctionRef,
}

/// The binding of one global.
#[derive(Copy, Clone, Debug)]
pub enum GlobalBinding {
    /// A mutable global: generated code indexes the calling context's
    /// mutable-global array.
    Mutable {
        /// The global's type.
        ty: GlobalType,
        /// The slot in every context's mutable-global array.
        index: u32,
    },
    /// An immutable global: the value is a load-time constant.
    Immutable {
        /// The global's type.
        ty: GlobalType,
        /// The cell's value.
        value: UntaggedValue,
    },
}

/// Everything the engine needs to bind a module's object code into a
/// compartment.
pub struct LoadRequest<'a> {
    /// Intrinsic entry points, by name.
    pub intrinsics: &'a HashMap<&'static str, IntrinsicFunctionBinding>,
    /// The module's type section, already interned.
    pub types: &'a [VMSharedSignatureIndex],
    /// The signatures matching `types`.
    pub function_types: &'a [FunctionType],
    /// Bindings for the module's function imports, in declaration order.
    pub function_imports: &'a [FunctionImportBinding],
    /// Compartment IDs of the instance's tables (imports then definitions).
    pub table_ids: &'a [usize],
    /// Compartment IDs of the instance's memories.
    pub memory_ids: &'a [usize],
    /// Bindings for the instance's globals.
    pub globals: &'a [GlobalBinding],
    /// Compartment IDs of the instance's exception types.
    pub exception_type_ids: &'a [usize],
    /// The instance's own ID within its compartment.
    pub module_instance_id: usize,
    /// The address of the out-of-bounds table element sentinel; generated
    /// code adds it to biased table-slot values.
    pub out_of_bounds_element_address: usize,
    /// Mutable data for each function definition, in definition order. The
    /// engine must populate each entry's code info with the allocated
    /// function object.
    pub function_def_mutable_datas: &'a [Arc<FunctionMutableData>],
}

/// A module's object code, loaded and bound. The implementation owns the
/// executable memory and the [`Function`](crate::function::Function)
/// headers it allocated.
pub trait LoadedModule: Send + Sync {
    /// The function objects for the module's definitions, in definition
    /// order.
    fn function_defs(&self) -> &[FunctionRef];

    /// Looks up the function whose code contains `ip`.
    fn function_by_address(&self, ip: usize) -> Option<FunctionRef>;
}

/// The machine-code emitter.
pub trait Engine: Send + Sync {
    /// Compiles a validated module to object code.
    fn compile_module(&self, module: &ir::Module) -> Result<Vec<u8>, CompileError>;

    /// Loads object code with the given bindings.
    fn load_module(
        &self,
        object_code: &[u8],
        request: LoadRequest<'_>,
    ) -> Result<Arc<dyn LoadedModule>, LoadError>;

    /// Looks up a function from any address within its code, across every
    /// module this engine has loaded.
    fn function_by_address(&self, ip: usize) -> Option<FunctionRef>;
}

/// The engine rejected a module during compilation.
#[derive(Error, Debug, Clone)]
#[error("compilation failed: {message}")]
pub struct CompileError {
    /// The engine's diagnostic.
    pub message: String,
}

/// The engine rejected object code during loading.
#[derive(Error, Debug, Clone)]
#[error("loading object code failed: {message}")]
pub struct LoadError {
    /// The engine's diagnostic.
    pub message: String,
}

/// A compiled module: the IR it was compiled from plus the engine's object
/// code, shareable between instantiations.
pub struct Module {
    /// The module IR.
    pub ir: ir::Module,
    /// The engine's object code.
    pub object_code: Vec<u8>,
}

/// Compiles a validated module, pairing the IR with the object code.
pub fn compile_module(
    engine: &dyn Engine,
    module: &ir::Module,
) -> Result<Arc<Module>, CompileError> {
    let object_code = engine.compile_module(module)?;
    tracing::debug!(
        num_function_defs = module.functions.defs.len(),
        object_code_bytes = object_code.len(),
        "compiled module"
    );
    Ok(Arc::new(Module {
        ir: module.clone(),
        object_code,
    }))
}
