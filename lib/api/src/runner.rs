//! Host-side run plumbing: take a module from text (or already-parsed IR)
//! through validation, compilation, linking and instantiation, invoke the
//! start function and then `main` (or `_main`), and surface the i32 result
//! as an exit code.

use crate::resolver::RootResolver;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use wavelet_ir as ir;
use wavelet_ir::validate::{validate_module, ValidationError};
use wavelet_vm::{
    instantiate_module, invoke_function_checked, link_module, Compartment, CompileError, Context,
    Engine, Extern, MissingImport, RuntimeError,
};
use wavelet_types::Value;
use wavelet_wast::ParseError;

/// Everything that can go wrong between a module and its exit code.
#[derive(Error, Debug)]
pub enum RunError {
    /// Reading the module file failed.
    #[error("couldn't read {path}: {source}")]
    Io {
        /// The path that failed to load.
        path: String,
        /// The underlying error.
        source: std::io::Error,
    },

    /// The text parser rejected the input.
    #[error("error parsing WebAssembly text: {}", format_parse_errors(.0))]
    Parse(Vec<ParseError>),

    /// The validator rejected the module.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The engine rejected the module.
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// Some imports could not be resolved.
    #[error("failed to link module: {} missing import(s)", .0.len())]
    Link(Vec<MissingImport>),

    /// Instantiation or invocation failed.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// The module exports no `main` or `_main` function.
    #[error("module does not export a main function")]
    NoMainFunction,

    /// The exported main function takes parameters this host cannot supply.
    #[error("main function requires {0} argument(s), but none can be passed")]
    MainFunctionArguments(usize),
}

fn format_parse_errors(errors: &[ParseError]) -> String {
    errors
        .iter()
        .map(|error| error.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// The text-format parser collaborator: consumes bytes, returns a module
/// or the parse errors.
pub trait ModuleParser {
    /// Parses WebAssembly text into a module.
    fn parse_text(&self, bytes: &[u8]) -> Result<ir::Module, Vec<ParseError>>;
}

/// Validates, compiles, links, instantiates and runs a module: the start
/// function first, then `main` or `_main`. The exit code is `main`'s i32
/// result, or 0 if it returns nothing.
pub fn run_module(
    engine: &dyn Engine,
    module: &ir::Module,
    debug_name: &str,
) -> Result<i32, RunError> {
    validate_module(module)?;
    let compiled = wavelet_vm::compile_module(engine, module)?;

    let compartment = Compartment::new()?;
    let context = Context::new(&compartment)?;

    let mut resolver = RootResolver::new(engine, compartment.clone());
    let link_result = link_module(module, &mut resolver);
    if !link_result.success {
        return Err(RunError::Link(link_result.missing_imports));
    }

    let instance = instantiate_module(
        engine,
        &compartment,
        &compiled,
        link_result.resolved_imports,
        debug_name.to_string(),
    )?;

    if let Some(start_function) = instance.start_function() {
        invoke_function_checked(&context, start_function, &[])?;
    }

    let main_function = match instance.export("main").or_else(|| instance.export("_main")) {
        Some(Extern::Function(function)) => function,
        _ => return Err(RunError::NoMainFunction),
    };

    let signature = Extern::Function(main_function).ty();
    if let wavelet_types::ExternType::Function(ty) = &signature {
        if !ty.params().is_empty() {
            return Err(RunError::MainFunctionArguments(ty.params().len()));
        }
    }

    let results = invoke_function_checked(&context, main_function, &[])?;
    info!(debug_name, num_results = results.len(), "module main returned");
    match results.first() {
        Some(Value::I32(exit_code)) => Ok(*exit_code),
        _ => Ok(0),
    }
}

/// Loads a file, parses it as WebAssembly text, and runs it.
pub fn load_and_run(
    engine: &dyn Engine,
    parser: &dyn ModuleParser,
    path: &Path,
) -> Result<i32, RunError> {
    let bytes = std::fs::read(path).map_err(|source| RunError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let module = parser.parse_text(&bytes).map_err(RunError::Parse)?;
    let debug_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "module".to_string());
    run_module(engine, &module, &debug_name)
}

/// Keeps the compartment and context of a finished run alive for callers
/// that want to poke at the instance afterwards.
pub struct Instantiation {
    /// The compartment everything was created in.
    pub compartment: Arc<Compartment>,
    /// The context the run executes on.
    pub context: Arc<Context>,
    /// The instantiated module.
    pub instance: Arc<wavelet_vm::ModuleInstance>,
    /// Stub instances and objects generated for unresolved imports; the
    /// instance's imported functions point into these.
    pub stubs: (Vec<Arc<wavelet_vm::ModuleInstance>>, Vec<Extern>),
}

impl std::fmt::Debug for Instantiation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instantiation").finish_non_exhaustive()
    }
}

/// Validates, compiles, links and instantiates a module without invoking
/// anything, returning the live pieces.
pub fn instantiate(
    engine: &dyn Engine,
    module: &ir::Module,
    debug_name: &str,
) -> Result<Instantiation, RunError> {
    validate_module(module)?;
    let compiled = wavelet_vm::compile_module(engine, module)?;
    let compartment = Compartment::new()?;
    let context = Context::new(&compartment)?;

    let mut resolver = RootResolver::new(engine, compartment.clone());
    let link_result = link_module(module, &mut resolver);
    if !link_result.success {
        return Err(RunError::Link(link_result.missing_imports));
    }

    let instance = instantiate_module(
        engine,
        &compartment,
        &compiled,
        link_result.resolved_imports,
        debug_name.to_string(),
    )?;
    Ok(Instantiation {
        compartment,
        context,
        instance,
        stubs: resolver.into_stubs(),
    })
}
