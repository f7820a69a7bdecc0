//! Wavelet: a WebAssembly runtime built around an external JIT engine.
//!
//! This crate is the public facade over the workspace: the module IR and
//! validator ([`ir`]), the text-format lexer ([`wast`]), the runtime
//! substrate ([`vm`]), and the host-side plumbing that ties them together —
//! a [`RootResolver`] that satisfies imports from named instances or
//! generated stubs, and [`runner`] helpers that take a parsed module all
//! the way to its `main` function's exit code.

#![deny(trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

pub use wavelet_ir as ir;
pub use wavelet_nfa as nfa;
pub use wavelet_types as types;
pub use wavelet_vm as vm;
pub use wavelet_wast as wast;

mod resolver;
pub mod runner;

pub use crate::resolver::RootResolver;
pub use crate::runner::{run_module, RunError};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
