//! The Wavelet module IR: the operator set produced by the text parser, the
//! module structure handed to the validator and the JIT, and the validator
//! itself.
//!
//! The parser and the machine-code emitter are external collaborators; this
//! crate is the contract between them. A module is valid when
//! [`validate_module`](validate::validate_module) succeeds, which runs the
//! pre-code section passes, per-function code validation, and the deferred
//! post-code pass in the order the binary format forces on a streaming
//! consumer.

#![deny(trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

pub mod module;
pub mod operators;
pub mod validate;

pub use crate::module::*;
pub use crate::operators::{BlockType, Operator};

/// The number of values the runtime can marshal into or out of a single
/// call: its per-context scratch area holds this many 16-byte value slots.
/// Function signatures beyond this bound fail validation.
pub const MAX_CALL_VALUES: usize = 16;
