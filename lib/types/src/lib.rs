//! This crate contains the types shared by every layer of the Wavelet
//! WebAssembly runtime: value and extern types, function signatures,
//! page-granular units, and the typed/untagged value representations that
//! cross the JIT boundary.

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

mod error;
mod types;
mod units;
mod values;

pub use crate::error::*;
pub use crate::types::*;
pub use crate::units::*;
pub use crate::values::*;

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
