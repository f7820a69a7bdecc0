//! Checked invocation of wasm functions from the host.
//!
//! Arguments are marshalled into the calling context's scratch area, the
//! function's thunk is entered with the wasm calling convention, and the
//! declared results are read back from the same area. A trap raised beneath
//! the call unwinds to this boundary and is returned as a typed error.
//!
//! No lock may be held around an invocation: a trap's unwind bypasses every
//! frame between the raise site and [`catch_traps`].

use crate::context::Context;
use crate::error::RuntimeError;
use crate::function::FunctionRef;
use crate::object::{untagged_to_value, value_to_untagged};
use crate::runtime_data::MAX_THUNK_ARG_AND_RETURN_BYTES;
use crate::sig_registry::SignatureRegistry;
use crate::trap::{catch_traps, fatal};
use std::sync::Arc;
use wavelet_types::{UntaggedValue, Value};

/// Invokes `function` on `context` with type-checked arguments, returning
/// its results (or the trap that unwound out of it).
pub fn invoke_function_checked(
    context: &Arc<Context>,
    function: FunctionRef,
    arguments: &[Value<FunctionRef>],
) -> Result<Vec<Value<FunctionRef>>, RuntimeError> {
    if !context.compartment().contains_function(function) {
        return Err(RuntimeError::InvalidCompartment);
    }

    let header = unsafe { function.as_ref() };
    let signature = match SignatureRegistry::global().lookup(header.encoded_type()) {
        Some(signature) => signature,
        None => fatal("invoked a function whose signature was never registered"),
    };

    if arguments.len() != signature.params().len() {
        return Err(RuntimeError::IncorrectType {
            expected: format!("{} argument(s)", signature.params().len()),
            found: format!("{} argument(s)", arguments.len()),
        });
    }
    for (argument, &expected) in arguments.iter().zip(signature.params()) {
        if argument.ty() != expected {
            return Err(RuntimeError::IncorrectType {
                expected: expected.to_string(),
                found: argument.ty().to_string(),
            });
        }
    }

    // Validation bounds signatures to the scratch area; a larger one here
    // is an invariant violation, not an input error.
    let slot_bytes = std::mem::size_of::<UntaggedValue>();
    if signature.params().len() * slot_bytes > MAX_THUNK_ARG_AND_RETURN_BYTES
        || signature.results().len() * slot_bytes > MAX_THUNK_ARG_AND_RETURN_BYTES
    {
        fatal("function signature exceeds the context scratch area");
    }

    let runtime_data = context.runtime_data().as_ptr();
    let scratch = unsafe {
        (*runtime_data).thunk_arg_and_return_data.as_mut_ptr() as *mut UntaggedValue
    };

    // Write the arguments into the scratch area.
    for (index, argument) in arguments.iter().enumerate() {
        unsafe { scratch.add(index).write(value_to_untagged(argument)) };
    }

    // Enter the function through the wasm calling convention, catching any
    // trap at this frame.
    let thunk = header.thunk();
    catch_traps(|| unsafe {
        thunk(
            std::ptr::NonNull::new_unchecked(function.as_ptr() as *mut _),
            runtime_data,
        )
    })?;

    // Read the declared results back out of the scratch area.
    let results = signature
        .results()
        .iter()
        .enumerate()
        .map(|(index, &ty)| unsafe { untagged_to_value(&scratch.add(index).read(), ty) })
        .collect();
    Ok(results)
}
