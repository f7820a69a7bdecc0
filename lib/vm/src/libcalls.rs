//! Runtime intrinsics.
//!
//! These are the native entry points generated code calls by name: memory
//! and table operations that need the runtime's bookkeeping, the bulk
//! segment operators, and the trap raisers. The engine receives the name →
//! binding map in its [`LoadRequest`](crate::engine::LoadRequest) and
//! patches call sites during load.
//!
//! Every intrinsic is `extern "C-unwind"`: a raised trap unwinds through
//! the generated frames to the invocation boundary.

use crate::compartment::{
    memory_from_runtime_data, module_instance_from_runtime_data, table_from_runtime_data,
};
use crate::engine::{CallingConvention, IntrinsicFunctionBinding};
use crate::function::Function;
use crate::runtime_data::ContextRuntimeData;
use crate::table::uninitialized_element;
use crate::trap::{fatal, Trap, TrapCode};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use wavelet_types::Pages;

/// Raises the trap identified by `code_id` with a one-element payload.
///
/// # Safety
/// Must be called from within a [`catch_traps`](crate::trap::catch_traps)
/// extent.
pub unsafe extern "C-unwind" fn wavelet_raise_trap(code_id: u32, argument: u64) -> ! {
    let code = match TrapCode::from_id(code_id) {
        Some(code) => code,
        None => fatal("generated code raised a trap with an unknown type ID"),
    };
    Trap::raise(Trap::with_payload(
        code,
        code.message().to_string(),
        vec![argument],
    ));
}

/// Raises the indirect-call signature-mismatch trap.
///
/// # Safety
/// As [`wavelet_raise_trap`]; `function` may be any table element,
/// including the sentinels.
pub unsafe extern "C-unwind" fn wavelet_call_indirect_fail(
    function: *const Function,
    expected_type_id: u32,
) -> ! {
    // An uninitialized element takes this path too: the sentinel's encoded
    // type never matches a call site's expected type.
    let callee = if function == uninitialized_element().as_ptr() {
        "uninitialized table element".to_string()
    } else {
        format!("{:p}", function)
    };
    Trap::raise(Trap::with_payload(
        TrapCode::IndirectCallSignatureMismatch,
        format!(
            "{} does not match the call site's signature id {}",
            callee, expected_type_id
        ),
        vec![function as u64, expected_type_id as u64],
    ));
}

/// `memory.grow`: returns the previous page count, or -1 on failure.
///
/// # Safety
/// `context` must be a live context's runtime data in the compartment that
/// owns memory `memory_id`.
pub unsafe extern "C-unwind" fn wavelet_memory_grow(
    context: *mut ContextRuntimeData,
    delta: u32,
    memory_id: usize,
) -> i32 {
    let memory = match memory_from_runtime_data(context, memory_id) {
        Some(memory) => memory,
        None => fatal("generated code referenced an unknown memory ID"),
    };
    match memory.grow(Pages(delta)) {
        Ok(previous) => previous.0 as i32,
        Err(_) => -1,
    }
}

/// `memory.size`: the current page count.
///
/// # Safety
/// As [`wavelet_memory_grow`].
pub unsafe extern "C-unwind" fn wavelet_memory_size(
    context: *mut ContextRuntimeData,
    memory_id: usize,
) -> u32 {
    let memory = match memory_from_runtime_data(context, memory_id) {
        Some(memory) => memory,
        None => fatal("generated code referenced an unknown memory ID"),
    };
    memory.num_pages().0
}

/// `table.get`: the element at `index`, or null for an uninitialized slot.
/// Raises the out-of-bounds table trap for an index beyond the table.
///
/// # Safety
/// As [`wavelet_memory_grow`], for table `table_id`.
pub unsafe extern "C-unwind" fn wavelet_table_get(
    context: *mut ContextRuntimeData,
    index: u32,
    table_id: usize,
) -> *const Function {
    let table = match table_from_runtime_data(context, table_id) {
        Some(table) => table,
        None => fatal("generated code referenced an unknown table ID"),
    };
    if index as usize >= table.num_elements() {
        Trap::raise(Trap::with_payload(
            TrapCode::OutOfBoundsTableAccess,
            format!("table.get index {} out of bounds", index),
            vec![index as u64],
        ));
    }
    match table.get(index as usize) {
        Some(function) => function.as_ptr(),
        None => std::ptr::null(),
    }
}

/// `table.set`. Raises the out-of-bounds table trap for an index beyond
/// the table.
///
/// # Safety
/// As [`wavelet_table_get`]; `value` must be null or a function in the
/// table's compartment.
pub unsafe extern "C-unwind" fn wavelet_table_set(
    context: *mut ContextRuntimeData,
    index: u32,
    value: *const Function,
    table_id: usize,
) {
    let table = match table_from_runtime_data(context, table_id) {
        Some(table) => table,
        None => fatal("generated code referenced an unknown table ID"),
    };
    let new_value = crate::function::FunctionRef::from_address(value as usize);
    match table.set(index as usize, new_value) {
        Ok(_) => {}
        Err(trap) => Trap::raise(trap),
    }
}

/// `memory.init`: copies from a passive data segment into a memory.
///
/// # Safety
/// As [`wavelet_memory_grow`], for instance `module_instance_id`.
pub unsafe extern "C-unwind" fn wavelet_memory_init(
    context: *mut ContextRuntimeData,
    dest_offset: u32,
    source_offset: u32,
    num_bytes: u32,
    module_instance_id: usize,
    memory_id: usize,
    segment_index: usize,
) {
    let instance = match module_instance_from_runtime_data(context, module_instance_id) {
        Some(instance) => instance,
        None => fatal("generated code referenced an unknown module instance ID"),
    };
    // Copy out the segment snapshot before touching the memory: a trap must
    // not unwind while any lock is held.
    let segment = instance.passive_data_segment(segment_index);
    let memory = match memory_from_runtime_data(context, memory_id) {
        Some(memory) => memory,
        None => fatal("generated code referenced an unknown memory ID"),
    };

    let segment = match segment {
        Some(segment) => segment,
        None => Trap::raise(Trap::new(
            TrapCode::OutOfBoundsMemoryAccess,
            format!("memory.init references dropped data segment {}", segment_index),
        )),
    };
    let source_end = source_offset as u64 + num_bytes as u64;
    if source_end > segment.len() as u64 {
        Trap::raise(Trap::with_payload(
            TrapCode::OutOfBoundsMemoryAccess,
            format!(
                "memory.init reads {}..{} of a {}-byte data segment",
                source_offset,
                source_end,
                segment.len()
            ),
            vec![source_end],
        ));
    }
    let destination = match memory.validated_range(dest_offset as u64, num_bytes as u64) {
        Ok(destination) => destination,
        Err(trap) => Trap::raise(trap),
    };
    std::ptr::copy_nonoverlapping(
        segment.as_ptr().add(source_offset as usize),
        destination.as_ptr(),
        num_bytes as usize,
    );
}

/// `data.drop`: releases a passive data segment's snapshot.
///
/// # Safety
/// As [`wavelet_memory_init`].
pub unsafe extern "C-unwind" fn wavelet_data_drop(
    context: *mut ContextRuntimeData,
    module_instance_id: usize,
    segment_index: usize,
) {
    let instance = match module_instance_from_runtime_data(context, module_instance_id) {
        Some(instance) => instance,
        None => fatal("generated code referenced an unknown module instance ID"),
    };
    instance.drop_passive_data_segment(segment_index);
}

/// `memory.copy` with memmove semantics: the ranges may overlap.
///
/// # Safety
/// As [`wavelet_memory_grow`], for both memory IDs.
pub unsafe extern "C-unwind" fn wavelet_memory_copy(
    context: *mut ContextRuntimeData,
    dest_offset: u32,
    source_offset: u32,
    num_bytes: u32,
    dest_memory_id: usize,
    source_memory_id: usize,
) {
    let dest_memory = match memory_from_runtime_data(context, dest_memory_id) {
        Some(memory) => memory,
        None => fatal("generated code referenced an unknown memory ID"),
    };
    let source_memory = match memory_from_runtime_data(context, source_memory_id) {
        Some(memory) => memory,
        None => fatal("generated code referenced an unknown memory ID"),
    };
    let source = match source_memory.validated_range(source_offset as u64, num_bytes as u64) {
        Ok(source) => source,
        Err(trap) => Trap::raise(trap),
    };
    let destination = match dest_memory.validated_range(dest_offset as u64, num_bytes as u64) {
        Ok(destination) => destination,
        Err(trap) => Trap::raise(trap),
    };
    std::ptr::copy(source.as_ptr(), destination.as_ptr(), num_bytes as usize);
}

/// `memory.fill`.
///
/// # Safety
/// As [`wavelet_memory_grow`].
pub unsafe extern "C-unwind" fn wavelet_memory_fill(
    context: *mut ContextRuntimeData,
    dest_offset: u32,
    value: u32,
    num_bytes: u32,
    memory_id: usize,
) {
    let memory = match memory_from_runtime_data(context, memory_id) {
        Some(memory) => memory,
        None => fatal("generated code referenced an unknown memory ID"),
    };
    let destination = match memory.validated_range(dest_offset as u64, num_bytes as u64) {
        Ok(destination) => destination,
        Err(trap) => Trap::raise(trap),
    };
    std::ptr::write_bytes(destination.as_ptr(), value as u8, num_bytes as usize);
}

/// `throw`: raises a user exception carrying its payload tuple.
///
/// # Safety
/// As [`wavelet_memory_grow`]; `arguments` must point to at least the
/// exception type's payload arity of untagged values.
pub unsafe extern "C-unwind" fn wavelet_throw(
    context: *mut ContextRuntimeData,
    exception_type_id: usize,
    arguments: *const u64,
    num_arguments: usize,
) -> ! {
    let compartment = crate::compartment::compartment_from_context_runtime_data(context);
    let debug_name = {
        let inner = compartment.inner.lock().unwrap();
        inner
            .exception_types
            .get(exception_type_id)
            .and_then(std::sync::Weak::upgrade)
            .map(|ty| ty.debug_name().to_string())
    };
    let debug_name = match debug_name {
        Some(debug_name) => debug_name,
        None => fatal("generated code threw an unknown exception type"),
    };
    let payload = std::slice::from_raw_parts(arguments, num_arguments).to_vec();
    Trap::raise(Trap::with_payload(
        TrapCode::UserException,
        format!("uncaught {}", debug_name),
        payload,
    ));
}

static INTRINSICS: Lazy<HashMap<&'static str, IntrinsicFunctionBinding>> = Lazy::new(|| {
    fn binding(native_function: usize) -> IntrinsicFunctionBinding {
        IntrinsicFunctionBinding {
            calling_convention: CallingConvention::Intrinsic,
            native_function,
        }
    }
    let mut map = HashMap::new();
    map.insert("trap.raise", binding(wavelet_raise_trap as usize));
    map.insert(
        "call_indirect.fail",
        binding(wavelet_call_indirect_fail as usize),
    );
    map.insert("memory.grow", binding(wavelet_memory_grow as usize));
    map.insert("memory.size", binding(wavelet_memory_size as usize));
    map.insert("table.get", binding(wavelet_table_get as usize));
    map.insert("table.set", binding(wavelet_table_set as usize));
    map.insert("memory.init", binding(wavelet_memory_init as usize));
    map.insert("data.drop", binding(wavelet_data_drop as usize));
    map.insert("memory.copy", binding(wavelet_memory_copy as usize));
    map.insert("memory.fill", binding(wavelet_memory_fill as usize));
    map.insert("throw", binding(wavelet_throw as usize));
    map
});

/// The name → binding map handed to the engine with every load request.
pub fn intrinsic_bindings() -> &'static HashMap<&'static str, IntrinsicFunctionBinding> {
    &INTRINSICS
}
