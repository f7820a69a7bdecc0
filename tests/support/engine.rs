//! A tree-walking [`Engine`] used by the integration tests.
//!
//! "Compilation" stores the IR and returns a token as the object code;
//! loading allocates a [`Function`] header per definition whose thunk is a
//! single evaluator entry point. The evaluator honors the real runtime
//! contracts: arguments and results are marshalled through the context
//! scratch area, indirect calls read the biased table slots out of the
//! compartment runtime data and compare encoded signature indices before
//! calling through, and memory accesses use the validated accessors so the
//! typed traps fire exactly where generated code would fault.

use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, Weak};
use wavelet::ir::{self, BlockType, Operator};
use wavelet::types::UntaggedValue;
use wavelet::vm::{
    self, compartment_runtime_data, fatal, libcalls, memory_from_runtime_data, CompileError,
    ContextRuntimeData, Engine, Function, FunctionCodeInfo, FunctionImportBinding, FunctionRef,
    GlobalBinding, LoadError, LoadRequest, LoadedModule, Trap, TrapCode, VMSharedSignatureIndex,
};

/// A loaded module: the IR plus everything the load request bound.
pub struct InterpModule {
    ir: ir::Module,
    types: Vec<VMSharedSignatureIndex>,
    function_imports: Vec<FunctionImportBinding>,
    table_ids: Vec<usize>,
    memory_ids: Vec<usize>,
    globals: Vec<GlobalBinding>,
    module_instance_id: usize,
    out_of_bounds_element_address: usize,
    functions: Vec<FunctionRef>,
    // Owns the function headers; boxing pins their addresses.
    _function_boxes: Vec<Box<Function>>,
}

unsafe impl Send for InterpModule {}
unsafe impl Sync for InterpModule {}

impl LoadedModule for InterpModule {
    fn function_defs(&self) -> &[FunctionRef] {
        &self.functions
    }

    fn function_by_address(&self, ip: usize) -> Option<FunctionRef> {
        self.functions
            .iter()
            .copied()
            .find(|function| function.address() == ip)
    }
}

// Every loaded module, so the evaluator thunk can find its module from the
// function header address alone (the same role a JIT's global
// address-to-function table plays).
static LOADED_MODULES: Mutex<Vec<Weak<InterpModule>>> = Mutex::new(Vec::new());

fn module_for_function(function: NonNull<Function>) -> Option<(Arc<InterpModule>, usize)> {
    let address = function.as_ptr() as usize;
    let loaded = LOADED_MODULES.lock().unwrap();
    for weak in loaded.iter() {
        if let Some(module) = weak.upgrade() {
            if let Some(index) = module
                .functions
                .iter()
                .position(|candidate| candidate.address() == address)
            {
                return Some((module, index));
            }
        }
    }
    None
}

/// The tree-walking engine.
#[derive(Default)]
pub struct InterpEngine {
    compiled: Mutex<Vec<ir::Module>>,
}

impl InterpEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Engine for InterpEngine {
    fn compile_module(&self, module: &ir::Module) -> Result<Vec<u8>, CompileError> {
        let mut compiled = self.compiled.lock().unwrap();
        compiled.push(module.clone());
        let token = (compiled.len() - 1) as u64;
        Ok(token.to_le_bytes().to_vec())
    }

    fn load_module(
        &self,
        object_code: &[u8],
        request: LoadRequest<'_>,
    ) -> Result<Arc<dyn LoadedModule>, LoadError> {
        let token = u64::from_le_bytes(object_code.try_into().map_err(|_| LoadError {
            message: "malformed object code token".to_string(),
        })?);
        let ir = self
            .compiled
            .lock()
            .unwrap()
            .get(token as usize)
            .cloned()
            .ok_or_else(|| LoadError {
                message: format!("unknown object code token {}", token),
            })?;

        let module = Arc::new_cyclic(|weak: &Weak<InterpModule>| {
            let mut function_boxes = Vec::new();
            let mut functions = Vec::new();
            for (def_index, def) in ir.functions.defs.iter().enumerate() {
                let mutable_data = request.function_def_mutable_datas[def_index].clone();
                let encoded_type = request.types[def.type_index as usize];
                // No machine code exists, so the code pointer stays null;
                // the evaluator identifies functions by their header
                // address.
                let function_box = Function::new(
                    mutable_data.clone(),
                    request.module_instance_id,
                    encoded_type,
                    std::ptr::null(),
                    interp_thunk,
                );
                let function = FunctionRef::new(NonNull::from(&*function_box));

                let mut offset_to_op_index = BTreeMap::new();
                for op_index in 0..def.code.len() as u32 {
                    offset_to_op_index.insert(op_index, op_index);
                }
                let jit_module: Weak<dyn LoadedModule> = weak.clone();
                mutable_data.initialize(FunctionCodeInfo {
                    function,
                    jit_module,
                    num_code_bytes: def.code.len(),
                    offset_to_op_index,
                });

                function_boxes.push(function_box);
                functions.push(function);
            }

            InterpModule {
                ir,
                types: request.types.to_vec(),
                function_imports: request.function_imports.to_vec(),
                table_ids: request.table_ids.to_vec(),
                memory_ids: request.memory_ids.to_vec(),
                globals: request.globals.to_vec(),
                module_instance_id: request.module_instance_id,
                out_of_bounds_element_address: request.out_of_bounds_element_address,
                functions,
                _function_boxes: function_boxes,
            }
        });

        let mut loaded = LOADED_MODULES.lock().unwrap();
        loaded.retain(|weak| weak.strong_count() > 0);
        loaded.push(Arc::downgrade(&module));
        Ok(module)
    }

    fn function_by_address(&self, ip: usize) -> Option<FunctionRef> {
        let loaded = LOADED_MODULES.lock().unwrap();
        loaded
            .iter()
            .filter_map(Weak::upgrade)
            .find_map(|module| module.function_by_address(ip))
    }
}

unsafe extern "C-unwind" fn interp_thunk(
    function: NonNull<Function>,
    context: *mut ContextRuntimeData,
) {
    let (module, def_index) = match module_for_function(function) {
        Some(found) => found,
        None => fatal("evaluator entered a function from an unloaded module"),
    };
    let def = &module.ir.functions.defs[def_index];
    let ty = &module.ir.types[def.type_index as usize];

    let scratch = unsafe { (*context).thunk_arg_and_return_data.as_mut_ptr() as *mut UntaggedValue };
    let mut locals = Vec::with_capacity(ty.params().len() + def.non_parameter_locals.len());
    for index in 0..ty.params().len() {
        locals.push(unsafe { scratch.add(index).read() });
    }
    locals.extend(
        std::iter::repeat(UntaggedValue::zero()).take(def.non_parameter_locals.len()),
    );

    let mut frame = Frame {
        module: &module,
        context,
        locals,
        stack: Vec::new(),
        labels: Vec::new(),
    };

    // The function body behaves as one big block whose label is a return.
    frame.labels.push(Label {
        entry_height: 0,
        arity: ty.results().len(),
        kind: LabelKind::Block,
    });
    let mut pc = 0;
    match frame.eval_ops(&def.code, &mut pc) {
        Outcome::Fallthrough | Outcome::Return => {}
        Outcome::Branch(_) => fatal("branch escaped a validated function body"),
    }

    // Write the results back into the scratch area.
    let num_results = ty.results().len();
    let result_base = frame.stack.len() - num_results;
    for (index, value) in frame.stack[result_base..].iter().enumerate() {
        unsafe { scratch.add(index).write(*value) };
    }
}

enum Outcome {
    Fallthrough,
    Branch(u32),
    Return,
}

#[derive(Copy, Clone, PartialEq)]
enum LabelKind {
    Block,
    Loop,
}

struct Label {
    entry_height: usize,
    arity: usize,
    kind: LabelKind,
}

struct Frame<'m> {
    module: &'m Arc<InterpModule>,
    context: *mut ContextRuntimeData,
    locals: Vec<UntaggedValue>,
    stack: Vec<UntaggedValue>,
    labels: Vec<Label>,
}

impl Frame<'_> {
    fn push(&mut self, value: UntaggedValue) {
        self.stack.push(value);
    }

    fn push_i32(&mut self, value: i32) {
        self.push(UntaggedValue { i32_: value });
    }

    fn push_i64(&mut self, value: i64) {
        self.push(UntaggedValue { i64_: value });
    }

    fn push_f32(&mut self, value: f32) {
        self.push(UntaggedValue { f32_: value });
    }

    fn push_f64(&mut self, value: f64) {
        self.push(UntaggedValue { f64_: value });
    }

    fn pop(&mut self) -> UntaggedValue {
        match self.stack.pop() {
            Some(value) => value,
            None => fatal("evaluator operand stack underflow in validated code"),
        }
    }

    fn pop_i32(&mut self) -> i32 {
        unsafe { self.pop().i32_ }
    }

    fn pop_u32(&mut self) -> u32 {
        unsafe { self.pop().u32_ }
    }

    fn pop_i64(&mut self) -> i64 {
        unsafe { self.pop().i64_ }
    }

    fn pop_f32(&mut self) -> f32 {
        unsafe { self.pop().f32_ }
    }

    fn pop_f64(&mut self) -> f64 {
        unsafe { self.pop().f64_ }
    }

    fn block_arities(&self, block_type: BlockType) -> (usize, usize) {
        match block_type {
            BlockType::Empty => (0, 0),
            BlockType::Value(_) => (0, 1),
            BlockType::Func(type_index) => {
                let ty = &self.module.ir.types[type_index as usize];
                (ty.params().len(), ty.results().len())
            }
        }
    }

    /// Pops the branch args for `depth`, unwinds the stack to the target
    /// label's entry height, and pushes the args back.
    fn unwind_to_label(&mut self, depth: u32) {
        let label = &self.labels[self.labels.len() - 1 - depth as usize];
        let arity = label.arity;
        let entry_height = label.entry_height;
        let args_base = self.stack.len() - arity;
        let args: Vec<UntaggedValue> = self.stack[args_base..].to_vec();
        self.stack.truncate(entry_height);
        self.stack.extend(args);
    }

    fn call(&mut self, callee: FunctionRef) {
        // The wasm calling convention: arguments in the caller's context
        // scratch area, results read back from the same place.
        let header = unsafe { callee.as_ref() };
        let signature = vm::SignatureRegistry::global()
            .lookup(header.encoded_type())
            .unwrap_or_default();
        let scratch = unsafe {
            (*self.context).thunk_arg_and_return_data.as_mut_ptr() as *mut UntaggedValue
        };
        let num_params = signature.params().len();
        let args_base = self.stack.len() - num_params;
        for (index, value) in self.stack[args_base..].iter().enumerate() {
            unsafe { scratch.add(index).write(*value) };
        }
        self.stack.truncate(args_base);

        unsafe {
            header.thunk()(NonNull::new_unchecked(callee.as_ptr() as *mut _), self.context)
        };

        for index in 0..signature.results().len() {
            let value = unsafe { scratch.add(index).read() };
            self.push(value);
        }
    }

    fn call_indirect(&mut self, type_index: u32, table_index: u32) {
        let table_id = self.module.table_ids[table_index as usize];
        let index = self.pop_u32() as usize;

        // The explicit bounds check generated code performs before the
        // biased slot read.
        let table = match unsafe { vm::table_from_runtime_data(self.context, table_id) } {
            Some(table) => table,
            None => fatal("evaluator referenced an unknown table ID"),
        };
        if index >= table.num_elements() {
            Trap::raise(Trap::with_payload(
                TrapCode::OutOfBoundsTableAccess,
                format!("call_indirect index {} out of bounds", index),
                vec![index as u64],
            ));
        }

        // Read the biased slot straight out of the compartment runtime
        // data, the way generated code addresses tables: saturated index,
        // acquire load, then add the sentinel base back.
        let callee = unsafe {
            let compartment_data = compartment_runtime_data(self.context);
            let table_base =
                (*compartment_data).table_bases[table_id] as *const std::sync::atomic::AtomicUsize;
            let slot = &*table_base.add(index.min(table.num_elements() - 1));
            let biased_value = slot.load(std::sync::atomic::Ordering::Acquire);
            let address = biased_value.wrapping_add(self.module.out_of_bounds_element_address);
            FunctionRef::from_address(address)
                .unwrap_or_else(|| fatal("biased table value decoded to null"))
        };

        // The indirect-call type guard: compare the callee's encoded
        // signature with the call site's expected signature id.
        let expected = self.module.types[type_index as usize];
        let header = unsafe { callee.as_ref() };
        if header.encoded_type() != expected {
            unsafe {
                libcalls::wavelet_call_indirect_fail(callee.as_ptr(), expected.as_u32());
            }
        }
        self.call(callee);
    }

    fn memory_access(&mut self, offset: u32, num_bytes: u64) -> *mut u8 {
        let memory_id = self.module.memory_ids[0];
        let memory = match unsafe { memory_from_runtime_data(self.context, memory_id) } {
            Some(memory) => memory,
            None => fatal("evaluator referenced an unknown memory ID"),
        };
        let address = self.pop_u32() as u64 + offset as u64;
        match memory.validated_range(address, num_bytes) {
            Ok(pointer) => pointer.as_ptr(),
            Err(trap) => Trap::raise(trap),
        }
    }

    fn global_slot(&mut self, global_index: u32) -> *mut UntaggedValue {
        match &self.module.globals[global_index as usize] {
            GlobalBinding::Mutable { index, .. } => unsafe {
                (*self.context)
                    .mutable_globals
                    .as_mut_ptr()
                    .add(*index as usize)
            },
            GlobalBinding::Immutable { .. } => {
                fatal("evaluator treated an immutable global as a slot")
            }
        }
    }

    fn skip_to_end(ops: &[Operator], mut pc: usize) -> (Option<usize>, usize) {
        // Finds the `else` (if any) and `end` that close the construct
        // whose body starts at `pc`.
        let mut depth = 0usize;
        let mut else_index = None;
        loop {
            match &ops[pc] {
                Operator::Block { .. }
                | Operator::Loop { .. }
                | Operator::If { .. }
                | Operator::Try { .. } => depth += 1,
                Operator::Else {} if depth == 0 => else_index = Some(pc),
                Operator::End {} => {
                    if depth == 0 {
                        return (else_index, pc);
                    }
                    depth -= 1;
                }
                _ => {}
            }
            pc += 1;
        }
    }

    fn eval_ops(&mut self, ops: &[Operator], pc: &mut usize) -> Outcome {
        loop {
            let op = &ops[*pc];
            *pc += 1;
            match op {
                Operator::End {} => return Outcome::Fallthrough,
                Operator::Else {} => {
                    // Falling out of a taken then-branch: skip the else
                    // branch entirely.
                    let (_, end_index) = Self::skip_to_end(ops, *pc);
                    *pc = end_index + 1;
                    return Outcome::Fallthrough;
                }

                Operator::Nop {} => {}
                Operator::Unreachable {} => unsafe {
                    libcalls::wavelet_raise_trap(TrapCode::UnreachableCodeReached as u32, 0);
                },

                Operator::Block { block_type } => {
                    let (num_params, num_results) = self.block_arities(*block_type);
                    let entry_height = self.stack.len() - num_params;
                    self.labels.push(Label {
                        entry_height,
                        arity: num_results,
                        kind: LabelKind::Block,
                    });
                    let body_start = *pc;
                    match self.eval_ops(ops, pc) {
                        Outcome::Fallthrough => {}
                        Outcome::Branch(0) => {
                            let (_, end_index) = Self::skip_to_end(ops, body_start);
                            *pc = end_index + 1;
                        }
                        Outcome::Branch(depth) => {
                            self.labels.pop();
                            return Outcome::Branch(depth - 1);
                        }
                        Outcome::Return => {
                            self.labels.pop();
                            return Outcome::Return;
                        }
                    }
                    self.labels.pop();
                }
                Operator::Loop { block_type } => {
                    let (num_params, _) = self.block_arities(*block_type);
                    let entry_height = self.stack.len() - num_params;
                    // A branch to a loop's label re-enters it with the
                    // loop's parameters.
                    self.labels.push(Label {
                        entry_height,
                        arity: num_params,
                        kind: LabelKind::Loop,
                    });
                    let body_start = *pc;
                    loop {
                        match self.eval_ops(ops, pc) {
                            Outcome::Fallthrough => break,
                            Outcome::Branch(0) => {
                                *pc = body_start;
                            }
                            Outcome::Branch(depth) => {
                                self.labels.pop();
                                return Outcome::Branch(depth - 1);
                            }
                            Outcome::Return => {
                                self.labels.pop();
                                return Outcome::Return;
                            }
                        }
                    }
                    self.labels.pop();
                }
                Operator::If { block_type } => {
                    let condition = self.pop_i32();
                    let (num_params, num_results) = self.block_arities(*block_type);
                    let entry_height = self.stack.len() - num_params;
                    let (else_index, end_index) = Self::skip_to_end(ops, *pc);
                    self.labels.push(Label {
                        entry_height,
                        arity: num_results,
                        kind: LabelKind::Block,
                    });
                    if condition == 0 {
                        match else_index {
                            Some(else_index) => *pc = else_index + 1,
                            None => {
                                self.labels.pop();
                                *pc = end_index + 1;
                                continue;
                            }
                        }
                    }
                    match self.eval_ops(ops, pc) {
                        Outcome::Fallthrough => {}
                        Outcome::Branch(0) => *pc = end_index + 1,
                        Outcome::Branch(depth) => {
                            self.labels.pop();
                            return Outcome::Branch(depth - 1);
                        }
                        Outcome::Return => {
                            self.labels.pop();
                            return Outcome::Return;
                        }
                    }
                    self.labels.pop();
                }

                Operator::Br { depth } => {
                    self.unwind_to_label(*depth);
                    return Outcome::Branch(*depth);
                }
                Operator::BrIf { depth } => {
                    if self.pop_i32() != 0 {
                        self.unwind_to_label(*depth);
                        return Outcome::Branch(*depth);
                    }
                }
                Operator::BrTable { targets, default } => {
                    let index = self.pop_u32() as usize;
                    let depth = targets.get(index).copied().unwrap_or(*default);
                    self.unwind_to_label(depth);
                    return Outcome::Branch(depth);
                }
                Operator::Return {} => {
                    let function_label_depth = (self.labels.len() - 1) as u32;
                    self.unwind_to_label(function_label_depth);
                    return Outcome::Return;
                }

                Operator::Call { function_index } => {
                    let num_imports = self.module.function_imports.len();
                    let callee = if (*function_index as usize) < num_imports {
                        self.module.function_imports[*function_index as usize].function
                    } else {
                        self.module.functions[*function_index as usize - num_imports]
                    };
                    self.call(callee);
                }
                Operator::CallIndirect {
                    type_index,
                    table_index,
                } => self.call_indirect(*type_index, *table_index),

                Operator::Drop {} => {
                    self.pop();
                }
                Operator::Select {} => {
                    let condition = self.pop_i32();
                    let second = self.pop();
                    let first = self.pop();
                    self.push(if condition != 0 { first } else { second });
                }

                Operator::LocalGet { local_index } => {
                    let value = self.locals[*local_index as usize];
                    self.push(value);
                }
                Operator::LocalSet { local_index } => {
                    self.locals[*local_index as usize] = self.pop();
                }
                Operator::LocalTee { local_index } => {
                    let value = *self.stack.last().unwrap();
                    self.locals[*local_index as usize] = value;
                }
                Operator::GlobalGet { global_index } => {
                    match &self.module.globals[*global_index as usize] {
                        GlobalBinding::Immutable { value, .. } => self.push(*value),
                        GlobalBinding::Mutable { .. } => {
                            let slot = self.global_slot(*global_index);
                            self.push(unsafe { slot.read() });
                        }
                    }
                }
                Operator::GlobalSet { global_index } => {
                    let value = self.pop();
                    let slot = self.global_slot(*global_index);
                    unsafe { slot.write(value) };
                }

                Operator::I32Load { offset, .. } => {
                    let pointer = self.memory_access(*offset, 4);
                    let value = unsafe { (pointer as *const i32).read_unaligned() };
                    self.push_i32(value);
                }
                Operator::I64Load { offset, .. } => {
                    let pointer = self.memory_access(*offset, 8);
                    let value = unsafe { (pointer as *const i64).read_unaligned() };
                    self.push_i64(value);
                }
                Operator::I32Load8U { offset, .. } => {
                    let pointer = self.memory_access(*offset, 1);
                    let value = unsafe { pointer.read() };
                    self.push_i32(value as i32);
                }
                Operator::I32Store { offset, .. } => {
                    let value = self.pop_i32();
                    let pointer = self.memory_access(*offset, 4);
                    unsafe { (pointer as *mut i32).write_unaligned(value) };
                }
                Operator::I64Store { offset, .. } => {
                    let value = self.pop_i64();
                    let pointer = self.memory_access(*offset, 8);
                    unsafe { (pointer as *mut i64).write_unaligned(value) };
                }
                Operator::I32Store8 { offset, .. } => {
                    let value = self.pop_i32();
                    let pointer = self.memory_access(*offset, 1);
                    unsafe { pointer.write(value as u8) };
                }
                Operator::MemorySize { memory_index } => {
                    let memory_id = self.module.memory_ids[*memory_index as usize];
                    let pages =
                        unsafe { libcalls::wavelet_memory_size(self.context, memory_id) };
                    self.push_i32(pages as i32);
                }
                Operator::MemoryGrow { memory_index } => {
                    let memory_id = self.module.memory_ids[*memory_index as usize];
                    let delta = self.pop_u32();
                    let previous =
                        unsafe { libcalls::wavelet_memory_grow(self.context, delta, memory_id) };
                    self.push_i32(previous);
                }

                Operator::I32Const { value } => self.push_i32(*value),
                Operator::I64Const { value } => self.push_i64(*value),
                Operator::F32Const { value } => self.push_f32(*value),
                Operator::F64Const { value } => self.push_f64(*value),

                Operator::I32Eqz {} => {
                    let value = self.pop_i32();
                    self.push_i32((value == 0) as i32);
                }
                Operator::I32Eq {} => {
                    let (b, a) = (self.pop_i32(), self.pop_i32());
                    self.push_i32((a == b) as i32);
                }
                Operator::I32Ne {} => {
                    let (b, a) = (self.pop_i32(), self.pop_i32());
                    self.push_i32((a != b) as i32);
                }
                Operator::I32LtS {} => {
                    let (b, a) = (self.pop_i32(), self.pop_i32());
                    self.push_i32((a < b) as i32);
                }
                Operator::I32LtU {} => {
                    let (b, a) = (self.pop_u32(), self.pop_u32());
                    self.push_i32((a < b) as i32);
                }
                Operator::I32GtS {} => {
                    let (b, a) = (self.pop_i32(), self.pop_i32());
                    self.push_i32((a > b) as i32);
                }
                Operator::I32GeU {} => {
                    let (b, a) = (self.pop_u32(), self.pop_u32());
                    self.push_i32((a >= b) as i32);
                }
                Operator::I32Add {} => {
                    let (b, a) = (self.pop_i32(), self.pop_i32());
                    self.push_i32(a.wrapping_add(b));
                }
                Operator::I32Sub {} => {
                    let (b, a) = (self.pop_i32(), self.pop_i32());
                    self.push_i32(a.wrapping_sub(b));
                }
                Operator::I32Mul {} => {
                    let (b, a) = (self.pop_i32(), self.pop_i32());
                    self.push_i32(a.wrapping_mul(b));
                }
                Operator::I32DivS {} => {
                    let (b, a) = (self.pop_i32(), self.pop_i32());
                    if b == 0 {
                        unsafe {
                            libcalls::wavelet_raise_trap(
                                TrapCode::IntegerDivideByZero as u32,
                                0,
                            )
                        };
                    }
                    match a.checked_div(b) {
                        Some(quotient) => self.push_i32(quotient),
                        None => unsafe {
                            libcalls::wavelet_raise_trap(TrapCode::IntegerOverflow as u32, 0)
                        },
                    }
                }
                Operator::I32DivU {} => {
                    let (b, a) = (self.pop_u32(), self.pop_u32());
                    if b == 0 {
                        unsafe {
                            libcalls::wavelet_raise_trap(
                                TrapCode::IntegerDivideByZero as u32,
                                0,
                            )
                        };
                    }
                    self.push_i32((a / b) as i32);
                }
                Operator::I32And {} => {
                    let (b, a) = (self.pop_i32(), self.pop_i32());
                    self.push_i32(a & b);
                }
                Operator::I32Or {} => {
                    let (b, a) = (self.pop_i32(), self.pop_i32());
                    self.push_i32(a | b);
                }
                Operator::I32Xor {} => {
                    let (b, a) = (self.pop_i32(), self.pop_i32());
                    self.push_i32(a ^ b);
                }
                Operator::I64Add {} => {
                    let (b, a) = (self.pop_i64(), self.pop_i64());
                    self.push_i64(a.wrapping_add(b));
                }
                Operator::I64Sub {} => {
                    let (b, a) = (self.pop_i64(), self.pop_i64());
                    self.push_i64(a.wrapping_sub(b));
                }
                Operator::I64Mul {} => {
                    let (b, a) = (self.pop_i64(), self.pop_i64());
                    self.push_i64(a.wrapping_mul(b));
                }
                Operator::F32Add {} => {
                    let (b, a) = (self.pop_f32(), self.pop_f32());
                    self.push_f32(a + b);
                }
                Operator::F64Add {} => {
                    let (b, a) = (self.pop_f64(), self.pop_f64());
                    self.push_f64(a + b);
                }
                Operator::F64Mul {} => {
                    let (b, a) = (self.pop_f64(), self.pop_f64());
                    self.push_f64(a * b);
                }
                Operator::I64ExtendI32U {} => {
                    let value = self.pop_u32();
                    self.push_i64(value as i64);
                }
                Operator::I32WrapI64 {} => {
                    let value = self.pop_i64();
                    self.push_i32(value as i32);
                }

                other => fatal(&format!(
                    "the test evaluator does not implement {}",
                    other.mnemonic()
                )),
            }
        }
    }
}
