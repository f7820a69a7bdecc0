//! Module instances and instantiation.
//!
//! Instantiation is a strict sequence: reserve an instance ID, check the
//! import bindings, create the defined objects, bind the engine's symbol
//! table and load the object code, build the export map, snapshot passive
//! segments, publish the instance, and finally apply the active data and
//! element segments. A failure before publication releases the reserved ID;
//! a segment trap after publication surfaces as an error and rolls the
//! instance back by dropping it.

use crate::compartment::Compartment;
use crate::engine::{
    Engine, FunctionImportBinding, GlobalBinding, LoadError, LoadRequest, LoadedModule, Module,
};
use crate::error::RuntimeError;
use crate::exception::ExceptionType;
use crate::function::{FunctionMutableData, FunctionRef};
use crate::global::Global;
use crate::libcalls;
use crate::linker::LinkResult;
use crate::memory::Memory;
use crate::object::{Extern, ObjectKind};
use crate::sig_registry::SignatureRegistry;
use crate::table::{out_of_bounds_element, Table};
use crate::trap::{Trap, TrapCode};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;
use wavelet_ir as ir;
use wavelet_ir::InitializerExpression;
use wavelet_types::{Bytes, ExternType, Value};

/// Resolved objects for a module's imports, in declaration order per kind.
#[derive(Default)]
pub struct ImportBindings {
    /// Function imports.
    pub functions: Vec<FunctionRef>,
    /// Table imports.
    pub tables: Vec<Arc<Table>>,
    /// Memory imports.
    pub memories: Vec<Arc<Memory>>,
    /// Global imports.
    pub globals: Vec<Arc<Global>>,
    /// Exception-type imports.
    pub exception_types: Vec<Arc<ExceptionType>>,
}

impl From<LinkResult> for ImportBindings {
    fn from(result: LinkResult) -> Self {
        result.resolved_imports
    }
}

/// An instantiated module: its objects (imports followed by definitions),
/// its exports, and its loaded code.
pub struct ModuleInstance {
    kind: ObjectKind,
    compartment: Arc<Compartment>,
    id: usize,
    export_map: IndexMap<String, Extern>,
    functions: Vec<FunctionRef>,
    tables: Vec<Arc<Table>>,
    memories: Vec<Arc<Memory>>,
    globals: Vec<Arc<Global>>,
    exception_types: Vec<Arc<ExceptionType>>,
    start_function: Option<FunctionRef>,
    passive_data_segments: Mutex<HashMap<usize, Arc<Vec<u8>>>>,
    passive_elem_segments: Mutex<HashMap<usize, Arc<Vec<FunctionRef>>>>,
    jit_module: Arc<dyn LoadedModule>,
    debug_name: String,
}

fn evaluate_initializer(
    globals: &[Arc<Global>],
    expression: &InitializerExpression,
) -> Value<FunctionRef> {
    match expression {
        InitializerExpression::I32Const(value) => Value::I32(*value),
        InitializerExpression::I64Const(value) => Value::I64(*value),
        InitializerExpression::F32Const(value) => Value::F32(*value),
        InitializerExpression::F64Const(value) => Value::F64(*value),
        InitializerExpression::V128Const(value) => Value::V128(*value),
        InitializerExpression::GlobalGet(global_index) => {
            // Validation pinned the reference to a previously declared
            // immutable global.
            let global = &globals[*global_index as usize];
            debug_assert!(!global.ty().mutability.is_mutable());
            global.initial_value()
        }
        InitializerExpression::RefNull => Value::FuncRef(None),
    }
}

// Releases a reserved instance ID unless defused by publication.
struct IdReservation<'a> {
    compartment: &'a Arc<Compartment>,
    id: usize,
    published: bool,
}

impl Drop for IdReservation<'_> {
    fn drop(&mut self) {
        if !self.published {
            let mut inner = self.compartment.inner.lock().unwrap();
            inner.instances.remove(self.id);
        }
    }
}

/// Instantiates a compiled module in `compartment` with the given import
/// bindings.
pub fn instantiate_module(
    engine: &dyn Engine,
    compartment: &Arc<Compartment>,
    module: &Arc<Module>,
    imports: ImportBindings,
    debug_name: String,
) -> Result<Arc<ModuleInstance>, RuntimeError> {
    let ir = &module.ir;

    // Reserve an ID so functions can carry their owning instance before the
    // instance itself is published.
    let id = {
        let mut inner = compartment.inner.lock().unwrap();
        inner
            .instances
            .add(Weak::new())
            .ok_or(RuntimeError::IdSpaceExhausted {
                kind: "module instance",
            })?
    };
    let mut reservation = IdReservation {
        compartment,
        id,
        published: false,
    };

    // Check the types and compartments of the import bindings.
    check_import_counts(ir, &imports)?;
    let registry = SignatureRegistry::global();
    for (index, import) in ir.functions.imports.iter().enumerate() {
        let declared = ir.types.get(import.ty as usize).cloned().unwrap_or_default();
        let function = imports.functions[index];
        let header = unsafe { function.as_ref() };
        if header.encoded_type() != registry.register(&declared)
            || !compartment.contains_function(function)
        {
            return Err(incompatible_import(import, ExternType::Function(declared)));
        }
    }
    for (index, import) in ir.tables.imports.iter().enumerate() {
        let object = Extern::Table(imports.tables[index].clone());
        let declared = ExternType::Table(import.ty);
        if !object.is_a(&declared) || !object.is_in_compartment(compartment) {
            return Err(incompatible_import(import, declared));
        }
    }
    for (index, import) in ir.memories.imports.iter().enumerate() {
        let object = Extern::Memory(imports.memories[index].clone());
        let declared = ExternType::Memory(import.ty);
        if !object.is_a(&declared) || !object.is_in_compartment(compartment) {
            return Err(incompatible_import(import, declared));
        }
    }
    for (index, import) in ir.globals.imports.iter().enumerate() {
        let object = Extern::Global(imports.globals[index].clone());
        let declared = ExternType::Global(import.ty);
        if !object.is_a(&declared) || !object.is_in_compartment(compartment) {
            return Err(incompatible_import(import, declared));
        }
    }
    for (index, import) in ir.exception_types.imports.iter().enumerate() {
        let object = Extern::ExceptionType(imports.exception_types[index].clone());
        let declared = ExternType::Exception(import.ty.clone());
        if !object.is_a(&declared) || !object.is_in_compartment(compartment) {
            return Err(incompatible_import(import, declared));
        }
    }

    let mut functions = imports.functions;
    let mut tables = imports.tables;
    let mut memories = imports.memories;
    let mut globals = imports.globals;
    let mut exception_types = imports.exception_types;

    // Instantiate the module's table, memory, global and exception-type
    // definitions.
    for (def_index, def) in ir.tables.defs.iter().enumerate() {
        let table_debug_name = format!("{}!table{}", debug_name, ir.tables.imports.len() + def_index);
        tables.push(Table::new(compartment, def.ty, table_debug_name)?);
    }
    for (def_index, def) in ir.memories.defs.iter().enumerate() {
        let memory_debug_name =
            format!("{}!memory{}", debug_name, ir.memories.imports.len() + def_index);
        memories.push(Memory::new(compartment, def.ty, memory_debug_name)?);
    }
    for def in &ir.globals.defs {
        let initial_value = evaluate_initializer(&globals, &def.initializer);
        globals.push(Global::new(compartment, def.ty, initial_value)?);
    }
    for (def_index, def) in ir.exception_types.defs.iter().enumerate() {
        let exception_debug_name = format!(
            "{}!exception_type{}",
            debug_name,
            ir.exception_types.imports.len() + def_index
        );
        exception_types.push(ExceptionType::new(
            compartment,
            def.sig.clone(),
            exception_debug_name,
        )?);
    }

    // Set up the values to bind to the symbols in the object code.
    let types: Vec<_> = ir.types.iter().map(|ty| registry.register(ty)).collect();
    let function_imports: Vec<_> = functions
        .iter()
        .map(|&function| FunctionImportBinding {
            calling_convention: crate::engine::CallingConvention::Wasm,
            function,
        })
        .collect();
    let table_ids: Vec<_> = tables.iter().map(|table| table.id()).collect();
    let memory_ids: Vec<_> = memories.iter().map(|memory| memory.id()).collect();
    let global_bindings: Vec<_> = globals
        .iter()
        .map(|global| {
            if global.ty().mutability.is_mutable() {
                GlobalBinding::Mutable {
                    ty: global.ty(),
                    index: global.mutable_global_index(),
                }
            } else {
                GlobalBinding::Immutable {
                    ty: global.ty(),
                    value: global.initial_untagged(),
                }
            }
        })
        .collect();
    let exception_type_ids: Vec<_> = exception_types.iter().map(|ty| ty.id()).collect();

    // Create mutable data for each function definition, for the engine to
    // populate with the allocated function objects.
    let function_def_mutable_datas: Vec<_> = (0..ir.functions.defs.len())
        .map(|def_index| {
            FunctionMutableData::new(format!(
                "wasm!{}!<function #{}>",
                debug_name, def_index
            ))
        })
        .collect();

    // Load the compiled module's object code with this instance's bindings.
    let jit_module = engine
        .load_module(
            &module.object_code,
            LoadRequest {
                intrinsics: libcalls::intrinsic_bindings(),
                types: &types,
                function_types: &ir.types,
                function_imports: &function_imports,
                table_ids: &table_ids,
                memory_ids: &memory_ids,
                globals: &global_bindings,
                exception_type_ids: &exception_type_ids,
                module_instance_id: id,
                out_of_bounds_element_address: out_of_bounds_element().address(),
                function_def_mutable_datas: &function_def_mutable_datas,
            },
        )
        .map_err(RuntimeError::Load)?;

    // The engine filled in the mutable datas' function objects; add them to
    // the instance's function sequence.
    for mutable_data in &function_def_mutable_datas {
        let function = mutable_data.function().ok_or_else(|| {
            RuntimeError::Load(LoadError {
                message: format!(
                    "the engine did not populate {}",
                    mutable_data.debug_name()
                ),
            })
        })?;
        functions.push(function);
    }

    // Set up the instance's exports.
    let mut export_map = IndexMap::new();
    for export in &ir.exports {
        let object = match export.kind {
            wavelet_types::ExternKind::Function => {
                Extern::Function(functions[export.index as usize])
            }
            wavelet_types::ExternKind::Table => Extern::Table(tables[export.index as usize].clone()),
            wavelet_types::ExternKind::Memory => {
                Extern::Memory(memories[export.index as usize].clone())
            }
            wavelet_types::ExternKind::Global => {
                Extern::Global(globals[export.index as usize].clone())
            }
            wavelet_types::ExternKind::Exception => {
                Extern::ExceptionType(exception_types[export.index as usize].clone())
            }
        };
        export_map.insert(export.name.clone(), object);
    }

    // Snapshot the module's passive data and element segments for the bulk
    // operators.
    let mut passive_data_segments = HashMap::new();
    for (segment_index, segment) in ir.data_segments.iter().enumerate() {
        if !segment.is_active {
            passive_data_segments.insert(segment_index, Arc::new(segment.data.clone()));
        }
    }
    let mut passive_elem_segments = HashMap::new();
    for (segment_index, segment) in ir.elem_segments.iter().enumerate() {
        if !segment.is_active {
            let objects: Vec<FunctionRef> = segment
                .indices
                .iter()
                .map(|&function_index| functions[function_index as usize])
                .collect();
            passive_elem_segments.insert(segment_index, Arc::new(objects));
        }
    }

    // Look up the module's start function.
    let start_function = ir
        .start_function_index
        .map(|start_index| functions[start_index as usize]);

    let instance = Arc::new(ModuleInstance {
        kind: ObjectKind::ModuleInstance,
        compartment: compartment.clone(),
        id,
        export_map,
        functions,
        tables,
        memories,
        globals,
        exception_types,
        start_function,
        passive_data_segments: Mutex::new(passive_data_segments),
        passive_elem_segments: Mutex::new(passive_elem_segments),
        jit_module,
        debug_name,
    });

    // Publish the instance into the compartment.
    {
        let mut inner = compartment.inner.lock().unwrap();
        inner.instances.set(id, Arc::downgrade(&instance));
    }
    reservation.published = true;
    drop(reservation);

    // Copy the module's active data segments into their designated
    // memories. A trap here surfaces after publication; dropping the
    // instance rolls it back.
    for segment in &ir.data_segments {
        if !segment.is_active {
            continue;
        }
        let memory = &instance.memories[segment.memory_index as usize];
        let base_offset = evaluate_initializer(&instance.globals, &segment.base_offset)
            .i32()
            .expect("validation pinned data segment offsets to i32") as u32;

        if !segment.data.is_empty() {
            let destination =
                memory.validated_range(base_offset as u64, segment.data.len() as u64)?;
            unsafe {
                std::ptr::copy_nonoverlapping(
                    segment.data.as_ptr(),
                    destination.as_ptr(),
                    segment.data.len(),
                );
            }
        } else if u64::from(base_offset) > Bytes::from(memory.num_pages()).0 as u64 {
            // Out-of-bounds errors apply even to empty segments.
            return Err(Trap::with_payload(
                TrapCode::OutOfBoundsMemoryAccess,
                format!(
                    "empty data segment's base offset {:#x} exceeds memory {:?}",
                    base_offset,
                    memory.debug_name()
                ),
                vec![u64::from(base_offset)],
            )
            .into());
        }
    }

    // Copy the module's active element segments into their designated
    // tables.
    for segment in &ir.elem_segments {
        if !segment.is_active {
            continue;
        }
        let table = &instance.tables[segment.table_index as usize];
        let base_offset = evaluate_initializer(&instance.globals, &segment.base_offset)
            .i32()
            .expect("validation pinned elem segment offsets to i32") as u32;

        if !segment.indices.is_empty() {
            for (index, &function_index) in segment.indices.iter().enumerate() {
                let function = instance.functions[function_index as usize];
                table.set(base_offset as usize + index, Some(function))?;
            }
        } else if base_offset as usize > table.num_elements() {
            return Err(Trap::with_payload(
                TrapCode::OutOfBoundsTableAccess,
                format!(
                    "empty elem segment's base offset {} exceeds table {:?}",
                    base_offset,
                    table.debug_name()
                ),
                vec![u64::from(base_offset)],
            )
            .into());
        }
    }

    debug!(
        id,
        debug_name = %instance.debug_name,
        num_functions = instance.functions.len(),
        "instantiated module"
    );
    Ok(instance)
}

fn check_import_counts(ir: &ir::Module, imports: &ImportBindings) -> Result<(), RuntimeError> {
    let checks = [
        ("function", ir.functions.imports.len(), imports.functions.len()),
        ("table", ir.tables.imports.len(), imports.tables.len()),
        ("memory", ir.memories.imports.len(), imports.memories.len()),
        ("global", ir.globals.imports.len(), imports.globals.len()),
        (
            "exception type",
            ir.exception_types.imports.len(),
            imports.exception_types.len(),
        ),
    ];
    for (kind, expected, found) in checks {
        if expected != found {
            return Err(RuntimeError::ImportCountMismatch {
                kind,
                expected,
                found,
            });
        }
    }
    Ok(())
}

fn incompatible_import<Ty>(import: &ir::Import<Ty>, declared: ExternType) -> RuntimeError {
    RuntimeError::IncompatibleImport {
        module_name: import.module_name.clone(),
        export_name: import.export_name.clone(),
        expected: declared.to_string(),
    }
}

impl ModuleInstance {
    /// The object kind tag (always `ObjectKind::ModuleInstance`).
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// The compartment this instance was created in.
    pub fn compartment(&self) -> &Arc<Compartment> {
        &self.compartment
    }

    /// The instance's ID within its compartment.
    pub fn id(&self) -> usize {
        self.id
    }

    /// The instance's debug name.
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    /// The loaded JIT module.
    pub fn jit_module(&self) -> &Arc<dyn LoadedModule> {
        &self.jit_module
    }

    /// The instance's start function, if it declares one.
    pub fn start_function(&self) -> Option<FunctionRef> {
        self.start_function
    }

    /// Looks up an export by name.
    pub fn export(&self, name: &str) -> Option<Extern> {
        self.export_map.get(name).cloned()
    }

    /// The instance's function sequence (imports followed by definitions).
    pub fn functions(&self) -> &[FunctionRef] {
        &self.functions
    }

    /// The instance's default (first) memory, if any.
    pub fn default_memory(&self) -> Option<&Arc<Memory>> {
        self.memories.first()
    }

    /// The instance's default (first) table, if any.
    pub fn default_table(&self) -> Option<&Arc<Table>> {
        self.tables.first()
    }

    /// The passive data segment at `segment_index`, unless dropped.
    pub fn passive_data_segment(&self, segment_index: usize) -> Option<Arc<Vec<u8>>> {
        self.passive_data_segments
            .lock()
            .unwrap()
            .get(&segment_index)
            .cloned()
    }

    /// Drops the passive data segment at `segment_index`, releasing its
    /// snapshot.
    pub fn drop_passive_data_segment(&self, segment_index: usize) {
        self.passive_data_segments
            .lock()
            .unwrap()
            .remove(&segment_index);
    }

    /// The passive element segment at `segment_index`, unless dropped.
    pub fn passive_elem_segment(&self, segment_index: usize) -> Option<Arc<Vec<FunctionRef>>> {
        self.passive_elem_segments
            .lock()
            .unwrap()
            .get(&segment_index)
            .cloned()
    }

    /// Drops the passive element segment at `segment_index`.
    pub fn drop_passive_elem_segment(&self, segment_index: usize) {
        self.passive_elem_segments
            .lock()
            .unwrap()
            .remove(&segment_index);
    }

    /// Clones an instance into a cloned compartment, preserving its ID.
    /// Functions are shared (the clone holds the same loaded JIT module);
    /// every other object reference is remapped to the clone's object with
    /// the same ID.
    pub(crate) fn clone_into(
        source: &Arc<Self>,
        compartment: &Arc<Compartment>,
        id: usize,
    ) -> Result<Arc<Self>, RuntimeError> {
        fn remap<T>(
            map: &crate::id_map::IdMap<Weak<T>>,
            source_id: usize,
        ) -> Result<Arc<T>, RuntimeError> {
            map.get(source_id)
                .and_then(Weak::upgrade)
                .ok_or(RuntimeError::InvalidCompartment)
        }

        // The passive-segment snapshots are copied under the source's
        // locks; data and element maps each go to their own field.
        let passive_data_segments = source.passive_data_segments.lock().unwrap().clone();
        let passive_elem_segments = source.passive_elem_segments.lock().unwrap().clone();

        let (tables, memories, globals, exception_types, export_map) = {
            let inner = compartment.inner.lock().unwrap();

            let tables = source
                .tables
                .iter()
                .map(|table| remap(&inner.tables, table.id()))
                .collect::<Result<Vec<_>, _>>()?;
            let memories = source
                .memories
                .iter()
                .map(|memory| remap(&inner.memories, memory.id()))
                .collect::<Result<Vec<_>, _>>()?;
            let globals = source
                .globals
                .iter()
                .map(|global| remap(&inner.globals, global.id()))
                .collect::<Result<Vec<_>, _>>()?;
            let exception_types = source
                .exception_types
                .iter()
                .map(|exception_type| remap(&inner.exception_types, exception_type.id()))
                .collect::<Result<Vec<_>, _>>()?;

            let mut export_map = IndexMap::new();
            for (name, object) in &source.export_map {
                let remapped = match object {
                    Extern::Function(function) => Extern::Function(*function),
                    Extern::Table(table) => Extern::Table(remap(&inner.tables, table.id())?),
                    Extern::Memory(memory) => Extern::Memory(remap(&inner.memories, memory.id())?),
                    Extern::Global(global) => Extern::Global(remap(&inner.globals, global.id())?),
                    Extern::ExceptionType(exception_type) => Extern::ExceptionType(remap(
                        &inner.exception_types,
                        exception_type.id(),
                    )?),
                };
                export_map.insert(name.clone(), remapped);
            }
            (tables, memories, globals, exception_types, export_map)
        };

        let instance = Arc::new(Self {
            kind: ObjectKind::ModuleInstance,
            compartment: compartment.clone(),
            id,
            export_map,
            functions: source.functions.clone(),
            tables,
            memories,
            globals,
            exception_types,
            start_function: source.start_function,
            passive_data_segments: Mutex::new(passive_data_segments),
            passive_elem_segments: Mutex::new(passive_elem_segments),
            jit_module: source.jit_module.clone(),
            debug_name: source.debug_name.clone(),
        });

        let mut inner = compartment.inner.lock().unwrap();
        inner.instances.insert_at(id, Arc::downgrade(&instance));
        Ok(instance)
    }
}

impl Drop for ModuleInstance {
    fn drop(&mut self) {
        let mut inner = self.compartment.inner.lock().unwrap();
        inner.instances.remove(self.id);
    }
}

impl std::fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("id", &self.id)
            .field("debug_name", &self.debug_name)
            .finish()
    }
}
