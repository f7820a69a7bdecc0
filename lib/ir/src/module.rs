//! The module structure produced by the parser and consumed by the
//! validator, the JIT, and instantiation.

use crate::operators::Operator;
use wavelet_types::{
    ExceptionSig, ExternKind, FunctionType, GlobalType, MemoryType, TableType, Type,
};

/// A single import declaration: where the binding comes from and the type it
/// must satisfy.
#[derive(Clone, Debug, PartialEq)]
pub struct Import<Ty> {
    /// The name of the module the import is resolved in.
    pub module_name: String,
    /// The name of the export within that module.
    pub export_name: String,
    /// The declared type of the import.
    pub ty: Ty,
}

/// An ordered sequence of imports followed by definitions, indexed together:
/// index `i < imports.len()` names an import, the rest name definitions.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexSpace<Def, Ty> {
    /// Imported entries, in declaration order.
    pub imports: Vec<Import<Ty>>,
    /// Defined entries, in declaration order.
    pub defs: Vec<Def>,
}

impl<Def, Ty> Default for IndexSpace<Def, Ty> {
    fn default() -> Self {
        IndexSpace {
            imports: Vec::new(),
            defs: Vec::new(),
        }
    }
}

impl<Def, Ty> IndexSpace<Def, Ty> {
    /// The total number of entries (imports plus definitions).
    pub fn size(&self) -> usize {
        self.imports.len() + self.defs.len()
    }
}

/// A function definition: its signature by type index, its extra locals, and
/// its body as a decoded operator sequence.
#[derive(Clone, Debug, PartialEq)]
pub struct FunctionDef {
    /// Index into [`Module::types`].
    pub type_index: u32,
    /// Locals beyond the parameters.
    pub non_parameter_locals: Vec<Type>,
    /// The body. Validation requires it to end with an `end` operator.
    pub code: Vec<Operator>,
}

/// A table definition.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TableDef {
    /// The table's type.
    pub ty: TableType,
}

/// A memory definition.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct MemoryDef {
    /// The memory's type.
    pub ty: MemoryType,
}

/// A global definition.
#[derive(Clone, Debug, PartialEq)]
pub struct GlobalDef {
    /// The global's type.
    pub ty: GlobalType,
    /// The expression producing the global's initial value.
    pub initializer: InitializerExpression,
}

/// An exception type definition.
#[derive(Clone, Debug, PartialEq)]
pub struct ExceptionTypeDef {
    /// The payload signature.
    pub sig: ExceptionSig,
}

/// A constant expression used to initialize globals and segment base
/// offsets: a literal, a read of a previously declared immutable global, or
/// a null reference.
#[derive(Clone, Debug, PartialEq)]
pub enum InitializerExpression {
    /// An `i32.const`.
    I32Const(i32),
    /// An `i64.const`.
    I64Const(i64),
    /// An `f32.const`.
    F32Const(f32),
    /// An `f64.const`.
    F64Const(f64),
    /// A `v128.const`.
    V128Const(u128),
    /// A `global.get` of an immutable global declared before this point.
    GlobalGet(u32),
    /// A `ref.null`.
    RefNull,
}

/// A single export declaration.
#[derive(Clone, Debug, PartialEq)]
pub struct Export {
    /// The exported name.
    pub name: String,
    /// Which index space the export lives in.
    pub kind: ExternKind,
    /// The index of the exported entry within that space.
    pub index: u32,
}

/// A data segment. Active segments are applied during instantiation;
/// passive segments are snapshotted for `memory.init`.
#[derive(Clone, Debug, PartialEq)]
pub struct DataSegment {
    /// Whether this segment is applied at instantiation time.
    pub is_active: bool,
    /// The memory the segment applies to (active segments only).
    pub memory_index: u32,
    /// The base offset expression (active segments only).
    pub base_offset: InitializerExpression,
    /// The segment's bytes.
    pub data: Vec<u8>,
}

/// An element segment, by function index.
#[derive(Clone, Debug, PartialEq)]
pub struct ElemSegment {
    /// Whether this segment is applied at instantiation time.
    pub is_active: bool,
    /// The table the segment applies to (active segments only).
    pub table_index: u32,
    /// The base offset expression (active segments only).
    pub base_offset: InitializerExpression,
    /// The function indices written into the table.
    pub indices: Vec<u32>,
}

/// A parsed WebAssembly module.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Module {
    /// The type section: every function signature referenced by index.
    pub types: Vec<FunctionType>,
    /// The function index space. Imports carry a type index.
    pub functions: IndexSpace<FunctionDef, u32>,
    /// The table index space.
    pub tables: IndexSpace<TableDef, TableType>,
    /// The memory index space.
    pub memories: IndexSpace<MemoryDef, MemoryType>,
    /// The global index space.
    pub globals: IndexSpace<GlobalDef, GlobalType>,
    /// The exception-type index space.
    pub exception_types: IndexSpace<ExceptionTypeDef, ExceptionSig>,
    /// The exports, in declaration order.
    pub exports: Vec<Export>,
    /// The data segments.
    pub data_segments: Vec<DataSegment>,
    /// The element segments.
    pub elem_segments: Vec<ElemSegment>,
    /// The start function, if any.
    pub start_function_index: Option<u32>,
}

impl Module {
    /// The type index of the function at `function_index` (import or
    /// definition), if the index is in range.
    pub fn function_type_index(&self, function_index: u32) -> Option<u32> {
        let function_index = function_index as usize;
        let num_imports = self.functions.imports.len();
        if function_index < num_imports {
            Some(self.functions.imports[function_index].ty)
        } else {
            self.functions
                .defs
                .get(function_index - num_imports)
                .map(|def| def.type_index)
        }
    }

    /// The signature of the function at `function_index`.
    pub fn function_type(&self, function_index: u32) -> Option<&FunctionType> {
        self.function_type_index(function_index)
            .and_then(|type_index| self.types.get(type_index as usize))
    }

    /// The type of the table at `table_index`.
    pub fn table_type(&self, table_index: u32) -> Option<TableType> {
        let table_index = table_index as usize;
        let num_imports = self.tables.imports.len();
        if table_index < num_imports {
            Some(self.tables.imports[table_index].ty)
        } else {
            self.tables
                .defs
                .get(table_index - num_imports)
                .map(|def| def.ty)
        }
    }

    /// The type of the memory at `memory_index`.
    pub fn memory_type(&self, memory_index: u32) -> Option<MemoryType> {
        let memory_index = memory_index as usize;
        let num_imports = self.memories.imports.len();
        if memory_index < num_imports {
            Some(self.memories.imports[memory_index].ty)
        } else {
            self.memories
                .defs
                .get(memory_index - num_imports)
                .map(|def| def.ty)
        }
    }

    /// The type of the global at `global_index`.
    pub fn global_type(&self, global_index: u32) -> Option<GlobalType> {
        let global_index = global_index as usize;
        let num_imports = self.globals.imports.len();
        if global_index < num_imports {
            Some(self.globals.imports[global_index].ty)
        } else {
            self.globals
                .defs
                .get(global_index - num_imports)
                .map(|def| def.ty)
        }
    }

    /// The signature of the exception type at `exception_type_index`.
    pub fn exception_sig(&self, exception_type_index: u32) -> Option<&ExceptionSig> {
        let exception_type_index = exception_type_index as usize;
        let num_imports = self.exception_types.imports.len();
        if exception_type_index < num_imports {
            Some(&self.exception_types.imports[exception_type_index].ty)
        } else {
            self.exception_types
                .defs
                .get(exception_type_index - num_imports)
                .map(|def| &def.sig)
        }
    }
}
