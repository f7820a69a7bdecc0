use crate::units::Pages;
use std::fmt;
use std::sync::Arc;

/// A list of all possible value types in WebAssembly.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Type {
    /// Signed 32 bit integer.
    I32,
    /// Signed 64 bit integer.
    I64,
    /// Floating point 32 bit integer.
    F32,
    /// Floating point 64 bit integer.
    F64,
    /// A 128 bit number.
    V128,
    /// A reference to a Wasm function.
    FuncRef,
    /// A reference to opaque data in the Wasm instance.
    ExternRef,
}

impl Type {
    /// Returns true if `Type` matches any of the numeric types, (e.g. `I32`,
    /// `I64`, `F32`, `F64`, `V128`).
    pub fn is_num(self) -> bool {
        matches!(
            self,
            Self::I32 | Self::I64 | Self::F32 | Self::F64 | Self::V128
        )
    }

    /// Returns true if `Type` matches either of the reference types.
    pub fn is_ref(self) -> bool {
        matches!(self, Self::ExternRef | Self::FuncRef)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::V128 => "v128",
            Self::FuncRef => "funcref",
            Self::ExternRef => "externref",
        };
        write!(f, "{}", s)
    }
}

/// The signature of a function: its parameter and result types.
///
/// The internal slices are reference counted so that signatures can be
/// cheaply cloned into registries and function headers.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct FunctionType {
    params: Arc<[Type]>,
    results: Arc<[Type]>,
}

impl FunctionType {
    /// Creates a new function type with the given parameter and result types.
    pub fn new<P, R>(params: P, results: R) -> Self
    where
        P: Into<Arc<[Type]>>,
        R: Into<Arc<[Type]>>,
    {
        Self {
            params: params.into(),
            results: results.into(),
        }
    }

    /// Parameter types.
    pub fn params(&self) -> &[Type] {
        &self.params
    }

    /// Result types.
    pub fn results(&self) -> &[Type] {
        &self.results
    }
}

impl Default for FunctionType {
    fn default() -> Self {
        Self::new(vec![], vec![])
    }
}

impl fmt::Debug for FunctionType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for FunctionType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let params = self
            .params
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let results = self
            .results
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "[{}] -> [{}]", params, results)
    }
}

/// Indicator of whether a global value is mutable or not.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Mutability {
    /// The global value is constant.
    Const,
    /// The global value is mutable.
    Var,
}

impl Mutability {
    /// Returns whether this is `Var`.
    pub fn is_mutable(self) -> bool {
        matches!(self, Self::Var)
    }
}

/// WebAssembly global type: the type of the value plus its mutability.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct GlobalType {
    /// The type of the value stored in the global.
    pub ty: Type,
    /// A flag indicating whether the value may change at runtime.
    pub mutability: Mutability,
}

impl GlobalType {
    /// Creates a new global type.
    pub fn new(ty: Type, mutability: Mutability) -> Self {
        Self { ty, mutability }
    }
}

impl fmt::Display for GlobalType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mutability = match self.mutability {
            Mutability::Const => "constant",
            Mutability::Var => "mutable",
        };
        write!(f, "{} ({})", self.ty, mutability)
    }
}

/// A descriptor for a table in a WebAssembly module.
///
/// Tables are contiguous chunks of a typed array. For the time being the
/// only valid element type is `funcref`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TableType {
    /// The type of data stored in elements of the table.
    pub ty: Type,
    /// The minimum number of elements in the table.
    pub minimum: u32,
    /// The maximum number of elements in the table.
    pub maximum: Option<u32>,
}

impl TableType {
    /// Creates a new table descriptor.
    pub fn new(ty: Type, minimum: u32, maximum: Option<u32>) -> Self {
        Self {
            ty,
            minimum,
            maximum,
        }
    }

    /// Whether `other` satisfies the constraints this type declares; used
    /// when matching an imported table against an import declaration.
    pub fn accepts(&self, other: &Self) -> bool {
        self.ty == other.ty
            && other.minimum >= self.minimum
            && match (self.maximum, other.maximum) {
                (None, _) => true,
                (Some(_), None) => false,
                (Some(declared), Some(actual)) => actual <= declared,
            }
    }
}

impl fmt::Display for TableType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(maximum) = self.maximum {
            write!(f, "{} ({}..{})", self.ty, self.minimum, maximum)
        } else {
            write!(f, "{} ({}..)", self.ty, self.minimum)
        }
    }
}

/// A descriptor for a WebAssembly memory type.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct MemoryType {
    /// The minimum number of pages in the memory.
    pub minimum: Pages,
    /// The maximum number of pages in the memory.
    pub maximum: Option<Pages>,
    /// Whether the memory may be shared between multiple threads.
    pub shared: bool,
}

impl MemoryType {
    /// Creates a new memory descriptor.
    pub fn new<IntoPages>(minimum: IntoPages, maximum: Option<IntoPages>, shared: bool) -> Self
    where
        IntoPages: Into<Pages>,
    {
        Self {
            minimum: minimum.into(),
            maximum: maximum.map(Into::into),
            shared,
        }
    }

    /// Whether `other` satisfies the constraints this type declares.
    pub fn accepts(&self, other: &Self) -> bool {
        self.shared == other.shared
            && other.minimum >= self.minimum
            && match (self.maximum, other.maximum) {
                (None, _) => true,
                (Some(_), None) => false,
                (Some(declared), Some(actual)) => actual <= declared,
            }
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let shared = if self.shared { "shared" } else { "not shared" };
        if let Some(maximum) = self.maximum {
            write!(f, "{} ({:?}..{:?})", shared, self.minimum, maximum)
        } else {
            write!(f, "{} ({:?}..)", shared, self.minimum)
        }
    }
}

/// The payload signature of a user-raisable exception type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ExceptionSig {
    /// The value types of the exception's payload tuple.
    pub params: Arc<[Type]>,
}

impl ExceptionSig {
    /// Creates a new exception signature from the given payload types.
    pub fn new<P: Into<Arc<[Type]>>>(params: P) -> Self {
        Self {
            params: params.into(),
        }
    }
}

impl fmt::Display for ExceptionSig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let params = self
            .params
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "exception [{}]", params)
    }
}

/// The kind of an extern (import or export declaration), without its type
/// payload. The discriminants match the runtime's object kind tags.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExternKind {
    /// A function.
    Function = 0,
    /// A table.
    Table = 1,
    /// A memory.
    Memory = 2,
    /// A global.
    Global = 3,
    /// An exception type.
    Exception = 4,
}

/// A list of all possible types which can be externally referenced from a
/// WebAssembly module: the declared type of an import or export.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ExternType {
    /// This external type is the type of a WebAssembly function.
    Function(FunctionType),
    /// This external type is the type of a WebAssembly global.
    Global(GlobalType),
    /// This external type is the type of a WebAssembly table.
    Table(TableType),
    /// This external type is the type of a WebAssembly memory.
    Memory(MemoryType),
    /// This external type is the type of a WebAssembly exception.
    Exception(ExceptionSig),
}

impl ExternType {
    /// The kind tag of this extern type.
    pub fn kind(&self) -> ExternKind {
        match self {
            Self::Function(_) => ExternKind::Function,
            Self::Table(_) => ExternKind::Table,
            Self::Memory(_) => ExternKind::Memory,
            Self::Global(_) => ExternKind::Global,
            Self::Exception(_) => ExternKind::Exception,
        }
    }
}

impl fmt::Display for ExternType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Function(ty) => write!(f, "func {}", ty),
            Self::Global(ty) => write!(f, "global {}", ty),
            Self::Table(ty) => write!(f, "table {}", ty),
            Self::Memory(ty) => write!(f, "memory {}", ty),
            Self::Exception(sig) => write!(f, "{}", sig),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_acceptance() {
        let declared = MemoryType::new(1u32, Some(4), false);
        assert!(declared.accepts(&MemoryType::new(1u32, Some(4), false)));
        assert!(declared.accepts(&MemoryType::new(2u32, Some(3), false)));
        assert!(!declared.accepts(&MemoryType::new(0u32, Some(4), false)));
        assert!(!declared.accepts(&MemoryType::new(1u32, None, false)));
        assert!(!declared.accepts(&MemoryType::new(1u32, Some(5), false)));

        let unbounded = TableType::new(Type::FuncRef, 1, None);
        assert!(unbounded.accepts(&TableType::new(Type::FuncRef, 1, None)));
        assert!(unbounded.accepts(&TableType::new(Type::FuncRef, 8, Some(9))));
        assert!(!unbounded.accepts(&TableType::new(Type::ExternRef, 1, None)));
    }

    #[test]
    fn function_type_display() {
        let ty = FunctionType::new(vec![Type::I32, Type::I64], vec![Type::F64]);
        assert_eq!(ty.to_string(), "[i32, i64] -> [f64]");
    }
}
