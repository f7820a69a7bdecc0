use crate::types::Type;
use std::fmt;

/// Possible runtime values that a WebAssembly module can either consume or
/// produce.
///
/// `T` is the representation of a function reference; the runtime
/// instantiates it with its function-handle type, while layers that never
/// traffic in references may use `Value<()>`.
#[derive(Clone, Copy, PartialEq)]
pub enum Value<T> {
    /// A 32-bit integer.
    ///
    /// In Wasm integers are sign-agnostic, i.e. this can either be signed or unsigned.
    I32(i32),

    /// A 64-bit integer.
    ///
    /// In Wasm integers are sign-agnostic, i.e. this can either be signed or unsigned.
    I64(i64),

    /// A 32-bit float.
    F32(f32),

    /// A 64-bit float.
    F64(f64),

    /// A 128-bit number.
    V128(u128),

    /// A first-class reference to a WebAssembly function, nullable.
    FuncRef(Option<T>),
}

impl<T> Value<T> {
    /// Returns the corresponding [`Type`] for this value.
    pub fn ty(&self) -> Type {
        match self {
            Self::I32(_) => Type::I32,
            Self::I64(_) => Type::I64,
            Self::F32(_) => Type::F32,
            Self::F64(_) => Type::F64,
            Self::V128(_) => Type::V128,
            Self::FuncRef(_) => Type::FuncRef,
        }
    }

    /// Returns the `i32` payload, if this value is an `I32`.
    pub fn i32(&self) -> Option<i32> {
        match self {
            Self::I32(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the `i64` payload, if this value is an `I64`.
    pub fn i64(&self) -> Option<i64> {
        match self {
            Self::I64(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the `f32` payload, if this value is an `F32`.
    pub fn f32(&self) -> Option<f32> {
        match self {
            Self::F32(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the `f64` payload, if this value is an `F64`.
    pub fn f64(&self) -> Option<f64> {
        match self {
            Self::F64(v) => Some(*v),
            _ => None,
        }
    }
}

impl<T> fmt::Debug for Value<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::I32(v) => write!(f, "I32({})", v),
            Self::I64(v) => write!(f, "I64({})", v),
            Self::F32(v) => write!(f, "F32({})", v),
            Self::F64(v) => write!(f, "F64({})", v),
            Self::V128(v) => write!(f, "V128({})", v),
            Self::FuncRef(Some(_)) => write!(f, "FuncRef"),
            Self::FuncRef(None) => write!(f, "Null FuncRef"),
        }
    }
}

impl<T> From<i32> for Value<T> {
    fn from(value: i32) -> Self {
        Self::I32(value)
    }
}

impl<T> From<i64> for Value<T> {
    fn from(value: i64) -> Self {
        Self::I64(value)
    }
}

impl<T> From<f32> for Value<T> {
    fn from(value: f32) -> Self {
        Self::F32(value)
    }
}

impl<T> From<f64> for Value<T> {
    fn from(value: f64) -> Self {
        Self::F64(value)
    }
}

/// The type-erased bit pattern of a single WebAssembly value, as stored in
/// the per-context mutable-global slab and the invocation scratch area.
///
/// Sixteen bytes so that a `v128` fits; narrower values occupy the low bits.
/// Reads must be performed through the member matching the value's declared
/// type, which the validator guarantees for generated code and
/// [`UntaggedValue::to_value`] enforces for host code.
#[derive(Copy, Clone)]
#[repr(C)]
pub union UntaggedValue {
    /// Signed 32-bit integer member.
    pub i32_: i32,
    /// Unsigned 32-bit integer member.
    pub u32_: u32,
    /// Signed 64-bit integer member.
    pub i64_: i64,
    /// Unsigned 64-bit integer member.
    pub u64_: u64,
    /// 32-bit float member.
    pub f32_: f32,
    /// 64-bit float member.
    pub f64_: f64,
    /// 128-bit vector member.
    pub v128: u128,
    /// Function-reference member, stored as the function object's address
    /// (zero for null).
    pub func_ref: usize,
}

impl UntaggedValue {
    /// An all-zero-bits value.
    pub const fn zero() -> Self {
        Self { v128: 0 }
    }

    /// Tags this bit pattern with the given type, yielding a typed value.
    /// Function references are surfaced through `make_ref` so the caller
    /// chooses the handle representation.
    ///
    /// # Safety
    /// The bit pattern must have been written as a value of type `ty`.
    pub unsafe fn to_value<T, F>(&self, ty: Type, make_ref: F) -> Value<T>
    where
        F: FnOnce(usize) -> Option<T>,
    {
        match ty {
            Type::I32 => Value::I32(self.i32_),
            Type::I64 => Value::I64(self.i64_),
            Type::F32 => Value::F32(self.f32_),
            Type::F64 => Value::F64(self.f64_),
            Type::V128 => Value::V128(self.v128),
            Type::FuncRef | Type::ExternRef => Value::FuncRef(make_ref(self.func_ref)),
        }
    }
}

impl Default for UntaggedValue {
    fn default() -> Self {
        Self::zero()
    }
}

impl fmt::Debug for UntaggedValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "UntaggedValue({:#034x})", unsafe { self.v128 })
    }
}

impl<T> From<&Value<T>> for UntaggedValue {
    fn from(value: &Value<T>) -> Self {
        match value {
            Value::I32(v) => Self { i32_: *v },
            Value::I64(v) => Self { i64_: *v },
            Value::F32(v) => Self { f32_: *v },
            Value::F64(v) => Self { f64_: *v },
            Value::V128(v) => Self { v128: *v },
            // The caller converts non-null references to addresses before
            // marshalling; a typed null is an all-zero pattern.
            Value::FuncRef(_) => Self { func_ref: 0 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untagged_round_trip() {
        let v: Value<()> = Value::I32(-7);
        let raw = UntaggedValue::from(&v);
        let round_tripped: Value<()> = unsafe { raw.to_value(Type::I32, |_| None) };
        assert_eq!(round_tripped, v);

        let v: Value<()> = Value::F64(1.5);
        let raw = UntaggedValue::from(&v);
        let round_tripped: Value<()> = unsafe { raw.to_value(Type::F64, |_| None) };
        assert_eq!(round_tripped, v);
    }

    #[test]
    fn untagged_value_is_sixteen_bytes() {
        assert_eq!(std::mem::size_of::<UntaggedValue>(), 16);
    }
}
