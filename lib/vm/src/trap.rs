//! Runtime traps.
//!
//! A trap is raised by an intrinsic the generated code calls, or directly
//! by the runtime (segment application, validated memory accesses). It
//! unwinds through every frame between the raise site and the innermost
//! invocation boundary, where [`catch_traps`] turns it back into a value.
//! The unwinding payload is a panic payload carried by `C-unwind` frames;
//! translating hardware faults in generated code into this payload is the
//! platform collaborator's job and reaches the runtime only through
//! [`Trap::raise`].

use crate::engine::Engine;
use backtrace::Backtrace;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

/// The typed identity of a trap, carried across the JIT boundary as a
/// stable ID.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TrapCode {
    /// An `unreachable` operator was executed.
    UnreachableCodeReached = 0,
    /// Integer division overflowed.
    IntegerOverflow = 1,
    /// Integer division by zero.
    IntegerDivideByZero = 2,
    /// A float-to-integer conversion had no representable result.
    InvalidFloatToInt = 3,
    /// A memory access fell outside the memory's committed pages.
    OutOfBoundsMemoryAccess = 4,
    /// A table access fell outside the table's current size.
    OutOfBoundsTableAccess = 5,
    /// An indirect call's expected signature did not match the callee's.
    IndirectCallSignatureMismatch = 6,
    /// An atomic access was not naturally aligned.
    MisalignedAtomicAccess = 7,
    /// The call stack was exhausted.
    StackOverflow = 8,
    /// The runtime could not allocate memory for an object.
    OutOfMemory = 9,
    /// A user exception left the wasm frames without being caught.
    UserException = 10,
}

impl TrapCode {
    /// A short human-readable description of the trap kind.
    pub fn message(self) -> &'static str {
        match self {
            Self::UnreachableCodeReached => "unreachable executed",
            Self::IntegerOverflow => "integer overflow",
            Self::IntegerDivideByZero => "integer divide by zero",
            Self::InvalidFloatToInt => "invalid conversion to integer",
            Self::OutOfBoundsMemoryAccess => "out-of-bounds memory access",
            Self::OutOfBoundsTableAccess => "out-of-bounds table access",
            Self::IndirectCallSignatureMismatch => "indirect call signature mismatch",
            Self::MisalignedAtomicAccess => "misaligned atomic access",
            Self::StackOverflow => "call stack exhausted",
            Self::OutOfMemory => "out of memory",
            Self::UserException => "uncaught user exception",
        }
    }

    /// Recovers a code from its stable ID.
    pub fn from_id(id: u32) -> Option<Self> {
        Some(match id {
            0 => Self::UnreachableCodeReached,
            1 => Self::IntegerOverflow,
            2 => Self::IntegerDivideByZero,
            3 => Self::InvalidFloatToInt,
            4 => Self::OutOfBoundsMemoryAccess,
            5 => Self::OutOfBoundsTableAccess,
            6 => Self::IndirectCallSignatureMismatch,
            7 => Self::MisalignedAtomicAccess,
            8 => Self::StackOverflow,
            9 => Self::OutOfMemory,
            10 => Self::UserException,
            _ => return None,
        })
    }
}

/// A runtime trap: its typed identity, a description, an argument tuple,
/// and the call stack captured where it was raised.
pub struct Trap {
    /// The trap's typed identity.
    pub code: TrapCode,
    /// A description in terms of the objects involved.
    pub message: String,
    /// The trap's payload tuple (addresses, indices), by kind.
    pub payload: Vec<u64>,
    /// The instruction pointers captured at the raise site.
    pub backtrace: Backtrace,
}

impl Trap {
    /// Creates a trap with an empty payload.
    pub fn new(code: TrapCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            payload: Vec::new(),
            backtrace: Backtrace::new_unresolved(),
        }
    }

    /// Creates a trap carrying a payload tuple.
    pub fn with_payload(code: TrapCode, message: impl Into<String>, payload: Vec<u64>) -> Self {
        Self {
            payload,
            ..Self::new(code, message)
        }
    }

    /// Raises the trap: unwinds to the innermost [`catch_traps`].
    ///
    /// Callers must not hold any lock across a raise; the unwind bypasses
    /// everything between here and the invocation boundary.
    pub fn raise(self) -> ! {
        panic::resume_unwind(Box::new(self))
    }
}

impl fmt::Debug for Trap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Trap")
            .field("code", &self.code)
            .field("message", &self.message)
            .field("payload", &self.payload)
            .finish()
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.code.message(), self.message)
    }
}

impl std::error::Error for Trap {}

/// Runs `f`, catching any trap raised beneath it. Payloads that are not
/// traps (host panics) keep unwinding.
pub fn catch_traps<R>(f: impl FnOnce() -> R) -> Result<R, Trap> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Ok(value),
        Err(payload) => match payload.downcast::<Trap>() {
            Ok(trap) => Err(*trap),
            Err(other) => panic::resume_unwind(other),
        },
    }
}

/// Reports an internal invariant violation and aborts the process. Nothing
/// recovers from these.
pub fn fatal(message: &str) -> ! {
    tracing::error!("fatal runtime error: {}", message);
    eprintln!("fatal runtime error: {}", message);
    std::process::abort();
}

/// Describes an instruction pointer: the owning wasm function and operator
/// index when the engine knows the address, the platform symbolizer
/// otherwise.
pub fn describe_instruction_pointer(engine: &dyn Engine, ip: usize) -> String {
    if let Some(function) = engine.function_by_address(ip) {
        let function = unsafe { function.as_ref() };
        let description = match function.mutable_data().code_info() {
            Some(info) => {
                let offset = ip.wrapping_sub(function.code() as usize) as u32;
                info.offset_to_op_index
                    .range(..=offset)
                    .next_back()
                    .map(|(_, &op_index)| format!("+op{}", op_index))
                    .unwrap_or_default()
            }
            None => String::new(),
        };
        return format!("{}{}", function.debug_name(), description);
    }

    // Fall back to the platform symbolizer.
    let mut symbol_name = None;
    backtrace::resolve(ip as *mut std::ffi::c_void, |symbol| {
        if symbol_name.is_none() {
            symbol_name = symbol.name().map(|name| name.to_string());
        }
    });
    symbol_name.unwrap_or_else(|| format!("{:#x}", ip))
}
