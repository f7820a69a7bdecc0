//! A process-wide registry of function signatures, for fast indirect-call
//! signature checking.
//!
//! WebAssembly requires that the caller and callee signatures in an
//! indirect call match. To implement this efficiently, every signature is
//! interned into one registry shared by all instances, so call sites can
//! just compare indices. The index is also the `encoded_type` stored in
//! every function header.

use once_cell::sync::Lazy;
use std::collections::{hash_map, HashMap};
use std::convert::TryFrom;
use std::sync::RwLock;
use wavelet_types::FunctionType;

/// The dense index of an interned function signature.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct VMSharedSignatureIndex(u32);

impl VMSharedSignatureIndex {
    /// Creates an index from a raw value.
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    /// The raw value.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl Default for VMSharedSignatureIndex {
    /// `u32::MAX` is reserved as the never-registered sentinel; it is the
    /// encoded type of the table sentinels, so an indirect call through an
    /// uninitialized slot can never pass the signature guard.
    fn default() -> Self {
        Self(u32::MAX)
    }
}

#[derive(Debug, Default)]
struct Inner {
    signature2index: HashMap<FunctionType, VMSharedSignatureIndex>,
    index2signature: HashMap<VMSharedSignatureIndex, FunctionType>,
}

/// The signature interner. Use [`SignatureRegistry::global`].
#[derive(Debug, Default)]
pub struct SignatureRegistry {
    // Interior mutability with a lock so instantiation on multiple threads
    // doesn't need external synchronization.
    inner: RwLock<Inner>,
}

static GLOBAL: Lazy<SignatureRegistry> = Lazy::new(SignatureRegistry::default);

impl SignatureRegistry {
    /// The process-wide registry.
    pub fn global() -> &'static Self {
        &GLOBAL
    }

    /// Registers a signature and returns its unique index.
    pub fn register(&self, sig: &FunctionType) -> VMSharedSignatureIndex {
        let mut inner = self.inner.write().unwrap();
        let len = inner.signature2index.len();
        let entry = inner.signature2index.entry(sig.clone());
        match entry {
            hash_map::Entry::Occupied(entry) => *entry.get(),
            hash_map::Entry::Vacant(entry) => {
                // Keep the index space under u32::MAX, which is reserved for
                // VMSharedSignatureIndex::default().
                let sig_id = VMSharedSignatureIndex::new(
                    u32::try_from(len).expect("signature registry overflow"),
                );
                entry.insert(sig_id);
                inner.index2signature.insert(sig_id, sig.clone());
                sig_id
            }
        }
    }

    /// Looks up a previously registered signature.
    pub fn lookup(&self, index: VMSharedSignatureIndex) -> Option<FunctionType> {
        self.inner
            .read()
            .unwrap()
            .index2signature
            .get(&index)
            .cloned()
    }
}
