//! Linear memories.
//!
//! A memory reserves address space for the entire 32-bit offset window up
//! front (plus a trailing guard page), so generated code can compute
//! `base + zext32(offset)` without a bounds check: any access beyond the
//! committed pages lands in inaccessible pages and faults. Growth commits
//! pages in place; the base address never moves. Host-side accesses go
//! through [`Memory::validated_range`], which performs the bounds check
//! explicitly and raises the out-of-bounds trap as a value.

use crate::compartment::Compartment;
use crate::mmap::Mmap;
use crate::object::ObjectKind;
use crate::trap::{Trap, TrapCode};
use once_cell::sync::Lazy;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::trace;
use wavelet_types::{Bytes, MemoryError, MemoryType, Pages, WASM_PAGE_SIZE};

/// One wasm page of guard beyond the offset window, so small constant
/// offsets past a boundary access still fault inside the reservation.
const GUARD_BYTES: usize = WASM_PAGE_SIZE;

/// The full 32-bit offset window.
const RESERVED_BYTES: usize = 1 << 32;

const UNASSIGNED_ID: usize = usize::MAX;

// Process-wide list of live memories, so a fault handler can map a faulting
// address to the memory that owns it.
static MEMORIES: Lazy<Mutex<Vec<Weak<Memory>>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// A sandboxed linear memory.
pub struct Memory {
    kind: ObjectKind,
    compartment: Arc<Compartment>,
    id: AtomicUsize,
    ty: MemoryType,
    mmap: Mmap,
    num_pages: AtomicUsize,
    resize_mutex: Mutex<()>,
    debug_name: String,
}

impl Memory {
    /// Creates a memory in `compartment`, reserving the full offset window
    /// and committing the type's minimum page count.
    pub fn new(
        compartment: &Arc<Compartment>,
        ty: MemoryType,
        debug_name: String,
    ) -> Result<Arc<Self>, MemoryError> {
        Self::validate_type(&ty)?;
        let memory = Self::reserve(compartment, ty, debug_name)?;
        memory.grow(ty.minimum)?;
        Self::register_in_compartment(&memory, None)?;
        Ok(memory)
    }

    fn validate_type(ty: &MemoryType) -> Result<(), MemoryError> {
        if ty.minimum > Pages::max_value() {
            return Err(MemoryError::MinimumMemoryTooLarge {
                min_requested: ty.minimum,
                max_allowed: Pages::max_value(),
            });
        }
        if let Some(max) = ty.maximum {
            if max > Pages::max_value() {
                return Err(MemoryError::MaximumMemoryTooLarge {
                    max_requested: max,
                    max_allowed: Pages::max_value(),
                });
            }
            if max < ty.minimum {
                return Err(MemoryError::InvalidMemory {
                    reason: format!(
                        "the maximum ({} pages) is less than the minimum ({} pages)",
                        max.0, ty.minimum.0
                    ),
                });
            }
        }
        Ok(())
    }

    fn reserve(
        compartment: &Arc<Compartment>,
        ty: MemoryType,
        debug_name: String,
    ) -> Result<Arc<Self>, MemoryError> {
        let mmap = Mmap::accessible_reserved(0, RESERVED_BYTES + GUARD_BYTES)
            .map_err(MemoryError::Region)?;
        let memory = Arc::new(Self {
            kind: ObjectKind::Memory,
            compartment: compartment.clone(),
            id: AtomicUsize::new(UNASSIGNED_ID),
            ty,
            mmap,
            num_pages: AtomicUsize::new(0),
            resize_mutex: Mutex::new(()),
            debug_name,
        });

        let mut memories = MEMORIES.lock().unwrap();
        memories.retain(|weak| weak.strong_count() > 0);
        memories.push(Arc::downgrade(&memory));
        Ok(memory)
    }

    fn register_in_compartment(
        memory: &Arc<Self>,
        fixed_id: Option<usize>,
    ) -> Result<(), MemoryError> {
        let mut inner = memory.compartment.inner.lock().unwrap();
        let id = match fixed_id {
            Some(id) => {
                inner.memories.insert_at(id, Arc::downgrade(memory));
                id
            }
            None => inner
                .memories
                .add(Arc::downgrade(memory))
                .ok_or_else(|| MemoryError::InvalidMemory {
                    reason: "the compartment's memory ID space is exhausted".to_string(),
                })?,
        };
        memory.id.store(id, Ordering::Release);
        unsafe {
            (*memory.compartment.runtime_data().as_ptr()).memory_bases[id] =
                memory.mmap.as_mut_ptr();
        }
        trace!(id, debug_name = %memory.debug_name, "created memory");
        Ok(())
    }

    /// The object kind tag (always `ObjectKind::Memory`).
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// The compartment this memory was created in.
    pub fn compartment(&self) -> &Arc<Compartment> {
        &self.compartment
    }

    /// The memory's ID within its compartment.
    pub fn id(&self) -> usize {
        self.id.load(Ordering::Acquire)
    }

    /// The memory's type, with the minimum reflecting the current size.
    pub fn ty(&self) -> MemoryType {
        let mut ty = self.ty;
        ty.minimum = self.num_pages();
        ty
    }

    /// The memory's debug name.
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    /// The currently committed length in wasm pages.
    pub fn num_pages(&self) -> Pages {
        Pages(self.num_pages.load(Ordering::Acquire) as u32)
    }

    /// The page count this memory may grow to.
    pub fn max_pages(&self) -> Pages {
        self.ty.maximum.unwrap_or_else(Pages::max_value)
    }

    /// The base address of the memory's reservation.
    pub fn base_address(&self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    /// Grows the memory by `delta` pages, committing the new pages, and
    /// returns the previous page count. Growing by zero pages returns the
    /// current page count without changing anything.
    pub fn grow(&self, delta: Pages) -> Result<Pages, MemoryError> {
        if delta.0 == 0 {
            return Ok(self.num_pages());
        }

        let _resizing = self.resize_mutex.lock().unwrap();
        let previous_pages = Pages(self.num_pages.load(Ordering::Acquire) as u32);

        let could_not_grow = MemoryError::CouldNotGrow {
            current: previous_pages,
            attempted_delta: delta,
        };
        let new_pages = previous_pages
            .checked_add(delta)
            .ok_or_else(|| could_not_grow.clone())?;
        if new_pages > self.max_pages() {
            return Err(could_not_grow);
        }

        let previous_bytes = Bytes::from(previous_pages).0;
        let new_bytes = Bytes::from(new_pages).0;
        self.mmap
            .make_accessible(previous_bytes, new_bytes - previous_bytes)
            .map_err(MemoryError::Region)?;

        self.num_pages
            .store(new_pages.0 as usize, Ordering::Release);
        trace!(
            debug_name = %self.debug_name,
            previous = previous_pages.0,
            new = new_pages.0,
            "grew memory"
        );
        Ok(previous_pages)
    }

    /// Bounds-checks `offset..offset+num_bytes` against the committed pages
    /// and returns a pointer to the range, or the out-of-bounds trap.
    pub fn validated_range(&self, offset: u64, num_bytes: u64) -> Result<NonNull<u8>, Trap> {
        let committed = (self.num_pages.load(Ordering::Acquire) as u64) * WASM_PAGE_SIZE as u64;
        let end = offset.checked_add(num_bytes);
        match end {
            Some(end) if end <= committed => {
                let ptr = unsafe { self.mmap.as_mut_ptr().add(offset as usize) };
                Ok(unsafe { NonNull::new_unchecked(ptr) })
            }
            _ => Err(Trap::with_payload(
                TrapCode::OutOfBoundsMemoryAccess,
                format!(
                    "access at offset {:#x}+{} exceeds memory {:?}",
                    offset, num_bytes, self.debug_name
                ),
                vec![offset],
            )),
        }
    }

    /// Returns a pointer to `offset..offset+num_bytes` within the
    /// reservation without checking against the committed length. Accessing
    /// uncommitted pages through the result faults at the OS level, which
    /// is exactly the contract generated code relies on.
    pub fn reserved_range(&self, offset: u64, num_bytes: u64) -> *mut u8 {
        debug_assert!(offset + num_bytes <= (RESERVED_BYTES + GUARD_BYTES) as u64);
        unsafe { self.mmap.as_mut_ptr().add(offset as usize) }
    }

    /// Clones a memory into a cloned compartment, preserving its ID and
    /// copying its committed contents.
    pub(crate) fn clone_into(
        source: &Arc<Self>,
        compartment: &Arc<Compartment>,
        id: usize,
    ) -> Result<Arc<Self>, MemoryError> {
        let clone = Self::reserve(compartment, source.ty, source.debug_name.clone())?;

        // Hold the source's resize lock so the page count and the bytes are
        // copied consistently.
        let _resizing = source.resize_mutex.lock().unwrap();
        let num_pages = Pages(source.num_pages.load(Ordering::Acquire) as u32);
        clone.grow(num_pages)?;
        let num_bytes = Bytes::from(num_pages).0;
        unsafe {
            std::ptr::copy_nonoverlapping(
                source.mmap.as_ptr(),
                clone.mmap.as_mut_ptr(),
                num_bytes,
            );
        }

        Self::register_in_compartment(&clone, Some(id))?;
        Ok(clone)
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        let id = self.id.load(Ordering::Acquire);
        if id != UNASSIGNED_ID {
            let mut inner = self.compartment.inner.lock().unwrap();
            inner.memories.remove(id);
            unsafe {
                (*self.compartment.runtime_data().as_ptr()).memory_bases[id] = std::ptr::null_mut();
            }
        }
        MEMORIES
            .lock()
            .unwrap()
            .retain(|weak| weak.strong_count() > 0);
    }
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Memory")
            .field("debug_name", &self.debug_name)
            .field("num_pages", &self.num_pages())
            .finish()
    }
}

/// Maps an address to the live memory whose reservation contains it, for
/// fault-handler use.
pub fn lookup_memory_by_address(address: usize) -> Option<Arc<Memory>> {
    let memories = MEMORIES.lock().unwrap();
    for weak in memories.iter() {
        if let Some(memory) = weak.upgrade() {
            let base = memory.mmap.as_ptr() as usize;
            if address >= base && address < base + memory.mmap.len() {
                return Some(memory);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compartment::Compartment;
    use wavelet_types::MemoryType;

    fn test_memory(minimum: u32, maximum: Option<u32>) -> (Arc<Compartment>, Arc<Memory>) {
        let compartment = Compartment::new().unwrap();
        let memory = Memory::new(
            &compartment,
            MemoryType::new(minimum, maximum, false),
            "test memory".to_string(),
        )
        .unwrap();
        (compartment, memory)
    }

    #[test]
    fn grow_reports_previous_page_count() {
        let (_compartment, memory) = test_memory(1, Some(4));
        assert_eq!(memory.num_pages(), Pages(1));
        assert_eq!(memory.grow(Pages(2)).unwrap(), Pages(1));
        assert_eq!(memory.num_pages(), Pages(3));

        // Growing by zero pages returns the current count and changes
        // nothing.
        assert_eq!(memory.grow(Pages(0)).unwrap(), Pages(3));
        assert_eq!(memory.num_pages(), Pages(3));

        // Exceeding the maximum fails and leaves the size unchanged.
        assert!(matches!(
            memory.grow(Pages(2)),
            Err(MemoryError::CouldNotGrow { .. })
        ));
        assert_eq!(memory.num_pages(), Pages(3));
    }

    #[test]
    fn validated_range_checks_the_committed_bound() {
        let (_compartment, memory) = test_memory(1, None);
        let num_bytes = Bytes::from(memory.num_pages()).0 as u64;

        let range = memory.validated_range(0, 4).unwrap();
        unsafe {
            range.as_ptr().cast::<u32>().write_unaligned(0xdead_beef);
            assert_eq!(range.as_ptr().cast::<u32>().read_unaligned(), 0xdead_beef);
        }
        assert!(memory.validated_range(num_bytes - 4, 4).is_ok());

        let trap = memory.validated_range(num_bytes, 1).unwrap_err();
        assert_eq!(trap.code, crate::trap::TrapCode::OutOfBoundsMemoryAccess);
        let trap = memory.validated_range(u64::MAX, 1).unwrap_err();
        assert_eq!(trap.code, crate::trap::TrapCode::OutOfBoundsMemoryAccess);
    }

    #[test]
    fn base_is_published_to_the_compartment_header() {
        let (compartment, memory) = test_memory(1, None);
        let published = unsafe {
            (*compartment.runtime_data().as_ptr()).memory_bases[memory.id()]
        };
        assert_eq!(published, memory.base_address());
    }

    #[test]
    fn registry_maps_addresses_to_memories() {
        let (_compartment, memory) = test_memory(1, None);
        let inside = memory.base_address() as usize + 12345;
        let found = lookup_memory_by_address(inside).unwrap();
        assert!(Arc::ptr_eq(&found, &memory));
    }

    #[test]
    fn invalid_types_are_rejected() {
        let compartment = Compartment::new().unwrap();
        let result = Memory::new(
            &compartment,
            MemoryType::new(2u32, Some(1), false),
            "bad".to_string(),
        );
        assert!(matches!(result, Err(MemoryError::InvalidMemory { .. })));
    }
}
