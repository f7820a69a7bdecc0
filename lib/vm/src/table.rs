//! Tables of function references.
//!
//! Table slots are 64-bit atomics holding a *biased* value: the function
//! header's address minus the address of the process-wide out-of-bounds
//! sentinel function. Generated code adds the sentinel base back and can
//! branch on the result without loading the sentinel: a freshly committed
//! (all-zero) slot decodes to the out-of-bounds sentinel, and slots the
//! runtime initialized decode to the uninitialized sentinel, whose encoded
//! signature never matches an indirect call's expected type.
//!
//! The element array reserves address space for every 32-bit index plus a
//! guard page, so a saturated index always lands inside the reservation
//! even when the CPU speculates past the bounds check.

use crate::compartment::Compartment;
use crate::function::{FunctionRef, SentinelFunction};
use crate::mmap::{round_up_to_page_size, Mmap};
use crate::object::ObjectKind;
use crate::trap::{Trap, TrapCode};
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::trace;
use wavelet_types::{TableError, TableType};

const NUM_GUARD_PAGES: usize = 1;

/// Enough reserved slots that any 32-bit index is within the reservation.
const NUM_RESERVED_ELEMENTS: usize = 1 << 32;

const ELEMENT_BYTES: usize = std::mem::size_of::<AtomicUsize>();

const UNASSIGNED_ID: usize = usize::MAX;

static OUT_OF_BOUNDS_ELEMENT: Lazy<SentinelFunction> =
    Lazy::new(|| SentinelFunction::new("out-of-bounds table element"));

static UNINITIALIZED_ELEMENT: Lazy<SentinelFunction> =
    Lazy::new(|| SentinelFunction::new("uninitialized table element"));

// Process-wide list of live tables, for debugging.
static TABLES: Lazy<Mutex<Vec<Weak<Table>>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// The sentinel decoded from any slot beyond a table's current size. Its
/// bias is zero, which is what makes freshly committed pages decode to it.
pub fn out_of_bounds_element() -> FunctionRef {
    OUT_OF_BOUNDS_ELEMENT.as_function_ref()
}

/// The sentinel the runtime writes into grown-but-unset slots. The public
/// getter reports it as null; indirect-call type guards observe it and
/// fail.
pub fn uninitialized_element() -> FunctionRef {
    UNINITIALIZED_ELEMENT.as_function_ref()
}

fn object_to_biased_value(function: FunctionRef) -> usize {
    function
        .address()
        .wrapping_sub(out_of_bounds_element().address())
}

fn biased_value_to_object(biased_value: usize) -> FunctionRef {
    FunctionRef::from_address(biased_value.wrapping_add(out_of_bounds_element().address()))
        .expect("a biased table value never decodes to null")
}

/// Clamps an index to `max` so speculative access past a bounds check stays
/// inside the reservation.
fn saturate_to_bounds(index: usize, max: usize) -> usize {
    index.min(max)
}

fn num_platform_pages(num_bytes: usize) -> usize {
    let page_size = region::page::size();
    round_up_to_page_size(num_bytes, page_size) / page_size
}

/// A table of function references.
pub struct Table {
    kind: ObjectKind,
    compartment: Arc<Compartment>,
    id: AtomicUsize,
    ty: TableType,
    mmap: Mmap,
    num_elements: AtomicUsize,
    resizing_mutex: Mutex<()>,
    debug_name: String,
}

impl Table {
    /// Creates a table in `compartment`, reserving the full 32-bit index
    /// space and growing to the type's minimum size with every new slot
    /// initialized to the uninitialized sentinel.
    pub fn new(
        compartment: &Arc<Compartment>,
        ty: TableType,
        debug_name: String,
    ) -> Result<Arc<Self>, TableError> {
        let table = Self::reserve(compartment, ty, debug_name)?;
        table.grow(ty.minimum, true)?;
        Self::register_in_compartment(&table, None)?;
        Ok(table)
    }

    fn reserve(
        compartment: &Arc<Compartment>,
        ty: TableType,
        debug_name: String,
    ) -> Result<Arc<Self>, TableError> {
        let page_size = region::page::size();
        let reserved_bytes = NUM_RESERVED_ELEMENTS * ELEMENT_BYTES + NUM_GUARD_PAGES * page_size;
        let mmap = Mmap::accessible_reserved(0, reserved_bytes).map_err(TableError::Region)?;
        let table = Arc::new(Self {
            kind: ObjectKind::Table,
            compartment: compartment.clone(),
            id: AtomicUsize::new(UNASSIGNED_ID),
            ty,
            mmap,
            num_elements: AtomicUsize::new(0),
            resizing_mutex: Mutex::new(()),
            debug_name,
        });

        let mut tables = TABLES.lock().unwrap();
        tables.retain(|weak| weak.strong_count() > 0);
        tables.push(Arc::downgrade(&table));
        Ok(table)
    }

    fn register_in_compartment(table: &Arc<Self>, fixed_id: Option<usize>) -> Result<(), TableError> {
        let mut inner = table.compartment.inner.lock().unwrap();
        let id = match fixed_id {
            Some(id) => {
                inner.tables.insert_at(id, Arc::downgrade(table));
                id
            }
            None => inner
                .tables
                .add(Arc::downgrade(table))
                .ok_or_else(|| TableError::InvalidTable {
                    reason: "the compartment's table ID space is exhausted".to_string(),
                })?,
        };
        table.id.store(id, Ordering::Release);
        unsafe {
            (*table.compartment.runtime_data().as_ptr()).table_bases[id] =
                table.mmap.as_mut_ptr();
        }
        trace!(id, debug_name = %table.debug_name, "created table");
        Ok(())
    }

    /// The object kind tag (always `ObjectKind::Table`).
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// The compartment this table was created in.
    pub fn compartment(&self) -> &Arc<Compartment> {
        &self.compartment
    }

    /// The table's ID within its compartment.
    pub fn id(&self) -> usize {
        self.id.load(Ordering::Acquire)
    }

    /// The table's type, with the minimum reflecting the current size.
    pub fn ty(&self) -> TableType {
        let mut ty = self.ty;
        ty.minimum = self.num_elements() as u32;
        ty
    }

    /// The table's debug name.
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    /// The current element count.
    pub fn num_elements(&self) -> usize {
        self.num_elements.load(Ordering::Acquire)
    }

    /// The base of the element array, as published to generated code.
    pub fn base_address(&self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    fn slot(&self, index: usize) -> &AtomicUsize {
        debug_assert!(index < NUM_RESERVED_ELEMENTS);
        unsafe { &*(self.mmap.as_ptr() as *const AtomicUsize).add(index) }
    }

    /// Grows the table by `delta` elements, committing pages as needed, and
    /// returns the previous element count. When `initialize_new_elements`
    /// is set the new slots are stored as the uninitialized sentinel;
    /// otherwise they keep their all-zero (out-of-bounds) encoding.
    pub fn grow(&self, delta: u32, initialize_new_elements: bool) -> Result<usize, TableError> {
        if delta == 0 {
            return Ok(self.num_elements());
        }

        let _resizing = self.resizing_mutex.lock().unwrap();
        let previous_num_elements = self.num_elements.load(Ordering::Acquire);

        let could_not_grow = TableError::CouldNotGrow {
            current: previous_num_elements as u32,
            attempted_delta: delta,
        };
        let new_num_elements = previous_num_elements + delta as usize;
        let maximum = self.ty.maximum.map_or(NUM_RESERVED_ELEMENTS, |max| max as usize);
        if new_num_elements > maximum || new_num_elements > NUM_RESERVED_ELEMENTS {
            return Err(could_not_grow);
        }

        // Commit pages for the new elements.
        let page_size = region::page::size();
        let previous_pages = num_platform_pages(previous_num_elements * ELEMENT_BYTES);
        let new_pages = num_platform_pages(new_num_elements * ELEMENT_BYTES);
        if new_pages != previous_pages {
            self.mmap
                .make_accessible(previous_pages * page_size, (new_pages - previous_pages) * page_size)
                .map_err(TableError::Region)?;
        }

        if initialize_new_elements {
            // Write the uninitialized sentinel value to the new elements.
            let uninitialized = object_to_biased_value(uninitialized_element());
            for index in previous_num_elements..new_num_elements {
                self.slot(index).store(uninitialized, Ordering::Release);
            }
        }

        self.num_elements
            .store(new_num_elements, Ordering::Release);
        trace!(
            debug_name = %self.debug_name,
            previous = previous_num_elements,
            new = new_num_elements,
            "grew table"
        );
        Ok(previous_num_elements)
    }

    /// Reads the raw element at a saturated index, sentinels included.
    pub(crate) fn get_element_non_null(&self, index: usize) -> FunctionRef {
        let saturated = saturate_to_bounds(index, NUM_RESERVED_ELEMENTS - 1);
        let biased_value = self.slot(saturated).load(Ordering::Acquire);
        biased_value_to_object(biased_value)
    }

    /// Returns the element at `index`, or `None` when the slot is
    /// uninitialized or the index is out of range.
    pub fn get(&self, index: usize) -> Option<FunctionRef> {
        if index >= self.num_elements() {
            return None;
        }
        let object = self.get_element_non_null(index);
        if object == uninitialized_element() || object == out_of_bounds_element() {
            None
        } else {
            Some(object)
        }
    }

    /// Atomically replaces the element at `index`, returning the previous
    /// element (`None` if the slot was uninitialized). `None` as the new
    /// value resets the slot to the uninitialized sentinel. An index beyond
    /// the current size raises the out-of-bounds table trap.
    pub fn set(&self, index: usize, new_value: Option<FunctionRef>) -> Result<Option<FunctionRef>, Trap> {
        if index >= self.num_elements() {
            return Err(Trap::with_payload(
                TrapCode::OutOfBoundsTableAccess,
                format!(
                    "index {} exceeds table {:?} of {} elements",
                    index,
                    self.debug_name,
                    self.num_elements()
                ),
                vec![index as u64],
            ));
        }
        if let Some(function) = new_value {
            debug_assert!(self.compartment.contains_function(function));
        }

        let new_object = new_value.unwrap_or_else(uninitialized_element);
        let saturated = saturate_to_bounds(index, NUM_RESERVED_ELEMENTS - 1);
        let biased_value = object_to_biased_value(new_object);

        let slot = self.slot(saturated);
        let mut old_biased_value = slot.load(Ordering::Acquire);
        loop {
            match slot.compare_exchange_weak(
                old_biased_value,
                biased_value,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => old_biased_value = observed,
            }
        }

        let old_object = biased_value_to_object(old_biased_value);
        Ok(if old_object == uninitialized_element() {
            None
        } else {
            Some(old_object)
        })
    }

    /// Clones a table into a cloned compartment, preserving its ID and its
    /// slot contents. Function addresses are valid across compartments
    /// because the clone shares the source's loaded JIT modules, and the
    /// sentinels are process-wide, so the biased values transfer verbatim.
    pub(crate) fn clone_into(
        source: &Arc<Self>,
        compartment: &Arc<Compartment>,
        id: usize,
    ) -> Result<Arc<Self>, TableError> {
        let clone = Self::reserve(compartment, source.ty, source.debug_name.clone())?;

        let _resizing = source.resizing_mutex.lock().unwrap();
        let num_elements = source.num_elements.load(Ordering::Acquire);
        clone.grow(num_elements as u32, false)?;
        for index in 0..num_elements {
            let biased_value = source.slot(index).load(Ordering::Acquire);
            clone.slot(index).store(biased_value, Ordering::Release);
        }

        Self::register_in_compartment(&clone, Some(id))?;
        Ok(clone)
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        let id = self.id.load(Ordering::Acquire);
        if id != UNASSIGNED_ID {
            let mut inner = self.compartment.inner.lock().unwrap();
            inner.tables.remove(id);
            unsafe {
                (*self.compartment.runtime_data().as_ptr()).table_bases[id] = std::ptr::null_mut();
            }
        }
        TABLES
            .lock()
            .unwrap()
            .retain(|weak| weak.strong_count() > 0);
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("debug_name", &self.debug_name)
            .field("num_elements", &self.num_elements())
            .finish()
    }
}
