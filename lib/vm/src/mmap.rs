//! Low-level abstraction for reserving and committing zero-filled pages of
//! memory. The runtime's sandboxing scheme is reserve-then-commit: address
//! space is reserved up front (inaccessible), and pages become accessible
//! only as memories, tables and compartment runtime data grow into them.

use more_asserts::assert_le;
use std::io;
use std::ptr;
use std::slice;

/// Round `size` up to the nearest multiple of `page_size`.
pub fn round_up_to_page_size(size: usize, page_size: usize) -> usize {
    (size + (page_size - 1)) & !(page_size - 1)
}

/// A page-aligned reservation of address space, of which a prefix (or any
/// explicitly committed range) is accessible.
#[derive(Debug)]
pub struct Mmap {
    // Stored as a `usize` instead of a pointer so the structure is natively
    // `Send` and `Sync`; coordination happens at the OS layer.
    ptr: usize,
    total_size: usize,
}

impl Mmap {
    /// Construct a new empty instance of `Mmap`.
    pub fn new() -> Self {
        // Rust's slices require non-null pointers, even when empty. `Vec`
        // contains code to create a non-null dangling pointer value when
        // constructed empty, so we reuse that here.
        let empty = Vec::<u8>::new();
        Self {
            ptr: empty.as_ptr() as usize,
            total_size: 0,
        }
    }

    /// Create a new `Mmap` pointing to `accessible_size` bytes of
    /// page-aligned accessible memory, within a reserved mapping of
    /// `mapping_size` bytes. `accessible_size` and `mapping_size` must be
    /// native page-size multiples.
    #[cfg(not(target_os = "windows"))]
    pub fn accessible_reserved(
        accessible_size: usize,
        mapping_size: usize,
    ) -> Result<Self, String> {
        let page_size = region::page::size();
        assert_le!(accessible_size, mapping_size);
        assert_eq!(mapping_size & (page_size - 1), 0);
        assert_eq!(accessible_size & (page_size - 1), 0);

        // Mmap may return EINVAL if the size is zero, so just special-case
        // that.
        if mapping_size == 0 {
            return Ok(Self::new());
        }

        // Reserve the mapping size. PROT_NONE reservations don't count
        // against commit charge; pages are committed by make_accessible.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mapping_size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr as isize == -1_isize {
            return Err(io::Error::last_os_error().to_string());
        }

        let result = Self {
            ptr: ptr as usize,
            total_size: mapping_size,
        };

        if accessible_size != 0 {
            // Commit the accessible size.
            result.make_accessible(0, accessible_size)?;
        }

        Ok(result)
    }

    /// Create a new `Mmap` pointing to `accessible_size` bytes of
    /// page-aligned accessible memory, within a reserved mapping of
    /// `mapping_size` bytes. `accessible_size` and `mapping_size` must be
    /// native page-size multiples.
    #[cfg(target_os = "windows")]
    pub fn accessible_reserved(
        accessible_size: usize,
        mapping_size: usize,
    ) -> Result<Self, String> {
        use winapi::um::memoryapi::VirtualAlloc;
        use winapi::um::winnt::{MEM_RESERVE, PAGE_NOACCESS};

        let page_size = region::page::size();
        assert_le!(accessible_size, mapping_size);
        assert_eq!(mapping_size & (page_size - 1), 0);
        assert_eq!(accessible_size & (page_size - 1), 0);

        // VirtualAlloc may return ERROR_INVALID_PARAMETER if the size is
        // zero, so just special-case that.
        if mapping_size == 0 {
            return Ok(Self::new());
        }

        // Reserve the mapping size.
        let ptr = unsafe { VirtualAlloc(ptr::null_mut(), mapping_size, MEM_RESERVE, PAGE_NOACCESS) };
        if ptr.is_null() {
            return Err(io::Error::last_os_error().to_string());
        }

        let result = Self {
            ptr: ptr as usize,
            total_size: mapping_size,
        };

        if accessible_size != 0 {
            // Commit the accessible size.
            result.make_accessible(0, accessible_size)?;
        }

        Ok(result)
    }

    /// Reserve `mapping_size` bytes and return the reservation together with
    /// the offset within it of the first `1 << alignment_log2`-aligned byte.
    /// The reservation is over-sized by the alignment, which is the only
    /// portable way to get an aligned base out of the OS allocators.
    pub fn aligned_reserved(
        mapping_size: usize,
        alignment_log2: u32,
    ) -> Result<(Self, usize), String> {
        let alignment = 1usize
            .checked_shl(alignment_log2)
            .ok_or_else(|| "alignment overflows the address space".to_string())?;
        let page_size = region::page::size();
        assert_eq!(alignment & (page_size - 1), 0);

        let total = mapping_size
            .checked_add(alignment)
            .ok_or_else(|| "aligned reservation overflows the address space".to_string())?;
        let mmap = Self::accessible_reserved(0, total)?;
        let aligned_offset = (alignment - (mmap.ptr & (alignment - 1))) & (alignment - 1);
        Ok((mmap, aligned_offset))
    }

    /// Make the memory starting at `start` and extending for `len` bytes
    /// accessible. `start` and `len` must be native page-size multiples and
    /// describe a range within `self`'s reserved memory. The caller
    /// serializes growth; the underlying page-protection change itself is a
    /// kernel-side operation.
    #[cfg(not(target_os = "windows"))]
    pub fn make_accessible(&self, start: usize, len: usize) -> Result<(), String> {
        let page_size = region::page::size();
        assert_eq!(start & (page_size - 1), 0);
        assert_eq!(len & (page_size - 1), 0);
        assert_le!(len, self.total_size);
        assert_le!(start, self.total_size - len);

        // Commit the accessible size.
        let ptr = self.ptr as *const u8;
        unsafe { region::protect(ptr.add(start), len, region::Protection::READ_WRITE) }
            .map_err(|e| e.to_string())
    }

    /// Make the memory starting at `start` and extending for `len` bytes
    /// accessible. `start` and `len` must be native page-size multiples and
    /// describe a range within `self`'s reserved memory.
    #[cfg(target_os = "windows")]
    pub fn make_accessible(&self, start: usize, len: usize) -> Result<(), String> {
        use winapi::ctypes::c_void;
        use winapi::um::memoryapi::VirtualAlloc;
        use winapi::um::winnt::{MEM_COMMIT, PAGE_READWRITE};
        let page_size = region::page::size();
        assert_eq!(start & (page_size - 1), 0);
        assert_eq!(len & (page_size - 1), 0);
        assert_le!(len, self.total_size);
        assert_le!(start, self.total_size - len);

        // Commit the accessible size.
        let ptr = self.ptr as *const u8;
        if unsafe {
            VirtualAlloc(
                ptr.add(start) as *mut c_void,
                len,
                MEM_COMMIT,
                PAGE_READWRITE,
            )
        }
        .is_null()
        {
            return Err(io::Error::last_os_error().to_string());
        }

        Ok(())
    }

    /// Make the memory starting at `start` and extending for `len` bytes
    /// inaccessible to both reads and writes. `start` and `len` must be
    /// native page-size multiples and describe a range within `self`'s
    /// reserved memory.
    pub fn make_inaccessible(&self, start: usize, len: usize) -> Result<(), String> {
        let page_size = region::page::size();
        assert_eq!(start & (page_size - 1), 0);
        assert_eq!(len & (page_size - 1), 0);
        assert_le!(len, self.total_size);
        assert_le!(start, self.total_size - len);

        let ptr = self.ptr as *const u8;
        unsafe { region::protect(ptr.add(start), len, region::Protection::NONE) }
            .map_err(|e| e.to_string())
    }

    /// Return the accessible prefix of the reservation as a slice.
    ///
    /// # Safety
    /// The first `len` bytes must have been made accessible, and the caller
    /// must not alias a concurrent mutable view.
    pub unsafe fn slice(&self, len: usize) -> &[u8] {
        slice::from_raw_parts(self.ptr as *const u8, len)
    }

    /// Return the allocated memory as a pointer to u8.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr as *const u8
    }

    /// Return the allocated memory as a mutable pointer to u8.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr as *mut u8
    }

    /// Return the length of the reservation.
    pub fn len(&self) -> usize {
        self.total_size
    }

    /// Return whether any memory has been reserved.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Mmap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Mmap {
    #[cfg(not(target_os = "windows"))]
    fn drop(&mut self) {
        if self.total_size != 0 {
            let r = unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.total_size) };
            assert_eq!(r, 0, "munmap failed: {}", io::Error::last_os_error());
        }
    }

    #[cfg(target_os = "windows")]
    fn drop(&mut self) {
        if self.len() != 0 {
            use winapi::ctypes::c_void;
            use winapi::um::memoryapi::VirtualFree;
            use winapi::um::winnt::MEM_RELEASE;
            let r = unsafe { VirtualFree(self.ptr as *mut c_void, 0, MEM_RELEASE) };
            assert_ne!(r, 0);
        }
    }
}

fn _assert() {
    fn _assert_send_sync<T: Send + Sync>() {}
    _assert_send_sync::<Mmap>();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_up_to_page_size() {
        assert_eq!(round_up_to_page_size(0, 4096), 0);
        assert_eq!(round_up_to_page_size(1, 4096), 4096);
        assert_eq!(round_up_to_page_size(4096, 4096), 4096);
        assert_eq!(round_up_to_page_size(4097, 4096), 8192);
    }

    #[test]
    fn reserve_then_commit() {
        let page_size = region::page::size();
        let mmap = Mmap::accessible_reserved(0, 16 * page_size).unwrap();
        mmap.make_accessible(page_size, page_size).unwrap();
        unsafe {
            let ptr = mmap.as_mut_ptr().add(page_size);
            ptr.write(0xa5);
            assert_eq!(ptr.read(), 0xa5);
        }
    }

    #[test]
    fn aligned_reservation_is_aligned() {
        let alignment_log2 = 24; // 16 MiB: cheap enough to exercise in a test
        let (mmap, offset) = Mmap::aligned_reserved(1 << 20, alignment_log2).unwrap();
        let aligned = mmap.as_ptr() as usize + offset;
        assert_eq!(aligned & ((1 << alignment_log2) - 1), 0);
    }
}
