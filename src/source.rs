//! Region construction and reclamation.
//!
//! `get_region` is the single place a [`Region`](crate::Region) comes from;
//! the backing strategy is chosen at build time:
//!
//! - default: heap slabs, with process-wide pools for the three canonical
//!   region sizes so hot allocators stop hitting the heap entirely
//! - `buddy-backed`: slabs below [`BUDDY_SIZE`](crate::BUDDY_SIZE) are
//!   carved out of shared [`Buddy`](crate::Buddy) pools
//! - `mmap` (unix): slabs come from anonymous private page mappings, with
//!   transparent-huge-page advice on Linux
//!
//! Callers never observe which variant is active: every path returns a
//! fully initialized region.

use crate::region::{Region, Slab};

#[cfg(not(any(feature = "mmap", feature = "buddy-backed")))]
use std::sync::{Mutex, OnceLock};

#[cfg(not(any(feature = "mmap", feature = "buddy-backed")))]
use crate::{DEFAULT_BUF_SIZE, MIN_POWER_OF2};

/// Hands out a ready-to-use region of exactly `size` bytes.
pub(crate) fn get_region(size: usize) -> Region {
    build_region(size)
}

/// Heap slab shared by every build variant.
fn heap_slab(size: usize) -> Slab {
    Slab::Heap(vec![0u8; size].into_boxed_slice())
}

// --- default: pooled heap regions ---------------------------------------

#[cfg(not(any(feature = "mmap", feature = "buddy-backed")))]
const SMALL_BUF_SIZE: usize = 1 << MIN_POWER_OF2;
#[cfg(not(any(feature = "mmap", feature = "buddy-backed")))]
const MID_BUF_SIZE: usize = 1 << (MIN_POWER_OF2 + 2);

#[cfg(not(any(feature = "mmap", feature = "buddy-backed")))]
fn pool_for(size: usize) -> Option<&'static Mutex<Vec<Region>>> {
    static POOL_DEFAULT: OnceLock<Mutex<Vec<Region>>> = OnceLock::new();
    static POOL_SMALL: OnceLock<Mutex<Vec<Region>>> = OnceLock::new();
    static POOL_MID: OnceLock<Mutex<Vec<Region>>> = OnceLock::new();
    let cell = match size {
        DEFAULT_BUF_SIZE => &POOL_DEFAULT,
        SMALL_BUF_SIZE => &POOL_SMALL,
        MID_BUF_SIZE => &POOL_MID,
        _ => return None,
    };
    Some(cell.get_or_init(|| Mutex::new(Vec::new())))
}

#[cfg(not(any(feature = "mmap", feature = "buddy-backed")))]
fn build_region(size: usize) -> Region {
    if let Some(pool) = pool_for(size) {
        if let Some(mut region) = pool.lock().unwrap().pop() {
            region.reinit();
            return region;
        }
    }
    Region::new(heap_slab(size), size)
}

#[cfg(not(any(feature = "mmap", feature = "buddy-backed")))]
pub(crate) fn reclaim(region: Region) {
    if let Some(pool) = pool_for(region.size()) {
        pool.lock().unwrap().push(region);
    }
}

// --- buddy-backed regions ------------------------------------------------

#[cfg(feature = "buddy-backed")]
fn build_region(size: usize) -> Region {
    if size < crate::BUDDY_SIZE && size > 0 {
        let (buddy, offset_units) = crate::buddy::allocate_pooled(size);
        // SAFETY: the offset covers a live allocation of at least `size`
        // bytes, released only by the slab's drop
        let ptr = unsafe { buddy.carve(offset_units, size) };
        return Region::new(
            Slab::Carved {
                buddy,
                ptr,
                offset_units,
            },
            size,
        );
    }
    Region::new(plain_slab(size), size)
}

#[cfg(feature = "buddy-backed")]
pub(crate) fn reclaim(region: Region) {
    drop(region);
}

// --- page-mapped regions -------------------------------------------------

#[cfg(all(feature = "mmap", not(feature = "buddy-backed")))]
fn build_region(size: usize) -> Region {
    Region::new(plain_slab(size), size)
}

#[cfg(all(feature = "mmap", not(feature = "buddy-backed")))]
pub(crate) fn reclaim(region: Region) {
    drop(region);
}

/// Page-mapped slab with a heap fallback when the mapping is refused.
#[cfg(all(feature = "mmap", unix))]
fn plain_slab(size: usize) -> Slab {
    match map_anonymous(size) {
        Some(ptr) => Slab::Mapped { ptr, len: size },
        None => heap_slab(size),
    }
}

#[cfg(all(any(feature = "mmap", feature = "buddy-backed"), not(all(feature = "mmap", unix))))]
fn plain_slab(size: usize) -> Slab {
    heap_slab(size)
}

/// Maps `size` bytes of zeroed, private, anonymous memory.
///
/// On Linux the mapping is advised toward transparent huge pages; that
/// advice is allowed to fail silently.
#[cfg(all(feature = "mmap", unix))]
fn map_anonymous(size: usize) -> Option<std::ptr::NonNull<u8>> {
    if size == 0 {
        return None;
    }
    // SAFETY: requesting a fresh anonymous mapping with no address hint
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return None;
    }
    #[cfg(target_os = "linux")]
    {
        // SAFETY: addr/size describe the mapping created above
        unsafe {
            libc::madvise(addr, size, libc::MADV_HUGEPAGE);
        }
    }
    std::ptr::NonNull::new(addr.cast())
}

#[cfg(all(feature = "mmap", unix))]
pub(crate) fn unmap(ptr: std::ptr::NonNull<u8>, len: usize) {
    // SAFETY: ptr/len came from map_anonymous and are unmapped exactly once
    unsafe {
        libc::munmap(ptr.as_ptr().cast(), len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_come_back_initialized() {
        let mut region = get_region(4096);
        assert_eq!(region.size(), 4096);
        assert_eq!(region.free_size(), 4096);
        assert!(region.malloc(4096).is_some());
        assert!(region.free(0, 4096));
        region.recycle();

        let region = get_region(4096);
        assert_eq!(region.free_size(), 4096);
        region.recycle();
    }

    #[cfg(not(any(feature = "mmap", feature = "buddy-backed")))]
    #[test]
    fn canonical_sizes_are_pooled() {
        let region = get_region(crate::DEFAULT_BUF_SIZE);
        let addr = region.start_addr();
        region.recycle();
        // The pool hands the same slab back out.
        let region = get_region(crate::DEFAULT_BUF_SIZE);
        assert_eq!(region.start_addr(), addr);
        assert_eq!(region.free_size(), crate::DEFAULT_BUF_SIZE);
        region.recycle();
    }

    #[test]
    fn odd_sizes_work() {
        let mut region = get_region(3000);
        assert_eq!(region.size(), 3000);
        assert!(region.malloc(3000).is_some());
        assert!(region.malloc(1).is_none());
        assert!(region.free(0, 3000));
        region.recycle();
    }
}
