//! Fixed-capacity buddy allocator over a power-of-two byte pool.
//!
//! The pool is divided into 1 KiB units ([`MIN_POWER_OF2`]) and managed by a
//! complete binary tree stored flat: `longests[i]` holds the largest fully
//! free span, in units, reachable under node `i`. Allocation descends toward
//! a fitting child in O(log n); free walks back up, restoring spans and
//! re-merging buddies whose halves are both free.
//!
//! Unlike the other allocators in this crate, a [`Buddy`] is explicitly
//! thread-safe: one instance backs many regions at once, so `alloc` and
//! `free` serialize on an internal mutex.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, OnceLock};

use thiserror::Error;

use crate::{BUDDY_SIZE, MIN_POWER_OF2};

/// One buddy allocation unit in bytes.
const UNIT: usize = 1 << MIN_POWER_OF2;

/// Errors reported by [`Buddy::alloc`] and [`Buddy::free`].
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum BuddyError {
    /// The request was malformed: a zero-byte allocation or an offset
    /// outside the pool.
    #[error("buddy: invalid parameter")]
    InvalidParameter,
    /// No free block of the required size exists ([`Buddy::alloc`]), or the
    /// offset does not match a live allocation ([`Buddy::free`]).
    #[error("buddy: can't find block")]
    NotFound,
}

/// A fixed-capacity power-of-two allocator.
///
/// Offsets returned by [`alloc`](Self::alloc) count units of
/// `1 << MIN_POWER_OF2` bytes from the start of the pool. The pool memory
/// is zero-filled on creation and aligned for huge-page placement.
///
/// # Example
///
/// ```rust
/// use bufarena::Buddy;
///
/// let buddy = Buddy::with_capacity(1 << 16);
/// let offset = buddy.alloc(1000)?; // rounds up to one 1 KiB unit
/// buddy.free(offset)?;
/// assert_eq!(buddy.largest_free_units(), buddy.unit_count());
/// # Ok::<(), bufarena::BuddyError>(())
/// ```
pub struct Buddy {
    /// Pool capacity in units.
    units: usize,
    /// Largest free span under each node of the implicit tree.
    longests: Mutex<Box<[u32]>>,
    memory: NonNull<u8>,
    capacity: usize,
}

// SAFETY: the pool pointer is only dereferenced through ranges handed out
// by alloc, and all tree state is behind the mutex.
unsafe impl Send for Buddy {}

// SAFETY: see Send; `alloc` and `free` take &self but serialize internally.
unsafe impl Sync for Buddy {}

impl Buddy {
    /// Huge-page friendly alignment for the backing pool.
    #[cfg(target_pointer_width = "64")]
    const fn alignment() -> usize {
        2 * 1024 * 1024
    }

    /// Huge-page friendly alignment for the backing pool.
    #[cfg(not(target_pointer_width = "64"))]
    const fn alignment() -> usize {
        4096
    }

    /// Creates a buddy with the default [`BUDDY_SIZE`] capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(BUDDY_SIZE)
    }

    /// Creates a buddy over a pool of `capacity` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is not a power of two of at least one unit.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two() && capacity >= UNIT,
            "buddy capacity must be a power of two of at least {UNIT} bytes"
        );
        let units = capacity >> MIN_POWER_OF2;
        let mut longests = vec![0u32; 2 * units - 1].into_boxed_slice();
        let mut node_size = 2 * units;
        for (i, longest) in longests.iter_mut().enumerate() {
            if (i + 1).is_power_of_two() {
                node_size /= 2;
            }
            *longest = u32::try_from(node_size).expect("unit count exceeds u32");
        }

        let layout = Layout::from_size_align(capacity, Self::alignment())
            .expect("invalid buddy pool layout");
        // SAFETY: layout has non-zero size and a power-of-two alignment
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let Some(memory) = NonNull::new(ptr) else {
            alloc::handle_alloc_error(layout);
        };

        Self {
            units,
            longests: Mutex::new(longests),
            memory,
            capacity,
        }
    }

    /// Number of allocation units in the pool.
    #[must_use]
    pub const fn unit_count(&self) -> usize {
        self.units
    }

    /// Stable address of the first pool byte.
    #[must_use]
    pub fn pool_start(&self) -> usize {
        self.memory.as_ptr() as usize
    }

    /// Largest currently free span in units; equals
    /// [`unit_count`](Self::unit_count) when the pool is entirely free.
    #[must_use]
    pub fn largest_free_units(&self) -> usize {
        self.longests.lock().unwrap()[0] as usize
    }

    /// Allocates `size` bytes, rounded up to a power-of-two number of
    /// units, and returns the unit offset of the block.
    ///
    /// # Errors
    ///
    /// [`BuddyError::InvalidParameter`] when `size` is zero,
    /// [`BuddyError::NotFound`] when no free block of the rounded size
    /// remains.
    pub fn alloc(&self, size: usize) -> Result<usize, BuddyError> {
        if size == 0 {
            return Err(BuddyError::InvalidParameter);
        }
        let want = size.div_ceil(UNIT).next_power_of_two();
        let mut longests = self.longests.lock().unwrap();
        if want > longests[0] as usize {
            return Err(BuddyError::NotFound);
        }
        // Descend toward any child that still fits, preferring the left.
        let mut index = 0usize;
        let mut node_size = self.units;
        while node_size != want {
            let left = left_child(index);
            index = if longests[left] as usize >= want {
                left
            } else {
                right_child(index)
            };
            node_size /= 2;
        }
        longests[index] = 0;
        let offset = (index + 1) * want - self.units;
        let mut i = index;
        while i != 0 {
            i = parent(i);
            longests[i] = longests[left_child(i)].max(longests[right_child(i)]);
        }
        Ok(offset)
    }

    /// Frees the allocation whose block starts at unit `offset`.
    ///
    /// The leaf at `offset` is walked upward until the allocated node is
    /// found; ancestors re-merge whenever both halves come back free.
    ///
    /// # Errors
    ///
    /// [`BuddyError::InvalidParameter`] for offsets outside the pool,
    /// [`BuddyError::NotFound`] when no allocation covers the offset.
    pub fn free(&self, offset: usize) -> Result<(), BuddyError> {
        if offset >= self.units {
            return Err(BuddyError::InvalidParameter);
        }
        let mut longests = self.longests.lock().unwrap();
        let mut node_size = 1usize;
        let mut index = offset + self.units - 1;
        while longests[index] != 0 {
            node_size *= 2;
            if index == 0 {
                return Err(BuddyError::NotFound);
            }
            index = parent(index);
        }
        longests[index] = u32::try_from(node_size).expect("unit count exceeds u32");
        while index != 0 {
            index = parent(index);
            node_size *= 2;
            let left = longests[left_child(index)];
            let right = longests[right_child(index)];
            longests[index] = if (left + right) as usize == node_size {
                u32::try_from(node_size).expect("unit count exceeds u32")
            } else {
                left.max(right)
            };
        }
        Ok(())
    }

    /// Pointer to the pool byte at unit `offset`.
    ///
    /// # Safety
    ///
    /// `offset` must come from a live [`alloc`](Self::alloc) of at least
    /// `len` bytes, and the returned range must not be used after the
    /// matching [`free`](Self::free).
    #[cfg(feature = "buddy-backed")]
    pub(crate) unsafe fn carve(&self, offset: usize, len: usize) -> NonNull<u8> {
        let byte_offset = offset << MIN_POWER_OF2;
        debug_assert!(byte_offset + len <= self.capacity);
        // SAFETY: the caller keeps the range inside the pool
        unsafe { NonNull::new_unchecked(self.memory.as_ptr().add(byte_offset)) }
    }

    /// Checks out a shared buddy from the process-wide pool, creating one
    /// when the pool is empty.
    #[must_use]
    pub fn get() -> Arc<Buddy> {
        let mut pool = shared_pool().lock().unwrap();
        pool.pop().unwrap_or_else(|| Arc::new(Buddy::new()))
    }

    /// Returns a buddy to the process-wide pool.
    ///
    /// The buddy is not cleared: every `alloc` must have been paired with a
    /// `free` first, or the next checkout inherits the live allocations.
    pub fn put(buddy: Arc<Buddy>) {
        shared_pool().lock().unwrap().push(buddy);
    }
}

impl Default for Buddy {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Buddy {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.capacity, Self::alignment())
            .expect("invalid buddy pool layout");
        // SAFETY: memory was allocated with this exact layout
        unsafe { alloc::dealloc(self.memory.as_ptr(), layout) };
    }
}

impl std::fmt::Debug for Buddy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buddy")
            .field("capacity", &self.capacity)
            .field("units", &self.units)
            .field("largest_free_units", &self.largest_free_units())
            .finish_non_exhaustive()
    }
}

fn shared_pool() -> &'static Mutex<Vec<Arc<Buddy>>> {
    static POOL: OnceLock<Mutex<Vec<Arc<Buddy>>>> = OnceLock::new();
    POOL.get_or_init(|| Mutex::new(Vec::new()))
}

/// Allocates `size` bytes from a pooled buddy, trying every pooled instance
/// before growing the pool with a fresh one.
///
/// The caller guarantees `size < BUDDY_SIZE`, so a fresh buddy always
/// satisfies the request.
#[cfg(feature = "buddy-backed")]
pub(crate) fn allocate_pooled(size: usize) -> (Arc<Buddy>, usize) {
    {
        let pool = shared_pool().lock().unwrap();
        for buddy in pool.iter() {
            if let Ok(offset) = buddy.alloc(size) {
                return (Arc::clone(buddy), offset);
            }
        }
    }
    let fresh = Arc::new(Buddy::new());
    let offset = fresh
        .alloc(size)
        .expect("fresh buddy satisfies any sub-pool request");
    tracing::trace!(capacity = BUDDY_SIZE, "growing buddy pool");
    shared_pool().lock().unwrap().push(Arc::clone(&fresh));
    (fresh, offset)
}

const fn left_child(index: usize) -> usize {
    2 * index + 1
}

const fn right_child(index: usize) -> usize {
    2 * index + 2
}

const fn parent(index: usize) -> usize {
    (index + 1) / 2 - 1
}
