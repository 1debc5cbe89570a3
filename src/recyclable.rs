//! Scatter-gather buffer with bulk release.
//!
//! A [`RecyclableBuffers`] accumulates segments allocated from a
//! [`ScalableAllocator`] and returns them all in one
//! [`recycle`](RecyclableBuffers::recycle) call. In selective mode only the
//! segments it recorded are returned, so allocator-owned and borrowed
//! segments can share one buffer.

use std::ops::{Deref, DerefMut};

use crate::buffers::Buffers;
use crate::scalable::ScalableAllocator;

/// A [`Buffers`] whose segments are tracked for bulk release.
///
/// Dereferences to [`Buffers`], so the whole container surface (readers,
/// `push`, `write_to`, ...) is available directly.
///
/// # Example
///
/// ```rust
/// use bufarena::{RecyclableBuffers, ScalableAllocator};
///
/// let alloc = ScalableAllocator::new(4096);
/// let mut set = RecyclableBuffers::new(alloc.clone());
/// set.next_n(100).copy_from_slice(&[1u8; 100]);
/// set.next_n(50).copy_from_slice(&[2u8; 50]);
/// set.recycle();
/// assert_eq!(alloc.total_malloc(), alloc.total_free());
/// ```
pub struct RecyclableBuffers {
    allocator: ScalableAllocator,
    buffers: Buffers,
    /// Segment indices to release on recycle; `None` releases everything.
    recycle_indexes: Option<Vec<usize>>,
}

impl RecyclableBuffers {
    /// Creates an empty set backed by `allocator`.
    #[must_use]
    pub fn new(allocator: ScalableAllocator) -> Self {
        Self {
            allocator,
            buffers: Buffers::new(),
            recycle_indexes: None,
        }
    }

    /// Switches to selective mode: from now on only recorded segments are
    /// released by [`recycle`](Self::recycle). `cap` pre-sizes the index
    /// list. A no-op when selective mode is already on.
    pub fn init_recycle_indexes(&mut self, cap: usize) {
        if self.recycle_indexes.is_none() {
            self.recycle_indexes = Some(Vec::with_capacity(cap));
        }
    }

    /// The backing allocator.
    #[must_use]
    pub fn allocator(&self) -> &ScalableAllocator {
        &self.allocator
    }

    /// Replaces the backing allocator for future allocations.
    pub fn set_allocator(&mut self, allocator: ScalableAllocator) {
        self.allocator = allocator;
    }

    /// Allocates `size` bytes, appends them as a new segment and returns
    /// the segment for writing.
    pub fn next_n(&mut self, size: usize) -> &mut [u8] {
        let buf = self.allocator.malloc(size);
        if let Some(indexes) = &mut self.recycle_indexes {
            indexes.push(self.buffers.count());
        }
        self.buffers.push_one(buf);
        self.buffers.last_mut().unwrap().as_mut_slice()
    }

    /// Appends an externally provided segment and records it for release.
    ///
    /// On recycle the allocator will not recognize the segment and report
    /// `false`; the memory is released by dropping the owned buffer.
    pub fn add_external(&mut self, b: Vec<u8>) {
        if let Some(indexes) = &mut self.recycle_indexes {
            indexes.push(self.buffers.count());
        }
        self.buffers.push_one(b);
    }

    /// Releases the recorded segments — every segment unless selective
    /// mode restricted the set — and empties the buffer.
    ///
    /// Recycling an empty set is a no-op.
    pub fn recycle(&mut self) {
        if let Some(indexes) = &mut self.recycle_indexes {
            for index in indexes.drain(..) {
                let segment = self.buffers.take_segment(index);
                self.allocator.free(segment);
            }
        } else {
            for segment in self.buffers.take_all() {
                self.allocator.free(segment);
            }
        }
        self.buffers.reset();
    }
}

impl Deref for RecyclableBuffers {
    type Target = Buffers;

    fn deref(&self) -> &Self::Target {
        &self.buffers
    }
}

impl DerefMut for RecyclableBuffers {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffers
    }
}

impl std::fmt::Debug for RecyclableBuffers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecyclableBuffers")
            .field("size", &self.buffers.size())
            .field("count", &self.buffers.count())
            .field("selective", &self.recycle_indexes.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycle_returns_every_segment() {
        let alloc = ScalableAllocator::new(4096);
        let mut set = RecyclableBuffers::new(alloc.clone());
        set.next_n(128).fill(1);
        set.next_n(64).fill(2);
        assert_eq!(set.size(), 192);
        assert_eq!(set.count(), 2);

        set.recycle();
        assert_eq!(set.size(), 0);
        assert_eq!(set.count(), 0);
        assert_eq!(alloc.total_malloc(), alloc.total_free());
    }

    #[test]
    fn recycle_on_empty_set_is_a_noop() {
        let alloc = ScalableAllocator::new(1024);
        let mut set = RecyclableBuffers::new(alloc.clone());
        set.recycle();
        set.recycle();
        assert_eq!(set.size(), 0);
        assert_eq!(alloc.total_free(), 0);
    }

    #[test]
    fn selective_mode_mixes_external_segments() {
        let alloc = ScalableAllocator::new(4096);
        let mut set = RecyclableBuffers::new(alloc.clone());
        set.init_recycle_indexes(4);

        set.next_n(128).fill(1);
        set.add_external(vec![9u8; 32]);
        set.next_n(64).fill(3);
        assert_eq!(set.count(), 3);
        assert_eq!(set.size(), 128 + 32 + 64);

        set.recycle();
        assert_eq!(set.size(), 0);
        assert_eq!(set.count(), 0);
        // Both allocator segments came back; the external one was dropped.
        assert_eq!(alloc.total_free(), 128 + 64);
        assert_eq!(alloc.total_malloc(), alloc.total_free());
    }

    #[test]
    fn selective_mode_skips_unrecorded_segments() {
        let alloc = ScalableAllocator::new(4096);
        let mut set = RecyclableBuffers::new(alloc.clone());
        set.init_recycle_indexes(2);

        set.next_n(100).fill(1);
        // Pushed behind the index list's back: not released through the
        // allocator on recycle.
        set.push_one(vec![5u8; 40]);
        set.next_n(50).fill(2);

        set.recycle();
        assert_eq!(alloc.total_free(), 150);
        assert_eq!(set.count(), 0);
    }

    #[test]
    fn contents_survive_until_recycle() {
        let alloc = ScalableAllocator::new(1024);
        let mut set = RecyclableBuffers::new(alloc.clone());
        set.next_n(4).copy_from_slice(&[1, 2, 3, 4]);
        set.next_n(2).copy_from_slice(&[5, 6]);
        assert_eq!(set.to_bytes(), vec![1, 2, 3, 4, 5, 6]);

        let mut out = Vec::new();
        let mut reader = set.reader();
        std::io::Read::read_to_end(&mut reader, &mut out).unwrap();
        assert_eq!(out, vec![1, 2, 3, 4, 5, 6]);
        set.recycle();
        assert_eq!(alloc.total_malloc(), alloc.total_free());
    }

    #[test]
    fn allocator_handle_is_shared() {
        let alloc = ScalableAllocator::new(1024);
        let mut set = RecyclableBuffers::new(alloc.clone());
        set.next_n(10);
        assert_eq!(set.allocator().total_malloc(), 10);
        assert_eq!(alloc.total_malloc(), 10);
        set.recycle();
    }
}
