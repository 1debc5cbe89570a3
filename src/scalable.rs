//! Dynamically growing allocator composed of regions.
//!
//! A [`ScalableAllocator`] owns an ordered chain of regions. Allocation
//! scans the chain and, when every region misses, doubles the target region
//! size (capped at [`MAX_BLOCK_SIZE`](crate::MAX_BLOCK_SIZE)) and appends a
//! fresh region, so `malloc` never fails for in-range requests. Freeing the
//! last live byte of a region retires the whole region, provided it is not
//! the only one left.
//!
//! The handle is cheap to clone and deliberately `!Send`: one allocator
//! serves one logical thread, which is what lets the region indices skip
//! locking altogether.

use std::cell::{Ref, RefCell};
use std::io::{self, Read};
use std::rc::Rc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::buf::Buf;
use crate::region::Region;
use crate::{source, MAX_BLOCK_SIZE};

/// A growing chain of regions behind one allocator surface.
///
/// Cloning shares the underlying state, which lets buffer sets such as
/// [`RecyclableBuffers`](crate::RecyclableBuffers) keep a handle to the
/// allocator that produced their segments.
///
/// # Example
///
/// ```rust
/// use bufarena::ScalableAllocator;
///
/// let alloc = ScalableAllocator::new(1024);
/// let a = alloc.malloc(400);
/// let b = alloc.malloc(400);
/// // A third allocation no longer fits; the allocator grows on its own.
/// let c = alloc.malloc(400);
/// assert_eq!(alloc.children().len(), 2);
/// for buf in [a, b, c] {
///     assert!(alloc.free(buf));
/// }
/// ```
#[derive(Clone)]
pub struct ScalableAllocator {
    inner: Rc<RefCell<Inner>>,
}

struct Inner {
    children: Vec<Region>,
    total_malloc: u64,
    total_free: u64,
    size: usize,
    child_size: usize,
}

impl ScalableAllocator {
    /// Creates an allocator with one region of `initial_size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `initial_size` is zero.
    #[must_use]
    pub fn new(initial_size: usize) -> Self {
        assert!(initial_size > 0, "initial region size must be non-zero");
        let region = source::get_region(initial_size);
        Self {
            inner: Rc::new(RefCell::new(Inner {
                size: region.size(),
                children: vec![region],
                total_malloc: 0,
                total_free: 0,
                child_size: initial_size,
            })),
        }
    }

    /// Allocates `n` bytes.
    ///
    /// Requests up to [`MAX_BLOCK_SIZE`] always succeed: when no existing
    /// region fits, the allocator appends a fresh one large enough by
    /// construction. Larger requests bypass the regions entirely and return
    /// heap-owned memory that [`free`](Self::free) will release while
    /// reporting `false`. `malloc(0)` returns an empty owned buffer.
    #[must_use]
    pub fn malloc(&self, n: usize) -> Buf {
        if n == 0 {
            return Buf::empty();
        }
        if n > MAX_BLOCK_SIZE {
            return Buf::from(vec![0u8; n]);
        }
        let mut inner = self.inner.borrow_mut();
        inner.total_malloc += n as u64;
        if let Some(buf) = inner.children.iter_mut().find_map(|c| c.malloc(n)) {
            return buf;
        }
        inner.grow(n);
        let region = inner.children.last_mut().unwrap();
        // The fresh region holds at least n free bytes.
        region.malloc(n).unwrap()
    }

    /// Previews an `n`-byte buffer without reserving it.
    ///
    /// The buffer aliases free space: it stays valid only until the next
    /// allocation on this allocator and must not be passed to
    /// [`free`](Self::free). The allocator still grows if no region can
    /// show a window of `n` bytes. Zero-size and bypass-range requests
    /// return `None`.
    #[must_use]
    pub fn borrow(&self, n: usize) -> Option<Buf> {
        if n == 0 || n > MAX_BLOCK_SIZE {
            return None;
        }
        let mut inner = self.inner.borrow_mut();
        if let Some(buf) = inner.children.iter().find_map(|c| c.find(n)) {
            return Some(buf);
        }
        inner.grow(n);
        inner.children.last().unwrap().find(n)
    }

    /// Returns a buffer to the allocator.
    ///
    /// The owning region is identified by address range. Returns `false`
    /// for buffers no region owns — bypass allocations and external
    /// buffers — after releasing their heap memory. A region left entirely
    /// free is retired unless it is the last one.
    pub fn free(&self, buf: Buf) -> bool {
        let Some((addr, len)) = buf.pooled_parts() else {
            return false;
        };
        if len == 0 {
            return false;
        }
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        for i in 0..inner.children.len() {
            let child = &mut inner.children[i];
            let Some(start) = addr.checked_sub(child.start_addr()) else {
                continue;
            };
            if start < child.size() && child.free(start, len) {
                let fully_free = child.free_size() == child.size();
                inner.total_free += len as u64;
                if fully_free && inner.children.len() > 1 {
                    let region = inner.children.remove(i);
                    inner.size -= region.size();
                    debug!(size = region.size(), "retiring empty region");
                    region.recycle();
                }
                return true;
            }
        }
        false
    }

    /// Keeps the first `keep` bytes of `buf` and frees the rest.
    pub fn free_rest(&self, buf: &mut Buf, keep: usize) {
        if keep >= buf.len() {
            return;
        }
        let tail = buf.split_off(keep);
        self.free(tail);
    }

    /// Allocates `n` bytes and fills them with a single `read` call.
    ///
    /// A short read frees the unused tail and shortens the buffer; a read
    /// error frees the whole allocation before propagating.
    ///
    /// # Errors
    ///
    /// Whatever the reader reports.
    pub fn read_from<R: Read + ?Sized>(&self, reader: &mut R, n: usize) -> io::Result<Buf> {
        let mut buf = self.malloc(n);
        match reader.read(&mut buf) {
            Ok(filled) => {
                self.free_rest(&mut buf, filled);
                Ok(buf)
            }
            Err(err) => {
                self.free(buf);
                Err(err)
            }
        }
    }

    /// Async flavor of [`read_from`](Self::read_from).
    ///
    /// Allocator state is touched strictly before and after awaiting the
    /// reader, never across the suspension point.
    ///
    /// # Errors
    ///
    /// Whatever the reader reports.
    pub async fn async_read_from<R>(&self, reader: &mut R, n: usize) -> io::Result<Buf>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buf = self.malloc(n);
        match reader.read(&mut buf).await {
            Ok(filled) => {
                self.free_rest(&mut buf, filled);
                Ok(buf)
            }
            Err(err) => {
                self.free(buf);
                Err(err)
            }
        }
    }

    /// Retires every region and empties the chain.
    ///
    /// Outstanding buffers become invalid; the allocator itself stays
    /// usable and will grow again on the next allocation.
    pub fn recycle(&self) {
        let mut inner = self.inner.borrow_mut();
        for region in inner.children.drain(..) {
            region.recycle();
        }
        inner.size = 0;
    }

    /// Total bytes handed out so far.
    #[must_use]
    pub fn total_malloc(&self) -> u64 {
        self.inner.borrow().total_malloc
    }

    /// Total bytes returned so far.
    #[must_use]
    pub fn total_free(&self) -> u64 {
        self.inner.borrow().total_free
    }

    /// Read-only view of the live regions, in insertion order.
    ///
    /// The borrow must be released before the next allocator call.
    #[must_use]
    pub fn children(&self) -> Ref<'_, [Region]> {
        Ref::map(self.inner.borrow(), |inner| inner.children.as_slice())
    }
}

impl Default for ScalableAllocator {
    fn default() -> Self {
        Self::new(crate::DEFAULT_BUF_SIZE)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for region in self.children.drain(..) {
            region.recycle();
        }
    }
}

impl std::fmt::Debug for ScalableAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("ScalableAllocator")
            .field("children", &inner.children.len())
            .field("size", &inner.size)
            .field("total_malloc", &inner.total_malloc)
            .field("total_free", &inner.total_free)
            .finish()
    }
}

impl Inner {
    /// Doubles the next region size until it covers `n` (capped at
    /// [`MAX_BLOCK_SIZE`]) and appends a region of that size.
    fn grow(&mut self, n: usize) {
        while self.child_size < MAX_BLOCK_SIZE {
            self.child_size <<= 1;
            if self.child_size >= n {
                break;
            }
        }
        let region = source::get_region(self.child_size);
        debug!(
            size = self.child_size,
            children = self.children.len() + 1,
            "adding region"
        );
        self.size += region.size();
        self.children.push(region);
    }
}
