//! # bufarena
//!
//! Region-based byte-buffer allocation for long-running services that churn
//! through many short-to-medium lived buffers: media pipelines, protocol
//! framing, batch decoders. Buffers are carved out of large contiguous
//! regions, returned explicitly, and reclaimed in bulk, which keeps pressure
//! off the global allocator and keeps fragmentation under control.
//!
//! ## Features
//!
//! - **Best-fit free-region index**: a balanced search structure per region
//!   with O(log n) allocate, split and coalescing free
//! - **Scalable allocation**: a chain of regions that doubles on demand (up
//!   to [`MAX_BLOCK_SIZE`]) and drops regions once they fall entirely free
//! - **Buddy allocation**: a fixed power-of-two pool with an implicit-tree
//!   representation, internally synchronized and process-wide poolable
//! - **Recyclable buffer sets**: scatter-gather buffers whose segments are
//!   tracked and released back to their allocator in one call
//! - **Scatter-gather I/O**: a multi-segment byte container with a
//!   sequential reader (big-endian fields, LEB128, skip/unread)
//! - **Both Sync and Async read paths**: fill freshly allocated buffers from
//!   `std::io::Read` or `tokio::io::AsyncRead` sources
//!
//! ## Example
//!
//! ```rust
//! use bufarena::ScalableAllocator;
//!
//! let alloc = ScalableAllocator::new(1024);
//!
//! // Allocate a buffer; it stays valid until returned to the allocator.
//! let mut buf = alloc.malloc(256);
//! buf[0] = 42;
//! assert_eq!(buf.len(), 256);
//!
//! assert!(alloc.free(buf));
//! assert_eq!(alloc.total_malloc(), alloc.total_free());
//! ```
//!
//! ## Bulk release
//!
//! ```rust
//! use bufarena::{RecyclableBuffers, ScalableAllocator};
//!
//! let alloc = ScalableAllocator::new(4096);
//! let mut set = RecyclableBuffers::new(alloc.clone());
//!
//! set.next_n(128).fill(7);
//! set.next_n(64).fill(9);
//! assert_eq!(set.size(), 192);
//!
//! // Every tracked segment goes back to the allocator at once.
//! set.recycle();
//! assert_eq!(set.size(), 0);
//! assert_eq!(alloc.total_malloc(), alloc.total_free());
//! ```
//!
//! ## Threading contract
//!
//! A [`ScalableAllocator`] (and everything layered on it) lives on one
//! logical thread; the handle is intentionally `!Send`. The one exception is
//! [`Buddy`], which is shared by design and guards its state with a mutex.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(unsafe_op_in_unsafe_fn)]

mod buddy;
mod buf;
mod buffers;
mod reader;
mod recyclable;
mod region;
mod scalable;
mod source;

#[cfg(not(feature = "twotree"))]
mod treap;
#[cfg(not(feature = "twotree"))]
pub use treap::FreeIndex;

#[cfg(feature = "twotree")]
mod twotree;
#[cfg(feature = "twotree")]
pub use twotree::FreeIndex;

pub use buddy::{Buddy, BuddyError};
pub use buf::Buf;
pub use buffers::Buffers;
pub use reader::BufferReader;
pub use recyclable::RecyclableBuffers;
pub use region::Region;
pub use scalable::ScalableAllocator;

/// Largest request served from a region of a [`ScalableAllocator`] (4 MiB).
///
/// Requests above this size bypass the region machinery and are backed by a
/// plain heap allocation that no region owns.
pub const MAX_BLOCK_SIZE: usize = 1 << 22;

/// Capacity in bytes of a default [`Buddy`] pool (512 MiB).
pub const BUDDY_SIZE: usize = MAX_BLOCK_SIZE << 7;

/// Log2 of the buddy allocation unit: one unit is `1 << MIN_POWER_OF2`
/// (1 KiB) bytes.
pub const MIN_POWER_OF2: u32 = 10;

/// Size of the pooled default region (16 KiB).
pub const DEFAULT_BUF_SIZE: usize = 1 << 14;
