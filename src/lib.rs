//! This crate implements a segregated-fit dynamic memory allocator operating
//! on a single contiguous, monotonically growing byte region.
//!
//!  - **The backing region is supplied by an application.** Anything that can
//!    hand out one contiguous run of bytes and extend it in place works: a
//!    `static` array, a memory-mapped reservation, a slice carved out of
//!    another allocator. See [`RegionSource`].
//!
//!  - **Free blocks are kept in a 47-way segregated directory** (geometric
//!    size classes below 1 KiB, fixed 800-byte bands above it), searched
//!    first-fit with LIFO reinsertion, so recently freed blocks are reused
//!    while they are still warm.
//!
//!  - **No boundary footers.** Each 8-byte header records the size of the
//!    physically preceding block, so backward coalescing is a single
//!    subtraction and the minimum block size stays at 24 bytes.
//!
//!  - **This crate supports `#![no_std]`.** The engine performs no I/O and
//!    never allocates from anything but its own region.
//!
//! # Examples
//!
//! ```rust
//! use segfit::{ArenaRegion, SegFit, CHUNK_SIZE};
//! use std::mem::MaybeUninit;
//!
//! // The region must be able to satisfy the initial carve.
//! let mut pool = vec![MaybeUninit::uninit(); CHUNK_SIZE + 64];
//!
//! let mut heap = SegFit::new(ArenaRegion::new(&mut pool)).unwrap();
//!
//! unsafe {
//!     let mut p1 = heap.allocate(8).unwrap().cast::<u64>();
//!     let mut p2 = heap.allocate(8).unwrap().cast::<u64>();
//!     *p1.as_mut() = 42;
//!     *p2.as_mut() = 56;
//!     assert_eq!(*p1.as_ref(), 42);
//!     assert_eq!(*p2.as_ref(), 56);
//!     heap.deallocate(p1.cast());
//!     heap.deallocate(p2.cast());
//! }
//! ```
#![no_std]

mod region;
mod seg;
pub use self::{
    region::{ArenaRegion, RegionSource},
    seg::{OutOfMemory, SegFit, CHUNK_SIZE, GRANULARITY, MIN_BLOCK_SIZE, NUM_BUCKETS},
};

#[cfg(unix)]
pub use self::region::MmapRegion;

#[cfg(test)]
extern crate std;
