//! The segregated-fit allocation engine.
use core::{fmt, mem, ptr::NonNull};

use crate::region::RegionSource;

mod bucket;
use self::bucket::{bucket_of, next_pow2};

/// The allocation granularity, which is also the alignment guaranteed for
/// every returned payload pointer.
pub const GRANULARITY: usize = 8;

/// Size of the in-band header preceding every block.
const HEADER_SIZE: u32 = mem::size_of::<BlockHdr>() as u32;

/// The minimum whole-block size: one header plus the two list links that
/// overlay the payload while the block is free.
pub const MIN_BLOCK_SIZE: u32 = 24;

/// Number of bucket heads in the segregated directory.
pub const NUM_BUCKETS: usize = 47;

/// Bytes requested from the region when the heap is first carved.
pub const CHUNK_SIZE: usize = 58176;

/// Bytes requested from the region each time no fit is found.
const EXTEND_SIZE: usize = 4400 * 8;

/// Requests classifying at or above this bucket are served by scanning the
/// bucket heads rear-to-front. Tuning constant, not a semantic threshold.
const REAR_SCAN_BUCKET: usize = 44;

/// The bit of [`BlockHdr::size`] indicating whether the block is used.
const SIZE_USED: u32 = 0b1;
/// The bits of [`BlockHdr::size`] representing the size. Sizes are multiples
/// of [`GRANULARITY`], so the low three bits are flag space.
const SIZE_MASK: u32 = !0b111;

/// The header of a memory block.
///
/// There is no boundary footer: `prev_size` carries the full size of the
/// physically preceding block, so the backward probe during coalescing is a
/// single subtraction.
#[repr(C, align(8))]
#[derive(Debug)]
struct BlockHdr {
    /// The size of the whole memory block, including this header.
    /// `bit[0]` ([`SIZE_USED`]) marks the block used.
    size: u32,
    /// The size of the whole block immediately preceding this one in address
    /// order. Zero only in the prologue, which is never probed past.
    prev_size: u32,
}

impl BlockHdr {
    #[inline]
    fn size(&self) -> u32 {
        self.size & SIZE_MASK
    }

    #[inline]
    fn is_used(&self) -> bool {
        (self.size & SIZE_USED) != 0
    }

    /// Get the next block in address order.
    ///
    /// # Safety
    ///
    /// `self` must not be the epilogue.
    #[inline]
    unsafe fn next_phys_block(&self) -> NonNull<BlockHdr> {
        debug_assert_ne!(self.size(), 0);
        NonNull::new_unchecked((self as *const _ as *mut u8).add(self.size() as usize)).cast()
    }

    /// Get the previous block in address order.
    ///
    /// # Safety
    ///
    /// `self` must not be the prologue.
    #[inline]
    unsafe fn prev_phys_block(&self) -> NonNull<BlockHdr> {
        debug_assert_ne!(self.prev_size, 0);
        NonNull::new_unchecked((self as *const _ as *mut u8).sub(self.prev_size as usize)).cast()
    }
}

/// The header of a free memory block. The link pair overlays the first 16
/// payload bytes, which is what pins [`MIN_BLOCK_SIZE`] at 24.
#[repr(C)]
#[derive(Debug)]
struct FreeBlockHdr {
    common: BlockHdr,
    next_free: Option<NonNull<FreeBlockHdr>>,
    prev_free: Option<NonNull<FreeBlockHdr>>,
}

/// The header of a used memory block. The payload immediately follows.
#[repr(C)]
#[derive(Debug)]
struct UsedBlockHdr {
    common: BlockHdr,
}

/// The backing region refused to grow while the initial heap was being set
/// up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfMemory;

impl fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("byte region exhausted")
    }
}

#[cfg_attr(doc, svgbobdoc::transform)]
/// The segregated-fit heap.
///
/// # Data Structure Overview
///
/// <center>
/// ```svgbob
///   Directory                                                  NUM_BUCKETS = 47
///              ,------+------+------+-----+------+-----+----------+------,
///    buckets = |  [0] |  [1] |  [2] | ... |  [5] | [6] |   ...    | [46] |
///              +------+------+--+---+-----+------+-----+----------+------+
///     min size |  24  |  33  |  65  | ... | 513  |1025 | +800 ... |33025 |
///              '------+------+--+---+-----+------+-----+----------+------'
///                               |
/// ╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶|╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶
///   Free lists                  |
///                               |  LIFO, unordered
///             ,-----------------'
///             | ,---+---+-------,    ,---+---+-------,
///             '-+>O | O-+-------+----+>O |   |       |
///               +---+---'       |    +---+---'       |
///               |               |    |               |
///               '---------------'    '---------------'
///                   72 bytes             120 bytes
/// ╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶
///   Heap image, in address order
///
///    ,----------+------------------------------------------+----------,
///    | hdr(8:a) |    zero or more used and free blocks     | hdr(0:a) |
///    '----------+------------------------------------------+----------'
///    | prologue |                                          | epilogue |
/// ```
/// </center>
///
/// Every block starts with an 8-byte header holding its own size, a used
/// bit, and the size of the physically preceding block. The prologue and
/// epilogue are permanently used sentinels, so coalescing never has to ask
/// whether a neighbor exists.
///
/// # Properties
///
/// The heap image is bounded to what a 32-bit header can describe; the
/// region is never asked to shrink, and bytes are never returned to it.
#[derive(Debug)]
pub struct SegFit<S> {
    source: S,
    buckets: [Option<NonNull<FreeBlockHdr>>; NUM_BUCKETS],
    /// Total membership of all buckets. Fast-path zero test in `find_fit`.
    free_count: usize,
    prologue: NonNull<BlockHdr>,
}

// Safety: All block headers directly or indirectly referenced by a
//         particular instance of `SegFit` are logically owned by that
//         `SegFit` and have no interior mutability, so these are safe.
unsafe impl<S: Send> Send for SegFit<S> {}
unsafe impl<S: Sync> Sync for SegFit<S> {}

impl<S: RegionSource> SegFit<S> {
    /// Set up a heap over `source`.
    ///
    /// Carves the initial free block out of a single [`CHUNK_SIZE`] request
    /// and brackets it with the prologue and epilogue sentinels. Returns
    /// [`OutOfMemory`] if the source refuses the request.
    pub fn new(mut source: S) -> Result<Self, OutOfMemory> {
        // Safety: `CHUNK_SIZE` is a multiple of the granularity
        let base = unsafe { source.grow(CHUNK_SIZE) }.ok_or(OutOfMemory)?;
        debug_assert_eq!(base.as_ptr() as usize % GRANULARITY, 0);

        let mut heap = Self {
            source,
            buckets: [None; NUM_BUCKETS],
            free_count: 0,
            prologue: base.cast(),
        };

        let init_size = (CHUNK_SIZE as u32 - 2 * HEADER_SIZE) & SIZE_MASK;

        // Safety: the source handed us `CHUNK_SIZE` writable bytes at `base`
        unsafe {
            let mut prologue = heap.prologue;
            prologue.as_mut().size = HEADER_SIZE | SIZE_USED;
            prologue.as_mut().prev_size = 0;

            let mut init_block: NonNull<FreeBlockHdr> =
                NonNull::new_unchecked(base.as_ptr().add(HEADER_SIZE as usize)).cast();
            init_block.as_mut().common.size = init_size;
            init_block.as_mut().common.prev_size = HEADER_SIZE;

            let mut epilogue: NonNull<BlockHdr> =
                NonNull::new_unchecked(base.as_ptr().add((HEADER_SIZE + init_size) as usize))
                    .cast();
            epilogue.as_mut().size = SIZE_USED;
            epilogue.as_mut().prev_size = init_size;

            // The initial block classifies into the overflow bucket.
            heap.link_free_block(init_block);
        }

        Ok(heap)
    }

    /// Attempt to allocate `size` bytes.
    ///
    /// Returns the starting address of the payload on success, `None` when
    /// the backing region is exhausted. The returned pointer is always
    /// aligned to [`GRANULARITY`] bytes.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let asize = adjust_request(size)?;

        if let Some(block) = self.find_fit(asize) {
            // Safety: `find_fit` returned a linked free block of size >= asize
            return Some(unsafe { self.place(block, asize) });
        }

        // No fit. Grow the heap; every round coalesces with the free tail,
        // so the candidate block grows monotonically until it fits or the
        // region refuses.
        loop {
            let block = self.extend_heap(EXTEND_SIZE)?;
            if unsafe { block.as_ref() }.common.size() >= asize {
                // Safety: `extend_heap` linked a free block of a known size
                return Some(unsafe { self.place(block, asize) });
            }
        }
    }

    /// Release the allocation starting at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a live allocation previously returned by
    /// [`Self::allocate`] or [`Self::reallocate`] on this same heap.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        let mut block: NonNull<BlockHdr> =
            NonNull::new_unchecked(ptr.as_ptr().sub(HEADER_SIZE as usize)).cast();
        debug_assert!(block.as_ref().is_used());
        block.as_mut().size &= SIZE_MASK;
        self.coalesce(block);
    }

    /// Move the allocation at `ptr` into a block with at least `new_size`
    /// payload bytes, preserving the leading `min(old payload, new_size)`
    /// bytes of the contents.
    ///
    /// # Panics
    ///
    /// Panics when the heap cannot supply the new block. The old allocation
    /// is still live and untouched at that point.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::deallocate`].
    pub unsafe fn reallocate(&mut self, ptr: NonNull<u8>, new_size: usize) -> NonNull<u8> {
        let new_ptr = match self.allocate(new_size) {
            Some(p) => p,
            None => panic!("out of memory while reallocating {} bytes", new_size),
        };

        let block: NonNull<UsedBlockHdr> =
            NonNull::new_unchecked(ptr.as_ptr().sub(HEADER_SIZE as usize)).cast();
        let old_payload = (block.as_ref().common.size() - HEADER_SIZE) as usize;
        core::ptr::copy_nonoverlapping(
            ptr.as_ptr(),
            new_ptr.as_ptr(),
            old_payload.min(new_size),
        );

        self.deallocate(ptr);
        new_ptr
    }

    /// Segregated first-fit search for a free block of at least `asize`
    /// bytes. Does not modify the heap.
    fn find_fit(&self, asize: u32) -> Option<NonNull<FreeBlockHdr>> {
        if self.free_count == 0 {
            return None;
        }

        let bucket = bucket_of(asize);

        // With a single free block on the lists, or a request classifying
        // near the overflow bucket, any fit lives in the rear of the
        // directory; probing the heads back-to-front gets there fastest.
        if self.free_count == 1 || bucket >= REAR_SCAN_BUCKET {
            for idx in (bucket..NUM_BUCKETS).rev() {
                match self.buckets[idx] {
                    // Safety: bucket members are valid free block headers
                    Some(head) if unsafe { head.as_ref() }.common.size() >= asize => {
                        return Some(head);
                    }
                    _ => {}
                }
            }
            return None;
        }

        // First fit within the request's own bucket.
        let mut cursor = self.buckets[bucket];
        while let Some(block) = cursor {
            // Safety: bucket members are valid free block headers
            let hdr = unsafe { block.as_ref() };
            if hdr.common.size() >= asize {
                return Some(block);
            }
            cursor = hdr.next_free;
        }

        // Every member of a strictly larger bucket fits, so the first
        // non-empty head will do.
        self.buckets[bucket + 1..].iter().find_map(|&head| head)
    }

    /// Carve `asize` bytes out of `block`, splitting off the remainder when
    /// it can stand as a block of its own. Returns the payload pointer.
    ///
    /// # Safety
    ///
    /// `block` must be a free block on its bucket list with a size of at
    /// least `asize`.
    unsafe fn place(&mut self, block: NonNull<FreeBlockHdr>, asize: u32) -> NonNull<u8> {
        let old_size = block.as_ref().common.size();
        debug_assert!(old_size >= asize);
        let split_size = old_size - asize;

        self.unlink_free_block(block);

        let mut block = block.cast::<UsedBlockHdr>();
        if split_size >= MIN_BLOCK_SIZE {
            block.as_mut().common.size = asize | SIZE_USED;

            // The remainder becomes a free block of its own.
            let mut tail: NonNull<FreeBlockHdr> =
                NonNull::new_unchecked(block.cast::<u8>().as_ptr().add(asize as usize)).cast();
            tail.as_mut().common.size = split_size;
            tail.as_mut().common.prev_size = asize;

            // Both of the remainder's neighbors are used here, so no
            // coalescing can happen; the follower only needs its backward
            // link refreshed.
            let mut after = tail.as_ref().common.next_phys_block();
            after.as_mut().prev_size = split_size;

            self.link_free_block(tail);
        } else {
            // The remainder would be a splinter; keep it inside the block.
            block.as_mut().common.size |= SIZE_USED;
        }

        NonNull::new_unchecked(block.cast::<u8>().as_ptr().add(HEADER_SIZE as usize))
    }

    /// Merge `block` with whichever physical neighbors are free, then link
    /// the result into its bucket. Returns the merged block.
    ///
    /// The prologue and epilogue are permanently used, so both neighbor
    /// probes are unconditional.
    ///
    /// # Safety
    ///
    /// `block` must be a valid block header inside this heap, not on any
    /// bucket list, with its used bit already cleared and both size fields
    /// consistent with its neighbors.
    unsafe fn coalesce(&mut self, block: NonNull<BlockHdr>) -> NonNull<FreeBlockHdr> {
        let mut next = block.as_ref().next_phys_block();
        let mut prev = block.as_ref().prev_phys_block();
        let next_used = next.as_ref().is_used();
        let prev_used = prev.as_ref().is_used();

        let mut block = block;
        if next_used && prev_used {
            // Nothing adjacent to merge with.
        } else if prev_used {
            // Absorb the next block.
            self.unlink_free_block(next.cast());
            let merged = block.as_ref().size() + next.as_ref().size();
            let mut after = next.as_ref().next_phys_block();
            block.as_mut().size = merged;
            after.as_mut().prev_size = merged;
        } else if next_used {
            // Fold into the previous block.
            self.unlink_free_block(prev.cast());
            let merged = prev.as_ref().size() + block.as_ref().size();
            prev.as_mut().size = merged;
            next.as_mut().prev_size = merged;
            block = prev;
        } else {
            // Both neighbors are free.
            self.unlink_free_block(next.cast());
            self.unlink_free_block(prev.cast());
            let merged = prev.as_ref().size() + block.as_ref().size() + next.as_ref().size();
            let mut after = next.as_ref().next_phys_block();
            prev.as_mut().size = merged;
            after.as_mut().prev_size = merged;
            block = prev;
        }

        let block = block.cast::<FreeBlockHdr>();
        self.link_free_block(block);
        block
    }

    /// Grow the region by `bytes` and return the coalesced free block
    /// covering the new tail, or `None` when the source refuses.
    ///
    /// The old epilogue header is repurposed as the new block's header (its
    /// `prev_size` is already correct) and a fresh epilogue is written at
    /// the new tail, so the free block's size comes out at exactly `bytes`.
    fn extend_heap(&mut self, bytes: usize) -> Option<NonNull<FreeBlockHdr>> {
        debug_assert_eq!(bytes % GRANULARITY, 0);
        debug_assert!(bytes <= SIZE_MASK as usize);
        // Safety: `bytes` is a multiple of the granularity
        let fresh = unsafe { self.source.grow(bytes) }?;

        // Safety: the source guarantees the fresh bytes abut the old region,
        //         whose last 8 bytes are the epilogue header
        unsafe {
            let mut block: NonNull<BlockHdr> =
                NonNull::new_unchecked(fresh.as_ptr().sub(HEADER_SIZE as usize)).cast();
            debug_assert_eq!(block.as_ref().size(), 0);
            block.as_mut().size = bytes as u32 & SIZE_MASK;

            let mut epilogue = block.as_ref().next_phys_block();
            epilogue.as_mut().size = SIZE_USED;
            epilogue.as_mut().prev_size = block.as_ref().size();

            Some(self.coalesce(block))
        }
    }

    /// Push `block` onto the head of its size-classified bucket.
    ///
    /// Updates `FreeBlockHdr::{next_free, prev_free}` and nothing else.
    ///
    /// # Safety
    ///
    /// `block` must be a free block header owned by this heap that is not
    /// currently on any bucket list.
    unsafe fn link_free_block(&mut self, mut block: NonNull<FreeBlockHdr>) {
        let idx = bucket_of(block.as_ref().common.size());
        let old_head = mem::replace(&mut self.buckets[idx], Some(block));
        block.as_mut().next_free = old_head;
        block.as_mut().prev_free = None;
        if let Some(mut head) = old_head {
            head.as_mut().prev_free = Some(block);
        }
        self.free_count += 1;
    }

    /// Unlink `block` from its bucket in O(1) using the in-band link pair.
    ///
    /// # Safety
    ///
    /// `block` must currently be on the bucket list matching its size.
    unsafe fn unlink_free_block(&mut self, block: NonNull<FreeBlockHdr>) {
        let next_free = block.as_ref().next_free;
        let prev_free = block.as_ref().prev_free;

        if let Some(mut next_free) = next_free {
            next_free.as_mut().prev_free = prev_free;
        }

        if let Some(mut prev_free) = prev_free {
            prev_free.as_mut().next_free = next_free;
        } else {
            // The block was the bucket head.
            let idx = bucket_of(block.as_ref().common.size());
            debug_assert_eq!(self.buckets[idx], Some(block));
            self.buckets[idx] = next_free;
        }

        self.free_count -= 1;
    }
}

/// Compute the whole-block size for a request: smoothing heuristic, header
/// overhead, granularity rounding, minimum. `None` when the request cannot
/// be described by a 32-bit header.
fn adjust_request(size: usize) -> Option<u32> {
    let size: u32 = size.try_into().ok()?;

    // Requests in the top eighth of a power-of-two band are promoted to fill
    // the whole band, which raises reuse and coalescing hit-rates for common
    // allocation patterns. Skipped when the header would no longer fit.
    if size > 100 && size < 500 {
        let p = next_pow2(size);
        if size >= p - p / 8 && size + HEADER_SIZE <= p {
            return Some(p);
        }
    }

    let asize = size.checked_add(HEADER_SIZE + (GRANULARITY as u32 - 1))? & SIZE_MASK;
    Some(asize.max(MIN_BLOCK_SIZE))
}
