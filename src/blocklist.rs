use core::fmt;
use core::ops::Range;
use core::ptr::NonNull;

use static_assertions::const_assert;

/// Every payload handed out is aligned to this many bytes, and every payload
/// size is a multiple of it.
pub const ALIGN: usize = 16;

/// The smallest payload a block may have. A split is only performed if the
/// remainder can hold a header plus this much payload.
pub const MIN_PAYLOAD: usize = 16;

/// The header that sits at the start of every block, free or not.
///
/// `prev` and `next` link every block in address order, across all regions.
/// Within a region, `next` is always the physically following block; between
/// regions it is not, which is what the `REGION_START` flag is for.
///
/// We use C representation and align to 16 bytes so that the payload after
/// the header is 16-byte aligned as long as the region is.
#[repr(C, align(16))]
pub struct BlockHeader {
    size: usize,
    flags: usize,
    prev: Option<Block>,
    next: Option<Block>,
}

/// Size of a block header in bytes.
pub const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();
const_assert!(HEADER_SIZE % ALIGN == 0);
const_assert!(MIN_PAYLOAD % ALIGN == 0);
const_assert!(core::mem::align_of::<BlockHeader>() == ALIGN);

const FREE: usize = 0b01;
const REGION_START: usize = 0b10;

/// An enum for easy comparison of blocks and their order
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Relation {
    Before,
    AdjacentBefore,
    Overlapping,
    AdjacentAfter,
    After,
}

/// A `Block` is a handle to a block header living inside a region.
///
/// It is `Copy`: it does not own the memory it points at. The `BlockList` is
/// responsible for keeping headers and links consistent.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Block {
    header: NonNull<BlockHeader>,
}

// A Block is sendable - as long as the whole chain is moved across threads
// together, which is what wrapping a BlockList in a mutex does.
unsafe impl Send for Block {}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.is_free() { "free" } else { "used" };
        write!(f, "Block({:?}, {}, {})", self.header, self.size(), state)
    }
}

impl Block {
    /// Write a fresh, unlinked header at `ptr` describing a block with a
    /// payload of `size` bytes.
    ///
    /// # Safety
    ///
    /// `ptr` must be aligned to `ALIGN` and point to at least
    /// `HEADER_SIZE + size` bytes of memory owned by the allocator and not
    /// reachable by any client.
    unsafe fn from_raw(ptr: NonNull<u8>, size: usize, flags: usize) -> Block {
        debug_assert!(size >= MIN_PAYLOAD, "block of {} bytes is too small", size);
        let header: NonNull<BlockHeader> = ptr.cast();
        header.as_ptr().write(BlockHeader {
            size,
            flags,
            prev: None,
            next: None,
        });
        Block { header }
    }

    /// Recover the block a payload pointer was handed out from.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `Block::payload` on a live block.
    pub unsafe fn from_payload(ptr: NonNull<u8>) -> Block {
        let header = ptr.as_ptr().sub(HEADER_SIZE) as *mut BlockHeader;
        Block {
            header: NonNull::new_unchecked(header),
        }
    }

    /// The address of the header, which is where the block starts.
    pub fn start(&self) -> NonNull<u8> {
        self.header.cast()
    }

    /// The client-visible memory following the header.
    pub fn payload(&self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked((self.header.as_ptr() as *mut u8).add(HEADER_SIZE)) }
    }

    /// Get the pointer range covered by this block, header included.
    pub fn as_range(&self) -> Range<*const u8> {
        let start = self.header.as_ptr() as *const u8;
        unsafe { start..start.add(self.footprint()) }
    }

    /// The payload size, in bytes.
    pub fn size(&self) -> usize {
        self.header_view().size
    }

    /// Header plus payload.
    pub fn footprint(&self) -> usize {
        HEADER_SIZE + self.size()
    }

    pub fn is_free(&self) -> bool {
        self.header_view().flags & FREE != 0
    }

    /// Whether this block is the first one in its region.
    pub fn is_region_start(&self) -> bool {
        self.header_view().flags & REGION_START != 0
    }

    /// Whether this block spans its entire region.
    pub fn is_whole_region(&self) -> bool {
        self.is_region_start() && self.next().map_or(true, |n| n.is_region_start())
    }

    /// The next block in address order. It may be in another region.
    pub fn next(&self) -> Option<Block> {
        self.header_view().next
    }

    /// The previous block in address order. It may be in another region.
    pub fn prev(&self) -> Option<Block> {
        self.header_view().prev
    }

    /// The block physically following this one in the same region.
    pub fn adjacent_next(&self) -> Option<Block> {
        let next = self.next()?;
        if next.is_region_start() || next.as_range().start != self.as_range().end {
            return None;
        }
        Some(next)
    }

    /// The block physically preceding this one in the same region.
    pub fn adjacent_prev(&self) -> Option<Block> {
        if self.is_region_start() {
            return None;
        }
        let prev = self.prev()?;
        if prev.as_range().end != self.as_range().start {
            return None;
        }
        Some(prev)
    }

    /// An immutable view of the header
    pub fn header_view(&self) -> &BlockHeader {
        unsafe { self.header.as_ref() }
    }

    /// Get a mutable view of the header.
    ///
    /// # Safety
    ///
    /// This allows modifying the size or links of a block, which could
    /// corrupt the list.
    pub unsafe fn header_mut(&mut self) -> &mut BlockHeader {
        self.header.as_mut()
    }

    /// Mark this block as free or in use.
    ///
    /// # Safety
    ///
    /// Marking a block free hands its payload back to the allocator; the
    /// caller must not touch the payload afterwards.
    pub unsafe fn set_free(&mut self, free: bool) {
        let header = self.header_mut();
        if free {
            header.flags |= FREE;
        } else {
            header.flags &= !FREE;
        }
    }

    /// Compare two blocks to see how they are ordered.
    pub fn relation(&self, other: &Self) -> Relation {
        let self_range = self.as_range();
        let other_range = other.as_range();

        if self_range.end < other_range.start {
            Relation::Before
        } else if self_range.end == other_range.start {
            Relation::AdjacentBefore
        } else if self_range.start < other_range.end {
            Relation::Overlapping
        } else if self_range.start == other_range.end {
            Relation::AdjacentAfter
        } else {
            Relation::After
        }
    }

    /// Link this (unlinked) block into the chain directly after `prev`.
    unsafe fn link_after(&mut self, mut prev: Block) {
        let next = prev.next();
        {
            let header = self.header_mut();
            header.prev = Some(prev);
            header.next = next;
        }
        if let Some(mut next) = next {
            next.header_mut().prev = Some(*self);
        }
        prev.header_mut().next = Some(*self);
    }

    /// Shrink this block's payload to `size` bytes, turning the rest into a
    /// new free block linked directly after it.
    ///
    /// Returns `None`, leaving the block untouched, if the rest could not
    /// hold a header plus `MIN_PAYLOAD`.
    ///
    /// # Safety
    ///
    /// `size` must be a multiple of `ALIGN`, and the bytes past `size` in the
    /// payload must not be in use.
    pub unsafe fn split(&mut self, size: usize) -> Option<Block> {
        debug_assert!(size % ALIGN == 0);
        let rest_size = self.size().checked_sub(size)?.checked_sub(HEADER_SIZE)?;
        if rest_size < MIN_PAYLOAD {
            return None;
        }

        let rest_ptr = NonNull::new_unchecked(self.payload().as_ptr().add(size));
        let mut rest = Block::from_raw(rest_ptr, rest_size, FREE);
        rest.link_after(*self);
        self.header_mut().size = size;

        Some(rest)
    }

    /// Attempt to absorb the next block.
    ///
    /// If the next block is free and physically follows this one in the same
    /// region, its header and payload become part of this block's payload and
    /// this returns true; otherwise this returns false.
    ///
    /// # Safety
    ///
    /// The absorbed memory becomes part of this block, so this must only be
    /// called on free blocks, or on a live block that is being grown.
    pub unsafe fn try_merge_next(&mut self) -> bool {
        let next = match self.adjacent_next() {
            Some(next) if next.is_free() => next,
            _ => return false,
        };
        let after = next.next();
        let absorbed = next.footprint();

        let header = self.header_mut();
        header.size += absorbed;
        header.next = after;

        if let Some(mut after) = after {
            after.header_mut().prev = Some(*self);
        }

        true
    }
}

/// A `BlockList` is the address-ordered chain of every block in every region
/// owned by an allocator.
///
/// It maintains a few internal invariants:
///
/// - Each block links to the next with a strictly greater address, and back to
///   the previous one; the last links to `None`.
/// - Inside a region, blocks are packed with no gaps, so `next` is also the
///   physically adjacent block. Only a block flagged as a region start may
///   sit at an address that does not follow on from its predecessor.
/// - No two physically adjacent blocks in the same region are both free.
#[derive(Default)]
pub struct BlockList {
    first: Option<Block>,
}

pub struct BlockIter {
    next: Option<Block>,
}

impl Iterator for BlockIter {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.next.take()?;

        self.next = next.next();

        Some(next)
    }
}

/// Iterates over the regions of a `BlockList`, yielding each region's base
/// address and length.
///
/// The start of the following region is read before a region is yielded, so
/// the yielded region may be unmapped before calling `next` again.
pub struct RegionIter {
    next: Option<Block>,
}

impl Iterator for RegionIter {
    type Item = (NonNull<u8>, usize);

    fn next(&mut self) -> Option<Self::Item> {
        let first = self.next.take()?;

        let mut last = first;
        while let Some(next) = last.next() {
            if next.is_region_start() {
                self.next = Some(next);
                break;
            }
            last = next;
        }

        let len = last.as_range().end as usize - first.as_range().start as usize;
        Some((first.start(), len))
    }
}

impl<'list> IntoIterator for &'list BlockList {
    type Item = Block;
    type IntoIter = BlockIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Display for BlockList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockList(")?;
        let mut start = true;
        for block in self {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            if block.is_region_start() {
                write!(f, "| ")?;
            }
            write!(f, "{:?}", block)?;
        }

        write!(f, ")")
    }
}

/// Validity contains a representation of all invalid states found in a
/// BlockList.
#[derive(Default, Debug)]
pub struct Validity {
    /// Number of blocks overlapping the block before them.
    ///
    /// This likely indicates corruption.
    pub overlaps: usize,

    /// Number of blocks that do not have an address greater than their
    /// predecessor's.
    pub out_of_orders: usize,

    /// Number of free blocks directly following a free block in the same
    /// region. These should have been merged.
    pub adjacent_frees: usize,

    /// Number of blocks whose `prev` does not point at the block before them.
    pub broken_links: usize,

    /// Number of blocks that are not region starts, yet do not begin where
    /// their predecessor ends.
    pub gaps: usize,

    /// Number of blocks smaller than `MIN_PAYLOAD`, or not a multiple of
    /// `ALIGN`.
    pub undersized: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.overlaps == 0
            && self.out_of_orders == 0
            && self.adjacent_frees == 0
            && self.broken_links == 0
            && self.gaps == 0
            && self.undersized == 0
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Default, Debug)]
pub struct Stats {
    /// Number of blocks, free or not.
    pub blocks: usize,
    pub free_blocks: usize,
    /// Payload bytes in free blocks.
    pub free_size: usize,
    /// Payload bytes in blocks in use.
    pub used_size: usize,
    pub regions: usize,
    /// Total bytes covered by all regions, headers included.
    pub region_size: usize,
}

impl BlockList {
    pub fn iter(&self) -> BlockIter {
        BlockIter { next: self.first }
    }

    pub fn regions(&self) -> RegionIter {
        RegionIter { next: self.first }
    }

    /// Find the first free block, in address order, with a payload of at
    /// least `size` bytes.
    pub fn first_fit(&self, size: usize) -> Option<Block> {
        self.iter().find(|b| b.is_free() && b.size() >= size)
    }

    /// Seed a new region of `len` bytes at `ptr` as a single free block, and
    /// link it into the chain in address order.
    ///
    /// # Safety
    ///
    /// `ptr` must be aligned to `ALIGN` and point to `len` bytes of memory
    /// that do not overlap any region already in the list, ownership of which
    /// is transferred to the list. `len` must be a multiple of `ALIGN` of at
    /// least `HEADER_SIZE + MIN_PAYLOAD`.
    pub unsafe fn insert_region(&mut self, ptr: NonNull<u8>, len: usize) -> Block {
        let mut block = Block::from_raw(ptr, len - HEADER_SIZE, FREE | REGION_START);

        // Regions can come back from the environment at any address, so we
        // find the last block that starts below this one, rather than
        // assuming the new region goes at the end.
        let start = block.as_range().start;
        let mut previous = None;
        for b in self.iter() {
            if b.as_range().start >= start {
                break;
            }
            previous = Some(b);
        }

        match previous {
            Some(prev) => {
                debug_assert!(
                    matches!(
                        prev.relation(&block),
                        Relation::Before | Relation::AdjacentBefore
                    ),
                    "Overlapping memory regions"
                );
                block.link_after(prev);
            }
            None => {
                let next = self.first;
                if let Some(mut next) = next {
                    debug_assert!(
                        matches!(
                            block.relation(&next),
                            Relation::Before | Relation::AdjacentBefore
                        ),
                        "Overlapping memory regions"
                    );
                    next.header_mut().prev = Some(block);
                }
                block.header_mut().next = next;
                self.first = Some(block);
            }
        }

        block
    }

    /// Remove a block from the chain, without touching its neighbours'
    /// sizes. Used to drop a whole-region block before its region is
    /// returned.
    ///
    /// # Safety
    ///
    /// `block` must be in this list. Unlinking anything other than a whole
    /// region leaves a gap in that region.
    pub unsafe fn unlink(&mut self, block: Block) {
        let (prev, next) = (block.prev(), block.next());

        match prev {
            Some(mut prev) => prev.header_mut().next = next,
            None => self.first = next,
        }
        if let Some(mut next) = next {
            next.header_mut().prev = prev;
        }
    }

    /// Check current size of the list, and whether its valid.
    pub fn stats(&self) -> (Validity, Stats) {
        let mut validity: Validity = Default::default();
        let mut stats: Stats = Default::default();

        let mut previous: Option<Block> = None;
        for block in self.iter() {
            if block.size() < MIN_PAYLOAD || block.size() % ALIGN != 0 {
                validity.undersized += 1;
            }
            if block.prev() != previous {
                validity.broken_links += 1;
            }

            match previous {
                None => {
                    // The first block always starts a region.
                    if !block.is_region_start() {
                        validity.gaps += 1;
                    }
                }
                Some(prev) => match prev.relation(&block) {
                    Relation::Before => {
                        if !block.is_region_start() {
                            validity.gaps += 1;
                        }
                    }
                    Relation::AdjacentBefore => {
                        if !block.is_region_start() && prev.is_free() && block.is_free() {
                            validity.adjacent_frees += 1;
                        }
                    }
                    Relation::Overlapping => {
                        // This is really bad.
                        validity.overlaps += 1;
                    }
                    Relation::AdjacentAfter | Relation::After => {
                        validity.out_of_orders += 1;
                    }
                },
            }

            stats.blocks += 1;
            stats.region_size += block.footprint();
            if block.is_region_start() {
                stats.regions += 1;
            }
            if block.is_free() {
                stats.free_blocks += 1;
                stats.free_size += block.size();
            } else {
                stats.used_size += block.size();
            }

            previous = Some(block);
        }

        (validity, stats)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }
}
