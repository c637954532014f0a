//! Allocator types, both generic and Unix-specific.
//!
//! ## Basic Types
//!
//! ### [`RawAlloc`](struct.RawAlloc.html)
//!
//! A `RawAlloc` is a single-threaded heap manager. It carves regions obtained
//! from a [`RegionSource`](trait.RegionSource.html) into blocks, hands them
//! out first-fit, and splits and coalesces them as they are allocated,
//! resized and released. Because it is not thread-safe, it cannot be used as
//! a global allocator directly.
//!
//! ### [`GenericAllocator`](struct.GenericAllocator.html)
//!
//! A `GenericAllocator` lazily creates a `RawAlloc` and wraps it in a spin
//! lock, making the whole engine one critical section.
//!
//! ### [`UnixAllocator`](struct.UnixAllocator.html)
//!
//! A `UnixAllocator` is a `GenericAllocator` over the platform's virtual
//! memory, and implements
//! [`core::alloc::GlobalAlloc`](https://doc.rust-lang.org/core/alloc/trait.GlobalAlloc.html).
//!
//! ### [`RegionSource`](trait.RegionSource.html)
//!
//! `RegionSource` is a simple trait interface meant to abstract over the
//! calls to the OS to map and unmap pages.
//!
//! ### [`ToyHeap`](struct.ToyHeap.html)
//!
//! `ToyHeap` is a fixed array that can pretend to be the OS, and implements
//! `RegionSource` for such a purpose. It is mainly useful for testing.

use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;
use core::cmp;
use core::mem::{self, MaybeUninit};
use core::ptr::{null_mut, NonNull};
use core::sync::atomic::{AtomicU8, Ordering};

#[cfg(feature = "use_libc")]
use errno::Errno;
use spin::{Mutex, MutexGuard};
use thiserror::Error;

use crate::blocklist::{Block, BlockList, Stats, Validity, ALIGN, HEADER_SIZE, MIN_PAYLOAD};
use crate::raw::{self, checked_multiply, round_up};
#[cfg(not(feature = "use_libc"))]
use crate::unix::{self, MmapError};

/// Why an allocation could not be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// Zero bytes were requested. No block is created for these.
    #[error("zero-sized allocation requested")]
    ZeroSize,
    /// `count * size` does not fit in a `usize`.
    #[error("allocation size overflows usize")]
    Overflow,
    /// The region source could not provide enough memory.
    #[error("region source is exhausted")]
    Exhausted,
}

/// How many regions a `RawAlloc` keeps mapped by default, even when they are
/// entirely free.
pub const DEFAULT_SPARE_REGIONS: usize = 1;

pub trait RegionSource {
    type Err;

    /// The granularity regions are handed out in.
    fn page_size(&self) -> usize;

    /// Acquire a zeroed, readable and writable region of at least `size`
    /// bytes. Returns a pointer and the length of the region at that
    /// pointer, which is `size` rounded up to a whole number of pages.
    ///
    /// # Safety
    ///
    /// The returned memory must be aligned to at least `ALIGN` bytes, and be
    /// available and untracked by any other rust code, including the
    /// allocator itself.
    unsafe fn acquire(&mut self, size: usize) -> Result<(NonNull<u8>, usize), Self::Err>;

    /// Return a region to the environment.
    ///
    /// # Safety
    ///
    /// `ptr` and `len` must be exactly a pointer and length previously
    /// returned by `acquire`, and nothing may reference that memory anymore.
    unsafe fn release(&mut self, ptr: NonNull<u8>, len: usize) -> Result<(), Self::Err>;
}

/// LibcRegionSource uses libc's `mmap` to get regions of virtual memory.
#[cfg(feature = "use_libc")]
#[derive(Default)]
pub struct LibcRegionSource {
    // Just for tracking, not really needed
    pub pages: usize,
    pub acquisitions: usize,
    pub releases: usize,
}

#[cfg(feature = "use_libc")]
impl RegionSource for LibcRegionSource {
    type Err = Errno;

    fn page_size(&self) -> usize {
        sysconf::page::pagesize()
    }

    unsafe fn acquire(&mut self, size: usize) -> Result<(NonNull<u8>, usize), Self::Err> {
        let pagesize = self.page_size();
        let to_allocate = round_up(size, pagesize).ok_or(Errno(libc::ENOMEM))?;

        let ptr = libc::mmap(
            // Address we want the memory at. We don't care, so null it is.
            null_mut(),
            to_allocate,
            libc::PROT_WRITE | libc::PROT_READ,
            // MAP_ANON: We don't want a file descriptor, we're just going to
            //   use the memory.
            //
            // MAP_PRIVATE: We're not sharing this with any other process.
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        );

        if ptr == libc::MAP_FAILED {
            return Err(errno::errno());
        }
        let ptr = NonNull::new(ptr as *mut u8).ok_or(Errno(libc::ENOMEM))?;

        self.pages += to_allocate / pagesize;
        self.acquisitions += 1;

        Ok((ptr, to_allocate))
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, len: usize) -> Result<(), Self::Err> {
        if libc::munmap(ptr.as_ptr() as *mut libc::c_void, len) != 0 {
            return Err(errno::errno());
        }

        self.pages -= len / self.page_size();
        self.releases += 1;

        Ok(())
    }
}

/// SyscallRegionSource makes `mmap` system calls directly, without libc.
#[cfg(not(feature = "use_libc"))]
#[derive(Default)]
pub struct SyscallRegionSource {
    // Just for tracking, not really needed
    pub pages: usize,
    pub acquisitions: usize,
    pub releases: usize,
}

#[cfg(not(feature = "use_libc"))]
impl RegionSource for SyscallRegionSource {
    type Err = MmapError;

    fn page_size(&self) -> usize {
        unix::PAGE_SIZE
    }

    unsafe fn acquire(&mut self, size: usize) -> Result<(NonNull<u8>, usize), MmapError> {
        let to_allocate = round_up(size, unix::PAGE_SIZE).ok_or(MmapError::TooLarge(size))?;
        let ptr = unix::mmap(to_allocate)?;

        self.pages += to_allocate / unix::PAGE_SIZE;
        self.acquisitions += 1;

        Ok((ptr, to_allocate))
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, len: usize) -> Result<(), MmapError> {
        unix::munmap(ptr, len)?;

        self.pages -= len / unix::PAGE_SIZE;
        self.releases += 1;

        Ok(())
    }
}

/// The region source `UnixAllocator` uses.
#[cfg(feature = "use_libc")]
pub type PlatformSource = LibcRegionSource;
/// The region source `UnixAllocator` uses.
#[cfg(not(feature = "use_libc"))]
pub type PlatformSource = SyscallRegionSource;

/// A raw allocator, capable of acquiring regions, returning pointers to new
/// allocations, and tracking and reusing freed memory.
///
/// Regions that become entirely free are returned to the source once
/// `spare_regions` other empty regions are already mapped. The most recently
/// emptied regions are the ones kept for reuse.
///
/// Dropping a `RawAlloc` does not return its regions; call
/// [`release_all`](#method.release_all) for that.
pub struct RawAlloc<S> {
    pub source: S,
    pub blocks: BlockList,
    regions: usize,
    spare_regions: usize,
}

impl<S: RegionSource + Default> Default for RawAlloc<S> {
    fn default() -> Self {
        RawAlloc::new(S::default())
    }
}

impl<S: RegionSource> RawAlloc<S> {
    /// Create a new `RawAlloc`
    pub fn new(source: S) -> Self {
        RawAlloc::with_spare_regions(source, DEFAULT_SPARE_REGIONS)
    }

    /// Create a new `RawAlloc` that keeps up to `spare_regions` empty regions
    /// mapped for reuse.
    pub fn with_spare_regions(source: S, spare_regions: usize) -> Self {
        RawAlloc {
            source,
            blocks: BlockList::default(),
            regions: 0,
            spare_regions,
        }
    }

    /// Get statistics on this allocator, and verify validity of the BlockList
    pub fn stats(&self) -> (Validity, Stats) {
        self.blocks.stats()
    }

    /// Number of regions currently mapped.
    pub fn region_count(&self) -> usize {
        self.regions
    }

    /// Calculate the payload size of a block able to hold `size` bytes, or
    /// `None` if that is not representable.
    pub fn block_size(size: usize) -> Option<usize> {
        // We align everything to 16 bytes, and all blocks are at least 16
        // bytes.
        round_up(size, ALIGN).map(|s| cmp::max(s, MIN_PAYLOAD))
    }

    /// The number of bytes usable at `ptr`, which may exceed what was
    /// requested.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation from this allocator.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        Block::from_payload(ptr).size()
    }

    // Acquire one new region big enough for a `needed`-byte payload, and link
    // it into the list as a single free block.
    unsafe fn grow(&mut self, needed: usize) -> Result<Block, AllocError> {
        let size = needed
            .checked_add(HEADER_SIZE)
            .ok_or(AllocError::Exhausted)?;

        let (ptr, len) = self
            .source
            .acquire(size)
            .map_err(|_| AllocError::Exhausted)?;

        if len < size || len % ALIGN != 0 || ptr.as_ptr() as usize % ALIGN != 0 {
            let _ = self.source.release(ptr, len);
            return Err(AllocError::Exhausted);
        }

        self.regions += 1;
        Ok(self.blocks.insert_region(ptr, len))
    }

    // Hand out the front `needed` bytes of a free block, splitting off the
    // rest if it is big enough to be a block of its own.
    unsafe fn claim(&mut self, mut block: Block, needed: usize) -> NonNull<u8> {
        let _ = block.split(needed);
        block.set_free(false);
        block.payload()
    }

    // Return a whole-region free block to the source, unless fewer than
    // `spare_regions` other empty regions are already mapped.
    unsafe fn reclaim(&mut self, block: Block) {
        if !block.is_whole_region() {
            return;
        }

        let spares = self
            .blocks
            .iter()
            .filter(|&b| b != block && b.is_free() && b.is_whole_region())
            .count();
        if spares < self.spare_regions {
            return;
        }

        let (ptr, len) = (block.start(), block.footprint());
        self.blocks.unlink(block);
        match self.source.release(ptr, len) {
            Ok(()) => self.regions -= 1,
            Err(_) => {
                // The region is still mapped; keep using it.
                self.blocks.insert_region(ptr, len);
            }
        }
    }

    ////////////////////////////////////////////////////////////
    // malloc, calloc, realloc, free

    /// Allocate `size` bytes.
    ///
    /// Requests for zero bytes fail with `AllocError::ZeroSize` rather than
    /// returning a unique pointer.
    ///
    /// # Safety
    ///
    /// Every region handed out by the source must stay valid for as long as
    /// this allocator is in use.
    pub unsafe fn try_allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        let needed = RawAlloc::<S>::block_size(size).ok_or(AllocError::Exhausted)?;

        let block = match self.blocks.first_fit(needed) {
            Some(block) => block,
            None => self.grow(needed)?,
        };

        Ok(self.claim(block, needed))
    }

    /// Allocate `size` bytes, returning null on failure or when `size` is 0.
    ///
    /// # Safety
    ///
    /// See [`try_allocate`](#method.try_allocate).
    pub unsafe fn allocate(&mut self, size: usize) -> *mut u8 {
        self.try_allocate(size).map_or(null_mut(), NonNull::as_ptr)
    }

    /// Allocate `count * size` zeroed bytes.
    ///
    /// # Safety
    ///
    /// See [`try_allocate`](#method.try_allocate).
    pub unsafe fn try_zero_allocate(
        &mut self,
        count: usize,
        size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let total = checked_multiply(count, size).ok_or(AllocError::Overflow)?;
        let ptr = self.try_allocate(total)?;
        raw::fill(ptr.as_ptr(), 0, total);
        Ok(ptr)
    }

    /// Allocate `count * size` zeroed bytes, returning null on overflow,
    /// failure, or a zero total.
    ///
    /// # Safety
    ///
    /// See [`try_allocate`](#method.try_allocate).
    pub unsafe fn zero_allocate(&mut self, count: usize, size: usize) -> *mut u8 {
        self.try_zero_allocate(count, size)
            .map_or(null_mut(), NonNull::as_ptr)
    }

    /// Resize the allocation at `ptr` to hold `new_size` bytes, preserving
    /// its contents up to the smaller of the two sizes.
    ///
    /// Shrinking, and growing into a free block directly after this one,
    /// happen in place. Otherwise the data is moved to a new block. On
    /// error, the allocation at `ptr` is left untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation from this allocator. If a different
    /// pointer is returned, `ptr` is no longer valid.
    pub unsafe fn try_resize(
        &mut self,
        ptr: NonNull<u8>,
        new_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        if new_size == 0 {
            return Err(AllocError::ZeroSize);
        }

        let mut block = Block::from_payload(ptr);
        if block.size() == new_size {
            return Ok(ptr);
        }
        let needed = RawAlloc::<S>::block_size(new_size).ok_or(AllocError::Exhausted)?;

        if needed <= block.size() {
            if let Some(mut rest) = block.split(needed) {
                rest.try_merge_next();
            }
            return Ok(ptr);
        }

        if let Some(next) = block.adjacent_next() {
            if next.is_free() && block.size() + next.footprint() >= needed {
                block.try_merge_next();
                let _ = block.split(needed);
                return Ok(ptr);
            }
        }

        let new_ptr = self.try_allocate(new_size)?;
        raw::copy(new_ptr.as_ptr(), ptr.as_ptr(), cmp::min(block.size(), new_size));
        self.release(ptr.as_ptr());

        Ok(new_ptr)
    }

    /// Resize with the conventional `realloc` contract: a null `ptr`
    /// allocates, a zero `new_size` releases and returns null, and a null
    /// return for a nonzero size means `ptr` is still valid and unchanged.
    ///
    /// # Safety
    ///
    /// See [`try_resize`](#method.try_resize).
    pub unsafe fn resize(&mut self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        let ptr = match NonNull::new(ptr) {
            None => return self.allocate(new_size),
            Some(ptr) => ptr,
        };

        if new_size == 0 {
            self.release(ptr.as_ptr());
            return null_mut();
        }

        self.try_resize(ptr, new_size)
            .map_or(null_mut(), NonNull::as_ptr)
    }

    /// Release (or "free") an allocation. Releasing null does nothing.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation from this allocator.
    pub unsafe fn release(&mut self, ptr: *mut u8) {
        let ptr = match NonNull::new(ptr) {
            None => return,
            Some(ptr) => ptr,
        };

        let mut block = Block::from_payload(ptr);
        debug_assert!(!block.is_free(), "Releasing free block {:?}", block);
        block.set_free(true);

        block.try_merge_next();
        if let Some(mut prev) = block.adjacent_prev() {
            if prev.is_free() && prev.try_merge_next() {
                block = prev;
            }
        }

        self.reclaim(block);
    }

    /// Return every region to the source. All outstanding allocations become
    /// invalid.
    ///
    /// # Safety
    ///
    /// No pointer handed out by this allocator may be used afterwards.
    pub unsafe fn release_all(&mut self) {
        let blocks = mem::take(&mut self.blocks);
        for (ptr, len) in blocks.regions() {
            // Nothing useful can be done if this fails.
            let _ = self.source.release(ptr, len);
        }
        self.regions = 0;
    }
}

/// A thread-safe allocator, using a spin lock around a RawAlloc.
///
/// Thread-safety is required for an allocator to be used as a global
/// allocator. The lock covers searching, splitting, coalescing and growing
/// alike, as adjacent blocks are never independent of each other.
pub struct GenericAllocator<S> {
    // Values:
    // - 0: Untouched
    // - 1: Initialization in progress
    // - 2: Initialized
    init: AtomicU8,
    raw: UnsafeCell<MaybeUninit<Mutex<RawAlloc<S>>>>,
}

// All access to `raw` after initialization goes through the mutex.
unsafe impl<S: Send> Sync for GenericAllocator<S> {}

impl<S: RegionSource + Default> Default for GenericAllocator<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> GenericAllocator<S> {
    pub const fn new() -> Self {
        GenericAllocator {
            init: AtomicU8::new(0),
            raw: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

impl<S: RegionSource + Default> GenericAllocator<S> {
    /// Get a reference to the underlying RawAlloc.
    ///
    /// # Safety
    ///
    /// This is unsafe because it blocks allocation while the mutex guard is in
    /// place.
    pub unsafe fn get_raw(&self) -> MutexGuard<RawAlloc<S>> {
        // The plan:
        // - Check if initialization hasn't started (0)
        // - If initializing hasn't yet started (0):
        //   - Mark it as initializing (1), then initialize, then mark it as fully initialized (2)
        // - If it has started but not completed (1):
        //   - Enter a spin loop until it is fully initialized (2)
        // - If it finished initializing (2):
        //   - Continue
        let state = self
            .init
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst);

        match state {
            Err(2) => {
                // This is fully initialized, no need to do anything
            }
            Ok(0) => {
                // We haven't initialized, so we do that now.
                let slot: *mut Mutex<RawAlloc<S>> = (*self.raw.get()).as_mut_ptr();
                slot.write(Mutex::new(RawAlloc::default()));

                // Let other threads know that the mutex and raw allocator are
                // now initialized, and they are free to use the mutex to
                // access the raw allocator
                self.init.store(2, Ordering::SeqCst);
                return (*slot).lock();
            }
            Err(1) => {
                // Some other thread is currently initializing. We wait for it.
                loop {
                    core::hint::spin_loop();

                    match self.init.load(Ordering::SeqCst) {
                        1 => continue,
                        2 => break,
                        state => panic!("Unexpected state {}", state),
                    }
                }
            }
            Ok(v) => panic!("Unexpected OK state loaded: {}", v),
            Err(v) => panic!("Unexpected Err state loaded: {}", v),
        }

        (*(*self.raw.get()).as_ptr()).lock()
    }

    pub fn stats(&self) -> (Validity, Stats) {
        unsafe { self.get_raw().stats() }
    }

    /// See [`RawAlloc::allocate`](struct.RawAlloc.html#method.allocate).
    ///
    /// # Safety
    ///
    /// See [`RawAlloc::try_allocate`](struct.RawAlloc.html#method.try_allocate).
    pub unsafe fn allocate(&self, size: usize) -> *mut u8 {
        self.get_raw().allocate(size)
    }

    /// See [`RawAlloc::zero_allocate`](struct.RawAlloc.html#method.zero_allocate).
    ///
    /// # Safety
    ///
    /// See [`RawAlloc::try_allocate`](struct.RawAlloc.html#method.try_allocate).
    pub unsafe fn zero_allocate(&self, count: usize, size: usize) -> *mut u8 {
        self.get_raw().zero_allocate(count, size)
    }

    /// See [`RawAlloc::resize`](struct.RawAlloc.html#method.resize).
    ///
    /// # Safety
    ///
    /// See [`RawAlloc::try_resize`](struct.RawAlloc.html#method.try_resize).
    pub unsafe fn resize(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        self.get_raw().resize(ptr, new_size)
    }

    /// See [`RawAlloc::release`](struct.RawAlloc.html#method.release).
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation from this allocator.
    pub unsafe fn release(&self, ptr: *mut u8) {
        self.get_raw().release(ptr)
    }

    /// Return every region to the source. Does nothing if nothing was ever
    /// allocated.
    ///
    /// # Safety
    ///
    /// No pointer handed out by this allocator may be used afterwards.
    pub unsafe fn teardown(&self) {
        if self.init.load(Ordering::SeqCst) != 2 {
            return;
        }
        self.get_raw().release_all();
    }
}

#[derive(Default)]
pub struct UnixAllocator {
    alloc: GenericAllocator<PlatformSource>,
}

impl UnixAllocator {
    pub const fn new() -> Self {
        UnixAllocator {
            alloc: GenericAllocator::new(),
        }
    }

    pub fn stats(&self) -> (Validity, Stats) {
        self.alloc.stats()
    }

    /// `malloc`. See [`RawAlloc::allocate`](struct.RawAlloc.html#method.allocate).
    ///
    /// # Safety
    ///
    /// The returned memory is only valid until released or torn down.
    pub unsafe fn allocate(&self, size: usize) -> *mut u8 {
        self.alloc.allocate(size)
    }

    /// `calloc`. See [`RawAlloc::zero_allocate`](struct.RawAlloc.html#method.zero_allocate).
    ///
    /// # Safety
    ///
    /// The returned memory is only valid until released or torn down.
    pub unsafe fn zero_allocate(&self, count: usize, size: usize) -> *mut u8 {
        self.alloc.zero_allocate(count, size)
    }

    /// `realloc`. See [`RawAlloc::resize`](struct.RawAlloc.html#method.resize).
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation from this allocator.
    pub unsafe fn resize(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        self.alloc.resize(ptr, new_size)
    }

    /// `free`. See [`RawAlloc::release`](struct.RawAlloc.html#method.release).
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation from this allocator.
    pub unsafe fn release(&self, ptr: *mut u8) {
        self.alloc.release(ptr)
    }

    /// Unmap every region.
    ///
    /// # Safety
    ///
    /// No pointer handed out by this allocator may be used afterwards, so
    /// this must not be called on an allocator installed with
    /// `#[global_allocator]`.
    pub unsafe fn teardown(&self) {
        self.alloc.teardown()
    }
}

unsafe impl GlobalAlloc for UnixAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGN {
            return null_mut();
        }
        self.alloc.allocate(layout.size())
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGN {
            return null_mut();
        }
        self.alloc.zero_allocate(1, layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.alloc.release(ptr)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGN {
            return null_mut();
        }
        self.alloc.resize(ptr, new_size)
    }
}

/// Bytes of memory a `ToyHeap` can hand out.
pub const TOY_HEAP_SIZE: usize = 256 * 1024;

#[repr(C, align(4096))]
pub struct ToyArena(pub [u8; TOY_HEAP_SIZE]);

/// A fixed-size, in-memory stand-in for the OS.
///
/// Regions are handed out from the front of the arena and never reused, even
/// after they are released.
pub struct ToyHeap {
    pub page_size: usize,
    /// Bytes that may be handed out in total, at most `TOY_HEAP_SIZE`.
    pub limit: usize,
    /// Bytes handed out so far.
    pub size: usize,
    pub acquisitions: usize,
    pub releases: usize,
    pub released_size: usize,
    pub heap: ToyArena,
}

impl Default for ToyHeap {
    fn default() -> Self {
        ToyHeap {
            page_size: 4096,
            limit: TOY_HEAP_SIZE,
            size: 0,
            acquisitions: 0,
            releases: 0,
            released_size: 0,
            heap: ToyArena([0; TOY_HEAP_SIZE]),
        }
    }
}

impl ToyHeap {
    /// A `ToyHeap` handing out regions in multiples of `page_size`.
    pub fn with_page_size(page_size: usize) -> Self {
        assert!(
            page_size % ALIGN == 0 && page_size >= HEADER_SIZE + MIN_PAYLOAD,
            "Unusable page size {}",
            page_size
        );
        ToyHeap {
            page_size,
            ..ToyHeap::default()
        }
    }

    /// A `ToyHeap` that refuses to hand out more than `limit` bytes in total.
    pub fn with_limit(limit: usize) -> Self {
        ToyHeap {
            limit: cmp::min(limit, TOY_HEAP_SIZE),
            ..ToyHeap::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("toy heap cannot provide {requested} bytes: {used} of {limit} already used")]
pub struct ToyHeapError {
    pub requested: usize,
    pub used: usize,
    pub limit: usize,
}

impl RegionSource for ToyHeap {
    type Err = ToyHeapError;

    fn page_size(&self) -> usize {
        self.page_size
    }

    unsafe fn acquire(&mut self, size: usize) -> Result<(NonNull<u8>, usize), Self::Err> {
        let error = ToyHeapError {
            requested: size,
            used: self.size,
            limit: self.limit,
        };

        let allocating = round_up(size, self.page_size).ok_or(error)?;
        if size == 0 || allocating > self.limit - self.size {
            return Err(error);
        }

        let ptr = self.heap.0.as_mut_ptr().add(self.size);
        self.size += allocating;
        self.acquisitions += 1;
        Ok((NonNull::new_unchecked(ptr), allocating))
    }

    unsafe fn release(&mut self, _ptr: NonNull<u8>, len: usize) -> Result<(), Self::Err> {
        self.releases += 1;
        self.released_size += len;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_env_log::test;

    type ToyAlloc = RawAlloc<ToyHeap>;

    fn assert_valid(allocator: &ToyAlloc) -> Stats {
        let (validity, stats) = allocator.stats();
        log::info!("{}", allocator.blocks);
        assert!(validity.is_valid(), "{:?}", validity);
        assert_eq!(
            stats.region_size,
            allocator.source.size - allocator.source.released_size
        );
        assert_eq!(stats.regions, allocator.region_count());
        stats
    }

    unsafe fn write_pattern(ptr: *mut u8, len: usize, seed: u8) {
        for i in 0..len {
            *ptr.add(i) = seed.wrapping_add(i as u8);
        }
    }

    unsafe fn has_pattern(ptr: *const u8, len: usize, seed: u8) -> bool {
        (0..len).all(|i| *ptr.add(i) == seed.wrapping_add(i as u8))
    }

    #[test]
    fn test_basic() {
        let mut allocator = RawAlloc::new(ToyHeap::default());

        const BLOCKS: usize = 3;
        let sizes: [usize; BLOCKS] = [64, 64, 224];

        let pointers: [*mut u8; BLOCKS] = unsafe {
            let mut pointers = [null_mut(); BLOCKS];
            for (i, &size) in sizes.iter().enumerate() {
                pointers[i] = allocator.allocate(size);
                assert!(!pointers[i].is_null());
                assert_eq!(pointers[i] as usize % ALIGN, 0);
                assert_valid(&allocator);
            }
            pointers
        };

        // Blocks are packed back to back, each behind its own header
        for i in 0..BLOCKS - 1 {
            let expected = unsafe { pointers[i].add(sizes[i] + HEADER_SIZE) };
            assert_eq!(expected, pointers[i + 1]);
        }
        assert_eq!(allocator.source.acquisitions, 1);

        ////////////////////////////////////////////////////////////
        // Release

        unsafe { allocator.release(pointers[1]) };
        let stats = assert_valid(&allocator);
        // The hole in the middle, and the tail of the region
        assert_eq!(stats.free_blocks, 2);
        assert_eq!(stats.used_size, 64 + 224);

        ////////////////////////////////////////////////////////////
        // Allocation with a hole

        unsafe {
            // More than fits in the hole, so it comes from the tail
            let p112 = allocator.allocate(112);
            assert_eq!(p112, pointers[2].add(224 + HEADER_SIZE));

            // 32 bytes fits in the hole, but the rest of it can't hold a header
            // and a minimum payload, so the whole hole is handed out
            let p32 = allocator.allocate(32);
            assert_eq!(p32, pointers[1]);
            assert_eq!(allocator.usable_size(NonNull::new(p32).unwrap()), 64);

            let stats = assert_valid(&allocator);
            assert_eq!(stats.free_blocks, 1);
        }
        assert_eq!(allocator.source.acquisitions, 1);
    }

    #[test]
    fn zero_size_allocates_nothing() {
        let mut allocator = RawAlloc::new(ToyHeap::default());

        unsafe {
            assert!(allocator.allocate(0).is_null());
            assert_eq!(allocator.try_allocate(0), Err(AllocError::ZeroSize));
            assert!(allocator.zero_allocate(0, 8).is_null());
            assert!(allocator.zero_allocate(8, 0).is_null());
        }
        assert_eq!(allocator.source.acquisitions, 0);
        assert!(allocator.blocks.is_empty());
    }

    #[test]
    fn oversized_requests_fail_cleanly() {
        let mut allocator = RawAlloc::new(ToyHeap::default());

        unsafe {
            assert_eq!(
                allocator.try_allocate(usize::MAX),
                Err(AllocError::Exhausted)
            );
            assert_eq!(
                allocator.try_allocate(usize::MAX - HEADER_SIZE),
                Err(AllocError::Exhausted)
            );
            assert_eq!(
                allocator.try_allocate(TOY_HEAP_SIZE),
                Err(AllocError::Exhausted)
            );
        }
        assert_eq!(allocator.source.acquisitions, 0);
        assert!(allocator.blocks.is_empty());
    }

    #[test]
    fn zero_allocate_overflow_leaves_list_unchanged() {
        let mut allocator = RawAlloc::new(ToyHeap::default());

        unsafe {
            assert!(allocator.zero_allocate(usize::MAX, 2).is_null());
            assert_eq!(
                allocator.try_zero_allocate(1 << (usize::BITS / 2), 1 << (usize::BITS / 2)),
                Err(AllocError::Overflow)
            );
        }
        assert_eq!(allocator.source.acquisitions, 0);
        assert!(allocator.blocks.is_empty());

        unsafe {
            let p = allocator.allocate(100);
            assert!(allocator.zero_allocate(2, usize::MAX / 2 + 1).is_null());
            let stats = assert_valid(&allocator);
            assert_eq!(stats.blocks, 2);
            assert_eq!(stats.used_size, 112);
            allocator.release(p);
        }
    }

    #[test]
    fn zero_allocate_clears_reused_memory() {
        let mut allocator = RawAlloc::new(ToyHeap::default());

        unsafe {
            let dirty = allocator.allocate(30 * 4);
            raw::fill(dirty, 0xFF, 30 * 4);
            allocator.release(dirty);

            let clean = allocator.zero_allocate(30, 4);
            assert_eq!(clean, dirty);
            let bytes = core::slice::from_raw_parts(clean, 30 * 4);
            assert!(bytes.iter().all(|&b| b == 0));
        }
        assert_valid(&allocator);
    }

    #[test]
    fn resize_to_same_size_keeps_address() {
        let mut allocator = RawAlloc::new(ToyHeap::default());

        unsafe {
            let p = allocator.allocate(48);
            let _blocker = allocator.allocate(16);
            let size = allocator.usable_size(NonNull::new(p).unwrap());
            assert_eq!(size, 48);
            assert_eq!(allocator.resize(p, size), p);
            // Rounds up to the same block size, too
            assert_eq!(allocator.resize(p, 40), p);
            assert_eq!(allocator.usable_size(NonNull::new(p).unwrap()), 48);
        }
        assert_valid(&allocator);
    }

    #[test]
    fn resize_null_and_zero() {
        let mut allocator = RawAlloc::new(ToyHeap::default());

        unsafe {
            let p = allocator.resize(null_mut(), 64);
            assert!(!p.is_null());
            assert_eq!(assert_valid(&allocator).used_size, 64);

            assert!(allocator.resize(p, 0).is_null());
            let stats = assert_valid(&allocator);
            assert_eq!(stats.used_size, 0);
            assert_eq!(stats.blocks, 1);

            assert!(allocator.resize(null_mut(), 0).is_null());
        }
    }

    #[test]
    fn grow_in_place_into_free_neighbour() {
        let mut allocator = RawAlloc::new(ToyHeap::default());

        unsafe {
            let p = allocator.allocate(40);
            write_pattern(p, 40, 3);

            let grown = allocator.resize(p, 200);
            assert_eq!(grown, p);
            assert!(has_pattern(grown, 40, 3));
            assert_eq!(allocator.usable_size(NonNull::new(p).unwrap()), 208);
        }
        let stats = assert_valid(&allocator);
        assert_eq!(stats.blocks, 2);
        assert_eq!(allocator.source.acquisitions, 1);
    }

    #[test]
    fn grow_by_moving_preserves_prefix() {
        let mut allocator = RawAlloc::new(ToyHeap::default());

        unsafe {
            let p = allocator.allocate(40);
            let blocker = allocator.allocate(16);
            write_pattern(p, 40, 11);

            let grown = allocator.resize(p, 400);
            assert!(!grown.is_null());
            assert_ne!(grown, p);
            assert!(has_pattern(grown, 40, 11));
            assert_eq!(grown, blocker.add(16 + HEADER_SIZE));

            // The old block is free again, and first in line
            assert_eq!(allocator.allocate(40), p);
        }
        assert_valid(&allocator);
    }

    #[test]
    fn grow_does_not_absorb_the_next_region() {
        let mut allocator = RawAlloc::with_spare_regions(ToyHeap::default(), 2);
        let whole = 4096 - HEADER_SIZE;

        unsafe {
            let a = allocator.allocate(whole);
            let q = allocator.allocate(whole);
            // Back to back in memory, but separate regions
            assert_eq!(q, a.add(4096));
            allocator.release(q);
            write_pattern(a, whole, 21);

            let grown = allocator.resize(a, whole + 100);
            assert!(!grown.is_null());
            assert_ne!(grown, a);
            assert_eq!(grown, a.add(2 * 4096));
            assert!(has_pattern(grown, whole, 21));
        }

        let stats = assert_valid(&allocator);
        assert_eq!(stats.regions, 3);
        assert_eq!(allocator.source.releases, 0);
        assert_eq!(allocator.source.acquisitions, 3);
    }

    #[test]
    fn grow_moves_when_free_neighbour_is_too_small() {
        let mut allocator = RawAlloc::new(ToyHeap::default());

        unsafe {
            let p = allocator.allocate(40);
            let n = allocator.allocate(16);
            let blocker = allocator.allocate(16);
            allocator.release(n);
            write_pattern(p, 40, 9);

            // 48 + 16 + header is not enough for 112
            let grown = allocator.resize(p, 100);
            assert_eq!(grown, blocker.add(16 + HEADER_SIZE));
            assert!(has_pattern(grown, 40, 9));

            // The old block merged with its free neighbour
            assert_eq!(allocator.allocate(90), p);
        }
        assert_eq!(allocator.source.acquisitions, 1);
        assert_valid(&allocator);
    }

    #[test]
    fn shrink_in_place_frees_the_tail() {
        let mut allocator = RawAlloc::new(ToyHeap::default());

        unsafe {
            let p = allocator.allocate(256);
            let _blocker = allocator.allocate(16);
            write_pattern(p, 256, 5);

            assert_eq!(allocator.resize(p, 64), p);
            assert!(has_pattern(p, 64, 5));
            assert_eq!(allocator.usable_size(NonNull::new(p).unwrap()), 64);

            let stats = assert_valid(&allocator);
            assert_eq!(stats.free_blocks, 2);

            // The freed tail is reused first-fit
            let tail = allocator.allocate(256 - 64 - HEADER_SIZE);
            assert_eq!(tail, p.add(64 + HEADER_SIZE));
        }
        assert_valid(&allocator);
    }

    #[test]
    fn shrink_merges_tail_with_free_neighbour() {
        let mut allocator = RawAlloc::new(ToyHeap::default());

        unsafe {
            let p = allocator.allocate(256);
            assert_eq!(allocator.resize(p, 64), p);
        }
        // The tail merged straight into the rest of the region
        let stats = assert_valid(&allocator);
        assert_eq!(stats.blocks, 2);
        assert_eq!(stats.free_size, 4096 - 2 * HEADER_SIZE - 64);
    }

    #[test]
    fn release_null_is_a_no_op() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        unsafe { allocator.release(null_mut()) };
        assert!(allocator.blocks.is_empty());
        assert_eq!(allocator.source.acquisitions, 0);
    }

    #[test]
    fn released_memory_is_reused() {
        let mut allocator = RawAlloc::new(ToyHeap::default());

        unsafe {
            let first = allocator.allocate(100);
            allocator.release(first);
            let second = allocator.allocate(80);
            assert_eq!(first, second);
        }
        assert_eq!(allocator.source.acquisitions, 1);
        assert_valid(&allocator);
    }

    #[test]
    fn adjacent_blocks_coalesce() {
        for &forwards in &[true, false] {
            let mut allocator = RawAlloc::new(ToyHeap::default());

            unsafe {
                // Together, these two fill the whole region
                let a = allocator.allocate(2000);
                let b = allocator.allocate(2000);
                assert_eq!(b, a.add(2000 + HEADER_SIZE));
                assert_eq!(assert_valid(&allocator).free_blocks, 0);

                if forwards {
                    allocator.release(a);
                    allocator.release(b);
                } else {
                    allocator.release(b);
                    allocator.release(a);
                }
                let stats = assert_valid(&allocator);
                assert_eq!(stats.blocks, 1);

                let c = allocator.allocate(3000);
                assert_eq!(c, a);
            }
            assert_eq!(allocator.source.acquisitions, 1);
        }
    }

    #[test]
    fn middle_release_merges_both_sides() {
        let mut allocator = RawAlloc::new(ToyHeap::default());

        unsafe {
            let a = allocator.allocate(64);
            let b = allocator.allocate(64);
            let c = allocator.allocate(64);
            let _d = allocator.allocate(64);

            allocator.release(a);
            allocator.release(c);
            assert_eq!(assert_valid(&allocator).free_blocks, 3);

            allocator.release(b);
            let stats = assert_valid(&allocator);
            assert_eq!(stats.free_blocks, 2);
            assert_eq!(allocator.usable_size(NonNull::new(a).unwrap()), 3 * 64 + 2 * HEADER_SIZE);
        }
    }

    #[test]
    fn small_allocations_share_a_region() {
        let mut allocator = RawAlloc::new(ToyHeap::default());

        unsafe {
            for _ in 0..50 {
                assert!(!allocator.allocate(32).is_null());
            }
        }
        assert_eq!(allocator.source.acquisitions, 1);
        assert_eq!(assert_valid(&allocator).used_size, 50 * 32);
    }

    #[test]
    fn large_allocation_spans_pages() {
        let mut allocator = RawAlloc::new(ToyHeap::default());

        unsafe {
            let p = allocator.allocate(10_000);
            assert!(!p.is_null());
            raw::fill(p, 1, 10_000);
        }
        assert_eq!(allocator.source.acquisitions, 1);
        assert_eq!(allocator.source.size, 3 * 4096);
        assert_valid(&allocator);
    }

    #[test]
    fn failed_growth_keeps_original() {
        let mut allocator = RawAlloc::new(ToyHeap::with_limit(4096));

        unsafe {
            let p = allocator.allocate(1000);
            let _blocker = allocator.allocate(2000);
            write_pattern(p, 1000, 42);

            assert!(allocator.resize(p, 8000).is_null());
            assert_eq!(
                allocator.try_resize(NonNull::new(p).unwrap(), 8000),
                Err(AllocError::Exhausted)
            );

            assert!(has_pattern(p, 1000, 42));
            assert_eq!(allocator.usable_size(NonNull::new(p).unwrap()), 1008);
            assert_eq!(assert_valid(&allocator).used_size, 1008 + 2000);

            allocator.release(p);
        }
        assert_eq!(allocator.source.acquisitions, 1);
        assert_valid(&allocator);
    }

    #[test]
    fn separate_regions_never_merge() {
        let mut allocator = RawAlloc::with_spare_regions(ToyHeap::default(), 2);
        let whole = 4096 - HEADER_SIZE;

        unsafe {
            // ToyHeap places these regions back to back in memory
            let a = allocator.allocate(whole);
            let b = allocator.allocate(whole);
            assert_eq!(b, a.add(4096));

            allocator.release(a);
            allocator.release(b);
        }

        let stats = assert_valid(&allocator);
        assert_eq!(stats.blocks, 2);
        assert_eq!(stats.regions, 2);
        assert_eq!(allocator.source.releases, 0);
    }

    #[test]
    fn empty_regions_beyond_spares_are_released() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        let whole = 4096 - HEADER_SIZE;

        unsafe {
            let a = allocator.allocate(whole);
            let b = allocator.allocate(100);
            assert_eq!(allocator.region_count(), 2);

            // The first empty region is kept as a spare
            allocator.release(b);
            assert_eq!(allocator.source.releases, 0);
            assert_eq!(allocator.region_count(), 2);
            assert_valid(&allocator);

            // A second one goes back to the source
            allocator.release(a);
            assert_eq!(allocator.source.releases, 1);
            assert_eq!(allocator.region_count(), 1);

            // What is left is b's region
            assert_eq!(allocator.allocate(100), b);
        }
        assert_eq!(assert_valid(&allocator).free_blocks, 1);
    }

    #[test]
    fn emptied_region_is_reused_while_others_are_busy() {
        let mut allocator = RawAlloc::new(ToyHeap::default());

        unsafe {
            let _small = allocator.allocate(100);
            let first = allocator.allocate(5000);
            assert_eq!(allocator.source.acquisitions, 2);

            allocator.release(first);
            let second = allocator.allocate(5000);
            assert_eq!(second, first);

            for _ in 0..10 {
                allocator.release(second);
                assert_eq!(allocator.allocate(5000), first);
            }
        }
        assert_eq!(allocator.source.acquisitions, 2);
        assert_eq!(allocator.source.releases, 0);
        assert_valid(&allocator);
    }

    #[test]
    fn no_spares_releases_everything() {
        let mut allocator = RawAlloc::with_spare_regions(ToyHeap::default(), 0);

        unsafe {
            let p = allocator.allocate(100);
            let q = allocator.allocate(100);
            allocator.release(p);
            assert_eq!(allocator.source.releases, 0);
            allocator.release(q);
        }
        assert_eq!(allocator.source.releases, 1);
        assert_eq!(allocator.source.released_size, 4096);
        assert!(allocator.blocks.is_empty());
        assert_valid(&allocator);
    }

    #[test]
    fn release_all_returns_every_region() {
        let mut allocator = RawAlloc::new(ToyHeap::default());

        unsafe {
            allocator.allocate(4000);
            allocator.allocate(4000);
            allocator.allocate(10_000);
            assert_eq!(allocator.region_count(), 3);

            allocator.release_all();
        }
        assert_eq!(allocator.source.releases, 3);
        assert_eq!(allocator.source.released_size, allocator.source.size);
        assert!(allocator.blocks.is_empty());
        assert_eq!(allocator.region_count(), 0);
    }

    #[test]
    fn generic_allocator_initializes_lazily() {
        let allocator: GenericAllocator<ToyHeap> = GenericAllocator::new();

        unsafe {
            // Nothing to tear down yet
            allocator.teardown();

            let p = allocator.allocate(24);
            assert!(!p.is_null());
            let q = allocator.zero_allocate(4, 8);
            assert!(core::slice::from_raw_parts(q, 32).iter().all(|&b| b == 0));
            let p = allocator.resize(p, 500);
            assert!(!p.is_null());
            allocator.release(q);
            allocator.release(p);

            let (validity, stats) = allocator.stats();
            assert!(validity.is_valid());
            assert_eq!(stats.used_size, 0);

            allocator.teardown();
            assert_eq!(allocator.get_raw().source.releases, 1);
        }
    }
}
