#![cfg_attr(not(test), no_std)]

//! A first-fit `malloc`/`calloc`/`realloc`/`free` engine over raw pages.
//!
//! Memory comes from the environment one page-rounded region at a time
//! (`mmap` on Unix). Each region is carved into blocks, each with a header in
//! front of its payload:
//!
//! ```text
//! region                                  region
//! +--------+-------+--------+-----------+ +--------+---------------------+
//! | header | used  | header |   free    | | header |        free         |
//! +--------+-------+--------+-----------+ +--------+---------------------+
//!     |                ^  |                  ^
//!     +----------------+  +------------------+
//! ```
//!
//! Every header is linked, in address order, into a single chain across all
//! regions. Allocation walks the chain for the first free block that fits
//! and splits it; release marks the block free and merges it with its free
//! physical neighbours, returning a region to the environment once it is
//! entirely free.
//!
//! The engine itself never logs, never panics on bad input, and reports
//! failure only through null pointers (or `AllocError` from the `try_`
//! methods).
//!
//! ```no_run
//! use region_malloc::UnixAllocator;
//!
//! #[global_allocator]
//! static ALLOCATOR: UnixAllocator = UnixAllocator::new();
//!
//! fn main() {
//!     let v: Vec<u32> = vec![1, 2, 3];
//!     println!("{:?}", v);
//! }
//! ```

#[cfg(all(
    not(feature = "use_libc"),
    not(all(target_os = "linux", target_arch = "x86_64"))
))]
compile_error!("raw system calls are only implemented for x86_64 Linux; enable `use_libc`");

pub mod allocators;
pub mod blocklist;
pub mod raw;
#[cfg(not(feature = "use_libc"))]
pub mod unix;

pub use crate::allocators::{AllocError, GenericAllocator, RawAlloc, RegionSource, UnixAllocator};
