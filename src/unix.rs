//! Raw `mmap` and `munmap` system calls for x86_64 Linux, used when the crate
//! is built without libc.

use core::arch::asm;
use core::ptr::NonNull;

use thiserror::Error;

//============================================================
// System call numbers

const SYS_MMAP: usize = 9;
const SYS_MUNMAP: usize = 11;

//============================================================
// Flags for protection

pub const PROT_READ: usize = 0x01; // pages can be read
pub const PROT_WRITE: usize = 0x02; // pages can be written

//============================================================
// Flags for sharing type and options

pub const MAP_PRIVATE: usize = 0x02; // changes are private
pub const MAP_ANONYMOUS: usize = 0x20; // not backed by a file

/// Page size on x86_64 Linux.
pub const PAGE_SIZE: usize = 4096;

// Return values in [-4095, -1] are negated errno values.
const MAX_ERRNO: usize = 4095;
const ENOMEM: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MmapError {
    #[error("system call failed with errno {0}")]
    Errno(usize),
    #[error("{0} bytes cannot be rounded up to whole pages")]
    TooLarge(usize),
}

unsafe fn syscall6(
    number: usize,
    a1: usize,
    a2: usize,
    a3: usize,
    a4: usize,
    a5: usize,
    a6: usize,
) -> Result<usize, MmapError> {
    let ret: usize;
    asm!(
        "syscall",
        inlateout("rax") number => ret,
        in("rdi") a1,
        in("rsi") a2,
        in("rdx") a3,
        in("r10") a4,
        in("r8") a5,
        in("r9") a6,
        lateout("rcx") _,
        lateout("r11") _,
        options(nostack),
    );

    if ret > usize::MAX - MAX_ERRNO {
        return Err(MmapError::Errno(ret.wrapping_neg()));
    }
    Ok(ret)
}

/// Map `len` bytes of private, anonymous, zeroed, read-write memory.
///
/// # Safety
///
/// The returned memory is untracked; the caller owns it until `munmap`.
pub unsafe fn mmap(len: usize) -> Result<NonNull<u8>, MmapError> {
    let addr = syscall6(
        SYS_MMAP,
        // Address we want the memory at. We don't care, so null it is.
        0,
        len,
        PROT_READ | PROT_WRITE,
        MAP_PRIVATE | MAP_ANONYMOUS,
        // No file descriptor
        usize::MAX,
        0,
    )?;

    NonNull::new(addr as *mut u8).ok_or(MmapError::Errno(ENOMEM))
}

/// Unmap `len` bytes at `ptr`.
///
/// # Safety
///
/// `ptr` and `len` must describe memory previously returned by `mmap` that
/// nothing references anymore.
pub unsafe fn munmap(ptr: NonNull<u8>, len: usize) -> Result<(), MmapError> {
    syscall6(SYS_MUNMAP, ptr.as_ptr() as usize, len, 0, 0, 0, 0)?;
    Ok(())
}
