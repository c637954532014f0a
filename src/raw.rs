//! Freestanding memory primitives.
//!
//! Nothing in here may call into another allocator or into `libc`: these are
//! the only byte-level helpers the engine relies on.

/// Set `len` bytes starting at `dst` to `byte`.
///
/// # Safety
///
/// `dst` must be valid for writes of `len` bytes.
pub unsafe fn fill(dst: *mut u8, byte: u8, len: usize) {
    let mut i = 0;
    while i < len {
        dst.add(i).write(byte);
        i += 1;
    }
}

/// Copy `len` bytes from `src` to `dst`, front to back.
///
/// # Safety
///
/// `src` must be valid for reads and `dst` valid for writes of `len` bytes.
/// The spans may overlap only if `dst <= src`.
pub unsafe fn copy(dst: *mut u8, src: *const u8, len: usize) {
    let mut i = 0;
    while i < len {
        dst.add(i).write(src.add(i).read());
        i += 1;
    }
}

/// Multiply `a` and `b`, returning `None` if the product does not fit in a
/// `usize`.
///
/// The wrapped product is divided back by one operand; it is only accepted
/// if that recovers the other operand exactly.
pub fn checked_multiply(a: usize, b: usize) -> Option<usize> {
    if a == 0 || b == 0 {
        return Some(0);
    }

    let product = a.wrapping_mul(b);
    if product % a != 0 || product / a != b {
        return None;
    }

    Some(product)
}

/// Round `value` up to the nearest multiple of `increment`.
///
/// Returns `None` if the result would overflow. `increment` must be nonzero.
pub fn round_up(value: usize, increment: usize) -> Option<usize> {
    if value == 0 {
        return Some(0);
    }
    ((value - 1) / increment).checked_add(1)?.checked_mul(increment)
}
