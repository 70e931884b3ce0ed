//! Captured-stack buffer, grounded in `libhandler.c`'s `cstack`
//! functions (`cstack_init`, `cstack_free`, `capture_cstack`,
//! `cstack_extendfrom`).

use std::ptr::NonNull;

use crate::alloc::{checked_alloc, checked_free};
use crate::stack::direction;

/// An owned heap copy of a contiguous region of the native stack.
///
/// Either empty (`bytes = None, size = 0`) or `bytes` points to exactly
/// `size` bytes copied from `[base, base+size)` in stack-direction-neutral
/// terms, where `base` is always the lowest address copied.
pub(crate) struct CStack {
    pub base: *const u8,
    pub size: isize,
    pub bytes: Option<NonNull<u8>>,
}

impl CStack {
    pub const fn empty() -> CStack {
        CStack {
            base: std::ptr::null(),
            size: 0,
            bytes: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_none()
    }

    /// The one-past-the-end address of this region.
    pub fn top(&self) -> *const u8 {
        direction::region_top(self.base, self.size)
    }

    /// The stack-neutral bottom of this region -- the end furthest from the
    /// current top. On a down-growing stack this is the *highest* address
    /// of the region, not the lowest; use `base` directly when what's
    /// actually needed is the lowest native address copied (byte 0 of
    /// `bytes`).
    pub fn bottom(&self) -> *const u8 {
        direction::region_base(self.base, self.size)
    }

    fn free(&mut self) {
        if let Some(bytes) = self.bytes.take() {
            checked_free(bytes, self.size as usize);
        }
        self.size = 0;
        self.base = std::ptr::null();
    }

    /// Capture `[min(bottom,top), min+size)` into a fresh heap buffer, or
    /// record an empty capture if `top` is not above `bottom`. Mirrors
    /// `capture_cstack`.
    pub fn capture(bottom: *const u8, top: *const u8) -> CStack {
        let size = direction::diff(top, bottom);
        if size <= 0 {
            return CStack {
                base: bottom,
                size: 0,
                bytes: None,
            };
        }
        let base = if (bottom as usize) <= (top as usize) {
            bottom
        } else {
            top
        };
        let dst = checked_alloc(size as usize);
        unsafe {
            std::ptr::copy_nonoverlapping(base, dst.as_ptr(), size as usize);
        }
        CStack {
            base,
            size,
            bytes: Some(dst),
        }
    }

    /// Extend `self` in place so it covers the union of its own range and
    /// `other`'s. If `self` is empty, steal `other`'s buffer (consuming it)
    /// when `may_consume` allows; otherwise copy. If the two regions are
    /// disjoint, the live gap between them is copied from the current
    /// native stack first, matching `cstack_extendfrom`'s "copy the current
    /// stack first into the gap" step, so a later full restore reconstructs
    /// the whole span correctly.
    pub fn extend(&mut self, other: &mut CStack, may_consume: bool) {
        if other.bytes.is_none() {
            return;
        }
        if self.bytes.is_none() {
            if may_consume {
                *self = CStack {
                    base: other.base,
                    size: other.size,
                    bytes: other.bytes.take(),
                };
                other.size = 0;
            } else {
                let dst = checked_alloc(other.size as usize);
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        other.bytes.unwrap().as_ptr(),
                        dst.as_ptr(),
                        other.size as usize,
                    );
                }
                self.base = other.base;
                self.size = other.size;
                self.bytes = Some(dst);
            }
            return;
        }

        let self_base = self.base as usize;
        let self_end = self_base + self.size as usize;
        let other_base = other.base as usize;
        let other_end = other_base + other.size as usize;

        let new_base = self_base.min(other_base);
        let new_end = self_end.max(other_end);
        let new_size = new_end - new_base;

        if self_base != new_base || self.size as usize != new_size {
            let new_bytes = checked_alloc(new_size);
            // Disjoint ranges leave a gap neither buffer covers; that gap
            // must still reflect *live* stack contents so a later restore
            // reconstructs the whole span, not just the two captured ends.
            if other_base > self_end || other_end < self_base {
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        new_base as *const u8,
                        new_bytes.as_ptr(),
                        new_size,
                    );
                }
            }
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.bytes.unwrap().as_ptr(),
                    new_bytes.as_ptr().add(self_base - new_base),
                    self.size as usize,
                );
            }
            checked_free(self.bytes.unwrap(), self.size as usize);
            self.bytes = Some(new_bytes);
            self.base = new_base as *const u8;
            self.size = new_size as isize;
        }

        unsafe {
            std::ptr::copy_nonoverlapping(
                other.bytes.unwrap().as_ptr(),
                self.bytes.unwrap().as_ptr().add(other_base - new_base),
                other.size as usize,
            );
        }
    }

    /// Write this capture's bytes back to the native stack range they were
    /// copied from, then free the heap copy. Used by an unwind that must
    /// restore fragment memory crossed along the way before its jump lands
    /// (spec §4.6): unlike a capture resumed into a possibly-deeper frame,
    /// the range here always sits within the currently live stack extent
    /// below the unwind's own call frame, so no `alloca`-style stack growth
    /// is needed first -- a direct copy is enough.
    pub(crate) fn restore_in_place(self) {
        if let Some(bytes) = self.bytes {
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base as *mut u8, self.size as usize);
            }
        }
    }
}

impl Drop for CStack {
    fn drop(&mut self) {
        self.free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_capture_when_not_above() {
        crate::stack::direction::ensure_initialized();
        let p = 0usize as *const u8;
        let cs = CStack::capture(p, p);
        assert!(cs.is_empty());
        assert_eq!(cs.size, 0);
    }

    #[test]
    fn capture_copies_bytes() {
        crate::stack::direction::ensure_initialized();
        let data = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let lo = data.as_ptr();
        let hi = unsafe { lo.add(data.len()) };
        let (bottom, top) = if crate::stack::direction::is_below(lo, hi) {
            (lo, hi)
        } else {
            (hi, lo)
        };
        let cs = CStack::capture(bottom, top);
        assert!(!cs.is_empty());
        assert_eq!(cs.size as usize, data.len());
    }
}
