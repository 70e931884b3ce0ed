//! Resumption, grounded in `libhandler.c`'s `resume_alloc`,
//! `resume_acquire`, `_resume_release`, `_resume_free`, `lh_call_resume`,
//! `lh_scoped_resume`, `lh_release_resume`.
//!
//! A resumption is a full first-class continuation: a saved cstack, a copy
//! of every handler frame that was installed above the handler being
//! yielded to (so resuming reinstalls them), and a jump entry point.

use std::ptr::NonNull;

use crate::alloc::{alloc_boxed_raw, free_boxed_raw};
use crate::handler_def::Value;
use crate::hstack::HStack;
use crate::stack::arch::JmpBuf;
use crate::stack::cstack::CStack;
use crate::stats;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ResumeKind {
    /// May be resumed at most once, and only within the dynamic extent of
    /// the handler that captured it; released automatically if that extent
    /// ends without it being used.
    Scoped,
    /// A full first-class continuation: may be resumed any number of
    /// times, from anywhere, including after the handler has returned.
    General,
}

pub(crate) struct Resumption {
    pub kind: ResumeKind,
    pub(crate) refcount: isize,
    pub entry: JmpBuf,
    pub cstack: CStack,
    pub hstack: HStack,
    /// The argument delivered to the resumed computation; written just
    /// before jumping into `entry`.
    pub arg: Value,
    /// How many times this resumption has been resumed so far.
    pub resumptions: u64,
}

impl Resumption {
    pub fn alloc(kind: ResumeKind) -> NonNull<Resumption> {
        match kind {
            ResumeKind::Scoped => stats::bump!(rcont_captured_scoped),
            ResumeKind::General => stats::bump!(rcont_captured_resume),
        }
        alloc_boxed_raw(Resumption {
            kind,
            refcount: 1,
            entry: JmpBuf::zeroed(),
            cstack: CStack::empty(),
            hstack: HStack::new(),
            arg: Value::null(),
            resumptions: 0,
        })
    }

    /// Relocate a pointer that was valid on the native stack at capture
    /// time into this resumption's heap-copied cstack, mirroring the
    /// original's `cstack_ptr` / the `yield_n` argument-array trick: a
    /// stack-local array passed by pointer through `yield` only survives a
    /// first-class capture if every pointer into it is rewritten to point
    /// into the copy instead of the now-stale native stack slot.
    ///
    /// ## Safety
    /// `ptr` must point into the native stack region this resumption's
    /// `cstack` was captured from.
    pub unsafe fn relocate_ptr<T>(&self, ptr: *const T) -> *const T {
        if self.cstack.is_empty() {
            return ptr;
        }
        // `cstack.base` is the lowest native address copied -- byte 0 of
        // `bytes` -- regardless of growth direction; `cstack.bottom()` is
        // the stack-neutral bottom instead, which is the *highest* address
        // on a down-growing stack and would underflow this subtraction.
        let base = self.cstack.base as usize;
        let addr = ptr as usize;
        let bytes = match self.cstack.bytes {
            Some(b) => b.as_ptr() as usize,
            None => return ptr,
        };
        (bytes + (addr - base)) as *const T
    }
}

/// Bump the refcount, mirroring `resume_acquire`.
///
/// ## Safety
/// `ptr` must point to a live (not yet fully released) `Resumption`.
pub(crate) unsafe fn acquire(ptr: NonNull<Resumption>) -> NonNull<Resumption> {
    unsafe {
        let r = &mut *ptr.as_ptr();
        debug_assert!(r.refcount > 0, "acquiring a released resumption");
        r.refcount += 1;
    }
    ptr
}

/// Drop a reference, freeing the resumption (and releasing everything its
/// captured handler stack owns) once the last one is gone. Mirrors
/// `_resume_release`/`_resume_free`.
///
/// ## Safety
/// `ptr` must point to a live `Resumption` acquired through [`acquire`] or
/// [`Resumption::alloc`].
pub(crate) unsafe fn release(ptr: NonNull<Resumption>) {
    unsafe {
        let r = &mut *ptr.as_ptr();
        debug_assert!(r.refcount > 0, "double release of a resumption");
        r.refcount -= 1;
        if r.refcount == 0 {
            r.refcount = -1;
            stats::bump!(rcont_released);
            stats::bump!(rcont_released_size, r.cstack.size.max(0) as u64);
            free_boxed_raw(ptr);
        }
    }
}

/// Resume a captured continuation with `value`, returning whatever the next
/// `yield`/completion eventually delivers back. Mirrors `lh_call_resume`.
/// The actual jump machinery lives in [`crate::engine`], which owns the
/// live, thread-local handler stack this resumption's frames get spliced
/// onto.
///
/// ## Safety
/// `ptr` must point to a live `Resumption` not already consumed past its
/// resume discipline (a `Scoped` one resumed more than once).
pub(crate) unsafe fn call_resume(ptr: NonNull<Resumption>, value: Value) -> Value {
    match unsafe { (*ptr.as_ptr()).kind } {
        ResumeKind::Scoped => stats::bump!(rcont_resumed_scoped),
        ResumeKind::General => stats::bump!(rcont_resumed_resume),
    }
    unsafe { crate::engine::resume_value(ptr, value) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_resumption_starts_at_refcount_one_with_no_resumes_recorded() {
        let r = Resumption::alloc(ResumeKind::General);
        unsafe {
            assert_eq!((*r.as_ptr()).refcount, 1);
            assert_eq!((*r.as_ptr()).resumptions, 0);
            release(r);
        }
    }

    #[test]
    fn acquire_is_balanced_by_two_releases() {
        let r = Resumption::alloc(ResumeKind::General);
        unsafe {
            acquire(r);
            assert_eq!((*r.as_ptr()).refcount, 2);
            release(r);
            assert_eq!((*r.as_ptr()).refcount, 1);
            release(r);
        }
    }

    #[test]
    fn relocate_ptr_rewrites_an_address_into_the_captured_copy() {
        crate::stack::direction::ensure_initialized();
        let data = [1u8, 2, 3, 4];
        let lo = data.as_ptr();
        let hi = unsafe { lo.add(data.len()) };
        // `capture`'s parameters are stack-neutral (bottom, top); on x86_64
        // (down-growing) the neutral top is the lower address, so derive the
        // order from `is_below` instead of assuming an up-growing stack.
        let (bottom, top) = if crate::stack::direction::is_below(lo, hi) {
            (lo, hi)
        } else {
            (hi, lo)
        };
        let r = Resumption::alloc(ResumeKind::General);
        unsafe {
            (*r.as_ptr()).cstack = CStack::capture(bottom, top);
        }
        assert!(!unsafe { (*r.as_ptr()).cstack.is_empty() });
        let mid = unsafe { data.as_ptr().add(2) };
        let relocated = unsafe { (*r.as_ptr()).relocate_ptr(mid) };
        assert_ne!(relocated, mid);
        assert_eq!(unsafe { *relocated }, data[2]);
        unsafe { release(r) };
    }
}
