//! Fragment, grounded in `libhandler.c`'s `fragment_alloc`,
//! `fragment_acquire`, `_fragment_release`, `fragment_free_`.
//!
//! A fragment is what a non-handler capture (a first-class capture that
//! stops below the nearest handler) hands back: just enough to re-enter a
//! saved point below the handler stack, with no handler-stack slice of its
//! own to restore.

use std::ptr::NonNull;

use crate::alloc::{alloc_boxed_raw, free_boxed_raw};
use crate::handler_def::Value;
use crate::stack::arch::JmpBuf;
use crate::stack::cstack::CStack;
use crate::stats;

pub(crate) struct Fragment {
    pub entry: JmpBuf,
    pub cstack: CStack,
    /// Strictly positive while alive. Set to `-1` the instant the last
    /// reference is released, a sticky dead-state sentinel so a second
    /// release on the same pointer is caught instead of silently
    /// re-entering a live refcount range.
    refcount: isize,
    /// The resume argument, populated just before jumping back into this
    /// fragment's entry point.
    pub res: Value,
}

impl Fragment {
    /// Allocate a fresh fragment with refcount 1, mirroring `fragment_alloc`.
    pub fn alloc() -> NonNull<Fragment> {
        stats::bump!(rcont_captured_fragment);
        alloc_boxed_raw(Fragment {
            entry: JmpBuf::zeroed(),
            cstack: CStack::empty(),
            refcount: 1,
            res: Value::null(),
        })
    }

    /// Bump the refcount, mirroring `fragment_acquire`. No-op (and fatal in
    /// debug) if the fragment is already dead.
    pub unsafe fn acquire(ptr: NonNull<Fragment>) -> NonNull<Fragment> {
        unsafe {
            let f = &mut *ptr.as_ptr();
            debug_assert!(f.refcount > 0, "acquiring a released fragment");
            f.refcount += 1;
        }
        ptr
    }

    /// Whether this is the only live reference, mirroring the
    /// `f->refcount == 1` check `hstack_pop_upto`/`cstack_extendfrom` use to
    /// decide whether an unwind may steal this fragment's cstack buffer
    /// outright instead of copying it.
    ///
    /// ## Safety
    /// `ptr` must point to a live `Fragment`.
    pub unsafe fn is_unique(ptr: NonNull<Fragment>) -> bool {
        unsafe { (*ptr.as_ptr()).refcount == 1 }
    }

    /// Drop a reference, freeing the fragment once the last one is gone.
    /// Mirrors `_fragment_release`/`fragment_free_`.
    pub unsafe fn release(ptr: NonNull<Fragment>) {
        unsafe {
            let f = &mut *ptr.as_ptr();
            debug_assert!(f.refcount > 0, "double release of a fragment");
            f.refcount -= 1;
            if f.refcount == 0 {
                f.refcount = -1;
                stats::bump!(rcont_released);
                stats::bump!(rcont_released_size, f.cstack.size.max(0) as u64);
                free_boxed_raw(ptr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_fragment_starts_at_refcount_one() {
        let f = Fragment::alloc();
        unsafe {
            assert_eq!((*f.as_ptr()).refcount, 1);
            Fragment::release(f);
        }
    }

    #[test]
    fn acquire_then_release_twice_frees_on_the_second_release() {
        let f = Fragment::alloc();
        unsafe {
            Fragment::acquire(f);
            assert_eq!((*f.as_ptr()).refcount, 2);
            Fragment::release(f);
            assert_eq!((*f.as_ptr()).refcount, 1);
            Fragment::release(f);
        }
    }

}
