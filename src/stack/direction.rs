//! Stack-direction probe.
//!
//! Grounded in `libhandler.c`'s `infer_stackdir`/`stack_diff`/`stack_top`/
//! `stack_bottom`/`stack_isbelow`: we determine once whether the native
//! stack grows toward higher or lower addresses, then give every later
//! caller a direction-neutral view where "up" means further from the
//! bottom and "top" means the most recently pushed frame.
//!
//! On every architecture this crate actually runs on (x86_64) the stack
//! grows down, but the probe still measures it at runtime rather than
//! hard-coding that, matching the original's portable formulation.

use std::cell::Cell;
use std::sync::Once;

thread_local! {
    // `stackbottom` in the original is a *process*-global (`static const
    // void* stackbottom`) rebound per `lh_init` call on the calling thread;
    // since each thread has its own stack, we keep it thread-local instead
    // of reusing one process-wide value that only happens to be correct for
    // whichever thread called `lh_init` first.
    static STACK_BOTTOM: Cell<*const u8> = const { Cell::new(std::ptr::null()) };
}

static STACK_GROWS_UP: Once = Once::new();
static mut GROWS_UP: bool = false;

#[inline(never)]
fn stack_address(p: *const u8) -> *const u8 {
    // Prevents an optimizer from concluding a local's address is returned
    // (UB) and folding the comparison away; mirrors `_stack_address`.
    p
}

#[inline(never)]
fn get_stack_top() -> *const u8 {
    let top: *const u8 = std::ptr::null();
    stack_address(&top as *const *const u8 as *const u8)
}

#[inline(never)]
fn infer_direction() -> bool {
    let mark: *const u8 = std::ptr::null();
    let mark_addr = stack_address(&mark as *const *const u8 as *const u8);
    let top = get_stack_top();
    mark_addr < top
}

/// Ensure the stack-direction probe has run and the calling thread's
/// `stackbottom` is recorded. Mirrors `lh_init`'s call to `infer_stackdir`
/// (process-wide, once) followed by per-thread `stackbottom = get_stack_top()`.
pub(crate) fn ensure_initialized() {
    // SAFETY: `Once` guarantees this write happens-before any read of
    // `GROWS_UP`, and the value is written exactly once for the process.
    STACK_GROWS_UP.call_once(|| unsafe {
        GROWS_UP = infer_direction();
    });
    STACK_BOTTOM.with(|cell| {
        if cell.get().is_null() {
            cell.set(get_stack_top());
        }
    });
}

fn grows_up() -> bool {
    unsafe { GROWS_UP }
}

/// The byte-signed difference `p - q`, as if the stack always grew up.
pub(crate) fn diff(p: *const u8, q: *const u8) -> isize {
    let raw = p as isize - q as isize;
    if grows_up() {
        raw
    } else {
        -raw
    }
}

/// Is `p` strictly below `q` in the stack-neutral sense (further from the
/// top, closer to the bottom)?
pub(crate) fn is_below(p: *const u8, q: *const u8) -> bool {
    if grows_up() {
        p < q
    } else {
        p > q
    }
}

/// The stack-neutral bottom of a `[base, base+size)` region -- the end
/// furthest from the current top, used as the cstack storage key regardless
/// of growth direction. On a down-growing stack this is `base + size`, the
/// *highest* address of the region, not the lowest.
pub(crate) fn region_base(base: *const u8, size: isize) -> *const u8 {
    if grows_up() {
        base
    } else {
        unsafe { base.byte_add(size as usize) }
    }
}

/// The address one-past the most-recently-pushed byte of a `[base,
/// base+size)` region.
pub(crate) fn region_top(base: *const u8, size: isize) -> *const u8 {
    if grows_up() {
        unsafe { base.byte_add(size as usize) }
    } else {
        base
    }
}

/// Return the calling thread's current stack top (most recent frame),
/// mirroring `get_stack_top()`.
pub(crate) fn current_top() -> *const u8 {
    get_stack_top()
}
