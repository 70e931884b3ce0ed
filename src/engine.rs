//! The handle/yield state machine, grounded in `libhandler.c`'s
//! `lh_handle`, `_lh_yield`/`lh_yield`, `lh_call_resume`, and the
//! `captureresume` unwind-and-capture routine.
//!
//! Every thread owns exactly one handler stack. `handle` installs a frame
//! and runs an action on top of the native stack, exactly like a plain
//! function call, as long as nothing below ever yields. A `yield` that
//! finds a `Tail`/`TailNoop` operation never touches the stack at all --
//! the operation body just runs in place. Anything else jumps back into
//! the handler's own call frame, which was never actually unwound (just
//! "parked" by the jump), carrying a captured continuation for `Scoped`/
//! `General` operations.
//!
//! Resuming a captured continuation is expected to happen synchronously,
//! within the dynamic extent of the operation body that received it (the
//! common pattern every test scenario in this crate uses: a generator
//! resuming its own caller immediately, a handler composing results before
//! returning). The copy/restore scheme this engine uses physically requires
//! the installing `handle` call's native frame still be live when
//! `call_resume`/`scoped_resume` runs, since resuming writes the captured
//! bytes back to their *original* addresses and relies on everything below
//! that address range -- in particular the installing `handle` frame --
//! still being exactly where it was. A one-shot stackful coroutine has the
//! same "resume while the docking frame is still around" shape; this engine
//! simply allows more than one resume and lets resumes nest under further
//! handlers.

use std::ptr::NonNull;

use crate::effect::EffectTag;
use crate::error::{fatal, EngineError};
use crate::fragment::Fragment;
use crate::handler_def::{HandlerDef, OpKind, Resume, Value};
use crate::hstack::{EffectFrame, HStack, ResumeSlot};
use crate::resumption::{ResumeKind, Resumption};
use crate::stack::arch::{self, JmpBuf};
use crate::stack::cstack::CStack;
use crate::stack::direction;
use crate::stats;
use std::cell::{Cell, RefCell};

thread_local! {
    static LIVE_HSTACK: RefCell<HStack> = RefCell::new(HStack::new());
    static NEXT_HANDLER_ID: Cell<u64> = const { Cell::new(1) };
}

fn next_handler_id() -> u64 {
    NEXT_HANDLER_ID.with(|c| {
        let id = c.get();
        c.set(id + 1);
        id
    })
}

fn with_hstack<R>(f: impl FnOnce(&mut HStack) -> R) -> R {
    LIVE_HSTACK.with(|hs| f(&mut hs.borrow_mut()))
}

fn cstack_bytes(cs: &CStack) -> Option<*const u8> {
    cs.bytes.map(|b| b.as_ptr() as *const u8)
}

/// Install a handler for one operation and run `action` under it, mirroring
/// `lh_handle`. Returns the (possibly result-transformed) value produced
/// either by `action` returning normally or by an operation that never
/// resumed.
pub fn handle(hdef: &HandlerDef, action: impl FnOnce(Value) -> Value, arg: Value) -> Value {
    direction::ensure_initialized();
    let id = next_handler_id();
    let stackbase = direction::current_top();
    let hdef_ptr = hdef as *const HandlerDef;

    let offset = with_hstack(|hs| hs.push_effect(hdef.effect, id, hdef_ptr, stackbase));
    // Keep the save_context call immediately after taking `entry_ptr`: no
    // hstack push may happen in between, since a push can reallocate the
    // buffer and invalidate this pointer.
    let entry_ptr: *mut JmpBuf = with_hstack(|hs| hs.effect_entry_mut(offset));
    let first = unsafe { arch::save_context(entry_ptr) };

    if first == 0 {
        let result = action(arg);
        with_hstack(|hs| hs.pop(false));
        deliver_or_return(hdef.call_result(result))
    } else {
        let (delivered_arg, resume_slot) = with_hstack(|hs| hs.take_effect_delivery(offset));
        let resume = match resume_slot {
            ResumeSlot::None | ResumeSlot::Tail => Resume::tail(),
            ResumeSlot::Handle(ptr) => Resume::handle(ptr),
        };
        // Pop this handler's own effect frame before the operation body
        // runs, mirroring `handle_with`'s `hstack_pop(hs, op==NULL)`: a
        // later `call_resume` reinstalls a copy of it on top of the
        // fragment frame it pushes (via the resumption's own captured
        // hstack, which now includes this frame -- see `yield_effect`), so
        // the live order after a resume is `[...][fragment][effect]` with
        // the effect frame back on top, not pinned underneath it.
        with_hstack(|hs| hs.pop(false));
        // A captured (Scoped/General) resumption sits in its own scoped
        // frame while the operation body runs (spec §4.6): an unwind that
        // crosses it here releases it exactly like a fragment frame,
        // instead of only the single flag check a direct release at this
        // call site alone could offer.
        if let ResumeSlot::Handle(ptr) = resume_slot {
            with_hstack(|hs| hs.push_scoped(ptr));
        }
        let result = hdef.call_op(resume, delivered_arg);
        if let ResumeSlot::Handle(ptr) = resume_slot {
            // Release iff the kind is exactly `Scoped`: a `General`
            // resumption is a full first-class continuation and stays
            // alive after its handler returns, owned by whoever still
            // holds it.
            let release = unsafe { (*ptr.as_ptr()).kind } == ResumeKind::Scoped;
            with_hstack(|hs| hs.pop(release));
        }
        deliver_or_return(hdef.call_result(result))
    }
}

/// After a `handle` call's own effect frame has been popped and its result
/// transformer applied, check whether a fragment frame is now sitting on
/// top of the handler stack.
/// A fragment there means this `handle` call is not really completing back
/// to its own original caller -- it is the tail end of a
/// [`capture_resume_call`]-style resume that captured this exact call chain
/// to jump back into once the resumed computation ran its course. In that
/// case, restore the fragment's cstack and jump to its entry with `result`
/// instead of returning normally; otherwise just hand `result` back.
fn deliver_or_return(result: Value) -> Value {
    let fragment = with_hstack(|hs| hs.top_is_fragment());
    match fragment {
        None => result,
        Some(fragment) => {
            with_hstack(|hs| hs.pop(false));
            unsafe {
                (*fragment.as_ptr()).res = result;
            }
            let f = unsafe { &*fragment.as_ptr() };
            let bytes = cstack_bytes(&f.cstack);
            unsafe { arch::jump_to(bytes, f.cstack.size, f.cstack.base, &f.entry as *const JmpBuf, 1) }
        }
    }
}

/// The non-tail-call half of resuming a captured continuation: set up a fragment marking *this* call chain as
/// the point to jump back to, then jump into the resumption exactly as
/// [`resume_value`] used to unconditionally. Without this, resuming a
/// `Scoped`/`General` continuation from inside an operation body could never
/// hand a value back to that body -- it would just unwind straight out to
/// wherever the *installing* `handle` call's own caller was, skipping the
/// handler's own remaining code (the common `let v = resume.call_resume(x);
/// compute_with(v)` pattern) entirely.
fn capture_resume_call(ptr: NonNull<Resumption>, value: Value) -> Value {
    let resume_bottom = unsafe { (*ptr.as_ptr()).cstack.bottom() };
    let fragment = Fragment::alloc();
    let entry_ptr: *mut JmpBuf = unsafe { &mut (*fragment.as_ptr()).entry };
    let first = unsafe { arch::save_context(entry_ptr) };
    if first == 0 {
        let top = direction::current_top();
        let cstack = CStack::capture(resume_bottom, top);
        unsafe {
            (*fragment.as_ptr()).cstack = cstack;
        }
        with_hstack(|hs| hs.push_fragment(fragment));
        unsafe {
            (*ptr.as_ptr()).arg = value;
            (*ptr.as_ptr()).resumptions += 1;
        }
        with_hstack(|hs| unsafe {
            (*ptr.as_ptr()).hstack.append_copyfrom(0, hs);
        });
        let r = unsafe { &*ptr.as_ptr() };
        let bytes = cstack_bytes(&r.cstack);
        let (size, base) = (r.cstack.size, r.cstack.base);
        let entry = &r.entry as *const JmpBuf;
        unsafe { arch::jump_to(bytes, size, base, entry, 1) }
    } else {
        let result = unsafe { (*fragment.as_ptr()).res };
        unsafe { Fragment::release(fragment) };
        result
    }
}

/// Yield an operation to the nearest enclosing handler for `effect`,
/// mirroring `lh_yield`. `Tail`/`TailNoop` operations run in place and
/// return directly; `NoResume`/`NoResumeX` unwind straight to the installing
/// `handle` call without ever returning to this call site (its caller's
/// remaining code is never reached, matching the "no-resume throw" law);
/// `Scoped`/`General` jump back the same way but carry a captured
/// continuation.
pub fn yield_effect(effect: EffectTag, arg: Value) -> Value {
    direction::ensure_initialized();
    let offset = match with_hstack(|hs| hs.find(effect)) {
        Some(offset) => offset,
        None => fatal(EngineError::NoHandler { effect: effect.name() }),
    };
    let target: EffectFrame = with_hstack(|hs| hs.effect_frame_at(offset));
    let hdef = unsafe { &*target.hdef };
    stats::bump!(operations);

    // NoResume/NoResumeX never resume in place: both unwind the hstack up to
    // (but not including -- `handle` pops that last frame itself once the
    // jump lands) the matched frame and jump straight to the handler's own
    // `handle` call, so the code after this `yield` call is never reached.
    // This must be checked *before* the Tail/TailNoop fast path below: both
    // kinds sort `<= OpKind::Tail` for dispatch-ordering purposes, but only
    // Tail/TailNoop actually resume on top of the yielding stack.
    if hdef.kind == OpKind::NoResumeX || hdef.kind == OpKind::NoResume {
        let unwound = with_hstack(|hs| {
            hs.set_effect_delivery(offset, arg, ResumeSlot::None);
            hs.pop_upto_collect(offset, true)
        });
        unwound.restore_in_place();
        unsafe { arch::jump_to(None, 0, std::ptr::null(), &target.entry as *const JmpBuf, 1) }
    }

    if hdef.kind.resumes_in_place() {
        // A `Tail` operation may itself call further operations, including a
        // re-yield of this very effect; push a skip frame so that re-yield
        // finds the next handler down instead of looping back onto this
        // one. `TailNoop` promises to call no further operations, so it
        // skips the extra push/pop.
        stats::bump!(rcont_resumed_tail);
        let pre_skip_top = if hdef.kind == OpKind::Tail {
            Some(with_hstack(|hs| {
                let top = hs.top_offset();
                hs.push_skip_over(offset);
                top
            }))
        } else {
            None
        };
        let result = hdef.call_op(Resume::tail(), arg);
        if let Some(pre_skip_top) = pre_skip_top {
            with_hstack(|hs| hs.pop_upto(pre_skip_top, false));
        }
        return result;
    }

    // Scoped / General: capture everything between here and the handler.
    let kind = if hdef.kind == OpKind::Scoped {
        ResumeKind::Scoped
    } else {
        ResumeKind::General
    };
    let r = Resumption::alloc(kind);
    let entry_ptr: *mut JmpBuf = unsafe { &mut (*r.as_ptr()).entry };
    let first = unsafe { arch::save_context(entry_ptr) };

    if first == 0 {
        let top = direction::current_top();
        let cstack = CStack::capture(target.stackbase, top);
        unsafe {
            (*r.as_ptr()).cstack = cstack;
        }
        // Capture from `offset` itself, i.e. including the matched effect
        // frame, mirroring `capture_hstack`'s "starting at h, inclusive"
        // (libhandler copies the handler frame into the resumption too).
        // `capture_resume_call`'s later `append_copyfrom(0, ..)` is what
        // reinstalls it on top of the fragment frame it pushes, and a
        // resumption invoked outside the handler's own dynamic extent needs
        // its own effect frame to re-`find` against.
        let unwound = with_hstack(|hs| {
            hs.append_copyfrom(offset, unsafe { &mut (*r.as_ptr()).hstack });
            hs.set_effect_delivery(offset, arg, ResumeSlot::Handle(r));
            hs.pop_upto_collect(offset, true)
        });
        // `r.cstack` (just captured above) is kept for a *later* call_resume
        // to restore; the jump happening right now only needs to put back
        // whatever fragment memory this unwind crossed, mirroring
        // `yield_to_handler`'s separate, transient `cs` accumulator.
        unwound.restore_in_place();
        unsafe { arch::jump_to(None, 0, std::ptr::null(), &target.entry as *const JmpBuf, 1) }
    } else {
        unsafe { (*r.as_ptr()).arg }
    }
}

/// Yield several arguments packed into a stack array, the analogue of the
/// original's `lh_yieldN` family. The operation body receives a pointer to
/// the array as its `Value`; if it captures (`Scoped`/`General`) and needs
/// the array's contents beyond the point where the native stack slot could
/// have been reused, it must first relocate that pointer through
/// [`crate::resumption::Resumption::relocate_ptr`].
pub fn yield_n(effect: EffectTag, args: &[Value]) -> Value {
    yield_effect(effect, unsafe { Value::from_ptr(args.as_ptr() as *mut Value) })
}

/// Resume a captured continuation with `value`, returning whatever the
/// resumed computation eventually delivers back to this exact call site.
/// Mirrors `lh_call_resume`: reinstalls the resumption's own captured
/// handler frames on top of the live stack and jumps into the saved
/// re-entry point, by way of [`capture_resume_call`], which is what makes
/// that "returning whatever" actually possible. See this module's doc
/// comment for the liveness requirement this relies on.
///
/// ## Safety
/// `ptr` must point to a live, not-yet-exhausted `Resumption`.
pub(crate) unsafe fn resume_value(ptr: NonNull<Resumption>, value: Value) -> Value {
    capture_resume_call(ptr, value)
}

/// An opaque handle to a non-handler continuation captured by
/// [`capture_fragment`]. The fragment type itself stays crate-private; a
/// caller only ever needs to hold this handle and pass it back to
/// [`resume_fragment`]/[`fragment_value`].
#[derive(Clone, Copy)]
pub struct FragmentHandle(NonNull<Fragment>);

/// Record the current native stack position, to later capture down to with
/// [`capture_fragment`]. The non-handler capture path,
/// generalizing the teacher crate's `Stack::dock`.
pub fn mark() -> *const u8 {
    direction::ensure_initialized();
    direction::current_top()
}

/// Capture the continuation between `mark` and here into a [`FragmentHandle`],
/// mirroring the teacher crate's one-shot `Stack::suspend`: returns
/// `(fragment, true)` on the original call (the caller should stash the
/// fragment and unwind), and `(fragment, false)` when later resumed via
/// [`resume_fragment`] (the caller should read the fragment's delivered
/// value and continue).
pub fn capture_fragment(mark: *const u8) -> (FragmentHandle, bool) {
    let fragment = Fragment::alloc();
    let entry_ptr: *mut JmpBuf = unsafe { &mut (*fragment.as_ptr()).entry };
    let first = unsafe { arch::save_context(entry_ptr) };
    if first == 0 {
        let top = direction::current_top();
        let cstack = CStack::capture(mark, top);
        unsafe {
            (*fragment.as_ptr()).cstack = cstack;
        }
        (FragmentHandle(fragment), true)
    } else {
        (FragmentHandle(fragment), false)
    }
}

/// Read the value delivered by [`resume_fragment`] to the resumed side of
/// a [`capture_fragment`] call.
pub fn fragment_value(fragment: FragmentHandle) -> Value {
    unsafe { (*fragment.0.as_ptr()).res }
}

/// Jump back into a fragment captured by [`capture_fragment`], delivering
/// `value`. Never returns: control resumes inside the original
/// `capture_fragment` call instead.
pub fn resume_fragment(fragment: FragmentHandle, value: Value) -> ! {
    stats::bump!(rcont_resumed_fragment);
    unsafe {
        (*fragment.0.as_ptr()).res = value;
    }
    let f = unsafe { &*fragment.0.as_ptr() };
    let bytes = cstack_bytes(&f.cstack);
    unsafe { arch::jump_to(bytes, f.cstack.size, f.cstack.base, &f.entry as *const JmpBuf, 1) }
}

/// A handler whose only operation is `Tail`/`TailNoop`-kind, dispatched by
/// direct closure call with no handler-stack interaction at all -- the fast
/// path spec's "10^6-iteration tail-resume" scenario needs. Mirrors the
/// original's linear-handler optimization for effects that never capture.
/// `NoResume`/`NoResumeX` do not qualify even though they never capture
/// either: both rely on unwinding to a `handle`-installed frame this fast
/// path never pushes.
pub struct LinearHandler<'a> {
    hdef: &'a HandlerDef,
}

/// Begin a linear (non-capturing) handler session. Debug-asserts the
/// handler's operation kind actually resumes in place, since installing one
/// for a capturing or unwind-requiring operation would silently skip the
/// machinery that makes capture/unwind correct.
pub fn linear_handler_init(hdef: &HandlerDef) -> LinearHandler<'_> {
    debug_assert!(
        hdef.kind.resumes_in_place(),
        "linear_handler_init requires a Tail/TailNoop-kind operation"
    );
    LinearHandler { hdef }
}

impl LinearHandler<'_> {
    pub fn call(&self, arg: Value) -> Value {
        self.hdef.call_op(Resume::tail(), arg)
    }
}

/// End a linear handler session. A no-op today (nothing was pushed onto
/// the handler stack to begin with); kept so call sites read symmetrically
/// with `linear_handler_init` and so a future stats hook has somewhere to
/// live.
pub fn linear_handler_done(_handler: LinearHandler<'_>) {}
