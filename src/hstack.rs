//! Handler stack, grounded in `hstack.h`/`libhandler.c`'s
//! `hstack_push`/`hstack_pop`/`hstack_find`/`hstack_append_copyfrom`.
//!
//! Frames are packed contiguously into one heap buffer, each starting with
//! a [`FrameHeader`] whose `prev_delta` is a *relative* byte offset back to
//! the frame below -- relative so the whole buffer can be grown (realloc'd
//! to a new address) or copied into a resumption's own buffer without
//! rewriting a single link.

use std::mem::size_of;
use std::ptr::NonNull;

use crate::alloc::{checked_alloc, checked_free, checked_realloc};
use crate::effect::{fragment_tag, scoped_tag, skip_tag, EffectTag};
use crate::fragment::Fragment;
use crate::handler_def::{HandlerDef, Value};
use crate::resumption::{self, Resumption};
use crate::stack::arch::JmpBuf;
use crate::stack::cstack::CStack;
use crate::stats;

/// Minimum handler-stack allocation, the analogue of `HMINSIZE`: room for a
/// handful of effect frames before the first realloc.
const HMINSIZE: usize = 32 * size_of::<EffectFrame>();
/// Above this size, growth becomes linear (+`HMAXEXPAND`) instead of
/// doubling, the analogue of `HMAXEXPAND`.
const HMAXEXPAND: usize = 2 * 1024 * 1024;

fn good_size(needed: usize) -> usize {
    if needed > HMAXEXPAND {
        needed.div_ceil(HMAXEXPAND) * HMAXEXPAND
    } else {
        let mut size = HMINSIZE;
        while size < needed {
            size *= 2;
        }
        size
    }
}

#[derive(Clone, Copy)]
pub(crate) struct FrameHeader {
    pub effect: EffectTag,
    pub prev_delta: isize,
}

/// What a resume call delivers back to the handler loop that owns this
/// frame, written by a yielding operation just before it jumps into
/// `entry`, read by [`crate::engine::handle`] right after that jump lands.
#[derive(Clone, Copy)]
pub(crate) enum ResumeSlot {
    None,
    Tail,
    Handle(NonNull<Resumption>),
}

#[derive(Clone, Copy)]
pub(crate) struct EffectFrame {
    pub header: FrameHeader,
    pub entry: JmpBuf,
    pub id: u64,
    pub hdef: *const HandlerDef,
    pub stackbase: *const u8,
    pub arg: Value,
    pub resume: ResumeSlot,
}

/// A transient marker pushed while a `Tail` operation's body runs (spec
/// §4.6), so a same-effect `yield` from inside that body does not re-match
/// the handler whose operation is still on the native call stack. `skip_bytes`
/// is the number of bytes below *this* frame's own position that `find`
/// should step over in one hop -- i.e. the size of the range `[below the
/// matched effect frame, here)` -- landing directly on the frame below the
/// handler being skipped, rather than on the handler itself. `-1` means the
/// skipped handler was itself the bottom of the stack, so `find` should stop
/// (no handler exists below it).
#[derive(Clone, Copy)]
pub(crate) struct SkipFrame {
    pub header: FrameHeader,
    pub skip_bytes: isize,
}

#[derive(Clone, Copy)]
pub(crate) struct FragmentFrame {
    pub header: FrameHeader,
    pub fragment: NonNull<Fragment>,
}

#[derive(Clone, Copy)]
pub(crate) struct ScopedFrame {
    pub header: FrameHeader,
    pub resume: NonNull<Resumption>,
}

enum FrameKind {
    Effect,
    Skip,
    Fragment,
    Scoped,
}

fn kind_of(effect: EffectTag) -> FrameKind {
    if effect == fragment_tag() {
        FrameKind::Fragment
    } else if effect == scoped_tag() {
        FrameKind::Scoped
    } else if effect == skip_tag() {
        FrameKind::Skip
    } else {
        FrameKind::Effect
    }
}

fn frame_size(kind: &FrameKind) -> usize {
    match kind {
        FrameKind::Effect => size_of::<EffectFrame>(),
        FrameKind::Skip => size_of::<SkipFrame>(),
        FrameKind::Fragment => size_of::<FragmentFrame>(),
        FrameKind::Scoped => size_of::<ScopedFrame>(),
    }
}

/// The handler stack itself: a packed buffer of variable-size frames plus
/// the byte accounting to grow, find, unwind, and relocate slices of it.
pub(crate) struct HStack {
    hframes: Option<NonNull<u8>>,
    count: isize,
    size: isize,
    top_offset: isize,
}

impl HStack {
    pub(crate) const fn new() -> HStack {
        HStack {
            hframes: None,
            count: 0,
            size: 0,
            top_offset: 0,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub(crate) fn top_offset(&self) -> isize {
        self.top_offset
    }

    pub(crate) fn count(&self) -> isize {
        self.count
    }

    fn ensure_space(&mut self, extra: usize) {
        let needed = self.count as usize + extra;
        if needed as isize > self.size {
            let newsize = good_size(needed);
            let new_ptr = match self.hframes {
                None => checked_alloc(newsize),
                Some(p) => checked_realloc(p, self.size as usize, newsize),
            };
            self.hframes = Some(new_ptr);
            self.size = newsize as isize;
            stats::set_hstack_max(newsize);
        }
    }

    fn frame_ptr(&self, offset: isize) -> *const u8 {
        unsafe { self.hframes.unwrap().as_ptr().add(offset as usize) }
    }

    fn frame_ptr_mut(&mut self, offset: isize) -> *mut u8 {
        unsafe { self.hframes.unwrap().as_ptr().add(offset as usize) }
    }

    fn header_at(&self, offset: isize) -> FrameHeader {
        unsafe { *(self.frame_ptr(offset) as *const FrameHeader) }
    }

    /// Reserve `size` bytes at the current top, returning the new frame's
    /// offset and the `prev_delta` it should record.
    fn reserve(&mut self, size: usize) -> (isize, isize) {
        self.ensure_space(size);
        let offset = self.count;
        let prev_delta = offset - self.top_offset;
        self.top_offset = offset;
        self.count += size as isize;
        (offset, prev_delta)
    }

    pub(crate) fn push_effect(
        &mut self,
        effect: EffectTag,
        id: u64,
        hdef: *const HandlerDef,
        stackbase: *const u8,
    ) -> isize {
        let (offset, prev_delta) = self.reserve(size_of::<EffectFrame>());
        let frame = EffectFrame {
            header: FrameHeader { effect, prev_delta },
            entry: JmpBuf::zeroed(),
            id,
            hdef,
            stackbase,
            arg: Value::null(),
            resume: ResumeSlot::None,
        };
        unsafe {
            (self.frame_ptr_mut(offset) as *mut EffectFrame).write(frame);
        }
        offset
    }

    fn push_skip_raw(&mut self, skip_bytes: isize) -> isize {
        let (offset, prev_delta) = self.reserve(size_of::<SkipFrame>());
        let frame = SkipFrame {
            header: FrameHeader {
                effect: skip_tag(),
                prev_delta,
            },
            skip_bytes,
        };
        unsafe {
            (self.frame_ptr_mut(offset) as *mut SkipFrame).write(frame);
        }
        offset
    }

    /// Push a skip frame that makes [`Self::find`] step clean over the
    /// effect frame at `matched_offset` -- and everything between it and the
    /// current top -- landing on whatever is below `matched_offset` instead.
    /// Used by the `Tail` dispatch path while its operation body
    /// runs, so a same-effect re-yield from inside that body does not loop
    /// back onto the handler that is still running.
    pub(crate) fn push_skip_over(&mut self, matched_offset: isize) -> isize {
        let matched = self.header_at(matched_offset);
        let skip_target = self.count; // == offset the new skip frame will get
        let skip_bytes = if matched.prev_delta == 0 {
            -1
        } else {
            skip_target - (matched_offset - matched.prev_delta)
        };
        self.push_skip_raw(skip_bytes)
    }

    pub(crate) fn push_fragment(&mut self, fragment: NonNull<Fragment>) -> isize {
        let (offset, prev_delta) = self.reserve(size_of::<FragmentFrame>());
        let frame = FragmentFrame {
            header: FrameHeader {
                effect: fragment_tag(),
                prev_delta,
            },
            fragment,
        };
        unsafe {
            (self.frame_ptr_mut(offset) as *mut FragmentFrame).write(frame);
        }
        offset
    }

    pub(crate) fn push_scoped(&mut self, resume: NonNull<Resumption>) -> isize {
        let (offset, prev_delta) = self.reserve(size_of::<ScopedFrame>());
        let frame = ScopedFrame {
            header: FrameHeader {
                effect: scoped_tag(),
                prev_delta,
            },
            resume,
        };
        unsafe {
            (self.frame_ptr_mut(offset) as *mut ScopedFrame).write(frame);
        }
        offset
    }

    pub(crate) fn effect_frame_at(&self, offset: isize) -> EffectFrame {
        unsafe { *(self.frame_ptr(offset) as *const EffectFrame) }
    }

    pub(crate) fn skip_frame_at(&self, offset: isize) -> SkipFrame {
        unsafe { *(self.frame_ptr(offset) as *const SkipFrame) }
    }

    pub(crate) fn fragment_frame_at(&self, offset: isize) -> FragmentFrame {
        unsafe { *(self.frame_ptr(offset) as *const FragmentFrame) }
    }

    pub(crate) fn scoped_frame_at(&self, offset: isize) -> ScopedFrame {
        unsafe { *(self.frame_ptr(offset) as *const ScopedFrame) }
    }

    /// A mutable pointer to the saved jump context of the effect frame at
    /// `offset`, used both to populate it at `handle` time and to jump back
    /// into it from `yield`.
    pub(crate) fn effect_entry_mut(&mut self, offset: isize) -> *mut JmpBuf {
        unsafe { &mut (*(self.frame_ptr_mut(offset) as *mut EffectFrame)).entry as *mut JmpBuf }
    }

    /// Write the delivery slot of the effect frame at `offset`: the value
    /// and resume handle a yielding operation hands back to its handler.
    pub(crate) fn set_effect_delivery(&mut self, offset: isize, arg: Value, resume: ResumeSlot) {
        unsafe {
            let ptr = self.frame_ptr_mut(offset) as *mut EffectFrame;
            (*ptr).arg = arg;
            (*ptr).resume = resume;
        }
    }

    /// Read back (and clear) the delivery slot written by
    /// [`Self::set_effect_delivery`].
    pub(crate) fn take_effect_delivery(&mut self, offset: isize) -> (Value, ResumeSlot) {
        unsafe {
            let ptr = self.frame_ptr_mut(offset) as *mut EffectFrame;
            let value = (*ptr).arg;
            let resume = (*ptr).resume;
            (*ptr).resume = ResumeSlot::None;
            (value, resume)
        }
    }

    /// Find the nearest (topmost) frame tagged with `effect`, mirroring
    /// `hstack_find`. A skip frame along the way (installed by a `Tail`
    /// operation currently running, see [`Self::push_skip_over`]) is jumped
    /// over in one hop rather than visited, so a same-effect re-yield from
    /// inside that operation's body finds the *next* handler down instead of
    /// looping back onto the one still executing.
    pub(crate) fn find(&self, effect: EffectTag) -> Option<isize> {
        if self.count == 0 {
            return None;
        }
        let mut offset = self.top_offset;
        loop {
            let header = self.header_at(offset);
            if header.effect == skip_tag() {
                let skip_bytes = self.skip_frame_at(offset).skip_bytes;
                if skip_bytes < 0 {
                    return None;
                }
                offset -= skip_bytes;
                continue;
            }
            if header.effect == effect {
                return Some(offset);
            }
            if header.prev_delta == 0 {
                return None;
            }
            offset -= header.prev_delta;
        }
    }

    /// If the top frame is a fragment frame, return its fragment pointer
    /// without popping it. Used by [`crate::engine::handle`]'s normal-return
    /// path to detect that this completion is actually the tail end of a
    /// `capture_resume_call` rather than a genuine return to the
    /// installing `handle`'s own caller.
    pub(crate) fn top_is_fragment(&self) -> Option<NonNull<Fragment>> {
        if self.count == 0 {
            return None;
        }
        let offset = self.top_offset;
        if self.header_at(offset).effect == fragment_tag() {
            Some(self.fragment_frame_at(offset).fragment)
        } else {
            None
        }
    }

    fn release_one(&mut self, offset: isize) -> usize {
        let header = self.header_at(offset);
        let kind = kind_of(header.effect);
        match kind {
            FrameKind::Fragment => {
                let frame = self.fragment_frame_at(offset);
                unsafe { Fragment::release(frame.fragment) };
            }
            FrameKind::Scoped => {
                let frame = self.scoped_frame_at(offset);
                unsafe { resumption::release(frame.resume) };
            }
            FrameKind::Effect | FrameKind::Skip => {}
        }
        frame_size(&kind)
    }

    fn acquire_one(&mut self, offset: isize) -> usize {
        let header = self.header_at(offset);
        let kind = kind_of(header.effect);
        match kind {
            FrameKind::Fragment => {
                let frame = self.fragment_frame_at(offset);
                unsafe { Fragment::acquire(frame.fragment) };
            }
            FrameKind::Scoped => {
                let frame = self.scoped_frame_at(offset);
                unsafe { resumption::acquire(frame.resume) };
            }
            FrameKind::Effect | FrameKind::Skip => {}
        }
        frame_size(&kind)
    }

    fn release_range(&mut self, start: isize, end: isize) {
        let mut off = start;
        while off < end {
            off += self.release_one(off) as isize;
        }
    }

    fn acquire_range(&mut self, start: isize, end: isize) {
        let mut off = start;
        while off < end {
            off += self.acquire_one(off) as isize;
        }
    }

    /// Pop the top frame, optionally releasing any fragment/resumption
    /// reference it owns. Mirrors `hstack_pop`.
    pub(crate) fn pop(&mut self, release: bool) {
        debug_assert!(self.count > 0, "popping an empty handler stack");
        let offset = self.top_offset;
        let header = self.header_at(offset);
        if release {
            self.release_one(offset);
        }
        self.count = offset;
        self.top_offset = offset - header.prev_delta;
    }

    /// Pop frames one at a time until the top sits at `target_offset`.
    pub(crate) fn pop_upto(&mut self, target_offset: isize, release: bool) {
        while self.top_offset > target_offset {
            self.pop(release);
        }
    }

    /// Pop frames down to `target_offset`, accumulating the cstack of every
    /// fragment frame crossed along the way into one `CStack` via `extend`,
    /// mirroring `hstack_pop_upto`'s `out cstack* cs` parameter. Spec §4.6's
    /// unwind needs this: a fragment crossed during the unwind holds stack
    /// memory that must be restored before the jump lands on the handler,
    /// not just released. Frees the crossed fragment's own buffer outright
    /// (rather than copying it) when `release` is set and that fragment has
    /// no other live reference.
    pub(crate) fn pop_upto_collect(&mut self, target_offset: isize, release: bool) -> CStack {
        let mut acc = CStack::empty();
        while self.top_offset > target_offset {
            let offset = self.top_offset;
            let header = self.header_at(offset);
            if let FrameKind::Fragment = kind_of(header.effect) {
                let frame = self.fragment_frame_at(offset);
                let may_consume = release && unsafe { Fragment::is_unique(frame.fragment) };
                let fragment = unsafe { &mut *frame.fragment.as_ptr() };
                if !fragment.cstack.is_empty() {
                    acc.extend(&mut fragment.cstack, may_consume);
                }
            }
            self.pop(release);
        }
        acc
    }

    /// Copy the byte range `[from_offset, self.count)` onto the top of
    /// `dest`, acquiring a fresh reference for every fragment/resumption
    /// pointer the copied range owns, and relinking the first copied
    /// frame's `prev_delta` onto `dest`'s own top. Mirrors
    /// `hstack_append_copyfrom`: since `prev_delta` values are relative,
    /// everything below the boundary frame keeps working unmodified after
    /// the raw copy.
    pub(crate) fn append_copyfrom(&self, from_offset: isize, dest: &mut HStack) {
        let nbytes = (self.count - from_offset) as usize;
        if nbytes == 0 {
            return;
        }
        dest.ensure_space(nbytes);
        let dest_offset = dest.count;
        unsafe {
            std::ptr::copy_nonoverlapping(self.frame_ptr(from_offset), dest.frame_ptr_mut(dest_offset), nbytes);
        }
        let boundary_delta = dest_offset - dest.top_offset;
        unsafe {
            let header = dest.frame_ptr_mut(dest_offset) as *mut FrameHeader;
            (*header).prev_delta = boundary_delta;
        }
        dest.top_offset = dest_offset + (self.top_offset - from_offset);
        dest.count += nbytes as isize;
        dest.acquire_range(dest_offset, dest.count);
    }

    /// Free the underlying buffer, optionally releasing every fragment and
    /// resumption reference still contained in it. Mirrors `hstack_free`.
    pub(crate) fn free(&mut self, do_release: bool) {
        if let Some(buf) = self.hframes.take() {
            if do_release {
                self.release_range(0, self.count);
            }
            checked_free(buf, self.size as usize);
        }
        self.count = 0;
        self.size = 0;
        self.top_offset = 0;
    }
}

impl Drop for HStack {
    fn drop(&mut self) {
        self.free(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler_def::OpKind;
    use proptest::prelude::*;

    crate::define_effect!(prop_effect, "prop_effect");

    fn dummy_hdef() -> HandlerDef {
        HandlerDef::new(prop_effect(), OpKind::Tail, |resume, arg| resume.tail_resume(arg))
    }

    #[test]
    fn find_returns_none_on_an_empty_stack() {
        let hs = HStack::new();
        assert!(hs.find(prop_effect()).is_none());
    }

    #[test]
    fn skip_frame_over_the_bottom_frame_is_a_terminal_marker() {
        crate::stack::direction::ensure_initialized();
        let hdef = dummy_hdef();
        let mut hs = HStack::new();
        let offset = hs.push_effect(prop_effect(), 1, &hdef as *const HandlerDef, std::ptr::null());
        hs.push_skip_over(offset);
        assert!(hs.find(prop_effect()).is_none());
        hs.free(false);
    }

    proptest! {
        #[test]
        fn push_pop_is_balanced_and_prev_delta_chains_correctly(n in 1usize..40) {
            crate::stack::direction::ensure_initialized();
            let hdef = dummy_hdef();
            let hdef_ptr = &hdef as *const HandlerDef;
            let mut hs = HStack::new();
            let mut offsets = Vec::new();
            for i in 0..n {
                let offset = hs.push_effect(prop_effect(), i as u64, hdef_ptr, std::ptr::null());
                offsets.push(offset);
            }

            let mut prev_offset = 0isize;
            for (i, &offset) in offsets.iter().enumerate() {
                let header = hs.header_at(offset);
                if i == 0 {
                    prop_assert_eq!(header.prev_delta, 0);
                } else {
                    prop_assert_eq!(offset - header.prev_delta, prev_offset);
                }
                prev_offset = offset;
            }
            prop_assert_eq!(hs.top_offset(), *offsets.last().unwrap());

            for _ in 0..n {
                hs.pop(false);
            }
            prop_assert_eq!(hs.count(), 0);
            hs.free(false);
        }

        #[test]
        fn find_locates_the_topmost_matching_frame(n in 1usize..20) {
            crate::stack::direction::ensure_initialized();
            let hdef = dummy_hdef();
            let hdef_ptr = &hdef as *const HandlerDef;
            let mut hs = HStack::new();
            let mut last_offset = 0isize;
            for i in 0..n {
                last_offset = hs.push_effect(prop_effect(), i as u64, hdef_ptr, std::ptr::null());
            }
            let found = hs.find(prop_effect());
            prop_assert_eq!(found, Some(last_offset));
            hs.free(false);
        }
    }
}
