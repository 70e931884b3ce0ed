//! Operation kinds, the value channel, resume handles, and handler
//! definitions, grounded in `types.h`'s `lh_opkind`/`lh_value`/
//! `lh_resume`/`lh_operation`/`lh_handlerdef`.

use std::ptr::NonNull;

use crate::effect::EffectTag;
use crate::error::{fatal, EngineError};
use crate::resumption::{self, ResumeKind, Resumption};

/// How an operation may resume, ordered exactly as `types.h`'s `lh_opkind`:
/// comparisons (`<=`) against this order pick the cheapest applicable
/// dispatch path in [`crate::engine::yield_effect`].
///
/// - `NoResumeX`: never resumes; used for operations that abort the whole
///   action (e.g. an exception). Unwinds to the handler exactly like
///   `NoResume` (see [`crate::engine::yield_effect`]); kept as a distinct,
///   lower-sorting kind so a caller can mark "this one is the exceptional
///   exit" for diagnostics/dispatch-ordering purposes without changing
///   engine behavior.
/// - `NoResume`: never resumes; unwinds the hstack to the handler.
/// - `TailNoop`: always resumes, on top of the yielding stack, with the
///   argument passed through unchanged.
/// - `Tail`: always resumes, on top of the yielding stack.
/// - `Scoped`: may resume at most once, and only within the dynamic extent
///   of the handler (released automatically when that extent ends).
/// - `General`: may resume any number of times, including after the handler
///   has returned (a full first-class continuation).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum OpKind {
    NoResumeX,
    NoResume,
    TailNoop,
    Tail,
    Scoped,
    General,
}

impl OpKind {
    /// `TailNoop`/`Tail`: the operation body runs in place and its return
    /// value becomes the `yield`'s result directly, with no hstack unwinding
    /// at all. `NoResume`/`NoResumeX` sort `<= Tail` too (the ordering governs
    /// dispatch shortcuts) but do *not* resume in place -- they unwind to the
    /// installing `handle` frame instead, so they are deliberately excluded
    /// here.
    pub(crate) fn resumes_in_place(self) -> bool {
        matches!(self, OpKind::TailNoop | OpKind::Tail)
    }
}

/// An opaque machine word, the Rust analogue of `lh_value`: the single
/// channel through which `yield` arguments, resume arguments, and results
/// flow. Holds anything that fits in a `usize`, including a pointer cast
/// through [`Value::from_ptr`]/[`Value::as_ptr`] -- the unsafe escape hatch
/// for payloads wider than a machine word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Value(usize);

impl Value {
    pub const fn null() -> Value {
        Value(0)
    }
    pub fn from_usize(v: usize) -> Value {
        Value(v)
    }
    pub fn as_usize(self) -> usize {
        self.0
    }
    pub fn from_i64(v: i64) -> Value {
        Value(v as usize)
    }
    pub fn as_i64(self) -> i64 {
        self.0 as i64
    }

    /// Pack a pointer into a value.
    ///
    /// ## Safety
    /// A pointer into the yielding native stack is only valid for the
    /// lifetime of that stack frame; a value built from one must be
    /// relocated via [`crate::resumption::Resumption::relocate_ptr`] before
    /// it can safely cross a capture.
    pub unsafe fn from_ptr<T>(ptr: *mut T) -> Value {
        Value(ptr as usize)
    }
    pub fn as_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

/// The internal representation behind [`Resume`]: the Rust-native sum type
/// standing in for the original's "dummy resumption" sentinel pointer,
/// kept crate-private so the public `Resume` type never has to name the
/// crate-private [`Resumption`] type in its own public interface.
pub(crate) enum ResumeRepr {
    /// The operation resumes on top of the yielding stack with no capture.
    Tail,
    /// A captured continuation, scoped or general.
    Handle(NonNull<Resumption>),
}

/// A handle to the continuation captured at a `yield` point, returned to an
/// operation's handler body. Tail/no-resume operations never capture
/// anything, so there is nothing to heap-allocate for them; consumed
/// through [`Resume::tail_resume`] / [`Resume::call_resume`] /
/// [`Resume::scoped_resume`] / [`Resume::release`], never by matching on
/// its contents directly.
pub struct Resume(pub(crate) ResumeRepr);

impl Resume {
    pub(crate) fn tail() -> Resume {
        Resume(ResumeRepr::Tail)
    }
    pub(crate) fn handle(ptr: NonNull<Resumption>) -> Resume {
        Resume(ResumeRepr::Handle(ptr))
    }
}

impl Resume {
    /// Resume immediately, in place, passing `value` straight through.
    /// Valid only for `TailNoop`/`Tail`/`NoResume`-kind operations, where no
    /// stack was ever captured and "resuming" is just returning a value up
    /// the native call chain the `yield` is still inside of.
    pub fn tail_resume(self, value: Value) -> Value {
        match self.0 {
            ResumeRepr::Tail => value,
            ResumeRepr::Handle(_) => fatal(EngineError::MisuseOfTailResume),
        }
    }

    /// Resume a captured continuation, possibly more than once -- each call
    /// independently replays the captured computation from the `yield`
    /// point with a fresh `value`, returning whatever that replay eventually
    /// produces. Valid only for `General`-kind operations. Borrows rather
    /// than consumes so a handler body can call it several times in a row
    /// (e.g. `r.call_resume(1) + r.call_resume(2) + r.call_resume(4)`); drop
    /// the handle (or call [`Resume::release`]) once done resuming to free
    /// the underlying continuation.
    ///
    /// Acquires a temporary reference for the duration of the call and
    /// releases it again afterward, mirroring `lh_call_resume`'s
    /// `resume_acquire`/`resume_release` wrap -- the continuation's own
    /// installing reference is untouched by this, owned by the scoped frame
    /// [`crate::engine::handle`] pushed around this operation's body.
    pub fn call_resume(&self, value: Value) -> Value {
        match self.0 {
            ResumeRepr::Tail => fatal(EngineError::MisuseOfTailResume),
            ResumeRepr::Handle(ptr) => unsafe {
                let guard = resumption::acquire(ptr);
                let result = resumption::call_resume(guard, value);
                resumption::release(guard);
                result
            },
        }
    }

    /// Resume a captured continuation exactly once. Valid for `Scoped`- or
    /// `General`-kind operations; mirrors `lh_scoped_resume`, which is
    /// literally an alias for [`Resume::call_resume`] in the original --
    /// the continuation's installing reference is released by the handler's
    /// own scoped frame once its operation body returns, not by this call.
    pub fn scoped_resume(self, value: Value) -> Value {
        self.call_resume(value)
    }

    /// Resume a captured continuation exactly once, consuming this handle's
    /// own reference to it -- the external `release_resume` interface
    /// (spec §6). Mirrors `lh_release_resume`: for a `Scoped` continuation
    /// this is the same guard-wrapped call as [`Resume::scoped_resume`]
    /// (the scoped frame still does the real release on handler return),
    /// but for a `General` one it resumes once and then releases the
    /// installing reference directly, since nothing else ever will.
    pub fn release_resume(self, value: Value) -> Value {
        match self.0 {
            ResumeRepr::Tail => fatal(EngineError::MisuseOfTailResume),
            ResumeRepr::Handle(ptr) => unsafe {
                if (*ptr.as_ptr()).kind == ResumeKind::Scoped {
                    self.scoped_resume(value)
                } else {
                    let result = resumption::call_resume(ptr, value);
                    resumption::release(ptr);
                    result
                }
            },
        }
    }

    /// Drop this resume handle without ever resuming it. A `Scoped`
    /// continuation's installing reference is released by the handler's own
    /// scoped frame regardless of whether it was ever used, so there is
    /// nothing left to do here for one; a `General` continuation has no such
    /// automatic release and must be dropped explicitly.
    pub fn release(self) {
        if let ResumeRepr::Handle(ptr) = self.0 {
            if unsafe { (*ptr.as_ptr()).kind } == ResumeKind::General {
                unsafe { resumption::release(ptr) };
            }
        }
    }
}

/// A single effect operation's handler:
/// one [`EffectTag`], its resume discipline, the operation body, and an
/// optional result transformer applied to the action's final value before
/// `handle` returns it (the original's `resultfun`).
///
/// Each `HandlerDef` covers exactly one operation. An effect with several
/// operations is modeled as several `HandlerDef`s installed through nested
/// [`crate::engine::handle`] calls, one per operation tag -- the original's
/// own dispatch (`hstack_find` matching a single `h->effect` field) never
/// distinguishes "operations of one effect" from "distinct effects" either.
pub struct HandlerDef {
    pub(crate) effect: EffectTag,
    pub(crate) kind: OpKind,
    op: Box<dyn Fn(Resume, Value) -> Value>,
    result: Option<Box<dyn Fn(Value) -> Value>>,
}

impl HandlerDef {
    pub fn new(effect: EffectTag, kind: OpKind, op: impl Fn(Resume, Value) -> Value + 'static) -> HandlerDef {
        HandlerDef {
            effect,
            kind,
            op: Box::new(op),
            result: None,
        }
    }

    /// Attach a result transformer, applied to the action's return value
    /// (or, transitively, to whatever an inner `handle` already transformed
    /// it into) before `handle` returns.
    pub fn with_result(mut self, result: impl Fn(Value) -> Value + 'static) -> HandlerDef {
        self.result = Some(Box::new(result));
        self
    }

    pub(crate) fn call_op(&self, resume: Resume, arg: Value) -> Value {
        (self.op)(resume, arg)
    }

    pub(crate) fn call_result(&self, value: Value) -> Value {
        match &self.result {
            Some(f) => f(value),
            None => value,
        }
    }
}
