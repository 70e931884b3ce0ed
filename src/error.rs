//! Error taxonomy and the pluggable fatal-error callback.
//!
//! The original `libhandler` never recovers from these: every one of them
//! routes through a single `fatal()` call that either invokes a
//! user-registered callback or prints and `exit(1)`s. We keep that shape
//! but make the default path a panic instead of a process exit, so an
//! embedding Rust program can catch it at a `catch_unwind` boundary.

use std::cell::RefCell;

/// The engine's error taxonomy. All of these are fatal: the engine never
/// defines recovery behavior past one of these being raised.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// `yield` found no matching effect handler on the stack.
    #[error("no handler installed for effect `{effect}`")]
    NoHandler { effect: &'static str },

    /// An allocation through the pluggable allocator failed.
    #[error("out of memory allocating {size} bytes")]
    OutOfMemory { size: usize },

    /// A non-positive allocation size was requested.
    #[error("invalid allocation size: {size}")]
    InvalidSize { size: isize },

    /// Attempted to jump "up" a stack whose top is above the caller's
    /// current stack top: a fragment was resumed after its scope exited.
    #[error("stack direction violation: jumping to a scope that was already exited")]
    StackDirectionViolation,

    /// `call_resume`/`release_resume` was called on a tail-only resumption.
    #[error("misuse: tried to generally resume a tail-only resumption")]
    MisuseOfTailResume,

    /// A pointer into the yielding native stack escaped through the value
    /// channel without going through [`crate::resumption::Resumption::relocate_ptr`].
    #[error("misuse: a native-stack pointer was passed as a value without relocation")]
    MisuseOfPointerInValue,
}

/// A pluggable handler for fatal engine errors, the Rust analogue of
/// `lh_register_onfatal`'s `lh_fatalfun`.
///
/// Installed handlers are expected not to return for errors that cannot be
/// meaningfully continued from; if one does return, the engine still
/// panics afterwards so a missing abort in a handler can't turn into
/// silently corrupted continuation state.
pub trait FatalHandler: 'static {
    fn on_fatal(&self, error: &EngineError);
}

thread_local! {
    static FATAL_HANDLER: RefCell<Option<Box<dyn FatalHandler>>> = const { RefCell::new(None) };
}

/// Register a handler for fatal errors on the calling thread, mirroring
/// `lh_register_onfatal`. Handlers are per-thread since the engine state
/// itself (the hstack) is per-thread.
pub fn set_fatal_handler(handler: impl FatalHandler) {
    FATAL_HANDLER.with(|cell| *cell.borrow_mut() = Some(Box::new(handler)));
}

/// Clear any previously registered fatal handler for the calling thread.
pub fn clear_fatal_handler() {
    FATAL_HANDLER.with(|cell| *cell.borrow_mut() = None);
}

/// Route a fatal error through the registered callback, logging it either
/// way, then diverge. There is no defined unwinding behavior past a fatal
/// error: this always panics if the handler returns.
#[cold]
pub(crate) fn fatal(error: EngineError) -> ! {
    log::error!("effection: fatal error: {error}");
    let handled = FATAL_HANDLER.with(|cell| {
        if let Some(handler) = cell.borrow().as_ref() {
            handler.on_fatal(&error);
            true
        } else {
            false
        }
    });
    if !handled {
        log::error!("effection: no fatal handler registered, aborting via panic");
    }
    panic!("effection: fatal error: {error}");
}
