//! One-shot and multi-shot algebraic effect handlers built on a delimited-
//! continuation engine: a handler stack, captured native-stack fragments,
//! reference-counted resumptions, and a yield/resume state machine with
//! stack-address stability.
//!
//! Grounded in `examples/original_source/runtime/src/handlers/libhandler.c`
//! (a C implementation of the same idea), adapted from its 32-bit `stdcall`
//! naked-assembly jump trampoline to the x86_64 System V ABI and given a
//! Rust-native ownership story on top (see `DESIGN.md`).
//!
//! ```
//! use effection::{define_effect, handle, yield_effect, HandlerDef, OpKind, Value};
//!
//! define_effect!(answer, "answer");
//!
//! let hdef = HandlerDef::new(answer(), OpKind::Tail, |resume, _arg| {
//!     resume.tail_resume(Value::from_i64(42))
//! });
//! let result = handle(&hdef, |_| yield_effect(answer(), Value::null()), Value::null());
//! assert_eq!(result.as_i64(), 42);
//! ```

pub mod alloc;
pub mod defer;
pub mod effect;
pub mod engine;
pub mod error;
pub(crate) mod fragment;
pub(crate) mod handler_def;
pub(crate) mod hstack;
pub(crate) mod resumption;
pub(crate) mod stack;
pub mod stats;

#[cfg(test)]
mod tests;

pub use effect::EffectTag;
pub use engine::{
    capture_fragment, fragment_value, handle, linear_handler_done, linear_handler_init, mark, resume_fragment,
    yield_effect, yield_n, LinearHandler,
};
pub use error::{clear_fatal_handler, set_fatal_handler, EngineError, FatalHandler};
pub use handler_def::{HandlerDef, OpKind, Resume, Value};
pub use alloc::{set_allocator, Allocator, GlobalAllocator};
pub use fragment::Fragment;
