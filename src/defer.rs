//! The reserved `defer` effect, grounded in `libhandler.c`'s
//! `LH_DEFINE_EFFECT0(defer)`. The original reserves the tag but never
//! gives it an operation; this is the minimal usable one -- a single
//! `scope`/`on_unwind` pair, not a general scope-guard library.

use std::cell::RefCell;
use std::rc::Rc;

use crate::effect::defer_tag;
use crate::engine;
use crate::handler_def::{HandlerDef, OpKind, Value};

/// Run `action` under a `defer` scope: any [`on_unwind`] callback registered
/// while it runs executes once `action` returns, in reverse registration
/// order, whether or not `action` used any deferred cleanup at all.
pub fn scope<T: 'static>(action: impl FnOnce() -> T + 'static) -> T {
    let cleanups: Rc<RefCell<Vec<Box<dyn FnOnce()>>>> = Rc::new(RefCell::new(Vec::new()));
    let cleanups_for_op = Rc::clone(&cleanups);

    let hdef = HandlerDef::new(defer_tag(), OpKind::Tail, move |resume, arg| {
        let cleanup = unsafe { *Box::from_raw(arg.as_ptr::<Box<dyn FnOnce()>>()) };
        cleanups_for_op.borrow_mut().push(cleanup);
        resume.tail_resume(Value::null())
    });

    let result = engine::handle(
        &hdef,
        move |_| unsafe { Value::from_ptr(Box::into_raw(Box::new(action()))) },
        Value::null(),
    );

    for cleanup in cleanups.borrow_mut().drain(..).rev() {
        cleanup();
    }

    unsafe { *Box::from_raw(result.as_ptr::<T>()) }
}

/// Register a cleanup to run when the nearest enclosing [`scope`] returns.
/// Fatal-errors with `NoHandler` (via the usual `yield` path) if called
/// outside of one.
pub fn on_unwind(cleanup: impl FnOnce() + 'static) {
    let boxed: Box<dyn FnOnce()> = Box::new(cleanup);
    let thin = Box::into_raw(Box::new(boxed));
    engine::yield_effect(defer_tag(), unsafe { Value::from_ptr(thin) });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn runs_in_reverse_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l1 = Arc::clone(&log);
        let l2 = Arc::clone(&log);
        scope(move || {
            on_unwind(move || l1.lock().unwrap().push(1));
            on_unwind(move || l2.lock().unwrap().push(2));
        });
        assert_eq!(*log.lock().unwrap(), vec![2, 1]);
    }

    #[test]
    fn propagates_the_action_result() {
        let value = scope(|| 42);
        assert_eq!(value, 42);
    }
}
