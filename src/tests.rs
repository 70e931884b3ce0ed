//! Whole-engine scenarios, colocated the way the teacher crate keeps its
//! dock/suspend/resume scenarios in a single `src/tests.rs` rather than
//! scattering them across modules. Per-module unit tests for the pieces
//! below the engine (cstack, hstack, fragment, resumption) live alongside
//! those modules instead.

use super::*;
use std::cell::Cell;

fn init() {
    let _ = env_logger::try_init();
}

define_effect!(answer_op, "answer");

#[test]
fn answer_handler_doubles_the_resumed_value() {
    init();
    let hdef = HandlerDef::new(answer_op(), OpKind::General, |resume, _arg| {
        let k = resume.call_resume(Value::from_i64(21));
        resume.release();
        Value::from_i64(k.as_i64() * 2)
    });
    let result = handle(&hdef, |_| yield_effect(answer_op(), Value::null()), Value::null());
    assert_eq!(result.as_i64(), 42);
}

define_effect!(exc_raise, "Exc.raise");

#[test]
fn no_resume_delivers_the_yielded_value_straight_to_the_handler() {
    init();
    let hdef = HandlerDef::new(exc_raise(), OpKind::NoResume, |_resume, arg| arg);
    let result = handle(
        &hdef,
        |_| {
            // Push a kilobyte of locals before yielding, so the unwind has
            // to cross real stack depth rather than a one-frame call.
            let locals = [7u8; 1000];
            std::hint::black_box(&locals);
            let v = yield_effect(exc_raise(), Value::from_i64(99));
            // NoResume never lands back here.
            std::hint::black_box(v);
            unreachable!("a NoResume yield never returns to its call site");
        },
        Value::null(),
    );
    assert_eq!(result.as_i64(), 99);
}

define_effect!(gen_op, "generic");

#[test]
fn one_shot_round_trip_through_a_general_resumption() {
    init();
    let hdef = HandlerDef::new(gen_op(), OpKind::General, |resume, arg| {
        let v = arg.as_i64();
        let result = resume.call_resume(Value::from_i64(v * 2));
        resume.release();
        result
    });
    let result = handle(&hdef, |_| yield_effect(gen_op(), Value::from_i64(5)), Value::null());
    assert_eq!(result.as_i64(), 10);
}

#[test]
fn multi_shot_resume_runs_the_continuation_three_times() {
    init();
    let count = Cell::new(0);
    let hdef = HandlerDef::new(gen_op(), OpKind::General, |resume, _arg| {
        let a = resume.call_resume(Value::from_i64(1)).as_i64();
        let b = resume.call_resume(Value::from_i64(2)).as_i64();
        let c = resume.call_resume(Value::from_i64(4)).as_i64();
        resume.release();
        Value::from_i64(a + b + c)
    });
    let result = handle(
        &hdef,
        |_| {
            let n = yield_effect(gen_op(), Value::null()).as_i64();
            count.set(count.get() + 1);
            Value::from_i64(n * 10)
        },
        Value::null(),
    );
    assert_eq!(count.get(), 3, "the code after yield must rerun once per resume");
    assert_eq!(result.as_i64(), 70);
}

define_effect!(state_get, "State.get");
define_effect!(state_put, "State.put");

#[test]
fn generator_pattern_folds_ten_puts_with_a_general_resumption() {
    init();
    // A minimal State.get/put generator: `put` captures a resumption and
    // hands it straight back to the action loop driving it, counting
    // 1..=10 and folding into a running sum, the way a coroutine-style
    // generator built on first-class resumptions typically works.
    let sum = Cell::new(0i64);
    let put_hdef = HandlerDef::new(state_put(), OpKind::General, |resume, arg| {
        sum.set(sum.get() + arg.as_i64());
        let result = resume.call_resume(Value::null());
        resume.release();
        result
    });

    handle(
        &put_hdef,
        |_| {
            for i in 1..=10 {
                yield_effect(state_put(), Value::from_i64(i));
            }
            Value::null()
        },
        Value::null(),
    );

    assert_eq!(sum.get(), 55);
}

#[test]
fn nested_handlers_let_a_yield_skip_past_a_non_matching_frame() {
    init();
    define_effect!(effect_a, "A");
    define_effect!(effect_b, "B");

    let outer = HandlerDef::new(effect_b(), OpKind::General, |resume, arg| {
        let result = resume.call_resume(Value::from_i64(arg.as_i64() + 100));
        resume.release();
        result
    });

    let result = handle(
        &outer,
        |_| {
            let inner = HandlerDef::new(effect_a(), OpKind::Tail, |resume, arg| resume.tail_resume(arg));
            handle(
                &inner,
                |_| yield_effect(effect_b(), Value::from_i64(1)),
                Value::null(),
            )
        },
        Value::null(),
    );

    assert_eq!(result.as_i64(), 101);
}

define_effect!(tail_inc, "tail_inc");

#[test]
fn tail_resume_is_a_pure_pass_through_with_no_capture() {
    init();
    let before = stats::snapshot();
    let hdef = HandlerDef::new(tail_inc(), OpKind::Tail, |resume, arg| {
        resume.tail_resume(Value::from_i64(arg.as_i64() + 1))
    });
    let result = handle(&hdef, |_| yield_effect(tail_inc(), Value::from_i64(6)), Value::null());
    assert_eq!(result.as_i64(), 7);

    let after = stats::snapshot();
    assert_eq!(after.rcont_captured_scoped, before.rcont_captured_scoped);
    assert_eq!(after.rcont_captured_resume, before.rcont_captured_resume);
    assert_eq!(after.rcont_captured_fragment, before.rcont_captured_fragment);
}

#[test]
fn tail_resume_handles_many_iterations_with_no_growth_in_captures() {
    init();
    // Spec §8 scenario 6 asks for 10^6 iterations to demonstrate O(1) peak
    // heap; a smaller count here still exercises the same "no capture ever
    // happens on this path" property without the test suite paying for a
    // million real register-context switches.
    const ITERATIONS: i64 = 100_000;
    let before = stats::snapshot();
    let hdef = HandlerDef::new(tail_inc(), OpKind::Tail, |resume, arg| {
        resume.tail_resume(Value::from_i64(arg.as_i64() + 1))
    });
    let mut total = 0i64;
    for _ in 0..ITERATIONS {
        total = handle(&hdef, |_| yield_effect(tail_inc(), Value::from_i64(total)), Value::null()).as_i64();
    }
    assert_eq!(total, ITERATIONS);

    let after = stats::snapshot();
    assert_eq!(
        after.rcont_captured_scoped + after.rcont_captured_resume + after.rcont_captured_fragment,
        before.rcont_captured_scoped + before.rcont_captured_resume + before.rcont_captured_fragment,
        "a Tail dispatch must never allocate a fragment or resumption"
    );
}

define_effect!(tail_body_op, "tail_body");

#[test]
fn tail_handler_body_may_reyield_the_same_effect_to_the_next_handler_down() {
    init();
    // A `Tail` operation body is allowed to yield further operations
    // (unlike `TailNoop`), including the very effect it is handling; that
    // re-yield must find the *next* handler down rather than looping back
    // onto the handler that is still running -- the skip-frame mechanism
    // exists for exactly this.
    let base_hdef = HandlerDef::new(tail_body_op(), OpKind::TailNoop, |resume, arg| {
        resume.tail_resume(Value::from_i64(arg.as_i64() * 2))
    });
    let relaying_hdef = HandlerDef::new(tail_body_op(), OpKind::Tail, |resume, arg| {
        let doubled = yield_effect(tail_body_op(), arg).as_i64();
        resume.tail_resume(Value::from_i64(doubled + 1))
    });

    let result = handle(
        &base_hdef,
        |_| {
            handle(
                &relaying_hdef,
                |_| yield_effect(tail_body_op(), Value::from_i64(10)),
                Value::null(),
            )
        },
        Value::null(),
    );
    assert_eq!(result.as_i64(), 21);
}

#[test]
fn fragment_capture_and_resume_round_trip_in_place() {
    init();
    // Mirrors the teacher crate's own `suspend_and_resume_once`: capture a
    // point, then immediately resume it from right where the capture took
    // place, before ever returning out past the mark.
    let delivered = Cell::new(0i64);
    let mark = engine::mark();
    let (fragment, first_pass) = engine::capture_fragment(mark);
    if first_pass {
        engine::resume_fragment(fragment, Value::from_i64(99));
    } else {
        delivered.set(engine::fragment_value(fragment).as_i64());
    }
    assert_eq!(delivered.get(), 99);
}

define_effect!(scoped_op, "scoped_op");

#[test]
fn scoped_resume_releases_its_continuation_after_one_use() {
    init();
    let hdef = HandlerDef::new(scoped_op(), OpKind::Scoped, |resume, arg| {
        resume.scoped_resume(Value::from_i64(arg.as_i64() + 1))
    });
    let result = handle(&hdef, |_| yield_effect(scoped_op(), Value::from_i64(9)), Value::null());
    assert_eq!(result.as_i64(), 10);
}

#[test]
fn scoped_resumption_not_consumed_is_released_when_handler_returns() {
    init();
    let before = stats::snapshot();
    let hdef = HandlerDef::new(scoped_op(), OpKind::Scoped, |resume: Resume, _arg| {
        // Never resumes; `handle` must release the captured resumption
        // once this closure returns so nothing leaks.
        drop(resume);
        Value::from_i64(-1)
    });
    let result = handle(&hdef, |_| yield_effect(scoped_op(), Value::null()), Value::null());
    assert_eq!(result.as_i64(), -1);

    let after = stats::snapshot();
    assert_eq!(after.rcont_captured_scoped, before.rcont_captured_scoped + 1);
    assert_eq!(after.rcont_released, before.rcont_released + 1);
}

#[test]
fn release_resume_is_an_alias_for_scoped_resume() {
    init();
    let hdef = HandlerDef::new(scoped_op(), OpKind::General, |resume, arg| {
        resume.release_resume(Value::from_i64(arg.as_i64() + 1))
    });
    let result = handle(&hdef, |_| yield_effect(scoped_op(), Value::from_i64(9)), Value::null());
    assert_eq!(result.as_i64(), 10);
}

define_effect!(linear_op, "linear_op");

#[test]
fn linear_handler_calls_the_operation_with_no_hstack_interaction() {
    init();
    let hdef = HandlerDef::new(linear_op(), OpKind::Tail, |resume, arg| {
        resume.tail_resume(Value::from_i64(arg.as_i64() + 1))
    });
    let session = linear_handler_init(&hdef);
    assert_eq!(session.call(Value::from_i64(41)).as_i64(), 42);
    linear_handler_done(session);
}

define_effect!(yield_n_op, "yield_n_op");

#[test]
fn yield_n_packs_arguments_through_a_stack_array() {
    init();
    let hdef = HandlerDef::new(yield_n_op(), OpKind::Tail, |resume, arg| {
        let args = unsafe { std::slice::from_raw_parts(arg.as_ptr::<Value>(), 3) };
        let total = args[0].as_i64() + args[1].as_i64() + args[2].as_i64();
        resume.tail_resume(Value::from_i64(total))
    });
    let args = [Value::from_i64(1), Value::from_i64(2), Value::from_i64(3)];
    let result = handle(&hdef, |_| yield_n(yield_n_op(), &args), Value::null());
    assert_eq!(result.as_i64(), 6);
}

#[test]
#[should_panic]
fn yield_with_no_installed_handler_is_fatal() {
    init();
    define_effect!(unhandled, "unhandled");
    yield_effect(unhandled(), Value::null());
}

#[test]
#[should_panic]
fn tail_resuming_a_captured_continuation_handle_is_fatal() {
    init();
    // `resume.tail_resume` is only valid for the Tail/TailNoop/NoResume
    // fast path; calling it on a captured (`General`) resumption handle
    // must fatal rather than silently doing the wrong thing.
    let hdef = HandlerDef::new(gen_op(), OpKind::General, |resume, arg| resume.tail_resume(arg));
    handle(&hdef, |_| yield_effect(gen_op(), Value::from_i64(1)), Value::null());
}
