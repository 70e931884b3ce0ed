//! Cheap per-thread statistics, the Rust analogue of `libhandler.c`'s
//! `stats` struct (compiled in unconditionally there via `#define _STATS`).
//!
//! Gathered unconditionally since the counters are just `u64` increments;
//! the original only guards the `_DEBUG_STATS` operation counter behind a
//! debug build, which we mirror with `cfg(debug_assertions)`.

use std::cell::Cell;

#[derive(Debug, Default, Clone, Copy)]
pub struct EngineStats {
    pub rcont_captured_scoped: u64,
    pub rcont_captured_resume: u64,
    pub rcont_captured_fragment: u64,
    pub rcont_captured_empty: u64,
    pub rcont_captured_size: u64,

    pub rcont_resumed_scoped: u64,
    pub rcont_resumed_resume: u64,
    pub rcont_resumed_fragment: u64,
    pub rcont_resumed_tail: u64,

    pub rcont_released: u64,
    pub rcont_released_size: u64,

    pub operations: u64,
    pub hstack_max: u64,
}

thread_local! {
    static STATS: Cell<EngineStats> = Cell::new(EngineStats::default());
}

macro_rules! bump {
    ($field:ident) => {
        crate::stats::STATS.with(|s| {
            let mut v = s.get();
            v.$field += 1;
            s.set(v);
        })
    };
    ($field:ident, $amount:expr) => {
        crate::stats::STATS.with(|s| {
            let mut v = s.get();
            v.$field += $amount;
            s.set(v);
        })
    };
}
pub(crate) use bump;

pub(crate) fn set_hstack_max(size: usize) {
    STATS.with(|s| {
        let mut v = s.get();
        if size as u64 > v.hstack_max {
            v.hstack_max = size as u64;
        }
        s.set(v);
    });
}

/// A snapshot of the calling thread's statistics, the analogue of
/// `lh_print_stats`'s data source.
pub fn snapshot() -> EngineStats {
    STATS.with(|s| s.get())
}

/// Log a human-readable statistics report for the calling thread, the
/// analogue of `lh_print_stats`.
pub fn print_stats() {
    let s = snapshot();
    let captured = s.rcont_captured_scoped + s.rcont_captured_resume + s.rcont_captured_fragment;
    let resumed =
        s.rcont_resumed_scoped + s.rcont_resumed_resume + s.rcont_resumed_fragment + s.rcont_resumed_tail;
    if captured != s.rcont_released {
        log::warn!("effection: memory leaked: not all continuations are released");
    }
    log::info!(
        "effection stats: captured={captured} resumed={resumed} released={} hstack_max={}kb",
        s.rcont_released,
        (s.hstack_max + 1023) / 1024
    );
}

/// Check whether all captured continuations have been released; logs via
/// [`print_stats`] if not. The analogue of `lh_check_memory`.
pub fn check_leaks() {
    let s = snapshot();
    let captured = s.rcont_captured_scoped + s.rcont_captured_resume + s.rcont_captured_fragment;
    if captured != s.rcont_released {
        print_stats();
    }
}
