//! Process-wide early-exit flag.
//!
//! Shared state only because it must be reachable from signal handlers.
//! Writers store the desired exit code; the fuzzing loop polls at batch
//! boundaries and between inputs, finishes the in-flight work and returns.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

static EXIT_REQUESTED: AtomicBool = AtomicBool::new(false);
static EXIT_CODE: AtomicI32 = AtomicI32::new(0);

/// Requests that the fuzzing loop winds down. Async-signal-safe.
pub fn request_early_exit(exit_code: i32) {
    EXIT_CODE.store(exit_code, Ordering::SeqCst);
    EXIT_REQUESTED.store(true, Ordering::SeqCst);
}

pub fn early_exit_requested() -> bool {
    EXIT_REQUESTED.load(Ordering::SeqCst)
}

/// The code to exit the process with; 0 unless an early exit was requested.
pub fn exit_code() -> i32 {
    EXIT_CODE.load(Ordering::SeqCst)
}
