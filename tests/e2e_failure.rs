//! Failure capture and propagation through the join chain.

mod common;

use std::panic;

use common::{FanOutPanics, Fib, StashesFailure};
use tine::{sync_wait, try_sync_wait, LazyPool, UnitPool};

#[test]
fn induced_failure_surfaces_exactly_one_error() {
    let pool = LazyPool::with_threads(4);
    let failed = try_sync_wait(&pool, Fib::failing(10, 7))
        .expect_err("a node panicked, the tree must fail");
    assert!(
        failed.message().contains("induced failure at n = 7"),
        "unexpected message: {}",
        failed.message()
    );
}

#[test]
fn sync_wait_re_raises_on_the_caller() {
    let pool = LazyPool::with_threads(2);
    let caught = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        sync_wait(&pool, Fib::failing(9, 7))
    }))
    .expect_err("the failure must be re-raised");
    let message = caught
        .downcast_ref::<String>()
        .map(String::as_str)
        .expect("panic payload should be the formatted message");
    assert!(message.contains("induced failure at n = 7"));
}

#[test]
fn trees_below_the_trigger_succeed() {
    let pool = LazyPool::with_threads(2);
    assert_eq!(try_sync_wait(&pool, Fib::failing(6, 7)).expect("no node reaches n = 7"), 8);
}

#[test]
fn failure_propagates_on_the_unit_pool() {
    let pool = UnitPool::new();
    assert!(try_sync_wait(&pool, Fib::failing(10, 7)).is_err());
    assert_eq!(try_sync_wait(&pool, Fib::failing(5, 7)).expect("below trigger"), 5);
}

#[test]
fn concurrent_sibling_failures_surface_at_least_once() {
    let pool = LazyPool::with_threads(4);
    let failed = try_sync_wait(&pool, FanOutPanics::new(8))
        .expect_err("every sibling panicked, the join must fail");
    assert_eq!(failed.message(), "sibling failure");
}

#[test]
fn stashed_failures_surface_without_unwinding() {
    let pool = LazyPool::with_threads(2);
    let failed = try_sync_wait(&pool, StashesFailure)
        .expect_err("a stashed failure must win over the normal result");
    assert_eq!(failed.message(), "stashed without unwinding");
}

#[test]
fn the_pool_survives_failed_trees() {
    let pool = LazyPool::with_threads(4);
    for _ in 0..5 {
        assert!(try_sync_wait(&pool, Fib::failing(10, 7)).is_err());
        assert_eq!(try_sync_wait(&pool, Fib::new(12)).expect("healthy tree"), 144);
    }
}
