//! End-to-end fork/join computations on every scheduler.

mod common;

use std::sync::Arc;

use common::{
    sequential_fib, sequential_integrate_over, DeepChain, Fib, Integrate, SumChunks, TagProbe,
};
use tine::{sync_wait, BusyPool, LazyPool, UnitPool};

#[test]
fn fib_on_unit_pool() {
    let pool = UnitPool::new();
    assert_eq!(sync_wait(&pool, Fib::new(10)), 55);
}

#[test]
fn fib_on_busy_pool() {
    let pool = BusyPool::with_threads(4);
    assert_eq!(sync_wait(&pool, Fib::new(10)), 55);
    assert_eq!(sync_wait(&pool, Fib::new(20)), 6765);
}

#[test]
fn fib_on_lazy_pool() {
    let pool = LazyPool::with_threads(4);
    assert_eq!(sync_wait(&pool, Fib::new(10)), 55);
    assert_eq!(sync_wait(&pool, Fib::new(20)), 6765);
}

#[test]
fn fib_matches_sequential_for_small_inputs() {
    let pool = LazyPool::with_threads(2);
    for n in 0..=15 {
        assert_eq!(sync_wait(&pool, Fib::new(n)), sequential_fib(n), "fib({n})");
    }
}

#[test]
fn reduce_one_million_ones() {
    let pool = LazyPool::with_threads(4);
    let data: Arc<[f32]> = vec![1.0f32; 1_000_000].into();
    let len = data.len();
    let total = sync_wait(&pool, SumChunks::new(data, 0, len, 1024));
    assert!((total - 1_000_000.0).abs() < 1e-6, "total = {total}");
}

#[test]
fn reduce_handles_tiny_and_empty_ranges() {
    let pool = LazyPool::with_threads(2);
    let data: Arc<[f32]> = vec![2.5f32; 7].into();
    assert!((sync_wait(&pool, SumChunks::new(Arc::clone(&data), 0, 7, 2)) - 17.5).abs() < 1e-9);
    assert_eq!(sync_wait(&pool, SumChunks::new(data, 0, 0, 4)), 0.0);
}

#[test]
fn integrate_matches_sequential_baseline() {
    let pool = LazyPool::with_threads(4);
    let parallel = sync_wait(&pool, Integrate::over(0.0, 64.0));
    let sequential = sequential_integrate_over(0.0, 64.0);
    assert!(
        (parallel - sequential).abs() < 1e-9,
        "parallel = {parallel}, sequential = {sequential}"
    );
    // Sanity against the analytic integral of x^2 over [0, 64].
    let analytic = 64.0f64.powi(3) / 3.0;
    assert!((parallel - analytic).abs() / analytic < 1e-3);
}

#[test]
fn deep_fork_chain_absorbs_depth() {
    let pool = LazyPool::with_threads(4);
    let depth = 4_000;
    assert_eq!(sync_wait(&pool, DeepChain::new(depth)), u64::from(depth) + 1);
}

#[test]
fn deep_fork_chain_on_a_single_worker() {
    let pool = UnitPool::new();
    let depth = 4_000;
    assert_eq!(sync_wait(&pool, DeepChain::new(depth)), u64::from(depth) + 1);
}

#[test]
fn repeated_sync_waits_reuse_the_pool() {
    let pool = LazyPool::with_threads(3);
    for _ in 0..20 {
        assert_eq!(sync_wait(&pool, Fib::new(12)), 144);
    }
}

#[test]
fn tags_reflect_the_invocation() {
    let pool = LazyPool::with_threads(2);
    assert_eq!(sync_wait(&pool, TagProbe::root()), 1);
}
