//! Law tests: parallel evaluation must agree with sequential evaluation.
//!
//! Reduce inputs are integer-valued so f64 accumulation is exact in any
//! association; that turns the associativity law into strict equality.

mod common;

use std::sync::Arc;

use common::{sequential_fib, Fib, SumChunks};
use proptest::prelude::*;
use tine::{sync_wait, LazyPool, UnitPool};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn fork_join_reduce_equals_sequential_reduce(
        values in proptest::collection::vec(-1_000i32..1_000, 0..2_000),
        grain in 1usize..64,
    ) {
        let pool = LazyPool::with_threads(2);
        let data: Arc<[f32]> = values.iter().map(|&v| v as f32).collect();
        let expected: f64 = data.iter().map(|&x| f64::from(x)).sum();
        let len = data.len();
        let total = sync_wait(&pool, SumChunks::new(data, 0, len, grain));
        prop_assert_eq!(total, expected);
    }

    #[test]
    fn sync_wait_computes_the_pure_function(n in 0u64..18) {
        let pool = UnitPool::new();
        prop_assert_eq!(sync_wait(&pool, Fib::new(n)), sequential_fib(n));
    }

    #[test]
    fn fork_join_is_call_on_a_unit_pool(n in 2u64..16) {
        // Call-fork equivalence under a single thread: the forked tree and
        // the sequential recursion are observationally identical.
        let unit = UnitPool::new();
        let parallel = LazyPool::with_threads(3);
        let on_unit = sync_wait(&unit, Fib::new(n));
        let on_parallel = sync_wait(&parallel, Fib::new(n));
        prop_assert_eq!(on_unit, on_parallel);
        prop_assert_eq!(on_unit, sequential_fib(n));
    }
}
