//! Task state machines shared by the end-to-end suites.

#![allow(dead_code)]

use std::sync::Arc;

use tine::{Coroutine, Cx, Eventually, Step, Tag};

/// Stage cursor for the two-child fork/call/join machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Enter,
    Forked,
    Called,
    Joined,
}

/// `fib(n) = fork(fib(n - 1)) + call(fib(n - 2))`, with an optional induced
/// failure when `n` reaches a trigger value.
pub struct Fib {
    n: u64,
    fail_at: Option<u64>,
    a: Eventually<u64>,
    b: Eventually<u64>,
    stage: Stage,
}

impl Fib {
    pub fn new(n: u64) -> Self {
        Self {
            n,
            fail_at: None,
            a: Eventually::empty(),
            b: Eventually::empty(),
            stage: Stage::Enter,
        }
    }

    /// A fib tree that panics in every node where `n == fail_at`.
    pub fn failing(n: u64, fail_at: u64) -> Self {
        Self {
            fail_at: Some(fail_at),
            ..Self::new(n)
        }
    }

    fn child(&self, n: u64) -> Self {
        Self {
            n,
            fail_at: self.fail_at,
            a: Eventually::empty(),
            b: Eventually::empty(),
            stage: Stage::Enter,
        }
    }
}

impl Coroutine for Fib {
    type Output = u64;

    fn resume(&mut self, cx: &mut Cx<'_>) -> Step<u64> {
        match self.stage {
            Stage::Enter => {
                if self.fail_at == Some(self.n) {
                    panic!("induced failure at n = {}", self.n);
                }
                if self.n < 2 {
                    return Step::done(self.n);
                }
                self.stage = Stage::Forked;
                let child = self.child(self.n - 1);
                cx.fork(&self.a, child)
            }
            Stage::Forked => {
                self.stage = Stage::Called;
                let child = self.child(self.n - 2);
                cx.call(&self.b, child)
            }
            Stage::Called => {
                self.stage = Stage::Joined;
                cx.join()
            }
            Stage::Joined => Step::done(self.a.take() + self.b.take()),
        }
    }
}

pub fn sequential_fib(n: u64) -> u64 {
    if n < 2 {
        n
    } else {
        sequential_fib(n - 1) + sequential_fib(n - 2)
    }
}

/// Parallel reduce: splits `data[lo..hi]` at the midpoint until a chunk
/// fits the grain, then sums sequentially (accumulating in f64).
pub struct SumChunks {
    data: Arc<[f32]>,
    lo: usize,
    hi: usize,
    grain: usize,
    left: Eventually<f64>,
    right: Eventually<f64>,
    stage: Stage,
}

impl SumChunks {
    pub fn new(data: Arc<[f32]>, lo: usize, hi: usize, grain: usize) -> Self {
        assert!(grain > 0, "grain must be non-zero");
        Self {
            data,
            lo,
            hi,
            grain,
            left: Eventually::empty(),
            right: Eventually::empty(),
            stage: Stage::Enter,
        }
    }

    fn mid(&self) -> usize {
        self.lo + (self.hi - self.lo) / 2
    }
}

impl Coroutine for SumChunks {
    type Output = f64;

    fn resume(&mut self, cx: &mut Cx<'_>) -> Step<f64> {
        match self.stage {
            Stage::Enter => {
                if self.hi - self.lo <= self.grain {
                    let total = self.data[self.lo..self.hi]
                        .iter()
                        .map(|&x| f64::from(x))
                        .sum();
                    return Step::done(total);
                }
                self.stage = Stage::Forked;
                let child = Self::new(Arc::clone(&self.data), self.lo, self.mid(), self.grain);
                cx.fork(&self.left, child)
            }
            Stage::Forked => {
                self.stage = Stage::Called;
                let child = Self::new(Arc::clone(&self.data), self.mid(), self.hi, self.grain);
                cx.call(&self.right, child)
            }
            Stage::Called => {
                self.stage = Stage::Joined;
                cx.join()
            }
            Stage::Joined => Step::done(self.left.take() + self.right.take()),
        }
    }
}

pub const INTEGRATE_EPSILON: f64 = 1e-9;

fn curve(x: f64) -> f64 {
    x * x
}

/// Adaptive trapezoid integration of `x^2`: each node forks the left
/// subinterval, calls the right, joins, and sums.
pub struct Integrate {
    x1: f64,
    y1: f64,
    x2: f64,
    y2: f64,
    area: f64,
    left: Eventually<f64>,
    right: Eventually<f64>,
    stage: Stage,
}

impl Integrate {
    pub fn over(x1: f64, x2: f64) -> Self {
        Self::node(x1, curve(x1), x2, curve(x2), 0.0)
    }

    fn node(x1: f64, y1: f64, x2: f64, y2: f64, area: f64) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            area,
            left: Eventually::empty(),
            right: Eventually::empty(),
            stage: Stage::Enter,
        }
    }

    fn split(&self) -> (f64, f64, f64, f64) {
        let half = (self.x2 - self.x1) / 2.0;
        let x0 = self.x1 + half;
        let y0 = curve(x0);
        let area_left = (self.y1 + y0) / 2.0 * half;
        let area_right = (y0 + self.y2) / 2.0 * half;
        (x0, y0, area_left, area_right)
    }
}

impl Coroutine for Integrate {
    type Output = f64;

    fn resume(&mut self, cx: &mut Cx<'_>) -> Step<f64> {
        match self.stage {
            Stage::Enter => {
                let (_, _, area_left, area_right) = self.split();
                if (area_left + area_right - self.area).abs() < INTEGRATE_EPSILON {
                    return Step::done(area_left + area_right);
                }
                self.stage = Stage::Forked;
                let (x0, y0, area_left, _) = self.split();
                let child = Self::node(self.x1, self.y1, x0, y0, area_left);
                cx.fork(&self.left, child)
            }
            Stage::Forked => {
                self.stage = Stage::Called;
                let (x0, y0, _, area_right) = self.split();
                let child = Self::node(x0, y0, self.x2, self.y2, area_right);
                cx.call(&self.right, child)
            }
            Stage::Called => {
                self.stage = Stage::Joined;
                cx.join()
            }
            Stage::Joined => Step::done(self.left.take() + self.right.take()),
        }
    }
}

pub fn sequential_integrate(x1: f64, y1: f64, x2: f64, y2: f64, area: f64) -> f64 {
    let half = (x2 - x1) / 2.0;
    let x0 = x1 + half;
    let y0 = curve(x0);
    let area_left = (y1 + y0) / 2.0 * half;
    let area_right = (y0 + y2) / 2.0 * half;
    if (area_left + area_right - area).abs() < INTEGRATE_EPSILON {
        return area_left + area_right;
    }
    sequential_integrate(x1, y1, x0, y0, area_left)
        + sequential_integrate(x0, y0, x2, y2, area_right)
}

pub fn sequential_integrate_over(x1: f64, x2: f64) -> f64 {
    sequential_integrate(x1, curve(x1), x2, curve(x2), 0.0)
}

/// A fork chain `depth` frames deep: every node forks one child and joins
/// it, so the cactus stack must absorb the whole spine.
pub struct DeepChain {
    depth: u32,
    below: Eventually<u64>,
    stage: Stage,
}

impl DeepChain {
    pub fn new(depth: u32) -> Self {
        Self {
            depth,
            below: Eventually::empty(),
            stage: Stage::Enter,
        }
    }
}

impl Coroutine for DeepChain {
    type Output = u64;

    fn resume(&mut self, cx: &mut Cx<'_>) -> Step<u64> {
        match self.stage {
            Stage::Enter => {
                if self.depth == 0 {
                    return Step::done(1);
                }
                self.stage = Stage::Forked;
                let child = Self::new(self.depth - 1);
                cx.fork(&self.below, child)
            }
            Stage::Forked => {
                self.stage = Stage::Joined;
                cx.join()
            }
            _ => Step::done(self.below.take() + 1),
        }
    }
}

/// A root task that hops across the given workers, recording the context
/// it observes after every switch.
pub struct Hopscotch {
    targets: Vec<usize>,
    position: usize,
    recording: bool,
    observed: Vec<usize>,
}

impl Hopscotch {
    pub fn new(targets: Vec<usize>) -> Self {
        Self {
            targets,
            position: 0,
            recording: false,
            observed: Vec::new(),
        }
    }
}

impl Coroutine for Hopscotch {
    type Output = Vec<usize>;

    fn resume(&mut self, cx: &mut Cx<'_>) -> Step<Vec<usize>> {
        if self.recording {
            self.recording = false;
            self.observed.push(cx.context().index());
        }
        if self.position < self.targets.len() {
            let dest = cx
                .context_of(self.targets[self.position])
                .expect("switch target outside the pool");
            self.position += 1;
            self.recording = true;
            return cx.switch_to(dest);
        }
        Step::done(std::mem::take(&mut self.observed))
    }
}

/// A child task whose body always panics.
pub struct PanicTask;

impl Coroutine for PanicTask {
    type Output = u64;

    fn resume(&mut self, _cx: &mut Cx<'_>) -> Step<u64> {
        panic!("sibling failure");
    }
}

/// Forks `total` children that all panic, then joins them.
pub struct FanOutPanics {
    total: usize,
    spawned: usize,
    joined: bool,
    slots: Vec<Eventually<u64>>,
}

impl FanOutPanics {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            spawned: 0,
            joined: false,
            slots: (0..total).map(|_| Eventually::empty()).collect(),
        }
    }
}

impl Coroutine for FanOutPanics {
    type Output = u64;

    fn resume(&mut self, cx: &mut Cx<'_>) -> Step<u64> {
        if self.spawned < self.total {
            let index = self.spawned;
            self.spawned += 1;
            return cx.fork(&self.slots[index], PanicTask);
        }
        if !self.joined {
            self.joined = true;
            return cx.join();
        }
        // Reachable only if every sibling failure was somehow dropped.
        Step::done(0)
    }
}

/// Stashes a failure without unwinding, then completes normally; the stash
/// must still surface at the sync point.
pub struct StashesFailure;

impl Coroutine for StashesFailure {
    type Output = u64;

    fn resume(&mut self, cx: &mut Cx<'_>) -> Step<u64> {
        cx.stash_exception("stashed without unwinding");
        Step::done(42)
    }
}

/// Asserts the tag each invocation kind observes.
pub struct TagProbe {
    expect: Tag,
    child_done: bool,
    slot: Eventually<u64>,
}

impl TagProbe {
    pub fn root() -> Self {
        Self {
            expect: Tag::Root,
            child_done: false,
            slot: Eventually::empty(),
        }
    }

    fn child(expect: Tag) -> Self {
        Self {
            expect,
            child_done: true,
            slot: Eventually::empty(),
        }
    }
}

impl Coroutine for TagProbe {
    type Output = u64;

    fn resume(&mut self, cx: &mut Cx<'_>) -> Step<u64> {
        assert_eq!(cx.tag(), self.expect, "unexpected invocation tag");
        if self.child_done {
            return Step::done(1);
        }
        self.child_done = true;
        cx.call(&self.slot, TagProbe::child(Tag::Call))
    }
}
