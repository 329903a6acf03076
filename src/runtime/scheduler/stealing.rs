//! Victim selection for work stealing.

use std::ptr::NonNull;

use crate::runtime::scheduler::deque::{DequeStealer, Steal};
use crate::task::frame::Frame;
use crate::util::DetRng;

/// Tries to steal a continuation from any victim.
///
/// Scans all victims sequentially from a random starting point, skipping
/// the caller's own deque. A round that saw only losses (`Retry`) is
/// repeated, up to `retries` rounds; a round of pure emptiness ends the
/// attempt early.
pub(crate) fn steal_task(
    stealers: &[DequeStealer],
    own_index: usize,
    rng: &mut DetRng,
    retries: usize,
) -> Option<NonNull<Frame>> {
    if stealers.len() <= 1 {
        return None;
    }

    let len = stealers.len();
    for _ in 0..retries.max(1) {
        let start = rng.next_usize(len);
        let mut contended = false;

        for offset in 0..len {
            let index = (start + offset) % len;
            if index == own_index {
                continue;
            }
            match stealers[index].steal() {
                Steal::Success(frame) => return Some(frame),
                Steal::Retry => contended = true,
                Steal::Empty => {}
            }
        }

        if !contended {
            return None;
        }
    }
    None
}
