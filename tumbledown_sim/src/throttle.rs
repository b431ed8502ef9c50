// Global sliding-window limit on chunk uncombines.
//
// Restoring a batched chunk into individually simulated cells is the most
// expensive thing the core does, so all chunks share one budget: at most
// `max_per_window` uncombines in any `window_ticks`-long window. A chunk that
// finds the budget spent takes the cheap path instead (detach as one rigid
// fragment, or just absorb the damage). See `chunk.rs` for that decision.
//
// The throttle is owned by `Structure` and passed by `&mut` to the routing
// code. It is the only piece of mutable state shared across walls.

use crate::config::ThrottleConfig;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UncombineThrottle {
    max_per_window: u32,
    window_ticks: u64,
    /// Ticks of the uncombines still inside the window, oldest first.
    recent: VecDeque<u64>,
}

impl UncombineThrottle {
    pub fn new(config: &ThrottleConfig) -> Self {
        Self {
            max_per_window: config.max_uncombines_per_window,
            window_ticks: config.window_ticks,
            recent: VecDeque::new(),
        }
    }

    fn expire(&mut self, now: u64) {
        while let Some(&oldest) = self.recent.front() {
            if now.saturating_sub(oldest) >= self.window_ticks {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }

    /// Uncombines still allowed at `now`.
    pub fn remaining(&mut self, now: u64) -> u32 {
        self.expire(now);
        self.max_per_window.saturating_sub(self.recent.len() as u32)
    }

    /// Consume one unit of budget if any is left.
    pub fn try_acquire(&mut self, now: u64) -> bool {
        if self.remaining(now) == 0 {
            return false;
        }
        self.recent.push_back(now);
        true
    }
}
