//! Poll backoff for loops that drain a ring without a kernel wait primitive.
//!
//! Spin briefly for the common low-latency case, then yield, then sleep so an
//! idle channel does not pin a core.

use std::time::Duration;

pub struct Backoff {
    rounds: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self { rounds: 0 }
    }

    /// Call after useful work; the next wait starts hot again.
    pub fn reset(&mut self) {
        self.rounds = 0;
    }

    pub fn wait(&mut self) {
        if self.rounds < 64 {
            std::hint::spin_loop();
        } else if self.rounds < 128 {
            std::thread::yield_now();
        } else {
            std::thread::sleep(Duration::from_micros(50));
        }
        self.rounds = self.rounds.saturating_add(1);
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
