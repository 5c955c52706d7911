//! Retransmission timer arithmetic
//!
//! Pure state: no timers live here. The trunk arms a timer at
//! [`RetryState::next`] and calls [`RetryState::advance`] when it fires;
//! the decision tells it whether to retransmit or give up. Intervals double
//! up to `max_rt` with a uniform ±10% jitter so a pool of workers does not
//! retransmit in lockstep.

use rand::Rng;
use std::time::{Duration, Instant};

/// Bounds for one retransmission schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// First retransmit interval
    pub initial_rt: Duration,
    /// Cap on the doubled interval
    pub max_rt: Duration,
    /// Maximum transmission count, 0 for unlimited
    pub mrc: u32,
    /// Maximum total duration, zero for unlimited
    pub mrd: Duration,
}

/// What to do when the retry timer fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retransmit and re-arm at [`RetryState::next`]
    Continue,
    /// Transmission count exceeded `mrc`
    MrcExceeded,
    /// Elapsed time exceeded `mrd`
    MrdExceeded,
}

/// Live retransmission state for one request
#[derive(Debug, Clone, Copy)]
pub struct RetryState {
    /// When the first transmission was scheduled
    pub start: Instant,
    /// Last time the state advanced
    pub updated: Instant,
    /// When the timer should fire next
    pub next: Instant,
    /// Current retransmit interval
    pub rt: Duration,
    /// Transmissions so far
    pub count: u32,
    /// The governing bounds
    pub config: RetryConfig,
}

impl RetryState {
    /// Start a schedule: one transmission outstanding, timer due after a
    /// jittered `initial_rt`.
    pub fn init(config: RetryConfig, now: Instant) -> Self {
        let rt = jitter(config.initial_rt);
        RetryState {
            start: now,
            updated: now,
            next: now + rt,
            rt,
            count: 1,
            config,
        }
    }

    /// Advance the schedule after the timer fired.
    pub fn advance(&mut self, now: Instant) -> RetryDecision {
        if !self.config.mrd.is_zero() && now.duration_since(self.start) > self.config.mrd {
            return RetryDecision::MrdExceeded;
        }

        self.count += 1;
        if self.config.mrc != 0 && self.count > self.config.mrc {
            return RetryDecision::MrcExceeded;
        }

        let doubled = self
            .rt
            .checked_mul(2)
            .unwrap_or(self.config.max_rt)
            .min(self.config.max_rt);
        self.rt = jitter(doubled);
        self.updated = now;
        self.next = now + self.rt;
        RetryDecision::Continue
    }
}

/// Uniform jitter in [-0.1·d, +0.1·d], never below one millisecond
fn jitter(d: Duration) -> Duration {
    let factor: f64 = rand::rng().random_range(-0.1..=0.1);
    let jittered = d.as_secs_f64() * (1.0 + factor);
    Duration::from_secs_f64(jittered.max(0.001))
}
