//! Outbound RPC admission gate.
//!
//! Two limits apply to every chain call:
//! - a minimum spacing between consecutive call starts, and
//! - a reservoir of calls that is topped back up to `refresh_amount` every
//!   `refresh_interval`.
//!
//! Callers that cannot be admitted yet sleep until their slot. Nothing is
//! ever rejected. Waiters are served in arrival order because the state sits
//! behind a tokio `Mutex`, which is fair.

use std::future::Future;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Calls available at startup.
    pub reservoir: u32,
    /// Reservoir level restored at each refresh.
    pub refresh_amount: u32,
    pub refresh_interval: Duration,
    /// Minimum gap between two call starts.
    pub min_spacing: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            reservoir: 10,
            refresh_amount: 10,
            refresh_interval: Duration::from_secs(1),
            min_spacing: Duration::from_millis(50),
        }
    }
}

#[derive(Debug)]
struct LimiterState {
    remaining: u32,
    next_refresh: Instant,
    next_slot: Instant,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let now = Instant::now();
        let state = LimiterState {
            remaining: config.reservoir,
            next_refresh: now + config.refresh_interval,
            next_slot: now,
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    /// Wait until one call may start.
    pub async fn acquire(&self) {
        loop {
            let wake_at = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                self.refresh(&mut state, now);

                if state.remaining > 0 {
                    state.remaining -= 1;
                    let slot = state.next_slot.max(now);
                    state.next_slot = slot + self.config.min_spacing;
                    if state.remaining == 0 {
                        debug!(
                            refresh_in_ms = state.next_refresh.saturating_duration_since(now).as_millis() as u64,
                            "rate limit reservoir depleted, throttling calls"
                        );
                    }
                    drop(state);
                    sleep_until(slot).await;
                    return;
                }
                state.next_refresh
            };
            // Reservoir empty: wait for the refill and retry.
            sleep_until(wake_at).await;
        }
    }

    /// Run `call` once admitted.
    pub async fn schedule<F, T>(&self, call: F) -> T
    where
        F: Future<Output = T>,
    {
        self.acquire().await;
        call.await
    }

    /// Calls left in the current window.
    pub async fn remaining(&self) -> u32 {
        let mut state = self.state.lock().await;
        self.refresh(&mut state, Instant::now());
        state.remaining
    }

    fn refresh(&self, state: &mut LimiterState, now: Instant) {
        if now < state.next_refresh {
            return;
        }
        state.remaining = self.config.refresh_amount;
        let interval = self.config.refresh_interval.max(Duration::from_millis(1));
        // Skip whole missed windows so the next refresh stays on the grid.
        while state.next_refresh <= now {
            state.next_refresh += interval;
        }
    }
}
