//! Local admission control for one credential
//!
//! A `QuotaCounter` is either a token bucket (continuous refill) or a rolling
//! window (timestamped events evicted after the window). Both answer the same
//! two questions: can `units` be admitted now, and when will they next be.
//!
//! All state sits behind one `parking_lot::Mutex`, so check-and-deduct is
//! atomic per counter. Times come from `tokio::time::Instant`, which keeps the
//! counter monotonic and lets paused test clocks drive it.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::QuotaConfig;

/// Tolerance for float drift between `next_available_time` and `try_admit`.
const EPSILON: f64 = 1e-9;

#[derive(Debug)]
enum Admission {
    Bucket {
        tokens: f64,
        last_refill: Instant,
    },
    Rolling {
        events: VecDeque<(Instant, u32)>,
        used: u32,
    },
}

#[derive(Debug)]
struct State {
    refill_rate: f64,
    deferred_until: Option<Instant>,
    admission: Admission,
}

impl State {
    /// Rolling window length at the current rate (`capacity / rate`).
    fn window(&self, capacity: u32) -> Duration {
        Duration::from_secs_f64(f64::from(capacity) / self.refill_rate)
    }

    /// Bring the counter up to `now`: refill tokens or evict expired events.
    fn refresh(&mut self, capacity: u32, now: Instant) {
        if self.deferred_until.is_some_and(|until| until <= now) {
            self.deferred_until = None;
        }
        let window = self.window(capacity);
        match &mut self.admission {
            Admission::Bucket {
                tokens,
                last_refill,
            } => {
                let elapsed = now.saturating_duration_since(*last_refill).as_secs_f64();
                *tokens = (*tokens + elapsed * self.refill_rate).min(f64::from(capacity));
                *last_refill = now;
            }
            Admission::Rolling { events, used } => {
                while let Some(&(at, units)) = events.front() {
                    if at + window > now {
                        break;
                    }
                    events.pop_front();
                    *used -= units;
                }
            }
        }
    }

    fn available(&self, capacity: u32) -> f64 {
        match &self.admission {
            Admission::Bucket { tokens, .. } => *tokens,
            Admission::Rolling { used, .. } => f64::from(capacity - used),
        }
    }
}

/// Point-in-time view of a counter for status reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaSnapshot {
    pub capacity: u32,
    pub available: f64,
    pub refill_rate: f64,
    pub base_rate: f64,
    pub deferred_until: Option<Instant>,
}

/// Admission-control counter for one credential.
#[derive(Debug)]
pub struct QuotaCounter {
    capacity: u32,
    base_rate: f64,
    min_refill_factor: f64,
    state: Mutex<State>,
}

impl QuotaCounter {
    /// Token bucket starting full, refilled at `refill_rate` units per second.
    pub fn token_bucket(capacity: u32, refill_rate: f64) -> Self {
        Self::with_admission(
            capacity,
            refill_rate,
            Admission::Bucket {
                tokens: f64::from(capacity),
                last_refill: Instant::now(),
            },
        )
    }

    /// Rolling window admitting at most `capacity` units per trailing `window`.
    pub fn rolling_window(capacity: u32, window: Duration) -> Self {
        Self::with_admission(
            capacity,
            f64::from(capacity) / window.as_secs_f64(),
            Admission::Rolling {
                events: VecDeque::new(),
                used: 0,
            },
        )
    }

    /// Build from validated config.
    pub fn from_config(config: &QuotaConfig, min_refill_factor: f64) -> Self {
        let counter = match config {
            QuotaConfig::TokenBucket {
                capacity,
                refill_rate_per_second,
            } => Self::token_bucket(*capacity, *refill_rate_per_second),
            QuotaConfig::RollingWindow {
                capacity,
                window_seconds,
            } => Self::rolling_window(*capacity, Duration::from_secs_f64(*window_seconds)),
        };
        counter.with_min_refill_factor(min_refill_factor)
    }

    /// Lower clamp for `adjust_refill_rate`, as a fraction of the base rate.
    pub fn with_min_refill_factor(mut self, factor: f64) -> Self {
        self.min_refill_factor = factor.clamp(f64::MIN_POSITIVE, 1.0);
        self
    }

    fn with_admission(capacity: u32, refill_rate: f64, admission: Admission) -> Self {
        Self {
            capacity,
            base_rate: refill_rate,
            min_refill_factor: 0.1,
            state: Mutex::new(State {
                refill_rate,
                deferred_until: None,
                admission,
            }),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn base_rate(&self) -> f64 {
        self.base_rate
    }

    pub fn refill_rate(&self) -> f64 {
        self.state.lock().refill_rate
    }

    /// Units admittable right now.
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        state.refresh(self.capacity, Instant::now());
        state.available(self.capacity)
    }

    /// Admit `units` if capacity allows, deducting them atomically.
    ///
    /// Leaves the counter untouched and returns `false` otherwise. Never blocks
    /// beyond the counter's own lock.
    pub fn try_admit(&self, units: u32) -> bool {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.refresh(self.capacity, now);
        if state.deferred_until.is_some() {
            return false;
        }

        match &mut state.admission {
            Admission::Bucket { tokens, .. } => {
                let need = f64::from(units);
                if *tokens + EPSILON >= need {
                    *tokens = (*tokens - need).max(0.0);
                    true
                } else {
                    false
                }
            }
            Admission::Rolling { events, used } => {
                if units > self.capacity - *used {
                    return false;
                }
                if units > 0 {
                    events.push_back((now, units));
                    *used += units;
                }
                true
            }
        }
    }

    /// Earliest instant at which `units` would be admitted.
    ///
    /// Returns `now` when admission would succeed immediately and `None` when
    /// `units` exceeds the capacity (never admittable). Accounts for any
    /// deferral set by the reactive layer.
    pub fn next_available_time(&self, units: u32) -> Option<Instant> {
        if units > self.capacity {
            return None;
        }
        let now = Instant::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.refresh(self.capacity, now);

        let ready = match &state.admission {
            Admission::Bucket { tokens, .. } => {
                let deficit = f64::from(units) - *tokens;
                if deficit <= EPSILON {
                    now
                } else {
                    now + Duration::from_secs_f64(deficit / state.refill_rate)
                        + Duration::from_nanos(1)
                }
            }
            Admission::Rolling { events, used } => {
                let free = self.capacity - *used;
                if units <= free {
                    now
                } else {
                    let window = state.window(self.capacity);
                    let mut need = units - free;
                    let mut at = now;
                    for &(admitted_at, admitted) in events {
                        at = admitted_at + window;
                        if admitted >= need {
                            break;
                        }
                        need -= admitted;
                    }
                    at
                }
            }
        };

        Some(match state.deferred_until {
            Some(until) if until > ready => until,
            _ => ready,
        })
    }

    /// Set a new refill rate, clamped to `[min_refill_factor * base, base]`.
    ///
    /// Capacity accrued at the old rate is kept. Returns the rate applied.
    pub fn adjust_refill_rate(&self, new_rate: f64) -> f64 {
        let floor = self.base_rate * self.min_refill_factor;
        let rate = if new_rate.is_nan() {
            floor
        } else {
            new_rate.clamp(floor, self.base_rate)
        };

        let mut state = self.state.lock();
        state.refresh(self.capacity, Instant::now());
        state.refill_rate = rate;
        rate
    }

    /// Refuse admission until `until`. An existing later deferral is kept.
    pub fn defer_until(&self, until: Instant) {
        let mut state = self.state.lock();
        if state.deferred_until.is_none_or(|current| current < until) {
            state.deferred_until = Some(until);
        }
    }

    pub fn snapshot(&self) -> QuotaSnapshot {
        let mut state = self.state.lock();
        state.refresh(self.capacity, Instant::now());
        QuotaSnapshot {
            capacity: self.capacity,
            available: state.available(self.capacity),
            refill_rate: state.refill_rate,
            base_rate: self.base_rate,
            deferred_until: state.deferred_until,
        }
    }
}
