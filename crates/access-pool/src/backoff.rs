//! Reactive backoff from server-reported quota state
//!
//! `ReactiveBackoffPolicy::observe` turns one completed response into a
//! `BackoffDecision`. On a limit hit the throttled credential's counter is
//! deferred for the computed wait, so the next `acquire` either rotates to
//! another credential or waits exactly as long as the server asked.
//!
//! Independently of outright rejections, the remaining-quota ratio drives an
//! adaptive refill rate: below `low_water_ratio` the rate is scaled down, above
//! `recovery_ratio` it ramps back towards the configured base. Adjustments for
//! one credential are spaced by `adjustment_cooldown`.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use transport::ApiResponse;

use crate::config::SchedulerConfig;
use crate::counter::QuotaCounter;
use crate::quota::{MAX_WAIT_HINT, QuotaHeaders, ResponseClass, ThrottleSignal, classify};

/// Resource class used when neither the caller nor the server names one.
pub const DEFAULT_RESOURCE_CLASS: &str = "default";

/// Distinct resource classes tracked per credential before new ones fold into
/// `DEFAULT_RESOURCE_CLASS`.
pub const MAX_RESOURCE_CLASSES: usize = 16;

/// What the caller should do after a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffDecision {
    /// Not throttled; hand the response to the caller.
    Proceed,
    /// Throttled; try again once `wait` has passed.
    Retry {
        wait: Duration,
        signal: ThrottleSignal,
    },
    /// Throttled with no retries left.
    GiveUp {
        attempts: u32,
        status: u16,
        signal: ThrottleSignal,
    },
}

/// Reactive retries left for one logical request.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    limit: u32,
    used: u32,
}

impl RetryBudget {
    pub fn new(limit: u32) -> Self {
        Self { limit, used: 0 }
    }

    /// Retries consumed so far.
    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn remaining(&self) -> u32 {
        self.limit - self.used
    }

    fn try_consume(&mut self) -> bool {
        if self.used < self.limit {
            self.used += 1;
            true
        } else {
            false
        }
    }
}

/// Last quota state the server reported for a (credential, resource class).
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedQuota {
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub reset_after: Option<Duration>,
    pub observed_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Down,
    Up,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Direction::Down => "down",
            Direction::Up => "up",
        }
    }
}

/// Interprets responses and feeds the result back into quota counters.
#[derive(Debug)]
pub struct ReactiveBackoffPolicy {
    retry_budget: u32,
    min_retry_after: Duration,
    low_water_ratio: f64,
    recovery_ratio: f64,
    recovery_multiplier: f64,
    adjustment_cooldown: Duration,
    /// credential id -> resource class -> last observation
    observed: Mutex<HashMap<String, HashMap<String, ObservedQuota>>>,
    last_adjusted: Mutex<HashMap<String, Instant>>,
}

impl ReactiveBackoffPolicy {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            retry_budget: config.retry_budget,
            min_retry_after: config.min_retry_after(),
            low_water_ratio: config.low_water_ratio,
            recovery_ratio: config.recovery_ratio,
            recovery_multiplier: config.recovery_multiplier,
            adjustment_cooldown: config.adjustment_cooldown(),
            observed: Mutex::new(HashMap::new()),
            last_adjusted: Mutex::new(HashMap::new()),
        }
    }

    /// Fresh retry budget for one `run`.
    pub fn budget(&self) -> RetryBudget {
        RetryBudget::new(self.retry_budget)
    }

    /// Inspect one response from `credential_id` and decide what happens next.
    ///
    /// `resource_class` overrides the class reported by the server, if any.
    pub fn observe<R: ApiResponse + ?Sized>(
        &self,
        response: &R,
        credential_id: &str,
        counter: &QuotaCounter,
        resource_class: Option<&str>,
        budget: &mut RetryBudget,
    ) -> BackoffDecision {
        let status = response.status();
        let quota = QuotaHeaders::parse(response.headers());
        let signal = ThrottleSignal::detect(status, &quota);
        let outcome = classify(status, signal);
        let now = Instant::now();

        let class = resource_class
            .or(quota.resource.as_deref())
            .unwrap_or(DEFAULT_RESOURCE_CLASS);
        self.record(credential_id, class, &quota, now);

        if let Some(ratio) = quota.remaining_ratio() {
            self.adapt(credential_id, counter, ratio, now);
        }

        if !outcome.is_limit() {
            if outcome == ResponseClass::NonLimitError {
                debug!(credential_id, status, "error without throttling evidence, surfacing");
            }
            let pending_reset = quota
                .reset_after
                .filter(|reset| quota.is_exhausted() && !reset.is_zero());
            if let Some(reset_after) = pending_reset {
                debug!(
                    credential_id,
                    wait_ms = reset_after.as_millis() as u64,
                    "quota reported exhausted, deferring credential until reset"
                );
                counter.defer_until(deadline(now, reset_after));
            }
            return BackoffDecision::Proceed;
        }

        let wait = self.wait_for(signal);
        counter.defer_until(deadline(now, wait));
        metrics::counter!("access_pool_throttled_total", "signal" => signal.label()).increment(1);

        if budget.try_consume() {
            warn!(
                credential_id,
                status,
                signal = signal.label(),
                wait_ms = wait.as_millis() as u64,
                attempt = budget.used(),
                "rate limited by upstream, retrying after backoff"
            );
            BackoffDecision::Retry { wait, signal }
        } else {
            warn!(
                credential_id,
                status,
                signal = signal.label(),
                attempts = budget.used(),
                "rate limited by upstream, retry budget exhausted"
            );
            BackoffDecision::GiveUp {
                attempts: budget.used(),
                status,
                signal,
            }
        }
    }

    /// Wait implied by a throttle signal.
    ///
    /// `Retry-After` is floored at `min_retry_after`; a primary limit waits
    /// until the reported reset, or `min_retry_after` when none is known.
    pub fn wait_for(&self, signal: ThrottleSignal) -> Duration {
        match signal {
            ThrottleSignal::None => Duration::ZERO,
            ThrottleSignal::Secondary { retry_after } => retry_after.max(self.min_retry_after),
            ThrottleSignal::Primary {
                reset_after: Some(reset_after),
            } if !reset_after.is_zero() => reset_after,
            ThrottleSignal::Primary { .. } => self.min_retry_after,
        }
    }

    /// Last observed quota for a credential and resource class.
    pub fn observed(&self, credential_id: &str, resource_class: &str) -> Option<ObservedQuota> {
        self.observed
            .lock()
            .get(credential_id)
            .and_then(|classes| classes.get(resource_class))
            .cloned()
    }

    fn record(&self, credential_id: &str, class: &str, quota: &QuotaHeaders, now: Instant) {
        if quota.limit.is_none() && quota.remaining.is_none() && quota.reset_after.is_none() {
            return;
        }
        let mut observed = self.observed.lock();
        let classes = observed.entry(credential_id.to_string()).or_default();
        let key = if classes.contains_key(class) || classes.len() < MAX_RESOURCE_CLASSES {
            class
        } else {
            debug!(
                credential_id,
                resource_class = class,
                "resource class limit reached, recording as default"
            );
            DEFAULT_RESOURCE_CLASS
        };
        classes.insert(
            key.to_string(),
            ObservedQuota {
                limit: quota.limit,
                remaining: quota.remaining,
                reset_after: quota.reset_after,
                observed_at: now,
            },
        );
    }

    fn adapt(&self, credential_id: &str, counter: &QuotaCounter, ratio: f64, now: Instant) {
        let direction = if ratio < self.low_water_ratio {
            Direction::Down
        } else if ratio > self.recovery_ratio {
            Direction::Up
        } else {
            return;
        };

        let mut last_adjusted = self.last_adjusted.lock();
        let cooling = last_adjusted
            .get(credential_id)
            .is_some_and(|at| now.saturating_duration_since(*at) < self.adjustment_cooldown);
        if cooling {
            return;
        }

        let current = counter.refill_rate();
        let target = match direction {
            Direction::Down => current * (ratio / self.low_water_ratio),
            Direction::Up => current * self.recovery_multiplier,
        };
        let applied = counter.adjust_refill_rate(target);
        if (applied - current).abs() <= f64::EPSILON * current.max(1.0) {
            return;
        }

        last_adjusted.insert(credential_id.to_string(), now);
        metrics::counter!("access_pool_rate_adjustments_total", "direction" => direction.label())
            .increment(1);
        info!(
            credential_id,
            direction = direction.label(),
            remaining_ratio = ratio,
            from = current,
            to = applied,
            "adjusted refill rate"
        );
    }
}

/// `now + wait`, saturating at `MAX_WAIT_HINT` when the sum is unrepresentable.
fn deadline(now: Instant, wait: Duration) -> Instant {
    now.checked_add(wait)
        .or_else(|| now.checked_add(MAX_WAIT_HINT))
        .unwrap_or(now)
}
