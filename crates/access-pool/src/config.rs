//! Scheduler and per-credential quota configuration
//!
//! Both types deserialize from the `[scheduler]` and `[credentials.quota]`
//! TOML sections of the proxy config. Durations are expressed in seconds
//! (`*_secs`) on the wire and exposed as `Duration` through accessors.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Local admission-control settings for one credential.
///
/// `TokenBucket` refills continuously at `refill_rate_per_second`; `RollingWindow`
/// admits at most `capacity` units within any trailing `window_seconds`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QuotaConfig {
    TokenBucket {
        capacity: u32,
        refill_rate_per_second: f64,
    },
    RollingWindow {
        capacity: u32,
        window_seconds: f64,
    },
}

impl QuotaConfig {
    pub fn capacity(&self) -> u32 {
        match self {
            QuotaConfig::TokenBucket { capacity, .. } | QuotaConfig::RollingWindow { capacity, .. } => {
                *capacity
            }
        }
    }

    /// Units restored per second. For a rolling window this is `capacity / window`.
    pub fn refill_rate(&self) -> f64 {
        match self {
            QuotaConfig::TokenBucket {
                refill_rate_per_second,
                ..
            } => *refill_rate_per_second,
            QuotaConfig::RollingWindow {
                capacity,
                window_seconds,
            } => f64::from(*capacity) / window_seconds,
        }
    }

    pub fn validate(&self, id: &str) -> Result<()> {
        let invalid = |reason: String| Error::InvalidQuota {
            id: id.to_string(),
            reason,
        };
        if self.capacity() == 0 {
            return Err(invalid("capacity must be greater than 0".into()));
        }
        match self {
            QuotaConfig::TokenBucket {
                refill_rate_per_second,
                ..
            } if !(refill_rate_per_second.is_finite() && *refill_rate_per_second > 0.0) => Err(
                invalid(format!(
                    "refill_rate_per_second must be positive, got {refill_rate_per_second}"
                )),
            ),
            QuotaConfig::RollingWindow { window_seconds, .. }
                if !(window_seconds.is_finite() && *window_seconds > 0.0) =>
            {
                Err(invalid(format!(
                    "window_seconds must be positive, got {window_seconds}"
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Tuning knobs shared by the rotation scheduler and the backoff policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Longest total suspension a single `acquire` may spend waiting.
    pub max_wait_secs: f64,
    /// Lower clamp for adaptive slowdown, as a fraction of the base rate.
    pub min_refill_factor: f64,
    /// Multiplier applied to a slowed-down rate on recovery.
    pub recovery_multiplier: f64,
    /// Minimum spacing between adaptive adjustments of one credential.
    pub adjustment_cooldown_secs: f64,
    /// Reactive retries allowed per `run`.
    pub retry_budget: u32,
    /// Floor for server-provided `Retry-After` waits.
    pub min_retry_after_secs: f64,
    /// Remaining-quota ratio under which the rate is scaled down.
    pub low_water_ratio: f64,
    /// Remaining-quota ratio above which the rate recovers.
    pub recovery_ratio: f64,
    /// Re-scans allowed after waking from a wait before giving up.
    pub max_rescans: u32,
    /// Keep serving from the last selected credential while it admits.
    pub sticky_active: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_wait_secs: 300.0,
            min_refill_factor: 0.1,
            recovery_multiplier: 1.5,
            adjustment_cooldown_secs: 30.0,
            retry_budget: 3,
            min_retry_after_secs: 60.0,
            low_water_ratio: 0.1,
            recovery_ratio: 0.8,
            max_rescans: 16,
            sticky_active: true,
        }
    }
}

impl SchedulerConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs_f64(self.max_wait_secs)
    }

    pub fn adjustment_cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.adjustment_cooldown_secs)
    }

    pub fn min_retry_after(&self) -> Duration {
        Duration::from_secs_f64(self.min_retry_after_secs)
    }

    /// Reject values that would make waits negative or adaptation diverge.
    pub fn validate(&self) -> Result<()> {
        let non_negative = [
            ("max_wait_secs", self.max_wait_secs),
            ("adjustment_cooldown_secs", self.adjustment_cooldown_secs),
            ("min_retry_after_secs", self.min_retry_after_secs),
        ];
        for (name, value) in non_negative {
            if !(value.is_finite() && value >= 0.0) {
                return Err(Error::InvalidConfig(format!(
                    "{name} must be a non-negative number, got {value}"
                )));
            }
        }
        if !(self.min_refill_factor > 0.0 && self.min_refill_factor <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "min_refill_factor must be in (0, 1], got {}",
                self.min_refill_factor
            )));
        }
        if !(self.recovery_multiplier.is_finite() && self.recovery_multiplier > 1.0) {
            return Err(Error::InvalidConfig(format!(
                "recovery_multiplier must be greater than 1, got {}",
                self.recovery_multiplier
            )));
        }
        if !(0.0 < self.low_water_ratio
            && self.low_water_ratio < self.recovery_ratio
            && self.recovery_ratio <= 1.0)
        {
            return Err(Error::InvalidConfig(format!(
                "expected 0 < low_water_ratio ({}) < recovery_ratio ({}) <= 1",
                self.low_water_ratio, self.recovery_ratio
            )));
        }
        if self.max_rescans == 0 {
            return Err(Error::InvalidConfig("max_rescans must be at least 1".into()));
        }
        Ok(())
    }
}
