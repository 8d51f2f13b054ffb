//! Rotation scheduler over a pool of credentialed clients
//!
//! Every credential lives in exactly one place: the `pool`, the `active` slot,
//! or a `Lease` held by one caller (a leased credential counts as active). The
//! `active` slot serves back-to-back acquires without touching the pool; when
//! it stops admitting, the whole pool is drained under the pool mutex, scanned
//! in `(priority, next_available, id)` order, and put back with passed-over
//! entries pushed behind the rest.
//!
//! When nothing admits, the caller returns the drained set, drops the pool
//! mutex, and sleeps until the earliest credential can admit or until a lease
//! is returned. Waits are bounded by `max_wait` and by a rescan ceiling.
//!
//! Lock order: `pool` before `active`. Releasing a lease never holds `active`
//! while taking `pool`.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{QuotaConfig, SchedulerConfig};
use crate::counter::QuotaCounter;
use crate::error::{Error, Result};

/// One credential as supplied at construction.
#[derive(Debug, Clone)]
pub struct Credential<T> {
    pub id: String,
    pub transport: T,
    pub quota: QuotaConfig,
}

impl<T> Credential<T> {
    pub fn new(id: impl Into<String>, transport: T, quota: QuotaConfig) -> Self {
        Self {
            id: id.into(),
            transport,
            quota,
        }
    }
}

#[derive(Debug)]
struct Entry<T> {
    id: String,
    transport: T,
    counter: QuotaCounter,
}

/// Pool position of an entry. `priority` is a fairness timestamp, unrelated to
/// the counter's next available time.
struct Slot<T> {
    entry: Arc<Entry<T>>,
    priority: Instant,
}

/// Drained pool contents. Whatever is left in `slots` goes back to the pool on
/// drop, so an early return or unwind cannot lose a credential.
struct Drained<'a, T> {
    pool: MutexGuard<'a, Vec<Slot<T>>>,
    slots: Vec<Slot<T>>,
}

impl<T> Drop for Drained<'_, T> {
    fn drop(&mut self) {
        self.pool.append(&mut self.slots);
    }
}

enum Rotation<'a, T> {
    Selected(Lease<'a, T>),
    /// Nothing admitted. Carries the earliest admission time and its credential.
    Wait(Option<(Instant, String)>),
}

/// Exclusive hand-off of one credential to one caller.
///
/// Dropping the lease returns the credential to the scheduler.
pub struct Lease<'a, T> {
    scheduler: &'a RotationScheduler<T>,
    entry: Arc<Entry<T>>,
}

impl<T> Lease<'_, T> {
    pub fn id(&self) -> &str {
        &self.entry.id
    }

    pub fn transport(&self) -> &T {
        &self.entry.transport
    }

    pub fn counter(&self) -> &QuotaCounter {
        &self.entry.counter
    }
}

impl<T> Drop for Lease<'_, T> {
    fn drop(&mut self) {
        self.scheduler.release(Arc::clone(&self.entry));
    }
}

impl<T> fmt::Debug for Lease<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").field("id", &self.entry.id).finish()
    }
}

/// Per-credential view for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialStatus {
    pub id: String,
    pub available: f64,
    pub capacity: u32,
    pub refill_rate: f64,
    pub base_rate: f64,
    #[serde(skip)]
    pub next_available: Option<Instant>,
    /// Seconds until one unit is admittable; absent when it never will be.
    pub next_available_in_secs: Option<f64>,
    pub deferred: bool,
}

/// Scheduler health summary.
///
/// `healthy` when every credential admits now, `degraded` when some do,
/// `unhealthy` when none do.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub status: &'static str,
    pub credentials_total: usize,
    pub credentials_available: usize,
    pub credentials: Vec<CredentialStatus>,
}

impl SchedulerStatus {
    pub fn is_unhealthy(&self) -> bool {
        self.status == "unhealthy"
    }
}

/// Picks a credential for each request, waiting only when none has capacity.
pub struct RotationScheduler<T> {
    entries: Vec<Arc<Entry<T>>>,
    pool: Mutex<Vec<Slot<T>>>,
    active: Mutex<Option<Slot<T>>>,
    returned: Notify,
    max_wait: Duration,
    max_rescans: u32,
    sticky_active: bool,
}

impl<T> fmt::Debug for RotationScheduler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RotationScheduler")
            .field("credentials", &self.ids().collect::<Vec<_>>())
            .field("max_wait", &self.max_wait)
            .field("sticky_active", &self.sticky_active)
            .finish()
    }
}

impl<T> RotationScheduler<T> {
    /// Build a scheduler from an ordered credential list.
    ///
    /// Fails on an empty list, duplicate ids, invalid quotas or config.
    pub fn new(credentials: Vec<Credential<T>>, config: &SchedulerConfig) -> Result<Self> {
        config.validate()?;
        if credentials.is_empty() {
            return Err(Error::NoCredentials);
        }

        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(credentials.len());
        for credential in credentials {
            credential.quota.validate(&credential.id)?;
            if !seen.insert(credential.id.clone()) {
                return Err(Error::DuplicateCredential(credential.id));
            }
            entries.push(Arc::new(Entry {
                counter: QuotaCounter::from_config(&credential.quota, config.min_refill_factor),
                id: credential.id,
                transport: credential.transport,
            }));
        }

        let now = Instant::now();
        let pool = entries
            .iter()
            .map(|entry| Slot {
                entry: Arc::clone(entry),
                priority: now,
            })
            .collect();

        info!(
            credentials = entries.len(),
            sticky_active = config.sticky_active,
            "rotation scheduler initialized"
        );
        Ok(Self {
            entries,
            pool: Mutex::new(pool),
            active: Mutex::new(None),
            returned: Notify::new(),
            max_wait: config.max_wait(),
            max_rescans: config.max_rescans,
            sticky_active: config.sticky_active,
        })
    }

    /// Credential ids in construction order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.id.as_str())
    }

    /// Counter for one credential.
    pub fn counter(&self, id: &str) -> Option<&QuotaCounter> {
        self.entries
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| &entry.counter)
    }

    /// Lease a credential with capacity for `units`, waiting if none has any.
    ///
    /// Fails with `QuotaExhausted` when no credential will admit within
    /// `max_wait`, without sleeping past it. Cancel-safe: dropping the future
    /// leaves every credential in the scheduler.
    pub async fn acquire(&self, units: u32) -> Result<Lease<'_, T>> {
        let started = Instant::now();
        let deadline = started + self.max_wait;

        if self
            .entries
            .iter()
            .all(|entry| units > entry.counter.capacity())
        {
            return Err(self.exhausted(units, None));
        }

        if self.sticky_active {
            if let Some(lease) = self.try_active(units) {
                metrics::counter!("access_pool_acquire_total", "path" => "fast").increment(1);
                return Ok(lease);
            }
        }

        let mut rescans = 0u32;
        loop {
            let notified = self.returned.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let earliest = match self.rotate(units) {
                Rotation::Selected(lease) => {
                    metrics::counter!("access_pool_acquire_total", "path" => "rotate")
                        .increment(1);
                    metrics::histogram!("access_pool_wait_seconds")
                        .record(started.elapsed().as_secs_f64());
                    return Ok(lease);
                }
                Rotation::Wait(earliest) => earliest,
            };

            let now = Instant::now();
            match earliest {
                Some((ready, _)) if ready > deadline => {
                    return Err(self.exhausted(units, Some(ready.saturating_duration_since(now))));
                }
                Some((ready, credential_id)) => {
                    info!(
                        credential_id = %credential_id,
                        units,
                        wait_ms = ready.saturating_duration_since(now).as_millis() as u64,
                        "no credential admits, waiting for capacity"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep_until(ready) => {
                            rescans += 1;
                            if rescans > self.max_rescans {
                                warn!(units, rescans, "rescan ceiling reached");
                                return Err(self.exhausted(units, None));
                            }
                        }
                        _ = &mut notified => {}
                    }
                }
                None => {
                    debug!(units, "every usable credential is leased, waiting for a return");
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {
                            return Err(self.exhausted(units, None));
                        }
                        _ = &mut notified => {}
                    }
                }
            }
        }
    }

    fn try_active(&self, units: u32) -> Option<Lease<'_, T>> {
        let mut active = self.active.lock();
        let admitted = active
            .as_ref()
            .is_some_and(|slot| slot.entry.counter.try_admit(units));
        if !admitted {
            return None;
        }
        active.take().map(|slot| self.lease(slot.entry))
    }

    /// Drain, scan and refill the pool in one critical section.
    fn rotate(&self, units: u32) -> Rotation<'_, T> {
        let mut pool = self.pool.lock();
        let slots = std::mem::take(&mut *pool);
        let mut drained = Drained { pool, slots };
        let now = Instant::now();

        // The active credential already had its turn.
        let demoted = self.active.lock().take();
        if let Some(mut slot) = demoted {
            slot.priority = now;
            drained.slots.push(slot);
        }

        drained.slots.sort_by_cached_key(|slot| {
            let ready = slot.entry.counter.next_available_time(units);
            (slot.priority, ready.is_none(), ready, slot.entry.id.clone())
        });

        let winner = drained
            .slots
            .iter()
            .position(|slot| slot.entry.counter.try_admit(units));

        match winner {
            Some(index) => {
                for slot in &mut drained.slots[..index] {
                    slot.priority = now;
                }
                let selected = drained.slots.remove(index);
                debug!(
                    credential_id = %selected.entry.id,
                    units,
                    passed_over = index,
                    "rotated to credential"
                );
                Rotation::Selected(self.lease(selected.entry))
            }
            None => {
                let mut earliest: Option<(Instant, String)> = None;
                for slot in &mut drained.slots {
                    slot.priority = now;
                    let Some(ready) = slot.entry.counter.next_available_time(units) else {
                        continue;
                    };
                    if earliest.as_ref().is_none_or(|(best, _)| ready < *best) {
                        earliest = Some((ready, slot.entry.id.clone()));
                    }
                }
                Rotation::Wait(earliest)
            }
        }
    }

    fn lease(&self, entry: Arc<Entry<T>>) -> Lease<'_, T> {
        Lease {
            scheduler: self,
            entry,
        }
    }

    fn release(&self, entry: Arc<Entry<T>>) {
        let slot = Slot {
            entry,
            priority: Instant::now(),
        };
        let leftover = if self.sticky_active {
            let mut active = self.active.lock();
            if active.is_none() {
                *active = Some(slot);
                None
            } else {
                Some(slot)
            }
        } else {
            Some(slot)
        };
        if let Some(slot) = leftover {
            self.pool.lock().push(slot);
        }
        self.returned.notify_waiters();
    }

    fn exhausted(&self, units: u32, earliest: Option<Duration>) -> Error {
        metrics::counter!("access_pool_exhausted_total").increment(1);
        warn!(
            units,
            max_wait_ms = self.max_wait.as_millis() as u64,
            earliest_ms = earliest.map(|e| e.as_millis() as u64),
            "quota exhausted across all credentials"
        );
        Error::QuotaExhausted {
            units,
            max_wait: self.max_wait,
            earliest,
        }
    }

    /// Per-credential quota state plus an overall health label.
    pub fn status(&self) -> SchedulerStatus {
        let credentials: Vec<CredentialStatus> = self
            .entries
            .iter()
            .map(|entry| {
                let snapshot = entry.counter.snapshot();
                let next_available = entry.counter.next_available_time(1);
                // Read after the counter so an admitting credential reports zero
                let now = Instant::now();
                CredentialStatus {
                    id: entry.id.clone(),
                    available: snapshot.available,
                    capacity: snapshot.capacity,
                    refill_rate: snapshot.refill_rate,
                    base_rate: snapshot.base_rate,
                    next_available,
                    next_available_in_secs: next_available
                        .map(|at| at.saturating_duration_since(now).as_secs_f64()),
                    deferred: snapshot.deferred_until.is_some(),
                }
            })
            .collect();

        let total = credentials.len();
        let available = credentials
            .iter()
            .filter(|c| c.next_available_in_secs == Some(0.0))
            .count();
        let status = if available == total && total > 0 {
            "healthy"
        } else if available > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        SchedulerStatus {
            status,
            credentials_total: total,
            credentials_available: available,
            credentials,
        }
    }

    /// Credentials currently in the pool or the active slot.
    #[cfg(test)]
    fn census(&self) -> usize {
        self.pool.lock().len() + usize::from(self.active.lock().is_some())
    }
}
