//! Access coordinator: scheduler plus reactive backoff behind one call

use std::future::Future;

use tracing::{debug, info};
use transport::ApiResponse;

use crate::backoff::{BackoffDecision, ReactiveBackoffPolicy};
use crate::config::SchedulerConfig;
use crate::error::{Result, RunError};
use crate::pool::{Credential, RotationScheduler, SchedulerStatus};

/// Runs units of work against rotated credentials, backing off when the
/// server throttles.
///
/// Share it behind an `Arc`; all methods take `&self`.
#[derive(Debug)]
pub struct AccessCoordinator<T> {
    scheduler: RotationScheduler<T>,
    policy: ReactiveBackoffPolicy,
}

impl<T> AccessCoordinator<T> {
    pub fn new(credentials: Vec<Credential<T>>, config: &SchedulerConfig) -> Result<Self> {
        Ok(Self {
            scheduler: RotationScheduler::new(credentials, config)?,
            policy: ReactiveBackoffPolicy::new(config),
        })
    }

    pub fn scheduler(&self) -> &RotationScheduler<T> {
        &self.scheduler
    }

    pub fn policy(&self) -> &ReactiveBackoffPolicy {
        &self.policy
    }

    pub fn status(&self) -> SchedulerStatus {
        self.scheduler.status()
    }
}

impl<T: Clone> AccessCoordinator<T> {
    /// Run one logical request costing a single unit.
    pub async fn run<F, Fut, R, E>(&self, work: F) -> std::result::Result<R, RunError<E>>
    where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = std::result::Result<R, E>>,
        R: ApiResponse,
    {
        self.run_with(1, None, work).await
    }

    /// Run one logical request costing `units`, attributed to `resource_class`.
    ///
    /// `work` receives a clone of the leased credential's transport and may be
    /// called again on throttling, possibly with a different credential. Errors
    /// from `work` end the run immediately as `RunError::Transport`.
    pub async fn run_with<F, Fut, R, E>(
        &self,
        units: u32,
        resource_class: Option<&str>,
        mut work: F,
    ) -> std::result::Result<R, RunError<E>>
    where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = std::result::Result<R, E>>,
        R: ApiResponse,
    {
        let mut budget = self.policy.budget();
        loop {
            let lease = self.scheduler.acquire(units).await?;
            debug!(credential_id = lease.id(), units, "running unit of work");

            let response = work(lease.transport().clone())
                .await
                .map_err(RunError::Transport)?;

            match self.policy.observe(
                &response,
                lease.id(),
                lease.counter(),
                resource_class,
                &mut budget,
            ) {
                BackoffDecision::Proceed => return Ok(response),
                BackoffDecision::Retry { wait, signal } => {
                    info!(
                        credential_id = lease.id(),
                        signal = signal.label(),
                        wait_ms = wait.as_millis() as u64,
                        retries_left = budget.remaining(),
                        "re-acquiring after throttle"
                    );
                }
                BackoffDecision::GiveUp {
                    attempts,
                    status,
                    signal,
                } => {
                    return Err(RunError::LimitBackoffExceeded {
                        attempts,
                        credential_id: lease.id().to_string(),
                        status,
                        signal,
                    });
                }
            }
        }
    }
}
