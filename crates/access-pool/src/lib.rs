//! Rate-limited access scheduling for credentialed API clients
//!
//! Spreads outbound requests across several credentials, each subject to an
//! upstream rate limit, and blocks callers only as long as necessary when all
//! of them are exhausted. The server's own quota headers feed back into local
//! admission control.
//!
//! Request lifecycle:
//! 1. `AccessCoordinator::run` asks the `RotationScheduler` for a `Lease`
//! 2. The scheduler serves the active credential if its `QuotaCounter` admits,
//!    otherwise rotates through the pool, waiting for the earliest refill
//! 3. The unit of work runs against the leased credential's transport
//! 4. `ReactiveBackoffPolicy` reads the response: throttling defers the
//!    credential and triggers a retry, low remaining quota slows its refill
//! 5. The lease is dropped, returning the credential to the scheduler

pub mod backoff;
pub mod config;
pub mod coordinator;
pub mod counter;
pub mod error;
pub mod pagination;
pub mod pool;
pub mod quota;
pub mod report;

pub use backoff::{BackoffDecision, ReactiveBackoffPolicy, RetryBudget};
pub use config::{QuotaConfig, SchedulerConfig};
pub use coordinator::AccessCoordinator;
pub use counter::{QuotaCounter, QuotaSnapshot};
pub use error::{Error, Result, RunError};
pub use pagination::paginate;
pub use pool::{Credential, CredentialStatus, Lease, RotationScheduler, SchedulerStatus};
pub use quota::{MAX_WAIT_HINT, QuotaHeaders, ResponseClass, ThrottleSignal, classify};
pub use report::spawn_status_reporter;
