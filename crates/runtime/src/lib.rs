//! Steward runtime – event-driven reconciliation engine
//!
//! Watch notifications are translated into keys ([`translator`]), keys are
//! queued per kind ([`steward_queue::WorkQueue`]), worker pools drain the
//! queues into per-kind [`Reconciler`]s ([`worker`]), and the
//! [`ShutdownCoordinator`] stops the whole thing without abandoning work.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use steward_core::{Key, Outcome};

pub mod config;
pub mod controller;
pub mod shutdown;
pub mod tally;
pub mod translator;
pub mod worker;

pub use config::{RuntimeConfig, WorkerCounts, DEFAULT_TERMINAL_RESYNC_SECS};
pub use controller::{Controller, RuntimeError};
pub use shutdown::ShutdownCoordinator;
pub use tally::{RunningGuard, SignalSender, WorkerSignal, WorkerTally};
pub use translator::{CrossTrigger, EnqueueOwnKey};
pub use worker::{RetryPolicy, WorkerPool};

/// Queue type shared by every kind.
pub type KeyQueue = steward_queue::WorkQueue<Key>;

/// Per-kind reconcile logic.
///
/// Implementations are stateless across calls: every invocation re-reads the
/// object behind `key` and drives it one step toward its desired state. The
/// runtime never runs two invocations for the same key concurrently.
#[async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, key: &Key) -> Outcome;
}
