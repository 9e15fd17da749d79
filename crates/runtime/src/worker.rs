//! Worker pool: N tasks per queue, each pulling keys and turning reconcile
//! outcomes into queue decisions.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use metrics::{counter, histogram};
use steward_core::{Key, Outcome};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::RuntimeConfig;
use crate::tally::SignalSender;
use crate::{KeyQueue, Reconciler};

/// What to do with keys that keep failing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Re-evaluate terminally failed keys after this delay.
    pub terminal_resync: Option<Duration>,
    /// Give up on a key after this many consecutive retryable failures.
    pub max_retries: Option<u32>,
}

impl From<&RuntimeConfig> for RetryPolicy {
    fn from(cfg: &RuntimeConfig) -> Self { Self { terminal_resync: cfg.terminal_resync(), max_retries: cfg.max_retries } }
}

/// One kind's queue bound to its reconciler.
#[derive(Clone)]
pub struct WorkerPool {
    kind: String,
    queue: KeyQueue,
    reconciler: Arc<dyn Reconciler>,
    policy: RetryPolicy,
}

impl WorkerPool {
    pub fn new(kind: impl Into<String>, queue: KeyQueue, reconciler: Arc<dyn Reconciler>, policy: RetryPolicy) -> Self {
        Self { kind: kind.into(), queue, reconciler, policy }
    }

    pub fn kind(&self) -> &str { &self.kind }

    pub fn queue(&self) -> &KeyQueue { &self.queue }

    /// Spawn `count` workers into `set`.
    pub fn spawn(&self, count: usize, signals: &SignalSender, set: &mut JoinSet<()>) {
        for id in 0..count {
            let pool = self.clone();
            let signals = signals.clone();
            set.spawn(async move { pool.run_worker(id, signals).await });
        }
        info!(kind = %self.kind, workers = count, "workers started");
    }

    async fn run_worker(self, id: usize, signals: SignalSender) {
        while self.process_next(&signals).await {}
        debug!(kind = %self.kind, worker = id, "worker stopped");
    }

    /// Handle one key. Returns false once the queue is shut down and empty.
    async fn process_next(&self, signals: &SignalSender) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        let _running = signals.started();
        let started = Instant::now();
        let outcome = match AssertUnwindSafe(self.reconciler.reconcile(&key)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                error!(kind = %self.kind, key = %key, panic = %msg, "reconciler panicked");
                Outcome::Retryable(format!("reconciler panicked: {}", msg))
            }
        };
        histogram!("reconcile_ms", started.elapsed().as_secs_f64() * 1000.0, "kind" => self.kind.clone());
        counter!("reconcile_total", 1u64, "kind" => self.kind.clone(), "outcome" => outcome.label());
        self.queue.done(&key);
        self.apply(key, outcome);
        true
    }

    fn apply(&self, key: Key, outcome: Outcome) {
        match outcome {
            Outcome::Success => {
                debug!(kind = %self.kind, key = %key, "reconciled");
                self.queue.forget(&key);
            }
            Outcome::RequeueAfter(delay) => {
                self.queue.forget(&key);
                if self.discard_on_shutdown(&key, "requeue") {
                    return;
                }
                debug!(kind = %self.kind, key = %key, delay_ms = delay.as_millis() as u64, "requeue after");
                self.queue.add_after(key, delay);
            }
            Outcome::Retryable(detail) => {
                let attempts = self.queue.num_requeues(&key);
                if self.policy.max_retries.is_some_and(|max| attempts >= max) {
                    error!(kind = %self.kind, key = %key, attempts, error = %detail, "dropping key after too many retries");
                    self.queue.forget(&key);
                    return;
                }
                if self.discard_on_shutdown(&key, "retry") {
                    debug!(kind = %self.kind, key = %key, error = %detail, "discarded failure");
                    self.queue.forget(&key);
                    return;
                }
                warn!(kind = %self.kind, key = %key, attempts, error = %detail, "reconcile failed; retrying with backoff");
                self.queue.add_rate_limited(key);
            }
            Outcome::Terminal(detail) => {
                error!(kind = %self.kind, key = %key, error = %detail, "reconcile failed permanently");
                // Reset backoff so a later edit or resync starts from the base delay.
                self.queue.forget(&key);
                if let Some(resync) = self.policy.terminal_resync {
                    if !self.discard_on_shutdown(&key, "resync") {
                        self.queue.add_after(key, resync);
                    }
                }
            }
        }
    }

    /// The queue rejects new work once draining; report what is lost.
    fn discard_on_shutdown(&self, key: &Key, what: &'static str) -> bool {
        if !self.queue.is_shutting_down() {
            return false;
        }
        warn!(kind = %self.kind, key = %key, what, "queue is shutting down; discarding");
        counter!("reconcile_discarded_total", 1u64, "kind" => self.kind.clone(), "what" => what);
        true
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
