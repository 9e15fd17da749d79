//! Controller lifecycle: wait for caches, run worker pools, drain on
//! cancellation.

use std::sync::Arc;

use steward_kubehub::Synced;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{RuntimeConfig, WorkerCounts};
use crate::shutdown::ShutdownCoordinator;
use crate::tally;
use crate::worker::{RetryPolicy, WorkerPool};
use crate::{KeyQueue, Reconciler};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("cancelled before caches synced")]
    CacheSyncAborted,
}

pub struct Controller {
    name: String,
    config: RuntimeConfig,
    pools: Vec<WorkerPool>,
    sources: Vec<Arc<dyn Synced>>,
}

impl Controller {
    pub fn new(name: impl Into<String>, config: RuntimeConfig) -> Self {
        Self { name: name.into(), config, pools: Vec::new(), sources: Vec::new() }
    }

    /// Require `source` to be synced before workers start.
    pub fn watches(mut self, source: Arc<dyn Synced>) -> Self {
        self.sources.push(source);
        self
    }

    /// Drain `queue` into `reconciler`; worker count is looked up by `kind`.
    pub fn register(mut self, kind: &str, queue: KeyQueue, reconciler: Arc<dyn Reconciler>) -> Self {
        let policy = RetryPolicy::from(&self.config);
        self.pools.push(WorkerPool::new(kind, queue, reconciler, policy));
        self
    }

    async fn wait_for_cache_sync(&self, cancel: &CancellationToken) -> bool {
        loop {
            if self.sources.iter().all(|s| s.has_synced()) {
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.config.sync_poll()) => {}
            }
        }
    }

    /// Run until `cancel` fires and every queued and in-flight key has been
    /// processed.
    pub async fn start(self, cancel: CancellationToken, workers: WorkerCounts) -> Result<(), RuntimeError> {
        info!(controller = %self.name, sources = self.sources.len(), "waiting for caches to sync");
        if !self.wait_for_cache_sync(&cancel).await {
            error!(controller = %self.name, "cancelled before caches synced");
            return Err(RuntimeError::CacheSyncAborted);
        }

        let (signals, tally) = tally::channel();
        let mut set = JoinSet::new();
        let mut drained = Vec::with_capacity(self.pools.len());
        for pool in &self.pools {
            let count = workers.get(pool.kind());
            if count == 0 {
                // Nothing would ever drain this queue; keep it out of the
                // shutdown accounting.
                warn!(controller = %self.name, kind = pool.kind(), "no workers configured; queue is not processed");
                pool.queue().shut_down();
                continue;
            }
            pool.spawn(count, &signals, &mut set);
            drained.push(pool.queue().clone());
        }
        drop(signals);
        info!(controller = %self.name, workers = set.len(), "controller initialized");

        ShutdownCoordinator::new(drained, tally, self.config.drain_poll()).run(&cancel).await;

        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                error!(controller = %self.name, error = %e, "worker task failed");
            }
        }
        info!(controller = %self.name, "controller stopped");
        Ok(())
    }
}
