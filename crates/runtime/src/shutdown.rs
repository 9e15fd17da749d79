//! Graceful stop: refuse new work, let workers finish what is queued and in
//! flight, and only then report completion.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::tally::WorkerTally;
use crate::KeyQueue;

pub struct ShutdownCoordinator {
    queues: Vec<KeyQueue>,
    tally: WorkerTally,
    poll: Duration,
}

impl ShutdownCoordinator {
    pub fn new(queues: Vec<KeyQueue>, tally: WorkerTally, poll: Duration) -> Self { Self { queues, tally, poll } }

    /// Sum of ready items across all queues, read fresh on every call.
    fn pending(&self) -> usize { self.queues.iter().map(KeyQueue::len).sum() }

    /// Track worker signals until `cancel` fires, then drain.
    pub async fn run(mut self, cancel: &CancellationToken) {
        self.tally.track_until(cancel.cancelled()).await;
        info!(queues = self.queues.len(), "shutdown requested; draining");
        self.drain().await;
    }

    /// Shut down every queue and wait until no item is pending and no worker
    /// is running.
    pub async fn drain(&mut self) {
        for queue in &self.queues {
            queue.shut_down();
        }
        loop {
            self.tally.drain_pending();
            let pending = self.pending();
            let running = self.tally.running();
            if pending == 0 && running == 0 {
                debug!("no running worker and no item left in the queues");
                return;
            }
            debug!(pending, running, "waiting for workers to finish");
            tokio::time::sleep(self.poll).await;
        }
    }
}
