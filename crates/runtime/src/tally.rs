//! Running-worker count. Workers never touch the number directly: they send
//! ordered start/finish signals and exactly one owner, the
//! [`WorkerTally`], folds them into the count.

use std::future::Future;

use metrics::gauge;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSignal {
    Started,
    Finished,
}

/// Sending half, cloned into every worker.
#[derive(Debug, Clone)]
pub struct SignalSender {
    tx: mpsc::UnboundedSender<WorkerSignal>,
}

impl SignalSender {
    /// Signal +1 now and −1 when the returned guard drops, whichever way
    /// processing ends.
    pub fn started(&self) -> RunningGuard {
        let _ = self.tx.send(WorkerSignal::Started);
        RunningGuard { tx: self.tx.clone() }
    }
}

#[must_use = "dropping the guard immediately signals the worker as finished"]
pub struct RunningGuard {
    tx: mpsc::UnboundedSender<WorkerSignal>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(WorkerSignal::Finished);
    }
}

/// Owner of the running-worker count.
pub struct WorkerTally {
    rx: mpsc::UnboundedReceiver<WorkerSignal>,
    running: usize,
}

pub fn channel() -> (SignalSender, WorkerTally) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SignalSender { tx }, WorkerTally { rx, running: 0 })
}

impl WorkerTally {
    pub fn running(&self) -> usize { self.running }

    fn apply(&mut self, signal: WorkerSignal) {
        match signal {
            WorkerSignal::Started => self.running += 1,
            WorkerSignal::Finished => self.running = self.running.saturating_sub(1),
        }
        gauge!("workers_running", self.running as f64);
        debug!(running = self.running, "current number of running workers");
    }

    /// Fold in every signal sent so far without waiting.
    pub fn drain_pending(&mut self) {
        while let Ok(signal) = self.rx.try_recv() {
            self.apply(signal);
        }
    }

    /// Fold in signals as they arrive until `until` completes.
    pub async fn track_until(&mut self, until: impl Future<Output = ()>) {
        tokio::pin!(until);
        loop {
            tokio::select! {
                _ = &mut until => return,
                signal = self.rx.recv() => match signal {
                    Some(signal) => self.apply(signal),
                    None => {
                        // Every sender is gone; nothing left to count.
                        until.await;
                        return;
                    }
                },
            }
        }
    }
}
