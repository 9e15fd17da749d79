//! Steward work queue: deduplicating, rate-limited delivery of keys
//!
//! One queue exists per resource kind. An item is either waiting (delayed),
//! pending (ready for `get`), in flight (handed out, not yet `done`) or
//! absent. A key is pending or in flight at most once at any time, which
//! serializes processing per key while distinct keys run in parallel.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

pub mod ratelimit;

pub use ratelimit::{controller_rate_limiter, default_controller_rate_limiter, Bucket, ItemExponential, MaxOf, RateLimiter};

/// Bounds every queued item satisfies.
pub trait QueueItem: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> QueueItem for T where T: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct State<T> {
    /// Ready items in delivery order.
    queue: VecDeque<T>,
    /// Items that need processing: everything in `queue`, plus in-flight
    /// items that were added again while being processed.
    dirty: FxHashSet<T>,
    processing: FxHashSet<T>,
    shutting_down: bool,
}

struct Inner<T> {
    name: String,
    state: Mutex<State<T>>,
    ready: Notify,
    limiter: Box<dyn RateLimiter<T>>,
    delay_tx: mpsc::UnboundedSender<(T, Instant)>,
}

impl<T: QueueItem> Inner<T> {
    fn add(&self, item: T) {
        let mut st = lock(&self.state);
        if st.shutting_down {
            trace!(queue = %self.name, item = ?item, "add rejected: shutting down");
            return;
        }
        if !st.dirty.insert(item.clone()) {
            return;
        }
        counter!("workqueue_adds_total", 1u64, "queue" => self.name.clone());
        if st.processing.contains(&item) {
            // Redelivered by `done`.
            return;
        }
        st.queue.push_back(item);
        gauge!("workqueue_depth", st.queue.len() as f64, "queue" => self.name.clone());
        drop(st);
        self.ready.notify_one();
    }
}

/// Deduplicating delivery queue with delayed and rate-limited insertion.
///
/// Cloning is cheap and yields a handle to the same queue.
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

impl<T: QueueItem> WorkQueue<T> {
    /// Create a queue and spawn its delay timer task; must be called from
    /// within a tokio runtime.
    pub fn new(name: impl Into<String>, limiter: impl RateLimiter<T> + 'static) -> Self {
        let (delay_tx, delay_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            name: name.into(),
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: FxHashSet::default(),
                processing: FxHashSet::default(),
                shutting_down: false,
            }),
            ready: Notify::new(),
            limiter: Box::new(limiter),
            delay_tx,
        });
        tokio::spawn(delaying_loop(Arc::downgrade(&inner), delay_rx));
        Self { inner }
    }

    pub fn with_default_rate_limiter(name: impl Into<String>) -> Self {
        Self::new(name, default_controller_rate_limiter())
    }

    pub fn name(&self) -> &str { &self.inner.name }

    /// Insert for immediate processing. No-op when the item is already
    /// pending; an in-flight item is delivered once more after `done`.
    pub fn add(&self, item: T) { self.inner.add(item) }

    /// Insert after a fixed delay, independent of the failure count. Of
    /// several delayed inserts of one item the earliest deadline wins.
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let ready_at = Instant::now() + delay;
        let _ = self.inner.delay_tx.send((item, ready_at));
    }

    /// Insert after the rate limiter's delay for this item.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.inner.limiter.when(&item);
        counter!("workqueue_retries_total", 1u64, "queue" => self.inner.name.clone());
        trace!(queue = %self.inner.name, item = ?item, delay_ms = delay.as_millis() as u64, "rate limited add");
        self.add_after(item, delay);
    }

    /// Clear the backoff history of an item.
    pub fn forget(&self, item: &T) { self.inner.limiter.forget(item) }

    pub fn num_requeues(&self, item: &T) -> u32 { self.inner.limiter.num_requeues(item) }

    /// Wait for the next ready item and mark it in flight. Returns `None`
    /// once the queue is shut down and no ready item is left.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = lock(&self.inner.state);
                if let Some(item) = st.queue.pop_front() {
                    st.dirty.remove(&item);
                    st.processing.insert(item.clone());
                    let more = !st.queue.is_empty();
                    gauge!("workqueue_depth", st.queue.len() as f64, "queue" => self.inner.name.clone());
                    drop(st);
                    if more {
                        self.inner.ready.notify_one();
                    }
                    return Some(item);
                }
                if st.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Finish processing an item handed out by `get`.
    pub fn done(&self, item: &T) {
        let mut st = lock(&self.inner.state);
        st.processing.remove(item);
        if st.dirty.contains(item) {
            st.queue.push_back(item.clone());
            drop(st);
            self.inner.ready.notify_one();
        }
    }

    /// Number of ready items.
    pub fn len(&self) -> usize { lock(&self.inner.state).queue.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Stop accepting items. `get` keeps draining ready items and then
    /// returns `None`; delayed items that have not fired are discarded.
    pub fn shut_down(&self) {
        let mut st = lock(&self.inner.state);
        if st.shutting_down {
            return;
        }
        st.shutting_down = true;
        debug!(queue = %self.inner.name, pending = st.queue.len(), in_flight = st.processing.len(), "queue shutting down");
        drop(st);
        self.inner.ready.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool { lock(&self.inner.state).shutting_down }
}

struct Waiting<T> {
    ready_at: Instant,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Waiting<T> {
    fn eq(&self, other: &Self) -> bool { self.ready_at == other.ready_at && self.seq == other.seq }
}

impl<T> Eq for Waiting<T> {}

impl<T> PartialOrd for Waiting<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

impl<T> Ord for Waiting<T> {
    // Reversed: BinaryHeap is a max-heap and the earliest deadline must pop first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.ready_at.cmp(&self.ready_at).then_with(|| other.seq.cmp(&self.seq))
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Holds delayed items until their deadline, then adds them to the queue.
/// Exits when the queue is dropped.
async fn delaying_loop<T: QueueItem>(queue: Weak<Inner<T>>, mut rx: mpsc::UnboundedReceiver<(T, Instant)>) {
    let mut heap: BinaryHeap<Waiting<T>> = BinaryHeap::new();
    let mut deadlines: FxHashMap<T, Instant> = FxHashMap::default();
    let mut seq = 0u64;
    loop {
        let now = Instant::now();
        while heap.peek().map_or(false, |w| w.ready_at <= now) {
            let Some(w) = heap.pop() else { break };
            if deadlines.get(&w.item) != Some(&w.ready_at) {
                // Superseded by an earlier deadline for the same item.
                continue;
            }
            deadlines.remove(&w.item);
            match queue.upgrade() {
                Some(q) => q.add(w.item),
                None => return,
            }
        }
        let next = heap.peek().map(|w| w.ready_at);
        tokio::select! {
            msg = rx.recv() => match msg {
                Some((item, ready_at)) => {
                    let earlier = deadlines.get(&item).map_or(true, |existing| ready_at < *existing);
                    if earlier {
                        deadlines.insert(item.clone(), ready_at);
                        seq = seq.wrapping_add(1);
                        heap.push(Waiting { ready_at, seq, item });
                    }
                }
                None => return,
            },
            _ = sleep_until_opt(next) => {}
        }
    }
}
