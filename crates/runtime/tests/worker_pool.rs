use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use steward_core::{Key, Outcome};
use steward_queue::ratelimit::ItemExponential;
use steward_runtime::{Controller, KeyQueue, Reconciler, RuntimeConfig, WorkerCounts};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const KIND: &str = "Widget";

fn fast_queue() -> KeyQueue { KeyQueue::new("widgets", ItemExponential::new(Duration::from_millis(1), Duration::from_millis(20))) }

fn config() -> RuntimeConfig { RuntimeConfig { drain_poll_ms: 10, sync_poll_ms: 10, ..RuntimeConfig::default() } }

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn spawn(
    queue: &KeyQueue,
    reconciler: Arc<dyn Reconciler>,
    cfg: RuntimeConfig,
    workers: usize,
) -> (CancellationToken, tokio::task::JoinHandle<Result<(), steward_runtime::RuntimeError>>) {
    let cancel = CancellationToken::new();
    let controller = Controller::new("test", cfg).register(KIND, queue.clone(), reconciler);
    let handle = tokio::spawn(controller.start(cancel.clone(), WorkerCounts::new().with(KIND, workers)));
    (cancel, handle)
}

async fn stop(cancel: CancellationToken, handle: tokio::task::JoinHandle<Result<(), steward_runtime::RuntimeError>>) {
    cancel.cancel();
    handle.await.expect("join").expect("clean stop");
}

#[derive(Default)]
struct Overlap {
    active: Mutex<HashMap<Key, usize>>,
    violated: AtomicBool,
    calls: AtomicUsize,
}

#[async_trait]
impl Reconciler for Overlap {
    async fn reconcile(&self, key: &Key) -> Outcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut active = self.active.lock().unwrap();
            let n = active.entry(key.clone()).or_default();
            *n += 1;
            if *n > 1 {
                self.violated.store(true, Ordering::SeqCst);
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        *self.active.lock().unwrap().get_mut(key).unwrap() -= 1;
        Outcome::Success
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn at_most_one_in_flight_per_key() {
    let queue = fast_queue();
    let rec = Arc::new(Overlap::default());
    let (cancel, handle) = spawn(&queue, rec.clone(), config(), 8);

    let keys: Vec<Key> = (0..4).map(|i| Key::namespaced("ns", format!("w{}", i))).collect();
    for _ in 0..200 {
        for k in &keys {
            queue.add(k.clone());
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    eventually("some processing", || rec.calls.load(Ordering::SeqCst) > keys.len()).await;
    stop(cancel, handle).await;
    assert!(!rec.violated.load(Ordering::SeqCst), "a key was processed concurrently");
}

#[derive(Default)]
struct BlockFirst {
    calls: AtomicUsize,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl Reconciler for BlockFirst {
    async fn reconcile(&self, _key: &Key) -> Outcome {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Outcome::Success
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn key_added_while_in_flight_is_redelivered_once() {
    let queue = fast_queue();
    let rec = Arc::new(BlockFirst::default());
    let (cancel, handle) = spawn(&queue, rec.clone(), config(), 4);

    let key = Key::namespaced("ns", "a");
    queue.add(key.clone());
    rec.entered.notified().await;
    queue.add(key.clone());
    queue.add(key.clone());
    queue.add(key);
    rec.release.notify_one();

    eventually("redelivery", || rec.calls.load(Ordering::SeqCst) == 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(rec.calls.load(Ordering::SeqCst), 2);
    stop(cancel, handle).await;
}

struct Scripted {
    calls: AtomicUsize,
    script: fn(usize) -> Outcome,
}

impl Scripted {
    fn new(script: fn(usize) -> Outcome) -> Arc<Self> { Arc::new(Self { calls: AtomicUsize::new(0), script }) }
    fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }
}

#[async_trait]
impl Reconciler for Scripted {
    async fn reconcile(&self, _key: &Key) -> Outcome {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        (self.script)(n)
    }
}

struct PanicOnce {
    calls: AtomicUsize,
}

#[async_trait]
impl Reconciler for PanicOnce {
    async fn reconcile(&self, _key: &Key) -> Outcome {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("reconciler bug");
        }
        Outcome::Success
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panic_is_contained_and_retried() {
    let queue = fast_queue();
    let rec = Arc::new(PanicOnce { calls: AtomicUsize::new(0) });
    let (cancel, handle) = spawn(&queue, rec.clone(), config(), 1);

    let key = Key::namespaced("ns", "a");
    queue.add(key.clone());
    eventually("retry after panic", || rec.calls.load(Ordering::SeqCst) == 2).await;
    eventually("backoff cleared", || queue.num_requeues(&key) == 0).await;
    stop(cancel, handle).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retryable_failures_back_off_until_success() {
    let queue = fast_queue();
    let rec = Scripted::new(|n| if n < 3 { Outcome::Retryable("flaky".into()) } else { Outcome::Success });
    let (cancel, handle) = spawn(&queue, rec.clone(), config(), 1);

    let key = Key::namespaced("ns", "a");
    queue.add(key.clone());
    eventually("success after retries", || rec.calls() == 4).await;
    eventually("backoff cleared", || queue.num_requeues(&key) == 0).await;
    stop(cancel, handle).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn key_is_dropped_after_max_retries() {
    let queue = fast_queue();
    let rec = Scripted::new(|_| Outcome::Retryable("always".into()));
    let cfg = RuntimeConfig { max_retries: Some(2), ..config() };
    let (cancel, handle) = spawn(&queue, rec.clone(), cfg, 1);

    queue.add(Key::namespaced("ns", "a"));
    eventually("retries exhausted", || rec.calls() == 3).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(rec.calls(), 3);
    stop(cancel, handle).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn terminal_outcome_gets_no_backoff_retry() {
    let queue = fast_queue();
    let rec = Scripted::new(|_| Outcome::Terminal("invalid".into()));
    let (cancel, handle) = spawn(&queue, rec.clone(), config(), 1);

    let key = Key::namespaced("ns", "a");
    queue.add(key.clone());
    eventually("first pass", || rec.calls() == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(rec.calls(), 1);
    assert_eq!(queue.num_requeues(&key), 0);
    stop(cancel, handle).await;
}

#[tokio::test(start_paused = true)]
async fn terminal_key_is_rechecked_after_resync() {
    let queue = fast_queue();
    let rec = Scripted::new(|_| Outcome::Terminal("invalid".into()));
    let (cancel, handle) = spawn(&queue, rec.clone(), config(), 1);
    let resync = config().terminal_resync().expect("resync on by default");

    queue.add(Key::namespaced("ns", "a"));
    eventually("first pass", || rec.calls() == 1).await;
    tokio::time::sleep(resync - Duration::from_secs(1)).await;
    assert_eq!(rec.calls(), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(rec.calls(), 2);
    stop(cancel, handle).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn requeue_after_redelivers_later() {
    let queue = fast_queue();
    let rec = Scripted::new(|n| if n == 0 { Outcome::RequeueAfter(Duration::from_millis(50)) } else { Outcome::Success });
    let (cancel, handle) = spawn(&queue, rec.clone(), config(), 1);

    queue.add(Key::namespaced("ns", "a"));
    eventually("first pass", || rec.calls() == 1).await;
    assert_eq!(queue.len(), 0);
    eventually("delayed pass", || rec.calls() == 2).await;
    stop(cancel, handle).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distinct_keys_run_in_parallel() {
    struct Slow(AtomicUsize);

    #[async_trait]
    impl Reconciler for Slow {
        async fn reconcile(&self, _key: &Key) -> Outcome {
            tokio::time::sleep(Duration::from_millis(300)).await;
            self.0.fetch_add(1, Ordering::SeqCst);
            Outcome::Success
        }
    }

    let queue = fast_queue();
    let rec = Arc::new(Slow(AtomicUsize::new(0)));
    let (cancel, handle) = spawn(&queue, rec.clone(), config(), 4);

    let started = std::time::Instant::now();
    for i in 0..4 {
        queue.add(Key::namespaced("ns", format!("w{}", i)));
    }
    eventually("all four", || rec.0.load(Ordering::SeqCst) == 4).await;
    assert!(started.elapsed() < Duration::from_millis(1_000));
    stop(cancel, handle).await;
}
