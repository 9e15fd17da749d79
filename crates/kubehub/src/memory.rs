//! In-memory backing store with optimistic concurrency and finalizer-aware
//! deletion. Every write is published synchronously to the store's informer,
//! so it behaves like an API server plus an already-synced watch.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use rustc_hash::FxHashMap;
use steward_core::{ClientError, Key, Object, Resource, Spec, Status};
use tracing::trace;
use uuid::Uuid;

use crate::informer::{SharedInformer, WatchEvent};
use crate::ResourceClient;

struct State<S, T> {
    objects: FxHashMap<Key, Object<S, T>>,
    revision: u64,
}

impl<S, T> State<S, T> {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }
}

pub struct MemoryStore<S, T> {
    state: Mutex<State<S, T>>,
    informer: Arc<SharedInformer<Object<S, T>>>,
    failures: Mutex<VecDeque<ClientError>>,
    writes: AtomicU64,
}

fn lock<X>(m: &Mutex<X>) -> MutexGuard<'_, X> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn not_found(kind: &str, key: &Key) -> ClientError {
    ClientError::NotFound(format!("{} {}", kind, key))
}

impl<S: Spec, T: Status> Default for MemoryStore<S, T> {
    fn default() -> Self { Self::new() }
}

impl<S: Spec, T: Status> MemoryStore<S, T> {
    pub fn new() -> Self {
        let informer = Arc::new(SharedInformer::new());
        informer.mark_synced();
        Self {
            state: Mutex::new(State { objects: FxHashMap::default(), revision: 0 }),
            informer,
            failures: Mutex::new(VecDeque::new()),
            writes: AtomicU64::new(0),
        }
    }

    /// Watch source publishing every change made through this store.
    pub fn informer(&self) -> Arc<SharedInformer<Object<S, T>>> { Arc::clone(&self.informer) }

    /// Create an object as an external actor would; assigns uid, generation
    /// and resourceVersion.
    pub fn create(&self, obj: Object<S, T>) -> Result<Object<S, T>, ClientError> {
        let key = obj.key();
        let mut st = lock(&self.state);
        if st.objects.contains_key(&key) {
            return Err(ClientError::Conflict(format!("{} {} already exists", S::KIND, key)));
        }
        let mut obj = obj;
        if obj.types.kind.is_empty() {
            obj.types.kind = S::KIND.to_string();
            obj.types.api_version = Object::<S, T>::api_version();
        }
        obj.metadata.uid = Some(Uuid::new_v4().to_string());
        obj.metadata.generation = 1;
        obj.metadata.deletion_timestamp = None;
        obj.metadata.resource_version = Some(st.next_revision());
        st.objects.insert(key, obj.clone());
        self.informer.apply(WatchEvent::Applied(obj.clone()));
        Ok(obj)
    }

    /// Current stored object, bypassing failure injection and write counting.
    pub fn peek(&self, key: &Key) -> Option<Object<S, T>> { lock(&self.state).objects.get(key).cloned() }

    /// Fail the next request (of any verb) with `err`. Queued failures are
    /// consumed in order.
    pub fn fail_next(&self, err: ClientError) { lock(&self.failures).push_back(err) }

    /// Number of successful writes made through [`ResourceClient`].
    pub fn writes(&self) -> u64 { self.writes.load(Ordering::SeqCst) }

    fn take_failure(&self) -> Result<(), ClientError> {
        match lock(&self.failures).pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn check_version(current: &Object<S, T>, incoming: &Object<S, T>) -> Result<(), ClientError> {
        match &incoming.metadata.resource_version {
            Some(rv) if Some(rv) != current.metadata.resource_version.as_ref() => Err(ClientError::Conflict(format!(
                "{} {}: resourceVersion {} is stale",
                S::KIND,
                current.key(),
                rv
            ))),
            _ => Ok(()),
        }
    }

    /// Store `next`, or drop it when its deletion has no finalizers left.
    fn commit(&self, st: &mut State<S, T>, mut next: Object<S, T>) -> Object<S, T> {
        next.metadata.resource_version = Some(st.next_revision());
        self.writes.fetch_add(1, Ordering::SeqCst);
        let key = next.key();
        if next.metadata.is_deleting() && next.metadata.finalizers.is_empty() {
            trace!(kind = S::KIND, key = %key, "last finalizer removed; object gone");
            st.objects.remove(&key);
            self.informer.apply(WatchEvent::Deleted(next.clone()));
        } else {
            st.objects.insert(key, next.clone());
            self.informer.apply(WatchEvent::Applied(next.clone()));
        }
        next
    }
}

#[async_trait]
impl<S: Spec, T: Status> ResourceClient<Object<S, T>> for MemoryStore<S, T> {
    async fn get(&self, key: &Key) -> Result<Object<S, T>, ClientError> {
        self.take_failure()?;
        lock(&self.state).objects.get(key).cloned().ok_or_else(|| not_found(S::KIND, key))
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<Object<S, T>>, ClientError> {
        self.take_failure()?;
        let st = lock(&self.state);
        let mut out: Vec<_> = st
            .objects
            .values()
            .filter(|o| namespace.map_or(true, |ns| o.metadata.namespace.as_deref() == Some(ns)))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(out)
    }

    async fn update(&self, obj: &Object<S, T>) -> Result<Object<S, T>, ClientError> {
        self.take_failure()?;
        let key = obj.key();
        let mut st = lock(&self.state);
        let current = st.objects.get(&key).cloned().ok_or_else(|| not_found(S::KIND, &key))?;
        Self::check_version(&current, obj)?;
        let spec_changed = current.spec != obj.spec;
        if current.metadata.is_deleting() && spec_changed {
            return Err(ClientError::Invalid(format!("{} {}: spec is immutable once deletion is requested", S::KIND, key)));
        }
        let mut next = obj.clone();
        next.status = current.status;
        next.metadata.uid = current.metadata.uid;
        next.metadata.deletion_timestamp = current.metadata.deletion_timestamp;
        next.metadata.generation = if spec_changed { current.metadata.generation + 1 } else { current.metadata.generation };
        Ok(self.commit(&mut st, next))
    }

    async fn update_status(&self, obj: &Object<S, T>) -> Result<Object<S, T>, ClientError> {
        self.take_failure()?;
        let key = obj.key();
        let mut st = lock(&self.state);
        let current = st.objects.get(&key).cloned().ok_or_else(|| not_found(S::KIND, &key))?;
        Self::check_version(&current, obj)?;
        let mut next = current;
        next.status = obj.status.clone();
        Ok(self.commit(&mut st, next))
    }

    async fn delete(&self, key: &Key) -> Result<(), ClientError> {
        self.take_failure()?;
        let mut st = lock(&self.state);
        let current = st.objects.get(key).cloned().ok_or_else(|| not_found(S::KIND, key))?;
        if current.metadata.is_deleting() {
            return Ok(());
        }
        let mut next = current;
        next.metadata.deletion_timestamp = Some(Utc::now());
        self.commit(&mut st, next);
        Ok(())
    }
}
