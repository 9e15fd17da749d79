//! Shared informer: keeps a per-kind cache fed by watch events and fans the
//! events out to registered handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;
use steward_core::{Key, Resource};
use tracing::{debug, trace};

use crate::{EventHandler, Informer, Synced};

/// Raw notification delivered by a watch.
#[derive(Debug, Clone)]
pub enum WatchEvent<R> {
    Applied(R),
    Deleted(R),
    /// Full relisting; replaces the cache.
    Restarted(Vec<R>),
}

type Cache<R> = FxHashMap<Key, Arc<R>>;

pub struct SharedInformer<R> {
    cache: ArcSwap<Cache<R>>,
    handlers: RwLock<Vec<Arc<dyn EventHandler<R>>>>,
    synced: AtomicBool,
}

impl<R: Resource> Default for SharedInformer<R> {
    fn default() -> Self { Self::new() }
}

impl<R: Resource> SharedInformer<R> {
    pub fn new() -> Self {
        Self { cache: ArcSwap::from_pointee(FxHashMap::default()), handlers: RwLock::new(Vec::new()), synced: AtomicBool::new(false) }
    }

    pub fn mark_synced(&self) { self.synced.store(true, Ordering::Release) }

    pub fn len(&self) -> usize { self.cache.load().len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Apply one watch event to the cache and notify handlers.
    pub fn apply(&self, event: WatchEvent<R>) {
        match event {
            WatchEvent::Applied(obj) => {
                let key = obj.key();
                let obj = Arc::new(obj);
                let prev = self.cache.rcu(|m| {
                    let mut next = Cache::clone(m);
                    next.insert(key.clone(), Arc::clone(&obj));
                    next
                });
                match prev.get(&key) {
                    Some(old) => self.dispatch(|h| h.on_update(old, &obj)),
                    None => self.dispatch(|h| h.on_add(&obj)),
                }
            }
            WatchEvent::Deleted(obj) => {
                let key = obj.key();
                self.cache.rcu(|m| {
                    let mut next = Cache::clone(m);
                    next.remove(&key);
                    next
                });
                self.dispatch(|h| h.on_delete(&obj));
            }
            WatchEvent::Restarted(list) => {
                let next: Cache<R> = list.into_iter().map(|o| (o.key(), Arc::new(o))).collect();
                let prev = self.cache.swap(Arc::new(next.clone()));
                debug!(kind = R::kind(), count = next.len(), previous = prev.len(), "informer relisted");
                for (key, obj) in next.iter() {
                    match prev.get(key) {
                        Some(old) => self.dispatch(|h| h.on_update(old, obj)),
                        None => self.dispatch(|h| h.on_add(obj)),
                    }
                }
                for (key, old) in prev.iter() {
                    if !next.contains_key(key) {
                        self.dispatch(|h| h.on_delete(old));
                    }
                }
                self.mark_synced();
            }
        }
    }

    fn dispatch(&self, f: impl Fn(&dyn EventHandler<R>)) {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner).clone();
        trace!(kind = R::kind(), handlers = handlers.len(), "dispatching event");
        for h in handlers.iter() {
            f(h.as_ref());
        }
    }
}

impl<R: Resource> Synced for SharedInformer<R> {
    fn has_synced(&self) -> bool { self.synced.load(Ordering::Acquire) }
}

impl<R: Resource> Informer<R> for SharedInformer<R> {
    fn add_event_handler(&self, handler: Arc<dyn EventHandler<R>>) {
        self.handlers.write().unwrap_or_else(PoisonError::into_inner).push(Arc::clone(&handler));
        for obj in self.cache.load().values() {
            handler.on_add(obj);
        }
    }

    fn get(&self, key: &Key) -> Option<Arc<R>> { self.cache.load().get(key).cloned() }

    fn list(&self) -> Vec<Arc<R>> { self.cache.load().values().cloned().collect() }
}
