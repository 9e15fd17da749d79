//! Event translators: turn watch notifications into queue inserts.
//!
//! Translators never look at payloads beyond what is needed to derive a key
//! and never do anything but enqueue. Deduplication is left to the queue.

use std::marker::PhantomData;

use steward_core::{Key, Resource};
use steward_kubehub::EventHandler;
use tracing::trace;

use crate::KeyQueue;

/// Enqueues the notified object's own key (primary kind).
pub struct EnqueueOwnKey {
    queue: KeyQueue,
    updates: bool,
    deletes: bool,
}

impl EnqueueOwnKey {
    /// React to adds, updates and deletes.
    pub fn new(queue: KeyQueue) -> Self { Self { queue, updates: true, deletes: true } }

    /// React to adds only.
    pub fn adds_only(queue: KeyQueue) -> Self { Self { queue, updates: false, deletes: false } }

    fn enqueue<R: Resource>(&self, event: &'static str, obj: &R) {
        let key = obj.key();
        trace!(kind = R::kind(), key = %key, event, queue = self.queue.name(), "enqueue");
        self.queue.add(key);
    }
}

impl<R: Resource> EventHandler<R> for EnqueueOwnKey {
    fn on_add(&self, obj: &R) { self.enqueue("add", obj) }

    // Relists deliver updates with an unchanged resourceVersion; those are
    // enqueued as well.
    fn on_update(&self, _old: &R, new: &R) {
        if self.updates {
            self.enqueue("update", new)
        }
    }

    fn on_delete(&self, obj: &R) {
        if self.deletes {
            self.enqueue("delete", obj)
        }
    }
}

/// Resolves a reference carried by a secondary object into the key of the
/// primary it points at.
pub type Resolve<R> = fn(&R) -> Option<Key>;

/// On a secondary add, enqueue the referenced primary into the primary's
/// queue.
pub struct CrossTrigger<R> {
    target: KeyQueue,
    resolve: Resolve<R>,
    _secondary: PhantomData<fn(&R)>,
}

impl<R: Resource> CrossTrigger<R> {
    pub fn new(target: KeyQueue, resolve: Resolve<R>) -> Self { Self { target, resolve, _secondary: PhantomData } }
}

impl<R: Resource> EventHandler<R> for CrossTrigger<R> {
    fn on_add(&self, obj: &R) {
        match (self.resolve)(obj) {
            Some(key) => {
                trace!(kind = R::kind(), from = %obj.key(), key = %key, queue = self.target.name(), "cross-trigger");
                self.target.add(key);
            }
            None => trace!(kind = R::kind(), from = %obj.key(), "no reference to trigger"),
        }
    }
}
