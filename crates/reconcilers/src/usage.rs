//! In-memory index of which bindings use which secret.

use std::sync::{Mutex, MutexGuard, PoisonError};

use metrics::gauge;
use rustc_hash::{FxHashMap, FxHashSet};
use steward_core::Key;

#[derive(Default)]
struct Maps {
    by_secret: FxHashMap<Key, FxHashSet<Key>>,
    by_binding: FxHashMap<Key, Key>,
}

/// Secret → bindings referencing it. Rebuilt from reconcile passes; never
/// persisted.
#[derive(Default)]
pub struct UsageIndex {
    maps: Mutex<Maps>,
}

impl UsageIndex {
    pub fn new() -> Self { Self::default() }

    fn maps(&self) -> MutexGuard<'_, Maps> { self.maps.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Record that `binding` uses `secret`, replacing any earlier secret.
    pub fn bind(&self, binding: Key, secret: Key) {
        let mut m = self.maps();
        if let Some(prev) = m.by_binding.insert(binding.clone(), secret.clone()) {
            if prev != secret {
                remove_user(&mut m.by_secret, &prev, &binding);
            }
        }
        m.by_secret.entry(secret).or_default().insert(binding);
        gauge!("secrets_in_use", m.by_secret.len() as f64);
    }

    /// Forget `binding`; returns the secret it was using.
    pub fn release(&self, binding: &Key) -> Option<Key> {
        let mut m = self.maps();
        let secret = m.by_binding.remove(binding)?;
        remove_user(&mut m.by_secret, &secret, binding);
        gauge!("secrets_in_use", m.by_secret.len() as f64);
        Some(secret)
    }

    /// Bindings currently using `secret`, sorted.
    pub fn users_of(&self, secret: &Key) -> Vec<Key> {
        let mut out: Vec<Key> = self.maps().by_secret.get(secret).map(|s| s.iter().cloned().collect()).unwrap_or_default();
        out.sort();
        out
    }

    pub fn is_in_use(&self, secret: &Key) -> bool { self.maps().by_secret.contains_key(secret) }
}

fn remove_user(by_secret: &mut FxHashMap<Key, FxHashSet<Key>>, secret: &Key, binding: &Key) {
    if let Some(users) = by_secret.get_mut(secret) {
        users.remove(binding);
        if users.is_empty() {
            by_secret.remove(secret);
        }
    }
}
