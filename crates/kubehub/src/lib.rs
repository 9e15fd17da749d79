//! Steward kubehub – watch sources and store clients
//!
//! The reconciliation runtime only talks to two contracts defined here:
//! [`Informer`] (notifications plus a cached read path) and
//! [`ResourceClient`] (authoritative reads and writes). Two implementations
//! ship with the crate: a kube-backed one in [`apiserver`] and an in-memory
//! backing store in [`memory`].

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use steward_core::{ClientError, Key};

pub mod apiserver;
pub mod informer;
pub mod memory;

pub use apiserver::{run_watcher, KubeResourceClient};
pub use informer::{SharedInformer, WatchEvent};
pub use memory::MemoryStore;

/// Callbacks invoked for every change a watch source observes.
///
/// Handlers run inline on the watch path and must not block.
pub trait EventHandler<R>: Send + Sync {
    fn on_add(&self, _obj: &R) {}
    fn on_update(&self, _old: &R, _new: &R) {}
    fn on_delete(&self, _obj: &R) {}
}

/// Readiness of a watch source: true once the initial listing was delivered.
pub trait Synced: Send + Sync {
    fn has_synced(&self) -> bool;
}

/// Watch source for one kind with a cached read path.
pub trait Informer<R>: Synced {
    /// Register a handler; objects already cached are replayed as adds.
    fn add_event_handler(&self, handler: Arc<dyn EventHandler<R>>);
    fn get(&self, key: &Key) -> Option<Arc<R>>;
    fn list(&self) -> Vec<Arc<R>>;
}

/// Authoritative access to the backing store for one kind.
///
/// Writes carry the object's resourceVersion; a stale version fails with
/// [`ClientError::Conflict`].
#[async_trait]
pub trait ResourceClient<R>: Send + Sync {
    async fn get(&self, key: &Key) -> Result<R, ClientError>;
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<R>, ClientError>;
    /// Write metadata and spec; status is left untouched.
    async fn update(&self, obj: &R) -> Result<R, ClientError>;
    /// Write status only.
    async fn update_status(&self, obj: &R) -> Result<R, ClientError>;
    /// Request deletion. Objects carrying finalizers are only marked with a
    /// deletion timestamp until the last finalizer is removed.
    async fn delete(&self, key: &Key) -> Result<(), ClientError>;
}

/// Build a kube client from the ambient kubeconfig or in-cluster config.
pub async fn connect() -> Result<kube::Client> {
    kube::Client::try_default().await.context("building kube client")
}
