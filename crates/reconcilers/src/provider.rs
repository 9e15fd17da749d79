//! Records on each SecretBinding the provider types of the clusters using it.
//! Runs on the Cluster queue.

use std::sync::Arc;

use async_trait::async_trait;
use steward_core::{Cluster, Key, Outcome, SecretBinding};
use steward_kubehub::ResourceClient;
use steward_runtime::Reconciler;
use tracing::{debug, info, warn};

use crate::error::ReconcileError;

pub struct ProviderSyncReconciler {
    clusters: Arc<dyn ResourceClient<Cluster>>,
    bindings: Arc<dyn ResourceClient<SecretBinding>>,
}

impl ProviderSyncReconciler {
    pub fn new(clusters: Arc<dyn ResourceClient<Cluster>>, bindings: Arc<dyn ResourceClient<SecretBinding>>) -> Self {
        Self { clusters, bindings }
    }

    async fn sync(&self, key: &Key) -> Result<Outcome, ReconcileError> {
        let cluster = self.clusters.get(key).await?;
        let provider_type = cluster.spec.provider.type_.as_str();
        let Some(binding_key) = cluster.secret_binding_key() else {
            return Ok(Outcome::Success);
        };
        if provider_type.is_empty() {
            return Ok(Outcome::Success);
        }

        let binding = self.bindings.get(&binding_key).await?;
        if binding.metadata.is_deleting() {
            debug!(key = %binding_key, "binding is being deleted; skipping provider sync");
            return Ok(Outcome::Success);
        }
        let mut next = binding;
        if !next.spec.add_provider_type(provider_type) {
            return Ok(Outcome::Success);
        }
        self.bindings.update(&next).await?;
        info!(key = %binding_key, cluster = %key, provider = provider_type, "recorded provider type on binding");
        Ok(Outcome::Success)
    }
}

#[async_trait]
impl Reconciler for ProviderSyncReconciler {
    async fn reconcile(&self, key: &Key) -> Outcome {
        match self.sync(key).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if !e.is_not_found() {
                    warn!(kind = "SecretBindingProvider", key = %key, error = %e, "provider sync error");
                }
                e.into_outcome()
            }
        }
    }
}
