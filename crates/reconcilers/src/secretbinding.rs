//! SecretBinding reconciler: owns the binding's finalizer, tracks secret
//! usage, and holds deletion while clusters still reference the binding.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use steward_core::{Cluster, Condition, ConditionStatus, Key, Outcome, Resource, SecretBinding};
use steward_kubehub::{Informer, ResourceClient};
use steward_runtime::Reconciler;
use tracing::{debug, info, warn};

use crate::error::ReconcileError;
use crate::usage::UsageIndex;
use crate::{ensure_finalizer, write_status_if_changed};

pub const SECRET_BINDING_FINALIZER: &str = "steward.io/secretbinding";

pub struct SecretBindingReconciler {
    bindings: Arc<dyn ResourceClient<SecretBinding>>,
    clusters: Arc<dyn Informer<Cluster>>,
    usage: Arc<UsageIndex>,
    blocked_requeue: Duration,
}

impl SecretBindingReconciler {
    pub fn new(
        bindings: Arc<dyn ResourceClient<SecretBinding>>,
        clusters: Arc<dyn Informer<Cluster>>,
        usage: Arc<UsageIndex>,
        blocked_requeue: Duration,
    ) -> Self {
        Self { bindings, clusters, usage, blocked_requeue }
    }

    async fn reconcile_binding(&self, key: &Key) -> Result<Outcome, ReconcileError> {
        let binding = match self.bindings.get(key).await {
            Ok(b) => b,
            Err(e) if e.is_not_found() => {
                debug!(key = %key, "object is gone, stop reconciling");
                self.usage.release(key);
                return Ok(Outcome::Success);
            }
            Err(e) => return Err(e.into()),
        };

        if binding.metadata.is_deleting() {
            return self.finalize(binding).await;
        }

        if let Err(reason) = validate(&binding) {
            self.usage.release(key);
            let mut next = binding.clone();
            next.status.set_condition(Condition::READY, ConditionStatus::False, "InvalidSpec", &reason);
            next.status.set_last_error(&reason);
            write_status_if_changed(self.bindings.as_ref(), &binding, next).await?;
            return Err(ReconcileError::Invalid(reason));
        }

        let binding = ensure_finalizer(self.bindings.as_ref(), binding, SECRET_BINDING_FINALIZER).await?;
        self.usage.bind(key.clone(), binding.secret_key());

        let mut next = binding.clone();
        next.status.observed_generation = binding.metadata.generation;
        next.status.set_condition(Condition::READY, ConditionStatus::True, "Reconciled", "binding is ready");
        next.status.clear_last_error();
        write_status_if_changed(self.bindings.as_ref(), &binding, next).await?;
        Ok(Outcome::Success)
    }

    async fn finalize(&self, binding: SecretBinding) -> Result<Outcome, ReconcileError> {
        let key = binding.key();
        if !binding.metadata.has_finalizer(SECRET_BINDING_FINALIZER) {
            self.usage.release(&key);
            return Ok(Outcome::Success);
        }

        let mut users: Vec<Key> =
            self.clusters.list().iter().filter(|c| c.references_binding(&key)).map(|c| c.key()).collect();
        if !users.is_empty() {
            users.sort();
            let names: Vec<String> = users.iter().map(|k| k.name.clone()).collect();
            let message = format!("still referenced by clusters: {}", names.join(", "));
            info!(key = %key, clusters = users.len(), "deletion blocked; binding still in use");
            counter!("secretbinding_deletions_blocked_total", 1u64);
            let mut next = binding.clone();
            next.status.set_condition(Condition::READY, ConditionStatus::False, "DeletionBlocked", &message);
            write_status_if_changed(self.bindings.as_ref(), &binding, next).await?;
            return Ok(Outcome::RequeueAfter(self.blocked_requeue));
        }

        self.usage.release(&key);
        let mut next = binding;
        next.metadata.remove_finalizer(SECRET_BINDING_FINALIZER);
        self.bindings.update(&next).await?;
        info!(key = %key, "finalizer removed");
        Ok(Outcome::Success)
    }
}

fn validate(binding: &SecretBinding) -> Result<(), String> {
    if binding.spec.secret_ref.name.trim().is_empty() {
        return Err("spec.secretRef.name must not be empty".to_string());
    }
    Ok(())
}

#[async_trait]
impl Reconciler for SecretBindingReconciler {
    async fn reconcile(&self, key: &Key) -> Outcome {
        match self.reconcile_binding(key).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(kind = "SecretBinding", key = %key, error = %e, "reconcile error");
                e.into_outcome()
            }
        }
    }
}
