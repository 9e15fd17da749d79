//! Steward reconcilers – per-kind reconcile logic
//!
//! Every reconciler re-reads its object through a [`ResourceClient`], moves
//! it one step toward the desired state and reports an [`Outcome`]; errors
//! are classified by [`ReconcileError::into_outcome`].

#![forbid(unsafe_code)]

use steward_core::{ClientError, Object, Spec, Status};
use steward_kubehub::ResourceClient;

pub mod bastion;
pub mod error;
pub mod provider;
pub mod secretbinding;
pub mod usage;

pub use bastion::{ActuatorError, BastionActuator, BastionReconciler, StaticIngressActuator, BASTION_FINALIZER};
pub use error::ReconcileError;
pub use provider::ProviderSyncReconciler;
pub use secretbinding::{SecretBindingReconciler, SECRET_BINDING_FINALIZER};
pub use usage::UsageIndex;

/// Worker-pool names, used as `kind` labels and in worker counts.
pub mod pools {
    pub const SECRET_BINDING: &str = "SecretBinding";
    pub const SECRET_BINDING_PROVIDER: &str = "SecretBindingProvider";
    pub const BASTION: &str = "Bastion";
}

/// Write `next`'s status unless it equals `current`'s. Re-asserting an
/// unchanged status must not produce a write, or every write would trigger
/// another pass.
pub(crate) async fn write_status_if_changed<S: Spec, T: Status>(
    client: &dyn ResourceClient<Object<S, T>>,
    current: &Object<S, T>,
    next: Object<S, T>,
) -> Result<Object<S, T>, ClientError> {
    if current.status == next.status {
        return Ok(next);
    }
    client.update_status(&next).await
}

/// Add `finalizer` and persist it if missing.
pub(crate) async fn ensure_finalizer<S: Spec, T: Status>(
    client: &dyn ResourceClient<Object<S, T>>,
    obj: Object<S, T>,
    finalizer: &str,
) -> Result<Object<S, T>, ClientError> {
    if obj.metadata.has_finalizer(finalizer) {
        return Ok(obj);
    }
    let mut next = obj;
    next.metadata.add_finalizer(finalizer);
    client.update(&next).await
}
