//! Bastion reconciler: provisions a transient SSH host through a
//! [`BastionActuator`] and records its public address.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use steward_core::{Bastion, BastionIngress, Condition, ConditionStatus, Key, Outcome};
use steward_kubehub::ResourceClient;
use steward_runtime::Reconciler;
use tracing::{debug, info, warn};

use crate::error::ReconcileError;
use crate::{ensure_finalizer, write_status_if_changed};

pub const BASTION_FINALIZER: &str = "extensions.steward.io/bastion";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActuatorError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("permanent: {0}")]
    Permanent(String),
}

impl ActuatorError {
    pub fn is_transient(&self) -> bool { matches!(self, ActuatorError::Transient(_)) }
}

/// Infrastructure behind a Bastion. Both calls must be idempotent.
#[async_trait]
pub trait BastionActuator: Send + Sync {
    /// Create or update the host; returns its public address.
    async fn ensure(&self, bastion: &Bastion) -> Result<BastionIngress, ActuatorError>;
    async fn destroy(&self, bastion: &Bastion) -> Result<(), ActuatorError>;
}

/// Actuator for environments where hosts already exist: the address is
/// derived from the bastion's name under a fixed domain.
pub struct StaticIngressActuator {
    domain: String,
}

impl StaticIngressActuator {
    pub fn new(domain: impl Into<String>) -> Self { Self { domain: domain.into() } }
}

#[async_trait]
impl BastionActuator for StaticIngressActuator {
    async fn ensure(&self, bastion: &Bastion) -> Result<BastionIngress, ActuatorError> {
        let ns = bastion.metadata.namespace.as_deref().unwrap_or("default");
        Ok(BastionIngress { ip: None, hostname: Some(format!("{}.{}.{}", bastion.metadata.name, ns, self.domain)) })
    }

    async fn destroy(&self, _bastion: &Bastion) -> Result<(), ActuatorError> { Ok(()) }
}

pub struct BastionReconciler {
    bastions: Arc<dyn ResourceClient<Bastion>>,
    actuator: Arc<dyn BastionActuator>,
}

impl BastionReconciler {
    pub fn new(bastions: Arc<dyn ResourceClient<Bastion>>, actuator: Arc<dyn BastionActuator>) -> Self {
        Self { bastions, actuator }
    }

    async fn reconcile_bastion(&self, key: &Key) -> Result<Outcome, ReconcileError> {
        let bastion = self.bastions.get(key).await?;

        if bastion.metadata.is_deleting() {
            if !bastion.metadata.has_finalizer(BASTION_FINALIZER) {
                return Ok(Outcome::Success);
            }
            self.actuator.destroy(&bastion).await?;
            let mut next = bastion;
            next.metadata.remove_finalizer(BASTION_FINALIZER);
            self.bastions.update(&next).await?;
            info!(key = %key, "bastion destroyed");
            return Ok(Outcome::Success);
        }

        if let Err(reason) = validate(&bastion) {
            let mut next = bastion.clone();
            next.status.common.set_condition(Condition::READY, ConditionStatus::False, "InvalidSpec", &reason);
            next.status.common.set_last_error(&reason);
            write_status_if_changed(self.bastions.as_ref(), &bastion, next).await?;
            return Err(ReconcileError::Invalid(reason));
        }

        let bastion = ensure_finalizer(self.bastions.as_ref(), bastion, BASTION_FINALIZER).await?;
        let ingress = match self.actuator.ensure(&bastion).await {
            Ok(ingress) => ingress,
            Err(e) => {
                let mut next = bastion.clone();
                let message = e.to_string();
                next.status.common.set_condition(Condition::READY, ConditionStatus::False, "ProvisioningFailed", &message);
                next.status.common.set_last_error(&message);
                write_status_if_changed(self.bastions.as_ref(), &bastion, next).await?;
                return Err(e.into());
            }
        };
        debug!(key = %key, ingress = ?ingress, "bastion provisioned");

        let mut next = bastion.clone();
        next.status.ingress = Some(ingress);
        next.status.common.observed_generation = bastion.metadata.generation;
        next.status.common.set_condition(Condition::READY, ConditionStatus::True, "Provisioned", "bastion is reachable");
        next.status.common.clear_last_error();
        write_status_if_changed(self.bastions.as_ref(), &bastion, next).await?;
        Ok(Outcome::Success)
    }
}

fn validate(bastion: &Bastion) -> Result<(), String> {
    if bastion.spec.user_data.is_empty() {
        return Err("spec.userData must not be empty".to_string());
    }
    STANDARD.decode(&bastion.spec.user_data).map_err(|e| format!("spec.userData is not valid base64: {}", e))?;
    for (i, policy) in bastion.spec.ingress.iter().enumerate() {
        let block = &policy.ip_block;
        let (addr, _) = parse_cidr(&block.cidr).map_err(|e| format!("spec.ingress[{}].ipBlock.cidr: {}", i, e))?;
        for (j, except) in block.except.iter().flatten().enumerate() {
            let (inner, _) =
                parse_cidr(except).map_err(|e| format!("spec.ingress[{}].ipBlock.except[{}]: {}", i, j, e))?;
            if inner.is_ipv4() != addr.is_ipv4() {
                return Err(format!(
                    "spec.ingress[{}].ipBlock.except[{}]: {:?} does not match the family of {:?}",
                    i, j, except, block.cidr
                ));
            }
        }
    }
    Ok(())
}

fn parse_cidr(cidr: &str) -> Result<(IpAddr, u8), String> {
    let (addr, prefix) = cidr.split_once('/').ok_or_else(|| format!("{:?} is missing a prefix length", cidr))?;
    let addr: IpAddr = addr.parse().map_err(|_| format!("{:?} has an invalid address", cidr))?;
    let prefix: u8 = prefix.parse().map_err(|_| format!("{:?} has an invalid prefix length", cidr))?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        return Err(format!("{:?} prefix length exceeds {}", cidr, max));
    }
    Ok((addr, prefix))
}

#[async_trait]
impl Reconciler for BastionReconciler {
    async fn reconcile(&self, key: &Key) -> Outcome {
        match self.reconcile_bastion(key).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if !e.is_not_found() {
                    warn!(kind = "Bastion", key = %key, error = %e, "reconcile error");
                }
                e.into_outcome()
            }
        }
    }
}
