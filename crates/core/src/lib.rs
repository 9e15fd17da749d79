//! Steward core types and errors

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod kinds;
pub mod meta;

pub use kinds::{
    Bastion, BastionIngress, BastionIngressPolicy, BastionSpec, BastionStatus, Cluster, ClusterProvider, ClusterSpec,
    IPBlock, SecretBinding, SecretBindingProvider, SecretBindingSpec, SecretRef,
};
pub use meta::{Condition, ConditionStatus, DefaultStatus, LastError, Object, ObjectMeta, Resource, Spec, Status, TypeMeta};

pub mod prelude {
    pub use super::{ClientError, Key, Object, ObjectMeta, Outcome, Resource, Spec, Status};
}

/// Identity of one resource instance: optional namespace plus name.
///
/// Keys are the only thing work queues carry; payloads are always re-read
/// from the backing store when a key is processed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key {
    pub namespace: Option<String>,
    pub name: String,
}

impl Key {
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: Some(namespace.into()), name: name.into() }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self { namespace: None, name: name.into() }
    }

    pub fn namespace(&self) -> Option<&str> { self.namespace.as_deref() }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("empty key")]
    Empty,
    #[error("malformed key: {0} (expect name or namespace/name)")]
    Malformed(String),
}

impl FromStr for Key {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(KeyError::Empty);
        }
        match s.split_once('/') {
            None => Ok(Key::cluster(s)),
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => Ok(Key::namespaced(ns, name)),
            Some(_) => Err(KeyError::Malformed(s.to_string())),
        }
    }
}

/// Result of one reconcile pass, turned into a queue decision by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Converged; the key's backoff is cleared.
    Success,
    /// Converged for now, look again after the given delay.
    RequeueAfter(Duration),
    /// Plausibly transient failure; retried with per-key backoff.
    Retryable(String),
    /// Cannot be fixed by retrying; dropped from the fast path.
    Terminal(String),
}

impl Outcome {
    /// Stable label used for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::RequeueAfter(_) => "requeue_after",
            Outcome::Retryable(_) => "retryable",
            Outcome::Terminal(_) => "terminal",
        }
    }
}

/// Failure kinds reported by the external client against the backing store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ClientError {
    #[error("not_found: {0}")]
    NotFound(String),
    /// Optimistic concurrency failure (stale resourceVersion) or name collision.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Network failure, throttling or server-side unavailability.
    #[error("transient: {0}")]
    Transient(String),
    /// The store rejected the write as invalid.
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("other: {0}")]
    Other(String),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool { matches!(self, ClientError::NotFound(_)) }

    /// Whether retrying the same request later may succeed. Unclassified
    /// failures are retried too; backoff bounds their cost.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Conflict(_) | ClientError::Transient(_) | ClientError::Other(_))
    }
}
