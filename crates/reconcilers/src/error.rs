use steward_core::{ClientError, Outcome};

use crate::bastion::ActuatorError;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("actuator: {0}")]
    Actuator(#[from] ActuatorError),
    #[error("invalid spec: {0}")]
    Invalid(String),
}

impl ReconcileError {
    pub fn is_not_found(&self) -> bool { matches!(self, ReconcileError::Client(e) if e.is_not_found()) }

    pub fn is_transient(&self) -> bool {
        match self {
            ReconcileError::Client(e) => e.is_retryable(),
            ReconcileError::Actuator(e) => e.is_transient(),
            ReconcileError::Invalid(_) => false,
        }
    }

    /// Classify into a queue decision. An object that vanished mid-pass has
    /// nothing left to reconcile.
    pub fn into_outcome(self) -> Outcome {
        if self.is_not_found() {
            Outcome::Success
        } else if self.is_transient() {
            Outcome::Retryable(self.to_string())
        } else {
            Outcome::Terminal(self.to_string())
        }
    }
}
