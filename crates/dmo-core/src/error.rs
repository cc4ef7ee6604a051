//! Error types for DMO Core
//!
//! Commands on the controller fail with [`WorkflowError`]:
//! - wrong-stage commands, which never mutate state
//! - descriptors whose connectivity check failed
//! - unusable settings
//! - persistence failures

use crate::advisory::AdvisoryError;
use crate::store::StoreError;
use dmo_kernel::state_machine::WorkflowStage;
use dmo_kernel::{ErrorKind, GatewayError, StateMachineError};

/// Controller command failures
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// Command not accepted in the current stage
    #[error("`{command}` is not valid while the workflow is {stage}")]
    InvalidState {
        /// Rejected command
        command: &'static str,
        /// Stage at the time
        stage: WorkflowStage,
    },

    /// `configure` has not succeeded yet
    #[error("workflow is not configured")]
    NotConfigured,

    /// A database connectivity check failed during `configure`
    #[error("{endpoint} database is unreachable: {source}")]
    Connectivity {
        /// `source` or `destination`
        endpoint: &'static str,
        /// Gateway failure
        #[source]
        source: GatewayError,
    },

    /// The advisory health check failed during `configure`
    #[error("advisory is unreachable: {0}")]
    Advisory(#[from] AdvisoryError),

    /// Settings rejected
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    /// Persistence failed
    #[error("session store error: {0}")]
    Store(#[from] StoreError),

    /// Internal transition bug surfaced as an error
    #[error(transparent)]
    Transition(#[from] StateMachineError),
}

impl WorkflowError {
    /// Shared classification
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidState { .. } | Self::NotConfigured | Self::Transition(_) => {
                ErrorKind::InvalidState
            }
            Self::Connectivity { source, .. } => source.kind(),
            Self::Advisory(e) => e.kind(),
            Self::InvalidSettings(_) => ErrorKind::Configuration,
            Self::Store(_) => ErrorKind::Storage,
        }
    }

    /// Whether repeating the same command later may succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connectivity { source, .. } => source.is_retryable(),
            Self::Advisory(_) | Self::Store(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        let err = WorkflowError::InvalidState {
            command: "approve",
            stage: WorkflowStage::Executing,
        };
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(
            err.to_string(),
            "`approve` is not valid while the workflow is executing"
        );

        let err = WorkflowError::Connectivity {
            endpoint: "source",
            source: GatewayError::Connectivity("refused".into()),
        };
        assert_eq!(err.kind(), ErrorKind::Connectivity);
        assert!(err.is_retryable());
    }
}
