//! Error types for the SMcli provisioner
//!
//! Provides structured error types for the SAN client, the command executor,
//! the provisioner adapter and the claim controller.

use std::time::Duration;
use thiserror::Error;

use crate::domain::ports::RollbackOutcome;

/// Unified error type for the provisioner
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Request Errors
    // =========================================================================
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Capacity parse error: {0}")]
    CapacityParse(String),

    // =========================================================================
    // SAN Errors
    // =========================================================================
    #[error("SMcli statement `{statement}` failed with exit code {exit_code}: {message}")]
    VendorFailure {
        statement: String,
        exit_code: i32,
        message: String,
    },

    #[error("No free LUN left in host group {group} ({rollback})")]
    AllocationExhausted {
        group: String,
        rollback: RollbackOutcome,
    },

    // =========================================================================
    // Command Execution Errors
    // =========================================================================
    #[error("Failed to launch {program}: {source}")]
    ProcessLaunch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} did not finish within {timeout:?}")]
    CommandTimeout { program: String, timeout: Duration },

    #[error("Command cancelled")]
    Cancelled,

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error while handling a claim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry with exponential backoff
    RequeueWithBackoff,
    /// Retry after specific duration
    RequeueAfter(Duration),
    /// Don't retry, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Appliance or API hiccups
            Error::VendorFailure { .. } | Error::CommandTimeout { .. } | Error::Kube(_) => {
                ErrorAction::RequeueWithBackoff
            }

            // A LUN may be released by a concurrent delete
            Error::AllocationExhausted { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(60))
            }

            // Retrying cannot change the outcome
            Error::Validation(_)
            | Error::CapacityParse(_)
            | Error::Configuration(_)
            | Error::ProcessLaunch { .. }
            | Error::Cancelled => ErrorAction::NoRequeue,

            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }
}

/// Result type alias for the provisioner
pub type Result<T> = std::result::Result<T, Error>;
