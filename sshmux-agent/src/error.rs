//! Error types for backend dispatch.

use std::fmt;

use ssh_agent_lib::error::AgentError;
use sshmux_core::{ConfigError, SelectorError};

#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("failed to connect to agent {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("agent protocol error: {0}")]
    Agent(#[from] AgentError),

    #[error("agent {0} is not connected")]
    Disconnected(String),

    #[error("add functionality disabled: no add-target specified")]
    AddDisabled,

    #[error("multiple add-targets but no select-target-command configured")]
    NoSelector,

    #[error("not found for suitable signer")]
    NoSigner,

    #[error("agent extension unsupported")]
    Unsupported,

    #[error("unexpected agent response: {0}")]
    UnexpectedResponse(String),

    #[error(transparent)]
    Selector(#[from] SelectorError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

/// One backend's failure within a fan-out.
#[derive(Debug)]
pub struct BackendFailure {
    pub backend: String,
    pub error: MuxError,
}

/// Per-backend failures collected during a fan-out.
///
/// Nothing is discarded: every failing backend keeps its own entry.
#[derive(Debug, Default)]
pub struct AggregateError {
    failures: Vec<BackendFailure>,
    attempted: usize,
}

impl AggregateError {
    /// Record how many backends the fan-out reached.
    pub fn with_attempted(mut self, attempted: usize) -> Self {
        self.attempted = attempted;
        self
    }

    /// True when there were backends to call and none of them succeeded.
    pub fn all_failed(&self) -> bool {
        !self.failures.is_empty() && self.failures.len() >= self.attempted
    }

    pub fn push(&mut self, backend: impl Into<String>, error: MuxError) {
        self.failures.push(BackendFailure {
            backend: backend.into(),
            error,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn failures(&self) -> &[BackendFailure] {
        &self.failures
    }

    /// `Ok(())` when no backend failed, otherwise the aggregate as an error.
    pub fn into_result(self) -> Result<(), MuxError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(MuxError::Aggregate(self))
        }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} backend(s) failed", self.failures.len())?;
        for (i, failure) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{}: {}", failure.backend, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

/// Result of a continue-on-error fan-out: whatever the healthy backends
/// returned, plus the failures of the rest.
#[derive(Debug)]
pub struct FanOut<T> {
    pub items: Vec<T>,
    pub errors: AggregateError,
}

impl<T> FanOut<T> {
    /// Strict view: the items only if every backend succeeded.
    pub fn into_result(self) -> Result<Vec<T>, MuxError> {
        self.errors.into_result()?;
        Ok(self.items)
    }
}
