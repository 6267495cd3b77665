//! Add-target selection protocol.
//!
//! When a key is added and more than one add-target is configured, an
//! external selector process picks the destination.  The contract:
//!
//! - `SSH_AGENT_MUX_TARGETS` holds the add-target addresses, one per line.
//! - `SSH_AGENT_MUX_KEY_INFO` holds
//!   `COMMENT=<comment>;TYPE=<key type>;FINGERPRINT_SHA256=<fingerprint>`.
//! - The process prints exactly one of the listed addresses on stdout and
//!   exits 0, or exits non-zero with a diagnostic on stderr.
//!
//! The command string is run through `sh -c` with stdin closed.

use std::process::{ExitStatus, Stdio};

use tokio::process::Command;
use tracing::debug;

pub const TARGETS_ENV: &str = "SSH_AGENT_MUX_TARGETS";
pub const KEY_INFO_ENV: &str = "SSH_AGENT_MUX_KEY_INFO";

/// Placeholder for key type / fingerprint when no public key is derivable.
pub const UNKNOWN: &str = "unknown";

/// Metadata about the key being added, as exposed to the selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    pub comment: String,
    pub key_type: String,
    pub fingerprint: String,
}

impl KeyInfo {
    /// Key info for material whose public half could not be derived.
    pub fn unknown(comment: impl Into<String>) -> Self {
        Self {
            comment: comment.into(),
            key_type: UNKNOWN.to_string(),
            fingerprint: UNKNOWN.to_string(),
        }
    }

    /// The `SSH_AGENT_MUX_KEY_INFO` value.
    pub fn to_env_value(&self) -> String {
        format!(
            "COMMENT={};TYPE={};FINGERPRINT_SHA256={}",
            self.comment, self.key_type, self.fingerprint
        )
    }
}

#[derive(Debug, Clone)]
pub struct SelectionRequest {
    /// Add-target addresses, in configured order.
    pub targets: Vec<String>,
    pub key: KeyInfo,
}

impl SelectionRequest {
    /// The `SSH_AGENT_MUX_TARGETS` value.
    pub fn targets_env_value(&self) -> String {
        self.targets.join("\n")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SelectorError {
    #[error("failed to launch selector '{command}': {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("selector exited with {status}: {stderr}")]
    Failed { status: ExitStatus, stderr: String },

    #[error("selector returned empty output")]
    EmptyOutput,

    #[error("selector returned an invalid target path: '{0}'")]
    InvalidTarget(String),
}

/// Run `command` and return the add-target address it selected.
///
/// The returned address is always one of `request.targets`.
pub async fn select_target(
    command: &str,
    request: &SelectionRequest,
) -> Result<String, SelectorError> {
    debug!(
        command,
        targets = request.targets.len(),
        fingerprint = %request.key.fingerprint,
        "running selector"
    );

    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .env(TARGETS_ENV, request.targets_env_value())
        .env(KEY_INFO_ENV, request.key.to_env_value())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| SelectorError::Launch {
            command: command.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(SelectorError::Failed {
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let selected = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if selected.is_empty() {
        return Err(SelectorError::EmptyOutput);
    }
    if !request.targets.iter().any(|t| *t == selected) {
        return Err(SelectorError::InvalidTarget(selected));
    }

    debug!(target = %selected, "selector chose add-target");
    Ok(selected)
}
