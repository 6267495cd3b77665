//! Downstream SSH agent session and listener.

use std::io;
use std::os::unix::fs::{DirBuilderExt as _, PermissionsExt as _};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use ssh_agent_lib::agent::{Session, listen};
use ssh_agent_lib::error::AgentError;
use ssh_agent_lib::proto::{
    AddIdentity, AddIdentityConstrained, Extension, Identity, RemoveIdentity, SignRequest,
};
use ssh_key::Signature;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::error::MuxError;
use crate::mux::Multiplexer;

/// Top-level SSH agent.  Cloned per incoming connection by `ssh_agent_lib`;
/// every clone dispatches through the same [`Multiplexer`].
#[derive(Clone, Debug)]
pub struct SshAgent {
    mux: Arc<Multiplexer>,
    socket_path: PathBuf,
}

impl SshAgent {
    pub fn new(mux: Arc<Multiplexer>, socket_path: PathBuf) -> Self {
        Self { mux, socket_path }
    }

    /// Bind the Unix socket and start accepting connections.
    ///
    /// A socket file left behind by a previous run is replaced.
    pub async fn listen(self) -> anyhow::Result<()> {
        if let Some(parent) = self.socket_path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(parent)
                .with_context(|| format!("create socket directory {parent:?}"))?;
        }

        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => debug!(path = ?self.socket_path, "removed stale agent socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("remove stale socket {:?}", self.socket_path));
            }
        }

        let listener = tokio::net::UnixListener::bind(&self.socket_path)
            .with_context(|| format!("bind SSH agent socket {:?}", self.socket_path))?;

        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("chmod 0600 {:?}", self.socket_path))?;

        info!(path = ?self.socket_path, "SSH agent listening");
        listen(listener, self).await.context("SSH agent listener")
    }
}

fn agent_err(e: MuxError) -> AgentError {
    AgentError::other(io::Error::other(e.to_string()))
}

/// Broadcasts are best-effort: partial failure is logged and reported as
/// success, but a broadcast that no backend honoured fails.
fn broadcast_outcome(op: &'static str, result: Result<(), MuxError>) -> Result<(), AgentError> {
    match result {
        Ok(()) => Ok(()),
        Err(MuxError::Aggregate(errors)) if errors.all_failed() => {
            warn!(op, error = %errors, "no backend completed the request");
            Err(agent_err(MuxError::Aggregate(errors)))
        }
        Err(e) => {
            warn!(op, error = %e, "request incomplete");
            Ok(())
        }
    }
}

#[ssh_agent_lib::async_trait]
impl Session for SshAgent {
    async fn request_identities(&mut self) -> Result<Vec<Identity>, AgentError> {
        let listed = self.mux.list().await;
        if !listed.errors.is_empty() {
            warn!(error = %listed.errors, "some backends failed to list identities");
        }
        debug!(count = listed.items.len(), "request_identities");
        Ok(listed.items)
    }

    async fn sign(&mut self, request: SignRequest) -> Result<Signature, AgentError> {
        let result = if request.flags == 0 {
            self.mux.sign(&request.pubkey, &request.data).await
        } else {
            self.mux
                .sign_with_flags(&request.pubkey, &request.data, request.flags)
                .await
        };
        result.map_err(|e| {
            debug!(error = %e, flags = request.flags, "sign failed");
            agent_err(e)
        })
    }

    async fn add_identity(&mut self, identity: AddIdentity) -> Result<(), AgentError> {
        self.mux.add(identity, Vec::new()).await.map_err(|e| {
            warn!(error = %e, "add_identity failed");
            agent_err(e)
        })
    }

    async fn add_identity_constrained(
        &mut self,
        request: AddIdentityConstrained,
    ) -> Result<(), AgentError> {
        let AddIdentityConstrained {
            identity,
            constraints,
        } = request;
        self.mux.add(identity, constraints).await.map_err(|e| {
            warn!(error = %e, "add_identity_constrained failed");
            agent_err(e)
        })
    }

    async fn remove_identity(&mut self, request: RemoveIdentity) -> Result<(), AgentError> {
        self.mux.remove(&request.pubkey).await.map_err(|e| {
            warn!(error = %e, "remove_identity failed");
            agent_err(e)
        })
    }

    async fn remove_all_identities(&mut self) -> Result<(), AgentError> {
        broadcast_outcome("remove_all_identities", self.mux.remove_all().await)
    }

    async fn lock(&mut self, key: String) -> Result<(), AgentError> {
        let key = Zeroizing::new(key);
        broadcast_outcome("lock", self.mux.lock(&key).await)
    }

    async fn unlock(&mut self, key: String) -> Result<(), AgentError> {
        let key = Zeroizing::new(key);
        broadcast_outcome("unlock", self.mux.unlock(&key).await)
    }

    async fn extension(&mut self, extension: Extension) -> Result<Option<Extension>, AgentError> {
        let name = extension.name.clone();
        self.mux.extension(extension).await.map_err(|e| {
            debug!(name = %name, error = %e, "extension not handled");
            agent_err(e)
        })
    }
}
