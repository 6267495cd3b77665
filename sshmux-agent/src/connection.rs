//! Resilient client of one upstream agent socket.
//!
//! Every call is first tried on the current upstream session.  On failure
//! the session is dropped and re-dialled, then the call is retried, up to
//! [`MAX_ATTEMPTS`] times in total.  A failed re-dial is not reported on its
//! own; the next attempt surfaces it as a disconnected-agent error.
//!
//! The session slot sits behind a per-connection mutex, so calls on the same
//! connection are serialized and at most one re-dial is in flight.  This lock
//! is always taken *inside* the multiplexer's read lock, never around it.

use std::fmt;
use std::sync::Arc;

use ssh_agent_lib::agent::Session;
use ssh_agent_lib::client::Client;
use ssh_agent_lib::error::AgentError;
use ssh_agent_lib::proto::{
    AddIdentity, AddIdentityConstrained, Extension, Identity, KeyConstraint, RemoveIdentity,
    Request, Response, SignRequest,
};
use ssh_key::public::KeyData;
use ssh_key::Signature;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::backend::{Backend, BoxFuture};
use crate::error::MuxError;

/// Attempts per call before the last error is returned.
pub const MAX_ATTEMPTS: usize = 3;

pub type AgentSession = Box<dyn Session>;

/// Establishes upstream agent sessions.
#[async_trait::async_trait]
pub trait Dialer: Send + Sync + fmt::Debug {
    async fn dial(&self, address: &str) -> Result<AgentSession, MuxError>;
}

/// Dials upstream agents over Unix domain sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixDialer;

#[async_trait::async_trait]
impl Dialer for UnixDialer {
    async fn dial(&self, address: &str) -> Result<AgentSession, MuxError> {
        let stream = UnixStream::connect(address)
            .await
            .map_err(|source| MuxError::Connect {
                address: address.to_string(),
                source,
            })?;
        Ok(Box::new(Client::new(stream)))
    }
}

pub struct BackendConnection {
    address: String,
    dialer: Arc<dyn Dialer>,
    session: Mutex<Option<AgentSession>>,
    max_attempts: usize,
}

impl fmt::Debug for BackendConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConnection")
            .field("address", &self.address)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl BackendConnection {
    /// Dial `address` once.  A connection that never connected does not
    /// exist: the dial error is returned and no value is built.
    pub async fn connect(
        address: impl Into<String>,
        dialer: Arc<dyn Dialer>,
    ) -> Result<Self, MuxError> {
        let address = address.into();
        let session = dialer.dial(&address).await?;
        debug!(backend = %address, "connected to upstream agent");
        Ok(Self {
            address,
            dialer,
            session: Mutex::new(Some(session)),
            max_attempts: MAX_ATTEMPTS,
        })
    }

    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    async fn redial(&self, slot: &mut Option<AgentSession>) {
        *slot = None;
        match self.dialer.dial(&self.address).await {
            Ok(session) => *slot = Some(session),
            Err(e) => debug!(backend = %self.address, error = %e, "reconnect failed"),
        }
    }

    async fn call<T, F>(&self, op: &'static str, mut f: F) -> Result<T, MuxError>
    where
        T: Send,
        F: for<'a> FnMut(&'a mut (dyn Session + 'static)) -> BoxFuture<'a, Result<T, AgentError>>
            + Send,
    {
        let mut slot = self.session.lock().await;
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            let result = match slot.as_deref_mut() {
                Some(session) => f(session).await.map_err(MuxError::from),
                None => Err(MuxError::Disconnected(self.address.clone())),
            };

            match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(backend = %self.address, op, attempt, "backend call recovered");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    debug!(backend = %self.address, op, attempt, error = %e, "backend call failed, reconnecting");
                    last_error = Some(e);
                    self.redial(&mut slot).await;
                }
            }
        }

        let error = last_error.unwrap_or_else(|| MuxError::Disconnected(self.address.clone()));
        warn!(
            backend = %self.address,
            op,
            attempts = self.max_attempts,
            error = %error,
            "backend call failed after all attempts"
        );
        Err(error)
    }

    fn sign_request(key: &KeyData, data: &[u8], flags: u32) -> SignRequest {
        SignRequest {
            pubkey: key.clone(),
            data: data.to_vec(),
            flags,
        }
    }
}

#[async_trait::async_trait]
impl Backend for BackendConnection {
    fn address(&self) -> &str {
        &self.address
    }

    async fn list(&self) -> Result<Vec<Identity>, MuxError> {
        self.call("list", |s| s.request_identities()).await
    }

    async fn sign(&self, key: &KeyData, data: &[u8]) -> Result<Signature, MuxError> {
        self.call("sign", |s| s.sign(Self::sign_request(key, data, 0))).await
    }

    async fn sign_with_flags(
        &self,
        key: &KeyData,
        data: &[u8],
        flags: u32,
    ) -> Result<Signature, MuxError> {
        // Sent raw: a failure reply means the flags were refused, not a
        // broken connection, so it is not retried.
        let response = self
            .call("sign_with_flags", |s| {
                s.handle(Request::SignRequest(Self::sign_request(key, data, flags)))
            })
            .await?;
        match response {
            Response::SignResponse(signature) => Ok(signature),
            Response::Failure => Err(MuxError::Unsupported),
            other => Err(MuxError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    async fn add(
        &self,
        identity: AddIdentity,
        constraints: Vec<KeyConstraint>,
    ) -> Result<(), MuxError> {
        if constraints.is_empty() {
            self.call("add", |s| s.add_identity(identity.clone())).await
        } else {
            self.call("add_constrained", |s| {
                s.add_identity_constrained(AddIdentityConstrained {
                    identity: identity.clone(),
                    constraints: constraints.clone(),
                })
            })
            .await
        }
    }

    async fn remove(&self, key: &KeyData) -> Result<(), MuxError> {
        self.call("remove", |s| {
            s.remove_identity(RemoveIdentity {
                pubkey: key.clone(),
            })
        })
        .await
    }

    async fn remove_all(&self) -> Result<(), MuxError> {
        self.call("remove_all", |s| s.remove_all_identities()).await
    }

    async fn lock(&self, passphrase: &str) -> Result<(), MuxError> {
        self.call("lock", |s| s.lock(passphrase.to_string())).await
    }

    async fn unlock(&self, passphrase: &str) -> Result<(), MuxError> {
        self.call("unlock", |s| s.unlock(passphrase.to_string())).await
    }

    async fn extension(&self, extension: Extension) -> Result<Option<Extension>, MuxError> {
        // Sent raw so a plain failure reply can be told apart from I/O errors.
        let response = self
            .call("extension", |s| s.handle(Request::Extension(extension.clone())))
            .await?;
        match response {
            Response::Success => Ok(None),
            Response::ExtensionResponse(reply) => Ok(Some(reply)),
            Response::Failure => Err(MuxError::Unsupported),
            other => Err(MuxError::UnexpectedResponse(format!("{other:?}"))),
        }
    }
}
