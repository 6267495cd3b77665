//! The capability set every upstream agent exposes to the multiplexer.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use ssh_agent_lib::proto::{AddIdentity, Extension, Identity, KeyConstraint};
use ssh_key::public::KeyData;
use ssh_key::Signature;

use crate::error::MuxError;

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One upstream SSH agent.
///
/// [`Multiplexer`](crate::mux::Multiplexer) only ever talks to backends
/// through this trait; [`BackendConnection`](crate::connection::BackendConnection)
/// is the production implementation.
#[async_trait::async_trait]
pub trait Backend: Send + Sync + fmt::Debug {
    /// Upstream address (socket path) this backend was configured with.
    fn address(&self) -> &str;

    async fn list(&self) -> Result<Vec<Identity>, MuxError>;

    /// Public keys this backend can sign with.
    async fn signers(&self) -> Result<Vec<KeyData>, MuxError> {
        Ok(self.list().await?.into_iter().map(|id| id.pubkey).collect())
    }

    async fn sign(&self, key: &KeyData, data: &[u8]) -> Result<Signature, MuxError>;

    /// Sign with agent signature flags (e.g. `rsa-sha2-256`).
    ///
    /// Returns [`MuxError::Unsupported`] when the backend cannot honour the
    /// flags, so the caller may try another owner of the same key.
    async fn sign_with_flags(
        &self,
        key: &KeyData,
        data: &[u8],
        flags: u32,
    ) -> Result<Signature, MuxError>;

    async fn add(
        &self,
        identity: AddIdentity,
        constraints: Vec<KeyConstraint>,
    ) -> Result<(), MuxError>;

    async fn remove(&self, key: &KeyData) -> Result<(), MuxError>;

    async fn remove_all(&self) -> Result<(), MuxError>;

    async fn lock(&self, passphrase: &str) -> Result<(), MuxError>;

    async fn unlock(&self, passphrase: &str) -> Result<(), MuxError>;

    /// Forward a protocol extension.  [`MuxError::Unsupported`] means the
    /// upstream agent does not implement it.
    async fn extension(&self, extension: Extension) -> Result<Option<Extension>, MuxError>;
}
