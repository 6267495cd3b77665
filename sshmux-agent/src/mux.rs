//! The multiplexer: one logical agent over many upstream backends.
//!
//! Read operations fan out to every backend, add-targets first and
//! read-targets second.  Sign and remove are routed to the backend that
//! reports the key.  Add goes to the single add-target, or to the one an
//! external selector picks when there are several.
//!
//! The backend lists and the selector command live together behind one
//! `RwLock`.  Every dispatch holds the read lock for its whole duration
//! (including a selector run); [`Multiplexer::update`] swaps all three under
//! the write lock.  Backends are shared `Arc`s, so dispatches that started
//! before an update finish against the old instances.

use std::sync::Arc;

use ssh_agent_lib::proto::{AddIdentity, Extension, Identity, KeyConstraint};
use ssh_key::Signature;
use ssh_key::public::KeyData;
use sshmux_core::selector::{self, SelectionRequest, SelectorError};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BoxFuture};
use crate::error::{AggregateError, FanOut, MuxError};
use crate::keyinfo::key_info;

pub type BackendRef = Arc<dyn Backend>;

#[derive(Debug, Default)]
struct Targets {
    read_targets: Vec<BackendRef>,
    add_targets: Vec<BackendRef>,
    selector_command: String,
}

impl Targets {
    fn all(&self) -> impl Iterator<Item = &BackendRef> {
        self.add_targets.iter().chain(self.read_targets.iter())
    }

    /// Every (public key, owning backend) pair in fan-out order.  Backends
    /// that fail to enumerate are left out.
    async fn key_owners(&self) -> Vec<(KeyData, &BackendRef)> {
        let mut owners = Vec::new();
        for backend in self.all() {
            match backend.signers().await {
                Ok(keys) => owners.extend(keys.into_iter().map(|key| (key, backend))),
                Err(e) => {
                    debug!(backend = %backend.address(), error = %e, "skipping backend for key routing");
                }
            }
        }
        owners
    }

    /// Run `f` against every backend regardless of individual failures.
    async fn broadcast<'a, F>(&'a self, op: &'static str, f: F) -> Result<(), MuxError>
    where
        F: Fn(&'a dyn Backend) -> BoxFuture<'a, Result<(), MuxError>>,
    {
        let mut errors = AggregateError::default();
        let mut attempted = 0;
        for backend in self.all() {
            attempted += 1;
            if let Err(e) = f(&**backend).await {
                warn!(backend = %backend.address(), op, error = %e, "backend failed during broadcast");
                errors.push(backend.address(), e);
            }
        }
        errors.with_attempted(attempted).into_result()
    }
}

#[derive(Debug, Default)]
pub struct Multiplexer {
    targets: RwLock<Targets>,
}

impl Multiplexer {
    pub fn new(
        read_targets: Vec<BackendRef>,
        add_targets: Vec<BackendRef>,
        selector_command: impl Into<String>,
    ) -> Self {
        Self {
            targets: RwLock::new(Targets {
                read_targets,
                add_targets,
                selector_command: selector_command.into(),
            }),
        }
    }

    /// Atomically replace the backend lists and the selector command.
    ///
    /// The new backends must already be connected; this never does I/O.
    pub async fn update(
        &self,
        read_targets: Vec<BackendRef>,
        add_targets: Vec<BackendRef>,
        selector_command: impl Into<String>,
    ) {
        let replacement = Targets {
            read_targets,
            add_targets,
            selector_command: selector_command.into(),
        };
        let mut targets = self.targets.write().await;
        *targets = replacement;
        debug!(
            read_targets = targets.read_targets.len(),
            add_targets = targets.add_targets.len(),
            "backend set replaced"
        );
    }

    pub async fn read_target_addresses(&self) -> Vec<String> {
        let targets = self.targets.read().await;
        targets.read_targets.iter().map(|b| b.address().to_string()).collect()
    }

    pub async fn add_target_addresses(&self) -> Vec<String> {
        let targets = self.targets.read().await;
        targets.add_targets.iter().map(|b| b.address().to_string()).collect()
    }

    pub async fn selector_command(&self) -> String {
        self.targets.read().await.selector_command.clone()
    }

    /// Identities of every backend, concatenated in fan-out order.
    pub async fn list(&self) -> FanOut<Identity> {
        let targets = self.targets.read().await;
        let mut out = FanOut {
            items: Vec::new(),
            errors: AggregateError::default(),
        };
        for backend in targets.all() {
            match backend.list().await {
                Ok(identities) => out.items.extend(identities),
                Err(e) => out.errors.push(backend.address(), e),
            }
        }
        out
    }

    /// Signing keys of every backend, concatenated in fan-out order.
    pub async fn signers(&self) -> FanOut<KeyData> {
        let targets = self.targets.read().await;
        let mut out = FanOut {
            items: Vec::new(),
            errors: AggregateError::default(),
        };
        for backend in targets.all() {
            match backend.signers().await {
                Ok(keys) => out.items.extend(keys),
                Err(e) => out.errors.push(backend.address(), e),
            }
        }
        out
    }

    /// Sign with the first backend that reports `key`.  Its error is final.
    pub async fn sign(&self, key: &KeyData, data: &[u8]) -> Result<Signature, MuxError> {
        let targets = self.targets.read().await;
        let owners = targets.key_owners().await;
        let (_, backend) = owners
            .iter()
            .find(|(owned, _)| owned == key)
            .ok_or(MuxError::NoSigner)?;

        debug!(backend = %backend.address(), data_len = data.len(), "sign");
        backend.sign(key, data).await
    }

    /// Like [`sign`](Self::sign), but an owner that cannot honour `flags`
    /// hands over to the next backend reporting the same key.
    pub async fn sign_with_flags(
        &self,
        key: &KeyData,
        data: &[u8],
        flags: u32,
    ) -> Result<Signature, MuxError> {
        let targets = self.targets.read().await;
        let owners = targets.key_owners().await;

        let mut found = false;
        for (_, backend) in owners.iter().filter(|(owned, _)| owned == key) {
            found = true;
            debug!(backend = %backend.address(), flags, "sign with flags");
            match backend.sign_with_flags(key, data, flags).await {
                Err(MuxError::Unsupported) => {
                    debug!(backend = %backend.address(), flags, "signature flags unsupported, trying next owner");
                }
                result => return result,
            }
        }

        if found {
            Err(MuxError::Unsupported)
        } else {
            Err(MuxError::NoSigner)
        }
    }

    /// Add a key to the add-target chosen by the selection rules.
    pub async fn add(
        &self,
        identity: AddIdentity,
        constraints: Vec<KeyConstraint>,
    ) -> Result<(), MuxError> {
        let targets = self.targets.read().await;

        let backend = match targets.add_targets.as_slice() {
            [] => return Err(MuxError::AddDisabled),
            [only] => only,
            many => {
                if targets.selector_command.trim().is_empty() {
                    return Err(MuxError::NoSelector);
                }
                let request = SelectionRequest {
                    targets: many.iter().map(|b| b.address().to_string()).collect(),
                    key: key_info(&identity),
                };
                let chosen = selector::select_target(&targets.selector_command, &request).await?;
                many.iter()
                    .find(|b| b.address() == chosen)
                    .ok_or_else(|| SelectorError::InvalidTarget(chosen.clone()))?
            }
        };

        info!(backend = %backend.address(), constraints = constraints.len(), "adding key");
        backend.add(identity, constraints).await
    }

    /// Remove `key` from the backend that holds it.  A key nobody holds is
    /// already removed, so that is a success.
    pub async fn remove(&self, key: &KeyData) -> Result<(), MuxError> {
        let targets = self.targets.read().await;
        let owners = targets.key_owners().await;

        match owners.iter().find(|(owned, _)| owned == key) {
            Some((_, backend)) => {
                debug!(backend = %backend.address(), "remove");
                backend.remove(key).await
            }
            None => {
                info!("remove: key not held by any backend, nothing to do");
                Ok(())
            }
        }
    }

    pub async fn remove_all(&self) -> Result<(), MuxError> {
        let targets = self.targets.read().await;
        targets.broadcast("remove_all", |b| b.remove_all()).await
    }

    pub async fn lock(&self, passphrase: &str) -> Result<(), MuxError> {
        let targets = self.targets.read().await;
        targets.broadcast("lock", |b| b.lock(passphrase)).await
    }

    pub async fn unlock(&self, passphrase: &str) -> Result<(), MuxError> {
        let targets = self.targets.read().await;
        targets.broadcast("unlock", |b| b.unlock(passphrase)).await
    }

    /// First backend that understands the extension answers it.
    pub async fn extension(&self, extension: Extension) -> Result<Option<Extension>, MuxError> {
        let targets = self.targets.read().await;
        let mut errors = AggregateError::default();

        for backend in targets.all() {
            match backend.extension(extension.clone()).await {
                Ok(reply) => {
                    debug!(backend = %backend.address(), name = %extension.name, "extension handled");
                    return Ok(reply);
                }
                Err(MuxError::Unsupported) => {}
                Err(e) => errors.push(backend.address(), e),
            }
        }

        if errors.is_empty() {
            Err(MuxError::Unsupported)
        } else {
            Err(MuxError::Aggregate(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use ssh_agent_lib::proto::{Credential, Unparsed};
    use ssh_key::Algorithm;
    use ssh_key::private::{Ed25519Keypair, Ed25519PrivateKey, KeypairData};
    use ssh_key::public::Ed25519PublicKey;
    use tokio::sync::Notify;

    use super::*;

    fn key(n: u8) -> KeyData {
        KeyData::Ed25519(Ed25519PublicKey([n; 32]))
    }

    fn new_identity(n: u8, comment: &str) -> AddIdentity {
        AddIdentity {
            credential: Credential::Key {
                privkey: KeypairData::Ed25519(Ed25519Keypair {
                    public: Ed25519PublicKey([n; 32]),
                    private: Ed25519PrivateKey::from_bytes(&[n; 32]),
                }),
                comment: comment.to_string(),
            },
        }
    }

    fn extension(name: &str) -> Extension {
        Extension {
            name: name.to_string(),
            details: Unparsed::from(Vec::new()),
        }
    }

    #[derive(Debug, Clone, Copy, Default)]
    enum ExtensionMode {
        #[default]
        Unsupported,
        Fail,
        Reply,
    }

    #[derive(Debug, Default)]
    struct FakeBackend {
        address: String,
        keys: Vec<KeyData>,
        fail: bool,
        sign_fails: bool,
        flags_unsupported: bool,
        extension_mode: ExtensionMode,
        /// `list` signals the first `Notify`, then parks until the second fires.
        list_gate: Option<(Arc<Notify>, Arc<Notify>)>,
        calls: Mutex<Vec<&'static str>>,
        added: Mutex<Vec<AddIdentity>>,
    }

    impl FakeBackend {
        fn new(address: &str, keys: Vec<KeyData>) -> Self {
            Self {
                address: address.to_string(),
                keys,
                ..Self::default()
            }
        }

        fn failing(address: &str) -> Self {
            Self {
                fail: true,
                ..Self::new(address, Vec::new())
            }
        }

        fn record(&self, op: &'static str) -> Result<(), MuxError> {
            self.calls.lock().unwrap().push(op);
            if self.fail {
                Err(MuxError::Disconnected(self.address.clone()))
            } else {
                Ok(())
            }
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }

        fn signature(&self) -> Signature {
            Signature::new(Algorithm::Ed25519, vec![self.keys.len() as u8; 64]).unwrap()
        }
    }

    #[async_trait::async_trait]
    impl Backend for FakeBackend {
        fn address(&self) -> &str {
            &self.address
        }

        async fn list(&self) -> Result<Vec<Identity>, MuxError> {
            self.record("list")?;
            if let Some((entered, release)) = &self.list_gate {
                entered.notify_one();
                release.notified().await;
            }
            Ok(self
                .keys
                .iter()
                .map(|k| Identity {
                    pubkey: k.clone(),
                    comment: self.address.clone(),
                })
                .collect())
        }

        async fn sign(&self, _key: &KeyData, _data: &[u8]) -> Result<Signature, MuxError> {
            self.record("sign")?;
            if self.sign_fails {
                return Err(MuxError::Disconnected(self.address.clone()));
            }
            Ok(self.signature())
        }

        async fn sign_with_flags(
            &self,
            _key: &KeyData,
            _data: &[u8],
            _flags: u32,
        ) -> Result<Signature, MuxError> {
            self.record("sign_with_flags")?;
            if self.flags_unsupported {
                return Err(MuxError::Unsupported);
            }
            Ok(self.signature())
        }

        async fn add(
            &self,
            identity: AddIdentity,
            _constraints: Vec<KeyConstraint>,
        ) -> Result<(), MuxError> {
            self.record("add")?;
            self.added.lock().unwrap().push(identity);
            Ok(())
        }

        async fn remove(&self, _key: &KeyData) -> Result<(), MuxError> {
            self.record("remove")
        }

        async fn remove_all(&self) -> Result<(), MuxError> {
            self.record("remove_all")
        }

        async fn lock(&self, _passphrase: &str) -> Result<(), MuxError> {
            self.record("lock")
        }

        async fn unlock(&self, _passphrase: &str) -> Result<(), MuxError> {
            self.record("unlock")
        }

        async fn extension(&self, _extension: Extension) -> Result<Option<Extension>, MuxError> {
            self.calls.lock().unwrap().push("extension");
            match self.extension_mode {
                ExtensionMode::Unsupported => Err(MuxError::Unsupported),
                ExtensionMode::Fail => Err(MuxError::Disconnected(self.address.clone())),
                ExtensionMode::Reply => Ok(Some(extension(&self.address))),
            }
        }
    }

    fn as_ref(backend: &Arc<FakeBackend>) -> BackendRef {
        backend.clone()
    }

    #[tokio::test]
    async fn list_merges_add_targets_first() {
        let read = Arc::new(FakeBackend::new("/tmp/read.sock", vec![key(1)]));
        let add = Arc::new(FakeBackend::new("/tmp/add.sock", vec![key(2), key(3)]));
        let mux = Multiplexer::new(vec![as_ref(&read)], vec![as_ref(&add)], "");

        let fan_out = mux.list().await;
        assert!(fan_out.errors.is_empty());
        let keys: Vec<KeyData> = fan_out.items.into_iter().map(|id| id.pubkey).collect();
        assert_eq!(keys, vec![key(2), key(3), key(1)]);
    }

    #[tokio::test]
    async fn list_continues_past_failing_backend() {
        let broken = Arc::new(FakeBackend::failing("/tmp/broken.sock"));
        let healthy = Arc::new(FakeBackend::new("/tmp/ok.sock", vec![key(1)]));
        let mux = Multiplexer::new(vec![as_ref(&broken), as_ref(&healthy)], Vec::new(), "");

        let fan_out = mux.list().await;
        assert_eq!(fan_out.items.len(), 1);
        assert_eq!(fan_out.items[0].pubkey, key(1));
        assert_eq!(fan_out.errors.len(), 1);
        assert_eq!(fan_out.errors.failures()[0].backend, "/tmp/broken.sock");
        assert_eq!(healthy.calls(), vec!["list"]);

        assert!(matches!(mux.list().await.into_result(), Err(MuxError::Aggregate(_))));
    }

    #[tokio::test]
    async fn signers_fan_out() {
        let a = Arc::new(FakeBackend::new("/tmp/a.sock", vec![key(1)]));
        let b = Arc::new(FakeBackend::new("/tmp/b.sock", vec![key(2)]));
        let mux = Multiplexer::new(vec![as_ref(&a)], vec![as_ref(&b)], "");

        let keys = mux.signers().await.into_result().unwrap();
        assert_eq!(keys, vec![key(2), key(1)]);
    }

    #[tokio::test]
    async fn sign_routes_to_owner() {
        let a = Arc::new(FakeBackend::new("/tmp/a.sock", vec![key(1)]));
        let b = Arc::new(FakeBackend::new("/tmp/b.sock", vec![key(2)]));
        let mux = Multiplexer::new(vec![as_ref(&a), as_ref(&b)], Vec::new(), "");

        mux.sign(&key(2), b"data").await.unwrap();
        assert!(!a.calls().contains(&"sign"));
        assert_eq!(b.calls().iter().filter(|c| **c == "sign").count(), 1);

        mux.sign(&key(1), b"data").await.unwrap();
        assert_eq!(a.calls().iter().filter(|c| **c == "sign").count(), 1);
        assert_eq!(b.calls().iter().filter(|c| **c == "sign").count(), 1);
    }

    #[tokio::test]
    async fn sign_first_owner_wins() {
        let add = Arc::new(FakeBackend::new("/tmp/add.sock", vec![key(1)]));
        let read = Arc::new(FakeBackend::new("/tmp/read.sock", vec![key(1)]));
        let mux = Multiplexer::new(vec![as_ref(&read)], vec![as_ref(&add)], "");

        mux.sign(&key(1), b"data").await.unwrap();
        assert!(add.calls().contains(&"sign"));
        assert!(!read.calls().contains(&"sign"));
    }

    #[tokio::test]
    async fn sign_unknown_key_fails() {
        let a = Arc::new(FakeBackend::new("/tmp/a.sock", vec![key(1)]));
        let mux = Multiplexer::new(vec![as_ref(&a)], Vec::new(), "");

        let err = mux.sign(&key(9), b"data").await.unwrap_err();
        assert!(matches!(err, MuxError::NoSigner));
        assert!(err.to_string().contains("not found for suitable signer"));
        assert!(!a.calls().contains(&"sign"));
    }

    #[tokio::test]
    async fn sign_error_is_not_retried_elsewhere() {
        let owner = Arc::new(FakeBackend {
            sign_fails: true,
            ..FakeBackend::new("/tmp/a.sock", vec![key(1)])
        });
        let other = Arc::new(FakeBackend::new("/tmp/b.sock", vec![key(1)]));
        let mux = Multiplexer::new(vec![as_ref(&owner), as_ref(&other)], Vec::new(), "");

        let err = mux.sign(&key(1), b"data").await.unwrap_err();
        assert!(matches!(err, MuxError::Disconnected(ref a) if a == "/tmp/a.sock"));
        assert!(owner.calls().contains(&"sign"));
        assert!(!other.calls().contains(&"sign"));
    }

    #[tokio::test]
    async fn sign_with_flags_skips_unsupported_owner() {
        let legacy = Arc::new(FakeBackend {
            flags_unsupported: true,
            ..FakeBackend::new("/tmp/legacy.sock", vec![key(1)])
        });
        let modern = Arc::new(FakeBackend::new("/tmp/modern.sock", vec![key(1)]));
        let mux = Multiplexer::new(vec![as_ref(&legacy), as_ref(&modern)], Vec::new(), "");

        mux.sign_with_flags(&key(1), b"data", 2).await.unwrap();
        assert!(legacy.calls().contains(&"sign_with_flags"));
        assert!(modern.calls().contains(&"sign_with_flags"));

        let err = mux.sign_with_flags(&key(9), b"data", 2).await.unwrap_err();
        assert!(matches!(err, MuxError::NoSigner));
    }

    #[tokio::test]
    async fn sign_with_flags_unsupported_everywhere() {
        let legacy = Arc::new(FakeBackend {
            flags_unsupported: true,
            ..FakeBackend::new("/tmp/legacy.sock", vec![key(1)])
        });
        let mux = Multiplexer::new(vec![as_ref(&legacy)], Vec::new(), "");

        let err = mux.sign_with_flags(&key(1), b"data", 4).await.unwrap_err();
        assert!(matches!(err, MuxError::Unsupported));
    }

    #[tokio::test]
    async fn remove_unowned_key_succeeds() {
        let a = Arc::new(FakeBackend::new("/tmp/a.sock", vec![key(1)]));
        let mux = Multiplexer::new(vec![as_ref(&a)], Vec::new(), "");

        mux.remove(&key(9)).await.unwrap();
        assert!(!a.calls().contains(&"remove"));
    }

    #[tokio::test]
    async fn remove_routes_to_owner() {
        let a = Arc::new(FakeBackend::new("/tmp/a.sock", vec![key(1)]));
        let b = Arc::new(FakeBackend::new("/tmp/b.sock", vec![key(2)]));
        let mux = Multiplexer::new(vec![as_ref(&a)], vec![as_ref(&b)], "");

        mux.remove(&key(1)).await.unwrap();
        assert!(a.calls().contains(&"remove"));
        assert!(!b.calls().contains(&"remove"));
    }

    #[tokio::test]
    async fn add_without_targets_is_disabled() {
        let read = Arc::new(FakeBackend::new("/tmp/read.sock", Vec::new()));
        let mux = Multiplexer::new(vec![as_ref(&read)], Vec::new(), "");

        let err = mux.add(new_identity(1, "k"), Vec::new()).await.unwrap_err();
        assert!(matches!(err, MuxError::AddDisabled));
        assert!(err.to_string().contains("add functionality disabled"));
        assert!(read.calls().is_empty());
    }

    #[tokio::test]
    async fn add_single_target_skips_selector() {
        let add = Arc::new(FakeBackend::new("/tmp/add.sock", Vec::new()));
        // A selector that would fail if it were run.
        let mux = Multiplexer::new(Vec::new(), vec![as_ref(&add)], "exit 1");

        mux.add(new_identity(1, "k"), Vec::new()).await.unwrap();
        assert_eq!(add.calls(), vec!["add"]);
    }

    #[tokio::test]
    async fn add_multiple_targets_without_selector_fails() {
        let a = Arc::new(FakeBackend::new("/tmp/a.sock", Vec::new()));
        let b = Arc::new(FakeBackend::new("/tmp/b.sock", Vec::new()));
        let mux = Multiplexer::new(Vec::new(), vec![as_ref(&a), as_ref(&b)], "");

        let err = mux.add(new_identity(1, "k"), Vec::new()).await.unwrap_err();
        assert!(matches!(err, MuxError::NoSelector));
        assert!(err.to_string().contains("no select-target-command configured"));
        assert!(a.calls().is_empty());
        assert!(b.calls().is_empty());
    }

    #[tokio::test]
    async fn add_uses_selected_target() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join("env");
        let a = Arc::new(FakeBackend::new("/tmp/a.sock", Vec::new()));
        let b = Arc::new(FakeBackend::new("/tmp/b.sock", Vec::new()));
        let command = format!(
            "printf '%s|%s' \"$SSH_AGENT_MUX_TARGETS\" \"$SSH_AGENT_MUX_KEY_INFO\" > '{}'; echo /tmp/b.sock",
            env_file.display()
        );
        let mux = Multiplexer::new(Vec::new(), vec![as_ref(&a), as_ref(&b)], command);

        let identity = new_identity(5, "laptop");
        let expected = key_info(&identity);
        mux.add(identity, Vec::new()).await.unwrap();

        assert!(a.calls().is_empty());
        assert_eq!(b.calls(), vec!["add"]);
        let added = b.added.lock().unwrap();
        assert_eq!(key_info(&added[0]), expected);

        let env = std::fs::read_to_string(&env_file).unwrap();
        assert_eq!(
            env,
            format!(
                "/tmp/a.sock\n/tmp/b.sock|COMMENT=laptop;TYPE=ssh-ed25519;FINGERPRINT_SHA256={}",
                expected.fingerprint
            )
        );
    }

    #[tokio::test]
    async fn add_rejects_bad_selector_output() {
        let a = Arc::new(FakeBackend::new("/tmp/a.sock", Vec::new()));
        let b = Arc::new(FakeBackend::new("/tmp/b.sock", Vec::new()));
        let cases = [
            ("echo /tmp/other.sock", "returned an invalid target path"),
            ("printf '   \\n'", "returned empty output"),
            ("echo 'no agent picked' >&2; exit 2", "no agent picked"),
        ];

        for (command, expected) in cases {
            let mux = Multiplexer::new(Vec::new(), vec![as_ref(&a), as_ref(&b)], command);
            let err = mux.add(new_identity(1, "k"), Vec::new()).await.unwrap_err();
            assert!(
                err.to_string().contains(expected),
                "{command}: {err} should contain {expected}"
            );
        }
        assert!(a.calls().is_empty());
        assert!(b.calls().is_empty());
    }

    #[tokio::test]
    async fn lock_reaches_every_backend() {
        let broken = Arc::new(FakeBackend::failing("/tmp/broken.sock"));
        let healthy = Arc::new(FakeBackend::new("/tmp/ok.sock", Vec::new()));
        let mux = Multiplexer::new(vec![as_ref(&healthy)], vec![as_ref(&broken)], "");

        let err = mux.lock("secret").await.unwrap_err();
        assert!(matches!(err, MuxError::Aggregate(ref a) if a.len() == 1 && !a.all_failed()));
        assert_eq!(broken.calls(), vec!["lock"]);
        assert_eq!(healthy.calls(), vec!["lock"]);

        mux.unlock("secret").await.unwrap_err();
        assert_eq!(healthy.calls(), vec!["lock", "unlock"]);

        mux.remove_all().await.unwrap_err();
        assert_eq!(healthy.calls(), vec!["lock", "unlock", "remove_all"]);
    }

    #[tokio::test]
    async fn broadcast_reports_total_failure() {
        let a = Arc::new(FakeBackend::failing("/tmp/a.sock"));
        let b = Arc::new(FakeBackend::failing("/tmp/b.sock"));
        let mux = Multiplexer::new(vec![as_ref(&a)], vec![as_ref(&b)], "");

        let err = mux.lock("secret").await.unwrap_err();
        assert!(matches!(err, MuxError::Aggregate(ref agg) if agg.all_failed()));
    }

    #[tokio::test]
    async fn broadcast_succeeds_when_all_succeed() {
        let a = Arc::new(FakeBackend::new("/tmp/a.sock", Vec::new()));
        let b = Arc::new(FakeBackend::new("/tmp/b.sock", Vec::new()));
        let mux = Multiplexer::new(vec![as_ref(&a)], vec![as_ref(&b)], "");

        mux.lock("pw").await.unwrap();
        mux.unlock("pw").await.unwrap();
        mux.remove_all().await.unwrap();
        assert_eq!(a.calls(), vec!["lock", "unlock", "remove_all"]);
    }

    #[tokio::test]
    async fn extension_first_responder_wins() {
        let skip = Arc::new(FakeBackend::new("/tmp/skip.sock", Vec::new()));
        let first = Arc::new(FakeBackend {
            extension_mode: ExtensionMode::Reply,
            ..FakeBackend::new("/tmp/first.sock", Vec::new())
        });
        let second = Arc::new(FakeBackend {
            extension_mode: ExtensionMode::Reply,
            ..FakeBackend::new("/tmp/second.sock", Vec::new())
        });
        let mux = Multiplexer::new(
            vec![as_ref(&first), as_ref(&second)],
            vec![as_ref(&skip)],
            "",
        );

        let reply = mux.extension(extension("query")).await.unwrap();
        assert_eq!(reply.map(|e| e.name).as_deref(), Some("/tmp/first.sock"));
        assert_eq!(skip.calls(), vec!["extension"]);
        assert!(second.calls().is_empty());
    }

    #[tokio::test]
    async fn extension_unsupported_everywhere() {
        let a = Arc::new(FakeBackend::new("/tmp/a.sock", Vec::new()));
        let mux = Multiplexer::new(vec![as_ref(&a)], Vec::new(), "");
        assert!(matches!(
            mux.extension(extension("query")).await,
            Err(MuxError::Unsupported)
        ));

        let empty = Multiplexer::default();
        assert!(matches!(
            empty.extension(extension("query")).await,
            Err(MuxError::Unsupported)
        ));
    }

    #[tokio::test]
    async fn extension_reports_real_failures() {
        let unsupported = Arc::new(FakeBackend::new("/tmp/a.sock", Vec::new()));
        let failing = Arc::new(FakeBackend {
            extension_mode: ExtensionMode::Fail,
            ..FakeBackend::new("/tmp/b.sock", Vec::new())
        });
        let mux = Multiplexer::new(vec![as_ref(&unsupported), as_ref(&failing)], Vec::new(), "");

        let err = mux.extension(extension("query")).await.unwrap_err();
        assert!(matches!(err, MuxError::Aggregate(ref a) if a.len() == 1));
    }

    #[tokio::test]
    async fn update_replaces_everything() {
        let old = Arc::new(FakeBackend::new("/tmp/old.sock", vec![key(1)]));
        let mux = Multiplexer::new(vec![as_ref(&old)], Vec::new(), "");

        let read = Arc::new(FakeBackend::new("/tmp/new-read.sock", vec![key(2)]));
        let add_a = Arc::new(FakeBackend::new("/tmp/new-a.sock", Vec::new()));
        let add_b = Arc::new(FakeBackend::new("/tmp/new-b.sock", Vec::new()));
        mux.update(
            vec![as_ref(&read)],
            vec![as_ref(&add_a), as_ref(&add_b)],
            "pick",
        )
        .await;

        assert_eq!(mux.read_target_addresses().await, vec!["/tmp/new-read.sock"]);
        assert_eq!(
            mux.add_target_addresses().await,
            vec!["/tmp/new-a.sock", "/tmp/new-b.sock"]
        );
        assert_eq!(mux.selector_command().await, "pick");

        let keys = mux.signers().await.into_result().unwrap();
        assert_eq!(keys, vec![key(2)]);
        assert!(old.calls().is_empty());
    }

    #[tokio::test]
    async fn in_flight_list_finishes_against_old_backends() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let old = Arc::new(FakeBackend {
            list_gate: Some((Arc::clone(&entered), Arc::clone(&release))),
            ..FakeBackend::new("/tmp/old.sock", vec![key(1)])
        });
        let mux = Arc::new(Multiplexer::new(vec![as_ref(&old)], Vec::new(), ""));

        let listing = tokio::spawn({
            let mux = Arc::clone(&mux);
            async move { mux.list().await }
        });
        entered.notified().await;

        let new = Arc::new(FakeBackend::new("/tmp/new.sock", vec![key(2)]));
        let updating = tokio::spawn({
            let mux = Arc::clone(&mux);
            let new = as_ref(&new);
            async move { mux.update(vec![new], Vec::new(), "").await }
        });

        // The swap waits for the dispatch holding the read lock.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!updating.is_finished());

        release.notify_one();
        let listed = listing.await.unwrap().into_result().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].pubkey, key(1));
        assert_eq!(listed[0].comment, "/tmp/old.sock");

        updating.await.unwrap();
        let after = mux.list().await.into_result().unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].comment, "/tmp/new.sock");
        assert!(new.calls().contains(&"list"));
    }
}
