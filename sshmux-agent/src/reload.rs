//! Applying a [`Config`] to a [`Multiplexer`].
//!
//! Startup is strict: every configured backend must connect, or nothing is
//! built.  Reload is lenient: a backend that cannot be reached is dropped
//! from the new set and the rest is applied.  An invalid config never
//! touches the live state.

use std::sync::Arc;

use sshmux_core::Config;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::connection::{BackendConnection, Dialer};
use crate::error::MuxError;
use crate::mux::{BackendRef, Multiplexer};

/// What to do when a backend cannot be dialled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPolicy {
    /// Abort on the first failure.
    Strict,
    /// Log and leave the backend out.
    SkipUnreachable,
}

/// Dial every address in order.
pub async fn connect_all(
    addresses: &[String],
    dialer: &Arc<dyn Dialer>,
    policy: ConnectPolicy,
) -> Result<Vec<BackendRef>, MuxError> {
    let mut backends: Vec<BackendRef> = Vec::with_capacity(addresses.len());
    for address in addresses {
        match BackendConnection::connect(address.clone(), Arc::clone(dialer)).await {
            Ok(conn) => backends.push(Arc::new(conn)),
            Err(e) if policy == ConnectPolicy::SkipUnreachable => {
                warn!(backend = %address, error = %e, "backend unreachable, leaving it out");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(backends)
}

impl Multiplexer {
    /// Build the multiplexer for the initial configuration.
    ///
    /// Fails if the config is invalid or any backend cannot be reached.
    pub async fn from_config(config: &Config, dialer: &Arc<dyn Dialer>) -> Result<Self, MuxError> {
        config.validate()?;
        let read_targets = connect_all(&config.targets, dialer, ConnectPolicy::Strict).await?;
        let add_targets = connect_all(&config.add_targets, dialer, ConnectPolicy::Strict).await?;
        info!(
            read_targets = read_targets.len(),
            add_targets = add_targets.len(),
            "backends connected"
        );
        Ok(Self::new(
            read_targets,
            add_targets,
            config.select_target_command.clone(),
        ))
    }
}

/// Outcome of a successful [`Reloader::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    Unchanged,
    Applied {
        read_targets: usize,
        add_targets: usize,
        /// Configured backends that could not be reached.
        dropped: usize,
    },
}

/// Applies configuration changes to a live multiplexer.
///
/// Remembers the last applied [`Config`] so reloads of an identical file
/// are no-ops and a rejected config leaves the previous one in force.
#[derive(Debug)]
pub struct Reloader {
    mux: Arc<Multiplexer>,
    dialer: Arc<dyn Dialer>,
    applied: Mutex<Config>,
}

impl Reloader {
    pub fn new(mux: Arc<Multiplexer>, dialer: Arc<dyn Dialer>, applied: Config) -> Self {
        Self {
            mux,
            dialer,
            applied: Mutex::new(applied),
        }
    }

    /// The configuration currently in force.
    pub async fn applied(&self) -> Config {
        self.applied.lock().await.clone()
    }

    pub async fn apply(&self, config: Config) -> Result<ReloadOutcome, MuxError> {
        config.validate()?;

        // Held across the dials so two reloads cannot interleave.
        let mut applied = self.applied.lock().await;
        if *applied == config {
            debug!("config unchanged, no reload needed");
            return Ok(ReloadOutcome::Unchanged);
        }

        if applied.listen != config.listen {
            warn!(
                old = %applied.listen,
                new = %config.listen,
                "listen address changed; restart to rebind"
            );
        }

        let read_targets =
            connect_all(&config.targets, &self.dialer, ConnectPolicy::SkipUnreachable).await?;
        let add_targets =
            connect_all(&config.add_targets, &self.dialer, ConnectPolicy::SkipUnreachable).await?;

        let outcome = ReloadOutcome::Applied {
            read_targets: read_targets.len(),
            add_targets: add_targets.len(),
            dropped: config.targets.len() + config.add_targets.len()
                - read_targets.len()
                - add_targets.len(),
        };

        self.mux
            .update(read_targets, add_targets, config.select_target_command.clone())
            .await;
        *applied = config;

        info!(?outcome, "configuration reloaded");
        Ok(outcome)
    }
}
