mod logging;
mod watcher;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use sshmux_agent::{Dialer, Multiplexer, Reloader, SshAgent, UnixDialer};
use sshmux_core::Config;
use sshmux_core::config::default_config_path;

/// Serve one SSH agent socket backed by several upstream agents.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: $XDG_CONFIG_HOME/ssh-agent-mux/config.toml)
    #[arg(short, long, env = "SSH_AGENT_MUX_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging regardless of the config file
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(default_config_path);

    // Logging comes up before the config is read so load errors are visible.
    let log_level = Arc::new(logging::init(cli.debug));

    let config = Config::load(&config_path)
        .with_context(|| format!("load config {}", config_path.display()))?;
    if config.debug && !cli.debug {
        log_level.apply_config(true);
    }
    tracing::info!(path = %config_path.display(), "loaded config");
    tracing::info!(
        targets = config.targets.len(),
        add_targets = config.add_targets.len(),
        "backends configured"
    );

    let dialer: Arc<dyn Dialer> = Arc::new(UnixDialer);
    let mux = Arc::new(
        Multiplexer::from_config(&config, &dialer)
            .await
            .context("connect upstream agents")?,
    );

    let socket_path = PathBuf::from(&config.listen);
    let agent = SshAgent::new(Arc::clone(&mux), socket_path.clone());
    let mut listener = tokio::spawn(agent.listen());

    {
        let reloader = Arc::new(Reloader::new(Arc::clone(&mux), dialer, config));
        let log_level = Arc::clone(&log_level);
        let watch_path = config_path.clone();
        tokio::spawn(async move {
            if let Err(e) = watcher::config_watcher(reloader, log_level, watch_path).await {
                tracing::warn!("config watcher exited: {e}");
            }
        });
    }

    let result = tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("received shutdown signal, exiting");
            Ok(())
        }
        joined = &mut listener => match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(anyhow::anyhow!("listener task failed: {e}")),
        },
    };

    listener.abort();
    match std::fs::remove_file(&socket_path) {
        Ok(()) => tracing::debug!(path = %socket_path.display(), "removed agent socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %socket_path.display(), "failed to remove agent socket: {e}"),
    }
    result
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("failed to register SIGTERM handler: {e}, falling back to SIGINT only");
            ctrl_c.await.ok();
        }
    }
}
