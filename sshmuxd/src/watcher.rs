use std::path::PathBuf;
use std::sync::Arc;

use notify::Watcher as _;
use sshmux_agent::{ReloadOutcome, Reloader};
use sshmux_core::Config;
use tokio::sync::mpsc;

use crate::logging::LogLevel;

/// Reload the configuration whenever the file changes on disk.
pub async fn config_watcher(
    reloader: Arc<Reloader>,
    log_level: Arc<LogLevel>,
    config_path: PathBuf,
) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel::<()>(1);

    // notify's callback is sync; a unit through the channel wakes the async
    // side.  Capacity 1 coalesces bursts.
    let mut watcher = notify::RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                use notify::EventKind::*;
                if matches!(event.kind, Modify(_) | Create(_) | Remove(_)) {
                    let _ = tx.try_send(());
                }
            }
            Err(e) => tracing::warn!("config watcher notify error: {e}"),
        },
        notify::Config::default(),
    )?;

    // Editors save by rename, so watch the directory rather than the file.
    let watch_dir = config_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("config path has no parent directory"))?;
    if !watch_dir.exists() {
        tracing::info!(dir = %watch_dir.display(), "config directory missing, hot-reload disabled");
        return Ok(());
    }

    watcher.watch(watch_dir, notify::RecursiveMode::NonRecursive)?;
    tracing::info!(path = %config_path.display(), "config watcher started");

    while rx.recv().await.is_some() {
        // Debounce: drain events that arrive within 500 ms.
        while let Ok(Some(())) =
            tokio::time::timeout(tokio::time::Duration::from_millis(500), rx.recv()).await
        {}

        if !config_path.exists() {
            tracing::debug!("config file removed, skipping reload");
            continue;
        }

        let new_config = match Config::load(&config_path) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(
                    path = %config_path.display(),
                    error = %e,
                    "config hot-reload: parse error, keeping current config"
                );
                continue;
            }
        };

        let config_debug = new_config.debug;
        let debug_changed = reloader.applied().await.debug != config_debug;

        match reloader.apply(new_config).await {
            Ok(ReloadOutcome::Unchanged) => {}
            Ok(ReloadOutcome::Applied { dropped, .. }) => {
                if debug_changed {
                    log_level.apply_config(config_debug);
                }
                if dropped > 0 {
                    tracing::warn!(dropped, "hot-reload applied without unreachable backends");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "config hot-reload rejected, keeping current config");
            }
        }
    }

    Ok(())
}
