use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, Registry, fmt, reload};

/// Handle for switching verbosity at runtime when the config's `debug`
/// flag changes.  An explicit `RUST_LOG` pins the filter, and `--debug`
/// keeps debug output on whatever the config says.
pub struct LogLevel {
    handle: reload::Handle<EnvFilter, Registry>,
    pinned: bool,
    forced: bool,
}

fn filter_for(enabled: bool) -> EnvFilter {
    EnvFilter::new(if enabled { "debug" } else { "info" })
}

/// Debug output is on when either the command line or the config asks.
pub fn effective_debug(cli: bool, config: bool) -> bool {
    cli || config
}

pub fn init(cli_debug: bool) -> LogLevel {
    let (filter, pinned) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) => (filter_for(cli_debug), false),
    };
    let (filter, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
    LogLevel {
        handle,
        pinned,
        forced: cli_debug,
    }
}

impl LogLevel {
    /// Apply the config's `debug` flag.
    pub fn apply_config(&self, config_debug: bool) {
        if self.pinned {
            tracing::debug!("log filter set by RUST_LOG, ignoring debug toggle");
            return;
        }
        let enabled = effective_debug(self.forced, config_debug);
        match self.handle.reload(filter_for(enabled)) {
            Ok(()) => tracing::info!(enabled, "log level updated"),
            Err(e) => tracing::warn!("failed to update log level: {e}"),
        }
    }
}
