use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Runtime configuration for the multiplexer.
///
/// Every field has a default so an empty file is a valid (if useless)
/// configuration.  Addresses are stored with any leading `~/` already
/// expanded; see [`Config::load`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Path of the downstream socket that SSH clients connect to.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Read-targets: consulted for list/sign/extension, never chosen for add.
    #[serde(default)]
    pub targets: Vec<String>,

    /// Add-targets: eligible to receive newly added keys.  Also consulted for
    /// every read operation, ahead of `targets`.
    #[serde(default)]
    pub add_targets: Vec<String>,

    /// Command run through `sh -c` to choose among several add-targets.
    #[serde(default)]
    pub select_target_command: String,

    #[serde(default)]
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            targets: Vec::new(),
            add_targets: Vec::new(),
            select_target_command: String::new(),
            debug: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("listen address must not be empty")]
    EmptyListen,

    #[error("'{0}' is listed in both targets and add_targets")]
    Overlap(String),

    #[error("multiple add_targets but no select_target_command configured")]
    MissingSelector,
}

impl Config {
    /// Parse a config from TOML text, expand `~/` prefixes and validate it.
    pub fn from_toml(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate the config file at `path`.
    ///
    /// A missing file yields the defaults (logged as a warning).  A file that
    /// is readable by group or others is accepted with a warning.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::warn!(
                "config file not found at {}, using defaults",
                path.display()
            );
            let mut config = Config::default();
            config.expand_paths();
            return Ok(config);
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            match std::fs::metadata(path) {
                Ok(meta) if meta.mode() & 0o077 != 0 => {
                    tracing::warn!(
                        path = %path.display(),
                        mode = format!("{:o}", meta.mode() & 0o777),
                        "config file is accessible by group or others, recommend: chmod 600 {}",
                        path.display()
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("could not check config file permissions: {e}"),
            }
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content, path)
    }

    /// Check the rules shared by startup and hot-reload.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::EmptyListen);
        }

        let read: HashSet<&str> = self.targets.iter().map(String::as_str).collect();
        if let Some(dup) = self.add_targets.iter().find(|t| read.contains(t.as_str())) {
            return Err(ConfigError::Overlap(dup.clone()));
        }

        if self.add_targets.len() > 1 && self.select_target_command.trim().is_empty() {
            return Err(ConfigError::MissingSelector);
        }

        Ok(())
    }

    fn expand_paths(&mut self) {
        self.listen = expand_home(&self.listen);
        for target in self.targets.iter_mut().chain(self.add_targets.iter_mut()) {
            *target = expand_home(target);
        }
    }
}

/// Replace a leading `~/` with `$HOME/`.  Other values pass through.
pub fn expand_home(path: &str) -> String {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => PathBuf::from(home).join(rest).to_string_lossy().into_owned(),
        _ => path.to_string(),
    }
}

/// `$XDG_CONFIG_HOME/ssh-agent-mux/config.toml`, falling back to `~/.config`.
pub fn default_config_path() -> PathBuf {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(|| {
            tracing::warn!(
                "neither XDG_CONFIG_HOME nor HOME are set; using current directory for config"
            );
            PathBuf::from(".")
        });
    base.join("ssh-agent-mux").join("config.toml")
}

fn default_listen() -> String {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) => PathBuf::from(dir)
            .join("ssh-agent-mux")
            .join("agent.sock")
            .to_string_lossy()
            .into_owned(),
        None => "~/.ssh/ssh-agent-mux.sock".to_string(),
    }
}
