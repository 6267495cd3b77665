//! Shared building blocks for the SSH agent multiplexer: the configuration
//! model and the add-target selection protocol.

pub mod config;
pub mod selector;

pub use config::{Config, ConfigError};
pub use selector::{KeyInfo, SelectionRequest, SelectorError};
