//! Startup errors.

use kubecred_core::{ConfigError, CredentialError};
use thiserror::Error;

/// Why a facade could not be assembled.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to initialize {}: {}", .0.kind, .0.detail)]
    Component(#[from] CredentialError),

    #[error("missing component: {0}")]
    MissingComponent(&'static str),

    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] std::io::Error),
}
