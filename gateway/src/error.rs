//! Gateway error types

use thiserror::Error;

use crate::pkg::LogicalOperation;

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors that cross the library boundary.
///
/// Command failures are not errors: they come back as an unsuccessful
/// `OperationResult`. These variants cover contract violations and
/// upstream HTTP failures only.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0} requires at least one package")]
    MissingPackages(LogicalOperation),

    #[error("invalid package specifier: {0:?}")]
    InvalidPackageSpec(String),

    #[error("invalid tool input: {0}")]
    InvalidInput(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("upstream request to {url} failed with status {status}")]
    Upstream { url: String, status: u16 },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("dispatcher is shut down")]
    Closed,
}

impl GatewayError {
    /// The caller sent something unusable; retrying the same call cannot help.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::MissingPackages(_)
                | Self::InvalidPackageSpec(_)
                | Self::InvalidInput(_)
                | Self::UnknownTool(_)
        )
    }
}
