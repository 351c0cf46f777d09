use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Config missing for instance '{instance}': {path} does not exist")]
    ConfigMissing { instance: String, path: PathBuf },
    #[error("Provisioning failed on '{instance}' for {entity} '{name}': {reason}")]
    Provisioning {
        instance: String,
        entity: String,
        name: String,
        reason: String,
    },
    #[error("Sync test from '{local}' to '{remote}' failed: {status}")]
    SyncTestFailed {
        local: String,
        remote: String,
        status: String,
    },
    #[error("Lock {path} is held by pid {pid}")]
    LockContention { path: PathBuf, pid: u32 },
    #[error("External call '{call}' failed: {detail}")]
    ExternalCallFailed { call: String, detail: String },
    #[error("Platform API error (HTTP {status}) on {endpoint}: {message}")]
    Api {
        status: u16,
        endpoint: String,
        message: String,
    },
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

impl FleetError {
    /// Errors after which the current instance (or pair) is abandoned but the
    /// run carries on with its siblings.
    pub fn is_scoped(&self) -> bool {
        matches!(
            self,
            FleetError::Provisioning { .. }
                | FleetError::SyncTestFailed { .. }
                | FleetError::Api { .. }
                | FleetError::HttpError(_)
                | FleetError::NotFound(_)
                | FleetError::ExternalCallFailed { .. }
        )
    }

    /// The platform answered, but refused the request.
    pub fn is_rejection(&self) -> bool {
        matches!(self, FleetError::Api { .. })
    }

    pub fn provisioning(
        instance: &str,
        entity: impl std::fmt::Display,
        name: &str,
        reason: impl std::fmt::Display,
    ) -> Self {
        FleetError::Provisioning {
            instance: instance.to_string(),
            entity: entity.to_string(),
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn external(call: impl Into<String>, detail: impl Into<String>) -> Self {
        FleetError::ExternalCallFailed {
            call: call.into(),
            detail: detail.into(),
        }
    }
}
