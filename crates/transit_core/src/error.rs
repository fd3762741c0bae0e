use miette::Diagnostic;
use thiserror::Error;

use crate::graph::Violation;
use crate::id::ModelUuid;
use crate::store::StoreError;

#[derive(Error, Diagnostic, Debug)]
pub enum MigrationError {
    #[error("Model '{uuid}' not found in the source store")]
    #[diagnostic(
        code(transit_core::not_found),
        help("Check the model UUID; `transit export` takes the UUID, not the model name")
    )]
    NotFound { uuid: ModelUuid },

    #[error("Model '{uuid}' kept changing while it was exported ({attempts} attempts)")]
    #[diagnostic(
        code(transit_core::inconsistent_snapshot),
        help("{reason}. Retry once activity on the model has settled")
    )]
    InconsistentSnapshot {
        uuid: ModelUuid,
        attempts: u32,
        reason: String,
    },

    #[error("Malformed snapshot: {entity} has a bad '{field}' field")]
    #[diagnostic(code(transit_core::malformed_snapshot), help("{reason}"))]
    MalformedSnapshot {
        entity: String,
        field: String,
        reason: String,
    },

    #[error("Snapshot schema version {found} is not supported")]
    #[diagnostic(
        code(transit_core::unsupported_version),
        help(
            "This build understands schema versions {}. Upgrade transit on the importing side",
            supported.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ")
        )
    )]
    UnsupportedVersion { found: u64, supported: Vec<u32> },

    #[error("Model graph violates {} invariant(s)", violations.len())]
    #[diagnostic(
        code(transit_core::invariant_violation),
        help("Every violation is listed below; the destination store was not modified")
    )]
    InvariantViolation {
        #[related]
        violations: Vec<Violation>,
    },

    #[error("Model '{uuid}' already exists in the destination store")]
    #[diagnostic(
        code(transit_core::already_exists),
        help("Import never overwrites an existing model. Destroy it first or import elsewhere")
    )]
    AlreadyExists { uuid: ModelUuid },

    #[error("Import of model '{uuid}' failed and was rolled back")]
    #[diagnostic(
        code(transit_core::import_failed),
        help("The destination store holds nothing for this model; the import can be retried")
    )]
    ImportFailed {
        uuid: ModelUuid,
        #[source]
        cause: StoreError,
    },

    #[error("State store unavailable")]
    #[diagnostic(
        code(transit_core::store_unavailable),
        help("Check the store connection settings in the agent configuration")
    )]
    StoreUnavailable {
        #[source]
        cause: StoreError,
    },

    #[error("State store rejected the operation")]
    #[diagnostic(
        code(transit_core::store_failure),
        help("The store is reachable but refused or failed the request; retrying unchanged will not help")
    )]
    StoreFailure {
        #[source]
        cause: StoreError,
    },

    #[error("{operation} was cancelled")]
    #[diagnostic(code(transit_core::cancelled))]
    Cancelled { operation: &'static str },

    #[error("Configuration error in {path}")]
    #[diagnostic(
        code(transit_core::configuration),
        help("Check that the agent configuration exists and is valid TOML")
    )]
    Configuration {
        path: String,
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl From<StoreError> for MigrationError {
    fn from(cause: StoreError) -> Self {
        match cause {
            StoreError::Unavailable { .. } => Self::StoreUnavailable { cause },
            StoreError::Codec { key, cause } => Self::malformed(key, "body", cause),
            cause => Self::StoreFailure { cause },
        }
    }
}

impl MigrationError {
    pub fn malformed(
        entity: impl Into<String>,
        field: impl Into<String>,
        reason: impl std::fmt::Display,
    ) -> Self {
        Self::MalformedSnapshot {
            entity: entity.into(),
            field: field.into(),
            reason: reason.to_string(),
        }
    }

    pub fn configuration(
        path: impl Into<String>,
        cause: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Configuration {
            path: path.into(),
            cause: cause.into(),
        }
    }

    /// Whether the caller may retry the same operation unchanged.
    ///
    /// Bad input never becomes good by retrying, so only connection-level
    /// failures and rolled-back writes qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable { .. } | Self::ImportFailed { .. } | Self::InconsistentSnapshot { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, MigrationError>;
