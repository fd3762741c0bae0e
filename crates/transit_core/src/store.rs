//! State store abstraction
//!
//! The migration engine treats the clustered store as a transactional
//! key-document store. This module provides:
//! - the [`StateStore`] driver trait and the document/write-op types it speaks
//! - an in-process [`MemoryStore`] used by tests and dry runs
//! - a SurrealDB-backed [`SurrealStore`] (feature `surreal`)

use async_trait::async_trait;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::config::StoreConfig;
use crate::graph::Model;
use crate::id::{DocumentKey, ModelUuid};

pub mod memory;
pub(crate) mod records;
#[cfg(feature = "surreal")]
pub mod surreal;

pub use memory::{FaultPlan, MemoryStore};
#[cfg(feature = "surreal")]
pub use surreal::SurrealStore;

/// Core store error type
#[derive(Error, Debug, Diagnostic)]
pub enum StoreError {
    #[error("Store connection failed")]
    #[diagnostic(
        code(transit_core::store::unavailable),
        help("Check your store configuration and ensure the store is running")
    )]
    Unavailable {
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Document {key} already exists")]
    #[diagnostic(code(transit_core::store::document_exists))]
    DocumentExists { key: DocumentKey },

    #[error("Document {key} does not exist")]
    #[diagnostic(code(transit_core::store::document_missing))]
    DocumentMissing { key: DocumentKey },

    #[error("Document {key} could not be encoded or decoded")]
    #[diagnostic(code(transit_core::store::codec))]
    Codec {
        key: String,
        #[source]
        cause: serde_json::Error,
    },

    #[error("Store backend failure during {operation}")]
    #[diagnostic(code(transit_core::store::backend))]
    Backend {
        operation: String,
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Injected fault while writing {key}")]
    #[diagnostic(
        code(transit_core::store::injected_fault),
        help("This failure was requested by the store's fault plan")
    )]
    InjectedFault { key: DocumentKey },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Value of the store's global change sequence
pub type ChangeToken = u64;

/// A stored document and the revision it was last written at
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub key: DocumentKey,
    pub model_uuid: ModelUuid,
    /// Change sequence value of the write that produced this document
    pub revision: ChangeToken,
    pub body: serde_json::Value,
}

/// One operation inside a write transaction
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Create a document; fails if the key is already present
    Insert {
        key: DocumentKey,
        model_uuid: ModelUuid,
        body: serde_json::Value,
    },
    /// Overwrite an existing document
    Replace {
        key: DocumentKey,
        model_uuid: ModelUuid,
        body: serde_json::Value,
    },
    Delete { key: DocumentKey },
}

impl WriteOp {
    pub fn key(&self) -> &DocumentKey {
        match self {
            WriteOp::Insert { key, .. } | WriteOp::Replace { key, .. } | WriteOp::Delete { key } => {
                key
            }
        }
    }
}

/// What a backend can promise about atomic writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCapabilities {
    /// A multi-document `write_transaction` is all-or-nothing
    pub multi_document_transactions: bool,
    /// Largest number of operations accepted in one transaction
    pub max_ops_per_transaction: Option<usize>,
}

impl Default for StoreCapabilities {
    fn default() -> Self {
        Self {
            multi_document_transactions: true,
            max_ops_per_transaction: None,
        }
    }
}

/// Driver interface for a clustered key-document store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Short backend name for logs
    fn backend_name(&self) -> &'static str;

    fn capabilities(&self) -> StoreCapabilities;

    async fn read_by_id(&self, key: &DocumentKey) -> Result<Option<Document>>;

    /// Every child document (machines, applications, units, relations) of a model
    async fn read_all_by_model_scope(&self, uuid: &ModelUuid) -> Result<Vec<Document>>;

    /// Current value of the monotonic change sequence
    async fn change_token(&self) -> Result<ChangeToken>;

    /// Apply the operations in order.
    ///
    /// Atomic when [`StoreCapabilities::multi_document_transactions`] is set;
    /// otherwise a failure may leave earlier operations applied.
    async fn write_transaction(&self, ops: Vec<WriteOp>) -> Result<ChangeToken>;

    /// Delete every document scoped to the model, the model document included.
    /// Returns the number of documents removed.
    async fn delete_by_scope(&self, uuid: &ModelUuid) -> Result<usize>;
}

/// Import progress marker kept on a model document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationMode {
    /// Children are still being written; the model is not usable yet
    Importing,
}

/// Body of a model document in the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    #[serde(flatten)]
    pub model: Model,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_mode: Option<MigrationMode>,
}

impl ModelRecord {
    pub fn is_importing(&self) -> bool {
        self.migration_mode == Some(MigrationMode::Importing)
    }
}

/// Open a store connection from its configuration
pub async fn open_store(config: &StoreConfig) -> crate::Result<Arc<dyn StateStore>> {
    match config {
        StoreConfig::Memory => {
            tracing::debug!("Using in-memory state store");
            Ok(Arc::new(MemoryStore::new()))
        }
        #[cfg(feature = "surreal")]
        StoreConfig::Embedded { .. } | StoreConfig::Remote { .. } => {
            Ok(Arc::new(SurrealStore::connect(config).await?))
        }
        #[cfg(not(feature = "surreal"))]
        StoreConfig::Embedded { .. } | StoreConfig::Remote { .. } => {
            Err(crate::MigrationError::StoreUnavailable {
                cause: StoreError::Unavailable {
                    cause: "transit-core was built without the `surreal` feature".into(),
                },
            })
        }
    }
}
