//! Model importer
//!
//! Materializes a decoded graph as a new model in a destination store. The
//! model document goes in first, flagged as importing, so an interrupted
//! import is always recognisable and can be cleaned up. Children follow in
//! dependency order, in one transaction when the store allows it and in
//! ordered batches otherwise; any failure deletes everything scoped to the
//! model before the error is returned.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::ImportConfig;
use crate::graph::ModelGraph;
use crate::id::{DocumentKey, ModelUuid};
use crate::store::records::{child_ops, decode_model, model_op};
use crate::store::{MigrationMode, StateStore, StoreError, WriteOp};
use crate::{MigrationError, Result};

/// Options for importing a model
#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    /// Cap on operations per transaction, applied on top of the store's own limit
    pub max_ops_per_transaction: Option<usize>,
}

impl From<&ImportConfig> for ImportOptions {
    fn from(config: &ImportConfig) -> Self {
        Self {
            max_ops_per_transaction: config.max_ops_per_transaction,
        }
    }
}

/// Identity of a model after a successful import
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelHandle {
    pub uuid: ModelUuid,
    pub name: String,
    pub owner: String,
    pub imported_at: DateTime<Utc>,
}

impl fmt::Display for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// How the children of a model get written
#[derive(Debug)]
enum WritePlan {
    /// Children and the final model update in one atomic transaction
    Atomic(Vec<WriteOp>),
    /// Ordered batches, each its own transaction
    Ordered(Vec<Vec<WriteOp>>),
}

/// Model importer
pub struct Importer {
    store: Arc<dyn StateStore>,
    options: ImportOptions,
}

impl Importer {
    pub fn new(store: Arc<dyn StateStore>, options: ImportOptions) -> Self {
        Self { store, options }
    }

    fn transaction_limit(&self) -> Option<usize> {
        let store_limit = self.store.capabilities().max_ops_per_transaction;
        let limit = match (store_limit, self.options.max_ops_per_transaction) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (limit, None) | (None, limit) => limit,
        };
        limit.map(|limit| limit.max(1))
    }

    fn plan(&self, graph: &ModelGraph) -> Result<WritePlan> {
        let groups = child_ops(graph)?;
        let settle = model_op(graph.model(), None, false)?;
        let total = groups.iter().map(Vec::len).sum::<usize>() + 1;
        let limit = self.transaction_limit();

        if self.store.capabilities().multi_document_transactions
            && limit.is_none_or(|limit| total <= limit)
        {
            let mut ops: Vec<WriteOp> = groups.into_iter().flatten().collect();
            ops.push(settle);
            return Ok(WritePlan::Atomic(ops));
        }

        let mut batches = Vec::new();
        for group in groups.into_iter().filter(|g| !g.is_empty()) {
            match limit {
                Some(limit) => batches.extend(group.chunks(limit).map(<[WriteOp]>::to_vec)),
                None => batches.push(group),
            }
        }
        batches.push(vec![settle]);
        Ok(WritePlan::Ordered(batches))
    }

    /// Import `graph` as a new model.
    ///
    /// Refuses to overwrite an existing model. Once the graph validates, a
    /// leftover from an interrupted import of the same model is removed.
    pub async fn apply(&self, graph: &ModelGraph, cancel: &CancellationToken) -> Result<ModelHandle> {
        let uuid = graph.uuid();
        if cancel.is_cancelled() {
            return Err(MigrationError::Cancelled {
                operation: "import",
            });
        }

        graph
            .validate()
            .map_err(|violations| MigrationError::InvariantViolation { violations })?;

        self.precheck(&uuid).await?;

        let plan = self.plan(graph)?;
        tracing::debug!(
            "Importing model {} ({} entities) into {} store",
            uuid,
            graph.entity_count(),
            self.store.backend_name()
        );

        // Register the model first so a crash leaves an identifiable marker.
        // A failed registration wrote nothing of ours, so there is nothing to roll back.
        let register = model_op(graph.model(), Some(MigrationMode::Importing), true)?;
        match self.store.write_transaction(vec![register]).await {
            Ok(_) => {}
            Err(StoreError::DocumentExists { .. }) => {
                return Err(MigrationError::AlreadyExists { uuid });
            }
            Err(cause) => return Err(MigrationError::ImportFailed { uuid, cause }),
        }

        match plan {
            WritePlan::Atomic(ops) => {
                self.check_cancelled(&uuid, cancel).await?;
                if let Err(cause) = self.store.write_transaction(ops).await {
                    return Err(self.fail(&uuid, cause).await);
                }
            }
            WritePlan::Ordered(batches) => {
                let count = batches.len();
                for (i, batch) in batches.into_iter().enumerate() {
                    self.check_cancelled(&uuid, cancel).await?;
                    tracing::debug!(
                        "Writing batch {}/{} ({} ops) for {}",
                        i + 1,
                        count,
                        batch.len(),
                        uuid
                    );
                    if let Err(cause) = self.store.write_transaction(batch).await {
                        return Err(self.fail(&uuid, cause).await);
                    }
                }
            }
        }

        let model = graph.model();
        let handle = ModelHandle {
            uuid,
            name: model.name.clone(),
            owner: model.owner.clone(),
            imported_at: Utc::now(),
        };
        tracing::info!("Imported model {} ({})", handle, uuid);
        Ok(handle)
    }

    /// Remove what an interrupted import of `uuid` left behind.
    ///
    /// Returns the number of documents deleted. A settled model is never
    /// touched.
    pub async fn recover(&self, uuid: &ModelUuid) -> Result<usize> {
        match self.store.read_by_id(&DocumentKey::model(uuid)).await? {
            Some(document) if !decode_model(&document)?.is_importing() => {
                Err(MigrationError::AlreadyExists { uuid: *uuid })
            }
            Some(_) => {
                let removed = self.store.delete_by_scope(uuid).await?;
                tracing::info!("Removed interrupted import of {} ({} documents)", uuid, removed);
                Ok(removed)
            }
            None => {
                let removed = self.store.delete_by_scope(uuid).await?;
                if removed > 0 {
                    tracing::warn!("Removed {} orphaned documents scoped to {}", removed, uuid);
                }
                Ok(removed)
            }
        }
    }

    async fn precheck(&self, uuid: &ModelUuid) -> Result<()> {
        let Some(document) = self.store.read_by_id(&DocumentKey::model(uuid)).await? else {
            return Ok(());
        };
        if !decode_model(&document)?.is_importing() {
            return Err(MigrationError::AlreadyExists { uuid: *uuid });
        }

        tracing::warn!(
            "Model {} has an interrupted import; removing it before retrying",
            uuid
        );
        let removed = self.store.delete_by_scope(uuid).await?;
        tracing::debug!("Removed {} documents of the interrupted import", removed);
        Ok(())
    }

    async fn check_cancelled(&self, uuid: &ModelUuid, cancel: &CancellationToken) -> Result<()> {
        if !cancel.is_cancelled() {
            return Ok(());
        }
        tracing::warn!("Import of {} cancelled; rolling back", uuid);
        self.rollback(uuid).await;
        Err(MigrationError::Cancelled {
            operation: "import",
        })
    }

    /// Roll back and wrap the store failure
    async fn fail(&self, uuid: &ModelUuid, cause: StoreError) -> MigrationError {
        tracing::warn!("Import of {} failed: {}; rolling back", uuid, cause);
        self.rollback(uuid).await;
        MigrationError::ImportFailed { uuid: *uuid, cause }
    }

    async fn rollback(&self, uuid: &ModelUuid) {
        match self.store.delete_by_scope(uuid).await {
            Ok(removed) => {
                tracing::info!("Rolled back import of {} ({} documents removed)", uuid, removed);
            }
            Err(e) => {
                crate::log_error_chain!(
                    format!(
                        "Rollback of {} failed; the importing marker stays until `transit recover` runs",
                        uuid
                    ),
                    e
                );
            }
        }
    }
}
