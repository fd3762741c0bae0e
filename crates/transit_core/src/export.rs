//! Model exporter
//!
//! Reads one model out of a live store. The store offers no cross-collection
//! snapshot, so every attempt brackets its reads with the change sequence: the
//! attempt is accepted only if nothing in the model's scope carries a revision
//! newer than the token taken before reading, and a second read of the scope
//! sees exactly the same documents at the same revisions.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::ExportConfig;
use crate::graph::ModelGraph;
use crate::id::{DocumentKey, ModelUuid};
use crate::store::records::{decode_model, graph_from_documents};
use crate::store::{ChangeToken, Document, StateStore};
use crate::{MigrationError, Result};

/// Options for exporting a model
#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// Read attempts before giving up
    pub max_attempts: u32,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self::from(&ExportConfig::default())
    }
}

impl From<&ExportConfig> for ExportOptions {
    fn from(config: &ExportConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
        }
    }
}

/// A consistent export and how it was obtained
#[derive(Debug, Clone)]
pub struct ExportOutcome {
    pub graph: ModelGraph,
    /// Attempts used, 1 when the first read was already consistent
    pub attempts: u32,
    /// Change token the accepted read was bracketed by
    pub token: ChangeToken,
}

enum Attempt {
    Consistent(Box<ModelGraph>),
    Changed(String),
}

/// Model exporter
pub struct Exporter {
    store: Arc<dyn StateStore>,
    options: ExportOptions,
}

fn fingerprint(documents: &[Document]) -> Vec<(&DocumentKey, ChangeToken)> {
    let mut prints: Vec<_> = documents.iter().map(|d| (&d.key, d.revision)).collect();
    prints.sort();
    prints
}

impl Exporter {
    pub fn new(store: Arc<dyn StateStore>, options: ExportOptions) -> Self {
        Self { store, options }
    }

    /// Export the model with `uuid` as a point-in-time consistent graph
    pub async fn export(
        &self,
        uuid: &ModelUuid,
        cancel: &CancellationToken,
    ) -> Result<ExportOutcome> {
        let max_attempts = self.options.max_attempts.max(1);
        let mut last_change = String::new();

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(MigrationError::Cancelled {
                    operation: "export",
                });
            }

            let start = self.store.change_token().await?;
            tracing::debug!(
                "Export attempt {}/{} of {} from token {}",
                attempt,
                max_attempts,
                uuid,
                start
            );

            match self.read_once(uuid, start, attempt).await? {
                Attempt::Consistent(graph) => {
                    tracing::info!(
                        "Exported model {} ({} entities) at token {} after {} attempt(s)",
                        uuid,
                        graph.entity_count(),
                        start,
                        attempt
                    );
                    return Ok(ExportOutcome {
                        graph: *graph,
                        attempts: attempt,
                        token: start,
                    });
                }
                Attempt::Changed(change) => {
                    tracing::warn!(
                        "Model {} changed during export attempt {}/{}: {}",
                        uuid,
                        attempt,
                        max_attempts,
                        change
                    );
                    last_change = change;
                }
            }
        }

        Err(MigrationError::InconsistentSnapshot {
            uuid: *uuid,
            attempts: max_attempts,
            reason: last_change,
        })
    }

    async fn read_once(&self, uuid: &ModelUuid, start: ChangeToken, attempt: u32) -> Result<Attempt> {
        let model_key = DocumentKey::model(uuid);
        let model_document = self
            .store
            .read_by_id(&model_key)
            .await?
            .ok_or(MigrationError::NotFound { uuid: *uuid })?;
        let record = decode_model(&model_document)?;

        if record.is_importing() {
            return Err(MigrationError::InconsistentSnapshot {
                uuid: *uuid,
                attempts: attempt,
                reason: "the model is still being imported".to_string(),
            });
        }

        let documents = self.store.read_all_by_model_scope(uuid).await?;

        if let Some(newer) = std::iter::once(&model_document)
            .chain(documents.iter())
            .find(|d| d.revision > start)
        {
            return Ok(Attempt::Changed(format!(
                "{} was written at revision {} after the read began at {}",
                newer.key, newer.revision, start
            )));
        }

        // Catch writes and deletes that landed while the scope was being read
        let recheck = self.store.read_all_by_model_scope(uuid).await?;
        if fingerprint(&documents) != fingerprint(&recheck) {
            return Ok(Attempt::Changed(
                "the model's documents changed between two reads".to_string(),
            ));
        }
        let model_now = self.store.read_by_id(&model_key).await?;
        if model_now.map(|d| d.revision) != Some(model_document.revision) {
            return Ok(Attempt::Changed(
                "the model document changed during the read".to_string(),
            ));
        }

        let graph = graph_from_documents(record.model, &documents)?;
        graph
            .validate()
            .map_err(|violations| MigrationError::InvariantViolation { violations })?;
        Ok(Attempt::Consistent(Box::new(graph)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::fixtures::*;
    use crate::graph::Life;
    use crate::id::Collection;
    use crate::store::records::{child_ops, model_op};
    use crate::store::{MemoryStore, MigrationMode, MockStateStore, WriteOp};
    use pretty_assertions::assert_eq;
    use tracing_test::traced_test;

    async fn seeded(graph: &ModelGraph) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let mut ops = vec![model_op(graph.model(), None, true).unwrap()];
        ops.extend(child_ops(graph).unwrap().into_iter().flatten());
        store.write_transaction(ops).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_export_reads_consistent_graph() {
        let graph = sample_graph(ModelUuid::generate());
        let store = seeded(&graph).await;
        let exporter = Exporter::new(store, ExportOptions::default());

        let outcome = exporter
            .export(&graph.uuid(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.graph, graph);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.token, 1);
    }

    #[tokio::test]
    async fn test_missing_model_is_not_found() {
        let exporter = Exporter::new(Arc::new(MemoryStore::new()), ExportOptions::default());
        let uuid = ModelUuid::generate();
        let err = exporter
            .export(&uuid, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::NotFound { uuid: missing } if missing == uuid));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_retries_after_concurrent_write() {
        let graph = sample_graph(ModelUuid::generate());
        let store = seeded(&graph).await;
        let machine = DocumentKey::scoped(Collection::Machine, &graph.uuid(), "0");
        store.set_after_read_hook(Arc::new(move |store: &MemoryStore, reads: usize| {
            if reads == 1 {
                store.touch(&machine).unwrap();
            }
        }));

        let exporter = Exporter::new(store, ExportOptions::default());
        let outcome = exporter
            .export(&graph.uuid(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.token, 2);
        assert_eq!(outcome.graph, graph);
        assert!(logs_contain("changed during export attempt 1/3"));
    }

    #[tokio::test]
    async fn test_gives_up_when_model_never_settles() {
        let graph = sample_graph(ModelUuid::generate());
        let store = seeded(&graph).await;
        let machine = DocumentKey::scoped(Collection::Machine, &graph.uuid(), "1");
        store.set_after_read_hook(Arc::new(move |store: &MemoryStore, _: usize| {
            store.touch(&machine).unwrap();
        }));

        let exporter = Exporter::new(store, ExportOptions { max_attempts: 2 });
        let err = exporter
            .export(&graph.uuid(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MigrationError::InconsistentSnapshot { attempts: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_import_in_progress_is_not_exported() {
        let graph = sample_graph(ModelUuid::generate());
        let store = Arc::new(MemoryStore::new());
        store
            .write_transaction(vec![
                model_op(graph.model(), Some(MigrationMode::Importing), true).unwrap(),
            ])
            .await
            .unwrap();

        let exporter = Exporter::new(store, ExportOptions::default());
        let err = exporter
            .export(&graph.uuid(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MigrationError::InconsistentSnapshot { attempts: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_dead_model_fails_validation() {
        let mut model = model(ModelUuid::generate());
        model.life = Life::Dead;
        let store = seeded(&ModelGraph::new(model.clone())).await;

        let exporter = Exporter::new(store, ExportOptions::default());
        let err = exporter
            .export(&model.uuid, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::InvariantViolation { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_before_reading() {
        let mut store = MockStateStore::new();
        store.expect_change_token().never();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let exporter = Exporter::new(Arc::new(store), ExportOptions::default());
        let err = exporter
            .export(&ModelUuid::generate(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::Cancelled { operation: "export" }));
    }

    #[tokio::test]
    async fn test_deleted_document_forces_retry() {
        let graph = sample_graph(ModelUuid::generate());
        let uuid = graph.uuid();
        let model_document = match model_op(graph.model(), None, true).unwrap() {
            WriteOp::Insert {
                key,
                model_uuid,
                body,
            } => Document {
                key,
                model_uuid,
                revision: 1,
                body,
            },
            _ => unreachable!(),
        };
        let children: Vec<Document> = child_ops(&graph)
            .unwrap()
            .into_iter()
            .flatten()
            .map(|op| match op {
                WriteOp::Insert {
                    key,
                    model_uuid,
                    body,
                } => Document {
                    key,
                    model_uuid,
                    revision: 1,
                    body,
                },
                _ => unreachable!(),
            })
            .collect();

        let mut store = MockStateStore::new();
        store.expect_change_token().times(2).returning(|| Ok(1));
        store
            .expect_read_by_id()
            .returning(move |_| Ok(Some(model_document.clone())));

        // First attempt: the relation disappears between the two scope reads
        let mut reads = 0;
        let truncated: Vec<Document> = children[..children.len() - 1].to_vec();
        store
            .expect_read_all_by_model_scope()
            .times(4)
            .returning(move |_| {
                reads += 1;
                Ok(if reads == 1 {
                    children.clone()
                } else {
                    truncated.clone()
                })
            });

        let exporter = Exporter::new(Arc::new(store), ExportOptions::default());
        let outcome = exporter
            .export(&uuid, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.graph.relations().count(), 0);
    }
}
