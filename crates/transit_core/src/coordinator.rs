//! Migration coordinator
//!
//! Composes the exporter, importer and snapshot codec behind the operations
//! the command line drives. It holds no state; everything an operation needs
//! arrives through its arguments and the [`MigrationContext`].

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::MigrationConfig;
use crate::export::{ExportOptions, Exporter};
use crate::id::ModelUuid;
use crate::import::{ImportOptions, Importer, ModelHandle};
use crate::snapshot;
use crate::store::StateStore;
use crate::utils::ErrorLogging;
use crate::{MigrationError, Result};

/// Per-call context for a migration operation
#[derive(Debug, Clone)]
pub struct MigrationContext {
    /// Cancellation signal observed between store round trips
    pub cancel: CancellationToken,
    /// Parent span for the operation's own span
    pub span: tracing::Span,
    pub config: MigrationConfig,
}

impl MigrationContext {
    pub fn new(cancel: CancellationToken, span: tracing::Span, config: MigrationConfig) -> Self {
        Self {
            cancel,
            span,
            config,
        }
    }
}

impl Default for MigrationContext {
    fn default() -> Self {
        Self::new(
            CancellationToken::new(),
            tracing::Span::current(),
            MigrationConfig::default(),
        )
    }
}

/// Entry points for moving models between stores
pub struct Coordinator;

impl Coordinator {
    /// Export the model with `uuid` from `store` as snapshot bytes
    pub async fn export_model(
        store: Arc<dyn StateStore>,
        uuid: &ModelUuid,
        ctx: &MigrationContext,
    ) -> Result<Vec<u8>> {
        let span = tracing::info_span!(
            parent: &ctx.span,
            "export_model",
            model = %uuid,
            store = store.backend_name()
        );

        async {
            tracing::info!("Exporting model {}", uuid);
            let exporter = Exporter::new(store, ExportOptions::from(&ctx.config.export));
            let outcome = exporter.export(uuid, &ctx.cancel).await?;
            let bytes = snapshot::encode(&outcome.graph)?;
            tracing::debug!("Encoded snapshot of {} bytes", bytes.len());
            Ok::<_, MigrationError>(bytes)
        }
        .instrument(span.clone())
        .await
        .inspect_err(|e| span.in_scope(|| tracing::debug!("Export failed: {}", e.log_format())))
    }

    /// Decode `bytes` and import the model they describe into `store`
    pub async fn import_model(
        store: Arc<dyn StateStore>,
        bytes: &[u8],
        ctx: &MigrationContext,
    ) -> Result<ModelHandle> {
        let span = tracing::info_span!(
            parent: &ctx.span,
            "import_model",
            store = store.backend_name()
        );

        async {
            // Version gating and decoding happen before the store is touched
            let graph = snapshot::decode(bytes)?;
            tracing::info!(
                "Importing model {} ({} entities)",
                graph.uuid(),
                graph.entity_count()
            );
            let importer = Importer::new(store, ImportOptions::from(&ctx.config.import));
            importer.apply(&graph, &ctx.cancel).await
        }
        .instrument(span.clone())
        .await
        .inspect_err(|e| span.in_scope(|| tracing::debug!("Import failed: {}", e.log_format())))
    }

    /// Clean up after an interrupted import of `uuid`
    pub async fn recover_model(
        store: Arc<dyn StateStore>,
        uuid: &ModelUuid,
        ctx: &MigrationContext,
    ) -> Result<usize> {
        let span = tracing::info_span!(parent: &ctx.span, "recover_model", model = %uuid);

        async {
            let importer = Importer::new(store, ImportOptions::from(&ctx.config.import));
            importer.recover(uuid).await
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::fixtures::*;
    use crate::store::{MemoryStore, MockStateStore};
    use pretty_assertions::assert_eq;
    use tracing_test::traced_test;

    #[tokio::test]
    async fn test_export_then_import_between_stores() {
        let graph = sample_graph(ModelUuid::generate());
        let source = Arc::new(MemoryStore::new());
        let ctx = MigrationContext::default();
        Coordinator::import_model(source.clone(), &snapshot::encode(&graph).unwrap(), &ctx)
            .await
            .unwrap();

        let bytes = Coordinator::export_model(source, &graph.uuid(), &ctx)
            .await
            .unwrap();
        assert_eq!(snapshot::decode(&bytes).unwrap(), graph);

        let destination = Arc::new(MemoryStore::new());
        let handle = Coordinator::import_model(destination.clone(), &bytes, &ctx)
            .await
            .unwrap();
        assert_eq!(handle.uuid, graph.uuid());
        assert_eq!(destination.scope_len(&graph.uuid()), graph.entity_count());
    }

    #[tokio::test]
    async fn test_unsupported_version_never_reaches_store() {
        let mut store = MockStateStore::new();
        store.expect_backend_name().return_const("mock");
        store.expect_read_by_id().never();
        store.expect_write_transaction().never();

        let bytes = br#"{"schema_version": 999, "model": {}}"#;
        let err = Coordinator::import_model(Arc::new(store), bytes, &MigrationContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::UnsupportedVersion { found: 999, .. }));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_operations_run_under_context_span() {
        let ctx = MigrationContext::new(
            CancellationToken::new(),
            tracing::info_span!("migration", request = "test-42"),
            MigrationConfig::default(),
        );
        let uuid = ModelUuid::generate();
        let err = Coordinator::export_model(Arc::new(MemoryStore::new()), &uuid, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::NotFound { .. }));
        assert!(logs_contain("export_model"));
        assert!(logs_contain("test-42"));
    }

    #[tokio::test]
    async fn test_recover_without_leftovers() {
        let removed = Coordinator::recover_model(
            Arc::new(MemoryStore::new()),
            &ModelUuid::generate(),
            &MigrationContext::default(),
        )
        .await
        .unwrap();
        assert_eq!(removed, 0);
    }
}
