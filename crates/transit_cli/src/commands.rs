//! Export, import and recovery commands

use miette::{IntoDiagnostic, Result};
use owo_colors::OwoColorize;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

use transit_core::{Coordinator, MigrationContext, ModelHandle, ModelUuid, StateStore, snapshot};

use crate::output::Output;

/// Export a model and write its snapshot to `output`, or stdout when unset
pub async fn export(
    store: Arc<dyn StateStore>,
    uuid: &ModelUuid,
    output: Option<&Path>,
    ctx: &MigrationContext,
) -> Result<()> {
    let output_handler = Output::new();
    output_handler.info("Exporting", &format!("model {}", uuid.bright_cyan()));

    let bytes = Coordinator::export_model(store, uuid, ctx).await?;

    match output {
        Some(path) => {
            tokio::fs::write(path, &bytes).await.into_diagnostic()?;
            output_handler.success("Export complete!");
            output_handler.kv("File", &path.display().to_string());
        }
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&bytes).await.into_diagnostic()?;
            stdout.flush().await.into_diagnostic()?;
        }
    }
    output_handler.kv("Size", &format!("{} bytes", bytes.len()));

    Ok(())
}

/// Import the snapshot stored in `file`
pub async fn import(
    store: Arc<dyn StateStore>,
    file: &Path,
    ctx: &MigrationContext,
) -> Result<ModelHandle> {
    let output_handler = Output::new();
    output_handler.info("Importing", &file.display().to_string());

    let bytes = tokio::fs::read(file).await.into_diagnostic()?;
    let version = snapshot::schema_version(&bytes)?;
    output_handler.status(&format!("snapshot schema version {}", version));

    let handle = Coordinator::import_model(store, &bytes, ctx).await?;
    println!("success, model {} imported", handle);
    output_handler.kv("UUID", &handle.uuid.to_string());

    Ok(handle)
}

/// Remove what an interrupted import left in the store
pub async fn recover(
    store: Arc<dyn StateStore>,
    uuid: &ModelUuid,
    ctx: &MigrationContext,
) -> Result<usize> {
    let output_handler = Output::new();
    let removed = Coordinator::recover_model(store, uuid, ctx).await?;

    if removed == 0 {
        output_handler.warning(&format!("nothing to recover for model {}", uuid));
    } else {
        output_handler.success(&format!(
            "removed {} documents left by an interrupted import of {}",
            removed, uuid
        ));
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use transit_core::MemoryStore;

    const SNAPSHOT: &str = r#"{
  "schema_version": 1,
  "model": {
    "uuid": "0f4e5a6b-7c8d-4e9f-a0b1-c2d3e4f5a6b7",
    "name": "prod",
    "owner": "admin",
    "config": {},
    "life": "alive"
  },
  "machines": [
    {
      "id": "0",
      "life": "alive",
      "series": "jammy",
      "instance_id": null,
      "addresses": [],
      "jobs": ["host-units"]
    }
  ],
  "applications": [],
  "units": [],
  "relations": []
}
"#;

    #[tokio::test]
    async fn test_export_to_file_then_import() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("prod.json");
        tokio::fs::write(&input, SNAPSHOT).await.unwrap();

        let ctx = MigrationContext::default();
        let source = Arc::new(MemoryStore::new());
        let handle = import(source.clone(), &input, &ctx).await.unwrap();
        assert_eq!(handle.to_string(), "admin/prod");

        let output = dir.path().join("export.json");
        export(source, &handle.uuid, Some(&output), &ctx)
            .await
            .unwrap();

        let destination = Arc::new(MemoryStore::new());
        let reimported = import(destination.clone(), &output, &ctx).await.unwrap();
        assert_eq!(reimported.uuid, handle.uuid);
        assert_eq!(destination.len(), 2);
    }

    #[tokio::test]
    async fn test_import_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = import(
            Arc::new(MemoryStore::new()),
            &dir.path().join("absent.json"),
            &MigrationContext::default(),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_recover_reports_nothing_removed() {
        let removed = recover(
            Arc::new(MemoryStore::new()),
            &ModelUuid::generate(),
            &MigrationContext::default(),
        )
        .await
        .unwrap();
        assert_eq!(removed, 0);
    }
}
