//! Agent and migration configuration
//!
//! A machine agent keeps its configuration in
//! `<data-dir>/agents/machine-<id>/agent.toml`. The file names the agent, says
//! how to reach the state store and may tune migrations:
//!
//! ```toml
//! tag = "machine-0"
//!
//! [store]
//! type = "remote"
//! url = "ws://10.0.0.1:8000"
//! username = "root"
//! password = "secret"
//!
//! [migration.export]
//! max_attempts = 5
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::id::MachineId;
use crate::{MigrationError, Result};

/// Default agent data directory
pub const DEFAULT_DATA_DIR: &str = "/var/lib/juju";

/// Connection parameters for the state store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    /// Process-local store, nothing persists
    Memory,
    /// Embedded SurrealKV store; an empty path keeps it in memory
    Embedded {
        #[serde(default)]
        path: String,
    },
    Remote {
        url: String,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
        #[serde(default = "default_namespace")]
        namespace: String,
        #[serde(default = "default_database")]
        database: String,
    },
}

fn default_namespace() -> String {
    "transit".to_string()
}

fn default_database() -> String {
    "state".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Embedded {
            path: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Read attempts before giving up with an inconsistent snapshot
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportConfig {
    /// Cap on operations per store transaction, on top of what the store allows
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ops_per_transaction: Option<usize>,
}

/// Tunables for export and import
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationConfig {
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub import: ImportConfig,
}

impl MigrationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.export.max_attempts == 0 {
            return Err(MigrationError::configuration(
                "migration.export.max_attempts",
                "must be at least 1",
            ));
        }
        if self.import.max_ops_per_transaction == Some(0) {
            return Err(MigrationError::configuration(
                "migration.import.max_ops_per_transaction",
                "must be at least 1 when set",
            ));
        }
        Ok(())
    }
}

/// Source of store connection parameters
pub trait ConfigProvider: Send + Sync {
    fn store_connection_info(&self) -> Result<StoreConfig>;

    fn migration_config(&self) -> MigrationConfig {
        MigrationConfig::default()
    }
}

/// On-disk configuration of one machine agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub tag: String,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub migration: MigrationConfig,
}

/// Path of a machine agent's configuration file under `data_dir`
pub fn agent_config_path(data_dir: &Path, machine: &MachineId) -> PathBuf {
    data_dir
        .join("agents")
        .join(machine.tag())
        .join("agent.toml")
}

impl AgentConfig {
    /// Load the configuration of the agent running `machine`
    pub async fn load(data_dir: &Path, machine: &MachineId) -> Result<Self> {
        let path = agent_config_path(data_dir, machine);
        let config = Self::load_from_file(&path).await?;

        if config.tag != machine.tag() {
            return Err(MigrationError::configuration(
                path.display().to_string(),
                format!(
                    "agent tag '{}' does not match machine tag '{}'",
                    config.tag,
                    machine.tag()
                ),
            ));
        }
        Ok(config)
    }

    pub async fn load_from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| MigrationError::configuration(path.display().to_string(), e))?;

        let config: AgentConfig = toml::from_str(&content)
            .map_err(|e| MigrationError::configuration(path.display().to_string(), e))?;
        config.migration.validate()?;

        tracing::debug!("Loaded agent config for {} from {}", config.tag, path.display());
        Ok(config)
    }

    pub async fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| MigrationError::configuration(path.display().to_string(), e))?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| MigrationError::configuration(path.display().to_string(), e))?;
        }
        tokio::fs::write(path, content)
            .await
            .map_err(|e| MigrationError::configuration(path.display().to_string(), e))
    }
}

impl ConfigProvider for AgentConfig {
    fn store_connection_info(&self) -> Result<StoreConfig> {
        Ok(self.store.clone())
    }

    fn migration_config(&self) -> MigrationConfig {
        self.migration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_agent_config_path_uses_machine_tag() {
        let machine = MachineId::parse("3/lxc/0").unwrap();
        assert_eq!(
            agent_config_path(Path::new("/var/lib/juju"), &machine),
            PathBuf::from("/var/lib/juju/agents/machine-3-lxc-0/agent.toml")
        );
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: AgentConfig = toml::from_str(r#"tag = "machine-0""#).unwrap();
        assert_eq!(config.store, StoreConfig::default());
        assert_eq!(config.migration.export.max_attempts, 3);
        assert_eq!(config.migration.import.max_ops_per_transaction, None);
    }

    #[test]
    fn test_remote_store_section() {
        let config: AgentConfig = toml::from_str(
            r#"
            tag = "machine-1"

            [store]
            type = "remote"
            url = "ws://10.0.0.1:8000"
            username = "root"
            password = "secret"

            [migration.import]
            max_ops_per_transaction = 500
            "#,
        )
        .unwrap();

        assert_eq!(
            config.store_connection_info().unwrap(),
            StoreConfig::Remote {
                url: "ws://10.0.0.1:8000".to_string(),
                username: Some("root".to_string()),
                password: Some("secret".to_string()),
                namespace: "transit".to_string(),
                database: "state".to_string(),
            }
        );
        assert_eq!(
            config.migration_config().import.max_ops_per_transaction,
            Some(500)
        );
    }

    #[tokio::test]
    async fn test_load_round_trips_through_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let machine = MachineId::parse("0").unwrap();
        let config = AgentConfig {
            tag: machine.tag(),
            store: StoreConfig::Memory,
            migration: MigrationConfig::default(),
        };
        config
            .save_to_file(&agent_config_path(dir.path(), &machine))
            .await
            .unwrap();

        let loaded = AgentConfig::load(dir.path(), &machine).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn test_load_rejects_mismatched_tag_and_bad_values() {
        let dir = tempfile::tempdir().unwrap();
        let machine = MachineId::parse("2").unwrap();
        let path = agent_config_path(dir.path(), &machine);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();

        tokio::fs::write(&path, "tag = \"machine-7\"").await.unwrap();
        let err = AgentConfig::load(dir.path(), &machine).await.unwrap_err();
        assert!(matches!(err, MigrationError::Configuration { .. }));

        tokio::fs::write(&path, "tag = \"machine-2\"\n[migration.export]\nmax_attempts = 0\n")
            .await
            .unwrap();
        let err = AgentConfig::load(dir.path(), &machine).await.unwrap_err();
        assert!(matches!(err, MigrationError::Configuration { ref path, .. } if path.contains("max_attempts")));
    }

    #[tokio::test]
    async fn test_missing_file_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let machine = MachineId::parse("0").unwrap();
        let err = AgentConfig::load(dir.path(), &machine).await.unwrap_err();
        assert!(matches!(err, MigrationError::Configuration { .. }));
    }
}
