//! Transit Core - model migration engine
//!
//! This crate moves a model's entity graph between state stores: it exports
//! a point-in-time consistent snapshot from a live store, encodes it as a
//! portable document, and imports it into another store without ever leaving
//! a partially written model behind.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod export;
pub mod graph;
pub mod id;
pub mod import;
pub mod snapshot;
pub mod store;
pub mod utils;

// Macros are automatically available at crate root due to #[macro_export]

pub use config::{AgentConfig, ConfigProvider, MigrationConfig, StoreConfig};
pub use coordinator::{Coordinator, MigrationContext};
pub use error::{MigrationError, Result};
pub use export::{ExportOptions, ExportOutcome, Exporter};
pub use graph::{ModelGraph, Violation};
pub use id::{DocumentKey, MachineId, ModelUuid, RelationKey, UnitName};
pub use import::{ImportOptions, Importer, ModelHandle};
pub use store::{MemoryStore, StateStore, StoreError, open_store};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{
        AgentConfig, ConfigProvider, Coordinator, MachineId, MigrationConfig, MigrationContext,
        MigrationError, ModelGraph, ModelHandle, ModelUuid, Result, StateStore, StoreConfig,
        UnitName, open_store,
    };
}
