//! Portable snapshot format
//!
//! A snapshot is a pretty-printed JSON document:
//!
//! ```json
//! {
//!   "schema_version": 1,
//!   "model": { "uuid": "...", "name": "...", ... },
//!   "machines": [ ... ],
//!   "applications": [ ... ],
//!   "units": [ ... ],
//!   "relations": [ { "key": "mysql:server wordpress:db", ... } ]
//! }
//! ```
//!
//! Collections are emitted in graph order and every map is key-sorted, so the
//! same graph always encodes to the same bytes. Decoding checks the schema
//! version before anything else and then reads each entity field by field, so
//! a bad document is reported against the entity and field that broke it.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeSet;

use crate::graph::{
    Application, Endpoint, Machine, Model, ModelGraph, Relation, Settings, Unit,
};
use crate::{MigrationError, Result};

/// Schema version written by this build
pub const CURRENT_VERSION: u32 = 1;

/// Schema versions this build can read
pub const SUPPORTED_VERSIONS: &[u32] = &[1];

#[derive(Serialize)]
struct RelationOut<'a> {
    key: String,
    #[serde(flatten)]
    relation: &'a Relation,
}

#[derive(Serialize)]
struct SnapshotOut<'a> {
    schema_version: u32,
    model: &'a Model,
    machines: Vec<&'a Machine>,
    applications: Vec<&'a Application>,
    units: Vec<&'a Unit>,
    relations: Vec<RelationOut<'a>>,
}

/// Encode a graph as a snapshot document
pub fn encode(graph: &ModelGraph) -> Result<Vec<u8>> {
    let document = SnapshotOut {
        schema_version: CURRENT_VERSION,
        model: graph.model(),
        machines: graph.machines().collect(),
        applications: graph.applications().collect(),
        units: graph.units().collect(),
        relations: graph
            .relations()
            .map(|relation| RelationOut {
                key: relation.key().to_string(),
                relation,
            })
            .collect(),
    };

    let mut bytes = serde_json::to_vec_pretty(&document)
        .map_err(|e| MigrationError::malformed("snapshot", "document", e))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Read only the schema version of a snapshot, rejecting unsupported ones
pub fn schema_version(bytes: &[u8]) -> Result<u32> {
    let document: Value = serde_json::from_slice(bytes)
        .map_err(|e| MigrationError::malformed("snapshot", "document", e))?;
    let root = document
        .as_object()
        .ok_or_else(|| MigrationError::malformed("snapshot", "document", "expected an object"))?;
    check_version(root)
}

fn check_version(root: &Map<String, Value>) -> Result<u32> {
    let value = root.get("schema_version").ok_or_else(|| {
        MigrationError::malformed("snapshot", "schema_version", "missing required field")
    })?;
    let found = value.as_u64().ok_or_else(|| {
        MigrationError::malformed(
            "snapshot",
            "schema_version",
            format!("expected a positive integer, found {}", value),
        )
    })?;

    match u32::try_from(found) {
        Ok(version) if SUPPORTED_VERSIONS.contains(&version) => Ok(version),
        _ => Err(MigrationError::UnsupportedVersion {
            found,
            supported: SUPPORTED_VERSIONS.to_vec(),
        }),
    }
}

/// Decode a snapshot document into a graph.
///
/// The graph is not validated here; callers run [`ModelGraph::validate`].
pub fn decode(bytes: &[u8]) -> Result<ModelGraph> {
    let document: Value = serde_json::from_slice(bytes)
        .map_err(|e| MigrationError::malformed("snapshot", "document", e))?;
    let root = Fields::new("snapshot".to_string(), &document)?;
    let version = check_version(root.object)?;
    tracing::debug!("Decoding snapshot with schema version {}", version);

    let model = decode_model(&root)?;

    let machines = root
        .sequence("machines")?
        .iter()
        .enumerate()
        .map(|(i, value)| decode_machine(i, value))
        .collect::<Result<Vec<_>>>()?;
    reject_duplicates("machine", machines.iter().map(|m| m.id.to_string()))?;

    let applications = root
        .sequence("applications")?
        .iter()
        .enumerate()
        .map(|(i, value)| decode_application(i, value))
        .collect::<Result<Vec<_>>>()?;
    reject_duplicates("application", applications.iter().map(|a| a.name.clone()))?;

    let units = root
        .sequence("units")?
        .iter()
        .enumerate()
        .map(|(i, value)| decode_unit(i, value))
        .collect::<Result<Vec<_>>>()?;
    reject_duplicates("unit", units.iter().map(|u| u.name.to_string()))?;

    let relations = root
        .sequence("relations")?
        .iter()
        .enumerate()
        .map(|(i, value)| decode_relation(i, value))
        .collect::<Result<Vec<_>>>()?;
    reject_duplicates("relation", relations.iter().map(|r| r.key().to_string()))?;

    Ok(ModelGraph::from_parts(
        model,
        machines,
        applications,
        units,
        relations,
    ))
}

/// Field reader over one JSON object that names the entity in every error
struct Fields<'a> {
    entity: String,
    object: &'a Map<String, Value>,
}

impl<'a> Fields<'a> {
    fn new(entity: String, value: &'a Value) -> Result<Self> {
        let object = value.as_object().ok_or_else(|| {
            MigrationError::malformed(entity.clone(), "*", "expected an object")
        })?;
        Ok(Self { entity, object })
    }

    fn present(&self, field: &str) -> Option<&'a Value> {
        self.object.get(field).filter(|v| !v.is_null())
    }

    fn parse<T: DeserializeOwned>(&self, field: &str, value: &Value) -> Result<T> {
        serde_json::from_value(value.clone())
            .map_err(|e| MigrationError::malformed(self.entity.clone(), field, e))
    }

    fn required<T: DeserializeOwned>(&self, field: &str) -> Result<T> {
        let value = self.present(field).ok_or_else(|| {
            MigrationError::malformed(self.entity.clone(), field, "missing required field")
        })?;
        self.parse(field, value)
    }

    fn optional<T: DeserializeOwned>(&self, field: &str) -> Result<Option<T>> {
        self.present(field)
            .map(|value| self.parse(field, value))
            .transpose()
    }

    fn or_default<T: DeserializeOwned + Default>(&self, field: &str) -> Result<T> {
        Ok(self.optional(field)?.unwrap_or_default())
    }

    fn sequence(&self, field: &str) -> Result<&'a Vec<Value>> {
        self.present(field)
            .ok_or_else(|| {
                MigrationError::malformed(self.entity.clone(), field, "missing required field")
            })?
            .as_array()
            .ok_or_else(|| {
                MigrationError::malformed(self.entity.clone(), field, "expected a sequence")
            })
    }

    /// Re-label the entity once its identifier is known
    fn rename(self, entity: String) -> Self {
        Self { entity, ..self }
    }
}

fn decode_model(root: &Fields<'_>) -> Result<Model> {
    let value = root.present("model").ok_or_else(|| {
        MigrationError::malformed("snapshot", "model", "missing required field")
    })?;
    let fields = Fields::new("model".to_string(), value)?;
    Ok(Model {
        uuid: fields.required("uuid")?,
        name: fields.required("name")?,
        owner: fields.required("owner")?,
        config: fields.or_default::<Settings>("config")?,
        life: fields.required("life")?,
    })
}

fn decode_machine(index: usize, value: &Value) -> Result<Machine> {
    let fields = Fields::new(format!("machine #{}", index), value)?;
    let id: crate::id::MachineId = fields.required("id")?;
    let fields = fields.rename(format!("machine '{}'", id));
    Ok(Machine {
        life: fields.required("life")?,
        series: fields.required("series")?,
        instance_id: fields.optional("instance_id")?,
        addresses: fields.or_default("addresses")?,
        jobs: fields.or_default("jobs")?,
        id,
    })
}

fn decode_application(index: usize, value: &Value) -> Result<Application> {
    let fields = Fields::new(format!("application #{}", index), value)?;
    let name: String = fields.required("name")?;
    let fields = fields.rename(format!("application '{}'", name));
    Ok(Application {
        charm_url: fields.required("charm_url")?,
        settings: fields.or_default("settings")?,
        exposed: fields.or_default("exposed")?,
        life: fields.required("life")?,
        name,
    })
}

fn decode_unit(index: usize, value: &Value) -> Result<Unit> {
    let fields = Fields::new(format!("unit #{}", index), value)?;
    let name: crate::id::UnitName = fields.required("name")?;
    let fields = fields.rename(format!("unit '{}'", name));
    Ok(Unit {
        application: fields.required("application")?,
        machine: fields.required("machine")?,
        life: fields.required("life")?,
        agent_status: fields.required("agent_status")?,
        name,
    })
}

fn decode_endpoint(relation: usize, index: usize, value: &Value) -> Result<Endpoint> {
    let fields = Fields::new(format!("relation #{} endpoint #{}", relation, index), value)?;
    Ok(Endpoint {
        application: fields.required("application")?,
        name: fields.required("name")?,
        role: fields.required("role")?,
        interface: fields.required("interface")?,
    })
}

fn decode_relation(index: usize, value: &Value) -> Result<Relation> {
    let fields = Fields::new(format!("relation #{}", index), value)?;
    let endpoints = fields
        .sequence("endpoints")?
        .iter()
        .enumerate()
        .map(|(j, endpoint)| decode_endpoint(index, j, endpoint))
        .collect::<Result<Vec<_>>>()?;

    let relation = Relation {
        id: fields.required("id")?,
        endpoints,
        unit_settings: fields.or_default("unit_settings")?,
    };

    let key = relation.key();
    if let Some(stored) = fields.optional::<String>("key")? {
        if stored != key.as_str() {
            tracing::warn!(
                "Relation #{} carries key '{}' but its endpoints give '{}'; using the derived key",
                index,
                stored,
                key
            );
        }
    }
    Ok(relation)
}

fn reject_duplicates(kind: &str, ids: impl Iterator<Item = String>) -> Result<()> {
    let mut seen = BTreeSet::new();
    for id in ids {
        if !seen.insert(id.clone()) {
            return Err(MigrationError::malformed(
                format!("{} '{}'", kind, id),
                "id",
                format!("{} appears more than once", kind),
            ));
        }
    }
    Ok(())
}
