//! In-memory entity graph for a single model
//!
//! A [`ModelGraph`] holds the complete state of one model: the model itself plus
//! its machines, applications, units and relations. The `add_*` accessors refuse
//! to create dangling references; [`ModelGraph::validate`] walks the whole graph
//! and reports every broken invariant at once.

mod entity;
mod validate;

pub use entity::{
    AddressKind, AddressScope, AgentStatus, Application, Endpoint, Life, Machine, MachineJob,
    Model, NetworkAddress, Relation, RelationRole, Settings, Unit, UnitStatus,
};
pub use validate::Violation;

use std::collections::BTreeMap;

use crate::id::{MachineId, ModelUuid, RelationKey, UnitName};

/// Errors returned when an edit would break the graph's references
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, miette::Diagnostic)]
pub enum GraphError {
    #[error("{kind} '{id}' already exists in the model")]
    #[diagnostic(code(transit_core::graph::duplicate))]
    Duplicate { kind: &'static str, id: String },

    #[error("{kind} '{id}' references missing {target_kind} '{target}'")]
    #[diagnostic(
        code(transit_core::graph::missing_reference),
        help("Add the referenced {target_kind} before the {kind}")
    )]
    MissingReference {
        kind: &'static str,
        id: String,
        target_kind: &'static str,
        target: String,
    },

    #[error("{kind} '{id}' is still referenced by {referrer}")]
    #[diagnostic(
        code(transit_core::graph::still_referenced),
        help("Remove the referencing entities first")
    )]
    StillReferenced {
        kind: &'static str,
        id: String,
        referrer: String,
    },

    #[error("{kind} '{id}' not found")]
    #[diagnostic(code(transit_core::graph::not_found))]
    NotFound { kind: &'static str, id: String },

    #[error("Unit '{unit}' does not belong to application '{application}'")]
    #[diagnostic(
        code(transit_core::graph::unit_application_mismatch),
        help("A unit's name must start with its application's name")
    )]
    UnitApplicationMismatch { unit: String, application: String },

    #[error("Relation '{key}' is invalid: {reason}")]
    #[diagnostic(code(transit_core::graph::invalid_relation))]
    InvalidRelation { key: String, reason: String },
}

/// Complete, ordered description of one model
///
/// Collections are keyed maps, so iteration always follows the deterministic
/// order the snapshot format relies on: machines by id, applications by name,
/// units by (application, number), relations by key.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelGraph {
    model: Model,
    machines: BTreeMap<MachineId, Machine>,
    applications: BTreeMap<String, Application>,
    units: BTreeMap<UnitName, Unit>,
    relations: BTreeMap<RelationKey, Relation>,
}

impl ModelGraph {
    /// Start a graph holding just the model entity
    pub fn new(model: Model) -> Self {
        Self {
            model,
            machines: BTreeMap::new(),
            applications: BTreeMap::new(),
            units: BTreeMap::new(),
            relations: BTreeMap::new(),
        }
    }

    /// Assemble a graph without checking references.
    ///
    /// Used when rebuilding from stored or serialized data, where the caller is
    /// expected to run [`ModelGraph::validate`] afterwards.
    pub(crate) fn from_parts(
        model: Model,
        machines: Vec<Machine>,
        applications: Vec<Application>,
        units: Vec<Unit>,
        relations: Vec<Relation>,
    ) -> Self {
        Self {
            model,
            machines: machines.into_iter().map(|m| (m.id.clone(), m)).collect(),
            applications: applications
                .into_iter()
                .map(|a| (a.name.clone(), a))
                .collect(),
            units: units.into_iter().map(|u| (u.name.clone(), u)).collect(),
            relations: relations.into_iter().map(|r| (r.key(), r)).collect(),
        }
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn uuid(&self) -> ModelUuid {
        self.model.uuid
    }

    pub fn machines(&self) -> impl Iterator<Item = &Machine> {
        self.machines.values()
    }

    pub fn applications(&self) -> impl Iterator<Item = &Application> {
        self.applications.values()
    }

    pub fn units(&self) -> impl Iterator<Item = &Unit> {
        self.units.values()
    }

    pub fn relations(&self) -> impl Iterator<Item = &Relation> {
        self.relations.values()
    }

    pub fn machine(&self, id: &MachineId) -> Option<&Machine> {
        self.machines.get(id)
    }

    pub fn application(&self, name: &str) -> Option<&Application> {
        self.applications.get(name)
    }

    pub fn unit(&self, name: &UnitName) -> Option<&Unit> {
        self.units.get(name)
    }

    pub fn relation(&self, key: &RelationKey) -> Option<&Relation> {
        self.relations.get(key)
    }

    /// Total number of entities, the model included
    pub fn entity_count(&self) -> usize {
        1 + self.machines.len() + self.applications.len() + self.units.len() + self.relations.len()
    }

    /// Add a machine. Containers require their parent machine to be present.
    pub fn add_machine(&mut self, machine: Machine) -> Result<(), GraphError> {
        if self.machines.contains_key(&machine.id) {
            return Err(GraphError::Duplicate {
                kind: "machine",
                id: machine.id.to_string(),
            });
        }
        if let Some(parent) = machine.id.parent() {
            if !self.machines.contains_key(&parent) {
                return Err(GraphError::MissingReference {
                    kind: "machine",
                    id: machine.id.to_string(),
                    target_kind: "machine",
                    target: parent.to_string(),
                });
            }
        }
        self.machines.insert(machine.id.clone(), machine);
        Ok(())
    }

    pub fn add_application(&mut self, application: Application) -> Result<(), GraphError> {
        if self.applications.contains_key(&application.name) {
            return Err(GraphError::Duplicate {
                kind: "application",
                id: application.name,
            });
        }
        self.applications
            .insert(application.name.clone(), application);
        Ok(())
    }

    /// Add a unit. Its application and machine must already be present.
    pub fn add_unit(&mut self, unit: Unit) -> Result<(), GraphError> {
        if self.units.contains_key(&unit.name) {
            return Err(GraphError::Duplicate {
                kind: "unit",
                id: unit.name.to_string(),
            });
        }
        if unit.name.application() != unit.application {
            return Err(GraphError::UnitApplicationMismatch {
                unit: unit.name.to_string(),
                application: unit.application,
            });
        }
        if !self.applications.contains_key(&unit.application) {
            return Err(GraphError::MissingReference {
                kind: "unit",
                id: unit.name.to_string(),
                target_kind: "application",
                target: unit.application,
            });
        }
        if !self.machines.contains_key(&unit.machine) {
            return Err(GraphError::MissingReference {
                kind: "unit",
                id: unit.name.to_string(),
                target_kind: "machine",
                target: unit.machine.to_string(),
            });
        }
        self.units.insert(unit.name.clone(), unit);
        Ok(())
    }

    /// Add a relation, keyed by its derived relation key.
    pub fn add_relation(&mut self, relation: Relation) -> Result<RelationKey, GraphError> {
        let key = relation.key();
        if let Some(reason) = relation.shape_problem() {
            return Err(GraphError::InvalidRelation {
                key: key.to_string(),
                reason,
            });
        }
        if self.relations.contains_key(&key) {
            return Err(GraphError::Duplicate {
                kind: "relation",
                id: key.to_string(),
            });
        }
        for endpoint in &relation.endpoints {
            if !self.applications.contains_key(&endpoint.application) {
                return Err(GraphError::MissingReference {
                    kind: "relation",
                    id: key.to_string(),
                    target_kind: "application",
                    target: endpoint.application.clone(),
                });
            }
        }
        for unit in relation.unit_settings.keys() {
            if !self.units.contains_key(unit) {
                return Err(GraphError::MissingReference {
                    kind: "relation",
                    id: key.to_string(),
                    target_kind: "unit",
                    target: unit.to_string(),
                });
            }
            if !relation.involves(unit.application()) {
                return Err(GraphError::InvalidRelation {
                    key: key.to_string(),
                    reason: format!("unit '{}' is not part of the relation", unit),
                });
            }
        }
        self.relations.insert(key.clone(), relation);
        Ok(key)
    }

    /// Remove a machine that hosts no units and no containers
    pub fn remove_machine(&mut self, id: &MachineId) -> Result<Machine, GraphError> {
        if let Some(unit) = self.units.values().find(|u| &u.machine == id) {
            return Err(GraphError::StillReferenced {
                kind: "machine",
                id: id.to_string(),
                referrer: format!("unit '{}'", unit.name),
            });
        }
        if let Some(child) = self
            .machines
            .keys()
            .find(|m| m.parent().as_ref() == Some(id))
        {
            return Err(GraphError::StillReferenced {
                kind: "machine",
                id: id.to_string(),
                referrer: format!("container '{}'", child),
            });
        }
        self.machines.remove(id).ok_or_else(|| GraphError::NotFound {
            kind: "machine",
            id: id.to_string(),
        })
    }

    /// Remove an application that has no units and takes part in no relation
    pub fn remove_application(&mut self, name: &str) -> Result<Application, GraphError> {
        if let Some(unit) = self.units.values().find(|u| u.application == name) {
            return Err(GraphError::StillReferenced {
                kind: "application",
                id: name.to_string(),
                referrer: format!("unit '{}'", unit.name),
            });
        }
        if let Some(key) = self
            .relations
            .iter()
            .find(|(_, r)| r.involves(name))
            .map(|(key, _)| key)
        {
            return Err(GraphError::StillReferenced {
                kind: "application",
                id: name.to_string(),
                referrer: format!("relation '{}'", key),
            });
        }
        self.applications
            .remove(name)
            .ok_or_else(|| GraphError::NotFound {
                kind: "application",
                id: name.to_string(),
            })
    }

    /// Remove a unit, dropping its relation settings
    pub fn remove_unit(&mut self, name: &UnitName) -> Result<Unit, GraphError> {
        let unit = self.units.remove(name).ok_or_else(|| GraphError::NotFound {
            kind: "unit",
            id: name.to_string(),
        })?;
        for relation in self.relations.values_mut() {
            relation.unit_settings.remove(name);
        }
        Ok(unit)
    }

    pub fn remove_relation(&mut self, key: &RelationKey) -> Result<Relation, GraphError> {
        self.relations
            .remove(key)
            .ok_or_else(|| GraphError::NotFound {
                kind: "relation",
                id: key.to_string(),
            })
    }

    /// Check every graph invariant, collecting all violations
    pub fn validate(&self) -> Result<(), Vec<Violation>> {
        let violations = validate::check(self);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}
