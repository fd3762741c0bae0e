//! Whole-graph invariant checking

use crate::id::is_valid_application_name;

use super::{Life, ModelGraph};

/// A single broken invariant found while validating a graph
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, miette::Diagnostic)]
pub enum Violation {
    #[error("model '{uuid}' is dead and cannot be migrated")]
    #[diagnostic(code(transit_core::invariant::dead_model))]
    DeadModel { uuid: String },

    #[error("{entity} references missing {target_kind} '{target}'")]
    #[diagnostic(code(transit_core::invariant::dangling_reference))]
    DanglingReference {
        entity: String,
        target_kind: &'static str,
        target: String,
    },

    #[error("container '{machine}' has no parent machine '{parent}' in the model")]
    #[diagnostic(code(transit_core::invariant::missing_parent_machine))]
    MissingParentMachine { machine: String, parent: String },

    #[error("unit '{unit}' is recorded under application '{application}'")]
    #[diagnostic(code(transit_core::invariant::unit_application_mismatch))]
    UnitApplicationMismatch { unit: String, application: String },

    #[error("'{name}' is not a valid application name")]
    #[diagnostic(code(transit_core::invariant::invalid_application_name))]
    InvalidApplicationName { name: String },

    #[error("{entity} is {life} but depends on {dependency} which is {dependency_life}")]
    #[diagnostic(
        code(transit_core::invariant::life_regression),
        help("An entity can never be more alive than what it depends on")
    )]
    LifeRegression {
        entity: String,
        life: Life,
        dependency: String,
        dependency_life: Life,
    },

    #[error("relation '{key}' is invalid: {reason}")]
    #[diagnostic(code(transit_core::invariant::invalid_relation))]
    InvalidRelation { key: String, reason: String },

    #[error("relation '{key}' holds settings for unit '{unit}' outside the relation")]
    #[diagnostic(code(transit_core::invariant::foreign_relation_settings))]
    ForeignRelationSettings { key: String, unit: String },

    #[error("unit '{unit}' is placed on machine '{machine}' which cannot host units")]
    #[diagnostic(
        code(transit_core::invariant::machine_cannot_host_units),
        help("Machines hosting units need the host-units job")
    )]
    MachineCannotHostUnits { unit: String, machine: String },
}

/// An entity lags behind its dependency when the dependency could not move
/// forward to the entity's life
fn lags_behind(life: Life, dependency: Life) -> bool {
    !dependency.can_become(life)
}

/// Walk the graph and return every violation found, in graph order
pub(super) fn check(graph: &ModelGraph) -> Vec<Violation> {
    let mut violations = Vec::new();
    let model = graph.model();

    if model.life == Life::Dead {
        violations.push(Violation::DeadModel {
            uuid: model.uuid.to_string(),
        });
    }

    for machine in graph.machines() {
        let Some(parent_id) = machine.parent() else {
            continue;
        };
        match graph.machine(&parent_id) {
            None => violations.push(Violation::MissingParentMachine {
                machine: machine.id.to_string(),
                parent: parent_id.to_string(),
            }),
            Some(parent) => {
                if lags_behind(machine.life, parent.life) {
                    violations.push(Violation::LifeRegression {
                        entity: format!("container '{}'", machine.id),
                        life: machine.life,
                        dependency: format!("machine '{}'", parent.id),
                        dependency_life: parent.life,
                    });
                }
            }
        }
    }

    for application in graph.applications() {
        if !is_valid_application_name(&application.name) {
            violations.push(Violation::InvalidApplicationName {
                name: application.name.clone(),
            });
        }
    }

    for unit in graph.units() {
        let entity = format!("unit '{}'", unit.name);

        if unit.name.application() != unit.application {
            violations.push(Violation::UnitApplicationMismatch {
                unit: unit.name.to_string(),
                application: unit.application.clone(),
            });
        }

        match graph.application(&unit.application) {
            None => violations.push(Violation::DanglingReference {
                entity: entity.clone(),
                target_kind: "application",
                target: unit.application.clone(),
            }),
            Some(application) if lags_behind(unit.life, application.life) => {
                violations.push(Violation::LifeRegression {
                    entity: entity.clone(),
                    life: unit.life,
                    dependency: format!("application '{}'", application.name),
                    dependency_life: application.life,
                });
            }
            Some(_) => {}
        }

        match graph.machine(&unit.machine) {
            None => violations.push(Violation::DanglingReference {
                entity: entity.clone(),
                target_kind: "machine",
                target: unit.machine.to_string(),
            }),
            Some(machine) => {
                if !machine.hosts_units() {
                    violations.push(Violation::MachineCannotHostUnits {
                        unit: unit.name.to_string(),
                        machine: machine.id.to_string(),
                    });
                }
                if lags_behind(unit.life, machine.life) {
                    violations.push(Violation::LifeRegression {
                        entity,
                        life: unit.life,
                        dependency: format!("machine '{}'", machine.id),
                        dependency_life: machine.life,
                    });
                }
            }
        }
    }

    for relation in graph.relations() {
        let key = relation.key();

        if let Some(reason) = relation.shape_problem() {
            violations.push(Violation::InvalidRelation {
                key: key.to_string(),
                reason,
            });
        }

        for endpoint in &relation.endpoints {
            if graph.application(&endpoint.application).is_none() {
                violations.push(Violation::DanglingReference {
                    entity: format!("relation '{}'", key),
                    target_kind: "application",
                    target: endpoint.application.clone(),
                });
            }
        }

        for unit in relation.unit_settings.keys() {
            if graph.unit(unit).is_none() {
                violations.push(Violation::DanglingReference {
                    entity: format!("relation '{}'", key),
                    target_kind: "unit",
                    target: unit.to_string(),
                });
            } else if !relation.involves(unit.application()) {
                violations.push(Violation::ForeignRelationSettings {
                    key: key.to_string(),
                    unit: unit.to_string(),
                });
            }
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::super::*;
    use crate::id::{MachineId, ModelUuid, UnitName};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_sample_graph_is_valid() {
        assert_eq!(sample_graph(ModelUuid::generate()).validate(), Ok(()));
    }

    #[test]
    fn test_reports_every_violation() {
        let uuid = ModelUuid::generate();
        let mut dead_model = model(uuid);
        dead_model.life = Life::Dead;

        let mut container = machine("9/lxc/0");
        container.jobs.clear();

        let graph = ModelGraph::from_parts(
            dead_model,
            vec![container],
            vec![application("wordpress")],
            vec![unit("mysql/0", "5"), unit("wordpress/0", "9/lxc/0")],
            vec![],
        );

        let violations = graph.validate().unwrap_err();
        assert_eq!(
            violations,
            vec![
                Violation::DeadModel {
                    uuid: uuid.to_string()
                },
                Violation::MissingParentMachine {
                    machine: "9/lxc/0".to_string(),
                    parent: "9".to_string(),
                },
                Violation::DanglingReference {
                    entity: "unit 'mysql/0'".to_string(),
                    target_kind: "application",
                    target: "mysql".to_string(),
                },
                Violation::DanglingReference {
                    entity: "unit 'mysql/0'".to_string(),
                    target_kind: "machine",
                    target: "5".to_string(),
                },
                Violation::MachineCannotHostUnits {
                    unit: "wordpress/0".to_string(),
                    machine: "9/lxc/0".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_alive_unit_on_dead_machine() {
        let mut graph = sample_graph(ModelUuid::generate());
        let id = MachineId::parse("0").unwrap();
        let mut dead = graph.machine(&id).unwrap().clone();
        dead.life = Life::Dead;
        graph.machines.insert(id, dead);

        let violations = graph.validate().unwrap_err();
        assert_eq!(violations.len(), 1);
        assert!(matches!(
            &violations[0],
            Violation::LifeRegression {
                life: Life::Alive,
                dependency_life: Life::Dead,
                ..
            }
        ));
    }

    #[test]
    fn test_relation_on_missing_application() {
        let uuid = ModelUuid::generate();
        let sample = sample_graph(uuid);
        let relation = Relation {
            id: 7,
            endpoints: vec![
                endpoint("wordpress", "cache", RelationRole::Requirer),
                endpoint("memcached", "cache", RelationRole::Provider),
            ],
            unit_settings: Default::default(),
        };
        let graph = ModelGraph::from_parts(
            model(uuid),
            sample.machines().cloned().collect(),
            sample.applications().cloned().collect(),
            sample.units().cloned().collect(),
            vec![relation],
        );

        assert_eq!(
            graph.validate().unwrap_err(),
            vec![Violation::DanglingReference {
                entity: "relation 'memcached:cache wordpress:cache'".to_string(),
                target_kind: "application",
                target: "memcached".to_string(),
            }]
        );
    }

    #[test]
    fn test_relation_with_malformed_endpoint_name() {
        let uuid = ModelUuid::generate();
        let sample = sample_graph(uuid);
        let graph = ModelGraph::from_parts(
            model(uuid),
            sample.machines().cloned().collect(),
            sample.applications().cloned().collect(),
            sample.units().cloned().collect(),
            vec![Relation {
                id: 8,
                endpoints: vec![endpoint(
                    "mysql",
                    "cluster wordpress:db",
                    RelationRole::Peer,
                )],
                unit_settings: Default::default(),
            }],
        );

        let violations = graph.validate().unwrap_err();
        assert_eq!(violations.len(), 1);
        assert!(matches!(
            &violations[0],
            Violation::InvalidRelation { reason, .. } if reason.contains("cluster wordpress:db")
        ));
    }

    #[test]
    fn test_relation_settings_for_foreign_unit() {
        let mut graph = sample_graph(ModelUuid::generate());
        graph.add_application(application("nagios")).unwrap();
        graph.add_unit(unit("nagios/0", "0")).unwrap();

        let key = graph.relations().next().unwrap().key();
        let relation = graph.relations.get_mut(&key).unwrap();
        relation
            .unit_settings
            .insert(UnitName::parse("nagios/0").unwrap(), Settings::new());

        let violations = graph.validate().unwrap_err();
        assert_eq!(
            violations,
            vec![Violation::ForeignRelationSettings {
                key: key.to_string(),
                unit: "nagios/0".to_string(),
            }]
        );
    }
}
