//! Mapping between graph entities and store documents

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{Document, MigrationMode, ModelRecord, WriteOp};
use crate::graph::{Application, Machine, Model, ModelGraph, Relation, Unit};
use crate::id::{Collection, DocumentKey, ModelUuid};
use crate::{MigrationError, Result};

fn to_body<T: Serialize>(key: &DocumentKey, entity: &T) -> Result<serde_json::Value> {
    serde_json::to_value(entity).map_err(|e| MigrationError::malformed(key.to_string(), "body", e))
}

fn from_body<T: DeserializeOwned>(document: &Document) -> Result<T> {
    serde_json::from_value(document.body.clone())
        .map_err(|e| MigrationError::malformed(document.key.to_string(), "body", e))
}

/// Insert or replace the model document carrying `mode`
pub(crate) fn model_op(model: &Model, mode: Option<MigrationMode>, create: bool) -> Result<WriteOp> {
    let key = DocumentKey::model(&model.uuid);
    let body = to_body(
        &key,
        &ModelRecord {
            model: model.clone(),
            migration_mode: mode,
        },
    )?;
    Ok(if create {
        WriteOp::Insert {
            key,
            model_uuid: model.uuid,
            body,
        }
    } else {
        WriteOp::Replace {
            key,
            model_uuid: model.uuid,
            body,
        }
    })
}

fn insert<T: Serialize>(
    uuid: &ModelUuid,
    collection: Collection,
    local_id: impl std::fmt::Display,
    entity: &T,
) -> Result<WriteOp> {
    let key = DocumentKey::scoped(collection, uuid, local_id);
    Ok(WriteOp::Insert {
        body: to_body(&key, entity)?,
        key,
        model_uuid: *uuid,
    })
}

/// Insert operations for every child entity, grouped in dependency order:
/// machines (parents before containers), applications, units, relations
pub(crate) fn child_ops(graph: &ModelGraph) -> Result<Vec<Vec<WriteOp>>> {
    let uuid = graph.uuid();
    Ok(vec![
        graph
            .machines()
            .map(|m| insert(&uuid, Collection::Machine, &m.id, m))
            .collect::<Result<Vec<_>>>()?,
        graph
            .applications()
            .map(|a| insert(&uuid, Collection::Application, &a.name, a))
            .collect::<Result<Vec<_>>>()?,
        graph
            .units()
            .map(|u| insert(&uuid, Collection::Unit, &u.name, u))
            .collect::<Result<Vec<_>>>()?,
        graph
            .relations()
            .map(|r| insert(&uuid, Collection::Relation, r.key(), r))
            .collect::<Result<Vec<_>>>()?,
    ])
}

pub(crate) fn decode_model(document: &Document) -> Result<ModelRecord> {
    let record: ModelRecord = from_body(document)?;
    if DocumentKey::model(&record.model.uuid) != document.key {
        return Err(MigrationError::malformed(
            document.key.to_string(),
            "uuid",
            format!("document holds model '{}'", record.model.uuid),
        ));
    }
    Ok(record)
}

/// Check that a child document sits under the key its entity implies
fn check_key(document: &Document, uuid: &ModelUuid, local_id: impl std::fmt::Display) -> Result<()> {
    let expected = DocumentKey::scoped(document.key.collection, uuid, local_id);
    if expected != document.key {
        return Err(MigrationError::malformed(
            document.key.to_string(),
            "id",
            format!("entity belongs under {}", expected),
        ));
    }
    Ok(())
}

/// Rebuild a graph from a model and its child documents
pub(crate) fn graph_from_documents(model: Model, documents: &[Document]) -> Result<ModelGraph> {
    let uuid = model.uuid;
    let mut machines = Vec::new();
    let mut applications = Vec::new();
    let mut units = Vec::new();
    let mut relations = Vec::new();

    for document in documents {
        match document.key.collection {
            Collection::Machine => {
                let machine: Machine = from_body(document)?;
                check_key(document, &uuid, &machine.id)?;
                machines.push(machine);
            }
            Collection::Application => {
                let application: Application = from_body(document)?;
                check_key(document, &uuid, &application.name)?;
                applications.push(application);
            }
            Collection::Unit => {
                let unit: Unit = from_body(document)?;
                check_key(document, &uuid, &unit.name)?;
                units.push(unit);
            }
            Collection::Relation => {
                let relation: Relation = from_body(document)?;
                check_key(document, &uuid, relation.key())?;
                relations.push(relation);
            }
            Collection::Model => {
                return Err(MigrationError::malformed(
                    document.key.to_string(),
                    "id",
                    "model document inside a model scope",
                ));
            }
        }
    }

    Ok(ModelGraph::from_parts(
        model,
        machines,
        applications,
        units,
        relations,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::fixtures::*;
    use pretty_assertions::assert_eq;

    fn as_documents(ops: Vec<WriteOp>) -> Vec<Document> {
        ops.into_iter()
            .filter_map(|op| match op {
                WriteOp::Insert {
                    key,
                    model_uuid,
                    body,
                } => Some(Document {
                    key,
                    model_uuid,
                    revision: 1,
                    body,
                }),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_child_ops_round_trip_to_graph() {
        let graph = sample_graph(ModelUuid::generate());
        let groups = child_ops(&graph).unwrap();
        let sizes: Vec<usize> = groups.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![3, 2, 2, 1]);

        let documents = as_documents(groups.into_iter().flatten().collect());
        let rebuilt = graph_from_documents(graph.model().clone(), &documents).unwrap();
        assert_eq!(rebuilt, graph);
    }

    #[test]
    fn test_misplaced_document_is_rejected() {
        let graph = sample_graph(ModelUuid::generate());
        let mut documents = as_documents(child_ops(&graph).unwrap().remove(0));
        documents[0].key = DocumentKey::scoped(Collection::Machine, &graph.uuid(), "42");

        let err = graph_from_documents(graph.model().clone(), &documents).unwrap_err();
        assert!(matches!(err, MigrationError::MalformedSnapshot { ref field, .. } if field == "id"));
    }

    #[test]
    fn test_model_op_carries_mode() {
        let model = model(ModelUuid::generate());
        let op = model_op(&model, Some(MigrationMode::Importing), true).unwrap();
        let document = as_documents(vec![op]).remove(0);
        let record = decode_model(&document).unwrap();
        assert!(record.is_importing());
        assert_eq!(record.model, model);
    }
}
