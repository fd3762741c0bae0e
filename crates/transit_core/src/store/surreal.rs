//! SurrealDB state store
//!
//! One `<collection>_doc` table per collection. Each record carries the
//! document id, owning model, revision and the JSON body as a string; the
//! `transit_meta:sequence` record holds the global change sequence.

use async_trait::async_trait;
use std::collections::HashMap;
use serde::Deserialize;
use surrealdb::Surreal;
use surrealdb::engine::any::{self, Any};
use surrealdb::opt::auth::Root;

use super::{ChangeToken, Document, Result, StateStore, StoreCapabilities, StoreError, WriteOp};
use crate::config::StoreConfig;
use crate::id::{Collection, DocumentKey, ModelUuid};

const EMBEDDED_NAMESPACE: &str = "transit";
const EMBEDDED_DATABASE: &str = "state";
const SEQUENCE_RECORD: &str = "transit_meta:sequence";
const DOCUMENT_EXISTS: &str = "transit:document_exists:";
const DOCUMENT_MISSING: &str = "transit:document_missing:";

fn table(collection: Collection) -> &'static str {
    match collection {
        Collection::Model => "model_doc",
        Collection::Machine => "machine_doc",
        Collection::Application => "application_doc",
        Collection::Unit => "unit_doc",
        Collection::Relation => "relation_doc",
    }
}

fn bump_sequence() -> String {
    format!("UPSERT {SEQUENCE_RECORD} SET value = (value OR 0) + 1 RETURN VALUE value")
}

/// Record layout shared by every collection table
#[derive(Debug, Deserialize)]
struct Row {
    doc_id: String,
    model_uuid: String,
    revision: i64,
    body: String,
}

impl Row {
    fn into_document(self, collection: Collection) -> Result<Document> {
        let key = DocumentKey {
            collection,
            id: self.doc_id,
        };
        let model_uuid = ModelUuid::parse(&self.model_uuid).map_err(|e| StoreError::Backend {
            operation: format!("decode {}", key),
            cause: Box::new(e),
        })?;
        let body = serde_json::from_str(&self.body).map_err(|cause| StoreError::Codec {
            key: key.to_string(),
            cause,
        })?;
        Ok(Document {
            key,
            model_uuid,
            revision: self.revision.max(0) as ChangeToken,
            body,
        })
    }
}

fn backend(operation: &str) -> impl FnOnce(surrealdb::Error) -> StoreError + '_ {
    move |e| StoreError::Backend {
        operation: operation.to_string(),
        cause: Box::new(e),
    }
}

/// Map a failed write transaction back to the op whose guard threw.
///
/// Guards throw `<marker><op index>`; anything else is a backend failure.
fn write_failure(errors: HashMap<usize, surrealdb::Error>, ops: &[WriteOp]) -> StoreError {
    let messages: Vec<String> = errors.values().map(|e| e.to_string()).collect();
    for message in &messages {
        for (marker, exists) in [(DOCUMENT_EXISTS, true), (DOCUMENT_MISSING, false)] {
            let Some((_, rest)) = message.split_once(marker) else {
                continue;
            };
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            if let Some(op) = digits.parse::<usize>().ok().and_then(|i| ops.get(i)) {
                let key = op.key().clone();
                return if exists {
                    StoreError::DocumentExists { key }
                } else {
                    StoreError::DocumentMissing { key }
                };
            }
        }
    }

    match errors.into_iter().min_by_key(|(index, _)| *index) {
        Some((_, e)) => backend("write_transaction")(e),
        None => StoreError::Backend {
            operation: "write_transaction".to_string(),
            cause: "transaction failed without an error".into(),
        },
    }
}

fn unavailable(e: surrealdb::Error) -> StoreError {
    StoreError::Unavailable { cause: Box::new(e) }
}

pub struct SurrealStore {
    db: Surreal<Any>,
    endpoint: String,
}

impl std::fmt::Debug for SurrealStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurrealStore")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl SurrealStore {
    /// Connect using an embedded or remote store configuration
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        match config {
            StoreConfig::Embedded { path } => {
                let endpoint = if path.is_empty() {
                    "mem://".to_string()
                } else {
                    if let Some(parent) = std::path::Path::new(path).parent() {
                        if !parent.as_os_str().is_empty() && !parent.exists() {
                            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                                StoreError::Unavailable { cause: Box::new(e) }
                            })?;
                        }
                    }
                    format!("surrealkv://{}", path)
                };

                tracing::info!("Opening embedded state store at {}", endpoint);
                let db = any::connect(endpoint.as_str())
                    .await
                    .map_err(unavailable)?;
                db.use_ns(EMBEDDED_NAMESPACE)
                    .use_db(EMBEDDED_DATABASE)
                    .await
                    .map_err(unavailable)?;

                Ok(Self { db, endpoint })
            }
            StoreConfig::Remote {
                url,
                username,
                password,
                namespace,
                database,
            } => {
                tracing::info!("Connecting to state store at {}", url);
                let db = any::connect(url.as_str()).await.map_err(unavailable)?;

                if let (Some(username), Some(password)) = (username, password) {
                    db.signin(Root {
                        username: username.as_str(),
                        password: password.as_str(),
                    })
                    .await
                    .map_err(unavailable)?;
                }

                db.use_ns(namespace.as_str())
                    .use_db(database.as_str())
                    .await
                    .map_err(unavailable)?;

                Ok(Self {
                    db,
                    endpoint: url.clone(),
                })
            }
            StoreConfig::Memory => Err(StoreError::Unavailable {
                cause: "the memory store is not backed by SurrealDB".into(),
            }),
        }
    }

}

fn encode_body(key: &DocumentKey, body: &serde_json::Value) -> Result<String> {
    serde_json::to_string(body).map_err(|cause| StoreError::Codec {
        key: key.to_string(),
        cause,
    })
}

#[async_trait]
impl StateStore for SurrealStore {
    fn backend_name(&self) -> &'static str {
        "surrealdb"
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            multi_document_transactions: true,
            max_ops_per_transaction: None,
        }
    }

    async fn read_by_id(&self, key: &DocumentKey) -> Result<Option<Document>> {
        let mut response = self
            .db
            .query("SELECT doc_id, model_uuid, revision, body FROM type::thing($tb, $id)")
            .bind(("tb", table(key.collection)))
            .bind(("id", key.id.clone()))
            .await
            .map_err(backend("read_by_id"))?;

        let rows: Vec<Row> = response.take(0).map_err(backend("read_by_id"))?;
        rows.into_iter()
            .next()
            .map(|row| row.into_document(key.collection))
            .transpose()
    }

    async fn read_all_by_model_scope(&self, uuid: &ModelUuid) -> Result<Vec<Document>> {
        let sql = Collection::CHILDREN
            .iter()
            .map(|c| {
                format!(
                    "SELECT doc_id, model_uuid, revision, body FROM {} WHERE model_uuid = $uuid;",
                    table(*c)
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let mut response = self
            .db
            .query(sql)
            .bind(("uuid", uuid.to_string()))
            .await
            .map_err(backend("read_all_by_model_scope"))?;

        let mut documents = Vec::new();
        for (index, collection) in Collection::CHILDREN.into_iter().enumerate() {
            let rows: Vec<Row> = response
                .take(index)
                .map_err(backend("read_all_by_model_scope"))?;
            for row in rows {
                documents.push(row.into_document(collection)?);
            }
        }
        documents.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(documents)
    }

    async fn change_token(&self) -> Result<ChangeToken> {
        let mut response = self
            .db
            .query(format!("SELECT VALUE value FROM {SEQUENCE_RECORD}"))
            .await
            .map_err(backend("change_token"))?;
        let values: Vec<i64> = response.take(0).map_err(backend("change_token"))?;
        Ok(values.first().copied().unwrap_or(0).max(0) as ChangeToken)
    }

    async fn write_transaction(&self, ops: Vec<WriteOp>) -> Result<ChangeToken> {
        let mut sql = format!("BEGIN TRANSACTION;\nLET $rev = ({})[0];\n", bump_sequence());
        let mut binds: Vec<(String, String)> = Vec::new();

        for (i, op) in ops.iter().enumerate() {
            let key = op.key();
            binds.push((format!("tb{i}"), table(key.collection).to_string()));
            binds.push((format!("id{i}"), key.id.clone()));

            match op {
                WriteOp::Insert {
                    key,
                    model_uuid,
                    body,
                } => {
                    binds.push((format!("m{i}"), model_uuid.to_string()));
                    binds.push((format!("b{i}"), encode_body(key, body)?));
                    sql.push_str(&format!(
                        "IF record::exists(type::thing($tb{i}, $id{i})) {{ THROW \"{DOCUMENT_EXISTS}{i}\" }};\n\
                         CREATE type::thing($tb{i}, $id{i}) CONTENT {{ doc_id: $id{i}, model_uuid: $m{i}, revision: $rev, body: $b{i} }};\n"
                    ));
                }
                WriteOp::Replace {
                    key,
                    model_uuid,
                    body,
                } => {
                    binds.push((format!("m{i}"), model_uuid.to_string()));
                    binds.push((format!("b{i}"), encode_body(key, body)?));
                    sql.push_str(&format!(
                        "IF !record::exists(type::thing($tb{i}, $id{i})) {{ THROW \"{DOCUMENT_MISSING}{i}\" }};\n\
                         UPDATE type::thing($tb{i}, $id{i}) CONTENT {{ doc_id: $id{i}, model_uuid: $m{i}, revision: $rev, body: $b{i} }};\n"
                    ));
                }
                WriteOp::Delete { .. } => {
                    sql.push_str(&format!(
                        "IF !record::exists(type::thing($tb{i}, $id{i})) {{ THROW \"{DOCUMENT_MISSING}{i}\" }};\n\
                         DELETE type::thing($tb{i}, $id{i});\n"
                    ));
                }
            }
        }
        sql.push_str("RETURN $rev;\nCOMMIT TRANSACTION;");

        let mut query = self.db.query(sql);
        for bind in binds {
            query = query.bind(bind);
        }
        let mut response = query.await.map_err(backend("write_transaction"))?;
        let errors = response.take_errors();
        if !errors.is_empty() {
            return Err(write_failure(errors, &ops));
        }

        let last = response.num_statements().saturating_sub(1);
        let revision: Option<i64> = response.take(last).map_err(backend("write_transaction"))?;
        Ok(revision.unwrap_or(0).max(0) as ChangeToken)
    }

    async fn delete_by_scope(&self, uuid: &ModelUuid) -> Result<usize> {
        let mut sql = Collection::ALL
            .iter()
            .map(|c| {
                format!(
                    "DELETE {} WHERE model_uuid = $uuid RETURN BEFORE;",
                    table(*c)
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        sql.push_str(&format!("\n{};", bump_sequence()));

        let mut response = self
            .db
            .query(sql)
            .bind(("uuid", uuid.to_string()))
            .await
            .map_err(backend("delete_by_scope"))?;

        let mut removed = 0;
        for index in 0..Collection::ALL.len() {
            let rows: Vec<Row> = response.take(index).map_err(backend("delete_by_scope"))?;
            removed += rows.len();
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn memory_store() -> SurrealStore {
        SurrealStore::connect(&StoreConfig::Embedded {
            path: String::new(),
        })
        .await
        .unwrap()
    }

    fn insert(collection: Collection, uuid: &ModelUuid, id: &str) -> WriteOp {
        WriteOp::Insert {
            key: DocumentKey::scoped(collection, uuid, id),
            model_uuid: *uuid,
            body: json!({ "id": id, "nested": { "b": 1, "a": [true, null] } }),
        }
    }

    #[tokio::test]
    async fn test_write_and_read_back() {
        let store = memory_store().await;
        let uuid = ModelUuid::generate();
        assert_eq!(store.change_token().await.unwrap(), 0);

        let token = store
            .write_transaction(vec![
                WriteOp::Insert {
                    key: DocumentKey::model(&uuid),
                    model_uuid: uuid,
                    body: json!({ "name": "default" }),
                },
                insert(Collection::Machine, &uuid, "0"),
                insert(Collection::Unit, &uuid, "mysql/0"),
            ])
            .await
            .unwrap();
        assert_eq!(token, 1);

        let model = store
            .read_by_id(&DocumentKey::model(&uuid))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(model.body, json!({ "name": "default" }));
        assert_eq!(model.revision, 1);

        let scope = store.read_all_by_model_scope(&uuid).await.unwrap();
        let keys: Vec<String> = scope.iter().map(|d| d.key.to_string()).collect();
        assert_eq!(
            keys,
            vec![
                format!("machine:{}/0", uuid),
                format!("unit:{}/mysql/0", uuid),
            ]
        );
        assert_eq!(scope[0].body["nested"]["a"], json!([true, null]));
    }

    #[tokio::test]
    async fn test_failed_transaction_writes_nothing() {
        let store = memory_store().await;
        let uuid = ModelUuid::generate();
        store
            .write_transaction(vec![insert(Collection::Machine, &uuid, "0")])
            .await
            .unwrap();

        let result = store
            .write_transaction(vec![
                insert(Collection::Machine, &uuid, "1"),
                insert(Collection::Machine, &uuid, "0"),
            ])
            .await;
        match result {
            Err(StoreError::DocumentExists { key }) => {
                assert_eq!(key, DocumentKey::scoped(Collection::Machine, &uuid, "0"));
            }
            other => panic!("expected DocumentExists, got {:?}", other),
        }
        assert_eq!(store.read_all_by_model_scope(&uuid).await.unwrap().len(), 1);
        assert_eq!(store.change_token().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_replace_of_missing_document_is_reported() {
        let store = memory_store().await;
        let uuid = ModelUuid::generate();
        let key = DocumentKey::scoped(Collection::Unit, &uuid, "mysql/0");

        let err = store
            .write_transaction(vec![
                insert(Collection::Machine, &uuid, "0"),
                WriteOp::Replace {
                    key: key.clone(),
                    model_uuid: uuid,
                    body: json!({}),
                },
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DocumentMissing { key: missing } if missing == key));
        assert!(store.read_all_by_model_scope(&uuid).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_returns_its_own_revision() {
        let store = memory_store().await;
        let uuid = ModelUuid::generate();
        let first = store
            .write_transaction(vec![insert(Collection::Machine, &uuid, "0")])
            .await
            .unwrap();
        let second = store
            .write_transaction(vec![insert(Collection::Machine, &uuid, "1")])
            .await
            .unwrap();
        assert_eq!((first, second), (1, 2));

        let machine = store
            .read_by_id(&DocumentKey::scoped(Collection::Machine, &uuid, "1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(machine.revision, second);
    }

    #[tokio::test]
    async fn test_delete_by_scope_leaves_other_models() {
        let store = memory_store().await;
        let uuid = ModelUuid::generate();
        let other = ModelUuid::generate();
        store
            .write_transaction(vec![
                WriteOp::Insert {
                    key: DocumentKey::model(&uuid),
                    model_uuid: uuid,
                    body: json!({}),
                },
                insert(Collection::Machine, &uuid, "0"),
                insert(Collection::Machine, &other, "0"),
            ])
            .await
            .unwrap();

        assert_eq!(store.delete_by_scope(&uuid).await.unwrap(), 2);
        assert!(
            store
                .read_by_id(&DocumentKey::model(&uuid))
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(store.read_all_by_model_scope(&other).await.unwrap().len(), 1);
    }
}
