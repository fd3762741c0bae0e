//! In-process state store
//!
//! Holds documents in a `BTreeMap` behind a `parking_lot` lock. Besides
//! serving as the fake store for tests, it can inject write faults and run a
//! hook after every scope read to stand in for concurrent cluster activity.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{ChangeToken, Document, Result, StateStore, StoreCapabilities, StoreError, WriteOp};
use crate::id::{Collection, DocumentKey, ModelUuid};

/// Write faults to inject, each firing at most once
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultPlan {
    /// Fail the n-th document written (1-based, deletes excluded)
    pub fail_on_document: Option<usize>,
    /// Fail the first write that targets this collection
    pub fail_on_collection: Option<Collection>,
}

impl FaultPlan {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn nth_document(n: usize) -> Self {
        Self {
            fail_on_document: Some(n),
            ..Self::default()
        }
    }

    pub fn collection(collection: Collection) -> Self {
        Self {
            fail_on_collection: Some(collection),
            ..Self::default()
        }
    }

    fn is_armed(&self) -> bool {
        self.fail_on_document.is_some() || self.fail_on_collection.is_some()
    }
}

/// Called after each `read_all_by_model_scope` with the number of scope reads so far
pub type ReadHook = Arc<dyn Fn(&MemoryStore, usize) + Send + Sync>;

#[derive(Debug, Default)]
struct MemoryState {
    documents: BTreeMap<DocumentKey, Document>,
    sequence: ChangeToken,
}

#[derive(Debug, Default)]
struct FaultState {
    plan: FaultPlan,
    documents_written: usize,
}

impl FaultState {
    fn check(&mut self, key: &DocumentKey) -> Result<()> {
        if !self.plan.is_armed() {
            return Ok(());
        }
        self.documents_written += 1;
        if self.plan.fail_on_document == Some(self.documents_written) {
            self.plan.fail_on_document = None;
            return Err(StoreError::InjectedFault { key: key.clone() });
        }
        if self.plan.fail_on_collection == Some(key.collection) {
            self.plan.fail_on_collection = None;
            return Err(StoreError::InjectedFault { key: key.clone() });
        }
        Ok(())
    }
}

pub struct MemoryStore {
    state: RwLock<MemoryState>,
    capabilities: StoreCapabilities,
    faults: Mutex<FaultState>,
    after_read: Mutex<Option<ReadHook>>,
    scope_reads: Mutex<usize>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("MemoryStore")
            .field("documents", &state.documents.len())
            .field("sequence", &state.sequence)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capabilities(StoreCapabilities::default())
    }

    pub fn with_capabilities(capabilities: StoreCapabilities) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            capabilities,
            faults: Mutex::new(FaultState::default()),
            after_read: Mutex::new(None),
            scope_reads: Mutex::new(0),
        }
    }

    /// Arm a fault plan; the written-document counter restarts from zero
    pub fn set_fault_plan(&self, plan: FaultPlan) {
        *self.faults.lock() = FaultState {
            plan,
            documents_written: 0,
        };
    }

    pub fn set_after_read_hook(&self, hook: ReadHook) {
        *self.after_read.lock() = Some(hook);
    }

    /// Rewrite a document in place, giving it a new revision.
    ///
    /// Stands in for another cluster participant touching the document.
    pub fn touch(&self, key: &DocumentKey) -> Result<ChangeToken> {
        let mut state = self.state.write();
        let revision = state.sequence + 1;
        let document = state
            .documents
            .get_mut(key)
            .ok_or_else(|| StoreError::DocumentMissing { key: key.clone() })?;
        document.revision = revision;
        state.sequence = revision;
        Ok(revision)
    }

    /// All documents, in key order
    pub fn documents(&self) -> Vec<Document> {
        self.state.read().documents.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of documents belonging to the model, the model document included
    pub fn scope_len(&self, uuid: &ModelUuid) -> usize {
        self.state
            .read()
            .documents
            .values()
            .filter(|d| &d.model_uuid == uuid)
            .count()
    }

    /// Apply one operation to `documents` at `revision`
    fn apply_op(
        documents: &mut BTreeMap<DocumentKey, Document>,
        faults: &mut FaultState,
        op: WriteOp,
        revision: ChangeToken,
    ) -> Result<()> {
        match op {
            WriteOp::Insert {
                key,
                model_uuid,
                body,
            } => {
                if documents.contains_key(&key) {
                    return Err(StoreError::DocumentExists { key });
                }
                faults.check(&key)?;
                documents.insert(
                    key.clone(),
                    Document {
                        key,
                        model_uuid,
                        revision,
                        body,
                    },
                );
            }
            WriteOp::Replace {
                key,
                model_uuid,
                body,
            } => {
                if !documents.contains_key(&key) {
                    return Err(StoreError::DocumentMissing { key });
                }
                faults.check(&key)?;
                documents.insert(
                    key.clone(),
                    Document {
                        key,
                        model_uuid,
                        revision,
                        body,
                    },
                );
            }
            WriteOp::Delete { key } => {
                if documents.remove(&key).is_none() {
                    return Err(StoreError::DocumentMissing { key });
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn capabilities(&self) -> StoreCapabilities {
        self.capabilities
    }

    async fn read_by_id(&self, key: &DocumentKey) -> Result<Option<Document>> {
        Ok(self.state.read().documents.get(key).cloned())
    }

    async fn read_all_by_model_scope(&self, uuid: &ModelUuid) -> Result<Vec<Document>> {
        let documents: Vec<Document> = self
            .state
            .read()
            .documents
            .values()
            .filter(|d| &d.model_uuid == uuid && d.key.collection != Collection::Model)
            .cloned()
            .collect();

        let reads = {
            let mut reads = self.scope_reads.lock();
            *reads += 1;
            *reads
        };
        let hook = self.after_read.lock().clone();
        if let Some(hook) = hook {
            hook(self, reads);
        }

        Ok(documents)
    }

    async fn change_token(&self) -> Result<ChangeToken> {
        Ok(self.state.read().sequence)
    }

    async fn write_transaction(&self, ops: Vec<WriteOp>) -> Result<ChangeToken> {
        if let Some(max) = self.capabilities.max_ops_per_transaction {
            if ops.len() > max {
                return Err(StoreError::Backend {
                    operation: "write_transaction".to_string(),
                    cause: format!("{} operations exceed the limit of {}", ops.len(), max).into(),
                });
            }
        }

        let mut state = self.state.write();
        let mut faults = self.faults.lock();
        let revision = state.sequence + 1;

        if self.capabilities.multi_document_transactions {
            // Stage against a copy so a failure leaves nothing behind
            let mut staged = state.documents.clone();
            for op in ops {
                Self::apply_op(&mut staged, &mut faults, op, revision)?;
            }
            state.documents = staged;
        } else {
            for op in ops {
                let result = Self::apply_op(&mut state.documents, &mut faults, op, revision);
                // Operations already applied stay applied and keep their revision
                state.sequence = revision;
                result?;
            }
        }

        state.sequence = revision;
        Ok(revision)
    }

    async fn delete_by_scope(&self, uuid: &ModelUuid) -> Result<usize> {
        let mut state = self.state.write();
        let before = state.documents.len();
        state.documents.retain(|_, d| &d.model_uuid != uuid);
        let removed = before - state.documents.len();
        if removed > 0 {
            state.sequence += 1;
        }
        Ok(removed)
    }
}
