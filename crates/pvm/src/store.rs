//! Process instance persistence.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::debug;

use stepflow_core::{EngineError, ExecutionId, ProcessDefinitionId, ProcessInstanceId};

use crate::execution::ProcessInstance;

/// Persistence for process instances.
///
/// `save` is conditional on the revision the caller read and bumps it; a
/// concurrent writer surfaces as [`ProcessStoreError::Conflict`].
pub trait ProcessStore: Send + Sync {
    /// Store a new instance at revision 1.
    fn insert(&self, instance: ProcessInstance) -> Result<ProcessInstance, ProcessStoreError>;

    fn find(&self, id: ProcessInstanceId) -> Result<Option<ProcessInstance>, ProcessStoreError>;

    fn find_by_execution(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Option<ProcessInstance>, ProcessStoreError>;

    fn save(&self, instance: &ProcessInstance) -> Result<ProcessInstance, ProcessStoreError>;

    /// Remove an instance whatever its revision.
    fn delete(&self, id: ProcessInstanceId) -> Result<Option<ProcessInstance>, ProcessStoreError>;

    fn list_by_definition(
        &self,
        definition_id: ProcessDefinitionId,
    ) -> Result<Vec<ProcessInstanceId>, ProcessStoreError>;
}

impl<S: ProcessStore + ?Sized> ProcessStore for Arc<S> {
    fn insert(&self, instance: ProcessInstance) -> Result<ProcessInstance, ProcessStoreError> {
        (**self).insert(instance)
    }

    fn find(&self, id: ProcessInstanceId) -> Result<Option<ProcessInstance>, ProcessStoreError> {
        (**self).find(id)
    }

    fn find_by_execution(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Option<ProcessInstance>, ProcessStoreError> {
        (**self).find_by_execution(execution_id)
    }

    fn save(&self, instance: &ProcessInstance) -> Result<ProcessInstance, ProcessStoreError> {
        (**self).save(instance)
    }

    fn delete(&self, id: ProcessInstanceId) -> Result<Option<ProcessInstance>, ProcessStoreError> {
        (**self).delete(id)
    }

    fn list_by_definition(
        &self,
        definition_id: ProcessDefinitionId,
    ) -> Result<Vec<ProcessInstanceId>, ProcessStoreError> {
        (**self).list_by_definition(definition_id)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProcessStoreError {
    #[error("process instance {0} not found")]
    NotFound(ProcessInstanceId),

    #[error("process instance {0} already exists")]
    AlreadyExists(ProcessInstanceId),

    #[error("process instance {id} changed concurrently (expected revision {expected}, found {found:?})")]
    Conflict {
        id: ProcessInstanceId,
        expected: u64,
        found: Option<u64>,
    },

    #[error("process store failure: {0}")]
    Storage(String),
}

impl From<ProcessStoreError> for EngineError {
    fn from(err: ProcessStoreError) -> Self {
        match err {
            ProcessStoreError::Conflict { .. } => EngineError::optimistic_locking(err.to_string()),
            ProcessStoreError::NotFound(_) => EngineError::not_found(err.to_string()),
            ProcessStoreError::AlreadyExists(_) => EngineError::invariant(err.to_string()),
            ProcessStoreError::Storage(msg) => EngineError::infrastructure(msg),
        }
    }
}

/// In-memory process store for tests and single-node setups.
#[derive(Debug, Default)]
pub struct InMemoryProcessStore {
    instances: RwLock<BTreeMap<ProcessInstanceId, ProcessInstance>>,
}

impl InMemoryProcessStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<ProcessInstanceId, ProcessInstance>> {
        self.instances.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<ProcessInstanceId, ProcessInstance>> {
        self.instances.write().unwrap_or_else(|p| p.into_inner())
    }
}

impl ProcessStore for InMemoryProcessStore {
    fn insert(&self, mut instance: ProcessInstance) -> Result<ProcessInstance, ProcessStoreError> {
        let mut instances = self.write();
        if instances.contains_key(&instance.id) {
            return Err(ProcessStoreError::AlreadyExists(instance.id));
        }
        instance.revision = 1;
        instances.insert(instance.id, instance.clone());
        debug!(process_instance_id = %instance.id, "process instance inserted");
        Ok(instance)
    }

    fn find(&self, id: ProcessInstanceId) -> Result<Option<ProcessInstance>, ProcessStoreError> {
        Ok(self.read().get(&id).cloned())
    }

    fn find_by_execution(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Option<ProcessInstance>, ProcessStoreError> {
        Ok(self
            .read()
            .values()
            .find(|i| i.executions.contains_key(&execution_id))
            .cloned())
    }

    fn save(&self, instance: &ProcessInstance) -> Result<ProcessInstance, ProcessStoreError> {
        let mut instances = self.write();
        let current = instances
            .get(&instance.id)
            .ok_or(ProcessStoreError::NotFound(instance.id))?;
        if current.revision != instance.revision {
            return Err(ProcessStoreError::Conflict {
                id: instance.id,
                expected: instance.revision,
                found: Some(current.revision),
            });
        }
        let mut next = instance.clone();
        next.revision += 1;
        instances.insert(next.id, next.clone());
        Ok(next)
    }

    fn delete(&self, id: ProcessInstanceId) -> Result<Option<ProcessInstance>, ProcessStoreError> {
        Ok(self.write().remove(&id))
    }

    fn list_by_definition(
        &self,
        definition_id: ProcessDefinitionId,
    ) -> Result<Vec<ProcessInstanceId>, ProcessStoreError> {
        Ok(self
            .read()
            .values()
            .filter(|i| i.definition_id == definition_id)
            .map(|i| i.id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::Map;
    use stepflow_core::DeploymentId;

    fn instance(id: u128) -> ProcessInstance {
        ProcessInstance::new(
            ProcessInstanceId::from_u128(id),
            ProcessDefinitionId::from_u128(7),
            "p",
            DeploymentId::from_u128(9),
            Map::new(),
            Utc::now(),
        )
    }

    #[test]
    fn save_is_conditional_on_revision() {
        let store = InMemoryProcessStore::new();
        let stored = store.insert(instance(1)).unwrap();
        assert_eq!(stored.revision, 1);

        let mut first = stored.clone();
        first.business_key = Some("a".into());
        let saved = store.save(&first).unwrap();
        assert_eq!(saved.revision, 2);

        let mut stale = stored;
        stale.business_key = Some("b".into());
        let err = store.save(&stale).unwrap_err();
        assert_eq!(
            err,
            ProcessStoreError::Conflict {
                id: stale.id,
                expected: 1,
                found: Some(2),
            }
        );
        assert!(EngineError::from(err).is_optimistic_locking());
        assert_eq!(
            store.find(stale.id).unwrap().unwrap().business_key.as_deref(),
            Some("a")
        );
    }

    #[test]
    fn finds_instances_by_execution_and_definition() {
        let store = InMemoryProcessStore::new();
        let a = store.insert(instance(1)).unwrap();
        store.insert(instance(2)).unwrap();
        assert!(store.insert(instance(2)).is_err());

        let found = store
            .find_by_execution(a.root_execution_id())
            .unwrap()
            .unwrap();
        assert_eq!(found.id, a.id);
        assert_eq!(
            store
                .list_by_definition(ProcessDefinitionId::from_u128(7))
                .unwrap()
                .len(),
            2
        );
        assert!(store.delete(a.id).unwrap().is_some());
        assert_eq!(store.len(), 1);
    }
}
