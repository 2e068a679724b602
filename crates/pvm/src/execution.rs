//! Execution tree of a process instance.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use stepflow_core::{DeploymentId, ExecutionId, ProcessDefinitionId, ProcessInstanceId};

use crate::listener::EventName;

/// One path of control through a process instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub process_instance_id: ProcessInstanceId,
    /// `None` for the process instance (root) execution.
    pub parent_id: Option<ExecutionId>,
    pub activity_id: Option<String>,
    /// Transition being taken between `activity-end` and `activity-start`.
    pub transition_id: Option<String>,
    pub is_concurrent: bool,
    pub is_scope: bool,
    pub is_active: bool,
    pub is_ended: bool,
    /// Parked in a wait state until signalled.
    #[serde(default)]
    pub is_waiting: bool,
    /// Event currently being dispatched to listeners.
    pub event_name: Option<EventName>,
    pub event_source: Option<String>,
    /// Number of listeners of the current event already invoked.
    pub listener_index: usize,
    pub variables: Map<String, JsonValue>,
}

impl Execution {
    fn new(
        id: ExecutionId,
        process_instance_id: ProcessInstanceId,
        parent_id: Option<ExecutionId>,
    ) -> Self {
        Self {
            id,
            process_instance_id,
            parent_id,
            activity_id: None,
            transition_id: None,
            is_concurrent: false,
            is_scope: parent_id.is_none(),
            is_active: true,
            is_ended: false,
            is_waiting: false,
            event_name: None,
            event_source: None,
            listener_index: 0,
            variables: Map::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub(crate) fn clear_event(&mut self) {
        self.event_name = None;
        self.event_source = None;
        self.listener_index = 0;
    }
}

/// Persisted unit of process state: one execution tree plus its revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub id: ProcessInstanceId,
    pub definition_id: ProcessDefinitionId,
    pub definition_key: String,
    pub deployment_id: DeploymentId,
    pub business_key: Option<String>,
    pub executions: BTreeMap<ExecutionId, Execution>,
    pub ended: bool,
    pub revision: u64,
    pub started_at: DateTime<Utc>,
}

impl ProcessInstance {
    pub fn new(
        id: ProcessInstanceId,
        definition_id: ProcessDefinitionId,
        definition_key: impl Into<String>,
        deployment_id: DeploymentId,
        variables: Map<String, JsonValue>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut root = Execution::new(id.root_execution_id(), id, None);
        root.variables = variables;
        let mut executions = BTreeMap::new();
        executions.insert(root.id, root);
        Self {
            id,
            definition_id,
            definition_key: definition_key.into(),
            deployment_id,
            business_key: None,
            executions,
            ended: false,
            revision: 0,
            started_at: now,
        }
    }

    pub fn with_business_key(mut self, business_key: Option<String>) -> Self {
        self.business_key = business_key;
        self
    }

    pub fn root_execution_id(&self) -> ExecutionId {
        self.id.root_execution_id()
    }

    pub fn root(&self) -> Option<&Execution> {
        self.executions.get(&self.root_execution_id())
    }

    pub fn execution(&self, id: ExecutionId) -> Option<&Execution> {
        self.executions.get(&id)
    }

    pub fn execution_mut(&mut self, id: ExecutionId) -> Option<&mut Execution> {
        self.executions.get_mut(&id)
    }

    pub fn children(&self, parent: ExecutionId) -> impl Iterator<Item = &Execution> {
        self.executions
            .values()
            .filter(move |e| e.parent_id == Some(parent))
    }

    /// Activities where an active execution currently is, in execution order.
    pub fn active_activity_ids(&self) -> Vec<&str> {
        self.executions
            .values()
            .filter(|e| e.is_active && !e.is_ended)
            .filter_map(|e| e.activity_id.as_deref())
            .collect()
    }

    pub(crate) fn create_concurrent_child(
        &mut self,
        parent: ExecutionId,
        activity_id: Option<String>,
    ) -> ExecutionId {
        let mut child = Execution::new(ExecutionId::new(), self.id, Some(parent));
        child.is_concurrent = true;
        child.activity_id = activity_id;
        let id = child.id;
        self.executions.insert(id, child);
        id
    }

    pub(crate) fn remove_execution(&mut self, id: ExecutionId) -> Option<Execution> {
        self.executions.remove(&id)
    }

    /// Mark every execution ended.
    pub(crate) fn end(&mut self) {
        self.ended = true;
        for execution in self.executions.values_mut() {
            execution.is_active = false;
            execution.is_ended = true;
        }
    }

    /// Ancestor chain starting at `id` itself.
    fn lineage(&self, id: ExecutionId) -> impl Iterator<Item = &Execution> {
        std::iter::successors(self.executions.get(&id), move |e| {
            e.parent_id.and_then(|p| self.executions.get(&p))
        })
    }

    pub fn variable(&self, execution_id: ExecutionId, name: &str) -> Option<&JsonValue> {
        self.lineage(execution_id)
            .find_map(|e| e.variables.get(name))
    }

    /// Variables visible from an execution; nearer scopes shadow outer ones.
    pub fn variables(&self, execution_id: ExecutionId) -> Map<String, JsonValue> {
        let chain: Vec<&Execution> = self.lineage(execution_id).collect();
        let mut merged = Map::new();
        for execution in chain.into_iter().rev() {
            for (k, v) in &execution.variables {
                merged.insert(k.clone(), v.clone());
            }
        }
        merged
    }

    pub fn set_variable(&mut self, execution_id: ExecutionId, name: String, value: JsonValue) {
        let owner = self
            .lineage(execution_id)
            .find(|e| e.variables.contains_key(&name))
            .map(|e| e.id)
            .unwrap_or_else(|| self.root_execution_id());
        if let Some(execution) = self.executions.get_mut(&owner) {
            execution.variables.insert(name, value);
        }
    }

    pub fn set_variable_local(&mut self, execution_id: ExecutionId, name: String, value: JsonValue) {
        if let Some(execution) = self.executions.get_mut(&execution_id) {
            execution.variables.insert(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn instance() -> ProcessInstance {
        let mut vars = Map::new();
        vars.insert("amount".into(), json!(100));
        ProcessInstance::new(
            ProcessInstanceId::from_u128(1),
            ProcessDefinitionId::from_u128(2),
            "invoice",
            DeploymentId::from_u128(3),
            vars,
            Utc::now(),
        )
    }

    #[test]
    fn root_execution_is_the_scope() {
        let instance = instance();
        let root = instance.root().unwrap();
        assert!(root.is_root());
        assert!(root.is_scope);
        assert!(!root.is_concurrent);
        assert_eq!(root.id, instance.id.root_execution_id());
    }

    #[test]
    fn variables_resolve_through_parents() {
        let mut instance = instance();
        let root = instance.root_execution_id();
        let child = instance.create_concurrent_child(root, Some("review".into()));

        assert_eq!(instance.variable(child, "amount"), Some(&json!(100)));

        instance.set_variable(child, "amount".into(), json!(120));
        assert_eq!(instance.root().unwrap().variables["amount"], json!(120));

        instance.set_variable_local(child, "amount".into(), json!(5));
        assert_eq!(instance.variable(child, "amount"), Some(&json!(5)));
        assert_eq!(instance.variable(root, "amount"), Some(&json!(120)));
        assert_eq!(instance.variables(child)["amount"], json!(5));

        instance.set_variable(child, "approved".into(), json!(true));
        assert_eq!(instance.root().unwrap().variables["approved"], json!(true));
    }

    #[test]
    fn end_marks_every_execution() {
        let mut instance = instance();
        let root = instance.root_execution_id();
        instance.create_concurrent_child(root, None);
        instance.end();
        assert!(instance.ended);
        assert!(instance.executions.values().all(|e| e.is_ended && !e.is_active));
        assert!(instance.active_activity_ids().is_empty());
    }
}
