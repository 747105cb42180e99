//! Control facade: the operation surface a REST layer or CLI consumes.
//!
//! Thin by design: request/response DTOs in wire form, delegation to the
//! supervisor and stores, plus read-only SPARQL access to the named graphs.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use oxigraph::sparql::QueryResults;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::definition::{DefinitionPayload, DefinitionSummary};
use crate::engine::EngineCore;
use crate::error::{EngineError, Result};
use crate::supervisor::Supervisor;
use crate::tasks::TaskFilter;
use crate::topics::HttpHandlerSpec;
use crate::types::{
    AuditRecord, InstanceRecord, InstanceStatus, UserTaskRecord, UserTaskStatus, VarValue,
    VariableWire,
};
use crate::vocab;

// ── Wire DTOs ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceView {
    #[serde(flatten)]
    pub record: InstanceRecord,
    /// Node ids of live tokens (the instance's current wait points).
    pub current_nodes: Vec<String>,
    pub variables: Vec<VariableWire>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceFilter {
    pub status: Option<InstanceStatus>,
    pub definition_id: Option<String>,
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicDescriptor {
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub http: HttpHandlerSpec,
}

/// SPARQL results in a transport-friendly shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryResultWire {
    Boolean { value: bool },
    Solutions { rows: Vec<BTreeMap<String, String>> },
}

// ── Facade ────────────────────────────────────────────────────

pub struct ControlApi {
    supervisor: Arc<Supervisor>,
}

impl ControlApi {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }

    fn core(&self) -> &Arc<EngineCore> {
        self.supervisor.core()
    }

    // ── Definitions ───────────────────────────────────────────

    pub async fn deploy_definition(&self, payload: DefinitionPayload) -> Result<String> {
        let id = self.core().defs.deploy(payload).await?;
        self.core().store.persist().await?;
        Ok(id)
    }

    pub fn list_definitions(&self, status: Option<&str>) -> Result<Vec<DefinitionSummary>> {
        self.core().defs.list(status)
    }

    pub async fn get_definition(
        &self,
        id: &str,
    ) -> Result<(DefinitionSummary, DefinitionPayload)> {
        let summary = self.core().defs.summary(id)?;
        let def = self.core().defs.get(id).await?;
        Ok((summary, def.payload.clone()))
    }

    pub async fn retire_definition(&self, id: &str) -> Result<()> {
        self.core().defs.retire(id).await?;
        self.core().store.persist().await
    }

    pub async fn update_definition(
        &self,
        id: &str,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<DefinitionSummary> {
        self.core().defs.update_meta(id, name, description).await?;
        self.core().store.persist().await?;
        self.core().defs.summary(id)
    }

    // ── Instances ─────────────────────────────────────────────

    pub async fn start_instance(
        &self,
        definition_id: &str,
        variables: Vec<VariableWire>,
        start_event: Option<&str>,
    ) -> Result<InstanceView> {
        let decoded = decode_variables(variables)?;
        let id = self
            .supervisor
            .start(definition_id, decoded, start_event)
            .await?;
        self.get_instance(id)
    }

    pub fn get_instance(&self, id: Uuid) -> Result<InstanceView> {
        let record = self.core().instance(id)?;
        let current_nodes = self.supervisor.current_nodes(id)?;
        let subject = vocab::instance_iri(id);
        let variables = self
            .core()
            .vars
            .all_at(&subject)?
            .iter()
            .map(|(name, value)| VariableWire::from_value(name, value))
            .collect();
        Ok(InstanceView {
            record,
            current_nodes,
            variables,
        })
    }

    pub fn list_instances(&self, filter: &InstanceFilter) -> Result<Page<InstanceView>> {
        let all = self
            .core()
            .list_instances(filter.status, filter.definition_id.as_deref())?;
        let total = all.len();
        let page = filter.page.max(1);
        let page_size = filter.page_size.max(1);
        let items = all
            .into_iter()
            .skip((page - 1) * page_size)
            .take(page_size)
            .map(|record| self.get_instance(record.id))
            .collect::<Result<Vec<_>>>()?;
        Ok(Page {
            items,
            total,
            page,
            page_size,
        })
    }

    pub async fn stop_instance(&self, id: Uuid, reason: &str) -> Result<InstanceView> {
        self.supervisor.stop(id, reason).await?;
        self.get_instance(id)
    }

    pub async fn cancel_instance(&self, id: Uuid, reason: &str) -> Result<InstanceView> {
        self.supervisor.cancel(id, reason).await?;
        self.get_instance(id)
    }

    pub async fn throw_error(&self, id: Uuid, code: &str, message: &str) -> Result<InstanceView> {
        self.supervisor.throw_error(id, code, message).await?;
        self.get_instance(id)
    }

    pub async fn set_variable(&self, id: Uuid, variable: VariableWire) -> Result<()> {
        let value = variable.to_value().ok_or_else(|| {
            EngineError::PreconditionFailed(format!(
                "variable {} has malformed value for datatype {}",
                variable.name, variable.datatype
            ))
        })?;
        self.supervisor.set_variable(id, &variable.name, &value).await
    }

    pub async fn get_variable(&self, id: Uuid, name: &str) -> Result<Option<VariableWire>> {
        Ok(self
            .supervisor
            .get_variable(id, name)
            .await?
            .map(|value| VariableWire::from_value(name, &value)))
    }

    pub fn get_variables(&self, id: Uuid) -> Result<Vec<VariableWire>> {
        self.core().instance(id)?;
        let subject = vocab::instance_iri(id);
        Ok(self
            .core()
            .vars
            .all_at(&subject)?
            .iter()
            .map(|(name, value)| VariableWire::from_value(name, value))
            .collect())
    }

    pub fn get_audit_trail(&self, id: Uuid) -> Result<Vec<AuditRecord>> {
        self.core().instance(id)?;
        self.core().audit.trail(id)
    }

    // ── Tasks ─────────────────────────────────────────────────

    pub fn list_tasks(
        &self,
        instance_id: Option<Uuid>,
        status: Option<UserTaskStatus>,
        assignee: Option<String>,
    ) -> Result<Vec<UserTaskRecord>> {
        self.core().tasks.list(&TaskFilter {
            instance_id,
            status,
            assignee,
        })
    }

    pub async fn claim_task(&self, task_id: Uuid, assignee: &str) -> Result<UserTaskRecord> {
        self.supervisor.claim_task(task_id, assignee).await
    }

    pub async fn unclaim_task(&self, task_id: Uuid) -> Result<UserTaskRecord> {
        self.supervisor.unclaim_task(task_id).await
    }

    pub async fn complete_task(
        &self,
        task_id: Uuid,
        variables: Vec<VariableWire>,
        actor: Option<&str>,
    ) -> Result<UserTaskRecord> {
        let decoded = decode_variables(variables)?;
        self.supervisor.complete_task(task_id, decoded, actor).await?;
        self.core().tasks.get(task_id)
    }

    // ── Topics ────────────────────────────────────────────────

    pub async fn register_topic(&self, descriptor: TopicDescriptor) -> Result<()> {
        self.core()
            .topics
            .register_http(
                &descriptor.topic,
                descriptor.description.as_deref(),
                descriptor.http,
            )
            .await
    }

    pub async fn unregister_topic(&self, topic: &str) -> Result<()> {
        self.core().topics.unregister(topic).await
    }

    pub async fn list_topics(&self) -> Vec<crate::topics::TopicInfo> {
        self.core().topics.list().await
    }

    /// Dry-run a handler against a caller-supplied variable bag; reports
    /// the would-be writes without touching any instance.
    pub async fn test_topic(
        &self,
        topic: &str,
        variables: Vec<VariableWire>,
    ) -> Result<Vec<VariableWire>> {
        let decoded = decode_variables(variables)?;
        let writes = self.core().topics.test(topic, decoded).await?;
        Ok(writes
            .iter()
            .map(|(name, value)| VariableWire::from_value(name, value))
            .collect())
    }

    // ── Messaging & timers ────────────────────────────────────

    pub async fn send_message(
        &self,
        name: &str,
        correlation_key: &str,
        variables: Vec<VariableWire>,
    ) -> Result<()> {
        let decoded = decode_variables(variables)?;
        self.supervisor
            .send_message(name, correlation_key, decoded)
            .await
    }

    pub async fn broadcast_signal(&self, name: &str, variables: Vec<VariableWire>) -> Result<()> {
        let decoded = decode_variables(variables)?;
        self.supervisor.broadcast_signal(name, decoded).await
    }

    pub async fn resume_callback(
        &self,
        callback_id: &str,
        variables: Vec<VariableWire>,
    ) -> Result<()> {
        let decoded = decode_variables(variables)?;
        self.supervisor.resume_callback(callback_id, Ok(decoded)).await
    }

    pub async fn run_due_timers(&self, now: DateTime<Utc>) -> Result<usize> {
        self.supervisor.run_due_timers(now).await
    }

    // ── Graph access ──────────────────────────────────────────

    /// Read-only SPARQL against one named graph.
    pub fn query_graph(&self, graph: &str, sparql: &str) -> Result<QueryResultWire> {
        let graph = match graph {
            "defs" => vocab::GRAPH_DEFS,
            "inst" => vocab::GRAPH_INST,
            "tasks" => vocab::GRAPH_TASKS,
            "log" => vocab::GRAPH_LOG,
            "timers" => vocab::GRAPH_TIMERS,
            other => return Err(EngineError::not_found("graph", other)),
        };
        match self.core().store.query(graph, sparql)? {
            QueryResults::Boolean(value) => Ok(QueryResultWire::Boolean { value }),
            QueryResults::Solutions(iter) => {
                let mut rows = Vec::new();
                for solution in iter {
                    let solution = solution.map_err(EngineError::store)?;
                    let mut row = BTreeMap::new();
                    for (variable, term) in solution.iter() {
                        row.insert(variable.as_str().to_string(), term.to_string());
                    }
                    rows.push(row);
                }
                Ok(QueryResultWire::Solutions { rows })
            }
            QueryResults::Graph(_) => Err(EngineError::PreconditionFailed(
                "CONSTRUCT queries are not exposed over the control surface".into(),
            )),
        }
    }

    pub async fn snapshot_now(&self) -> Result<()> {
        self.core().store.persist().await
    }
}

fn decode_variables(wire: Vec<VariableWire>) -> Result<BTreeMap<String, VarValue>> {
    let mut out = BTreeMap::new();
    for variable in wire {
        let value = variable.to_value().ok_or_else(|| {
            EngineError::PreconditionFailed(format!(
                "variable {} has malformed value for datatype {}",
                variable.name, variable.datatype
            ))
        })?;
        out.insert(variable.name, value);
    }
    Ok(out)
}
