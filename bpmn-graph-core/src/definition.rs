//! Process definitions: canonical records, deploy-time validation, the
//! projection into the `defs` graph, and the indexed runtime view.
//!
//! A deployed definition is immutable; only its status and descriptive
//! metadata may change. The canonical JSON record set is stored verbatim so
//! a deploy/get round trip is lossless, while node and flow triples are also
//! projected for SPARQL consumers.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use oxigraph::model::{Literal, Term};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::store::{GraphOp, GraphStore};
use crate::vocab::{self, GRAPH_DEFS};

// ── Canonical records ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeKind {
    StartEvent,
    EndEvent,
    IntermediateThrowEvent,
    IntermediateCatchEvent,
    BoundaryEvent,
    ServiceTask,
    UserTask,
    SendTask,
    ReceiveTask,
    ScriptTask,
    ManualTask,
    ExclusiveGateway,
    ParallelGateway,
    InclusiveGateway,
    EventBasedGateway,
    EmbeddedSubprocess,
    EventSubprocess,
    CallActivity,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartEvent => "startEvent",
            Self::EndEvent => "endEvent",
            Self::IntermediateThrowEvent => "intermediateThrowEvent",
            Self::IntermediateCatchEvent => "intermediateCatchEvent",
            Self::BoundaryEvent => "boundaryEvent",
            Self::ServiceTask => "serviceTask",
            Self::UserTask => "userTask",
            Self::SendTask => "sendTask",
            Self::ReceiveTask => "receiveTask",
            Self::ScriptTask => "scriptTask",
            Self::ManualTask => "manualTask",
            Self::ExclusiveGateway => "exclusiveGateway",
            Self::ParallelGateway => "parallelGateway",
            Self::InclusiveGateway => "inclusiveGateway",
            Self::EventBasedGateway => "eventBasedGateway",
            Self::EmbeddedSubprocess => "embeddedSubprocess",
            Self::EventSubprocess => "eventSubprocess",
            Self::CallActivity => "callActivity",
        }
    }

    pub fn is_activity(&self) -> bool {
        matches!(
            self,
            Self::ServiceTask
                | Self::UserTask
                | Self::SendTask
                | Self::ReceiveTask
                | Self::ScriptTask
                | Self::ManualTask
                | Self::EmbeddedSubprocess
                | Self::CallActivity
        )
    }
}

/// Trigger type of an event node (`none` for plain start/end events).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    #[default]
    None,
    Message,
    Timer,
    Signal,
    Error,
    Terminate,
    Cancel,
    Compensation,
    Escalation,
    Conditional,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Message => "message",
            Self::Timer => "timer",
            Self::Signal => "signal",
            Self::Error => "error",
            Self::Terminate => "terminate",
            Self::Cancel => "cancel",
            Self::Compensation => "compensation",
            Self::Escalation => "escalation",
            Self::Conditional => "conditional",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerRecord {
    /// `start` / `end` / `take` for execution listeners,
    /// `create` / `assignment` / `complete` for task listeners.
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegate_expression: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopCharacteristics {
    #[serde(default)]
    pub sequential: bool,
    /// Integer expression, e.g. `5` or `${itemCount}`.
    pub cardinality: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_condition: Option<String>,
}

fn default_true() -> bool {
    true
}

fn is_true(v: &bool) -> bool {
    *v
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<EventKind>,
    /// Containing subprocess node id; `None` for top-level nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attached_to: Option<String>,
    /// Interrupting boundary semantics; ignored off boundary events.
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub cancel_activity: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub called_element: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_variables: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_variables: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_characteristics: Option<LoopCharacteristics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// ISO-8601 duration (`PT5S`), absolute dateTime, or `R<n>/PT...`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timer_definition: Option<String>,
    /// Marks an embedded subprocess as a transaction (cancel end events).
    #[serde(default)]
    pub transactional: bool,
    /// Declares an own variable scope; locals are dropped on scope exit.
    #[serde(default)]
    pub variable_scope: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub execution_listeners: Vec<ListenerRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub task_listeners: Vec<ListenerRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub listeners: Vec<ListenerRecord>,
}

/// The deploy input: parsed node/flow records plus the opaque source blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub nodes: Vec<NodeRecord>,
    pub flows: Vec<FlowRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signals: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    /// Original XML / layout blob; stored, never interpreted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagram: Option<String>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionSummary {
    pub id: String,
    pub name: String,
    pub version: String,
    pub status: String,
    pub description: Option<String>,
    pub deployed_at: Option<String>,
}

// ── Indexed runtime view ──────────────────────────────────────

#[derive(Debug)]
pub struct ProcessDefinition {
    pub id: String,
    pub payload: DefinitionPayload,
    nodes: HashMap<String, usize>,
    outgoing: HashMap<String, Vec<usize>>,
    incoming: HashMap<String, Vec<usize>>,
    children: HashMap<Option<String>, Vec<String>>,
    boundaries: HashMap<String, Vec<String>>,
}

impl ProcessDefinition {
    fn build(id: String, payload: DefinitionPayload) -> Self {
        let mut nodes = HashMap::new();
        let mut children: HashMap<Option<String>, Vec<String>> = HashMap::new();
        let mut boundaries: HashMap<String, Vec<String>> = HashMap::new();
        for (i, node) in payload.nodes.iter().enumerate() {
            nodes.insert(node.id.clone(), i);
            children
                .entry(node.parent_scope.clone())
                .or_default()
                .push(node.id.clone());
            if let Some(host) = &node.attached_to {
                boundaries.entry(host.clone()).or_default().push(node.id.clone());
            }
        }
        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        let mut incoming: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, flow) in payload.flows.iter().enumerate() {
            outgoing.entry(flow.source.clone()).or_default().push(i);
            incoming.entry(flow.target.clone()).or_default().push(i);
        }
        Self {
            id,
            payload,
            nodes,
            outgoing,
            incoming,
            children,
            boundaries,
        }
    }

    pub fn node(&self, id: &str) -> Result<&NodeRecord> {
        self.nodes
            .get(id)
            .map(|i| &self.payload.nodes[*i])
            .ok_or_else(|| EngineError::not_found("node", format!("{}#{id}", self.id)))
    }

    pub fn try_node(&self, id: &str) -> Option<&NodeRecord> {
        self.nodes.get(id).map(|i| &self.payload.nodes[*i])
    }

    /// Outgoing flows in declaration order.
    pub fn outgoing(&self, node_id: &str) -> Vec<&FlowRecord> {
        self.outgoing
            .get(node_id)
            .map(|idx| idx.iter().map(|i| &self.payload.flows[*i]).collect())
            .unwrap_or_default()
    }

    pub fn incoming(&self, node_id: &str) -> Vec<&FlowRecord> {
        self.incoming
            .get(node_id)
            .map(|idx| idx.iter().map(|i| &self.payload.flows[*i]).collect())
            .unwrap_or_default()
    }

    pub fn default_flow(&self, node_id: &str) -> Option<&FlowRecord> {
        self.outgoing(node_id).into_iter().find(|f| f.is_default)
    }

    /// Direct children of a scope (`None` = the process root).
    pub fn children_of(&self, scope: Option<&str>) -> Vec<&NodeRecord> {
        self.children
            .get(&scope.map(str::to_string))
            .map(|ids| ids.iter().filter_map(|id| self.try_node(id)).collect())
            .unwrap_or_default()
    }

    /// Boundary events attached to an activity, in declaration order.
    pub fn boundary_events(&self, activity_id: &str) -> Vec<&NodeRecord> {
        self.boundaries
            .get(activity_id)
            .map(|ids| ids.iter().filter_map(|id| self.try_node(id)).collect())
            .unwrap_or_default()
    }

    /// Start events of a scope, excluding event-subprocess starts.
    pub fn start_events(&self, scope: Option<&str>) -> Vec<&NodeRecord> {
        self.children_of(scope)
            .into_iter()
            .filter(|n| n.kind == NodeKind::StartEvent)
            .collect()
    }

    /// Event subprocesses declared directly inside a scope.
    pub fn event_subprocesses(&self, scope: Option<&str>) -> Vec<&NodeRecord> {
        self.children_of(scope)
            .into_iter()
            .filter(|n| n.kind == NodeKind::EventSubprocess)
            .collect()
    }

    /// The unique none-start event of the root scope.
    pub fn none_start_event(&self) -> Result<&NodeRecord> {
        let candidates: Vec<_> = self
            .start_events(None)
            .into_iter()
            .filter(|n| n.event.unwrap_or_default() == EventKind::None)
            .collect();
        match candidates.as_slice() {
            [single] => Ok(single),
            [] => Err(EngineError::BadDefinition(format!(
                "definition {} has no none start event",
                self.id
            ))),
            _ => Err(EngineError::PreconditionFailed(format!(
                "definition {} has multiple start events; name one explicitly",
                self.id
            ))),
        }
    }

    /// Forward reachability over sequence flows, cycle-safe and iterative.
    pub fn can_reach(&self, from: &str, to: &str) -> bool {
        if from == to {
            return true;
        }
        let mut visited = std::collections::HashSet::new();
        let mut frontier = vec![from.to_string()];
        while let Some(current) = frontier.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            for flow in self.outgoing(&current) {
                if flow.target == to {
                    return true;
                }
                frontier.push(flow.target.clone());
            }
        }
        false
    }

    /// All node ids lying inside a subprocess scope, transitively.
    pub fn nodes_in_scope(&self, scope_node: &str) -> Vec<&NodeRecord> {
        let mut out = Vec::new();
        let mut frontier = vec![scope_node.to_string()];
        while let Some(scope) = frontier.pop() {
            for node in self.children_of(Some(&scope)) {
                if matches!(
                    node.kind,
                    NodeKind::EmbeddedSubprocess | NodeKind::EventSubprocess
                ) {
                    frontier.push(node.id.clone());
                }
                out.push(node);
            }
        }
        out
    }
}

// ── Validation ────────────────────────────────────────────────

fn validate(payload: &DefinitionPayload) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for node in &payload.nodes {
        if !seen.insert(&node.id) {
            return Err(EngineError::BadDefinition(format!(
                "duplicate node id {}",
                node.id
            )));
        }
    }
    let ids: std::collections::HashSet<_> = payload.nodes.iter().map(|n| &n.id).collect();
    let mut flow_ids = std::collections::HashSet::new();
    for flow in &payload.flows {
        if !flow_ids.insert(&flow.id) {
            return Err(EngineError::BadDefinition(format!(
                "duplicate flow id {}",
                flow.id
            )));
        }
        for endpoint in [&flow.source, &flow.target] {
            if !ids.contains(endpoint) {
                return Err(EngineError::BadDefinition(format!(
                    "flow {} references unknown node {endpoint}",
                    flow.id
                )));
            }
        }
    }
    for node in &payload.nodes {
        if let Some(parent) = &node.parent_scope {
            match payload.nodes.iter().find(|n| &n.id == parent) {
                Some(p)
                    if matches!(
                        p.kind,
                        NodeKind::EmbeddedSubprocess | NodeKind::EventSubprocess
                    ) => {}
                Some(_) => {
                    return Err(EngineError::BadDefinition(format!(
                        "node {} nested in non-subprocess {parent}",
                        node.id
                    )))
                }
                None => {
                    return Err(EngineError::BadDefinition(format!(
                        "node {} references unknown scope {parent}",
                        node.id
                    )))
                }
            }
        }
        match node.kind {
            NodeKind::BoundaryEvent => {
                let host = node.attached_to.as_ref().ok_or_else(|| {
                    EngineError::BadDefinition(format!(
                        "boundary event {} has no attachedTo",
                        node.id
                    ))
                })?;
                if !ids.contains(host) {
                    return Err(EngineError::BadDefinition(format!(
                        "boundary event {} attached to unknown node {host}",
                        node.id
                    )));
                }
            }
            NodeKind::CallActivity => {
                if node.called_element.is_none() {
                    return Err(EngineError::BadDefinition(format!(
                        "call activity {} has no calledElement",
                        node.id
                    )));
                }
            }
            NodeKind::EventSubprocess => {
                let starts: Vec<_> = payload
                    .nodes
                    .iter()
                    .filter(|n| {
                        n.parent_scope.as_deref() == Some(&node.id)
                            && n.kind == NodeKind::StartEvent
                    })
                    .collect();
                if starts.len() != 1 {
                    return Err(EngineError::BadDefinition(format!(
                        "event subprocess {} must have exactly one start event",
                        node.id
                    )));
                }
                if starts[0].event.unwrap_or_default() == EventKind::None {
                    return Err(EngineError::BadDefinition(format!(
                        "event subprocess {} start event needs a trigger",
                        node.id
                    )));
                }
            }
            NodeKind::EmbeddedSubprocess => {
                let has_start = payload.nodes.iter().any(|n| {
                    n.parent_scope.as_deref() == Some(&node.id)
                        && n.kind == NodeKind::StartEvent
                        && n.event.unwrap_or_default() == EventKind::None
                });
                if !has_start {
                    return Err(EngineError::BadDefinition(format!(
                        "subprocess {} has no none start event",
                        node.id
                    )));
                }
            }
            _ => {}
        }
    }
    let has_root_start = payload
        .nodes
        .iter()
        .any(|n| n.parent_scope.is_none() && n.kind == NodeKind::StartEvent);
    if !has_root_start {
        return Err(EngineError::BadDefinition(
            "definition has no start event".into(),
        ));
    }
    Ok(())
}

// ── Definition store ──────────────────────────────────────────

pub struct DefinitionStore {
    store: Arc<GraphStore>,
    cache: RwLock<HashMap<String, Arc<ProcessDefinition>>>,
}

impl DefinitionStore {
    pub fn new(store: Arc<GraphStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Deploy a validated definition into the defs graph. Returns its id.
    pub async fn deploy(&self, payload: DefinitionPayload) -> Result<String> {
        validate(&payload)?;
        let def_id = payload
            .id
            .clone()
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        let subject = vocab::definition_iri(&def_id);
        if self
            .store
            .value(GRAPH_DEFS, &subject, &vocab::def::status())?
            .is_some()
        {
            return Err(EngineError::PreconditionFailed(format!(
                "definition {def_id} already deployed"
            )));
        }

        let canonical = serde_json::to_string(&payload).map_err(EngineError::store)?;
        let mut ops = vec![
            GraphOp::insert(
                &subject,
                &oxigraph::model::NamedNode::new_unchecked(vocab::RDF_TYPE.as_str()),
                Term::NamedNode(vocab::def::class_definition()),
            ),
            GraphOp::insert(&subject, &vocab::def::name(), Literal::from(payload.name.as_str())),
            GraphOp::insert(
                &subject,
                &vocab::def::version(),
                Literal::from(payload.version.as_str()),
            ),
            GraphOp::insert(&subject, &vocab::def::status(), Literal::from("active")),
            GraphOp::insert(
                &subject,
                &vocab::def::deployed_at(),
                Literal::from(Utc::now().to_rfc3339()),
            ),
            GraphOp::insert(&subject, &vocab::def::payload(), Literal::from(canonical.as_str())),
        ];
        if let Some(desc) = &payload.description {
            ops.push(GraphOp::insert(
                &subject,
                &vocab::def::description(),
                Literal::from(desc.as_str()),
            ));
        }
        if let Some(diagram) = &payload.diagram {
            ops.push(GraphOp::insert(
                &subject,
                &vocab::def::diagram(),
                Literal::from(diagram.as_str()),
            ));
        }
        // Project nodes and flows so the defs graph is queryable on its own.
        for node in &payload.nodes {
            let node_iri = vocab::node_iri(&def_id, &node.id);
            ops.push(GraphOp::insert(
                &subject,
                &vocab::def::has_node(),
                Term::NamedNode(node_iri.clone()),
            ));
            ops.push(GraphOp::insert(
                &node_iri,
                &vocab::def::node_kind(),
                Literal::from(node.kind.as_str()),
            ));
            if let Some(name) = &node.name {
                ops.push(GraphOp::insert(
                    &node_iri,
                    &vocab::def::name(),
                    Literal::from(name.as_str()),
                ));
            }
        }
        for flow in &payload.flows {
            let flow_iri = vocab::flow_iri(&def_id, &flow.id);
            ops.push(GraphOp::insert(
                &subject,
                &vocab::def::has_flow(),
                Term::NamedNode(flow_iri.clone()),
            ));
            ops.push(GraphOp::insert(
                &flow_iri,
                &vocab::def::flow_source(),
                Term::NamedNode(vocab::node_iri(&def_id, &flow.source)),
            ));
            ops.push(GraphOp::insert(
                &flow_iri,
                &vocab::def::flow_target(),
                Term::NamedNode(vocab::node_iri(&def_id, &flow.target)),
            ));
            if let Some(cond) = &flow.condition {
                ops.push(GraphOp::insert(
                    &flow_iri,
                    &vocab::def::flow_condition(),
                    Literal::from(cond.as_str()),
                ));
            }
        }
        self.store.apply(GRAPH_DEFS, ops).await?;

        let definition = Arc::new(ProcessDefinition::build(def_id.clone(), payload));
        self.cache
            .write()
            .await
            .insert(def_id.clone(), definition);
        tracing::info!(definition = %def_id, "deployed process definition");
        Ok(def_id)
    }

    pub async fn get(&self, def_id: &str) -> Result<Arc<ProcessDefinition>> {
        if let Some(found) = self.cache.read().await.get(def_id) {
            return Ok(found.clone());
        }
        let subject = vocab::definition_iri(def_id);
        let Some(Term::Literal(lit)) =
            self.store.value(GRAPH_DEFS, &subject, &vocab::def::payload())?
        else {
            return Err(EngineError::not_found("definition", def_id));
        };
        let payload: DefinitionPayload =
            serde_json::from_str(lit.value()).map_err(EngineError::store)?;
        let definition = Arc::new(ProcessDefinition::build(def_id.to_string(), payload));
        self.cache
            .write()
            .await
            .insert(def_id.to_string(), definition.clone());
        Ok(definition)
    }

    pub fn status(&self, def_id: &str) -> Result<String> {
        let subject = vocab::definition_iri(def_id);
        match self.store.value(GRAPH_DEFS, &subject, &vocab::def::status())? {
            Some(Term::Literal(lit)) => Ok(lit.value().to_string()),
            _ => Err(EngineError::not_found("definition", def_id)),
        }
    }

    pub fn summary(&self, def_id: &str) -> Result<DefinitionSummary> {
        let subject = vocab::definition_iri(def_id);
        let value = |p: &oxigraph::model::NamedNode| -> Result<Option<String>> {
            Ok(match self.store.value(GRAPH_DEFS, &subject, p)? {
                Some(Term::Literal(lit)) => Some(lit.value().to_string()),
                _ => None,
            })
        };
        let status = value(&vocab::def::status())?
            .ok_or_else(|| EngineError::not_found("definition", def_id))?;
        Ok(DefinitionSummary {
            id: def_id.to_string(),
            name: value(&vocab::def::name())?.unwrap_or_default(),
            version: value(&vocab::def::version())?.unwrap_or_default(),
            status,
            description: value(&vocab::def::description())?,
            deployed_at: value(&vocab::def::deployed_at())?,
        })
    }

    pub fn list(&self, status_filter: Option<&str>) -> Result<Vec<DefinitionSummary>> {
        let class = Term::NamedNode(vocab::def::class_definition());
        let rdf_type = oxigraph::model::NamedNode::new_unchecked(vocab::RDF_TYPE.as_str());
        let mut out = Vec::new();
        for subject in self.store.subjects(GRAPH_DEFS, &rdf_type, &class)? {
            let Some(def_id) = subject.as_str().strip_prefix(vocab::NS_DEF) else {
                continue;
            };
            if def_id.contains('/') {
                continue;
            }
            let summary = self.summary(def_id)?;
            if let Some(filter) = status_filter {
                if summary.status != filter {
                    continue;
                }
            }
            out.push(summary);
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    /// Retire a definition: existing instances keep running, new starts are
    /// rejected.
    pub async fn retire(&self, def_id: &str) -> Result<()> {
        self.status(def_id)?;
        let subject = vocab::definition_iri(def_id);
        self.store
            .replace(GRAPH_DEFS, &subject, &vocab::def::status(), Literal::from("retired"))
            .await
    }

    /// Metadata-only update; the flow graph itself is immutable.
    pub async fn update_meta(
        &self,
        def_id: &str,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<()> {
        self.status(def_id)?;
        let subject = vocab::definition_iri(def_id);
        if let Some(name) = name {
            self.store
                .replace(GRAPH_DEFS, &subject, &vocab::def::name(), Literal::from(name))
                .await?;
        }
        if let Some(desc) = description {
            self.store
                .replace(
                    GRAPH_DEFS,
                    &subject,
                    &vocab::def::description(),
                    Literal::from(desc),
                )
                .await?;
        }
        Ok(())
    }

    /// Active definitions with a message start event of the given name.
    pub async fn message_start_targets(&self, message: &str) -> Result<Vec<(String, String)>> {
        let mut out = Vec::new();
        for summary in self.list(Some("active"))? {
            let def = self.get(&summary.id).await?;
            for node in def.start_events(None) {
                if node.event == Some(EventKind::Message)
                    && node.message_name.as_deref() == Some(message)
                {
                    out.push((summary.id.clone(), node.id.clone()));
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, kind: NodeKind) -> NodeRecord {
        NodeRecord {
            id: id.to_string(),
            name: None,
            kind,
            event: None,
            parent_scope: None,
            topic: None,
            script: None,
            attached_to: None,
            cancel_activity: true,
            called_element: None,
            in_variables: None,
            out_variables: None,
            loop_characteristics: None,
            message_name: None,
            signal_name: None,
            error_code: None,
            timer_definition: None,
            transactional: false,
            variable_scope: false,
            execution_listeners: Vec::new(),
            task_listeners: Vec::new(),
        }
    }

    fn flow(id: &str, source: &str, target: &str) -> FlowRecord {
        FlowRecord {
            id: id.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            condition: None,
            is_default: false,
            listeners: Vec::new(),
        }
    }

    fn linear_payload() -> DefinitionPayload {
        DefinitionPayload {
            id: Some("p1".into()),
            name: "linear".into(),
            version: "1.0.0".into(),
            description: None,
            nodes: vec![
                node("start", NodeKind::StartEvent),
                node("work", NodeKind::ServiceTask),
                node("end", NodeKind::EndEvent),
            ],
            flows: vec![flow("f1", "start", "work"), flow("f2", "work", "end")],
            messages: Vec::new(),
            signals: Vec::new(),
            errors: Vec::new(),
            diagram: None,
        }
    }

    #[tokio::test]
    async fn deploy_and_round_trip() {
        let store = Arc::new(GraphStore::open(None).unwrap());
        let defs = DefinitionStore::new(store);
        let id = defs.deploy(linear_payload()).await.unwrap();
        assert_eq!(id, "p1");

        let loaded = defs.get(&id).await.unwrap();
        assert_eq!(loaded.payload.nodes.len(), 3);
        assert_eq!(loaded.outgoing("start").len(), 1);
        assert_eq!(loaded.none_start_event().unwrap().id, "start");
        assert!(loaded.can_reach("start", "end"));
        assert!(!loaded.can_reach("end", "start"));
    }

    #[tokio::test]
    async fn redeploy_same_id_rejected() {
        let store = Arc::new(GraphStore::open(None).unwrap());
        let defs = DefinitionStore::new(store);
        defs.deploy(linear_payload()).await.unwrap();
        let err = defs.deploy(linear_payload()).await.unwrap_err();
        assert!(matches!(err, EngineError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn dangling_flow_rejected() {
        let store = Arc::new(GraphStore::open(None).unwrap());
        let defs = DefinitionStore::new(store);
        let mut payload = linear_payload();
        payload.flows.push(flow("bad", "work", "nowhere"));
        let err = defs.deploy(payload).await.unwrap_err();
        assert!(matches!(err, EngineError::BadDefinition(_)));
    }

    #[tokio::test]
    async fn boundary_without_host_rejected() {
        let store = Arc::new(GraphStore::open(None).unwrap());
        let defs = DefinitionStore::new(store);
        let mut payload = linear_payload();
        payload.nodes.push(node("b1", NodeKind::BoundaryEvent));
        let err = defs.deploy(payload).await.unwrap_err();
        assert!(matches!(err, EngineError::BadDefinition(_)));
    }

    #[tokio::test]
    async fn retire_blocks_nothing_but_changes_status() {
        let store = Arc::new(GraphStore::open(None).unwrap());
        let defs = DefinitionStore::new(store);
        let id = defs.deploy(linear_payload()).await.unwrap();
        defs.retire(&id).await.unwrap();
        assert_eq!(defs.status(&id).unwrap(), "retired");
        assert_eq!(defs.list(Some("active")).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn cycle_safe_reachability() {
        let store = Arc::new(GraphStore::open(None).unwrap());
        let defs = DefinitionStore::new(store);
        let mut payload = linear_payload();
        // Loop back from work to start.
        payload.flows.push(flow("back", "work", "start"));
        let id = defs.deploy(payload).await.unwrap();
        let def = defs.get(&id).await.unwrap();
        assert!(def.can_reach("work", "end"));
        assert!(def.can_reach("work", "start"));
    }
}
