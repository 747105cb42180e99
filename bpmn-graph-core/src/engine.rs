//! Shared engine core: every subsystem, wired once at startup.
//!
//! The executor, subprocess controller, event router and supervisor all
//! borrow this context instead of owning slices of state, so there is a
//! single graph store and a single registry per engine.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use oxigraph::model::{Literal, NamedNode, Term};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::config::EngineConfig;
use crate::definition::DefinitionStore;
use crate::error::{EngineError, Result};
use crate::expr::ConditionEvaluator;
use crate::script::ScriptEngine;
use crate::store::{GraphOp, GraphStore};
use crate::tasks::TaskStore;
use crate::timers::TimerService;
use crate::tokens::TokenStore;
use crate::topics::{AsyncCompletion, TopicRegistry};
use crate::types::{InstanceRecord, InstanceStatus, Token};
use crate::variables::VariableStore;
use crate::vocab::{self, GRAPH_INST};

/// A message that matched no subscription and no message start event,
/// buffered until a matching subscription appears.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub name: String,
    pub correlation_key: String,
    pub variables: std::collections::BTreeMap<String, crate::types::VarValue>,
}

pub struct EngineCore {
    pub config: Arc<EngineConfig>,
    pub store: Arc<GraphStore>,
    pub defs: DefinitionStore,
    pub vars: VariableStore,
    pub expr: ConditionEvaluator,
    pub topics: TopicRegistry,
    pub tokens: TokenStore,
    pub tasks: TaskStore,
    pub timers: TimerService,
    pub audit: AuditLog,
    pub script: RwLock<Option<Arc<dyn ScriptEngine>>>,
    /// FIFO buffer of unmatched messages, bounded; oldest dropped first.
    pub pending_messages: tokio::sync::Mutex<std::collections::VecDeque<PendingMessage>>,
    /// Serializes event routing (messages, signals, timer firings), which
    /// touches WAITING tokens across instances. Stepping only ever touches
    /// ACTIVE tokens under the instance lock, so the two cannot collide.
    pub routing: tokio::sync::Mutex<()>,
}

impl EngineCore {
    /// Wire all subsystems over one graph store. Returns the core and the
    /// receiving end of the async handler completion channel.
    pub fn new(
        config: EngineConfig,
        store: Arc<GraphStore>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<AsyncCompletion>) {
        let config = Arc::new(config);
        let (async_tx, async_rx) = mpsc::unbounded_channel();
        let core = Arc::new(Self {
            defs: DefinitionStore::new(store.clone()),
            vars: VariableStore::new(store.clone(), config.variable_max_bytes),
            expr: ConditionEvaluator::new(store.clone()),
            topics: TopicRegistry::new(config.clone(), async_tx),
            tokens: TokenStore::new(store.clone()),
            tasks: TaskStore::new(store.clone()),
            timers: TimerService::new(store.clone(), config.clone()),
            audit: AuditLog::new(store.clone()),
            script: RwLock::new(None),
            pending_messages: tokio::sync::Mutex::new(std::collections::VecDeque::new()),
            routing: tokio::sync::Mutex::new(()),
            store,
            config,
        });
        (core, async_rx)
    }

    // ── Instance rows ─────────────────────────────────────────

    pub async fn create_instance(
        &self,
        id: Uuid,
        definition_id: &str,
        parent: Option<(Uuid, &str)>,
    ) -> Result<InstanceRecord> {
        let subject = vocab::instance_iri(id);
        let now = Utc::now();
        let mut ops = vec![
            GraphOp::insert(
                &subject,
                &NamedNode::new_unchecked(vocab::RDF_TYPE.as_str()),
                Term::NamedNode(vocab::inst::class_instance()),
            ),
            GraphOp::insert(
                &subject,
                &vocab::inst::definition(),
                Term::NamedNode(vocab::definition_iri(definition_id)),
            ),
            GraphOp::insert(
                &subject,
                &vocab::inst::status(),
                Literal::from(InstanceStatus::Created.as_str()),
            ),
            GraphOp::insert(&subject, &vocab::inst::created_at(), datetime_literal(now)),
            GraphOp::insert(&subject, &vocab::inst::updated_at(), datetime_literal(now)),
        ];
        if let Some((parent_id, call_node)) = parent {
            ops.push(GraphOp::insert(
                &subject,
                &vocab::inst::parent_instance(),
                Term::NamedNode(vocab::instance_iri(parent_id)),
            ));
            ops.push(GraphOp::insert(
                &subject,
                &vocab::inst::parent_call_node(),
                Literal::from(call_node),
            ));
        }
        self.store.apply(GRAPH_INST, ops).await?;
        Ok(InstanceRecord {
            id,
            definition_id: definition_id.to_string(),
            status: InstanceStatus::Created,
            created_at: now,
            updated_at: now,
            completed_at: None,
            parent: parent.map(|(p, n)| (p, n.to_string())),
        })
    }

    pub fn instance(&self, id: Uuid) -> Result<InstanceRecord> {
        let subject = vocab::instance_iri(id);
        let props = self.store.properties(GRAPH_INST, &subject)?;
        let is_instance = props.iter().any(|(p, o)| {
            p.as_str() == vocab::RDF_TYPE.as_str()
                && *o == Term::NamedNode(vocab::inst::class_instance())
        });
        if !is_instance {
            return Err(EngineError::not_found("instance", id.to_string()));
        }
        let mut record = InstanceRecord {
            id,
            definition_id: String::new(),
            status: InstanceStatus::Created,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
            parent: None,
        };
        let mut parent_id = None;
        let mut parent_node = None;
        for (predicate, object) in props {
            match predicate.as_str() {
                p if p == vocab::inst::definition().as_str() => {
                    if let Term::NamedNode(n) = &object {
                        if let Some(raw) = n.as_str().strip_prefix(vocab::NS_DEF) {
                            record.definition_id = raw.to_string();
                        }
                    }
                }
                p if p == vocab::inst::status().as_str() => {
                    if let Some(s) = literal(&object).and_then(|s| InstanceStatus::parse(&s)) {
                        record.status = s;
                    }
                }
                p if p == vocab::inst::created_at().as_str() => {
                    if let Some(t) = parse_datetime(&object) {
                        record.created_at = t;
                    }
                }
                p if p == vocab::inst::updated_at().as_str() => {
                    if let Some(t) = parse_datetime(&object) {
                        record.updated_at = t;
                    }
                }
                p if p == vocab::inst::completed_at().as_str() => {
                    record.completed_at = parse_datetime(&object);
                }
                p if p == vocab::inst::parent_instance().as_str() => {
                    if let Term::NamedNode(n) = &object {
                        parent_id = vocab::uuid_from_iri(n.as_str());
                    }
                }
                p if p == vocab::inst::parent_call_node().as_str() => {
                    parent_node = literal(&object);
                }
                _ => {}
            }
        }
        if let (Some(p), Some(n)) = (parent_id, parent_node) {
            record.parent = Some((p, n));
        }
        Ok(record)
    }

    pub async fn set_instance_status(&self, id: Uuid, status: InstanceStatus) -> Result<()> {
        let subject = vocab::instance_iri(id);
        let now = Utc::now();
        let mut ops = GraphOp::replace(
            &subject,
            &vocab::inst::status(),
            Literal::from(status.as_str()),
        )
        .to_vec();
        ops.extend(GraphOp::replace(
            &subject,
            &vocab::inst::updated_at(),
            datetime_literal(now),
        ));
        if status.is_terminal() {
            ops.extend(GraphOp::replace(
                &subject,
                &vocab::inst::completed_at(),
                datetime_literal(now),
            ));
        }
        self.store.apply(GRAPH_INST, ops).await
    }

    pub fn list_instances(
        &self,
        status: Option<InstanceStatus>,
        definition_id: Option<&str>,
    ) -> Result<Vec<InstanceRecord>> {
        let class = Term::NamedNode(vocab::inst::class_instance());
        let rdf_type = NamedNode::new_unchecked(vocab::RDF_TYPE.as_str());
        let mut out = Vec::new();
        for subject in self.store.subjects(GRAPH_INST, &rdf_type, &class)? {
            let Some(id) = vocab::uuid_from_iri(subject.as_str()) else {
                continue;
            };
            let record = self.instance(id)?;
            if let Some(filter) = status {
                if record.status != filter {
                    continue;
                }
            }
            if let Some(filter) = definition_id {
                if record.definition_id != filter {
                    continue;
                }
            }
            out.push(record);
        }
        out.sort_by_key(|r| r.id);
        Ok(out)
    }

    // ── Variable scope chains ─────────────────────────────────

    /// Subjects to probe for a token's variables: the token itself
    /// (multi-instance locals), active scopes innermost first, then the
    /// instance.
    pub fn scope_chain(&self, token: &Token) -> Vec<NamedNode> {
        let mut chain = vec![vocab::token_iri(token.id)];
        for entry in token.scope_path.iter().rev() {
            chain.push(vocab::scope_iri(entry.scope_id));
        }
        chain.push(vocab::instance_iri(token.instance_id));
        chain
    }

    // ── Compensation bookkeeping ──────────────────────────────

    /// Record a completed activity with a compensation boundary so a later
    /// compensation throw can run handlers in reverse completion order.
    pub async fn record_compensable(
        &self,
        instance_id: Uuid,
        scope_subject: &NamedNode,
        activity_id: &str,
        boundary_id: &str,
    ) -> Result<()> {
        let stamp = Utc::now().timestamp_micros();
        let encoded = format!("{stamp:020}|{activity_id}|{boundary_id}");
        self.store
            .insert(
                GRAPH_INST,
                scope_subject,
                &vocab::inst::compensable(),
                Literal::from(encoded.as_str()),
            )
            .await?;
        tracing::debug!(instance = %instance_id, activity = activity_id, "compensation handler registered");
        Ok(())
    }

    /// Registered compensation handlers on a scope, most recent first:
    /// `(activity id, boundary id)`.
    pub fn compensables(&self, scope_subject: &NamedNode) -> Result<Vec<(String, String)>> {
        let mut entries: Vec<String> = self
            .store
            .objects(GRAPH_INST, scope_subject, &vocab::inst::compensable())?
            .into_iter()
            .filter_map(|t| literal(&t))
            .collect();
        entries.sort();
        entries.reverse();
        Ok(entries
            .into_iter()
            .filter_map(|e| {
                let mut parts = e.splitn(3, '|');
                let _stamp = parts.next()?;
                Some((parts.next()?.to_string(), parts.next()?.to_string()))
            })
            .collect())
    }
}

pub fn datetime_literal(t: DateTime<Utc>) -> Literal {
    Literal::new_typed_literal(
        t.to_rfc3339_opts(SecondsFormat::Micros, true),
        oxigraph::model::vocab::xsd::DATE_TIME,
    )
}

fn literal(term: &Term) -> Option<String> {
    match term {
        Term::Literal(lit) => Some(lit.value().to_string()),
        _ => None,
    }
}

fn parse_datetime(term: &Term) -> Option<DateTime<Utc>> {
    literal(term)
        .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn instance_row_round_trip() {
        let store = Arc::new(GraphStore::open(None).unwrap());
        let (core, _rx) = EngineCore::new(EngineConfig::default(), store);
        let id = Uuid::now_v7();
        core.create_instance(id, "def-1", None).await.unwrap();

        let record = core.instance(id).unwrap();
        assert_eq!(record.definition_id, "def-1");
        assert_eq!(record.status, InstanceStatus::Created);
        assert!(record.parent.is_none());

        core.set_instance_status(id, InstanceStatus::Completed)
            .await
            .unwrap();
        let done = core.instance(id).unwrap();
        assert_eq!(done.status, InstanceStatus::Completed);
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn parent_linkage() {
        let store = Arc::new(GraphStore::open(None).unwrap());
        let (core, _rx) = EngineCore::new(EngineConfig::default(), store);
        let parent = Uuid::now_v7();
        let child = Uuid::now_v7();
        core.create_instance(parent, "p", None).await.unwrap();
        core.create_instance(child, "c", Some((parent, "call1")))
            .await
            .unwrap();

        let record = core.instance(child).unwrap();
        assert_eq!(record.parent, Some((parent, "call1".to_string())));
    }

    #[tokio::test]
    async fn compensables_are_lifo() {
        let store = Arc::new(GraphStore::open(None).unwrap());
        let (core, _rx) = EngineCore::new(EngineConfig::default(), store);
        let id = Uuid::now_v7();
        let subject = vocab::instance_iri(id);
        core.record_compensable(id, &subject, "a1", "b1")
            .await
            .unwrap();
        core.record_compensable(id, &subject, "a2", "b2")
            .await
            .unwrap();

        let entries = core.compensables(&subject).unwrap();
        assert_eq!(
            entries,
            vec![
                ("a2".to_string(), "b2".to_string()),
                ("a1".to_string(), "b1".to_string())
            ]
        );
    }
}
