//! Append-only audit trail in the `log` graph.
//!
//! Events are totally ordered per instance by a sequence number and carry a
//! monotonically non-decreasing timestamp, so a reader can reconstruct the
//! execution even if it observed a partial cross-graph intermediate state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use oxigraph::model::{Literal, NamedNode, Term};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::store::{GraphOp, GraphStore};
use crate::types::AuditRecord;
use crate::vocab::{self, GRAPH_LOG};

/// Audit event types emitted by the engine.
pub mod event {
    pub const START: &str = "START";
    pub const END: &str = "END";
    pub const TAKE: &str = "TAKE";
    pub const COMPLETE: &str = "COMPLETE";
    pub const CREATE_TASK: &str = "CREATE_TASK";
    pub const CLAIM_TASK: &str = "CLAIM_TASK";
    pub const UNCLAIM_TASK: &str = "UNCLAIM_TASK";
    pub const COMPLETE_TASK: &str = "COMPLETE_TASK";
    pub const MESSAGE_SENT: &str = "MESSAGE_SENT";
    pub const MESSAGE_RECEIVED: &str = "MESSAGE_RECEIVED";
    pub const SIGNAL_BROADCAST: &str = "SIGNAL_BROADCAST";
    pub const TIMER_SCHEDULED: &str = "TIMER_SCHEDULED";
    pub const TIMER_FIRED: &str = "TIMER_FIRED";
    pub const BOUNDARY_FIRED: &str = "BOUNDARY_FIRED";
    pub const CANCEL_ACTIVITY: &str = "CANCEL_ACTIVITY";
    pub const ERROR: &str = "ERROR";
    pub const TERMINATE: &str = "TERMINATE";
    pub const DEAD_END: &str = "DEAD_END";
    pub const SCRIPT_SKIPPED: &str = "SCRIPT_SKIPPED";
    pub const MANUAL_COMPLETE: &str = "MANUAL_COMPLETE";
    pub const SUBPROCESS_ENTER: &str = "SUBPROCESS_ENTER";
    pub const SUBPROCESS_EXIT: &str = "SUBPROCESS_EXIT";
    pub const CALL_STARTED: &str = "CALL_STARTED";
    pub const CALL_COMPLETED: &str = "CALL_COMPLETED";
    pub const MI_STARTED: &str = "MI_STARTED";
    pub const MI_COMPLETED: &str = "MI_COMPLETED";
    pub const COMPENSATE: &str = "COMPENSATE";
    pub const UNSUPPORTED: &str = "UNSUPPORTED";
    pub const LISTENER: &str = "LISTENER";
    pub const WARNING: &str = "WARNING";
}

pub const ACTOR_SYSTEM: &str = "System";

pub struct AuditLog {
    store: Arc<GraphStore>,
    /// Next sequence number and last emitted timestamp per instance.
    state: Mutex<HashMap<Uuid, (u64, DateTime<Utc>)>>,
}

impl AuditLog {
    pub fn new(store: Arc<GraphStore>) -> Self {
        Self {
            store,
            state: Mutex::new(HashMap::new()),
        }
    }

    pub async fn emit(
        &self,
        instance_id: Uuid,
        node_id: Option<&str>,
        event_type: &str,
        actor: &str,
        details: Option<&str>,
    ) -> Result<AuditRecord> {
        let (seq, timestamp) = self.next_slot(instance_id).await?;
        let event_id = Uuid::now_v7();
        let subject = vocab::audit_iri(event_id);
        let instance_node = vocab::instance_iri(instance_id);

        let mut ops = vec![
            GraphOp::insert(
                &subject,
                &NamedNode::new_unchecked(vocab::RDF_TYPE.as_str()),
                Term::NamedNode(vocab::audit::class_event()),
            ),
            GraphOp::insert(
                &subject,
                &vocab::audit::instance(),
                Term::NamedNode(instance_node),
            ),
            GraphOp::insert(
                &subject,
                &vocab::audit::event_type(),
                Literal::from(event_type),
            ),
            GraphOp::insert(
                &subject,
                &vocab::audit::timestamp(),
                Literal::new_typed_literal(
                    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
                    oxigraph::model::vocab::xsd::DATE_TIME,
                ),
            ),
            GraphOp::insert(&subject, &vocab::audit::actor(), Literal::from(actor)),
            GraphOp::insert(
                &subject,
                &vocab::audit::seq(),
                Literal::new_typed_literal(
                    seq.to_string(),
                    oxigraph::model::vocab::xsd::INTEGER,
                ),
            ),
        ];
        if let Some(node_id) = node_id {
            ops.push(GraphOp::insert(
                &subject,
                &vocab::audit::node(),
                Literal::from(node_id),
            ));
        }
        if let Some(details) = details {
            ops.push(GraphOp::insert(
                &subject,
                &vocab::audit::details(),
                Literal::from(details),
            ));
        }
        self.store.apply(GRAPH_LOG, ops).await?;

        tracing::debug!(
            instance = %instance_id,
            event = event_type,
            node = node_id.unwrap_or("-"),
            seq,
            "audit"
        );
        Ok(AuditRecord {
            event_uri: subject.as_str().to_string(),
            instance_id,
            node_id: node_id.map(str::to_string),
            event_type: event_type.to_string(),
            timestamp,
            actor: actor.to_string(),
            details: details.map(str::to_string),
            seq,
        })
    }

    /// Allocate the next (seq, timestamp) pair. Timestamps are clamped so
    /// they never run backwards within one instance.
    async fn next_slot(&self, instance_id: Uuid) -> Result<(u64, DateTime<Utc>)> {
        let mut state = self.state.lock().await;
        let entry = match state.get(&instance_id) {
            Some(found) => *found,
            None => {
                let seeded = self.max_persisted_seq(instance_id)?;
                (seeded, DateTime::<Utc>::MIN_UTC)
            }
        };
        let seq = entry.0 + 1;
        let now = Utc::now();
        let timestamp = if now > entry.1 { now } else { entry.1 };
        state.insert(instance_id, (seq, timestamp));
        Ok((seq, timestamp))
    }

    fn max_persisted_seq(&self, instance_id: Uuid) -> Result<u64> {
        let sparql = format!(
            "SELECT (MAX(?seq) AS ?max) WHERE {{ ?e <{}> <{}> . ?e <{}> ?seq }}",
            vocab::audit::instance().as_str(),
            vocab::instance_iri(instance_id).as_str(),
            vocab::audit::seq().as_str()
        );
        let solutions = self.store.select(GRAPH_LOG, &sparql)?;
        let max = solutions
            .first()
            .and_then(|s| s.get("max"))
            .and_then(|t| match t {
                Term::Literal(lit) => lit.value().parse::<u64>().ok(),
                _ => None,
            })
            .unwrap_or(0);
        Ok(max)
    }

    /// Full trail for one instance, ordered by sequence.
    pub fn trail(&self, instance_id: Uuid) -> Result<Vec<AuditRecord>> {
        let sparql = format!(
            "SELECT ?e ?type ?ts ?actor ?seq ?node ?details WHERE {{ \
               ?e <{inst}> <{subject}> . \
               ?e <{etype}> ?type . \
               ?e <{ts}> ?ts . \
               ?e <{actor}> ?actor . \
               ?e <{seq}> ?seq . \
               OPTIONAL {{ ?e <{node}> ?node }} \
               OPTIONAL {{ ?e <{details}> ?details }} \
             }} ORDER BY ?seq",
            inst = vocab::audit::instance().as_str(),
            subject = vocab::instance_iri(instance_id).as_str(),
            etype = vocab::audit::event_type().as_str(),
            ts = vocab::audit::timestamp().as_str(),
            actor = vocab::audit::actor().as_str(),
            seq = vocab::audit::seq().as_str(),
            node = vocab::audit::node().as_str(),
            details = vocab::audit::details().as_str(),
        );
        let mut out = Vec::new();
        for solution in self.store.select(GRAPH_LOG, &sparql)? {
            let lit = |name: &str| -> Option<String> {
                solution.get(name).and_then(|t| match t {
                    Term::Literal(l) => Some(l.value().to_string()),
                    _ => None,
                })
            };
            let event_uri = match solution.get("e") {
                Some(Term::NamedNode(n)) => n.as_str().to_string(),
                _ => continue,
            };
            let timestamp = lit("ts")
                .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
                .map(|t| t.with_timezone(&Utc))
                .ok_or_else(|| EngineError::Store("audit event missing timestamp".into()))?;
            out.push(AuditRecord {
                event_uri,
                instance_id,
                node_id: lit("node"),
                event_type: lit("type").unwrap_or_default(),
                timestamp,
                actor: lit("actor").unwrap_or_default(),
                details: lit("details"),
                seq: lit("seq").and_then(|s| s.parse().ok()).unwrap_or(0),
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trail_is_ordered_and_monotone() {
        let store = Arc::new(GraphStore::open(None).unwrap());
        let log = AuditLog::new(store);
        let instance = Uuid::now_v7();

        log.emit(instance, None, event::START, ACTOR_SYSTEM, None)
            .await
            .unwrap();
        log.emit(instance, Some("task1"), event::COMPLETE, ACTOR_SYSTEM, None)
            .await
            .unwrap();
        log.emit(instance, None, event::END, ACTOR_SYSTEM, None)
            .await
            .unwrap();

        let trail = log.trail(instance).unwrap();
        assert_eq!(trail.len(), 3);
        assert_eq!(
            trail.iter().map(|r| r.event_type.as_str()).collect::<Vec<_>>(),
            vec![event::START, event::COMPLETE, event::END]
        );
        for pair in trail.windows(2) {
            assert!(pair[0].seq < pair[1].seq);
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[tokio::test]
    async fn seq_reseeds_from_graph() {
        let store = Arc::new(GraphStore::open(None).unwrap());
        let instance = Uuid::now_v7();
        {
            let log = AuditLog::new(store.clone());
            log.emit(instance, None, event::START, ACTOR_SYSTEM, None)
                .await
                .unwrap();
        }
        // Fresh log over the same graph continues the sequence.
        let log = AuditLog::new(store);
        let record = log
            .emit(instance, None, event::END, ACTOR_SYSTEM, None)
            .await
            .unwrap();
        assert_eq!(record.seq, 2);
    }
}
