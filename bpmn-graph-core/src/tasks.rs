//! User task repository over the `tasks` graph.
//!
//! A row exists for every token parked at a user task; completing the task
//! is what releases the token (the supervisor wires the two together).

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use oxigraph::model::{Literal, NamedNode, Term};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::store::{GraphOp, GraphStore};
use crate::types::{UserTaskRecord, UserTaskStatus};
use crate::vocab::{self, GRAPH_TASKS};

#[derive(Debug, Default, Clone)]
pub struct TaskFilter {
    pub instance_id: Option<Uuid>,
    pub status: Option<UserTaskStatus>,
    pub assignee: Option<String>,
}

pub struct TaskStore {
    store: Arc<GraphStore>,
}

impl TaskStore {
    pub fn new(store: Arc<GraphStore>) -> Self {
        Self { store }
    }

    pub async fn create(&self, instance_id: Uuid, node_id: &str) -> Result<UserTaskRecord> {
        let id = Uuid::now_v7();
        let subject = vocab::task_iri(id);
        let created_at = Utc::now();
        let ops = vec![
            GraphOp::insert(
                &subject,
                &NamedNode::new_unchecked(vocab::RDF_TYPE.as_str()),
                Term::NamedNode(vocab::task::class_user_task()),
            ),
            GraphOp::insert(
                &subject,
                &vocab::task::instance(),
                Term::NamedNode(vocab::instance_iri(instance_id)),
            ),
            GraphOp::insert(&subject, &vocab::task::node(), Literal::from(node_id)),
            GraphOp::insert(
                &subject,
                &vocab::task::status(),
                Literal::from(UserTaskStatus::Created.as_str()),
            ),
            GraphOp::insert(
                &subject,
                &vocab::task::created_at(),
                timestamp_literal(created_at),
            ),
        ];
        self.store.apply(GRAPH_TASKS, ops).await?;
        Ok(UserTaskRecord {
            id,
            instance_id,
            node_id: node_id.to_string(),
            status: UserTaskStatus::Created,
            assignee: None,
            created_at,
            claimed_at: None,
            completed_at: None,
        })
    }

    pub fn get(&self, task_id: Uuid) -> Result<UserTaskRecord> {
        let subject = vocab::task_iri(task_id);
        let mut record = UserTaskRecord {
            id: task_id,
            instance_id: Uuid::nil(),
            node_id: String::new(),
            status: UserTaskStatus::Created,
            assignee: None,
            created_at: Utc::now(),
            claimed_at: None,
            completed_at: None,
        };
        let props = self.store.properties(GRAPH_TASKS, &subject)?;
        if props.is_empty() {
            return Err(EngineError::not_found("task", task_id.to_string()));
        }
        for (predicate, object) in props {
            match predicate.as_str() {
                p if p == vocab::task::instance().as_str() => {
                    if let Term::NamedNode(n) = &object {
                        if let Some(id) = vocab::uuid_from_iri(n.as_str()) {
                            record.instance_id = id;
                        }
                    }
                }
                p if p == vocab::task::node().as_str() => {
                    record.node_id = literal_value(&object).unwrap_or_default();
                }
                p if p == vocab::task::status().as_str() => {
                    if let Some(s) =
                        literal_value(&object).and_then(|s| UserTaskStatus::parse(&s))
                    {
                        record.status = s;
                    }
                }
                p if p == vocab::task::assignee().as_str() => {
                    record.assignee = literal_value(&object);
                }
                p if p == vocab::task::created_at().as_str() => {
                    if let Some(t) = parse_timestamp(&object) {
                        record.created_at = t;
                    }
                }
                p if p == vocab::task::claimed_at().as_str() => {
                    record.claimed_at = parse_timestamp(&object);
                }
                p if p == vocab::task::completed_at().as_str() => {
                    record.completed_at = parse_timestamp(&object);
                }
                _ => {}
            }
        }
        Ok(record)
    }

    pub async fn claim(&self, task_id: Uuid, assignee: &str) -> Result<UserTaskRecord> {
        let record = self.get(task_id)?;
        if record.status != UserTaskStatus::Created {
            return Err(EngineError::PreconditionFailed(format!(
                "task {task_id} is {}",
                record.status.as_str()
            )));
        }
        let subject = vocab::task_iri(task_id);
        let claimed_at = Utc::now();
        let mut ops = GraphOp::replace(
            &subject,
            &vocab::task::status(),
            Literal::from(UserTaskStatus::Claimed.as_str()),
        )
        .to_vec();
        ops.extend(GraphOp::replace(
            &subject,
            &vocab::task::assignee(),
            Literal::from(assignee),
        ));
        ops.extend(GraphOp::replace(
            &subject,
            &vocab::task::claimed_at(),
            timestamp_literal(claimed_at),
        ));
        self.store.apply(GRAPH_TASKS, ops).await?;
        self.get(task_id)
    }

    pub async fn unclaim(&self, task_id: Uuid) -> Result<UserTaskRecord> {
        let record = self.get(task_id)?;
        if record.status != UserTaskStatus::Claimed {
            return Err(EngineError::PreconditionFailed(format!(
                "task {task_id} is {}",
                record.status.as_str()
            )));
        }
        let subject = vocab::task_iri(task_id);
        let mut ops = GraphOp::replace(
            &subject,
            &vocab::task::status(),
            Literal::from(UserTaskStatus::Created.as_str()),
        )
        .to_vec();
        ops.push(GraphOp::remove(
            Some(&subject),
            Some(&vocab::task::assignee()),
            None,
        ));
        ops.push(GraphOp::remove(
            Some(&subject),
            Some(&vocab::task::claimed_at()),
            None,
        ));
        self.store.apply(GRAPH_TASKS, ops).await?;
        self.get(task_id)
    }

    /// Transition to COMPLETED. Completing twice is a precondition failure.
    pub async fn mark_completed(&self, task_id: Uuid) -> Result<UserTaskRecord> {
        let record = self.get(task_id)?;
        if record.status == UserTaskStatus::Completed {
            return Err(EngineError::PreconditionFailed(format!(
                "task {task_id} already completed"
            )));
        }
        let subject = vocab::task_iri(task_id);
        let mut ops = GraphOp::replace(
            &subject,
            &vocab::task::status(),
            Literal::from(UserTaskStatus::Completed.as_str()),
        )
        .to_vec();
        ops.extend(GraphOp::replace(
            &subject,
            &vocab::task::completed_at(),
            timestamp_literal(Utc::now()),
        ));
        self.store.apply(GRAPH_TASKS, ops).await?;
        self.get(task_id)
    }

    pub fn list(&self, filter: &TaskFilter) -> Result<Vec<UserTaskRecord>> {
        let class = Term::NamedNode(vocab::task::class_user_task());
        let rdf_type = NamedNode::new_unchecked(vocab::RDF_TYPE.as_str());
        let mut out = Vec::new();
        for subject in self.store.subjects(GRAPH_TASKS, &rdf_type, &class)? {
            let Some(id) = vocab::uuid_from_iri(subject.as_str()) else {
                continue;
            };
            let record = self.get(id)?;
            if let Some(instance_id) = filter.instance_id {
                if record.instance_id != instance_id {
                    continue;
                }
            }
            if let Some(status) = filter.status {
                if record.status != status {
                    continue;
                }
            }
            if let Some(assignee) = &filter.assignee {
                if record.assignee.as_deref() != Some(assignee.as_str()) {
                    continue;
                }
            }
            out.push(record);
        }
        out.sort_by_key(|r| r.created_at);
        Ok(out)
    }
}

fn timestamp_literal(t: DateTime<Utc>) -> Literal {
    Literal::new_typed_literal(
        t.to_rfc3339_opts(SecondsFormat::Micros, true),
        oxigraph::model::vocab::xsd::DATE_TIME,
    )
}

fn literal_value(term: &Term) -> Option<String> {
    match term {
        Term::Literal(lit) => Some(lit.value().to_string()),
        _ => None,
    }
}

fn parse_timestamp(term: &Term) -> Option<DateTime<Utc>> {
    literal_value(term)
        .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lifecycle_and_preconditions() {
        let store = Arc::new(GraphStore::open(None).unwrap());
        let tasks = TaskStore::new(store);
        let instance = Uuid::now_v7();

        let task = tasks.create(instance, "approve").await.unwrap();
        assert_eq!(task.status, UserTaskStatus::Created);

        let claimed = tasks.claim(task.id, "alice").await.unwrap();
        assert_eq!(claimed.status, UserTaskStatus::Claimed);
        assert_eq!(claimed.assignee.as_deref(), Some("alice"));
        assert!(claimed.claimed_at.is_some());

        // Claiming a claimed task fails.
        assert!(matches!(
            tasks.claim(task.id, "bob").await.unwrap_err(),
            EngineError::PreconditionFailed(_)
        ));

        let done = tasks.mark_completed(task.id).await.unwrap();
        assert_eq!(done.status, UserTaskStatus::Completed);

        // Completing twice fails.
        assert!(matches!(
            tasks.mark_completed(task.id).await.unwrap_err(),
            EngineError::PreconditionFailed(_)
        ));
    }

    #[tokio::test]
    async fn unclaim_returns_to_created() {
        let store = Arc::new(GraphStore::open(None).unwrap());
        let tasks = TaskStore::new(store);
        let task = tasks.create(Uuid::now_v7(), "review").await.unwrap();
        tasks.claim(task.id, "alice").await.unwrap();
        let back = tasks.unclaim(task.id).await.unwrap();
        assert_eq!(back.status, UserTaskStatus::Created);
        assert!(back.assignee.is_none());
    }

    #[tokio::test]
    async fn list_filters() {
        let store = Arc::new(GraphStore::open(None).unwrap());
        let tasks = TaskStore::new(store);
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        tasks.create(a, "t1").await.unwrap();
        tasks.create(b, "t2").await.unwrap();

        let filtered = tasks
            .list(&TaskFilter {
                instance_id: Some(a),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].node_id, "t1");

        let created = tasks
            .list(&TaskFilter {
                status: Some(UserTaskStatus::Created),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(created.len(), 2);
    }
}
