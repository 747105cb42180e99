//! Token persistence over the `inst` graph.
//!
//! A token is a cursor in a process instance. Its wait metadata (what it is
//! parked on, and the keys needed to resume it) is stored as triples on the
//! token subject so a restarted engine can pick up exactly where it was.

use std::sync::Arc;

use oxigraph::model::{Literal, NamedNode, Term};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::store::{GraphOp, GraphStore};
use crate::types::{
    decode_scope_path, encode_scope_path, ScopeEntry, Token, TokenState, WaitInfo,
};
use crate::vocab::{self, GRAPH_INST};

pub struct TokenStore {
    store: Arc<GraphStore>,
}

impl TokenStore {
    pub fn new(store: Arc<GraphStore>) -> Self {
        Self { store }
    }

    pub async fn create(
        &self,
        instance_id: Uuid,
        node_id: &str,
        scope_path: &[ScopeEntry],
        loop_index: Option<u32>,
        state: TokenState,
    ) -> Result<Token> {
        let id = Uuid::now_v7();
        let subject = vocab::token_iri(id);
        let instance = vocab::instance_iri(instance_id);
        let mut ops = vec![
            GraphOp::insert(
                &subject,
                &NamedNode::new_unchecked(vocab::RDF_TYPE.as_str()),
                Term::NamedNode(vocab::inst::class_token()),
            ),
            GraphOp::insert(
                &subject,
                &vocab::inst::belongs_to(),
                Term::NamedNode(instance.clone()),
            ),
            GraphOp::insert(
                &instance,
                &vocab::inst::has_token(),
                Term::NamedNode(subject.clone()),
            ),
            GraphOp::insert(&subject, &vocab::inst::status(), Literal::from(state.as_str())),
            GraphOp::insert(&subject, &vocab::inst::current_node(), Literal::from(node_id)),
        ];
        if !scope_path.is_empty() {
            ops.push(GraphOp::insert(
                &subject,
                &vocab::inst::scope_path(),
                Literal::from(encode_scope_path(scope_path).as_str()),
            ));
        }
        if let Some(index) = loop_index {
            ops.push(GraphOp::insert(
                &subject,
                &vocab::inst::loop_index(),
                Literal::new_typed_literal(
                    index.to_string(),
                    oxigraph::model::vocab::xsd::INTEGER,
                ),
            ));
        }
        self.store.apply(GRAPH_INST, ops).await?;
        Ok(Token {
            id,
            instance_id,
            node_id: node_id.to_string(),
            scope_path: scope_path.to_vec(),
            state,
            loop_index,
            wait: None,
        })
    }

    pub fn get(&self, token_id: Uuid) -> Result<Token> {
        let subject = vocab::token_iri(token_id);
        let props = self.store.properties(GRAPH_INST, &subject)?;
        if props.is_empty() {
            return Err(EngineError::not_found("token", token_id.to_string()));
        }
        let mut token = Token {
            id: token_id,
            instance_id: Uuid::nil(),
            node_id: String::new(),
            scope_path: Vec::new(),
            state: TokenState::Active,
            loop_index: None,
            wait: None,
        };
        let mut wait_kind = None;
        let mut message_name = None;
        let mut signal_name = None;
        let mut correlation_key = None;
        let mut gateway_token = None;
        let mut child_instance = None;
        let mut callback_id = None;
        let mut user_task = None;
        let mut timer_job = None;
        for (predicate, object) in props {
            let text = literal_value(&object);
            match predicate.as_str() {
                p if p == vocab::inst::belongs_to().as_str() => {
                    if let Term::NamedNode(n) = &object {
                        if let Some(id) = vocab::uuid_from_iri(n.as_str()) {
                            token.instance_id = id;
                        }
                    }
                }
                p if p == vocab::inst::status().as_str() => {
                    if let Some(s) = text.as_deref().and_then(TokenState::parse) {
                        token.state = s;
                    }
                }
                p if p == vocab::inst::current_node().as_str() => {
                    token.node_id = text.unwrap_or_default();
                }
                p if p == vocab::inst::scope_path().as_str() => {
                    token.scope_path = decode_scope_path(&text.unwrap_or_default());
                }
                p if p == vocab::inst::loop_index().as_str() => {
                    token.loop_index = text.and_then(|s| s.parse().ok());
                }
                p if p == vocab::inst::wait_kind().as_str() => wait_kind = text,
                p if p == vocab::inst::message_name().as_str() => message_name = text,
                p if p == vocab::inst::signal_name().as_str() => signal_name = text,
                p if p == vocab::inst::correlation_key().as_str() => correlation_key = text,
                p if p == vocab::inst::gateway_token().as_str() => {
                    if let Term::NamedNode(n) = &object {
                        gateway_token = vocab::uuid_from_iri(n.as_str());
                    }
                }
                p if p == vocab::inst::child_instance().as_str() => {
                    if let Term::NamedNode(n) = &object {
                        child_instance = vocab::uuid_from_iri(n.as_str());
                    }
                }
                p if p == vocab::inst::callback_id().as_str() => callback_id = text,
                p if p == vocab::inst::user_task().as_str() => {
                    if let Term::NamedNode(n) = &object {
                        user_task = vocab::uuid_from_iri(n.as_str());
                    }
                }
                p if p == vocab::inst::timer_job().as_str() => {
                    if let Term::NamedNode(n) = &object {
                        timer_job = vocab::uuid_from_iri(n.as_str());
                    }
                }
                _ => {}
            }
        }
        token.wait = match wait_kind.as_deref() {
            Some("task") => user_task.map(|task_id| WaitInfo::UserTask { task_id }),
            Some("message") => Some(WaitInfo::Message {
                name: message_name.unwrap_or_default(),
                correlation_key: correlation_key.unwrap_or_default(),
                gateway_token,
            }),
            Some("signal") => Some(WaitInfo::Signal {
                name: signal_name.unwrap_or_default(),
                gateway_token,
            }),
            Some("timer") => timer_job.map(|timer_id| WaitInfo::Timer {
                timer_id,
                gateway_token,
            }),
            Some("child") => child_instance.map(|instance_id| WaitInfo::Child { instance_id }),
            Some("gateway") => Some(WaitInfo::Gateway),
            Some("callback") => callback_id.map(|callback_id| WaitInfo::Callback { callback_id }),
            Some("join") => Some(WaitInfo::Join),
            _ => None,
        };
        Ok(token)
    }

    pub fn for_instance(&self, instance_id: Uuid) -> Result<Vec<Token>> {
        let instance = vocab::instance_iri(instance_id);
        let mut tokens = Vec::new();
        for term in self
            .store
            .objects(GRAPH_INST, &instance, &vocab::inst::has_token())?
        {
            let Term::NamedNode(n) = term else { continue };
            let Some(id) = vocab::uuid_from_iri(n.as_str()) else {
                continue;
            };
            tokens.push(self.get(id)?);
        }
        // v7 token ids are time-ordered; sorting gives creation order.
        tokens.sort_by_key(|t| t.id);
        Ok(tokens)
    }

    pub fn live_tokens(&self, instance_id: Uuid) -> Result<Vec<Token>> {
        Ok(self
            .for_instance(instance_id)?
            .into_iter()
            .filter(|t| t.state != TokenState::Consumed)
            .collect())
    }

    pub async fn set_state(&self, token_id: Uuid, state: TokenState) -> Result<()> {
        let subject = vocab::token_iri(token_id);
        self.store
            .replace(GRAPH_INST, &subject, &vocab::inst::status(), Literal::from(state.as_str()))
            .await
    }

    pub async fn move_to(&self, token_id: Uuid, node_id: &str) -> Result<()> {
        let subject = vocab::token_iri(token_id);
        self.store
            .replace(GRAPH_INST, &subject, &vocab::inst::current_node(), Literal::from(node_id))
            .await
    }

    pub async fn set_scope_path(&self, token_id: Uuid, path: &[ScopeEntry]) -> Result<()> {
        let subject = vocab::token_iri(token_id);
        if path.is_empty() {
            self.store
                .remove_pattern(GRAPH_INST, Some(&subject), Some(&vocab::inst::scope_path()), None)
                .await
        } else {
            self.store
                .replace(
                    GRAPH_INST,
                    &subject,
                    &vocab::inst::scope_path(),
                    Literal::from(encode_scope_path(path).as_str()),
                )
                .await
        }
    }

    pub async fn clear_loop_index(&self, token_id: Uuid) -> Result<()> {
        let subject = vocab::token_iri(token_id);
        self.store
            .remove_pattern(GRAPH_INST, Some(&subject), Some(&vocab::inst::loop_index()), None)
            .await
    }

    /// Park a token: state WAITING plus the resume keys.
    pub async fn park(&self, token_id: Uuid, wait: &WaitInfo) -> Result<()> {
        let subject = vocab::token_iri(token_id);
        let mut ops = self.clear_wait_ops(&subject);
        ops.extend(GraphOp::replace(
            &subject,
            &vocab::inst::status(),
            Literal::from(TokenState::Waiting.as_str()),
        ));
        let kind = match wait {
            WaitInfo::UserTask { task_id } => {
                ops.push(GraphOp::insert(
                    &subject,
                    &vocab::inst::user_task(),
                    Term::NamedNode(vocab::task_iri(*task_id)),
                ));
                "task"
            }
            WaitInfo::Message {
                name,
                correlation_key,
                gateway_token,
            } => {
                ops.push(GraphOp::insert(
                    &subject,
                    &vocab::inst::message_name(),
                    Literal::from(name.as_str()),
                ));
                ops.push(GraphOp::insert(
                    &subject,
                    &vocab::inst::correlation_key(),
                    Literal::from(correlation_key.as_str()),
                ));
                if let Some(gw) = gateway_token {
                    ops.push(GraphOp::insert(
                        &subject,
                        &vocab::inst::gateway_token(),
                        Term::NamedNode(vocab::token_iri(*gw)),
                    ));
                }
                "message"
            }
            WaitInfo::Signal {
                name,
                gateway_token,
            } => {
                ops.push(GraphOp::insert(
                    &subject,
                    &vocab::inst::signal_name(),
                    Literal::from(name.as_str()),
                ));
                if let Some(gw) = gateway_token {
                    ops.push(GraphOp::insert(
                        &subject,
                        &vocab::inst::gateway_token(),
                        Term::NamedNode(vocab::token_iri(*gw)),
                    ));
                }
                "signal"
            }
            WaitInfo::Timer {
                timer_id,
                gateway_token,
            } => {
                ops.push(GraphOp::insert(
                    &subject,
                    &vocab::inst::timer_job(),
                    Term::NamedNode(vocab::timer_iri(*timer_id)),
                ));
                if let Some(gw) = gateway_token {
                    ops.push(GraphOp::insert(
                        &subject,
                        &vocab::inst::gateway_token(),
                        Term::NamedNode(vocab::token_iri(*gw)),
                    ));
                }
                "timer"
            }
            WaitInfo::Child { instance_id } => {
                ops.push(GraphOp::insert(
                    &subject,
                    &vocab::inst::child_instance(),
                    Term::NamedNode(vocab::instance_iri(*instance_id)),
                ));
                "child"
            }
            WaitInfo::Gateway => "gateway",
            WaitInfo::Callback { callback_id } => {
                ops.push(GraphOp::insert(
                    &subject,
                    &vocab::inst::callback_id(),
                    Literal::from(callback_id.as_str()),
                ));
                "callback"
            }
            WaitInfo::Join => "join",
        };
        ops.push(GraphOp::insert(
            &subject,
            &vocab::inst::wait_kind(),
            Literal::from(kind),
        ));
        self.store.apply(GRAPH_INST, ops).await
    }

    /// Resume a parked token: back to ACTIVE with wait metadata dropped.
    pub async fn resume(&self, token_id: Uuid) -> Result<()> {
        let subject = vocab::token_iri(token_id);
        let mut ops = self.clear_wait_ops(&subject);
        ops.extend(GraphOp::replace(
            &subject,
            &vocab::inst::status(),
            Literal::from(TokenState::Active.as_str()),
        ));
        self.store.apply(GRAPH_INST, ops).await
    }

    pub async fn consume(&self, token_id: Uuid) -> Result<()> {
        let subject = vocab::token_iri(token_id);
        let mut ops = self.clear_wait_ops(&subject);
        ops.extend(GraphOp::replace(
            &subject,
            &vocab::inst::status(),
            Literal::from(TokenState::Consumed.as_str()),
        ));
        self.store.apply(GRAPH_INST, ops).await
    }

    fn clear_wait_ops(&self, subject: &NamedNode) -> Vec<GraphOp> {
        [
            vocab::inst::wait_kind(),
            vocab::inst::message_name(),
            vocab::inst::signal_name(),
            vocab::inst::correlation_key(),
            vocab::inst::gateway_token(),
            vocab::inst::child_instance(),
            vocab::inst::callback_id(),
            vocab::inst::user_task(),
            vocab::inst::timer_job(),
        ]
        .into_iter()
        .map(|p| GraphOp::remove(Some(subject), Some(&p), None))
        .collect()
    }
}

fn literal_value(term: &Term) -> Option<String> {
    match term {
        Term::Literal(lit) => Some(lit.value().to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_park_resume_consume() {
        let store = Arc::new(GraphStore::open(None).unwrap());
        let tokens = TokenStore::new(store);
        let instance = Uuid::now_v7();

        let token = tokens
            .create(instance, "recv", &[], None, TokenState::Active)
            .await
            .unwrap();

        tokens
            .park(
                token.id,
                &WaitInfo::Message {
                    name: "payment".into(),
                    correlation_key: "order-1".into(),
                    gateway_token: None,
                },
            )
            .await
            .unwrap();

        let parked = tokens.get(token.id).unwrap();
        assert_eq!(parked.state, TokenState::Waiting);
        assert_eq!(
            parked.wait,
            Some(WaitInfo::Message {
                name: "payment".into(),
                correlation_key: "order-1".into(),
                gateway_token: None,
            })
        );

        tokens.resume(token.id).await.unwrap();
        let resumed = tokens.get(token.id).unwrap();
        assert_eq!(resumed.state, TokenState::Active);
        assert!(resumed.wait.is_none());

        tokens.consume(token.id).await.unwrap();
        assert!(tokens.live_tokens(instance).unwrap().is_empty());
    }

    #[tokio::test]
    async fn tokens_sorted_by_creation() {
        let store = Arc::new(GraphStore::open(None).unwrap());
        let tokens = TokenStore::new(store);
        let instance = Uuid::now_v7();
        let first = tokens
            .create(instance, "a", &[], None, TokenState::Active)
            .await
            .unwrap();
        let second = tokens
            .create(instance, "b", &[], None, TokenState::Active)
            .await
            .unwrap();

        let all = tokens.for_instance(instance).unwrap();
        assert_eq!(
            all.iter().map(|t| t.id).collect::<Vec<_>>(),
            vec![first.id, second.id]
        );
    }

    #[tokio::test]
    async fn scope_path_persists() {
        let store = Arc::new(GraphStore::open(None).unwrap());
        let tokens = TokenStore::new(store);
        let path = vec![ScopeEntry {
            node_id: "sub".into(),
            scope_id: Uuid::now_v7(),
        }];
        let token = tokens
            .create(Uuid::now_v7(), "inner", &path, Some(2), TokenState::Active)
            .await
            .unwrap();

        let loaded = tokens.get(token.id).unwrap();
        assert_eq!(loaded.scope_path, path);
        assert_eq!(loaded.loop_index, Some(2));
    }
}
