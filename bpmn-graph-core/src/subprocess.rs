//! Scope and subprocess control: embedded subprocess entry/exit, event
//! subprocess arming, call activity variable mapping, and multi-instance
//! expansion and completion.

use std::collections::BTreeMap;

use chrono::Utc;
use uuid::Uuid;

use crate::audit::{event, ACTOR_SYSTEM};
use crate::definition::{EventKind, NodeKind, NodeRecord, ProcessDefinition};
use crate::engine::EngineCore;
use crate::error::{EngineError, Result};
use crate::timers::parse_timer_definition;
use crate::types::{ScopeEntry, Token, TokenState, VarValue, WaitInfo};
use crate::vocab;

pub struct ScopeController<'a> {
    pub core: &'a EngineCore,
}

/// What multi-instance completion decided for the finished iteration.
#[derive(Debug)]
pub enum MiOutcome {
    /// All iterations done (or the completion condition fired): continue on
    /// the activity's outgoing flow with this fresh token.
    Advance { continuation: Uuid },
    /// More iterations pending; nothing leaves the activity yet.
    Waiting,
}

impl<'a> ScopeController<'a> {
    pub fn new(core: &'a EngineCore) -> Self {
        Self { core }
    }

    // ── Embedded subprocess ───────────────────────────────────

    /// Push a new scope and drop the token on the subprocess's none start
    /// event. Also arms any event subprocesses declared in the new scope.
    pub async fn enter_subprocess(
        &self,
        def: &ProcessDefinition,
        token: &Token,
        node: &NodeRecord,
    ) -> Result<()> {
        let entry = ScopeEntry {
            node_id: node.id.clone(),
            scope_id: Uuid::now_v7(),
        };
        let inner_start = def
            .children_of(Some(&node.id))
            .into_iter()
            .find(|n| {
                n.kind == NodeKind::StartEvent && n.event.unwrap_or_default() == EventKind::None
            })
            .ok_or_else(|| {
                EngineError::BadDefinition(format!("subprocess {} has no start event", node.id))
            })?;

        let mut path = token.scope_path.clone();
        path.push(entry.clone());
        self.core.tokens.set_scope_path(token.id, &path).await?;
        self.core.tokens.move_to(token.id, &inner_start.id).await?;
        self.core
            .audit
            .emit(
                token.instance_id,
                Some(&node.id),
                event::SUBPROCESS_ENTER,
                ACTOR_SYSTEM,
                None,
            )
            .await?;
        self.arm_event_subprocesses(def, token.instance_id, &path, Some(&node.id))
            .await
    }

    /// Tear down a completed scope. Returns whether the scope is really
    /// finished (no other live tokens inside it).
    pub async fn try_exit_subprocess(
        &self,
        def: &ProcessDefinition,
        token: &Token,
    ) -> Result<Option<ScopeEntry>> {
        let Some(entry) = token.scope_path.last().cloned() else {
            return Ok(None);
        };
        let live = self.tokens_in_scope(token.instance_id, entry.scope_id)?;
        let others: Vec<_> = live.iter().filter(|t| t.id != token.id).collect();
        // Event-subprocess subscriptions do not hold the scope open.
        let blocking = others
            .iter()
            .any(|t| !is_event_subscription(def, t));
        if blocking {
            return Ok(None);
        }
        for other in others {
            self.retire_token(other).await?;
        }
        self.cleanup_scope(def, token.instance_id, &entry).await?;
        Ok(Some(entry))
    }

    /// Cancel every live token inside a scope (interrupting boundary /
    /// terminate / error escalation).
    pub async fn cancel_scope(&self, instance_id: Uuid, scope_id: Uuid) -> Result<usize> {
        let live = self.tokens_in_scope(instance_id, scope_id)?;
        let cancelled = live.len();
        for token in &live {
            self.retire_token(token).await?;
        }
        Ok(cancelled)
    }

    /// Consume a token and release whatever it holds: timer jobs and the
    /// user task work item, if any.
    pub async fn retire_token(&self, token: &Token) -> Result<()> {
        self.core.timers.cancel_for_token(token.id).await?;
        if let Some(WaitInfo::UserTask { task_id }) = &token.wait {
            // The work item dies with the token.
            let subject = vocab::task_iri(*task_id);
            self.core
                .store
                .remove_pattern(crate::vocab::GRAPH_TASKS, Some(&subject), None, None)
                .await?;
        }
        self.core.tokens.consume(token.id).await
    }

    async fn cleanup_scope(
        &self,
        def: &ProcessDefinition,
        instance_id: Uuid,
        entry: &ScopeEntry,
    ) -> Result<()> {
        let scope_subject = vocab::scope_iri(entry.scope_id);
        let declares_own_scope = def
            .try_node(&entry.node_id)
            .map(|n| n.variable_scope)
            .unwrap_or(false);
        if declares_own_scope {
            self.core.vars.clear(&scope_subject).await?;
        } else {
            // Locals drain into the parent scope on exit.
            let locals = self.core.vars.all_at(&scope_subject)?;
            if !locals.is_empty() {
                let parent = vocab::instance_iri(instance_id);
                self.core.vars.set_all(&parent, &locals).await?;
                self.core.vars.clear(&scope_subject).await?;
            }
        }
        Ok(())
    }

    pub fn tokens_in_scope(&self, instance_id: Uuid, scope_id: Uuid) -> Result<Vec<Token>> {
        Ok(self
            .core
            .tokens
            .live_tokens(instance_id)?
            .into_iter()
            .filter(|t| t.scope_path.iter().any(|e| e.scope_id == scope_id))
            .collect())
    }

    // ── Event subprocesses ────────────────────────────────────

    /// Create subscription tokens for each event subprocess of a scope:
    /// a parked token on the event start, resumed by the router or timers.
    pub async fn arm_event_subprocesses(
        &self,
        def: &ProcessDefinition,
        instance_id: Uuid,
        scope_path: &[ScopeEntry],
        scope: Option<&str>,
    ) -> Result<()> {
        for sub in def.event_subprocesses(scope) {
            let start = def
                .children_of(Some(&sub.id))
                .into_iter()
                .find(|n| n.kind == NodeKind::StartEvent)
                .ok_or_else(|| {
                    EngineError::BadDefinition(format!(
                        "event subprocess {} has no start event",
                        sub.id
                    ))
                })?;
            match start.event.unwrap_or_default() {
                EventKind::Message => {
                    let name = start.message_name.clone().unwrap_or_default();
                    let token = self
                        .core
                        .tokens
                        .create(instance_id, &start.id, scope_path, None, TokenState::Active)
                        .await?;
                    self.core
                        .tokens
                        .park(
                            token.id,
                            &WaitInfo::Message {
                                name,
                                correlation_key: instance_id.to_string(),
                                gateway_token: None,
                            },
                        )
                        .await?;
                }
                EventKind::Timer => {
                    let definition = start.timer_definition.as_deref().ok_or_else(|| {
                        EngineError::BadDefinition(format!(
                            "timer start {} has no timer definition",
                            start.id
                        ))
                    })?;
                    let schedule = parse_timer_definition(definition, Utc::now())?;
                    let token = self
                        .core
                        .tokens
                        .create(instance_id, &start.id, scope_path, None, TokenState::Active)
                        .await?;
                    let job = self
                        .core
                        .timers
                        .schedule(instance_id, token.id, &start.id, schedule.due_at, None)
                        .await?;
                    self.core
                        .tokens
                        .park(
                            token.id,
                            &WaitInfo::Timer {
                                timer_id: job.id,
                                gateway_token: None,
                            },
                        )
                        .await?;
                    self.core
                        .audit
                        .emit(
                            instance_id,
                            Some(&start.id),
                            event::TIMER_SCHEDULED,
                            ACTOR_SYSTEM,
                            Some(definition),
                        )
                        .await?;
                }
                other => {
                    self.core
                        .audit
                        .emit(
                            instance_id,
                            Some(&start.id),
                            event::UNSUPPORTED,
                            ACTOR_SYSTEM,
                            Some(&format!("event subprocess start kind {}", other.as_str())),
                        )
                        .await?;
                    return Err(EngineError::Unsupported {
                        node: start.id.clone(),
                        feature: format!("event subprocess {} start", other.as_str()),
                    });
                }
            }
        }
        Ok(())
    }

    // ── Call activity variable mapping ────────────────────────

    /// Variables copied into a child instance at call time.
    pub fn call_inputs(
        &self,
        node: &NodeRecord,
        parent_chain: &[oxigraph::model::NamedNode],
    ) -> Result<BTreeMap<String, VarValue>> {
        let merged = self.core.vars.collect(parent_chain)?;
        Ok(match &node.in_variables {
            Some(names) => names
                .iter()
                .filter_map(|n| merged.get(n).map(|v| (n.clone(), v.clone())))
                .collect(),
            None => merged,
        })
    }

    /// Copy mapped outputs from a completed child back to the parent.
    pub async fn apply_call_outputs(
        &self,
        node: &NodeRecord,
        parent_instance: Uuid,
        child_instance: Uuid,
    ) -> Result<()> {
        let child_subject = vocab::instance_iri(child_instance);
        let child_vars = self.core.vars.all_at(&child_subject)?;
        let parent_subject = vocab::instance_iri(parent_instance);
        let selected: BTreeMap<String, VarValue> = match &node.out_variables {
            Some(names) => names
                .iter()
                .filter_map(|n| child_vars.get(n).map(|v| (n.clone(), v.clone())))
                .collect(),
            None => child_vars,
        };
        self.core.vars.set_all(&parent_subject, &selected).await
    }

    // ── Multi-instance ────────────────────────────────────────

    /// Expand an activity with loop characteristics into iteration tokens.
    /// Consumes the incoming token; returns the spawned sibling ids.
    pub async fn expand_multi_instance(
        &self,
        token: &Token,
        node: &NodeRecord,
    ) -> Result<Vec<Uuid>> {
        let loop_char = node.loop_characteristics.as_ref().ok_or_else(|| {
            EngineError::BadDefinition(format!("{} has no loop characteristics", node.id))
        })?;
        let cardinality = self.cardinality(token, &loop_char.cardinality)?;
        if cardinality == 0 {
            return Err(EngineError::BadDefinition(format!(
                "{} loop cardinality resolved to 0",
                node.id
            )));
        }

        let mi_entry = ScopeEntry {
            node_id: node.id.clone(),
            scope_id: Uuid::now_v7(),
        };
        let mut path = token.scope_path.clone();
        path.push(mi_entry.clone());
        let scope_subject = vocab::scope_iri(mi_entry.scope_id);

        let spawn = if loop_char.sequential { 1 } else { cardinality };
        self.core
            .vars
            .set_all(
                &scope_subject,
                &BTreeMap::from([
                    (
                        crate::types::VAR_NR_OF_INSTANCES.to_string(),
                        VarValue::Integer(cardinality as i64),
                    ),
                    (
                        crate::types::VAR_NR_OF_ACTIVE.to_string(),
                        VarValue::Integer(spawn as i64),
                    ),
                    (
                        crate::types::VAR_NR_OF_COMPLETED.to_string(),
                        VarValue::Integer(0),
                    ),
                ]),
            )
            .await?;

        let mut siblings = Vec::new();
        for index in 1..=spawn {
            siblings.push(self.spawn_iteration(token.instance_id, node, &path, index).await?);
        }
        self.core.tokens.consume(token.id).await?;
        self.core
            .audit
            .emit(
                token.instance_id,
                Some(&node.id),
                event::MI_STARTED,
                ACTOR_SYSTEM,
                Some(&format!(
                    "cardinality={cardinality} mode={}",
                    if loop_char.sequential { "sequential" } else { "parallel" }
                )),
            )
            .await?;
        Ok(siblings)
    }

    async fn spawn_iteration(
        &self,
        instance_id: Uuid,
        node: &NodeRecord,
        path: &[ScopeEntry],
        index: u32,
    ) -> Result<Uuid> {
        let token = self
            .core
            .tokens
            .create(instance_id, &node.id, path, Some(index), TokenState::Active)
            .await?;
        let token_subject = vocab::token_iri(token.id);
        self.core
            .vars
            .set(
                &token_subject,
                crate::types::VAR_LOOP_COUNTER,
                &VarValue::Integer(index as i64),
            )
            .await?;
        Ok(token.id)
    }

    /// Called when one iteration has finished its activity work. Decides
    /// whether to spawn the next sequential iteration, keep waiting, or
    /// advance past the activity.
    pub async fn complete_iteration(
        &self,
        token: &Token,
        node: &NodeRecord,
    ) -> Result<MiOutcome> {
        let loop_char = node.loop_characteristics.as_ref().ok_or_else(|| {
            EngineError::BadDefinition(format!("{} has no loop characteristics", node.id))
        })?;
        let mi_entry = token
            .scope_path
            .iter()
            .rev()
            .find(|e| e.node_id == node.id)
            .cloned()
            .ok_or_else(|| {
                EngineError::Store(format!("iteration token {} lost its loop scope", token.id))
            })?;
        let scope_subject = vocab::scope_iri(mi_entry.scope_id);

        let read_counter = |name: &str| -> Result<i64> {
            Ok(
                match self.core.vars.get(&[scope_subject.clone()], name)? {
                    Some(VarValue::Integer(n)) => n,
                    _ => 0,
                },
            )
        };
        let total = read_counter(crate::types::VAR_NR_OF_INSTANCES)?;
        let completed = read_counter(crate::types::VAR_NR_OF_COMPLETED)? + 1;
        let active = (read_counter(crate::types::VAR_NR_OF_ACTIVE)? - 1).max(0);
        self.core
            .vars
            .set(
                &scope_subject,
                crate::types::VAR_NR_OF_COMPLETED,
                &VarValue::Integer(completed),
            )
            .await?;
        self.core
            .vars
            .set(
                &scope_subject,
                crate::types::VAR_NR_OF_ACTIVE,
                &VarValue::Integer(active),
            )
            .await?;
        self.core.tokens.consume(token.id).await?;

        let chain = {
            let mut chain = vec![vocab::token_iri(token.id), scope_subject.clone()];
            for entry in token.scope_path.iter().rev().skip(1) {
                chain.push(vocab::scope_iri(entry.scope_id));
            }
            chain.push(vocab::instance_iri(token.instance_id));
            chain
        };
        let instance_subject = vocab::instance_iri(token.instance_id);
        let condition_met = match &loop_char.completion_condition {
            Some(expr) => self
                .core
                .expr
                .evaluate(&instance_subject, &chain, Some(expr))?,
            None => false,
        };

        if condition_met || completed >= total {
            // Cancel whatever iterations are still running.
            let stragglers = self.tokens_in_scope(token.instance_id, mi_entry.scope_id)?;
            for straggler in &stragglers {
                self.retire_token(straggler).await?;
            }
            self.core.vars.clear(&scope_subject).await?;
            self.core
                .audit
                .emit(
                    token.instance_id,
                    Some(&node.id),
                    event::MI_COMPLETED,
                    ACTOR_SYSTEM,
                    Some(&format!("completed={completed} of {total}")),
                )
                .await?;
            let continuation = self
                .core
                .tokens
                .create(
                    token.instance_id,
                    &node.id,
                    &token.scope_path[..token.scope_path.len() - 1],
                    None,
                    TokenState::Active,
                )
                .await?;
            return Ok(MiOutcome::Advance {
                continuation: continuation.id,
            });
        }

        if loop_char.sequential {
            let next_index = token.loop_index.unwrap_or(0) + 1;
            if i64::from(next_index) <= total {
                self.core
                    .vars
                    .set(
                        &scope_subject,
                        crate::types::VAR_NR_OF_ACTIVE,
                        &VarValue::Integer(1),
                    )
                    .await?;
                self.spawn_iteration(token.instance_id, node, &token.scope_path, next_index)
                    .await?;
            }
        }
        Ok(MiOutcome::Waiting)
    }

    /// Resolve a cardinality expression: an integer literal or `${var}`.
    fn cardinality(&self, token: &Token, expression: &str) -> Result<u32> {
        let trimmed = expression.trim();
        if let Ok(n) = trimmed.parse::<u32>() {
            return Ok(n);
        }
        let name = trimmed
            .strip_prefix("${")
            .and_then(|s| s.strip_suffix('}'))
            .map(str::trim)
            .ok_or_else(|| {
                EngineError::BadDefinition(format!("invalid loop cardinality {expression}"))
            })?;
        let chain = self.core.scope_chain(token);
        match self.core.vars.get(&chain, name)? {
            Some(VarValue::Integer(n)) if n >= 0 => Ok(n as u32),
            Some(VarValue::Decimal(d)) if d >= 0.0 => Ok(d as u32),
            other => Err(EngineError::BadDefinition(format!(
                "loop cardinality {name} resolved to {other:?}"
            ))),
        }
    }
}

/// A parked token standing in for an event subprocess trigger, created by
/// [`ScopeController::arm_event_subprocesses`].
pub fn is_event_subscription(def: &ProcessDefinition, token: &Token) -> bool {
    token.state == TokenState::Waiting
        && def
            .try_node(&token.node_id)
            .and_then(|n| n.parent_scope.as_deref())
            .and_then(|scope| def.try_node(scope))
            .map(|scope_node| scope_node.kind == NodeKind::EventSubprocess)
            .unwrap_or(false)
}
