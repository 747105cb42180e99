//! Event router: message correlation, signal broadcast, boundary events,
//! event-based gateway races, and timer firings.
//!
//! The router mutates tokens but never drives them; it returns the set of
//! instances that now have runnable tokens (plus any message-start
//! instantiations to perform) and the supervisor advances them.

use std::collections::BTreeMap;

use chrono::Utc;
use oxigraph::model::{Literal, Term};
use uuid::Uuid;

use crate::audit::{event, ACTOR_SYSTEM};
use crate::definition::{EventKind, NodeKind, ProcessDefinition};
use crate::engine::{EngineCore, PendingMessage};
use crate::error::{EngineError, Result};
use crate::subprocess::{is_event_subscription, ScopeController};
use crate::timers::parse_timer_definition;
use crate::types::{ScopeEntry, TimerJob, Token, TokenState, VarValue, WaitInfo};
use crate::vocab::{self, GRAPH_INST};

const PENDING_MESSAGE_CAP: usize = 1024;

/// Follow-up work the supervisor owes after a routing call.
#[derive(Debug, Default)]
pub struct RouteEffects {
    /// Instances with tokens made runnable.
    pub advance: Vec<Uuid>,
    /// Message-start instantiations: (definition id, start event id,
    /// initial variables).
    pub starts: Vec<(String, String, BTreeMap<String, VarValue>)>,
}

impl RouteEffects {
    fn advance_instance(&mut self, id: Uuid) {
        if !self.advance.contains(&id) {
            self.advance.push(id);
        }
    }
}

/// What a claimed timer firing amounted to.
#[derive(Debug)]
pub enum FireOutcome {
    /// Job handled; advance the instance if one woke up.
    Fired(Option<Uuid>),
    /// Target was busy; the job goes back unclaimed.
    Skipped,
}

pub struct EventRouter<'a> {
    core: &'a EngineCore,
}

impl<'a> EventRouter<'a> {
    pub fn new(core: &'a EngineCore) -> Self {
        Self { core }
    }

    // ── Messages ──────────────────────────────────────────────

    /// Correlate a message. Resumes at most one subscription per matching
    /// instance (oldest first), falls back to boundary events, then to
    /// message start events, then buffers.
    pub async fn send_message(
        &self,
        name: &str,
        correlation_key: &str,
        variables: BTreeMap<String, VarValue>,
    ) -> Result<RouteEffects> {
        let _routing = self.core.routing.lock().await;
        let mut effects = RouteEffects::default();
        let subscriptions = self.message_subscriptions(name, correlation_key)?;

        if !subscriptions.is_empty() {
            // FIFO per instance: v7 ids sort by creation time.
            let mut by_instance: BTreeMap<Uuid, Vec<Token>> = BTreeMap::new();
            for token in subscriptions {
                by_instance.entry(token.instance_id).or_default().push(token);
            }
            for (instance_id, mut tokens) in by_instance {
                tokens.sort_by_key(|t| t.id);
                let winner = tokens.remove(0);
                self.deliver_to_subscription(&winner, name, &variables)
                    .await?;
                effects.advance_instance(instance_id);
            }
            return Ok(effects);
        }

        // Boundary events on busy activities.
        if self.fire_message_boundaries(name, &variables, &mut effects).await? {
            return Ok(effects);
        }

        // Message start events instantiate the defining process.
        let targets = self.core.defs.message_start_targets(name).await?;
        if !targets.is_empty() {
            for (definition_id, start_event) in targets {
                effects
                    .starts
                    .push((definition_id, start_event, variables.clone()));
            }
            return Ok(effects);
        }

        // Nothing matched: buffer for a future subscription.
        let mut pending = self.core.pending_messages.lock().await;
        if pending.len() >= PENDING_MESSAGE_CAP {
            pending.pop_front();
        }
        pending.push_back(PendingMessage {
            name: name.to_string(),
            correlation_key: correlation_key.to_string(),
            variables,
        });
        tracing::debug!(message = name, key = correlation_key, "message buffered");
        Ok(effects)
    }

    /// Pull a buffered message matching a new subscription, if any.
    pub async fn take_pending(&self, name: &str, correlation_key: &str) -> Option<PendingMessage> {
        let mut pending = self.core.pending_messages.lock().await;
        let position = pending.iter().position(|m| {
            m.name == name
                && (m.correlation_key.is_empty() || m.correlation_key == correlation_key)
        })?;
        pending.remove(position)
    }

    fn message_subscriptions(&self, name: &str, correlation_key: &str) -> Result<Vec<Token>> {
        let subjects = self.core.store.subjects(
            GRAPH_INST,
            &vocab::inst::message_name(),
            &Term::Literal(Literal::from(name)),
        )?;
        let mut out = Vec::new();
        for subject in subjects {
            let Some(id) = vocab::uuid_from_iri(subject.as_str()) else {
                continue;
            };
            let Ok(token) = self.core.tokens.get(id) else {
                continue;
            };
            if token.state != TokenState::Waiting {
                continue;
            }
            let Some(WaitInfo::Message {
                correlation_key: sub_key,
                ..
            }) = &token.wait
            else {
                continue;
            };
            // An empty inbound key is a wildcard; otherwise keys must agree
            // (instance-id keyed subscriptions accept their own id).
            if correlation_key.is_empty()
                || sub_key == correlation_key
                || token.instance_id.to_string() == correlation_key
            {
                out.push(token);
            }
        }
        Ok(out)
    }

    async fn deliver_to_subscription(
        &self,
        token: &Token,
        name: &str,
        variables: &BTreeMap<String, VarValue>,
    ) -> Result<()> {
        let instance_subject = vocab::instance_iri(token.instance_id);
        self.core.vars.set_all(&instance_subject, variables).await?;
        self.core
            .audit
            .emit(
                token.instance_id,
                Some(&token.node_id),
                event::MESSAGE_RECEIVED,
                ACTOR_SYSTEM,
                Some(name),
            )
            .await?;
        self.resume_catch_token(token).await
    }

    // ── Signals ───────────────────────────────────────────────

    /// Broadcast to every signal subscription across all running instances.
    pub async fn broadcast_signal(
        &self,
        name: &str,
        variables: BTreeMap<String, VarValue>,
    ) -> Result<RouteEffects> {
        let _routing = self.core.routing.lock().await;
        let mut effects = RouteEffects::default();
        let subjects = self.core.store.subjects(
            GRAPH_INST,
            &vocab::inst::signal_name(),
            &Term::Literal(Literal::from(name)),
        )?;
        for subject in subjects {
            let Some(id) = vocab::uuid_from_iri(subject.as_str()) else {
                continue;
            };
            let Ok(token) = self.core.tokens.get(id) else {
                continue;
            };
            if token.state != TokenState::Waiting
                || !matches!(&token.wait, Some(WaitInfo::Signal { name: n, .. }) if n == name)
            {
                continue;
            }
            let instance_subject = vocab::instance_iri(token.instance_id);
            self.core.vars.set_all(&instance_subject, &variables).await?;
            self.core
                .audit
                .emit(
                    token.instance_id,
                    Some(&token.node_id),
                    event::SIGNAL_BROADCAST,
                    ACTOR_SYSTEM,
                    Some(name),
                )
                .await?;
            self.resume_catch_token(&token).await?;
            effects.advance_instance(token.instance_id);
        }
        Ok(effects)
    }

    // ── Timers ────────────────────────────────────────────────

    /// Route a claimed, due timer job.
    pub async fn fire_timer(&self, job: &TimerJob) -> Result<FireOutcome> {
        let _routing = self.core.routing.lock().await;
        let token = match self.core.tokens.get(job.token_id) {
            Ok(token) => token,
            Err(_) => {
                tracing::warn!(timer = %job.id, "timer token vanished; dropping job");
                return Ok(FireOutcome::Fired(None));
            }
        };
        let record = self.core.instance(token.instance_id)?;
        if record.status.is_terminal() {
            return Ok(FireOutcome::Fired(None));
        }
        let def = self.core.defs.get(&record.definition_id).await?;

        if job.node_id != token.node_id {
            // Boundary timer: the job targets the boundary node while the
            // token sits on the host activity. An ACTIVE host is mid-step
            // under its instance lock; give the job back for the next poll.
            if token.state == TokenState::Active {
                return Ok(FireOutcome::Skipped);
            }
            self.core
                .audit
                .emit(
                    token.instance_id,
                    Some(&job.node_id),
                    event::TIMER_FIRED,
                    ACTOR_SYSTEM,
                    None,
                )
                .await?;
            self.fire_boundary(&def, &token, &job.node_id, job).await?;
            return Ok(FireOutcome::Fired(Some(token.instance_id)));
        }

        if token.state != TokenState::Waiting {
            tracing::debug!(timer = %job.id, "timer target no longer waiting");
            return Ok(FireOutcome::Fired(None));
        }
        self.core
            .audit
            .emit(
                token.instance_id,
                Some(&job.node_id),
                event::TIMER_FIRED,
                ACTOR_SYSTEM,
                None,
            )
            .await?;
        self.resume_catch_token(&token).await?;
        Ok(FireOutcome::Fired(Some(token.instance_id)))
    }

    // ── Boundary events ───────────────────────────────────────

    async fn fire_message_boundaries(
        &self,
        name: &str,
        variables: &BTreeMap<String, VarValue>,
        effects: &mut RouteEffects,
    ) -> Result<bool> {
        let mut fired = false;
        for record in self.core.list_instances(None, None)? {
            if record.status.is_terminal() {
                continue;
            }
            let def = self.core.defs.get(&record.definition_id).await?;
            for token in self.core.tokens.live_tokens(record.id)? {
                let Some(node) = def.try_node(&token.node_id) else {
                    continue;
                };
                if !node.kind.is_activity() {
                    continue;
                }
                let boundary = def.boundary_events(&node.id).into_iter().find(|b| {
                    b.event == Some(EventKind::Message)
                        && b.message_name.as_deref() == Some(name)
                });
                if let Some(boundary) = boundary {
                    let instance_subject = vocab::instance_iri(token.instance_id);
                    self.core.vars.set_all(&instance_subject, variables).await?;
                    self.fire_boundary_node(&def, &token, boundary.id.as_str()).await?;
                    effects.advance_instance(token.instance_id);
                    fired = true;
                }
            }
        }
        Ok(fired)
    }

    /// Fire a boundary event against its host token; interrupting variants
    /// cancel the host activity first.
    pub async fn fire_boundary(
        &self,
        def: &ProcessDefinition,
        host_token: &Token,
        boundary_id: &str,
        job: &TimerJob,
    ) -> Result<()> {
        self.fire_boundary_node(def, host_token, boundary_id).await?;
        // Bounded timer cycles re-arm after each fire.
        if let Some(remaining) = job.cycle_remaining {
            let boundary = def.node(boundary_id)?;
            if remaining > 1 && !boundary.cancel_activity {
                if let Some(text) = boundary.timer_definition.as_deref() {
                    let schedule = parse_timer_definition(text, Utc::now())?;
                    self.core
                        .timers
                        .schedule(
                            host_token.instance_id,
                            host_token.id,
                            boundary_id,
                            schedule.due_at,
                            Some(remaining - 1),
                        )
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn fire_boundary_node(
        &self,
        def: &ProcessDefinition,
        host_token: &Token,
        boundary_id: &str,
    ) -> Result<()> {
        let boundary = def.node(boundary_id)?;
        self.core
            .audit
            .emit(
                host_token.instance_id,
                Some(boundary_id),
                event::BOUNDARY_FIRED,
                ACTOR_SYSTEM,
                None,
            )
            .await?;
        if boundary.cancel_activity {
            let scopes = ScopeController::new(self.core);
            // An interrupting boundary on a subprocess kills the whole scope.
            if let Some(node) = def.try_node(&host_token.node_id) {
                if matches!(node.kind, NodeKind::EmbeddedSubprocess) {
                    if let Some(entry) = host_token.scope_path.last() {
                        scopes.cancel_scope(host_token.instance_id, entry.scope_id).await?;
                    }
                }
            }
            scopes.retire_token(host_token).await?;
            self.core
                .audit
                .emit(
                    host_token.instance_id,
                    Some(&host_token.node_id),
                    event::CANCEL_ACTIVITY,
                    ACTOR_SYSTEM,
                    None,
                )
                .await?;
        }
        // Drop a fresh token on the boundary node; the executor carries it
        // down the boundary's outgoing flow.
        self.core
            .tokens
            .create(
                host_token.instance_id,
                boundary_id,
                &host_token.scope_path,
                None,
                TokenState::Active,
            )
            .await?;
        Ok(())
    }

    // ── Resume paths ──────────────────────────────────────────

    /// Wake a parked catch token: a gateway arm resolves its race, an event
    /// subprocess trigger opens its scope, a plain catch moves on.
    async fn resume_catch_token(&self, token: &Token) -> Result<()> {
        let record = self.core.instance(token.instance_id)?;
        let def = self.core.defs.get(&record.definition_id).await?;

        let gateway_token = match &token.wait {
            Some(WaitInfo::Message { gateway_token, .. })
            | Some(WaitInfo::Signal { gateway_token, .. })
            | Some(WaitInfo::Timer { gateway_token, .. }) => *gateway_token,
            _ => None,
        };
        if let Some(gateway_id) = gateway_token {
            return self.resolve_gateway_race(&def, token, gateway_id).await;
        }
        if is_event_subscription(&def, token) {
            return self.enter_event_subprocess(&def, token).await;
        }
        // Plain catch: continue on the (single) outgoing flow.
        self.core.tokens.resume(token.id).await?;
        self.advance_past_catch(&def, token).await
    }

    async fn advance_past_catch(&self, def: &ProcessDefinition, token: &Token) -> Result<()> {
        if let Some(flow) = def.outgoing(&token.node_id).first() {
            self.core
                .audit
                .emit(
                    token.instance_id,
                    Some(&flow.id),
                    event::TAKE,
                    ACTOR_SYSTEM,
                    None,
                )
                .await?;
            self.core.tokens.move_to(token.id, &flow.target).await?;
        } else {
            self.core.tokens.consume(token.id).await?;
        }
        Ok(())
    }

    /// First arm to fire wins: cancel the siblings and the gateway token,
    /// then carry the winner forward.
    async fn resolve_gateway_race(
        &self,
        def: &ProcessDefinition,
        winner: &Token,
        gateway_id: Uuid,
    ) -> Result<()> {
        let scopes = ScopeController::new(self.core);
        let gateway = self.core.tokens.get(gateway_id)?;
        for arm in self.gateway_arms(&gateway)? {
            if arm.id != winner.id {
                scopes.retire_token(&arm).await?;
            }
        }
        scopes.retire_token(&gateway).await?;
        self.core.tokens.resume(winner.id).await?;
        self.advance_past_catch(def, winner).await
    }

    /// Arm tokens registered against an event-based gateway token.
    pub fn gateway_arms(&self, gateway: &Token) -> Result<Vec<Token>> {
        let subjects = self.core.store.subjects(
            GRAPH_INST,
            &vocab::inst::gateway_token(),
            &Term::NamedNode(vocab::token_iri(gateway.id)),
        )?;
        let mut out = Vec::new();
        for subject in subjects {
            if let Some(id) = vocab::uuid_from_iri(subject.as_str()) {
                if let Ok(token) = self.core.tokens.get(id) {
                    if token.state != TokenState::Consumed {
                        out.push(token);
                    }
                }
            }
        }
        out.sort_by_key(|t| t.id);
        Ok(out)
    }

    /// Open an event subprocess from its triggered subscription token.
    async fn enter_event_subprocess(&self, def: &ProcessDefinition, token: &Token) -> Result<()> {
        let start = def.node(&token.node_id)?;
        let sub_id = start.parent_scope.clone().ok_or_else(|| {
            EngineError::BadDefinition(format!("event start {} has no scope", start.id))
        })?;
        let interrupting = start.cancel_activity;

        if interrupting {
            let scopes = ScopeController::new(self.core);
            let siblings: Vec<Token> = match token.scope_path.last() {
                Some(entry) => scopes.tokens_in_scope(token.instance_id, entry.scope_id)?,
                None => self.core.tokens.live_tokens(token.instance_id)?,
            };
            for sibling in siblings {
                if sibling.id == token.id {
                    continue;
                }
                scopes.retire_token(&sibling).await?;
            }
        }

        let mut path = token.scope_path.clone();
        path.push(ScopeEntry {
            node_id: sub_id.clone(),
            scope_id: Uuid::now_v7(),
        });
        self.core.tokens.resume(token.id).await?;
        self.core.tokens.set_scope_path(token.id, &path).await?;
        self.core
            .audit
            .emit(
                token.instance_id,
                Some(&sub_id),
                event::SUBPROCESS_ENTER,
                ACTOR_SYSTEM,
                Some(if interrupting {
                    "event subprocess (interrupting)"
                } else {
                    "event subprocess"
                }),
            )
            .await?;
        self.advance_past_catch(def, token).await
    }
}
