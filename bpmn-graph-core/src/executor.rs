//! The token executor: one state-machine step per call.
//!
//! Each step consumes one ACTIVE token and either advances it, parks it,
//! replaces it with descendants, or consumes it. The executor never loops
//! over the definition graph recursively and never drives other instances;
//! cross-instance work is handed back to the supervisor as effects.

use std::collections::BTreeMap;

use chrono::Utc;
use uuid::Uuid;

use crate::audit::{event, ACTOR_SYSTEM};
use crate::definition::{
    EventKind, ListenerRecord, NodeKind, NodeRecord, ProcessDefinition,
};
use crate::engine::EngineCore;
use crate::error::{EngineError, Result};
use crate::router::{EventRouter, RouteEffects};
use crate::subprocess::{is_event_subscription, MiOutcome, ScopeController};
use crate::timers::parse_timer_definition;
use crate::topics::{HandlerOutcome, ProcessContext};
use crate::types::{InstanceStatus, Token, TokenState, VarValue, WaitInfo};
use crate::vocab;

/// A call activity wants a child instance; the supervisor creates and runs
/// it (the child id is pre-allocated so the parent token can park on it).
#[derive(Debug)]
pub struct CallRequest {
    pub child_id: Uuid,
    pub definition_id: String,
    pub variables: BTreeMap<String, VarValue>,
    pub parent_token: Uuid,
    pub call_node: String,
}

/// What a single step produced beyond graph mutations.
#[derive(Default)]
pub struct StepOutcome {
    /// Set when the step decided the instance's terminal status.
    pub terminal: Option<InstanceStatus>,
    pub call: Option<CallRequest>,
    /// Cross-instance effects (message dispatch reached other instances).
    pub route: RouteEffects,
}

pub struct TokenExecutor<'a> {
    core: &'a EngineCore,
}

impl<'a> TokenExecutor<'a> {
    pub fn new(core: &'a EngineCore) -> Self {
        Self { core }
    }

    fn scopes(&self) -> ScopeController<'a> {
        ScopeController::new(self.core)
    }

    fn router(&self) -> EventRouter<'a> {
        EventRouter::new(self.core)
    }

    /// Advance one ACTIVE token by one step.
    pub async fn step(&self, def: &ProcessDefinition, token: &Token) -> Result<StepOutcome> {
        let node = match def.try_node(&token.node_id) {
            Some(node) => node.clone(),
            None => {
                return self
                    .fail_instance(token, "DANGLING_TOKEN", "token references unknown node")
                    .await;
            }
        };
        tracing::trace!(
            instance = %token.instance_id,
            token = %token.id,
            node = %node.id,
            kind = node.kind.as_str(),
            "step"
        );

        // Multi-instance expansion happens before the activity itself runs.
        if node.kind.is_activity()
            && node.loop_characteristics.is_some()
            && token.loop_index.is_none()
        {
            self.scopes().expand_multi_instance(token, &node).await?;
            return Ok(StepOutcome::default());
        }

        // Arm boundary timers before the activity gets a chance to run; an
        // already-due interrupting timer wins over the activity body.
        if node.kind.is_activity() {
            if self.arm_boundary_timers(def, token, &node).await? {
                return Ok(StepOutcome::default());
            }
        }

        match node.kind {
            NodeKind::StartEvent => {
                self.take_flows(def, token).await?;
                Ok(StepOutcome::default())
            }
            NodeKind::BoundaryEvent => {
                self.take_flows(def, token).await?;
                Ok(StepOutcome::default())
            }
            NodeKind::ServiceTask => self.run_service_task(def, token, &node).await,
            NodeKind::SendTask => self.run_send_task(def, token, &node).await,
            NodeKind::ManualTask => {
                self.run_listeners(def, token, &node.execution_listeners, "start").await?;
                self.core
                    .audit
                    .emit(
                        token.instance_id,
                        Some(&node.id),
                        event::MANUAL_COMPLETE,
                        ACTOR_SYSTEM,
                        None,
                    )
                    .await?;
                self.activity_completed(def, token, &node).await
            }
            NodeKind::ScriptTask => self.run_script_task(def, token, &node).await,
            NodeKind::UserTask => self.run_user_task(def, token, &node).await,
            NodeKind::ReceiveTask => self.run_message_catch(def, token, &node).await,
            NodeKind::IntermediateThrowEvent => self.run_throw_event(def, token, &node).await,
            NodeKind::IntermediateCatchEvent => self.run_catch_event(def, token, &node).await,
            NodeKind::ExclusiveGateway => self.run_exclusive_gateway(def, token, &node).await,
            NodeKind::InclusiveGateway => self.run_inclusive_gateway(def, token, &node).await,
            NodeKind::ParallelGateway => self.run_parallel_gateway(def, token, &node).await,
            NodeKind::EventBasedGateway => self.run_event_gateway(def, token, &node).await,
            NodeKind::EmbeddedSubprocess => {
                self.run_listeners(def, token, &node.execution_listeners, "start").await?;
                self.scopes().enter_subprocess(def, token, &node).await?;
                Ok(StepOutcome::default())
            }
            NodeKind::EventSubprocess => {
                self.fail_instance(
                    token,
                    "BAD_DEFINITION",
                    "event subprocess entered by sequence flow",
                )
                .await
            }
            NodeKind::CallActivity => self.run_call_activity(def, token, &node).await,
            NodeKind::EndEvent => self.run_end_event(def, token, &node).await,
        }
    }

    // ── Activities ────────────────────────────────────────────

    async fn run_service_task(
        &self,
        def: &ProcessDefinition,
        token: &Token,
        node: &NodeRecord,
    ) -> Result<StepOutcome> {
        if let Err(err) = self
            .run_listeners(def, token, &node.execution_listeners, "start")
            .await
        {
            return self.escalate_failure(def, token, err).await;
        }
        if let Some(topic) = &node.topic {
            let ctx = self.handler_context(token, node, topic)?;
            match self.core.topics.execute(&ctx).await {
                Ok(HandlerOutcome::Completed(writes)) => {
                    self.apply_writes(token, &writes).await?;
                }
                Ok(HandlerOutcome::AsyncStarted { callback_id }) => {
                    self.core
                        .tokens
                        .park(token.id, &WaitInfo::Callback { callback_id })
                        .await?;
                    return Ok(StepOutcome::default());
                }
                Err(err) => return self.escalate_failure(def, token, err).await,
            }
        }
        self.core
            .audit
            .emit(
                token.instance_id,
                Some(&node.id),
                event::COMPLETE,
                ACTOR_SYSTEM,
                None,
            )
            .await?;
        self.activity_completed(def, token, node).await
    }

    /// A send task runs its topic handler when one is configured, otherwise
    /// it dispatches its message by name.
    async fn run_send_task(
        &self,
        def: &ProcessDefinition,
        token: &Token,
        node: &NodeRecord,
    ) -> Result<StepOutcome> {
        if node.topic.is_some() {
            return self.run_service_task(def, token, node).await;
        }
        let mut outcome = StepOutcome::default();
        if let Some(name) = &node.message_name {
            let key = self.correlation_key(token)?;
            outcome.route = self.router().send_message(name, &key, BTreeMap::new()).await?;
            self.core
                .audit
                .emit(
                    token.instance_id,
                    Some(&node.id),
                    event::MESSAGE_SENT,
                    ACTOR_SYSTEM,
                    Some(name),
                )
                .await?;
        }
        let completion = self.activity_completed(def, token, node).await?;
        outcome.terminal = completion.terminal;
        outcome.call = completion.call;
        outcome.route.advance.extend(completion.route.advance);
        outcome.route.starts.extend(completion.route.starts);
        Ok(outcome)
    }

    async fn run_script_task(
        &self,
        def: &ProcessDefinition,
        token: &Token,
        node: &NodeRecord,
    ) -> Result<StepOutcome> {
        if !self.core.config.script_tasks_enabled {
            self.core
                .audit
                .emit(
                    token.instance_id,
                    Some(&node.id),
                    event::SCRIPT_SKIPPED,
                    ACTOR_SYSTEM,
                    Some("script execution disabled"),
                )
                .await?;
            return self.activity_completed(def, token, node).await;
        }
        let engine = self.core.script.read().await.clone();
        let Some(engine) = engine else {
            return self
                .fail_instance(token, "SCRIPT_ERROR", "no script engine registered")
                .await;
        };
        let Some(script) = node.script.clone() else {
            return self.activity_completed(def, token, node).await;
        };
        let chain = self.core.scope_chain(token);
        let variables = self.core.vars.collect(&chain)?;
        match engine.evaluate(&script, variables).await {
            Ok(writes) => {
                self.apply_writes(token, &writes).await?;
                self.core
                    .audit
                    .emit(
                        token.instance_id,
                        Some(&node.id),
                        event::COMPLETE,
                        ACTOR_SYSTEM,
                        None,
                    )
                    .await?;
                self.activity_completed(def, token, node).await
            }
            Err(err) => {
                self.fail_instance(token, "SCRIPT_ERROR", &err.to_string())
                    .await
            }
        }
    }

    async fn run_user_task(
        &self,
        def: &ProcessDefinition,
        token: &Token,
        node: &NodeRecord,
    ) -> Result<StepOutcome> {
        if let Err(err) = self
            .run_listeners(def, token, &node.execution_listeners, "start")
            .await
        {
            return self.escalate_failure(def, token, err).await;
        }
        let task = self.core.tasks.create(token.instance_id, &node.id).await?;
        self.core
            .tokens
            .park(token.id, &WaitInfo::UserTask { task_id: task.id })
            .await?;
        self.core
            .audit
            .emit(
                token.instance_id,
                Some(&node.id),
                event::CREATE_TASK,
                ACTOR_SYSTEM,
                Some(&task.id.to_string()),
            )
            .await?;
        self.run_listeners(def, token, &node.task_listeners, "create").await?;
        Ok(StepOutcome::default())
    }

    /// Receive tasks and message catch events share subscription semantics.
    async fn run_message_catch(
        &self,
        def: &ProcessDefinition,
        token: &Token,
        node: &NodeRecord,
    ) -> Result<StepOutcome> {
        let name = node.message_name.clone().unwrap_or_default();
        let key = self.correlation_key(token)?;
        // A buffered message may already satisfy this subscription.
        if let Some(pending) = self.router().take_pending(&name, &key).await {
            let instance_subject = vocab::instance_iri(token.instance_id);
            self.core.vars.set_all(&instance_subject, &pending.variables).await?;
            self.core
                .audit
                .emit(
                    token.instance_id,
                    Some(&node.id),
                    event::MESSAGE_RECEIVED,
                    ACTOR_SYSTEM,
                    Some(&name),
                )
                .await?;
            return self.activity_completed(def, token, node).await;
        }
        self.core
            .tokens
            .park(
                token.id,
                &WaitInfo::Message {
                    name,
                    correlation_key: key,
                    gateway_token: None,
                },
            )
            .await?;
        Ok(StepOutcome::default())
    }

    // ── Intermediate events ───────────────────────────────────

    async fn run_throw_event(
        &self,
        def: &ProcessDefinition,
        token: &Token,
        node: &NodeRecord,
    ) -> Result<StepOutcome> {
        let mut outcome = StepOutcome::default();
        match node.event.unwrap_or_default() {
            EventKind::Message => {
                if let Some(name) = &node.message_name {
                    let key = self.correlation_key(token)?;
                    outcome.route =
                        self.router().send_message(name, &key, BTreeMap::new()).await?;
                    self.core
                        .audit
                        .emit(
                            token.instance_id,
                            Some(&node.id),
                            event::MESSAGE_SENT,
                            ACTOR_SYSTEM,
                            Some(name),
                        )
                        .await?;
                }
            }
            EventKind::Signal => {
                if let Some(name) = &node.signal_name {
                    outcome.route = self.router().broadcast_signal(name, BTreeMap::new()).await?;
                    self.core
                        .audit
                        .emit(
                            token.instance_id,
                            Some(&node.id),
                            event::SIGNAL_BROADCAST,
                            ACTOR_SYSTEM,
                            Some(name),
                        )
                        .await?;
                }
            }
            EventKind::Compensation => {
                self.trigger_compensation(token).await?;
            }
            EventKind::None => {}
            other => {
                return self
                    .fail_instance(
                        token,
                        "UNSUPPORTED",
                        &format!("throw event kind {}", other.as_str()),
                    )
                    .await;
            }
        }
        self.take_flows(def, token).await?;
        Ok(outcome)
    }

    async fn run_catch_event(
        &self,
        def: &ProcessDefinition,
        token: &Token,
        node: &NodeRecord,
    ) -> Result<StepOutcome> {
        match node.event.unwrap_or_default() {
            EventKind::Message => self.run_message_catch(def, token, node).await,
            EventKind::Timer => {
                let text = node.timer_definition.as_deref().ok_or_else(|| {
                    EngineError::BadDefinition(format!("{} has no timer definition", node.id))
                })?;
                let schedule = parse_timer_definition(text, Utc::now())?;
                let job = self
                    .core
                    .timers
                    .schedule(token.instance_id, token.id, &node.id, schedule.due_at, None)
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
                        token.instance_id,
                        Some(&node.id),
                        event::TIMER_SCHEDULED,
                        ACTOR_SYSTEM,
                        Some(text),
                    )
                    .await?;
                Ok(StepOutcome::default())
            }
            EventKind::Signal => {
                let name = node.signal_name.clone().unwrap_or_default();
                self.core
                    .tokens
                    .park(
                        token.id,
                        &WaitInfo::Signal {
                            name,
                            gateway_token: None,
                        },
                    )
                    .await?;
                Ok(StepOutcome::default())
            }
            other => {
                self.fail_instance(
                    token,
                    "UNSUPPORTED",
                    &format!("catch event kind {}", other.as_str()),
                )
                .await
            }
        }
    }

    // ── Gateways ──────────────────────────────────────────────

    async fn run_exclusive_gateway(
        &self,
        def: &ProcessDefinition,
        token: &Token,
        node: &NodeRecord,
    ) -> Result<StepOutcome> {
        let chain = self.core.scope_chain(token);
        let instance_subject = vocab::instance_iri(token.instance_id);
        let flows = def.outgoing(&node.id);
        let default = def.default_flow(&node.id).map(|f| f.id.clone());

        for flow in &flows {
            if Some(&flow.id) == default.as_ref() {
                continue;
            }
            if self
                .core
                .expr
                .evaluate(&instance_subject, &chain, flow.condition.as_deref())?
            {
                self.take_one_flow(def, token, flow.id.as_str()).await?;
                return Ok(StepOutcome::default());
            }
        }
        if let Some(default_id) = default {
            self.take_one_flow(def, token, &default_id).await?;
            return Ok(StepOutcome::default());
        }
        self.core
            .audit
            .emit(
                token.instance_id,
                Some(&node.id),
                event::DEAD_END,
                ACTOR_SYSTEM,
                Some("no outgoing flow matched"),
            )
            .await?;
        self.fail_instance(token, "DEAD_END", "exclusive gateway found no path")
            .await
    }

    async fn run_inclusive_gateway(
        &self,
        def: &ProcessDefinition,
        token: &Token,
        node: &NodeRecord,
    ) -> Result<StepOutcome> {
        if def.incoming(&node.id).len() > 1 {
            // Join phase: park and merge when nothing live can still arrive.
            self.core.tokens.park(token.id, &WaitInfo::Join).await?;
            if !self.inclusive_join_ready(def, token, node)? {
                return Ok(StepOutcome::default());
            }
            let merged = self.merge_join_tokens(token, node).await?;
            return self.inclusive_split(def, &merged, node).await;
        }
        self.inclusive_split(def, token, node).await
    }

    async fn inclusive_split(
        &self,
        def: &ProcessDefinition,
        token: &Token,
        node: &NodeRecord,
    ) -> Result<StepOutcome> {
        let chain = self.core.scope_chain(token);
        let instance_subject = vocab::instance_iri(token.instance_id);
        let default = def.default_flow(&node.id).map(|f| f.id.clone());
        let mut taken = Vec::new();
        for flow in def.outgoing(&node.id) {
            if Some(&flow.id) == default.as_ref() {
                continue;
            }
            if self
                .core
                .expr
                .evaluate(&instance_subject, &chain, flow.condition.as_deref())?
            {
                taken.push(flow.id.clone());
            }
        }
        if taken.is_empty() {
            if let Some(default_id) = default {
                taken.push(default_id);
            }
        }
        if taken.is_empty() {
            self.core
                .audit
                .emit(
                    token.instance_id,
                    Some(&node.id),
                    event::DEAD_END,
                    ACTOR_SYSTEM,
                    Some("no inclusive branch matched"),
                )
                .await?;
            return self
                .fail_instance(token, "DEAD_END", "inclusive gateway found no path")
                .await;
        }
        for (i, flow_id) in taken.iter().enumerate() {
            if i == 0 {
                self.take_one_flow(def, token, flow_id).await?;
            } else {
                let flow = def
                    .outgoing(&node.id)
                    .into_iter()
                    .find(|f| &f.id == flow_id)
                    .expect("taken flow exists");
                self.emit_take(def, token, &flow.id).await?;
                self.core
                    .tokens
                    .create(
                        token.instance_id,
                        &flow.target,
                        &token.scope_path,
                        None,
                        TokenState::Active,
                    )
                    .await?;
            }
        }
        Ok(StepOutcome::default())
    }

    /// Release check: no other live token of the same scope can still reach
    /// this gateway through forward flows.
    fn inclusive_join_ready(
        &self,
        def: &ProcessDefinition,
        token: &Token,
        node: &NodeRecord,
    ) -> Result<bool> {
        let live = self.core.tokens.live_tokens(token.instance_id)?;
        for other in &live {
            if other.scope_path != token.scope_path {
                continue;
            }
            if other.node_id == node.id {
                continue;
            }
            if is_event_subscription(def, other) {
                continue;
            }
            if def.can_reach(&other.node_id, &node.id) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn run_parallel_gateway(
        &self,
        def: &ProcessDefinition,
        token: &Token,
        node: &NodeRecord,
    ) -> Result<StepOutcome> {
        let incoming = def.incoming(&node.id).len();
        let token = if incoming > 1 {
            self.core.tokens.park(token.id, &WaitInfo::Join).await?;
            let arrived = self.tokens_at_join(token, node)?;
            if arrived.len() < incoming {
                return Ok(StepOutcome::default());
            }
            self.merge_join_tokens(token, node).await?
        } else {
            token.clone()
        };
        self.parallel_split(def, &token, node).await
    }

    /// One descendant per outgoing flow; the first reuses the token.
    async fn parallel_split(
        &self,
        def: &ProcessDefinition,
        token: &Token,
        node: &NodeRecord,
    ) -> Result<StepOutcome> {
        let flows = def.outgoing(&node.id);
        for (i, flow) in flows.iter().enumerate() {
            if i == 0 {
                self.take_one_flow(def, token, &flow.id).await?;
            } else {
                self.emit_take(def, token, &flow.id).await?;
                self.core
                    .tokens
                    .create(
                        token.instance_id,
                        &flow.target,
                        &token.scope_path,
                        None,
                        TokenState::Active,
                    )
                    .await?;
            }
        }
        Ok(StepOutcome::default())
    }

    fn tokens_at_join(&self, token: &Token, node: &NodeRecord) -> Result<Vec<Token>> {
        Ok(self
            .core
            .tokens
            .live_tokens(token.instance_id)?
            .into_iter()
            .filter(|t| t.node_id == node.id && t.scope_path == token.scope_path)
            .collect())
    }

    /// Consume every token parked at the gateway and mint the single merged
    /// successor.
    async fn merge_join_tokens(&self, token: &Token, node: &NodeRecord) -> Result<Token> {
        for arrived in self.tokens_at_join(token, node)? {
            self.core.tokens.consume(arrived.id).await?;
        }
        self.core
            .tokens
            .create(
                token.instance_id,
                &node.id,
                &token.scope_path,
                None,
                TokenState::Active,
            )
            .await
    }

    /// Re-check parked joins after other branches died; returns true when a
    /// join released (the supervisor loops again).
    pub async fn try_release_joins(
        &self,
        def: &ProcessDefinition,
        instance_id: Uuid,
    ) -> Result<bool> {
        let live = self.core.tokens.live_tokens(instance_id)?;
        for token in live {
            if token.state != TokenState::Waiting || token.wait != Some(WaitInfo::Join) {
                continue;
            }
            let Some(node) = def.try_node(&token.node_id) else {
                continue;
            };
            match node.kind {
                NodeKind::InclusiveGateway => {
                    if self.inclusive_join_ready(def, &token, node)? {
                        let merged = self.merge_join_tokens(&token, node).await?;
                        self.inclusive_split(def, &merged, node).await?;
                        return Ok(true);
                    }
                }
                NodeKind::ParallelGateway => {
                    let incoming = def.incoming(&node.id).len();
                    if self.tokens_at_join(&token, node)?.len() >= incoming {
                        let merged = self.merge_join_tokens(&token, node).await?;
                        self.parallel_split(def, &merged, node).await?;
                        return Ok(true);
                    }
                }
                _ => {}
            }
        }
        Ok(false)
    }

    async fn run_event_gateway(
        &self,
        def: &ProcessDefinition,
        token: &Token,
        node: &NodeRecord,
    ) -> Result<StepOutcome> {
        self.core.tokens.park(token.id, &WaitInfo::Gateway).await?;
        for flow in def.outgoing(&node.id) {
            let target = def.node(&flow.target)?;
            let arm = self
                .core
                .tokens
                .create(
                    token.instance_id,
                    &target.id,
                    &token.scope_path,
                    None,
                    TokenState::Active,
                )
                .await?;
            match (target.kind, target.event.unwrap_or_default()) {
                (NodeKind::ReceiveTask, _) | (NodeKind::IntermediateCatchEvent, EventKind::Message) => {
                    let name = target.message_name.clone().unwrap_or_default();
                    let key = self.correlation_key(token)?;
                    self.core
                        .tokens
                        .park(
                            arm.id,
                            &WaitInfo::Message {
                                name,
                                correlation_key: key,
                                gateway_token: Some(token.id),
                            },
                        )
                        .await?;
                }
                (NodeKind::IntermediateCatchEvent, EventKind::Timer) => {
                    let text = target.timer_definition.as_deref().ok_or_else(|| {
                        EngineError::BadDefinition(format!(
                            "{} has no timer definition",
                            target.id
                        ))
                    })?;
                    let schedule = parse_timer_definition(text, Utc::now())?;
                    let job = self
                        .core
                        .timers
                        .schedule(token.instance_id, arm.id, &target.id, schedule.due_at, None)
                        .await?;
                    self.core
                        .tokens
                        .park(
                            arm.id,
                            &WaitInfo::Timer {
                                timer_id: job.id,
                                gateway_token: Some(token.id),
                            },
                        )
                        .await?;
                }
                (NodeKind::IntermediateCatchEvent, EventKind::Signal) => {
                    let name = target.signal_name.clone().unwrap_or_default();
                    self.core
                        .tokens
                        .park(
                            arm.id,
                            &WaitInfo::Signal {
                                name,
                                gateway_token: Some(token.id),
                            },
                        )
                        .await?;
                }
                _ => {
                    return self
                        .fail_instance(
                            token,
                            "BAD_DEFINITION",
                            &format!("event gateway arm {} is not a catch event", target.id),
                        )
                        .await;
                }
            }
        }
        Ok(StepOutcome::default())
    }

    // ── Call activity ─────────────────────────────────────────

    async fn run_call_activity(
        &self,
        def: &ProcessDefinition,
        token: &Token,
        node: &NodeRecord,
    ) -> Result<StepOutcome> {
        if let Err(err) = self
            .run_listeners(def, token, &node.execution_listeners, "start")
            .await
        {
            return self.escalate_failure(def, token, err).await;
        }
        let called = node.called_element.clone().ok_or_else(|| {
            EngineError::BadDefinition(format!("call activity {} has no calledElement", node.id))
        })?;
        let chain = self.core.scope_chain(token);
        let variables = self.scopes().call_inputs(node, &chain)?;
        let child_id = Uuid::now_v7();
        self.core
            .tokens
            .park(
                token.id,
                &WaitInfo::Child {
                    instance_id: child_id,
                },
            )
            .await?;
        self.core
            .audit
            .emit(
                token.instance_id,
                Some(&node.id),
                event::CALL_STARTED,
                ACTOR_SYSTEM,
                Some(&format!("{called} -> {child_id}")),
            )
            .await?;
        Ok(StepOutcome {
            call: Some(CallRequest {
                child_id,
                definition_id: called,
                variables,
                parent_token: token.id,
                call_node: node.id.clone(),
            }),
            ..Default::default()
        })
    }

    // ── End events ────────────────────────────────────────────

    async fn run_end_event(
        &self,
        def: &ProcessDefinition,
        token: &Token,
        node: &NodeRecord,
    ) -> Result<StepOutcome> {
        match node.event.unwrap_or_default() {
            EventKind::None => self.end_none(def, token).await,
            EventKind::Message => {
                let mut outcome = StepOutcome::default();
                if let Some(name) = &node.message_name {
                    let key = self.correlation_key(token)?;
                    outcome.route =
                        self.router().send_message(name, &key, BTreeMap::new()).await?;
                    self.core
                        .audit
                        .emit(
                            token.instance_id,
                            Some(&node.id),
                            event::MESSAGE_SENT,
                            ACTOR_SYSTEM,
                            Some(name),
                        )
                        .await?;
                }
                let end = self.end_none(def, token).await?;
                outcome.terminal = end.terminal;
                outcome.route.advance.extend(end.route.advance);
                outcome.route.starts.extend(end.route.starts);
                Ok(outcome)
            }
            EventKind::Error => {
                let code = node.error_code.clone().unwrap_or_else(|| "ERROR".into());
                self.core
                    .audit
                    .emit(
                        token.instance_id,
                        Some(&node.id),
                        event::ERROR,
                        ACTOR_SYSTEM,
                        Some(&code),
                    )
                    .await?;
                self.core.tokens.consume(token.id).await?;
                self.escalate_error(def, token, &code, "error end event").await
            }
            EventKind::Terminate => {
                let scopes = self.scopes();
                for live in self.core.tokens.live_tokens(token.instance_id)? {
                    scopes.retire_token(&live).await?;
                }
                self.core
                    .audit
                    .emit(
                        token.instance_id,
                        Some(&node.id),
                        event::TERMINATE,
                        ACTOR_SYSTEM,
                        None,
                    )
                    .await?;
                Ok(StepOutcome {
                    terminal: Some(InstanceStatus::Terminated),
                    ..Default::default()
                })
            }
            EventKind::Cancel => self.end_cancel(def, token, node).await,
            EventKind::Compensation => {
                self.trigger_compensation(token).await?;
                self.end_none(def, token).await
            }
            other => {
                self.fail_instance(
                    token,
                    "UNSUPPORTED",
                    &format!("end event kind {}", other.as_str()),
                )
                .await
            }
        }
    }

    async fn end_none(&self, def: &ProcessDefinition, token: &Token) -> Result<StepOutcome> {
        if !token.scope_path.is_empty() {
            let exited = self.scopes().try_exit_subprocess(def, token).await?;
            let Some(entry) = exited else {
                // Other branches still run inside the scope.
                self.core.tokens.consume(token.id).await?;
                return Ok(StepOutcome::default());
            };
            self.core
                .audit
                .emit(
                    token.instance_id,
                    Some(&entry.node_id),
                    event::SUBPROCESS_EXIT,
                    ACTOR_SYSTEM,
                    None,
                )
                .await?;
            let outer = &token.scope_path[..token.scope_path.len() - 1];
            self.core.tokens.set_scope_path(token.id, outer).await?;
            self.core.tokens.move_to(token.id, &entry.node_id).await?;
            let sub_node = def.node(&entry.node_id)?.clone();
            let mut relocated = token.clone();
            relocated.scope_path = outer.to_vec();
            relocated.node_id = entry.node_id.clone();
            return self.activity_completed(def, &relocated, &sub_node).await;
        }

        self.core.tokens.consume(token.id).await?;
        let remaining: Vec<Token> = self
            .core
            .tokens
            .live_tokens(token.instance_id)?
            .into_iter()
            .filter(|t| !is_event_subscription(def, t))
            .collect();
        if remaining.is_empty() {
            // Last token out: the instance is complete. Lingering event
            // subscriptions die with it.
            let scopes = self.scopes();
            for leftover in self.core.tokens.live_tokens(token.instance_id)? {
                scopes.retire_token(&leftover).await?;
            }
            self.core
                .audit
                .emit(
                    token.instance_id,
                    Some(&token.node_id),
                    event::END,
                    ACTOR_SYSTEM,
                    None,
                )
                .await?;
            return Ok(StepOutcome {
                terminal: Some(InstanceStatus::Completed),
                ..Default::default()
            });
        }
        Ok(StepOutcome::default())
    }

    /// Cancel end event: only meaningful inside a transaction subprocess.
    async fn end_cancel(
        &self,
        def: &ProcessDefinition,
        token: &Token,
        node: &NodeRecord,
    ) -> Result<StepOutcome> {
        let Some(entry) = token.scope_path.last().cloned() else {
            return self
                .fail_instance(token, "BAD_DEFINITION", "cancel end outside transaction")
                .await;
        };
        let scope_node = def.node(&entry.node_id)?.clone();
        if !scope_node.transactional {
            return self
                .fail_instance(token, "BAD_DEFINITION", "cancel end outside transaction")
                .await;
        }
        self.trigger_compensation(token).await?;
        self.scopes()
            .cancel_scope(token.instance_id, entry.scope_id)
            .await?;
        self.core
            .audit
            .emit(
                token.instance_id,
                Some(&scope_node.id),
                event::CANCEL_ACTIVITY,
                ACTOR_SYSTEM,
                Some("transaction cancelled"),
            )
            .await?;
        // Route to the cancel boundary on the transaction, if declared.
        let boundary = def
            .boundary_events(&scope_node.id)
            .into_iter()
            .find(|b| b.event == Some(EventKind::Cancel));
        match boundary {
            Some(boundary) => {
                let outer = &token.scope_path[..token.scope_path.len() - 1];
                self.core
                    .audit
                    .emit(
                        token.instance_id,
                        Some(&boundary.id),
                        event::BOUNDARY_FIRED,
                        ACTOR_SYSTEM,
                        None,
                    )
                    .await?;
                self.core
                    .tokens
                    .create(
                        token.instance_id,
                        &boundary.id,
                        outer,
                        None,
                        TokenState::Active,
                    )
                    .await?;
                Ok(StepOutcome::default())
            }
            None => {
                self.fail_instance(
                    token,
                    "BAD_DEFINITION",
                    "transaction has no cancel boundary event",
                )
                .await
            }
        }
    }

    /// Run compensation handlers of the current scope, most recent first.
    async fn trigger_compensation(&self, token: &Token) -> Result<()> {
        let scope_subject = match token.scope_path.last() {
            Some(entry) => vocab::scope_iri(entry.scope_id),
            None => vocab::instance_iri(token.instance_id),
        };
        for (activity_id, boundary_id) in self.core.compensables(&scope_subject)? {
            self.core
                .audit
                .emit(
                    token.instance_id,
                    Some(&activity_id),
                    event::COMPENSATE,
                    ACTOR_SYSTEM,
                    Some(&boundary_id),
                )
                .await?;
            self.core
                .tokens
                .create(
                    token.instance_id,
                    &boundary_id,
                    &token.scope_path,
                    None,
                    TokenState::Active,
                )
                .await?;
        }
        self.core
            .store
            .remove_pattern(
                crate::vocab::GRAPH_INST,
                Some(&scope_subject),
                Some(&vocab::inst::compensable()),
                None,
            )
            .await?;
        Ok(())
    }

    // ── Completion & traversal ────────────────────────────────

    /// Common tail for every finished activity: boundary timers die, the
    /// compensation ledger is updated, `end` listeners run, multi-instance
    /// completion is consulted, and the outgoing flow is taken.
    pub(crate) async fn activity_completed(
        &self,
        def: &ProcessDefinition,
        token: &Token,
        node: &NodeRecord,
    ) -> Result<StepOutcome> {
        self.core.timers.cancel_for_token(token.id).await?;
        if let Some(comp) = def
            .boundary_events(&node.id)
            .into_iter()
            .find(|b| b.event == Some(EventKind::Compensation))
        {
            let scope_subject = match token.scope_path.last() {
                Some(entry) => vocab::scope_iri(entry.scope_id),
                None => vocab::instance_iri(token.instance_id),
            };
            self.core
                .record_compensable(token.instance_id, &scope_subject, &node.id, &comp.id)
                .await?;
        }
        if let Err(err) = self
            .run_listeners(def, token, &node.execution_listeners, "end")
            .await
        {
            return self.escalate_failure(def, token, err).await;
        }

        if node.loop_characteristics.is_some() && token.loop_index.is_some() {
            return match self.scopes().complete_iteration(token, node).await? {
                MiOutcome::Advance { continuation } => {
                    let fresh = self.core.tokens.get(continuation)?;
                    self.take_flows(def, &fresh).await?;
                    Ok(StepOutcome::default())
                }
                MiOutcome::Waiting => Ok(StepOutcome::default()),
            };
        }
        self.take_flows(def, token).await?;
        Ok(StepOutcome::default())
    }

    /// Move the token over its outgoing flows; extra flows fork siblings.
    async fn take_flows(&self, def: &ProcessDefinition, token: &Token) -> Result<()> {
        let flows = def.outgoing(&token.node_id);
        if flows.is_empty() {
            self.core.tokens.consume(token.id).await?;
            return Ok(());
        }
        for (i, flow) in flows.iter().enumerate() {
            self.emit_take(def, token, &flow.id).await?;
            if i == 0 {
                self.core.tokens.move_to(token.id, &flow.target).await?;
            } else {
                self.core
                    .tokens
                    .create(
                        token.instance_id,
                        &flow.target,
                        &token.scope_path,
                        None,
                        TokenState::Active,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn take_one_flow(
        &self,
        def: &ProcessDefinition,
        token: &Token,
        flow_id: &str,
    ) -> Result<()> {
        let flow = def
            .outgoing(&token.node_id)
            .into_iter()
            .find(|f| f.id == flow_id)
            .ok_or_else(|| EngineError::not_found("flow", flow_id))?;
        self.emit_take(def, token, &flow.id).await?;
        self.core.tokens.move_to(token.id, &flow.target).await
    }

    async fn emit_take(
        &self,
        def: &ProcessDefinition,
        token: &Token,
        flow_id: &str,
    ) -> Result<()> {
        if let Some(flow) = def
            .outgoing(&token.node_id)
            .into_iter()
            .find(|f| f.id == flow_id)
        {
            if !flow.listeners.is_empty() {
                let listeners = flow.listeners.clone();
                self.run_listeners(def, token, &listeners, "take").await?;
            }
        }
        self.core
            .audit
            .emit(
                token.instance_id,
                Some(flow_id),
                event::TAKE,
                ACTOR_SYSTEM,
                None,
            )
            .await?;
        Ok(())
    }

    // ── Listeners ─────────────────────────────────────────────

    /// Fire the listeners registered for one lifecycle event. `expression`
    /// names a registered topic handler; `class` / `delegateExpression`
    /// resolve only when a handler of the same name exists.
    pub(crate) async fn run_listeners(
        &self,
        def: &ProcessDefinition,
        token: &Token,
        listeners: &[ListenerRecord],
        phase: &str,
    ) -> Result<()> {
        for (index, listener) in listeners
            .iter()
            .filter(|l| l.event == phase)
            .enumerate()
        {
            let handler_name = listener
                .expression
                .as_deref()
                .or(listener.class.as_deref())
                .or(listener.delegate_expression.as_deref());
            let Some(name) = handler_name else { continue };
            if !self.core.topics.exists(name).await {
                self.core
                    .audit
                    .emit(
                        token.instance_id,
                        Some(&token.node_id),
                        event::LISTENER,
                        ACTOR_SYSTEM,
                        Some(&format!("{phase} listener {name} skipped: no handler")),
                    )
                    .await?;
                continue;
            }
            let ctx = self.handler_context(token, def.node(&token.node_id)?, name)?;
            match self.core.topics.execute(&ctx).await? {
                HandlerOutcome::Completed(writes) => {
                    self.apply_writes(token, &writes).await?;
                }
                HandlerOutcome::AsyncStarted { .. } => {
                    return Err(EngineError::HandlerConfig {
                        topic: name.to_string(),
                        message: "listeners cannot be async".into(),
                    });
                }
            }
            self.core
                .audit
                .emit(
                    token.instance_id,
                    Some(&token.node_id),
                    &format!("{phase}(listener, {index})"),
                    ACTOR_SYSTEM,
                    Some(name),
                )
                .await?;
        }
        Ok(())
    }

    // ── Failure escalation ────────────────────────────────────

    /// Route an activity failure: handler errors walk the boundary chain,
    /// everything else takes the instance down.
    pub async fn escalate_failure(
        &self,
        def: &ProcessDefinition,
        token: &Token,
        err: EngineError,
    ) -> Result<StepOutcome> {
        if err.escalates() {
            self.core
                .audit
                .emit(
                    token.instance_id,
                    Some(&token.node_id),
                    event::ERROR,
                    ACTOR_SYSTEM,
                    Some(&err.to_string()),
                )
                .await?;
            self.escalate_error(def, token, err.code(), &err.to_string())
                .await
        } else {
            self.fail_instance(token, err.code(), &err.to_string()).await
        }
    }

    /// Search the enclosing scopes outward for a matching error boundary;
    /// interrupting semantics cancel whatever the boundary is attached to.
    pub async fn escalate_error(
        &self,
        def: &ProcessDefinition,
        token: &Token,
        code: &str,
        message: &str,
    ) -> Result<StepOutcome> {
        let scopes = self.scopes();
        // Innermost first: the failing node itself, then enclosing scopes.
        let mut hosts: Vec<(String, Vec<crate::types::ScopeEntry>)> =
            vec![(token.node_id.clone(), token.scope_path.clone())];
        for depth in (0..token.scope_path.len()).rev() {
            hosts.push((
                token.scope_path[depth].node_id.clone(),
                token.scope_path[..depth].to_vec(),
            ));
        }
        for (host, outer_path) in hosts {
            let matched = def.boundary_events(&host).into_iter().find(|b| {
                b.event == Some(EventKind::Error)
                    && (b.error_code.is_none() || b.error_code.as_deref() == Some(code))
            });
            let Some(boundary) = matched else { continue };

            if host == token.node_id {
                scopes.retire_token(token).await?;
            } else if let Some(entry) = token
                .scope_path
                .iter()
                .find(|e| e.node_id == host)
            {
                scopes.cancel_scope(token.instance_id, entry.scope_id).await?;
            }
            self.core
                .audit
                .emit(
                    token.instance_id,
                    Some(&boundary.id),
                    event::BOUNDARY_FIRED,
                    ACTOR_SYSTEM,
                    Some(code),
                )
                .await?;
            self.core
                .tokens
                .create(
                    token.instance_id,
                    &boundary.id,
                    &outer_path,
                    None,
                    TokenState::Active,
                )
                .await?;
            return Ok(StepOutcome::default());
        }
        self.fail_instance(token, code, message).await
    }

    async fn fail_instance(
        &self,
        token: &Token,
        code: &str,
        message: &str,
    ) -> Result<StepOutcome> {
        self.core
            .audit
            .emit(
                token.instance_id,
                Some(&token.node_id),
                event::ERROR,
                ACTOR_SYSTEM,
                Some(&format!("{code}: {message}")),
            )
            .await?;
        self.scopes().retire_token(token).await?;
        tracing::warn!(instance = %token.instance_id, node = %token.node_id, code, message, "instance failed");
        Ok(StepOutcome {
            terminal: Some(InstanceStatus::Error),
            ..Default::default()
        })
    }

    // ── Boundary timers ───────────────────────────────────────

    /// Schedule timer boundary jobs for an activity the token just entered.
    /// Returns true when an already-due interrupting timer fired instead of
    /// the activity running.
    async fn arm_boundary_timers(
        &self,
        def: &ProcessDefinition,
        token: &Token,
        node: &NodeRecord,
    ) -> Result<bool> {
        let now = Utc::now();
        let mut preempted = false;
        for boundary in def.boundary_events(&node.id) {
            if boundary.event != Some(EventKind::Timer) {
                continue;
            }
            let Some(text) = boundary.timer_definition.as_deref() else {
                continue;
            };
            let schedule = parse_timer_definition(text, now)?;
            if boundary.cancel_activity && schedule.due_at <= now && !preempted {
                // Fires before the activity body can produce side effects.
                let job = self
                    .core
                    .timers
                    .schedule(token.instance_id, token.id, &boundary.id, schedule.due_at, None)
                    .await?;
                self.core
                    .audit
                    .emit(
                        token.instance_id,
                        Some(&boundary.id),
                        event::TIMER_FIRED,
                        ACTOR_SYSTEM,
                        None,
                    )
                    .await?;
                self.router().fire_boundary(def, token, &boundary.id, &job).await?;
                self.core.timers.mark_fired(job.id).await?;
                preempted = true;
                continue;
            }
            let cycle = schedule.repeats.filter(|_| !boundary.cancel_activity);
            self.core
                .timers
                .schedule(token.instance_id, token.id, &boundary.id, schedule.due_at, cycle)
                .await?;
            self.core
                .audit
                .emit(
                    token.instance_id,
                    Some(&boundary.id),
                    event::TIMER_SCHEDULED,
                    ACTOR_SYSTEM,
                    Some(text),
                )
                .await?;
        }
        Ok(preempted)
    }

    // ── Helpers ───────────────────────────────────────────────

    fn handler_context(
        &self,
        token: &Token,
        node: &NodeRecord,
        topic: &str,
    ) -> Result<ProcessContext> {
        let chain = self.core.scope_chain(token);
        Ok(ProcessContext {
            instance_id: token.instance_id,
            node_id: node.id.clone(),
            topic: topic.to_string(),
            variables: self.core.vars.collect(&chain)?,
        })
    }

    /// Handler writes land on the instance scope.
    async fn apply_writes(
        &self,
        token: &Token,
        writes: &BTreeMap<String, VarValue>,
    ) -> Result<()> {
        let subject = vocab::instance_iri(token.instance_id);
        self.core.vars.set_all(&subject, writes).await
    }

    /// Correlation key for subscriptions and dispatch: the instance's
    /// `correlationKey` variable when set, its id otherwise.
    fn correlation_key(&self, token: &Token) -> Result<String> {
        let chain = self.core.scope_chain(token);
        Ok(match self.core.vars.get(&chain, "correlationKey")? {
            Some(VarValue::String(s)) => s,
            Some(other) => other.to_json().to_string().trim_matches('"').to_string(),
            None => token.instance_id.to_string(),
        })
    }
}
