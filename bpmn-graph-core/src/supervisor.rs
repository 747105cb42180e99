//! Instance supervisor: starts, stops, resumes instances, owns per-instance
//! locking and the run loop.
//!
//! Per-instance execution is serialized by an instance lock; different
//! instances advance in parallel. Call-activity children and message starts
//! are queued and driven iteratively, never recursively, so deep call
//! chains and cyclic definitions cannot blow the stack.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex, Semaphore};
use uuid::Uuid;

use crate::audit::{event, ACTOR_SYSTEM};
use crate::engine::EngineCore;
use crate::error::{EngineError, Result};
use crate::executor::{CallRequest, TokenExecutor};
use crate::router::{EventRouter, FireOutcome};
use crate::subprocess::{is_event_subscription, ScopeController};
use crate::topics::AsyncCompletion;
use crate::types::{
    InstanceRecord, InstanceStatus, Token, TokenState, UserTaskRecord, VarValue, WaitInfo,
};
use crate::vocab;

/// Ceiling on state-machine steps per instance per advance, against
/// definitions that loop without ever reaching a wait state.
const MAX_STEPS_PER_ADVANCE: usize = 10_000;

struct RunReport {
    terminal: Option<InstanceStatus>,
    calls: Vec<CallRequest>,
    advance: Vec<Uuid>,
    starts: Vec<(String, String, BTreeMap<String, VarValue>)>,
}

pub struct Supervisor {
    core: Arc<EngineCore>,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    workers: Arc<Semaphore>,
    worker_id: String,
    async_rx: Mutex<Option<mpsc::UnboundedReceiver<AsyncCompletion>>>,
}

impl Supervisor {
    pub fn new(core: Arc<EngineCore>, async_rx: mpsc::UnboundedReceiver<AsyncCompletion>) -> Self {
        let workers = Arc::new(Semaphore::new(core.config.max_concurrent_workers.max(1)));
        Self {
            core,
            locks: Mutex::new(HashMap::new()),
            workers,
            worker_id: format!("worker-{}", Uuid::now_v7()),
            async_rx: Mutex::new(Some(async_rx)),
        }
    }

    pub fn core(&self) -> &Arc<EngineCore> {
        &self.core
    }

    async fn instance_lock(&self, id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ── Lifecycle ─────────────────────────────────────────────

    /// Start an instance and run it to quiescence.
    pub async fn start(
        &self,
        definition_id: &str,
        variables: BTreeMap<String, VarValue>,
        start_event: Option<&str>,
    ) -> Result<Uuid> {
        let id = Uuid::now_v7();
        self.begin_instance(id, definition_id, variables, start_event, None)
            .await?;
        self.advance(id).await?;
        Ok(id)
    }

    /// Create the instance row, seed variables, place the initial token and
    /// arm root-level event subprocesses. Does not run the executor.
    async fn begin_instance(
        &self,
        id: Uuid,
        definition_id: &str,
        variables: BTreeMap<String, VarValue>,
        start_event: Option<&str>,
        parent: Option<(Uuid, &str)>,
    ) -> Result<()> {
        if self.core.defs.status(definition_id)? != "active" {
            return Err(EngineError::PreconditionFailed(format!(
                "definition {definition_id} is retired"
            )));
        }
        let def = self.core.defs.get(definition_id).await?;
        let start_node = match start_event {
            Some(named) => {
                let node = def.node(named)?;
                if node.kind != crate::definition::NodeKind::StartEvent {
                    return Err(EngineError::PreconditionFailed(format!(
                        "{named} is not a start event"
                    )));
                }
                node
            }
            None => def.none_start_event()?,
        };

        self.core.create_instance(id, definition_id, parent).await?;
        let subject = vocab::instance_iri(id);
        self.core.vars.set_all(&subject, &variables).await?;
        self.core
            .tokens
            .create(id, &start_node.id, &[], None, TokenState::Active)
            .await?;
        self.core
            .audit
            .emit(id, Some(&start_node.id), event::START, ACTOR_SYSTEM, None)
            .await?;
        let scopes = ScopeController::new(&self.core);
        if let Err(err) = scopes.arm_event_subprocesses(&def, id, &[], None).await {
            // Declared-but-unsupported triggers error the instance at first
            // encounter instead of failing the start call.
            self.core
                .set_instance_status(id, InstanceStatus::Error)
                .await?;
            tracing::warn!(instance = %id, error = %err, "instance errored while arming events");
            return Ok(());
        }
        self.core
            .set_instance_status(id, InstanceStatus::Running)
            .await?;
        tracing::info!(instance = %id, definition = definition_id, "instance started");
        Ok(())
    }

    /// Drive an instance (and everything it causes: children, message
    /// starts, cross-instance resumptions) until global quiescence.
    pub async fn advance(&self, instance_id: Uuid) -> Result<()> {
        let _permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(EngineError::store)?;
        let mut queue = VecDeque::from([instance_id]);
        while let Some(id) = queue.pop_front() {
            let report = self.run_instance(id).await?;
            for call in report.calls {
                match self.prepare_child(&call).await {
                    Ok(child_id) => queue.push_back(child_id),
                    Err(err) => {
                        self.deliver_child_failure(id, &call, &err).await?;
                        queue.push_back(id);
                    }
                }
            }
            queue.extend(report.advance);
            for (definition_id, start_event, variables) in report.starts {
                let new_id = Uuid::now_v7();
                match self
                    .begin_instance(new_id, &definition_id, variables, Some(&start_event), None)
                    .await
                {
                    Ok(()) => queue.push_back(new_id),
                    Err(err) => {
                        tracing::warn!(definition = %definition_id, error = %err, "message start failed");
                    }
                }
            }
            if report.terminal.is_some() {
                if let Some(parent_id) = self.deliver_child_result(id).await? {
                    queue.push_back(parent_id);
                }
            }
        }
        self.core.store.persist().await
    }

    /// Step every ACTIVE token of one instance until none remain, under the
    /// instance lock.
    async fn run_instance(&self, id: Uuid) -> Result<RunReport> {
        let lock = self.instance_lock(id).await;
        let _guard = lock.lock().await;

        let mut report = RunReport {
            terminal: None,
            calls: Vec::new(),
            advance: Vec::new(),
            starts: Vec::new(),
        };
        let record = self.core.instance(id)?;
        if record.status.is_terminal() {
            // Already terminal (e.g. errored while arming): still report it
            // so a waiting parent call activity hears about the outcome.
            report.terminal = Some(record.status);
            return Ok(report);
        }
        let def = self.core.defs.get(&record.definition_id).await?;
        if record.status == InstanceStatus::Waiting {
            self.core
                .set_instance_status(id, InstanceStatus::Running)
                .await?;
        }

        let executor = TokenExecutor::new(&self.core);
        let mut steps = 0usize;
        'run: loop {
            let active: Vec<Token> = self
                .core
                .tokens
                .live_tokens(id)?
                .into_iter()
                .filter(|t| t.state == TokenState::Active)
                .collect();
            if active.is_empty() {
                if executor.try_release_joins(&def, id).await? {
                    continue;
                }
                break;
            }
            for token in active {
                // Earlier steps this round may have consumed or parked it.
                let Ok(fresh) = self.core.tokens.get(token.id) else {
                    continue;
                };
                if fresh.state != TokenState::Active {
                    continue;
                }
                steps += 1;
                if steps > MAX_STEPS_PER_ADVANCE {
                    self.core
                        .audit
                        .emit(
                            id,
                            Some(&fresh.node_id),
                            event::ERROR,
                            ACTOR_SYSTEM,
                            Some("step budget exhausted; definition may loop without waiting"),
                        )
                        .await?;
                    report.terminal = Some(InstanceStatus::Error);
                    break 'run;
                }
                let outcome = match executor.step(&def, &fresh).await {
                    Ok(outcome) => outcome,
                    // Store faults surface to the caller; anything else is
                    // an instance-level failure with an audit trail.
                    Err(err @ EngineError::Store(_)) => return Err(err),
                    Err(err) => {
                        self.core
                            .audit
                            .emit(
                                id,
                                Some(&fresh.node_id),
                                event::ERROR,
                                ACTOR_SYSTEM,
                                Some(&err.to_string()),
                            )
                            .await?;
                        report.terminal = Some(InstanceStatus::Error);
                        break 'run;
                    }
                };
                if let Some(call) = outcome.call {
                    report.calls.push(call);
                }
                report.advance.extend(
                    outcome
                        .route
                        .advance
                        .into_iter()
                        .filter(|other| *other != id),
                );
                report.starts.extend(outcome.route.starts);
                if let Some(status) = outcome.terminal {
                    report.terminal = Some(status);
                    break 'run;
                }
            }
        }

        match report.terminal {
            Some(status) => {
                if status == InstanceStatus::Error {
                    let scopes = ScopeController::new(&self.core);
                    for leftover in self.core.tokens.live_tokens(id)? {
                        scopes.retire_token(&leftover).await?;
                    }
                }
                self.core.timers.cancel_for_instance(id).await?;
                self.core.set_instance_status(id, status).await?;
            }
            None => {
                let live = self.core.tokens.live_tokens(id)?;
                let waiting = live.iter().any(|t| !is_event_subscription(&def, t));
                if waiting {
                    self.core
                        .set_instance_status(id, InstanceStatus::Waiting)
                        .await?;
                } else {
                    // Every real token drained without an end event firing.
                    let scopes = ScopeController::new(&self.core);
                    for leftover in live {
                        scopes.retire_token(&leftover).await?;
                    }
                    self.core.timers.cancel_for_instance(id).await?;
                    self.core
                        .set_instance_status(id, InstanceStatus::Completed)
                        .await?;
                    report.terminal = Some(InstanceStatus::Completed);
                }
            }
        }
        Ok(report)
    }

    // ── Call activities ───────────────────────────────────────

    async fn prepare_child(&self, call: &CallRequest) -> Result<Uuid> {
        let parent_token = self.core.tokens.get(call.parent_token)?;
        self.begin_instance(
            call.child_id,
            &call.definition_id,
            call.variables.clone(),
            None,
            Some((parent_token.instance_id, call.call_node.as_str())),
        )
        .await?;
        Ok(call.child_id)
    }

    /// Child could not even start: surface the failure at the parent's call
    /// node through normal error escalation.
    async fn deliver_child_failure(
        &self,
        parent_id: Uuid,
        call: &CallRequest,
        err: &EngineError,
    ) -> Result<()> {
        let lock = self.instance_lock(parent_id).await;
        let _guard = lock.lock().await;
        let record = self.core.instance(parent_id)?;
        let def = self.core.defs.get(&record.definition_id).await?;
        let token = self.core.tokens.get(call.parent_token)?;
        let executor = TokenExecutor::new(&self.core);
        let outcome = executor
            .escalate_error(&def, &token, err.code(), &err.to_string())
            .await?;
        if let Some(status) = outcome.terminal {
            self.core.set_instance_status(parent_id, status).await?;
        }
        Ok(())
    }

    /// A terminal child notifies its parent call activity: outputs map back
    /// on success, failures escalate at the call node.
    async fn deliver_child_result(&self, child_id: Uuid) -> Result<Option<Uuid>> {
        let child = self.core.instance(child_id)?;
        let Some((parent_id, call_node)) = child.parent.clone() else {
            return Ok(None);
        };
        let lock = self.instance_lock(parent_id).await;
        let _guard = lock.lock().await;

        let parent = self.core.instance(parent_id)?;
        if parent.status.is_terminal() {
            return Ok(None);
        }
        let def = self.core.defs.get(&parent.definition_id).await?;
        let waiting = self
            .core
            .tokens
            .live_tokens(parent_id)?
            .into_iter()
            .find(|t| {
                matches!(&t.wait, Some(WaitInfo::Child { instance_id }) if *instance_id == child_id)
            });
        let Some(token) = waiting else {
            // The call token is gone (boundary fired, instance stopped).
            return Ok(None);
        };

        let executor = TokenExecutor::new(&self.core);
        let outcome = if child.status == InstanceStatus::Completed {
            let node = def.node(&call_node)?.clone();
            let scopes = ScopeController::new(&self.core);
            scopes
                .apply_call_outputs(&node, parent_id, child_id)
                .await?;
            self.core
                .audit
                .emit(
                    parent_id,
                    Some(&call_node),
                    event::CALL_COMPLETED,
                    ACTOR_SYSTEM,
                    Some(&child_id.to_string()),
                )
                .await?;
            self.core.tokens.resume(token.id).await?;
            let resumed = self.core.tokens.get(token.id)?;
            executor.activity_completed(&def, &resumed, &node).await?
        } else {
            executor
                .escalate_error(
                    &def,
                    &token,
                    "CHILD_FAILED",
                    &format!("child instance {child_id} ended {}", child.status),
                )
                .await?
        };
        if let Some(status) = outcome.terminal {
            self.core.set_instance_status(parent_id, status).await?;
        }
        Ok(Some(parent_id))
    }

    // ── Control operations ────────────────────────────────────

    /// Terminate an instance. Idempotent: stopping a stopped instance is a
    /// no-op returning its record.
    pub async fn stop(&self, instance_id: Uuid, reason: &str) -> Result<InstanceRecord> {
        self.terminate_with(instance_id, reason, InstanceStatus::Terminated)
            .await
    }

    /// Cancel an instance: same teardown as stop, CANCELLED terminal state.
    pub async fn cancel(&self, instance_id: Uuid, reason: &str) -> Result<InstanceRecord> {
        self.terminate_with(instance_id, reason, InstanceStatus::Cancelled)
            .await
    }

    async fn terminate_with(
        &self,
        instance_id: Uuid,
        reason: &str,
        status: InstanceStatus,
    ) -> Result<InstanceRecord> {
        let lock = self.instance_lock(instance_id).await;
        let guard = lock.lock().await;
        let record = self.core.instance(instance_id)?;
        if record.status.is_terminal() {
            return Ok(record);
        }
        let scopes = ScopeController::new(&self.core);
        for token in self.core.tokens.live_tokens(instance_id)? {
            scopes.retire_token(&token).await?;
        }
        self.core.timers.cancel_for_instance(instance_id).await?;
        self.core
            .audit
            .emit(
                instance_id,
                None,
                event::TERMINATE,
                ACTOR_SYSTEM,
                Some(reason),
            )
            .await?;
        self.core.set_instance_status(instance_id, status).await?;
        drop(guard);

        // A stopped child reads as a failure to its parent call activity.
        if let Some(parent_id) = self.deliver_child_result(instance_id).await? {
            self.advance(parent_id).await?;
        }
        self.core.store.persist().await?;
        self.core.instance(instance_id)
    }

    /// Synthesize an error at the innermost active token.
    pub async fn throw_error(
        &self,
        instance_id: Uuid,
        code: &str,
        message: &str,
    ) -> Result<()> {
        {
            let lock = self.instance_lock(instance_id).await;
            let _guard = lock.lock().await;
            let record = self.core.instance(instance_id)?;
            if record.status.is_terminal() {
                return Err(EngineError::PreconditionFailed(format!(
                    "instance {instance_id} is {}",
                    record.status
                )));
            }
            let def = self.core.defs.get(&record.definition_id).await?;
            let target = self
                .core
                .tokens
                .live_tokens(instance_id)?
                .into_iter()
                .filter(|t| !is_event_subscription(&def, t))
                .max_by_key(|t| t.scope_path.len())
                .ok_or_else(|| {
                    EngineError::PreconditionFailed("instance has no live token".into())
                })?;
            self.core
                .audit
                .emit(
                    instance_id,
                    Some(&target.node_id),
                    event::ERROR,
                    ACTOR_SYSTEM,
                    Some(&format!("{code}: {message}")),
                )
                .await?;
            let executor = TokenExecutor::new(&self.core);
            let outcome = executor.escalate_error(&def, &target, code, message).await?;
            if let Some(status) = outcome.terminal {
                self.core.set_instance_status(instance_id, status).await?;
            }
        }
        self.advance(instance_id).await
    }

    pub async fn set_variable(
        &self,
        instance_id: Uuid,
        name: &str,
        value: &VarValue,
    ) -> Result<()> {
        let lock = self.instance_lock(instance_id).await;
        let _guard = lock.lock().await;
        self.core.instance(instance_id)?;
        let subject = vocab::instance_iri(instance_id);
        self.core.vars.set(&subject, name, value).await
    }

    pub async fn get_variable(&self, instance_id: Uuid, name: &str) -> Result<Option<VarValue>> {
        self.core.instance(instance_id)?;
        let subject = vocab::instance_iri(instance_id);
        self.core.vars.get(&[subject], name)
    }

    // ── User tasks ────────────────────────────────────────────

    pub async fn claim_task(&self, task_id: Uuid, assignee: &str) -> Result<UserTaskRecord> {
        let record = self.core.tasks.claim(task_id, assignee).await?;
        self.core
            .audit
            .emit(
                record.instance_id,
                Some(&record.node_id),
                event::CLAIM_TASK,
                assignee,
                Some(&task_id.to_string()),
            )
            .await?;
        self.run_task_listeners(&record, "assignment").await?;
        Ok(record)
    }

    pub async fn unclaim_task(&self, task_id: Uuid) -> Result<UserTaskRecord> {
        let record = self.core.tasks.unclaim(task_id).await?;
        self.core
            .audit
            .emit(
                record.instance_id,
                Some(&record.node_id),
                event::UNCLAIM_TASK,
                ACTOR_SYSTEM,
                Some(&task_id.to_string()),
            )
            .await?;
        Ok(record)
    }

    /// Deliver a completion to the task's waiting token and run on.
    pub async fn complete_task(
        &self,
        task_id: Uuid,
        variables: BTreeMap<String, VarValue>,
        actor: Option<&str>,
    ) -> Result<()> {
        let instance_id = {
            let task = self.core.tasks.get(task_id)?;
            let lock = self.instance_lock(task.instance_id).await;
            let _guard = lock.lock().await;

            let record = self.core.instance(task.instance_id)?;
            if record.status.is_terminal() {
                return Err(EngineError::PreconditionFailed(format!(
                    "instance {} is {}",
                    task.instance_id, record.status
                )));
            }
            let def = self.core.defs.get(&record.definition_id).await?;
            let token = self
                .core
                .tokens
                .live_tokens(task.instance_id)?
                .into_iter()
                .find(|t| {
                    matches!(&t.wait, Some(WaitInfo::UserTask { task_id: t_id }) if *t_id == task_id)
                })
                .ok_or_else(|| {
                    EngineError::PreconditionFailed(format!(
                        "task {task_id} has no waiting token"
                    ))
                })?;
            let node = def.node(&token.node_id)?.clone();

            // Fixed write order: inst (vars, token), tasks, log.
            let subject = vocab::instance_iri(task.instance_id);
            self.core.vars.set_all(&subject, &variables).await?;
            self.core.tasks.mark_completed(task_id).await?;
            self.core
                .audit
                .emit(
                    task.instance_id,
                    Some(&node.id),
                    event::COMPLETE_TASK,
                    actor.unwrap_or(ACTOR_SYSTEM),
                    Some(&task_id.to_string()),
                )
                .await?;
            let executor = TokenExecutor::new(&self.core);
            executor
                .run_listeners(&def, &token, &node.task_listeners, "complete")
                .await?;
            self.core.tokens.resume(token.id).await?;
            let resumed = self.core.tokens.get(token.id)?;
            let outcome = executor.activity_completed(&def, &resumed, &node).await?;
            if let Some(status) = outcome.terminal {
                self.core.set_instance_status(task.instance_id, status).await?;
            }
            task.instance_id
        };
        self.advance(instance_id).await
    }

    async fn run_task_listeners(&self, record: &UserTaskRecord, phase: &str) -> Result<()> {
        let instance = self.core.instance(record.instance_id)?;
        let def = self.core.defs.get(&instance.definition_id).await?;
        let node = def.node(&record.node_id)?.clone();
        if node.task_listeners.is_empty() {
            return Ok(());
        }
        let token = self
            .core
            .tokens
            .live_tokens(record.instance_id)?
            .into_iter()
            .find(|t| {
                matches!(&t.wait, Some(WaitInfo::UserTask { task_id }) if *task_id == record.id)
            });
        if let Some(token) = token {
            let executor = TokenExecutor::new(&self.core);
            executor
                .run_listeners(&def, &token, &node.task_listeners, phase)
                .await?;
        }
        Ok(())
    }

    // ── Messaging ─────────────────────────────────────────────

    pub async fn send_message(
        &self,
        name: &str,
        correlation_key: &str,
        variables: BTreeMap<String, VarValue>,
    ) -> Result<()> {
        tracing::debug!(message = name, key = correlation_key, "external message dispatch");
        let router = EventRouter::new(&self.core);
        let effects = router.send_message(name, correlation_key, variables).await?;
        self.apply_route_effects(effects).await
    }

    pub async fn broadcast_signal(
        &self,
        name: &str,
        variables: BTreeMap<String, VarValue>,
    ) -> Result<()> {
        let router = EventRouter::new(&self.core);
        let effects = router.broadcast_signal(name, variables).await?;
        self.apply_route_effects(effects).await
    }

    async fn apply_route_effects(&self, effects: crate::router::RouteEffects) -> Result<()> {
        for instance_id in effects.advance {
            self.advance(instance_id).await?;
        }
        for (definition_id, start_event, variables) in effects.starts {
            let id = Uuid::now_v7();
            self.begin_instance(id, &definition_id, variables, Some(&start_event), None)
                .await?;
            self.advance(id).await?;
        }
        Ok(())
    }

    // ── Timers ────────────────────────────────────────────────

    /// One cooperative tick of the timer poller: claim due jobs, fire them,
    /// advance whatever woke up.
    pub async fn run_due_timers(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.core.timers.due_jobs(now)?;
        let mut fired = 0usize;
        for job_id in due {
            let Some(job) = self.core.timers.try_claim(job_id, &self.worker_id, now).await? else {
                continue;
            };
            let router = EventRouter::new(&self.core);
            match router.fire_timer(&job).await {
                Ok(FireOutcome::Fired(woke)) => {
                    self.core.timers.mark_fired(job.id).await?;
                    fired += 1;
                    if let Some(instance_id) = woke {
                        self.advance(instance_id).await?;
                    }
                }
                Ok(FireOutcome::Skipped) => {
                    self.core.timers.release(job.id).await?;
                }
                Err(err) => {
                    tracing::warn!(timer = %job.id, error = %err, "timer firing failed");
                    self.core.timers.record_failure(job.id).await?;
                }
            }
        }
        Ok(fired)
    }

    // ── Async handler callbacks ───────────────────────────────

    /// Resolve an async handler completion (or an externally delivered
    /// callback) to its parked token.
    pub async fn resume_callback(
        &self,
        callback_id: &str,
        result: Result<BTreeMap<String, VarValue>>,
    ) -> Result<()> {
        let token = self.find_callback_token(callback_id)?;
        let instance_id = token.instance_id;
        {
            let lock = self.instance_lock(instance_id).await;
            let _guard = lock.lock().await;
            let record = self.core.instance(instance_id)?;
            if record.status.is_terminal() {
                return Ok(());
            }
            let def = self.core.defs.get(&record.definition_id).await?;
            let node = def.node(&token.node_id)?.clone();
            let executor = TokenExecutor::new(&self.core);
            let outcome = match result {
                Ok(writes) => {
                    let subject = vocab::instance_iri(instance_id);
                    self.core.vars.set_all(&subject, &writes).await?;
                    self.core
                        .audit
                        .emit(
                            instance_id,
                            Some(&node.id),
                            event::COMPLETE,
                            ACTOR_SYSTEM,
                            Some(callback_id),
                        )
                        .await?;
                    self.core.tokens.resume(token.id).await?;
                    let resumed = self.core.tokens.get(token.id)?;
                    executor.activity_completed(&def, &resumed, &node).await?
                }
                Err(err) => executor.escalate_failure(&def, &token, err).await?,
            };
            if let Some(status) = outcome.terminal {
                self.core.set_instance_status(instance_id, status).await?;
            }
        }
        self.advance(instance_id).await
    }

    fn find_callback_token(&self, callback_id: &str) -> Result<Token> {
        let subjects = self.core.store.subjects(
            vocab::GRAPH_INST,
            &vocab::inst::callback_id(),
            &oxigraph::model::Term::Literal(oxigraph::model::Literal::from(callback_id)),
        )?;
        for subject in subjects {
            if let Some(id) = vocab::uuid_from_iri(subject.as_str()) {
                let token = self.core.tokens.get(id)?;
                if token.state == TokenState::Waiting {
                    return Ok(token);
                }
            }
        }
        Err(EngineError::not_found("callback", callback_id))
    }

    // ── Background service ────────────────────────────────────

    /// Spawn the timer poll loop and the async completion dispatcher.
    /// Restart recovery (expired lease reset) runs first.
    pub async fn spawn_background(self: &Arc<Self>) -> Result<()> {
        self.core.timers.reset_expired_leases(Utc::now()).await?;

        let poller = Arc::clone(self);
        let interval = self.core.config.timer_poll_interval_ms.max(10);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_millis(interval));
            loop {
                ticker.tick().await;
                if let Err(err) = poller.run_due_timers(Utc::now()).await {
                    tracing::error!(error = %err, "timer poll failed");
                }
            }
        });

        let dispatcher = Arc::clone(self);
        let mut rx = self
            .async_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| EngineError::PreconditionFailed("background already started".into()))?;
        tokio::spawn(async move {
            while let Some(completion) = rx.recv().await {
                if let Err(err) = dispatcher
                    .resume_callback(&completion.callback_id, completion.result)
                    .await
                {
                    tracing::error!(
                        callback = %completion.callback_id,
                        error = %err,
                        "async completion failed"
                    );
                }
            }
        });
        Ok(())
    }

    /// Drain pending async completions inline; for driving the engine
    /// without background tasks (tests, embedders with their own loop).
    pub async fn drain_async_completions(&self) -> Result<usize> {
        let mut handled = 0usize;
        loop {
            let completion = {
                let mut slot = self.async_rx.lock().await;
                let Some(rx) = slot.as_mut() else {
                    return Ok(handled);
                };
                match rx.try_recv() {
                    Ok(completion) => completion,
                    Err(_) => return Ok(handled),
                }
            };
            self.resume_callback(&completion.callback_id, completion.result)
                .await?;
            handled += 1;
        }
    }

    /// Current wait points of an instance: node ids of live tokens.
    pub fn current_nodes(&self, instance_id: Uuid) -> Result<Vec<String>> {
        Ok(self
            .core
            .tokens
            .live_tokens(instance_id)?
            .into_iter()
            .map(|t| t.node_id)
            .collect())
    }
}

