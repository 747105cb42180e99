//! End-to-end scenarios through the control facade: linear flows, gateway
//! routing, parallelism, user tasks, boundary timers, multi-instance, call
//! activities, and the persistence/idempotence properties.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bpmn_graph_core::definition::{
    DefinitionPayload, EventKind, FlowRecord, ListenerRecord, LoopCharacteristics, NodeKind,
    NodeRecord,
};
use bpmn_graph_core::error::EngineError;
use bpmn_graph_core::topics::{FnHandler, ProcessContext};
use bpmn_graph_core::types::{InstanceStatus, UserTaskStatus, VarValue, VariableWire};
use bpmn_graph_core::{BpmnGraphEngine, EngineConfig};
use chrono::Utc;

// ── Definition building helpers ───────────────────────────────

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

fn conditional(id: &str, source: &str, target: &str, condition: &str) -> FlowRecord {
    FlowRecord {
        condition: Some(condition.to_string()),
        ..flow(id, source, target)
    }
}

fn default_flow(id: &str, source: &str, target: &str) -> FlowRecord {
    FlowRecord {
        is_default: true,
        ..flow(id, source, target)
    }
}

fn payload(id: &str, nodes: Vec<NodeRecord>, flows: Vec<FlowRecord>) -> DefinitionPayload {
    DefinitionPayload {
        id: Some(id.to_string()),
        name: id.to_string(),
        version: "1.0.0".to_string(),
        description: None,
        nodes,
        flows,
        messages: Vec::new(),
        signals: Vec::new(),
        errors: Vec::new(),
        diagram: None,
    }
}

fn int_var(name: &str, value: i64) -> VariableWire {
    VariableWire {
        name: name.to_string(),
        value: serde_json::json!(value),
        datatype: "integer".to_string(),
    }
}

fn str_var(name: &str, value: &str) -> VariableWire {
    VariableWire {
        name: name.to_string(),
        value: serde_json::json!(value),
        datatype: "string".to_string(),
    }
}

fn engine() -> BpmnGraphEngine {
    BpmnGraphEngine::open(EngineConfig::default(), None).unwrap()
}

fn writes(pairs: &[(&str, VarValue)]) -> BTreeMap<String, VarValue> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn var_map(view: &bpmn_graph_core::control::InstanceView) -> BTreeMap<String, VarValue> {
    view.variables
        .iter()
        .filter_map(|w| w.to_value().map(|v| (w.name.clone(), v)))
        .collect()
}

// ── S1: linear service task ───────────────────────────────────

#[tokio::test]
async fn s1_linear_service_task() {
    let engine = engine();
    engine
        .register_function_handler(
            "double",
            Some("x := 2*x"),
            Arc::new(FnHandler(|ctx: &ProcessContext| {
                let x = match ctx.variables.get("x") {
                    Some(VarValue::Integer(n)) => *n,
                    other => panic!("x missing or mistyped: {other:?}"),
                };
                Ok(writes(&[("x", VarValue::Integer(2 * x))]))
            })),
        )
        .await;
    engine
        .register_function_handler(
            "noop",
            None,
            Arc::new(FnHandler(|_: &ProcessContext| Ok(BTreeMap::new()))),
        )
        .await;

    let mut work = node("work", NodeKind::ServiceTask);
    work.topic = Some("double".into());
    work.execution_listeners = vec![ListenerRecord {
        event: "start".into(),
        expression: Some("noop".into()),
        class: None,
        delegate_expression: None,
    }];
    engine
        .control
        .deploy_definition(payload(
            "linear",
            vec![node("start", NodeKind::StartEvent), work, node("end", NodeKind::EndEvent)],
            vec![flow("f1", "start", "work"), flow("f2", "work", "end")],
        ))
        .await
        .unwrap();

    let view = engine
        .control
        .start_instance("linear", vec![int_var("x", 21)], None)
        .await
        .unwrap();

    assert_eq!(view.record.status, InstanceStatus::Completed);
    assert_eq!(var_map(&view)["x"], VarValue::Integer(42));

    let trail = engine.control.get_audit_trail(view.record.id).unwrap();
    let types: Vec<&str> = trail.iter().map(|r| r.event_type.as_str()).collect();
    assert_eq!(
        types,
        vec!["START", "TAKE", "start(listener, 0)", "COMPLETE", "TAKE", "END"]
    );
    // Monotone timestamps per instance.
    for pair in trail.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }
}

// ── S2: exclusive gateway with default ────────────────────────

async fn deploy_xor(engine: &BpmnGraphEngine) {
    engine
        .register_function_handler(
            "mark-big",
            None,
            Arc::new(FnHandler(|_: &ProcessContext| {
                Ok(writes(&[("path", VarValue::String("big".into()))]))
            })),
        )
        .await;
    engine
        .register_function_handler(
            "mark-small",
            None,
            Arc::new(FnHandler(|_: &ProcessContext| {
                Ok(writes(&[("path", VarValue::String("small".into()))]))
            })),
        )
        .await;

    let mut big = node("big", NodeKind::ServiceTask);
    big.topic = Some("mark-big".into());
    let mut small = node("small", NodeKind::ServiceTask);
    small.topic = Some("mark-small".into());
    engine
        .control
        .deploy_definition(payload(
            "xor",
            vec![
                node("start", NodeKind::StartEvent),
                node("gw", NodeKind::ExclusiveGateway),
                big,
                small,
                node("end", NodeKind::EndEvent),
            ],
            vec![
                flow("f1", "start", "gw"),
                conditional("fbig", "gw", "big", "${amount >= 100}"),
                default_flow("fsmall", "gw", "small"),
                flow("f3", "big", "end"),
                flow("f4", "small", "end"),
            ],
        ))
        .await
        .unwrap();
}

#[tokio::test]
async fn s2_exclusive_gateway_routing() {
    let engine = engine();
    deploy_xor(&engine).await;

    let big = engine
        .control
        .start_instance("xor", vec![int_var("amount", 150)], None)
        .await
        .unwrap();
    assert_eq!(var_map(&big)["path"], VarValue::String("big".into()));

    let small = engine
        .control
        .start_instance("xor", vec![int_var("amount", 10)], None)
        .await
        .unwrap();
    assert_eq!(var_map(&small)["path"], VarValue::String("small".into()));

    // Missing variable: guard false, default taken.
    let fallback = engine.control.start_instance("xor", vec![], None).await.unwrap();
    assert_eq!(fallback.record.status, InstanceStatus::Completed);
    assert_eq!(var_map(&fallback)["path"], VarValue::String("small".into()));
}

// ── S3: parallel fan-out / fan-in ─────────────────────────────

#[tokio::test]
async fn s3_parallel_fork_join() {
    let engine = engine();
    engine
        .register_function_handler(
            "set-a",
            None,
            Arc::new(FnHandler(|_: &ProcessContext| {
                Ok(writes(&[("a", VarValue::Integer(1))]))
            })),
        )
        .await;
    engine
        .register_function_handler(
            "set-b",
            None,
            Arc::new(FnHandler(|_: &ProcessContext| {
                Ok(writes(&[("b", VarValue::Integer(2))]))
            })),
        )
        .await;

    let mut task_a = node("a", NodeKind::ServiceTask);
    task_a.topic = Some("set-a".into());
    let mut task_b = node("b", NodeKind::ServiceTask);
    task_b.topic = Some("set-b".into());
    engine
        .control
        .deploy_definition(payload(
            "par",
            vec![
                node("start", NodeKind::StartEvent),
                node("split", NodeKind::ParallelGateway),
                task_a,
                task_b,
                node("join", NodeKind::ParallelGateway),
                node("end", NodeKind::EndEvent),
            ],
            vec![
                flow("f1", "start", "split"),
                flow("f2", "split", "a"),
                flow("f3", "split", "b"),
                flow("f4", "a", "join"),
                flow("f5", "b", "join"),
                flow("f6", "join", "end"),
            ],
        ))
        .await
        .unwrap();

    let view = engine.control.start_instance("par", vec![], None).await.unwrap();
    assert_eq!(view.record.status, InstanceStatus::Completed);
    let vars = var_map(&view);
    assert_eq!(vars["a"], VarValue::Integer(1));
    assert_eq!(vars["b"], VarValue::Integer(2));

    let trail = engine.control.get_audit_trail(view.record.id).unwrap();
    let ends = trail.iter().filter(|r| r.event_type == "END").count();
    assert_eq!(ends, 1, "exactly one END audit after the join");
}

// ── S4: user task claim + complete ────────────────────────────

#[tokio::test]
async fn s4_user_task_lifecycle() {
    let engine = engine();
    engine
        .control
        .deploy_definition(payload(
            "approval",
            vec![
                node("start", NodeKind::StartEvent),
                node("review", NodeKind::UserTask),
                node("end", NodeKind::EndEvent),
            ],
            vec![flow("f1", "start", "review"), flow("f2", "review", "end")],
        ))
        .await
        .unwrap();

    let view = engine
        .control
        .start_instance("approval", vec![], None)
        .await
        .unwrap();
    assert_eq!(view.record.status, InstanceStatus::Waiting);

    let tasks = engine
        .control
        .list_tasks(Some(view.record.id), Some(UserTaskStatus::Created), None)
        .unwrap();
    assert_eq!(tasks.len(), 1);

    let claimed = engine.control.claim_task(tasks[0].id, "alice").await.unwrap();
    assert_eq!(claimed.status, UserTaskStatus::Claimed);
    assert_eq!(claimed.assignee.as_deref(), Some("alice"));

    let done = engine
        .control
        .complete_task(
            tasks[0].id,
            vec![VariableWire {
                name: "approved".into(),
                value: serde_json::json!(true),
                datatype: "boolean".into(),
            }],
            Some("alice"),
        )
        .await
        .unwrap();
    assert_eq!(done.status, UserTaskStatus::Completed);

    let after = engine.control.get_instance(view.record.id).unwrap();
    assert_eq!(after.record.status, InstanceStatus::Completed);
    assert_eq!(var_map(&after)["approved"], VarValue::Boolean(true));

    // Completing again is a precondition failure.
    let err = engine
        .control
        .complete_task(tasks[0].id, vec![], None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PreconditionFailed(_)));
}

// ── S5: interrupting timer boundary preempts the activity ─────

#[tokio::test]
async fn s5_timer_boundary_interrupts_activity() {
    let engine = engine();
    let ran = Arc::new(AtomicI64::new(0));
    let ran_probe = ran.clone();
    engine
        .register_function_handler(
            "slow-work",
            None,
            Arc::new(FnHandler(move |_: &ProcessContext| {
                ran_probe.fetch_add(1, Ordering::SeqCst);
                Ok(writes(&[("worked", VarValue::Boolean(true))]))
            })),
        )
        .await;
    engine
        .register_function_handler(
            "escalate",
            None,
            Arc::new(FnHandler(|_: &ProcessContext| {
                Ok(writes(&[("escalated", VarValue::Boolean(true))]))
            })),
        )
        .await;

    let mut work = node("work", NodeKind::ServiceTask);
    work.topic = Some("slow-work".into());
    let mut boundary = node("deadline", NodeKind::BoundaryEvent);
    boundary.event = Some(EventKind::Timer);
    boundary.attached_to = Some("work".into());
    boundary.timer_definition = Some("PT0S".into());
    let mut after = node("after", NodeKind::ServiceTask);
    after.topic = Some("escalate".into());
    engine
        .control
        .deploy_definition(payload(
            "deadline",
            vec![
                node("start", NodeKind::StartEvent),
                work,
                boundary,
                after,
                node("end", NodeKind::EndEvent),
                node("end2", NodeKind::EndEvent),
            ],
            vec![
                flow("f1", "start", "work"),
                flow("f2", "work", "end"),
                flow("f3", "deadline", "after"),
                flow("f4", "after", "end2"),
            ],
        ))
        .await
        .unwrap();

    let view = engine
        .control
        .start_instance("deadline", vec![], None)
        .await
        .unwrap();

    assert_eq!(view.record.status, InstanceStatus::Completed);
    assert_eq!(ran.load(Ordering::SeqCst), 0, "handler must not run");
    let vars = var_map(&view);
    assert!(!vars.contains_key("worked"));
    assert_eq!(vars["escalated"], VarValue::Boolean(true));

    let trail = engine.control.get_audit_trail(view.record.id).unwrap();
    let fired = trail
        .iter()
        .position(|r| r.event_type == "BOUNDARY_FIRED")
        .expect("BOUNDARY_FIRED present");
    let cancelled = trail
        .iter()
        .position(|r| r.event_type == "CANCEL_ACTIVITY")
        .expect("CANCEL_ACTIVITY present");
    assert!(fired < cancelled, "boundary fires before the cancel");
}

// ── S6: parallel multi-instance with completion condition ─────

#[tokio::test]
async fn s6_multi_instance_completion_condition() {
    let engine = engine();
    engine
        .register_function_handler(
            "count",
            None,
            Arc::new(FnHandler(|ctx: &ProcessContext| {
                let current = match ctx.variables.get("count") {
                    Some(VarValue::Integer(n)) => *n,
                    _ => 0,
                };
                Ok(writes(&[("count", VarValue::Integer(current + 1))]))
            })),
        )
        .await;

    let mut mi = node("mi", NodeKind::ServiceTask);
    mi.topic = Some("count".into());
    mi.loop_characteristics = Some(LoopCharacteristics {
        sequential: false,
        cardinality: "5".into(),
        completion_condition: Some("${nrOfCompletedInstances >= 3}".into()),
    });
    engine
        .control
        .deploy_definition(payload(
            "batch",
            vec![node("start", NodeKind::StartEvent), mi, node("end", NodeKind::EndEvent)],
            vec![flow("f1", "start", "mi"), flow("f2", "mi", "end")],
        ))
        .await
        .unwrap();

    let view = engine
        .control
        .start_instance("batch", vec![int_var("count", 0)], None)
        .await
        .unwrap();

    assert_eq!(view.record.status, InstanceStatus::Completed);
    let count = match var_map(&view)["count"] {
        VarValue::Integer(n) => n,
        ref other => panic!("count mistyped: {other:?}"),
    };
    assert!((3..=5).contains(&count), "3 <= completions <= 5, got {count}");

    let trail = engine.control.get_audit_trail(view.record.id).unwrap();
    assert_eq!(
        trail.iter().filter(|r| r.event_type == "END").count(),
        1,
        "exactly one outgoing token"
    );
    assert!(trail.iter().any(|r| r.event_type == "MI_COMPLETED"));
}

// ── S7: call activity variable mapping ────────────────────────

#[tokio::test]
async fn s7_call_activity_variable_mapping() {
    let engine = engine();
    engine
        .register_function_handler(
            "approve",
            None,
            Arc::new(FnHandler(|ctx: &ProcessContext| {
                assert!(
                    !ctx.variables.contains_key("secret"),
                    "child must not see unmapped parent variables"
                );
                assert_eq!(
                    ctx.variables.get("orderId"),
                    Some(&VarValue::String("O-1".into()))
                );
                Ok(writes(&[
                    ("approvalCode", VarValue::String("A".into())),
                    ("childScratch", VarValue::String("internal".into())),
                ]))
            })),
        )
        .await;

    let mut child_work = node("approve", NodeKind::ServiceTask);
    child_work.topic = Some("approve".into());
    engine
        .control
        .deploy_definition(payload(
            "child",
            vec![
                node("cstart", NodeKind::StartEvent),
                child_work,
                node("cend", NodeKind::EndEvent),
            ],
            vec![flow("cf1", "cstart", "approve"), flow("cf2", "approve", "cend")],
        ))
        .await
        .unwrap();

    let mut call = node("call", NodeKind::CallActivity);
    call.called_element = Some("child".into());
    call.in_variables = Some(vec!["orderId".into()]);
    call.out_variables = Some(vec!["approvalCode".into()]);
    engine
        .control
        .deploy_definition(payload(
            "parent",
            vec![node("start", NodeKind::StartEvent), call, node("end", NodeKind::EndEvent)],
            vec![flow("f1", "start", "call"), flow("f2", "call", "end")],
        ))
        .await
        .unwrap();

    let view = engine
        .control
        .start_instance(
            "parent",
            vec![str_var("orderId", "O-1"), str_var("secret", "s")],
            None,
        )
        .await
        .unwrap();

    assert_eq!(view.record.status, InstanceStatus::Completed);
    let vars = var_map(&view);
    assert_eq!(vars["orderId"], VarValue::String("O-1".into()));
    assert_eq!(vars["secret"], VarValue::String("s".into()));
    assert_eq!(vars["approvalCode"], VarValue::String("A".into()));
    assert!(
        !vars.contains_key("childScratch"),
        "unmapped child variables must not leak"
    );

    let trail = engine.control.get_audit_trail(view.record.id).unwrap();
    assert!(trail.iter().any(|r| r.event_type == "CALL_STARTED"));
    assert!(trail.iter().any(|r| r.event_type == "CALL_COMPLETED"));
}

// ── Deploy round trip & retire ────────────────────────────────

#[tokio::test]
async fn deploy_get_round_trip_ignores_layout() {
    let engine = engine();
    let mut original = payload(
        "rt",
        vec![
            node("start", NodeKind::StartEvent),
            node("t", NodeKind::ManualTask),
            node("end", NodeKind::EndEvent),
        ],
        vec![flow("f1", "start", "t"), flow("f2", "t", "end")],
    );
    original.diagram = Some("<bpmndi:BPMNDiagram/>".to_string());
    engine.control.deploy_definition(original.clone()).await.unwrap();

    let (summary, loaded) = engine.control.get_definition("rt").await.unwrap();
    assert_eq!(summary.status, "active");

    let mut a = serde_json::to_value(&original).unwrap();
    let mut b = serde_json::to_value(&loaded).unwrap();
    a.as_object_mut().unwrap().remove("diagram");
    b.as_object_mut().unwrap().remove("diagram");
    assert_eq!(a, b, "node/flow graph survives the round trip");
}

#[tokio::test]
async fn retired_definition_rejects_new_instances() {
    let engine = engine();
    engine
        .control
        .deploy_definition(payload(
            "old",
            vec![node("start", NodeKind::StartEvent), node("end", NodeKind::EndEvent)],
            vec![flow("f1", "start", "end")],
        ))
        .await
        .unwrap();
    engine.control.retire_definition("old").await.unwrap();

    let err = engine
        .control
        .start_instance("old", vec![], None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PreconditionFailed(_)));
}

// ── Stop idempotence ──────────────────────────────────────────

#[tokio::test]
async fn stop_twice_is_a_noop() {
    let engine = engine();
    engine
        .control
        .deploy_definition(payload(
            "stoppable",
            vec![
                node("start", NodeKind::StartEvent),
                node("wait", NodeKind::UserTask),
                node("end", NodeKind::EndEvent),
            ],
            vec![flow("f1", "start", "wait"), flow("f2", "wait", "end")],
        ))
        .await
        .unwrap();

    let view = engine
        .control
        .start_instance("stoppable", vec![], None)
        .await
        .unwrap();
    let stopped = engine
        .control
        .stop_instance(view.record.id, "operator request")
        .await
        .unwrap();
    assert_eq!(stopped.record.status, InstanceStatus::Terminated);
    assert!(stopped.current_nodes.is_empty());

    let again = engine
        .control
        .stop_instance(view.record.id, "again")
        .await
        .unwrap();
    assert_eq!(again.record.status, InstanceStatus::Terminated);
}

// ── Timer catch event via the poller ──────────────────────────

#[tokio::test]
async fn timer_catch_event_fires_on_poll() {
    let engine = engine();
    let mut wait = node("wait", NodeKind::IntermediateCatchEvent);
    wait.event = Some(EventKind::Timer);
    wait.timer_definition = Some("PT0S".into());
    engine
        .control
        .deploy_definition(payload(
            "timed",
            vec![node("start", NodeKind::StartEvent), wait, node("end", NodeKind::EndEvent)],
            vec![flow("f1", "start", "wait"), flow("f2", "wait", "end")],
        ))
        .await
        .unwrap();

    let view = engine.control.start_instance("timed", vec![], None).await.unwrap();
    assert_eq!(view.record.status, InstanceStatus::Waiting);

    let fired = engine.control.run_due_timers(Utc::now()).await.unwrap();
    assert_eq!(fired, 1);

    let after = engine.control.get_instance(view.record.id).unwrap();
    assert_eq!(after.record.status, InstanceStatus::Completed);
    let trail = engine.control.get_audit_trail(view.record.id).unwrap();
    assert!(trail.iter().any(|r| r.event_type == "TIMER_SCHEDULED"));
    assert!(trail.iter().any(|r| r.event_type == "TIMER_FIRED"));
}

// ── Event-based gateway race ──────────────────────────────────

#[tokio::test]
async fn event_gateway_first_message_wins() {
    let engine = engine();
    let mut catch_yes = node("yes", NodeKind::IntermediateCatchEvent);
    catch_yes.event = Some(EventKind::Message);
    catch_yes.message_name = Some("approved".into());
    let mut catch_no = node("no", NodeKind::IntermediateCatchEvent);
    catch_no.event = Some(EventKind::Message);
    catch_no.message_name = Some("rejected".into());
    engine
        .control
        .deploy_definition(payload(
            "race",
            vec![
                node("start", NodeKind::StartEvent),
                node("gw", NodeKind::EventBasedGateway),
                catch_yes,
                catch_no,
                node("end_yes", NodeKind::EndEvent),
                node("end_no", NodeKind::EndEvent),
            ],
            vec![
                flow("f1", "start", "gw"),
                flow("f2", "gw", "yes"),
                flow("f3", "gw", "no"),
                flow("f4", "yes", "end_yes"),
                flow("f5", "no", "end_no"),
            ],
        ))
        .await
        .unwrap();

    let view = engine.control.start_instance("race", vec![], None).await.unwrap();
    assert_eq!(view.record.status, InstanceStatus::Waiting);

    engine
        .control
        .send_message("approved", &view.record.id.to_string(), vec![])
        .await
        .unwrap();

    let after = engine.control.get_instance(view.record.id).unwrap();
    assert_eq!(after.record.status, InstanceStatus::Completed);
    assert!(after.current_nodes.is_empty(), "losing arms are cancelled");

    // The late loser message finds nothing to resume.
    engine
        .control
        .send_message("rejected", &view.record.id.to_string(), vec![])
        .await
        .unwrap();
    let still = engine.control.get_instance(view.record.id).unwrap();
    assert_eq!(still.record.status, InstanceStatus::Completed);
}

// ── Message correlation: at most one subscription per instance ─

#[tokio::test]
async fn message_correlation_targets_one_instance() {
    let engine = engine();
    let mut recv = node("recv", NodeKind::ReceiveTask);
    recv.message_name = Some("payment".into());
    engine
        .control
        .deploy_definition(payload(
            "waiter",
            vec![node("start", NodeKind::StartEvent), recv, node("end", NodeKind::EndEvent)],
            vec![flow("f1", "start", "recv"), flow("f2", "recv", "end")],
        ))
        .await
        .unwrap();

    let first = engine.control.start_instance("waiter", vec![], None).await.unwrap();
    let second = engine.control.start_instance("waiter", vec![], None).await.unwrap();

    engine
        .control
        .send_message("payment", &first.record.id.to_string(), vec![str_var("ref", "p-1")])
        .await
        .unwrap();

    let one = engine.control.get_instance(first.record.id).unwrap();
    let two = engine.control.get_instance(second.record.id).unwrap();
    assert_eq!(one.record.status, InstanceStatus::Completed);
    assert_eq!(two.record.status, InstanceStatus::Waiting);
    assert_eq!(var_map(&one)["ref"], VarValue::String("p-1".into()));
}

// ── Error boundary escalation ─────────────────────────────────

#[tokio::test]
async fn handler_failure_routes_through_error_boundary() {
    let engine = engine();
    engine
        .register_function_handler(
            "flaky",
            None,
            Arc::new(FnHandler(|_: &ProcessContext| {
                Err(EngineError::HandlerFatal {
                    topic: "flaky".into(),
                    message: "downstream rejected".into(),
                })
            })),
        )
        .await;
    engine
        .register_function_handler(
            "recover",
            None,
            Arc::new(FnHandler(|_: &ProcessContext| {
                Ok(writes(&[("recovered", VarValue::Boolean(true))]))
            })),
        )
        .await;

    let mut work = node("work", NodeKind::ServiceTask);
    work.topic = Some("flaky".into());
    let mut boundary = node("catcher", NodeKind::BoundaryEvent);
    boundary.event = Some(EventKind::Error);
    boundary.attached_to = Some("work".into());
    let mut fix = node("fix", NodeKind::ServiceTask);
    fix.topic = Some("recover".into());
    engine
        .control
        .deploy_definition(payload(
            "guarded",
            vec![
                node("start", NodeKind::StartEvent),
                work,
                boundary,
                fix,
                node("end", NodeKind::EndEvent),
                node("end2", NodeKind::EndEvent),
            ],
            vec![
                flow("f1", "start", "work"),
                flow("f2", "work", "end"),
                flow("f3", "catcher", "fix"),
                flow("f4", "fix", "end2"),
            ],
        ))
        .await
        .unwrap();

    let view = engine.control.start_instance("guarded", vec![], None).await.unwrap();
    assert_eq!(view.record.status, InstanceStatus::Completed);
    assert_eq!(var_map(&view)["recovered"], VarValue::Boolean(true));

    let trail = engine.control.get_audit_trail(view.record.id).unwrap();
    assert!(trail.iter().any(|r| r.event_type == "ERROR"));
    assert!(trail.iter().any(|r| r.event_type == "BOUNDARY_FIRED"));
}

#[tokio::test]
async fn unhandled_failure_errors_the_instance() {
    let engine = engine();
    engine
        .register_function_handler(
            "flaky",
            None,
            Arc::new(FnHandler(|_: &ProcessContext| {
                Err(EngineError::HandlerFatal {
                    topic: "flaky".into(),
                    message: "boom".into(),
                })
            })),
        )
        .await;
    let mut work = node("work", NodeKind::ServiceTask);
    work.topic = Some("flaky".into());
    engine
        .control
        .deploy_definition(payload(
            "fragile",
            vec![node("start", NodeKind::StartEvent), work, node("end", NodeKind::EndEvent)],
            vec![flow("f1", "start", "work"), flow("f2", "work", "end")],
        ))
        .await
        .unwrap();

    let view = engine.control.start_instance("fragile", vec![], None).await.unwrap();
    assert_eq!(view.record.status, InstanceStatus::Error);
}

// ── Embedded subprocess ───────────────────────────────────────

#[tokio::test]
async fn embedded_subprocess_runs_and_exits() {
    let engine = engine();
    engine
        .register_function_handler(
            "inner-work",
            None,
            Arc::new(FnHandler(|_: &ProcessContext| {
                Ok(writes(&[("inner", VarValue::Boolean(true))]))
            })),
        )
        .await;

    let sub = node("sub", NodeKind::EmbeddedSubprocess);
    let mut inner_start = node("istart", NodeKind::StartEvent);
    inner_start.parent_scope = Some("sub".into());
    let mut inner_task = node("itask", NodeKind::ServiceTask);
    inner_task.parent_scope = Some("sub".into());
    inner_task.topic = Some("inner-work".into());
    let mut inner_end = node("iend", NodeKind::EndEvent);
    inner_end.parent_scope = Some("sub".into());
    engine
        .control
        .deploy_definition(payload(
            "nested",
            vec![
                node("start", NodeKind::StartEvent),
                sub,
                inner_start,
                inner_task,
                inner_end,
                node("end", NodeKind::EndEvent),
            ],
            vec![
                flow("f1", "start", "sub"),
                flow("if1", "istart", "itask"),
                flow("if2", "itask", "iend"),
                flow("f2", "sub", "end"),
            ],
        ))
        .await
        .unwrap();

    let view = engine.control.start_instance("nested", vec![], None).await.unwrap();
    assert_eq!(view.record.status, InstanceStatus::Completed);
    assert_eq!(var_map(&view)["inner"], VarValue::Boolean(true));

    let trail = engine.control.get_audit_trail(view.record.id).unwrap();
    assert!(trail.iter().any(|r| r.event_type == "SUBPROCESS_ENTER"));
    assert!(trail.iter().any(|r| r.event_type == "SUBPROCESS_EXIT"));
}

// ── Inclusive gateway ─────────────────────────────────────────

#[tokio::test]
async fn inclusive_gateway_takes_all_matching_branches() {
    let engine = engine();
    engine
        .register_function_handler(
            "mark-x",
            None,
            Arc::new(FnHandler(|_: &ProcessContext| {
                Ok(writes(&[("x_done", VarValue::Boolean(true))]))
            })),
        )
        .await;
    engine
        .register_function_handler(
            "mark-y",
            None,
            Arc::new(FnHandler(|_: &ProcessContext| {
                Ok(writes(&[("y_done", VarValue::Boolean(true))]))
            })),
        )
        .await;

    let mut x = node("x", NodeKind::ServiceTask);
    x.topic = Some("mark-x".into());
    let mut y = node("y", NodeKind::ServiceTask);
    y.topic = Some("mark-y".into());
    engine
        .control
        .deploy_definition(payload(
            "incl",
            vec![
                node("start", NodeKind::StartEvent),
                node("split", NodeKind::InclusiveGateway),
                x,
                y,
                node("join", NodeKind::InclusiveGateway),
                node("end", NodeKind::EndEvent),
            ],
            vec![
                flow("f1", "start", "split"),
                conditional("fx", "split", "x", "${amount >= 100}"),
                conditional("fy", "split", "y", "${amount >= 10}"),
                flow("f4", "x", "join"),
                flow("f5", "y", "join"),
                flow("f6", "join", "end"),
            ],
        ))
        .await
        .unwrap();

    let both = engine
        .control
        .start_instance("incl", vec![int_var("amount", 150)], None)
        .await
        .unwrap();
    assert_eq!(both.record.status, InstanceStatus::Completed);
    let vars = var_map(&both);
    assert_eq!(vars["x_done"], VarValue::Boolean(true));
    assert_eq!(vars["y_done"], VarValue::Boolean(true));

    let one = engine
        .control
        .start_instance("incl", vec![int_var("amount", 50)], None)
        .await
        .unwrap();
    assert_eq!(one.record.status, InstanceStatus::Completed);
    let vars = var_map(&one);
    assert!(!vars.contains_key("x_done"));
    assert_eq!(vars["y_done"], VarValue::Boolean(true));
}

// ── Snapshot persistence across restart ───────────────────────

#[tokio::test]
async fn state_survives_restart_from_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let instance_id = {
        let engine =
            BpmnGraphEngine::open(EngineConfig::default(), Some(dir.path().to_path_buf()))
                .unwrap();
        engine
            .control
            .deploy_definition(payload(
                "durable",
                vec![
                    node("start", NodeKind::StartEvent),
                    node("t", NodeKind::ManualTask),
                    node("end", NodeKind::EndEvent),
                ],
                vec![flow("f1", "start", "t"), flow("f2", "t", "end")],
            ))
            .await
            .unwrap();
        let view = engine
            .control
            .start_instance("durable", vec![int_var("n", 7)], None)
            .await
            .unwrap();
        view.record.id
    };

    let reopened =
        BpmnGraphEngine::open(EngineConfig::default(), Some(dir.path().to_path_buf())).unwrap();
    let view = reopened.control.get_instance(instance_id).unwrap();
    assert_eq!(view.record.status, InstanceStatus::Completed);
    assert_eq!(var_map(&view)["n"], VarValue::Integer(7));
    let trail = reopened.control.get_audit_trail(instance_id).unwrap();
    assert!(trail.iter().any(|r| r.event_type == "MANUAL_COMPLETE"));
}

// ── Script tasks are skipped by default ───────────────────────

#[tokio::test]
async fn script_task_disabled_by_default() {
    let engine = engine();
    let mut script = node("calc", NodeKind::ScriptTask);
    script.script = Some("x = x + 1".into());
    engine
        .control
        .deploy_definition(payload(
            "scripted",
            vec![node("start", NodeKind::StartEvent), script, node("end", NodeKind::EndEvent)],
            vec![flow("f1", "start", "calc"), flow("f2", "calc", "end")],
        ))
        .await
        .unwrap();

    let view = engine
        .control
        .start_instance("scripted", vec![int_var("x", 1)], None)
        .await
        .unwrap();
    assert_eq!(view.record.status, InstanceStatus::Completed);
    // The script did not run.
    assert_eq!(var_map(&view)["x"], VarValue::Integer(1));
    let trail = engine.control.get_audit_trail(view.record.id).unwrap();
    assert!(trail.iter().any(|r| r.event_type == "SCRIPT_SKIPPED"));
}

// ── queryGraph exposes read-only SPARQL ───────────────────────

#[tokio::test]
async fn query_graph_reads_instance_state() {
    let engine = engine();
    engine
        .control
        .deploy_definition(payload(
            "q",
            vec![node("start", NodeKind::StartEvent), node("end", NodeKind::EndEvent)],
            vec![flow("f1", "start", "end")],
        ))
        .await
        .unwrap();
    let view = engine
        .control
        .start_instance("q", vec![int_var("n", 3)], None)
        .await
        .unwrap();

    let ask = format!(
        "ASK {{ <http://bpmn-graph.dev/instance/{}> <http://bpmn-graph.dev/var/n> ?v . FILTER(?v = 3) }}",
        view.record.id
    );
    match engine.control.query_graph("inst", &ask).unwrap() {
        bpmn_graph_core::control::QueryResultWire::Boolean { value } => assert!(value),
        other => panic!("expected boolean result, got {other:?}"),
    }

    let err = engine.control.query_graph("nope", "ASK {}").unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
}

// ── Event subprocess triggered by message ─────────────────────

#[tokio::test]
async fn interrupting_event_subprocess_cancels_siblings() {
    let engine = engine();
    engine
        .register_function_handler(
            "handle-abort",
            None,
            Arc::new(FnHandler(|_: &ProcessContext| {
                Ok(writes(&[("handled", VarValue::Boolean(true))]))
            })),
        )
        .await;

    let mut esp = node("esp", NodeKind::EventSubprocess);
    esp.parent_scope = None;
    let mut esp_start = node("esp_start", NodeKind::StartEvent);
    esp_start.parent_scope = Some("esp".into());
    esp_start.event = Some(EventKind::Message);
    esp_start.message_name = Some("abort".into());
    let mut esp_task = node("esp_task", NodeKind::ServiceTask);
    esp_task.parent_scope = Some("esp".into());
    esp_task.topic = Some("handle-abort".into());
    let mut esp_end = node("esp_end", NodeKind::EndEvent);
    esp_end.parent_scope = Some("esp".into());

    engine
        .control
        .deploy_definition(payload(
            "abortable",
            vec![
                node("start", NodeKind::StartEvent),
                node("wait", NodeKind::UserTask),
                node("end", NodeKind::EndEvent),
                esp,
                esp_start,
                esp_task,
                esp_end,
            ],
            vec![
                flow("f1", "start", "wait"),
                flow("f2", "wait", "end"),
                flow("ef1", "esp_start", "esp_task"),
                flow("ef2", "esp_task", "esp_end"),
            ],
        ))
        .await
        .unwrap();

    let view = engine
        .control
        .start_instance("abortable", vec![], None)
        .await
        .unwrap();
    assert_eq!(view.record.status, InstanceStatus::Waiting);
    let open = engine
        .control
        .list_tasks(Some(view.record.id), Some(UserTaskStatus::Created), None)
        .unwrap();
    assert_eq!(open.len(), 1);

    engine
        .control
        .send_message("abort", &view.record.id.to_string(), vec![])
        .await
        .unwrap();

    let after = engine.control.get_instance(view.record.id).unwrap();
    assert_eq!(after.record.status, InstanceStatus::Completed);
    assert_eq!(var_map(&after)["handled"], VarValue::Boolean(true));
    // The interrupted user task is gone.
    let open = engine
        .control
        .list_tasks(Some(view.record.id), None, None)
        .unwrap();
    assert!(open.is_empty());
}

// ── Signal broadcast fans out across instances ────────────────

#[tokio::test]
async fn signal_broadcast_resumes_every_subscription() {
    let engine = engine();
    let mut catch = node("catch", NodeKind::IntermediateCatchEvent);
    catch.event = Some(EventKind::Signal);
    catch.signal_name = Some("go".into());
    engine
        .control
        .deploy_definition(payload(
            "listener",
            vec![node("start", NodeKind::StartEvent), catch, node("end", NodeKind::EndEvent)],
            vec![flow("f1", "start", "catch"), flow("f2", "catch", "end")],
        ))
        .await
        .unwrap();

    let one = engine.control.start_instance("listener", vec![], None).await.unwrap();
    let two = engine.control.start_instance("listener", vec![], None).await.unwrap();
    assert_eq!(one.record.status, InstanceStatus::Waiting);
    assert_eq!(two.record.status, InstanceStatus::Waiting);

    engine
        .control
        .broadcast_signal("go", vec![str_var("released_by", "ops")])
        .await
        .unwrap();

    for id in [one.record.id, two.record.id] {
        let view = engine.control.get_instance(id).unwrap();
        assert_eq!(view.record.status, InstanceStatus::Completed);
        assert_eq!(var_map(&view)["released_by"], VarValue::String("ops".into()));
    }
}

// ── throw_error with no handler errors the instance ───────────

#[tokio::test]
async fn throw_error_without_boundary_errors_instance() {
    let engine = engine();
    engine
        .control
        .deploy_definition(payload(
            "unguarded",
            vec![
                node("start", NodeKind::StartEvent),
                node("wait", NodeKind::UserTask),
                node("end", NodeKind::EndEvent),
            ],
            vec![flow("f1", "start", "wait"), flow("f2", "wait", "end")],
        ))
        .await
        .unwrap();

    let view = engine
        .control
        .start_instance("unguarded", vec![], None)
        .await
        .unwrap();
    let after = engine
        .control
        .throw_error(view.record.id, "E_BUSINESS", "manual escalation")
        .await
        .unwrap();
    assert_eq!(after.record.status, InstanceStatus::Error);

    let trail = engine.control.get_audit_trail(view.record.id).unwrap();
    assert!(trail
        .iter()
        .any(|r| r.event_type == "ERROR" && r.details.as_deref().unwrap_or("").contains("E_BUSINESS")));

    // Further operations on a terminal instance are rejected.
    let err = engine
        .control
        .throw_error(view.record.id, "E2", "again")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PreconditionFailed(_)));
}
