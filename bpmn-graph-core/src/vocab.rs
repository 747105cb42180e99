//! RDF vocabulary: namespace IRIs and predicate constants.
//!
//! Every triple the engine writes uses a predicate from this module, so the
//! full graph schema is auditable in one place.

use oxigraph::model::{NamedNode, NamedNodeRef};

// ── Named graphs ──────────────────────────────────────────────

pub const GRAPH_DEFS: NamedNodeRef<'_> =
    NamedNodeRef::new_unchecked("http://bpmn-graph.dev/graph/defs");
pub const GRAPH_INST: NamedNodeRef<'_> =
    NamedNodeRef::new_unchecked("http://bpmn-graph.dev/graph/inst");
pub const GRAPH_TASKS: NamedNodeRef<'_> =
    NamedNodeRef::new_unchecked("http://bpmn-graph.dev/graph/tasks");
pub const GRAPH_LOG: NamedNodeRef<'_> =
    NamedNodeRef::new_unchecked("http://bpmn-graph.dev/graph/log");
pub const GRAPH_TIMERS: NamedNodeRef<'_> =
    NamedNodeRef::new_unchecked("http://bpmn-graph.dev/graph/timers");

/// All named graphs, in snapshot order.
pub const ALL_GRAPHS: [NamedNodeRef<'static>; 5] =
    [GRAPH_DEFS, GRAPH_INST, GRAPH_TASKS, GRAPH_LOG, GRAPH_TIMERS];

/// Snapshot file stem for a named graph (`defs` -> `defs.nt`).
pub fn graph_file_stem(graph: NamedNodeRef<'_>) -> &'static str {
    match graph.as_str() {
        "http://bpmn-graph.dev/graph/defs" => "defs",
        "http://bpmn-graph.dev/graph/inst" => "inst",
        "http://bpmn-graph.dev/graph/tasks" => "tasks",
        "http://bpmn-graph.dev/graph/log" => "log",
        "http://bpmn-graph.dev/graph/timers" => "timers",
        _ => "other",
    }
}

// ── Namespaces ────────────────────────────────────────────────

pub const NS_DEF: &str = "http://bpmn-graph.dev/def/";
pub const NS_INSTANCE: &str = "http://bpmn-graph.dev/instance/";
pub const NS_TASK: &str = "http://bpmn-graph.dev/task/";
pub const NS_TIMER: &str = "http://bpmn-graph.dev/timer/";
pub const NS_AUDIT: &str = "http://bpmn-graph.dev/audit/";
pub const NS_VAR: &str = "http://bpmn-graph.dev/var/";
pub const NS_META: &str = "http://bpmn-graph.dev/meta/";

pub const RDF_TYPE: NamedNodeRef<'_> =
    NamedNodeRef::new_unchecked("http://www.w3.org/1999/02/22-rdf-syntax-ns#type");

// ── Definition predicates (defs graph) ────────────────────────

pub mod def {
    use super::named;
    use oxigraph::model::NamedNode;

    pub fn class_definition() -> NamedNode {
        named("http://bpmn-graph.dev/meta/ProcessDefinition")
    }
    pub fn name() -> NamedNode {
        named("http://bpmn-graph.dev/meta/name")
    }
    pub fn version() -> NamedNode {
        named("http://bpmn-graph.dev/meta/version")
    }
    pub fn status() -> NamedNode {
        named("http://bpmn-graph.dev/meta/status")
    }
    pub fn deployed_at() -> NamedNode {
        named("http://bpmn-graph.dev/meta/deployedAt")
    }
    pub fn description() -> NamedNode {
        named("http://bpmn-graph.dev/meta/description")
    }
    pub fn diagram() -> NamedNode {
        named("http://bpmn-graph.dev/meta/diagram")
    }
    /// The canonical JSON record set of the definition, stored verbatim so a
    /// deploy/get round trip is lossless.
    pub fn payload() -> NamedNode {
        named("http://bpmn-graph.dev/meta/payload")
    }
    pub fn has_node() -> NamedNode {
        named("http://bpmn-graph.dev/meta/hasNode")
    }
    pub fn has_flow() -> NamedNode {
        named("http://bpmn-graph.dev/meta/hasFlow")
    }
    pub fn node_kind() -> NamedNode {
        named("http://bpmn-graph.dev/meta/nodeKind")
    }
    pub fn flow_source() -> NamedNode {
        named("http://bpmn-graph.dev/meta/sourceRef")
    }
    pub fn flow_target() -> NamedNode {
        named("http://bpmn-graph.dev/meta/targetRef")
    }
    pub fn flow_condition() -> NamedNode {
        named("http://bpmn-graph.dev/meta/conditionBody")
    }
}

// ── Instance predicates (inst graph) ──────────────────────────

pub mod inst {
    use super::named;
    use oxigraph::model::NamedNode;

    pub fn class_instance() -> NamedNode {
        named("http://bpmn-graph.dev/meta/ProcessInstance")
    }
    pub fn class_token() -> NamedNode {
        named("http://bpmn-graph.dev/meta/Token")
    }
    pub fn definition() -> NamedNode {
        named("http://bpmn-graph.dev/meta/definition")
    }
    pub fn status() -> NamedNode {
        named("http://bpmn-graph.dev/meta/status")
    }
    pub fn created_at() -> NamedNode {
        named("http://bpmn-graph.dev/meta/createdAt")
    }
    pub fn updated_at() -> NamedNode {
        named("http://bpmn-graph.dev/meta/updatedAt")
    }
    pub fn completed_at() -> NamedNode {
        named("http://bpmn-graph.dev/meta/completedAt")
    }
    pub fn parent_instance() -> NamedNode {
        named("http://bpmn-graph.dev/meta/parentInstance")
    }
    pub fn parent_call_node() -> NamedNode {
        named("http://bpmn-graph.dev/meta/parentCallNode")
    }
    pub fn has_token() -> NamedNode {
        named("http://bpmn-graph.dev/meta/hasToken")
    }
    pub fn belongs_to() -> NamedNode {
        named("http://bpmn-graph.dev/meta/belongsTo")
    }
    pub fn current_node() -> NamedNode {
        named("http://bpmn-graph.dev/meta/currentNode")
    }
    pub fn scope_path() -> NamedNode {
        named("http://bpmn-graph.dev/meta/scopePath")
    }
    pub fn loop_index() -> NamedNode {
        named("http://bpmn-graph.dev/meta/loopIndex")
    }
    pub fn wait_kind() -> NamedNode {
        named("http://bpmn-graph.dev/meta/waitKind")
    }
    pub fn message_name() -> NamedNode {
        named("http://bpmn-graph.dev/meta/messageName")
    }
    pub fn correlation_key() -> NamedNode {
        named("http://bpmn-graph.dev/meta/correlationKey")
    }
    pub fn signal_name() -> NamedNode {
        named("http://bpmn-graph.dev/meta/signalName")
    }
    pub fn child_instance() -> NamedNode {
        named("http://bpmn-graph.dev/meta/childInstance")
    }
    pub fn callback_id() -> NamedNode {
        named("http://bpmn-graph.dev/meta/callbackId")
    }
    pub fn timer_job() -> NamedNode {
        named("http://bpmn-graph.dev/meta/timerJob")
    }
    /// Gateway-arm subscriptions point back at the token parked on the
    /// event-based gateway itself.
    pub fn gateway_token() -> NamedNode {
        named("http://bpmn-graph.dev/meta/gatewayToken")
    }
    pub fn user_task() -> NamedNode {
        named("http://bpmn-graph.dev/meta/userTask")
    }
    /// Completed activity eligible for compensation, recorded per scope.
    pub fn compensable() -> NamedNode {
        named("http://bpmn-graph.dev/meta/compensable")
    }
    pub fn audit_seq() -> NamedNode {
        named("http://bpmn-graph.dev/meta/auditSeq")
    }
}

// ── Task predicates (tasks graph) ─────────────────────────────

pub mod task {
    use super::named;
    use oxigraph::model::NamedNode;

    pub fn class_user_task() -> NamedNode {
        named("http://bpmn-graph.dev/meta/UserTask")
    }
    pub fn instance() -> NamedNode {
        named("http://bpmn-graph.dev/meta/taskInstance")
    }
    pub fn node() -> NamedNode {
        named("http://bpmn-graph.dev/meta/taskNode")
    }
    pub fn status() -> NamedNode {
        named("http://bpmn-graph.dev/meta/taskStatus")
    }
    pub fn assignee() -> NamedNode {
        named("http://bpmn-graph.dev/meta/assignee")
    }
    pub fn created_at() -> NamedNode {
        named("http://bpmn-graph.dev/meta/taskCreatedAt")
    }
    pub fn claimed_at() -> NamedNode {
        named("http://bpmn-graph.dev/meta/claimedAt")
    }
    pub fn completed_at() -> NamedNode {
        named("http://bpmn-graph.dev/meta/taskCompletedAt")
    }
}

// ── Timer predicates (timers graph) ───────────────────────────

pub mod timer {
    use super::named;
    use oxigraph::model::NamedNode;

    pub fn class_timer_job() -> NamedNode {
        named("http://bpmn-graph.dev/meta/TimerJob")
    }
    pub fn instance() -> NamedNode {
        named("http://bpmn-graph.dev/meta/timerInstance")
    }
    pub fn token() -> NamedNode {
        named("http://bpmn-graph.dev/meta/timerToken")
    }
    pub fn node() -> NamedNode {
        named("http://bpmn-graph.dev/meta/timerNode")
    }
    pub fn due_at() -> NamedNode {
        named("http://bpmn-graph.dev/meta/dueAt")
    }
    pub fn status() -> NamedNode {
        named("http://bpmn-graph.dev/meta/timerStatus")
    }
    pub fn lease_holder() -> NamedNode {
        named("http://bpmn-graph.dev/meta/leaseHolder")
    }
    pub fn lease_expires_at() -> NamedNode {
        named("http://bpmn-graph.dev/meta/leaseExpiresAt")
    }
    pub fn attempts() -> NamedNode {
        named("http://bpmn-graph.dev/meta/attempts")
    }
    /// Remaining fires for cycle timers (`R<n>/PT...`), absent otherwise.
    pub fn cycle_remaining() -> NamedNode {
        named("http://bpmn-graph.dev/meta/cycleRemaining")
    }
}

// ── Audit predicates (log graph) ──────────────────────────────

pub mod audit {
    use super::named;
    use oxigraph::model::NamedNode;

    pub fn class_event() -> NamedNode {
        named("http://bpmn-graph.dev/meta/AuditEvent")
    }
    pub fn instance() -> NamedNode {
        named("http://bpmn-graph.dev/meta/auditInstance")
    }
    pub fn node() -> NamedNode {
        named("http://bpmn-graph.dev/meta/auditNode")
    }
    pub fn event_type() -> NamedNode {
        named("http://bpmn-graph.dev/meta/eventType")
    }
    pub fn timestamp() -> NamedNode {
        named("http://bpmn-graph.dev/meta/timestamp")
    }
    pub fn actor() -> NamedNode {
        named("http://bpmn-graph.dev/meta/actor")
    }
    pub fn details() -> NamedNode {
        named("http://bpmn-graph.dev/meta/details")
    }
    pub fn seq() -> NamedNode {
        named("http://bpmn-graph.dev/meta/seq")
    }
}

// ── IRI builders ──────────────────────────────────────────────

fn named(iri: &str) -> NamedNode {
    NamedNode::new_unchecked(iri)
}

/// Percent-encode the characters that would make a caller-supplied id an
/// invalid IRI segment.
fn encode_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' | '~' => out.push(c),
            _ => {
                let mut buf = [0u8; 4];
                for b in c.encode_utf8(&mut buf).bytes() {
                    out.push_str(&format!("%{b:02X}"));
                }
            }
        }
    }
    out
}

pub fn definition_iri(def_id: &str) -> NamedNode {
    named(&format!("{NS_DEF}{}", encode_segment(def_id)))
}

pub fn node_iri(def_id: &str, node_id: &str) -> NamedNode {
    named(&format!(
        "{NS_DEF}{}/node/{}",
        encode_segment(def_id),
        encode_segment(node_id)
    ))
}

pub fn flow_iri(def_id: &str, flow_id: &str) -> NamedNode {
    named(&format!(
        "{NS_DEF}{}/flow/{}",
        encode_segment(def_id),
        encode_segment(flow_id)
    ))
}

pub fn instance_iri(id: uuid::Uuid) -> NamedNode {
    named(&format!("{NS_INSTANCE}{id}"))
}

pub fn token_iri(id: uuid::Uuid) -> NamedNode {
    named(&format!("{NS_INSTANCE}token/{id}"))
}

pub fn scope_iri(id: uuid::Uuid) -> NamedNode {
    named(&format!("{NS_INSTANCE}scope/{id}"))
}

pub fn task_iri(id: uuid::Uuid) -> NamedNode {
    named(&format!("{NS_TASK}{id}"))
}

pub fn timer_iri(id: uuid::Uuid) -> NamedNode {
    named(&format!("{NS_TIMER}{id}"))
}

pub fn audit_iri(id: uuid::Uuid) -> NamedNode {
    named(&format!("{NS_AUDIT}{id}"))
}

/// Predicate for a named process variable: `var:<name>`.
pub fn variable_predicate(name: &str) -> NamedNode {
    named(&format!("{NS_VAR}{}", encode_segment(name)))
}

/// Reverse of [`variable_predicate`]: the variable name, if the IRI is in
/// the var namespace.
pub fn variable_name_from_iri(iri: &str) -> Option<String> {
    iri.strip_prefix(NS_VAR).map(decode_segment)
}

fn decode_segment(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(b) = u8::from_str_radix(&raw[i + 1..i + 3], 16) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Extract the trailing UUID of an entity IRI minted by this module.
pub fn uuid_from_iri(iri: &str) -> Option<uuid::Uuid> {
    iri.rsplit('/').next().and_then(|s| uuid::Uuid::parse_str(s).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variable_predicate_round_trip() {
        let p = variable_predicate("order total");
        assert_eq!(p.as_str(), "http://bpmn-graph.dev/var/order%20total");
        assert_eq!(
            variable_name_from_iri(p.as_str()).as_deref(),
            Some("order total")
        );
    }

    #[test]
    fn uuid_extraction() {
        let id = uuid::Uuid::now_v7();
        assert_eq!(uuid_from_iri(token_iri(id).as_str()), Some(id));
        assert_eq!(uuid_from_iri(instance_iri(id).as_str()), Some(id));
    }

    #[test]
    fn node_iri_encodes_ids() {
        let n = node_iri("order flow", "task#1");
        assert!(n.as_str().contains("order%20flow"));
        assert!(n.as_str().contains("task%231"));
    }
}
