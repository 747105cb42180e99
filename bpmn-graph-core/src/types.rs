//! Runtime state records: instances, tokens, tasks, timers, variables.
//!
//! These are the typed views of what lives in the `inst`, `tasks` and
//! `timers` graphs. The graph is the source of truth; records are loaded,
//! mutated through the store helpers, and never cached across lock scopes.

use chrono::{DateTime, SecondsFormat, Utc};
use oxigraph::model::vocab::xsd;
use oxigraph::model::{Literal, Term};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Variable values ───────────────────────────────────────────

/// A typed process variable value. The variants mirror the XSD datatypes
/// the wire format accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "datatype", content = "value", rename_all = "camelCase")]
pub enum VarValue {
    String(String),
    Integer(i64),
    Decimal(f64),
    Boolean(bool),
    DateTime(DateTime<Utc>),
}

impl VarValue {
    pub fn datatype_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Integer(_) => "integer",
            Self::Decimal(_) => "decimal",
            Self::Boolean(_) => "boolean",
            Self::DateTime(_) => "dateTime",
        }
    }

    /// Size of the lexical form, for the variable size limit.
    pub fn lexical_len(&self) -> usize {
        match self {
            Self::String(s) => s.len(),
            _ => 0,
        }
    }

    pub fn as_literal(&self) -> Literal {
        match self {
            Self::String(s) => Literal::new_simple_literal(s.clone()),
            Self::Integer(n) => Literal::new_typed_literal(n.to_string(), xsd::INTEGER),
            Self::Decimal(d) => Literal::new_typed_literal(format_decimal(*d), xsd::DECIMAL),
            Self::Boolean(b) => Literal::new_typed_literal(b.to_string(), xsd::BOOLEAN),
            Self::DateTime(t) => Literal::new_typed_literal(
                t.to_rfc3339_opts(SecondsFormat::Micros, true),
                xsd::DATE_TIME,
            ),
        }
    }

    pub fn from_literal(lit: &Literal) -> Self {
        let value = lit.value();
        match lit.datatype() {
            dt if dt == xsd::INTEGER || dt == xsd::INT || dt == xsd::LONG => value
                .parse::<i64>()
                .map(Self::Integer)
                .unwrap_or_else(|_| Self::String(value.to_string())),
            dt if dt == xsd::DECIMAL || dt == xsd::DOUBLE || dt == xsd::FLOAT => value
                .parse::<f64>()
                .map(Self::Decimal)
                .unwrap_or_else(|_| Self::String(value.to_string())),
            dt if dt == xsd::BOOLEAN => Self::Boolean(value == "true" || value == "1"),
            dt if dt == xsd::DATE_TIME => DateTime::parse_from_rfc3339(value)
                .map(|t| Self::DateTime(t.with_timezone(&Utc)))
                .unwrap_or_else(|_| Self::String(value.to_string())),
            _ => Self::String(value.to_string()),
        }
    }

    pub fn from_term(term: &Term) -> Option<Self> {
        match term {
            Term::Literal(lit) => Some(Self::from_literal(lit)),
            _ => None,
        }
    }

    /// Loose JSON mapping used by handler payloads and the wire format.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Integer(n) => serde_json::Value::from(*n),
            Self::Decimal(d) => serde_json::Number::from_f64(*d)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::Boolean(b) => serde_json::Value::Bool(*b),
            Self::DateTime(t) => {
                serde_json::Value::String(t.to_rfc3339_opts(SecondsFormat::Micros, true))
            }
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(Self::Boolean(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Self::Integer(i))
                } else {
                    n.as_f64().map(Self::Decimal)
                }
            }
            serde_json::Value::String(s) => Some(Self::String(s.clone())),
            _ => None,
        }
    }

    /// Truthiness used by bare-identifier guards and completion conditions.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::String(s) => !s.is_empty() && s != "false" && s != "0",
            Self::Integer(n) => *n != 0,
            Self::Decimal(d) => *d != 0.0,
            Self::Boolean(b) => *b,
            Self::DateTime(_) => true,
        }
    }
}

/// Render a decimal without the float `e` notation SPARQL would reject.
fn format_decimal(d: f64) -> String {
    if d == d.trunc() && d.abs() < 1e15 {
        format!("{:.1}", d)
    } else {
        format!("{}", d)
    }
}

// ── Instance ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Created,
    Running,
    Waiting,
    Completed,
    Terminated,
    Error,
    Cancelled,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Running => "RUNNING",
            Self::Waiting => "WAITING",
            Self::Completed => "COMPLETED",
            Self::Terminated => "TERMINATED",
            Self::Error => "ERROR",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "CREATED" => Self::Created,
            "RUNNING" => Self::Running,
            "WAITING" => Self::Waiting,
            "COMPLETED" => Self::Completed,
            "TERMINATED" => Self::Terminated,
            "ERROR" => Self::Error,
            "CANCELLED" => Self::Cancelled,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Terminated | Self::Error | Self::Cancelled
        )
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: Uuid,
    pub definition_id: String,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Parent instance and the call activity node that spawned this child.
    pub parent: Option<(Uuid, String)>,
}

// ── Tokens ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenState {
    Active,
    Waiting,
    Consumed,
}

impl TokenState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Waiting => "WAITING",
            Self::Consumed => "CONSUMED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "ACTIVE" => Self::Active,
            "WAITING" => Self::Waiting,
            "CONSUMED" => Self::Consumed,
            _ => return None,
        })
    }
}

/// What a WAITING token is parked on, with the keys needed to resume it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WaitInfo {
    /// Pending user task completion.
    UserTask { task_id: Uuid },
    /// Message subscription (receive task / catch event / gateway arm).
    Message {
        name: String,
        correlation_key: String,
        /// Set when this subscription is one arm of an event-based gateway.
        gateway_token: Option<Uuid>,
    },
    /// Signal subscription.
    Signal {
        name: String,
        gateway_token: Option<Uuid>,
    },
    /// Persisted timer job.
    Timer {
        timer_id: Uuid,
        gateway_token: Option<Uuid>,
    },
    /// Call activity waiting on a child instance.
    Child { instance_id: Uuid },
    /// Event-based gateway token: parked while its arms race.
    Gateway,
    /// Async topic handler callback.
    Callback { callback_id: String },
    /// Parked at a joining gateway.
    Join,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub node_id: String,
    /// Active subprocess scopes, outermost first. Each entry is
    /// `<subprocess node id>:<scope uuid>`.
    pub scope_path: Vec<ScopeEntry>,
    pub state: TokenState,
    pub loop_index: Option<u32>,
    pub wait: Option<WaitInfo>,
}

/// One level of the token's scope stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeEntry {
    pub node_id: String,
    pub scope_id: Uuid,
}

impl ScopeEntry {
    pub fn encode(&self) -> String {
        format!("{}:{}", self.node_id, self.scope_id)
    }

    pub fn decode(raw: &str) -> Option<Self> {
        let (node, id) = raw.rsplit_once(':')?;
        Some(Self {
            node_id: node.to_string(),
            scope_id: Uuid::parse_str(id).ok()?,
        })
    }
}

pub fn encode_scope_path(path: &[ScopeEntry]) -> String {
    path.iter()
        .map(ScopeEntry::encode)
        .collect::<Vec<_>>()
        .join("/")
}

pub fn decode_scope_path(raw: &str) -> Vec<ScopeEntry> {
    if raw.is_empty() {
        return Vec::new();
    }
    raw.split('/').filter_map(ScopeEntry::decode).collect()
}

// ── User tasks ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserTaskStatus {
    Created,
    Claimed,
    Completed,
}

impl UserTaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Claimed => "CLAIMED",
            Self::Completed => "COMPLETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "CREATED" => Self::Created,
            "CLAIMED" => Self::Claimed,
            "COMPLETED" => Self::Completed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserTaskRecord {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub node_id: String,
    pub status: UserTaskStatus,
    pub assignee: Option<String>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ── Timer jobs ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimerStatus {
    DuePending,
    Leased,
    Fired,
    Cancelled,
}

impl TimerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DuePending => "DUE_PENDING",
            Self::Leased => "LEASED",
            Self::Fired => "FIRED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "DUE_PENDING" => Self::DuePending,
            "LEASED" => Self::Leased,
            "FIRED" => Self::Fired,
            "CANCELLED" => Self::Cancelled,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerJob {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub token_id: Uuid,
    /// Node the firing routes to: a timer catch event or a boundary event.
    pub node_id: String,
    pub due_at: DateTime<Utc>,
    pub status: TimerStatus,
    pub lease_holder: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub cycle_remaining: Option<u32>,
}

// ── Wire forms (§6.3) ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableWire {
    pub name: String,
    pub value: serde_json::Value,
    pub datatype: String,
}

impl VariableWire {
    pub fn from_value(name: &str, value: &VarValue) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_json(),
            datatype: value.datatype_name().to_string(),
        }
    }

    pub fn to_value(&self) -> Option<VarValue> {
        match self.datatype.as_str() {
            "string" => self.value.as_str().map(|s| VarValue::String(s.to_string())),
            "integer" => self.value.as_i64().map(VarValue::Integer),
            "decimal" => self.value.as_f64().map(VarValue::Decimal),
            "boolean" => self.value.as_bool().map(VarValue::Boolean),
            "dateTime" => self
                .value
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| VarValue::DateTime(t.with_timezone(&Utc))),
            _ => VarValue::from_json(&self.value),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub event_uri: String,
    pub instance_id: Uuid,
    pub node_id: Option<String>,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub details: Option<String>,
    pub seq: u64,
}

// ── Multi-instance loop variables ─────────────────────────────

pub const VAR_NR_OF_INSTANCES: &str = "nrOfInstances";
pub const VAR_NR_OF_ACTIVE: &str = "nrOfActiveInstances";
pub const VAR_NR_OF_COMPLETED: &str = "nrOfCompletedInstances";
pub const VAR_LOOP_COUNTER: &str = "loopCounter";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_round_trip() {
        for v in [
            VarValue::String("hello".into()),
            VarValue::Integer(-42),
            VarValue::Decimal(2.5),
            VarValue::Boolean(true),
        ] {
            assert_eq!(VarValue::from_literal(&v.as_literal()), v);
        }
    }

    #[test]
    fn decimal_literal_has_no_exponent() {
        let lit = VarValue::Decimal(42.0).as_literal();
        assert_eq!(lit.value(), "42.0");
    }

    #[test]
    fn truthiness() {
        assert!(VarValue::Integer(1).is_truthy());
        assert!(!VarValue::Integer(0).is_truthy());
        assert!(!VarValue::String("false".into()).is_truthy());
        assert!(!VarValue::String("".into()).is_truthy());
        assert!(VarValue::String("yes".into()).is_truthy());
        assert!(!VarValue::Boolean(false).is_truthy());
    }

    #[test]
    fn scope_path_round_trip() {
        let path = vec![
            ScopeEntry {
                node_id: "sub1".into(),
                scope_id: Uuid::now_v7(),
            },
            ScopeEntry {
                node_id: "sub2".into(),
                scope_id: Uuid::now_v7(),
            },
        ];
        assert_eq!(decode_scope_path(&encode_scope_path(&path)), path);
        assert!(decode_scope_path("").is_empty());
    }

    #[test]
    fn wire_round_trip() {
        let v = VarValue::Decimal(3.25);
        let wire = VariableWire::from_value("amount", &v);
        assert_eq!(wire.to_value(), Some(v));
    }
}
