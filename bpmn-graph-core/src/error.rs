//! Engine error taxonomy.
//!
//! Each variant maps to one propagation rule: deploy-time rejection,
//! caller-surfaced lookup/state errors, activity failures that enter boundary
//! escalation, and store faults that leave instance state unchanged.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid or internally inconsistent definition at deploy time.
    #[error("bad definition: {0}")]
    BadDefinition(String),

    /// Unknown instance / task / topic / definition.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Operation is invalid for the current state of the entity.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// A gateway found no outgoing flow to take.
    #[error("dead end at gateway {node}")]
    DeadEnd { node: String },

    /// Handler invocation mis-configured: unresolved template variable,
    /// missing handler, malformed descriptor.
    #[error("handler configuration error on topic {topic}: {message}")]
    HandlerConfig { topic: String, message: String },

    /// Retryable handler failure (HTTP timeout / 5xx within retry budget).
    #[error("transient handler failure on topic {topic}: {message}")]
    HandlerTransient { topic: String, message: String },

    /// Non-retryable handler failure, or a transient one past its budget.
    #[error("handler failed on topic {topic}: {message}")]
    HandlerFatal { topic: String, message: String },

    /// Script task runtime failure.
    #[error("script error at node {node}: {message}")]
    Script { node: String, message: String },

    /// Feature present in the definition but not implemented.
    #[error("unsupported feature at node {node}: {feature}")]
    Unsupported { node: String, feature: String },

    /// Graph store I/O, SPARQL, or serialization failure.
    #[error("store error: {0}")]
    Store(String),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn store(err: impl std::fmt::Display) -> Self {
        Self::Store(err.to_string())
    }

    /// Error code recorded in audit events and matched against error
    /// boundary events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadDefinition(_) => "BAD_DEFINITION",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::PreconditionFailed(_) => "PRECONDITION_FAILED",
            Self::DeadEnd { .. } => "DEAD_END",
            Self::HandlerConfig { .. } => "HANDLER_CONFIG",
            Self::HandlerTransient { .. } => "HANDLER_TRANSIENT",
            Self::HandlerFatal { .. } => "HANDLER_FATAL",
            Self::Script { .. } => "SCRIPT_ERROR",
            Self::Unsupported { .. } => "UNSUPPORTED",
            Self::Store(_) => "STORE_ERROR",
        }
    }

    /// True when the failure should enter boundary-event escalation rather
    /// than surface to the caller. Dead ends and script errors set the
    /// instance to ERROR directly.
    pub fn escalates(&self) -> bool {
        matches!(
            self,
            Self::HandlerConfig { .. }
                | Self::HandlerFatal { .. }
                | Self::HandlerTransient { .. }
        )
    }
}

/// An application-level error thrown by an error end event or
/// `throw_error`, matched against error boundary definitions by code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BpmnError {
    pub code: String,
    pub message: String,
}

impl BpmnError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for BpmnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}
