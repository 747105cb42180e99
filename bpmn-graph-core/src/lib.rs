//! BPMN 2.0 execution engine whose runtime state is an RDF knowledge graph.
//!
//! Process definitions, instances, tokens, variables, user tasks, timers
//! and the audit trail all live in one quadstore partitioned into five
//! named graphs; gateway guards are evaluated as SPARQL ASK queries.
//! [`BpmnGraphEngine::open`] wires the whole runtime; [`control::ControlApi`]
//! is the surface a REST layer or CLI consumes.

pub mod audit;
pub mod config;
pub mod control;
pub mod definition;
pub mod engine;
pub mod error;
pub mod executor;
pub mod expr;
pub mod router;
pub mod script;
pub mod store;
pub mod subprocess;
pub mod supervisor;
pub mod tasks;
pub mod timers;
pub mod tokens;
pub mod topics;
pub mod types;
pub mod variables;
pub mod vocab;

use std::path::PathBuf;
use std::sync::Arc;

pub use config::EngineConfig;
pub use control::ControlApi;
pub use definition::{DefinitionPayload, FlowRecord, NodeKind, NodeRecord};
pub use engine::EngineCore;
pub use error::{EngineError, Result};
pub use supervisor::Supervisor;
pub use types::{InstanceStatus, VarValue, VariableWire};

/// The assembled engine: one graph store, one supervisor, one control
/// surface.
pub struct BpmnGraphEngine {
    pub core: Arc<EngineCore>,
    pub supervisor: Arc<Supervisor>,
    pub control: ControlApi,
}

impl BpmnGraphEngine {
    /// Open an engine, reloading graph snapshots from `data_dir` when given
    /// (and persisting back to it after every mutation batch).
    pub fn open(config: EngineConfig, data_dir: Option<PathBuf>) -> Result<Self> {
        let store = Arc::new(store::GraphStore::open(data_dir)?);
        let (core, async_rx) = EngineCore::new(config, store);
        let supervisor = Arc::new(Supervisor::new(core.clone(), async_rx));
        let control = ControlApi::new(supervisor.clone());
        Ok(Self {
            core,
            supervisor,
            control,
        })
    }

    /// Start the timer poll loop and async-handler dispatcher, after
    /// resetting any leases that expired while the process was down.
    pub async fn start_background(&self) -> Result<()> {
        self.supervisor.spawn_background().await
    }

    /// Register an in-process function handler for a topic.
    pub async fn register_function_handler(
        &self,
        topic: &str,
        description: Option<&str>,
        handler: Arc<dyn topics::FunctionHandler>,
    ) {
        self.core
            .topics
            .register_function(topic, description, handler)
            .await;
    }

    /// Install a sandboxed script engine; only consulted when
    /// `script_tasks_enabled` is set.
    pub async fn set_script_engine(&self, engine: Arc<dyn script::ScriptEngine>) {
        *self.core.script.write().await = Some(engine);
    }
}
