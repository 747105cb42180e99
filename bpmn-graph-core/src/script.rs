//! Script task execution hook.
//!
//! The engine ships no embedded evaluator; script execution is opt-in via
//! `script_tasks_enabled` plus a registered [`ScriptEngine`]. A sandboxed
//! implementation must expose only the provided variables and whatever safe
//! builtins it chooses; assignments come back as variable writes.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::VarValue;

#[async_trait]
pub trait ScriptEngine: Send + Sync {
    /// Evaluate `script` with read access to `variables`; returns the
    /// variable writes to persist. Failures become `ScriptError` and set
    /// the instance status to ERROR.
    async fn evaluate(
        &self,
        script: &str,
        variables: BTreeMap<String, VarValue>,
    ) -> Result<BTreeMap<String, VarValue>>;
}
