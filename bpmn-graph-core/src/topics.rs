//! Topic handler registry.
//!
//! A topic has exactly one handler: an in-process function or an HTTP
//! descriptor. Service and send tasks resolve their `topic` attribute here;
//! execution is synchronous from the token's perspective unless the
//! descriptor sets `async_execution`, in which case the token parks and a
//! completion is delivered through the supervisor's callback channel.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::types::VarValue;

// ── Handler contracts ─────────────────────────────────────────

/// What a handler sees: the instance it runs for and a merged variable view.
#[derive(Debug, Clone)]
pub struct ProcessContext {
    pub instance_id: Uuid,
    pub node_id: String,
    pub topic: String,
    pub variables: BTreeMap<String, VarValue>,
}

/// Variable writes produced by a handler.
pub type VarWrites = BTreeMap<String, VarValue>;

#[async_trait]
pub trait FunctionHandler: Send + Sync {
    async fn invoke(&self, ctx: &ProcessContext) -> Result<VarWrites>;
}

/// Adapter so plain closures can serve as function handlers.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> FunctionHandler for FnHandler<F>
where
    F: Fn(&ProcessContext) -> Result<VarWrites> + Send + Sync,
{
    async fn invoke(&self, ctx: &ProcessContext) -> Result<VarWrites> {
        (self.0)(ctx)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpHandlerSpec {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Body template; `${name}` placeholders resolve against instance
    /// variables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Response extraction: JSON path -> variable name.
    #[serde(default)]
    pub extract: BTreeMap<String, String>,
    #[serde(default)]
    pub async_execution: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_ms: Option<u64>,
}

fn default_method() -> String {
    "GET".to_string()
}

enum HandlerKind {
    Function(Arc<dyn FunctionHandler>),
    Http(HttpHandlerSpec),
}

struct HandlerEntry {
    kind: HandlerKind,
    description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicInfo {
    pub topic: String,
    pub kind: String,
    pub description: Option<String>,
    pub async_execution: bool,
}

/// Outcome of dispatching a topic for a token.
#[derive(Debug)]
pub enum HandlerOutcome {
    Completed(VarWrites),
    /// Token must park; the completion arrives on the callback channel.
    AsyncStarted { callback_id: String },
}

/// Delivered on the supervisor's channel when an async handler finishes.
pub struct AsyncCompletion {
    pub callback_id: String,
    pub result: Result<VarWrites>,
}

// ── Registry ──────────────────────────────────────────────────

pub struct TopicRegistry {
    handlers: RwLock<HashMap<String, HandlerEntry>>,
    client: reqwest::Client,
    config: Arc<EngineConfig>,
    template: Regex,
    async_tx: mpsc::UnboundedSender<AsyncCompletion>,
}

impl TopicRegistry {
    pub fn new(
        config: Arc<EngineConfig>,
        async_tx: mpsc::UnboundedSender<AsyncCompletion>,
    ) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            client: reqwest::Client::new(),
            config,
            template: Regex::new(r"\$\{(\w+)\}").expect("static regex"),
            async_tx,
        }
    }

    pub async fn register_function(
        &self,
        topic: &str,
        description: Option<&str>,
        handler: Arc<dyn FunctionHandler>,
    ) {
        self.handlers.write().await.insert(
            topic.to_string(),
            HandlerEntry {
                kind: HandlerKind::Function(handler),
                description: description.map(str::to_string),
            },
        );
    }

    pub async fn register_http(
        &self,
        topic: &str,
        description: Option<&str>,
        spec: HttpHandlerSpec,
    ) -> Result<()> {
        if spec.url.trim().is_empty() {
            return Err(EngineError::HandlerConfig {
                topic: topic.to_string(),
                message: "empty URL".into(),
            });
        }
        self.handlers.write().await.insert(
            topic.to_string(),
            HandlerEntry {
                kind: HandlerKind::Http(spec),
                description: description.map(str::to_string),
            },
        );
        Ok(())
    }

    pub async fn unregister(&self, topic: &str) -> Result<()> {
        if self.handlers.write().await.remove(topic).is_none() {
            return Err(EngineError::not_found("topic", topic));
        }
        Ok(())
    }

    pub async fn exists(&self, topic: &str) -> bool {
        self.handlers.read().await.contains_key(topic)
    }

    pub async fn list(&self) -> Vec<TopicInfo> {
        let handlers = self.handlers.read().await;
        let mut out: Vec<TopicInfo> = handlers
            .iter()
            .map(|(topic, entry)| TopicInfo {
                topic: topic.clone(),
                kind: match &entry.kind {
                    HandlerKind::Function(_) => "function".to_string(),
                    HandlerKind::Http(_) => "http".to_string(),
                },
                description: entry.description.clone(),
                async_execution: matches!(
                    &entry.kind,
                    HandlerKind::Http(spec) if spec.async_execution
                ),
            })
            .collect();
        out.sort_by(|a, b| a.topic.cmp(&b.topic));
        out
    }

    /// Dispatch a topic for a token. Fails with `HandlerConfig` when no
    /// handler is registered.
    pub async fn execute(&self, ctx: &ProcessContext) -> Result<HandlerOutcome> {
        let handlers = self.handlers.read().await;
        let entry = handlers.get(&ctx.topic).ok_or_else(|| EngineError::HandlerConfig {
            topic: ctx.topic.clone(),
            message: "no handler registered".into(),
        })?;
        match &entry.kind {
            HandlerKind::Function(handler) => {
                let handler = handler.clone();
                drop(handlers);
                let writes = handler.invoke(ctx).await.map_err(|e| promote(&ctx.topic, e))?;
                Ok(HandlerOutcome::Completed(writes))
            }
            HandlerKind::Http(spec) => {
                let spec = spec.clone();
                drop(handlers);
                if spec.async_execution {
                    let callback_id = format!("cb-{}", Uuid::now_v7());
                    let registry_ctx = ctx.clone();
                    let client = self.client.clone();
                    let config = self.config.clone();
                    let template = self.template.clone();
                    let tx = self.async_tx.clone();
                    let cb = callback_id.clone();
                    tokio::spawn(async move {
                        let result =
                            run_http(&client, &config, &template, &spec, &registry_ctx).await;
                        // Receiver dropped means the engine is shutting down.
                        let _ = tx.send(AsyncCompletion {
                            callback_id: cb,
                            result,
                        });
                    });
                    Ok(HandlerOutcome::AsyncStarted { callback_id })
                } else {
                    let writes =
                        run_http(&self.client, &self.config, &self.template, &spec, ctx).await?;
                    Ok(HandlerOutcome::Completed(writes))
                }
            }
        }
    }

    /// Run a handler against an ephemeral variable bag and report the
    /// would-be writes; nothing is persisted. Async descriptors run inline.
    pub async fn test(&self, topic: &str, variables: BTreeMap<String, VarValue>) -> Result<VarWrites> {
        let ctx = ProcessContext {
            instance_id: Uuid::now_v7(),
            node_id: "test".into(),
            topic: topic.to_string(),
            variables,
        };
        let handlers = self.handlers.read().await;
        let entry = handlers.get(topic).ok_or_else(|| EngineError::not_found("topic", topic))?;
        match &entry.kind {
            HandlerKind::Function(handler) => {
                let handler = handler.clone();
                drop(handlers);
                handler.invoke(&ctx).await
            }
            HandlerKind::Http(spec) => {
                let spec = spec.clone();
                drop(handlers);
                run_http(&self.client, &self.config, &self.template, &spec, &ctx).await
            }
        }
    }
}

/// Handler errors without a topic classification default to fatal.
fn promote(topic: &str, err: EngineError) -> EngineError {
    match err {
        e @ (EngineError::HandlerConfig { .. }
        | EngineError::HandlerTransient { .. }
        | EngineError::HandlerFatal { .. }) => e,
        other => EngineError::HandlerFatal {
            topic: topic.to_string(),
            message: other.to_string(),
        },
    }
}

// ── HTTP execution ────────────────────────────────────────────

async fn run_http(
    client: &reqwest::Client,
    config: &EngineConfig,
    template: &Regex,
    spec: &HttpHandlerSpec,
    ctx: &ProcessContext,
) -> Result<VarWrites> {
    let url = render(template, &spec.url, ctx)?;
    let body = match &spec.body {
        Some(raw) => Some(render(template, raw, ctx)?),
        None => None,
    };
    let mut headers = BTreeMap::new();
    for (name, value) in &spec.headers {
        headers.insert(name.clone(), render(template, value, ctx)?);
    }
    let method = reqwest::Method::from_bytes(spec.method.to_ascii_uppercase().as_bytes())
        .map_err(|_| EngineError::HandlerConfig {
            topic: ctx.topic.clone(),
            message: format!("invalid method {}", spec.method),
        })?;
    let timeout = Duration::from_millis(
        spec.timeout_ms
            .unwrap_or(config.handler_http_default_timeout_ms),
    );
    let budget = spec.max_retries.unwrap_or(config.handler_http_max_retries);
    let backoff = Duration::from_millis(spec.backoff_ms.unwrap_or(500));

    let mut attempt = 0u32;
    loop {
        let mut request = client.request(method.clone(), &url).timeout(timeout);
        for (name, value) in &headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &body {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.clone());
        }

        let outcome = match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    let writes = extract_writes(spec, response).await?;
                    return Ok(writes);
                } else if status.is_server_error() {
                    Err(EngineError::HandlerTransient {
                        topic: ctx.topic.clone(),
                        message: format!("HTTP {status}"),
                    })
                } else {
                    Err(EngineError::HandlerFatal {
                        topic: ctx.topic.clone(),
                        message: format!("HTTP {status}"),
                    })
                }
            }
            Err(e) if e.is_timeout() || e.is_connect() => Err(EngineError::HandlerTransient {
                topic: ctx.topic.clone(),
                message: e.to_string(),
            }),
            Err(e) => Err(EngineError::HandlerFatal {
                topic: ctx.topic.clone(),
                message: e.to_string(),
            }),
        };

        match outcome {
            Err(EngineError::HandlerTransient { topic, message }) if attempt < budget => {
                attempt += 1;
                tracing::warn!(topic, attempt, message, "retrying HTTP handler");
                tokio::time::sleep(backoff * attempt).await;
            }
            Err(EngineError::HandlerTransient { topic, message }) => {
                // Budget exhausted: a transient failure becomes fatal.
                return Err(EngineError::HandlerFatal { topic, message });
            }
            Err(other) => return Err(other),
            Ok(()) => unreachable!(),
        }
    }
}

async fn extract_writes(spec: &HttpHandlerSpec, response: reqwest::Response) -> Result<VarWrites> {
    if spec.extract.is_empty() {
        return Ok(VarWrites::new());
    }
    let json: serde_json::Value = response.json().await.map_err(|e| EngineError::HandlerFatal {
        topic: String::new(),
        message: format!("response is not JSON: {e}"),
    })?;
    let mut writes = VarWrites::new();
    for (path, variable) in &spec.extract {
        if let Some(found) = extract_path(&json, path) {
            if let Some(value) = VarValue::from_json(found) {
                writes.insert(variable.clone(), value);
            }
        }
    }
    Ok(writes)
}

/// Substitute `${name}` placeholders with variable values. Any unresolved
/// name is a configuration error.
fn render(template: &Regex, text: &str, ctx: &ProcessContext) -> Result<String> {
    let mut missing = None;
    let rendered = template.replace_all(text, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match ctx.variables.get(name) {
            Some(VarValue::String(s)) => s.clone(),
            Some(other) => other.to_json().to_string().trim_matches('"').to_string(),
            None => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });
    if let Some(name) = missing {
        return Err(EngineError::HandlerConfig {
            topic: ctx.topic.clone(),
            message: format!("unresolved template variable {name}"),
        });
    }
    Ok(rendered.into_owned())
}

/// Minimal JSON path: optional `$.` prefix, dot-separated members, `[n]`
/// array indices.
pub fn extract_path<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let trimmed = path.trim_start_matches("$.").trim_start_matches('$');
    let mut current = value;
    if trimmed.is_empty() {
        return Some(current);
    }
    for segment in trimmed.split('.') {
        let (member, indices) = match segment.find('[') {
            Some(open) => (&segment[..open], &segment[open..]),
            None => (segment, ""),
        };
        if !member.is_empty() {
            current = current.get(member)?;
        }
        let mut rest = indices;
        while let Some(stripped) = rest.strip_prefix('[') {
            let close = stripped.find(']')?;
            let index: usize = stripped[..close].parse().ok()?;
            current = current.get(index)?;
            rest = &stripped[close + 1..];
        }
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TopicRegistry {
        let (tx, _rx) = mpsc::unbounded_channel();
        TopicRegistry::new(Arc::new(EngineConfig::default()), tx)
    }

    fn ctx(vars: &[(&str, VarValue)]) -> ProcessContext {
        ProcessContext {
            instance_id: Uuid::now_v7(),
            node_id: "n".into(),
            topic: "t".into(),
            variables: vars
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    #[tokio::test]
    async fn function_handler_round_trip() {
        let registry = registry();
        registry
            .register_function(
                "double",
                Some("doubles x"),
                Arc::new(FnHandler(|ctx: &ProcessContext| {
                    let x = match ctx.variables.get("x") {
                        Some(VarValue::Integer(n)) => *n,
                        _ => 0,
                    };
                    Ok(BTreeMap::from([("x".to_string(), VarValue::Integer(2 * x))]))
                })),
            )
            .await;

        let ctx = ctx(&[("x", VarValue::Integer(21))]);
        let mut ctx = ctx;
        ctx.topic = "double".into();
        let outcome = registry.execute(&ctx).await.unwrap();
        match outcome {
            HandlerOutcome::Completed(writes) => {
                assert_eq!(writes["x"], VarValue::Integer(42));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_handler_is_config_error() {
        let registry = registry();
        let err = registry.execute(&ctx(&[])).await.unwrap_err();
        assert!(matches!(err, EngineError::HandlerConfig { .. }));
    }

    #[tokio::test]
    async fn test_mode_does_not_need_instance() {
        let registry = registry();
        registry
            .register_function(
                "echo",
                None,
                Arc::new(FnHandler(|ctx: &ProcessContext| Ok(ctx.variables.clone()))),
            )
            .await;
        let writes = registry
            .test(
                "echo",
                BTreeMap::from([("a".to_string(), VarValue::Boolean(true))]),
            )
            .await
            .unwrap();
        assert_eq!(writes["a"], VarValue::Boolean(true));
    }

    #[test]
    fn template_substitution() {
        let template = Regex::new(r"\$\{(\w+)\}").unwrap();
        let ctx = ctx(&[
            ("orderId", VarValue::String("O-1".into())),
            ("amount", VarValue::Integer(7)),
        ]);
        let rendered =
            render(&template, "https://api.example.com/orders/${orderId}?n=${amount}", &ctx)
                .unwrap();
        assert_eq!(rendered, "https://api.example.com/orders/O-1?n=7");

        let err = render(&template, "x=${missing}", &ctx).unwrap_err();
        assert!(matches!(err, EngineError::HandlerConfig { .. }));
    }

    #[test]
    fn json_path_extraction() {
        let value: serde_json::Value = serde_json::json!({
            "data": { "items": [ { "id": "a" }, { "id": "b" } ] },
            "ok": true
        });
        assert_eq!(
            extract_path(&value, "$.data.items[1].id"),
            Some(&serde_json::Value::String("b".into()))
        );
        assert_eq!(extract_path(&value, "ok"), Some(&serde_json::Value::Bool(true)));
        assert_eq!(extract_path(&value, "$.data.missing"), None);
    }

    #[tokio::test]
    async fn unregister_unknown_topic_fails() {
        let registry = registry();
        assert!(matches!(
            registry.unregister("nope").await.unwrap_err(),
            EngineError::NotFound { .. }
        ));
    }
}
