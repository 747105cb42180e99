//! Guard expression evaluation.
//!
//! Guards come in three shapes: a full SPARQL ASK body (passed through with
//! `${instance}` substituted), a bare `${identifier}` truthy test, or the
//! restricted comparison grammar `${ IDENT OP LITERAL }`. The latter two are
//! lowered to an ASK against the subject that defines the variable, found by
//! walking the token's scope chain innermost-out.

use std::sync::Arc;

use oxigraph::model::NamedNode;
use regex::Regex;

use crate::error::Result;
use crate::store::GraphStore;
use crate::vocab::{self, GRAPH_INST};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComparisonOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl ComparisonOp {
    fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "==" | "=" | "eq" => Self::Eq,
            "!=" | "neq" => Self::Neq,
            ">" | "gt" => Self::Gt,
            ">=" | "gte" => Self::Gte,
            "<" | "lt" => Self::Lt,
            "<=" | "lte" => Self::Lte,
            _ => return None,
        })
    }

    fn sparql(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Neq => "!=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
        }
    }
}

/// A parsed guard, before lowering to SPARQL.
#[derive(Debug, Clone, PartialEq)]
enum Guard {
    Always,
    Ask(String),
    Truthy(String),
    Compare {
        variable: String,
        op: ComparisonOp,
        literal: String,
    },
}

pub struct ConditionEvaluator {
    store: Arc<GraphStore>,
    juel: Regex,
    bare: Regex,
    simple: Regex,
}

impl ConditionEvaluator {
    pub fn new(store: Arc<GraphStore>) -> Self {
        Self {
            store,
            juel: Regex::new(
                r"^\$\{\s*(\w+)\s*(>=|<=|!=|==|=|gte|lte|neq|eq|gt|lt|>|<)\s*(.+?)\s*\}$",
            )
            .expect("static regex"),
            bare: Regex::new(r"^\$\{\s*(\w+)\s*\}$").expect("static regex"),
            simple: Regex::new(r"^(\w+)\s*(>=|<=|!=|==|=|gte|lte|neq|eq|gt|lt|>|<)\s*(.+?)\s*$")
                .expect("static regex"),
        }
    }

    /// Evaluate a guard for an instance. `scope_subjects` is the token's
    /// variable scope chain, innermost first, ending with the instance
    /// subject. A null or empty expression is an unconditional flow.
    pub fn evaluate(
        &self,
        instance: &NamedNode,
        scope_subjects: &[NamedNode],
        expression: Option<&str>,
    ) -> Result<bool> {
        match self.parse(expression) {
            Guard::Always => Ok(true),
            Guard::Ask(body) => {
                let query = body.replace("${instance}", instance.as_str());
                self.store.ask(GRAPH_INST, &query)
            }
            Guard::Truthy(name) => {
                let filter =
                    "FILTER(str(?v) != \"\" && str(?v) != \"false\" && str(?v) != \"0\")"
                        .to_string();
                self.ask_scoped(scope_subjects, &name, &filter)
            }
            Guard::Compare {
                variable,
                op,
                literal,
            } => {
                let filter = format!("FILTER(?v {} {})", op.sparql(), sparql_literal(&literal));
                self.ask_scoped(scope_subjects, &variable, &filter)
            }
        }
    }

    fn parse(&self, expression: Option<&str>) -> Guard {
        let text = match expression {
            Some(t) if !t.trim().is_empty() => t.trim(),
            _ => return Guard::Always,
        };
        let upper = text.to_ascii_uppercase();
        if upper.starts_with("ASK") || upper.starts_with("PREFIX") {
            return Guard::Ask(text.to_string());
        }
        if let Some(caps) = self.juel.captures(text) {
            if let Some(op) = ComparisonOp::parse(&caps[2]) {
                return Guard::Compare {
                    variable: caps[1].to_string(),
                    op,
                    literal: caps[3].to_string(),
                };
            }
        }
        if let Some(caps) = self.bare.captures(text) {
            return Guard::Truthy(caps[1].to_string());
        }
        if let Some(caps) = self.simple.captures(text) {
            if let Some(op) = ComparisonOp::parse(&caps[2]) {
                return Guard::Compare {
                    variable: caps[1].to_string(),
                    op,
                    literal: caps[3].to_string(),
                };
            }
        }
        // Unparseable guards never match; the default flow still applies.
        tracing::warn!(expression = text, "unsupported condition expression");
        Guard::Truthy(String::from("__unparseable__"))
    }

    /// Lower to `ASK { <subject> var:<name> ?v . <filter> }` against the
    /// innermost scope that defines the variable. A variable defined nowhere
    /// in the chain fails the guard.
    fn ask_scoped(&self, scope_subjects: &[NamedNode], name: &str, filter: &str) -> Result<bool> {
        let predicate = vocab::variable_predicate(name);
        for subject in scope_subjects {
            let exists = format!(
                "ASK {{ <{}> <{}> ?v }}",
                subject.as_str(),
                predicate.as_str()
            );
            if self.store.ask(GRAPH_INST, &exists)? {
                let query = format!(
                    "ASK {{ <{}> <{}> ?v . {} }}",
                    subject.as_str(),
                    predicate.as_str(),
                    filter
                );
                return self.store.ask(GRAPH_INST, &query);
            }
        }
        Ok(false)
    }
}

/// Type a guard literal: quoted -> string, true/false -> xsd:boolean,
/// numeric -> xsd:decimal.
fn sparql_literal(raw: &str) -> String {
    let trimmed = raw.trim();
    if (trimmed.starts_with('"') && trimmed.ends_with('"') && trimmed.len() >= 2)
        || (trimmed.starts_with('\'') && trimmed.ends_with('\'') && trimmed.len() >= 2)
    {
        let inner = &trimmed[1..trimmed.len() - 1];
        return format!("\"{}\"", escape_string(inner));
    }
    if trimmed == "true" || trimmed == "false" {
        return trimmed.to_string();
    }
    if trimmed.parse::<f64>().is_ok() {
        return format!(
            "\"{}\"^^<http://www.w3.org/2001/XMLSchema#decimal>",
            normalize_decimal(trimmed)
        );
    }
    format!("\"{}\"", escape_string(trimmed))
}

fn normalize_decimal(raw: &str) -> String {
    if raw.contains('.') {
        raw.to_string()
    } else {
        format!("{raw}.0")
    }
}

fn escape_string(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VarValue;
    use crate::vocab::instance_iri;

    async fn setup(vars: &[(&str, VarValue)]) -> (Arc<GraphStore>, NamedNode) {
        let store = Arc::new(GraphStore::open(None).unwrap());
        let inst = instance_iri(uuid::Uuid::now_v7());
        for (name, value) in vars {
            store
                .insert(
                    GRAPH_INST,
                    &inst,
                    &vocab::variable_predicate(name),
                    value.as_literal(),
                )
                .await
                .unwrap();
        }
        (store, inst)
    }

    #[tokio::test]
    async fn numeric_comparison() {
        let (store, inst) = setup(&[("amount", VarValue::Integer(150))]).await;
        let eval = ConditionEvaluator::new(store);
        let chain = [inst.clone()];

        assert!(eval
            .evaluate(&inst, &chain, Some("${amount >= 100}"))
            .unwrap());
        assert!(!eval
            .evaluate(&inst, &chain, Some("${amount < 100}"))
            .unwrap());
        assert!(eval
            .evaluate(&inst, &chain, Some("${amount neq 149}"))
            .unwrap());
    }

    #[tokio::test]
    async fn missing_variable_is_false() {
        let (store, inst) = setup(&[]).await;
        let eval = ConditionEvaluator::new(store);
        assert!(!eval
            .evaluate(&inst, &[inst.clone()], Some("${amount >= 100}"))
            .unwrap());
    }

    #[tokio::test]
    async fn empty_expression_is_true() {
        let (store, inst) = setup(&[]).await;
        let eval = ConditionEvaluator::new(store);
        assert!(eval.evaluate(&inst, &[inst.clone()], None).unwrap());
        assert!(eval.evaluate(&inst, &[inst.clone()], Some("  ")).unwrap());
    }

    #[tokio::test]
    async fn string_and_boolean_literals() {
        let (store, inst) = setup(&[
            ("status", VarValue::String("open".into())),
            ("approved", VarValue::Boolean(true)),
        ])
        .await;
        let eval = ConditionEvaluator::new(store);
        let chain = [inst.clone()];

        assert!(eval
            .evaluate(&inst, &chain, Some("${status == 'open'}"))
            .unwrap());
        assert!(eval
            .evaluate(&inst, &chain, Some("${approved == true}"))
            .unwrap());
        assert!(!eval
            .evaluate(&inst, &chain, Some("${approved != true}"))
            .unwrap());
    }

    #[tokio::test]
    async fn bare_identifier_truthiness() {
        let (store, inst) = setup(&[
            ("yes", VarValue::Boolean(true)),
            ("no", VarValue::Boolean(false)),
            ("zero", VarValue::Integer(0)),
        ])
        .await;
        let eval = ConditionEvaluator::new(store);
        let chain = [inst.clone()];

        assert!(eval.evaluate(&inst, &chain, Some("${yes}")).unwrap());
        assert!(!eval.evaluate(&inst, &chain, Some("${no}")).unwrap());
        assert!(!eval.evaluate(&inst, &chain, Some("${zero}")).unwrap());
        assert!(!eval.evaluate(&inst, &chain, Some("${absent}")).unwrap());
    }

    #[tokio::test]
    async fn scope_shadowing_prefers_inner_subject() {
        let store = Arc::new(GraphStore::open(None).unwrap());
        let inst = instance_iri(uuid::Uuid::now_v7());
        let scope = crate::vocab::scope_iri(uuid::Uuid::now_v7());
        store
            .insert(
                GRAPH_INST,
                &inst,
                &vocab::variable_predicate("n"),
                VarValue::Integer(1).as_literal(),
            )
            .await
            .unwrap();
        store
            .insert(
                GRAPH_INST,
                &scope,
                &vocab::variable_predicate("n"),
                VarValue::Integer(5).as_literal(),
            )
            .await
            .unwrap();

        let eval = ConditionEvaluator::new(store);
        let chain = [scope.clone(), inst.clone()];
        assert!(eval.evaluate(&inst, &chain, Some("${n == 5}")).unwrap());
        assert!(eval
            .evaluate(&inst, &[inst.clone()], Some("${n == 1}"))
            .unwrap());
    }

    #[tokio::test]
    async fn sparql_ask_passthrough() {
        let (store, inst) = setup(&[("x", VarValue::Integer(7))]).await;
        let eval = ConditionEvaluator::new(store);
        let pred = vocab::variable_predicate("x");
        let ask = format!(
            "ASK {{ <${{instance}}> <{}> ?v . FILTER(?v > 5) }}",
            pred.as_str()
        );
        assert!(eval.evaluate(&inst, &[inst.clone()], Some(&ask)).unwrap());
    }
}
