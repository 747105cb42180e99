//! Typed variable store layered on the instance graph.
//!
//! A variable is one triple `<scope> var:<name> <literal>`; the subject is
//! the instance, a subprocess scope, or a token (multi-instance locals).
//! Reads walk the scope chain innermost-out; writes replace atomically.

use std::collections::BTreeMap;
use std::sync::Arc;

use oxigraph::model::{NamedNode, Term};

use crate::error::{EngineError, Result};
use crate::store::{GraphOp, GraphStore};
use crate::types::VarValue;
use crate::vocab::{self, GRAPH_INST};

pub struct VariableStore {
    store: Arc<GraphStore>,
    max_bytes: usize,
}

impl VariableStore {
    pub fn new(store: Arc<GraphStore>, max_bytes: usize) -> Self {
        Self { store, max_bytes }
    }

    /// Innermost-defined value of `name` along the scope chain.
    pub fn get(&self, chain: &[NamedNode], name: &str) -> Result<Option<VarValue>> {
        let predicate = vocab::variable_predicate(name);
        for subject in chain {
            if let Some(term) = self.store.value(GRAPH_INST, subject, &predicate)? {
                return Ok(VarValue::from_term(&term));
            }
        }
        Ok(None)
    }

    /// Set a variable on a specific scope subject. Replace is
    /// remove-then-insert inside the graph's write lock.
    pub async fn set(&self, subject: &NamedNode, name: &str, value: &VarValue) -> Result<()> {
        if value.lexical_len() > self.max_bytes {
            return Err(EngineError::PreconditionFailed(format!(
                "variable {name} exceeds {} bytes",
                self.max_bytes
            )));
        }
        let predicate = vocab::variable_predicate(name);
        self.store
            .replace(GRAPH_INST, subject, &predicate, value.as_literal())
            .await
    }

    pub async fn set_all(
        &self,
        subject: &NamedNode,
        values: &BTreeMap<String, VarValue>,
    ) -> Result<()> {
        for (name, value) in values {
            self.set(subject, name, value).await?;
        }
        Ok(())
    }

    pub async fn unset(&self, subject: &NamedNode, name: &str) -> Result<()> {
        let predicate = vocab::variable_predicate(name);
        self.store
            .remove_pattern(GRAPH_INST, Some(subject), Some(&predicate), None)
            .await
    }

    /// Every variable defined directly on one subject.
    pub fn all_at(&self, subject: &NamedNode) -> Result<BTreeMap<String, VarValue>> {
        let mut out = BTreeMap::new();
        for (predicate, object) in self.store.properties(GRAPH_INST, subject)? {
            let Some(name) = vocab::variable_name_from_iri(predicate.as_str()) else {
                continue;
            };
            if let Some(value) = VarValue::from_term(&object) {
                out.insert(name, value);
            }
        }
        Ok(out)
    }

    /// Merged view over a scope chain; inner scopes shadow outer ones.
    pub fn collect(&self, chain: &[NamedNode]) -> Result<BTreeMap<String, VarValue>> {
        let mut out = BTreeMap::new();
        for subject in chain.iter().rev() {
            for (name, value) in self.all_at(subject)? {
                out.insert(name, value);
            }
        }
        Ok(out)
    }

    /// Capture a scope's variables, e.g. before an event subprocess runs.
    pub fn snapshot(&self, subject: &NamedNode) -> Result<BTreeMap<String, VarValue>> {
        self.all_at(subject)
    }

    /// Reset a scope's variables to a previously captured snapshot.
    pub async fn restore(
        &self,
        subject: &NamedNode,
        snapshot: &BTreeMap<String, VarValue>,
    ) -> Result<()> {
        self.clear(subject).await?;
        let ops = snapshot
            .iter()
            .map(|(name, value)| {
                GraphOp::insert(
                    subject,
                    &vocab::variable_predicate(name),
                    value.as_literal(),
                )
            })
            .collect();
        self.store.apply(GRAPH_INST, ops).await
    }

    /// Drop all variables defined on a subject (scope exit).
    pub async fn clear(&self, subject: &NamedNode) -> Result<()> {
        let ops = self
            .all_at(subject)?
            .keys()
            .map(|name| {
                GraphOp::remove(Some(subject), Some(&vocab::variable_predicate(name)), None)
            })
            .collect();
        self.store.apply(GRAPH_INST, ops).await
    }

    /// Raw term lookup, used by handler templating for lexical forms.
    pub fn raw(&self, chain: &[NamedNode], name: &str) -> Result<Option<Term>> {
        let predicate = vocab::variable_predicate(name);
        for subject in chain {
            if let Some(term) = self.store.value(GRAPH_INST, subject, &predicate)? {
                return Ok(Some(term));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::{instance_iri, scope_iri};

    fn store() -> (Arc<GraphStore>, VariableStore) {
        let graph = Arc::new(GraphStore::open(None).unwrap());
        let vars = VariableStore::new(graph.clone(), 1024);
        (graph, vars)
    }

    #[tokio::test]
    async fn set_get_replace() {
        let (_, vars) = store();
        let inst = instance_iri(uuid::Uuid::now_v7());

        vars.set(&inst, "x", &VarValue::Integer(21)).await.unwrap();
        assert_eq!(
            vars.get(&[inst.clone()], "x").unwrap(),
            Some(VarValue::Integer(21))
        );

        vars.set(&inst, "x", &VarValue::Integer(42)).await.unwrap();
        let all = vars.all_at(&inst).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all["x"], VarValue::Integer(42));
    }

    #[tokio::test]
    async fn scope_walk_shadows() {
        let (_, vars) = store();
        let inst = instance_iri(uuid::Uuid::now_v7());
        let scope = scope_iri(uuid::Uuid::now_v7());

        vars.set(&inst, "n", &VarValue::Integer(1)).await.unwrap();
        vars.set(&scope, "n", &VarValue::Integer(9)).await.unwrap();

        let chain = [scope.clone(), inst.clone()];
        assert_eq!(vars.get(&chain, "n").unwrap(), Some(VarValue::Integer(9)));
        assert_eq!(
            vars.get(&[inst.clone()], "n").unwrap(),
            Some(VarValue::Integer(1))
        );

        let merged = vars.collect(&chain).unwrap();
        assert_eq!(merged["n"], VarValue::Integer(9));
    }

    #[tokio::test]
    async fn oversized_string_rejected() {
        let graph = Arc::new(GraphStore::open(None).unwrap());
        let vars = VariableStore::new(graph, 4);
        let inst = instance_iri(uuid::Uuid::now_v7());

        let err = vars
            .set(&inst, "big", &VarValue::String("too long".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn snapshot_restore() {
        let (_, vars) = store();
        let scope = scope_iri(uuid::Uuid::now_v7());

        vars.set(&scope, "a", &VarValue::Integer(1)).await.unwrap();
        let snap = vars.snapshot(&scope).unwrap();

        vars.set(&scope, "a", &VarValue::Integer(2)).await.unwrap();
        vars.set(&scope, "b", &VarValue::Boolean(true))
            .await
            .unwrap();

        vars.restore(&scope, &snap).await.unwrap();
        let all = vars.all_at(&scope).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all["a"], VarValue::Integer(1));
    }
}
