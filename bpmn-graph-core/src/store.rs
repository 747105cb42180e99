//! Graph store: a quadstore partitioned into five named graphs.
//!
//! One writer per named graph (a tokio mutex each), unbounded readers.
//! Cross-graph atomicity is the caller's business; the instance supervisor
//! orders its writes inst -> tasks -> log under the instance lock.

use std::io::Write;
use std::path::{Path, PathBuf};

use oxigraph::io::GraphFormat;
use oxigraph::model::{GraphName, GraphNameRef, NamedNode, NamedNodeRef, Quad, Subject, Term};
use oxigraph::sparql::{Query, QueryResults, QuerySolution};
use oxigraph::store::Store;
use tokio::sync::Mutex;

use crate::error::{EngineError, Result};
use crate::vocab;

/// A single write against one named graph.
#[derive(Debug, Clone)]
pub enum GraphOp {
    Insert {
        subject: NamedNode,
        predicate: NamedNode,
        object: Term,
    },
    /// Remove every quad matching the (optional) pattern components.
    RemovePattern {
        subject: Option<NamedNode>,
        predicate: Option<NamedNode>,
        object: Option<Term>,
    },
}

impl GraphOp {
    pub fn insert(subject: &NamedNode, predicate: &NamedNode, object: impl Into<Term>) -> Self {
        Self::Insert {
            subject: subject.clone(),
            predicate: predicate.clone(),
            object: object.into(),
        }
    }

    pub fn remove(
        subject: Option<&NamedNode>,
        predicate: Option<&NamedNode>,
        object: Option<&Term>,
    ) -> Self {
        Self::RemovePattern {
            subject: subject.cloned(),
            predicate: predicate.cloned(),
            object: object.cloned(),
        }
    }

    /// Replace the single value of (subject, predicate): remove then insert.
    pub fn replace(
        subject: &NamedNode,
        predicate: &NamedNode,
        object: impl Into<Term>,
    ) -> [Self; 2] {
        [
            Self::remove(Some(subject), Some(predicate), None),
            Self::insert(subject, predicate, object),
        ]
    }
}

pub struct GraphStore {
    store: Store,
    /// Per-named-graph write serialization, indexed in `vocab::ALL_GRAPHS`
    /// order.
    write_locks: [Mutex<()>; 5],
    data_dir: Option<PathBuf>,
}

fn lock_index(graph: NamedNodeRef<'_>) -> usize {
    vocab::ALL_GRAPHS
        .iter()
        .position(|g| *g == graph)
        .unwrap_or(0)
}

impl GraphStore {
    /// In-memory store, optionally backed by a snapshot directory that is
    /// reloaded now and rewritten by [`GraphStore::persist`].
    pub fn open(data_dir: Option<PathBuf>) -> Result<Self> {
        let store = Store::new().map_err(EngineError::store)?;
        let this = Self {
            store,
            write_locks: Default::default(),
            data_dir,
        };
        if let Some(dir) = this.data_dir.clone() {
            this.load_dir(&dir)?;
        }
        Ok(this)
    }

    // ── Reads (lock-free) ─────────────────────────────────────

    pub fn value(
        &self,
        graph: NamedNodeRef<'_>,
        subject: &NamedNode,
        predicate: &NamedNode,
    ) -> Result<Option<Term>> {
        let mut iter = self.store.quads_for_pattern(
            Some(subject.as_ref().into()),
            Some(predicate.as_ref()),
            None,
            Some(graph.into()),
        );
        match iter.next() {
            Some(q) => Ok(Some(q.map_err(EngineError::store)?.object)),
            None => Ok(None),
        }
    }

    pub fn objects(
        &self,
        graph: NamedNodeRef<'_>,
        subject: &NamedNode,
        predicate: &NamedNode,
    ) -> Result<Vec<Term>> {
        self.store
            .quads_for_pattern(
                Some(subject.as_ref().into()),
                Some(predicate.as_ref()),
                None,
                Some(graph.into()),
            )
            .map(|q| q.map(|q| q.object).map_err(EngineError::store))
            .collect()
    }

    /// Named-node subjects holding (predicate, object).
    pub fn subjects(
        &self,
        graph: NamedNodeRef<'_>,
        predicate: &NamedNode,
        object: &Term,
    ) -> Result<Vec<NamedNode>> {
        let mut out = Vec::new();
        for q in self.store.quads_for_pattern(
            None,
            Some(predicate.as_ref()),
            Some(object.as_ref()),
            Some(graph.into()),
        ) {
            let q = q.map_err(EngineError::store)?;
            if let Subject::NamedNode(n) = q.subject {
                out.push(n);
            }
        }
        Ok(out)
    }

    /// All (predicate, object) pairs off a subject.
    pub fn properties(
        &self,
        graph: NamedNodeRef<'_>,
        subject: &NamedNode,
    ) -> Result<Vec<(NamedNode, Term)>> {
        let mut out = Vec::new();
        for q in self.store.quads_for_pattern(
            Some(subject.as_ref().into()),
            None,
            None,
            Some(graph.into()),
        ) {
            let q = q.map_err(EngineError::store)?;
            out.push((q.predicate, q.object));
        }
        Ok(out)
    }

    pub fn contains(
        &self,
        graph: NamedNodeRef<'_>,
        subject: &NamedNode,
        predicate: &NamedNode,
        object: &Term,
    ) -> Result<bool> {
        let quad = Quad::new(subject.clone(), predicate.clone(), object.clone(), graph);
        self.store.contains(&quad).map_err(EngineError::store)
    }

    // ── SPARQL ────────────────────────────────────────────────

    /// Run a read-only query with the named graph as the default graph, so
    /// plain triple patterns address that partition.
    pub fn query(&self, graph: NamedNodeRef<'_>, sparql: &str) -> Result<QueryResults> {
        let mut query = Query::parse(sparql, None)
            .map_err(|e| EngineError::Store(format!("SPARQL parse: {e}")))?;
        query
            .dataset_mut()
            .set_default_graph(vec![GraphName::NamedNode(graph.into_owned())]);
        self.store.query(query).map_err(EngineError::store)
    }

    pub fn ask(&self, graph: NamedNodeRef<'_>, sparql: &str) -> Result<bool> {
        match self.query(graph, sparql)? {
            QueryResults::Boolean(b) => Ok(b),
            _ => Err(EngineError::Store("expected ASK result".into())),
        }
    }

    pub fn select(&self, graph: NamedNodeRef<'_>, sparql: &str) -> Result<Vec<QuerySolution>> {
        match self.query(graph, sparql)? {
            QueryResults::Solutions(iter) => iter
                .map(|s| s.map_err(EngineError::store))
                .collect::<Result<Vec<_>>>(),
            _ => Err(EngineError::Store("expected SELECT result".into())),
        }
    }

    // ── Writes (serialized per graph) ─────────────────────────

    pub async fn insert(
        &self,
        graph: NamedNodeRef<'_>,
        subject: &NamedNode,
        predicate: &NamedNode,
        object: impl Into<Term>,
    ) -> Result<()> {
        self.apply(graph, vec![GraphOp::insert(subject, predicate, object)])
            .await
    }

    pub async fn replace(
        &self,
        graph: NamedNodeRef<'_>,
        subject: &NamedNode,
        predicate: &NamedNode,
        object: impl Into<Term>,
    ) -> Result<()> {
        self.apply(graph, GraphOp::replace(subject, predicate, object).to_vec())
            .await
    }

    pub async fn remove_pattern(
        &self,
        graph: NamedNodeRef<'_>,
        subject: Option<&NamedNode>,
        predicate: Option<&NamedNode>,
        object: Option<&Term>,
    ) -> Result<()> {
        self.apply(graph, vec![GraphOp::remove(subject, predicate, object)])
            .await
    }

    /// Apply a batch of ops atomically with respect to other writers of the
    /// same graph.
    pub async fn apply(&self, graph: NamedNodeRef<'_>, ops: Vec<GraphOp>) -> Result<()> {
        let _guard = self.write_locks[lock_index(graph)].lock().await;
        self.apply_unlocked(graph, ops)
    }

    /// Compare-and-set: evaluate an ASK against the graph inside its write
    /// lock and apply the ops only when it holds. Returns whether it did.
    pub async fn apply_if(
        &self,
        graph: NamedNodeRef<'_>,
        guard_ask: &str,
        ops: Vec<GraphOp>,
    ) -> Result<bool> {
        let _guard = self.write_locks[lock_index(graph)].lock().await;
        if !self.ask(graph, guard_ask)? {
            return Ok(false);
        }
        self.apply_unlocked(graph, ops)?;
        Ok(true)
    }

    fn apply_unlocked(&self, graph: NamedNodeRef<'_>, ops: Vec<GraphOp>) -> Result<()> {
        for op in ops {
            match op {
                GraphOp::Insert {
                    subject,
                    predicate,
                    object,
                } => {
                    let quad = Quad::new(subject, predicate, object, graph);
                    self.store.insert(&quad).map_err(EngineError::store)?;
                }
                GraphOp::RemovePattern {
                    subject,
                    predicate,
                    object,
                } => {
                    let matches: Vec<Quad> = self
                        .store
                        .quads_for_pattern(
                            subject.as_ref().map(|s| s.as_ref().into()),
                            predicate.as_ref().map(|p| p.as_ref()),
                            object.as_ref().map(|o| o.as_ref()),
                            Some(graph.into()),
                        )
                        .collect::<std::result::Result<_, _>>()
                        .map_err(EngineError::store)?;
                    for quad in &matches {
                        self.store.remove(quad).map_err(EngineError::store)?;
                    }
                }
            }
        }
        Ok(())
    }

    // ── Snapshots (§ persistence format) ──────────────────────

    /// Serialize one named graph as canonical N-Triples.
    pub fn snapshot(&self, graph: NamedNodeRef<'_>) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.store
            .dump_graph(&mut buf, GraphFormat::NTriples, GraphNameRef::from(graph))
            .map_err(EngineError::store)?;
        Ok(buf)
    }

    /// Replace a named graph's content from serialized N-Triples.
    pub async fn restore(&self, graph: NamedNodeRef<'_>, bytes: &[u8]) -> Result<()> {
        let _guard = self.write_locks[lock_index(graph)].lock().await;
        self.store
            .clear_graph(GraphNameRef::from(graph))
            .map_err(EngineError::store)?;
        self.store
            .load_graph(bytes, GraphFormat::NTriples, GraphNameRef::from(graph), None)
            .map_err(EngineError::store)
    }

    /// Write every named graph to the data directory, atomically per file
    /// (temp file + rename). No-op without a data directory.
    pub async fn persist(&self) -> Result<()> {
        let Some(dir) = self.data_dir.clone() else {
            return Ok(());
        };
        std::fs::create_dir_all(&dir).map_err(EngineError::store)?;
        for graph in vocab::ALL_GRAPHS {
            let _guard = self.write_locks[lock_index(graph)].lock().await;
            let bytes = self.snapshot(graph)?;
            let stem = vocab::graph_file_stem(graph);
            write_atomic(&dir, stem, &bytes)?;
        }
        Ok(())
    }

    fn load_dir(&self, dir: &Path) -> Result<()> {
        for graph in vocab::ALL_GRAPHS {
            let path = dir.join(format!("{}.nt", vocab::graph_file_stem(graph)));
            if !path.exists() {
                continue;
            }
            let bytes = std::fs::read(&path).map_err(EngineError::store)?;
            self.store
                .load_graph(
                    bytes.as_slice(),
                    GraphFormat::NTriples,
                    GraphNameRef::from(graph),
                    None,
                )
                .map_err(EngineError::store)?;
            tracing::info!(graph = %graph, path = %path.display(), "restored graph snapshot");
        }
        Ok(())
    }
}

fn write_atomic(dir: &Path, stem: &str, bytes: &[u8]) -> Result<()> {
    let tmp = dir.join(format!(".{stem}.nt.tmp"));
    let path = dir.join(format!("{stem}.nt"));
    let mut file = std::fs::File::create(&tmp).map_err(EngineError::store)?;
    file.write_all(bytes).map_err(EngineError::store)?;
    file.sync_all().map_err(EngineError::store)?;
    std::fs::rename(&tmp, &path).map_err(EngineError::store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::{GRAPH_DEFS, GRAPH_INST};
    use oxigraph::model::Literal;

    fn subject(n: &str) -> NamedNode {
        NamedNode::new_unchecked(format!("http://bpmn-graph.dev/test/{n}"))
    }

    #[tokio::test]
    async fn insert_and_read_back() {
        let store = GraphStore::open(None).unwrap();
        let s = subject("a");
        let p = subject("p");
        store
            .insert(GRAPH_INST, &s, &p, Literal::from("v1"))
            .await
            .unwrap();

        let got = store.value(GRAPH_INST, &s, &p).unwrap().unwrap();
        assert_eq!(got, Term::from(Literal::from("v1")));
        // Named-graph isolation: nothing in defs.
        assert!(store.value(GRAPH_DEFS, &s, &p).unwrap().is_none());
    }

    #[tokio::test]
    async fn replace_is_single_valued() {
        let store = GraphStore::open(None).unwrap();
        let s = subject("a");
        let p = subject("p");
        store
            .insert(GRAPH_INST, &s, &p, Literal::from("v1"))
            .await
            .unwrap();
        store
            .replace(GRAPH_INST, &s, &p, Literal::from("v2"))
            .await
            .unwrap();

        let objects = store.objects(GRAPH_INST, &s, &p).unwrap();
        assert_eq!(objects, vec![Term::from(Literal::from("v2"))]);
    }

    #[tokio::test]
    async fn ask_addresses_the_named_graph() {
        let store = GraphStore::open(None).unwrap();
        let s = subject("x");
        let p = subject("p");
        store
            .insert(GRAPH_INST, &s, &p, Literal::from("1"))
            .await
            .unwrap();

        let ask = format!("ASK {{ <{}> <{}> ?v }}", s.as_str(), p.as_str());
        assert!(store.ask(GRAPH_INST, &ask).unwrap());
        assert!(!store.ask(GRAPH_DEFS, &ask).unwrap());
    }

    #[tokio::test]
    async fn apply_if_rejects_when_guard_fails() {
        let store = GraphStore::open(None).unwrap();
        let s = subject("job");
        let p = subject("holder");
        let guard = format!(
            "ASK {{ FILTER NOT EXISTS {{ <{}> <{}> ?h }} }}",
            s.as_str(),
            p.as_str()
        );

        let claimed = store
            .apply_if(
                GRAPH_INST,
                &guard,
                vec![GraphOp::insert(&s, &p, Literal::from("w1"))],
            )
            .await
            .unwrap();
        assert!(claimed);

        // Second claim fails: the holder triple now exists.
        let claimed = store
            .apply_if(
                GRAPH_INST,
                &guard,
                vec![GraphOp::insert(&s, &p, Literal::from("w2"))],
            )
            .await
            .unwrap();
        assert!(!claimed);
        assert_eq!(store.objects(GRAPH_INST, &s, &p).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn snapshot_restore_round_trip() {
        let store = GraphStore::open(None).unwrap();
        let s = subject("a");
        let p = subject("p");
        store
            .insert(GRAPH_INST, &s, &p, Literal::from("v"))
            .await
            .unwrap();

        let bytes = store.snapshot(GRAPH_INST).unwrap();
        let other = GraphStore::open(None).unwrap();
        other.restore(GRAPH_INST, &bytes).await.unwrap();
        assert!(other.value(GRAPH_INST, &s, &p).unwrap().is_some());
    }

    #[tokio::test]
    async fn persist_and_reload_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        let s = subject("a");
        let p = subject("p");
        {
            let store = GraphStore::open(Some(dir.path().to_path_buf())).unwrap();
            store
                .insert(GRAPH_DEFS, &s, &p, Literal::from("v"))
                .await
                .unwrap();
            store.persist().await.unwrap();
        }
        let reloaded = GraphStore::open(Some(dir.path().to_path_buf())).unwrap();
        assert!(reloaded.value(GRAPH_DEFS, &s, &p).unwrap().is_some());
    }
}
