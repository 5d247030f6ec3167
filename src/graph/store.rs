//! Graph persistence seam.
//!
//! Backends implement `GraphStore`; the pipeline only relies on idempotent
//! upserts keyed on node id and `(source, target, type)`, plus a
//! compare-and-set on the checkpoint sequence. `MemoryGraphStore` is the
//! reference implementation and the test double.

use crate::error::StoreError;
use crate::graph::model::{BatchUpdate, Checkpoint, CodeNode, Edge, EdgeKey, NodeId, Project};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// A connected slice of the graph, as returned by `read_subgraph`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Subgraph {
    pub nodes: Vec<CodeNode>,
    pub edges: Vec<Edge>,
}

/// Pluggable persistence backend for graph data and checkpoints.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Create the project root node if it does not exist.
    async fn ensure_project(&self, project: &Project, node: &CodeNode) -> Result<(), StoreError>;

    /// Idempotent node upsert keyed on node id.
    async fn upsert_nodes(&self, nodes: &[CodeNode]) -> Result<(), StoreError>;

    /// Idempotent edge upsert keyed on `(source, target, type)`.
    async fn upsert_edges(&self, edges: &[Edge]) -> Result<(), StoreError>;

    /// Apply a whole batch transactionally. Replaying a batch leaves the
    /// store unchanged.
    async fn apply_batch(&self, batch: &BatchUpdate) -> Result<(), StoreError>;

    /// Nodes and edges reachable from `root` within `depth` hops.
    async fn read_subgraph(&self, root: &NodeId, depth: u32) -> Result<Subgraph, StoreError>;

    /// Persist a checkpoint. Rejects regressions of
    /// `last_committed_sequence` so a stale writer cannot clobber progress.
    async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError>;

    async fn read_checkpoint(&self, job_id: Uuid) -> Result<Option<Checkpoint>, StoreError>;

    /// Drop everything recorded for a job (checkpoint included).
    async fn delete_job(&self, job_id: Uuid) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct StoreState {
    projects: HashMap<Uuid, Project>,
    nodes: HashMap<NodeId, CodeNode>,
    edges: HashMap<EdgeKey, Edge>,
    checkpoints: HashMap<Uuid, Checkpoint>,
}

/// In-memory store; the reference for idempotence semantics.
#[derive(Debug, Default)]
pub struct MemoryGraphStore {
    state: RwLock<StoreState>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn node_count(&self) -> usize {
        self.state.read().await.nodes.len()
    }

    pub async fn edge_count(&self) -> usize {
        self.state.read().await.edges.len()
    }

    pub async fn node(&self, id: &str) -> Option<CodeNode> {
        self.state.read().await.nodes.get(id).cloned()
    }

    pub async fn node_ids(&self) -> HashSet<NodeId> {
        self.state.read().await.nodes.keys().cloned().collect()
    }

    pub async fn nodes(&self) -> Vec<CodeNode> {
        self.state.read().await.nodes.values().cloned().collect()
    }

    pub async fn edge_keys(&self) -> HashSet<EdgeKey> {
        self.state.read().await.edges.keys().cloned().collect()
    }

    pub async fn find_by_fqn(&self, fqn: &str) -> Option<CodeNode> {
        self.state
            .read()
            .await
            .nodes
            .values()
            .find(|n| n.fully_qualified_name == fqn)
            .cloned()
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn ensure_project(&self, project: &Project, node: &CodeNode) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state
            .projects
            .entry(project.project_id)
            .or_insert_with(|| project.clone());
        state
            .nodes
            .entry(node.id.clone())
            .or_insert_with(|| node.clone());
        Ok(())
    }

    async fn upsert_nodes(&self, nodes: &[CodeNode]) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        for node in nodes {
            state.nodes.insert(node.id.clone(), node.clone());
        }
        Ok(())
    }

    async fn upsert_edges(&self, edges: &[Edge]) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        for edge in edges {
            state.edges.insert(edge.key(), edge.clone());
        }
        Ok(())
    }

    async fn apply_batch(&self, batch: &BatchUpdate) -> Result<(), StoreError> {
        // Single write lock makes the whole batch atomic.
        let mut state = self.state.write().await;
        for node in &batch.nodes {
            state.nodes.insert(node.id.clone(), node.clone());
        }
        for edge in &batch.edges {
            state.edges.insert(edge.key(), edge.clone());
        }
        debug!(
            "Applied batch {} for job {} ({} nodes, {} edges)",
            batch.sequence,
            batch.job_id,
            batch.nodes.len(),
            batch.edges.len()
        );
        Ok(())
    }

    async fn read_subgraph(&self, root: &NodeId, depth: u32) -> Result<Subgraph, StoreError> {
        let state = self.state.read().await;
        if !state.nodes.contains_key(root) {
            return Ok(Subgraph::default());
        }

        let mut adjacency: HashMap<&NodeId, Vec<&Edge>> = HashMap::new();
        for edge in state.edges.values() {
            adjacency.entry(&edge.source).or_default().push(edge);
        }

        let mut visited: HashSet<NodeId> = HashSet::new();
        let mut queue: VecDeque<(NodeId, u32)> = VecDeque::new();
        visited.insert(root.clone());
        queue.push_back((root.clone(), 0));
        let mut edges = Vec::new();

        while let Some((current, level)) = queue.pop_front() {
            if level >= depth {
                continue;
            }
            if let Some(outgoing) = adjacency.get(&current) {
                for edge in outgoing {
                    edges.push((*edge).clone());
                    if visited.insert(edge.target.clone()) {
                        queue.push_back((edge.target.clone(), level + 1));
                    }
                }
            }
        }

        let nodes = visited
            .iter()
            .filter_map(|id| state.nodes.get(id).cloned())
            .collect();
        Ok(Subgraph { nodes, edges })
    }

    async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.checkpoints.get(&checkpoint.job_id) {
            if checkpoint.last_committed_sequence < existing.last_committed_sequence {
                return Err(StoreError::SequenceConflict {
                    attempted: checkpoint.last_committed_sequence,
                    current: existing.last_committed_sequence,
                });
            }
        }
        state
            .checkpoints
            .insert(checkpoint.job_id, checkpoint.clone());
        Ok(())
    }

    async fn read_checkpoint(&self, job_id: Uuid) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self.state.read().await.checkpoints.get(&job_id).cloned())
    }

    async fn delete_job(&self, job_id: Uuid) -> Result<(), StoreError> {
        self.state.write().await.checkpoints.remove(&job_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::model::{AnalysisPass, EdgeType, NodeKind, SourceRange};

    fn node(project: Uuid, fqn: &str) -> CodeNode {
        CodeNode::new(
            project,
            NodeKind::Class,
            fqn.rsplit('.').next().unwrap(),
            fqn,
            format!("file:///repo/{}.py", fqn.replace('.', "/")),
            SourceRange::default(),
        )
    }

    fn batch(job_id: Uuid, sequence: u64, nodes: Vec<CodeNode>, edges: Vec<Edge>) -> BatchUpdate {
        BatchUpdate {
            job_id,
            sequence,
            nodes,
            edges,
            processed_files: vec![],
            failed_files: vec![],
            status: None,
            statistics: None,
        }
    }

    #[tokio::test]
    async fn apply_batch_is_idempotent() {
        let store = MemoryGraphStore::new();
        let project = Uuid::new_v4();
        let a = node(project, "pkg.a.A");
        let b = node(project, "pkg.b.B");
        let edge = Edge::new(a.id.clone(), b.id.clone(), EdgeType::References);
        let update = batch(Uuid::new_v4(), 1, vec![a, b], vec![edge]);

        store.apply_batch(&update).await.unwrap();
        let nodes_before = store.node_count().await;
        let edges_before = store.edge_count().await;

        store.apply_batch(&update).await.unwrap();
        assert_eq!(store.node_count().await, nodes_before);
        assert_eq!(store.edge_count().await, edges_before);
    }

    #[tokio::test]
    async fn checkpoint_sequence_cannot_regress() {
        let store = MemoryGraphStore::new();
        let job_id = Uuid::new_v4();

        let mut checkpoint = Checkpoint::empty(job_id);
        checkpoint.last_committed_sequence = 5;
        store.write_checkpoint(&checkpoint).await.unwrap();

        // Same sequence replays are fine (at-least-once).
        store.write_checkpoint(&checkpoint).await.unwrap();

        checkpoint.last_committed_sequence = 3;
        let err = store.write_checkpoint(&checkpoint).await.unwrap_err();
        assert!(matches!(err, StoreError::SequenceConflict { attempted: 3, current: 5 }));
    }

    #[tokio::test]
    async fn read_subgraph_walks_contains_chain() {
        let store = MemoryGraphStore::new();
        let project = Uuid::new_v4();
        let root = node(project, "root");
        let mid = node(project, "root.mid");
        let leaf = node(project, "root.mid.leaf");
        let edges = vec![
            Edge::new(root.id.clone(), mid.id.clone(), EdgeType::Contains),
            Edge::new(mid.id.clone(), leaf.id.clone(), EdgeType::Contains),
        ];
        let update = batch(Uuid::new_v4(), 1, vec![root.clone(), mid, leaf], edges);
        store.apply_batch(&update).await.unwrap();

        let shallow = store.read_subgraph(&root.id, 1).await.unwrap();
        assert_eq!(shallow.nodes.len(), 2);

        let deep = store.read_subgraph(&root.id, 10).await.unwrap();
        assert_eq!(deep.nodes.len(), 3);
        assert_eq!(deep.edges.len(), 2);
    }

    #[tokio::test]
    async fn checkpoint_round_trip_and_delete() {
        let store = MemoryGraphStore::new();
        let job_id = Uuid::new_v4();
        assert!(store.read_checkpoint(job_id).await.unwrap().is_none());

        let mut checkpoint = Checkpoint::empty(job_id);
        checkpoint.pass = AnalysisPass::References;
        checkpoint.processed_files.insert("pkg/a.py".into());
        store.write_checkpoint(&checkpoint).await.unwrap();

        let loaded = store.read_checkpoint(job_id).await.unwrap().unwrap();
        assert_eq!(loaded.pass, AnalysisPass::References);
        assert!(loaded.processed_files.contains("pkg/a.py"));

        store.delete_job(job_id).await.unwrap();
        assert!(store.read_checkpoint(job_id).await.unwrap().is_none());
    }
}
