//! Graph entities produced by the analysis pipeline.
//!
//! Node identity is content-addressed: the id is a pure function of
//! `(project_id, kind, fully_qualified_name, uri)`, so concurrent workers
//! and repeated runs produce identical ids without coordination.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Hex-encoded 128-bit content hash.
pub type NodeId = String;

/// Field separator for the identity preimage.
const ID_SEPARATOR: u8 = 0x1F;

/// Compute a node id from its logical attributes.
///
/// Takes the low 128 bits of a blake3 hash over the separated fields.
pub fn node_id(project_id: Uuid, kind: NodeKind, fully_qualified_name: &str, uri: &str) -> NodeId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(project_id.as_bytes());
    hasher.update(&[ID_SEPARATOR]);
    hasher.update(kind.as_str().as_bytes());
    hasher.update(&[ID_SEPARATOR]);
    hasher.update(fully_qualified_name.as_bytes());
    hasher.update(&[ID_SEPARATOR]);
    hasher.update(uri.as_bytes());
    let hash = hasher.finalize();
    hash.to_hex()[..32].to_string()
}

/// Closed enumeration of code entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Project,
    File,
    Config,
    Module,
    Namespace,
    Package,
    Class,
    Interface,
    Enum,
    Function,
    Method,
    Variable,
    Constant,
    Parameter,
    Annotation,
    Event,
    Operator,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Project => "Project",
            NodeKind::File => "File",
            NodeKind::Config => "Config",
            NodeKind::Module => "Module",
            NodeKind::Namespace => "Namespace",
            NodeKind::Package => "Package",
            NodeKind::Class => "Class",
            NodeKind::Interface => "Interface",
            NodeKind::Enum => "Enum",
            NodeKind::Function => "Function",
            NodeKind::Method => "Method",
            NodeKind::Variable => "Variable",
            NodeKind::Constant => "Constant",
            NodeKind::Parameter => "Parameter",
            NodeKind::Annotation => "Annotation",
            NodeKind::Event => "Event",
            NodeKind::Operator => "Operator",
        }
    }

    /// Whether references to this kind represent call sites.
    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            NodeKind::Function | NodeKind::Method | NodeKind::Operator
        )
    }
}

/// Zero-based source position, matching LSP conventions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

/// Source span of a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRange {
    pub start_line: u32,
    pub start_char: u32,
    pub end_line: u32,
    pub end_char: u32,
}

impl SourceRange {
    pub fn contains(&self, position: Position) -> bool {
        let after_start = position.line > self.start_line
            || (position.line == self.start_line && position.character >= self.start_char);
        let before_end = position.line < self.end_line
            || (position.line == self.end_line && position.character <= self.end_char);
        after_start && before_end
    }

    /// Line span, used to pick the narrowest enclosing node.
    pub fn extent(&self) -> u64 {
        u64::from(self.end_line - self.start_line) << 32
            | u64::from(self.end_char.wrapping_sub(self.start_char))
    }
}

/// A code symbol node in the knowledge graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeNode {
    pub id: NodeId,
    pub kind: NodeKind,
    pub name: String,
    pub fully_qualified_name: String,
    /// Canonical `file://` form.
    pub uri: String,
    pub range: SourceRange,
}

impl CodeNode {
    pub fn new(
        project_id: Uuid,
        kind: NodeKind,
        name: impl Into<String>,
        fully_qualified_name: impl Into<String>,
        uri: impl Into<String>,
        range: SourceRange,
    ) -> Self {
        let name = name.into();
        let fully_qualified_name = fully_qualified_name.into();
        let uri = uri.into();
        let id = node_id(project_id, kind, &fully_qualified_name, &uri);
        Self {
            id,
            kind,
            name,
            fully_qualified_name,
            uri,
            range,
        }
    }
}

/// Relation kinds between nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeType {
    Contains,
    References,
    InheritsFrom,
    Implements,
    Imports,
    PartOf,
    DependsOn,
    Calls,
    Overrides,
    HasType,
}

impl EdgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::Contains => "CONTAINS",
            EdgeType::References => "REFERENCES",
            EdgeType::InheritsFrom => "INHERITS_FROM",
            EdgeType::Implements => "IMPLEMENTS",
            EdgeType::Imports => "IMPORTS",
            EdgeType::PartOf => "PART_OF",
            EdgeType::DependsOn => "DEPENDS_ON",
            EdgeType::Calls => "CALLS",
            EdgeType::Overrides => "OVERRIDES",
            EdgeType::HasType => "HAS_TYPE",
        }
    }
}

/// Unique identity of an edge.
pub type EdgeKey = (NodeId, NodeId, EdgeType);

/// A directed, typed relation between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
    #[serde(rename = "type")]
    pub edge_type: EdgeType,
}

impl Edge {
    pub fn new(source: NodeId, target: NodeId, edge_type: EdgeType) -> Self {
        Self {
            source,
            target,
            edge_type,
        }
    }

    pub fn key(&self) -> EdgeKey {
        (self.source.clone(), self.target.clone(), self.edge_type)
    }
}

/// Job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Which traversal pass the job is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisPass {
    Structure,
    References,
    Done,
}

/// How the project source arrived on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Git,
    Zip,
}

/// A registered project; created by the ingestion collaborator and
/// immutable for the duration of any job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub project_id: Uuid,
    pub name: String,
    pub root_path: PathBuf,
    pub source_type: SourceType,
    pub created_at: u64,
}

impl Project {
    pub fn new(name: impl Into<String>, root_path: PathBuf, source_type: SourceType) -> Self {
        Self {
            project_id: Uuid::new_v4(),
            name: name.into(),
            root_path,
            source_type,
            created_at: unix_now(),
        }
    }
}

/// Terminal/boundary markers a batch may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    StructureComplete,
    ReferencesComplete,
    Error,
    Complete,
}

/// Progress counters attached to batches and status updates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisStats {
    pub processed_files: u64,
    pub total_files: u64,
    pub total_symbols: u64,
    pub total_edges: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A failed file as reported in batches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedFile {
    pub path: String,
    pub retry_count: u32,
    pub last_error: String,
    pub last_position: Position,
}

/// A sequenced, atomic unit of graph updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchUpdate {
    pub job_id: Uuid,
    /// Monotonically increasing, starting at 1 per job.
    pub sequence: u64,
    pub nodes: Vec<CodeNode>,
    pub edges: Vec<Edge>,
    pub processed_files: Vec<String>,
    pub failed_files: Vec<FailedFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<BatchStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statistics: Option<AnalysisStats>,
}

/// Retry bookkeeping for one failed file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedFileInfo {
    pub retry_count: u32,
    pub last_error: String,
    /// Lets the next attempt skip the exact offending symbol.
    pub last_position: Position,
}

/// Aggregate counters carried by the checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointStats {
    pub total_processed: u64,
    pub total_failed: u64,
    pub retry_count: u64,
}

/// Durable snapshot of job progress.
///
/// Invariant: `processed_files` and `failed_files` are disjoint, and
/// `last_committed_sequence` matches the highest batch durably applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_id: Uuid,
    pub pass: AnalysisPass,
    pub processed_files: BTreeSet<String>,
    /// Files in flight when the snapshot was taken; requeued on resume.
    pub in_progress: BTreeSet<String>,
    pub failed_files: BTreeMap<String, FailedFileInfo>,
    /// Import names discovered in pass 1, keyed by the importing module's
    /// node id; resolved at the pass boundary, so they must survive a
    /// mid-pass crash.
    #[serde(default)]
    pub pending_imports: BTreeMap<String, BTreeSet<String>>,
    pub last_committed_sequence: u64,
    pub statistics: CheckpointStats,
    pub updated_at: u64,
}

impl Checkpoint {
    pub fn empty(job_id: Uuid) -> Self {
        Self {
            job_id,
            pass: AnalysisPass::Structure,
            processed_files: BTreeSet::new(),
            in_progress: BTreeSet::new(),
            failed_files: BTreeMap::new(),
            pending_imports: BTreeMap::new(),
            last_committed_sequence: 0,
            statistics: CheckpointStats::default(),
            updated_at: unix_now(),
        }
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_is_deterministic() {
        let project = Uuid::new_v4();
        let a = node_id(project, NodeKind::Class, "pkg.a.A", "file:///repo/pkg/a.py");
        let b = node_id(project, NodeKind::Class, "pkg.a.A", "file:///repo/pkg/a.py");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn node_id_varies_by_field() {
        let project = Uuid::new_v4();
        let base = node_id(project, NodeKind::Class, "pkg.a.A", "file:///repo/pkg/a.py");
        assert_ne!(
            base,
            node_id(project, NodeKind::Interface, "pkg.a.A", "file:///repo/pkg/a.py")
        );
        assert_ne!(
            base,
            node_id(project, NodeKind::Class, "pkg.a.B", "file:///repo/pkg/a.py")
        );
        assert_ne!(
            base,
            node_id(project, NodeKind::Class, "pkg.a.A", "file:///repo/pkg/b.py")
        );
        assert_ne!(
            base,
            node_id(Uuid::new_v4(), NodeKind::Class, "pkg.a.A", "file:///repo/pkg/a.py")
        );
    }

    #[test]
    fn separator_prevents_field_gluing() {
        let project = Uuid::new_v4();
        // "ab" + "c" must not collide with "a" + "bc".
        let left = node_id(project, NodeKind::Module, "ab", "c");
        let right = node_id(project, NodeKind::Module, "a", "bc");
        assert_ne!(left, right);
    }

    #[test]
    fn range_containment() {
        let range = SourceRange {
            start_line: 2,
            start_char: 4,
            end_line: 5,
            end_char: 0,
        };
        assert!(range.contains(Position { line: 3, character: 0 }));
        assert!(range.contains(Position { line: 2, character: 4 }));
        assert!(!range.contains(Position { line: 2, character: 3 }));
        assert!(!range.contains(Position { line: 6, character: 0 }));
    }

    #[test]
    fn edge_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&EdgeType::InheritsFrom).unwrap(),
            "\"INHERITS_FROM\""
        );
        assert_eq!(serde_json::to_string(&EdgeType::Contains).unwrap(), "\"CONTAINS\"");
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Paused.is_terminal());
    }
}
