//! Graph data model and persistence seam.

pub mod model;
pub mod store;

pub use model::{
    AnalysisPass, AnalysisStats, BatchStatus, BatchUpdate, Checkpoint, CheckpointStats, CodeNode,
    Edge, EdgeKey, EdgeType, FailedFile, FailedFileInfo, JobStatus, NodeId, NodeKind, Position,
    Project, SourceRange, SourceType,
};
pub use store::{GraphStore, MemoryGraphStore, Subgraph};
