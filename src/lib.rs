//! codegraphd: streaming code knowledge-graph analysis.
//!
//! Ingests a source repository and produces an incrementally streamed
//! knowledge graph of code symbols and relations, discovered by driving a
//! pool of out-of-process language servers. Clients subscribe over a local
//! message channel and receive sequenced batches, progress updates, and
//! terminal status; interrupted jobs resume from durable checkpoints.

// Core pipeline
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod language_detector;
pub mod mapper;
pub mod orchestrator;
pub mod symbol_registry;
pub mod walker;
pub mod work_queue;

// Language server integration
pub mod lsp;

// Graph model and persistence
pub mod graph;

// Streaming and job management
pub mod broker;
pub mod job_registry;

// Client protocol and transport
pub mod daemon;
pub mod ipc;
pub mod protocol;
pub mod socket_path;

// Re-export commonly used types
pub use broker::{BrokerEvent, SubscriptionBroker};
pub use checkpoint::CheckpointManager;
pub use config::AnalysisConfig;
pub use daemon::AnalysisDaemon;
pub use error::{AnalysisError, LspError, StoreError};
pub use graph::model::{
    AnalysisPass, AnalysisStats, BatchStatus, BatchUpdate, Checkpoint, CodeNode, Edge, EdgeType,
    JobStatus, NodeKind, Position, Project, SourceRange, SourceType,
};
pub use graph::store::{GraphStore, MemoryGraphStore, Subgraph};
pub use job_registry::{JobRegistry, JobSnapshot, StartedJob};
pub use language_detector::{Language, LanguageDetector};
pub use lsp::{LanguageRegistry, LspClient, ServerPool, ServerSpec, SymbolSource};
pub use mapper::SymbolMapper;
pub use orchestrator::{AnalysisOrchestrator, CancelFlag, JobOutcome, JobProgress};
pub use protocol::{ClientDecodeError, ClientMessage, ErrorType, MessageCodec, ServerMessage};
pub use symbol_registry::{RegisteredSymbol, SymbolRegistry};
pub use walker::{FileDescriptor, FilePriority, FileWalker};
pub use work_queue::{WorkItem, WorkQueue};
