//! The two-pass analysis pipeline.
//!
//! Phase order: Init -> Discovery -> Pass 1 (structure) -> Pass 2
//! (references) -> Finalize. Workers pull files from the priority queue and
//! push results to a single assembler, which owns batch assembly, sequence
//! numbering, and the commit discipline: apply to the store, persist the
//! checkpoint, then publish to subscribers, in that order.

use crate::broker::SubscriptionBroker;
use crate::checkpoint::CheckpointManager;
use crate::config::AnalysisConfig;
use crate::error::{AnalysisError, LspError, StoreError};
use crate::graph::model::{
    AnalysisPass, AnalysisStats, BatchStatus, BatchUpdate, CodeNode, Edge, FailedFile, NodeId,
    NodeKind, Position, Project,
};
use crate::graph::store::GraphStore;
use crate::language_detector::{Language, LanguageDetector};
use crate::lsp::client::path_to_uri;
use crate::lsp::types::LspPosition;
use crate::lsp::SymbolSource;
use crate::mapper::{MappedFile, SymbolMapper};
use crate::symbol_registry::{RegisteredSymbol, SymbolRegistry};
use crate::walker::FileWalker;
use crate::work_queue::{WorkItem, WorkQueue};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long a worker blocks on the queue before re-checking for shutdown.
const POP_DEADLINE: Duration = Duration::from_millis(200);

/// Symbol kinds worth a pass-2 reference query.
fn queries_references(kind: NodeKind) -> bool {
    matches!(
        kind,
        NodeKind::Class
            | NodeKind::Interface
            | NodeKind::Enum
            | NodeKind::Function
            | NodeKind::Method
            | NodeKind::Variable
            | NodeKind::Constant
    )
}

/// Cooperative cancellation flag shared between registry and pipeline.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Re-arm the flag before a resumed run.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Lock-free progress counters shared with the job registry.
#[derive(Debug, Default)]
pub struct JobProgress {
    processed_files: AtomicU64,
    total_files: AtomicU64,
    failed_files: AtomicU64,
    total_symbols: AtomicU64,
    total_edges: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl JobProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_totals(&self, total_files: u64, processed_files: u64) {
        self.total_files.store(total_files, Ordering::Relaxed);
        self.processed_files.store(processed_files, Ordering::Relaxed);
    }

    pub fn file_processed(&self) -> u64 {
        self.processed_files.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn file_failed(&self, error: &str) {
        self.failed_files.fetch_add(1, Ordering::Relaxed);
        self.record_error(error);
    }

    pub fn add_symbols(&self, count: u64) {
        self.total_symbols.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_edges(&self, count: u64) {
        self.total_edges.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_error(&self, error: &str) {
        let mut last = self.last_error.lock().unwrap_or_else(|e| e.into_inner());
        *last = Some(error.to_string());
    }

    pub fn stats(&self) -> AnalysisStats {
        AnalysisStats {
            processed_files: self.processed_files.load(Ordering::Relaxed),
            total_files: self.total_files.load(Ordering::Relaxed),
            total_symbols: self.total_symbols.load(Ordering::Relaxed),
            total_edges: self.total_edges.load(Ordering::Relaxed),
            error: self
                .last_error
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }
}

/// How a finished job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Cancelled,
}

enum WorkerEvent {
    /// Pass 1 success: structure mapped.
    Structured { item: WorkItem, mapped: MappedFile },
    /// Pass 2 success: relation edges discovered.
    EdgesFound { item: WorkItem, edges: Vec<Edge> },
    /// A failure that may be retried at file granularity.
    Failed {
        item: WorkItem,
        error: String,
        position: Position,
        transient: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassKind {
    Structure,
    References,
}

/// Shared state for one pass's workers.
struct PassContext {
    pass: PassKind,
    config: Arc<AnalysisConfig>,
    source: Arc<dyn SymbolSource>,
    mapper: Arc<SymbolMapper>,
    registry: Arc<SymbolRegistry>,
    checkpoint: Arc<CheckpointManager>,
    queue: Arc<WorkQueue>,
    cancel: CancelFlag,
    root: std::path::PathBuf,
}

/// Accumulates one in-flight batch.
struct BatchBuilder {
    nodes: Vec<CodeNode>,
    edges: Vec<Edge>,
    node_ids: HashSet<NodeId>,
    edge_keys: HashSet<(NodeId, NodeId, crate::graph::model::EdgeType)>,
    processed_files: Vec<String>,
    failed_files: Vec<FailedFile>,
    opened_at: Instant,
}

impl BatchBuilder {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            edges: Vec::new(),
            node_ids: HashSet::new(),
            edge_keys: HashSet::new(),
            processed_files: Vec::new(),
            failed_files: Vec::new(),
            opened_at: Instant::now(),
        }
    }

    fn add_nodes(&mut self, nodes: Vec<CodeNode>) {
        for node in nodes {
            if self.node_ids.insert(node.id.clone()) {
                self.nodes.push(node);
            }
        }
    }

    fn add_edges(&mut self, edges: Vec<Edge>) {
        for edge in edges {
            if self.edge_keys.insert(edge.key()) {
                self.edges.push(edge);
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.nodes.is_empty()
            && self.edges.is_empty()
            && self.processed_files.is_empty()
            && self.failed_files.is_empty()
    }

    fn should_close(&self, config: &AnalysisConfig) -> bool {
        self.nodes.len() >= config.batch_nodes
            || self.edges.len() >= config.batch_edges
            || (!self.is_empty() && self.opened_at.elapsed() >= config.batch_interval)
    }

    fn take(&mut self) -> (Vec<CodeNode>, Vec<Edge>, Vec<String>, Vec<FailedFile>) {
        let nodes = std::mem::take(&mut self.nodes);
        let edges = std::mem::take(&mut self.edges);
        let processed = std::mem::take(&mut self.processed_files);
        let failed = std::mem::take(&mut self.failed_files);
        self.node_ids.clear();
        self.edge_keys.clear();
        self.opened_at = Instant::now();
        (nodes, edges, processed, failed)
    }
}

/// Runs the whole pipeline for one job.
pub struct AnalysisOrchestrator {
    config: Arc<AnalysisConfig>,
    store: Arc<dyn GraphStore>,
    broker: Arc<SubscriptionBroker>,
    source: Arc<dyn SymbolSource>,
    detector: Arc<LanguageDetector>,
}

impl AnalysisOrchestrator {
    pub fn new(
        config: Arc<AnalysisConfig>,
        store: Arc<dyn GraphStore>,
        broker: Arc<SubscriptionBroker>,
        source: Arc<dyn SymbolSource>,
        detector: Arc<LanguageDetector>,
    ) -> Self {
        Self {
            config,
            store,
            broker,
            source,
            detector,
        }
    }

    /// Execute (or resume) the job to completion or cancellation.
    pub async fn run(
        &self,
        job_id: Uuid,
        project: Project,
        progress: Arc<JobProgress>,
        cancel: CancelFlag,
    ) -> Result<JobOutcome, AnalysisError> {
        // Init: checkpoint, project node, symbol registry.
        let mapper = Arc::new(SymbolMapper::new(&project));
        let project_node = mapper.project_node(&project);
        let (checkpoint, _interrupted) =
            CheckpointManager::resume(self.store.clone(), job_id).await?;
        let checkpoint = Arc::new(checkpoint);
        self.store.ensure_project(&project, &project_node).await?;
        let registry = Arc::new(SymbolRegistry::new());

        // Discovery: walk, filter, classify, cap.
        let walker = FileWalker::new(self.detector.clone(), self.config.max_file_bytes);
        let mut files = walker.discover(&project.root_path);
        if files.len() > self.config.max_queue_files {
            warn!(
                "Job {}: discovery found {} files, capping at {}",
                job_id,
                files.len(),
                self.config.max_queue_files
            );
            files.truncate(self.config.max_queue_files);
        }
        info!("Job {}: {} files discovered", job_id, files.len());
        progress.set_totals(
            files.len() as u64,
            checkpoint.snapshot().processed_files.len() as u64,
        );

        let mut sequencer = Sequencer {
            next: checkpoint.last_committed_sequence() + 1,
        };
        let starting_pass = checkpoint.pass();

        if starting_pass == AnalysisPass::Structure {
            self.run_pass(
                PassKind::Structure,
                job_id,
                &project,
                &files,
                mapper.clone(),
                registry.clone(),
                checkpoint.clone(),
                progress.clone(),
                cancel.clone(),
                &mut sequencer,
            )
            .await?;

            if cancel.is_cancelled() {
                return self.unwind_cancelled(job_id).await;
            }

            // Pass boundary: top the registry up from the store (a resumed
            // run never re-read files processed before the crash), then
            // resolve the recorded imports now that every module is known.
            self.rebuild_registry(mapper.project_node_id(), &registry)
                .await?;
            let imports = checkpoint.pending_imports();
            let import_edges = mapper.resolve_imports(&imports, &registry);
            progress.add_edges(import_edges.len() as u64);
            let mut boundary = BatchBuilder::new();
            boundary.add_edges(import_edges);
            self.commit_batch(
                job_id,
                &mut sequencer,
                boundary,
                Some(BatchStatus::StructureComplete),
                &checkpoint,
                &progress,
            )
            .await?;

            checkpoint.advance_pass(AnalysisPass::References);
            checkpoint
                .commit(sequencer.last_committed())
                .await
                .map_err(AnalysisError::from)?;
            progress.set_totals(files.len() as u64, 0);
        } else if starting_pass == AnalysisPass::References {
            // Resuming directly into pass 2: rebuild the registry from the
            // durable graph instead of re-querying language servers.
            self.rebuild_registry(mapper.project_node_id(), &registry)
                .await?;
            info!(
                "Job {}: registry rebuilt from store with {} symbols",
                job_id,
                registry.len()
            );
        }

        if checkpoint.pass() == AnalysisPass::References {
            self.run_pass(
                PassKind::References,
                job_id,
                &project,
                &files,
                mapper.clone(),
                registry.clone(),
                checkpoint.clone(),
                progress.clone(),
                cancel.clone(),
                &mut sequencer,
            )
            .await?;

            if cancel.is_cancelled() {
                return self.unwind_cancelled(job_id).await;
            }

            self.commit_batch(
                job_id,
                &mut sequencer,
                BatchBuilder::new(),
                Some(BatchStatus::ReferencesComplete),
                &checkpoint,
                &progress,
            )
            .await?;
            checkpoint.advance_pass(AnalysisPass::Done);
        }

        // Finalize: terminal batch with statistics, pool shutdown,
        // registry discard.
        self.commit_batch(
            job_id,
            &mut sequencer,
            BatchBuilder::new(),
            Some(BatchStatus::Complete),
            &checkpoint,
            &progress,
        )
        .await?;
        self.source.shutdown(self.config.grace).await;
        registry.clear();
        info!("Job {} completed", job_id);
        Ok(JobOutcome::Completed)
    }

    async fn unwind_cancelled(&self, job_id: Uuid) -> Result<JobOutcome, AnalysisError> {
        info!("Job {} cancelled, unwinding", job_id);
        self.source.cancel_inflight().await;
        self.source.shutdown(self.config.grace).await;
        Ok(JobOutcome::Cancelled)
    }

    /// Load durable nodes back into the symbol registry for uris the live
    /// registry has not seen (resume paths). Uris mapped in this run keep
    /// their fresh entries, which carry exact selection positions.
    async fn rebuild_registry(
        &self,
        project_node_id: &NodeId,
        registry: &SymbolRegistry,
    ) -> Result<(), AnalysisError> {
        let subgraph = self
            .store
            .read_subgraph(project_node_id, u32::MAX)
            .await
            .map_err(AnalysisError::from)?;
        let mut by_uri: HashMap<String, Vec<RegisteredSymbol>> = HashMap::new();
        for node in &subgraph.nodes {
            if matches!(
                node.kind,
                NodeKind::Project | NodeKind::File | NodeKind::Config
            ) {
                continue;
            }
            if registry.contains_uri(&node.uri) {
                continue;
            }
            by_uri
                .entry(node.uri.clone())
                .or_default()
                .push(RegisteredSymbol::from_node(node));
        }
        for (uri, symbols) in by_uri {
            registry.insert_file(&uri, symbols);
        }
        Ok(())
    }

    /// Run one pass: enqueue pending work, spawn workers, assemble batches
    /// until the queue drains or the job is cancelled.
    #[allow(clippy::too_many_arguments)]
    async fn run_pass(
        &self,
        pass: PassKind,
        job_id: Uuid,
        project: &Project,
        files: &[crate::walker::FileDescriptor],
        mapper: Arc<SymbolMapper>,
        registry: Arc<SymbolRegistry>,
        checkpoint: Arc<CheckpointManager>,
        progress: Arc<JobProgress>,
        cancel: CancelFlag,
        sequencer: &mut Sequencer,
    ) -> Result<(), AnalysisError> {
        let queue = Arc::new(WorkQueue::new());
        let mut outstanding: usize = 0;
        for descriptor in files {
            let key = relative_key(&project.root_path, &descriptor.path);
            if checkpoint.is_processed(&key) {
                continue;
            }
            if let Some(info) = checkpoint.failed_info(&key) {
                // Pass 2 has nothing to ask about a file whose structure
                // never landed; structure-pass retries keep their budget.
                if pass == PassKind::References
                    || info.retry_count >= self.config.max_retries
                {
                    continue;
                }
                if queue.push(WorkItem::retry(
                    descriptor.clone(),
                    info.retry_count,
                    Some(info.last_position),
                )) {
                    outstanding += 1;
                }
            } else if queue.push(WorkItem::new(descriptor.clone())) {
                outstanding += 1;
            }
        }
        debug!("Job {} pass {:?}: {} files queued", job_id, pass, outstanding);
        if outstanding == 0 {
            queue.close();
            return Ok(());
        }

        let context = Arc::new(PassContext {
            pass,
            config: self.config.clone(),
            source: self.source.clone(),
            mapper,
            registry: registry.clone(),
            checkpoint: checkpoint.clone(),
            queue: queue.clone(),
            cancel: cancel.clone(),
            root: project.root_path.clone(),
        });

        let (event_tx, mut event_rx) = mpsc::channel::<WorkerEvent>(self.config.workers * 2);
        let mut workers = JoinSet::new();
        for _ in 0..self.config.workers.max(1) {
            let context = context.clone();
            let event_tx = event_tx.clone();
            workers.spawn(async move { worker_loop(context, event_tx).await });
        }
        drop(event_tx);

        // Single assembler: sequence assignment stays monotonic without
        // coordination because only this loop closes batches.
        let mut batch = BatchBuilder::new();
        let mut result: Result<(), AnalysisError> = Ok(());

        while outstanding > 0 {
            if cancel.is_cancelled() {
                break;
            }
            let event = tokio::select! {
                event = event_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = tokio::time::sleep(self.config.batch_interval) => {
                    if !batch.is_empty() {
                        if let Err(e) = self
                            .commit_batch(job_id, sequencer, std::mem::replace(&mut batch, BatchBuilder::new()), None, &checkpoint, &progress)
                            .await
                        {
                            result = Err(e);
                            break;
                        }
                    }
                    continue;
                }
            };

            let mut force_close: Option<BatchStatus> = None;
            match event {
                WorkerEvent::Structured { item, mapped } => {
                    let key = relative_key(&project.root_path, &item.descriptor.path);
                    let uri = path_to_uri(&item.descriptor.path);
                    registry.insert_file(&uri, mapped.symbols);
                    checkpoint.record_imports(&mapped.imports);
                    checkpoint.mark_processed(&key);
                    progress.file_processed();
                    progress.add_symbols(mapped.nodes.len() as u64);
                    progress.add_edges(mapped.edges.len() as u64);
                    batch.add_nodes(mapped.nodes);
                    batch.add_edges(mapped.edges);
                    batch.processed_files.push(key);
                    outstanding -= 1;
                }
                WorkerEvent::EdgesFound { item, edges } => {
                    let key = relative_key(&project.root_path, &item.descriptor.path);
                    checkpoint.mark_processed(&key);
                    progress.file_processed();
                    progress.add_edges(edges.len() as u64);
                    batch.add_edges(edges);
                    batch.processed_files.push(key);
                    outstanding -= 1;
                }
                WorkerEvent::Failed {
                    item,
                    error,
                    position,
                    transient,
                } => {
                    let key = relative_key(&project.root_path, &item.descriptor.path);
                    let retries = checkpoint.mark_failed(&key, &error, position);
                    if transient && retries < self.config.max_retries {
                        debug!(
                            "Job {}: retrying {} (attempt {})",
                            job_id, key, retries
                        );
                        queue.push(WorkItem::retry(
                            item.descriptor,
                            retries,
                            Some(position),
                        ));
                        // Outstanding unchanged: one failure consumed, one
                        // retry produced.
                    } else {
                        warn!("Job {}: {} failed permanently: {}", job_id, key, error);
                        progress.file_failed(&error);
                        batch.failed_files.push(FailedFile {
                            path: key,
                            retry_count: retries,
                            last_error: error,
                            last_position: position,
                        });
                        force_close = Some(BatchStatus::Error);
                        outstanding -= 1;
                    }
                }
            }

            if force_close.is_some() || batch.should_close(&self.config) {
                if let Err(e) = self
                    .commit_batch(
                        job_id,
                        sequencer,
                        std::mem::replace(&mut batch, BatchBuilder::new()),
                        force_close,
                        &checkpoint,
                        &progress,
                    )
                    .await
                {
                    result = Err(e);
                    break;
                }
            }
        }

        queue.close();
        if cancel.is_cancelled() {
            self.source.cancel_inflight().await;
        }

        // Give workers the grace period to unwind, then abort stragglers.
        let drain = async {
            while workers.join_next().await.is_some() {}
        };
        if tokio::time::timeout(self.config.grace, drain).await.is_err() {
            warn!("Job {}: workers did not unwind in time, aborting", job_id);
            workers.abort_all();
        }

        result?;

        // Flush whatever the last events accumulated.
        if !batch.is_empty() && !cancel.is_cancelled() {
            self.commit_batch(job_id, sequencer, batch, None, &checkpoint, &progress)
                .await?;
        }
        Ok(())
    }

    /// Apply -> checkpoint -> publish. The order is the crash-safety
    /// invariant; see the module docs.
    async fn commit_batch(
        &self,
        job_id: Uuid,
        sequencer: &mut Sequencer,
        mut batch: BatchBuilder,
        status: Option<BatchStatus>,
        checkpoint: &CheckpointManager,
        progress: &JobProgress,
    ) -> Result<(), AnalysisError> {
        if batch.is_empty() && status.is_none() {
            return Ok(());
        }
        let (nodes, edges, processed_files, failed_files) = batch.take();
        let update = BatchUpdate {
            job_id,
            sequence: sequencer.allocate(),
            nodes,
            edges,
            processed_files,
            failed_files,
            status,
            statistics: Some(progress.stats()),
        };

        self.apply_with_retry(&update).await?;
        checkpoint
            .commit(update.sequence)
            .await
            .map_err(AnalysisError::from)?;
        self.broker.publish(Arc::new(update));
        Ok(())
    }

    /// Apply one batch, splitting oversized payloads into store-sized
    /// transactions and retrying rejections with exponential backoff.
    async fn apply_with_retry(&self, update: &BatchUpdate) -> Result<(), AnalysisError> {
        let mut attempt: u32 = 0;
        loop {
            let applied = self.apply_split(update).await;
            match applied {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.config.store_retry_attempts {
                        return Err(AnalysisError::Store(e));
                    }
                    let backoff = Duration::from_millis(100 * (1 << attempt.min(6)));
                    warn!(
                        "Store rejected batch {} (attempt {}): {}; backing off {:?}",
                        update.sequence, attempt, e, backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn apply_split(&self, update: &BatchUpdate) -> Result<(), StoreError> {
        if update.nodes.len() <= self.config.store_batch_nodes
            && update.edges.len() <= self.config.store_batch_edges
        {
            return self.store.apply_batch(update).await;
        }
        for chunk in update.nodes.chunks(self.config.store_batch_nodes) {
            self.store.upsert_nodes(chunk).await?;
        }
        for chunk in update.edges.chunks(self.config.store_batch_edges) {
            self.store.upsert_edges(chunk).await?;
        }
        Ok(())
    }
}

struct Sequencer {
    next: u64,
}

impl Sequencer {
    fn allocate(&mut self) -> u64 {
        let sequence = self.next;
        self.next += 1;
        sequence
    }

    fn last_committed(&self) -> u64 {
        self.next.saturating_sub(1)
    }
}

/// One worker: pop, process, report, until the queue closes.
async fn worker_loop(context: Arc<PassContext>, event_tx: mpsc::Sender<WorkerEvent>) {
    loop {
        if context.cancel.is_cancelled() {
            break;
        }
        let Some(item) = context.queue.pop(POP_DEADLINE).await else {
            if context.queue.is_closed() {
                break;
            }
            continue;
        };

        let key = relative_key(&context.root, &item.descriptor.path);
        context.checkpoint.mark_in_progress(&key);

        let event = match context.pass {
            PassKind::Structure => process_structure(&context, item).await,
            PassKind::References => process_references(&context, item).await,
        };
        if event_tx.send(event).await.is_err() {
            break;
        }
    }
}

async fn process_structure(context: &PassContext, item: WorkItem) -> WorkerEvent {
    let descriptor = &item.descriptor;

    // Config files and anything without a language server are mapped from
    // the filename alone; no LSP round trip.
    if descriptor.language == Language::Unknown
        || !context.source.language_available(descriptor.language)
    {
        if descriptor.config_type.is_some() {
            let mapped = context.mapper.map_document(descriptor, &[]);
            return WorkerEvent::Structured { item, mapped };
        }
        return WorkerEvent::Failed {
            error: format!(
                "language server for {} unavailable",
                descriptor.language.as_str()
            ),
            position: Position::default(),
            transient: false,
            item,
        };
    }

    match context
        .source
        .document_symbols(descriptor.language, &context.root, &descriptor.path)
        .await
    {
        Ok(symbols) => {
            let mapped = context.mapper.map_document(descriptor, &symbols);
            WorkerEvent::Structured { item, mapped }
        }
        Err(e) => failed_event(item, e),
    }
}

async fn process_references(context: &PassContext, item: WorkItem) -> WorkerEvent {
    let descriptor = &item.descriptor;
    let uri = path_to_uri(&descriptor.path);
    let symbols = context.registry.symbols_for_uri(&uri);

    if descriptor.language == Language::Unknown
        || !context.source.language_available(descriptor.language)
        || symbols.is_empty()
    {
        return WorkerEvent::EdgesFound {
            item,
            edges: Vec::new(),
        };
    }

    let mut edges = Vec::new();
    for symbol in symbols {
        if !queries_references(symbol.kind) {
            continue;
        }
        // A resumed attempt skips symbols before the recorded position.
        if let Some(resume) = item.resume_position {
            if symbol.range.start_line < resume.line {
                continue;
            }
        }
        if context.cancel.is_cancelled() {
            break;
        }

        let position = LspPosition {
            line: symbol.selection.line,
            character: symbol.selection.character,
        };
        match context
            .source
            .references(descriptor.language, &context.root, &descriptor.path, position)
            .await
        {
            Ok(locations) => {
                edges.extend(context.mapper.reference_edges(
                    &symbol,
                    &locations,
                    &context.registry,
                ));
            }
            Err(e) => return failed_event_at(item, e, symbol.range.start_line),
        }

        if matches!(symbol.kind, NodeKind::Class | NodeKind::Interface) {
            match context
                .source
                .implementations(descriptor.language, &context.root, &descriptor.path, position)
                .await
            {
                Ok(locations) => {
                    edges.extend(context.mapper.implementation_edges(
                        &symbol,
                        &locations,
                        &context.registry,
                    ));
                }
                Err(e) => return failed_event_at(item, e, symbol.range.start_line),
            }
        }
    }

    WorkerEvent::EdgesFound { item, edges }
}

fn failed_event(item: WorkItem, error: LspError) -> WorkerEvent {
    let transient = error.is_transient();
    WorkerEvent::Failed {
        error: error.to_string(),
        position: Position::default(),
        transient,
        item,
    }
}

fn failed_event_at(item: WorkItem, error: LspError, line: u32) -> WorkerEvent {
    let transient = error.is_transient();
    WorkerEvent::Failed {
        error: error.to_string(),
        position: Position { line, character: 0 },
        transient,
        item,
    }
}

/// Checkpoint key for a file: its root-relative path with forward slashes.
pub fn relative_key(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_keys_are_root_relative() {
        assert_eq!(
            relative_key(Path::new("/repo"), Path::new("/repo/pkg/a.py")),
            "pkg/a.py"
        );
        assert_eq!(
            relative_key(Path::new("/repo"), Path::new("/elsewhere/x.py")),
            "/elsewhere/x.py"
        );
    }

    #[test]
    fn sequencer_is_monotonic_from_checkpoint() {
        let mut sequencer = Sequencer { next: 4 };
        assert_eq!(sequencer.allocate(), 4);
        assert_eq!(sequencer.allocate(), 5);
        assert_eq!(sequencer.last_committed(), 5);
    }

    #[test]
    fn batch_builder_dedupes_and_closes() {
        let config = AnalysisConfig {
            batch_nodes: 2,
            ..AnalysisConfig::default()
        };
        let project = Uuid::new_v4();
        let node = CodeNode::new(
            project,
            NodeKind::Class,
            "A",
            "pkg.a.A",
            "file:///repo/pkg/a.py",
            crate::graph::model::SourceRange::default(),
        );

        let mut batch = BatchBuilder::new();
        batch.add_nodes(vec![node.clone(), node.clone()]);
        assert_eq!(batch.nodes.len(), 1);
        assert!(!batch.should_close(&config));

        let other = CodeNode::new(
            project,
            NodeKind::Class,
            "B",
            "pkg.a.B",
            "file:///repo/pkg/a.py",
            crate::graph::model::SourceRange::default(),
        );
        batch.add_nodes(vec![other]);
        assert!(batch.should_close(&config));

        let (nodes, ..) = batch.take();
        assert_eq!(nodes.len(), 2);
        assert!(batch.is_empty());
    }

    #[test]
    fn reference_query_kind_filter() {
        assert!(queries_references(NodeKind::Class));
        assert!(queries_references(NodeKind::Method));
        assert!(!queries_references(NodeKind::Module));
        assert!(!queries_references(NodeKind::File));
        assert!(!queries_references(NodeKind::Parameter));
    }
}
