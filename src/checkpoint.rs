//! Checkpoint bookkeeping and persistence.
//!
//! The manager owns the live checkpoint for one job. Mutators run under a
//! lock; `commit` is called exactly once per durably-applied batch, after
//! the store transaction and before the broker publish. That ordering is
//! the crash-safety contract: a crash between apply and commit costs one
//! replayed batch, absorbed by idempotent upserts.

use crate::error::StoreError;
use crate::graph::model::{unix_now, AnalysisPass, Checkpoint, FailedFileInfo, Position};
use crate::graph::store::GraphStore;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

pub struct CheckpointManager {
    store: Arc<dyn GraphStore>,
    state: Mutex<Checkpoint>,
}

impl CheckpointManager {
    /// Fresh manager for a job with no prior state.
    pub fn new(store: Arc<dyn GraphStore>, job_id: Uuid) -> Self {
        Self {
            store,
            state: Mutex::new(Checkpoint::empty(job_id)),
        }
    }

    /// Load the stored checkpoint for `job_id`, or an empty one.
    ///
    /// Files that were in flight at snapshot time are returned for
    /// requeueing and cleared from the live state (at-least-once).
    pub async fn resume(
        store: Arc<dyn GraphStore>,
        job_id: Uuid,
    ) -> Result<(Self, BTreeSet<String>), StoreError> {
        let mut checkpoint = store
            .read_checkpoint(job_id)
            .await?
            .unwrap_or_else(|| Checkpoint::empty(job_id));
        let interrupted = std::mem::take(&mut checkpoint.in_progress);
        if !interrupted.is_empty() {
            info!(
                "Job {} resumes with {} interrupted files requeued",
                job_id,
                interrupted.len()
            );
        }
        let manager = Self {
            store,
            state: Mutex::new(checkpoint),
        };
        Ok((manager, interrupted))
    }

    pub fn pass(&self) -> AnalysisPass {
        self.lock().pass
    }

    pub fn last_committed_sequence(&self) -> u64 {
        self.lock().last_committed_sequence
    }

    pub fn is_processed(&self, path: &str) -> bool {
        self.lock().processed_files.contains(path)
    }

    pub fn failed_info(&self, path: &str) -> Option<FailedFileInfo> {
        self.lock().failed_files.get(path).cloned()
    }

    pub fn mark_in_progress(&self, path: &str) {
        self.lock().in_progress.insert(path.to_string());
    }

    /// Record success. Clears any prior failure record so the disjointness
    /// invariant holds.
    pub fn mark_processed(&self, path: &str) {
        let mut state = self.lock();
        state.in_progress.remove(path);
        state.failed_files.remove(path);
        state.processed_files.insert(path.to_string());
        state.statistics.total_processed += 1;
    }

    /// Record a failure and return the updated retry count.
    pub fn mark_failed(&self, path: &str, error: &str, position: Position) -> u32 {
        let mut state = self.lock();
        state.in_progress.remove(path);
        state.processed_files.remove(path);
        let entry = state.failed_files.entry(path.to_string()).or_default();
        entry.retry_count += 1;
        entry.last_error = error.to_string();
        entry.last_position = position;
        let retries = entry.retry_count;
        state.statistics.total_failed += 1;
        state.statistics.retry_count += 1;
        retries
    }

    /// Record import names discovered while mapping one file.
    pub fn record_imports(&self, imports: &[(String, String)]) {
        if imports.is_empty() {
            return;
        }
        let mut state = self.lock();
        for (importer, name) in imports {
            state
                .pending_imports
                .entry(importer.clone())
                .or_default()
                .insert(name.clone());
        }
    }

    /// All recorded imports, across this run and any resumed-from run.
    pub fn pending_imports(&self) -> Vec<(String, String)> {
        self.lock()
            .pending_imports
            .iter()
            .flat_map(|(importer, names)| {
                names
                    .iter()
                    .map(|name| (importer.clone(), name.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Advance the pass marker, resetting the per-pass processed set.
    pub fn advance_pass(&self, pass: AnalysisPass) {
        let mut state = self.lock();
        debug!("Job {} advancing to pass {:?}", state.job_id, pass);
        state.pass = pass;
        state.processed_files.clear();
        state.in_progress.clear();
        state.pending_imports.clear();
    }

    pub fn snapshot(&self) -> Checkpoint {
        self.lock().clone()
    }

    /// Persist the checkpoint describing the batch that was just applied.
    pub async fn commit(&self, sequence: u64) -> Result<(), StoreError> {
        let snapshot = {
            let mut state = self.lock();
            state.last_committed_sequence = sequence;
            state.updated_at = unix_now();
            state.clone()
        };
        self.store.write_checkpoint(&snapshot).await
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Checkpoint> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::store::MemoryGraphStore;

    #[tokio::test]
    async fn processed_and_failed_stay_disjoint() {
        let store = Arc::new(MemoryGraphStore::new());
        let manager = CheckpointManager::new(store, Uuid::new_v4());

        manager.mark_failed("pkg/a.py", "boom", Position::default());
        assert_eq!(manager.failed_info("pkg/a.py").unwrap().retry_count, 1);

        manager.mark_processed("pkg/a.py");
        let snapshot = manager.snapshot();
        assert!(snapshot.processed_files.contains("pkg/a.py"));
        assert!(!snapshot.failed_files.contains_key("pkg/a.py"));
    }

    #[tokio::test]
    async fn retry_count_accumulates() {
        let store = Arc::new(MemoryGraphStore::new());
        let manager = CheckpointManager::new(store, Uuid::new_v4());

        assert_eq!(manager.mark_failed("f.py", "one", Position::default()), 1);
        assert_eq!(
            manager.mark_failed("f.py", "two", Position { line: 4, character: 2 }),
            2
        );
        let info = manager.failed_info("f.py").unwrap();
        assert_eq!(info.last_error, "two");
        assert_eq!(info.last_position, Position { line: 4, character: 2 });
    }

    #[tokio::test]
    async fn commit_then_resume_round_trip() {
        let store = Arc::new(MemoryGraphStore::new());
        let job_id = Uuid::new_v4();

        let manager = CheckpointManager::new(store.clone(), job_id);
        manager.mark_processed("pkg/a.py");
        manager.mark_in_progress("pkg/b.py");
        manager.commit(3).await.unwrap();

        let (resumed, interrupted) = CheckpointManager::resume(store, job_id).await.unwrap();
        assert_eq!(resumed.last_committed_sequence(), 3);
        assert!(resumed.is_processed("pkg/a.py"));
        assert!(interrupted.contains("pkg/b.py"));
        assert!(resumed.snapshot().in_progress.is_empty());
    }

    #[tokio::test]
    async fn pending_imports_survive_commit_and_resume() {
        let store = Arc::new(MemoryGraphStore::new());
        let job_id = Uuid::new_v4();

        let manager = CheckpointManager::new(store.clone(), job_id);
        manager.record_imports(&[
            ("module-b".into(), "pkg.a".into()),
            ("module-b".into(), "os".into()),
        ]);
        manager.commit(1).await.unwrap();

        let (resumed, _) = CheckpointManager::resume(store, job_id).await.unwrap();
        let mut imports = resumed.pending_imports();
        imports.sort();
        assert_eq!(
            imports,
            vec![
                ("module-b".to_string(), "os".to_string()),
                ("module-b".to_string(), "pkg.a".to_string()),
            ]
        );

        resumed.advance_pass(AnalysisPass::References);
        assert!(resumed.pending_imports().is_empty());
    }

    #[tokio::test]
    async fn advance_pass_resets_per_pass_state() {
        let store = Arc::new(MemoryGraphStore::new());
        let manager = CheckpointManager::new(store, Uuid::new_v4());
        manager.mark_processed("pkg/a.py");
        manager.mark_failed("pkg/poison.py", "crash", Position::default());

        manager.advance_pass(AnalysisPass::References);
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.pass, AnalysisPass::References);
        assert!(snapshot.processed_files.is_empty());
        // Hard failures remain visible across passes.
        assert!(snapshot.failed_files.contains_key("pkg/poison.py"));
    }
}
