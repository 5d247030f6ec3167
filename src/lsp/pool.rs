//! Per-language server pool: lazy spawning, request routing, failure
//! isolation, and shutdown escalation.
//!
//! One slot per language. A semaphore serializes requests fairly when only
//! one hot server is allowed; a sliding-window respawn budget turns a
//! crash-looping server into a per-language `Unavailable` instead of a
//! per-job failure.

use crate::config::AnalysisConfig;
use crate::error::LspError;
use crate::language_detector::Language;
use crate::lsp::client::LspClient;
use crate::lsp::registry::LanguageRegistry;
use crate::lsp::types::{DocumentSymbol, LspLocation, LspPosition};
use crate::lsp::SymbolSource;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Consecutive timeouts tolerated before a server is recycled.
const TIMEOUT_STRIKE_LIMIT: u32 = 3;

/// Tracks spawn attempts within a sliding window.
#[derive(Debug)]
pub(crate) struct RespawnBudget {
    window: Duration,
    limit: u32,
    attempts: std::sync::Mutex<VecDeque<Instant>>,
}

impl RespawnBudget {
    pub(crate) fn new(limit: u32, window: Duration) -> Self {
        Self {
            window,
            limit,
            attempts: std::sync::Mutex::new(VecDeque::new()),
        }
    }

    /// Record a respawn attempt; returns false once the budget is spent.
    pub(crate) fn try_consume(&self) -> bool {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        while let Some(&front) = attempts.front() {
            if now.duration_since(front) > self.window {
                attempts.pop_front();
            } else {
                break;
            }
        }
        if attempts.len() >= self.limit as usize {
            return false;
        }
        attempts.push_back(now);
        true
    }
}

struct LanguageSlot {
    client: Mutex<Option<Arc<LspClient>>>,
    permits: Semaphore,
    budget: RespawnBudget,
    unavailable: AtomicBool,
    ever_spawned: AtomicBool,
    timeout_strikes: AtomicU32,
    workspaces: Mutex<HashSet<PathBuf>>,
}

impl LanguageSlot {
    fn new(config: &AnalysisConfig) -> Self {
        Self {
            client: Mutex::new(None),
            permits: Semaphore::new(config.max_servers_per_lang.max(1)),
            budget: RespawnBudget::new(config.max_respawn, config.respawn_window),
            unavailable: AtomicBool::new(false),
            ever_spawned: AtomicBool::new(false),
            timeout_strikes: AtomicU32::new(0),
            workspaces: Mutex::new(HashSet::new()),
        }
    }
}

/// Process-scoped pool of language servers keyed by language id.
pub struct ServerPool {
    registry: Arc<LanguageRegistry>,
    slots: DashMap<Language, Arc<LanguageSlot>>,
    request_timeout: Duration,
    grace: Duration,
    config: AnalysisConfig,
}

impl ServerPool {
    pub fn new(registry: Arc<LanguageRegistry>, config: &AnalysisConfig) -> Self {
        Self {
            registry,
            slots: DashMap::new(),
            request_timeout: config.lsp_request_timeout,
            grace: config.grace,
            config: config.clone(),
        }
    }

    fn slot(&self, language: Language) -> Arc<LanguageSlot> {
        self.slots
            .entry(language)
            .or_insert_with(|| Arc::new(LanguageSlot::new(&self.config)))
            .clone()
    }

    /// Get the live client for a language, spawning lazily. The caller must
    /// hold a slot permit.
    async fn client_for(
        &self,
        language: Language,
        workspace: &Path,
    ) -> Result<Arc<LspClient>, LspError> {
        let spec = self
            .registry
            .get(language)
            .ok_or_else(|| {
                LspError::Unavailable(format!("no server configured for {}", language.as_str()))
            })?
            .clone();

        let slot = self.slot(language);
        if slot.unavailable.load(Ordering::Acquire) {
            return Err(LspError::Unavailable(format!(
                "{} declared unavailable after repeated failures",
                language.as_str()
            )));
        }

        let mut guard = slot.client.lock().await;
        if let Some(client) = guard.as_ref() {
            if client.is_alive() {
                let client = client.clone();
                drop(guard);
                self.ensure_workspace(&slot, &client, workspace).await?;
                return Ok(client);
            }
            debug!("{} client found dead, discarding", language.as_str());
            *guard = None;
        }

        // A first spawn is free; every later spawn consumes respawn budget.
        if slot.ever_spawned.swap(true, Ordering::AcqRel) && !slot.budget.try_consume() {
            slot.unavailable.store(true, Ordering::Release);
            warn!(
                "Respawn budget exhausted for {}, declaring language unavailable",
                language.as_str()
            );
            return Err(LspError::Unavailable(format!(
                "{} exceeded its respawn budget",
                language.as_str()
            )));
        }

        info!("Starting {} server: {}", language.as_str(), spec.command);
        let client = match LspClient::spawn(&spec, workspace, self.request_timeout).await {
            Ok(client) => Arc::new(client),
            Err(e) => {
                warn!("Failed to start {} server: {}", language.as_str(), e);
                return Err(e);
            }
        };
        slot.timeout_strikes.store(0, Ordering::Release);
        slot.workspaces.lock().await.insert(workspace.to_path_buf());
        *guard = Some(client.clone());
        Ok(client)
    }

    /// Register a new workspace root on an already-running server.
    async fn ensure_workspace(
        &self,
        slot: &LanguageSlot,
        client: &LspClient,
        workspace: &Path,
    ) -> Result<(), LspError> {
        let mut workspaces = slot.workspaces.lock().await;
        if workspaces.contains(workspace) {
            return Ok(());
        }
        client.add_workspace_folder(workspace).await?;
        workspaces.insert(workspace.to_path_buf());
        Ok(())
    }

    /// Run one request against the language's server, handling failure
    /// bookkeeping: protocol errors invalidate the client immediately,
    /// repeated timeouts recycle it.
    async fn run<T, F, Fut>(
        &self,
        language: Language,
        workspace: &Path,
        operation: F,
    ) -> Result<T, LspError>
    where
        F: FnOnce(Arc<LspClient>) -> Fut,
        Fut: std::future::Future<Output = Result<T, LspError>>,
    {
        let slot = self.slot(language);
        let _permit = slot
            .permits
            .acquire()
            .await
            .map_err(|_| LspError::Unavailable("pool is shutting down".into()))?;

        let client = self.client_for(language, workspace).await?;
        let result = operation(client.clone()).await;

        match &result {
            Ok(_) => {
                slot.timeout_strikes.store(0, Ordering::Release);
            }
            Err(LspError::Protocol(_)) => {
                self.invalidate(&slot, &client).await;
            }
            Err(LspError::Timeout { .. }) => {
                let strikes = slot.timeout_strikes.fetch_add(1, Ordering::AcqRel) + 1;
                if strikes >= TIMEOUT_STRIKE_LIMIT {
                    warn!(
                        "{} hit {} consecutive timeouts, recycling server",
                        language.as_str(),
                        strikes
                    );
                    self.invalidate(&slot, &client).await;
                }
            }
            Err(_) => {}
        }
        result
    }

    async fn invalidate(&self, slot: &LanguageSlot, client: &Arc<LspClient>) {
        let mut guard = slot.client.lock().await;
        if let Some(current) = guard.as_ref() {
            if Arc::ptr_eq(current, client) {
                *guard = None;
                slot.workspaces.lock().await.clear();
            }
        }
        drop(guard);
        client.shutdown(Duration::from_millis(200)).await;
    }

    /// Shut every child down: `shutdown` + `exit`, SIGTERM after the grace
    /// period, then SIGKILL.
    pub async fn shutdown_all(&self) {
        for entry in self.slots.iter() {
            let slot = entry.value().clone();
            let client = slot.client.lock().await.take();
            slot.workspaces.lock().await.clear();
            if let Some(client) = client {
                info!("Shutting down {} server", entry.key().as_str());
                client.shutdown(self.grace).await;
            }
        }
    }
}

#[async_trait]
impl SymbolSource for ServerPool {
    async fn document_symbols(
        &self,
        language: Language,
        workspace: &Path,
        file: &Path,
    ) -> Result<Vec<DocumentSymbol>, LspError> {
        let file = file.to_path_buf();
        self.run(language, workspace, |client| async move {
            client.document_symbols(&file).await
        })
        .await
    }

    async fn references(
        &self,
        language: Language,
        workspace: &Path,
        file: &Path,
        position: LspPosition,
    ) -> Result<Vec<LspLocation>, LspError> {
        let file = file.to_path_buf();
        self.run(language, workspace, |client| async move {
            client.references(&file, position, false).await
        })
        .await
    }

    async fn implementations(
        &self,
        language: Language,
        workspace: &Path,
        file: &Path,
        position: LspPosition,
    ) -> Result<Vec<LspLocation>, LspError> {
        let file = file.to_path_buf();
        self.run(language, workspace, |client| async move {
            client.implementations(&file, position).await
        })
        .await
    }

    fn language_available(&self, language: Language) -> bool {
        if !self.registry.supports(language) {
            return false;
        }
        self.slots
            .get(&language)
            .map(|slot| !slot.unavailable.load(Ordering::Acquire))
            .unwrap_or(true)
    }

    async fn cancel_inflight(&self) {
        for entry in self.slots.iter() {
            let client = entry.value().client.lock().await.clone();
            if let Some(client) = client {
                client.cancel_inflight().await;
            }
        }
    }

    async fn shutdown(&self, _grace: Duration) {
        self.shutdown_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn respawn_budget_enforces_limit() {
        let budget = RespawnBudget::new(3, Duration::from_secs(300));
        assert!(budget.try_consume());
        assert!(budget.try_consume());
        assert!(budget.try_consume());
        assert!(!budget.try_consume());
    }

    #[tokio::test(start_paused = true)]
    async fn respawn_budget_window_slides() {
        let budget = RespawnBudget::new(2, Duration::from_secs(10));
        assert!(budget.try_consume());
        assert!(budget.try_consume());
        assert!(!budget.try_consume());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(budget.try_consume());
    }

    #[tokio::test]
    async fn unsupported_language_is_unavailable() {
        let registry = Arc::new(LanguageRegistry::default());
        let pool = ServerPool::new(registry, &AnalysisConfig::default());
        assert!(!pool.language_available(Language::Python));

        let err = pool
            .document_symbols(Language::Python, Path::new("/tmp"), Path::new("/tmp/a.py"))
            .await
            .unwrap_err();
        assert!(matches!(err, LspError::Unavailable(_)));
    }

    #[tokio::test]
    async fn missing_binary_surfaces_as_unavailable() {
        let mut registry = LanguageRegistry::default();
        registry.register(crate::lsp::registry::ServerSpec {
            language: Language::Python,
            command: "definitely-not-a-real-lsp-binary".into(),
            args: vec![],
            env: vec![],
            init_params: None,
            root_markers: vec![],
        });
        let pool = ServerPool::new(Arc::new(registry), &AnalysisConfig::default());

        let err = pool
            .document_symbols(Language::Python, Path::new("/tmp"), Path::new("/tmp/a.py"))
            .await
            .unwrap_err();
        assert!(matches!(err, LspError::Unavailable(_)));
    }
}
