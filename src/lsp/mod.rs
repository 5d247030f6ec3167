//! Language server integration: JSON-RPC client, launch registry, and the
//! per-language server pool.

pub mod client;
pub mod pool;
pub mod registry;
pub mod types;

use crate::error::LspError;
use crate::language_detector::Language;
use crate::lsp::types::{DocumentSymbol, LspLocation, LspPosition};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

/// Seam between the analysis pipeline and whatever produces symbols.
///
/// `ServerPool` is the production implementation; tests inject scripted
/// sources so the pipeline can run without child processes.
#[async_trait]
pub trait SymbolSource: Send + Sync {
    async fn document_symbols(
        &self,
        language: Language,
        workspace: &Path,
        file: &Path,
    ) -> Result<Vec<DocumentSymbol>, LspError>;

    async fn references(
        &self,
        language: Language,
        workspace: &Path,
        file: &Path,
        position: LspPosition,
    ) -> Result<Vec<LspLocation>, LspError>;

    async fn implementations(
        &self,
        language: Language,
        workspace: &Path,
        file: &Path,
        position: LspPosition,
    ) -> Result<Vec<LspLocation>, LspError>;

    /// Whether requests for this language can currently be served.
    fn language_available(&self, language: Language) -> bool;

    /// Cancel every request in flight (used by job cancellation).
    async fn cancel_inflight(&self);

    /// Shut all backing servers down, escalating after `grace`.
    async fn shutdown(&self, grace: Duration);
}

pub use client::LspClient;
pub use pool::ServerPool;
pub use registry::{LanguageRegistry, ServerSpec};
