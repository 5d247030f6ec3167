//! Error taxonomy for the analysis pipeline.
//!
//! Errors are split by blast radius: `LspError` covers a single language
//! server interaction, `StoreError` covers graph persistence, and
//! `AnalysisError` is the job-level umbrella the daemon reports to clients.

use thiserror::Error;
use uuid::Uuid;

/// Failures while talking to one language server process.
#[derive(Debug, Error)]
pub enum LspError {
    /// The request deadline elapsed before the server answered.
    #[error("LSP request '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    /// A malformed frame, unexpected EOF, or other protocol violation.
    /// The client is dead once this is raised.
    #[error("LSP protocol error: {0}")]
    Protocol(String),

    /// The server for this language is gone and will not be respawned.
    #[error("language server unavailable: {0}")]
    Unavailable(String),

    /// The server answered with a JSON-RPC error object.
    #[error("LSP server error {code}: {message}")]
    Server { code: i64, message: String },

    #[error("i/o error talking to language server: {0}")]
    Io(#[from] std::io::Error),
}

impl LspError {
    /// Transient failures are retried at file granularity; everything else
    /// degrades the language or the job.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LspError::Timeout { .. } | LspError::Server { .. } | LspError::Io(_)
        )
    }
}

/// Failures from the graph persistence backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transaction rejected: {0}")]
    Rejected(String),

    /// Compare-and-set on the checkpoint sequence failed.
    #[error("checkpoint sequence conflict: attempted {attempted}, store has {current}")]
    SequenceConflict { attempted: u64, current: u64 },

    #[error("graph store unavailable: {0}")]
    Unavailable(String),
}

/// Job-level error umbrella. Maps onto the wire `error_type` values.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Lsp(#[from] LspError),

    /// A symbol could not be mapped; the symbol is skipped, never the file.
    #[error("failed to map symbol: {0}")]
    Mapper(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Malformed client frame; terminal for that subscriber only.
    #[error("malformed client frame: {0}")]
    Protocol(String),

    #[error("project {0} not found")]
    ProjectNotFound(Uuid),

    #[error("job {0} not found")]
    JobNotFound(Uuid),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AnalysisError {
    /// The `error_type` discriminator used in client-facing error frames.
    pub fn error_type(&self) -> &'static str {
        match self {
            AnalysisError::ProjectNotFound(_) => "ProjectNotFoundError",
            AnalysisError::JobNotFound(_) => "JobNotFoundError",
            AnalysisError::Protocol(_) | AnalysisError::InvalidRequest(_) => "ValueError",
            _ => "ServerError",
        }
    }
}

pub type Result<T> = std::result::Result<T, AnalysisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(LspError::Timeout {
            method: "textDocument/documentSymbol".into(),
            timeout_ms: 30_000
        }
        .is_transient());
        assert!(!LspError::Unavailable("pylsp exited".into()).is_transient());
        assert!(!LspError::Protocol("bad frame".into()).is_transient());
    }

    #[test]
    fn error_type_mapping() {
        let id = Uuid::new_v4();
        assert_eq!(
            AnalysisError::ProjectNotFound(id).error_type(),
            "ProjectNotFoundError"
        );
        assert_eq!(AnalysisError::JobNotFound(id).error_type(), "JobNotFoundError");
        assert_eq!(
            AnalysisError::InvalidRequest("missing field".into()).error_type(),
            "ValueError"
        );
        assert_eq!(
            AnalysisError::Internal("boom".into()).error_type(),
            "ServerError"
        );
    }
}
