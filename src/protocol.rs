//! Client-facing message protocol: JSON frames over a length-prefixed
//! transport. One connection multiplexes many subscriptions.

use crate::error::AnalysisError;
use crate::graph::model::{
    AnalysisStats, BatchStatus, BatchUpdate, CodeNode, Edge, FailedFile, JobStatus,
};
use crate::graph::store::Subgraph;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Shared limit for length-prefixed messages.
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Messages a client may send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    StartAnalysis {
        project_id: Uuid,
        analyzer_type: String,
    },
    Subscribe {
        job_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_sequence: Option<u64>,
    },
    Cancel {
        job_id: Uuid,
    },
    GetStatus {
        job_id: Uuid,
    },
    Ping,
}

/// Wire names for the error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorType {
    ProjectNotFoundError,
    JobNotFoundError,
    ValueError,
    ServerError,
    SlowConsumer,
    ResyncRequired,
}

impl From<&AnalysisError> for ErrorType {
    fn from(error: &AnalysisError) -> Self {
        match error.error_type() {
            "ProjectNotFoundError" => ErrorType::ProjectNotFoundError,
            "JobNotFoundError" => ErrorType::JobNotFoundError,
            "ValueError" => ErrorType::ValueError,
            _ => ErrorType::ServerError,
        }
    }
}

/// Messages the server sends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    StartAnalysisResponse {
        job_id: Uuid,
        status: JobStatus,
        analysis_stats: AnalysisStats,
        /// Present only when the job already completed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        graph_data: Option<Subgraph>,
    },
    BatchUpdate {
        sequence: u64,
        nodes: Vec<CodeNode>,
        edges: Vec<Edge>,
        processed_files: Vec<String>,
        failed_files: Vec<FailedFile>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<BatchStatus>,
        analysis_stats: AnalysisStats,
    },
    StatusUpdate {
        status: JobStatus,
        analysis_stats: AnalysisStats,
    },
    SubscribeResponse {
        job_id: Uuid,
        last_committed_sequence: u64,
    },
    AnalysisComplete {
        job_id: Uuid,
        statistics: AnalysisStats,
    },
    Error {
        message: String,
        error_type: ErrorType,
    },
    Pong,
}

impl ServerMessage {
    pub fn from_batch(batch: &BatchUpdate) -> Self {
        ServerMessage::BatchUpdate {
            sequence: batch.sequence,
            nodes: batch.nodes.clone(),
            edges: batch.edges.clone(),
            processed_files: batch.processed_files.clone(),
            failed_files: batch.failed_files.clone(),
            status: batch.status,
            analysis_stats: batch.statistics.clone().unwrap_or_default(),
        }
    }

    pub fn error(error: &AnalysisError) -> Self {
        ServerMessage::Error {
            message: error.to_string(),
            error_type: ErrorType::from(error),
        }
    }
}

/// How decoding a client frame failed. The distinction matters: a frame
/// that is not JSON at all is terminal for the connection, while valid
/// JSON with a missing or unrecognized payload is answered with a
/// `ValueError` and the connection (and its subscriptions) stays up.
#[derive(Debug, Error)]
pub enum ClientDecodeError {
    #[error("malformed client frame: {0}")]
    Malformed(String),

    #[error("unrecognized client message: {0}")]
    Unrecognized(String),
}

impl ClientDecodeError {
    pub fn to_analysis_error(&self) -> AnalysisError {
        match self {
            ClientDecodeError::Malformed(reason) => AnalysisError::Protocol(reason.clone()),
            ClientDecodeError::Unrecognized(reason) => {
                AnalysisError::InvalidRequest(reason.clone())
            }
        }
    }
}

/// Length-prefixed JSON codec shared by server and clients.
pub struct MessageCodec;

impl MessageCodec {
    pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(message)?;
        if json.len() > MAX_MESSAGE_SIZE {
            anyhow::bail!(
                "message of {} bytes exceeds the {} byte limit",
                json.len(),
                MAX_MESSAGE_SIZE
            );
        }
        let mut encoded = Vec::with_capacity(json.len() + 4);
        encoded.extend_from_slice(&(json.len() as u32).to_be_bytes());
        encoded.extend_from_slice(&json);
        Ok(encoded)
    }

    /// Validate a frame header; returns the body length.
    pub fn body_length(header: [u8; 4]) -> Result<usize> {
        let length = u32::from_be_bytes(header) as usize;
        if length > MAX_MESSAGE_SIZE {
            anyhow::bail!(
                "frame of {} bytes exceeds the {} byte limit",
                length,
                MAX_MESSAGE_SIZE
            );
        }
        Ok(length)
    }

    /// Decode a client frame in two phases so JSON-parse failure and an
    /// unknown `type` discriminator can be told apart.
    pub fn decode_client(body: &[u8]) -> std::result::Result<ClientMessage, ClientDecodeError> {
        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| ClientDecodeError::Malformed(e.to_string()))?;
        match serde_json::from_value::<ClientMessage>(value.clone()) {
            Ok(message) => Ok(message),
            Err(e) => {
                let message_type = value
                    .get("type")
                    .and_then(|t| t.as_str())
                    .unwrap_or("<missing>");
                Err(ClientDecodeError::Unrecognized(format!(
                    "type '{}': {}",
                    message_type, e
                )))
            }
        }
    }

    pub fn decode_server(body: &[u8]) -> Result<ServerMessage> {
        Ok(serde_json::from_slice(body)?)
    }
}
