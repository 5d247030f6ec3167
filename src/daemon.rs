//! Connection handling: accepts clients on the IPC socket, dispatches
//! protocol messages to the job registry, and pumps subscription streams
//! back out.

use crate::broker::{BrokerEvent, Subscription};
use crate::error::AnalysisError;
use crate::graph::model::JobStatus;
use crate::graph::store::GraphStore;
use crate::ipc::{IpcListener, MessageListener};
use crate::job_registry::JobRegistry;
use crate::mapper::SymbolMapper;
use crate::protocol::{ClientDecodeError, ClientMessage, ErrorType, MessageCodec, ServerMessage};
use crate::socket_path::remove_socket_file;
use anyhow::Result;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct AnalysisDaemon {
    socket_path: String,
    registry: Arc<JobRegistry>,
    store: Arc<dyn GraphStore>,
    connections: Arc<DashMap<Uuid, Instant>>,
    shutdown: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
}

impl AnalysisDaemon {
    pub fn new(socket_path: String, registry: Arc<JobRegistry>, store: Arc<dyn GraphStore>) -> Self {
        Self {
            socket_path,
            registry,
            store,
            connections: Arc::new(DashMap::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.shutdown_notify.notify_waiters();
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        remove_socket_file(&self.socket_path)?;
        let listener = IpcListener::bind(&self.socket_path).await?;
        info!("Analysis daemon listening on {}", self.socket_path);

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                info!("Daemon shutting down");
                break;
            }
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = self.shutdown_notify.notified() => break,
            };
            match accepted {
                Ok(stream) => {
                    let daemon = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = daemon.handle_connection(stream).await {
                            debug!("Connection ended with error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                }
            }
        }
        Ok(())
    }

    /// Serve one client connection until it disconnects or sends a
    /// malformed frame.
    pub async fn handle_connection<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let client_id = Uuid::new_v4();
        info!("Client connected: {}", client_id);
        self.connections.insert(client_id, Instant::now());

        let (mut reader, write_half) = tokio::io::split(stream);
        let writer = Arc::new(Mutex::new(write_half));
        let mut pumps: Vec<tokio::task::JoinHandle<()>> = Vec::new();

        loop {
            let mut header = [0u8; 4];
            match reader.read_exact(&mut header).await {
                Ok(_) => {}
                Err(_) => break,
            }
            let length = match MessageCodec::body_length(header) {
                Ok(length) => length,
                Err(e) => {
                    warn!("Client {} sent an oversized frame: {}", client_id, e);
                    let error = AnalysisError::Protocol(e.to_string());
                    send(&writer, &ServerMessage::error(&error)).await;
                    break;
                }
            };
            let mut body = vec![0u8; length];
            if reader.read_exact(&mut body).await.is_err() {
                break;
            }
            self.connections.insert(client_id, Instant::now());

            let message = match MessageCodec::decode_client(&body) {
                Ok(message) => message,
                Err(e @ ClientDecodeError::Unrecognized(_)) => {
                    // Unknown or invalid payloads are request-scoped: reply
                    // with an error and keep the connection (and its
                    // subscriptions) alive.
                    warn!("Client {} sent an unrecognized message: {}", client_id, e);
                    send(&writer, &ServerMessage::error(&e.to_analysis_error())).await;
                    continue;
                }
                Err(e @ ClientDecodeError::Malformed(_)) => {
                    // A frame that is not JSON is terminal for this
                    // subscriber.
                    warn!("Client {} sent a malformed frame: {}", client_id, e);
                    send(&writer, &ServerMessage::error(&e.to_analysis_error())).await;
                    break;
                }
            };

            self.dispatch(message, &writer, &mut pumps).await;
        }

        for pump in pumps {
            pump.abort();
        }
        self.connections.remove(&client_id);
        info!("Client disconnected: {}", client_id);
        Ok(())
    }

    async fn dispatch<S>(
        &self,
        message: ClientMessage,
        writer: &Arc<Mutex<WriteHalf<S>>>,
        pumps: &mut Vec<tokio::task::JoinHandle<()>>,
    ) where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        match message {
            ClientMessage::Ping => send(writer, &ServerMessage::Pong).await,

            ClientMessage::StartAnalysis {
                project_id,
                analyzer_type,
            } => {
                let response = self.handle_start(project_id, &analyzer_type).await;
                match response {
                    Ok(message) => send(writer, &message).await,
                    Err(e) => send(writer, &ServerMessage::error(&e)).await,
                }
            }

            ClientMessage::Subscribe {
                job_id,
                from_sequence,
            } => match self.registry.subscribe(job_id, from_sequence) {
                Ok(subscription) => {
                    send(
                        writer,
                        &ServerMessage::SubscribeResponse {
                            job_id,
                            last_committed_sequence: subscription.last_committed_sequence,
                        },
                    )
                    .await;
                    // Baseline status before backlog replay starts.
                    if let Ok(snapshot) = self.registry.status(job_id) {
                        send(
                            writer,
                            &ServerMessage::StatusUpdate {
                                status: snapshot.status,
                                analysis_stats: snapshot.stats,
                            },
                        )
                        .await;
                    }
                    pumps.push(spawn_pump(subscription, writer.clone()));
                }
                Err(e) => send(writer, &ServerMessage::error(&e)).await,
            },

            ClientMessage::Cancel { job_id } => match self.registry.cancel(job_id).await {
                Ok(status) => {
                    let stats = self
                        .registry
                        .status(job_id)
                        .map(|s| s.stats)
                        .unwrap_or_default();
                    send(
                        writer,
                        &ServerMessage::StatusUpdate {
                            status,
                            analysis_stats: stats,
                        },
                    )
                    .await;
                }
                Err(e) => send(writer, &ServerMessage::error(&e)).await,
            },

            ClientMessage::GetStatus { job_id } => match self.registry.status(job_id) {
                Ok(snapshot) => {
                    send(
                        writer,
                        &ServerMessage::StatusUpdate {
                            status: snapshot.status,
                            analysis_stats: snapshot.stats,
                        },
                    )
                    .await;
                }
                Err(e) => send(writer, &ServerMessage::error(&e)).await,
            },
        }
    }

    async fn handle_start(
        &self,
        project_id: Uuid,
        analyzer_type: &str,
    ) -> Result<ServerMessage, AnalysisError> {
        let started = self.registry.start_analysis(project_id, analyzer_type).await?;
        let snapshot = self.registry.status(started.job_id)?;

        // A job that already completed answers with the full graph.
        let graph_data = if started.status == JobStatus::Completed {
            let project = self
                .registry
                .project(project_id)
                .ok_or(AnalysisError::ProjectNotFound(project_id))?;
            let root = SymbolMapper::new(&project).project_node_id().clone();
            Some(
                self.store
                    .read_subgraph(&root, u32::MAX)
                    .await
                    .map_err(AnalysisError::from)?,
            )
        } else {
            None
        };

        Ok(ServerMessage::StartAnalysisResponse {
            job_id: started.job_id,
            status: started.status,
            analysis_stats: snapshot.stats,
            graph_data,
        })
    }
}

/// Forward one subscription's events to the connection until it ends.
fn spawn_pump<S>(
    mut subscription: Subscription,
    writer: Arc<Mutex<WriteHalf<S>>>,
) -> tokio::task::JoinHandle<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    tokio::spawn(async move {
        let job_id = subscription.job_id;
        while let Some(event) = subscription.rx.recv().await {
            match event {
                BrokerEvent::Batch(batch) => {
                    let terminal =
                        batch.status == Some(crate::graph::model::BatchStatus::Complete);
                    send(&writer, &ServerMessage::from_batch(&batch)).await;
                    if terminal {
                        send(
                            &writer,
                            &ServerMessage::AnalysisComplete {
                                job_id,
                                statistics: batch.statistics.clone().unwrap_or_default(),
                            },
                        )
                        .await;
                    }
                }
                BrokerEvent::ResyncRequired { floor } => {
                    send(
                        &writer,
                        &ServerMessage::Error {
                            message: format!(
                                "requested sequence below replay floor {}; re-query the graph store",
                                floor
                            ),
                            error_type: ErrorType::ResyncRequired,
                        },
                    )
                    .await;
                }
            }
        }
        if subscription.dropped_as_slow() {
            send(
                &writer,
                &ServerMessage::Error {
                    message: "subscriber fell behind and was dropped".into(),
                    error_type: ErrorType::SlowConsumer,
                },
            )
            .await;
        }
        debug!("Pump for job {} finished", job_id);
    })
}

async fn send<S>(writer: &Arc<Mutex<WriteHalf<S>>>, message: &ServerMessage)
where
    S: AsyncRead + AsyncWrite + Send,
{
    let Ok(encoded) = MessageCodec::encode(message) else {
        error!("Failed to encode server message");
        return;
    };
    let mut writer = writer.lock().await;
    if writer.write_all(&encoded).await.is_err() {
        return;
    }
    let _ = writer.flush().await;
}
