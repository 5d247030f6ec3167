//! JSON-RPC 2.0 client bound to one language-server child process.
//!
//! Frames are `Content-Length`-prefixed per the LSP base protocol. A reader
//! task multiplexes concurrent requests by id and answers the handful of
//! server-to-client requests inline. EOF or a malformed frame marks the
//! client dead and fails everything in flight.

use crate::error::LspError;
use crate::language_detector::Language;
use crate::lsp::registry::ServerSpec;
use crate::lsp::types::{DocumentSymbol, LspLocation, LspPosition, SymbolInformation};
use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, trace, warn};
use url::Url;

/// Upper bound on a single LSP frame body.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

type PendingMap = Arc<DashMap<i64, oneshot::Sender<Result<Value, LspError>>>>;

pub struct LspClient {
    language: Language,
    server_name: String,
    request_timeout: Duration,
    stdin: Arc<Mutex<ChildStdin>>,
    child: Mutex<Option<Child>>,
    pending: PendingMap,
    next_id: AtomicI64,
    alive: Arc<AtomicBool>,
    reader_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    stderr_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    opened_documents: Mutex<HashSet<PathBuf>>,
}

impl std::fmt::Debug for LspClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LspClient")
            .field("language", &self.language)
            .field("server_name", &self.server_name)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl LspClient {
    /// Spawn the server process and run the LSP initialize handshake
    /// against `workspace_root`.
    pub async fn spawn(
        spec: &ServerSpec,
        workspace_root: &Path,
        request_timeout: Duration,
    ) -> Result<Self, LspError> {
        debug!(
            "Spawning {:?} server: {} {:?}",
            spec.language, spec.command, spec.args
        );

        let mut command = tokio::process::Command::new(&spec.command);
        command
            .args(&spec.args)
            .current_dir(workspace_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|e| {
            LspError::Unavailable(format!("failed to spawn {}: {}", spec.command, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LspError::Protocol("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LspError::Protocol("child stdout unavailable".into()))?;
        let stderr = child.stderr.take();

        let stdin = Arc::new(Mutex::new(stdin));
        let pending: PendingMap = Arc::new(DashMap::new());
        let alive = Arc::new(AtomicBool::new(true));

        let reader_task = tokio::spawn(read_loop(
            stdout,
            pending.clone(),
            alive.clone(),
            stdin.clone(),
            spec.command.clone(),
        ));

        let stderr_task = stderr.map(|stderr| {
            let name = spec.command.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    trace!(target: "lsp_stderr", server = %name, "{}", line);
                }
            })
        });

        let client = Self {
            language: spec.language,
            server_name: spec.command.clone(),
            request_timeout,
            stdin,
            child: Mutex::new(Some(child)),
            pending,
            next_id: AtomicI64::new(1),
            alive,
            reader_task: Mutex::new(Some(reader_task)),
            stderr_task: Mutex::new(stderr_task),
            opened_documents: Mutex::new(HashSet::new()),
        };

        client.initialize(spec, workspace_root).await?;
        Ok(client)
    }

    async fn initialize(&self, spec: &ServerSpec, workspace_root: &Path) -> Result<(), LspError> {
        let root_uri = path_to_uri(workspace_root);
        let params = json!({
            "processId": std::process::id(),
            "rootUri": root_uri,
            "workspaceFolders": [{
                "uri": root_uri,
                "name": workspace_root
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("workspace"),
            }],
            "capabilities": {
                "textDocument": {
                    "documentSymbol": {
                        "hierarchicalDocumentSymbolSupport": true,
                        "dynamicRegistration": false
                    },
                    "references": { "dynamicRegistration": false },
                    "implementation": { "dynamicRegistration": false }
                },
                "workspace": {
                    "workspaceFolders": true,
                    "configuration": true
                }
            },
            "initializationOptions": spec.init_params,
        });

        let response = self.request("initialize", params).await?;
        if response.get("capabilities").is_none() {
            warn!(
                "{} returned an initialize result without capabilities",
                self.server_name
            );
        }
        self.notify("initialized", json!({})).await?;
        debug!("{} initialized for {:?}", self.server_name, workspace_root);
        Ok(())
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Send a request and await the matching response, bounded by the
    /// client deadline. A timeout sends `$/cancelRequest` best effort.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, LspError> {
        if !self.is_alive() {
            return Err(LspError::Unavailable(format!(
                "{} is no longer running",
                self.server_name
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if let Err(e) = self.write_frame(&frame).await {
            self.pending.remove(&id);
            return Err(e);
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LspError::Protocol(format!(
                "{} closed while '{}' was in flight",
                self.server_name, method
            ))),
            Err(_) => {
                self.pending.remove(&id);
                let _ = self.notify("$/cancelRequest", json!({ "id": id })).await;
                Err(LspError::Timeout {
                    method: method.to_string(),
                    timeout_ms: self.request_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Fire-and-forget notification.
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), LspError> {
        let frame = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.write_frame(&frame).await
    }

    async fn write_frame(&self, frame: &Value) -> Result<(), LspError> {
        let bytes = encode_frame(frame)?;
        let mut stdin = self.stdin.lock().await;
        if let Err(e) = stdin.write_all(&bytes).await {
            self.alive.store(false, Ordering::Release);
            return Err(LspError::Io(e));
        }
        stdin.flush().await.map_err(|e| {
            self.alive.store(false, Ordering::Release);
            LspError::Io(e)
        })
    }

    /// Open a document if it is not already open with this server.
    pub async fn ensure_document_open(&self, path: &Path) -> Result<(), LspError> {
        {
            let opened = self.opened_documents.lock().await;
            if opened.contains(path) {
                return Ok(());
            }
        }
        let text = tokio::fs::read_to_string(path).await.map_err(LspError::Io)?;
        self.notify(
            "textDocument/didOpen",
            json!({
                "textDocument": {
                    "uri": path_to_uri(path),
                    "languageId": self.language.lsp_id(),
                    "version": 1,
                    "text": text,
                }
            }),
        )
        .await?;
        self.opened_documents.lock().await.insert(path.to_path_buf());
        Ok(())
    }

    /// `textDocument/documentSymbol`, accepting either result shape.
    pub async fn document_symbols(&self, path: &Path) -> Result<Vec<DocumentSymbol>, LspError> {
        self.ensure_document_open(path).await?;
        let result = self
            .request(
                "textDocument/documentSymbol",
                json!({ "textDocument": { "uri": path_to_uri(path) } }),
            )
            .await?;

        if result.is_null() {
            return Ok(Vec::new());
        }
        if let Ok(symbols) = serde_json::from_value::<Vec<DocumentSymbol>>(result.clone()) {
            return Ok(symbols);
        }
        if let Ok(flat) = serde_json::from_value::<Vec<SymbolInformation>>(result) {
            return Ok(flat
                .into_iter()
                .map(SymbolInformation::into_document_symbol)
                .collect());
        }
        Err(LspError::Protocol(format!(
            "{} returned an unrecognized documentSymbol result",
            self.server_name
        )))
    }

    /// `textDocument/references` at a selection position.
    pub async fn references(
        &self,
        path: &Path,
        position: LspPosition,
        include_declaration: bool,
    ) -> Result<Vec<LspLocation>, LspError> {
        self.ensure_document_open(path).await?;
        let result = self
            .request(
                "textDocument/references",
                json!({
                    "textDocument": { "uri": path_to_uri(path) },
                    "position": position,
                    "context": { "includeDeclaration": include_declaration },
                }),
            )
            .await?;
        parse_locations(result, &self.server_name)
    }

    /// `textDocument/implementation` at a selection position.
    pub async fn implementations(
        &self,
        path: &Path,
        position: LspPosition,
    ) -> Result<Vec<LspLocation>, LspError> {
        self.ensure_document_open(path).await?;
        let result = self
            .request(
                "textDocument/implementation",
                json!({
                    "textDocument": { "uri": path_to_uri(path) },
                    "position": position,
                }),
            )
            .await?;
        parse_locations(result, &self.server_name)
    }

    /// Register an additional workspace root on a running server.
    pub async fn add_workspace_folder(&self, root: &Path) -> Result<(), LspError> {
        let uri = path_to_uri(root);
        self.notify(
            "workspace/didChangeWorkspaceFolders",
            json!({
                "event": {
                    "added": [{
                        "uri": uri,
                        "name": root.file_name().and_then(|n| n.to_str()).unwrap_or("workspace"),
                    }],
                    "removed": [],
                }
            }),
        )
        .await
    }

    /// Cancel every request currently in flight via `$/cancelRequest`.
    pub async fn cancel_inflight(&self) {
        let ids: Vec<i64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            let _ = self.notify("$/cancelRequest", json!({ "id": id })).await;
        }
    }

    /// Graceful shutdown with escalation: `shutdown` + `exit`, then SIGTERM
    /// after the grace period, then SIGKILL.
    pub async fn shutdown(&self, grace: Duration) {
        self.alive.store(false, Ordering::Release);

        let shutdown_frame = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": "shutdown",
            "params": Value::Null,
        });
        let _ = self.write_raw_ignoring_alive(&shutdown_frame).await;
        let exit_frame = json!({ "jsonrpc": "2.0", "method": "exit", "params": Value::Null });
        let _ = self.write_raw_ignoring_alive(&exit_frame).await;

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            if timeout(grace, child.wait()).await.is_err() {
                if let Some(pid) = child.id() {
                    debug!("{} did not exit in grace period, sending SIGTERM", self.server_name);
                    unsafe {
                        libc::kill(pid as i32, libc::SIGTERM);
                    }
                }
                if timeout(grace, child.wait()).await.is_err() {
                    warn!("{} ignored SIGTERM, killing", self.server_name);
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }

        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }
        if let Some(task) = self.stderr_task.lock().await.take() {
            task.abort();
        }
        self.fail_pending("server shut down");
    }

    async fn write_raw_ignoring_alive(&self, frame: &Value) -> Result<(), LspError> {
        let bytes = encode_frame(frame)?;
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(&bytes).await.map_err(LspError::Io)?;
        stdin.flush().await.map_err(LspError::Io)
    }

    fn fail_pending(&self, reason: &str) {
        let ids: Vec<i64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(LspError::Protocol(reason.to_string())));
            }
        }
    }
}

/// Encode one JSON-RPC message with the LSP base-protocol header.
pub fn encode_frame(frame: &Value) -> Result<Vec<u8>, LspError> {
    let body = serde_json::to_vec(frame)
        .map_err(|e| LspError::Protocol(format!("unencodable frame: {}", e)))?;
    let mut bytes = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

/// Read one framed message; `Ok(None)` means clean EOF.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
) -> Result<Option<Value>, LspError> {
    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| LspError::Protocol(format!("header read failed: {}", e)))?;
        if n == 0 {
            if content_length.is_some() {
                return Err(LspError::Protocol("EOF inside frame header".into()));
            }
            return Ok(None);
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some(rest) = trimmed.strip_prefix("Content-Length:") {
            let length: usize = rest
                .trim()
                .parse()
                .map_err(|_| LspError::Protocol(format!("bad Content-Length: {:?}", rest)))?;
            content_length = Some(length);
        }
        // Content-Type and unknown headers are ignored.
    }

    let length =
        content_length.ok_or_else(|| LspError::Protocol("frame missing Content-Length".into()))?;
    if length > MAX_FRAME_BYTES {
        return Err(LspError::Protocol(format!("frame of {} bytes too large", length)));
    }

    let mut body = vec![0u8; length];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| LspError::Protocol(format!("body read failed: {}", e)))?;
    serde_json::from_slice(&body)
        .map_err(|e| LspError::Protocol(format!("frame is not valid JSON: {}", e)))
}

async fn read_loop<R: AsyncRead + Unpin>(
    stdout: R,
    pending: PendingMap,
    alive: Arc<AtomicBool>,
    stdin: Arc<Mutex<ChildStdin>>,
    server_name: String,
) {
    let mut reader = BufReader::new(stdout);
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(message)) => dispatch(message, &pending, &stdin, &server_name).await,
            Ok(None) => {
                debug!("{} closed its stdout", server_name);
                break;
            }
            Err(e) => {
                warn!("{}: {}", server_name, e);
                break;
            }
        }
    }
    alive.store(false, Ordering::Release);
    let ids: Vec<i64> = pending.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        if let Some((_, tx)) = pending.remove(&id) {
            let _ = tx.send(Err(LspError::Protocol(format!(
                "{} connection closed",
                server_name
            ))));
        }
    }
}

async fn dispatch(
    message: Value,
    pending: &PendingMap,
    stdin: &Arc<Mutex<ChildStdin>>,
    server_name: &str,
) {
    let has_id = message.get("id").map(|id| !id.is_null()).unwrap_or(false);
    let method = message.get("method").and_then(|m| m.as_str());

    match (has_id, method) {
        // Response to one of our requests.
        (true, None) => {
            let Some(id) = message.get("id").and_then(|id| id.as_i64()) else {
                trace!("{}: response with non-numeric id ignored", server_name);
                return;
            };
            let Some((_, tx)) = pending.remove(&id) else {
                trace!("{}: response for unknown request {}", server_name, id);
                return;
            };
            let outcome = if let Some(error) = message.get("error") {
                Err(LspError::Server {
                    code: error.get("code").and_then(|c| c.as_i64()).unwrap_or(0),
                    message: error
                        .get("message")
                        .and_then(|m| m.as_str())
                        .unwrap_or("unknown error")
                        .to_string(),
                })
            } else {
                Ok(message.get("result").cloned().unwrap_or(Value::Null))
            };
            let _ = tx.send(outcome);
        }
        // Server-to-client request.
        (true, Some(method)) => {
            let id = message.get("id").cloned().unwrap_or(Value::Null);
            let reply = match method {
                "workspace/configuration" => {
                    let items = message
                        .pointer("/params/items")
                        .and_then(|items| items.as_array())
                        .map(|items| items.len())
                        .unwrap_or(1);
                    json!({ "jsonrpc": "2.0", "id": id, "result": vec![Value::Null; items] })
                }
                "window/workDoneProgress/create" | "client/registerCapability" => {
                    json!({ "jsonrpc": "2.0", "id": id, "result": Value::Null })
                }
                other => {
                    trace!("{}: refusing server request '{}'", server_name, other);
                    json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": { "code": -32601, "message": "method not supported" },
                    })
                }
            };
            if let Ok(bytes) = encode_frame(&reply) {
                let mut stdin = stdin.lock().await;
                let _ = stdin.write_all(&bytes).await;
                let _ = stdin.flush().await;
            }
        }
        // Notification.
        (false, Some(method)) => {
            trace!("{}: notification '{}'", server_name, method);
        }
        (false, None) => {
            trace!("{}: message without id or method ignored", server_name);
        }
    }
}

/// Locations come back as `Location`, `Location[]`, or `LocationLink[]`.
fn parse_locations(result: Value, server_name: &str) -> Result<Vec<LspLocation>, LspError> {
    if result.is_null() {
        return Ok(Vec::new());
    }
    if let Ok(locations) = serde_json::from_value::<Vec<LspLocation>>(result.clone()) {
        return Ok(locations);
    }
    if let Ok(single) = serde_json::from_value::<LspLocation>(result.clone()) {
        return Ok(vec![single]);
    }
    if let Some(links) = result.as_array() {
        let mut locations = Vec::with_capacity(links.len());
        for link in links {
            let (Some(uri), Some(range)) = (link.get("targetUri"), link.get("targetRange")) else {
                return Err(LspError::Protocol(format!(
                    "{} returned an unrecognized location result",
                    server_name
                )));
            };
            locations.push(LspLocation {
                uri: uri.as_str().unwrap_or_default().to_string(),
                range: serde_json::from_value(range.clone()).map_err(|e| {
                    LspError::Protocol(format!("bad LocationLink range: {}", e))
                })?,
            });
        }
        return Ok(locations);
    }
    Err(LspError::Protocol(format!(
        "{} returned an unrecognized location result",
        server_name
    )))
}

/// Best-effort canonical `file://` URI for a path.
pub fn path_to_uri(path: &Path) -> String {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(path)
    };
    let canonical = std::fs::canonicalize(&absolute).unwrap_or(absolute);
    Url::from_file_path(&canonical)
        .map(|url| url.to_string())
        .unwrap_or_else(|_| format!("file://{}", canonical.display()))
}
