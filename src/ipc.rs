//! Local IPC transport for the client protocol.
//!
//! The daemon listens on a Unix domain socket; the trait seam keeps the
//! transport pluggable for embedders that bring their own channel.

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use tokio::net::{UnixListener, UnixStream};

/// Transport seam: anything that can accept bidirectional byte streams.
#[async_trait]
pub trait MessageListener: Send + Sync {
    type Stream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static;

    async fn accept(&self) -> Result<Self::Stream>;
    fn local_addr(&self) -> Result<String>;
}

pub struct IpcListener {
    listener: UnixListener,
    path: String,
}

impl IpcListener {
    pub async fn bind(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            std::fs::remove_file(path)?;
        }
        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(path)?;
        Ok(Self {
            listener,
            path: path.to_string(),
        })
    }
}

impl Drop for IpcListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[async_trait]
impl MessageListener for IpcListener {
    type Stream = UnixStream;

    async fn accept(&self) -> Result<Self::Stream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(stream)
    }

    fn local_addr(&self) -> Result<String> {
        Ok(self.path.clone())
    }
}

/// Client-side connect, used by tests and embedding tools.
pub async fn connect(path: &str) -> Result<UnixStream> {
    Ok(UnixStream::connect(path).await?)
}
