//! WebSocket sync server with workspace-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── ConnectionRegistry ──► other clients
//!             ├── /ws/<workspace> ──┤
//! Client B ──┘     (Session)        └── ActionDispatcher ──► WorkspaceStore (RocksDB)
//! ```
//!
//! Every accepted socket gets its own task. The task splits the socket: a
//! writer task drains the connection's outbound channel into the sink while
//! the read loop feeds text and binary frames to the session one at a time.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use crate::registry::{ConnectionRegistry, DEFAULT_OUTBOUND_CAPACITY};
use crate::session::{FrameOutcome, Session, SyncContext};
use crate::storage::{StoreConfig, StoreError, WorkspaceStore};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Request path prefix; the remainder of the path is the workspace id
    pub ws_path_prefix: String,
    /// Frames buffered per connection before further frames are dropped
    pub outbound_capacity: usize,
    /// Workspace store settings
    pub storage: StoreConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5000".to_string(),
            ws_path_prefix: "/ws/".to_string(),
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            storage: StoreConfig::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub messages_received: u64,
    pub actions_applied: u64,
    pub actions_rejected: u64,
    pub malformed_frames: u64,
}

/// Lock-free counters behind [`ServerStats`].
#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    messages_received: AtomicU64,
    actions_applied: AtomicU64,
    actions_rejected: AtomicU64,
    malformed_frames: AtomicU64,
}

impl AtomicServerStats {
    fn record(&self, outcome: FrameOutcome) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            FrameOutcome::Applied { .. } => &self.actions_applied,
            FrameOutcome::Rejected | FrameOutcome::UnknownAction => &self.actions_rejected,
            FrameOutcome::Dropped => &self.malformed_frames,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            actions_applied: self.actions_applied.load(Ordering::Relaxed),
            actions_rejected: self.actions_rejected.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
        }
    }
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    ctx: Arc<SyncContext>,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer {
    /// Open the store and build the server.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store = WorkspaceStore::open(config.storage.clone())?;
        log::info!(
            "Opened workspace store at {} ({} workspaces)",
            store.path().display(),
            store.list_workspaces()?.len()
        );
        Ok(Self {
            ctx: Arc::new(SyncContext::new(Arc::new(store))),
            config,
            stats: Arc::new(AtomicServerStats::default()),
        })
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let prefix: Arc<str> = Arc::from(self.config.ws_path_prefix.as_str());
        let capacity = self.config.outbound_capacity.max(1);
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let ctx = self.ctx.clone();
            let stats = self.stats.clone();
            let prefix = prefix.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, ctx, stats, prefix, capacity).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        ctx: Arc<SyncContext>,
        stats: Arc<AtomicServerStats>,
        prefix: Arc<str>,
        capacity: usize,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut workspace_id = None;
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            match workspace_from_path(req.uri().path(), &prefix) {
                Some(id) => {
                    workspace_id = Some(id.to_string());
                    Ok(resp)
                }
                None => Err(bad_request(format!("expected {prefix}<workspaceId>"))),
            }
        })
        .await?;
        let Some(workspace_id) = workspace_id else {
            return Err("handshake completed without a workspace id".into());
        };

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<Message>(capacity);
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = ws_sender.send(msg).await {
                    log::warn!("Write to {addr} failed: {e}");
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("WebSocket connection established from {addr} for workspace {workspace_id}");

        let mut session = Session::new(ctx, workspace_id);
        let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = async {
            session.sync(tx).await?;
            while let Some(frame) = ws_receiver.next().await {
                match frame? {
                    Message::Text(text) => {
                        let outcome = session.handle_text(text.as_str()).await?;
                        stats.record(outcome);
                    }
                    Message::Binary(bytes) => {
                        let outcome = match std::str::from_utf8(&bytes) {
                            Ok(text) => session.handle_text(text).await?,
                            Err(e) => {
                                log::debug!("Dropping non-UTF-8 binary frame from {addr}: {e}");
                                FrameOutcome::Dropped
                            }
                        };
                        stats.record(outcome);
                    }
                    Message::Close(_) => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }
                    // Pings are answered by the transport
                    _ => {}
                }
            }
            Ok(())
        }
        .await;

        // Unregistering drops the last sender, which ends the writer task
        session.close().await;
        let _ = writer.await;
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        result
    }

    /// Get server statistics.
    pub fn stats(&self) -> ServerStats {
        self.stats.snapshot()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.ctx.registry
    }

    pub fn store(&self) -> &Arc<WorkspaceStore> {
        self.ctx.store()
    }
}

/// Extract the workspace id from a request path.
///
/// The id is everything after `prefix`; it must be non-empty and contain no `/`.
pub fn workspace_from_path<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let id = path.strip_prefix(prefix)?;
    if id.is_empty() || id.contains('/') {
        return None;
    }
    Some(id)
}

fn bad_request(reason: String) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(reason));
    *resp.status_mut() = StatusCode::BAD_REQUEST;
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:5000");
        assert_eq!(config.ws_path_prefix, "/ws/");
        assert_eq!(config.outbound_capacity, 256);
        assert_eq!(config.storage.path, std::path::PathBuf::from("data/referencer"));
    }

    #[test]
    fn test_workspace_from_path() {
        assert_eq!(workspace_from_path("/ws/abc123", "/ws/"), Some("abc123"));
        assert_eq!(workspace_from_path("/ws/", "/ws/"), None);
        assert_eq!(workspace_from_path("/ws", "/ws/"), None);
        assert_eq!(workspace_from_path("/other/abc", "/ws/"), None);
        assert_eq!(workspace_from_path("/ws/a/b", "/ws/"), None);
        assert_eq!(workspace_from_path("/sync/w1", "/sync/"), Some("w1"));
    }

    #[test]
    fn test_bad_request_status() {
        let resp = bad_request("nope".into());
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(resp.body().as_deref(), Some("nope"));
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".into(),
            storage: StoreConfig::for_testing(dir.path().join("db")),
            ..ServerConfig::default()
        };
        let server = SyncServer::new(config).unwrap();
        assert_eq!(server.bind_addr(), "127.0.0.1:0");
        assert!(server.store().list_workspaces().unwrap().is_empty());
        assert_eq!(server.registry().workspace_count().await, 0);
    }

    #[test]
    fn test_server_stats_initial() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage: StoreConfig::for_testing(dir.path().join("db")),
            ..ServerConfig::default()
        };
        let server = SyncServer::new(config).unwrap();
        assert_eq!(server.stats(), ServerStats::default());
    }

    #[test]
    fn test_stats_record() {
        let stats = AtomicServerStats::default();
        stats.record(FrameOutcome::Applied { relayed: 3 });
        stats.record(FrameOutcome::Rejected);
        stats.record(FrameOutcome::UnknownAction);
        stats.record(FrameOutcome::Dropped);

        let snap = stats.snapshot();
        assert_eq!(snap.messages_received, 4);
        assert_eq!(snap.actions_applied, 1);
        assert_eq!(snap.actions_rejected, 2);
        assert_eq!(snap.malformed_frames, 1);
    }
}
