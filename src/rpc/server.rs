//! RPC server (C2): the Unix-socket listener, per-client read loops, and
//! the notification push paths the broker (C4) and credential round-trip
//! (C7) write through.

use async_trait::async_trait;
use moleport_protocol::{
    ErrorCode, FrameError, Id, Notification, Response, RpcErrorObject, JSONRPC_VERSION,
};
use std::collections::HashMap;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedReadHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ssh::NotificationSink;

const MAX_LINE_BYTES: usize = moleport_protocol::MAX_LINE_BYTES;

/// Reads one newline-delimited frame, translating EOF/oversize/IO failure
/// into the shared `FrameError` taxonomy rather than ad hoc `io::Result`
/// handling at each call site.
async fn read_frame(
    reader: &mut BufReader<OwnedReadHalf>,
    buf: &mut Vec<u8>,
) -> Result<String, FrameError> {
    buf.clear();
    let n = reader.read_until(b'\n', buf).await?;
    if n == 0 {
        return Err(FrameError::Closed);
    }
    if buf.len() > MAX_LINE_BYTES {
        return Err(FrameError::TooLong);
    }
    Ok(String::from_utf8_lossy(buf).trim_end().to_string())
}

/// Implemented by the method router (C8). `dispatch` handles both requests
/// (the caller replies when it returns) and notifications (the caller
/// discards the result).
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(
        &self,
        client_id: &str,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, RpcErrorObject>;
}

/// Told about clients joining/leaving so the broker (C4) can key
/// subscriptions by client id.
#[async_trait]
pub trait ClientLifecycle: Send + Sync {
    async fn on_connect(&self, client_id: &str);
    async fn on_disconnect(&self, client_id: &str);
}

struct ClientHandle {
    writer: Mutex<tokio::net::unix::OwnedWriteHalf>,
}

impl ClientHandle {
    async fn write_line(&self, line: &str) -> io::Result<()> {
        let mut w = self.writer.lock().await;
        w.write_all(line.as_bytes()).await
    }
}

pub struct RpcServer {
    socket_path: PathBuf,
    clients: tokio::sync::RwLock<HashMap<String, Arc<ClientHandle>>>,
    next_client_id: AtomicU64,
    dispatcher: Arc<dyn Dispatcher>,
    lifecycle: Arc<dyn ClientLifecycle>,
}

impl RpcServer {
    pub fn new(
        socket_path: PathBuf,
        dispatcher: Arc<dyn Dispatcher>,
        lifecycle: Arc<dyn ClientLifecycle>,
    ) -> Arc<Self> {
        Arc::new(RpcServer {
            socket_path,
            clients: tokio::sync::RwLock::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
            dispatcher,
            lifecycle,
        })
    }

    /// Binds the socket (replacing a stale one left by a crashed prior
    /// instance), sets mode 0600, and accepts connections until `shutdown`
    /// fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> io::Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;
        info!(path = %self.socket_path.display(), "rpc server listening");

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let server = self.clone();
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move { server.serve_client(stream, shutdown).await });
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
            }
        }
        self.close_all().await;
        let _ = std::fs::remove_file(&self.socket_path);
        Ok(())
    }

    async fn close_all(&self) {
        let ids: Vec<String> = self.clients.read().await.keys().cloned().collect();
        for id in ids {
            self.clients.write().await.remove(&id);
            self.lifecycle.on_disconnect(&id).await;
        }
    }

    fn mint_client_id(&self) -> String {
        format!("client-{}", self.next_client_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn serve_client(self: Arc<Self>, stream: UnixStream, shutdown: CancellationToken) {
        let client_id = self.mint_client_id();
        let (read_half, write_half) = stream.into_split();
        let handle = Arc::new(ClientHandle {
            writer: Mutex::new(write_half),
        });
        self.clients
            .write()
            .await
            .insert(client_id.clone(), handle.clone());
        self.lifecycle.on_connect(&client_id).await;
        debug!(client = %client_id, "client connected");

        let mut reader = BufReader::new(read_half);
        let mut buf = Vec::new();
        loop {
            let frame = tokio::select! {
                () = shutdown.cancelled() => break,
                r = read_frame(&mut reader, &mut buf) => r,
            };
            match frame {
                Ok(line) => {
                    if let Some(response) = self.handle_line(&client_id, &line).await {
                        if let Ok(framed) = moleport_protocol::serialize_line(&response) {
                            let _ = handle.write_line(&framed).await;
                        }
                    }
                }
                Err(FrameError::Closed) => break,
                Err(FrameError::TooLong) => {
                    warn!(client = %client_id, "line exceeded max size, closing");
                    break;
                }
                Err(FrameError::Io(e)) => {
                    warn!(client = %client_id, error = %e, "read error, closing");
                    break;
                }
            }
        }

        self.clients.write().await.remove(&client_id);
        self.lifecycle.on_disconnect(&client_id).await;
        debug!(client = %client_id, "client disconnected");
    }

    async fn handle_line(&self, client_id: &str, line: &str) -> Option<Response> {
        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => {
                return Some(Response::err(
                    None,
                    ErrorCode::ParseError.into_error("invalid JSON"),
                ));
            }
        };

        let has_id = value.get("id").is_some();
        let id: Id = value.get("id").and_then(serde_json::Value::as_i64);
        let jsonrpc_ok = value.get("jsonrpc").and_then(|v| v.as_str()) == Some(JSONRPC_VERSION);
        if !jsonrpc_ok && has_id {
            return Some(Response::err(
                id,
                ErrorCode::InvalidRequest.into_error("unsupported jsonrpc version"),
            ));
        }

        let Some(method) = value.get("method").and_then(|v| v.as_str()) else {
            return has_id.then(|| {
                Response::err(id, ErrorCode::InvalidRequest.into_error("missing method"))
            });
        };
        let params = value.get("params").cloned();
        let result = self.dispatcher.dispatch(client_id, method, params).await;
        if !has_id {
            return None;
        }
        Some(match result {
            Ok(value) => Response::ok(id, value),
            Err(e) => Response::err(id, e),
        })
    }

    pub async fn send_notification(
        &self,
        client_id: &str,
        notif: Notification,
    ) -> Result<(), String> {
        let handle = self
            .clients
            .read()
            .await
            .get(client_id)
            .cloned()
            .ok_or_else(|| "client not found".to_string())?;
        let line = moleport_protocol::serialize_line(&notif).map_err(|e| e.to_string())?;
        handle.write_line(&line).await.map_err(|e| e.to_string())
    }

    /// Best-effort fan-out; per-client write failures are swallowed.
    pub async fn broadcast_notification(&self, notif: Notification) {
        let handles: Vec<Arc<ClientHandle>> = self.clients.read().await.values().cloned().collect();
        let Ok(line) = moleport_protocol::serialize_line(&notif) else {
            return;
        };
        for handle in handles {
            let line = line.clone();
            tokio::spawn(async move {
                let _ = handle.write_line(&line).await;
            });
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

#[async_trait]
impl NotificationSink for RpcServer {
    async fn send_notification(&self, client_id: &str, notif: Notification) -> Result<(), String> {
        RpcServer::send_notification(self, client_id, notif).await
    }
}
