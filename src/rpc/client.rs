//! RPC client (C3): dials the Unix socket, correlates replies by `id`,
//! and fans incoming notifications out to the owning application -- except
//! `credential.request`, which is routed to a registered handler instead.

use async_trait::async_trait;
use moleport_protocol::{parse_client_inbound, ClientInboundFrame, FrameError, Notification, Request};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedReadHalf;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::warn;

const EVENT_CHANNEL_CAPACITY: usize = 64;
const MAX_LINE_BYTES: usize = moleport_protocol::MAX_LINE_BYTES;

/// Mirrors `rpc::server`'s frame reader: translates EOF/oversize/IO
/// failure into the shared `FrameError` taxonomy.
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

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("connection closed")]
    Closed,
    #[error("call deadline exceeded")]
    DeadlineExceeded,
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("server error {code}: {message}")]
    Server { code: i64, message: String },
}

/// Invoked on the client's dedicated task whenever the daemon pushes
/// `credential.request`. Every path -- value, cancellation, or handler
/// error -- must produce a reply so the daemon never waits forever.
#[async_trait]
pub trait CredentialHandler: Send + Sync {
    async fn handle(&self, request_id: String, params: serde_json::Value) -> serde_json::Value;
}

struct Pending {
    reply: oneshot::Sender<Result<serde_json::Value, (i64, String)>>,
}

struct Inner {
    writer: Mutex<tokio::net::unix::OwnedWriteHalf>,
    pending: Mutex<HashMap<i64, Pending>>,
    next_id: AtomicI64,
    events_tx: mpsc::Sender<Notification>,
    closed: tokio::sync::Notify,
}

#[derive(Clone)]
pub struct RpcClient(Arc<Inner>);

impl RpcClient {
    /// Dials `socket_path` and spawns the reader task. `credential_handler`
    /// is optional: a pure library caller with no interactive surface can
    /// omit it, in which case a `credential.request` notification is
    /// answered with a cancellation.
    pub async fn connect(
        socket_path: &std::path::Path,
        credential_handler: Option<Arc<dyn CredentialHandler>>,
    ) -> io::Result<(Self, mpsc::Receiver<Notification>)> {
        let stream = UnixStream::connect(socket_path).await?;
        let (read_half, write_half) = stream.into_split();
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let inner = Arc::new(Inner {
            writer: Mutex::new(write_half),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            events_tx,
            closed: tokio::sync::Notify::new(),
        });
        let client = RpcClient(inner);
        client.clone().spawn_reader(read_half, credential_handler);
        Ok((client, events_rx))
    }

    fn spawn_reader(
        self,
        read_half: tokio::net::unix::OwnedReadHalf,
        credential_handler: Option<Arc<dyn CredentialHandler>>,
    ) {
        tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            let mut buf = Vec::new();
            loop {
                match read_frame(&mut reader, &mut buf).await {
                    Ok(line) => self.handle_inbound(&line, &credential_handler).await,
                    Err(FrameError::Closed) => break,
                    Err(FrameError::TooLong) => {
                        warn!("server line exceeded max size, closing");
                        break;
                    }
                    Err(FrameError::Io(e)) => {
                        warn!(error = %e, "rpc client read error");
                        break;
                    }
                }
            }
            self.fail_all_pending().await;
            self.0.closed.notify_waiters();
        });
    }

    async fn handle_inbound(
        &self,
        line: &str,
        credential_handler: &Option<Arc<dyn CredentialHandler>>,
    ) {
        let frame = match parse_client_inbound(line) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "malformed inbound frame");
                return;
            }
        };
        match frame {
            ClientInboundFrame::Response(resp) => {
                let Some(id) = resp.id else { return };
                let pending = self.0.pending.lock().await.remove(&id);
                if let Some(pending) = pending {
                    let outcome = match resp.error {
                        Some(e) => Err((e.code, e.message)),
                        None => Ok(resp.result.unwrap_or(serde_json::Value::Null)),
                    };
                    let _ = pending.reply.send(outcome);
                }
            }
            ClientInboundFrame::Notification(notif) if notif.method == "credential.request" => {
                self.handle_credential_request(notif, credential_handler.clone())
                    .await;
            }
            ClientInboundFrame::Notification(notif) => {
                if self.0.events_tx.try_send(notif).is_err() {
                    warn!("event channel full, dropping notification");
                }
            }
        }
    }

    async fn handle_credential_request(
        &self,
        notif: Notification,
        credential_handler: Option<Arc<dyn CredentialHandler>>,
    ) {
        let params = notif.params.unwrap_or(serde_json::Value::Null);
        let request_id = params
            .get("request_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let client = self.clone();
        tokio::spawn(async move {
            let answer = match credential_handler {
                Some(handler) => handler.handle(request_id.clone(), params).await,
                None => serde_json::json!({"request_id": request_id, "cancelled": true}),
            };
            let _ = client.notify("credential.response", Some(answer)).await;
        });
    }

    async fn fail_all_pending(&self) {
        let mut pending = self.0.pending.lock().await;
        for (_, p) in pending.drain() {
            let _ = p.reply.send(Err((-1, "connection closed".to_string())));
        }
    }

    /// Sends a request and waits for its reply, or `deadline` elapsing
    /// first -- in which case the waiter is removed so a late reply is
    /// dropped, not cross-delivered to a future call reusing the id.
    pub async fn call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        deadline: std::time::Duration,
    ) -> Result<serde_json::Value, ClientError> {
        let id = self.0.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.0.pending.lock().await.insert(id, Pending { reply: tx });

        let req = Request::new(Some(id), method, params);
        let line = moleport_protocol::serialize_line(&req)
            .map_err(|e| ClientError::Malformed(e.to_string()))?;
        {
            let mut w = self.0.writer.lock().await;
            if let Err(e) = w.write_all(line.as_bytes()).await {
                self.0.pending.lock().await.remove(&id);
                return Err(ClientError::Io(e));
            }
        }

        tokio::select! {
            result = rx => match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err((code, message))) => Err(ClientError::Server { code, message }),
                Err(_) => Err(ClientError::Closed),
            },
            () = tokio::time::sleep(deadline) => {
                self.0.pending.lock().await.remove(&id);
                Err(ClientError::DeadlineExceeded)
            }
        }
    }

    /// Resolves once the reader loop has observed the connection close.
    /// A caller that awaits this after the close already happened returns
    /// immediately only if it happened to be waiting at the time --
    /// callers needing a one-shot flag should watch `call`'s `Closed`
    /// errors instead.
    pub async fn wait_closed(&self) {
        self.0.closed.notified().await;
    }

    /// Fire-and-forget: a request with no `id`.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), ClientError> {
        let req = Request::new(None, method, params);
        let line = moleport_protocol::serialize_line(&req)
            .map_err(|e| ClientError::Malformed(e.to_string()))?;
        let mut w = self.0.writer.lock().await;
        w.write_all(line.as_bytes()).await?;
        Ok(())
    }
}
