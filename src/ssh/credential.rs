//! Credential round-trip (C7): the daemon solicits a secret from an
//! attached interactive client mid-handshake, correlated by an opaque
//! `requestId` and a reply channel of capacity 1 (§3, §4.7).

use async_trait::async_trait;
use moleport_protocol::Notification;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::client::{CredentialAnswer, CredentialCallback, CredentialKind, CredentialPrompt};

/// Default interactive Connect deadline per §5: "~60s to accommodate
/// credential input"; the round-trip's own internal timeout is shorter.
pub const CREDENTIAL_TIMEOUT: Duration = Duration::from_secs(120);

/// Narrow seam so this module doesn't depend on the RPC server directly --
/// just the ability to push one notification to one client.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send_notification(&self, client_id: &str, notif: Notification) -> Result<(), String>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum WireCredentialKind {
    Password,
    Passphrase,
    KeyboardInteractive,
}

impl From<CredentialKind> for WireCredentialKind {
    fn from(k: CredentialKind) -> Self {
        match k {
            CredentialKind::Password => WireCredentialKind::Password,
            CredentialKind::Passphrase => WireCredentialKind::Passphrase,
            CredentialKind::KeyboardInteractive => WireCredentialKind::KeyboardInteractive,
        }
    }
}

#[derive(Debug, Serialize)]
struct CredentialRequestParams {
    request_id: String,
    #[serde(rename = "type")]
    kind: WireCredentialKind,
    host: String,
    prompt: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    prompts: Vec<String>,
}

/// `{requestId -> reply channel}`, created when a `credential.request`
/// notification is emitted and removed on exit via either path: a matching
/// `credential.response` or the guarding timeout.
#[derive(Default)]
pub struct PendingCredentials {
    counter: AtomicU64,
    pending: Mutex<HashMap<String, oneshot::Sender<CredentialAnswer>>>,
}

impl PendingCredentials {
    pub fn new() -> Arc<Self> {
        Arc::new(PendingCredentials::default())
    }

    fn next_id(&self) -> String {
        format!("cr-{}", self.counter.fetch_add(1, Ordering::SeqCst))
    }

    /// Called by the RPC router when a `credential.response` arrives.
    /// Returns `true` if a waiter was found (and thus completed exactly
    /// once -- the entry is removed atomically so a duplicate or late
    /// response is a no-op).
    pub async fn resolve(&self, request_id: &str, answer: CredentialAnswer) -> bool {
        let mut guard = self.pending.lock().await;
        match guard.remove(request_id) {
            Some(tx) => {
                let _ = tx.send(answer);
                true
            }
            None => false,
        }
    }

    async fn register(&self, request_id: String) -> oneshot::Receiver<CredentialAnswer> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);
        rx
    }

    async fn remove(&self, request_id: &str) {
        self.pending.lock().await.remove(request_id);
    }
}

/// Daemon-side callback bound to one (client, host) pair at construction,
/// per Design Note §9's "function value bound at construction" guidance.
pub struct DaemonCredentialCallback {
    client_id: String,
    host: String,
    pending: Arc<PendingCredentials>,
    sink: Arc<dyn NotificationSink>,
    shutdown: CancellationToken,
}

impl DaemonCredentialCallback {
    pub fn new(
        client_id: String,
        host: String,
        pending: Arc<PendingCredentials>,
        sink: Arc<dyn NotificationSink>,
        shutdown: CancellationToken,
    ) -> Self {
        DaemonCredentialCallback {
            client_id,
            host,
            pending,
            sink,
            shutdown,
        }
    }
}

#[async_trait]
impl CredentialCallback for DaemonCredentialCallback {
    async fn request(&self, prompt: CredentialPrompt) -> CredentialAnswer {
        let request_id = self.pending.next_id();
        let rx = self.pending.register(request_id.clone()).await;

        let params = CredentialRequestParams {
            request_id: request_id.clone(),
            kind: prompt.kind.into(),
            host: self.host.clone(),
            prompt: prompt.prompt,
            prompts: prompt.sub_prompts,
        };
        let notif = Notification::new(
            "credential.request",
            Some(serde_json::to_value(params).unwrap_or_default()),
        );

        if self
            .sink
            .send_notification(&self.client_id, notif)
            .await
            .is_err()
        {
            // No attached interactive client to answer -- give up
            // immediately rather than waiting out the full timeout.
            self.pending.remove(&request_id).await;
            return CredentialAnswer::Cancelled;
        }

        let outcome = tokio::select! {
            reply = rx => reply.unwrap_or(CredentialAnswer::Cancelled),
            () = tokio::time::sleep(CREDENTIAL_TIMEOUT) => {
                warn!(request_id = %request_id, "credential request timed out");
                CredentialAnswer::TimedOut
            }
            () = self.shutdown.cancelled() => CredentialAnswer::Cancelled,
        };

        self.pending.remove(&request_id).await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex as StdMutex;

    struct CapturingSink {
        sent: StdMutex<Vec<(String, Notification)>>,
        available: AtomicBool,
    }

    #[async_trait]
    impl NotificationSink for CapturingSink {
        async fn send_notification(
            &self,
            client_id: &str,
            notif: Notification,
        ) -> Result<(), String> {
            if !self.available.load(Ordering::SeqCst) {
                return Err("client not found".into());
            }
            self.sent
                .lock()
                .unwrap()
                .push((client_id.to_string(), notif));
            Ok(())
        }
    }

    #[tokio::test]
    async fn reply_resolves_the_waiting_callback() {
        let pending = PendingCredentials::new();
        let sink = Arc::new(CapturingSink {
            sent: StdMutex::new(Vec::new()),
            available: AtomicBool::new(true),
        });
        let cb = DaemonCredentialCallback::new(
            "client-1".into(),
            "prod".into(),
            pending.clone(),
            sink.clone(),
            CancellationToken::new(),
        );

        let request = tokio::spawn(async move {
            cb.request(CredentialPrompt {
                kind: CredentialKind::Password,
                prompt: "Password for prod".into(),
                sub_prompts: Vec::new(),
            })
            .await
        });

        // Wait for the request to register, then reply.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let request_id = sink.sent.lock().unwrap()[0].0.clone();
        assert_eq!(request_id, "client-1");

        let resolved = pending
            .resolve("cr-0", CredentialAnswer::Value("s3cret".into()))
            .await;
        assert!(resolved);

        let answer = request.await.unwrap();
        assert!(matches!(answer, CredentialAnswer::Value(v) if v == "s3cret"));
    }

    #[tokio::test]
    async fn no_attached_client_cancels_immediately() {
        let pending = PendingCredentials::new();
        let sink = Arc::new(CapturingSink {
            sent: StdMutex::new(Vec::new()),
            available: AtomicBool::new(false),
        });
        let cb = DaemonCredentialCallback::new(
            "client-1".into(),
            "prod".into(),
            pending,
            sink,
            CancellationToken::new(),
        );
        let answer = cb
            .request(CredentialPrompt {
                kind: CredentialKind::Password,
                prompt: "p".into(),
                sub_prompts: Vec::new(),
            })
            .await;
        assert!(matches!(answer, CredentialAnswer::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_distinguishable_from_an_explicit_cancel() {
        let pending = PendingCredentials::new();
        let sink = Arc::new(CapturingSink {
            sent: StdMutex::new(Vec::new()),
            available: AtomicBool::new(true),
        });
        let cb = DaemonCredentialCallback::new(
            "client-1".into(),
            "prod".into(),
            pending,
            sink,
            CancellationToken::new(),
        );
        let request = tokio::spawn(async move {
            cb.request(CredentialPrompt {
                kind: CredentialKind::Password,
                prompt: "p".into(),
                sub_prompts: Vec::new(),
            })
            .await
        });
        tokio::time::advance(CREDENTIAL_TIMEOUT + Duration::from_secs(1)).await;
        let answer = request.await.unwrap();
        assert!(matches!(answer, CredentialAnswer::TimedOut));
    }

    #[tokio::test]
    async fn shutdown_yields_cancelled_rather_than_timed_out() {
        let pending = PendingCredentials::new();
        let sink = Arc::new(CapturingSink {
            sent: StdMutex::new(Vec::new()),
            available: AtomicBool::new(true),
        });
        let shutdown = CancellationToken::new();
        let cb = DaemonCredentialCallback::new(
            "client-1".into(),
            "prod".into(),
            pending,
            sink,
            shutdown.clone(),
        );
        let request = tokio::spawn(async move {
            cb.request(CredentialPrompt {
                kind: CredentialKind::Password,
                prompt: "p".into(),
                sub_prompts: Vec::new(),
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        let answer = request.await.unwrap();
        assert!(matches!(answer, CredentialAnswer::Cancelled));
    }

    #[tokio::test]
    async fn duplicate_resolve_is_a_noop() {
        let pending = PendingCredentials::new();
        let first = pending
            .resolve("cr-does-not-exist", CredentialAnswer::Cancelled)
            .await;
        assert!(!first);
    }
}
