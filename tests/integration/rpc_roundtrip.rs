//! End-to-end RPC round trips: a real `RpcServer` bound to a Unix socket in
//! a temp directory, a `Router` wired against mock SSH/forward managers, and
//! a real `RpcClient` dialing in. Exercises the wire protocol, the event
//! broker fan-out, the credential request/response loop, and shutdown.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{mpsc, OnceCell};
use tokio_util::sync::CancellationToken;

use moleport::config::{Config, ReconnectConfig};
use moleport::forward::ForwardManager;
use moleport::router::{ConfigPersist, HostCatalogueSource, Router};
use moleport::rpc::{ClientLifecycle, CredentialHandler, Dispatcher, EventBroker, RpcClient, RpcServer};
use moleport::ssh::client::mock::MockDialer;
use moleport::ssh::{
    CredentialCallback, CredentialKind, CredentialPrompt, DaemonCredentialCallback, HostManager,
    HostTarget, NotificationSink, PendingCredentials,
};

struct NullCatalogue;
#[async_trait]
impl HostCatalogueSource for NullCatalogue {
    async fn load(&self) -> Vec<HostTarget> {
        Vec::new()
    }
}

struct NoopPersist;
#[async_trait]
impl ConfigPersist for NoopPersist {
    async fn persist(&self, _rules: Vec<moleport::forward::ForwardRule>) {}
}

/// Mirrors `daemon.rs`'s `RouterHandle`: `RpcServer::new` needs a dispatcher
/// before the router (which needs the constructed server) can exist.
struct RouterHandle(Arc<OnceCell<Arc<Router>>>);

#[async_trait]
impl Dispatcher for RouterHandle {
    async fn dispatch(
        &self,
        client_id: &str,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, moleport_protocol::RpcErrorObject> {
        self.0.get().unwrap().dispatch(client_id, method, params).await
    }
}

#[async_trait]
impl ClientLifecycle for RouterHandle {
    async fn on_connect(&self, client_id: &str) {
        if let Some(r) = self.0.get() {
            r.on_connect(client_id).await;
        }
    }
    async fn on_disconnect(&self, client_id: &str) {
        if let Some(r) = self.0.get() {
            r.on_disconnect(client_id).await;
        }
    }
}

struct Harness {
    router: Arc<Router>,
    server: Arc<RpcServer>,
    pending_credentials: Arc<PendingCredentials>,
    client: RpcClient,
    notifications: mpsc::Receiver<moleport_protocol::Notification>,
    hosts: HostManager,
    server_task: tokio::task::JoinHandle<std::io::Result<()>>,
    shutdown: CancellationToken,
    _tmp: tempfile::TempDir,
}

async fn harness(credential_handler: Option<Arc<dyn CredentialHandler>>) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let socket_path = tmp.path().join("moleport.sock");

    let dialer = MockDialer::new();
    let (hosts, ssh_events) = HostManager::new(dialer, ReconnectConfig::default());
    let (forwards, forward_events) = ForwardManager::new(hosts.clone());

    let router_slot = Arc::new(OnceCell::<Arc<Router>>::new());
    let handle = Arc::new(RouterHandle(router_slot.clone()));
    let server = RpcServer::new(socket_path.clone(), handle.clone(), handle);
    let broker = EventBroker::new(server.clone());

    let shutdown = CancellationToken::new();
    let pending_credentials = PendingCredentials::new();
    let router = Arc::new(Router::new(
        hosts.clone(),
        forwards,
        broker.clone(),
        server.clone(),
        pending_credentials.clone(),
        Arc::new(NullCatalogue) as Arc<dyn HostCatalogueSource>,
        Arc::new(NoopPersist) as Arc<dyn ConfigPersist>,
        Config::default(),
        shutdown.clone(),
    ));
    router_slot.set(router.clone()).unwrap_or_else(|_| unreachable!());

    spawn_event_pump(broker, ssh_events, forward_events);

    let server_task = {
        let server = server.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { server.run(shutdown).await })
    };

    // Give the listener a moment to bind before the client dials.
    for _ in 0..100 {
        if socket_path.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let (client, notifications) = RpcClient::connect(&socket_path, credential_handler)
        .await
        .expect("client connects");

    Harness {
        router,
        server,
        pending_credentials,
        client,
        notifications,
        hosts,
        server_task,
        shutdown,
        _tmp: tmp,
    }
}

fn spawn_event_pump(
    broker: EventBroker,
    mut ssh_events: mpsc::Receiver<moleport::events::SshEvent>,
    mut forward_events: mpsc::Receiver<moleport::events::ForwardEvent>,
) {
    let b = broker.clone();
    tokio::spawn(async move {
        while let Some(e) = ssh_events.recv().await {
            b.publish(moleport::events::DomainEvent::Ssh(e)).await;
        }
    });
    tokio::spawn(async move {
        while let Some(e) = forward_events.recv().await {
            broker.publish(moleport::events::DomainEvent::Forward(e)).await;
        }
    });
}

const DEADLINE: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread")]
async fn connect_publishes_event_to_subscribed_client() {
    let mut h = harness(None).await;
    h.hosts
        .load_hosts(vec![HostTarget {
            alias: "prod".into(),
            hostname: "127.0.0.1".into(),
            port: 22,
            user: "user".into(),
            identity_file: None,
            proxy_jump: Vec::new(),
        }])
        .await;

    let sub = h
        .client
        .call("events.subscribe", Some(json!({"types": ["ssh"]})), DEADLINE)
        .await
        .unwrap();
    assert!(sub.get("subscription_id").is_some());

    let result = h
        .client
        .call("ssh.connect", Some(json!({"host": "prod"})), DEADLINE)
        .await
        .unwrap();
    assert_eq!(result["status"], "connected");

    let notif = tokio::time::timeout(DEADLINE, h.notifications.recv())
        .await
        .expect("notification arrives")
        .expect("channel open");
    assert_eq!(notif.method, "event.ssh");
    let params = notif.params.unwrap();
    assert_eq!(params["type"], "connected");
    assert_eq!(params["host"], "prod");

    h.shutdown.cancel();
    let _ = h.server_task.await;
}

#[tokio::test(flavor = "multi_thread")]
async fn credential_round_trip_resolves_through_the_real_client() {
    struct FixedAnswer;
    #[async_trait]
    impl CredentialHandler for FixedAnswer {
        async fn handle(&self, request_id: String, _params: serde_json::Value) -> serde_json::Value {
            json!({"request_id": request_id, "value": "s3cret"})
        }
    }

    let mut h = harness(Some(Arc::new(FixedAnswer))).await;

    // The server mints ids in connection order; this is the only client.
    // Round-trip a call first so `serve_client` has definitely registered
    // it in the server's client map before the push below.
    h.client.call("daemon.status", None, DEADLINE).await.unwrap();
    let client_id = "client-1".to_string();

    // Push a credential request to that client directly via the router's
    // own `PendingCredentials`, bypassing the SSH dial path entirely (the
    // mock dialer never triggers one) to exercise C2/C3/C7 end to end.
    let cb = DaemonCredentialCallback::new(
        client_id,
        "prod".to_string(),
        h.pending_credentials.clone(),
        h.server.clone() as Arc<dyn NotificationSink>,
        CancellationToken::new(),
    );
    let answer = cb
        .request(CredentialPrompt {
            kind: CredentialKind::Password,
            prompt: "Password for user@prod:".to_string(),
            sub_prompts: Vec::new(),
        })
        .await;

    match answer {
        moleport::ssh::CredentialAnswer::Value(v) => assert_eq!(v, "s3cret"),
        other => panic!("expected a resolved password answer, got {other:?}"),
    }

    // Drain the notification the client routed to its own channel while
    // answering -- `handle_credential_request` never forwards the request
    // itself there, so this just confirms the channel is still healthy.
    drop(h.notifications.try_recv());

    h.shutdown.cancel();
    let _ = h.server_task.await;
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_with_purge_cancels_token_and_sets_purge_flag() {
    let h = harness(None).await;
    assert!(!h.router.purge_requested());

    let result = h
        .client
        .call("daemon.shutdown", Some(json!({"purge": true})), DEADLINE)
        .await
        .unwrap();
    assert_eq!(result["ok"], true);
    assert!(h.router.purge_requested());
    assert!(h.shutdown.is_cancelled());

    tokio::time::timeout(DEADLINE, h.server_task)
        .await
        .expect("server loop exits after shutdown")
        .unwrap()
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn call_after_server_stop_fails_instead_of_hanging() {
    let h = harness(None).await;
    h.shutdown.cancel();
    tokio::time::timeout(DEADLINE, h.server_task)
        .await
        .expect("server stops")
        .unwrap()
        .unwrap();

    let result = tokio::time::timeout(
        DEADLINE,
        h.client.call("daemon.status", None, DEADLINE),
    )
    .await
    .expect("call returns promptly rather than hanging");
    assert!(result.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn call_with_past_deadline_returns_deadline_exceeded() {
    let h = harness(None).await;
    let result = h
        .client
        .call("daemon.status", None, Duration::from_millis(0))
        .await;
    assert!(matches!(
        result,
        Err(moleport::rpc::ClientError::DeadlineExceeded)
    ));

    h.shutdown.cancel();
    let _ = h.server_task.await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_method_yields_method_not_found() {
    let h = harness(None).await;
    let err = h
        .client
        .call("bogus.method", None, DEADLINE)
        .await
        .unwrap_err();
    match err {
        moleport::rpc::ClientError::Server { code, .. } => assert_eq!(code, -32601),
        other => panic!("expected a server error, got {other:?}"),
    }

    h.shutdown.cancel();
    let _ = h.server_task.await;
}
