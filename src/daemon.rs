//! Daemon assembly (C10): wires C2-C9 together behind the single-instance
//! guard and drives the pump loops that turn domain events into broker
//! publishes.

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, ConfigError};
use crate::datadir::ConfigDir;
use crate::events::DomainEvent;
use crate::forward::ForwardManager;
use crate::pidlock::{PidLock, PidLockError};
use crate::router::{ConfigPersist, HostCatalogueSource, Router};
use crate::rpc::{ClientLifecycle, Dispatcher, EventBroker, RpcServer};
use crate::ssh::client::russh_dialer::RusshDialer;
use crate::ssh::{HostManager, HostTarget, PendingCredentials};

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    PidLock(#[from] PidLockError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Parses `ssh_config_path` into a host catalogue. Actual ssh_config
/// grammar support is an external collaborator's job (Non-goal); until one
/// is wired in, reload simply preserves whatever catalogue is already
/// loaded by returning an empty delta.
struct NullCatalogueSource;

#[async_trait::async_trait]
impl HostCatalogueSource for NullCatalogueSource {
    async fn load(&self) -> Vec<HostTarget> {
        Vec::new()
    }
}

/// Rewrites `config.yaml`'s `forwards` key, leaving the rest of the
/// document as last loaded. Best-effort: a write failure is logged, never
/// propagated to the RPC caller that triggered it.
struct YamlConfigPersist {
    config_path: PathBuf,
}

#[async_trait::async_trait]
impl ConfigPersist for YamlConfigPersist {
    async fn persist(&self, rules: Vec<crate::forward::ForwardRule>) {
        let path = self.config_path.clone();
        let result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut config = Config::load(&path).unwrap_or_default();
            config.forwards = rules;
            let text = serde_yaml::to_string(&config)
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            std::fs::write(&path, text)
        })
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "failed to persist config"),
            Err(e) => warn!(error = %e, "config persist task panicked"),
        }
    }
}

/// Everything the running daemon owns, assembled once at startup and torn
/// down in reverse order on shutdown.
pub struct Daemon {
    _pid_lock: PidLock,
    config_dir: ConfigDir,
    server: Arc<RpcServer>,
    hosts: HostManager,
    forwards: ForwardManager,
    router: Arc<Router>,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Acquires the PID lock, loads config, and wires C2-C9 together. Does
    /// not yet start accepting connections -- call `run` for that.
    pub async fn bootstrap(config_dir: ConfigDir) -> Result<Self, DaemonError> {
        config_dir.ensure_exists()?;
        let pid_lock = PidLock::acquire(&config_dir.pid_path())?;
        let config = Config::load(&config_dir.config_path())?;

        let shutdown = CancellationToken::new();
        let dialer: Arc<dyn crate::ssh::SshDialer> = Arc::new(RusshDialer);
        let (hosts, ssh_events) = HostManager::new(dialer, config.reconnect.clone());
        let (forwards, forward_events) = ForwardManager::new(hosts.clone());
        forwards.load_rules(config.forwards.clone()).await;

        let pending_credentials = PendingCredentials::new();
        let catalogue_source: Arc<dyn HostCatalogueSource> = Arc::new(NullCatalogueSource);
        let initial_targets = catalogue_source.load().await;
        hosts.load_hosts(initial_targets).await;

        let config_persist: Arc<dyn ConfigPersist> = Arc::new(YamlConfigPersist {
            config_path: config_dir.config_path(),
        });

        let router_slot = Arc::new(tokio::sync::OnceCell::<Arc<Router>>::new());
        let router_handle = Arc::new(RouterHandle(router_slot.clone()));
        let server = RpcServer::new(config_dir.socket_path(), router_handle.clone(), router_handle);

        let broker = EventBroker::new(server.clone());
        let router = Arc::new(Router::new(
            hosts.clone(),
            forwards.clone(),
            broker.clone(),
            server.clone(),
            pending_credentials,
            catalogue_source,
            config_persist,
            config,
            shutdown.clone(),
        ));
        router_slot
            .set(router.clone())
            .unwrap_or_else(|_| unreachable!("router slot set exactly once"));

        spawn_event_pump(broker.clone(), ssh_events, forward_events);

        Ok(Daemon {
            _pid_lock: pid_lock,
            config_dir,
            server,
            hosts,
            forwards,
            router,
            shutdown,
        })
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs the RPC server until shutdown is requested (either via
    /// `daemon.shutdown` or `token`), then closes C5/C6 and, if a purge was
    /// requested, removes the persisted session-state file.
    pub async fn run(self, external_shutdown: CancellationToken) -> std::io::Result<()> {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            external_shutdown.cancelled().await;
            shutdown.cancel();
        });

        info!(socket = %self.server.socket_path().display(), "moleport daemon starting");
        self.server.clone().run(self.shutdown.clone()).await?;

        self.forwards.close().await;
        self.hosts.close().await;
        if self.router.purge_requested() {
            let _ = std::fs::remove_file(self.config_dir.state_path());
        }
        info!("moleport daemon stopped");
        Ok(())
    }
}

fn spawn_event_pump(
    broker: EventBroker,
    mut ssh_events: mpsc::Receiver<crate::events::SshEvent>,
    mut forward_events: mpsc::Receiver<crate::events::ForwardEvent>,
) {
    let ssh_broker = broker.clone();
    tokio::spawn(async move {
        while let Some(event) = ssh_events.recv().await {
            ssh_broker.publish(DomainEvent::Ssh(event)).await;
        }
    });
    tokio::spawn(async move {
        while let Some(event) = forward_events.recv().await {
            broker.publish(DomainEvent::Forward(event)).await;
        }
    });
}

/// `RpcServer::new` needs its dispatcher/lifecycle at construction, but the
/// router needs the constructed server to build credential callbacks --
/// this indirection breaks the cycle with a cell filled once, immediately
/// after the server is created and before any client can connect.
struct RouterHandle(Arc<tokio::sync::OnceCell<Arc<Router>>>);

#[async_trait::async_trait]
impl crate::rpc::Dispatcher for RouterHandle {
    async fn dispatch(
        &self,
        client_id: &str,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, moleport_protocol::RpcErrorObject> {
        let router = self.0.get().expect("router set before server accepts");
        router.dispatch(client_id, method, params).await
    }
}

#[async_trait::async_trait]
impl crate::rpc::ClientLifecycle for RouterHandle {
    async fn on_connect(&self, client_id: &str) {
        if let Some(router) = self.0.get() {
            router.on_connect(client_id).await;
        }
    }

    async fn on_disconnect(&self, client_id: &str) {
        if let Some(router) = self.0.get() {
            router.on_disconnect(client_id).await;
        }
    }
}
