//! SSH host manager (C5): catalogue, connect/disconnect, keep-alive,
//! reconnect-with-backoff (§4.5).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ReconnectConfig;
use crate::error::{DomainError, DomainResult};
use crate::events::{SshEvent, SshEventType};

use super::client::{CredentialCallback, HostTarget, SshDialer};
use super::host::{Host, HostConnection, HostInfo, HostState};

/// Default keep-alive probe period (§4.5).
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Domain-event channels are bounded (16) and non-blocking: producers use
/// `try_send` and drop on full (§5) -- consumers treat events as hints,
/// not a durable log.
const EVENT_CHANNEL_CAPACITY: usize = 16;

struct Inner {
    hosts: RwLock<HashMap<String, Host>>,
    connections: RwLock<HashMap<String, Arc<HostConnection>>>,
    credentials: RwLock<HashMap<String, Arc<dyn CredentialCallback>>>,
    reconnect_tokens: RwLock<HashMap<String, CancellationToken>>,
    dialer: Arc<dyn SshDialer>,
    reconnect_cfg: RwLock<ReconnectConfig>,
    events_tx: mpsc::Sender<SshEvent>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct HostManager(Arc<Inner>);

impl HostManager {
    pub fn new(
        dialer: Arc<dyn SshDialer>,
        reconnect_cfg: ReconnectConfig,
    ) -> (Self, mpsc::Receiver<SshEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Inner {
            hosts: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            credentials: RwLock::new(HashMap::new()),
            reconnect_tokens: RwLock::new(HashMap::new()),
            dialer,
            reconnect_cfg: RwLock::new(reconnect_cfg),
            events_tx: tx,
            shutdown: CancellationToken::new(),
        };
        (HostManager(Arc::new(inner)), rx)
    }

    fn emit(&self, event: SshEvent) {
        if self.0.events_tx.try_send(event).is_err() {
            debug!("ssh event channel full, dropping event");
        }
    }

    /// Replaces the catalogue wholesale (initial load).
    pub async fn load_hosts(&self, targets: Vec<HostTarget>) {
        let mut hosts = self.0.hosts.write().await;
        *hosts = targets
            .into_iter()
            .map(|t| (t.alias.clone(), Host::new(t)))
            .collect();
    }

    /// Re-parses the catalogue, preserving `state`/`active_forward_count`
    /// for any alias that still exists (Design Note §9). Returns the
    /// actual added/removed alias diff.
    pub async fn reload_hosts(&self, targets: Vec<HostTarget>) -> (Vec<String>, Vec<String>) {
        let mut hosts = self.0.hosts.write().await;
        let old_aliases: HashSet<String> = hosts.keys().cloned().collect();
        let new_aliases: HashSet<String> = targets.iter().map(|t| t.alias.clone()).collect();
        let added: Vec<String> = new_aliases.difference(&old_aliases).cloned().collect();
        let removed: Vec<String> = old_aliases.difference(&new_aliases).cloned().collect();

        let mut new_map = HashMap::with_capacity(targets.len());
        for target in targets {
            let entry = match hosts.remove(&target.alias) {
                Some(existing) => Host {
                    target,
                    state: existing.state,
                    active_forward_count: existing.active_forward_count,
                },
                None => Host::new(target),
            };
            new_map.insert(entry.target.alias.clone(), entry);
        }
        *hosts = new_map;
        (added, removed)
    }

    pub async fn list_hosts(&self) -> Vec<HostInfo> {
        self.0
            .hosts
            .read()
            .await
            .values()
            .map(HostInfo::from)
            .collect()
    }

    pub async fn is_connected(&self, alias: &str) -> bool {
        self.0
            .hosts
            .read()
            .await
            .get(alias)
            .map(|h| h.state == HostState::Connected)
            .unwrap_or(false)
    }

    pub async fn get_connection(&self, alias: &str) -> Option<Arc<HostConnection>> {
        self.0.connections.read().await.get(alias).cloned()
    }

    /// Contract (§4.5): reject a second concurrent Connect on the same
    /// host by installing a `Connecting` placeholder *before* releasing
    /// the lock and performing the (slow) dial; on failure the placeholder
    /// state is replaced by `Error`.
    pub async fn connect(
        &self,
        alias: &str,
        credential: Option<Arc<dyn CredentialCallback>>,
    ) -> DomainResult<()> {
        {
            let mut hosts = self.0.hosts.write().await;
            let host = hosts
                .get_mut(alias)
                .ok_or_else(|| DomainError::HostNotFound(alias.to_string()))?;
            match host.state {
                HostState::Connected => {
                    return Err(DomainError::AlreadyConnected(alias.to_string()));
                }
                HostState::Connecting | HostState::Reconnecting => {
                    return Err(DomainError::AlreadyConnected(alias.to_string()));
                }
                _ => host.state = HostState::Connecting,
            }
        }

        if let Some(cb) = credential {
            self.0
                .credentials
                .write()
                .await
                .insert(alias.to_string(), cb);
        }

        let target = {
            let hosts = self.0.hosts.read().await;
            hosts
                .get(alias)
                .expect("checked above")
                .target
                .clone()
        };
        let stored_cred = self.0.credentials.read().await.get(alias).cloned();

        match self.0.dialer.connect(&target, stored_cred).await {
            Ok(session) => {
                self.install_connection(alias, session).await;
                Ok(())
            }
            Err(e) => {
                self.set_state(alias, HostState::Error).await;
                self.emit(SshEvent::with_error(
                    SshEventType::Error,
                    alias,
                    e.to_string(),
                ));
                Err(match e.kind() {
                    std::io::ErrorKind::TimedOut => DomainError::CredentialTimeout,
                    std::io::ErrorKind::Interrupted => DomainError::CredentialCancelled,
                    _ => DomainError::AuthenticationFailed(e.to_string()),
                })
            }
        }
    }

    async fn set_state(&self, alias: &str, state: HostState) {
        if let Some(host) = self.0.hosts.write().await.get_mut(alias) {
            host.state = state;
        }
    }

    async fn install_connection(&self, alias: &str, session: Arc<dyn super::client::SshSession>) {
        let conn = Arc::new(HostConnection::new(session));
        self.0
            .connections
            .write()
            .await
            .insert(alias.to_string(), conn.clone());
        self.set_state(alias, HostState::Connected).await;
        if let Some(token) = self.0.reconnect_tokens.write().await.remove(alias) {
            token.cancel();
        }
        self.emit(SshEvent::new(SshEventType::Connected, alias));
        self.spawn_keepalive(alias.to_string(), conn);
    }

    fn spawn_keepalive(&self, alias: String, conn: Arc<HostConnection>) {
        let manager = self.clone();
        let cancel = conn.keepalive_cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = conn.session.keepalive().await {
                            warn!(host = %alias, error = %e, "keep-alive probe failed");
                            // An explicit cancellation racing with the probe
                            // must never be misread as a lost connection.
                            if !cancel.is_cancelled() {
                                manager.handle_disconnect(&alias).await;
                            }
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Explicit, voluntary disconnect.
    pub async fn disconnect(&self, alias: &str) -> DomainResult<()> {
        {
            let hosts = self.0.hosts.read().await;
            let host = hosts
                .get(alias)
                .ok_or_else(|| DomainError::HostNotFound(alias.to_string()))?;
            if !matches!(host.state, HostState::Connected | HostState::Reconnecting) {
                return Err(DomainError::NotConnected(alias.to_string()));
            }
        }

        if let Some(token) = self.0.reconnect_tokens.write().await.remove(alias) {
            token.cancel();
        }
        if let Some(conn) = self.0.connections.write().await.remove(alias) {
            conn.keepalive_cancel.cancel();
            conn.session.disconnect().await;
        }
        self.0.credentials.write().await.remove(alias);
        self.set_state(alias, HostState::Disconnected).await;
        self.emit(SshEvent::new(SshEventType::Disconnected, alias));
        Ok(())
    }

    /// Triggered when the keep-alive probe observes a lost connection.
    /// A second call that finds the host already cancelled/disconnected is
    /// a no-op.
    async fn handle_disconnect(&self, alias: &str) {
        let still_connected = {
            let hosts = self.0.hosts.read().await;
            matches!(hosts.get(alias).map(|h| h.state), Some(HostState::Connected))
        };
        if !still_connected {
            return;
        }

        self.0.connections.write().await.remove(alias);

        let reconnect_enabled = self.0.reconnect_cfg.read().await.enabled;
        if !reconnect_enabled {
            self.set_state(alias, HostState::Disconnected).await;
            self.emit(SshEvent::new(SshEventType::Disconnected, alias));
            return;
        }

        self.set_state(alias, HostState::Reconnecting).await;
        self.emit(SshEvent::new(SshEventType::Reconnecting, alias));

        let token = CancellationToken::new();
        {
            let mut tokens = self.0.reconnect_tokens.write().await;
            if let Some(old) = tokens.insert(alias.to_string(), token.clone()) {
                old.cancel();
            }
        }
        self.spawn_reconnect_loop(alias.to_string(), token);
    }

    fn spawn_reconnect_loop(&self, alias: String, token: CancellationToken) {
        let manager = self.clone();
        tokio::spawn(async move {
            let cfg = manager.0.reconnect_cfg.read().await.clone();
            let mut delay = cfg.initial_delay;
            let mut attempt: u32 = 0;

            loop {
                tokio::select! {
                    () = token.cancelled() => return,
                    () = manager.0.shutdown.cancelled() => return,
                    () = tokio::time::sleep(delay) => {}
                }
                if token.is_cancelled() || manager.0.shutdown.is_cancelled() {
                    return;
                }

                attempt += 1;
                let target = {
                    let hosts = manager.0.hosts.read().await;
                    match hosts.get(&alias) {
                        Some(h) => h.target.clone(),
                        None => return,
                    }
                };
                let credential = manager.0.credentials.read().await.get(&alias).cloned();

                match manager.0.dialer.connect(&target, credential).await {
                    Ok(session) => {
                        manager.install_connection(&alias, session).await;
                        if let Some(conn) = manager.get_connection(&alias).await {
                            conn.session
                                .keepalive()
                                .await
                                .unwrap_or_else(|e| info!(error = %e, "post-reconnect probe"));
                        }
                        return;
                    }
                    Err(e) => {
                        if attempt >= cfg.max_retries {
                            manager.0.reconnect_tokens.write().await.remove(&alias);
                            manager.set_state(&alias, HostState::Error).await;
                            manager.emit(SshEvent::with_error(
                                SshEventType::Error,
                                &alias,
                                e.to_string(),
                            ));
                            return;
                        }
                        delay = std::cmp::min(delay * 2, cfg.max_delay);
                    }
                }
            }
        });
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.0.shutdown.clone()
    }

    /// Disconnects every host and cancels every reconnect loop.
    pub async fn close(&self) {
        self.0.shutdown.cancel();
        let aliases: Vec<String> = self.0.hosts.read().await.keys().cloned().collect();
        for alias in aliases {
            let _ = self.disconnect(&alias).await;
        }
    }

    pub async fn connected_count(&self) -> usize {
        self.0
            .hosts
            .read()
            .await
            .values()
            .filter(|h| h.state == HostState::Connected)
            .count()
    }

    /// Adjusts the catalogue entry's `active_forward_count` by `delta`,
    /// the counter `host.list` actually reports (§4.5). A missing alias
    /// (host removed from the catalogue while a forward it owns is still
    /// tearing down) is a no-op.
    pub async fn adjust_forward_count(&self, alias: &str, delta: i32) {
        if let Some(host) = self.0.hosts.write().await.get_mut(alias) {
            host.active_forward_count = host.active_forward_count.saturating_add_signed(delta);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::client::mock::MockDialer;

    fn target(alias: &str) -> HostTarget {
        HostTarget {
            alias: alias.to_string(),
            hostname: "127.0.0.1".to_string(),
            port: 22,
            user: "user".to_string(),
            identity_file: None,
            proxy_jump: Vec::new(),
        }
    }

    #[tokio::test]
    async fn connect_emits_connected_event_and_marks_host_connected() {
        let dialer = MockDialer::new();
        let (manager, mut events) = HostManager::new(dialer.clone(), ReconnectConfig::default());
        manager.load_hosts(vec![target("server1")]).await;

        manager.connect("server1", None).await.unwrap();

        let ev = events.recv().await.unwrap();
        assert_eq!(ev.kind, SshEventType::Connected);
        assert!(manager.is_connected("server1").await);
        assert!(manager.get_connection("server1").await.is_some());
    }

    #[tokio::test]
    async fn concurrent_connect_dials_exactly_once() {
        let dialer = MockDialer::new();
        let (manager, _events) = HostManager::new(dialer.clone(), ReconnectConfig::default());
        manager.load_hosts(vec![target("server1")]).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let m = manager.clone();
            handles.push(tokio::spawn(async move { m.connect("server1", None).await }));
        }
        let mut ok = 0;
        for h in handles {
            if h.await.unwrap().is_ok() {
                ok += 1;
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(dialer.connects(), 1);
    }

    #[tokio::test]
    async fn disconnect_unknown_host_is_not_connected() {
        let dialer = MockDialer::new();
        let (manager, _events) = HostManager::new(dialer, ReconnectConfig::default());
        manager.load_hosts(vec![target("server1")]).await;
        let err = manager.disconnect("server1").await.unwrap_err();
        assert!(matches!(err, DomainError::NotConnected(_)));
    }

    #[tokio::test]
    async fn reload_preserves_state_for_survivors() {
        let dialer = MockDialer::new();
        let (manager, _events) = HostManager::new(dialer, ReconnectConfig::default());
        manager.load_hosts(vec![target("server1")]).await;
        manager.connect("server1", None).await.unwrap();

        let (added, removed) = manager
            .reload_hosts(vec![target("server1"), target("server2")])
            .await;
        assert_eq!(added, vec!["server2".to_string()]);
        assert!(removed.is_empty());
        assert!(manager.is_connected("server1").await);
    }

    #[tokio::test]
    async fn reload_reports_removed_aliases() {
        let dialer = MockDialer::new();
        let (manager, _events) = HostManager::new(dialer, ReconnectConfig::default());
        manager
            .load_hosts(vec![target("server1"), target("server2")])
            .await;
        let (added, removed) = manager.reload_hosts(vec![target("server1")]).await;
        assert!(added.is_empty());
        assert_eq!(removed, vec!["server2".to_string()]);
    }
}
