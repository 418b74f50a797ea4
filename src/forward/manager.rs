//! Forward session manager (C6): rule store, listener acceptance loops,
//! per-connection bridging (including the SOCKS5 path for `Dynamic`), byte
//! accounting.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::error::{DomainError, DomainResult};
use crate::events::{ForwardEvent, ForwardEventType};
use crate::ssh::{CredentialCallback, ForwardedConnection, HostManager, RemoteListener, SshSession};

use super::rule::{ForwardRule, ForwardType};
use super::session::{ForwardSession, SessionInfo, SessionStatus};
use super::socks5;

const EVENT_CHANNEL_CAPACITY: usize = 16;

/// `forward.list` / `forward.get` snapshot: rule shape plus live session
/// counters, or the synthetic stopped shape when nothing is running.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ForwardInfo {
    pub name: String,
    pub host: String,
    #[serde(rename = "type")]
    pub forward_type: ForwardType,
    pub local_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    pub auto_connect: bool,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<String>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub reconnect_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ForwardInfo {
    fn new(rule: &ForwardRule, session: SessionInfo) -> Self {
        ForwardInfo {
            name: rule.name.clone(),
            host: rule.host.clone(),
            forward_type: rule.forward_type,
            local_port: rule.local_port,
            remote_host: rule.remote_host.clone(),
            remote_port: rule.remote_port,
            auto_connect: rule.auto_connect,
            status: session.status,
            session_id: session.session_id,
            connected_at: session.connected_at,
            bytes_sent: session.bytes_sent,
            bytes_received: session.bytes_received,
            reconnect_count: session.reconnect_count,
            last_error: session.last_error,
        }
    }
}

struct Inner {
    rules: RwLock<Vec<ForwardRule>>,
    sessions: RwLock<HashMap<String, Arc<ForwardSession>>>,
    host_manager: HostManager,
    events_tx: mpsc::Sender<ForwardEvent>,
    name_counter: std::sync::atomic::AtomicU64,
}

#[derive(Clone)]
pub struct ForwardManager(Arc<Inner>);

impl ForwardManager {
    pub fn new(host_manager: HostManager) -> (Self, mpsc::Receiver<ForwardEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Inner {
            rules: RwLock::new(Vec::new()),
            sessions: RwLock::new(HashMap::new()),
            host_manager,
            events_tx: tx,
            name_counter: std::sync::atomic::AtomicU64::new(0),
        };
        (ForwardManager(Arc::new(inner)), rx)
    }

    fn emit(&self, event: ForwardEvent) {
        if self.0.events_tx.try_send(event).is_err() {
            debug!("forward event channel full, dropping event");
        }
    }

    /// Seeds the rule store from persisted config at startup. Invalid
    /// entries were already filtered by the config loader.
    pub async fn load_rules(&self, rules: Vec<ForwardRule>) {
        *self.0.rules.write().await = rules;
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn add_rule(
        &self,
        name: String,
        host: String,
        forward_type: ForwardType,
        local_port: u16,
        remote_host: Option<String>,
        remote_port: Option<u16>,
        auto_connect: bool,
    ) -> DomainResult<String> {
        let mut rules = self.0.rules.write().await;
        if !name.trim().is_empty() && rules.iter().any(|r| r.name == name) {
            return Err(DomainError::RuleAlreadyExists(name));
        }
        if rules.iter().any(|r| r.local_port == local_port) {
            return Err(DomainError::PortConflict(local_port));
        }

        let counter = self.0.name_counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let rule = ForwardRule::new(
            name,
            host,
            forward_type,
            local_port,
            remote_host,
            remote_port,
            auto_connect,
            counter,
        )?;
        let assigned = rule.name.clone();
        rules.push(rule);
        Ok(assigned)
    }

    pub async fn delete_rule(&self, name: &str) -> DomainResult<()> {
        let removed_session = {
            let mut rules = self.0.rules.write().await;
            let idx = rules
                .iter()
                .position(|r| r.name == name)
                .ok_or_else(|| DomainError::RuleNotFound(name.to_string()))?;
            rules.remove(idx);
            let mut sessions = self.0.sessions.write().await;
            sessions.remove(name).inspect(|s| s.cancel.cancel())
        };
        if let Some(session) = removed_session {
            session.set_status(SessionStatus::Stopped);
            self.emit(ForwardEvent::new(
                ForwardEventType::Stopped,
                name,
                session.rule.host.clone(),
            ));
        }
        Ok(())
    }

    async fn find_rule(&self, name: &str) -> DomainResult<ForwardRule> {
        self.0
            .rules
            .read()
            .await
            .iter()
            .find(|r| r.name == name)
            .cloned()
            .ok_or_else(|| DomainError::RuleNotFound(name.to_string()))
    }

    pub async fn start(
        &self,
        name: &str,
        credential: Option<Arc<dyn CredentialCallback>>,
    ) -> DomainResult<()> {
        let rule = self.find_rule(name).await?;
        if self.0.sessions.read().await.contains_key(name) {
            return Err(DomainError::AlreadyConnected(name.to_string()));
        }

        if !self.0.host_manager.is_connected(&rule.host).await {
            self.0.host_manager.connect(&rule.host, credential).await?;
        }
        let conn = self
            .0
            .host_manager
            .get_connection(&rule.host)
            .await
            .ok_or_else(|| DomainError::NotConnected(rule.host.clone()))?;
        let ssh = conn.session.clone();

        let listener = self.bind_listener(&rule, &ssh).await?;

        let session = ForwardSession::new(rule.clone());
        session.set_status(SessionStatus::Active);
        self.0
            .sessions
            .write()
            .await
            .insert(name.to_string(), session.clone());
        self.0.host_manager.adjust_forward_count(&rule.host, 1).await;
        self.emit(ForwardEvent::new(
            ForwardEventType::Started,
            name,
            rule.host.clone(),
        ));

        self.spawn_accept_loop(rule, session, listener, ssh);
        Ok(())
    }

    async fn bind_listener(
        &self,
        rule: &ForwardRule,
        ssh: &Arc<dyn SshSession>,
    ) -> DomainResult<Listener> {
        match rule.forward_type {
            ForwardType::Local | ForwardType::Dynamic => {
                TcpListener::bind(("127.0.0.1", rule.local_port))
                    .await
                    .map(Listener::Accepting)
                    .map_err(|e| map_bind_error(rule.local_port, e))
            }
            ForwardType::Remote => {
                let port = rule.remote_port.unwrap_or(0);
                ssh.open_remote_listener("0.0.0.0", port)
                    .await
                    .map(Listener::Remote)
                    .map_err(|e| DomainError::Internal(e.to_string()))
            }
        }
    }

    fn spawn_accept_loop(
        &self,
        rule: ForwardRule,
        session: Arc<ForwardSession>,
        mut listener: Listener,
        ssh: Arc<dyn SshSession>,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    () = session.cancel.cancelled() => break,
                    result = listener.accept_any() => result,
                };
                match accepted {
                    Ok(accepted) => {
                        let ssh = ssh.clone();
                        let session = session.clone();
                        let forward_type = rule.forward_type;
                        let remote_host = rule.remote_host.clone();
                        let remote_port = rule.remote_port;
                        let local_port = rule.local_port;
                        tokio::spawn(async move {
                            handle_accepted(
                                forward_type,
                                accepted,
                                ssh,
                                session,
                                remote_host,
                                remote_port,
                                local_port,
                            )
                            .await;
                        });
                    }
                    Err(e) => {
                        if session.cancel.is_cancelled() {
                            break;
                        }
                        warn!(name = %rule.name, error = %e, "accept loop ended");
                        break;
                    }
                }
            }
            manager.0.host_manager.adjust_forward_count(&rule.host, -1).await;
            manager.0.sessions.write().await.remove(&rule.name);
        });
    }

    /// Idempotent: stopping an already-stopped rule is a no-op success.
    pub async fn stop(&self, name: &str) -> DomainResult<()> {
        self.find_rule(name).await?;
        if let Some(session) = self.take_session(name).await {
            session.cancel.cancel();
            session.set_status(SessionStatus::Stopped);
            self.emit(ForwardEvent::new(
                ForwardEventType::Stopped,
                name,
                session.rule.host.clone(),
            ));
        }
        Ok(())
    }

    async fn take_session(&self, name: &str) -> Option<Arc<ForwardSession>> {
        self.0.sessions.write().await.remove(name)
    }

    /// Stops every active session; returns the count stopped.
    pub async fn stop_all(&self) -> usize {
        let names: Vec<String> = self.0.sessions.read().await.keys().cloned().collect();
        let mut stopped = 0;
        for name in names {
            if self.stop(&name).await.is_ok() {
                stopped += 1;
            }
        }
        stopped
    }

    pub async fn get_session(&self, name: &str) -> DomainResult<ForwardInfo> {
        let rule = self.find_rule(name).await?;
        let info = match self.0.sessions.read().await.get(name) {
            Some(session) => session.snapshot(),
            None => SessionInfo::stopped(&rule),
        };
        Ok(ForwardInfo::new(&rule, info))
    }

    pub async fn list(&self, host_filter: Option<&str>) -> Vec<ForwardInfo> {
        let rules = self.0.rules.read().await;
        let sessions = self.0.sessions.read().await;
        rules
            .iter()
            .filter(|r| host_filter.map(|h| h == r.host).unwrap_or(true))
            .map(|r| {
                let info = sessions
                    .get(&r.name)
                    .map(|s| s.snapshot())
                    .unwrap_or_else(|| SessionInfo::stopped(r));
                ForwardInfo::new(r, info)
            })
            .collect()
    }

    pub async fn active_count(&self) -> usize {
        self.0.sessions.read().await.len()
    }

    /// Stops every active forward. Safe to call more than once.
    pub async fn close(&self) {
        self.stop_all().await;
    }
}

fn map_bind_error(port: u16, e: io::Error) -> DomainError {
    if e.kind() == io::ErrorKind::AddrInUse {
        DomainError::PortConflict(port)
    } else {
        DomainError::Internal(e.to_string())
    }
}

enum Listener {
    Accepting(TcpListener),
    Remote(Box<dyn RemoteListener>),
}

enum Accepted {
    Tcp(TcpStream),
    Forwarded(ForwardedConnection),
}

impl Listener {
    async fn accept_any(&mut self) -> io::Result<Accepted> {
        match self {
            Listener::Accepting(l) => l.accept().await.map(|(s, _)| Accepted::Tcp(s)),
            Listener::Remote(r) => r.accept().await.map(Accepted::Forwarded),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_accepted(
    forward_type: ForwardType,
    accepted: Accepted,
    ssh: Arc<dyn SshSession>,
    session: Arc<ForwardSession>,
    remote_host: Option<String>,
    remote_port: Option<u16>,
    local_port: u16,
) {
    match forward_type {
        ForwardType::Local => {
            let Accepted::Tcp(local) = accepted else {
                return;
            };
            let target = format!(
                "{}:{}",
                remote_host.unwrap_or_default(),
                remote_port.unwrap_or_default()
            );
            match ssh.dial_through(&target).await {
                Ok(remote) => bridge(session, local, remote).await,
                Err(e) => {
                    session.set_last_error(e.to_string());
                    session.set_status(SessionStatus::Error);
                }
            }
        }
        ForwardType::Remote => {
            let Accepted::Forwarded(fwd) = accepted else {
                return;
            };
            match TcpStream::connect(("127.0.0.1", local_port)).await {
                Ok(local) => bridge(session, local, fwd.stream).await,
                Err(e) => {
                    session.set_last_error(e.to_string());
                    session.set_status(SessionStatus::Error);
                }
            }
        }
        ForwardType::Dynamic => {
            let Accepted::Tcp(mut local) = accepted else {
                return;
            };
            match socks5::negotiate(&mut local).await {
                Ok(Some(addr)) => match ssh.dial_through(&addr).await {
                    Ok(remote) => {
                        if socks5::reply_success(&mut local).await.is_ok() {
                            bridge(session, local, remote).await;
                        }
                    }
                    Err(_) => {
                        let _ = socks5::reply_dial_failure(&mut local).await;
                    }
                },
                Ok(None) => {}
                Err(e) => debug!(error = %e, "socks5 handshake failed"),
            }
        }
    }
}

async fn bridge(
    session: Arc<ForwardSession>,
    mut a: impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    mut b: impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
) {
    match tokio::io::copy_bidirectional(&mut a, &mut b).await {
        Ok((sent, received)) => {
            session.add_sent(sent);
            session.add_received(received);
        }
        Err(e) => debug!(error = %e, "bridge ended"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectConfig;
    use crate::ssh::client::mock::MockDialer;

    fn host_manager() -> HostManager {
        let (hm, _rx) = HostManager::new(MockDialer::new(), ReconnectConfig::default());
        hm
    }

    #[tokio::test]
    async fn add_rejects_duplicate_name() {
        let (fm, _rx) = ForwardManager::new(host_manager());
        fm.add_rule(
            "web".into(),
            "prod".into(),
            ForwardType::Local,
            18080,
            None,
            Some(80),
            false,
        )
        .await
        .unwrap();
        let err = fm
            .add_rule(
                "web".into(),
                "prod".into(),
                ForwardType::Local,
                18081,
                None,
                Some(80),
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::RuleAlreadyExists(_)));
    }

    #[tokio::test]
    async fn add_rejects_port_conflict() {
        let (fm, _rx) = ForwardManager::new(host_manager());
        fm.add_rule(
            "web".into(),
            "prod".into(),
            ForwardType::Local,
            18080,
            None,
            Some(80),
            false,
        )
        .await
        .unwrap();
        let err = fm
            .add_rule(
                "web2".into(),
                "prod".into(),
                ForwardType::Local,
                18080,
                None,
                Some(81),
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::PortConflict(18080)));
    }

    #[tokio::test]
    async fn stop_on_unstarted_rule_is_a_noop() {
        let (fm, _rx) = ForwardManager::new(host_manager());
        fm.add_rule(
            "web".into(),
            "prod".into(),
            ForwardType::Local,
            18082,
            None,
            Some(80),
            false,
        )
        .await
        .unwrap();
        assert!(fm.stop("web").await.is_ok());
    }

    #[tokio::test]
    async fn delete_unknown_rule_fails() {
        let (fm, _rx) = ForwardManager::new(host_manager());
        let err = fm.delete_rule("nope").await.unwrap_err();
        assert!(matches!(err, DomainError::RuleNotFound(_)));
    }

    #[tokio::test]
    async fn list_reports_synthetic_stopped_entry() {
        let (fm, _rx) = ForwardManager::new(host_manager());
        fm.add_rule(
            "web".into(),
            "prod".into(),
            ForwardType::Local,
            18083,
            None,
            Some(80),
            false,
        )
        .await
        .unwrap();
        let all = fm.list(None).await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, SessionStatus::Stopped);
    }
}
