//! Method router (C8): a flat dispatch table keyed by method name.
//!
//! Per Design Note §9, domain errors are mapped to application codes by a
//! direct `DomainError::rpc_code()` lookup rather than substring
//! inspection of the human message.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use moleport_protocol::{ErrorCode, RpcErrorObject};

use crate::config::{Config, RawConfigUpdate};
use crate::error::DomainError;
use crate::forward::{ForwardManager, ForwardType};
use crate::rpc::{EventBroker, RpcServer};
use crate::ssh::{CredentialAnswer, DaemonCredentialCallback, HostManager, HostTarget, NotificationSink, PendingCredentials};

/// Parsing the user's SSH client config into a host catalogue is an
/// external collaborator's job (§1 Non-goals); this seam is what
/// `host.reload` asks for a fresh read.
#[async_trait]
pub trait HostCatalogueSource: Send + Sync {
    async fn load(&self) -> Vec<HostTarget>;
}

/// Persisting the rule set back to `config.yaml` is likewise external;
/// the router calls this as non-blocking best effort after any mutation
/// (§4.8, §7).
#[async_trait]
pub trait ConfigPersist: Send + Sync {
    async fn persist(&self, rules: Vec<crate::forward::ForwardRule>);
}

fn err(code: ErrorCode, message: impl Into<String>) -> RpcErrorObject {
    code.into_error(message)
}

fn invalid_params(message: impl Into<String>) -> RpcErrorObject {
    err(ErrorCode::InvalidParams, message)
}

fn domain_err(e: DomainError) -> RpcErrorObject {
    let code = e.rpc_code();
    err(code, e.to_string())
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T, RpcErrorObject> {
    let value = params.unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| invalid_params(e.to_string()))
}

pub struct Router {
    hosts: HostManager,
    forwards: ForwardManager,
    broker: EventBroker,
    server: Arc<RpcServer>,
    pending_credentials: Arc<PendingCredentials>,
    catalogue_source: Arc<dyn HostCatalogueSource>,
    config_persist: Arc<dyn ConfigPersist>,
    config: tokio::sync::RwLock<Config>,
    started_at: DateTime<Utc>,
    shutdown: CancellationToken,
    purge_state: Arc<AtomicBool>,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hosts: HostManager,
        forwards: ForwardManager,
        broker: EventBroker,
        server: Arc<RpcServer>,
        pending_credentials: Arc<PendingCredentials>,
        catalogue_source: Arc<dyn HostCatalogueSource>,
        config_persist: Arc<dyn ConfigPersist>,
        config: Config,
        shutdown: CancellationToken,
    ) -> Self {
        Router {
            hosts,
            forwards,
            broker,
            server,
            pending_credentials,
            catalogue_source,
            config_persist,
            config: tokio::sync::RwLock::new(config),
            started_at: Utc::now(),
            shutdown,
            purge_state: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn purge_requested(&self) -> bool {
        self.purge_state.load(Ordering::SeqCst)
    }

    async fn persist_rules(&self) {
        let rules = self.forwards.list(None).await;
        let rules: Vec<crate::forward::ForwardRule> = rules
            .into_iter()
            .map(|f| crate::forward::ForwardRule {
                name: f.name,
                host: f.host,
                forward_type: f.forward_type,
                local_port: f.local_port,
                remote_host: f.remote_host,
                remote_port: f.remote_port,
                auto_connect: f.auto_connect,
            })
            .collect();
        let persist = self.config_persist.clone();
        tokio::spawn(async move { persist.persist(rules).await });
    }

    fn credential_callback(
        &self,
        client_id: &str,
        host: &str,
    ) -> Arc<DaemonCredentialCallback> {
        Arc::new(DaemonCredentialCallback::new(
            client_id.to_string(),
            host.to_string(),
            self.pending_credentials.clone(),
            self.server.clone() as Arc<dyn NotificationSink>,
            self.shutdown.clone(),
        ))
    }

    async fn dispatch_inner(
        &self,
        client_id: &str,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, RpcErrorObject> {
        match method {
            "host.list" => {
                let hosts = self.hosts.list_hosts().await;
                Ok(json!({ "hosts": hosts }))
            }
            "host.reload" => {
                let targets = self.catalogue_source.load().await;
                let (added, removed) = self.hosts.reload_hosts(targets).await;
                let total = self.hosts.list_hosts().await.len();
                Ok(json!({ "total": total, "added": added, "removed": removed }))
            }
            "ssh.connect" => {
                #[derive(Deserialize)]
                struct Params {
                    host: String,
                }
                let p: Params = parse_params(params)?;
                let cb = self.credential_callback(client_id, &p.host);
                self.hosts
                    .connect(&p.host, Some(cb))
                    .await
                    .map_err(domain_err)?;
                Ok(json!({ "host": p.host, "status": "connected" }))
            }
            "ssh.disconnect" => {
                #[derive(Deserialize)]
                struct Params {
                    host: String,
                }
                let p: Params = parse_params(params)?;
                self.hosts.disconnect(&p.host).await.map_err(domain_err)?;
                Ok(json!({ "host": p.host, "status": "disconnected" }))
            }
            "forward.list" => {
                #[derive(Deserialize, Default)]
                struct Params {
                    host: Option<String>,
                }
                let p: Params = parse_params(params)?;
                let forwards = self.forwards.list(p.host.as_deref()).await;
                Ok(json!({ "forwards": forwards }))
            }
            "forward.add" => {
                #[derive(Deserialize)]
                struct Params {
                    #[serde(default)]
                    name: String,
                    host: String,
                    #[serde(rename = "type")]
                    kind: String,
                    local_port: u16,
                    remote_host: Option<String>,
                    remote_port: Option<u16>,
                    #[serde(default)]
                    auto_connect: bool,
                }
                let p: Params = parse_params(params)?;
                let forward_type: ForwardType = p
                    .kind
                    .parse()
                    .map_err(|()| invalid_params(format!("unknown forward type: {}", p.kind)))?;
                let name = self
                    .forwards
                    .add_rule(
                        p.name,
                        p.host,
                        forward_type,
                        p.local_port,
                        p.remote_host,
                        p.remote_port,
                        p.auto_connect,
                    )
                    .await
                    .map_err(domain_err)?;
                self.persist_rules().await;
                Ok(json!({ "name": name }))
            }
            "forward.delete" => {
                #[derive(Deserialize)]
                struct Params {
                    name: String,
                }
                let p: Params = parse_params(params)?;
                self.forwards.delete_rule(&p.name).await.map_err(domain_err)?;
                self.persist_rules().await;
                Ok(json!({ "ok": true }))
            }
            "forward.start" => {
                #[derive(Deserialize)]
                struct Params {
                    name: String,
                }
                let p: Params = parse_params(params)?;
                self.forwards.start(&p.name, None).await.map_err(domain_err)?;
                Ok(json!({ "name": p.name, "status": "active" }))
            }
            "forward.stop" => {
                #[derive(Deserialize)]
                struct Params {
                    name: String,
                }
                let p: Params = parse_params(params)?;
                self.forwards.stop(&p.name).await.map_err(domain_err)?;
                Ok(json!({ "name": p.name, "status": "stopped" }))
            }
            "forward.stopAll" => {
                let stopped = self.forwards.stop_all().await;
                Ok(json!({ "stopped": stopped }))
            }
            "session.list" => {
                let sessions = self.forwards.list(None).await;
                Ok(json!({ "sessions": sessions }))
            }
            "session.get" => {
                #[derive(Deserialize)]
                struct Params {
                    name: String,
                }
                let p: Params = parse_params(params)?;
                let info = self.forwards.get_session(&p.name).await.map_err(domain_err)?;
                Ok(serde_json::to_value(info).unwrap_or(Value::Null))
            }
            "config.get" => {
                let config = self.config.read().await;
                Ok(serde_json::to_value(&*config).unwrap_or(Value::Null))
            }
            "config.update" => {
                let raw: RawConfigUpdate = parse_params(params)?;
                let mut config = self.config.write().await;
                *config = config.merge(raw.into());
                Ok(serde_json::to_value(&*config).unwrap_or(Value::Null))
            }
            "daemon.status" => {
                let uptime = (Utc::now() - self.started_at).num_seconds().max(0);
                Ok(json!({
                    "pid": std::process::id(),
                    "started_at": self.started_at.to_rfc3339(),
                    "uptime_seconds": uptime,
                    "connected_clients": self.server.client_count().await,
                    "active_ssh_connections": self.hosts.connected_count().await,
                    "active_forwards": self.forwards.active_count().await,
                }))
            }
            "daemon.shutdown" => {
                #[derive(Deserialize, Default)]
                struct Params {
                    #[serde(default)]
                    purge: bool,
                }
                let p: Params = parse_params(params)?;
                self.purge_state.store(p.purge, Ordering::SeqCst);
                self.shutdown.cancel();
                Ok(json!({ "ok": true }))
            }
            "events.subscribe" => {
                #[derive(Deserialize)]
                struct Params {
                    types: Vec<String>,
                }
                let p: Params = parse_params(params)?;
                let sub_id = self
                    .broker
                    .subscribe(client_id, p.types)
                    .await
                    .map_err(domain_err)?;
                Ok(json!({ "subscription_id": sub_id }))
            }
            "events.unsubscribe" => {
                #[derive(Deserialize)]
                struct Params {
                    subscription_id: String,
                }
                let p: Params = parse_params(params)?;
                self.broker
                    .unsubscribe(&p.subscription_id)
                    .await
                    .map_err(domain_err)?;
                Ok(json!({ "ok": true }))
            }
            "credential.response" => {
                #[derive(Deserialize)]
                struct Params {
                    request_id: String,
                    value: Option<String>,
                    answers: Option<Vec<String>>,
                    #[serde(default)]
                    cancelled: bool,
                }
                let p: Params = parse_params(params)?;
                let answer = if p.cancelled {
                    CredentialAnswer::Cancelled
                } else if let Some(v) = p.value {
                    CredentialAnswer::Value(v)
                } else if let Some(a) = p.answers {
                    CredentialAnswer::Answers(a)
                } else {
                    CredentialAnswer::Cancelled
                };
                self.pending_credentials.resolve(&p.request_id, answer).await;
                Ok(json!({ "ok": true }))
            }
            _ => Err(err(ErrorCode::MethodNotFound, format!("unknown method: {method}"))),
        }
    }
}

#[async_trait]
impl crate::rpc::Dispatcher for Router {
    async fn dispatch(
        &self,
        client_id: &str,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, RpcErrorObject> {
        debug!(client = %client_id, method, "dispatching rpc call");
        let result = self.dispatch_inner(client_id, method, params).await;
        if let Err(e) = &result {
            warn!(client = %client_id, method, code = e.code, "rpc call failed");
        }
        result
    }
}

#[async_trait]
impl crate::rpc::ClientLifecycle for Router {
    async fn on_connect(&self, _client_id: &str) {}

    async fn on_disconnect(&self, client_id: &str) {
        self.broker.remove_client(client_id).await;
    }
}
