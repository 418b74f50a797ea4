//! `Host` and `HostConnection` (§3) and the state table (§4.5).

use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::client::{HostTarget, SshSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    PendingAuth,
    Error,
}

/// Static catalogue entry, keyed uniquely by `alias`.
#[derive(Debug, Clone)]
pub struct Host {
    pub target: HostTarget,
    pub state: HostState,
    pub active_forward_count: u32,
}

impl Host {
    pub fn new(target: HostTarget) -> Self {
        Host {
            target,
            state: HostState::Disconnected,
            active_forward_count: 0,
        }
    }
}

/// Value snapshot handed out by C5; never an internal pointer.
#[derive(Debug, Clone, Serialize)]
pub struct HostInfo {
    pub name: String,
    pub hostname: String,
    pub port: u16,
    pub user: String,
    pub state: HostState,
    pub active_forward_count: u32,
}

impl From<&Host> for HostInfo {
    fn from(h: &Host) -> Self {
        HostInfo {
            name: h.target.alias.clone(),
            hostname: h.target.hostname.clone(),
            port: h.target.port,
            user: h.target.user.clone(),
            state: h.state,
            active_forward_count: h.active_forward_count,
        }
    }
}

/// Internal, owned exclusively by the host manager (C5). Holds the live
/// SSH session handle and a cancellation handle for the keep-alive task.
/// The forward count it used to track itself now lives solely on the
/// catalogue `Host` entry (`HostManager::adjust_forward_count`), so
/// `host.list` and the live connection never disagree.
pub struct HostConnection {
    pub session: Arc<dyn SshSession>,
    pub keepalive_cancel: CancellationToken,
    pub reconnect_cancel: CancellationToken,
}

impl HostConnection {
    pub fn new(session: Arc<dyn SshSession>) -> Self {
        HostConnection {
            session,
            keepalive_cancel: CancellationToken::new(),
            reconnect_cancel: CancellationToken::new(),
        }
    }
}
