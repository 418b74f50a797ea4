//! `ForwardSession`: the runtime counterpart of a rule while it runs (§3).
//!
//! Byte counters are atomics, read/written without the manager's lock, the
//! same pattern the teacher uses for `CONNECTION_COUNT`
//! (`src/workers/client_connector.rs`) and the receiver's `AtomicU64`
//! attempt/streak counters (`services/receiver/src/control_api.rs`).

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::rule::ForwardRule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Stopped,
    Starting,
    Active,
    Reconnecting,
    Error,
}

/// Shared, clonable handle to a live session's counters and status so
/// bridge/accept tasks can update it without holding the manager's lock.
pub struct ForwardSession {
    pub rule: ForwardRule,
    pub session_id: String,
    pub status: std::sync::RwLock<SessionStatus>,
    pub started_at: DateTime<Utc>,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub reconnect_count: AtomicU64,
    pub last_error: std::sync::RwLock<Option<String>>,
    pub cancel: CancellationToken,
}

impl ForwardSession {
    pub fn new(rule: ForwardRule) -> Arc<Self> {
        let session_id = format!(
            "{}-{}",
            rule.name,
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
        );
        Arc::new(ForwardSession {
            rule,
            session_id,
            status: std::sync::RwLock::new(SessionStatus::Starting),
            started_at: Utc::now(),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            reconnect_count: AtomicU64::new(0),
            last_error: std::sync::RwLock::new(None),
            cancel: CancellationToken::new(),
        })
    }

    pub fn set_status(&self, status: SessionStatus) {
        *self.status.write().unwrap() = status;
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.read().unwrap()
    }

    pub fn set_last_error(&self, err: impl Into<String>) {
        *self.last_error.write().unwrap() = Some(err.into());
    }

    pub fn add_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SessionInfo {
        SessionInfo {
            name: self.rule.name.clone(),
            host: self.rule.host.clone(),
            session_id: Some(self.session_id.clone()),
            status: self.status(),
            connected_at: Some(self.started_at.to_rfc3339()),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            reconnect_count: self.reconnect_count.load(Ordering::Relaxed),
            last_error: self.last_error.read().unwrap().clone(),
        }
    }
}

/// Value snapshot handed out across component boundaries; never an
/// internal pointer.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionInfo {
    pub name: String,
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<String>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub reconnect_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SessionInfo {
    /// Synthetic snapshot for a rule without an active session.
    pub fn stopped(rule: &ForwardRule) -> Self {
        SessionInfo {
            name: rule.name.clone(),
            host: rule.host.clone(),
            session_id: None,
            status: SessionStatus::Stopped,
            connected_at: None,
            bytes_sent: 0,
            bytes_received: 0,
            reconnect_count: 0,
            last_error: None,
        }
    }
}
