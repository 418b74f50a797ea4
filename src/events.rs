//! Domain event types emitted by C5 (SSH host manager) and C6 (forward
//! session manager), consumed by C4 (the event broker) and translated into
//! `event.ssh` / `event.forward` notifications.

use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SshEventType {
    Connected,
    Disconnected,
    Reconnecting,
    Error,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SshEvent {
    #[serde(rename = "type")]
    pub kind: SshEventType,
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SshEvent {
    pub fn new(kind: SshEventType, host: impl Into<String>) -> Self {
        SshEvent {
            kind,
            host: host.into(),
            error: None,
        }
    }

    pub fn with_error(kind: SshEventType, host: impl Into<String>, error: impl Into<String>) -> Self {
        SshEvent {
            kind,
            host: host.into(),
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ForwardEventType {
    Started,
    Stopped,
    Reconnecting,
    Error,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ForwardEvent {
    #[serde(rename = "type")]
    pub kind: ForwardEventType,
    pub name: String,
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ForwardEvent {
    pub fn new(kind: ForwardEventType, name: impl Into<String>, host: impl Into<String>) -> Self {
        ForwardEvent {
            kind,
            name: name.into(),
            host: host.into(),
            error: None,
        }
    }

    pub fn with_error(
        kind: ForwardEventType,
        name: impl Into<String>,
        host: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        ForwardEvent {
            kind,
            name: name.into(),
            host: host.into(),
            error: Some(error.into()),
        }
    }
}

/// Tagged union of everything the broker (C4) fans out, keyed by category
/// for subscription filtering.
#[derive(Debug, Clone)]
pub enum DomainEvent {
    Ssh(SshEvent),
    Forward(ForwardEvent),
}

impl DomainEvent {
    pub fn category(&self) -> &'static str {
        match self {
            DomainEvent::Ssh(_) => "ssh",
            DomainEvent::Forward(_) => "forward",
        }
    }
}
