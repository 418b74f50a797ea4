//! SSH host connection management (C5) and its supporting pieces: the
//! capability interface (C7's dialer/session seam), the credential
//! round-trip (C7), and the per-host state machine.

pub mod client;
pub mod credential;
pub mod host;
pub mod manager;

pub use client::{
    CredentialAnswer, CredentialCallback, CredentialKind, CredentialPrompt, ForwardedConnection,
    HostTarget, RemoteListener, SshDialer, SshSession,
};
pub use credential::{DaemonCredentialCallback, NotificationSink, PendingCredentials};
pub use host::{Host, HostConnection, HostInfo, HostState};
pub use manager::HostManager;
