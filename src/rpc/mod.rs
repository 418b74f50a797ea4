//! The control-plane RPC stack: wire server (C2), client (C3), and the
//! per-category event broker (C4).

pub mod broker;
pub mod client;
pub mod server;

pub use broker::EventBroker;
pub use client::{ClientError, CredentialHandler, RpcClient};
pub use server::{ClientLifecycle, Dispatcher, RpcServer};
