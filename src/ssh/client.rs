//! The SSH wire protocol itself is out of scope (Non-goal: "an existing
//! client library is assumed"). This module defines the small capability
//! interface (Design Note §9) the rest of the crate programs against, and
//! a `russh`-backed implementation of it. `russh` is the real crate the
//! `warp-tech-warpgate` / `chipsenkbeil-distant` manifests in this corpus
//! reach for the same job.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

/// A duplex byte stream, boxed so callers don't need to know whether it
/// rides a raw TCP socket or an SSH channel.
pub trait AsyncDuplex: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncDuplex for T {}
pub type BoxedDuplex = Pin<Box<dyn AsyncDuplex>>;

/// One remotely-initiated connection accepted on a server-side forwarded
/// listener (`tcpip-forward`).
pub struct ForwardedConnection {
    pub stream: BoxedDuplex,
    pub peer: SocketAddr,
}

/// Handle to a listener opened on the remote SSH server via `tcpip-forward`,
/// yielding connections as the remote side accepts them.
#[async_trait]
pub trait RemoteListener: Send + Sync {
    async fn accept(&mut self) -> io::Result<ForwardedConnection>;
    fn bound_port(&self) -> u16;
}

/// A single authenticated SSH session. Exclusively owned by `HostConnection`
/// (C5); never shared outside it except through value snapshots.
#[async_trait]
pub trait SshSession: Send + Sync {
    /// Open a direct-tcpip channel to `addr` ("host:port") through the SSH
    /// session -- used by Local forwards and the SOCKS5 dynamic handler.
    async fn dial_through(&self, addr: &str) -> io::Result<BoxedDuplex>;

    /// Ask the remote server to bind a listener on `bind_addr:port` and
    /// forward accepted connections back to us -- used by Remote forwards.
    async fn open_remote_listener(
        &self,
        bind_addr: &str,
        port: u16,
    ) -> io::Result<Box<dyn RemoteListener>>;

    /// Protocol-level liveness probe (global keepalive request). An error
    /// return means the connection is presumed dead.
    async fn keepalive(&self) -> io::Result<()>;

    /// Best-effort graceful close.
    async fn disconnect(&self);
}

/// What the auth layer asks the interactive client for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    Password,
    Passphrase,
    KeyboardInteractive,
}

/// One round of a keyboard-interactive exchange, or the single prompt for
/// password/passphrase auth.
#[derive(Debug, Clone)]
pub struct CredentialPrompt {
    pub kind: CredentialKind,
    pub prompt: String,
    pub sub_prompts: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum CredentialAnswer {
    Value(String),
    Answers(Vec<String>),
    /// Explicit client cancel, daemon shutdown, or a reply channel that
    /// was dropped without an answer.
    Cancelled,
    /// The round-trip's own internal deadline (`CREDENTIAL_TIMEOUT`)
    /// elapsed with no reply.
    TimedOut,
}

/// Invoked by the dial path when the SSH auth layer needs interactive
/// input. `None` means agent + keyfiles only (e.g. a local library caller
/// with no attached interactive client); C7 supplies `Some` from the
/// daemon.
#[async_trait]
pub trait CredentialCallback: Send + Sync {
    async fn request(&self, prompt: CredentialPrompt) -> CredentialAnswer;
}

#[derive(Debug, Clone)]
pub struct HostTarget {
    pub alias: String,
    pub hostname: String,
    pub port: u16,
    pub user: String,
    pub identity_file: Option<String>,
    pub proxy_jump: Vec<String>,
}

/// Dials and authenticates a fresh SSH session. Implemented once for real
/// connections (via `russh`) and once as a fully in-memory mock for tests.
#[async_trait]
pub trait SshDialer: Send + Sync {
    async fn connect(
        &self,
        target: &HostTarget,
        credential: Option<std::sync::Arc<dyn CredentialCallback>>,
    ) -> io::Result<std::sync::Arc<dyn SshSession>>;
}

pub mod russh_dialer {
    //! `russh`-backed `SshDialer`. `russh::client::Handler` is where
    //! server-initiated `forwarded-tcpip` channel opens land; we funnel
    //! those into an mpsc channel that `RusshRemoteListener::accept`
    //! drains, rather than exposing `russh` types outside this module.
    use super::*;
    use russh::client::{self, Msg};
    use russh::{ChannelMsg, Disconnect};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct Handler {
        forwarded_tx: mpsc::Sender<(russh::Channel<Msg>, SocketAddr)>,
    }

    #[async_trait]
    impl client::Handler for Handler {
        type Error = russh::Error;

        async fn check_server_key(
            &mut self,
            _server_public_key: &russh::keys::PublicKey,
        ) -> Result<bool, Self::Error> {
            // Host-key verification policy (known_hosts) is an external
            // collaborator's concern in this design; accept provisionally.
            Ok(true)
        }

        async fn server_channel_open_forwarded_tcpip(
            &mut self,
            channel: russh::Channel<Msg>,
            connected_address: &str,
            connected_port: u32,
            _originator_address: &str,
            _originator_port: u32,
            _session: &mut client::Session,
        ) -> Result<(), Self::Error> {
            if let Ok(ip) = connected_address.parse() {
                let addr = SocketAddr::new(ip, connected_port as u16);
                let _ = self.forwarded_tx.send((channel, addr)).await;
            }
            Ok(())
        }
    }

    pub struct RusshSession {
        handle: client::Handle<Handler>,
        /// Taken by the first `open_remote_listener` call and handed to its
        /// `RusshRemoteListener`; a second concurrent Remote forward on the
        /// same connection is rejected rather than racing two listeners
        /// over one channel (see `open_remote_listener`).
        forwarded_rx: tokio::sync::Mutex<Option<mpsc::Receiver<(russh::Channel<Msg>, SocketAddr)>>>,
    }

    #[async_trait]
    impl SshSession for RusshSession {
        async fn dial_through(&self, addr: &str) -> io::Result<BoxedDuplex> {
            let (host, port) = addr
                .rsplit_once(':')
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "missing port"))?;
            let port: u16 = port
                .parse()
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad port"))?;
            let channel = self
                .handle
                .channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
                .await
                .map_err(|e| io::Error::other(e.to_string()))?;
            Ok(Box::pin(channel.into_stream()))
        }

        async fn open_remote_listener(
            &self,
            bind_addr: &str,
            port: u16,
        ) -> io::Result<Box<dyn RemoteListener>> {
            let rx = self
                .forwarded_rx
                .lock()
                .await
                .take()
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        "a remote forward is already active on this connection",
                    )
                })?;
            self.handle
                .tcpip_forward(bind_addr, port as u32)
                .await
                .map_err(|e| io::Error::other(e.to_string()))?;
            Ok(Box::new(RusshRemoteListener {
                port,
                forwarded_rx: tokio::sync::Mutex::new(rx),
            }))
        }

        async fn keepalive(&self) -> io::Result<()> {
            self.handle
                .send_keepalive(true)
                .await
                .map_err(|e| io::Error::other(e.to_string()))
        }

        async fn disconnect(&self) {
            let _ = self
                .handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await;
        }
    }

    pub struct RusshRemoteListener {
        port: u16,
        forwarded_rx: tokio::sync::Mutex<mpsc::Receiver<(russh::Channel<Msg>, SocketAddr)>>,
    }

    #[async_trait]
    impl RemoteListener for RusshRemoteListener {
        async fn accept(&mut self) -> io::Result<ForwardedConnection> {
            // Connections are funneled through the session's Handler
            // (`server_channel_open_forwarded_tcpip`) into the channel this
            // listener took ownership of in `open_remote_listener`.
            let mut rx = self.forwarded_rx.lock().await;
            match rx.recv().await {
                Some((channel, peer)) => Ok(ForwardedConnection {
                    stream: Box::pin(channel.into_stream()),
                    peer,
                }),
                None => Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "ssh session closed",
                )),
            }
        }

        fn bound_port(&self) -> u16 {
            self.port
        }
    }

    pub struct RusshDialer;

    #[async_trait]
    impl SshDialer for RusshDialer {
        async fn connect(
            &self,
            target: &HostTarget,
            credential: Option<Arc<dyn CredentialCallback>>,
        ) -> io::Result<Arc<dyn SshSession>> {
            let config = Arc::new(client::Config::default());
            let (forwarded_tx, forwarded_rx) = mpsc::channel(16);
            let handler = Handler { forwarded_tx };
            let mut handle = client::connect(
                config,
                (target.hostname.as_str(), target.port),
                handler,
            )
            .await
            .map_err(|e| io::Error::other(e.to_string()))?;

            if !authenticate(&mut handle, target, credential).await? {
                return Err(io::Error::other("authentication failed"));
            }

            Ok(Arc::new(RusshSession {
                handle,
                forwarded_rx: tokio::sync::Mutex::new(Some(forwarded_rx)),
            }))
        }
    }

    async fn authenticate(
        handle: &mut client::Handle<Handler>,
        target: &HostTarget,
        credential: Option<Arc<dyn CredentialCallback>>,
    ) -> io::Result<bool> {
        // Agent and on-disk keyfiles are tried first regardless of whether
        // an interactive callback is attached.
        if let Some(identity) = &target.identity_file {
            if let Ok(key) = russh::keys::load_secret_key(identity, None) {
                let key = russh::keys::PrivateKeyWithHashAlg::new(Arc::new(key), None);
                if let Ok(result) = handle.authenticate_publickey(&target.user, key).await {
                    if result.success() {
                        return Ok(true);
                    }
                }
            }
        }

        let Some(credential) = credential else {
            return Ok(false);
        };

        let answer = credential
            .request(CredentialPrompt {
                kind: CredentialKind::Password,
                prompt: format!("Password for {}@{}", target.user, target.alias),
                sub_prompts: Vec::new(),
            })
            .await;

        match answer {
            CredentialAnswer::Value(password) => handle
                .authenticate_password(&target.user, password)
                .await
                .map(|r| r.success())
                .map_err(|e| io::Error::other(e.to_string())),
            CredentialAnswer::TimedOut => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "credential request timed out",
            )),
            CredentialAnswer::Cancelled => Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "credential request cancelled",
            )),
            CredentialAnswer::Answers(_) => Ok(false),
        }
    }
}

/// A fully in-memory `SshDialer`/`SshSession` used by tests and by local
/// library callers that want to exercise the host/forward managers without
/// a real SSH server. "Dialing through the session" here just dials the
/// target directly -- there is no tunnel to simulate.
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::net::{TcpListener, TcpStream};

    pub struct MockSshSession {
        pub alive: Arc<AtomicBool>,
    }

    impl MockSshSession {
        pub fn new() -> Arc<Self> {
            Arc::new(MockSshSession {
                alive: Arc::new(AtomicBool::new(true)),
            })
        }

        pub fn kill(&self) {
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl SshSession for MockSshSession {
        async fn dial_through(&self, addr: &str) -> io::Result<BoxedDuplex> {
            let stream = TcpStream::connect(addr).await?;
            Ok(Box::pin(stream))
        }

        async fn open_remote_listener(
            &self,
            bind_addr: &str,
            port: u16,
        ) -> io::Result<Box<dyn RemoteListener>> {
            let listener = TcpListener::bind((bind_addr, port)).await?;
            let bound_port = listener.local_addr()?.port();
            Ok(Box::new(MockRemoteListener {
                listener,
                bound_port,
            }))
        }

        async fn keepalive(&self) -> io::Result<()> {
            if self.alive.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(io::Error::other("mock session closed"))
            }
        }

        async fn disconnect(&self) {
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    pub struct MockRemoteListener {
        listener: TcpListener,
        bound_port: u16,
    }

    #[async_trait]
    impl RemoteListener for MockRemoteListener {
        async fn accept(&mut self) -> io::Result<ForwardedConnection> {
            let (stream, peer) = self.listener.accept().await?;
            Ok(ForwardedConnection {
                stream: Box::pin(stream),
                peer,
            })
        }

        fn bound_port(&self) -> u16 {
            self.bound_port
        }
    }

    /// A dialer whose `connect` either always succeeds with a fresh
    /// `MockSshSession`, or always fails, controlled by test setup.
    pub struct MockDialer {
        pub should_fail: AtomicBool,
        pub connect_count: std::sync::atomic::AtomicU64,
    }

    impl MockDialer {
        pub fn new() -> Arc<Self> {
            Arc::new(MockDialer {
                should_fail: AtomicBool::new(false),
                connect_count: std::sync::atomic::AtomicU64::new(0),
            })
        }

        pub fn set_should_fail(&self, fail: bool) {
            self.should_fail.store(fail, Ordering::SeqCst);
        }

        pub fn connects(&self) -> u64 {
            self.connect_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SshDialer for MockDialer {
        async fn connect(
            &self,
            _target: &HostTarget,
            _credential: Option<Arc<dyn CredentialCallback>>,
        ) -> io::Result<Arc<dyn SshSession>> {
            self.connect_count.fetch_add(1, Ordering::SeqCst);
            if self.should_fail.load(Ordering::SeqCst) {
                Err(io::Error::other("mock dial failure"))
            } else {
                Ok(MockSshSession::new())
            }
        }
    }
}
