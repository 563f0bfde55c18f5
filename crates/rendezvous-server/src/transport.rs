//! Listener and HTTP surface.
//!
//! [`RelayListener`] accepts TCP connections, wraps them in TLS when
//! configured and hands them to `axum::serve`. TLS handshakes run on their
//! own tasks under a timeout, so a stalled client never holds up the accept
//! loop. The router built in `connection` answers the health path and
//! upgrades every other request to WebSocket.
//!
//! # Security
//!
//! Self-signed certificates (generated when the configured PEM files are
//! missing) are only suitable for local testing. Production deployments MUST
//! use certificates from a trusted CA.

use std::{future, io, net::SocketAddr, time::Duration};

use axum::{
    extract::{ConnectInfo, connect_info::Connected},
    serve::{IncomingStream, Listener},
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_rustls::TlsAcceptor;

use crate::{error::ServerError, tls::TlsSettings};

/// Body of the health-check response.
pub const HEALTH_BODY: &str = "OK\n";

/// Connections ready to serve but not yet picked up by the server.
const ACCEPT_BACKLOG: usize = 64;

/// Pause after a failed `accept` (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Byte stream a connection is served over, plain or TLS.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

/// Type-erased [`Io`].
pub type BoxedIo = Box<dyn Io>;

/// TCP listener with optional TLS, served by `axum::serve`.
pub struct RelayListener {
    local_addr: SocketAddr,
    accepted: mpsc::Receiver<(BoxedIo, SocketAddr)>,
    accept_task: JoinHandle<()>,
}

impl RelayListener {
    /// Bind the listener and start accepting.
    ///
    /// With `tls` set, each connection completes a TLS handshake within
    /// `handshake_timeout` before it is served.
    pub async fn bind(
        address: &str,
        tls: Option<&TlsSettings>,
        handshake_timeout: Duration,
    ) -> Result<Self, ServerError> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| ServerError::Config(format!("invalid bind address '{address}': {e}")))?;

        let tls = tls.map(|settings| settings.server_config().map(TlsAcceptor::from)).transpose()?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Transport(format!("failed to bind {addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::Transport(format!("failed to get local address: {e}")))?;

        tracing::info!(%local_addr, tls = tls.is_some(), "Listener bound");

        let (tx, accepted) = mpsc::channel(ACCEPT_BACKLOG);
        let accept_task = tokio::spawn(accept_loop(listener, tls, handshake_timeout, tx));

        Ok(Self { local_addr, accepted, accept_task })
    }

    /// Local address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Peer address of a connection accepted by [`RelayListener`], exposed to
/// handlers through `ConnectInfo`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RemoteAddr(pub(crate) SocketAddr);

impl Connected<IncomingStream<'_, RelayListener>> for RemoteAddr {
    fn connect_info(stream: IncomingStream<'_, RelayListener>) -> Self {
        Self(*stream.remote_addr())
    }
}

impl Drop for RelayListener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl Listener for RelayListener {
    type Io = BoxedIo;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        if let Some(accepted) = self.accepted.recv().await {
            return accepted;
        }
        tracing::error!("Accept loop stopped");
        future::pending().await
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

async fn accept_loop(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    handshake_timeout: Duration,
    tx: mpsc::Sender<(BoxedIo, SocketAddr)>,
) {
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::error!("Accept error: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            },
        };

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%remote_addr, "set_nodelay failed: {}", e);
        }

        let Some(acceptor) = &tls else {
            if tx.send((Box::new(stream), remote_addr)).await.is_err() {
                return;
            }
            continue;
        };

        let acceptor = acceptor.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            match tls_handshake(&acceptor, stream, handshake_timeout).await {
                Ok(io) => {
                    // Receiver gone means the server stopped
                    let _ = tx.send((io, remote_addr)).await;
                },
                Err(e) => tracing::debug!(%remote_addr, "{}", e),
            }
        });
    }
}

async fn tls_handshake(
    acceptor: &TlsAcceptor,
    stream: TcpStream,
    handshake_timeout: Duration,
) -> Result<BoxedIo, ServerError> {
    let stream = tokio::time::timeout(handshake_timeout, acceptor.accept(stream))
        .await
        .map_err(|_| ServerError::Handshake("TLS handshake timed out".to_string()))?
        .map_err(|e| ServerError::Handshake(format!("TLS handshake failed: {e}")))?;

    Ok(Box::new(stream))
}

/// Check that `path` can be routed as a literal path.
pub fn validate_health_path(path: &str) -> Result<(), ServerError> {
    if !path.starts_with('/') || path.contains(['{', '}', '*', ':']) {
        return Err(ServerError::Config(format!(
            "health path '{path}' must be a literal path starting with '/'"
        )));
    }
    Ok(())
}

/// Health-check handler.
pub(crate) async fn health_check(
    ConnectInfo(RemoteAddr(remote_addr)): ConnectInfo<RemoteAddr>,
) -> &'static str {
    tracing::debug!(%remote_addr, "Answered health check");
    HEALTH_BODY
}
