//! Rendezvous signaling relay.
//!
//! Lets browser endpoints find each other by a self-chosen id and exchange
//! opaque signaling payloads (SDP offers, ICE candidates) over WebSocket,
//! either pairwise in a session or among the members of a named room. The
//! relay never looks inside the payloads.
//!
//! # Architecture
//!
//! The [`SignalingDriver`] is the protocol state machine and follows the
//! Sans-IO pattern: it consumes [`ServerEvent`]s and returns
//! [`ServerAction`]s without touching a socket. [`Server`] is the production
//! runtime: an axum router that answers the health path, upgrades every other
//! request to WebSocket and executes the driver's actions.
//!
//! # Components
//!
//! - [`SignalingDriver`]: handshake, dispatch by peer status, cleanup cascade
//! - [`PeerRegistry`]: who is online and what they are doing
//! - [`SessionManager`]: 1:1 sessions with verbatim relay
//! - [`RoomManager`]: rooms with join/leave broadcasts and direct messages
//! - [`Server`]: axum runtime over [`RelayListener`]

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod connection;
mod driver;
mod error;
mod registry;
mod room_manager;
mod server_error;
mod session_manager;
mod tls;
mod transport;

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use axum::Router;
use connection::SharedState;
pub use driver::{CloseCode, LogLevel, ServerAction, ServerEvent, SignalingDriver};
pub use error::ServerError;
pub use registry::{ConnectionId, PeerEntry, PeerRegistry, PeerStatus};
pub use room_manager::{RoomAction, RoomError, RoomManager};
pub use server_error::DriverError;
pub use session_manager::{SessionAction, SessionError, SessionManager};
pub use tls::TlsSettings;
pub use transport::{BoxedIo, HEALTH_BODY, Io, RelayListener, validate_health_path};

/// Receive silence before a keepalive ping.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Bound on the TLS handshake of a new connection.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerRuntimeConfig {
    /// Address to bind to (e.g., "0.0.0.0:9000")
    pub bind_address: String,
    /// TLS material; `None` serves plain `ws://`
    pub tls: Option<TlsSettings>,
    /// Receive silence before a keepalive ping
    pub keepalive_interval: Duration,
    /// Bound on the TLS handshake
    pub handshake_timeout: Duration,
    /// HTTP path answered with `200 OK` and [`HEALTH_BODY`]
    pub health_path: String,
}

impl Default for ServerRuntimeConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:9000".to_string(),
            tls: None,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            health_path: "/health".to_string(),
        }
    }
}

/// Production signaling server.
///
/// Wraps `SignalingDriver` with the axum router and listener.
pub struct Server {
    /// TCP listener with optional TLS
    listener: RelayListener,
    /// Health check and WebSocket upgrade
    router: Router,
    /// Driver and per-connection queues
    shared: Arc<SharedState>,
}

impl Server {
    /// Create and bind a new server.
    pub async fn bind(config: ServerRuntimeConfig) -> Result<Self, ServerError> {
        validate_health_path(&config.health_path)?;

        let listener = RelayListener::bind(
            &config.bind_address,
            config.tls.as_ref(),
            config.handshake_timeout,
        )
        .await?;
        let shared = Arc::new(SharedState::new(config.keepalive_interval));
        let router = connection::router(Arc::clone(&shared), &config.health_path);

        Ok(Self { listener, router, shared })
    }

    /// Run the server until the process exits.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Run the server until `shutdown` resolves, then close every open
    /// connection.
    ///
    /// Returns once the close frames are written, or the shutdown grace
    /// period runs out.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::info!("Server starting on {}", self.listener.local_addr());

        let app = self.router.into_make_service_with_connect_info::<transport::RemoteAddr>();
        axum::serve(self.listener, app).with_graceful_shutdown(shutdown).await?;

        tracing::info!("Server shutting down");
        self.shared.close_all().await;

        Ok(())
    }

    /// Local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }
}
