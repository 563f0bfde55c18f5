//! Rendezvous signaling relay binary.
//!
//! # Usage
//!
//! ```bash
//! # wss:// on 0.0.0.0:9000, generating cert.pem/key.pem if missing
//! rendezvous-server
//!
//! # Plain ws:// behind a TLS-terminating proxy
//! rendezvous-server --disable-ssl --port 8080
//!
//! # Existing certificate
//! rendezvous-server --cert-file /etc/relay/cert.pem --key-file /etc/relay/key.pem
//! ```

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use clap::Parser;
use rendezvous_server::{DEFAULT_HANDSHAKE_TIMEOUT, Server, ServerRuntimeConfig, TlsSettings};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Rendezvous signaling relay
#[derive(Parser, Debug)]
#[command(name = "rendezvous-server")]
#[command(about = "WebRTC signaling relay over WebSocket")]
#[command(version)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    addr: IpAddr,

    /// Port to listen on
    #[arg(long, default_value_t = 9000)]
    port: u16,

    /// Seconds of receive silence before a keepalive ping
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    keepalive_timeout: u64,

    /// Serve plain ws:// instead of wss://
    #[arg(long)]
    disable_ssl: bool,

    /// HTTP path answered as a health check
    #[arg(long, default_value = "/health")]
    health: String,

    /// TLS certificate (PEM), generated if missing
    #[arg(long, default_value = "cert.pem")]
    cert_file: PathBuf,

    /// TLS private key (PEM), generated if missing
    #[arg(long, default_value = "key.pem")]
    key_file: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn runtime_config(self) -> ServerRuntimeConfig {
        let tls = (!self.disable_ssl).then(|| {
            let mut settings = TlsSettings::new(self.cert_file, self.key_file);
            if !self.addr.is_unspecified() && !self.addr.is_loopback() {
                settings.subject_names.push(self.addr.to_string());
            }
            settings
        });

        ServerRuntimeConfig {
            bind_address: SocketAddr::new(self.addr, self.port).to_string(),
            tls,
            keepalive_interval: Duration::from_secs(self.keepalive_timeout),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            health_path: self.health,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("Rendezvous server starting");

    if args.disable_ssl {
        tracing::warn!("TLS disabled - serving plain ws://");
    }

    let server = Server::bind(args.runtime_config()).await?;

    tracing::info!("Server listening on {}", server.local_addr());

    server.run_until(shutdown_signal()).await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}
