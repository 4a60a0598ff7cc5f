//! Standalone signaling relay binary
//!
//! Run with:
//!   cargo run --bin signaling-server -- --port 8080
//!
//! With TLS:
//!   cargo run --bin signaling-server -- --port 8443 --cert cert.pem --key key.pem

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use peerchat::network::{serve_websocket, NetworkError, Registry, SignalingServer};

/// Signaling relay for peerchat
#[derive(Parser, Debug)]
#[command(name = "signaling-server")]
#[command(about = "Signaling relay for peerchat WebRTC sessions")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Path to TLS certificate file (PEM format)
    #[arg(long)]
    cert: Option<std::path::PathBuf>,

    /// Path to TLS private key file (PEM format)
    #[arg(long)]
    key: Option<std::path::PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Load TLS certificates from PEM file
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        bail!("No certificate found in {}", path.display());
    }
    Ok(certs)
}

/// Load TLS private key from PEM file
fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    let mut reader = BufReader::new(file);

    for item in rustls_pemfile::read_all(&mut reader) {
        match item? {
            rustls_pemfile::Item::Pkcs1Key(key) => return Ok(PrivateKeyDer::Pkcs1(key)),
            rustls_pemfile::Item::Pkcs8Key(key) => return Ok(PrivateKeyDer::Pkcs8(key)),
            rustls_pemfile::Item::Sec1Key(key) => return Ok(PrivateKeyDer::Sec1(key)),
            _ => continue,
        }
    }

    bail!("No private key found in {}", path.display())
}

/// Create TLS acceptor from certificate and key files
fn create_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    // More than one provider may be compiled in through dependencies
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| NetworkError::Tls(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn setup_logging(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.verbose);

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .context("Invalid listen address")?;

    let tls_acceptor = match (&args.cert, &args.key) {
        (Some(cert), Some(key)) => {
            info!("TLS enabled with cert: {:?}, key: {:?}", cert, key);
            Some(create_tls_acceptor(cert, key)?)
        }
        (Some(_), None) | (None, Some(_)) => {
            error!("Both --cert and --key must be provided for TLS");
            bail!("TLS configuration incomplete");
        }
        (None, None) => {
            warn!("TLS disabled - running in plain WebSocket mode");
            warn!("For production, use --cert and --key to enable TLS");
            None
        }
    };

    info!("Signaling server starting on {}", addr);
    let server = SignalingServer::new();

    match tls_acceptor {
        Some(acceptor) => {
            info!("Protocol: wss:// (WebSocket Secure)");
            run_tls_server(addr, acceptor, server.registry().clone()).await?;
        }
        None => {
            info!("Protocol: ws:// (WebSocket)");
            server.run(&addr.to_string()).await?;
        }
    }

    Ok(())
}

/// Accept TLS connections and hand each upgraded socket to the shared registry
async fn run_tls_server(addr: SocketAddr, tls_acceptor: TlsAcceptor, registry: Registry) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("TLS signaling server listening on {}", addr);

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                info!("New TLS connection from {}", peer_addr);

                let acceptor = tls_acceptor.clone();
                let registry = registry.clone();

                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(s) => s,
                        Err(e) => {
                            warn!("TLS handshake failed for {}: {}", peer_addr, e);
                            return;
                        }
                    };

                    let ws_stream = match tokio_tungstenite::accept_async(tls_stream).await {
                        Ok(s) => s,
                        Err(e) => {
                            warn!("WebSocket upgrade failed for {}: {}", peer_addr, e);
                            return;
                        }
                    };

                    if let Err(e) = serve_websocket(ws_stream, registry).await {
                        warn!("Connection error for {}: {}", peer_addr, e);
                    }
                });
            }
            Err(e) => {
                error!("Accept error: {}", e);
            }
        }
    }
}
