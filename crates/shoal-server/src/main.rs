#![forbid(unsafe_code)]

//! Shoal signaling server - brokers end-to-end encrypted WebRTC signaling.
//!
//! The server:
//! 1. Pairs initiators and responders on paths keyed by public key
//! 2. Authenticates each client against the path and the server cookie
//! 3. Relays encrypted signaling payloads between peers without decrypting
//!    them (E2E encryption between peers)

mod connection;
mod dispatch;
mod error;
mod registry;
mod transport;

#[cfg(test)]
mod test_helpers;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, info_span, warn, Instrument};

use connection::{ConnectionConfig, ServerContext};
use registry::PathRegistry;
use shoal_crypto::identity::PermanentKeypair;
use transport::TlsFiles;

#[derive(Parser, Debug)]
#[command(name = "shoal-server")]
#[command(about = "Shoal signaling relay - pairs WebRTC peers and forwards their encrypted signaling")]
struct Args {
    /// Listen address
    #[arg(long, env = "SHOAL_HOST", default_value = "0.0.0.0")]
    host: IpAddr,

    /// Listen port
    #[arg(short, long, env = "SHOAL_PORT", default_value_t = 8765)]
    port: u16,

    /// TLS certificate path, consumed by the terminating front
    #[arg(long, env = "SHOAL_TLSCERT")]
    tlscert: Option<PathBuf>,

    /// TLS private key path, consumed by the terminating front
    #[arg(long, env = "SHOAL_TLSKEY")]
    tlskey: Option<PathBuf>,

    /// Diffie-Hellman parameters path, consumed by the terminating front
    #[arg(long, env = "SHOAL_DHPARAMS")]
    dhparams: Option<PathBuf>,

    /// Permanent server key file (32 raw bytes); created if absent
    #[arg(short = 'k', long, env = "SHOAL_KEYFILE")]
    keyfile: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = format!("{},tokio=warn", args.log_level);
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting shoal-server v{}", env!("CARGO_PKG_VERSION"));

    // TLS termination belongs to the transport collaborator; fail fast on
    // missing material rather than at the first connection.
    match (&args.tlscert, &args.tlskey) {
        (Some(cert), Some(key)) => {
            let tls = TlsFiles {
                certificate: cert.clone(),
                private_key: key.clone(),
                dh_parameters: args.dhparams.clone(),
            };
            tls.check().context("TLS material")?;
            info!(cert = %cert.display(), "TLS material handed to the terminating front");
        }
        (None, None) => {
            warn!("no TLS material configured; expecting an external terminator")
        }
        _ => anyhow::bail!("--tlscert and --tlskey must be given together"),
    }

    let identity = load_identity(args.keyfile.as_deref())?;
    info!(
        "Server public key: {}",
        hex::encode(identity.public_key_bytes())
    );

    let ctx = Arc::new(ServerContext {
        identity,
        registry: PathRegistry::new(),
        config: ConnectionConfig::default(),
    });

    let listen = SocketAddr::new(args.host, args.port);
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {}", listen))?;
    info!("Signaling server listening on {}", listen);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        continue;
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("failed to set TCP_NODELAY for {}: {}", peer, e);
                }

                let ctx = ctx.clone();
                tokio::spawn(
                    connection::run(stream, ctx).instrument(info_span!("conn", %peer)),
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!(paths = ctx.registry.path_count().await, "Shutting down");
                break;
            }
        }
    }

    Ok(())
}

fn load_identity(keyfile: Option<&std::path::Path>) -> Result<PermanentKeypair> {
    match keyfile {
        Some(path) if path.exists() => {
            let keypair = PermanentKeypair::load(path)
                .with_context(|| format!("failed to load {}", path.display()))?;
            info!(keyfile = %path.display(), "Loaded permanent server key");
            Ok(keypair)
        }
        Some(path) => {
            let keypair = PermanentKeypair::generate();
            keypair
                .save(path)
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!(keyfile = %path.display(), "Generated new permanent server key");
            Ok(keypair)
        }
        None => {
            warn!("no --keyfile given; using a transient permanent key");
            Ok(PermanentKeypair::generate())
        }
    }
}
