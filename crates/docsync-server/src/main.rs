//! Demonstration binary wiring [`docsync_core::Server`] to an in-memory pub/sub fabric, an
//! in-memory storage backend, and a length-prefixed TCP transport.
//!
//! Grounded on `crates/broker/bin/src/main.rs` / `crates/broker/broker-bin/src/main.rs`: a
//! `clap::Parser` args struct, `#[tokio::main]`, and a `setup_tracing(verbose)` helper that
//! prefers `RUST_LOG` and falls back to a sensible default directive.

mod storage_factory;
mod transport;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use docsync_core::{BrokerConfig, Server, ServerOptions};
use docsync_proto::ClientId;
use docsync_pubsub::{InMemoryPubSub, NodeId};
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::info;

use storage_factory::InMemoryStorageFactory;
use transport::TcpTransport;

#[derive(Parser, Debug)]
#[command(name = "docsync-server", about = "Collaborative document sync broker")]
struct Args {
    /// Address to bind the TCP listener on.
    #[arg(long, default_value = "127.0.0.1:4567")]
    bind: SocketAddr,

    /// Enables debug-level tracing. Without this, only info-and-above is logged.
    #[arg(long, short = 'v')]
    verbose: bool,

    /// Overrides the node id used to tag cross-node replication (random by default).
    #[arg(long)]
    node_id: Option<String>,
}

fn setup_tracing(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    setup_tracing(args.verbose);

    let mut config = BrokerConfig::default();
    if let Some(node_id) = args.node_id {
        config.node_id = NodeId(node_id);
    }

    let mut options = ServerOptions::new(Arc::new(InMemoryStorageFactory::new()), Arc::new(InMemoryPubSub::new()));
    options.config = config;
    let server = Server::new(options);

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, node_id = %server.node_id(), "docsync-server listening");

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown_signal.cancel();
    });

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let server = server.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(server, stream, peer).await {
                        tracing::warn!(%peer, error = %err, "connection ended with error");
                    }
                });
            }
            _ = shutdown.cancelled() => {
                info!("shutting down");
                server.shutdown().await;
                break;
            }
        }
    }

    Ok(())
}

async fn handle_connection(
    server: Arc<Server>,
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
) -> Result<(), Box<dyn std::error::Error>> {
    let (read_half, write_half) = stream.into_split();
    let transport = TcpTransport::new(peer, write_half);
    let client_id = ClientId::generate();
    let client = server.create_client(Some(client_id.clone()), transport);

    transport::read_loop(BufReader::new(read_half), |message| {
        let server = server.clone();
        let client = client.clone();
        let client_id = client_id.clone();
        async move {
            if let Err(err) = server.handle_inbound(&client_id, &client, message).await {
                tracing::warn!(%client_id, error = %err, "failed to handle inbound message");
            }
        }
    })
    .await;

    server
        .disconnect_client(&client_id, docsync_core::DisconnectReason::StreamEnded)
        .await;
    Ok(())
}
