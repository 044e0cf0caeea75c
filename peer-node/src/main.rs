//! Peer node: the remote end of the link.
//!
//! Listens for the controller, logs what it receives and echoes it back.

use anyhow::Result;
use btlink::transport::{TcpAcceptor, TcpConnector, TransportAcceptor, TransportConnector};
use btlink::{ConnectionEvent, ConnectionManager, LinkConfig};
use btlink_shared::link;
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "peer-node")]
#[command(about = "Accept one controller at a time and echo its bytes")]
struct Args {
    /// Listen on RFCOMM instead of TCP (requires the `bluetooth` feature).
    #[arg(long)]
    rfcomm: bool,

    /// TCP listen address.
    #[arg(long, default_value = "127.0.0.1:9000")]
    listen: String,

    /// RFCOMM channel.
    #[arg(long, default_value_t = link::DEFAULT_RFCOMM_CHANNEL)]
    channel: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();
    let (connector, acceptor) = transports(&args)?;

    let (manager, mut events) =
        ConnectionManager::new(LinkConfig::default(), connector, Some(acceptor));
    manager.start().await?;
    info!("Peer node ready");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    ConnectionEvent::StateChanged(state) => {
                        info!("[PEER] Link state: {}", state)
                    }
                    ConnectionEvent::DeviceIdentified(peer) => {
                        info!("[PEER] Controller {} connected", peer)
                    }
                    ConnectionEvent::BytesReceived(bytes) => {
                        info!(
                            "[PEER] Received {} bytes: {}",
                            bytes.len(),
                            String::from_utf8_lossy(&bytes).trim_end()
                        );
                        if let Err(e) = manager.write(bytes).await {
                            warn!("[PEER] Echo failed: {}", e);
                        }
                    }
                    ConnectionEvent::TransientError(e) => warn!("[PEER] {}", e),
                }
            }
        }
    }

    manager.stop().await;
    info!("Peer node stopped");
    Ok(())
}

type Transports = (Arc<dyn TransportConnector>, Arc<dyn TransportAcceptor>);

fn transports(args: &Args) -> Result<Transports> {
    if args.rfcomm {
        return rfcomm_transports(args.channel);
    }
    info!("[PEER] Listening on tcp://{}", args.listen);
    Ok((
        Arc::new(TcpConnector::new()),
        Arc::new(TcpAcceptor::new(args.listen.clone())),
    ))
}

#[cfg(feature = "bluetooth")]
fn rfcomm_transports(channel: u8) -> Result<Transports> {
    use btlink::transport::{RfcommAcceptor, RfcommConfig, RfcommConnector};

    info!("[PEER] Listening on RFCOMM channel {}", channel);
    let config = RfcommConfig {
        channel,
        ..Default::default()
    };
    Ok((
        Arc::new(RfcommConnector::new(config.clone())),
        Arc::new(RfcommAcceptor::new(config)),
    ))
}

#[cfg(not(feature = "bluetooth"))]
fn rfcomm_transports(_channel: u8) -> Result<Transports> {
    anyhow::bail!("built without the `bluetooth` feature")
}
