mod cli;

use anyhow::Result;
use btlink::config::{self, ControllerConfig, TransportMode};
use btlink::transport::{TcpAcceptor, TcpConnector, TransportAcceptor, TransportConnector};
use btlink::{ConnectionEvent, ConnectionManager, ConnectionState, LinkError};
use cli::Cli;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let mut config = config::load(cli.config.as_deref())?;
    cli.apply(&mut config);

    info!("btlink controller starting");
    info!("  Mode: {}", config.mode);
    info!("  Peer: {}", config.peer.as_deref().unwrap_or("(none)"));
    info!("  Listen: {}", config.listen);

    let (connector, acceptor) = build_transports(&config)?;
    let (manager, mut events) = ConnectionManager::new(config.link_config(), connector, acceptor);
    let manager = Arc::new(manager);

    manager.start().await?;
    if let Some(peer) = &config.peer {
        manager.connect(peer, config.secure).await?;
    }

    let stdin_task = tokio::spawn(forward_stdin(manager.clone()));

    let mut backoff = Backoff::new(config.reconnect_delay(), config.max_reconnect_delay());
    let mut reconnect_at: Option<Instant> = None;

    loop {
        let wake = reconnect_at.unwrap_or_else(Instant::now);
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("[CTRL] Interrupted, shutting down");
                break;
            }

            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    ConnectionEvent::StateChanged(state) => {
                        info!("[CTRL] Link state: {}", state);
                        if state == ConnectionState::Connected {
                            backoff.reset();
                            reconnect_at = None;
                        }
                    }
                    ConnectionEvent::DeviceIdentified(peer) => {
                        info!("[CTRL] Connected to {}", peer);
                    }
                    ConnectionEvent::BytesReceived(bytes) => {
                        info!("[CTRL] Received: {}", String::from_utf8_lossy(&bytes).trim_end());
                    }
                    ConnectionEvent::TransientError(error) => {
                        warn!("[CTRL] {}", error);
                        let retry = matches!(
                            error,
                            LinkError::ConnectFailed(_) | LinkError::StreamLost(_)
                        );
                        if retry && config.peer.is_some() && reconnect_at.is_none() {
                            let delay = backoff.next_delay();
                            info!("[CTRL] Reconnecting in {:?}", delay);
                            reconnect_at = Some(Instant::now() + delay);
                        }
                    }
                }
            }

            _ = sleep_until(wake), if reconnect_at.is_some() => {
                reconnect_at = None;
                if let Some(peer) = &config.peer {
                    if let Err(e) = manager.connect(peer, config.secure).await {
                        warn!("[CTRL] Reconnect failed: {}", e);
                    }
                }
            }
        }
    }

    stdin_task.abort();
    manager.stop().await;
    info!("btlink controller stopped");
    Ok(())
}

type Transports = (
    Arc<dyn TransportConnector>,
    Option<Arc<dyn TransportAcceptor>>,
);

fn build_transports(config: &ControllerConfig) -> Result<Transports> {
    match config.mode {
        TransportMode::TcpSimulation => {
            let acceptor = config.listen.then(|| {
                Arc::new(TcpAcceptor::new(config.accept.clone())) as Arc<dyn TransportAcceptor>
            });
            Ok((Arc::new(TcpConnector::new()), acceptor))
        }
        #[cfg(feature = "bluetooth")]
        TransportMode::Rfcomm => {
            use btlink::transport::{RfcommAcceptor, RfcommConfig, RfcommConnector};

            let rfcomm = RfcommConfig {
                channel: config.channel,
                secure_listen: config.secure,
            };
            let acceptor = config.listen.then(|| {
                Arc::new(RfcommAcceptor::new(rfcomm.clone())) as Arc<dyn TransportAcceptor>
            });
            Ok((Arc::new(RfcommConnector::new(rfcomm)), acceptor))
        }
        #[cfg(not(feature = "bluetooth"))]
        TransportMode::Rfcomm => {
            anyhow::bail!("rfcomm mode needs the `bluetooth` feature; use --mode tcp_simulation")
        }
    }
}

/// Forward each stdin line to the peer
async fn forward_stdin(manager: Arc<ConnectionManager>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let mut payload = line.into_bytes();
                payload.push(b'\n');
                if let Err(e) = manager.write(payload).await {
                    warn!("[CTRL] Input not sent: {}", e);
                }
            }
            Ok(None) => {
                debug!("[CTRL] stdin closed");
                return;
            }
            Err(e) => {
                warn!("[CTRL] stdin read failed: {}", e);
                return;
            }
        }
    }
}

/// Exponential reconnect delay
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = std::cmp::min(self.current * 2, self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_tcp_transports_respect_listen_flag() {
        let mut config = ControllerConfig {
            mode: TransportMode::TcpSimulation,
            ..Default::default()
        };
        let (connector, acceptor) = build_transports(&config).unwrap();
        assert_eq!(connector.name(), "TCP simulation");
        assert!(acceptor.is_some());

        config.listen = false;
        let (_, acceptor) = build_transports(&config).unwrap();
        assert!(acceptor.is_none());
    }
}
