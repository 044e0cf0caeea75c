//! TCP simulation transport for development without a Bluetooth adapter

use crate::transport::traits::{
    Established, TransportAcceptor, TransportConnector, TransportListener, TransportStream,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use btlink_shared::{PeerId, PeerIdentity};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

/// TCP stream wrapper implementing TransportStream
pub struct TcpTransportStream {
    inner: TcpStream,
}

impl TcpTransportStream {
    pub fn new(stream: TcpStream) -> Self {
        Self { inner: stream }
    }
}

impl AsyncRead for TcpTransportStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpTransportStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[async_trait]
impl TransportStream for TcpTransportStream {
    async fn shutdown(&mut self) -> Result<()> {
        tokio::io::AsyncWriteExt::shutdown(&mut self.inner).await?;
        Ok(())
    }
}

/// Peer id for a socket address, in the form `TcpStream::connect` accepts
fn peer_id_for(addr: SocketAddr) -> Result<PeerId> {
    Ok(PeerId::parse(&addr.to_string())?)
}

/// TCP connector; the peer id is a `host:port` address
pub struct TcpConnector {
    name: &'static str,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self {
            name: "TCP simulation",
        }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportConnector for TcpConnector {
    async fn connect(&self, peer: &PeerId, secure: bool) -> Result<Established> {
        if secure {
            debug!("[TCP] Secure mode has no meaning for the simulation, ignoring");
        }
        let stream = TcpStream::connect(peer.as_str())
            .await
            .map_err(|e| anyhow!("TCP connect to {} failed: {}", peer, e))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("[TCP] Failed to set TCP_NODELAY: {}", e);
        }
        info!("[TCP] Connected to {}", peer);
        Ok(Established::new(
            TcpTransportStream::new(stream),
            PeerIdentity::new(peer.clone()),
        ))
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// TCP acceptor bound to a local listen address
pub struct TcpAcceptor {
    address: String,
}

impl TcpAcceptor {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

/// Bound TCP listener
pub struct TcpTransportListener {
    listener: TcpListener,
}

impl TcpTransportListener {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    async fn accept(&mut self) -> Result<Established> {
        let (stream, addr) = self.listener.accept().await?;
        info!("[TCP] Accepted connection from {}", addr);
        Ok(Established::new(
            TcpTransportStream::new(stream),
            PeerIdentity::new(peer_id_for(addr)?),
        ))
    }
}

#[async_trait]
impl TransportAcceptor for TcpAcceptor {
    async fn bind(&self) -> Result<Box<dyn TransportListener>> {
        let listener = TcpListener::bind(&self.address).await?;
        info!("[TCP] Listening on {}", listener.local_addr()?);
        Ok(Box::new(TcpTransportListener { listener }))
    }

    fn name(&self) -> &'static str {
        "TCP simulation"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_peer_id_for_socket_addrs() {
        let v4: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        assert_eq!(peer_id_for(v4).unwrap().as_str(), "127.0.0.1:9000");

        let v6: SocketAddr = "[::1]:9000".parse().unwrap();
        assert_eq!(peer_id_for(v6).unwrap().as_str(), "[::1]:9000");
    }

    #[tokio::test]
    async fn test_connect_and_accept_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut listener = TcpTransportListener { listener };

        let peer = PeerId::parse(&addr.to_string()).unwrap();
        let connector = TcpConnector::new();
        let (outbound, inbound) = tokio::join!(connector.connect(&peer, false), listener.accept());
        let mut outbound = outbound.unwrap();
        let mut inbound = inbound.unwrap();
        assert_eq!(outbound.peer.id, peer);
        assert!(inbound.peer.id.as_str().starts_with("127.0.0.1:"));

        outbound.stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        inbound.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();
        let peer = PeerId::parse(&addr.to_string()).unwrap();
        assert!(TcpConnector::new().connect(&peer, false).await.is_err());
    }
}
