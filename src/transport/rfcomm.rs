//! RFCOMM transport implementation for Bluetooth connections

use crate::transport::traits::{
    Established, TransportAcceptor, TransportConnector, TransportListener, TransportStream,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bluer::rfcomm::{
    Profile, ProfileHandle, Role, Security, SecurityLevel, Socket, SocketAddr as RfcommAddr,
    Stream as RfcommStream,
};
use bluer::{Adapter, Address, Session, Uuid};
use btlink_shared::{link, PeerId, PeerIdentity};
use futures::StreamExt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, info};

/// RFCOMM stream wrapper implementing TransportStream
pub struct RfcommTransportStream {
    inner: RfcommStream,
    peer_addr: Address,
}

impl RfcommTransportStream {
    /// Create a new RFCOMM transport stream
    pub fn new(stream: RfcommStream, peer_addr: Address) -> Self {
        Self {
            inner: stream,
            peer_addr,
        }
    }

    /// Get the peer Bluetooth address
    pub fn peer_address(&self) -> Address {
        self.peer_addr
    }
}

impl AsyncRead for RfcommTransportStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for RfcommTransportStream {
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
impl TransportStream for RfcommTransportStream {
    async fn shutdown(&mut self) -> Result<()> {
        tokio::io::AsyncWriteExt::shutdown(&mut self.inner).await?;
        Ok(())
    }
}

/// Configuration for the RFCOMM transport
#[derive(Debug, Clone)]
pub struct RfcommConfig {
    /// RFCOMM channel number
    pub channel: u8,
    /// Require an authenticated link for inbound peers
    pub secure_listen: bool,
}

impl Default for RfcommConfig {
    fn default() -> Self {
        Self {
            channel: link::DEFAULT_RFCOMM_CHANNEL,
            secure_listen: true,
        }
    }
}

/// Get the default Bluetooth adapter, powered on
pub async fn get_adapter(session: &Session) -> Result<Adapter> {
    let adapter = session.default_adapter().await?;
    adapter.set_powered(true).await?;
    Ok(adapter)
}

/// Look up the remote device name; failures just mean "no name"
async fn device_name(addr: Address) -> Option<String> {
    let session = Session::new().await.ok()?;
    let adapter = session.default_adapter().await.ok()?;
    let device = adapter.device(addr).ok()?;
    device.name().await.ok().flatten()
}

async fn identify(addr: Address) -> Result<PeerIdentity> {
    let id = PeerId::parse(&addr.to_string())?;
    Ok(match device_name(addr).await {
        Some(name) => PeerIdentity::named(id, name),
        None => PeerIdentity::new(id),
    })
}

/// RFCOMM connector for outbound Bluetooth connections
pub struct RfcommConnector {
    config: RfcommConfig,
}

impl RfcommConnector {
    /// Create a new RFCOMM connector
    pub fn new(config: RfcommConfig) -> Self {
        Self { config }
    }

    /// Create connector for a specific channel
    pub fn with_channel(channel: u8) -> Self {
        Self::new(RfcommConfig {
            channel,
            ..Default::default()
        })
    }
}

#[async_trait]
impl TransportConnector for RfcommConnector {
    async fn connect(&self, peer: &PeerId, secure: bool) -> Result<Established> {
        let target_addr: Address = peer
            .as_str()
            .parse()
            .map_err(|e| anyhow!("Not a Bluetooth address {}: {}", peer, e))?;

        let socket = Socket::new()?;
        let level = if secure {
            SecurityLevel::Medium
        } else {
            SecurityLevel::Low
        };
        socket.set_security(Security { level, key_size: 0 })?;

        let socket_addr = RfcommAddr::new(target_addr, self.config.channel);
        info!(
            "[BT] Connecting to {} channel {} (secure={})",
            target_addr, self.config.channel, secure
        );

        let stream = socket
            .connect(socket_addr)
            .await
            .map_err(|e| anyhow!("RFCOMM connect failed: {}", e))?;

        info!("[BT] Connected to {}", target_addr);
        let peer = identify(target_addr).await?;
        Ok(Established::new(
            RfcommTransportStream::new(stream, target_addr),
            peer,
        ))
    }

    fn name(&self) -> &'static str {
        "Bluetooth"
    }
}

/// RFCOMM acceptor advertising the Serial Port Profile service record
pub struct RfcommAcceptor {
    config: RfcommConfig,
}

impl RfcommAcceptor {
    pub fn new(config: RfcommConfig) -> Self {
        Self { config }
    }

    fn profile(&self) -> Result<Profile> {
        let uuid: Uuid = link::SERVICE_UUID.parse()?;
        Ok(Profile {
            uuid,
            name: Some(link::SERVICE_NAME.into()),
            channel: Some(self.config.channel.into()),
            role: Some(Role::Server),
            require_authentication: Some(self.config.secure_listen),
            require_authorization: Some(false),
            ..Default::default()
        })
    }
}

/// Registered profile; dropping it unregisters the service record
pub struct RfcommTransportListener {
    _session: Session,
    handle: Pin<Box<ProfileHandle>>,
}

#[async_trait]
impl TransportListener for RfcommTransportListener {
    async fn accept(&mut self) -> Result<Established> {
        let request = self
            .handle
            .next()
            .await
            .ok_or_else(|| anyhow!("Profile registration closed by bluetoothd"))?;
        let addr = request.device();
        debug!("[BT] Connect request from {}", addr);
        let stream = request.accept()?;
        info!("[BT] Accepted connection from {}", addr);
        let peer = identify(addr).await?;
        Ok(Established::new(RfcommTransportStream::new(stream, addr), peer))
    }
}

#[async_trait]
impl TransportAcceptor for RfcommAcceptor {
    async fn bind(&self) -> Result<Box<dyn TransportListener>> {
        let session = Session::new().await?;
        let adapter = get_adapter(&session).await?;
        adapter.set_discoverable(true).await?;

        let handle = session.register_profile(self.profile()?).await?;
        info!(
            "[BT] Listening on {} channel {} as {}",
            adapter.name(),
            self.config.channel,
            link::SERVICE_UUID
        );
        Ok(Box::new(RfcommTransportListener {
            _session: session,
            handle: Box::pin(handle),
        }))
    }

    fn name(&self) -> &'static str {
        "Bluetooth"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RfcommConfig::default();
        assert_eq!(config.channel, link::DEFAULT_RFCOMM_CHANNEL);
        assert!(config.secure_listen);
    }

    #[test]
    fn test_connector_with_channel() {
        let connector = RfcommConnector::with_channel(5);
        assert_eq!(connector.config.channel, 5);
    }

    #[test]
    fn test_profile_advertises_service_uuid() {
        let acceptor = RfcommAcceptor::new(RfcommConfig::default());
        let profile = acceptor.profile().unwrap();
        assert_eq!(profile.uuid.to_string(), link::SERVICE_UUID);
        assert_eq!(profile.channel, Some(1));
    }
}
