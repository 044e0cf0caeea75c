//! Transport trait abstraction for pluggable link backends

use anyhow::Result;
use async_trait::async_trait;
use btlink_shared::{PeerId, PeerIdentity};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// A transport stream that can read and write bytes
#[async_trait]
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Close the transport gracefully
    async fn shutdown(&mut self) -> Result<()>;
}

/// Type-erased stream endpoint owned by the connection manager
pub type BoxedStream = Box<dyn TransportStream>;

/// An open stream together with the peer it is bound to
pub struct Established {
    pub stream: BoxedStream,
    pub peer: PeerIdentity,
}

impl Established {
    pub fn new(stream: impl TransportStream, peer: PeerIdentity) -> Self {
        Self {
            stream: Box::new(stream),
            peer,
        }
    }
}

/// Performs outbound connection attempts
#[async_trait]
pub trait TransportConnector: Send + Sync + 'static {
    /// Attempt to connect to `peer`. `secure` selects the authenticated
    /// link mode where the transport has one.
    ///
    /// Dropping the returned future must abort the attempt and release any
    /// partially opened resource.
    async fn connect(&self, peer: &PeerId, secure: bool) -> Result<Established>;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}

/// A bound listening resource; dropping it stops listening
#[async_trait]
pub trait TransportListener: Send + 'static {
    /// Wait for the next inbound peer
    async fn accept(&mut self) -> Result<Established>;
}

/// Factory for listening resources
#[async_trait]
pub trait TransportAcceptor: Send + Sync + 'static {
    /// Start listening using the local device's own identity
    async fn bind(&self) -> Result<Box<dyn TransportListener>>;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}

/// Shut a stream down and drop it
pub async fn close_stream(mut stream: BoxedStream) {
    if let Err(e) = TransportStream::shutdown(stream.as_mut()).await {
        debug!("[LINK] Shutdown error while closing stream: {}", e);
    }
}
