#[cfg(feature = "bluetooth")]
pub mod rfcomm;
pub mod tcp;
pub mod traits;

#[cfg(feature = "bluetooth")]
pub use rfcomm::{RfcommAcceptor, RfcommConfig, RfcommConnector, RfcommTransportStream};
pub use tcp::{TcpAcceptor, TcpConnector, TcpTransportStream};
pub use traits::{
    close_stream, BoxedStream, Established, TransportAcceptor, TransportConnector,
    TransportListener, TransportStream,
};
