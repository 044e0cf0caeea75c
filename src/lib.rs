//! btlink: connection lifecycle for a single-peer serial link
//!
//! The [`connection::ConnectionManager`] owns the link to one remote device.
//! It dials out through a [`transport::TransportConnector`], optionally
//! listens through a [`transport::TransportAcceptor`], and reports progress
//! as [`connection::ConnectionEvent`]s.

pub mod config;
pub mod connection;
pub mod transport;

pub use btlink_shared::{ConnectionState, LinkError, PeerId, PeerIdentity};
pub use connection::{ConnectionEvent, ConnectionManager, EventReceiver, LinkConfig};
