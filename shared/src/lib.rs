//! btlink Shared Link Types
//!
//! This crate provides the types shared between the controller, the peer
//! node and the connection manager: peer identities, the connection state,
//! the link state machine and the error taxonomy.

pub mod error;
pub mod state_machine;

pub use error::LinkError;
pub use state_machine::{LinkEvent, LinkStateMachine, TransitionResult};

use std::fmt;
use std::str::FromStr;

/// Link parameters shared by both ends
pub mod link {
    /// Service UUID advertised by the peer's Serial Port Profile record
    pub const SERVICE_UUID: &str = "94f39d29-7d6d-437d-973b-fba39e49d4ee";

    /// Service name advertised alongside the UUID
    pub const SERVICE_NAME: &str = "btlink";

    /// Default RFCOMM channel
    pub const DEFAULT_RFCOMM_CHANNEL: u8 = 1;

    /// Largest chunk handed to the listener per read
    pub const READ_BUFFER_SIZE: usize = 1024;

    /// Upper bound on a single outbound connection attempt
    pub const CONNECT_TIMEOUT_MS: u64 = 10_000;

    /// Maximum length of a peer id
    pub const MAX_PEER_ID_LEN: usize = 64;
}

/// Connection state of the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Doing nothing
    #[default]
    None,
    /// Waiting for a peer to connect in
    Listening,
    /// Outbound attempt in flight
    Connecting,
    /// Stream open to a peer
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::None => write!(f, "NONE"),
            ConnectionState::Listening => write!(f, "LISTENING"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
        }
    }
}

/// Stable address of a remote device.
///
/// Accepts Bluetooth MAC addresses (`AA:BB:CC:DD:EE:FF`) as well as the
/// `host:port` form used by the TCP simulation transport, including
/// bracketed IPv6 hosts. Anything outside ASCII alphanumerics and
/// `:` `.` `_` `-` `[` `]` is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerId(String);

impl PeerId {
    /// Validate and wrap a peer address
    pub fn parse(s: &str) -> Result<Self, LinkError> {
        if s.is_empty() {
            return Err(LinkError::ConnectFailed("empty peer address".into()));
        }
        if s.len() > link::MAX_PEER_ID_LEN {
            return Err(LinkError::ConnectFailed(format!(
                "peer address longer than {} characters",
                link::MAX_PEER_ID_LEN
            )));
        }
        let allowed = |c: char| {
            c.is_ascii_alphanumeric() || matches!(c, ':' | '.' | '_' | '-' | '[' | ']')
        };
        if let Some(c) = s.chars().find(|c| !allowed(*c)) {
            return Err(LinkError::ConnectFailed(format!(
                "invalid character {:?} in peer address {:?}",
                c, s
            )));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for PeerId {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A peer as seen once a stream is open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Address the stream is bound to
    pub id: PeerId,
    /// Human-readable device name, if the transport could resolve one
    pub name: Option<String>,
}

impl PeerIdentity {
    /// Identity without a resolved name
    pub fn new(id: PeerId) -> Self {
        Self { id, name: None }
    }

    /// Identity with a resolved device name
    pub fn named(id: PeerId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: Some(name.into()),
        }
    }

    /// Name if known, otherwise the address
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.id.as_str())
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_accepts_addresses() {
        assert!(PeerId::parse("AA:BB:CC:DD:EE:FF").is_ok());
        assert!(PeerId::parse("AA:BB").is_ok());
        assert!(PeerId::parse("127.0.0.1:9000").is_ok());
        assert!(PeerId::parse("[::1]:9000").is_ok());
        assert!(PeerId::parse("piano-node_1").is_ok());
    }

    #[test]
    fn test_peer_id_rejects_malformed() {
        assert!(matches!(PeerId::parse(""), Err(LinkError::ConnectFailed(_))));
        assert!(PeerId::parse(" have been paired").is_err());
        assert!(PeerId::parse("AA BB").is_err());
        assert!(PeerId::parse(&"A".repeat(link::MAX_PEER_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_identity_display() {
        let id = PeerId::parse("AA:BB").unwrap();
        assert_eq!(PeerIdentity::new(id.clone()).to_string(), "AA:BB");
        assert_eq!(PeerIdentity::named(id.clone(), "piano").to_string(), "piano (AA:BB)");
        assert_eq!(PeerIdentity::new(id).display_name(), "AA:BB");
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::default(), ConnectionState::None);
        assert_eq!(ConnectionState::Connected.to_string(), "CONNECTED");
    }
}
