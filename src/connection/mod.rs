//! Connection management for a single-peer serial link
//!
//! This module handles:
//! - The connection state machine and its single "current connection" slot
//! - Outbound attempts with cancellation of superseded attempts
//! - Listening for inbound peers as a fallback path
//! - The read/write pump for the live stream

mod attempt;
mod manager;
mod pump;


pub use manager::{ConnectionEvent, ConnectionManager, EventReceiver, LinkConfig};
