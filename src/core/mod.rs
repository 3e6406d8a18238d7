//! Core types and traits for the Tuya local protocol
//!
//! This module contains the fundamental building blocks used throughout the library.

pub mod error;
pub mod types;
pub mod serde;

pub use self::error::{Error, Result};
pub use self::types::{
    ConnectionConfig,
    DiscoveryConfig,
    ProtocolVersion,
};

/// Default TCP port devices listen on
pub const DEFAULT_PORT: u16 = 6668;

/// UDP port of plaintext discovery broadcasts (protocol 3.1)
pub const DISCOVERY_PORT: u16 = 6666;

/// UDP port of encrypted discovery broadcasts (protocol 3.3 and later)
pub const DISCOVERY_PORT_ENCRYPTED: u16 = 6667;

/// Length of device keys, nonces and session keys in bytes
pub const KEY_SIZE: usize = 16;

/// Interval between heartbeats when nothing else is written, in seconds
pub const HEARTBEAT_INTERVAL_SECS: u64 = 10;

/// Time without any received data before a connection is considered dead, in seconds
pub const CONNECTION_TIMEOUT_SECS: u64 = 60;

/// Heartbeats that may go unanswered before the connection is closed
pub const MAX_MISSED_HEARTBEATS: u32 = 3;
