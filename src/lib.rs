//! Tuya local: protocol engine for Tuya devices on the local network
//!
//! This library implements the framed, encrypted TCP/UDP protocol spoken by Tuya
//! devices (protocol versions 3.1, 3.3 and 3.4): the frame codec, the 3.4 session
//! key negotiation, heartbeat based liveness and UDP broadcast discovery.
pub mod core;
pub mod crypto;
pub mod network;
pub mod protocol;
pub mod util;

// Re-export commonly used items
pub use core::{ConnectionConfig, DiscoveryConfig, Error, ProtocolVersion, Result};
pub use network::{
    DeviceConnection, DeviceHandle, DeviceInfo, DeviceInfoSubscriber, DeviceRegistry,
    DeviceStatusListener, DiscoveryListener,
};
pub use protocol::{CommandType, Message, Payload, TuyaCodec};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
