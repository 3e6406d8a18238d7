//! Network management and device communication module
//!
//! This module handles device TCP connections, heartbeat based liveness,
//! message routing and UDP broadcast discovery.

mod connection;
mod discovery;
pub mod dispatch;
pub mod heartbeat;

pub use self::connection::{DeviceConnection, DeviceHandle, DEFAULT_REFRESH_DP_IDS};
pub use self::discovery::{DeviceInfo, DeviceRegistry, DiscoveryListener, SubscriptionId};
pub use self::heartbeat::{HeartbeatAction, HeartbeatMonitor};

use std::collections::HashMap;

use serde_json::Value;

/// Receives events of a single device connection.
///
/// Callbacks run on the connection task and should return quickly.
pub trait DeviceStatusListener: Send + Sync {
    /// Data points reported by the device; `cid` is set for gateway sub-devices
    fn on_device_status(&self, cid: Option<String>, dps: HashMap<u32, Value>);

    /// The transport to the device has been established
    fn on_connected(&self);

    /// The connection ended or could not be established
    fn on_disconnected(&self, reason: &str);
}

/// Receives changes of discovered device addresses and versions
pub trait DeviceInfoSubscriber: Send + Sync {
    fn on_device_info_changed(&self, device_id: &str, info: &DeviceInfo);
}
