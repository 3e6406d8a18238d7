use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Serialize, Deserialize};

use super::{Error, Result, KEY_SIZE};

/// Length of the zero padded version header embedded in payloads
pub const VERSION_HEADER_LEN: usize = 15;

/// Local protocol version spoken by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    #[serde(rename = "3.1")]
    V3_1,
    #[serde(rename = "3.3")]
    V3_3,
    #[serde(rename = "3.4")]
    V3_4,
}

impl ProtocolVersion {
    /// Returns the version string as it appears on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolVersion::V3_1 => "3.1",
            ProtocolVersion::V3_3 => "3.3",
            ProtocolVersion::V3_4 => "3.4",
        }
    }

    /// Returns the ASCII version bytes without padding
    pub fn as_bytes(&self) -> &'static [u8] {
        self.as_str().as_bytes()
    }

    /// Returns the 15 byte version header (ASCII version, zero padded)
    pub fn header(&self) -> [u8; VERSION_HEADER_LEN] {
        let mut header = [0u8; VERSION_HEADER_LEN];
        header[..3].copy_from_slice(self.as_bytes());
        header
    }

    /// Whether frames are authenticated with HMAC-SHA256 instead of CRC32
    pub fn uses_hmac(&self) -> bool {
        matches!(self, ProtocolVersion::V3_4)
    }

    /// Whether the connection negotiates a session key before exchanging data
    pub fn requires_session_key(&self) -> bool {
        matches!(self, ProtocolVersion::V3_4)
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        ProtocolVersion::V3_3
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "3.1" | "31" => Ok(ProtocolVersion::V3_1),
            "3.3" | "33" => Ok(ProtocolVersion::V3_3),
            "3.4" | "34" => Ok(ProtocolVersion::V3_4),
            other => Err(Error::config(format!("unsupported protocol version '{}'", other))),
        }
    }
}

/// Configuration for a single device connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Device id (also called gwId / devId)
    pub device_id: String,
    /// Local key shared with the device
    #[serde(serialize_with = "super::serde::serialize_key")]
    #[serde(deserialize_with = "super::serde::deserialize_key")]
    pub device_key: [u8; KEY_SIZE],
    /// Protocol version spoken by the device
    #[serde(default)]
    pub protocol_version: ProtocolVersion,
    /// Device IP address or host name
    pub address: String,
    /// Device TCP port
    pub port: u16,
    /// Timeout for establishing the TCP connection
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub connect_timeout: Duration,
    /// Close the connection when nothing was received for this long
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub read_idle_timeout: Duration,
    /// Send a heartbeat when nothing was written for this long
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub write_idle_timeout: Duration,
    /// Unanswered heartbeats tolerated before closing the connection
    pub max_missed_heartbeats: u32,
}

impl ConnectionConfig {
    /// Creates a configuration with default timeouts
    pub fn new(
        device_id: impl Into<String>,
        local_key: &str,
        address: impl Into<String>,
        protocol_version: ProtocolVersion,
    ) -> Result<Self> {
        let device_key = super::serde::parse_key(local_key).map_err(Error::config)?;
        let config = ConnectionConfig {
            device_id: device_id.into(),
            device_key,
            protocol_version,
            address: address.into(),
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the parameters a connection cannot be built without
    pub fn validate(&self) -> Result<()> {
        if self.device_id.trim().is_empty() {
            return Err(Error::config("device id must not be empty"));
        }
        if self.device_key.iter().all(|b| *b == 0) {
            return Err(Error::config("device key is missing"));
        }
        if self.address.trim().is_empty() {
            return Err(Error::config("device address must not be empty"));
        }
        if self.read_idle_timeout.is_zero() || self.write_idle_timeout.is_zero() {
            return Err(Error::config("idle timeouts must be greater than zero"));
        }
        Ok(())
    }

    /// Returns `address:port` for connecting
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            device_id: String::new(),
            device_key: [0u8; KEY_SIZE],
            protocol_version: ProtocolVersion::default(),
            address: String::new(),
            port: super::DEFAULT_PORT,
            connect_timeout: Duration::from_secs(2),
            read_idle_timeout: Duration::from_secs(super::CONNECTION_TIMEOUT_SECS),
            write_idle_timeout: Duration::from_secs(super::HEARTBEAT_INTERVAL_SECS),
            max_missed_heartbeats: super::MAX_MISSED_HEARTBEATS,
        }
    }
}

/// Configuration for the UDP discovery listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Local address to bind the broadcast sockets to
    pub bind_addr: Ipv4Addr,
    /// Port of plaintext broadcasts
    pub port: u16,
    /// Port of encrypted broadcasts
    pub encrypted_port: u16,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            bind_addr: Ipv4Addr::UNSPECIFIED,
            port: super::DISCOVERY_PORT,
            encrypted_port: super::DISCOVERY_PORT_ENCRYPTED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parsing() {
        assert_eq!("3.1".parse::<ProtocolVersion>().unwrap(), ProtocolVersion::V3_1);
        assert_eq!("33".parse::<ProtocolVersion>().unwrap(), ProtocolVersion::V3_3);
        assert_eq!(" 3.4 ".parse::<ProtocolVersion>().unwrap(), ProtocolVersion::V3_4);
        assert!("3.5".parse::<ProtocolVersion>().is_err());
        assert_eq!(ProtocolVersion::V3_4.to_string(), "3.4");
    }

    #[test]
    fn test_version_header() {
        let header = ProtocolVersion::V3_3.header();
        assert_eq!(&header[..3], b"3.3");
        assert!(header[3..].iter().all(|b| *b == 0));
        assert!(ProtocolVersion::V3_4.uses_hmac());
        assert!(!ProtocolVersion::V3_1.uses_hmac());
    }

    #[test]
    fn test_version_serde() {
        let json = serde_json::to_string(&ProtocolVersion::V3_4).unwrap();
        assert_eq!(json, "\"3.4\"");
        let version: ProtocolVersion = serde_json::from_str("\"3.1\"").unwrap();
        assert_eq!(version, ProtocolVersion::V3_1);
    }

    #[test]
    fn test_connection_config_validation() {
        let config = ConnectionConfig::new("bf0123", "0123456789abcdef", "192.168.1.20", ProtocolVersion::V3_3)
            .unwrap();
        assert_eq!(config.port, crate::core::DEFAULT_PORT);
        assert_eq!(config.socket_addr(), "192.168.1.20:6668");
        assert_eq!(config.max_missed_heartbeats, 3);

        assert!(ConnectionConfig::new("", "0123456789abcdef", "10.0.0.1", ProtocolVersion::V3_3).is_err());
        assert!(ConnectionConfig::new("bf0123", "short", "10.0.0.1", ProtocolVersion::V3_3).is_err());
        assert!(ConnectionConfig::new("bf0123", "0123456789abcdef", " ", ProtocolVersion::V3_3).is_err());

        let mut config = config;
        config.write_idle_timeout = Duration::ZERO;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        assert!(ConnectionConfig::default().validate().is_err());
    }

    #[test]
    fn test_connection_config_from_json() {
        let config: ConnectionConfig = serde_json::from_str(
            r#"{
                "device_id": "bf0123",
                "device_key": "0123456789abcdef",
                "protocol_version": "3.4",
                "address": "10.0.0.5",
                "port": 6668,
                "connect_timeout": 2.0,
                "read_idle_timeout": 60.0,
                "write_idle_timeout": 10.0,
                "max_missed_heartbeats": 3
            }"#,
        )
        .unwrap();
        assert_eq!(config.protocol_version, ProtocolVersion::V3_4);
        assert_eq!(&config.device_key, b"0123456789abcdef");
        assert_eq!(config.write_idle_timeout, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }
}
