//! Utility module
//!
//! This module provides common utilities and helper functions used
//! throughout the library.

use tracing::Level;

use crate::core::{Error, Result};

/// Current time as unix seconds, as carried in the `t` field of payloads
pub fn unix_seconds() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Installs a global `tracing` subscriber printing to stdout
pub fn init_logging(max_level: Level) -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(max_level)
        .with_target(false)
        .try_init()
        .map_err(|e| Error::config(format!("Failed to initialise logging: {}", e)))
}

/// Formats a byte slice as space separated hex octets for log output
pub fn hex_dump(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Routes log output of the current test through the test harness
#[cfg(test)]
pub(crate) fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(Level::TRACE)
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_seconds() {
        let now = unix_seconds();
        // after 2020-01-01
        assert!(now > 1_577_836_800);
    }

    #[test]
    fn test_hex_dump() {
        assert_eq!(hex_dump(&[0x00, 0x55, 0xaa]), "00 55 aa");
        assert_eq!(hex_dump(&[]), "");
    }

    #[test]
    fn test_init_logging_twice() {
        init_test_logging();
        // a subscriber is already installed
        assert!(init_logging(Level::INFO).is_err());
    }
}
