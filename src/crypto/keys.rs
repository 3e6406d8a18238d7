//! Per-connection key material.

use std::fmt;

use crate::core::{ProtocolVersion, KEY_SIZE};

/// Key material of one device connection.
///
/// Owned by exactly one connection (inside its codec); never shared.
#[derive(Clone)]
pub struct KeyStore {
    device_key: [u8; KEY_SIZE],
    random: [u8; KEY_SIZE],
    session_key: Option<[u8; KEY_SIZE]>,
}

impl KeyStore {
    /// Create a key store for the given device key with a fresh nonce.
    pub fn new(device_key: [u8; KEY_SIZE]) -> Self {
        Self {
            device_key,
            random: super::random_bytes(),
            session_key: None,
        }
    }

    /// The pre-shared device key.
    pub fn device_key(&self) -> &[u8; KEY_SIZE] {
        &self.device_key
    }

    /// The local nonce of the current negotiation attempt.
    pub fn random(&self) -> &[u8; KEY_SIZE] {
        &self.random
    }

    /// The negotiated session key, if any.
    pub fn session_key(&self) -> Option<&[u8; KEY_SIZE]> {
        self.session_key.as_ref()
    }

    /// Generate a new local nonce for a negotiation attempt.
    pub fn regenerate_random(&mut self) -> [u8; KEY_SIZE] {
        self.random = super::random_bytes();
        self.random
    }

    /// Install the negotiated session key.
    pub fn set_session_key(&mut self, key: [u8; KEY_SIZE]) {
        self.session_key = Some(key);
    }

    /// Forget the session key and pick a new nonce (on disconnect).
    pub fn reset(&mut self) {
        self.session_key = None;
        self.random = super::random_bytes();
    }

    /// Key protecting frames for `version`.
    ///
    /// Protocol 3.4 uses the session key once negotiated and the device key
    /// during the handshake. Older versions always use the device key.
    pub fn active_key(&self, version: ProtocolVersion) -> &[u8; KEY_SIZE] {
        match (version, &self.session_key) {
            (ProtocolVersion::V3_4, Some(key)) => key,
            _ => &self.device_key,
        }
    }
}

impl fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyStore")
            .field("negotiated", &self.session_key.is_some())
            .finish_non_exhaustive()
    }
}
