use tracing::{debug, warn};

use crate::core::{Error, Result, KEY_SIZE};
use crate::crypto::{self, KeyStore, HMAC_SIZE};
use super::message::{CommandType, Message};

/// State of the protocol 3.4 session key negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// Nothing sent yet
    Idle,

    /// SESS_KEY_NEG_START sent, waiting for the device's nonce
    AwaitingResponse,

    /// Session key derived and FINISH produced
    Negotiated,

    /// The device failed to prove knowledge of the device key
    Failed,
}

/// Result of a successful negotiation
#[derive(Debug, Clone)]
pub struct NegotiationOutcome {
    /// SESS_KEY_NEG_FINISH message; must go out under the device key
    pub finish: Message,
    /// Key to install once FINISH has been written
    pub session_key: [u8; KEY_SIZE],
}

/// Drives the three-step session key handshake of protocol 3.4.
///
/// The negotiator only produces messages and keys. Sending them and
/// installing the session key in the codec is left to the connection, which
/// has to write FINISH before switching keys.
#[derive(Debug)]
pub struct SessionNegotiator {
    device_id: String,
    state: NegotiationState,
}

impl SessionNegotiator {
    /// Creates an idle negotiator
    pub fn new(device_id: impl Into<String>) -> Self {
        SessionNegotiator {
            device_id: device_id.into(),
            state: NegotiationState::Idle,
        }
    }

    /// Current negotiation state
    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Whether a session key has been derived
    pub fn is_negotiated(&self) -> bool {
        self.state == NegotiationState::Negotiated
    }

    /// Picks a fresh local nonce and returns the SESS_KEY_NEG_START message
    pub fn start(&mut self, keys: &mut KeyStore) -> Result<Message> {
        if matches!(self.state, NegotiationState::AwaitingResponse | NegotiationState::Negotiated) {
            return Err(Error::invalid_state(format!(
                "negotiation already in state {:?}",
                self.state
            )));
        }

        let nonce = keys.regenerate_random();
        self.state = NegotiationState::AwaitingResponse;
        debug!("{}: Starting session key negotiation", self.device_id);
        Ok(Message::raw(CommandType::SessKeyNegStart, nonce.to_vec()))
    }

    /// Handles the decrypted SESS_KEY_NEG_RESPONSE payload.
    ///
    /// The payload carries the device nonce followed by
    /// HMAC-SHA256(local nonce) keyed with the device key. A response
    /// arriving while no negotiation is pending is ignored and yields `None`.
    pub fn handle_response(&mut self, payload: &[u8], keys: &KeyStore) -> Result<Option<NegotiationOutcome>> {
        if self.state != NegotiationState::AwaitingResponse {
            warn!(
                "{}: Received SESS_KEY_NEG_RESPONSE in invalid state {:?}, ignoring",
                self.device_id, self.state
            );
            return Ok(None);
        }

        if payload.len() < KEY_SIZE + HMAC_SIZE {
            self.state = NegotiationState::Failed;
            return Err(Error::negotiation(format!(
                "response too short: {} bytes",
                payload.len()
            )));
        }

        let mut remote_nonce = [0u8; KEY_SIZE];
        remote_nonce.copy_from_slice(&payload[..KEY_SIZE]);
        let proof = &payload[KEY_SIZE..KEY_SIZE + HMAC_SIZE];

        let device_key = keys.device_key();
        if !crypto::verify_hmac_sha256(keys.random(), device_key, proof) {
            warn!("{}: Negotiation failed, device HMAC does not match", self.device_id);
            self.state = NegotiationState::Failed;
            return Err(Error::negotiation("device HMAC does not match local nonce"));
        }

        let finish = Message::raw(
            CommandType::SessKeyNegFinish,
            crypto::hmac_sha256(&remote_nonce, device_key).to_vec(),
        );
        let session_key = match crypto::derive_session_key(keys.random(), &remote_nonce, device_key) {
            Ok(key) => key,
            Err(e) => {
                self.state = NegotiationState::Failed;
                return Err(e);
            }
        };

        self.state = NegotiationState::Negotiated;
        debug!("{}: Session key negotiated", self.device_id);
        Ok(Some(NegotiationOutcome { finish, session_key }))
    }

    /// Returns to idle (on disconnect)
    pub fn reset(&mut self) {
        self.state = NegotiationState::Idle;
    }
}
