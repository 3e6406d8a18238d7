//! Protocol implementation module
//!
//! This module defines the Tuya local protocol messages, the frame codec
//! and the protocol 3.4 session key negotiation state machine.

pub mod codec;
pub mod message;
pub mod state;

pub use self::codec::TuyaCodec;
pub use self::message::{CommandType, DiscoveryMessage, Message, Payload, StatusData, StatusPayload};
pub use self::state::{NegotiationOutcome, NegotiationState, SessionNegotiator};

// Constants
/// Frame prefix
pub const PREFIX: u32 = 0x0000_55AA;

/// Frame suffix
pub const SUFFIX: u32 = 0x0000_AA55;

/// Prefix, sequence number, command code and length
pub const HEADER_SIZE: usize = 16;

/// Smallest possible frame: header, CRC and suffix
pub const MIN_FRAME_SIZE: usize = 24;

/// Largest payload length accepted from the wire
pub const MAX_PAYLOAD_LENGTH: usize = 0x10000;

/// Consecutive malformed frames tolerated before the stream is abandoned
pub const MAX_FRAMING_ERRORS: u32 = 3;
