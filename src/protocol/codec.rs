use bytes::{Buf, BufMut, BytesMut};
use serde_json::{Map, Value};
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace, warn};

use crate::core::{Error, ProtocolVersion, Result, KEY_SIZE};
use crate::core::types::VERSION_HEADER_LEN;
use crate::crypto::{self, KeyStore, HMAC_SIZE};
use crate::util;
use super::message::{CommandType, DiscoveryMessage, Message, Payload, StatusPayload};
use super::{HEADER_SIZE, MAX_FRAMING_ERRORS, MAX_PAYLOAD_LENGTH, MIN_FRAME_SIZE, PREFIX, SUFFIX};

/// Reply of devices that do not support DP_QUERY.
const DP_QUERY_UNSUPPORTED: &str = "json obj data unvalid";

/// Length of the MD5 signature following the version in protocol 3.1 payloads.
const V31_SIGNATURE_LEN: usize = 16;

/// Outcome of a single decode attempt.
enum Frame {
    /// Not enough bytes buffered; nothing consumed.
    Incomplete,
    /// A frame was consumed but discarded.
    Dropped,
    /// The stream is out of sync; some bytes were discarded.
    Malformed(String),
    /// A frame was decoded.
    Message(Message),
}

/// Codec translating between Tuya frames and [`Message`]s for one connection.
///
/// Owns the connection's key material and sequence counter.
pub struct TuyaCodec {
    device_id: String,
    version: ProtocolVersion,
    keys: KeyStore,
    sequence: u32,
    framing_errors: u32,
    last_received: Option<Instant>,
}

impl TuyaCodec {
    /// Creates a codec for a device
    pub fn new(device_id: impl Into<String>, device_key: [u8; KEY_SIZE], version: ProtocolVersion) -> Self {
        Self::with_key_store(device_id, KeyStore::new(device_key), version)
    }

    /// Creates a codec around existing key material
    pub fn with_key_store(device_id: impl Into<String>, keys: KeyStore, version: ProtocolVersion) -> Self {
        TuyaCodec {
            device_id: device_id.into(),
            version,
            keys,
            sequence: 0,
            framing_errors: 0,
            last_received: None,
        }
    }

    /// Protocol version of the connection
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Device id used in outgoing envelopes
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Sequence number of the last encoded frame
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// When the last complete frame was read, whether or not it was usable
    pub fn last_received(&self) -> Option<Instant> {
        self.last_received
    }

    /// Key material of the connection
    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    /// Mutable key material of the connection
    pub fn keys_mut(&mut self) -> &mut KeyStore {
        &mut self.keys
    }

    fn decode_frame(&mut self, src: &mut BytesMut) -> Frame {
        if src.len() < MIN_FRAME_SIZE {
            return Frame::Incomplete;
        }

        let prefix = read_u32(&src[0..4]);
        if prefix != PREFIX {
            let skip = resync(src, 1);
            return Frame::Malformed(format!("invalid prefix {:08x}, skipped {} bytes", prefix, skip));
        }

        let sequence = read_u32(&src[4..8]);
        let code = read_u32(&src[8..12]);
        let payload_length = read_u32(&src[12..16]) as usize;
        let command = CommandType::from_code(code);
        let uses_hmac = self.uses_hmac(command);
        let trailer = trailer_len(uses_hmac);

        if payload_length < trailer || payload_length > MAX_PAYLOAD_LENGTH {
            let skip = resync(src, 4);
            return Frame::Malformed(format!(
                "invalid payload length {}, skipped {} bytes",
                payload_length, skip
            ));
        }

        let frame_len = HEADER_SIZE + payload_length;
        if src.len() < frame_len {
            trace!("{}: Did not receive enough bytes ({} of {}), waiting", self.device_id, src.len(), frame_len);
            src.reserve(frame_len - src.len());
            return Frame::Incomplete;
        }

        let frame = src.split_to(frame_len);
        self.last_received = Some(Instant::now());
        trace!("{}: Received encoded '{}'", self.device_id, util::hex_dump(&frame));

        let suffix = read_u32(&frame[frame_len - 4..]);
        if suffix != SUFFIX {
            return Frame::Malformed(format!("invalid suffix {:08x}", suffix));
        }

        let body_end = frame_len - trailer;
        if !self.verify_integrity(&frame, body_end, uses_hmac) {
            return Frame::Dropped;
        }

        let Some(command) = command else {
            warn!("{}: Dropping frame with unknown command code {:#04x}", self.device_id, code);
            return Frame::Dropped;
        };

        let mut body = &frame[HEADER_SIZE..body_end];
        let mut return_code = None;
        if body.len() >= 4 && read_u32(&body[..4]) & 0xffff_ff00 == 0 {
            return_code = Some(read_u32(&body[..4]));
            body = &body[4..];
        }

        match self.open_payload(command, body).and_then(|plain| self.interpret(command, plain)) {
            Ok(message) => {
                debug!(
                    "{}: Received {} (seq {}, return code {:?})",
                    self.device_id, message.command, sequence, return_code
                );
                Frame::Message(message)
            }
            Err(e) => {
                warn!("{}: Dropping {} frame: {}", self.device_id, command, e);
                Frame::Dropped
            }
        }
    }

    fn uses_hmac(&self, command: Option<CommandType>) -> bool {
        self.version.uses_hmac() && !matches!(command, Some(CommandType::Udp | CommandType::UdpNew))
    }

    fn verify_integrity(&self, frame: &[u8], body_end: usize, uses_hmac: bool) -> bool {
        if uses_hmac {
            let key = self.keys.active_key(self.version);
            let tag = &frame[body_end..body_end + HMAC_SIZE];
            if !crypto::verify_hmac_sha256(&frame[..body_end], key, tag) {
                warn!(
                    "{}: Checksum failed for message: calculated {}, found {}",
                    self.device_id,
                    hex::encode(crypto::hmac_sha256(&frame[..body_end], key)),
                    hex::encode(tag)
                );
                return false;
            }
        } else {
            let found = read_u32(&frame[body_end..body_end + 4]);
            let calculated = crypto::crc32(&frame[..body_end]);
            if calculated != found {
                warn!(
                    "{}: Checksum failed for message: calculated {:08x}, found {:08x}",
                    self.device_id, calculated, found
                );
                return false;
            }
        }
        true
    }

    /// Removes version headers and decrypts the payload.
    fn open_payload(&self, command: CommandType, body: &[u8]) -> Result<Vec<u8>> {
        if command == CommandType::Udp {
            return Ok(body.to_vec());
        }

        match self.version {
            ProtocolVersion::V3_4 => {
                let key = self.keys.active_key(self.version);
                let mut plain = crypto::decrypt_aes_ecb(body, key, true)?;
                if plain.starts_with(self.version.as_bytes()) && plain.len() >= VERSION_HEADER_LEN {
                    plain.drain(..VERSION_HEADER_LEN);
                }
                Ok(plain)
            }
            ProtocolVersion::V3_3 => {
                let cipher = if body.starts_with(self.version.as_bytes()) && body.len() >= VERSION_HEADER_LEN {
                    &body[VERSION_HEADER_LEN..]
                } else {
                    body
                };
                crypto::decrypt_aes_ecb(cipher, self.keys.device_key(), true)
            }
            ProtocolVersion::V3_1 => {
                if body.starts_with(self.version.as_bytes()) {
                    let start = self.version.as_bytes().len() + V31_SIGNATURE_LEN;
                    if body.len() < start {
                        return Err(Error::protocol("truncated 3.1 payload"));
                    }
                    let cipher = crypto::base64_decode(&body[start..])?;
                    crypto::decrypt_aes_ecb(&cipher, self.keys.device_key(), true)
                } else if body.first() == Some(&b'{') || body.is_empty() {
                    // 3.1 devices answer unencrypted apart from CONTROL
                    Ok(body.to_vec())
                } else {
                    crypto::decrypt_aes_ecb(body, self.keys.device_key(), true)
                }
            }
        }
    }

    /// Turns decrypted bytes into a typed message.
    fn interpret(&self, command: CommandType, plain: Vec<u8>) -> Result<Message> {
        trace!("{}: Decoded raw payload: {}", self.device_id, hex::encode(&plain));

        match command {
            CommandType::DpQuery | CommandType::Status => {
                let text = payload_text(&plain)?;
                if command == CommandType::DpQuery && text == DP_QUERY_UNSUPPORTED {
                    debug!("{}: DP_QUERY not supported by device", self.device_id);
                    return Ok(Message::new(CommandType::DpQueryNotSupported, Payload::empty()));
                }
                let status: StatusPayload = serde_json::from_str(text)?;
                Ok(Message::new(command, Payload::Status(status)))
            }
            CommandType::Udp | CommandType::UdpNew | CommandType::BroadcastLpv34 => {
                let discovery: DiscoveryMessage = serde_json::from_str(payload_text(&plain)?)?;
                Ok(Message::new(command, Payload::Discovery(discovery)))
            }
            _ => Ok(Message::raw(command, plain)),
        }
    }

    /// Serializes the message content, wrapping maps into the device envelope.
    fn payload_bytes(&self, message: &Message) -> Result<Vec<u8>> {
        match &message.payload {
            Payload::Map(content) => {
                let envelope = self.envelope(content.clone(), util::unix_seconds());
                debug!("{}: Sending {}, payload {}", self.device_id, message.command, envelope);
                Ok(serde_json::to_vec(&envelope)?)
            }
            Payload::Raw(bytes) => {
                debug!("{}: Sending {}, payload {}", self.device_id, message.command, hex::encode(bytes));
                Ok(bytes.clone())
            }
            Payload::Status(status) => Ok(serde_json::to_vec(status)?),
            Payload::Discovery(discovery) => Ok(serde_json::to_vec(discovery)?),
        }
    }

    fn envelope(&self, content: Map<String, Value>, timestamp: i64) -> Value {
        let mut payload = Map::new();
        if self.version == ProtocolVersion::V3_4 {
            let mut data = Map::new();
            data.insert("cid".to_string(), Value::from(self.device_id.clone()));
            data.insert("ctype".to_string(), Value::from(0));
            data.extend(content);
            payload.insert("protocol".to_string(), Value::from(5));
            payload.insert("t".to_string(), Value::from(timestamp));
            payload.insert("data".to_string(), Value::Object(data));
        } else {
            payload.insert("devId".to_string(), Value::from(self.device_id.clone()));
            payload.insert("gwId".to_string(), Value::from(self.device_id.clone()));
            payload.insert("uid".to_string(), Value::from(self.device_id.clone()));
            payload.insert("t".to_string(), Value::from(timestamp));
            payload.extend(content);
        }
        Value::Object(payload)
    }

    fn encode_pre34(
        &self,
        command: CommandType,
        code: u32,
        sequence: u32,
        payload: Vec<u8>,
        dst: &mut BytesMut,
    ) -> Result<()> {
        let device_key = self.keys.device_key();
        let payload = match self.version {
            ProtocolVersion::V3_3 => {
                let encrypted = crypto::encrypt_aes_ecb(&payload, device_key, true)?;
                if command.omits_v33_header() {
                    encrypted
                } else {
                    let mut with_header = self.version.header().to_vec();
                    with_header.extend_from_slice(&encrypted);
                    with_header
                }
            }
            _ if command == CommandType::Control => {
                let encrypted = crypto::encrypt_aes_ecb(&payload, device_key, true)?;
                let encoded = crypto::base64_encode(&encrypted);
                let hash = crypto::md5_hex(
                    format!(
                        "data={}||lpv={}||{}",
                        encoded,
                        self.version,
                        String::from_utf8_lossy(device_key)
                    )
                    .as_bytes(),
                );
                format!("{}{}{}", self.version, &hash[8..24], encoded).into_bytes()
            }
            _ => payload,
        };

        let start = dst.len();
        dst.reserve(payload.len() + MIN_FRAME_SIZE);
        dst.put_u32(PREFIX);
        dst.put_u32(sequence);
        dst.put_u32(code);
        dst.put_u32((payload.len() + 8) as u32);
        dst.extend_from_slice(&payload);
        let crc = crypto::crc32(&dst[start..]);
        dst.put_u32(crc);
        dst.put_u32(SUFFIX);
        Ok(())
    }

    fn encode_v34(
        &self,
        command: CommandType,
        code: u32,
        sequence: u32,
        payload: Vec<u8>,
        dst: &mut BytesMut,
    ) -> Result<()> {
        let raw = if command.omits_v34_header() {
            payload
        } else {
            let mut with_header = self.version.header().to_vec();
            with_header.extend_from_slice(&payload);
            with_header
        };

        let key = self.keys.active_key(self.version);
        let encrypted = crypto::encrypt_aes_ecb(&crypto::pkcs7_pad(&raw), key, false)?;

        let start = dst.len();
        dst.reserve(encrypted.len() + HEADER_SIZE + HMAC_SIZE + 4);
        dst.put_u32(PREFIX);
        dst.put_u32(sequence);
        dst.put_u32(code);
        dst.put_u32((encrypted.len() + 0x24) as u32);
        dst.extend_from_slice(&encrypted);
        let hmac = crypto::hmac_sha256(&dst[start..], key);
        dst.extend_from_slice(&hmac);
        dst.put_u32(SUFFIX);
        Ok(())
    }
}

impl Decoder for TuyaCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match self.decode_frame(src) {
                Frame::Incomplete => return Ok(None),
                Frame::Message(message) => {
                    self.framing_errors = 0;
                    return Ok(Some(message));
                }
                Frame::Dropped => {
                    self.framing_errors = 0;
                }
                Frame::Malformed(reason) => {
                    self.framing_errors += 1;
                    warn!("{}: Decoding failed: {}", self.device_id, reason);
                    if self.framing_errors > MAX_FRAMING_ERRORS {
                        return Err(Error::protocol(format!(
                            "{} consecutive malformed frames",
                            self.framing_errors
                        )));
                    }
                }
            }
        }
    }
}

impl Encoder<Message> for TuyaCodec {
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let code = item
            .command
            .code()
            .ok_or_else(|| Error::protocol(format!("{} cannot be sent", item.command)))?;
        let payload = self.payload_bytes(&item)?;
        let sequence = self.sequence.wrapping_add(1);

        let start = dst.len();
        match self.version {
            ProtocolVersion::V3_4 => self.encode_v34(item.command, code, sequence, payload, dst)?,
            _ => self.encode_pre34(item.command, code, sequence, payload, dst)?,
        }
        self.sequence = sequence;

        trace!("{}: Sending encoded '{}'", self.device_id, util::hex_dump(&dst[start..]));
        Ok(())
    }
}

/// Discards bytes up to the next prefix at or after `from`, keeping a possible partial prefix.
fn resync(src: &mut BytesMut, from: usize) -> usize {
    let skip = src[from..]
        .windows(4)
        .position(|w| w == PREFIX.to_be_bytes().as_slice())
        .map(|pos| pos + from)
        .unwrap_or(src.len() - 3);
    src.advance(skip);
    skip
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn trailer_len(uses_hmac: bool) -> usize {
    if uses_hmac { HMAC_SIZE + 4 } else { 8 }
}

/// UTF-8 text of a payload without surrounding whitespace or padding bytes.
fn payload_text(plain: &[u8]) -> Result<&str> {
    let text = std::str::from_utf8(plain)
        .map_err(|e| Error::protocol(format!("payload is not UTF-8: {}", e)))?;
    Ok(text.trim_matches(|c: char| c.is_whitespace() || c.is_control()))
}
