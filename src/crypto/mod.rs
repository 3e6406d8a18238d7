//! Cryptographic primitives for the Tuya local protocol.
//!
//! This module provides:
//! - AES-128-ECB encryption with optional PKCS#7 padding
//! - HMAC-SHA256 frame authentication (protocol 3.4)
//! - CRC32 frame checksums (protocol 3.1/3.3)
//! - MD5 payload signatures (protocol 3.1)
//! - Session key derivation for the 3.4 handshake

mod keys;

pub use keys::KeyStore;

use aes::Aes128;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use base64::Engine;
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use rand::Rng;
use sha2::Sha256;

use crate::core::{Error, Result, KEY_SIZE};

type HmacSha256 = Hmac<Sha256>;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// HMAC-SHA256 output size in bytes.
pub const HMAC_SIZE: usize = 32;

/// Seed of the well-known key encrypting UDP discovery broadcasts.
const DISCOVERY_KEY_SEED: &[u8] = b"yGAdlopoPVldABfn";

/// Encrypt with AES-128 in ECB mode.
///
/// With `pad` the input is PKCS#7 padded first; without it the input must
/// already be a multiple of the block size.
pub fn encrypt_aes_ecb(data: &[u8], key: &[u8; KEY_SIZE], pad: bool) -> Result<Vec<u8>> {
    let mut buffer = if pad { pkcs7_pad(data) } else { data.to_vec() };
    if buffer.len() % BLOCK_SIZE != 0 {
        return Err(Error::crypto(format!(
            "plaintext length {} is not a multiple of {}",
            buffer.len(),
            BLOCK_SIZE
        )));
    }

    let cipher = Aes128::new(key.into());
    for chunk in buffer.chunks_mut(BLOCK_SIZE) {
        cipher.encrypt_block(chunk.into());
    }
    Ok(buffer)
}

/// Decrypt AES-128 in ECB mode.
///
/// With `unpad` a valid PKCS#7 padding is removed; invalid padding is left in place.
pub fn decrypt_aes_ecb(data: &[u8], key: &[u8; KEY_SIZE], unpad: bool) -> Result<Vec<u8>> {
    if data.len() % BLOCK_SIZE != 0 {
        return Err(Error::crypto(format!(
            "ciphertext length {} is not a multiple of {}",
            data.len(),
            BLOCK_SIZE
        )));
    }

    let cipher = Aes128::new(key.into());
    let mut buffer = data.to_vec();
    for chunk in buffer.chunks_mut(BLOCK_SIZE) {
        cipher.decrypt_block(chunk.into());
    }

    if unpad {
        let len = pkcs7_unpad(&buffer).len();
        buffer.truncate(len);
    }
    Ok(buffer)
}

/// Append PKCS#7 padding (always 1..=16 bytes).
pub fn pkcs7_pad(data: &[u8]) -> Vec<u8> {
    let padding = BLOCK_SIZE - data.len() % BLOCK_SIZE;
    let mut padded = Vec::with_capacity(data.len() + padding);
    padded.extend_from_slice(data);
    padded.resize(data.len() + padding, padding as u8);
    padded
}

/// Strip PKCS#7 padding if present and well formed.
pub fn pkcs7_unpad(data: &[u8]) -> &[u8] {
    let Some(&last) = data.last() else {
        return data;
    };
    let padding = last as usize;
    if padding == 0 || padding > BLOCK_SIZE || padding > data.len() {
        return data;
    }
    let (content, pad) = data.split_at(data.len() - padding);
    if pad.iter().all(|b| *b == last) {
        content
    } else {
        data
    }
}

/// Compute HMAC-SHA256 of `data` keyed with `key`.
pub fn hmac_sha256(data: &[u8], key: &[u8]) -> [u8; HMAC_SIZE] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Verify an HMAC-SHA256 tag in constant time.
pub fn verify_hmac_sha256(data: &[u8], key: &[u8], tag: &[u8]) -> bool {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.verify_slice(tag).is_ok()
}

/// Calculate the CRC32 checksum used by protocol 3.1/3.3 frames.
pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Lowercase hex MD5 digest.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Standard base64 encoding.
pub fn base64_encode(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// Standard base64 decoding.
pub fn base64_decode(data: &[u8]) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| Error::crypto(format!("invalid base64: {}", e)))
}

/// Generate random bytes for nonces.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill(&mut bytes[..]);
    bytes
}

/// Derive the protocol 3.4 session key.
///
/// The local and remote nonces are XOR-ed and the result is encrypted with the
/// device key (single AES block, no padding).
pub fn derive_session_key(
    local_nonce: &[u8; KEY_SIZE],
    remote_nonce: &[u8; KEY_SIZE],
    device_key: &[u8; KEY_SIZE],
) -> Result<[u8; KEY_SIZE]> {
    let mut mixed = [0u8; KEY_SIZE];
    for (i, byte) in mixed.iter_mut().enumerate() {
        *byte = local_nonce[i] ^ remote_nonce[i];
    }

    let encrypted = encrypt_aes_ecb(&mixed, device_key, false)?;
    encrypted
        .as_slice()
        .try_into()
        .map_err(|_| Error::crypto("derived session key has unexpected length"))
}

/// Key used by devices to encrypt UDP discovery broadcasts.
pub fn discovery_key() -> [u8; KEY_SIZE] {
    Md5::digest(DISCOVERY_KEY_SEED).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIPS_KEY: [u8; 16] = [
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07,
        0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
    ];

    #[test]
    fn test_aes_known_vector() {
        let plaintext = hex::decode("00112233445566778899aabbccddeeff").unwrap();
        let encrypted = encrypt_aes_ecb(&plaintext, &FIPS_KEY, false).unwrap();
        assert_eq!(hex::encode(&encrypted), "69c4e0d86a7b0430d8cdb78070b4c55a");

        let decrypted = decrypt_aes_ecb(&encrypted, &FIPS_KEY, false).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_aes_padding() {
        let key = *b"0123456789abcdef";
        let data = br#"{"dps":{"1":true}}"#;
        let encrypted = encrypt_aes_ecb(data, &key, true).unwrap();
        assert_eq!(encrypted.len(), 32);
        assert_eq!(decrypt_aes_ecb(&encrypted, &key, true).unwrap(), data.to_vec());

        // a full block of padding is added to aligned input
        let aligned = [7u8; 16];
        assert_eq!(encrypt_aes_ecb(&aligned, &key, true).unwrap().len(), 32);

        assert!(encrypt_aes_ecb(b"not aligned", &key, false).is_err());
        assert!(decrypt_aes_ecb(b"not aligned", &key, true).is_err());
    }

    #[test]
    fn test_pkcs7_unpad_rejects_malformed_padding() {
        assert_eq!(pkcs7_unpad(&[1, 2, 3, 2, 2]), &[1, 2, 3]);
        assert_eq!(pkcs7_unpad(&[1, 2, 3, 1, 2]), &[1, 2, 3, 1, 2]);
        assert_eq!(pkcs7_unpad(&[1, 2, 0]), &[1, 2, 0]);
        assert_eq!(pkcs7_unpad(&[]), &[] as &[u8]);
    }

    #[test]
    fn test_hmac_known_vector() {
        let tag = hmac_sha256(b"what do ya want for nothing?", b"Jefe");
        assert_eq!(
            hex::encode(tag),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
        assert!(verify_hmac_sha256(b"what do ya want for nothing?", b"Jefe", &tag));
        assert!(!verify_hmac_sha256(b"what do ya want for nothing!", b"Jefe", &tag));
    }

    #[test]
    fn test_crc32_and_md5() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(hex::encode(discovery_key()), "6c1ec8e2bb9bb59ab50b0daf649b410a");
    }

    #[test]
    fn test_base64() {
        let encoded = base64_encode(b"tuya");
        assert_eq!(encoded, "dHV5YQ==");
        assert_eq!(base64_decode(encoded.as_bytes()).unwrap(), b"tuya".to_vec());
        assert!(base64_decode(b"***").is_err());
    }

    #[test]
    fn test_session_key_derivation() {
        let device_key = *b"0123456789abcdef";
        let local = [0x11u8; 16];
        let remote = [0x22u8; 16];

        let key = derive_session_key(&local, &remote, &device_key).unwrap();
        let expected = encrypt_aes_ecb(&[0x33u8; 16], &device_key, false).unwrap();
        assert_eq!(key.to_vec(), expected);

        // symmetric in the two nonces
        assert_eq!(derive_session_key(&remote, &local, &device_key).unwrap(), key);
    }

    #[test]
    fn test_random_bytes() {
        let a: [u8; 16] = random_bytes();
        let b: [u8; 16] = random_bytes();
        assert_ne!(a, b);
    }
}
