// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Session cryptography: key derivation, payload encryption, checksums.
//!
//! Two key-derivation modes exist. PIN mode is the legacy path; the current
//! pairing flow exchanges X25519 public keys and feeds the shared secret
//! through the same PBKDF2 derivation, bound to both device IDs. Both peers
//! must use the same mode and the same input order.

pub mod ecdh;

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::protocol::LinkError;

const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT: &[u8] = b"speech2code_v1";
const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

/// Cryptographic context for a paired session.
///
/// Immutable once installed; created at pairing completion and dropped on
/// unpair.
#[derive(Clone)]
pub struct CryptoContext {
    key: [u8; KEY_SIZE],
}

impl std::fmt::Debug for CryptoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoContext").field("key", &"[redacted]").finish()
    }
}

impl CryptoContext {
    /// Create a context from a previously derived 32-byte key.
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        Self { key }
    }

    /// Legacy mode: derive the key from a PIN and both device IDs.
    pub fn from_pin(pin: &str, central_id: &str, peripheral_id: &str) -> Self {
        Self {
            key: derive_key(pin, central_id, peripheral_id),
        }
    }

    /// Derive the key from an X25519 shared secret and both device IDs.
    pub fn from_exchange(shared_secret: &[u8; 32], central_id: &str, peripheral_id: &str) -> Self {
        Self {
            key: derive_key_from_exchange(shared_secret, central_id, peripheral_id),
        }
    }

    /// Encrypt a plaintext payload. Returns Base64(nonce || ciphertext || tag).
    pub fn encrypt(&self, plaintext: &str) -> Result<String, LinkError> {
        encrypt(plaintext, &self.key)
    }

    /// Decrypt a Base64(nonce || ciphertext || tag) payload.
    pub fn decrypt(&self, ciphertext: &str) -> Result<String, LinkError> {
        decrypt(ciphertext, &self.key)
    }

    /// Calculate the message checksum over the canonical field order.
    pub fn checksum(&self, version: u8, msg_type: &str, payload: &str, timestamp: u64) -> String {
        checksum(version, msg_type, payload, timestamp, &self.key)
    }

    /// Verify a message checksum.
    ///
    /// An empty checksum is accepted as unsigned (pre-pairing traffic and
    /// ACKs carry none).
    pub fn verify_checksum(
        &self,
        version: u8,
        msg_type: &str,
        payload: &str,
        timestamp: u64,
        expected: &str,
    ) -> bool {
        if expected.is_empty() {
            return true;
        }
        self.checksum(version, msg_type, payload, timestamp) == expected
    }

    /// Raw key bytes, for persisting the paired-peer record.
    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }
}

/// Derive a 256-bit key from a PIN and both device identifiers.
pub fn derive_key(pin: &str, central_id: &str, peripheral_id: &str) -> [u8; KEY_SIZE] {
    let password = format!("{}{}{}", pin, central_id, peripheral_id);
    let mut key = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), SALT, PBKDF2_ITERATIONS, &mut key);
    key
}

/// Derive a 256-bit key from an X25519 shared secret and both device
/// identifiers. The shared secret provides the strength, the IDs bind the
/// key to this pair of devices.
pub fn derive_key_from_exchange(
    shared_secret: &[u8; 32],
    central_id: &str,
    peripheral_id: &str,
) -> [u8; KEY_SIZE] {
    let password = format!(
        "{}{}{}",
        hex::encode(shared_secret),
        central_id,
        peripheral_id
    );
    let mut key = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), SALT, PBKDF2_ITERATIONS, &mut key);
    key
}

/// Encrypt plaintext with AES-256-GCM under a fresh random 12-byte nonce.
pub fn encrypt(plaintext: &str, key: &[u8; KEY_SIZE]) -> Result<String, LinkError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| LinkError::Crypto(format!("cipher init failed: {}", e)))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| LinkError::Crypto(format!("encryption failed: {}", e)))?;

    let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&ciphertext);

    Ok(BASE64.encode(combined))
}

/// Decrypt Base64(nonce || ciphertext || tag). Fails on authentication error.
pub fn decrypt(ciphertext: &str, key: &[u8; KEY_SIZE]) -> Result<String, LinkError> {
    let combined = BASE64
        .decode(ciphertext)
        .map_err(|e| LinkError::Crypto(format!("base64 decode failed: {}", e)))?;

    if combined.len() < NONCE_SIZE {
        return Err(LinkError::Crypto("ciphertext too short".into()));
    }

    let (nonce_bytes, ciphertext_bytes) = combined.split_at(NONCE_SIZE);
    let nonce = Nonce::from_slice(nonce_bytes);

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| LinkError::Crypto(format!("cipher init failed: {}", e)))?;

    let plaintext = cipher
        .decrypt(nonce, ciphertext_bytes)
        .map_err(|e| LinkError::Crypto(format!("decryption failed: {}", e)))?;

    String::from_utf8(plaintext).map_err(|e| LinkError::Crypto(format!("utf-8 decode: {}", e)))
}

/// Checksum: first 4 bytes of SHA-256 over the ASCII concatenation of the
/// message fields followed by the raw key, as 8 lowercase hex characters.
pub fn checksum(
    version: u8,
    msg_type: &str,
    payload: &str,
    timestamp: u64,
    secret: &[u8],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(version.to_string().as_bytes());
    hasher.update(msg_type.as_bytes());
    hasher.update(payload.as_bytes());
    hasher.update(timestamp.to_string().as_bytes());
    hasher.update(secret);

    let hash = hasher.finalize();
    hex::encode(&hash[..4])
}

/// Generate a random device ID: 16 random bytes, hex, platform-prefixed.
pub fn generate_device_id(platform: &str) -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    format!("{}-{}", platform, hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_derivation_deterministic() {
        let key1 = derive_key("123456", "android-abc", "linux-xyz");
        let key2 = derive_key("123456", "android-abc", "linux-xyz");
        let key3 = derive_key("654321", "android-abc", "linux-xyz");

        assert_eq!(key1, key2);
        assert_ne!(key1, key3);
    }

    #[test]
    fn test_exchange_derivation_binds_device_ids() {
        let secret = [7u8; 32];
        let key1 = derive_key_from_exchange(&secret, "android-1", "linux-1");
        let key2 = derive_key_from_exchange(&secret, "android-2", "linux-1");
        assert_ne!(key1, key2);
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = derive_key("123456", "android-abc", "linux-xyz");
        let plaintext = "Hello, World!";

        let encrypted = encrypt(plaintext, &key).unwrap();
        let decrypted = decrypt(&encrypted, &key).unwrap();

        assert_eq!(plaintext, decrypted);
        assert_ne!(plaintext, encrypted);
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let key = derive_key("123456", "android-abc", "linux-xyz");
        let encrypted = encrypt("sensitive", &key).unwrap();

        let mut raw = BASE64.decode(&encrypted).unwrap();
        // Flip one bit in the ciphertext body (past the nonce).
        let idx = raw.len() - 1;
        raw[idx] ^= 0x01;
        let tampered = BASE64.encode(raw);

        assert!(decrypt(&tampered, &key).is_err());
    }

    #[test]
    fn test_tampered_nonce_rejected() {
        let key = derive_key("123456", "android-abc", "linux-xyz");
        let encrypted = encrypt("sensitive", &key).unwrap();

        let mut raw = BASE64.decode(&encrypted).unwrap();
        raw[0] ^= 0x80;
        let tampered = BASE64.encode(raw);

        assert!(decrypt(&tampered, &key).is_err());
    }

    #[test]
    fn test_checksum_shape_and_sensitivity() {
        let key = derive_key("123456", "android-abc", "linux-xyz");
        let cs = checksum(3, "TEXT", "hello", 1234567890, &key);

        assert_eq!(cs.len(), 8);
        assert_eq!(cs, checksum(3, "TEXT", "hello", 1234567890, &key));
        assert_ne!(cs, checksum(3, "TEXT", "world", 1234567890, &key));
        assert_ne!(cs, checksum(3, "WORD", "hello", 1234567890, &key));
        assert_ne!(cs, checksum(3, "TEXT", "hello", 1234567891, &key));
        assert_ne!(cs, checksum(1, "TEXT", "hello", 1234567890, &key));
    }

    #[test]
    fn test_context_verify_and_unsigned() {
        let ctx = CryptoContext::from_pin("123456", "android-abc", "linux-xyz");

        let cs = ctx.checksum(3, "TEXT", "payload", 12345);
        assert!(ctx.verify_checksum(3, "TEXT", "payload", 12345, &cs));
        assert!(!ctx.verify_checksum(3, "TEXT", "different", 12345, &cs));

        // Empty checksum is accepted as unsigned.
        assert!(ctx.verify_checksum(3, "ACK", "12345", 12345, ""));
    }

    #[test]
    fn test_device_id_format() {
        let id = generate_device_id("linux");
        assert!(id.starts_with("linux-"));
        assert_eq!(id.len(), "linux-".len() + 32);
    }
}
