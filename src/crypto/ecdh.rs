// Copyright 2026 Daniel Pelikan
// SPDX-License-Identifier: Apache-2.0

//! X25519 key exchange for pairing.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::protocol::LinkError;

/// X25519 public key size in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// X25519 shared secret size in bytes.
pub const SHARED_SECRET_SIZE: usize = 32;

/// One side of the pairing key exchange.
///
/// The secret is single-use: computing the shared secret consumes the
/// keypair, so a keypair never outlives its pairing attempt.
pub struct ExchangeKeypair {
    secret: EphemeralSecret,
    public_key: PublicKey,
}

impl ExchangeKeypair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public_key = PublicKey::from(&secret);
        Self { secret, public_key }
    }

    /// Raw public key bytes.
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        *self.public_key.as_bytes()
    }

    /// Public key as Base64, the wire form carried in pairing payloads.
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.public_key.as_bytes())
    }

    /// Compute the shared secret with the peer's raw public key.
    pub fn diffie_hellman(self, peer_public_key: &[u8; PUBLIC_KEY_SIZE]) -> [u8; SHARED_SECRET_SIZE] {
        let peer_key = PublicKey::from(*peer_public_key);
        let shared_secret = self.secret.diffie_hellman(&peer_key);
        *shared_secret.as_bytes()
    }

    /// Compute the shared secret from the peer's Base64 public key.
    pub fn diffie_hellman_base64(
        self,
        peer_public_key_base64: &str,
    ) -> Result<[u8; SHARED_SECRET_SIZE], LinkError> {
        let peer_bytes = BASE64
            .decode(peer_public_key_base64)
            .map_err(|e| LinkError::Crypto(format!("invalid base64 public key: {}", e)))?;

        if peer_bytes.len() != PUBLIC_KEY_SIZE {
            return Err(LinkError::Crypto(format!(
                "invalid public key size: expected {}, got {}",
                PUBLIC_KEY_SIZE,
                peer_bytes.len()
            )));
        }

        let mut peer_key = [0u8; PUBLIC_KEY_SIZE];
        peer_key.copy_from_slice(&peer_bytes);

        Ok(self.diffie_hellman(&peer_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_sides_agree() {
        let central = ExchangeKeypair::generate();
        let peripheral = ExchangeKeypair::generate();

        let central_public = central.public_key_bytes();
        let peripheral_public = peripheral.public_key_bytes();

        let central_shared = central.diffie_hellman(&peripheral_public);
        let peripheral_shared = peripheral.diffie_hellman(&central_public);

        assert_eq!(central_shared, peripheral_shared);
    }

    #[test]
    fn test_base64_wire_form() {
        let keypair = ExchangeKeypair::generate();
        let encoded = keypair.public_key_base64();

        // 32 bytes * 4/3, padded.
        assert_eq!(encoded.len(), 44);
        assert_eq!(BASE64.decode(&encoded).unwrap().len(), PUBLIC_KEY_SIZE);
    }

    #[test]
    fn test_wrong_key_size_rejected() {
        let keypair = ExchangeKeypair::generate();
        let short = BASE64.encode([0u8; 16]);
        assert!(keypair.diffie_hellman_base64(&short).is_err());
    }
}
