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

//! Pairing payloads and the key-agreement state machines for both roles.
//!
//! The central always opens with PAIR_REQ carrying a fresh X25519 public
//! key. A peripheral that already holds credentials for the device ID
//! auto-approves and omits its own key from the PAIR_ACK, which tells the
//! central to reuse its stored secret; a PAIR_ACK carrying a key always
//! means a fresh exchange.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::crypto::ecdh::ExchangeKeypair;
use crate::crypto::CryptoContext;
use crate::protocol::LinkError;

/// Pairing request payload (inner JSON of PAIR_REQ).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairRequestPayload {
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    /// Base64 of the raw 32-byte X25519 public key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

impl PairRequestPayload {
    pub fn to_json(&self) -> Result<String, LinkError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, LinkError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Pairing acknowledgment payload (inner JSON of PAIR_ACK).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairAckPayload {
    pub device_id: String,
    pub status: PairStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Present on a fresh key exchange; absent on silent auto-approve.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// Legacy PIN-mode field; never set by the current flow.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_secret: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PairStatus {
    Ok,
    Error,
}

impl PairAckPayload {
    /// Success carrying our public key (fresh ECDH exchange).
    pub fn success_with_key(device_id: impl Into<String>, public_key: String) -> Self {
        Self {
            device_id: device_id.into(),
            status: PairStatus::Ok,
            error: None,
            public_key: Some(public_key),
            shared_secret: None,
        }
    }

    /// Success without key material (peer reuses its stored secret).
    pub fn success(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            status: PairStatus::Ok,
            error: None,
            public_key: None,
            shared_secret: None,
        }
    }

    pub fn error(device_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            status: PairStatus::Error,
            error: Some(error.into()),
            public_key: None,
            shared_secret: None,
        }
    }

    pub fn to_json(&self) -> Result<String, LinkError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, LinkError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Result of a completed pairing, on either side.
#[derive(Debug)]
pub struct PairingOutcome {
    /// Installed session context; its key is what gets persisted.
    pub context: CryptoContext,
    pub peer_device_id: String,
    /// False when a stored secret was reused.
    pub newly_paired: bool,
}

/// Central-side pairing: builds PAIR_REQ and consumes PAIR_ACK.
pub struct PairingInitiator {
    self_device_id: String,
    self_device_name: Option<String>,
    keypair: ExchangeKeypair,
}

impl PairingInitiator {
    pub fn new(self_device_id: impl Into<String>, self_device_name: Option<String>) -> Self {
        Self {
            self_device_id: self_device_id.into(),
            self_device_name,
            keypair: ExchangeKeypair::generate(),
        }
    }

    /// The PAIR_REQ payload: our identity and a fresh public key.
    pub fn request(&self) -> PairRequestPayload {
        PairRequestPayload {
            device_id: self.self_device_id.clone(),
            device_name: self.self_device_name.clone(),
            public_key: Some(self.keypair.public_key_base64()),
        }
    }

    /// Consume the PAIR_ACK. `stored_key` is the secret persisted for this
    /// peer from an earlier pairing, if any; it is used when the peripheral
    /// auto-approved without sending a key.
    pub fn complete(
        self,
        ack: &PairAckPayload,
        stored_key: Option<[u8; 32]>,
    ) -> Result<PairingOutcome, LinkError> {
        if ack.status != PairStatus::Ok {
            let reason = ack.error.as_deref().unwrap_or("rejected by peer");
            return Err(LinkError::Pairing(reason.to_string()));
        }

        if let Some(peer_key) = &ack.public_key {
            let shared = self.keypair.diffie_hellman_base64(peer_key)?;
            let context =
                CryptoContext::from_exchange(&shared, &self.self_device_id, &ack.device_id);
            info!("Pairing complete with {} (fresh exchange)", ack.device_id);
            return Ok(PairingOutcome {
                context,
                peer_device_id: ack.device_id.clone(),
                newly_paired: true,
            });
        }

        // Legacy PIN-mode peers ship the secret itself.
        if let Some(secret_b64) = &ack.shared_secret {
            let key = decode_key(secret_b64)?;
            info!("Pairing complete with {} (legacy secret)", ack.device_id);
            return Ok(PairingOutcome {
                context: CryptoContext::new(key),
                peer_device_id: ack.device_id.clone(),
                newly_paired: true,
            });
        }

        match stored_key {
            Some(key) => {
                info!("Pairing complete with {} (stored secret)", ack.device_id);
                Ok(PairingOutcome {
                    context: CryptoContext::new(key),
                    peer_device_id: ack.device_id.clone(),
                    newly_paired: false,
                })
            }
            None => Err(LinkError::Pairing(
                "peer sent no key material and no stored secret exists".into(),
            )),
        }
    }
}

/// Peripheral-side pairing: consumes PAIR_REQ and builds PAIR_ACK.
pub struct PairingResponder {
    self_device_id: String,
}

impl PairingResponder {
    pub fn new(self_device_id: impl Into<String>) -> Self {
        Self {
            self_device_id: self_device_id.into(),
        }
    }

    /// Silent approval for a peer whose credentials are already stored. No
    /// user prompt, no key material in the ACK.
    pub fn auto_approve(
        &self,
        request: &PairRequestPayload,
        stored_key: [u8; 32],
    ) -> (PairAckPayload, PairingOutcome) {
        info!("Auto-approving known device {}", request.device_id);
        let ack = PairAckPayload::success(&self.self_device_id);
        let outcome = PairingOutcome {
            context: CryptoContext::new(stored_key),
            peer_device_id: request.device_id.clone(),
            newly_paired: false,
        };
        (ack, outcome)
    }

    /// Begin pairing for an unknown peer: validate the request, generate our
    /// keypair and hold everything while the user confirms.
    pub fn begin(&self, request: &PairRequestPayload) -> Result<PendingPairing, LinkError> {
        let peer_public_key = request
            .public_key
            .clone()
            .ok_or_else(|| LinkError::Pairing("pair request carries no public key".into()))?;

        Ok(PendingPairing {
            self_device_id: self.self_device_id.clone(),
            peer_device_id: request.device_id.clone(),
            peer_device_name: request.device_name.clone(),
            peer_public_key,
            keypair: ExchangeKeypair::generate(),
        })
    }

    /// Rejection ACK.
    pub fn reject(&self, reason: &str) -> PairAckPayload {
        PairAckPayload::error(&self.self_device_id, reason)
    }
}

/// An unconfirmed pairing awaiting the local user's decision.
pub struct PendingPairing {
    self_device_id: String,
    peer_device_id: String,
    peer_device_name: Option<String>,
    peer_public_key: String,
    keypair: ExchangeKeypair,
}

impl PendingPairing {
    pub fn peer_device_id(&self) -> &str {
        &self.peer_device_id
    }

    pub fn peer_device_name(&self) -> Option<&str> {
        self.peer_device_name.as_deref()
    }

    /// User approved: run the exchange and produce the ACK carrying our
    /// public key.
    pub fn approve(self) -> Result<(PairAckPayload, PairingOutcome), LinkError> {
        let own_public_key = self.keypair.public_key_base64();
        let shared = self.keypair.diffie_hellman_base64(&self.peer_public_key)?;
        let context =
            CryptoContext::from_exchange(&shared, &self.peer_device_id, &self.self_device_id);

        info!("Pairing approved for device {}", self.peer_device_id);
        let ack = PairAckPayload::success_with_key(&self.self_device_id, own_public_key);
        Ok((
            ack,
            PairingOutcome {
                context,
                peer_device_id: self.peer_device_id,
                newly_paired: true,
            },
        ))
    }
}

fn decode_key(b64: &str) -> Result<[u8; 32], LinkError> {
    let bytes = BASE64
        .decode(b64)
        .map_err(|e| LinkError::Crypto(format!("invalid base64 secret: {}", e)))?;
    if bytes.len() != 32 {
        return Err(LinkError::Crypto(format!(
            "invalid secret length: {}",
            bytes.len()
        )));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_json_roundtrip() {
        let req = PairRequestPayload {
            device_id: "android-123".to_string(),
            device_name: Some("My Phone".to_string()),
            public_key: Some(BASE64.encode([1u8; 32])),
        };
        let parsed = PairRequestPayload::from_json(&req.to_json().unwrap()).unwrap();
        assert_eq!(parsed.device_id, "android-123");
        assert_eq!(parsed.device_name, Some("My Phone".to_string()));

        let ack = PairAckPayload::success("linux-456");
        let json = ack.to_json().unwrap();
        assert!(json.contains("\"OK\""));
        let parsed = PairAckPayload::from_json(&json).unwrap();
        assert_eq!(parsed.status, PairStatus::Ok);
        assert!(parsed.public_key.is_none());
    }

    #[test]
    fn test_fresh_exchange_both_sides_agree() {
        let initiator = PairingInitiator::new("android-abc", Some("Phone".to_string()));
        let responder = PairingResponder::new("linux-xyz");

        let request = initiator.request();
        let pending = responder.begin(&request).unwrap();
        let (ack, peripheral_outcome) = pending.approve().unwrap();
        let central_outcome = initiator.complete(&ack, None).unwrap();

        assert!(central_outcome.newly_paired);
        assert_eq!(central_outcome.peer_device_id, "linux-xyz");
        assert_eq!(peripheral_outcome.peer_device_id, "android-abc");
        assert_eq!(
            central_outcome.context.key(),
            peripheral_outcome.context.key()
        );

        // And the contexts interoperate.
        let wire = central_outcome.context.encrypt("hello").unwrap();
        assert_eq!(peripheral_outcome.context.decrypt(&wire).unwrap(), "hello");
    }

    #[test]
    fn test_auto_approve_reuses_stored_secret() {
        let stored = [9u8; 32];
        let initiator = PairingInitiator::new("android-abc", None);
        let responder = PairingResponder::new("linux-xyz");

        let request = initiator.request();
        let (ack, peripheral_outcome) = responder.auto_approve(&request, stored);
        assert!(ack.public_key.is_none());

        let central_outcome = initiator.complete(&ack, Some(stored)).unwrap();
        assert!(!central_outcome.newly_paired);
        assert_eq!(
            central_outcome.context.key(),
            peripheral_outcome.context.key()
        );
    }

    #[test]
    fn test_rejection_fails_pairing() {
        let initiator = PairingInitiator::new("android-abc", None);
        let responder = PairingResponder::new("linux-xyz");

        let ack = responder.reject("user declined");
        let err = initiator.complete(&ack, None).unwrap_err();
        assert!(matches!(err, LinkError::Pairing(_)));
    }

    #[test]
    fn test_auto_approve_ack_without_stored_secret_fails() {
        let initiator = PairingInitiator::new("android-abc", None);
        let ack = PairAckPayload::success("linux-xyz");
        assert!(matches!(
            initiator.complete(&ack, None),
            Err(LinkError::Pairing(_))
        ));
    }

    #[test]
    fn test_request_without_key_cannot_begin() {
        let responder = PairingResponder::new("linux-xyz");
        let request = PairRequestPayload {
            device_id: "android-abc".to_string(),
            device_name: None,
            public_key: None,
        };
        assert!(responder.begin(&request).is_err());
    }
}
