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

//! Message envelope and serialization.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::crypto::CryptoContext;
use crate::protocol::LinkError;

/// Protocol version. Both peers must agree; mismatches are fatal to a
/// session.
pub const PROTOCOL_VERSION: u8 = 3;

/// Message types supported by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "TEXT")]
    Text,
    #[serde(rename = "WORD")]
    Word,
    #[serde(rename = "COMMAND")]
    Command,
    #[serde(rename = "HEARTBEAT")]
    Heartbeat,
    #[serde(rename = "ACK")]
    Ack,
    #[serde(rename = "PAIR_REQ")]
    PairReq,
    #[serde(rename = "PAIR_ACK")]
    PairAck,
}

impl MessageType {
    /// String representation, as hashed into the checksum.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Word => "WORD",
            Self::Command => "COMMAND",
            Self::Heartbeat => "HEARTBEAT",
            Self::Ack => "ACK",
            Self::PairReq => "PAIR_REQ",
            Self::PairAck => "PAIR_ACK",
        }
    }

    /// Whether the payload is encrypted end-to-end once a session key is
    /// installed. Pairing payloads travel in the clear (the receiver may not
    /// have the key yet), as do heartbeats and ACKs.
    pub fn encrypted(&self) -> bool {
        matches!(self, Self::Text | Self::Word | Self::Command)
    }

    /// Whether the receiver auto-acknowledges this type.
    pub fn requires_ack(&self) -> bool {
        matches!(self, Self::Text | Self::Word | Self::Command)
    }

    /// Whether checksum verification is skipped on receive. ACKs carry no
    /// meaningful payload and PAIR_ACK arrives before the key exists.
    pub fn checksum_exempt(&self) -> bool {
        matches!(self, Self::Ack | Self::PairAck)
    }
}

/// Protocol message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Protocol version
    #[serde(rename = "v")]
    pub version: u8,

    /// Message type
    #[serde(rename = "t")]
    pub message_type: MessageType,

    /// Payload content (may be encrypted)
    #[serde(rename = "p")]
    pub payload: String,

    /// Timestamp in milliseconds; also the ACK correlation key
    #[serde(rename = "ts")]
    pub timestamp: u64,

    /// Checksum (first 8 hex chars of SHA-256); empty until signed
    #[serde(rename = "cs")]
    pub checksum: String,
}

impl Message {
    /// Create a new message with the wall-clock timestamp.
    pub fn new(message_type: MessageType, payload: impl Into<String>) -> Self {
        Self::with_timestamp(message_type, payload, now_millis())
    }

    /// Create a new message with an explicit timestamp (senders use
    /// [`TimestampGen`] to keep timestamps strictly monotonic).
    pub fn with_timestamp(
        message_type: MessageType,
        payload: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_type,
            payload: payload.into(),
            timestamp,
            checksum: String::new(),
        }
    }

    /// Create a TEXT message.
    pub fn text(content: impl Into<String>) -> Self {
        Self::new(MessageType::Text, content)
    }

    /// Create a COMMAND message.
    pub fn command(cmd: impl Into<String>) -> Self {
        Self::new(MessageType::Command, cmd)
    }

    /// Create a HEARTBEAT message.
    pub fn heartbeat() -> Self {
        Self::new(MessageType::Heartbeat, "")
    }

    /// Create an ACK for a given timestamp.
    pub fn ack(original_timestamp: u64) -> Self {
        Self::new(MessageType::Ack, original_timestamp.to_string())
    }

    /// Create a WORD message from its inner payload.
    pub fn word(payload: &WordPayload) -> Result<Self, LinkError> {
        Ok(Self::new(MessageType::Word, serde_json::to_string(payload)?))
    }

    /// Sign the message with a crypto context.
    pub fn sign(&mut self, ctx: &CryptoContext) {
        self.checksum = ctx.checksum(
            self.version,
            self.message_type.as_str(),
            &self.payload,
            self.timestamp,
        );
    }

    /// Prepare the message for the wire: encrypt the payload if this type is
    /// encrypted, then sign. Without a context the message goes out
    /// plaintext and unsigned (pre-pairing traffic).
    pub fn seal(&mut self, ctx: Option<&CryptoContext>) -> Result<(), LinkError> {
        let Some(ctx) = ctx else {
            return Ok(());
        };
        if self.message_type.encrypted() {
            self.payload = ctx.encrypt(&self.payload)?;
        }
        self.sign(ctx);
        Ok(())
    }

    /// Verify the message checksum.
    pub fn verify(&self, ctx: &CryptoContext) -> bool {
        ctx.verify_checksum(
            self.version,
            self.message_type.as_str(),
            &self.payload,
            self.timestamp,
            &self.checksum,
        )
    }

    /// Reverse of [`seal`](Self::seal): verify the checksum (unless the type
    /// is exempt), then decrypt the payload per policy.
    pub fn open(&mut self, ctx: Option<&CryptoContext>) -> Result<(), LinkError> {
        let Some(ctx) = ctx else {
            return Ok(());
        };
        if !self.message_type.checksum_exempt() && !self.verify(ctx) {
            return Err(LinkError::Crypto("checksum mismatch".into()));
        }
        if self.message_type.encrypted() {
            self.payload = ctx.decrypt(&self.payload)?;
        }
        Ok(())
    }

    /// Serialize to compact JSON bytes. The packet codec provides framing,
    /// so no delimiter is appended.
    pub fn to_bytes(&self) -> Result<Vec<u8>, LinkError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse from JSON text.
    pub fn from_json(json: &str) -> Result<Self, LinkError> {
        Ok(serde_json::from_str(json.trim())?)
    }

    /// Parse from raw message bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LinkError> {
        let json = std::str::from_utf8(bytes)
            .map_err(|e| LinkError::Protocol(format!("invalid utf-8: {}", e)))?;
        Self::from_json(json)
    }
}

/// Inner payload of a WORD message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WordPayload {
    /// The word text, including its trailing space.
    pub word: String,
    /// Listening-session identifier; the receiver resets word state when it
    /// changes.
    pub session: String,
    /// Optional per-session sequence number, for logging.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl WordPayload {
    pub fn from_json(json: &str) -> Result<Self, LinkError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Strictly monotonic millisecond timestamps.
///
/// Two messages in the same millisecond would alias as ACK correlation keys,
/// so collisions bump by 1 ms.
#[derive(Debug, Default)]
pub struct TimestampGen {
    last: u64,
}

impl TimestampGen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self) -> u64 {
        let now = now_millis();
        self.last = if now > self.last { now } else { self.last + 1 };
        self.last
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serialization() {
        let msg = Message::text("Hello, World!");
        let bytes = msg.to_bytes().unwrap();
        let json = String::from_utf8(bytes.clone()).unwrap();

        assert!(json.contains("\"v\":3"));
        assert!(json.contains("\"t\":\"TEXT\""));
        assert!(json.contains("\"p\":\"Hello, World!\""));

        let parsed = Message::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.version, 3);
        assert_eq!(parsed.message_type, MessageType::Text);
        assert_eq!(parsed.payload, "Hello, World!");
    }

    #[test]
    fn test_encrypt_policy() {
        assert!(MessageType::Text.encrypted());
        assert!(MessageType::Word.encrypted());
        assert!(MessageType::Command.encrypted());
        assert!(!MessageType::Heartbeat.encrypted());
        assert!(!MessageType::Ack.encrypted());
        assert!(!MessageType::PairReq.encrypted());
        assert!(!MessageType::PairAck.encrypted());
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let ctx = CryptoContext::from_pin("123456", "android-abc", "linux-xyz");

        let mut msg = Message::text("secret message");
        let original = msg.payload.clone();

        msg.seal(Some(&ctx)).unwrap();
        assert_ne!(msg.payload, original);
        assert!(!msg.checksum.is_empty());

        msg.open(Some(&ctx)).unwrap();
        assert_eq!(msg.payload, original);
    }

    #[test]
    fn test_open_rejects_tampered_payload() {
        let ctx = CryptoContext::from_pin("123456", "android-abc", "linux-xyz");

        let mut msg = Message::text("secret");
        msg.seal(Some(&ctx)).unwrap();
        msg.payload.push('A');

        assert!(msg.open(Some(&ctx)).is_err());
    }

    #[test]
    fn test_heartbeat_signed_not_encrypted() {
        let ctx = CryptoContext::from_pin("123456", "android-abc", "linux-xyz");

        let mut msg = Message::heartbeat();
        msg.seal(Some(&ctx)).unwrap();
        assert_eq!(msg.payload, "");
        assert!(!msg.checksum.is_empty());
        assert!(msg.verify(&ctx));
    }

    #[test]
    fn test_seal_without_context_is_plaintext() {
        let mut msg = Message::new(MessageType::PairReq, "{\"device_id\":\"a\"}");
        msg.seal(None).unwrap();
        assert_eq!(msg.payload, "{\"device_id\":\"a\"}");
        assert!(msg.checksum.is_empty());
    }

    #[test]
    fn test_word_payload_roundtrip() {
        let payload = WordPayload {
            word: "hello ".to_string(),
            session: "sess-1".to_string(),
            seq: Some(4),
        };
        let msg = Message::word(&payload).unwrap();
        assert_eq!(msg.message_type, MessageType::Word);

        let parsed = WordPayload::from_json(&msg.payload).unwrap();
        assert_eq!(parsed.word, "hello ");
        assert_eq!(parsed.session, "sess-1");
        assert_eq!(parsed.seq, Some(4));
    }

    #[test]
    fn test_timestamp_gen_strictly_increasing() {
        let mut gen = TimestampGen::new();
        let mut last = 0;
        for _ in 0..64 {
            let ts = gen.next();
            assert!(ts > last);
            last = ts;
        }
    }

    #[test]
    fn test_ack_payload_is_decimal_timestamp() {
        let ack = Message::ack(1234567890123);
        assert_eq!(ack.message_type, MessageType::Ack);
        assert_eq!(ack.payload, "1234567890123");
    }
}
