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

//! Link error taxonomy.
//!
//! Framing and crypto errors are recoverable: the dispatcher logs and drops
//! the affected message. Transport and pairing errors surface as connection
//! state transitions.

use thiserror::Error;

/// Errors produced by the transport core.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Connection-level failure (connect, write, notify stream closed).
    #[error("transport: {0}")]
    Transport(String),

    /// Packet-layer violation: bad header, sequence break, total mismatch,
    /// oversize message.
    #[error("framing: {0}")]
    Framing(String),

    /// Encryption, decryption, key-derivation or checksum failure.
    #[error("crypto: {0}")]
    Crypto(String),

    /// Well-formed packet carrying an unusable message: bad JSON, unknown
    /// type, version mismatch, message unexpected for the current state.
    #[error("protocol: {0}")]
    Protocol(String),

    /// Pairing was rejected by the peer or timed out.
    #[error("pairing failed: {0}")]
    Pairing(String),

    /// No ACK arrived for a sent message within the wait window.
    #[error("ack timeout for timestamp {0}")]
    AckTimeout(u64),

    /// Credential or history store failure.
    #[error("storage: {0}")]
    Storage(String),
}

impl From<bluer::Error> for LinkError {
    fn from(err: bluer::Error) -> Self {
        LinkError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for LinkError {
    fn from(err: serde_json::Error) -> Self {
        LinkError::Protocol(err.to_string())
    }
}
