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

//! BLE service and characteristic UUIDs for the Speech2Prompt link.

use uuid::Uuid;

/// Speech2Prompt GATT service UUID.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0xa1b2c3d4_e5f6_7890_abcd_ef1234567890);

/// Command RX characteristic UUID (the central writes packets here).
/// Properties: Write, Write Without Response
pub const COMMAND_RX_UUID: Uuid = Uuid::from_u128(0xa1b2c3d4_e5f6_7890_abcd_ef1234567891);

/// Response TX characteristic UUID (the peripheral notifies packets here).
/// Properties: Notify
pub const RESPONSE_TX_UUID: Uuid = Uuid::from_u128(0xa1b2c3d4_e5f6_7890_abcd_ef1234567892);

/// Status characteristic UUID (connection and pairing status).
/// Properties: Read, Notify
pub const STATUS_UUID: Uuid = Uuid::from_u128(0xa1b2c3d4_e5f6_7890_abcd_ef1234567893);

/// MTU Info characteristic UUID (current negotiated MTU, little-endian u16).
/// Properties: Read
pub const MTU_INFO_UUID: Uuid = Uuid::from_u128(0xa1b2c3d4_e5f6_7890_abcd_ef1234567894);

/// Packet header flag bits.
pub mod flags {
    /// First packet of a multi-packet message.
    pub const START: u8 = 0x01;
    /// Last packet of a multi-packet message.
    pub const END: u8 = 0x02;
    /// Message fits in one packet.
    pub const SINGLE: u8 = 0x04;
}

/// One-byte status codes published on the Status characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusCode {
    Idle = 0x00,
    AwaitingPairing = 0x01,
    Paired = 0x02,
    Busy = 0x03,
    Error = 0xFF,
}

impl StatusCode {
    pub fn as_bytes(&self) -> Vec<u8> {
        vec![*self as u8]
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Idle),
            0x01 => Some(Self::AwaitingPairing),
            0x02 => Some(Self::Paired),
            0x03 => Some(Self::Busy),
            0xFF => Some(Self::Error),
            _ => None,
        }
    }
}

/// Packet-layer configuration constants.
pub mod config {
    /// Default ATT MTU (minimum for all BLE devices).
    pub const DEFAULT_MTU: usize = 23;

    /// Target MTU to negotiate.
    pub const TARGET_MTU: usize = 247;

    /// Minimum MTU we accept from the peer.
    pub const MIN_MTU: usize = 23;

    /// Fixed packet header size: flags, seq, total.
    pub const HEADER_SIZE: usize = 3;

    /// Usable packet body for a given MTU.
    pub fn payload_capacity(mtu: usize) -> usize {
        mtu.saturating_sub(HEADER_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        assert_eq!(
            SERVICE_UUID.to_string().to_lowercase(),
            "a1b2c3d4-e5f6-7890-abcd-ef1234567890"
        );
        assert_eq!(
            COMMAND_RX_UUID.to_string().to_lowercase(),
            "a1b2c3d4-e5f6-7890-abcd-ef1234567891"
        );
    }

    #[test]
    fn test_status_code_conversion() {
        assert_eq!(StatusCode::from_u8(0x00), Some(StatusCode::Idle));
        assert_eq!(StatusCode::from_u8(0x02), Some(StatusCode::Paired));
        assert_eq!(StatusCode::from_u8(0xFF), Some(StatusCode::Error));
        assert_eq!(StatusCode::from_u8(0x99), None);
    }

    #[test]
    fn test_payload_capacity() {
        assert_eq!(config::payload_capacity(23), 20);
        assert_eq!(config::payload_capacity(247), 244);
        assert_eq!(config::payload_capacity(2), 0);
    }
}
