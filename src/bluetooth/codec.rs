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

//! BLE packet framing: chunking and reassembly.
//!
//! Every packet carries a 3-byte header `{flags, seq, total}` followed by up
//! to `mtu - 3` body bytes. One message is in flight per direction; BLE
//! preserves per-characteristic order, so no reorder buffer is needed.

use tracing::warn;

use super::constants::{config, flags};
use crate::protocol::LinkError;

/// Split a message into MTU-bounded packets.
///
/// A message that fits in one packet is emitted as a SINGLE packet with
/// `seq = 0, total = 1`. Larger messages get a START packet, interior
/// packets and an END packet, all carrying the same `total`.
pub fn chunk(data: &[u8], mtu: usize) -> Result<Vec<Vec<u8>>, LinkError> {
    let capacity = config::payload_capacity(mtu);
    if capacity == 0 {
        return Err(LinkError::Framing(format!("mtu {} leaves no payload", mtu)));
    }
    if data.is_empty() {
        return Ok(vec![]);
    }

    let total = data.len().div_ceil(capacity);
    if total > u8::MAX as usize {
        return Err(LinkError::Framing(format!(
            "message of {} bytes needs {} packets, max is {}",
            data.len(),
            total,
            u8::MAX
        )));
    }

    let mut packets = Vec::with_capacity(total);
    for (seq, body) in data.chunks(capacity).enumerate() {
        let flag_bits = if total == 1 {
            flags::SINGLE
        } else if seq == 0 {
            flags::START
        } else if seq == total - 1 {
            flags::END
        } else {
            0
        };

        let mut packet = Vec::with_capacity(config::HEADER_SIZE + body.len());
        packet.push(flag_bits);
        packet.push(seq as u8);
        packet.push(total as u8);
        packet.extend_from_slice(body);
        packets.push(packet);
    }

    Ok(packets)
}

/// Reassembles incoming packets into complete messages.
///
/// Holds at most one in-progress message. Any framing violation resets the
/// buffer; the current message is lost and the next START recovers.
pub struct PacketReassembler {
    buffer: Vec<u8>,
    expected_total: u8,
    next_seq: u8,
    in_progress: bool,
}

impl PacketReassembler {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(4096),
            expected_total: 0,
            next_seq: 0,
            in_progress: false,
        }
    }

    /// Process one incoming packet.
    ///
    /// Returns `Ok(Some(message))` when a message completes, `Ok(None)` while
    /// reassembly continues, and a framing error (after resetting) on any
    /// violation.
    pub fn push(&mut self, packet: &[u8]) -> Result<Option<Vec<u8>>, LinkError> {
        if packet.len() < config::HEADER_SIZE {
            self.reset();
            return Err(LinkError::Framing(format!(
                "packet too short: {} bytes",
                packet.len()
            )));
        }

        let flag_bits = packet[0];
        let seq = packet[1];
        let total = packet[2];
        let body = &packet[config::HEADER_SIZE..];

        if flag_bits & flags::SINGLE != 0 {
            if self.in_progress {
                warn!("Single packet interrupted reassembly, dropping partial message");
                self.reset();
            }
            if seq != 0 || total != 1 || flag_bits != flags::SINGLE {
                return Err(LinkError::Framing(format!(
                    "bad single packet: flags={:#04x} seq={} total={}",
                    flag_bits, seq, total
                )));
            }
            return Ok(Some(body.to_vec()));
        }

        if flag_bits & flags::START != 0 {
            // START always begins a fresh message, even mid-reassembly.
            if self.in_progress {
                warn!("New START interrupted reassembly, dropping partial message");
            }
            self.reset();
            if seq != 0 || total < 2 || flag_bits & flags::END != 0 {
                return Err(LinkError::Framing(format!(
                    "bad start packet: flags={:#04x} seq={} total={}",
                    flag_bits, seq, total
                )));
            }
            self.buffer.extend_from_slice(body);
            self.expected_total = total;
            self.next_seq = 1;
            self.in_progress = true;
            return Ok(None);
        }

        if !self.in_progress {
            return Err(LinkError::Framing(format!(
                "continuation packet (seq {}) without start",
                seq
            )));
        }

        if seq != self.next_seq {
            let expected = self.next_seq;
            self.reset();
            return Err(LinkError::Framing(format!(
                "sequence break: expected {}, got {}",
                expected, seq
            )));
        }

        if total != self.expected_total {
            let expected = self.expected_total;
            self.reset();
            return Err(LinkError::Framing(format!(
                "total mismatch: expected {}, got {}",
                expected, total
            )));
        }

        self.buffer.extend_from_slice(body);

        if flag_bits & flags::END != 0 {
            if seq != total - 1 {
                self.reset();
                return Err(LinkError::Framing(format!(
                    "end packet at seq {} of {}",
                    seq, total
                )));
            }
            self.in_progress = false;
            self.expected_total = 0;
            self.next_seq = 0;
            return Ok(Some(std::mem::take(&mut self.buffer)));
        }

        self.next_seq = self.next_seq.wrapping_add(1);
        Ok(None)
    }

    /// Drop any in-progress message.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.expected_total = 0;
        self.next_seq = 0;
        self.in_progress = false;
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress
    }
}

impl Default for PacketReassembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassemble_all(packets: &[Vec<u8>]) -> Option<Vec<u8>> {
        let mut reassembler = PacketReassembler::new();
        let mut result = None;
        for packet in packets {
            if let Some(msg) = reassembler.push(packet).unwrap() {
                result = Some(msg);
            }
        }
        result
    }

    #[test]
    fn test_single_packet_message() {
        let packets = chunk(b"hello", 23).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0][0], flags::SINGLE);
        assert_eq!(packets[0][1], 0);
        assert_eq!(packets[0][2], 1);
        assert_eq!(&packets[0][3..], b"hello");

        assert_eq!(reassemble_all(&packets), Some(b"hello".to_vec()));
    }

    #[test]
    fn test_chunk_low_mtu() {
        // 120 bytes at MTU 23 (20 usable) = 6 packets.
        let data = vec![b'x'; 120];
        let packets = chunk(&data, 23).unwrap();
        assert_eq!(packets.len(), 6);

        assert_eq!(packets[0][0], flags::START);
        assert_eq!(packets[0][1], 0);
        for (i, packet) in packets.iter().enumerate() {
            assert_eq!(packet[1], i as u8);
            assert_eq!(packet[2], 6);
            assert_eq!(packet.len(), 23);
        }
        for packet in &packets[1..5] {
            assert_eq!(packet[0], 0);
        }
        assert_eq!(packets[5][0], flags::END);
    }

    #[test]
    fn test_roundtrip() {
        let data = b"This message will be chunked into several packets and rebuilt";
        for mtu in [23, 24, 64, 247] {
            let packets = chunk(data, mtu).unwrap();
            assert_eq!(reassemble_all(&packets), Some(data.to_vec()), "mtu {}", mtu);
        }
    }

    #[test]
    fn test_oversize_message() {
        let data = vec![0u8; 20 * 256];
        assert!(matches!(chunk(&data, 23), Err(LinkError::Framing(_))));
    }

    #[test]
    fn test_sequence_break_resets() {
        let data = vec![b'a'; 60];
        let packets = chunk(&data, 23).unwrap();
        assert_eq!(packets.len(), 3);

        let mut reassembler = PacketReassembler::new();
        assert!(reassembler.push(&packets[0]).unwrap().is_none());
        // Skip packet 1, deliver packet 2.
        assert!(reassembler.push(&packets[2]).is_err());
        assert!(!reassembler.is_in_progress());

        // A fresh message goes through afterwards.
        let fresh = chunk(b"recovered", 23).unwrap();
        assert_eq!(reassemble_all(&fresh), Some(b"recovered".to_vec()));
    }

    #[test]
    fn test_total_mismatch_aborts_current_only() {
        let data = vec![b'a'; 60];
        let packets = chunk(&data, 23).unwrap();

        let mut reassembler = PacketReassembler::new();
        assert!(reassembler.push(&packets[0]).unwrap().is_none());

        let mut forged = packets[1].clone();
        forged[2] = 9;
        assert!(reassembler.push(&forged).is_err());
        assert!(!reassembler.is_in_progress());

        // Next valid START proceeds normally.
        for (i, packet) in packets.iter().enumerate() {
            let result = reassembler.push(packet).unwrap();
            if i < packets.len() - 1 {
                assert!(result.is_none());
            } else {
                assert_eq!(result, Some(data.clone()));
            }
        }
    }

    #[test]
    fn test_duplicate_packet_rejected() {
        let data = vec![b'a'; 60];
        let packets = chunk(&data, 23).unwrap();

        let mut reassembler = PacketReassembler::new();
        assert!(reassembler.push(&packets[0]).unwrap().is_none());
        assert!(reassembler.push(&packets[1]).unwrap().is_none());
        assert!(reassembler.push(&packets[1]).is_err());
        assert!(!reassembler.is_in_progress());
    }

    #[test]
    fn test_continuation_without_start() {
        let mut reassembler = PacketReassembler::new();
        let packet = vec![0u8, 1, 3, b'x'];
        assert!(reassembler.push(&packet).is_err());
    }

    #[test]
    fn test_start_interrupts_previous_message() {
        let first = chunk(&vec![b'a'; 60], 23).unwrap();
        let second = chunk(&vec![b'b'; 40], 23).unwrap();

        let mut reassembler = PacketReassembler::new();
        assert!(reassembler.push(&first[0]).unwrap().is_none());

        // New START abandons the half-built message.
        let mut result = None;
        for packet in &second {
            if let Some(msg) = reassembler.push(packet).unwrap() {
                result = Some(msg);
            }
        }
        assert_eq!(result, Some(vec![b'b'; 40]));
    }
}
