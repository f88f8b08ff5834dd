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

//! Reliable, at-least-once message sending.
//!
//! Outbound messages are sealed, chunked and handed to the write path as
//! individual packets. Data messages wait for the correlated ACK; a timeout
//! is reported to the caller and never retried here (a blind retransmit
//! would duplicate keystrokes on the peer).

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::codec;
use crate::crypto::CryptoContext;
use crate::protocol::{LinkError, Message, MessageType, TimestampGen};

/// Delay between packets of a multi-packet message, to avoid overrunning
/// constrained radios.
pub const INTER_PACKET_DELAY: Duration = Duration::from_millis(10);

/// Default wait for the correlated ACK.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound of the offline queue.
pub const QUEUE_CAPACITY: usize = 64;

/// One framed packet handed to the write path.
#[derive(Debug)]
pub struct OutboundPacket {
    pub bytes: Vec<u8>,
    /// Control-plane packets use write-with-response; TEXT/WORD throughput
    /// traffic uses write-without-response.
    pub with_response: bool,
}

/// Result of a send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written and, where required, acknowledged.
    Delivered,
    /// Written but no ACK arrived in time. Not retransmitted.
    TimedOut,
    /// Buffered until the link reaches Connected.
    Queued,
    /// Dropped per queue policy (heartbeat while disconnected, or overflow).
    Dropped,
}

/// Table of pending ACK waiters, keyed by message timestamp.
#[derive(Default)]
pub struct AckRegistry {
    waiters: Mutex<HashMap<u64, oneshot::Sender<()>>>,
}

impl AckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for a timestamp. A later waiter with the same key
    /// replaces the earlier one (timestamps are strictly monotonic, so this
    /// only happens on misuse).
    pub fn register(&self, timestamp: u64) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(timestamp, tx);
        rx
    }

    /// Complete the waiter for a timestamp. Returns false when nobody waits.
    pub fn complete(&self, timestamp: u64) -> bool {
        match self.waiters.lock().remove(&timestamp) {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    pub fn forget(&self, timestamp: u64) {
        self.waiters.lock().remove(&timestamp);
    }

    /// Drop all waiters (connection teardown).
    pub fn clear(&self) {
        self.waiters.lock().clear();
    }
}

/// Bounded FIFO of messages buffered while the link is down.
pub struct SendQueue {
    queue: VecDeque<Message>,
    capacity: usize,
}

impl SendQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity,
        }
    }

    /// Enqueue a message. On overflow the oldest TEXT/WORD entry is evicted;
    /// control messages are never dropped to make room.
    pub fn push(&mut self, message: Message) -> SendOutcome {
        if self.queue.len() >= self.capacity {
            let droppable = self.queue.iter().position(|m| {
                matches!(m.message_type, MessageType::Text | MessageType::Word)
            });
            match droppable {
                Some(idx) => {
                    warn!("Send queue full, dropping oldest data message");
                    self.queue.remove(idx);
                }
                None => {
                    warn!("Send queue full of control messages, dropping new message");
                    return SendOutcome::Dropped;
                }
            }
        }
        self.queue.push_back(message);
        SendOutcome::Queued
    }

    /// Take everything, preserving FIFO order.
    pub fn drain(&mut self) -> Vec<Message> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Seals, chunks and writes messages, waiting on ACKs where the type
/// demands it.
pub struct ReliableSender {
    timestamps: TimestampGen,
    acks: Arc<AckRegistry>,
    ack_timeout: Duration,
}

impl ReliableSender {
    pub fn new(acks: Arc<AckRegistry>, ack_timeout: Duration) -> Self {
        Self {
            timestamps: TimestampGen::new(),
            acks,
            ack_timeout,
        }
    }

    pub fn acks(&self) -> Arc<AckRegistry> {
        self.acks.clone()
    }

    /// Write one message to the given write path.
    ///
    /// Assigns a fresh monotonic timestamp, seals with the session context
    /// if present, chunks to the negotiated MTU and writes packet by packet
    /// with a short inter-packet gap. For ack-required types a
    /// [`DeliveryWait`] is returned; the caller decides whether to await it
    /// inline or from a spawned task (the supervisor must not block its
    /// event loop on it, since that same loop routes the inbound ACK).
    pub async fn write_message(
        &mut self,
        mut message: Message,
        ctx: Option<&CryptoContext>,
        mtu: usize,
        writer: &mpsc::Sender<OutboundPacket>,
    ) -> Result<Option<DeliveryWait>, LinkError> {
        message.timestamp = self.timestamps.next();
        let timestamp = message.timestamp;
        let message_type = message.message_type;

        message.seal(ctx)?;
        let bytes = message.to_bytes()?;
        let packets = codec::chunk(&bytes, mtu)?;
        let with_response = !matches!(
            message_type,
            MessageType::Text | MessageType::Word | MessageType::Heartbeat | MessageType::Ack
        );

        let ack_rx = message_type.requires_ack().then(|| self.acks.register(timestamp));

        debug!(
            "Sending {} ({} bytes, {} packets, ts {})",
            message_type.as_str(),
            bytes.len(),
            packets.len(),
            timestamp
        );

        let packet_count = packets.len();
        for (i, packet) in packets.into_iter().enumerate() {
            writer
                .send(OutboundPacket {
                    bytes: packet,
                    with_response,
                })
                .await
                .map_err(|_| LinkError::Transport("write path closed".into()))?;
            if i + 1 < packet_count {
                tokio::time::sleep(INTER_PACKET_DELAY).await;
            }
        }

        Ok(ack_rx.map(|rx| DeliveryWait {
            rx,
            timestamp,
            message_type,
            timeout: self.ack_timeout,
            acks: self.acks.clone(),
        }))
    }

    /// Convenience: write and await the ACK inline.
    pub async fn transmit(
        &mut self,
        message: Message,
        ctx: Option<&CryptoContext>,
        mtu: usize,
        writer: &mpsc::Sender<OutboundPacket>,
    ) -> Result<SendOutcome, LinkError> {
        match self.write_message(message, ctx, mtu, writer).await? {
            Some(wait) => Ok(wait.wait().await),
            None => Ok(SendOutcome::Delivered),
        }
    }
}

/// Pending acknowledgement of a written message.
pub struct DeliveryWait {
    rx: oneshot::Receiver<()>,
    timestamp: u64,
    message_type: MessageType,
    timeout: Duration,
    acks: Arc<AckRegistry>,
}

impl DeliveryWait {
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Resolve once the correlated ACK arrives or the wait times out.
    pub async fn wait(self) -> SendOutcome {
        match tokio::time::timeout(self.timeout, self.rx).await {
            Ok(Ok(())) => SendOutcome::Delivered,
            Ok(Err(_)) => {
                // Registry cleared underneath us (disconnect).
                SendOutcome::TimedOut
            }
            Err(_) => {
                self.acks.forget(self.timestamp);
                warn!(
                    "No ACK for {} (ts {}) within {:?}",
                    self.message_type.as_str(),
                    self.timestamp,
                    self.timeout
                );
                SendOutcome::TimedOut
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer_pair() -> (mpsc::Sender<OutboundPacket>, mpsc::Receiver<OutboundPacket>) {
        mpsc::channel(64)
    }

    #[tokio::test]
    async fn test_ack_correlation_delivers() {
        let acks = Arc::new(AckRegistry::new());
        let mut sender = ReliableSender::new(acks.clone(), Duration::from_secs(5));
        let (tx, mut rx) = writer_pair();

        let responder_acks = acks.clone();
        tokio::spawn(async move {
            let mut reassembler = codec::PacketReassembler::new();
            while let Some(packet) = rx.recv().await {
                if let Some(bytes) = reassembler.push(&packet.bytes).unwrap() {
                    let msg = Message::from_bytes(&bytes).unwrap();
                    responder_acks.complete(msg.timestamp);
                }
            }
        });

        let outcome = sender
            .transmit(Message::text("hello"), None, 247, &tx)
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::Delivered);
    }

    #[tokio::test]
    async fn test_missing_ack_times_out() {
        let acks = Arc::new(AckRegistry::new());
        let mut sender = ReliableSender::new(acks, Duration::from_millis(50));
        let (tx, mut rx) = writer_pair();

        tokio::spawn(async move { while rx.recv().await.is_some() {} });

        let outcome = sender
            .transmit(Message::text("hello"), None, 247, &tx)
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_wrong_ack_timestamp_does_not_deliver() {
        let acks = Arc::new(AckRegistry::new());
        let mut sender = ReliableSender::new(acks.clone(), Duration::from_millis(50));
        let (tx, mut rx) = writer_pair();

        let responder_acks = acks.clone();
        tokio::spawn(async move {
            let mut reassembler = codec::PacketReassembler::new();
            while let Some(packet) = rx.recv().await {
                if let Some(bytes) = reassembler.push(&packet.bytes).unwrap() {
                    let msg = Message::from_bytes(&bytes).unwrap();
                    responder_acks.complete(msg.timestamp + 1);
                }
            }
        });

        let outcome = sender
            .transmit(Message::text("hello"), None, 247, &tx)
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_heartbeat_needs_no_ack() {
        let acks = Arc::new(AckRegistry::new());
        let mut sender = ReliableSender::new(acks, Duration::from_millis(50));
        let (tx, mut rx) = writer_pair();
        tokio::spawn(async move { while rx.recv().await.is_some() {} });

        let outcome = sender
            .transmit(Message::heartbeat(), None, 247, &tx)
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::Delivered);
    }

    #[tokio::test]
    async fn test_multi_packet_write_modes() {
        let acks = Arc::new(AckRegistry::new());
        let mut sender = ReliableSender::new(acks, Duration::from_millis(20));
        let (tx, mut rx) = writer_pair();

        let collector = tokio::spawn(async move {
            let mut packets = Vec::new();
            while let Some(packet) = rx.recv().await {
                packets.push(packet);
            }
            packets
        });

        let long_text = "x".repeat(200);
        let outcome = sender
            .transmit(Message::text(long_text), None, 23, &tx)
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::TimedOut);
        drop(tx);

        let packets = collector.await.unwrap();
        assert!(packets.len() > 1);
        assert!(packets.iter().all(|p| !p.with_response));
        assert!(packets.iter().all(|p| p.bytes.len() <= 23));
    }

    #[test]
    fn test_queue_overflow_drops_oldest_data() {
        let mut queue = SendQueue::new(2);
        assert_eq!(queue.push(Message::text("a")), SendOutcome::Queued);
        assert_eq!(queue.push(Message::text("b")), SendOutcome::Queued);
        assert_eq!(queue.push(Message::text("c")), SendOutcome::Queued);

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].payload, "b");
        assert_eq!(drained[1].payload, "c");
    }

    #[test]
    fn test_queue_never_evicts_control_messages() {
        let mut queue = SendQueue::new(1);
        assert_eq!(queue.push(Message::command("ENTER")), SendOutcome::Queued);
        // No data entry to evict: the new message is refused instead.
        assert_eq!(queue.push(Message::text("x")), SendOutcome::Dropped);
        assert_eq!(queue.len(), 1);
    }
}
