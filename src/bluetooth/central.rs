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

//! Central-side connection supervisor.
//!
//! Owns the whole client lifecycle for one peer: GATT connect, MTU and
//! characteristic discovery, notification subscription, pairing, the
//! heartbeat watchdog and exponential-backoff reconnects. All mutation
//! happens on the supervisor task; the public handle talks to it over a
//! command channel.

use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use bluer::gatt::remote::{Characteristic, CharacteristicWriteRequest};
use bluer::gatt::WriteOp;
use bluer::{Adapter, Address, Device};

use super::constants::{config, COMMAND_RX_UUID, MTU_INFO_UUID, RESPONSE_TX_UUID, SERVICE_UUID, STATUS_UUID};
use super::constants::StatusCode;
use super::dispatcher::{Inbound, MessageRouter};
use super::sender::{AckRegistry, OutboundPacket, ReliableSender, SendOutcome, SendQueue};
use super::LinkEvent;
use crate::crypto::CryptoContext;
use crate::protocol::{LinkError, Message, MessageType, PairingInitiator, WordPayload};
use crate::storage::SecureStore;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Pairing,
    Connected,
    Reconnecting,
    Failed,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Pairing => "pairing",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

/// Tunables for the central supervisor. Defaults match the protocol
/// documentation; tests shrink them.
#[derive(Debug, Clone)]
pub struct CentralConfig {
    pub connect_timeout: Duration,
    pub mtu_read_timeout: Duration,
    pub ack_timeout: Duration,
    pub pair_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub queue_capacity: usize,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            mtu_read_timeout: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(5),
            pair_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(5),
            reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_secs(1),
            queue_capacity: super::sender::QUEUE_CAPACITY,
        }
    }
}

impl CentralConfig {
    /// Backoff before reconnect attempt `attempt` (1-based): base * 2^(n-1).
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        self.reconnect_base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }

    /// Inbound silence longer than this means the link is gone.
    pub fn silence_limit(&self) -> Duration {
        self.heartbeat_interval * 3
    }
}

/// Our identity as presented during pairing.
#[derive(Debug, Clone)]
pub struct LinkIdentity {
    pub device_id: String,
    pub device_name: Option<String>,
}

enum LinkCommand {
    Send {
        message: Message,
        reply: oneshot::Sender<SendOutcome>,
    },
    Shutdown,
}

/// Handle to a running central link.
pub struct CentralLink {
    commands: mpsc::Sender<LinkCommand>,
    task: JoinHandle<()>,
}

impl CentralLink {
    /// Spawn a supervisor for the given peer. Events arrive on the returned
    /// receiver; the connection machinery starts immediately.
    pub fn start(
        adapter: Adapter,
        peer: Address,
        identity: LinkIdentity,
        store: SecureStore,
        cfg: CentralConfig,
    ) -> (Self, mpsc::Receiver<LinkEvent>) {
        let (event_tx, event_rx) = mpsc::channel(32);
        let (command_tx, command_rx) = mpsc::channel(32);

        let acks = Arc::new(AckRegistry::new());
        let supervisor = Supervisor {
            adapter,
            peer,
            identity,
            store,
            sender: ReliableSender::new(acks.clone(), cfg.ack_timeout),
            queue: SendQueue::new(cfg.queue_capacity),
            router: MessageRouter::new(acks.clone()),
            acks,
            cfg,
            events: event_tx,
            commands: command_rx,
            state: LinkState::Disconnected,
            ctx: None,
        };

        let task = tokio::spawn(supervisor.run());
        (
            Self {
                commands: command_tx,
                task,
            },
            event_rx,
        )
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<SendOutcome, LinkError> {
        self.send(Message::text(text)).await
    }

    pub async fn send_word(&self, payload: &WordPayload) -> Result<SendOutcome, LinkError> {
        self.send(Message::word(payload)?).await
    }

    pub async fn send_command(&self, code: impl Into<String>) -> Result<SendOutcome, LinkError> {
        self.send(Message::command(code)).await
    }

    async fn send(&self, message: Message) -> Result<SendOutcome, LinkError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(LinkCommand::Send { message, reply })
            .await
            .map_err(|_| LinkError::Transport("supervisor stopped".into()))?;
        rx.await
            .map_err(|_| LinkError::Transport("supervisor dropped request".into()))
    }

    /// Stop the supervisor and disconnect.
    pub async fn shutdown(self) {
        let _ = self.commands.send(LinkCommand::Shutdown).await;
        let _ = self.task.await;
    }
}

type PacketStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send + Sync>>;

struct Session {
    device: Device,
    write_tx: mpsc::Sender<OutboundPacket>,
    writer: JoinHandle<()>,
    notify: PacketStream,
    status: PacketStream,
    mtu: usize,
}

enum SessionEnd {
    Shutdown,
    Lost(String),
}

struct Supervisor {
    adapter: Adapter,
    peer: Address,
    identity: LinkIdentity,
    store: SecureStore,
    cfg: CentralConfig,
    events: mpsc::Sender<LinkEvent>,
    commands: mpsc::Receiver<LinkCommand>,
    sender: ReliableSender,
    queue: SendQueue,
    router: MessageRouter,
    acks: Arc<AckRegistry>,
    state: LinkState,
    ctx: Option<Arc<CryptoContext>>,
}

impl Supervisor {
    async fn run(mut self) {
        let mut attempts: u32 = 0;

        loop {
            match self.establish().await {
                Ok(session) => {
                    attempts = 0;
                    match self.run_session(session).await {
                        SessionEnd::Shutdown => {
                            self.set_state(LinkState::Disconnected).await;
                            return;
                        }
                        SessionEnd::Lost(reason) => {
                            warn!("Session lost: {}", reason);
                            self.emit(LinkEvent::Disconnected).await;
                        }
                    }
                }
                Err(LinkError::Pairing(reason)) => {
                    // Rejection is terminal; backing off and retrying would
                    // just re-prompt the peer's user.
                    self.fail(format!("pairing failed: {}", reason)).await;
                    return;
                }
                Err(e) => {
                    warn!("Connection attempt failed: {}", e);
                }
            }

            self.teardown();

            attempts += 1;
            if attempts > self.cfg.reconnect_attempts {
                self.fail(format!(
                    "gave up after {} reconnect attempts",
                    self.cfg.reconnect_attempts
                ))
                .await;
                return;
            }

            let delay = self.cfg.reconnect_delay(attempts);
            info!(
                "Reconnecting to {} in {:?} (attempt {}/{})",
                self.peer, delay, attempts, self.cfg.reconnect_attempts
            );
            self.set_state(LinkState::Reconnecting).await;

            // Stay responsive to shutdown during the backoff.
            if let Ok(true) = tokio::time::timeout(delay, self.wait_for_shutdown()).await {
                self.set_state(LinkState::Disconnected).await;
                return;
            }
        }
    }

    /// Answer queued sends and watch for shutdown while not connected.
    /// Returns true on shutdown.
    async fn wait_for_shutdown(&mut self) -> bool {
        while let Some(command) = self.commands.recv().await {
            match command {
                LinkCommand::Shutdown => return true,
                LinkCommand::Send { message, reply } => {
                    let outcome = self.buffer_offline(message);
                    let _ = reply.send(outcome);
                }
            }
        }
        true
    }

    fn buffer_offline(&mut self, message: Message) -> SendOutcome {
        match message.message_type {
            // Liveness traffic is meaningless while the link is down.
            MessageType::Heartbeat => SendOutcome::Dropped,
            _ => self.queue.push(message),
        }
    }

    async fn establish(&mut self) -> Result<Session, LinkError> {
        self.set_state(LinkState::Connecting).await;

        let device = self.adapter.device(self.peer)?;
        tokio::time::timeout(self.cfg.connect_timeout, device.connect())
            .await
            .map_err(|_| LinkError::Transport("GATT connect timeout".into()))??;
        info!("Connected to {}", self.peer);

        let (command_rx, response_tx, status, mtu_info) = self.discover(&device).await?;

        let mtu = self.read_mtu(&mtu_info).await;
        debug!("Using MTU {}", mtu);

        let notify: PacketStream = Box::pin(response_tx.notify().await?);
        let status_stream: PacketStream = Box::pin(status.notify().await?);

        let (write_tx, writer) = spawn_writer(command_rx);

        let mut session = Session {
            device,
            write_tx,
            writer,
            notify,
            status: status_stream,
            mtu,
        };

        self.pair(&mut session).await?;

        Ok(session)
    }

    /// Find our service and its characteristics.
    async fn discover(
        &self,
        device: &Device,
    ) -> Result<(Characteristic, Characteristic, Characteristic, Characteristic), LinkError> {
        for service in device.services().await? {
            if service.uuid().await? != SERVICE_UUID {
                continue;
            }

            let mut command_rx = None;
            let mut response_tx = None;
            let mut status = None;
            let mut mtu_info = None;

            for characteristic in service.characteristics().await? {
                let uuid = characteristic.uuid().await?;
                if uuid == COMMAND_RX_UUID {
                    command_rx = Some(characteristic);
                } else if uuid == RESPONSE_TX_UUID {
                    response_tx = Some(characteristic);
                } else if uuid == STATUS_UUID {
                    status = Some(characteristic);
                } else if uuid == MTU_INFO_UUID {
                    mtu_info = Some(characteristic);
                }
            }

            return match (command_rx, response_tx, status, mtu_info) {
                (Some(c), Some(r), Some(s), Some(m)) => Ok((c, r, s, m)),
                _ => Err(LinkError::Transport(
                    "service is missing expected characteristics".into(),
                )),
            };
        }

        Err(LinkError::Transport("service not found on peer".into()))
    }

    /// Learn the negotiated MTU from the peripheral's MTU-info
    /// characteristic; BlueZ has already performed the ATT exchange.
    async fn read_mtu(&self, mtu_info: &Characteristic) -> usize {
        match tokio::time::timeout(self.cfg.mtu_read_timeout, mtu_info.read()).await {
            Ok(Ok(bytes)) if bytes.len() >= 2 => {
                let mtu = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
                mtu.max(config::MIN_MTU)
            }
            Ok(Ok(_)) | Ok(Err(_)) | Err(_) => {
                warn!("MTU read failed, falling back to {}", config::DEFAULT_MTU);
                config::DEFAULT_MTU
            }
        }
    }

    /// Run the pairing handshake on a fresh session. PAIR_REQ bypasses the
    /// send queue; it is the only message legal in this state.
    async fn pair(&mut self, session: &mut Session) -> Result<(), LinkError> {
        self.set_state(LinkState::Pairing).await;

        let stored_key = self
            .store
            .peer_by_address(&self.peer.to_string())
            .and_then(|record| record.secret_key().ok());

        let initiator = PairingInitiator::new(
            self.identity.device_id.clone(),
            self.identity.device_name.clone(),
        );
        let request = initiator.request();

        let message = Message::new(MessageType::PairReq, request.to_json()?);
        self.sender
            .write_message(message, None, session.mtu, &session.write_tx)
            .await?;

        let deadline = Instant::now() + self.cfg.pair_timeout;
        let ack = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let packet = tokio::time::timeout(remaining, session.notify.next())
                .await
                .map_err(|_| LinkError::Pairing("no PAIR_ACK within the pair window".into()))?
                .ok_or_else(|| LinkError::Transport("notify stream closed".into()))?;

            if let Some(routed) = self.router.handle_packet(&packet, None, false) {
                if let Some(Inbound::PairAck(payload)) = routed.inbound {
                    break payload;
                }
            }
        };

        let outcome = initiator.complete(&ack, stored_key)?;

        if outcome.newly_paired {
            self.store.store_peer(
                &self.peer.to_string(),
                &outcome.peer_device_id,
                &self.identity.device_id,
                outcome.context.key(),
            )?;
        }

        self.ctx = Some(Arc::new(outcome.context));
        self.set_state(LinkState::Connected).await;
        self.emit(LinkEvent::Connected {
            peer_device_id: outcome.peer_device_id,
        })
        .await;

        Ok(())
    }

    async fn run_session(&mut self, mut session: Session) -> SessionEnd {
        // Flush everything buffered while the link was down.
        for message in self.queue.drain() {
            if let Err(e) = self.write_detached(message, &session).await {
                return SessionEnd::Lost(format!("queue drain failed: {}", e));
            }
        }

        let mut heartbeat = tokio::time::interval(self.cfg.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_inbound = Instant::now();

        let end = loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(LinkCommand::Shutdown) | None => break SessionEnd::Shutdown,
                    Some(LinkCommand::Send { message, reply }) => {
                        match self.write_with_reply(message, &session, reply).await {
                            Ok(()) => {}
                            Err(e) => break SessionEnd::Lost(e.to_string()),
                        }
                    }
                },
                packet = session.notify.next() => match packet {
                    Some(packet) => {
                        last_inbound = Instant::now();
                        if let Err(e) = self.handle_inbound(&packet, &session).await {
                            break SessionEnd::Lost(e.to_string());
                        }
                    }
                    None => break SessionEnd::Lost("notify stream closed".into()),
                },
                status = session.status.next() => match status {
                    Some(bytes) => {
                        last_inbound = Instant::now();
                        self.handle_status(&bytes).await;
                    }
                    None => break SessionEnd::Lost("status stream closed".into()),
                },
                _ = heartbeat.tick() => {
                    if last_inbound.elapsed() > self.cfg.silence_limit() {
                        break SessionEnd::Lost(format!(
                            "no inbound activity for {:?}",
                            last_inbound.elapsed()
                        ));
                    }
                    let beat = Message::heartbeat();
                    if let Err(e) = self
                        .sender
                        .write_message(beat, self.ctx.as_deref(), session.mtu, &session.write_tx)
                        .await
                    {
                        break SessionEnd::Lost(format!("heartbeat write failed: {}", e));
                    }
                }
            }
        };

        session.writer.abort();
        let _ = session.device.disconnect().await;
        end
    }

    /// Write a message and resolve its delivery from a spawned task so the
    /// event loop keeps routing the inbound ACK stream.
    async fn write_with_reply(
        &mut self,
        message: Message,
        session: &Session,
        reply: oneshot::Sender<SendOutcome>,
    ) -> Result<(), LinkError> {
        match self
            .sender
            .write_message(message, self.ctx.as_deref(), session.mtu, &session.write_tx)
            .await
        {
            Ok(Some(wait)) => {
                tokio::spawn(async move {
                    let _ = reply.send(wait.wait().await);
                });
                Ok(())
            }
            Ok(None) => {
                let _ = reply.send(SendOutcome::Delivered);
                Ok(())
            }
            Err(e) => {
                let _ = reply.send(SendOutcome::TimedOut);
                Err(e)
            }
        }
    }

    /// Write a queued message; delivery outcome is only logged.
    async fn write_detached(&mut self, message: Message, session: &Session) -> Result<(), LinkError> {
        let message_type = message.message_type;
        match self
            .sender
            .write_message(message, self.ctx.as_deref(), session.mtu, &session.write_tx)
            .await?
        {
            Some(wait) => {
                tokio::spawn(async move {
                    if wait.wait().await != SendOutcome::Delivered {
                        warn!("Queued {} was not acknowledged", message_type.as_str());
                    }
                });
            }
            None => {}
        }
        Ok(())
    }

    async fn handle_inbound(&mut self, packet: &[u8], session: &Session) -> Result<(), LinkError> {
        let authenticated = self.state == LinkState::Connected;
        let Some(routed) = self
            .router
            .handle_packet(packet, self.ctx.as_deref(), authenticated)
        else {
            return Ok(());
        };

        if let Some(ack) = routed.ack {
            self.sender
                .write_message(ack, self.ctx.as_deref(), session.mtu, &session.write_tx)
                .await?;
        }

        match routed.inbound {
            Some(Inbound::Text(text)) => self.emit(LinkEvent::Text(text)).await,
            Some(Inbound::Word(word)) => self.emit(LinkEvent::Word(word)).await,
            Some(Inbound::Command(code)) => self.emit(LinkEvent::Command(code)).await,
            Some(Inbound::PairAck(_)) => {
                debug!("Stray PAIR_ACK ignored");
            }
            Some(Inbound::PairRequest(_)) => {
                warn!("Peer sent PAIR_REQ to a central, ignoring");
            }
            None => {}
        }
        Ok(())
    }

    async fn handle_status(&mut self, bytes: &[u8]) {
        let Some(&code) = bytes.first() else {
            return;
        };
        match StatusCode::from_u8(code) {
            Some(StatusCode::Error) => {
                self.emit(LinkEvent::Error("peer reported error state".into()))
                    .await;
            }
            Some(status) => debug!("Peer status: {:?}", status),
            None => warn!("Unknown peer status code {:#04x}", code),
        }
    }

    fn teardown(&mut self) {
        self.acks.clear();
        self.router.reset();
        self.ctx = None;
    }

    async fn fail(&mut self, reason: String) {
        warn!("Link failed: {}", reason);
        self.set_state(LinkState::Failed).await;
        self.emit(LinkEvent::Error(reason)).await;
    }

    async fn set_state(&mut self, state: LinkState) {
        if self.state != state {
            info!("Link state: {} -> {}", self.state.as_str(), state.as_str());
            self.state = state;
            self.emit(LinkEvent::StateChanged(state)).await;
        }
    }

    async fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event).await;
    }
}

/// Writer task owning the Command-RX characteristic. TEXT/WORD packets go
/// out write-without-response for throughput; control traffic waits for the
/// write confirmation.
fn spawn_writer(
    characteristic: Characteristic,
) -> (mpsc::Sender<OutboundPacket>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<OutboundPacket>(32);

    let task = tokio::spawn(async move {
        while let Some(packet) = rx.recv().await {
            let op_type = if packet.with_response {
                WriteOp::Request
            } else {
                WriteOp::Command
            };
            let request = CharacteristicWriteRequest {
                op_type,
                ..Default::default()
            };
            if let Err(e) = characteristic.write_ext(&packet.bytes, &request).await {
                warn!("GATT write failed: {}", e);
                break;
            }
        }
        debug!("Writer task exiting");
    });

    (tx, task)
}
