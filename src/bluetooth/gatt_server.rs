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

//! Peripheral-side BLE GATT server.
//!
//! Advertises the link service, accepts one central at a time, feeds
//! Command-RX writes through the shared receive pipeline and answers on the
//! Response-TX notify characteristic. Pairing decisions for unknown peers
//! are delegated to the embedding application via [`LinkEvent::PairRequested`].

use anyhow::{anyhow, Result};
use bluer::adv::{Advertisement, AdvertisementHandle};
use bluer::gatt::local::{
    characteristic_control, Application, ApplicationHandle, Characteristic, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicRead, CharacteristicReadRequest,
    CharacteristicWrite, CharacteristicWriteMethod, CharacteristicWriteRequest, Service,
};
use bluer::{Adapter, Address};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::codec::chunk;
use super::constants::*;
use super::dispatcher::{Inbound, MessageRouter};
use super::sender::AckRegistry;
use super::LinkEvent;
use crate::crypto::CryptoContext;
use crate::protocol::{
    LinkError, Message, PairRequestPayload, PairingResponder, PendingPairing,
};
use crate::storage::SecureStore;

/// Shared state for the GATT server.
struct ServerState {
    router: MessageRouter,
    crypto: Option<Arc<CryptoContext>>,
    authenticated: bool,
    peer_device_id: Option<String>,
    negotiated_mtu: usize,
    status_code: StatusCode,
    pending: Option<PendingPairing>,
    store: SecureStore,
    /// Silently approve peers present in the credential store.
    auto_accept: bool,
}

impl ServerState {
    fn new(store: SecureStore, auto_accept: bool) -> Self {
        Self {
            router: MessageRouter::new(Arc::new(AckRegistry::new())),
            crypto: None,
            authenticated: false,
            peer_device_id: None,
            negotiated_mtu: config::DEFAULT_MTU,
            status_code: StatusCode::Idle,
            pending: None,
            store,
            auto_accept,
        }
    }

    /// Drop the session context, keeping stored credentials intact.
    fn reset_session(&mut self) {
        self.router.reset();
        self.crypto = None;
        self.authenticated = false;
        self.peer_device_id = None;
        self.pending = None;
        self.status_code = StatusCode::Idle;
    }
}

/// BLE GATT server for the desktop side of the link.
pub struct GattServer {
    adapter: Adapter,
    self_device_id: String,
    event_tx: mpsc::Sender<LinkEvent>,
    state: Arc<RwLock<ServerState>>,
    response_tx: Arc<Mutex<Option<mpsc::Sender<Vec<u8>>>>>,
    status_tx: Arc<Mutex<Option<mpsc::Sender<Vec<u8>>>>>,
    _adv_handle: Option<AdvertisementHandle>,
    _app_handle: Option<ApplicationHandle>,
}

impl GattServer {
    /// Create a new GATT server on the default adapter.
    pub async fn new(
        self_device_id: String,
        store: SecureStore,
        auto_accept: bool,
        event_tx: mpsc::Sender<LinkEvent>,
    ) -> Result<Self> {
        info!("Initializing BLE GATT server...");

        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        info!("Using Bluetooth adapter: {}", adapter.name());

        if !adapter.is_powered().await? {
            info!("Powering on Bluetooth adapter...");
            adapter.set_powered(true).await?;
        }

        Ok(Self {
            adapter,
            self_device_id,
            event_tx,
            state: Arc::new(RwLock::new(ServerState::new(store, auto_accept))),
            response_tx: Arc::new(Mutex::new(None)),
            status_tx: Arc::new(Mutex::new(None)),
            _adv_handle: None,
            _app_handle: None,
        })
    }

    /// Our device ID, as sent in pairing acknowledgments.
    pub fn device_id(&self) -> &str {
        &self.self_device_id
    }

    /// The adapter address.
    pub async fn address(&self) -> Result<Address> {
        Ok(self.adapter.address().await?)
    }

    /// Set the advertised device name.
    pub async fn set_name(&self, name: &str) -> Result<()> {
        self.adapter.set_alias(name.to_string()).await?;
        info!("Bluetooth name set to: {}", name);
        Ok(())
    }

    /// Register the GATT application and start advertising.
    pub async fn start(&mut self, local_name: &str) -> Result<()> {
        self.register_gatt_service().await?;
        self.start_advertising(local_name).await?;
        info!("GATT server started");
        Ok(())
    }

    async fn register_gatt_service(&mut self) -> Result<()> {
        let state = self.state.clone();
        let event_tx = self.event_tx.clone();
        let self_device_id = self.self_device_id.clone();
        let response_tx = self.response_tx.clone();
        let status_tx = self.status_tx.clone();

        // Command RX: the central writes packets here.
        let (_cmd_rx_control, cmd_rx_control_handle) = characteristic_control();
        let cmd_rx_char = {
            let state = state.clone();
            let event_tx = event_tx.clone();
            let response_tx = response_tx.clone();
            let status_tx = status_tx.clone();

            Characteristic {
                uuid: COMMAND_RX_UUID,
                write: Some(CharacteristicWrite {
                    write: true,
                    write_without_response: true,
                    method: CharacteristicWriteMethod::Fun(Box::new(
                        move |data: Vec<u8>, req: CharacteristicWriteRequest| {
                            let state = state.clone();
                            let event_tx = event_tx.clone();
                            let self_device_id = self_device_id.clone();
                            let response_tx = response_tx.clone();
                            let status_tx = status_tx.clone();

                            Box::pin(async move {
                                Self::handle_command_write(
                                    data,
                                    req,
                                    state,
                                    event_tx,
                                    self_device_id,
                                    response_tx,
                                    status_tx,
                                )
                                .await;
                                Ok(())
                            })
                        },
                    )),
                    ..Default::default()
                }),
                control_handle: cmd_rx_control_handle,
                ..Default::default()
            }
        };

        // Response TX: our packets go out as notifications.
        let (_resp_tx_control, resp_tx_control_handle) = characteristic_control();
        let (resp_notify_tx, resp_notify_rx) = mpsc::channel::<Vec<u8>>(32);
        let resp_notify_rx = Arc::new(Mutex::new(resp_notify_rx));
        *response_tx.lock().await = Some(resp_notify_tx);

        let resp_tx_char = {
            let event_tx = event_tx.clone();

            Characteristic {
                uuid: RESPONSE_TX_UUID,
                notify: Some(CharacteristicNotify {
                    notify: true,
                    method: CharacteristicNotifyMethod::Fun(Box::new(move |mut notifier| {
                        let resp_notify_rx = resp_notify_rx.clone();
                        let event_tx = event_tx.clone();

                        Box::pin(async move {
                            debug!("Response TX notification loop started");
                            loop {
                                let data = {
                                    let mut rx = resp_notify_rx.lock().await;
                                    rx.recv().await
                                };

                                match data {
                                    Some(data) => {
                                        if let Err(e) = notifier.notify(data).await {
                                            error!("Failed to send notification: {}", e);
                                            break;
                                        }
                                    }
                                    None => break,
                                }
                            }
                            info!("Response TX notification loop exited");
                            let _ = event_tx.send(LinkEvent::Disconnected).await;
                        })
                    })),
                    ..Default::default()
                }),
                control_handle: resp_tx_control_handle,
                ..Default::default()
            }
        };

        // Status: one-byte codes, readable and notified on change.
        let (_status_control, status_control_handle) = characteristic_control();
        let (status_notify_tx, status_notify_rx) = mpsc::channel::<Vec<u8>>(32);
        let status_notify_rx = Arc::new(Mutex::new(status_notify_rx));
        *status_tx.lock().await = Some(status_notify_tx);

        let status_char = {
            let state = state.clone();

            Characteristic {
                uuid: STATUS_UUID,
                read: Some(CharacteristicRead {
                    read: true,
                    fun: Box::new(move |_req: CharacteristicReadRequest| {
                        let state = state.clone();
                        Box::pin(async move {
                            let state = state.read().await;
                            Ok(state.status_code.as_bytes())
                        })
                    }),
                    ..Default::default()
                }),
                notify: Some(CharacteristicNotify {
                    notify: true,
                    method: CharacteristicNotifyMethod::Fun(Box::new(move |mut notifier| {
                        let status_notify_rx = status_notify_rx.clone();

                        Box::pin(async move {
                            loop {
                                let data = {
                                    let mut rx = status_notify_rx.lock().await;
                                    rx.recv().await
                                };

                                match data {
                                    Some(data) => {
                                        if let Err(e) = notifier.notify(data).await {
                                            error!("Failed to send status notification: {}", e);
                                            break;
                                        }
                                    }
                                    None => break,
                                }
                            }
                        })
                    })),
                    ..Default::default()
                }),
                control_handle: status_control_handle,
                ..Default::default()
            }
        };

        // MTU info: lets the central learn the negotiated ATT MTU.
        let mtu_char = {
            let state = state.clone();

            Characteristic {
                uuid: MTU_INFO_UUID,
                read: Some(CharacteristicRead {
                    read: true,
                    fun: Box::new(move |_req: CharacteristicReadRequest| {
                        let state = state.clone();
                        Box::pin(async move {
                            let state = state.read().await;
                            Ok((state.negotiated_mtu as u16).to_le_bytes().to_vec())
                        })
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }
        };

        let service = Service {
            uuid: SERVICE_UUID,
            primary: true,
            characteristics: vec![cmd_rx_char, resp_tx_char, status_char, mtu_char],
            ..Default::default()
        };

        let app = Application {
            services: vec![service],
            ..Default::default()
        };

        self._app_handle = Some(self.adapter.serve_gatt_application(app).await?);
        info!("GATT service registered");

        Ok(())
    }

    /// Handle one write to the Command-RX characteristic.
    #[allow(clippy::too_many_arguments)]
    async fn handle_command_write(
        data: Vec<u8>,
        req: CharacteristicWriteRequest,
        state: Arc<RwLock<ServerState>>,
        event_tx: mpsc::Sender<LinkEvent>,
        self_device_id: String,
        response_tx: Arc<Mutex<Option<mpsc::Sender<Vec<u8>>>>>,
        status_tx: Arc<Mutex<Option<mpsc::Sender<Vec<u8>>>>>,
    ) {
        let mut state = state.write().await;

        // The write request carries the effective ATT MTU for this client.
        let write_mtu = req.mtu as usize;
        if write_mtu > state.negotiated_mtu {
            info!("MTU updated: {} -> {}", state.negotiated_mtu, write_mtu);
            state.negotiated_mtu = write_mtu;
        }

        let crypto = state.crypto.clone();
        let authenticated = state.authenticated;
        let Some(routed) = state
            .router
            .handle_packet(&data, crypto.as_deref(), authenticated)
        else {
            return;
        };

        if let Some(ack) = routed.ack {
            Self::send_message(ack, &state, &response_tx).await;
        }

        match routed.inbound {
            Some(Inbound::PairRequest(payload)) => {
                Self::handle_pair_request(
                    payload,
                    &mut state,
                    &event_tx,
                    &self_device_id,
                    &response_tx,
                    &status_tx,
                )
                .await;
            }
            Some(Inbound::Text(text)) => {
                debug!("Text received: {} chars", text.len());
                let _ = event_tx.send(LinkEvent::Text(text)).await;
            }
            Some(Inbound::Word(word)) => {
                debug!("Word received: '{}'", word.word.trim());
                let _ = event_tx.send(LinkEvent::Word(word)).await;
            }
            Some(Inbound::Command(code)) => {
                debug!("Command received: {}", code);
                let _ = event_tx.send(LinkEvent::Command(code)).await;
            }
            Some(Inbound::PairAck(_)) => {
                warn!("Unexpected PAIR_ACK from central");
            }
            None => {}
        }
    }

    async fn handle_pair_request(
        payload: PairRequestPayload,
        state: &mut ServerState,
        event_tx: &mpsc::Sender<LinkEvent>,
        self_device_id: &str,
        response_tx: &Arc<Mutex<Option<mpsc::Sender<Vec<u8>>>>>,
        status_tx: &Arc<Mutex<Option<mpsc::Sender<Vec<u8>>>>>,
    ) {
        info!(
            "Pairing request from {} ({})",
            payload.device_name.as_deref().unwrap_or("unknown"),
            payload.device_id
        );

        // A PAIR_REQ while authenticated re-pairs from scratch.
        if state.authenticated {
            info!("Re-pairing requested, dropping current session context");
            state.reset_session();
        }

        let responder = PairingResponder::new(self_device_id);

        // Known peer: silent approval with the stored secret, no prompt.
        let stored_key = if state.auto_accept {
            state
                .store
                .peer_by_device_id(&payload.device_id)
                .and_then(|record| record.secret_key().ok())
        } else {
            None
        };
        if let Some(key) = stored_key {
            let (ack, outcome) = responder.auto_approve(&payload, key);
            match Self::pair_ack_message(&ack) {
                Ok(message) => {
                    Self::send_message(message, state, response_tx).await;
                    state.crypto = Some(Arc::new(outcome.context));
                    state.authenticated = true;
                    state.peer_device_id = Some(outcome.peer_device_id.clone());
                    Self::set_status(state, StatusCode::Paired, status_tx).await;
                    let _ = event_tx
                        .send(LinkEvent::Connected {
                            peer_device_id: outcome.peer_device_id,
                        })
                        .await;
                }
                Err(e) => error!("Failed to build PAIR_ACK: {}", e),
            }
            return;
        }

        // Unknown peer: hold the exchange until the user decides.
        match responder.begin(&payload) {
            Ok(pending) => {
                state.peer_device_id = Some(payload.device_id.clone());
                state.pending = Some(pending);
                Self::set_status(state, StatusCode::AwaitingPairing, status_tx).await;
                let _ = event_tx
                    .send(LinkEvent::PairRequested {
                        device_id: payload.device_id,
                        device_name: payload.device_name,
                    })
                    .await;
            }
            Err(e) => {
                warn!("Rejecting unusable pair request: {}", e);
                let ack = responder.reject("invalid pair request");
                if let Ok(message) = Self::pair_ack_message(&ack) {
                    Self::send_message(message, state, response_tx).await;
                }
                Self::set_status(state, StatusCode::Error, status_tx).await;
            }
        }
    }

    /// Complete pairing after user approval.
    pub async fn complete_pairing(&self) -> Result<()> {
        let mut state = self.state.write().await;

        let pending = state
            .pending
            .take()
            .ok_or_else(|| anyhow!("no pending pairing request"))?;
        let peer_name = pending.peer_device_name().map(|s| s.to_string());

        let (ack, outcome) = pending.approve()?;

        // Persist so the next connection auto-approves. BlueZ does not hand
        // us the central's address here, so the record is looked up by
        // device ID on this side.
        state.store.store_peer(
            "",
            &outcome.peer_device_id,
            &self.self_device_id,
            outcome.context.key(),
        )?;

        let message = Self::pair_ack_message(&ack)?;
        Self::send_message(message, &state, &self.response_tx).await;

        state.crypto = Some(Arc::new(outcome.context));
        state.authenticated = true;
        state.peer_device_id = Some(outcome.peer_device_id.clone());
        Self::set_status(&mut state, StatusCode::Paired, &self.status_tx).await;

        info!("Pairing completed with device {}", outcome.peer_device_id);

        let _ = self
            .event_tx
            .send(LinkEvent::Connected {
                peer_device_id: peer_name.unwrap_or(outcome.peer_device_id),
            })
            .await;

        Ok(())
    }

    /// Reject the pending pairing request.
    pub async fn reject_pairing(&self, reason: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.pending = None;

        let responder = PairingResponder::new(&self.self_device_id);
        let ack = responder.reject(reason);
        let message = Self::pair_ack_message(&ack)?;
        Self::send_message(message, &state, &self.response_tx).await;

        Self::set_status(&mut state, StatusCode::Idle, &self.status_tx).await;

        info!(
            "Pairing rejected for device {}: {}",
            state.peer_device_id.as_deref().unwrap_or("unknown"),
            reason
        );
        Ok(())
    }

    /// Remove stored credentials for a peer and drop the session if it is
    /// the active one.
    pub async fn unpair(&self, peer_device_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.store.remove_peer_by_device_id(peer_device_id)?;
        if state.peer_device_id.as_deref() == Some(peer_device_id) {
            state.reset_session();
        }
        info!("Unpaired device {}", peer_device_id);
        Ok(())
    }

    fn pair_ack_message(
        ack: &crate::protocol::PairAckPayload,
    ) -> Result<Message, LinkError> {
        Ok(Message::new(
            crate::protocol::MessageType::PairAck,
            ack.to_json()?,
        ))
    }

    /// Seal, chunk and queue a message on the Response-TX notify path.
    async fn send_message(
        mut message: Message,
        state: &ServerState,
        response_tx: &Arc<Mutex<Option<mpsc::Sender<Vec<u8>>>>>,
    ) {
        if let Err(e) = message.seal(state.crypto.as_deref()) {
            error!("Failed to seal outbound message: {}", e);
            return;
        }

        let bytes = match message.to_bytes() {
            Ok(b) => b,
            Err(e) => {
                error!("Failed to serialize outbound message: {}", e);
                return;
            }
        };

        let packets = match chunk(&bytes, state.negotiated_mtu) {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to chunk outbound message: {}", e);
                return;
            }
        };

        let tx_guard = response_tx.lock().await;
        if let Some(ref tx) = *tx_guard {
            for packet in packets {
                if tx.send(packet).await.is_err() {
                    warn!("Response TX channel closed, dropping packets");
                    break;
                }
            }
        }
    }

    async fn set_status(
        state: &mut ServerState,
        code: StatusCode,
        status_tx: &Arc<Mutex<Option<mpsc::Sender<Vec<u8>>>>>,
    ) {
        state.status_code = code;
        let tx_guard = status_tx.lock().await;
        if let Some(ref tx) = *tx_guard {
            let _ = tx.send(code.as_bytes()).await;
        }
    }

    async fn start_advertising(&mut self, local_name: &str) -> Result<()> {
        let adv = Advertisement {
            service_uuids: vec![SERVICE_UUID].into_iter().collect(),
            discoverable: Some(true),
            local_name: Some(local_name.to_string()),
            ..Default::default()
        };

        self._adv_handle = Some(self.adapter.advertise(adv).await?);
        info!("BLE advertising started");
        Ok(())
    }
}
