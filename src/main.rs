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

//! Speech2Prompt desktop daemon: the peripheral role.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use speech2prompt_core::bluetooth::{GattServer, LinkEvent};
use speech2prompt_core::config::Config;
use speech2prompt_core::events::EventProcessor;
use speech2prompt_core::input::StubInjector;
use speech2prompt_core::state::AppState;
use speech2prompt_core::storage::{History, SecureStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("speech2prompt_core=info".parse().unwrap())
                .add_directive("s2p_daemon=info".parse().unwrap()),
        )
        .init();

    info!(
        "Starting Speech2Prompt daemon v{}...",
        env!("CARGO_PKG_VERSION")
    );

    let config = Config::load()?;
    info!("Configuration loaded");

    let store = SecureStore::open(&config.data_dir)?;
    let device_id = store.load_or_create_device_id("linux")?;
    info!("Device ID: {}", device_id);

    let history = History::open(&config.data_dir, config.history.max_entries)?;

    // A concrete keystroke backend replaces the stub in deployments; the
    // daemon itself only needs the capability trait.
    let injector = Box::new(StubInjector);
    let state = AppState::new();

    let (event_tx, mut event_rx) = mpsc::channel::<LinkEvent>(32);
    let mut server = GattServer::new(
        device_id,
        store,
        config.bluetooth.auto_accept,
        event_tx,
    )
    .await?;
    server.set_name(&config.bluetooth.device_name).await?;
    server.start(&config.bluetooth.device_name).await?;
    info!(
        "Advertising as '{}' ({})",
        config.bluetooth.device_name,
        server.address().await?
    );

    let server = Arc::new(server);
    let mut processor = EventProcessor::new(injector, Some(history));

    loop {
        tokio::select! {
            event = event_rx.recv() => {
                let Some(event) = event else { break };

                match &event {
                    LinkEvent::Connected { peer_device_id } => {
                        state.set_connected(peer_device_id.clone());
                    }
                    LinkEvent::Disconnected => {
                        state.set_link_state(speech2prompt_core::bluetooth::LinkState::Disconnected);
                    }
                    LinkEvent::Error(reason) => {
                        state.set_error(reason.clone());
                    }
                    LinkEvent::Text(text) => {
                        state.set_last_text(text.clone());
                    }
                    LinkEvent::PairRequested { device_id, device_name } => {
                        // Headless policy: accept every request. A desktop
                        // shell replaces this with its confirmation dialog.
                        warn!(
                            "Accepting pairing from {} ({}) without confirmation UI",
                            device_name.as_deref().unwrap_or("unknown"),
                            device_id
                        );
                        let server = server.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.complete_pairing().await {
                                error!("Failed to complete pairing: {}", e);
                            }
                        });
                    }
                    _ => {}
                }

                if let Err(e) = processor.process_event(event) {
                    error!("Error processing event: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Speech2Prompt daemon stopped");
    Ok(())
}
