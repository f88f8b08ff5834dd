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

//! Line-oriented test client for the central role.
//!
//! Connects to a daemon and streams fake recognizer output through the
//! deduper, exactly like the mobile client would:
//!
//! ```text
//! Usage: stream-client <peer-address>
//!   p <text>   feed a partial transcript
//!   f <text>   feed the final transcript
//!   c <CODE>   send a command (ENTER, SELECT_ALL, ...)
//!   q          quit
//! ```

use anyhow::{anyhow, Result};
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info};

use speech2prompt_core::bluetooth::{CentralLink, LinkEvent, LinkIdentity, SendOutcome};
use speech2prompt_core::config::Config;
use speech2prompt_core::speech::TranscriptDeduper;
use speech2prompt_core::storage::SecureStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let address = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow!("usage: stream-client <peer-address>"))?;
    let peer = bluer::Address::from_str(&address)
        .map_err(|e| anyhow!("bad address '{}': {}", address, e))?;

    let config = Config::load()?;
    let store = SecureStore::open(&config.data_dir)?;
    let device_id = store.load_or_create_device_id("cli")?;

    let session = bluer::Session::new().await?;
    let adapter = session.default_adapter().await?;
    adapter.set_powered(true).await?;

    info!("Connecting to {} as {}", peer, device_id);
    let identity = LinkIdentity {
        device_id,
        device_name: Some("Stream Client".to_string()),
    };
    let (link, mut events) = CentralLink::start(
        adapter,
        peer,
        identity,
        store,
        config.link.to_central_config(),
    );
    let link = Arc::new(link);

    // Log link events in the background.
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                LinkEvent::StateChanged(state) => info!("link: {}", state.as_str()),
                LinkEvent::Connected { peer_device_id } => {
                    info!("paired with {}", peer_device_id)
                }
                LinkEvent::Error(reason) => error!("link error: {}", reason),
                other => info!("event: {:?}", other),
            }
        }
    });

    // Deduper output feeds the link as TEXT.
    let (delta_tx, mut delta_rx) = mpsc::channel::<String>(32);
    let sender_link = link.clone();
    tokio::spawn(async move {
        while let Some(delta) = delta_rx.recv().await {
            match sender_link.send_text(delta.clone()).await {
                Ok(SendOutcome::Delivered) => info!("delivered: {:?}", delta),
                Ok(outcome) => info!("{:?}: {:?}", outcome, delta),
                Err(e) => error!("send failed: {}", e),
            }
        }
    });
    let mut deduper = TranscriptDeduper::new(delta_tx);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line.split_once(' ') {
            Some(("p", text)) => deduper.on_partial(text).await,
            Some(("f", text)) => deduper.on_final(text).await,
            Some(("c", code)) => match link.send_command(code.to_uppercase()).await {
                Ok(outcome) => info!("{:?}", outcome),
                Err(e) => error!("send failed: {}", e),
            },
            None if line == "q" => break,
            _ => eprintln!("commands: p <text> | f <text> | c <CODE> | q"),
        }
    }

    match Arc::try_unwrap(link) {
        Ok(link) => link.shutdown().await,
        Err(_) => {}
    }
    info!("bye");
    Ok(())
}
