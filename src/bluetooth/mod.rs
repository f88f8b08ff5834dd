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

//! BLE GATT transport: packet framing, reliable sending, both link roles.

pub mod central;
pub mod codec;
pub mod constants;
pub mod dispatcher;
pub mod gatt_server;
pub mod sender;

pub use central::{CentralConfig, CentralLink, LinkIdentity, LinkState};
pub use gatt_server::GattServer;
pub use sender::SendOutcome;

use crate::protocol::WordPayload;

/// Events pushed out of a link, on either role.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Lifecycle transition (central side).
    StateChanged(LinkState),
    /// Pairing completed and traffic may flow.
    Connected { peer_device_id: String },
    /// The session ended.
    Disconnected,
    /// An unknown peer asked to pair; answer via the server's
    /// `complete_pairing` / `reject_pairing`.
    PairRequested {
        device_id: String,
        device_name: Option<String>,
    },
    /// Decrypted TEXT payload.
    Text(String),
    /// Decrypted WORD payload.
    Word(WordPayload),
    /// Decrypted COMMAND payload.
    Command(String),
    /// Single-line failure reason for the UI.
    Error(String),
}
