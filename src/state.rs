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

//! Shared application state.
//!
//! Pull getters for an embedding UI; the core only pushes into this.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::bluetooth::LinkState;

/// Shared application state.
#[derive(Debug)]
pub struct AppState {
    /// Current link state.
    link_state: RwLock<LinkState>,

    /// Whether input injection is enabled.
    input_enabled: RwLock<bool>,

    /// Connected peer device ID.
    connected_peer: RwLock<Option<String>>,

    /// Last received text (for tooltips and diagnostics).
    last_text: RwLock<Option<String>>,

    /// Single-line reason for the last failure.
    last_error: RwLock<Option<String>>,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            link_state: RwLock::new(LinkState::Disconnected),
            input_enabled: RwLock::new(true),
            connected_peer: RwLock::new(None),
            last_text: RwLock::new(None),
            last_error: RwLock::new(None),
        }
    }
}

impl AppState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_link_state(&self, state: LinkState) {
        *self.link_state.write() = state;
        if state != LinkState::Connected {
            *self.connected_peer.write() = None;
        }
    }

    pub fn link_state(&self) -> LinkState {
        *self.link_state.read()
    }

    pub fn set_connected(&self, peer_device_id: String) {
        *self.link_state.write() = LinkState::Connected;
        *self.connected_peer.write() = Some(peer_device_id);
        *self.last_error.write() = None;
    }

    pub fn connected_peer(&self) -> Option<String> {
        self.connected_peer.read().clone()
    }

    pub fn set_input_enabled(&self, enabled: bool) {
        *self.input_enabled.write() = enabled;
    }

    pub fn is_input_enabled(&self) -> bool {
        *self.input_enabled.read()
    }

    pub fn set_last_text(&self, text: String) {
        *self.last_text.write() = Some(text);
    }

    pub fn last_text(&self) -> Option<String> {
        self.last_text.read().clone()
    }

    pub fn set_error(&self, reason: String) {
        *self.link_state.write() = LinkState::Failed;
        *self.last_error.write() = Some(reason);
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_disconnect_cycle() {
        let state = AppState::new();
        assert_eq!(state.link_state(), LinkState::Disconnected);

        state.set_connected("android-abc".to_string());
        assert_eq!(state.link_state(), LinkState::Connected);
        assert_eq!(state.connected_peer().as_deref(), Some("android-abc"));

        state.set_link_state(LinkState::Reconnecting);
        assert!(state.connected_peer().is_none());
    }

    #[test]
    fn test_error_reason_is_kept() {
        let state = AppState::new();
        state.set_error("gave up after 5 reconnect attempts".to_string());
        assert_eq!(state.link_state(), LinkState::Failed);
        assert!(state.last_error().unwrap().contains("5 reconnect"));
    }
}
