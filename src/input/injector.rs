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

//! Input injection capability boundary.
//!
//! Concrete backends (X11, Wayland, ...) live outside this crate; the event
//! processor only needs these three capabilities.

use anyhow::Result;
use tracing::info;

use super::keys::{Key, Modifier};

/// Trait for input injection backends.
pub trait InputInjector: Send + Sync {
    /// Backend name for logs (e.g. "X11", "Wayland").
    fn backend_name(&self) -> &'static str;

    /// Type text at the current cursor position.
    fn type_text(&self, text: &str) -> Result<()>;

    /// Press a single key.
    fn press_key(&self, key: Key) -> Result<()>;

    /// Press a key combination (modifiers + key).
    fn key_combo(&self, modifiers: &[Modifier], key: Key) -> Result<()>;
}

/// Logging no-op injector, for headless runs and tests.
pub struct StubInjector;

impl InputInjector for StubInjector {
    fn backend_name(&self) -> &'static str {
        "Stub (no-op)"
    }

    fn type_text(&self, text: &str) -> Result<()> {
        info!("[STUB] Would type: {}", text);
        Ok(())
    }

    fn press_key(&self, key: Key) -> Result<()> {
        info!("[STUB] Would press: {:?}", key);
        Ok(())
    }

    fn key_combo(&self, modifiers: &[Modifier], key: Key) -> Result<()> {
        info!("[STUB] Would press: {:?} + {:?}", modifiers, key);
        Ok(())
    }
}
