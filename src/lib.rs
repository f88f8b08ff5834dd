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

//! Speech2Prompt link core.
//!
//! The authenticated, encrypted, framed messaging transport that carries
//! spoken text from a mobile client into a desktop's input focus over BLE
//! GATT, for both roles:
//!
//! - the **central** (client) side: connection supervisor, reliable sender
//!   and the incremental transcript deduper;
//! - the **peripheral** (desktop) side: GATT server, dispatcher and the
//!   injector adapter.
//!
//! Speech recognition, concrete keystroke backends and all UI live outside
//! this crate.

pub mod bluetooth;
pub mod config;
pub mod crypto;
pub mod events;
pub mod input;
pub mod protocol;
pub mod speech;
pub mod state;
pub mod storage;
