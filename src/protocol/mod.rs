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

//! Wire protocol: message envelope, pairing payloads, error taxonomy.

mod error;
pub mod message;
pub mod pairing;

pub use error::LinkError;
pub use message::{Message, MessageType, TimestampGen, WordPayload, PROTOCOL_VERSION};
pub use pairing::{
    PairAckPayload, PairRequestPayload, PairStatus, PairingInitiator, PairingOutcome,
    PairingResponder, PendingPairing,
};
