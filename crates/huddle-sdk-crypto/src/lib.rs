// Copyright 2024 The Huddle Project
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

#![doc = include_str!("../README.md")]
#![warn(missing_docs, missing_debug_implementations)]

mod ciphers;
mod distribution;
mod error;
mod identity;
mod machine;
mod recovery;
pub mod requests;
mod session;
pub mod store;
mod utilities;

pub use error::{CryptoError, E2eeError, E2eeResult};
pub use machine::{E2eeMachine, LifecycleState, MachineConfig, PasswordPrompt};
pub use requests::{
    ApiError, FetchedUserKeys, KeyExchangeApi, RoomSuggestedKeys, RoomWaitingUsers, SuggestedKey,
    WaitingUser,
};
pub use session::{DecryptedContent, KEY_ID_LENGTH, RoomSession, SessionState};
pub use store::{ChatStore, KeySlot, LocalKeyStore, StoreError};

/// The version of the huddle-sdk-crypto crate being used.
pub static VERSION: &str = env!("CARGO_PKG_VERSION");
