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

//! Storage abstractions the E2EE machine depends on.
//!
//! Two traits live here. [`LocalKeyStore`] is the per-device key-value
//! store holding the user's exported key pair; host applications back it
//! with whatever durable storage the platform offers. [`ChatStore`] is a
//! read/write view onto the host's room, subscription and message
//! documents, restricted to the fields the encryption core touches.
//!
//! In-memory implementations of both, backed by [`dashmap`], are provided
//! in the [`memorystore`] module.

use std::fmt;

use async_trait::async_trait;
use huddle_sdk_common::{Message, Room, RoomId, Subscription};
use thiserror::Error;

pub mod memorystore;

pub use memorystore::{MemoryChatStore, MemoryKeyStore};

/// The named slots of the [`LocalKeyStore`].
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum KeySlot {
    /// The user's exported public key.
    PublicKey,
    /// The user's exported private key.
    ///
    /// Stored in the clear on the device; the password-wrapped form only
    /// exists server side.
    PrivateKey,
    /// The auto-generated recovery passphrase, kept until the user either
    /// saves it somewhere or replaces it with a password of their own. Its
    /// presence doubles as the "user never picked a password" flag.
    RandomPassword,
}

impl KeySlot {
    /// The storage key under which this slot is persisted.
    pub fn as_str(&self) -> &'static str {
        match self {
            KeySlot::PublicKey => "public_key",
            KeySlot::PrivateKey => "private_key",
            KeySlot::RandomPassword => "random_password",
        }
    }

    /// All slots, in the order they are cleared on logout.
    pub const ALL: [KeySlot; 3] =
        [KeySlot::PublicKey, KeySlot::PrivateKey, KeySlot::RandomPassword];
}

impl fmt::Display for KeySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures of a store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend itself failed, e.g. the database is unreachable.
    #[error("the store backend failed: {0}")]
    Backend(String),

    /// A stored document could not be serialized or deserialized.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// The per-device store for the user's exported identity keys.
///
/// Pure key-value semantics over the [`KeySlot`]s. No encryption happens
/// in here; anything that must not rest in the clear is encrypted by the
/// caller before `set`.
#[async_trait]
pub trait LocalKeyStore: fmt::Debug + Send + Sync {
    /// Read a slot. `None` when the slot was never written or was removed.
    async fn get(&self, slot: KeySlot) -> Result<Option<String>>;

    /// Write a slot, replacing any previous value.
    async fn set(&self, slot: KeySlot, value: &str) -> Result<()>;

    /// Remove a slot.
    async fn remove(&self, slot: KeySlot) -> Result<()>;
}

/// The encryption core's view onto the host's chat documents.
#[async_trait]
pub trait ChatStore: fmt::Debug + Send + Sync {
    /// Fetch one room by id.
    async fn room(&self, room_id: &RoomId) -> Result<Option<Room>>;

    /// All rooms with a non-empty waiting list for the group key.
    async fn rooms_with_waiting_users(&self) -> Result<Vec<Room>>;

    /// Fetch the own user's subscription to the given room.
    async fn subscription(&self, room_id: &RoomId) -> Result<Option<Subscription>>;

    /// All subscriptions whose room has encryption switched on.
    async fn encrypted_subscriptions(&self) -> Result<Vec<Subscription>>;

    /// All subscriptions carrying a not yet imported suggested key.
    async fn subscriptions_with_suggested_keys(&self) -> Result<Vec<Subscription>>;

    /// Write back a subscription the core updated.
    async fn update_subscription(&self, subscription: &Subscription) -> Result<()>;

    /// All encrypted messages still awaiting decryption, oldest first.
    ///
    /// The returned order is the order the decryption sweep processes a
    /// room's backlog in, so implementations must keep it stable.
    async fn pending_encrypted_messages(&self) -> Result<Vec<Message>>;

    /// Write back a message the core updated.
    async fn update_message(&self, message: &Message) -> Result<()>;
}
