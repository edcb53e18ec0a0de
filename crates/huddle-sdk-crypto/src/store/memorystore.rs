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

//! In-memory store implementations.
//!
//! Nothing survives a process restart, which makes these suitable for
//! tests and for ephemeral sessions where key material on disk is
//! undesirable.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use huddle_sdk_common::{Message, MessageId, Room, RoomId, Subscription};

use super::{ChatStore, KeySlot, LocalKeyStore, Result};

/// An in-memory [`LocalKeyStore`].
#[derive(Clone, Debug, Default)]
pub struct MemoryKeyStore {
    values: Arc<DashMap<KeySlot, String>>,
}

impl MemoryKeyStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalKeyStore for MemoryKeyStore {
    async fn get(&self, slot: KeySlot) -> Result<Option<String>> {
        Ok(self.values.get(&slot).map(|v| v.clone()))
    }

    async fn set(&self, slot: KeySlot, value: &str) -> Result<()> {
        self.values.insert(slot, value.to_owned());
        Ok(())
    }

    async fn remove(&self, slot: KeySlot) -> Result<()> {
        self.values.remove(&slot);
        Ok(())
    }
}

/// An in-memory [`ChatStore`].
#[derive(Clone, Debug, Default)]
pub struct MemoryChatStore {
    rooms: Arc<DashMap<RoomId, Room>>,
    subscriptions: Arc<DashMap<RoomId, Subscription>>,
    messages: Arc<DashMap<MessageId, Message>>,
}

impl MemoryChatStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a room.
    pub fn save_room(&self, room: Room) {
        self.rooms.insert(room.id.clone(), room);
    }

    /// Insert or replace a subscription.
    pub fn save_subscription(&self, subscription: Subscription) {
        self.subscriptions.insert(subscription.room_id.clone(), subscription);
    }

    /// Insert or replace a message.
    pub fn save_message(&self, message: Message) {
        self.messages.insert(message.id.clone(), message);
    }

    /// Fetch one message by id.
    pub fn message(&self, message_id: &MessageId) -> Option<Message> {
        self.messages.get(message_id).map(|m| m.clone())
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn room(&self, room_id: &RoomId) -> Result<Option<Room>> {
        Ok(self.rooms.get(room_id).map(|r| r.clone()))
    }

    async fn rooms_with_waiting_users(&self) -> Result<Vec<Room>> {
        Ok(self
            .rooms
            .iter()
            .filter(|r| !r.users_waiting_for_keys.is_empty())
            .map(|r| r.clone())
            .collect())
    }

    async fn subscription(&self, room_id: &RoomId) -> Result<Option<Subscription>> {
        Ok(self.subscriptions.get(room_id).map(|s| s.clone()))
    }

    async fn encrypted_subscriptions(&self) -> Result<Vec<Subscription>> {
        Ok(self.subscriptions.iter().filter(|s| s.encrypted).map(|s| s.clone()).collect())
    }

    async fn subscriptions_with_suggested_keys(&self) -> Result<Vec<Subscription>> {
        Ok(self
            .subscriptions
            .iter()
            .filter(|s| s.e2e_suggested_key.is_some())
            .map(|s| s.clone())
            .collect())
    }

    async fn update_subscription(&self, subscription: &Subscription) -> Result<()> {
        self.subscriptions.insert(subscription.room_id.clone(), subscription.clone());
        Ok(())
    }

    async fn pending_encrypted_messages(&self) -> Result<Vec<Message>> {
        let mut pending: Vec<Message> =
            self.messages.iter().filter(|m| m.awaiting_decryption()).map(|m| m.clone()).collect();

        // Oldest first, ids as the tie breaker to keep the order stable.
        pending.sort_by(|a, b| a.ts.cmp(&b.ts).then_with(|| a.id.cmp(&b.id)));

        Ok(pending)
    }

    async fn update_message(&self, message: &Message) -> Result<()> {
        self.messages.insert(message.id.clone(), message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use huddle_sdk_common::{E2eeState, Message, MessageKind, RoomId, Subscription};

    use super::{KeySlot, LocalKeyStore, MemoryChatStore, MemoryKeyStore};
    use crate::store::ChatStore;

    fn pending_message(id: &str, ts: u64) -> Message {
        Message {
            id: id.into(),
            room_id: RoomId::new("general"),
            sender: "alice".into(),
            msg: "xxx".to_owned(),
            kind: MessageKind::Encrypted,
            e2e: Some(E2eeState::Pending),
            ts,
            attachments: Vec::new(),
        }
    }

    #[tokio::test]
    async fn key_slots_round_trip() {
        let store = MemoryKeyStore::new();

        assert!(store.get(KeySlot::PublicKey).await.unwrap().is_none());

        store.set(KeySlot::PublicKey, "AAAA").await.unwrap();
        assert_eq!(store.get(KeySlot::PublicKey).await.unwrap().as_deref(), Some("AAAA"));

        store.remove(KeySlot::PublicKey).await.unwrap();
        assert!(store.get(KeySlot::PublicKey).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pending_messages_are_sorted_by_timestamp() {
        let store = MemoryChatStore::new();

        store.save_message(pending_message("b", 30));
        store.save_message(pending_message("a", 10));
        store.save_message(pending_message("c", 20));

        let mut done = pending_message("d", 5);
        done.e2e = Some(E2eeState::Done);
        store.save_message(done);

        let pending = store.pending_encrypted_messages().await.unwrap();
        let ids: Vec<_> = pending.iter().map(|m| m.id.as_str()).collect();

        assert_eq!(ids, ["a", "c", "b"]);
    }

    #[tokio::test]
    async fn subscription_queries_filter_on_the_right_fields() {
        let store = MemoryChatStore::new();

        store.save_subscription(Subscription {
            room_id: RoomId::new("encrypted"),
            encrypted: true,
            e2e_key: None,
            e2e_suggested_key: None,
            last_message: None,
        });
        store.save_subscription(Subscription {
            room_id: RoomId::new("suggested"),
            encrypted: false,
            e2e_key: None,
            e2e_suggested_key: Some("ABCDEF".to_owned()),
            last_message: None,
        });

        let encrypted = store.encrypted_subscriptions().await.unwrap();
        assert_eq!(encrypted.len(), 1);
        assert_eq!(encrypted[0].room_id.as_str(), "encrypted");

        let suggested = store.subscriptions_with_suggested_keys().await.unwrap();
        assert_eq!(suggested.len(), 1);
        assert_eq!(suggested[0].room_id.as_str(), "suggested");
    }
}
