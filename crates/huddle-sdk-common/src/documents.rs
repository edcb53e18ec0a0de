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

//! The slices of the chat document model the encryption core touches.
//!
//! These are deliberately partial views. The host application's documents
//! carry many more fields; the SDK contract is limited to what is declared
//! here, and implementations of the store traits are expected to
//! round-trip everything else untouched.

use serde::{Deserialize, Serialize};

use crate::identifiers::{MessageId, RoomId, UserId};

/// The type of a room.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomType {
    /// A direct message between two or more users.
    #[serde(rename = "d")]
    Direct,
    /// An invite-only private group.
    #[serde(rename = "p")]
    Private,
    /// A public channel. Channels can't be encrypted.
    #[serde(rename = "c")]
    Channel,
}

/// The encryption status of a message document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum E2eeState {
    /// The ciphertext has not been decrypted yet.
    Pending,
    /// The message body holds the decrypted plaintext.
    Done,
}

/// Distinguishes encrypted message documents from everything else.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// A plain, unencrypted message.
    #[default]
    #[serde(rename = "plain")]
    Plain,
    /// The message body is an encrypted payload.
    #[serde(rename = "e2e")]
    Encrypted,
    /// A server-generated system message, never encrypted.
    #[serde(rename = "system")]
    System,
}

/// A room document, as far as the encryption core is concerned.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    /// The room id.
    pub id: RoomId,
    /// Whether this is a direct message, private group or channel.
    pub room_type: RoomType,
    /// The room-level encryption flag toggled by the room admins.
    #[serde(default)]
    pub encrypted: bool,
    /// The id of the group key currently in use, if one was ever created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e2e_key_id: Option<String>,
    /// Users that joined the room but don't hold the group key yet. Synced
    /// down by the server so clients know distribution work is pending.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users_waiting_for_keys: Vec<UserId>,
}

impl Room {
    /// Whether the room type admits end-to-end encryption at all.
    pub fn supports_e2ee(&self) -> bool {
        matches!(self.room_type, RoomType::Direct | RoomType::Private)
    }
}

/// A user's subscription to one room.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    /// The id of the room this subscription belongs to.
    pub room_id: RoomId,
    /// Mirror of the room's encryption flag, per user.
    #[serde(default)]
    pub encrypted: bool,
    /// The room's group key, wrapped under this user's public key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e2e_key: Option<String>,
    /// A group key another participant re-encrypted for this user, not yet
    /// imported. Cleared once accepted or rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e2e_suggested_key: Option<String>,
    /// The newest message of the room, shown in the room list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Message>,
}

/// A message document.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// The message id.
    pub id: MessageId,
    /// The room the message was sent to.
    pub room_id: RoomId,
    /// The sending user.
    pub sender: UserId,
    /// The message body. For [`MessageKind::Encrypted`] messages that are
    /// still [`E2eeState::Pending`] this holds the encrypted payload.
    pub msg: String,
    /// What kind of message this is.
    #[serde(default)]
    pub kind: MessageKind,
    /// Decryption status, only meaningful for encrypted messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e2e: Option<E2eeState>,
    /// Server timestamp, in milliseconds since the Unix epoch.
    pub ts: u64,
    /// Attachments, including decrypted quote previews.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<MessageAttachment>,
}

impl Message {
    /// Whether this message still needs to go through a room session before
    /// it can be rendered.
    pub fn awaiting_decryption(&self) -> bool {
        self.kind == MessageKind::Encrypted && self.e2e != Some(E2eeState::Done)
    }
}

/// An attachment on a message.
///
/// The encryption core only produces text attachments when it inlines the
/// decrypted preview of a quoted message.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageAttachment {
    /// The attachment text.
    pub text: String,
    /// The link to the quoted message this preview was generated from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_link: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{E2eeState, Message, MessageKind, Room, RoomType, Subscription};

    #[test]
    fn room_types_use_single_letter_wire_names() {
        let room = Room {
            id: "general".into(),
            room_type: RoomType::Private,
            encrypted: true,
            e2e_key_id: None,
            users_waiting_for_keys: Vec::new(),
        };

        let value = serde_json::to_value(&room).unwrap();
        assert_eq!(value["roomType"], json!("p"));
        assert!(value.get("e2eKeyId").is_none());
    }

    #[test]
    fn channel_rooms_do_not_support_e2ee() {
        let room = Room {
            id: "general".into(),
            room_type: RoomType::Channel,
            encrypted: false,
            e2e_key_id: None,
            users_waiting_for_keys: Vec::new(),
        };

        assert!(!room.supports_e2ee());
    }

    #[test]
    fn subscription_defaults_are_lenient() {
        let sub: Subscription = serde_json::from_value(json!({ "roomId": "general" })).unwrap();

        assert!(!sub.encrypted);
        assert!(sub.e2e_key.is_none());
        assert!(sub.e2e_suggested_key.is_none());
        assert!(sub.last_message.is_none());
    }

    #[test]
    fn message_decryption_status() {
        let mut message: Message = serde_json::from_value(json!({
            "id": "msg-1",
            "roomId": "general",
            "sender": "alice",
            "msg": "ciphertext",
            "kind": "e2e",
            "e2e": "pending",
            "ts": 1_700_000_000_000u64,
        }))
        .unwrap();

        assert!(message.awaiting_decryption());

        message.e2e = Some(E2eeState::Done);
        assert!(!message.awaiting_decryption());

        message.kind = MessageKind::Plain;
        message.e2e = None;
        assert!(!message.awaiting_decryption());
    }
}
