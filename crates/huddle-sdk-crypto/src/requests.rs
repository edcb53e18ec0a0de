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

//! Contracts for the server's key-exchange endpoints.
//!
//! The crate never talks to the network itself. Host applications already
//! hold an authenticated connection to their server, so the
//! [`E2eeMachine`](crate::E2eeMachine) calls these endpoints through the
//! [`KeyExchangeApi`] trait and the host wires the trait up to whatever
//! transport it uses for the rest of its traffic.

use std::fmt;

use async_trait::async_trait;
use huddle_sdk_common::{Message, MessageId, RoomId, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned by [`KeyExchangeApi`] implementations.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request could not be delivered or no response ever arrived.
    ///
    /// Treated as transient. Callers log it and retry on their next
    /// natural cycle.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The server received the request and refused it.
    #[error("the server rejected the request: {0}")]
    Rejected(String),
}

/// A `Result` specialized over [`ApiError`].
pub type Result<T> = std::result::Result<T, ApiError>;

/// The identity key pair the server holds for the logged-in account.
#[derive(Clone, Default, Deserialize)]
pub struct FetchedUserKeys {
    /// The account's public identity key, base64-encoded DER, if one was
    /// ever uploaded.
    #[serde(default)]
    pub public_key: Option<String>,
    /// The account's private identity key, wrapped under the account
    /// password, if one was ever uploaded.
    #[serde(default)]
    pub private_key: Option<String>,
}

impl FetchedUserKeys {
    /// Whether the server holds a complete key pair for this account.
    pub fn is_complete(&self) -> bool {
        self.public_key.is_some() && self.private_key.is_some()
    }
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for FetchedUserKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchedUserKeys")
            .field("public_key", &self.public_key)
            .field("private_key", &self.private_key.as_deref().map(|_| "..."))
            .finish()
    }
}

/// A participant of a room that is still waiting to receive the room's
/// group key.
#[derive(Clone, Debug, Deserialize)]
pub struct WaitingUser {
    /// The participant's user id.
    #[serde(rename = "_id")]
    pub user_id: UserId,
    /// The participant's public identity key, base64-encoded DER. Absent
    /// when the participant never finished their own key setup, in which
    /// case no key can be wrapped for them yet.
    #[serde(default)]
    pub public_key: Option<String>,
}

/// The waiting participants of a single room.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomWaitingUsers {
    /// The room id.
    pub room_id: RoomId,
    /// The participants that still lack the room's group key.
    pub users: Vec<WaitingUser>,
}

/// A group key wrapped for a single recipient.
///
/// Produced by a room session from its established group key and the
/// recipient's public key. The `key` string is safe to hand to the
/// server, only the recipient's private key can unwrap it.
#[derive(Clone, Debug, Serialize)]
pub struct SuggestedKey {
    /// The recipient.
    #[serde(rename = "_id")]
    pub user_id: UserId,
    /// The key id in the clear, followed by the base64 of the group key
    /// wrapped under the recipient's public key.
    pub key: String,
}

/// The wrapped group keys for the waiting participants of one room.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSuggestedKeys {
    /// The room id.
    pub room_id: RoomId,
    /// One wrapped key per waiting participant.
    pub keys: Vec<SuggestedKey>,
}

/// The server endpoints the encryption core depends on.
///
/// Every method maps onto one endpoint of the key-exchange API. The
/// methods are called from background tasks, so implementations need to
/// be shareable across tasks and should apply their own timeouts; the
/// callers treat any [`ApiError`] as a skipped cycle, not a crash.
#[async_trait]
pub trait KeyExchangeApi: fmt::Debug + Send + Sync {
    /// Persist the account's identity key pair on the server.
    ///
    /// `public_key` is the base64-encoded DER export of the public key,
    /// `wrapped_private_key` the password-wrapped export of the private
    /// key. The server stores both verbatim.
    async fn set_user_key_pair(&self, public_key: &str, wrapped_private_key: &str) -> Result<()>;

    /// Fetch the identity key pair the server holds for this account.
    async fn fetch_my_keys(&self) -> Result<FetchedUserKeys>;

    /// Ask the server to fan out a key request to the other members of
    /// every room this account joined without receiving the group key.
    async fn request_subscription_keys(&self) -> Result<()>;

    /// Claim the key id for a freshly created group key of a room.
    ///
    /// The server accepts only the first claim per room. A concurrent
    /// creator loses the race and waits for the winner's key to be
    /// suggested to them instead.
    async fn set_room_key_id(&self, room_id: &RoomId, key_id: &str) -> Result<()>;

    /// Fetch the participants of the given rooms that are waiting for
    /// the group key.
    async fn fetch_users_waiting_for_group_key(
        &self,
        room_ids: &[RoomId],
    ) -> Result<Vec<RoomWaitingUsers>>;

    /// Upload a batch of group keys wrapped for the waiting participants
    /// of the given rooms.
    async fn provide_users_suggested_group_keys(&self, keys: Vec<RoomSuggestedKeys>) -> Result<()>;

    /// Tell the server that the key suggested for the given room was
    /// imported successfully. The server promotes the suggestion to the
    /// subscription's established key and clears the waiting mark.
    async fn accept_suggested_group_key(&self, room_id: &RoomId) -> Result<()>;

    /// Tell the server that the key suggested for the given room could
    /// not be decrypted. The server clears the suggestion so another
    /// participant can offer the key again.
    async fn reject_suggested_group_key(&self, room_id: &RoomId) -> Result<()>;

    /// Fetch a single message, used to resolve quoted messages that are
    /// not in the local store.
    async fn get_message(&self, message_id: &MessageId) -> Result<Option<Message>>;
}
