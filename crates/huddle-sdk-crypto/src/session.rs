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

//! Per-room encryption sessions.
//!
//! A [`RoomSession`] owns the group key of one room and everything that is
//! derived from it: message encryption and decryption, and the wrapping of
//! the key for other participants. Sessions are created and removed by the
//! [`E2eeMachine`](crate::E2eeMachine), which also decides when a room
//! qualifies for one.

use std::{
    fmt,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use huddle_sdk_common::{E2eeState, RoomId, Subscription, UserId};
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::{
    ciphers::{Aes256CbcKey, KEY_SIZE},
    error::CryptoError,
    identity::{self, IdentityKeys},
    requests::{SuggestedKey, WaitingUser},
    utilities::{base64_decode, base64_encode},
};

/// The length of the key id that prefixes every encrypted payload and
/// every wrapped group key.
pub const KEY_ID_LENGTH: usize = 12;

/// The key-establishment state of a [`RoomSession`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Neither a group key nor a key id is known for the room.
    NoKey,
    /// The room has a key id, so a group key exists somewhere, but this
    /// client has not received its copy yet.
    KeyRequested,
    /// The group key is present and usable.
    KeyEstablished,
}

/// A room's group key, the symmetric key all participants share.
///
/// Next to the cipher this keeps the exported string form around, since
/// the key id and every wrapped copy are derived from the export rather
/// than from the raw key bytes.
pub(crate) struct GroupKey {
    key: Aes256CbcKey,
    exported: String,
}

impl GroupKey {
    /// Generate a fresh group key.
    pub(crate) fn generate() -> Self {
        let key = Aes256CbcKey::generate();
        let exported = base64_encode(key.as_bytes());

        Self { key, exported }
    }

    /// Re-create a group key from its exported string form.
    pub(crate) fn from_exported(exported: String) -> Result<Self, CryptoError> {
        let bytes = base64_decode(&exported)
            .map_err(|e| CryptoError::InvalidKeyFormat(e.to_string()))?;

        let bytes: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyFormat("unexpected AES key length".to_owned()))?;

        Ok(Self { key: Aes256CbcKey::from_bytes(bytes), exported })
    }

    /// The short id participants use to refer to this key.
    ///
    /// The export of a 32 byte key is 44 characters of base64, so the
    /// prefix always exists.
    pub(crate) fn key_id(&self) -> &str {
        &self.exported[..KEY_ID_LENGTH]
    }

    /// The exported string form, the thing that gets wrapped for peers.
    pub(crate) fn export(&self) -> &str {
        &self.exported
    }

    fn cipher(&self) -> &Aes256CbcKey {
        &self.key
    }
}

impl Drop for GroupKey {
    fn drop(&mut self) {
        self.exported.zeroize();
    }
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupKey").field("key_id", &self.key_id()).finish_non_exhaustive()
    }
}

/// The single key a session may hold, including the not-yet-here states.
enum KeyState {
    NoKey,
    Requested,
    Established(GroupKey),
}

impl KeyState {
    fn as_session_state(&self) -> SessionState {
        match self {
            KeyState::NoKey => SessionState::NoKey,
            KeyState::Requested => SessionState::KeyRequested,
            KeyState::Established(_) => SessionState::KeyEstablished,
        }
    }
}

/// The plaintext structure that gets encrypted into a message payload.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MessagePayload<'a> {
    user_id: &'a UserId,
    text: &'a str,
    ts: u64,
}

/// The decrypted content of an encrypted message.
#[derive(Clone, Debug, Deserialize)]
pub struct DecryptedContent {
    /// The plaintext message body.
    pub text: String,
}

/// The per-room encryption state.
///
/// This is a cheaply clonable handle, clones share the underlying state.
#[derive(Clone)]
pub struct RoomSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    room_id: RoomId,
    own_user_id: UserId,
    identity: IdentityKeys,
    key: RwLock<KeyState>,
    /// Mirrors the room's persisted `encrypted` flag. Controls whether
    /// decrypted content gets rendered, independent of key presence.
    active: AtomicBool,
}

impl RoomSession {
    pub(crate) fn new(room_id: RoomId, own_user_id: UserId, identity: IdentityKeys) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                room_id,
                own_user_id,
                identity,
                key: RwLock::new(KeyState::NoKey),
                active: AtomicBool::new(false),
            }),
        }
    }

    /// The id of the room this session belongs to.
    pub fn room_id(&self) -> &RoomId {
        &self.inner.room_id
    }

    /// The current key-establishment state.
    pub fn state(&self) -> SessionState {
        self.inner.key.read().unwrap().as_session_state()
    }

    /// Whether the session holds a usable group key.
    ///
    /// Cheap check for the distribution loop, which must not offer keys
    /// for rooms that have none to give out.
    pub fn has_session_key(&self) -> bool {
        matches!(*self.inner.key.read().unwrap(), KeyState::Established(_))
    }

    /// Whether decrypted content for this room should be rendered.
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Start rendering decrypted content, called when the room's
    /// `encrypted` flag turns on. Does not touch key material.
    pub fn resume(&self) {
        self.inner.active.store(true, Ordering::SeqCst);
    }

    /// Stop rendering decrypted content, called when the room's
    /// `encrypted` flag turns off. Does not touch key material.
    pub fn pause(&self) {
        self.inner.active.store(false, Ordering::SeqCst);
    }

    /// Note that the room has a key id on the server, so a key exists but
    /// this client does not hold it. Never downgrades an established key.
    pub(crate) fn mark_key_requested(&self) {
        let mut key = self.inner.key.write().unwrap();

        if matches!(*key, KeyState::NoKey) {
            *key = KeyState::Requested;
        }
    }

    /// Install a group key this client created itself.
    pub(crate) fn adopt_key(&self, key: GroupKey) {
        *self.inner.key.write().unwrap() = KeyState::Established(key);
    }

    /// Unwrap a group key that a participant wrapped for this user and
    /// install it.
    ///
    /// The wrapped form is the 12 character key id followed by the base64
    /// of the RSA ciphertext of the exported key. On failure the previous
    /// key state is left untouched.
    pub(crate) fn import_group_key(&self, wrapped: &str) -> Result<(), CryptoError> {
        let claimed_key_id = wrapped
            .get(..KEY_ID_LENGTH)
            .ok_or_else(|| CryptoError::InvalidKeyFormat("wrapped key is too short".to_owned()))?;
        let encoded = &wrapped[KEY_ID_LENGTH..];

        let ciphertext = base64_decode(encoded)
            .map_err(|e| CryptoError::InvalidKeyFormat(e.to_string()))?;

        let exported = self.inner.identity.decrypt(&ciphertext)?;
        let exported = String::from_utf8(exported).map_err(|_| CryptoError::DecryptionFailed)?;

        let key = GroupKey::from_exported(exported)?;

        if key.key_id() != claimed_key_id {
            // The id derived from the key wins, the prefix is only a hint.
            debug!(
                room_id = %self.inner.room_id,
                claimed = claimed_key_id,
                derived = key.key_id(),
                "The wrapped key id does not match the unwrapped key",
            );
        }

        *self.inner.key.write().unwrap() = KeyState::Established(key);

        Ok(())
    }

    /// Wrap the group key for a single recipient.
    ///
    /// Returns `None` if the session has no key or the wrap fails.
    pub(crate) fn wrap_key_for(&self, public_key: &RsaPublicKey) -> Option<String> {
        let guard = self.inner.key.read().unwrap();
        let KeyState::Established(key) = &*guard else { return None };

        match wrap_group_key(key, public_key) {
            Ok(wrapped) => Some(wrapped),
            Err(error) => {
                warn!(room_id = %self.inner.room_id, %error, "Failed to wrap the group key");
                None
            }
        }
    }

    /// Wrap the group key for every waiting participant that has a public
    /// key.
    ///
    /// Participants without a public key have not finished their own key
    /// setup and are skipped, they stay on the waiting list. Returns
    /// `None` when the session has no key to give out.
    pub(crate) fn encrypt_group_key_for_participants(
        &self,
        users: &[WaitingUser],
    ) -> Option<Vec<SuggestedKey>> {
        let guard = self.inner.key.read().unwrap();
        let KeyState::Established(key) = &*guard else { return None };

        let mut keys = Vec::with_capacity(users.len());

        for user in users {
            let Some(exported_public) = &user.public_key else {
                debug!(
                    room_id = %self.inner.room_id,
                    user_id = %user.user_id,
                    "The participant has no public key yet, skipping",
                );
                continue;
            };

            let wrapped = identity::import_public_key(exported_public)
                .and_then(|public_key| wrap_group_key(key, &public_key));

            match wrapped {
                Ok(wrapped) => {
                    keys.push(SuggestedKey { user_id: user.user_id.clone(), key: wrapped });
                }
                Err(error) => {
                    warn!(
                        room_id = %self.inner.room_id,
                        user_id = %user.user_id,
                        %error,
                        "Failed to wrap the group key for a waiting participant",
                    );
                }
            }
        }

        Some(keys)
    }

    /// Encrypt a message body.
    ///
    /// The body is wrapped into a JSON payload carrying the sender and a
    /// timestamp before encryption. Returns the key id followed by the
    /// base64 of the IV and ciphertext, or `None` when the session has no
    /// key yet.
    pub fn encrypt_text(&self, text: &str) -> Option<String> {
        let guard = self.inner.key.read().unwrap();
        let KeyState::Established(key) = &*guard else {
            debug!(room_id = %self.inner.room_id, "Cannot encrypt, no group key established");
            return None;
        };

        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0);

        let payload = MessagePayload { user_id: &self.inner.own_user_id, text, ts };

        let plaintext = match serde_json::to_vec(&payload) {
            Ok(plaintext) => plaintext,
            Err(error) => {
                warn!(
                    room_id = %self.inner.room_id,
                    %error,
                    "Failed to serialize the message payload",
                );
                return None;
            }
        };

        let ciphertext = key.cipher().encrypt(&plaintext);

        Some(format!("{}{}", key.key_id(), base64_encode(ciphertext)))
    }

    /// Decrypt an encrypted message payload.
    ///
    /// All failures are logged and turn into `None`, callers fall back to
    /// rendering the ciphertext or a placeholder instead of crashing the
    /// message list.
    pub fn decrypt(&self, payload: &str) -> Option<DecryptedContent> {
        let guard = self.inner.key.read().unwrap();
        let KeyState::Established(key) = &*guard else {
            debug!(room_id = %self.inner.room_id, "Cannot decrypt, no group key established");
            return None;
        };

        let Some(payload_key_id) = payload.get(..KEY_ID_LENGTH) else {
            debug!(room_id = %self.inner.room_id, "The encrypted payload is too short");
            return None;
        };

        if payload_key_id != key.key_id() {
            debug!(
                room_id = %self.inner.room_id,
                payload_key_id,
                session_key_id = key.key_id(),
                "The payload was encrypted with a different group key",
            );
            return None;
        }

        let data = match base64_decode(&payload[KEY_ID_LENGTH..]) {
            Ok(data) => data,
            Err(error) => {
                debug!(
                    room_id = %self.inner.room_id,
                    %error,
                    "The encrypted payload is not valid base64",
                );
                return None;
            }
        };

        let plaintext = match key.cipher().decrypt(&data) {
            Ok(plaintext) => plaintext,
            Err(error) => {
                debug!(room_id = %self.inner.room_id, %error, "Failed to decrypt the payload");
                return None;
            }
        };

        match serde_json::from_slice(&plaintext) {
            Ok(content) => Some(content),
            Err(error) => {
                debug!(
                    room_id = %self.inner.room_id,
                    %error,
                    "The decrypted payload is not a valid message",
                );
                None
            }
        }
    }

    /// Decrypt the subscription's last message in place.
    ///
    /// Returns whether the subscription was modified and needs to be
    /// written back.
    pub(crate) fn decrypt_subscription(&self, subscription: &mut Subscription) -> bool {
        let Some(message) = &mut subscription.last_message else { return false };

        if !message.awaiting_decryption() {
            return false;
        }

        let Some(content) = self.decrypt(&message.msg) else { return false };

        message.msg = content.text;
        message.e2e = Some(E2eeState::Done);

        true
    }
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for RoomSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomSession")
            .field("room_id", &self.inner.room_id)
            .field("state", &self.state())
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

fn wrap_group_key(key: &GroupKey, public_key: &RsaPublicKey) -> Result<String, CryptoError> {
    let ciphertext = identity::encrypt_for(public_key, key.export().as_bytes())?;

    Ok(format!("{}{}", key.key_id(), base64_encode(ciphertext)))
}
