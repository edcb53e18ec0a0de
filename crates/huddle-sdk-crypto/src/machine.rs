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

//! The state machine driving end to end encryption for one account.
//!
//! An [`E2eeMachine`] owns the account's RSA identity, the arena of per-room
//! [`RoomSession`]s and the background task that hands group keys to
//! participants still waiting for them. The host embeds one machine per
//! logged-in account, starts it once login settles and feeds it messages
//! and subscription updates from its sync channel.

use std::{
    fmt,
    sync::{
        Arc, Mutex as StdMutex, RwLock as StdRwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::join_all;
use huddle_sdk_common::{
    E2eeState, Message, MessageAttachment, MessageId, RoomId, Subscription, UserId,
};
use regex::Regex;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, instrument, trace, warn};
use url::Url;

use crate::{
    distribution::DistributionTask,
    error::{E2eeError, E2eeResult},
    identity::{IdentityKeys, unwrap_private_key, wrap_private_key},
    recovery,
    requests::{KeyExchangeApi, RoomSuggestedKeys},
    session::{GroupKey, RoomSession},
    store::{ChatStore, KeySlot, LocalKeyStore},
};

/// The lifecycle of an [`E2eeMachine`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    /// No key material is loaded and no background work is running.
    Stopped,
    /// The identity keys are being resolved, which may involve the
    /// network and a password prompt.
    Starting,
    /// The identity keys are loaded, sessions can be handed out.
    Ready,
}

/// Tunables of the [`E2eeMachine`].
#[derive(Clone, Debug)]
pub struct MachineConfig {
    /// The base URL of the server. Used to recognize links to our own
    /// messages inside decrypted bodies.
    pub site_url: Url,
    /// How often the distribution task offers group keys to waiting
    /// participants.
    pub distribution_interval: Duration,
    /// The upper bound of rooms served per distribution tick.
    pub distribution_batch_size: usize,
    /// The number of words in a generated recovery passphrase.
    pub passphrase_words: usize,
}

impl MachineConfig {
    /// The default configuration for the given server.
    pub fn new(site_url: Url) -> Self {
        Self {
            site_url,
            distribution_interval: Duration::from_secs(10),
            distribution_batch_size: 10,
            passphrase_words: 5,
        }
    }
}

/// Collaborator connecting the machine to the person at the keyboard.
///
/// Startup may need the encryption password to unwrap the server-side
/// copy of the private key, and a freshly generated key pair comes with
/// a recovery passphrase that has to be shown exactly once.
#[async_trait]
pub trait PasswordPrompt: fmt::Debug + Send + Sync {
    /// Ask for the password protecting the server-side copy of the
    /// private key.
    ///
    /// `None` means the prompt was dismissed.
    async fn request_password(&self) -> Option<String>;

    /// Surface a freshly generated recovery passphrase.
    async fn show_recovery_passphrase(&self, passphrase: &str);
}

/// Pattern matching links to messages on our own server.
///
/// Candidate links are matched whole, the quoted message id is pulled
/// out of their `msg` query parameter afterwards.
fn quote_link_regex(site_url: &Url) -> Regex {
    let base = regex::escape(site_url.as_str().trim_end_matches('/'));
    let pattern =
        format!("{base}/(?:channel|group|direct)/[0-9a-zA-Z_.-]+\\?[0-9a-zA-Z_.&=%-]+");

    Regex::new(&pattern).expect("We should be able to compile the quote link pattern")
}

/// The encryption manager of one logged-in account.
///
/// This is a cheaply clonable handle, clones share the underlying state.
#[derive(Clone)]
pub struct E2eeMachine {
    pub(crate) inner: Arc<MachineInner>,
}

pub(crate) struct MachineInner {
    /// The id of the account this machine belongs to.
    user_id: UserId,
    config: MachineConfig,
    /// Persists the identity keys across restarts on this device.
    key_store: Arc<dyn LocalKeyStore>,
    /// The host's view of rooms, subscriptions and messages.
    chat_store: Arc<dyn ChatStore>,
    api: Arc<dyn KeyExchangeApi>,
    prompt: Arc<dyn PasswordPrompt>,
    quote_link_regex: Regex,
    state: StdRwLock<LifecycleState>,
    /// The account's RSA key pair, present from `Ready` until the next
    /// stop.
    identity: StdRwLock<Option<IdentityKeys>>,
    /// Lazily built per-room sessions.
    sessions: DashMap<RoomId, RoomSession>,
    /// Bumped on every stop. Work that started under an older epoch
    /// discards its results instead of writing them back.
    epoch: AtomicU64,
    ready_tx: watch::Sender<bool>,
    /// Coalesces concurrent password prompts into a single question.
    password_gate: Mutex<()>,
    /// Serializes session creation so a room never ends up with two
    /// competing group keys.
    creation_gate: Mutex<()>,
    distribution: StdMutex<Option<DistributionTask>>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for E2eeMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("E2eeMachine")
            .field("user_id", &self.inner.user_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl E2eeMachine {
    /// Create a machine for the given account.
    ///
    /// The machine starts out [`Stopped`](LifecycleState::Stopped) and
    /// does nothing until [`start_client()`](Self::start_client) is
    /// called.
    pub fn new(
        user_id: UserId,
        config: MachineConfig,
        key_store: Arc<dyn LocalKeyStore>,
        chat_store: Arc<dyn ChatStore>,
        api: Arc<dyn KeyExchangeApi>,
        prompt: Arc<dyn PasswordPrompt>,
    ) -> Self {
        let quote_link_regex = quote_link_regex(&config.site_url);

        Self {
            inner: Arc::new(MachineInner {
                user_id,
                config,
                key_store,
                chat_store,
                api,
                prompt,
                quote_link_regex,
                state: StdRwLock::new(LifecycleState::Stopped),
                identity: StdRwLock::new(None),
                sessions: DashMap::new(),
                epoch: AtomicU64::new(0),
                ready_tx: watch::channel(false).0,
                password_gate: Mutex::new(()),
                creation_gate: Mutex::new(()),
                distribution: StdMutex::new(None),
            }),
        }
    }

    /// The id of the account this machine belongs to.
    pub fn user_id(&self) -> &UserId {
        &self.inner.user_id
    }

    /// The configuration the machine was created with.
    pub fn config(&self) -> &MachineConfig {
        &self.inner.config
    }

    /// The current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        *self.inner.state.read().unwrap()
    }

    /// Whether the identity keys are loaded and sessions can be handed
    /// out.
    pub fn is_ready(&self) -> bool {
        self.state() == LifecycleState::Ready
    }

    /// Subscribe to readiness changes.
    ///
    /// The receiver yields `true` once the identity keys are resolved
    /// and `false` again after [`stop_client()`](Self::stop_client).
    pub fn subscribe_to_readiness(&self) -> watch::Receiver<bool> {
        self.inner.ready_tx.subscribe()
    }

    /// Wait until the machine is ready.
    pub async fn wait_until_ready(&self) {
        self.inner
            .ready_tx
            .subscribe()
            .wait_for(|ready| *ready)
            .await
            .expect("We are holding the sending side, so the channel can't be closed");
    }

    fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    fn identity(&self) -> Option<IdentityKeys> {
        self.inner.identity.read().unwrap().clone()
    }

    /// Start the machine, resolving the account's identity keys.
    ///
    /// Safe to call repeatedly, a machine that is already starting or
    /// running returns immediately. On the very first login this
    /// generates the key pair and uploads a password-protected copy,
    /// otherwise the pair is loaded from the local store or unwrapped
    /// from the server copy, which may prompt for the encryption
    /// password.
    ///
    /// Once the keys are in place every message and subscription that
    /// queued up while we could not decrypt gets worked through, and the
    /// key distribution task is spawned.
    #[instrument(skip_all, fields(user_id = %self.inner.user_id))]
    pub async fn start_client(&self) -> E2eeResult<()> {
        {
            let mut state = self.inner.state.write().unwrap();

            if *state != LifecycleState::Stopped {
                trace!(state = ?*state, "The machine is already running");
                return Ok(());
            }

            *state = LifecycleState::Starting;
        }

        let epoch = self.epoch();

        let identity = match self.resolve_identity().await {
            Ok(identity) => identity,
            Err(error) => {
                *self.inner.state.write().unwrap() = LifecycleState::Stopped;
                return Err(error);
            }
        };

        *self.inner.identity.write().unwrap() = Some(identity);

        let committed = {
            let mut state = self.inner.state.write().unwrap();

            if self.epoch() == epoch && *state == LifecycleState::Starting {
                *state = LifecycleState::Ready;
                true
            } else {
                false
            }
        };

        if !committed {
            // A stop raced the startup, put the keys away again.
            debug!("The machine was stopped while it was starting");
            *self.inner.identity.write().unwrap() = None;
            self.clear_local_key_slots().await;

            return Ok(());
        }

        self.inner.ready_tx.send_replace(true);

        info!("End to end encryption is ready");

        // Work through everything that queued up while we had no keys.
        // Suggested keys go first so the decryption passes find as many
        // established sessions as possible.
        self.handle_suggested_keys().await;
        self.decrypt_subscriptions().await;
        self.decrypt_pending_messages().await;

        {
            // Same gate as the `Ready` commit. A machine that was
            // stopped during the sweeps must not own a live task.
            let mut distribution = self.inner.distribution.lock().unwrap();

            if self.epoch() == epoch && self.state() == LifecycleState::Ready {
                *distribution = Some(DistributionTask::spawn(self));
            } else {
                debug!("The machine was stopped during the startup sweeps");
            }
        }

        Ok(())
    }

    /// Figure out our RSA identity. In order of preference: the local
    /// store, the server copy, a freshly generated pair.
    async fn resolve_identity(&self) -> E2eeResult<IdentityKeys> {
        if let Some(identity) = self.local_identity().await? {
            trace!("Loaded the identity keys from the local store");
            return Ok(identity);
        }

        let server_keys = self.inner.api.fetch_my_keys().await?;

        let identity = match (&server_keys.public_key, &server_keys.private_key) {
            (Some(public_key), Some(private_key)) => {
                self.unlock_server_keys(public_key, private_key).await?
            }
            _ => self.generate_identity().await?,
        };

        if !server_keys.is_complete() {
            if let Err(error) = self.mirror_identity_to_server(&identity).await {
                // A pair the server never saw must not stay in the local
                // slots, the next start would load it and skip the upload.
                self.clear_local_key_slots().await;

                return Err(error);
            }
        }

        Ok(identity)
    }

    /// Load the identity from the local store.
    ///
    /// Corrupt local keys are treated as absent so the server copy can
    /// take over, they only cost us a warning.
    async fn local_identity(&self) -> E2eeResult<Option<IdentityKeys>> {
        let public_key = self.inner.key_store.get(KeySlot::PublicKey).await?;
        let private_key = self.inner.key_store.get(KeySlot::PrivateKey).await?;

        let (Some(public_key), Some(private_key)) = (public_key, private_key) else {
            return Ok(None);
        };

        match IdentityKeys::from_exported(&public_key, &private_key) {
            Ok(identity) => Ok(Some(identity)),
            Err(error) => {
                warn!(
                    %error,
                    "The locally stored key pair is unusable, falling back to the server copy",
                );
                Ok(None)
            }
        }
    }

    /// Unwrap the server-side copy of our private key, prompting for
    /// the encryption password.
    ///
    /// Concurrent callers share a single prompt through the password
    /// gate, whoever acquires it later picks up the stored result.
    async fn unlock_server_keys(
        &self,
        public_key: &str,
        wrapped_private_key: &str,
    ) -> E2eeResult<IdentityKeys> {
        let _gate = self.inner.password_gate.lock().await;

        if let Some(identity) = self.local_identity().await? {
            return Ok(identity);
        }

        loop {
            let Some(password) = self.inner.prompt.request_password().await else {
                debug!("The password prompt was dismissed");
                return Err(E2eeError::PasswordRequired);
            };

            match unwrap_private_key(wrapped_private_key, &password, &self.inner.user_id) {
                Ok(private_key) => {
                    let identity = IdentityKeys::from_exported(public_key, &private_key)?;
                    self.persist_identity_locally(&identity).await?;

                    info!("Unlocked the account keys with the encryption password");

                    return Ok(identity);
                }
                Err(error) => {
                    warn!(
                        %error,
                        "Failed to unwrap the private key, asking for the password again",
                    );
                }
            }
        }
    }

    /// Generate a fresh key pair for an account that has none.
    async fn generate_identity(&self) -> E2eeResult<IdentityKeys> {
        info!("No key pair anywhere, generating a fresh one");

        let identity = IdentityKeys::generate()?;
        self.persist_identity_locally(&identity).await?;

        // Ask the server to drop wrapped room keys onto our
        // subscriptions now that we can receive them.
        if let Err(error) = self.inner.api.request_subscription_keys().await {
            warn!(%error, "Failed to request the keys of our subscriptions");
        }

        Ok(identity)
    }

    async fn persist_identity_locally(&self, identity: &IdentityKeys) -> E2eeResult<()> {
        self.inner.key_store.set(KeySlot::PublicKey, &identity.export_public()?).await?;
        self.inner.key_store.set(KeySlot::PrivateKey, &identity.export_private()?).await?;

        Ok(())
    }

    /// Upload our key pair, wrapped under a generated recovery
    /// passphrase.
    ///
    /// The passphrase sits in the random-password slot until the user
    /// either writes it down or replaces it with a password of their
    /// own, and is surfaced once through the prompt collaborator after
    /// the upload went through.
    async fn mirror_identity_to_server(&self, identity: &IdentityKeys) -> E2eeResult<()> {
        let passphrase = recovery::generate_passphrase(self.inner.config.passphrase_words);

        self.inner.key_store.set(KeySlot::RandomPassword, &passphrase).await?;

        let public_key = identity.export_public()?;
        let wrapped =
            wrap_private_key(&identity.export_private()?, &passphrase, &self.inner.user_id);

        self.inner.api.set_user_key_pair(&public_key, &wrapped).await?;

        info!("Uploaded the password protected key pair");
        self.inner.prompt.show_recovery_passphrase(&passphrase).await;

        Ok(())
    }

    /// Stop the machine and remove every piece of key material from the
    /// local store.
    ///
    /// Decryptions that are still in flight finish against the old
    /// epoch and their results are discarded.
    #[instrument(skip_all, fields(user_id = %self.inner.user_id))]
    pub async fn stop_client(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);

        {
            let mut state = self.inner.state.write().unwrap();

            if *state == LifecycleState::Stopped {
                return;
            }

            *state = LifecycleState::Stopped;
        }

        self.inner.ready_tx.send_replace(false);

        // Dropping the task aborts the distribution loop.
        *self.inner.distribution.lock().unwrap() = None;

        self.clear_local_key_slots().await;

        *self.inner.identity.write().unwrap() = None;
        self.inner.sessions.clear();

        info!("End to end encryption was shut down");
    }

    async fn clear_local_key_slots(&self) {
        for slot in KeySlot::ALL {
            if let Err(error) = self.inner.key_store.remove(slot).await {
                warn!(%slot, %error, "Failed to remove a key from the local store");
            }
        }
    }

    /// Re-wrap the private key under a new password and upload it.
    ///
    /// The key pair itself stays the same. When the generated password
    /// from the initial key upload is still around, the new password
    /// takes over its slot so the reminder banner shows the value that
    /// actually works.
    #[instrument(skip_all)]
    pub async fn change_password(&self, new_password: &str) -> E2eeResult<()> {
        let Some(identity) = self.identity() else {
            return Err(E2eeError::NotStarted);
        };

        let public_key = identity.export_public()?;
        let wrapped =
            wrap_private_key(&identity.export_private()?, new_password, &self.inner.user_id);

        self.inner.api.set_user_key_pair(&public_key, &wrapped).await?;

        if self.inner.key_store.get(KeySlot::RandomPassword).await?.is_some() {
            self.inner.key_store.set(KeySlot::RandomPassword, new_password).await?;
        }

        info!("Re-wrapped the account keys under a new password");

        Ok(())
    }

    /// Get the session of a room, building it on first access.
    ///
    /// Returns `None` while the machine is not ready, for room types
    /// that can't be encrypted and for rooms that never had encryption
    /// turned on.
    pub async fn get_room_session(&self, room_id: &RoomId) -> Option<RoomSession> {
        if !self.is_ready() {
            return None;
        }

        if let Some(session) = self.inner.sessions.get(room_id) {
            return Some(session.clone());
        }

        // One session build at a time. The second lookup catches
        // sessions built while we were waiting for the gate.
        let _gate = self.inner.creation_gate.lock().await;

        if let Some(session) = self.inner.sessions.get(room_id) {
            return Some(session.clone());
        }

        let epoch = self.epoch();
        let session = self.create_room_session(room_id).await?;

        if !self.is_ready() || self.epoch() != epoch {
            debug!(%room_id, "The machine was stopped while the session was being built");
            return None;
        }

        self.inner.sessions.insert(room_id.clone(), session.clone());

        Some(session)
    }

    /// Drop the session of a room, e.g. after leaving it.
    pub fn remove_room_session(&self, room_id: &RoomId) {
        self.inner.sessions.remove(room_id);
    }

    async fn create_room_session(&self, room_id: &RoomId) -> Option<RoomSession> {
        let identity = self.identity()?;

        let room = match self.inner.chat_store.room(room_id).await {
            Ok(Some(room)) => room,
            Ok(None) => {
                debug!(%room_id, "Asked for the session of an unknown room");
                return None;
            }
            Err(error) => {
                warn!(%room_id, %error, "Failed to load a room");
                return None;
            }
        };

        if !room.supports_e2ee() {
            trace!(%room_id, "The room type does not support encryption");
            return None;
        }

        if !room.encrypted && room.e2e_key_id.is_none() {
            trace!(%room_id, "The room never had encryption turned on");
            return None;
        }

        let subscription = match self.inner.chat_store.subscription(room_id).await {
            Ok(subscription) => subscription,
            Err(error) => {
                warn!(%room_id, %error, "Failed to load a subscription");
                return None;
            }
        };

        let session =
            RoomSession::new(room_id.clone(), self.inner.user_id.clone(), identity.clone());

        if let Some(wrapped) = subscription.as_ref().and_then(|sub| sub.e2e_key.as_deref()) {
            if let Err(error) = session.import_group_key(wrapped) {
                warn!(%room_id, %error, "Failed to unwrap the group key of our own subscription");
            }
        }

        if !session.has_session_key() {
            if room.e2e_key_id.is_some() {
                // Someone else minted the key, ours arrives as a
                // suggested key once they notice us waiting.
                session.mark_key_requested();
            } else {
                self.establish_fresh_group_key(&session, &identity, subscription).await?;
            }
        }

        if room.encrypted {
            session.resume();
        }

        Some(session)
    }

    /// Mint a group key for a room we are the first to encrypt.
    ///
    /// The key id is claimed on the server before the session adopts
    /// the key, so losing the claim race to another client leaves no
    /// established key behind. The next access retries and picks up the
    /// winner's key id.
    async fn establish_fresh_group_key(
        &self,
        session: &RoomSession,
        identity: &IdentityKeys,
        subscription: Option<Subscription>,
    ) -> Option<()> {
        let room_id = session.room_id();
        let key = GroupKey::generate();

        if let Err(error) = self.inner.api.set_room_key_id(room_id, key.key_id()).await {
            warn!(%room_id, %error, "Failed to claim the key id of a fresh group key");
            return None;
        }

        info!(%room_id, key_id = key.key_id(), "Established a fresh group key for the room");
        session.adopt_key(key);

        // Keep our own wrapped copy on the subscription, the same slot
        // a suggested key would land in after acceptance.
        let Some(mut subscription) = subscription else { return Some(()) };
        let Some(wrapped) = session.wrap_key_for(identity.public_key()) else { return Some(()) };

        subscription.e2e_key = Some(wrapped);

        if let Err(error) = self.inner.chat_store.update_subscription(&subscription).await {
            warn!(%room_id, %error, "Failed to persist our own copy of the group key");
        }

        Some(())
    }

    /// Decrypt one message in place.
    ///
    /// Returns whether the message changed. Messages that are not
    /// encrypted, are already decrypted or can't be decrypted right now
    /// are left alone. After a successful decryption, links to our own
    /// messages inside the body are resolved into quote attachments.
    pub async fn decrypt_message(&self, message: &mut Message) -> bool {
        if !self.decrypt_body(message).await {
            return false;
        }

        self.resolve_quoted_messages(message).await;

        true
    }

    async fn decrypt_body(&self, message: &mut Message) -> bool {
        if !message.awaiting_decryption() {
            return false;
        }

        let Some(session) = self.get_room_session(&message.room_id).await else {
            return false;
        };

        if !session.is_active() {
            trace!(message_id = %message.id, "Not decrypting, encryption is paused in this room");
            return false;
        }

        let Some(content) = session.decrypt(&message.msg) else {
            return false;
        };

        message.msg = content.text;
        message.e2e = Some(E2eeState::Done);

        true
    }

    /// Attach decrypted previews for messages linked inside a freshly
    /// decrypted body.
    ///
    /// Goes one level deep. The quoted messages get their bodies
    /// decrypted, but links inside those are not followed further.
    async fn resolve_quoted_messages(&self, message: &mut Message) {
        let links: Vec<(String, MessageId)> = self
            .inner
            .quote_link_regex
            .find_iter(&message.msg)
            .filter_map(|link| {
                let link = link.as_str();
                let quoted_id = Url::parse(link).ok()?.query_pairs().find_map(|(name, value)| {
                    (name == "msg" && !value.is_empty()).then(|| MessageId::new(value))
                })?;

                Some((link.to_owned(), quoted_id))
            })
            .collect();

        for (link, quoted_id) in links {
            let mut quoted = match self.inner.api.get_message(&quoted_id).await {
                Ok(Some(quoted)) => quoted,
                Ok(None) => {
                    debug!(message_id = %quoted_id, "The quoted message does not exist");
                    continue;
                }
                Err(error) => {
                    warn!(message_id = %quoted_id, %error, "Failed to fetch a quoted message");
                    continue;
                }
            };

            self.decrypt_body(&mut quoted).await;

            let attachment = MessageAttachment { text: quoted.msg, message_link: Some(link) };
            message.attachments.push(attachment);
        }
    }

    /// Decrypt every message the store still has marked as pending.
    ///
    /// Runs once on startup and is safe to run again whenever the host
    /// notices a backlog. Messages are worked through oldest first.
    #[instrument(skip_all)]
    pub async fn decrypt_pending_messages(&self) {
        let epoch = self.epoch();

        let pending = match self.inner.chat_store.pending_encrypted_messages().await {
            Ok(pending) => pending,
            Err(error) => {
                warn!(%error, "Failed to load the pending encrypted messages");
                return;
            }
        };

        for mut message in pending {
            if !self.decrypt_message(&mut message).await {
                continue;
            }

            if self.epoch() != epoch {
                debug!("The machine was stopped mid-sweep, discarding the decrypted message");
                return;
            }

            if let Err(error) = self.inner.chat_store.update_message(&message).await {
                warn!(message_id = %message.id, %error, "Failed to write a decrypted message back");
            }
        }
    }

    /// Decrypt the last message of every encrypted subscription, so
    /// room lists can show a preview.
    #[instrument(skip_all)]
    pub async fn decrypt_subscriptions(&self) {
        let epoch = self.epoch();

        let subscriptions = match self.inner.chat_store.encrypted_subscriptions().await {
            Ok(subscriptions) => subscriptions,
            Err(error) => {
                warn!(%error, "Failed to load the encrypted subscriptions");
                return;
            }
        };

        // Rooms are independent, drive them concurrently.
        join_all(
            subscriptions
                .into_iter()
                .map(|subscription| self.decrypt_subscription_preview(subscription, epoch)),
        )
        .await;
    }

    async fn decrypt_subscription_preview(&self, mut subscription: Subscription, epoch: u64) {
        let Some(session) = self.get_room_session(&subscription.room_id).await else {
            return;
        };

        if !session.is_active() || !session.decrypt_subscription(&mut subscription) {
            return;
        }

        if self.epoch() != epoch {
            return;
        }

        if let Err(error) = self.inner.chat_store.update_subscription(&subscription).await {
            warn!(
                room_id = %subscription.room_id,
                %error,
                "Failed to write a decrypted subscription back",
            );
        }
    }

    /// Import every suggested key the store has queued up.
    ///
    /// Runs once on startup. Afterwards suggestions arrive one at a
    /// time through [`on_subscription_changed()`](Self::on_subscription_changed).
    #[instrument(skip_all)]
    pub async fn handle_suggested_keys(&self) {
        let subscriptions = match self.inner.chat_store.subscriptions_with_suggested_keys().await {
            Ok(subscriptions) => subscriptions,
            Err(error) => {
                warn!(%error, "Failed to load the subscriptions with suggested keys");
                return;
            }
        };

        for subscription in subscriptions {
            let Some(suggested) = &subscription.e2e_suggested_key else { continue };

            let Some(session) = self.get_room_session(&subscription.room_id).await else {
                debug!(
                    room_id = %subscription.room_id,
                    "Ignoring a suggested key for an ineligible room",
                );
                continue;
            };

            self.import_suggested_key(&session, suggested).await;
        }
    }

    /// Import one suggested key and report the outcome to the server.
    ///
    /// On acceptance the server moves the suggestion into the
    /// subscription's own key slot, which flows back through sync. On
    /// rejection it puts the participant back on the waiting list so
    /// another client can wrap the key again.
    async fn import_suggested_key(&self, session: &RoomSession, suggested: &str) {
        let room_id = session.room_id();

        match session.import_group_key(suggested) {
            Ok(()) => {
                info!(%room_id, "Imported a suggested group key");

                if let Err(error) = self.inner.api.accept_suggested_group_key(room_id).await {
                    warn!(%room_id, %error, "Failed to report the accepted group key");
                }
            }
            Err(error) => {
                warn!(%room_id, %error, "Rejecting an unusable suggested group key");

                if let Err(error) = self.inner.api.reject_suggested_group_key(room_id).await {
                    warn!(%room_id, %error, "Failed to report the rejected group key");
                }
            }
        }
    }

    /// Process a subscription update from the host's sync channel.
    ///
    /// Imports a newly suggested key and mirrors the subscription's
    /// `encrypted` flag onto the session. A subscription that lost both
    /// the flag and its key takes the session down with it.
    pub async fn on_subscription_changed(&self, subscription: &Subscription) {
        if !subscription.encrypted && subscription.e2e_key.is_none() {
            self.remove_room_session(&subscription.room_id);
            return;
        }

        let Some(session) = self.get_room_session(&subscription.room_id).await else {
            return;
        };

        if let Some(suggested) = &subscription.e2e_suggested_key {
            self.import_suggested_key(&session, suggested).await;
        }

        if subscription.encrypted {
            session.resume();
        } else {
            session.pause();
        }
    }

    /// One pass of the key distribution loop.
    ///
    /// Offers our group keys to participants that are waiting for them,
    /// a bounded number of rooms at a time. Every failure skips the
    /// rest of the tick, the next tick starts over.
    #[instrument(skip_all)]
    pub(crate) async fn distribution_tick(&self) {
        if !self.is_ready() {
            return;
        }

        let rooms = match self.inner.chat_store.rooms_with_waiting_users().await {
            Ok(rooms) => rooms,
            Err(error) => {
                warn!(%error, "Failed to query the rooms with waiting participants");
                return;
            }
        };

        // Rooms where we are the only waiting participant can't be
        // served by us. Of the rest, take a bounded sample and keep the
        // rooms whose key we actually hold.
        let mut sample = Vec::new();

        for room in rooms
            .into_iter()
            .filter(|room| {
                room.users_waiting_for_keys.iter().any(|user| *user != self.inner.user_id)
            })
            .take(self.inner.config.distribution_batch_size)
        {
            let Some(session) = self.get_room_session(&room.id).await else { continue };

            if session.has_session_key() {
                sample.push((room.id, session));
            }
        }

        if sample.is_empty() {
            return;
        }

        let room_ids: Vec<RoomId> = sample.iter().map(|(room_id, _)| room_id.clone()).collect();

        let waiting = match self.inner.api.fetch_users_waiting_for_group_key(&room_ids).await {
            Ok(waiting) => waiting,
            Err(error) => {
                warn!(%error, "Failed to fetch the participants waiting for keys");
                return;
            }
        };

        let mut batch = Vec::new();

        for room in waiting {
            let Some((_, session)) = sample.iter().find(|(room_id, _)| *room_id == room.room_id)
            else {
                continue;
            };

            let Some(keys) = session.encrypt_group_key_for_participants(&room.users) else {
                continue;
            };

            if !keys.is_empty() {
                batch.push(RoomSuggestedKeys { room_id: room.room_id, keys });
            }
        }

        if batch.is_empty() {
            return;
        }

        let rooms_served = batch.len();

        match self.inner.api.provide_users_suggested_group_keys(batch).await {
            Ok(()) => debug!(rooms = rooms_served, "Offered group keys to waiting participants"),
            Err(error) => warn!(%error, "Failed to upload the suggested group keys"),
        }
    }
}
