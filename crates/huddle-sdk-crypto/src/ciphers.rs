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

//! The symmetric ciphers the E2EE machine uses.
//!
//! Messages and the at-rest copy of the private key are both protected
//! with AES-256-CBC. A fresh random IV is generated for every encryption
//! and transmitted as the first [`IV_SIZE`] bytes of the payload, so one
//! buffer carries everything a holder of the key needs to decrypt it.

use std::fmt;

use aes::{
    Aes256,
    cipher::{
        BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7,
        generic_array::GenericArray,
    },
};
use cbc::{Decryptor, Encryptor};
use hmac::Hmac;
use pbkdf2::pbkdf2;
use rand::{RngCore, thread_rng};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

type Aes256CbcEnc = Encryptor<Aes256>;
type Aes256CbcDec = Decryptor<Aes256>;

/// The size of an AES initialization vector in bytes.
pub const IV_SIZE: usize = 16;
/// The size of an AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;

/// The PBKDF2 round count applied when a key is derived from a password.
///
/// The count is part of the wrapped private key's on-server format, so it
/// can't be raised without versioning that format.
const KDF_ROUNDS: u32 = 1000;

/// Generate a random IV suitable for one AES-CBC encryption.
pub fn generate_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    thread_rng().fill_bytes(&mut iv);

    iv
}

/// A 256 bit key for AES-256-CBC.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Aes256CbcKey([u8; KEY_SIZE]);

impl Aes256CbcKey {
    /// Generate a new random key.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        thread_rng().fill_bytes(&mut key);

        Self(key)
    }

    /// Create a key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Deterministically derive a key from a password and a salt using
    /// PBKDF2-HMAC-SHA256.
    ///
    /// Only used to wrap and unwrap the identity private key, never as a
    /// message key.
    pub fn from_password(password: &str, salt: &[u8]) -> Self {
        let mut key = [0u8; KEY_SIZE];
        pbkdf2::<Hmac<Sha256>>(password.as_bytes(), salt, KDF_ROUNDS, &mut key)
            .expect("We should be able to expand a password of any length");

        Self(key)
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Encrypt the given plaintext with a fresh random IV.
    ///
    /// The returned buffer is `iv || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        self.encrypt_with_iv(&generate_iv(), plaintext)
    }

    /// Encrypt the given plaintext with the given IV, returning
    /// `iv || ciphertext`.
    pub fn encrypt_with_iv(&self, iv: &[u8; IV_SIZE], plaintext: &[u8]) -> Vec<u8> {
        let cipher = Aes256CbcEnc::new(&self.0.into(), iv.into());
        let mut ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut payload = Vec::with_capacity(IV_SIZE + ciphertext.len());
        payload.extend_from_slice(iv);
        payload.append(&mut ciphertext);

        payload
    }

    /// Decrypt a payload produced by [`Aes256CbcKey::encrypt`].
    ///
    /// The IV is taken from the front of the payload. Fails with
    /// [`CryptoError::DecryptionFailed`] if the payload is too short, not
    /// correctly padded, or was encrypted under a different key.
    pub fn decrypt(&self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if payload.len() < IV_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }

        let (iv, ciphertext) = payload.split_at(IV_SIZE);

        let cipher = Aes256CbcDec::new(&self.0.into(), GenericArray::from_slice(iv));
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl fmt::Debug for Aes256CbcKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aes256CbcKey").finish_non_exhaustive()
    }
}
