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

use thiserror::Error;

use crate::{requests::ApiError, store::StoreError};

/// Result alias for operations on the [`E2eeMachine`].
///
/// [`E2eeMachine`]: crate::machine::E2eeMachine
pub type E2eeResult<T> = Result<T, E2eeError>;

/// Failures of the cryptographic primitives.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The underlying cryptographic backend failed in a way that makes the
    /// whole E2EE subsystem unusable, for example because key generation or
    /// the system RNG is broken.
    #[error("the cryptographic backend is unavailable: {0}")]
    CryptoUnavailable(String),

    /// Stored or received key material could not be parsed.
    #[error("malformed key material: {0}")]
    InvalidKeyFormat(String),

    /// A ciphertext could not be decrypted.
    ///
    /// Deliberately carries no detail. Whether the key was wrong or the
    /// data corrupt is logged locally but never reported to callers, so a
    /// remote peer can't use our error responses as a decryption oracle.
    #[error("decryption failed")]
    DecryptionFailed,
}

impl From<rsa::pkcs8::Error> for CryptoError {
    fn from(error: rsa::pkcs8::Error) -> Self {
        Self::InvalidKeyFormat(error.to_string())
    }
}

impl From<rsa::pkcs8::spki::Error> for CryptoError {
    fn from(error: rsa::pkcs8::spki::Error) -> Self {
        Self::InvalidKeyFormat(error.to_string())
    }
}

/// The top level error type for the E2EE machine.
#[derive(Debug, Error)]
pub enum E2eeError {
    /// The private key only exists in its password-wrapped server side
    /// form and no usable password was supplied to unwrap it.
    #[error("a password is required to unlock the private key")]
    PasswordRequired,

    /// The operation needs a started machine.
    #[error("the E2EE machine has not been started")]
    NotStarted,

    /// A cryptographic primitive failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// The local store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A server endpoint call failed.
    #[error(transparent)]
    Api(#[from] ApiError),
}
