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

//! The user's long lived asymmetric identity key pair.
//!
//! Every E2EE-enabled user owns one RSA-2048 pair. The public half is
//! uploaded to the server so other participants can wrap room keys for
//! us; the private half decrypts those wrapped keys. Keys travel and rest
//! as base64 encoded DER, SPKI for the public key and PKCS#8 for the
//! private one.
//!
//! The private key is mirrored to the server for multi-device recovery,
//! but only after being wrapped: AES-256-CBC under a PBKDF2 key derived
//! from the user's E2EE password, salted with the user id. See
//! [`wrap_private_key`] and [`unwrap_private_key`].

use std::fmt;

use huddle_sdk_common::UserId;
use rand::thread_rng;
use rsa::{
    Oaep, RsaPrivateKey, RsaPublicKey,
    pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey},
};
use sha2::Sha256;

use crate::{
    ciphers::Aes256CbcKey,
    error::CryptoError,
    utilities::{base64_decode, base64_encode},
};

/// The modulus size of a freshly generated identity key pair.
const RSA_KEY_BITS: usize = 2048;

/// A user's identity key pair.
#[derive(Clone)]
pub struct IdentityKeys {
    public: RsaPublicKey,
    private: RsaPrivateKey,
}

impl IdentityKeys {
    /// Generate a fresh RSA-2048 identity key pair.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut rng = thread_rng();
        let private = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
            .map_err(|e| CryptoError::CryptoUnavailable(e.to_string()))?;
        let public = RsaPublicKey::from(&private);

        Ok(Self { public, private })
    }

    /// Reconstruct the pair from its exported form.
    pub fn from_exported(public_key: &str, private_key: &str) -> Result<Self, CryptoError> {
        let public = import_public_key(public_key)?;

        let der = base64_decode(private_key)
            .map_err(|e| CryptoError::InvalidKeyFormat(e.to_string()))?;
        let private = RsaPrivateKey::from_pkcs8_der(&der)?;

        Ok(Self { public, private })
    }

    /// The public half of the pair.
    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    /// Export the public key as base64 encoded SPKI DER.
    pub fn export_public(&self) -> Result<String, CryptoError> {
        let der = self.public.to_public_key_der()?;

        Ok(base64_encode(der.as_bytes()))
    }

    /// Export the private key as base64 encoded PKCS#8 DER.
    ///
    /// The result is plaintext key material. It only ever goes into the
    /// device-local store, or through [`wrap_private_key`] before leaving
    /// the device.
    pub fn export_private(&self) -> Result<String, CryptoError> {
        let der = self.private.to_pkcs8_der()?;

        Ok(base64_encode(der.as_bytes()))
    }

    /// Decrypt a small RSA-OAEP payload, usually a wrapped room key.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.private
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl fmt::Debug for IdentityKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeys").finish_non_exhaustive()
    }
}

/// Import a peer's public key from its exported form.
pub fn import_public_key(serialized: &str) -> Result<RsaPublicKey, CryptoError> {
    let der =
        base64_decode(serialized).map_err(|e| CryptoError::InvalidKeyFormat(e.to_string()))?;

    Ok(RsaPublicKey::from_public_key_der(&der)?)
}

/// Encrypt a small payload under the given public key with RSA-OAEP.
pub fn encrypt_for(public_key: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut rng = thread_rng();

    public_key
        .encrypt(&mut rng, Oaep::new::<Sha256>(), plaintext)
        .map_err(|e| CryptoError::CryptoUnavailable(e.to_string()))
}

/// Wrap an exported private key under a password for server side storage.
///
/// The wrapping key is derived with PBKDF2 from the password, salted with
/// the owning user's id so equal passwords of different users still derive
/// different keys. Returns `base64(iv || ciphertext)`.
pub fn wrap_private_key(exported_private: &str, password: &str, user_id: &UserId) -> String {
    let key = Aes256CbcKey::from_password(password, user_id.as_str().as_bytes());

    base64_encode(key.encrypt(exported_private.as_bytes()))
}

/// Unwrap a private key wrapped with [`wrap_private_key`].
///
/// Fails with [`CryptoError::DecryptionFailed`] when the password is wrong
/// or the payload is corrupt, without distinguishing the two.
pub fn unwrap_private_key(
    wrapped: &str,
    password: &str,
    user_id: &UserId,
) -> Result<String, CryptoError> {
    let payload = base64_decode(wrapped).map_err(|_| CryptoError::DecryptionFailed)?;
    let key = Aes256CbcKey::from_password(password, user_id.as_str().as_bytes());

    let plaintext = key.decrypt(&payload)?;

    String::from_utf8(plaintext).map_err(|_| CryptoError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use huddle_sdk_common::UserId;

    use super::{
        IdentityKeys, encrypt_for, import_public_key, unwrap_private_key, wrap_private_key,
    };
    use crate::error::CryptoError;

    #[test]
    fn exported_keys_can_be_imported_again() {
        let keys = IdentityKeys::generate().unwrap();

        let public = keys.export_public().unwrap();
        let private = keys.export_private().unwrap();

        let restored = IdentityKeys::from_exported(&public, &private).unwrap();

        let ciphertext = encrypt_for(restored.public_key(), b"hello").unwrap();
        assert_eq!(keys.decrypt(&ciphertext).unwrap(), b"hello");
    }

    #[test]
    fn asymmetric_roundtrip() {
        let keys = IdentityKeys::generate().unwrap();
        let public = import_public_key(&keys.export_public().unwrap()).unwrap();

        let ciphertext = encrypt_for(&public, b"a wrapped room key").unwrap();

        assert_eq!(keys.decrypt(&ciphertext).unwrap(), b"a wrapped room key");
    }

    #[test]
    fn decrypting_with_the_wrong_private_key_fails() {
        let keys = IdentityKeys::generate().unwrap();
        let other = IdentityKeys::generate().unwrap();

        let ciphertext = encrypt_for(keys.public_key(), b"hello").unwrap();

        assert_matches!(other.decrypt(&ciphertext), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn malformed_keys_are_rejected_on_import() {
        assert_matches!(
            import_public_key("not base64 at all!"),
            Err(CryptoError::InvalidKeyFormat(_))
        );
        assert_matches!(
            // Valid base64, but not DER.
            import_public_key("aGVsbG8gd29ybGQ="),
            Err(CryptoError::InvalidKeyFormat(_))
        );
    }

    #[test]
    fn private_key_wrapping_roundtrip() {
        let user_id = UserId::new("alice");
        let keys = IdentityKeys::generate().unwrap();
        let exported = keys.export_private().unwrap();

        let wrapped = wrap_private_key(&exported, "hunter2", &user_id);
        let unwrapped = unwrap_private_key(&wrapped, "hunter2", &user_id).unwrap();

        assert_eq!(unwrapped, exported);
    }

    #[test]
    fn unwrapping_with_the_wrong_password_fails() {
        let user_id = UserId::new("alice");
        let keys = IdentityKeys::generate().unwrap();
        let exported = keys.export_private().unwrap();

        let wrapped = wrap_private_key(&exported, "hunter2", &user_id);

        assert_matches!(
            unwrap_private_key(&wrapped, "*******", &user_id),
            Err(CryptoError::DecryptionFailed)
        );
        // The user id salts the derivation, so even the right password
        // fails under a different user.
        assert_matches!(
            unwrap_private_key(&wrapped, "hunter2", &UserId::new("bob")),
            Err(CryptoError::DecryptionFailed)
        );
    }
}
