//! AES-256-GCM state protection.
//!
//! Tokens have the layout `base64url(version || nonce || ciphertext)`. The
//! encryption key is derived from a master key and a purpose chain, and the
//! purpose chain is also bound as associated data, so a token issued for one
//! handler, scheme or format version never verifies under another.

use crate::error::StateError;
use crate::state::{StatePayload, StateProtector};
use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use rand::{Rng, thread_rng};
use sha2::Sha256;

const TOKEN_VERSION: u8 = 1;
const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

type HmacSha256 = Hmac<Sha256>;

pub struct AeadStateProtector {
    cipher: Aes256Gcm,
    purpose: Vec<u8>,
}

impl AeadStateProtector {
    /// Protector keyed from a fresh random master key. Tokens only verify in
    /// this process, for the lifetime of this instance.
    pub fn ephemeral(purposes: &[&str]) -> Result<Self, StateError> {
        let mut master_key = [0u8; KEY_SIZE];
        thread_rng().fill(&mut master_key);
        Self::from_master_key(&master_key, purposes)
    }

    /// Protector keyed from a shared master key, for deployments where the
    /// callback may land on a different instance than the challenge.
    pub fn from_master_key(master_key: &[u8], purposes: &[&str]) -> Result<Self, StateError> {
        if master_key.len() < KEY_SIZE {
            return Err(StateError::Protection(format!(
                "master key must be at least {} bytes",
                KEY_SIZE
            )));
        }

        let purpose = purposes.join("\u{0}").into_bytes();
        let subkey = derive_subkey(master_key, &purpose)?;
        let cipher = Aes256Gcm::new_from_slice(&subkey)
            .map_err(|_| StateError::Protection("invalid derived key length".to_string()))?;

        Ok(Self { cipher, purpose })
    }
}

fn derive_subkey(master_key: &[u8], purpose: &[u8]) -> Result<[u8; KEY_SIZE], StateError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(master_key)
        .map_err(|_| StateError::Protection("invalid master key".to_string()))?;
    mac.update(b"ras-oauth2-signin state key");
    mac.update(purpose);

    let mut subkey = [0u8; KEY_SIZE];
    subkey.copy_from_slice(&mac.finalize().into_bytes());
    Ok(subkey)
}

impl StateProtector for AeadStateProtector {
    fn protect(&self, payload: &StatePayload) -> Result<String, StateError> {
        let plaintext = serde_json::to_vec(payload)?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        thread_rng().fill(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &plaintext,
                    aad: &self.purpose,
                },
            )
            .map_err(|_| StateError::Protection("encryption failed".to_string()))?;

        let mut token = Vec::with_capacity(1 + NONCE_SIZE + ciphertext.len());
        token.push(TOKEN_VERSION);
        token.extend_from_slice(&nonce_bytes);
        token.extend(ciphertext);

        Ok(URL_SAFE_NO_PAD.encode(token))
    }

    fn unprotect(&self, token: &str) -> Result<StatePayload, StateError> {
        let raw = URL_SAFE_NO_PAD
            .decode(token.as_bytes())
            .map_err(|_| StateError::Malformed)?;

        let (&version, rest) = raw.split_first().ok_or(StateError::Malformed)?;
        if version != TOKEN_VERSION {
            return Err(StateError::UnsupportedVersion(version));
        }
        if rest.len() <= NONCE_SIZE {
            return Err(StateError::Malformed);
        }

        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: &self.purpose,
                },
            )
            .map_err(|_| StateError::Authentication)?;

        let payload: StatePayload = serde_json::from_slice(&plaintext)?;
        if payload.is_expired() {
            return Err(StateError::Expired);
        }

        Ok(payload)
    }
}
