use std::sync::Arc;

use anyhow::{Context, Result};
use argon2::{password_hash::SaltString, Argon2, Params, PasswordHasher};
use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use zeroize::ZeroizeOnDrop;

const NONCE_LEN: usize = 12;
/// Poly1305 tag appended by the AEAD.
const TAG_LEN: usize = 16;

/// 32-byte ChaCha20Poly1305 key.
#[derive(ZeroizeOnDrop)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Generate a fresh random key. Used for the default ephemeral key mode.
pub fn generate_key() -> EncryptionKey {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    EncryptionKey(key)
}

/// Wrap raw key bytes read from `vanish.key`. Returns `None` unless exactly 32 bytes.
pub fn load_key(bytes: &[u8]) -> Option<EncryptionKey> {
    let key: [u8; 32] = bytes.try_into().ok()?;
    Some(EncryptionKey(key))
}

/// Derive a 32-byte encryption key from `master_key` and `salt` using Argon2id.
/// The salt should be stored persistently (vanish.salt) and reused across restarts.
pub fn derive_key(master_key: &str, salt: &[u8; 32]) -> Result<EncryptionKey> {
    let salt_string = SaltString::encode_b64(salt)
        .map_err(|e| anyhow::anyhow!("invalid salt for argon2: {e}"))?;

    let params = Params::new(
        65536, // m_cost: 64 MiB
        3,     // t_cost: 3 iterations
        1,     // p_cost: 1 lane
        Some(32),
    )
    .map_err(|e| anyhow::anyhow!("argon2 params: {e}"))?;

    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let hash = argon2
        .hash_password(master_key.as_bytes(), &salt_string)
        .map_err(|e| anyhow::anyhow!("argon2 hash: {e}"))?;

    let binding = hash.hash.context("no hash output")?;
    let key = load_key(binding.as_bytes()).context("argon2 output is not 32 bytes")?;
    Ok(key)
}

/// Generate a fresh 32-byte random salt.
pub fn generate_salt() -> [u8; 32] {
    let mut salt = [0u8; 32];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Ciphertext could not be opened: truncated, foreign key, or tampered.
#[derive(Debug, thiserror::Error)]
#[error("decryption failed")]
pub struct DecryptionError;

/// Process-wide symmetric cipher. Cheap to clone; the key is shared read-only.
///
/// Output layout is `nonce (12) || ciphertext || tag (16)`, so every
/// ciphertext is self-contained and two encryptions of the same plaintext
/// never match.
#[derive(Clone)]
pub struct Cipher {
    key: Arc<EncryptionKey>,
}

impl Cipher {
    pub fn new(key: EncryptionKey) -> Self {
        Self { key: Arc::new(key) }
    }

    /// A cipher under a freshly generated key that lives only as long as the process.
    pub fn ephemeral() -> Self {
        Self::new(generate_key())
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(self.key.as_bytes()));

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from(nonce_bytes);

        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| anyhow::anyhow!("encrypt: {e}"))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, DecryptionError> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(DecryptionError);
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(self.key.as_bytes()));
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| DecryptionError)
    }
}
