//! Secret lifecycle operations: create, one-shot retrieve, list.
//!
//! These sit between the HTTP handlers and the store and translate store
//! outcomes into [`VanishError`]. A retrieval that misses for any reason
//! (unknown token, wrong owner, already read, swept) is a plain `NotFound`.

use tracing::{info, warn};

use crate::error::{Result, VanishError};
use crate::store::{
    Caller, Lifetime, Page, PageRequest, PutResult, SecretMeta, Store, TakeResult,
};

/// Returned once, at creation. `token` is the only way back to the content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedSecret {
    pub id: u64,
    pub token: Vec<u8>,
}

pub fn create_secret(
    store: &Store,
    owner_id: u64,
    content: &str,
    lifetime: Lifetime,
    passphrase: Option<&str>,
    caller: Caller,
) -> Result<CreatedSecret> {
    match store.put(
        owner_id,
        content.as_bytes(),
        passphrase.map(str::as_bytes),
        lifetime,
        caller,
    )? {
        PutResult::Created { id, token } => {
            info!(id, owner_id, lifetime = %lifetime, "secret created");
            Ok(CreatedSecret { id, token })
        }
        PutResult::TokenConflict => {
            warn!(owner_id, "lookup token collision on create");
            Err(VanishError::Conflict("lookup token already in use".into()))
        }
        PutResult::Abandoned => Err(VanishError::Cancelled),
    }
}

pub fn retrieve_secret(
    store: &Store,
    token: &[u8],
    requester_id: u64,
    caller: Caller,
) -> Result<String> {
    match store.take(token, requester_id, caller)? {
        TakeResult::Delivered(plaintext) => {
            info!(requester_id, "secret delivered and destroyed");
            // Content is only ever stored from a `&str` and the AEAD tag
            // authenticated it, so the lossy path never substitutes anything.
            Ok(String::from_utf8_lossy(&plaintext).into_owned())
        }
        TakeResult::NotFound => Err(VanishError::NotFound),
        TakeResult::Corrupt => Err(VanishError::Integrity),
        TakeResult::Abandoned => {
            info!(requester_id, "requester gone before delivery, secret kept");
            Err(VanishError::Cancelled)
        }
    }
}

pub fn list_secrets(store: &Store, owner_id: u64, req: PageRequest) -> Result<Page<SecretMeta>> {
    Ok(store.list(owner_id, req)?)
}

/// Decode a lookup token as presented on the wire (lowercase hex).
pub fn parse_token(raw: &str) -> Result<Vec<u8>> {
    // Malformed tokens are indistinguishable from unknown ones.
    hex::decode(raw.trim()).map_err(|_| VanishError::NotFound)
}

pub fn format_token(token: &[u8]) -> String {
    hex::encode(token)
}
