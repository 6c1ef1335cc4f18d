use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rand::RngCore;
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use tracing::debug;

use super::caller::Caller;
use super::crypto::Cipher;
use super::model::{Lifetime, Page, PageRequest, SecretMeta, SecretRecord};

pub(crate) const SECRETS: TableDefinition<u64, &[u8]> = TableDefinition::new("secrets");
/// Encrypted passphrase -> secret id. Enforces token uniqueness.
pub(crate) const TOKENS: TableDefinition<&[u8], u64> = TableDefinition::new("secret_tokens");
/// (owner_id, secret_id). Ids are monotonic, so range order is creation order.
pub(crate) const OWNER_INDEX: TableDefinition<(u64, u64), ()> =
    TableDefinition::new("secret_owner_index");
/// (lifetime code, created_at, secret_id). Lets the sweep range-scan one bucket.
pub(crate) const EXPIRY_INDEX: TableDefinition<(u8, i64, u64), ()> =
    TableDefinition::new("secret_expiry_index");
const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");
const SECRET_SEQ_KEY: &str = "secret_seq";

/// Length of a generated passphrase before encryption.
const PASSPHRASE_LEN: usize = 32;

/// Result of storing a secret.
#[derive(Debug, PartialEq)]
pub enum PutResult {
    /// Persisted. `token` is the encrypted passphrase the caller must present later.
    Created { id: u64, token: Vec<u8> },
    /// Another live secret already uses this token. Nothing was written.
    TokenConflict,
    /// The caller went away before commit. Nothing was written.
    Abandoned,
}

/// Result of a one-shot retrieval.
#[derive(Debug, PartialEq)]
pub enum TakeResult {
    /// Decrypted and deleted in the same transaction.
    Delivered(Vec<u8>),
    /// No record for this token and owner (never existed, consumed, or swept).
    NotFound,
    /// Record matched but its content would not decrypt. Left in place.
    Corrupt,
    /// Decrypted, but the caller went away before commit. Left in place.
    Abandoned,
}

/// Thread-safe handle to the redb store.
#[derive(Clone)]
pub struct Store {
    pub(crate) db: Arc<Database>,
    cipher: Cipher,
}

impl Store {
    /// Open (or create) the database at `path`, using `cipher` for secret payloads.
    pub fn open(path: &Path, cipher: Cipher) -> Result<Self> {
        let db = Database::create(path).context("open redb database")?;

        // Ensure all tables exist.
        let write_txn = db.begin_write()?;
        write_txn.open_table(SECRETS)?;
        write_txn.open_table(TOKENS)?;
        write_txn.open_table(OWNER_INDEX)?;
        write_txn.open_table(EXPIRY_INDEX)?;
        write_txn.open_table(COUNTERS)?;
        write_txn.open_table(super::users::USERS)?;
        write_txn.open_table(super::users::USER_EMAILS)?;
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(db),
            cipher,
        })
    }

    pub fn cipher(&self) -> &Cipher {
        &self.cipher
    }

    pub(crate) fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }

    /// Allocate the next id for `seq_key` inside an open write transaction.
    pub(crate) fn next_id(write_txn: &WriteTransaction, seq_key: &str) -> Result<u64> {
        let mut counters = write_txn.open_table(COUNTERS)?;
        let seq = counters.get(seq_key)?.map(|g| g.value()).unwrap_or(0) + 1;
        counters.insert(seq_key, seq)?;
        Ok(seq)
    }

    /// Encrypt `content` and a passphrase, then persist a new secret owned by `owner_id`.
    /// A random passphrase is generated unless the caller supplies one.
    pub fn put(
        &self,
        owner_id: u64,
        content: &[u8],
        passphrase: Option<&[u8]>,
        lifetime: Lifetime,
        caller: Caller,
    ) -> Result<PutResult> {
        self.put_at(owner_id, content, passphrase, lifetime, Self::now(), caller)
    }

    pub(crate) fn put_at(
        &self,
        owner_id: u64,
        content: &[u8],
        passphrase: Option<&[u8]>,
        lifetime: Lifetime,
        created_at: i64,
        caller: Caller,
    ) -> Result<PutResult> {
        let content_encrypted = self.cipher.encrypt(content).context("encrypt content")?;
        let passphrase_encrypted = match passphrase {
            Some(p) => self.cipher.encrypt(p),
            None => {
                let mut generated = [0u8; PASSPHRASE_LEN];
                rand::thread_rng().fill_bytes(&mut generated);
                self.cipher.encrypt(&generated)
            }
        }
        .context("encrypt passphrase")?;

        self.insert_record(
            SecretRecord {
                owner_id,
                content_encrypted,
                passphrase_encrypted,
                lifetime,
                created_at,
            },
            caller,
        )
    }

    /// Persist an already-encrypted record together with its index entries.
    pub(crate) fn insert_record(
        &self,
        record: SecretRecord,
        mut caller: Caller,
    ) -> Result<PutResult> {
        let write_txn = self.db.begin_write()?;
        let id = {
            let mut tokens = write_txn.open_table(TOKENS)?;
            if tokens.get(record.passphrase_encrypted.as_slice())?.is_some() {
                drop(tokens);
                write_txn.abort()?;
                return Ok(PutResult::TokenConflict);
            }

            let id = Self::next_id(&write_txn, SECRET_SEQ_KEY)?;
            tokens.insert(record.passphrase_encrypted.as_slice(), id)?;

            let bytes = encode(&record)?;
            write_txn.open_table(SECRETS)?.insert(id, bytes.as_slice())?;
            write_txn
                .open_table(OWNER_INDEX)?
                .insert((record.owner_id, id), ())?;
            write_txn
                .open_table(EXPIRY_INDEX)?
                .insert((record.lifetime.code(), record.created_at, id), ())?;
            id
        };
        if caller.is_gone() {
            write_txn.abort()?;
            debug!(owner_id = record.owner_id, "caller gone, secret not stored");
            return Ok(PutResult::Abandoned);
        }
        write_txn.commit()?;

        debug!(id, owner_id = record.owner_id, lifetime = %record.lifetime, "stored secret");
        Ok(PutResult::Created {
            id,
            token: record.passphrase_encrypted.clone(),
        })
    }

    /// Look up the secret for `token` owned by `owner_id`, decrypt it and delete it.
    ///
    /// Lookup, decrypt and delete share one write transaction: of two concurrent
    /// calls with the same token exactly one sees the record. An owner mismatch
    /// or a decryption failure aborts the transaction and leaves the record intact,
    /// and so does a `caller` that is gone by the time the delete would commit.
    pub fn take(&self, token: &[u8], owner_id: u64, mut caller: Caller) -> Result<TakeResult> {
        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut tokens = write_txn.open_table(TOKENS)?;
            let mut secrets = write_txn.open_table(SECRETS)?;

            let id = tokens.get(token)?.map(|g| g.value());
            let raw_bytes: Option<Vec<u8>> = match id {
                Some(id) => secrets.get(id)?.map(|guard| guard.value().to_vec()),
                None => None,
            };

            match (id, raw_bytes) {
                (Some(id), Some(bytes)) => {
                    let record = decode(&bytes)?;
                    if record.owner_id != owner_id {
                        TakeResult::NotFound
                    } else {
                        match self.cipher.decrypt(&record.content_encrypted) {
                            Err(_) => TakeResult::Corrupt,
                            Ok(plaintext) => {
                                secrets.remove(id)?;
                                tokens.remove(token)?;
                                write_txn
                                    .open_table(OWNER_INDEX)?
                                    .remove((record.owner_id, id))?;
                                write_txn.open_table(EXPIRY_INDEX)?.remove((
                                    record.lifetime.code(),
                                    record.created_at,
                                    id,
                                ))?;
                                debug!(id, "burning after read");
                                TakeResult::Delivered(plaintext)
                            }
                        }
                    }
                }
                _ => TakeResult::NotFound,
            }
        };

        match outcome {
            TakeResult::Delivered(_) if caller.is_gone() => {
                write_txn.abort()?;
                debug!("caller gone, retrieval rolled back");
                Ok(TakeResult::Abandoned)
            }
            TakeResult::Delivered(_) => {
                write_txn.commit()?;
                Ok(outcome)
            }
            _ => {
                write_txn.abort()?;
                Ok(outcome)
            }
        }
    }

    /// List metadata for `owner_id`'s secrets in creation order.
    /// No age filter: expired records stay visible until the sweep removes them.
    pub fn list(&self, owner_id: u64, req: PageRequest) -> Result<Page<SecretMeta>> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(OWNER_INDEX)?;
        let secrets = read_txn.open_table(SECRETS)?;

        let mut total = 0usize;
        let mut metas = Vec::new();
        for item in index.range((owner_id, 0u64)..=(owner_id, u64::MAX))? {
            let (k, _) = item?;
            let (_, id) = k.value();
            total += 1;
            if total <= req.offset() || metas.len() >= req.size {
                continue;
            }
            let raw_bytes: Option<Vec<u8>> =
                secrets.get(id)?.map(|guard| guard.value().to_vec());
            if let Some(bytes) = raw_bytes {
                let record = decode(&bytes)?;
                metas.push(SecretMeta {
                    id,
                    created_at: record.created_at,
                    lifetime: record.lifetime,
                    expires_at: record.expires_at(),
                });
            }
        }
        Ok(Page::new(metas, total, req))
    }

    /// Delete every secret owned by `owner_id` inside `write_txn`. Returns the count.
    pub(crate) fn remove_owned(write_txn: &WriteTransaction, owner_id: u64) -> Result<usize> {
        let mut index = write_txn.open_table(OWNER_INDEX)?;
        let ids: Vec<u64> = {
            let mut ids = Vec::new();
            for item in index.range((owner_id, 0u64)..=(owner_id, u64::MAX))? {
                let (k, _) = item?;
                ids.push(k.value().1);
            }
            ids
        };

        let mut secrets = write_txn.open_table(SECRETS)?;
        let mut tokens = write_txn.open_table(TOKENS)?;
        let mut expiry = write_txn.open_table(EXPIRY_INDEX)?;
        for id in &ids {
            index.remove((owner_id, *id))?;
            let raw_bytes: Option<Vec<u8>> =
                secrets.remove(*id)?.map(|guard| guard.value().to_vec());
            if let Some(bytes) = raw_bytes {
                let record = decode(&bytes)?;
                tokens.remove(record.passphrase_encrypted.as_slice())?;
                expiry.remove((record.lifetime.code(), record.created_at, *id))?;
            }
        }
        Ok(ids.len())
    }
}

pub(crate) fn encode(record: &SecretRecord) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(record, bincode::config::standard())
        .context("bincode encode secret")
}

pub(crate) fn decode(bytes: &[u8]) -> Result<SecretRecord> {
    if bytes.is_empty() {
        anyhow::bail!("empty record");
    }
    let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .context("bincode decode secret")?;
    Ok(record)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::tempdir;

    pub(crate) fn make_store() -> (Store, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = Store::open(&path, Cipher::ephemeral()).unwrap();
        (store, dir)
    }

    pub(crate) fn put_ok(s: &Store, owner: u64, content: &str, lifetime: Lifetime) -> Vec<u8> {
        match s
            .put(owner, content.as_bytes(), None, lifetime, Caller::detached())
            .unwrap()
        {
            PutResult::Created { token, .. } => token,
            other => panic!("unexpected put result: {other:?}"),
        }
    }

    /// Number of stored secrets across all owners.
    pub(crate) fn count_secrets(s: &Store) -> usize {
        let read_txn = s.db.begin_read().unwrap();
        let table = read_txn.open_table(SECRETS).unwrap();
        table.iter().unwrap().count()
    }

    /// Where a lookup token stands without consuming it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum RetrievalState {
        Pending,
        /// Past its lifetime; the next sweep deletes it.
        Expired,
        /// Delivered, swept or never created.
        NotFound,
    }

    pub(crate) fn state_of(s: &Store, token: &[u8], now: i64) -> RetrievalState {
        let read_txn = s.db.begin_read().unwrap();
        let tokens = read_txn.open_table(TOKENS).unwrap();
        let Some(id) = tokens.get(token).unwrap().map(|g| g.value()) else {
            return RetrievalState::NotFound;
        };
        let secrets = read_txn.open_table(SECRETS).unwrap();
        let Some(bytes) = secrets.get(id).unwrap().map(|g| g.value().to_vec()) else {
            return RetrievalState::NotFound;
        };
        let record = decode(&bytes).unwrap();
        if record.created_at <= now - record.lifetime.seconds() {
            RetrievalState::Expired
        } else {
            RetrievalState::Pending
        }
    }

    #[test]
    fn put_take_is_one_shot() {
        let (s, _dir) = make_store();
        let token = put_ok(&s, 1, "hello", Lifetime::FiveMinutes);
        assert_eq!(
            s.take(&token, 1, Caller::detached()).unwrap(),
            TakeResult::Delivered(b"hello".to_vec())
        );
        assert_eq!(s.take(&token, 1, Caller::detached()).unwrap(), TakeResult::NotFound);
        assert_eq!(count_secrets(&s), 0);
    }

    #[test]
    fn take_for_departed_caller_rolls_back() {
        let (s, _dir) = make_store();
        let token = put_ok(&s, 1, "still here", Lifetime::OneHour);

        let (caller, waiting) = Caller::attached();
        drop(waiting);
        assert_eq!(s.take(&token, 1, caller).unwrap(), TakeResult::Abandoned);
        assert_eq!(count_secrets(&s), 1);
        assert_eq!(state_of(&s, &token, Store::now()), RetrievalState::Pending);

        let (caller, _waiting) = Caller::attached();
        assert_eq!(
            s.take(&token, 1, caller).unwrap(),
            TakeResult::Delivered(b"still here".to_vec())
        );
    }

    #[test]
    fn put_for_departed_caller_writes_nothing() {
        let (s, _dir) = make_store();
        let (caller, waiting) = Caller::attached();
        drop(waiting);
        assert_eq!(
            s.put(1, b"orphan", None, Lifetime::OneHour, caller).unwrap(),
            PutResult::Abandoned
        );
        assert_eq!(count_secrets(&s), 0);
        assert_eq!(s.list(1, PageRequest::default()).unwrap().total, 0);
    }

    #[test]
    fn take_by_other_owner_leaves_record() {
        let (s, _dir) = make_store();
        let token = put_ok(&s, 1, "mine", Lifetime::OneHour);
        assert_eq!(s.take(&token, 2, Caller::detached()).unwrap(), TakeResult::NotFound);
        assert_eq!(
            state_of(&s, &token, Store::now()),
            RetrievalState::Pending
        );
        assert_eq!(
            s.take(&token, 1, Caller::detached()).unwrap(),
            TakeResult::Delivered(b"mine".to_vec())
        );
    }

    #[test]
    fn token_is_ciphertext_of_passphrase() {
        let (s, _dir) = make_store();
        let result = s
            .put(1, b"content", Some(b"open sesame"), Lifetime::OneDay, Caller::detached())
            .unwrap();
        let PutResult::Created { token, .. } = result else {
            panic!("expected created");
        };
        assert_eq!(s.cipher().decrypt(&token).unwrap(), b"open sesame");
    }

    #[test]
    fn token_conflict_aborts_without_writing() {
        let (s, _dir) = make_store();
        let record = |content: &[u8]| SecretRecord {
            owner_id: 1,
            content_encrypted: s.cipher().encrypt(content).unwrap(),
            passphrase_encrypted: b"duplicate-token-bytes".to_vec(),
            lifetime: Lifetime::OneHour,
            created_at: Store::now(),
        };
        assert!(matches!(
            s.insert_record(record(b"first"), Caller::detached()).unwrap(),
            PutResult::Created { .. }
        ));
        assert_eq!(
            s.insert_record(record(b"second"), Caller::detached()).unwrap(),
            PutResult::TokenConflict
        );
        assert_eq!(count_secrets(&s), 1);
        assert_eq!(s.list(1, PageRequest::default()).unwrap().total, 1);
        assert_eq!(
            s.take(b"duplicate-token-bytes", 1, Caller::detached()).unwrap(),
            TakeResult::Delivered(b"first".to_vec())
        );
    }

    #[test]
    fn corrupt_content_is_reported_and_kept() {
        let (s, _dir) = make_store();
        let foreign = Cipher::ephemeral();
        let record = SecretRecord {
            owner_id: 3,
            content_encrypted: foreign.encrypt(b"other key").unwrap(),
            passphrase_encrypted: b"corrupt-token".to_vec(),
            lifetime: Lifetime::OneHour,
            created_at: Store::now(),
        };
        s.insert_record(record, Caller::detached()).unwrap();
        assert_eq!(
            s.take(b"corrupt-token", 3, Caller::detached()).unwrap(),
            TakeResult::Corrupt
        );
        assert_eq!(count_secrets(&s), 1);
    }

    #[test]
    fn state_of_reports_expired_until_swept() {
        let (s, _dir) = make_store();
        let now = Store::now();
        let PutResult::Created { token, .. } = s
            .put_at(1, b"old", None, Lifetime::FiveMinutes, now - 301, Caller::detached())
            .unwrap()
        else {
            panic!("expected created");
        };
        assert_eq!(state_of(&s, &token, now), RetrievalState::Expired);
        assert_eq!(
            state_of(&s, b"never-issued", now),
            RetrievalState::NotFound
        );
    }

    #[test]
    fn list_is_owner_scoped_paginated_and_ordered() {
        let (s, _dir) = make_store();
        for i in 0..5 {
            put_ok(&s, 7, &format!("v{i}"), Lifetime::OneDay);
        }
        put_ok(&s, 8, "someone else", Lifetime::OneDay);

        let first = s.list(7, PageRequest::new(Some(1), Some(2))).unwrap();
        assert_eq!(first.total, 5);
        assert_eq!(first.pages, 3);
        assert_eq!(first.items.len(), 2);
        assert!(first.items[0].id < first.items[1].id);

        let last = s.list(7, PageRequest::new(Some(3), Some(2))).unwrap();
        assert_eq!(last.items.len(), 1);

        let beyond = s.list(7, PageRequest::new(Some(9), Some(2))).unwrap();
        assert!(beyond.items.is_empty());
        assert_eq!(beyond.total, 5);

        assert_eq!(s.list(8, PageRequest::default()).unwrap().total, 1);
        assert_eq!(s.list(9, PageRequest::default()).unwrap().total, 0);
    }

    #[test]
    fn list_keeps_expired_until_swept() {
        let (s, _dir) = make_store();
        let backdated = Store::now() - 3600;
        s.put_at(1, b"stale", None, Lifetime::FiveMinutes, backdated, Caller::detached())
            .unwrap();
        assert_eq!(s.list(1, PageRequest::default()).unwrap().total, 1);
    }

    #[test]
    fn concurrent_takes_have_one_winner() {
        let (s, _dir) = make_store();
        let token = put_ok(&s, 1, "race", Lifetime::OneHour);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = s.clone();
                let token = token.clone();
                std::thread::spawn(move || s.take(&token, 1, Caller::detached()).unwrap())
            })
            .collect();
        let results: Vec<TakeResult> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let delivered = results
            .iter()
            .filter(|r| matches!(r, TakeResult::Delivered(_)))
            .count();
        assert_eq!(delivered, 1);
        assert_eq!(results.len() - delivered, 7);
        assert!(results
            .iter()
            .all(|r| matches!(r, TakeResult::Delivered(_) | TakeResult::NotFound)));
    }

    #[test]
    fn reopen_with_other_key_cannot_decrypt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("restart.db");
        let token = {
            let s = Store::open(&path, Cipher::ephemeral()).unwrap();
            put_ok(&s, 1, "before restart", Lifetime::OneDay)
        };
        let s = Store::open(&path, Cipher::ephemeral()).unwrap();
        assert_eq!(s.take(&token, 1, Caller::detached()).unwrap(), TakeResult::Corrupt);
    }
}
