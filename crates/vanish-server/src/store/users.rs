use anyhow::{Context, Result};
use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::db::Store;
use super::model::{Page, PageRequest};

pub(crate) const USERS: TableDefinition<u64, &[u8]> = TableDefinition::new("users");
/// Lower-cased email -> user id.
pub(crate) const USER_EMAILS: TableDefinition<&str, u64> = TableDefinition::new("user_emails");
const USER_SEQ_KEY: &str = "user_seq";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: u64,
    pub email: String,
    /// Argon2id PHC string.
    pub password_hash: String,
    pub created_at: i64,
}

/// Result of a user mutation.
#[derive(Debug, PartialEq)]
pub enum UserWrite {
    Done(UserRecord),
    EmailTaken,
    NotFound,
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn encode(record: &UserRecord) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(record, bincode::config::standard())
        .context("bincode encode user")
}

fn decode(bytes: &[u8]) -> Result<UserRecord> {
    let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .context("bincode decode user")?;
    Ok(record)
}

impl Store {
    /// Insert a new user. Emails are unique case-insensitively.
    pub fn insert_user(&self, email: &str, password_hash: String) -> Result<UserWrite> {
        let email = normalize_email(email);
        let write_txn = self.db.begin_write()?;
        let record = {
            let mut emails = write_txn.open_table(USER_EMAILS)?;
            if emails.get(email.as_str())?.is_some() {
                drop(emails);
                write_txn.abort()?;
                return Ok(UserWrite::EmailTaken);
            }

            let id = Self::next_id(&write_txn, USER_SEQ_KEY)?;
            let record = UserRecord {
                id,
                email,
                password_hash,
                created_at: Self::now(),
            };
            emails.insert(record.email.as_str(), id)?;
            write_txn
                .open_table(USERS)?
                .insert(id, encode(&record)?.as_slice())?;
            record
        };
        write_txn.commit()?;

        debug!(user_id = record.id, "registered user");
        Ok(UserWrite::Done(record))
    }

    pub fn get_user(&self, id: u64) -> Result<Option<UserRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(USERS)?;
        let raw_bytes: Option<Vec<u8>> = table.get(id)?.map(|guard| guard.value().to_vec());
        raw_bytes.map(|b| decode(&b)).transpose()
    }

    pub fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        let email = normalize_email(email);
        let id = {
            let read_txn = self.db.begin_read()?;
            let emails = read_txn.open_table(USER_EMAILS)?;
            let id = emails.get(email.as_str())?.map(|g| g.value());
            id
        };
        match id {
            Some(id) => self.get_user(id),
            None => Ok(None),
        }
    }

    /// Replace the email and/or password hash of an existing user.
    pub fn update_user(
        &self,
        id: u64,
        new_email: Option<&str>,
        new_password_hash: Option<String>,
    ) -> Result<UserWrite> {
        let write_txn = self.db.begin_write()?;
        let result = {
            let mut users = write_txn.open_table(USERS)?;
            let mut emails = write_txn.open_table(USER_EMAILS)?;

            let raw_bytes: Option<Vec<u8>> = users.get(id)?.map(|guard| guard.value().to_vec());
            match raw_bytes {
                None => UserWrite::NotFound,
                Some(bytes) => {
                    let mut record = decode(&bytes)?;
                    let mut taken = false;

                    if let Some(email) = new_email.map(normalize_email) {
                        if email != record.email {
                            if emails.get(email.as_str())?.is_some() {
                                taken = true;
                            } else {
                                emails.remove(record.email.as_str())?;
                                emails.insert(email.as_str(), id)?;
                                record.email = email;
                            }
                        }
                    }

                    if taken {
                        UserWrite::EmailTaken
                    } else {
                        if let Some(hash) = new_password_hash {
                            record.password_hash = hash;
                        }
                        users.insert(id, encode(&record)?.as_slice())?;
                        UserWrite::Done(record)
                    }
                }
            }
        };

        match result {
            UserWrite::Done(_) => write_txn.commit()?,
            _ => write_txn.abort()?,
        }
        Ok(result)
    }

    /// Delete a user and every secret they own in one transaction.
    /// Returns the removed record and how many secrets went with it.
    pub fn delete_user(&self, id: u64) -> Result<Option<(UserRecord, usize)>> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut users = write_txn.open_table(USERS)?;
            let raw_bytes: Option<Vec<u8>> =
                users.remove(id)?.map(|guard| guard.value().to_vec());
            match raw_bytes {
                None => None,
                Some(bytes) => {
                    let record = decode(&bytes)?;
                    write_txn
                        .open_table(USER_EMAILS)?
                        .remove(record.email.as_str())?;
                    let secrets = Self::remove_owned(&write_txn, id)?;
                    Some((record, secrets))
                }
            }
        };

        match removed {
            Some(_) => write_txn.commit()?,
            None => write_txn.abort()?,
        }
        if let Some((record, secrets)) = &removed {
            debug!(user_id = record.id, secrets = *secrets, "deleted user");
        }
        Ok(removed)
    }

    /// Users in ascending id order.
    pub fn list_users(&self, req: PageRequest) -> Result<Page<UserRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(USERS)?;

        let mut total = 0usize;
        let mut records = Vec::new();
        for item in table.iter()? {
            let (_k, v) = item?;
            total += 1;
            if total <= req.offset() || records.len() >= req.size {
                continue;
            }
            records.push(decode(v.value())?);
        }
        Ok(Page::new(records, total, req))
    }
}
