//! User registration and self-service account management.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::auth::hash_password;
use crate::error::{Result, VanishError};
use crate::store::{Page, PageRequest, Store, UserRecord, UserWrite};

pub const MIN_PASSWORD_LEN: usize = 6;

/// Public projection of a user. Never carries the password hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub email: String,
    pub created_at: i64,
}

impl From<UserRecord> for User {
    fn from(r: UserRecord) -> Self {
        Self {
            id: r.id,
            email: r.email,
            created_at: r.created_at,
        }
    }
}

/// Accepts `local@domain.tld`: one `@`, non-empty local part, a dot inside the domain.
pub fn validate_email(email: &str) -> Result<()> {
    let email = email.trim();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && !email.chars().any(char::is_whitespace)
                && domain
                    .rsplit_once('.')
                    .is_some_and(|(host, tld)| !host.is_empty() && !tld.is_empty())
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(VanishError::Validation("invalid email address".into()))
    }
}

pub fn validate_password(password: &str) -> Result<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(VanishError::Validation(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

pub fn register(store: &Store, email: &str, password: &str) -> Result<User> {
    validate_email(email)?;
    validate_password(password)?;
    let hash = hash_password(password)?;
    match store.insert_user(email, hash)? {
        UserWrite::Done(record) => {
            info!(user_id = record.id, "user registered");
            Ok(record.into())
        }
        UserWrite::EmailTaken => Err(VanishError::Conflict("email already registered".into())),
        UserWrite::NotFound => Err(VanishError::NotFound),
    }
}

pub fn get(store: &Store, user_id: u64) -> Result<User> {
    store
        .get_user(user_id)?
        .map(User::from)
        .ok_or(VanishError::NotFound)
}

pub fn find_by_email(store: &Store, email: &str) -> Result<Option<User>> {
    Ok(store.find_user_by_email(email)?.map(User::from))
}

/// Only the user themself may update their account; anyone else sees `NotFound`.
pub fn update(
    store: &Store,
    user_id: u64,
    requester_id: u64,
    email: Option<&str>,
    password: Option<&str>,
) -> Result<User> {
    if user_id != requester_id {
        return Err(VanishError::NotFound);
    }
    if let Some(email) = email {
        validate_email(email)?;
    }
    let hash = match password {
        Some(p) => {
            validate_password(p)?;
            Some(hash_password(p)?)
        }
        None => None,
    };

    match store.update_user(user_id, email, hash)? {
        UserWrite::Done(record) => Ok(record.into()),
        UserWrite::EmailTaken => Err(VanishError::Conflict("email already registered".into())),
        UserWrite::NotFound => Err(VanishError::NotFound),
    }
}

/// Same ownership rule as [`update`]. The user's secrets go with them.
pub fn delete(store: &Store, user_id: u64, requester_id: u64) -> Result<User> {
    if user_id != requester_id {
        return Err(VanishError::NotFound);
    }
    let (record, secrets) = store.delete_user(user_id)?.ok_or(VanishError::NotFound)?;
    info!(user_id, secrets, "user deleted");
    Ok(record.into())
}

pub fn list(store: &Store, req: PageRequest) -> Result<Page<User>> {
    Ok(store.list_users(req)?.map(User::from))
}
