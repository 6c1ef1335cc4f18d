use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, SaltString},
    Argon2, PasswordHasher, PasswordVerifier,
};
use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, VanishError};
use crate::store::Store;
use crate::AppState;

const JWT_SECRET_FILE: &str = "jwt_secret";
const JWT_SECRET_LEN: usize = 32;

/// Hash a password into an Argon2id PHC string.
pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("argon2 hash: {e}"))?;
    Ok(hash.to_string())
}

/// False for a wrong password and for an unparseable stored hash alike.
pub fn verify_password(password: &str, phc: &str) -> bool {
    match PasswordHash::new(phc) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            warn!(error = %e, "stored password hash is malformed");
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id, decimal.
    pub sub: String,
    pub kind: TokenKind,
    /// True only for access tokens minted directly by a password login.
    pub fresh: bool,
    pub iat: i64,
    pub exp: i64,
}

impl Claims {
    pub fn user_id(&self) -> Result<u64> {
        self.sub
            .parse()
            .map_err(|_| VanishError::Auth("invalid token subject".into()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
}

/// Signs and checks HS256 tokens with one shared secret.
#[derive(Clone)]
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenIssuer {
    pub fn new(secret: &[u8], access_ttl: Duration, refresh_ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            access_ttl,
            refresh_ttl,
        }
    }

    fn issue(&self, user_id: u64, kind: TokenKind, fresh: bool) -> anyhow::Result<String> {
        let now = Store::now();
        let ttl = match kind {
            TokenKind::Access => self.access_ttl,
            TokenKind::Refresh => self.refresh_ttl,
        };
        let claims = Claims {
            sub: user_id.to_string(),
            kind,
            fresh,
            iat: now,
            exp: now + ttl.as_secs() as i64,
        };
        encode(&Header::default(), &claims, &self.encoding).context("sign jwt")
    }

    pub fn issue_pair(&self, user_id: u64, fresh: bool) -> anyhow::Result<TokenPair> {
        Ok(TokenPair {
            access_token: self.issue(user_id, TokenKind::Access, fresh)?,
            refresh_token: self.issue(user_id, TokenKind::Refresh, false)?,
            token_type: "bearer".into(),
        })
    }

    /// Check signature, expiry and kind.
    pub fn validate(&self, token: &str, expected: TokenKind) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        let claims = decode::<Claims>(token, &self.decoding, &validation)
            .map_err(|e| {
                debug!(error = %e, "jwt rejected");
                VanishError::Auth("invalid or expired token".into())
            })?
            .claims;
        if claims.kind != expected {
            return Err(VanishError::Auth("wrong token type".into()));
        }
        Ok(claims)
    }
}

/// Load the JWT signing secret from `data_dir/jwt_secret`, creating it on first use.
pub fn load_or_generate_jwt_secret(data_dir: &Path) -> anyhow::Result<Vec<u8>> {
    let path = data_dir.join(JWT_SECRET_FILE);
    if path.exists() {
        let secret = std::fs::read(&path).context("read jwt_secret")?;
        if secret.len() == JWT_SECRET_LEN {
            return Ok(secret);
        }
        warn!(len = secret.len(), "jwt_secret has wrong size, regenerating");
    }

    let mut secret = vec![0u8; JWT_SECRET_LEN];
    OsRng.fill_bytes(&mut secret);
    std::fs::write(&path, &secret).context("write jwt_secret")?;
    info!(path = %path.display(), "generated jwt signing secret");
    Ok(secret)
}

/// Exchange credentials for a fresh token pair.
pub fn login(store: &Store, tokens: &TokenIssuer, email: &str, password: &str) -> Result<TokenPair> {
    let user = store.find_user_by_email(email)?;
    match user {
        Some(user) if verify_password(password, &user.password_hash) => {
            info!(user_id = user.id, "login");
            Ok(tokens.issue_pair(user.id, true)?)
        }
        _ => Err(VanishError::Auth("incorrect email or password".into())),
    }
}

pub fn refresh(store: &Store, tokens: &TokenIssuer, refresh_token: &str) -> Result<TokenPair> {
    let claims = tokens.validate(refresh_token, TokenKind::Refresh)?;
    let user_id = claims.user_id()?;
    if store.get_user(user_id)?.is_none() {
        return Err(VanishError::Auth("user no longer exists".into()));
    }
    Ok(tokens.issue_pair(user_id, false)?)
}

/// Resolve an `Authorization` header value to the requesting user's id.
pub fn authenticate(store: &Store, tokens: &TokenIssuer, header: Option<&str>) -> Result<u64> {
    let bearer = header
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| VanishError::Auth("missing bearer token".into()))?;
    let user_id = tokens.validate(bearer.trim(), TokenKind::Access)?.user_id()?;
    if store.get_user(user_id)?.is_none() {
        return Err(VanishError::Auth("user no longer exists".into()));
    }
    Ok(user_id)
}

/// The authenticated requester, inserted by [`require_auth`].
#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub id: u64,
}

/// Axum middleware that validates `Authorization: Bearer <jwt>`.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match authenticate(&state.store, &state.tokens, header) {
        Ok(id) => {
            request.extensions_mut().insert(AuthUser { id });
            next.run(request).await
        }
        Err(e) => e.into_response(),
    }
}
