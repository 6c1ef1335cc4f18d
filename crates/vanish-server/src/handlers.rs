use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    accounts::{self, User},
    auth::{self, AuthUser, TokenPair},
    error::{Result, VanishError},
    store::{Caller, Lifetime, Page, PageRequest, SecretMeta},
    vault, AppState,
};

/// Upper bound on secret content, in bytes.
pub const MAX_CONTENT_BYTES: usize = 1024 * 1024;

/// Run store work (redb transactions, Argon2) off the async executor.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| VanishError::Internal(anyhow::anyhow!("blocking task failed: {e}")))?
}

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Pagination ────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<usize>,
    pub size: Option<usize>,
}

impl PageQuery {
    fn into_request(self) -> Result<PageRequest> {
        if self.page == Some(0) || self.size == Some(0) {
            return Err(VanishError::Validation(
                "page and size must be at least 1".into(),
            ));
        }
        Ok(PageRequest::new(self.page, self.size))
    }
}

// ── Users & auth ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<Credentials>,
) -> Result<(StatusCode, Json<User>)> {
    let user =
        blocking(move || accounts::register(&state.store, &body.email, &body.password)).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<Credentials>,
) -> Result<Json<TokenPair>> {
    let pair = blocking(move || {
        auth::login(&state.store, &state.tokens, &body.email, &body.password)
    })
    .await?;
    Ok(Json(pair))
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

pub async fn refresh(
    State(state): State<AppState>,
    Json(body): Json<RefreshRequest>,
) -> Result<Json<TokenPair>> {
    let pair =
        blocking(move || auth::refresh(&state.store, &state.tokens, &body.refresh_token)).await?;
    Ok(Json(pair))
}

#[derive(Debug, Default, Deserialize)]
pub struct UserListQuery {
    pub page: Option<usize>,
    pub size: Option<usize>,
    /// Exact (case-insensitive) email lookup instead of a full listing.
    pub email: Option<String>,
}

pub async fn list_users(
    State(state): State<AppState>,
    Query(query): Query<UserListQuery>,
) -> Result<Json<Page<User>>> {
    let req = PageQuery {
        page: query.page,
        size: query.size,
    }
    .into_request()?;
    let page = blocking(move || match query.email {
        Some(email) => {
            let found: Vec<User> = accounts::find_by_email(&state.store, &email)?
                .into_iter()
                .collect();
            let total = found.len();
            let items = if req.page == 1 { found } else { Vec::new() };
            Ok(Page::new(items, total, req))
        }
        None => accounts::list(&state.store, req),
    })
    .await?;
    Ok(Json(page))
}

pub async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<User>> {
    let user = blocking(move || accounts::get(&state.store, id)).await?;
    Ok(Json(user))
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    pub email: Option<String>,
    pub password: Option<String>,
}

pub async fn update_user(
    State(state): State<AppState>,
    Extension(requester): Extension<AuthUser>,
    Path(id): Path<u64>,
    Json(body): Json<UpdateUserRequest>,
) -> Result<Json<User>> {
    let user = blocking(move || {
        accounts::update(
            &state.store,
            id,
            requester.id,
            body.email.as_deref(),
            body.password.as_deref(),
        )
    })
    .await?;
    Ok(Json(user))
}

pub async fn delete_user(
    State(state): State<AppState>,
    Extension(requester): Extension<AuthUser>,
    Path(id): Path<u64>,
) -> Result<Json<User>> {
    let user = blocking(move || accounts::delete(&state.store, id, requester.id)).await?;
    Ok(Json(user))
}

// ── Secrets ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateSecretRequest {
    pub content: String,
    pub lifetime: String,
    #[serde(default)]
    pub passphrase: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSecretResponse {
    pub id: u64,
    /// Hex-encoded lookup token.
    pub passphrase: String,
}

pub async fn create_secret(
    State(state): State<AppState>,
    Extension(requester): Extension<AuthUser>,
    Json(body): Json<CreateSecretRequest>,
) -> Result<(StatusCode, Json<CreateSecretResponse>)> {
    if body.content.is_empty() {
        return Err(VanishError::Validation("content must not be empty".into()));
    }
    if body.content.len() > MAX_CONTENT_BYTES {
        return Err(VanishError::Validation(format!(
            "content exceeds {MAX_CONTENT_BYTES} bytes"
        )));
    }
    if body.passphrase.as_deref() == Some("") {
        return Err(VanishError::Validation("passphrase must not be empty".into()));
    }
    let lifetime: Lifetime = body.lifetime.parse().map_err(VanishError::Validation)?;

    // Dropped with this future if the client goes away; the store then rolls back.
    let (caller, _waiting) = Caller::attached();
    let created = blocking(move || {
        vault::create_secret(
            &state.store,
            requester.id,
            &body.content,
            lifetime,
            body.passphrase.as_deref(),
            caller,
        )
    })
    .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateSecretResponse {
            id: created.id,
            passphrase: vault::format_token(&created.token),
        }),
    ))
}

pub async fn list_secrets(
    State(state): State<AppState>,
    Extension(requester): Extension<AuthUser>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Page<SecretMeta>>> {
    let req = query.into_request()?;
    let page = blocking(move || vault::list_secrets(&state.store, requester.id, req)).await?;
    Ok(Json(page))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SecretContent {
    pub content: String,
}

pub async fn get_secret(
    State(state): State<AppState>,
    Extension(requester): Extension<AuthUser>,
    Path(token): Path<String>,
) -> Result<Json<SecretContent>> {
    let token = vault::parse_token(&token)?;
    let (caller, _waiting) = Caller::attached();
    let content = blocking(move || {
        vault::retrieve_secret(&state.store, &token, requester.id, caller)
    })
    .await?;
    Ok(Json(SecretContent { content }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_query_rejects_zero() {
        assert!(PageQuery { page: Some(0), size: None }.into_request().is_err());
        assert!(PageQuery { page: None, size: Some(0) }.into_request().is_err());
        let req = PageQuery { page: Some(2), size: Some(500) }
            .into_request()
            .unwrap();
        assert_eq!(req, PageRequest { page: 2, size: PageRequest::MAX_SIZE });
        assert_eq!(
            PageQuery::default().into_request().unwrap(),
            PageRequest::default()
        );
    }
}
