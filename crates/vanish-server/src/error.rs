//! Service error taxonomy and its HTTP mapping.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VanishError {
    /// Lookup or ownership miss. Deliberately says nothing about which.
    #[error("not found")]
    NotFound,

    /// Uniqueness violation (lookup token, email).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A matched record failed to decrypt: corruption or a key mismatch.
    #[error("integrity check failed")]
    Integrity,

    /// Missing, invalid or expired credentials.
    #[error("{0}")]
    Auth(String),

    /// Malformed request input.
    #[error("{0}")]
    Validation(String),

    /// The requester left before the write committed; it was rolled back.
    #[error("request cancelled")]
    Cancelled,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T, E = VanishError> = std::result::Result<T, E>;

impl VanishError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Cancelled => StatusCode::REQUEST_TIMEOUT,
            Self::Integrity | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for VanishError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Self::Integrity => {
                tracing::error!("secret failed integrity check on retrieval");
                "internal server error".to_owned()
            }
            Self::Internal(e) => {
                tracing::error!(error = %e, "internal error");
                "internal server error".to_owned()
            }
            other => other.to_string(),
        };

        let mut response = (status, Json(json!({ "error": message }))).into_response();
        if matches!(self, Self::Auth(_)) {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                header::HeaderValue::from_static("Bearer"),
            );
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses() {
        assert_eq!(VanishError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            VanishError::Conflict("email".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            VanishError::Integrity.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn auth_response_carries_challenge() {
        let resp = VanishError::Auth("bad token".into()).into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(resp.headers()[header::WWW_AUTHENTICATE], "Bearer");
    }

    #[tokio::test]
    async fn internal_details_are_not_leaked() {
        let err = VanishError::from(anyhow::anyhow!("redb exploded at /var/lib/x"));
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("internal server error"));
        assert!(!body.contains("redb"));
    }
}
