use axum::{http::StatusCode, response::IntoResponse, Json};

use super::{metrics::record_auth_failure, types::AuthError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthFailure {
    InvalidRequest,
    Unauthenticated,
    Forbidden,
    IpBanned,
    CaseLocked,
    NotFound,
    Conflict,
    InvalidState,
    RateLimited,
    OAuthExchangeFailed,
    SessionPersistence,
    Internal,
}

impl std::fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl AuthFailure {
    fn status_and_code(self) -> (StatusCode, &'static str) {
        match self {
            Self::InvalidRequest => (StatusCode::BAD_REQUEST, "invalid_request"),
            Self::Unauthenticated => (StatusCode::UNAUTHORIZED, "access_denied"),
            Self::Forbidden => (StatusCode::FORBIDDEN, "access_denied"),
            Self::IpBanned => (StatusCode::FORBIDDEN, "ip_banned"),
            Self::CaseLocked => (StatusCode::FORBIDDEN, "case_locked"),
            Self::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            Self::Conflict => (StatusCode::CONFLICT, "conflict"),
            Self::InvalidState => (StatusCode::CONFLICT, "invalid_state"),
            Self::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
            Self::OAuthExchangeFailed => (StatusCode::BAD_GATEWAY, "oauth_failed"),
            Self::SessionPersistence => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "session_persistence_failed",
            ),
            Self::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl IntoResponse for AuthFailure {
    fn into_response(self) -> axum::response::Response {
        match self {
            Self::Unauthenticated => record_auth_failure("unauthenticated"),
            Self::Forbidden => record_auth_failure("forbidden"),
            Self::IpBanned => record_auth_failure("ip_banned"),
            Self::CaseLocked => record_auth_failure("case_locked"),
            Self::RateLimited => record_auth_failure("rate_limited"),
            Self::OAuthExchangeFailed => record_auth_failure("oauth_exchange"),
            Self::InvalidRequest
            | Self::NotFound
            | Self::Conflict
            | Self::InvalidState
            | Self::SessionPersistence
            | Self::Internal => {}
        }

        let (status, error) = self.status_and_code();
        (status, Json(AuthError { error })).into_response()
    }
}

impl From<sqlx::Error> for AuthFailure {
    fn from(value: sqlx::Error) -> Self {
        tracing::error!(event = "db.query", outcome = "failed", error = %value);
        Self::Internal
    }
}

pub(crate) fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db_error) if db_error.is_unique_violation())
}

pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_current_span(true)
        .with_span_list(true)
        .init();
}
