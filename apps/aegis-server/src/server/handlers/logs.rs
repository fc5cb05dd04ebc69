use aegis_core::Operation;
use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};

use crate::server::{
    audit::list_logs,
    core::{AppState, DEFAULT_LOG_LIST_LIMIT, MAX_LOG_LIST_LIMIT},
    errors::AuthFailure,
    gate::{require_principal, require_role},
    types::{LogListResponse, LogQuery, LogView},
};

const MAX_ACTION_FILTER_CHARS: usize = 64;

/// Discord principals read the entries of their selected server only.
pub(crate) async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<LogQuery>,
) -> Result<Json<LogListResponse>, AuthFailure> {
    let auth = require_principal(&state, &headers).await?;
    require_role(&auth.principal, Operation::ViewLogs)?;

    let limit = query
        .limit
        .unwrap_or(DEFAULT_LOG_LIST_LIMIT)
        .clamp(1, MAX_LOG_LIST_LIMIT);
    let action = query
        .action
        .as_deref()
        .map(str::trim)
        .filter(|action| !action.is_empty());
    if action.is_some_and(|action| {
        action.len() > MAX_ACTION_FILTER_CHARS
            || !action
                .bytes()
                .all(|b| b.is_ascii_uppercase() || b == b'_')
    }) {
        return Err(AuthFailure::InvalidRequest);
    }

    let logs = list_logs(&state, limit, action, auth.principal.server_id())
        .await?
        .iter()
        .map(LogView::from)
        .collect();
    Ok(Json(LogListResponse { logs }))
}
