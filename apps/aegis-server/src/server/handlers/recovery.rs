use aegis_core::Operation;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};

use crate::server::{
    audit::list_recoverable_cases,
    cases::{permanently_delete_case, remove_case_embed, restore_case},
    core::AppState,
    errors::AuthFailure,
    gate::{require_principal, require_role},
    types::{CaseView, RecoveryListResponse, RestoreResponse},
};

/// Server-scoped principals only see snapshots of their own server and
/// snapshots that never had one.
pub(crate) async fn list_recoverable(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<RecoveryListResponse>, AuthFailure> {
    let auth = require_principal(&state, &headers).await?;
    require_role(&auth.principal, Operation::ViewRecovery)?;
    let scope = auth.principal.server_id();
    let cases = list_recoverable_cases(&state)
        .await?
        .into_iter()
        .filter(|case| match (scope, case.server_id.as_deref()) {
            (Some(scope), Some(server_id)) => scope == server_id,
            _ => true,
        })
        .collect();
    Ok(Json(RecoveryListResponse { cases }))
}

pub(crate) async fn restore(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(case_id): Path<String>,
) -> Result<Json<RestoreResponse>, AuthFailure> {
    let auth = require_principal(&state, &headers).await?;
    let outcome = restore_case(&state, &auth.principal, &case_id).await?;
    Ok(Json(RestoreResponse {
        case: CaseView::from(outcome.case),
        restored: outcome.restored,
    }))
}

pub(crate) async fn remove_embed(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(case_id): Path<String>,
) -> Result<StatusCode, AuthFailure> {
    let auth = require_principal(&state, &headers).await?;
    remove_case_embed(&state, &auth.principal, &case_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn purge(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(case_id): Path<String>,
) -> Result<StatusCode, AuthFailure> {
    let auth = require_principal(&state, &headers).await?;
    permanently_delete_case(&state, &auth.principal, &case_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
