use aegis_core::{CasePriority, CaseStatus, CaseTitle};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};

use crate::server::{
    cases::{
        create_case, decrypt_case, delete_case, encrypt_case, get_case, list_cases,
        list_public_cases, normalize_tags, toggle_case_visibility, update_case, validate_case_text,
        validate_doc_url, CasePatch, NewCase,
    },
    core::{AppState, CaseRecord, CASE_CODE_HEADER},
    errors::AuthFailure,
    gate::{optional_principal, require_principal, require_server_membership},
    types::{
        CaseCodeResponse, CaseListResponse, CaseSummary, CaseView, CreateCaseRequest,
        ServerScopeQuery, UpdateCaseRequest,
    },
};

fn case_title(value: String) -> Result<CaseTitle, AuthFailure> {
    CaseTitle::try_from(value).map_err(|_| AuthFailure::InvalidRequest)
}

fn summaries(cases: Vec<CaseRecord>) -> Json<CaseListResponse> {
    Json(CaseListResponse {
        cases: cases.into_iter().map(CaseSummary::from).collect(),
    })
}

pub(crate) async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateCaseRequest>,
) -> Result<(StatusCode, Json<CaseView>), AuthFailure> {
    let auth = require_principal(&state, &headers).await?;
    if payload.is_public == Some(true) {
        tracing::debug!(event = "case.create", outcome = "public_flag_ignored");
    }
    let input = NewCase {
        title: case_title(payload.title)?,
        description: validate_case_text(payload.description)?,
        status: payload.status.unwrap_or(CaseStatus::Active),
        priority: payload.priority.unwrap_or(CasePriority::Medium),
        content: validate_case_text(payload.content)?,
        tags: normalize_tags(payload.tags)?,
        google_doc_url: payload
            .google_doc_url
            .map(validate_doc_url)
            .transpose()?
            .flatten(),
        server_id: payload.server_id.filter(|server_id| !server_id.is_empty()),
    };
    let case = create_case(&state, &auth.principal, input).await?;
    Ok((StatusCode::CREATED, Json(CaseView::from(case))))
}

/// Cases of the requested server, defaulting to the selected one. Local
/// principals without a server see every case.
pub(crate) async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ServerScopeQuery>,
) -> Result<Json<CaseListResponse>, AuthFailure> {
    let auth = require_principal(&state, &headers).await?;
    let scope = match query.server_id.as_deref() {
        Some(server_id) => {
            require_server_membership(&state, &auth.principal, server_id).await?;
            Some(server_id)
        }
        None => auth.principal.server_id(),
    };
    Ok(summaries(list_cases(&state, scope).await?))
}

pub(crate) async fn list_public(
    State(state): State<AppState>,
) -> Result<Json<CaseListResponse>, AuthFailure> {
    Ok(summaries(list_public_cases(&state).await?))
}

/// Unknown ids answer `null` instead of an error.
pub(crate) async fn get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(case_id): Path<String>,
) -> Result<Json<Option<CaseView>>, AuthFailure> {
    let auth = optional_principal(&state, &headers).await?;
    let presented_code = headers
        .get(CASE_CODE_HEADER)
        .and_then(|value| value.to_str().ok());
    let case = get_case(
        &state,
        auth.as_ref().map(|auth| &auth.principal),
        &case_id,
        presented_code,
    )
    .await?;
    Ok(Json(case.map(CaseView::from)))
}

pub(crate) async fn update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(case_id): Path<String>,
    Json(payload): Json<UpdateCaseRequest>,
) -> Result<Json<CaseView>, AuthFailure> {
    let auth = require_principal(&state, &headers).await?;
    let patch = CasePatch {
        title: payload.title.map(case_title).transpose()?,
        description: payload.description.map(validate_case_text).transpose()?,
        status: payload.status,
        priority: payload.priority,
        content: payload.content.map(validate_case_text).transpose()?,
        tags: payload.tags.map(normalize_tags).transpose()?,
        google_doc_url: payload.google_doc_url.map(validate_doc_url).transpose()?,
    };
    let case = update_case(
        &state,
        &auth.principal,
        &case_id,
        patch,
        payload.server_id.as_deref(),
    )
    .await?;
    Ok(Json(CaseView::from(case)))
}

pub(crate) async fn delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(case_id): Path<String>,
    Query(query): Query<ServerScopeQuery>,
) -> Result<StatusCode, AuthFailure> {
    let auth = require_principal(&state, &headers).await?;
    delete_case(
        &state,
        &auth.principal,
        &case_id,
        query.server_id.as_deref(),
    )
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn toggle_visibility(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(case_id): Path<String>,
) -> Result<Json<CaseView>, AuthFailure> {
    let auth = require_principal(&state, &headers).await?;
    let case = toggle_case_visibility(&state, &auth.principal, &case_id).await?;
    Ok(Json(CaseView::from(case)))
}

pub(crate) async fn encrypt(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(case_id): Path<String>,
) -> Result<Json<CaseCodeResponse>, AuthFailure> {
    let auth = require_principal(&state, &headers).await?;
    let case_code = encrypt_case(&state, &auth.principal, &case_id).await?;
    Ok(Json(CaseCodeResponse { case_id, case_code }))
}

pub(crate) async fn decrypt(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(case_id): Path<String>,
) -> Result<Json<CaseView>, AuthFailure> {
    let auth = require_principal(&state, &headers).await?;
    let case = decrypt_case(&state, &auth.principal, &case_id).await?;
    Ok(Json(CaseView::from(case)))
}
