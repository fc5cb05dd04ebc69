use aegis_core::{InviteCode, LogAction, Operation};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde_json::json;

use crate::server::{
    audit::{append_log, LogEntry},
    auth::random_token,
    core::AppState,
    errors::AuthFailure,
    gate::{require_account_admin, require_principal},
    identity::{
        create_invite_code, list_invite_codes, list_users, set_user_role, set_user_suspended,
    },
    session::revoke_user_sessions,
    types::{
        CreateInviteRequest, InviteCodeView, InviteListResponse, SetRoleRequest, UserListResponse,
        UserView,
    },
};

const GENERATED_INVITE_CODE_CHARS: usize = 16;

pub(crate) async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<UserListResponse>, AuthFailure> {
    let auth = require_principal(&state, &headers).await?;
    require_account_admin(&auth.principal, Operation::ListUsers)?;
    let users = list_users(&state).await?;
    Ok(Json(UserListResponse {
        users: users.into_iter().map(UserView::from).collect(),
    }))
}

/// Takes effect at the user's next login.
pub(crate) async fn change_role(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    Json(payload): Json<SetRoleRequest>,
) -> Result<Json<UserView>, AuthFailure> {
    let auth = require_principal(&state, &headers).await?;
    require_account_admin(&auth.principal, Operation::ManageUsers)?;

    let (user, previous) = set_user_role(&state, &user_id, payload.role).await?;
    append_log(
        &state,
        LogEntry::new(LogAction::UserRoleChange, auth.principal.id())
            .target(&user.id)
            .details(json!({ "from": previous.as_str(), "to": user.role.as_str() })),
    )
    .await?;
    tracing::info!(
        event = "user.role_change",
        outcome = "updated",
        user_id = %user.id,
        role = %user.role
    );
    Ok(Json(UserView::from(user)))
}

pub(crate) async fn suspend(
    state: State<AppState>,
    headers: HeaderMap,
    user_id: Path<String>,
) -> Result<Json<UserView>, AuthFailure> {
    set_suspension(state, headers, user_id, true).await
}

pub(crate) async fn unsuspend(
    state: State<AppState>,
    headers: HeaderMap,
    user_id: Path<String>,
) -> Result<Json<UserView>, AuthFailure> {
    set_suspension(state, headers, user_id, false).await
}

/// Suspension also revokes every open session of the user, and their last
/// known address starts failing the IP gate on the next request.
async fn set_suspension(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    is_suspended: bool,
) -> Result<Json<UserView>, AuthFailure> {
    let auth = require_principal(&state, &headers).await?;
    require_account_admin(&auth.principal, Operation::ManageUsers)?;
    if is_suspended && auth.principal.id() == user_id {
        return Err(AuthFailure::InvalidRequest);
    }

    let user = set_user_suspended(&state, &user_id, is_suspended).await?;
    let revoked = if is_suspended {
        revoke_user_sessions(&state, &user.id).await?
    } else {
        0
    };
    let action = if is_suspended {
        LogAction::UserSuspend
    } else {
        LogAction::UserUnsuspend
    };
    append_log(
        &state,
        LogEntry::new(action, auth.principal.id())
            .target(&user.id)
            .details(json!({ "revokedSessions": revoked })),
    )
    .await?;
    tracing::info!(
        event = "user.suspension",
        outcome = action.as_str(),
        user_id = %user.id,
        revoked_sessions = revoked
    );
    Ok(Json(UserView::from(user)))
}

pub(crate) async fn create_invite(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateInviteRequest>,
) -> Result<(StatusCode, Json<InviteCodeView>), AuthFailure> {
    let auth = require_principal(&state, &headers).await?;
    require_account_admin(&auth.principal, Operation::ManageInviteCodes)?;

    let raw = payload.code.unwrap_or_else(|| {
        random_token()
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .take(GENERATED_INVITE_CODE_CHARS)
            .collect()
    });
    let code = InviteCode::try_from(raw).map_err(|_| AuthFailure::InvalidRequest)?;
    let invite = create_invite_code(&state, code.as_str()).await?;
    append_log(
        &state,
        LogEntry::new(LogAction::InviteCreate, auth.principal.id()).target(code.as_str()),
    )
    .await?;
    tracing::info!(event = "invite.create", outcome = "created");
    Ok((StatusCode::CREATED, Json(InviteCodeView::from(invite))))
}

pub(crate) async fn list_invites(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<InviteListResponse>, AuthFailure> {
    let auth = require_principal(&state, &headers).await?;
    require_account_admin(&auth.principal, Operation::ManageInviteCodes)?;
    let invites = list_invite_codes(&state).await?;
    Ok(Json(InviteListResponse {
        invite_codes: invites.into_iter().map(InviteCodeView::from).collect(),
    }))
}
