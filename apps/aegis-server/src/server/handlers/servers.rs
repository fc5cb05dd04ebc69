use aegis_core::{DiscordId, LogAction, Operation};
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde_json::json;

use crate::server::{
    audit::{append_log, LogEntry},
    core::{AppState, ServerSecurityConfig},
    errors::AuthFailure,
    gate::{
        dashboard_admission, require_owning_server_match, require_principal, require_role,
        require_server_membership, DashboardAdmission,
    },
    identity::set_member_admin,
    server_config::{load_server_config, store_server_config},
    types::{MemberView, SetMemberAdminRequest},
};

pub(crate) async fn server_dashboard(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(server_id): Path<String>,
) -> Result<Json<DashboardAdmission>, AuthFailure> {
    let auth = require_principal(&state, &headers).await?;
    require_server_membership(&state, &auth.principal, &server_id).await?;
    let admission = dashboard_admission(&state, &auth.principal, &server_id).await?;
    Ok(Json(admission))
}

pub(crate) async fn get_server_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(server_id): Path<String>,
) -> Result<Json<ServerSecurityConfig>, AuthFailure> {
    let auth = require_principal(&state, &headers).await?;
    require_server_membership(&state, &auth.principal, &server_id).await?;
    Ok(Json(load_server_config(&state, &server_id).await?))
}

pub(crate) async fn put_server_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(server_id): Path<String>,
    Json(payload): Json<ServerSecurityConfig>,
) -> Result<Json<ServerSecurityConfig>, AuthFailure> {
    let auth = require_principal(&state, &headers).await?;
    let stored = store_server_config(&state, &auth.principal, &server_id, payload).await?;
    Ok(Json(stored))
}

/// The new flag applies to the member's next server selection; sessions
/// already holding a role keep it.
pub(crate) async fn update_member_admin(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((server_id, discord_user_id)): Path<(String, String)>,
    Json(payload): Json<SetMemberAdminRequest>,
) -> Result<Json<MemberView>, AuthFailure> {
    let auth = require_principal(&state, &headers).await?;
    require_role(&auth.principal, Operation::ManageMembers)?;
    require_server_membership(&state, &auth.principal, &server_id).await?;
    require_owning_server_match(&server_id, auth.principal.server_id())?;
    let discord_user_id =
        DiscordId::try_from(discord_user_id).map_err(|_| AuthFailure::InvalidRequest)?;

    let member =
        set_member_admin(&state, &server_id, discord_user_id.as_str(), payload.is_admin).await?;
    append_log(
        &state,
        LogEntry::new(LogAction::MemberAdminSet, auth.principal.id())
            .target(discord_user_id.as_str())
            .server(Some(server_id.as_str()))
            .details(json!({ "isAdmin": payload.is_admin })),
    )
    .await?;
    tracing::info!(
        event = "member.admin_set",
        outcome = "updated",
        server_id = %server_id,
        is_admin = payload.is_admin
    );
    Ok(Json(MemberView::from(member)))
}
