use aegis_core::{InviteCode, LocalPrincipal, LogAction, Principal, Username};
use axum::{
    extract::{Extension, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use crate::server::{
    audit::{append_log, publish_appended, LogEntry},
    auth::{
        enforce_auth_route_rate_limit, hash_password, issue_access_token, validate_password,
        verify_password, ClientIp,
    },
    core::AppState,
    errors::AuthFailure,
    gate::{require_principal, require_session},
    identity::{find_user_by_username, mark_user_login, mark_user_offline, register_local_user},
    session::{create_session, resolve_ip_status, revoke_session},
    types::{
        AuthResponse, CheckIpResponse, LoginRequest, MeResponse, PrincipalView, RegisterRequest,
        UserView,
    },
};

pub(crate) async fn check_ip(
    State(state): State<AppState>,
    Extension(client_ip): Extension<ClientIp>,
) -> Result<Json<CheckIpResponse>, AuthFailure> {
    enforce_auth_route_rate_limit(&state, client_ip, "check_ip").await?;
    let banned = match client_ip.recorded() {
        Some(ip) => resolve_ip_status(&state, &ip).await?,
        None => false,
    };
    Ok(Json(CheckIpResponse {
        ip: client_ip.normalized(),
        banned,
    }))
}

pub(crate) async fn register(
    State(state): State<AppState>,
    Extension(client_ip): Extension<ClientIp>,
    Json(payload): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<UserView>), AuthFailure> {
    enforce_auth_route_rate_limit(&state, client_ip, "register").await?;

    let username = Username::try_from(payload.username).map_err(|_| AuthFailure::InvalidRequest)?;
    validate_password(&payload.password)?;
    let invite_code =
        InviteCode::try_from(payload.invite_code).map_err(|_| AuthFailure::InvalidRequest)?;
    let password_hash = hash_password(&payload.password).map_err(|_| AuthFailure::Internal)?;

    let (user, log) = register_local_user(
        &state,
        username.as_str(),
        password_hash,
        invite_code.as_str(),
        client_ip.recorded(),
    )
    .await
    .inspect_err(|error| {
        tracing::warn!(event = "auth.register", outcome = "rejected", reason = %error);
    })?;
    publish_appended(&state, std::slice::from_ref(&log));

    tracing::info!(event = "auth.register", outcome = "created", user_id = %user.id);
    Ok((StatusCode::CREATED, Json(UserView::from(user))))
}

pub(crate) async fn login(
    State(state): State<AppState>,
    Extension(client_ip): Extension<ClientIp>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, AuthFailure> {
    enforce_auth_route_rate_limit(&state, client_ip, "login").await?;

    let username =
        Username::try_from(payload.username).map_err(|_| AuthFailure::Unauthenticated)?;
    validate_password(&payload.password).map_err(|_| AuthFailure::Unauthenticated)?;

    let user = find_user_by_username(&state, username.as_str()).await?;
    let verified = match &user {
        Some(user) => verify_password(&user.password_hash, &payload.password),
        None => {
            let _ = verify_password(&state.dummy_password_hash, &payload.password);
            false
        }
    };
    let user = match user {
        Some(user) if verified => user,
        _ => {
            tracing::warn!(event = "auth.login", outcome = "invalid_credentials");
            return Err(AuthFailure::Unauthenticated);
        }
    };
    if user.is_suspended {
        tracing::warn!(event = "auth.login", outcome = "suspended", user_id = %user.id);
        return Err(AuthFailure::Forbidden);
    }

    mark_user_login(&state, &user.id, client_ip.recorded()).await?;
    let principal = Principal::Local(LocalPrincipal {
        user_id: user.id.clone(),
        username: user.username.clone(),
        role: user.role,
        ip: client_ip.normalized(),
    });
    let session_id =
        create_session(&state, Some(principal.clone()), None, Some(user.id.clone())).await?;
    let access_token = issue_access_token(&state, &session_id, &principal.id(), Some(&principal))
        .map_err(|_| AuthFailure::Internal)?;
    append_log(
        &state,
        LogEntry::new(LogAction::UserLogin, principal.id()).target(&user.id),
    )
    .await?;

    tracing::info!(event = "auth.login", outcome = "success", user_id = %user.id);
    Ok(Json(AuthResponse {
        access_token,
        expires_in_secs: state.runtime.session_ttl_secs,
        principal: PrincipalView::from(&principal),
    }))
}

/// Accepts both full sessions and Discord sessions still waiting for a
/// server selection.
pub(crate) async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode, AuthFailure> {
    let (claims, session) = require_session(&state, &headers).await?;
    revoke_session(&state, &claims.session_id).await?;
    if let Some(user_id) = session.local_user_id.as_deref() {
        mark_user_offline(&state, user_id).await?;
    }

    let principal = session.principal.as_ref();
    let actor = principal.map_or_else(|| claims.subject.clone(), Principal::id);
    append_log(
        &state,
        LogEntry::new(LogAction::UserLogout, actor)
            .server(principal.and_then(Principal::server_id)),
    )
    .await?;
    tracing::info!(event = "auth.logout", outcome = "revoked");
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn me(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<MeResponse>, AuthFailure> {
    let auth = require_principal(&state, &headers).await?;
    Ok(Json(MeResponse {
        principal: PrincipalView::from(&auth.principal),
    }))
}
