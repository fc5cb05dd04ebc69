use axum::{
    extract::{Extension, Query, State},
    http::HeaderMap,
    Json,
};

use crate::server::{
    auth::{enforce_auth_route_rate_limit, issue_access_token, ClientIp},
    core::AppState,
    discord_oauth::{begin_login, complete_login},
    errors::AuthFailure,
    gate::require_session,
    session::select_server,
    types::{
        AuthResponse, DiscordAuthorizeResponse, DiscordCallbackQuery, DiscordSessionResponse,
        PrincipalView, SelectServerRequest, ServersResponse,
    },
};

pub(crate) async fn discord_login(
    State(state): State<AppState>,
    Extension(client_ip): Extension<ClientIp>,
) -> Result<Json<DiscordAuthorizeResponse>, AuthFailure> {
    enforce_auth_route_rate_limit(&state, client_ip, "discord_login").await?;
    let redirect = begin_login(&state).await?;
    Ok(Json(DiscordAuthorizeResponse {
        url: redirect.url,
        state: redirect.state,
    }))
}

pub(crate) async fn discord_callback(
    State(state): State<AppState>,
    Extension(client_ip): Extension<ClientIp>,
    Query(query): Query<DiscordCallbackQuery>,
) -> Result<Json<DiscordSessionResponse>, AuthFailure> {
    enforce_auth_route_rate_limit(&state, client_ip, "discord_callback").await?;
    let login = complete_login(&state, &query.code, &query.state).await?;
    let access_token = issue_access_token(
        &state,
        &login.session_id,
        &login.context.discord_user_id,
        None,
    )
    .map_err(|_| AuthFailure::Internal)?;
    Ok(Json(DiscordSessionResponse {
        access_token,
        expires_in_secs: state.runtime.session_ttl_secs,
        discord_user_id: login.context.discord_user_id,
        username: login.context.username,
        guilds: login.context.guilds,
    }))
}

pub(crate) async fn list_servers(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ServersResponse>, AuthFailure> {
    let (_, session) = require_session(&state, &headers).await?;
    let context = session.discord.ok_or(AuthFailure::Forbidden)?;
    Ok(Json(ServersResponse {
        servers: context.guilds,
    }))
}

/// Only servers returned by the OAuth guild listing can be selected.
pub(crate) async fn select_session_server(
    State(state): State<AppState>,
    Extension(client_ip): Extension<ClientIp>,
    headers: HeaderMap,
    Json(payload): Json<SelectServerRequest>,
) -> Result<Json<AuthResponse>, AuthFailure> {
    let (claims, session) = require_session(&state, &headers).await?;
    let context = session.discord.ok_or(AuthFailure::Forbidden)?;
    let Some(guild) = context
        .guilds
        .iter()
        .find(|guild| guild.id == payload.server_id)
    else {
        tracing::warn!(
            event = "session.select_server",
            outcome = "guild_not_listed",
            server_id = %payload.server_id
        );
        return Err(AuthFailure::Forbidden);
    };

    let principal = select_server(
        &state,
        &claims.session_id,
        &context.discord_user_id,
        &guild.id,
        Some(&guild.name),
        &client_ip.normalized(),
    )
    .await?;
    let access_token = issue_access_token(
        &state,
        &claims.session_id,
        &principal.id(),
        Some(&principal),
    )
    .map_err(|_| AuthFailure::Internal)?;
    Ok(Json(AuthResponse {
        access_token,
        expires_in_secs: state.runtime.session_ttl_secs,
        principal: PrincipalView::from(&principal),
    }))
}
