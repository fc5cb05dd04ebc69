use aegis_core::{DiscordId, LogAction};
use reqwest::{header::AUTHORIZATION, Url};
use serde::Deserialize;
use serde_json::json;

use super::{
    audit::{append_log, LogEntry},
    auth::{now_unix, random_token},
    collaborators::permission_bits_grant_admin,
    core::{
        AppState, DiscordAccountRecord, DiscordOAuthConfig, DiscordSessionContext, GuildSummary,
        OAUTH_STATE_TTL_SECS,
    },
    errors::AuthFailure,
    identity::{refresh_member_snapshot, upsert_discord_account},
    session::create_session,
};

const OAUTH_SCOPES: &str = "identify guilds";
const MAX_OAUTH_CODE_CHARS: usize = 512;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct DiscordUser {
    id: String,
    username: String,
    #[serde(default)]
    global_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DiscordGuild {
    id: String,
    name: String,
    #[serde(default)]
    owner: bool,
    #[serde(default)]
    permissions: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct AuthorizeRedirect {
    pub(crate) url: String,
    pub(crate) state: String,
}

#[derive(Debug, Clone)]
pub(crate) struct DiscordLogin {
    pub(crate) session_id: String,
    pub(crate) context: DiscordSessionContext,
}

fn oauth_config(state: &AppState) -> Result<&DiscordOAuthConfig, AuthFailure> {
    state.runtime.discord.as_ref().ok_or(AuthFailure::NotFound)
}

fn upstream_failure(stage: &'static str) -> impl Fn(reqwest::Error) -> AuthFailure {
    move |error| {
        tracing::warn!(event = "discord.oauth", outcome = "upstream_failed", stage, error = %error);
        AuthFailure::OAuthExchangeFailed
    }
}

/// Builds the Discord authorize URL and remembers its single-use state.
pub(crate) async fn begin_login(state: &AppState) -> Result<AuthorizeRedirect, AuthFailure> {
    let config = oauth_config(state)?;
    let oauth_state = random_token();
    let url = Url::parse_with_params(
        &config.authorize_url,
        &[
            ("client_id", config.client_id.as_str()),
            ("redirect_uri", config.redirect_uri.as_str()),
            ("response_type", "code"),
            ("scope", OAUTH_SCOPES),
            ("state", oauth_state.as_str()),
            ("prompt", "none"),
        ],
    )
    .map_err(|_| AuthFailure::Internal)?;

    let now = now_unix();
    let mut states = state.oauth_states.write().await;
    states.retain(|_, expires_at| *expires_at > now);
    states.insert(oauth_state.clone(), now + OAUTH_STATE_TTL_SECS);
    Ok(AuthorizeRedirect {
        url: url.into(),
        state: oauth_state,
    })
}

async fn consume_state(state: &AppState, oauth_state: &str) -> Result<(), AuthFailure> {
    let expires_at = state.oauth_states.write().await.remove(oauth_state);
    match expires_at {
        Some(expires_at) if expires_at > now_unix() => Ok(()),
        _ => {
            tracing::warn!(event = "discord.oauth", outcome = "state_rejected");
            Err(AuthFailure::InvalidRequest)
        }
    }
}

async fn exchange_code(
    state: &AppState,
    config: &DiscordOAuthConfig,
    code: &str,
) -> Result<TokenResponse, AuthFailure> {
    state
        .http_client
        .post(format!("{}/oauth2/token", config.api_base_url))
        .form(&[
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.as_str()),
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", config.redirect_uri.as_str()),
        ])
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(upstream_failure("token"))?
        .json()
        .await
        .map_err(upstream_failure("token_decode"))
}

async fn fetch_with_token<T: serde::de::DeserializeOwned>(
    state: &AppState,
    config: &DiscordOAuthConfig,
    path: &str,
    access_token: &str,
    stage: &'static str,
) -> Result<T, AuthFailure> {
    state
        .http_client
        .get(format!("{}{path}", config.api_base_url))
        .header(AUTHORIZATION, format!("Bearer {access_token}"))
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(upstream_failure(stage))?
        .json()
        .await
        .map_err(upstream_failure(stage))
}

/// Completes the authorization-code flow and opens a session with no
/// principal yet; a server must be selected before any case operation.
pub(crate) async fn complete_login(
    state: &AppState,
    code: &str,
    oauth_state: &str,
) -> Result<DiscordLogin, AuthFailure> {
    let config = oauth_config(state)?;
    if code.is_empty() || code.len() > MAX_OAUTH_CODE_CHARS {
        return Err(AuthFailure::InvalidRequest);
    }
    consume_state(state, oauth_state).await?;

    let tokens = exchange_code(state, config, code).await?;
    let user: DiscordUser =
        fetch_with_token(state, config, "/users/@me", &tokens.access_token, "user").await?;
    let discord_id = DiscordId::try_from(user.id).map_err(|_| AuthFailure::OAuthExchangeFailed)?;
    let guilds: Vec<DiscordGuild> = fetch_with_token(
        state,
        config,
        "/users/@me/guilds",
        &tokens.access_token,
        "guilds",
    )
    .await?;

    let username = user.global_name.unwrap_or(user.username);
    upsert_discord_account(
        state,
        DiscordAccountRecord {
            discord_id: discord_id.as_str().to_owned(),
            username: username.clone(),
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at_unix: now_unix().saturating_add(tokens.expires_in),
        },
    )
    .await?;

    let mut summaries = Vec::with_capacity(guilds.len());
    for guild in guilds {
        if DiscordId::try_from(guild.id.clone()).is_err() {
            continue;
        }
        let is_admin = guild
            .permissions
            .as_deref()
            .is_some_and(permission_bits_grant_admin);
        refresh_member_snapshot(state, &guild.id, discord_id.as_str(), guild.owner, is_admin)
            .await?;
        summaries.push(GuildSummary {
            id: guild.id,
            name: guild.name,
            is_owner: guild.owner,
            is_admin,
        });
    }

    let context = DiscordSessionContext {
        discord_user_id: discord_id.as_str().to_owned(),
        username,
        guilds: summaries,
    };
    let session_id = create_session(state, None, Some(context.clone()), None).await?;
    append_log(
        state,
        LogEntry::new(LogAction::DiscordLogin, discord_id.as_str())
            .details(json!({ "guildCount": context.guilds.len() })),
    )
    .await?;
    tracing::info!(event = "discord.oauth", outcome = "session_opened", guilds = context.guilds.len());
    Ok(DiscordLogin {
        session_id,
        context,
    })
}
