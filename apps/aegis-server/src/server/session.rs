use aegis_core::{derive_role, is_ip_banned, DiscordPrincipal, IpStanding, LogAction, Principal};
use serde_json::json;
use sqlx::Row;
use ulid::Ulid;

use super::{
    audit::{append_log, LogEntry},
    auth::now_unix,
    core::{AppState, DiscordSessionContext, SessionRecord},
    db::ready_pool,
    errors::AuthFailure,
    identity::{ensure_member, ensure_workspace},
};

fn encode_json<T: serde::Serialize>(value: Option<&T>) -> Result<Option<String>, AuthFailure> {
    value
        .map(serde_json::to_string)
        .transpose()
        .map_err(|_| AuthFailure::SessionPersistence)
}

fn decode_json<T: serde::de::DeserializeOwned>(value: Option<String>) -> Option<T> {
    value.and_then(|raw| serde_json::from_str(&raw).ok())
}

pub(crate) async fn create_session(
    state: &AppState,
    principal: Option<Principal>,
    discord: Option<DiscordSessionContext>,
    local_user_id: Option<String>,
) -> Result<String, AuthFailure> {
    let session_id = Ulid::new().to_string();
    let record = SessionRecord {
        principal,
        discord,
        local_user_id,
        expires_at_unix: now_unix().saturating_add(state.runtime.session_ttl_secs),
        revoked: false,
    };

    if let Some(pool) = ready_pool(state).await? {
        sqlx::query(
            "INSERT INTO sessions
                (session_id, principal_json, discord_json, local_user_id, expires_at_unix, revoked)
             VALUES ($1, $2, $3, $4, $5, FALSE)",
        )
        .bind(&session_id)
        .bind(encode_json(record.principal.as_ref())?)
        .bind(encode_json(record.discord.as_ref())?)
        .bind(&record.local_user_id)
        .bind(record.expires_at_unix)
        .execute(pool)
        .await
        .map_err(|error| {
            tracing::error!(event = "session.create", outcome = "failed", error = %error);
            AuthFailure::SessionPersistence
        })?;
        return Ok(session_id);
    }

    let mut sessions = state.sessions.write().await;
    let now = now_unix();
    sessions.retain(|_, session| !session.revoked && session.expires_at_unix > now);
    sessions.insert(session_id.clone(), record);
    Ok(session_id)
}

/// Returns the live session; revoked and expired sessions read as absent.
pub(crate) async fn load_session(
    state: &AppState,
    session_id: &str,
) -> Result<Option<SessionRecord>, AuthFailure> {
    let now = now_unix();
    if let Some(pool) = ready_pool(state).await? {
        let row = sqlx::query(
            "SELECT principal_json, discord_json, local_user_id, expires_at_unix, revoked
             FROM sessions
             WHERE session_id = $1 AND revoked = FALSE AND expires_at_unix > $2",
        )
        .bind(session_id)
        .bind(now)
        .fetch_optional(pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        return Ok(Some(SessionRecord {
            principal: decode_json(row.try_get("principal_json")?),
            discord: decode_json(row.try_get("discord_json")?),
            local_user_id: row.try_get("local_user_id")?,
            expires_at_unix: row.try_get("expires_at_unix")?,
            revoked: row.try_get("revoked")?,
        }));
    }

    Ok(state
        .sessions
        .read()
        .await
        .get(session_id)
        .filter(|session| !session.revoked && session.expires_at_unix > now)
        .cloned())
}

/// Durably binds `principal` to an existing session.
pub(crate) async fn attach_principal(
    state: &AppState,
    session_id: &str,
    principal: &Principal,
) -> Result<(), AuthFailure> {
    if let Some(pool) = ready_pool(state).await? {
        let result = sqlx::query(
            "UPDATE sessions SET principal_json = $2
             WHERE session_id = $1 AND revoked = FALSE",
        )
        .bind(session_id)
        .bind(encode_json(Some(principal))?)
        .execute(pool)
        .await
        .map_err(|error| {
            tracing::error!(event = "session.attach", outcome = "failed", error = %error);
            AuthFailure::SessionPersistence
        })?;
        if result.rows_affected() == 0 {
            return Err(AuthFailure::Unauthenticated);
        }
        return Ok(());
    }

    let mut sessions = state.sessions.write().await;
    let session = sessions
        .get_mut(session_id)
        .filter(|session| !session.revoked)
        .ok_or(AuthFailure::Unauthenticated)?;
    session.principal = Some(principal.clone());
    Ok(())
}

pub(crate) async fn revoke_session(state: &AppState, session_id: &str) -> Result<(), AuthFailure> {
    if let Some(pool) = ready_pool(state).await? {
        sqlx::query("UPDATE sessions SET revoked = TRUE WHERE session_id = $1")
            .bind(session_id)
            .execute(pool)
            .await?;
        return Ok(());
    }
    if let Some(session) = state.sessions.write().await.get_mut(session_id) {
        session.revoked = true;
    }
    Ok(())
}

/// Revokes every session of a local user; used when the account is suspended.
pub(crate) async fn revoke_user_sessions(state: &AppState, user_id: &str) -> Result<u64, AuthFailure> {
    if let Some(pool) = ready_pool(state).await? {
        let result = sqlx::query(
            "UPDATE sessions SET revoked = TRUE WHERE local_user_id = $1 AND revoked = FALSE",
        )
        .bind(user_id)
        .execute(pool)
        .await?;
        return Ok(result.rows_affected());
    }
    let mut revoked = 0;
    for session in state.sessions.write().await.values_mut() {
        if !session.revoked && session.local_user_id.as_deref() == Some(user_id) {
            session.revoked = true;
            revoked += 1;
        }
    }
    Ok(revoked)
}

/// Resolves the role of `discord_user_id` inside `server_id` from the stored
/// membership snapshot and binds the resulting principal to the session.
///
/// First sight of a server creates its workspace with the caller as owner;
/// first sight of a member creates a non-admin membership. Calling this again
/// for the same pair yields the same role and no new rows.
pub(crate) async fn select_server(
    state: &AppState,
    session_id: &str,
    discord_user_id: &str,
    server_id: &str,
    server_name: Option<&str>,
    ip: &str,
) -> Result<Principal, AuthFailure> {
    if discord_user_id.is_empty() || server_id.is_empty() {
        return Err(AuthFailure::InvalidRequest);
    }

    let workspace = ensure_workspace(state, server_id, server_name, discord_user_id).await?;
    let member = ensure_member(
        state,
        server_id,
        discord_user_id,
        workspace.owner_id == discord_user_id,
    )
    .await?;
    let role = derive_role(member.is_owner, member.is_admin);
    let principal = Principal::Discord(DiscordPrincipal {
        discord_user_id: discord_user_id.to_owned(),
        server_id: server_id.to_owned(),
        username: discord_user_id.to_owned(),
        role,
        ip: ip.to_owned(),
    });
    attach_principal(state, session_id, &principal).await?;

    append_log(
        state,
        LogEntry::new(LogAction::ServerSelect, principal.id())
            .target(server_id)
            .server(Some(server_id))
            .details(json!({ "role": role.as_str() })),
    )
    .await?;
    tracing::info!(
        event = "session.select_server",
        outcome = "attached",
        server_id = %server_id,
        role = %role
    );
    Ok(principal)
}

/// True iff some suspended local account was last seen on `ip`. Read fresh on
/// every call.
pub(crate) async fn resolve_ip_status(state: &AppState, ip: &str) -> Result<bool, AuthFailure> {
    if let Some(pool) = ready_pool(state).await? {
        let rows = sqlx::query("SELECT ip, is_suspended FROM users WHERE ip = $1")
            .bind(ip)
            .fetch_all(pool)
            .await?;
        let standings = rows
            .iter()
            .map(|row| {
                Ok::<_, sqlx::Error>((
                    row.try_get::<Option<String>, _>("ip")?,
                    row.try_get::<bool, _>("is_suspended")?,
                ))
            })
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(is_ip_banned(
            standings.iter().map(|(row_ip, is_suspended)| IpStanding {
                ip: row_ip.as_deref(),
                is_suspended: *is_suspended,
            }),
            ip,
        ));
    }

    let users = state.users.read().await;
    Ok(is_ip_banned(
        users.values().map(|user| IpStanding {
            ip: user.ip.as_deref(),
            is_suspended: user.is_suspended,
        }),
        ip,
    ))
}
