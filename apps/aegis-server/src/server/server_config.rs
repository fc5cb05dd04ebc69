use aegis_core::{LogAction, Operation, Principal};
use serde_json::json;
use sqlx::Row;

use super::{
    audit::{append_log, LogEntry},
    auth::now_unix,
    core::{AppState, ServerSecurityConfig},
    db::ready_pool,
    errors::AuthFailure,
    gate::{require_owning_server_match, require_role, require_server_membership},
};

const MAX_JOIN_RATE_THRESHOLD: u32 = 1_000;
const MAX_COMMAND_PERMISSIONS: usize = 64;
const MAX_COMMAND_NAME_CHARS: usize = 32;

/// Per-server security settings; servers never configured read as defaults.
pub(crate) async fn load_server_config(
    state: &AppState,
    server_id: &str,
) -> Result<ServerSecurityConfig, AuthFailure> {
    if let Some(pool) = ready_pool(state).await? {
        let row = sqlx::query("SELECT config_json FROM server_security_configs WHERE server_id = $1")
            .bind(server_id)
            .fetch_optional(pool)
            .await?;
        let Some(row) = row else {
            return Ok(ServerSecurityConfig::default());
        };
        let raw: String = row.try_get("config_json")?;
        return serde_json::from_str(&raw).map_err(|error| {
            tracing::error!(event = "server_config.load", outcome = "corrupt", error = %error);
            AuthFailure::Internal
        });
    }
    Ok(state
        .server_configs
        .read()
        .await
        .get(server_id)
        .cloned()
        .unwrap_or_default())
}

fn validate_config(config: &ServerSecurityConfig) -> Result<(), AuthFailure> {
    if config.join_rate_threshold == 0 || config.join_rate_threshold > MAX_JOIN_RATE_THRESHOLD {
        return Err(AuthFailure::InvalidRequest);
    }
    if config.command_permissions.len() > MAX_COMMAND_PERMISSIONS {
        return Err(AuthFailure::InvalidRequest);
    }
    let commands_valid = config.command_permissions.keys().all(|command| {
        !command.is_empty()
            && command.len() <= MAX_COMMAND_NAME_CHARS
            && command
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_')
    });
    if !commands_valid {
        return Err(AuthFailure::InvalidRequest);
    }
    Ok(())
}

pub(crate) async fn store_server_config(
    state: &AppState,
    principal: &Principal,
    server_id: &str,
    config: ServerSecurityConfig,
) -> Result<ServerSecurityConfig, AuthFailure> {
    require_role(principal, Operation::ManageServerConfig)?;
    require_server_membership(state, principal, server_id).await?;
    if principal.server_id().is_some() {
        require_owning_server_match(server_id, principal.server_id())?;
    }
    validate_config(&config)?;

    if let Some(pool) = ready_pool(state).await? {
        let encoded = serde_json::to_string(&config).map_err(|_| AuthFailure::Internal)?;
        sqlx::query(
            "INSERT INTO server_security_configs (server_id, config_json, updated_at_unix)
             VALUES ($1, $2, $3)
             ON CONFLICT (server_id) DO UPDATE SET
                config_json = EXCLUDED.config_json,
                updated_at_unix = EXCLUDED.updated_at_unix",
        )
        .bind(server_id)
        .bind(encoded)
        .bind(now_unix())
        .execute(pool)
        .await?;
    } else {
        state
            .server_configs
            .write()
            .await
            .insert(server_id.to_owned(), config.clone());
    }

    append_log(
        state,
        LogEntry::new(LogAction::ServerConfigUpdate, principal.id())
            .target(server_id)
            .server(Some(server_id))
            .details(json!({
                "raidProtection": config.raid_protection,
                "joinRateThreshold": config.join_rate_threshold,
                "commandCount": config.command_permissions.len(),
            })),
    )
    .await?;
    tracing::info!(event = "server_config.store", outcome = "saved", server_id = %server_id);
    Ok(config)
}
