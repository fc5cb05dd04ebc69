use sqlx::{Postgres, Transaction};

const CREATE_DISCORD_ACCOUNTS_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS discord_accounts (
                    discord_id TEXT PRIMARY KEY,
                    username TEXT NOT NULL,
                    access_token TEXT NOT NULL,
                    refresh_token TEXT NULL,
                    expires_at_unix BIGINT NOT NULL,
                    updated_at_unix BIGINT NOT NULL
                )";
const CREATE_SERVER_WORKSPACES_TABLE_SQL: &str =
    "CREATE TABLE IF NOT EXISTS server_workspaces (
                    server_id TEXT PRIMARY KEY,
                    server_name TEXT NOT NULL,
                    owner_id TEXT NOT NULL,
                    created_at_unix BIGINT NOT NULL
                )";
const CREATE_SERVER_MEMBERS_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS server_members (
                    server_id TEXT NOT NULL REFERENCES server_workspaces(server_id) ON DELETE CASCADE,
                    discord_user_id TEXT NOT NULL,
                    is_owner BOOLEAN NOT NULL DEFAULT FALSE,
                    is_admin BOOLEAN NOT NULL DEFAULT FALSE,
                    roles_json TEXT NOT NULL DEFAULT '[]',
                    PRIMARY KEY(server_id, discord_user_id)
                )";
const CREATE_USERS_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS users (
                    user_id TEXT PRIMARY KEY,
                    username TEXT UNIQUE NOT NULL,
                    password_hash TEXT NOT NULL,
                    role TEXT NOT NULL DEFAULT 'Agent',
                    is_suspended BOOLEAN NOT NULL DEFAULT FALSE,
                    ip TEXT NULL,
                    is_online BOOLEAN NOT NULL DEFAULT FALSE,
                    created_at_unix BIGINT NOT NULL
                )";
const CREATE_USERS_IP_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_users_ip ON users(ip) WHERE ip IS NOT NULL";
const CREATE_INVITE_CODES_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS invite_codes (
                    code TEXT PRIMARY KEY,
                    is_used BOOLEAN NOT NULL DEFAULT FALSE,
                    used_by TEXT NULL,
                    used_at_unix BIGINT NULL
                )";

pub(crate) async fn apply_identity_schema(
    tx: &mut Transaction<'_, Postgres>,
) -> Result<(), sqlx::Error> {
    sqlx::query(CREATE_DISCORD_ACCOUNTS_TABLE_SQL)
        .execute(&mut **tx)
        .await?;
    sqlx::query(CREATE_SERVER_WORKSPACES_TABLE_SQL)
        .execute(&mut **tx)
        .await?;
    sqlx::query(CREATE_SERVER_MEMBERS_TABLE_SQL)
        .execute(&mut **tx)
        .await?;
    sqlx::query(CREATE_USERS_TABLE_SQL)
        .execute(&mut **tx)
        .await?;
    sqlx::query(CREATE_USERS_IP_INDEX_SQL)
        .execute(&mut **tx)
        .await?;
    sqlx::query(CREATE_INVITE_CODES_TABLE_SQL)
        .execute(&mut **tx)
        .await?;
    Ok(())
}
