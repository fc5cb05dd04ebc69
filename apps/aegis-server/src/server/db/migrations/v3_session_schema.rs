use sqlx::{Postgres, Transaction};

const CREATE_SESSIONS_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS sessions (
                    session_id TEXT PRIMARY KEY,
                    principal_json TEXT NULL,
                    discord_json TEXT NULL,
                    local_user_id TEXT NULL,
                    expires_at_unix BIGINT NOT NULL,
                    revoked BOOLEAN NOT NULL DEFAULT FALSE
                )";
const CREATE_SESSIONS_LOCAL_USER_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_sessions_local_user ON sessions(local_user_id)
                    WHERE local_user_id IS NOT NULL";
const CREATE_SERVER_SECURITY_CONFIGS_TABLE_SQL: &str =
    "CREATE TABLE IF NOT EXISTS server_security_configs (
                    server_id TEXT PRIMARY KEY,
                    config_json TEXT NOT NULL,
                    updated_at_unix BIGINT NOT NULL
                )";

pub(crate) async fn apply_session_schema(
    tx: &mut Transaction<'_, Postgres>,
) -> Result<(), sqlx::Error> {
    sqlx::query(CREATE_SESSIONS_TABLE_SQL)
        .execute(&mut **tx)
        .await?;
    sqlx::query(CREATE_SESSIONS_LOCAL_USER_INDEX_SQL)
        .execute(&mut **tx)
        .await?;
    sqlx::query(CREATE_SERVER_SECURITY_CONFIGS_TABLE_SQL)
        .execute(&mut **tx)
        .await?;
    Ok(())
}
