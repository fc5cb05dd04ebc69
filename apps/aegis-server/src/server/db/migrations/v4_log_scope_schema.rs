use sqlx::{Postgres, Transaction};

const ADD_LOG_SERVER_COLUMN_SQL: &str = "ALTER TABLE logs
                 ADD COLUMN IF NOT EXISTS server_id TEXT NULL";
const CREATE_LOGS_SERVER_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_logs_server_timestamp ON logs(server_id, timestamp DESC, seq DESC)";

pub(crate) async fn apply_log_scope_schema(
    tx: &mut Transaction<'_, Postgres>,
) -> Result<(), sqlx::Error> {
    sqlx::query(ADD_LOG_SERVER_COLUMN_SQL)
        .execute(&mut **tx)
        .await?;
    sqlx::query(CREATE_LOGS_SERVER_INDEX_SQL)
        .execute(&mut **tx)
        .await?;
    Ok(())
}
