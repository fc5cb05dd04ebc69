use sqlx::{Postgres, Transaction};

const CREATE_CASES_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS cases (
                    id TEXT PRIMARY KEY,
                    server_id TEXT NULL,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL,
                    priority TEXT NOT NULL,
                    assigned_agent TEXT NOT NULL,
                    content TEXT NOT NULL DEFAULT '',
                    tags_json TEXT NOT NULL DEFAULT '[]',
                    is_public BOOLEAN NOT NULL DEFAULT FALSE,
                    google_doc_url TEXT NULL,
                    case_code TEXT NULL,
                    created_at BIGINT NOT NULL,
                    updated_at BIGINT NOT NULL
                )";
const CREATE_CASES_SERVER_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_cases_server_updated ON cases(server_id, updated_at DESC)";
const CREATE_LOGS_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS logs (
                    seq BIGSERIAL PRIMARY KEY,
                    id TEXT UNIQUE NOT NULL,
                    action TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    target_id TEXT NULL,
                    details TEXT NULL,
                    timestamp BIGINT NOT NULL
                )";
const CREATE_LOGS_TARGET_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_logs_target_action ON logs(target_id, action, timestamp DESC)";
const CREATE_LOGS_TIMESTAMP_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp DESC, seq DESC)";

pub(crate) async fn apply_case_ledger_schema(
    tx: &mut Transaction<'_, Postgres>,
) -> Result<(), sqlx::Error> {
    sqlx::query(CREATE_CASES_TABLE_SQL)
        .execute(&mut **tx)
        .await?;
    sqlx::query(CREATE_CASES_SERVER_INDEX_SQL)
        .execute(&mut **tx)
        .await?;
    sqlx::query(CREATE_LOGS_TABLE_SQL)
        .execute(&mut **tx)
        .await?;
    sqlx::query(CREATE_LOGS_TARGET_INDEX_SQL)
        .execute(&mut **tx)
        .await?;
    sqlx::query(CREATE_LOGS_TIMESTAMP_INDEX_SQL)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{CREATE_CASES_TABLE_SQL, CREATE_LOGS_TABLE_SQL, CREATE_LOGS_TARGET_INDEX_SQL};

    #[test]
    fn case_id_is_primary_key() {
        assert!(CREATE_CASES_TABLE_SQL.contains("id TEXT PRIMARY KEY"));
    }

    #[test]
    fn logs_are_ordered_by_a_sequence_column() {
        assert!(CREATE_LOGS_TABLE_SQL.contains("seq BIGSERIAL PRIMARY KEY"));
        assert!(CREATE_LOGS_TARGET_INDEX_SQL.contains("logs(target_id, action, timestamp DESC)"));
    }
}
