use sqlx::PgPool;

use super::{core::AppState, errors::AuthFailure};

mod migrations {
    pub(crate) mod v1_identity_schema;
    pub(crate) mod v2_case_ledger_schema;
    pub(crate) mod v3_session_schema;
    pub(crate) mod v4_log_scope_schema;
}

use migrations::{
    v1_identity_schema::apply_identity_schema, v2_case_ledger_schema::apply_case_ledger_schema,
    v3_session_schema::apply_session_schema, v4_log_scope_schema::apply_log_scope_schema,
};

const SCHEMA_INIT_LOCK_ID: i64 = 0x4145_4749_535f_4442;
const SEED_INVITE_CODE_SQL: &str = "INSERT INTO invite_codes (code, is_used)
                 VALUES ($1, FALSE)
                 ON CONFLICT (code) DO NOTHING";

/// Creates every table once per process, serialized across instances by an
/// advisory lock. No-op for the in-memory backend.
pub(crate) async fn ensure_db_schema(state: &AppState) -> Result<(), AuthFailure> {
    let Some(pool) = &state.db_pool else {
        return Ok(());
    };
    let bootstrap_invite_codes = &state.runtime.bootstrap_invite_codes;

    state
        .db_init
        .get_or_try_init(|| async move {
            let mut tx = pool.begin().await?;
            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(SCHEMA_INIT_LOCK_ID)
                .execute(&mut *tx)
                .await?;

            apply_identity_schema(&mut tx).await?;
            apply_case_ledger_schema(&mut tx).await?;
            apply_session_schema(&mut tx).await?;
            apply_log_scope_schema(&mut tx).await?;

            for code in bootstrap_invite_codes {
                sqlx::query(SEED_INVITE_CODE_SQL)
                    .bind(code)
                    .execute(&mut *tx)
                    .await?;
            }

            tx.commit().await?;
            tracing::info!(event = "db.schema", outcome = "ready");
            Ok::<(), sqlx::Error>(())
        })
        .await
        .map_err(|error| {
            tracing::error!(event = "db.schema", outcome = "failed", error = %error);
            AuthFailure::Internal
        })?;
    Ok(())
}

/// Returns the pool once the schema is known to exist.
pub(crate) async fn ready_pool(state: &AppState) -> Result<Option<&PgPool>, AuthFailure> {
    ensure_db_schema(state).await?;
    Ok(state.db_pool.as_ref())
}
