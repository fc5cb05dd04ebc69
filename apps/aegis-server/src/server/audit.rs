use std::{collections::BTreeSet, future::Future};

use aegis_core::LogAction;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::{postgres::PgRow, PgConnection, Row};
use ulid::Ulid;

use super::{
    auth::now_millis,
    collaborators::{notify_best_effort, Notification},
    core::{AppState, CaseLedger, CaseRecord, LogRecord},
    db::ready_pool,
    errors::AuthFailure,
    metrics::record_log_append_retry,
    types::LogView,
};

pub(crate) const DELETE_LOG_REF_KEY: &str = "deleteLogId";
const LOG_COLUMNS: &str = "seq, id, action, user_id, target_id, server_id, details, timestamp";

/// An entry about to be appended; id, timestamp and sequence are assigned on write.
#[derive(Debug, Clone)]
pub(crate) struct LogEntry {
    pub(crate) action: LogAction,
    pub(crate) user_id: String,
    pub(crate) target_id: Option<String>,
    pub(crate) server_id: Option<String>,
    pub(crate) details: Option<Value>,
}

impl LogEntry {
    pub(crate) fn new(action: LogAction, user_id: impl Into<String>) -> Self {
        Self {
            action,
            user_id: user_id.into(),
            target_id: None,
            server_id: None,
            details: None,
        }
    }

    #[must_use]
    pub(crate) fn target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    #[must_use]
    pub(crate) fn server(mut self, server_id: Option<&str>) -> Self {
        self.server_id = server_id.map(ToOwned::to_owned);
        self
    }

    #[must_use]
    pub(crate) fn details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    fn into_record(self, seq: i64, timestamp: i64) -> LogRecord {
        LogRecord {
            id: Ulid::new().to_string(),
            action: self.action.as_str().to_owned(),
            user_id: self.user_id,
            target_id: self.target_id,
            server_id: self.server_id,
            details: self.details.map(|value| value.to_string()),
            timestamp,
            seq,
        }
    }
}

impl CaseLedger {
    pub(crate) fn push_log(&mut self, entry: LogEntry) -> LogRecord {
        self.next_seq += 1;
        let record = entry.into_record(self.next_seq, now_millis());
        self.logs.push(record.clone());
        record
    }
}

/// Failure inside a ledger sequence. SQL failures are retried once; rejections
/// are returned to the caller untouched.
#[derive(Debug)]
pub(crate) enum LedgerError {
    Sql(sqlx::Error),
    Rejected(AuthFailure),
}

impl From<sqlx::Error> for LedgerError {
    fn from(value: sqlx::Error) -> Self {
        Self::Sql(value)
    }
}

impl From<AuthFailure> for LedgerError {
    fn from(value: AuthFailure) -> Self {
        Self::Rejected(value)
    }
}

/// Runs a ledger write, retrying once on storage failure. A second storage
/// failure aborts the operation with `InvalidState`.
pub(crate) async fn with_log_retry<T, F, Fut>(
    operation: &'static str,
    mut attempt: F,
) -> Result<T, AuthFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LedgerError>>,
{
    match attempt().await {
        Ok(value) => return Ok(value),
        Err(LedgerError::Rejected(failure)) => return Err(failure),
        Err(LedgerError::Sql(error)) => {
            tracing::warn!(event = "audit.append", outcome = "retrying", operation, error = %error);
            record_log_append_retry();
        }
    }
    match attempt().await {
        Ok(value) => Ok(value),
        Err(LedgerError::Rejected(failure)) => Err(failure),
        Err(LedgerError::Sql(error)) => {
            tracing::error!(event = "audit.append", outcome = "exhausted", operation, error = %error);
            Err(AuthFailure::InvalidState)
        }
    }
}

pub(crate) fn log_from_row(row: &PgRow) -> Result<LogRecord, sqlx::Error> {
    Ok(LogRecord {
        id: row.try_get("id")?,
        action: row.try_get("action")?,
        user_id: row.try_get("user_id")?,
        target_id: row.try_get("target_id")?,
        server_id: row.try_get("server_id")?,
        details: row.try_get("details")?,
        timestamp: row.try_get("timestamp")?,
        seq: row.try_get("seq")?,
    })
}

pub(crate) async fn insert_log(
    conn: &mut PgConnection,
    entry: LogEntry,
) -> Result<LogRecord, sqlx::Error> {
    let record = entry.into_record(0, now_millis());
    let row = sqlx::query(
        "INSERT INTO logs (id, action, user_id, target_id, server_id, details, timestamp)
         VALUES ($1, $2, $3, $4, $5, $6, $7)
         RETURNING seq",
    )
    .bind(&record.id)
    .bind(&record.action)
    .bind(&record.user_id)
    .bind(&record.target_id)
    .bind(&record.server_id)
    .bind(&record.details)
    .bind(record.timestamp)
    .fetch_one(&mut *conn)
    .await?;
    Ok(LogRecord {
        seq: row.try_get("seq")?,
        ..record
    })
}

/// Offers committed entries to the notification collaborator, redacted the
/// same way `/logs` shows them.
pub(crate) fn publish_appended(state: &AppState, records: &[LogRecord]) {
    for record in records {
        notify_best_effort(state, Notification::Audit(LogView::from(record)));
    }
}

/// Appends one standalone entry, outside of any case sequence.
pub(crate) async fn append_log(state: &AppState, entry: LogEntry) -> Result<LogRecord, AuthFailure> {
    let action = entry.action;
    let record = if let Some(pool) = ready_pool(state).await? {
        with_log_retry(action.as_str(), || {
            let entry = entry.clone();
            async move {
                let mut conn = pool.acquire().await?;
                Ok(insert_log(&mut conn, entry).await?)
            }
        })
        .await?
    } else {
        state.ledger.write().await.push_log(entry)
    };
    tracing::debug!(event = "audit.append", outcome = "ok", action = %action);
    publish_appended(state, std::slice::from_ref(&record));
    Ok(record)
}

/// Newest first, optionally restricted to actions starting with `action_prefix`
/// and to entries of one server.
pub(crate) async fn list_logs(
    state: &AppState,
    limit: usize,
    action_prefix: Option<&str>,
    server_scope: Option<&str>,
) -> Result<Vec<LogRecord>, AuthFailure> {
    let prefix = action_prefix.unwrap_or_default();
    if let Some(pool) = ready_pool(state).await? {
        let rows = sqlx::query(&format!(
            "SELECT {LOG_COLUMNS} FROM logs
             WHERE starts_with(action, $1)
               AND ($3::TEXT IS NULL OR server_id = $3)
             ORDER BY timestamp DESC, seq DESC
             LIMIT $2"
        ))
        .bind(prefix)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(server_scope)
        .fetch_all(pool)
        .await?;
        return Ok(rows
            .iter()
            .map(log_from_row)
            .collect::<Result<Vec<_>, _>>()?);
    }

    let ledger = state.ledger.read().await;
    let mut logs: Vec<_> = ledger
        .logs
        .iter()
        .filter(|entry| entry.action.starts_with(prefix))
        .filter(|entry| server_scope.is_none() || entry.server_id.as_deref() == server_scope)
        .cloned()
        .collect();
    logs.sort_by(|a, b| log_order(b).cmp(&log_order(a)));
    logs.truncate(limit);
    Ok(logs)
}

/// Recovery-relevant history of one case, oldest first.
pub(crate) async fn load_case_history(
    conn: &mut PgConnection,
    case_id: &str,
) -> Result<Vec<LogRecord>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "SELECT {LOG_COLUMNS} FROM logs
         WHERE target_id = $1 AND action = ANY($2)
         ORDER BY timestamp ASC, seq ASC"
    ))
    .bind(case_id)
    .bind(recovery_actions())
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(log_from_row).collect()
}

fn recovery_actions() -> Vec<&'static str> {
    vec![
        LogAction::CaseDelete.as_str(),
        LogAction::CaseRestore.as_str(),
        LogAction::CaseEmbedRemoved.as_str(),
    ]
}

fn log_order(entry: &LogRecord) -> (i64, i64) {
    (entry.timestamp, entry.seq)
}

/// Latest `CASE_DELETE` for `case_id` that no later `CASE_RESTORE` supersedes.
pub(crate) fn latest_recoverable_delete<'a, I>(logs: I, case_id: &str) -> Option<&'a LogRecord>
where
    I: IntoIterator<Item = &'a LogRecord>,
{
    let mut latest_delete: Option<&LogRecord> = None;
    let mut latest_restore: Option<&LogRecord> = None;
    for entry in logs {
        if entry.target_id.as_deref() != Some(case_id) {
            continue;
        }
        let slot = if entry.action == LogAction::CaseDelete.as_str() {
            &mut latest_delete
        } else if entry.action == LogAction::CaseRestore.as_str() {
            &mut latest_restore
        } else {
            continue;
        };
        if slot.map_or(true, |current| log_order(entry) > log_order(current)) {
            *slot = Some(entry);
        }
    }
    let delete = latest_delete?;
    match latest_restore {
        Some(restore) if log_order(restore) > log_order(delete) => None,
        _ => Some(delete),
    }
}

#[derive(Deserialize)]
struct DeleteSnapshot {
    #[serde(rename = "caseData")]
    case_data: CaseRecord,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteLogRef {
    delete_log_id: String,
}

pub(crate) fn delete_snapshot_details(case: &CaseRecord) -> Value {
    json!({ "caseData": case })
}

pub(crate) fn delete_log_ref_details(delete_log_id: &str) -> Value {
    json!({ DELETE_LOG_REF_KEY: delete_log_id })
}

fn references_delete(entry: &LogRecord, action: LogAction, delete_log_id: &str) -> bool {
    entry.action == action.as_str()
        && entry
            .details
            .as_deref()
            .and_then(|details| serde_json::from_str::<DeleteLogRef>(details).ok())
            .is_some_and(|reference| reference.delete_log_id == delete_log_id)
}

/// Parses the snapshot embedded in a delete entry and applies every
/// `CASE_EMBED_REMOVED` overlay recorded against it.
pub(crate) fn resolve_snapshot<'a, I>(
    delete_entry: &LogRecord,
    logs: I,
) -> Result<CaseRecord, AuthFailure>
where
    I: IntoIterator<Item = &'a LogRecord>,
{
    let details = delete_entry
        .details
        .as_deref()
        .ok_or(AuthFailure::InvalidState)?;
    let mut snapshot = serde_json::from_str::<DeleteSnapshot>(details)
        .map_err(|error| {
            tracing::warn!(
                event = "recovery.snapshot",
                outcome = "unparseable",
                log_id = %delete_entry.id,
                error = %error
            );
            AuthFailure::InvalidState
        })?
        .case_data;
    let embed_removed = logs
        .into_iter()
        .any(|entry| references_delete(entry, LogAction::CaseEmbedRemoved, &delete_entry.id));
    if embed_removed {
        snapshot.google_doc_url = None;
    }
    Ok(snapshot)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RecoverableCase {
    pub(crate) case_id: String,
    pub(crate) delete_log_id: String,
    pub(crate) deleted_by: String,
    pub(crate) deleted_at: i64,
    pub(crate) title: Option<String>,
    pub(crate) server_id: Option<String>,
    pub(crate) has_embed: bool,
}

/// Deleted-but-not-restored set, keyed by case id, newest deletion first.
pub(crate) fn recoverable_cases(logs: &[LogRecord]) -> Vec<RecoverableCase> {
    let targets: BTreeSet<&str> = logs
        .iter()
        .filter(|entry| entry.action == LogAction::CaseDelete.as_str())
        .filter_map(|entry| entry.target_id.as_deref())
        .collect();
    let mut recoverable: Vec<_> = targets
        .into_iter()
        .filter_map(|case_id| {
            let delete = latest_recoverable_delete(logs, case_id)?;
            let snapshot = resolve_snapshot(delete, logs).ok();
            Some(RecoverableCase {
                case_id: case_id.to_owned(),
                delete_log_id: delete.id.clone(),
                deleted_by: delete.user_id.clone(),
                deleted_at: delete.timestamp,
                title: snapshot.as_ref().map(|case| case.title.clone()),
                server_id: snapshot.as_ref().and_then(|case| case.server_id.clone()),
                has_embed: snapshot.is_some_and(|case| case.google_doc_url.is_some()),
            })
        })
        .collect();
    recoverable.sort_by(|a, b| {
        b.deleted_at
            .cmp(&a.deleted_at)
            .then_with(|| a.case_id.cmp(&b.case_id))
    });
    recoverable
}

pub(crate) async fn list_recoverable_cases(
    state: &AppState,
) -> Result<Vec<RecoverableCase>, AuthFailure> {
    if let Some(pool) = ready_pool(state).await? {
        let rows = sqlx::query(&format!(
            "SELECT {LOG_COLUMNS} FROM logs
             WHERE action = ANY($1)
             ORDER BY timestamp ASC, seq ASC"
        ))
        .bind(recovery_actions())
        .fetch_all(pool)
        .await?;
        let logs = rows
            .iter()
            .map(log_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(recoverable_cases(&logs));
    }
    Ok(recoverable_cases(&state.ledger.read().await.logs))
}

#[cfg(test)]
mod tests {
    use aegis_core::{CasePriority, CaseStatus, LogAction};
    use serde_json::json;

    use super::{
        delete_log_ref_details, delete_snapshot_details, latest_recoverable_delete,
        recoverable_cases, resolve_snapshot, with_log_retry, LedgerError, LogEntry,
    };
    use crate::server::{
        core::{CaseLedger, CaseRecord},
        errors::AuthFailure,
    };

    fn case(id: &str, content: &str) -> CaseRecord {
        CaseRecord {
            id: id.to_owned(),
            server_id: Some(String::from("9001")),
            title: String::from("Project X"),
            description: String::new(),
            status: CaseStatus::Active,
            priority: CasePriority::Medium,
            assigned_agent: String::from("AGENT_FOX"),
            content: content.to_owned(),
            tags: vec![String::from("intel")],
            is_public: false,
            google_doc_url: Some(String::from("https://docs.google.com/document/d/abc")),
            case_code: None,
            created_at: 10,
            updated_at: 20,
        }
    }

    fn delete(ledger: &mut CaseLedger, record: &CaseRecord) -> String {
        ledger
            .push_log(
                LogEntry::new(LogAction::CaseDelete, "u1")
                    .target(&record.id)
                    .details(delete_snapshot_details(record)),
            )
            .id
    }

    #[test]
    fn restore_after_delete_closes_recovery_window() {
        let mut ledger = CaseLedger::default();
        let record = case("CASE-2026-1", "first");
        delete(&mut ledger, &record);
        assert!(latest_recoverable_delete(&ledger.logs, "CASE-2026-1").is_some());
        ledger.push_log(LogEntry::new(LogAction::CaseRestore, "u1").target("CASE-2026-1"));
        assert!(latest_recoverable_delete(&ledger.logs, "CASE-2026-1").is_none());
        assert!(recoverable_cases(&ledger.logs).is_empty());
    }

    #[test]
    fn repeated_delete_resolves_to_latest_snapshot() {
        let mut ledger = CaseLedger::default();
        delete(&mut ledger, &case("CASE-2026-1", "first"));
        ledger.push_log(LogEntry::new(LogAction::CaseRestore, "u1").target("CASE-2026-1"));
        let second = delete(&mut ledger, &case("CASE-2026-1", "second"));

        let latest =
            latest_recoverable_delete(&ledger.logs, "CASE-2026-1").expect("delete is recoverable");
        assert_eq!(latest.id, second);
        let snapshot = resolve_snapshot(latest, &ledger.logs).expect("snapshot parses");
        assert_eq!(snapshot.content, "second");
    }

    #[test]
    fn sequence_breaks_ties_between_equal_timestamps() {
        let mut ledger = CaseLedger::default();
        delete(&mut ledger, &case("CASE-2026-1", "first"));
        ledger.push_log(LogEntry::new(LogAction::CaseRestore, "u1").target("CASE-2026-1"));
        for entry in &mut ledger.logs {
            entry.timestamp = 1_000;
        }
        assert!(latest_recoverable_delete(&ledger.logs, "CASE-2026-1").is_none());
    }

    #[test]
    fn embed_overlay_strips_doc_url_without_touching_delete_entry() {
        let mut ledger = CaseLedger::default();
        let delete_id = delete(&mut ledger, &case("CASE-2026-1", "first"));
        let original_details = ledger.logs[0].details.clone();
        ledger.push_log(
            LogEntry::new(LogAction::CaseEmbedRemoved, "overseer")
                .target("CASE-2026-1")
                .details(delete_log_ref_details(&delete_id)),
        );

        let latest =
            latest_recoverable_delete(&ledger.logs, "CASE-2026-1").expect("still recoverable");
        let snapshot = resolve_snapshot(latest, &ledger.logs).expect("snapshot parses");
        assert_eq!(snapshot.google_doc_url, None);
        assert_eq!(ledger.logs[0].details, original_details);
        let listed = recoverable_cases(&ledger.logs);
        assert_eq!(listed.len(), 1);
        assert!(!listed[0].has_embed);
    }

    #[test]
    fn legacy_details_are_invalid_state() {
        let mut ledger = CaseLedger::default();
        let entry = ledger.push_log(
            LogEntry::new(LogAction::CaseDelete, "u1")
                .target("CASE-2026-7")
                .details(json!("Deleted case CASE-2026-7")),
        );
        assert_eq!(
            resolve_snapshot(&entry, &ledger.logs),
            Err(AuthFailure::InvalidState)
        );
        let listed = recoverable_cases(&ledger.logs);
        assert_eq!(listed[0].title, None);
    }

    #[tokio::test]
    async fn log_write_is_retried_once_then_fails_loudly() {
        let mut attempts = 0;
        let result: Result<(), AuthFailure> = with_log_retry("test", || {
            attempts += 1;
            async { Err(LedgerError::Sql(sqlx::Error::PoolTimedOut)) }
        })
        .await;
        assert_eq!(result, Err(AuthFailure::InvalidState));
        assert_eq!(attempts, 2);

        let mut attempts = 0;
        let result = with_log_retry("test", || {
            attempts += 1;
            let outcome = if attempts == 1 {
                Err(LedgerError::Sql(sqlx::Error::PoolTimedOut))
            } else {
                Ok(attempts)
            };
            async move { outcome }
        })
        .await;
        assert_eq!(result, Ok(2));
    }

    #[tokio::test]
    async fn rejections_are_not_retried() {
        let mut attempts = 0;
        let result: Result<(), AuthFailure> = with_log_retry("test", || {
            attempts += 1;
            async { Err(LedgerError::Rejected(AuthFailure::NotFound)) }
        })
        .await;
        assert_eq!(result, Err(AuthFailure::NotFound));
        assert_eq!(attempts, 1);
    }
}
