use aegis_core::{
    generate_case_code, CaseId, CasePriority, CaseStatus, CaseTitle, LogAction, Operation,
    Principal,
};
use chrono::Datelike;
use serde_json::json;
use sqlx::{postgres::PgRow, PgConnection, PgPool, Row};

use super::{
    audit::{
        delete_log_ref_details, delete_snapshot_details, insert_log, latest_recoverable_delete,
        load_case_history, publish_appended, resolve_snapshot, with_log_retry, LedgerError,
        LogEntry,
    },
    auth::now_millis,
    collaborators::{notify_best_effort, CaseNotice, Notification},
    core::{
        AppState, CaseRecord, LogRecord, CASE_ID_GENERATION_ATTEMPTS, MAX_CASE_TAGS,
        MAX_CASE_TAG_CHARS, MAX_CASE_TEXT_CHARS,
    },
    db::ready_pool,
    errors::{is_unique_violation, AuthFailure},
    gate::{require_case_scope, require_role, require_server_membership},
};

const CASE_COLUMNS: &str = "id, server_id, title, description, status, priority, assigned_agent,
     content, tags_json, is_public, google_doc_url, case_code, created_at, updated_at";
const MAX_DOC_URL_CHARS: usize = 2_048;

/// Validated input for `create_case`.
#[derive(Debug, Clone)]
pub(crate) struct NewCase {
    pub(crate) title: CaseTitle,
    pub(crate) description: String,
    pub(crate) status: CaseStatus,
    pub(crate) priority: CasePriority,
    pub(crate) content: String,
    pub(crate) tags: Vec<String>,
    pub(crate) google_doc_url: Option<String>,
    pub(crate) server_id: Option<String>,
}

/// Field updates; `None` leaves a field untouched. An empty doc url clears it.
#[derive(Debug, Clone, Default)]
pub(crate) struct CasePatch {
    pub(crate) title: Option<CaseTitle>,
    pub(crate) description: Option<String>,
    pub(crate) status: Option<CaseStatus>,
    pub(crate) priority: Option<CasePriority>,
    pub(crate) content: Option<String>,
    pub(crate) tags: Option<Vec<String>>,
    pub(crate) google_doc_url: Option<Option<String>>,
}

impl CasePatch {
    fn changed_fields(&self) -> Vec<&'static str> {
        [
            ("title", self.title.is_some()),
            ("description", self.description.is_some()),
            ("status", self.status.is_some()),
            ("priority", self.priority.is_some()),
            ("content", self.content.is_some()),
            ("tags", self.tags.is_some()),
            ("googleDocUrl", self.google_doc_url.is_some()),
        ]
        .into_iter()
        .filter_map(|(name, changed)| changed.then_some(name))
        .collect()
    }

    fn apply(&self, case: &mut CaseRecord) {
        if let Some(title) = &self.title {
            case.title = title.as_str().to_owned();
        }
        if let Some(description) = &self.description {
            case.description.clone_from(description);
        }
        if let Some(status) = self.status {
            case.status = status;
        }
        if let Some(priority) = self.priority {
            case.priority = priority;
        }
        if let Some(content) = &self.content {
            case.content.clone_from(content);
        }
        if let Some(tags) = &self.tags {
            case.tags.clone_from(tags);
        }
        if let Some(url) = &self.google_doc_url {
            case.google_doc_url.clone_from(url);
        }
    }
}

pub(crate) fn validate_case_text(value: String) -> Result<String, AuthFailure> {
    if value.chars().count() > MAX_CASE_TEXT_CHARS {
        return Err(AuthFailure::InvalidRequest);
    }
    Ok(value)
}

/// Trims, drops empties and duplicates, and bounds count and length.
pub(crate) fn normalize_tags(tags: Vec<String>) -> Result<Vec<String>, AuthFailure> {
    let mut normalized: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim();
        if tag.is_empty() || normalized.iter().any(|existing| existing == tag) {
            continue;
        }
        if tag.chars().count() > MAX_CASE_TAG_CHARS || tag.chars().any(char::is_control) {
            return Err(AuthFailure::InvalidRequest);
        }
        normalized.push(tag.to_owned());
    }
    if normalized.len() > MAX_CASE_TAGS {
        return Err(AuthFailure::InvalidRequest);
    }
    Ok(normalized)
}

/// Empty input clears the link; anything else must be an https URL.
pub(crate) fn validate_doc_url(value: String) -> Result<Option<String>, AuthFailure> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.len() > MAX_DOC_URL_CHARS || !trimmed.starts_with("https://") {
        return Err(AuthFailure::InvalidRequest);
    }
    Ok(Some(trimmed.to_owned()))
}

fn draw_case_id() -> String {
    CaseId::generate(chrono::Utc::now().year(), &mut rand::thread_rng()).into_string()
}

fn draw_case_code() -> String {
    generate_case_code(&mut rand::thread_rng())
}

fn case_from_row(row: &PgRow) -> Result<CaseRecord, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let priority: String = row.try_get("priority")?;
    let tags_json: String = row.try_get("tags_json")?;
    Ok(CaseRecord {
        id: row.try_get("id")?,
        server_id: row.try_get("server_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        status: CaseStatus::try_from(status)
            .map_err(|error| sqlx::Error::Decode(Box::new(error)))?,
        priority: CasePriority::try_from(priority)
            .map_err(|error| sqlx::Error::Decode(Box::new(error)))?,
        assigned_agent: row.try_get("assigned_agent")?,
        content: row.try_get("content")?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        is_public: row.try_get("is_public")?,
        google_doc_url: row.try_get("google_doc_url")?,
        case_code: row.try_get("case_code")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn tags_json(case: &CaseRecord) -> String {
    serde_json::to_string(&case.tags).unwrap_or_else(|_| String::from("[]"))
}

async fn insert_case_row(conn: &mut PgConnection, case: &CaseRecord) -> Result<(), sqlx::Error> {
    sqlx::query(&format!(
        "INSERT INTO cases ({CASE_COLUMNS})
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"
    ))
    .bind(&case.id)
    .bind(&case.server_id)
    .bind(&case.title)
    .bind(&case.description)
    .bind(case.status.as_str())
    .bind(case.priority.as_str())
    .bind(&case.assigned_agent)
    .bind(&case.content)
    .bind(tags_json(case))
    .bind(case.is_public)
    .bind(&case.google_doc_url)
    .bind(&case.case_code)
    .bind(case.created_at)
    .bind(case.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn update_case_row(conn: &mut PgConnection, case: &CaseRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE cases SET
            title = $2, description = $3, status = $4, priority = $5, assigned_agent = $6,
            content = $7, tags_json = $8, is_public = $9, google_doc_url = $10,
            case_code = $11, updated_at = $12
         WHERE id = $1",
    )
    .bind(&case.id)
    .bind(&case.title)
    .bind(&case.description)
    .bind(case.status.as_str())
    .bind(case.priority.as_str())
    .bind(&case.assigned_agent)
    .bind(&case.content)
    .bind(tags_json(case))
    .bind(case.is_public)
    .bind(&case.google_doc_url)
    .bind(&case.case_code)
    .bind(case.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn select_case_for_update(
    conn: &mut PgConnection,
    case_id: &str,
) -> Result<Option<CaseRecord>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {CASE_COLUMNS} FROM cases WHERE id = $1 FOR UPDATE"
    ))
    .bind(case_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(case_from_row).transpose()
}

/// Serializes lifecycle sequences on one case id, including ids with no live row.
async fn lock_case_id(conn: &mut PgConnection, case_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(case_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub(crate) async fn find_case(
    state: &AppState,
    case_id: &str,
) -> Result<Option<CaseRecord>, AuthFailure> {
    if let Some(pool) = ready_pool(state).await? {
        let row = sqlx::query(&format!("SELECT {CASE_COLUMNS} FROM cases WHERE id = $1"))
            .bind(case_id)
            .fetch_optional(pool)
            .await?;
        return Ok(row.as_ref().map(case_from_row).transpose()?);
    }
    Ok(state.ledger.read().await.cases.get(case_id).cloned())
}

/// Newest first. `server_id = None` lists every case.
pub(crate) async fn list_cases(
    state: &AppState,
    server_id: Option<&str>,
) -> Result<Vec<CaseRecord>, AuthFailure> {
    if let Some(pool) = ready_pool(state).await? {
        let rows = sqlx::query(&format!(
            "SELECT {CASE_COLUMNS} FROM cases
             WHERE ($1::TEXT IS NULL OR server_id = $1)
             ORDER BY updated_at DESC, id ASC"
        ))
        .bind(server_id)
        .fetch_all(pool)
        .await?;
        return Ok(rows
            .iter()
            .map(case_from_row)
            .collect::<Result<Vec<_>, _>>()?);
    }
    let ledger = state.ledger.read().await;
    let mut cases: Vec<_> = ledger
        .cases
        .values()
        .filter(|case| server_id.is_none() || case.server_id.as_deref() == server_id)
        .cloned()
        .collect();
    sort_newest_first(&mut cases);
    Ok(cases)
}

pub(crate) async fn list_public_cases(state: &AppState) -> Result<Vec<CaseRecord>, AuthFailure> {
    if let Some(pool) = ready_pool(state).await? {
        let rows = sqlx::query(&format!(
            "SELECT {CASE_COLUMNS} FROM cases WHERE is_public = TRUE
             ORDER BY updated_at DESC, id ASC"
        ))
        .fetch_all(pool)
        .await?;
        return Ok(rows
            .iter()
            .map(case_from_row)
            .collect::<Result<Vec<_>, _>>()?);
    }
    let ledger = state.ledger.read().await;
    let mut cases: Vec<_> = ledger
        .cases
        .values()
        .filter(|case| case.is_public)
        .cloned()
        .collect();
    sort_newest_first(&mut cases);
    Ok(cases)
}

fn sort_newest_first(cases: &mut [CaseRecord]) {
    cases.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
}

/// Public cases are readable by anyone. Private cases need a principal, and
/// encrypted private cases additionally need the matching code. A missing
/// case reads as `None` for authenticated callers.
pub(crate) async fn get_case(
    state: &AppState,
    principal: Option<&Principal>,
    case_id: &str,
    presented_code: Option<&str>,
) -> Result<Option<CaseRecord>, AuthFailure> {
    let case = find_case(state, case_id).await?;
    if let Some(case) = case.as_ref().filter(|case| case.is_public) {
        return Ok(Some(case.clone()));
    }
    principal.ok_or(AuthFailure::Unauthenticated)?;
    let Some(case) = case else {
        return Ok(None);
    };
    if let Some(code) = case.case_code.as_deref() {
        if presented_code != Some(code) {
            tracing::warn!(event = "case.read", outcome = "locked", case_id = %case_id);
            return Err(AuthFailure::CaseLocked);
        }
    }
    Ok(Some(case))
}

pub(crate) async fn create_case(
    state: &AppState,
    principal: &Principal,
    input: NewCase,
) -> Result<CaseRecord, AuthFailure> {
    require_role(principal, Operation::CreateCase)?;
    let server_id = match input.server_id.as_deref() {
        Some(server_id) => {
            require_server_membership(state, principal, server_id).await?;
            Some(server_id.to_owned())
        }
        None => principal.server_id().map(ToOwned::to_owned),
    };
    let now = now_millis();
    let template = CaseRecord {
        id: String::new(),
        server_id,
        title: input.title.into_string(),
        description: input.description,
        status: input.status,
        priority: input.priority,
        assigned_agent: principal.username().to_owned(),
        content: input.content,
        tags: input.tags,
        is_public: false,
        google_doc_url: input.google_doc_url,
        case_code: None,
        created_at: now,
        updated_at: now,
    };
    let actor = principal.id();

    let (case, log) = if let Some(pool) = ready_pool(state).await? {
        create_case_pg(pool, template, &actor).await?
    } else {
        let mut ledger = state.ledger.write().await;
        let mut created = None;
        for _ in 0..CASE_ID_GENERATION_ATTEMPTS {
            let id = draw_case_id();
            let taken = ledger.cases.contains_key(&id)
                || ledger
                    .logs
                    .iter()
                    .any(|entry| entry.target_id.as_deref() == Some(id.as_str()));
            if !taken {
                created = Some(id);
                break;
            }
        }
        let Some(id) = created else {
            tracing::warn!(event = "case.create", outcome = "id_exhausted");
            return Err(AuthFailure::Conflict);
        };
        let case = CaseRecord { id, ..template };
        ledger.cases.insert(case.id.clone(), case.clone());
        let log = ledger.push_log(
            LogEntry::new(LogAction::CaseCreate, &actor)
                .target(&case.id)
                .server(case.server_id.as_deref()),
        );
        (case, log)
    };

    tracing::info!(event = "case.create", outcome = "created", case_id = %case.id);
    publish_appended(state, std::slice::from_ref(&log));
    notify_best_effort(state, Notification::CaseCreated(CaseNotice::from(&case)));
    Ok(case)
}

async fn create_case_pg(
    pool: &PgPool,
    template: CaseRecord,
    actor: &str,
) -> Result<(CaseRecord, LogRecord), AuthFailure> {
    for _ in 0..CASE_ID_GENERATION_ATTEMPTS {
        let case = CaseRecord {
            id: draw_case_id(),
            ..template.clone()
        };
        let inserted = with_log_retry("case.create", || insert_new_case(pool, &case, actor)).await?;
        if let Some(log) = inserted {
            return Ok((case, log));
        }
        tracing::info!(event = "case.create", outcome = "id_collision_retry");
    }
    tracing::warn!(event = "case.create", outcome = "id_exhausted");
    Err(AuthFailure::Conflict)
}

/// `Ok(None)` when the id is already used by a live row or by log history.
async fn insert_new_case(
    pool: &PgPool,
    case: &CaseRecord,
    actor: &str,
) -> Result<Option<LogRecord>, LedgerError> {
    let mut tx = pool.begin().await?;
    lock_case_id(&mut tx, &case.id).await?;
    let seen = sqlx::query("SELECT 1 FROM logs WHERE target_id = $1 LIMIT 1")
        .bind(&case.id)
        .fetch_optional(&mut *tx)
        .await?;
    if seen.is_some() {
        return Ok(None);
    }
    match insert_case_row(&mut tx, case).await {
        Ok(()) => {}
        Err(error) if is_unique_violation(&error) => return Ok(None),
        Err(error) => return Err(error.into()),
    }
    let log = insert_log(
        &mut tx,
        LogEntry::new(LogAction::CaseCreate, actor)
            .target(&case.id)
            .server(case.server_id.as_deref()),
    )
    .await?;
    tx.commit().await?;
    Ok(Some(log))
}

/// Applies `mutate` to a live case and appends the entry it returns, as one
/// unit. The case must be within the principal's scope.
async fn mutate_case<F>(
    state: &AppState,
    principal: &Principal,
    case_id: &str,
    supplied_server_id: Option<&str>,
    operation: &'static str,
    mutate: F,
) -> Result<CaseRecord, AuthFailure>
where
    F: Fn(&mut CaseRecord) -> Result<LogEntry, AuthFailure> + Sync,
{
    let (case, log) = if let Some(pool) = ready_pool(state).await? {
        with_log_retry(operation, || {
            mutate_case_pg(pool, principal, case_id, supplied_server_id, &mutate)
        })
        .await?
    } else {
        let mut ledger = state.ledger.write().await;
        let current = ledger.cases.get(case_id).ok_or(AuthFailure::NotFound)?;
        require_case_scope(principal, supplied_server_id, current.server_id.as_deref())?;
        let mut updated = current.clone();
        let entry = mutate(&mut updated)?.server(updated.server_id.as_deref());
        ledger.cases.insert(updated.id.clone(), updated.clone());
        let log = ledger.push_log(entry);
        (updated, log)
    };
    tracing::info!(event = operation, outcome = "applied", case_id = %case_id);
    publish_appended(state, std::slice::from_ref(&log));
    Ok(case)
}

async fn mutate_case_pg<F>(
    pool: &PgPool,
    principal: &Principal,
    case_id: &str,
    supplied_server_id: Option<&str>,
    mutate: &F,
) -> Result<(CaseRecord, LogRecord), LedgerError>
where
    F: Fn(&mut CaseRecord) -> Result<LogEntry, AuthFailure>,
{
    let mut tx = pool.begin().await?;
    let mut case = select_case_for_update(&mut tx, case_id)
        .await?
        .ok_or(AuthFailure::NotFound)?;
    require_case_scope(principal, supplied_server_id, case.server_id.as_deref())?;
    let entry = mutate(&mut case)?.server(case.server_id.as_deref());
    update_case_row(&mut tx, &case).await?;
    let log = insert_log(&mut tx, entry).await?;
    tx.commit().await?;
    Ok((case, log))
}

pub(crate) async fn update_case(
    state: &AppState,
    principal: &Principal,
    case_id: &str,
    patch: CasePatch,
    supplied_server_id: Option<&str>,
) -> Result<CaseRecord, AuthFailure> {
    require_role(principal, Operation::UpdateCase)?;
    if let Some(server_id) = supplied_server_id {
        require_server_membership(state, principal, server_id).await?;
    }
    let actor = principal.id();
    let fields = patch.changed_fields();
    mutate_case(state, principal, case_id, supplied_server_id, "case.update", |case| {
        patch.apply(case);
        case.updated_at = now_millis();
        Ok(LogEntry::new(LogAction::CaseUpdate, &actor)
            .target(&case.id)
            .details(json!({ "fields": fields })))
    })
    .await
}

pub(crate) async fn toggle_case_visibility(
    state: &AppState,
    principal: &Principal,
    case_id: &str,
) -> Result<CaseRecord, AuthFailure> {
    require_role(principal, Operation::ToggleCaseVisibility)?;
    let actor = principal.id();
    let case = mutate_case(state, principal, case_id, None, "case.visibility", |case| {
        case.is_public = !case.is_public;
        case.updated_at = now_millis();
        Ok(LogEntry::new(LogAction::CasePublicToggle, &actor)
            .target(&case.id)
            .details(json!({ "isPublic": case.is_public })))
    })
    .await?;
    if case.is_public {
        notify_best_effort(state, Notification::CasePublished(CaseNotice::from(&case)));
    }
    Ok(case)
}

/// Locks a case behind a freshly generated code and returns that code. This is
/// the only place the code is ever handed out.
pub(crate) async fn encrypt_case(
    state: &AppState,
    principal: &Principal,
    case_id: &str,
) -> Result<String, AuthFailure> {
    require_role(principal, Operation::EncryptCase)?;
    let actor = principal.id();
    let code = draw_case_code();
    mutate_case(state, principal, case_id, None, "case.encrypt", |case| {
        case.case_code = Some(code.clone());
        case.updated_at = now_millis();
        Ok(LogEntry::new(LogAction::CaseEncrypt, &actor).target(&case.id))
    })
    .await?;
    Ok(code)
}

pub(crate) async fn decrypt_case(
    state: &AppState,
    principal: &Principal,
    case_id: &str,
) -> Result<CaseRecord, AuthFailure> {
    require_role(principal, Operation::DecryptCase)?;
    let actor = principal.id();
    mutate_case(state, principal, case_id, None, "case.decrypt", |case| {
        case.case_code = None;
        case.updated_at = now_millis();
        Ok(LogEntry::new(LogAction::CaseDecrypt, &actor).target(&case.id))
    })
    .await
}

/// Soft delete: the full row is logged as a `CASE_DELETE` snapshot before the
/// live row is removed, in one unit.
pub(crate) async fn delete_case(
    state: &AppState,
    principal: &Principal,
    case_id: &str,
    supplied_server_id: Option<&str>,
) -> Result<(), AuthFailure> {
    require_role(principal, Operation::DeleteCase)?;
    if let Some(server_id) = supplied_server_id {
        require_server_membership(state, principal, server_id).await?;
    }
    let actor = principal.id();

    let log = if let Some(pool) = ready_pool(state).await? {
        with_log_retry("case.delete", || {
            delete_case_pg(pool, principal, case_id, supplied_server_id, &actor)
        })
        .await?
    } else {
        let mut ledger = state.ledger.write().await;
        let case = ledger.cases.get(case_id).ok_or(AuthFailure::NotFound)?;
        require_case_scope(principal, supplied_server_id, case.server_id.as_deref())?;
        let entry = LogEntry::new(LogAction::CaseDelete, &actor)
            .target(case_id)
            .server(case.server_id.as_deref())
            .details(delete_snapshot_details(case));
        let log = ledger.push_log(entry);
        ledger.cases.remove(case_id);
        log
    };
    tracing::info!(event = "case.delete", outcome = "snapshot_logged", case_id = %case_id);
    publish_appended(state, std::slice::from_ref(&log));
    Ok(())
}

async fn delete_case_pg(
    pool: &PgPool,
    principal: &Principal,
    case_id: &str,
    supplied_server_id: Option<&str>,
    actor: &str,
) -> Result<LogRecord, LedgerError> {
    let mut tx = pool.begin().await?;
    lock_case_id(&mut tx, case_id).await?;
    let case = select_case_for_update(&mut tx, case_id)
        .await?
        .ok_or(AuthFailure::NotFound)?;
    require_case_scope(principal, supplied_server_id, case.server_id.as_deref())?;
    let log = insert_log(
        &mut tx,
        LogEntry::new(LogAction::CaseDelete, actor)
            .target(case_id)
            .server(case.server_id.as_deref())
            .details(delete_snapshot_details(&case)),
    )
    .await?;
    sqlx::query("DELETE FROM cases WHERE id = $1")
        .bind(case_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(log)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RestoreOutcome {
    pub(crate) case: CaseRecord,
    /// `false` when the case was already live and nothing changed.
    pub(crate) restored: bool,
}

/// Re-inserts the latest unrestored snapshot with fresh timestamps. A case
/// that is already live is returned unchanged.
pub(crate) async fn restore_case(
    state: &AppState,
    principal: &Principal,
    case_id: &str,
) -> Result<RestoreOutcome, AuthFailure> {
    require_role(principal, Operation::RestoreCase)?;
    let actor = principal.id();

    let (outcome, log) = if let Some(pool) = ready_pool(state).await? {
        with_log_retry("case.restore", || {
            restore_case_pg(pool, principal, case_id, &actor)
        })
        .await?
    } else {
        let mut ledger = state.ledger.write().await;
        if let Some(live) = ledger.cases.get(case_id) {
            require_case_scope(principal, None, live.server_id.as_deref())?;
            (
                RestoreOutcome {
                    case: live.clone(),
                    restored: false,
                },
                None,
            )
        } else {
            let delete = latest_recoverable_delete(&ledger.logs, case_id)
                .ok_or(AuthFailure::NotFound)?;
            let mut case = resolve_snapshot(delete, &ledger.logs)?;
            require_case_scope(principal, None, case.server_id.as_deref())?;
            let entry = LogEntry::new(LogAction::CaseRestore, &actor)
                .target(case_id)
                .server(case.server_id.as_deref())
                .details(delete_log_ref_details(&delete.id));
            let now = now_millis();
            case.created_at = now;
            case.updated_at = now;
            ledger.cases.insert(case.id.clone(), case.clone());
            let log = ledger.push_log(entry);
            (
                RestoreOutcome {
                    case,
                    restored: true,
                },
                Some(log),
            )
        }
    };

    if let Some(log) = log {
        tracing::info!(event = "case.restore", outcome = "restored", case_id = %case_id);
        publish_appended(state, std::slice::from_ref(&log));
    } else {
        tracing::info!(event = "case.restore", outcome = "already_live", case_id = %case_id);
    }
    Ok(outcome)
}

async fn restore_case_pg(
    pool: &PgPool,
    principal: &Principal,
    case_id: &str,
    actor: &str,
) -> Result<(RestoreOutcome, Option<LogRecord>), LedgerError> {
    let mut tx = pool.begin().await?;
    lock_case_id(&mut tx, case_id).await?;
    if let Some(live) = select_case_for_update(&mut tx, case_id).await? {
        require_case_scope(principal, None, live.server_id.as_deref())?;
        return Ok((
            RestoreOutcome {
                case: live,
                restored: false,
            },
            None,
        ));
    }
    let history = load_case_history(&mut tx, case_id).await?;
    let delete = latest_recoverable_delete(&history, case_id).ok_or(AuthFailure::NotFound)?;
    let mut case = resolve_snapshot(delete, &history)?;
    require_case_scope(principal, None, case.server_id.as_deref())?;
    let now = now_millis();
    case.created_at = now;
    case.updated_at = now;
    insert_case_row(&mut tx, &case).await?;
    let log = insert_log(
        &mut tx,
        LogEntry::new(LogAction::CaseRestore, actor)
            .target(case_id)
            .server(case.server_id.as_deref())
            .details(delete_log_ref_details(&delete.id)),
    )
    .await?;
    tx.commit().await?;
    Ok((
        RestoreOutcome {
            case,
            restored: true,
        },
        Some(log),
    ))
}

/// Detaches the document link from the recoverable snapshot by appending a
/// `CASE_EMBED_REMOVED` overlay. Fails with `InvalidState` when the snapshot
/// has no link, leaving the log untouched.
pub(crate) async fn remove_case_embed(
    state: &AppState,
    principal: &Principal,
    case_id: &str,
) -> Result<(), AuthFailure> {
    require_role(principal, Operation::RemoveCaseEmbed)?;
    let actor = principal.id();

    let log = if let Some(pool) = ready_pool(state).await? {
        with_log_retry("case.remove_embed", || {
            remove_case_embed_pg(pool, principal, case_id, &actor)
        })
        .await?
    } else {
        let mut ledger = state.ledger.write().await;
        let entry = embed_removal_entry(&ledger.logs, principal, case_id, &actor)?;
        ledger.push_log(entry)
    };
    tracing::info!(event = "case.remove_embed", outcome = "overlay_logged", case_id = %case_id);
    publish_appended(state, std::slice::from_ref(&log));
    Ok(())
}

fn embed_removal_entry(
    history: &[LogRecord],
    principal: &Principal,
    case_id: &str,
    actor: &str,
) -> Result<LogEntry, AuthFailure> {
    let delete = latest_recoverable_delete(history, case_id).ok_or(AuthFailure::NotFound)?;
    let snapshot = resolve_snapshot(delete, history)?;
    require_case_scope(principal, None, snapshot.server_id.as_deref())?;
    if snapshot.google_doc_url.is_none() {
        return Err(AuthFailure::InvalidState);
    }
    Ok(LogEntry::new(LogAction::CaseEmbedRemoved, actor)
        .target(case_id)
        .server(snapshot.server_id.as_deref())
        .details(delete_log_ref_details(&delete.id)))
}

async fn remove_case_embed_pg(
    pool: &PgPool,
    principal: &Principal,
    case_id: &str,
    actor: &str,
) -> Result<LogRecord, LedgerError> {
    let mut tx = pool.begin().await?;
    lock_case_id(&mut tx, case_id).await?;
    let history = load_case_history(&mut tx, case_id).await?;
    let entry = embed_removal_entry(&history, principal, case_id, actor)?;
    let log = insert_log(&mut tx, entry).await?;
    tx.commit().await?;
    Ok(log)
}

/// Removes the recoverable `CASE_DELETE` entry, closing the recovery window,
/// and appends a `CASE_PERMANENTLY_DELETED` marker.
pub(crate) async fn permanently_delete_case(
    state: &AppState,
    principal: &Principal,
    case_id: &str,
) -> Result<(), AuthFailure> {
    require_role(principal, Operation::PermanentlyDeleteCase)?;
    let actor = principal.id();

    let log = if let Some(pool) = ready_pool(state).await? {
        with_log_retry("case.permanent_delete", || {
            permanently_delete_case_pg(pool, principal, case_id, &actor)
        })
        .await?
    } else {
        let mut ledger = state.ledger.write().await;
        let (delete_id, entry) = purge_entry(&ledger.logs, principal, case_id, &actor)?;
        ledger.logs.retain(|record| record.id != delete_id);
        ledger.push_log(entry)
    };
    tracing::info!(event = "case.permanent_delete", outcome = "purged", case_id = %case_id);
    publish_appended(state, std::slice::from_ref(&log));
    Ok(())
}

/// Delete entry to drop and the marker replacing it. Snapshots that no longer
/// parse carry no owning server and stay purgeable.
fn purge_entry(
    history: &[LogRecord],
    principal: &Principal,
    case_id: &str,
    actor: &str,
) -> Result<(String, LogEntry), AuthFailure> {
    let delete = latest_recoverable_delete(history, case_id).ok_or(AuthFailure::NotFound)?;
    let owning_server_id = resolve_snapshot(delete, history)
        .ok()
        .and_then(|snapshot| snapshot.server_id);
    require_case_scope(principal, None, owning_server_id.as_deref())?;
    let entry = LogEntry::new(LogAction::CasePermanentlyDeleted, actor)
        .target(case_id)
        .server(owning_server_id.as_deref())
        .details(delete_log_ref_details(&delete.id));
    Ok((delete.id.clone(), entry))
}

async fn permanently_delete_case_pg(
    pool: &PgPool,
    principal: &Principal,
    case_id: &str,
    actor: &str,
) -> Result<LogRecord, LedgerError> {
    let mut tx = pool.begin().await?;
    lock_case_id(&mut tx, case_id).await?;
    let history = load_case_history(&mut tx, case_id).await?;
    let (delete_id, entry) = purge_entry(&history, principal, case_id, actor)?;
    sqlx::query("DELETE FROM logs WHERE id = $1")
        .bind(&delete_id)
        .execute(&mut *tx)
        .await?;
    let log = insert_log(&mut tx, entry).await?;
    tx.commit().await?;
    Ok(log)
}
