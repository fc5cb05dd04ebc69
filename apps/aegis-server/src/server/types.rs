use aegis_core::{CasePriority, CaseStatus, Principal, Role};
use axum::{
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    audit::RecoverableCase,
    core::{
        CaseRecord, GuildSummary, InviteCodeRecord, LogRecord, MemberRecord, UserRecord,
        METRICS_TEXT_CONTENT_TYPE,
    },
    metrics::render_metrics,
};

#[derive(Debug, Serialize)]
pub(crate) struct HealthResponse {
    pub(crate) status: &'static str,
}

pub(crate) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub(crate) async fn metrics() -> Response {
    (
        [(CONTENT_TYPE, METRICS_TEXT_CONTENT_TYPE)],
        render_metrics(),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
pub(crate) struct AuthError {
    pub(crate) error: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub(crate) struct RegisterRequest {
    pub(crate) username: String,
    pub(crate) password: String,
    pub(crate) invite_code: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct LoginRequest {
    pub(crate) username: String,
    pub(crate) password: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PrincipalView {
    pub(crate) id: String,
    pub(crate) kind: String,
    pub(crate) username: String,
    pub(crate) role: Role,
    pub(crate) ip: String,
    pub(crate) server_id: Option<String>,
    pub(crate) discord_user_id: Option<String>,
}

impl From<&Principal> for PrincipalView {
    fn from(principal: &Principal) -> Self {
        let kind = match principal {
            Principal::Discord(_) => "discord",
            Principal::Local(_) => "local",
        };
        Self {
            id: principal.id(),
            kind: kind.to_owned(),
            username: principal.username().to_owned(),
            role: principal.role(),
            ip: principal.ip().to_owned(),
            server_id: principal.server_id().map(ToOwned::to_owned),
            discord_user_id: principal.discord_user_id().map(ToOwned::to_owned),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AuthResponse {
    pub(crate) access_token: String,
    pub(crate) expires_in_secs: i64,
    pub(crate) principal: PrincipalView,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UserView {
    pub(crate) id: String,
    pub(crate) username: String,
    pub(crate) role: Role,
    pub(crate) is_suspended: bool,
    pub(crate) ip: Option<String>,
    pub(crate) is_online: bool,
    pub(crate) created_at: i64,
}

impl From<UserRecord> for UserView {
    fn from(user: UserRecord) -> Self {
        Self {
            id: user.id,
            username: user.username,
            role: user.role,
            is_suspended: user.is_suspended,
            ip: user.ip,
            is_online: user.is_online,
            created_at: user.created_at_unix,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct MeResponse {
    pub(crate) principal: PrincipalView,
}

#[derive(Debug, Serialize)]
pub(crate) struct CheckIpResponse {
    pub(crate) ip: String,
    pub(crate) banned: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct DiscordAuthorizeResponse {
    pub(crate) url: String,
    pub(crate) state: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DiscordCallbackQuery {
    pub(crate) code: String,
    pub(crate) state: String,
}

/// Session token for a Discord login that has not picked a server yet.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DiscordSessionResponse {
    pub(crate) access_token: String,
    pub(crate) expires_in_secs: i64,
    pub(crate) discord_user_id: String,
    pub(crate) username: String,
    pub(crate) guilds: Vec<GuildSummary>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ServersResponse {
    pub(crate) servers: Vec<GuildSummary>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub(crate) struct SelectServerRequest {
    pub(crate) server_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub(crate) struct SetMemberAdminRequest {
    pub(crate) is_admin: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MemberView {
    pub(crate) server_id: String,
    pub(crate) discord_user_id: String,
    pub(crate) is_owner: bool,
    pub(crate) is_admin: bool,
    pub(crate) roles: Vec<String>,
}

impl From<MemberRecord> for MemberView {
    fn from(member: MemberRecord) -> Self {
        Self {
            server_id: member.server_id,
            discord_user_id: member.discord_user_id,
            is_owner: member.is_owner,
            is_admin: member.is_admin,
            roles: member.roles,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub(crate) struct CreateCaseRequest {
    pub(crate) title: String,
    #[serde(default)]
    pub(crate) description: String,
    pub(crate) status: Option<CaseStatus>,
    pub(crate) priority: Option<CasePriority>,
    #[serde(default)]
    pub(crate) content: String,
    #[serde(default)]
    pub(crate) tags: Vec<String>,
    pub(crate) google_doc_url: Option<String>,
    pub(crate) server_id: Option<String>,
    /// Accepted for compatibility; new cases always start private.
    pub(crate) is_public: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub(crate) struct UpdateCaseRequest {
    pub(crate) title: Option<String>,
    pub(crate) description: Option<String>,
    pub(crate) status: Option<CaseStatus>,
    pub(crate) priority: Option<CasePriority>,
    pub(crate) content: Option<String>,
    pub(crate) tags: Option<Vec<String>>,
    pub(crate) google_doc_url: Option<String>,
    pub(crate) server_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ServerScopeQuery {
    pub(crate) server_id: Option<String>,
}

/// Case as returned to clients. The access code never leaves the server
/// except through `encrypt`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CaseView {
    pub(crate) id: String,
    pub(crate) server_id: Option<String>,
    pub(crate) title: String,
    pub(crate) description: String,
    pub(crate) status: CaseStatus,
    pub(crate) priority: CasePriority,
    pub(crate) assigned_agent: String,
    pub(crate) content: String,
    pub(crate) tags: Vec<String>,
    pub(crate) is_public: bool,
    pub(crate) google_doc_url: Option<String>,
    pub(crate) is_encrypted: bool,
    pub(crate) created_at: i64,
    pub(crate) updated_at: i64,
}

impl From<CaseRecord> for CaseView {
    fn from(case: CaseRecord) -> Self {
        Self {
            is_encrypted: case.case_code.is_some(),
            id: case.id,
            server_id: case.server_id,
            title: case.title,
            description: case.description,
            status: case.status,
            priority: case.priority,
            assigned_agent: case.assigned_agent,
            content: case.content,
            tags: case.tags,
            is_public: case.is_public,
            google_doc_url: case.google_doc_url,
            created_at: case.created_at,
            updated_at: case.updated_at,
        }
    }
}

/// List entry; body content is only served by the single-case read.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CaseSummary {
    pub(crate) id: String,
    pub(crate) server_id: Option<String>,
    pub(crate) title: String,
    pub(crate) status: CaseStatus,
    pub(crate) priority: CasePriority,
    pub(crate) assigned_agent: String,
    pub(crate) tags: Vec<String>,
    pub(crate) is_public: bool,
    pub(crate) is_encrypted: bool,
    pub(crate) updated_at: i64,
}

impl From<CaseRecord> for CaseSummary {
    fn from(case: CaseRecord) -> Self {
        Self {
            is_encrypted: case.case_code.is_some(),
            id: case.id,
            server_id: case.server_id,
            title: case.title,
            status: case.status,
            priority: case.priority,
            assigned_agent: case.assigned_agent,
            tags: case.tags,
            is_public: case.is_public,
            updated_at: case.updated_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CaseListResponse {
    pub(crate) cases: Vec<CaseSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CaseCodeResponse {
    pub(crate) case_id: String,
    pub(crate) case_code: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct RecoveryListResponse {
    pub(crate) cases: Vec<RecoverableCase>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RestoreResponse {
    pub(crate) case: CaseView,
    pub(crate) restored: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LogQuery {
    pub(crate) limit: Option<usize>,
    pub(crate) action: Option<String>,
}

/// Snapshot fields that never leave the ledger.
const REDACTED_SNAPSHOT_FIELDS: [&str; 2] = ["caseCode", "content"];

/// Audit entry as shown to operators and the notification collaborator. Case
/// snapshots keep their metadata but drop the case code and content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LogView {
    pub(crate) id: String,
    pub(crate) action: String,
    pub(crate) user_id: String,
    pub(crate) target_id: Option<String>,
    pub(crate) server_id: Option<String>,
    pub(crate) details: Option<String>,
    pub(crate) timestamp: i64,
}

fn redact_details(details: &str) -> String {
    let Ok(mut value) = serde_json::from_str::<Value>(details) else {
        return details.to_owned();
    };
    if let Some(snapshot) = value.get_mut("caseData").and_then(Value::as_object_mut) {
        for field in REDACTED_SNAPSHOT_FIELDS {
            snapshot.remove(field);
        }
    }
    value.to_string()
}

impl From<&LogRecord> for LogView {
    fn from(record: &LogRecord) -> Self {
        Self {
            id: record.id.clone(),
            action: record.action.clone(),
            user_id: record.user_id.clone(),
            target_id: record.target_id.clone(),
            server_id: record.server_id.clone(),
            details: record.details.as_deref().map(redact_details),
            timestamp: record.timestamp,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct LogListResponse {
    pub(crate) logs: Vec<LogView>,
}

#[derive(Debug, Serialize)]
pub(crate) struct UserListResponse {
    pub(crate) users: Vec<UserView>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SetRoleRequest {
    pub(crate) role: Role,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct CreateInviteRequest {
    pub(crate) code: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InviteCodeView {
    pub(crate) code: String,
    pub(crate) is_used: bool,
    pub(crate) used_by: Option<String>,
    pub(crate) used_at: Option<i64>,
}

impl From<InviteCodeRecord> for InviteCodeView {
    fn from(invite: InviteCodeRecord) -> Self {
        Self {
            code: invite.code,
            is_used: invite.is_used,
            used_by: invite.used_by,
            used_at: invite.used_at_unix,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InviteListResponse {
    pub(crate) invite_codes: Vec<InviteCodeView>,
}
