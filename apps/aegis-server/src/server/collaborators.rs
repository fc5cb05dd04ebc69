use aegis_core::UpstreamError;
use anyhow::anyhow;
use futures_util::{future::BoxFuture, FutureExt};
use reqwest::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};

use super::{
    core::{AppState, CaseRecord},
    metrics::{
        record_notification_dropped, NOTIFICATION_KIND_AUDIT, NOTIFICATION_KIND_CASE_CREATED,
        NOTIFICATION_KIND_CASE_PUBLISHED,
    },
    types::LogView,
};

/// Discord `ADMINISTRATOR` permission bit.
pub(crate) const ADMINISTRATOR_PERMISSION: u64 = 0x8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CaseNotice {
    pub(crate) id: String,
    pub(crate) server_id: Option<String>,
    pub(crate) title: String,
    pub(crate) status: &'static str,
    pub(crate) priority: &'static str,
    pub(crate) assigned_agent: String,
}

impl From<&CaseRecord> for CaseNotice {
    fn from(value: &CaseRecord) -> Self {
        Self {
            id: value.id.clone(),
            server_id: value.server_id.clone(),
            title: value.title.clone(),
            status: value.status.as_str(),
            priority: value.priority.as_str(),
            assigned_agent: value.assigned_agent.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub(crate) enum Notification {
    CaseCreated(CaseNotice),
    CasePublished(CaseNotice),
    Audit(LogView),
}

impl Notification {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::CaseCreated(_) => NOTIFICATION_KIND_CASE_CREATED,
            Self::CasePublished(_) => NOTIFICATION_KIND_CASE_PUBLISHED,
            Self::Audit(_) => NOTIFICATION_KIND_AUDIT,
        }
    }
}

/// Outbound messaging collaborator. Implementations must not block.
pub(crate) trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification) -> Result<(), UpstreamError>;
}

pub(crate) struct DisabledNotifier;

impl Notifier for DisabledNotifier {
    fn notify(&self, _notification: Notification) -> Result<(), UpstreamError> {
        Ok(())
    }
}

/// Queues notifications for a background worker that posts them to a webhook.
pub(crate) struct WebhookNotifier {
    tx: mpsc::Sender<Notification>,
}

impl WebhookNotifier {
    pub(crate) fn spawn(
        client: reqwest::Client,
        url: String,
        capacity: usize,
    ) -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| anyhow!("webhook notifier requires a tokio runtime: {e}"))?;
        let (tx, mut rx) = mpsc::channel::<Notification>(capacity.max(1));
        runtime.spawn(async move {
            while let Some(notification) = rx.recv().await {
                let kind = notification.kind();
                let delivered = client
                    .post(&url)
                    .json(&notification)
                    .send()
                    .await
                    .and_then(reqwest::Response::error_for_status);
                if let Err(error) = delivered {
                    tracing::warn!(
                        event = "notify.deliver",
                        outcome = "failed",
                        kind,
                        error = %error
                    );
                    record_notification_dropped(kind);
                }
            }
        });
        Ok(Self { tx })
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, notification: Notification) -> Result<(), UpstreamError> {
        self.tx.try_send(notification).map_err(|error| match error {
            TrySendError::Full(_) => UpstreamError::Unavailable(String::from("queue full")),
            TrySendError::Closed(_) => UpstreamError::Unavailable(String::from("worker stopped")),
        })
    }
}

/// Hands a notification to the configured collaborator; failures are logged
/// and counted, never returned.
pub(crate) fn notify_best_effort(state: &AppState, notification: Notification) {
    let kind = notification.kind();
    if let Err(error) = state.notifier.notify(notification) {
        tracing::warn!(event = "notify.enqueue", outcome = "dropped", kind, error = %error);
        record_notification_dropped(kind);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GuildPermissions {
    pub(crate) is_owner: bool,
    pub(crate) is_admin: bool,
}

/// Real-time view of a member's rights inside a Discord guild.
pub(crate) trait GuildPermissionOracle: Send + Sync {
    fn check_user_guild_permissions<'a>(
        &'a self,
        server_id: &'a str,
        discord_user_id: &'a str,
    ) -> BoxFuture<'a, Result<GuildPermissions, UpstreamError>>;
}

pub(crate) struct UnconfiguredGuildOracle;

impl GuildPermissionOracle for UnconfiguredGuildOracle {
    fn check_user_guild_permissions<'a>(
        &'a self,
        _server_id: &'a str,
        _discord_user_id: &'a str,
    ) -> BoxFuture<'a, Result<GuildPermissions, UpstreamError>> {
        async { Err(UpstreamError::NotConfigured) }.boxed()
    }
}

#[derive(Debug, Deserialize)]
struct GuildRole {
    id: String,
    permissions: String,
}

#[derive(Debug, Deserialize)]
struct GuildObject {
    owner_id: String,
    #[serde(default)]
    roles: Vec<GuildRole>,
}

#[derive(Debug, Deserialize)]
struct GuildMemberObject {
    #[serde(default)]
    roles: Vec<String>,
}

pub(crate) struct DiscordBotOracle {
    client: reqwest::Client,
    api_base_url: String,
    bot_token: String,
}

impl DiscordBotOracle {
    pub(crate) fn new(client: reqwest::Client, api_base_url: String, bot_token: String) -> Self {
        Self {
            client,
            api_base_url,
            bot_token,
        }
    }

    async fn fetch<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, UpstreamError> {
        self.client
            .get(format!("{}{path}", self.api_base_url))
            .header(AUTHORIZATION, format!("Bot {}", self.bot_token))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| UpstreamError::Unavailable(e.to_string()))?
            .json::<T>()
            .await
            .map_err(|e| UpstreamError::Unavailable(e.to_string()))
    }
}

impl GuildPermissionOracle for DiscordBotOracle {
    fn check_user_guild_permissions<'a>(
        &'a self,
        server_id: &'a str,
        discord_user_id: &'a str,
    ) -> BoxFuture<'a, Result<GuildPermissions, UpstreamError>> {
        async move {
            let guild: GuildObject = self.fetch(&format!("/guilds/{server_id}")).await?;
            let member: GuildMemberObject = self
                .fetch(&format!("/guilds/{server_id}/members/{discord_user_id}"))
                .await?;
            let is_owner = guild.owner_id == discord_user_id;
            let is_admin = member_has_administrator(&guild.roles, &member.roles, server_id);
            Ok(GuildPermissions { is_owner, is_admin })
        }
        .boxed()
    }
}

/// The `@everyone` role shares the guild id and applies to every member.
fn member_has_administrator(
    guild_roles: &[GuildRole],
    member_role_ids: &[String],
    server_id: &str,
) -> bool {
    guild_roles
        .iter()
        .filter(|role| role.id == server_id || member_role_ids.contains(&role.id))
        .any(|role| permission_bits_grant_admin(&role.permissions))
}

pub(crate) fn permission_bits_grant_admin(bits: &str) -> bool {
    bits.parse::<u64>()
        .is_ok_and(|value| value & ADMINISTRATOR_PERMISSION != 0)
}

#[cfg(test)]
mod tests {
    use aegis_core::{CasePriority, CaseStatus, UpstreamError};

    use super::{
        member_has_administrator, permission_bits_grant_admin, CaseNotice, GuildPermissionOracle,
        GuildRole, Notification, Notifier, UnconfiguredGuildOracle, WebhookNotifier,
    };
    use crate::server::core::CaseRecord;

    fn role(id: &str, permissions: &str) -> GuildRole {
        GuildRole {
            id: id.to_owned(),
            permissions: permissions.to_owned(),
        }
    }

    fn sample_case() -> CaseRecord {
        CaseRecord {
            id: String::from("CASE-2026-1"),
            server_id: Some(String::from("9001")),
            title: String::from("Project X"),
            description: String::new(),
            status: CaseStatus::Active,
            priority: CasePriority::High,
            assigned_agent: String::from("AGENT_FOX"),
            content: String::from("classified"),
            tags: Vec::new(),
            is_public: false,
            google_doc_url: None,
            case_code: Some(String::from("SHADOW#1234A")),
            created_at: 1,
            updated_at: 1,
        }
    }

    #[test]
    fn administrator_bit_is_read_from_assigned_or_everyone_roles() {
        let roles = vec![role("9001", "0"), role("r-mod", "8"), role("r-chat", "2048")];
        assert!(member_has_administrator(
            &roles,
            &[String::from("r-mod")],
            "9001"
        ));
        assert!(!member_has_administrator(
            &roles,
            &[String::from("r-chat")],
            "9001"
        ));
        let open_roles = vec![role("9001", "8")];
        assert!(member_has_administrator(&open_roles, &[], "9001"));
        assert!(!permission_bits_grant_admin("not-a-number"));
    }

    #[test]
    fn case_notice_omits_content_and_code() {
        let notice = CaseNotice::from(&sample_case());
        let payload = serde_json::to_value(Notification::CaseCreated(notice))
            .expect("notification serializes");
        assert_eq!(payload["kind"], "case_created");
        assert_eq!(payload["payload"]["assignedAgent"], "AGENT_FOX");
        assert!(payload["payload"].get("content").is_none());
        assert!(payload["payload"].get("caseCode").is_none());
    }

    #[tokio::test]
    async fn unconfigured_oracle_reports_not_configured() {
        let result = UnconfiguredGuildOracle
            .check_user_guild_permissions("9001", "4001")
            .await;
        assert_eq!(result, Err(UpstreamError::NotConfigured));
    }

    #[tokio::test]
    async fn full_webhook_queue_reports_unavailable_instead_of_blocking() {
        let notifier = WebhookNotifier::spawn(
            reqwest::Client::new(),
            String::from("http://127.0.0.1:9/hook"),
            1,
        )
        .expect("notifier should spawn");
        let mut outcomes = Vec::new();
        for _ in 0..64 {
            outcomes.push(
                notifier.notify(Notification::CasePublished(CaseNotice::from(&sample_case()))),
            );
        }
        assert!(outcomes
            .iter()
            .any(|outcome| matches!(outcome, Err(UpstreamError::Unavailable(_)))));
    }
}
