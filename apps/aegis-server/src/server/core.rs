use std::{
    collections::{BTreeMap, HashMap},
    sync::{atomic::AtomicU64, Arc, Mutex, OnceLock},
    time::Duration,
};

use aegis_core::{CasePriority, CaseStatus, Principal, Role};
use anyhow::anyhow;
use argon2::password_hash::rand_core::{OsRng, RngCore};
use pasetors::{keys::SymmetricKey, version4::V4};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::sync::{OnceCell, RwLock};

use super::{
    auth::{hash_password, validate_upstream_url},
    collaborators::{
        DisabledNotifier, DiscordBotOracle, GuildPermissionOracle, Notifier,
        UnconfiguredGuildOracle, WebhookNotifier,
    },
    proxy_cidr::ProxyCidr,
};

pub const DEFAULT_JSON_BODY_LIMIT_BYTES: usize = 1_048_576;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_RATE_LIMIT_REQUESTS_PER_MINUTE: u32 = 120;
pub const DEFAULT_AUTH_ROUTE_REQUESTS_PER_MINUTE: u32 = 20;
pub const DEFAULT_SESSION_TTL_SECS: u64 = 12 * 60 * 60;
pub const DEFAULT_NOTIFICATION_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_DISCORD_API_BASE_URL: &str = "https://discord.com/api/v10";
pub const DEFAULT_DISCORD_AUTHORIZE_URL: &str = "https://discord.com/oauth2/authorize";
pub(crate) const OAUTH_STATE_TTL_SECS: i64 = 10 * 60;
pub(crate) const CASE_ID_GENERATION_ATTEMPTS: usize = 8;
pub(crate) const DEFAULT_LOG_LIST_LIMIT: usize = 50;
pub(crate) const MAX_LOG_LIST_LIMIT: usize = 200;
pub(crate) const MAX_CASE_TAGS: usize = 32;
pub(crate) const MAX_CASE_TAG_CHARS: usize = 48;
pub(crate) const MAX_CASE_TEXT_CHARS: usize = 100_000;
pub(crate) const CASE_CODE_HEADER: &str = "x-case-code";
pub(crate) const METRICS_TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

pub(crate) static METRICS_STATE: OnceLock<MetricsState> = OnceLock::new();

#[derive(Default)]
pub(crate) struct MetricsState {
    pub(crate) auth_failures: Mutex<HashMap<&'static str, u64>>,
    pub(crate) notifications_dropped: Mutex<HashMap<&'static str, u64>>,
    pub(crate) ip_gate_rejections: AtomicU64,
    pub(crate) log_append_retries: AtomicU64,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub max_body_bytes: usize,
    pub request_timeout: Duration,
    pub rate_limit_requests_per_minute: u32,
    pub auth_route_requests_per_minute: u32,
    pub session_ttl: Duration,
    pub trusted_proxy_cidrs: Vec<ProxyCidr>,
    pub database_url: Option<String>,
    pub discord_client_id: Option<String>,
    pub discord_client_secret: Option<String>,
    pub discord_redirect_uri: Option<String>,
    pub discord_api_base_url: String,
    pub discord_authorize_url: String,
    pub discord_bot_token: Option<String>,
    pub webhook_url: Option<String>,
    pub upstream_timeout: Duration,
    pub notification_queue_capacity: usize,
    pub bootstrap_invite_codes: Vec<String>,
    /// Local usernames that register as `Overseer` instead of `Agent`.
    pub bootstrap_overseers: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: DEFAULT_JSON_BODY_LIMIT_BYTES,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            rate_limit_requests_per_minute: DEFAULT_RATE_LIMIT_REQUESTS_PER_MINUTE,
            auth_route_requests_per_minute: DEFAULT_AUTH_ROUTE_REQUESTS_PER_MINUTE,
            session_ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
            trusted_proxy_cidrs: Vec::new(),
            database_url: None,
            discord_client_id: None,
            discord_client_secret: None,
            discord_redirect_uri: None,
            discord_api_base_url: String::from(DEFAULT_DISCORD_API_BASE_URL),
            discord_authorize_url: String::from(DEFAULT_DISCORD_AUTHORIZE_URL),
            discord_bot_token: None,
            webhook_url: None,
            upstream_timeout: Duration::from_secs(DEFAULT_UPSTREAM_TIMEOUT_SECS),
            notification_queue_capacity: DEFAULT_NOTIFICATION_QUEUE_CAPACITY,
            bootstrap_invite_codes: Vec::new(),
            bootstrap_overseers: Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct DiscordOAuthConfig {
    pub(crate) client_id: String,
    pub(crate) client_secret: String,
    pub(crate) redirect_uri: String,
    pub(crate) api_base_url: String,
    pub(crate) authorize_url: String,
}

#[derive(Clone, Debug)]
pub(crate) struct RuntimeConfig {
    pub(crate) auth_route_requests_per_minute: u32,
    pub(crate) session_ttl_secs: i64,
    pub(crate) trusted_proxy_cidrs: Vec<ProxyCidr>,
    pub(crate) discord: Option<DiscordOAuthConfig>,
    pub(crate) bootstrap_invite_codes: Vec<String>,
    pub(crate) bootstrap_overseers: Vec<String>,
}

#[derive(Clone)]
pub struct AppState {
    pub(crate) db_pool: Option<PgPool>,
    pub(crate) db_init: Arc<OnceCell<()>>,
    pub(crate) users: Arc<RwLock<HashMap<String, UserRecord>>>,
    pub(crate) discord_accounts: Arc<RwLock<HashMap<String, DiscordAccountRecord>>>,
    pub(crate) workspaces: Arc<RwLock<HashMap<String, WorkspaceRecord>>>,
    pub(crate) members: Arc<RwLock<HashMap<(String, String), MemberRecord>>>,
    pub(crate) invite_codes: Arc<RwLock<HashMap<String, InviteCodeRecord>>>,
    pub(crate) ledger: Arc<RwLock<CaseLedger>>,
    pub(crate) sessions: Arc<RwLock<HashMap<String, SessionRecord>>>,
    pub(crate) oauth_states: Arc<RwLock<HashMap<String, i64>>>,
    pub(crate) server_configs: Arc<RwLock<HashMap<String, ServerSecurityConfig>>>,
    pub(crate) auth_route_hits: Arc<RwLock<HashMap<String, Vec<i64>>>>,
    pub(crate) token_key: Arc<SymmetricKey<V4>>,
    pub(crate) dummy_password_hash: Arc<String>,
    pub(crate) http_client: reqwest::Client,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) guild_oracle: Arc<dyn GuildPermissionOracle>,
    pub(crate) runtime: Arc<RuntimeConfig>,
}

impl AppState {
    pub(crate) fn new(config: &AppConfig) -> anyhow::Result<Self> {
        let mut key_bytes = [0_u8; 32];
        OsRng.fill_bytes(&mut key_bytes);
        let token_key = SymmetricKey::<V4>::from(&key_bytes)
            .map_err(|e| anyhow!("token key init failed: {e}"))?;
        let dummy_password_hash = hash_password("aegis-dummy-password")?;
        let db_pool = if let Some(database_url) = &config.database_url {
            Some(
                PgPoolOptions::new()
                    .max_connections(10)
                    .connect_lazy(database_url)
                    .map_err(|e| anyhow!("postgres pool init failed: {e}"))?,
            )
        } else {
            None
        };
        let http_client = reqwest::Client::builder()
            .timeout(config.upstream_timeout)
            .build()
            .map_err(|e| anyhow!("http client init failed: {e}"))?;

        let notifier: Arc<dyn Notifier> = match &config.webhook_url {
            Some(url) => Arc::new(WebhookNotifier::spawn(
                http_client.clone(),
                validate_upstream_url(url, "webhook url")?,
                config.notification_queue_capacity,
            )?),
            None => Arc::new(DisabledNotifier),
        };
        let guild_oracle: Arc<dyn GuildPermissionOracle> = match &config.discord_bot_token {
            Some(token) if !token.trim().is_empty() => Arc::new(DiscordBotOracle::new(
                http_client.clone(),
                validate_upstream_url(&config.discord_api_base_url, "discord api base url")?,
                token.trim().to_owned(),
            )),
            _ => Arc::new(UnconfiguredGuildOracle),
        };

        let invite_codes = config
            .bootstrap_invite_codes
            .iter()
            .map(|code| (code.clone(), InviteCodeRecord::unused(code.clone())))
            .collect();

        Ok(Self {
            db_pool,
            db_init: Arc::new(OnceCell::new()),
            users: Arc::new(RwLock::new(HashMap::new())),
            discord_accounts: Arc::new(RwLock::new(HashMap::new())),
            workspaces: Arc::new(RwLock::new(HashMap::new())),
            members: Arc::new(RwLock::new(HashMap::new())),
            invite_codes: Arc::new(RwLock::new(invite_codes)),
            ledger: Arc::new(RwLock::new(CaseLedger::default())),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            oauth_states: Arc::new(RwLock::new(HashMap::new())),
            server_configs: Arc::new(RwLock::new(HashMap::new())),
            auth_route_hits: Arc::new(RwLock::new(HashMap::new())),
            token_key: Arc::new(token_key),
            dummy_password_hash: Arc::new(dummy_password_hash),
            http_client,
            notifier,
            guild_oracle,
            runtime: Arc::new(RuntimeConfig {
                auth_route_requests_per_minute: config.auth_route_requests_per_minute,
                session_ttl_secs: i64::try_from(config.session_ttl.as_secs())
                    .unwrap_or(i64::MAX),
                trusted_proxy_cidrs: config.trusted_proxy_cidrs.clone(),
                discord: build_discord_oauth_config(config)?,
                bootstrap_invite_codes: config.bootstrap_invite_codes.clone(),
                bootstrap_overseers: config.bootstrap_overseers.clone(),
            }),
        })
    }
}

fn build_discord_oauth_config(config: &AppConfig) -> anyhow::Result<Option<DiscordOAuthConfig>> {
    match (
        &config.discord_client_id,
        &config.discord_client_secret,
        &config.discord_redirect_uri,
    ) {
        (None, None, None) => Ok(None),
        (Some(client_id), Some(client_secret), Some(redirect_uri)) => {
            let client_id = client_id.trim();
            let client_secret = client_secret.trim();
            if client_id.is_empty() || client_secret.is_empty() {
                return Err(anyhow!("discord client id and secret cannot be empty"));
            }
            Ok(Some(DiscordOAuthConfig {
                client_id: client_id.to_owned(),
                client_secret: client_secret.to_owned(),
                redirect_uri: validate_upstream_url(redirect_uri, "discord redirect uri")?,
                api_base_url: validate_upstream_url(
                    &config.discord_api_base_url,
                    "discord api base url",
                )?,
                authorize_url: validate_upstream_url(
                    &config.discord_authorize_url,
                    "discord authorize url",
                )?,
            }))
        }
        _ => Err(anyhow!(
            "discord client id, client secret and redirect uri must be set together"
        )),
    }
}

/// Legacy username/password account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UserRecord {
    pub(crate) id: String,
    pub(crate) username: String,
    pub(crate) password_hash: String,
    pub(crate) role: Role,
    pub(crate) is_suspended: bool,
    pub(crate) ip: Option<String>,
    pub(crate) is_online: bool,
    pub(crate) created_at_unix: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct DiscordAccountRecord {
    pub(crate) discord_id: String,
    pub(crate) username: String,
    pub(crate) access_token: String,
    pub(crate) refresh_token: Option<String>,
    pub(crate) expires_at_unix: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WorkspaceRecord {
    pub(crate) server_id: String,
    pub(crate) server_name: String,
    pub(crate) owner_id: String,
}

/// Stored membership snapshot; the only input to role derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MemberRecord {
    pub(crate) server_id: String,
    pub(crate) discord_user_id: String,
    pub(crate) is_owner: bool,
    pub(crate) is_admin: bool,
    pub(crate) roles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InviteCodeRecord {
    pub(crate) code: String,
    pub(crate) is_used: bool,
    pub(crate) used_by: Option<String>,
    pub(crate) used_at_unix: Option<i64>,
}

impl InviteCodeRecord {
    pub(crate) fn unused(code: String) -> Self {
        Self {
            code,
            is_used: false,
            used_by: None,
            used_at_unix: None,
        }
    }
}

/// Live case row. Serialized form doubles as the `caseData` delete snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CaseRecord {
    pub(crate) id: String,
    #[serde(default)]
    pub(crate) server_id: Option<String>,
    pub(crate) title: String,
    #[serde(default)]
    pub(crate) description: String,
    pub(crate) status: CaseStatus,
    pub(crate) priority: CasePriority,
    pub(crate) assigned_agent: String,
    #[serde(default)]
    pub(crate) content: String,
    #[serde(default)]
    pub(crate) tags: Vec<String>,
    #[serde(default)]
    pub(crate) is_public: bool,
    #[serde(default)]
    pub(crate) google_doc_url: Option<String>,
    #[serde(default)]
    pub(crate) case_code: Option<String>,
    #[serde(default)]
    pub(crate) created_at: i64,
    #[serde(default)]
    pub(crate) updated_at: i64,
}

/// Stored audit entry. Leaves the process only through `LogView`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LogRecord {
    pub(crate) id: String,
    pub(crate) action: String,
    pub(crate) user_id: String,
    pub(crate) target_id: Option<String>,
    /// Server the entry belongs to; `None` for account-level events.
    pub(crate) server_id: Option<String>,
    pub(crate) details: Option<String>,
    pub(crate) timestamp: i64,
    pub(crate) seq: i64,
}

/// In-memory case table and audit log, guarded together so multi-step
/// lifecycle sequences observe and mutate one consistent view.
#[derive(Debug, Default)]
pub(crate) struct CaseLedger {
    pub(crate) cases: HashMap<String, CaseRecord>,
    pub(crate) logs: Vec<LogRecord>,
    pub(crate) next_seq: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GuildSummary {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) is_owner: bool,
    pub(crate) is_admin: bool,
}

/// Discord identity attached to a session before and after server selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct DiscordSessionContext {
    pub(crate) discord_user_id: String,
    pub(crate) username: String,
    pub(crate) guilds: Vec<GuildSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SessionRecord {
    pub(crate) principal: Option<Principal>,
    pub(crate) discord: Option<DiscordSessionContext>,
    pub(crate) local_user_id: Option<String>,
    pub(crate) expires_at_unix: i64,
    pub(crate) revoked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ServerSecurityConfig {
    pub(crate) raid_protection: bool,
    pub(crate) join_rate_threshold: u32,
    pub(crate) command_permissions: BTreeMap<String, Role>,
}

impl Default for ServerSecurityConfig {
    fn default() -> Self {
        Self {
            raid_protection: false,
            join_rate_threshold: 10,
            command_permissions: BTreeMap::new(),
        }
    }
}
