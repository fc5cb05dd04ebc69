#![forbid(unsafe_code)]

use rand::{seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};

pub const CASE_ID_PREFIX: &str = "CASE-";
pub const CASE_ID_SEQUENCE_MAX: u32 = 999_999;
pub const CASE_CODE_LEN: usize = 12;
pub const CASE_CODE_SYMBOLS: [char; 7] = ['@', '#', '$', '%', '&', '*', '+'];
const CASE_CODE_WORDS: [&str; 12] = [
    "ALPHA", "BRAVO", "DELTA", "GHOST", "RAVEN", "SHADOW", "CIPHER", "VIPER", "STORM", "OMEGA",
    "SIGMA", "PHANTOM",
];
const CASE_CODE_ALNUM: &[u8; 36] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("role is invalid")]
    InvalidRole,
    #[error("username is invalid")]
    InvalidUsername,
    #[error("discord id is invalid")]
    InvalidDiscordId,
    #[error("case id is invalid")]
    InvalidCaseId,
    #[error("case title is invalid")]
    InvalidCaseTitle,
    #[error("case status is invalid")]
    InvalidCaseStatus,
    #[error("case priority is invalid")]
    InvalidCasePriority,
    #[error("invite code is invalid")]
    InvalidInviteCode,
}

/// Failure reported by an out-of-process collaborator (webhook, bot client).
///
/// Callers log and swallow these; they never abort a core operation.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
    #[error("upstream not configured")]
    NotConfigured,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    Agent,
    Management,
    Overseer,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Agent => "Agent",
            Self::Management => "Management",
            Self::Overseer => "Overseer",
        }
    }
}

impl TryFrom<String> for Role {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "Agent" => Ok(Self::Agent),
            "Management" => Ok(Self::Management),
            "Overseer" => Ok(Self::Overseer),
            _ => Err(DomainError::InvalidRole),
        }
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a stored membership snapshot onto the single effective role.
///
/// Ownership wins over the admin flag.
#[must_use]
pub const fn derive_role(is_owner: bool, is_admin: bool) -> Role {
    if is_owner {
        Role::Overseer
    } else if is_admin {
        Role::Management
    } else {
        Role::Agent
    }
}

/// Every role-gated operation the service exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateCase,
    UpdateCase,
    DeleteCase,
    RestoreCase,
    PermanentlyDeleteCase,
    RemoveCaseEmbed,
    ToggleCaseVisibility,
    EncryptCase,
    DecryptCase,
    ViewLogs,
    ViewRecovery,
    ListUsers,
    ManageUsers,
    ManageInviteCodes,
    ManageServerConfig,
    ManageMembers,
}

const ALL_ROLES: &[Role] = &[Role::Agent, Role::Management, Role::Overseer];
const MANAGEMENT_AND_UP: &[Role] = &[Role::Management, Role::Overseer];
const OVERSEER_ONLY: &[Role] = &[Role::Overseer];

impl Operation {
    #[must_use]
    pub const fn allowed_roles(self) -> &'static [Role] {
        match self {
            Self::CreateCase | Self::UpdateCase => ALL_ROLES,
            Self::DeleteCase
            | Self::RestoreCase
            | Self::PermanentlyDeleteCase
            | Self::EncryptCase
            | Self::DecryptCase
            | Self::ViewLogs
            | Self::ViewRecovery
            | Self::ListUsers => MANAGEMENT_AND_UP,
            Self::RemoveCaseEmbed
            | Self::ToggleCaseVisibility
            | Self::ManageUsers
            | Self::ManageInviteCodes
            | Self::ManageServerConfig
            | Self::ManageMembers => OVERSEER_ONLY,
        }
    }

    #[must_use]
    pub fn permits(self, role: Role) -> bool {
        self.allowed_roles().contains(&role)
    }
}

/// Principal bound to a Discord identity inside one selected server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscordPrincipal {
    pub discord_user_id: String,
    pub server_id: String,
    pub username: String,
    pub role: Role,
    pub ip: String,
}

/// Principal for a username/password account; role is stored on the user row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalPrincipal {
    pub user_id: String,
    pub username: String,
    pub role: Role,
    pub ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Principal {
    Discord(DiscordPrincipal),
    Local(LocalPrincipal),
}

impl Principal {
    /// Stable principal id; `"{discord_user_id}:{server_id}"` for Discord sessions.
    #[must_use]
    pub fn id(&self) -> String {
        match self {
            Self::Discord(principal) => {
                discord_principal_id(&principal.discord_user_id, &principal.server_id)
            }
            Self::Local(principal) => principal.user_id.clone(),
        }
    }

    #[must_use]
    pub fn role(&self) -> Role {
        match self {
            Self::Discord(principal) => principal.role,
            Self::Local(principal) => principal.role,
        }
    }

    #[must_use]
    pub fn username(&self) -> &str {
        match self {
            Self::Discord(principal) => &principal.username,
            Self::Local(principal) => &principal.username,
        }
    }

    #[must_use]
    pub fn ip(&self) -> &str {
        match self {
            Self::Discord(principal) => &principal.ip,
            Self::Local(principal) => &principal.ip,
        }
    }

    #[must_use]
    pub fn server_id(&self) -> Option<&str> {
        match self {
            Self::Discord(principal) => Some(&principal.server_id),
            Self::Local(_) => None,
        }
    }

    #[must_use]
    pub fn discord_user_id(&self) -> Option<&str> {
        match self {
            Self::Discord(principal) => Some(&principal.discord_user_id),
            Self::Local(_) => None,
        }
    }

    /// Identity checked against server membership rows.
    #[must_use]
    pub fn membership_subject(&self) -> String {
        self.discord_user_id()
            .map_or_else(|| self.id(), ToOwned::to_owned)
    }
}

#[must_use]
pub fn discord_principal_id(discord_user_id: &str, server_id: &str) -> String {
    format!("{discord_user_id}:{server_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaseStatus {
    Active,
    Closed,
    Redacted,
}

impl CaseStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "Active",
            Self::Closed => "Closed",
            Self::Redacted => "Redacted",
        }
    }
}

impl TryFrom<String> for CaseStatus {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "Active" => Ok(Self::Active),
            "Closed" => Ok(Self::Closed),
            "Redacted" => Ok(Self::Redacted),
            _ => Err(DomainError::InvalidCaseStatus),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CasePriority {
    Low,
    Medium,
    High,
    Critical,
}

impl CasePriority {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "Low",
            Self::Medium => "Medium",
            Self::High => "High",
            Self::Critical => "Critical",
        }
    }
}

impl TryFrom<String> for CasePriority {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "Low" => Ok(Self::Low),
            "Medium" => Ok(Self::Medium),
            "High" => Ok(Self::High),
            "Critical" => Ok(Self::Critical),
            _ => Err(DomainError::InvalidCasePriority),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CaseId(String);

impl CaseId {
    /// Draws a `CASE-<year>-<n>` id; uniqueness is the caller's concern.
    #[must_use]
    pub fn generate<R: Rng + ?Sized>(year: i32, rng: &mut R) -> Self {
        let sequence = rng.gen_range(0..=CASE_ID_SEQUENCE_MAX);
        Self(format!("{CASE_ID_PREFIX}{year}-{sequence}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl TryFrom<String> for CaseId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let rest = value
            .strip_prefix(CASE_ID_PREFIX)
            .ok_or(DomainError::InvalidCaseId)?;
        let (year, sequence) = rest.split_once('-').ok_or(DomainError::InvalidCaseId)?;
        let year_ok = year.len() == 4 && year.bytes().all(|b| b.is_ascii_digit());
        let sequence_ok =
            (1..=6).contains(&sequence.len()) && sequence.bytes().all(|b| b.is_ascii_digit());
        if year_ok && sequence_ok {
            Ok(Self(value))
        } else {
            Err(DomainError::InvalidCaseId)
        }
    }
}

impl core::fmt::Display for CaseId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generates a human-legible case code: word, symbol, four digits, two alnum.
#[must_use]
pub fn generate_case_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    let word = CASE_CODE_WORDS.choose(rng).copied().unwrap_or("ALPHA");
    let symbol = CASE_CODE_SYMBOLS.choose(rng).copied().unwrap_or('#');
    let digits = rng.gen_range(0..10_000_u32);
    let mut code = format!("{word}{symbol}{digits:04}");
    for _ in 0..2 {
        let index = rng.gen_range(0..CASE_CODE_ALNUM.len());
        code.push(char::from(CASE_CODE_ALNUM[index]));
    }
    code.truncate(CASE_CODE_LEN);
    code
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogAction {
    CaseCreate,
    CaseUpdate,
    CaseDelete,
    CaseRestore,
    CaseEmbedRemoved,
    CasePermanentlyDeleted,
    CasePublicToggle,
    CaseEncrypt,
    CaseDecrypt,
    UserRegister,
    UserLogin,
    UserLogout,
    UserRoleChange,
    UserSuspend,
    UserUnsuspend,
    InviteCreate,
    DiscordLogin,
    ServerSelect,
    MemberAdminSet,
    ServerConfigUpdate,
}

impl LogAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CaseCreate => "CASE_CREATE",
            Self::CaseUpdate => "CASE_UPDATE",
            Self::CaseDelete => "CASE_DELETE",
            Self::CaseRestore => "CASE_RESTORE",
            Self::CaseEmbedRemoved => "CASE_EMBED_REMOVED",
            Self::CasePermanentlyDeleted => "CASE_PERMANENTLY_DELETED",
            Self::CasePublicToggle => "CASE_PUBLIC_TOGGLE",
            Self::CaseEncrypt => "CASE_ENCRYPT",
            Self::CaseDecrypt => "CASE_DECRYPT",
            Self::UserRegister => "USER_REGISTER",
            Self::UserLogin => "USER_LOGIN",
            Self::UserLogout => "USER_LOGOUT",
            Self::UserRoleChange => "USER_ROLE_CHANGE",
            Self::UserSuspend => "USER_SUSPEND",
            Self::UserUnsuspend => "USER_UNSUSPEND",
            Self::InviteCreate => "INVITE_CREATE",
            Self::DiscordLogin => "DISCORD_LOGIN",
            Self::ServerSelect => "SERVER_SELECT",
            Self::MemberAdminSet => "MEMBER_ADMIN_SET",
            Self::ServerConfigUpdate => "SERVER_CONFIG_UPDATE",
        }
    }
}

impl core::fmt::Display for LogAction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One user row as seen by the IP reputation check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpStanding<'a> {
    pub ip: Option<&'a str>,
    pub is_suspended: bool,
}

/// An address is banned iff some suspended user was last seen on it.
#[must_use]
pub fn is_ip_banned<'a, I>(users: I, candidate_ip: &str) -> bool
where
    I: IntoIterator<Item = IpStanding<'a>>,
{
    users
        .into_iter()
        .any(|user| user.is_suspended && user.ip == Some(candidate_ip))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Username(String);

impl Username {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Username {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if !(3..=32).contains(&value.len()) {
            return Err(DomainError::InvalidUsername);
        }
        if value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        {
            return Ok(Self(value));
        }
        Err(DomainError::InvalidUsername)
    }
}

/// Discord snowflake in its decimal string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiscordId(String);

impl DiscordId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DiscordId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if (1..=20).contains(&value.len()) && value.bytes().all(|b| b.is_ascii_digit()) {
            Ok(Self(value))
        } else {
            Err(DomainError::InvalidDiscordId)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CaseTitle(String);

impl CaseTitle {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl TryFrom<String> for CaseTitle {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let len = value.chars().count();
        if (1..=200).contains(&len) && !value.chars().any(char::is_control) {
            Ok(Self(value))
        } else {
            Err(DomainError::InvalidCaseTitle)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InviteCode(String);

impl InviteCode {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for InviteCode {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if (4..=64).contains(&value.len())
            && value
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            Ok(Self(value))
        } else {
            Err(DomainError::InvalidInviteCode)
        }
    }
}
