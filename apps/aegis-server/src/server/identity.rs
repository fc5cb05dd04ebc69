use std::collections::hash_map::Entry;

use aegis_core::{LogAction, Role};
use serde_json::json;
use sqlx::{postgres::PgRow, PgPool, Row};
use ulid::Ulid;

use super::{
    audit::{insert_log, with_log_retry, LedgerError, LogEntry},
    auth::now_unix,
    core::{
        AppState, DiscordAccountRecord, InviteCodeRecord, LogRecord, MemberRecord, UserRecord,
        WorkspaceRecord,
    },
    db::ready_pool,
    errors::{is_unique_violation, AuthFailure},
};

const WORKSPACE_PLACEHOLDER_NAME: &str = "Unnamed Server";

fn workspace_from_row(row: &PgRow) -> Result<WorkspaceRecord, AuthFailure> {
    Ok(WorkspaceRecord {
        server_id: row.try_get("server_id")?,
        server_name: row.try_get("server_name")?,
        owner_id: row.try_get("owner_id")?,
    })
}

fn member_from_row(row: &PgRow) -> Result<MemberRecord, AuthFailure> {
    let roles_json: String = row.try_get("roles_json")?;
    Ok(MemberRecord {
        server_id: row.try_get("server_id")?,
        discord_user_id: row.try_get("discord_user_id")?,
        is_owner: row.try_get("is_owner")?,
        is_admin: row.try_get("is_admin")?,
        roles: serde_json::from_str(&roles_json).unwrap_or_default(),
    })
}

fn user_from_row(row: &PgRow) -> Result<UserRecord, AuthFailure> {
    let role: String = row.try_get("role")?;
    Ok(UserRecord {
        id: row.try_get("user_id")?,
        username: row.try_get("username")?,
        password_hash: row.try_get("password_hash")?,
        role: Role::try_from(role).map_err(|_| AuthFailure::Internal)?,
        is_suspended: row.try_get("is_suspended")?,
        ip: row.try_get("ip")?,
        is_online: row.try_get("is_online")?,
        created_at_unix: row.try_get("created_at_unix")?,
    })
}

fn invite_from_row(row: &PgRow) -> Result<InviteCodeRecord, AuthFailure> {
    Ok(InviteCodeRecord {
        code: row.try_get("code")?,
        is_used: row.try_get("is_used")?,
        used_by: row.try_get("used_by")?,
        used_at_unix: row.try_get("used_at_unix")?,
    })
}

pub(crate) async fn upsert_discord_account(
    state: &AppState,
    account: DiscordAccountRecord,
) -> Result<(), AuthFailure> {
    if let Some(pool) = ready_pool(state).await? {
        sqlx::query(
            "INSERT INTO discord_accounts
                (discord_id, username, access_token, refresh_token, expires_at_unix, updated_at_unix)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (discord_id) DO UPDATE SET
                username = EXCLUDED.username,
                access_token = EXCLUDED.access_token,
                refresh_token = EXCLUDED.refresh_token,
                expires_at_unix = EXCLUDED.expires_at_unix,
                updated_at_unix = EXCLUDED.updated_at_unix",
        )
        .bind(&account.discord_id)
        .bind(&account.username)
        .bind(&account.access_token)
        .bind(&account.refresh_token)
        .bind(account.expires_at_unix)
        .bind(now_unix())
        .execute(pool)
        .await?;
        return Ok(());
    }

    state
        .discord_accounts
        .write()
        .await
        .insert(account.discord_id.clone(), account);
    Ok(())
}

pub(crate) async fn find_workspace(
    state: &AppState,
    server_id: &str,
) -> Result<Option<WorkspaceRecord>, AuthFailure> {
    if let Some(pool) = ready_pool(state).await? {
        let row = sqlx::query(
            "SELECT server_id, server_name, owner_id FROM server_workspaces WHERE server_id = $1",
        )
        .bind(server_id)
        .fetch_optional(pool)
        .await?;
        return row.as_ref().map(workspace_from_row).transpose();
    }
    Ok(state.workspaces.read().await.get(server_id).cloned())
}

/// Returns the workspace for `server_id`, creating it on first sight. A
/// concurrent creator winning the insert is resolved by re-reading its row.
pub(crate) async fn ensure_workspace(
    state: &AppState,
    server_id: &str,
    server_name: Option<&str>,
    owner_id: &str,
) -> Result<WorkspaceRecord, AuthFailure> {
    let server_name = server_name
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(WORKSPACE_PLACEHOLDER_NAME);

    if let Some(pool) = ready_pool(state).await? {
        if let Some(existing) = find_workspace(state, server_id).await? {
            return Ok(existing);
        }
        let inserted = sqlx::query(
            "INSERT INTO server_workspaces (server_id, server_name, owner_id, created_at_unix)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(server_id)
        .bind(server_name)
        .bind(owner_id)
        .bind(now_unix())
        .execute(pool)
        .await;
        match inserted {
            Ok(_) => {
                tracing::info!(event = "identity.workspace", outcome = "created", server_id = %server_id);
            }
            Err(error) if is_unique_violation(&error) => {
                tracing::info!(event = "identity.workspace", outcome = "insert_race_refetch", server_id = %server_id);
            }
            Err(error) => return Err(error.into()),
        }
        return find_workspace(state, server_id)
            .await?
            .ok_or(AuthFailure::Internal);
    }

    let mut workspaces = state.workspaces.write().await;
    let record = workspaces
        .entry(server_id.to_owned())
        .or_insert_with(|| {
            tracing::info!(event = "identity.workspace", outcome = "created", server_id = %server_id);
            WorkspaceRecord {
                server_id: server_id.to_owned(),
                server_name: server_name.to_owned(),
                owner_id: owner_id.to_owned(),
            }
        });
    Ok(record.clone())
}

pub(crate) async fn find_member(
    state: &AppState,
    server_id: &str,
    discord_user_id: &str,
) -> Result<Option<MemberRecord>, AuthFailure> {
    if let Some(pool) = ready_pool(state).await? {
        let row = sqlx::query(
            "SELECT server_id, discord_user_id, is_owner, is_admin, roles_json
             FROM server_members
             WHERE server_id = $1 AND discord_user_id = $2",
        )
        .bind(server_id)
        .bind(discord_user_id)
        .fetch_optional(pool)
        .await?;
        return row.as_ref().map(member_from_row).transpose();
    }
    Ok(state
        .members
        .read()
        .await
        .get(&(server_id.to_owned(), discord_user_id.to_owned()))
        .cloned())
}

/// Returns the membership row, creating it with `is_admin = false` when absent.
pub(crate) async fn ensure_member(
    state: &AppState,
    server_id: &str,
    discord_user_id: &str,
    is_owner: bool,
) -> Result<MemberRecord, AuthFailure> {
    if let Some(pool) = ready_pool(state).await? {
        if let Some(existing) = find_member(state, server_id, discord_user_id).await? {
            return Ok(existing);
        }
        let inserted = sqlx::query(
            "INSERT INTO server_members (server_id, discord_user_id, is_owner, is_admin, roles_json)
             VALUES ($1, $2, $3, FALSE, '[]')",
        )
        .bind(server_id)
        .bind(discord_user_id)
        .bind(is_owner)
        .execute(pool)
        .await;
        match inserted {
            Ok(_) => {}
            Err(error) if is_unique_violation(&error) => {
                tracing::info!(
                    event = "identity.member",
                    outcome = "insert_race_refetch",
                    server_id = %server_id
                );
            }
            Err(error) => return Err(error.into()),
        }
        return find_member(state, server_id, discord_user_id)
            .await?
            .ok_or(AuthFailure::Internal);
    }

    let mut members = state.members.write().await;
    let record = members
        .entry((server_id.to_owned(), discord_user_id.to_owned()))
        .or_insert_with(|| MemberRecord {
            server_id: server_id.to_owned(),
            discord_user_id: discord_user_id.to_owned(),
            is_owner,
            is_admin: false,
            roles: Vec::new(),
        });
    Ok(record.clone())
}

/// Overwrites the owner/admin snapshot of an existing membership. Returns
/// `false` when no membership row exists yet.
pub(crate) async fn refresh_member_snapshot(
    state: &AppState,
    server_id: &str,
    discord_user_id: &str,
    is_owner: bool,
    is_admin: bool,
) -> Result<bool, AuthFailure> {
    if let Some(pool) = ready_pool(state).await? {
        let result = sqlx::query(
            "UPDATE server_members SET is_owner = $3, is_admin = $4
             WHERE server_id = $1 AND discord_user_id = $2",
        )
        .bind(server_id)
        .bind(discord_user_id)
        .bind(is_owner)
        .bind(is_admin)
        .execute(pool)
        .await?;
        return Ok(result.rows_affected() > 0);
    }

    let mut members = state.members.write().await;
    let Some(member) = members.get_mut(&(server_id.to_owned(), discord_user_id.to_owned())) else {
        return Ok(false);
    };
    member.is_owner = is_owner;
    member.is_admin = is_admin;
    Ok(true)
}

pub(crate) async fn set_member_admin(
    state: &AppState,
    server_id: &str,
    discord_user_id: &str,
    is_admin: bool,
) -> Result<MemberRecord, AuthFailure> {
    if let Some(pool) = ready_pool(state).await? {
        let row = sqlx::query(
            "UPDATE server_members SET is_admin = $3
             WHERE server_id = $1 AND discord_user_id = $2
             RETURNING server_id, discord_user_id, is_owner, is_admin, roles_json",
        )
        .bind(server_id)
        .bind(discord_user_id)
        .bind(is_admin)
        .fetch_optional(pool)
        .await?;
        return row
            .as_ref()
            .map(member_from_row)
            .transpose()?
            .ok_or(AuthFailure::NotFound);
    }

    let mut members = state.members.write().await;
    let member = members
        .get_mut(&(server_id.to_owned(), discord_user_id.to_owned()))
        .ok_or(AuthFailure::NotFound)?;
    member.is_admin = is_admin;
    Ok(member.clone())
}

/// Creates a legacy account by consuming a single-use invite code and appends
/// `USER_REGISTER` in the same unit. New accounts start as `Agent` unless the
/// username is configured as a bootstrap Overseer.
pub(crate) async fn register_local_user(
    state: &AppState,
    username: &str,
    password_hash: String,
    invite_code: &str,
    ip: Option<String>,
) -> Result<(UserRecord, LogRecord), AuthFailure> {
    let now = now_unix();
    let role = if state
        .runtime
        .bootstrap_overseers
        .iter()
        .any(|name| name == username)
    {
        Role::Overseer
    } else {
        Role::Agent
    };
    let user = UserRecord {
        id: Ulid::new().to_string(),
        username: username.to_owned(),
        password_hash,
        role,
        is_suspended: false,
        ip,
        is_online: false,
        created_at_unix: now,
    };

    if let Some(pool) = ready_pool(state).await? {
        let log = with_log_retry("auth.register", || {
            register_local_user_pg(pool, &user, invite_code, now)
        })
        .await?;
        return Ok((user, log));
    }

    let mut users = state.users.write().await;
    if users.values().any(|existing| existing.username == username) {
        return Err(AuthFailure::Conflict);
    }
    let mut invites = state.invite_codes.write().await;
    let invite = invites
        .get_mut(invite_code)
        .filter(|invite| !invite.is_used)
        .ok_or(AuthFailure::InvalidRequest)?;
    invite.is_used = true;
    invite.used_by = Some(user.id.clone());
    invite.used_at_unix = Some(now);
    users.insert(user.id.clone(), user.clone());
    let log = state.ledger.write().await.push_log(register_entry(&user));
    Ok((user, log))
}

fn register_entry(user: &UserRecord) -> LogEntry {
    LogEntry::new(LogAction::UserRegister, &user.id)
        .target(&user.id)
        .details(json!({ "username": user.username, "role": user.role.as_str() }))
}

async fn register_local_user_pg(
    pool: &PgPool,
    user: &UserRecord,
    invite_code: &str,
    now: i64,
) -> Result<LogRecord, LedgerError> {
    let mut tx = pool.begin().await?;
    let invite = sqlx::query("SELECT is_used FROM invite_codes WHERE code = $1 FOR UPDATE")
        .bind(invite_code)
        .fetch_optional(&mut *tx)
        .await?;
    let invite_open = match invite {
        Some(row) => !row.try_get::<bool, _>("is_used")?,
        None => false,
    };
    if !invite_open {
        return Err(AuthFailure::InvalidRequest.into());
    }
    let inserted = sqlx::query(
        "INSERT INTO users
            (user_id, username, password_hash, role, is_suspended, ip, is_online, created_at_unix)
         VALUES ($1, $2, $3, $4, FALSE, $5, FALSE, $6)",
    )
    .bind(&user.id)
    .bind(&user.username)
    .bind(&user.password_hash)
    .bind(user.role.as_str())
    .bind(&user.ip)
    .bind(now)
    .execute(&mut *tx)
    .await;
    match inserted {
        Ok(_) => {}
        Err(error) if is_unique_violation(&error) => return Err(AuthFailure::Conflict.into()),
        Err(error) => return Err(error.into()),
    }
    sqlx::query(
        "UPDATE invite_codes SET is_used = TRUE, used_by = $2, used_at_unix = $3
         WHERE code = $1",
    )
    .bind(invite_code)
    .bind(&user.id)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    let log = insert_log(&mut tx, register_entry(user)).await?;
    tx.commit().await?;
    Ok(log)
}

const USER_COLUMNS: &str =
    "user_id, username, password_hash, role, is_suspended, ip, is_online, created_at_unix";

pub(crate) async fn find_user_by_username(
    state: &AppState,
    username: &str,
) -> Result<Option<UserRecord>, AuthFailure> {
    if let Some(pool) = ready_pool(state).await? {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = $1"
        ))
        .bind(username)
        .fetch_optional(pool)
        .await?;
        return row.as_ref().map(user_from_row).transpose();
    }
    Ok(state
        .users
        .read()
        .await
        .values()
        .find(|user| user.username == username)
        .cloned())
}

pub(crate) async fn list_users(state: &AppState) -> Result<Vec<UserRecord>, AuthFailure> {
    if let Some(pool) = ready_pool(state).await? {
        let rows = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users ORDER BY created_at_unix ASC, username ASC"
        ))
        .fetch_all(pool)
        .await?;
        return rows.iter().map(user_from_row).collect();
    }
    let mut users: Vec<_> = state.users.read().await.values().cloned().collect();
    users.sort_by(|a, b| {
        a.created_at_unix
            .cmp(&b.created_at_unix)
            .then_with(|| a.username.cmp(&b.username))
    });
    Ok(users)
}

/// Records a successful login: last-seen IP and online flag.
pub(crate) async fn mark_user_login(
    state: &AppState,
    user_id: &str,
    ip: Option<String>,
) -> Result<(), AuthFailure> {
    if let Some(pool) = ready_pool(state).await? {
        sqlx::query(
            "UPDATE users SET ip = COALESCE($2, ip), is_online = TRUE WHERE user_id = $1",
        )
        .bind(user_id)
        .bind(ip)
        .execute(pool)
        .await?;
        return Ok(());
    }
    if let Some(user) = state.users.write().await.get_mut(user_id) {
        if ip.is_some() {
            user.ip = ip;
        }
        user.is_online = true;
    }
    Ok(())
}

pub(crate) async fn mark_user_offline(state: &AppState, user_id: &str) -> Result<(), AuthFailure> {
    if let Some(pool) = ready_pool(state).await? {
        sqlx::query("UPDATE users SET is_online = FALSE WHERE user_id = $1")
            .bind(user_id)
            .execute(pool)
            .await?;
        return Ok(());
    }
    if let Some(user) = state.users.write().await.get_mut(user_id) {
        user.is_online = false;
    }
    Ok(())
}

/// Changes a local user's stored role. Returns the previous role.
pub(crate) async fn set_user_role(
    state: &AppState,
    user_id: &str,
    role: Role,
) -> Result<(UserRecord, Role), AuthFailure> {
    if let Some(pool) = ready_pool(state).await? {
        let mut tx = pool.begin().await?;
        let previous = sqlx::query("SELECT role FROM users WHERE user_id = $1 FOR UPDATE")
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(AuthFailure::NotFound)?;
        let previous: String = previous.try_get("role")?;
        let previous = Role::try_from(previous).map_err(|_| AuthFailure::Internal)?;
        let row = sqlx::query(&format!(
            "UPDATE users SET role = $2 WHERE user_id = $1 RETURNING {USER_COLUMNS}"
        ))
        .bind(user_id)
        .bind(role.as_str())
        .fetch_one(&mut *tx)
        .await?;
        let user = user_from_row(&row)?;
        tx.commit().await?;
        return Ok((user, previous));
    }

    let mut users = state.users.write().await;
    let user = users.get_mut(user_id).ok_or(AuthFailure::NotFound)?;
    let previous = user.role;
    user.role = role;
    Ok((user.clone(), previous))
}

pub(crate) async fn set_user_suspended(
    state: &AppState,
    user_id: &str,
    is_suspended: bool,
) -> Result<UserRecord, AuthFailure> {
    if let Some(pool) = ready_pool(state).await? {
        let row = sqlx::query(&format!(
            "UPDATE users SET is_suspended = $2, is_online = is_online AND NOT $2
             WHERE user_id = $1 RETURNING {USER_COLUMNS}"
        ))
        .bind(user_id)
        .bind(is_suspended)
        .fetch_optional(pool)
        .await?;
        return row
            .as_ref()
            .map(user_from_row)
            .transpose()?
            .ok_or(AuthFailure::NotFound);
    }

    let mut users = state.users.write().await;
    let user = users.get_mut(user_id).ok_or(AuthFailure::NotFound)?;
    user.is_suspended = is_suspended;
    if is_suspended {
        user.is_online = false;
    }
    Ok(user.clone())
}

pub(crate) async fn create_invite_code(
    state: &AppState,
    code: &str,
) -> Result<InviteCodeRecord, AuthFailure> {
    if let Some(pool) = ready_pool(state).await? {
        let inserted = sqlx::query("INSERT INTO invite_codes (code, is_used) VALUES ($1, FALSE)")
            .bind(code)
            .execute(pool)
            .await;
        return match inserted {
            Ok(_) => Ok(InviteCodeRecord::unused(code.to_owned())),
            Err(error) if is_unique_violation(&error) => Err(AuthFailure::Conflict),
            Err(error) => Err(error.into()),
        };
    }

    match state.invite_codes.write().await.entry(code.to_owned()) {
        Entry::Occupied(_) => Err(AuthFailure::Conflict),
        Entry::Vacant(slot) => Ok(slot
            .insert(InviteCodeRecord::unused(code.to_owned()))
            .clone()),
    }
}

pub(crate) async fn list_invite_codes(
    state: &AppState,
) -> Result<Vec<InviteCodeRecord>, AuthFailure> {
    if let Some(pool) = ready_pool(state).await? {
        let rows = sqlx::query(
            "SELECT code, is_used, used_by, used_at_unix FROM invite_codes ORDER BY code ASC",
        )
        .fetch_all(pool)
        .await?;
        return rows.iter().map(invite_from_row).collect();
    }
    let mut invites: Vec<_> = state.invite_codes.read().await.values().cloned().collect();
    invites.sort_by(|a, b| a.code.cmp(&b.code));
    Ok(invites)
}

#[cfg(test)]
mod tests {
    use aegis_core::Role;

    use super::{
        create_invite_code, ensure_member, ensure_workspace, find_user_by_username,
        refresh_member_snapshot, register_local_user, set_member_admin, set_user_role,
    };
    use crate::server::{
        core::{AppConfig, AppState},
        errors::AuthFailure,
    };

    fn state_with_invites(codes: &[&str]) -> AppState {
        let config = AppConfig {
            bootstrap_invite_codes: codes.iter().map(|code| (*code).to_owned()).collect(),
            ..AppConfig::default()
        };
        AppState::new(&config).expect("state should initialize")
    }

    #[tokio::test]
    async fn first_workspace_creator_is_recorded_as_owner() {
        let state = state_with_invites(&[]);
        let first = ensure_workspace(&state, "9001", Some("Ops"), "4001")
            .await
            .expect("workspace created");
        let second = ensure_workspace(&state, "9001", Some("Renamed"), "4002")
            .await
            .expect("workspace fetched");
        assert_eq!(first, second);
        assert_eq!(second.owner_id, "4001");
        assert_eq!(second.server_name, "Ops");
    }

    #[tokio::test]
    async fn member_creation_is_idempotent_and_snapshot_refresh_needs_existing_row() {
        let state = state_with_invites(&[]);
        assert!(!refresh_member_snapshot(&state, "9001", "4002", false, true)
            .await
            .expect("refresh runs"));
        let created = ensure_member(&state, "9001", "4002", false)
            .await
            .expect("member created");
        assert!(!created.is_admin);
        let again = ensure_member(&state, "9001", "4002", true)
            .await
            .expect("member fetched");
        assert_eq!(created, again);
        assert_eq!(state.members.read().await.len(), 1);
        assert!(refresh_member_snapshot(&state, "9001", "4002", false, true)
            .await
            .expect("refresh runs"));
        let admin = set_member_admin(&state, "9001", "4002", false)
            .await
            .expect("member exists");
        assert!(!admin.is_admin);
        assert_eq!(
            set_member_admin(&state, "9001", "missing", true).await,
            Err(AuthFailure::NotFound)
        );
    }

    #[tokio::test]
    async fn registration_consumes_invite_once_and_starts_as_agent() {
        let state = state_with_invites(&["INVITE-0001"]);
        let (user, log) = register_local_user(
            &state,
            "AGENT_FOX",
            String::from("hash"),
            "INVITE-0001",
            Some(String::from("203.0.113.5")),
        )
        .await
        .expect("registration succeeds");
        assert_eq!(user.role, Role::Agent);
        assert!(!user.is_suspended);
        assert_eq!(log.action, "USER_REGISTER");
        assert_eq!(log.target_id.as_deref(), Some(user.id.as_str()));
        assert_eq!(state.ledger.read().await.logs, vec![log]);
        let invite = state
            .invite_codes
            .read()
            .await
            .get("INVITE-0001")
            .cloned()
            .expect("invite exists");
        assert!(invite.is_used);
        assert_eq!(invite.used_by.as_deref(), Some(user.id.as_str()));

        let reuse = register_local_user(
            &state,
            "AGENT_OWL",
            String::from("hash"),
            "INVITE-0001",
            None,
        )
        .await;
        assert_eq!(reuse, Err(AuthFailure::InvalidRequest));
    }

    #[tokio::test]
    async fn duplicate_username_is_a_conflict_and_keeps_invite_unused() {
        let state = state_with_invites(&["INVITE-0001", "INVITE-0002"]);
        register_local_user(&state, "AGENT_FOX", String::from("h"), "INVITE-0001", None)
            .await
            .expect("first registration");
        let duplicate =
            register_local_user(&state, "AGENT_FOX", String::from("h"), "INVITE-0002", None).await;
        assert_eq!(duplicate, Err(AuthFailure::Conflict));
        assert_eq!(state.ledger.read().await.logs.len(), 1);
        assert!(
            !state
                .invite_codes
                .read()
                .await
                .get("INVITE-0002")
                .expect("invite exists")
                .is_used
        );
    }

    #[tokio::test]
    async fn role_change_reports_previous_role() {
        let state = state_with_invites(&["INVITE-0001"]);
        let (user, _) =
            register_local_user(&state, "AGENT_FOX", String::from("h"), "INVITE-0001", None)
                .await
                .expect("registration");
        let (updated, previous) = set_user_role(&state, &user.id, Role::Management)
            .await
            .expect("role change");
        assert_eq!(previous, Role::Agent);
        assert_eq!(updated.role, Role::Management);
        let fetched = find_user_by_username(&state, "AGENT_FOX")
            .await
            .expect("lookup")
            .expect("user exists");
        assert_eq!(fetched.role, Role::Management);
    }

    #[tokio::test]
    async fn bootstrap_overseer_username_registers_as_overseer() {
        let config = AppConfig {
            bootstrap_invite_codes: vec![String::from("INVITE-0001"), String::from("INVITE-0002")],
            bootstrap_overseers: vec![String::from("DIRECTOR")],
            ..AppConfig::default()
        };
        let state = AppState::new(&config).expect("state should initialize");
        let (director, _) =
            register_local_user(&state, "DIRECTOR", String::from("h"), "INVITE-0001", None)
                .await
                .expect("registration");
        let (agent, _) =
            register_local_user(&state, "AGENT_FOX", String::from("h"), "INVITE-0002", None)
                .await
                .expect("registration");
        assert_eq!(director.role, Role::Overseer);
        assert_eq!(agent.role, Role::Agent);
    }

    #[tokio::test]
    async fn invite_codes_are_unique() {
        let state = state_with_invites(&["INVITE-0001"]);
        assert_eq!(
            create_invite_code(&state, "INVITE-0001").await,
            Err(AuthFailure::Conflict)
        );
        let created = create_invite_code(&state, "INVITE-0002")
            .await
            .expect("new code");
        assert!(!created.is_used);
    }
}
