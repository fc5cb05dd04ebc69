use std::net::SocketAddr;

use aegis_core::{derive_role, Operation, Principal, Role};
use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use serde::Serialize;

use super::{
    auth::{bearer_token, resolve_client_ip, verify_access_token, TokenClaims},
    core::{AppState, SessionRecord},
    errors::AuthFailure,
    identity::find_member,
    metrics::record_ip_gate_rejection,
    session::{load_session, resolve_ip_status},
};

/// Paths served without consulting the IP reputation gate. `/auth/check-ip`
/// reports the verdict itself instead of being rejected by it.
const IP_GATE_EXEMPT_PATHS: [&str; 3] = ["/health", "/metrics", "/auth/check-ip"];

/// How the request principal was obtained from the session store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PrincipalSource {
    /// Token snapshot and stored principal agree.
    Attached,
    /// Token carried no usable principal; the stored one was restored.
    Restored,
    /// Token lacked server scope that the stored principal carries.
    Backfilled,
}

impl PrincipalSource {
    fn as_str(self) -> &'static str {
        match self {
            Self::Attached => "attached",
            Self::Restored => "restored",
            Self::Backfilled => "backfilled",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Authenticated {
    pub(crate) principal: Principal,
}

/// Checks a token snapshot against the stored principal. The stored
/// principal is authoritative; the token only tells how stale it was.
pub(crate) fn reconcile_principal(
    claims: &TokenClaims,
    stored: Option<&Principal>,
) -> Result<(Principal, PrincipalSource), AuthFailure> {
    let stored = stored.ok_or(AuthFailure::Unauthenticated)?;
    let Some(role) = claims.role else {
        return Ok((stored.clone(), PrincipalSource::Restored));
    };
    let scope_missing = (claims.server_id.is_none() && stored.server_id().is_some())
        || (claims.discord_user_id.is_none() && stored.discord_user_id().is_some());
    if scope_missing {
        return Ok((stored.clone(), PrincipalSource::Backfilled));
    }
    let agrees = role == stored.role()
        && claims.server_id.as_deref() == stored.server_id()
        && claims.discord_user_id.as_deref() == stored.discord_user_id();
    let source = if agrees {
        PrincipalSource::Attached
    } else {
        PrincipalSource::Restored
    };
    Ok((stored.clone(), source))
}

/// Verifies the bearer token and loads its live session, with or without an
/// attached principal.
pub(crate) async fn require_session(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<(TokenClaims, SessionRecord), AuthFailure> {
    let token = bearer_token(headers).ok_or(AuthFailure::Unauthenticated)?;
    let claims = verify_access_token(state, token).map_err(|_| AuthFailure::Unauthenticated)?;
    let session = load_session(state, &claims.session_id)
        .await?
        .ok_or(AuthFailure::Unauthenticated)?;
    Ok((claims, session))
}

pub(crate) async fn require_principal(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Authenticated, AuthFailure> {
    let (claims, session) = require_session(state, headers).await?;
    let (principal, source) = reconcile_principal(&claims, session.principal.as_ref())?;
    if source != PrincipalSource::Attached {
        tracing::info!(
            event = "gate.principal",
            outcome = source.as_str(),
            principal_id = %principal.id()
        );
    }
    Ok(Authenticated { principal })
}

/// `None` when no credentials were presented or they no longer resolve to a
/// live session. Store failures still propagate.
pub(crate) async fn optional_principal(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Option<Authenticated>, AuthFailure> {
    if bearer_token(headers).is_none() {
        return Ok(None);
    }
    match require_principal(state, headers).await {
        Ok(auth) => Ok(Some(auth)),
        Err(AuthFailure::Unauthenticated) => {
            tracing::debug!(event = "gate.principal", outcome = "anonymous_fallback");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

pub(crate) fn require_role(principal: &Principal, operation: Operation) -> Result<(), AuthFailure> {
    if operation.permits(principal.role()) {
        return Ok(());
    }
    tracing::warn!(
        event = "gate.role",
        outcome = "forbidden",
        operation = ?operation,
        role = %principal.role()
    );
    Err(AuthFailure::Forbidden)
}

/// Account administration spans every server, so only local accounts may
/// perform it. A Discord role is granted by one server's membership.
pub(crate) fn require_account_admin(
    principal: &Principal,
    operation: Operation,
) -> Result<(), AuthFailure> {
    require_role(principal, operation)?;
    if matches!(principal, Principal::Local(_)) {
        return Ok(());
    }
    tracing::warn!(
        event = "gate.account_admin",
        outcome = "forbidden",
        operation = ?operation,
        principal_id = %principal.id()
    );
    Err(AuthFailure::Forbidden)
}

pub(crate) async fn require_server_membership(
    state: &AppState,
    principal: &Principal,
    server_id: &str,
) -> Result<(), AuthFailure> {
    let subject = principal.membership_subject();
    if find_member(state, server_id, &subject).await?.is_some() {
        return Ok(());
    }
    tracing::warn!(event = "gate.membership", outcome = "forbidden", server_id = %server_id);
    Err(AuthFailure::Forbidden)
}

pub(crate) fn require_owning_server_match(
    supplied_server_id: &str,
    owning_server_id: Option<&str>,
) -> Result<(), AuthFailure> {
    if owning_server_id == Some(supplied_server_id) {
        return Ok(());
    }
    tracing::warn!(event = "gate.owning_server", outcome = "forbidden");
    Err(AuthFailure::Forbidden)
}

/// A supplied server must own the case, and a server-scoped principal only
/// reaches cases of its own server. Cases without an owning server stay
/// reachable to everyone holding the role.
pub(crate) fn require_case_scope(
    principal: &Principal,
    supplied_server_id: Option<&str>,
    owning_server_id: Option<&str>,
) -> Result<(), AuthFailure> {
    if let Some(server_id) = supplied_server_id {
        require_owning_server_match(server_id, owning_server_id)?;
    }
    match (principal.server_id(), owning_server_id) {
        (Some(selected), Some(_)) => require_owning_server_match(selected, owning_server_id),
        _ => Ok(()),
    }
}

/// Resolves the client address for every request and rejects addresses
/// shared with a suspended account before any authentication runs.
pub(crate) async fn ip_gate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AuthFailure> {
    let peer_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|value| value.0.ip());
    let client_ip = resolve_client_ip(
        request.headers(),
        peer_ip,
        &state.runtime.trusted_proxy_cidrs,
    );
    request.extensions_mut().insert(client_ip);

    if !IP_GATE_EXEMPT_PATHS.contains(&request.uri().path()) {
        if let Some(ip) = client_ip.recorded() {
            if resolve_ip_status(&state, &ip).await? {
                tracing::warn!(
                    event = "gate.ip",
                    outcome = "banned",
                    client_ip = %ip,
                    client_ip_source = client_ip.source().as_str()
                );
                record_ip_gate_rejection();
                return Err(AuthFailure::IpBanned);
            }
        }
    }
    Ok(next.run(request).await)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum AdmissionSource {
    Live,
    Snapshot,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DashboardAdmission {
    pub(crate) server_id: String,
    pub(crate) admitted: bool,
    pub(crate) source: AdmissionSource,
    pub(crate) role: Role,
}

/// Per-visit dashboard check. The guild oracle is asked first; when it is
/// unavailable the stored membership snapshot decides.
pub(crate) async fn dashboard_admission(
    state: &AppState,
    principal: &Principal,
    server_id: &str,
) -> Result<DashboardAdmission, AuthFailure> {
    let discord_user_id = principal
        .discord_user_id()
        .ok_or(AuthFailure::Forbidden)?;
    let member = find_member(state, server_id, discord_user_id)
        .await?
        .ok_or(AuthFailure::Forbidden)?;

    let (admitted, source) = match state
        .guild_oracle
        .check_user_guild_permissions(server_id, discord_user_id)
        .await
    {
        Ok(live) => (live.is_owner || live.is_admin, AdmissionSource::Live),
        Err(error) => {
            tracing::warn!(
                event = "gate.dashboard",
                outcome = "oracle_unavailable",
                server_id = %server_id,
                error = %error
            );
            (member.is_owner || member.is_admin, AdmissionSource::Snapshot)
        }
    };
    if !admitted {
        tracing::warn!(event = "gate.dashboard", outcome = "forbidden", server_id = %server_id);
        return Err(AuthFailure::Forbidden);
    }
    Ok(DashboardAdmission {
        server_id: server_id.to_owned(),
        admitted,
        source,
        role: derive_role(member.is_owner, member.is_admin),
    })
}
