use std::{
    net::IpAddr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use aegis_core::{Principal, Role};
use anyhow::anyhow;
use argon2::{
    password_hash::rand_core::{OsRng, RngCore},
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::http::{header::AUTHORIZATION, HeaderMap};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use pasetors::{
    claims::{Claims, ClaimsValidationRules},
    local,
    token::UntrustedToken,
    version4::V4,
    Local,
};

use super::{core::AppState, errors::AuthFailure, proxy_cidr::ProxyCidr};

const MAX_X_FORWARDED_FOR_HEADER_CHARS: usize = 512;
const MAX_X_FORWARDED_FOR_ENTRY_CHARS: usize = 64;
const UNKNOWN_CLIENT_IP: &str = "unknown";
const RATE_LIMIT_WINDOW_SECS: i64 = 60;
const MAX_UPSTREAM_URL_CHARS: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClientIpSource {
    Peer,
    Forwarded,
}

impl ClientIpSource {
    #[must_use]
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Peer => "peer",
            Self::Forwarded => "forwarded",
        }
    }
}

/// Resolved client address, stored in request extensions by the IP gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ClientIp {
    ip: Option<IpAddr>,
    source: ClientIpSource,
}

impl ClientIp {
    #[must_use]
    pub(crate) fn ip(self) -> Option<IpAddr> {
        self.ip
    }

    #[must_use]
    pub(crate) fn source(self) -> ClientIpSource {
        self.source
    }

    #[must_use]
    pub(crate) fn normalized(self) -> String {
        self.ip
            .map_or_else(|| String::from(UNKNOWN_CLIENT_IP), |ip| ip.to_string())
    }

    /// Address as persisted on user rows; unknown peers are never recorded.
    #[must_use]
    pub(crate) fn recorded(self) -> Option<String> {
        self.ip.map(|ip| ip.to_string())
    }

    fn peer(ip: Option<IpAddr>) -> Self {
        Self {
            ip,
            source: ClientIpSource::Peer,
        }
    }

    fn forwarded(ip: IpAddr) -> Self {
        Self {
            ip: Some(ip),
            source: ClientIpSource::Forwarded,
        }
    }
}

/// Claims carried by an access token. The session store stays authoritative;
/// these fields are only the snapshot taken when the token was minted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TokenClaims {
    pub(crate) subject: String,
    pub(crate) session_id: String,
    pub(crate) role: Option<Role>,
    pub(crate) server_id: Option<String>,
    pub(crate) discord_user_id: Option<String>,
}

pub(crate) fn validate_password(value: &str) -> Result<(), AuthFailure> {
    let len = value.len();
    if (12..=128).contains(&len) {
        Ok(())
    } else {
        Err(AuthFailure::InvalidRequest)
    }
}

pub(crate) fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow!("password hash failed: {e}"))?
        .to_string();
    Ok(hash)
}

pub(crate) fn verify_password(stored_hash: &str, supplied_password: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(supplied_password.as_bytes(), &parsed)
        .is_ok()
}

pub(crate) fn random_token() -> String {
    let mut bytes = [0_u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub(crate) fn issue_access_token(
    state: &AppState,
    session_id: &str,
    subject: &str,
    principal: Option<&Principal>,
) -> anyhow::Result<String> {
    let ttl_secs = u64::try_from(state.runtime.session_ttl_secs).unwrap_or(0);
    let mut claims = Claims::new_expires_in(&Duration::from_secs(ttl_secs))
        .map_err(|e| anyhow!("claims init failed: {e}"))?;
    claims
        .subject(subject)
        .map_err(|e| anyhow!("claim sub failed: {e}"))?;
    claims
        .add_additional("sid", session_id)
        .map_err(|e| anyhow!("claim sid failed: {e}"))?;
    if let Some(principal) = principal {
        claims
            .add_additional("role", principal.role().as_str())
            .map_err(|e| anyhow!("claim role failed: {e}"))?;
        if let Some(server_id) = principal.server_id() {
            claims
                .add_additional("server_id", server_id)
                .map_err(|e| anyhow!("claim server_id failed: {e}"))?;
        }
        if let Some(discord_user_id) = principal.discord_user_id() {
            claims
                .add_additional("discord_user_id", discord_user_id)
                .map_err(|e| anyhow!("claim discord_user_id failed: {e}"))?;
        }
    }

    local::encrypt(&state.token_key, &claims, None, None)
        .map_err(|e| anyhow!("access token mint failed: {e}"))
}

pub(crate) fn verify_access_token(state: &AppState, token: &str) -> anyhow::Result<TokenClaims> {
    let untrusted = UntrustedToken::<Local, V4>::try_from(token).map_err(|e| anyhow!("{e}"))?;
    let validation_rules = ClaimsValidationRules::new();
    let trusted = local::decrypt(&state.token_key, &untrusted, &validation_rules, None, None)
        .map_err(|e| anyhow!("token decrypt failed: {e}"))?;
    let claims = trusted
        .payload_claims()
        .ok_or_else(|| anyhow!("token claims missing"))?;
    let text_claim = |name: &str| {
        claims
            .get_claim(name)
            .and_then(serde_json::Value::as_str)
            .map(ToOwned::to_owned)
    };

    Ok(TokenClaims {
        subject: text_claim("sub").ok_or_else(|| anyhow!("token subject missing"))?,
        session_id: text_claim("sid").ok_or_else(|| anyhow!("token session missing"))?,
        role: text_claim("role").and_then(|value| Role::try_from(value).ok()),
        server_id: text_claim("server_id"),
        discord_user_id: text_claim("discord_user_id"),
    })
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let header = headers.get(AUTHORIZATION)?;
    let header = header.to_str().ok()?;
    header.strip_prefix("Bearer ")
}

pub(crate) fn now_unix() -> i64 {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs();
    i64::try_from(seconds).unwrap_or(i64::MAX)
}

pub(crate) fn now_millis() -> i64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis();
    i64::try_from(millis).unwrap_or(i64::MAX)
}

pub(crate) fn validate_upstream_url(value: &str, label: &str) -> anyhow::Result<String> {
    let trimmed = value.trim().trim_end_matches('/');
    if trimmed.is_empty() || trimmed.len() > MAX_UPSTREAM_URL_CHARS {
        return Err(anyhow!("{label} is invalid"));
    }
    if trimmed.starts_with("https://")
        || trimmed.starts_with("http://127.0.0.1")
        || trimmed.starts_with("http://localhost")
    {
        return Ok(trimmed.to_owned());
    }
    Err(anyhow!(
        "{label} must use https://, or localhost http:// for tests"
    ))
}

pub(crate) async fn enforce_auth_route_rate_limit(
    state: &AppState,
    client_ip: ClientIp,
    route: &str,
) -> Result<(), AuthFailure> {
    let ip = client_ip.normalized();
    let key = format!("{route}:{ip}");
    let now = now_unix();

    let mut hits = state.auth_route_hits.write().await;
    hits.retain(|_, route_hits| {
        route_hits.retain(|timestamp| now.saturating_sub(*timestamp) < RATE_LIMIT_WINDOW_SECS);
        !route_hits.is_empty()
    });
    let route_hits = hits.entry(key).or_default();
    let max_hits =
        usize::try_from(state.runtime.auth_route_requests_per_minute).unwrap_or(usize::MAX);
    if route_hits.len() >= max_hits {
        tracing::warn!(
            event = "auth.rate_limit",
            route = %route,
            client_ip = %ip,
            client_ip_source = client_ip.source().as_str()
        );
        return Err(AuthFailure::RateLimited);
    }
    route_hits.push(now);
    Ok(())
}

pub(crate) fn resolve_client_ip(
    headers: &HeaderMap,
    peer_ip: Option<IpAddr>,
    trusted_proxy_cidrs: &[ProxyCidr],
) -> ClientIp {
    let Some(peer_ip) = peer_ip else {
        return ClientIp::peer(None);
    };
    let peer_is_trusted = trusted_proxy_cidrs
        .iter()
        .any(|network| network.contains(peer_ip));
    if peer_is_trusted {
        if let Some(forwarded_ip) = parse_forwarded_ip(headers) {
            return ClientIp::forwarded(forwarded_ip);
        }
    }
    ClientIp::peer(Some(peer_ip))
}

fn parse_forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .filter(|value| value.len() <= MAX_X_FORWARDED_FOR_HEADER_CHARS)
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty() && value.len() <= MAX_X_FORWARDED_FOR_ENTRY_CHARS)
        .and_then(|value| value.parse::<IpAddr>().ok())
}

#[cfg(test)]
mod tests {
    use aegis_core::{DiscordPrincipal, Principal, Role};
    use axum::http::HeaderMap;

    use super::{
        enforce_auth_route_rate_limit, issue_access_token, resolve_client_ip,
        validate_upstream_url, verify_access_token, ClientIpSource,
    };
    use crate::server::{
        core::{AppConfig, AppState},
        errors::AuthFailure,
        proxy_cidr::ProxyCidr,
    };

    #[test]
    fn client_ip_defaults_to_peer_when_proxy_is_untrusted() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            "198.51.100.21".parse().expect("valid header"),
        );
        let resolved = resolve_client_ip(
            &headers,
            Some("10.10.0.4".parse().expect("valid ip")),
            &[],
        );
        assert_eq!(resolved.source(), ClientIpSource::Peer);
        assert_eq!(resolved.normalized(), "10.10.0.4");
    }

    #[test]
    fn client_ip_uses_forwarded_value_when_peer_proxy_is_trusted() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            "198.51.100.44, 203.0.113.10".parse().expect("valid header"),
        );
        let trusted: Vec<ProxyCidr> = vec!["10.0.0.0/8".parse().expect("valid cidr")];
        let resolved = resolve_client_ip(
            &headers,
            Some("10.2.0.8".parse().expect("valid ip")),
            &trusted,
        );
        assert_eq!(resolved.source(), ClientIpSource::Forwarded);
        assert_eq!(resolved.normalized(), "198.51.100.44");
    }

    #[test]
    fn missing_peer_is_unknown_and_never_recorded() {
        let resolved = resolve_client_ip(&HeaderMap::new(), None, &[]);
        assert_eq!(resolved.normalized(), "unknown");
        assert_eq!(resolved.recorded(), None);
    }

    #[test]
    fn upstream_urls_require_tls_outside_localhost() {
        assert!(validate_upstream_url("https://discord.com/api/v10/", "api").is_ok());
        assert!(validate_upstream_url("http://127.0.0.1:9000", "api").is_ok());
        assert!(validate_upstream_url("http://example.com", "api").is_err());
        assert_eq!(
            validate_upstream_url("https://discord.com/api/v10/", "api").expect("valid"),
            "https://discord.com/api/v10"
        );
    }

    #[tokio::test]
    async fn access_token_round_trips_principal_snapshot() {
        let state = AppState::new(&AppConfig::default()).expect("state should initialize");
        let principal = Principal::Discord(DiscordPrincipal {
            discord_user_id: String::from("4001"),
            server_id: String::from("9001"),
            username: String::from("4001"),
            role: Role::Management,
            ip: String::from("203.0.113.4"),
        });
        let token = issue_access_token(&state, "session-1", "4001", Some(&principal))
            .expect("token should mint");
        let claims = verify_access_token(&state, &token).expect("token should verify");
        assert_eq!(claims.session_id, "session-1");
        assert_eq!(claims.subject, "4001");
        assert_eq!(claims.role, Some(Role::Management));
        assert_eq!(claims.server_id.as_deref(), Some("9001"));
        assert_eq!(claims.discord_user_id.as_deref(), Some("4001"));
    }

    #[tokio::test]
    async fn auth_route_rate_limit_rejects_after_threshold() {
        let config = AppConfig {
            auth_route_requests_per_minute: 2,
            ..AppConfig::default()
        };
        let state = AppState::new(&config).expect("state should initialize");
        let client_ip = resolve_client_ip(
            &HeaderMap::new(),
            Some("203.0.113.77".parse().expect("valid ip")),
            &[],
        );
        enforce_auth_route_rate_limit(&state, client_ip, "login")
            .await
            .expect("first hit allowed");
        enforce_auth_route_rate_limit(&state, client_ip, "login")
            .await
            .expect("second hit allowed");
        assert_eq!(
            enforce_auth_route_rate_limit(&state, client_ip, "login").await,
            Err(AuthFailure::RateLimited)
        );
    }
}
