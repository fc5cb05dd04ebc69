use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::anyhow;
use axum::{
    extract::{ConnectInfo, DefaultBodyLimit},
    http::{request::Request, HeaderName, StatusCode},
    middleware,
    routing::{delete, get, patch, post},
    Router,
};
use tower::ServiceBuilder;
use tower_governor::{
    errors::GovernorError, governor::GovernorConfigBuilder, key_extractor::KeyExtractor,
    GovernorLayer,
};
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use super::{
    auth::resolve_client_ip,
    core::{AppConfig, AppState},
    gate::ip_gate,
    handlers::{
        auth::{check_ip, login, logout, me, register},
        cases,
        discord::{discord_callback, discord_login, list_servers, select_session_server},
        logs, recovery,
        servers::{get_server_config, put_server_config, server_dashboard, update_member_admin},
        users,
    },
    proxy_cidr::ProxyCidr,
    types::{health, metrics},
};

#[derive(Clone)]
struct TrustedClientIpKeyExtractor {
    trusted_proxy_cidrs: Arc<Vec<ProxyCidr>>,
}

impl TrustedClientIpKeyExtractor {
    fn new(trusted_proxy_cidrs: Arc<Vec<ProxyCidr>>) -> Self {
        Self {
            trusted_proxy_cidrs,
        }
    }
}

impl KeyExtractor for TrustedClientIpKeyExtractor {
    type Key = IpAddr;

    fn extract<T>(&self, req: &Request<T>) -> Result<Self::Key, GovernorError> {
        let peer_ip = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|value| value.0.ip());
        let resolved =
            resolve_client_ip(req.headers(), peer_ip, self.trusted_proxy_cidrs.as_slice());
        Ok(resolved.ip().unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)))
    }
}

fn validate_config(config: &AppConfig) -> anyhow::Result<()> {
    if config.max_body_bytes == 0 {
        return Err(anyhow!("max body bytes must be at least 1 byte"));
    }
    if config.request_timeout.is_zero() {
        return Err(anyhow!("request timeout must be non-zero"));
    }
    if config.rate_limit_requests_per_minute == 0 {
        return Err(anyhow!(
            "global rate limit must be at least 1 request per minute"
        ));
    }
    if config.auth_route_requests_per_minute == 0 {
        return Err(anyhow!(
            "auth route rate limit must be at least 1 request per minute"
        ));
    }
    if config.session_ttl.is_zero() {
        return Err(anyhow!("session ttl must be non-zero"));
    }
    if config.notification_queue_capacity == 0 {
        return Err(anyhow!(
            "notification queue capacity must be at least 1 entry"
        ));
    }
    if config.upstream_timeout.is_zero() {
        return Err(anyhow!("upstream timeout must be non-zero"));
    }
    Ok(())
}

/// Build the axum router with global security middleware.
///
/// Every route except `/health`, `/metrics` and `/auth/check-ip` passes the IP
/// gate before its handler runs. The client address comes from `ConnectInfo`, so serve the
/// router with `into_make_service_with_connect_info::<SocketAddr>()`.
///
/// # Errors
/// Returns an error if configured limits, OAuth settings or upstream URLs are
/// invalid.
pub fn build_router(config: &AppConfig) -> anyhow::Result<Router> {
    validate_config(config)?;

    let governor_config = Arc::new(
        GovernorConfigBuilder::default()
            .period(Duration::from_secs(60))
            .burst_size(config.rate_limit_requests_per_minute)
            .key_extractor(TrustedClientIpKeyExtractor::new(Arc::new(
                config.trusted_proxy_cidrs.clone(),
            )))
            .finish()
            .ok_or_else(|| anyhow!("invalid governor configuration"))?,
    );
    let app_state = AppState::new(config)?;
    let request_id_header = HeaderName::from_static("x-request-id");
    let governor_layer = GovernorLayer::new(governor_config);

    let routes = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/auth/check-ip", get(check_ip))
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/auth/me", get(me))
        .route("/auth/discord/login", get(discord_login))
        .route("/auth/discord/callback", get(discord_callback))
        .route("/servers", get(list_servers))
        .route("/session/server", post(select_session_server))
        .route("/servers/{server_id}/dashboard", get(server_dashboard))
        .route(
            "/servers/{server_id}/config",
            get(get_server_config).put(put_server_config),
        )
        .route(
            "/servers/{server_id}/members/{discord_user_id}",
            patch(update_member_admin),
        )
        .route("/cases", post(cases::create).get(cases::list))
        .route("/cases/public", get(cases::list_public))
        .route(
            "/cases/{case_id}",
            get(cases::get).patch(cases::update).delete(cases::delete),
        )
        .route(
            "/cases/{case_id}/visibility",
            post(cases::toggle_visibility),
        )
        .route("/cases/{case_id}/encrypt", post(cases::encrypt))
        .route("/cases/{case_id}/decrypt", post(cases::decrypt))
        .route("/recovery/cases", get(recovery::list_recoverable))
        .route(
            "/recovery/cases/{case_id}",
            delete(recovery::purge),
        )
        .route(
            "/recovery/cases/{case_id}/restore",
            post(recovery::restore),
        )
        .route(
            "/recovery/cases/{case_id}/remove-embed",
            post(recovery::remove_embed),
        )
        .route("/logs", get(logs::list))
        .route("/users", get(users::list))
        .route("/users/{user_id}/role", patch(users::change_role))
        .route("/users/{user_id}/suspend", post(users::suspend))
        .route("/users/{user_id}/unsuspend", post(users::unsuspend))
        .route(
            "/invite-codes",
            post(users::create_invite).get(users::list_invites),
        )
        .layer(middleware::from_fn_with_state(app_state.clone(), ip_gate));

    Ok(routes
        .with_state(app_state)
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
                .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    config.request_timeout,
                ))
                .layer(governor_layer),
        ))
}
