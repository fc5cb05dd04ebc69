#![forbid(unsafe_code)]

use std::net::SocketAddr;

use aegis_server::{build_router, init_tracing, AppConfig, ProxyCidr};
use tokio::net::TcpListener;

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn comma_separated(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|item| !item.is_empty())
}

fn comma_separated_env(name: &str) -> Vec<String> {
    optional_env(name)
        .map(|raw| comma_separated(&raw).map(ToOwned::to_owned).collect())
        .unwrap_or_default()
}

fn trusted_proxy_cidrs() -> anyhow::Result<Vec<ProxyCidr>> {
    let Some(raw) = optional_env("AEGIS_TRUSTED_PROXY_CIDRS") else {
        return Ok(Vec::new());
    };
    comma_separated(&raw)
        .map(|entry| {
            entry.parse::<ProxyCidr>().map_err(|e| {
                anyhow::anyhow!("invalid AEGIS_TRUSTED_PROXY_CIDRS entry {entry:?}: {e}")
            })
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let database_url = optional_env("AEGIS_DATABASE_URL");
    if database_url.is_none() {
        tracing::warn!("AEGIS_DATABASE_URL not set; state is kept in memory only");
    }
    let bootstrap_invite_codes = comma_separated_env("AEGIS_BOOTSTRAP_INVITE_CODES");
    let bootstrap_overseers = comma_separated_env("AEGIS_BOOTSTRAP_OVERSEERS");

    let app_config = AppConfig {
        database_url,
        discord_client_id: optional_env("AEGIS_DISCORD_CLIENT_ID"),
        discord_client_secret: optional_env("AEGIS_DISCORD_CLIENT_SECRET"),
        discord_redirect_uri: optional_env("AEGIS_DISCORD_REDIRECT_URI"),
        discord_bot_token: optional_env("AEGIS_DISCORD_BOT_TOKEN"),
        webhook_url: optional_env("AEGIS_WEBHOOK_URL"),
        trusted_proxy_cidrs: trusted_proxy_cidrs()?,
        bootstrap_invite_codes,
        bootstrap_overseers,
        ..AppConfig::default()
    };
    let app = build_router(&app_config)?;
    let addr = std::env::var("AEGIS_BIND_ADDR")
        .unwrap_or_else(|_| String::from("0.0.0.0:3000"))
        .parse::<SocketAddr>()
        .map_err(|e| anyhow::anyhow!("invalid AEGIS_BIND_ADDR: {e}"))?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "aegis-server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
