pub(crate) mod audit;
pub(crate) mod auth;
pub(crate) mod cases;
pub(crate) mod collaborators;
pub(crate) mod core;
pub(crate) mod db;
pub(crate) mod discord_oauth;
pub(crate) mod errors;
pub(crate) mod gate;
pub(crate) mod handlers;
pub(crate) mod identity;
pub(crate) mod metrics;
pub(crate) mod proxy_cidr;
pub(crate) mod router;
pub(crate) mod server_config;
pub(crate) mod session;
pub(crate) mod types;

pub use self::core::AppConfig;
pub use errors::init_tracing;
pub use proxy_cidr::{ProxyCidr, ProxyCidrError};
pub use router::build_router;
