pub(crate) mod auth;
pub(crate) mod cases;
pub(crate) mod discord;
pub(crate) mod logs;
pub(crate) mod recovery;
pub(crate) mod servers;
pub(crate) mod users;
