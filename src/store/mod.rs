//! Platform connection store: PostgreSQL persistence plus token refresh.

pub mod db;
pub mod refresh;

pub use db::{Connection, ConnectionInfo, ConnectionStore, ConnectionUpsert, UsageWindow};
pub use refresh::{refresh_daemon, valid_access_token, RefreshLocks};
