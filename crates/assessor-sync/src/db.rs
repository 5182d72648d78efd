//! SQLite connection pool shared by the staging and production adapters

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::SyncResult;

/// Open (creating if missing) the database behind `database_url`
///
/// An in-memory database lives only as long as its connection, so it is
/// served from a single connection that is never recycled.
pub async fn connect(database_url: &str) -> SyncResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = if database_url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Some(Duration::from_secs(60)))
            .connect_with(options)
            .await?
    };

    info!(database = %database_url, "Connected to database");
    Ok(pool)
}
