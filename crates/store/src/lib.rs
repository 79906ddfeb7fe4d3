//! Typed query surface over the SQLite store. One [`Store`] per process;
//! every worker and the session manager share it via cheap clones.
//!
//! Counter updates are single-statement `UPDATE ... SET x = x + 1` and
//! status transitions are guarded with a `WHERE status = ?` clause, so no
//! cross-worker lock is ever needed around store access.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

use common::Result;

mod accounts;
mod audiences;
mod blacklist;
mod campaigns;
mod factory;
mod herder;
mod panic_flags;
mod scheduled;
mod stats;
mod tenants;
mod warmup;

pub use audiences::SendFailureKind;

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open the database, creating the file when missing, and run
    /// pending migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        Self::connect_with(database_url, 5).await
    }

    /// In-memory database for tests. A single connection, because every
    /// new `:memory:` connection would otherwise be a fresh database.
    pub async fn connect_in_memory() -> Result<Self> {
        Self::connect_with("sqlite::memory:", 1).await
    }

    async fn connect_with(database_url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .map_err(sqlx::Error::from)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
