use anyhow::{Context, Result};
use sqlx::{migrate::MigrateDatabase, sqlite::SqlitePoolOptions, SqlitePool};
use tracing::info;

/// Owns the SQLite pool and the schema lifecycle.
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    /// Open the store, creating the database file on first use, and bring
    /// the schema up to date when `auto_migrate` is set.
    pub async fn new(database_url: &str, max_connections: u32, auto_migrate: bool) -> Result<Self> {
        let exists = sqlx::Sqlite::database_exists(database_url)
            .await
            .unwrap_or(false);
        if !exists {
            sqlx::Sqlite::create_database(database_url)
                .await
                .with_context(|| format!("creating sqlite database at {database_url}"))?;
            info!(database_url, "created fresh sqlite database");
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .with_context(|| format!("connecting to {database_url}"))?;

        if auto_migrate {
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .context("applying schema migrations")?;
            info!("schema is current");
        }

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Drain the pool so in-flight transactions settle before exit.
    pub async fn shutdown(&self) {
        self.pool.close().await;
        info!("database pool closed");
    }
}
