//! Persistent state
//!
//! ## Overview
//! - Typed CRUD over the panel database, one submodule per aggregate
//! - Transactional boundaries: one logical mutation per operation
//! - Unique violations surface as `AlreadyExists`

pub mod admins;
pub mod nodes;
pub mod pki;
pub mod reminders;
pub mod services;
pub mod usage;
pub mod users;

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::info;

use crate::error::Result;

/// Handle to the panel database
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (and migrate) the database at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Store { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory database for tests. A single connection keeps the database
    /// alive for the pool's lifetime.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Store { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| crate::error::PanelError::Database(e.to_string()))?;
        info!("database migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Fetch the token-signing secret, generating one on first boot.
    pub async fn jwt_secret(&self) -> Result<String> {
        if let Some((secret,)) =
            sqlx::query_as::<_, (String,)>("SELECT secret_key FROM jwt_secret WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?
        {
            return Ok(secret);
        }

        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let secret: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();

        // Another boot may have raced us; keep whichever landed first.
        sqlx::query("INSERT OR IGNORE INTO jwt_secret (id, secret_key) VALUES (1, ?)")
            .bind(&secret)
            .execute(&self.pool)
            .await?;
        let (secret,) =
            sqlx::query_as::<_, (String,)>("SELECT secret_key FROM jwt_secret WHERE id = 1")
                .fetch_one(&self.pool)
                .await?;
        Ok(secret)
    }
}
