//! Administrator accounts

use chrono::Utc;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::error::{PanelError, Result};
use crate::models::Admin;

use super::Store;

/// Create request for an administrator
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
pub struct AdminCreate {
    #[builder(setter(into))]
    pub username: String,
    #[builder(setter(into))]
    pub password: String,
    #[serde(default)]
    #[builder(default)]
    pub is_sudo: bool,
}

impl Store {
    pub async fn create_admin(&self, req: AdminCreate) -> Result<Admin> {
        let password_hash = bcrypt::hash(&req.password, bcrypt::DEFAULT_COST)
            .map_err(|e| PanelError::Internal(e.to_string()))?;
        sqlx::query(
            "INSERT INTO admins (username, password_hash, is_sudo, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&req.username)
        .bind(&password_hash)
        .bind(req.is_sudo)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        self.admin(&req.username).await
    }

    pub async fn admin(&self, username: &str) -> Result<Admin> {
        sqlx::query_as::<_, Admin>("SELECT * FROM admins WHERE username = ? COLLATE NOCASE")
            .bind(username)
            .fetch_optional(self.pool())
            .await?
            .ok_or(PanelError::NotFound)
    }

    pub async fn list_admins(&self) -> Result<Vec<Admin>> {
        Ok(sqlx::query_as::<_, Admin>("SELECT * FROM admins ORDER BY id")
            .fetch_all(self.pool())
            .await?)
    }

    /// Change a password; invalidates tokens issued before the change.
    pub async fn set_admin_password(&self, username: &str, password: &str) -> Result<Admin> {
        let password_hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)
            .map_err(|e| PanelError::Internal(e.to_string()))?;
        let affected = sqlx::query(
            "UPDATE admins SET password_hash = ?, password_reset_at = ? WHERE username = ? COLLATE NOCASE",
        )
        .bind(&password_hash)
        .bind(Utc::now())
        .bind(username)
        .execute(self.pool())
        .await?
        .rows_affected();
        if affected == 0 {
            return Err(PanelError::NotFound);
        }
        self.admin(username).await
    }

    pub async fn delete_admin(&self, username: &str) -> Result<()> {
        let affected = sqlx::query("DELETE FROM admins WHERE username = ? COLLATE NOCASE")
            .bind(username)
            .execute(self.pool())
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(PanelError::NotFound);
        }
        Ok(())
    }

    /// Verify a password against the stored hash.
    pub async fn verify_admin(&self, username: &str, password: &str) -> Result<Admin> {
        let admin = self.admin(username).await.map_err(|_| PanelError::AuthFailed)?;
        let ok = bcrypt::verify(password, &admin.password_hash)
            .map_err(|e| PanelError::Internal(e.to_string()))?;
        if !ok {
            return Err(PanelError::AuthFailed);
        }
        Ok(admin)
    }
}
