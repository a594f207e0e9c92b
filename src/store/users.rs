//! Subscriber CRUD and status derivation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use tracing::debug;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::{PanelError, Result};
use crate::models::{
    DataLimitResetStrategy, NextPlan, Proxy, ProxySettings, UsageResetLog, User, UserStatus,
};

use super::Store;

/// Pending-plan payload carried on create/patch requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextPlanSpec {
    pub data_limit: Option<i64>,
    /// Duration in seconds from the moment the plan fires; `None` keeps the
    /// user unexpiring
    pub expire: Option<i64>,
    #[serde(default)]
    pub add_remaining_traffic: bool,
    #[serde(default = "default_true")]
    pub fire_on_either: bool,
}

fn default_true() -> bool {
    true
}

/// Create request for a subscriber
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
pub struct UserCreate {
    /// Canonicalized to a lowercase UUID; generated when omitted
    #[serde(default)]
    #[builder(default, setter(strip_option, into))]
    pub account_number: Option<String>,
    /// Defaults to `disabled` (pending payment)
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub status: Option<UserStatus>,
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub data_limit: Option<i64>,
    #[serde(default)]
    #[builder(default)]
    pub data_limit_reset_strategy: Option<DataLimitResetStrategy>,
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub expire: Option<i64>,
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub on_hold_expire_duration: Option<i64>,
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub on_hold_timeout: Option<DateTime<Utc>>,
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub auto_delete_in_days: Option<i64>,
    #[serde(default)]
    #[builder(default, setter(strip_option, into))]
    pub note: Option<String>,
    /// Credentials to provision; defaults to a single fresh VLESS identity
    #[serde(default)]
    #[builder(default)]
    pub proxies: Vec<ProxySettings>,
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub next_plan: Option<NextPlanSpec>,
}

impl UserCreate {
    fn validate(&self) -> Result<()> {
        if self.status == Some(UserStatus::OnHold) {
            match self.on_hold_expire_duration {
                Some(d) if d > 0 => {}
                _ => {
                    return Err(PanelError::InvalidInput(
                        "on_hold status requires a positive on_hold_expire_duration".to_string(),
                    ))
                }
            }
            if self.expire.is_some() {
                return Err(PanelError::InvalidInput(
                    "on_hold status cannot carry an expiration date".to_string(),
                ));
            }
        }
        if self.on_hold_expire_duration == Some(0) {
            return Err(PanelError::InvalidInput(
                "on_hold_expire_duration must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// In a patch body, an absent field stays untouched while an explicit
/// `null` clears the column.
fn clearable<'de, T, D>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

/// Field patch for a subscriber. `None` leaves a field untouched; the nested
/// option distinguishes "set" from "clear" for nullable columns.
#[derive(Debug, Clone, Default, Deserialize, TypedBuilder)]
pub struct UserPatch {
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub status: Option<UserStatus>,
    #[serde(default, deserialize_with = "clearable")]
    #[builder(default, setter(strip_option))]
    pub data_limit: Option<Option<i64>>,
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub data_limit_reset_strategy: Option<DataLimitResetStrategy>,
    #[serde(default, deserialize_with = "clearable")]
    #[builder(default, setter(strip_option))]
    pub expire: Option<Option<i64>>,
    #[serde(default, deserialize_with = "clearable")]
    #[builder(default, setter(strip_option))]
    pub on_hold_expire_duration: Option<Option<i64>>,
    #[serde(default, deserialize_with = "clearable")]
    #[builder(default, setter(strip_option))]
    pub on_hold_timeout: Option<Option<DateTime<Utc>>>,
    #[serde(default, deserialize_with = "clearable")]
    #[builder(default, setter(strip_option))]
    pub auto_delete_in_days: Option<Option<i64>>,
    #[serde(default, deserialize_with = "clearable")]
    #[builder(default, setter(strip_option))]
    pub note: Option<Option<String>>,
    /// Replaces the whole proxy set when present
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub proxies: Option<Vec<ProxySettings>>,
    #[serde(default, deserialize_with = "clearable")]
    #[builder(default, setter(strip_option))]
    pub next_plan: Option<Option<NextPlanSpec>>,
}

impl Store {
    pub async fn create_user(&self, req: UserCreate, owner_admin_id: Option<i64>) -> Result<User> {
        req.validate()?;
        let account_number = req
            .account_number
            .unwrap_or_else(|| Uuid::new_v4().to_string())
            .to_lowercase();
        let now = Utc::now();
        let status = req.status.unwrap_or(UserStatus::Disabled);

        let mut tx = self.pool().begin().await?;
        let user_id: i64 = sqlx::query_scalar(
            r#"INSERT INTO users
               (account_number, owner_admin_id, status, used_traffic, data_limit,
                data_limit_reset_strategy, expire, on_hold_expire_duration, on_hold_timeout,
                auto_delete_in_days, note, created_at, last_status_change)
               VALUES (?, ?, ?, 0, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               RETURNING id"#,
        )
        .bind(&account_number)
        .bind(owner_admin_id)
        .bind(status)
        .bind(req.data_limit)
        .bind(req.data_limit_reset_strategy.unwrap_or(DataLimitResetStrategy::NoReset))
        .bind(req.expire)
        .bind(req.on_hold_expire_duration)
        .bind(req.on_hold_timeout)
        .bind(req.auto_delete_in_days)
        .bind(&req.note)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        let proxies = if req.proxies.is_empty() {
            vec![ProxySettings::generate(crate::models::ProtocolType::Vless)]
        } else {
            req.proxies
        };
        for settings in &proxies {
            sqlx::query("INSERT INTO proxies (user_id, protocol, settings) VALUES (?, ?, ?)")
                .bind(user_id)
                .bind(settings.protocol())
                .bind(Json(settings))
                .execute(&mut *tx)
                .await?;
        }

        if let Some(plan) = &req.next_plan {
            sqlx::query(
                r#"INSERT INTO next_plans (user_id, data_limit, expire, add_remaining_traffic, fire_on_either)
                   VALUES (?, ?, ?, ?, ?)"#,
            )
            .bind(user_id)
            .bind(plan.data_limit)
            .bind(plan.expire)
            .bind(plan.add_remaining_traffic)
            .bind(plan.fire_on_either)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(user_id, %account_number, "user created");
        self.user_by_id(user_id).await
    }

    pub async fn user(&self, account_number: &str) -> Result<User> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE account_number = ?")
            .bind(account_number.to_lowercase())
            .fetch_optional(self.pool())
            .await?
            .ok_or(PanelError::NotFound)
    }

    pub async fn user_by_id(&self, user_id: i64) -> Result<User> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or(PanelError::NotFound)
    }

    pub async fn users_with_status(&self, status: UserStatus) -> Result<Vec<User>> {
        Ok(sqlx::query_as::<_, User>("SELECT * FROM users WHERE status = ? ORDER BY id")
            .bind(status)
            .fetch_all(self.pool())
            .await?)
    }

    pub async fn list_users(&self, owner_admin_id: Option<i64>) -> Result<Vec<User>> {
        let users = match owner_admin_id {
            Some(admin_id) => {
                sqlx::query_as::<_, User>(
                    "SELECT * FROM users WHERE owner_admin_id = ? ORDER BY id",
                )
                .bind(admin_id)
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query_as::<_, User>("SELECT * FROM users ORDER BY id")
                    .fetch_all(self.pool())
                    .await?
            }
        };
        Ok(users)
    }

    /// Users whose credentials belong on the given node
    pub async fn users_on_node(&self, node_id: i64) -> Result<Vec<User>> {
        Ok(
            sqlx::query_as::<_, User>("SELECT * FROM users WHERE active_node_id = ? ORDER BY id")
                .bind(node_id)
                .fetch_all(self.pool())
                .await?,
        )
    }

    /// `(id, account_number)` pairs for mapping worker stat names to users
    pub async fn usage_mapping(&self) -> Result<Vec<(i64, String)>> {
        Ok(
            sqlx::query_as::<_, (i64, String)>("SELECT id, account_number FROM users")
                .fetch_all(self.pool())
                .await?,
        )
    }

    pub async fn proxies_for_user(&self, user_id: i64) -> Result<Vec<Proxy>> {
        Ok(
            sqlx::query_as::<_, Proxy>("SELECT * FROM proxies WHERE user_id = ? ORDER BY id")
                .bind(user_id)
                .fetch_all(self.pool())
                .await?,
        )
    }

    pub async fn next_plan(&self, user_id: i64) -> Result<Option<NextPlan>> {
        Ok(
            sqlx::query_as::<_, NextPlan>("SELECT * FROM next_plans WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(self.pool())
                .await?,
        )
    }

    /// Apply a field patch, re-deriving status from the data-limit and
    /// expiry rules.
    pub async fn update_user(&self, user_id: i64, patch: UserPatch) -> Result<User> {
        let mut user = self.user_by_id(user_id).await?;
        let now = Utc::now();
        let original_status = user.status;

        if let Some(status) = patch.status {
            if status == UserStatus::OnHold {
                let duration = patch
                    .on_hold_expire_duration
                    .flatten()
                    .or(user.on_hold_expire_duration);
                if !matches!(duration, Some(d) if d > 0) {
                    return Err(PanelError::InvalidInput(
                        "on_hold status requires a positive on_hold_expire_duration".to_string(),
                    ));
                }
            }
            user.status = status;
        }
        if let Some(limit) = patch.data_limit {
            user.data_limit = limit;
        }
        if let Some(strategy) = patch.data_limit_reset_strategy {
            user.data_limit_reset_strategy = strategy;
        }
        if let Some(expire) = patch.expire {
            user.expire = expire;
        }
        if let Some(duration) = patch.on_hold_expire_duration {
            if duration == Some(0) {
                return Err(PanelError::InvalidInput(
                    "on_hold_expire_duration must be positive".to_string(),
                ));
            }
            user.on_hold_expire_duration = duration;
        }
        if let Some(timeout) = patch.on_hold_timeout {
            user.on_hold_timeout = timeout;
        }
        if let Some(days) = patch.auto_delete_in_days {
            user.auto_delete_in_days = days;
        }
        if let Some(note) = patch.note {
            user.note = note;
        }

        // Status derivation from a data-limit change
        if patch.data_limit.is_some()
            && !matches!(user.status, UserStatus::Expired | UserStatus::Disabled)
        {
            match user.data_limit {
                None => {
                    if user.status == UserStatus::Limited {
                        user.status = UserStatus::Active;
                    }
                }
                Some(limit) => {
                    if user.used_traffic >= limit && user.used_traffic > 0 {
                        if user.status != UserStatus::OnHold {
                            user.status = UserStatus::Limited;
                        }
                    } else if user.status == UserStatus::Limited {
                        user.status = UserStatus::Active;
                    }
                }
            }
        }

        // Status derivation from an expiry change
        if patch.expire.is_some()
            && matches!(
                user.status,
                UserStatus::Active | UserStatus::Expired | UserStatus::Limited
            )
        {
            match user.expire {
                None => {
                    if user.status == UserStatus::Expired {
                        user.status = UserStatus::Active;
                    }
                }
                Some(expire) => {
                    if expire <= now.timestamp() {
                        user.status = UserStatus::Expired;
                    } else if user.status == UserStatus::Expired {
                        user.status = UserStatus::Active;
                    }
                }
            }
        }

        if user.status != original_status {
            user.last_status_change = now;
        }
        user.edit_at = Some(now);

        let mut tx = self.pool().begin().await?;
        sqlx::query(
            r#"UPDATE users SET
               status = ?, data_limit = ?, data_limit_reset_strategy = ?, expire = ?,
               on_hold_expire_duration = ?, on_hold_timeout = ?, auto_delete_in_days = ?,
               note = ?, edit_at = ?, last_status_change = ?
               WHERE id = ?"#,
        )
        .bind(user.status)
        .bind(user.data_limit)
        .bind(user.data_limit_reset_strategy)
        .bind(user.expire)
        .bind(user.on_hold_expire_duration)
        .bind(user.on_hold_timeout)
        .bind(user.auto_delete_in_days)
        .bind(&user.note)
        .bind(user.edit_at)
        .bind(user.last_status_change)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        if let Some(proxies) = &patch.proxies {
            sqlx::query("DELETE FROM proxies WHERE user_id = ?")
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
            for settings in proxies {
                sqlx::query("INSERT INTO proxies (user_id, protocol, settings) VALUES (?, ?, ?)")
                    .bind(user_id)
                    .bind(settings.protocol())
                    .bind(Json(settings))
                    .execute(&mut *tx)
                    .await?;
            }
        }

        if let Some(plan) = &patch.next_plan {
            sqlx::query("DELETE FROM next_plans WHERE user_id = ?")
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
            if let Some(plan) = plan {
                sqlx::query(
                    r#"INSERT INTO next_plans (user_id, data_limit, expire, add_remaining_traffic, fire_on_either)
                       VALUES (?, ?, ?, ?, ?)"#,
                )
                .bind(user_id)
                .bind(plan.data_limit)
                .bind(plan.expire)
                .bind(plan.add_remaining_traffic)
                .bind(plan.fire_on_either)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        self.user_by_id(user_id).await
    }

    /// Set a status directly (review/scheduler path), stamping the
    /// transition time.
    pub async fn set_user_status(&self, user_id: i64, status: UserStatus) -> Result<()> {
        sqlx::query(
            "UPDATE users SET status = ?, last_status_change = ? WHERE id = ? AND status <> ?",
        )
        .bind(status)
        .bind(Utc::now())
        .bind(user_id)
        .bind(status)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Convert a cleared hold into a running expiry window.
    pub async fn start_user_expire(&self, user: &User) -> Result<()> {
        let Some(duration) = user.on_hold_expire_duration else {
            return Ok(());
        };
        let expire = Utc::now().timestamp() + duration;
        sqlx::query(
            r#"UPDATE users SET expire = ?, on_hold_expire_duration = NULL, on_hold_timeout = NULL
               WHERE id = ?"#,
        )
        .bind(expire)
        .bind(user.id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_active_node(&self, user_id: i64, node_id: Option<i64>) -> Result<()> {
        sqlx::query("UPDATE users SET active_node_id = ?, last_status_change = ? WHERE id = ?")
            .bind(node_id)
            .bind(Utc::now())
            .bind(user_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Zero the usage counter, logging the pre-reset value and dropping
    /// per-node attribution rows and any pending plan.
    pub async fn reset_user_data_usage(&self, user_id: i64) -> Result<User> {
        let user = self.user_by_id(user_id).await?;
        let now = Utc::now();

        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "INSERT INTO usage_reset_logs (user_id, used_traffic_at_reset, reset_at) VALUES (?, ?, ?)",
        )
        .bind(user_id)
        .bind(user.used_traffic)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE users SET used_traffic = 0 WHERE id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM per_node_user_usages WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM next_plans WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        if user.status == UserStatus::Limited {
            sqlx::query("UPDATE users SET status = ?, last_status_change = ? WHERE id = ?")
                .bind(UserStatus::Active)
                .bind(now)
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        self.user_by_id(user_id).await
    }

    /// Merge the pending plan into the user and activate. Fails `NotFound`
    /// when no plan is pending.
    pub async fn apply_next_plan(&self, user_id: i64) -> Result<User> {
        let user = self.user_by_id(user_id).await?;
        let plan = self.next_plan(user_id).await?.ok_or(PanelError::NotFound)?;
        let now = Utc::now();

        let remaining = if plan.add_remaining_traffic {
            user.data_limit
                .map(|limit| (limit - user.used_traffic).max(0))
                .unwrap_or(0)
        } else {
            0
        };
        let data_limit = plan.data_limit.map(|dl| dl + remaining);
        let expire = plan.expire.map(|seconds| now.timestamp() + seconds);

        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "INSERT INTO usage_reset_logs (user_id, used_traffic_at_reset, reset_at) VALUES (?, ?, ?)",
        )
        .bind(user_id)
        .bind(user.used_traffic)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM per_node_user_usages WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"UPDATE users SET
               data_limit = ?, expire = ?, used_traffic = 0,
               status = ?, last_status_change = ?
               WHERE id = ?"#,
        )
        .bind(data_limit)
        .bind(expire)
        .bind(UserStatus::Active)
        .bind(now)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM next_plans WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        self.user_by_id(user_id).await
    }

    /// Invalidate issued subscription tokens and regenerate every proxy
    /// secret in place.
    pub async fn revoke_user_sub(&self, user_id: i64) -> Result<User> {
        let proxies = self.proxies_for_user(user_id).await?;
        let mut tx = self.pool().begin().await?;
        sqlx::query("UPDATE users SET sub_revoked_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        for proxy in proxies {
            let mut settings = proxy.settings.0.clone();
            settings.revoke();
            sqlx::query("UPDATE proxies SET settings = ? WHERE id = ?")
                .bind(Json(&settings))
                .bind(proxy.id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        self.user_by_id(user_id).await
    }

    /// Record a subscription fetch (refresh time + requesting client).
    pub async fn update_user_sub(&self, user_id: i64, user_agent: &str) -> Result<()> {
        sqlx::query("UPDATE users SET sub_updated_at = ?, sub_last_user_agent = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(user_agent)
            .bind(user_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn record_user_online(&self, user_id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE users SET online_at = ? WHERE id = ?")
            .bind(at)
            .bind(user_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn delete_user(&self, user_id: i64) -> Result<()> {
        let affected = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(user_id)
            .execute(self.pool())
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(PanelError::NotFound);
        }
        Ok(())
    }

    /// Latest usage reset time, falling back to creation.
    pub async fn last_usage_reset(&self, user: &User) -> Result<DateTime<Utc>> {
        let log = sqlx::query_as::<_, UsageResetLog>(
            "SELECT * FROM usage_reset_logs WHERE user_id = ? ORDER BY reset_at DESC LIMIT 1",
        )
        .bind(user.id)
        .fetch_optional(self.pool())
        .await?;
        Ok(log.map(|l| l.reset_at).unwrap_or(user.created_at))
    }

    /// Users whose terminal status has outlived its auto-delete window.
    /// Deletion is the caller's responsibility.
    pub async fn autodelete_candidates(
        &self,
        include_limited: bool,
        default_days: i64,
    ) -> Result<Vec<User>> {
        let statuses = if include_limited {
            vec![UserStatus::Expired, UserStatus::Limited]
        } else {
            vec![UserStatus::Expired]
        };
        let now = Utc::now();
        let mut candidates = Vec::new();
        for status in statuses {
            let users = self.users_with_status(status).await?;
            for user in users {
                let days = user.auto_delete_in_days.unwrap_or(default_days);
                if days < 0 {
                    continue;
                }
                if user.last_status_change + chrono::Duration::days(days) <= now {
                    candidates.push(user);
                }
            }
        }
        Ok(candidates)
    }
}
