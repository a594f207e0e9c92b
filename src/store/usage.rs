//! Traffic accounting rows: hourly per-user attribution and per-node
//! aggregates

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{PerNodeUsage, PerNodeUserUsage};

use super::Store;

/// One user's collected traffic for a tick, attributed to their active node
#[derive(Debug, Clone)]
pub struct UserUsageDelta {
    pub user_id: i64,
    pub node_id: Option<i64>,
    pub delta: i64,
}

impl Store {
    /// Upsert a user's traffic delta into its `(hour, user, node)` bucket.
    /// A zero delta is a no-op.
    pub async fn record_per_node_user_usage(
        &self,
        user_id: i64,
        node_id: i64,
        bucket: DateTime<Utc>,
        delta: i64,
    ) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }
        let bucket = crate::models::hour_bucket(bucket);
        sqlx::query(
            r#"INSERT INTO per_node_user_usages (user_id, node_id, hour_bucket, used_traffic)
               VALUES (?, ?, ?, ?)
               ON CONFLICT (hour_bucket, user_id, node_id)
               DO UPDATE SET used_traffic = used_traffic + excluded.used_traffic"#,
        )
        .bind(user_id)
        .bind(node_id)
        .bind(bucket)
        .bind(delta)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Add collected traffic to the user's lifetime counter.
    pub async fn add_user_traffic(&self, user_id: i64, delta: i64) -> Result<()> {
        sqlx::query("UPDATE users SET used_traffic = used_traffic + ?, online_at = ? WHERE id = ?")
            .bind(delta)
            .bind(Utc::now())
            .bind(user_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Apply one collection tick's worth of deltas in a single transaction:
    /// lifetime counters, online stamps and hourly attribution rows.
    pub async fn apply_usage_deltas(
        &self,
        deltas: &[UserUsageDelta],
        bucket: DateTime<Utc>,
    ) -> Result<()> {
        if deltas.is_empty() {
            return Ok(());
        }
        let bucket = crate::models::hour_bucket(bucket);
        let now = Utc::now();
        let mut tx = self.pool().begin().await?;
        for delta in deltas {
            if delta.delta <= 0 {
                continue;
            }
            sqlx::query(
                "UPDATE users SET used_traffic = used_traffic + ?, online_at = ? WHERE id = ?",
            )
            .bind(delta.delta)
            .bind(now)
            .bind(delta.user_id)
            .execute(&mut *tx)
            .await?;
            if let Some(node_id) = delta.node_id {
                sqlx::query(
                    r#"INSERT INTO per_node_user_usages (user_id, node_id, hour_bucket, used_traffic)
                       VALUES (?, ?, ?, ?)
                       ON CONFLICT (hour_bucket, user_id, node_id)
                       DO UPDATE SET used_traffic = used_traffic + excluded.used_traffic"#,
                )
                .bind(delta.user_id)
                .bind(node_id)
                .bind(bucket)
                .bind(delta.delta)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// Roll the per-user rows of one hour bucket up into per-node totals.
    /// The whole total lands on `downlink`; the write is idempotent so a
    /// re-run of the same bucket cannot double-count.
    pub async fn aggregate_node_usage(&self, bucket: DateTime<Utc>) -> Result<()> {
        let bucket = crate::models::hour_bucket(bucket);
        let totals = sqlx::query_as::<_, (i64, i64)>(
            r#"SELECT node_id, SUM(used_traffic) FROM per_node_user_usages
               WHERE hour_bucket = ? GROUP BY node_id"#,
        )
        .bind(bucket)
        .fetch_all(self.pool())
        .await?;

        for (node_id, total) in totals {
            if total == 0 {
                continue;
            }
            sqlx::query(
                r#"INSERT INTO per_node_usages (node_id, hour_bucket, uplink, downlink)
                   VALUES (?, ?, 0, ?)
                   ON CONFLICT (hour_bucket, node_id)
                   DO UPDATE SET downlink = excluded.downlink"#,
            )
            .bind(node_id)
            .bind(bucket)
            .bind(total)
            .execute(self.pool())
            .await?;
        }
        Ok(())
    }

    pub async fn per_node_user_usages(&self, user_id: i64) -> Result<Vec<PerNodeUserUsage>> {
        Ok(sqlx::query_as::<_, PerNodeUserUsage>(
            "SELECT * FROM per_node_user_usages WHERE user_id = ? ORDER BY hour_bucket",
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await?)
    }

    pub async fn per_node_usage(
        &self,
        node_id: i64,
        bucket: DateTime<Utc>,
    ) -> Result<Option<PerNodeUsage>> {
        let bucket = crate::models::hour_bucket(bucket);
        Ok(sqlx::query_as::<_, PerNodeUsage>(
            "SELECT * FROM per_node_usages WHERE node_id = ? AND hour_bucket = ?",
        )
        .bind(node_id)
        .bind(bucket)
        .fetch_optional(self.pool())
        .await?)
    }
}
