//! Notification reminder markers
//!
//! A reminder row records that a threshold notification went out, so the
//! review loop does not repeat it. Rows expire with the condition they
//! tracked.

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{NotificationReminder, ReminderType};

use super::Store;

impl Store {
    pub async fn create_reminder(
        &self,
        user_id: i64,
        reminder_type: ReminderType,
        threshold: Option<i64>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT OR IGNORE INTO notification_reminders
               (user_id, reminder_type, threshold, expires_at, created_at)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(user_id)
        .bind(reminder_type)
        .bind(threshold)
        .bind(expires_at)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn reminder(
        &self,
        user_id: i64,
        reminder_type: ReminderType,
        threshold: Option<i64>,
    ) -> Result<Option<NotificationReminder>> {
        Ok(sqlx::query_as::<_, NotificationReminder>(
            r#"SELECT * FROM notification_reminders
               WHERE user_id = ? AND reminder_type = ? AND (threshold IS ? OR threshold = ?)"#,
        )
        .bind(user_id)
        .bind(reminder_type)
        .bind(threshold)
        .bind(threshold)
        .fetch_optional(self.pool())
        .await?)
    }

    /// Evict reminders whose expiry has passed.
    pub async fn sweep_expired_reminders(&self) -> Result<u64> {
        let affected =
            sqlx::query("DELETE FROM notification_reminders WHERE expires_at IS NOT NULL AND expires_at <= ?")
                .bind(Utc::now())
                .execute(self.pool())
                .await?
                .rows_affected();
        Ok(affected)
    }
}
