//! Usage pipeline and periodic review
//!
//! ## Overview
//! - Collect per-user byte counters from every connected worker
//! - Attribute traffic to the user's active node with its coefficient
//! - Enforce quotas, expiry, on-hold conversion and pending plans
//! - Periodic usage resets, auto-delete sweeps and reminder eviction
//!
//! Every entry point here is a scheduler job body: it logs failures and
//! returns, never propagating errors upward.

use std::collections::HashMap;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::models::{hour_bucket, NodeStatus, ReminderType, UserStatus};
use crate::ops::Operations;
use crate::store::usage::UserUsageDelta;

/// Usage fraction that triggers a data-usage reminder row
const USAGE_REMINDER_PERCENT: i64 = 80;
/// Days-left threshold that triggers an expiration reminder row
const EXPIRE_REMINDER_DAYS: i64 = 3;

pub struct UsagePipeline {
    ops: Operations,
    autodelete_include_limited: bool,
    autodelete_default_days: i64,
}

impl UsagePipeline {
    pub fn new(
        ops: Operations,
        autodelete_include_limited: bool,
        autodelete_default_days: i64,
    ) -> Self {
        UsagePipeline {
            ops,
            autodelete_include_limited,
            autodelete_default_days,
        }
    }

    /// One collection tick: poll every connected node, attribute deltas to
    /// the users' active nodes, commit once.
    pub async fn collect_user_usages(&self) {
        let store = self.ops.store();
        let clients = self.ops.registry().all().await;
        if clients.is_empty() {
            debug!("no node clients registered, skipping usage collection");
            return;
        }

        let mapping = match store.usage_mapping().await {
            Ok(mapping) => mapping,
            Err(err) => {
                warn!(error = %err, "cannot load user mapping, skipping tick");
                return;
            }
        };
        let mut name_to_user: HashMap<String, i64> = HashMap::with_capacity(mapping.len() * 2);
        for (user_id, account_number) in &mapping {
            name_to_user.insert(format!("{}.{}", user_id, account_number), *user_id);
            // Legacy engines report the bare account number
            name_to_user.insert(account_number.clone(), *user_id);
        }

        let mut totals: HashMap<i64, i64> = HashMap::new();
        for client in clients {
            if !client.connected().await {
                continue;
            }
            match client.get_all_users_traffic(true).await {
                Ok(stats) => {
                    for stat in stats {
                        let Some(user_id) = name_to_user.get(&stat.name) else {
                            warn!(name = %stat.name, node = %client.name(), "stat for unknown user");
                            continue;
                        };
                        *totals.entry(*user_id).or_default() += stat.uplink + stat.downlink;
                    }
                }
                Err(err) => {
                    warn!(node = %client.name(), error = %err, "stats fetch failed");
                }
            }
        }
        if totals.is_empty() {
            return;
        }

        let mut deltas = Vec::with_capacity(totals.len());
        for (user_id, raw_total) in totals {
            let user = match store.user_by_id(user_id).await {
                Ok(user) => user,
                Err(_) => continue,
            };
            let coefficient = match user.active_node_id {
                Some(node_id) => store
                    .node(node_id)
                    .await
                    .map(|n| n.usage_coefficient)
                    .unwrap_or(1.0),
                None => 1.0,
            };
            let delta = (raw_total as f64 * coefficient) as i64;
            if delta > 0 {
                deltas.push(UserUsageDelta {
                    user_id,
                    node_id: user.active_node_id,
                    delta,
                });
            }
        }

        let count = deltas.len();
        if let Err(err) = store.apply_usage_deltas(&deltas, Utc::now()).await {
            warn!(error = %err, "usage delta commit failed");
        } else {
            debug!(users = count, "usage tick recorded");
        }
    }

    /// Roll the current hour's attribution rows up into per-node totals.
    pub async fn aggregate_node_usages(&self) {
        if let Err(err) = self
            .ops
            .store()
            .aggregate_node_usage(hour_bucket(Utc::now()))
            .await
        {
            warn!(error = %err, "node usage aggregation failed");
        }
    }

    /// Review pass over active users: quota trips, expiry, pending plans;
    /// then clear matured holds.
    pub async fn review_users(&self) {
        let store = self.ops.store();
        let now = Utc::now();
        let now_ts = now.timestamp();

        let active = match store.users_with_status(UserStatus::Active).await {
            Ok(users) => users,
            Err(err) => {
                warn!(error = %err, "review: cannot list active users");
                return;
            }
        };
        for user in active {
            let limited = user.is_limited_by(user.used_traffic);
            let expired = user.is_expired_at(now_ts);

            if limited || expired {
                if let Ok(Some(plan)) = store.next_plan(user.id).await {
                    if plan.fire_on_either || (limited && expired) {
                        match store.apply_next_plan(user.id).await {
                            Ok(_) => {
                                info!(user_id = user.id, "pending plan applied");
                                self.reapply(user.id).await;
                                continue;
                            }
                            Err(err) => {
                                warn!(user_id = user.id, error = %err, "next plan failed")
                            }
                        }
                    }
                }
            }

            let new_status = if limited {
                UserStatus::Limited
            } else if expired {
                UserStatus::Expired
            } else {
                self.record_reminders(&user, now_ts).await;
                continue;
            };

            if let Err(err) = store.set_user_status(user.id, new_status).await {
                warn!(user_id = user.id, error = %err, "status update failed");
                continue;
            }
            info!(user_id = user.id, status = ?new_status, "user status changed");
            self.reapply(user.id).await;
        }

        let on_hold = match store.users_with_status(UserStatus::OnHold).await {
            Ok(users) => users,
            Err(err) => {
                warn!(error = %err, "review: cannot list on-hold users");
                return;
            }
        };
        for user in on_hold {
            // Hold clears on first connect after the base time, or when the
            // timeout lapses. Base is the last edit, else creation.
            let base = user.edit_at.unwrap_or(user.created_at);
            let came_online = user.online_at.map(|at| at >= base).unwrap_or(false);
            let timed_out = user
                .on_hold_timeout
                .map(|timeout| timeout.timestamp() <= now_ts)
                .unwrap_or(false);
            if !came_online && !timed_out {
                continue;
            }
            if let Err(err) = store.start_user_expire(&user).await {
                warn!(user_id = user.id, error = %err, "hold conversion failed");
                continue;
            }
            if let Err(err) = store.set_user_status(user.id, UserStatus::Active).await {
                warn!(user_id = user.id, error = %err, "status update failed");
                continue;
            }
            info!(user_id = user.id, "on-hold user activated");
            self.reapply(user.id).await;
        }
    }

    /// Record threshold reminder rows for the notification dispatchers.
    /// Uniqueness on (user, type, threshold) keeps them one-shot.
    async fn record_reminders(&self, user: &crate::models::User, now_ts: i64) {
        let store = self.ops.store();
        if let Some(limit) = user.data_limit {
            if limit > 0 {
                let percent = user.used_traffic.saturating_mul(100) / limit;
                if percent >= USAGE_REMINDER_PERCENT {
                    let _ = store
                        .create_reminder(
                            user.id,
                            ReminderType::DataUsage,
                            Some(USAGE_REMINDER_PERCENT),
                            user.expire.and_then(|e| chrono::DateTime::from_timestamp(e, 0)),
                        )
                        .await;
                }
            }
        }
        if let Some(expire) = user.expire {
            let days_left = (expire - now_ts) / 86_400;
            if days_left <= EXPIRE_REMINDER_DAYS {
                let _ = store
                    .create_reminder(
                        user.id,
                        ReminderType::ExpirationDate,
                        Some(EXPIRE_REMINDER_DAYS),
                        chrono::DateTime::from_timestamp(expire, 0),
                    )
                    .await;
            }
        }
    }

    /// Hourly: reset usage for users whose reset window has elapsed.
    pub async fn periodic_reset(&self) {
        let store = self.ops.store();
        let now = Utc::now();
        for status in [UserStatus::Active, UserStatus::Limited] {
            let users = match store.users_with_status(status).await {
                Ok(users) => users,
                Err(err) => {
                    warn!(error = %err, "periodic reset: cannot list users");
                    return;
                }
            };
            for user in users {
                let Some(period_days) = user.data_limit_reset_strategy.period_days() else {
                    continue;
                };
                let last_reset = match store.last_usage_reset(&user).await {
                    Ok(at) => at,
                    Err(_) => continue,
                };
                if now - last_reset < chrono::Duration::days(period_days) {
                    continue;
                }
                let was_limited = user.status == UserStatus::Limited;
                match store.reset_user_data_usage(user.id).await {
                    Ok(_) => {
                        info!(user_id = user.id, "periodic usage reset");
                        if was_limited {
                            self.reapply(user.id).await;
                        }
                    }
                    Err(err) => warn!(user_id = user.id, error = %err, "periodic reset failed"),
                }
            }
        }
    }

    /// Six-hourly: deactivate and delete users past their auto-delete
    /// window.
    pub async fn autodelete_expired(&self) {
        let store = self.ops.store();
        let candidates = match store
            .autodelete_candidates(self.autodelete_include_limited, self.autodelete_default_days)
            .await
        {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(error = %err, "autodelete: candidate query failed");
                return;
            }
        };
        for user in candidates {
            match self.ops.delete_user(&user.account_number).await {
                Ok(()) => info!(user_id = user.id, "expired user deleted"),
                Err(err) => warn!(user_id = user.id, error = %err, "autodelete failed"),
            }
        }
    }

    /// Two-hourly: evict reminder rows past their expiry.
    pub async fn sweep_reminders(&self) {
        match self.ops.store().sweep_expired_reminders().await {
            Ok(evicted) if evicted > 0 => debug!(evicted, "expired reminders evicted"),
            Ok(_) => {}
            Err(err) => warn!(error = %err, "reminder sweep failed"),
        }
    }

    /// Health tick: probe connected nodes, recover errored ones.
    pub async fn health_check(&self) {
        let store = self.ops.store();
        let nodes = match store.enabled_nodes().await {
            Ok(nodes) => nodes,
            Err(err) => {
                warn!(error = %err, "health check: cannot list nodes");
                return;
            }
        };
        for node in nodes {
            if node.status == NodeStatus::Connected {
                if let Some(client) = self.ops.registry().get(node.id).await {
                    let alive = client.ping().await.is_ok()
                        && client.get_system_stats().await.is_ok();
                    if alive {
                        continue;
                    }
                    warn!(node_id = node.id, "health probe failed, reconnecting");
                    let _ = store
                        .set_node_status(
                            node.id,
                            NodeStatus::Error,
                            Some("health probe failed"),
                            None,
                        )
                        .await;
                }
            }
            if let Err(err) = self.ops.connect_node(node.id).await {
                warn!(node_id = node.id, error = %err, "reconnect failed");
            }
        }
    }

    async fn reapply(&self, user_id: i64) {
        if let Err(err) = self.ops.reapply_user(user_id).await {
            warn!(user_id, error = %err, "reapply failed");
        }
    }
}
