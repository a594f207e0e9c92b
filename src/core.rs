//! Panel core
//!
//! One explicit value owning every long-lived component, brought up in
//! dependency order (store, PKI, registry, operations, scheduler) and torn
//! down in reverse. Nothing here is a global: the HTTP adapter and jobs
//! borrow what they need from the `Core`.

use std::sync::Arc;

use tracing::{info, warn};

use crate::bandwidth::BandwidthGauge;
use crate::error::Result;
use crate::ops::Operations;
use crate::pki::Pki;
use crate::registry::NodeRegistry;
use crate::scheduler::Scheduler;
use crate::settings::Settings;
use crate::store::Store;
use crate::token::TokenService;
use crate::usage::UsagePipeline;

pub struct Core {
    pub settings: Settings,
    pub store: Store,
    pub tokens: TokenService,
    pub pki: Arc<Pki>,
    pub registry: Arc<NodeRegistry>,
    pub ops: Operations,
    pub bandwidth: BandwidthGauge,
    scheduler: Option<Scheduler>,
}

impl Core {
    /// Bring the panel up: open the store, warm the PKI, connect enabled
    /// nodes in the background and start the job scheduler.
    pub async fn start(settings: Settings) -> Result<Core> {
        let store = Store::connect(&settings.db_url).await?;
        let secret = store.jwt_secret().await?;
        let tokens = TokenService::new(secret);

        let pki = Arc::new(Pki::new(store.clone()));
        // CA problems are startup-fatal: without it no node channel works.
        pki.ca().await?;

        let registry = Arc::new(NodeRegistry::new());
        let ops = Operations::new(store.clone(), Arc::clone(&registry), Arc::clone(&pki));
        let bandwidth = BandwidthGauge::new();

        let pipeline = Arc::new(UsagePipeline::new(
            ops.clone(),
            settings.autodelete_include_limited,
            settings.users_autodelete_days,
        ));

        // Kick off connections to every node an admin has not disabled.
        for node in store.enabled_nodes().await? {
            let ops = ops.clone();
            tokio::spawn(async move {
                if let Err(err) = ops.connect_node(node.id).await {
                    warn!(node_id = node.id, error = %err, "initial connect failed");
                }
            });
        }

        let scheduler = if settings.disable_periodic_jobs {
            info!("periodic jobs disabled by configuration");
            None
        } else {
            let mut scheduler = Scheduler::new();
            {
                let pipeline = Arc::clone(&pipeline);
                scheduler.every("health_check", settings.health_check_interval, move || {
                    let pipeline = Arc::clone(&pipeline);
                    async move { pipeline.health_check().await }
                });
            }
            if !settings.disable_usage_recording {
                let collect = Arc::clone(&pipeline);
                scheduler.every(
                    "collect_user_usage",
                    settings.usage_collect_interval,
                    move || {
                        let pipeline = Arc::clone(&collect);
                        async move { pipeline.collect_user_usages().await }
                    },
                );
                let aggregate = Arc::clone(&pipeline);
                scheduler.every(
                    "aggregate_node_usage",
                    settings.usage_aggregate_interval,
                    move || {
                        let pipeline = Arc::clone(&aggregate);
                        async move { pipeline.aggregate_node_usages().await }
                    },
                );
            }
            {
                let pipeline = Arc::clone(&pipeline);
                scheduler.every("review_users", settings.review_interval, move || {
                    let pipeline = Arc::clone(&pipeline);
                    async move { pipeline.review_users().await }
                });
            }
            {
                let pipeline = Arc::clone(&pipeline);
                scheduler.every(
                    "periodic_reset",
                    std::time::Duration::from_secs(3600),
                    move || {
                        let pipeline = Arc::clone(&pipeline);
                        async move { pipeline.periodic_reset().await }
                    },
                );
            }
            {
                let pipeline = Arc::clone(&pipeline);
                scheduler.every(
                    "autodelete_expired",
                    std::time::Duration::from_secs(6 * 3600),
                    move || {
                        let pipeline = Arc::clone(&pipeline);
                        async move { pipeline.autodelete_expired().await }
                    },
                );
            }
            {
                let pipeline = Arc::clone(&pipeline);
                scheduler.every(
                    "reminder_sweep",
                    std::time::Duration::from_secs(2 * 3600),
                    move || {
                        let pipeline = Arc::clone(&pipeline);
                        async move { pipeline.sweep_reminders().await }
                    },
                );
            }
            {
                let gauge = bandwidth.clone();
                let period = settings.bandwidth_sample_interval;
                scheduler.every("bandwidth_sample", period, move || {
                    let gauge = gauge.clone();
                    async move { gauge.sample(period.as_secs_f64()) }
                });
            }
            Some(scheduler)
        };

        info!("panel core started");
        Ok(Core {
            settings,
            store,
            tokens,
            pki,
            registry,
            ops,
            bandwidth,
            scheduler,
        })
    }

    /// Tear down in reverse order: stop jobs, then release node sessions.
    pub async fn shutdown(mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.shutdown().await;
        }
        for client in self.registry.all().await {
            client.disconnect().await;
        }
        info!("panel core stopped");
    }
}
