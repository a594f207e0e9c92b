//! In-process job scheduler
//!
//! Named periodic jobs on tokio intervals. Missed ticks coalesce (the
//! interval skips them) and a per-job guard keeps at most one instance
//! running, so a slow tick never stacks up behind itself. Jobs must not
//! propagate errors; they log and return.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct Scheduler {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Scheduler {
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    /// Register a named periodic job. `make_job` is called once per tick
    /// and its future awaited to completion before the guard releases.
    pub fn every<F, Fut>(&mut self, name: &'static str, period: Duration, make_job: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let running = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown_rx.changed() => {
                        debug!(job = name, "scheduler job stopped");
                        return;
                    }
                }
                if running.swap(true, Ordering::SeqCst) {
                    // Previous instance still running; coalesce this tick.
                    warn!(job = name, "previous run still active, skipping tick");
                    continue;
                }
                let guard = Arc::clone(&running);
                let job = make_job();
                // Run inline so long jobs delay only their own schedule.
                job.await;
                guard.store(false, Ordering::SeqCst);
            }
        });
        self.handles.push(handle);
        info!(job = name, period_s = period.as_secs_f32(), "job scheduled");
    }

    /// Signal all jobs to stop and wait for them to finish their current
    /// tick.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        info!("scheduler stopped");
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test(start_paused = true)]
    async fn jobs_tick_and_stop() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut scheduler = Scheduler::new();
        let seen = Arc::clone(&counter);
        scheduler.every("tick", Duration::from_secs(5), move || {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(16)).await;
        let ticks = counter.load(Ordering::SeqCst);
        assert!(ticks >= 3, "expected at least 3 ticks, got {}", ticks);

        scheduler.shutdown().await;
        let after_shutdown = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), after_shutdown);
    }
}
