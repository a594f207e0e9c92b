//! Host NIC counter sampling
//!
//! Feeds the dashboard's realtime bandwidth gauge. Counters come from
//! `/proc/net/dev`; the loopback interface is excluded. Non-Linux hosts
//! simply report zeros.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tracing::debug;

/// Last sampled rates in bytes per second
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct BandwidthSnapshot {
    pub incoming_bps: i64,
    pub outgoing_bps: i64,
    pub incoming_total: i64,
    pub outgoing_total: i64,
}

#[derive(Default)]
struct Counters {
    rx_total: AtomicI64,
    tx_total: AtomicI64,
    rx_rate: AtomicI64,
    tx_rate: AtomicI64,
}

/// In-memory gauge updated by the sampling job
#[derive(Clone, Default)]
pub struct BandwidthGauge {
    counters: Arc<Counters>,
}

fn read_nic_totals() -> Option<(i64, i64)> {
    let content = std::fs::read_to_string("/proc/net/dev").ok()?;
    let mut rx_total: i64 = 0;
    let mut tx_total: i64 = 0;
    for line in content.lines().skip(2) {
        let Some((name, rest)) = line.split_once(':') else {
            continue;
        };
        if name.trim() == "lo" {
            continue;
        }
        let fields: Vec<&str> = rest.split_whitespace().collect();
        // Field 0 is rx bytes, field 8 is tx bytes
        if fields.len() >= 9 {
            rx_total += fields[0].parse::<i64>().unwrap_or(0);
            tx_total += fields[8].parse::<i64>().unwrap_or(0);
        }
    }
    Some((rx_total, tx_total))
}

impl BandwidthGauge {
    pub fn new() -> Self {
        Self::default()
    }

    /// One sampling tick; rates derive from the previous totals and the
    /// tick period.
    pub fn sample(&self, period_secs: f64) {
        let Some((rx_total, tx_total)) = read_nic_totals() else {
            return;
        };
        let prev_rx = self.counters.rx_total.swap(rx_total, Ordering::Relaxed);
        let prev_tx = self.counters.tx_total.swap(tx_total, Ordering::Relaxed);
        if prev_rx > 0 && period_secs > 0.0 {
            let rx_rate = ((rx_total - prev_rx) as f64 / period_secs) as i64;
            let tx_rate = ((tx_total - prev_tx) as f64 / period_secs) as i64;
            self.counters.rx_rate.store(rx_rate.max(0), Ordering::Relaxed);
            self.counters.tx_rate.store(tx_rate.max(0), Ordering::Relaxed);
            debug!(rx_rate, tx_rate, "bandwidth sampled");
        }
    }

    pub fn snapshot(&self) -> BandwidthSnapshot {
        BandwidthSnapshot {
            incoming_bps: self.counters.rx_rate.load(Ordering::Relaxed),
            outgoing_bps: self.counters.tx_rate.load(Ordering::Relaxed),
            incoming_total: self.counters.rx_total.load(Ordering::Relaxed),
            outgoing_total: self.counters.tx_total.load(Ordering::Relaxed),
        }
    }
}
