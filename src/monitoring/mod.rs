//! Relay-wide Prometheus metrics (spec §2's Telemetry addition), queried
//! from the Store rather than held purely in memory so they reflect durable
//! state, not just what has passed through this process since boot.
//!
//! Gauges for queue depths, counters for transaction and rejection
//! outcomes, and a histogram for gas used.

use once_cell::sync::Lazy;
use prometheus::{
    linear_buckets, register_gauge, register_histogram, register_int_counter_vec, Gauge, Histogram,
    IntCounterVec,
};

use crate::store::Store;

static PENDING_TRANSACTIONS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "relay_pending_transactions",
        "Transactions currently in the pending status."
    )
    .unwrap()
});

static TRANSACTIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "relay_transactions_total",
        "Transactions that reached a terminal or pending status, by network and status.",
        &["network", "status"]
    )
    .unwrap()
});

static REJECTIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "relay_pipeline_rejections_total",
        "Requests the Relay Pipeline rejected before broadcast, by code.",
        &["code"]
    )
    .unwrap()
});

static GAS_USED: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "relay_observed_gas_used",
        "Gas used by confirmed transactions.",
        linear_buckets(f64::from(21_000), f64::from(25_000), 40).unwrap()
    )
    .unwrap()
});

/// Queries the Store for gauge-style metrics that reflect durable state
/// (the pending-transaction count), rather than accumulating them purely
/// from in-process events.
pub struct Monitoring;

impl Monitoring {
    /// Refreshes gauges that reflect durable queue depth; intended to be
    /// called on the same cadence as the Confirmation Tracker's scan.
    #[allow(clippy::cast_precision_loss)]
    pub async fn log_queue_depths(store: &Store) -> anyhow::Result<()> {
        let pending = store.list_pending().await?;
        PENDING_TRANSACTIONS.set(pending.len() as f64);
        Ok(())
    }

    /// Called by the pipeline once a transaction reaches `pending`, and by
    /// the Confirmation Tracker once it reaches a terminal status.
    pub fn record_transaction(network: &str, status: &str) {
        TRANSACTIONS_TOTAL.with_label_values(&[network, status]).inc();
    }

    /// Called by the HTTP handler whenever the pipeline rejects a request
    /// before broadcast (spec §6's `code` values).
    pub fn record_rejection(code: &str) {
        REJECTIONS_TOTAL.with_label_values(&[code]).inc();
    }

    /// Called by the Confirmation Tracker once a receipt's gas usage is
    /// known.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_gas_used(gas_used: u128) {
        GAS_USED.observe(gas_used as f64);
    }
}
