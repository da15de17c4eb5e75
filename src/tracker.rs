//! Confirmation Tracker (C9): periodically scans `pending` records, polls
//! the Chain Client for receipts, and reconciles terminal outcomes (spec
//! §4.9).
//!
//! A `tokio::time::interval` drives a scan-and-reconcile pass, wrapped in
//! [`crate::utils::spawn_with_backoff_cancel_on_shutdown`]. Per-record
//! single-instance safety uses the Store's (C6) Postgres advisory lock so
//! more than one tracker process can run against the same database without
//! double-reconciling a record.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::U256;
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::chain::ChainClients;
use crate::domain::{TransactionRecord, TxStatus};
use crate::monitoring::Monitoring;
use crate::nonce::NonceAllocator;
use crate::store::Store;

/// Periodically reconciles `pending` transaction records against chain state
/// (spec §4.9).
pub struct ConfirmationTracker {
    store: Arc<Store>,
    chain: ChainClients,
    nonce: Arc<NonceAllocator>,
    scan_interval: Duration,
    dropped_grace_window: Duration,
}

impl ConfirmationTracker {
    #[must_use]
    pub fn new(
        store: Arc<Store>,
        chain: ChainClients,
        nonce: Arc<NonceAllocator>,
        scan_interval: Duration,
        dropped_grace_window: Duration,
    ) -> Self {
        Self {
            store,
            chain,
            nonce,
            scan_interval,
            dropped_grace_window,
        }
    }

    /// Runs the scan loop until cancelled. Intended to be driven by
    /// [`crate::utils::spawn_with_backoff_cancel_on_shutdown`] so a single
    /// scan's failure doesn't kill the task.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(self.scan_interval);
        loop {
            interval.tick().await;
            self.scan().await;
        }
    }

    /// A single scan pass over every `pending` record (spec §4.9). Errors
    /// reconciling one record are logged and don't stop the rest of the
    /// pass.
    #[instrument(skip(self))]
    async fn scan(&self) {
        let pending = match self.store.list_pending().await {
            Ok(records) => records,
            Err(err) => {
                warn!(%err, "failed to list pending records");
                return;
            }
        };

        for record in pending {
            if let Err(err) = self.reconcile(&record).await {
                warn!(tx_hash = %record.tx_hash, %err, "failed to reconcile pending record");
            }
        }
    }

    /// Takes the advisory lock for `record.tx_hash`, reconciles it against
    /// chain state, and releases the lock on every path (spec §4.9:
    /// "single-instance-safe").
    async fn reconcile(&self, record: &TransactionRecord) -> anyhow::Result<()> {
        if !self.store.try_lock_record(record.tx_hash).await? {
            return Ok(());
        }

        let result = self.reconcile_locked(record).await;

        if let Err(err) = self.store.unlock_record(record.tx_hash).await {
            warn!(tx_hash = %record.tx_hash, %err, "failed to release advisory lock");
        }

        result
    }

    async fn reconcile_locked(&self, record: &TransactionRecord) -> anyhow::Result<()> {
        let chain = self.chain.get(&record.network)?;

        let receipt = chain.receipt(record.tx_hash).await?;

        match receipt {
            // Mined: terminal status is driven by the receipt's own success
            // bit, not by whether it reverted during simulation earlier.
            Some(receipt) => {
                let status = if receipt.status() {
                    TxStatus::Confirmed
                } else {
                    TxStatus::Failed
                };
                let gas_used = U256::from(receipt.gas_used);
                self.store
                    .finalize(record.tx_hash, status, Some(gas_used), receipt.block_number)
                    .await?;
                let status_label = match status {
                    TxStatus::Confirmed => "confirmed",
                    TxStatus::Failed => "failed",
                    TxStatus::Pending | TxStatus::Dropped => "unexpected",
                };
                Monitoring::record_transaction(&record.network, status_label);
                Monitoring::record_gas_used(u128::try_from(gas_used).unwrap_or(u128::MAX));
                info!(tx_hash = %record.tx_hash, ?status, "transaction reconciled");
                Ok(())
            }
            // Not yet observed. Either still within grace, or old enough to
            // classify as dropped (chain has moved past this sequence
            // number for this relayer) or stuck (it hasn't).
            None => {
                let age = Utc::now() - record.submitted_at;
                let grace = chrono::Duration::from_std(self.dropped_grace_window)
                    .unwrap_or_else(|_| chrono::Duration::seconds(0));
                if age < grace {
                    return Ok(());
                }

                let on_chain_count = chain.pending_count(record.relayer_address).await?;
                match classify_unconfirmed(on_chain_count, record.sequence_number) {
                    Outcome::Dropped => {
                        self.store
                            .finalize(record.tx_hash, TxStatus::Dropped, None, None)
                            .await?;
                        self.nonce
                            .resync(record.relayer_address, &record.network, on_chain_count)
                            .await;
                        Monitoring::record_transaction(&record.network, "dropped");
                        warn!(tx_hash = %record.tx_hash, "transaction dropped, allocator resynced");
                    }
                    Outcome::Stuck => {
                        self.store.mark_stuck(record.tx_hash, Utc::now()).await?;
                        warn!(tx_hash = %record.tx_hash, "transaction stuck: unobserved past the grace window");
                    }
                }
                Ok(())
            }
        }
    }
}

/// A record past its grace window is "dropped" once the chain has already
/// executed past its sequence number (some other transaction took its slot),
/// and "stuck" otherwise (spec §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Dropped,
    Stuck,
}

fn classify_unconfirmed(on_chain_count: U256, sequence_number: U256) -> Outcome {
    if on_chain_count > sequence_number {
        Outcome::Dropped
    } else {
        Outcome::Stuck
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_sequence_number_the_chain_has_passed_is_dropped() {
        assert_eq!(
            classify_unconfirmed(U256::from(5), U256::from(3)),
            Outcome::Dropped
        );
    }

    #[test]
    fn a_sequence_number_the_chain_has_not_reached_is_stuck() {
        assert_eq!(
            classify_unconfirmed(U256::from(3), U256::from(3)),
            Outcome::Stuck
        );
        assert_eq!(
            classify_unconfirmed(U256::from(2), U256::from(3)),
            Outcome::Stuck
        );
    }
}
