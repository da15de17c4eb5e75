//! Relay Pipeline (C8): orchestrates a single inbound [`Request`] through
//! verify, policy admission, simulation, fee/gas computation, nonce
//! allocation, signing, persistence, and broadcast (spec §4.8's ten steps),
//! under a deadline (§5).
//!
//! Follows an "allocate, do the risky thing, release on every exit path"
//! shape: the nonce guard acquired in step 6 is held across signing and
//! broadcast and released on every return path up to persistence —
//! successful or not. Past persistence the submission always runs to
//! completion; the deadline no longer applies (spec §5).

use std::collections::HashMap;
use std::sync::Arc;

use alloy_primitives::{Address, Bytes, B256, U256};
use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};

use crate::chain::{raw_tx_hash, Call, ChainClients, ChainError};
use crate::config::{AppConfig, NetworkConfig};
use crate::counters::{CounterCache, Dimension};
use crate::domain::{NetworkId, Request, TransactionRecord, TxStatus};
use crate::monitoring::Monitoring;
use crate::nonce::{Guard as NonceGuard, NonceAllocator, NonceError};
use crate::policy::{PolicyEngine, PolicyRejection};
use crate::signer::{Signer, SignerError, UnsignedTransaction};
use crate::store::{Store, StoreError};
use crate::verifier::{unsupported_network, HardCeilings, RequestVerifier, VerifyError};

/// What the caller gets back on success (spec §6's accepted response shape).
#[derive(Debug, Clone, Copy)]
pub struct Accepted {
    pub tx_hash: B256,
    pub gas_price: U256,
    pub gas_limit: U256,
}

/// Every way step 1 through step 9 can fail, carrying enough detail for the
/// HTTP layer (spec §6) to pick a status code and wire `code` string.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    InvalidRequest(#[from] VerifyError),
    #[error(transparent)]
    PolicyRejected(#[from] PolicyRejection),
    #[error("simulation would revert: {0}")]
    WouldRevert(String),
    #[error("effective fee would fall below the chain's own suggestion after clamping to the applicable gas-cap rule")]
    FeeCapTooLow,
    #[error("gas estimate {estimate} exceeds the declared limit {declared}")]
    GasLimitTooLow { estimate: u64, declared: U256 },
    #[error("allocator queue for this relayer/network is saturated")]
    RelayerSaturated,
    #[error(transparent)]
    AllocatorStalled(#[from] NonceError),
    #[error(transparent)]
    ChainTransient(#[from] ChainError),
    #[error("failed to persist the pending record: {0}")]
    PersistFailed(StoreError),
    #[error("broadcast failed after the record was persisted as pending (tx {tx_hash})")]
    BroadcastFailedPostPersist {
        tx_hash: B256,
        #[source]
        source: ChainError,
    },
    #[error(transparent)]
    SignerUnavailable(#[from] SignerError),
    #[error("pipeline deadline exceeded")]
    DeadlineExceeded,
}

impl PipelineError {
    /// The wire `code` string (spec §6). Everything past admission that
    /// surfaces from a dependency outside the caller's control collapses to
    /// `internal` — the distinctions below matter to logs and metrics, not to
    /// the caller.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(VerifyError::UnsupportedNetwork(_)) => "unsupported_network",
            Self::InvalidRequest(_) => "invalid_request",
            Self::PolicyRejected(PolicyRejection::NotAllowlisted) => "not_allowlisted",
            Self::PolicyRejected(PolicyRejection::QuotaExceeded(_)) => "quota_exceeded",
            Self::PolicyRejected(PolicyRejection::GasCapExceeded(_)) => "gas_cap_exceeded",
            Self::PolicyRejected(PolicyRejection::TokenCapExceeded(_)) => "token_cap_exceeded",
            Self::WouldRevert(_) => "would_revert",
            Self::FeeCapTooLow => "fee_cap_too_low",
            Self::GasLimitTooLow { .. } => "gas_limit_too_low",
            Self::RelayerSaturated => "relayer_saturated",
            Self::AllocatorStalled(_)
            | Self::ChainTransient(_)
            | Self::PersistFailed(_)
            | Self::BroadcastFailedPostPersist { .. }
            | Self::SignerUnavailable(_)
            | Self::DeadlineExceeded => "internal",
        }
    }

    /// Whether a caller could reasonably retry the same request unchanged
    /// (spec §7's retryable column). `false` for anything the pipeline itself
    /// rejected on the merits.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::AllocatorStalled(_) | Self::ChainTransient(_) => true,
            Self::SignerUnavailable(e) => matches!(e, SignerError::Unavailable(_)),
            _ => false,
        }
    }
}

/// The output of [`RelayPipeline::admit_and_allocate`] (steps 1-6): an
/// admitted request holding a live nonce guard and saturation permit, ready
/// to be handed to [`RelayPipeline::dispatch`].
struct Prepared {
    request: Request,
    chain_id: u64,
    relayer: Address,
    guard: NonceGuard,
    gas_limit: u64,
    effective_fee: u128,
    effective_priority_fee: u128,
    /// Held until `dispatch` finishes so the saturation gate accounts for
    /// in-flight submissions, not just queued-for-allocation ones.
    _permit: tokio::sync::OwnedSemaphorePermit,
}

/// Orchestrates C1 through C7 against a single [`Request`] (spec §4.8).
pub struct RelayPipeline {
    verifier: RequestVerifier,
    policy: Arc<PolicyEngine>,
    counters: Arc<CounterCache>,
    nonce: Arc<NonceAllocator>,
    signer: Arc<dyn Signer>,
    chain: ChainClients,
    store: Arc<Store>,
    networks: HashMap<NetworkId, NetworkConfig>,
    app: AppConfig,
    /// Bounds the number of in-flight requests per (relayer, network) so
    /// that under sustained overload the pipeline rejects with
    /// `relayer-saturated` rather than queueing unboundedly in front of the
    /// allocator's per-key mutex (spec §5).
    saturation: DashMap<(Address, NetworkId), Arc<Semaphore>>,
}

impl RelayPipeline {
    #[must_use]
    pub fn new(
        policy: Arc<PolicyEngine>,
        counters: Arc<CounterCache>,
        nonce: Arc<NonceAllocator>,
        signer: Arc<dyn Signer>,
        chain: ChainClients,
        store: Arc<Store>,
        networks: HashMap<NetworkId, NetworkConfig>,
        app: AppConfig,
    ) -> Self {
        Self {
            verifier: RequestVerifier,
            policy,
            counters,
            nonce,
            signer,
            chain,
            store,
            networks,
            app,
            saturation: DashMap::new(),
        }
    }

    /// Runs the full pipeline under the configured deadline (spec §5).
    ///
    /// The deadline wraps [`Self::admit_and_allocate`] (steps 1-6) as a
    /// whole: up to and including nonce acquisition, cancellation is free —
    /// nothing durable has happened and no allocator slot survives a
    /// cancelled [`NonceAllocator::acquire`]. Past that point the allocator
    /// guard is live, so [`Self::dispatch`] (steps 7-10) is run to
    /// completion outside this timeout; it applies its own narrower deadline
    /// to the one remaining cancellable step (signing, step 7) and releases
    /// the guard itself if that breaches. Once persistence (step 8) starts,
    /// the submission is treated as a crash rather than aborted (spec §5:
    /// "cancellation between steps 6 and 9 ... the transaction proceeds to
    /// broadcast"), so no later step ever races the deadline.
    #[instrument(skip(self, request), fields(from = %request.from, network = %request.network))]
    pub async fn handle(&self, request: Request) -> Result<Accepted, PipelineError> {
        let deadline = tokio::time::Instant::now() + self.app.pipeline_deadline;
        let prepared = match tokio::time::timeout_at(deadline, self.admit_and_allocate(request)).await {
            Ok(result) => result?,
            Err(_) => return Err(PipelineError::DeadlineExceeded),
        };
        self.dispatch(prepared, deadline).await
    }

    /// Steps 1-6: verify, admit, simulate, compute the effective fee and gas
    /// limit, then acquire the nonce slot behind the saturation gate. The
    /// nonce guard is the very last thing produced — nothing awaits after it
    /// — so cancelling this whole future (e.g. on deadline breach) can never
    /// observe a guard that escaped into [`Prepared`] without returning.
    async fn admit_and_allocate(&self, request: Request) -> Result<Prepared, PipelineError> {
        let network_config = self
            .networks
            .get(&request.network)
            .ok_or_else(|| unsupported_network(&request.network))?;

        // 1-2: structure, ceilings, EIP-712 signature (network membership is
        // checked above since it needs the whole config, not one network).
        let ceilings = HardCeilings {
            max_gas_limit: self.app.max_gas_limit,
            max_tx_value: self.app.max_tx_value,
        };
        self.verifier.verify(&request, network_config, ceilings)?;

        // 3: admit against allowlist/quota/gas-limit/token-cap.
        let now = Utc::now();
        self.policy.admit(&request, now, &self.counters)?;

        let chain = self.chain.get(&request.network)?;

        // 4: simulate.
        let call = Call {
            from: request.from,
            to: request.to,
            value: request.value,
            data: request.data.clone(),
            gas_limit: None,
        };
        match chain.simulate(&call).await {
            Ok(_) => {}
            Err(ChainError::Reverted { reason, .. }) => return Err(PipelineError::WouldRevert(reason)),
            Err(other) => return Err(PipelineError::ChainTransient(other)),
        }

        // 5: effective fee, clamped to the most restrictive applicable
        // gas-cap rule.
        let suggestion = chain.fee_suggestion().await?;
        let max_gas_price = self.policy.max_gas_price(request.from, &request.network);
        if let Some(cap) = max_gas_price {
            if u256_saturating_from_u128(suggestion.max_fee_per_gas) > cap {
                return Err(PipelineError::FeeCapTooLow);
            }
        }
        let multiplied_fee = apply_multiplier(suggestion.max_fee_per_gas, self.app.fee_multiplier);
        let effective_fee = match max_gas_price {
            Some(cap) => multiplied_fee.min(u128_saturating_from_u256(cap)),
            None => multiplied_fee,
        };
        self.policy.check_gas_price(&request, U256::from(effective_fee))?;

        let multiplied_priority_fee =
            apply_multiplier(suggestion.max_priority_fee_per_gas, self.app.fee_multiplier);
        let effective_priority_fee = multiplied_priority_fee.min(effective_fee);

        // 6: estimate gas, add headroom, clamp to the declared limit.
        let estimate = chain.estimate_gas(&call).await?;
        if U256::from(estimate) > request.gas {
            return Err(PipelineError::GasLimitTooLow {
                estimate,
                declared: request.gas,
            });
        }
        let headroom = u128::from(estimate) * u128::from(self.app.gas_estimate_headroom_percent) / 100;
        let with_headroom = u128::from(estimate) + headroom;
        let declared = u128_saturating_from_u256(request.gas);
        let gas_limit = u64::try_from(with_headroom.min(declared)).unwrap_or(u64::MAX);

        // 7: acquire the nonce slot, behind the saturation gate. From here
        // on every exit path must release the allocator guard.
        let relayer = self.signer.address(&request.network).await?;
        let permit = self.enter_saturation_gate(relayer, &request.network)?;
        let guard = self
            .nonce
            .acquire(relayer, &request.network, || async {
                chain.pending_count(relayer).await.ok()
            })
            .await?;

        Ok(Prepared {
            request,
            chain_id: network_config.chain_id,
            relayer,
            guard,
            gas_limit,
            effective_fee,
            effective_priority_fee,
            _permit: permit,
        })
    }

    /// Steps 8-10: sign, persist, broadcast, and record counters. Owns
    /// `prepared.guard` for its whole body so every return path — success or
    /// error — releases or drops it exactly once.
    ///
    /// Only signing (step 7's actual I/O) races `deadline`; a breach there
    /// releases the guard and returns [`PipelineError::DeadlineExceeded`]
    /// before anything durable exists. Persist and broadcast run unbounded
    /// by `deadline` — per spec §5 a cancellation once persistence starts is
    /// a crash, not an abort, and the Confirmation Tracker reconciles it.
    async fn dispatch(&self, prepared: Prepared, deadline: tokio::time::Instant) -> Result<Accepted, PipelineError> {
        let Prepared {
            request,
            chain_id,
            relayer,
            guard,
            gas_limit,
            effective_fee,
            effective_priority_fee,
            _permit,
        } = prepared;

        let sequence_number = guard.sequence_number;
        let sequence_u64 = u64::try_from(sequence_number).unwrap_or(u64::MAX);

        let unsigned = UnsignedTransaction {
            network: request.network.clone(),
            chain_id,
            to: request.to,
            value: request.value,
            data: request.data.clone(),
            gas_limit,
            max_fee_per_gas: effective_fee,
            max_priority_fee_per_gas: effective_priority_fee,
            sequence_number: sequence_u64,
        };

        let signed = match tokio::time::timeout_at(deadline, self.signer.sign(&unsigned)).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(err)) => {
                self.nonce.release_unused(guard);
                return Err(PipelineError::SignerUnavailable(err));
            }
            Err(_) => {
                self.nonce.release_unused(guard);
                return Err(PipelineError::DeadlineExceeded);
            }
        };

        let tx_hash = match raw_tx_hash(&signed) {
            Ok(hash) => hash,
            Err(err) => {
                self.nonce.release_unused(guard);
                return Err(PipelineError::ChainTransient(err));
            }
        };

        let record = build_record(&request, tx_hash, relayer, sequence_number, U256::from(effective_fee));

        if let Err(err) = self.store.insert_pending(&record).await {
            self.nonce.release_unused(guard);
            return Err(PipelineError::PersistFailed(err));
        }

        // The record is durable; from here the nonce guard's only remaining
        // job is serialising this broadcast against the next `acquire` for
        // the same key, so it's dropped as soon as broadcast returns rather
        // than rolled back on failure (spec §4.2: a persisted-but-unbroadcast
        // sequence number is the Confirmation Tracker's problem, not the
        // allocator's).
        let chain = self.chain.get(&request.network)?;
        let broadcast_result = broadcast(chain, &signed).await;
        drop(guard);

        broadcast_result.map_err(|source| PipelineError::BroadcastFailedPostPersist { tx_hash, source })?;

        self.record_counters(&request);
        Monitoring::record_transaction(&request.network, "pending");

        info!(%tx_hash, %sequence_number, "relayed transaction");
        Ok(Accepted {
            tx_hash,
            gas_price: U256::from(effective_fee),
            gas_limit: U256::from(gas_limit),
        })
    }

    fn record_counters(&self, request: &Request) {
        let now = Utc::now();
        self.counters.record(
            Dimension::TxCount,
            request.from,
            &request.network,
            None,
            U256::from(1),
            now,
        );
        self.counters.record(
            Dimension::TxValue,
            request.from,
            &request.network,
            None,
            request.value,
            now,
        );
        if let (Some(token), Some(amount)) = (request.token_address, request.amount) {
            self.counters
                .record(Dimension::TokenAmount, request.from, &request.network, Some(token), amount, now);
        }
    }

    fn enter_saturation_gate(
        &self,
        relayer: Address,
        network: &NetworkId,
    ) -> Result<tokio::sync::OwnedSemaphorePermit, PipelineError> {
        let key = (relayer, network.clone());
        let semaphore = self
            .saturation
            .entry(key)
            .or_insert_with(|| Arc::new(Semaphore::new(self.app.allocator_saturation_threshold)))
            .clone();

        Arc::clone(&semaphore).try_acquire_owned().map_err(|_| {
            warn!(%relayer, %network, "allocator queue saturated, rejecting request");
            PipelineError::RelayerSaturated
        })
    }
}

async fn broadcast(chain: &crate::chain::ChainClient, signed: &Bytes) -> Result<B256, ChainError> {
    chain.broadcast(signed).await
}

fn build_record(
    request: &Request,
    tx_hash: B256,
    relayer: Address,
    sequence_number: U256,
    effective_gas_price: U256,
) -> TransactionRecord {
    let now = Utc::now();
    TransactionRecord {
        tx_hash,
        from: request.from,
        to: request.to,
        network: request.network.clone(),
        token_address: request.token_address,
        token_kind: request.token_kind,
        amount: request.amount,
        token_id: request.token_id,
        status: TxStatus::Pending,
        declared_gas_limit: request.gas,
        effective_gas_price,
        observed_gas_used: None,
        block_number: None,
        relayer_address: relayer,
        sequence_number,
        submitted_at: now,
        updated_at: now,
        stuck_since: None,
    }
}

fn apply_multiplier(fee: u128, multiplier: f64) -> u128 {
    // fee suggestions and the configured multiplier are both small enough
    // that an f64 round-trip never loses precision at the granularity gas
    // prices are priced at.
    (fee as f64 * multiplier).round() as u128
}

fn u128_saturating_from_u256(value: U256) -> u128 {
    u128::try_from(value).unwrap_or(u128::MAX)
}

fn u256_saturating_from_u128(value: u128) -> U256 {
    U256::from(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_multiplier_scales_as_expected() {
        assert_eq!(apply_multiplier(1_000_000_000, 1.2), 1_200_000_000);
    }

    #[test]
    fn pipeline_error_codes_match_the_wire_contract() {
        assert_eq!(PipelineError::RelayerSaturated.code(), "relayer_saturated");
        assert_eq!(PipelineError::FeeCapTooLow.code(), "fee_cap_too_low");
        assert_eq!(
            PipelineError::GasLimitTooLow {
                estimate: 1,
                declared: U256::ZERO
            }
            .code(),
            "gas_limit_too_low"
        );
    }

    #[test]
    fn retryable_errors_are_exactly_the_transient_ones() {
        assert!(PipelineError::ChainTransient(ChainError::UnknownNetwork("x".to_string())).is_retryable());
        assert!(!PipelineError::RelayerSaturated.is_retryable());
        assert!(!PipelineError::FeeCapTooLow.is_retryable());
    }
}
