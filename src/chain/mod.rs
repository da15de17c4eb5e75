//! Chain Client (C3): one `alloy`-based client per configured network,
//! registered in a [`ChainClients`] map keyed by network id.
//!
//! Every RPC call is wrapped with a request counter and latency histogram,
//! plus bounded exponential-backoff retry around the same seam, hand-rolled
//! rather than via a generic retry crate to keep the middleware small.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy_consensus::TxEnvelope;
use alloy_eips::eip2718::Decodable2718;
use alloy_network::Ethereum;
use alloy_primitives::{Address, Bytes, B256, U256};
use alloy_provider::{Provider, RootProvider};
use alloy_rpc_types_eth::{BlockNumberOrTag, TransactionReceipt, TransactionRequest};
use alloy_transport_http::Http;
use once_cell::sync::Lazy;
use prometheus::{register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec};
use reqwest::Client as HttpClient;
use thiserror::Error;
use tracing::{instrument, warn};

use crate::domain::NetworkId;

static RPC_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "chain_rpc_requests_total",
        "Chain client RPC calls made, by network and method.",
        &["network", "method"]
    )
    .unwrap()
});
static RPC_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "chain_rpc_failures_total",
        "Chain client RPC calls that ultimately failed, by network and method.",
        &["network", "method"]
    )
    .unwrap()
});
static RPC_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "chain_rpc_latency_seconds",
        "Chain client RPC latency in seconds, by network and method.",
        &["network", "method"]
    )
    .unwrap()
});

/// A simulate-or-estimate call shape: the fields needed to preview a
/// transaction against chain state without broadcasting it.
#[derive(Debug, Clone)]
pub struct Call {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub gas_limit: Option<u64>,
}

/// A fee suggestion in EIP-1559 terms.
#[derive(Debug, Clone, Copy)]
pub struct FeeSuggestion {
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("rpc call to {network} failed after retrying: {source}")]
    Rpc {
        network: NetworkId,
        #[source]
        source: alloy_transport::TransportError,
    },
    #[error("simulation reverted on {network}: {reason}")]
    Reverted { network: NetworkId, reason: String },
    #[error("no chain client configured for network {0}")]
    UnknownNetwork(NetworkId),
    #[error("malformed signed transaction bytes: {0}")]
    MalformedTransaction(String),
}

/// Bounded exponential-backoff retry policy applied around every RPC call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

type AlloyProvider = RootProvider<Http<HttpClient>, Ethereum>;

/// One network's RPC client. Operations are idempotent except `broadcast`.
pub struct ChainClient {
    network: NetworkId,
    chain_id: u64,
    forwarder_address: Address,
    provider: AlloyProvider,
    retry: RetryPolicy,
}

impl ChainClient {
    #[must_use]
    pub fn new(
        network: NetworkId,
        chain_id: u64,
        forwarder_address: Address,
        rpc_endpoint: url::Url,
        retry: RetryPolicy,
    ) -> Self {
        // A bare root provider, not `ProviderBuilder::new().on_http(..)`: the
        // client only ever issues read calls and `send_raw_transaction` on
        // already-signed bytes, so the recommended fillers (nonce, gas,
        // chain-id) `ProviderBuilder::new()` installs have nothing to do and
        // would change the provider's type away from `AlloyProvider`.
        let provider = RootProvider::new_http(rpc_endpoint);
        Self {
            network,
            chain_id,
            forwarder_address,
            provider,
            retry,
        }
    }

    #[must_use]
    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    #[must_use]
    pub fn forwarder_address(&self) -> Address {
        self.forwarder_address
    }

    #[instrument(skip(self))]
    pub async fn head_block(&self) -> Result<u64, ChainError> {
        self.with_retry("head_block", || async {
            self.provider.get_block_number().await
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn pending_count(&self, address: Address) -> Result<U256, ChainError> {
        let count = self
            .with_retry("pending_count", || async {
                self.provider
                    .get_transaction_count(address)
                    .pending()
                    .await
            })
            .await?;
        Ok(U256::from(count))
    }

    #[instrument(skip(self))]
    pub async fn fee_suggestion(&self) -> Result<FeeSuggestion, ChainError> {
        let estimate = self
            .with_retry("fee_suggestion", || async {
                self.provider.estimate_eip1559_fees(None).await
            })
            .await?;
        Ok(FeeSuggestion {
            max_fee_per_gas: estimate.max_fee_per_gas,
            max_priority_fee_per_gas: estimate.max_priority_fee_per_gas,
        })
    }

    #[instrument(skip(self, call))]
    pub async fn estimate_gas(&self, call: &Call) -> Result<u64, ChainError> {
        let request = self.call_to_request(call);
        self.with_retry("estimate_gas", || async {
            self.provider.estimate_gas(&request).await
        })
        .await
    }

    /// Previews `call` against current chain state (e.g. the pending block)
    /// without broadcasting. A revert surfaces as [`ChainError::Reverted`].
    #[instrument(skip(self, call))]
    pub async fn simulate(&self, call: &Call) -> Result<Bytes, ChainError> {
        let request = self.call_to_request(call);
        match self
            .with_retry("simulate", || async { self.provider.call(&request).await })
            .await
        {
            Ok(output) => Ok(output),
            Err(ChainError::Rpc { source, .. }) if is_revert(&source) => Err(ChainError::Reverted {
                network: self.network.clone(),
                reason: source.to_string(),
            }),
            Err(other) => Err(other),
        }
    }

    /// Broadcasts already-signed raw transaction bytes, returning the
    /// transaction hash. At-least-once from the caller's perspective but
    /// at-most-once observable: rebroadcasting identical bytes returns the
    /// same hash rather than erroring.
    #[instrument(skip(self, signed_raw_transaction))]
    pub async fn broadcast(&self, signed_raw_transaction: &Bytes) -> Result<B256, ChainError> {
        let expected_hash = raw_tx_hash(signed_raw_transaction)?;

        let bytes = signed_raw_transaction.clone();
        let result = self
            .with_retry("broadcast", || async {
                self.provider.send_raw_transaction(&bytes).await
            })
            .await;

        match result {
            Ok(pending) => Ok(*pending.tx_hash()),
            Err(ChainError::Rpc { source, .. }) if is_already_known(&source) => {
                warn!(tx_hash = %expected_hash, "broadcast observed as already known; treating as success");
                Ok(expected_hash)
            }
            Err(other) => Err(other),
        }
    }

    #[instrument(skip(self))]
    pub async fn receipt(&self, tx_hash: B256) -> Result<Option<TransactionReceipt>, ChainError> {
        self.with_retry("receipt", || async {
            self.provider.get_transaction_receipt(tx_hash).await
        })
        .await
    }

    fn call_to_request(&self, call: &Call) -> TransactionRequest {
        TransactionRequest::default()
            .from(call.from)
            .to(call.to)
            .value(call.value)
            .input(call.data.clone().into())
            .gas_limit(call.gas_limit.unwrap_or(u64::MAX))
    }

    async fn with_retry<F, Fut, T>(&self, method: &'static str, mut f: F) -> Result<T, ChainError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, alloy_transport::TransportError>>,
    {
        RPC_REQUESTS
            .with_label_values(&[self.network.as_str(), method])
            .inc();
        let timer = RPC_LATENCY
            .with_label_values(&[self.network.as_str(), method])
            .start_timer();

        let mut delay = self.retry.base_delay;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f().await {
                Ok(value) => {
                    timer.observe_duration();
                    return Ok(value);
                }
                Err(source) if attempt < self.retry.max_attempts && is_transient(&source) => {
                    warn!(network = %self.network, %method, attempt, %source, "transient rpc error, retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.retry.max_delay);
                }
                Err(source) => {
                    RPC_FAILURES
                        .with_label_values(&[self.network.as_str(), method])
                        .inc();
                    timer.observe_duration();
                    return Err(ChainError::Rpc {
                        network: self.network.clone(),
                        source,
                    });
                }
            }
        }
    }
}

/// Decodes the EIP-2718 envelope of already-signed transaction bytes and
/// returns its hash, without touching the network. Used by the pipeline to
/// compute a transaction's hash before it persists the pending record, so the
/// hash is known even if broadcasting itself later fails.
pub fn raw_tx_hash(signed_raw_transaction: &Bytes) -> Result<B256, ChainError> {
    let envelope = TxEnvelope::decode_2718(&mut signed_raw_transaction.as_ref())
        .map_err(|e| ChainError::MalformedTransaction(e.to_string()))?;
    Ok(*envelope.tx_hash())
}

/// Transport-level failures worth retrying: timeouts, connection resets, and
/// upstream 5xx. Deterministic failures (bad params, auth, method not found)
/// are not transient and should surface immediately rather than burn the
/// retry budget.
fn is_transient(error: &alloy_transport::TransportError) -> bool {
    let message = error.to_string().to_lowercase();
    message.contains("timed out")
        || message.contains("timeout")
        || message.contains("connection reset")
        || message.contains("connection refused")
        || message.contains("connection closed")
        || message.contains("broken pipe")
        || message.contains("unexpected eof")
        || message.contains("502")
        || message.contains("503")
        || message.contains("504")
}

fn is_revert(error: &alloy_transport::TransportError) -> bool {
    error.to_string().to_lowercase().contains("revert")
}

fn is_already_known(error: &alloy_transport::TransportError) -> bool {
    let message = error.to_string().to_lowercase();
    message.contains("already known") || message.contains("nonce too low")
}

/// Every configured network's client, keyed by network id (spec §4.3: "each
/// network has an independent client instance; there is no cross-network
/// state").
#[derive(Clone)]
pub struct ChainClients {
    clients: Arc<HashMap<NetworkId, Arc<ChainClient>>>,
}

impl ChainClients {
    #[must_use]
    pub fn new(clients: HashMap<NetworkId, Arc<ChainClient>>) -> Self {
        Self {
            clients: Arc::new(clients),
        }
    }

    pub fn get(&self, network: &NetworkId) -> Result<&Arc<ChainClient>, ChainError> {
        self.clients
            .get(network)
            .ok_or_else(|| ChainError::UnknownNetwork(network.clone()))
    }

    pub fn networks(&self) -> impl Iterator<Item = &NetworkId> {
        self.clients.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_network_is_a_typed_error() {
        let clients = ChainClients::new(HashMap::new());
        let err = clients.get(&"nope".to_string()).unwrap_err();
        assert!(matches!(err, ChainError::UnknownNetwork(_)));
    }

    #[test]
    fn retry_policy_defaults_are_bounded() {
        let policy = RetryPolicy::default();
        assert!(policy.max_attempts > 1);
        assert!(policy.base_delay < policy.max_delay);
    }
}
