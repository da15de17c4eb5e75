//! Signer Capability (C1): produces a signed wire-format transaction and
//! exposes the relayer address for a network, behind a trait so a local
//! private-key signer and a hosted key-management signer are
//! interchangeable to the rest of the system (spec §4.1).

pub mod local;
pub mod remote;

use alloy_primitives::{Address, Bytes};
use async_trait::async_trait;
use thiserror::Error;

use crate::domain::NetworkId;

/// An unsigned transaction ready to be signed (spec §4.8 step 7's field
/// tuple `{to, value, data, gas-limit, fee, sequence-number}`).
#[derive(Debug, Clone)]
pub struct UnsignedTransaction {
    pub network: NetworkId,
    pub chain_id: u64,
    pub to: Address,
    pub value: alloy_primitives::U256,
    pub data: Bytes,
    pub gas_limit: u64,
    /// EIP-1559 max fee per gas; the pipeline has already clamped this to
    /// the applicable gas-cap rule by the time it reaches the signer.
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
    pub sequence_number: u64,
}

/// Errors from a Signer Capability call (spec §4.1).
#[derive(Debug, Error)]
pub enum SignerError {
    /// Transient; retry-eligible.
    #[error("signer unavailable: {0}")]
    Unavailable(String),
    /// Fatal for this request.
    #[error("signer denied the request: {0}")]
    Denied(String),
}

/// Behind-the-capability interface both signer backends implement. Never
/// exposes raw key material (spec §4.1).
#[async_trait]
pub trait Signer: Send + Sync {
    /// The relayer account id used for `network`. May be cached after the
    /// first call, but must be fetched at least once at startup (spec
    /// §4.1).
    async fn address(&self, network: &NetworkId) -> Result<Address, SignerError>;

    /// Produces the signed wire bytes for `tx`. Deterministic per input
    /// under a fixed key (spec §4.1).
    async fn sign(&self, tx: &UnsignedTransaction) -> Result<Bytes, SignerError>;
}
