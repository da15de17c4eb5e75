//! Wire types for the hosted-signer remote-signing API.
//!
//! Unlike a hosted *relayer* API (which signs and submits in one call), this
//! client only asks the hosted key-management service to sign a prehash and
//! return raw signed bytes — broadcasting remains the Chain Client's job
//! (C3), consistent with the relay's C1/C3 split (spec §4.1, §4.3).

use alloy_primitives::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};

/// An unsigned EIP-1559 transaction, ready for the hosted key to sign.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignRequest {
    pub chain_id: u64,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub gas_limit: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub nonce: U256,
}

/// The raw, fully signed transaction, ready to hand to a Chain Client's
/// `broadcast`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignResponse {
    pub signed_raw_transaction: Bytes,
}

/// The account the hosted key controls.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressResponse {
    pub address: Address,
}
