//! Shared value types for the relay: the inbound request (§3), the durable
//! transaction record, and the policy rule. These are the nouns every other
//! module (verifier, policy engine, pipeline, store) operates on.

use alloy_primitives::{Address, Bytes, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::serde_utils::{address_lower_hex, opt_u256_decimal, u256_decimal};

/// The network identifier used throughout the wire/storage schema. Kept as a
/// plain string (rather than a closed Rust enum) because the set of
/// supported networks is configuration, not code (§6 Configuration).
pub type NetworkId = String;

/// Token kind for the optional token-cap fields (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Fungible,
    NonFungible,
    Multi,
}

/// An inbound, not-yet-verified meta-transaction request (§3).
///
/// Field names match the spec's wire schema; 20-byte identifiers and hashes
/// are lower-case hex, 256-bit integers are decimal strings, `data` is
/// hex-encoded bytes (handled by `alloy_primitives::Bytes`'s own `serde`
/// impl).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(with = "address_lower_hex")]
    pub from: Address,
    #[serde(with = "address_lower_hex")]
    pub to: Address,
    #[serde(with = "u256_decimal")]
    pub value: U256,
    #[serde(with = "u256_decimal")]
    pub gas: U256,
    #[serde(with = "u256_decimal", rename = "user_nonce")]
    pub user_nonce: U256,
    pub data: Bytes,
    /// 65-byte (r, s, v) signature, hex-encoded on the wire.
    pub signature: Bytes,
    pub network: NetworkId,

    #[serde(default, with = "crate::serde_utils::opt_address_lower_hex")]
    pub token_address: Option<Address>,
    #[serde(default)]
    pub token_kind: Option<TokenKind>,
    #[serde(default, with = "opt_u256_decimal")]
    pub amount: Option<U256>,
    #[serde(default, with = "opt_u256_decimal", rename = "token_id")]
    pub token_id: Option<U256>,
}

impl Request {
    /// `true` if this request carries the optional token fields (§4.4 token
    /// cap only applies to requests that do).
    #[must_use]
    pub fn has_token_fields(&self) -> bool {
        self.token_address.is_some()
    }
}

/// Lifecycle status of a `TransactionRecord` (§3). `Pending` is the only
/// non-terminal state; terminal states are never re-written (§8 invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Pending,
    Confirmed,
    Failed,
    Dropped,
}

impl TxStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed | Self::Dropped)
    }
}

/// A durable transaction record (§3). Created `pending` at broadcast time;
/// `stuck_since` is the logical `stuck` state of §4.9, represented as
/// `pending` plus a timestamp rather than a fifth status value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub tx_hash: B256,
    pub from: Address,
    pub to: Address,
    pub network: NetworkId,
    pub token_address: Option<Address>,
    pub token_kind: Option<TokenKind>,
    pub amount: Option<U256>,
    pub token_id: Option<U256>,
    pub status: TxStatus,
    pub declared_gas_limit: U256,
    pub effective_gas_price: U256,
    pub observed_gas_used: Option<U256>,
    pub block_number: Option<u64>,
    pub relayer_address: Address,
    pub sequence_number: U256,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub stuck_since: Option<DateTime<Utc>>,
}

/// Kind of a `PolicyRule` (§3, §4.4). Determines how `value` is interpreted
/// and validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PolicyRuleKind {
    Allowlist,
    Quota,
    GasCap,
    TokenCap,
}

/// A durable policy rule (§3). `target` is either the wildcard `"*"`, a
/// network name, or a 20-byte account hex string; `value` is a `kind`-specific
/// opaque JSON blob validated by the Policy Engine on every write (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: i64,
    pub kind: PolicyRuleKind,
    pub target: String,
    pub value: serde_json::Value,
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_through_json() {
        let json = serde_json::json!({
            "from": "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266",
            "to": "0x70997970c51812dc3a010c7d01b50e0d17dc79c8",
            "value": "1000000000000000000",
            "gas": "100000",
            "user_nonce": "0",
            "data": "0x",
            "signature": "0x00",
            "network": "localhost",
        });

        let request: Request = serde_json::from_value(json).unwrap();
        assert_eq!(request.value, U256::from(10).pow(U256::from(18)));
        assert!(!request.has_token_fields());
    }

    #[test]
    fn tx_status_terminality() {
        assert!(!TxStatus::Pending.is_terminal());
        assert!(TxStatus::Confirmed.is_terminal());
        assert!(TxStatus::Failed.is_terminal());
        assert!(TxStatus::Dropped.is_terminal());
    }
}
