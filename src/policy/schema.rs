//! Typed views over each `PolicyRuleKind`'s opaque JSON `value` (spec §3,
//! §4.4, §9). The Store only ever sees the raw `serde_json::Value`; this
//! module is the single place that knows how to parse and validate it,
//! called on every write (CRUD) and on every read during rule-set reload.

use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::PolicyRuleKind;
use crate::serde_utils::opt_u256_decimal;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("rule value does not match schema for kind {0:?}: {1}")]
    Invalid(PolicyRuleKind, serde_json::Error),
}

/// Validates that `value` deserializes into the schema for `kind`. Called by
/// the Store on every policy-rule write (spec §4.4: "writes must revalidate
/// the rule's structured `value` against the kind's schema").
pub fn validate(kind: PolicyRuleKind, value: &serde_json::Value) -> Result<(), SchemaError> {
    match kind {
        PolicyRuleKind::Allowlist => {
            serde_json::from_value::<AllowlistValue>(value.clone())
                .map(|_| ())
                .map_err(|e| SchemaError::Invalid(kind, e))
        }
        PolicyRuleKind::Quota => serde_json::from_value::<QuotaValue>(value.clone())
            .map(|_| ())
            .map_err(|e| SchemaError::Invalid(kind, e)),
        PolicyRuleKind::GasCap => serde_json::from_value::<GasCapValue>(value.clone())
            .map(|_| ())
            .map_err(|e| SchemaError::Invalid(kind, e)),
        PolicyRuleKind::TokenCap => serde_json::from_value::<TokenCapValue>(value.clone())
            .map(|_| ())
            .map_err(|e| SchemaError::Invalid(kind, e)),
    }
}

/// `target = "*"` with an empty `addresses` set means "deny all" (spec
/// §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowlistValue {
    #[serde(default)]
    pub addresses: Vec<Address>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaValue {
    #[serde(default)]
    pub max_tx_per_hour: Option<u64>,
    #[serde(default)]
    pub max_tx_per_day: Option<u64>,
    #[serde(default, with = "opt_u256_decimal")]
    pub max_value_per_tx: Option<U256>,
    #[serde(default, with = "opt_u256_decimal")]
    pub max_value_per_hour: Option<U256>,
    #[serde(default, with = "opt_u256_decimal")]
    pub max_value_per_day: Option<U256>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GasCapValue {
    #[serde(default, with = "opt_u256_decimal")]
    pub max_gas_limit: Option<U256>,
    #[serde(default, with = "opt_u256_decimal")]
    pub max_gas_price: Option<U256>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenCapValue {
    #[serde(default)]
    pub allowed_tokens: Option<Vec<Address>>,
    #[serde(default, with = "opt_u256_decimal")]
    pub max_amount_per_tx: Option<U256>,
    #[serde(default, with = "opt_u256_decimal")]
    pub max_amount_per_hour: Option<U256>,
    #[serde(default, with = "opt_u256_decimal")]
    pub max_amount_per_day: Option<U256>,
}

/// Returns whether a rule's `target` applies to a request from `from` on
/// `network`: `"*"` applies to everything, a network name applies only to
/// that network, and a 20-byte account hex applies only to that account
/// (case-insensitively — the wire schema lower-cases addresses, but rule
/// targets set through the admin API are not guaranteed to be).
#[must_use]
pub fn target_applies(target: &str, from: Address, network: &str) -> bool {
    if target == "*" {
        return true;
    }
    if target.eq_ignore_ascii_case(network) {
        return true;
    }
    if let Ok(address) = target.parse::<Address>() {
        return address == from;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowlist_empty_set_with_wildcard_target_means_deny_all() {
        let value = serde_json::json!({ "addresses": [] });
        assert!(validate(PolicyRuleKind::Allowlist, &value).is_ok());
        let parsed: AllowlistValue = serde_json::from_value(value).unwrap();
        assert!(parsed.addresses.is_empty());
    }

    #[test]
    fn quota_value_rejects_malformed_decimal() {
        let value = serde_json::json!({ "max_value_per_tx": "not-a-number" });
        assert!(validate(PolicyRuleKind::Quota, &value).is_err());
    }

    #[test]
    fn target_applies_matches_wildcard_network_and_address() {
        let from = Address::repeat_byte(0x11);
        assert!(target_applies("*", from, "localhost"));
        assert!(target_applies("localhost", from, "localhost"));
        assert!(!target_applies("mainnet", from, "localhost"));
        assert!(target_applies(&format!("{from:#x}"), from, "localhost"));
    }
}
