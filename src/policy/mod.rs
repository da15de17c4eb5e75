//! Policy Engine (C4): evaluates an admitted request against allowlist,
//! quota, gas-cap, and token-cap rules, in that order, first rejection wins
//! (spec §4.4).
//!
//! The rule set is held as `Arc<Vec<PolicyRule>>` behind a `std::sync::RwLock`
//! so reload is a single atomic pointer swap under a short write lock
//! (spec §4.4: "reloads are atomic — policy evaluation never observes a
//! partially updated rule set"); readers clone the `Arc` and release the
//! lock immediately, never holding it across a counter-cache lookup.

pub mod schema;

use std::sync::{Arc, RwLock};
use std::time::Duration;

use alloy_primitives::U256;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::instrument;

use crate::counters::{CounterCache, Dimension};
use crate::domain::{PolicyRule, PolicyRuleKind, Request};
use self::schema::{target_applies, AllowlistValue, GasCapValue, QuotaValue, TokenCapValue};

const HOUR: Duration = Duration::from_secs(3600);
const DAY: Duration = Duration::from_secs(86_400);

/// A rejection from the Policy Engine. The wire `code` is derived 1:1 from
/// the variant (spec §6).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyRejection {
    #[error("`from` is not allowlisted for this network")]
    NotAllowlisted,
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("gas cap exceeded: {0}")]
    GasCapExceeded(String),
    #[error("token cap exceeded: {0}")]
    TokenCapExceeded(String),
}

/// Holds the live policy rule set and exposes `admit`/`check_gas_price`
/// (the latter run later in the pipeline, once the effective fee is known —
/// spec §4.4, §4.8 step 4) plus `reload`.
pub struct PolicyEngine {
    rules: RwLock<Arc<Vec<PolicyRule>>>,
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl PolicyEngine {
    #[must_use]
    pub fn new(rules: Vec<PolicyRule>) -> Self {
        Self {
            rules: RwLock::new(Arc::new(rules)),
        }
    }

    /// Atomically replaces the rule set (spec §4.4's reload contract).
    pub fn reload(&self, rules: Vec<PolicyRule>) {
        let mut guard = self.rules.write().expect("policy lock poisoned");
        *guard = Arc::new(rules);
    }

    fn snapshot(&self) -> Arc<Vec<PolicyRule>> {
        Arc::clone(&self.rules.read().expect("policy lock poisoned"))
    }

    /// Runs the allowlist, quota, gas-limit (not gas-price), and token-cap
    /// checks, in that order (spec §4.4). Does not check `max-gas-price` —
    /// that is deferred to [`Self::check_gas_price`] once the pipeline has
    /// computed the effective fee (spec §4.8 step 4).
    #[instrument(skip(self, counters), fields(from = %request.from, network = %request.network))]
    pub fn admit(
        &self,
        request: &Request,
        now: DateTime<Utc>,
        counters: &CounterCache,
    ) -> Result<(), PolicyRejection> {
        let rules = self.snapshot();
        let applicable = |rule: &&PolicyRule| {
            rule.enabled && target_applies(&rule.target, request.from, &request.network)
        };

        self.check_allowlist(rules.iter().filter(applicable), request)?;
        self.check_quota(rules.iter().filter(applicable), request, now, counters)?;
        self.check_gas_limit(rules.iter().filter(applicable), request)?;
        self.check_token_cap(rules.iter().filter(applicable), request, now, counters)?;

        Ok(())
    }

    /// The `max-gas-price` half of the gas-cap check (spec §4.4, §4.8 step
    /// 4), run once the pipeline has computed the fee it intends to submit
    /// with. Returns the most restrictive applicable `max-gas-price`, if
    /// any, alongside the pass/fail result so the pipeline can use it for
    /// clamping.
    pub fn check_gas_price(&self, request: &Request, fee: U256) -> Result<(), PolicyRejection> {
        let rules = self.snapshot();
        for rule in rules
            .iter()
            .filter(|r| r.kind == PolicyRuleKind::GasCap)
            .filter(|r| r.enabled && target_applies(&r.target, request.from, &request.network))
        {
            let Ok(value) = serde_json::from_value::<GasCapValue>(rule.value.clone()) else {
                continue;
            };
            if let Some(max_gas_price) = value.max_gas_price {
                if fee > max_gas_price {
                    return Err(PolicyRejection::GasCapExceeded(format!(
                        "fee {fee} exceeds max_gas_price {max_gas_price} (rule {})",
                        rule.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// The most restrictive `max-gas-price` among applicable, enabled
    /// gas-cap rules, used by the pipeline to clamp the effective fee (spec
    /// §4.8 step 4). `None` means no applicable cap.
    #[must_use]
    pub fn max_gas_price(&self, from: alloy_primitives::Address, network: &str) -> Option<U256> {
        let rules = self.snapshot();
        rules
            .iter()
            .filter(|r| r.kind == PolicyRuleKind::GasCap)
            .filter(|r| r.enabled && target_applies(&r.target, from, network))
            .filter_map(|r| serde_json::from_value::<GasCapValue>(r.value.clone()).ok())
            .filter_map(|v| v.max_gas_price)
            .min()
    }

    /// Every applicable, enabled allowlist rule must contain `from` in its
    /// address set (spec §3: rules are additive — a request must pass every
    /// rule that applies to it). An empty set with `target = "*"` therefore
    /// denies all requests, since nothing can ever be a member of it.
    fn check_allowlist<'a>(
        &self,
        rules: impl Iterator<Item = &'a PolicyRule>,
        request: &Request,
    ) -> Result<(), PolicyRejection> {
        for rule in rules.filter(|r| r.kind == PolicyRuleKind::Allowlist) {
            let Ok(value) = serde_json::from_value::<AllowlistValue>(rule.value.clone()) else {
                continue;
            };
            if !value.addresses.contains(&request.from) {
                return Err(PolicyRejection::NotAllowlisted);
            }
        }
        Ok(())
    }

    fn check_quota<'a>(
        &self,
        rules: impl Iterator<Item = &'a PolicyRule>,
        request: &Request,
        now: DateTime<Utc>,
        counters: &CounterCache,
    ) -> Result<(), PolicyRejection> {
        for rule in rules.filter(|r| r.kind == PolicyRuleKind::Quota) {
            let Ok(value) = serde_json::from_value::<QuotaValue>(rule.value.clone()) else {
                continue;
            };

            let hourly_count = counters.sum(
                Dimension::TxCount,
                request.from,
                &request.network,
                None,
                HOUR,
                now,
            );
            let daily_count = counters.sum(
                Dimension::TxCount,
                request.from,
                &request.network,
                None,
                DAY,
                now,
            );
            let hourly_value = counters.sum(
                Dimension::TxValue,
                request.from,
                &request.network,
                None,
                HOUR,
                now,
            );
            let daily_value = counters.sum(
                Dimension::TxValue,
                request.from,
                &request.network,
                None,
                DAY,
                now,
            );

            if let Some(max) = value.max_tx_per_hour {
                if hourly_count + U256::from(1) > U256::from(max) {
                    return Err(PolicyRejection::QuotaExceeded(format!(
                        "hourly transaction count would exceed max_tx_per_hour={max} (rule {})",
                        rule.id
                    )));
                }
            }
            if let Some(max) = value.max_tx_per_day {
                if daily_count + U256::from(1) > U256::from(max) {
                    return Err(PolicyRejection::QuotaExceeded(format!(
                        "daily transaction count would exceed max_tx_per_day={max} (rule {})",
                        rule.id
                    )));
                }
            }
            if let Some(max) = value.max_value_per_tx {
                if request.value > max {
                    return Err(PolicyRejection::QuotaExceeded(format!(
                        "value {} exceeds max_value_per_tx={max} (rule {})",
                        request.value, rule.id
                    )));
                }
            }
            if let Some(max) = value.max_value_per_hour {
                if hourly_value + request.value > max {
                    return Err(PolicyRejection::QuotaExceeded(format!(
                        "hourly value would exceed max_value_per_hour={max} (rule {})",
                        rule.id
                    )));
                }
            }
            if let Some(max) = value.max_value_per_day {
                if daily_value + request.value > max {
                    return Err(PolicyRejection::QuotaExceeded(format!(
                        "daily value would exceed max_value_per_day={max} (rule {})",
                        rule.id
                    )));
                }
            }
        }
        Ok(())
    }

    fn check_gas_limit<'a>(
        &self,
        rules: impl Iterator<Item = &'a PolicyRule>,
        request: &Request,
    ) -> Result<(), PolicyRejection> {
        for rule in rules.filter(|r| r.kind == PolicyRuleKind::GasCap) {
            let Ok(value) = serde_json::from_value::<GasCapValue>(rule.value.clone()) else {
                continue;
            };
            if let Some(max_gas_limit) = value.max_gas_limit {
                if request.gas > max_gas_limit {
                    return Err(PolicyRejection::GasCapExceeded(format!(
                        "declared gas {} exceeds max_gas_limit={max_gas_limit} (rule {})",
                        request.gas, rule.id
                    )));
                }
            }
        }
        Ok(())
    }

    fn check_token_cap<'a>(
        &self,
        rules: impl Iterator<Item = &'a PolicyRule>,
        request: &Request,
        now: DateTime<Utc>,
        counters: &CounterCache,
    ) -> Result<(), PolicyRejection> {
        if !request.has_token_fields() {
            return Ok(());
        }
        let token_address = request.token_address.expect("checked has_token_fields");
        let amount = request.amount.unwrap_or(U256::ZERO);

        for rule in rules.filter(|r| r.kind == PolicyRuleKind::TokenCap) {
            let Ok(value) = serde_json::from_value::<TokenCapValue>(rule.value.clone()) else {
                continue;
            };

            if let Some(allowed) = &value.allowed_tokens {
                if !allowed.contains(&token_address) {
                    return Err(PolicyRejection::TokenCapExceeded(format!(
                        "token {token_address:#x} is not in allowed_tokens (rule {})",
                        rule.id
                    )));
                }
            }

            if let Some(max) = value.max_amount_per_tx {
                if amount > max {
                    return Err(PolicyRejection::TokenCapExceeded(format!(
                        "amount {amount} exceeds max_amount_per_tx={max} (rule {})",
                        rule.id
                    )));
                }
            }

            let hourly = counters.sum(
                Dimension::TokenAmount,
                request.from,
                &request.network,
                Some(token_address),
                HOUR,
                now,
            );
            let daily = counters.sum(
                Dimension::TokenAmount,
                request.from,
                &request.network,
                Some(token_address),
                DAY,
                now,
            );

            if let Some(max) = value.max_amount_per_hour {
                if hourly + amount > max {
                    return Err(PolicyRejection::TokenCapExceeded(format!(
                        "hourly token amount would exceed max_amount_per_hour={max} (rule {})",
                        rule.id
                    )));
                }
            }
            if let Some(max) = value.max_amount_per_day {
                if daily + amount > max {
                    return Err(PolicyRejection::TokenCapExceeded(format!(
                        "daily token amount would exceed max_amount_per_day={max} (rule {})",
                        rule.id
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::{Address, Bytes};

    use super::*;

    fn request(from: Address) -> Request {
        Request {
            from,
            to: Address::repeat_byte(0x99),
            value: U256::from(10).pow(U256::from(18)),
            gas: U256::from(100_000u64),
            user_nonce: U256::ZERO,
            data: Bytes::new(),
            signature: Bytes::from(vec![0u8; 65]),
            network: "localhost".to_string(),
            token_address: None,
            token_kind: None,
            amount: None,
            token_id: None,
        }
    }

    fn allowlist_rule(id: i64, target: &str, addresses: Vec<Address>) -> PolicyRule {
        PolicyRule {
            id,
            kind: PolicyRuleKind::Allowlist,
            target: target.to_string(),
            value: serde_json::json!({ "addresses": addresses }),
            enabled: true,
        }
    }

    #[test]
    fn wildcard_empty_allowlist_denies_all() {
        let engine = PolicyEngine::new(vec![allowlist_rule(1, "*", vec![])]);
        let counters = CounterCache::new(Duration::from_secs(86_400));
        let req = request(Address::repeat_byte(0xaa));

        let err = engine.admit(&req, Utc::now(), &counters).unwrap_err();
        assert_eq!(err, PolicyRejection::NotAllowlisted);
    }

    #[test]
    fn allowlisted_address_is_admitted() {
        let a = Address::repeat_byte(0xaa);
        let engine = PolicyEngine::new(vec![allowlist_rule(1, "*", vec![a])]);
        let counters = CounterCache::new(Duration::from_secs(86_400));
        let req = request(a);

        assert!(engine.admit(&req, Utc::now(), &counters).is_ok());
    }

    #[test]
    fn quota_rejects_the_third_request_within_the_hour() {
        let a = Address::repeat_byte(0xbb);
        let engine = PolicyEngine::new(vec![
            allowlist_rule(1, "*", vec![a]),
            PolicyRule {
                id: 2,
                kind: PolicyRuleKind::Quota,
                target: "*".to_string(),
                value: serde_json::json!({ "max_tx_per_hour": 2 }),
                enabled: true,
            },
        ]);
        let counters = CounterCache::new(Duration::from_secs(86_400));
        let req = request(a);
        let now = Utc::now();

        assert!(engine.admit(&req, now, &counters).is_ok());
        counters.record(Dimension::TxCount, a, &req.network, None, U256::from(1), now);

        assert!(engine.admit(&req, now, &counters).is_ok());
        counters.record(Dimension::TxCount, a, &req.network, None, U256::from(1), now);

        let err = engine.admit(&req, now, &counters).unwrap_err();
        assert!(matches!(err, PolicyRejection::QuotaExceeded(_)));
    }

    #[test]
    fn token_cap_rejects_amount_over_the_per_tx_cap() {
        let a = Address::repeat_byte(0xcc);
        let token = Address::repeat_byte(0xdd);
        let engine = PolicyEngine::new(vec![
            allowlist_rule(1, "*", vec![a]),
            PolicyRule {
                id: 2,
                kind: PolicyRuleKind::TokenCap,
                target: "*".to_string(),
                value: serde_json::json!({ "max_amount_per_tx": "1000" }),
                enabled: true,
            },
        ]);
        let counters = CounterCache::new(Duration::from_secs(86_400));
        let mut req = request(a);
        req.token_address = Some(token);
        req.amount = Some(U256::from(1001));

        let err = engine.admit(&req, Utc::now(), &counters).unwrap_err();
        assert!(matches!(err, PolicyRejection::TokenCapExceeded(_)));
    }

    #[test]
    fn disabled_rule_is_never_applied() {
        let a = Address::repeat_byte(0xee);
        let engine = PolicyEngine::new(vec![PolicyRule {
            id: 1,
            kind: PolicyRuleKind::Allowlist,
            target: "*".to_string(),
            value: serde_json::json!({ "addresses": [] }),
            enabled: false,
        }]);
        let counters = CounterCache::new(Duration::from_secs(86_400));
        let req = request(a);

        assert!(engine.admit(&req, Utc::now(), &counters).is_ok());
    }
}
