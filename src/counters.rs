//! Counter Cache (C7): sliding-window counters backing quota and token-cap
//! checks. Held in-process (spec §9 explicitly permits "an in-memory
//! structure"); every key's window is a small time-ordered deque guarded by
//! its own lock, following the per-key-lock pattern the Nonce Allocator
//! (C2) also uses rather than one global lock over the whole cache.

use std::collections::VecDeque;
use std::sync::RwLock;
use std::time::Duration;

use alloy_primitives::{Address, U256};
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::domain::NetworkId;

/// The aggregate dimension a counter tracks (spec §3, §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    TxCount,
    TxValue,
    /// Per-token amount; the token address is folded into the cache key's
    /// identity component since a single `from` can hold caps against many
    /// tokens.
    TokenAmount,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CounterKey {
    dimension: Dimension,
    identity: Address,
    network: NetworkId,
    /// `Some(token)` folds the token address into the key for
    /// `Dimension::TokenAmount`; `None` for the other dimensions.
    token: Option<Address>,
}

/// Sliding-window counter cache, keyed by `(dimension, identity, network)`
/// (and, for token amounts, the token address).
pub struct CounterCache {
    windows: DashMap<CounterKey, RwLock<VecDeque<(DateTime<Utc>, U256)>>>,
    /// The largest window any caller is expected to query; entries older
    /// than this are evicted lazily on read (spec §4.7).
    max_window: Duration,
}

impl CounterCache {
    #[must_use]
    pub fn new(max_window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            max_window,
        }
    }

    /// Records `qty` at `timestamp` for `key`. For the count dimension,
    /// `qty` is 1 (spec §4.7).
    pub fn record(
        &self,
        dimension: Dimension,
        identity: Address,
        network: &NetworkId,
        token: Option<Address>,
        qty: U256,
        timestamp: DateTime<Utc>,
    ) {
        let key = CounterKey {
            dimension,
            identity,
            network: network.clone(),
            token,
        };

        let entry = self
            .windows
            .entry(key)
            .or_insert_with(|| RwLock::new(VecDeque::new()));

        let mut deque = entry.write().expect("counter lock poisoned");
        deque.push_back((timestamp, qty));
        Self::evict_older_than(&mut deque, timestamp, self.max_window);
    }

    /// Returns the sum of quantities recorded for `key` with timestamp
    /// `>= now - window`. Counts are exact; value sums use `U256` arithmetic
    /// (spec §4.7: "no floating point").
    #[must_use]
    pub fn sum(
        &self,
        dimension: Dimension,
        identity: Address,
        network: &NetworkId,
        token: Option<Address>,
        window: Duration,
        now: DateTime<Utc>,
    ) -> U256 {
        let key = CounterKey {
            dimension,
            identity,
            network: network.clone(),
            token,
        };

        let Some(entry) = self.windows.get(&key) else {
            return U256::ZERO;
        };

        let mut deque = entry.write().expect("counter lock poisoned");
        Self::evict_older_than(&mut deque, now, self.max_window);

        let Ok(window) = chrono::Duration::from_std(window) else {
            return U256::ZERO;
        };
        let cutoff = now - window;

        deque
            .iter()
            .filter(|(ts, _)| *ts >= cutoff)
            .fold(U256::ZERO, |acc, (_, qty)| acc + *qty)
    }

    fn evict_older_than(
        deque: &mut VecDeque<(DateTime<Utc>, U256)>,
        now: DateTime<Utc>,
        max_window: Duration,
    ) {
        let Ok(max_window) = chrono::Duration::from_std(max_window) else {
            return;
        };
        let cutoff = now - max_window;

        while matches!(deque.front(), Some((ts, _)) if *ts < cutoff) {
            deque.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use chrono::TimeZone;

    use super::*;

    fn addr(n: u8) -> Address {
        Address::repeat_byte(n)
    }

    #[test]
    fn sum_reflects_only_entries_within_window() {
        let cache = CounterCache::new(StdDuration::from_secs(86_400));
        let network = "localhost".to_string();
        let from = addr(1);

        let t0 = Utc.timestamp_opt(1_000_000, 0).unwrap();
        cache.record(Dimension::TxCount, from, &network, None, U256::from(1), t0);
        cache.record(
            Dimension::TxCount,
            from,
            &network,
            None,
            U256::from(1),
            t0 + chrono::Duration::minutes(30),
        );
        cache.record(
            Dimension::TxCount,
            from,
            &network,
            None,
            U256::from(1),
            t0 + chrono::Duration::hours(2),
        );

        let now = t0 + chrono::Duration::hours(2);
        let count = cache.sum(
            Dimension::TxCount,
            from,
            &network,
            None,
            StdDuration::from_secs(3600),
            now,
        );
        // Only the 30-minute and the 2-hour entries fall within the trailing
        // hour; the first entry (2 hours old relative to `now`) does not.
        assert_eq!(count, U256::from(2));
    }

    #[test]
    fn entries_older_than_max_window_are_evicted() {
        let cache = CounterCache::new(StdDuration::from_secs(3600));
        let network = "localhost".to_string();
        let from = addr(2);

        let t0 = Utc.timestamp_opt(1_000_000, 0).unwrap();
        cache.record(Dimension::TxValue, from, &network, None, U256::from(5), t0);

        let later = t0 + chrono::Duration::hours(3);
        cache.record(
            Dimension::TxValue,
            from,
            &network,
            None,
            U256::from(7),
            later,
        );

        let sum = cache.sum(
            Dimension::TxValue,
            from,
            &network,
            None,
            StdDuration::from_secs(86_400),
            later,
        );
        // The first entry was evicted as part of the second `record` call
        // once it fell outside `max_window`.
        assert_eq!(sum, U256::from(7));
    }

    #[test]
    fn token_amount_is_keyed_per_token() {
        let cache = CounterCache::new(StdDuration::from_secs(86_400));
        let network = "localhost".to_string();
        let from = addr(3);
        let token_a = addr(0xaa);
        let token_b = addr(0xbb);

        let now = Utc.timestamp_opt(2_000_000, 0).unwrap();
        cache.record(
            Dimension::TokenAmount,
            from,
            &network,
            Some(token_a),
            U256::from(1000),
            now,
        );
        cache.record(
            Dimension::TokenAmount,
            from,
            &network,
            Some(token_b),
            U256::from(500),
            now,
        );

        let sum_a = cache.sum(
            Dimension::TokenAmount,
            from,
            &network,
            Some(token_a),
            StdDuration::from_secs(3600),
            now,
        );
        assert_eq!(sum_a, U256::from(1000));
    }
}
