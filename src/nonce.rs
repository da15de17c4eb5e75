//! Nonce Allocator (C2): hands out gap-free, strictly increasing sequence
//! numbers per (relayer-address, network), serialised per key.
//!
//! A per-key cached cursor, refreshed from chain state on first use: a
//! `DashMap` maps each key to an `Arc<Mutex<Cursor>>`, cloned out under a
//! short-lived map lock and then held, as an owned guard, across the whole
//! allocate-sign-broadcast sequence by the caller (spec §4.2's tie-break
//! requirement, enforced by the pipeline holding the guard from step 6
//! through step 9).

use std::sync::Arc;

use alloy_primitives::{Address, U256};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, instrument, warn};

use crate::domain::NetworkId;

#[derive(Debug, Error)]
pub enum NonceError {
    /// §4.2: "on persistent failure to read on-chain count, `acquire` fails
    /// fast with `allocator-stalled`".
    #[error("allocator stalled: could not read on-chain pending count for {0}")]
    AllocatorStalled(Address),
}

/// A per-key cursor: the next sequence number to hand out, and whether it
/// has been initialised from on-chain state yet.
#[derive(Debug, Clone, Copy)]
struct Cursor {
    next: U256,
    initialized: bool,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct Key {
    relayer: Address,
    network: NetworkId,
}

/// A held allocator slot. The caller must hold this across sign+broadcast
/// and drop it (releasing the per-key lock) on every exit path, including
/// deadline breach (spec §5) — dropping without calling
/// [`NonceAllocator::release_unused`] first simply leaves the allocated
/// sequence number consumed, for the Confirmation Tracker to reconcile if no
/// broadcast ever lands.
pub struct Guard {
    permit: OwnedMutexGuard<Cursor>,
    pub sequence_number: U256,
}

/// Per-(relayer-address, network) sequence-number allocator.
pub struct NonceAllocator {
    cursors: DashMap<Key, Arc<Mutex<Cursor>>>,
}

impl Default for NonceAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl NonceAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cursors: DashMap::new(),
        }
    }

    fn cursor_for(&self, relayer: Address, network: &NetworkId) -> Arc<Mutex<Cursor>> {
        let key = Key {
            relayer,
            network: network.clone(),
        };
        self.cursors
            .entry(key)
            .or_insert_with(|| {
                Arc::new(Mutex::new(Cursor {
                    next: U256::ZERO,
                    initialized: false,
                }))
            })
            .clone()
    }

    /// Acquires the allocator lock for `(relayer, network)` and returns the
    /// next sequence number. The lock is held by the returned [`Guard`] for
    /// as long as it lives; callers MUST hold it across sign+broadcast (spec
    /// §4.2's tie-break) and release it (by dropping the guard) on every
    /// exit path, including deadline breach (spec §5).
    ///
    /// `on_chain_pending_count` is consulted only the first time a cursor is
    /// seen (or after a restart) to seed it from chain state (spec §4.2).
    #[instrument(skip(self, on_chain_pending_count), fields(%relayer, %network))]
    pub async fn acquire<F, Fut>(
        &self,
        relayer: Address,
        network: &NetworkId,
        on_chain_pending_count: F,
    ) -> Result<Guard, NonceError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Option<U256>>,
    {
        let cursor = self.cursor_for(relayer, network);
        let mut permit = cursor.lock_owned().await;

        if !permit.initialized {
            match on_chain_pending_count().await {
                Some(count) => {
                    permit.next = count;
                    permit.initialized = true;
                }
                None => return Err(NonceError::AllocatorStalled(relayer)),
            }
        }

        let sequence_number = permit.next;
        permit.next += U256::from(1);

        info!(%sequence_number, "allocated sequence number");

        Ok(Guard {
            permit,
            sequence_number,
        })
    }

    /// Releases the most recently issued sequence number held by `guard`
    /// back to the pool, per spec §4.2: "only permitted for the most
    /// recently issued value; if the call lags, leave the gap". Takes the
    /// guard by value so the lock is still held while the cursor is rolled
    /// back.
    pub fn release_unused(&self, mut guard: Guard) {
        let sequence_number = guard.sequence_number;
        if guard.permit.next == sequence_number + U256::from(1) {
            guard.permit.next = sequence_number;
            info!(%sequence_number, "released unused sequence number");
        } else {
            warn!(
                %sequence_number,
                next = %guard.permit.next,
                "release_unused lagging the most recent allocation; leaving gap for confirmation tracker",
            );
        }
    }

    /// Resyncs the cursor for `(relayer, network)` to
    /// `max(cursor, on_chain_pending_count)` — never decreases (spec §4.2).
    /// Called on boot and by the Confirmation Tracker (C9) after detecting a
    /// `dropped` transaction.
    pub async fn resync(
        &self,
        relayer: Address,
        network: &NetworkId,
        on_chain_pending_count: U256,
    ) {
        let cursor = self.cursor_for(relayer, network);
        let mut guard = cursor.lock_owned().await;
        guard.next = guard.next.max(on_chain_pending_count);
        guard.initialized = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> Address {
        Address::repeat_byte(n)
    }

    #[tokio::test]
    async fn acquire_initializes_from_chain_once_then_increments() {
        let allocator = NonceAllocator::new();
        let network = "localhost".to_string();
        let relayer = addr(1);

        let g0 = allocator
            .acquire(relayer, &network, || async { Some(U256::from(5)) })
            .await
            .unwrap();
        assert_eq!(g0.sequence_number, U256::from(5));
        drop(g0);

        let g1 = allocator
            .acquire(relayer, &network, || async { panic!("should not re-query chain") })
            .await
            .unwrap();
        assert_eq!(g1.sequence_number, U256::from(6));
    }

    #[tokio::test]
    async fn release_unused_only_rolls_back_the_most_recent_allocation() {
        let allocator = NonceAllocator::new();
        let network = "localhost".to_string();
        let relayer = addr(2);

        let guard = allocator
            .acquire(relayer, &network, || async { Some(U256::ZERO) })
            .await
            .unwrap();
        assert_eq!(guard.sequence_number, U256::ZERO);
        allocator.release_unused(guard);

        let guard = allocator
            .acquire(relayer, &network, || async { panic!("initialized already") })
            .await
            .unwrap();
        assert_eq!(guard.sequence_number, U256::ZERO);
    }

    #[tokio::test]
    async fn stalled_chain_read_fails_fast_without_poisoning_the_cursor() {
        let allocator = NonceAllocator::new();
        let network = "localhost".to_string();
        let relayer = addr(3);

        let err = allocator
            .acquire(relayer, &network, || async { None })
            .await
            .unwrap_err();
        assert!(matches!(err, NonceError::AllocatorStalled(_)));

        let guard = allocator
            .acquire(relayer, &network, || async { Some(U256::from(42)) })
            .await
            .unwrap();
        assert_eq!(guard.sequence_number, U256::from(42));
    }

    #[tokio::test]
    async fn concurrent_acquisitions_form_a_contiguous_range() {
        use std::sync::Arc as StdArc;

        let allocator = StdArc::new(NonceAllocator::new());
        let network = "localhost".to_string();
        let relayer = addr(4);

        let mut handles = Vec::new();
        for _ in 0..50 {
            let allocator = StdArc::clone(&allocator);
            let network = network.clone();
            handles.push(tokio::spawn(async move {
                let guard = allocator
                    .acquire(relayer, &network, || async { Some(U256::ZERO) })
                    .await
                    .unwrap();
                guard.sequence_number
            }));
        }

        let mut numbers = Vec::new();
        for handle in handles {
            numbers.push(handle.await.unwrap());
        }
        numbers.sort();

        let expected: Vec<U256> = (0..50u64).map(U256::from).collect();
        assert_eq!(numbers, expected);
    }
}
