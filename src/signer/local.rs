//! In-process signer backed by a raw private key (spec §4.1's `LocalSigner`).
//!
//! Signs any network's transaction with one configured key and builds+encodes
//! the EIP-1559 envelope with `alloy-consensus` rather than delegating
//! encoding to a provider.

use std::collections::HashMap;

use alloy_consensus::{SignableTransaction, TxEip1559};
use alloy_eips::eip2930::AccessList;
use alloy_network::TxSignerSync;
use alloy_primitives::{Address, Bytes, TxKind};
use alloy_signer_local::PrivateKeySigner;
use async_trait::async_trait;

use crate::domain::NetworkId;

use super::{Signer, SignerError, UnsignedTransaction};

/// Signs locally with a single key shared across every configured network.
pub struct LocalSigner {
    key: PrivateKeySigner,
}

impl LocalSigner {
    #[must_use]
    pub fn new(key: PrivateKeySigner) -> Self {
        Self { key }
    }

    /// Parses a hex-encoded (with or without `0x`) secp256k1 private key.
    pub fn from_hex(private_key: &str) -> Result<Self, SignerError> {
        let key = private_key
            .parse::<PrivateKeySigner>()
            .map_err(|e| SignerError::Denied(format!("invalid private key: {e}")))?;
        Ok(Self::new(key))
    }
}

#[async_trait]
impl Signer for LocalSigner {
    async fn address(&self, _network: &NetworkId) -> Result<Address, SignerError> {
        Ok(self.key.address())
    }

    async fn sign(&self, tx: &UnsignedTransaction) -> Result<Bytes, SignerError> {
        let mut unsigned = TxEip1559 {
            chain_id: tx.chain_id,
            nonce: tx.sequence_number,
            gas_limit: tx.gas_limit,
            max_fee_per_gas: tx.max_fee_per_gas,
            max_priority_fee_per_gas: tx.max_priority_fee_per_gas,
            to: TxKind::Call(tx.to),
            value: tx.value,
            access_list: AccessList::default(),
            input: tx.data.clone(),
        };

        let signature = self
            .key
            .sign_transaction_sync(&mut unsigned)
            .map_err(|e| SignerError::Unavailable(format!("local signing failed: {e}")))?;

        let signed = unsigned.into_signed(signature);
        let encoded = alloy_eips::eip2718::Encodable2718::encoded_2718(&signed);
        Ok(Bytes::from(encoded))
    }
}

/// Holds one [`LocalSigner`] per network when each network's relayer account
/// is a distinct key, as an alternative wiring to the single-shared-key
/// constructor above.
pub struct PerNetworkLocalSigner {
    signers: HashMap<NetworkId, LocalSigner>,
}

impl PerNetworkLocalSigner {
    #[must_use]
    pub fn new(signers: HashMap<NetworkId, LocalSigner>) -> Self {
        Self { signers }
    }

    fn signer_for(&self, network: &NetworkId) -> Result<&LocalSigner, SignerError> {
        self.signers
            .get(network)
            .ok_or_else(|| SignerError::Denied(format!("no local signer configured for {network}")))
    }
}

#[async_trait]
impl Signer for PerNetworkLocalSigner {
    async fn address(&self, network: &NetworkId) -> Result<Address, SignerError> {
        self.signer_for(network)?.address(network).await
    }

    async fn sign(&self, tx: &UnsignedTransaction) -> Result<Bytes, SignerError> {
        self.signer_for(&tx.network)?.sign(tx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::U256;

    fn sample_tx(network: &str) -> UnsignedTransaction {
        UnsignedTransaction {
            network: network.to_string(),
            chain_id: 1337,
            to: Address::repeat_byte(0x22),
            value: U256::from(1_000u64),
            data: Bytes::new(),
            gas_limit: 21_000,
            max_fee_per_gas: 2_000_000_000,
            max_priority_fee_per_gas: 1_000_000_000,
            sequence_number: 0,
        }
    }

    #[tokio::test]
    async fn signs_deterministically_under_a_fixed_key() {
        let key = PrivateKeySigner::random();
        let signer = LocalSigner::new(key.clone());

        let tx = sample_tx("localhost");
        let first = signer.sign(&tx).await.unwrap();
        let second = signer.sign(&tx).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(signer.address(&tx.network).await.unwrap(), key.address());
    }

    #[tokio::test]
    async fn per_network_signer_rejects_unknown_network() {
        let mut signers = HashMap::new();
        signers.insert("mainnet".to_string(), LocalSigner::new(PrivateKeySigner::random()));
        let signer = PerNetworkLocalSigner::new(signers);

        let err = signer.sign(&sample_tx("testnet")).await.unwrap_err();
        assert!(matches!(err, SignerError::Denied(_)));
    }
}
