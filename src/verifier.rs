//! Request Verifier (C5): parses, validates, and authenticates an inbound
//! [`Request`] before it is ever admitted to policy. Steps run in the order
//! given in spec §4.5; the first failing step wins.
//!
//! Uses the standard EIP-712 domain-separated signing/recovery conventions,
//! narrowed to EOA-only recovery (no EIP-1271/6492 contract-wallet support —
//! `MinimalForwarder` doesn't call back into the signer for those).

use alloy_primitives::{Address, Signature, U256};
use alloy_sol_types::{eip712_domain, sol, SolStruct};
use thiserror::Error;

use crate::config::NetworkConfig;
use crate::domain::Request;

sol! {
    /// Mirrors OpenZeppelin's `MinimalForwarder.ForwardRequest`.
    struct ForwardRequest {
        address from;
        address to;
        uint256 value;
        uint256 gas;
        uint256 nonce;
        bytes data;
    }
}

const DOMAIN_NAME: &str = "MinimalForwarder";
const DOMAIN_VERSION: &str = "0.0.1";

/// A structurally or cryptographically invalid request. Carries the
/// offending field so callers can build the `invalid-request` wire error
/// (spec §4.5, §6).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("field {0} is malformed")]
    MalformedField(&'static str),
    #[error("network {0:?} is not configured")]
    UnsupportedNetwork(String),
    #[error("declared gas {gas} exceeds hard ceiling {ceiling}")]
    GasCeilingExceeded { gas: U256, ceiling: U256 },
    #[error("value {value} exceeds hard ceiling {ceiling}")]
    ValueCeilingExceeded { value: U256, ceiling: U256 },
    #[error("signature is malformed")]
    MalformedSignature,
    #[error("recovered signer does not match `from`")]
    SignerMismatch,
}

/// Hard ceilings independent of policy (spec §4.5 step 3: "a floor defence
/// independent of policy").
#[derive(Debug, Clone, Copy)]
pub struct HardCeilings {
    pub max_gas_limit: U256,
    pub max_tx_value: U256,
}

/// Stateless request verifier. Holds no mutable state; network configuration
/// is passed in per call since it's looked up fresh from the immutable
/// `Config` (spec §6).
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestVerifier;

impl RequestVerifier {
    /// Runs all five verification steps of spec §4.5 against `request`,
    /// using `network` for domain binding and `ceilings` for the hard-ceiling
    /// check. Returns the recovered signer address on success (always equal
    /// to `request.from`, case-insensitively, by construction).
    pub fn verify(
        &self,
        request: &Request,
        network: &NetworkConfig,
        ceilings: HardCeilings,
    ) -> Result<Address, VerifyError> {
        Self::check_structure(request)?;
        Self::check_ceilings(request, ceilings)?;

        let hash = Self::signing_hash(request, network.chain_id, network.forwarder_address);
        let recovered = Self::recover_signer(request, hash)?;

        if recovered != request.from {
            return Err(VerifyError::SignerMismatch);
        }

        Ok(recovered)
    }

    /// Step 1: structural validation. Field presence and shape are already
    /// enforced by `Request`'s `serde` impl (hex lengths, decimal
    /// well-formedness); what's left here is the 65-byte signature shape.
    fn check_structure(request: &Request) -> Result<(), VerifyError> {
        if request.signature.len() != 65 {
            return Err(VerifyError::MalformedField("signature"));
        }
        Ok(())
    }

    /// Step 3: hard ceilings, enforced regardless of what policy allows.
    fn check_ceilings(request: &Request, ceilings: HardCeilings) -> Result<(), VerifyError> {
        if request.gas > ceilings.max_gas_limit {
            return Err(VerifyError::GasCeilingExceeded {
                gas: request.gas,
                ceiling: ceilings.max_gas_limit,
            });
        }
        if request.value > ceilings.max_tx_value {
            return Err(VerifyError::ValueCeilingExceeded {
                value: request.value,
                ceiling: ceilings.max_tx_value,
            });
        }
        Ok(())
    }

    /// Step 4: reconstruct the structured-data hash binding the request to
    /// the fixed `MinimalForwarder` v0.0.1 domain (spec §4.5, §6). This is a
    /// compatibility contract and MUST be reproduced bit-exactly.
    #[must_use]
    pub fn signing_hash(
        request: &Request,
        chain_id: u64,
        forwarder_address: Address,
    ) -> alloy_primitives::B256 {
        let domain = eip712_domain! {
            name: DOMAIN_NAME,
            version: DOMAIN_VERSION,
            chain_id: chain_id,
            verifying_contract: forwarder_address,
        };

        let forward_request = ForwardRequest {
            from: request.from,
            to: request.to,
            value: request.value,
            gas: request.gas,
            nonce: request.user_nonce,
            data: request.data.clone(),
        };

        forward_request.eip712_signing_hash(&domain)
    }

    /// Step 5: recover the signer from the 65-byte (r, s, v) signature.
    fn recover_signer(
        request: &Request,
        hash: alloy_primitives::B256,
    ) -> Result<Address, VerifyError> {
        let signature =
            Signature::try_from(request.signature.as_ref()).map_err(|_| VerifyError::MalformedSignature)?;

        signature
            .recover_address_from_prehash(&hash)
            .map_err(|_| VerifyError::MalformedSignature)
    }
}

/// Step 2: network membership, checked by the caller (pipeline) before
/// dispatching into `verify`, since it needs the whole `Config` rather than a
/// single `NetworkConfig`. Kept here so the mapping to `VerifyError` lives
/// next to the rest of the verifier's errors.
#[must_use]
pub fn unsupported_network(network: &str) -> VerifyError {
    VerifyError::UnsupportedNetwork(network.to_string())
}

#[cfg(test)]
mod tests {
    use alloy_primitives::{Bytes, U256};
    use alloy_signer::SignerSync;
    use alloy_signer_local::PrivateKeySigner;

    use super::*;

    fn network() -> NetworkConfig {
        NetworkConfig {
            chain_id: 31337,
            rpc_endpoint: "http://localhost:8545/".parse().unwrap(),
            forwarder_address: Address::ZERO,
        }
    }

    fn ceilings() -> HardCeilings {
        HardCeilings {
            max_gas_limit: U256::from(10_000_000u64),
            max_tx_value: U256::from(10).pow(U256::from(19)),
        }
    }

    fn signed_request(signer: &PrivateKeySigner, network: &NetworkConfig) -> Request {
        let mut request = Request {
            from: signer.address(),
            to: Address::repeat_byte(0x42),
            value: U256::from(10).pow(U256::from(18)),
            gas: U256::from(100_000u64),
            user_nonce: U256::ZERO,
            data: Bytes::new(),
            signature: Bytes::new(),
            network: "localhost".to_string(),
            token_address: None,
            token_kind: None,
            amount: None,
            token_id: None,
        };

        let hash = RequestVerifier::signing_hash(&request, network.chain_id, network.forwarder_address);
        let signature = signer.sign_hash_sync(&hash).unwrap();
        request.signature = Bytes::from(signature.as_bytes().to_vec());
        request
    }

    #[test]
    fn valid_signature_verifies() {
        let signer = PrivateKeySigner::random();
        let network = network();
        let request = signed_request(&signer, &network);

        let verifier = RequestVerifier;
        let recovered = verifier.verify(&request, &network, ceilings()).unwrap();
        assert_eq!(recovered, signer.address());
    }

    #[test]
    fn mutated_signature_byte_fails_to_verify() {
        let signer = PrivateKeySigner::random();
        let network = network();
        let mut request = signed_request(&signer, &network);

        let mut bytes = request.signature.to_vec();
        bytes[0] ^= 0x01;
        request.signature = Bytes::from(bytes);

        let verifier = RequestVerifier;
        assert!(verifier.verify(&request, &network, ceilings()).is_err());
    }

    #[test]
    fn gas_above_ceiling_is_rejected_before_signature_check() {
        let signer = PrivateKeySigner::random();
        let network = network();
        let mut request = signed_request(&signer, &network);
        request.gas = U256::from(100_000_000u64);

        let verifier = RequestVerifier;
        let err = verifier.verify(&request, &network, ceilings()).unwrap_err();
        assert!(matches!(err, VerifyError::GasCeilingExceeded { .. }));
    }
}
