//! A stand-in for a hosted key-management signer's HTTP API, implementing
//! the same wire contract as [`signer_api::SignerApiClient`] talks to:
//! `GET /address` and `POST /sign`. Used to exercise `RemoteSigner` in
//! integration tests without a real hosted signing service.

use std::net::SocketAddr;
use std::sync::Arc;

use alloy_consensus::{SignableTransaction, TxEip1559};
use alloy_eips::eip2718::Encodable2718;
use alloy_eips::eip2930::AccessList;
use alloy_network::TxSignerSync;
use alloy_primitives::{Bytes, TxKind};
use alloy_signer_local::PrivateKeySigner;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use signer_api::data::{AddressResponse, SignRequest, SignResponse};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

struct MockSignerState {
    key: PrivateKeySigner,
}

/// A running mock signer and the handle that owns its server task. Dropping
/// the handle does not stop the server; abort it explicitly if the test
/// needs to simulate the hosted signer going away.
pub struct MockSigner {
    pub base_url: String,
    pub address: alloy_primitives::Address,
    pub task: JoinHandle<()>,
}

/// Starts a mock hosted-signer HTTP server on a random local port, signing
/// every request with `key`.
pub async fn spawn(key: PrivateKeySigner) -> anyhow::Result<MockSigner> {
    let address = key.address();
    let state = Arc::new(MockSignerState { key });

    let router = Router::new()
        .route("/address", get(get_address))
        .route("/sign", post(sign))
        .with_state(state);

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
    let local_addr = listener.local_addr()?;
    let base_url = format!("http://{local_addr}/");

    let task = tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    Ok(MockSigner {
        base_url,
        address,
        task,
    })
}

async fn get_address(State(state): State<Arc<MockSignerState>>) -> Json<AddressResponse> {
    Json(AddressResponse {
        address: state.key.address(),
    })
}

async fn sign(
    State(state): State<Arc<MockSignerState>>,
    Json(request): Json<SignRequest>,
) -> Result<Json<SignResponse>, axum::http::StatusCode> {
    let mut unsigned = TxEip1559 {
        chain_id: request.chain_id,
        nonce: u64::try_from(request.nonce).map_err(|_| axum::http::StatusCode::BAD_REQUEST)?,
        gas_limit: u64::try_from(request.gas_limit).map_err(|_| axum::http::StatusCode::BAD_REQUEST)?,
        max_fee_per_gas: u128::try_from(request.max_fee_per_gas)
            .map_err(|_| axum::http::StatusCode::BAD_REQUEST)?,
        max_priority_fee_per_gas: u128::try_from(request.max_priority_fee_per_gas)
            .map_err(|_| axum::http::StatusCode::BAD_REQUEST)?,
        to: TxKind::Call(request.to),
        value: request.value,
        access_list: AccessList::default(),
        input: request.data,
    };

    let signature = state
        .key
        .sign_transaction_sync(&mut unsigned)
        .map_err(|_| axum::http::StatusCode::INTERNAL_SERVER_ERROR)?;

    let signed = unsigned.into_signed(signature);
    let encoded = Bytes::from(signed.encoded_2718());

    Ok(Json(SignResponse {
        signed_raw_transaction: encoded,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serves_the_configured_key_address() {
        let key = PrivateKeySigner::random();
        let expected = key.address();
        let mock = spawn(key).await.unwrap();

        let client = reqwest::Client::new();
        let response: AddressResponse = client
            .get(format!("{}address", mock.base_url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(response.address, expected);
        mock.task.abort();
    }
}
