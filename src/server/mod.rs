//! HTTP surface (spec §6): the inbound relay endpoint, transaction
//! status/listing lookups, the policy-rule admin surface, and the
//! liveness/readiness/metrics endpoints.
//!
//! An `axum::Router` built from an `Arc<App>`-shaped state, `tower_http`'s
//! catch-panic and trace layers, and a single [`error::ApiError`]
//! `IntoResponse` impl for every handler.

pub mod error;

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, B256};
use axum::extract::{Path, Query, Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use crate::app::App;
use crate::domain::{PolicyRuleKind, Request as RelayRequest, TransactionRecord};
use crate::monitoring::Monitoring;
use crate::utils::auth::AuthResult;

use error::ApiError;

const DEFAULT_LIST_LIMIT: i64 = 100;
const MAX_LIST_LIMIT: i64 = 1000;

#[must_use]
pub fn router(app: Arc<App>) -> Router {
    let serve_timeout = app.config.server.serve_timeout;

    let admin = Router::new()
        .route(
            "/admin/policy-rules",
            get(list_rules).post(create_rule),
        )
        .route(
            "/admin/policy-rules/:id",
            put(update_rule).delete(delete_rule),
        )
        .route("/admin/policy-rules/reload", post(reload_rules))
        .route_layer(middleware::from_fn_with_state(app.clone(), require_auth));

    Router::new()
        .route("/relay", post(relay))
        .route("/transactions/:tx_hash", get(get_transaction))
        .route("/accounts/:address/transactions", get(list_transactions))
        .route("/live", get(live))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .merge(admin)
        .layer(middleware::from_fn_with_state(serve_timeout, enforce_serve_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .with_state(app)
}

async fn enforce_serve_timeout(State(timeout): State<Duration>, request: Request, next: Next) -> Response {
    match tokio::time::timeout(timeout, next.run(request)).await {
        Ok(response) => response,
        Err(_) => ApiError::Timeout.into_response(),
    }
}

async fn require_auth(State(app): State<Arc<App>>, request: Request, next: Next) -> Response {
    match app.auth.validate(&request) {
        AuthResult::Allowed => next.run(request).await,
        AuthResult::Denied(reason) => ApiError::Unauthorized(reason).into_response(),
    }
}

#[derive(Serialize)]
struct AcceptedResponse {
    ok: bool,
    tx_hash: B256,
    gas_price: String,
    gas_limit: String,
}

#[tracing::instrument(skip(app, request))]
async fn relay(
    State(app): State<Arc<App>>,
    Json(request): Json<RelayRequest>,
) -> Result<Json<AcceptedResponse>, ApiError> {
    match app.pipeline.handle(request).await {
        Ok(accepted) => Ok(Json(AcceptedResponse {
            ok: true,
            tx_hash: accepted.tx_hash,
            gas_price: accepted.gas_price.to_string(),
            gas_limit: accepted.gas_limit.to_string(),
        })),
        Err(err) => {
            Monitoring::record_rejection(err.code());
            Err(ApiError::from(err))
        }
    }
}

async fn get_transaction(
    State(app): State<Arc<App>>,
    Path(tx_hash): Path<B256>,
) -> Result<Json<TransactionRecord>, ApiError> {
    let record = app.store.get_by_hash(tx_hash).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(record))
}

#[derive(Deserialize)]
struct ListQuery {
    offset: Option<i64>,
    limit: Option<i64>,
}

async fn list_transactions(
    State(app): State<Arc<App>>,
    Path(address): Path<Address>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<TransactionRecord>>, ApiError> {
    let offset = query.offset.unwrap_or(0).max(0);
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let records = app.store.list_for_account(address, offset, limit).await?;
    Ok(Json(records))
}

#[derive(Deserialize)]
struct ListRulesQuery {
    kind: Option<PolicyRuleKind>,
}

async fn list_rules(
    State(app): State<Arc<App>>,
    Query(query): Query<ListRulesQuery>,
) -> Result<Json<Vec<crate::domain::PolicyRule>>, ApiError> {
    let rules = app.store.list_policy_rules(query.kind).await?;
    Ok(Json(rules))
}

#[derive(Deserialize)]
struct CreateRuleRequest {
    kind: PolicyRuleKind,
    target: String,
    value: serde_json::Value,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

async fn create_rule(
    State(app): State<Arc<App>>,
    Json(body): Json<CreateRuleRequest>,
) -> Result<Json<crate::domain::PolicyRule>, ApiError> {
    let rule = app
        .store
        .insert_policy_rule(body.kind, &body.target, body.value, body.enabled)
        .await?;
    refresh_policy(&app).await?;
    Ok(Json(rule))
}

#[derive(Deserialize)]
struct UpdateRuleRequest {
    value: serde_json::Value,
    enabled: bool,
}

async fn update_rule(
    State(app): State<Arc<App>>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateRuleRequest>,
) -> Result<Json<crate::domain::PolicyRule>, ApiError> {
    let rule = app.store.update_policy_rule(id, body.value, body.enabled).await?;
    refresh_policy(&app).await?;
    Ok(Json(rule))
}

async fn delete_rule(State(app): State<Arc<App>>, Path(id): Path<i64>) -> Result<(), ApiError> {
    app.store.delete_policy_rule(id).await?;
    refresh_policy(&app).await?;
    Ok(())
}

#[derive(Serialize)]
struct ReloadResponse {
    ok: bool,
    rule_count: usize,
}

async fn reload_rules(State(app): State<Arc<App>>) -> Result<Json<ReloadResponse>, ApiError> {
    let rule_count = refresh_policy(&app).await?;
    Ok(Json(ReloadResponse { ok: true, rule_count }))
}

async fn refresh_policy(app: &Arc<App>) -> Result<usize, ApiError> {
    let rules = app.store.list_policy_rules(None).await?;
    let rule_count = rules.len();
    app.policy.reload(rules);
    Ok(rule_count)
}

async fn live() -> &'static str {
    "ok"
}

/// Succeeds only once the Store and every configured Chain Client have
/// answered at least one query. The Counter Cache is purely in-process (no
/// external connection to warm up), so it's ready as soon as the `App` is
/// constructed.
async fn ready(State(app): State<Arc<App>>) -> Result<&'static str, ApiError> {
    sqlx::query("SELECT 1")
        .execute(&**app.store)
        .await
        .map_err(crate::store::StoreError::from)?;

    for network in app.chain.networks() {
        let client = app.chain.get(network).map_err(|e| ApiError::Unavailable(e.to_string()))?;
        client
            .head_block()
            .await
            .map_err(|e| ApiError::Unavailable(format!("network {network} not ready: {e}")))?;
    }

    Ok("ok")
}

async fn metrics() -> Result<Response, ApiError> {
    use prometheus::{Encoder, TextEncoder};

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| ApiError::BadRequest(format!("failed to encode metrics: {e}")))?;

    Ok(([(axum::http::header::CONTENT_TYPE, encoder.format_type().to_string())], buffer).into_response())
}
