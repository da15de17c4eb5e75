//! The single error type every handler returns, turned into the wire error
//! shape `{ok: false, code, reason}` (spec §6) by its [`IntoResponse`] impl.
//!
//! One enum per upstream error surface, one `IntoResponse` match, no
//! per-handler status-code juggling.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::pipeline::PipelineError;
use crate::policy::schema::SchemaError;
use crate::store::StoreError;

#[derive(Debug)]
pub enum ApiError {
    Pipeline(PipelineError),
    Store(StoreError),
    NotFound,
    Unauthorized(String),
    BadRequest(String),
    Unavailable(String),
    Timeout,
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        Self::Pipeline(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Self::NotFound,
            StoreError::InvalidRuleValue(SchemaError::Invalid(_, e)) => {
                Self::BadRequest(format!("rule value invalid: {e}"))
            }
            other => Self::Store(other),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    ok: bool,
    code: String,
    reason: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, reason) = match &self {
            Self::Pipeline(err) => (pipeline_status(err), err.code().to_string(), err.to_string()),
            Self::Store(err) => (StatusCode::INTERNAL_SERVER_ERROR, "internal".to_string(), err.to_string()),
            Self::NotFound => (StatusCode::NOT_FOUND, "not_found".to_string(), "no matching record".to_string()),
            Self::Unauthorized(reason) => (StatusCode::UNAUTHORIZED, "unauthorized".to_string(), reason.clone()),
            Self::BadRequest(reason) => (StatusCode::BAD_REQUEST, "invalid_request".to_string(), reason.clone()),
            Self::Unavailable(reason) => (StatusCode::SERVICE_UNAVAILABLE, "not_ready".to_string(), reason.clone()),
            Self::Timeout => (
                StatusCode::GATEWAY_TIMEOUT,
                "timeout".to_string(),
                "request exceeded the server's serve timeout".to_string(),
            ),
        };

        if matches!(status, StatusCode::INTERNAL_SERVER_ERROR) {
            tracing::error!(%code, %reason, "request failed");
        } else {
            tracing::warn!(%code, %reason, "request rejected");
        }

        (status, Json(ErrorBody { ok: false, code, reason })).into_response()
    }
}

/// Maps a [`PipelineError`] to the HTTP status the spec §6 wire contract
/// implies: 4xx for anything the caller could fix by changing the request or
/// backing off, 5xx for anything that's this service's own fault.
fn pipeline_status(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        PipelineError::PolicyRejected(crate::policy::PolicyRejection::NotAllowlisted) => StatusCode::FORBIDDEN,
        PipelineError::PolicyRejected(_)
        | PipelineError::WouldRevert(_)
        | PipelineError::FeeCapTooLow
        | PipelineError::GasLimitTooLow { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        PipelineError::RelayerSaturated => StatusCode::TOO_MANY_REQUESTS,
        PipelineError::AllocatorStalled(_)
        | PipelineError::ChainTransient(_)
        | PipelineError::PersistFailed(_)
        | PipelineError::BroadcastFailedPostPersist { .. }
        | PipelineError::SignerUnavailable(_)
        | PipelineError::DeadlineExceeded => StatusCode::SERVICE_UNAVAILABLE,
    }
}
