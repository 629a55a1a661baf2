use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
};
use std::sync::Arc;

use peerpod_core::constants::{ORIGIN_HEADER, SIGNATURE_HEADER};
use peerpod_core::AppError;

use crate::error::HttpAppError;
use crate::state::AppState;

/// Receive a propagation message from a friend pod.
///
/// 204 whether the message was applied or discarded as stale, 401 when the sender
/// cannot be authenticated, 400 for anything malformed or inconsistent.
#[tracing::instrument(skip(state, headers, body), fields(origin = tracing::field::Empty))]
pub async fn inbox(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, HttpAppError> {
    let origin = headers
        .get(ORIGIN_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized(format!("Missing {} header", ORIGIN_HEADER)))?;
    tracing::Span::current().record("origin", origin);

    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());

    state
        .inbound
        .accept(origin, signature, &body)
        .await
        .map_err(|e| match e {
            AppError::NotFound(msg) => AppError::Validation(msg),
            e => e,
        })?;

    Ok(StatusCode::NO_CONTENT)
}
