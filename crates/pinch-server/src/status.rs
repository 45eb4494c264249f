//! GET `/status/{handle}`: poll or wait for the terminal result.

use axum::extract::{Path, Query, State};
use axum::Json;

use pinch_state::PipelineResult;

use crate::error::{PinchError, Result};
use crate::params::parse_wait_for;
use crate::service::{RawQuery, Service};

/// Block up to `wait-for` (default 1 s) for the session's terminal result.
/// 404 when no result cell exists or the bound elapses while still pending.
pub async fn status(
    State(service): State<Service>,
    Path(handle): Path<String>,
    Query(raw): Query<RawQuery>,
) -> Result<Json<PipelineResult>> {
    let wait_for = parse_wait_for(&raw)?;
    service
        .results()
        .wait(&handle, wait_for)
        .await
        .map(Json)
        .ok_or_else(|| PinchError::NotFound(format!("no result for handle {handle}")))
}
