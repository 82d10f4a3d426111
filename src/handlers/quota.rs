use axum::{extract::State, http::StatusCode, response::Response, Extension, Json};

use crate::error::{ApiResponse, Result};
use crate::handlers::with_request_id;
use crate::middleware::Owner;
use crate::models::RateLimitInfo;
use crate::AppState;

/// Storage quota for the caller
/// GET /api/v1/quota
pub async fn get_quota(
    State(state): State<AppState>,
    Extension(owner): Extension<Owner>,
) -> Result<Response> {
    let request_id = state.limiter.check(owner.as_str())?;
    let view = state.quota.quota_view(owner.as_str()).await?;
    Ok(with_request_id(&request_id, StatusCode::OK, ApiResponse::success(view)))
}

/// Rate-limit state for the caller. Reading it does not use up a call.
/// GET /api/v1/rate_limit
pub async fn get_rate_limit(
    State(state): State<AppState>,
    Extension(owner): Extension<Owner>,
) -> Json<ApiResponse<RateLimitInfo>> {
    Json(ApiResponse::success(state.limiter.info(owner.as_str())))
}
