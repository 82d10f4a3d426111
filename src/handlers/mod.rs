pub mod file;
pub mod quota;

use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::{ApiResponse, REQUEST_ID_HEADER};

/// JSON response tagged with the request id of the admitted call
pub(crate) fn with_request_id<T: Serialize>(
    request_id: &str,
    status: StatusCode,
    body: ApiResponse<T>,
) -> Response {
    let mut response = (status, Json(body)).into_response();
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}
