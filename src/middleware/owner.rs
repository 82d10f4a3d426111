use axum::{extract::Request, middleware::Next, response::Response};

use crate::error::AppError;

/// Header carrying the caller's opaque user identifier
pub const USER_ID_HEADER: &str = "UserId";

/// Owner of the current request, taken from the `UserId` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner(pub String);

impl Owner {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Identity middleware
/// Rejects requests without a non-blank `UserId` header
pub async fn owner_middleware(mut request: Request, next: Next) -> Result<Response, AppError> {
    let owner = request
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::BadRequest("UserId header is required".to_string()))?
        .to_string();

    request.extensions_mut().insert(Owner(owner));

    Ok(next.run(request).await)
}
