use serde::Serialize;

/// Rate limit snapshot for one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitInfo {
    pub remaining_calls: u32,
    pub limit: u32,
    /// Window length in seconds
    pub window: u64,
    /// Unix second at which the oldest live call expires, 0 when idle
    pub reset_time: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Denied,
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}
