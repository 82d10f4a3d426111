pub mod file;
pub mod hasher;
pub mod ledger;
pub mod pipeline;
pub mod quota;
pub mod rate_limiter;

pub use file::FileService;
pub use hasher::{ContentDigest, ContentHasher};
pub use ledger::{ContentLedger, CreationLock, PendingBlob};
pub use pipeline::{Pipeline, UploadBody};
pub use quota::QuotaAccountant;
pub use rate_limiter::RateLimiter;
