pub mod blob;
pub mod file;
pub mod quota;
pub mod rate_limit;

pub use blob::*;
pub use file::*;
pub use quota::*;
pub use rate_limit::*;
