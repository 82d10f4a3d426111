pub mod owner;

pub use owner::{owner_middleware, Owner, USER_ID_HEADER};
