pub mod admin_auth;
pub mod request_id;
pub mod retry;

pub use admin_auth::require_admin_token;
pub use request_id::request_id_middleware;
pub use retry::{with_retry, RetryConfig, RetryPolicy};
