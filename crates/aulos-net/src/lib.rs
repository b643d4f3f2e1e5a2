#![forbid(unsafe_code)]

pub mod backoff;
pub mod error;
pub mod retry;

pub use backoff::BackoffOptions;
pub use error::{ErrorClass, NetError, NetResult};
pub use retry::{retry_with_backoff, try_urls_with_backoff};
