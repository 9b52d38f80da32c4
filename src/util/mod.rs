//! Shared helpers.

pub mod retry;

pub use retry::{RetryHandle, RetryPolicy, RetryStrategy};
