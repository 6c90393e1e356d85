//! Shared utilities.

pub mod retry;

pub use retry::{retry, Backoff};
