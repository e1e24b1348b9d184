//! Pure utility functions.
//!
//! These are stateless helper functions used across the codebase.

pub mod bootstrap;
pub mod retry;

pub use bootstrap::{connect_with_retry, init_tracing};
