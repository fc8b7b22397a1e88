//! Credential and session bookkeeping.
//!
//! This module provides the `TokenStore`: the bearer token, the last-known
//! client snapshot, and the last-activity marker used for idle expiry.
//! Sessions expire after 30 days without an authenticated request.

pub mod token_store;

pub use token_store::TokenStore;
