//! wxoa: a WeChat Official Account webhook adapter.
//!
//! Receives the platform's verification handshake and inbound message
//! deliveries over HTTP, keeps the account's access token fresh, and caches
//! message, contact and credential payloads in a local SQLite store.
//!
//! See `DESIGN.md` for the architecture.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod account;
pub mod config;
pub mod credentials;
pub mod logging;
pub mod store;
pub mod types;
pub mod webhook;
