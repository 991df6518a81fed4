//! Prefill Orchestrator Library
//!
//! Runs one short-lived prefill worker container per user and drives it
//! through a file mailbox: login with encrypted credentials, prefill runs
//! with progress history, and cleanup of whatever a crash left behind.

pub mod auth;
pub mod config;
pub mod container;
pub mod crypto;
pub mod db;
pub mod error;
pub mod events;
pub mod hub;
pub mod mailbox;
pub mod progress;
pub mod session;
pub mod store;
pub mod watcher;
