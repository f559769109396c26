//! Remote hub mirroring for Membase.
//!
//! - [`HttpHubClient`] speaks the hub's HTTP endpoints.
//! - [`SyncQueue`] drains committed records to any [`HubTransport`] from a
//!   single background worker.
//!
//! [`HubTransport`]: membase_core::HubTransport

pub mod client;
pub mod queue;

pub use client::HttpHubClient;
pub use queue::{SyncItem, SyncOutcome, SyncQueue, SyncStats};
