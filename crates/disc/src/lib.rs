//! Dmsg Discovery
//!
//! Signed entries advertising relays and clients, the [`DiscoveryClient`]
//! trait entities use to publish and look them up, an HTTP client for the
//! discovery service and an in-memory implementation for tests and
//! single-process deployments.

mod client;
mod entry;
mod error;
mod http;
mod memory;

pub use client::*;
pub use entry::*;
pub use error::*;
pub use http::*;
pub use memory::*;
