//! Dmsg Core Types
//!
//! This crate defines the addressing types, protocol error codes and
//! configuration shared by every dmsg entity.

mod clock;
mod config;
mod error;
mod types;

pub use clock::*;
pub use config::*;
pub use error::*;
pub use types::*;
