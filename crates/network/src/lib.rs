//! Dmsg Network
//!
//! Building blocks shared by clients and relay servers:
//!
//! - [`Porter`] port reservations with RAII release
//! - signed stream request/response objects
//! - length-prefixed Noise framing over byte streams
//! - the yamux driver behind every session
//! - [`SessionCommon`], the encrypted, multiplexed link to one peer
//! - [`EntityCommon`], the session table and discovery entry upkeep
//! - retry/backoff helpers and request timestamp tracking

mod entity;
mod error;
mod frame;
mod lifecycle;
mod mux;
mod object;
mod porter;
mod retry;
mod session;
mod tracker;

pub use entity::*;
pub use error::*;
pub use frame::*;
pub use lifecycle::*;
pub use mux::*;
pub use object::*;
pub use porter::*;
pub use retry::*;
pub use session::*;
pub use tracker::*;
