//! Dmsg Relay
//!
//! The relay ("dmsg server") entity. Clients keep sessions to relays and
//! publish which relays they can be reached through; a relay forwards stream
//! requests between two of its sessions and then splices the two legs
//! together. Stream payloads are end-to-end encrypted between the clients,
//! so a relay only ever sees ciphertext.

mod metrics;
mod server;
mod session;

pub use metrics::{CounterMetrics, Delta, MetricsSnapshot, NoopMetrics, ServerMetrics};
pub use server::Server;
pub use session::ServerSession;

use dmsg_core::DmsgError;
use dmsg_disc::DiscError;
use dmsg_network::{ObjectError, RetryError, SessionError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Invalid object: {0}")]
    Object(#[from] ObjectError),

    #[error(transparent)]
    Protocol(#[from] DmsgError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscError),

    #[error("Failed to publish server entry: {0}")]
    Publish(#[from] RetryError<DiscError>),

    #[error("Stream handshake timed out")]
    Timeout,

    #[error("Server is already serving")]
    AlreadyServing,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Code reported to the initiator when forwarding fails with this error.
    pub fn code(&self) -> DmsgError {
        match self {
            RelayError::Protocol(e) | RelayError::Session(SessionError::Protocol(e)) => *e,
            _ => DmsgError::ReqNoNextSession,
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
