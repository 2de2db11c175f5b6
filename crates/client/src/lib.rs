//! Dmsg Client
//!
//! A client entity keeps sessions with one or more relays, advertises them
//! as its delegated servers and opens end-to-end encrypted [`Stream`]s to
//! other clients through those relays.
//!
//! ```text
//! A ──session──> relay <──session── B
//!   \___________ stream ___________/
//!     (Noise KK, opaque to the relay)
//! ```

mod callbacks;
mod client;
mod listener;
mod session;
mod stream;

pub use callbacks::{ClientCallbacks, NoopCallbacks};
pub use client::Client;
pub use listener::{Listener, ListenerRef};
pub use session::ClientSession;
pub use stream::{PortEntry, Stream, StreamMeta};

use dmsg_core::{DmsgError, PublicKey};
use dmsg_crypto::NoiseError;
use dmsg_disc::DiscError;
use dmsg_network::{HandshakeError, ObjectError, PortError, RetryError, SessionError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Protocol(#[from] DmsgError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Session handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Invalid object: {0}")]
    Object(#[from] ObjectError),

    #[error("Stream handshake failed: {0}")]
    Noise(#[from] NoiseError),

    #[error("Port reservation failed: {0}")]
    Port(#[from] PortError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscError),

    #[error("Discovery lookup failed: {0}")]
    Lookup(#[from] RetryError<DiscError>),

    #[error("Session dial vetoed: {0}")]
    DialRejected(String),

    #[error("Session with {0} already exists")]
    SessionExists(PublicKey),

    #[error("Stream handshake timed out")]
    Timeout,

    #[error("io: read/write on closed pipe")]
    ClosedPipe,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Protocol error carried by this failure, if any.
    pub fn protocol(&self) -> Option<DmsgError> {
        match self {
            ClientError::Protocol(e) => Some(*e),
            ClientError::Session(SessionError::Protocol(e)) => Some(*e),
            ClientError::Handshake(HandshakeError::Protocol(e)) => Some(*e),
            ClientError::Port(e) => e.protocol(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
