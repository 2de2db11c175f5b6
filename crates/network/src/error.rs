use std::io;

use dmsg_core::DmsgError;
use dmsg_crypto::{EncryptError, NoiseError};
use thiserror::Error;

use crate::mux::MuxError;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortError {
    #[error("port {0} already occupied")]
    Occupied(u16),
    #[error("port {0} has no parent reservation")]
    NoParent(u16),
    #[error("sub-port {1} of port {0} already occupied")]
    ChildOccupied(u16, u16),
    #[error("no free ephemeral ports")]
    Exhausted,
    #[error("ephemeral port search cancelled")]
    Cancelled,
}

impl PortError {
    /// Wire error for conflicts with an existing reservation. Exhaustion
    /// and cancellation are local conditions with no wire code.
    pub fn protocol(&self) -> Option<DmsgError> {
        match self {
            PortError::Occupied(_) | PortError::ChildOccupied(..) => Some(DmsgError::PortOccupied),
            PortError::NoParent(_) | PortError::Exhausted | PortError::Cancelled => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum ObjectError {
    #[error("signed object invalid")]
    Invalid,
    #[error("object encoding failed: {0}")]
    Encoding(#[from] bincode::Error),
}

/// Failure while establishing the Noise channel of a session or stream.
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("handshake timed out")]
    Timeout,
    #[error("handshake io failed: {0}")]
    Io(#[from] io::Error),
    #[error("noise handshake failed: {0}")]
    Noise(#[from] NoiseError),
    #[error(transparent)]
    Protocol(#[from] DmsgError),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Protocol(#[from] DmsgError),

    #[error("session io failed: {0}")]
    Io(#[from] io::Error),

    #[error("session frame rejected: {0}")]
    Frame(#[from] EncryptError),

    #[error("object of {0} bytes exceeds the frame limit")]
    ObjectTooLarge(usize),

    #[error("expected an object, got a keep-alive probe")]
    UnexpectedProbe,

    #[error(transparent)]
    Mux(#[from] MuxError),

    #[error(transparent)]
    Object(#[from] ObjectError),
}

impl SessionError {
    /// The session, or the entity owning it, is gone.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            SessionError::Protocol(DmsgError::SessionClosed | DmsgError::EntityClosed)
                | SessionError::Mux(MuxError::Shutdown)
        )
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
