use thiserror::Error;

/// Protocol-level errors that can cross the wire.
///
/// Every variant has a stable numeric code carried in the `err_code` field
/// of a rejected stream response. Code 0 is reserved for "unknown".
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DmsgError {
    #[error("local entity closed")]
    EntityClosed,

    #[error("session closed")]
    SessionClosed,

    #[error("cannot connect to delegated servers")]
    CannotConnectToDelegated,

    #[error("session handshake message contains extra bytes")]
    SessionHandshakeExtraBytes,

    #[error("discovery entry not found")]
    DiscEntryNotFound,

    #[error("discovery entry is not of server")]
    DiscEntryIsNotServer,

    #[error("discovery entry is not of client")]
    DiscEntryIsNotClient,

    #[error("discovery client entry has no delegated servers")]
    DiscEntryHasNoDelegated,

    #[error("request has invalid signature")]
    ReqInvalidSig,

    #[error("request has invalid timestamp")]
    ReqInvalidTimestamp,

    #[error("request has invalid source public key")]
    ReqInvalidSrcPk,

    #[error("request has invalid destination public key")]
    ReqInvalidDstPk,

    #[error("request has invalid source port")]
    ReqInvalidSrcPort,

    #[error("request has invalid destination port")]
    ReqInvalidDstPort,

    #[error("request has no associated listener")]
    ReqNoListener,

    #[error("request has no next session")]
    ReqNoNextSession,

    #[error("session stream limit reached")]
    ReqStreamLimit,

    #[error("response has invalid signature")]
    RespInvalidSig,

    #[error("response has invalid request hash")]
    RespInvalidHash,

    #[error("response is not accepted")]
    RespNotAccepted,

    #[error("port already occupied")]
    PortOccupied,

    #[error("listener accept chan maxed")]
    AcceptChanMaxed,
}

impl DmsgError {
    pub const ALL: [DmsgError; 22] = [
        DmsgError::EntityClosed,
        DmsgError::SessionClosed,
        DmsgError::CannotConnectToDelegated,
        DmsgError::SessionHandshakeExtraBytes,
        DmsgError::DiscEntryNotFound,
        DmsgError::DiscEntryIsNotServer,
        DmsgError::DiscEntryIsNotClient,
        DmsgError::DiscEntryHasNoDelegated,
        DmsgError::ReqInvalidSig,
        DmsgError::ReqInvalidTimestamp,
        DmsgError::ReqInvalidSrcPk,
        DmsgError::ReqInvalidDstPk,
        DmsgError::ReqInvalidSrcPort,
        DmsgError::ReqInvalidDstPort,
        DmsgError::ReqNoListener,
        DmsgError::ReqNoNextSession,
        DmsgError::ReqStreamLimit,
        DmsgError::RespInvalidSig,
        DmsgError::RespInvalidHash,
        DmsgError::RespNotAccepted,
        DmsgError::PortOccupied,
        DmsgError::AcceptChanMaxed,
    ];

    /// Stable wire code.
    pub const fn code(&self) -> u8 {
        match self {
            DmsgError::EntityClosed => 10,
            DmsgError::SessionClosed => 11,
            DmsgError::CannotConnectToDelegated => 12,
            DmsgError::SessionHandshakeExtraBytes => 13,
            DmsgError::DiscEntryNotFound => 30,
            DmsgError::DiscEntryIsNotServer => 31,
            DmsgError::DiscEntryIsNotClient => 32,
            DmsgError::DiscEntryHasNoDelegated => 33,
            DmsgError::ReqInvalidSig => 50,
            DmsgError::ReqInvalidTimestamp => 51,
            DmsgError::ReqInvalidSrcPk => 52,
            DmsgError::ReqInvalidDstPk => 53,
            DmsgError::ReqInvalidSrcPort => 54,
            DmsgError::ReqInvalidDstPort => 55,
            DmsgError::ReqNoListener => 56,
            DmsgError::ReqNoNextSession => 57,
            DmsgError::ReqStreamLimit => 58,
            DmsgError::RespInvalidSig => 60,
            DmsgError::RespInvalidHash => 61,
            DmsgError::RespNotAccepted => 62,
            DmsgError::PortOccupied => 80,
            DmsgError::AcceptChanMaxed => 81,
        }
    }

    /// Looks up the error for a wire code. Returns `None` for 0 and for
    /// codes this version does not know.
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|e| e.code() == code)
    }

    /// Whether the error was reported by the remote end of a stream request
    /// rather than produced locally.
    pub fn is_request_error(&self) -> bool {
        (50..60).contains(&self.code())
    }
}

pub type Result<T> = std::result::Result<T, DmsgError>;

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_codes_are_unique_and_nonzero() {
        let mut seen = HashSet::new();
        for err in DmsgError::ALL {
            assert_ne!(err.code(), 0, "{err} uses the reserved code");
            assert!(seen.insert(err.code()), "duplicate code {}", err.code());
        }
    }

    #[test]
    fn test_from_code() {
        for err in DmsgError::ALL {
            assert_eq!(DmsgError::from_code(err.code()), Some(err));
        }
        assert_eq!(DmsgError::from_code(0), None);
        assert_eq!(DmsgError::from_code(255), None);
    }

    #[test]
    fn test_known_codes() {
        assert_eq!(DmsgError::ReqNoListener.code(), 56);
        assert_eq!(DmsgError::ReqNoNextSession.code(), 57);
        assert_eq!(DmsgError::PortOccupied.code(), 80);
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            DmsgError::ReqNoNextSession.to_string(),
            "request has no next session"
        );
        assert_eq!(
            DmsgError::AcceptChanMaxed.to_string(),
            "listener accept chan maxed"
        );
    }

    #[test]
    fn test_is_request_error() {
        assert!(DmsgError::ReqInvalidSig.is_request_error());
        assert!(DmsgError::ReqNoNextSession.is_request_error());
        assert!(!DmsgError::RespInvalidSig.is_request_error());
        assert!(!DmsgError::EntityClosed.is_request_error());
    }
}
