use dmsg_core::DmsgError;
use dmsg_crypto::KeyError;
use thiserror::Error;

/// Reasons the discovery service rejects an entry.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    #[error("new entry has non-zero sequence")]
    NonZeroSequence,
    #[error("entry has no signature")]
    NoSignature,
    #[error("entry has no version")]
    NoVersion,
    #[error("entry Keys is nil")]
    NilKeys,
    #[error("entry has neither client or server field")]
    NoClientOrServer,
    #[error("sequence field of new entry is not sequence of old entry + 1")]
    WrongSequence,
    #[error("advertised entry timestamp is not greater than previous")]
    WrongTime,
    #[error("advertised entry has outdated timestamp")]
    OutdatedTime,
    #[error("server address cannot be empty")]
    EmptyServerAddress,
}

impl ValidationError {
    const ALL: [ValidationError; 9] = [
        ValidationError::NonZeroSequence,
        ValidationError::NoSignature,
        ValidationError::NoVersion,
        ValidationError::NilKeys,
        ValidationError::NoClientOrServer,
        ValidationError::WrongSequence,
        ValidationError::WrongTime,
        ValidationError::OutdatedTime,
        ValidationError::EmptyServerAddress,
    ];
}

#[derive(Error, Debug)]
pub enum DiscError {
    #[error("entry of public key is not found")]
    KeyNotFound,

    #[error("no delegated dmsg servers available for remote")]
    NoAvailableServers,

    #[error("something unexpected happened")]
    Unexpected,

    #[error("invalid signature")]
    Unauthorized,

    #[error("error bad input")]
    BadInput,

    #[error("entry validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Protocol(#[from] DmsgError),

    #[error("key error: {0}")]
    Key(#[from] KeyError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DiscError {
    /// Map a discovery service error message back to its error.
    pub fn from_message(message: &str) -> Self {
        let simple = [
            DiscError::KeyNotFound,
            DiscError::NoAvailableServers,
            DiscError::Unauthorized,
            DiscError::BadInput,
        ];
        if let Some(err) = simple.into_iter().find(|e| e.to_string() == message) {
            return err;
        }
        ValidationError::ALL
            .into_iter()
            .map(DiscError::Validation)
            .find(|e| e.to_string() == message)
            .unwrap_or(DiscError::Unexpected)
    }

    /// Message the discovery service uses for this error.
    pub fn message(&self) -> String {
        self.to_string()
    }
}

pub type Result<T> = std::result::Result<T, DiscError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_message_roundtrips_known_errors() {
        for msg in [
            "entry of public key is not found",
            "invalid signature",
            "entry validation error: sequence field of new entry is not sequence of old entry + 1",
            "entry validation error: advertised entry has outdated timestamp",
        ] {
            assert_eq!(DiscError::from_message(msg).to_string(), msg);
        }
        assert!(matches!(
            DiscError::from_message("entry validation error: new entry has non-zero sequence"),
            DiscError::Validation(ValidationError::NonZeroSequence)
        ));
    }

    #[test]
    fn test_from_message_unknown() {
        assert!(matches!(
            DiscError::from_message("database on fire"),
            DiscError::Unexpected
        ));
    }
}
