//! Noise handshakes
//!
//! Sessions use `Noise_IK_25519_ChaChaPoly_SHA256`: the initiator knows the
//! relay's key up front and reveals its own in the first message. Streams use
//! `Noise_KK_25519_ChaChaPoly_SHA256`, since both ends already know each
//! other from the signed stream request.
//!
//! The handshake itself runs on `snow`. Static keys are the X25519 forms of
//! the entities' Ed25519 identities; the split keys feed our own framed
//! [`Encryptor`]/[`Decryptor`] pair.

use dmsg_core::PublicKey;
use snow::params::NoiseParams;
use snow::{Builder, HandshakeState};
use thiserror::Error;

use crate::encrypt::{Decryptor, Encryptor};
use crate::keys::{dh_public_key, KeyError, Keypair};

const DH_LEN: usize = 32;
const PROLOGUE: &[u8] = b"dmsg";

/// Largest Noise message.
const MAX_MESSAGE_LEN: usize = 65535;

#[derive(Error, Debug)]
pub enum NoiseError {
    #[error("Handshake message too short")]
    MessageTooShort,
    #[error("Handshake message out of turn")]
    OutOfTurn,
    #[error("Handshake not finished")]
    Incomplete,
    #[error("Remote static key required for this pattern")]
    MissingRemoteKey,
    #[error("Remote static key does not belong to the claimed identity")]
    IdentityMismatch,
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("Noise protocol error: {0}")]
    Protocol(#[from] snow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePattern {
    /// Initiator knows the responder's static key.
    IK,
    /// Both sides know each other's static key.
    KK,
}

impl HandshakePattern {
    fn protocol_name(&self) -> &'static str {
        match self {
            HandshakePattern::IK => "Noise_IK_25519_ChaChaPoly_SHA256",
            HandshakePattern::KK => "Noise_KK_25519_ChaChaPoly_SHA256",
        }
    }
}

/// One side of a two-message Noise handshake.
///
/// Call [`Noise::write_message`] and [`Noise::read_message`] alternately
/// (initiator writes first), then [`Noise::into_transport`].
pub struct Noise {
    pattern: HandshakePattern,
    local_pk: PublicKey,
    remote_pk: Option<PublicKey>,
    state: HandshakeState,
    /// Whether the next message we write is the IK first message, which
    /// carries our identity.
    send_identity: bool,
}

impl Noise {
    /// `remote` is the peer's identity. It is required for every pattern
    /// except on the responding side of IK, which learns it from the first
    /// message.
    pub fn new(
        pattern: HandshakePattern,
        local: &Keypair,
        remote: Option<PublicKey>,
        initiator: bool,
    ) -> Result<Self, NoiseError> {
        let rs = remote.as_ref().map(dh_public_key).transpose()?;
        let needs_remote = initiator || pattern == HandshakePattern::KK;
        if needs_remote && rs.is_none() {
            return Err(NoiseError::MissingRemoteKey);
        }

        let s = local.dh_secret().to_bytes();
        let params: NoiseParams = pattern.protocol_name().parse()?;
        let mut builder = Builder::new(params).local_private_key(&s).prologue(PROLOGUE);
        if let Some(rs) = &rs {
            builder = builder.remote_public_key(rs.as_bytes());
        }
        let state = if initiator {
            builder.build_initiator()?
        } else {
            builder.build_responder()?
        };

        Ok(Self {
            pattern,
            local_pk: local.public_key(),
            remote_pk: remote,
            state,
            send_identity: initiator && pattern == HandshakePattern::IK,
        })
    }

    pub fn pattern(&self) -> HandshakePattern {
        self.pattern
    }

    /// Remote identity, once known.
    pub fn remote_pk(&self) -> Option<PublicKey> {
        self.remote_pk
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_handshake_finished()
    }

    /// Produce the next handshake message carrying `payload`.
    pub fn write_message(&mut self, payload: &[u8]) -> Result<Vec<u8>, NoiseError> {
        if self.is_finished() || !self.state.is_my_turn() {
            return Err(NoiseError::OutOfTurn);
        }
        let mut body = Vec::with_capacity(DH_LEN + payload.len());
        if self.send_identity {
            body.extend_from_slice(self.local_pk.as_bytes());
        }
        body.extend_from_slice(payload);

        let mut out = vec![0u8; MAX_MESSAGE_LEN];
        let len = self.state.write_message(&body, &mut out)?;
        out.truncate(len);
        self.send_identity = false;
        Ok(out)
    }

    /// Consume the peer's handshake message and return its payload.
    pub fn read_message(&mut self, msg: &[u8]) -> Result<Vec<u8>, NoiseError> {
        if self.is_finished() || self.state.is_my_turn() {
            return Err(NoiseError::OutOfTurn);
        }
        if msg.len() < DH_LEN {
            return Err(NoiseError::MessageTooShort);
        }
        let first_of_ik = self.pattern == HandshakePattern::IK && !self.state.is_initiator();

        let mut payload = vec![0u8; msg.len()];
        let len = self.state.read_message(msg, &mut payload)?;
        payload.truncate(len);

        if first_of_ik {
            return self.bind_identity(payload);
        }
        Ok(payload)
    }

    /// Split the identity prefix off an IK first-message payload and check it
    /// converts to the static key the initiator proved possession of.
    fn bind_identity(&mut self, payload: Vec<u8>) -> Result<Vec<u8>, NoiseError> {
        if payload.len() < DH_LEN {
            return Err(NoiseError::MessageTooShort);
        }
        let claimed = PublicKey::from_slice(&payload[..DH_LEN])
            .map_err(|_| NoiseError::MessageTooShort)?;
        let rs = self
            .state
            .get_remote_static()
            .ok_or(NoiseError::MissingRemoteKey)?;
        if dh_public_key(&claimed)?.as_bytes().as_slice() != rs {
            return Err(NoiseError::IdentityMismatch);
        }
        self.remote_pk = Some(claimed);
        Ok(payload[DH_LEN..].to_vec())
    }

    /// Finish the handshake and derive the transport ciphers.
    pub fn into_transport(mut self) -> Result<Transport, NoiseError> {
        if !self.is_finished() {
            return Err(NoiseError::Incomplete);
        }
        let remote_pk = self.remote_pk.ok_or(NoiseError::MissingRemoteKey)?;
        let mut handshake_hash = [0u8; 32];
        handshake_hash.copy_from_slice(&self.state.get_handshake_hash()[..32]);

        let (k1, k2) = self.state.dangerously_get_raw_split();
        let (send, recv) = if self.state.is_initiator() {
            (k1, k2)
        } else {
            (k2, k1)
        };
        Ok(Transport {
            encryptor: Encryptor::new(&send),
            decryptor: Decryptor::new(&recv),
            remote_pk,
            handshake_hash,
        })
    }
}

/// Ciphers of a completed handshake.
pub struct Transport {
    pub encryptor: Encryptor,
    pub decryptor: Decryptor,
    pub remote_pk: PublicKey,
    pub handshake_hash: [u8; 32],
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake(
        pattern: HandshakePattern,
        a: &Keypair,
        b: &Keypair,
    ) -> Result<(Transport, Transport), NoiseError> {
        let responder_remote = match pattern {
            HandshakePattern::IK => None,
            HandshakePattern::KK => Some(a.public_key()),
        };
        let mut init = Noise::new(pattern, a, Some(b.public_key()), true)?;
        let mut resp = Noise::new(pattern, b, responder_remote, false)?;

        let m1 = init.write_message(b"first")?;
        assert_eq!(resp.read_message(&m1)?, b"first");
        let m2 = resp.write_message(b"second")?;
        assert_eq!(init.read_message(&m2)?, b"second");

        Ok((init.into_transport()?, resp.into_transport()?))
    }

    #[test]
    fn test_ik_handshake_learns_initiator_identity() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let (ta, tb) = handshake(HandshakePattern::IK, &a, &b).unwrap();

        assert_eq!(ta.remote_pk, b.public_key());
        assert_eq!(tb.remote_pk, a.public_key());
        assert_eq!(ta.handshake_hash, tb.handshake_hash);
    }

    #[test]
    fn test_kk_transport_roundtrip() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let (mut ta, mut tb) = handshake(HandshakePattern::KK, &a, &b).unwrap();

        let frame = ta.encryptor.encrypt(b"ping").unwrap();
        assert_eq!(tb.decryptor.decrypt(&frame).unwrap(), b"ping");
        let frame = tb.encryptor.encrypt(b"pong").unwrap();
        assert_eq!(ta.decryptor.decrypt(&frame).unwrap(), b"pong");
    }

    #[test]
    fn test_ik_wrong_responder_key_fails() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let c = Keypair::generate();

        let mut init = Noise::new(HandshakePattern::IK, &a, Some(c.public_key()), true).unwrap();
        let mut resp = Noise::new(HandshakePattern::IK, &b, None, false).unwrap();
        let m1 = init.write_message(&[]).unwrap();
        assert!(matches!(
            resp.read_message(&m1),
            Err(NoiseError::Protocol(snow::Error::Decrypt))
        ));
    }

    #[test]
    fn test_ik_forged_identity_fails() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let mallory = Keypair::generate();

        // Mallory proves her own static key but claims to be `a`.
        let mut init = Noise::new(HandshakePattern::IK, &mallory, Some(b.public_key()), true).unwrap();
        init.local_pk = a.public_key();
        let mut resp = Noise::new(HandshakePattern::IK, &b, None, false).unwrap();
        let m1 = init.write_message(&[]).unwrap();
        assert!(matches!(resp.read_message(&m1), Err(NoiseError::IdentityMismatch)));
        assert!(resp.remote_pk().is_none());
    }

    #[test]
    fn test_kk_wrong_initiator_key_fails() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let mallory = Keypair::generate();

        let mut init = Noise::new(HandshakePattern::KK, &mallory, Some(b.public_key()), true).unwrap();
        let mut resp = Noise::new(HandshakePattern::KK, &b, Some(a.public_key()), false).unwrap();
        let m1 = init.write_message(&[]).unwrap();
        assert!(resp.read_message(&m1).is_err());
    }

    #[test]
    fn test_missing_remote_key() {
        let a = Keypair::generate();
        assert!(matches!(
            Noise::new(HandshakePattern::IK, &a, None, true),
            Err(NoiseError::MissingRemoteKey)
        ));
        assert!(matches!(
            Noise::new(HandshakePattern::KK, &a, None, false),
            Err(NoiseError::MissingRemoteKey)
        ));
    }

    #[test]
    fn test_out_of_turn() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let mut init = Noise::new(HandshakePattern::KK, &a, Some(b.public_key()), true).unwrap();
        assert!(matches!(init.read_message(&[0u8; 64]), Err(NoiseError::OutOfTurn)));

        let mut resp = Noise::new(HandshakePattern::KK, &b, Some(a.public_key()), false).unwrap();
        assert!(matches!(resp.write_message(&[]), Err(NoiseError::OutOfTurn)));
        assert!(matches!(resp.into_transport(), Err(NoiseError::Incomplete)));
    }

    #[test]
    fn test_truncated_message() {
        let b = Keypair::generate();
        let mut resp = Noise::new(HandshakePattern::IK, &b, None, false).unwrap();
        assert!(matches!(resp.read_message(&[0u8; 16]), Err(NoiseError::MessageTooShort)));
        let mut resp = Noise::new(HandshakePattern::IK, &b, None, false).unwrap();
        assert!(matches!(resp.read_message(&[0u8; 40]), Err(NoiseError::Protocol(_))));
    }
}
