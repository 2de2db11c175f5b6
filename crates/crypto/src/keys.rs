use dmsg_core::PublicKey;
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid secret key length")]
    InvalidSecretKey,
}

/// Long-term entity identity (Ed25519).
///
/// The same key doubles as the X25519 static key for Noise handshakes: the
/// secret scalar is derived from the Ed25519 seed and the public half is the
/// Montgomery form of the verifying key, so peers only ever exchange the
/// Ed25519 public key.
pub struct Keypair {
    pub signing_key: SigningKey,
    pub verifying_key: VerifyingKey,
}

impl Clone for Keypair {
    fn clone(&self) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&self.signing_key.to_bytes()),
            verifying_key: self.verifying_key,
        }
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

impl Keypair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Create from raw secret key bytes
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(secret);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    pub fn from_secret_slice(secret: &[u8]) -> Result<Self, KeyError> {
        let secret: [u8; 32] = secret.try_into().map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self::from_secret_bytes(&secret))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_bytes(self.verifying_key.to_bytes())
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// X25519 secret matching [`dh_public_key`] of this keypair's public key.
    pub(crate) fn dh_secret(&self) -> StaticSecret {
        let digest = Sha512::digest(self.signing_key.to_bytes());
        let mut scalar = [0u8; 32];
        scalar.copy_from_slice(&digest[..32]);
        StaticSecret::from(scalar)
    }
}

/// Convert an entity's Ed25519 public key into its X25519 static key.
pub fn dh_public_key(pk: &PublicKey) -> Result<X25519PublicKey, KeyError> {
    let verifying_key =
        VerifyingKey::from_bytes(pk.as_bytes()).map_err(|_| KeyError::InvalidPublicKey)?;
    Ok(X25519PublicKey::from(
        verifying_key.to_montgomery().to_bytes(),
    ))
}

/// Hash data using SHA-256
pub fn hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}
