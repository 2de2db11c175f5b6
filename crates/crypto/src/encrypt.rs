use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use thiserror::Error;

use crate::window::{NonceError, NonceWindow};

/// Explicit nonce prefix carried by every transport frame.
pub const NONCE_LEN: usize = 8;

/// Poly1305 tag length.
pub const TAG_LEN: usize = 16;

/// Bytes a transport frame adds on top of its plaintext.
pub const FRAME_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncryptError {
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Ciphertext too short")]
    CiphertextTooShort,
    #[error("Nonce space exhausted")]
    NonceExhausted,
    #[error("Out of order nonce: expected above {last}, got {got}")]
    OutOfOrder { last: u64, got: u64 },
    #[error(transparent)]
    Replay(#[from] NonceError),
}

pub(crate) fn new_cipher(key: &[u8; 32]) -> ChaCha20Poly1305 {
    ChaCha20Poly1305::new(Key::from_slice(key))
}

/// 96-bit AEAD nonce for a 64-bit counter, Noise layout.
pub(crate) fn aead_nonce(n: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&n.to_le_bytes());
    nonce
}

pub(crate) fn seal(
    cipher: &ChaCha20Poly1305,
    n: u64,
    ad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, EncryptError> {
    cipher
        .encrypt(
            Nonce::from_slice(&aead_nonce(n)),
            Payload {
                msg: plaintext,
                aad: ad,
            },
        )
        .map_err(|_| EncryptError::EncryptionFailed)
}

pub(crate) fn open(
    cipher: &ChaCha20Poly1305,
    n: u64,
    ad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, EncryptError> {
    if ciphertext.len() < TAG_LEN {
        return Err(EncryptError::CiphertextTooShort);
    }
    cipher
        .decrypt(
            Nonce::from_slice(&aead_nonce(n)),
            Payload {
                msg: ciphertext,
                aad: ad,
            },
        )
        .map_err(|_| EncryptError::DecryptionFailed)
}

/// Sending half of an established Noise channel.
///
/// Each call to [`Encryptor::encrypt`] produces `nonce (8 bytes, BE) || ciphertext`
/// using the next nonce in sequence, starting at 1.
pub struct Encryptor {
    cipher: ChaCha20Poly1305,
    nonce: u64,
}

impl Encryptor {
    pub(crate) fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: new_cipher(key),
            nonce: 0,
        }
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptError> {
        let n = self
            .nonce
            .checked_add(1)
            .ok_or(EncryptError::NonceExhausted)?;
        let ciphertext = seal(&self.cipher, n, &[], plaintext)?;
        self.nonce = n;

        let mut frame = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        frame.extend_from_slice(&n.to_be_bytes());
        frame.extend_from_slice(&ciphertext);
        Ok(frame)
    }

    /// Last nonce used.
    pub fn nonce(&self) -> u64 {
        self.nonce
    }
}

/// Receiving half of an established Noise channel.
pub struct Decryptor {
    cipher: ChaCha20Poly1305,
    last: u64,
}

impl Decryptor {
    pub(crate) fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: new_cipher(key),
            last: 0,
        }
    }

    fn split(frame: &[u8]) -> Result<(u64, &[u8]), EncryptError> {
        if frame.len() < FRAME_OVERHEAD {
            return Err(EncryptError::CiphertextTooShort);
        }
        let (nonce, ciphertext) = frame.split_at(NONCE_LEN);
        let mut n = [0u8; NONCE_LEN];
        n.copy_from_slice(nonce);
        Ok((u64::from_be_bytes(n), ciphertext))
    }

    /// Decrypt a frame from an ordered byte stream. Nonces must strictly increase.
    pub fn decrypt(&mut self, frame: &[u8]) -> Result<Vec<u8>, EncryptError> {
        let (n, ciphertext) = Self::split(frame)?;
        if n <= self.last {
            return Err(EncryptError::OutOfOrder {
                last: self.last,
                got: n,
            });
        }
        let plaintext = open(&self.cipher, n, &[], ciphertext)?;
        self.last = n;
        Ok(plaintext)
    }

    /// Decrypt a frame whose position relative to other frames is not
    /// guaranteed. Replays and nonces older than the window are rejected.
    pub fn decrypt_windowed(
        &self,
        window: &mut NonceWindow,
        frame: &[u8],
    ) -> Result<Vec<u8>, EncryptError> {
        let (n, ciphertext) = Self::split(frame)?;
        window.check(n)?;
        let plaintext = open(&self.cipher, n, &[], ciphertext)?;
        window.commit(n);
        Ok(plaintext)
    }
}
