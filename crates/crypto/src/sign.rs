use dmsg_core::PublicKey;
use ed25519_dalek::{Signature, Signer, Verifier, VerifyingKey};

use crate::keys::Keypair;

/// Length of a detached Ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;

/// Sign data with an entity keypair
pub fn sign_data(keypair: &Keypair, data: &[u8]) -> [u8; SIGNATURE_LEN] {
    let signature: Signature = keypair.signing_key.sign(data);
    signature.to_bytes()
}

/// Verify a signature
pub fn verify_signature(pubkey: &PublicKey, data: &[u8], signature: &[u8; SIGNATURE_LEN]) -> bool {
    let verifying_key = match VerifyingKey::from_bytes(pubkey.as_bytes()) {
        Ok(vk) => vk,
        Err(_) => return false,
    };

    let signature = Signature::from_bytes(signature);

    verifying_key.verify(data, &signature).is_ok()
}
