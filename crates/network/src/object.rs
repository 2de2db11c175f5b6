use std::ops::Deref;

use dmsg_core::{Addr, DmsgError, PublicKey};
use dmsg_crypto::{hash, sign_data, verify_signature, Keypair, SIGNATURE_LEN};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ObjectError;

/// `signature (64 bytes) || encoded object`, exactly as sent on the wire.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SignedObject(Vec<u8>);

impl SignedObject {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Long enough to hold a signature and a non-empty object.
    pub fn is_valid(&self) -> bool {
        self.0.len() > SIGNATURE_LEN
    }

    /// SHA-256 over the full signed bytes.
    pub fn hash(&self) -> [u8; 32] {
        hash(&self.0)
    }

    pub fn signature(&self) -> Option<[u8; SIGNATURE_LEN]> {
        self.0.get(..SIGNATURE_LEN)?.try_into().ok()
    }

    pub fn object(&self) -> &[u8] {
        self.0.get(SIGNATURE_LEN..).unwrap_or_default()
    }

    pub fn verify(&self, pk: &PublicKey) -> bool {
        match self.signature() {
            Some(sig) if self.is_valid() => verify_signature(pk, self.object(), &sig),
            _ => false,
        }
    }
}

impl std::fmt::Debug for SignedObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SignedObject({} bytes)", self.0.len())
    }
}

/// A decoded object together with the signed bytes it came from.
///
/// Keeping the raw bytes matters: responses bind to the hash of the exact
/// request bytes, and relays forward objects without re-encoding them.
#[derive(Debug, Clone)]
pub struct Signed<T> {
    value: T,
    raw: SignedObject,
}

impl<T: Serialize + DeserializeOwned> Signed<T> {
    pub fn sign(value: T, keypair: &Keypair) -> Result<Self, ObjectError> {
        let body = bincode::serialize(&value)?;
        let mut raw = Vec::with_capacity(SIGNATURE_LEN + body.len());
        raw.extend_from_slice(&sign_data(keypair, &body));
        raw.extend_from_slice(&body);
        Ok(Self {
            value,
            raw: SignedObject(raw),
        })
    }

    /// Decode without checking the signature.
    pub fn decode(raw: SignedObject) -> Result<Self, ObjectError> {
        if !raw.is_valid() {
            return Err(ObjectError::Invalid);
        }
        let value = bincode::deserialize(raw.object())?;
        Ok(Self { value, raw })
    }
}

impl<T> Signed<T> {
    pub fn raw(&self) -> &SignedObject {
        &self.raw
    }

    pub fn into_raw(self) -> SignedObject {
        self.raw
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn hash(&self) -> [u8; 32] {
        self.raw.hash()
    }
}

impl<T> Deref for Signed<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

/// Asks the destination to open a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRequest {
    /// Unix nanoseconds, strictly increasing per initiator.
    pub timestamp: i64,
    pub src: Addr,
    pub dst: Addr,
    /// First message of the stream's Noise KK handshake.
    pub noise_msg: Vec<u8>,
}

/// Destination's (or, for rejections, a relay's) answer to a [`StreamRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamResponse {
    pub req_hash: [u8; 32],
    pub accepted: bool,
    pub err_code: u8,
    /// Second Noise message. Empty for rejections.
    pub noise_msg: Vec<u8>,
}

impl StreamResponse {
    pub fn accept(req_hash: [u8; 32], noise_msg: Vec<u8>) -> Self {
        Self {
            req_hash,
            accepted: true,
            err_code: 0,
            noise_msg,
        }
    }

    pub fn reject(req_hash: [u8; 32], err: DmsgError) -> Self {
        Self {
            req_hash,
            accepted: false,
            err_code: err.code(),
            noise_msg: Vec::new(),
        }
    }

    /// Error carried by a rejection.
    pub fn error(&self) -> Option<DmsgError> {
        if self.accepted {
            return None;
        }
        Some(DmsgError::from_code(self.err_code).unwrap_or(DmsgError::RespNotAccepted))
    }
}

impl Signed<StreamRequest> {
    /// Checks addressing, freshness against `last_timestamp` and the source's
    /// signature, in that order.
    pub fn verify(&self, last_timestamp: i64) -> Result<(), DmsgError> {
        let req = &self.value;
        if req.src.pk.is_null() {
            return Err(DmsgError::ReqInvalidSrcPk);
        }
        if req.src.port == 0 {
            return Err(DmsgError::ReqInvalidSrcPort);
        }
        if req.dst.pk.is_null() {
            return Err(DmsgError::ReqInvalidDstPk);
        }
        if req.dst.port == 0 {
            return Err(DmsgError::ReqInvalidDstPort);
        }
        if req.timestamp <= last_timestamp {
            return Err(DmsgError::ReqInvalidTimestamp);
        }
        if !self.raw.verify(&req.src.pk) {
            return Err(DmsgError::ReqInvalidSig);
        }
        Ok(())
    }
}

impl Signed<StreamResponse> {
    /// Checks the response answers exactly `req` and is signed by someone
    /// allowed to answer it: the destination always, and `relay` (the relay
    /// the request went through) for rejections only.
    pub fn verify_binding(
        &self,
        req: &Signed<StreamRequest>,
        relay: Option<&PublicKey>,
    ) -> Result<(), DmsgError> {
        if self.value.req_hash != req.hash() {
            return Err(DmsgError::RespInvalidHash);
        }
        if self.raw.verify(&req.dst.pk) {
            return Ok(());
        }
        match relay {
            Some(relay) if !self.value.accepted && self.raw.verify(relay) => Ok(()),
            _ => Err(DmsgError::RespInvalidSig),
        }
    }

    /// [`Self::verify_binding`], then turns a rejection into its error.
    pub fn verify(
        &self,
        req: &Signed<StreamRequest>,
        relay: Option<&PublicKey>,
    ) -> Result<(), DmsgError> {
        self.verify_binding(req, relay)?;
        match self.value.error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
