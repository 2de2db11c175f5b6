use std::fmt;
use std::time::Duration;

use dmsg_core::{unix_nanos, PublicKey};
use dmsg_crypto::{sign_data, verify_signature, Keypair, SIGNATURE_LEN};
use serde::{Deserialize, Serialize};

use crate::error::{DiscError, Result, ValidationError};

/// Entry format version.
pub const ENTRY_VERSION: &str = "0.0.1";

/// How old an entry's timestamp may be when posted.
pub const ENTRY_LIFETIME: Duration = Duration::from_secs(60);

/// Tolerated clock skew into the future.
pub const ALLOWED_TIMESTAMP_ERROR: Duration = Duration::from_millis(100);

/// Client half of an entry: the relays a client can be reached through.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub delegated_servers: Vec<PublicKey>,
}

/// Server half of an entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Publicly reachable TCP address of the relay.
    pub address: String,
    /// Sessions the relay can still accept.
    #[serde(rename = "availableSessions")]
    pub available_sessions: usize,
}

/// A discovery record, signed by the entity it describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub version: String,
    pub sequence: u64,
    /// Unix nanoseconds of the current iteration.
    pub timestamp: i64,
    #[serde(rename = "static")]
    pub static_pk: PublicKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerInfo>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature: String,
}

impl Entry {
    /// Unsigned client entry.
    pub fn new_client(pk: PublicKey, sequence: u64, delegated_servers: Vec<PublicKey>) -> Self {
        Self {
            version: ENTRY_VERSION.to_string(),
            sequence,
            timestamp: unix_nanos(),
            static_pk: pk,
            client: Some(ClientInfo { delegated_servers }),
            server: None,
            signature: String::new(),
        }
    }

    /// Unsigned server entry.
    pub fn new_server(pk: PublicKey, sequence: u64, address: &str, available_sessions: usize) -> Self {
        Self {
            version: ENTRY_VERSION.to_string(),
            sequence,
            timestamp: unix_nanos(),
            static_pk: pk,
            client: None,
            server: Some(ServerInfo {
                address: address.to_string(),
                available_sessions,
            }),
            signature: String::new(),
        }
    }

    fn signing_bytes(&self) -> Result<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.signature.clear();
        Ok(serde_json::to_vec(&unsigned)?)
    }

    /// Sign the JSON encoding of the entry (with the signature field cleared).
    pub fn sign(&mut self, keypair: &Keypair) -> Result<()> {
        self.signature.clear();
        let payload = self.signing_bytes()?;
        self.signature = hex::encode(sign_data(keypair, &payload));
        Ok(())
    }

    pub fn verify_signature(&self) -> Result<()> {
        let raw = hex::decode(&self.signature).map_err(|_| DiscError::Unauthorized)?;
        let signature: [u8; SIGNATURE_LEN] =
            raw.try_into().map_err(|_| DiscError::Unauthorized)?;
        let payload = self.signing_bytes()?;
        if verify_signature(&self.static_pk, &payload, &signature) {
            Ok(())
        } else {
            Err(DiscError::Unauthorized)
        }
    }

    /// Structural and freshness checks the discovery service applies on post.
    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        if self.version.is_empty() {
            return Err(ValidationError::NoVersion);
        }
        if self.signature.is_empty() {
            return Err(ValidationError::NoSignature);
        }
        if self.static_pk.is_null() {
            return Err(ValidationError::NilKeys);
        }
        if self.client.is_none() && self.server.is_none() {
            return Err(ValidationError::NoClientOrServer);
        }
        if self.server.as_ref().is_some_and(|s| s.address.is_empty()) {
            return Err(ValidationError::EmptyServerAddress);
        }

        let now = unix_nanos();
        let earliest = now.saturating_sub(ENTRY_LIFETIME.as_nanos() as i64);
        let latest = now.saturating_add(ALLOWED_TIMESTAMP_ERROR.as_nanos() as i64);
        if self.timestamp < earliest || self.timestamp > latest {
            return Err(ValidationError::OutdatedTime);
        }
        Ok(())
    }

    /// Checks `next` is a valid successor of this entry.
    pub fn validate_iteration(&self, next: &Entry) -> std::result::Result<(), ValidationError> {
        if next.sequence <= self.sequence {
            return Err(ValidationError::WrongSequence);
        }
        if next.timestamp < self.timestamp {
            return Err(ValidationError::WrongTime);
        }
        Ok(())
    }

    pub fn is_server(&self) -> bool {
        self.server.is_some()
    }

    pub fn is_client(&self) -> bool {
        self.client.is_some()
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\tversion: {}", self.version)?;
        writeln!(f, "\tsequence: {}", self.sequence)?;
        writeln!(f, "\tregistered at: {}", self.timestamp)?;
        writeln!(f, "\tstatic public key: {}", self.static_pk)?;
        writeln!(f, "\tsignature: {}", self.signature)?;
        if let Some(client) = &self.client {
            writeln!(f, "\tentry is registered as client. Related info:")?;
            writeln!(f, "\t\tdelegated servers:")?;
            for pk in &client.delegated_servers {
                writeln!(f, "\t\t\t{pk}")?;
            }
        }
        if let Some(server) = &self.server {
            writeln!(f, "\tentry is registered as server. Related info:")?;
            writeln!(f, "\t\taddress: {}", server.address)?;
            writeln!(f, "\t\tavailable sessions: {}", server.available_sessions)?;
        }
        Ok(())
    }
}
