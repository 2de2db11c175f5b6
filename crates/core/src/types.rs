use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Length of an encoded public key in bytes.
pub const PUBLIC_KEY_LEN: usize = 32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid hex encoding: {0}")]
    Hex(String),
    #[error("Invalid public key length: expected {PUBLIC_KEY_LEN}, got {0}")]
    KeyLength(usize),
    #[error("Address is missing the ':' port separator")]
    MissingPort,
    #[error("Invalid port: {0}")]
    Port(String),
}

/// Ed25519 public key identifying an entity on the overlay.
///
/// The all-zero key is the "null" key and never identifies a real entity.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    pub const fn from_bytes(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, ParseError> {
        let arr: [u8; PUBLIC_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| ParseError::KeyLength(bytes.len()))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; PUBLIC_KEY_LEN] {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == [0u8; PUBLIC_KEY_LEN]
    }

    /// First 8 hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self)
    }
}

impl FromStr for PublicKey {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| ParseError::Hex(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

impl From<[u8; PUBLIC_KEY_LEN]> for PublicKey {
    fn from(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An overlay address: the owning entity's public key plus a 16-bit port.
///
/// Port 0 means "unspecified" and is never a valid listening or stream port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Addr {
    pub pk: PublicKey,
    pub port: u16,
}

impl Addr {
    pub const fn new(pk: PublicKey, port: u16) -> Self {
        Self { pk, port }
    }

    /// Both the key and the port are set.
    pub fn is_complete(&self) -> bool {
        !self.pk.is_null() && self.port != 0
    }

    pub fn short_string(&self) -> String {
        match self.port {
            0 => format!("{}:~", self.pk.short()),
            port => format!("{}:{}", self.pk.short(), port),
        }
    }

    /// Network name used when an `Addr` stands in for a socket address.
    pub fn network(&self) -> &'static str {
        "dmsg"
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            0 => write!(f, "{}:~", self.pk),
            port => write!(f, "{}:{}", self.pk, port),
        }
    }
}

impl FromStr for Addr {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (pk, port) = s.rsplit_once(':').ok_or(ParseError::MissingPort)?;
        let pk = pk.parse()?;
        let port = match port {
            "~" => 0,
            p => p.parse().map_err(|_| ParseError::Port(p.to_string()))?,
        };
        Ok(Self { pk, port })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pk(byte: u8) -> PublicKey {
        PublicKey::from_bytes([byte; PUBLIC_KEY_LEN])
    }

    #[test]
    fn test_null_key() {
        assert!(PublicKey::default().is_null());
        assert!(!pk(1).is_null());
    }

    #[test]
    fn test_public_key_hex_parse() {
        let key = pk(0xab);
        let parsed: PublicKey = key.to_string().parse().unwrap();
        assert_eq!(parsed, key);

        assert!(matches!("zz".parse::<PublicKey>(), Err(ParseError::Hex(_))));
        assert_eq!("abcd".parse::<PublicKey>(), Err(ParseError::KeyLength(2)));
    }

    #[test]
    fn test_public_key_serializes_as_hex_string() {
        let json = serde_json::to_string(&pk(1)).unwrap();
        assert_eq!(json, format!("\"{}\"", "01".repeat(32)));
    }

    #[test]
    fn test_addr_display() {
        let addr = Addr::new(pk(2), 80);
        assert_eq!(addr.to_string(), format!("{}:80", "02".repeat(32)));
        assert_eq!(Addr::new(pk(2), 0).to_string(), format!("{}:~", "02".repeat(32)));
        assert_eq!(addr.short_string(), "02020202:80");
    }

    #[test]
    fn test_addr_parse() {
        let addr: Addr = format!("{}:8080", "03".repeat(32)).parse().unwrap();
        assert_eq!(addr, Addr::new(pk(3), 8080));

        let unspecified: Addr = format!("{}:~", "03".repeat(32)).parse().unwrap();
        assert_eq!(unspecified.port, 0);

        assert_eq!("nocolon".parse::<Addr>(), Err(ParseError::MissingPort));
        assert!(matches!(
            format!("{}:http", "03".repeat(32)).parse::<Addr>(),
            Err(ParseError::Port(_))
        ));
    }

    #[test]
    fn test_addr_is_complete() {
        assert!(Addr::new(pk(1), 1).is_complete());
        assert!(!Addr::new(pk(1), 0).is_complete());
        assert!(!Addr::new(PublicKey::default(), 1).is_complete());
    }

    #[test]
    fn test_addr_bincode_encoding_is_stable() {
        let addr = Addr::new(pk(4), 49152);
        let bytes = bincode::serialize(&addr).unwrap();
        let decoded: Addr = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, addr);
    }
}
