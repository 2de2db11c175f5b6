//! Dmsg Cryptography
//!
//! Identity keys, detached signatures, the Noise handshakes used for
//! sessions and streams, and the framed transport ciphers they produce.

mod encrypt;
mod keys;
mod noise;
mod sign;
mod window;

pub use encrypt::*;
pub use keys::*;
pub use noise::*;
pub use sign::*;
pub use window::*;
