//! ## FSCP wire codec
//!
//! Bit-exact parsing and building of every FSCP message. FSCP is a compact,
//! message-oriented secure channel protocol carried over unreliable UDP:
//! peers greet each other with HELLO, bind their endpoint to a certificate
//! with PRESENTATION, negotiate a cipher suite and an elliptic curve with
//! SESSION_REQUEST/SESSION, and then exchange authenticated-encrypted DATA
//! frames on one of eight channels.
//!
//! Every message starts with the same 4-byte header:
//!
//! ```text
//! 0      1      2             4
//! +------+------+------+------+
//! | ver  | type |   length    |
//! +------+------+------+------+
//! ```
//!
//! where `length` is the big-endian byte count of the payload that follows.
//! Parsing never panics on arbitrary input.

pub mod crypto;
pub mod message;

use std::array::TryFromSliceError;

/// The protocol version understood by this implementation.
pub const VERSION: u8 = 3;

/// Size of the fixed message header.
pub const HEADER_LEN: usize = 4;

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    TooShort,
    /// The version byte did not match [`VERSION`]. Carries the received byte.
    VersionMismatch(u8),
    /// The type byte maps to no known message. Carries the received byte.
    UnknownType(u8),
    /// The header length field disagrees with the available bytes.
    InvalidLength,
    InvalidInput,
    SignatureRejected,
    CryptoFailed,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<TryFromSliceError> for Error {
    fn from(_: TryFromSliceError) -> Self {
        Self::TooShort
    }
}
