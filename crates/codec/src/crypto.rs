//! Cryptographic primitives behind the secure channel: suite and curve
//! identifiers, ephemeral key exchange, the session KDF, AEAD sealing of
//! DATA-class messages and ECDSA signatures over handshake messages.

use aes_gcm::{
    Aes128Gcm, Aes256Gcm,
    aead::{Aead, KeyInit, Payload},
};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256, Sha384};

use super::{Error, VERSION, message::Kind};

pub use p256::ecdsa::{SigningKey, VerifyingKey};
pub use p256::pkcs8;

/// Length of a certificate hash (SHA-256).
pub const HASH_LEN: usize = 32;

/// AEAD authentication tag length, identical for every suite.
pub const TAG_LEN: usize = 16;

/// A negotiable cipher suite. The byte values are fixed by the protocol;
/// both sides must agree on the mapping statically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CipherSuite {
    Aes128GcmSha256 = 0x01,
    Aes256GcmSha384 = 0x02,
    ChaCha20Poly1305Sha256 = 0x03,
}

impl CipherSuite {
    pub fn key_len(self) -> usize {
        match self {
            Self::Aes128GcmSha256 => 16,
            Self::Aes256GcmSha384 => 32,
            Self::ChaCha20Poly1305Sha256 => 32,
        }
    }
}

/// A negotiable elliptic curve for the ephemeral key exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum EllipticCurve {
    Secp256r1 = 0x01,
    X25519 = 0x02,
}

/// An in-flight ephemeral key exchange. Created when a SESSION is built,
/// consumed when the matching SESSION from the other side arrives.
pub struct Exchange {
    curve: EllipticCurve,
    inner: ExchangeInner,
}

enum ExchangeInner {
    P256(p256::ecdh::EphemeralSecret),
    X25519(Option<x25519_dalek::EphemeralSecret>),
}

impl Exchange {
    pub fn generate(curve: EllipticCurve) -> Self {
        let inner = match curve {
            EllipticCurve::Secp256r1 => {
                ExchangeInner::P256(p256::ecdh::EphemeralSecret::random(&mut OsRng))
            }
            EllipticCurve::X25519 => ExchangeInner::X25519(Some(
                x25519_dalek::EphemeralSecret::random_from_rng(OsRng),
            )),
        };

        Self { curve, inner }
    }

    pub fn curve(&self) -> EllipticCurve {
        self.curve
    }

    /// The public half, in the curve's canonical wire encoding
    /// (uncompressed SEC1 for secp256r1, raw 32 bytes for x25519).
    pub fn public_key(&self) -> Vec<u8> {
        match &self.inner {
            ExchangeInner::P256(secret) => secret
                .public_key()
                .to_encoded_point(false)
                .as_bytes()
                .to_vec(),
            ExchangeInner::X25519(secret) => match secret {
                Some(secret) => x25519_dalek::PublicKey::from(secret).as_bytes().to_vec(),
                None => Vec::new(),
            },
        }
    }

    /// Complete the exchange against the peer's public key.
    pub fn agree(&mut self, peer_public: &[u8]) -> Result<Vec<u8>, Error> {
        match &mut self.inner {
            ExchangeInner::P256(secret) => {
                let public =
                    p256::PublicKey::from_sec1_bytes(peer_public).map_err(|_| Error::InvalidInput)?;
                Ok(secret.diffie_hellman(&public).raw_secret_bytes().to_vec())
            }
            ExchangeInner::X25519(secret) => {
                let bytes: [u8; 32] = peer_public.try_into().map_err(|_| Error::InvalidInput)?;
                let secret = secret.take().ok_or(Error::CryptoFailed)?;
                Ok(secret
                    .diffie_hellman(&x25519_dalek::PublicKey::from(bytes))
                    .as_bytes()
                    .to_vec())
            }
        }
    }
}

/// The two symmetric keys of a session, named from the local point of view.
#[derive(Clone)]
pub struct SessionKeys {
    /// Key used to seal outgoing messages.
    pub seal: Vec<u8>,
    /// Key used to open incoming messages.
    pub open: Vec<u8>,
}

/// Derive both directional keys from the ECDH shared secret.
///
/// `initiator` names the direction assignment: the party whose ephemeral
/// public key compares lexicographically lower sends with the key expanded
/// from `b"initiator"`. Both sides call this with opposite flags and end up
/// with mirrored key pairs.
pub fn derive_session_keys(
    suite: CipherSuite,
    shared_secret: &[u8],
    session_index: u32,
    initiator: bool,
) -> Result<SessionKeys, Error> {
    let salt = session_index.to_be_bytes();
    let mut a = vec![0u8; suite.key_len()];
    let mut b = vec![0u8; suite.key_len()];

    match suite {
        CipherSuite::Aes256GcmSha384 => {
            let kdf = Hkdf::<Sha384>::new(Some(&salt), shared_secret);
            kdf.expand(b"initiator", &mut a)
                .map_err(|_| Error::CryptoFailed)?;
            kdf.expand(b"responder", &mut b)
                .map_err(|_| Error::CryptoFailed)?;
        }
        _ => {
            let kdf = Hkdf::<Sha256>::new(Some(&salt), shared_secret);
            kdf.expand(b"initiator", &mut a)
                .map_err(|_| Error::CryptoFailed)?;
            kdf.expand(b"responder", &mut b)
                .map_err(|_| Error::CryptoFailed)?;
        }
    }

    Ok(if initiator {
        SessionKeys { seal: a, open: b }
    } else {
        SessionKeys { seal: b, open: a }
    })
}

fn nonce(session_index: u32, sequence_number: u32) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[4..8].copy_from_slice(&session_index.to_be_bytes());
    out[8..12].copy_from_slice(&sequence_number.to_be_bytes());
    out
}

fn aad(kind: Kind, payload_len: usize, session_index: u32, sequence_number: u32) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[0] = VERSION;
    out[1] = kind.to_u8();
    out[2..4].copy_from_slice(&(payload_len as u16).to_be_bytes());
    out[4..8].copy_from_slice(&session_index.to_be_bytes());
    out[8..12].copy_from_slice(&sequence_number.to_be_bytes());
    out
}

/// Seal a DATA-class plaintext. Returns ciphertext followed by the tag.
///
/// # Test
///
/// ```
/// use fscpd_codec::crypto::{open, seal, CipherSuite};
/// use fscpd_codec::message::Kind;
///
/// let key = [7u8; 16];
/// let sealed = seal(
///     CipherSuite::Aes128GcmSha256,
///     &key,
///     Kind::Data(3),
///     1,
///     42,
///     b"Hello you !",
/// )
/// .unwrap();
///
/// let opened = open(CipherSuite::Aes128GcmSha256, &key, Kind::Data(3), 1, 42, &sealed).unwrap();
/// assert_eq!(opened, b"Hello you !");
///
/// // Any sequence-number mismatch breaks authentication.
/// assert!(open(CipherSuite::Aes128GcmSha256, &key, Kind::Data(3), 1, 43, &sealed).is_err());
/// ```
pub fn seal(
    suite: CipherSuite,
    key: &[u8],
    kind: Kind,
    session_index: u32,
    sequence_number: u32,
    plaintext: &[u8],
) -> Result<Vec<u8>, Error> {
    let payload_len = 8 + plaintext.len() + TAG_LEN;
    let aad = aad(kind, payload_len, session_index, sequence_number);
    let nonce = nonce(session_index, sequence_number);
    let payload = Payload {
        msg: plaintext,
        aad: &aad,
    };

    let out = match suite {
        CipherSuite::Aes128GcmSha256 => Aes128Gcm::new_from_slice(key)
            .map_err(|_| Error::CryptoFailed)?
            .encrypt((&nonce).into(), payload),
        CipherSuite::Aes256GcmSha384 => Aes256Gcm::new_from_slice(key)
            .map_err(|_| Error::CryptoFailed)?
            .encrypt((&nonce).into(), payload),
        CipherSuite::ChaCha20Poly1305Sha256 => ChaCha20Poly1305::new_from_slice(key)
            .map_err(|_| Error::CryptoFailed)?
            .encrypt((&nonce).into(), payload),
    };

    out.map_err(|_| Error::CryptoFailed)
}

/// Open a DATA-class ciphertext; fails on any authentication mismatch.
pub fn open(
    suite: CipherSuite,
    key: &[u8],
    kind: Kind,
    session_index: u32,
    sequence_number: u32,
    ciphertext: &[u8],
) -> Result<Vec<u8>, Error> {
    let payload_len = 8 + ciphertext.len();
    let aad = aad(kind, payload_len, session_index, sequence_number);
    let nonce = nonce(session_index, sequence_number);
    let payload = Payload {
        msg: ciphertext,
        aad: &aad,
    };

    let out = match suite {
        CipherSuite::Aes128GcmSha256 => Aes128Gcm::new_from_slice(key)
            .map_err(|_| Error::CryptoFailed)?
            .decrypt((&nonce).into(), payload),
        CipherSuite::Aes256GcmSha384 => Aes256Gcm::new_from_slice(key)
            .map_err(|_| Error::CryptoFailed)?
            .decrypt((&nonce).into(), payload),
        CipherSuite::ChaCha20Poly1305Sha256 => ChaCha20Poly1305::new_from_slice(key)
            .map_err(|_| Error::CryptoFailed)?
            .decrypt((&nonce).into(), payload),
    };

    out.map_err(|_| Error::CryptoFailed)
}

/// ECDSA P-256/SHA-256 signature, DER encoded.
pub fn sign(key: &SigningKey, message: &[u8]) -> Vec<u8> {
    let signature: p256::ecdsa::Signature = key.sign(message);
    signature.to_der().as_bytes().to_vec()
}

/// Verify a DER signature produced by [`sign`].
pub fn verify(key: &VerifyingKey, message: &[u8], signature: &[u8]) -> Result<(), Error> {
    let signature =
        p256::ecdsa::Signature::from_der(signature).map_err(|_| Error::SignatureRejected)?;
    key.verify(message, &signature)
        .map_err(|_| Error::SignatureRejected)
}

/// SHA-256 digest, used for certificate hashes in presentations and
/// contact lookups.
///
/// # Test
///
/// ```
/// use fscpd_codec::crypto::sha256;
///
/// assert_eq!(
///     sha256(b"abc")[..4],
///     [0xba, 0x78, 0x16, 0xbf]
/// );
/// ```
pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}
