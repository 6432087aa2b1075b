use std::net::{IpAddr, SocketAddr};

use bytes::{BufMut, BytesMut};

use super::{Error, HEADER_LEN, VERSION};

/// Every message type on the wire.
///
/// DATA occupies sixteen consecutive type bytes: `0x70 + channel` for the
/// eight payload channels, then the two contact messages and KEEPALIVE in the
/// same secure framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    HelloRequest,
    HelloResponse,
    Presentation,
    SessionRequest,
    Session,
    Data(u8),
    ContactRequest,
    Contact,
    Keepalive,
}

impl Kind {
    pub fn to_u8(self) -> u8 {
        match self {
            Self::HelloRequest => 0x00,
            Self::HelloResponse => 0x01,
            Self::Presentation => 0x02,
            Self::SessionRequest => 0x03,
            Self::Session => 0x04,
            Self::Data(channel) => 0x70 + channel,
            Self::ContactRequest => 0x78,
            Self::Contact => 0x79,
            Self::Keepalive => 0x7F,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self, Error> {
        Ok(match value {
            0x00 => Self::HelloRequest,
            0x01 => Self::HelloResponse,
            0x02 => Self::Presentation,
            0x03 => Self::SessionRequest,
            0x04 => Self::Session,
            0x70..=0x77 => Self::Data(value - 0x70),
            0x78 => Self::ContactRequest,
            0x79 => Self::Contact,
            0x7F => Self::Keepalive,
            other => return Err(Error::UnknownType(other)),
        })
    }

    /// Whether the payload uses the secure framing
    /// (session index, sequence number, ciphertext).
    pub fn is_secure(self) -> bool {
        matches!(
            self,
            Self::Data(_) | Self::ContactRequest | Self::Contact | Self::Keepalive
        )
    }
}

/// A borrowed view over one complete message.
#[derive(Debug)]
pub struct Packet<'a> {
    pub kind: Kind,
    pub payload: &'a [u8],
}

impl<'a> Packet<'a> {
    /// # Test
    ///
    /// ```
    /// use fscpd_codec::message::{Kind, Packet};
    ///
    /// let bytes = [0x03u8, 0x00, 0x00, 0x04, 0xde, 0xad, 0xbe, 0xef];
    /// let packet = Packet::decode(&bytes).unwrap();
    ///
    /// assert_eq!(packet.kind, Kind::HelloRequest);
    /// assert_eq!(packet.payload, &[0xde, 0xad, 0xbe, 0xef]);
    /// ```
    pub fn decode(bytes: &'a [u8]) -> Result<Self, Error> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::TooShort);
        }

        if bytes[0] != VERSION {
            return Err(Error::VersionMismatch(bytes[0]));
        }

        let kind = Kind::from_u8(bytes[1])?;
        let size = u16::from_be_bytes(bytes[2..4].try_into()?) as usize;
        if bytes.len() - HEADER_LEN < size {
            return Err(Error::InvalidLength);
        }

        Ok(Self {
            kind,
            payload: &bytes[HEADER_LEN..HEADER_LEN + size],
        })
    }
}

fn put_header(kind: Kind, payload_len: usize, bytes: &mut BytesMut) {
    bytes.put_u8(VERSION);
    bytes.put_u8(kind.to_u8());
    bytes.put_u16(payload_len as u16);
}

/// The material covered by the signature of a signed message: the header
/// with the length field describing the signed prefix, followed by the
/// prefix itself. Both sides can rebuild it without knowing the final
/// signature length.
pub fn signed_material(kind: Kind, prefix: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + prefix.len());
    out.push(VERSION);
    out.push(kind.to_u8());
    out.extend_from_slice(&(prefix.len() as u16).to_be_bytes());
    out.extend_from_slice(prefix);
    out
}

/// HELLO_REQUEST / HELLO_RESPONSE.
///
/// The request carries a unique identifier drawn from a monotonic counter;
/// the response echoes it so the requester can match it and measure the
/// round-trip time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub request_id: u32,
}

impl Hello {
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use fscpd_codec::message::{Hello, Kind, Packet};
    ///
    /// let mut bytes = BytesMut::new();
    /// Hello { request_id: 0x01020304 }.encode(Kind::HelloRequest, &mut bytes);
    ///
    /// assert_eq!(
    ///     &bytes[..],
    ///     &[0x03, 0x00, 0x00, 0x04, 0x01, 0x02, 0x03, 0x04]
    /// );
    ///
    /// let packet = Packet::decode(&bytes).unwrap();
    /// let hello = Hello::decode(packet.payload).unwrap();
    ///
    /// assert_eq!(hello.request_id, 0x01020304);
    /// ```
    pub fn encode(self, kind: Kind, bytes: &mut BytesMut) {
        put_header(kind, 4, bytes);
        bytes.put_u32(self.request_id);
    }

    pub fn decode(payload: &[u8]) -> Result<Self, Error> {
        if payload.len() != 4 {
            return Err(Error::InvalidLength);
        }

        Ok(Self {
            request_id: u32::from_be_bytes(payload[..4].try_into()?),
        })
    }
}

/// PRESENTATION. The payload is the sender's signature certificate, DER.
#[derive(Debug)]
pub struct Presentation<'a> {
    pub certificate: &'a [u8],
}

impl<'a> Presentation<'a> {
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use fscpd_codec::message::{Kind, Packet, Presentation};
    ///
    /// let mut bytes = BytesMut::new();
    /// Presentation { certificate: &[0x30, 0x82, 0x00, 0x01] }.encode(&mut bytes);
    ///
    /// let packet = Packet::decode(&bytes).unwrap();
    /// assert_eq!(packet.kind, Kind::Presentation);
    ///
    /// let presentation = Presentation::decode(packet.payload).unwrap();
    /// assert_eq!(presentation.certificate, &[0x30, 0x82, 0x00, 0x01]);
    /// ```
    pub fn encode(self, bytes: &mut BytesMut) {
        put_header(Kind::Presentation, self.certificate.len(), bytes);
        bytes.extend_from_slice(self.certificate);
    }

    pub fn decode(payload: &'a [u8]) -> Result<Self, Error> {
        if payload.is_empty() {
            return Err(Error::InvalidLength);
        }

        Ok(Self {
            certificate: payload,
        })
    }
}

/// SESSION_REQUEST. Two ordered capability lists followed by a signature
/// over the header and the lists.
#[derive(Debug)]
pub struct SessionRequest<'a> {
    pub cipher_suites: &'a [u8],
    pub elliptic_curves: &'a [u8],
    pub signature: &'a [u8],
    prefix_len: usize,
}

impl<'a> SessionRequest<'a> {
    /// Build and sign the message with `sign`, which receives the exact
    /// bytes to be covered and returns a DER signature.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use fscpd_codec::message::{Kind, Packet, SessionRequest};
    ///
    /// let mut bytes = BytesMut::new();
    /// SessionRequest::encode(&[0x01, 0x03], &[0x01], |_| vec![0xAA; 4], &mut bytes);
    ///
    /// let packet = Packet::decode(&bytes).unwrap();
    /// assert_eq!(packet.kind, Kind::SessionRequest);
    ///
    /// let request = SessionRequest::decode(packet.payload).unwrap();
    /// assert_eq!(request.cipher_suites, &[0x01, 0x03]);
    /// assert_eq!(request.elliptic_curves, &[0x01]);
    /// assert_eq!(request.signature, &[0xAA; 4]);
    /// ```
    pub fn encode<F>(suites: &[u8], curves: &[u8], sign: F, bytes: &mut BytesMut)
    where
        F: FnOnce(&[u8]) -> Vec<u8>,
    {
        let mut prefix = Vec::with_capacity(4 + suites.len() + curves.len());
        prefix.extend_from_slice(&(suites.len() as u16).to_be_bytes());
        prefix.extend_from_slice(suites);
        prefix.extend_from_slice(&(curves.len() as u16).to_be_bytes());
        prefix.extend_from_slice(curves);

        let signature = sign(&signed_material(Kind::SessionRequest, &prefix));

        put_header(
            Kind::SessionRequest,
            prefix.len() + 2 + signature.len(),
            bytes,
        );
        bytes.extend_from_slice(&prefix);
        bytes.put_u16(signature.len() as u16);
        bytes.extend_from_slice(&signature);
    }

    pub fn decode(payload: &'a [u8]) -> Result<Self, Error> {
        if payload.len() < 2 {
            return Err(Error::TooShort);
        }

        let cs_count = u16::from_be_bytes(payload[..2].try_into()?) as usize;
        let mut at = 2;
        let cipher_suites = payload.get(at..at + cs_count).ok_or(Error::TooShort)?;
        at += cs_count;

        let ec_count =
            u16::from_be_bytes(payload.get(at..at + 2).ok_or(Error::TooShort)?.try_into()?)
                as usize;
        at += 2;
        let elliptic_curves = payload.get(at..at + ec_count).ok_or(Error::TooShort)?;
        at += ec_count;

        let prefix_len = at;
        let sig_len =
            u16::from_be_bytes(payload.get(at..at + 2).ok_or(Error::TooShort)?.try_into()?)
                as usize;
        at += 2;
        let signature = payload.get(at..at + sig_len).ok_or(Error::TooShort)?;

        Ok(Self {
            cipher_suites,
            elliptic_curves,
            signature,
            prefix_len,
        })
    }

    /// The bytes the sender signed, rebuilt from the received payload.
    pub fn signed_material(&self, payload: &[u8]) -> Vec<u8> {
        signed_material(Kind::SessionRequest, &payload[..self.prefix_len])
    }
}

/// SESSION. The responder's choice of suite and curve, the session index
/// and the ephemeral public key, signed.
#[derive(Debug)]
pub struct Session<'a> {
    pub session_index: u32,
    pub cipher_suite: u8,
    pub elliptic_curve: u8,
    pub public_key: &'a [u8],
    pub signature: &'a [u8],
    prefix_len: usize,
}

impl<'a> Session<'a> {
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use fscpd_codec::message::{Kind, Packet, Session};
    ///
    /// let mut bytes = BytesMut::new();
    /// Session::encode(7, 0x01, 0x02, &[0x04; 65], |_| vec![0xBB; 4], &mut bytes);
    ///
    /// let packet = Packet::decode(&bytes).unwrap();
    /// assert_eq!(packet.kind, Kind::Session);
    ///
    /// let session = Session::decode(packet.payload).unwrap();
    /// assert_eq!(session.session_index, 7);
    /// assert_eq!(session.cipher_suite, 0x01);
    /// assert_eq!(session.elliptic_curve, 0x02);
    /// assert_eq!(session.public_key, &[0x04; 65]);
    /// assert_eq!(session.signature, &[0xBB; 4]);
    /// ```
    pub fn encode<F>(
        session_index: u32,
        cipher_suite: u8,
        elliptic_curve: u8,
        public_key: &[u8],
        sign: F,
        bytes: &mut BytesMut,
    ) where
        F: FnOnce(&[u8]) -> Vec<u8>,
    {
        let mut prefix = Vec::with_capacity(8 + public_key.len());
        prefix.extend_from_slice(&session_index.to_be_bytes());
        prefix.push(cipher_suite);
        prefix.push(elliptic_curve);
        prefix.extend_from_slice(&(public_key.len() as u16).to_be_bytes());
        prefix.extend_from_slice(public_key);

        let signature = sign(&signed_material(Kind::Session, &prefix));

        put_header(Kind::Session, prefix.len() + 2 + signature.len(), bytes);
        bytes.extend_from_slice(&prefix);
        bytes.put_u16(signature.len() as u16);
        bytes.extend_from_slice(&signature);
    }

    pub fn decode(payload: &'a [u8]) -> Result<Self, Error> {
        if payload.len() < 8 {
            return Err(Error::TooShort);
        }

        let session_index = u32::from_be_bytes(payload[..4].try_into()?);
        let cipher_suite = payload[4];
        let elliptic_curve = payload[5];
        let key_len = u16::from_be_bytes(payload[6..8].try_into()?) as usize;

        let mut at = 8;
        let public_key = payload.get(at..at + key_len).ok_or(Error::TooShort)?;
        at += key_len;

        let prefix_len = at;
        let sig_len =
            u16::from_be_bytes(payload.get(at..at + 2).ok_or(Error::TooShort)?.try_into()?)
                as usize;
        at += 2;
        let signature = payload.get(at..at + sig_len).ok_or(Error::TooShort)?;

        Ok(Self {
            session_index,
            cipher_suite,
            elliptic_curve,
            public_key,
            signature,
            prefix_len,
        })
    }

    pub fn signed_material(&self, payload: &[u8]) -> Vec<u8> {
        signed_material(Kind::Session, &payload[..self.prefix_len])
    }
}

/// The shared framing of DATA, CONTACT_REQUEST, CONTACT and KEEPALIVE:
/// session index, sequence number, then the AEAD ciphertext and tag.
#[derive(Debug)]
pub struct Secure<'a> {
    pub session_index: u32,
    pub sequence_number: u32,
    pub ciphertext: &'a [u8],
}

impl<'a> Secure<'a> {
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use fscpd_codec::message::{Kind, Packet, Secure};
    ///
    /// let mut bytes = BytesMut::new();
    /// Secure {
    ///     session_index: 1,
    ///     sequence_number: 42,
    ///     ciphertext: &[0x10, 0x20],
    /// }
    /// .encode(Kind::Data(3), &mut bytes);
    ///
    /// let packet = Packet::decode(&bytes).unwrap();
    /// assert_eq!(packet.kind, Kind::Data(3));
    ///
    /// let secure = Secure::decode(packet.payload).unwrap();
    /// assert_eq!(secure.session_index, 1);
    /// assert_eq!(secure.sequence_number, 42);
    /// assert_eq!(secure.ciphertext, &[0x10, 0x20]);
    /// ```
    pub fn encode(self, kind: Kind, bytes: &mut BytesMut) {
        put_header(kind, 8 + self.ciphertext.len(), bytes);
        bytes.put_u32(self.session_index);
        bytes.put_u32(self.sequence_number);
        bytes.extend_from_slice(self.ciphertext);
    }

    pub fn decode(payload: &'a [u8]) -> Result<Self, Error> {
        if payload.len() < 8 {
            return Err(Error::TooShort);
        }

        Ok(Self {
            session_index: u32::from_be_bytes(payload[..4].try_into()?),
            sequence_number: u32::from_be_bytes(payload[4..8].try_into()?),
            ciphertext: &payload[8..],
        })
    }
}

/// CONTACT_REQUEST plaintext: a list of certificate hashes the sender wants
/// endpoints for.
pub fn encode_hash_list(hashes: &[[u8; 32]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + hashes.len() * 32);
    out.extend_from_slice(&(hashes.len() as u16).to_be_bytes());
    for hash in hashes {
        out.extend_from_slice(hash);
    }

    out
}

pub fn decode_hash_list(plaintext: &[u8]) -> Result<Vec<[u8; 32]>, Error> {
    if plaintext.len() < 2 {
        return Err(Error::TooShort);
    }

    let count = u16::from_be_bytes(plaintext[..2].try_into()?) as usize;
    if plaintext.len() != 2 + count * 32 {
        return Err(Error::InvalidLength);
    }

    let mut hashes = Vec::with_capacity(count);
    for chunk in plaintext[2..].chunks_exact(32) {
        hashes.push(chunk.try_into()?);
    }

    Ok(hashes)
}

/// One CONTACT plaintext entry: a certificate hash and the endpoint at which
/// that certificate is currently reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContactEntry {
    pub hash: [u8; 32],
    pub endpoint: SocketAddr,
}

/// CONTACT plaintext: repeated `{ hash, family, address, port }`.
///
/// # Test
///
/// ```
/// use fscpd_codec::message::{decode_contact_list, encode_contact_list, ContactEntry};
///
/// let entries = vec![
///     ContactEntry {
///         hash: [7; 32],
///         endpoint: "127.0.0.1:12002".parse().unwrap(),
///     },
///     ContactEntry {
///         hash: [9; 32],
///         endpoint: "[::1]:9000".parse().unwrap(),
///     },
/// ];
///
/// let bytes = encode_contact_list(&entries);
/// assert_eq!(decode_contact_list(&bytes).unwrap(), entries);
/// ```
pub fn encode_contact_list(entries: &[ContactEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.len() * 39);
    for entry in entries {
        out.extend_from_slice(&entry.hash);
        match entry.endpoint.ip() {
            IpAddr::V4(ip) => {
                out.push(0x04);
                out.extend_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                out.push(0x06);
                out.extend_from_slice(&ip.octets());
            }
        }

        out.extend_from_slice(&entry.endpoint.port().to_be_bytes());
    }

    out
}

pub fn decode_contact_list(plaintext: &[u8]) -> Result<Vec<ContactEntry>, Error> {
    let mut entries = Vec::new();
    let mut at = 0;

    while at < plaintext.len() {
        let hash: [u8; 32] = plaintext
            .get(at..at + 32)
            .ok_or(Error::TooShort)?
            .try_into()?;
        at += 32;

        let family = *plaintext.get(at).ok_or(Error::TooShort)?;
        at += 1;

        let ip: IpAddr = match family {
            0x04 => {
                let octets: [u8; 4] = plaintext
                    .get(at..at + 4)
                    .ok_or(Error::TooShort)?
                    .try_into()?;
                at += 4;
                octets.into()
            }
            0x06 => {
                let octets: [u8; 16] = plaintext
                    .get(at..at + 16)
                    .ok_or(Error::TooShort)?
                    .try_into()?;
                at += 16;
                octets.into()
            }
            _ => return Err(Error::InvalidInput),
        };

        let port = u16::from_be_bytes(
            plaintext
                .get(at..at + 2)
                .ok_or(Error::TooShort)?
                .try_into()?,
        );
        at += 2;

        entries.push(ContactEntry {
            hash,
            endpoint: SocketAddr::new(ip, port),
        });
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_mismatch_is_reported() {
        let bytes = [0x02u8, 0x00, 0x00, 0x04, 0, 0, 0, 1];
        assert!(matches!(
            Packet::decode(&bytes),
            Err(Error::VersionMismatch(0x02))
        ));
    }

    #[test]
    fn unknown_type_is_reported() {
        let bytes = [VERSION, 0x42, 0x00, 0x00];
        assert!(matches!(
            Packet::decode(&bytes),
            Err(Error::UnknownType(0x42))
        ));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let bytes = [VERSION, 0x00, 0x00, 0x08, 0, 0, 0, 1];
        assert!(matches!(Packet::decode(&bytes), Err(Error::InvalidLength)));
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        // A datagram may be read into an oversized buffer; only `length`
        // bytes of payload belong to the message.
        let bytes = [VERSION, 0x00, 0x00, 0x04, 0, 0, 0, 1, 0xFF, 0xFF];
        let packet = Packet::decode(&bytes).unwrap();
        assert_eq!(packet.payload, &[0, 0, 0, 1]);
    }

    #[test]
    fn session_request_signed_material_round_trips() {
        let mut bytes = BytesMut::new();
        let mut signed = Vec::new();
        SessionRequest::encode(
            &[0x01, 0x02],
            &[0x01],
            |material| {
                signed = material.to_vec();
                vec![0xCC; 70]
            },
            &mut bytes,
        );

        let packet = Packet::decode(&bytes).unwrap();
        let request = SessionRequest::decode(packet.payload).unwrap();
        assert_eq!(request.signed_material(packet.payload), signed);
    }

    #[test]
    fn session_signed_material_round_trips() {
        let mut bytes = BytesMut::new();
        let mut signed = Vec::new();
        Session::encode(
            3,
            0x01,
            0x01,
            &[0x04; 65],
            |material| {
                signed = material.to_vec();
                vec![0xCC; 70]
            },
            &mut bytes,
        );

        let packet = Packet::decode(&bytes).unwrap();
        let session = Session::decode(packet.payload).unwrap();
        assert_eq!(session.signed_material(packet.payload), signed);
    }

    #[test]
    fn decode_never_panics_on_fuzz() {
        // Cheap deterministic fuzz: every prefix of a pseudo-random buffer,
        // plus every single-byte mutation of a valid message.
        let mut buf = [0u8; 128];
        let mut state = 0x12345678u32;
        for byte in buf.iter_mut() {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            *byte = (state >> 24) as u8;
        }

        for len in 0..buf.len() {
            let _ = Packet::decode(&buf[..len]);
        }

        let mut bytes = BytesMut::new();
        Hello { request_id: 1 }.encode(Kind::HelloRequest, &mut bytes);
        for i in 0..bytes.len() {
            for bit in 0..8 {
                let mut copy = bytes.to_vec();
                copy[i] ^= 1 << bit;
                if let Ok(packet) = Packet::decode(&copy) {
                    let _ = Hello::decode(packet.payload);
                }
            }
        }
    }
}
