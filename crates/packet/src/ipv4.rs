use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};

use super::{Error, checksum::checksum};

pub const HEADER_LEN: usize = 20;

pub const PROTOCOL_TCP: u8 = 6;
pub const PROTOCOL_UDP: u8 = 17;

/// An IPv4 packet. Options are accepted on decode (the header length field
/// is honored) but never emitted.
#[derive(Debug)]
pub struct Packet<'a> {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub protocol: u8,
    pub ttl: u8,
    pub payload: &'a [u8],
}

impl<'a> Packet<'a> {
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use fscpd_packet::ipv4::{Packet, PROTOCOL_UDP};
    ///
    /// let mut bytes = BytesMut::new();
    /// Packet {
    ///     source: "10.0.0.1".parse().unwrap(),
    ///     destination: "10.0.0.5".parse().unwrap(),
    ///     protocol: PROTOCOL_UDP,
    ///     ttl: 64,
    ///     payload: &[1, 2, 3],
    /// }
    /// .encode(&mut bytes);
    ///
    /// let packet = Packet::decode(&bytes).unwrap();
    /// assert_eq!(packet.destination, "10.0.0.5".parse::<std::net::Ipv4Addr>().unwrap());
    /// assert_eq!(packet.payload, &[1, 2, 3]);
    /// ```
    pub fn decode(bytes: &'a [u8]) -> Result<Self, Error> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::TooShort);
        }

        if bytes[0] >> 4 != 4 {
            return Err(Error::InvalidInput);
        }

        let header_len = usize::from(bytes[0] & 0x0F) * 4;
        if header_len < HEADER_LEN || bytes.len() < header_len {
            return Err(Error::InvalidInput);
        }

        let total_len = u16::from_be_bytes(bytes[2..4].try_into()?) as usize;
        if total_len < header_len || bytes.len() < total_len {
            return Err(Error::InvalidInput);
        }

        if checksum(&[&bytes[..header_len]]) != 0 {
            return Err(Error::BadChecksum);
        }

        let src: [u8; 4] = bytes[12..16].try_into()?;
        let dst: [u8; 4] = bytes[16..20].try_into()?;

        Ok(Self {
            source: src.into(),
            destination: dst.into(),
            protocol: bytes[9],
            ttl: bytes[8],
            payload: &bytes[header_len..total_len],
        })
    }

    pub fn encode(self, bytes: &mut BytesMut) {
        let total_len = (HEADER_LEN + self.payload.len()) as u16;

        let mut header = [0u8; HEADER_LEN];
        header[0] = 0x45;
        header[2..4].copy_from_slice(&total_len.to_be_bytes());
        header[8] = self.ttl;
        header[9] = self.protocol;
        header[12..16].copy_from_slice(&self.source.octets());
        header[16..20].copy_from_slice(&self.destination.octets());

        let sum = checksum(&[&header]);
        header[10..12].copy_from_slice(&sum.to_be_bytes());

        bytes.reserve(HEADER_LEN + self.payload.len());
        bytes.put_slice(&header);
        bytes.put_slice(self.payload);
    }
}
