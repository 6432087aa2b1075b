use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};

use super::{
    Error,
    checksum::transport_checksum_v4,
    ipv4::PROTOCOL_UDP,
};

pub const HEADER_LEN: usize = 8;

/// A UDP datagram.
#[derive(Debug)]
pub struct Datagram<'a> {
    pub source_port: u16,
    pub destination_port: u16,
    pub payload: &'a [u8],
}

impl<'a> Datagram<'a> {
    /// Decode and, when `addresses` is given, verify the IPv4 checksum.
    /// An all-zero checksum field means "not computed" and is accepted.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use fscpd_packet::udp::Datagram;
    ///
    /// let source = "10.0.0.1".parse().unwrap();
    /// let destination = "10.0.0.2".parse().unwrap();
    ///
    /// let mut bytes = BytesMut::new();
    /// Datagram {
    ///     source_port: 68,
    ///     destination_port: 67,
    ///     payload: &[0xAA],
    /// }
    /// .encode(source, destination, &mut bytes);
    ///
    /// let datagram = Datagram::decode(&bytes, Some((source, destination))).unwrap();
    /// assert_eq!(datagram.source_port, 68);
    /// assert_eq!(datagram.destination_port, 67);
    /// assert_eq!(datagram.payload, &[0xAA]);
    /// ```
    pub fn decode(
        bytes: &'a [u8],
        addresses: Option<(Ipv4Addr, Ipv4Addr)>,
    ) -> Result<Self, Error> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::TooShort);
        }

        let len = u16::from_be_bytes(bytes[4..6].try_into()?) as usize;
        if len < HEADER_LEN || bytes.len() < len {
            return Err(Error::InvalidInput);
        }

        let sum = u16::from_be_bytes(bytes[6..8].try_into()?);
        if sum != 0 {
            if let Some((source, destination)) = addresses {
                if transport_checksum_v4(source, destination, PROTOCOL_UDP, &[&bytes[..len]]) != 0 {
                    return Err(Error::BadChecksum);
                }
            }
        }

        Ok(Self {
            source_port: u16::from_be_bytes(bytes[0..2].try_into()?),
            destination_port: u16::from_be_bytes(bytes[2..4].try_into()?),
            payload: &bytes[HEADER_LEN..len],
        })
    }

    pub fn encode(self, source: Ipv4Addr, destination: Ipv4Addr, bytes: &mut BytesMut) {
        let len = (HEADER_LEN + self.payload.len()) as u16;

        let mut header = [0u8; HEADER_LEN];
        header[0..2].copy_from_slice(&self.source_port.to_be_bytes());
        header[2..4].copy_from_slice(&self.destination_port.to_be_bytes());
        header[4..6].copy_from_slice(&len.to_be_bytes());

        let mut sum =
            transport_checksum_v4(source, destination, PROTOCOL_UDP, &[&header, self.payload]);
        if sum == 0 {
            sum = 0xFFFF;
        }

        header[6..8].copy_from_slice(&sum.to_be_bytes());

        bytes.reserve(HEADER_LEN + self.payload.len());
        bytes.put_slice(&header);
        bytes.put_slice(self.payload);
    }
}
