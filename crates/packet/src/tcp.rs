use std::net::Ipv4Addr;

use super::{Error, checksum::transport_checksum_v4, ipv4::PROTOCOL_TCP};

pub const HEADER_LEN: usize = 20;

/// A TCP segment header. The daemon never originates TCP; the view exists
/// for filters and checksum validation.
#[derive(Debug)]
pub struct Segment<'a> {
    pub source_port: u16,
    pub destination_port: u16,
    pub sequence_number: u32,
    pub acknowledgment: u32,
    pub flags: u8,
    pub window: u16,
    pub payload: &'a [u8],
}

impl<'a> Segment<'a> {
    pub fn decode(bytes: &'a [u8]) -> Result<Self, Error> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::TooShort);
        }

        let data_offset = usize::from(bytes[12] >> 4) * 4;
        if data_offset < HEADER_LEN || bytes.len() < data_offset {
            return Err(Error::InvalidInput);
        }

        Ok(Self {
            source_port: u16::from_be_bytes(bytes[0..2].try_into()?),
            destination_port: u16::from_be_bytes(bytes[2..4].try_into()?),
            sequence_number: u32::from_be_bytes(bytes[4..8].try_into()?),
            acknowledgment: u32::from_be_bytes(bytes[8..12].try_into()?),
            flags: bytes[13],
            window: u16::from_be_bytes(bytes[14..16].try_into()?),
            payload: &bytes[data_offset..],
        })
    }

    /// Verify the segment checksum against the IPv4 pseudo-header.
    pub fn verify_checksum(
        segment: &[u8],
        source: Ipv4Addr,
        destination: Ipv4Addr,
    ) -> Result<(), Error> {
        if transport_checksum_v4(source, destination, PROTOCOL_TCP, &[segment]) != 0 {
            return Err(Error::BadChecksum);
        }

        Ok(())
    }
}
