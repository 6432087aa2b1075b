use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};

use super::{Error, HardwareAddress};

pub const PACKET_LEN: usize = 28;

pub const OPERATION_REQUEST: u16 = 1;
pub const OPERATION_REPLY: u16 = 2;

/// An ARP packet for IPv4 over Ethernet. Other hardware or protocol types
/// are rejected at decode time.
#[derive(Debug, Clone, Copy)]
pub struct Packet {
    pub operation: u16,
    pub sender_hardware: HardwareAddress,
    pub sender_protocol: Ipv4Addr,
    pub target_hardware: HardwareAddress,
    pub target_protocol: Ipv4Addr,
}

impl Packet {
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use fscpd_packet::arp::{Packet, OPERATION_REQUEST};
    ///
    /// let mut bytes = BytesMut::new();
    /// Packet {
    ///     operation: OPERATION_REQUEST,
    ///     sender_hardware: [1, 2, 3, 4, 5, 6],
    ///     sender_protocol: "10.0.0.1".parse().unwrap(),
    ///     target_hardware: [0; 6],
    ///     target_protocol: "10.0.0.2".parse().unwrap(),
    /// }
    /// .encode(&mut bytes);
    ///
    /// let packet = Packet::decode(&bytes).unwrap();
    /// assert_eq!(packet.operation, OPERATION_REQUEST);
    /// assert_eq!(packet.sender_protocol, "10.0.0.1".parse::<std::net::Ipv4Addr>().unwrap());
    /// ```
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < PACKET_LEN {
            return Err(Error::TooShort);
        }

        // Ethernet (1) / IPv4 (0x0800) with the matching address sizes.
        if bytes[0..2] != [0x00, 0x01]
            || bytes[2..4] != [0x08, 0x00]
            || bytes[4] != 6
            || bytes[5] != 4
        {
            return Err(Error::InvalidInput);
        }

        let spa: [u8; 4] = bytes[14..18].try_into()?;
        let tpa: [u8; 4] = bytes[24..28].try_into()?;

        Ok(Self {
            operation: u16::from_be_bytes(bytes[6..8].try_into()?),
            sender_hardware: bytes[8..14].try_into()?,
            sender_protocol: spa.into(),
            target_hardware: bytes[18..24].try_into()?,
            target_protocol: tpa.into(),
        })
    }

    pub fn encode(self, bytes: &mut BytesMut) {
        bytes.reserve(PACKET_LEN);
        bytes.put_u16(0x0001);
        bytes.put_u16(0x0800);
        bytes.put_u8(6);
        bytes.put_u8(4);
        bytes.put_u16(self.operation);
        bytes.put_slice(&self.sender_hardware);
        bytes.put_slice(&self.sender_protocol.octets());
        bytes.put_slice(&self.target_hardware);
        bytes.put_slice(&self.target_protocol.octets());
    }
}
