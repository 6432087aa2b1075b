use bytes::{BufMut, BytesMut};

use super::{Error, HardwareAddress};

pub const HEADER_LEN: usize = 14;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_IPV6: u16 = 0x86DD;

pub const BROADCAST: HardwareAddress = [0xFF; 6];

/// An Ethernet II frame.
#[derive(Debug)]
pub struct Frame<'a> {
    pub destination: HardwareAddress,
    pub source: HardwareAddress,
    pub ethertype: u16,
    pub payload: &'a [u8],
}

impl<'a> Frame<'a> {
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use fscpd_packet::ethernet::{Frame, ETHERTYPE_ARP};
    ///
    /// let mut bytes = BytesMut::new();
    /// Frame {
    ///     destination: [0xFF; 6],
    ///     source: [1, 2, 3, 4, 5, 6],
    ///     ethertype: ETHERTYPE_ARP,
    ///     payload: &[0xAB, 0xCD],
    /// }
    /// .encode(&mut bytes);
    ///
    /// let frame = Frame::decode(&bytes).unwrap();
    /// assert_eq!(frame.destination, [0xFF; 6]);
    /// assert_eq!(frame.source, [1, 2, 3, 4, 5, 6]);
    /// assert_eq!(frame.ethertype, ETHERTYPE_ARP);
    /// assert_eq!(frame.payload, &[0xAB, 0xCD]);
    /// ```
    pub fn decode(bytes: &'a [u8]) -> Result<Self, Error> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::TooShort);
        }

        Ok(Self {
            destination: bytes[0..6].try_into()?,
            source: bytes[6..12].try_into()?,
            ethertype: u16::from_be_bytes(bytes[12..14].try_into()?),
            payload: &bytes[HEADER_LEN..],
        })
    }

    pub fn encode(self, bytes: &mut BytesMut) {
        bytes.reserve(HEADER_LEN + self.payload.len());
        bytes.put_slice(&self.destination);
        bytes.put_slice(&self.source);
        bytes.put_u16(self.ethertype);
        bytes.put_slice(self.payload);
    }

    /// Whether the destination is the broadcast or a multicast address.
    pub fn is_broadcast(&self) -> bool {
        self.destination == BROADCAST || self.destination[0] & 0x01 != 0
    }
}
