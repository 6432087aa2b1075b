use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};

use super::{Error, HardwareAddress};

/// Fixed BOOTP header plus the magic cookie.
pub const MIN_LEN: usize = 240;

/// Historic BOOTP minimum datagram size; replies are padded up to it.
pub const MIN_PACKET_LEN: usize = 300;

pub const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

pub const OP_BOOTREQUEST: u8 = 1;
pub const OP_BOOTREPLY: u8 = 2;

pub const OPTION_PAD: u8 = 0;
pub const OPTION_SUBNET_MASK: u8 = 1;
pub const OPTION_ROUTER: u8 = 3;
pub const OPTION_DNS_SERVERS: u8 = 6;
pub const OPTION_HOST_NAME: u8 = 12;
pub const OPTION_REQUESTED_IP: u8 = 50;
pub const OPTION_LEASE_TIME: u8 = 51;
pub const OPTION_MESSAGE_TYPE: u8 = 53;
pub const OPTION_SERVER_ID: u8 = 54;
pub const OPTION_RENEWAL_TIME: u8 = 58;
pub const OPTION_REBINDING_TIME: u8 = 59;
pub const OPTION_END: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Discover,
    Offer,
    Request,
    Decline,
    Ack,
    Nak,
    Release,
    Inform,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Discover,
            2 => Self::Offer,
            3 => Self::Request,
            4 => Self::Decline,
            5 => Self::Ack,
            6 => Self::Nak,
            7 => Self::Release,
            8 => Self::Inform,
            _ => return None,
        })
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::Discover => 1,
            Self::Offer => 2,
            Self::Request => 3,
            Self::Decline => 4,
            Self::Ack => 5,
            Self::Nak => 6,
            Self::Release => 7,
            Self::Inform => 8,
        }
    }
}

/// A decoded BOOTP/DHCP message.
#[derive(Debug)]
pub struct Message<'a> {
    pub op: u8,
    pub xid: u32,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub chaddr: HardwareAddress,
    options: &'a [u8],
}

impl<'a> Message<'a> {
    pub fn decode(bytes: &'a [u8]) -> Result<Self, Error> {
        if bytes.len() < MIN_LEN {
            return Err(Error::TooShort);
        }

        // Only Ethernet client hardware addresses are meaningful here.
        if bytes[1] != 1 || bytes[2] != 6 {
            return Err(Error::InvalidInput);
        }

        if bytes[236..240] != MAGIC_COOKIE {
            return Err(Error::InvalidInput);
        }

        let ciaddr: [u8; 4] = bytes[12..16].try_into()?;
        let yiaddr: [u8; 4] = bytes[16..20].try_into()?;

        Ok(Self {
            op: bytes[0],
            xid: u32::from_be_bytes(bytes[4..8].try_into()?),
            flags: u16::from_be_bytes(bytes[10..12].try_into()?),
            ciaddr: ciaddr.into(),
            yiaddr: yiaddr.into(),
            chaddr: bytes[28..34].try_into()?,
            options: &bytes[MIN_LEN..],
        })
    }

    /// Walk the option TLVs until END, skipping PAD bytes. Truncated
    /// options terminate the walk.
    pub fn options(&self) -> impl Iterator<Item = (u8, &'a [u8])> {
        OptionsIter {
            bytes: self.options,
            at: 0,
        }
    }

    pub fn option(&self, code: u8) -> Option<&'a [u8]> {
        self.options().find(|(c, _)| *c == code).map(|(_, v)| v)
    }

    pub fn message_type(&self) -> Option<MessageType> {
        let value = self.option(OPTION_MESSAGE_TYPE)?;
        MessageType::from_u8(*value.first()?)
    }

    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        let value: [u8; 4] = self.option(OPTION_REQUESTED_IP)?.try_into().ok()?;
        Some(value.into())
    }
}

struct OptionsIter<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Iterator for OptionsIter<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let code = *self.bytes.get(self.at)?;
            match code {
                OPTION_PAD => {
                    self.at += 1;
                }
                OPTION_END => return None,
                _ => {
                    let len = usize::from(*self.bytes.get(self.at + 1)?);
                    let value = self.bytes.get(self.at + 2..self.at + 2 + len)?;
                    self.at += 2 + len;
                    return Some((code, value));
                }
            }
        }
    }
}

/// Builder for BOOTP replies. Field order and padding follow the classic
/// fixed layout; options are emitted in insertion order and closed with END.
///
/// # Test
///
/// ```
/// use bytes::BytesMut;
/// use fscpd_packet::dhcp::*;
///
/// let mut bytes = BytesMut::new();
/// let mut reply = Reply::new(0xDEADBEEF, [1, 2, 3, 4, 5, 6]);
/// reply.yiaddr = "10.0.0.5".parse().unwrap();
/// reply.option(OPTION_MESSAGE_TYPE, &[MessageType::Offer.to_u8()]);
/// reply.encode(&mut bytes);
///
/// let message = Message::decode(&bytes).unwrap();
/// assert_eq!(message.op, OP_BOOTREPLY);
/// assert_eq!(message.xid, 0xDEADBEEF);
/// assert_eq!(message.yiaddr, "10.0.0.5".parse::<std::net::Ipv4Addr>().unwrap());
/// assert_eq!(message.message_type(), Some(MessageType::Offer));
/// assert!(bytes.len() >= MIN_PACKET_LEN);
/// ```
pub struct Reply {
    pub xid: u32,
    pub flags: u16,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub chaddr: HardwareAddress,
    options: Vec<(u8, Vec<u8>)>,
}

impl Reply {
    pub fn new(xid: u32, chaddr: HardwareAddress) -> Self {
        Self {
            xid,
            flags: 0,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            options: Vec::with_capacity(8),
        }
    }

    pub fn option(&mut self, code: u8, value: &[u8]) -> &mut Self {
        self.options.push((code, value.to_vec()));
        self
    }

    pub fn encode(&self, bytes: &mut BytesMut) {
        bytes.reserve(MIN_PACKET_LEN);

        bytes.put_u8(OP_BOOTREPLY);
        bytes.put_u8(1); // Ethernet
        bytes.put_u8(6);
        bytes.put_u8(0); // hops
        bytes.put_u32(self.xid);
        bytes.put_u16(0); // secs
        bytes.put_u16(self.flags);
        bytes.put_slice(&[0u8; 4]); // ciaddr
        bytes.put_slice(&self.yiaddr.octets());
        bytes.put_slice(&self.siaddr.octets());
        bytes.put_slice(&[0u8; 4]); // giaddr
        bytes.put_slice(&self.chaddr);
        bytes.put_slice(&[0u8; 10]); // chaddr padding
        bytes.put_slice(&[0u8; 64]); // sname
        bytes.put_slice(&[0u8; 128]); // file
        bytes.put_slice(&MAGIC_COOKIE);

        for (code, value) in &self.options {
            bytes.put_u8(*code);
            bytes.put_u8(value.len() as u8);
            bytes.put_slice(value);
        }

        bytes.put_u8(OPTION_END);

        while bytes.len() < MIN_PACKET_LEN {
            bytes.put_u8(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(message_type: MessageType, xid: u32, chaddr: HardwareAddress) -> Vec<u8> {
        let mut bytes = vec![0u8; MIN_LEN];
        bytes[0] = OP_BOOTREQUEST;
        bytes[1] = 1;
        bytes[2] = 6;
        bytes[4..8].copy_from_slice(&xid.to_be_bytes());
        bytes[28..34].copy_from_slice(&chaddr);
        bytes[236..240].copy_from_slice(&MAGIC_COOKIE);
        bytes.extend_from_slice(&[OPTION_MESSAGE_TYPE, 1, message_type.to_u8(), OPTION_END]);
        bytes
    }

    #[test]
    fn request_fields_decode() {
        let bytes = request(MessageType::Discover, 0x11223344, [9; 6]);
        let message = Message::decode(&bytes).unwrap();

        assert_eq!(message.op, OP_BOOTREQUEST);
        assert_eq!(message.xid, 0x11223344);
        assert_eq!(message.chaddr, [9; 6]);
        assert_eq!(message.message_type(), Some(MessageType::Discover));
    }

    #[test]
    fn truncated_option_terminates_walk() {
        let mut bytes = request(MessageType::Request, 1, [1; 6]);
        // Replace END with a length byte pointing past the end of the buffer.
        bytes.pop();
        bytes.extend_from_slice(&[OPTION_HOST_NAME, 200]);
        let message = Message::decode(&bytes).unwrap();

        // The message type before the broken option is still found.
        assert_eq!(message.message_type(), Some(MessageType::Request));
        assert!(message.option(OPTION_HOST_NAME).is_none());
    }

    #[test]
    fn missing_cookie_is_rejected() {
        let mut bytes = request(MessageType::Discover, 1, [1; 6]);
        bytes[236] = 0;
        assert!(matches!(Message::decode(&bytes), Err(Error::InvalidInput)));
    }
}
