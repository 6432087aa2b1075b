use std::net::Ipv6Addr;

use super::Error;

pub const HEADER_LEN: usize = 40;

/// An IPv6 packet, fixed header only. Extension headers stay inside the
/// payload; the router only needs the addresses.
#[derive(Debug)]
pub struct Packet<'a> {
    pub source: Ipv6Addr,
    pub destination: Ipv6Addr,
    pub next_header: u8,
    pub hop_limit: u8,
    pub payload: &'a [u8],
}

impl<'a> Packet<'a> {
    pub fn decode(bytes: &'a [u8]) -> Result<Self, Error> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::TooShort);
        }

        if bytes[0] >> 4 != 6 {
            return Err(Error::InvalidInput);
        }

        let payload_len = u16::from_be_bytes(bytes[4..6].try_into()?) as usize;
        if bytes.len() < HEADER_LEN + payload_len {
            return Err(Error::InvalidInput);
        }

        let src: [u8; 16] = bytes[8..24].try_into()?;
        let dst: [u8; 16] = bytes[24..40].try_into()?;

        Ok(Self {
            source: src.into(),
            destination: dst.into(),
            next_header: bytes[6],
            hop_limit: bytes[7],
            payload: &bytes[HEADER_LEN..HEADER_LEN + payload_len],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_header_decodes() {
        let mut bytes = vec![0u8; HEADER_LEN + 2];
        bytes[0] = 0x60;
        bytes[4..6].copy_from_slice(&2u16.to_be_bytes());
        bytes[6] = 17;
        bytes[7] = 64;
        bytes[23] = 1; // src ::1
        bytes[39] = 2; // dst ::2

        let packet = Packet::decode(&bytes).unwrap();
        assert_eq!(packet.source, "::1".parse::<Ipv6Addr>().unwrap());
        assert_eq!(packet.destination, "::2".parse::<Ipv6Addr>().unwrap());
        assert_eq!(packet.payload.len(), 2);
    }

    #[test]
    fn wrong_version_is_rejected() {
        let bytes = [0x40u8; HEADER_LEN];
        assert!(matches!(Packet::decode(&bytes), Err(Error::InvalidInput)));
    }
}
