//! ## Frame and packet codecs
//!
//! Byte-exact parsing and building of the frames the daemon inspects on its
//! virtual adapter: Ethernet II, ARP, IPv4/IPv6, UDP, TCP and BOOTP/DHCP,
//! plus the internet checksum helpers they share. Parsers are borrowed views
//! over the input buffer and are total over arbitrary bytes.

pub mod arp;
pub mod checksum;
pub mod dhcp;
pub mod ethernet;
pub mod ipv4;
pub mod ipv6;
pub mod tcp;
pub mod udp;

use std::array::TryFromSliceError;

/// A hardware (MAC) address.
pub type HardwareAddress = [u8; 6];

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    TooShort,
    InvalidInput,
    /// The embedded checksum does not match the computed one.
    BadChecksum,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_parser_is_total_over_garbage() {
        let mut buf = [0u8; 512];
        let mut state = 0x6d5a56e2u32;
        for byte in buf.iter_mut() {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            *byte = (state >> 24) as u8;
        }

        for len in 0..buf.len() {
            let bytes = &buf[..len];
            let _ = ethernet::Frame::decode(bytes);
            let _ = arp::Packet::decode(bytes);
            let _ = ipv4::Packet::decode(bytes);
            let _ = ipv6::Packet::decode(bytes);
            let _ = udp::Datagram::decode(bytes, None);
            let _ = tcp::Segment::decode(bytes);
            if let Ok(message) = dhcp::Message::decode(bytes) {
                let _ = message.message_type();
                let _ = message.options().count();
            }
        }
    }
}
