use std::net::Ipv4Addr;
use std::time::Duration;

use ahash::{HashMap, HashMapExt};
use bytes::BytesMut;

use packet::HardwareAddress;
use packet::dhcp::{
    self, Message, MessageType, OP_BOOTREQUEST, OPTION_DNS_SERVERS, OPTION_LEASE_TIME,
    OPTION_MESSAGE_TYPE, OPTION_REBINDING_TIME, OPTION_RENEWAL_TIME, OPTION_ROUTER,
    OPTION_SERVER_ID, OPTION_SUBNET_MASK,
};
use packet::ethernet::{ETHERTYPE_IPV4, Frame};
use packet::ipv4::{self, PROTOCOL_UDP};
use packet::udp::Datagram;

pub struct DhcpProxyOptions {
    /// The address the proxy answers from; also offered as the router.
    pub server_address: Ipv4Addr,
    /// Hardware address the replies originate from.
    pub server_hardware: HardwareAddress,
    pub lease: Duration,
    pub dns_servers: Vec<Ipv4Addr>,
}

/// Hands out preconfigured leases on the TAP adapter: DISCOVER gets an
/// OFFER, REQUEST gets an ACK, everything else is left alone.
pub struct DhcpProxy {
    options: DhcpProxyOptions,
    bindings: HashMap<HardwareAddress, (Ipv4Addr, u8)>,
}

impl DhcpProxy {
    pub fn new(options: DhcpProxyOptions) -> Self {
        Self {
            options,
            bindings: HashMap::with_capacity(16),
        }
    }

    pub fn add_entry(&mut self, hardware: HardwareAddress, address: Ipv4Addr, prefix_len: u8) {
        self.bindings.insert(hardware, (address, prefix_len));
    }

    /// Inspect one Ethernet frame; a returned frame is the finished reply
    /// to write back to the adapter.
    pub fn process_frame(&self, frame: &[u8]) -> Option<Vec<u8>> {
        let parsed = Frame::decode(frame).ok()?;
        if parsed.ethertype != ETHERTYPE_IPV4 {
            return None;
        }

        let ip = ipv4::Packet::decode(parsed.payload).ok()?;
        if ip.protocol != PROTOCOL_UDP {
            return None;
        }

        let udp = Datagram::decode(ip.payload, Some((ip.source, ip.destination))).ok()?;
        if udp.destination_port != 67 {
            return None;
        }

        let message = Message::decode(udp.payload).ok()?;
        if message.op != OP_BOOTREQUEST {
            return None;
        }

        let reply_type = match message.message_type()? {
            MessageType::Discover => MessageType::Offer,
            MessageType::Request => MessageType::Ack,
            // RELEASE, DECLINE and INFORM get no answer.
            _ => return None,
        };

        let (address, prefix_len) = *self.bindings.get(&message.chaddr)?;
        Some(self.reply(&message, reply_type, address, prefix_len))
    }

    fn reply(
        &self,
        message: &Message<'_>,
        reply_type: MessageType,
        address: Ipv4Addr,
        prefix_len: u8,
    ) -> Vec<u8> {
        let lease = self.options.lease.as_secs() as u32;
        let mask = Ipv4Addr::from(match prefix_len {
            0 => 0,
            len => u32::MAX << (32 - u32::from(len.min(32))),
        });

        let mut reply = dhcp::Reply::new(message.xid, message.chaddr);
        reply.flags = message.flags;
        reply.yiaddr = address;
        reply.siaddr = self.options.server_address;

        reply.option(OPTION_MESSAGE_TYPE, &[reply_type.to_u8()]);
        reply.option(OPTION_SERVER_ID, &self.options.server_address.octets());
        reply.option(OPTION_LEASE_TIME, &lease.to_be_bytes());
        reply.option(OPTION_RENEWAL_TIME, &(lease / 8 * 7).to_be_bytes());
        reply.option(OPTION_REBINDING_TIME, &(lease / 2).to_be_bytes());
        reply.option(OPTION_SUBNET_MASK, &mask.octets());
        reply.option(OPTION_ROUTER, &self.options.server_address.octets());
        if !self.options.dns_servers.is_empty() {
            let mut servers = Vec::with_capacity(self.options.dns_servers.len() * 4);
            for server in &self.options.dns_servers {
                servers.extend_from_slice(&server.octets());
            }

            reply.option(OPTION_DNS_SERVERS, &servers);
        }

        let mut bootp = BytesMut::new();
        reply.encode(&mut bootp);

        // Offers go to the broadcast address unless the client asked for a
        // unicast reply by already having an address.
        let broadcast = message.flags & 0x8000 != 0 || message.ciaddr.is_unspecified();
        let destination_ip = if broadcast {
            Ipv4Addr::BROADCAST
        } else {
            message.ciaddr
        };

        let mut udp = BytesMut::new();
        Datagram {
            source_port: 67,
            destination_port: 68,
            payload: &bootp,
        }
        .encode(self.options.server_address, destination_ip, &mut udp);

        let mut ip = BytesMut::new();
        ipv4::Packet {
            source: self.options.server_address,
            destination: destination_ip,
            protocol: PROTOCOL_UDP,
            ttl: 64,
            payload: &udp,
        }
        .encode(&mut ip);

        let mut frame = BytesMut::new();
        Frame {
            destination: if broadcast {
                packet::ethernet::BROADCAST
            } else {
                message.chaddr
            },
            source: self.options.server_hardware,
            ethertype: ETHERTYPE_IPV4,
            payload: &ip,
        }
        .encode(&mut frame);

        frame.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packet::checksum::{checksum, transport_checksum_v4};
    use packet::dhcp::{MAGIC_COOKIE, MIN_LEN, OPTION_END};

    const CLIENT_MAC: HardwareAddress = [0x02, 0x11, 0x22, 0x33, 0x44, 0x55];
    const SERVER_MAC: HardwareAddress = [0x02, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE];

    fn proxy() -> DhcpProxy {
        let mut proxy = DhcpProxy::new(DhcpProxyOptions {
            server_address: "10.0.0.1".parse().unwrap(),
            server_hardware: SERVER_MAC,
            lease: Duration::from_secs(3600),
            dns_servers: vec!["10.0.0.1".parse().unwrap()],
        });
        proxy.add_entry(CLIENT_MAC, "10.0.0.5".parse().unwrap(), 24);
        proxy
    }

    fn client_frame(message_type: MessageType, xid: u32) -> Vec<u8> {
        let mut bootp = vec![0u8; MIN_LEN];
        bootp[0] = OP_BOOTREQUEST;
        bootp[1] = 1;
        bootp[2] = 6;
        bootp[4..8].copy_from_slice(&xid.to_be_bytes());
        bootp[28..34].copy_from_slice(&CLIENT_MAC);
        bootp[236..240].copy_from_slice(&MAGIC_COOKIE);
        bootp.extend_from_slice(&[OPTION_MESSAGE_TYPE, 1, message_type.to_u8(), OPTION_END]);

        let source = "0.0.0.0".parse().unwrap();
        let destination = "255.255.255.255".parse().unwrap();

        let mut udp = BytesMut::new();
        Datagram {
            source_port: 68,
            destination_port: 67,
            payload: &bootp,
        }
        .encode(source, destination, &mut udp);

        let mut ip = BytesMut::new();
        ipv4::Packet {
            source,
            destination,
            protocol: PROTOCOL_UDP,
            ttl: 64,
            payload: &udp,
        }
        .encode(&mut ip);

        let mut frame = BytesMut::new();
        Frame {
            destination: packet::ethernet::BROADCAST,
            source: CLIENT_MAC,
            ethertype: ETHERTYPE_IPV4,
            payload: &ip,
        }
        .encode(&mut frame);
        frame.to_vec()
    }

    fn parse_reply(reply: &[u8]) -> (u32, Ipv4Addr, Vec<(u8, Vec<u8>)>) {
        let frame = Frame::decode(reply).unwrap();
        let ip = ipv4::Packet::decode(frame.payload).unwrap();

        // Every layer's checksum must hold.
        let header_len = (frame.payload[0] & 0x0F) as usize * 4;
        assert_eq!(checksum(&[&frame.payload[..header_len]]), 0);
        assert_eq!(
            transport_checksum_v4(ip.source, ip.destination, PROTOCOL_UDP, &[ip.payload]),
            0
        );

        let udp = Datagram::decode(ip.payload, Some((ip.source, ip.destination))).unwrap();
        let message = Message::decode(udp.payload).unwrap();
        let options = message
            .options()
            .map(|(code, value)| (code, value.to_vec()))
            .collect();
        (message.xid, message.yiaddr, options)
    }

    #[test]
    fn discover_yields_a_well_formed_offer() {
        let reply = proxy()
            .process_frame(&client_frame(MessageType::Discover, 0xDEADBEEF))
            .unwrap();

        let (xid, yiaddr, options) = parse_reply(&reply);
        assert_eq!(xid, 0xDEADBEEF);
        assert_eq!(yiaddr, "10.0.0.5".parse::<Ipv4Addr>().unwrap());

        let option = |code: u8| {
            options
                .iter()
                .find(|(c, _)| *c == code)
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        assert_eq!(option(OPTION_MESSAGE_TYPE), vec![MessageType::Offer.to_u8()]);
        assert_eq!(option(OPTION_SUBNET_MASK), vec![255, 255, 255, 0]);
        assert_eq!(option(OPTION_SERVER_ID), vec![10, 0, 0, 1]);
        assert_eq!(option(OPTION_LEASE_TIME), 3600u32.to_be_bytes().to_vec());
        assert_eq!(
            option(OPTION_RENEWAL_TIME),
            (3600u32 / 8 * 7).to_be_bytes().to_vec()
        );
        assert_eq!(
            option(OPTION_REBINDING_TIME),
            (3600u32 / 2).to_be_bytes().to_vec()
        );
    }

    #[test]
    fn request_yields_an_ack() {
        let reply = proxy()
            .process_frame(&client_frame(MessageType::Request, 7))
            .unwrap();

        let (xid, yiaddr, options) = parse_reply(&reply);
        assert_eq!(xid, 7);
        assert_eq!(yiaddr, "10.0.0.5".parse::<Ipv4Addr>().unwrap());
        assert!(
            options
                .iter()
                .any(|(c, v)| *c == OPTION_MESSAGE_TYPE && v == &[MessageType::Ack.to_u8()])
        );
    }

    #[test]
    fn release_and_unknown_clients_are_ignored() {
        let proxy = proxy();
        assert!(proxy.process_frame(&client_frame(MessageType::Release, 1)).is_none());
        assert!(proxy.process_frame(&client_frame(MessageType::Inform, 2)).is_none());

        // A discover from a hardware address with no binding is ignored.
        let unbound = DhcpProxy::new(DhcpProxyOptions {
            server_address: "10.0.0.1".parse().unwrap(),
            server_hardware: SERVER_MAC,
            lease: Duration::from_secs(3600),
            dns_servers: Vec::new(),
        });
        assert!(unbound.process_frame(&client_frame(MessageType::Discover, 3)).is_none());
    }
}
