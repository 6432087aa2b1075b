use std::net::Ipv4Addr;

use ahash::{HashMap, HashMapExt};
use bytes::BytesMut;

use packet::HardwareAddress;
use packet::arp::{self, OPERATION_REQUEST};
use packet::ethernet::{ETHERTYPE_ARP, Frame};

type Fallback = Box<dyn Fn(Ipv4Addr) -> Option<HardwareAddress> + Send + Sync>;

/// Answers ARP requests for configured IPv4 addresses on behalf of remote
/// peers, so the kernel can resolve tunnel neighbors without any frame
/// leaving the host.
pub struct ArpProxy {
    entries: HashMap<Ipv4Addr, HardwareAddress>,
    fallback: Option<Fallback>,
}

impl ArpProxy {
    pub fn new() -> Self {
        Self {
            entries: HashMap::with_capacity(16),
            fallback: None,
        }
    }

    pub fn add_entry(&mut self, address: Ipv4Addr, hardware: HardwareAddress) {
        self.entries.insert(address, hardware);
    }

    /// Called for requests that miss the table.
    pub fn set_fallback<F>(&mut self, fallback: F)
    where
        F: Fn(Ipv4Addr) -> Option<HardwareAddress> + Send + Sync + 'static,
    {
        self.fallback = Some(Box::new(fallback));
    }

    fn lookup(&self, address: Ipv4Addr) -> Option<HardwareAddress> {
        if let Some(hardware) = self.entries.get(&address) {
            return Some(*hardware);
        }

        self.fallback.as_ref().and_then(|fallback| fallback(address))
    }

    /// Inspect one Ethernet frame. A returned frame is the finished reply
    /// to write back to the adapter; `None` means the frame passes through
    /// untouched.
    pub fn process_frame(&self, frame: &[u8]) -> Option<Vec<u8>> {
        let parsed = Frame::decode(frame).ok()?;
        if parsed.ethertype != ETHERTYPE_ARP {
            return None;
        }

        let request = arp::Packet::decode(parsed.payload).ok()?;
        if request.operation != OPERATION_REQUEST {
            return None;
        }

        let hardware = self.lookup(request.target_protocol)?;

        let mut payload = BytesMut::new();
        arp::Packet {
            operation: arp::OPERATION_REPLY,
            sender_hardware: hardware,
            sender_protocol: request.target_protocol,
            target_hardware: request.sender_hardware,
            target_protocol: request.sender_protocol,
        }
        .encode(&mut payload);

        let mut reply = BytesMut::new();
        Frame {
            destination: parsed.source,
            source: hardware,
            ethertype: ETHERTYPE_ARP,
            payload: &payload,
        }
        .encode(&mut reply);

        Some(reply.to_vec())
    }
}

impl Default for ArpProxy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUESTER_MAC: HardwareAddress = [2, 0, 0, 0, 0, 1];
    const ANSWER_MAC: HardwareAddress = [2, 0, 0, 0, 0, 2];

    fn request(target: &str) -> Vec<u8> {
        let mut payload = BytesMut::new();
        arp::Packet {
            operation: OPERATION_REQUEST,
            sender_hardware: REQUESTER_MAC,
            sender_protocol: "10.0.0.1".parse().unwrap(),
            target_hardware: [0; 6],
            target_protocol: target.parse().unwrap(),
        }
        .encode(&mut payload);

        let mut frame = BytesMut::new();
        Frame {
            destination: packet::ethernet::BROADCAST,
            source: REQUESTER_MAC,
            ethertype: ETHERTYPE_ARP,
            payload: &payload,
        }
        .encode(&mut frame);
        frame.to_vec()
    }

    #[test]
    fn known_address_is_answered() {
        let mut proxy = ArpProxy::new();
        proxy.add_entry("10.0.0.42".parse().unwrap(), ANSWER_MAC);

        let reply = proxy.process_frame(&request("10.0.0.42")).unwrap();
        let frame = Frame::decode(&reply).unwrap();
        assert_eq!(frame.destination, REQUESTER_MAC);
        assert_eq!(frame.source, ANSWER_MAC);

        let answer = arp::Packet::decode(frame.payload).unwrap();
        assert_eq!(answer.operation, arp::OPERATION_REPLY);
        assert_eq!(answer.sender_hardware, ANSWER_MAC);
        assert_eq!(answer.sender_protocol, "10.0.0.42".parse::<Ipv4Addr>().unwrap());
        assert_eq!(answer.target_hardware, REQUESTER_MAC);
        assert_eq!(answer.target_protocol, "10.0.0.1".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn unknown_address_passes_through() {
        let mut proxy = ArpProxy::new();
        proxy.add_entry("10.0.0.42".parse().unwrap(), ANSWER_MAC);
        assert!(proxy.process_frame(&request("10.0.0.99")).is_none());
    }

    #[test]
    fn fallback_answers_misses() {
        let mut proxy = ArpProxy::new();
        proxy.set_fallback(|address| {
            (address == "10.0.0.99".parse::<Ipv4Addr>().unwrap()).then_some(ANSWER_MAC)
        });

        assert!(proxy.process_frame(&request("10.0.0.99")).is_some());
        assert!(proxy.process_frame(&request("10.0.0.98")).is_none());
    }

    #[test]
    fn replies_pass_through() {
        let mut payload = BytesMut::new();
        arp::Packet {
            operation: arp::OPERATION_REPLY,
            sender_hardware: REQUESTER_MAC,
            sender_protocol: "10.0.0.1".parse().unwrap(),
            target_hardware: ANSWER_MAC,
            target_protocol: "10.0.0.42".parse().unwrap(),
        }
        .encode(&mut payload);

        let mut frame = BytesMut::new();
        Frame {
            destination: ANSWER_MAC,
            source: REQUESTER_MAC,
            ethertype: ETHERTYPE_ARP,
            payload: &payload,
        }
        .encode(&mut frame);

        let mut proxy = ArpProxy::new();
        proxy.add_entry("10.0.0.42".parse().unwrap(), ANSWER_MAC);
        assert!(proxy.process_frame(&frame).is_none());
    }
}
