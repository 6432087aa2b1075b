use std::time::{Duration, Instant};

use ahash::{HashMap, HashMapExt};
use packet::HardwareAddress;
use packet::ethernet::Frame;

use crate::config::SwitchMode;

/// A logical attachment point: the local adapter or one live peer.
pub type PortId = u32;

/// Ports whose frames come from the local adapter.
pub const ADAPTER_GROUP: u32 = 0;
/// Ports backed by remote peer sessions.
pub const ENDPOINT_GROUP: u32 = 1;

/// Learning-table entries older than this are evicted when touched.
const AGING_TIMEOUT: Duration = Duration::from_secs(300);

struct Port {
    group: u32,
}

/// The layer-2 forwarding fabric: a port registry plus a MAC learning
/// table. In `switch` mode frames go to the learned port and are flooded
/// otherwise; in `hub` mode every frame is flooded. Forwarding between two
/// ports of the same group is refused unless relay mode is on.
pub struct Switch {
    mode: SwitchMode,
    relay: bool,
    ports: HashMap<PortId, Port>,
    table: HashMap<HardwareAddress, (PortId, Instant)>,
}

impl Switch {
    pub fn new(mode: SwitchMode, relay: bool) -> Self {
        Self {
            mode,
            relay,
            ports: HashMap::with_capacity(8),
            table: HashMap::with_capacity(64),
        }
    }

    pub fn register_port(&mut self, id: PortId, group: u32) {
        self.ports.insert(id, Port { group });
    }

    pub fn unregister_port(&mut self, id: PortId) {
        self.ports.remove(&id);
        self.table.retain(|_, (port, _)| *port != id);
    }

    fn eligible(&self, ingress_group: u32, port: &Port) -> bool {
        self.relay || port.group != ingress_group
    }

    /// Learn the source address and pick the destination ports for one
    /// frame. The frame itself is not interpreted beyond its Ethernet
    /// header; delivery is the caller's business.
    pub fn process(&mut self, ingress: PortId, frame: &[u8], now: Instant) -> Vec<PortId> {
        let Ok(parsed) = Frame::decode(frame) else {
            return Vec::new();
        };

        let Some(ingress_group) = self.ports.get(&ingress).map(|port| port.group) else {
            return Vec::new();
        };

        // Unicast sources only; flooded garbage must not poison the table.
        if parsed.source[0] & 0x01 == 0 {
            self.table.insert(parsed.source, (ingress, now));
        }

        if self.mode == SwitchMode::Switch && !parsed.is_broadcast() {
            match self.table.get(&parsed.destination).copied() {
                Some((_, seen)) if now.duration_since(seen) >= AGING_TIMEOUT => {
                    self.table.remove(&parsed.destination);
                }
                Some((port, _)) if port == ingress => return Vec::new(),
                Some((port, _)) => {
                    let eligible = self
                        .ports
                        .get(&port)
                        .map(|p| self.eligible(ingress_group, p))
                        .unwrap_or(false);
                    return if eligible { vec![port] } else { Vec::new() };
                }
                None => {}
            }
        }

        self.ports
            .iter()
            .filter(|(id, port)| **id != ingress && self.eligible(ingress_group, port))
            .map(|(id, _)| *id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use packet::ethernet::ETHERTYPE_IPV4;

    fn frame(destination: HardwareAddress, source: HardwareAddress) -> Vec<u8> {
        let mut bytes = BytesMut::new();
        Frame {
            destination,
            source,
            ethertype: ETHERTYPE_IPV4,
            payload: &[0u8; 20],
        }
        .encode(&mut bytes);
        bytes.to_vec()
    }

    const MAC_A: HardwareAddress = [2, 0, 0, 0, 0, 0xA];
    const MAC_B: HardwareAddress = [2, 0, 0, 0, 0, 0xB];
    const BROADCAST: HardwareAddress = [0xFF; 6];

    fn switch() -> Switch {
        let mut switch = Switch::new(SwitchMode::Switch, false);
        switch.register_port(1, ADAPTER_GROUP);
        switch.register_port(2, ENDPOINT_GROUP);
        switch.register_port(3, ENDPOINT_GROUP);
        switch
    }

    #[test]
    fn unknown_destination_floods_other_groups() {
        let mut switch = switch();
        let now = Instant::now();

        let out = switch.process(1, &frame(MAC_B, MAC_A), now);
        assert_eq!({ let mut o = out; o.sort(); o }, vec![2, 3]);
    }

    #[test]
    fn learned_destination_is_unicast() {
        let mut switch = switch();
        let now = Instant::now();

        // B talks first through port 2; the reply goes only there.
        switch.process(2, &frame(MAC_A, MAC_B), now);
        let out = switch.process(1, &frame(MAC_B, MAC_A), now);
        assert_eq!(out, vec![2]);
    }

    #[test]
    fn stale_entries_are_evicted_on_access() {
        let mut switch = switch();
        let now = Instant::now();

        switch.process(2, &frame(MAC_A, MAC_B), now);
        let later = now + AGING_TIMEOUT + Duration::from_secs(1);
        let out = switch.process(1, &frame(MAC_B, MAC_A), later);
        assert_eq!({ let mut o = out; o.sort(); o }, vec![2, 3]);
    }

    #[test]
    fn endpoint_to_endpoint_needs_relay() {
        let mut switch = switch();
        let now = Instant::now();

        // Learned behind endpoint port 3, frame arriving on endpoint
        // port 2: suppressed without relay mode.
        switch.process(3, &frame(MAC_A, MAC_B), now);
        assert!(switch.process(2, &frame(MAC_B, MAC_A), now).is_empty());

        let mut relaying = Switch::new(SwitchMode::Switch, true);
        relaying.register_port(2, ENDPOINT_GROUP);
        relaying.register_port(3, ENDPOINT_GROUP);
        relaying.process(3, &frame(MAC_A, MAC_B), now);
        assert_eq!(relaying.process(2, &frame(MAC_B, MAC_A), now), vec![3]);
    }

    #[test]
    fn broadcast_floods_and_never_echoes() {
        let mut switch = switch();
        let now = Instant::now();

        let out = switch.process(2, &frame(BROADCAST, MAC_B), now);
        // Port 2 is excluded, port 3 is same-group without relay.
        assert_eq!(out, vec![1]);
    }

    #[test]
    fn hub_mode_always_floods() {
        let mut hub = Switch::new(SwitchMode::Hub, false);
        hub.register_port(1, ADAPTER_GROUP);
        hub.register_port(2, ENDPOINT_GROUP);
        hub.register_port(3, ENDPOINT_GROUP);
        let now = Instant::now();

        hub.process(2, &frame(MAC_A, MAC_B), now);
        let out = hub.process(1, &frame(MAC_B, MAC_A), now);
        assert_eq!({ let mut o = out; o.sort(); o }, vec![2, 3]);
    }

    #[test]
    fn unregistering_purges_learned_entries() {
        let mut switch = switch();
        let now = Instant::now();

        switch.process(2, &frame(MAC_A, MAC_B), now);
        switch.unregister_port(2);
        let out = switch.process(1, &frame(MAC_B, MAC_A), now);
        assert_eq!(out, vec![3]);
    }
}
