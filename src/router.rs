use std::net::IpAddr;

use ahash::{HashMap, HashMapExt};
use ipnetwork::IpNetwork;
use log::debug;

use packet::{ipv4, ipv6};

use crate::config::RouteScope;
use crate::switch::PortId;

struct RouterPort {
    group: u32,
    routes: Vec<IpNetwork>,
    learned: Vec<IpNetwork>,
}

/// The layer-3 forwarding fabric: every port owns a set of routes and
/// frames follow the longest matching prefix across the union. Ties break
/// by port registration order. Routing between two ports of the same group
/// requires client routing.
pub struct Router {
    client_routing: bool,
    scope: RouteScope,
    maximum_routes: usize,
    ports: HashMap<PortId, RouterPort>,
    order: Vec<PortId>,
}

impl Router {
    pub fn new(client_routing: bool, scope: RouteScope, maximum_routes: usize) -> Self {
        Self {
            client_routing,
            scope,
            maximum_routes,
            ports: HashMap::with_capacity(8),
            order: Vec::new(),
        }
    }

    pub fn register_port(&mut self, id: PortId, group: u32, routes: Vec<IpNetwork>) {
        self.ports.insert(
            id,
            RouterPort {
                group,
                routes,
                learned: Vec::new(),
            },
        );
        self.order.push(id);
    }

    pub fn unregister_port(&mut self, id: PortId) {
        self.ports.remove(&id);
        self.order.retain(|port| *port != id);
    }

    /// Accept a route learned from the peer behind `id`, governed by the
    /// configured scope and limit. Learned routes vanish with their port.
    pub fn learn_route(&mut self, id: PortId, network: IpNetwork) -> bool {
        let Some(port) = self.ports.get_mut(&id) else {
            return false;
        };

        if port.learned.len() >= self.maximum_routes {
            debug!("route limit reached: port={}, network={}", id, network);
            return false;
        }

        let host_route = match network {
            IpNetwork::V4(network) => network.prefix() == 32,
            IpNetwork::V6(network) => network.prefix() == 128,
        };

        let within = |routes: &[IpNetwork]| {
            routes.iter().any(|existing| {
                existing.contains(network.network()) && network.prefix() >= existing.prefix()
            })
        };

        let accepted = match self.scope {
            RouteScope::None => false,
            RouteScope::UnicastInNetwork => host_route && within(&port.routes),
            RouteScope::Unicast => host_route,
            RouteScope::Subnet => within(&port.routes),
            RouteScope::Any => true,
        };

        if accepted {
            port.learned.push(network);
        } else {
            debug!("route refused: port={}, network={}", id, network);
        }

        accepted
    }

    /// Longest-prefix lookup of a destination address.
    fn lookup(&self, destination: IpAddr) -> Option<PortId> {
        let mut best: Option<(u8, PortId)> = None;

        for id in &self.order {
            let Some(port) = self.ports.get(id) else {
                continue;
            };

            for network in port.routes.iter().chain(port.learned.iter()) {
                if !network.contains(destination) {
                    continue;
                }

                // Strictly longer only, so earlier ports win ties.
                if best.map(|(prefix, _)| network.prefix() > prefix).unwrap_or(true) {
                    best = Some((network.prefix(), *id));
                }
            }
        }

        best.map(|(_, id)| id)
    }

    /// Pick the egress port for one IP frame received on `ingress`, or drop
    /// it (no route, unparseable, or isolation).
    pub fn route(&self, ingress: PortId, frame: &[u8]) -> Option<PortId> {
        let destination = match frame.first().map(|byte| byte >> 4) {
            Some(4) => IpAddr::V4(ipv4::Packet::decode(frame).ok()?.destination),
            Some(6) => IpAddr::V6(ipv6::Packet::decode(frame).ok()?.destination),
            _ => return None,
        };

        let egress = self.lookup(destination)?;
        if egress == ingress {
            return None;
        }

        let ingress_group = self.ports.get(&ingress)?.group;
        let egress_group = self.ports.get(&egress)?.group;
        if ingress_group == egress_group && !self.client_routing {
            return None;
        }

        Some(egress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::switch::{ADAPTER_GROUP, ENDPOINT_GROUP};
    use bytes::BytesMut;

    fn v4_frame(destination: &str) -> Vec<u8> {
        let mut bytes = BytesMut::new();
        ipv4::Packet {
            source: "192.168.0.1".parse().unwrap(),
            destination: destination.parse().unwrap(),
            protocol: ipv4::PROTOCOL_UDP,
            ttl: 64,
            payload: &[],
        }
        .encode(&mut bytes);
        bytes.to_vec()
    }

    #[test]
    fn longest_prefix_wins() {
        let mut router = Router::new(false, RouteScope::None, 1);
        router.register_port(
            1,
            ADAPTER_GROUP,
            vec!["10.0.0.0/8".parse().unwrap(), "10.1.0.0/16".parse().unwrap()],
        );
        router.register_port(2, ENDPOINT_GROUP, vec!["10.2.0.0/16".parse().unwrap()]);

        // 10.1.2.3 matches both port-1 routes; the /16 is the decider and
        // it still lives on port 1.
        assert_eq!(router.route(2, &v4_frame("10.1.2.3")), Some(1));
        assert_eq!(router.route(1, &v4_frame("10.2.9.9")), Some(2));
    }

    #[test]
    fn ties_break_by_registration_order() {
        let mut router = Router::new(true, RouteScope::None, 1);
        router.register_port(7, ENDPOINT_GROUP, vec!["10.0.0.0/8".parse().unwrap()]);
        router.register_port(8, ENDPOINT_GROUP, vec!["10.0.0.0/8".parse().unwrap()]);
        router.register_port(1, ADAPTER_GROUP, Vec::new());

        assert_eq!(router.route(1, &v4_frame("10.5.5.5")), Some(7));
    }

    #[test]
    fn unrouted_frames_are_dropped() {
        let mut router = Router::new(false, RouteScope::None, 1);
        router.register_port(1, ADAPTER_GROUP, vec!["10.0.0.0/8".parse().unwrap()]);

        assert_eq!(router.route(1, &v4_frame("172.16.0.1")), None);
        assert_eq!(router.route(1, b"junk"), None);
    }

    #[test]
    fn same_group_requires_client_routing() {
        let mut isolated = Router::new(false, RouteScope::None, 1);
        isolated.register_port(2, ENDPOINT_GROUP, vec!["10.2.0.0/16".parse().unwrap()]);
        isolated.register_port(3, ENDPOINT_GROUP, vec!["10.3.0.0/16".parse().unwrap()]);
        assert_eq!(isolated.route(2, &v4_frame("10.3.0.1")), None);

        let mut open = Router::new(true, RouteScope::None, 1);
        open.register_port(2, ENDPOINT_GROUP, vec!["10.2.0.0/16".parse().unwrap()]);
        open.register_port(3, ENDPOINT_GROUP, vec!["10.3.0.0/16".parse().unwrap()]);
        assert_eq!(open.route(2, &v4_frame("10.3.0.1")), Some(3));
    }

    #[test]
    fn learned_routes_respect_scope_and_limit() {
        let mut router = Router::new(true, RouteScope::UnicastInNetwork, 1);
        router.register_port(2, ENDPOINT_GROUP, vec!["10.2.0.0/16".parse().unwrap()]);

        // Host route inside the port's network: accepted, up to the limit.
        assert!(router.learn_route(2, "10.2.0.9/32".parse().unwrap()));
        assert!(!router.learn_route(2, "10.2.0.10/32".parse().unwrap()));

        // Outside the network or not a host route: refused.
        let mut fresh = Router::new(true, RouteScope::UnicastInNetwork, 8);
        fresh.register_port(2, ENDPOINT_GROUP, vec!["10.2.0.0/16".parse().unwrap()]);
        assert!(!fresh.learn_route(2, "10.9.0.9/32".parse().unwrap()));
        assert!(!fresh.learn_route(2, "10.2.0.0/24".parse().unwrap()));

        let mut subnet = Router::new(true, RouteScope::Subnet, 8);
        subnet.register_port(2, ENDPOINT_GROUP, vec!["10.2.0.0/16".parse().unwrap()]);
        assert!(subnet.learn_route(2, "10.2.4.0/24".parse().unwrap()));
        assert!(!subnet.learn_route(2, "10.9.0.0/24".parse().unwrap()));
    }

    #[test]
    fn learned_routes_are_used_and_vanish_with_the_port() {
        let mut router = Router::new(true, RouteScope::Any, 8);
        router.register_port(1, ADAPTER_GROUP, Vec::new());
        router.register_port(2, ENDPOINT_GROUP, Vec::new());

        assert!(router.learn_route(2, "10.2.0.0/16".parse().unwrap()));
        assert_eq!(router.route(1, &v4_frame("10.2.1.1")), Some(2));

        router.unregister_port(2);
        assert_eq!(router.route(1, &v4_frame("10.2.1.1")), None);
    }
}
