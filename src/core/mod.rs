//! The orchestrator: owns the forwarding fabric, the adapter channels and
//! the proxies, reacts to engine events, and drives the contact loops. It
//! is the only component that knows both the secure channel and the local
//! network side; they never reference each other directly.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use ahash::{HashMap, HashMapExt};
use ipnetwork::IpNetwork;
use log::{debug, info, warn};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::config::TapMode;
use crate::device::Device;
use crate::observer::CoreEvent;
use crate::proxy::{ArpProxy, DhcpProxy};
use crate::router::Router;
use crate::server::ServerCommand;
use crate::switch::{ADAPTER_GROUP, ENDPOINT_GROUP, PortId, Switch};

/// Channel 0 carries tunnel frames.
const CHANNEL_TUNNEL: u8 = 0;
/// Channel 1 is reserved for inband control messages.
const CHANNEL_CONTROL: u8 = 1;

pub struct CoreOptions {
    pub mode: TapMode,
    pub commands: UnboundedSender<ServerCommand>,
    pub events: UnboundedReceiver<CoreEvent>,
    pub device: Option<Device>,
    pub switch: Switch,
    pub router: Router,
    pub arp_proxy: Option<ArpProxy>,
    pub dhcp_proxy: Option<DhcpProxy>,
    /// Networks attached to the adapter port in TUN mode.
    pub local_routes: Vec<IpNetwork>,
    /// Endpoints greeted on every contact period.
    pub contacts: Vec<String>,
    /// Certificate hashes looked up through peers on every dynamic
    /// contact period.
    pub dynamic_contacts: Vec<[u8; 32]>,
    pub never_contact: Vec<IpNetwork>,
    pub contact_period: Duration,
    pub dynamic_contact_period: Duration,
}

struct Core {
    mode: TapMode,
    commands: UnboundedSender<ServerCommand>,
    switch: Switch,
    router: Router,
    arp_proxy: Option<ArpProxy>,
    dhcp_proxy: Option<DhcpProxy>,
    never_contact: Vec<IpNetwork>,
    ports: HashMap<SocketAddr, PortId>,
    endpoints: HashMap<PortId, SocketAddr>,
    adapter_port: Option<PortId>,
    next_port: PortId,
    outgoing: Option<UnboundedSender<Vec<u8>>>,
}

/// Run the core until the engine side goes away. Resolution of contact
/// hostnames happens inline on each period.
pub async fn run(options: CoreOptions) {
    let CoreOptions {
        mode,
        commands,
        mut events,
        device,
        switch,
        router,
        arp_proxy,
        dhcp_proxy,
        local_routes,
        contacts,
        dynamic_contacts,
        never_contact,
        contact_period,
        dynamic_contact_period,
    } = options;

    let (mut device_in, outgoing) = match device {
        Some(device) => {
            info!(
                "adapter attached: name={}, mtu={}",
                device.info.name, device.info.mtu
            );
            (Some(device.incoming), Some(device.outgoing))
        }
        None => (None, None),
    };

    let mut core = Core {
        mode,
        commands,
        switch,
        router,
        arp_proxy,
        dhcp_proxy,
        never_contact,
        ports: HashMap::with_capacity(16),
        endpoints: HashMap::with_capacity(16),
        adapter_port: None,
        next_port: 1,
        outgoing,
    };

    if device_in.is_some() {
        let id = core.allocate_port();
        core.adapter_port = Some(id);
        match core.mode {
            TapMode::Tun => core.router.register_port(id, ADAPTER_GROUP, local_routes),
            _ => core.switch.register_port(id, ADAPTER_GROUP),
        }
    }

    let mut contact_timer = tokio::time::interval(contact_period);
    let mut dynamic_timer = tokio::time::interval(dynamic_contact_period);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };

                core.handle_event(event);
            }

            frame = read_device(&mut device_in) => {
                let Some(frame) = frame else {
                    device_in = None;
                    continue;
                };

                core.handle_device_frame(frame);
            }

            _ = contact_timer.tick() => {
                core.contact_round(&contacts).await;
            }

            _ = dynamic_timer.tick() => {
                if !dynamic_contacts.is_empty() {
                    let _ = core
                        .commands
                        .send(ServerCommand::BroadcastContactRequest(dynamic_contacts.clone()));
                }
            }
        }
    }

    info!("core stopped");
}

async fn read_device(device: &mut Option<UnboundedReceiver<Vec<u8>>>) -> Option<Vec<u8>> {
    match device {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

impl Core {
    fn allocate_port(&mut self) -> PortId {
        let id = self.next_port;
        self.next_port += 1;
        id
    }

    fn never_contact(&self, addr: SocketAddr) -> bool {
        self.never_contact
            .iter()
            .any(|network| network.contains(addr.ip()))
    }

    fn handle_event(&mut self, event: CoreEvent) {
        match event {
            CoreEvent::SessionEstablished { addr, .. } => {
                // Rekeys keep the existing port.
                if self.ports.contains_key(&addr) {
                    return;
                }

                let id = self.allocate_port();
                self.ports.insert(addr, id);
                self.endpoints.insert(id, addr);
                match self.mode {
                    TapMode::Tun => self.router.register_port(id, ENDPOINT_GROUP, Vec::new()),
                    _ => self.switch.register_port(id, ENDPOINT_GROUP),
                }

                debug!("endpoint port registered: addr={:?}, port={}", addr, id);
            }

            CoreEvent::SessionLost { addr, .. } => {
                let Some(id) = self.ports.remove(&addr) else {
                    return;
                };

                self.endpoints.remove(&id);
                self.switch.unregister_port(id);
                self.router.unregister_port(id);
                debug!("endpoint port unregistered: addr={:?}, port={}", addr, id);
            }

            CoreEvent::Data {
                addr,
                channel: CHANNEL_TUNNEL,
                bytes,
            } => {
                let Some(ingress) = self.ports.get(&addr).copied() else {
                    return;
                };

                self.forward(ingress, &bytes);
            }

            CoreEvent::Data { addr, channel, .. } => {
                if channel == CHANNEL_CONTROL {
                    debug!("control message ignored: addr={:?}", addr);
                } else {
                    debug!(
                        "unclaimed application data: addr={:?}, channel={}",
                        addr, channel
                    );
                }
            }

            CoreEvent::ContactLearned { target, .. } => {
                if self.never_contact(target) {
                    return;
                }

                let _ = self.commands.send(ServerCommand::Greet(target));
            }

            CoreEvent::HelloResponse { .. } => {}
        }
    }

    /// A frame read from the adapter: proxies first, then the fabric.
    fn handle_device_frame(&mut self, frame: Vec<u8>) {
        let Some(ingress) = self.adapter_port else {
            return;
        };

        if self.mode != TapMode::Tun {
            if let Some(reply) = self
                .arp_proxy
                .as_ref()
                .and_then(|proxy| proxy.process_frame(&frame))
            {
                self.write_device(reply);
                return;
            }

            if let Some(reply) = self
                .dhcp_proxy
                .as_ref()
                .and_then(|proxy| proxy.process_frame(&frame))
            {
                self.write_device(reply);
                return;
            }
        }

        self.forward(ingress, &frame);
    }

    /// Run one frame through the switch or router and deliver the verdict.
    fn forward(&mut self, ingress: PortId, frame: &[u8]) {
        let destinations: Vec<PortId> = match self.mode {
            TapMode::Tun => self.router.route(ingress, frame).into_iter().collect(),
            _ => self.switch.process(ingress, frame, Instant::now()),
        };

        for destination in destinations {
            if Some(destination) == self.adapter_port {
                self.write_device(frame.to_vec());
            } else if let Some(addr) = self.endpoints.get(&destination) {
                let _ = self.commands.send(ServerCommand::SendData(
                    *addr,
                    CHANNEL_TUNNEL,
                    frame.to_vec(),
                ));
            }
        }
    }

    fn write_device(&self, frame: Vec<u8>) {
        if let Some(outgoing) = &self.outgoing {
            let _ = outgoing.send(frame);
        }
    }

    /// Greet every configured contact; hostnames resolve fresh each round.
    async fn contact_round(&self, contacts: &[String]) {
        for contact in contacts {
            let resolved = match tokio::net::lookup_host(contact.as_str()).await {
                Ok(mut addrs) => addrs.next(),
                Err(error) => {
                    warn!("contact resolution failed: host={}, err={}", contact, error);
                    continue;
                }
            };

            let Some(addr) = resolved else {
                continue;
            };

            if self.never_contact(addr) {
                continue;
            }

            let _ = self.commands.send(ServerCommand::Greet(addr));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RouteScope, SwitchMode};
    use tokio::sync::mpsc::unbounded_channel;

    fn core(mode: TapMode) -> (Core, UnboundedReceiver<ServerCommand>) {
        let (commands, commands_rx) = unbounded_channel();
        let mut core = Core {
            mode,
            commands,
            switch: Switch::new(SwitchMode::Switch, false),
            router: Router::new(false, RouteScope::None, 1),
            arp_proxy: None,
            dhcp_proxy: None,
            never_contact: vec!["192.0.2.0/24".parse().unwrap()],
            ports: HashMap::new(),
            endpoints: HashMap::new(),
            adapter_port: None,
            next_port: 1,
            outgoing: None,
        };

        let adapter = core.allocate_port();
        core.adapter_port = Some(adapter);
        match mode {
            TapMode::Tun => core.router.register_port(
                adapter,
                ADAPTER_GROUP,
                vec!["10.0.0.0/8".parse().unwrap()],
            ),
            _ => core.switch.register_port(adapter, ADAPTER_GROUP),
        }

        (core, commands_rx)
    }

    fn established(core: &mut Core, addr: SocketAddr) {
        core.handle_event(CoreEvent::SessionEstablished {
            addr,
            is_new: true,
        });
    }

    #[test]
    fn session_lifecycle_registers_and_removes_ports() {
        let (mut core, _commands) = core(TapMode::Tap);
        let peer: SocketAddr = "127.0.0.1:12001".parse().unwrap();

        established(&mut core, peer);
        assert!(core.ports.contains_key(&peer));

        core.handle_event(CoreEvent::SessionLost {
            addr: peer,
            reason: service::SessionLoss::Timeout,
        });
        assert!(!core.ports.contains_key(&peer));
    }

    #[test]
    fn peer_frames_reach_the_adapter_path() {
        let (mut core, mut commands) = core(TapMode::Tun);
        let peer: SocketAddr = "127.0.0.1:12001".parse().unwrap();
        established(&mut core, peer);

        // A frame from the peer routed towards the adapter: no adapter
        // channel attached here, so it just must not bounce back to a peer.
        let mut bytes = bytes::BytesMut::new();
        packet::ipv4::Packet {
            source: "10.9.0.1".parse().unwrap(),
            destination: "10.0.0.7".parse().unwrap(),
            protocol: packet::ipv4::PROTOCOL_UDP,
            ttl: 64,
            payload: &[],
        }
        .encode(&mut bytes);

        core.handle_event(CoreEvent::Data {
            addr: peer,
            channel: CHANNEL_TUNNEL,
            bytes: bytes.to_vec(),
        });

        assert!(commands.try_recv().is_err());
    }

    #[test]
    fn learned_contacts_are_greeted_unless_banned() {
        let (mut core, mut commands) = core(TapMode::Tap);

        core.handle_event(CoreEvent::ContactLearned {
            addr: "127.0.0.1:12001".parse().unwrap(),
            hash: [0; 32],
            target: "127.0.0.1:12002".parse().unwrap(),
        });
        assert!(matches!(
            commands.try_recv(),
            Ok(ServerCommand::Greet(addr)) if addr == "127.0.0.1:12002".parse().unwrap()
        ));

        core.handle_event(CoreEvent::ContactLearned {
            addr: "127.0.0.1:12001".parse().unwrap(),
            hash: [0; 32],
            target: "192.0.2.7:12000".parse().unwrap(),
        });
        assert!(commands.try_recv().is_err());
    }
}
