use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Result;

use codec::crypto::{SigningKey, pkcs8::DecodePrivateKey};
use fscpd_service::{
    CipherSuite, EllipticCurve, PeerState, Service, ServiceHandler, ServiceOptions, SessionLoss,
    Timers,
    identity::Identity,
    validate::Validator,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    HelloResponse(SocketAddr),
    Established(SocketAddr, bool),
    Failed(SocketAddr),
    Lost(SocketAddr, SessionLoss),
    Data(SocketAddr, u8, Vec<u8>),
    Contact(SocketAddr, [u8; 32], SocketAddr),
}

#[derive(Default)]
struct Recorder(Mutex<Vec<Event>>);

impl Recorder {
    fn take(&self) -> Vec<Event> {
        std::mem::take(&mut self.0.lock().unwrap())
    }

    fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }
}

impl ServiceHandler for Recorder {
    fn on_hello_response(&self, addr: SocketAddr, _rtt: Duration) {
        self.push(Event::HelloResponse(addr));
    }

    fn on_session_established(
        &self,
        addr: SocketAddr,
        is_new: bool,
        _suite: CipherSuite,
        _curve: EllipticCurve,
    ) {
        self.push(Event::Established(addr, is_new));
    }

    fn on_session_failed(&self, addr: SocketAddr, _is_new: bool) {
        self.push(Event::Failed(addr));
    }

    fn on_session_lost(&self, addr: SocketAddr, reason: SessionLoss) {
        self.push(Event::Lost(addr, reason));
    }

    fn on_data(&self, addr: SocketAddr, channel: u8, bytes: &[u8]) {
        self.push(Event::Data(addr, channel, bytes.to_vec()));
    }

    fn on_contact(&self, addr: SocketAddr, hash: [u8; 32], target: SocketAddr) {
        self.push(Event::Contact(addr, hash, target));
    }
}

fn identity(name: &str) -> Result<Identity> {
    let generated = rcgen::generate_simple_self_signed(vec![name.to_string()])?;
    let key = SigningKey::from_pkcs8_der(&generated.key_pair.serialize_der())?;
    Ok(Identity::new(generated.cert.der().to_vec(), key)?)
}

struct Node {
    addr: SocketAddr,
    service: Service<Recorder>,
}

impl Node {
    fn new(port: u16, timers: Timers) -> Result<Self> {
        let addr: SocketAddr = format!("127.0.0.1:{}", port).parse()?;
        let mut options = ServiceOptions::new(
            identity(&format!("node-{}", port))?,
            Validator::open(),
            Recorder::default(),
        );
        options.timers = timers;

        Ok(Self {
            addr,
            service: Service::new(options),
        })
    }
}

/// Deliver every queued datagram until the network is quiet.
fn pump(nodes: &mut [Node], now: Instant) {
    loop {
        let mut quiet = true;
        let addrs: Vec<SocketAddr> = nodes.iter().map(|n| n.addr).collect();

        for i in 0..nodes.len() {
            while let Some(transmit) = nodes[i].service.poll_transmit() {
                quiet = false;
                let Some(j) = addrs.iter().position(|a| *a == transmit.destination) else {
                    continue;
                };

                let _ = nodes[j]
                    .service
                    .route(&transmit.bytes, addrs[i], now);
            }
        }

        if quiet {
            break;
        }
    }
}

fn short_timers() -> Timers {
    Timers {
        hello_timeout: Duration::from_millis(200),
        session_timeout: Duration::from_millis(500),
        idle_timeout: Duration::from_secs(5),
        keepalive_period: Duration::from_secs(1),
        rekey_grace: Duration::from_secs(1),
        session_max_age: Duration::from_secs(3600),
        session_max_bytes: 1 << 30,
    }
}

#[test]
fn two_peer_session_and_data() -> Result<()> {
    let now = Instant::now();
    let mut nodes = vec![
        Node::new(12000, short_timers())?,
        Node::new(12001, short_timers())?,
    ];

    let bob = nodes[1].addr;
    let alice = nodes[0].addr;
    nodes[0].service.greet(bob, now)?;
    pump(&mut nodes, now);

    assert_eq!(nodes[0].service.peer_state(bob), PeerState::SessionEstablished);
    assert_eq!(nodes[1].service.peer_state(alice), PeerState::SessionEstablished);

    // Both sides agreed on the same parameters, the receiver's first
    // preference.
    assert_eq!(
        nodes[0].service.session_parameters(bob),
        Some((CipherSuite::Aes128GcmSha256, EllipticCurve::Secp256r1))
    );
    assert_eq!(
        nodes[0].service.session_parameters(bob),
        nodes[1].service.session_parameters(alice),
    );

    let events = nodes[0].service.handler().take();
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, Event::Established(_, true)))
            .count(),
        1
    );

    nodes[0]
        .service
        .send_data(bob, 3, b"Hello you !", now)?;
    pump(&mut nodes, now);

    let events = nodes[1].service.handler().take();
    let data: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, Event::Data(_, _, _)))
        .collect();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0], &Event::Data(alice, 3, b"Hello you !".to_vec()));
    Ok(())
}

#[test]
fn greeting_twice_coalesces() -> Result<()> {
    let now = Instant::now();
    let mut nodes = vec![
        Node::new(12010, short_timers())?,
        Node::new(12011, short_timers())?,
    ];

    let bob = nodes[1].addr;
    nodes[0].service.greet(bob, now)?;
    nodes[0].service.greet(bob, now)?;
    pump(&mut nodes, now);

    let established: Vec<_> = nodes[0]
        .service
        .handler()
        .take()
        .into_iter()
        .filter(|e| matches!(e, Event::Established(_, _)))
        .collect();
    assert_eq!(established.len(), 1);
    Ok(())
}

#[test]
fn replayed_data_is_dropped() -> Result<()> {
    let now = Instant::now();
    let mut nodes = vec![
        Node::new(12020, short_timers())?,
        Node::new(12021, short_timers())?,
    ];

    let alice = nodes[0].addr;
    let bob = nodes[1].addr;
    nodes[0].service.greet(bob, now)?;
    pump(&mut nodes, now);
    nodes[1].service.handler().take();

    nodes[0].service.send_data(bob, 2, b"once", now)?;
    let transmit = nodes[0].service.poll_transmit().expect("a data message");

    // First delivery passes, the replay does not.
    nodes[1].service.route(&transmit.bytes, alice, now)?;
    assert!(nodes[1].service.route(&transmit.bytes, alice, now).is_err());

    let data: Vec<_> = nodes[1]
        .service
        .handler()
        .take()
        .into_iter()
        .filter(|e| matches!(e, Event::Data(_, _, _)))
        .collect();
    assert_eq!(data.len(), 1);
    Ok(())
}

#[test]
fn three_peer_rendezvous() -> Result<()> {
    let now = Instant::now();
    let mut nodes = vec![
        Node::new(12030, short_timers())?, // alice
        Node::new(12031, short_timers())?, // bob
        Node::new(12032, short_timers())?, // chris
    ];

    let (bob, chris) = (nodes[1].addr, nodes[2].addr);
    nodes[0].service.greet(bob, now)?;
    nodes[2].service.greet(bob, now)?;
    pump(&mut nodes, now);

    assert_eq!(nodes[1].service.established().len(), 2);

    // Bob learned chris's certificate from its presentation; alice asks for
    // it by hash.
    let chris_hash = nodes[2].service.local_hash();
    nodes[0]
        .service
        .send_contact_request(bob, &[chris_hash], now)?;
    pump(&mut nodes, now);

    let contacts: Vec<_> = nodes[0]
        .service
        .handler()
        .take()
        .into_iter()
        .filter_map(|e| match e {
            Event::Contact(from, hash, target) => Some((from, hash, target)),
            _ => None,
        })
        .collect();
    assert_eq!(contacts, vec![(bob, chris_hash, chris)]);

    // The daemon reacts to the contact by greeting the endpoint.
    nodes[0].service.greet(chris, now)?;
    pump(&mut nodes, now);
    assert_eq!(nodes[0].service.peer_state(chris), PeerState::SessionEstablished);
    Ok(())
}

#[test]
fn negotiation_failure_times_out() -> Result<()> {
    let now = Instant::now();
    let mut nodes = vec![
        Node::new(12040, short_timers())?,
        Node::new(12041, short_timers())?,
    ];

    nodes[0].service = {
        let mut options = ServiceOptions::new(
            identity("node-12040")?,
            Validator::open(),
            Recorder::default(),
        );
        options.timers = short_timers();
        options.cipher_suites = vec![CipherSuite::Aes128GcmSha256];
        Service::new(options)
    };
    nodes[1].service = {
        let mut options = ServiceOptions::new(
            identity("node-12041")?,
            Validator::open(),
            Recorder::default(),
        );
        options.timers = short_timers();
        options.cipher_suites = vec![CipherSuite::ChaCha20Poly1305Sha256];
        Service::new(options)
    };

    let bob = nodes[1].addr;
    nodes[0].service.greet(bob, now)?;
    pump(&mut nodes, now);

    assert_ne!(nodes[0].service.peer_state(bob), PeerState::SessionEstablished);

    // Whoever sent the request eventually reports the failure.
    let later = now + Duration::from_secs(2);
    nodes[0].service.tick(later);
    nodes[1].service.tick(later);
    pump(&mut nodes, later);

    let failed_somewhere = nodes
        .iter()
        .any(|node| {
            node.service
                .handler()
                .0
                .lock()
                .unwrap()
                .iter()
                .any(|e| matches!(e, Event::Failed(_)))
        });
    assert!(failed_somewhere);
    Ok(())
}

#[test]
fn rekey_replaces_keys_and_data_still_flows() -> Result<()> {
    let mut timers = short_timers();
    timers.session_max_age = Duration::from_secs(8);
    timers.idle_timeout = Duration::from_secs(60);

    let now = Instant::now();
    let mut nodes = vec![Node::new(12050, timers)?, Node::new(12051, timers)?];

    let (alice, bob) = (nodes[0].addr, nodes[1].addr);
    nodes[0].service.greet(bob, now)?;
    pump(&mut nodes, now);
    nodes[0].service.handler().take();
    nodes[1].service.handler().take();

    // Past 7/8 of the maximum age both sides are willing to rekey.
    let later = now + Duration::from_secs(7);
    nodes[0].service.tick(later);
    pump(&mut nodes, later);

    let renewed: Vec<_> = nodes[0]
        .service
        .handler()
        .take()
        .into_iter()
        .filter(|e| matches!(e, Event::Established(_, false)))
        .collect();
    assert_eq!(renewed.len(), 1);

    nodes[0].service.send_data(bob, 0, b"after rekey", later)?;
    pump(&mut nodes, later);
    let data: Vec<_> = nodes[1]
        .service
        .handler()
        .take()
        .into_iter()
        .filter(|e| matches!(e, Event::Data(_, _, _)))
        .collect();
    assert_eq!(data, vec![Event::Data(alice, 0, b"after rekey".to_vec())]);
    Ok(())
}

#[test]
fn close_notifies_established_peers() -> Result<()> {
    let now = Instant::now();
    let mut nodes = vec![
        Node::new(12060, short_timers())?,
        Node::new(12061, short_timers())?,
    ];

    let (alice, bob) = (nodes[0].addr, nodes[1].addr);
    nodes[0].service.greet(bob, now)?;
    pump(&mut nodes, now);
    nodes[1].service.handler().take();

    nodes[0].service.close(now);
    pump(&mut nodes, now);

    let lost: Vec<_> = nodes[1]
        .service
        .handler()
        .take()
        .into_iter()
        .filter(|e| matches!(e, Event::Lost(_, SessionLoss::Closed)))
        .collect();
    assert_eq!(lost, vec![Event::Lost(alice, SessionLoss::Closed)]);
    Ok(())
}

#[test]
fn repeated_violations_tear_the_session_down() -> Result<()> {
    let now = Instant::now();
    let mut nodes = vec![
        Node::new(12070, short_timers())?,
        Node::new(12071, short_timers())?,
    ];

    let (alice, bob) = (nodes[0].addr, nodes[1].addr);
    nodes[0].service.greet(bob, now)?;
    pump(&mut nodes, now);
    nodes[1].service.handler().take();

    // A DATA message whose ciphertext was flipped fails authentication;
    // three of those in a row count as a hostile peer.
    nodes[0].service.send_data(bob, 0, b"payload", now)?;
    let transmit = nodes[0].service.poll_transmit().expect("a data message");
    let mut corrupted = transmit.bytes.clone();
    let last = corrupted.len() - 1;
    corrupted[last] ^= 0xFF;

    for _ in 0..3 {
        assert!(nodes[1].service.route(&corrupted, alice, now).is_err());
    }

    let lost: Vec<_> = nodes[1]
        .service
        .handler()
        .take()
        .into_iter()
        .filter(|e| matches!(e, Event::Lost(_, SessionLoss::Error)))
        .collect();
    assert_eq!(lost.len(), 1);
    assert_ne!(nodes[1].service.peer_state(alice), PeerState::SessionEstablished);
    Ok(())
}

struct DenyHello(Recorder);

impl ServiceHandler for DenyHello {
    fn on_hello(&self, _addr: SocketAddr) -> bool {
        false
    }

    fn on_session_established(
        &self,
        addr: SocketAddr,
        is_new: bool,
        _suite: CipherSuite,
        _curve: EllipticCurve,
    ) {
        self.0.push(Event::Established(addr, is_new));
    }
}

#[test]
fn refused_hellos_never_negotiate() -> Result<()> {
    let now = Instant::now();
    let mut alice = Node::new(12080, short_timers())?;

    let mut bob_service = {
        let mut options = ServiceOptions::new(
            identity("node-12081")?,
            Validator::open(),
            DenyHello(Recorder::default()),
        );
        options.timers = short_timers();
        Service::new(options)
    };
    let bob: SocketAddr = "127.0.0.1:12081".parse()?;

    alice.service.greet(bob, now)?;

    // Deliver by hand since the peers have different handler types.
    while let Some(transmit) = alice.service.poll_transmit() {
        let _ = bob_service.route(&transmit.bytes, alice.addr, now);
    }

    // The refused hello produced nothing to send back.
    assert!(bob_service.poll_transmit().is_none());

    // The requester's hello eventually times out.
    alice.service.tick(now + Duration::from_secs(1));
    assert_ne!(alice.service.peer_state(bob), PeerState::SessionEstablished);
    assert!(bob_service.handler().0.take().is_empty());
    Ok(())
}

#[test]
fn banned_endpoints_are_invisible() -> Result<()> {
    let now = Instant::now();
    let mut options = ServiceOptions::new(
        identity("banned-test")?,
        Validator::open(),
        Recorder::default(),
    );
    options.banned_networks = vec!["10.0.0.0/8".parse()?];
    let mut service = Service::new(options);

    let banned: SocketAddr = "10.1.2.3:12000".parse()?;
    assert!(service.greet(banned, now).is_err());
    assert!(service.route(&[0x03, 0x00, 0x00, 0x04, 0, 0, 0, 1], banned, now).is_err());
    assert!(service.poll_transmit().is_none());
    Ok(())
}
