//! ## FSCP engine
//!
//! The sans-io heart of the secure channel: per-peer handshake and session
//! state, message protection, replay windows and the contact rendezvous
//! logic. The engine owns no socket; callers feed received datagrams into
//! [`Service::route`], drive time with [`Service::tick`] and drain outgoing
//! datagrams with [`Service::poll_transmit`]. Every externally visible event
//! is surfaced through the [`ServiceHandler`] callbacks.

pub mod identity;
pub mod validate;

mod replay;
mod route;
mod session;

pub use replay::{ReplayWindow, WINDOW};
pub use session::{PeerState, PresentationStatus, SessionLoss};

pub use codec::crypto::{CipherSuite, EllipticCurve};

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use ahash::{HashMap, HashMapExt};
use bytes::BytesMut;
use ipnetwork::IpNetwork;

use crate::identity::Identity;
use crate::session::{Peer, PendingHello};
use crate::validate::{ValidationError, Validator};

use codec::message::{Hello, Kind, Presentation, SessionRequest};

/// Number of data channels. Channel 0 carries tunnel frames, channel 1
/// inband control; 2..7 are free for the application.
pub const CHANNEL_COUNT: u8 = 8;

#[derive(Debug)]
pub enum Error {
    /// The service was closed; no further operations are accepted.
    Closed,
    /// The endpoint lies inside a banned network.
    BannedEndpoint,
    /// The operation needs an established session and there is none.
    NoSession,
    /// Data channels are 0..8.
    InvalidChannel,
    /// An outstanding HELLO_REQUEST expired unanswered.
    HelloTimeout,
    /// No common cipher suite or elliptic curve with the peer.
    NegotiationFailed,
    Validation(ValidationError),
    Codec(codec::Error),
    /// A message was dropped for violating the protocol; the payload names
    /// the reason.
    Violation(&'static str),
    /// Silently discarded traffic (unknown types, unmatched responses).
    Ignored,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<codec::Error> for Error {
    fn from(value: codec::Error) -> Self {
        Self::Codec(value)
    }
}

impl From<ValidationError> for Error {
    fn from(value: ValidationError) -> Self {
        Self::Validation(value)
    }
}

/// One datagram ready to be written to the socket.
#[derive(Debug)]
pub struct Transmit {
    pub destination: SocketAddr,
    pub bytes: Vec<u8>,
}

/// Event callbacks. Handlers run synchronously inside the engine and must
/// not call back into it; forward work through a channel instead.
#[allow(unused_variables)]
pub trait ServiceHandler: Send {
    /// An incoming HELLO_REQUEST; return `false` to ignore the sender.
    fn on_hello(&self, addr: SocketAddr) -> bool {
        true
    }

    /// A HELLO_RESPONSE matched an outstanding request.
    fn on_hello_response(&self, addr: SocketAddr, rtt: Duration) {}

    /// A certificate was presented (and passed validation); return `false`
    /// to refuse the peer anyway.
    fn on_presentation(
        &self,
        addr: SocketAddr,
        certificate: &[u8],
        status: PresentationStatus,
    ) -> bool {
        true
    }

    /// An incoming SESSION_REQUEST with the peer's capability lists.
    fn on_session_request(
        &self,
        addr: SocketAddr,
        suites: &[CipherSuite],
        curves: &[EllipticCurve],
    ) -> bool {
        true
    }

    /// An incoming SESSION carrying the chosen parameters.
    fn on_session(&self, addr: SocketAddr, suite: CipherSuite, curve: EllipticCurve) -> bool {
        true
    }

    fn on_session_established(
        &self,
        addr: SocketAddr,
        is_new: bool,
        suite: CipherSuite,
        curve: EllipticCurve,
    ) {
    }

    fn on_session_failed(&self, addr: SocketAddr, is_new: bool) {}

    fn on_session_lost(&self, addr: SocketAddr, reason: SessionLoss) {}

    fn on_data(&self, addr: SocketAddr, channel: u8, bytes: &[u8]) {}

    /// A peer asked where `hash` is reachable and `target` is our answer;
    /// return `false` to withhold it.
    fn on_contact_request(&self, addr: SocketAddr, hash: &[u8; 32], target: SocketAddr) -> bool {
        true
    }

    /// A peer told us `hash` is reachable at `target`.
    fn on_contact(&self, addr: SocketAddr, hash: [u8; 32], target: SocketAddr) {}

    fn on_error(&self, addr: SocketAddr, error: &Error) {}
}

/// Protocol timers. The defaults match the daemon's wire behavior; tests
/// shrink them.
#[derive(Debug, Clone, Copy)]
pub struct Timers {
    pub hello_timeout: Duration,
    /// From SESSION_REQUEST to an established session.
    pub session_timeout: Duration,
    /// No valid traffic for this long loses the session.
    pub idle_timeout: Duration,
    pub keepalive_period: Duration,
    /// How long frames keyed under a replaced session still open.
    pub rekey_grace: Duration,
    pub session_max_age: Duration,
    pub session_max_bytes: u64,
}

impl Default for Timers {
    fn default() -> Self {
        Self {
            hello_timeout: Duration::from_secs(3),
            session_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
            keepalive_period: Duration::from_secs(10),
            rekey_grace: Duration::from_secs(1),
            session_max_age: Duration::from_secs(3600),
            session_max_bytes: 1 << 30,
        }
    }
}

pub struct ServiceOptions<H> {
    pub identity: Identity,
    pub validator: Validator,
    /// Ordered preference list; defaults to every known suite.
    pub cipher_suites: Vec<CipherSuite>,
    pub elliptic_curves: Vec<EllipticCurve>,
    pub timers: Timers,
    /// Endpoints inside these networks are invisible: inbound traffic is
    /// dropped and they are never greeted or handed out in contacts.
    pub banned_networks: Vec<IpNetwork>,
    pub handler: H,
}

impl<H> ServiceOptions<H> {
    pub fn new(identity: Identity, validator: Validator, handler: H) -> Self {
        Self {
            identity,
            validator,
            cipher_suites: vec![
                CipherSuite::Aes128GcmSha256,
                CipherSuite::Aes256GcmSha384,
                CipherSuite::ChaCha20Poly1305Sha256,
            ],
            elliptic_curves: vec![EllipticCurve::Secp256r1, EllipticCurve::X25519],
            timers: Timers::default(),
            banned_networks: Vec::new(),
            handler,
        }
    }
}

/// The FSCP service: one instance per UDP socket, every peer multiplexed
/// by endpoint.
pub struct Service<H> {
    pub(crate) identity: Identity,
    pub(crate) validator: Validator,
    pub(crate) suites: Vec<CipherSuite>,
    pub(crate) curves: Vec<EllipticCurve>,
    pub(crate) timers: Timers,
    pub(crate) banned: Vec<IpNetwork>,
    pub(crate) handler: H,
    pub(crate) peers: HashMap<SocketAddr, Peer>,
    pub(crate) hello_counter: u32,
    pub(crate) queue: VecDeque<Transmit>,
    pub(crate) closed: bool,
}

impl<H: ServiceHandler> Service<H> {
    pub fn new(options: ServiceOptions<H>) -> Self {
        Self {
            identity: options.identity,
            validator: options.validator,
            suites: options.cipher_suites,
            curves: options.elliptic_curves,
            timers: options.timers,
            banned: options.banned_networks,
            handler: options.handler,
            peers: HashMap::with_capacity(64),
            hello_counter: 0,
            queue: VecDeque::new(),
            closed: false,
        }
    }

    /// SHA-256 of our own certificate.
    pub fn local_hash(&self) -> [u8; 32] {
        *self.identity.hash()
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// The observable state of one endpoint.
    pub fn peer_state(&self, addr: SocketAddr) -> PeerState {
        self.peers
            .get(&addr)
            .map(|peer| peer.state())
            .unwrap_or(PeerState::Unknown)
    }

    /// The negotiated parameters of the current session with `addr`.
    pub fn session_parameters(&self, addr: SocketAddr) -> Option<(CipherSuite, EllipticCurve)> {
        self.peers
            .get(&addr)
            .and_then(|peer| peer.current.as_ref())
            .map(|session| (session.suite, session.curve))
    }

    /// Endpoints with an established session.
    pub fn established(&self) -> Vec<SocketAddr> {
        self.peers
            .iter()
            .filter(|(_, peer)| peer.current.is_some())
            .map(|(addr, _)| *addr)
            .collect()
    }

    /// The next datagram to put on the wire.
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.queue.pop_front()
    }

    pub(crate) fn is_banned(&self, ip: IpAddr) -> bool {
        self.banned.iter().any(|network| network.contains(ip))
    }

    /// Send a HELLO_REQUEST. A second call while one is outstanding
    /// coalesces into the pending request.
    pub fn greet(&mut self, addr: SocketAddr, now: Instant) -> Result<(), Error> {
        if self.closed {
            return Err(Error::Closed);
        }

        if self.is_banned(addr.ip()) {
            return Err(Error::BannedEndpoint);
        }

        let hello_timeout = self.timers.hello_timeout;
        self.hello_counter = self.hello_counter.wrapping_add(1);
        let request_id = self.hello_counter;

        let peer = self.peers.entry(addr).or_insert_with(|| Peer::new(now));
        if peer.pending_hello.is_some() {
            return Ok(());
        }

        peer.pending_hello = Some(PendingHello {
            request_id,
            sent_at: now,
            deadline: now + hello_timeout,
        });

        let mut bytes = BytesMut::new();
        Hello { request_id }.encode(Kind::HelloRequest, &mut bytes);
        self.queue.push_back(Transmit {
            destination: addr,
            bytes: bytes.to_vec(),
        });

        Ok(())
    }

    /// Send our PRESENTATION to an endpoint.
    pub fn introduce_to(&mut self, addr: SocketAddr, now: Instant) -> Result<(), Error> {
        if self.closed {
            return Err(Error::Closed);
        }

        if self.is_banned(addr.ip()) {
            return Err(Error::BannedEndpoint);
        }

        let mut bytes = BytesMut::new();
        Presentation {
            certificate: self.identity.certificate(),
        }
        .encode(&mut bytes);

        self.peers
            .entry(addr)
            .or_insert_with(|| Peer::new(now))
            .introduced = true;
        self.queue.push_back(Transmit {
            destination: addr,
            bytes: bytes.to_vec(),
        });

        Ok(())
    }

    /// Send a SESSION_REQUEST with our capability lists.
    pub fn request_session(&mut self, addr: SocketAddr, now: Instant) -> Result<(), Error> {
        if self.closed {
            return Err(Error::Closed);
        }

        self.peers.entry(addr).or_insert_with(|| Peer::new(now));
        self.request_session_inner(addr, now);
        Ok(())
    }

    pub(crate) fn request_session_inner(&mut self, addr: SocketAddr, now: Instant) {
        let suites: Vec<u8> = self.suites.iter().map(|s| u8::from(*s)).collect();
        let curves: Vec<u8> = self.curves.iter().map(|c| u8::from(*c)).collect();

        let mut bytes = BytesMut::new();
        SessionRequest::encode(
            &suites,
            &curves,
            |material| self.identity.sign(material),
            &mut bytes,
        );

        let deadline = now + self.timers.session_timeout;
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.pending_request = Some(session::PendingRequest { deadline });
            peer.request_fallback = None;
        }

        self.queue.push_back(Transmit {
            destination: addr,
            bytes: bytes.to_vec(),
        });
    }

    /// Send authenticated-encrypted DATA on a channel (0..8).
    pub fn send_data(
        &mut self,
        addr: SocketAddr,
        channel: u8,
        data: &[u8],
        now: Instant,
    ) -> Result<(), Error> {
        if self.closed {
            return Err(Error::Closed);
        }

        if channel >= CHANNEL_COUNT {
            return Err(Error::InvalidChannel);
        }

        self.seal_secure(addr, Kind::Data(channel), data, now)
    }

    /// Ask a peer whether it knows endpoints for any of the given
    /// certificate hashes.
    pub fn send_contact_request(
        &mut self,
        addr: SocketAddr,
        hashes: &[[u8; 32]],
        now: Instant,
    ) -> Result<(), Error> {
        if self.closed {
            return Err(Error::Closed);
        }

        let plaintext = codec::message::encode_hash_list(hashes);
        self.seal_secure(addr, Kind::ContactRequest, &plaintext, now)
    }

    /// Pin a certificate for an endpoint, bypassing chain validation for
    /// presentations from it.
    pub fn set_presentation(&mut self, addr: SocketAddr, certificate: &[u8]) -> Result<(), Error> {
        validate::verifying_key(certificate).map_err(Error::Validation)?;

        let record = session::PresentationRecord {
            hash: codec::crypto::sha256(certificate),
            certificate: certificate.to_vec(),
            pinned: true,
        };

        self.peers
            .entry(addr)
            .or_insert_with(|| Peer::new(Instant::now()))
            .presentation = Some(record);
        Ok(())
    }

    /// Tear down every session (notifying the peers) and refuse all
    /// further operations.
    pub fn close(&mut self, now: Instant) {
        if self.closed {
            return;
        }

        for addr in self.established() {
            let _ = self.seal_secure(addr, Kind::Keepalive, &[0x00], now);
            if let Some(peer) = self.peers.get_mut(&addr) {
                peer.drop_sessions();
            }

            self.handler.on_session_lost(addr, SessionLoss::Closed);
        }

        self.peers.clear();
        self.closed = true;
    }

    /// Seal `plaintext` under the current session with `addr` and queue it.
    pub(crate) fn seal_secure(
        &mut self,
        addr: SocketAddr,
        kind: Kind,
        plaintext: &[u8],
        now: Instant,
    ) -> Result<(), Error> {
        let Some(peer) = self.peers.get_mut(&addr) else {
            return Err(Error::NoSession);
        };

        let Some(session) = peer.current.as_mut() else {
            return Err(Error::NoSession);
        };

        let sequence = session.next_sequence();
        let ciphertext = codec::crypto::seal(
            session.suite,
            &session.keys.seal,
            kind,
            session.index,
            sequence,
            plaintext,
        )?;

        session.bytes_sealed += plaintext.len() as u64;
        session.last_send = now;

        let mut bytes = BytesMut::new();
        codec::message::Secure {
            session_index: session.index,
            sequence_number: sequence,
            ciphertext: &ciphertext,
        }
        .encode(kind, &mut bytes);

        self.queue.push_back(Transmit {
            destination: addr,
            bytes: bytes.to_vec(),
        });

        Ok(())
    }
}
