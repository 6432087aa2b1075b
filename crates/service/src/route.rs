use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use log::warn;

use codec::crypto::{self, CipherSuite, EllipticCurve, Exchange};
use codec::message::{
    ContactEntry, Hello, Kind, Packet, Presentation, Secure, Session, SessionRequest,
    decode_contact_list, decode_hash_list, encode_contact_list,
};

use crate::session::{
    EstablishedSession, OfferedSession, Peer, PresentationStatus, SessionLoss,
};
use crate::{Error, Service, ServiceHandler, Transmit, validate};

/// Consecutive protocol violations that tear a session down.
const VIOLATION_LIMIT: u32 = 3;

/// Idle peers with no presentation and no session are forgotten after this.
const PEER_GC_AGE: Duration = Duration::from_secs(300);

impl<H: ServiceHandler> Service<H> {
    /// Feed one received datagram into the engine.
    ///
    /// Returns `Err` when the datagram was dropped, with the reason; the
    /// caller only needs it for accounting, every consequence is already
    /// applied.
    pub fn route(&mut self, bytes: &[u8], from: SocketAddr, now: Instant) -> Result<(), Error> {
        if self.closed {
            return Err(Error::Closed);
        }

        if self.is_banned(from.ip()) {
            return Err(Error::BannedEndpoint);
        }

        let packet = match Packet::decode(bytes) {
            Ok(packet) => packet,
            Err(codec::Error::VersionMismatch(version)) => {
                warn!("message version mismatch: addr={:?}, version={}", from, version);
                return Err(Error::Codec(codec::Error::VersionMismatch(version)));
            }
            Err(codec::Error::UnknownType(_)) => return Err(Error::Ignored),
            Err(error) => {
                self.violation(from, "malformed message", now);
                return Err(Error::Codec(error));
            }
        };

        match packet.kind {
            Kind::HelloRequest => self.handle_hello_request(from, packet.payload, now),
            Kind::HelloResponse => self.handle_hello_response(from, packet.payload, now),
            Kind::Presentation => self.handle_presentation(from, packet.payload, now),
            Kind::SessionRequest => self.handle_session_request(from, packet.payload, now),
            Kind::Session => self.handle_session(from, packet.payload, now),
            kind => self.handle_secure(from, kind, packet.payload, now),
        }
    }

    /// Drive every peer timer. Call at a sub-second cadence.
    pub fn tick(&mut self, now: Instant) {
        if self.closed {
            return;
        }

        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            self.tick_peer(addr, now);
        }

        self.peers.retain(|_, peer| {
            peer.presentation.is_some()
                || peer.current.is_some()
                || peer.pending_hello.is_some()
                || peer.pending_request.is_some()
                || peer.offered.is_some()
                || now.duration_since(peer.last_recv) < PEER_GC_AGE
        });
    }

    fn tick_peer(&mut self, addr: SocketAddr, now: Instant) {
        let timers = self.timers;

        // Expired state transitions are gathered first so the callbacks run
        // without any peer borrow held.
        let mut hello_expired = false;
        let mut request_expired = None;
        let mut idle = false;
        let mut rekey = false;
        let mut keepalive = false;
        let mut fallback = false;

        {
            let Some(peer) = self.peers.get_mut(&addr) else {
                return;
            };

            if let Some(pending) = &peer.pending_hello {
                if now >= pending.deadline {
                    peer.pending_hello = None;
                    hello_expired = true;
                }
            }

            if let Some((_, expires)) = &peer.previous {
                if now >= *expires {
                    peer.previous = None;
                }
            }

            if let Some(offered) = &peer.offered {
                if now >= offered.deadline {
                    peer.offered = None;
                }
            }

            if let Some(pending) = &peer.pending_request {
                if now >= pending.deadline {
                    peer.pending_request = None;
                    if peer.current.is_none() {
                        request_expired = Some(peer.previous.is_none());
                    }
                }
            }

            if let Some(at) = peer.request_fallback {
                if now >= at
                    && peer.current.is_none()
                    && peer.pending_request.is_none()
                    && peer.offered.is_none()
                {
                    peer.request_fallback = None;
                    fallback = true;
                }
            }

            if let Some(session) = &peer.current {
                if now.duration_since(peer.last_recv) >= timers.idle_timeout {
                    idle = true;
                } else {
                    let age = now.duration_since(session.created);
                    let rekey_age = timers.session_max_age.mul_f64(0.875);
                    let rekey_bytes = timers.session_max_bytes / 8 * 7;
                    if (age >= rekey_age || session.bytes_sealed >= rekey_bytes)
                        && peer.pending_request.is_none()
                        && peer.offered.is_none()
                    {
                        rekey = true;
                    }

                    if now.duration_since(session.last_send) >= timers.keepalive_period {
                        keepalive = true;
                    }
                }
            }
        }

        if hello_expired {
            self.handler.on_error(addr, &Error::HelloTimeout);
        }

        if let Some(is_new) = request_expired {
            self.handler.on_session_failed(addr, is_new);
        }

        if fallback || rekey {
            self.request_session_inner(addr, now);
        }

        if idle {
            self.lose_session(addr, SessionLoss::Timeout);
        } else if keepalive {
            let _ = self.seal_secure(addr, Kind::Keepalive, &[], now);
        }
    }

    pub(crate) fn lose_session(&mut self, addr: SocketAddr, reason: SessionLoss) {
        let had_session = match self.peers.get_mut(&addr) {
            Some(peer) => {
                let had = peer.current.is_some();
                peer.drop_sessions();
                had
            }
            None => false,
        };

        if had_session {
            self.handler.on_session_lost(addr, reason);
        }
    }

    /// Count a protocol violation against a known peer; past the limit the
    /// session is torn down.
    fn violation(&mut self, addr: SocketAddr, what: &'static str, _now: Instant) {
        warn!("protocol violation: addr={:?}, reason={}", addr, what);

        let over = match self.peers.get_mut(&addr) {
            Some(peer) => {
                peer.violations += 1;
                peer.violations >= VIOLATION_LIMIT && peer.current.is_some()
            }
            None => false,
        };

        self.handler.on_error(addr, &Error::Violation(what));
        if over {
            self.lose_session(addr, SessionLoss::Error);
        }
    }

    fn handle_hello_request(
        &mut self,
        from: SocketAddr,
        payload: &[u8],
        now: Instant,
    ) -> Result<(), Error> {
        let hello = match Hello::decode(payload) {
            Ok(hello) => hello,
            Err(error) => {
                self.violation(from, "malformed hello", now);
                return Err(error.into());
            }
        };

        if !self.handler.on_hello(from) {
            return Err(Error::Ignored);
        }

        let peer = self.peers.entry(from).or_insert_with(|| Peer::new(now));
        peer.last_recv = now;

        let mut bytes = BytesMut::new();
        hello.encode(Kind::HelloResponse, &mut bytes);
        self.queue.push_back(Transmit {
            destination: from,
            bytes: bytes.to_vec(),
        });

        Ok(())
    }

    fn handle_hello_response(
        &mut self,
        from: SocketAddr,
        payload: &[u8],
        now: Instant,
    ) -> Result<(), Error> {
        let hello = match Hello::decode(payload) {
            Ok(hello) => hello,
            Err(error) => {
                self.violation(from, "malformed hello", now);
                return Err(error.into());
            }
        };

        let rtt = {
            let Some(peer) = self.peers.get_mut(&from) else {
                return Err(Error::Ignored);
            };

            match &peer.pending_hello {
                Some(pending) if pending.request_id == hello.request_id => {
                    let rtt = now.duration_since(pending.sent_at);
                    peer.pending_hello = None;
                    peer.last_recv = now;
                    rtt
                }
                // Unmatched identifiers are ignored.
                _ => return Err(Error::Ignored),
            }
        };

        self.handler.on_hello_response(from, rtt);

        // The greeting succeeded; both sides now exchange presentations.
        self.introduce_to(from, now)?;
        Ok(())
    }

    fn handle_presentation(
        &mut self,
        from: SocketAddr,
        payload: &[u8],
        now: Instant,
    ) -> Result<(), Error> {
        let presentation = match Presentation::decode(payload) {
            Ok(presentation) => presentation,
            Err(error) => {
                self.violation(from, "malformed presentation", now);
                return Err(error.into());
            }
        };

        let certificate = presentation.certificate;
        let hash = crypto::sha256(certificate);

        // (status, matches pinned record, pinned record exists)
        let (status, pinned, pin_mismatch) =
            match self.peers.get(&from).and_then(|p| p.presentation.as_ref()) {
                None => (PresentationStatus::New, false, false),
                Some(record) if record.hash == hash => {
                    (PresentationStatus::Same, record.pinned, false)
                }
                Some(record) => (PresentationStatus::Updated, false, record.pinned),
            };

        if pin_mismatch {
            // A pinned endpoint may not switch certificates.
            warn!(
                "presentation rejected, pinned certificate mismatch: addr={:?}, subject={}",
                from,
                validate::subject(certificate)
            );
            self.violation(from, "pinned certificate mismatch", now);
            return Err(Error::Validation(validate::ValidationError::UnknownIssuer));
        }

        if !pinned {
            if let Err(error) = self.validator.verify(certificate) {
                warn!(
                    "presentation rejected: addr={:?}, subject={}, reason={}",
                    from,
                    validate::subject(certificate),
                    error
                );

                let error = Error::Validation(error);
                self.handler.on_error(from, &error);
                return Err(error);
            }
        }

        if !self.handler.on_presentation(from, certificate, status) {
            return Err(Error::Ignored);
        }

        let local_hash = self.local_hash();
        let session_timeout = self.timers.session_timeout;
        let (introduce, initiate) = {
            let peer = self.peers.entry(from).or_insert_with(|| Peer::new(now));
            peer.last_recv = now;
            peer.violations = 0;

            if status != PresentationStatus::Same || peer.presentation.is_none() {
                peer.presentation = Some(crate::session::PresentationRecord {
                    certificate: certificate.to_vec(),
                    hash,
                    pinned,
                });
            }

            let introduce = !peer.introduced;
            let no_session = peer.current.is_none()
                && peer.pending_request.is_none()
                && peer.offered.is_none();

            // Exactly one side starts the negotiation: the one with the
            // smaller certificate hash. The other arms a fallback in case
            // the request never arrives.
            let initiate = no_session && local_hash <= hash;
            if no_session && !initiate {
                peer.request_fallback = Some(now + session_timeout);
            }

            (introduce, initiate)
        };

        if introduce {
            self.introduce_to(from, now)?;
        }

        if initiate {
            self.request_session_inner(from, now);
        }

        Ok(())
    }

    fn handle_session_request(
        &mut self,
        from: SocketAddr,
        payload: &[u8],
        now: Instant,
    ) -> Result<(), Error> {
        let request = match SessionRequest::decode(payload) {
            Ok(request) => request,
            Err(error) => {
                self.violation(from, "malformed session request", now);
                return Err(error.into());
            }
        };

        // PRESENTATION must precede SESSION_REQUEST.
        let Some((peer_hash, peer_cert)) = self
            .peers
            .get(&from)
            .and_then(|p| p.presentation.as_ref())
            .map(|r| (r.hash, r.certificate.clone()))
        else {
            self.violation(from, "session request without presentation", now);
            return Err(Error::Violation("session request without presentation"));
        };

        let key = validate::verifying_key(&peer_cert).map_err(Error::Validation)?;
        if crypto::verify(&key, &request.signed_material(payload), request.signature).is_err() {
            self.violation(from, "session request signature", now);
            return Err(Error::Violation("session request signature"));
        }

        let suites: Vec<CipherSuite> = request
            .cipher_suites
            .iter()
            .filter_map(|byte| CipherSuite::try_from(*byte).ok())
            .collect();
        let curves: Vec<EllipticCurve> = request
            .elliptic_curves
            .iter()
            .filter_map(|byte| EllipticCurve::try_from(*byte).ok())
            .collect();

        if !self.handler.on_session_request(from, &suites, &curves) {
            return Err(Error::Ignored);
        }

        // Crossed requests: the designated initiator ignores the peer's
        // request and waits for the answer to its own.
        let local_hash = self.local_hash();
        if let Some(peer) = self.peers.get(&from) {
            if peer.pending_request.is_some() && local_hash <= peer_hash {
                return Err(Error::Ignored);
            }
        }

        // Receiver-order tie break over the capability intersection.
        let suite = self.suites.iter().copied().find(|s| suites.contains(s));
        let curve = self.curves.iter().copied().find(|c| curves.contains(c));
        let (Some(suite), Some(curve)) = (suite, curve) else {
            warn!("no common cipher suite or curve: addr={:?}", from);
            self.handler.on_error(from, &Error::NegotiationFailed);
            return Err(Error::NegotiationFailed);
        };

        let Some(peer) = self.peers.get_mut(&from) else {
            return Err(Error::Ignored);
        };

        peer.pending_request = None;
        peer.request_fallback = None;
        peer.last_recv = now;

        let Some(index) = peer.allocate_index() else {
            // Session index space exhausted; drop the peer and start over.
            self.lose_session(from, SessionLoss::Error);
            return Err(Error::Violation("session index exhausted"));
        };

        let exchange = Exchange::generate(curve);
        let public_key = exchange.public_key();
        peer.offered = Some(OfferedSession {
            index,
            suite,
            curve,
            exchange,
            public_key: public_key.clone(),
            deadline: now + self.timers.session_timeout,
        });

        let mut bytes = BytesMut::new();
        Session::encode(
            index,
            suite.into(),
            curve.into(),
            &public_key,
            |material| self.identity.sign(material),
            &mut bytes,
        );

        self.queue.push_back(Transmit {
            destination: from,
            bytes: bytes.to_vec(),
        });

        Ok(())
    }

    fn handle_session(
        &mut self,
        from: SocketAddr,
        payload: &[u8],
        now: Instant,
    ) -> Result<(), Error> {
        let session = match Session::decode(payload) {
            Ok(session) => session,
            Err(error) => {
                self.violation(from, "malformed session", now);
                return Err(error.into());
            }
        };

        let Some(peer_cert) = self
            .peers
            .get(&from)
            .and_then(|p| p.presentation.as_ref())
            .map(|r| r.certificate.clone())
        else {
            self.violation(from, "session without presentation", now);
            return Err(Error::Violation("session without presentation"));
        };

        let key = validate::verifying_key(&peer_cert).map_err(Error::Validation)?;
        if crypto::verify(&key, &session.signed_material(payload), session.signature).is_err() {
            self.violation(from, "session signature", now);
            return Err(Error::Violation("session signature"));
        }

        let (Ok(suite), Ok(curve)) = (
            CipherSuite::try_from(session.cipher_suite),
            EllipticCurve::try_from(session.elliptic_curve),
        ) else {
            self.violation(from, "unknown session parameters", now);
            return Err(Error::Violation("unknown session parameters"));
        };

        // Completing an exchange we offered?
        let offered = {
            let Some(peer) = self.peers.get_mut(&from) else {
                return Err(Error::Ignored);
            };

            match &peer.offered {
                Some(offered) if offered.index == session.session_index => peer.offered.take(),
                _ => None,
            }
        };

        if let Some(mut offered) = offered {
            if offered.suite != suite || offered.curve != curve {
                self.violation(from, "session parameter mismatch", now);
                return Err(Error::Violation("session parameter mismatch"));
            }

            let Ok(shared) = offered.exchange.agree(session.public_key) else {
                self.violation(from, "session public key", now);
                return Err(Error::Violation("session public key"));
            };

            let initiator = offered.public_key.as_slice() < session.public_key;
            let keys =
                crypto::derive_session_keys(suite, &shared, offered.index, initiator)?;
            self.install_session(from, offered.index, suite, curve, keys, now);
            return Ok(());
        }

        // Otherwise this should answer our SESSION_REQUEST.
        let answering = self
            .peers
            .get(&from)
            .map(|peer| peer.pending_request.is_some())
            .unwrap_or(false);
        if !answering {
            return Err(Error::Ignored);
        }

        if let Some(current) = self.peers.get(&from).and_then(|p| p.current.as_ref()) {
            if session.session_index <= current.index {
                return Err(Error::Ignored);
            }
        }

        if !self.suites.contains(&suite) || !self.curves.contains(&curve) {
            self.handler.on_error(from, &Error::NegotiationFailed);
            return Err(Error::NegotiationFailed);
        }

        if !self.handler.on_session(from, suite, curve) {
            return Err(Error::Ignored);
        }

        let mut exchange = Exchange::generate(curve);
        let public_key = exchange.public_key();
        let Ok(shared) = exchange.agree(session.public_key) else {
            self.violation(from, "session public key", now);
            return Err(Error::Violation("session public key"));
        };

        let initiator = public_key.as_slice() < session.public_key;
        let keys = crypto::derive_session_keys(suite, &shared, session.session_index, initiator)?;

        let mut bytes = BytesMut::new();
        Session::encode(
            session.session_index,
            suite.into(),
            curve.into(),
            &public_key,
            |material| self.identity.sign(material),
            &mut bytes,
        );

        self.queue.push_back(Transmit {
            destination: from,
            bytes: bytes.to_vec(),
        });

        if let Some(peer) = self.peers.get_mut(&from) {
            peer.pending_request = None;
        }

        self.install_session(from, session.session_index, suite, curve, keys, now);
        Ok(())
    }

    fn install_session(
        &mut self,
        addr: SocketAddr,
        index: u32,
        suite: CipherSuite,
        curve: EllipticCurve,
        keys: codec::crypto::SessionKeys,
        now: Instant,
    ) {
        let grace = self.timers.rekey_grace;
        let is_new = {
            let Some(peer) = self.peers.get_mut(&addr) else {
                return;
            };

            peer.last_recv = now;
            peer.install(
                EstablishedSession {
                    index,
                    suite,
                    curve,
                    keys,
                    send_sequence: 0,
                    replay: crate::ReplayWindow::default(),
                    bytes_sealed: 0,
                    created: now,
                    last_send: now,
                },
                now,
                grace,
            )
        };

        self.handler
            .on_session_established(addr, is_new, suite, curve);
    }

    fn handle_secure(
        &mut self,
        from: SocketAddr,
        kind: Kind,
        payload: &[u8],
        now: Instant,
    ) -> Result<(), Error> {
        let secure = match Secure::decode(payload) {
            Ok(secure) => secure,
            Err(error) => {
                self.violation(from, "malformed data message", now);
                return Err(error.into());
            }
        };

        let opened: Result<Vec<u8>, &'static str> = {
            let Some(peer) = self.peers.get_mut(&from) else {
                return Err(Error::Ignored);
            };

            let mut open = || {
                let session = peer
                    .session_for(secure.session_index, now)
                    .ok_or("unknown session index")?;

                if !session.replay.check(secure.sequence_number) {
                    return Err("replayed sequence number");
                }

                let plaintext = crypto::open(
                    session.suite,
                    &session.keys.open,
                    kind,
                    secure.session_index,
                    secure.sequence_number,
                    secure.ciphertext,
                )
                .map_err(|_| "authentication failed")?;

                session.replay.update(secure.sequence_number);
                peer.last_recv = now;
                peer.violations = 0;
                Ok(plaintext)
            };

            open()
        };

        let plaintext = match opened {
            Ok(plaintext) => plaintext,
            Err(what) => {
                self.violation(from, what, now);
                return Err(Error::Violation(what));
            }
        };

        match kind {
            Kind::Data(channel) => {
                self.handler.on_data(from, channel, &plaintext);
                Ok(())
            }
            Kind::Keepalive => {
                if plaintext == [0x00] {
                    self.lose_session(from, SessionLoss::Closed);
                }

                Ok(())
            }
            Kind::ContactRequest => self.answer_contact_request(from, &plaintext, now),
            Kind::Contact => {
                let entries = match decode_contact_list(&plaintext) {
                    Ok(entries) => entries,
                    Err(error) => {
                        self.violation(from, "malformed contact list", now);
                        return Err(error.into());
                    }
                };

                for entry in entries {
                    if self.is_banned(entry.endpoint.ip()) {
                        continue;
                    }

                    self.handler.on_contact(from, entry.hash, entry.endpoint);
                }

                Ok(())
            }
            _ => Err(Error::Ignored),
        }
    }

    fn answer_contact_request(
        &mut self,
        from: SocketAddr,
        plaintext: &[u8],
        now: Instant,
    ) -> Result<(), Error> {
        let hashes = match decode_hash_list(plaintext) {
            Ok(hashes) => hashes,
            Err(error) => {
                self.violation(from, "malformed contact request", now);
                return Err(error.into());
            }
        };

        let mut entries = Vec::new();
        for hash in hashes {
            let target = self.peers.iter().find_map(|(addr, peer)| {
                if *addr == from || peer.current.is_none() {
                    return None;
                }

                match &peer.presentation {
                    Some(record) if record.hash == hash => Some(*addr),
                    _ => None,
                }
            });

            let Some(target) = target else {
                continue;
            };

            if self.is_banned(target.ip()) {
                continue;
            }

            if !self.handler.on_contact_request(from, &hash, target) {
                continue;
            }

            entries.push(ContactEntry {
                hash,
                endpoint: target,
            });
        }

        if entries.is_empty() {
            return Ok(());
        }

        let reply = encode_contact_list(&entries);
        self.seal_secure(from, Kind::Contact, &reply, now)
    }
}
