use std::time::{Duration, Instant};

use codec::crypto::{CipherSuite, EllipticCurve, Exchange, SessionKeys};

use crate::replay::ReplayWindow;

/// Why a session went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLoss {
    /// No valid traffic inside the idle window.
    Timeout,
    /// The peer (or the local side) tore the session down explicitly.
    Closed,
    /// Repeated protocol violations or a fatal authentication failure.
    Error,
}

/// How a received presentation relates to the one on file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationStatus {
    New,
    Same,
    Updated,
}

/// The per-endpoint state machine, `Unknown → Greeted → Presented →
/// SessionRequested → SessionEstablished → SessionLost`. The variants here
/// are observable states; the bookkeeping that moves between them lives in
/// [`Peer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Unknown,
    Greeted,
    Presented,
    SessionRequested,
    SessionEstablished,
    SessionLost,
}

/// The certificate a peer endpoint last announced.
pub(crate) struct PresentationRecord {
    pub certificate: Vec<u8>,
    pub hash: [u8; 32],
    /// Pinned records come from local configuration and bypass chain
    /// validation for this endpoint.
    pub pinned: bool,
}

/// An outstanding HELLO_REQUEST.
pub(crate) struct PendingHello {
    pub request_id: u32,
    pub sent_at: Instant,
    pub deadline: Instant,
}

/// A SESSION_REQUEST we sent and have not yet seen a SESSION for.
pub(crate) struct PendingRequest {
    pub deadline: Instant,
}

/// A SESSION we sent in response to a request; the exchange completes when
/// the peer's SESSION arrives.
pub(crate) struct OfferedSession {
    pub index: u32,
    pub suite: CipherSuite,
    pub curve: EllipticCurve,
    pub exchange: Exchange,
    pub public_key: Vec<u8>,
    pub deadline: Instant,
}

/// A fully keyed session.
pub(crate) struct EstablishedSession {
    pub index: u32,
    pub suite: CipherSuite,
    pub curve: EllipticCurve,
    pub keys: SessionKeys,
    pub send_sequence: u32,
    pub replay: ReplayWindow,
    pub bytes_sealed: u64,
    pub created: Instant,
    pub last_send: Instant,
}

impl EstablishedSession {
    pub fn next_sequence(&mut self) -> u32 {
        self.send_sequence += 1;
        self.send_sequence
    }
}

/// Everything known about one remote endpoint.
pub(crate) struct Peer {
    pub presentation: Option<PresentationRecord>,
    pub pending_hello: Option<PendingHello>,
    /// Whether our own presentation went out to this endpoint already.
    pub introduced: bool,
    pub pending_request: Option<PendingRequest>,
    pub offered: Option<OfferedSession>,
    pub current: Option<EstablishedSession>,
    /// The session replaced by a rekey, kept through a short grace window
    /// so in-flight frames under the old keys still open.
    pub previous: Option<(EstablishedSession, Instant)>,
    /// Next session index this side will put on the wire for this peer.
    pub next_index: u32,
    /// If the remote side is expected to initiate and does not, request a
    /// session ourselves at this point.
    pub request_fallback: Option<Instant>,
    pub violations: u32,
    pub last_recv: Instant,
    pub lost: bool,
}

impl Peer {
    pub fn new(now: Instant) -> Self {
        Self {
            presentation: None,
            pending_hello: None,
            introduced: false,
            pending_request: None,
            offered: None,
            current: None,
            previous: None,
            next_index: 1,
            request_fallback: None,
            violations: 0,
            last_recv: now,
            lost: false,
        }
    }

    pub fn state(&self) -> PeerState {
        if self.current.is_some() {
            PeerState::SessionEstablished
        } else if self.lost {
            PeerState::SessionLost
        } else if self.pending_request.is_some() || self.offered.is_some() {
            PeerState::SessionRequested
        } else if self.presentation.is_some() {
            PeerState::Presented
        } else if self.pending_hello.is_some() {
            PeerState::Greeted
        } else {
            PeerState::Unknown
        }
    }

    /// Allocate the index for a new outgoing SESSION. `None` when the index
    /// space for this peer is exhausted; the caller tears the peer down.
    pub fn allocate_index(&mut self) -> Option<u32> {
        let floor = self
            .current
            .as_ref()
            .map(|session| session.index + 1)
            .unwrap_or(1);
        let index = self.next_index.max(floor);
        if index == u32::MAX {
            return None;
        }

        self.next_index = index + 1;
        Some(index)
    }

    /// Install a freshly keyed session, retiring the old one into the grace
    /// window. Returns whether this is the first session with the peer.
    pub fn install(
        &mut self,
        session: EstablishedSession,
        now: Instant,
        grace: Duration,
    ) -> bool {
        let is_new = self.current.is_none() && self.previous.is_none();
        if let Some(old) = self.current.take() {
            self.previous = Some((old, now + grace));
        }

        // The new session satisfies any outstanding negotiation; a stale
        // offer below the installed index must never complete later.
        self.pending_request = None;
        self.request_fallback = None;
        if let Some(offered) = &self.offered {
            if offered.index <= session.index {
                self.offered = None;
            }
        }

        self.next_index = self.next_index.max(session.index + 1);
        self.current = Some(session);
        self.lost = false;
        self.violations = 0;
        is_new
    }

    /// Find the established session matching a received session index:
    /// the current one, or the retired one while its grace window is open.
    pub fn session_for(&mut self, index: u32, now: Instant) -> Option<&mut EstablishedSession> {
        if let Some(session) = self.current.as_mut() {
            if session.index == index {
                return Some(session);
            }
        }

        match &mut self.previous {
            Some((session, expires)) if session.index == index && now < *expires => Some(session),
            _ => None,
        }
    }

    pub fn drop_sessions(&mut self) {
        self.current = None;
        self.previous = None;
        self.pending_request = None;
        self.offered = None;
        self.request_fallback = None;
        self.lost = true;
    }
}
