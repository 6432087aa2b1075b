use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc::UnboundedSender;

use service::{
    CipherSuite, EllipticCurve, Error, PresentationStatus, ServiceHandler, SessionLoss,
};

/// What the engine tells the core orchestrator. Everything the core reacts
/// to crosses this channel; the observer itself never blocks.
#[derive(Debug)]
pub enum CoreEvent {
    HelloResponse {
        addr: SocketAddr,
        rtt: Duration,
    },
    SessionEstablished {
        addr: SocketAddr,
        is_new: bool,
    },
    SessionLost {
        addr: SocketAddr,
        reason: SessionLoss,
    },
    Data {
        addr: SocketAddr,
        channel: u8,
        bytes: Vec<u8>,
    },
    ContactLearned {
        addr: SocketAddr,
        hash: [u8; 32],
        target: SocketAddr,
    },
}

/// The daemon's [`ServiceHandler`]: logs every event the way an operator
/// wants to read it and forwards the core-relevant ones.
pub struct Observer {
    events: UnboundedSender<CoreEvent>,
}

impl Observer {
    pub fn new(events: UnboundedSender<CoreEvent>) -> Self {
        Self { events }
    }

    fn emit(&self, event: CoreEvent) {
        // A full shutdown drops the core first; nothing left to notify.
        let _ = self.events.send(event);
    }
}

impl ServiceHandler for Observer {
    fn on_hello(&self, addr: SocketAddr) -> bool {
        debug!("hello request: addr={:?}", addr);
        true
    }

    fn on_hello_response(&self, addr: SocketAddr, rtt: Duration) {
        debug!("hello response: addr={:?}, rtt={:?}", addr, rtt);
        self.emit(CoreEvent::HelloResponse { addr, rtt });
    }

    fn on_presentation(
        &self,
        addr: SocketAddr,
        certificate: &[u8],
        status: PresentationStatus,
    ) -> bool {
        info!(
            "presentation: addr={:?}, subject={}, status={:?}",
            addr,
            service::validate::subject(certificate),
            status,
        );
        true
    }

    fn on_session_request(
        &self,
        addr: SocketAddr,
        suites: &[CipherSuite],
        curves: &[EllipticCurve],
    ) -> bool {
        debug!(
            "session request: addr={:?}, suites={:?}, curves={:?}",
            addr, suites, curves,
        );
        true
    }

    fn on_session(&self, addr: SocketAddr, suite: CipherSuite, curve: EllipticCurve) -> bool {
        debug!(
            "session: addr={:?}, suite={:?}, curve={:?}",
            addr, suite, curve,
        );
        true
    }

    fn on_session_established(
        &self,
        addr: SocketAddr,
        is_new: bool,
        suite: CipherSuite,
        curve: EllipticCurve,
    ) {
        info!(
            "session established: addr={:?}, new={}, suite={:?}, curve={:?}",
            addr, is_new, suite, curve,
        );
        self.emit(CoreEvent::SessionEstablished { addr, is_new });
    }

    fn on_session_failed(&self, addr: SocketAddr, is_new: bool) {
        warn!("session failed: addr={:?}, new={}", addr, is_new);
    }

    fn on_session_lost(&self, addr: SocketAddr, reason: SessionLoss) {
        info!("session lost: addr={:?}, reason={:?}", addr, reason);
        self.emit(CoreEvent::SessionLost { addr, reason });
    }

    fn on_data(&self, addr: SocketAddr, channel: u8, bytes: &[u8]) {
        self.emit(CoreEvent::Data {
            addr,
            channel,
            bytes: bytes.to_vec(),
        });
    }

    fn on_contact_request(&self, addr: SocketAddr, hash: &[u8; 32], target: SocketAddr) -> bool {
        debug!(
            "contact request: addr={:?}, hash={:02x?}, target={:?}",
            addr,
            &hash[..4],
            target,
        );
        true
    }

    fn on_contact(&self, addr: SocketAddr, hash: [u8; 32], target: SocketAddr) {
        info!(
            "contact: addr={:?}, hash={:02x?}, target={:?}",
            addr,
            &hash[..4],
            target,
        );
        self.emit(CoreEvent::ContactLearned { addr, hash, target });
    }

    fn on_error(&self, addr: SocketAddr, error: &Error) {
        debug!("peer error: addr={:?}, error={}", addr, error);
    }
}
