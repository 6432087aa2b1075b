use std::io::ErrorKind::ConnectionReset;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedReceiver;

use service::{Service, ServiceHandler};

use crate::statistics::{Statistics, Stats};

/// Operations the core (or anything else holding the command channel)
/// drives the tunnel socket with. The engine itself is owned by the server
/// task; this is the only way in.
#[derive(Debug)]
pub enum ServerCommand {
    Greet(SocketAddr),
    IntroduceTo(SocketAddr),
    RequestSession(SocketAddr),
    SendData(SocketAddr, u8, Vec<u8>),
    SendContactRequest(SocketAddr, Vec<[u8; 32]>),
    /// Send a contact request with these hashes to every established peer.
    BroadcastContactRequest(Vec<[u8; 32]>),
    SetPresentation(SocketAddr, Vec<u8>),
    Close,
}

/// How often peer timers are driven.
const TICK_PERIOD: Duration = Duration::from_millis(250);

/// The socket task: one UDP socket multiplexed across every peer, feeding
/// the engine and flushing whatever it wants on the wire.
///
/// Reads, writes and engine state all live on this task; other tasks talk
/// to it exclusively through [`ServerCommand`]s.
pub async fn run<H: ServiceHandler>(
    socket: UdpSocket,
    mut service: Service<H>,
    mut commands: UnboundedReceiver<ServerCommand>,
    statistics: Statistics,
) -> anyhow::Result<()> {
    let socket = Arc::new(socket);
    let local_addr = socket.local_addr()?;
    info!("tunnel server listening: addr={}", local_addr);

    let mut buf = vec![0u8; 65535];
    let mut ticker = tokio::time::interval(TICK_PERIOD);

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (size, addr) = match received {
                    Ok(received) => received,
                    // Port-unreachable blips on connected peers are not
                    // fatal to the socket.
                    Err(e) if e.kind() == ConnectionReset => continue,
                    Err(e) => return Err(e.into()),
                };

                statistics.send(&[
                    Stats::ReceivedBytes(size as u64),
                    Stats::ReceivedPkts(1),
                ]);

                if service.route(&buf[..size], addr, Instant::now()).is_err() {
                    statistics.send(&[Stats::ErrorPkts(1)]);
                }
            }

            command = commands.recv() => {
                let now = Instant::now();
                let result = match command {
                    None | Some(ServerCommand::Close) => {
                        service.close(now);
                        flush(&socket, &mut service, &statistics).await;
                        break;
                    }
                    Some(ServerCommand::Greet(addr)) => service.greet(addr, now),
                    Some(ServerCommand::IntroduceTo(addr)) => service.introduce_to(addr, now),
                    Some(ServerCommand::RequestSession(addr)) => {
                        service.request_session(addr, now)
                    }
                    Some(ServerCommand::SendData(addr, channel, bytes)) => {
                        service.send_data(addr, channel, &bytes, now)
                    }
                    Some(ServerCommand::SendContactRequest(addr, hashes)) => {
                        service.send_contact_request(addr, &hashes, now)
                    }
                    Some(ServerCommand::BroadcastContactRequest(hashes)) => {
                        for addr in service.established() {
                            let _ = service.send_contact_request(addr, &hashes, now);
                        }

                        Ok(())
                    }
                    Some(ServerCommand::SetPresentation(addr, certificate)) => {
                        service.set_presentation(addr, &certificate)
                    }
                };

                if let Err(error) = result {
                    debug!("command refused: {}", error);
                }
            }

            _ = ticker.tick() => {
                service.tick(Instant::now());
            }
        }

        flush(&socket, &mut service, &statistics).await;
    }

    statistics.log_summary();
    info!("tunnel server closed: addr={}", local_addr);
    Ok(())
}

async fn flush<H: ServiceHandler>(
    socket: &UdpSocket,
    service: &mut Service<H>,
    statistics: &Statistics,
) {
    while let Some(transmit) = service.poll_transmit() {
        match socket.send_to(&transmit.bytes, transmit.destination).await {
            Ok(size) => {
                statistics.send(&[Stats::SendBytes(size as u64), Stats::SendPkts(1)]);
            }
            Err(error) => {
                // Transient send failures are counted and the loop goes on.
                debug!(
                    "udp send failed: addr={:?}, err={}",
                    transmit.destination, error
                );
                statistics.send(&[Stats::ErrorPkts(1)]);
            }
        }
    }
}
