use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::OwnedFd;

use log::warn;
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc::unbounded_channel;

use super::{Device, DeviceInfo};

/// Wrap a pre-opened TAP/TUN descriptor. The descriptor must already be in
/// non-blocking mode; opening and configuring the device node is the
/// launcher's business.
pub fn from_fd(info: DeviceInfo, fd: OwnedFd) -> std::io::Result<Device> {
    let file = AsyncFd::with_interest(File::from(fd), Interest::READABLE | Interest::WRITABLE)?;
    let file = std::sync::Arc::new(file);

    let (incoming_tx, incoming) = unbounded_channel::<Vec<u8>>();
    let (outgoing, mut outgoing_rx) = unbounded_channel::<Vec<u8>>();

    let mtu = info.mtu;
    let reader = file.clone();
    tokio::spawn(async move {
        // TAP frames carry the Ethernet header on top of the MTU.
        let mut buf = vec![0u8; mtu + packet::ethernet::HEADER_LEN];
        loop {
            let mut guard = match reader.readable().await {
                Ok(guard) => guard,
                Err(error) => {
                    warn!("device read wait failed: {}", error);
                    break;
                }
            };

            let result = guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.read(&mut buf)
            });

            match result {
                Ok(Ok(0)) => break,
                Ok(Ok(size)) => {
                    if incoming_tx.send(buf[..size].to_vec()).is_err() {
                        break;
                    }
                }
                Ok(Err(error)) => {
                    warn!("device read failed: {}", error);
                    break;
                }
                Err(_would_block) => continue,
            }
        }
    });

    let writer = file;
    tokio::spawn(async move {
        while let Some(frame) = outgoing_rx.recv().await {
            loop {
                let mut guard = match writer.writable().await {
                    Ok(guard) => guard,
                    Err(error) => {
                        warn!("device write wait failed: {}", error);
                        return;
                    }
                };

                let result = guard.try_io(|inner| {
                    let mut file = inner.get_ref();
                    file.write(&frame)
                });

                match result {
                    Ok(Ok(_)) => break,
                    Ok(Err(error)) => {
                        // Transient adapter failures are logged, not fatal.
                        warn!("device write failed: {}", error);
                        break;
                    }
                    Err(_would_block) => continue,
                }
            }
        }
    });

    Ok(Device {
        info,
        incoming,
        outgoing,
    })
}
