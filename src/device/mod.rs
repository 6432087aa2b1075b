//! The virtual adapter surface. The daemon only ever sees two frame
//! channels and a description; where the frames come from is decided here:
//! a pre-opened TAP/TUN descriptor, or an in-memory pair for tests and for
//! running without an adapter.

#[cfg(unix)]
mod fd;

#[cfg(unix)]
pub use fd::from_fd;

use packet::HardwareAddress;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub mtu: usize,
    pub hardware_address: HardwareAddress,
}

/// A running adapter, seen from the core: frames read from the device
/// arrive on `incoming`, frames pushed into `outgoing` are written to it.
pub struct Device {
    pub info: DeviceInfo,
    pub incoming: UnboundedReceiver<Vec<u8>>,
    pub outgoing: UnboundedSender<Vec<u8>>,
}

/// The far side of a memory device: inject frames as if the host wrote
/// them, observe frames the core wrote back.
pub struct MemoryHandle {
    pub inject: UnboundedSender<Vec<u8>>,
    pub written: UnboundedReceiver<Vec<u8>>,
}

/// A device backed by nothing but channels.
pub fn memory(info: DeviceInfo) -> (Device, MemoryHandle) {
    let (inject, incoming) = unbounded_channel();
    let (outgoing, written) = unbounded_channel();

    (
        Device {
            info,
            incoming,
            outgoing,
        },
        MemoryHandle { inject, written },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_device_round_trips() {
        let (mut device, mut handle) = memory(DeviceInfo {
            name: "mem0".to_string(),
            mtu: 1500,
            hardware_address: [2, 0, 0, 0, 0, 1],
        });

        handle.inject.send(vec![1, 2, 3]).unwrap();
        assert_eq!(device.incoming.recv().await.unwrap(), vec![1, 2, 3]);

        device.outgoing.send(vec![4, 5]).unwrap();
        assert_eq!(handle.written.recv().await.unwrap(), vec![4, 5]);
    }
}
