//! Local responders for TAP mode: frames they consume are answered
//! straight back to the adapter and never reach the switch.

pub mod arp;
pub mod dhcp;

pub use arp::ArpProxy;
pub use dhcp::{DhcpProxy, DhcpProxyOptions};
