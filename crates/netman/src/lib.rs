//! ## Host network manager
//!
//! Registers interface addresses, routes and DNS servers with the operating
//! system and guarantees their removal. Every registration returns a scoped
//! handle; dropping the last handle for an entry removes the underlying OS
//! entry. Overlapping registrations of the same entry share a single OS
//! entry through a weak-handle table.

mod system;

pub use system::{MockSystem, System};

#[cfg(unix)]
pub use system::UnixSystem;
#[cfg(windows)]
pub use system::WindowsSystem;

use std::net::IpAddr;
use std::sync::{Arc, Weak};

use ahash::{HashMap, HashMapExt};
use ipnetwork::IpNetwork;
use log::warn;
use parking_lot::Mutex;

/// A route owned by an interface, with an optional gateway and metric.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    pub interface: String,
    pub destination: IpNetwork,
    pub gateway: Option<IpAddr>,
    pub metric: Option<u32>,
}

/// An interface address with its prefix length and, for point-to-point
/// interfaces, the remote address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub interface: String,
    pub address: IpAddr,
    pub prefix_len: u8,
    pub remote: Option<IpAddr>,
}

/// A DNS server associated with an interface.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DnsServer {
    pub interface: String,
    pub address: IpAddr,
}

/// Any entry the manager can hold on behalf of the OS.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Entry {
    Route(Route),
    Address(Address),
    Dns(DnsServer),
}

impl std::fmt::Display for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Entry::Route(route) => write!(
                f,
                "route {} dev {} via {:?}",
                route.destination, route.interface, route.gateway
            ),
            Entry::Address(address) => write!(
                f,
                "address {}/{} dev {}",
                address.address, address.prefix_len, address.interface
            ),
            Entry::Dns(dns) => write!(f, "dns {} dev {}", dns.address, dns.interface),
        }
    }
}

/// Callbacks fired on registration and unregistration failures. Failures
/// never propagate out of handle drops.
pub type FailureHandler = Box<dyn Fn(&Entry, &std::io::Error) + Send + Sync>;

struct Inner {
    system: Box<dyn System>,
    table: Mutex<HashMap<Entry, Weak<Registration>>>,
    on_register_failure: Option<FailureHandler>,
    on_unregister_failure: Option<FailureHandler>,
}

/// A scoped handle; the OS entry lives as long as at least one clone of
/// the `Arc` around it does.
pub struct Registration {
    entry: Entry,
    applied: bool,
    owner: Weak<Inner>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let Some(owner) = self.owner.upgrade() else {
            return;
        };

        {
            let mut table = owner.table.lock();
            // Only drop the slot if it still refers to this registration;
            // a concurrent re-registration may have replaced it.
            if let Some(weak) = table.get(&self.entry) {
                if weak.strong_count() == 0 {
                    table.remove(&self.entry);
                }
            }
        }
        if !self.applied {
            return;
        }

        if let Err(error) = owner.system.remove(&self.entry) {
            warn!("failed to remove {}: {}", self.entry, error);
            if let Some(handler) = &owner.on_unregister_failure {
                handler(&self.entry, &error);
            }
        }
    }
}

/// A shared owning reference to a registered entry.
pub type Handle = Arc<Registration>;

pub struct NetworkManagerOptions {
    pub system: Box<dyn System>,
    pub on_register_failure: Option<FailureHandler>,
    pub on_unregister_failure: Option<FailureHandler>,
}

impl NetworkManagerOptions {
    pub fn new(system: Box<dyn System>) -> Self {
        Self {
            system,
            on_register_failure: None,
            on_unregister_failure: None,
        }
    }
}

/// The manager facade. Cheap to clone; all clones share the handle table.
#[derive(Clone)]
pub struct NetworkManager {
    inner: Arc<Inner>,
}

impl NetworkManager {
    pub fn new(options: NetworkManagerOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                system: options.system,
                table: Mutex::new(HashMap::with_capacity(16)),
                on_register_failure: options.on_register_failure,
                on_unregister_failure: options.on_unregister_failure,
            }),
        }
    }

    pub fn add_route(&self, route: Route) -> Handle {
        self.register(Entry::Route(route))
    }

    pub fn add_address(&self, address: Address) -> Handle {
        self.register(Entry::Address(address))
    }

    pub fn add_dns_server(&self, dns: DnsServer) -> Handle {
        self.register(Entry::Dns(dns))
    }

    /// The interface and optional gateway the OS would use to reach `host`.
    pub fn route_for(&self, host: IpAddr) -> std::io::Result<(String, Option<IpAddr>)> {
        self.inner.system.best_route(host)
    }

    /// Register `entry`, deduplicating against live handles: a second
    /// registration of the same entry shares the existing OS entry.
    fn register(&self, entry: Entry) -> Handle {
        let mut table = self.inner.table.lock();
        if let Some(existing) = table.get(&entry).and_then(Weak::upgrade) {
            return existing;
        }

        let applied = match self.inner.system.apply(&entry) {
            Ok(()) => true,
            Err(error) => {
                warn!("failed to register {}: {}", entry, error);
                if let Some(handler) = &self.inner.on_register_failure {
                    handler(&entry, &error);
                }

                false
            }
        };

        let handle = Arc::new(Registration {
            entry: entry.clone(),
            applied,
            owner: Arc::downgrade(&self.inner),
        });

        table.insert(entry, Arc::downgrade(&handle));
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (NetworkManager, MockSystem) {
        let system = MockSystem::default();
        let manager =
            NetworkManager::new(NetworkManagerOptions::new(Box::new(system.clone())));
        (manager, system)
    }

    fn route() -> Route {
        Route {
            interface: "tap0".to_string(),
            destination: "10.0.0.0/8".parse().unwrap(),
            gateway: None,
            metric: None,
        }
    }

    #[test]
    fn handle_drop_removes_the_entry() {
        let (manager, system) = manager();

        let handle = manager.add_route(route());
        assert_eq!(system.applied().len(), 1);

        drop(handle);
        assert_eq!(system.applied().len(), 0);
        assert_eq!(system.operations(), 2);
    }

    #[test]
    fn duplicate_registrations_share_one_os_entry() {
        let (manager, system) = manager();

        let first = manager.add_route(route());
        let second = manager.add_route(route());

        // One OS add for the two handles, dropped in any order.
        drop(first);
        assert_eq!(system.applied().len(), 1);
        drop(second);
        assert_eq!(system.applied().len(), 0);
        assert_eq!(system.operations(), 2);
    }

    #[test]
    fn reregistration_after_drop_applies_again() {
        let (manager, system) = manager();

        drop(manager.add_route(route()));
        drop(manager.add_route(route()));
        assert_eq!(system.operations(), 4);
    }

    #[test]
    fn distinct_entries_do_not_share() {
        let (manager, system) = manager();

        let _route = manager.add_route(route());
        let _dns = manager.add_dns_server(DnsServer {
            interface: "tap0".to_string(),
            address: "9.9.9.9".parse().unwrap(),
        });

        assert_eq!(system.applied().len(), 2);
    }

    #[test]
    fn route_lookup_passes_through() {
        let (manager, system) = manager();
        system.set_best_route("eth0", Some("192.168.1.1".parse().unwrap()));

        let (interface, gateway) = manager.route_for("10.1.2.3".parse().unwrap()).unwrap();
        assert_eq!(interface, "eth0");
        assert_eq!(gateway, Some("192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn registration_failure_fires_callback_and_drop_is_quiet() {
        let system = MockSystem::default();
        system.fail_next();

        let fired = Arc::new(Mutex::new(0u32));
        let fired_ = fired.clone();
        let manager = NetworkManager::new(NetworkManagerOptions {
            system: Box::new(system.clone()),
            on_register_failure: Some(Box::new(move |_, _| {
                *fired_.lock() += 1;
            })),
            on_unregister_failure: None,
        });

        let handle = manager.add_route(route());
        assert_eq!(*fired.lock(), 1);

        // The failed registration never reached the OS, so the drop must
        // not try to remove it.
        drop(handle);
        assert_eq!(system.operations(), 0);
    }
}
