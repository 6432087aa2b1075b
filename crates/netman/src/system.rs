use std::io;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use super::Entry;

/// The OS-facing side of the manager: apply or remove one entry, and query
/// the routing table. Implementations must be idempotence-tolerant — the
/// manager already deduplicates, so every `apply` is paired with exactly
/// one `remove`.
pub trait System: Send + Sync {
    fn apply(&self, entry: &Entry) -> io::Result<()>;
    fn remove(&self, entry: &Entry) -> io::Result<()>;
    fn best_route(&self, host: IpAddr) -> io::Result<(String, Option<IpAddr>)>;
}

/// Shells out to the platform's network tooling, the way the init scripts
/// an administrator would write do.
#[cfg(unix)]
#[derive(Default)]
pub struct UnixSystem;

#[cfg(unix)]
impl UnixSystem {
    fn run(program: &str, args: &[String], stdin: Option<&str>) -> io::Result<()> {
        use std::io::Write;
        use std::process::{Command, Stdio};

        let mut command = Command::new(program);
        command.args(args);
        if stdin.is_some() {
            command.stdin(Stdio::piped());
        }

        command.stdout(Stdio::null()).stderr(Stdio::null());

        let mut child = command.spawn()?;
        if let (Some(input), Some(pipe)) = (stdin, child.stdin.as_mut()) {
            pipe.write_all(input.as_bytes())?;
        }

        let status = child.wait()?;
        if !status.success() {
            return Err(io::Error::other(format!(
                "{} {:?} exited with {}",
                program, args, status
            )));
        }

        Ok(())
    }

    fn route_args(entry: &super::Route, add: bool) -> (&'static str, Vec<String>) {
        #[cfg(target_os = "linux")]
        {
            let mut args = vec![
                "route".to_string(),
                if add { "add" } else { "del" }.to_string(),
                entry.destination.to_string(),
                "dev".to_string(),
                entry.interface.clone(),
            ];
            if let Some(gateway) = entry.gateway {
                args.push("via".to_string());
                args.push(gateway.to_string());
            }
            if let Some(metric) = entry.metric {
                args.push("metric".to_string());
                args.push(metric.to_string());
            }

            return ("ip", args);
        }

        #[cfg(not(target_os = "linux"))]
        {
            let mut args = vec![
                if add { "add" } else { "delete" }.to_string(),
                "-net".to_string(),
                entry.destination.to_string(),
            ];
            match entry.gateway {
                Some(gateway) => args.push(gateway.to_string()),
                None => {
                    args.push("-interface".to_string());
                    args.push(entry.interface.clone());
                }
            }

            ("route", args)
        }
    }

    fn address_args(entry: &super::Address, add: bool) -> (&'static str, Vec<String>) {
        #[cfg(target_os = "linux")]
        {
            let mut args = vec![
                "addr".to_string(),
                if add { "add" } else { "del" }.to_string(),
                format!("{}/{}", entry.address, entry.prefix_len),
            ];
            if let Some(remote) = entry.remote {
                args.push("peer".to_string());
                args.push(remote.to_string());
            }
            args.push("dev".to_string());
            args.push(entry.interface.clone());

            return ("ip", args);
        }

        #[cfg(not(target_os = "linux"))]
        {
            let family = if entry.address.is_ipv4() {
                "inet"
            } else {
                "inet6"
            };
            let mut args = vec![
                entry.interface.clone(),
                family.to_string(),
                format!("{}/{}", entry.address, entry.prefix_len),
            ];
            if let Some(remote) = entry.remote {
                args.push(remote.to_string());
            }
            args.push(if add { "alias" } else { "-alias" }.to_string());

            ("ifconfig", args)
        }
    }
}

#[cfg(unix)]
impl System for UnixSystem {
    fn apply(&self, entry: &Entry) -> io::Result<()> {
        match entry {
            Entry::Route(route) => {
                let (program, args) = Self::route_args(route, true);
                Self::run(program, &args, None)
            }
            Entry::Address(address) => {
                let (program, args) = Self::address_args(address, true);
                Self::run(program, &args, None)
            }
            Entry::Dns(dns) => Self::run(
                "resolvconf",
                &["-a".to_string(), dns.interface.clone()],
                Some(&format!("nameserver {}\n", dns.address)),
            ),
        }
    }

    fn remove(&self, entry: &Entry) -> io::Result<()> {
        match entry {
            Entry::Route(route) => {
                let (program, args) = Self::route_args(route, false);
                Self::run(program, &args, None)
            }
            Entry::Address(address) => {
                let (program, args) = Self::address_args(address, false);
                Self::run(program, &args, None)
            }
            Entry::Dns(dns) => Self::run(
                "resolvconf",
                &["-d".to_string(), dns.interface.clone()],
                None,
            ),
        }
    }

    fn best_route(&self, host: IpAddr) -> io::Result<(String, Option<IpAddr>)> {
        use std::process::Command;

        #[cfg(target_os = "linux")]
        let output = Command::new("ip")
            .args(["route", "get", &host.to_string()])
            .output()?;

        #[cfg(not(target_os = "linux"))]
        let output = Command::new("route")
            .args(["-n", "get", &host.to_string()])
            .output()?;

        if !output.status.success() {
            return Err(io::Error::other("route lookup failed"));
        }

        let text = String::from_utf8_lossy(&output.stdout);
        parse_route_output(&text)
            .ok_or_else(|| io::Error::other(format!("unparseable route output for {}", host)))
    }
}

/// Pull `dev <iface>` / `via <gateway>` (Linux) or `interface:` /
/// `gateway:` (BSD) pairs out of the route tool output.
fn parse_route_output(text: &str) -> Option<(String, Option<IpAddr>)> {
    let mut interface = None;
    let mut gateway = None;

    let tokens: Vec<&str> = text.split_whitespace().collect();
    for window in tokens.windows(2) {
        match window[0] {
            "dev" | "interface:" => interface = Some(window[1].to_string()),
            "via" | "gateway:" => gateway = window[1].parse().ok(),
            _ => {}
        }
    }

    interface.map(|interface| (interface, gateway))
}

/// Windows backend driving `netsh`. Route lookups are not implemented
/// through tooling output and report unsupported.
#[cfg(windows)]
#[derive(Default)]
pub struct WindowsSystem;

#[cfg(windows)]
impl WindowsSystem {
    fn run(args: &[String]) -> io::Result<()> {
        use std::process::{Command, Stdio};

        let status = Command::new("netsh")
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        if !status.success() {
            return Err(io::Error::other(format!(
                "netsh {:?} exited with {}",
                args, status
            )));
        }

        Ok(())
    }

    fn family(address: &IpAddr) -> &'static str {
        if address.is_ipv4() { "ipv4" } else { "ipv6" }
    }
}

#[cfg(windows)]
impl System for WindowsSystem {
    fn apply(&self, entry: &Entry) -> io::Result<()> {
        match entry {
            Entry::Route(route) => {
                let mut args = vec![
                    "interface".to_string(),
                    Self::family(&route.destination.ip()).to_string(),
                    "add".to_string(),
                    "route".to_string(),
                    route.destination.to_string(),
                    route.interface.clone(),
                ];
                if let Some(gateway) = route.gateway {
                    args.push(gateway.to_string());
                }

                Self::run(&args)
            }
            Entry::Address(address) => Self::run(&[
                "interface".to_string(),
                Self::family(&address.address).to_string(),
                "add".to_string(),
                "address".to_string(),
                address.interface.clone(),
                format!("{}/{}", address.address, address.prefix_len),
            ]),
            Entry::Dns(dns) => Self::run(&[
                "interface".to_string(),
                Self::family(&dns.address).to_string(),
                "add".to_string(),
                "dnsservers".to_string(),
                dns.interface.clone(),
                dns.address.to_string(),
            ]),
        }
    }

    fn remove(&self, entry: &Entry) -> io::Result<()> {
        match entry {
            Entry::Route(route) => Self::run(&[
                "interface".to_string(),
                Self::family(&route.destination.ip()).to_string(),
                "delete".to_string(),
                "route".to_string(),
                route.destination.to_string(),
                route.interface.clone(),
            ]),
            Entry::Address(address) => Self::run(&[
                "interface".to_string(),
                Self::family(&address.address).to_string(),
                "delete".to_string(),
                "address".to_string(),
                address.interface.clone(),
                address.address.to_string(),
            ]),
            Entry::Dns(dns) => Self::run(&[
                "interface".to_string(),
                Self::family(&dns.address).to_string(),
                "delete".to_string(),
                "dnsservers".to_string(),
                dns.interface.clone(),
                dns.address.to_string(),
            ]),
        }
    }

    fn best_route(&self, _host: IpAddr) -> io::Result<(String, Option<IpAddr>)> {
        Err(io::Error::other("route lookup not supported on this platform"))
    }
}

/// Records operations instead of touching the OS; shared between clones so
/// tests can watch the manager from outside.
#[derive(Default, Clone)]
pub struct MockSystem {
    state: Arc<MockState>,
}

#[derive(Default)]
struct MockState {
    applied: Mutex<Vec<Entry>>,
    operations: Mutex<u32>,
    fail_next: Mutex<bool>,
    routes: Mutex<Option<(String, Option<IpAddr>)>>,
}

impl MockSystem {
    /// Entries currently applied.
    pub fn applied(&self) -> Vec<Entry> {
        self.state.applied.lock().clone()
    }

    /// Count of successful apply/remove operations.
    pub fn operations(&self) -> u32 {
        *self.state.operations.lock()
    }

    /// Make the next apply fail.
    pub fn fail_next(&self) {
        *self.state.fail_next.lock() = true;
    }

    /// Fix the answer of [`System::best_route`].
    pub fn set_best_route(&self, interface: &str, gateway: Option<IpAddr>) {
        *self.state.routes.lock() = Some((interface.to_string(), gateway));
    }
}

impl System for MockSystem {
    fn apply(&self, entry: &Entry) -> io::Result<()> {
        if std::mem::take(&mut *self.state.fail_next.lock()) {
            return Err(io::Error::other("injected failure"));
        }

        self.state.applied.lock().push(entry.clone());
        *self.state.operations.lock() += 1;
        Ok(())
    }

    fn remove(&self, entry: &Entry) -> io::Result<()> {
        let mut applied = self.state.applied.lock();
        let Some(at) = applied.iter().position(|e| e == entry) else {
            return Err(io::Error::other("entry was not applied"));
        };

        applied.remove(at);
        *self.state.operations.lock() += 1;
        Ok(())
    }

    fn best_route(&self, _host: IpAddr) -> io::Result<(String, Option<IpAddr>)> {
        self.state
            .routes
            .lock()
            .clone()
            .ok_or_else(|| io::Error::other("no route configured"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linux_route_output_parses() {
        let text = "10.1.2.3 via 192.168.1.1 dev eth0 src 192.168.1.17 uid 0";
        assert_eq!(
            parse_route_output(text),
            Some(("eth0".to_string(), Some("192.168.1.1".parse().unwrap())))
        );
    }

    #[test]
    fn bsd_route_output_parses() {
        let text = "   route to: 10.1.2.3\ndestination: 10.0.0.0\n    gateway: 192.168.1.1\n  interface: en0\n";
        assert_eq!(
            parse_route_output(text),
            Some(("en0".to_string(), Some("192.168.1.1".parse().unwrap())))
        );
    }

    #[test]
    fn directly_connected_route_has_no_gateway() {
        let text = "192.168.1.40 dev eth0 src 192.168.1.17";
        assert_eq!(parse_route_output(text), Some(("eth0".to_string(), None)));
    }
}
