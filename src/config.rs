use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use ipnetwork::IpNetwork;
use serde::Deserialize;

use service::{CipherSuite, EllipticCurve, Timers};
use service::validate::{RevocationPolicy, ValidationMethod};

#[derive(Deserialize, Debug)]
pub struct Tunnel {
    /// UDP endpoint the secure channel listens on.
    #[serde(default = "Tunnel::listen")]
    pub listen: SocketAddr,

    /// Path to this node's signature certificate (PEM or DER).
    pub certificate: Option<PathBuf>,

    /// Path to the matching PKCS#8 private key.
    pub private_key: Option<PathBuf>,
}

impl Tunnel {
    fn listen() -> SocketAddr {
        "0.0.0.0:12000".parse().unwrap()
    }
}

impl Default for Tunnel {
    fn default() -> Self {
        Self {
            listen: Self::listen(),
            certificate: None,
            private_key: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Validation {
    Default,
    None,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Revocation {
    None,
    Last,
    All,
}

#[derive(Deserialize, Debug)]
pub struct Security {
    /// PEM bundle of trusted certification authorities.
    pub authorities: Option<PathBuf>,

    /// Certificate revocation lists (DER), consulted per the revocation
    /// policy.
    #[serde(default)]
    pub crls: Vec<PathBuf>,

    /// How presented certificates are validated.
    #[serde(default = "Security::validation")]
    pub validation: Validation,

    /// Which chain members are checked against the CRLs.
    #[serde(default = "Security::revocation")]
    pub revocation: Revocation,
}

impl Security {
    fn validation() -> Validation {
        Validation::Default
    }

    fn revocation() -> Revocation {
        Revocation::None
    }

    pub fn validation_method(&self) -> ValidationMethod {
        match self.validation {
            Validation::Default => ValidationMethod::Default,
            Validation::None => ValidationMethod::None,
        }
    }

    pub fn revocation_policy(&self) -> RevocationPolicy {
        match self.revocation {
            Revocation::None => RevocationPolicy::None,
            Revocation::Last => RevocationPolicy::Last,
            Revocation::All => RevocationPolicy::All,
        }
    }
}

impl Default for Security {
    fn default() -> Self {
        Self {
            authorities: None,
            crls: Vec::new(),
            validation: Self::validation(),
            revocation: Self::revocation(),
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct Fscp {
    /// Endpoints greeted on every contact period; hostnames are resolved
    /// each time.
    #[serde(default)]
    pub contacts: Vec<String>,

    /// Certificates (PEM or DER files) looked up through peers on every
    /// dynamic contact period.
    #[serde(default)]
    pub dynamic_contacts: Vec<PathBuf>,

    /// Networks never contacted and never answered.
    #[serde(default)]
    pub never_contact: Vec<IpNetwork>,

    #[serde(default = "Fscp::contact_period_secs")]
    pub contact_period_secs: u64,

    #[serde(default = "Fscp::dynamic_contact_period_secs")]
    pub dynamic_contact_period_secs: u64,

    #[serde(default = "Fscp::hello_timeout_ms")]
    pub hello_timeout_ms: u64,

    #[serde(default = "Fscp::session_timeout_secs")]
    pub session_timeout_secs: u64,

    #[serde(default = "Fscp::idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "Fscp::keepalive_period_secs")]
    pub keepalive_period_secs: u64,

    #[serde(default = "Fscp::session_max_age_secs")]
    pub session_max_age_secs: u64,

    #[serde(default = "Fscp::session_max_bytes")]
    pub session_max_bytes: u64,

    /// Ordered cipher-suite preference. Names: `aes128-gcm-sha256`,
    /// `aes256-gcm-sha384`, `chacha20-poly1305-sha256`.
    #[serde(default)]
    pub cipher_suites: Vec<String>,

    /// Ordered curve preference. Names: `secp256r1`, `x25519`.
    #[serde(default)]
    pub elliptic_curves: Vec<String>,
}

impl Fscp {
    fn contact_period_secs() -> u64 {
        30
    }

    fn dynamic_contact_period_secs() -> u64 {
        45
    }

    fn hello_timeout_ms() -> u64 {
        3000
    }

    fn session_timeout_secs() -> u64 {
        10
    }

    fn idle_timeout_secs() -> u64 {
        30
    }

    fn keepalive_period_secs() -> u64 {
        10
    }

    fn session_max_age_secs() -> u64 {
        3600
    }

    fn session_max_bytes() -> u64 {
        1 << 30
    }

    pub fn timers(&self) -> Timers {
        Timers {
            hello_timeout: Duration::from_millis(self.hello_timeout_ms),
            session_timeout: Duration::from_secs(self.session_timeout_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            keepalive_period: Duration::from_secs(self.keepalive_period_secs),
            session_max_age: Duration::from_secs(self.session_max_age_secs),
            session_max_bytes: self.session_max_bytes,
            ..Timers::default()
        }
    }

    pub fn contact_period(&self) -> Duration {
        Duration::from_secs(self.contact_period_secs)
    }

    pub fn dynamic_contact_period(&self) -> Duration {
        Duration::from_secs(self.dynamic_contact_period_secs)
    }

    pub fn cipher_suites(&self) -> anyhow::Result<Vec<CipherSuite>> {
        if self.cipher_suites.is_empty() {
            return Ok(vec![
                CipherSuite::Aes128GcmSha256,
                CipherSuite::Aes256GcmSha384,
                CipherSuite::ChaCha20Poly1305Sha256,
            ]);
        }

        self.cipher_suites
            .iter()
            .map(|name| match name.as_str() {
                "aes128-gcm-sha256" => Ok(CipherSuite::Aes128GcmSha256),
                "aes256-gcm-sha384" => Ok(CipherSuite::Aes256GcmSha384),
                "chacha20-poly1305-sha256" => Ok(CipherSuite::ChaCha20Poly1305Sha256),
                other => Err(anyhow::anyhow!("unknown cipher suite: {}", other)),
            })
            .collect()
    }

    pub fn elliptic_curves(&self) -> anyhow::Result<Vec<EllipticCurve>> {
        if self.elliptic_curves.is_empty() {
            return Ok(vec![EllipticCurve::Secp256r1, EllipticCurve::X25519]);
        }

        self.elliptic_curves
            .iter()
            .map(|name| match name.as_str() {
                "secp256r1" => Ok(EllipticCurve::Secp256r1),
                "x25519" => Ok(EllipticCurve::X25519),
                other => Err(anyhow::anyhow!("unknown elliptic curve: {}", other)),
            })
            .collect()
    }
}

impl Default for Fscp {
    fn default() -> Self {
        Self {
            contacts: Vec::new(),
            dynamic_contacts: Vec::new(),
            never_contact: Vec::new(),
            contact_period_secs: Self::contact_period_secs(),
            dynamic_contact_period_secs: Self::dynamic_contact_period_secs(),
            hello_timeout_ms: Self::hello_timeout_ms(),
            session_timeout_secs: Self::session_timeout_secs(),
            idle_timeout_secs: Self::idle_timeout_secs(),
            keepalive_period_secs: Self::keepalive_period_secs(),
            session_max_age_secs: Self::session_max_age_secs(),
            session_max_bytes: Self::session_max_bytes(),
            cipher_suites: Vec::new(),
            elliptic_curves: Vec::new(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TapMode {
    #[default]
    Tap,
    Tun,
    Disabled,
}

#[derive(Deserialize, Debug)]
pub struct DhcpEntry {
    /// Client hardware address, `aa:bb:cc:dd:ee:ff`.
    pub hardware_address: String,
    pub address: Ipv4Addr,
    pub prefix_len: u8,
}

#[derive(Deserialize, Debug)]
pub struct Tap {
    #[serde(default)]
    pub mode: TapMode,

    /// Interface name used for OS registrations.
    #[serde(default = "Tap::name")]
    pub name: String,

    #[serde(default = "Tap::mtu")]
    pub mtu: usize,

    /// A pre-opened TAP/TUN device descriptor (non-blocking). Opening the
    /// device node is left to the launcher.
    pub device_fd: Option<i32>,

    /// Interface IPv4 address, `address/prefix`.
    pub ipv4: Option<IpNetwork>,

    #[serde(default)]
    pub arp_proxy_enabled: bool,

    /// Static `ipv4 -> mac` answers for the ARP proxy.
    #[serde(default)]
    pub arp_entries: HashMap<Ipv4Addr, String>,

    #[serde(default)]
    pub dhcp_proxy_enabled: bool,

    /// Address the DHCP proxy answers from (usually the TAP address).
    pub dhcp_server_address: Option<Ipv4Addr>,

    #[serde(default)]
    pub dhcp_entries: Vec<DhcpEntry>,

    #[serde(default = "Tap::dhcp_lease_secs")]
    pub dhcp_lease_secs: u32,

    /// DNS servers offered in DHCP leases.
    #[serde(default)]
    pub dns_servers: Vec<Ipv4Addr>,
}

impl Tap {
    fn name() -> String {
        "fscp0".to_string()
    }

    fn mtu() -> usize {
        1500
    }

    fn dhcp_lease_secs() -> u32 {
        3600
    }
}

impl Default for Tap {
    fn default() -> Self {
        Self {
            mode: TapMode::default(),
            name: Self::name(),
            mtu: Self::mtu(),
            device_fd: None,
            ipv4: None,
            arp_proxy_enabled: false,
            arp_entries: HashMap::new(),
            dhcp_proxy_enabled: false,
            dhcp_server_address: None,
            dhcp_entries: Vec::new(),
            dhcp_lease_secs: Self::dhcp_lease_secs(),
            dns_servers: Vec::new(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SwitchMode {
    #[default]
    Switch,
    Hub,
}

#[derive(Deserialize, Debug)]
pub struct SwitchConfig {
    #[serde(default)]
    pub mode: SwitchMode,

    /// Whether frames may be forwarded between two remote peers.
    #[serde(default)]
    pub relay: bool,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            mode: SwitchMode::default(),
            relay: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RouteScope {
    None,
    #[default]
    UnicastInNetwork,
    Unicast,
    Subnet,
    Any,
}

#[derive(Deserialize, Debug)]
pub struct RouterConfig {
    /// Networks reachable through the local adapter.
    #[serde(default)]
    pub local_routes: Vec<IpNetwork>,

    /// Whether frames may be routed between two remote peers.
    #[serde(default)]
    pub client_routing: bool,

    /// Which routes learned from peers are accepted.
    #[serde(default)]
    pub internal_route_scope: RouteScope,

    #[serde(default = "RouterConfig::maximum_routes_limit")]
    pub maximum_routes_limit: usize,
}

impl RouterConfig {
    fn maximum_routes_limit() -> usize {
        1
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            local_routes: Vec::new(),
            client_routing: false,
            internal_route_scope: RouteScope::default(),
            maximum_routes_limit: Self::maximum_routes_limit(),
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct SystemConfig {
    /// Whether addresses and routes are pushed into the host OS.
    #[serde(default)]
    pub register_routes: bool,

    pub route_metric: Option<u32>,

    /// DNS servers registered for the interface (TUN mode).
    #[serde(default)]
    pub dns_servers: Vec<std::net::IpAddr>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            register_routes: false,
            route_metric: None,
            dns_servers: Vec::new(),
        }
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct Log {
    /// An enum representing the available verbosity levels of the logger.
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub tunnel: Tunnel,
    #[serde(default)]
    pub security: Security,
    #[serde(default)]
    pub fscp: Fscp,
    #[serde(default)]
    pub tap: Tap,
    #[serde(default)]
    pub switch: SwitchConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    /// specify the configuration file path.
    #[arg(long)]
    config: Option<String>,
}

impl Config {
    /// Load command line parameters; if a configuration file path is given
    /// the configuration is read from it, otherwise defaults apply.
    pub fn load() -> anyhow::Result<Self> {
        let cfg_str = Cli::parse()
            .config
            .map(std::fs::read_to_string)
            .transpose()?
            .unwrap_or_default();

        let cfg_str = if cfg_str.trim().is_empty() {
            "{}".to_string()
        } else {
            cfg_str
        };

        Ok(serde_json5::from_str(&cfg_str)?)
    }
}

/// Parse a `aa:bb:cc:dd:ee:ff` hardware address.
pub fn parse_hardware_address(text: &str) -> anyhow::Result<[u8; 6]> {
    let mut out = [0u8; 6];
    let parts: Vec<&str> = text.split(':').collect();
    if parts.len() != 6 {
        anyhow::bail!("invalid hardware address: {}", text);
    }

    for (byte, part) in out.iter_mut().zip(parts) {
        *byte = u8::from_str_radix(part, 16)
            .map_err(|_| anyhow::anyhow!("invalid hardware address: {}", text))?;
    }

    Ok(out)
}
