pub mod config;
pub mod core;
pub mod device;
pub mod observer;
pub mod proxy;
pub mod router;
pub mod server;
pub mod statistics;
pub mod switch;

use std::sync::Arc;

use anyhow::Context;
use log::warn;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::unbounded_channel;

use service::identity::Identity;
use service::validate::Validator;
use service::{Service, ServiceOptions};

use crate::config::{Config, TapMode, parse_hardware_address};
use crate::core::CoreOptions;
use crate::device::DeviceInfo;
use crate::observer::Observer;
use crate::proxy::{ArpProxy, DhcpProxy, DhcpProxyOptions};
use crate::router::Router;
use crate::server::ServerCommand;
use crate::statistics::Statistics;
use crate::switch::Switch;

/// Build and run the daemon until interrupted. Split from `main` so
/// integration tests can start a full node in-process.
pub async fn daemon_main(config: Arc<Config>) -> anyhow::Result<()> {
    let identity = load_identity(&config)?;
    let validator = load_validator(&config)?;
    let dynamic_contacts = load_dynamic_contacts(&config)?;

    let (events_tx, events_rx) = unbounded_channel();
    let (commands_tx, commands_rx) = unbounded_channel();

    let mut options = ServiceOptions::new(identity, validator, Observer::new(events_tx));
    options.timers = config.fscp.timers();
    options.cipher_suites = config.fscp.cipher_suites()?;
    options.elliptic_curves = config.fscp.elliptic_curves()?;
    options.banned_networks = config.fscp.never_contact.clone();
    let service = Service::new(options);
    let local_hash = service.local_hash();

    let socket = UdpSocket::bind(config.tunnel.listen)
        .await
        .with_context(|| format!("binding {}", config.tunnel.listen))?;

    let device = open_device(&config, &local_hash)?;
    let device_name = device
        .as_ref()
        .map(|device| device.info.name.clone())
        .unwrap_or_else(|| config.tap.name.clone());
    let hardware_address = device
        .as_ref()
        .map(|device| device.info.hardware_address)
        .unwrap_or([0x02, 0, 0, 0, 0, 0x01]);

    // Scoped OS registrations live exactly as long as the daemon runs.
    let _registrations = register_system(&config, &device_name)?;

    let arp_proxy = (config.tap.mode == TapMode::Tap && config.tap.arp_proxy_enabled)
        .then(|| -> anyhow::Result<ArpProxy> {
            let mut proxy = ArpProxy::new();
            for (address, hardware) in &config.tap.arp_entries {
                proxy.add_entry(*address, parse_hardware_address(hardware)?);
            }

            Ok(proxy)
        })
        .transpose()?;

    let dhcp_proxy = (config.tap.mode == TapMode::Tap && config.tap.dhcp_proxy_enabled)
        .then(|| -> anyhow::Result<DhcpProxy> {
            let server_address = config
                .tap
                .dhcp_server_address
                .context("dhcp proxy enabled without a server address")?;

            let mut proxy = DhcpProxy::new(DhcpProxyOptions {
                server_address,
                server_hardware: hardware_address,
                lease: std::time::Duration::from_secs(config.tap.dhcp_lease_secs.into()),
                dns_servers: config.tap.dns_servers.clone(),
            });
            for entry in &config.tap.dhcp_entries {
                proxy.add_entry(
                    parse_hardware_address(&entry.hardware_address)?,
                    entry.address,
                    entry.prefix_len,
                );
            }

            Ok(proxy)
        })
        .transpose()?;

    let statistics = Statistics::default();
    let server = tokio::spawn(server::run(socket, service, commands_rx, statistics));

    let core = tokio::spawn(core::run(CoreOptions {
        mode: config.tap.mode,
        commands: commands_tx.clone(),
        events: events_rx,
        device,
        switch: Switch::new(config.switch.mode, config.switch.relay),
        router: Router::new(
            config.router.client_routing,
            config.router.internal_route_scope,
            config.router.maximum_routes_limit,
        ),
        arp_proxy,
        dhcp_proxy,
        local_routes: config.router.local_routes.clone(),
        contacts: config.fscp.contacts.clone(),
        dynamic_contacts,
        never_contact: config.fscp.never_contact.clone(),
        contact_period: config.fscp.contact_period(),
        dynamic_contact_period: config.fscp.dynamic_contact_period(),
    }));

    tokio::signal::ctrl_c().await?;
    log::info!("interrupted, closing sessions");
    let _ = commands_tx.send(ServerCommand::Close);

    server.await??;
    core.await?;
    Ok(())
}

fn load_identity(config: &Config) -> anyhow::Result<Identity> {
    let (Some(certificate), Some(private_key)) = (
        config.tunnel.certificate.as_ref(),
        config.tunnel.private_key.as_ref(),
    ) else {
        anyhow::bail!("tunnel.certificate and tunnel.private_key are required");
    };

    Ok(Identity::from_files(certificate, private_key)?)
}

fn load_validator(config: &Config) -> anyhow::Result<Validator> {
    let mut validator = Validator::new(
        config.security.validation_method(),
        config.security.revocation_policy(),
    );

    if let Some(path) = &config.security.authorities {
        let bundle = std::fs::read(path).with_context(|| format!("reading {:?}", path))?;
        let count = validator
            .add_authority_bundle(&bundle)
            .map_err(|e| anyhow::anyhow!("loading authorities: {}", e))?;
        log::info!("loaded {} authorities from {:?}", count, path);
    }

    for path in &config.security.crls {
        let der = std::fs::read(path).with_context(|| format!("reading {:?}", path))?;
        validator
            .add_crl(der)
            .map_err(|e| anyhow::anyhow!("loading crl {:?}: {}", path, e))?;
    }

    Ok(validator)
}

fn load_dynamic_contacts(config: &Config) -> anyhow::Result<Vec<[u8; 32]>> {
    let mut hashes = Vec::with_capacity(config.fscp.dynamic_contacts.len());
    for path in &config.fscp.dynamic_contacts {
        let bytes = std::fs::read(path).with_context(|| format!("reading {:?}", path))?;
        let der = service::validate::certificate_der(&bytes)
            .map_err(|e| anyhow::anyhow!("loading {:?}: {}", path, e))?;
        hashes.push(codec::crypto::sha256(&der));
    }

    Ok(hashes)
}

fn open_device(
    config: &Config,
    local_hash: &[u8; 32],
) -> anyhow::Result<Option<device::Device>> {
    if config.tap.mode == TapMode::Disabled {
        return Ok(None);
    }

    // A stable, locally administered hardware address derived from the
    // node identity.
    let hardware_address = [
        0x02,
        local_hash[0],
        local_hash[1],
        local_hash[2],
        local_hash[3],
        local_hash[4],
    ];

    let info = DeviceInfo {
        name: config.tap.name.clone(),
        mtu: config.tap.mtu,
        hardware_address,
    };

    match config.tap.device_fd {
        #[cfg(unix)]
        Some(fd) => {
            use std::os::fd::{FromRawFd, OwnedFd};

            // The launcher opened the descriptor for us and handed over
            // ownership through the configuration.
            let fd = unsafe { OwnedFd::from_raw_fd(fd) };
            Ok(Some(device::from_fd(info, fd)?))
        }
        #[cfg(not(unix))]
        Some(_) => anyhow::bail!("pre-opened device descriptors need a unix host"),
        None => {
            warn!("no adapter descriptor configured, running detached");
            Ok(None)
        }
    }
}

struct SystemRegistrations {
    // Handles are declared first: they must drop before the manager for
    // their unregistrations to reach the OS.
    _handles: Vec<netman::Handle>,
    _manager: netman::NetworkManager,
}

fn register_system(
    config: &Config,
    interface: &str,
) -> anyhow::Result<Option<SystemRegistrations>> {
    if !config.system.register_routes {
        return Ok(None);
    }

    #[cfg(unix)]
    let system: Box<dyn netman::System> = Box::new(netman::UnixSystem);
    #[cfg(windows)]
    let system: Box<dyn netman::System> = Box::new(netman::WindowsSystem);

    let manager = netman::NetworkManager::new(netman::NetworkManagerOptions::new(system));
    let mut handles = Vec::new();

    if let Some(network) = config.tap.ipv4 {
        handles.push(manager.add_address(netman::Address {
            interface: interface.to_string(),
            address: network.ip(),
            prefix_len: network.prefix(),
            remote: None,
        }));
    }

    for route in &config.router.local_routes {
        handles.push(manager.add_route(netman::Route {
            interface: interface.to_string(),
            destination: *route,
            gateway: None,
            metric: config.system.route_metric,
        }));
    }

    for server in &config.system.dns_servers {
        handles.push(manager.add_dns_server(netman::DnsServer {
            interface: interface.to_string(),
            address: *server,
        }));
    }

    Ok(Some(SystemRegistrations {
        _handles: handles,
        _manager: manager,
    }))
}
