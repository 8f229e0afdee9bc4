use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::{anyhow, Context};
use rustc_hash::FxHashSet;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::simcast::engine::LocalEndpoint;
use crate::simcast::simcast_config::SimcastConfig;

/// The two sockets of a simulated multicast member: one bound to the group's port and joined
///  to the real multicast group (receiving discovery pings), and one on an ephemeral port that
///  does all the sending and receives everything that is addressed to this member directly.
pub struct SimcastSockets {
    pub multicast: UdpSocket,
    pub unicast: UdpSocket,
    pub myself: LocalEndpoint,
}

impl SimcastSockets {
    /// Must be called from within a Tokio runtime
    pub fn open(config: &SimcastConfig, group: SocketAddr) -> anyhow::Result<SimcastSockets> {
        let (primary_addr, interface_addrs) = local_interface_addrs(config, group)?;

        let multicast = create_multicast_socket(config, group, primary_addr)
            .with_context(|| format!("error creating multicast socket for group {}", group))?;
        let unicast = create_unicast_socket(config, group, primary_addr)
            .context("error creating unicast socket")?;

        let unicast_port = unicast.local_addr()?
            .as_socket()
            .ok_or_else(|| anyhow!("unicast socket is not bound to an internet address"))?
            .port();
        let myself = LocalEndpoint {
            addr: SocketAddr::new(primary_addr, unicast_port),
            interface_addrs,
        };
        debug!("simulated multicast member for group {} is {:?}", group, myself.addr);

        Ok(SimcastSockets {
            multicast: UdpSocket::from_std(multicast.into())?,
            unicast: UdpSocket::from_std(unicast.into())?,
            myself,
        })
    }
}

fn create_multicast_socket(config: &SimcastConfig, group: SocketAddr, primary_addr: IpAddr) -> anyhow::Result<Socket> {
    let socket = Socket::new(Domain::for_address(group), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;

    match group.ip() {
        IpAddr::V4(group_ip) => {
            socket.bind(&SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), group.port()).into())?;
            let interface = match primary_addr {
                IpAddr::V4(addr) if config.local_interface.is_some() => addr,
                _ => Ipv4Addr::UNSPECIFIED,
            };
            socket.join_multicast_v4(&group_ip, &interface)?;
        }
        IpAddr::V6(group_ip) => {
            socket.set_only_v6(true)?;
            socket.bind(&SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), group.port()).into())?;
            socket.join_multicast_v6(&group_ip, 0)?;
        }
    }

    socket.set_nonblocking(true)?;
    Ok(socket)
}

fn create_unicast_socket(config: &SimcastConfig, group: SocketAddr, primary_addr: IpAddr) -> anyhow::Result<Socket> {
    let socket = Socket::new(Domain::for_address(group), Type::DGRAM, Some(Protocol::UDP))?;

    match group {
        SocketAddr::V4(_) => {
            socket.bind(&SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0).into())?;
            socket.set_multicast_ttl_v4(config.multicast_ttl)?;
            socket.set_multicast_loop_v4(config.multicast_loop)?;
            if let (Some(_), IpAddr::V4(interface)) = (config.local_interface, primary_addr) {
                socket.set_multicast_if_v4(&interface)?;
            }
        }
        SocketAddr::V6(_) => {
            socket.set_only_v6(true)?;
            socket.bind(&SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0).into())?;
            socket.set_multicast_hops_v6(config.multicast_ttl)?;
            socket.set_multicast_loop_v6(config.multicast_loop)?;
        }
    }

    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Returns the address identifying this host in the group (the configured interface, or the
///  first non-loopback interface of the group's address family), and the addresses of all
///  local interfaces. Datagrams we send to the group can come back with any of these as their
///  source address.
fn local_interface_addrs(config: &SimcastConfig, group: SocketAddr) -> anyhow::Result<(IpAddr, FxHashSet<IpAddr>)> {
    let mut interface_addrs = FxHashSet::default();
    interface_addrs.insert(IpAddr::V4(Ipv4Addr::LOCALHOST));
    interface_addrs.insert(IpAddr::V6(Ipv6Addr::LOCALHOST));

    match local_ip_address::list_afinet_netifas() {
        Ok(interfaces) => {
            for (name, addr) in interfaces {
                debug!("local network interface {}: {}", name, addr);
                interface_addrs.insert(addr);
            }
        }
        Err(e) => {
            warn!("error listing local network interfaces: {}", e);
        }
    }

    let primary_addr = match config.local_interface {
        Some(addr) => {
            if addr.is_ipv4() != group.is_ipv4() {
                return Err(anyhow!("local interface {} does not match the address family of group {}", addr, group));
            }
            interface_addrs.insert(addr);
            addr
        }
        None => {
            let mut candidates = interface_addrs.iter()
                .filter(|addr| addr.is_ipv4() == group.is_ipv4() && !addr.is_loopback())
                .copied()
                .collect::<Vec<_>>();
            // deterministic choice on hosts with several interfaces
            candidates.sort();
            match candidates.first() {
                Some(addr) => *addr,
                None if group.is_ipv4() => IpAddr::V4(Ipv4Addr::LOCALHOST),
                None => IpAddr::V6(Ipv6Addr::LOCALHOST),
            }
        }
    };

    Ok((primary_addr, interface_addrs))
}
