use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::warn;

use crate::simcast::control_packet::{decode_control_packet, encode_control_packet, ControlCommand, MAX_GOSSIP_ENTRIES_PER_ACK};
use crate::simcast::simcast_config::SimcastConfig;
use crate::simcast::sockets::SimcastSockets;

/// Checks if this environment allows joining `group`, so tests that need real multicast traffic
///  can skip themselves where it is not available
pub fn multicast_is_available(group: SocketAddr) -> bool {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(_) => return false,
    };

    match runtime.block_on(async { SimcastSockets::open(&SimcastConfig::new(), group) }) {
        Ok(_) => true,
        Err(e) => {
            warn!("multicast group {} is not available, skipping test: {:#}", group, e);
            false
        }
    }
}

/// A group member driven by test code, speaking the wire protocol directly: it listens on the
///  real multicast group, and it has a unicast socket of its own for direct traffic.
pub struct TestMember {
    listener: UdpSocket,
    unicast: UdpSocket,
}

impl TestMember {
    const POLL_INTERVAL: Duration = Duration::from_millis(10);

    pub fn join(group: SocketAddr) -> anyhow::Result<TestMember> {
        let IpAddr::V4(group_ip) = group.ip() else {
            bail!("test members support IPv4 groups only");
        };

        let listener = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        listener.set_reuse_address(true)?;
        #[cfg(unix)]
        listener.set_reuse_port(true)?;
        listener.bind(&SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), group.port()).into())?;
        listener.join_multicast_v4(&group_ip, &Ipv4Addr::UNSPECIFIED)?;
        let listener: UdpSocket = listener.into();
        listener.set_read_timeout(Some(Self::POLL_INTERVAL))?;

        let unicast = UdpSocket::bind(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0))?;
        unicast.set_read_timeout(Some(Self::POLL_INTERVAL))?;

        Ok(TestMember { listener, unicast })
    }

    pub fn unicast_port(&self) -> anyhow::Result<u16> {
        Ok(self.unicast.local_addr()?.port())
    }

    pub fn send_control(&self, command: ControlCommand, to: SocketAddr) -> anyhow::Result<()> {
        let buf = encode_control_packet(command, 0, to, to, &[], MAX_GOSSIP_ENTRIES_PER_ACK);
        self.unicast.send_to(&buf, to)?;
        Ok(())
    }

    pub fn send_data(&self, buf: &[u8], to: SocketAddr) -> anyhow::Result<()> {
        self.unicast.send_to(buf, to)?;
        Ok(())
    }

    /// Waits for a control packet with the given command on either socket, returning its sender.
    ///  Everything else that arrives in the meantime is discarded.
    pub fn wait_for_control_packet(&self, command: ControlCommand, timeout: Duration) -> anyhow::Result<SocketAddr> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            for socket in [&self.listener, &self.unicast] {
                if let Some((buf, from)) = Self::try_recv(socket)? {
                    if matches!(decode_control_packet(&buf, 0), Ok(packet) if packet.command == command) {
                        return Ok(from);
                    }
                }
            }
        }
        Err(anyhow!("no {:?} received within {:?}", command, timeout))
    }

    /// Waits for a datagram that is not a control packet on the unicast socket. Control packets
    ///  that arrive in the meantime are discarded.
    pub fn wait_for_data(&self, timeout: Duration) -> anyhow::Result<Option<(Vec<u8>, SocketAddr)>> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some((buf, from)) = Self::try_recv(&self.unicast)? {
                if decode_control_packet(&buf, 0).is_err() {
                    return Ok(Some((buf, from)));
                }
            }
        }
        Ok(None)
    }

    fn try_recv(socket: &UdpSocket) -> anyhow::Result<Option<(Vec<u8>, SocketAddr)>> {
        let mut buf = [0u8; 2048];
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => Ok(Some((buf[..len].to_vec(), from))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
