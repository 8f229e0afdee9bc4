use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use anyhow::bail;

use crate::simcast::control_packet::{CONTROL_HEADER_LEN, GOSSIP_ENTRY_LEN, MAX_GOSSIP_ENTRIES_PER_ACK};

/// Payload size of a UDP packet in a full Ethernet frame, leaving room for optional IP headers
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1388;

/// maximum payload of an IPv4 UDP datagram
pub const MAX_UDP_PAYLOAD: usize = 65507;

#[derive(Debug, Clone)]
pub struct SimcastConfig {
    /// Interval for sending discovery pings to the real multicast group, finding members we do
    ///  not know about yet. This also determines how often members are checked for timeouts.
    pub ping_interval: Duration,
    /// A member we have not heard from in this many ping intervals is dropped. Once it has been
    ///  silent for half that period, it is probed with a direct unicast ping.
    pub timeout_ping_interval_count: u32,
    /// number of other members piggybacked on each discovery ack
    pub max_gossip_entries: usize,
    /// Size of the receive buffer for incoming datagrams; bigger datagrams are truncated.
    ///  This can be raised e.g. on networks with jumbo frames.
    pub max_packet_size: usize,
    /// bound of the channels between the facade and the network thread (each direction)
    pub channel_capacity: usize,
    pub multicast_ttl: u32,
    /// Send discovery pings to other processes on the same host. This is what allows several
    ///  members on a single machine to find each other.
    pub multicast_loop: bool,
    /// The local interface address identifying this member. If none is configured, it is
    ///  discovered from the host's network interfaces.
    pub local_interface: Option<IpAddr>,
}

impl SimcastConfig {
    pub fn new() -> SimcastConfig {
        SimcastConfig {
            ping_interval: Duration::from_secs(10),
            timeout_ping_interval_count: 5,
            max_gossip_entries: MAX_GOSSIP_ENTRIES_PER_ACK,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            channel_capacity: 1024,
            multicast_ttl: 1,
            multicast_loop: true,
            local_interface: None,
        }
    }

    pub fn timeout_period(&self) -> Duration {
        self.ping_interval * self.timeout_ping_interval_count
    }

    pub fn half_timeout_period(&self) -> Duration {
        self.timeout_period() / 2
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ping_interval.is_zero() {
            bail!("ping interval must not be zero");
        }
        if self.timeout_ping_interval_count == 0 {
            bail!("timeout ping interval count must not be zero");
        }
        if self.max_gossip_entries > MAX_GOSSIP_ENTRIES_PER_ACK {
            bail!("at most {} gossip entries fit into a discovery ack, configured {}", MAX_GOSSIP_ENTRIES_PER_ACK, self.max_gossip_entries);
        }
        self.validate_max_packet_size(self.max_packet_size)?;
        if self.channel_capacity == 0 {
            bail!("channel capacity must not be zero");
        }
        Ok(())
    }

    /// The receive buffer must hold a complete discovery ack: a truncated control packet can not
    ///  be recognized and would be delivered as user data.
    pub fn validate_max_packet_size(&self, max_packet_size: usize) -> anyhow::Result<()> {
        if max_packet_size > MAX_UDP_PAYLOAD {
            bail!("max packet size must be at most {}, was {}", MAX_UDP_PAYLOAD, max_packet_size);
        }
        let max_ack_len = CONTROL_HEADER_LEN + GOSSIP_ENTRY_LEN * self.max_gossip_entries;
        if max_packet_size < max_ack_len {
            bail!("max packet size {} is too small for discovery acks of up to {} bytes", max_packet_size, max_ack_len);
        }
        Ok(())
    }

    pub fn validate_group_addr(group: SocketAddr) -> anyhow::Result<()> {
        if !group.ip().is_multicast() {
            bail!("{} is not a multicast address", group.ip());
        }
        if group.port() == 0 {
            bail!("group address {} has no port", group);
        }
        Ok(())
    }
}

impl Default for SimcastConfig {
    fn default() -> Self {
        Self::new()
    }
}
