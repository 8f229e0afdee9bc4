use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use rustc_hash::FxHashSet;
use tracing::{debug, trace, warn};

use crate::simcast::control_packet::{decode_control_packet, encode_control_packet, ControlCommand, ControlPacketError};
use crate::simcast::membership::MembershipTable;
use crate::simcast::outgoing::{DatagramSink, OutgoingScheduler};
use crate::simcast::simcast_config::SimcastConfig;
use crate::util::safe_converter::SaturatingCast;

/// Messages from the facade to the network thread
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum OutboundCommand {
    /// `None` or the group address as destination means 'all members of the group'
    Write { data: Bytes, destination: Option<SocketAddr> },
    SetMaxPacketSize(usize),
    Shutdown,
}

/// A datagram received from some member, on its way from the network thread to the facade
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct InboundPayload {
    pub data: Bytes,
    pub source: SocketAddr,
}

/// The endpoint other members see us as, i.e. the address of our unicast socket
#[derive(Debug, Clone)]
pub struct LocalEndpoint {
    pub addr: SocketAddr,
    /// All addresses of local network interfaces: a looped-back datagram can arrive with any of
    ///  these as its source address
    pub interface_addrs: FxHashSet<IpAddr>,
}
impl LocalEndpoint {
    pub fn is_myself(&self, endpoint: &SocketAddr) -> bool {
        endpoint.port() == self.addr.port() && self.interface_addrs.contains(&endpoint.ip())
    }
}

/// Protocol logic of a single simulated multicast group member, independent of sockets and
///  threads: it consumes received datagrams, writes from the facade and timer ticks, and
///  produces outgoing datagrams (queued per destination) and payloads for the facade.
pub struct SimcastEngine {
    config: Arc<SimcastConfig>,
    group: SocketAddr,
    myself: LocalEndpoint,
    membership: MembershipTable,
    outgoing: OutgoingScheduler,
}

impl SimcastEngine {
    pub fn new(config: Arc<SimcastConfig>, group: SocketAddr, myself: LocalEndpoint) -> SimcastEngine {
        SimcastEngine {
            config,
            group,
            myself,
            membership: MembershipTable::new(),
            outgoing: OutgoingScheduler::new(),
        }
    }

    pub fn group(&self) -> SocketAddr {
        self.group
    }

    pub fn myself(&self) -> &LocalEndpoint {
        &self.myself
    }

    pub fn membership(&self) -> &MembershipTable {
        &self.membership
    }

    pub fn outgoing(&self) -> &OutgoingScheduler {
        &self.outgoing
    }

    pub fn has_pending_output(&self) -> bool {
        self.outgoing.has_pending()
    }

    /// User data never goes to the real multicast group: writing to the group means sending
    ///  it to every member we know of, one unicast datagram each.
    pub fn on_write(&mut self, data: Bytes, destination: Option<SocketAddr>) {
        match destination {
            Some(destination) if destination != self.group => {
                trace!("enqueueing {} bytes for {:?}", data.len(), destination);
                self.outgoing.enqueue_direct(data, destination);
            }
            _ => {
                trace!("enqueueing {} bytes for {} members", data.len(), self.membership.len());
                self.outgoing.enqueue_fan_out(data, self.membership.members());
            }
        }
    }

    /// Handles a datagram received on either socket. Control packets update membership (and
    ///  may trigger a reply), everything else is user data that is returned for delivery to
    ///  the facade.
    pub fn on_datagram(&mut self, data: Bytes, from: SocketAddr, now: u64) -> Option<InboundPayload> {
        if self.myself.is_myself(&from) {
            trace!("ignoring datagram from myself");
            return None;
        }

        match decode_control_packet(&data, now) {
            Ok(packet) => {
                match packet.command {
                    ControlCommand::DepartureNotice => {
                        if self.membership.remove(&from) {
                            debug!("simulated multicast member {:?} has left the group ({} members remain)", from, self.membership.len());
                        }
                        return None;
                    }
                    ControlCommand::DiscoveryPing => {
                        trace!("received discovery ping from {:?}", from);
                        self.membership.note_heard(from, now);
                        self.send_control(ControlCommand::DiscoveryAck, from, now);
                    }
                    ControlCommand::DiscoveryAck => {
                        trace!("received discovery ack from {:?} with {} gossip entries", from, packet.gossip.len());
                        self.membership.note_heard(from, now);
                    }
                }

                for (endpoint, last_heard) in packet.gossip {
                    if !self.myself.is_myself(&endpoint) && endpoint != self.group {
                        self.membership.note_heard(endpoint, last_heard);
                    }
                }
                None
            }
            Err(ControlPacketError::UnknownCommand(code)) => {
                warn!("received control packet with unexpected command {} from {:?} - ignoring", code, from);
                None
            }
            Err(ControlPacketError::NotAControlPacket) => {
                self.membership.note_heard(from, now);
                Some(InboundPayload {
                    data,
                    source: from,
                })
            }
        }
    }

    /// Periodic discovery: one ping to the real multicast group for members we do not know
    ///  yet, timeout pruning, and direct pings to members that have been silent for a while.
    pub fn on_ping_timer(&mut self, now: u64) {
        debug!("periodic discovery ping, {} known members", self.membership.len());
        self.send_control(ControlCommand::DiscoveryPing, self.group, now);

        let timeout_period: u64 = self.config.timeout_period().as_micros().saturating_cast();
        let half_timeout_period: u64 = self.config.half_timeout_period().as_micros().saturating_cast();
        for member in self.membership.prune(now, timeout_period, half_timeout_period) {
            debug!("probing quiet member {:?}", member);
            self.send_control(ControlCommand::DiscoveryPing, member, now);
        }
    }

    pub fn drain_when_writable(&mut self, sink: &impl DatagramSink) -> usize {
        self.outgoing.drain_when_writable(sink)
    }

    /// Departure notices for a graceful shutdown: one to the real multicast group, and one
    ///  to every known member directly in case it misses the multicast.
    pub fn departure_notices(&self, now: u64) -> Vec<(Bytes, SocketAddr)> {
        let notice = self.encode_control(ControlCommand::DepartureNotice, self.group, now);

        std::iter::once(self.group)
            .chain(self.membership.members().copied())
            .map(|destination| (notice.clone(), destination))
            .collect()
    }

    fn send_control(&mut self, command: ControlCommand, destination: SocketAddr, now: u64) {
        let buf = self.encode_control(command, destination, now);
        self.outgoing.enqueue_direct(buf, destination);
    }

    fn encode_control(&self, command: ControlCommand, destination: SocketAddr, now: u64) -> Bytes {
        let snapshot = if command == ControlCommand::DiscoveryAck {
            self.membership.snapshot(self.config.max_gossip_entries, Some(self.myself.addr), destination)
        }
        else {
            Vec::new()
        };
        encode_control_packet(command, now, destination, self.group, &snapshot, self.config.max_gossip_entries)
            .freeze()
    }
}
