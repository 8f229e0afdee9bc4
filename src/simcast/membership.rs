use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::ops::Bound::{Excluded, Unbounded};
use tracing::debug;

/// Known members of the simulated multicast group, keyed by their unicast endpoint, with the
///  time (on the engine's microsecond clock) we last heard from them.
///
/// Ordered so that gossip snapshots are deterministic.
#[derive(Debug, Default)]
pub struct MembershipTable {
    members: BTreeMap<SocketAddr, u64>,
}

impl MembershipTable {
    pub fn new() -> MembershipTable {
        Default::default()
    }

    /// Records that we heard from `endpoint` at `timestamp`. Timestamps only move forward:
    ///  older information (e.g. second-hand gossip) never overwrites more recent information.
    pub fn note_heard(&mut self, endpoint: SocketAddr, timestamp: u64) {
        match self.members.entry(endpoint) {
            Entry::Occupied(mut e) => {
                if *e.get() < timestamp {
                    e.insert(timestamp);
                }
            }
            Entry::Vacant(e) => {
                e.insert(timestamp);
                debug!("new member {:?} added to the simulated multicast group, now there are {} members", endpoint, self.members.len());
            }
        }
    }

    /// Returns `true` if the member was known
    pub fn remove(&mut self, endpoint: &SocketAddr) -> bool {
        self.members.remove(endpoint).is_some()
    }

    /// Drops members we have not heard from for `timeout_period` (or longer), and returns
    ///  those that have been silent for `half_timeout_period` without timing out yet - they
    ///  should be probed directly before they are dropped.
    pub fn prune(&mut self, now: u64, timeout_period: u64, half_timeout_period: u64) -> Vec<SocketAddr> {
        let mut to_probe = Vec::new();

        self.members.retain(|endpoint, last_heard| {
            let age = now.saturating_sub(*last_heard);
            if age >= timeout_period {
                debug!("dropping moribund simulated multicast member {:?}", endpoint);
                false
            }
            else {
                if age >= half_timeout_period {
                    to_probe.push(*endpoint);
                }
                true
            }
        });

        to_probe
    }

    /// Up to `max_count` members with their last-heard timestamps, for piggybacking on a discovery
    ///  ack. If `myself` is in the table, iteration starts right after it in the ring of members,
    ///  wrapping around; otherwise it starts at the start of the table.
    pub fn snapshot(&self, max_count: usize, myself: Option<SocketAddr>, exclude: SocketAddr) -> Vec<(SocketAddr, u64)> {
        let anchor = myself.filter(|myself| self.members.contains_key(myself));
        let ring: Box<dyn Iterator<Item = (&SocketAddr, &u64)>> = match anchor {
            Some(myself) => Box::new(
                self.members.range((Excluded(myself), Unbounded))
                    .chain(self.members.range((Unbounded, Excluded(myself))))
            ),
            None => Box::new(self.members.iter()),
        };

        ring
            .filter(|(endpoint, _)| **endpoint != exclude)
            .take(max_count)
            .map(|(endpoint, last_heard)| (*endpoint, *last_heard))
            .collect()
    }

    pub fn members(&self) -> impl Iterator<Item = &SocketAddr> {
        self.members.keys()
    }

    pub fn last_heard(&self, endpoint: &SocketAddr) -> Option<u64> {
        self.members.get(endpoint).copied()
    }

    pub fn contains(&self, endpoint: &SocketAddr) -> bool {
        self.members.contains_key(endpoint)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
