use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;

use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tracing::{trace, warn};

/// Non-blocking datagram send, abstracted for testability
#[cfg_attr(test, automock)]
pub trait DatagramSink {
    /// Returns [io::ErrorKind::WouldBlock] if the datagram can not be sent right now
    fn try_send_datagram(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize>;
}

impl DatagramSink for UdpSocket {
    fn try_send_datagram(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize> {
        self.try_send_to(buf, to)
    }
}

/// Per-destination FIFO queues of datagrams waiting for the unicast socket to become writable.
///
/// Buffers are reference counted, so fanning out a payload to many destinations does not copy it.
#[derive(Debug, Default)]
pub struct OutgoingScheduler {
    queues: FxHashMap<SocketAddr, VecDeque<Bytes>>,
    /// destinations with a non-empty queue, in the order they get their next turn
    round_robin: VecDeque<SocketAddr>,
}

impl OutgoingScheduler {
    pub fn new() -> OutgoingScheduler {
        Default::default()
    }

    pub fn enqueue_fan_out<'a>(&mut self, buf: Bytes, members: impl IntoIterator<Item = &'a SocketAddr>) {
        for member in members {
            self.enqueue_direct(buf.clone(), *member);
        }
    }

    pub fn enqueue_direct(&mut self, buf: Bytes, destination: SocketAddr) {
        let queue = self.queues.entry(destination).or_default();
        if queue.is_empty() {
            self.round_robin.push_back(destination);
        }
        queue.push_back(buf);
    }

    pub fn has_pending(&self) -> bool {
        !self.round_robin.is_empty()
    }

    /// total number of queued datagrams across all destinations
    pub fn num_pending(&self) -> usize {
        self.queues.values()
            .map(|q| q.len())
            .sum()
    }

    pub fn num_pending_for(&self, destination: &SocketAddr) -> usize {
        self.queues.get(destination)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Sends queued datagrams until the socket would block or all queues are drained, taking
    ///  one datagram per destination in turn so a deep backlog for one destination does not
    ///  starve the others. A datagram that would block stays at the head of its queue; a
    ///  datagram that fails for any other reason is dropped.
    ///
    /// Returns the number of datagrams that were sent.
    pub fn drain_when_writable(&mut self, sink: &impl DatagramSink) -> usize {
        let mut num_sent = 0;

        while let Some(destination) = self.round_robin.pop_front() {
            let Some(queue) = self.queues.get_mut(&destination) else {
                continue;
            };
            let Some(buf) = queue.front() else {
                self.queues.remove(&destination);
                continue;
            };

            match sink.try_send_datagram(buf, destination) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    trace!("socket would block sending to {:?} - retrying when it becomes writable", destination);
                    self.round_robin.push_front(destination);
                    break;
                }
                Err(e) => {
                    warn!("error sending datagram to {:?} - dropping it: {}", destination, e);
                }
                Ok(_) => {
                    trace!("sent {} bytes to {:?}", buf.len(), destination);
                    num_sent += 1;
                }
            }

            queue.pop_front();
            if queue.is_empty() {
                self.queues.remove(&destination);
            }
            else {
                self.round_robin.push_back(destination);
            }
        }

        num_sent
    }
}
