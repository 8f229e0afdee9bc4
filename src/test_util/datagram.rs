use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;

use crate::simcast::outgoing::DatagramSink;

/// A [DatagramSink] that accepts everything and records what was sent, for later inspection
#[derive(Debug, Default)]
pub struct TrackingDatagramSink {
    tracker: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
}
impl TrackingDatagramSink {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn assert_datagram_sent(&self, to: SocketAddr, buf: &[u8]) {
        let mut lock = self.tracker.lock().unwrap();
        if lock.is_empty() {
            panic!("no datagram was sent");
        }

        let (actual_to, actual_buf) = lock.remove(0);
        assert_eq!(actual_to, to);
        assert_eq!(actual_buf.as_slice(), buf);
    }

    pub fn assert_no_remaining_datagrams(&self) {
        assert!(
            self.tracker.lock().unwrap()
                .is_empty()
        );
    }

    /// returns sent datagrams, clearing the internal buffer
    pub fn sent_datagrams(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        let mut lock = self.tracker.lock().unwrap();
        std::mem::take(&mut *lock)
    }
}

impl DatagramSink for TrackingDatagramSink {
    fn try_send_datagram(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize> {
        self.tracker.lock().unwrap()
            .push((to, buf.to_vec()));
        Ok(buf.len())
    }
}
