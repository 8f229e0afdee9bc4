use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::Notify;

/// The single failure a [PacketIo] reports to its callers: its background machinery is gone,
///  and the object is unusable.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct EngineNotRunning;
impl Display for EngineNotRunning {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "packet I/O engine is not running")
    }
}
impl std::error::Error for EngineNotRunning {}

/// Readiness notifications for integrating a [PacketIo] into a caller's own wait loop: `read`
///  is notified when data may be available for reading, `write` when there may be room for
///  more writes. Notifications are hints: a read after a notification can still return nothing.
#[derive(Debug, Clone, Default)]
pub struct SelectHandles {
    pub read: Arc<Notify>,
    pub write: Arc<Notify>,
}
impl SelectHandles {
    pub fn new() -> SelectHandles {
        Default::default()
    }
}

/// Non-blocking, datagram oriented I/O. None of the methods wait for the network: reads return
///  what is available right now, writes are queued for sending.
pub trait PacketIo {
    /// Returns the number of bytes copied into `buf`, 0 if nothing is available
    fn read(&mut self, buf: &mut [u8]) -> anyhow::Result<usize> {
        Ok(self.read_from(buf)?
            .map(|(len, _)| len)
            .unwrap_or(0))
    }

    /// Returns the number of bytes copied into `buf` and the datagram's source, `None` if
    ///  nothing is available
    fn read_from(&mut self, buf: &mut [u8]) -> anyhow::Result<Option<(usize, SocketAddr)>>;

    /// Returns the number of bytes accepted for sending, which is all of them on success
    fn write(&self, buf: &[u8]) -> anyhow::Result<usize>;

    fn write_to(&self, buf: &[u8], destination: SocketAddr) -> anyhow::Result<usize>;

    fn select_handles(&self) -> SelectHandles;

    /// the sender of the most recently read datagram
    fn source_of_last_read_packet(&self) -> Option<SocketAddr>;

    fn max_packet_size(&self) -> usize;

    fn set_max_packet_size(&mut self, max_packet_size: usize) -> anyhow::Result<()>;

    /// Idempotent. Afterwards, all reads and writes fail with [EngineNotRunning].
    fn shutdown(&mut self);
}
