use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::bail;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tracing::{debug, trace, warn};

use crate::packet_io::{EngineNotRunning, PacketIo, SelectHandles};
use crate::simcast::engine::{InboundPayload, OutboundCommand};
use crate::simcast::network_thread::NetworkThread;
use crate::simcast::simcast_config::SimcastConfig;

/// Multicast-like packet I/O on networks where real multicast is unreliable (Wi-Fi in
///  particular): members find each other through occasional pings to a real multicast group,
///  and all data is sent as unicast datagrams to each known member.
///
/// All methods are non-blocking. Sockets are owned by a dedicated background thread, and this
///  facade talks to it through bounded channels.
///
/// ```no_run
/// use simcast::packet_io::PacketIo;
/// use simcast::simcast::SimulatedMulticastIo;
///
/// let mut io = SimulatedMulticastIo::new("239.255.77.12:24680".parse().unwrap()).unwrap();
/// io.write(b"hello, group").unwrap();
///
/// let mut buf = [0u8; 1500];
/// if let Some((len, from)) = io.read_from(&mut buf).unwrap() {
///     println!("{:?}: {:?}", from, &buf[..len]);
/// }
/// io.shutdown();
/// ```
pub struct SimulatedMulticastIo {
    config: Arc<SimcastConfig>,
    group: SocketAddr,
    max_packet_size: usize,
    commands: Option<mpsc::Sender<OutboundCommand>>,
    inbound: mpsc::Receiver<InboundPayload>,
    select_handles: SelectHandles,
    source_of_last_read_packet: Option<SocketAddr>,
    network_thread: Option<JoinHandle<()>>,
}

impl SimulatedMulticastIo {
    pub fn new(group: SocketAddr) -> anyhow::Result<SimulatedMulticastIo> {
        Self::with_config(group, SimcastConfig::new())
    }

    /// Starts the background thread. Socket setup happens there, so a failure to join the
    ///  group is not reported here: it is logged, and the engine stays idle until shut down.
    pub fn with_config(group: SocketAddr, config: SimcastConfig) -> anyhow::Result<SimulatedMulticastIo> {
        config.validate()?;
        SimcastConfig::validate_group_addr(group)?;
        let config = Arc::new(config);

        let (command_sender, command_receiver) = mpsc::channel(config.channel_capacity);
        let (inbound_sender, inbound_receiver) = mpsc::channel(config.channel_capacity);
        let select_handles = SelectHandles::new();

        let network_thread = NetworkThread::new(config.clone(), group, command_receiver, inbound_sender, select_handles.clone())
            .spawn()?;

        Ok(SimulatedMulticastIo {
            max_packet_size: config.max_packet_size,
            config,
            group,
            commands: Some(command_sender),
            inbound: inbound_receiver,
            select_handles,
            source_of_last_read_packet: None,
            network_thread: Some(network_thread),
        })
    }

    pub fn group_address(&self) -> SocketAddr {
        self.group
    }

    fn is_running(&self) -> bool {
        self.commands.is_some()
            && self.network_thread.as_ref()
                .map(|handle| !handle.is_finished())
                .unwrap_or(false)
    }

    fn running_commands(&self) -> anyhow::Result<&mpsc::Sender<OutboundCommand>> {
        match &self.commands {
            Some(commands) if self.is_running() => Ok(commands),
            _ => Err(EngineNotRunning.into()),
        }
    }

    /// A full outbound channel is reported as 0 bytes written: the caller should retry once
    ///  the write handle is notified.
    fn enqueue_write(&self, buf: &[u8], destination: Option<SocketAddr>) -> anyhow::Result<usize> {
        let cmd = OutboundCommand::Write {
            data: Bytes::copy_from_slice(buf),
            destination,
        };

        match self.running_commands()?.try_send(cmd) {
            Ok(()) => Ok(buf.len()),
            Err(TrySendError::Full(_)) => {
                trace!("outbound channel is full - not accepting {} bytes", buf.len());
                Ok(0)
            }
            Err(TrySendError::Closed(_)) => Err(EngineNotRunning.into()),
        }
    }
}

impl PacketIo for SimulatedMulticastIo {
    fn read_from(&mut self, buf: &mut [u8]) -> anyhow::Result<Option<(usize, SocketAddr)>> {
        if !self.is_running() {
            return Err(EngineNotRunning.into());
        }

        let payload = match self.inbound.try_recv() {
            Ok(payload) => payload,
            Err(TryRecvError::Empty) => return Ok(None),
            Err(TryRecvError::Disconnected) => return Err(EngineNotRunning.into()),
        };

        let len = payload.data.len().min(buf.len());
        if len < payload.data.len() {
            warn!("read buffer of {} bytes is too small for a datagram of {} bytes from {:?} - truncating", buf.len(), payload.data.len(), payload.source);
        }
        buf[..len].copy_from_slice(&payload.data[..len]);

        self.source_of_last_read_packet = Some(payload.source);
        Ok(Some((len, payload.source)))
    }

    fn write(&self, buf: &[u8]) -> anyhow::Result<usize> {
        self.enqueue_write(buf, None)
    }

    fn write_to(&self, buf: &[u8], destination: SocketAddr) -> anyhow::Result<usize> {
        self.enqueue_write(buf, Some(destination))
    }

    fn select_handles(&self) -> SelectHandles {
        self.select_handles.clone()
    }

    fn source_of_last_read_packet(&self) -> Option<SocketAddr> {
        self.source_of_last_read_packet
    }

    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    fn set_max_packet_size(&mut self, max_packet_size: usize) -> anyhow::Result<()> {
        self.config.validate_max_packet_size(max_packet_size)?;
        if self.running_commands()?.try_send(OutboundCommand::SetMaxPacketSize(max_packet_size)).is_err() {
            bail!("outbound channel is not accepting commands right now");
        }
        self.max_packet_size = max_packet_size;
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some(commands) = self.commands.take() {
            // if the channel is full, dropping the sender below stops the thread as well
            let _ = commands.try_send(OutboundCommand::Shutdown);
        }

        if let Some(handle) = self.network_thread.take() {
            debug!("waiting for network thread of simulated multicast group {} to stop", self.group);
            if handle.join().is_err() {
                warn!("network thread of simulated multicast group {} panicked", self.group);
            }
        }
    }
}

impl Drop for SimulatedMulticastIo {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use rstest::rstest;
    use tokio::time;

    use crate::test_util::multicast::multicast_is_available;
    use super::*;

    /// A group on a port unlikely to be in use. Whether the background thread can actually join
    ///  it depends on the environment, and the facade must behave the same either way.
    fn test_group(port: u16) -> SocketAddr {
        SocketAddr::new("239.255.77.13".parse().unwrap(), port)
    }

    fn assert_not_running(result: anyhow::Result<impl std::fmt::Debug>) {
        let err = result.unwrap_err();
        assert_eq!(err.downcast_ref::<EngineNotRunning>(), Some(&EngineNotRunning));
    }

    #[rstest]
    #[case::unicast_group("10.1.2.3:5000")]
    #[case::no_port("239.255.77.13:0")]
    fn test_invalid_group_is_rejected(#[case] group: &str) {
        assert!(SimulatedMulticastIo::new(group.parse().unwrap()).is_err());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = SimcastConfig::new();
        config.channel_capacity = 0;
        assert!(SimulatedMulticastIo::with_config(test_group(24791), config).is_err());
    }

    #[test]
    fn test_lifecycle() {
        let mut io = SimulatedMulticastIo::new(test_group(24792)).unwrap();
        assert_eq!(io.group_address(), test_group(24792));
        assert_eq!(io.max_packet_size(), 1388);
        assert_eq!(io.source_of_last_read_packet(), None);

        let mut buf = [0u8; 100];
        assert_eq!(io.read(&mut buf).unwrap(), 0);
        assert_eq!(io.read_from(&mut buf).unwrap(), None);

        // nobody else is in the group, so this goes nowhere - but it is accepted
        assert_eq!(io.write(b"hello").unwrap(), 5);
        assert_eq!(io.write_to(b"direct", "127.0.0.1:9".parse().unwrap()).unwrap(), 6);

        io.set_max_packet_size(9000).unwrap();
        assert_eq!(io.max_packet_size(), 9000);
        assert!(io.set_max_packet_size(0).is_err());
        // too small for a discovery ack
        assert!(io.set_max_packet_size(11).is_err());
        assert_eq!(io.max_packet_size(), 9000);

        io.shutdown();

        assert_not_running(io.read(&mut buf));
        assert_not_running(io.read_from(&mut buf));
        assert_not_running(io.write(b"hello"));
        assert_not_running(io.write_to(b"hello", "127.0.0.1:9".parse().unwrap()));
        assert_not_running(io.set_max_packet_size(1000));

        // idempotent
        io.shutdown();
    }

    #[test]
    fn test_drop_stops_network_thread() {
        let io = SimulatedMulticastIo::new(test_group(24793)).unwrap();
        drop(io);
    }

    #[test]
    fn test_two_members_exchange_data() {
        let group = test_group(24795);
        if !multicast_is_available(group) {
            return;
        }

        let mut config = SimcastConfig::new();
        config.ping_interval = Duration::from_millis(100);
        let mut a = SimulatedMulticastIo::with_config(group, config.clone()).unwrap();
        let mut b = SimulatedMulticastIo::with_config(group, config).unwrap();

        // data is sent only to discovered members, so keep writing until discovery is done
        let mut buf = [0u8; 100];
        let deadline = Instant::now() + Duration::from_secs(5);
        let (len, source) = loop {
            assert!(Instant::now() < deadline, "members did not discover each other");
            assert_eq!(a.write(b"payload").unwrap(), 7);
            std::thread::sleep(Duration::from_millis(50));
            if let Some(received) = b.read_from(&mut buf).unwrap() {
                break received;
            }
        };
        assert_eq!(&buf[..len], b"payload");
        assert_eq!(b.source_of_last_read_packet(), Some(source));

        std::thread::sleep(Duration::from_millis(200));
        while b.read_from(&mut buf).unwrap().is_some() {}

        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let _runtime_guard = runtime.enter();
        let read_notified = b.select_handles().read;
        // discard a permit left over from the reads above
        let _ = runtime.block_on(time::timeout(Duration::from_millis(10), read_notified.notified()));

        assert_eq!(a.write(b"abcdefgh").unwrap(), 8);
        runtime.block_on(time::timeout(Duration::from_secs(5), read_notified.notified())).unwrap();

        let mut small_buf = [0u8; 3];
        let (len, from) = b.read_from(&mut small_buf).unwrap().unwrap();
        assert_eq!(len, 3);
        assert_eq!(&small_buf, b"abc");
        assert_eq!(from, source);
        assert_eq!(b.source_of_last_read_packet(), Some(source));

        a.shutdown();
        b.shutdown();
    }
}
