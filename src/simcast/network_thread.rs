use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::time;
use tracing::{debug, error, info, trace, warn};

use crate::packet_io::SelectHandles;
use crate::simcast::engine::{InboundPayload, OutboundCommand, SimcastEngine};
use crate::simcast::simcast_config::SimcastConfig;
use crate::simcast::sockets::SimcastSockets;
use crate::util::clock::MicrosClock;
use crate::util::safe_converter::SaturatingCast;

/// upper bound for sending departure notices during shutdown
const DEPARTURE_NOTICE_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum NetworkState {
    Starting,
    Running,
    /// shutdown was requested: send departure notices, then stop
    Draining,
    Stopped,
}

/// The background side of a simulated multicast member: owns sockets and engine, and runs a
///  single-threaded Tokio runtime on a dedicated OS thread. It talks to the facade through
///  bounded channels only.
pub struct NetworkThread {
    config: Arc<SimcastConfig>,
    group: SocketAddr,
    commands: mpsc::Receiver<OutboundCommand>,
    inbound: mpsc::Sender<InboundPayload>,
    select_handles: SelectHandles,
    max_packet_size: usize,
    state: NetworkState,
}

impl NetworkThread {
    pub fn new(config: Arc<SimcastConfig>, group: SocketAddr, commands: mpsc::Receiver<OutboundCommand>, inbound: mpsc::Sender<InboundPayload>, select_handles: SelectHandles) -> NetworkThread {
        NetworkThread {
            max_packet_size: config.max_packet_size,
            config,
            group,
            commands,
            inbound,
            select_handles,
            state: NetworkState::Starting,
        }
    }

    pub fn spawn(self) -> anyhow::Result<JoinHandle<()>> {
        let handle = std::thread::Builder::new()
            .name(format!("simcast-{}", self.group))
            .spawn(move || self.run_blocking())?;
        Ok(handle)
    }

    fn run_blocking(self) {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("error starting runtime for simulated multicast group {}: {}", self.group, e);
                return;
            }
        };
        runtime.block_on(self.run());
    }

    async fn run(mut self) {
        let sockets = match SimcastSockets::open(&self.config, self.group) {
            Ok(sockets) => sockets,
            Err(e) => {
                error!("simulated multicast for group {} is not operational: {:#}", self.group, e);
                self.wait_for_shutdown().await;
                return;
            }
        };

        let engine = SimcastEngine::new(self.config.clone(), self.group, sockets.myself.clone());
        info!("joined simulated multicast group {} as {:?}", self.group, sockets.myself.addr);

        self.state = NetworkState::Running;
        self.event_loop(&sockets, engine).await;
        self.state = NetworkState::Stopped;
        debug!("network thread for simulated multicast group {} stopped", self.group);
    }

    /// Setup failed: there is nothing to do but wait to be shut down. The facade keeps
    ///  accepting writes, which are discarded.
    async fn wait_for_shutdown(&mut self) {
        while let Some(cmd) = self.commands.recv().await {
            match cmd {
                OutboundCommand::Shutdown => break,
                OutboundCommand::Write { .. } => trace!("discarding write - simulated multicast is not operational"),
                OutboundCommand::SetMaxPacketSize(max_packet_size) => self.max_packet_size = max_packet_size,
            }
        }
        self.state = NetworkState::Stopped;
    }

    async fn event_loop(&mut self, sockets: &SimcastSockets, mut engine: SimcastEngine) {
        let clock = MicrosClock::new();
        let ping_interval_micros: u64 = self.config.ping_interval.as_micros().saturating_cast();
        let mut next_ping_time = clock.now_micros();
        let mut recv_buf = vec![0u8; self.max_packet_size];

        while self.state == NetworkState::Running {
            let first_command = select! {
                // the first command wakes us up, the rest of the backlog is drained below
                cmd = self.commands.recv() => Some(cmd),
                r = sockets.multicast.readable() => { Self::log_readiness_error(r); None }
                r = sockets.unicast.readable() => { Self::log_readiness_error(r); None }
                r = sockets.unicast.writable(), if engine.has_pending_output() => { Self::log_readiness_error(r); None }
                _ = time::sleep_until(clock.instant_at(next_ping_time)) => None,
            };

            if let Some(cmd) = first_command {
                self.on_command(cmd, &mut engine);
                self.select_handles.write.notify_one();
            }
            self.drain_commands(&mut engine);
            if self.state != NetworkState::Running {
                break;
            }

            if recv_buf.len() != self.max_packet_size {
                recv_buf.resize(self.max_packet_size, 0);
            }

            let now = clock.now_micros();
            for socket in [&sockets.multicast, &sockets.unicast] {
                self.receive_all(socket, &mut engine, &mut recv_buf, now);
            }

            if engine.has_pending_output() {
                engine.drain_when_writable(&sockets.unicast);
            }

            if now >= next_ping_time {
                engine.on_ping_timer(now);
                next_ping_time = now + ping_interval_micros;
            }
        }

        self.send_departure_notices(sockets, &engine, clock.now_micros()).await;
    }

    fn log_readiness_error(result: std::io::Result<()>) {
        if let Err(e) = result {
            warn!("error polling socket: {}", e);
        }
    }

    /// `None` means the facade is gone, which is treated like a shutdown
    fn on_command(&mut self, cmd: Option<OutboundCommand>, engine: &mut SimcastEngine) {
        match cmd {
            Some(OutboundCommand::Write { data, destination }) => {
                engine.on_write(data, destination);
            }
            Some(OutboundCommand::SetMaxPacketSize(max_packet_size)) => {
                debug!("max packet size for simulated multicast group {} is now {}", self.group, max_packet_size);
                self.max_packet_size = max_packet_size;
            }
            Some(OutboundCommand::Shutdown) => {
                debug!("shutting down simulated multicast for group {}", self.group);
                self.state = NetworkState::Draining;
            }
            None => {
                debug!("simulated multicast facade for group {} was dropped - shutting down", self.group);
                self.state = NetworkState::Draining;
            }
        }
    }

    fn drain_commands(&mut self, engine: &mut SimcastEngine) {
        let mut num_consumed = 0;
        while self.state == NetworkState::Running {
            match self.commands.try_recv() {
                Ok(cmd) => {
                    num_consumed += 1;
                    self.on_command(Some(cmd), engine);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => self.on_command(None, engine),
            }
        }

        if num_consumed > 0 {
            self.select_handles.write.notify_one();
        }
    }

    fn receive_all(&mut self, socket: &UdpSocket, engine: &mut SimcastEngine, recv_buf: &mut [u8], now: u64) {
        loop {
            match socket.try_recv_from(recv_buf) {
                Ok((len, from)) => {
                    let data = Bytes::copy_from_slice(&recv_buf[..len]);
                    if let Some(payload) = engine.on_datagram(data, from, now) {
                        self.forward_to_facade(payload);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!("error receiving datagram: {}", e);
                    break;
                }
            }
        }
    }

    fn forward_to_facade(&self, payload: InboundPayload) {
        match self.inbound.try_send(payload) {
            Ok(()) => self.select_handles.read.notify_one(),
            Err(TrySendError::Full(payload)) => {
                warn!("inbound queue is full - dropping {} bytes from {:?}", payload.data.len(), payload.source);
            }
            Err(TrySendError::Closed(_)) => {
                trace!("facade is gone - dropping received payload");
            }
        }
    }

    /// Best effort: a notice that can not be sent within [DEPARTURE_NOTICE_TIMEOUT] is skipped,
    ///  and errors are ignored
    async fn send_departure_notices(&self, sockets: &SimcastSockets, engine: &SimcastEngine, now: u64) {
        let notices = engine.departure_notices(now);
        debug!("sending {} departure notices", notices.len());

        let send_all = async {
            for (buf, destination) in notices {
                if let Err(e) = sockets.unicast.send_to(&buf, destination).await {
                    debug!("error sending departure notice to {:?}: {}", destination, e);
                }
            }
        };
        if time::timeout(DEPARTURE_NOTICE_TIMEOUT, send_all).await.is_err() {
            debug!("timeout sending departure notices for simulated multicast group {}", self.group);
        }
    }
}
