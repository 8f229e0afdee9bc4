//! Simulated multicast: multicast-like group communication that uses real multicast only for
//!  occasional discovery pings, and sends all data as unicast datagrams to each known member.

pub mod control_packet;
pub mod engine;
pub mod membership;
pub mod network_thread;
pub mod outgoing;
pub mod simcast_config;
pub mod simcast_io;
pub mod sockets;

pub use simcast_config::SimcastConfig;
pub use simcast_io::SimulatedMulticastIo;
