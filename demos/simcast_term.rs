use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use clap::Parser;
use clap_derive::Parser;
use simcast::packet_io::PacketIo;
use simcast::simcast::{SimcastConfig, SimulatedMulticastIo};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::select;
use tracing::{info, warn, Level};

/// Joins a simulated multicast group, sends every line from stdin to all members of the
///  group, and prints everything received from other members.
#[derive(Parser)]
struct Args {
    /// multicast group address, e.g. 239.255.77.12:24680
    group_address: String,

    /// send lines to this member only instead of the whole group
    #[clap(long)]
    to: Option<String>,

    #[clap(long)]
    ping_interval_secs: Option<u64>,

    #[clap(long)]
    local_interface: Option<String>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let group: SocketAddr = args.group_address.parse()?;
    let destination: Option<SocketAddr> = match &args.to {
        Some(to) => Some(to.parse()?),
        None => None,
    };

    let mut config = SimcastConfig::new();
    if let Some(secs) = args.ping_interval_secs {
        config.ping_interval = Duration::from_secs(secs);
    }
    if let Some(local_interface) = &args.local_interface {
        config.local_interface = Some(local_interface.parse::<IpAddr>()?);
    }

    let mut io = SimulatedMulticastIo::with_config(group, config)?;
    let select_handles = io.select_handles();
    let mut buf = vec![0u8; io.max_packet_size()];
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    info!("simulated multicast group {} - type lines to send them, end with Ctrl-D", group);

    loop {
        select! {
            line = stdin.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let num_written = match destination {
                    Some(destination) => io.write_to(line.as_bytes(), destination)?,
                    None => io.write(line.as_bytes())?,
                };
                if num_written == 0 {
                    warn!("outbound queue is full - line was not sent");
                }
            }
            _ = select_handles.read.notified() => {
                while let Some((len, from)) = io.read_from(&mut buf)? {
                    println!("{:?}: {}", from, String::from_utf8_lossy(&buf[..len]));
                }
            }
        }
    }

    io.shutdown();
    Ok(())
}
