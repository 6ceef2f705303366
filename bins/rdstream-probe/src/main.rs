use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use rdstream_net::{Conn, DialContext, Dialer, NetError};
use rdstream_net_rdma::{LoopbackBinding, RdmaConfig, RdmaDialer};
use rdstream_net_tcp::TcpDialer;

mod config;

use config::{ProbeConfig, Transport};

/// rdstream connectivity probe
///
/// Dials a destination, writes a payload, prints the first reply and closes:
///   1. Parse CLI arguments and load config
///   2. Dial over the selected transport within the deadline
///   3. Exchange one payload
///   4. Close the connection
#[derive(Parser, Debug)]
#[command(name = "rdstream-probe", version, about)]
struct Args {
    /// Destination as host:port
    destination: String,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Transport to dial over (overrides the config file)
    #[arg(short, long, value_enum)]
    transport: Option<Transport>,

    /// Deadline in seconds for dial and round trip together
    #[arg(long, default_value_t = 5.0)]
    timeout: f64,

    /// Payload to send
    #[arg(long, default_value = "PING\r\n")]
    payload: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = ProbeConfig::load(args.config.as_deref())?;
    let _guard = rdstream_logging::init_logging(&config.log)?;

    let transport = args.transport.unwrap_or(config.transport);
    let timeout = Duration::try_from_secs_f64(args.timeout).context("invalid --timeout")?;
    let deadline = Instant::now() + timeout;

    tracing::info!(
        destination = %args.destination,
        ?transport,
        timeout_ms = timeout.as_millis() as u64,
        "Starting rdstream probe"
    );

    let payload = args.payload.as_bytes();
    let reply = match transport {
        Transport::Tcp => {
            round_trip(&TcpDialer::new(), &args.destination, payload, deadline).await?
        }
        Transport::Loopback => {
            let dialer = RdmaDialer::new(LoopbackBinding::new(), config.rdma.clone())?;
            round_trip(&dialer, &args.destination, payload, deadline).await?
        }
        Transport::Rdma => {
            rdma_round_trip(config.rdma.clone(), &args.destination, payload, deadline).await?
        }
    };

    println!("{}", String::from_utf8_lossy(&reply));
    Ok(())
}

#[cfg(feature = "rdma")]
async fn rdma_round_trip(
    config: RdmaConfig,
    destination: &str,
    payload: &[u8],
    deadline: Instant,
) -> anyhow::Result<Vec<u8>> {
    let dialer = RdmaDialer::new(rdstream_net_rdma::FfiBinding, config)?;
    round_trip(&dialer, destination, payload, deadline).await
}

#[cfg(not(feature = "rdma"))]
async fn rdma_round_trip(
    _config: RdmaConfig,
    _destination: &str,
    _payload: &[u8],
    _deadline: Instant,
) -> anyhow::Result<Vec<u8>> {
    anyhow::bail!("rdstream-probe was built without the `rdma` feature; use --transport tcp or loopback")
}

async fn round_trip<D: Dialer>(
    dialer: &D,
    destination: &str,
    payload: &[u8],
    deadline: Instant,
) -> anyhow::Result<Vec<u8>> {
    let started = Instant::now();
    let conn = dialer
        .dial(&DialContext::with_deadline(deadline), destination)
        .await
        .with_context(|| format!("failed to dial {destination}"))?;
    tracing::info!(peer = %conn.peer_addr(), local = %conn.local_addr(), "Connected");

    conn.set_deadline(Some(deadline));
    let result = exchange(&conn, payload).await;
    conn.close().await?;
    let reply = result.context("round trip failed")?;

    tracing::info!(
        bytes = reply.len(),
        elapsed_us = started.elapsed().as_micros() as u64,
        "Round trip complete"
    );
    Ok(reply)
}

async fn exchange(conn: &impl Conn, payload: &[u8]) -> Result<Vec<u8>, NetError> {
    conn.write_all(payload).await?;
    let mut buf = vec![0u8; 64 * 1024];
    let n = conn.read(&mut buf).await?;
    buf.truncate(n);
    Ok(buf)
}
