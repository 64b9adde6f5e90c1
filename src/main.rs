use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use rswarm::{Peer, PeerConfig, PeerError};
use tracing_subscriber::filter::LevelFilter;

#[derive(Parser)]
#[command(name = "rswarm")]
#[command(about = "Peer-to-peer chunk transfer over UDP")]
struct Cli {
    /// Peer roster file: one `<id> <host> <port>` entry per line
    #[arg(short = 'p', long = "peer-file")]
    peer_file: PathBuf,

    /// Fragment file holding this peer's initial chunks
    #[arg(short = 'c', long = "chunk-file")]
    chunk_file: PathBuf,

    /// Max number of peers to send chunks to concurrently
    #[arg(short = 'm', long = "max-conn")]
    max_conn: usize,

    /// Which peer # am I?
    #[arg(short = 'i', long = "identity")]
    identity: u32,

    /// Fixed retransmission timeout in seconds; disables RTT estimation
    #[arg(short = 't', long = "timeout")]
    timeout: Option<u64>,

    /// Verbose level: 0 errors only, 1 warnings, 2 info, 3 debug
    #[arg(short = 'v', long = "verbose", default_value_t = 0)]
    verbose: u8,
}

fn log_level(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::ERROR,
        1 => LevelFilter::WARN,
        2 => LevelFilter::INFO,
        _ => LevelFilter::DEBUG,
    }
}

async fn run(cli: Cli) -> Result<(), PeerError> {
    let config = PeerConfig {
        roster_path: cli.peer_file,
        fragment_path: cli.chunk_file,
        max_send: cli.max_conn,
        identity: cli.identity,
        fixed_timeout: cli.timeout.map(Duration::from_secs),
    };

    Peer::new(config).await?.run().await
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(log_level(cli.verbose))
        .with_writer(std::io::stderr)
        .init();

    // Startup failures and unrecoverable endpoint I/O terminate the peer
    // with a non-zero status.
    if let Err(e) = run(cli).await {
        eprintln!("rswarm: {e}");
        std::process::exit(1);
    }
}
