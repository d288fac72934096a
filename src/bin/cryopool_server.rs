use std::{error::Error, net::SocketAddr};

use clap::Parser;
use cryopool::protocol::KeyspaceServer;

#[derive(Debug, Parser)]
#[command(version, about = "In-memory Cryo key/value server", long_about = None)]
struct Cli {
    /// Listen for new connection at address
    address: SocketAddr,
    /// Answer every Nth query with a retryable `Unavailable` error
    #[arg(long, value_name = "N")]
    fail_every: Option<usize>,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let server = KeyspaceServer::bind(cli.address)?.with_fault_every(cli.fail_every);

    server.listen()?;
    Ok(())
}
