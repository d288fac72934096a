use std::{
    error::Error,
    io,
    net::SocketAddr,
    sync::mpsc::{self, Receiver},
    time::Duration,
};

use clap::Parser;
use cryopool::{
    Admission, Command, EngineConfig, EngineError, Interrupt, QueryEngine, QueryError, prompt,
    protocol::{Collector, QueryOutcome, RemoteConnection},
};

#[derive(Debug, Parser)]
#[command(version, about = "Run statements against a Cryo server", long_about = None)]
struct Cli {
    /// Server address
    address: SocketAddr,
    /// Maximum number of queries in flight
    #[arg(long, default_value_t = 16)]
    max_queries: usize,
    /// Attempts per statement, including the first one
    #[arg(long, default_value_t = 3)]
    retries: u32,
    /// Keyspace statements run against
    #[arg(long)]
    keyspace: Option<String>,
    /// Per-query network timeout in milliseconds
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let interrupt = Interrupt::ctrlc()?;

    let connection =
        RemoteConnection::new(cli.address).with_timeout(Duration::from_millis(cli.timeout_ms));
    connection.ping()?;

    let mut config = EngineConfig::default().with_max_queries(cli.max_queries);
    if let Some(keyspace) = cli.keyspace {
        config = config.with_keyspace(keyspace);
    }
    let mut engine = QueryEngine::new(connection, config)?;
    engine.set_tick_callback(|tick| log::trace!("{tick:?}"));

    let (tx, rx) = mpsc::channel();
    let stdin = io::stdin();
    let stdout = io::stdout();

    loop {
        let cmd = match prompt(stdin.lock(), stdout.lock()) {
            Ok(cmd) => cmd,
            Err(e) => {
                eprintln!("error: {e}");
                continue;
            }
        };

        match cmd {
            Command::Empty => {}
            Command::Status => print!("{engine}"),
            Command::Statement(statement) => {
                let collector = Collector::new(statement, tx.clone());
                engine.execute(Box::new(collector), cli.retries, Admission::NonBlocking)?;
                if let Err(e) = engine.yield_now(false) {
                    eprintln!("query error: {e}");
                }
            }
            Command::Flush => drain(&mut engine, &interrupt)?,
            Command::Exit => {
                drain(&mut engine, &interrupt)?;
                report(&rx);
                break;
            }
        }
        report(&rx);
    }

    Ok(())
}

/// Waits for outstanding work, cancelling it if the user hits Ctrl-C.
fn drain(
    engine: &mut QueryEngine<RemoteConnection>,
    interrupt: &Interrupt,
) -> Result<(), EngineError> {
    loop {
        match engine.finalize(interrupt) {
            Ok(()) => return Ok(()),
            Err(EngineError::Interrupted { active, pending }) => {
                eprintln!("interrupted with {active} active and {pending} pending queries");
                return engine.cancel_all(QueryError::Cancelled("interrupted".to_string()));
            }
            // A fatal query error only fails that query; keep draining the rest.
            Err(EngineError::Query(e)) => eprintln!("query error: {e}"),
            Err(e) => return Err(e),
        }
    }
}

fn report(outcomes: &Receiver<QueryOutcome>) {
    for outcome in outcomes.try_iter() {
        match outcome.result {
            Ok(rows) if rows.is_empty() && outcome.statement.is_write() => {
                println!("{}: ok", outcome.statement)
            }
            Ok(rows) if rows.is_empty() => println!("{}: no rows", outcome.statement),
            Ok(rows) => {
                println!("{}: {} row(s)", outcome.statement, rows.len());
                for row in rows {
                    println!(
                        "  {} = {}",
                        String::from_utf8_lossy(&row.key),
                        String::from_utf8_lossy(&row.value)
                    );
                }
            }
            Err(e) => eprintln!("{}: {e}", outcome.statement),
        }
    }
}
