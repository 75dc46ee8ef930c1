use anyhow::Result;
use clap::Parser;
use rusty_mini_sql::schema::initialize_schema_tables;
use rusty_mini_sql::shell::run_shell;
use rusty_mini_sql::sql::SqlExec;
use rusty_mini_sql::store::Store;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Interactive SQL shell over a schema catalog.
#[derive(Parser, Debug)]
#[command(name = "rusty-mini-sql", version, about)]
struct Args {
    /// Directory of the storage environment; created if missing
    env_dir: PathBuf,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_logging();

    println!(
        "(rusty-mini-sql: running with database environment at {})",
        args.env_dir.display()
    );
    let store = match Store::open(&args.env_dir) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("(rusty-mini-sql: {e})");
            return Ok(ExitCode::FAILURE);
        }
    };
    initialize_schema_tables(&store)?;
    info!(env = %args.env_dir.display(), "storage environment ready");

    let mut exec = SqlExec::new(store);
    run_shell(&mut exec, io::stdin().lock(), io::stdout().lock())?;
    exec.store().flush()?;
    Ok(ExitCode::SUCCESS)
}
