use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

use db::engine::Engine;
use db::repl::run_repl;

#[derive(Parser, Debug)]
#[command(name = "stratum", about = "Disk-based storage engine shell")]
struct Args {
    /// Database file; created on first use.
    #[arg(long, value_name = "PATH", default_value = "stratum.db")]
    db: PathBuf,

    /// Buffer pool size in pages.
    #[arg(long, default_value_t = 64)]
    pool_size: usize,
}

fn main() -> ExitCode {
    env_logger::init();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("fatal: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    if let Some(parent) = args.db.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("create database directory")?;
        }
    }

    println!("stratum v{}", env!("CARGO_PKG_VERSION"));
    println!("database file: {}", args.db.display());

    let mut engine = Engine::open_with_pool(&args.db, args.pool_size)?;
    run_repl(&mut engine)?;
    engine.checkpoint()?;
    Ok(())
}
