//! Runs the dedup index orphan-cleanup / verification pass once.
//!
//! Scheduling (startup, daily cron, ...) is left to the operator; this
//! binary is the entry point those schedules invoke.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Error;
use clap::Parser;

use parpack_fs::DefaultPosixFileSystem;
use parpack_index::DedupDataIndex;

#[derive(Parser)]
#[command(
    name = "parallel-index",
    about = "Cleans orphaned chunks and verifies a dedup data index"
)]
struct Args {
    /// Only remove orphans; skip content verification
    #[arg(short = 'q', long)]
    quick: bool,

    /// Index root directory
    #[arg(value_name = "ROOT")]
    root: PathBuf,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(1);
        }
    };

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::from(2)
        }
    }
}

fn run(args: Args) -> Result<(), Error> {
    let index = DedupDataIndex::get_instance(Arc::new(DefaultPosixFileSystem), args.root)?;
    let stats = index.verify(args.quick)?;
    println!(
        "orphans removed: {}, chunks verified: {}, corrupt: {} ({} without healthy copy), hash directories removed: {}",
        stats.orphans_removed,
        stats.chunks_verified,
        stats.corrupt_found,
        stats.corrupt_unreplicated,
        stats.hash_directories_removed,
    );
    Ok(())
}
