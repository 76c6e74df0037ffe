//! Unpacks a stream produced by `parallel-pack`, read from standard in
//! or from a single accepted TCP connection.

use std::io::Write;
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Error};
use clap::Parser;

use parpack_archive::protocol::{RecordType, DEFAULT_PORT};
use parpack_archive::{extract_pack, UnpackOptions};
use parpack_fs::DefaultPosixFileSystem;

#[derive(Parser)]
#[command(
    name = "parallel-unpack",
    disable_help_flag = true,
    about = "Unpacks a parallel-pack stream into a directory"
)]
struct Args {
    /// Listen for one incoming connection instead of reading standard in
    #[arg(short = 'l')]
    listen: bool,

    /// Interface to bind when listening
    #[arg(short = 'h', value_name = "HOST")]
    host: Option<String>,

    /// TCP port to listen on
    #[arg(short = 'p', value_name = "PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Dry run: consume the stream without modifying the filesystem
    #[arg(short = 'n')]
    dry_run: bool,

    /// Overwrite existing entries
    #[arg(short = 'f')]
    force: bool,

    /// Write the path of each entry to standard error as it is unpacked
    #[arg(short = 'v')]
    verbose: bool,

    /// Write into a deduplicating filesystem at the given root
    #[arg(short = 'd', value_name = "ROOT")]
    dedup_root: Option<PathBuf>,

    /// Target directory
    #[arg(value_name = "PATH")]
    path: PathBuf,
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
    if args.dedup_root.is_some() {
        bail!("deduplicating filesystem support is not implemented");
    }
    let fs = DefaultPosixFileSystem;
    let options = UnpackOptions {
        dry_run: args.dry_run,
        force: args.force,
        verbose: args
            .verbose
            .then(|| Box::new(std::io::stderr()) as Box<dyn Write + Send>),
        abort: None,
    };

    if args.listen {
        let bind_host = args.host.as_deref().unwrap_or("0.0.0.0");
        let listener = TcpListener::bind((bind_host, args.port))
            .with_context(|| format!("unable to listen on {}:{}", bind_host, args.port))?;
        // Accept exactly one connection.
        let (mut stream, peer) = listener.accept()?;
        drop(listener);
        log::info!("accepted connection from {}", peer);
        extract_pack(&fs, &args.path, stream.try_clone()?, options)?;
        // Confirm completion so the packer does not treat the socket
        // close as a truncated stream.
        stream.write_all(&[RecordType::End as u8])?;
        stream.flush()?;
        Ok(())
    } else {
        let stdin = std::io::stdin();
        extract_pack(&fs, &args.path, stdin.lock(), options)
    }
}
