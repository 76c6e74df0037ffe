//! Packs one or more directory trees into a single stream, written to
//! standard out or straight to a listening unpacker over TCP.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Error};
use clap::Parser;

use parpack_archive::protocol::{RecordType, DEFAULT_PORT};
use parpack_archive::{create_pack, PackOptions};
use parpack_fs::DefaultPosixFileSystem;

#[derive(Parser)]
#[command(
    name = "parallel-pack",
    disable_help_flag = true,
    about = "Packs directory trees into a single stream, preserving hard links"
)]
struct Args {
    /// Connect to HOST instead of writing to standard out
    #[arg(short = 'h', value_name = "HOST")]
    host: Option<String>,

    /// TCP port to connect to
    #[arg(short = 'p', value_name = "PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Write the path of each entry to standard error as it is packed
    #[arg(short = 'v')]
    verbose: bool,

    /// Compress the output
    #[arg(short = 'z')]
    compress: bool,

    /// Read from a deduplicating filesystem at the given root
    #[arg(short = 'd', value_name = "ROOT")]
    dedup_root: Option<PathBuf>,

    /// Source directories
    #[arg(required = true, value_name = "PATH")]
    paths: Vec<PathBuf>,
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
    let options = PackOptions {
        compress: args.compress,
        verbose: args
            .verbose
            .then(|| Box::new(std::io::stderr()) as Box<dyn Write + Send>),
        abort: None,
    };

    match args.host {
        Some(host) => {
            let mut stream = TcpStream::connect((host.as_str(), args.port))
                .with_context(|| format!("unable to connect to {}:{}", host, args.port))?;
            create_pack(&fs, &args.paths, stream.try_clone()?, options)?;
            let mut response = [0u8; 1];
            if stream.read(&mut response)? == 0 {
                bail!("End of file while reading completion confirmation");
            }
            if response[0] != RecordType::End as u8 {
                bail!("Unexpected value while reading completion confirmation");
            }
            Ok(())
        }
        None => {
            let stdout = std::io::stdout();
            create_pack(&fs, &args.paths, stdout.lock(), options)
        }
    }
}
