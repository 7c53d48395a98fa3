#![deny(unsafe_code)]

mod commands;
mod config;
mod exit_code;
mod output;

use std::io;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use oxvfs_core::{LockStyleChoice, UnixVfs, VfsError, VfsErrorCode};
use oxvfs_filter::{ChainError, SdchError};

use crate::commands::{check, decode, info, lock, probe, sync};
use crate::config::Config;

/// Storage-engine lock inspection and content decoding
#[derive(Parser)]
#[command(name = "oxvfs")]
#[command(author, version)]
#[command(propagate_version = true)]
#[command(after_help = "EXAMPLES:
    # Hold an exclusive lock for ten seconds
    oxvfs lock app.db --hold 10000

    # Is anyone about to write?
    oxvfs check app.db

    # Decode a gzip response body
    oxvfs decode body.gz --encoding gzip > body.html
")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Print lock counters to stderr when the command finishes
    #[arg(long, global = true)]
    stats: bool,

    /// Lock style (auto, posix, flock, dotfile, afp, none)
    #[arg(long, global = true)]
    style: Option<LockStyleChoice>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire a lock level, optionally hold it, then release
    Lock(lock::Args),

    /// Report whether any process holds a RESERVED or stronger lock
    Check(check::Args),

    /// Show thread-override and lock-style detection results
    Probe(probe::Args),

    /// Flush a file to stable storage
    Sync(sync::Args),

    /// Show file size, lock style and lock layout
    Info(info::Args),

    /// Decode content through the filter chain to stdout
    Decode(decode::Args),
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::from(exit_code::SUCCESS),
        Err(e) => {
            let code = categorize_error(&e);

            let args: Vec<String> = std::env::args().collect();
            let is_quiet = args.iter().any(|a| a == "-q" || a == "--quiet");

            if !is_quiet {
                eprintln!("Error: {e:#}");
            }

            ExitCode::from(code)
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load()?;

    if !cli.quiet {
        let verbose = if cli.verbose > 0 {
            cli.verbose
        } else {
            config.defaults.verbosity.unwrap_or(0)
        };
        setup_tracing(verbose);
    }

    let vfs = UnixVfs::with_config(config.vfs_config(cli.style)?);
    let result = match &cli.command {
        Commands::Lock(args) => lock::execute(&vfs, args, cli.quiet),
        Commands::Check(args) => check::execute(&vfs, args),
        Commands::Probe(args) => probe::execute(&vfs, args),
        Commands::Sync(args) => sync::execute(&vfs, args, cli.quiet),
        Commands::Info(args) => info::execute(&vfs, args),
        Commands::Decode(args) => decode::execute(args),
    };

    if cli.stats {
        output::print_metrics(&vfs.metrics().snapshot());
    }
    result
}

/// Set up tracing/logging based on verbosity level
fn setup_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(io::stderr)
        .init();
}

fn io_exit_code(err: &io::Error) -> Option<u8> {
    match err.kind() {
        io::ErrorKind::NotFound => Some(exit_code::NOT_FOUND),
        io::ErrorKind::PermissionDenied => Some(exit_code::PERMISSION_DENIED),
        _ => None,
    }
}

/// Categorize an error into an exit code using typed error downcasting
fn categorize_error(e: &anyhow::Error) -> u8 {
    for cause in e.chain() {
        if let Some(vfs_err) = cause.downcast_ref::<VfsError>() {
            if let VfsError::CantOpen { source, .. } | VfsError::Io { source, .. } = vfs_err
                && let Some(code) = io_exit_code(source)
            {
                return code;
            }
            return match vfs_err.code() {
                VfsErrorCode::Busy => exit_code::BUSY,
                VfsErrorCode::Misuse => exit_code::USAGE_ERROR,
                _ => exit_code::IO_ERROR,
            };
        }

        if cause.downcast_ref::<decode::DecodeError>().is_some()
            || cause.downcast_ref::<SdchError>().is_some()
        {
            return exit_code::DECODE_FAILED;
        }

        if cause.downcast_ref::<ChainError>().is_some() {
            return exit_code::USAGE_ERROR;
        }

        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            return io_exit_code(io_err).unwrap_or(exit_code::IO_ERROR);
        }
    }

    exit_code::GENERAL_ERROR
}
