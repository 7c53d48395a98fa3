use std::path::PathBuf;

use anyhow::Result;
use clap::Args as ClapArgs;
use tracing::instrument;

use oxvfs_core::{SyncFlags, UnixVfs};

use super::open_db;

#[derive(ClapArgs, Clone)]
pub struct Args {
    /// File to flush
    pub file: PathBuf,

    /// Ask the drive to flush its own cache too, where supported
    #[arg(long)]
    pub full: bool,

    /// Skip metadata that is not needed to read the data back
    #[arg(long)]
    pub data_only: bool,
}

impl Args {
    pub fn flags(&self) -> SyncFlags {
        let flags = if self.full {
            SyncFlags::FULL
        } else {
            SyncFlags::NORMAL
        };
        if self.data_only {
            flags.data_only()
        } else {
            flags
        }
    }
}

#[instrument(level = "info", name = "cmd::sync", skip_all, fields(file = %args.file.display()))]
pub fn execute(vfs: &UnixVfs, args: &Args, quiet: bool) -> Result<()> {
    let mut file = open_db(vfs, &args.file, true)?;
    file.sync(args.flags())?;
    file.close()?;
    if !quiet {
        println!("synced {}", args.file.display());
    }
    Ok(())
}
