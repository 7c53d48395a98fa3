use std::path::PathBuf;

use anyhow::Result;
use clap::Args as ClapArgs;
use tracing::instrument;

use oxvfs_core::UnixVfs;

use super::open_db;

#[derive(ClapArgs, Clone)]
pub struct Args {
    /// Database file
    pub file: PathBuf,
}

#[instrument(level = "info", name = "cmd::check", skip_all, fields(file = %args.file.display()))]
pub fn execute(vfs: &UnixVfs, args: &Args) -> Result<()> {
    let mut file = open_db(vfs, &args.file, false)?;
    let held = file.check_reserved_lock()?;
    file.close()?;

    if held {
        println!("reserved lock held");
    } else {
        println!("no reserved lock");
    }
    Ok(())
}
