//! Lock command - acquire a lock level and optionally hold it.
//!
//! # Examples
//!
//! ```bash
//! # Take EXCLUSIVE and hold it for five seconds
//! oxvfs lock app.db --hold 5000
//!
//! # Fails with exit code 3 while the lock above is held
//! oxvfs lock app.db --level shared
//! ```

use std::io::{self, Write};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args as ClapArgs;
use tracing::{info, instrument};

use oxvfs_core::{LockLevel, UnixVfs, VfsError};

use super::open_db;

#[derive(ClapArgs, Clone)]
pub struct Args {
    /// Database file
    pub file: PathBuf,

    /// Level to acquire (shared, reserved, exclusive)
    #[arg(long, default_value = "exclusive")]
    pub level: LockLevel,

    /// Keep the lock for this many milliseconds before releasing it
    #[arg(long, value_name = "MS")]
    pub hold: Option<u64>,
}

/// Levels passed through on the way to `target`, in protocol order.
pub fn acquisition_path(target: LockLevel) -> Vec<LockLevel> {
    [LockLevel::Shared, LockLevel::Reserved, LockLevel::Exclusive]
        .into_iter()
        .filter(|&level| level <= target)
        .collect()
}

#[instrument(level = "info", name = "cmd::lock", skip_all, fields(file = %args.file.display(), level = %args.level))]
pub fn execute(vfs: &UnixVfs, args: &Args, quiet: bool) -> Result<()> {
    if matches!(args.level, LockLevel::None | LockLevel::Pending) {
        return Err(VfsError::misuse("only shared, reserved and exclusive can be requested").into());
    }

    let mut file = open_db(vfs, &args.file, true)?;
    for level in acquisition_path(args.level) {
        file.lock(level)
            .with_context(|| format!("Failed to acquire {level} on {}", args.file.display()))?;
    }

    if !quiet {
        // Parent processes wait for this line, so it goes out before the hold
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "locked {}", level_name(file.lock_level()))?;
        stdout.flush()?;
    }

    if let Some(ms) = args.hold {
        info!(ms, "holding lock");
        thread::sleep(Duration::from_millis(ms));
    }

    file.unlock(LockLevel::None)?;
    file.close()?;
    if !quiet {
        println!("released");
    }
    Ok(())
}

/// Level as spelled on the command line.
fn level_name(level: LockLevel) -> String {
    level.as_str().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquisition_path() {
        assert_eq!(acquisition_path(LockLevel::Shared), vec![LockLevel::Shared]);
        assert_eq!(
            acquisition_path(LockLevel::Reserved),
            vec![LockLevel::Shared, LockLevel::Reserved]
        );
        assert_eq!(
            acquisition_path(LockLevel::Exclusive),
            vec![LockLevel::Shared, LockLevel::Reserved, LockLevel::Exclusive]
        );
    }

    #[test]
    fn test_level_name_matches_flag_spelling() {
        for level in [LockLevel::Shared, LockLevel::Reserved, LockLevel::Exclusive] {
            let name = level_name(level);
            assert_eq!(name.parse::<LockLevel>(), Ok(level));
            assert_eq!(name, name.to_lowercase());
        }
        assert_eq!(level_name(LockLevel::Exclusive), "exclusive");
    }
}
