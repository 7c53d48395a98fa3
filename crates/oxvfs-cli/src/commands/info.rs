//! Info command - show a file's size, lock style and lock layout.
//!
//! # Examples
//!
//! ```bash
//! oxvfs info app.db
//!
//! # Output as JSON for scripting
//! oxvfs info app.db --json
//! ```

use std::path::PathBuf;

use anyhow::Result;
use clap::Args as ClapArgs;
use serde::Serialize;
use tracing::instrument;

use oxvfs_core::UnixVfs;

use super::open_db;
use crate::output::{create_table, format_size};

#[derive(ClapArgs, Clone)]
pub struct Args {
    /// Database file
    pub file: PathBuf,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

/// JSON output format for info command
#[derive(Serialize)]
struct FileInfo {
    path: String,
    size: u64,
    lock_style: String,
    device: u64,
    inode: u64,
    sector_size: u32,
    pending_byte: u64,
    reserved_byte: u64,
    shared_first: u64,
    shared_size: u64,
}

#[instrument(level = "info", name = "cmd::info", skip_all, fields(file = %args.file.display()))]
pub fn execute(vfs: &UnixVfs, args: &Args) -> Result<()> {
    let file = open_db(vfs, &args.file, false)?;
    let id = file.file_id()?;
    let layout = file.layout();
    let info = FileInfo {
        path: args.file.display().to_string(),
        size: file.file_size()?,
        lock_style: file.lock_style().to_string(),
        device: id.dev,
        inode: id.ino,
        sector_size: file.sector_size(),
        pending_byte: layout.pending_byte(),
        reserved_byte: layout.reserved_byte(),
        shared_first: layout.shared_first(),
        shared_size: layout.shared_size(),
    };
    file.close()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        let mut table = create_table();
        table.set_header(vec!["Property", "Value"]);
        table.add_row(vec!["Path".to_string(), info.path.clone()]);
        table.add_row(vec!["Size".to_string(), format_size(info.size)]);
        table.add_row(vec!["Lock Style".to_string(), info.lock_style.clone()]);
        table.add_row(vec![
            "Device / Inode".to_string(),
            format!("{} / {}", info.device, info.inode),
        ]);
        table.add_row(vec!["Sector Size".to_string(), info.sector_size.to_string()]);
        table.add_row(vec![
            "Pending Byte".to_string(),
            format!("{:#x}", info.pending_byte),
        ]);
        table.add_row(vec![
            "Reserved Byte".to_string(),
            format!("{:#x}", info.reserved_byte),
        ]);
        table.add_row(vec![
            "Shared Range".to_string(),
            format!("{:#x} (+{})", info.shared_first, info.shared_size),
        ]);
        println!("{table}");
    }
    Ok(())
}
