//! Probe command - report what the VFS detects about the platform.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args as ClapArgs;
use serde::Serialize;
use tracing::instrument;

use oxvfs_core::UnixVfs;

use crate::output::create_table;

#[derive(ClapArgs, Clone)]
pub struct Args {
    /// File whose filesystem should be checked for a lock style
    pub file: Option<PathBuf>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct ProbeReport {
    threads_override_locks: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    lock_style: Option<String>,
}

#[instrument(level = "info", name = "cmd::probe", skip_all)]
pub fn execute(vfs: &UnixVfs, args: &Args) -> Result<()> {
    let report = ProbeReport {
        threads_override_locks: vfs.registry().threads_override_locks(),
        lock_style: args
            .file
            .as_deref()
            .map(|path| vfs.detect_lock_style(path))
            .transpose()?
            .map(|style| style.to_string()),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let mut table = create_table();
        table.set_header(vec!["Property", "Value"]);
        table.add_row(vec![
            "Threads override locks".to_string(),
            report.threads_override_locks.to_string(),
        ]);
        if let Some(style) = &report.lock_style {
            table.add_row(vec!["Lock style".to_string(), style.clone()]);
        }
        println!("{table}");
    }
    Ok(())
}
