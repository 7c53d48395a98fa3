//! Decode command - run a response body through the content-decoding chain.
//!
//! # Examples
//!
//! ```bash
//! # Undo Content-Encoding: gzip
//! oxvfs decode page.gz --encoding gzip > page.html
//!
//! # SDCH response with a locally stored dictionary
//! oxvfs decode body.sdch --encoding sdch,gzip \
//!     --url http://example.com/page \
//!     --dict dict.txt --dict-url http://example.com/dict.txt
//! ```

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args as ClapArgs;
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

use oxvfs_filter::{FilterChain, FilterContext, FilterStatus, SdchManager};

#[derive(ClapArgs, Clone)]
pub struct Args {
    /// Encoded input file, or `-` for stdin
    pub file: PathBuf,

    /// Content-Encoding values in the order the server applied them
    #[arg(long, short, value_delimiter = ',', required = true)]
    pub encoding: Vec<String>,

    /// URL the content was fetched from
    #[arg(long)]
    pub url: Option<Url>,

    /// MIME type of the content
    #[arg(long)]
    pub mime_type: Option<String>,

    /// SDCH dictionary file (header, blank line, payload)
    #[arg(long, requires = "dict_url")]
    pub dict: Option<PathBuf>,

    /// URL the dictionary was fetched from
    #[arg(long)]
    pub dict_url: Option<Url>,

    /// HTTP status of the response
    #[arg(long)]
    pub status: Option<u16>,

    /// Bytes fed to the chain per write
    #[arg(long, default_value_t = 4096)]
    pub chunk: usize,
}

/// The chain reported an error, or stopped before the content ended.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("content could not be decoded ({written} bytes produced)")]
    Corrupt { written: usize },

    #[error("content ended early ({written} bytes produced)")]
    Truncated { written: usize },
}

fn read_input(path: &Path) -> Result<Vec<u8>> {
    if path.as_os_str() == "-" {
        let mut input = Vec::new();
        io::stdin().read_to_end(&mut input)?;
        return Ok(input);
    }
    fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

#[instrument(level = "info", name = "cmd::decode", skip_all, fields(file = %args.file.display()))]
pub fn execute(args: &Args) -> Result<()> {
    let input = read_input(&args.file)?;

    let mut context = FilterContext::new().with_sdch_response(args.dict.is_some());
    if let Some(url) = &args.url {
        context = context.with_url(url.clone());
    }
    if let Some(mime) = &args.mime_type {
        context = context.with_mime_type(mime.clone());
    }
    if let Some(status) = args.status {
        context = context.with_response_code(status);
    }

    let manager = match (&args.dict, &args.dict_url) {
        (Some(dict), Some(dict_url)) => {
            let text = fs::read(dict)
                .with_context(|| format!("Failed to read dictionary {}", dict.display()))?;
            let manager = Arc::new(SdchManager::new());
            let hash = manager
                .add_dictionary(&text, dict_url)
                .with_context(|| format!("Dictionary {} rejected", dict.display()))?;
            debug!(server_hash = %hash, "dictionary loaded");
            Some(manager)
        }
        _ => None,
    };

    let Some(mut chain) = FilterChain::from_encodings(&args.encoding, &context, manager.as_ref())?
    else {
        // Nothing left to undo after fix-ups
        io::stdout().write_all(&input)?;
        return Ok(());
    };
    debug!(stages = ?chain.filter_types(), "filter chain built");

    let (status, output) = chain.decode_all(&input, args.chunk);
    io::stdout().write_all(&output)?;
    match status {
        FilterStatus::Error => Err(DecodeError::Corrupt {
            written: output.len(),
        }
        .into()),
        // SDCH streams have no end marker
        FilterStatus::NeedMoreData if manager.is_none() => Err(DecodeError::Truncated {
            written: output.len(),
        }
        .into()),
        _ => Ok(()),
    }
}
