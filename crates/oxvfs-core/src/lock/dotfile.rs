//! Dot-file locking: `<path>.lock` exists while someone holds the file.
//!
//! Works on any filesystem with atomic exclusive create. Every level is an
//! exclusive hold, and a crashed holder leaves the lock file behind.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, instrument};

use super::{LockLevel, LockMethods, LockTarget};
use crate::error::{FileContext, IoOp, Result, VfsError};

#[derive(Debug)]
pub(crate) struct DotFileLocker {
    lock_path: PathBuf,
}

impl DotFileLocker {
    pub fn new(path: &Path) -> Self {
        let mut name = path.as_os_str().to_os_string();
        name.push(".lock");
        Self {
            lock_path: PathBuf::from(name),
        }
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    fn touch(&self) {
        // Best effort: refresh the mtime so stale-lock tooling sees activity.
        if let Ok(file) = OpenOptions::new().write(true).open(&self.lock_path) {
            let _ = file.set_modified(SystemTime::now());
        }
    }
}

impl LockMethods for DotFileLocker {
    #[instrument(level = "debug", skip(self, target), fields(from = %target.level))]
    fn lock(&mut self, target: &mut LockTarget<'_>, level: LockLevel) -> Result<()> {
        if *target.level >= level {
            return Ok(());
        }
        target.validate_request(level)?;

        if *target.level > LockLevel::None {
            *target.level = level;
            self.touch();
            return Ok(());
        }

        let created = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&self.lock_path);
        match created {
            Ok(file) => {
                drop(file);
                debug!(lock_file = %self.lock_path.display(), "Created lock file");
                target.metrics.record_os_lock();
                *target.level = level;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(VfsError::Busy),
            Err(e) => Err(VfsError::io(
                IoOp::Lock,
                e,
                FileContext::new().with_path(&self.lock_path),
            )),
        }
    }

    fn unlock(&mut self, target: &mut LockTarget<'_>, level: LockLevel) -> Result<()> {
        if level > LockLevel::Shared {
            return Err(VfsError::misuse("unlock target must be NONE or SHARED"));
        }
        if *target.level <= level {
            return Ok(());
        }
        if level == LockLevel::Shared {
            *target.level = level;
            return Ok(());
        }
        match fs::remove_file(&self.lock_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(lock_file = %self.lock_path.display(), "Lock file already gone");
            }
            Err(e) => {
                return Err(VfsError::io(
                    IoOp::Unlock,
                    e,
                    FileContext::new().with_path(&self.lock_path),
                ));
            }
        }
        *target.level = LockLevel::None;
        Ok(())
    }

    fn check_reserved_lock(&mut self, target: &LockTarget<'_>) -> Result<bool> {
        if *target.level > LockLevel::None {
            return Ok(*target.level >= LockLevel::Reserved);
        }
        Ok(self.lock_path.exists())
    }

    fn close(self, file: File) -> Result<()> {
        drop(file);
        Ok(())
    }
}
