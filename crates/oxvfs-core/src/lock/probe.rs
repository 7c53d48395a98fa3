//! Runtime probe: do threads override each other's POSIX locks?
//!
//! On most kernels a process's locks are shared by all its threads, so a
//! write lock taken by one thread does not block a conflicting lock from
//! another. Some older threading implementations give each thread its own
//! lock owner. Two threads race conflicting locks on one byte of a private
//! temporary file. If both succeed, threads override each other.

use std::io;
use std::os::fd::AsFd;
use std::thread;

use tracing::{debug, warn};

use crate::sys::{self, RangeLock};

/// Run the probe. Any failure to set it up counts as "threads override",
/// which keys the registry by inode alone.
pub fn threads_override_locks() -> bool {
    match probe() {
        Ok(overrides) => {
            debug!(overrides, "Thread lock-override probe finished");
            overrides
        }
        Err(e) => {
            warn!(error = %e, "Thread lock-override probe failed, assuming threads override");
            true
        }
    }
}

fn probe() -> io::Result<bool> {
    let file = tempfile::tempfile()?;
    let dup = file.try_clone()?;

    sys::set_lock(file.as_fd(), RangeLock::Write, 0, 1)?;

    let other_thread_got_lock = thread::scope(|s| {
        s.spawn(|| sys::set_lock(dup.as_fd(), RangeLock::Write, 0, 1).is_ok())
            .join()
    })
    .map_err(|_| io::Error::other("probe thread panicked"))?;

    sys::set_lock(file.as_fd(), RangeLock::Unlock, 0, 1)?;
    Ok(other_thread_got_lock)
}
