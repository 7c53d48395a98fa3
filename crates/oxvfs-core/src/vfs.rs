//! VFS entry points: open, delete, access, path resolution, randomness,
//! sleep and the clock.
//!
//! [`Vfs`] is the seam a storage engine programs against. [`UnixVfs`] is the
//! POSIX backend; it hands out [`UnixFile`] handles whose locking strategy is
//! fixed at open time.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::os::fd::AsFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::distr::Alphanumeric;
use rand::{Rng, RngCore};
use tracing::{debug, instrument, warn};

use crate::config::VfsConfig;
use crate::error::{FileContext, IoOp, Result, VfsError};
use crate::file::{OpenedParts, UnixFile};
use crate::lock::{
    DotFileLocker, FlockLocker, LockRegistry, LockStyle, Locker, NoLocker, PosixLocker, afp,
    detect_lock_style,
};
use crate::metrics::LockMetrics;
use crate::sync::sync_descriptor;
use crate::sys::{self, RangeLock};

/// Longest path name the storage engine may pass in.
pub const MAX_PATHNAME: usize = 512;

/// Prefix of temporary file names.
pub const TEMP_FILE_PREFIX: &str = "etilqs_";

const TEMP_NAME_RANDOM_CHARS: usize = 15;

/// Julian day number of the Unix epoch.
const UNIX_EPOCH_JULIAN_DAY: f64 = 2_440_587.5;

/// Milliseconds from the Julian epoch to the Unix epoch.
const UNIX_EPOCH_JULIAN_MS: i64 = 210_866_760_000_000;

/// Flags for [`Vfs::open`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OpenFlags(u32);

impl OpenFlags {
    pub const READONLY: Self = Self(0x01);
    pub const READWRITE: Self = Self(0x02);
    pub const CREATE: Self = Self(0x04);
    pub const DELETE_ON_CLOSE: Self = Self(0x08);
    pub const EXCLUSIVE: Self = Self(0x10);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Same request, read-only, without create.
    #[must_use]
    pub const fn read_only_fallback(self) -> Self {
        self.difference(Self::READWRITE.union(Self::CREATE))
            .union(Self::READONLY)
    }

    fn validate(self) -> Result<()> {
        let ro = self.contains(Self::READONLY);
        let rw = self.contains(Self::READWRITE);
        if ro == rw {
            return Err(VfsError::misuse("exactly one of READONLY or READWRITE is required"));
        }
        if self.contains(Self::CREATE) && !rw {
            return Err(VfsError::misuse("CREATE requires READWRITE"));
        }
        if self.contains(Self::EXCLUSIVE) && !self.contains(Self::CREATE) {
            return Err(VfsError::misuse("EXCLUSIVE requires CREATE"));
        }
        Ok(())
    }

    fn options(self) -> OpenOptions {
        let rw = self.contains(Self::READWRITE);
        let create = self.contains(Self::CREATE);
        let exclusive = self.contains(Self::EXCLUSIVE);
        let mut opts = OpenOptions::new();
        opts.read(true)
            .write(rw)
            .create(create && !exclusive)
            .create_new(create && exclusive)
            .mode(if self.contains(Self::DELETE_ON_CLOSE) { 0o600 } else { 0o644 })
            .custom_flags(libc::O_CLOEXEC);
        opts
    }
}

impl BitOr for OpenFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for OpenFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.union(rhs);
    }
}

impl fmt::Debug for OpenFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::READONLY, "READONLY"),
            (Self::READWRITE, "READWRITE"),
            (Self::CREATE, "CREATE"),
            (Self::DELETE_ON_CLOSE, "DELETE_ON_CLOSE"),
            (Self::EXCLUSIVE, "EXCLUSIVE"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "OpenFlags({})", set.join(" | "))
    }
}

/// What the storage engine is opening.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FileKind {
    #[default]
    MainDb,
    TempDb,
    TransientDb,
    MainJournal,
    TempJournal,
    SubJournal,
    MasterJournal,
}

impl FileKind {
    /// Journals whose directory entry must survive a crash.
    pub fn needs_dir_sync(self) -> bool {
        matches!(self, FileKind::MainJournal | FileKind::MasterJournal)
    }
}

/// Checks for [`Vfs::access`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Exists,
    ReadWrite,
    Read,
}

impl AccessMode {
    fn as_raw(self) -> libc::c_int {
        match self {
            AccessMode::Exists => libc::F_OK,
            AccessMode::ReadWrite => libc::R_OK | libc::W_OK,
            AccessMode::Read => libc::R_OK,
        }
    }
}

/// Operating-system services a storage engine needs.
pub trait Vfs {
    type File;

    fn name(&self) -> &str;

    /// Open `path`, or a fresh temporary file when `path` is `None`.
    fn open(&self, path: Option<&Path>, flags: OpenFlags, kind: FileKind) -> Result<Self::File>;

    /// Remove `path`; with `sync_dir`, also flush its directory entry.
    fn delete(&self, path: &Path, sync_dir: bool) -> Result<()>;

    fn access(&self, path: &Path, mode: AccessMode) -> Result<bool>;

    /// Absolute form of `path`. Symlinks are not resolved.
    fn full_pathname(&self, path: &Path) -> Result<PathBuf>;

    fn randomness(&self, n: usize) -> Vec<u8>;

    /// Sleep, returning the microseconds actually requested from the OS.
    fn sleep(&self, micros: u64) -> u64;

    /// Current time as a Julian day number.
    fn current_time(&self) -> f64;

    /// Current time in milliseconds since the Julian epoch.
    fn current_time_ms(&self) -> i64 {
        (self.current_time() * 86_400_000.0) as i64
    }

    fn max_pathname(&self) -> usize {
        MAX_PATHNAME
    }
}

/// POSIX VFS backend.
#[derive(Debug)]
pub struct UnixVfs {
    name: String,
    config: VfsConfig,
    registry: Arc<LockRegistry>,
    metrics: Arc<LockMetrics>,
}

impl Default for UnixVfs {
    fn default() -> Self {
        Self::new()
    }
}

impl UnixVfs {
    /// Default configuration, process-wide registry.
    pub fn new() -> Self {
        Self::with_config(VfsConfig::default())
    }

    /// Uses the process-wide registry unless the config fixes the
    /// thread-override capability, in which case the VFS gets its own.
    pub fn with_config(config: VfsConfig) -> Self {
        let registry = match config.thread_override {
            Some(overrides) => Arc::new(LockRegistry::with_thread_override(overrides)),
            None => LockRegistry::global(),
        };
        Self::with_registry(config, registry)
    }

    /// Share bookkeeping with other VFS instances using `registry`.
    ///
    /// Handles on one inode must share a registry, or closing one can drop
    /// the locks of another.
    pub fn with_registry(config: VfsConfig, registry: Arc<LockRegistry>) -> Self {
        let name = match config.lock_style.fixed() {
            Some(style) => format!("unix-{style}"),
            None => "unix".to_string(),
        };
        Self {
            name,
            config,
            registry,
            metrics: Arc::new(LockMetrics::new()),
        }
    }

    pub fn config(&self) -> &VfsConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<LockRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<LockMetrics> {
        &self.metrics
    }

    /// Locking style an open of `path` would pick.
    pub fn detect_lock_style(&self, path: &Path) -> Result<LockStyle> {
        if let Some(style) = self.config.lock_style.fixed() {
            return Ok(style);
        }
        let file = File::open(path).map_err(|source| VfsError::CantOpen {
            source,
            context: FileContext::new().with_path(path),
        })?;
        Ok(detect_lock_style(&file, false, &self.config.layout))
    }

    fn temp_file_name(&self) -> Result<PathBuf> {
        let dir = self
            .config
            .temp_dirs
            .iter()
            .find(|dir| {
                dir.is_dir() && sys::access(dir, libc::W_OK | libc::X_OK).unwrap_or(false)
            })
            .ok_or_else(|| VfsError::CantOpen {
                source: io::Error::new(
                    io::ErrorKind::NotFound,
                    "no writable temporary directory",
                ),
                context: FileContext::new(),
            })?;

        let mut rng = rand::rng();
        loop {
            let suffix: String = (&mut rng)
                .sample_iter(Alphanumeric)
                .take(TEMP_NAME_RANDOM_CHARS)
                .map(char::from)
                .collect();
            let candidate = dir.join(format!("{TEMP_FILE_PREFIX}{suffix}"));
            if !candidate.exists() {
                return Ok(candidate);
            }
        }
    }

    fn open_descriptor(&self, path: &Path, flags: OpenFlags) -> Result<(File, OpenFlags)> {
        match flags.options().open(path) {
            Ok(file) => Ok((file, flags)),
            Err(e)
                if flags.contains(OpenFlags::READWRITE)
                    && !flags.contains(OpenFlags::EXCLUSIVE)
                    && e.raw_os_error() != Some(libc::EISDIR) =>
            {
                debug!(path = %path.display(), error = %e, "Read-write open failed, retrying read-only");
                let fallback = flags.read_only_fallback();
                fallback
                    .options()
                    .open(path)
                    .map(|file| (file, fallback))
                    .map_err(|source| VfsError::CantOpen {
                        source,
                        context: FileContext::new().with_path(path),
                    })
            }
            Err(source) => Err(VfsError::CantOpen {
                source,
                context: FileContext::new().with_path(path),
            }),
        }
    }

    fn open_parent_dir(path: &Path) -> Result<File> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        File::open(parent).map_err(|source| VfsError::CantOpen {
            source,
            context: FileContext::new().with_path(parent),
        })
    }

    fn build_locker(&self, style: LockStyle, file: &File, path: &Path) -> Result<Locker> {
        Ok(match style {
            LockStyle::Posix => Locker::Posix(PosixLocker::attach(
                Arc::clone(&self.registry),
                Arc::clone(&self.metrics),
                file,
                RangeLock::Read,
            )?),
            LockStyle::Flock => Locker::Flock(FlockLocker),
            LockStyle::DotFile => Locker::DotFile(DotFileLocker::new(path)),
            LockStyle::Afp => Locker::Afp(afp::attach(
                Arc::clone(&self.registry),
                Arc::clone(&self.metrics),
                file,
            )?),
            LockStyle::NoLock => Locker::NoLock(NoLocker),
        })
    }
}

impl Vfs for UnixVfs {
    type File = UnixFile;

    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(level = "debug", skip(self), fields(vfs = %self.name))]
    fn open(&self, path: Option<&Path>, flags: OpenFlags, kind: FileKind) -> Result<UnixFile> {
        flags.validate()?;

        let anonymous = path.is_none();
        let (path, delete_on_close) = match path {
            Some(p) => (p.to_path_buf(), flags.contains(OpenFlags::DELETE_ON_CLOSE)),
            None => (self.temp_file_name()?, true),
        };
        let requested = if anonymous {
            if !flags.contains(OpenFlags::READWRITE) {
                return Err(VfsError::misuse("temporary files must be opened READWRITE"));
            }
            flags | OpenFlags::DELETE_ON_CLOSE | OpenFlags::CREATE | OpenFlags::EXCLUSIVE
        } else {
            flags
        };

        let (file, flags) = self.open_descriptor(&path, requested)?;

        if delete_on_close && let Err(e) = fs::remove_file(&path) {
            warn!(path = %path.display(), error = %e, "Could not unlink delete-on-close file");
        }

        let dir = if flags.contains(OpenFlags::CREATE) && kind.needs_dir_sync() && self.config.dir_sync
        {
            Some(Self::open_parent_dir(&path)?)
        } else {
            None
        };

        let read_only = flags.contains(OpenFlags::READONLY);
        let style = match self.config.lock_style.fixed() {
            Some(style) => style,
            None => detect_lock_style(&file, read_only, &self.config.layout),
        };
        let locker = self.build_locker(style, &file, &path)?;
        debug!(path = %path.display(), %style, ?flags, "Opened file");

        Ok(UnixFile::new(OpenedParts {
            file,
            dir,
            path: (!anonymous).then_some(path),
            locker,
            layout: self.config.layout,
            metrics: Arc::clone(&self.metrics),
            full_fsync: self.config.full_fsync,
            flags,
            kind,
        }))
    }

    #[instrument(level = "debug", skip(self))]
    fn delete(&self, path: &Path, sync_dir: bool) -> Result<()> {
        fs::remove_file(path).map_err(|e| {
            VfsError::io(IoOp::Delete, e, FileContext::new().with_path(path))
        })?;
        if sync_dir {
            let dir = Self::open_parent_dir(path)?;
            sync_descriptor(dir.as_fd(), false, false).map_err(|e| {
                VfsError::io(IoOp::DirFsync, e, FileContext::new().with_path(path))
            })?;
            self.metrics.record_dir_sync();
        }
        Ok(())
    }

    fn access(&self, path: &Path, mode: AccessMode) -> Result<bool> {
        sys::access(path, mode.as_raw())
            .map_err(|e| VfsError::io(IoOp::Access, e, FileContext::new().with_path(path)))
    }

    fn full_pathname(&self, path: &Path) -> Result<PathBuf> {
        if path.is_absolute() {
            return Ok(path.to_path_buf());
        }
        let cwd = std::env::current_dir().map_err(|source| VfsError::CantOpen {
            source,
            context: FileContext::new().with_path(path),
        })?;
        Ok(cwd.join(path))
    }

    fn randomness(&self, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        rand::rng().fill_bytes(&mut buf);
        buf
    }

    fn sleep(&self, micros: u64) -> u64 {
        std::thread::sleep(Duration::from_micros(micros));
        micros
    }

    fn current_time(&self) -> f64 {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        UNIX_EPOCH_JULIAN_DAY + since_epoch.as_secs_f64() / 86_400.0
    }

    fn current_time_ms(&self) -> i64 {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        UNIX_EPOCH_JULIAN_MS + since_epoch.as_millis() as i64
    }
}
