#![allow(deprecated)] // cargo_bin! macro doesn't exist yet in assert_cmd 2.1

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use tempfile::TempDir;

use oxvfs_core::{FileKind, LockLevel, LockStyle, OpenFlags, UnixFile, UnixVfs, Vfs, VfsConfig};

/// Scratch directory used both for test files and as an empty config dir.
struct Scratch {
    dir: TempDir,
}

impl Scratch {
    fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// A database-sized file with recognisable content.
    fn db(&self) -> PathBuf {
        let path = self.path("test.db");
        std::fs::write(&path, vec![0x5a; 8192]).expect("write db");
        path
    }

    fn oxvfs(&self) -> Command {
        let mut cmd = Command::cargo_bin("oxvfs").unwrap();
        cmd.env("OXVFS_CONFIG_DIR", self.dir.path());
        cmd.env_remove("RUST_LOG");
        cmd
    }
}

/// Child process holding EXCLUSIVE on `path` until killed.
struct LockHolder(Child);

impl LockHolder {
    fn spawn(scratch: &Scratch, path: &Path) -> Self {
        let mut child = std::process::Command::new(assert_cmd::cargo::cargo_bin("oxvfs"))
            .env("OXVFS_CONFIG_DIR", scratch.dir.path())
            .args(["--style", "posix", "lock"])
            .arg(path)
            .args(["--level", "exclusive", "--hold", "60000"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn lock holder");

        let stdout = child.stdout.take().expect("child stdout");
        let mut line = String::new();
        BufReader::new(stdout)
            .read_line(&mut line)
            .expect("read lock holder output");
        assert_eq!(line.trim(), "locked exclusive");
        Self(child)
    }
}

impl Drop for LockHolder {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

// ============================================================================
// Help and usage
// ============================================================================

#[test]
fn test_help_lists_commands() {
    Scratch::new()
        .oxvfs()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("lock"))
        .stdout(predicate::str::contains("check"))
        .stdout(predicate::str::contains("decode"));
}

#[test]
fn test_unknown_level_is_usage_error() {
    let scratch = Scratch::new();
    let db = scratch.db();
    scratch
        .oxvfs()
        .arg("lock")
        .arg(&db)
        .args(["--level", "mighty"])
        .assert()
        .code(2);
}

#[test]
fn test_pending_cannot_be_requested() {
    let scratch = Scratch::new();
    let db = scratch.db();
    scratch
        .oxvfs()
        .arg("lock")
        .arg(&db)
        .args(["--level", "pending"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("out of sequence"));
}

// ============================================================================
// Lock, check, sync, info
// ============================================================================

#[test]
fn test_lock_and_release() {
    let scratch = Scratch::new();
    let db = scratch.db();
    scratch
        .oxvfs()
        .args(["--style", "posix", "lock"])
        .arg(&db)
        .args(["--level", "reserved"])
        .assert()
        .success()
        .stdout(predicate::str::contains("locked reserved"))
        .stdout(predicate::str::contains("released"));
}

#[test]
fn test_lock_missing_file_not_found() {
    let scratch = Scratch::new();
    scratch
        .oxvfs()
        .arg("lock")
        .arg(scratch.path("missing.db"))
        .assert()
        .code(4);
}

#[test]
fn test_quiet_lock_prints_nothing() {
    let scratch = Scratch::new();
    let db = scratch.db();
    scratch
        .oxvfs()
        .args(["-q", "--style", "posix", "lock"])
        .arg(&db)
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn test_check_unlocked_file() {
    let scratch = Scratch::new();
    let db = scratch.db();
    scratch
        .oxvfs()
        .args(["--style", "posix", "check"])
        .arg(&db)
        .assert()
        .success()
        .stdout(predicate::str::contains("no reserved lock"));
}

#[test]
fn test_cross_process_conflict_is_busy() {
    let scratch = Scratch::new();
    let db = scratch.db();
    let _holder = LockHolder::spawn(&scratch, &db);

    scratch
        .oxvfs()
        .args(["--style", "posix", "lock"])
        .arg(&db)
        .args(["--level", "shared"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("locked"));

    scratch
        .oxvfs()
        .args(["--style", "posix", "check"])
        .arg(&db)
        .assert()
        .success()
        .stdout(predicate::str::contains("reserved lock held"));
}

#[test]
fn test_lock_available_after_holder_exits() {
    let scratch = Scratch::new();
    let db = scratch.db();
    drop(LockHolder::spawn(&scratch, &db));

    scratch
        .oxvfs()
        .args(["--style", "posix", "lock"])
        .arg(&db)
        .assert()
        .success()
        .stdout(predicate::str::contains("locked exclusive"));
}

#[test]
fn test_sync() {
    let scratch = Scratch::new();
    let db = scratch.db();
    scratch
        .oxvfs()
        .arg("sync")
        .arg(&db)
        .args(["--full", "--data-only"])
        .assert()
        .success()
        .stdout(predicate::str::contains("synced"));
}

#[test]
fn test_info_json() {
    let scratch = Scratch::new();
    let db = scratch.db();
    let output = scratch
        .oxvfs()
        .args(["--style", "posix", "info"])
        .arg(&db)
        .arg("--json")
        .output()
        .unwrap();
    assert!(output.status.success());

    let info: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(info["size"], 8192);
    assert_eq!(info["lock_style"], "posix");
    assert_eq!(info["pending_byte"], 0x4000_0000u64);
    assert_eq!(info["reserved_byte"], 0x4000_0001u64);
    assert_eq!(info["shared_size"], 510);
}

#[test]
fn test_config_file_layout() {
    let scratch = Scratch::new();
    let db = scratch.db();
    std::fs::write(
        scratch.path("config.toml"),
        "[defaults]\nlock_style = \"posix\"\npending_byte = 4096\nshared_size = 16\n",
    )
    .unwrap();

    scratch
        .oxvfs()
        .arg("info")
        .arg(&db)
        .arg("--json")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"pending_byte\": 4096"))
        .stdout(predicate::str::contains("\"shared_size\": 16"));
}

#[test]
fn test_bad_config_file() {
    let scratch = Scratch::new();
    let db = scratch.db();
    std::fs::write(scratch.path("config.toml"), "[defaults\n").unwrap();
    scratch
        .oxvfs()
        .arg("info")
        .arg(&db)
        .assert()
        .failure()
        .stderr(predicate::str::contains("config"));
}

#[test]
fn test_stats_flag() {
    let scratch = Scratch::new();
    let db = scratch.db();
    scratch
        .oxvfs()
        .args(["--stats", "--style", "posix", "lock"])
        .arg(&db)
        .assert()
        .success()
        .stderr(predicate::str::contains("os lock acquisitions"));
}

#[test]
fn test_probe() {
    let scratch = Scratch::new();
    let db = scratch.db();
    let output = scratch
        .oxvfs()
        .arg("probe")
        .arg(&db)
        .arg("--json")
        .output()
        .unwrap();
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert!(report["threads_override_locks"].is_boolean());
    assert!(report["lock_style"].is_string());
}

// ============================================================================
// Locks held by this test process
// ============================================================================

fn local_vfs(style: LockStyle) -> UnixVfs {
    UnixVfs::with_config(
        VfsConfig::default()
            .with_lock_style(style)
            .with_thread_override(true),
    )
}

fn open_local(vfs: &UnixVfs, path: &Path) -> UnixFile {
    vfs.open(Some(path), OpenFlags::READWRITE, FileKind::MainDb)
        .expect("open database")
}

#[test]
fn test_closing_sibling_keeps_shared_lock_for_other_processes() {
    let scratch = Scratch::new();
    let db = scratch.db();
    let vfs = local_vfs(LockStyle::Posix);
    let mut a = open_local(&vfs, &db);
    let mut b = open_local(&vfs, &db);
    a.lock(LockLevel::Shared).unwrap();
    b.lock(LockLevel::Shared).unwrap();
    a.close().unwrap();

    scratch
        .oxvfs()
        .args(["--style", "posix", "lock"])
        .arg(&db)
        .args(["--level", "exclusive"])
        .assert()
        .code(3);

    b.unlock(LockLevel::None).unwrap();
    scratch
        .oxvfs()
        .args(["--style", "posix", "lock"])
        .arg(&db)
        .args(["--level", "exclusive"])
        .assert()
        .success()
        .stdout(predicate::str::contains("locked exclusive"));
}

#[test]
fn test_afp_writer_survives_sibling_close() {
    let scratch = Scratch::new();
    let db = scratch.db();
    let vfs = local_vfs(LockStyle::Afp);
    let mut a = open_local(&vfs, &db);
    let mut b = open_local(&vfs, &db);
    a.lock(LockLevel::Shared).unwrap();
    b.lock(LockLevel::Shared).unwrap();
    a.lock(LockLevel::Reserved).unwrap();
    assert!(b.lock(LockLevel::Reserved).unwrap_err().is_busy());

    drop(b);
    a.lock(LockLevel::Exclusive).unwrap();

    scratch
        .oxvfs()
        .args(["--style", "afp", "lock"])
        .arg(&db)
        .args(["--level", "shared"])
        .assert()
        .code(3);

    a.unlock(LockLevel::None).unwrap();
    scratch
        .oxvfs()
        .args(["--style", "afp", "lock"])
        .arg(&db)
        .args(["--level", "shared"])
        .assert()
        .success()
        .stdout(predicate::str::contains("locked shared"));
}

// ============================================================================
// Decode
// ============================================================================

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

#[test]
fn test_decode_gzip() {
    let scratch = Scratch::new();
    let body = scratch.path("body.gz");
    let text = "decoded through the filter chain\n".repeat(200);
    std::fs::write(&body, gzip(text.as_bytes())).unwrap();

    scratch
        .oxvfs()
        .arg("decode")
        .arg(&body)
        .args(["--encoding", "gzip", "--chunk", "7"])
        .assert()
        .success()
        .stdout(text);
}

#[test]
fn test_decode_from_stdin() {
    let scratch = Scratch::new();
    scratch
        .oxvfs()
        .args(["decode", "-", "-e", "gzip"])
        .write_stdin(gzip(b"from a pipe"))
        .assert()
        .success()
        .stdout("from a pipe");
}

#[test]
fn test_decode_corrupt_input() {
    let scratch = Scratch::new();
    let body = scratch.path("body.gz");
    std::fs::write(&body, b"definitely not gzip").unwrap();

    scratch
        .oxvfs()
        .arg("decode")
        .arg(&body)
        .args(["--encoding", "gzip"])
        .assert()
        .code(7);
}

#[test]
fn test_decode_truncated_input() {
    let scratch = Scratch::new();
    let body = scratch.path("body.gz");
    let full = gzip(&"cut short ".repeat(500).into_bytes());
    std::fs::write(&body, &full[..full.len() / 2]).unwrap();

    scratch
        .oxvfs()
        .arg("decode")
        .arg(&body)
        .args(["--encoding", "gzip"])
        .assert()
        .code(7)
        .stderr(predicate::str::contains("ended early"));
}

#[test]
fn test_decode_unsupported_encoding() {
    let scratch = Scratch::new();
    let body = scratch.path("body.br");
    std::fs::write(&body, b"whatever").unwrap();

    scratch
        .oxvfs()
        .arg("decode")
        .arg(&body)
        .args(["--encoding", "br"])
        .assert()
        .code(2);
}
