//! Lock protocol tests against real files.
//!
//! Every test builds its own VFS (and therefore its own registry) so tests
//! running in parallel never share bookkeeping.

use oxvfs_core::{LockLevel, Vfs, VfsError, VfsConfig, LockStyle, UnixVfs, FileKind};
use proptest::prelude::*;
use std::sync::Arc;
use std::thread;

mod common;
use common::{afp_vfs, open_db, posix_vfs, scratch_db, rw_create};

// ============================================================================
// Protocol order
// ============================================================================

#[test]
fn test_full_climb_and_release() {
    let (_dir, path) = scratch_db();
    let vfs = posix_vfs();
    let mut db = open_db(&vfs, &path);

    db.lock(LockLevel::Shared).unwrap();
    db.lock(LockLevel::Reserved).unwrap();
    db.lock(LockLevel::Exclusive).unwrap();
    assert_eq!(db.lock_level(), LockLevel::Exclusive);

    // Re-requesting a lower level is a no-op
    db.lock(LockLevel::Shared).unwrap();
    assert_eq!(db.lock_level(), LockLevel::Exclusive);

    db.unlock(LockLevel::Shared).unwrap();
    assert_eq!(db.lock_level(), LockLevel::Shared);
    db.unlock(LockLevel::None).unwrap();
    assert_eq!(db.lock_level(), LockLevel::None);

    let key = db.lock_key().unwrap();
    let state = vfs.registry().enter();
    let info = state.lock_info(&key).unwrap();
    assert_eq!(info.level, LockLevel::None);
    assert_eq!(info.cnt, 0);
}

#[test]
fn test_shared_straight_to_exclusive() {
    let (_dir, path) = scratch_db();
    let vfs = posix_vfs();
    let mut db = open_db(&vfs, &path);

    db.lock(LockLevel::Shared).unwrap();
    db.lock(LockLevel::Exclusive).unwrap();
    assert_eq!(db.lock_level(), LockLevel::Exclusive);
    db.close().unwrap();
}

#[test]
fn test_out_of_order_requests_are_misuse() {
    let (_dir, path) = scratch_db();
    let vfs = posix_vfs();
    let mut db = open_db(&vfs, &path);

    assert!(matches!(db.lock(LockLevel::Reserved), Err(VfsError::Misuse { .. })));
    assert!(matches!(db.lock(LockLevel::Exclusive), Err(VfsError::Misuse { .. })));
    assert!(matches!(db.lock(LockLevel::Pending), Err(VfsError::Misuse { .. })));

    db.lock(LockLevel::Shared).unwrap();
    assert!(matches!(db.lock(LockLevel::Pending), Err(VfsError::Misuse { .. })));
    assert!(matches!(db.unlock(LockLevel::Reserved), Err(VfsError::Misuse { .. })));
    assert_eq!(db.lock_level(), LockLevel::Shared);
}

// ============================================================================
// Several handles in one process
// ============================================================================

#[test]
fn test_shared_handles_share_one_os_lock() {
    let (_dir, path) = scratch_db();
    let vfs = posix_vfs();
    let mut handles: Vec<_> = (0..5).map(|_| open_db(&vfs, &path)).collect();

    for handle in &mut handles {
        handle.lock(LockLevel::Shared).unwrap();
        assert_eq!(handle.lock_level(), LockLevel::Shared);
    }

    let snap = vfs.metrics().snapshot();
    assert_eq!(snap.os_lock_acquisitions, 1);
    assert_eq!(snap.shared_fast_path_hits, 4);

    let key = handles[0].lock_key().unwrap();
    assert_eq!(vfs.registry().enter().lock_info(&key).unwrap().cnt, 5);
}

#[test]
fn test_second_writer_is_busy() {
    let (_dir, path) = scratch_db();
    let vfs = posix_vfs();
    let mut a = open_db(&vfs, &path);
    let mut b = open_db(&vfs, &path);

    a.lock(LockLevel::Shared).unwrap();
    b.lock(LockLevel::Shared).unwrap();
    a.lock(LockLevel::Reserved).unwrap();

    assert!(b.lock(LockLevel::Reserved).unwrap_err().is_busy());
    assert_eq!(b.lock_level(), LockLevel::Shared);
    assert!(b.check_reserved_lock().unwrap());
    assert_eq!(vfs.metrics().snapshot().busy_results, 1);
}

#[test]
fn test_exclusive_blocked_by_local_reader_degrades_to_pending() {
    let (_dir, path) = scratch_db();
    let vfs = posix_vfs();
    let mut writer = open_db(&vfs, &path);
    let mut reader = open_db(&vfs, &path);

    writer.lock(LockLevel::Shared).unwrap();
    reader.lock(LockLevel::Shared).unwrap();
    writer.lock(LockLevel::Reserved).unwrap();

    assert!(writer.lock(LockLevel::Exclusive).unwrap_err().is_busy());
    assert_eq!(writer.lock_level(), LockLevel::Pending);

    // PENDING keeps new readers out
    let mut latecomer = open_db(&vfs, &path);
    assert!(latecomer.lock(LockLevel::Shared).unwrap_err().is_busy());

    // Once the reader leaves, the writer can finish the climb
    reader.unlock(LockLevel::None).unwrap();
    writer.lock(LockLevel::Exclusive).unwrap();
    assert_eq!(writer.lock_level(), LockLevel::Exclusive);

    writer.unlock(LockLevel::None).unwrap();
    latecomer.lock(LockLevel::Shared).unwrap();
}

#[test]
fn test_check_reserved_without_locks() {
    let (_dir, path) = scratch_db();
    let vfs = posix_vfs();
    let mut db = open_db(&vfs, &path);
    assert!(!db.check_reserved_lock().unwrap());
    db.lock(LockLevel::Shared).unwrap();
    assert!(!db.check_reserved_lock().unwrap());
    db.lock(LockLevel::Reserved).unwrap();
    assert!(db.check_reserved_lock().unwrap());
}

// ============================================================================
// AFP-style handles in one process
// ============================================================================

#[test]
fn test_afp_second_writer_is_busy() {
    let (_dir, path) = scratch_db();
    let vfs = afp_vfs();
    let mut a = open_db(&vfs, &path);
    let mut b = open_db(&vfs, &path);
    assert_eq!(a.lock_style(), LockStyle::Afp);
    assert_eq!(a.lock_key(), b.lock_key());

    a.lock(LockLevel::Shared).unwrap();
    b.lock(LockLevel::Shared).unwrap();
    a.lock(LockLevel::Reserved).unwrap();

    assert!(b.lock(LockLevel::Reserved).unwrap_err().is_busy());
    assert_eq!(b.lock_level(), LockLevel::Shared);
    assert!(b.check_reserved_lock().unwrap());

    // b still reads, so a stops at PENDING
    assert!(a.lock(LockLevel::Exclusive).unwrap_err().is_busy());
    assert_eq!(a.lock_level(), LockLevel::Pending);
    assert!(b.lock(LockLevel::Exclusive).is_err());
}

#[test]
fn test_afp_close_keeps_writer_lock() {
    let (_dir, path) = scratch_db();
    let vfs = afp_vfs();
    let mut a = open_db(&vfs, &path);
    let mut b = open_db(&vfs, &path);

    a.lock(LockLevel::Shared).unwrap();
    b.lock(LockLevel::Shared).unwrap();
    a.lock(LockLevel::Reserved).unwrap();
    let key = a.lock_key().unwrap();
    let id = a.file_id().unwrap();

    drop(b);
    {
        let state = vfs.registry().enter();
        assert_eq!(state.lock_info(&key).unwrap().cnt, 1);
        assert_eq!(state.open_count(&id).unwrap().pending.len(), 1);
    }

    a.lock(LockLevel::Exclusive).unwrap();
    assert_eq!(a.lock_level(), LockLevel::Exclusive);
    assert_eq!(
        vfs.registry().enter().lock_info(&key).unwrap().level,
        LockLevel::Exclusive
    );

    a.unlock(LockLevel::None).unwrap();
    {
        let state = vfs.registry().enter();
        assert!(state.open_count(&id).unwrap().pending.is_empty());
    }
    a.close().unwrap();
    assert_eq!(vfs.registry().enter().lock_entries(), 0);
}

// ============================================================================
// Deferred close
// ============================================================================

#[test]
fn test_close_does_not_drop_sibling_lock() {
    let (_dir, path) = scratch_db();
    let vfs = posix_vfs();
    let mut a = open_db(&vfs, &path);
    let mut b = open_db(&vfs, &path);

    a.lock(LockLevel::Shared).unwrap();
    b.lock(LockLevel::Shared).unwrap();
    let key = b.lock_key().unwrap();
    let id = b.file_id().unwrap();

    a.close().unwrap();

    {
        let state = vfs.registry().enter();
        let info = state.lock_info(&key).unwrap();
        assert_eq!(info.level, LockLevel::Shared);
        assert_eq!(info.cnt, 1);
        let open = state.open_count(&id).unwrap();
        assert_eq!(open.n_lock, 1);
        assert_eq!(open.pending.len(), 1, "descriptor must be parked");
    }
    assert_eq!(b.lock_level(), LockLevel::Shared);
    assert_eq!(vfs.metrics().snapshot().deferred_closes, 1);

    // Last lock cleared: parked descriptor is flushed
    b.unlock(LockLevel::None).unwrap();
    {
        let state = vfs.registry().enter();
        assert!(state.open_count(&id).unwrap().pending.is_empty());
    }
    assert_eq!(vfs.metrics().snapshot().deferred_flushes, 1);

    b.close().unwrap();
    let state = vfs.registry().enter();
    assert_eq!(state.lock_entries(), 0);
    assert_eq!(state.open_entries(), 0);
}

#[test]
fn test_unlocked_close_is_immediate() {
    let (_dir, path) = scratch_db();
    let vfs = posix_vfs();
    let a = open_db(&vfs, &path);
    let b = open_db(&vfs, &path);
    let id = b.file_id().unwrap();

    a.close().unwrap();
    assert!(vfs.registry().enter().open_count(&id).unwrap().pending.is_empty());
    assert_eq!(vfs.metrics().snapshot().deferred_closes, 0);
    drop(b);
    assert_eq!(vfs.registry().enter().open_entries(), 0);
}

#[test]
fn test_drop_releases_locks() {
    let (_dir, path) = scratch_db();
    let vfs = posix_vfs();
    {
        let mut db = open_db(&vfs, &path);
        db.lock(LockLevel::Shared).unwrap();
        db.lock(LockLevel::Exclusive).unwrap();
    }
    let mut other = open_db(&vfs, &path);
    other.lock(LockLevel::Shared).unwrap();
    other.lock(LockLevel::Exclusive).unwrap();
}

// ============================================================================
// Thread ownership
// ============================================================================

#[test]
fn test_thread_keyed_ownership_transfer() {
    let (_dir, path) = scratch_db();
    let vfs = UnixVfs::with_config(
        VfsConfig::default()
            .with_lock_style(LockStyle::Posix)
            .with_thread_override(false),
    );
    let mut db = vfs.open(Some(&path), rw_create(), FileKind::MainDb).unwrap();
    let main_key = db.lock_key().unwrap();
    assert!(main_key.owner.is_some());

    // An unlocked handle may move to another thread
    let moved_key = thread::scope(|s| {
        s.spawn(|| {
            db.lock(LockLevel::Shared).unwrap();
            db.unlock(LockLevel::None).unwrap();
            db.lock_key().unwrap()
        })
        .join()
        .unwrap()
    });
    assert_ne!(moved_key, main_key);

    // A locked handle may not
    db.lock(LockLevel::Shared).unwrap();
    thread::scope(|s| {
        s.spawn(|| {
            assert!(matches!(db.unlock(LockLevel::None), Err(VfsError::Misuse { .. })));
            assert!(matches!(db.lock(LockLevel::Reserved), Err(VfsError::Misuse { .. })));
        });
    });
    assert_eq!(db.lock_level(), LockLevel::Shared);
    db.unlock(LockLevel::None).unwrap();
}

#[test]
fn test_concurrent_readers_across_threads() {
    let (_dir, path) = scratch_db();
    let vfs = Arc::new(posix_vfs());
    // Create the file before the race
    drop(open_db(&vfs, &path));

    thread::scope(|s| {
        for _ in 0..8 {
            let vfs = Arc::clone(&vfs);
            let path = path.clone();
            s.spawn(move || {
                let mut db = open_db(&vfs, &path);
                for _ in 0..50 {
                    db.lock(LockLevel::Shared).unwrap();
                    db.unlock(LockLevel::None).unwrap();
                }
            });
        }
    });

    let state = vfs.registry().enter();
    assert_eq!(state.lock_entries(), 0);
    assert_eq!(state.open_entries(), 0);
}

// ============================================================================
// Properties
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Op {
    Lock(LockLevel),
    Unlock(LockLevel),
    CheckReserved,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Lock(LockLevel::Shared)),
        Just(Op::Lock(LockLevel::Reserved)),
        Just(Op::Lock(LockLevel::Exclusive)),
        Just(Op::Unlock(LockLevel::Shared)),
        Just(Op::Unlock(LockLevel::None)),
        Just(Op::CheckReserved),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// With a single local holder, the handle's level is the process level.
    #[test]
    fn prop_handle_level_matches_registry(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let (_dir, path) = scratch_db();
        let vfs = posix_vfs();
        let mut db = open_db(&vfs, &path);
        let key = db.lock_key().unwrap();

        for op in ops {
            let _ = match op {
                Op::Lock(level) => db.lock(level),
                Op::Unlock(level) => db.unlock(level),
                Op::CheckReserved => db.check_reserved_lock().map(|_| ()),
            };
            let state = vfs.registry().enter();
            let info = state.lock_info(&key).unwrap();
            if info.cnt <= 1 {
                prop_assert_eq!(info.level, db.lock_level());
            }
            prop_assert!(info.cnt <= 1);
        }
    }

    /// Two handles interleaving requests: never both above SHARED.
    #[test]
    fn prop_single_writer(ops in prop::collection::vec((any::<bool>(), op_strategy()), 1..60)) {
        let (_dir, path) = scratch_db();
        let vfs = posix_vfs();
        let mut handles = [open_db(&vfs, &path), open_db(&vfs, &path)];

        for (which, op) in ops {
            let db = &mut handles[usize::from(which)];
            let _ = match op {
                Op::Lock(level) => db.lock(level),
                Op::Unlock(level) => db.unlock(level),
                Op::CheckReserved => db.check_reserved_lock().map(|_| ()),
            };
            let above_shared = handles
                .iter()
                .filter(|h| h.lock_level() > LockLevel::Shared)
                .count();
            prop_assert!(above_shared <= 1);
            let exclusive = handles
                .iter()
                .filter(|h| h.lock_level() == LockLevel::Exclusive)
                .count();
            if exclusive == 1 {
                prop_assert!(handles.iter().all(|h| h.lock_level() == LockLevel::Exclusive
                    || h.lock_level() == LockLevel::None));
            }
        }
    }
}
