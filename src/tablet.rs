//! The storage-engine collaborators the transfer engine borrows: tablets,
//! their data dirs, the tablet manager, and the snapshot manager.
//!
//! These are narrow trait surfaces; the real implementations live in the
//! storage engine.  The engine only ever borrows them for the duration of
//! one call, so everything is `Arc`-shared and internally synchronized.
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::fresh_warn;
use crate::result::ErrorKind;
use crate::result::Result;

/// A storage root on one physical disk, with capacity accounting.
pub trait DataDir: Send + Sync {
    fn path(&self) -> &Path;

    /// Whether hosting `incoming_bytes` more would push the dir over its
    /// capacity limit.  Advisory: races with concurrent writers are
    /// accepted.
    fn reach_capacity_limit(&self, incoming_bytes: u64) -> bool;
}

/// A live tablet, as seen by the transfer engine.
///
/// The six lock accessors expose the subsystems that may be rewriting the
/// tablet's files or meta concurrently (migration, the three compaction
/// flavors, inverted-index builds, and meta-store checkpoints).  Snapshot
/// installation must hold all six.
pub trait Tablet: Send + Sync {
    fn tablet_id(&self) -> i64;
    fn replica_id(&self) -> i64;
    fn table_id(&self) -> i64;
    fn partition_id(&self) -> i64;

    /// The live tablet directory (`.../<tablet_id>/<schema_hash>`).
    fn tablet_path(&self) -> &Path;

    fn data_dir(&self) -> Arc<dyn DataDir>;

    fn migration_lock(&self) -> &Mutex<()>;
    fn base_compaction_lock(&self) -> &Mutex<()>;
    fn cumulative_compaction_lock(&self) -> &Mutex<()>;
    fn cold_compaction_lock(&self) -> &Mutex<()>;
    fn build_inverted_index_lock(&self) -> &Mutex<()>;
    fn meta_store_lock(&self) -> &Mutex<()>;
}

/// Tries to take all six tablet locks without blocking, in the fixed
/// order: migration, base compaction, cumulative compaction, cold
/// compaction, inverted-index build, meta store.
///
/// Blocking here could deadlock against the compactors, so contention on
/// any lock fails the whole acquisition with the retryable
/// `ObtainLockFailed`.  The guards release together when dropped.
pub fn try_lock_tablet<'a>(tablet: &'a dyn Tablet) -> Result<Vec<MutexGuard<'a, ()>>> {
    let locks = [
        tablet.migration_lock(),
        tablet.base_compaction_lock(),
        tablet.cumulative_compaction_lock(),
        tablet.cold_compaction_lock(),
        tablet.build_inverted_index_lock(),
        tablet.meta_store_lock(),
    ];

    let mut guards = Vec::with_capacity(locks.len());
    for lock in locks {
        match lock.try_lock() {
            Ok(guard) => guards.push(guard),
            Err(_) => {
                return Err(fresh_warn!(
                    "failed to get tablet locks",
                    tablet_id = tablet.tablet_id()
                )
                .with_kind(ErrorKind::ObtainLockFailed));
            }
        }
    }

    Ok(guards)
}

/// The tablet registry of the storage engine.
pub trait TabletManager: Send + Sync {
    fn get_tablet(&self, tablet_id: i64) -> Option<Arc<dyn Tablet>>;

    /// Re-reads the tablet header from `tablet_path` and replaces the
    /// in-memory tablet, forcibly if `force`.
    fn load_tablet_from_dir(
        &self,
        store: &dyn DataDir,
        tablet_id: i64,
        schema_hash: i32,
        tablet_path: &Path,
        force: bool,
    ) -> Result<()>;
}

/// The snapshot manager's rowset-id rewriter.
pub trait SnapshotManager: Send + Sync {
    /// Rewrites rowset ids and the tablet id embedded in the rowset metas
    /// of `snapshot_path`, in place.
    #[allow(clippy::too_many_arguments)]
    fn convert_rowset_ids(
        &self,
        snapshot_path: &Path,
        tablet_id: i64,
        replica_id: i64,
        table_id: i64,
        partition_id: i64,
        schema_hash: i32,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    struct FakeDataDir(PathBuf);

    impl DataDir for FakeDataDir {
        fn path(&self) -> &Path {
            &self.0
        }

        fn reach_capacity_limit(&self, _incoming_bytes: u64) -> bool {
            false
        }
    }

    #[derive(Default)]
    struct LockSet {
        migration: Mutex<()>,
        base: Mutex<()>,
        cumulative: Mutex<()>,
        cold: Mutex<()>,
        build_index: Mutex<()>,
        meta_store: Mutex<()>,
    }

    struct FakeTablet {
        path: PathBuf,
        locks: LockSet,
    }

    impl FakeTablet {
        fn new() -> FakeTablet {
            FakeTablet {
                path: PathBuf::from("/data/10007/123"),
                locks: Default::default(),
            }
        }
    }

    impl Tablet for FakeTablet {
        fn tablet_id(&self) -> i64 {
            10007
        }

        fn replica_id(&self) -> i64 {
            1
        }

        fn table_id(&self) -> i64 {
            2
        }

        fn partition_id(&self) -> i64 {
            3
        }

        fn tablet_path(&self) -> &Path {
            &self.path
        }

        fn data_dir(&self) -> Arc<dyn DataDir> {
            Arc::new(FakeDataDir(PathBuf::from("/data")))
        }

        fn migration_lock(&self) -> &Mutex<()> {
            &self.locks.migration
        }

        fn base_compaction_lock(&self) -> &Mutex<()> {
            &self.locks.base
        }

        fn cumulative_compaction_lock(&self) -> &Mutex<()> {
            &self.locks.cumulative
        }

        fn cold_compaction_lock(&self) -> &Mutex<()> {
            &self.locks.cold
        }

        fn build_inverted_index_lock(&self) -> &Mutex<()> {
            &self.locks.build_index
        }

        fn meta_store_lock(&self) -> &Mutex<()> {
            &self.locks.meta_store
        }
    }

    /// All six locks free: acquisition succeeds and holds all of them.
    #[test]
    fn test_try_lock_tablet() {
        let tablet = FakeTablet::new();

        let guards = try_lock_tablet(&tablet).expect("uncontended locks should be acquired");
        assert_eq!(guards.len(), 6);
        assert!(tablet.migration_lock().try_lock().is_err());
        assert!(tablet.meta_store_lock().try_lock().is_err());

        drop(guards);
        assert!(tablet.migration_lock().try_lock().is_ok());
    }

    /// One contended lock fails the whole set with a retryable error, and
    /// releases the locks it did take.
    #[test]
    fn test_try_lock_tablet_contended() {
        let tablet = FakeTablet::new();

        let _held = tablet.cold_compaction_lock().lock().unwrap();
        let err = try_lock_tablet(&tablet).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ObtainLockFailed);
        assert!(err.kind().is_retryable());

        // The earlier locks in the order were released on failure.
        assert!(tablet.migration_lock().try_lock().is_ok());
        assert!(tablet.base_compaction_lock().try_lock().is_ok());
    }
}
