//! Collaborator fakes shared by the scenario tests: a directory-backed
//! remote filesystem, a scriptable coordinator, and in-memory tablet
//! plumbing.
#![allow(dead_code)]

use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use tabletsync::chain_error;
use tabletsync::config::TransferConfig;
use tabletsync::loader::SnapshotLoader;
use tabletsync::loader::StorageEnv;
use tabletsync::progress::Coordinator;
use tabletsync::progress::ProgressReport;
use tabletsync::progress::ReportStatus;
use tabletsync::remote_fs::NetworkAddress;
use tabletsync::remote_fs::RemoteBackendKind;
use tabletsync::remote_fs::RemoteFileInfo;
use tabletsync::remote_fs::RemoteFileSystem;
use tabletsync::remote_fs::RemoteFsFactory;
use tabletsync::result::Result;
use tabletsync::tablet::DataDir;
use tabletsync::tablet::SnapshotManager;
use tabletsync::tablet::Tablet;
use tabletsync::tablet::TabletManager;

/// A remote filesystem backed by a local directory; remote paths are
/// interpreted relative to `root`.  Every operation is recorded so tests
/// can assert on transfer counts and commit sequences.
#[derive(Debug)]
pub struct DirRemoteFs {
    root: PathBuf,
    kind: RemoteBackendKind,
    pub uploads: Mutex<Vec<String>>,
    pub downloads: Mutex<Vec<String>>,
    pub renames: Mutex<Vec<(String, String)>>,
    pub lists: Mutex<Vec<String>>,
}

impl DirRemoteFs {
    pub fn new(root: PathBuf, kind: RemoteBackendKind) -> Arc<DirRemoteFs> {
        Arc::new(DirRemoteFs {
            root,
            kind,
            uploads: Default::default(),
            downloads: Default::default(),
            renames: Default::default(),
            lists: Default::default(),
        })
    }

    pub fn object_path(&self, remote: &str) -> PathBuf {
        self.root.join(remote)
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }

    pub fn download_count(&self) -> usize {
        self.downloads.lock().unwrap().len()
    }
}

impl RemoteFileSystem for DirRemoteFs {
    fn kind(&self) -> RemoteBackendKind {
        self.kind
    }

    fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        self.uploads.lock().unwrap().push(remote.to_owned());

        let target = self.object_path(remote);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| chain_error!(e, "fake remote mkdir failed"))?;
        }
        std::fs::copy(local, &target).map_err(|e| chain_error!(e, "fake remote upload failed"))?;
        Ok(())
    }

    fn download(&self, remote: &str, local: &Path) -> Result<()> {
        self.downloads.lock().unwrap().push(remote.to_owned());

        std::fs::copy(self.object_path(remote), local)
            .map_err(|e| chain_error!(e, "fake remote download failed"))?;
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.renames
            .lock()
            .unwrap()
            .push((from.to_owned(), to.to_owned()));

        std::fs::rename(self.object_path(from), self.object_path(to))
            .map_err(|e| chain_error!(e, "fake remote rename failed"))?;
        Ok(())
    }

    fn list(&self, dir: &str) -> Result<Vec<RemoteFileInfo>> {
        self.lists.lock().unwrap().push(dir.to_owned());

        let path = self.object_path(dir);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        let entries =
            std::fs::read_dir(&path).map_err(|e| chain_error!(e, "fake remote list failed"))?;
        for entry in entries {
            let entry = entry.map_err(|e| chain_error!(e, "fake remote list failed"))?;
            let meta = entry
                .metadata()
                .map_err(|e| chain_error!(e, "fake remote stat failed"))?;
            if !meta.is_file() {
                continue;
            }
            out.push(RemoteFileInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: meta.len(),
            });
        }
        Ok(out)
    }
}

/// Hands out one fixed remote filesystem regardless of kind/location.
pub struct FixedFactory(pub Arc<dyn RemoteFileSystem>);

impl RemoteFsFactory for FixedFactory {
    fn create(
        &self,
        _kind: RemoteBackendKind,
        _location: &str,
        _broker_addr: Option<&NetworkAddress>,
        _props: &HashMap<String, String>,
    ) -> Result<Arc<dyn RemoteFileSystem>> {
        Ok(self.0.clone())
    }
}

/// Records every report and answers from a scripted queue (`Ok` once the
/// queue runs dry).
#[derive(Default)]
pub struct FakeCoordinator {
    pub responses: Mutex<VecDeque<ReportStatus>>,
    pub reports: Mutex<Vec<ProgressReport>>,
}

impl FakeCoordinator {
    pub fn cancelling() -> FakeCoordinator {
        let coordinator = FakeCoordinator::default();
        coordinator
            .responses
            .lock()
            .unwrap()
            .push_back(ReportStatus::Cancelled);
        coordinator
    }

    pub fn report_count(&self) -> usize {
        self.reports.lock().unwrap().len()
    }
}

impl Coordinator for FakeCoordinator {
    fn report(&self, report: &ProgressReport) -> Result<ReportStatus> {
        self.reports.lock().unwrap().push(report.clone());
        Ok(self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ReportStatus::Ok))
    }
}

pub struct FakeDataDir {
    path: PathBuf,
    capacity_left: Option<u64>,
}

impl FakeDataDir {
    pub fn new(path: PathBuf) -> FakeDataDir {
        FakeDataDir {
            path,
            capacity_left: None,
        }
    }

    pub fn with_capacity(path: PathBuf, capacity_left: u64) -> FakeDataDir {
        FakeDataDir {
            path,
            capacity_left: Some(capacity_left),
        }
    }
}

impl DataDir for FakeDataDir {
    fn path(&self) -> &Path {
        &self.path
    }

    fn reach_capacity_limit(&self, incoming_bytes: u64) -> bool {
        match self.capacity_left {
            Some(left) => incoming_bytes > left,
            None => false,
        }
    }
}

#[derive(Default)]
pub struct LockSet {
    pub migration: std::sync::Mutex<()>,
    pub base_compaction: std::sync::Mutex<()>,
    pub cumulative_compaction: std::sync::Mutex<()>,
    pub cold_compaction: std::sync::Mutex<()>,
    pub build_inverted_index: std::sync::Mutex<()>,
    pub meta_store: std::sync::Mutex<()>,
}

pub struct FakeTablet {
    tablet_id: i64,
    path: PathBuf,
    data_dir: Arc<FakeDataDir>,
    pub locks: LockSet,
}

impl FakeTablet {
    pub fn new(tablet_id: i64, path: PathBuf, data_dir: Arc<FakeDataDir>) -> Arc<FakeTablet> {
        Arc::new(FakeTablet {
            tablet_id,
            path,
            data_dir,
            locks: Default::default(),
        })
    }
}

impl Tablet for FakeTablet {
    fn tablet_id(&self) -> i64 {
        self.tablet_id
    }

    fn replica_id(&self) -> i64 {
        self.tablet_id + 1
    }

    fn table_id(&self) -> i64 {
        self.tablet_id + 2
    }

    fn partition_id(&self) -> i64 {
        self.tablet_id + 3
    }

    fn tablet_path(&self) -> &Path {
        &self.path
    }

    fn data_dir(&self) -> Arc<dyn DataDir> {
        self.data_dir.clone()
    }

    fn migration_lock(&self) -> &std::sync::Mutex<()> {
        &self.locks.migration
    }

    fn base_compaction_lock(&self) -> &std::sync::Mutex<()> {
        &self.locks.base_compaction
    }

    fn cumulative_compaction_lock(&self) -> &std::sync::Mutex<()> {
        &self.locks.cumulative_compaction
    }

    fn cold_compaction_lock(&self) -> &std::sync::Mutex<()> {
        &self.locks.cold_compaction
    }

    fn build_inverted_index_lock(&self) -> &std::sync::Mutex<()> {
        &self.locks.build_inverted_index
    }

    fn meta_store_lock(&self) -> &std::sync::Mutex<()> {
        &self.locks.meta_store
    }
}

#[derive(Default)]
pub struct FakeTabletManager {
    tablets: Mutex<HashMap<i64, Arc<FakeTablet>>>,
    pub loads: Mutex<Vec<(i64, PathBuf)>>,
}

impl FakeTabletManager {
    pub fn register(&self, tablet: Arc<FakeTablet>) {
        self.tablets
            .lock()
            .unwrap()
            .insert(tablet.tablet_id(), tablet);
    }

    pub fn load_count(&self) -> usize {
        self.loads.lock().unwrap().len()
    }
}

impl TabletManager for FakeTabletManager {
    fn get_tablet(&self, tablet_id: i64) -> Option<Arc<dyn Tablet>> {
        self.tablets
            .lock()
            .unwrap()
            .get(&tablet_id)
            .map(|tablet| tablet.clone() as Arc<dyn Tablet>)
    }

    fn load_tablet_from_dir(
        &self,
        _store: &dyn DataDir,
        tablet_id: i64,
        _schema_hash: i32,
        tablet_path: &Path,
        _force: bool,
    ) -> Result<()> {
        self.loads
            .lock()
            .unwrap()
            .push((tablet_id, tablet_path.to_path_buf()));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeSnapshotManager {
    pub conversions: Mutex<Vec<PathBuf>>,
}

impl SnapshotManager for FakeSnapshotManager {
    fn convert_rowset_ids(
        &self,
        snapshot_path: &Path,
        _tablet_id: i64,
        _replica_id: i64,
        _table_id: i64,
        _partition_id: i64,
        _schema_hash: i32,
    ) -> Result<()> {
        self.conversions
            .lock()
            .unwrap()
            .push(snapshot_path.to_path_buf());
        Ok(())
    }
}

/// One fully wired transfer environment plus handles onto its fakes.
pub struct Harness {
    pub env: Arc<StorageEnv>,
    pub remote: Arc<DirRemoteFs>,
    pub coordinator: Arc<FakeCoordinator>,
    pub tablet_manager: Arc<FakeTabletManager>,
    pub snapshot_manager: Arc<FakeSnapshotManager>,
}

impl Harness {
    pub fn new(remote: Arc<DirRemoteFs>) -> Harness {
        Harness::with_coordinator(remote, FakeCoordinator::default())
    }

    pub fn with_coordinator(remote: Arc<DirRemoteFs>, coordinator: FakeCoordinator) -> Harness {
        let coordinator = Arc::new(coordinator);
        let tablet_manager = Arc::new(FakeTabletManager::default());
        let snapshot_manager = Arc::new(FakeSnapshotManager::default());

        let env = Arc::new(StorageEnv {
            tablet_manager: tablet_manager.clone(),
            snapshot_manager: snapshot_manager.clone(),
            coordinator: coordinator.clone(),
            remote_fs_factory: Arc::new(FixedFactory(remote.clone())),
            config: TransferConfig::default(),
        });

        Harness {
            env,
            remote,
            coordinator,
            tablet_manager,
            snapshot_manager,
        }
    }

    /// A loader for job 7 / task 8, not yet `init`-ed.
    pub fn loader(&self) -> SnapshotLoader {
        SnapshotLoader::new(self.env.clone(), 7, 8, None, HashMap::new())
    }
}
