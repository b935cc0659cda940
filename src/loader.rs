//! The snapshot transfer engine.
//!
//! A `SnapshotLoader` is built for one job and then used for exactly one
//! of its four operations:
//!
//! - `upload`: push local tablet snapshots to a remote backend under
//!   content-addressed names (`<basename>.<hex_md5>`), skipping files the
//!   remote catalog already holds with the same checksum.  Uploads are
//!   idempotent and crash-restartable: re-running a partially uploaded job
//!   only transfers what is missing or mismatched.
//! - `download`: mirror remote catalogs into local snapshot directories,
//!   verifying checksums and pruning local files absent from the remote.
//! - `remote_http_download`: clone snapshots straight from a peer node
//!   over its HTTP download API (listing + HEAD + GET), with size/md5
//!   verification and a pacing-derived per-file timeout.
//! - `install`: replace a live tablet directory's contents with a local
//!   snapshot via hard links, under the tablet's full lock set.
//!
//! Each operation periodically reports progress to the coordinator and
//! unwinds with `Cancelled` when told to stop.  All work is synchronous on
//! the calling thread; concurrent jobs touching the same local snapshot
//! path serialize through the `LocalSnapshotLock` registry.
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use tracing::instrument;

use crate::catalog::list_with_checksum;
use crate::chain_error;
use crate::chain_info;
use crate::chain_warn;
use crate::config::TransferConfig;
use crate::drop_result;
use crate::fresh_error;
use crate::fresh_warn;
use crate::http_client::download_url;
use crate::http_client::HttpClient;
use crate::local_fs;
use crate::name_schema::replace_tablet_id;
use crate::name_schema::tablet_id_and_schema_hash_from_path;
use crate::name_schema::tablet_id_from_remote_path;
use crate::name_schema::HEADER_SUFFIX;
use crate::progress::Coordinator;
use crate::progress::ProgressReport;
use crate::progress::ReportStatus;
use crate::progress::TaskKind;
use crate::remote_fs::upload_with_checksum;
use crate::remote_fs::NetworkAddress;
use crate::remote_fs::RemoteBackendKind;
use crate::remote_fs::RemoteFileSystem;
use crate::remote_fs::RemoteFsFactory;
use crate::result::ErrorKind;
use crate::result::Result;
use crate::snapshot_lock::LocalSnapshotLock;
use crate::tablet::try_lock_tablet;
use crate::tablet::SnapshotManager;
use crate::tablet::Tablet;
use crate::tablet::TabletManager;

/// Timeout for listing a remote snapshot directory over HTTP.
const LIST_REMOTE_FILE_TIMEOUT: Duration = Duration::from_secs(15);

/// Timeout for a HEAD probing one remote file's length and md5.
const GET_LENGTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Attempts per HTTP exchange.
const DOWNLOAD_FILE_MAX_RETRY: u32 = 3;

/// Base sleep between HTTP retry attempts, in seconds.
const RETRY_BASE_INTERVAL_SECS: u64 = 1;

/// Report to the coordinator every this many files inside inner loops.
const REPORT_EVERY_N_FILES: i32 = 10;

/// The storage-node services a transfer job runs against.
pub struct StorageEnv {
    pub tablet_manager: Arc<dyn TabletManager>,
    pub snapshot_manager: Arc<dyn SnapshotManager>,
    pub coordinator: Arc<dyn Coordinator>,
    pub remote_fs_factory: Arc<dyn RemoteFsFactory>,
    pub config: TransferConfig,
}

/// One peer-held snapshot to clone over HTTP.
#[derive(Clone, Debug)]
pub struct RemoteTabletSnapshot {
    pub local_tablet_id: i64,
    pub remote_tablet_id: i64,
    /// Local snapshot directory the clone lands in; must already exist.
    pub local_snapshot_path: String,
    /// Absolute snapshot directory on the peer.
    pub remote_snapshot_path: String,
    /// The peer's download token.
    pub remote_token: String,
    pub remote_addr: NetworkAddress,
}

/// One remote file as advertised by a peer's HEAD response.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteHttpFileStat {
    pub url: String,
    /// Empty when the peer predates md5 advertisement.
    pub md5: String,
    pub size: u64,
}

/// Size and checksum of one local file, tracked across a peer clone.
#[derive(Clone, Debug)]
struct LocalFileStat {
    size: u64,
    md5: String,
}

/// A single transfer job.  Constructed per job, `init`-ed once for
/// backend-based transfers, used for one operation, then discarded.
pub struct SnapshotLoader {
    env: Arc<StorageEnv>,
    job_id: i64,
    task_id: i64,
    broker_addr: Option<NetworkAddress>,
    props: HashMap<String, String>,
    remote_fs: Option<Arc<dyn RemoteFileSystem>>,
}

impl SnapshotLoader {
    pub fn new(
        env: Arc<StorageEnv>,
        job_id: i64,
        task_id: i64,
        broker_addr: Option<NetworkAddress>,
        props: HashMap<String, String>,
    ) -> SnapshotLoader {
        SnapshotLoader {
            env,
            job_id,
            task_id,
            broker_addr,
            props,
            remote_fs: None,
        }
    }

    /// Builds the remote filesystem handle for `kind` rooted at
    /// `location`.  Required before `upload` / `download`; the HTTP and
    /// install paths don't use a backend.
    pub fn init(&mut self, kind: RemoteBackendKind, location: &str) -> Result<()> {
        let fs = self
            .env
            .remote_fs_factory
            .create(kind, location, self.broker_addr.as_ref(), &self.props)
            .map_err(|e| chain_error!(e, "failed to create remote filesystem", ?kind, %location))?;
        self.remote_fs = Some(fs);
        Ok(())
    }

    fn remote_fs(&self) -> Result<&dyn RemoteFileSystem> {
        match &self.remote_fs {
            Some(fs) => Ok(fs.as_ref()),
            None => Err(fresh_error!("storage backend not initialized")
                .with_kind(ErrorKind::NotInitialised)),
        }
    }

    /// Uploads each `local snapshot dir → remote dir` entry of the job.
    ///
    /// Returns, per tablet id, the content-addressed names
    /// (`<basename>.<md5>`) of every file of that tablet, uploaded or
    /// skipped: the tablet's committed remote catalog.
    #[instrument(skip_all, fields(job_id = self.job_id, task_id = self.task_id))]
    pub fn upload(
        &self,
        src_to_dest_path: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<i64, Vec<String>>> {
        let fs = self.remote_fs()?;
        tracing::info!(
            num = src_to_dest_path.len(),
            broker_addr = ?self.broker_addr,
            "begin to upload snapshot files"
        );

        // Surface a cancellation that predates the job.
        let mut tmp_counter = 0;
        self.report_every(0, &mut tmp_counter, 0, 0, TaskKind::Upload)?;

        self.check_local_snapshot_paths(src_to_dest_path.keys())?;

        let mut report_counter = 0;
        let total_num = src_to_dest_path.len() as i32;
        let mut finished_num = 0;
        let mut tablet_files = BTreeMap::new();
        for (src_path, dest_path) in src_to_dest_path {
            let _guard = LocalSnapshotLock::instance().acquire(src_path.as_str());

            let (tablet_id, _schema_hash) = tablet_id_and_schema_hash_from_path(src_path)?;

            let remote_files = list_with_checksum(fs, dest_path)?;
            for (name, stat) in &remote_files {
                tracing::debug!(%name, md5 = %stat.md5, "remote file");
            }

            let local_files = local_fs::list_existing_files(Path::new(src_path))?;

            let mut local_files_with_checksum = Vec::new();
            for local_file in &local_files {
                self.report_every(
                    REPORT_EVERY_N_FILES,
                    &mut report_counter,
                    finished_num,
                    total_num,
                    TaskKind::Upload,
                )?;

                let local_path = Path::new(src_path).join(local_file);
                let md5sum = local_fs::md5sum(&local_path)?;
                local_files_with_checksum.push(format!("{}.{}", local_file, md5sum));

                let need_upload = match remote_files.get(local_file) {
                    Some(remote) if remote.md5 == md5sum => false,
                    Some(remote) => {
                        // Same name, different content: the stale object is
                        // left behind and superseded in the catalog.
                        tracing::warn!(
                            remote = %remote.name,
                            remote_md5 = %remote.md5,
                            local_md5 = %md5sum,
                            "remote file checksum is invalid"
                        );
                        true
                    }
                    None => true,
                };
                if !need_upload {
                    tracing::debug!(%local_file, "file exists in remote path, no need to upload");
                    continue;
                }

                let remote_path = format!("{}/{}", dest_path, local_file);
                upload_with_checksum(fs, &local_path, &remote_path, &md5sum)?;
            }

            tablet_files.insert(tablet_id, local_files_with_checksum);
            finished_num += 1;
            tracing::info!(%src_path, %dest_path, "finished to write tablet to remote");
        }

        tracing::info!("finished to upload snapshots");
        Ok(tablet_files)
    }

    /// Downloads each `remote dir → local snapshot dir` entry of the job,
    /// then prunes local files the remote catalog does not know.
    ///
    /// Returns the local tablet ids the job touched, whether or not any
    /// bytes moved for them.
    #[instrument(skip_all, fields(job_id = self.job_id, task_id = self.task_id))]
    pub fn download(&self, src_to_dest_path: &BTreeMap<String, String>) -> Result<Vec<i64>> {
        let fs = self.remote_fs()?;
        tracing::info!(
            num = src_to_dest_path.len(),
            broker_addr = ?self.broker_addr,
            "begin to download snapshot files"
        );

        // Surface a cancellation that predates the job.
        let mut tmp_counter = 0;
        self.report_every(0, &mut tmp_counter, 0, 0, TaskKind::Download)?;

        self.check_local_snapshot_paths(src_to_dest_path.values())?;

        let mut downloaded_tablet_ids = Vec::new();
        let mut report_counter = 0;
        let total_num = src_to_dest_path.len() as i32;
        let mut finished_num = 0;
        for (remote_path, local_path) in src_to_dest_path {
            let _guard = LocalSnapshotLock::instance().acquire(local_path.as_str());

            let (local_tablet_id, schema_hash) = tablet_id_and_schema_hash_from_path(local_path)?;
            downloaded_tablet_ids.push(local_tablet_id);

            let remote_tablet_id = tablet_id_from_remote_path(remote_path)?;
            tracing::debug!(
                local_tablet_id,
                schema_hash,
                remote_tablet_id,
                "resolved tablet ids"
            );

            let mut local_files = local_fs::list_existing_files(Path::new(local_path))?;

            let remote_files = list_with_checksum(fs, remote_path)?;
            if remote_files.is_empty() {
                return Err(fresh_warn!("get nothing from remote path", %remote_path)
                    .with_kind(ErrorKind::RemoteEmpty));
            }

            let tablet = self
                .env
                .tablet_manager
                .get_tablet(local_tablet_id)
                .ok_or_else(|| fresh_warn!("failed to get local tablet", local_tablet_id))?;
            let data_dir = tablet.data_dir();

            for (remote_file, stat) in &remote_files {
                self.report_every(
                    REPORT_EVERY_N_FILES,
                    &mut report_counter,
                    finished_num,
                    total_num,
                    TaskKind::Download,
                )?;

                let position = local_files.iter().position(|f| f == remote_file);
                let need_download = match position {
                    // Not local yet.
                    None => true,
                    // Header files are tiny and may carry rewritten ids.
                    Some(_) if remote_file.ends_with(HEADER_SUFFIX) => true,
                    Some(_) => {
                        match local_fs::md5sum(&Path::new(local_path).join(remote_file)) {
                            Err(e) => {
                                let _ = chain_warn!(
                                    e,
                                    "failed to get md5sum of local file; download it",
                                    %remote_file
                                );
                                true
                            }
                            Ok(local_md5sum) => local_md5sum != stat.md5,
                        }
                    }
                };
                if !need_download {
                    tracing::info!(
                        %remote_file,
                        "remote file already exists in local, no need to download"
                    );
                    continue;
                }

                if data_dir.reach_capacity_limit(stat.size) {
                    return Err(fresh_warn!(
                        "reach the capacity limit of path",
                        path = ?data_dir.path(),
                        file_size = stat.size
                    )
                    .with_kind(ErrorKind::ExceededLimit));
                }

                let full_remote_file = format!("{}/{}.{}", remote_path, remote_file, stat.md5);
                // The remote name carries the peer's tablet id.
                let local_file_name = replace_tablet_id(remote_file, local_tablet_id)?;
                let full_local_file = Path::new(local_path).join(&local_file_name);
                tracing::info!(
                    %full_remote_file,
                    ?full_local_file,
                    length = stat.size,
                    "begin to download"
                );

                // The stale copy rejoins the working set under its
                // rewritten name only once the download verifies.
                if let Some(position) = position {
                    local_files.remove(position);
                }
                fs.download(&full_remote_file, &full_local_file)?;

                let downloaded_md5sum = local_fs::md5sum(&full_local_file)?;
                if downloaded_md5sum != stat.md5 {
                    return Err(fresh_warn!(
                        "invalid md5 of downloaded file",
                        ?full_local_file,
                        expected = %stat.md5,
                        got = %downloaded_md5sum
                    )
                    .with_kind(ErrorKind::ChecksumMismatch));
                }

                local_files.push(local_file_name);
            }

            prune_local_orphans(
                Path::new(local_path),
                local_files.iter(),
                remote_tablet_id,
                |name| remote_files.contains_key(name),
            );

            finished_num += 1;
        }

        tracing::info!("finished to download snapshots");
        Ok(downloaded_tablet_ids)
    }

    /// Clones snapshots straight from peer nodes over their HTTP download
    /// API: list the remote directory, HEAD every file for its length and
    /// md5, GET what is missing or differs, then prune local orphans.
    ///
    /// Files that fail verification are left on disk; a re-run's size/md5
    /// mismatch re-fetches them.
    #[instrument(skip_all, fields(job_id = self.job_id, task_id = self.task_id))]
    pub fn remote_http_download(
        &self,
        remote_tablet_snapshots: &[RemoteTabletSnapshot],
    ) -> Result<Vec<i64>> {
        // Surface a cancellation that predates the job.
        let mut tmp_counter = 0;
        self.report_every(0, &mut tmp_counter, 0, 0, TaskKind::Download)?;

        let mut downloaded_tablet_ids = Vec::new();
        let mut report_counter = 0;
        let total_num = remote_tablet_snapshots.len() as i32;
        let mut finished_num = 0;
        for snapshot in remote_tablet_snapshots {
            let local_path = &snapshot.local_snapshot_path;
            let remote_path = &snapshot.remote_snapshot_path;
            tracing::info!(%local_path, %remote_path, "download snapshot via http");

            let _guard = LocalSnapshotLock::instance().acquire(local_path.as_str());

            if !local_fs::is_directory(Path::new(local_path)) {
                return Err(fresh_warn!(
                    "snapshot path is not directory or does not exist",
                    %local_path
                ));
            }

            // Catalog what we already have, with sizes and checksums.
            let mut local_files: HashMap<String, LocalFileStat> = HashMap::new();
            for local_file in local_fs::list_existing_files(Path::new(local_path))? {
                let local_file_path = Path::new(local_path).join(&local_file);
                let size = local_fs::file_size(&local_file_path)?;
                let md5 = local_fs::md5sum(&local_file_path)?;
                local_files.insert(local_file, LocalFileStat { size, md5 });
            }

            // List the peer's snapshot directory.
            let list_url = download_url(&snapshot.remote_addr, &snapshot.remote_token, remote_path);
            tracing::info!(%list_url, remote_addr = %snapshot.remote_addr, "list remote files");
            let mut file_list_body = String::new();
            HttpClient::execute_with_retry(
                DOWNLOAD_FILE_MAX_RETRY,
                RETRY_BASE_INTERVAL_SECS,
                |client| {
                    client.init(&list_url)?;
                    client.set_timeout(LIST_REMOTE_FILE_TIMEOUT);
                    file_list_body = client.execute()?;
                    Ok(())
                },
            )?;
            let filename_list: Vec<&str> = file_list_body
                .split('\n')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .collect();

            // HEAD every file for its advertised length and md5.
            let mut remote_files: HashMap<String, RemoteHttpFileStat> = HashMap::new();
            for filename in &filename_list {
                let file_url = format!(
                    "{}&channel=ingest_binlog",
                    download_url(
                        &snapshot.remote_addr,
                        &snapshot.remote_token,
                        &format!("{}/{}", remote_path, filename),
                    )
                );

                let mut file_size = 0;
                let mut file_md5 = String::new();
                HttpClient::execute_with_retry(
                    DOWNLOAD_FILE_MAX_RETRY,
                    RETRY_BASE_INTERVAL_SECS,
                    |client| {
                        let stat_url = format!("{}&acquire_md5=true", file_url);
                        client.init(&stat_url)?;
                        client.set_timeout(GET_LENGTH_TIMEOUT);
                        client.head()?;
                        file_size = client.get_content_length()?;
                        file_md5 = client.get_content_md5()?;
                        Ok(())
                    },
                )?;

                remote_files.insert(
                    (*filename).to_owned(),
                    RemoteHttpFileStat {
                        url: file_url,
                        md5: file_md5,
                        size: file_size,
                    },
                );
            }

            self.report_every(
                REPORT_EVERY_N_FILES,
                &mut report_counter,
                finished_num,
                total_num,
                TaskKind::Download,
            )?;

            // Decide what to fetch.
            let mut need_download_files = Vec::new();
            for filename in &filename_list {
                let remote_filestat = &remote_files[*filename];
                tracing::info!(
                    %filename,
                    size = remote_filestat.size,
                    md5 = %remote_filestat.md5,
                    "remote file"
                );

                let local_filestat = match local_files.get(*filename) {
                    None => {
                        need_download_files.push((*filename).to_owned());
                        continue;
                    }
                    Some(stat) => stat,
                };
                if filename.ends_with(HEADER_SUFFIX)
                    || local_filestat.size != remote_filestat.size
                    || local_filestat.md5 != remote_filestat.md5
                {
                    need_download_files.push((*filename).to_owned());
                    continue;
                }

                tracing::info!(%filename, "file already exists, skip download");
            }

            let tablet = self
                .env
                .tablet_manager
                .get_tablet(snapshot.local_tablet_id)
                .ok_or_else(|| {
                    fresh_warn!(
                        "failed to get local tablet",
                        local_tablet_id = snapshot.local_tablet_id
                    )
                })?;
            let data_dir = tablet.data_dir();

            let mut total_file_size = 0;
            let watch = Instant::now();
            for filename in &need_download_files {
                let remote_filestat = &remote_files[filename];
                let file_size = remote_filestat.size;

                if data_dir.reach_capacity_limit(file_size) {
                    return Err(fresh_warn!(
                        "reach the capacity limit of path",
                        path = ?data_dir.path(),
                        file_size
                    )
                    .with_kind(ErrorKind::ExceededLimit));
                }
                total_file_size += file_size;

                let estimate_timeout = self.env.config.estimated_download_timeout(file_size);
                let local_filename = replace_tablet_id(filename, snapshot.local_tablet_id)?;
                let local_file_path = Path::new(local_path).join(&local_filename);

                tracing::info!(
                    url = %remote_filestat.url,
                    ?local_file_path,
                    size = file_size,
                    timeout_secs = estimate_timeout,
                    "begin to download file"
                );

                let remote_file_url = &remote_filestat.url;
                let remote_file_md5 = &remote_filestat.md5;
                HttpClient::execute_with_retry(
                    DOWNLOAD_FILE_MAX_RETRY,
                    RETRY_BASE_INTERVAL_SECS,
                    |client| {
                        client.init(remote_file_url)?;
                        client.set_timeout(Duration::from_secs(estimate_timeout));
                        client.download(&local_file_path)?;

                        let local_file_size = local_fs::file_size(&local_file_path)?;
                        if local_file_size != file_size {
                            return Err(fresh_warn!(
                                "downloaded file size is not equal",
                                url = %remote_file_url,
                                expected = file_size,
                                got = local_file_size
                            )
                            .with_kind(ErrorKind::SizeMismatch));
                        }

                        // Old peers don't advertise a md5.
                        if !remote_file_md5.is_empty() {
                            let local_file_md5 = local_fs::md5sum(&local_file_path)?;
                            if &local_file_md5 != remote_file_md5 {
                                return Err(fresh_warn!(
                                    "downloaded file md5 is not equal",
                                    url = %remote_file_url,
                                    expected = %remote_file_md5,
                                    got = %local_file_md5
                                )
                                .with_kind(ErrorKind::ChecksumMismatch));
                            }
                        }

                        local_fs::set_owner_rw(&local_file_path)
                    },
                )?;

                local_files.insert(
                    filename.clone(),
                    LocalFileStat {
                        size: file_size,
                        md5: remote_filestat.md5.clone(),
                    },
                );
            }

            let elapsed_ms = watch.elapsed().as_millis() as u64;
            let copy_rate = if elapsed_ms > 0 {
                total_file_size as f64 / elapsed_ms as f64 / 1000.0
            } else {
                0.0
            };
            tracing::info!(
                remote_tablet_id = snapshot.remote_tablet_id,
                local_tablet_id = snapshot.local_tablet_id,
                total_file_size,
                elapsed_ms,
                copy_rate_mb_s = copy_rate,
                "succeed to copy remote tablet"
            );

            prune_local_orphans(
                Path::new(local_path),
                local_files.keys(),
                snapshot.remote_tablet_id,
                |name| remote_files.contains_key(name),
            );

            downloaded_tablet_ids.push(snapshot.local_tablet_id);
            finished_num += 1;
        }

        tracing::info!("finished to download snapshots");
        Ok(downloaded_tablet_ids)
    }

    /// Replaces the live tablet directory with `snapshot_path`'s contents
    /// via hard links, holding the tablet's full lock set.
    ///
    /// The tablet directory is destroyed before the links are created: a
    /// crash in between leaves an empty tablet that only a retried
    /// install (or a re-clone) repairs.  A link failure rolls the created
    /// links back, but cannot resurrect the old directory either.
    #[instrument(skip_all, fields(job_id = self.job_id, task_id = self.task_id))]
    pub fn install(&self, snapshot_path: &str, tablet: &dyn Tablet, overwrite: bool) -> Result<()> {
        let _guard = LocalSnapshotLock::instance().acquire(snapshot_path);

        let tablet_path = tablet.tablet_path();
        let data_dir = tablet.data_dir();
        tracing::info!(
            %snapshot_path,
            ?tablet_path,
            store = ?data_dir.path(),
            "begin to install snapshot"
        );

        let (snapshot_tablet_id, snapshot_schema_hash) =
            tablet_id_and_schema_hash_from_path(snapshot_path)?;

        let tablet_path_str = tablet_path.to_str().ok_or_else(|| {
            fresh_error!("non-utf8 tablet path", ?tablet_path).with_kind(ErrorKind::InvalidPath)
        })?;
        let (tablet_id, schema_hash) = tablet_id_and_schema_hash_from_path(tablet_path_str)?;

        if tablet_id != snapshot_tablet_id || schema_hash != snapshot_schema_hash {
            return Err(
                fresh_warn!("path does not match", %snapshot_path, ?tablet_path)
                    .with_kind(ErrorKind::InvalidPath),
            );
        }

        if !local_fs::is_directory(tablet_path) {
            return Err(fresh_warn!("tablet path does not exist", ?tablet_path));
        }
        if !local_fs::is_directory(Path::new(snapshot_path)) {
            return Err(fresh_warn!("snapshot path does not exist", %snapshot_path));
        }

        // Rewrite the rowset ids and tablet id embedded in the snapshot's
        // rowset metas, in place.
        self.env
            .snapshot_manager
            .convert_rowset_ids(
                Path::new(snapshot_path),
                tablet_id,
                tablet.replica_id(),
                tablet.table_id(),
                tablet.partition_id(),
                schema_hash,
            )
            .map_err(|e| {
                chain_error!(e, "failed to convert rowset ids in snapshot", %snapshot_path)
                    .with_kind(ErrorKind::Fatal)
            })?;

        if !overwrite {
            return Err(fresh_error!("only overwrite mode is supported").with_kind(ErrorKind::Fatal));
        }

        // Migration/clone/checkpoint/compaction may change or check the
        // tablet's files and meta; all of them must be excluded, and
        // blocking on any of their locks could deadlock against them.
        let _locks = try_lock_tablet(tablet)
            .map_err(|e| chain_warn!(e, "failed to install snapshot", %snapshot_path))?;

        let snapshot_files = local_fs::list_existing_files(Path::new(snapshot_path))?;

        std::fs::remove_dir_all(tablet_path)
            .map_err(|e| chain_error!(e, "failed to remove tablet path", ?tablet_path))?;
        std::fs::create_dir(tablet_path)
            .map_err(|e| chain_error!(e, "failed to re-create tablet path", ?tablet_path))?;

        link_snapshot_files(Path::new(snapshot_path), tablet_path, &snapshot_files)?;

        self.env
            .tablet_manager
            .load_tablet_from_dir(data_dir.as_ref(), tablet_id, schema_hash, tablet_path, true)
            .map_err(|e| chain_error!(e, "failed to reload header of tablet", tablet_id))?;
        tracing::info!(tablet_id, "finished to reload header of tablet");

        Ok(())
    }

    /// Verifies every local path of the job exists and is a directory
    /// before any transfer starts.
    fn check_local_snapshot_paths<'a>(
        &self,
        paths: impl ExactSizeIterator<Item = &'a String>,
    ) -> Result<()> {
        let num = paths.len();
        for path in paths {
            if !local_fs::is_directory(Path::new(path)) {
                return Err(fresh_warn!(
                    "snapshot path is not directory or does not exist",
                    %path
                ));
            }
        }

        tracing::info!(num, "all local snapshot paths are existing");
        Ok(())
    }

    /// Bumps `counter`; once it exceeds `threshold`, reports progress to
    /// the coordinator and honors a `Cancelled` verdict.
    ///
    /// Reporting is best-effort: transport failures are ignored and leave
    /// the counter as-is, so the next file retries the report.  Only a
    /// successful round-trip resets the counter, and only an explicit
    /// `Cancelled` status unwinds the job.
    fn report_every(
        &self,
        threshold: i32,
        counter: &mut i32,
        finished_num: i32,
        total_num: i32,
        kind: TaskKind,
    ) -> Result<()> {
        *counter += 1;
        if *counter <= threshold {
            return Ok(());
        }

        tracing::info!(
            job_id = self.job_id,
            task_id = self.task_id,
            finished_num,
            total_num,
            "report to coordinator"
        );

        let report = ProgressReport {
            job_id: self.job_id,
            task_id: self.task_id,
            kind,
            finished_num,
            total_num,
        };
        let status = match self.env.coordinator.report(&report) {
            Ok(status) => status,
            Err(e) => {
                // A flaky coordinator must not fake a cancellation.
                let _ = chain_info!(e, "progress report failed; ignoring");
                return Ok(());
            }
        };

        *counter = 0;
        if status == ReportStatus::Cancelled {
            tracing::info!(
                job_id = self.job_id,
                task_id = self.task_id,
                "job is cancelled"
            );
            return Err(fresh_warn!("job is cancelled").with_kind(ErrorKind::Cancelled));
        }
        Ok(())
    }
}

/// Deletes the local files whose tablet-id-normalised names are absent
/// from the remote catalog.
///
/// Local names carry the local tablet id while the catalog carries the
/// remote one, so each local name is rewritten into the catalog's
/// namespace before the membership test.  Files whose suffix the rewrite
/// does not understand are foreign: they are logged and kept, as are
/// files whose unlink fails.
fn prune_local_orphans<'a>(
    local_path: &Path,
    local_files: impl Iterator<Item = &'a String>,
    remote_tablet_id: i64,
    remote_has: impl Fn(&str) -> bool,
) {
    for local_file in local_files {
        let new_name = match replace_tablet_id(local_file, remote_tablet_id) {
            Ok(name) => name,
            Err(e) => {
                let _ = chain_warn!(
                    e,
                    "failed to replace tablet id; ignore unknown local file",
                    %local_file
                );
                continue;
            }
        };
        if remote_has(&new_name) {
            continue;
        }

        let full_local_file = local_path.join(local_file);
        tracing::info!(
            ?full_local_file,
            "delete local snapshot file, it does not exist in remote"
        );
        drop_result!(std::fs::remove_file(&full_local_file),
                     e => chain_warn!(e, "failed to delete unknown local file; ignore", ?full_local_file));
    }
}

/// Hard-links every snapshot file into the freshly emptied tablet
/// directory.  If any link fails, the links created so far are removed
/// before the error propagates.
fn link_snapshot_files(
    snapshot_path: &Path,
    tablet_path: &Path,
    snapshot_files: &[String],
) -> Result<()> {
    let mut linked_files: Vec<PathBuf> = Vec::new();
    for file in snapshot_files {
        let full_src_path = snapshot_path.join(file);
        let full_dest_path = tablet_path.join(file);

        if let Err(e) = std::fs::hard_link(&full_src_path, &full_dest_path) {
            for linked_file in &linked_files {
                drop_result!(std::fs::remove_file(linked_file),
                             e => chain_warn!(e, "failed to clean linked file", ?linked_file));
            }

            return Err(chain_error!(
                e,
                "failed to link snapshot file",
                ?full_src_path,
                ?full_dest_path
            )
            .with_kind(ErrorKind::Fatal));
        }

        tracing::debug!(?full_src_path, ?full_dest_path, "linked snapshot file");
        linked_files.push(full_dest_path);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A failed link removes the links already created (and nothing else).
    #[test]
    fn test_link_rollback_on_failure() {
        let snapshot = tempfile::tempdir().expect("tempdir should build");
        let tablet = tempfile::tempdir().expect("tempdir should build");
        std::fs::write(snapshot.path().join("10007.hdr"), b"header")
            .expect("write should succeed");

        // "10007_2_2_0_0.dat" is listed but missing on disk, so its link
        // fails after the header's already succeeded.
        let files = vec!["10007.hdr".to_owned(), "10007_2_2_0_0.dat".to_owned()];
        let err = link_snapshot_files(snapshot.path(), tablet.path(), &files).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);

        assert!(!tablet.path().join("10007.hdr").exists());
        // The snapshot's own copy is untouched.
        assert!(snapshot.path().join("10007.hdr").exists());
    }

    #[test]
    fn test_link_snapshot_files() {
        let snapshot = tempfile::tempdir().expect("tempdir should build");
        let tablet = tempfile::tempdir().expect("tempdir should build");
        std::fs::write(snapshot.path().join("10007.hdr"), b"header")
            .expect("write should succeed");
        std::fs::write(snapshot.path().join("10007_2_2_0_0.dat"), b"segment")
            .expect("write should succeed");

        let files = vec!["10007.hdr".to_owned(), "10007_2_2_0_0.dat".to_owned()];
        link_snapshot_files(snapshot.path(), tablet.path(), &files)
            .expect("linking should succeed");

        assert_eq!(
            std::fs::read(tablet.path().join("10007.hdr")).expect("read should succeed"),
            b"header"
        );
        assert_eq!(
            std::fs::read(tablet.path().join("10007_2_2_0_0.dat")).expect("read should succeed"),
            b"segment"
        );
    }

    /// Foreign suffixes survive the prune; known names absent from the
    /// remote catalog do not.
    #[test]
    fn test_prune_local_orphans() {
        let dir = tempfile::tempdir().expect("tempdir should build");
        std::fs::write(dir.path().join("20015_9_9_0_0.dat"), b"keep")
            .expect("write should succeed");
        std::fs::write(dir.path().join("stale_1_1_0_0.dat"), b"drop")
            .expect("write should succeed");
        std::fs::write(dir.path().join("foreign.tmp"), b"keep").expect("write should succeed");

        let local_files = vec![
            "20015_9_9_0_0.dat".to_owned(),
            "stale_1_1_0_0.dat".to_owned(),
            "foreign.tmp".to_owned(),
        ];
        prune_local_orphans(dir.path(), local_files.iter(), 99935, |name| {
            name == "20015_9_9_0_0.dat"
        });

        assert!(dir.path().join("20015_9_9_0_0.dat").exists());
        assert!(!dir.path().join("stale_1_1_0_0.dat").exists());
        assert!(dir.path().join("foreign.tmp").exists());
    }
}
